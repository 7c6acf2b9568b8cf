//! Symbol resolution.
//!
//! Rewrites every symbol's value from section-relative coordinates into
//! addresses within the output image, using the layout produced by the
//! planner. Two undefined symbols are synthetic externs resolved here:
//! `__bss_start` (start of the first NOBITS section) and `end` (end of the
//! last virtual section). Any other undefined symbol is fatal: a
//! statically linked kernel must not have unresolved references.

use std::collections::HashMap;

use object::elf;
use tracing::debug;

use crate::elf::Symbol;
use crate::error::{Error, Result};
use crate::layout::VirtualSection;

/// Start of BSS; referenced by the kernel but defined by no object.
pub const SYMBOL_BSS_START: &str = "__bss_start";

/// End of the image; referenced by the kernel but defined by no object.
pub const SYMBOL_END: &str = "end";

/// The image entrypoint.
pub const SYMBOL_START: &str = "_start";

/// Produces a new symbol list whose values are addresses within the output
/// image. Indices are preserved, so relocation entries keep working.
pub fn resolve<'data>(
    symbols: &[Symbol<'data>],
    virtual_sections: &[VirtualSection<'data>],
) -> Result<Vec<Symbol<'data>>> {
    let mut addr_by_index = HashMap::new();
    // Zero doubles as "no BSS" here: the reserved header region means no
    // real section can ever be placed at address zero.
    let mut bss_start = 0u64;
    let mut end = 0u64;

    for virt in virtual_sections {
        for placed in &virt.sections {
            addr_by_index.insert(placed.section.index, placed.addr_in_file);

            if placed.section.is_nobits() && bss_start == 0 {
                bss_start = placed.addr_in_file;
            }
        }

        end = virt.end();
    }

    let mut resolved = Vec::with_capacity(symbols.len());

    for (index, symbol) in symbols.iter().enumerate() {
        let mut symbol = symbol.clone();

        if index == 0 {
            // The null symbol stays zero-valued so that relocation entries'
            // symbol indices keep lining up with the ELF convention.
            resolved.push(symbol);
            continue;
        }

        if symbol.shndx == elf::SHN_UNDEF {
            if symbol.name == SYMBOL_BSS_START {
                if bss_start == 0 {
                    return Err(Error::BssSymbolButNoBss);
                }
                symbol.value = bss_start;
            } else if symbol.name == SYMBOL_END {
                symbol.value = end;
            } else {
                return Err(Error::UnrecognizedUndefinedSymbol(symbol.name.to_string()));
            }
        } else if symbol.shndx == elf::SHN_ABS {
            // Absolute symbols need no adjustment.
        } else {
            let addr = addr_by_index.get(&usize::from(symbol.shndx)).ok_or_else(|| {
                Error::UnknownSectionIndex {
                    name: symbol.name.to_string(),
                    index: symbol.shndx,
                }
            })?;

            let old = symbol.value;
            symbol.value = addr + symbol.value;
            debug!(
                "relocating symbol '{}' (index {}) from {:#x} to {:#x}",
                symbol.name, index, old, symbol.value
            );
        }

        resolved.push(symbol);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Section;
    use crate::layout::{PlacedSection, VirtualSection, VirtualSectionKind};

    fn symbol(name: &'static str, value: u64, shndx: u16) -> Symbol<'static> {
        Symbol { name, value, shndx }
    }

    fn placed(index: usize, sh_type: u32, addr: u64, size: u64) -> PlacedSection<'static> {
        PlacedSection {
            section: Section {
                index,
                name: "",
                sh_type,
                flags: 0,
                addralign: 0,
                size,
                offset: 0,
                info: 0,
                link: 0,
            },
            addr_in_file: addr,
        }
    }

    fn layout_with_bss() -> Vec<VirtualSection<'static>> {
        vec![
            VirtualSection {
                kind: VirtualSectionKind::Text,
                offset: 4096,
                size: 4096,
                sections: vec![placed(1, object::elf::SHT_PROGBITS, 4096, 16)],
            },
            VirtualSection {
                kind: VirtualSectionKind::Data,
                offset: 8192,
                size: 4096,
                sections: vec![
                    placed(2, object::elf::SHT_PROGBITS, 8192, 32),
                    placed(3, object::elf::SHT_NOBITS, 8224, 64),
                ],
            },
        ]
    }

    #[test]
    fn section_relative_values_become_image_addresses() {
        let symbols = vec![
            symbol("", 0, 0),
            symbol("_start", 4, 1),
            symbol("table", 8, 2),
        ];

        let resolved = resolve(&symbols, &layout_with_bss()).unwrap();
        assert_eq!(resolved[1].value, 4100);
        assert_eq!(resolved[2].value, 8200);
    }

    #[test]
    fn synthetic_symbols_resolve_to_layout_boundaries() {
        let symbols = vec![
            symbol("", 0, 0),
            symbol("__bss_start", 0, elf::SHN_UNDEF),
            symbol("end", 0, elf::SHN_UNDEF),
        ];

        let resolved = resolve(&symbols, &layout_with_bss()).unwrap();
        assert_eq!(resolved[1].value, 8224);
        assert_eq!(resolved[2].value, 12288);
    }

    #[test]
    fn absolute_symbols_are_untouched() {
        let symbols = vec![symbol("", 0, 0), symbol("abs", 0xdead, elf::SHN_ABS)];
        let resolved = resolve(&symbols, &layout_with_bss()).unwrap();
        assert_eq!(resolved[1].value, 0xdead);
    }

    #[test]
    fn bss_symbol_without_bss_section_fails() {
        let mut layout = layout_with_bss();
        layout[1].sections.truncate(1);

        let symbols = vec![symbol("", 0, 0), symbol("__bss_start", 0, elf::SHN_UNDEF)];
        assert!(matches!(
            resolve(&symbols, &layout),
            Err(Error::BssSymbolButNoBss)
        ));
    }

    #[test]
    fn unknown_undefined_symbol_fails() {
        let symbols = vec![symbol("", 0, 0), symbol("_edata", 0, elf::SHN_UNDEF)];
        match resolve(&symbols, &layout_with_bss()) {
            Err(Error::UnrecognizedUndefinedSymbol(name)) => assert_eq!(name, "_edata"),
            other => panic!("expected UnrecognizedUndefinedSymbol, got {other:?}"),
        }
    }

    #[test]
    fn missing_section_index_fails() {
        let symbols = vec![symbol("", 0, 0), symbol("ghost", 0, 9)];
        assert!(matches!(
            resolve(&symbols, &layout_with_bss()),
            Err(Error::UnknownSectionIndex { index: 9, .. })
        ));
    }
}
