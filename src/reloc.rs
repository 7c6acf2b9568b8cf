//! Relocation processing.
//!
//! Walks every `REL`/`RELA` section of the input, attaches the decoded
//! entries to the kept section they target, and applies them to section
//! data buffers via the architecture backend. Absolute fixups additionally
//! produce [`BaseReloc`] records for the PE `.reloc` section.
//!
//! Entries are validated up front (symbol index, relocation type); the
//! bounds check happens at application time, when the operand width and the
//! target buffer are both at hand.

use std::collections::HashMap;

use object::elf;
use tracing::{debug, warn};

use crate::arch::Architecture;
use crate::basereloc::BaseReloc;
use crate::elf::{ElfObject, Symbol};
use crate::error::{Error, Result};
use crate::layout::{PlacedSection, VirtualSection};

/// A decoded relocation entry, attached to the section it patches.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub r_type: u32,
    pub addend: i64,
    /// Offset of the operand relative to the start of the target section.
    pub offset: u64,
    /// Address of the operand relative to the start of the image.
    pub file_offset: u64,
    /// Resolved value of the referenced symbol, in image coordinates.
    pub symbol_value: u64,
    pub symbol_index: u32,
}

/// Relocations grouped by the ELF index of the section they target.
#[derive(Default)]
pub struct SectionRelocations {
    by_section: HashMap<usize, Vec<Relocation>>,
}

impl SectionRelocations {
    /// Decodes and validates all relocation sections against the resolved
    /// symbol table. Relocation sections whose target was excluded from the
    /// layout are skipped.
    pub fn collect<'data>(
        elf: &ElfObject<'data>,
        arch: &dyn Architecture,
        virtual_sections: &[VirtualSection<'data>],
        symbols: &[Symbol<'data>],
    ) -> Result<Self> {
        let mut kept = HashMap::new();
        for virt in virtual_sections {
            for placed in &virt.sections {
                kept.insert(placed.section.index, placed.addr_in_file);
            }
        }

        let mut by_section: HashMap<usize, Vec<Relocation>> = HashMap::new();

        for section in elf.sections() {
            if section.sh_type != elf::SHT_REL && section.sh_type != elf::SHT_RELA {
                continue;
            }

            let target_index = section.info as usize;
            let Some(&target_addr) = kept.get(&target_index) else {
                warn!(
                    "skipping relocation section '{}' (references excluded section {})",
                    section.name, target_index
                );
                continue;
            };

            for entry in elf.relocation_entries(section)? {
                let symbol = symbols.get(entry.sym as usize).ok_or(Error::BadSymbolIndex {
                    index: entry.sym,
                    len: symbols.len(),
                })?;

                if arch.relocation_width(entry.r_type).is_none() {
                    return Err(Error::UnsupportedRelocation(entry.r_type));
                }

                by_section.entry(target_index).or_default().push(Relocation {
                    r_type: entry.r_type,
                    addend: entry.addend,
                    offset: entry.offset,
                    file_offset: target_addr + entry.offset,
                    symbol_value: symbol.value,
                    symbol_index: entry.sym,
                });
            }
        }

        Ok(Self { by_section })
    }

    pub fn for_section(&self, index: usize) -> &[Relocation] {
        self.by_section
            .get(&index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Applies `relocations` in place to a section's data buffer, returning the
/// loader-time fixups produced by absolute relocations.
pub fn apply(
    arch: &dyn Architecture,
    relocations: &[Relocation],
    data: &mut [u8],
) -> Result<Vec<BaseReloc>> {
    let mut unresolved = Vec::new();

    for relocation in relocations {
        let width = arch
            .relocation_width(relocation.r_type)
            .ok_or(Error::UnsupportedRelocation(relocation.r_type))?;

        let start = usize::try_from(relocation.offset).unwrap_or(usize::MAX);
        let end = start.checked_add(width).filter(|&end| end <= data.len());
        let Some(end) = end else {
            return Err(Error::RelocationOutOfBounds {
                offset: relocation.offset,
                width,
                size: data.len() as u64,
            });
        };

        debug!(
            "relocating entry of type {} at {:#x} (symbol {} = {:#x}, addend {:#x})",
            relocation.r_type,
            relocation.file_offset,
            relocation.symbol_index,
            relocation.symbol_value,
            relocation.addend
        );

        if let Some(kind) = arch.apply_relocation(relocation, &mut data[start..end])? {
            unresolved.push(BaseReloc {
                kind,
                file_offset: relocation.file_offset,
            });
        }
    }

    Ok(unresolved)
}

/// Materializes a placed section's bytes with all relocations applied.
/// The buffer lives only as long as the caller needs it; nothing is cached.
pub fn relocated_data<'data>(
    elf: &ElfObject<'data>,
    arch: &dyn Architecture,
    placed: &PlacedSection<'data>,
    relocations: &[Relocation],
) -> Result<(Vec<u8>, Vec<BaseReloc>)> {
    let mut data = elf.section_data(&placed.section)?.to_vec();
    let unresolved = apply(arch, relocations, &mut data)?;
    Ok((data, unresolved))
}
