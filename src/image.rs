//! Image construction.
//!
//! Orchestrates the pipeline: parse the kernel ELF, lay out its sections
//! after the reserved header region, resolve symbols into image
//! coordinates, validate and pre-apply relocations (collecting the
//! loader-time fixups), verify the entrypoint, and append the packed
//! module section. The result is an immutable description that the PE
//! writer turns into bytes; section contents are re-read and re-relocated
//! lazily during emission so that at most one section's data is resident
//! at a time.

use std::borrow::Cow;

use crate::arch::{self, Architecture};
use crate::basereloc::BaseReloc;
use crate::elf::{ElfObject, Symbol};
use crate::error::{Error, Result};
use crate::layout::{self, PlacedSection, VirtualSection, VirtualSectionKind};
use crate::modules::{Module, ModuleSection};
use crate::reloc::{self, SectionRelocations};
use crate::symbol::{self, SYMBOL_START};
use crate::utils::align_up;

/// A fully planned image, ready for emission.
pub struct Image<'data> {
    elf: ElfObject<'data>,
    arch: &'static dyn Architecture,
    header_size: u64,
    size: u64,
    entry_point: u32,
    symbols: Vec<Symbol<'data>>,
    virtual_sections: Vec<VirtualSection<'data>>,
    relocations: SectionRelocations,
    base_relocs: Vec<BaseReloc>,
    module_section: Option<ModuleSection>,
}

impl<'data> Image<'data> {
    /// Builds an image from a kernel ELF relocatable and an ordered module
    /// list. `alignment` must be a power of two; `header_size` is the
    /// number of bytes reserved in front of the first section for the DOS
    /// and PE headers.
    pub fn new(
        data: &'data [u8],
        modules: &[Module],
        header_size: u64,
        alignment: u64,
    ) -> Result<Self> {
        let elf = ElfObject::parse(data)?;
        let arch = arch::for_elf_machine(elf.machine())
            .ok_or(Error::UnsupportedMachine(elf.machine()))?;

        let virtual_sections = layout::plan(elf.sections(), header_size, alignment);
        let symbols = symbol::resolve(elf.symbols(), &virtual_sections)?;
        let relocations = SectionRelocations::collect(&elf, arch, &virtual_sections, &symbols)?;

        // Apply every relocation once up front. This validates offsets and
        // produces the base-relocation list; the rewritten bytes are
        // dropped and recomputed at emission time, trading a second read
        // for a bounded peak memory footprint.
        let mut base_relocs = Vec::new();
        for virt in &virtual_sections {
            for placed in &virt.sections {
                if placed.section.is_nobits() {
                    continue;
                }
                let attached = relocations.for_section(placed.section.index);
                if attached.is_empty() {
                    continue;
                }
                let (_, mut unresolved) = reloc::relocated_data(&elf, arch, placed, attached)?;
                base_relocs.append(&mut unresolved);
            }
        }

        let entry_point = symbols
            .iter()
            .find(|s| s.name == SYMBOL_START)
            .map(|s| s.value as u32)
            .ok_or(Error::NoEntrypoint)?;

        let end = virtual_sections
            .last()
            .map(VirtualSection::end)
            .unwrap_or(header_size);
        let mut size = align_up(end, alignment);

        let module_section = if modules.is_empty() {
            None
        } else {
            let section = ModuleSection::new(modules, size, alignment)?;
            size = align_up(size + section.virtual_size(), alignment);
            Some(section)
        };

        Ok(Self {
            elf,
            arch,
            header_size,
            size,
            entry_point,
            symbols,
            virtual_sections,
            relocations,
            base_relocs,
            module_section,
        })
    }

    /// Image address of the `_start` symbol.
    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// Image address where code begins (the TEXT section).
    pub fn base_of_code(&self) -> u32 {
        self.virtual_sections
            .iter()
            .find(|v| v.kind == VirtualSectionKind::Text)
            .map(|v| v.offset as u32)
            .unwrap_or(self.header_size as u32)
    }

    /// PE machine type of the target.
    pub fn machine(&self) -> u16 {
        self.arch.pe_machine()
    }

    /// Total size of the image: headers, sections, and modules, aligned to
    /// the page boundary. The base-relocation section is not included; the
    /// writer appends it.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn symbols(&self) -> &[Symbol<'data>] {
        &self.symbols
    }

    pub fn virtual_sections(&self) -> &[VirtualSection<'data>] {
        &self.virtual_sections
    }

    pub fn module_section(&self) -> Option<&ModuleSection> {
        self.module_section.as_ref()
    }

    /// Address fixups the PE loader must apply if it rebases the image.
    pub fn base_relocs(&self) -> &[BaseReloc] {
        &self.base_relocs
    }

    /// The bytes of one placed section as they appear in the output:
    /// original contents with relocations applied. Borrows straight from
    /// the ELF source when the section has no relocations.
    pub fn placed_section_data(&self, placed: &PlacedSection<'data>) -> Result<Cow<'data, [u8]>> {
        let attached = self.relocations.for_section(placed.section.index);
        if attached.is_empty() {
            return Ok(Cow::Borrowed(self.elf.section_data(&placed.section)?));
        }

        let (data, _) = reloc::relocated_data(&self.elf, self.arch, placed, attached)?;
        Ok(Cow::Owned(data))
    }
}
