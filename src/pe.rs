//! PE32+ writer.
//!
//! Emits a UEFI application image: MS-DOS header and stub, PE signature,
//! COFF file header, PE32+ optional header with 16 data directories,
//! section table, and the section data itself, zero-padded to the page
//! alignment at every boundary. Absolute fixups collected during
//! relocation become a trailing `.reloc` section advertised through the
//! BASERELOC data directory.

use std::io::Write;
use std::mem;

use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::{pe, LittleEndian as LE};
use tracing::debug;

use crate::basereloc::RelocSection;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layout::{VirtualSection, VirtualSectionKind};
use crate::modules::{ModuleSection, SECTION_MODS};
use crate::utils::align_up;

/// Sections are aligned in memory and in the file to the UEFI page size.
pub const UEFI_PAGE_SIZE: u64 = 4096;

/// Space reserved at the front of the image for everything before the
/// first section. The worst case (DOS image, PE signature, file header,
/// optional header, and four section entries) fits comfortably in one
/// page.
pub const TOTAL_HEADER_SIZE: u64 = UEFI_PAGE_SIZE;

const SECTION_RELOC: &str = ".reloc";

/// Number of optional-header data directories, per the Microsoft spec.
const NUM_DATA_DIRECTORIES: usize = 16;

/// The DOS header is 4 paragraphs of 16 bytes.
const DOS_HEADER_PARAGRAPHS: u16 = 4;

const DOS_PAGE_SIZE: usize = 512;

// x86 real-mode program that prints "This program cannot be run in DOS
// mode." and exits.
const DOS_STUB: [u8; 64] = [
    0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21, 0x54, 0x68,
    0x69, 0x73, 0x20, 0x70, 0x72, 0x6F, 0x67, 0x72, 0x61, 0x6D, 0x20, 0x63, 0x61, 0x6E, 0x6E, 0x6F,
    0x74, 0x20, 0x62, 0x65, 0x20, 0x72, 0x75, 0x6E, 0x20, 0x69, 0x6E, 0x20, 0x44, 0x4F, 0x53, 0x20,
    0x6D, 0x6F, 0x64, 0x65, 0x2E, 0x0D, 0x0D, 0x0A, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

fn u16(v: u16) -> U16<LE> {
    U16::new(LE, v)
}
fn u32(v: u32) -> U32<LE> {
    U32::new(LE, v)
}
fn u64(v: u64) -> U64<LE> {
    U64::new(LE, v)
}

/// Boot application filename that UEFI firmware loads automatically for
/// each PE machine type; used as the default output name.
pub fn image_file_name(machine: u16) -> Option<&'static str> {
    match machine {
        pe::IMAGE_FILE_MACHINE_AMD64 => Some("BOOTx64.EFI"),
        pe::IMAGE_FILE_MACHINE_I386 => Some("BOOTA32.EFI"),
        pe::IMAGE_FILE_MACHINE_ARM64 => Some("BOOTAA64.EFI"),
        pe::IMAGE_FILE_MACHINE_ARM => Some("BOOTARM.EFI"),
        _ => None,
    }
}

/// A section of the output image. Closed set: the two virtual sections
/// from the layout, the packed module section, and the base-relocation
/// section.
enum Section<'a> {
    Virtual(&'a VirtualSection<'a>),
    Modules(&'a ModuleSection),
    Reloc(&'a RelocSection),
}

impl Section<'_> {
    fn offset(&self) -> u64 {
        match self {
            Section::Virtual(v) => v.offset,
            Section::Modules(m) => m.offset(),
            Section::Reloc(r) => r.offset(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Section::Virtual(v) => v.size,
            Section::Modules(m) => m.virtual_size(),
            Section::Reloc(r) => r.size(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Section::Virtual(v) => v.kind.name(),
            Section::Modules(_) => SECTION_MODS,
            Section::Reloc(_) => SECTION_RELOC,
        }
    }

    fn characteristics(&self) -> u32 {
        match self {
            Section::Virtual(v) => v.kind.characteristics(),
            Section::Modules(_) => ModuleSection::characteristics(),
            Section::Reloc(_) => {
                pe::IMAGE_SCN_CNT_INITIALIZED_DATA
                    | pe::IMAGE_SCN_MEM_DISCARDABLE
                    | pe::IMAGE_SCN_MEM_READ
            }
        }
    }

    fn header(&self) -> pe::ImageSectionHeader {
        pe::ImageSectionHeader {
            name: section_name(self.name()),
            virtual_size: u32(self.size() as u32),
            virtual_address: u32(self.offset() as u32),
            size_of_raw_data: u32(self.size() as u32),
            pointer_to_raw_data: u32(self.offset() as u32),
            // Always zero for executables
            pointer_to_relocations: u32(0),
            // COFF line numbers are deprecated
            pointer_to_linenumbers: u32(0),
            number_of_relocations: u16(0),
            number_of_linenumbers: u16(0),
            characteristics: u32(self.characteristics()),
        }
    }
}

/// Writes `image` as a PE32+ UEFI application to `sink`, returning the
/// number of bytes written. Nothing is buffered beyond one section's data.
pub fn write<W: Write>(image: &Image<'_>, sink: W) -> Result<u64> {
    let mut out = CountingWriter::new(sink);

    let mut sections: Vec<Section<'_>> = image
        .virtual_sections()
        .iter()
        .filter(|v| v.size > 0)
        .map(Section::Virtual)
        .collect();
    if let Some(mods) = image.module_section() {
        sections.push(Section::Modules(mods));
    }

    let size_of_code = sections
        .iter()
        .find_map(|s| match s {
            Section::Virtual(v) if v.kind == VirtualSectionKind::Text => Some(v.size),
            _ => None,
        })
        .unwrap_or(0);
    let size_of_initialized_data: u64 = sections
        .iter()
        .filter(|s| s.characteristics() & pe::IMAGE_SCN_CNT_INITIALIZED_DATA != 0)
        .map(Section::size)
        .sum();

    // The base-relocation section sits after everything else and grows the
    // image beyond what the layout itself accounts for.
    let reloc_section = (!image.base_relocs().is_empty())
        .then(|| RelocSection::new(image.base_relocs(), image.size(), UEFI_PAGE_SIZE));

    let mut size_of_image = image.size();
    let mut basereloc_dir = None;
    if let Some(reloc) = &reloc_section {
        size_of_image += reloc.size();
        basereloc_dir = Some((reloc.offset() as u32, reloc.raw_size() as u32));
        sections.push(Section::Reloc(reloc));
    }

    write_dos_image(&mut out)?;

    out.write_all(&pe::IMAGE_NT_SIGNATURE.to_le_bytes())?;

    let file_header = pe::ImageFileHeader {
        machine: u16(image.machine()),
        number_of_sections: u16(sections.len() as u16),
        // Unimportant; don't bother setting
        time_date_stamp: u32(0),
        // Deprecated debugging info, must be zero for images
        pointer_to_symbol_table: u32(0),
        number_of_symbols: u32(0),
        size_of_optional_header: u16(
            (mem::size_of::<pe::ImageOptionalHeader64>()
                + NUM_DATA_DIRECTORIES * mem::size_of::<pe::ImageDataDirectory>())
                as u16,
        ),
        characteristics: u16(
            pe::IMAGE_FILE_EXECUTABLE_IMAGE
                | pe::IMAGE_FILE_LOCAL_SYMS_STRIPPED
                | pe::IMAGE_FILE_DEBUG_STRIPPED
                | pe::IMAGE_FILE_LINE_NUMS_STRIPPED,
        ),
    };
    out.write_all(bytes_of(&file_header))?;

    let optional_header = pe::ImageOptionalHeader64 {
        magic: u16(pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC),
        major_linker_version: 0,
        minor_linker_version: 0,
        size_of_code: u32(size_of_code as u32),
        size_of_initialized_data: u32(size_of_initialized_data as u32),
        // BSS lives inside the DATA section and is shipped as zeros
        size_of_uninitialized_data: u32(0),
        address_of_entry_point: u32(image.entry_point()),
        base_of_code: u32(image.base_of_code()),
        // No preference; the loader picks and fixes up via .reloc
        image_base: u64(0),
        section_alignment: u32(UEFI_PAGE_SIZE as u32),
        file_alignment: u32(UEFI_PAGE_SIZE as u32),
        major_operating_system_version: u16(0),
        minor_operating_system_version: u16(0),
        major_image_version: u16(0),
        minor_image_version: u16(0),
        major_subsystem_version: u16(0),
        minor_subsystem_version: u16(0),
        win32_version_value: u32(0),
        size_of_image: u32(size_of_image as u32),
        size_of_headers: u32(image.header_size() as u32),
        check_sum: u32(0),
        subsystem: u16(pe::IMAGE_SUBSYSTEM_EFI_APPLICATION),
        dll_characteristics: u16(0),
        // Same values GRUB uses
        size_of_stack_reserve: u64(65536),
        size_of_stack_commit: u64(65536),
        size_of_heap_reserve: u64(65536),
        size_of_heap_commit: u64(65536),
        loader_flags: u32(0),
        number_of_rva_and_sizes: u32(NUM_DATA_DIRECTORIES as u32),
    };
    out.write_all(bytes_of(&optional_header))?;

    for index in 0..NUM_DATA_DIRECTORIES {
        let directory = match basereloc_dir {
            Some((address, size)) if index == pe::IMAGE_DIRECTORY_ENTRY_BASERELOC => {
                pe::ImageDataDirectory {
                    virtual_address: u32(address),
                    size: u32(size),
                }
            }
            _ => pe::ImageDataDirectory {
                virtual_address: u32(0),
                size: u32(0),
            },
        };
        out.write_all(bytes_of(&directory))?;
    }

    for section in &sections {
        out.write_all(bytes_of(&section.header()))?;
    }

    for section in &sections {
        // Sections start on page boundaries; fill the gap with zeros.
        out.pad_to(section.offset())?;

        match section {
            Section::Virtual(virt) => write_virtual_section(image, virt, &mut out)?,
            Section::Modules(mods) => out.write_all(mods.data())?,
            Section::Reloc(reloc) => out.write_all(reloc.data())?,
        }

        debug!(
            "wrote PE image section '{}' ({} bytes)",
            section.name(),
            out.written() - section.offset()
        );
    }

    // Section contents may stop short of the page-aligned section end.
    if let Some(last) = sections.last() {
        out.pad_to(last.offset() + last.size())?;
    }

    out.flush()?;
    Ok(out.written())
}

fn write_dos_image<W: Write>(out: &mut CountingWriter<W>) -> Result<()> {
    let pe_header_start = align_up(DOS_STUB.len() as u64, 128);
    let stub_pages = DOS_STUB.len().div_ceil(DOS_PAGE_SIZE);

    let header = pe::ImageDosHeader {
        e_magic: u16(pe::IMAGE_DOS_SIGNATURE),
        e_cblp: u16((stub_pages * DOS_PAGE_SIZE - DOS_STUB.len()) as u16),
        e_cp: u16(stub_pages as u16),
        e_crlc: u16(0),
        e_cparhdr: u16(DOS_HEADER_PARAGRAPHS),
        // Most DOS programs require 10 paragraphs and request the maximum.
        e_minalloc: u16(10),
        e_maxalloc: u16(0xFFFF),
        e_ss: u16(0),
        e_sp: u16(256),
        e_csum: u16(0),
        e_ip: u16(0),
        e_cs: u16(0),
        // The (empty) relocation table sits right after this header.
        e_lfarlc: u16(64),
        e_ovno: u16(0),
        e_res: [u16(0); 4],
        e_oemid: u16(0),
        e_oeminfo: u16(0),
        e_res2: [u16(0); 10],
        e_lfanew: u32(pe_header_start as u32),
    };

    out.write_all(bytes_of(&header))?;
    out.write_all(&DOS_STUB)?;
    out.pad_to(pe_header_start)?;
    Ok(())
}

fn write_virtual_section<W: Write>(
    image: &Image<'_>,
    virt: &VirtualSection<'_>,
    out: &mut CountingWriter<W>,
) -> Result<()> {
    for placed in &virt.sections {
        // Alignment may leave gaps between members.
        out.pad_to(placed.addr_in_file)?;

        if placed.section.is_nobits() {
            out.write_zeros(placed.section.size)?;
        } else {
            let data = image.placed_section_data(placed)?;
            out.write_all(&data)?;
        }
    }

    Ok(())
}

/// Pads names to the fixed 8 bytes of a PE section entry.
fn section_name(name: &str) -> [u8; 8] {
    let mut padded = [0u8; 8];
    let len = name.len().min(8);
    padded[..len].copy_from_slice(&name.as_bytes()[..len]);
    padded
}

/// A write sink that tracks the current file offset, so padding can be
/// computed without seeking.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn write_zeros(&mut self, mut count: u64) -> std::io::Result<()> {
        const ZEROS: [u8; 4096] = [0; 4096];
        while count > 0 {
            let chunk = count.min(ZEROS.len() as u64) as usize;
            self.write_all(&ZEROS[..chunk])?;
            count -= chunk as u64;
        }
        Ok(())
    }

    /// Zero-fills up to an absolute file offset. Writing can only move
    /// forward; a target before the current position is an error.
    fn pad_to(&mut self, offset: u64) -> Result<()> {
        if offset < self.written {
            return Err(Error::SectionOffsetInvalid {
                offset,
                position: self.written,
            });
        }
        self.write_zeros(offset - self.written)?;
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
