//! ELF64 relocatable reader.
//!
//! Parses the little-endian ELF64 header, section table, and symbol table
//! out of a random-access byte source (in practice a memory map that stays
//! alive until emission finishes; section contents are sliced lazily).
//! Relocation sections are decoded on demand into [`RelocEntry`] records.

use std::mem;

use object::elf;
use object::pod;
use object::LittleEndian as LE;

use crate::error::{Error, Result};

/// A section of the input ELF, with the handful of header fields the image
/// pipeline cares about already extracted.
#[derive(Debug, Clone)]
pub struct Section<'data> {
    /// Index of the section as it appears in the ELF section table.
    pub index: usize,
    pub name: &'data str,
    pub sh_type: u32,
    pub flags: u64,
    pub addralign: u64,
    pub size: u64,
    /// Offset of the section contents within the ELF file.
    pub offset: u64,
    /// For `REL`/`RELA` sections: index of the section the entries apply to.
    pub info: u32,
    /// For `SYMTAB` sections: index of the associated string table.
    pub link: u32,
}

impl Section<'_> {
    pub fn is_alloc(&self) -> bool {
        self.flags & u64::from(elf::SHF_ALLOC) != 0
    }

    pub fn is_exec(&self) -> bool {
        self.flags & u64::from(elf::SHF_EXECINSTR) != 0
    }

    pub fn is_nobits(&self) -> bool {
        self.sh_type == elf::SHT_NOBITS
    }
}

/// A symbol table entry. `value` is section-relative until the resolver
/// rewrites it into image coordinates.
#[derive(Debug, Clone)]
pub struct Symbol<'data> {
    pub name: &'data str,
    pub value: u64,
    pub shndx: u16,
}

/// One decoded `Rel64`/`Rela64` entry. `Rel` entries carry an implicit
/// addend of zero.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    pub offset: u64,
    pub sym: u32,
    pub r_type: u32,
    pub addend: i64,
}

/// Parsed view over an ELF64 little-endian relocatable object.
pub struct ElfObject<'data> {
    data: &'data [u8],
    machine: u16,
    sections: Vec<Section<'data>>,
    symbols: Vec<Symbol<'data>>,
}

impl<'data> ElfObject<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let (header, _) = pod::from_bytes::<elf::FileHeader64<LE>>(data)
            .map_err(|()| Error::BadObject("truncated or misaligned file header"))?;

        if header.e_ident.magic != elf::ELFMAG {
            return Err(Error::BadObject("bad magic"));
        }
        if header.e_ident.class != elf::ELFCLASS64 {
            return Err(Error::BadObject("not a 64-bit object"));
        }
        if header.e_ident.data != elf::ELFDATA2LSB {
            return Err(Error::BadObject("not little-endian"));
        }

        let machine = header.e_machine.get(LE);
        let sections = parse_sections(data, header)?;
        let symbols = parse_symbols(data, &sections)?;

        Ok(Self {
            data,
            machine,
            sections,
            symbols,
        })
    }

    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// All sections, indexed from 0 (index 0 is the conventional null section).
    pub fn sections(&self) -> &[Section<'data>] {
        &self.sections
    }

    /// The symbol table, indexed the way relocation entries index it: the
    /// zero-valued undefined symbol sits at index 0.
    pub fn symbols(&self) -> &[Symbol<'data>] {
        &self.symbols
    }

    /// Raw contents of a section. `NOBITS` sections have no file contents
    /// and yield an empty slice.
    pub fn section_data(&self, section: &Section<'data>) -> Result<&'data [u8]> {
        if section.is_nobits() {
            return Ok(&[]);
        }
        slice_file(self.data, section.offset, section.size)
    }

    /// Decodes the entries of a `REL` or `RELA` section. The `info` field
    /// of each raw entry is split as `sym = info >> 32`,
    /// `type = info & 0xFFFF_FFFF`.
    pub fn relocation_entries(&self, section: &Section<'data>) -> Result<Vec<RelocEntry>> {
        let data = self.section_data(section)?;

        match section.sh_type {
            elf::SHT_REL => {
                let count = data.len() / mem::size_of::<elf::Rel64<LE>>();
                let (entries, _) = pod::slice_from_bytes::<elf::Rel64<LE>>(data, count)
                    .map_err(|()| Error::BadObject("misaligned Rel64 entries"))?;
                Ok(entries
                    .iter()
                    .map(|rel| {
                        let info = rel.r_info.get(LE);
                        RelocEntry {
                            offset: rel.r_offset.get(LE),
                            sym: (info >> 32) as u32,
                            r_type: (info & 0xFFFF_FFFF) as u32,
                            addend: 0,
                        }
                    })
                    .collect())
            }
            elf::SHT_RELA => {
                let count = data.len() / mem::size_of::<elf::Rela64<LE>>();
                let (entries, _) = pod::slice_from_bytes::<elf::Rela64<LE>>(data, count)
                    .map_err(|()| Error::BadObject("misaligned Rela64 entries"))?;
                Ok(entries
                    .iter()
                    .map(|rela| {
                        let info = rela.r_info.get(LE);
                        RelocEntry {
                            offset: rela.r_offset.get(LE),
                            sym: (info >> 32) as u32,
                            r_type: (info & 0xFFFF_FFFF) as u32,
                            addend: rela.r_addend.get(LE),
                        }
                    })
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn parse_sections<'data>(
    data: &'data [u8],
    header: &elf::FileHeader64<LE>,
) -> Result<Vec<Section<'data>>> {
    let shoff = usize::try_from(header.e_shoff.get(LE))
        .map_err(|_| Error::BadObject("section table offset out of range"))?;
    let shnum = usize::from(header.e_shnum.get(LE));

    if shnum == 0 {
        return Ok(Vec::new());
    }
    let table = data
        .get(shoff..)
        .ok_or(Error::BadObject("section table out of file bounds"))?;
    let (headers, _) = pod::slice_from_bytes::<elf::SectionHeader64<LE>>(table, shnum)
        .map_err(|()| Error::BadObject("truncated or misaligned section table"))?;

    let shstrndx = usize::from(header.e_shstrndx.get(LE));
    let shstrtab = match headers.get(shstrndx) {
        Some(sh) if sh.sh_type.get(LE) != elf::SHT_NOBITS => {
            slice_file(data, sh.sh_offset.get(LE), sh.sh_size.get(LE))?
        }
        _ => &[],
    };

    headers
        .iter()
        .enumerate()
        .map(|(index, sh)| {
            Ok(Section {
                index,
                name: strtab_lookup(shstrtab, sh.sh_name.get(LE))?,
                sh_type: sh.sh_type.get(LE),
                flags: sh.sh_flags.get(LE),
                addralign: sh.sh_addralign.get(LE),
                size: sh.sh_size.get(LE),
                offset: sh.sh_offset.get(LE),
                info: sh.sh_info.get(LE),
                link: sh.sh_link.get(LE),
            })
        })
        .collect()
}

fn parse_symbols<'data>(
    data: &'data [u8],
    sections: &[Section<'data>],
) -> Result<Vec<Symbol<'data>>> {
    let Some(symtab) = sections.iter().find(|s| s.sh_type == elf::SHT_SYMTAB) else {
        return Ok(Vec::new());
    };

    let raw = slice_file(data, symtab.offset, symtab.size)?;
    let count = raw.len() / mem::size_of::<elf::Sym64<LE>>();
    let (entries, _) = pod::slice_from_bytes::<elf::Sym64<LE>>(raw, count)
        .map_err(|()| Error::BadObject("truncated or misaligned symbol table"))?;

    let strtab = match sections.get(symtab.link as usize) {
        Some(s) if !s.is_nobits() => slice_file(data, s.offset, s.size)?,
        _ => &[],
    };

    entries
        .iter()
        .map(|sym| {
            Ok(Symbol {
                name: strtab_lookup(strtab, sym.st_name.get(LE))?,
                value: sym.st_value.get(LE),
                shndx: sym.st_shndx.get(LE),
            })
        })
        .collect()
}

fn slice_file(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    let start =
        usize::try_from(offset).map_err(|_| Error::BadObject("section offset out of range"))?;
    let len = usize::try_from(size).map_err(|_| Error::BadObject("section size out of range"))?;
    start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or(Error::BadObject("section data out of file bounds"))
}

fn strtab_lookup(strtab: &[u8], offset: u32) -> Result<&str> {
    let start = offset as usize;
    if start >= strtab.len() {
        return if offset == 0 {
            Ok("")
        } else {
            Err(Error::BadObject("string table offset out of bounds"))
        };
    }
    let bytes = &strtab[start..];
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::BadObject("unterminated string table entry"))?;
    std::str::from_utf8(&bytes[..end]).map_err(|_| Error::BadObject("non-UTF-8 name"))
}
