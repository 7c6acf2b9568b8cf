//! Builds minimal ELF64 little-endian relocatable objects in memory, so
//! the pipeline can be exercised end-to-end without shipping binary
//! fixtures. Only the pieces the image builder reads are emitted: section
//! table, one symbol table with its string table, and RELA sections.

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;

pub const SHN_UNDEF: u16 = 0;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

struct Sec {
    name: String,
    sh_type: u32,
    flags: u64,
    addralign: u64,
    data: Vec<u8>,
    size: u64,
}

struct Sym {
    name: String,
    value: u64,
    shndx: u16,
}

struct RelaEntry {
    offset: u64,
    sym: u32,
    r_type: u32,
    addend: i64,
}

pub struct ElfBuilder {
    machine: u16,
    sections: Vec<Sec>,
    symbols: Vec<Sym>,
    relas: Vec<(usize, Vec<RelaEntry>)>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            machine: EM_X86_64,
            sections: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Adds a PROGBITS section; returns its section table index.
    pub fn progbits(&mut self, name: &str, flags: u64, addralign: u64, data: &[u8]) -> usize {
        self.sections.push(Sec {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            flags,
            addralign,
            size: data.len() as u64,
            data: data.to_vec(),
        });
        self.sections.len()
    }

    /// Adds a NOBITS (bss) section; returns its section table index.
    pub fn nobits(&mut self, name: &str, addralign: u64, size: u64) -> usize {
        self.sections.push(Sec {
            name: name.to_string(),
            sh_type: SHT_NOBITS,
            flags: SHF_ALLOC,
            addralign,
            size,
            data: Vec::new(),
        });
        self.sections.len()
    }

    /// Adds a symbol defined in `shndx` (a value returned by `progbits` or
    /// `nobits`, or `SHN_UNDEF` as usize); returns its symbol table index.
    pub fn symbol(&mut self, name: &str, shndx: usize, value: u64) -> u32 {
        self.symbols.push(Sym {
            name: name.to_string(),
            value,
            shndx: shndx as u16,
        });
        self.symbols.len() as u32
    }

    pub fn undefined(&mut self, name: &str) -> u32 {
        self.symbol(name, SHN_UNDEF as usize, 0)
    }

    /// Attaches a RELA entry to the section at `target`.
    pub fn rela(&mut self, target: usize, offset: u64, sym: u32, r_type: u32, addend: i64) {
        let entry = RelaEntry {
            offset,
            sym,
            r_type,
            addend,
        };
        match self.relas.iter_mut().find(|(t, _)| *t == target) {
            Some((_, entries)) => entries.push(entry),
            None => self.relas.push((target, vec![entry])),
        }
    }

    pub fn build(self) -> Vec<u8> {
        let user = self.sections.len();
        let symtab_index = user + 1;
        let strtab_index = user + 2;
        let shstrtab_index = user + 3;
        let first_rela_index = user + 4;
        let total_sections = first_rela_index + self.relas.len();

        // Build string tables up front so sizes are known.
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::new();
        for sym in &self.symbols {
            sym_name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        let mut shstrtab = vec![0u8];
        let mut sec_name_offsets = vec![0u32];
        let mut add_name = |table: &mut Vec<u8>, name: &str| -> u32 {
            let offset = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            offset
        };
        for sec in &self.sections {
            sec_name_offsets.push(add_name(&mut shstrtab, &sec.name));
        }
        let symtab_name = add_name(&mut shstrtab, ".symtab");
        let strtab_name = add_name(&mut shstrtab, ".strtab");
        let shstrtab_name = add_name(&mut shstrtab, ".shstrtab");
        let rela_names: Vec<u32> = self
            .relas
            .iter()
            .map(|(target, _)| {
                let target_name = self.sections[target - 1].name.clone();
                add_name(&mut shstrtab, &format!(".rela{target_name}"))
            })
            .collect();

        let mut out = vec![0u8; 64];

        // Section contents, each starting on an 8-byte boundary.
        let mut data_offsets = Vec::new();
        for sec in &self.sections {
            pad8(&mut out);
            data_offsets.push(out.len() as u64);
            out.extend_from_slice(&sec.data);
        }

        pad8(&mut out);
        let symtab_offset = out.len() as u64;
        out.extend_from_slice(&[0u8; 24]); // null symbol
        for (sym, name_offset) in self.symbols.iter().zip(&sym_name_offsets) {
            p32(&mut out, *name_offset);
            out.push(0x10); // STB_GLOBAL, STT_NOTYPE
            out.push(0);
            p16(&mut out, sym.shndx);
            p64(&mut out, sym.value);
            p64(&mut out, 0);
        }
        let symtab_size = out.len() as u64 - symtab_offset;

        let strtab_offset = out.len() as u64;
        out.extend_from_slice(&strtab);

        let shstrtab_offset = out.len() as u64;
        out.extend_from_slice(&shstrtab);

        let mut rela_offsets = Vec::new();
        for (_, entries) in &self.relas {
            pad8(&mut out);
            rela_offsets.push(out.len() as u64);
            for entry in entries {
                p64(&mut out, entry.offset);
                p64(&mut out, (u64::from(entry.sym) << 32) | u64::from(entry.r_type));
                p64(&mut out, entry.addend as u64);
            }
        }

        pad8(&mut out);
        let shoff = out.len() as u64;

        // Null section header
        out.extend_from_slice(&[0u8; 64]);

        for (index, sec) in self.sections.iter().enumerate() {
            let offset = if sec.sh_type == SHT_NOBITS {
                0
            } else {
                data_offsets[index]
            };
            section_header(
                &mut out,
                sec_name_offsets[index + 1],
                sec.sh_type,
                sec.flags,
                offset,
                sec.size,
                0,
                0,
                sec.addralign,
                0,
            );
        }

        section_header(
            &mut out,
            symtab_name,
            SHT_SYMTAB,
            0,
            symtab_offset,
            symtab_size,
            strtab_index as u32,
            0,
            8,
            24,
        );
        section_header(
            &mut out,
            strtab_name,
            SHT_STRTAB,
            0,
            strtab_offset,
            strtab.len() as u64,
            0,
            0,
            1,
            0,
        );
        section_header(
            &mut out,
            shstrtab_name,
            SHT_STRTAB,
            0,
            shstrtab_offset,
            shstrtab.len() as u64,
            0,
            0,
            1,
            0,
        );

        for (index, (target, entries)) in self.relas.iter().enumerate() {
            section_header(
                &mut out,
                rela_names[index],
                SHT_RELA,
                0,
                rela_offsets[index],
                24 * entries.len() as u64,
                symtab_index as u32,
                *target as u32,
                8,
                24,
            );
        }

        // ELF file header
        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        write_u16(&mut out, 16, 1); // ET_REL
        write_u16(&mut out, 18, self.machine);
        write_u32(&mut out, 20, 1);
        write_u64(&mut out, 40, shoff);
        write_u16(&mut out, 52, 64); // ehsize
        write_u16(&mut out, 58, 64); // shentsize
        write_u16(&mut out, 60, total_sections as u16);
        write_u16(&mut out, 62, shstrtab_index as u16);

        out
    }
}

#[allow(clippy::too_many_arguments)]
fn section_header(
    out: &mut Vec<u8>,
    name: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
) {
    p32(out, name);
    p32(out, sh_type);
    p64(out, flags);
    p64(out, 0); // sh_addr
    p64(out, offset);
    p64(out, size);
    p32(out, link);
    p32(out, info);
    p64(out, addralign);
    p64(out, entsize);
}

fn p16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn p32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn p64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

fn write_u16(out: &mut [u8], offset: usize, v: u16) {
    out[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(out: &mut [u8], offset: usize, v: u32) {
    out[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut [u8], offset: usize, v: u64) {
    out[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

/// Reads a little-endian u16/u32/u64 out of an emitted image.
pub fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

pub fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}
