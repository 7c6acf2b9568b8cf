//! GRUB modules: dependency resolution and the `mods` image section.
//!
//! GRUB ships a `moddep.lst` file mapping each module to its direct
//! dependencies. A requested module list is expanded to its transitive
//! closure, ordered leaves-first, and the resulting modules are packed into
//! a single section the kernel scans at boot: a 24-byte info header, then
//! per module an 8-byte `{type, size}` header followed by the payload.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use object::pe;

use crate::error::{Error, Result};
use crate::utils::align_up;

/// Magic marking the presence of the module info header ('mimg' on disk).
const MODULE_INFO_MAGIC: u32 = 0x676d_696d;

/// Size of the module info header: magic + padding + offset + total size.
const MODULE_INFO_SIZE: u64 = 4 + 4 + 8 + 8;

/// Size of the per-module header: two u32s (type, size).
const MODULE_HEADER_SIZE: u64 = 4 + 4;

/// Payloads are padded to pointer alignment of the 64-bit target.
const POINTER_ALIGNMENT: u64 = 8;

pub const SECTION_MODS: &str = "mods";

/// Object types understood by the GRUB kernel's module scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectType {
    Elf = 0,
    Memdisk = 1,
    Config = 2,
    Prefix = 3,
    PubKey = 4,
    Dtb = 5,
    DisableShimLock = 6,
    GpgPubKey = 7,
    X509PubKey = 8,
}

/// The parsed contents of a `moddep.lst` file.
///
/// The format is line-oriented: `<module>: <dep1> <dep2> ...`, where the
/// dependency list may be empty. Insertion order is kept so the file can be
/// reproduced.
pub struct DependencyList {
    names: Vec<String>,
    deps: HashMap<String, Vec<String>>,
}

impl DependencyList {
    pub fn parse(input: &str) -> Result<Self> {
        let mut names = Vec::new();
        let mut deps = HashMap::new();

        for line in input.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let (module, rest) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidDependencyList(line.to_string()))?;

            let direct: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
            if deps.insert(module.to_string(), direct).is_none() {
                names.push(module.to_string());
            }
        }

        Ok(Self { names, deps })
    }

    /// Expands `modules` to the transitive closure of their dependencies.
    ///
    /// Walks a worklist from the requested set, recording every visit, then
    /// reverses the visit list and deduplicates it keeping first
    /// occurrences. Every dependency therefore precedes its dependants, and
    /// each module appears exactly once. This is the order the module
    /// section packs them in.
    pub fn resolve(&self, modules: &[String]) -> Result<Vec<String>> {
        let mut queue: Vec<String> = modules.to_vec();
        let mut visits = Vec::new();

        while let Some(name) = queue.pop() {
            let direct = self
                .deps
                .get(&name)
                .ok_or_else(|| Error::UnrecognizedModule(name.clone()))?;

            queue.extend(direct.iter().cloned());
            visits.push(name);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for name in visits.into_iter().rev() {
            if seen.insert(name.clone()) {
                resolved.push(name);
            }
        }

        Ok(resolved)
    }
}

impl fmt::Display for DependencyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.names {
            write!(f, "{name}:")?;
            for dep in &self.deps[name] {
                write!(f, " {dep}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

enum ModuleSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A single object destined for the `mods` section.
pub struct Module {
    object_type: ObjectType,
    payload_size: u32,
    source: ModuleSource,
}

impl Module {
    /// A module file `<root>/<name>.mod`, streamed verbatim at pack time.
    pub fn from_directory(root: &Path, name: &str) -> Result<Self> {
        let path = root.join(format!("{name}.mod"));
        let metadata = std::fs::metadata(&path)?;

        Ok(Self {
            object_type: ObjectType::Elf,
            payload_size: metadata.len() as u32,
            source: ModuleSource::File(path),
        })
    }

    /// A module synthesized from in-memory bytes.
    pub fn from_bytes(object_type: ObjectType, payload: Vec<u8>) -> Self {
        Self {
            object_type,
            payload_size: payload.len() as u32,
            source: ModuleSource::Bytes(payload),
        }
    }

    /// The well-known `PREFIX` module: a zero-terminated path string telling
    /// GRUB where to find further modules at runtime, padded to pointer
    /// alignment.
    pub fn prefix(prefix: &str) -> Self {
        let padded = align_up(prefix.len() as u64 + 1, POINTER_ALIGNMENT) as usize;
        let mut payload = vec![0u8; padded];
        payload[..prefix.len()].copy_from_slice(prefix.as_bytes());

        Self::from_bytes(ObjectType::Prefix, payload)
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        match &self.source {
            ModuleSource::File(path) => Ok(Box::new(File::open(path)?)),
            ModuleSource::Bytes(bytes) => Ok(Box::new(bytes.as_slice())),
        }
    }
}

/// The packed `mods` section: info header, module headers, payloads.
pub struct ModuleSection {
    data: Vec<u8>,
    offset: u64,
    virtual_size: u64,
}

impl ModuleSection {
    /// Packs `modules` in order into a section at `offset` (a multiple of
    /// `alignment`) in the image. Module payloads are streamed in; only the
    /// packed section itself is held in memory.
    pub fn new(modules: &[Module], offset: u64, alignment: u64) -> Result<Self> {
        let total = MODULE_INFO_SIZE
            + modules
                .iter()
                .map(|m| MODULE_HEADER_SIZE + u64::from(m.payload_size))
                .sum::<u64>();

        let mut data = Vec::with_capacity(total as usize);
        data.extend_from_slice(&MODULE_INFO_MAGIC.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&MODULE_INFO_SIZE.to_le_bytes());
        data.extend_from_slice(&total.to_le_bytes());

        for module in modules {
            let size = MODULE_HEADER_SIZE as u32 + module.payload_size;
            data.extend_from_slice(&(module.object_type as u32).to_le_bytes());
            data.extend_from_slice(&size.to_le_bytes());

            let mut payload = module.open()?;
            io::copy(&mut payload, &mut data)?;
        }

        let virtual_size = align_up(data.len() as u64, alignment);
        Ok(Self {
            data,
            offset,
            virtual_size,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Section size in the image: the packed bytes padded with zeros up to
    /// the page boundary.
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn characteristics() -> u32 {
        pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE
    }
}
