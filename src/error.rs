//! Error types for image construction and emission.
//!
//! Every failure here is fatal to the current image build: nothing is
//! retried or recovered internally, and the emitter stops at the first
//! error without writing further bytes to the sink.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not a valid ELF64 little-endian relocatable: {0}")]
    BadObject(&'static str),

    #[error("unsupported ELF machine type {0:#06x}")]
    UnsupportedMachine(u16),

    #[error("unsupported relocation type {0} for this machine")]
    UnsupportedRelocation(u32),

    #[error("relocation at section offset {offset:#x} (width {width}) exceeds section size {size:#x}")]
    RelocationOutOfBounds {
        offset: u64,
        width: usize,
        size: u64,
    },

    #[error("relocation symbol index {index} outside symbol table of {len} entries")]
    BadSymbolIndex { index: u32, len: usize },

    #[error("unrecognised undefined symbol '{0}'")]
    UnrecognizedUndefinedSymbol(String),

    #[error("'__bss_start' is referenced but the image has no NOBITS section")]
    BssSymbolButNoBss,

    #[error("entrypoint symbol '_start' not found in symbol table")]
    NoEntrypoint,

    #[error("symbol '{name}' names section index {index}, which is not part of the image")]
    UnknownSectionIndex { name: String, index: u16 },

    #[error("dependency list line '{0}' does not follow the moddep.lst format (missing ':')")]
    InvalidDependencyList(String),

    #[error("unrecognised module '{0}'")]
    UnrecognizedModule(String),

    #[error("section starts at {offset:#x} but {position:#x} bytes were already written")]
    SectionOffsetInvalid { offset: u64, position: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
