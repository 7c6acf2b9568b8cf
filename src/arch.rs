//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates all
//! architecture-specific logic: which ELF machine a backend accepts, the
//! matching PE/COFF machine type, and the relocation dispatch table (operand
//! widths and in-place transforms). The core pipeline stays generic; adding
//! a machine means adding a backend here and listing it in
//! [`for_elf_machine`].

use object::elf;

use crate::basereloc::BaseRelocKind;
use crate::error::Result;
use crate::reloc::Relocation;

pub mod x86_64;

/// A target architecture backend (e.g. x86_64).
pub trait Architecture {
    /// The ELF machine type this backend handles.
    fn elf_machine(&self) -> u16;

    /// The corresponding PE/COFF machine type.
    fn pe_machine(&self) -> u16;

    /// Operand width in bytes for a relocation type, or `None` when the
    /// type is not in this backend's dispatch table.
    fn relocation_width(&self, r_type: u32) -> Option<usize>;

    /// Applies a relocation in place to `operand` (already bounds-checked
    /// to the type's width). Returns the base-relocation kind the PE loader
    /// must apply at load time, for absolute fixups.
    fn apply_relocation(
        &self,
        relocation: &Relocation,
        operand: &mut [u8],
    ) -> Result<Option<BaseRelocKind>>;
}

/// Looks up the backend for an ELF machine type.
pub fn for_elf_machine(machine: u16) -> Option<&'static dyn Architecture> {
    match machine {
        elf::EM_X86_64 => Some(&x86_64::X86_64),
        _ => None,
    }
}
