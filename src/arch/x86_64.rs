//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 systems (ELF64).
//! Handles specific relocations as defined in the System V AMD64 ABI.
//!
//! Reference: <https://refspecs.linuxbase.org/elf/x86_64-abi-0.99.pdf>

use object::{elf, pe};

use super::Architecture;
use crate::basereloc::BaseRelocKind;
use crate::error::{Error, Result};
use crate::reloc::Relocation;

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn elf_machine(&self) -> u16 {
        elf::EM_X86_64
    }

    fn pe_machine(&self) -> u16 {
        pe::IMAGE_FILE_MACHINE_AMD64
    }

    fn relocation_width(&self, r_type: u32) -> Option<usize> {
        match r_type {
            elf::R_X86_64_NONE => Some(0),
            elf::R_X86_64_64 => Some(8),
            elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => Some(4),
            _ => None,
        }
    }

    fn apply_relocation(
        &self,
        relocation: &Relocation,
        operand: &mut [u8],
    ) -> Result<Option<BaseRelocKind>> {
        // S: symbol value (already in image coordinates), A: addend,
        // P: place of storage (address of the operand within the image).
        match relocation.r_type {
            elf::R_X86_64_NONE => Ok(None),
            elf::R_X86_64_64 => {
                // *op ← *op + S + A. The value is an absolute address, so
                // the PE loader has to adjust it if the image is rebased.
                // Going through a signed 64-bit operand loses the top bit,
                // which would only matter for addresses at or above 2^63.
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&operand[..8]);
                let value = i64::from_le_bytes(bytes)
                    .wrapping_add(relocation.symbol_value as i64)
                    .wrapping_add(relocation.addend);
                operand[..8].copy_from_slice(&value.to_le_bytes());
                Ok(Some(BaseRelocKind::Dir64))
            }
            // Inputs are statically linked, so the PLT is empty and PLT32
            // branches go straight to their symbols; treat it as PC32.
            // https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/commit/?id=b21ebf2fb4cde1618915a97cc773e287ff49173e
            elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
                // *op ← *op + A + S − P, in truncated 32-bit arithmetic.
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&operand[..4]);
                let value = i32::from_le_bytes(bytes)
                    .wrapping_add(relocation.addend as i32)
                    .wrapping_add(relocation.symbol_value as i32)
                    .wrapping_sub(relocation.file_offset as i32);
                operand[..4].copy_from_slice(&value.to_le_bytes());
                Ok(None)
            }
            other => Err(Error::UnsupportedRelocation(other)),
        }
    }
}
