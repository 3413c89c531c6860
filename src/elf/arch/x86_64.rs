//! x86-64 relocation semantics.
//!
//! Most types store a full 64-bit value; `R_X86_64_32`, `R_X86_64_32S` and
//! `R_X86_64_PC32` store 32 bits, and their implicit addends are read at
//! that width too.

use super::super::{
    ElfClass,
    image::{ElfImage, ElfImageMut},
    reloc::{RelocEntry, Relocator},
};
use crate::{Result, error::unsupported};
use elf::abi::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_COPY, R_X86_64_GLOB_DAT, R_X86_64_GOTPCREL,
    R_X86_64_JUMP_SLOT, R_X86_64_NONE, R_X86_64_PC32, R_X86_64_RELATIVE,
};

fn rel_name(ty: u32) -> &'static str {
    match ty {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_32S => "R_X86_64_32S",
        _ => "UNKNOWN",
    }
}

#[cold]
fn unknown_reloc(ty: u32) -> crate::Error {
    unsupported(alloc::format!(
        "unsupported x86-64 relocation type {} ({ty})",
        rel_name(ty)
    ))
}

pub(crate) fn implicit_addend<C: ElfClass>(
    image: &ElfImage<C>,
    rva: u64,
    ty: u32,
) -> Result<u64> {
    match ty {
        R_X86_64_NONE | R_X86_64_COPY => Ok(0),
        R_X86_64_32 | R_X86_64_32S | R_X86_64_PC32 | R_X86_64_GOTPCREL => {
            image.read_int::<u32>(rva).map(u64::from)
        }
        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT | R_X86_64_RELATIVE => {
            image.read_int::<u64>(rva)
        }
        _ => Err(unknown_reloc(ty)),
    }
}

pub(crate) fn is_copy(ty: u32) -> bool {
    ty == R_X86_64_COPY
}

pub(crate) fn is_group_stop(_ty: u32) -> bool {
    false
}

pub(crate) fn compute<C: ElfClass>(
    relocator: &Relocator<'_, C>,
    entry: &RelocEntry,
    addend: u64,
) -> Result<u64> {
    match entry.ty {
        R_X86_64_NONE => Ok(addend),
        R_X86_64_64 | R_X86_64_32 | R_X86_64_32S => {
            let sym = relocator.resolve_symbol(entry.sym)?;
            Ok(sym.wrapping_add(addend))
        }
        R_X86_64_PC32 => {
            let sym = relocator.resolve_symbol(entry.sym)?;
            Ok(sym.wrapping_add(addend).wrapping_sub(relocator.place(entry)))
        }
        R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => relocator.resolve_symbol(entry.sym),
        R_X86_64_RELATIVE => Ok(relocator.load_base().wrapping_add(addend)),
        ty => Err(unknown_reloc(ty)),
    }
}

pub(crate) fn store<C: ElfClass>(
    image: &ElfImageMut<C>,
    rva: u64,
    ty: u32,
    value: u64,
) -> Result<()> {
    match ty {
        R_X86_64_NONE => Ok(()),
        R_X86_64_32 | R_X86_64_32S | R_X86_64_PC32 => image.write_int::<u32>(rva, value as u32),
        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT | R_X86_64_RELATIVE => {
            image.write_int::<u64>(rva, value)
        }
        ty => Err(unknown_reloc(ty)),
    }
}
