//! i386 relocation semantics.
//!
//! Every supported type stores 32 bits. `R_386_PC32` is computed against
//! the runtime address of the store site, and `R_386_RELATIVE` against the
//! runtime base, so an image mapped away from its preferred base still
//! patches correctly.

use super::super::{
    ElfClass,
    image::{ElfImage, ElfImageMut},
    reloc::{RelocEntry, Relocator},
};
use crate::{Result, error::unsupported};

// Not provided by the `elf` crate's `abi` module; values are the standard
// System V i386 ABI relocation type constants.
const R_386_NONE: u32 = 0;
const R_386_32: u32 = 1;
const R_386_PC32: u32 = 2;
const R_386_GLOB_DAT: u32 = 6;
const R_386_JMP_SLOT: u32 = 7;
const R_386_RELATIVE: u32 = 8;
const R_386_COPY: u32 = 5;

fn rel_name(ty: u32) -> &'static str {
    match ty {
        R_386_NONE => "R_386_NONE",
        R_386_32 => "R_386_32",
        R_386_PC32 => "R_386_PC32",
        R_386_COPY => "R_386_COPY",
        R_386_GLOB_DAT => "R_386_GLOB_DAT",
        R_386_JMP_SLOT => "R_386_JMP_SLOT",
        R_386_RELATIVE => "R_386_RELATIVE",
        _ => "UNKNOWN",
    }
}

#[cold]
fn unknown_reloc(ty: u32) -> crate::Error {
    unsupported(alloc::format!(
        "unsupported i386 relocation type {} ({ty})",
        rel_name(ty)
    ))
}

pub(crate) fn implicit_addend<C: ElfClass>(
    image: &ElfImage<C>,
    rva: u64,
    ty: u32,
) -> Result<u64> {
    match ty {
        R_386_NONE | R_386_COPY => Ok(0),
        R_386_32 | R_386_PC32 | R_386_GLOB_DAT | R_386_JMP_SLOT | R_386_RELATIVE => {
            image.read_int::<u32>(rva).map(u64::from)
        }
        _ => Err(unknown_reloc(ty)),
    }
}

pub(crate) fn is_copy(ty: u32) -> bool {
    ty == R_386_COPY
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
        R_386_NONE => Ok(addend),
        R_386_32 => {
            let sym = relocator.resolve_symbol(entry.sym)?;
            Ok(sym.wrapping_add(addend))
        }
        R_386_PC32 => {
            let sym = relocator.resolve_symbol(entry.sym)?;
            Ok(sym.wrapping_add(addend).wrapping_sub(relocator.place(entry)))
        }
        R_386_GLOB_DAT | R_386_JMP_SLOT => relocator.resolve_symbol(entry.sym),
        R_386_RELATIVE => Ok(relocator.load_base().wrapping_add(addend)),
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
        // A run of nothing but no-ops leaves the store site untouched.
        R_386_NONE => Ok(()),
        R_386_32 | R_386_PC32 | R_386_GLOB_DAT | R_386_JMP_SLOT | R_386_RELATIVE => {
            image.write_int::<u32>(rva, value as u32)
        }
        ty => Err(unknown_reloc(ty)),
    }
}
