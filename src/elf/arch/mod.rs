//! Architecture-specific relocation semantics.
//!
//! The shared engine in [`super::reloc`] walks relocation tables and groups
//! same-offset runs; everything that depends on the instruction set (addend
//! widths, value computation, store widths, the copy and group-stop
//! predicates) is dispatched here on the image's `e_machine`.

pub(crate) mod x86;
pub(crate) mod x86_64;

use super::{
    ElfClass,
    image::{ElfImage, ElfImageMut},
    reloc::{RelocEntry, Relocator},
};
use crate::{Result, error::unsupported};
use elf::abi::{EM_386, EM_X86_64};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The machine this process can execute.
        pub(crate) const EM_HOST: u16 = EM_X86_64;
    } else if #[cfg(target_arch = "x86")] {
        pub(crate) const EM_HOST: u16 = EM_386;
    }
}

/// The addend of a `Rel` entry, read from the store site at the width the
/// relocation type dictates.
pub(crate) fn implicit_addend<C: ElfClass>(
    machine: u16,
    image: &ElfImage<C>,
    rva: u64,
    ty: u32,
) -> Result<u64> {
    match machine {
        EM_386 => x86::implicit_addend(image, rva, ty),
        EM_X86_64 => x86_64::implicit_addend(image, rva, ty),
        _ => Err(unknown_machine(machine)),
    }
}

pub(crate) fn is_copy(machine: u16, ty: u32) -> bool {
    match machine {
        EM_386 => x86::is_copy(ty),
        EM_X86_64 => x86_64::is_copy(ty),
        _ => false,
    }
}

/// Whether `ty` terminates a same-offset run. Neither supported machine has
/// such a marker; the hook exists for ports that do.
pub(crate) fn is_group_stop(machine: u16, ty: u32) -> bool {
    match machine {
        EM_386 => x86::is_group_stop(ty),
        EM_X86_64 => x86_64::is_group_stop(ty),
        _ => false,
    }
}

/// Fold one relocation into the accumulated value of its run.
pub(crate) fn compute<C: ElfClass>(
    relocator: &Relocator<'_, C>,
    entry: &RelocEntry,
    addend: u64,
) -> Result<u64> {
    match relocator.machine() {
        EM_386 => x86::compute(relocator, entry, addend),
        EM_X86_64 => x86_64::compute(relocator, entry, addend),
        machine => Err(unknown_machine(machine)),
    }
}

/// Store a run's final value at the width dictated by the closing entry.
pub(crate) fn store<C: ElfClass>(
    machine: u16,
    image: &ElfImageMut<C>,
    rva: u64,
    ty: u32,
    value: u64,
) -> Result<()> {
    match machine {
        EM_386 => x86::store(image, rva, ty, value),
        EM_X86_64 => x86_64::store(image, rva, ty, value),
        _ => Err(unknown_machine(machine)),
    }
}

#[cold]
fn unknown_machine(machine: u16) -> crate::Error {
    unsupported(alloc::format!("unsupported machine {machine:#x}"))
}
