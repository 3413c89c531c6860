//! The relocation engine.
//!
//! Walks the REL, RELA and PLT relocation tables in that order and applies
//! them through the architecture hooks in [`super::arch`]. Entries sharing
//! an `r_offset` form a run whose effects compose into one accumulated
//! value with a single final store; toolchains rely on this (a RELATIVE
//! followed by a 32-bit truncation, for instance), so the entries of a run
//! must never be stored independently.

use super::{
    ElfClass, Rel, Rela, arch,
    dynamic::{DynamicTable, PltKind, RelRange},
    image::ElfImageMut,
    symbol::{ExportTable, SymbolResolver},
};
use crate::{
    Result,
    error::{invalid_image, symbol_not_found},
};
use alloc::vec::Vec;
use elf::abi::STB_WEAK;

/// A relocation record normalised across REL/RELA and both classes.
pub(crate) struct RelocEntry {
    /// Store site, as a virtual address.
    pub offset: u64,
    pub ty: u32,
    pub sym: u32,
    /// Explicit addend; `None` for REL records, whose addend lives at the
    /// store site.
    pub addend: Option<i64>,
}

pub(crate) struct Relocator<'m, C: ElfClass> {
    image: &'m ElfImageMut<C>,
    machine: u16,
    base: usize,
    exports: &'m ExportTable,
    resolver: &'m SymbolResolver<'m, C>,
}

impl<'m, C: ElfClass> Relocator<'m, C> {
    pub(crate) fn new(
        image: &'m ElfImageMut<C>,
        base: usize,
        exports: &'m ExportTable,
        resolver: &'m SymbolResolver<'m, C>,
    ) -> Self {
        Relocator {
            image,
            machine: image.ehdr().e_machine,
            base,
            exports,
            resolver,
        }
    }

    #[inline]
    pub(crate) fn machine(&self) -> u16 {
        self.machine
    }

    /// The runtime base `B`: what link-time address zero maps to now. When
    /// the allocation landed away from the preferred base this differs from
    /// `vbase`, and every formula must use this value.
    #[inline]
    pub(crate) fn load_base(&self) -> u64 {
        self.base as u64
    }

    /// The runtime address `P` of an entry's store site.
    #[inline]
    pub(crate) fn place(&self, entry: &RelocEntry) -> u64 {
        (self.base as u64).wrapping_add(entry.offset)
    }

    /// Resolve the symbol a relocation refers to. Zero is only acceptable
    /// for weak symbols; it then propagates as the symbol's value.
    pub(crate) fn resolve_symbol(&self, sym_index: u32) -> Result<u64> {
        let sym = self
            .exports
            .symtab
            .get(self.image, u64::from(sym_index))?;
        let name = self
            .exports
            .strtab
            .get_str(self.image, u64::from(sym.st_name))?;
        let value = self.resolver.resolve(&sym, name)?;
        if value == 0 && sym.bind() != STB_WEAK {
            return Err(symbol_not_found(alloc::format!(
                "required symbol not found: {name}"
            )));
        }
        Ok(value as u64)
    }

    /// Apply every relocation group of the image, in table order.
    pub(crate) fn run(&self, table: &DynamicTable) -> Result<()> {
        if let Some(range) = &table.rel {
            self.apply_group(&self.decode_rel(range)?)?;
        }
        if let Some(range) = &table.rela {
            self.apply_group(&self.decode_rela(range)?)?;
        }
        if let Some((kind, range)) = &table.plt {
            let entries = match kind {
                PltKind::Rel => self.decode_rel(range)?,
                PltKind::Rela => self.decode_rela(range)?,
            };
            self.apply_group(&entries)?;
        }
        Ok(())
    }

    fn decode_rel(&self, range: &RelRange) -> Result<Vec<RelocEntry>> {
        let mut entries = Vec::with_capacity(range.count() as usize);
        for idx in 0..range.count() {
            let rel: Rel = self.image.load_record(range.rva + idx * range.entsize)?;
            entries.push(RelocEntry {
                offset: rel.r_offset,
                ty: C::r_type(rel.r_info),
                sym: C::r_sym(rel.r_info),
                addend: None,
            });
        }
        Ok(entries)
    }

    fn decode_rela(&self, range: &RelRange) -> Result<Vec<RelocEntry>> {
        let mut entries = Vec::with_capacity(range.count() as usize);
        for idx in 0..range.count() {
            let rela: Rela = self.image.load_record(range.rva + idx * range.entsize)?;
            entries.push(RelocEntry {
                offset: rela.r_offset,
                ty: C::r_type(rela.r_info),
                sym: C::r_sym(rela.r_info),
                addend: Some(rela.r_addend),
            });
        }
        Ok(entries)
    }

    /// Apply one relocation table, folding same-offset runs.
    ///
    /// A run starts with the addend of its first entry and ends when the
    /// offset changes, a group-stop entry follows, or the table ends. Copy
    /// relocations are applied out-of-band and do not touch the
    /// accumulated value; the last non-copy entry decides the store width.
    fn apply_group(&self, entries: &[RelocEntry]) -> Result<()> {
        let mut idx = 0;
        while idx < entries.len() {
            let start = idx;
            let offset = entries[start].offset;
            let mut value = self.addend_of(&entries[start])?;
            let mut last: Option<&RelocEntry> = None;
            while idx < entries.len() {
                let entry = &entries[idx];
                if entry.offset != offset {
                    break;
                }
                if idx > start && arch::is_group_stop(self.machine, entry.ty) {
                    break;
                }
                if arch::is_copy(self.machine, entry.ty) {
                    self.apply_copy(entry)?;
                    idx += 1;
                    continue;
                }
                value = arch::compute(self, entry, value)?;
                last = Some(entry);
                idx += 1;
            }
            if let Some(entry) = last {
                arch::store(self.machine, self.image, self.rva_of(entry.offset)?, entry.ty, value)?;
            }
        }
        Ok(())
    }

    fn addend_of(&self, entry: &RelocEntry) -> Result<u64> {
        match entry.addend {
            Some(addend) => Ok(addend as u64),
            None => arch::implicit_addend(
                self.machine,
                self.image,
                self.rva_of(entry.offset)?,
                entry.ty,
            ),
        }
    }

    fn rva_of(&self, offset: u64) -> Result<u64> {
        offset
            .checked_sub(self.image.vbase())
            .ok_or_else(|| invalid_image("relocation offset below the image base"))
    }

    /// Byte-copy a data symbol's current value from a dependency into the
    /// image; the symbol's size decides how much is copied.
    fn apply_copy(&self, entry: &RelocEntry) -> Result<()> {
        let sym = self.exports.symtab.get(self.image, u64::from(entry.sym))?;
        let name = self
            .exports
            .strtab
            .get_str(self.image, u64::from(sym.st_name))?;
        let source = self.resolver.resolve_in_deps(&sym, name);
        if source == 0 {
            if sym.bind() != STB_WEAK {
                return Err(symbol_not_found(alloc::format!(
                    "required symbol not found: {name}"
                )));
            }
            return Ok(());
        }
        let rva = self.rva_of(entry.offset)?;
        // Validates the destination range before the raw copy.
        self.image.bytes_range(rva, sym.st_size)?;
        let dest = self.image.rva_to_mut_ptr(rva)?;
        unsafe {
            core::ptr::copy_nonoverlapping(source as *const u8, dest, sym.st_size as usize);
        }
        #[cfg(feature = "log")]
        log::trace!(
            "[Reloc] copy {} bytes of {:?} from {:#x} to rva {:#x}",
            sym.st_size,
            name,
            source,
            rva
        );
        Ok(())
    }
}
