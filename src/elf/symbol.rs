//! String table, symbol table and symbol resolution.

use super::{ElfClass, Sym, hash::HashTable, image::ElfImage};
use crate::{
    Module, Result,
    error::{invalid_image, out_of_range},
};
use alloc::sync::Arc;
use core::ffi::c_void;
use core::ptr::NonNull;
use elf::abi::{STT_FUNC, STT_OBJECT, STV_DEFAULT, STV_PROTECTED};

/// The dynamic string table (`.dynstr`).
pub(crate) struct StringTable {
    rva: u64,
    size: u64,
}

impl StringTable {
    pub(crate) fn new(rva: u64, size: u64) -> Self {
        StringTable { rva, size }
    }

    /// The NUL-terminated string at `index`, without its terminator.
    pub(crate) fn get_bytes<'img, C: ElfClass>(
        &self,
        image: &'img ElfImage<C>,
        index: u64,
    ) -> Result<&'img [u8]> {
        if index > self.size {
            return Err(out_of_range("string table index out of range"));
        }
        let bytes = image.bytes_range(self.rva + index, self.size - index)?;
        let end = bytes
            .iter()
            .position(|&byte| byte == 0)
            .ok_or_else(|| invalid_image("unterminated string in the string table"))?;
        Ok(&bytes[..end])
    }

    pub(crate) fn get_str<'img, C: ElfClass>(
        &self,
        image: &'img ElfImage<C>,
        index: u64,
    ) -> Result<&'img str> {
        // Symbol and dependency names are plain ASCII in practice.
        self.get_bytes(image, index)
            .map(|bytes| unsafe { core::str::from_utf8_unchecked(bytes) })
    }
}

/// The dynamic symbol table (`.dynsym`).
pub(crate) struct SymbolTable {
    rva: u64,
    entsize: u64,
}

impl SymbolTable {
    pub(crate) fn new(rva: u64, entsize: u64) -> Self {
        SymbolTable { rva, entsize }
    }

    pub(crate) fn get<C: ElfClass>(&self, image: &ElfImage<C>, index: u64) -> Result<Sym> {
        image.load_record(self.rva + index * self.entsize)
    }
}

/// Everything needed to answer export queries against one loaded image.
pub(crate) struct ExportTable {
    pub hash: HashTable,
    pub symtab: SymbolTable,
    pub strtab: StringTable,
}

impl ExportTable {
    /// Look `name` up among the image's exports.
    ///
    /// A hit counts only if the symbol is defined here and its visibility is
    /// `STV_DEFAULT` or `STV_PROTECTED`; the returned address is the
    /// symbol's RVA rebased onto the module's runtime base.
    pub(crate) fn find_export<C: ElfClass>(
        &self,
        image: &ElfImage<C>,
        base: usize,
        name: &str,
    ) -> Result<Option<NonNull<c_void>>> {
        let Some(sym) = self
            .hash
            .find_symbol(image, &self.symtab, &self.strtab, name)?
        else {
            return Ok(None);
        };
        if sym.is_undef() {
            return Ok(None);
        }
        if sym.visibility() != STV_DEFAULT && sym.visibility() != STV_PROTECTED {
            return Ok(None);
        }
        let addr = base.wrapping_add(sym.st_value as usize);
        Ok(NonNull::new(addr as *mut c_void))
    }
}

/// Resolves imported names to runtime addresses: the module's own exports
/// first, then its direct dependencies in declaration order.
pub(crate) struct SymbolResolver<'m, C: ElfClass> {
    image: &'m ElfImage<C>,
    exports: &'m ExportTable,
    base: usize,
    deps: &'m [Arc<dyn Module>],
}

impl<'m, C: ElfClass> SymbolResolver<'m, C> {
    pub(crate) fn new(
        image: &'m ElfImage<C>,
        exports: &'m ExportTable,
        base: usize,
        deps: &'m [Arc<dyn Module>],
    ) -> Self {
        SymbolResolver {
            image,
            exports,
            base,
            deps,
        }
    }

    /// Resolve a data import; zero when no module provides it.
    pub(crate) fn get_data_symbol(&self, name: &str) -> Result<usize> {
        self.get_symbol_each(name, |module, name| module.get_raw_data(name))
    }

    /// Resolve a function import; zero when no module provides it.
    pub(crate) fn get_proc_symbol(&self, name: &str) -> Result<usize> {
        self.get_symbol_each(name, |module, name| module.get_raw_proc(name))
    }

    /// Resolve the symbol named by a relocation according to its type.
    /// Anything other than a data or function symbol resolves to zero.
    pub(crate) fn resolve(&self, sym: &Sym, name: &str) -> Result<usize> {
        match sym.sym_type() {
            STT_OBJECT => self.get_data_symbol(name),
            STT_FUNC => self.get_proc_symbol(name),
            _ => Ok(0),
        }
    }

    /// Resolve against the dependencies only; copy relocations pull data
    /// from a dependency's definition, never from the image itself.
    pub(crate) fn resolve_in_deps(&self, sym: &Sym, name: &str) -> usize {
        let lookup: fn(&dyn Module, &str) -> Option<NonNull<c_void>> = match sym.sym_type() {
            STT_FUNC => |module, name| module.get_raw_proc(name),
            _ => |module, name| module.get_raw_data(name),
        };
        self.search_deps(name, lookup)
    }

    fn get_symbol_each(
        &self,
        name: &str,
        lookup: impl Fn(&dyn Module, &str) -> Option<NonNull<c_void>>,
    ) -> Result<usize> {
        if let Some(addr) = self.exports.find_export(self.image, self.base, name)? {
            return Ok(addr.as_ptr() as usize);
        }
        Ok(self.search_deps(name, lookup))
    }

    fn search_deps(
        &self,
        name: &str,
        lookup: impl Fn(&dyn Module, &str) -> Option<NonNull<c_void>>,
    ) -> usize {
        for dep in self.deps {
            if let Some(addr) = lookup(dep.as_ref(), name) {
                return addr.as_ptr() as usize;
            }
        }
        0
    }
}
