//! The loaded ELF module and its construction pipeline.
//!
//! Construction runs through ordered phases: validate, allocate, copy
//! segments, parse the dynamic table, resolve dependencies, relocate,
//! protect, initialize. Each phase must complete before the next, and a
//! failure anywhere unwinds whatever earlier phases acquired. A module is
//! only handed to the caller once its initializers have run, so exported
//! symbols never become observable early.

use super::{
    ElfClass, Phdr, arch,
    dynamic::{ArrayRange, DynamicTable},
    hash::HashTable,
    image::{ElfImage, ElfImageMut, align_up, to_usize},
    reloc::Relocator,
    symbol::{ExportTable, StringTable, SymbolResolver, SymbolTable},
};
use crate::{
    Module, ModuleResolver, Result,
    error::{dependency_not_found, invalid_image, unsupported},
    vmem::{MemAccess, PAGE_MASK, PAGE_SIZE, VmemBlock},
};
use alloc::{sync::Arc, vec::Vec};
use core::ffi::c_void;
use core::ptr::NonNull;
use elf::abi::{ET_DYN, PF_R, PF_W, PF_X, PT_LOAD};

/// An ELF shared object mapped from a memory buffer into this process.
pub(crate) struct ElfModule<C: ElfClass> {
    image: ElfImageMut<C>,
    table: DynamicTable,
    exports: ExportTable,
    deps: Vec<Arc<dyn Module>>,
    base: usize,
    // Dropped last: finalizers in `drop` run against live memory.
    block: VmemBlock,
}

unsafe impl<C: ElfClass> Send for ElfModule<C> {}
unsafe impl<C: ElfClass> Sync for ElfModule<C> {}

fn segment_access(p_flags: u32) -> MemAccess {
    let mut access = MemAccess::empty();
    if p_flags & PF_R != 0 {
        access |= MemAccess::READ;
    }
    if p_flags & PF_W != 0 {
        access |= MemAccess::WRITE;
    }
    if p_flags & PF_X != 0 {
        access |= MemAccess::EXEC;
    }
    access
}

/// Copy each `PT_LOAD`'s file content to its place in the fresh allocation;
/// the `p_memsz - p_filesz` tail stays zero from the anonymous mapping.
fn copy_segments<C: ElfClass>(source: &ElfImage<C>, block: &VmemBlock) -> Result<()> {
    for phdr in source.phdrs().iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        if phdr.p_filesz > phdr.p_memsz {
            return Err(invalid_image("p_filesz > p_memsz"));
        }
        let rva = phdr
            .p_vaddr
            .checked_sub(source.vbase())
            .ok_or_else(|| invalid_image("segment below the image base"))?;
        let span_end = rva
            .checked_add(phdr.p_memsz)
            .ok_or_else(|| invalid_image("segment span overflows"))?;
        if span_end > block.len() as u64 {
            return Err(invalid_image("segment outside the computed image span"));
        }
        let content = source.bytes_range(phdr.p_offset, phdr.p_filesz)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                content.as_ptr(),
                block.as_ptr().add(to_usize(rva)?),
                content.len(),
            );
        }
        #[cfg(feature = "log")]
        log::trace!(
            "[Load] segment vaddr {:#x} rva {:#x} filesz {:#x} memsz {:#x}",
            phdr.p_vaddr,
            rva,
            phdr.p_filesz,
            phdr.p_memsz
        );
    }
    Ok(())
}

/// Move every `PT_LOAD` from the construction-time read+write mapping to
/// the access its `p_flags` ask for. The writable window ends here.
fn protect_segments(phdrs: &[Phdr], vbase: u64, block: &VmemBlock) -> Result<()> {
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        let rva = to_usize(
            phdr.p_vaddr
                .checked_sub(vbase)
                .ok_or_else(|| invalid_image("segment below the image base"))?,
        )?;
        let start = rva & PAGE_MASK;
        let end = to_usize(align_up(
            (rva as u64) + phdr.p_memsz,
            PAGE_SIZE as u64,
        ))?
        .min(block.len());
        if end <= start {
            continue;
        }
        let access = segment_access(phdr.p_flags);
        block.protect(start, end - start, access)?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Protect] rva {:#x}..{:#x} access {:?}",
            start,
            end,
            access
        );
    }
    Ok(())
}

impl<C: ElfClass> ElfModule<C> {
    /// Cheap test that `bytes` could be an image this realisation loads.
    pub(crate) fn is_valid(bytes: &[u8]) -> bool {
        ElfImage::<C>::is_valid(bytes)
    }

    pub(crate) fn load(bytes: &[u8], resolver: &dyn ModuleResolver) -> Result<Self> {
        // Phase: validate.
        let source = unsafe { ElfImage::<C>::from_raw(bytes.as_ptr(), bytes.len())? };
        if source.ehdr().e_type != ET_DYN {
            return Err(unsupported("not a shared object (ET_DYN)"));
        }
        if source.ehdr().e_machine != arch::EM_HOST {
            return Err(unsupported("image machine does not match the host"));
        }
        if source.vsize() == 0 {
            return Err(invalid_image("no loadable segments"));
        }

        // Phase: allocate. The preferred base is vbase; if the region lands
        // elsewhere the relocation formulas pick the actual base up below.
        let vsize = to_usize(source.vsize())?;
        let block = VmemBlock::alloc(
            vsize,
            to_usize(source.vbase())?,
            MemAccess::READ | MemAccess::WRITE,
        )?;

        // Phase: copy segments.
        copy_segments(&source, &block)?;

        // All further views read the loaded copy, not the source buffer.
        let image = unsafe { ElfImageMut::<C>::from_raw(block.as_ptr(), vsize)? };
        let base = (block.as_ptr() as usize).wrapping_sub(to_usize(source.vbase())?);

        #[cfg(feature = "log")]
        log::debug!(
            "[Load] mapped image at {:#x} (vbase {:#x}, vsize {:#x})",
            block.as_ptr() as usize,
            image.vbase(),
            image.vsize()
        );

        // Phase: parse the dynamic table.
        let dyn_phdr = *image
            .dynamic_phdr()
            .ok_or_else(|| invalid_image("image has no PT_DYNAMIC"))?;
        let table = DynamicTable::parse::<C>(&image, &dyn_phdr)?;
        let exports = ExportTable {
            hash: HashTable::parse::<C>(&image, &table.hash)?,
            symtab: SymbolTable::new(table.symtab, table.syment),
            strtab: StringTable::new(table.strtab, table.strsz),
        };

        // Phase: resolve dependencies, in declaration order.
        let mut deps: Vec<Arc<dyn Module>> = Vec::with_capacity(table.needed.len());
        for &name_offset in &table.needed {
            let name = exports.strtab.get_str(&image, name_offset)?;
            let dep = resolver.get_module(name).ok_or_else(|| {
                dependency_not_found(alloc::format!("module dependency not found: {name}"))
            })?;
            #[cfg(feature = "log")]
            log::debug!("[Load] resolved dependency {name:?}");
            deps.push(dep);
        }

        // Phase: relocate.
        {
            let sym_resolver = SymbolResolver::new(&image, &exports, base, &deps);
            let relocator = Relocator::new(&image, base, &exports, &sym_resolver);
            relocator.run(&table)?;
        }

        // Phase: protect.
        protect_segments(image.phdrs(), image.vbase(), &block)?;

        // Phase: initialize.
        let module = ElfModule {
            image,
            table,
            exports,
            deps,
            base,
            block,
        };
        module.run_initializers();
        Ok(module)
    }

    #[inline]
    fn fn_at(&self, addr: usize) -> extern "C" fn() {
        unsafe { core::mem::transmute(addr) }
    }

    /// Invoke the functions of an init/fini array in declared order.
    /// Entries holding 0 or all-ones are terminators some toolchains emit
    /// and are skipped.
    fn run_fn_array(&self, array: &ArrayRange, _what: &str) {
        for idx in 0..array.count {
            let Ok(value) = self
                .image
                .read_addr(array.rva + idx * C::ADDR_SIZE as u64)
            else {
                return;
            };
            if value == 0 || value == C::ADDR_MASK {
                continue;
            }
            #[cfg(feature = "log")]
            log::trace!("[Init] {_what}[{idx}] at {value:#x}");
            (self.fn_at(self.base.wrapping_add(value as usize)))();
        }
    }

    /// `DT_INIT`, then `DT_INIT_ARRAY`, then `DT_PREINIT_ARRAY`, then the
    /// entry point. Running the preinit array after the init array is a
    /// deliberate contract of this loader.
    fn run_initializers(&self) {
        if let Some(rva) = self.table.init {
            if let Ok(rva) = to_usize(rva) {
                (self.fn_at(self.block.as_ptr() as usize + rva))();
            }
        }
        if let Some(array) = &self.table.init_array {
            self.run_fn_array(array, "init_array");
        }
        if let Some(array) = &self.table.preinit_array {
            self.run_fn_array(array, "preinit_array");
        }
        let entry = self.image.ehdr().e_entry;
        if entry != 0 {
            (self.fn_at(self.base.wrapping_add(entry as usize)))();
        }
    }

    fn find_export(&self, name: &str) -> Option<NonNull<c_void>> {
        self.exports
            .find_export(&self.image, self.base, name)
            .ok()
            .flatten()
    }
}

impl<C: ElfClass> Module for ElfModule<C> {
    fn get_raw_proc(&self, name: &str) -> Option<NonNull<c_void>> {
        self.find_export(name)
    }

    fn get_raw_data(&self, name: &str) -> Option<NonNull<c_void>> {
        self.find_export(name)
    }
}

impl<C: ElfClass> Drop for ElfModule<C> {
    /// Finalizers run strictly before the region is released: the fini
    /// array in declared order, then `DT_FINI`, then the block's own drop
    /// frees the memory.
    fn drop(&mut self) {
        if let Some(array) = &self.table.fini_array {
            self.run_fn_array(array, "fini_array");
        }
        if let Some(rva) = self.table.fini {
            if let Ok(rva) = to_usize(rva) {
                (self.fn_at(self.block.as_ptr() as usize + rva))();
            }
        }
    }
}
