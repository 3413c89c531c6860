//! Load ELF shared objects straight from memory buffers.
//!
//! This crate is an in-process dynamic loader: it maps an `ET_DYN` image
//! from a byte buffer into the current address space, resolves its imports
//! against other already-loaded modules, applies its relocations, sets the
//! final segment protections and runs its initializers. Exported symbols
//! then become callable through a uniform lookup surface shared with
//! modules opened via the host's own loader.
//!
//! ```no_run
//! # use memdl::{ModuleRegistry, SystemResolver, load_from_memory};
//! # let bytes: Vec<u8> = Vec::new();
//! let registry = ModuleRegistry::new();
//! registry.set_module_resolver(Some(Box::new(SystemResolver)));
//! let module = load_from_memory(&bytes, &registry).unwrap();
//! let answer = unsafe { module.get_proc::<extern "C" fn() -> i32>("answer").unwrap() };
//! assert_eq!(answer(), 42);
//! ```
#![cfg_attr(not(feature = "std"), no_std)]
extern crate alloc;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("unsupported arch");

pub mod endian;
pub mod vmem;

mod elf;
mod error;
mod registry;
mod system;

use alloc::sync::Arc;
use core::ffi::c_void;
use core::marker::PhantomData;
use core::ops;
use core::ptr::NonNull;

use crate::elf::{Elf32, Elf64, module::ElfModule};
use error::invalid_image;

pub use error::{Error, Result};
pub use registry::{ModuleRegistry, ModuleResolver};
pub use system::{LibModule, SystemResolver};

/// A loaded module: either an ELF image mapped from memory or a library
/// opened through the host loader. Resolvers and the registry treat both
/// uniformly.
pub trait Module: Send + Sync {
    /// Address of the exported function `name`, or `None`.
    fn get_raw_proc(&self, name: &str) -> Option<NonNull<c_void>>;

    /// Address of the exported data symbol `name`, or `None`.
    fn get_raw_data(&self, name: &str) -> Option<NonNull<c_void>>;
}

impl core::fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("dyn Module")
    }
}

/// A typed view of an exported symbol, borrowed from its module.
#[derive(Debug, Clone)]
pub struct Symbol<'lib, T: 'lib> {
    ptr: *mut (),
    pd: PhantomData<&'lib T>,
}

impl<'lib, T> ops::Deref for Symbol<'lib, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*(&self.ptr as *const *mut () as *const T) }
    }
}

impl dyn Module + '_ {
    /// Typed access to an exported function.
    ///
    /// # Safety
    /// `T` must be the function's actual type; the symbol is interpreted
    /// as-is with no signature check.
    ///
    /// ```no_run
    /// # use memdl::Module;
    /// # fn demo(module: &dyn Module) {
    /// let add = unsafe { module.get_proc::<extern "C" fn(i32, i32) -> i32>("add").unwrap() };
    /// assert_eq!(add(2, 2), 4);
    /// # }
    /// ```
    pub unsafe fn get_proc<'lib, T>(&'lib self, name: &str) -> Option<Symbol<'lib, T>> {
        self.get_raw_proc(name).map(|ptr| Symbol {
            ptr: ptr.as_ptr().cast(),
            pd: PhantomData,
        })
    }

    /// Typed access to an exported data symbol; `T` is a pointer type.
    ///
    /// # Safety
    /// `T` must match the symbol's actual type.
    ///
    /// ```no_run
    /// # use memdl::Module;
    /// # fn demo(module: &dyn Module) {
    /// let value = unsafe { module.get_data::<*mut i32>("value").unwrap() };
    /// assert_eq!(unsafe { **value }, 7);
    /// # }
    /// ```
    pub unsafe fn get_data<'lib, T>(&'lib self, name: &str) -> Option<Symbol<'lib, T>> {
        self.get_raw_data(name).map(|ptr| Symbol {
            ptr: ptr.as_ptr().cast(),
            pd: PhantomData,
        })
    }
}

/// Load the shared object in `bytes` into the current process.
///
/// `resolver` supplies the modules named by the image's `DT_NEEDED`
/// entries; a [`ModuleRegistry`] chained to a [`SystemResolver`] covers the
/// common case. The returned module has been relocated, protected and
/// initialized; dropping the last reference runs its finalizers and
/// releases its memory.
pub fn load_from_memory(bytes: &[u8], resolver: &dyn ModuleResolver) -> Result<Arc<dyn Module>> {
    if ElfModule::<Elf64>::is_valid(bytes) {
        let module = ElfModule::<Elf64>::load(bytes, resolver)?;
        return Ok(Arc::new(module));
    }
    if ElfModule::<Elf32>::is_valid(bytes) {
        let module = ElfModule::<Elf32>::load(bytes, resolver)?;
        return Ok(Arc::new(module));
    }
    Err(invalid_image("not an elf shared object image"))
}
