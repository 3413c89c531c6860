//! The host-OS loader fallback.
//!
//! [`LibModule`] wraps a shared object opened through the platform's native
//! facility (`dlopen` / `LoadLibraryA`) behind the same [`Module`] surface
//! as images loaded from memory; resolvers and the registry cannot tell the
//! two apart. [`SystemResolver`] answers dependency names with such
//! modules, which is how a memory-loaded image links against the host's C
//! library.

use crate::{Module, ModuleResolver, Result};
use alloc::sync::Arc;
use core::ffi::c_void;
use core::ptr::NonNull;

/// A module provided by the operating system's own loader.
pub struct LibModule {
    handle: NonNull<c_void>,
}

unsafe impl Send for LibModule {}
unsafe impl Sync for LibModule {}

impl LibModule {
    /// Open `name` through the platform loader.
    pub fn open(name: &str) -> Result<Self> {
        imp::open(name).map(|handle| LibModule { handle })
    }

    /// Adopt an already-open platform handle; it will be closed on drop.
    ///
    /// # Safety
    /// `handle` must be a live handle returned by the platform loader, and
    /// ownership of it moves to the returned module.
    pub unsafe fn from_raw(handle: NonNull<c_void>) -> Self {
        LibModule { handle }
    }
}

impl Module for LibModule {
    fn get_raw_proc(&self, name: &str) -> Option<NonNull<c_void>> {
        imp::lookup(self.handle, name)
    }

    fn get_raw_data(&self, name: &str) -> Option<NonNull<c_void>> {
        imp::lookup(self.handle, name)
    }
}

impl Drop for LibModule {
    fn drop(&mut self) {
        imp::close(self.handle);
    }
}

/// Resolves dependency names through the host loader.
pub struct SystemResolver;

impl ModuleResolver for SystemResolver {
    fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        LibModule::open(name)
            .ok()
            .map(|module| Arc::new(module) as Arc<dyn Module>)
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use crate::{Result, error::os_error};
            use alloc::{ffi::CString, string::ToString};
            use core::ffi::{CStr, c_void};
            use core::ptr::NonNull;

            pub(super) fn open(name: &str) -> Result<NonNull<c_void>> {
                let cname = CString::new(name)
                    .map_err(|_| os_error("library name contains a NUL byte", 0))?;
                let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY) };
                NonNull::new(handle).ok_or_else(|| {
                    let msg = unsafe {
                        let err = libc::dlerror();
                        if err.is_null() {
                            "dlopen failed".to_string()
                        } else {
                            CStr::from_ptr(err).to_string_lossy().into_owned()
                        }
                    };
                    os_error(msg, 0)
                })
            }

            pub(super) fn lookup(handle: NonNull<c_void>, name: &str) -> Option<NonNull<c_void>> {
                let cname = CString::new(name).ok()?;
                NonNull::new(unsafe { libc::dlsym(handle.as_ptr(), cname.as_ptr()) })
            }

            pub(super) fn close(handle: NonNull<c_void>) {
                unsafe {
                    libc::dlclose(handle.as_ptr());
                }
            }
        }
    } else if #[cfg(windows)] {
        mod imp {
            use crate::{Result, error::os_error};
            use alloc::ffi::CString;
            use core::ffi::c_void;
            use core::ptr::NonNull;
            use windows_sys::Win32::Foundation::GetLastError;
            use windows_sys::Win32::System::LibraryLoader::{
                FreeLibrary, GetProcAddress, LoadLibraryA,
            };

            pub(super) fn open(name: &str) -> Result<NonNull<c_void>> {
                let cname = CString::new(name)
                    .map_err(|_| os_error("library name contains a NUL byte", 0))?;
                let handle = unsafe { LoadLibraryA(cname.as_ptr().cast()) };
                NonNull::new(handle.cast::<c_void>())
                    .ok_or_else(|| os_error("LoadLibraryA failed", unsafe { GetLastError() } as i32))
            }

            pub(super) fn lookup(handle: NonNull<c_void>, name: &str) -> Option<NonNull<c_void>> {
                let cname = CString::new(name).ok()?;
                let addr = unsafe { GetProcAddress(handle.as_ptr().cast(), cname.as_ptr().cast()) };
                addr.map(|addr| unsafe { NonNull::new_unchecked(addr as *mut c_void) })
            }

            pub(super) fn close(handle: NonNull<c_void>) {
                unsafe {
                    FreeLibrary(handle.as_ptr().cast());
                }
            }
        }
    } else {
        compile_error!("unsupported platform");
    }
}
