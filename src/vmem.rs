//! Page-granular virtual memory management.
//!
//! Thin wrapper over the host allocator (`mmap` on unix, `VirtualAlloc` on
//! windows) used to reserve, reprotect and release the regions that loaded
//! images live in. Failures carry the OS-native error code.

use crate::Result;
use bitflags::bitflags;
use core::ptr::NonNull;

/// Page size assumed for segment mapping and protection.
pub(crate) const PAGE_SIZE: usize = 0x1000;

/// Mask used to align addresses down to page boundaries.
pub(crate) const PAGE_MASK: usize = !(PAGE_SIZE - 1);

bitflags! {
    /// Access mode of a region, the in-memory form of the ELF `PF_*` bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MemAccess: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Reserve and commit `size` bytes, ideally at `preferred_base`.
///
/// The preferred address is a hint; when it cannot be honoured the region is
/// placed at an arbitrary address and callers must relocate accordingly.
pub fn alloc(size: usize, preferred_base: usize, access: MemAccess) -> Result<NonNull<u8>> {
    imp::alloc(size, preferred_base, access)
}

/// Change the access mode of an allocated region.
///
/// Accepts every combination the ELF `PF_*` bits map to, including
/// read-only-executable.
pub fn protect(ptr: NonNull<u8>, size: usize, access: MemAccess) -> Result<()> {
    imp::protect(ptr, size, access)
}

/// Release a region previously returned by [`alloc()`].
pub fn free(ptr: NonNull<u8>, size: usize) -> Result<()> {
    imp::free(ptr, size)
}

/// An owned allocation, released on drop.
pub(crate) struct VmemBlock {
    ptr: NonNull<u8>,
    size: usize,
}

impl VmemBlock {
    pub(crate) fn alloc(size: usize, preferred_base: usize, access: MemAccess) -> Result<Self> {
        let ptr = alloc(size, preferred_base, access)?;
        Ok(VmemBlock { ptr, size })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size
    }

    /// Reprotect `len` bytes starting `offset` bytes into the block.
    pub(crate) fn protect(&self, offset: usize, len: usize, access: MemAccess) -> Result<()> {
        debug_assert!(offset % PAGE_SIZE == 0 && offset + len <= self.size);
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        protect(ptr, len, access)
    }
}

impl Drop for VmemBlock {
    fn drop(&mut self) {
        let _ = free(self.ptr, self.size);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use super::MemAccess;
            use crate::{Result, error::os_error};
            use core::ffi::c_void;
            use core::ptr::{NonNull, null_mut};
            use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, mmap, mprotect, munmap};

            cfg_if::cfg_if! {
                if #[cfg(any(target_os = "linux", target_os = "android"))] {
                    fn errno() -> i32 {
                        unsafe { *libc::__errno_location() }
                    }
                } else if #[cfg(any(target_os = "macos", target_os = "ios"))] {
                    fn errno() -> i32 {
                        unsafe { *libc::__error() }
                    }
                } else {
                    fn errno() -> i32 {
                        0
                    }
                }
            }

            fn prot_bits(access: MemAccess) -> i32 {
                let mut prot = libc::PROT_NONE;
                if access.contains(MemAccess::READ) {
                    prot |= libc::PROT_READ;
                }
                if access.contains(MemAccess::WRITE) {
                    prot |= libc::PROT_WRITE;
                }
                if access.contains(MemAccess::EXEC) {
                    prot |= libc::PROT_EXEC;
                }
                prot
            }

            pub(super) fn alloc(
                size: usize,
                preferred_base: usize,
                access: MemAccess,
            ) -> Result<NonNull<u8>> {
                let prot = prot_bits(access);
                let flags = MAP_PRIVATE | MAP_ANONYMOUS;
                let hint = preferred_base as *mut c_void;
                let mut ptr = unsafe { mmap(hint, size, prot, flags, -1, 0) };
                if ptr == MAP_FAILED && !hint.is_null() {
                    // The preferred base is only a wish.
                    ptr = unsafe { mmap(null_mut(), size, prot, flags, -1, 0) };
                }
                if ptr == MAP_FAILED {
                    return Err(os_error("mmap failed", errno()));
                }
                Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
            }

            pub(super) fn protect(ptr: NonNull<u8>, size: usize, access: MemAccess) -> Result<()> {
                let res = unsafe { mprotect(ptr.as_ptr().cast(), size, prot_bits(access)) };
                if res != 0 {
                    return Err(os_error("mprotect failed", errno()));
                }
                Ok(())
            }

            pub(super) fn free(ptr: NonNull<u8>, size: usize) -> Result<()> {
                let res = unsafe { munmap(ptr.as_ptr().cast(), size) };
                if res != 0 {
                    return Err(os_error("munmap failed", errno()));
                }
                Ok(())
            }
        }
    } else if #[cfg(windows)] {
        mod imp {
            use super::MemAccess;
            use crate::{Result, error::os_error};
            use core::ffi::c_void;
            use core::ptr::{NonNull, null_mut};
            use windows_sys::Win32::Foundation::GetLastError;
            use windows_sys::Win32::System::Memory::{
                MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
                PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
                VirtualAlloc, VirtualFree, VirtualProtect,
            };

            fn page_bits(access: MemAccess) -> u32 {
                let exec = access.contains(MemAccess::EXEC);
                // Windows has no write-only or write-execute modes; writable
                // regions are always readable as well.
                if access.contains(MemAccess::WRITE) {
                    if exec { PAGE_EXECUTE_READWRITE } else { PAGE_READWRITE }
                } else if access.contains(MemAccess::READ) {
                    if exec { PAGE_EXECUTE_READ } else { PAGE_READONLY }
                } else if exec {
                    PAGE_EXECUTE
                } else {
                    PAGE_NOACCESS
                }
            }

            pub(super) fn alloc(
                size: usize,
                preferred_base: usize,
                access: MemAccess,
            ) -> Result<NonNull<u8>> {
                let page = page_bits(access);
                let hint = preferred_base as *mut c_void;
                let mut ptr =
                    unsafe { VirtualAlloc(hint, size, MEM_RESERVE | MEM_COMMIT, page) };
                if ptr.is_null() && !hint.is_null() {
                    ptr = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, page) };
                }
                if ptr.is_null() {
                    return Err(os_error("VirtualAlloc failed", unsafe { GetLastError() } as i32));
                }
                Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
            }

            pub(super) fn protect(ptr: NonNull<u8>, size: usize, access: MemAccess) -> Result<()> {
                let mut old = 0u32;
                let ok = unsafe {
                    VirtualProtect(ptr.as_ptr().cast(), size, page_bits(access), &mut old)
                };
                if ok == 0 {
                    return Err(os_error("VirtualProtect failed", unsafe { GetLastError() } as i32));
                }
                Ok(())
            }

            pub(super) fn free(ptr: NonNull<u8>, _size: usize) -> Result<()> {
                // MEM_RELEASE always frees the whole allocation and requires
                // a zero size argument.
                let ok = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
                if ok == 0 {
                    return Err(os_error("VirtualFree failed", unsafe { GetLastError() } as i32));
                }
                Ok(())
            }
        }
    } else {
        compile_error!("unsupported platform");
    }
}
