//! Typed views over ELF buffers.
//!
//! [`ElfImage`] wraps a raw byte region holding either a source file or a
//! loaded image and gives endian-correct, bounds-checked access to its
//! structures. The base of the region corresponds to RVA 0, i.e. the loaded
//! image uses `vbase`-relative addressing. [`ElfImageMut`] is the writable
//! flavour used for the loaded copy.

use super::{Ehdr, ElfClass, Phdr, Record, Shdr};
use crate::{
    Result,
    endian::{ByteOrder, Reader, Scalar, Writer},
    error::{invalid_image, out_of_range},
};
use alloc::vec::Vec;
use core::marker::PhantomData;
use elf::abi::{EI_CLASS, EI_DATA, ELFDATA2LSB, ELFDATA2MSB, ELFMAGIC, PT_DYNAMIC, PT_LOAD};

/// Round `value` up to a multiple of `align` (a power of two; 0 and 1 mean
/// no alignment).
#[inline]
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

#[inline]
pub(crate) fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| out_of_range("value exceeds the address width"))
}

/// Read-only view over an ELF buffer of class `C`.
pub(crate) struct ElfImage<C: ElfClass> {
    mem: *const u8,
    len: usize,
    order: ByteOrder,
    ehdr: Ehdr,
    phdrs: Vec<Phdr>,
    vbase: u64,
    vsize: u64,
    _class: PhantomData<C>,
}

impl<C: ElfClass> ElfImage<C> {
    /// Quick check that `bytes` starts an image of this class; the cheap
    /// gate used to dispatch between the 32- and 64-bit loaders.
    pub(crate) fn is_valid(bytes: &[u8]) -> bool {
        bytes.len() >= C::EHDR_SIZE
            && bytes[..4] == ELFMAGIC
            && bytes[EI_CLASS] == C::CLASS
    }

    /// Build a view over `len` bytes at `mem`, decoding the header and the
    /// program headers and computing the virtual layout.
    ///
    /// # Safety
    /// `mem` must stay valid and readable for `len` bytes for the lifetime
    /// of the view.
    pub(crate) unsafe fn from_raw(mem: *const u8, len: usize) -> Result<Self> {
        if len < C::EHDR_SIZE {
            return Err(invalid_image("image smaller than the elf header"));
        }
        let bytes = unsafe { core::slice::from_raw_parts(mem, len) };
        if bytes[..4] != ELFMAGIC {
            return Err(invalid_image("bad elf magic"));
        }
        if bytes[EI_CLASS] != C::CLASS {
            return Err(invalid_image("elf class mismatch"));
        }
        let order = match bytes[EI_DATA] {
            ELFDATA2LSB => ByteOrder::Little,
            ELFDATA2MSB => ByteOrder::Big,
            _ => return Err(invalid_image("unknown data encoding (EI_DATA)")),
        };

        let mut ehdr = Ehdr::default();
        C::ehdr(&mut ehdr, &mut Reader::new(bytes, order))?;

        let mut image = ElfImage {
            mem,
            len,
            order,
            ehdr,
            phdrs: Vec::new(),
            vbase: 0,
            vsize: 0,
            _class: PhantomData,
        };

        let mut phdrs = Vec::with_capacity(image.ehdr.e_phnum as usize);
        for idx in 0..image.ehdr.e_phnum as u64 {
            let offset = image.ehdr.e_phoff + idx * u64::from(image.ehdr.e_phentsize);
            phdrs.push(image.load_record::<Phdr>(offset)?);
        }
        image.phdrs = phdrs;

        // The virtual span: vbase is the lowest PT_LOAD address, vsize the
        // sum of every load's memory size rounded up to its alignment.
        let mut vbase = u64::MAX;
        let mut vsize = 0u64;
        for phdr in image.phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
            vbase = vbase.min(phdr.p_vaddr);
            vsize += align_up(phdr.p_memsz, phdr.p_align);
        }
        image.vbase = if vbase == u64::MAX { 0 } else { vbase };
        image.vsize = vsize;
        Ok(image)
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.mem, self.len) }
    }

    /// Borrow `len` bytes starting at `offset`.
    pub(crate) fn bytes_range(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let start = to_usize(offset)?;
        let end = start
            .checked_add(to_usize(len)?)
            .ok_or_else(|| out_of_range("range overflows"))?;
        self.bytes()
            .get(start..end)
            .ok_or_else(|| out_of_range("range past end of image"))
    }

    /// Endian-correct decode of a record at `offset`.
    pub(crate) fn load_record<T: Record<C>>(&self, offset: u64) -> Result<T> {
        let rest = self
            .bytes()
            .get(to_usize(offset)?..)
            .ok_or_else(|| out_of_range("record offset past end of image"))?;
        let mut value = T::default();
        value.transfer(&mut Reader::new(rest, self.order))?;
        Ok(value)
    }

    /// Endian-correct read of an integer at `offset`.
    pub(crate) fn read_int<T: Scalar>(&self, offset: u64) -> Result<T> {
        crate::endian::read_int(self.bytes(), to_usize(offset)?, self.order)
    }

    /// Read one address cell (`Elf_Addr`) at `offset`, widened to `u64`.
    pub(crate) fn read_addr(&self, offset: u64) -> Result<u64> {
        if C::ADDR_SIZE == 4 {
            self.read_int::<u32>(offset).map(u64::from)
        } else {
            self.read_int::<u64>(offset)
        }
    }

    /// Raw pointer to `offset` bytes into the buffer.
    pub(crate) fn offset_to_ptr(&self, offset: u64) -> Result<*const u8> {
        let offset = to_usize(offset)?;
        if offset >= self.len {
            return Err(out_of_range("offset past end of image"));
        }
        Ok(unsafe { self.mem.add(offset) })
    }

    /// Raw pointer to an RVA; the buffer base corresponds to RVA 0.
    #[inline]
    pub(crate) fn rva_to_ptr(&self, rva: u64) -> Result<*const u8> {
        self.offset_to_ptr(rva)
    }

    #[inline]
    pub(crate) fn ehdr(&self) -> &Ehdr {
        &self.ehdr
    }

    #[inline]
    pub(crate) fn phdrs(&self) -> &[Phdr] {
        &self.phdrs
    }

    /// Decode the section header table, if the image carries one.
    #[allow(dead_code)]
    pub(crate) fn shdrs(&self) -> Result<Vec<Shdr>> {
        let mut shdrs = Vec::with_capacity(self.ehdr.e_shnum as usize);
        if self.ehdr.e_shoff == 0 {
            return Ok(shdrs);
        }
        for idx in 0..self.ehdr.e_shnum as u64 {
            let offset = self.ehdr.e_shoff + idx * u64::from(self.ehdr.e_shentsize);
            shdrs.push(self.load_record::<Shdr>(offset)?);
        }
        Ok(shdrs)
    }

    /// The `PT_DYNAMIC` program header, present iff the image is dynamic.
    pub(crate) fn dynamic_phdr(&self) -> Option<&Phdr> {
        self.phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC)
    }

    /// Lowest `PT_LOAD` virtual address; RVAs are relative to it.
    #[inline]
    pub(crate) fn vbase(&self) -> u64 {
        self.vbase
    }

    /// Size of the region needed to hold every `PT_LOAD`.
    #[inline]
    pub(crate) fn vsize(&self) -> u64 {
        self.vsize
    }
}

/// Read/write view over a loaded image.
///
/// Writes go through raw pointers behind `&self`, matching how relocation
/// walks a table it is also patching.
pub(crate) struct ElfImageMut<C: ElfClass> {
    inner: ElfImage<C>,
}

impl<C: ElfClass> ElfImageMut<C> {
    /// # Safety
    /// `mem` must stay valid, readable and writable for `len` bytes for the
    /// lifetime of the view, and nothing else may alias it mutably.
    pub(crate) unsafe fn from_raw(mem: *mut u8, len: usize) -> Result<Self> {
        Ok(ElfImageMut {
            inner: unsafe { ElfImage::from_raw(mem, len)? },
        })
    }

    #[inline]
    fn bytes_mut(&self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.inner.mem as *mut u8, self.inner.len) }
    }

    /// Endian-correct encode of a record at `offset`.
    #[allow(dead_code)]
    pub(crate) fn store_record<T: Record<C>>(&self, offset: u64, mut value: T) -> Result<()> {
        let rest = self
            .bytes_mut()
            .get_mut(to_usize(offset)?..)
            .ok_or_else(|| out_of_range("record offset past end of image"))?;
        value.transfer(&mut Writer::new(rest, self.inner.order))
    }

    /// Endian-correct write of an integer at `offset`.
    pub(crate) fn write_int<T: Scalar>(&self, offset: u64, value: T) -> Result<()> {
        crate::endian::write_int(self.bytes_mut(), to_usize(offset)?, self.inner.order, value)
    }

    /// Mutable pointer to an RVA.
    pub(crate) fn rva_to_mut_ptr(&self, rva: u64) -> Result<*mut u8> {
        self.inner.rva_to_ptr(rva).map(|ptr| ptr as *mut u8)
    }
}

impl<C: ElfClass> core::ops::Deref for ElfImageMut<C> {
    type Target = ElfImage<C>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
