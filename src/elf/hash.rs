//! Symbol hash tables, classic (`DT_HASH`) and GNU (`DT_GNU_HASH`).
//!
//! Both variants answer the same question: does this image export a symbol
//! with this name, and if so which symbol table entry is it.

use super::{
    ElfClass, GnuHashHeader, HashHeader, Sym,
    dynamic::HashKind,
    image::ElfImage,
    symbol::{StringTable, SymbolTable},
};
use crate::{Result, error::invalid_image};

/// The PJW-style hash used by classic ELF hash tables.
pub(crate) fn elf_hash(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in name {
        hash = (hash << 4).wrapping_add(u32::from(byte));
        let high = hash & 0xf000_0000;
        if high != 0 {
            hash ^= high >> 24;
        }
        hash &= !high;
    }
    hash
}

/// The DJB-style hash used by GNU hash tables.
pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for &byte in name {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

/// A parsed hash table over the loaded image.
pub(crate) enum HashTable {
    Sysv {
        header: HashHeader,
        buckets: u64,
        chains: u64,
    },
    Gnu {
        header: GnuHashHeader,
        blooms: u64,
        buckets: u64,
        chains: u64,
    },
}

impl HashTable {
    pub(crate) fn parse<C: ElfClass>(image: &ElfImage<C>, kind: &HashKind) -> Result<Self> {
        match kind {
            HashKind::Sysv(rva) => {
                let header: HashHeader = image.load_record(*rva)?;
                let buckets = rva + 8;
                let chains = buckets + u64::from(header.nbucket) * 4;
                Ok(HashTable::Sysv {
                    header,
                    buckets,
                    chains,
                })
            }
            HashKind::Gnu(rva) => {
                let header: GnuHashHeader = image.load_record(*rva)?;
                // The Bloom filter words between the header and the buckets
                // are address-sized.
                let blooms = rva + 16;
                let buckets = blooms + u64::from(header.maskwords) * C::ADDR_SIZE as u64;
                let chains = buckets + u64::from(header.nbucket) * 4;
                Ok(HashTable::Gnu {
                    header,
                    blooms,
                    buckets,
                    chains,
                })
            }
        }
    }

    /// Look `name` up, returning its symbol table entry if present.
    pub(crate) fn find_symbol<C: ElfClass>(
        &self,
        image: &ElfImage<C>,
        sym_table: &SymbolTable,
        str_table: &StringTable,
        name: &str,
    ) -> Result<Option<Sym>> {
        match self {
            HashTable::Sysv {
                header,
                buckets,
                chains,
            } => {
                if header.nbucket == 0 {
                    return Ok(None);
                }
                let hash = elf_hash(name.as_bytes());
                let bucket = buckets + u64::from(hash % header.nbucket) * 4;
                let mut index = image.read_int::<u32>(bucket)?;
                // nchain bounds the walk; a longer chain is corrupt.
                let mut remaining = header.nchain;
                while index != 0 && remaining != 0 {
                    let sym = sym_table.get(image, u64::from(index))?;
                    if str_table.get_bytes(image, u64::from(sym.st_name))? == name.as_bytes() {
                        return Ok(Some(sym));
                    }
                    index = image.read_int::<u32>(chains + u64::from(index) * 4)?;
                    remaining -= 1;
                }
                Ok(None)
            }
            HashTable::Gnu {
                header,
                blooms,
                buckets,
                chains,
            } => {
                if header.nbucket == 0 {
                    return Ok(None);
                }
                let hash = gnu_hash(name.as_bytes());
                // Two bits per symbol, from the hash and its shifted form;
                // a miss here is a definitive absence.
                if header.maskwords != 0 {
                    let word_bits = C::ADDR_SIZE as u32 * 8;
                    let index = (hash / word_bits) % header.maskwords;
                    let word =
                        image.read_addr(blooms + u64::from(index) * C::ADDR_SIZE as u64)?;
                    let mask = (1u64 << (hash % word_bits))
                        | (1u64 << ((hash >> header.shift) % word_bits));
                    if word & mask != mask {
                        return Ok(None);
                    }
                }
                let bucket = buckets + u64::from(hash % header.nbucket) * 4;
                let mut index = image.read_int::<u32>(bucket)?;
                if index == 0 {
                    return Ok(None);
                }
                loop {
                    let chain_index = index.checked_sub(header.symndx).ok_or_else(|| {
                        invalid_image("gnu hash bucket points below the chain base")
                    })?;
                    let chain_hash =
                        image.read_int::<u32>(chains + u64::from(chain_index) * 4)?;
                    // The low bit flags the end of the chain; the other 31
                    // bits are the symbol's hash.
                    if (chain_hash ^ hash) & !1 == 0 {
                        let sym = sym_table.get(image, u64::from(index))?;
                        if str_table.get_bytes(image, u64::from(sym.st_name))? == name.as_bytes() {
                            return Ok(Some(sym));
                        }
                    }
                    if chain_hash & 1 != 0 {
                        return Ok(None);
                    }
                    index += 1;
                }
            }
        }
    }
}
