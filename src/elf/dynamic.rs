//! Parsing the `PT_DYNAMIC` segment.

use super::{Dyn, ElfClass, Phdr, image::ElfImage};
use crate::{
    Result,
    error::{invalid_image, unsupported},
};
use alloc::vec::Vec;
use elf::abi::*;

/// Which hash table the image carries, as an RVA.
pub(crate) enum HashKind {
    /// `.gnu.hash`; preferred when both are present.
    Gnu(u64),
    /// Classic `.hash`.
    Sysv(u64),
}

/// One relocation table: RVA, total byte size and entry size.
#[derive(Clone, Copy)]
pub(crate) struct RelRange {
    pub rva: u64,
    pub size: u64,
    pub entsize: u64,
}

impl RelRange {
    #[inline]
    pub(crate) fn count(&self) -> u64 {
        if self.entsize == 0 { 0 } else { self.size / self.entsize }
    }
}

/// Entry format of the PLT relocation table, from `DT_PLTREL`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum PltKind {
    Rel,
    Rela,
}

/// An init/fini/preinit function array: RVA and entry count.
#[derive(Clone, Copy)]
pub(crate) struct ArrayRange {
    pub rva: u64,
    pub count: u64,
}

/// Everything the loader needs out of the dynamic section, collected in one
/// linear scan of the `DT_*` entries.
pub(crate) struct DynamicTable {
    /// String table RVA and size (`DT_STRTAB`/`DT_STRSZ`).
    pub strtab: u64,
    pub strsz: u64,
    /// Symbol table RVA and entry size (`DT_SYMTAB`/`DT_SYMENT`).
    pub symtab: u64,
    pub syment: u64,
    /// Symbol hash table.
    pub hash: HashKind,
    /// `DT_REL` group.
    pub rel: Option<RelRange>,
    /// `DT_RELA` group.
    pub rela: Option<RelRange>,
    /// `DT_JMPREL` group, discriminated by `DT_PLTREL`.
    pub plt: Option<(PltKind, RelRange)>,
    /// `DT_INIT` / `DT_FINI`, as RVAs.
    pub init: Option<u64>,
    pub fini: Option<u64>,
    pub init_array: Option<ArrayRange>,
    pub fini_array: Option<ArrayRange>,
    pub preinit_array: Option<ArrayRange>,
    /// `DT_NEEDED` entries, as string table offsets in declaration order.
    pub needed: Vec<u64>,
}

impl DynamicTable {
    /// Scan the dynamic entries described by `phdr` in the loaded image.
    pub(crate) fn parse<C: ElfClass>(image: &ElfImage<C>, phdr: &Phdr) -> Result<Self> {
        debug_assert_eq!(phdr.p_type, PT_DYNAMIC);
        let vbase = image.vbase();
        // A d_ptr value is a virtual address; the view is RVA-addressed.
        let to_rva = |value: u64| {
            value
                .checked_sub(vbase)
                .ok_or_else(|| invalid_image("dynamic entry address below the image base"))
        };
        let table_rva = to_rva(phdr.p_vaddr)?;
        let entries = phdr.p_memsz / C::DYN_SIZE as u64;

        let mut strtab = None;
        let mut strsz = None;
        let mut symtab = None;
        let mut syment = None;
        let mut sysv_hash = None;
        let mut gnu_hash = None;
        let mut rel_off = None;
        let mut rel_size = 0;
        let mut rel_ent = C::REL_SIZE as u64;
        let mut rela_off = None;
        let mut rela_size = 0;
        let mut rela_ent = C::RELA_SIZE as u64;
        let mut jmprel_off = None;
        let mut pltrel_size = 0;
        let mut pltrel_kind = None;
        let mut init = None;
        let mut fini = None;
        let mut init_array = None;
        let mut init_array_size = 0;
        let mut fini_array = None;
        let mut fini_array_size = 0;
        let mut preinit_array = None;
        let mut preinit_array_size = 0;
        let mut needed = Vec::new();

        for idx in 0..entries {
            let entry: Dyn = image.load_record(table_rva + idx * C::DYN_SIZE as u64)?;
            match entry.d_tag {
                DT_NULL => break,
                DT_STRTAB => strtab = Some(to_rva(entry.d_val)?),
                DT_STRSZ => strsz = Some(entry.d_val),
                DT_SYMTAB => symtab = Some(to_rva(entry.d_val)?),
                DT_SYMENT => syment = Some(entry.d_val),
                DT_HASH => sysv_hash = Some(to_rva(entry.d_val)?),
                DT_GNU_HASH => gnu_hash = Some(to_rva(entry.d_val)?),
                DT_REL => rel_off = Some(to_rva(entry.d_val)?),
                DT_RELSZ => rel_size = entry.d_val,
                DT_RELENT => rel_ent = entry.d_val,
                DT_RELA => rela_off = Some(to_rva(entry.d_val)?),
                DT_RELASZ => rela_size = entry.d_val,
                DT_RELAENT => rela_ent = entry.d_val,
                DT_JMPREL => jmprel_off = Some(to_rva(entry.d_val)?),
                DT_PLTRELSZ => pltrel_size = entry.d_val,
                DT_PLTREL => {
                    pltrel_kind = Some(if entry.d_val == DT_RELA as u64 {
                        PltKind::Rela
                    } else {
                        PltKind::Rel
                    })
                }
                DT_INIT => init = Some(to_rva(entry.d_val)?),
                DT_FINI => fini = Some(to_rva(entry.d_val)?),
                DT_INIT_ARRAY => init_array = Some(to_rva(entry.d_val)?),
                DT_INIT_ARRAYSZ => init_array_size = entry.d_val,
                DT_FINI_ARRAY => fini_array = Some(to_rva(entry.d_val)?),
                DT_FINI_ARRAYSZ => fini_array_size = entry.d_val,
                DT_PREINIT_ARRAY => preinit_array = Some(to_rva(entry.d_val)?),
                DT_PREINIT_ARRAYSZ => preinit_array_size = entry.d_val,
                DT_NEEDED => needed.push(entry.d_val),
                _ => {}
            }
        }

        let strtab = strtab.ok_or_else(|| invalid_image("dynamic table has no DT_STRTAB"))?;
        let strsz = strsz.ok_or_else(|| invalid_image("dynamic table has no DT_STRSZ"))?;
        let symtab = symtab.ok_or_else(|| invalid_image("dynamic table has no DT_SYMTAB"))?;
        let syment = syment
            .filter(|&ent| ent != 0)
            .ok_or_else(|| invalid_image("dynamic table has no DT_SYMENT"))?;
        let hash = if let Some(rva) = gnu_hash {
            HashKind::Gnu(rva)
        } else if let Some(rva) = sysv_hash {
            HashKind::Sysv(rva)
        } else {
            return Err(unsupported(
                "dynamic table has neither DT_GNU_HASH nor DT_HASH",
            ));
        };

        let rel = rel_off.map(|rva| RelRange {
            rva,
            size: rel_size,
            entsize: rel_ent,
        });
        let rela = rela_off.map(|rva| RelRange {
            rva,
            size: rela_size,
            entsize: rela_ent,
        });
        let plt = match jmprel_off {
            Some(rva) => {
                let kind = pltrel_kind
                    .ok_or_else(|| invalid_image("DT_JMPREL without a DT_PLTREL discriminator"))?;
                let entsize = match kind {
                    PltKind::Rel => rel_ent,
                    PltKind::Rela => rela_ent,
                };
                Some((
                    kind,
                    RelRange {
                        rva,
                        size: pltrel_size,
                        entsize,
                    },
                ))
            }
            None => None,
        };

        let array = |rva: Option<u64>, size: u64| {
            rva.map(|rva| ArrayRange {
                rva,
                count: size / C::ADDR_SIZE as u64,
            })
        };

        Ok(DynamicTable {
            strtab,
            strsz,
            symtab,
            syment,
            hash,
            rel,
            rela,
            plt,
            init,
            fini,
            init_array: array(init_array, init_array_size),
            fini_array: array(fini_array, fini_array_size),
            preinit_array: array(preinit_array, preinit_array_size),
            needed,
        })
    }
}
