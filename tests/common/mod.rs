#![allow(dead_code)]
//! Synthesizes minimal ELF64 shared objects in memory for the loader tests.
//!
//! The layout is fixed: one read+execute load covering the headers, tables
//! and text, one read+write load for data, and a `PT_DYNAMIC` describing
//! them. Tests position symbols and relocations against the constants
//! below.

use elf::abi::*;
use memdl::Module;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;

pub const PHDR_OFF: u64 = 0x40;
pub const STRTAB_OFF: u64 = 0x100;
pub const SYMTAB_OFF: u64 = 0x200;
pub const HASH_OFF: u64 = 0x300;
pub const RELA_OFF: u64 = 0x380;
pub const JMPREL_OFF: u64 = 0x400;
pub const INIT_ARRAY_OFF: u64 = 0x480;
pub const FINI_ARRAY_OFF: u64 = 0x4c0;
pub const PREINIT_ARRAY_OFF: u64 = 0x500;
pub const DYNAMIC_OFF: u64 = 0x540;
pub const TEXT_VADDR: u64 = 0x700;
pub const LOAD0_SIZE: u64 = 0x800;
pub const DATA_VADDR: u64 = 0x1000;

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

struct SymSpec {
    name_off: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

pub struct DylibBuilder {
    strtab: Vec<u8>,
    syms: Vec<SymSpec>,
    relas: Vec<(u64, u32, u32, i64)>,
    plt_relas: Vec<(u64, u32, u32, i64)>,
    needed: Vec<u32>,
    text: Vec<u8>,
    data: Vec<u8>,
    bss: u64,
    init: Option<u64>,
    fini: Option<u64>,
    init_array: Vec<u64>,
    fini_array: Vec<u64>,
    preinit_array: Vec<u64>,
    entry: u64,
    with_hash: bool,
    e_type: u16,
    e_machine: u16,
}

impl DylibBuilder {
    pub fn new() -> Self {
        DylibBuilder {
            strtab: vec![0],
            syms: Vec::new(),
            relas: Vec::new(),
            plt_relas: Vec::new(),
            needed: Vec::new(),
            text: Vec::new(),
            data: Vec::new(),
            bss: 0,
            init: None,
            fini: None,
            init_array: Vec::new(),
            fini_array: Vec::new(),
            preinit_array: Vec::new(),
            entry: 0,
            with_hash: true,
            e_type: ET_DYN,
            e_machine: EM_X86_64,
        }
    }

    fn add_str(&mut self, s: &str) -> u32 {
        let off = self.strtab.len() as u32;
        self.strtab.extend_from_slice(s.as_bytes());
        self.strtab.push(0);
        off
    }

    fn add_sym(&mut self, name: &str, info: u8, shndx: u16, value: u64, size: u64) -> u32 {
        let name_off = self.add_str(name);
        self.syms.push(SymSpec {
            name_off,
            info,
            shndx,
            value,
            size,
        });
        // Index 0 is the null symbol.
        self.syms.len() as u32
    }

    pub fn export_object(&mut self, name: &str, value: u64, size: u64) -> u32 {
        self.add_sym(name, (STB_GLOBAL << 4) | STT_OBJECT, 1, value, size)
    }

    pub fn export_func(&mut self, name: &str, value: u64, size: u64) -> u32 {
        self.add_sym(name, (STB_GLOBAL << 4) | STT_FUNC, 1, value, size)
    }

    pub fn import_object(&mut self, name: &str, weak: bool) -> u32 {
        let bind = if weak { STB_WEAK } else { STB_GLOBAL };
        self.add_sym(name, (bind << 4) | STT_OBJECT, 0, 0, 0)
    }

    pub fn import_func(&mut self, name: &str, weak: bool) -> u32 {
        let bind = if weak { STB_WEAK } else { STB_GLOBAL };
        self.add_sym(name, (bind << 4) | STT_FUNC, 0, 0, 0)
    }

    pub fn needed(&mut self, name: &str) {
        let off = self.add_str(name);
        self.needed.push(off);
    }

    pub fn rela(&mut self, offset: u64, ty: u32, sym: u32, addend: i64) {
        self.relas.push((offset, ty, sym, addend));
    }

    pub fn plt_rela(&mut self, offset: u64, ty: u32, sym: u32, addend: i64) {
        self.plt_relas.push((offset, ty, sym, addend));
    }

    pub fn text(&mut self, text: Vec<u8>) {
        self.text = text;
    }

    pub fn data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn bss(&mut self, size: u64) {
        self.bss = size;
    }

    pub fn init(&mut self, vaddr: u64) {
        self.init = Some(vaddr);
    }

    pub fn fini(&mut self, vaddr: u64) {
        self.fini = Some(vaddr);
    }

    pub fn init_array_entry(&mut self, value: u64) {
        self.init_array.push(value);
    }

    pub fn fini_array_entry(&mut self, value: u64) {
        self.fini_array.push(value);
    }

    pub fn preinit_array_entry(&mut self, value: u64) {
        self.preinit_array.push(value);
    }

    pub fn entry(&mut self, vaddr: u64) {
        self.entry = vaddr;
    }

    pub fn without_hash(&mut self) {
        self.with_hash = false;
    }

    pub fn e_type(&mut self, e_type: u16) {
        self.e_type = e_type;
    }

    pub fn e_machine(&mut self, e_machine: u16) {
        self.e_machine = e_machine;
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(self.strtab.len() <= 0x100, "string table overflow");
        assert!(1 + self.syms.len() <= 10, "symbol table overflow");
        assert!(self.relas.len() <= 5, "rela table overflow");
        assert!(self.plt_relas.len() <= 5, "plt rela table overflow");
        assert!(self.text.len() <= 0x100, "text overflow");
        assert!(self.init_array.len() <= 8, "init array overflow");
        assert!(self.fini_array.len() <= 8, "fini array overflow");
        assert!(self.preinit_array.len() <= 8, "preinit array overflow");

        // The dynamic entries, fixed before the program headers need their
        // total size.
        let mut dynent: Vec<(i64, u64)> = vec![
            (DT_STRTAB, STRTAB_OFF),
            (DT_STRSZ, self.strtab.len() as u64),
            (DT_SYMTAB, SYMTAB_OFF),
            (DT_SYMENT, 24),
        ];
        if self.with_hash {
            dynent.push((DT_HASH, HASH_OFF));
        }
        for &off in &self.needed {
            dynent.push((DT_NEEDED, off as u64));
        }
        if !self.relas.is_empty() {
            dynent.push((DT_RELA, RELA_OFF));
            dynent.push((DT_RELASZ, self.relas.len() as u64 * 24));
            dynent.push((DT_RELAENT, 24));
        }
        if !self.plt_relas.is_empty() {
            dynent.push((DT_JMPREL, JMPREL_OFF));
            dynent.push((DT_PLTRELSZ, self.plt_relas.len() as u64 * 24));
            dynent.push((DT_PLTREL, DT_RELA as u64));
        }
        if let Some(vaddr) = self.init {
            dynent.push((DT_INIT, vaddr));
        }
        if let Some(vaddr) = self.fini {
            dynent.push((DT_FINI, vaddr));
        }
        if !self.init_array.is_empty() {
            dynent.push((DT_INIT_ARRAY, INIT_ARRAY_OFF));
            dynent.push((DT_INIT_ARRAYSZ, self.init_array.len() as u64 * 8));
        }
        if !self.fini_array.is_empty() {
            dynent.push((DT_FINI_ARRAY, FINI_ARRAY_OFF));
            dynent.push((DT_FINI_ARRAYSZ, self.fini_array.len() as u64 * 8));
        }
        if !self.preinit_array.is_empty() {
            dynent.push((DT_PREINIT_ARRAY, PREINIT_ARRAY_OFF));
            dynent.push((DT_PREINIT_ARRAYSZ, self.preinit_array.len() as u64 * 8));
        }
        dynent.push((DT_NULL, 0));
        let dyn_size = dynent.len() as u64 * 16;
        assert!(DYNAMIC_OFF + dyn_size <= TEXT_VADDR, "dynamic table overflow");

        let data_memsz = self.data.len() as u64 + self.bss;
        let mut buf = vec![0u8; 0x1000 + self.data.len()];

        // File header.
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1;
        put16(&mut buf, 16, self.e_type);
        put16(&mut buf, 18, self.e_machine);
        put32(&mut buf, 20, 1);
        put64(&mut buf, 24, self.entry);
        put64(&mut buf, 32, PHDR_OFF);
        put16(&mut buf, 52, 64);
        put16(&mut buf, 54, 56);
        put16(&mut buf, 56, 3);
        put16(&mut buf, 58, 64);

        // Program headers.
        let phdr = |buf: &mut [u8],
                    idx: usize,
                    p_type: u32,
                    flags: u32,
                    offset: u64,
                    vaddr: u64,
                    filesz: u64,
                    memsz: u64,
                    align: u64| {
            let base = PHDR_OFF as usize + idx * 56;
            put32(buf, base, p_type);
            put32(buf, base + 4, flags);
            put64(buf, base + 8, offset);
            put64(buf, base + 16, vaddr);
            put64(buf, base + 24, vaddr);
            put64(buf, base + 32, filesz);
            put64(buf, base + 40, memsz);
            put64(buf, base + 48, align);
        };
        phdr(&mut buf, 0, PT_LOAD, PF_R | PF_X, 0, 0, LOAD0_SIZE, LOAD0_SIZE, 0x1000);
        phdr(
            &mut buf,
            1,
            PT_LOAD,
            PF_R | PF_W,
            0x1000,
            DATA_VADDR,
            self.data.len() as u64,
            data_memsz,
            0x1000,
        );
        phdr(
            &mut buf,
            2,
            PT_DYNAMIC,
            PF_R,
            DYNAMIC_OFF,
            DYNAMIC_OFF,
            dyn_size,
            dyn_size,
            8,
        );

        // String table.
        let strtab_off = STRTAB_OFF as usize;
        buf[strtab_off..strtab_off + self.strtab.len()].copy_from_slice(&self.strtab);

        // Symbol table; index 0 stays all-zero.
        for (idx, sym) in self.syms.iter().enumerate() {
            let base = SYMTAB_OFF as usize + (idx + 1) * 24;
            put32(&mut buf, base, sym.name_off);
            buf[base + 4] = sym.info;
            buf[base + 5] = 0;
            put16(&mut buf, base + 6, sym.shndx);
            put64(&mut buf, base + 8, sym.value);
            put64(&mut buf, base + 16, sym.size);
        }

        // Classic hash table: one bucket chaining every symbol, so lookup
        // degrades to a linear walk regardless of the hash values.
        let nsyms = self.syms.len() as u32 + 1;
        let hash_off = HASH_OFF as usize;
        put32(&mut buf, hash_off, 1);
        put32(&mut buf, hash_off + 4, nsyms);
        put32(&mut buf, hash_off + 8, if nsyms > 1 { 1 } else { 0 });
        for idx in 0..nsyms {
            let next = if idx != 0 && idx + 1 < nsyms { idx + 1 } else { 0 };
            put32(&mut buf, hash_off + 12 + idx as usize * 4, next);
        }

        // Relocation tables.
        let mut write_relas = |table_off: usize, relas: &[(u64, u32, u32, i64)]| {
            for (idx, &(offset, ty, sym, addend)) in relas.iter().enumerate() {
                let base = table_off + idx * 24;
                put64(&mut buf, base, offset);
                put64(&mut buf, base + 8, (u64::from(sym) << 32) | u64::from(ty));
                put64(&mut buf, base + 16, addend as u64);
            }
        };
        write_relas(RELA_OFF as usize, &self.relas);
        write_relas(JMPREL_OFF as usize, &self.plt_relas);

        // Init/fini/preinit arrays.
        for (table_off, entries) in [
            (INIT_ARRAY_OFF, &self.init_array),
            (FINI_ARRAY_OFF, &self.fini_array),
            (PREINIT_ARRAY_OFF, &self.preinit_array),
        ] {
            for (idx, &value) in entries.iter().enumerate() {
                put64(&mut buf, table_off as usize + idx * 8, value);
            }
        }

        // Dynamic table.
        for (idx, &(tag, value)) in dynent.iter().enumerate() {
            let base = DYNAMIC_OFF as usize + idx * 16;
            put64(&mut buf, base, tag as u64);
            put64(&mut buf, base + 8, value);
        }

        // Text and data.
        let text_off = TEXT_VADDR as usize;
        buf[text_off..text_off + self.text.len()].copy_from_slice(&self.text);
        buf[0x1000..].copy_from_slice(&self.data);

        buf
    }
}

/// `mov eax, imm32; ret`
pub fn code_ret_imm32(imm: u32) -> Vec<u8> {
    let mut code = vec![0xb8];
    code.extend_from_slice(&imm.to_le_bytes());
    code.push(0xc3);
    code
}

/// `mov rax, [rip+slot]; shl dword ptr [rax], 4; or dword ptr [rax], imm8; ret`
///
/// Shifts a nibble into the counter the slot points at, so a sequence of
/// calls leaves a digit trail proving their order.
pub fn code_shift_or(slot_vaddr: u64, fn_vaddr: u64, nibble: u8) -> Vec<u8> {
    let disp = (slot_vaddr as i64 - (fn_vaddr as i64 + 7)) as i32;
    let mut code = vec![0x48, 0x8b, 0x05];
    code.extend_from_slice(&disp.to_le_bytes());
    code.extend_from_slice(&[0xc1, 0x20, 0x04]);
    code.extend_from_slice(&[0x83, 0x08, nibble]);
    code.push(0xc3);
    code
}

/// `jmp [rip+slot]`, a one-entry PLT.
pub fn code_jmp_slot(slot_vaddr: u64, fn_vaddr: u64) -> Vec<u8> {
    let disp = (slot_vaddr as i64 - (fn_vaddr as i64 + 6)) as i32;
    let mut code = vec![0xff, 0x25];
    code.extend_from_slice(&disp.to_le_bytes());
    code
}

/// A module backed by a plain name → address table, standing in for a real
/// dependency in tests.
pub struct TableModule {
    entries: HashMap<String, usize>,
}

impl TableModule {
    pub fn new() -> Self {
        TableModule {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, addr: usize) {
        self.entries.insert(name.to_string(), addr);
    }
}

impl Module for TableModule {
    fn get_raw_proc(&self, name: &str) -> Option<NonNull<c_void>> {
        self.entries
            .get(name)
            .and_then(|&addr| NonNull::new(addr as *mut c_void))
    }

    fn get_raw_data(&self, name: &str) -> Option<NonNull<c_void>> {
        self.get_raw_proc(name)
    }
}
