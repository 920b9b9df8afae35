//! The object assembler: byte buffers, symbols, labels and relocations.
//!
//! One `Assembler` accumulates everything a module compilation produces:
//! lazily-created sections, a symbol table split into local and global
//! halves, per-function labels with pending-fixup lists, relocations, the
//! `.eh_frame` stream and the exception tables. `build_object` serializes
//! the result into a relocatable ELF64 image; `capstan-jit` consumes that
//! image for in-memory mapping.
//!
//! Labels are cheap per-function tokens. A label is either placed (its
//! text offset is known) or pending with a singly-linked list of fixups
//! threaded through a free-list-managed side table; placing the label
//! patches all recorded fixups.

mod eh;
pub mod elf;
mod lsda;
mod writer;

pub use eh::TargetInfo;
pub use lsda::CallSiteInfo;
pub(crate) use writer::{write_sleb, write_uleb, uleb_len};

use cranelift_entity::entity_impl;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

/// Reference to a section.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecRef(u32);
entity_impl!(SecRef, "sec");

/// Reference to a symbol. The high bit distinguishes the global half of
/// the symbol table from the local half. The default value names the null
/// symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymRef(u32);

const SYM_GLOBAL_BIT: u32 = 0x8000_0000;

impl SymRef {
    fn local(idx: usize) -> Self {
        debug_assert!((idx as u32) < SYM_GLOBAL_BIT);
        SymRef(idx as u32)
    }

    fn global(idx: usize) -> Self {
        debug_assert!((idx as u32) < SYM_GLOBAL_BIT);
        SymRef(idx as u32 | SYM_GLOBAL_BIT)
    }

    pub fn is_local(self) -> bool {
        self.0 & SYM_GLOBAL_BIT == 0
    }

    pub(crate) fn half_idx(self) -> usize {
        (self.0 & !SYM_GLOBAL_BIT) as usize
    }
}

impl core::fmt::Debug for SymRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_local() {
            write!(f, "lsym{}", self.half_idx())
        } else {
            write!(f, "gsym{}", self.half_idx())
        }
    }
}

/// A per-function code label.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// Symbol binding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymBinding {
    Local,
    Global,
    Weak,
}

/// How a pending label fixup patches the instruction stream once the label
/// is placed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FixupKind {
    /// 32-bit PC-relative displacement relative to the end of the field.
    Rel32,
    /// AArch64 26-bit branch displacement (B/BL), scaled by 4.
    Aarch64Branch26,
    /// AArch64 19-bit conditional-branch displacement, scaled by 4.
    Aarch64Cond19,
}

/// A relocation against a symbol, stored per section and emitted into the
/// matching `.rela.*` section.
#[derive(Clone, Copy, Debug)]
pub struct Reloc {
    pub off: u64,
    pub sym: SymRef,
    /// Raw ELF relocation type for the configured machine.
    pub kind: u32,
    pub addend: i64,
}

pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
    pub data: Vec<u8>,
    /// Size for `SHT_NOBITS` sections, which carry no data bytes.
    pub nobits_size: u64,
    pub relocs: Vec<Reloc>,
    /// This section's section symbol.
    pub sym: SymRef,
    /// Containing COMDAT group, if any.
    pub group: PackedOption<SecRef>,
    /// For `SHT_GROUP`: the signature symbol.
    pub signature: Option<SymRef>,
    /// For `SHT_GROUP`: the member sections.
    pub members: Vec<SecRef>,
}

pub(crate) struct Symbol {
    pub name_off: u32,
    /// ELF `st_info` (binding and type).
    pub info: u8,
    pub section: PackedOption<SecRef>,
    pub value: u64,
    pub size: u64,
}

struct TempSymbol {
    /// Offset in the text section, or `!0` while pending.
    off: u32,
    /// Head of the pending fixup list, or `!0`.
    fixup_head: u32,
}

struct Fixup {
    section: SecRef,
    next: u32,
    off: u32,
    kind: FixupKind,
}

const NO_ENTRY: u32 = !0;

pub struct Assembler {
    target: &'static TargetInfo,
    pub(crate) sections: PrimaryMap<SecRef, Section>,
    pub(crate) local_symbols: Vec<Symbol>,
    pub(crate) global_symbols: Vec<Symbol>,
    pub(crate) strtab: Vec<u8>,

    temp_symbols: Vec<TempSymbol>,
    fixups: Vec<Fixup>,
    next_free_fixup: u32,

    secref_text: PackedOption<SecRef>,
    secref_rodata: PackedOption<SecRef>,
    secref_relro: PackedOption<SecRef>,
    secref_data: PackedOption<SecRef>,
    secref_bss: PackedOption<SecRef>,
    secref_tdata: PackedOption<SecRef>,
    secref_tbss: PackedOption<SecRef>,
    pub(crate) secref_eh_frame: PackedOption<SecRef>,
    pub(crate) secref_except_table: PackedOption<SecRef>,

    // .eh_frame emission state.
    pub(crate) eh_cur_cie_off: u32,
    pub(crate) cur_personality: Option<SymRef>,

    // Exception-table state for the function in progress.
    pub(crate) except_call_sites: Vec<CallSiteInfo>,
    pub(crate) except_action_table: Vec<u8>,
    pub(crate) except_type_info_table: Vec<SymRef>,
    pub(crate) except_spec_table: Vec<u8>,
    pub(crate) except_encoded_call_sites: Vec<u8>,
}

impl Assembler {
    pub fn new(target: &'static TargetInfo) -> Self {
        let mut asm = Assembler {
            target,
            sections: PrimaryMap::new(),
            local_symbols: Vec::new(),
            global_symbols: Vec::new(),
            strtab: Vec::new(),
            temp_symbols: Vec::new(),
            fixups: Vec::new(),
            next_free_fixup: NO_ENTRY,
            secref_text: None.into(),
            secref_rodata: None.into(),
            secref_relro: None.into(),
            secref_data: None.into(),
            secref_bss: None.into(),
            secref_tdata: None.into(),
            secref_tbss: None.into(),
            secref_eh_frame: None.into(),
            secref_except_table: None.into(),
            eh_cur_cie_off: 0,
            cur_personality: None,
            except_call_sites: Vec::new(),
            except_action_table: Vec::new(),
            except_type_info_table: Vec::new(),
            except_spec_table: Vec::new(),
            except_encoded_call_sites: Vec::new(),
        };
        asm.init();
        asm
    }

    pub fn reset(&mut self) {
        self.sections.clear();
        self.local_symbols.clear();
        self.global_symbols.clear();
        self.strtab.clear();
        self.temp_symbols.clear();
        self.fixups.clear();
        self.next_free_fixup = NO_ENTRY;
        self.secref_text = None.into();
        self.secref_rodata = None.into();
        self.secref_relro = None.into();
        self.secref_data = None.into();
        self.secref_bss = None.into();
        self.secref_tdata = None.into();
        self.secref_tbss = None.into();
        self.secref_eh_frame = None.into();
        self.secref_except_table = None.into();
        self.eh_cur_cie_off = 0;
        self.cur_personality = None;
        self.except_call_sites.clear();
        self.except_action_table.clear();
        self.except_type_info_table.clear();
        self.except_spec_table.clear();
        self.except_encoded_call_sites.clear();
        self.init();
    }

    fn init(&mut self) {
        // Index 0 of both the string table and the local symbol table is
        // reserved for the null entry.
        self.strtab.push(0);
        self.local_symbols.push(Symbol {
            name_off: 0,
            info: 0,
            section: None.into(),
            value: 0,
            size: 0,
        });

        let text = self.create_section(".text", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR, 16, None);
        self.secref_text = text.into();
        let ehf = self.create_section(".eh_frame", elf::SHT_PROGBITS, elf::SHF_ALLOC, 8, None);
        self.secref_eh_frame = ehf.into();
        self.eh_init_cie(None);
    }

    pub fn target(&self) -> &'static TargetInfo {
        self.target
    }

    // Section management.

    /// Create a named section. `group` adds it to a COMDAT group.
    pub fn create_section(
        &mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
        align: u64,
        group: Option<SecRef>,
    ) -> SecRef {
        let mut flags = sh_flags;
        if group.is_some() {
            flags |= elf::SHF_GROUP;
        }
        let ref_ = self.sections.next_key();
        let sym = self.create_section_symbol(ref_, name);
        let ref2 = self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            sh_flags: flags,
            sh_addralign: align,
            sh_entsize: 0,
            data: Vec::new(),
            nobits_size: 0,
            relocs: Vec::new(),
            sym,
            group: group.into(),
            signature: None,
            members: Vec::new(),
        });
        debug_assert_eq!(ref_, ref2);
        if let Some(g) = group {
            self.sections[g].members.push(ref_);
        }
        ref_
    }

    /// Create a `SHT_GROUP` section with `signature` as its signature
    /// symbol. Member sections reference it through their `group` field.
    pub fn create_group_section(&mut self, signature: SymRef, comdat: bool) -> SecRef {
        let ref_ = self.sections.push(Section {
            name: ".group".to_string(),
            sh_type: elf::SHT_GROUP,
            sh_flags: 0,
            sh_addralign: 4,
            sh_entsize: 4,
            data: Vec::new(),
            nobits_size: 0,
            relocs: Vec::new(),
            sym: signature,
            group: None.into(),
            signature: Some(signature),
            members: Vec::new(),
        });
        let flags: u32 = if comdat { elf::GRP_COMDAT } else { 0 };
        self.sections[ref_].data.extend_from_slice(&flags.to_le_bytes());
        ref_
    }

    /// `.init_array` or `.fini_array`, fresh per call so constructors can be
    /// grouped with their function.
    pub fn create_structor_section(&mut self, init: bool, group: Option<SecRef>) -> SecRef {
        let (name, ty) = if init {
            (".init_array", elf::SHT_INIT_ARRAY)
        } else {
            (".fini_array", elf::SHT_FINI_ARRAY)
        };
        let sec = self.create_section(name, ty, elf::SHF_ALLOC | elf::SHF_WRITE, 8, group);
        self.sections[sec].sh_entsize = 8;
        sec
    }

    pub fn text_section(&self) -> SecRef {
        self.secref_text.expand().unwrap()
    }

    pub fn eh_frame_section(&self) -> SecRef {
        self.secref_eh_frame.expand().unwrap()
    }

    pub fn data_section(&mut self, rodata: bool, relro: bool) -> SecRef {
        if !rodata {
            if let Some(s) = self.secref_data.expand() {
                return s;
            }
            let s = self.create_section(".data", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE, 1, None);
            self.secref_data = s.into();
            s
        } else if relro {
            if let Some(s) = self.secref_relro.expand() {
                return s;
            }
            let s = self.create_section(".data.rel.ro", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE, 1, None);
            self.secref_relro = s.into();
            s
        } else {
            if let Some(s) = self.secref_rodata.expand() {
                return s;
            }
            let s = self.create_section(".rodata", elf::SHT_PROGBITS, elf::SHF_ALLOC, 1, None);
            self.secref_rodata = s.into();
            s
        }
    }

    pub fn bss_section(&mut self) -> SecRef {
        if let Some(s) = self.secref_bss.expand() {
            return s;
        }
        let s = self.create_section(".bss", elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE, 1, None);
        self.secref_bss = s.into();
        s
    }

    pub fn tdata_section(&mut self) -> SecRef {
        if let Some(s) = self.secref_tdata.expand() {
            return s;
        }
        let s = self.create_section(
            ".tdata",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
            1,
            None,
        );
        self.secref_tdata = s.into();
        s
    }

    pub fn tbss_section(&mut self) -> SecRef {
        if let Some(s) = self.secref_tbss.expand() {
            return s;
        }
        let s = self.create_section(
            ".tbss",
            elf::SHT_NOBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
            1,
            None,
        );
        self.secref_tbss = s.into();
        s
    }

    pub(crate) fn except_table_section(&mut self) -> SecRef {
        if let Some(s) = self.secref_except_table.expand() {
            return s;
        }
        let s = self.create_section(".gcc_except_table", elf::SHT_PROGBITS, elf::SHF_ALLOC, 8, None);
        self.secref_except_table = s.into();
        s
    }

    pub fn section(&self, sec: SecRef) -> &Section {
        &self.sections[sec]
    }

    pub fn section_mut(&mut self, sec: SecRef) -> &mut Section {
        &mut self.sections[sec]
    }

    // Symbol management.

    fn add_string(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let off = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name.as_bytes());
        self.strtab.push(0);
        off
    }

    fn create_section_symbol(&mut self, sec: SecRef, name: &str) -> SymRef {
        let name_off = self.add_string(name);
        let sym = SymRef::local(self.local_symbols.len());
        self.local_symbols.push(Symbol {
            name_off,
            info: elf::st_info(elf::STB_LOCAL, elf::STT_SECTION),
            section: sec.into(),
            value: 0,
            size: 0,
        });
        sym
    }

    fn sym_add(&mut self, name: &str, binding: SymBinding, sym_type: u8) -> SymRef {
        let name_off = self.add_string(name);
        let (bind, global) = match binding {
            SymBinding::Local => (elf::STB_LOCAL, false),
            SymBinding::Global => (elf::STB_GLOBAL, true),
            SymBinding::Weak => (elf::STB_WEAK, true),
        };
        let sym = Symbol {
            name_off,
            info: elf::st_info(bind, sym_type),
            section: None.into(),
            value: 0,
            size: 0,
        };
        if global {
            self.global_symbols.push(sym);
            SymRef::global(self.global_symbols.len() - 1)
        } else {
            self.local_symbols.push(sym);
            SymRef::local(self.local_symbols.len() - 1)
        }
    }

    /// An undefined symbol reference.
    pub fn sym_add_undef(&mut self, name: &str, binding: SymBinding) -> SymRef {
        self.sym_add(name, binding, elf::STT_NOTYPE)
    }

    /// A function symbol whose definition will be supplied later via
    /// [`sym_def`](Self::sym_def).
    pub fn sym_predef_func(&mut self, name: &str, binding: SymBinding) -> SymRef {
        self.sym_add(name, binding, elf::STT_FUNC)
    }

    /// A data symbol whose definition will be supplied later.
    pub fn sym_predef_data(&mut self, name: &str, binding: SymBinding) -> SymRef {
        self.sym_add(name, binding, elf::STT_OBJECT)
    }

    /// A TLS data symbol whose definition will be supplied later.
    pub fn sym_predef_tls(&mut self, name: &str, binding: SymBinding) -> SymRef {
        self.sym_add(name, binding, elf::STT_TLS)
    }

    pub(crate) fn symbol(&self, sym: SymRef) -> &Symbol {
        if sym.is_local() {
            &self.local_symbols[sym.half_idx()]
        } else {
            &self.global_symbols[sym.half_idx()]
        }
    }

    fn symbol_mut(&mut self, sym: SymRef) -> &mut Symbol {
        if sym.is_local() {
            &mut self.local_symbols[sym.half_idx()]
        } else {
            &mut self.global_symbols[sym.half_idx()]
        }
    }

    /// Define a predeclared symbol at `off` in `sec`.
    pub fn sym_def(&mut self, sym: SymRef, sec: SecRef, off: u64, size: u64) {
        let s = self.symbol_mut(sym);
        debug_assert!(s.section.is_none(), "symbol defined twice");
        s.section = sec.into();
        s.value = off;
        s.size = size;
    }

    pub fn sym_section(&self, sym: SymRef) -> Option<SecRef> {
        self.symbol(sym).section.expand()
    }

    pub fn sym_value(&self, sym: SymRef) -> u64 {
        self.symbol(sym).value
    }

    pub fn sym_name<'a>(&'a self, sym: SymRef) -> &'a str {
        let off = self.symbol(sym).name_off as usize;
        let end = self.strtab[off..].iter().position(|&b| b == 0).unwrap() + off;
        core::str::from_utf8(&self.strtab[off..end]).unwrap()
    }

    /// Define a data symbol with initialized bytes, appending to `sec`.
    /// Returns the offset the data landed at.
    pub fn sym_def_data(&mut self, sec: SecRef, sym: SymRef, data: &[u8], align: u64) -> u64 {
        debug_assert_ne!(self.sections[sec].sh_type, elf::SHT_NOBITS);
        let section = &mut self.sections[sec];
        section.sh_addralign = section.sh_addralign.max(align);
        let pos = (section.data.len() as u64 + align - 1) & !(align - 1);
        section.data.resize(pos as usize, 0);
        section.data.extend_from_slice(data);
        self.sym_def(sym, sec, pos, data.len() as u64);
        pos
    }

    /// Define a zero-initialized data symbol (real zero bytes in PROGBITS
    /// sections, size-only in NOBITS sections).
    pub fn sym_def_zero(&mut self, sec: SecRef, sym: SymRef, size: u64, align: u64) -> u64 {
        let section = &mut self.sections[sec];
        section.sh_addralign = section.sh_addralign.max(align);
        if section.sh_type == elf::SHT_NOBITS {
            let pos = (section.nobits_size + align - 1) & !(align - 1);
            section.nobits_size = pos + size;
            self.sym_def(sym, sec, pos, size);
            pos
        } else {
            let pos = (section.data.len() as u64 + align - 1) & !(align - 1);
            section.data.resize((pos + size) as usize, 0);
            self.sym_def(sym, sec, pos, size);
            pos
        }
    }

    // Relocations.

    pub fn reloc(&mut self, sec: SecRef, sym: SymRef, kind: u32, off: u64, addend: i64) {
        self.sections[sec].relocs.push(Reloc {
            off,
            sym,
            kind,
            addend,
        });
    }

    /// Relocation in the text section at `off`.
    pub fn reloc_text(&mut self, sym: SymRef, kind: u32, off: u64, addend: i64) {
        self.reloc(self.text_section(), sym, kind, off, addend)
    }

    // Labels.

    pub fn label_create(&mut self) -> Label {
        let l = Label(self.temp_symbols.len() as u32);
        self.temp_symbols.push(TempSymbol {
            off: NO_ENTRY,
            fixup_head: NO_ENTRY,
        });
        l
    }

    pub fn label_is_pending(&self, label: Label) -> bool {
        self.temp_symbols[label.0 as usize].off == NO_ENTRY
    }

    pub fn label_offset(&self, label: Label) -> u32 {
        let off = self.temp_symbols[label.0 as usize].off;
        debug_assert_ne!(off, NO_ENTRY, "offset of unplaced label");
        off
    }

    /// Place `label` at the current end of the text section and patch all
    /// pending fixups.
    pub fn label_place(&mut self, label: Label) {
        debug_assert!(self.label_is_pending(label));
        let off = self.text_off();
        self.temp_symbols[label.0 as usize].off = off;

        let mut fixup_idx = self.temp_symbols[label.0 as usize].fixup_head;
        self.temp_symbols[label.0 as usize].fixup_head = NO_ENTRY;
        while fixup_idx != NO_ENTRY {
            let Fixup {
                section,
                next,
                off: fix_off,
                kind,
            } = self.fixups[fixup_idx as usize];
            self.apply_fixup(section, fix_off, kind, off);
            self.fixups[fixup_idx as usize].next = self.next_free_fixup;
            self.next_free_fixup = fixup_idx;
            fixup_idx = next;
        }
    }

    /// Record that the field at `off` in the text section must be patched
    /// with `label`'s position. If the label is already placed, patches
    /// immediately.
    pub fn label_fixup(&mut self, label: Label, kind: FixupKind, off: u32) {
        let sec = self.text_section();
        if !self.label_is_pending(label) {
            let target = self.label_offset(label);
            self.apply_fixup(sec, off, kind, target);
            return;
        }
        let fixup_idx = if self.next_free_fixup != NO_ENTRY {
            let idx = self.next_free_fixup;
            self.next_free_fixup = self.fixups[idx as usize].next;
            idx
        } else {
            self.fixups.push(Fixup {
                section: sec,
                next: NO_ENTRY,
                off: 0,
                kind,
            });
            (self.fixups.len() - 1) as u32
        };
        let info = &mut self.temp_symbols[label.0 as usize];
        self.fixups[fixup_idx as usize] = Fixup {
            section: sec,
            next: info.fixup_head,
            off,
            kind,
        };
        info.fixup_head = fixup_idx;
    }

    fn apply_fixup(&mut self, sec: SecRef, off: u32, kind: FixupKind, target: u32) {
        let data = &mut self.sections[sec].data;
        match kind {
            FixupKind::Rel32 => {
                let disp = target as i64 - (off as i64 + 4);
                data[off as usize..off as usize + 4]
                    .copy_from_slice(&(disp as i32).to_le_bytes());
            }
            FixupKind::Aarch64Branch26 => {
                let disp = (target as i64 - off as i64) >> 2;
                debug_assert!((-(1 << 25)..1 << 25).contains(&disp));
                let insn_bytes: [u8; 4] = data[off as usize..off as usize + 4].try_into().unwrap();
                let insn = u32::from_le_bytes(insn_bytes) | ((disp as u32) & 0x03ff_ffff);
                data[off as usize..off as usize + 4].copy_from_slice(&insn.to_le_bytes());
            }
            FixupKind::Aarch64Cond19 => {
                let disp = (target as i64 - off as i64) >> 2;
                debug_assert!((-(1 << 18)..1 << 18).contains(&disp));
                let insn_bytes: [u8; 4] = data[off as usize..off as usize + 4].try_into().unwrap();
                let insn =
                    u32::from_le_bytes(insn_bytes) | (((disp as u32) & 0x7ffff) << 5);
                data[off as usize..off as usize + 4].copy_from_slice(&insn.to_le_bytes());
            }
        }
    }

    /// Forget all labels; call between functions.
    pub fn labels_reset(&mut self) {
        debug_assert!(self
            .temp_symbols
            .iter()
            .all(|t| t.fixup_head == NO_ENTRY));
        self.temp_symbols.clear();
        self.fixups.clear();
        self.next_free_fixup = NO_ENTRY;
    }

    /// Forget all labels including unresolved fixups; for abandoning a
    /// partially-emitted function.
    pub fn labels_abandon(&mut self) {
        self.temp_symbols.clear();
        self.fixups.clear();
        self.next_free_fixup = NO_ENTRY;
    }

    // Text writing.

    pub fn text_off(&self) -> u32 {
        self.sections[self.text_section()].data.len() as u32
    }

    pub fn put(&mut self, bytes: &[u8]) {
        let sec = self.text_section();
        self.sections[sec].data.extend_from_slice(bytes);
    }

    pub fn put1(&mut self, b: u8) {
        self.put(&[b]);
    }

    pub fn put4(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    pub fn text_mut(&mut self) -> &mut Vec<u8> {
        let sec = self.text_section();
        &mut self.sections[sec].data
    }

    /// Align the text section, filling with the target's NOP pattern.
    pub fn align_text(&mut self, align: u32) {
        let nop: SmallVec<[u8; 4]> = SmallVec::from_slice(self.target.nop);
        let sec = self.text_section();
        let data = &mut self.sections[sec].data;
        while data.len() % align as usize != 0 {
            let missing = align as usize - data.len() % align as usize;
            if missing >= nop.len() {
                data.extend_from_slice(&nop);
            } else {
                // Single-byte NOP targets only ever hit this branch.
                data.extend(core::iter::repeat(nop[0]).take(missing));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x64::X64;
    use crate::Machine;

    fn asm() -> Assembler {
        Assembler::new(X64::target_info())
    }

    #[test]
    fn labels_patch_forward_references() {
        let mut a = asm();
        let l = a.label_create();
        a.put(&[0xe9]); // jmp rel32
        let fix_at = a.text_off();
        a.put4(0);
        a.label_fixup(l, FixupKind::Rel32, fix_at);
        a.put(&[0x90, 0x90, 0x90]);
        a.label_place(l);

        let text = a.section(a.text_section()).data.clone();
        let disp = i32::from_le_bytes(text[fix_at as usize..fix_at as usize + 4].try_into().unwrap());
        assert_eq!(disp, 3);
    }

    #[test]
    fn backward_references_patch_immediately() {
        let mut a = asm();
        let l = a.label_create();
        a.label_place(l);
        a.put(&[0x90, 0x90]);
        a.put(&[0xe9]);
        let fix_at = a.text_off();
        a.put4(0);
        a.label_fixup(l, FixupKind::Rel32, fix_at);

        let text = a.section(a.text_section()).data.clone();
        let disp = i32::from_le_bytes(text[fix_at as usize..fix_at as usize + 4].try_into().unwrap());
        assert_eq!(disp, -(2 + 1 + 4));
    }

    #[test]
    fn fixup_slots_are_recycled() {
        let mut a = asm();
        for _ in 0..4 {
            let l = a.label_create();
            let fix_at = a.text_off();
            a.put4(0);
            a.label_fixup(l, FixupKind::Rel32, fix_at);
            a.label_place(l);
        }
        assert_eq!(a.fixups.len(), 1);
    }

    #[test]
    fn symbols_split_into_halves() {
        let mut a = asm();
        let g = a.sym_predef_func("f", SymBinding::Global);
        let l = a.sym_predef_func("g", SymBinding::Local);
        let w = a.sym_add_undef("h", SymBinding::Weak);
        assert!(!g.is_local());
        assert!(l.is_local());
        assert!(!w.is_local());
        assert_eq!(a.sym_name(g), "f");
        assert_eq!(a.sym_name(l), "g");
    }

    #[test]
    fn data_symbols_are_aligned() {
        let mut a = asm();
        let sec = a.data_section(true, false);
        let s1 = a.sym_predef_data("a", SymBinding::Global);
        a.sym_def_data(sec, s1, &[1], 1);
        let s2 = a.sym_predef_data("b", SymBinding::Global);
        let off = a.sym_def_data(sec, s2, &[2; 8], 8);
        assert_eq!(off, 8);
        assert_eq!(a.section(sec).sh_addralign, 8);
    }

    #[test]
    fn bss_tracks_size_without_bytes() {
        let mut a = asm();
        let sec = a.bss_section();
        let s = a.sym_predef_data("z", SymBinding::Global);
        a.sym_def_zero(sec, s, 64, 16);
        assert_eq!(a.section(sec).nobits_size, 64);
        assert!(a.section(sec).data.is_empty());
    }

    #[test]
    fn structor_sections_hold_pointers() {
        let mut a = asm();
        let ctor = a.sym_predef_func("init_thing", SymBinding::Local);
        let sec = a.create_structor_section(true, None);
        assert_eq!(a.section(sec).name, ".init_array");
        assert_eq!(a.section(sec).sh_type, elf::SHT_INIT_ARRAY);
        assert_eq!(a.section(sec).sh_entsize, 8);
        let tgt = a.target().reloc_abs64;
        a.section_mut(sec).data.extend_from_slice(&[0; 8]);
        a.reloc(sec, ctor, tgt, 0, 0);
        assert_eq!(a.section(sec).relocs.len(), 1);

        let fini = a.create_structor_section(false, None);
        assert_eq!(a.section(fini).name, ".fini_array");
    }

    #[test]
    fn tls_sections_exist_on_demand() {
        let mut a = asm();
        let td = a.tdata_section();
        assert_ne!(a.section(td).sh_flags & elf::SHF_TLS, 0);
        let tb = a.tbss_section();
        assert_eq!(a.section(tb).sh_type, elf::SHT_NOBITS);
        let s = a.sym_predef_tls("tls_var", SymBinding::Global);
        a.sym_def_zero(tb, s, 8, 8);
        assert_eq!(a.section(tb).nobits_size, 8);
    }

    #[test]
    fn comdat_groups_collect_members() {
        let mut a = asm();
        let sig = a.sym_predef_func("inline_fn", SymBinding::Weak);
        let group = a.create_group_section(sig, true);
        let sec = a.create_section(".text.inline_fn", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR, 16, Some(group));
        assert_eq!(a.section(group).members, vec![sec]);
        assert_ne!(a.section(sec).sh_flags & elf::SHF_GROUP, 0);
        assert_eq!(
            u32::from_le_bytes(a.section(group).data[0..4].try_into().unwrap()),
            elf::GRP_COMDAT
        );
    }
}
