//! Relocatable ELF64 serialization.
//!
//! The writer produces `ET_REL` objects: a null section, `.note.GNU-stack`,
//! `.symtab`/`.strtab`/`.shstrtab`, then every content section followed by
//! its `.rela.*` section where needed. Local symbols precede globals in the
//! symbol table and `sh_info` records the first non-local index; relocation
//! entries against global symbols are rewritten at output time to account
//! for that split. Objects with `>= SHN_LORESERVE` sections emit an
//! `SHT_SYMTAB_SHNDX` section for the escaped section indices.

use super::{Assembler, Symbol};
use crate::{CodegenError, CodegenResult};
use cranelift_entity::EntityRef;

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_INIT_ARRAY: u32 = 14;
pub const SHT_FINI_ARRAY: u32 = 15;
pub const SHT_GROUP: u32 = 17;
pub const SHT_SYMTAB_SHNDX: u32 = 18;

pub const SHF_WRITE: u64 = 0x1;
pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;
pub const SHF_INFO_LINK: u64 = 0x40;
pub const SHF_GROUP: u64 = 0x200;
pub const SHF_TLS: u64 = 0x400;

pub const GRP_COMDAT: u32 = 1;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_TLS: u8 = 6;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_LORESERVE: u32 = 0xff00;
pub const SHN_XINDEX: u16 = 0xffff;

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_GOT32: u32 = 3;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_GOTPCREL: u32 = 9;
pub const R_X86_64_TLSGD: u32 = 19;

pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_PREL32: u32 = 261;
pub const R_AARCH64_CALL26: u32 = 283;
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
pub const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
pub const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;
pub const R_AARCH64_TLSDESC_ADR_PAGE21: u32 = 562;
pub const R_AARCH64_TLSDESC_LD64_LO12: u32 = 563;
pub const R_AARCH64_TLSDESC_ADD_LO12: u32 = 564;
pub const R_AARCH64_TLSDESC_CALL: u32 = 569;

pub const fn st_info(bind: u8, ty: u8) -> u8 {
    (bind << 4) | (ty & 0xf)
}

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

/// A section header under construction.
#[derive(Clone, Copy, Default)]
struct Shdr {
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

impl Shdr {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name.to_le_bytes());
        out.extend_from_slice(&self.sh_type.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.link.to_le_bytes());
        out.extend_from_slice(&self.info.to_le_bytes());
        out.extend_from_slice(&self.addralign.to_le_bytes());
        out.extend_from_slice(&self.entsize.to_le_bytes());
    }
}

struct Shstrtab {
    data: Vec<u8>,
}

impl Shstrtab {
    fn new() -> Self {
        Shstrtab { data: vec![0] }
    }

    fn add(&mut self, name: &str) -> u32 {
        let off = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        off
    }
}

fn align8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

impl Assembler {
    /// Serialize everything into a relocatable ELF64 image.
    pub fn build_object(&self) -> CodegenResult<Vec<u8>> {
        // Output section order: null, .note.GNU-stack, .symtab, .strtab,
        // .shstrtab, [content + .rela pairs...], optional .symtab_shndx.
        const IDX_NOTE: u32 = 1;
        const IDX_SYMTAB: u32 = 2;
        const IDX_STRTAB: u32 = 3;
        const IDX_SHSTRTAB: u32 = 4;
        const IDX_FIRST_USER: u32 = 5;

        let num_locals = self.local_symbols.len();
        let sym_count = num_locals + self.global_symbols.len();
        if sym_count >= 0x8000_0000 {
            return Err(CodegenError::ObjectLimitExceeded("symbol count"));
        }

        // Assign output indices: each section, plus a .rela companion when
        // it carries relocations.
        let mut out_idx = vec![0u32; self.sections.len()];
        let mut rela_idx = vec![0u32; self.sections.len()];
        let mut next = IDX_FIRST_USER;
        for (sec, s) in self.sections.iter() {
            out_idx[sec.index()] = next;
            next += 1;
            if !s.relocs.is_empty() {
                rela_idx[sec.index()] = next;
                next += 1;
            }
        }
        let mut sec_count = next;
        let mut shndx_idx = 0u32;
        if sec_count >= SHN_LORESERVE {
            shndx_idx = sec_count;
            sec_count += 1;
        }

        let mut shstrtab = Shstrtab::new();
        let mut shdrs = vec![Shdr::default(); sec_count as usize];
        let mut out = Vec::new();
        out.resize(EHDR_SIZE, 0);
        let shdr_off = out.len();
        out.resize(out.len() + SHDR_SIZE * sec_count as usize, 0);

        // ELF header.
        {
            let e = &mut out[0..EHDR_SIZE];
            e[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
            e[4] = 2; // ELFCLASS64
            e[5] = 1; // ELFDATA2LSB
            e[6] = 1; // EV_CURRENT
            e[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
            e[18..20].copy_from_slice(&self.target.elf_machine.to_le_bytes());
            e[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
            e[40..48].copy_from_slice(&(shdr_off as u64).to_le_bytes());
            e[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
            e[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
            if sec_count < SHN_LORESERVE {
                e[60..62].copy_from_slice(&(sec_count as u16).to_le_bytes());
            } else {
                // Escaped via the null section's sh_size.
                shdrs[0].size = sec_count as u64;
            }
            e[62..64].copy_from_slice(&(IDX_SHSTRTAB as u16).to_le_bytes());
        }

        // .note.GNU-stack: marks the stack non-executable.
        {
            let h = &mut shdrs[IDX_NOTE as usize];
            h.name = shstrtab.add(".note.GNU-stack");
            h.sh_type = SHT_PROGBITS;
            h.offset = out.len() as u64;
            h.addralign = 1;
        }

        // Resolve a symbol's section index, escaping into SHN_XINDEX.
        let sec_shndx = |sym: &Symbol| -> (u16, u32) {
            match sym.section.expand() {
                None => (SHN_UNDEF, 0),
                Some(sec) => {
                    let idx = out_idx[sec.index()];
                    if idx >= SHN_LORESERVE {
                        (SHN_XINDEX, idx)
                    } else {
                        (idx as u16, 0)
                    }
                }
            }
        };

        let write_sym = |out: &mut Vec<u8>, shndx: &mut Vec<u32>, sym: &Symbol| {
            let (st_shndx, xindex) = sec_shndx(sym);
            out.extend_from_slice(&sym.name_off.to_le_bytes());
            out.push(sym.info);
            out.push(0); // st_other
            out.extend_from_slice(&st_shndx.to_le_bytes());
            out.extend_from_slice(&sym.value.to_le_bytes());
            out.extend_from_slice(&sym.size.to_le_bytes());
            shndx.push(xindex);
        };

        // .symtab: locals first, then globals.
        let mut shndx_table: Vec<u32> = Vec::with_capacity(sym_count);
        {
            let sh_off = out.len();
            for sym in &self.local_symbols {
                write_sym(&mut out, &mut shndx_table, sym);
            }
            for sym in &self.global_symbols {
                write_sym(&mut out, &mut shndx_table, sym);
            }
            let h = &mut shdrs[IDX_SYMTAB as usize];
            h.name = shstrtab.add(".symtab");
            h.sh_type = SHT_SYMTAB;
            h.offset = sh_off as u64;
            h.size = (SYM_SIZE * sym_count) as u64;
            h.link = IDX_STRTAB;
            h.info = num_locals as u32;
            h.addralign = 8;
            h.entsize = SYM_SIZE as u64;
        }

        // .strtab.
        {
            let sh_off = out.len();
            out.extend_from_slice(&self.strtab);
            align8(&mut out);
            let h = &mut shdrs[IDX_STRTAB as usize];
            h.name = shstrtab.add(".strtab");
            h.sh_type = SHT_STRTAB;
            h.offset = sh_off as u64;
            h.size = self.strtab.len() as u64;
            h.addralign = 1;
        }

        // Content sections and their .rela companions.
        for (sec, s) in self.sections.iter() {
            let idx = out_idx[sec.index()] as usize;
            let sh_off = out.len();
            let h = &mut shdrs[idx];
            h.name = shstrtab.add(&s.name);
            h.sh_type = s.sh_type;
            h.flags = s.sh_flags;
            h.offset = sh_off as u64;
            h.addralign = s.sh_addralign;
            h.entsize = s.sh_entsize;
            match s.sh_type {
                SHT_NOBITS => {
                    h.size = s.nobits_size;
                }
                SHT_GROUP => {
                    // Group payload: flags word then member indices. The
                    // members (and their relas) are appended here because
                    // their output indices were unknown at creation time.
                    h.size = (4 + 4 * s.members.len()
                        + 4 * s
                            .members
                            .iter()
                            .filter(|m| !self.sections[**m].relocs.is_empty())
                            .count()) as u64;
                    h.link = IDX_SYMTAB;
                    let sig = s.signature.expect("group without signature symbol");
                    h.info = if sig.is_local() {
                        sig.half_idx() as u32
                    } else {
                        (num_locals + sig.half_idx()) as u32
                    };
                    out.extend_from_slice(&s.data[0..4]);
                    for &m in &s.members {
                        out.extend_from_slice(&out_idx[m.index()].to_le_bytes());
                        if !self.sections[m].relocs.is_empty() {
                            out.extend_from_slice(&rela_idx[m.index()].to_le_bytes());
                        }
                    }
                }
                _ => {
                    h.size = s.data.len() as u64;
                    out.extend_from_slice(&s.data);
                }
            }
            align8(&mut out);

            if s.relocs.is_empty() {
                continue;
            }
            if s.relocs.len() > (u32::MAX / RELA_SIZE as u32) as usize {
                return Err(CodegenError::ObjectLimitExceeded("relocation count"));
            }
            let ridx = rela_idx[sec.index()] as usize;
            let sh_off = out.len();
            for r in &s.relocs {
                // Global symbol indices follow the locals in the output
                // symbol table.
                let sym_idx = if r.sym.is_local() {
                    r.sym.half_idx() as u64
                } else {
                    (num_locals + r.sym.half_idx()) as u64
                };
                out.extend_from_slice(&r.off.to_le_bytes());
                out.extend_from_slice(&((sym_idx << 32) | r.kind as u64).to_le_bytes());
                out.extend_from_slice(&r.addend.to_le_bytes());
            }
            let h = &mut shdrs[ridx];
            let mut rela_name = String::with_capacity(5 + s.name.len());
            rela_name.push_str(".rela");
            rela_name.push_str(&s.name);
            h.name = shstrtab.add(&rela_name);
            h.sh_type = SHT_RELA;
            h.flags = SHF_INFO_LINK | (s.sh_flags & SHF_GROUP);
            h.offset = sh_off as u64;
            h.size = (RELA_SIZE * s.relocs.len()) as u64;
            h.link = IDX_SYMTAB;
            h.info = out_idx[sec.index()];
            h.addralign = 8;
            h.entsize = RELA_SIZE as u64;
        }

        // .symtab_shndx when section indices escape 16 bits.
        if shndx_idx != 0 {
            let sh_off = out.len();
            for x in &shndx_table {
                out.extend_from_slice(&x.to_le_bytes());
            }
            align8(&mut out);
            let h = &mut shdrs[shndx_idx as usize];
            h.name = shstrtab.add(".symtab_shndx");
            h.sh_type = SHT_SYMTAB_SHNDX;
            h.offset = sh_off as u64;
            h.size = (4 * shndx_table.len()) as u64;
            h.link = IDX_SYMTAB;
            h.addralign = 4;
            h.entsize = 4;
        }

        // .shstrtab comes last so every name is interned by now.
        {
            let sh_off = out.len();
            let h = &mut shdrs[IDX_SHSTRTAB as usize];
            h.name = shstrtab.add(".shstrtab");
            h.sh_type = SHT_STRTAB;
            h.offset = sh_off as u64;
            h.size = shstrtab.data.len() as u64;
            h.addralign = 1;
            out.extend_from_slice(&shstrtab.data);
            align8(&mut out);
        }

        // Serialize the headers into the reserved slot.
        let mut hdr_bytes = Vec::with_capacity(SHDR_SIZE * shdrs.len());
        for h in &shdrs {
            h.write(&mut hdr_bytes);
        }
        out[shdr_off..shdr_off + hdr_bytes.len()].copy_from_slice(&hdr_bytes);

        Ok(out)
    }
}

/// Resolved relocation info for in-memory mapping (used by the JIT path).
pub fn rela_section_target(name: &str) -> Option<&str> {
    name.strip_prefix(".rela")
}
