//! In-memory loading for capstan-emitted objects.
//!
//! Takes the relocatable ELF image produced by `capstan::compile_object`,
//! copies the allocatable sections into anonymous mappings, applies the
//! relocations (resolving undefined symbols through a caller-supplied
//! resolver), flips executable sections to read-execute and hands out
//! pointers to the exported symbols.
//!
//! Only the relocation kinds the two capstan targets emit are
//! interpreted. GOT-indirect references get a small synthesized GOT: one
//! pointer-sized slot per referenced symbol.

#![cfg(unix)]

use object::elf;
use object::read::elf::ElfFile64;
use object::Endianness;
use object::{Object, ObjectSection, ObjectSymbol};
use rustc_hash::FxHashMap;
use std::collections::HashMap;

mod memory;

use memory::Mapping;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("malformed object: {0}")]
    Object(#[from] object::read::Error),
    #[error("cannot resolve symbol {0}")]
    UnresolvedSymbol(String),
    #[error("unsupported relocation type {0}")]
    UnsupportedReloc(u32),
    #[error("relocation target out of range for {0}")]
    RelocOutOfRange(&'static str),
    #[error("memory mapping failed: {0}")]
    Memory(#[from] rustix::io::Errno),
}

/// A module mapped into executable memory. Dropping it unmaps the code;
/// the caller must ensure nothing executes it afterwards.
pub struct JitModule {
    #[allow(dead_code)]
    mapping: Mapping,
    symbols: FxHashMap<String, usize>,
}

impl JitModule {
    /// Map `elf_bytes`, resolving undefined symbols through `resolver`.
    pub fn load(
        elf_bytes: &[u8],
        resolver: &dyn Fn(&str) -> Option<usize>,
    ) -> Result<JitModule, JitError> {
        let file: ElfFile64<Endianness> = ElfFile64::parse(elf_bytes)?;

        // Lay out all allocatable sections in one mapping; remember where
        // each section lands.
        let mut total = 0usize;
        let mut placements: HashMap<object::SectionIndex, (usize, bool)> = HashMap::new();
        for section in file.sections() {
            let flags = match section.flags() {
                object::SectionFlags::Elf { sh_flags } => sh_flags,
                _ => 0,
            };
            if flags & u64::from(elf::SHF_ALLOC) == 0 {
                continue;
            }
            let align = section.align().max(1) as usize;
            total = (total + align - 1) & !(align - 1);
            let exec = flags & u64::from(elf::SHF_EXECINSTR) != 0;
            placements.insert(section.index(), (total, exec));
            total += section.size() as usize;
        }
        // Reserve a synthesized GOT at the end.
        let got_base = (total + 7) & !7;
        let mut got_slots: FxHashMap<String, usize> = FxHashMap::default();
        for section in file.sections() {
            for (_, reloc) in section.relocations() {
                if let object::RelocationFlags::Elf { r_type } = reloc.flags() {
                    if matches!(
                        r_type,
                        elf::R_X86_64_GOTPCREL
                            | elf::R_AARCH64_ADR_GOT_PAGE
                            | elf::R_AARCH64_LD64_GOT_LO12_NC
                    ) {
                        let name = reloc_symbol_name(&file, &reloc)?;
                        let next = got_slots.len();
                        got_slots.entry(name).or_insert(next);
                    }
                }
            }
        }
        total = got_base + 8 * got_slots.len();

        let mut mapping = Mapping::new_writable(total.max(1))?;

        for section in file.sections() {
            let Some(&(off, _)) = placements.get(&section.index()) else {
                continue;
            };
            let data = section.data()?;
            if !data.is_empty() {
                mapping.as_mut_slice()[off..off + data.len()].copy_from_slice(data);
            }
        }

        let base = mapping.addr();

        // Address of a symbol: defined symbols land in the mapping,
        // undefined ones go through the resolver.
        fn sym_addr<'d, S: ObjectSymbol<'d>>(
            sym: &S,
            placements: &HashMap<object::SectionIndex, (usize, bool)>,
            base: usize,
            resolver: &dyn Fn(&str) -> Option<usize>,
        ) -> Result<usize, JitError> {
            match sym.section_index() {
                Some(idx) => {
                    let &(off, _) = placements
                        .get(&idx)
                        .ok_or(JitError::RelocOutOfRange("symbol section"))?;
                    Ok(base + off + sym.address() as usize)
                }
                None => {
                    let name = sym.name()?.to_string();
                    resolver(&name).ok_or(JitError::UnresolvedSymbol(name))
                }
            }
        }

        // Fill the GOT.
        for (name, slot) in &got_slots {
            let addr = match file.symbols().chain(file.dynamic_symbols()).find(|s| {
                s.name().map(|n| n == name).unwrap_or(false) && s.section_index().is_some()
            }) {
                Some(sym) => sym_addr(&sym, &placements, base, resolver)?,
                None => resolver(name).ok_or_else(|| JitError::UnresolvedSymbol(name.clone()))?,
            };
            let got_off = got_base + 8 * slot;
            mapping.as_mut_slice()[got_off..got_off + 8].copy_from_slice(&addr.to_le_bytes());
        }

        // Apply relocations.
        for section in file.sections() {
            let Some(&(sec_off, _)) = placements.get(&section.index()) else {
                continue;
            };
            for (r_off, reloc) in section.relocations() {
                let object::RelocationFlags::Elf { r_type } = reloc.flags() else {
                    continue;
                };
                let place = base + sec_off + r_off as usize;
                let target: usize = match reloc.target() {
                    object::RelocationTarget::Symbol(sym_idx) => {
                        let sym = file.symbol_by_index(sym_idx)?;
                        if matches!(
                            r_type,
                            elf::R_X86_64_GOTPCREL
                                | elf::R_AARCH64_ADR_GOT_PAGE
                                | elf::R_AARCH64_LD64_GOT_LO12_NC
                        ) {
                            let name = sym.name()?.to_string();
                            base + got_base + 8 * got_slots[&name]
                        } else {
                            sym_addr(&sym, &placements, base, resolver)?
                        }
                    }
                    _ => return Err(JitError::RelocOutOfRange("non-symbol target")),
                };
                let addend = reloc.addend();
                apply_reloc(mapping.as_mut_slice(), place - base, place, target, addend, r_type)?;
            }
        }

        // Collect exported symbols before flipping protections.
        let mut symbols = FxHashMap::default();
        for sym in file.symbols() {
            if sym.is_definition() && !sym.name()?.is_empty() {
                symbols.insert(sym.name()?.to_string(), sym_addr(&sym, &placements, base, resolver)?);
            }
        }

        mapping.make_executable()?;
        log::debug!(
            "mapped {} bytes of code, {} symbols",
            total,
            symbols.len()
        );
        Ok(JitModule { mapping, symbols })
    }

    /// The address of an exported symbol.
    pub fn symbol(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }
}

fn reloc_symbol_name<'d>(
    file: &ElfFile64<'d, Endianness>,
    reloc: &object::Relocation,
) -> Result<String, JitError> {
    match reloc.target() {
        object::RelocationTarget::Symbol(idx) => {
            Ok(file.symbol_by_index(idx)?.name()?.to_string())
        }
        _ => Err(JitError::RelocOutOfRange("non-symbol target")),
    }
}

fn apply_reloc(
    bytes: &mut [u8],
    place_off: usize,
    place: usize,
    target: usize,
    addend: i64,
    r_type: u32,
) -> Result<(), JitError> {
    let value = target as i64 + addend;
    match r_type {
        elf::R_X86_64_64 | elf::R_AARCH64_ABS64 => {
            bytes[place_off..place_off + 8].copy_from_slice(&value.to_le_bytes());
        }
        elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 | elf::R_X86_64_GOTPCREL
        | elf::R_AARCH64_PREL32 => {
            let rel = value - place as i64;
            let rel32 =
                i32::try_from(rel).map_err(|_| JitError::RelocOutOfRange("pc-relative 32"))?;
            bytes[place_off..place_off + 4].copy_from_slice(&rel32.to_le_bytes());
        }
        elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => {
            let rel = value - place as i64;
            if rel % 4 != 0 || !(-(1 << 27)..1 << 27).contains(&rel) {
                return Err(JitError::RelocOutOfRange("branch26"));
            }
            patch_insn(bytes, place_off, ((rel >> 2) as u32) & 0x03ff_ffff);
        }
        elf::R_AARCH64_ADR_PREL_PG_HI21 | elf::R_AARCH64_ADR_GOT_PAGE => {
            let page = (value as u64 & !0xfff) as i64 - (place as i64 & !0xfff);
            let imm = page >> 12;
            if !(-(1 << 20)..1 << 20).contains(&imm) {
                return Err(JitError::RelocOutOfRange("adrp"));
            }
            let imm = imm as u32;
            let patch = ((imm & 3) << 29) | (((imm >> 2) & 0x7ffff) << 5);
            patch_insn(bytes, place_off, patch);
        }
        elf::R_AARCH64_ADD_ABS_LO12_NC => {
            patch_insn(bytes, place_off, ((value as u32) & 0xfff) << 10);
        }
        elf::R_AARCH64_LD64_GOT_LO12_NC => {
            let lo = (value as u32) & 0xfff;
            if lo % 8 != 0 {
                return Err(JitError::RelocOutOfRange("got entry alignment"));
            }
            patch_insn(bytes, place_off, (lo / 8) << 10);
        }
        other => return Err(JitError::UnsupportedReloc(other)),
    }
    Ok(())
}

fn patch_insn(bytes: &mut [u8], off: usize, or_mask: u32) {
    let insn = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    bytes[off..off + 4].copy_from_slice(&(insn | or_mask).to_le_bytes());
}
