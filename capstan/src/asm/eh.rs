//! `.eh_frame` emission: one CIE per personality function, one FDE per
//! compiled function, CFI instructions streamed by the target's epilogue
//! of `finish_func`.
//!
//! CIEs use augmentation `"zR"` without a personality and `"zPLR"` with
//! one. FDE function pointers and LSDA pointers are 4-byte PC-relative
//! (`DW_EH_PE_pcrel | DW_EH_PE_sdata4`); the personality pointer is
//! additionally indirect. Function addresses are relocated against the
//! text *section* symbol (plus the function's offset as addend) so linkers
//! do not need to resolve function symbols while processing `.eh_frame`.

use super::{write_sleb, write_uleb, Assembler, SymRef};
use gimli::constants as dw;

/// Per-target constants for object and unwind emission.
pub struct TargetInfo {
    /// ELF `e_machine`.
    pub elf_machine: u16,
    /// Relocation type for a signed 32-bit PC-relative reference.
    pub reloc_pc32: u32,
    /// Relocation type for an absolute 64-bit reference.
    pub reloc_abs64: u32,
    /// CIE code alignment factor (1 on x86-64, 4 on AArch64).
    pub cie_code_align: u8,
    /// CIE data alignment factor (-8 on both supported targets).
    pub cie_data_align: i8,
    /// DWARF number of the return-address register.
    pub cie_return_addr_reg: u8,
    /// CFI instructions establishing the initial CFA rule.
    pub cie_initial_instrs: &'static [u8],
    /// Canonical NOP encoding used for text padding.
    pub nop: &'static [u8],
}

const CFI_PRIMARY_MASK: u8 = 0xc0;

impl Assembler {
    fn eh_data(&mut self) -> &mut Vec<u8> {
        let sec = self.eh_frame_section();
        &mut self.sections[sec].data
    }

    fn eh_align(&mut self) {
        let data = self.eh_data();
        while data.len() % 8 != 0 {
            data.push(dw::DW_CFA_nop.0);
        }
    }

    /// Emit a CFI instruction with an inline or ULEB operand.
    pub fn eh_write_inst(&mut self, opcode: u8, arg: u64) {
        let data = self.eh_data();
        if opcode & CFI_PRIMARY_MASK != 0 {
            debug_assert_eq!(arg & CFI_PRIMARY_MASK as u64, 0);
            data.push(opcode | arg as u8);
        } else {
            data.push(opcode);
            write_uleb(data, arg);
        }
    }

    /// Emit a CFI instruction with two operands.
    pub fn eh_write_inst2(&mut self, opcode: u8, arg1: u64, arg2: u64) {
        self.eh_write_inst(opcode, arg1);
        write_uleb(self.eh_data(), arg2);
    }

    /// `DW_CFA_advance_loc` by `delta` bytes of code, scaled by the code
    /// alignment factor.
    pub fn eh_advance_loc(&mut self, delta: u32) {
        let factor = self.target.cie_code_align as u32;
        debug_assert_eq!(delta % factor, 0);
        let scaled = delta / factor;
        if scaled == 0 {
            return;
        }
        if scaled < 0x40 {
            self.eh_write_inst(dw::DW_CFA_advance_loc.0, scaled as u64);
        } else {
            self.eh_data().push(dw::DW_CFA_advance_loc4.0);
            let bytes = scaled.to_le_bytes();
            self.eh_data().extend_from_slice(&bytes);
        }
    }

    /// Callee-saved register `dwarf_reg` saved at `CFA - factored_off * 8`.
    pub fn eh_cfa_offset(&mut self, dwarf_reg: u8, factored_off: u64) {
        self.eh_write_inst2(dw::DW_CFA_offset.0, dwarf_reg as u64, factored_off);
    }

    pub fn eh_def_cfa_offset(&mut self, off: u64) {
        self.eh_write_inst(dw::DW_CFA_def_cfa_offset.0, off);
    }

    pub fn eh_def_cfa_register(&mut self, dwarf_reg: u8) {
        self.eh_write_inst(dw::DW_CFA_def_cfa_register.0, dwarf_reg as u64);
    }

    /// Start a new CIE. Called implicitly when the personality function of
    /// the next FDE differs from the current CIE's.
    pub(crate) fn eh_init_cie(&mut self, personality: Option<SymRef>) {
        self.eh_align();
        let cie_off = self.eh_data().len();
        self.eh_cur_cie_off = cie_off as u32;

        let data = self.eh_data();
        data.extend_from_slice(&[0; 4]); // length, patched below
        data.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        data.push(1); // version
        if personality.is_some() {
            data.extend_from_slice(b"zPLR\0");
        } else {
            data.extend_from_slice(b"zR\0");
        }
        let code_align = self.target.cie_code_align;
        let data_align = self.target.cie_data_align;
        let ra = self.target.cie_return_addr_reg;
        let data = self.eh_data();
        write_uleb(data, code_align as u64);
        write_sleb(data, data_align as i64);
        data.push(ra);

        if personality.is_some() {
            let data = self.eh_data();
            write_uleb(data, 7); // augmentation data length
            data.push((dw::DW_EH_PE_pcrel.0 | dw::DW_EH_PE_sdata4.0 | dw::DW_EH_PE_indirect.0) as u8);
            let ptr_off = data.len() as u64;
            data.extend_from_slice(&[0; 4]);
            data.push((dw::DW_EH_PE_pcrel.0 | dw::DW_EH_PE_sdata4.0) as u8); // LSDA encoding
            let sec = self.eh_frame_section();
            let pc32 = self.target.reloc_pc32;
            self.reloc(sec, personality.unwrap(), pc32, ptr_off, 0);
        } else {
            let data = self.eh_data();
            write_uleb(data, 1);
        }
        let data = self.eh_data();
        data.push((dw::DW_EH_PE_pcrel.0 | dw::DW_EH_PE_sdata4.0) as u8); // FDE pointer encoding

        let instrs = self.target.cie_initial_instrs;
        self.eh_data().extend_from_slice(instrs);
        self.eh_align();

        let len = (self.eh_data().len() - cie_off - 4) as u32;
        self.eh_data()[cie_off..cie_off + 4].copy_from_slice(&len.to_le_bytes());
    }

    /// Begin the FDE of a function; returns its offset for `eh_end_fde`.
    pub fn eh_begin_fde(&mut self, personality: Option<SymRef>) -> u32 {
        if personality != self.cur_personality {
            self.eh_init_cie(personality);
            self.cur_personality = personality;
        }

        self.eh_align();
        let fde_off = self.eh_data().len() as u32;
        let cie_delta = fde_off - self.eh_cur_cie_off + 4;
        let has_personality = self.cur_personality.is_some();
        let data = self.eh_data();
        data.extend_from_slice(&[0; 4]); // length, patched in eh_end_fde
        data.extend_from_slice(&cie_delta.to_le_bytes());
        data.extend_from_slice(&[0; 4]); // func_start, relocated later
        data.extend_from_slice(&[0; 4]); // func_size, patched later
        if has_personality {
            data.push(4); // augmentation data length
            data.extend_from_slice(&[0; 4]); // LSDA pointer, relocated later
        } else {
            data.push(0);
        }
        fde_off
    }

    /// Finish the FDE started at `fde_start`, filling in the function range
    /// and, with a personality, the LSDA pointer (which will be the next
    /// bytes appended to `.gcc_except_table`).
    pub fn eh_end_fde(&mut self, fde_start: u32, func: SymRef) {
        self.eh_align();

        let func_sec = self.sym_section(func).expect("FDE for undefined function");
        let func_value = self.sym_value(func);
        let func_size = self.symbol(func).size;
        let sec_sym = self.sections[func_sec].sym;
        let pc32 = self.target.reloc_pc32;
        let eh_sec = self.eh_frame_section();

        // Relocate func_start against the containing section's symbol so
        // the reference does not depend on symbol resolution order.
        self.reloc(eh_sec, sec_sym, pc32, fde_start as u64 + 8, func_value as i64);

        let data = self.eh_data();
        data[fde_start as usize + 12..fde_start as usize + 16]
            .copy_from_slice(&(func_size as u32).to_le_bytes());
        let len = (data.len() - fde_start as usize - 4) as u32;
        data[fde_start as usize..fde_start as usize + 4].copy_from_slice(&len.to_le_bytes());

        if self.cur_personality.is_some() {
            let lsda_off = {
                let et = self.except_table_section();
                self.sections[et].data.len() as i64
            };
            let et_sym = {
                let et = self.except_table_section();
                self.sections[et].sym
            };
            self.reloc(eh_sec, et_sym, pc32, fde_start as u64 + 17, lsda_off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::SymBinding;
    use crate::isa::x64::X64;
    use crate::Machine;

    #[test]
    fn initial_cie_has_zr_augmentation() {
        let a = Assembler::new(X64::target_info());
        let eh = &a.sections[a.eh_frame_section()].data;
        // length(4) id(4) version(1) then "zR\0".
        assert_eq!(&eh[8..12], b"\x01zR\0");
        assert_eq!(eh.len() % 8, 0);
        let len = u32::from_le_bytes(eh[0..4].try_into().unwrap());
        assert_eq!(len as usize + 4, eh.len());
    }

    #[test]
    fn fde_round_trip() {
        let mut a = Assembler::new(X64::target_info());
        let f = a.sym_predef_func("f", SymBinding::Global);
        a.put(&[0x90; 24]);
        a.sym_def(f, a.text_section(), 0, 24);

        let fde = a.eh_begin_fde(None);
        a.eh_advance_loc(1);
        a.eh_def_cfa_offset(16);
        a.eh_end_fde(fde, f);

        let eh = &a.sections[a.eh_frame_section()].data;
        let len = u32::from_le_bytes(eh[fde as usize..fde as usize + 4].try_into().unwrap());
        assert_eq!((fde as usize + 4 + len as usize) % 8, 0);
        // CIE pointer points back to the CIE.
        let cie_delta =
            u32::from_le_bytes(eh[fde as usize + 4..fde as usize + 8].try_into().unwrap());
        assert_eq!(fde + 4 - cie_delta, 0);
        // Function size was patched in.
        let size =
            u32::from_le_bytes(eh[fde as usize + 12..fde as usize + 16].try_into().unwrap());
        assert_eq!(size, 24);
        // One relocation for func_start, against the text section symbol.
        let relocs = &a.sections[a.eh_frame_section()].relocs;
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].off, fde as u64 + 8);
    }

    #[test]
    fn personality_switches_cie() {
        let mut a = Assembler::new(X64::target_info());
        let f = a.sym_predef_func("f", SymBinding::Global);
        a.put(&[0x90; 8]);
        a.sym_def(f, a.text_section(), 0, 8);
        let pers = a.sym_add_undef("__gxx_personality_v0", SymBinding::Global);

        let eh_len_before = a.sections[a.eh_frame_section()].data.len();
        let fde = a.eh_begin_fde(Some(pers));
        // A new CIE with zPLR must have been written between the old end
        // and the FDE.
        let eh = &a.sections[a.eh_frame_section()].data;
        let cie_bytes = &eh[eh_len_before..fde as usize];
        assert!(cie_bytes.windows(5).any(|w| w == &b"\x01zPLR"[..]));
        a.eh_end_fde(fde, f);
        // LSDA pointer relocation present at fde+17.
        let relocs = &a.sections[a.eh_frame_section()].relocs;
        assert!(relocs.iter().any(|r| r.off == fde as u64 + 17));
    }
}
