//! AArch64 AAPCS64 target.
//!
//! Frame shape: `stp x29, x30, [sp, #-16]!; mov x29, sp`, a NOP area that
//! later receives `stp` pairs for the clobbered callee-saved registers
//! (stored x29-relative inside the reserved frame), then a two-instruction
//! `sub sp` whose immediates are back-patched. Locals are addressed
//! x29-relative at negative offsets; ip0 (x16) stays out of the
//! allocatable set and serves as the addressing scratch for offsets no
//! load/store mode can express. Epilogues restore through x29, so
//! dynamically-sized stack allocations need no special casing.

pub(crate) mod encode;

use crate::asm::{Assembler, FixupKind, Label, SymRef, TargetInfo};
use crate::cc::{CcAssigner, CcAssignment, CcInfo};
use crate::isa::{AluOp, Cond, FuncFinishInfo, Machine, PrologueInfo};
use crate::regfile::{Reg, RegBank, RegisterFile};
use smallvec::SmallVec;

pub const GP_BANK: RegBank = RegBank(0);
pub const FP_BANK: RegBank = RegBank(1);

pub const X0: Reg = Reg::new(0);
pub const X1: Reg = Reg::new(1);
pub const X19: Reg = Reg::new(19);
pub const V0: Reg = Reg::from_bank(FP_BANK, 0);

/// x19..x28.
const CALLEE_SAVED_MASK: u64 = ((1 << 29) - 1) & !((1 << 19) - 1);

static CC_INFO: CcInfo = CcInfo {
    // x0-x15 and x19-x28; x16/x17 are reserved scratch, x18 the platform
    // register, x29/x30/sp never allocatable. v0-v7 and v16-v31; v8-v15
    // have callee-saved low halves and are excluded wholesale.
    allocatable: 0xffff | CALLEE_SAVED_MASK | (0xffu64 << 32) | (0xffffu64 << 48),
    callee_saved: CALLEE_SAVED_MASK,
    arg_regs: 0xff | (0xffu64 << 32),
};

static TARGET_INFO: TargetInfo = TargetInfo {
    elf_machine: crate::asm::elf::EM_AARCH64,
    reloc_pc32: crate::asm::elf::R_AARCH64_PREL32,
    reloc_abs64: crate::asm::elf::R_AARCH64_ABS64,
    cie_code_align: 4,
    cie_data_align: -8,
    cie_return_addr_reg: 30,
    // def_cfa sp, 0.
    cie_initial_instrs: &[0x0c, 31, 0],
    nop: &[0x1f, 0x20, 0x03, 0xd5],
};

/// Words reserved for the callee-saved store area: five `stp` pairs.
const REG_SAVE_WORDS: u32 = 5;
/// Epilogue: five restore words + `mov sp, x29` + `ldp` + `ret`.
const EPILOGUE_WORDS: u32 = REG_SAVE_WORDS + 3;
/// AAPCS64 vararg save area: x0-x7 and q0-q7.
const VARARG_SAVE_SIZE: u32 = 8 * 8 + 8 * 16;

fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x0,
        Cond::Ne => 0x1,
        Cond::Uge => 0x2,
        Cond::Ult => 0x3,
        Cond::Ugt => 0x8,
        Cond::Ule => 0x9,
        Cond::Sge => 0xa,
        Cond::Slt => 0xb,
        Cond::Sgt => 0xc,
        Cond::Sle => 0xd,
    }
}

/// AAPCS64 argument assignment.
pub struct CcAssignerAapcs {
    gp_cnt: u32,
    fp_cnt: u32,
    stack: u32,
    must_assign_stack: u32,
    vararg: bool,
    ret_gp_cnt: u32,
    ret_fp_cnt: u32,
}

impl CcAssignerAapcs {
    pub fn new(vararg: bool) -> Self {
        CcAssignerAapcs {
            gp_cnt: 0,
            fp_cnt: 0,
            stack: 0,
            must_assign_stack: 0,
            vararg,
            ret_gp_cnt: 0,
            ret_fp_cnt: 0,
        }
    }
}

impl CcAssigner for CcAssignerAapcs {
    fn reset(&mut self) {
        *self = CcAssignerAapcs::new(false);
    }

    fn assign_arg(&mut self, arg: &mut CcAssignment) {
        if arg.byval {
            let align = arg.byval_align.max(8);
            self.stack = (self.stack + align - 1) & !(align - 1);
            arg.stack_off = self.stack;
            self.stack += (arg.byval_size + 7) & !7;
            return;
        }

        if arg.bank == GP_BANK.id() {
            if self.must_assign_stack == 0 && self.gp_cnt + arg.consecutive < 8 {
                arg.reg = Some(Reg::new(self.gp_cnt as u8));
                self.gp_cnt += 1;
            } else {
                self.must_assign_stack = arg.consecutive + 1;
                let align = arg.align.max(8);
                self.stack = (self.stack + align - 1) & !(align - 1);
                arg.stack_off = self.stack;
                self.stack += 8;
            }
        } else if self.must_assign_stack == 0 && self.fp_cnt + arg.consecutive < 8 {
            arg.reg = Some(Reg::from_bank(FP_BANK, self.fp_cnt as u8));
            self.fp_cnt += 1;
        } else {
            self.must_assign_stack = arg.consecutive + 1;
            let size = (arg.size + 7) & !7;
            self.stack = (self.stack + size - 1) & !(size - 1);
            arg.stack_off = self.stack;
            self.stack += size;
        }

        if self.must_assign_stack > 0 {
            self.must_assign_stack -= 1;
        }
    }

    fn assign_ret(&mut self, ret: &mut CcAssignment) {
        debug_assert!(!ret.byval && !ret.sret);
        if ret.bank == GP_BANK.id() {
            debug_assert!(self.ret_gp_cnt < 2, "too many GP return parts");
            ret.reg = Some(Reg::new(self.ret_gp_cnt as u8));
            self.ret_gp_cnt += 1;
        } else {
            debug_assert!(self.ret_fp_cnt < 2, "too many FP return parts");
            ret.reg = Some(Reg::from_bank(FP_BANK, self.ret_fp_cnt as u8));
            self.ret_fp_cnt += 1;
        }
    }

    fn stack_size(&self) -> u32 {
        self.stack
    }

    fn is_vararg(&self) -> bool {
        self.vararg
    }

    fn info(&self) -> &'static CcInfo {
        &CC_INFO
    }
}

#[derive(Default)]
pub struct FrameState {
    pub func_start_off: u32,
    reg_save_off: u32,
    frame_size_setup_off: u32,
    ret_offs: SmallVec<[u32; 4]>,
    pub scalar_arg_count: u32,
    pub vec_arg_count: u32,
    pub var_arg_stack_off: u32,
    pub reg_save_frame_off: u32,
}

pub struct Aarch64;

impl Machine for Aarch64 {
    type FrameState = FrameState;
    type Cc = CcAssignerAapcs;

    const GP_BANK: RegBank = GP_BANK;
    const FP_BANK: RegBank = FP_BANK;
    const NUM_BANKS: u8 = 2;
    const NUM_FIXED_ASSIGNMENTS: [u32; 2] = [8, 8];
    const FRAME_ARG_BASE: i32 = 0x10;
    const PTR_SIZE: u32 = 8;
    // Two add/sub immediates of twelve bits each.
    const MAX_FRAME_SIZE: u32 = (1 << 24) - 16;

    fn target_info() -> &'static TargetInfo {
        &TARGET_INFO
    }

    fn cc_info() -> &'static CcInfo {
        &CC_INFO
    }

    fn new_cc(vararg: bool) -> CcAssignerAapcs {
        CcAssignerAapcs::new(vararg)
    }

    fn arch() -> target_lexicon::Architecture {
        target_lexicon::Architecture::Aarch64(target_lexicon::Aarch64Architecture::Aarch64)
    }

    fn select_fixed_assignment_reg(regs: &RegisterFile, bank: RegBank) -> Option<Reg> {
        let csr = CC_INFO.callee_saved;
        regs.find_first_free_excluding(bank, !csr)
            .or_else(|| regs.find_first_nonfixed_excluding(bank, !csr))
    }

    fn spill(asm: &mut Assembler, reg: Reg, frame_off: i32, size: u32) {
        encode::mem_access(
            asm,
            reg.bank() == GP_BANK,
            false,
            encode::hw(reg),
            encode::FP,
            frame_off,
            size,
        );
    }

    fn reload(asm: &mut Assembler, reg: Reg, frame_off: i32, size: u32) {
        encode::mem_access(
            asm,
            reg.bank() == GP_BANK,
            true,
            encode::hw(reg),
            encode::FP,
            frame_off,
            size,
        );
    }

    fn lea_stack(asm: &mut Assembler, dst: Reg, frame_off: i32) {
        encode::add_sub_imm(asm, encode::hw(dst), encode::FP, frame_off as i64);
    }

    fn store_sp(asm: &mut Assembler, reg: Reg, sp_off: u32, size: u32) {
        encode::mem_access(
            asm,
            reg.bank() == GP_BANK,
            false,
            encode::hw(reg),
            encode::SP,
            sp_off as i32,
            size,
        );
    }

    fn load_sp(asm: &mut Assembler, reg: Reg, sp_off: u32, size: u32) {
        encode::mem_access(
            asm,
            reg.bank() == GP_BANK,
            true,
            encode::hw(reg),
            encode::SP,
            sp_off as i32,
            size,
        );
    }

    fn mov(asm: &mut Assembler, dst: Reg, src: Reg, size: u32) {
        debug_assert_eq!(dst.bank(), src.bank());
        if dst.bank() == GP_BANK {
            encode::mov_gp(asm, encode::hw(dst), encode::hw(src), size.max(4));
        } else {
            encode::mov_fp(asm, encode::hw(dst), encode::hw(src), size);
        }
    }

    fn materialize_const(asm: &mut Assembler, dst: Reg, value: u64, size: u32) {
        debug_assert_eq!(dst.bank(), GP_BANK);
        encode::mov_imm(asm, encode::hw(dst), value, size.max(4));
    }

    fn ext(asm: &mut Assembler, dst: Reg, src: Reg, signed: bool, from_bits: u32, to_bits: u32) {
        encode::ext(asm, encode::hw(dst), encode::hw(src), signed, from_bits, to_bits);
    }

    fn load_mem(asm: &mut Assembler, dst: Reg, base: Reg, off: i32, size: u32) {
        encode::mem_access(
            asm,
            dst.bank() == GP_BANK,
            true,
            encode::hw(dst),
            encode::hw(base),
            off,
            size,
        );
    }

    fn store_mem(asm: &mut Assembler, src: Reg, base: Reg, off: i32, size: u32) {
        encode::mem_access(
            asm,
            src.bank() == GP_BANK,
            false,
            encode::hw(src),
            encode::hw(base),
            off,
            size,
        );
    }

    fn lea(asm: &mut Assembler, dst: Reg, base: Option<Reg>, index: Option<(Reg, u8)>, disp: i64) {
        match (base, index) {
            (Some(b), None) => encode::add_sub_imm(asm, encode::hw(dst), encode::hw(b), disp),
            (Some(b), Some((idx, scale))) => {
                encode::add_shifted(asm, encode::hw(dst), encode::hw(b), encode::hw(idx), scale);
                if disp != 0 {
                    encode::add_sub_imm(asm, encode::hw(dst), encode::hw(dst), disp);
                }
            }
            (None, Some((idx, scale))) => {
                // dst = idx << scale (+ disp)
                encode::add_shifted(asm, encode::hw(dst), encode::ZR, encode::hw(idx), scale);
                if disp != 0 {
                    encode::add_sub_imm(asm, encode::hw(dst), encode::hw(dst), disp);
                }
            }
            (None, None) => unreachable!("lea without base or index"),
        }
    }

    fn load_sym_addr(asm: &mut Assembler, dst: Reg, sym: SymRef) {
        let page_at = encode::adrp(asm, encode::hw(dst));
        asm.reloc_text(
            sym,
            crate::asm::elf::R_AARCH64_ADR_PREL_PG_HI21,
            page_at as u64,
            0,
        );
        let lo_at = encode::add_lo12(asm, encode::hw(dst), encode::hw(dst));
        asm.reloc_text(
            sym,
            crate::asm::elf::R_AARCH64_ADD_ABS_LO12_NC,
            lo_at as u64,
            0,
        );
    }

    fn load_sym_addr_got(asm: &mut Assembler, dst: Reg, sym: SymRef) {
        let page_at = encode::adrp(asm, encode::hw(dst));
        asm.reloc_text(
            sym,
            crate::asm::elf::R_AARCH64_ADR_GOT_PAGE,
            page_at as u64,
            0,
        );
        let lo_at = encode::ldr_lo12(asm, encode::hw(dst), encode::hw(dst));
        asm.reloc_text(
            sym,
            crate::asm::elf::R_AARCH64_LD64_GOT_LO12_NC,
            lo_at as u64,
            0,
        );
    }

    fn tls_global_dynamic_addr(asm: &mut Assembler, sym: SymRef, _helper: SymRef) {
        // TLSDESC sequence: adrp x0; ldr x1, [x0, #lo12]; add x0, x0,
        // #lo12; blr x1 -- each instruction relocated so the linker can
        // relax the descriptor call.
        use crate::asm::elf;
        let at = encode::adrp(asm, 0);
        asm.reloc_text(sym, elf::R_AARCH64_TLSDESC_ADR_PAGE21, at as u64, 0);
        let at = encode::ldr_lo12(asm, 1, 0);
        asm.reloc_text(sym, elf::R_AARCH64_TLSDESC_LD64_LO12, at as u64, 0);
        let at = encode::add_lo12(asm, 0, 0);
        asm.reloc_text(sym, elf::R_AARCH64_TLSDESC_ADD_LO12, at as u64, 0);
        let at = asm.text_off();
        encode::blr(asm, 1);
        asm.reloc_text(sym, elf::R_AARCH64_TLSDESC_CALL, at as u64, 0);
    }

    fn alu_rr(asm: &mut Assembler, op: AluOp, dst: Reg, src: Reg, size: u32) {
        let d = encode::hw(dst);
        let s = encode::hw(src);
        let size = size.max(4);
        match op {
            AluOp::Add => encode::add_rr(asm, d, d, s, size),
            AluOp::Sub => encode::sub_rr(asm, d, d, s, size),
            AluOp::And => encode::and_rr(asm, d, d, s, size),
            AluOp::Or => encode::orr_rr(asm, d, d, s, size),
            AluOp::Xor => encode::eor_rr(asm, d, d, s, size),
        }
    }

    fn cmp_rr(asm: &mut Assembler, lhs: Reg, rhs: Reg, size: u32) {
        encode::cmp_rr(asm, encode::hw(lhs), encode::hw(rhs), size.max(4));
    }

    fn setcc(asm: &mut Assembler, cond: Cond, dst: Reg) {
        encode::cset(asm, encode::hw(dst), cond_code(cond));
    }

    fn jump(asm: &mut Assembler, label: Label) {
        let at = encode::b(asm);
        asm.label_fixup(label, FixupKind::Aarch64Branch26, at);
    }

    fn branch_cond(asm: &mut Assembler, cond: Cond, label: Label) {
        let at = encode::b_cond(asm, cond_code(cond));
        asm.label_fixup(label, FixupKind::Aarch64Cond19, at);
    }

    fn call_sym(asm: &mut Assembler, sym: SymRef) {
        let at = encode::bl(asm);
        asm.reloc_text(sym, crate::asm::elf::R_AARCH64_CALL26, at as u64, 0);
    }

    fn call_reg(asm: &mut Assembler, reg: Reg) {
        encode::blr(asm, encode::hw(reg));
    }

    fn sub_sp_placeholder(asm: &mut Assembler) -> u32 {
        let at = asm.text_off();
        // sub sp, sp, #hi, lsl #12 ; sub sp, sp, #lo -- patched later.
        encode::put(asm, 0xd100_0000 | 1 << 22 | 31 << 5 | 31);
        encode::put(asm, 0xd100_0000 | 31 << 5 | 31);
        at
    }

    fn patch_sub_sp(asm: &mut Assembler, at: u32, amount: u32) {
        // Amounts beyond 24 bits are rejected by the driver's
        // MAX_FRAME_SIZE check before any patching happens.
        let hi = (amount >> 12) & 0xfff;
        let lo = amount & 0xfff;
        let w0 = 0xd100_0000u32 | 1 << 22 | hi << 10 | 31 << 5 | 31;
        let w1 = 0xd100_0000u32 | lo << 10 | 31 << 5 | 31;
        let text = asm.text_mut();
        text[at as usize..at as usize + 4].copy_from_slice(&w0.to_le_bytes());
        text[at as usize + 4..at as usize + 8].copy_from_slice(&w1.to_le_bytes());
    }

    fn add_sp(asm: &mut Assembler, amount: u32) {
        encode::add_sub_imm(asm, encode::SP, encode::SP, amount as i64);
    }

    fn start_func(asm: &mut Assembler, st: &mut FrameState) {
        *st = FrameState::default();
        asm.align_text(16);
        asm.except_begin_func();
    }

    fn emit_prologue(asm: &mut Assembler, st: &mut FrameState, is_vararg: bool) -> PrologueInfo {
        st.func_start_off = asm.text_off();
        st.scalar_arg_count = !0;
        st.vec_arg_count = !0;

        encode::stp_pre(asm, encode::FP, encode::LR, encode::SP, -16);
        encode::add_sub_imm(asm, encode::FP, encode::SP, 0);

        st.reg_save_off = asm.text_off();
        for _ in 0..REG_SAVE_WORDS {
            encode::nop(asm);
        }

        st.frame_size_setup_off = Self::sub_sp_placeholder(asm);

        let mut reserved = 8 * 10; // x19..x28
        let mut vararg_save_off = 0;
        if is_vararg {
            reserved += VARARG_SAVE_SIZE;
            vararg_save_off = reserved;
            st.reg_save_frame_off = reserved;
            let base = -(reserved as i32);
            for i in 0..4 {
                encode::stp(asm, 2 * i, 2 * i + 1, encode::FP, base + 16 * i as i32);
            }
            for i in 0..4u8 {
                // q pairs land after the 64 bytes of GP saves.
                encode::stp_q(asm, 2 * i, 2 * i + 1, encode::FP, base + 64 + 32 * i as i32);
            }
        }

        PrologueInfo {
            func_start_off: st.func_start_off,
            reserved_frame_size: reserved,
            vararg_save_off,
        }
    }

    fn record_vararg_info(st: &mut FrameState, gp: u32, fp: u32, overflow_off: u32) {
        st.scalar_arg_count = gp;
        st.vec_arg_count = fp;
        st.var_arg_stack_off = overflow_off;
    }

    fn emit_epilogue_placeholder(asm: &mut Assembler, st: &mut FrameState) {
        st.ret_offs.push(asm.text_off());
        for _ in 0..REG_SAVE_WORDS {
            encode::nop(asm);
        }
        encode::add_sub_imm(asm, encode::SP, encode::FP, 0); // mov sp, x29
        encode::ldp_post(asm, encode::FP, encode::LR, encode::SP, 16);
        encode::ret(asm);
    }

    fn finish_func(asm: &mut Assembler, st: &mut FrameState, fin: &FuncFinishInfo) {
        let fde = asm.eh_begin_fde(fin.personality);
        // stp x29, x30, [sp, #-16]!
        asm.eh_advance_loc(4);
        asm.eh_def_cfa_offset(16);
        asm.eh_cfa_offset(29, 2);
        asm.eh_cfa_offset(30, 1);
        // mov x29, sp
        asm.eh_advance_loc(4);
        asm.eh_def_cfa_register(29);

        // Fill the save area with stp pairs (stur for an odd trailer),
        // storing the i-th saved register at [x29 - 8*(i+1)].
        let saved = fin.clobbered & CC_INFO.callee_saved;
        let regs: SmallVec<[Reg; 10]> = crate::regfile::regs_in(saved).collect();
        let mut words: SmallVec<[u32; REG_SAVE_WORDS as usize]> = SmallVec::new();
        let mut i = 0;
        while i + 1 < regs.len() {
            // regs[i] lives at [x29 - 8*(i+1)]; the pair store ascends, so
            // the higher-indexed register is named first.
            let off = -(8 * (i as i32 + 2));
            words.push(encode::stp_word(
                encode::hw(regs[i + 1]),
                encode::hw(regs[i]),
                encode::FP,
                off,
            ));
            i += 2;
        }
        if i < regs.len() {
            let off = -(8 * (i as i32 + 1));
            words.push(
                0xf800_0000 | ((off as u32) & 0x1ff) << 12 | (encode::FP as u32) << 5
                    | encode::hw(regs[i]) as u32,
            );
        }
        debug_assert!(words.len() <= REG_SAVE_WORDS as usize);
        {
            let text = asm.text_mut();
            for (k, w) in words.iter().enumerate() {
                let at = st.reg_save_off as usize + 4 * k;
                text[at..at + 4].copy_from_slice(&w.to_le_bytes());
            }
        }

        asm.eh_advance_loc(4 * REG_SAVE_WORDS);
        for (k, reg) in regs.iter().enumerate() {
            asm.eh_cfa_offset(encode::hw(*reg), k as u64 + 3);
        }

        let final_frame_size = (fin.frame_size + 15) & !15;
        Self::patch_sub_sp(asm, st.frame_size_setup_off, final_frame_size);

        // Epilogue restore slots.
        let mut restore: SmallVec<[u32; REG_SAVE_WORDS as usize]> = SmallVec::new();
        let mut i = 0;
        while i + 1 < regs.len() {
            restore.push(encode::ldp_word(
                encode::hw(regs[i + 1]),
                encode::hw(regs[i]),
                encode::FP,
                -(8 * (i as i32 + 2)),
            ));
            i += 2;
        }
        if i < regs.len() {
            let off = -(8 * (i as i32 + 1));
            restore.push(
                0xf840_0000 | ((off as u32) & 0x1ff) << 12 | (encode::FP as u32) << 5
                    | encode::hw(regs[i]) as u32,
            );
        }
        {
            let text = asm.text_mut();
            for &ret_off in &st.ret_offs {
                for (k, w) in restore.iter().enumerate() {
                    let at = ret_off as usize + 4 * k;
                    text[at..at + 4].copy_from_slice(&w.to_le_bytes());
                }
            }
        }

        let func_size = asm.text_off() - fin.func_start_off;
        asm.sym_def(
            fin.func_sym,
            asm.text_section(),
            fin.func_start_off as u64,
            func_size as u64,
        );
        asm.eh_end_fde(fde, fin.func_sym);
        asm.except_encode_func(fin.func_sym);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aapcs_eight_gp_args_then_stack() {
        let mut cc = CcAssignerAapcs::new(false);
        for i in 0..8 {
            let mut a = CcAssignment::part(GP_BANK, 8);
            cc.assign_arg(&mut a);
            assert_eq!(a.reg, Some(Reg::new(i)));
        }
        let mut a = CcAssignment::part(GP_BANK, 8);
        cc.assign_arg(&mut a);
        assert_eq!(a.reg, None);
        assert_eq!(a.stack_off, 0);
        assert_eq!(cc.stack_size(), 8);
    }

    #[test]
    fn aapcs_fp_args_use_v_regs() {
        let mut cc = CcAssignerAapcs::new(false);
        let mut a = CcAssignment::part(FP_BANK, 8);
        cc.assign_arg(&mut a);
        assert_eq!(a.reg, Some(V0));
    }

    #[test]
    fn aapcs_returns() {
        let mut cc = CcAssignerAapcs::new(false);
        let mut r = CcAssignment::part(GP_BANK, 8);
        cc.assign_ret(&mut r);
        assert_eq!(r.reg, Some(X0));
        let mut r1 = CcAssignment::part(GP_BANK, 8);
        cc.assign_ret(&mut r1);
        assert_eq!(r1.reg, Some(X1));
    }

    #[test]
    fn reserved_registers_are_not_allocatable() {
        for id in [16u8, 17, 18, 29, 30, 31] {
            assert_eq!(CC_INFO.allocatable & Reg::new(id).bit(), 0, "x{id}");
        }
        // v8-v15 are excluded.
        for i in 8..16u8 {
            assert_eq!(CC_INFO.allocatable & Reg::from_bank(FP_BANK, i).bit(), 0);
        }
        assert_eq!(CC_INFO.callee_saved & CC_INFO.arg_regs, 0);
    }

    #[test]
    fn fixed_assignment_prefers_callee_saved() {
        let mut regs = RegisterFile::new();
        regs.reset(CC_INFO.allocatable);
        let r = Aarch64::select_fixed_assignment_reg(&regs, GP_BANK).unwrap();
        assert_eq!(r, X19);
        assert!(Aarch64::select_fixed_assignment_reg(&regs, FP_BANK).is_none());
    }
}
