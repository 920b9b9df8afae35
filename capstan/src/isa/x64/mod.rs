//! x86-64 SysV target.
//!
//! Frame shape: `push rbp; mov rbp, rsp`, a NOP-padded area that later
//! receives the callee-saved pushes, then `sub rsp, imm32` whose immediate
//! is back-patched with the final frame size. Locals are addressed
//! rbp-relative at negative offsets. Epilogues are emitted as fixed-size
//! placeholders and patched once the set of clobbered callee-saved
//! registers is known.

pub(crate) mod encode;

use crate::asm::{Assembler, FixupKind, Label, SymRef, TargetInfo};
use crate::cc::{CcAssigner, CcAssignment, CcInfo};
use crate::isa::{AluOp, Cond, FuncFinishInfo, Machine, PrologueInfo};
use crate::regfile::{Reg, RegBank, RegisterFile};
use smallvec::SmallVec;

pub const GP_BANK: RegBank = RegBank(0);
pub const FP_BANK: RegBank = RegBank(1);

pub const RAX: Reg = Reg::new(0);
pub const RCX: Reg = Reg::new(1);
pub const RDX: Reg = Reg::new(2);
pub const RBX: Reg = Reg::new(3);
pub const RSP: Reg = Reg::new(4);
pub const RBP: Reg = Reg::new(5);
pub const RSI: Reg = Reg::new(6);
pub const RDI: Reg = Reg::new(7);
pub const R8: Reg = Reg::new(8);
pub const R9: Reg = Reg::new(9);
pub const R10: Reg = Reg::new(10);
pub const R11: Reg = Reg::new(11);
pub const R12: Reg = Reg::new(12);
pub const R13: Reg = Reg::new(13);
pub const R14: Reg = Reg::new(14);
pub const R15: Reg = Reg::new(15);

pub const XMM0: Reg = Reg::from_bank(FP_BANK, 0);

const fn bitmask(regs: &[Reg]) -> u64 {
    let mut set = 0;
    let mut i = 0;
    while i < regs.len() {
        set |= 1u64 << regs[i].id();
        i += 1;
    }
    set
}

const GP_ARG_REGS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const CALLEE_SAVED: [Reg; 5] = [RBX, R12, R13, R14, R15];

static CC_INFO: CcInfo = CcInfo {
    allocatable: (0xffff & !bitmask(&[RSP, RBP])) | (0xffffu64 << 32),
    callee_saved: bitmask(&CALLEE_SAVED),
    arg_regs: bitmask(&GP_ARG_REGS) | (0xffu64 << 32),
};

static TARGET_INFO: TargetInfo = TargetInfo {
    elf_machine: crate::asm::elf::EM_X86_64,
    reloc_pc32: crate::asm::elf::R_X86_64_PC32,
    reloc_abs64: crate::asm::elf::R_X86_64_64,
    cie_code_align: 1,
    cie_data_align: -8,
    cie_return_addr_reg: 16,
    // def_cfa rsp, 8; offset ra at cfa-8.
    cie_initial_instrs: &[0x0c, 7, 8, 0x80 | 16, 1],
    nop: &[0x90],
};

/// DWARF register numbering differs from the hardware encoding for
/// rdx/rcx/rsi/rdi/rbp/rsp.
const GP_TO_DWARF: [u8; 16] = [0, 2, 1, 3, 7, 6, 4, 5, 8, 9, 10, 11, 12, 13, 14, 15];

/// Bytes reserved for callee-saved pushes: one for rbx, two for each of
/// r12-r15 (REX prefix).
const REG_SAVE_ALLOC: u32 = 1 + 2 * 4;
/// add/lea (7) + pops (9) + pop rbp (1) + ret (1).
const EPILOGUE_SIZE: u32 = 7 + REG_SAVE_ALLOC + 1 + 1;
/// SysV vararg register save area: 6 GP slots + 8 XMM slots.
const VARARG_SAVE_SIZE: u32 = 6 * 8 + 8 * 16;

fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Ult => 0x2,
        Cond::Uge => 0x3,
        Cond::Ule => 0x6,
        Cond::Ugt => 0x7,
        Cond::Slt => 0xc,
        Cond::Sge => 0xd,
        Cond::Sle => 0xe,
        Cond::Sgt => 0xf,
    }
}

/// SysV AMD64 argument assignment.
pub struct CcAssignerSysV {
    gp_cnt: u32,
    xmm_cnt: u32,
    stack: u32,
    /// The next N assignments are forced to the stack.
    must_assign_stack: u32,
    vararg: bool,
    ret_gp_cnt: u32,
    ret_xmm_cnt: u32,
}

impl CcAssignerSysV {
    pub fn new(vararg: bool) -> Self {
        CcAssignerSysV {
            gp_cnt: 0,
            xmm_cnt: 0,
            stack: 0,
            must_assign_stack: 0,
            vararg,
            ret_gp_cnt: 0,
            ret_xmm_cnt: 0,
        }
    }
}

impl CcAssigner for CcAssignerSysV {
    fn reset(&mut self) {
        *self = CcAssignerSysV::new(false);
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
            if self.must_assign_stack == 0
                && self.gp_cnt + arg.consecutive < GP_ARG_REGS.len() as u32
            {
                arg.reg = Some(GP_ARG_REGS[self.gp_cnt as usize]);
                self.gp_cnt += 1;
            } else {
                // This and the next `consecutive` parts go to the stack.
                self.must_assign_stack = arg.consecutive + 1;
                let align = arg.align.max(8);
                self.stack = (self.stack + align - 1) & !(align - 1);
                arg.stack_off = self.stack;
                self.stack += 8;
            }
        } else if self.must_assign_stack == 0 && self.xmm_cnt + arg.consecutive < 8 {
            arg.reg = Some(Reg::from_bank(FP_BANK, self.xmm_cnt as u8));
            self.xmm_cnt += 1;
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
            ret.reg = Some(if self.ret_gp_cnt == 0 { RAX } else { RDX });
            self.ret_gp_cnt += 1;
        } else {
            debug_assert!(self.ret_xmm_cnt < 2, "too many FP return parts");
            ret.reg = Some(Reg::from_bank(FP_BANK, self.ret_xmm_cnt as u8));
            self.ret_xmm_cnt += 1;
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
    /// Number of register arguments a vararg function received, recorded
    /// for a later `va_start` lowering.
    pub scalar_arg_count: u32,
    pub vec_arg_count: u32,
    pub var_arg_stack_off: u32,
    pub reg_save_frame_off: u32,
}

pub struct X64;

impl Machine for X64 {
    type FrameState = FrameState;
    type Cc = CcAssignerSysV;

    const GP_BANK: RegBank = GP_BANK;
    const FP_BANK: RegBank = FP_BANK;
    const NUM_BANKS: u8 = 2;
    const NUM_FIXED_ASSIGNMENTS: [u32; 2] = [5, 6];
    const FRAME_ARG_BASE: i32 = 0x10;
    const PTR_SIZE: u32 = 8;
    // The sign-extended imm32 of `sub rsp`.
    const MAX_FRAME_SIZE: u32 = 0x7fff_fff0;

    fn target_info() -> &'static TargetInfo {
        &TARGET_INFO
    }

    fn cc_info() -> &'static CcInfo {
        &CC_INFO
    }

    fn new_cc(vararg: bool) -> CcAssignerSysV {
        CcAssignerSysV::new(vararg)
    }

    fn arch() -> target_lexicon::Architecture {
        target_lexicon::Architecture::X86_64
    }

    fn select_fixed_assignment_reg(regs: &RegisterFile, bank: RegBank) -> Option<Reg> {
        let csr = CC_INFO.callee_saved;
        regs.find_first_free_excluding(bank, !csr)
            .or_else(|| regs.find_first_nonfixed_excluding(bank, !csr))
    }

    fn spill(asm: &mut Assembler, reg: Reg, frame_off: i32, size: u32) {
        if reg.bank() == GP_BANK {
            encode::store_gp(asm, encode::hw(reg), encode::RBP, frame_off, size);
        } else {
            encode::store_xmm(asm, encode::hw(reg), encode::RBP, frame_off, size);
        }
    }

    fn reload(asm: &mut Assembler, reg: Reg, frame_off: i32, size: u32) {
        if reg.bank() == GP_BANK {
            encode::load_gp(asm, encode::hw(reg), encode::RBP, frame_off, size);
        } else {
            encode::load_xmm(asm, encode::hw(reg), encode::RBP, frame_off, size);
        }
    }

    fn lea_stack(asm: &mut Assembler, dst: Reg, frame_off: i32) {
        encode::lea(asm, encode::hw(dst), Some(encode::RBP), None, frame_off);
    }

    fn store_sp(asm: &mut Assembler, reg: Reg, sp_off: u32, size: u32) {
        if reg.bank() == GP_BANK {
            encode::store_gp(asm, encode::hw(reg), encode::RSP, sp_off as i32, size);
        } else {
            encode::store_xmm(asm, encode::hw(reg), encode::RSP, sp_off as i32, size);
        }
    }

    fn load_sp(asm: &mut Assembler, reg: Reg, sp_off: u32, size: u32) {
        if reg.bank() == GP_BANK {
            encode::load_gp(asm, encode::hw(reg), encode::RSP, sp_off as i32, size);
        } else {
            encode::load_xmm(asm, encode::hw(reg), encode::RSP, sp_off as i32, size);
        }
    }

    fn mov(asm: &mut Assembler, dst: Reg, src: Reg, size: u32) {
        debug_assert_eq!(dst.bank(), src.bank());
        if dst.bank() == GP_BANK {
            encode::mov_rr(asm, encode::hw(dst), encode::hw(src), size.max(4));
        } else {
            encode::movaps_rr(asm, encode::hw(dst), encode::hw(src));
        }
    }

    fn materialize_const(asm: &mut Assembler, dst: Reg, value: u64, size: u32) {
        debug_assert_eq!(dst.bank(), GP_BANK);
        encode::mov_ri(asm, encode::hw(dst), value, size);
    }

    fn ext(asm: &mut Assembler, dst: Reg, src: Reg, signed: bool, from_bits: u32, to_bits: u32) {
        encode::ext(asm, encode::hw(dst), encode::hw(src), signed, from_bits, to_bits);
    }

    fn load_mem(asm: &mut Assembler, dst: Reg, base: Reg, off: i32, size: u32) {
        if dst.bank() == GP_BANK {
            encode::load_gp(asm, encode::hw(dst), encode::hw(base), off, size);
        } else {
            encode::load_xmm(asm, encode::hw(dst), encode::hw(base), off, size);
        }
    }

    fn store_mem(asm: &mut Assembler, src: Reg, base: Reg, off: i32, size: u32) {
        if src.bank() == GP_BANK {
            encode::store_gp(asm, encode::hw(src), encode::hw(base), off, size);
        } else {
            encode::store_xmm(asm, encode::hw(src), encode::hw(base), off, size);
        }
    }

    fn lea(asm: &mut Assembler, dst: Reg, base: Option<Reg>, index: Option<(Reg, u8)>, disp: i64) {
        let disp = i32::try_from(disp).expect("displacement exceeds 32 bits");
        encode::lea(
            asm,
            encode::hw(dst),
            base.map(encode::hw),
            index.map(|(r, s)| (encode::hw(r), s)),
            disp,
        );
    }

    fn load_sym_addr(asm: &mut Assembler, dst: Reg, sym: SymRef) {
        let field = encode::lea_rip(asm, encode::hw(dst));
        asm.reloc_text(sym, crate::asm::elf::R_X86_64_PC32, field as u64, -4);
    }

    fn load_sym_addr_got(asm: &mut Assembler, dst: Reg, sym: SymRef) {
        let field = encode::mov_rip(asm, encode::hw(dst));
        asm.reloc_text(sym, crate::asm::elf::R_X86_64_GOTPCREL, field as u64, -4);
    }

    fn tls_global_dynamic_addr(asm: &mut Assembler, sym: SymRef, helper: SymRef) {
        // The canonical padded general-dynamic sequence the linker knows
        // how to relax: data16 lea rdi, [rip+sym@tlsgd];
        // data16 data16 rex.w call __tls_get_addr@plt.
        asm.put(&[0x66, 0x48, 0x8d, 0x3d]);
        let field = asm.text_off();
        asm.put4(0);
        asm.reloc_text(sym, crate::asm::elf::R_X86_64_TLSGD, field as u64, -4);
        asm.put(&[0x66, 0x66, 0x48, 0xe8]);
        let field = asm.text_off();
        asm.put4(0);
        asm.reloc_text(helper, crate::asm::elf::R_X86_64_PLT32, field as u64, -4);
    }

    fn alu_rr(asm: &mut Assembler, op: AluOp, dst: Reg, src: Reg, size: u32) {
        let opcode = match op {
            AluOp::Add => encode::OP_ADD,
            AluOp::Sub => encode::OP_SUB,
            AluOp::And => encode::OP_AND,
            AluOp::Or => encode::OP_OR,
            AluOp::Xor => encode::OP_XOR,
        };
        encode::alu_rr(asm, opcode, encode::hw(dst), encode::hw(src), size.max(4));
    }

    fn cmp_rr(asm: &mut Assembler, lhs: Reg, rhs: Reg, size: u32) {
        encode::alu_rr(asm, encode::OP_CMP, encode::hw(lhs), encode::hw(rhs), size.max(4));
    }

    fn setcc(asm: &mut Assembler, cond: Cond, dst: Reg) {
        encode::setcc_zx(asm, cond_code(cond), encode::hw(dst));
    }

    fn jump(asm: &mut Assembler, label: Label) {
        let field = encode::jmp32(asm);
        asm.label_fixup(label, FixupKind::Rel32, field);
    }

    fn branch_cond(asm: &mut Assembler, cond: Cond, label: Label) {
        let field = encode::jcc32(asm, cond_code(cond));
        asm.label_fixup(label, FixupKind::Rel32, field);
    }

    fn call_sym(asm: &mut Assembler, sym: SymRef) {
        let field = encode::call32(asm);
        asm.reloc_text(sym, crate::asm::elf::R_X86_64_PLT32, field as u64, -4);
    }

    fn call_reg(asm: &mut Assembler, reg: Reg) {
        encode::call_r(asm, encode::hw(reg));
    }

    fn vararg_call_setup(asm: &mut Assembler, fp_reg_args: u32) {
        encode::mov_ri(asm, encode::RAX, fp_reg_args as u64, 4);
    }

    fn sub_sp_placeholder(asm: &mut Assembler) -> u32 {
        let at = asm.text_off();
        encode::sub_rsp_imm32(asm, 0x7fff_ffff);
        at
    }

    fn patch_sub_sp(asm: &mut Assembler, at: u32, amount: u32) {
        let text = asm.text_mut();
        text[at as usize + 3..at as usize + 7].copy_from_slice(&amount.to_le_bytes());
    }

    fn add_sp(asm: &mut Assembler, amount: u32) {
        encode::add_rsp_imm32(asm, amount);
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

        encode::push64(asm, encode::RBP);
        encode::mov_rr(asm, encode::RBP, encode::RSP, 8);

        st.reg_save_off = asm.text_off();
        asm.put(&[0x90; REG_SAVE_ALLOC as usize]);

        st.frame_size_setup_off = asm.text_off();
        encode::sub_rsp_imm32(asm, 0x7fff_ffff);

        let mut reserved = 8 * CALLEE_SAVED.len() as u32;
        let mut vararg_save_off = 0;
        if is_vararg {
            reserved += VARARG_SAVE_SIZE;
            vararg_save_off = reserved;
            st.reg_save_frame_off = reserved;
            let base = -(reserved as i32);
            for (i, reg) in GP_ARG_REGS.iter().enumerate() {
                encode::store_gp(asm, encode::hw(*reg), encode::RBP, base + 8 * i as i32, 8);
            }
            let skip_fp = asm.label_create();
            encode::test_al(asm);
            let field = encode::jcc32(asm, cond_code(Cond::Eq));
            asm.label_fixup(skip_fp, FixupKind::Rel32, field);
            for i in 0..8u8 {
                encode::store_xmm(asm, i, encode::RBP, base + 48 + 16 * i as i32, 16);
            }
            asm.label_place(skip_fp);
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
        asm.put(&[0x90; EPILOGUE_SIZE as usize]);
    }

    fn finish_func(asm: &mut Assembler, st: &mut FrameState, fin: &FuncFinishInfo) {
        let fde = asm.eh_begin_fde(fin.personality);
        // push rbp
        asm.eh_advance_loc(1);
        asm.eh_def_cfa_offset(16);
        asm.eh_cfa_offset(GP_TO_DWARF[encode::RBP as usize], 2);
        // mov rbp, rsp
        asm.eh_advance_loc(3);
        asm.eh_def_cfa_register(GP_TO_DWARF[encode::RBP as usize]);

        // Turn the NOP area into the real callee-saved pushes.
        let saved = fin.clobbered & CC_INFO.callee_saved;
        let mut push_bytes: SmallVec<[u8; REG_SAVE_ALLOC as usize]> = SmallVec::new();
        let mut num_saved = 0u32;
        for reg in crate::regfile::regs_in(saved) {
            let id = reg.id();
            if id >= 8 {
                push_bytes.push(0x41);
            }
            push_bytes.push(0x50 + (id & 7));
            num_saved += 1;
        }
        debug_assert!(push_bytes.len() <= REG_SAVE_ALLOC as usize);
        let save_at = st.reg_save_off as usize;
        asm.text_mut()[save_at..save_at + push_bytes.len()].copy_from_slice(&push_bytes);

        asm.eh_advance_loc(push_bytes.len() as u32);
        for (i, reg) in crate::regfile::regs_in(saved).enumerate() {
            asm.eh_cfa_offset(GP_TO_DWARF[reg.id() as usize], i as u64 + 3);
        }

        // Patch the frame allocation.
        let final_frame_size = ((fin.frame_size + 15) & !15) - 8 * num_saved;
        let imm_at = st.frame_size_setup_off as usize + 3;
        asm.text_mut()[imm_at..imm_at + 4].copy_from_slice(&final_frame_size.to_le_bytes());

        // Build the concrete epilogue once, then stamp it over every
        // placeholder. All instructions here have fixed encodings.
        let mut bytes: SmallVec<[u8; EPILOGUE_SIZE as usize]> = SmallVec::new();
        if fin.has_dynamic_alloca {
            if num_saved == 0 {
                bytes.extend_from_slice(&[0x48, 0x89, 0xec]); // mov rsp, rbp
            } else {
                bytes.extend_from_slice(&[0x48, 0x8d, 0xa5]); // lea rsp, [rbp - d]
                bytes.extend_from_slice(&(-(8 * num_saved as i32)).to_le_bytes());
            }
        } else {
            bytes.extend_from_slice(&[0x48, 0x81, 0xc4]); // add rsp, imm32
            bytes.extend_from_slice(&final_frame_size.to_le_bytes());
        }
        let mut regs: SmallVec<[Reg; 5]> = crate::regfile::regs_in(saved).collect();
        regs.reverse();
        for reg in regs {
            let id = reg.id();
            if id >= 8 {
                bytes.push(0x41);
            }
            bytes.push(0x58 + (id & 7));
        }
        bytes.push(0x58 + encode::RBP); // pop rbp
        bytes.push(0xc3); // ret
        debug_assert!(bytes.len() <= EPILOGUE_SIZE as usize);
        for &ret_off in &st.ret_offs {
            let at = ret_off as usize;
            asm.text_mut()[at..at + bytes.len()].copy_from_slice(&bytes);
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
    fn sysv_gp_args_then_stack() {
        let mut cc = CcAssignerSysV::new(false);
        let mut regs = Vec::new();
        for _ in 0..8 {
            let mut a = CcAssignment::part(GP_BANK, 8);
            cc.assign_arg(&mut a);
            regs.push((a.reg, a.stack_off));
        }
        let expect: Vec<Reg> = GP_ARG_REGS.to_vec();
        for (i, r) in expect.iter().enumerate() {
            assert_eq!(regs[i].0, Some(*r));
        }
        assert_eq!(regs[6], (None, 0));
        assert_eq!(regs[7], (None, 8));
        assert_eq!(cc.stack_size(), 16);
    }

    #[test]
    fn sysv_consecutive_rule_forces_stack() {
        // Five GP regs are taken; a two-part aggregate does not fit in the
        // last register and must go to the stack entirely.
        let mut cc = CcAssignerSysV::new(false);
        for _ in 0..5 {
            let mut a = CcAssignment::part(GP_BANK, 8);
            cc.assign_arg(&mut a);
            assert!(a.reg.is_some());
        }
        let mut lo = CcAssignment::part(GP_BANK, 8);
        lo.consecutive = 1;
        cc.assign_arg(&mut lo);
        assert_eq!(lo.reg, None);
        let mut hi = CcAssignment::part(GP_BANK, 8);
        cc.assign_arg(&mut hi);
        assert_eq!(hi.reg, None);
        assert_eq!(lo.stack_off, 0);
        assert_eq!(hi.stack_off, 8);
    }

    #[test]
    fn sysv_byval_consumes_stack_only() {
        let mut cc = CcAssignerSysV::new(false);
        let mut a = CcAssignment {
            byval: true,
            byval_size: 20,
            byval_align: 4,
            ..Default::default()
        };
        cc.assign_arg(&mut a);
        assert_eq!(a.reg, None);
        assert_eq!(a.stack_off, 0);
        assert_eq!(cc.stack_size(), 24);
        // GP assignment is unaffected.
        let mut b = CcAssignment::part(GP_BANK, 8);
        cc.assign_arg(&mut b);
        assert_eq!(b.reg, Some(RDI));
    }

    #[test]
    fn sysv_fp_args_use_xmm() {
        let mut cc = CcAssignerSysV::new(false);
        let mut a = CcAssignment::part(FP_BANK, 8);
        cc.assign_arg(&mut a);
        assert_eq!(a.reg, Some(XMM0));
    }

    #[test]
    fn sysv_returns() {
        let mut cc = CcAssignerSysV::new(false);
        let mut r0 = CcAssignment::part(GP_BANK, 8);
        cc.assign_ret(&mut r0);
        assert_eq!(r0.reg, Some(RAX));
        let mut r1 = CcAssignment::part(GP_BANK, 8);
        cc.assign_ret(&mut r1);
        assert_eq!(r1.reg, Some(RDX));
    }

    #[test]
    fn tls_general_dynamic_sequence() {
        use crate::asm::{Assembler, SymBinding};
        let mut a = Assembler::new(X64::target_info());
        let var = a.sym_predef_tls("tls_var", SymBinding::Global);
        let helper = a.sym_add_undef("__tls_get_addr", SymBinding::Global);
        X64::tls_global_dynamic_addr(&mut a, var, helper);

        // The padded, linker-relaxable form is exactly 16 bytes.
        let text = &a.section(a.text_section()).data;
        assert_eq!(text.len(), 16);
        assert_eq!(&text[0..4], &[0x66, 0x48, 0x8d, 0x3d]);
        let relocs = &a.section(a.text_section()).relocs;
        assert_eq!(relocs.len(), 2);
        assert_eq!(relocs[0].kind, crate::asm::elf::R_X86_64_TLSGD);
        assert_eq!(relocs[1].kind, crate::asm::elf::R_X86_64_PLT32);
    }

    #[test]
    fn callee_saved_are_not_arg_regs() {
        assert_eq!(CC_INFO.callee_saved & CC_INFO.arg_regs, 0);
        // rsp/rbp are never allocatable.
        assert_eq!(CC_INFO.allocatable & (RSP.bit() | RBP.bit()), 0);
        // Argument registers must be allocatable.
        assert_eq!(CC_INFO.allocatable & CC_INFO.arg_regs, CC_INFO.arg_regs);
    }
}
