//! Target abstraction.
//!
//! A [`Machine`] supplies everything target-specific the generic compiler
//! needs: register conventions, the calling-convention assigner, and a
//! closed set of emission primitives. The primitives are deliberately a
//! thin, opaque surface: the core never inspects emitted bytes, it only
//! remembers patch offsets handed back by the placeholder emitters.
//!
//! Machine methods are associated functions. Mutable per-function state
//! (placeholder offsets, epilogue positions, vararg bookkeeping) lives in
//! `Machine::FrameState`, owned by the codegen context.

pub mod aarch64;
pub mod x64;

use crate::asm::{Assembler, Label, SymRef, TargetInfo};
use crate::cc::{CcAssigner, CcInfo};
use crate::regfile::{Reg, RegBank, RegBitSet, RegisterFile};

/// Integer comparison conditions understood by both targets.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Slt => Cond::Sge,
            Cond::Sle => Cond::Sgt,
            Cond::Sgt => Cond::Sle,
            Cond::Sge => Cond::Slt,
            Cond::Ult => Cond::Uge,
            Cond::Ule => Cond::Ugt,
            Cond::Ugt => Cond::Ule,
            Cond::Uge => Cond::Ult,
        }
    }
}

/// Two-operand integer ALU operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// Everything `finish_func` needs to seal a function.
pub struct FuncFinishInfo {
    pub func_sym: SymRef,
    pub func_start_off: u32,
    /// Final logical frame size (locals plus reserved register-save area).
    pub frame_size: u32,
    pub clobbered: RegBitSet,
    pub has_dynamic_alloca: bool,
    pub personality: Option<SymRef>,
}

/// The per-target emission surface.
pub trait Machine: Sized {
    /// Mutable per-function state: placeholder offsets, return sites.
    type FrameState: Default;
    /// The target's calling-convention assigner.
    type Cc: CcAssigner;

    const GP_BANK: RegBank;
    const FP_BANK: RegBank;
    const NUM_BANKS: u8;
    /// Per-bank cap on fixed (lifetime-dedicated) register assignments.
    const NUM_FIXED_ASSIGNMENTS: [u32; 2];
    /// Frame-pointer offset of the first stack-passed argument.
    const FRAME_ARG_BASE: i32;
    const PTR_SIZE: u32;
    /// Largest (16-byte-aligned) stack adjustment the `sub sp`
    /// placeholders can encode. Functions whose final frame exceeds this
    /// are rejected as unsupported rather than miscompiled.
    const MAX_FRAME_SIZE: u32;

    fn target_info() -> &'static TargetInfo;
    fn cc_info() -> &'static CcInfo;
    fn new_cc(vararg: bool) -> Self::Cc;
    fn arch() -> target_lexicon::Architecture;

    /// Pick a register that may serve as a fixed assignment in `bank`,
    /// preferring callee-saved registers that are currently free.
    fn select_fixed_assignment_reg(regs: &RegisterFile, bank: RegBank) -> Option<Reg>;

    // Data movement. `frame_off` is a signed frame-pointer offset.

    fn spill(asm: &mut Assembler, reg: Reg, frame_off: i32, size: u32);
    fn reload(asm: &mut Assembler, reg: Reg, frame_off: i32, size: u32);
    /// Load the address `fp + frame_off` into `dst`.
    fn lea_stack(asm: &mut Assembler, dst: Reg, frame_off: i32);
    /// Store to the outgoing argument area at `sp + sp_off`.
    fn store_sp(asm: &mut Assembler, reg: Reg, sp_off: u32, size: u32);
    /// Load from the outgoing argument area at `sp + sp_off`.
    fn load_sp(asm: &mut Assembler, reg: Reg, sp_off: u32, size: u32);
    fn mov(asm: &mut Assembler, dst: Reg, src: Reg, size: u32);
    /// Materialize a constant into a general-purpose register.
    fn materialize_const(asm: &mut Assembler, dst: Reg, value: u64, size: u32);
    /// Sign- or zero-extend `src` into `dst`.
    fn ext(asm: &mut Assembler, dst: Reg, src: Reg, signed: bool, from_bits: u32, to_bits: u32);
    /// Load from `[base + off]`.
    fn load_mem(asm: &mut Assembler, dst: Reg, base: Reg, off: i32, size: u32);
    /// Store to `[base + off]`.
    fn store_mem(asm: &mut Assembler, src: Reg, base: Reg, off: i32, size: u32);

    // Address formation and symbols.

    /// `dst = base + index*2^scale + disp`; any component may be absent.
    fn lea(asm: &mut Assembler, dst: Reg, base: Option<Reg>, index: Option<(Reg, u8)>, disp: i64);
    /// Load the address of `sym` (PC-relative, relocated).
    fn load_sym_addr(asm: &mut Assembler, dst: Reg, sym: SymRef);
    /// Load the address of `sym` through the GOT.
    fn load_sym_addr_got(asm: &mut Assembler, dst: Reg, sym: SymRef);
    /// General-dynamic TLS access: leaves the address of thread-local
    /// `sym` in the convention's first return register. `helper` is
    /// `__tls_get_addr` (or the TLSDESC resolver's dummy on AArch64). The
    /// caller is responsible for treating this as a call site (clobbers).
    fn tls_global_dynamic_addr(asm: &mut Assembler, sym: SymRef, helper: SymRef);

    // ALU.

    fn alu_rr(asm: &mut Assembler, op: AluOp, dst: Reg, src: Reg, size: u32);
    fn cmp_rr(asm: &mut Assembler, lhs: Reg, rhs: Reg, size: u32);
    /// Materialize the last comparison's `cond` as 0/1 in `dst`.
    fn setcc(asm: &mut Assembler, cond: Cond, dst: Reg);

    // Control flow.

    fn jump(asm: &mut Assembler, label: Label);
    /// Conditional branch on the last comparison.
    fn branch_cond(asm: &mut Assembler, cond: Cond, label: Label);
    fn call_sym(asm: &mut Assembler, sym: SymRef);
    fn call_reg(asm: &mut Assembler, reg: Reg);
    /// Target hook run right before a variadic call (x86-64 sets `al` to
    /// the number of vector registers used by the arguments).
    fn vararg_call_setup(_asm: &mut Assembler, _fp_reg_args: u32) {}

    // Call-site stack adjustment.

    /// Emit a maximal `sub sp` whose immediate is patched later; returns
    /// the patch cookie.
    fn sub_sp_placeholder(asm: &mut Assembler) -> u32;
    fn patch_sub_sp(asm: &mut Assembler, at: u32, amount: u32);
    fn add_sp(asm: &mut Assembler, amount: u32);

    // Function skeleton.

    /// Per-function setup before any code: alignment, exception-table
    /// reset.
    fn start_func(asm: &mut Assembler, st: &mut Self::FrameState);
    /// Prologue up to (and including) the frame-size placeholder. Reserves
    /// the callee-save area in `reserved_frame_size`.
    fn emit_prologue(
        asm: &mut Assembler,
        st: &mut Self::FrameState,
        is_vararg: bool,
    ) -> PrologueInfo;
    /// Record the register/overflow-area split a vararg function saw, for
    /// a later `va_start` lowering.
    fn record_vararg_info(
        _st: &mut Self::FrameState,
        _gp_regs_used: u32,
        _fp_regs_used: u32,
        _overflow_off: u32,
    ) {
    }

    /// Reserve space for one epilogue; patched in `finish_func`.
    fn emit_epilogue_placeholder(asm: &mut Assembler, st: &mut Self::FrameState);
    /// Patch prologue and epilogues, emit the FDE and exception table,
    /// define the function symbol.
    fn finish_func(asm: &mut Assembler, st: &mut Self::FrameState, fin: &FuncFinishInfo);
}

/// What the generic driver learns from `emit_prologue`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrologueInfo {
    /// Text offset the function starts at.
    pub func_start_off: u32,
    /// Initial frame size: bytes reserved below the frame pointer for
    /// callee-saved registers (and the vararg save area, if any).
    pub reserved_frame_size: u32,
    /// Frame-pointer offset of the vararg register save area, if emitted.
    pub vararg_save_off: u32,
}
