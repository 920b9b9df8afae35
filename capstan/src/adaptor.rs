//! The interface between the backend and the source IR.
//!
//! The compiler core never inspects IR data structures directly; everything
//! it needs flows through [`IrAdaptor`]. An adaptor is expected to be cheap:
//! the methods here sit on per-instruction paths and should be simple loads.
//!
//! References (`Value`, `Inst`, `Block`, `Func`) are small copyable tokens,
//! typically `entity_impl!` indices. The adaptor additionally assigns every
//! value a dense per-function [`ValLocalIdx`] so the core can keep its
//! per-value state in flat arrays.

use crate::ValLocalIdx;
use core::fmt::Debug;
use core::hash::Hash;

/// Linkage of a function or data symbol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linkage {
    /// Visible outside the module.
    Export,
    /// Visible outside the module, may be overridden at link time.
    Weak,
    /// Only visible inside the module.
    Local,
}

/// Thread-local storage access mode for TLS globals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TlsModel {
    GlobalDynamic,
    LocalDynamic,
    InitialExec,
    LocalExec,
}

/// The source-IR surface consumed by the compiler core.
///
/// Iteration contracts: `cur_blocks` yields the entry block first and is
/// otherwise in an arbitrary but stable order (the analyzer's layout favors
/// keeping same-loop-level blocks in this order). `block_insts` yields the
/// non-PHI instructions of a block in program order; PHIs are reported
/// separately through `block_phis`.
pub trait IrAdaptor {
    /// A reference to an SSA value.
    type Value: Copy + Eq + Hash + Debug;
    /// A reference to an instruction.
    type Inst: Copy + Debug;
    /// A reference to a basic block.
    type Block: Copy + Eq + Hash + Debug;
    /// A reference to a function.
    type Func: Copy + Debug;

    // Module-level queries.

    /// Number of functions in the module.
    fn func_count(&self) -> u32;
    /// All functions, in symbol-creation order.
    fn funcs(&self) -> impl Iterator<Item = Self::Func> + '_;
    /// Linkage name of a function.
    fn func_link_name(&self, func: Self::Func) -> &str;
    /// Whether the function is a declaration without a body.
    fn func_extern(&self, func: Self::Func) -> bool;
    /// Symbol linkage of a function.
    fn func_linkage(&self, func: Self::Func) -> Linkage;

    /// Switch the adaptor to a function before compiling it. Returning
    /// `false` marks the function unsupported; the driver skips it.
    fn switch_func(&mut self, func: Self::Func) -> bool;
    /// Forget all per-module state so the adaptor can be reused.
    fn reset(&mut self);

    // Queries about the current function (valid after `switch_func`).

    /// One past the highest `ValLocalIdx` used by the current function.
    fn cur_val_count(&self) -> u32;
    /// Whether the current function needs `.eh_frame` unwind info.
    fn cur_needs_unwind_info(&self) -> bool {
        true
    }
    /// Whether the current function takes variable arguments.
    fn cur_is_vararg(&self) -> bool;
    /// The arguments of the current function, as values.
    fn cur_args(&self) -> impl Iterator<Item = Self::Value> + '_;
    /// Whether argument `idx` is passed by value on the stack (a large
    /// aggregate the callee addresses in the caller's frame).
    fn cur_arg_is_byval(&self, idx: u32) -> bool;
    /// Size in bytes of a byval argument.
    fn cur_arg_byval_size(&self, idx: u32) -> u32;
    /// Alignment of a byval argument.
    fn cur_arg_byval_align(&self, idx: u32) -> u32;
    /// Whether argument `idx` is a struct-return pointer.
    fn cur_arg_is_sret(&self, idx: u32) -> bool;
    /// The static (entry-block, fixed-size) allocas of the function.
    fn cur_static_allocas(&self) -> impl Iterator<Item = Self::Value> + '_;
    /// Whether the function contains dynamically-sized stack allocations.
    fn cur_has_dynamic_alloca(&self) -> bool;
    /// The entry block.
    fn cur_entry_block(&self) -> Self::Block;
    /// All blocks, entry first.
    fn cur_blocks(&self) -> impl Iterator<Item = Self::Block> + '_;

    // Block queries.

    /// Successor blocks of `block`.
    fn block_succs(&self, block: Self::Block) -> impl Iterator<Item = Self::Block> + '_;
    /// Non-PHI instructions of `block` in program order.
    fn block_insts(&self, block: Self::Block) -> impl Iterator<Item = Self::Inst> + '_;
    /// PHI result values of `block`.
    fn block_phis(&self, block: Self::Block) -> impl Iterator<Item = Self::Value> + '_;

    // Value queries.

    /// The dense per-function index of `value`.
    fn val_local_idx(&self, value: Self::Value) -> ValLocalIdx;
    /// Whether the liveness analysis should skip `value` (recommended for
    /// globals and similar variable references).
    fn val_ignore_in_liveness(&self, value: Self::Value) -> bool;
    /// Whether `value` is the result of a PHI node.
    fn val_is_phi(&self, value: Self::Value) -> bool;
    /// Number of incoming (block, value) slots of a PHI.
    fn phi_incoming_count(&self, phi: Self::Value) -> u32;
    /// The incoming slot `idx` of a PHI.
    fn phi_incoming(&self, phi: Self::Value, idx: u32) -> (Self::Block, Self::Value);
    /// The value a PHI receives when entered from `block`.
    fn phi_incoming_for_block(&self, phi: Self::Value, block: Self::Block) -> Self::Value;
    /// Allocation size of a static alloca value.
    fn val_alloca_size(&self, value: Self::Value) -> u32;
    /// Alignment of a static alloca value.
    fn val_alloca_align(&self, value: Self::Value) -> u32;

    // Instruction queries.

    /// Operand values of an instruction.
    fn inst_operands(&self, inst: Self::Inst) -> impl Iterator<Item = Self::Value> + '_;
    /// Result values of an instruction.
    fn inst_results(&self, inst: Self::Inst) -> impl Iterator<Item = Self::Value> + '_;
    /// Whether the instruction was already emitted as part of a previous
    /// instruction's pattern and must be skipped.
    fn inst_fused(&self, inst: Self::Inst) -> bool;
}
