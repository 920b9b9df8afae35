//! Capstan: a single-pass, non-optimizing machine-code generator.
//!
//! Capstan lowers a typed SSA IR directly to x86-64 or AArch64 code, in one
//! traversal per function. There is no instruction scheduling, no dataflow
//! analysis and no separate register allocation pass: values are assigned to
//! registers and stack slots on the fly while machine code is appended to the
//! output section. The design trades code quality for compile-time
//! throughput.
//!
//! The crate is organized around three traits:
//!
//! * [`IrAdaptor`](adaptor::IrAdaptor) abstracts the source IR,
//! * [`Machine`](isa::Machine) abstracts the target (emission primitives and
//!   register conventions),
//! * [`Backend`](codegen::Backend) is the lowering layer that turns IR
//!   instructions into emit calls through the [`CodeGen`](codegen::CodeGen)
//!   context.
//!
//! Output is a relocatable ELF object (or, through `capstan-jit`, code mapped
//! directly into executable memory).

pub mod adaptor;
pub mod analyzer;
pub mod asm;
pub mod assign;
pub mod call;
pub mod cc;
pub mod codegen;
pub mod frame;
pub mod isa;
pub mod module;
pub mod regfile;
pub mod value;

use cranelift_entity::entity_impl;

/// A dense per-function value index assigned by the IR adaptor.
///
/// Globals occupy `[0, global_end)`, function arguments follow, instruction
/// results the rest. The reserved value (`!0`) never names a value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValLocalIdx(u32);
entity_impl!(ValLocalIdx, "val");

/// A block index into the analyzer's layout order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIdx(u32);
entity_impl!(BlockIdx, "block");

/// A loop in the analyzer's loop tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopIdx(u32);
entity_impl!(LoopIdx, "loop");

/// A result type for module-level compilation entry points.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// An error produced while compiling a module.
///
/// `Unsupported` is recoverable per function: the driver skips the
/// function (its symbol stays undefined), records the error in
/// [`module::CompiledModule::skipped`] and compilation of the module
/// continues. The other variants abort the whole module.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The function used an IR construct the lowering layer does not
    /// handle.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    /// The input IR is malformed (use before def, unknown operand,
    /// malformed PHI). This is the caller's fault.
    #[error("malformed input IR: {0}")]
    Ir(String),

    /// Two definitions of the same symbol name in a mode that forbids it.
    #[error("duplicate symbol definition: {0}")]
    DuplicateSymbol(String),

    /// A hard limit of the object writer was exceeded.
    #[error("object limit exceeded: {0}")]
    ObjectLimitExceeded(&'static str),

    /// The requested target is not supported by this build.
    #[error("unsupported target: {0}")]
    UnsupportedTarget(target_lexicon::Architecture),
}

pub use adaptor::{IrAdaptor, Linkage};
pub use asm::{Assembler, Label, SecRef, SymBinding, SymRef};
pub use call::{CallBuilder, CallTarget};
pub use cc::{CcAssigner, CcAssignment, CcInfo};
pub use codegen::{Backend, CodeGen, PartSpec, PartsSpec};
pub use isa::{AluOp, Cond, Machine};
pub use module::{compile_module, compile_object, CompiledModule, ModuleConfig};
pub use regfile::{Reg, RegBank};
pub use value::{AddrExpr, GenValue, GvReg, ScratchReg, SpecialVal, ValuePartRef, ValueRef};
