//! TIR: a small typed SSA IR for driving the capstan backend.
//!
//! TIR exists so the backend can be exercised end-to-end without a real
//! frontend: tests build functions with [`FunctionBuilder`], wrap the
//! module in [`TirAdaptor`](adaptor::TirAdaptor) and compile through
//! [`TirBackend`](backend::TirBackend), which is generic over the target.
//!
//! The IR is deliberately small. Integer arithmetic covers the register
//! allocator's interesting paths; `I128` values exist to exercise
//! multi-part assignments, `F64` to exercise the second register bank, and
//! `invoke`/`landing_pad` to exercise the exception tables.

pub mod adaptor;
pub mod backend;

use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;

pub use capstan::isa::Cond;

/// Value types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Type {
    I8,
    I16,
    I32,
    I64,
    I128,
    F64,
    Ptr,
}

impl Type {
    /// Byte size of one register part of this type.
    pub fn part_size(self) -> u8 {
        match self {
            Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 => 4,
            Type::I64 | Type::I128 | Type::Ptr | Type::F64 => 8,
        }
    }

    pub fn part_count(self) -> u32 {
        match self {
            Type::I128 => 2,
            _ => 1,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Type::I8 => 8,
            Type::I16 => 16,
            Type::I32 => 32,
            Type::I64 | Type::Ptr | Type::F64 => 64,
            Type::I128 => 128,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::F64)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "fn");

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// Two-operand integer operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

#[derive(Clone, Debug)]
pub enum InstData {
    /// Integer constant; fused into its uses, never compiled on its own.
    Iconst { ty: Type, imm: u64 },
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Icmp {
        cond: Cond,
        lhs: Value,
        rhs: Value,
    },
    /// Sign- or zero-extension.
    Extend {
        from: Value,
        signed: bool,
        to: Type,
    },
    Load {
        ty: Type,
        ptr: Value,
        off: i32,
    },
    Store {
        val: Value,
        ptr: Value,
        off: i32,
    },
    /// `base + index * 2^scale + disp`.
    Lea {
        base: Value,
        index: Option<Value>,
        scale: u8,
        disp: i64,
    },
    /// Fixed-size stack allocation; the result is its address.
    Alloca { size: u32, align: u32 },
    /// Address of a function.
    FuncAddr { func: FuncRef },
    Call {
        callee: FuncRef,
        args: SmallVec<[Value; 4]>,
    },
    CallInd {
        ptr: Value,
        args: SmallVec<[Value; 4]>,
        sig: Signature,
    },
    /// Call with an unwind edge.
    Invoke {
        callee: FuncRef,
        args: SmallVec<[Value; 4]>,
        normal: Block,
        lpad: Block,
    },
    /// Cleanup-only landing pad marker; must start its block.
    LandingPad,
    Jump { dest: Block },
    /// Fused compare-and-branch.
    Brif {
        cond: Cond,
        lhs: Value,
        rhs: Value,
        then_dest: Block,
        else_dest: Block,
    },
    Ret { val: Option<Value> },
}

/// How a return value is widened by the callee.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RetExt {
    #[default]
    None,
    Sext,
    Zext,
}

#[derive(Clone, Debug, Default)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Option<Type>,
    pub ret_ext: RetExt,
    pub vararg: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ParamAttrs {
    /// Pass on the stack by value: `(size, align)`.
    pub byval: Option<(u32, u32)>,
    pub sret: bool,
}

#[derive(Clone, Copy, Debug)]
pub enum ValueDef {
    Arg { idx: u32, ty: Type },
    InstRes { inst: Inst, ty: Type },
    Phi { block: Block, ty: Type },
}

impl ValueDef {
    pub fn ty(&self) -> Type {
        match *self {
            ValueDef::Arg { ty, .. } | ValueDef::InstRes { ty, .. } | ValueDef::Phi { ty, .. } => {
                ty
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PhiData {
    pub result: Value,
    pub incoming: SmallVec<[(Block, Value); 4]>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub phis: Vec<PhiData>,
    pub insts: Vec<Inst>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linkage {
    Export,
    Weak,
    Local,
}

pub struct FuncData {
    pub name: String,
    pub sig: Signature,
    pub param_attrs: Vec<ParamAttrs>,
    pub linkage: Linkage,
    pub is_extern: bool,
    pub blocks: PrimaryMap<Block, BlockData>,
    pub block_order: Vec<Block>,
    pub insts: PrimaryMap<Inst, InstData>,
    pub inst_results: PrimaryMap<Inst, Option<Value>>,
    pub values: PrimaryMap<Value, ValueDef>,
    pub args: Vec<Value>,
    pub allocas: Vec<Value>,
    pub has_invoke: bool,
    pub has_dynamic_alloca: bool,
}

impl FuncData {
    pub fn ty_of(&self, value: Value) -> Type {
        self.values[value].ty()
    }
}

#[derive(Default)]
pub struct TirModule {
    pub funcs: PrimaryMap<FuncRef, FuncData>,
}

impl TirModule {
    pub fn new() -> Self {
        TirModule::default()
    }

    /// Declare an external function.
    pub fn declare(&mut self, name: &str, sig: Signature) -> FuncRef {
        self.funcs.push(FuncData {
            name: name.to_string(),
            sig,
            param_attrs: Vec::new(),
            linkage: Linkage::Export,
            is_extern: true,
            blocks: PrimaryMap::new(),
            block_order: Vec::new(),
            insts: PrimaryMap::new(),
            inst_results: PrimaryMap::new(),
            values: PrimaryMap::new(),
            args: Vec::new(),
            allocas: Vec::new(),
            has_invoke: false,
            has_dynamic_alloca: false,
        })
    }

    /// Define a function; the returned builder appends to its entry block.
    pub fn define(&mut self, name: &str, sig: Signature) -> (FuncRef, FunctionBuilder<'_>) {
        let nparams = sig.params.len();
        let func = self.funcs.push(FuncData {
            name: name.to_string(),
            sig,
            param_attrs: vec![ParamAttrs::default(); nparams],
            linkage: Linkage::Export,
            is_extern: false,
            blocks: PrimaryMap::new(),
            block_order: Vec::new(),
            insts: PrimaryMap::new(),
            inst_results: PrimaryMap::new(),
            values: PrimaryMap::new(),
            args: Vec::new(),
            allocas: Vec::new(),
            has_invoke: false,
            has_dynamic_alloca: false,
        });
        let data = &mut self.funcs[func];
        for (i, &ty) in data.sig.params.clone().iter().enumerate() {
            let v = data.values.push(ValueDef::Arg {
                idx: i as u32,
                ty,
            });
            data.args.push(v);
        }
        let entry = data.blocks.push(BlockData::default());
        data.block_order.push(entry);
        (
            func,
            FunctionBuilder {
                func: data,
                cur_block: entry,
            },
        )
    }
}

/// Appends instructions to a function under construction.
pub struct FunctionBuilder<'a> {
    func: &'a mut FuncData,
    cur_block: Block,
}

impl<'a> FunctionBuilder<'a> {
    pub fn arg(&self, idx: usize) -> Value {
        self.func.args[idx]
    }

    pub fn set_param_attrs(&mut self, idx: usize, attrs: ParamAttrs) {
        self.func.param_attrs[idx] = attrs;
    }

    pub fn set_linkage(&mut self, linkage: Linkage) {
        self.func.linkage = linkage;
    }

    pub fn entry_block(&self) -> Block {
        self.func.block_order[0]
    }

    pub fn create_block(&mut self) -> Block {
        let b = self.func.blocks.push(BlockData::default());
        self.func.block_order.push(b);
        b
    }

    pub fn switch_to_block(&mut self, block: Block) {
        self.cur_block = block;
    }

    /// Add a PHI to `block`; incoming edges are filled in later.
    pub fn add_phi(&mut self, block: Block, ty: Type) -> Value {
        let v = self.func.values.push(ValueDef::Phi { block, ty });
        self.func.blocks[block].phis.push(PhiData {
            result: v,
            incoming: SmallVec::new(),
        });
        v
    }

    pub fn set_phi_incoming(&mut self, phi: Value, from: Block, val: Value) {
        let ValueDef::Phi { block, .. } = self.func.values[phi] else {
            panic!("not a PHI value");
        };
        let data = self.func.blocks[block]
            .phis
            .iter_mut()
            .find(|p| p.result == phi)
            .expect("PHI not found in its block");
        data.incoming.push((from, val));
    }

    fn push_inst(&mut self, data: InstData, result_ty: Option<Type>) -> (Inst, Option<Value>) {
        let inst = self.func.insts.push(data);
        let res = result_ty.map(|ty| self.func.values.push(ValueDef::InstRes { inst, ty }));
        let inst2 = self.func.inst_results.push(res);
        debug_assert_eq!(inst, inst2);
        self.func.blocks[self.cur_block].insts.push(inst);
        (inst, res)
    }

    pub fn iconst(&mut self, ty: Type, imm: u64) -> Value {
        debug_assert!(!ty.is_float());
        self.push_inst(InstData::Iconst { ty, imm }, Some(ty)).1.unwrap()
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.func.ty_of(lhs);
        self.push_inst(InstData::Binary { op, lhs, rhs }, Some(ty))
            .1
            .unwrap()
    }

    pub fn iadd(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn isub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn icmp(&mut self, cond: Cond, lhs: Value, rhs: Value) -> Value {
        self.push_inst(InstData::Icmp { cond, lhs, rhs }, Some(Type::I32))
            .1
            .unwrap()
    }

    pub fn extend(&mut self, from: Value, signed: bool, to: Type) -> Value {
        self.push_inst(InstData::Extend { from, signed, to }, Some(to))
            .1
            .unwrap()
    }

    pub fn load(&mut self, ty: Type, ptr: Value, off: i32) -> Value {
        self.push_inst(InstData::Load { ty, ptr, off }, Some(ty))
            .1
            .unwrap()
    }

    pub fn store(&mut self, val: Value, ptr: Value, off: i32) {
        self.push_inst(InstData::Store { val, ptr, off }, None);
    }

    pub fn lea(&mut self, base: Value, index: Option<Value>, scale: u8, disp: i64) -> Value {
        self.push_inst(
            InstData::Lea {
                base,
                index,
                scale,
                disp,
            },
            Some(Type::Ptr),
        )
        .1
        .unwrap()
    }

    pub fn alloca(&mut self, size: u32, align: u32) -> Value {
        let (_, res) = self.push_inst(InstData::Alloca { size, align }, Some(Type::Ptr));
        let v = res.unwrap();
        self.func.allocas.push(v);
        v
    }

    pub fn func_addr(&mut self, func: FuncRef) -> Value {
        self.push_inst(InstData::FuncAddr { func }, Some(Type::Ptr))
            .1
            .unwrap()
    }

    pub fn call(
        &mut self,
        callee: FuncRef,
        ret: Option<Type>,
        args: &[Value],
    ) -> Option<Value> {
        self.push_inst(
            InstData::Call {
                callee,
                args: SmallVec::from_slice(args),
            },
            ret,
        )
        .1
    }

    pub fn call_indirect(
        &mut self,
        ptr: Value,
        sig: Signature,
        args: &[Value],
    ) -> Option<Value> {
        let ret = sig.ret;
        self.push_inst(
            InstData::CallInd {
                ptr,
                args: SmallVec::from_slice(args),
                sig,
            },
            ret,
        )
        .1
    }

    pub fn invoke(
        &mut self,
        callee: FuncRef,
        ret: Option<Type>,
        args: &[Value],
        normal: Block,
        lpad: Block,
    ) -> Option<Value> {
        self.func.has_invoke = true;
        self.push_inst(
            InstData::Invoke {
                callee,
                args: SmallVec::from_slice(args),
                normal,
                lpad,
            },
            ret,
        )
        .1
    }

    pub fn landing_pad(&mut self) {
        self.push_inst(InstData::LandingPad, None);
    }

    pub fn jump(&mut self, dest: Block) {
        self.push_inst(InstData::Jump { dest }, None);
    }

    pub fn brif(&mut self, cond: Cond, lhs: Value, rhs: Value, then_dest: Block, else_dest: Block) {
        self.push_inst(
            InstData::Brif {
                cond,
                lhs,
                rhs,
                then_dest,
                else_dest,
            },
            None,
        );
    }

    pub fn ret(&mut self, val: Option<Value>) {
        self.push_inst(InstData::Ret { val }, None);
    }
}

impl FuncData {
    /// Successor blocks of `block`, from its terminator and invokes.
    pub fn successors(&self, block: Block) -> SmallVec<[Block; 2]> {
        let mut out = SmallVec::new();
        for &inst in &self.blocks[block].insts {
            match &self.insts[inst] {
                InstData::Jump { dest } => out.push(*dest),
                InstData::Brif {
                    then_dest,
                    else_dest,
                    ..
                } => {
                    out.push(*then_dest);
                    if !out.contains(else_dest) {
                        out.push(*else_dest);
                    }
                }
                InstData::Invoke { normal, lpad, .. } => {
                    out.push(*normal);
                    out.push(*lpad);
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_creates_dense_values() {
        let mut m = TirModule::new();
        let sig = Signature {
            params: vec![Type::I64, Type::I64],
            ret: Some(Type::I64),
            ..Default::default()
        };
        let (_f, mut b) = m.define("add", sig);
        let x = b.arg(0);
        let y = b.arg(1);
        let s = b.iadd(x, y);
        b.ret(Some(s));

        let func = m.funcs.values().next().unwrap();
        assert_eq!(func.values.len(), 3);
        assert_eq!(func.args.len(), 2);
        assert_eq!(func.block_order.len(), 1);
    }

    #[test]
    fn successors_follow_terminators() {
        let mut m = TirModule::new();
        let (_f, mut b) = m.define(
            "f",
            Signature {
                params: vec![Type::I64],
                ret: None,
                ..Default::default()
            },
        );
        let x = b.arg(0);
        let t = b.create_block();
        let e = b.create_block();
        let zero = b.iconst(Type::I64, 0);
        b.brif(Cond::Eq, x, zero, t, e);
        b.switch_to_block(t);
        b.ret(None);
        b.switch_to_block(e);
        b.ret(None);

        let func = m.funcs.values().next().unwrap();
        let entry = func.block_order[0];
        assert_eq!(func.successors(entry), SmallVec::<[Block; 2]>::from_slice(&[t, e]));
    }
}
