//! The [`IrAdaptor`] implementation for TIR.
//!
//! Values are already dense per function, so the local index is the value
//! number itself. Integer constants are reported as special values and
//! their defining instructions as fused, so the backend folds them into
//! uses instead of materializing them eagerly.

use crate::{Block, FuncData, FuncRef, Inst, InstData, TirModule, Value};
use capstan::adaptor::{IrAdaptor, Linkage};
use capstan::{SymRef, ValLocalIdx};
use cranelift_entity::EntityRef;

pub struct TirAdaptor<'m> {
    pub module: &'m TirModule,
    cur: Option<FuncRef>,
    /// Interned personality symbol, created on first use by the backend.
    pub personality_sym: Option<SymRef>,
}

impl<'m> TirAdaptor<'m> {
    pub fn new(module: &'m TirModule) -> Self {
        TirAdaptor {
            module,
            cur: None,
            personality_sym: None,
        }
    }

    pub fn cur_func(&self) -> &'m FuncData {
        let module: &'m TirModule = self.module;
        &module.funcs[self.cur.expect("no current function")]
    }

    pub fn is_iconst(&self, value: Value) -> Option<(crate::Type, u64)> {
        match self.cur_func().values[value] {
            crate::ValueDef::InstRes { inst, .. } => match self.cur_func().insts[inst] {
                InstData::Iconst { ty, imm } => Some((ty, imm)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl<'m> IrAdaptor for TirAdaptor<'m> {
    type Value = Value;
    type Inst = Inst;
    type Block = Block;
    type Func = FuncRef;

    fn func_count(&self) -> u32 {
        self.module.funcs.len() as u32
    }

    fn funcs(&self) -> impl Iterator<Item = FuncRef> + '_ {
        self.module.funcs.keys()
    }

    fn func_link_name(&self, func: FuncRef) -> &str {
        &self.module.funcs[func].name
    }

    fn func_extern(&self, func: FuncRef) -> bool {
        self.module.funcs[func].is_extern
    }

    fn func_linkage(&self, func: FuncRef) -> Linkage {
        match self.module.funcs[func].linkage {
            crate::Linkage::Export => Linkage::Export,
            crate::Linkage::Weak => Linkage::Weak,
            crate::Linkage::Local => Linkage::Local,
        }
    }

    fn switch_func(&mut self, func: FuncRef) -> bool {
        self.cur = Some(func);
        true
    }

    fn reset(&mut self) {
        self.cur = None;
        self.personality_sym = None;
    }

    fn cur_val_count(&self) -> u32 {
        self.cur_func().values.len() as u32
    }

    fn cur_is_vararg(&self) -> bool {
        self.cur_func().sig.vararg
    }

    fn cur_args(&self) -> impl Iterator<Item = Value> + '_ {
        self.cur_func().args.iter().copied()
    }

    fn cur_arg_is_byval(&self, idx: u32) -> bool {
        self.cur_func().param_attrs[idx as usize].byval.is_some()
    }

    fn cur_arg_byval_size(&self, idx: u32) -> u32 {
        self.cur_func().param_attrs[idx as usize].byval.unwrap().0
    }

    fn cur_arg_byval_align(&self, idx: u32) -> u32 {
        self.cur_func().param_attrs[idx as usize].byval.unwrap().1
    }

    fn cur_arg_is_sret(&self, idx: u32) -> bool {
        self.cur_func().param_attrs[idx as usize].sret
    }

    fn cur_static_allocas(&self) -> impl Iterator<Item = Value> + '_ {
        self.cur_func().allocas.iter().copied()
    }

    fn cur_has_dynamic_alloca(&self) -> bool {
        self.cur_func().has_dynamic_alloca
    }

    fn cur_entry_block(&self) -> Block {
        self.cur_func().block_order[0]
    }

    fn cur_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.cur_func().block_order.iter().copied()
    }

    fn block_succs(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.cur_func().successors(block).into_iter()
    }

    fn block_insts(&self, block: Block) -> impl Iterator<Item = Inst> + '_ {
        self.cur_func().blocks[block].insts.iter().copied()
    }

    fn block_phis(&self, block: Block) -> impl Iterator<Item = Value> + '_ {
        self.cur_func().blocks[block].phis.iter().map(|p| p.result)
    }

    fn val_local_idx(&self, value: Value) -> ValLocalIdx {
        ValLocalIdx::new(value.index())
    }

    fn val_ignore_in_liveness(&self, value: Value) -> bool {
        self.is_iconst(value).is_some()
    }

    fn val_is_phi(&self, value: Value) -> bool {
        matches!(self.cur_func().values[value], crate::ValueDef::Phi { .. })
    }

    fn phi_incoming_count(&self, phi: Value) -> u32 {
        self.phi_data(phi).incoming.len() as u32
    }

    fn phi_incoming(&self, phi: Value, idx: u32) -> (Block, Value) {
        self.phi_data(phi).incoming[idx as usize]
    }

    fn phi_incoming_for_block(&self, phi: Value, block: Block) -> Value {
        self.phi_data(phi)
            .incoming
            .iter()
            .find(|(b, _)| *b == block)
            .map(|(_, v)| *v)
            .expect("no PHI incoming for predecessor")
    }

    fn val_alloca_size(&self, value: Value) -> u32 {
        match self.def_inst_data(value) {
            InstData::Alloca { size, .. } => *size,
            _ => panic!("not an alloca"),
        }
    }

    fn val_alloca_align(&self, value: Value) -> u32 {
        match self.def_inst_data(value) {
            InstData::Alloca { align, .. } => *align,
            _ => panic!("not an alloca"),
        }
    }

    fn inst_operands(&self, inst: Inst) -> impl Iterator<Item = Value> + '_ {
        let mut ops: smallvec::SmallVec<[Value; 4]> = smallvec::SmallVec::new();
        match &self.cur_func().insts[inst] {
            InstData::Iconst { .. }
            | InstData::Alloca { .. }
            | InstData::FuncAddr { .. }
            | InstData::LandingPad
            | InstData::Jump { .. } => {}
            InstData::Binary { lhs, rhs, .. } | InstData::Icmp { lhs, rhs, .. } => {
                ops.push(*lhs);
                ops.push(*rhs);
            }
            InstData::Extend { from, .. } => ops.push(*from),
            InstData::Load { ptr, .. } => ops.push(*ptr),
            InstData::Store { val, ptr, .. } => {
                ops.push(*val);
                ops.push(*ptr);
            }
            InstData::Lea { base, index, .. } => {
                ops.push(*base);
                if let Some(i) = index {
                    ops.push(*i);
                }
            }
            InstData::Call { args, .. } | InstData::Invoke { args, .. } => {
                ops.extend(args.iter().copied());
            }
            InstData::CallInd { ptr, args, .. } => {
                ops.push(*ptr);
                ops.extend(args.iter().copied());
            }
            InstData::Brif { lhs, rhs, .. } => {
                ops.push(*lhs);
                ops.push(*rhs);
            }
            InstData::Ret { val } => {
                if let Some(v) = val {
                    ops.push(*v);
                }
            }
        }
        ops.into_iter()
    }

    fn inst_results(&self, inst: Inst) -> impl Iterator<Item = Value> + '_ {
        let res: Option<Value> = self.cur_func().inst_results[inst];
        res.into_iter()
    }

    fn inst_fused(&self, inst: Inst) -> bool {
        matches!(self.cur_func().insts[inst], InstData::Iconst { .. })
    }
}

impl<'m> TirAdaptor<'m> {
    fn phi_data(&self, phi: Value) -> &'m crate::PhiData {
        let crate::ValueDef::Phi { block, .. } = self.cur_func().values[phi] else {
            panic!("not a PHI value");
        };
        self.cur_func().blocks[block]
            .phis
            .iter()
            .find(|p| p.result == phi)
            .expect("PHI missing from its block")
    }

    fn def_inst_data(&self, value: Value) -> &'m InstData {
        match self.cur_func().values[value] {
            crate::ValueDef::InstRes { inst, .. } => &self.cur_func().insts[inst],
            _ => panic!("value is not an instruction result"),
        }
    }
}
