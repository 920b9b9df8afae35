//! Call-site orchestration.
//!
//! A [`CallBuilder`] marshals arguments into their convention-assigned
//! registers or outgoing stack slots, adjusts `sp` (with a back-patched
//! reservation so the final aligned amount is known only once), evicts
//! every caller-saved register still holding a live value, emits the call
//! and binds the return registers to the result value.
//!
//! Argument registers are held as locked scratches from the moment they
//! are filled until after the call, so later arguments cannot steal them.

use crate::adaptor::IrAdaptor;
use crate::cc::{CcAssigner, CcAssignment};
use crate::codegen::{Backend, CodeGen};
use crate::isa::Machine;
use crate::regfile::{Reg, RegBitSet};
use crate::value::{ScratchReg, ValuePartRef, ValueRef};
use smallvec::SmallVec;

/// Where a call transfers to.
pub enum CallTarget {
    Sym(crate::asm::SymRef),
    /// An indirect call through a value.
    Indirect(ValuePartRef),
}

pub struct CallBuilder<M: Machine> {
    cc: M::Cc,
    stack_adjust_off: Option<u32>,
    /// Locked argument registers, released after the call.
    arg_scratches: SmallVec<[ScratchReg; 8]>,
    arg_reg_mask: RegBitSet,
    fp_reg_args: u32,
}

impl<M: Machine> CallBuilder<M> {
    pub fn new(vararg: bool) -> Self {
        CallBuilder {
            cc: M::new_cc(vararg),
            stack_adjust_off: None,
            arg_scratches: SmallVec::new(),
            arg_reg_mask: 0,
            fp_reg_args: 0,
        }
    }

    fn set_stack_used<A, B>(&mut self, ctx: &mut CodeGen<'_, A, B>)
    where
        A: IrAdaptor,
        B: Backend<A, Mach = M>,
    {
        if self.stack_adjust_off.is_none() {
            self.stack_adjust_off = Some(M::sub_sp_placeholder(ctx.asm));
        }
    }

    /// Marshal one argument part. `cca` carries the byval/sret/consecutive
    /// attributes; bank and size are taken from the value.
    pub fn add_arg<A, B>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        mut vp: ValuePartRef,
        mut cca: CcAssignment,
    ) where
        A: IrAdaptor,
        B: Backend<A, Mach = M>,
    {
        if cca.byval {
            self.cc.assign_arg(&mut cca);
            self.add_arg_byval(ctx, vp, &cca);
            return;
        }

        cca.bank = vp.bank(ctx).id();
        cca.size = vp.part_size(ctx);
        cca.align = cca.align.max(cca.size);
        self.cc.assign_arg(&mut cca);

        match cca.reg {
            Some(reg) => {
                if reg.bank() == M::FP_BANK {
                    self.fp_reg_args += 1;
                }
                let mut scratch = ScratchReg::new();
                scratch.alloc_specific(ctx, reg);
                vp.reload_into_specific_fixed(ctx, reg);
                vp.release(ctx);
                self.arg_scratches.push(scratch);
                self.arg_reg_mask |= reg.bit();
            }
            None => {
                self.set_stack_used(ctx);
                let reg = vp.load_to_reg(ctx);
                M::store_sp(ctx.asm, reg, cca.stack_off, cca.size);
                vp.release(ctx);
            }
        }
    }

    /// Copy a byval aggregate into the outgoing argument area. `vp` holds
    /// the source address.
    fn add_arg_byval<A, B>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        mut vp: ValuePartRef,
        cca: &CcAssignment,
    ) where
        A: IrAdaptor,
        B: Backend<A, Mach = M>,
    {
        self.set_stack_used(ctx);
        let ptr = vp.load_to_reg(ctx);
        let mut tmp = ScratchReg::new();
        let tmp_reg = tmp.alloc(ctx, M::GP_BANK);

        let mut off = 0u32;
        let mut left = cca.byval_size;
        for chunk in [8u32, 4, 2, 1] {
            while left >= chunk {
                M::load_mem(ctx.asm, tmp_reg, ptr, off as i32, chunk);
                M::store_sp(ctx.asm, tmp_reg, cca.stack_off + off, chunk);
                off += chunk;
                left -= chunk;
            }
        }

        tmp.free(ctx);
        vp.release(ctx);
    }

    /// Emit the call. Consumes the builder; pass `result` to receive the
    /// return value.
    pub fn call<A, B>(
        mut self,
        ctx: &mut CodeGen<'_, A, B>,
        target: CallTarget,
        result: Option<&ValueRef>,
    ) where
        A: IrAdaptor,
        B: Backend<A, Mach = M>,
    {
        // For an indirect call, get the target into a register that
        // survives argument setup and caller-saved eviction.
        let (sym_target, target_scratch) = match target {
            CallTarget::Sym(sym) => (Some(sym), None),
            CallTarget::Indirect(mut vp) => {
                let mut s = ScratchReg::new();
                let exclude = M::cc_info().arg_regs | self.arg_reg_mask;
                let reg = s.alloc_excluding(ctx, M::GP_BANK, exclude);
                vp.reload_into_specific_fixed(ctx, reg);
                vp.release(ctx);
                (None, Some(s))
            }
        };

        // Evict every caller-saved register still bound to a value; the
        // callee may clobber them all. Fixed assignments live in
        // callee-saved registers by construction.
        let callee_saved = M::cc_info().callee_saved;
        let victims: SmallVec<[Reg; 8]> = ctx
            .regs
            .used_nonfixed_regs()
            .filter(|r| callee_saved & r.bit() == 0)
            .collect();
        for reg in victims {
            ctx.evict_reg(reg);
        }
        debug_assert_eq!(
            ctx.regs.fixed & !callee_saved & !self.arg_reg_mask
                & !target_scratch.as_ref().map_or(0, |s| s.cur_reg().bit()),
            0,
            "locked caller-saved register across a call"
        );

        if self.cc.is_vararg() {
            M::vararg_call_setup(ctx.asm, self.fp_reg_args);
        }

        let stack_size = self.cc.stack_size();
        let adjust = (stack_size + 15) & !15;
        if adjust > M::MAX_FRAME_SIZE {
            // The function is discarded once the current instruction
            // returns; the clamp below only keeps the dead patch in
            // range.
            ctx.set_unsupported("outgoing argument area exceeds the target's encodable range");
        }
        if let Some(at) = self.stack_adjust_off {
            M::patch_sub_sp(ctx.asm, at, adjust.min(M::MAX_FRAME_SIZE));
        } else {
            debug_assert_eq!(stack_size, 0);
        }

        match sym_target {
            Some(sym) => M::call_sym(ctx.asm, sym),
            None => {
                let s = target_scratch.as_ref().unwrap();
                M::call_reg(ctx.asm, s.cur_reg());
            }
        }

        if let Some(s) = target_scratch {
            s.free(ctx);
        }
        for s in self.arg_scratches.drain(..) {
            s.free(ctx);
        }

        if self.stack_adjust_off.is_some() {
            M::add_sp(ctx.asm, adjust);
        }

        // Bind return registers to the result value.
        if let Some(result) = result {
            let aref = ctx
                .assignments
                .of(result.local_idx())
                .expect("call result without assignment");
            let part_count = ctx.assignments.get(aref).part_count;
            for i in 0..part_count {
                let desc = ctx.assignments.part(aref, i);
                let mut cca = CcAssignment::part(desc.bank(), desc.part_size());
                self.cc.assign_ret(&mut cca);
                let reg = cca.reg.expect("return part without register");
                let mut scratch = ScratchReg::new();
                scratch.alloc_specific(ctx, reg);
                let mut vp = result.part(i);
                vp.set_value_from_scratch(ctx, scratch);
                vp.release(ctx);
            }
        }
    }
}
