//! The code-generation context.
//!
//! `CodeGen` owns all per-function state: the analyzer results, register
//! file, stack frame, value assignments and the per-block driver loop. The
//! lowering layer (a [`Backend`]) receives `&mut CodeGen` per instruction
//! and interacts with it exclusively through value handles
//! ([`crate::value`]) and the target's emission surface.
//!
//! Register-state rules enforced here:
//!
//! * a `used` register names exactly one `(value, part)` owner, or none for
//!   scratches; parts with a valid register point back at their register;
//! * locked (`fixed`) registers are never evicted; eviction spills dirty
//!   parts to their stack slot first;
//! * any block with multiple predecessors (or entered by a non-fallthrough
//!   edge) starts with every non-fixed value in its stack slot.

use crate::adaptor::IrAdaptor;
use crate::analyzer::Analyzer;
use crate::asm::{Assembler, Label, SymRef};
use crate::assign::AssignmentStore;
use crate::frame::FrameAlloc;
use crate::isa::{Cond, FuncFinishInfo, Machine};
use crate::regfile::{regs_in, Reg, RegBank, RegBitSet, RegisterFile};
use crate::value::{GenValue, GvReg, ScratchReg, SpecialVal, ValuePartRef, ValueRef};
use crate::{BlockIdx, CodegenError, ValLocalIdx};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::EntityRef;
use log::{error, trace, warn};
use smallvec::SmallVec;

/// Register bank and byte size of one value part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSpec {
    pub bank: RegBank,
    pub size: u8,
}

pub type PartsSpec = SmallVec<[PartSpec; 2]>;

/// The lowering layer: classifies values and compiles instructions.
pub trait Backend<A: IrAdaptor>: Sized {
    type Mach: Machine;

    /// The parts a value decomposes into.
    fn val_parts(adaptor: &A, value: A::Value) -> PartsSpec;
    /// Constant/global classification. Special values have no assignment.
    fn val_special(adaptor: &A, value: A::Value) -> Option<SpecialVal>;
    /// Lower one instruction. `false` marks the function unsupported.
    fn compile_inst(ctx: &mut CodeGen<'_, A, Self>, inst: A::Inst) -> bool;
    /// Personality function of the current function, if any.
    fn cur_personality(_ctx: &mut CodeGen<'_, A, Self>) -> Option<SymRef> {
        None
    }
    /// Request a fixed register assignment for `value` regardless of the
    /// liveness heuristic.
    fn try_force_fixed(_adaptor: &A, _value: A::Value) -> bool {
        false
    }
}

pub struct CodeGen<'a, A: IrAdaptor, B: Backend<A>> {
    pub adaptor: &'a mut A,
    pub analyzer: Analyzer<A>,
    pub regs: RegisterFile,
    pub frame: FrameAlloc,
    pub assignments: AssignmentStore,
    pub asm: &'a mut Assembler,
    /// Per-function target state (placeholder offsets, epilogue sites).
    pub mach: <B::Mach as Machine>::FrameState,
    pub cur_block: BlockIdx,
    pub block_labels: Vec<Label>,
    /// Module-level function symbols, parallel to the adaptor's function
    /// order.
    pub func_syms: Vec<SymRef>,
    pub cur_func_sym: SymRef,
    personality: Option<SymRef>,
    func_start_off: u32,
    /// Reason the current function cannot be compiled, if any.
    unsupported: Option<String>,
    _backend: core::marker::PhantomData<B>,
}

impl<'a, A: IrAdaptor, B: Backend<A>> CodeGen<'a, A, B> {
    pub fn new(adaptor: &'a mut A, asm: &'a mut Assembler) -> Self {
        CodeGen {
            adaptor,
            analyzer: Analyzer::new(),
            regs: RegisterFile::new(),
            frame: FrameAlloc::new(),
            assignments: AssignmentStore::new(),
            asm,
            mach: Default::default(),
            cur_block: BlockIdx::new(0),
            block_labels: Vec::new(),
            func_syms: Vec::new(),
            cur_func_sym: SymRef::default(),
            personality: None,
            func_start_off: 0,
            unsupported: None,
            _backend: core::marker::PhantomData,
        }
    }

    /// Mark the current function as unsupported; `compile_func` reports
    /// it as [`CodegenError::Unsupported`] and the driver skips the
    /// function. The first reason given wins.
    pub fn set_unsupported(&mut self, what: &str) {
        warn!("unsupported construct: {what}");
        if self.unsupported.is_none() {
            self.unsupported = Some(what.to_string());
        }
    }

    pub fn block_label(&self, block: BlockIdx) -> Label {
        self.block_labels[block.index()]
    }

    pub fn next_block(&self) -> BlockIdx {
        BlockIdx::new(self.cur_block.index() + 1)
    }

    // ---- Value references ------------------------------------------------

    /// A use of `value`. The value must be defined already.
    pub fn val_ref(&mut self, value: A::Value) -> ValueRef {
        if let Some(sv) = B::val_special(self.adaptor, value) {
            return ValueRef::special(sv);
        }
        let local = self.adaptor.val_local_idx(value);
        debug_assert!(
            self.assignments.of(local).is_some(),
            "use of {value:?} before definition"
        );
        ValueRef::assignment(local)
    }

    /// A defining reference to `value`, creating its assignment on first
    /// touch.
    pub fn result_ref(&mut self, value: A::Value) -> ValueRef {
        let local = self.adaptor.val_local_idx(value);
        if self.assignments.of(local).is_none() {
            self.init_assignment(value, local);
        }
        ValueRef::assignment(local)
    }

    pub fn val_ref_single(&mut self, value: A::Value) -> (ValueRef, ValuePartRef) {
        let vr = self.val_ref(value);
        let vp = vr.part(0);
        (vr, vp)
    }

    pub fn result_ref_single(&mut self, value: A::Value) -> (ValueRef, ValuePartRef) {
        let vr = self.result_ref(value);
        let vp = vr.part(0);
        (vr, vp)
    }

    // ---- Assignment lifecycle -------------------------------------------

    fn init_assignment(&mut self, value: A::Value, local: ValLocalIdx) {
        trace!("initializing assignment for {local}");
        let parts = B::val_parts(self.adaptor, value);
        let part_count = parts.len() as u32;
        debug_assert!(part_count > 0, "value without parts");
        let aref = self.assignments.alloc(part_count);
        self.assignments.bind(local, aref);

        let mut max_part_size = 0u8;
        for (i, p) in parts.iter().enumerate() {
            let desc = crate::assign::PartDesc::reset()
                .with_bank(p.bank)
                .with_part_size(p.size as u32);
            self.assignments.set_part(aref, i as u32, desc);
            max_part_size = max_part_size.max(p.size);
        }

        let liveness = *self.analyzer.liveness(local);

        // Single-part values that stay live beyond this block may earn a
        // dedicated register for their whole lifetime.
        if part_count == 1 {
            let bank = parts[0].bank;
            let cur_loop = self.analyzer.block_loop_idx(self.cur_block);
            let headroom = self.analyzer.loop_info(cur_loop).definitions_in_childs;
            let fixed_now = self.assignments.cur_fixed[bank.id() as usize];
            let limit = <B::Mach as Machine>::NUM_FIXED_ASSIGNMENTS[bank.id() as usize];
            let mut try_fixed = liveness.last > self.cur_block && headroom + fixed_now < limit;
            if B::try_force_fixed(self.adaptor, value) {
                try_fixed = fixed_now < limit;
            }
            if try_fixed {
                if let Some(reg) = <B::Mach as Machine>::select_fixed_assignment_reg(&self.regs, bank)
                {
                    trace!("fixed assignment of {reg:?} to {local}");
                    if self.regs.is_used(reg) {
                        self.evict_reg(reg);
                    }
                    let desc = self
                        .assignments
                        .part(aref, 0)
                        .with_reg(reg)
                        .with_register_valid(true)
                        .with_fixed_assignment(true);
                    self.assignments.set_part(aref, 0, desc);
                    self.regs.mark_used(reg, local.into(), 0);
                    self.regs.inc_lock_count(reg);
                    self.regs.mark_fixed(reg);
                    self.regs.mark_clobbered(reg);
                    self.assignments.cur_fixed[bank.id() as usize] += 1;
                }
            }
        }

        let size = max_part_size as u32 * part_count;
        let slot = self.frame.allocate(size);
        let a = self.assignments.get_mut(aref);
        a.frame_off = -(slot as i32);
        a.part_count = part_count;
        a.max_part_size = max_part_size;
        a.variable_ref = false;
        a.stack_variable = false;
        a.delay_free = liveness.last_full;
        a.references_left = liveness.ref_count;
    }

    /// Create a variable-reference assignment: the value is the address of
    /// a fixed location and owns no stack slot of its own.
    pub fn init_variable_ref(&mut self, local: ValLocalIdx, frame_off: i32, ref_count: u32) {
        let aref = self.assignments.alloc(1);
        self.assignments.bind(local, aref);
        let desc = crate::assign::PartDesc::reset()
            .with_bank(<B::Mach as Machine>::GP_BANK)
            .with_part_size(<B::Mach as Machine>::PTR_SIZE);
        self.assignments.set_part(aref, 0, desc);
        let a = self.assignments.get_mut(aref);
        a.frame_off = frame_off;
        a.part_count = 1;
        a.max_part_size = <B::Mach as Machine>::PTR_SIZE as u8;
        a.variable_ref = true;
        a.stack_variable = true;
        a.delay_free = false;
        a.references_left = ref_count;
    }

    /// Free an assignment: release registers, the stack slot and the
    /// record.
    pub(crate) fn free_assignment(&mut self, local: ValLocalIdx) {
        trace!("freeing assignment for {local}");
        let aref = self.assignments.of(local).expect("double free");
        let a = self.assignments.get(aref);
        let part_count = a.part_count;
        let is_var_ref = a.variable_ref;
        let frame_off = a.frame_off;
        let size = if is_var_ref { 0 } else { a.size() };

        for part in 0..part_count {
            let desc = self.assignments.part(aref, part);
            if desc.fixed_assignment() {
                let reg = desc.reg();
                debug_assert!(self.regs.is_fixed(reg));
                debug_assert_eq!(self.regs.owner_local_idx(reg), Some(local));
                self.assignments.cur_fixed[desc.bank().id() as usize] -= 1;
                self.regs.dec_lock_count_must_zero(reg);
                self.regs.unmark_fixed(reg);
                self.regs.unmark_used(reg);
            } else if desc.register_valid() {
                let reg = desc.reg();
                debug_assert!(!self.regs.is_fixed(reg));
                self.regs.unmark_used(reg);
            }
        }

        if cfg!(debug_assertions) {
            for reg in self.regs.used_regs() {
                debug_assert!(
                    self.regs.owner_local_idx(reg) != Some(local),
                    "freed assignment still referenced by {reg:?}"
                );
            }
        }

        if !is_var_ref {
            self.frame.free((-frame_off) as u32, size);
        }
        self.assignments.unbind(local);
        self.assignments.dealloc(aref);
    }

    /// Drop one reference; free (or delayed-free) at zero.
    pub(crate) fn drop_value_reference(&mut self, local: ValLocalIdx) {
        let Some(aref) = self.assignments.of(local) else {
            return;
        };
        let a = self.assignments.get_mut(aref);
        if a.references_left == 0 {
            debug_assert!(a.variable_ref, "over-released assignment");
            return;
        }
        a.references_left -= 1;
        if a.references_left != 0 {
            return;
        }
        if a.variable_ref {
            return;
        }
        let liveness = *self.analyzer.liveness(local);
        if liveness.last_full && liveness.last != self.cur_block {
            trace!("deferring free of {local} to {}", liveness.last);
            let prev_head = self.assignments.delayed_free[liveness.last];
            let a = self.assignments.get_mut(aref);
            a.pending_free = true;
            a.next_delayed_free = prev_head;
            self.assignments.delayed_free[liveness.last] = local.into();
        } else {
            self.free_assignment(local);
        }
    }

    // ---- Register allocation --------------------------------------------

    /// Claim a register in `bank`, evicting the clock's pick if no
    /// register is free. Panics when every candidate is locked, which is
    /// an invariant violation of the lowering layer.
    fn allocate_reg(&mut self, bank: RegBank, exclude: RegBitSet) -> Reg {
        if let Some(reg) = self.regs.find_first_free_excluding(bank, exclude) {
            return reg;
        }
        let reg = self
            .regs
            .find_clocked_nonfixed_excluding(bank, exclude)
            .unwrap_or_else(|| panic!("out of registers in bank {}", bank.id()));
        self.evict_reg(reg);
        reg
    }

    /// Evict the (unlocked) value living in `reg`, spilling if dirty.
    pub(crate) fn evict_reg(&mut self, reg: Reg) {
        debug_assert!(self.regs.is_used(reg));
        debug_assert!(!self.regs.is_fixed(reg));
        let local = self
            .regs
            .owner_local_idx(reg)
            .expect("evicting an ownerless register");
        let part = self.regs.owner_part(reg);
        let aref = self.assignments.of(local).expect("stale register owner");
        self.spill_part_if_needed(aref, part);
        let desc = self.assignments.part(aref, part);
        self.assignments
            .set_part(aref, part, desc.with_register_valid(false));
        self.regs.unmark_used(reg);
    }

    /// Write a dirty part back to its stack slot.
    pub(crate) fn spill_part_if_needed(&mut self, aref: crate::assign::AssignRef, part: u32) {
        let a = self.assignments.get(aref);
        if a.variable_ref {
            return;
        }
        let desc = self.assignments.part(aref, part);
        if desc.modified() && desc.register_valid() {
            let off = a.part_off(part);
            trace!("spilling {:?} to [fp{off:+}]", desc.reg());
            <B::Mach as Machine>::spill(self.asm, desc.reg(), off, desc.part_size());
            self.assignments
                .set_part(aref, part, desc.with_modified(false));
        }
    }

    pub(crate) fn lock_reg(&mut self, reg: Reg) {
        if self.regs.inc_lock_count(reg) == 1 && !self.regs.is_fixed(reg) {
            self.regs.mark_fixed(reg);
        }
    }

    pub(crate) fn unlock_reg(&mut self, reg: Reg) {
        if self.regs.dec_lock_count(reg) == 0 {
            self.regs.unmark_fixed(reg);
        }
    }

    pub(crate) fn take_scratch_reg(&mut self, bank: RegBank, exclude: RegBitSet) -> Reg {
        let reg = self.allocate_reg(bank, exclude);
        self.regs.mark_used(reg, None.into(), 0);
        self.regs.mark_clobbered(reg);
        self.regs.mark_fixed(reg);
        reg
    }

    pub(crate) fn take_specific_scratch_reg(&mut self, reg: Reg) {
        debug_assert!(!self.regs.is_fixed(reg), "stealing a locked register");
        if self.regs.is_used(reg) {
            self.evict_reg(reg);
        }
        self.regs.mark_used(reg, None.into(), 0);
        self.regs.mark_clobbered(reg);
        self.regs.mark_fixed(reg);
    }

    pub(crate) fn materialize_const_into(&mut self, reg: Reg, data: u64, size: u32) {
        debug_assert_eq!(
            reg.bank(),
            <B::Mach as Machine>::GP_BANK,
            "FP constants must be materialized by the lowering layer"
        );
        <B::Mach as Machine>::materialize_const(self.asm, reg, data, size);
    }

    pub(crate) fn load_part_to_reg(&mut self, local: ValLocalIdx, part: u32) -> Reg {
        let aref = self.assignments.of(local).expect("value use before def");
        let desc = self.assignments.part(aref, part);
        let a = self.assignments.get(aref);

        if desc.fixed_assignment() {
            debug_assert!(desc.register_valid(), "fixed assignment never defined");
            return desc.reg();
        }
        if desc.register_valid() {
            return desc.reg();
        }

        let variable_ref = a.variable_ref;
        let frame_off = a.frame_off;
        let reg = self.allocate_reg(desc.bank(), 0);
        self.regs.mark_used(reg, local.into(), part);
        self.regs.mark_clobbered(reg);
        if variable_ref {
            let off = frame_off;
            <B::Mach as Machine>::lea_stack(self.asm, reg, off);
            let desc = self.assignments.part(aref, part);
            self.assignments.set_part(
                aref,
                part,
                desc.with_reg(reg).with_register_valid(true).with_modified(false),
            );
        } else {
            debug_assert!(desc.stack_valid(), "load of uninitialized value {local}");
            let off = self.assignments.get(aref).part_off(part);
            <B::Mach as Machine>::reload(self.asm, reg, off, desc.part_size());
            let desc = self.assignments.part(aref, part);
            self.assignments
                .set_part(aref, part, desc.with_reg(reg).with_register_valid(true));
        }
        reg
    }

    pub(crate) fn alloc_part_reg(&mut self, local: ValLocalIdx, part: u32) -> Reg {
        let aref = self.assignments.of(local).expect("result before init");
        let desc = self.assignments.part(aref, part);
        if desc.fixed_assignment() || desc.register_valid() {
            self.assignments.set_part(
                aref,
                part,
                desc.with_register_valid(true).with_modified(true),
            );
            return desc.reg();
        }
        let reg = self.allocate_reg(desc.bank(), 0);
        self.regs.mark_used(reg, local.into(), part);
        self.regs.mark_clobbered(reg);
        let desc = self.assignments.part(aref, part);
        self.assignments.set_part(
            aref,
            part,
            desc.with_reg(reg).with_register_valid(true).with_modified(true),
        );
        reg
    }

    /// Hand a scratch register's contents to `(local, part)`.
    pub(crate) fn set_part_value(
        &mut self,
        local: ValLocalIdx,
        part: u32,
        locked: &mut bool,
        scratch: ScratchReg,
    ) {
        let aref = self.assignments.of(local).expect("result before init");
        let desc = self.assignments.part(aref, part);
        let src = scratch.cur_reg();

        if desc.fixed_assignment() {
            let dst = desc.reg();
            if dst != src {
                <B::Mach as Machine>::mov(self.asm, dst, src, desc.part_size());
            }
            self.assignments.set_part(
                aref,
                part,
                desc.with_register_valid(true).with_modified(true),
            );
            scratch.free(self);
            return;
        }

        if desc.register_valid() {
            let old = desc.reg();
            if old == src {
                self.assignments
                    .set_part(aref, part, desc.with_modified(true));
                scratch.forget();
                // The register already belongs to the value; restore its
                // non-scratch ownership.
                self.regs.unmark_fixed(src);
                self.regs.update_owner(src, local.into(), part);
                return;
            }
            if *locked {
                self.unlock_reg(old);
                *locked = false;
            }
            debug_assert!(!self.regs.is_fixed(old));
            self.regs.unmark_used(old);
        }

        let reg = scratch.forget();
        self.regs.unmark_fixed(reg);
        self.regs.update_owner(reg, local.into(), part);
        let desc = self.assignments.part(aref, part);
        self.assignments.set_part(
            aref,
            part,
            desc.with_reg(reg).with_register_valid(true).with_modified(true),
        );
    }

    // ---- Generic value parts --------------------------------------------

    /// Lower a generic operand to a single register.
    pub fn gval_as_reg(&mut self, gv: &mut GenValue) -> Reg {
        match gv {
            GenValue::Owned(scratch) => scratch.cur_reg(),
            GenValue::Borrowed(vp) => vp.load_to_reg(self),
            GenValue::Expr(expr) => {
                if expr.index.is_none() && expr.disp == 0 {
                    let base = expr.base.as_ref().expect("empty address expression");
                    return base.reg();
                }
                // Materialize the address arithmetic, reusing an owned base
                // register as the destination where possible.
                let GenValue::Expr(expr) = core::mem::replace(gv, GenValue::Empty) else {
                    unreachable!()
                };
                let base_reg = expr.base.as_ref().map(|b| b.reg());
                let index = expr.index.as_ref().map(|(r, s)| (r.reg(), *s));
                let mut dst = ScratchReg::new();
                if let Some(GvReg::Scratch(s)) = expr.base {
                    dst = s;
                } else {
                    dst.alloc(self, <B::Mach as Machine>::GP_BANK);
                }
                <B::Mach as Machine>::lea(self.asm, dst.cur_reg(), base_reg, index, expr.disp);
                if let Some((GvReg::Scratch(s), _)) = expr.index {
                    s.free(self);
                }
                let reg = dst.cur_reg();
                *gv = GenValue::Owned(dst);
                reg
            }
            GenValue::Empty => panic!("gval_as_reg on an empty operand"),
        }
    }

    /// Like [`gval_as_reg`](Self::gval_as_reg), additionally transferring
    /// an owned or salvageable register into `dst`.
    pub fn gval_as_reg_reuse(&mut self, gv: &mut GenValue, dst: &mut ScratchReg) -> Reg {
        let reg = self.gval_as_reg(gv);
        if !dst.has_reg() {
            match core::mem::replace(gv, GenValue::Empty) {
                GenValue::Owned(s) => {
                    *dst = s;
                    *gv = GenValue::Empty;
                }
                GenValue::Borrowed(mut vp) => {
                    if vp.can_salvage(self) {
                        *dst = vp.salvage(self);
                        vp.release(self);
                    } else {
                        *gv = GenValue::Borrowed(vp);
                    }
                }
                other => *gv = other,
            }
        }
        reg
    }

    /// Release whatever `gv` holds.
    pub fn gval_release(&mut self, gv: GenValue) {
        match gv {
            GenValue::Empty => {}
            GenValue::Owned(s) => s.free(self),
            GenValue::Borrowed(vp) => vp.release(self),
            GenValue::Expr(expr) => {
                if let Some(GvReg::Scratch(s)) = expr.base {
                    s.free(self);
                }
                if let Some((GvReg::Scratch(s), _)) = expr.index {
                    s.free(self);
                }
            }
        }
    }

    // ---- Branch boundary protocol ---------------------------------------

    /// Spill the registers successors rely on and report which register
    /// bindings must be released after the terminator. See the module
    /// comment for the block-entry invariant this maintains.
    pub fn spill_before_branch(&mut self) -> RegBitSet {
        let cur_ref = self.analyzer.block_ref(self.cur_block);
        let next = self.next_block();

        let mut succ_count = 0u32;
        let mut next_is_succ = false;
        let mut next_has_multiple_incoming = false;
        for succ in self.adaptor.block_succs(cur_ref) {
            succ_count += 1;
            if self.analyzer.block_idx(succ) == next {
                next_is_succ = true;
                if self.analyzer.block_has_multiple_incoming(next) {
                    next_has_multiple_incoming = true;
                }
            }
        }

        if succ_count == 1 && next_is_succ && !next_has_multiple_incoming {
            return 0;
        }

        // Values consumed only by successor PHIs die at the edge; count
        // those references so they are not spilled pointlessly.
        let mut phi_ref_count = [0u16; 64];
        let succs: SmallVec<[A::Block; 4]> = self.adaptor.block_succs(cur_ref).collect();
        for &succ in &succs {
            let phis: SmallVec<[A::Value; 4]> = self.adaptor.block_phis(succ).collect();
            for phi in phis {
                let inc = self.adaptor.phi_incoming_for_block(phi, cur_ref);
                if B::val_special(self.adaptor, inc).is_some() {
                    continue;
                }
                let local = self.adaptor.val_local_idx(inc);
                let Some(aref) = self.assignments.of(local) else {
                    continue;
                };
                for part in 0..self.assignments.get(aref).part_count {
                    let desc = self.assignments.part(aref, part);
                    if desc.register_valid() {
                        phi_ref_count[desc.reg().id() as usize] += 1;
                    }
                }
            }
        }

        let mut released = 0u64;
        for reg in regs_in(self.regs.used) {
            let keep = self.spill_reg_for_branch(
                reg,
                &phi_ref_count,
                &succs,
                next_is_succ,
                next_has_multiple_incoming,
            );
            if !keep && (next_has_multiple_incoming || !next_is_succ) {
                released |= reg.bit();
            }
        }
        released
    }

    /// Returns `true` when the register must stay bound (scratch or fixed
    /// assignment).
    fn spill_reg_for_branch(
        &mut self,
        reg: Reg,
        phi_ref_count: &[u16; 64],
        succs: &[A::Block],
        next_is_succ: bool,
        next_has_multiple_incoming: bool,
    ) -> bool {
        let Some(local) = self.regs.owner_local_idx(reg) else {
            // Scratch registers never live across blocks.
            return true;
        };
        let part = self.regs.owner_part(reg);
        let aref = self.assignments.of(local).expect("stale register owner");
        let desc = self.assignments.part(aref, part);
        if desc.fixed_assignment() {
            return true;
        }
        if !desc.modified() {
            return false;
        }
        if self.assignments.get(aref).variable_ref {
            return false;
        }

        let liveness = *self.analyzer.liveness(local);
        let refs = self.assignments.get(aref).references_left;
        if refs <= phi_ref_count[reg.id() as usize] as u32 && liveness.last <= self.cur_block {
            return false;
        }

        if !next_is_succ || next_has_multiple_incoming {
            self.spill_part_if_needed(aref, part);
            return false;
        }

        // The next block falls through with a single edge: spill only when
        // the value is live in some other successor.
        for &succ in succs {
            let idx = self.analyzer.block_idx(succ);
            if idx == self.next_block() {
                continue;
            }
            if idx >= liveness.first && idx <= liveness.last {
                self.spill_part_if_needed(aref, part);
                return false;
            }
        }
        false
    }

    /// Unbind the registers reported by [`spill_before_branch`].
    pub fn release_spilled_regs(&mut self, released: RegBitSet) {
        for reg in regs_in(released) {
            if !self.regs.is_used(reg) {
                continue;
            }
            if self.regs.is_fixed(reg) {
                debug_assert!(self.regs.owner_local_idx(reg).is_some());
                continue;
            }
            let local = self.regs.owner_local_idx(reg).expect("scratch in release set");
            let part = self.regs.owner_part(reg);
            let aref = self.assignments.of(local).expect("stale register owner");
            let desc = self.assignments.part(aref, part);
            self.assignments
                .set_part(aref, part, desc.with_register_valid(false));
            self.regs.unmark_used(reg);
        }
    }

    /// Forget all non-fixed register bindings. For use after terminators
    /// that leave the function.
    pub fn release_regs_after_return(&mut self) {
        let regs: SmallVec<[Reg; 8]> = self.regs.used_nonfixed_regs().collect();
        for reg in regs {
            let local = self.regs.owner_local_idx(reg).expect("scratch across return");
            let part = self.regs.owner_part(reg);
            let aref = self.assignments.of(local).expect("stale register owner");
            let desc = self.assignments.part(aref, part);
            self.assignments
                .set_part(aref, part, desc.with_register_valid(false));
            self.regs.unmark_used(reg);
        }
    }

    // ---- Branch emission -------------------------------------------------

    /// Emit the control transfer for one CFG edge: conditional or
    /// unconditional, resolving PHIs on the way. Conditional edges whose
    /// target has PHIs are split through a local stub so the moves only
    /// happen on the taken path.
    pub fn generate_branch(&mut self, cond: Option<Cond>, target: BlockIdx) {
        let has_phis = self.analyzer.block_has_phis(target);
        let label = self.block_label(target);
        match cond {
            Some(cc) => {
                if has_phis {
                    let skip = self.asm.label_create();
                    <B::Mach as Machine>::branch_cond(self.asm, cc.invert(), skip);
                    self.move_to_phis(target);
                    <B::Mach as Machine>::jump(self.asm, label);
                    self.asm.label_place(skip);
                } else {
                    <B::Mach as Machine>::branch_cond(self.asm, cc, label);
                }
            }
            None => {
                if has_phis {
                    self.move_to_phis(target);
                }
                if target != self.next_block() {
                    <B::Mach as Machine>::jump(self.asm, label);
                }
            }
        }
    }

    // ---- PHI resolution ---------------------------------------------------

    /// Move this block's outgoing values into the PHIs of `target`,
    /// breaking dependency cycles through temporaries.
    pub fn move_to_phis(&mut self, target: BlockIdx) {
        let target_ref = self.analyzer.block_ref(target);
        let cur_ref = self.analyzer.block_ref(self.cur_block);

        struct Node<V> {
            val: V,
            local: ValLocalIdx,
            ref_count: u32,
        }
        let mut nodes: SmallVec<[Node<A::Value>; 8]> = self
            .adaptor
            .block_phis(target_ref)
            .map(|val| Node {
                val,
                local: self.adaptor.val_local_idx(val),
                ref_count: 0,
            })
            .collect();
        debug_assert!(!nodes.is_empty(), "block marked as having PHIs has none");

        let mut scratch = PhiScratch::new();
        if nodes.len() == 1 {
            let inc = self.adaptor.phi_incoming_for_block(nodes[0].val, cur_ref);
            if inc != nodes[0].val {
                self.move_one_phi(&mut scratch, nodes[0].val, inc);
            }
            scratch.reset(self);
            return;
        }

        nodes.sort_by_key(|n| n.local);

        // Dependency edges between PHIs of the target: a -> b when b's
        // incoming value is a.
        let mut any_dep = false;
        for i in 0..nodes.len() {
            let inc = self.adaptor.phi_incoming_for_block(nodes[i].val, cur_ref);
            if B::val_special(self.adaptor, inc).is_some() {
                continue;
            }
            let inc_local = self.adaptor.val_local_idx(inc);
            if inc_local == nodes[i].local {
                continue; // self-reference resolves to a no-op
            }
            if let Ok(j) = nodes.binary_search_by_key(&inc_local, |n| n.local) {
                nodes[j].ref_count += 1;
                any_dep = true;
            }
        }

        if !any_dep {
            for i in 0..nodes.len() {
                let inc = self.adaptor.phi_incoming_for_block(nodes[i].val, cur_ref);
                self.move_one_phi(&mut scratch, nodes[i].val, inc);
            }
            scratch.reset(self);
            return;
        }

        let mut ready: SmallVec<[usize; 8]> = SmallVec::new();
        let mut waiting: SmallVec<[usize; 8]> = SmallVec::new();
        for (i, n) in nodes.iter().enumerate() {
            if n.ref_count == 0 {
                ready.push(i);
            } else {
                waiting.push(i);
            }
        }

        let mut handled = 0usize;
        let mut tmp = PhiTemp::<A>::none();
        let mut tmp_reg1 = PhiScratch::new();
        let mut tmp_reg2 = PhiScratch::new();

        while handled != nodes.len() {
            if ready.is_empty() {
                // Break a cycle: park one waiting node's current value in
                // temporaries and treat the node as resolved.
                let cur_idx = waiting[0];
                debug_assert_eq!(nodes[cur_idx].ref_count, 1);
                debug_assert!(tmp.val.is_none());
                let phi_val = nodes[cur_idx].val;
                self.save_phi_to_temp(&mut tmp, &mut tmp_reg1, &mut tmp_reg2, phi_val);
                nodes[cur_idx].ref_count = 0;
                ready.push(cur_idx);
                waiting.retain(|&mut i| i != cur_idx);
            }

            let batch: SmallVec<[usize; 8]> = ready.drain(..).collect();
            for cur_idx in batch {
                handled += 1;
                let phi_val = nodes[cur_idx].val;
                let inc = self.adaptor.phi_incoming_for_block(phi_val, cur_ref);
                if B::val_special(self.adaptor, inc).is_none()
                    && self.adaptor.val_local_idx(inc) == nodes[cur_idx].local
                {
                    continue;
                }

                if tmp.val == Some(inc) {
                    self.move_phi_from_temp(&mut tmp, &mut tmp_reg1, &mut tmp_reg2, phi_val);
                    continue;
                }

                // The general scratch, not the cycle temporaries: those
                // hold the parked value until its dependent is reached.
                self.move_one_phi(&mut scratch, phi_val, inc);

                if B::val_special(self.adaptor, inc).is_some() {
                    continue;
                }
                let inc_local = self.adaptor.val_local_idx(inc);
                if let Ok(j) = nodes.binary_search_by_key(&inc_local, |n| n.local) {
                    debug_assert!(nodes[j].ref_count > 0);
                    nodes[j].ref_count -= 1;
                    if nodes[j].ref_count == 0 {
                        ready.push(j);
                        waiting.retain(|&mut i| i != j);
                    }
                }
            }
        }

        debug_assert!(tmp.val.is_none(), "unconsumed PHI cycle temporary");
        tmp_reg1.reset(self);
        tmp_reg2.reset(self);
        scratch.reset(self);
    }

    /// Move `incoming` into `phi`'s home (fixed register or stack slot).
    fn move_one_phi(&mut self, scratch: &mut PhiScratch, phi: A::Value, incoming: A::Value) {
        let phi_vr = self.result_ref(phi);
        let phi_local = phi_vr.local_idx();
        let val_vr = self.val_ref(incoming);
        let phi_aref = self.assignments.of(phi_local).unwrap();
        let part_count = self.assignments.get(phi_aref).part_count;

        for i in 0..part_count {
            let mut vp = val_vr.part(i);
            let src = match vp.cur_reg_unlocked(self) {
                Some(reg) => reg,
                None => {
                    let bank = vp.bank(self);
                    let reg = scratch.alloc_from_bank(self, bank);
                    vp.reload_into_specific_fixed(self, reg);
                    reg
                }
            };

            let phi_desc = self.assignments.part(phi_aref, i);
            if phi_desc.fixed_assignment() {
                if phi_desc.reg() != src {
                    <B::Mach as Machine>::mov(self.asm, phi_desc.reg(), src, phi_desc.part_size());
                }
                self.assignments.set_part(
                    phi_aref,
                    i,
                    phi_desc.with_register_valid(true).with_modified(true),
                );
            } else {
                let off = self.assignments.get(phi_aref).part_off(i);
                <B::Mach as Machine>::spill(self.asm, src, off, phi_desc.part_size());
                let mut desc = phi_desc.with_modified(false);
                // A stale cached register would shadow the slot we just
                // wrote.
                if desc.register_valid() {
                    self.regs.unmark_used(desc.reg());
                    desc = desc.with_register_valid(false);
                }
                self.assignments.set_part(phi_aref, i, desc);
            }
            vp.release(self);
        }

        val_vr.release(self);
        phi_vr.release(self);
    }

    fn save_phi_to_temp(
        &mut self,
        tmp: &mut PhiTemp<A>,
        tmp_reg1: &mut PhiScratch,
        tmp_reg2: &mut PhiScratch,
        phi_val: A::Value,
    ) {
        let local = self.adaptor.val_local_idx(phi_val);
        let aref = self.assignments.of(local).expect("cycle PHI without assignment");
        let part_count = self.assignments.get(aref).part_count;
        tmp.val = Some(phi_val);
        tmp.part_count = part_count;

        if part_count > 2 {
            // Too many parts for registers: copy through a fresh stack
            // slot.
            let size = self.assignments.get(aref).size();
            let slot = self.frame.allocate(size);
            tmp.slot = Some((slot, size));
            let tmp_base = -(slot as i32);
            let max = self.assignments.get(aref).max_part_size as i32;
            for i in 0..part_count {
                let desc = self.assignments.part(aref, i);
                debug_assert!(!desc.fixed_assignment());
                let slot_off = tmp_base + i as i32 * max;
                if desc.register_valid() {
                    <B::Mach as Machine>::spill(self.asm, desc.reg(), slot_off, desc.part_size());
                } else {
                    debug_assert!(desc.stack_valid());
                    let reg = tmp_reg1.alloc_from_bank(self, desc.bank());
                    let off = self.assignments.get(aref).part_off(i);
                    <B::Mach as Machine>::reload(self.asm, reg, off, desc.part_size());
                    <B::Mach as Machine>::spill(self.asm, reg, slot_off, desc.part_size());
                }
            }
        } else {
            let phi_vr = self.val_ref(phi_val);
            for i in 0..part_count {
                let mut vp = phi_vr.part(i);
                let bank = vp.bank(self);
                let scratch = if i == 0 { &mut *tmp_reg1 } else { &mut *tmp_reg2 };
                let reg = scratch.alloc_from_bank(self, bank);
                vp.reload_into_specific_fixed(self, reg);
                vp.release(self);
            }
            phi_vr.disown();
        }
    }

    fn move_phi_from_temp(
        &mut self,
        tmp: &mut PhiTemp<A>,
        tmp_reg1: &mut PhiScratch,
        tmp_reg2: &mut PhiScratch,
        target_phi: A::Value,
    ) {
        let tmp_val = tmp.val.take().expect("no PHI temporary to consume");
        // Consume one reference of the parked source value.
        self.val_ref(tmp_val).release(self);

        let phi_vr = self.result_ref(target_phi);
        let phi_local = phi_vr.local_idx();
        let phi_aref = self.assignments.of(phi_local).unwrap();

        if tmp.part_count <= 2 {
            for i in 0..tmp.part_count {
                let desc = self.assignments.part(phi_aref, i);
                let src = if i == 0 {
                    tmp_reg1.cur_reg()
                } else {
                    tmp_reg2.cur_reg()
                };
                if desc.fixed_assignment() {
                    debug_assert_eq!(i, 0);
                    <B::Mach as Machine>::mov(self.asm, desc.reg(), src, desc.part_size());
                    self.assignments.set_part(
                        phi_aref,
                        i,
                        desc.with_register_valid(true).with_modified(true),
                    );
                } else {
                    let off = self.assignments.get(phi_aref).part_off(i);
                    <B::Mach as Machine>::spill(self.asm, src, off, desc.part_size());
                    let mut desc = desc.with_modified(false);
                    if desc.register_valid() {
                        self.regs.unmark_used(desc.reg());
                        desc = desc.with_register_valid(false);
                    }
                    self.assignments.set_part(phi_aref, i, desc);
                }
            }
        } else {
            let (slot, slot_size) = tmp.slot.take().expect("large PHI temp without slot");
            let tmp_base = -(slot as i32);
            let max = self.assignments.get(phi_aref).max_part_size as i32;
            for i in 0..tmp.part_count {
                let desc = self.assignments.part(phi_aref, i);
                debug_assert!(!desc.fixed_assignment());
                let reg = tmp_reg1.alloc_from_bank(self, desc.bank());
                <B::Mach as Machine>::reload(self.asm, reg, tmp_base + i as i32 * max, desc.part_size());
                let off = self.assignments.get(phi_aref).part_off(i);
                <B::Mach as Machine>::spill(self.asm, reg, off, desc.part_size());
                let mut desc = desc.with_modified(false);
                if desc.register_valid() {
                    self.regs.unmark_used(desc.reg());
                    desc = desc.with_register_valid(false);
                }
                self.assignments.set_part(phi_aref, i, desc);
            }
            self.frame.free(slot, slot_size);
        }

        phi_vr.release(self);
    }

    // ---- Function driver --------------------------------------------------

    /// Compile one function. An `Unsupported` error means the lowering
    /// layer rejected the function; all partially-emitted bytes and
    /// relocations have been rolled back and the caller may continue
    /// with the next function.
    pub fn compile_func(&mut self, func: A::Func, func_idx: u32) -> Result<(), CodegenError> {
        let text_mark = self.asm.text_off();
        let reloc_mark = self.asm.section(self.asm.text_section()).relocs.len();
        if self.compile_func_inner(func, func_idx) {
            return Ok(());
        }
        self.asm.text_mut().truncate(text_mark as usize);
        let text = self.asm.text_section();
        self.asm.section_mut(text).relocs.truncate(reloc_mark);
        self.asm.labels_abandon();
        let reason = self
            .unsupported
            .take()
            .unwrap_or_else(|| "the lowering layer rejected the function".to_string());
        Err(CodegenError::Unsupported(reason))
    }

    fn compile_func_inner(&mut self, func: A::Func, func_idx: u32) -> bool {
        self.unsupported = None;
        if !self.adaptor.switch_func(func) {
            self.set_unsupported("the adaptor rejected the function");
            return false;
        }
        self.cur_func_sym = self.func_syms[func_idx as usize];
        self.analyzer.switch_func(self.adaptor);

        self.assignments.reset();
        self.regs.reset(<B::Mach as Machine>::cc_info().allocatable);
        self.asm.labels_reset();
        self.block_labels.clear();
        for _ in 0..self.analyzer.num_blocks() {
            self.block_labels.push(self.asm.label_create());
        }
        self.cur_block = BlockIdx::new(0);

        <B::Mach as Machine>::start_func(self.asm, &mut self.mach);
        self.personality = B::cur_personality(self);

        let is_vararg = self.adaptor.cur_is_vararg();
        let info = <B::Mach as Machine>::emit_prologue(self.asm, &mut self.mach, is_vararg);
        self.func_start_off = info.func_start_off;
        self.frame.reset(info.reserved_frame_size);

        if !self.setup_static_allocas() {
            return false;
        }
        self.setup_args();
        if self.unsupported.is_some() {
            return false;
        }

        let layout: Vec<A::Block> = self.analyzer.block_layout().to_vec();
        for (idx, block) in layout.iter().enumerate() {
            trace!("compiling block {idx}");
            if !self.compile_block(*block, BlockIdx::new(idx)) {
                error!("failed to compile block {idx}");
                return false;
            }
        }

        // The frame size is only final now; reject it if the prologue
        // patching cannot encode it (a 24-bit immediate on AArch64).
        if ((self.frame.frame_size + 15) & !15) > <B::Mach as Machine>::MAX_FRAME_SIZE {
            self.set_unsupported("frame size exceeds the target's encodable range");
            return false;
        }

        debug_assert_eq!(
            self.assignments.outstanding_references(),
            0,
            "references left at end of function"
        );

        let fin = FuncFinishInfo {
            func_sym: self.cur_func_sym,
            func_start_off: self.func_start_off,
            frame_size: self.frame.frame_size,
            clobbered: self.regs.clobbered,
            has_dynamic_alloca: self.adaptor.cur_has_dynamic_alloca(),
            personality: self.personality,
        };
        <B::Mach as Machine>::finish_func(self.asm, &mut self.mach, &fin);
        true
    }

    fn setup_static_allocas(&mut self) -> bool {
        let allocas: SmallVec<[A::Value; 8]> = self.adaptor.cur_static_allocas().collect();
        for alloca in allocas {
            let local = self.adaptor.val_local_idx(alloca);
            let liveness = *self.analyzer.liveness(local);
            if liveness.ref_count <= 1 {
                continue; // defined but never read
            }
            let align = self.adaptor.val_alloca_align(alloca).max(1);
            if align > 16 {
                self.set_unsupported("alloca alignment above 16");
                return false;
            }
            let size = self.adaptor.val_alloca_size(alloca);
            let size = (size + align - 1) & !(align - 1);
            let slot = self.frame.allocate(size);
            self.init_variable_ref(local, -(slot as i32), liveness.ref_count);
        }
        true
    }

    /// Bind function arguments per the calling convention: register
    /// arguments are born in their register, stack arguments are loaded
    /// eagerly, byval arguments become references into the caller's frame.
    fn setup_args(&mut self) {
        use crate::cc::{CcAssigner, CcAssignment};

        let mut cc = <B::Mach as Machine>::new_cc(self.adaptor.cur_is_vararg());
        let arg_regs = <B::Mach as Machine>::cc_info().arg_regs;
        // Keep argument registers out of circulation until each is
        // assigned, so eager loads cannot clobber later arguments.
        self.regs.allocatable &= !arg_regs;
        self.regs.free &= !arg_regs;

        let args: SmallVec<[A::Value; 8]> = self.adaptor.cur_args().collect();
        for (arg_idx, &arg) in args.iter().enumerate() {
            let local = self.adaptor.val_local_idx(arg);
            let liveness = *self.analyzer.liveness(local);
            let used = liveness.ref_count > 1;

            if self.adaptor.cur_arg_is_byval(arg_idx as u32) {
                let mut cca = CcAssignment {
                    byval: true,
                    byval_size: self.adaptor.cur_arg_byval_size(arg_idx as u32),
                    byval_align: self.adaptor.cur_arg_byval_align(arg_idx as u32),
                    ..Default::default()
                };
                cc.assign_arg(&mut cca);
                if used {
                    let off = <B::Mach as Machine>::FRAME_ARG_BASE + cca.stack_off as i32;
                    self.init_variable_ref(local, off, liveness.ref_count);
                    self.drop_value_reference(local);
                }
                continue;
            }

            let parts = B::val_parts(self.adaptor, arg);
            let vr = if used {
                Some(self.result_ref(arg))
            } else {
                None
            };
            for (i, p) in parts.iter().enumerate() {
                let mut cca = CcAssignment::part(p.bank, p.size as u32);
                cca.sret = self.adaptor.cur_arg_is_sret(arg_idx as u32);
                if p.bank == <B::Mach as Machine>::GP_BANK {
                    cca.consecutive = (parts.len() - 1 - i) as u32;
                }
                cc.assign_arg(&mut cca);

                match cca.reg {
                    Some(reg) => {
                        // Hand the register back to the allocator as soon
                        // as it is consumed.
                        if let Some(vr) = &vr {
                            let mut scratch = ScratchReg::new();
                            scratch.alloc_specific(self, reg);
                            let mut vp = vr.part(i as u32);
                            vp.set_value_from_scratch(self, scratch);
                            vp.release(self);
                        }
                        self.regs.allocatable |= reg.bit();
                        if !self.regs.is_used(reg) {
                            self.regs.free |= reg.bit();
                        }
                    }
                    None => {
                        if let Some(vr) = &vr {
                            let mut vp = vr.part(i as u32);
                            let dst = vp.alloc_reg(self);
                            let off = <B::Mach as Machine>::FRAME_ARG_BASE + cca.stack_off as i32;
                            <B::Mach as Machine>::reload(self.asm, dst, off, cca.size);
                            vp.release(self);
                        }
                    }
                }
            }
            if let Some(vr) = vr {
                vr.release(self);
            }
        }

        if self.adaptor.cur_is_vararg() {
            let remaining = self.regs.allocatable & arg_regs;
            let gp_used = (arg_regs & !remaining
                & <B::Mach as Machine>::GP_BANK.regs())
                .count_ones();
            let fp_used = (arg_regs & !remaining
                & <B::Mach as Machine>::FP_BANK.regs())
                .count_ones();
            <B::Mach as Machine>::record_vararg_info(
                &mut self.mach,
                gp_used,
                fp_used,
                <B::Mach as Machine>::FRAME_ARG_BASE as u32 + cc.stack_size(),
            );
        }

        self.regs.allocatable |= arg_regs;
        self.regs.free |= arg_regs & !self.regs.used;
    }

    fn compile_block(&mut self, block: A::Block, idx: BlockIdx) -> bool {
        self.cur_block = idx;
        self.asm.label_place(self.block_labels[idx.index()]);
        if cfg!(debug_assertions) && self.analyzer.block_has_multiple_incoming(idx) {
            self.validate_block_entry();
        }

        let insts: SmallVec<[A::Inst; 16]> = self.adaptor.block_insts(block).collect();
        for inst in insts {
            if self.adaptor.inst_fused(inst) {
                continue;
            }
            if !B::compile_inst(self, inst) {
                error!("failed to compile instruction {inst:?}");
                return false;
            }
            if self.unsupported.is_some() {
                // A helper below the lowering layer (e.g. the call
                // builder) hit an unencodable case.
                return false;
            }
            if cfg!(debug_assertions) {
                self.validate_register_state();
            }
        }

        // Drain this block's delayed-free list.
        let mut head = self.assignments.delayed_free[idx];
        self.assignments.delayed_free[idx] = PackedOption::default();
        while let Some(local) = head.expand() {
            let aref = self.assignments.of(local).expect("freed delayed entry");
            head = self.assignments.get(aref).next_delayed_free;
            self.free_assignment(local);
        }
        true
    }

    /// Check the register/assignment round-trip invariant in both
    /// directions. Debug builds run this after every instruction; tests
    /// may call it directly.
    pub fn validate_register_state(&self) {
        for reg in regs_in(self.regs.used) {
            if let Some(local) = self.regs.owner_local_idx(reg) {
                let aref = self
                    .assignments
                    .of(local)
                    .unwrap_or_else(|| panic!("{reg:?} owned by freed {local}"));
                let part = self.regs.owner_part(reg);
                let desc = self.assignments.part(aref, part);
                assert!(
                    desc.register_valid() && desc.reg() == reg,
                    "{reg:?} owner does not point back"
                );
            }
        }
        for (local, aref) in self.assignments.live_assignments() {
            for part in 0..self.assignments.get(aref).part_count {
                let desc = self.assignments.part(aref, part);
                if desc.register_valid() {
                    let reg = desc.reg();
                    assert!(self.regs.is_used(reg), "{local} part {part} names free {reg:?}");
                    assert_eq!(self.regs.owner_local_idx(reg), Some(local));
                    assert_eq!(self.regs.owner_part(reg), part);
                }
            }
        }
    }

    /// Check the block-entry invariant at blocks with multiple
    /// predecessors: every live non-fixed value sits in its stack slot and
    /// holds no register.
    pub fn validate_block_entry(&self) {
        for (local, aref) in self.assignments.live_assignments() {
            let a = self.assignments.get(aref);
            if a.variable_ref || a.references_left == 0 {
                continue;
            }
            for part in 0..a.part_count {
                let desc = self.assignments.part(aref, part);
                if desc.fixed_assignment() {
                    continue;
                }
                assert!(
                    !desc.register_valid(),
                    "{local} still bound to {:?} at a merge point",
                    desc.reg()
                );
                assert!(
                    desc.stack_valid(),
                    "{local} part {part} not in its stack slot at a merge point"
                );
            }
        }
    }
}

/// A register temporarily borrowed for PHI moves. If a live value had to
/// be evicted to get it, the value is restored on reset.
struct PhiScratch {
    reg: Option<Reg>,
    backup: Option<(ValLocalIdx, u32, bool)>,
}

impl PhiScratch {
    fn new() -> Self {
        PhiScratch {
            reg: None,
            backup: None,
        }
    }

    fn cur_reg(&self) -> Reg {
        self.reg.expect("PHI scratch not allocated")
    }

    fn alloc_from_bank<A: IrAdaptor, B: Backend<A>>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        bank: RegBank,
    ) -> Reg {
        if let Some(reg) = self.reg {
            if reg.bank() == bank {
                return reg;
            }
            self.reset(ctx);
        }

        let reg = match ctx.regs.find_first_free_excluding(bank, 0) {
            Some(reg) => reg,
            None => {
                let reg = ctx
                    .regs
                    .find_first_nonfixed_excluding(bank, 0)
                    .expect("out of registers for PHI scratch");
                let local = ctx.regs.owner_local_idx(reg).expect("evicting scratch");
                let part = ctx.regs.owner_part(reg);
                let aref = ctx.assignments.of(local).expect("stale register owner");
                let desc = ctx.assignments.part(aref, part);
                self.backup = Some((local, part, desc.modified()));
                ctx.spill_part_if_needed(aref, part);
                let desc = ctx.assignments.part(aref, part);
                ctx.assignments
                    .set_part(aref, part, desc.with_register_valid(false));
                ctx.regs.unmark_used(reg);
                reg
            }
        };

        ctx.regs.mark_used(reg, None.into(), 0);
        ctx.regs.mark_clobbered(reg);
        ctx.regs.mark_fixed(reg);
        self.reg = Some(reg);
        reg
    }

    fn reset<A: IrAdaptor, B: Backend<A>>(&mut self, ctx: &mut CodeGen<'_, A, B>) {
        let Some(reg) = self.reg.take() else {
            return;
        };
        ctx.regs.unmark_fixed(reg);
        ctx.regs.unmark_used(reg);

        if let Some((local, part, was_modified)) = self.backup.take() {
            // Restore the evicted value if it is still live.
            if let Some(aref) = ctx.assignments.of(local) {
                let a = ctx.assignments.get(aref);
                if a.variable_ref {
                    let off = a.frame_off;
                    <B::Mach as Machine>::lea_stack(ctx.asm, reg, off);
                } else {
                    let desc = ctx.assignments.part(aref, part);
                    debug_assert!(desc.stack_valid());
                    let off = a.part_off(part);
                    <B::Mach as Machine>::reload(ctx.asm, reg, off, desc.part_size());
                }
                let desc = ctx
                    .assignments
                    .part(aref, part)
                    .with_reg(reg)
                    .with_register_valid(true)
                    .with_modified(was_modified);
                ctx.assignments.set_part(aref, part, desc);
                ctx.regs.mark_used(reg, local.into(), part);
            }
        }
    }
}

impl Drop for PhiScratch {
    fn drop(&mut self) {
        debug_assert!(self.reg.is_none(), "PHI scratch leaked without reset");
    }
}

/// The parked value while a PHI cycle is broken.
struct PhiTemp<A: IrAdaptor> {
    val: Option<A::Value>,
    part_count: u32,
    slot: Option<(u32, u32)>,
}

impl<A: IrAdaptor> PhiTemp<A> {
    fn none() -> Self {
        PhiTemp {
            val: None,
            part_count: 0,
            slot: None,
        }
    }
}
