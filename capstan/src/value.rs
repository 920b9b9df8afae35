//! Value handles: the only way lowering code touches the register file.
//!
//! A [`ValueRef`] is one *use* (or definition) of a value: it owns exactly
//! one unit of the assignment's reference count. [`ValuePartRef`]s are
//! per-part views derived from it; loading a part locks its register so
//! eviction cannot take it away mid-instruction. A [`ScratchReg`] owns a
//! temporarily-reserved register outright.
//!
//! Handles carry no back-reference to the context; every operation takes
//! `&mut CodeGen` explicitly, and each handle must be released back into
//! the context before the surrounding scope ends. Debug builds assert the
//! release happened. Acquisition order matters: lock inputs before
//! allocating outputs, so a dying input register can be salvaged as the
//! destination.

use crate::adaptor::IrAdaptor;
use crate::codegen::{Backend, CodeGen};
use crate::regfile::{Reg, RegBank};
use crate::{asm::SymRef, ValLocalIdx};

/// A constant or symbolic value that has no assignment record.
#[derive(Clone, Copy, Debug)]
pub enum SpecialVal {
    /// An immediate of up to eight bytes.
    Imm { bank: RegBank, size: u8, data: u64 },
    /// The address of a symbol.
    Sym(SymRef),
}

/// One reference-counted use of a value.
pub struct ValueRef {
    state: ValState,
    released: bool,
}

enum ValState {
    Assignment { local: ValLocalIdx },
    Special(SpecialVal),
}

impl ValueRef {
    pub(crate) fn assignment(local: ValLocalIdx) -> Self {
        ValueRef {
            state: ValState::Assignment { local },
            released: false,
        }
    }

    pub(crate) fn special(sv: SpecialVal) -> Self {
        ValueRef {
            state: ValState::Special(sv),
            released: false,
        }
    }

    pub fn has_assignment(&self) -> bool {
        matches!(self.state, ValState::Assignment { .. })
    }

    pub fn local_idx(&self) -> ValLocalIdx {
        match self.state {
            ValState::Assignment { local } => local,
            ValState::Special(_) => panic!("special value has no local index"),
        }
    }

    /// A part view. Part views share this reference's count; they only
    /// track register locking.
    pub fn part(&self, idx: u32) -> ValuePartRef {
        match self.state {
            ValState::Assignment { local } => ValuePartRef {
                state: PartState::Part {
                    local,
                    part: idx,
                    locked: false,
                },
                released: false,
            },
            ValState::Special(sv) => {
                debug_assert_eq!(idx, 0);
                ValuePartRef::from_special(sv)
            }
        }
    }

    /// Bump the underlying reference count, e.g. when one IR use expands
    /// into several handle acquisitions.
    pub fn inc_ref_count<A: IrAdaptor, B: Backend<A>>(&self, ctx: &mut CodeGen<'_, A, B>) {
        if let ValState::Assignment { local } = self.state {
            if let Some(aref) = ctx.assignments.of(local) {
                ctx.assignments.get_mut(aref).references_left += 1;
            }
        }
    }

    /// Drop this use: decrement the reference count and free (or
    /// delayed-free) the assignment when it reaches zero.
    pub fn release<A: IrAdaptor, B: Backend<A>>(mut self, ctx: &mut CodeGen<'_, A, B>) {
        self.released = true;
        if let ValState::Assignment { local } = self.state {
            ctx.drop_value_reference(local);
        }
    }

    /// Forget this reference without touching the count. Used when another
    /// handle has taken over the reference.
    pub fn disown(mut self) {
        self.released = true;
    }
}

impl Drop for ValueRef {
    fn drop(&mut self) {
        debug_assert!(self.released, "value reference leaked without release");
    }
}

/// A handle to one part of a value.
pub struct ValuePartRef {
    pub(crate) state: PartState,
    released: bool,
}

pub(crate) enum PartState {
    /// A part of an assignment-backed value.
    Part {
        local: ValLocalIdx,
        part: u32,
        locked: bool,
    },
    /// An inline constant.
    Imm { bank: RegBank, size: u8, data: u64 },
    /// The address of a symbol.
    Sym { sym: SymRef },
    /// An owned register detached from any assignment.
    Temp { scratch: ScratchReg, size: u8 },
}

impl ValuePartRef {
    pub(crate) fn from_special(sv: SpecialVal) -> Self {
        let state = match sv {
            SpecialVal::Imm { bank, size, data } => PartState::Imm { bank, size, data },
            SpecialVal::Sym(sym) => PartState::Sym { sym },
        };
        ValuePartRef {
            state,
            released: false,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self.state, PartState::Imm { .. })
    }

    pub fn const_value(&self) -> u64 {
        match self.state {
            PartState::Imm { data, .. } => data,
            _ => panic!("not a constant part"),
        }
    }

    pub fn bank<A: IrAdaptor, B: Backend<A>>(&self, ctx: &CodeGen<'_, A, B>) -> RegBank {
        match &self.state {
            PartState::Part { local, part, .. } => {
                let aref = ctx.assignments.of(*local).expect("value use before def");
                ctx.assignments.part(aref, *part).bank()
            }
            PartState::Imm { bank, .. } => *bank,
            PartState::Sym { .. } => <B::Mach as crate::isa::Machine>::GP_BANK,
            PartState::Temp { scratch, .. } => scratch.cur_reg().bank(),
        }
    }

    pub fn part_size<A: IrAdaptor, B: Backend<A>>(&self, ctx: &CodeGen<'_, A, B>) -> u32 {
        match &self.state {
            PartState::Part { local, part, .. } => {
                let aref = ctx.assignments.of(*local).expect("value use before def");
                ctx.assignments.part(aref, *part).part_size()
            }
            PartState::Imm { size, .. } => *size as u32,
            PartState::Sym { .. } => 8,
            PartState::Temp { size, .. } => *size as u32,
        }
    }

    /// The register currently bound to this part, if any, without locking.
    pub fn cur_reg_unlocked<A: IrAdaptor, B: Backend<A>>(
        &self,
        ctx: &CodeGen<'_, A, B>,
    ) -> Option<Reg> {
        match &self.state {
            PartState::Part { local, part, .. } => {
                let aref = ctx.assignments.of(*local)?;
                let desc = ctx.assignments.part(aref, *part);
                desc.register_valid().then(|| desc.reg())
            }
            PartState::Temp { scratch, .. } => Some(scratch.cur_reg()),
            _ => None,
        }
    }

    /// Load the part into a register and lock it for the duration of this
    /// handle (or until `release`).
    pub fn load_to_reg<A: IrAdaptor, B: Backend<A>>(&mut self, ctx: &mut CodeGen<'_, A, B>) -> Reg {
        match &mut self.state {
            PartState::Part {
                local,
                part,
                locked,
            } => {
                let reg = ctx.load_part_to_reg(*local, *part);
                if !*locked {
                    ctx.lock_reg(reg);
                    *locked = true;
                }
                reg
            }
            PartState::Imm { bank, size, data } => {
                let (bank, size, data) = (*bank, *size, *data);
                let mut scratch = ScratchReg::new();
                let reg = scratch.alloc(ctx, bank);
                ctx.materialize_const_into(reg, data, size as u32);
                self.state = PartState::Temp { scratch, size };
                reg
            }
            PartState::Sym { sym } => {
                let sym = *sym;
                let mut scratch = ScratchReg::new();
                let reg = scratch.alloc(ctx, <B::Mach as crate::isa::Machine>::GP_BANK);
                <B::Mach as crate::isa::Machine>::load_sym_addr(ctx.asm, reg, sym);
                self.state = PartState::Temp { scratch, size: 8 };
                reg
            }
            PartState::Temp { scratch, .. } => scratch.cur_reg(),
        }
    }

    /// Allocate a register for this part without loading the old contents;
    /// the caller is about to define the value. The register comes back
    /// locked and the part marked dirty.
    pub fn alloc_reg<A: IrAdaptor, B: Backend<A>>(&mut self, ctx: &mut CodeGen<'_, A, B>) -> Reg {
        match &mut self.state {
            PartState::Part {
                local,
                part,
                locked,
            } => {
                let reg = ctx.alloc_part_reg(*local, *part);
                if !*locked {
                    ctx.lock_reg(reg);
                    *locked = true;
                }
                reg
            }
            _ => panic!("alloc_reg on a non-assignment part"),
        }
    }

    pub fn set_modified<A: IrAdaptor, B: Backend<A>>(&self, ctx: &mut CodeGen<'_, A, B>) {
        if let PartState::Part { local, part, .. } = self.state {
            let aref = ctx.assignments.of(local).expect("value use before def");
            let desc = ctx.assignments.part(aref, part).with_modified(true);
            ctx.assignments.set_part(aref, part, desc);
        }
    }

    /// Whether `salvage` can hand the bound register over.
    pub fn can_salvage<A: IrAdaptor, B: Backend<A>>(&self, ctx: &CodeGen<'_, A, B>) -> bool {
        match &self.state {
            PartState::Part { local, part, .. } => match ctx.assignments.of(*local) {
                Some(aref) => {
                    let desc = ctx.assignments.part(aref, *part);
                    desc.register_valid()
                        && !desc.fixed_assignment()
                        && ctx.assignments.get(aref).references_left <= 1
                }
                None => false,
            },
            PartState::Temp { .. } => true,
            _ => false,
        }
    }

    /// Take ownership of the bound register as a scratch; only valid when
    /// `can_salvage` holds. The part loses its register binding.
    pub fn salvage<A: IrAdaptor, B: Backend<A>>(&mut self, ctx: &mut CodeGen<'_, A, B>) -> ScratchReg {
        match &mut self.state {
            PartState::Part {
                local,
                part,
                locked,
            } => {
                let aref = ctx.assignments.of(*local).expect("value use before def");
                let desc = ctx.assignments.part(aref, *part);
                debug_assert!(desc.register_valid() && !desc.fixed_assignment());
                let reg = desc.reg();
                if *locked {
                    ctx.unlock_reg(reg);
                    *locked = false;
                }
                ctx.assignments
                    .set_part(aref, *part, desc.with_register_valid(false));
                debug_assert_eq!(ctx.regs.lock_count(reg), 0);
                ctx.regs.update_owner(reg, None.into(), 0);
                ctx.regs.mark_fixed(reg);
                ScratchReg { reg: Some(reg) }
            }
            PartState::Temp { scratch, .. } => {
                let mut out = ScratchReg::new();
                core::mem::swap(&mut out, scratch);
                out
            }
            _ => panic!("salvage of a constant part"),
        }
    }

    /// Materialize this part into `reg` without rebinding the assignment.
    /// `reg` must already be reserved by the caller.
    pub fn reload_into_specific_fixed<A: IrAdaptor, B: Backend<A>>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        reg: Reg,
    ) {
        match &self.state {
            PartState::Part { local, part, .. } => {
                let aref = ctx.assignments.of(*local).expect("value use before def");
                let desc = ctx.assignments.part(aref, *part);
                let a = ctx.assignments.get(aref);
                if a.variable_ref {
                    let off = a.frame_off;
                    <B::Mach as crate::isa::Machine>::lea_stack(ctx.asm, reg, off);
                } else if desc.register_valid() {
                    if desc.reg() != reg {
                        <B::Mach as crate::isa::Machine>::mov(
                            ctx.asm,
                            reg,
                            desc.reg(),
                            desc.part_size(),
                        );
                    }
                } else {
                    debug_assert!(desc.stack_valid(), "load of uninitialized value");
                    let off = a.part_off(*part);
                    <B::Mach as crate::isa::Machine>::reload(ctx.asm, reg, off, desc.part_size());
                }
            }
            PartState::Imm { size, data, .. } => {
                ctx.materialize_const_into(reg, *data, *size as u32);
            }
            PartState::Sym { sym } => {
                <B::Mach as crate::isa::Machine>::load_sym_addr(ctx.asm, reg, *sym);
            }
            PartState::Temp { scratch, size } => {
                if scratch.cur_reg() != reg {
                    <B::Mach as crate::isa::Machine>::mov(
                        ctx.asm,
                        reg,
                        scratch.cur_reg(),
                        *size as u32,
                    );
                }
            }
        }
    }

    /// Produce a handle holding this part sign/zero-extended to
    /// `to_bits`, materializing into an owned register (constants fold).
    pub fn into_extended<A: IrAdaptor, B: Backend<A>>(
        mut self,
        ctx: &mut CodeGen<'_, A, B>,
        signed: bool,
        from_bits: u32,
        to_bits: u32,
    ) -> ValuePartRef {
        if let PartState::Imm { bank, data, .. } = self.state {
            let data = if signed {
                let shift = 64 - from_bits;
                (((data << shift) as i64) >> shift) as u64
            } else if from_bits < 64 {
                data & ((1u64 << from_bits) - 1)
            } else {
                data
            };
            self.released = true;
            return ValuePartRef {
                state: PartState::Imm {
                    bank,
                    size: (to_bits / 8) as u8,
                    data,
                },
                released: false,
            };
        }

        let src = self.load_to_reg(ctx);
        let mut out = if self.can_salvage(ctx) {
            self.salvage(ctx)
        } else {
            let mut s = ScratchReg::new();
            s.alloc(ctx, src.bank());
            s
        };
        let dst = out.cur_reg();
        <B::Mach as crate::isa::Machine>::ext(ctx.asm, dst, src, signed, from_bits, to_bits);
        self.release(ctx);
        ValuePartRef {
            state: PartState::Temp {
                scratch: out,
                size: (to_bits / 8) as u8,
            },
            released: false,
        }
    }

    /// Force the part into an owned register detached from the assignment.
    pub fn into_temporary<A: IrAdaptor, B: Backend<A>>(
        mut self,
        ctx: &mut CodeGen<'_, A, B>,
    ) -> ValuePartRef {
        let size = self.part_size(ctx) as u8;
        let reg = self.load_to_reg(ctx);
        if matches!(self.state, PartState::Temp { .. }) {
            return self;
        }
        let scratch = if self.can_salvage(ctx) {
            self.salvage(ctx)
        } else {
            let mut s = ScratchReg::new();
            let dst = s.alloc(ctx, reg.bank());
            <B::Mach as crate::isa::Machine>::mov(ctx.asm, dst, reg, size as u32);
            s
        };
        self.release(ctx);
        ValuePartRef {
            state: PartState::Temp { scratch, size },
            released: false,
        }
    }

    /// Bind the value of `scratch` as this part's new contents.
    pub fn set_value_from_scratch<A: IrAdaptor, B: Backend<A>>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        scratch: ScratchReg,
    ) {
        match &mut self.state {
            PartState::Part {
                local,
                part,
                locked,
            } => ctx.set_part_value(*local, *part, locked, scratch),
            _ => panic!("set_value on a non-assignment part"),
        }
    }

    /// Unlock the bound register. The reference count lives with the
    /// parent `ValueRef`.
    pub fn release<A: IrAdaptor, B: Backend<A>>(mut self, ctx: &mut CodeGen<'_, A, B>) {
        self.released = true;
        match &mut self.state {
            PartState::Part {
                local,
                part,
                locked,
            } => {
                if *locked {
                    let aref = ctx.assignments.of(*local).expect("released after free");
                    let desc = ctx.assignments.part(aref, *part);
                    debug_assert!(desc.register_valid());
                    ctx.unlock_reg(desc.reg());
                    *locked = false;
                }
            }
            PartState::Temp { scratch, .. } => {
                scratch.free_in_place(ctx);
            }
            _ => {}
        }
    }
}

impl Drop for ValuePartRef {
    fn drop(&mut self) {
        debug_assert!(self.released, "value part reference leaked without release");
    }
}

/// Ownership token for a temporarily-reserved register.
pub struct ScratchReg {
    reg: Option<Reg>,
}

impl ScratchReg {
    pub fn new() -> Self {
        ScratchReg { reg: None }
    }

    pub fn has_reg(&self) -> bool {
        self.reg.is_some()
    }

    pub fn cur_reg(&self) -> Reg {
        self.reg.expect("scratch register not allocated")
    }

    /// Allocate any register of `bank`, evicting if necessary.
    pub fn alloc<A: IrAdaptor, B: Backend<A>>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        bank: RegBank,
    ) -> Reg {
        self.alloc_excluding(ctx, bank, 0)
    }

    /// Allocate avoiding the registers in `exclude`.
    pub fn alloc_excluding<A: IrAdaptor, B: Backend<A>>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        bank: RegBank,
        exclude: crate::regfile::RegBitSet,
    ) -> Reg {
        if let Some(reg) = self.reg {
            debug_assert_eq!(reg.bank(), bank);
            return reg;
        }
        let reg = ctx.take_scratch_reg(bank, exclude);
        self.reg = Some(reg);
        reg
    }

    /// Demand a specific register, evicting its current occupant.
    pub fn alloc_specific<A: IrAdaptor, B: Backend<A>>(
        &mut self,
        ctx: &mut CodeGen<'_, A, B>,
        reg: Reg,
    ) {
        self.free_in_place(ctx);
        ctx.take_specific_scratch_reg(reg);
        self.reg = Some(reg);
    }

    /// Release the register back to the file.
    pub fn free<A: IrAdaptor, B: Backend<A>>(mut self, ctx: &mut CodeGen<'_, A, B>) {
        self.free_in_place(ctx);
    }

    pub(crate) fn free_in_place<A: IrAdaptor, B: Backend<A>>(&mut self, ctx: &mut CodeGen<'_, A, B>) {
        if let Some(reg) = self.reg.take() {
            ctx.regs.unmark_fixed(reg);
            ctx.regs.unmark_used(reg);
        }
    }

    /// Steal the register id, e.g. when an assignment takes ownership.
    pub(crate) fn forget(mut self) -> Reg {
        self.reg.take().expect("scratch register not allocated")
    }
}

impl Default for ScratchReg {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScratchReg {
    fn drop(&mut self) {
        debug_assert!(self.reg.is_none(), "scratch register leaked without free");
    }
}

/// The uniform operand shape the emit layer accepts.
pub enum GenValue {
    Empty,
    /// An owned register (salvageable).
    Owned(ScratchReg),
    /// A borrowed value part.
    Borrowed(ValuePartRef),
    /// An address expression, lowered on demand.
    Expr(AddrExpr),
}

/// `base + index * 2^scale + disp`.
pub struct AddrExpr {
    pub base: Option<GvReg>,
    pub index: Option<(GvReg, u8)>,
    pub disp: i64,
}

/// A register operand inside an [`AddrExpr`].
pub enum GvReg {
    /// A register the expression does not own.
    Fixed(Reg),
    /// An owned scratch, reusable as the result.
    Scratch(ScratchReg),
}

impl GvReg {
    pub fn reg(&self) -> Reg {
        match self {
            GvReg::Fixed(r) => *r,
            GvReg::Scratch(s) => s.cur_reg(),
        }
    }
}

impl GenValue {
    pub fn is_imm(&self) -> bool {
        matches!(self, GenValue::Borrowed(vp) if vp.is_const())
    }

    pub fn imm64(&self) -> u64 {
        match self {
            GenValue::Borrowed(vp) => vp.const_value(),
            _ => panic!("imm64 on a non-immediate"),
        }
    }
}
