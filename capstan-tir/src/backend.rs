//! TIR lowering, generic over the target machine.
//!
//! Each opcode acquires operand handles, locks their registers, allocates
//! (or salvages) a destination and emits through the machine's surface.
//! Two-operand patterns reuse a dying left operand's register as the
//! destination; branches run the branch-spill protocol before transferring
//! control.

use crate::adaptor::TirAdaptor;
use crate::{BinOp, FuncRef, Inst, InstData, Type};
use capstan::adaptor::IrAdaptor;
use capstan::cc::{CcAssigner, CcAssignment};
use capstan::codegen::{Backend, CodeGen, PartSpec, PartsSpec};
use capstan::isa::{AluOp, Machine};
use capstan::value::{AddrExpr, GenValue, GvReg, ScratchReg, SpecialVal};
use capstan::{CallBuilder, CallTarget, SymBinding};
use smallvec::smallvec;

/// The lowering layer: TIR on any machine `M`.
pub struct TirBackend<M> {
    _m: core::marker::PhantomData<M>,
}

type Ctx<'a, 'm, M> = CodeGen<'a, TirAdaptor<'m>, TirBackend<M>>;

fn parts_of<M: Machine>(ty: Type) -> PartsSpec {
    let bank = if ty.is_float() { M::FP_BANK } else { M::GP_BANK };
    match ty.part_count() {
        1 => smallvec![PartSpec {
            bank,
            size: ty.part_size(),
        }],
        _ => smallvec![
            PartSpec { bank, size: 8 },
            PartSpec { bank, size: 8 }
        ],
    }
}

impl<'m, M: Machine> Backend<TirAdaptor<'m>> for TirBackend<M> {
    type Mach = M;

    fn val_parts(adaptor: &TirAdaptor<'m>, value: crate::Value) -> PartsSpec {
        parts_of::<M>(adaptor.cur_func().ty_of(value))
    }

    fn val_special(adaptor: &TirAdaptor<'m>, value: crate::Value) -> Option<SpecialVal> {
        adaptor.is_iconst(value).map(|(ty, imm)| SpecialVal::Imm {
            bank: M::GP_BANK,
            size: ty.part_size(),
            data: imm,
        })
    }

    fn cur_personality(ctx: &mut Ctx<'_, 'm, M>) -> Option<capstan::SymRef> {
        if !ctx.adaptor.cur_func().has_invoke {
            return None;
        }
        if let Some(sym) = ctx.adaptor.personality_sym {
            return Some(sym);
        }
        let sym = ctx.asm.sym_add_undef("__gxx_personality_v0", SymBinding::Global);
        ctx.adaptor.personality_sym = Some(sym);
        Some(sym)
    }

    fn compile_inst(ctx: &mut Ctx<'_, 'm, M>, inst: Inst) -> bool {
        let data = ctx.adaptor.cur_func().insts[inst].clone();
        let result = ctx.adaptor.cur_func().inst_results[inst];
        match data {
            InstData::Iconst { .. } => unreachable!("constants are fused"),
            InstData::Binary { op, lhs, rhs } => lower_binary(ctx, inst, op, lhs, rhs),
            InstData::Icmp { cond, lhs, rhs } => lower_icmp(ctx, inst, cond, lhs, rhs),
            InstData::Extend { from, signed, to } => lower_extend(ctx, inst, from, signed, to),
            InstData::Load { ty, ptr, off } => lower_load(ctx, inst, ty, ptr, off),
            InstData::Store { val, ptr, off } => lower_store(ctx, val, ptr, off),
            InstData::Lea {
                base,
                index,
                scale,
                disp,
            } => lower_lea(ctx, inst, base, index, scale, disp),
            InstData::Alloca { .. } => {
                // The address was materialized as a variable reference at
                // function entry; consume the definition reference.
                let v = result.unwrap();
                let local = ctx.adaptor.val_local_idx(v);
                if ctx.assignments.of(local).is_some() {
                    ctx.val_ref(v).release(ctx);
                }
                true
            }
            InstData::FuncAddr { func } => {
                let sym = ctx.func_syms[cranelift_entity_index(func)];
                let (vr, mut vp) = ctx.result_ref_single(result.unwrap());
                let dst = vp.alloc_reg(ctx);
                M::load_sym_addr(ctx.asm, dst, sym);
                vp.release(ctx);
                vr.release(ctx);
                true
            }
            InstData::Call { callee, args } => {
                lower_call(ctx, result, CalleeKind::Direct(callee), &args)
            }
            InstData::CallInd { ptr, args, sig } => {
                lower_call(ctx, result, CalleeKind::Indirect(ptr, sig.vararg), &args)
            }
            InstData::Invoke {
                callee,
                args,
                normal,
                lpad,
            } => lower_invoke(ctx, result, callee, &args, normal, lpad),
            InstData::LandingPad => {
                // Cleanup-only pad: nothing to materialize.
                true
            }
            InstData::Jump { dest } => {
                let target = ctx.analyzer.block_idx(dest);
                let released = ctx.spill_before_branch();
                ctx.generate_branch(None, target);
                ctx.release_spilled_regs(released);
                true
            }
            InstData::Brif {
                cond,
                lhs,
                rhs,
                then_dest,
                else_dest,
            } => lower_brif(ctx, cond, lhs, rhs, then_dest, else_dest),
            InstData::Ret { val } => lower_ret(ctx, val),
        }
    }
}

fn cranelift_entity_index(f: FuncRef) -> usize {
    use cranelift_entity::EntityRef;
    f.index()
}

fn ty_of<'m, M: Machine>(ctx: &Ctx<'_, 'm, M>, v: crate::Value) -> Type {
    ctx.adaptor.cur_func().ty_of(v)
}

fn lower_binary<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    inst: Inst,
    op: BinOp,
    lhs: crate::Value,
    rhs: crate::Value,
) -> bool {
    let ty = ty_of(ctx, lhs);
    if ty.part_count() != 1 || ty.is_float() {
        ctx.set_unsupported("arithmetic on wide or float values");
        return false;
    }
    let size = ty.part_size() as u32;
    let alu = match op {
        BinOp::Add => AluOp::Add,
        BinOp::Sub => AluOp::Sub,
        BinOp::And => AluOp::And,
        BinOp::Or => AluOp::Or,
        BinOp::Xor => AluOp::Xor,
    };

    let res = ctx.adaptor.cur_func().inst_results[inst].unwrap();
    let (lhs_vr, mut lhs_vp) = ctx.val_ref_single(lhs);
    let (rhs_vr, mut rhs_vp) = ctx.val_ref_single(rhs);
    let lhs_reg = lhs_vp.load_to_reg(ctx);
    let rhs_reg = rhs_vp.load_to_reg(ctx);

    let (res_vr, mut res_vp) = ctx.result_ref_single(res);
    if lhs_vp.can_salvage(ctx) {
        let s = lhs_vp.salvage(ctx);
        M::alu_rr(ctx.asm, alu, s.cur_reg(), rhs_reg, size);
        res_vp.set_value_from_scratch(ctx, s);
    } else {
        let dst = res_vp.alloc_reg(ctx);
        if dst != lhs_reg {
            M::mov(ctx.asm, dst, lhs_reg, size);
        }
        M::alu_rr(ctx.asm, alu, dst, rhs_reg, size);
    }

    lhs_vp.release(ctx);
    rhs_vp.release(ctx);
    res_vp.release(ctx);
    lhs_vr.release(ctx);
    rhs_vr.release(ctx);
    res_vr.release(ctx);
    true
}

fn is_signed_cond(cond: capstan::Cond) -> bool {
    use capstan::Cond::*;
    matches!(cond, Slt | Sle | Sgt | Sge)
}

/// Widen a sub-dword operand so register compares see the right value;
/// the widening direction follows the condition's signedness.
fn widened_cmp_operand<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    vp: capstan::ValuePartRef,
    ty: Type,
    cond: capstan::Cond,
) -> capstan::ValuePartRef {
    if ty.bits() >= 32 {
        return vp;
    }
    vp.into_extended(ctx, is_signed_cond(cond), ty.bits(), 32)
}

fn lower_icmp<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    inst: Inst,
    cond: capstan::Cond,
    lhs: crate::Value,
    rhs: crate::Value,
) -> bool {
    let ty = ty_of(ctx, lhs);
    if ty.part_count() != 1 || ty.is_float() {
        ctx.set_unsupported("comparison on wide or float values");
        return false;
    }
    let size = (ty.part_size() as u32).max(4);
    let res = ctx.adaptor.cur_func().inst_results[inst].unwrap();

    let (lhs_vr, lhs_vp) = ctx.val_ref_single(lhs);
    let (rhs_vr, rhs_vp) = ctx.val_ref_single(rhs);
    let mut lhs_vp = widened_cmp_operand(ctx, lhs_vp, ty, cond);
    let mut rhs_vp = widened_cmp_operand(ctx, rhs_vp, ty, cond);
    let lhs_reg = lhs_vp.load_to_reg(ctx);
    let rhs_reg = rhs_vp.load_to_reg(ctx);
    M::cmp_rr(ctx.asm, lhs_reg, rhs_reg, size);
    lhs_vp.release(ctx);
    rhs_vp.release(ctx);
    lhs_vr.release(ctx);
    rhs_vr.release(ctx);

    let (res_vr, mut res_vp) = ctx.result_ref_single(res);
    let dst = res_vp.alloc_reg(ctx);
    M::setcc(ctx.asm, cond, dst);
    res_vp.release(ctx);
    res_vr.release(ctx);
    true
}

fn lower_extend<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    inst: Inst,
    from: crate::Value,
    signed: bool,
    to: Type,
) -> bool {
    let from_ty = ty_of(ctx, from);
    if to.part_count() != 1 || from_ty.is_float() {
        ctx.set_unsupported("extension to wide values");
        return false;
    }
    let res = ctx.adaptor.cur_func().inst_results[inst].unwrap();
    let (vr, vp) = ctx.val_ref_single(from);
    let mut ext = vp.into_extended(ctx, signed, from_ty.bits(), to.bits());
    let (res_vr, mut res_vp) = ctx.result_ref_single(res);
    if ext.is_const() {
        // The extension folded into the constant.
        let dst = res_vp.alloc_reg(ctx);
        M::materialize_const(ctx.asm, dst, ext.const_value(), to.part_size() as u32);
        ext.release(ctx);
    } else {
        let s = ext.salvage(ctx);
        ext.release(ctx);
        res_vp.set_value_from_scratch(ctx, s);
    }
    vr.release(ctx);
    res_vp.release(ctx);
    res_vr.release(ctx);
    true
}

fn lower_load<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    inst: Inst,
    ty: Type,
    ptr: crate::Value,
    off: i32,
) -> bool {
    let res = ctx.adaptor.cur_func().inst_results[inst].unwrap();
    let (ptr_vr, mut ptr_vp) = ctx.val_ref_single(ptr);
    let base = ptr_vp.load_to_reg(ctx);

    let res_vr = ctx.result_ref(res);
    for i in 0..ty.part_count() {
        let mut vp = res_vr.part(i);
        let dst = vp.alloc_reg(ctx);
        M::load_mem(ctx.asm, dst, base, off + 8 * i as i32, ty.part_size() as u32);
        vp.release(ctx);
    }

    ptr_vp.release(ctx);
    ptr_vr.release(ctx);
    res_vr.release(ctx);
    true
}

fn lower_store<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    val: crate::Value,
    ptr: crate::Value,
    off: i32,
) -> bool {
    let ty = ty_of(ctx, val);
    let val_vr = ctx.val_ref(val);
    let (ptr_vr, mut ptr_vp) = ctx.val_ref_single(ptr);
    let base = ptr_vp.load_to_reg(ctx);

    for i in 0..ty.part_count() {
        let mut vp = val_vr.part(i);
        let src = vp.load_to_reg(ctx);
        M::store_mem(ctx.asm, src, base, off + 8 * i as i32, ty.part_size() as u32);
        vp.release(ctx);
    }

    ptr_vp.release(ctx);
    ptr_vr.release(ctx);
    val_vr.release(ctx);
    true
}

fn lower_lea<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    inst: Inst,
    base: crate::Value,
    index: Option<crate::Value>,
    scale: u8,
    disp: i64,
) -> bool {
    let res = ctx.adaptor.cur_func().inst_results[inst].unwrap();
    let (base_vr, mut base_vp) = ctx.val_ref_single(base);
    let base_reg = base_vp.load_to_reg(ctx);

    let index_handles = index.map(|iv| {
        let (vr, mut vp) = ctx.val_ref_single(iv);
        let reg = vp.load_to_reg(ctx);
        (vr, vp, reg)
    });

    let mut gv = GenValue::Expr(AddrExpr {
        base: Some(GvReg::Fixed(base_reg)),
        index: index_handles.as_ref().map(|(_, _, r)| (GvReg::Fixed(*r), scale)),
        disp,
    });

    let mut dst = ScratchReg::new();
    let reg = ctx.gval_as_reg_reuse(&mut gv, &mut dst);
    if !dst.has_reg() {
        // The expression collapsed to a borrowed register; copy it.
        let d = dst.alloc(ctx, M::GP_BANK);
        M::mov(ctx.asm, d, reg, 8);
    }
    ctx.gval_release(gv);

    base_vp.release(ctx);
    base_vr.release(ctx);
    if let Some((vr, vp, _)) = index_handles {
        vp.release(ctx);
        vr.release(ctx);
    }

    let (res_vr, mut res_vp) = ctx.result_ref_single(res);
    res_vp.set_value_from_scratch(ctx, dst);
    res_vp.release(ctx);
    res_vr.release(ctx);
    true
}

enum CalleeKind {
    Direct(FuncRef),
    Indirect(crate::Value, bool),
}

fn lower_call<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    result: Option<crate::Value>,
    callee: CalleeKind,
    args: &[crate::Value],
) -> bool {
    let vararg = match &callee {
        CalleeKind::Direct(f) => ctx.adaptor.module.funcs[*f].sig.vararg,
        CalleeKind::Indirect(_, vararg) => *vararg,
    };
    let mut cb = CallBuilder::<M>::new(vararg);

    for &arg in args {
        let ty = ty_of(ctx, arg);
        let vr = ctx.val_ref(arg);
        let parts = ty.part_count();
        for i in 0..parts {
            let vp = vr.part(i);
            let mut cca = CcAssignment::default();
            if i == 0 {
                cca.consecutive = parts - 1;
            }
            cb.add_arg(ctx, vp, cca);
        }
        vr.release(ctx);
    }

    let (target, ptr_vr) = match callee {
        CalleeKind::Direct(f) => (
            CallTarget::Sym(ctx.func_syms[cranelift_entity_index(f)]),
            None,
        ),
        CalleeKind::Indirect(ptr, _) => {
            let (vr, vp) = ctx.val_ref_single(ptr);
            (CallTarget::Indirect(vp), Some(vr))
        }
    };

    match result {
        Some(res) => {
            let res_vr = ctx.result_ref(res);
            cb.call(ctx, target, Some(&res_vr));
            res_vr.release(ctx);
        }
        None => cb.call(ctx, target, None),
    }
    if let Some(vr) = ptr_vr {
        vr.release(ctx);
    }
    true
}

fn lower_invoke<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    result: Option<crate::Value>,
    callee: FuncRef,
    args: &[crate::Value],
    normal: crate::Block,
    lpad: crate::Block,
) -> bool {
    let off_before = ctx.asm.text_off();
    if !lower_call(ctx, result, CalleeKind::Direct(callee), args) {
        return false;
    }
    let off_after = ctx.asm.text_off();

    let lpad_idx = ctx.analyzer.block_idx(lpad);
    let lpad_label = ctx.block_label(lpad_idx);
    ctx.asm
        .except_add_call_site(off_before, off_after - off_before, lpad_label, true);

    let normal_idx = ctx.analyzer.block_idx(normal);
    let released = ctx.spill_before_branch();
    ctx.generate_branch(None, normal_idx);
    ctx.release_spilled_regs(released);
    true
}

fn lower_brif<'m, M: Machine>(
    ctx: &mut Ctx<'_, 'm, M>,
    cond: capstan::Cond,
    lhs: crate::Value,
    rhs: crate::Value,
    then_dest: crate::Block,
    else_dest: crate::Block,
) -> bool {
    let ty = ty_of(ctx, lhs);
    if ty.part_count() != 1 || ty.is_float() {
        ctx.set_unsupported("comparison on wide or float values");
        return false;
    }
    let size = (ty.part_size() as u32).max(4);

    let (lhs_vr, lhs_vp) = ctx.val_ref_single(lhs);
    let (rhs_vr, rhs_vp) = ctx.val_ref_single(rhs);
    let mut lhs_vp = widened_cmp_operand(ctx, lhs_vp, ty, cond);
    let mut rhs_vp = widened_cmp_operand(ctx, rhs_vp, ty, cond);
    let lhs_reg = lhs_vp.load_to_reg(ctx);
    let rhs_reg = rhs_vp.load_to_reg(ctx);
    M::cmp_rr(ctx.asm, lhs_reg, rhs_reg, size);
    lhs_vp.release(ctx);
    rhs_vp.release(ctx);
    lhs_vr.release(ctx);
    rhs_vr.release(ctx);

    let then_idx = ctx.analyzer.block_idx(then_dest);
    let else_idx = ctx.analyzer.block_idx(else_dest);
    // Spills and PHI moves only emit loads, stores and register moves,
    // none of which disturb the condition flags on either target.
    let released = ctx.spill_before_branch();
    ctx.generate_branch(Some(cond), then_idx);
    ctx.generate_branch(None, else_idx);
    ctx.release_spilled_regs(released);
    true
}

fn lower_ret<'m, M: Machine>(ctx: &mut Ctx<'_, 'm, M>, val: Option<crate::Value>) -> bool {
    let sig_ret_ext = ctx.adaptor.cur_func().sig.ret_ext;
    if let Some(v) = val {
        let ty = ty_of(ctx, v);
        let mut cc = M::new_cc(false);
        let vr = ctx.val_ref(v);
        let mut scratches: smallvec::SmallVec<[ScratchReg; 2]> = smallvec::SmallVec::new();
        for i in 0..ty.part_count() {
            let mut vp = vr.part(i);
            let mut cca = CcAssignment::part(
                if ty.is_float() { M::FP_BANK } else { M::GP_BANK },
                ty.part_size() as u32,
            );
            cc.assign_ret(&mut cca);
            let reg = cca.reg.expect("return part without register");
            let mut s = ScratchReg::new();
            s.alloc_specific(ctx, reg);
            vp.reload_into_specific_fixed(ctx, reg);
            match sig_ret_ext {
                crate::RetExt::None => {}
                crate::RetExt::Sext => M::ext(ctx.asm, reg, reg, true, ty.bits(), 64),
                crate::RetExt::Zext => M::ext(ctx.asm, reg, reg, false, ty.bits(), 64),
            }
            vp.release(ctx);
            scratches.push(s);
        }
        vr.release(ctx);
        for s in scratches {
            s.free(ctx);
        }
    }

    M::emit_epilogue_placeholder(ctx.asm, &mut ctx.mach);
    ctx.release_regs_after_return();
    true
}

/// Compile `module` into a relocatable object for machine `M`.
pub fn compile_tir<M: Machine>(module: &crate::TirModule) -> capstan::CodegenResult<Vec<u8>> {
    let mut adaptor = TirAdaptor::new(module);
    let config = capstan::ModuleConfig::for_machine::<M>();
    capstan::module::compile_object::<_, TirBackend<M>>(&mut adaptor, &config)
}

/// Compile `module`, returning the populated assembler plus the list of
/// skipped functions (for JIT mapping or inspection).
pub fn compile_tir_module<M: Machine>(
    module: &crate::TirModule,
) -> capstan::CodegenResult<capstan::CompiledModule> {
    let mut adaptor = TirAdaptor::new(module);
    let config = capstan::ModuleConfig::for_machine::<M>();
    capstan::module::compile_module::<_, TirBackend<M>>(&mut adaptor, &config)
}
