//! Property tests: random small functions driven through both targets.
//!
//! The interesting assertions run inside the compiler in debug builds:
//! the register/assignment round trip after every instruction, the
//! block-entry spill discipline at merge points, and the
//! every-reference-consumed check at the end of each function. These tests
//! generate the inputs that exercise them.

use capstan::isa::aarch64::Aarch64;
use capstan::isa::x64::X64;
use capstan_tir::backend::compile_tir;
use capstan_tir::{BinOp, Cond, Signature, TirModule, Type};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Const(u64),
    Bin(u8, u8, u8),
    Cmp(u8, u8, u8),
    Ext(u8, bool),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u64>().prop_map(Op::Const),
        (0u8..5, any::<u8>(), any::<u8>()).prop_map(|(o, a, b)| Op::Bin(o, a, b)),
        (0u8..10, any::<u8>(), any::<u8>()).prop_map(|(c, a, b)| Op::Cmp(c, a, b)),
        (any::<u8>(), any::<bool>()).prop_map(|(a, s)| Op::Ext(a, s)),
    ]
}

fn binop_of(i: u8) -> BinOp {
    match i % 5 {
        0 => BinOp::Add,
        1 => BinOp::Sub,
        2 => BinOp::And,
        3 => BinOp::Or,
        _ => BinOp::Xor,
    }
}

fn cond_of(i: u8) -> Cond {
    match i % 10 {
        0 => Cond::Eq,
        1 => Cond::Ne,
        2 => Cond::Slt,
        3 => Cond::Sle,
        4 => Cond::Sgt,
        5 => Cond::Sge,
        6 => Cond::Ult,
        7 => Cond::Ule,
        8 => Cond::Ugt,
        _ => Cond::Uge,
    }
}

/// Append `ops` to the builder, tracking produced values. Selector bytes
/// index into the pool of available i64 values.
fn emit_ops(
    b: &mut capstan_tir::FunctionBuilder<'_>,
    pool: &mut Vec<capstan_tir::Value>,
    ops: &[Op],
) {
    for op in ops {
        match *op {
            Op::Const(imm) => pool.push(b.iconst(Type::I64, imm)),
            Op::Bin(o, l, r) => {
                let lhs = pool[l as usize % pool.len()];
                let rhs = pool[r as usize % pool.len()];
                pool.push(b.binary(binop_of(o), lhs, rhs));
            }
            Op::Cmp(c, l, r) => {
                let lhs = pool[l as usize % pool.len()];
                let rhs = pool[r as usize % pool.len()];
                let flag = b.icmp(cond_of(c), lhs, rhs);
                pool.push(b.extend(flag, false, Type::I64));
            }
            Op::Ext(a, signed) => {
                let v = pool[a as usize % pool.len()];
                pool.push(b.extend(v, signed, Type::I64));
            }
        }
    }
}

fn straight_line_module(ops: &[Op], nargs: usize) -> TirModule {
    let mut m = TirModule::new();
    let sig = Signature {
        params: vec![Type::I64; nargs],
        ret: Some(Type::I64),
        ..Default::default()
    };
    let (_f, mut b) = m.define("f", sig);
    let mut pool: Vec<_> = (0..nargs).map(|i| b.arg(i)).collect();
    if pool.is_empty() {
        pool.push(b.iconst(Type::I64, 7));
    }
    emit_ops(&mut b, &mut pool, ops);
    let ret = *pool.last().unwrap();
    b.ret(Some(ret));
    m
}

fn diamond_module(ops_l: &[Op], ops_r: &[Op], nargs: usize) -> TirModule {
    let mut m = TirModule::new();
    let sig = Signature {
        params: vec![Type::I64; nargs.max(1)],
        ret: Some(Type::I64),
        ..Default::default()
    };
    let (_f, mut b) = m.define("f", sig);
    let mut pool: Vec<_> = (0..nargs.max(1)).map(|i| b.arg(i)).collect();

    let left = b.create_block();
    let right = b.create_block();
    let join = b.create_block();
    let phi = b.add_phi(join, Type::I64);

    let zero = b.iconst(Type::I64, 0);
    b.brif(Cond::Slt, pool[0], zero, left, right);

    b.switch_to_block(left);
    let mut lpool = pool.clone();
    emit_ops(&mut b, &mut lpool, ops_l);
    b.set_phi_incoming(phi, left, *lpool.last().unwrap());
    b.jump(join);

    b.switch_to_block(right);
    let mut rpool = pool.clone();
    emit_ops(&mut b, &mut rpool, ops_r);
    b.set_phi_incoming(phi, right, *rpool.last().unwrap());
    b.jump(join);

    b.switch_to_block(join);
    pool.push(phi);
    let ret = *pool.last().unwrap();
    b.ret(Some(ret));
    m
}

fn loop_module(ops: &[Op], nargs: usize) -> TirModule {
    let mut m = TirModule::new();
    let sig = Signature {
        params: vec![Type::I64; nargs.max(1)],
        ret: Some(Type::I64),
        ..Default::default()
    };
    let (_f, mut b) = m.define("f", sig);
    let pool0: Vec<_> = (0..nargs.max(1)).map(|i| b.arg(i)).collect();

    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();
    let acc = b.add_phi(header, Type::I64);
    let i = b.add_phi(header, Type::I64);

    let entry = b.entry_block();
    let zero = b.iconst(Type::I64, 0);
    b.set_phi_incoming(acc, entry, pool0[0]);
    b.set_phi_incoming(i, entry, zero);
    b.jump(header);

    b.switch_to_block(header);
    let limit = b.iconst(Type::I64, 4);
    b.brif(Cond::Sge, i, limit, exit, body);

    b.switch_to_block(body);
    let mut pool = pool0.clone();
    pool.push(acc);
    pool.push(i);
    emit_ops(&mut b, &mut pool, ops);
    let next_acc = *pool.last().unwrap();
    let one = b.iconst(Type::I64, 1);
    let next_i = b.iadd(i, one);
    b.set_phi_incoming(acc, body, next_acc);
    b.set_phi_incoming(i, body, next_i);
    b.jump(header);

    b.switch_to_block(exit);
    b.ret(Some(acc));
    m
}

fn compiles_on_both(m: &TirModule) {
    let x = compile_tir::<X64>(m).expect("x64 compiles");
    object::File::parse(&*x).expect("valid x64 ELF");
    let a = compile_tir::<Aarch64>(m).expect("aarch64 compiles");
    object::File::parse(&*a).expect("valid aarch64 ELF");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn straight_line_functions_compile(
        ops in prop::collection::vec(op_strategy(), 1..40),
        nargs in 0usize..8,
    ) {
        compiles_on_both(&straight_line_module(&ops, nargs));
    }

    #[test]
    fn diamonds_compile(
        ops_l in prop::collection::vec(op_strategy(), 1..16),
        ops_r in prop::collection::vec(op_strategy(), 1..16),
        nargs in 1usize..6,
    ) {
        compiles_on_both(&diamond_module(&ops_l, &ops_r, nargs));
    }

    #[test]
    fn loops_compile(
        ops in prop::collection::vec(op_strategy(), 1..16),
        nargs in 1usize..6,
    ) {
        compiles_on_both(&loop_module(&ops, nargs));
    }
}

#[test]
fn deep_register_pressure() {
    // Sum a long chain while keeping many values alive: every pool entry
    // is used again at the end, forcing spills of everything.
    let mut m = TirModule::new();
    let sig = Signature {
        params: vec![Type::I64; 4],
        ret: Some(Type::I64),
        ..Default::default()
    };
    let (_f, mut b) = m.define("pressure", sig);
    let mut vals: Vec<_> = (0..4).map(|i| b.arg(i)).collect();
    for i in 0..24 {
        let lhs = vals[i % vals.len()];
        let rhs = vals[(i * 7 + 1) % vals.len()];
        vals.push(b.iadd(lhs, rhs));
    }
    // Consume everything once more.
    let mut acc = vals[0];
    for &v in &vals[1..] {
        acc = b.binary(BinOp::Xor, acc, v);
    }
    b.ret(Some(acc));
    compiles_on_both(&m);
}
