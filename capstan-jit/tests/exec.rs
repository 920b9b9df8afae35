//! Execute jitted code on the host. These tests only run on x86-64: they
//! compile for the host architecture and call into the mapped code.

#![cfg(all(unix, target_arch = "x86_64"))]

use capstan::isa::x64::X64;
use capstan_jit::JitModule;
use capstan_tir::backend::compile_tir;
use capstan_tir::{Cond, Signature, TirModule, Type};

fn load(m: &TirModule) -> JitModule {
    let bytes = compile_tir::<X64>(m).expect("compiles");
    JitModule::load(&bytes, &|name| panic!("unresolved symbol {name}")).expect("loads")
}

fn sig(params: &[Type], ret: Option<Type>) -> Signature {
    Signature {
        params: params.to_vec(),
        ret,
        ..Default::default()
    }
}

#[test]
fn identity_returns_its_argument() {
    let mut m = TirModule::new();
    let (_f, mut b) = m.define("id", sig(&[Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    b.ret(Some(x));

    let jit = load(&m);
    let f: extern "C" fn(i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("id").unwrap()) };
    assert_eq!(f(42), 42);
    assert_eq!(f(-7), -7);
}

#[test]
fn arithmetic_chain() {
    let mut m = TirModule::new();
    let (_f, mut b) = m.define("calc", sig(&[Type::I64, Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    let y = b.arg(1);
    let s = b.iadd(x, y);
    let d = b.isub(s, y);
    let t = b.iadd(d, s); // x + (x + y)
    b.ret(Some(t));

    let jit = load(&m);
    let f: extern "C" fn(i64, i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("calc").unwrap()) };
    assert_eq!(f(10, 5), 25);
    assert_eq!(f(0, 0), 0);
    assert_eq!(f(-3, 3), -3);
}

#[test]
fn thirty_three_arguments() {
    let mut m = TirModule::new();
    let params = vec![Type::I64; 33];
    let (_f, mut b) = m.define("sum33", sig(&params, Some(Type::I64)));
    let mut acc = b.arg(0);
    for i in 1..33 {
        let a = b.arg(i);
        acc = b.iadd(acc, a);
    }
    b.ret(Some(acc));

    let jit = load(&m);
    type F = extern "C" fn(
        i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64,
        i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64,
    ) -> i64;
    let f: F = unsafe { core::mem::transmute(jit.symbol("sum33").unwrap()) };
    let r = f(
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32, 33,
    );
    assert_eq!(r, (1..=33).sum::<i64>());
}

#[test]
fn diamond_phi_selects_side() {
    let mut m = TirModule::new();
    let (_f, mut b) = m.define("diamond", sig(&[Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    let left = b.create_block();
    let right = b.create_block();
    let join = b.create_block();
    let phi = b.add_phi(join, Type::I64);

    let zero = b.iconst(Type::I64, 0);
    b.brif(Cond::Slt, x, zero, left, right);

    b.switch_to_block(left);
    let one = b.iconst(Type::I64, 1);
    let xp = b.iadd(x, one);
    b.set_phi_incoming(phi, left, xp);
    b.jump(join);

    b.switch_to_block(right);
    let one2 = b.iconst(Type::I64, 1);
    let xm = b.isub(x, one2);
    b.set_phi_incoming(phi, right, xm);
    b.jump(join);

    b.switch_to_block(join);
    b.ret(Some(phi));

    let jit = load(&m);
    let f: extern "C" fn(i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("diamond").unwrap()) };
    assert_eq!(f(-5), -4); // negative: x + 1
    assert_eq!(f(5), 4); // non-negative: x - 1
    assert_eq!(f(0), -1);
}

#[test]
fn loop_sums_iteration_counter() {
    // acc/i PHIs around a loop; returns sum 0..n.
    let mut m = TirModule::new();
    let (_f, mut b) = m.define("tri", sig(&[Type::I64], Some(Type::I64)));
    let n = b.arg(0);
    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();
    let acc = b.add_phi(header, Type::I64);
    let i = b.add_phi(header, Type::I64);

    let entry = b.entry_block();
    let zero = b.iconst(Type::I64, 0);
    let zero2 = b.iconst(Type::I64, 0);
    b.set_phi_incoming(acc, entry, zero);
    b.set_phi_incoming(i, entry, zero2);
    b.jump(header);

    b.switch_to_block(header);
    b.brif(Cond::Sge, i, n, exit, body);

    b.switch_to_block(body);
    let acc2 = b.iadd(acc, i);
    let one = b.iconst(Type::I64, 1);
    let i2 = b.iadd(i, one);
    b.set_phi_incoming(acc, body, acc2);
    b.set_phi_incoming(i, body, i2);
    b.jump(header);

    b.switch_to_block(exit);
    b.ret(Some(acc));

    let jit = load(&m);
    let f: extern "C" fn(i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("tri").unwrap()) };
    assert_eq!(f(0), 0);
    assert_eq!(f(1), 0);
    assert_eq!(f(5), 10);
    assert_eq!(f(100), 4950);
}

#[test]
fn phi_cycle_swaps_values() {
    let mut m = TirModule::new();
    let (_f, mut b) = m.define(
        "swap_loop",
        sig(&[Type::I64, Type::I64, Type::I64], Some(Type::I64)),
    );
    let a0 = b.arg(0);
    let b0 = b.arg(1);
    let n = b.arg(2);

    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();
    let pa = b.add_phi(header, Type::I64);
    let pb = b.add_phi(header, Type::I64);
    let pi = b.add_phi(header, Type::I64);

    let entry = b.entry_block();
    let zero = b.iconst(Type::I64, 0);
    b.set_phi_incoming(pa, entry, a0);
    b.set_phi_incoming(pb, entry, b0);
    b.set_phi_incoming(pi, entry, zero);
    b.jump(header);

    b.switch_to_block(header);
    b.brif(Cond::Sge, pi, n, exit, body);

    b.switch_to_block(body);
    let one = b.iconst(Type::I64, 1);
    let ni = b.iadd(pi, one);
    b.set_phi_incoming(pa, body, pb);
    b.set_phi_incoming(pb, body, pa);
    b.set_phi_incoming(pi, body, ni);
    b.jump(header);

    b.switch_to_block(exit);
    b.ret(Some(pa));

    let jit = load(&m);
    let f: extern "C" fn(i64, i64, i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("swap_loop").unwrap()) };
    assert_eq!(f(1, 2, 0), 1); // no iterations
    assert_eq!(f(1, 2, 1), 2); // one swap
    assert_eq!(f(1, 2, 2), 1);
    assert_eq!(f(1, 2, 3), 2);
}

#[test]
fn calls_within_module() {
    let mut m = TirModule::new();
    let (callee, mut b) = m.define("twice", sig(&[Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    let d = b.iadd(x, x);
    b.ret(Some(d));

    let (_f, mut b) = m.define("quad", sig(&[Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    let t = b.call(callee, Some(Type::I64), &[x]).unwrap();
    let q = b.call(callee, Some(Type::I64), &[t]).unwrap();
    b.ret(Some(q));

    let jit = load(&m);
    let f: extern "C" fn(i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("quad").unwrap()) };
    assert_eq!(f(3), 12);
}

extern "C" fn host_helper(x: i64) -> i64 {
    x * 10
}

#[test]
fn calls_resolve_external_symbols() {
    let mut m = TirModule::new();
    let ext = m.declare("host_helper", sig(&[Type::I64], Some(Type::I64)));
    let (_f, mut b) = m.define("caller", sig(&[Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    let r = b.call(ext, Some(Type::I64), &[x]).unwrap();
    let one = b.iconst(Type::I64, 1);
    let r1 = b.iadd(r, one);
    b.ret(Some(r1));

    let bytes = compile_tir::<X64>(&m).expect("compiles");
    let jit = JitModule::load(&bytes, &|name| {
        (name == "host_helper").then_some(host_helper as usize)
    })
    .expect("loads");
    let f: extern "C" fn(i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("caller").unwrap()) };
    assert_eq!(f(4), 41);
}

#[test]
fn alloca_load_store() {
    let mut m = TirModule::new();
    let (_f, mut b) = m.define("spill_mem", sig(&[Type::I64], Some(Type::I64)));
    let x = b.arg(0);
    let slot = b.alloca(16, 8);
    b.store(x, slot, 0);
    b.store(x, slot, 8);
    let lo = b.load(Type::I64, slot, 0);
    let hi = b.load(Type::I64, slot, 8);
    let s = b.iadd(lo, hi);
    b.ret(Some(s));

    let jit = load(&m);
    let f: extern "C" fn(i64) -> i64 =
        unsafe { core::mem::transmute(jit.symbol("spill_mem").unwrap()) };
    assert_eq!(f(21), 42);
}
