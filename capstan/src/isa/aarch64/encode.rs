//! Minimal AArch64 instruction encoder.
//!
//! Fixed 32-bit words, little-endian. GP registers encode their
//! architectural number (x0..x30, 31 = sp/zr depending on context); SIMD
//! registers encode their in-bank index.

use crate::asm::Assembler;
use crate::regfile::Reg;

pub const FP: u8 = 29;
pub const LR: u8 = 30;
pub const SP: u8 = 31;
pub const ZR: u8 = 31;
/// Intra-procedure scratch, kept out of the allocatable set.
pub const IP0: u8 = 16;

pub fn hw(reg: Reg) -> u8 {
    reg.bank_idx()
}

pub fn put(asm: &mut Assembler, word: u32) {
    asm.put(&word.to_le_bytes());
}

pub const NOP: u32 = 0xd503_201f;

pub fn nop(asm: &mut Assembler) {
    put(asm, NOP);
}

// Loads and stores.

/// `stp x1, x2, [xn, #off]!` (pre-index).
pub fn stp_pre(asm: &mut Assembler, rt: u8, rt2: u8, rn: u8, off: i32) {
    debug_assert_eq!(off % 8, 0);
    let imm7 = ((off / 8) as u32) & 0x7f;
    put(
        asm,
        0xa980_0000 | imm7 << 15 | (rt2 as u32) << 10 | (rn as u32) << 5 | rt as u32,
    );
}

/// `ldp x1, x2, [xn], #off` (post-index).
pub fn ldp_post(asm: &mut Assembler, rt: u8, rt2: u8, rn: u8, off: i32) {
    debug_assert_eq!(off % 8, 0);
    let imm7 = ((off / 8) as u32) & 0x7f;
    put(
        asm,
        0xa8c0_0000 | imm7 << 15 | (rt2 as u32) << 10 | (rn as u32) << 5 | rt as u32,
    );
}

/// `stp x1, x2, [xn, #off]` (signed offset). Returns the word for patching.
pub fn stp_word(rt: u8, rt2: u8, rn: u8, off: i32) -> u32 {
    debug_assert_eq!(off % 8, 0);
    let imm7 = ((off / 8) as u32) & 0x7f;
    0xa900_0000 | imm7 << 15 | (rt2 as u32) << 10 | (rn as u32) << 5 | rt as u32
}

pub fn stp(asm: &mut Assembler, rt: u8, rt2: u8, rn: u8, off: i32) {
    let w = stp_word(rt, rt2, rn, off);
    put(asm, w);
}

pub fn ldp_word(rt: u8, rt2: u8, rn: u8, off: i32) -> u32 {
    debug_assert_eq!(off % 8, 0);
    let imm7 = ((off / 8) as u32) & 0x7f;
    0xa940_0000 | imm7 << 15 | (rt2 as u32) << 10 | (rn as u32) << 5 | rt as u32
}

/// `stp q1, q2, [xn, #off]` (signed offset, 16-byte scaled).
pub fn stp_q(asm: &mut Assembler, rt: u8, rt2: u8, rn: u8, off: i32) {
    debug_assert_eq!(off % 16, 0);
    let imm7 = ((off / 16) as u32) & 0x7f;
    put(
        asm,
        0xad00_0000 | imm7 << 15 | (rt2 as u32) << 10 | (rn as u32) << 5 | rt as u32,
    );
}

/// GP load/store with unscaled 9-bit signed offset (LDUR/STUR family).
fn gp_unscaled(load: bool, rt: u8, rn: u8, off: i32, size: u32) -> u32 {
    debug_assert!((-256..256).contains(&off));
    let base: u32 = match (size, load) {
        (1, false) => 0x3800_0000,
        (1, true) => 0x3840_0000,
        (2, false) => 0x7800_0000,
        (2, true) => 0x7840_0000,
        (4, false) => 0xb800_0000,
        (4, true) => 0xb840_0000,
        (_, false) => 0xf800_0000,
        (_, true) => 0xf840_0000,
    };
    base | ((off as u32) & 0x1ff) << 12 | (rn as u32) << 5 | rt as u32
}

/// FP/SIMD load/store with unscaled offset.
fn fp_unscaled(load: bool, rt: u8, rn: u8, off: i32, size: u32) -> u32 {
    debug_assert!((-256..256).contains(&off));
    let base: u32 = match (size, load) {
        (4, false) => 0xbc00_0000,
        (4, true) => 0xbc40_0000,
        (8, false) => 0xfc00_0000,
        (8, true) => 0xfc40_0000,
        (16, false) => 0x3c80_0000,
        (16, true) => 0x3cc0_0000,
        _ => unreachable!("unsupported FP access size {size}"),
    };
    base | ((off as u32) & 0x1ff) << 12 | (rn as u32) << 5 | rt as u32
}

/// GP load/store with scaled unsigned 12-bit offset.
fn gp_scaled(load: bool, rt: u8, rn: u8, off: u32, size: u32) -> u32 {
    debug_assert_eq!(off % size, 0);
    let imm12 = off / size;
    debug_assert!(imm12 < 4096);
    let base: u32 = match (size, load) {
        (1, false) => 0x3900_0000,
        (1, true) => 0x3940_0000,
        (2, false) => 0x7900_0000,
        (2, true) => 0x7940_0000,
        (4, false) => 0xb900_0000,
        (4, true) => 0xb940_0000,
        (_, false) => 0xf900_0000,
        (_, true) => 0xf940_0000,
    };
    base | imm12 << 10 | (rn as u32) << 5 | rt as u32
}

fn fp_scaled(load: bool, rt: u8, rn: u8, off: u32, size: u32) -> u32 {
    debug_assert_eq!(off % size, 0);
    let imm12 = off / size;
    debug_assert!(imm12 < 4096);
    let base: u32 = match (size, load) {
        (4, false) => 0xbd00_0000,
        (4, true) => 0xbd40_0000,
        (8, false) => 0xfd00_0000,
        (8, true) => 0xfd40_0000,
        (16, false) => 0x3d80_0000,
        (16, true) => 0x3dc0_0000,
        _ => unreachable!("unsupported FP access size {size}"),
    };
    base | imm12 << 10 | (rn as u32) << 5 | rt as u32
}

/// Load or store `rt` (GP when `gp`, else SIMD) at `[rn + off]`, going
/// through IP0 when the offset fits no addressing mode.
pub fn mem_access(
    asm: &mut Assembler,
    gp: bool,
    load: bool,
    rt: u8,
    rn: u8,
    off: i32,
    size: u32,
) {
    let scaled_ok = off >= 0 && off % size as i32 == 0 && (off as u32 / size) < 4096;
    let word = if scaled_ok {
        if gp {
            gp_scaled(load, rt, rn, off as u32, size)
        } else {
            fp_scaled(load, rt, rn, off as u32, size)
        }
    } else if (-256..256).contains(&off) {
        if gp {
            gp_unscaled(load, rt, rn, off, size)
        } else {
            fp_unscaled(load, rt, rn, off, size)
        }
    } else {
        add_sub_imm(asm, IP0, rn, off as i64);
        if gp {
            gp_scaled(load, rt, IP0, 0, size)
        } else {
            fp_scaled(load, rt, IP0, 0, size)
        }
    };
    put(asm, word);
}

// Arithmetic.

/// `add/sub dst, src, #imm`, splitting into two instructions when the
/// immediate does not fit twelve bits. `dst`/`src` may be sp.
pub fn add_sub_imm(asm: &mut Assembler, dst: u8, src: u8, imm: i64) {
    let (op, abs) = if imm >= 0 {
        (0x9100_0000u32, imm as u64)
    } else {
        (0xd100_0000u32, (-imm) as u64)
    };
    debug_assert!(abs < 1 << 24, "immediate exceeds 24 bits");
    let lo = (abs & 0xfff) as u32;
    let hi = ((abs >> 12) & 0xfff) as u32;
    let mut src = src as u32;
    if hi != 0 {
        put(asm, op | 1 << 22 | hi << 10 | src << 5 | dst as u32);
        src = dst as u32;
    }
    if lo != 0 || hi == 0 {
        put(asm, op | lo << 10 | src << 5 | dst as u32);
    }
}

/// `mov dst, src` for GP registers (`orr dst, xzr, src`); use
/// [`add_sub_imm`] for moves involving sp.
pub fn mov_gp(asm: &mut Assembler, dst: u8, src: u8, size: u32) {
    debug_assert!(dst != SP && src != SP);
    let base: u32 = if size == 8 { 0xaa00_03e0 } else { 0x2a00_03e0 };
    put(asm, base | (src as u32) << 16 | dst as u32);
}

/// Register move within the SIMD bank.
pub fn mov_fp(asm: &mut Assembler, dst: u8, src: u8, size: u32) {
    let word = match size {
        4 => 0x1e20_4000 | (src as u32) << 5 | dst as u32, // fmov s
        8 => 0x1e60_4000 | (src as u32) << 5 | dst as u32, // fmov d
        // orr vd.16b, vn.16b, vm.16b
        _ => 0x4ea0_1c00 | (src as u32) << 16 | (src as u32) << 5 | dst as u32,
    };
    put(asm, word);
}

/// Materialize a constant via `movz`/`movk` (and a `movn` shortcut for
/// small negative 64-bit values).
pub fn mov_imm(asm: &mut Assembler, dst: u8, value: u64, size: u32) {
    let value = if size >= 8 {
        value
    } else {
        value & ((1u64 << (size.min(4) * 8)) - 1)
    };
    let sf: u32 = if size == 8 { 1 << 31 } else { 0 };
    if size == 8 && !value < 0x1_0000 {
        // movn dst, #!value
        put(
            asm,
            0x9280_0000 | ((!value as u32) & 0xffff) << 5 | dst as u32,
        );
        return;
    }
    let mut first = true;
    for hw_idx in 0..(if size == 8 { 4u32 } else { 2 }) {
        let chunk = ((value >> (16 * hw_idx)) & 0xffff) as u32;
        if chunk == 0 {
            continue;
        }
        let op: u32 = if first { 0x5280_0000 } else { 0x7280_0000 };
        put(asm, sf | op | hw_idx << 21 | chunk << 5 | dst as u32);
        first = false;
    }
    if first {
        // value == 0
        put(asm, sf | 0x5280_0000 | dst as u32);
    }
}

const ALU_ADD: u32 = 0x0b00_0000;
const ALU_SUB: u32 = 0x4b00_0000;
const ALU_AND: u32 = 0x0a00_0000;
const ALU_ORR: u32 = 0x2a00_0000;
const ALU_EOR: u32 = 0x4a00_0000;

fn alu(asm: &mut Assembler, base: u32, dst: u8, lhs: u8, rhs: u8, size: u32) {
    let sf: u32 = if size == 8 { 1 << 31 } else { 0 };
    put(
        asm,
        sf | base | (rhs as u32) << 16 | (lhs as u32) << 5 | dst as u32,
    );
}

pub fn add_rr(asm: &mut Assembler, dst: u8, lhs: u8, rhs: u8, size: u32) {
    alu(asm, ALU_ADD, dst, lhs, rhs, size)
}

pub fn sub_rr(asm: &mut Assembler, dst: u8, lhs: u8, rhs: u8, size: u32) {
    alu(asm, ALU_SUB, dst, lhs, rhs, size)
}

pub fn and_rr(asm: &mut Assembler, dst: u8, lhs: u8, rhs: u8, size: u32) {
    alu(asm, ALU_AND, dst, lhs, rhs, size)
}

pub fn orr_rr(asm: &mut Assembler, dst: u8, lhs: u8, rhs: u8, size: u32) {
    alu(asm, ALU_ORR, dst, lhs, rhs, size)
}

pub fn eor_rr(asm: &mut Assembler, dst: u8, lhs: u8, rhs: u8, size: u32) {
    alu(asm, ALU_EOR, dst, lhs, rhs, size)
}

/// `cmp lhs, rhs` (`subs zr, lhs, rhs`).
pub fn cmp_rr(asm: &mut Assembler, lhs: u8, rhs: u8, size: u32) {
    let sf: u32 = if size == 8 { 1 << 31 } else { 0 };
    put(
        asm,
        sf | 0x6b00_001f | (rhs as u32) << 16 | (lhs as u32) << 5,
    );
}

/// `add dst, base, index, lsl #scale`.
pub fn add_shifted(asm: &mut Assembler, dst: u8, base: u8, index: u8, scale: u8) {
    put(
        asm,
        0x8b00_0000 | (index as u32) << 16 | (scale as u32) << 10 | (base as u32) << 5 | dst as u32,
    );
}

/// `cset dst, cond`.
pub fn cset(asm: &mut Assembler, dst: u8, cond: u8) {
    // csinc dst, xzr, xzr, !cond
    put(
        asm,
        0x9a9f_07e0 | ((cond ^ 1) as u32) << 12 | dst as u32,
    );
}

/// Sign/zero extension.
pub fn ext(asm: &mut Assembler, dst: u8, src: u8, signed: bool, from_bits: u32, to_bits: u32) {
    match (signed, from_bits) {
        (true, 8) => put(asm, 0x9340_1c00 | (src as u32) << 5 | dst as u32),
        (true, 16) => put(asm, 0x9340_3c00 | (src as u32) << 5 | dst as u32),
        (true, 32) => put(asm, 0x9340_7c00 | (src as u32) << 5 | dst as u32),
        (false, 8) => put(asm, 0x5300_1c00 | (src as u32) << 5 | dst as u32),
        (false, 16) => put(asm, 0x5300_3c00 | (src as u32) << 5 | dst as u32),
        (false, 32) => mov_gp(asm, dst, src, 4),
        _ => unreachable!("extension from {from_bits} to {to_bits} bits"),
    }
}

// Control flow.

/// `b` with a zeroed displacement; returns the instruction offset.
pub fn b(asm: &mut Assembler) -> u32 {
    let at = asm.text_off();
    put(asm, 0x1400_0000);
    at
}

/// `b.cond` with a zeroed displacement; returns the instruction offset.
pub fn b_cond(asm: &mut Assembler, cond: u8) -> u32 {
    let at = asm.text_off();
    put(asm, 0x5400_0000 | cond as u32);
    at
}

/// `bl` with a zeroed displacement; returns the instruction offset.
pub fn bl(asm: &mut Assembler) -> u32 {
    let at = asm.text_off();
    put(asm, 0x9400_0000);
    at
}

pub fn blr(asm: &mut Assembler, rn: u8) {
    put(asm, 0xd63f_0000 | (rn as u32) << 5);
}

pub fn ret(asm: &mut Assembler) {
    put(asm, 0xd65f_03c0);
}

/// `adrp dst, sym` with a zeroed immediate; returns the instruction offset.
pub fn adrp(asm: &mut Assembler, dst: u8) -> u32 {
    let at = asm.text_off();
    put(asm, 0x9000_0000 | dst as u32);
    at
}

/// `add dst, src, #lo12` with a zeroed immediate; returns the offset.
pub fn add_lo12(asm: &mut Assembler, dst: u8, src: u8) -> u32 {
    let at = asm.text_off();
    put(asm, 0x9100_0000 | (src as u32) << 5 | dst as u32);
    at
}

/// `ldr dst, [src, #lo12]` with a zeroed immediate; returns the offset.
pub fn ldr_lo12(asm: &mut Assembler, dst: u8, src: u8) -> u32 {
    let at = asm.text_off();
    put(asm, 0xf940_0000 | (src as u32) << 5 | dst as u32);
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::Aarch64;
    use crate::Machine;

    fn words(f: impl FnOnce(&mut Assembler)) -> Vec<u32> {
        let mut a = Assembler::new(Aarch64::target_info());
        f(&mut a);
        a.section(a.text_section())
            .data
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn frame_push_pop_pair() {
        // stp x29, x30, [sp, #-16]!
        assert_eq!(words(|a| stp_pre(a, FP, LR, SP, -16)), [0xa9bf7bfd]);
        // ldp x29, x30, [sp], #16
        assert_eq!(words(|a| ldp_post(a, FP, LR, SP, 16)), [0xa8c17bfd]);
    }

    #[test]
    fn mov_sp_forms() {
        // mov x29, sp
        assert_eq!(words(|a| add_sub_imm(a, FP, SP, 0)), [0x910003fd]);
        // mov sp, x29
        assert_eq!(words(|a| add_sub_imm(a, SP, FP, 0)), [0x910003bf]);
    }

    #[test]
    fn split_immediates() {
        // sub sp, sp, #0x12345 -> sub #0x12000 ; sub #0x345
        let w = words(|a| add_sub_imm(a, SP, SP, -0x12345));
        assert_eq!(w.len(), 2);
        assert_eq!(w[0], 0xd100_0000 | 1 << 22 | 0x12 << 10 | 31 << 5 | 31);
        assert_eq!(w[1], 0xd100_0000 | 0x345 << 10 | 31 << 5 | 31);
    }

    #[test]
    fn frame_accesses() {
        // str x0, [x29, #-8] -> stur
        assert_eq!(
            words(|a| mem_access(a, true, false, 0, FP, -8, 8)),
            [0xf800_0000 | (0x1f8) << 12 | 29 << 5]
        );
        // ldr x1, [x29, #16] -> scaled
        assert_eq!(
            words(|a| mem_access(a, true, true, 1, FP, 16, 8)),
            [0xf940_0000 | 2 << 10 | 29 << 5 | 1]
        );
        // Far offset goes through ip0.
        let w = words(|a| mem_access(a, true, true, 1, FP, -0x2008, 8));
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn constants() {
        // mov x0, #1
        assert_eq!(words(|a| mov_imm(a, 0, 1, 8)), [0x8000_0000 | 0x5280_0000 | 1 << 5]);
        // mov x0, #-1 via movn
        assert_eq!(words(|a| mov_imm(a, 0, u64::MAX, 8)), [0x9280_0000]);
        // A full 64-bit constant takes four instructions.
        assert_eq!(words(|a| mov_imm(a, 0, 0x1234_5678_9abc_def0, 8)).len(), 4);
        // mov w0, #0
        assert_eq!(words(|a| mov_imm(a, 0, 0, 4)), [0x5280_0000]);
    }

    #[test]
    fn compare_and_cset() {
        // cmp x1, x2
        assert_eq!(
            words(|a| cmp_rr(a, 1, 2, 8)),
            [(1u32 << 31) | 0x6b00_001f | 2 << 16 | 1 << 5]
        );
        // cset x0, eq == csinc x0, xzr, xzr, ne
        assert_eq!(words(|a| cset(a, 0, 0)), [0x9a9f_07e0 | 1 << 12]);
    }
}
