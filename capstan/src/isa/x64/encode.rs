//! Minimal x86-64 instruction encoder.
//!
//! Only the instructions the generic compiler and the lowering surface
//! need are encoded here; this is not a general assembler. GP registers
//! use their hardware numbering (rax=0 ... r15=15); XMM registers are the
//! FP bank and encode their in-bank index.

use crate::asm::Assembler;
use crate::regfile::Reg;

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;

fn rex_byte(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | (w as u8) << 3 | ((r >> 3) & 1) << 2 | ((x >> 3) & 1) << 1 | ((b >> 3) & 1)
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Hardware encoding of a register (bank index for XMM).
pub fn hw(reg: Reg) -> u8 {
    reg.bank_idx()
}

/// Emit REX if any extension bit or the width bit is needed.
fn rex_opt(asm: &mut Assembler, w: bool, r: u8, x: u8, b: u8) {
    if w || r >= 8 || x >= 8 || b >= 8 {
        asm.put1(rex_byte(w, r, x, b));
    }
}

/// REX for byte-register operands: also needed to address sil/dil/spl/bpl.
fn rex_byte_op(asm: &mut Assembler, r: u8, b: u8) {
    if r >= 4 || b >= 4 {
        asm.put1(rex_byte(false, r, 0, b));
    }
}

/// ModRM + optional SIB + displacement for `[base + disp]`.
fn mem_operand(asm: &mut Assembler, reg: u8, base: u8, disp: i32) {
    let base_low = base & 7;
    let need_sib = base_low == RSP;
    let mode = if disp == 0 && base_low != RBP {
        0
    } else if (-128..128).contains(&disp) {
        1
    } else {
        2
    };
    asm.put1(modrm(mode, reg, if need_sib { 4 } else { base }));
    if need_sib {
        asm.put1(modrm(0, 4, base)); // scale=1, no index
    }
    match mode {
        1 => asm.put1(disp as i8 as u8),
        2 => asm.put4(disp as u32),
        _ => {}
    }
}

pub fn push64(asm: &mut Assembler, reg: u8) {
    if reg >= 8 {
        asm.put1(0x41);
    }
    asm.put1(0x50 + (reg & 7));
}

pub fn pop64(asm: &mut Assembler, reg: u8) {
    if reg >= 8 {
        asm.put1(0x41);
    }
    asm.put1(0x58 + (reg & 7));
}

/// `mov` between general-purpose registers.
pub fn mov_rr(asm: &mut Assembler, dst: u8, src: u8, size: u32) {
    match size {
        1 => {
            rex_byte_op(asm, src, dst);
            asm.put1(0x88);
        }
        2 => {
            asm.put1(0x66);
            rex_opt(asm, false, src, 0, dst);
            asm.put1(0x89);
        }
        4 => {
            rex_opt(asm, false, src, 0, dst);
            asm.put1(0x89);
        }
        _ => {
            rex_opt(asm, true, src, 0, dst);
            asm.put1(0x89);
        }
    }
    asm.put1(modrm(3, src, dst));
}

/// `movaps` between XMM registers.
pub fn movaps_rr(asm: &mut Assembler, dst: u8, src: u8) {
    rex_opt(asm, false, dst, 0, src);
    asm.put(&[0x0f, 0x28]);
    asm.put1(modrm(3, dst, src));
}

/// GP store to `[base + disp]`.
pub fn store_gp(asm: &mut Assembler, src: u8, base: u8, disp: i32, size: u32) {
    match size {
        1 => {
            if src >= 4 || base >= 8 {
                asm.put1(rex_byte(false, src, 0, base));
            }
            asm.put1(0x88);
        }
        2 => {
            asm.put1(0x66);
            rex_opt(asm, false, src, 0, base);
            asm.put1(0x89);
        }
        4 => {
            rex_opt(asm, false, src, 0, base);
            asm.put1(0x89);
        }
        _ => {
            rex_opt(asm, true, src, 0, base);
            asm.put1(0x89);
        }
    }
    mem_operand(asm, src, base, disp);
}

/// GP load from `[base + disp]`; sub-dword sizes zero-extend.
pub fn load_gp(asm: &mut Assembler, dst: u8, base: u8, disp: i32, size: u32) {
    match size {
        1 => {
            rex_opt(asm, false, dst, 0, base);
            asm.put(&[0x0f, 0xb6]);
        }
        2 => {
            rex_opt(asm, false, dst, 0, base);
            asm.put(&[0x0f, 0xb7]);
        }
        4 => {
            rex_opt(asm, false, dst, 0, base);
            asm.put1(0x8b);
        }
        _ => {
            rex_opt(asm, true, dst, 0, base);
            asm.put1(0x8b);
        }
    }
    mem_operand(asm, dst, base, disp);
}

/// XMM store to `[base + disp]`.
pub fn store_xmm(asm: &mut Assembler, src: u8, base: u8, disp: i32, size: u32) {
    match size {
        4 => asm.put1(0xf3),
        8 => asm.put1(0xf2),
        _ => asm.put1(0xf3),
    }
    rex_opt(asm, false, src, 0, base);
    match size {
        16 => asm.put(&[0x0f, 0x7f]),
        _ => asm.put(&[0x0f, 0x11]),
    }
    mem_operand(asm, src, base, disp);
}

/// XMM load from `[base + disp]`.
pub fn load_xmm(asm: &mut Assembler, dst: u8, base: u8, disp: i32, size: u32) {
    match size {
        4 => asm.put1(0xf3),
        8 => asm.put1(0xf2),
        _ => asm.put1(0xf3),
    }
    rex_opt(asm, false, dst, 0, base);
    match size {
        16 => asm.put(&[0x0f, 0x6f]),
        _ => asm.put(&[0x0f, 0x10]),
    }
    mem_operand(asm, dst, base, disp);
}

/// `lea dst, [base + index*2^scale + disp]`.
pub fn lea(asm: &mut Assembler, dst: u8, base: Option<u8>, index: Option<(u8, u8)>, disp: i32) {
    match (base, index) {
        (Some(b), None) => {
            rex_opt(asm, true, dst, 0, b);
            asm.put1(0x8d);
            mem_operand(asm, dst, b, disp);
        }
        (base, Some((idx, scale))) => {
            debug_assert_ne!(idx & 7, RSP, "rsp cannot be an index");
            let b = base.unwrap_or(RBP);
            rex_opt(asm, true, dst, idx, b);
            asm.put1(0x8d);
            if base.is_some() {
                let mode = if disp == 0 && (b & 7) != RBP {
                    0
                } else if (-128..128).contains(&disp) {
                    1
                } else {
                    2
                };
                asm.put1(modrm(mode, dst, 4));
                asm.put1((scale << 6) | ((idx & 7) << 3) | (b & 7));
                match mode {
                    1 => asm.put1(disp as i8 as u8),
                    2 => asm.put4(disp as u32),
                    _ => {}
                }
            } else {
                // No base: mod=0, rm=4, SIB base=101 with disp32.
                asm.put1(modrm(0, dst, 4));
                asm.put1((scale << 6) | ((idx & 7) << 3) | 5);
                asm.put4(disp as u32);
            }
        }
        (None, None) => unreachable!("lea without base or index"),
    }
}

/// `lea dst, [rip + disp32]`; returns the offset of the displacement field.
pub fn lea_rip(asm: &mut Assembler, dst: u8) -> u32 {
    rex_opt(asm, true, dst, 0, 0);
    asm.put1(0x8d);
    asm.put1(modrm(0, dst, 5));
    let off = asm.text_off();
    asm.put4(0);
    off
}

/// `mov dst, [rip + disp32]`; returns the offset of the displacement field.
pub fn mov_rip(asm: &mut Assembler, dst: u8) -> u32 {
    rex_opt(asm, true, dst, 0, 0);
    asm.put1(0x8b);
    asm.put1(modrm(0, dst, 5));
    let off = asm.text_off();
    asm.put4(0);
    off
}

/// Materialize an immediate into a GP register.
pub fn mov_ri(asm: &mut Assembler, dst: u8, value: u64, size: u32) {
    let value = if size >= 8 {
        value
    } else {
        value & ((1u64 << (size * 8)) - 1)
    };
    if value <= u32::MAX as u64 {
        // 32-bit move zero-extends.
        rex_opt(asm, false, 0, 0, dst);
        asm.put1(0xb8 + (dst & 7));
        asm.put4(value as u32);
    } else if value as i64 >= i32::MIN as i64 && (value as i64) <= i32::MAX as i64 {
        rex_opt(asm, true, 0, 0, dst);
        asm.put1(0xc7);
        asm.put1(modrm(3, 0, dst));
        asm.put4(value as u32);
    } else {
        rex_opt(asm, true, 0, 0, dst);
        asm.put1(0xb8 + (dst & 7));
        asm.put(&value.to_le_bytes());
    }
}

/// Two-register ALU op, `dst = dst <op> src`. Opcode is the `r/m, r` form.
pub fn alu_rr(asm: &mut Assembler, opcode: u8, dst: u8, src: u8, size: u32) {
    debug_assert!(size == 4 || size == 8);
    rex_opt(asm, size == 8, src, 0, dst);
    asm.put1(opcode);
    asm.put1(modrm(3, src, dst));
}

pub const OP_ADD: u8 = 0x01;
pub const OP_SUB: u8 = 0x29;
pub const OP_AND: u8 = 0x21;
pub const OP_OR: u8 = 0x09;
pub const OP_XOR: u8 = 0x31;
pub const OP_CMP: u8 = 0x39;

/// `setcc dst8` followed by a zero-extension to 32 bits.
pub fn setcc_zx(asm: &mut Assembler, cc: u8, dst: u8) {
    if dst >= 4 {
        asm.put1(rex_byte(false, 0, 0, dst));
    }
    asm.put(&[0x0f, 0x90 + cc]);
    asm.put1(modrm(3, 0, dst));
    rex_opt(asm, false, dst, 0, dst);
    asm.put(&[0x0f, 0xb6]);
    asm.put1(modrm(3, dst, dst));
}

/// `jcc rel32` with a zeroed displacement; returns the field offset.
pub fn jcc32(asm: &mut Assembler, cc: u8) -> u32 {
    asm.put(&[0x0f, 0x80 + cc]);
    let off = asm.text_off();
    asm.put4(0);
    off
}

/// `jmp rel32` with a zeroed displacement; returns the field offset.
pub fn jmp32(asm: &mut Assembler) -> u32 {
    asm.put1(0xe9);
    let off = asm.text_off();
    asm.put4(0);
    off
}

/// `call rel32` with a zeroed displacement; returns the field offset.
pub fn call32(asm: &mut Assembler) -> u32 {
    asm.put1(0xe8);
    let off = asm.text_off();
    asm.put4(0);
    off
}

pub fn call_r(asm: &mut Assembler, reg: u8) {
    if reg >= 8 {
        asm.put1(0x41);
    }
    asm.put1(0xff);
    asm.put1(modrm(3, 2, reg));
}

/// `sub rsp, imm32`, always 7 bytes.
pub fn sub_rsp_imm32(asm: &mut Assembler, imm: u32) {
    asm.put(&[0x48, 0x81, 0xec]);
    asm.put4(imm);
}

/// `add rsp, imm32`, always 7 bytes.
pub fn add_rsp_imm32(asm: &mut Assembler, imm: u32) {
    asm.put(&[0x48, 0x81, 0xc4]);
    asm.put4(imm);
}

/// Sign- or zero-extension between register widths.
pub fn ext(asm: &mut Assembler, dst: u8, src: u8, signed: bool, from_bits: u32, to_bits: u32) {
    let w = to_bits > 32;
    match (signed, from_bits) {
        (true, 8) => {
            rex_opt(asm, w, dst, 0, src);
            asm.put(&[0x0f, 0xbe]);
            asm.put1(modrm(3, dst, src));
        }
        (true, 16) => {
            rex_opt(asm, w, dst, 0, src);
            asm.put(&[0x0f, 0xbf]);
            asm.put1(modrm(3, dst, src));
        }
        (true, 32) => {
            // movsxd
            rex_opt(asm, true, dst, 0, src);
            asm.put1(0x63);
            asm.put1(modrm(3, dst, src));
        }
        (false, 8) => {
            rex_opt(asm, false, dst, 0, src);
            asm.put(&[0x0f, 0xb6]);
            asm.put1(modrm(3, dst, src));
        }
        (false, 16) => {
            rex_opt(asm, false, dst, 0, src);
            asm.put(&[0x0f, 0xb7]);
            asm.put1(modrm(3, dst, src));
        }
        (false, 32) => {
            // A 32-bit register move zero-extends.
            mov_rr(asm, dst, src, 4);
        }
        _ => unreachable!("extension from {from_bits} bits"),
    }
}

/// `test al, al`.
pub fn test_al(asm: &mut Assembler) {
    asm.put(&[0x84, 0xc0]);
}

pub fn ret(asm: &mut Assembler) {
    asm.put1(0xc3);
}

pub fn nop_fill(out: &mut [u8]) {
    for b in out {
        *b = 0x90;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x64::X64;
    use crate::Machine;

    fn emitted(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut a = Assembler::new(X64::target_info());
        f(&mut a);
        a.section(a.text_section()).data.clone()
    }

    #[test]
    fn push_pop() {
        assert_eq!(emitted(|a| push64(a, RBP)), [0x55]);
        assert_eq!(emitted(|a| push64(a, 12)), [0x41, 0x54]);
        assert_eq!(emitted(|a| pop64(a, RBX)), [0x5b]);
    }

    #[test]
    fn mov_forms() {
        // mov rbp, rsp
        assert_eq!(emitted(|a| mov_rr(a, RBP, RSP, 8)), [0x48, 0x89, 0xe5]);
        // mov eax, edi
        assert_eq!(emitted(|a| mov_rr(a, RAX, RDI, 4)), [0x89, 0xf8]);
        // mov r8, rdi
        assert_eq!(emitted(|a| mov_rr(a, 8, RDI, 8)), [0x49, 0x89, 0xf8]);
    }

    #[test]
    fn frame_accesses() {
        // mov [rbp-8], rax
        assert_eq!(
            emitted(|a| store_gp(a, RAX, RBP, -8, 8)),
            [0x48, 0x89, 0x45, 0xf8]
        );
        // mov rax, [rbp-0x100]
        assert_eq!(
            emitted(|a| load_gp(a, RAX, RBP, -0x100, 8)),
            [0x48, 0x8b, 0x85, 0x00, 0xff, 0xff, 0xff]
        );
        // mov [rsp+8], rdi needs a SIB byte.
        assert_eq!(
            emitted(|a| store_gp(a, RDI, RSP, 8, 8)),
            [0x48, 0x89, 0x7c, 0x24, 0x08]
        );
    }

    #[test]
    fn imm_moves() {
        // mov eax, 1 (32-bit form zero-extends)
        assert_eq!(emitted(|a| mov_ri(a, RAX, 1, 8)), [0xb8, 1, 0, 0, 0]);
        // mov rax, -1 via sign-extended imm32
        assert_eq!(
            emitted(|a| mov_ri(a, RAX, u64::MAX, 8)),
            [0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]
        );
        // movabs for a full 64-bit value
        let bytes = emitted(|a| mov_ri(a, RAX, 0x1234_5678_9abc_def0, 8));
        assert_eq!(&bytes[..2], &[0x48, 0xb8]);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn alu_and_stack_adjust() {
        // add rax, rdi
        assert_eq!(
            emitted(|a| alu_rr(a, OP_ADD, RAX, RDI, 8)),
            [0x48, 0x01, 0xf8]
        );
        // sub rsp, 0x20
        assert_eq!(
            emitted(|a| sub_rsp_imm32(a, 0x20)),
            [0x48, 0x81, 0xec, 0x20, 0, 0, 0]
        );
    }

    #[test]
    fn extensions() {
        // movsxd rax, edi
        assert_eq!(emitted(|a| ext(a, RAX, RDI, true, 32, 64)), [0x48, 0x63, 0xc7]);
        // mov eax, edi for zext 32->64
        assert_eq!(emitted(|a| ext(a, RAX, RDI, false, 32, 64)), [0x89, 0xf8]);
    }
}
