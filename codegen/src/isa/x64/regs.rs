//! x64 register definitions.
//!
//! The platform-neutral `ptr_a`/`ptr_b`/`ptr_c` map onto rax/rbx/rcx.
//! Bank 2 holds the remaining integer registers and bank 3 the SSE
//! registers.

use crate::eh::seh::SehReg;
use crate::reg::{self, Reg, RegSet};
use crate::size::Size;

const INT_BANK: u16 = 2;
const FP_BANK: u16 = 3;

// 64-bit views of the integer registers outside the neutral bank.
pub const RDX: Reg = Reg::from_parts(8, INT_BANK, 0);
pub const RSI: Reg = Reg::from_parts(8, INT_BANK, 1);
pub const RDI: Reg = Reg::from_parts(8, INT_BANK, 2);
pub const R8: Reg = Reg::from_parts(8, INT_BANK, 3);
pub const R9: Reg = Reg::from_parts(8, INT_BANK, 4);
pub const R10: Reg = Reg::from_parts(8, INT_BANK, 5);
pub const R11: Reg = Reg::from_parts(8, INT_BANK, 6);
pub const R12: Reg = Reg::from_parts(8, INT_BANK, 7);
pub const R13: Reg = Reg::from_parts(8, INT_BANK, 8);
pub const R14: Reg = Reg::from_parts(8, INT_BANK, 9);
pub const R15: Reg = Reg::from_parts(8, INT_BANK, 10);

// Pointer-sized views, used where the width follows the target.
pub const PTR_D: Reg = Reg::from_parts(0, INT_BANK, 0);
pub const PTR_SI: Reg = Reg::from_parts(0, INT_BANK, 1);
pub const PTR_DI: Reg = Reg::from_parts(0, INT_BANK, 2);
pub const PTR_8: Reg = Reg::from_parts(0, INT_BANK, 3);
pub const PTR_9: Reg = Reg::from_parts(0, INT_BANK, 4);
pub const PTR_10: Reg = Reg::from_parts(0, INT_BANK, 5);

pub const EDX: Reg = Reg::from_parts(4, INT_BANK, 0);

/// SSE register `n` at double width.
pub const fn xmm(n: u16) -> Reg {
    Reg::from_parts(8, FP_BANK, n)
}

pub const XMM0: Reg = xmm(0);
pub const XMM1: Reg = xmm(1);

/// Is this one of the SSE registers?
pub fn fp_register(r: Reg) -> bool {
    r.bank() == FP_BANK
}

pub fn fp_operand(op: &crate::operand::Operand) -> bool {
    op.has_register() && !matches!(op.kind(), crate::operand::OperandKind::Rel(..)) && fp_register(op.reg())
}

/// The hardware encoding of a register (rax=0 .. r15=15, xmm by index).
pub fn hw(r: Reg) -> u8 {
    match (r.bank(), r.slot()) {
        // Neutral bank: rax, rbx, rcx, rsp, rbp.
        (0, 3) => 0,
        (0, 4) => 3,
        (0, 5) => 1,
        (0, 1) => 4,
        (0, 2) => 5,
        (INT_BANK, 0) => 2,
        (INT_BANK, 1) => 6,
        (INT_BANK, 2) => 7,
        (INT_BANK, s) => (s - 3 + 8) as u8,
        (FP_BANK, s) => s as u8,
        _ => panic!("not an x64 register: {r}"),
    }
}

/// DWARF numbering (System V AMD64 psABI, figure 3.36).
pub fn dwarf_reg(r: Reg) -> Option<u16> {
    let n = match (r.bank(), r.slot()) {
        (0, 3) => 0,  // rax
        (0, 4) => 3,  // rbx
        (0, 5) => 2,  // rcx
        (0, 1) => 7,  // rsp
        (0, 2) => 6,  // rbp
        (INT_BANK, 0) => 1, // rdx
        (INT_BANK, 1) => 4, // rsi
        (INT_BANK, 2) => 5, // rdi
        (INT_BANK, s) => (s - 3 + 8),
        (FP_BANK, s) => 17 + s,
        _ => return None,
    };
    Some(n)
}

/// SEH numbering: integer registers use the hardware encoding, vector
/// registers their index (they carry the distinct xmm-save unwind op).
pub fn seh_reg(r: Reg) -> Option<SehReg> {
    match r.bank() {
        FP_BANK => Some(SehReg::Xmm(r.slot() as u8)),
        0 | INT_BANK => Some(SehReg::Gpr(hw(r))),
        _ => None,
    }
}

/// Registers handed out as scratch by the rewrite passes, in preference
/// order. r10 is kept as the temporary of the call lowering and r15 as
/// its result-protection register, so neither is offered here.
const SCRATCH: [Reg; 12] = [
    reg::RAX,
    reg::RBX,
    reg::RCX,
    RDX,
    RSI,
    RDI,
    R8,
    R9,
    R11,
    R12,
    R13,
    R14,
];

/// A 64-bit register not in `used`.
pub fn unused_reg(used: &RegSet) -> Option<Reg> {
    SCRATCH.iter().copied().find(|&r| !used.has(r))
}

/// An SSE register not in `used`. High registers first: the low ones
/// carry parameters.
pub fn unused_fp_reg(used: &RegSet) -> Option<Reg> {
    (0..16).rev().map(xmm).find(|&r| !used.has(r))
}

/// All registers the System V ABI lets a callee clobber.
pub fn sysv_dirty() -> RegSet {
    let mut set = RegSet::new();
    for r in [reg::RAX, RDI, RSI, RDX, reg::RCX, R8, R9, R10, R11] {
        set.put(r);
    }
    for n in 0..16 {
        set.put(xmm(n));
    }
    set
}

/// All registers the Win64 ABI lets a callee clobber. xmm6 and up are
/// callee-saved there.
pub fn win64_dirty() -> RegSet {
    let mut set = RegSet::new();
    for r in [reg::RAX, reg::RCX, RDX, R8, R9, R10, R11] {
        set.put(r);
    }
    for n in 0..6 {
        set.put(xmm(n));
    }
    set
}

/// The pointer-width view of `r`, for registers that have one.
pub fn ptr_view(r: Reg) -> Reg {
    reg::as_size(r, Size::PTR).unwrap_or(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{PTR_FRAME, PTR_STACK, RAX, RBX, RCX};

    #[test]
    fn hardware_numbers() {
        assert_eq!(hw(RAX), 0);
        assert_eq!(hw(RCX), 1);
        assert_eq!(hw(RDX), 2);
        assert_eq!(hw(RBX), 3);
        assert_eq!(hw(PTR_STACK), 4);
        assert_eq!(hw(PTR_FRAME), 5);
        assert_eq!(hw(RSI), 6);
        assert_eq!(hw(RDI), 7);
        assert_eq!(hw(R8), 8);
        assert_eq!(hw(R15), 15);
        assert_eq!(hw(xmm(7)), 7);
    }

    #[test]
    fn scratch_avoids_reserved() {
        let used = RegSet::new();
        let r = unused_reg(&used).unwrap();
        assert!(!crate::reg::same(r, R10));
        assert!(!crate::reg::same(r, R15));

        let mut all = RegSet::new();
        for r in SCRATCH {
            all.put(r);
        }
        assert_eq!(unused_reg(&all), None);
    }

    #[test]
    fn dwarf_numbers() {
        assert_eq!(dwarf_reg(RAX), Some(0));
        assert_eq!(dwarf_reg(PTR_FRAME), Some(6));
        assert_eq!(dwarf_reg(PTR_STACK), Some(7));
        assert_eq!(dwarf_reg(xmm(0)), Some(17));
    }

    #[test]
    fn seh_numbers_cover_both_banks() {
        assert_eq!(seh_reg(PTR_FRAME), Some(SehReg::Gpr(5)));
        assert_eq!(seh_reg(R15), Some(SehReg::Gpr(15)));
        assert_eq!(seh_reg(xmm(6)), Some(SehReg::Xmm(6)));
        assert_eq!(seh_reg(xmm(15)), Some(SehReg::Xmm(15)));
    }
}
