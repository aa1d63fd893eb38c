//! AArch64 register definitions.
//!
//! The platform-neutral `ptr_a`/`ptr_b`/`ptr_c` map onto x0/x1/x2, the
//! stack pointer onto sp, and the frame pointer onto x29. Bank 4 holds
//! x3..x15, bank 5 x16..x30, and bank 6 the vector registers v0..v15.

use crate::reg::{self, Reg, RegSet};
use crate::size::Size;

const X_LO_BANK: u16 = 4;
const X_HI_BANK: u16 = 5;
const V_BANK: u16 = 6;

/// The 64-bit view of integer register `n` (x0..x30).
pub fn xr(n: u16) -> Reg {
    match n {
        0..=2 => Reg::from_parts(8, 0, n + 3),
        3..=15 => Reg::from_parts(8, X_LO_BANK, n),
        16..=30 => Reg::from_parts(8, X_HI_BANK, n - 16),
        _ => panic!("no such integer register: x{n}"),
    }
}

/// The pointer-sized view of integer register `n`.
pub fn ptr_r(n: u16) -> Reg {
    reg::as_size(xr(n), Size::PTR).unwrap()
}

/// The 64-bit (d) view of vector register `n` (v0..v15).
pub fn dr(n: u16) -> Reg {
    assert!(n < 16, "no such vector register: v{n}");
    Reg::from_parts(8, V_BANK, n)
}

/// The 32-bit (s) view of vector register `n`.
pub fn sr(n: u16) -> Reg {
    reg::as_size(dr(n), Size::FLOAT).unwrap()
}

/// The intra-procedure scratch registers, never allocated to clients.
pub fn scratch0() -> Reg {
    xr(16)
}

pub fn scratch1() -> Reg {
    xr(17)
}

pub fn fp_register(r: Reg) -> bool {
    r.bank() == V_BANK
}

pub fn fp_operand(op: &crate::operand::Operand) -> bool {
    matches!(op.kind(), crate::operand::OperandKind::Reg(r) if fp_register(*r))
}

/// The hardware register number: x0..x30, sp=31, or the vector index.
pub fn hw(r: Reg) -> u8 {
    match (r.bank(), r.slot()) {
        (0, 3) => 0,
        (0, 4) => 1,
        (0, 5) => 2,
        (0, 1) => 31, // sp
        (0, 2) => 29, // frame pointer
        (X_LO_BANK, s) => s as u8,
        (X_HI_BANK, s) => (s + 16) as u8,
        (V_BANK, s) => s as u8,
        _ => panic!("not an AArch64 register: {r}"),
    }
}

/// DWARF numbering: x0..x30 are 0..30, sp is 31, v0.. start at 64.
pub fn dwarf_reg(r: Reg) -> Option<u16> {
    match (r.bank(), r.slot()) {
        (0, 3..=5) => Some(r.slot() - 3),
        (0, 1) => Some(31),
        (0, 2) => Some(29),
        (X_LO_BANK, s) => Some(s),
        (X_HI_BANK, s) => Some(s + 16),
        (V_BANK, s) => Some(64 + s),
        _ => None,
    }
}

/// Scratch candidates, in preference order: the temporaries first, then
/// the remaining argument registers, then callee-saved registers (the
/// frame layout spills those automatically when touched). x28 is held
/// back as the call lowering's result-protection register.
fn scratch_candidates() -> impl Iterator<Item = Reg> {
    (9..=15)
        .chain(3..=8)
        .chain(0..=2)
        .chain(19..=27)
        .map(xr)
}

/// A free integer register. Never fails: x16/x17 are reserved for the
/// rewrite passes and are handed out as a last resort.
pub fn unused_reg(used: &RegSet) -> Reg {
    scratch_candidates()
        .find(|&r| !used.has(r))
        .unwrap_or_else(scratch0)
}

/// A second free register, distinct from `first`.
pub fn unused_reg_after(used: &RegSet, first: Reg) -> Reg {
    scratch_candidates()
        .find(|&r| !used.has(r) && !reg::same(r, first))
        .unwrap_or_else(scratch1)
}

/// A free vector register; the high half first, the low half carries
/// arguments.
pub fn unused_fp_reg(used: &RegSet) -> Option<Reg> {
    (0..16).rev().map(dr).find(|&r| !used.has(r))
}

/// Registers the AAPCS64 lets a callee clobber: the argument and
/// temporary registers plus v0..v7.
pub fn dirty() -> RegSet {
    let mut set = RegSet::new();
    for n in 0..=17 {
        set.put(xr(n));
    }
    for n in 0..8 {
        set.put(dr(n));
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_numbers() {
        assert_eq!(hw(xr(0)), 0);
        assert_eq!(hw(xr(2)), 2);
        assert_eq!(hw(xr(3)), 3);
        assert_eq!(hw(xr(15)), 15);
        assert_eq!(hw(xr(16)), 16);
        assert_eq!(hw(xr(30)), 30);
        assert_eq!(hw(crate::reg::PTR_STACK), 31);
        assert_eq!(hw(crate::reg::PTR_FRAME), 29);
        assert_eq!(hw(dr(7)), 7);
    }

    #[test]
    fn neutral_views_alias() {
        assert!(reg::same(xr(0), crate::reg::PTR_A));
        assert!(reg::same(xr(1), crate::reg::PTR_B));
        assert!(reg::same(xr(2), crate::reg::PTR_C));
    }

    #[test]
    fn scratch_is_always_available() {
        let mut used = RegSet::new();
        for n in 0..=15 {
            used.put(xr(n));
        }
        for n in 19..=28 {
            used.put(xr(n));
        }
        assert!(reg::same(unused_reg(&used), xr(16)));
    }
}
