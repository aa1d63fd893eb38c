//! x86-32 register definitions.
//!
//! The platform-neutral `ptr_a`/`ptr_b`/`ptr_c` map onto eax/ebx/ecx;
//! bank 1 holds edx/esi/edi and the pseudo-register standing for the x87
//! stack top, which only appears in result locations.

use crate::reg::{self, Reg, RegSet};
use crate::size::Size;

const BANK: u16 = 1;

pub const EDX: Reg = Reg::from_parts(4, BANK, 0);
pub const ESI: Reg = Reg::from_parts(4, BANK, 1);
pub const EDI: Reg = Reg::from_parts(4, BANK, 2);

pub const PTR_D: Reg = Reg::from_parts(0, BANK, 0);
pub const PTR_SI: Reg = Reg::from_parts(0, BANK, 1);
pub const PTR_DI: Reg = Reg::from_parts(0, BANK, 2);

/// The x87 stack top; a result-location marker, never a working register.
pub const FP0: Reg = Reg::from_parts(8, BANK, 3);

pub fn is_fp0(r: Reg) -> bool {
    reg::same(r, FP0)
}

/// The hardware encoding (eax=0, ecx=1, edx=2, ebx=3, esp=4, ebp=5,
/// esi=6, edi=7).
pub fn hw(r: Reg) -> u8 {
    match (r.bank(), r.slot()) {
        (0, 3) => 0,
        (0, 4) => 3,
        (0, 5) => 1,
        (0, 1) => 4,
        (0, 2) => 5,
        (BANK, 0) => 2,
        (BANK, 1) => 6,
        (BANK, 2) => 7,
        _ => panic!("not an x86 register: {r}"),
    }
}

/// DWARF numbering for x86: eax=0, ecx=1, edx=2, ebx=3, esp=4, ebp=5,
/// esi=6, edi=7, return address 8.
pub fn dwarf_reg(r: Reg) -> Option<u16> {
    match (r.bank(), r.slot()) {
        (0, 3) => Some(0),
        (0, 4) => Some(3),
        (0, 5) => Some(1),
        (0, 1) => Some(4),
        (0, 2) => Some(5),
        (BANK, 0) => Some(2),
        (BANK, 1) => Some(6),
        (BANK, 2) => Some(7),
        _ => None,
    }
}

const SCRATCH: [Reg; 6] = [
    reg::EAX,
    reg::ECX,
    EDX,
    reg::EBX,
    ESI,
    EDI,
];

/// A free 32-bit register.
pub fn unused_reg(used: &RegSet) -> Option<Reg> {
    SCRATCH.iter().copied().find(|&r| !used.has(r))
}

/// A free register that has a byte view; esi and edi have none.
pub fn unused_byte_reg(used: &RegSet) -> Option<Reg> {
    SCRATCH[..4].iter().copied().find(|&r| !used.has(r))
}

/// Registers a cdecl callee may clobber.
pub fn dirty() -> RegSet {
    RegSet::from_regs([reg::EAX, reg::ECX, EDX])
}
