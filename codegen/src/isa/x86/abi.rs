//! cdecl parameter classification: everything on the stack, caller pops.

use super::regs;
use crate::abi::{Param, Params, ResultLoc, Slots, RETURN_ID};
use crate::reg::{self, PTR_A};
use crate::size::Size;
use crate::ty::{Primitive, PrimitiveKind, SimpleDesc};

pub struct CdeclParams {
    slots: Slots,
}

impl CdeclParams {
    pub fn new() -> CdeclParams {
        CdeclParams {
            // No parameter registers; four-byte stack slots, the whole
            // area kept 16-byte aligned at the call.
            slots: Slots::new(0, 0, 4, 16),
        }
    }
}

/// Stack slots pack without gaps: pushes can not leave holes, so nothing
/// aligns beyond the slot size.
fn flat(s: Size) -> Size {
    Size::new(
        s.size32(),
        s.align32().min(4),
        s.size64(),
        s.align64().min(4),
    )
}

impl Params for CdeclParams {
    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn slots_mut(&mut self) -> &mut Slots {
        &mut self.slots
    }

    fn register_src(&self, _n: usize) -> crate::reg::Reg {
        unreachable!("cdecl passes no parameters in registers")
    }

    fn add_primitive(&mut self, id: u16, p: Primitive) {
        if p.kind == PrimitiveKind::None {
            return;
        }
        self.slots.add_stack(Param::new(id, flat(p.size), 0, false));
    }

    fn add_complex(&mut self, id: u16, size: Size) {
        // Passed by value: the bytes go on the stack.
        self.slots.add_stack(Param::new(id, flat(size), 0, false));
    }

    fn add_simple(&mut self, id: u16, desc: &SimpleDesc) {
        self.slots
            .add_stack(Param::new(id, flat(desc.size()), 0, false));
    }

    fn result_primitive(&mut self, p: Primitive) {
        let result = match p.kind {
            PrimitiveKind::None => ResultLoc::empty(),
            // Floating-point results come back on the x87 stack.
            PrimitiveKind::Real => {
                ResultLoc::in_register(reg::as_size(regs::FP0, p.size).unwrap())
            }
            _ => {
                if p.size.size32() > 4 {
                    // 64-bit integers in the edx:eax pair.
                    let mut r = ResultLoc::empty();
                    r.put_register(reg::EAX, 0);
                    r.put_register(regs::EDX, 4);
                    r
                } else {
                    ResultLoc::in_register(reg::as_size(PTR_A, p.size).unwrap())
                }
            }
        };
        self.slots.set_result(result);
    }

    fn result_complex(&mut self, size: Size) {
        // A hidden pointer becomes the first stack parameter.
        self.slots.set_result(ResultLoc::in_memory(reg::NO_REG));
        let first = Param::new(RETURN_ID, flat(size), 0, true);
        let mut rebuilt = Slots::new(0, 0, 4, 16);
        rebuilt.add_stack(first);
        for i in 0..self.slots.stack_count() {
            rebuilt.add_stack(self.slots.stack_param(i));
        }
        if self.callee_destroy_params() {
            rebuilt.set_callee_destroy();
        }
        let result = self.slots.result().clone();
        rebuilt.set_result(result);
        self.slots = rebuilt;
    }

    fn result_simple(&mut self, desc: &SimpleDesc) {
        self.result_complex(desc.size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::{double_primitive, int_primitive, long_primitive};

    #[test]
    fn everything_on_the_stack() {
        let mut p = CdeclParams::new();
        p.add_primitive(0, int_primitive());
        p.add_primitive(1, long_primitive());
        p.add_primitive(2, double_primitive());

        assert_eq!(p.register_count(), 0);
        assert_eq!(p.stack_count(), 3);
        // Slots pack without gaps, matching the push sequence.
        assert_eq!(p.stack_offset(0), 0);
        assert_eq!(p.stack_offset(1), 4);
        assert_eq!(p.stack_offset(2), 12);
        assert_eq!(p.stack_total_size(), 32);
    }

    #[test]
    fn long_result_uses_the_pair() {
        let mut p = CdeclParams::new();
        p.result_primitive(long_primitive());
        assert_eq!(p.result().register_count(), 2);
        assert_eq!(p.result().register_at(0), reg::EAX);
        assert_eq!(p.result().register_at(1), regs::EDX);
    }

    #[test]
    fn aggregate_result_inserts_hidden_pointer() {
        let mut p = CdeclParams::new();
        p.add_primitive(0, int_primitive());
        p.result_complex(Size::PTR * 3);

        assert_eq!(p.stack_count(), 2);
        assert_eq!(p.stack_param(0).id(), RETURN_ID);
        assert_eq!(p.stack_param(1).id(), 0);
    }
}
