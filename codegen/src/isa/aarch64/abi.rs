//! AAPCS64 parameter classification.

use super::regs;
use crate::abi::{round_param_size, Param, Params, ResultLoc, Slots};
use crate::reg::{self, Reg};
use crate::size::Size;
use crate::ty::{Primitive, PrimitiveKind, SimpleDesc};

/// Is the aggregate a homogeneous floating-point aggregate: up to four
/// identically-typed floating-point members at consecutive offsets?
fn uniform_fp(desc: &SimpleDesc) -> bool {
    let parts = desc.parts();
    let first = match parts.first() {
        Some(p) => p,
        None => return false,
    };
    if first.kind != PrimitiveKind::Real || first.offset.v64() != 0 {
        return false;
    }

    let size = first.size.size64();
    parts.iter().enumerate().all(|(i, p)| {
        p.kind == PrimitiveKind::Real
            && p.size.size64() == size
            && p.offset.v64() as u32 == i as u32 * size
    })
}

/// The AAPCS64 classifier: eight integer registers x0..x7, eight
/// floating-point registers d0..d7, results in x0/x1 or d0..d3, aggregate
/// results over 16 bytes in memory through x8.
pub struct Aarch64Params {
    slots: Slots,
}

impl Aarch64Params {
    pub fn new() -> Aarch64Params {
        Aarch64Params {
            slots: Slots::new(8, 8, 8, 16),
        }
    }
}

impl Params for Aarch64Params {
    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn slots_mut(&mut self) -> &mut Slots {
        &mut self.slots
    }

    fn register_src(&self, n: usize) -> Reg {
        if n < 8 {
            regs::ptr_r(n as u16)
        } else {
            regs::dr((n - 8) as u16)
        }
    }

    fn add_primitive(&mut self, id: u16, p: Primitive) {
        match p.kind {
            PrimitiveKind::None => {}
            PrimitiveKind::Pointer | PrimitiveKind::Integer => {
                self.slots.add_int(Param::primitive(id, p));
            }
            PrimitiveKind::Real => {
                self.slots.add_real(Param::primitive(id, p));
            }
        }
    }

    fn add_complex(&mut self, id: u16, size: Size) {
        // Complex values are simple here: a pointer in an integer slot.
        self.slots.add_int(Param::new(id, size, 0, true));
    }

    fn add_simple(&mut self, id: u16, desc: &SimpleDesc) {
        // An HFA of up to four members goes to the fp registers, whole.
        if uniform_fp(desc) {
            let count = desc.parts().len();
            if count <= 4 && self.slots.has_real(count) {
                for p in desc.parts() {
                    self.slots
                        .add_real(Param::new(id, p.size, p.offset.v64() as u32, false));
                }
            } else {
                self.slots.add_stack(Param::new(id, desc.size(), 0, false));
            }
            return;
        }

        let size = desc.size().size64();
        if size > 16 {
            // Replaced by a pointer to the data.
            self.slots
                .add_int(Param::new(id, round_param_size(desc.size()), 0, true));
            return;
        }

        if size > 8 {
            // Both halves need registers, or the whole goes to the stack.
            if self.slots.has_int(2) {
                self.slots.add_int(Param::new(id, Size::LONG, 0, false));
                self.slots.add_int(Param::new(id, Size::LONG, 8, false));
                return;
            }
        } else if self.slots.has_int(1) {
            self.slots
                .add_int(Param::new(id, round_param_size(desc.size()), 0, false));
            return;
        }

        self.slots.add_stack(Param::new(id, desc.size(), 0, false));
    }

    fn result_primitive(&mut self, p: Primitive) {
        let result = match p.kind {
            PrimitiveKind::None => ResultLoc::empty(),
            PrimitiveKind::Pointer | PrimitiveKind::Integer => {
                ResultLoc::in_register(reg::as_size(regs::ptr_r(0), p.size).unwrap())
            }
            PrimitiveKind::Real => {
                ResultLoc::in_register(reg::as_size(regs::dr(0), p.size).unwrap())
            }
        };
        self.slots.set_result(result);
    }

    fn result_complex(&mut self, _size: Size) {
        // Always in memory, always through x8.
        self.slots.set_result(ResultLoc::in_memory(regs::ptr_r(8)));
    }

    fn result_simple(&mut self, desc: &SimpleDesc) {
        if uniform_fp(desc) {
            let count = desc.parts().len();
            if count <= 4 {
                let mut result = ResultLoc::empty();
                for (i, p) in desc.parts().iter().enumerate() {
                    result.put_register(
                        reg::as_size(regs::dr(i as u16), p.size).unwrap(),
                        p.offset.v64() as u32,
                    );
                }
                self.slots.set_result(result);
                return;
            }
        } else {
            let size = desc.size().size64();
            if size <= 8 {
                let r = reg::as_size(regs::ptr_r(0), round_param_size(desc.size())).unwrap();
                self.slots.set_result(ResultLoc::in_register(r));
                return;
            } else if size <= 16 {
                let mut result = ResultLoc::empty();
                result.put_register(regs::xr(0), 0);
                result.put_register(regs::xr(1), 8);
                self.slots.set_result(result);
                return;
            }
        }

        self.slots.set_result(ResultLoc::in_memory(regs::ptr_r(8)));
    }
}

/// The result pointer lands in x8, which is not an argument register, so
/// no register slot is claimed for it; the call lowering still needs to
/// know about it, through this helper.
pub(super) fn result_register() -> Reg {
    regs::ptr_r(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::Offset;
    use crate::ty::{double_primitive, float_primitive, int_primitive, long_primitive, ptr_primitive};

    fn match_reg_param(p: &dyn Params, slot: usize, id: u16, reg: Reg) {
        let param = p.register_param(slot).expect("expected a register param");
        assert_eq!(param.id(), id);
        assert_eq!(p.register_src(slot), reg);
    }

    #[test]
    fn integer_params() {
        let mut p = Aarch64Params::new();
        for i in 0..9 {
            p.add_primitive(i, int_primitive());
        }

        for slot in 0..8 {
            match_reg_param(&p, slot, slot as u16, regs::ptr_r(slot as u16));
        }
        assert_eq!(p.stack_count(), 1);
        assert_eq!(p.stack_param(0).id(), 8);
        assert_eq!(p.stack_offset(0), 0);
    }

    #[test]
    fn mixed_params() {
        let mut p = Aarch64Params::new();
        p.add_primitive(0, float_primitive());
        p.add_primitive(1, int_primitive());
        p.add_primitive(2, long_primitive());
        p.add_primitive(3, double_primitive());

        match_reg_param(&p, 8, 0, regs::dr(0));
        match_reg_param(&p, 0, 1, regs::ptr_r(0));
        match_reg_param(&p, 1, 2, regs::ptr_r(1));
        match_reg_param(&p, 9, 3, regs::dr(1));
    }

    #[test]
    fn hfa_in_vector_registers() {
        // { float, float, float }: an HFA of three.
        let hfa = SimpleDesc::new(
            Size::FLOAT + Size::FLOAT + Size::FLOAT,
            [
                float_primitive(),
                float_primitive().move_to(Offset::INT),
                float_primitive().move_to(Offset::INT * 2),
            ],
        );
        let mut p = Aarch64Params::new();
        p.add_simple(0, &hfa);

        let a = p.register_param(8).unwrap();
        let b = p.register_param(9).unwrap();
        let c = p.register_param(10).unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 4, 8));
    }

    #[test]
    fn mixed_aggregate_uses_integer_registers() {
        // { ptr, float, float } is not an HFA: integer path, two regs.
        let desc = SimpleDesc::new(
            Size::PTR + Size::FLOAT + Size::FLOAT,
            [
                ptr_primitive(),
                float_primitive().move_to(Offset::PTR),
                float_primitive().move_to(Offset::PTR + Offset::INT),
            ],
        );
        let mut p = Aarch64Params::new();
        p.add_simple(0, &desc);

        let a = p.register_param(0).unwrap();
        let b = p.register_param(1).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8);
    }

    #[test]
    fn large_aggregate_by_pointer() {
        let big = SimpleDesc::new(
            Size::LONG + Size::LONG + Size::LONG,
            [
                long_primitive(),
                long_primitive().move_to(Offset::LONG),
                long_primitive().move_to(Offset::LONG * 2),
            ],
        );
        let mut p = Aarch64Params::new();
        p.add_simple(0, &big);

        assert!(p.register_param(0).unwrap().in_memory());
    }

    #[test]
    fn results() {
        let mut p = Aarch64Params::new();
        p.result_primitive(int_primitive());
        assert_eq!(p.result().register_at(0), reg::as_size(regs::xr(0), Size::INT).unwrap());

        let mut p = Aarch64Params::new();
        p.result_complex(Size::PTR * 4);
        assert_eq!(p.result().memory_register(), Some(regs::ptr_r(8)));

        let mut p = Aarch64Params::new();
        p.result_simple(&SimpleDesc::new(
            Size::LONG + Size::LONG,
            [long_primitive(), long_primitive().move_to(Offset::LONG)],
        ));
        assert_eq!(p.result().register_count(), 2);
        assert_eq!(p.result().register_at(1), regs::xr(1));
    }
}
