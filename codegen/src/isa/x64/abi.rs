//! Parameter classification for the two x64 calling conventions.

use super::regs;
use crate::abi::{round_param_size, Param, Params, ResultLoc, Slots, RETURN_ID};
use crate::reg::{self, Reg, PTR_A, PTR_C};
use crate::size::Size;
use crate::ty::{Primitive, PrimitiveKind, SimpleDesc};

/// Merge the classes of two primitives sharing an eightbyte. Any integer
/// component forces the integer class.
fn merge(a: PrimitiveKind, b: PrimitiveKind) -> PrimitiveKind {
    use PrimitiveKind::*;
    let b = match b {
        Pointer => Integer,
        other => other,
    };
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Pointer, _) | (Integer, _) => Integer,
        (Real, b) => b,
    }
}

/// The class of the eightbyte covering `from..to` of an aggregate.
fn param_kind(parts: &[Primitive], from: i32, to: i32) -> PrimitiveKind {
    let mut result = PrimitiveKind::None;
    for p in parts {
        let offset = p.offset.v64();
        if offset >= from && offset < to {
            result = merge(result, p.kind);
        }
    }
    result
}

/// The System V AMD64 classifier: six integer registers, eight vector
/// registers, the rest on the stack.
pub struct SysVParams {
    slots: Slots,
}

impl SysVParams {
    pub fn new() -> SysVParams {
        SysVParams {
            slots: Slots::new(6, 8, 8, 16),
        }
    }
}

impl Params for SysVParams {
    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn slots_mut(&mut self) -> &mut Slots {
        &mut self.slots
    }

    fn register_src(&self, id: usize) -> Reg {
        const V: [Reg; 14] = [
            regs::PTR_DI,
            regs::PTR_SI,
            regs::PTR_D,
            PTR_C,
            regs::PTR_8,
            regs::PTR_9,
            regs::xmm(0),
            regs::xmm(1),
            regs::xmm(2),
            regs::xmm(3),
            regs::xmm(4),
            regs::xmm(5),
            regs::xmm(6),
            regs::xmm(7),
        ];
        V[id]
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
        self.slots.add_int(Param::new(id, size, 0, true));
    }

    fn add_simple(&mut self, id: u16, desc: &SimpleDesc) {
        // Each 64-bit word of the struct is classified separately: a word
        // with only floating-point members goes to a vector register,
        // anything else to an integer register. Structs over two words,
        // or structs that do not fit the remaining registers as a whole,
        // go on the stack.
        let size = desc.size().size64();
        if size > 2 * 8 {
            self.slots.add_stack(Param::new(id, desc.size(), 0, false));
            return;
        }

        let first = param_kind(desc.parts(), 0, 8);
        let second = param_kind(desc.parts(), 8, 16);

        let first_size = round_param_size(Size::fixed(size.min(8), 8));
        let second_size = round_param_size(Size::fixed(size.saturating_sub(8), 8));

        let int_count = (first == PrimitiveKind::Integer) as usize
            + (second == PrimitiveKind::Integer) as usize;
        let real_count =
            (first == PrimitiveKind::Real) as usize + (second == PrimitiveKind::Real) as usize;

        if self.slots.has_int(int_count) && self.slots.has_real(real_count) {
            match first {
                PrimitiveKind::Integer => self.slots.add_int(Param::new(id, first_size, 0, false)),
                PrimitiveKind::Real => self.slots.add_real(Param::new(id, first_size, 0, false)),
                _ => {}
            }
            match second {
                PrimitiveKind::Integer => self.slots.add_int(Param::new(id, second_size, 8, false)),
                PrimitiveKind::Real => self.slots.add_real(Param::new(id, second_size, 8, false)),
                _ => {}
            }
        } else {
            self.slots.add_stack(Param::new(id, desc.size(), 0, false));
        }
    }

    fn result_primitive(&mut self, p: Primitive) {
        let result = match p.kind {
            PrimitiveKind::None => ResultLoc::empty(),
            PrimitiveKind::Real => {
                ResultLoc::in_register(reg::as_size(regs::xmm(0), p.size).unwrap())
            }
            _ => ResultLoc::in_register(reg::as_size(PTR_A, p.size).unwrap()),
        };
        self.slots.set_result(result);
    }

    fn result_complex(&mut self, size: Size) {
        self.slots.set_result(ResultLoc::in_memory(regs::PTR_DI));
        // The hidden result pointer occupies the first integer register.
        self.slots
            .add_int_at(0, Param::new(RETURN_ID, size, 0, true));
    }

    fn result_simple(&mut self, desc: &SimpleDesc) {
        let size = desc.size().size64();
        if size == 0 {
            self.slots.set_result(ResultLoc::empty());
            return;
        }

        if size > 2 * 8 {
            self.slots.set_result(ResultLoc::in_memory(regs::PTR_DI));
            self.slots
                .add_int_at(0, Param::new(RETURN_ID, desc.size(), 0, true));
            return;
        }

        let first = param_kind(desc.parts(), 0, 8);
        let second = param_kind(desc.parts(), 8, 16);

        let first_size = round_param_size(Size::fixed(size.min(8), 8));
        let second_size = round_param_size(Size::fixed(size.saturating_sub(8), 8));

        let mut result = ResultLoc::empty();
        let mut int_reg = PTR_A;
        let mut real_reg = regs::xmm(0);

        match first {
            PrimitiveKind::Integer | PrimitiveKind::Pointer => {
                result.put_register(reg::as_size(int_reg, first_size).unwrap(), 0);
                int_reg = regs::PTR_D;
            }
            PrimitiveKind::Real => {
                result.put_register(reg::as_size(real_reg, first_size).unwrap(), 0);
                real_reg = regs::xmm(1);
            }
            PrimitiveKind::None => {}
        }

        match second {
            PrimitiveKind::Integer | PrimitiveKind::Pointer => {
                result.put_register(reg::as_size(int_reg, second_size).unwrap(), 8);
            }
            PrimitiveKind::Real => {
                result.put_register(reg::as_size(real_reg, second_size).unwrap(), 8);
            }
            PrimitiveKind::None => {}
        }

        self.slots.set_result(result);
    }
}

/// The Win64 classifier: four slots shared between integer and vector
/// registers, 32 bytes of shadow space, callee-destroyed parameters.
pub struct Win64Params {
    slots: Slots,
    member: bool,
}

impl Win64Params {
    pub fn new(member: bool) -> Win64Params {
        let mut slots = Slots::new(4, 4, 8, 16);
        slots.set_stack_extra(32);
        slots.set_callee_destroy();
        slots.set_unified();
        Win64Params { slots, member }
    }

    /// The register slot the hidden result pointer occupies: after the
    /// `this` pointer for member functions, first otherwise.
    fn result_index(&self) -> usize {
        if self.member {
            1
        } else {
            0
        }
    }
}

impl Params for Win64Params {
    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn slots_mut(&mut self) -> &mut Slots {
        &mut self.slots
    }

    fn register_src(&self, id: usize) -> Reg {
        const V: [Reg; 8] = [
            PTR_C,
            regs::PTR_D,
            regs::PTR_8,
            regs::PTR_9,
            regs::xmm(0),
            regs::xmm(1),
            regs::xmm(2),
            regs::xmm(3),
        ];
        V[id]
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
        self.slots.add_int(Param::new(id, size, 0, true));
    }

    fn add_simple(&mut self, id: u16, desc: &SimpleDesc) {
        // Aggregates that fit a single register are passed in one;
        // anything larger is passed by pointer.
        let size = desc.size().size64();
        let param = if size > 8 {
            Param::new(id, desc.size(), 0, true)
        } else if size > 4 {
            Param::new(id, Size::LONG, 0, false)
        } else if size > 1 {
            Param::new(id, Size::INT, 0, false)
        } else {
            Param::new(id, Size::BYTE, 0, false)
        };
        self.slots.add_int(param);
    }

    fn result_primitive(&mut self, p: Primitive) {
        let result = match p.kind {
            PrimitiveKind::None => ResultLoc::empty(),
            PrimitiveKind::Real => {
                ResultLoc::in_register(reg::as_size(regs::xmm(0), p.size).unwrap())
            }
            _ => ResultLoc::in_register(reg::as_size(PTR_A, p.size).unwrap()),
        };
        self.slots.set_result(result);
    }

    fn result_complex(&mut self, size: Size) {
        let index = self.result_index();
        self.slots
            .add_int_at(index, Param::new(RETURN_ID, size, 0, true));
        self.slots
            .set_result(ResultLoc::in_memory(self.register_src(index)));
    }

    fn result_simple(&mut self, desc: &SimpleDesc) {
        // Aggregate results are always returned in memory.
        let index = self.result_index();
        self.slots
            .add_int_at(index, Param::new(RETURN_ID, desc.size(), 0, true));
        self.slots
            .set_result(ResultLoc::in_memory(self.register_src(index)));
    }
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

    fn match_stack_param(p: &dyn Params, n: usize, id: u16, offset: u32) {
        let param = p.stack_param(n);
        assert_eq!(param.id(), id);
        assert_eq!(p.stack_offset(n), offset);
    }

    #[test]
    fn sysv_int_params() {
        let mut p = SysVParams::new();
        for i in 0..8 {
            p.add_primitive(i, int_primitive());
        }

        match_reg_param(&p, 0, 0, regs::PTR_DI);
        match_reg_param(&p, 1, 1, regs::PTR_SI);
        match_reg_param(&p, 2, 2, regs::PTR_D);
        match_reg_param(&p, 3, 3, PTR_C);
        match_reg_param(&p, 4, 4, regs::PTR_8);
        match_reg_param(&p, 5, 5, regs::PTR_9);
        match_stack_param(&p, 0, 6, 0);
        match_stack_param(&p, 1, 7, 8);
        assert_eq!(p.stack_total_size(), 16);
    }

    #[test]
    fn sysv_mixed_params() {
        let mut p = SysVParams::new();
        p.add_primitive(0, float_primitive());
        p.add_primitive(1, int_primitive());
        p.add_primitive(2, double_primitive());
        p.add_primitive(3, long_primitive());

        match_reg_param(&p, 0, 1, regs::PTR_DI);
        match_reg_param(&p, 1, 3, regs::PTR_SI);
        match_reg_param(&p, 6, 0, regs::xmm(0));
        match_reg_param(&p, 7, 2, regs::xmm(1));
    }

    #[test]
    fn sysv_two_eightbyte_pod() {
        // { ptr, ptr, ptr }: 24 bytes, goes on the stack.
        let big = SimpleDesc::new(
            Size::PTR + Size::PTR + Size::PTR,
            [
                ptr_primitive(),
                ptr_primitive().move_to(Offset::PTR),
                ptr_primitive().move_to(Offset::PTR * 2),
            ],
        );
        let mut p = SysVParams::new();
        p.add_simple(0, &big);
        assert_eq!(p.stack_count(), 1);

        // { long, long }: 16 bytes, split over two integer registers.
        let two = SimpleDesc::new(
            Size::LONG + Size::LONG,
            [long_primitive(), long_primitive().move_to(Offset::LONG)],
        );
        let mut p = SysVParams::new();
        p.add_simple(0, &two);
        let a = p.register_param(0).unwrap();
        let b = p.register_param(1).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8);
    }

    #[test]
    fn sysv_int_then_sse_eightbyte() {
        // { ptr, float, float }: first word integer class, second word SSE.
        let desc = SimpleDesc::new(
            Size::PTR + Size::FLOAT + Size::FLOAT,
            [
                ptr_primitive(),
                float_primitive().move_to(Offset::PTR),
                float_primitive().move_to(Offset::PTR + Offset::INT),
            ],
        );
        let mut p = SysVParams::new();
        p.add_simple(7, &desc);

        match_reg_param(&p, 0, 7, regs::PTR_DI);
        let fp = p.register_param(6).unwrap();
        assert_eq!(fp.id(), 7);
        assert_eq!(fp.offset(), 8);
    }

    #[test]
    fn sysv_complex_result_claims_rdi() {
        let mut p = SysVParams::new();
        p.result_complex(Size::PTR * 4);
        p.add_primitive(0, int_primitive());

        match_reg_param(&p, 0, RETURN_ID, regs::PTR_DI);
        match_reg_param(&p, 1, 0, regs::PTR_SI);
        assert_eq!(p.result().memory_register(), Some(regs::PTR_DI));
    }

    #[test]
    fn win64_absolute_slots() {
        let mut p = Win64Params::new(false);
        p.add_primitive(0, float_primitive());
        p.add_primitive(1, int_primitive());
        p.add_primitive(2, long_primitive());
        p.add_primitive(3, double_primitive());
        p.add_primitive(4, int_primitive());

        // Slot indices are absolute: a float in slot 0 consumes xmm0 and
        // the integer after it gets rdx, not rcx.
        match_reg_param(&p, 4, 0, regs::xmm(0));
        match_reg_param(&p, 1, 1, regs::PTR_D);
        match_reg_param(&p, 2, 2, regs::PTR_8);
        match_reg_param(&p, 7, 3, regs::xmm(3));
        match_stack_param(&p, 0, 4, 32);
    }

    #[test]
    fn win64_shadow_space_always_reserved() {
        let p = Win64Params::new(false);
        assert_eq!(p.stack_total_size(), 32);
    }

    #[test]
    fn win64_member_result_slot() {
        let mut p = Win64Params::new(true);
        p.result_simple(&SimpleDesc::new(
            Size::LONG + Size::LONG,
            [long_primitive(), long_primitive().move_to(Offset::LONG)],
        ));
        p.add_primitive(0, ptr_primitive()); // this
        p.add_primitive(1, int_primitive());

        // this in rcx, hidden result pointer in rdx, int in r8.
        match_reg_param(&p, 0, 0, PTR_C);
        match_reg_param(&p, 1, RETURN_ID, regs::PTR_D);
        match_reg_param(&p, 2, 1, regs::PTR_8);
    }

    #[test]
    fn win64_callee_destroys() {
        assert!(Win64Params::new(false).callee_destroy_params());
        assert!(!SysVParams::new().callee_destroy_params());
    }
}
