//! Operand legalization for 32-bit x86.
//!
//! Follows the x64 rules for the integer subset, with two 32-bit
//! additions: 64-bit integer operations are split into lo/hi pairs using
//! the carry-propagating forms, and floating point goes through the x87
//! stack, which only works against memory operands.

use super::call::{emit_fn_call, ParamInfo};
use super::regs;
use super::X86Isa;
use crate::cond::CondFlag;
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::label::Label;
use crate::listing::{Block, Listing};
use crate::liveness::used_regs;
use crate::op::Op;
use crate::operand::{
    byte_const, int_const, int_rel, ptr_rel, word_const, x_rel, Operand, OperandKind,
};
use crate::reg::{self, Reg, RegSet, CL, ECX};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{Offset, Size};
use crate::transform::Transform;

pub(super) struct Legalize<'a> {
    isa: &'a X86Isa,
    used: Vec<RegSet>,
    large: Vec<Operand>,
    lbl_large: Label,
    lbl_div_zero: Option<Label>,
    params: Vec<ParamInfo>,
    current_block: Block,
}

impl<'a> Legalize<'a> {
    pub fn new(isa: &'a X86Isa) -> Legalize<'a> {
        Legalize {
            isa,
            used: Vec::new(),
            large: Vec::new(),
            lbl_large: Label(u32::MAX),
            lbl_div_zero: None,
            params: Vec::new(),
            current_block: Block(0),
        }
    }

    fn unused(&self, line: usize, size: Size) -> CodegenResult<Reg> {
        let r = if size == Size::BYTE {
            regs::unused_byte_reg(&self.used[line])
        } else {
            regs::unused_reg(&self.used[line])
        }
        .ok_or_else(|| CodegenError::invalid("no free register"))?;
        reg::as_size(r, size).ok_or_else(|| CodegenError::invalid("no register of that size"))
    }

    fn pool(&mut self, value: Operand) -> Offset {
        let at = Offset::LONG * self.large.len() as i32;
        self.large.push(value);
        at
    }

    fn div_zero_label(&mut self, dest: &mut Listing) -> Label {
        *self.lbl_div_zero.get_or_insert_with(|| dest.label())
    }

    /// Split a 64-bit operation into its 32-bit halves. The carry chain
    /// makes add/sub work; the bitwise group is independent per half.
    fn split_long(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let (lo_op, hi_op) = match i.op() {
            Op::Mov => (Op::Mov, Op::Mov),
            Op::Add => (Op::Add, Op::Adc),
            Op::Sub => (Op::Sub, Op::Sbb),
            Op::And => (Op::And, Op::And),
            Op::Or => (Op::Or, Op::Or),
            Op::Xor => (Op::Xor, Op::Xor),
            op => {
                return Err(CodegenError::invalid(format!(
                    "64-bit {op:?} is not supported on this target"
                )))
            }
        };

        let half = |op: &Operand, hi: bool| -> CodegenResult<Operand> {
            let extra = if hi { Offset::fixed(4) } else { Offset::ZERO };
            match op.kind() {
                OperandKind::Var(v, o) => Ok(x_rel(Size::INT, *v, *o + extra)),
                OperandKind::Rel(r, o) => Ok(x_rel(Size::INT, *r, *o + extra)),
                OperandKind::LabelRel(l, o) => Ok(x_rel(Size::INT, *l, *o + extra)),
                OperandKind::Const(c) => Ok(int_const(if hi {
                    (*c >> 32) as i32
                } else {
                    *c as i32
                })),
                OperandKind::DualConst(_, v64) => Ok(int_const(if hi {
                    (*v64 >> 32) as i32
                } else {
                    *v64 as i32
                })),
                _ => Err(CodegenError::invalid(
                    "64-bit operands must be in memory on this target",
                )),
            }
        };

        let lo = instr_loose(lo_op, half(i.dest(), false)?, half(i.src(), false)?);
        let hi = instr_loose(hi_op, half(i.dest(), true)?, half(i.src(), true)?);
        self.imm_reg(dest, lo, line)?;
        self.imm_reg(dest, hi, line)
    }

    fn imm_reg(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if i.size().size32() > 4 {
            return self.split_long(dest, i, line);
        }

        let supported = match i.src().kind() {
            OperandKind::Const(_) | OperandKind::DualConst(..) | OperandKind::Reg(_) => true,
            _ => matches!(i.dest().kind(), OperandKind::Reg(_)),
        };
        if supported {
            dest.push(i);
            return Ok(());
        }

        let r = self.unused(line, i.src().size())?;
        dest.push(mov(r, i.src().clone()));
        dest.push(i.alter_src(r.into()));
        Ok(())
    }

    fn dest_w_reg(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if matches!(i.dest().kind(), OperandKind::Reg(_)) {
            dest.push(i);
            return Ok(());
        }
        let r = self.unused(line, i.dest().size())?;
        let d = i.dest().clone();
        dest.push(i.alter_dest(r.into()));
        dest.push(mov(d, r));
        Ok(())
    }

    fn dest_rw_reg(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if matches!(i.dest().kind(), OperandKind::Reg(_)) {
            dest.push(i);
            return Ok(());
        }
        let r = self.unused(line, i.dest().size())?;
        let d = i.dest().clone();
        dest.push(mov(r, d.clone()));
        dest.push(i.alter_dest(r.into()));
        dest.push(mov(d, r));
        Ok(())
    }

    /// Widening casts to 64 bits write the two halves separately.
    fn cast_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize, signed: bool) -> CodegenResult<()> {
        let d_bytes = i.dest().size().size32();
        let s_bytes = i.src().size().size32();

        if d_bytes <= 4 && s_bytes <= 4 {
            return self.dest_w_reg(dest, i, line);
        }

        let half = |op: &Operand, hi: bool| -> CodegenResult<Operand> {
            let extra = if hi { Offset::fixed(4) } else { Offset::ZERO };
            match op.kind() {
                OperandKind::Var(v, o) => Ok(x_rel(Size::INT, *v, *o + extra)),
                OperandKind::Rel(r, o) => Ok(x_rel(Size::INT, *r, *o + extra)),
                _ => Err(CodegenError::invalid(
                    "64-bit operands must be in memory on this target",
                )),
            }
        };

        if d_bytes > 4 && s_bytes <= 4 {
            // Widen: store the low half, then the extension.
            let r = self.unused(line, Size::INT)?;
            if signed {
                dest.push(icast(r, i.src().clone()));
            } else {
                dest.push(ucast(r, i.src().clone()));
            }
            dest.push(mov(half(i.dest(), false)?, r));
            if signed {
                // Propagate the sign with a 31-bit arithmetic shift.
                dest.push(sar(r, byte_const(31)));
                dest.push(mov(half(i.dest(), true)?, r));
            } else {
                let zero = self.unused(line, Size::INT)?;
                dest.push(bxor(zero, zero));
                dest.push(mov(half(i.dest(), true)?, zero));
            }
            Ok(())
        } else {
            // Narrow: the low half is the value.
            let r = self.unused(line, i.dest().size())?;
            dest.push(mov(reg::as_size(r, Size::INT).unwrap(), half(i.src(), false)?));
            if d_bytes < 4 {
                dest.push(mov(i.dest().clone(), r));
            } else {
                dest.push(mov(i.dest().clone(), reg::as_size(r, Size::INT).unwrap()));
            }
            Ok(())
        }
    }

    fn shift_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        match i.src().kind() {
            OperandKind::Reg(r) if *r == CL => {
                dest.push(i);
                return Ok(());
            }
            OperandKind::Const(c) => {
                let bits = i.dest().size().size32() * 8;
                let i = if *c as u32 > bits {
                    i.alter_src(byte_const(bits as u8))
                } else {
                    i
                };
                dest.push(i);
                return Ok(());
            }
            _ => {}
        }

        let size = i.dest().size();
        if matches!(i.dest().kind(), OperandKind::Reg(_)) && reg::same(i.dest().reg(), ECX) {
            let r = self.unused(line, size)?;
            let d = i.dest().clone();
            dest.push(mov(r, d.clone()));
            dest.push(mov(CL, i.src().resized(Size::BYTE)));
            dest.push(i.alter(r.into(), CL.into()));
            dest.push(mov(d, r));
        } else {
            let r = self.unused(line, Size::INT)?;
            dest.push(mov(r, ECX));
            dest.push(mov(CL, i.src().resized(Size::BYTE)));
            dest.push(i.alter_src(CL.into()));
            dest.push(mov(ECX, r));
        }
        Ok(())
    }

    /// The eax:edx division protocol, as on x64 but with 32-bit names.
    fn div_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize, modulo: bool) -> CodegenResult<()> {
        if i.size().size32() > 4 {
            return Err(CodegenError::invalid(
                "64-bit division is not supported on this target",
            ));
        }

        let mut used = self.used[line].clone();
        let mut i = i;
        let op = i.dest().clone();
        let small = op.size() == Size::BYTE;

        if matches!(i.src().kind(), OperandKind::Const(_)) {
            let r = self.unused(line, i.src().size())?;
            dest.push(mov(r, i.src().clone()));
            used.put(r);
            i = i.alter_src(r.into());
        }

        let lbl = self.div_zero_label(dest);
        dest.push(cmp(
            i.src().clone(),
            Operand::new(OperandKind::Const(0), i.src().size()),
        ));
        dest.push(jmp(lbl, CondFlag::Equal));

        let mut old_d = None;
        if !small && used.has(regs::PTR_D) {
            let dest_is_d =
                matches!(op.kind(), OperandKind::Reg(_)) && reg::same(op.reg(), regs::PTR_D);
            if !dest_is_d {
                let r = self.unused(line, Size::PTR)?;
                dest.push(mov(r, regs::EDX));
                used.put(r);
                old_d = Some(r);
            }
        }

        let dest_is_a =
            matches!(op.kind(), OperandKind::Reg(_)) && reg::same(op.reg(), reg::PTR_A);

        if dest_is_a && !modulo {
            dest.push(i);
        } else {
            let mut old_a = None;
            if used.has(reg::PTR_A) {
                let r = self.unused(line, Size::PTR)?;
                dest.push(mov(r, reg::EAX));
                used.put(r);
                old_a = Some(r);
            }

            let dest_a = reg::as_size(reg::PTR_A, op.size()).unwrap();
            if !matches!(op.kind(), OperandKind::Reg(r) if *r == dest_a) {
                dest.push(mov(dest_a, op.clone()));
            }

            if matches!(i.src().kind(), OperandKind::Reg(_)) && reg::same(i.src().reg(), reg::PTR_A)
            {
                let saved = old_a.ok_or_else(|| {
                    CodegenError::invalid("divisor in eax but eax not preserved")
                })?;
                i = i.alter(
                    dest_a.into(),
                    reg::as_size(saved, i.src().size()).unwrap().into(),
                );
            } else {
                i = i.alter_dest(dest_a.into());
            }
            dest.push(i);

            let mut result_reg = if modulo {
                reg::as_size(regs::EDX, op.size()).unwrap()
            } else {
                dest_a
            };
            if modulo && small {
                dest.push(shr(reg::EAX, byte_const(8)));
                result_reg = reg::AL;
            }

            let mut out = op.clone();
            if let OperandKind::Rel(base, off) = *op.kind() {
                if reg::same(base, reg::PTR_A) {
                    let saved = old_a
                        .ok_or_else(|| CodegenError::invalid("destination base eax not preserved"))?;
                    out = x_rel(op.size(), saved, off);
                } else if reg::same(base, regs::PTR_D) {
                    let saved = old_d
                        .ok_or_else(|| CodegenError::invalid("destination base edx not preserved"))?;
                    out = x_rel(op.size(), saved, off);
                }
            }

            if !matches!(out.kind(), OperandKind::Reg(r) if *r == result_reg) {
                dest.push(mov(out, result_reg));
            }

            if let Some(r) = old_a {
                dest.push(mov(reg::EAX, r));
            }
        }

        if let Some(r) = old_d {
            dest.push(mov(regs::EDX, r));
        }
        Ok(())
    }

    /// Place a floating-point operand in memory for the x87 stack ops,
    /// spilling constants to the pool and registers to a fresh variable.
    fn fp_memory(
        &mut self,
        dest: &mut Listing,
        op: &Operand,
    ) -> CodegenResult<Operand> {
        match op.kind() {
            OperandKind::Var(..) | OperandKind::Rel(..) | OperandKind::LabelRel(..) => {
                Ok(op.clone())
            }
            OperandKind::Const(c) => {
                let at = self.pool(word_const(*c));
                Ok(x_rel(op.size(), self.lbl_large, at))
            }
            OperandKind::Reg(_) => {
                let v = dest.create_var(self.current_block, op.size());
                dest.push(mov(Operand::from(v), op.clone()));
                Ok(v.into())
            }
            _ => Err(CodegenError::invalid(format!(
                "unsupported floating-point operand: {op:?}"
            ))),
        }
    }

    /// x87 arithmetic works against memory; both sides of the operation
    /// are forced there. A register destination goes through a variable
    /// and is written back afterwards.
    fn fp_instr(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let d0 = i.dest().clone();
        let (d, back) = match d0.kind() {
            OperandKind::Reg(_) => {
                let v = dest.create_var(self.current_block, d0.size());
                if i.mode().reads() {
                    dest.push(mov(Operand::from(v), d0.clone()));
                }
                (Operand::from(v), Some((d0, v)))
            }
            OperandKind::None => (d0, None),
            _ => (self.fp_memory(dest, &d0)?, None),
        };
        let s = if i.src().any() {
            self.fp_memory(dest, &i.src().clone())?
        } else {
            Operand::none()
        };

        if i.op() == Op::FCmp {
            // The comparison reads the status word through eax.
            let eax_live = self.used[line].has(reg::PTR_A);
            if eax_live {
                dest.push(push(reg::EAX));
            }
            dest.push(i.alter(d, s));
            if eax_live {
                dest.push(pop(reg::EAX));
            }
            return Ok(());
        }

        let writes = i.mode().writes();
        dest.push(i.alter(d, s));
        if writes {
            if let Some((reg_dest, v)) = back {
                dest.push(mov(reg_dest, Operand::from(v)));
            }
        }
        Ok(())
    }

    fn fcastu_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if i.dest().size().size32() > 4 {
            return Err(CodegenError::invalid(
                "converting to 64-bit unsigned is not supported on this target",
            ));
        }
        // Truncate through a 64-bit signed result: the unsigned 32-bit
        // range fits it.
        let s = self.fp_memory(dest, &i.src().clone())?;
        let tmp = dest.create_var(self.current_block, Size::LONG);
        dest.push(fcasti(Operand::from(tmp), s));
        let lo = int_rel(tmp, Offset::ZERO);
        if matches!(i.dest().kind(), OperandKind::Reg(_)) {
            dest.push(mov(i.dest().clone(), lo));
        } else {
            let r = self.unused(line, Size::INT)?;
            dest.push(mov(r, lo));
            dest.push(mov(i.dest().clone(), r));
        }
        Ok(())
    }

    fn ucastf_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let src = i.src().clone();
        let dst = self.fp_memory(dest, &i.dest().clone())?;

        if src.size().size32() > 4 {
            // Load as 64-bit signed, then add 2^64 when the sign bit was
            // set: the documented x87 dance.
            let v = match src.kind() {
                OperandKind::Var(..) | OperandKind::Rel(..) => src.clone(),
                _ => {
                    return Err(CodegenError::invalid(
                        "64-bit operands must be in memory on this target",
                    ))
                }
            };
            let done = dest.label();
            dest.push(icastf(dst.clone(), v.clone()));
            let hi = match v.kind() {
                OperandKind::Var(var, o) => x_rel(Size::INT, *var, *o + Offset::fixed(4)),
                OperandKind::Rel(r, o) => x_rel(Size::INT, *r, *o + Offset::fixed(4)),
                _ => unreachable!(),
            };
            dest.push(cmp(hi, int_const(0)));
            dest.push(jmp(done, CondFlag::GreaterEqual));
            // 2^64 as a double.
            let at = self.pool(word_const((64u64 + 1023) << 52));
            dest.push(fadd(dst, x_rel(Size::DOUBLE, self.lbl_large, at)));
            dest.mark(done);
            return Ok(());
        }

        // Zero-extend to 64 bits in a temporary, then convert signed.
        let tmp = dest.create_var(self.current_block, Size::LONG);
        let r = self.unused(line, Size::INT)?;
        dest.push(mov(r, src));
        dest.push(mov(int_rel(tmp, Offset::ZERO), r));
        dest.push(bxor(r, r));
        dest.push(mov(int_rel(tmp, Offset::fixed(4)), r));
        dest.push(icastf(dst, Operand::from(tmp)));
        Ok(())
    }

    fn fn_call_tfm(
        &mut self,
        dest: &mut Listing,
        i: Inst,
        line: usize,
        result_ref: bool,
    ) -> CodegenResult<()> {
        let ty = i
            .ty()
            .cloned()
            .ok_or_else(|| CodegenError::invalid("fn_call without type information"))?;
        let mut params = std::mem::take(&mut self.params);
        emit_fn_call(
            self.isa,
            dest,
            i.src().clone(),
            i.dest().clone(),
            &ty,
            result_ref,
            self.current_block,
            &self.used[line],
            &mut params,
        )
    }
}

impl<'a> Transform for Legalize<'a> {
    fn name(&self) -> &'static str {
        "legalize (x86)"
    }

    fn before(&mut self, dest: &mut Listing, src: &Listing) -> CodegenResult<()> {
        self.used = used_regs(Some(self.isa.dirty_regs()), src).at;
        self.lbl_large = dest.label();
        self.current_block = dest.root();
        // cdecl passes everything by value on the stack, so there are no
        // indirect parameters to rewrite.
        Ok(())
    }

    fn during(&mut self, dest: &mut Listing, src: &Listing, line: usize) -> CodegenResult<()> {
        let mut i = src.at(line).clone();

        match i.op() {
            Op::Call | Op::FnCall | Op::FnCallRef | Op::Jmp | Op::Dat | Op::LblOffset
            | Op::FnParam | Op::FnParamRef => {}
            _ => {
                if matches!(i.src().kind(), OperandKind::Label(_)) {
                    let at = self.pool(i.src().clone());
                    i = i.alter_src(ptr_rel(self.lbl_large, at));
                }
            }
        }

        match i.op() {
            Op::Mov | Op::Add | Op::Adc | Op::Or | Op::And | Op::Sub | Op::Sbb | Op::Xor => {
                self.imm_reg(dest, i, line)
            }
            Op::Cmp | Op::Test => {
                if i.size().size32() > 4 {
                    return Err(CodegenError::invalid(
                        "64-bit comparison is not supported on this target",
                    ));
                }
                self.imm_reg(dest, i, line)
            }

            Op::Lea => self.dest_w_reg(dest, i, line),
            Op::ICast => self.cast_tfm(dest, i, line, true),
            Op::UCast => self.cast_tfm(dest, i, line, false),
            Op::Mul => {
                if i.size().size32() > 4 {
                    return Err(CodegenError::invalid(
                        "64-bit multiplication is not supported on this target",
                    ));
                }
                self.dest_rw_reg(dest, i, line)
            }

            Op::Prolog => {
                self.current_block = dest.root();
                dest.push(i);
                Ok(())
            }
            Op::BeginBlock => {
                self.current_block = i.src().block();
                let r = regs::unused_reg(&self.used[line])
                    .ok_or_else(|| CodegenError::invalid("no free register"))?;
                dest.push(i.alter_dest(r.into()));
                Ok(())
            }
            Op::EndBlock => {
                let ended = i.src().block();
                self.current_block = src.parent(ended).unwrap_or_else(|| dest.root());
                dest.push(i);
                Ok(())
            }

            Op::FnParam | Op::FnParamRef => {
                let ty = i
                    .ty()
                    .cloned()
                    .ok_or_else(|| CodegenError::invalid("fn_param without type information"))?;
                self.params.push(ParamInfo::new(
                    ty,
                    i.src().clone(),
                    i.op() == Op::FnParamRef,
                ));
                Ok(())
            }
            Op::FnCall => self.fn_call_tfm(dest, i, line, false),
            Op::FnCallRef => self.fn_call_tfm(dest, i, line, true),

            Op::IDiv | Op::UDiv => self.div_tfm(dest, i, line, false),
            Op::IMod | Op::UMod => self.div_tfm(dest, i, line, true),

            Op::Shl | Op::Shr | Op::Sar => self.shift_tfm(dest, i, line),

            Op::FAdd | Op::FSub | Op::FMul | Op::FDiv | Op::FCmp | Op::FCast | Op::FNeg
            | Op::FCastI | Op::ICastF | Op::FLd | Op::FStp => self.fp_instr(dest, i, line),
            Op::FCastU => self.fcastu_tfm(dest, i, line),
            Op::UCastF => self.ucastf_tfm(dest, i, line),

            _ => {
                dest.push(i);
                Ok(())
            }
        }
    }

    fn after(&mut self, dest: &mut Listing, _src: &Listing) -> CodegenResult<()> {
        if let Some(lbl) = self.lbl_div_zero {
            dest.mark(lbl);
            dest.push(call(self.isa.hooks().div_zero_ref()));
        }

        if !self.large.is_empty() {
            dest.push(align_as(Size::PTR));
        }
        dest.mark(self.lbl_large);
        for op in std::mem::take(&mut self.large) {
            dest.push(dat(op));
        }
        Ok(())
    }
}
