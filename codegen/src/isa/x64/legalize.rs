//! Operand legalization for x64.
//!
//! Rewrites a listing so that every instruction reaching the emitter is an
//! encodable form: one operand in a register for the two-operand group,
//! constants that fit an immediate field (wide ones move to a per-function
//! literal pool), shift counts in `cl`, the `rax:rdx` division protocol,
//! vector-register placement for floating point, and the lowering of the
//! `fn_*` call primitives. Scratch registers are taken from the complement
//! of the live set at each line.

use super::call::{emit_fn_call, ParamInfo};
use super::regs;
use super::X64Isa;
use crate::cond::CondFlag;
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::label::Label;
use crate::listing::{Block, Listing, Var};
use crate::liveness::used_regs;
use crate::op::Op;
use crate::operand::{
    byte_const, int_rel, long_rel, ptr_rel, word_const, x_rel, Operand, OperandKind,
};
use crate::reg::{self, Reg, RegSet, CL, RCX};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{Offset, Size};
use crate::transform::Transform;
use crate::ty::{PrimitiveKind, TypeDesc};

/// Does this constant survive sign-extension from 32 bits?
fn single_int(v: u64) -> bool {
    v as i64 == (v as i64 as i32) as i64
}

pub(super) struct Legalize<'a> {
    isa: &'a X64Isa,
    used: Vec<RegSet>,
    /// Constants too wide for an immediate field, emitted after the code.
    large: Vec<Operand>,
    lbl_large: Label,
    /// Lazily created target of the division-by-zero checks.
    lbl_div_zero: Option<Label>,
    params: Vec<ParamInfo>,
    /// Keys of parameters the ABI passes in memory.
    indirect: Vec<u32>,
    current_block: Block,
}

impl<'a> Legalize<'a> {
    pub fn new(isa: &'a X64Isa) -> Legalize<'a> {
        Legalize {
            isa,
            used: Vec::new(),
            large: Vec::new(),
            lbl_large: Label(u32::MAX),
            lbl_div_zero: None,
            params: Vec::new(),
            indirect: Vec::new(),
            current_block: Block(0),
        }
    }

    fn is_indirect_param(&self, l: &Listing, v: Var) -> bool {
        l.param_desc(v).is_some() && self.indirect.contains(&v.key())
    }

    fn is_indirect_operand(&self, l: &Listing, op: &Operand) -> bool {
        matches!(op.kind(), OperandKind::Var(v, _) if self.is_indirect_param(l, *v))
    }

    fn unused(&self, line: usize) -> CodegenResult<Reg> {
        regs::unused_reg(&self.used[line])
            .ok_or_else(|| CodegenError::invalid("no free register"))
    }

    fn unused_sized(&self, line: usize, size: Size) -> CodegenResult<Reg> {
        reg::as_size(self.unused(line)?, size)
            .ok_or_else(|| CodegenError::invalid("no register of the requested size"))
    }

    fn unused_fp(&self, line: usize, size: Size) -> CodegenResult<Reg> {
        let r = regs::unused_fp_reg(&self.used[line])
            .ok_or_else(|| CodegenError::invalid("no free vector register"))?;
        reg::as_size(r, size).ok_or_else(|| CodegenError::invalid("bad vector register size"))
    }

    fn div_zero_label(&mut self, dest: &mut Listing) -> Label {
        *self
            .lbl_div_zero
            .get_or_insert_with(|| dest.label())
    }

    /// Pool a constant, returning its position in the literal pool.
    fn pool(&mut self, value: Operand) -> Offset {
        let at = Offset::LONG * self.large.len() as i32;
        self.large.push(value);
        at
    }

    /// Move wide constants and label addresses into the literal pool.
    fn extract_numbers(&mut self, i: Inst) -> Inst {
        let src = i.src().clone();
        match src.kind() {
            OperandKind::Const(c) => {
                if src.size() == Size::LONG && !single_int(*c) {
                    let at = self.pool(src.clone());
                    return i.alter_src(long_rel(self.lbl_large, at));
                }
                // There is no move of an immediate into a vector register;
                // the value goes through the pool.
                if regs::fp_operand(i.dest()) {
                    let at = self.pool(word_const(*c));
                    return i.alter_src(x_rel(src.size(), self.lbl_large, at));
                }
                // Float immediates feeding a function parameter would
                // otherwise become a `mov xmm, imm`, which does not exist.
                if i.op() == Op::FnParam {
                    if let Some(TypeDesc::Primitive(p)) = i.ty().map(|t| &**t) {
                        if p.kind == PrimitiveKind::Real && src.size() == Size::FLOAT {
                            // Widen to keep the pool aligned.
                            let at = self.pool(word_const(*c));
                            return i.alter_src(int_rel(self.lbl_large, at));
                        }
                    }
                }
                i
            }
            // Label addresses are constants too.
            OperandKind::Label(_) => {
                let at = self.pool(src.clone());
                i.alter_src(ptr_rel(self.lbl_large, at))
            }
            _ => i,
        }
    }

    /// Dereference parameters passed in memory: the variable holds a
    /// pointer, so reads and writes go through a scratch register.
    fn extract_indirect(
        &mut self,
        l: &Listing,
        dest: &mut Listing,
        i: Inst,
        line: usize,
    ) -> CodegenResult<Inst> {
        let mut regs_now = self.used[line].clone();
        let mut i = i;

        if self.is_indirect_operand(l, i.src()) {
            let src = i.src().clone();
            let r = regs::unused_reg(&regs_now)
                .ok_or_else(|| CodegenError::invalid("no free register"))?;
            let r = reg::as_size(r, Size::PTR).unwrap();
            regs_now.put(r);
            dest.push(mov(r, ptr_rel(src.var(), Offset::ZERO)));
            i = i.alter_src(x_rel(src.size(), r, src.offset()));
        }

        if self.is_indirect_operand(l, i.dest()) {
            let d = i.dest().clone();
            let r = regs::unused_reg(&regs_now)
                .ok_or_else(|| CodegenError::invalid("no free register"))?;
            let r = reg::as_size(r, Size::PTR).unwrap();
            dest.push(mov(r, ptr_rel(d.var(), Offset::ZERO)));
            i = i.alter_dest(x_rel(d.size(), r, d.offset()));
        }

        Ok(i)
    }

    /*
     * The per-opcode rewrites.
     */

    /// The two-operand group: one operand must be a register, unless the
    /// source is an immediate.
    fn imm_reg(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let supported = match i.src().kind() {
            // A constant that survived extraction fits the immediate field.
            OperandKind::Const(_) | OperandKind::DualConst(..) | OperandKind::Reg(_) => true,
            _ => matches!(i.dest().kind(), OperandKind::Reg(_)),
        };
        if supported {
            dest.push(i);
            return Ok(());
        }

        let size = i.src().size();
        let r = self.unused_sized(line, size)?;
        dest.push(mov(r, i.src().clone()));
        dest.push(i.alter_src(r.into()));
        Ok(())
    }

    /// Destination must be a register; it is only written.
    fn dest_w_reg(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if matches!(i.dest().kind(), OperandKind::Reg(_)) {
            dest.push(i);
            return Ok(());
        }
        let r = self.unused_sized(line, i.dest().size())?;
        let d = i.dest().clone();
        dest.push(i.alter_dest(r.into()));
        dest.push(mov(d, r));
        Ok(())
    }

    /// Destination must be a register; it is read and written.
    fn dest_rw_reg(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if matches!(i.dest().kind(), OperandKind::Reg(_)) {
            dest.push(i);
            return Ok(());
        }
        let r = self.unused_sized(line, i.dest().size())?;
        let d = i.dest().clone();
        dest.push(mov(r, d.clone()));
        dest.push(i.alter_dest(r.into()));
        dest.push(mov(d, r));
        Ok(())
    }

    /// `imul` has no byte form; widen byte multiplies to 32 bits.
    fn mul_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        if i.size() != Size::BYTE {
            return self.dest_rw_reg(dest, i, line);
        }

        let mut used = self.used[line].clone();
        let d32 = reg::as_size(
            regs::unused_reg(&used).ok_or_else(|| CodegenError::invalid("no free register"))?,
            Size::INT,
        )
        .unwrap();
        used.put(d32);

        let d = i.dest().clone();
        dest.push(ucast(d32, d.clone()));
        let src = match i.src().kind() {
            OperandKind::Const(c) => crate::operand::int_const(*c as u8 as i32),
            _ => {
                let s32 = reg::as_size(
                    regs::unused_reg(&used)
                        .ok_or_else(|| CodegenError::invalid("no free register"))?,
                    Size::INT,
                )
                .unwrap();
                dest.push(ucast(s32, i.src().clone()));
                s32.into()
            }
        };
        dest.push(mul(d32, src));
        dest.push(mov(d, reg::as_size(d32, Size::BYTE).unwrap()));
        Ok(())
    }

    /// Shift counts live in `cl`.
    fn shift_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        match i.src().kind() {
            OperandKind::Reg(r) if *r == CL => {
                dest.push(i);
                return Ok(());
            }
            OperandKind::Const(c) => {
                // Counts beyond the operand width saturate to the width.
                let bits = i.dest().size().size64() * 8;
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

        if matches!(i.dest().kind(), OperandKind::Reg(_)) && reg::same(i.dest().reg(), RCX) {
            // The count wants cl but the destination is rcx; shift a copy.
            let r = self.unused_sized(line, size)?;
            let d = i.dest().clone();
            dest.push(mov(r, d.clone()));
            dest.push(mov(CL, i.src().resized(Size::BYTE)));
            dest.push(i.alter(r.into(), CL.into()));
            dest.push(mov(d, r));
        } else {
            let r = self.unused_sized(line, Size::LONG)?;
            dest.push(mov(r, RCX));
            dest.push(mov(CL, i.src().resized(Size::BYTE)));
            dest.push(i.alter_src(CL.into()));
            dest.push(mov(RCX, r));
        }
        Ok(())
    }

    /// Insert the division-by-zero check in front of a division.
    fn div_check(&mut self, dest: &mut Listing, divisor: &Operand) {
        let lbl = self.div_zero_label(dest);
        dest.push(cmp(
            divisor.clone(),
            crate::operand::Operand::new(OperandKind::Const(0), divisor.size()),
        ));
        dest.push(jmp(lbl, CondFlag::Equal));
    }

    /// The x64 division protocol: dividend in `rax`, `rdx` holds the sign
    /// or zero extension and receives the remainder.
    fn div_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize, modulo: bool) -> CodegenResult<()> {
        let mut used = self.used[line].clone();
        let mut i = i;
        let op = i.dest().clone();
        let small = op.size() == Size::BYTE;

        // A constant divisor moves into a register first.
        if matches!(i.src().kind(), OperandKind::Const(_)) {
            let r = reg::as_size(
                regs::unused_reg(&used).ok_or_else(|| CodegenError::invalid("no free register"))?,
                i.src().size(),
            )
            .ok_or_else(|| CodegenError::invalid("bad divisor size"))?;
            dest.push(mov(r, i.src().clone()));
            used.put(r);
            i = i.alter_src(r.into());
        }

        self.div_check(dest, i.src());

        // Preserve rdx if it is live and not the destination.
        let mut old_d = None;
        if !small && used.has(regs::PTR_D) {
            let dest_is_d =
                matches!(op.kind(), OperandKind::Reg(_)) && reg::same(op.reg(), regs::PTR_D);
            if !dest_is_d {
                let r = reg::as_size(
                    regs::unused_reg(&used)
                        .ok_or_else(|| CodegenError::invalid("no free register"))?,
                    Size::PTR,
                )
                .unwrap();
                dest.push(mov(r, regs::PTR_D));
                used.put(r);
                old_d = Some(r);
            }
        }

        let dest_is_a =
            matches!(op.kind(), OperandKind::Reg(_)) && reg::same(op.reg(), reg::PTR_A);

        if dest_is_a && !modulo {
            dest.push(i);
        } else {
            // Preserve rax if live and not overwritten by the result.
            let mut old_a = None;
            if used.has(reg::PTR_A) && !(dest_is_a && !modulo) {
                let r = reg::as_size(
                    regs::unused_reg(&used)
                        .ok_or_else(|| CodegenError::invalid("no free register"))?,
                    Size::PTR,
                )
                .unwrap();
                dest.push(mov(r, reg::PTR_A));
                used.put(r);
                old_a = Some(r);
            }

            let dest_a = reg::as_size(reg::PTR_A, op.size()).unwrap();
            if !matches!(op.kind(), OperandKind::Reg(r) if *r == dest_a) {
                dest.push(mov(dest_a, op.clone()));
            }

            if matches!(i.src().kind(), OperandKind::Reg(_)) && reg::same(i.src().reg(), reg::PTR_A)
            {
                // The divisor was in rax; use the preserved copy.
                let saved = old_a.ok_or_else(|| {
                    CodegenError::invalid("divisor in rax but rax not preserved")
                })?;
                i = i.alter(
                    dest_a.into(),
                    reg::as_size(saved, i.src().size()).unwrap().into(),
                );
            } else {
                i = i.alter_dest(dest_a.into());
            }
            dest.push(i);

            // Pick where the result lives.
            let mut result_reg = if modulo {
                reg::as_size(regs::PTR_D, op.size()).unwrap()
            } else {
                dest_a
            };
            if modulo && small {
                // The byte remainder lands in ah; shift it down.
                dest.push(shr(reg::EAX, byte_const(8)));
                result_reg = reg::AL;
            }

            // Rewrite a memory destination whose base was preserved.
            let mut out = op.clone();
            if let OperandKind::Rel(base, off) = *op.kind() {
                if reg::same(base, reg::PTR_A) {
                    let saved = old_a
                        .ok_or_else(|| CodegenError::invalid("destination base rax not preserved"))?;
                    out = x_rel(op.size(), saved, off);
                } else if reg::same(base, regs::PTR_D) {
                    let saved = old_d
                        .ok_or_else(|| CodegenError::invalid("destination base rdx not preserved"))?;
                    out = x_rel(op.size(), saved, off);
                }
            }

            if !matches!(out.kind(), OperandKind::Reg(r) if *r == result_reg) {
                dest.push(mov(out, result_reg));
            }

            if let Some(r) = old_a {
                dest.push(mov(reg::PTR_A, r));
            }
        }

        if let Some(r) = old_d {
            dest.push(mov(regs::PTR_D, r));
        }
        Ok(())
    }

    /*
     * Floating point.
     */

    fn load_fp_register(
        &mut self,
        dest: &mut Listing,
        op: &Operand,
        line: usize,
    ) -> CodegenResult<Reg> {
        if regs::fp_operand(op) {
            return Ok(op.reg());
        }
        let r = self.unused_fp(line, op.size())?;
        self.used[line].put(r);
        dest.push(mov(r, op.clone()));
        Ok(r)
    }

    fn load_fp_register_or_memory(
        &mut self,
        dest: &mut Listing,
        op: &Operand,
        line: usize,
    ) -> CodegenResult<Operand> {
        match op.kind() {
            OperandKind::Rel(..) | OperandKind::Var(..) | OperandKind::LabelRel(..) => {
                Ok(op.clone())
            }
            _ => Ok(self.load_fp_register(dest, op, line)?.into()),
        }
    }

    /// Vector arithmetic wants its destination in a register; sources may
    /// stay in memory.
    fn fp_instr(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let dst = i.dest().clone();

        let dst_reg = if i.mode().reads() {
            self.load_fp_register(dest, &dst, line)?
        } else if regs::fp_operand(&dst) {
            dst.reg()
        } else {
            // Not read, so no load; usage does not overlap the live set.
            self.unused_fp(line, dst.size())?
        };

        let src = self.load_fp_register_or_memory(dest, i.src(), line)?;
        dest.push(i.alter(dst_reg.into(), src));

        if i.mode().writes() && !matches!(dst.kind(), OperandKind::Reg(r) if *r == dst_reg) {
            dest.push(mov(dst, dst_reg));
        }
        Ok(())
    }

    /// Negation via the sign mask: there is no SSE negate instruction.
    fn fneg_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let dst = i.dest().clone();
        let size = dst.size();

        let mask = if size == Size::FLOAT {
            word_const(0x8000_0000)
        } else {
            word_const(0x8000_0000_0000_0000)
        };
        let at = self.pool(mask);

        let dst_reg = if regs::fp_operand(&dst) {
            dst.reg()
        } else {
            self.unused_fp(line, size)?
        };
        self.used[line].put(dst_reg);

        let mask_reg = self.unused_fp(line, size)?;
        dest.push(mov(mask_reg, x_rel(size, self.lbl_large, at)));

        if !matches!(i.src().kind(), OperandKind::Reg(r) if *r == dst_reg) {
            dest.push(mov(dst_reg, i.src().clone()));
        }
        dest.push(bxor(dst_reg, mask_reg));

        if !matches!(dst.kind(), OperandKind::Reg(r) if *r == dst_reg) {
            dest.push(mov(dst, dst_reg));
        }
        Ok(())
    }

    /// float -> signed integer: the destination must be an integer
    /// register.
    fn fcasti_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let src = self.load_fp_register_or_memory(dest, i.src(), line)?;
        let dst = i.dest().clone();
        if matches!(dst.kind(), OperandKind::Reg(_)) {
            dest.push(i.alter_src(src));
        } else {
            let r = self.unused_sized(line, dst.size())?;
            dest.push(i.alter(r.into(), src));
            dest.push(mov(dst, r));
        }
        Ok(())
    }

    /// float -> unsigned integer. 64-bit results need the
    /// compare-and-subtract scheme: values with the top bit set are out of
    /// range for the signed conversion the hardware offers.
    fn fcastu_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let src = self.load_fp_register_or_memory(dest, i.src(), line)?;
        let dst = i.dest().clone();

        if dst.size() == Size::LONG {
            let tmp = if matches!(dst.kind(), OperandKind::Reg(_)) && !regs::fp_operand(&dst) {
                reg::as_size(dst.reg(), Size::LONG).unwrap()
            } else {
                self.unused_sized(line, Size::LONG)?
            };
            self.used[line].put(tmp);
            let tmp2 = self.unused_sized(line, Size::LONG)?;
            self.used[line].put(tmp2);
            let fp = self.unused_fp(line, Size::DOUBLE)?;
            self.used[line].put(fp);
            let src_copy = self.unused_fp(line, Size::DOUBLE)?;

            let done = dest.label();
            let normal = dest.label();
            let zero = dest.label();

            // Work in doubles to make the cutoff exact.
            if src.size() != Size::DOUBLE {
                dest.push(fcast(src_copy, src));
            } else {
                dest.push(mov(src_copy, src));
            }

            // Negative inputs clamp to zero.
            dest.push(bxor(tmp, tmp));
            dest.push(ucastf(fp, tmp));
            dest.push(fcmp(fp, src_copy));
            dest.push(jmp(zero, CondFlag::FAboveEqual));

            // The largest value the signed conversion can represent.
            dest.push(mov(tmp, word_const(1)));
            dest.push(shl(tmp, byte_const(63)));
            dest.push(sub(tmp, word_const(1)));
            dest.push(icastf(fp, tmp));

            dest.push(fcmp(fp, src_copy));
            dest.push(jmp(normal, CondFlag::FAbove));

            // Too large: subtract the cutoff, convert, and add it back.
            dest.push(fsub(src_copy, fp));
            dest.push(fcastu(tmp2, src_copy));
            dest.push(add(tmp, tmp2));
            dest.push(jmp(done, CondFlag::Always));

            dest.mark(zero);
            dest.push(bxor(tmp, tmp));
            dest.push(jmp(done, CondFlag::Always));

            dest.mark(normal);
            dest.push(fcastu(tmp, src_copy));

            dest.mark(done);
            if !matches!(dst.kind(), OperandKind::Reg(r) if *r == tmp) {
                dest.push(mov(dst, tmp));
            }
        } else {
            // Narrow results convert through the 64-bit form.
            if let OperandKind::Reg(r) = *dst.kind() {
                let wide = reg::as_size(r, Size::LONG).unwrap();
                dest.push(i.alter(wide.into(), src));
                dest.push(ucast(dst, wide));
            } else {
                let r = self.unused_sized(line, Size::LONG)?;
                dest.push(i.alter(r.into(), src));
                dest.push(ucast(dst, r));
            }
        }
        Ok(())
    }

    /// signed integer -> float: the destination must be a vector register.
    fn icastf_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let dst = i.dest().clone();
        if regs::fp_operand(&dst) {
            dest.push(i);
        } else {
            let r = self.unused_fp(line, dst.size())?;
            dest.push(i.alter_dest(r.into()));
            dest.push(mov(dst, r));
        }
        Ok(())
    }

    /// unsigned integer -> float. A 64-bit source with the top bit set is
    /// corrected by adding 2^64 after the signed conversion.
    fn ucastf_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let src = i.src().clone();
        let dst = i.dest().clone();

        if src.size() == Size::LONG {
            let tmp = self.unused_sized(line, Size::LONG)?;
            self.used[line].put(tmp);
            let fp = if regs::fp_operand(&dst) {
                reg::as_size(dst.reg(), Size::DOUBLE).unwrap()
            } else {
                self.unused_fp(line, Size::DOUBLE)?
            };

            let done = dest.label();

            // 2^64 as a double.
            let fp_add: u64 = (64 + 1023) << 52;

            dest.push(mov(tmp, src.clone()));
            dest.push(ucastf(fp, src));
            // The shift moves the sign bit into the carry flag.
            dest.push(shl(tmp, byte_const(1)));
            dest.push(jmp(done, CondFlag::AboveEqual));
            let at = self.pool(word_const(fp_add));
            dest.push(fadd(fp, long_rel(self.lbl_large, at)));

            dest.mark(done);
            let mut fp = fp;
            if !(regs::fp_operand(&dst) && reg::same(fp, dst.reg())) {
                if dst.size() != fp.size() {
                    let narrowed = reg::as_size(fp, dst.size()).unwrap();
                    dest.push(fcast(narrowed, fp));
                    fp = narrowed;
                }
                dest.push(mov(dst, fp));
            }
        } else {
            // Zero-extend to 64 bits; the signed conversion is then exact.
            let wide = self.unused_sized(line, Size::LONG)?;
            dest.push(ucast(wide, src));

            if regs::fp_operand(&dst) {
                dest.push(i.alter_src(wide.into()));
            } else {
                let r = self.unused_fp(line, dst.size())?;
                dest.push(i.alter(r.into(), wide.into()));
                dest.push(mov(dst, r));
            }
        }
        Ok(())
    }

    /*
     * Function calls.
     */

    fn fn_param_unused_reg(&self, line: usize) -> CodegenResult<Reg> {
        let mut regs_now = self.used[line].clone();
        for p in &self.params {
            if p.src.has_register() {
                regs_now.put(p.src.reg());
            }
        }
        let r = regs::unused_reg(&regs_now)
            .ok_or_else(|| CodegenError::invalid("no free register for parameter"))?;
        Ok(reg::as_size(r, Size::PTR).unwrap())
    }

    fn fn_param_tfm(&mut self, l: &Listing, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let ty = i
            .ty()
            .cloned()
            .ok_or_else(|| CodegenError::invalid("fn_param without type information"))?;
        let src = i.src().clone();

        if self.is_indirect_operand(l, &src) {
            if src.offset().is_zero() {
                // The variable already holds the address.
                self.params
                    .push(ParamInfo::new(ty, ptr_rel(src.var(), Offset::ZERO), true));
            } else {
                let tmp = self.fn_param_unused_reg(line)?;
                dest.push(mov(tmp, ptr_rel(src.var(), Offset::ZERO)));
                self.params
                    .push(ParamInfo::new(ty, x_rel(src.size(), tmp, src.offset()), true));
            }
        } else {
            self.params.push(ParamInfo::new(ty, src, false));
        }
        Ok(())
    }

    fn fn_param_ref_tfm(
        &mut self,
        l: &Listing,
        dest: &mut Listing,
        i: Inst,
        line: usize,
    ) -> CodegenResult<()> {
        let ty = i
            .ty()
            .cloned()
            .ok_or_else(|| CodegenError::invalid("fn_param_ref without type information"))?;
        let mut src = i.src().clone();

        if self.is_indirect_operand(l, &src) {
            let tmp = self.fn_param_unused_reg(line)?;
            dest.push(mov(tmp, ptr_rel(src.var(), Offset::ZERO)));
            src = tmp.into();
        }
        self.params.push(ParamInfo::new(ty, src, true));
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
            i.member(),
            result_ref,
            self.current_block,
            &self.used[line],
            &mut params,
        )?;
        Ok(())
    }
}

impl<'a> Transform for Legalize<'a> {
    fn name(&self) -> &'static str {
        "legalize"
    }

    fn before(&mut self, dest: &mut Listing, src: &Listing) -> CodegenResult<()> {
        self.used = used_regs(Some(self.isa.dirty_regs()), src).at;
        self.lbl_large = dest.label();
        self.current_block = dest.root();

        // Find the parameters the ABI passes in memory, and adjust their
        // free policy: they are stored through a pointer, and under a
        // caller-destroy convention the caller, not this function, frees
        // them.
        let mut layout = self.isa.new_params_impl(src.member());
        let vars = src.all_params();
        for (i, v) in vars.iter().enumerate() {
            let desc = src
                .param_desc(*v)
                .cloned()
                .ok_or_else(|| CodegenError::invalid("parameter without a type"))?;
            layout.add(i as u16, &desc);
        }

        for n in 0..layout.total_count() {
            let p = match layout.total_param(n) {
                Some(p) => p,
                None => continue,
            };
            if p.id() == crate::abi::RETURN_ID || !p.in_memory() {
                continue;
            }

            let v = vars[p.id() as usize];
            self.indirect.push(v.key());

            let mut flags = dest.free_opt(v) | crate::listing::FreeOpt::INDIRECTION;
            if !layout.callee_destroy_params() {
                flags = flags
                    & !(crate::listing::FreeOpt::ON_EXCEPTION
                        | crate::listing::FreeOpt::ON_BLOCK_EXIT);
            }
            dest.set_free_opt(v, flags);
        }
        Ok(())
    }

    fn during(&mut self, dest: &mut Listing, src: &Listing, line: usize) -> CodegenResult<()> {
        let mut i = src.at(line).clone();

        match i.op() {
            // Handled later in the chain, or raw data; no operand
            // extraction.
            Op::Call | Op::FnCall | Op::FnCallRef | Op::Jmp | Op::Dat | Op::LblOffset => {}
            Op::FnParam | Op::FnParamRef => {
                // Indirect parameters are handled by the fn_param code;
                // the generic path breaks with more than one of them.
                i = self.extract_numbers(i);
            }
            _ => {
                i = self.extract_numbers(i);
                i = self.extract_indirect(src, dest, i, line)?;
            }
        }

        match i.op() {
            Op::Mov | Op::Add | Op::Adc | Op::Or | Op::And | Op::Sub | Op::Sbb | Op::Xor
            | Op::Cmp | Op::Test => self.imm_reg(dest, i, line),

            Op::Lea | Op::ICast | Op::UCast => self.dest_w_reg(dest, i, line),
            Op::Mul => self.mul_tfm(dest, i, line),

            Op::Prolog => {
                self.current_block = dest.root();
                dest.push(i);
                Ok(())
            }
            Op::BeginBlock => {
                self.current_block = i.src().block();
                // Hand the layout pass a register it may clobber.
                let r = reg::as_size(self.unused(line)?, Size::LONG).unwrap();
                dest.push(i.alter_dest(r.into()));
                Ok(())
            }
            Op::EndBlock => {
                let ended = i.src().block();
                self.current_block = src.parent(ended).unwrap_or_else(|| dest.root());
                dest.push(i);
                Ok(())
            }

            Op::FnParam => self.fn_param_tfm(src, dest, i, line),
            Op::FnParamRef => self.fn_param_ref_tfm(src, dest, i, line),
            Op::FnCall => self.fn_call_tfm(dest, i, line, false),
            Op::FnCallRef => self.fn_call_tfm(dest, i, line, true),

            Op::IDiv | Op::UDiv => self.div_tfm(dest, i, line, false),
            Op::IMod | Op::UMod => self.div_tfm(dest, i, line, true),

            Op::Shl | Op::Shr | Op::Sar => self.shift_tfm(dest, i, line),

            Op::FAdd | Op::FSub | Op::FMul | Op::FDiv | Op::FCmp | Op::FCast => {
                self.fp_instr(dest, i, line)
            }
            Op::FNeg => self.fneg_tfm(dest, i, line),
            Op::FCastI => self.fcasti_tfm(dest, i, line),
            Op::FCastU => self.fcastu_tfm(dest, i, line),
            Op::ICastF => self.icastf_tfm(dest, i, line),
            Op::UCastF => self.ucastf_tfm(dest, i, line),

            _ => {
                dest.push(i);
                Ok(())
            }
        }
    }

    fn after(&mut self, dest: &mut Listing, _src: &Listing) -> CodegenResult<()> {
        // The check target raises the runtime error; the call never
        // returns.
        if let Some(lbl) = self.lbl_div_zero {
            dest.mark(lbl);
            dest.push(call(self.isa.hooks().div_zero_ref()));
        }

        // The literal pool.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::RuntimeHooks;
    use crate::reg::{EAX, EBX};
    use crate::transform::transform;
    use crate::ty::int_desc;
    use target_lexicon::Triple;

    fn isa() -> X64Isa {
        let triple: Triple = "x86_64-unknown-linux-gnu".parse().unwrap();
        crate::isa::x64::concrete_isa(triple, RuntimeHooks::default())
    }

    fn sample() -> Listing {
        let mut l = Listing::with_result(int_desc(), false);
        let a = l.create_var(l.root(), Size::INT);
        let b = l.create_var(l.root(), Size::INT);
        let c = l.create_var(l.root(), Size::LONG);

        l.push(prolog());
        // Memory-to-memory forms, a wide constant, a shifted value.
        l.push(mov(Operand::from(a), Operand::from(b)));
        l.push(add(Operand::from(a), Operand::from(b)));
        l.push(mov(Operand::from(c), crate::operand::word_const(0x1234_5678_9ABC)));
        l.push(shl(EAX, EBX));
        l.push(mul(Operand::from(a), Operand::from(b)));
        l.push(fn_ret(EAX));
        l
    }

    /// Applying the operand legalization a second time changes nothing:
    /// its output only uses forms it accepts unchanged.
    #[test]
    fn idempotent_on_operand_forms() {
        let isa = isa();
        let src = sample();

        let once = transform(&src, &mut Legalize::new(&isa)).unwrap();
        let twice = transform(&once, &mut Legalize::new(&isa)).unwrap();

        let render = |l: &Listing| -> Vec<String> {
            l.insts().iter().map(|i| format!("{i:?}")).collect()
        };
        assert_eq!(render(&once), render(&twice));
    }

    #[test]
    fn wide_constants_move_to_the_pool() {
        let isa = isa();
        let src = sample();
        let once = transform(&src, &mut Legalize::new(&isa)).unwrap();

        // The wide constant now loads from a label-relative slot, and the
        // pool holds one entry.
        let uses_pool = once.insts().iter().any(|i| {
            i.op() == Op::Mov && matches!(i.src().kind(), OperandKind::LabelRel(..))
        });
        assert!(uses_pool);
        let pool_rows = once
            .insts()
            .iter()
            .filter(|i| i.op() == Op::Dat)
            .count();
        assert_eq!(pool_rows, 1);
    }
}
