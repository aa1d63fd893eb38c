//! Operand legalization for AArch64.
//!
//! AArch64 is a load/store machine: arithmetic only works on registers,
//! so memory operands are loaded into scratch registers (x16/x17 as the
//! last resort, which the client is forbidden to use) and stored back
//! after the operation. Byte operands of compares, divisions and shifts
//! are widened to 32 bits first; those operations only exist at 32 and 64
//! bits. Wide floating-point constants and label addresses move to a
//! pc-relative literal pool after the code.

use super::call::{emit_fn_call, ParamInfo};
use super::regs;
use super::Aarch64Isa;
use crate::cond::CondFlag;
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::label::Label;
use crate::listing::{Block, Listing};
use crate::liveness::used_regs;
use crate::op::Op;
use crate::operand::{ptr_rel, word_const, x_rel, Operand, OperandKind};
use crate::reg::{self, Reg, RegSet};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{Offset, Size};
use crate::transform::Transform;

/// Fits the 12-bit unsigned immediate of add/sub/cmp?
fn fits_imm12(v: u64) -> bool {
    v < 4096
}

pub(super) struct Legalize<'a> {
    isa: &'a Aarch64Isa,
    used: Vec<RegSet>,
    large: Vec<Operand>,
    lbl_large: Label,
    lbl_div_zero: Option<Label>,
    params: Vec<ParamInfo>,
    indirect: Vec<u32>,
    current_block: Block,
}

impl<'a> Legalize<'a> {
    pub fn new(isa: &'a Aarch64Isa) -> Legalize<'a> {
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

    fn is_indirect(&self, op: &Operand) -> bool {
        matches!(op.kind(), OperandKind::Var(v, _) if self.indirect.contains(&v.key()))
    }

    fn pool(&mut self, value: Operand) -> Offset {
        let at = Offset::LONG * self.large.len() as i32;
        self.large.push(value);
        at
    }

    fn div_zero_label(&mut self, dest: &mut Listing) -> Label {
        *self.lbl_div_zero.get_or_insert_with(|| dest.label())
    }

    /// Load pointer-indirect parameters through a scratch register.
    fn extract_indirect(&mut self, dest: &mut Listing, i: Inst, line: usize) -> Inst {
        let mut regs_now = self.used[line].clone();
        let mut i = i;

        if self.is_indirect(i.src()) {
            let src = i.src().clone();
            let r = reg::as_size(regs::unused_reg(&regs_now), Size::PTR).unwrap();
            regs_now.put(r);
            dest.push(mov(r, ptr_rel(src.var(), Offset::ZERO)));
            i = i.alter_src(x_rel(src.size(), r, src.offset()));
        }
        if self.is_indirect(i.dest()) {
            let d = i.dest().clone();
            let r = reg::as_size(regs::unused_reg(&regs_now), Size::PTR).unwrap();
            dest.push(mov(r, ptr_rel(d.var(), Offset::ZERO)));
            i = i.alter_dest(x_rel(d.size(), r, d.offset()));
        }
        i
    }

    fn scratch(&self, used: &mut RegSet, size: Size) -> Reg {
        let r = regs::unused_reg(used);
        used.put(r);
        reg::as_size(r, size).unwrap_or(r)
    }

    /// Load `op` into a register if it is not one already. The register
    /// class comes from the consuming operation, not from the size: a
    /// four-byte operand is a float only when a vector op touches it.
    fn to_reg(
        &mut self,
        dest: &mut Listing,
        used: &mut RegSet,
        op: &Operand,
        fp: bool,
    ) -> CodegenResult<Operand> {
        match op.kind() {
            OperandKind::Reg(_) => Ok(op.clone()),
            OperandKind::Const(_) | OperandKind::DualConst(..) => {
                let r = self.scratch(used, op.size());
                dest.push(mov(r, op.clone()));
                Ok(r.into())
            }
            OperandKind::Rel(..) | OperandKind::Var(..) | OperandKind::LabelRel(..) => {
                let r = if fp {
                    let v = regs::unused_fp_reg(used)
                        .ok_or_else(|| CodegenError::invalid("no free vector register"))?;
                    used.put(v);
                    reg::as_size(v, op.size()).unwrap()
                } else {
                    self.scratch(used, op.size())
                };
                dest.push(mov(r, op.clone()));
                Ok(r.into())
            }
            _ => Err(CodegenError::invalid(format!(
                "operand {op:?} can not be loaded"
            ))),
        }
    }

    /// The general three-step rewrite for integer operations: load,
    /// operate, store back.
    fn reg_op(
        &mut self,
        dest: &mut Listing,
        i: Inst,
        line: usize,
        src_imm12: bool,
    ) -> CodegenResult<()> {
        let mut used = self.used[line].clone();
        let mut i = i;

        // The source: register, or a small immediate where permitted.
        let src_ok = match i.src().kind() {
            OperandKind::Reg(_) => true,
            OperandKind::Const(c) => src_imm12 && fits_imm12(*c),
            OperandKind::DualConst(a, b) => {
                src_imm12 && fits_imm12(*a as u64) && fits_imm12(*b as u64)
            }
            _ => false,
        };
        if !src_ok && i.src().any() {
            let loaded = self.to_reg(dest, &mut used, &i.src().clone(), false)?;
            i = i.alter_src(loaded);
        }

        // The destination must be a register.
        if i.dest().any() && !matches!(i.dest().kind(), OperandKind::Reg(_)) {
            let d = i.dest().clone();
            let r = self.scratch(&mut used, d.size());
            if i.mode().reads() {
                dest.push(mov(r, d.clone()));
            }
            let writes = i.mode().writes();
            dest.push(i.alter_dest(r.into()));
            if writes {
                dest.push(mov(d, r));
            }
            return Ok(());
        }

        dest.push(i);
        Ok(())
    }

    /// Compares, divisions and shifts only exist at 32 and 64 bits; byte
    /// operands are extended into fresh 32-bit registers first. Returns
    /// the widened instruction and, for a written destination, the
    /// low-byte store the caller must append after the operation.
    fn promote_bytes(
        &mut self,
        dest: &mut Listing,
        i: Inst,
        line: usize,
        signed: bool,
    ) -> CodegenResult<(Inst, Option<(Operand, Reg)>)> {
        if i.size() != Size::BYTE {
            return Ok((i, None));
        }
        let mut used = self.used[line].clone();
        let mut i = i;
        let mut writeback = None;

        let extend = |dest: &mut Listing, this: &mut Self, used: &mut RegSet, op: &Operand| {
            let r = this.scratch(used, Size::INT);
            // Memory operands go through a byte load first; the extension
            // itself works register to register.
            let from = if matches!(op.kind(), OperandKind::Reg(_)) {
                op.clone()
            } else {
                let b = reg::as_size(r, Size::BYTE).unwrap();
                dest.push(mov(b, op.clone()));
                b.into()
            };
            if signed {
                dest.push(icast(r, from));
            } else {
                dest.push(ucast(r, from));
            }
            r
        };

        if i.dest().any() {
            let d = i.dest().clone();
            let r = extend(dest, self, &mut used, &d);
            if i.mode().writes() {
                writeback = Some((d, r));
            }
            i = i.alter_dest(r.into());
        }
        if i.src().any() {
            match i.src().kind() {
                OperandKind::Const(c) => {
                    i = i.alter_src(crate::operand::int_const(*c as u8 as i32));
                }
                _ => {
                    let s = extend(dest, self, &mut used, &i.src().clone());
                    i = i.alter_src(s.into());
                }
            }
        }
        Ok((i, writeback))
    }

    /// Append the low-byte store a promoted operation owes.
    fn write_back(dest: &mut Listing, writeback: Option<(Operand, Reg)>) {
        if let Some((d, r)) = writeback {
            dest.push(mov(d, reg::as_size(r, Size::BYTE).unwrap()));
        }
    }

    fn div_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize, signed: bool) -> CodegenResult<()> {
        let (i, writeback) = self.promote_bytes(dest, i, line, signed)?;

        let mut used = self.used[line].clone();
        let mut i = i;
        if !matches!(i.src().kind(), OperandKind::Reg(_)) {
            let loaded = self.to_reg(dest, &mut used, &i.src().clone(), false)?;
            i = i.alter_src(loaded);
        }

        let lbl = self.div_zero_label(dest);
        dest.push(cmp(
            i.src().clone(),
            Operand::new(OperandKind::Const(0), i.src().size()),
        ));
        dest.push(jmp(lbl, CondFlag::Equal));

        self.reg_op(dest, i, line, false)?;
        Self::write_back(dest, writeback);
        Ok(())
    }

    /// Vector arithmetic needs both operands in vector registers.
    fn fp_instr(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let mut used = self.used[line].clone();
        let mut i = i;

        if !regs::fp_operand(i.src()) && i.src().any() {
            let loaded = self.to_reg(dest, &mut used, &i.src().clone(), true)?;
            i = i.alter_src(loaded);
        }

        if i.dest().any() && !regs::fp_operand(i.dest()) {
            let d = i.dest().clone();
            let fp = regs::unused_fp_reg(&used)
                .ok_or_else(|| CodegenError::invalid("no free vector register"))?;
            let r = reg::as_size(fp, d.size()).unwrap();
            if i.mode().reads() {
                dest.push(mov(r, d.clone()));
            }
            let writes = i.mode().writes();
            dest.push(i.alter_dest(r.into()));
            if writes {
                dest.push(mov(d, r));
            }
            return Ok(());
        }

        dest.push(i);
        Ok(())
    }

    /// Conversions between integers and floats want one side in a general
    /// register and the other in a vector register.
    fn convert_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize, to_fp: bool) -> CodegenResult<()> {
        let mut used = self.used[line].clone();
        let mut i = i;

        if !matches!(i.src().kind(), OperandKind::Reg(_)) {
            // Converting to a float reads an integer source, and the
            // other way around.
            let loaded = self.to_reg(dest, &mut used, &i.src().clone(), !to_fp)?;
            i = i.alter_src(loaded);
        }

        let d = i.dest().clone();
        let dest_ok = if to_fp {
            regs::fp_operand(&d)
        } else {
            matches!(d.kind(), OperandKind::Reg(r) if !regs::fp_register(*r))
        };
        if dest_ok {
            dest.push(i);
        } else {
            let r = if to_fp {
                let fp = regs::unused_fp_reg(&used)
                    .ok_or_else(|| CodegenError::invalid("no free vector register"))?;
                reg::as_size(fp, d.size()).unwrap()
            } else {
                self.scratch(&mut used, d.size())
            };
            dest.push(i.alter_dest(r.into()));
            dest.push(mov(d, r));
        }
        Ok(())
    }

    fn mov_tfm(&mut self, dest: &mut Listing, i: Inst, line: usize) -> CodegenResult<()> {
        let mut used = self.used[line].clone();
        let dst_mem = !matches!(i.dest().kind(), OperandKind::Reg(_));
        let src_mem = matches!(
            i.src().kind(),
            OperandKind::Rel(..) | OperandKind::Var(..) | OperandKind::LabelRel(..)
        );
        let src_const = matches!(
            i.src().kind(),
            OperandKind::Const(_) | OperandKind::DualConst(..) | OperandKind::Ref(_) | OperandKind::Obj(_)
        );

        // Wide floating-point constants come from the literal pool.
        if regs::fp_operand(i.dest()) {
            if let OperandKind::Const(c) = *i.src().kind() {
                let at = self.pool(word_const(c));
                let size = i.src().size();
                dest.push(i.alter_src(x_rel(size, self.lbl_large, at)));
                return Ok(());
            }
        }

        if dst_mem && (src_mem || src_const) {
            // Memory to memory, or an immediate store: via a register.
            // Plain integer moves copy float bits fine.
            let loaded = self.to_reg(dest, &mut used, &i.src().clone(), false)?;
            dest.push(i.alter_src(loaded));
            return Ok(());
        }

        dest.push(i);
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
        )
    }
}

impl<'a> Transform for Legalize<'a> {
    fn name(&self) -> &'static str {
        "legalize (aarch64)"
    }

    fn before(&mut self, dest: &mut Listing, src: &Listing) -> CodegenResult<()> {
        self.used = used_regs(Some(self.isa.dirty_regs()), src).at;
        self.lbl_large = dest.label();
        self.current_block = dest.root();

        let mut layout = self.isa.new_params_impl();
        let vars = src.all_params();
        for (i, v) in vars.iter().enumerate() {
            let desc = src
                .param_desc(*v)
                .cloned()
                .ok_or_else(|| CodegenError::invalid("parameter without a type"))?;
            layout.add(i as u16, &desc);
        }

        use crate::abi::Params as _;
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

            // Callers destroy in-memory parameters under the AAPCS; this
            // function only stores the pointer.
            let flags = (dest.free_opt(v) | crate::listing::FreeOpt::INDIRECTION)
                & !(crate::listing::FreeOpt::ON_EXCEPTION | crate::listing::FreeOpt::ON_BLOCK_EXIT);
            dest.set_free_opt(v, flags);
        }
        Ok(())
    }

    fn during(&mut self, dest: &mut Listing, src: &Listing, line: usize) -> CodegenResult<()> {
        let mut i = src.at(line).clone();

        match i.op() {
            Op::Call | Op::FnCall | Op::FnCallRef | Op::Jmp | Op::Dat | Op::LblOffset => {}
            Op::FnParam | Op::FnParamRef => {}
            _ => {
                // Label addresses come from the literal pool.
                if matches!(i.src().kind(), OperandKind::Label(_)) && i.op() != Op::Jmp {
                    let at = self.pool(i.src().clone());
                    i = i.alter_src(ptr_rel(self.lbl_large, at));
                }
                i = self.extract_indirect(dest, i, line);
            }
        }

        match i.op() {
            Op::Mov => self.mov_tfm(dest, i, line),
            // The address is wanted, not the value: the source stays a
            // memory operand.
            Op::Lea => {
                if matches!(i.dest().kind(), OperandKind::Reg(_)) {
                    dest.push(i);
                } else {
                    let mut used = self.used[line].clone();
                    let d = i.dest().clone();
                    let r = self.scratch(&mut used, Size::PTR);
                    dest.push(i.alter_dest(r.into()));
                    dest.push(mov(d, r));
                }
                Ok(())
            }
            Op::ICast | Op::UCast => self.reg_op(dest, i, line, false),

            Op::Add | Op::Sub => self.reg_op(dest, i, line, true),
            Op::Adc | Op::Sbb | Op::Or | Op::And | Op::Xor | Op::Mul | Op::Not => {
                self.reg_op(dest, i, line, false)
            }
            Op::Test => self.reg_op(dest, i, line, false),
            Op::Cmp => {
                let (i, _) = self.promote_bytes(dest, i, line, true)?;
                self.reg_op(dest, i, line, true)
            }

            Op::Shl | Op::Shr | Op::Sar => {
                let signed = i.op() == Op::Sar;
                let was_byte = i.size() == Size::BYTE;
                let (i, writeback) = self.promote_bytes(dest, i, line, signed)?;
                match i.src().kind() {
                    // Counts beyond the width saturate to the width; a
                    // promoted byte still shifts by at most eight.
                    OperandKind::Const(c) => {
                        let bits = if was_byte {
                            8
                        } else {
                            i.dest().size().size64() * 8
                        };
                        let i = if *c as u32 > bits {
                            i.alter_src(crate::operand::byte_const(bits as u8))
                        } else {
                            i
                        };
                        self.reg_op(dest, i, line, true)?;
                    }
                    _ => self.reg_op(dest, i, line, false)?,
                }
                Self::write_back(dest, writeback);
                Ok(())
            }

            Op::IDiv | Op::IMod => self.div_tfm(dest, i, line, true),
            Op::UDiv | Op::UMod => self.div_tfm(dest, i, line, false),

            Op::Prolog => {
                self.current_block = dest.root();
                dest.push(i);
                Ok(())
            }
            Op::BeginBlock => {
                self.current_block = i.src().block();
                let r = reg::as_size(regs::unused_reg(&self.used[line]), Size::LONG).unwrap();
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
                let by_ref = i.op() == Op::FnParamRef;
                let mut s = i.src().clone();
                if self.is_indirect(&s) {
                    if by_ref || !s.offset().is_zero() {
                        let tmp =
                            reg::as_size(regs::unused_reg(&self.used[line]), Size::PTR).unwrap();
                        dest.push(mov(tmp, ptr_rel(s.var(), Offset::ZERO)));
                        s = if by_ref {
                            tmp.into()
                        } else {
                            x_rel(s.size(), tmp, s.offset())
                        };
                        self.params.push(ParamInfo::new(ty, s, true));
                    } else {
                        self.params
                            .push(ParamInfo::new(ty, ptr_rel(s.var(), Offset::ZERO), true));
                    }
                } else {
                    self.params.push(ParamInfo::new(ty, s, by_ref));
                }
                Ok(())
            }
            Op::FnCall => self.fn_call_tfm(dest, i, line, false),
            Op::FnCallRef => self.fn_call_tfm(dest, i, line, true),

            Op::FAdd | Op::FSub | Op::FMul | Op::FDiv | Op::FCmp | Op::FCast | Op::FNeg => {
                self.fp_instr(dest, i, line)
            }
            Op::FCastI | Op::FCastU => self.convert_tfm(dest, i, line, false),
            Op::ICastF | Op::UCastF => self.convert_tfm(dest, i, line, true),

            Op::SetCond => {
                if matches!(i.dest().kind(), OperandKind::Reg(_)) {
                    dest.push(i);
                } else {
                    let mut used = self.used[line].clone();
                    let d = i.dest().clone();
                    let r = self.scratch(&mut used, d.size());
                    dest.push(i.alter_dest(r.into()));
                    dest.push(mov(d, r));
                }
                Ok(())
            }

            // There is no exchange instruction; go through a scratch
            // register.
            Op::Swap => {
                let mut used = self.used[line].clone();
                let a = i.dest().clone();
                let b = i.src().clone();
                let tmp = self.scratch(&mut used, a.size());
                dest.push(mov(tmp, a.clone()));
                dest.push(mov(a, b.clone()));
                dest.push(mov(b, tmp));
                Ok(())
            }

            Op::Push => {
                if matches!(i.src().kind(), OperandKind::Reg(_)) {
                    dest.push(i);
                } else {
                    let mut used = self.used[line].clone();
                    let loaded = self.to_reg(dest, &mut used, &i.src().clone(), false)?;
                    dest.push(i.alter_src(loaded));
                }
                Ok(())
            }
            Op::Pop => {
                if matches!(i.dest().kind(), OperandKind::Reg(_)) {
                    dest.push(i);
                } else {
                    let mut used = self.used[line].clone();
                    let d = i.dest().clone();
                    let r = self.scratch(&mut used, d.size());
                    dest.push(i.alter_dest(r.into()));
                    dest.push(mov(d, r));
                }
                Ok(())
            }

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
