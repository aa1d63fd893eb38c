//! Stack-frame layout and scope lowering for 32-bit x86.
//!
//! The cdecl frame: saved ebp at the frame pointer, callee-saved
//! registers and locals below it, incoming parameters at ebp+8 and up.
//! An aggregate result arrives as a hidden first stack parameter holding
//! the destination pointer; `fn_ret` copies through it and returns the
//! pointer in eax.

use super::regs;
use super::X86Isa;
use crate::abi::{Params, RETURN_ID};
use crate::eh::ActiveBlock;
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::listing::{Block, FreeOpt, Listing};
use crate::liveness::all_used_regs;
use crate::op::Op;
use crate::operand::{int_const, nat_const, offset_const, ptr_const, ptr_rel, x_rel, Operand, OperandKind};
use crate::reg::{self, Reg, EAX, PTR_A, PTR_FRAME, PTR_STACK};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{round_up, Offset, Size};
use crate::transform::Transform;
use crate::ty::{PrimitiveKind, SimpleDesc, TypeDesc};

const INACTIVE: u32 = u32::MAX;

pub(super) struct Frame<'a> {
    isa: &'a X86Isa,
    block: Option<Block>,
    using_eh: bool,
    params: Box<dyn Params>,
    preserved: Vec<Reg>,
    offsets: Vec<Offset>,
    total: i32,
    /// ebp-relative offset of the hidden result pointer, when present.
    result_param: Offset,
    activated: Vec<u32>,
    activation_id: u32,
    active_blocks: Vec<ActiveBlock>,
}

impl<'a> Frame<'a> {
    pub fn new(isa: &'a X86Isa) -> Frame<'a> {
        Frame {
            isa,
            block: None,
            using_eh: false,
            params: isa.new_params_impl(),
            preserved: Vec::new(),
            offsets: Vec::new(),
            total: 0,
            result_param: Offset::ZERO,
            activated: Vec::new(),
            activation_id: 0,
            active_blocks: Vec::new(),
        }
    }

    fn compute_layout(&mut self, src: &Listing) {
        let var_count = src.var_count();
        self.offsets = vec![Offset::ZERO; var_count];
        let mut assigned = vec![false; var_count];
        let all_params = src.all_params();

        // Incoming parameters, all on the stack above the return address.
        for i in 0..self.params.stack_count() {
            let p = self.params.stack_param(i);
            if p.id() == RETURN_ID {
                self.result_param = Offset::fixed(8 + self.params.stack_offset(i) as i32);
                continue;
            }
            let v = all_params[p.id() as usize];
            self.offsets[v.key() as usize] =
                Offset::fixed(8 + self.params.stack_offset(i) as i32);
            assigned[v.key() as usize] = true;
        }

        let var_off = 4 * self.preserved.len() as i32;

        let mut cum = 0i32;
        let mut positions = vec![0i32; var_count];
        for v in src.all_vars() {
            if src.is_param(v) || assigned[v.key() as usize] {
                continue;
            }
            let sz = round_up(v.size().size32(), 4) as i32;
            positions[v.key() as usize] = cum + sz;
            cum += sz;
        }

        let unrounded = var_off + cum;
        let rounded = (unrounded + 15) & !15;
        let pad = rounded - unrounded;

        for v in src.all_vars() {
            if src.is_param(v) || assigned[v.key() as usize] {
                continue;
            }
            self.offsets[v.key() as usize] =
                Offset::fixed(-(var_off + pad + positions[v.key() as usize]));
        }

        self.total = rounded;
    }

    fn resolve(&self, src: &Listing, op: &Operand) -> CodegenResult<Operand> {
        match op.kind() {
            OperandKind::Var(v, extra) => {
                let active = self.block.ok_or(CodegenError::VariableUse {
                    var: v.key(),
                    block: u32::MAX,
                })?;
                if !src.accessible(*v, active) {
                    return Err(CodegenError::VariableUse {
                        var: v.key(),
                        block: active.key(),
                    });
                }
                Ok(x_rel(
                    op.size(),
                    PTR_FRAME,
                    self.offsets[v.key() as usize] + *extra,
                ))
            }
            _ => Ok(op.clone()),
        }
    }

    fn prolog_tfm(&mut self, dest: &mut Listing) -> CodegenResult<()> {
        dest.push(prolog());

        if self.total != 0 {
            dest.push(sub(PTR_STACK, ptr_const(self.total as usize)));
        }

        let mut off = -Offset::PTR;
        for r in self.preserved.clone() {
            let r = reg::as_size(r, Size::PTR).unwrap();
            dest.push(mov(ptr_rel(PTR_FRAME, off), r));
            dest.push(preserve(ptr_rel(PTR_FRAME, off), r));
            off = off - Offset::PTR;
        }

        dest.push(meta());
        self.init_block(dest, dest.root(), EAX)
    }

    /// Save a live result around destructor calls: the integer registers
    /// on the stack, an x87 top in a temporary slot.
    fn save_result(&self, dest: &mut Listing) {
        let result = self.params.result().clone();
        if result.register_count() == 0 {
            return;
        }
        if regs::is_fp0(result.register_at(0)) {
            dest.push(sub(PTR_STACK, ptr_const(8)));
            dest.push(fstp(x_rel(Size::DOUBLE, PTR_STACK, Offset::ZERO)));
            return;
        }
        let sz = 4 * round_up(result.register_count() as u32, 2);
        dest.push(sub(PTR_STACK, ptr_const(sz as usize)));
        for i in 0..result.register_count() {
            dest.push(mov(
                ptr_rel(PTR_STACK, Offset::PTR * i as i32),
                reg::as_size(result.register_at(i), Size::PTR).unwrap(),
            ));
        }
    }

    fn restore_result(&self, dest: &mut Listing) {
        let result = self.params.result().clone();
        if result.register_count() == 0 {
            return;
        }
        if regs::is_fp0(result.register_at(0)) {
            dest.push(fld(x_rel(Size::DOUBLE, PTR_STACK, Offset::ZERO)));
            dest.push(add(PTR_STACK, ptr_const(8)));
            return;
        }
        let sz = 4 * round_up(result.register_count() as u32, 2);
        for i in 0..result.register_count() {
            dest.push(mov(
                reg::as_size(result.register_at(i), Size::PTR).unwrap(),
                ptr_rel(PTR_STACK, Offset::PTR * i as i32),
            ));
        }
        dest.push(add(PTR_STACK, ptr_const(sz as usize)));
    }

    fn epilog_tfm(
        &mut self,
        dest: &mut Listing,
        src: &Listing,
        preserve_result: bool,
    ) -> CodegenResult<()> {
        let old_block = self.block;
        while let Some(b) = self.block {
            self.destroy_block(dest, src, b, preserve_result, false)?;
        }
        self.block = old_block;

        let mut off = -Offset::PTR;
        for r in self.preserved.clone() {
            dest.push(mov(
                reg::as_size(r, Size::PTR).unwrap(),
                ptr_rel(PTR_FRAME, off),
            ));
            off = off - Offset::PTR;
        }

        dest.push(epilog());
        Ok(())
    }

    fn init_block(&mut self, dest: &mut Listing, init: Block, zero_reg: Reg) -> CodegenResult<()> {
        if self.block != dest.parent(init) {
            return Err(CodegenError::BlockBegin {
                block: init.key(),
                active: self.block.map_or(u32::MAX, |b| b.key()),
            });
        }
        self.block = Some(init);

        let restore_reg = zero_reg.is_none();
        let reg = if restore_reg {
            dest.push(push(EAX));
            EAX
        } else {
            zero_reg
        };
        let mut init_reg = true;

        let vars = dest.vars_in(init);
        for v in vars.iter().rev() {
            if !dest.is_param(*v) && !dest.free_opt(*v).intersects(FreeOpt::NO_INIT) {
                let start = self.offsets[v.key() as usize];
                zero_var(dest, start, v.size(), reg, &mut init_reg);
            }
        }

        if restore_reg {
            dest.push(pop(EAX));
        }

        if self.using_eh {
            let lbl = dest.label();
            dest.mark(lbl);
            self.active_blocks
                .push(ActiveBlock::new(Some(init), self.activation_id, lbl));
        }
        Ok(())
    }

    fn destroy_block(
        &mut self,
        dest: &mut Listing,
        src: &Listing,
        destroy: Block,
        preserve_result: bool,
        table: bool,
    ) -> CodegenResult<()> {
        if self.block != Some(destroy) {
            return Err(CodegenError::BlockEnd(format!(
                "block {} ended while {:?} is active",
                destroy.key(),
                self.block
            )));
        }

        let mut pushed_result = false;
        let vars = dest.vars_in(destroy);
        for v in vars.iter().rev() {
            let dtor = dest.free_fn(*v).clone();
            let when = dest.free_opt(*v);

            if dtor.is_none() || !when.contains(FreeOpt::ON_BLOCK_EXIT) {
                continue;
            }
            if self.activated[v.key() as usize] > self.activation_id {
                continue;
            }

            if preserve_result && !pushed_result {
                self.save_result(dest);
                pushed_result = true;
            }

            // cdecl: the single argument travels on the stack; eax is
            // free here, the result was saved above.
            if when.contains(FreeOpt::PTR) {
                dest.push(lea(PTR_A, self.resolve(src, &Operand::from(*v))?));
                dest.push(push(PTR_A));
            } else {
                dest.push(push(self.resolve(src, &Operand::from(*v))?));
            }
            dest.push(call(dtor));
            dest.push(add(PTR_STACK, ptr_const(4)));
        }

        if pushed_result {
            self.restore_result(dest);
        }

        self.block = dest.parent(destroy);
        if self.using_eh && table {
            let lbl = dest.label();
            dest.mark(lbl);
            self.active_blocks
                .push(ActiveBlock::new(self.block, self.activation_id, lbl));
        }
        Ok(())
    }

    fn jmp_block_tfm(&mut self, dest: &mut Listing, src: &Listing, i: &Inst) -> CodegenResult<()> {
        let to = i.src().block();
        let target = i.dest().label();

        let old_block = self.block;
        while self.block != Some(to) {
            let now = match self.block {
                Some(b) => b,
                None => {
                    return Err(CodegenError::BlockEnd(format!(
                        "block {} is not a parent of {:?}",
                        to.key(),
                        old_block
                    )))
                }
            };
            self.destroy_block(dest, src, now, false, false)?;
        }

        dest.push(jmp(target, crate::cond::CondFlag::Always));
        self.block = old_block;
        Ok(())
    }

    fn activate_tfm(&mut self, dest: &mut Listing, src: &Listing, i: &Inst) -> CodegenResult<()> {
        let v = i.src().var();
        let id = self.activated[v.key() as usize];

        if id == 0 {
            return Err(CodegenError::VariableActivation {
                var: v.key(),
                reason: "must be declared inactive to be activated",
            });
        }
        if id != INACTIVE {
            return Err(CodegenError::VariableActivation {
                var: v.key(),
                reason: "already activated",
            });
        }

        self.activation_id += 1;
        self.activated[v.key() as usize] = self.activation_id;

        if src.free_opt(v).intersects(FreeOpt::ON_EXCEPTION) {
            if matches!(dest.insts().last().map(|i| i.op()), Some(Op::Call)) {
                dest.push(nop());
            }
            let lbl = dest.label();
            dest.mark(lbl);
            self.active_blocks
                .push(ActiveBlock::new(self.block, self.activation_id, lbl));
        }
        Ok(())
    }

    fn fn_ret_tfm(
        &mut self,
        dest: &mut Listing,
        src: &Listing,
        i: &Inst,
        by_ref: bool,
    ) -> CodegenResult<()> {
        let value = self.resolve(src, i.src())?;
        let result_ty = src.result().clone();

        if !by_ref && value.size() != result_ty.size() {
            return Err(CodegenError::invalid(format!(
                "wrong size passed to fn_ret: got {:?}, expected {:?}",
                value.size(),
                result_ty.size()
            )));
        }

        match &*result_ty {
            TypeDesc::Void => {}
            TypeDesc::Primitive(p) => {
                let result = self.params.result().clone();
                if result.register_count() > 0 {
                    let first = result.register_at(0);
                    if p.kind == PrimitiveKind::Real {
                        // Returned on the x87 stack.
                        if by_ref {
                            dest.push(mov(PTR_A, value));
                            dest.push(fld(x_rel(p.size, PTR_A, Offset::ZERO)));
                        } else {
                            dest.push(fld(value));
                        }
                    } else if result.register_count() == 2 {
                        // The edx:eax pair.
                        let (lo, hi) = split_halves(&value, by_ref, dest)?;
                        dest.push(mov(reg::EAX, lo));
                        dest.push(mov(regs::EDX, hi));
                    } else if by_ref {
                        let tp = reg::as_size(first, Size::PTR).unwrap();
                        dest.push(mov(tp, value));
                        dest.push(mov(
                            reg::as_size(first, p.size).unwrap(),
                            x_rel(p.size, tp, Offset::ZERO),
                        ));
                    } else if !matches!(value.kind(), OperandKind::Reg(r) if reg::same(*r, first))
                    {
                        dest.push(mov(reg::as_size(first, value.size()).unwrap(), value));
                    }
                }
            }
            TypeDesc::Complex { ctor, .. } => {
                // ctor(result_ptr, value) through the stack, then the
                // pointer in eax.
                if by_ref {
                    dest.push(mov(PTR_A, value));
                } else {
                    dest.push(lea(PTR_A, value));
                }
                dest.push(push(PTR_A));
                dest.push(mov(PTR_A, ptr_rel(PTR_FRAME, self.result_param)));
                dest.push(push(PTR_A));
                dest.push(call(ctor.clone()));
                dest.push(add(PTR_STACK, ptr_const(8)));
                dest.push(mov(PTR_A, ptr_rel(PTR_FRAME, self.result_param)));
            }
            TypeDesc::Simple(s) => {
                // Copy into the hidden result buffer, then its address in
                // eax.
                if by_ref {
                    dest.push(mov(reg::PTR_C, value));
                } else {
                    dest.push(lea(reg::PTR_C, value));
                }
                dest.push(mov(PTR_A, ptr_rel(PTR_FRAME, self.result_param)));
                mov_memcpy(dest, PTR_A, reg::PTR_C, s.size());
                dest.push(mov(PTR_A, ptr_rel(PTR_FRAME, self.result_param)));
            }
        }

        self.epilog_tfm(dest, src, true)?;
        dest.push(ret());
        Ok(())
    }
}

/// The two 32-bit halves of a 64-bit value for the edx:eax return.
fn split_halves(
    value: &Operand,
    by_ref: bool,
    dest: &mut Listing,
) -> CodegenResult<(Operand, Operand)> {
    if by_ref {
        dest.push(mov(reg::PTR_C, value.clone()));
        return Ok((
            x_rel(Size::INT, reg::PTR_C, Offset::ZERO),
            x_rel(Size::INT, reg::PTR_C, Offset::fixed(4)),
        ));
    }
    match value.kind() {
        OperandKind::Var(v, o) => Ok((
            x_rel(Size::INT, *v, *o),
            x_rel(Size::INT, *v, *o + Offset::fixed(4)),
        )),
        OperandKind::Rel(r, o) => Ok((
            x_rel(Size::INT, *r, *o),
            x_rel(Size::INT, *r, *o + Offset::fixed(4)),
        )),
        _ => Err(CodegenError::invalid(
            "64-bit results must come from memory on this target",
        )),
    }
}

fn zero_var(dest: &mut Listing, start: Offset, size: Size, zero: Reg, init_reg: &mut bool) {
    let total = size.size32();
    if total == 0 {
        return;
    }

    let zero = reg::as_size(zero, Size::INT).unwrap();
    if *init_reg {
        dest.push(bxor(zero, zero));
        *init_reg = false;
    }

    let mut pos = 0;
    while pos < total {
        if total - pos >= 4 {
            dest.push(mov(
                x_rel(Size::INT, PTR_FRAME, start + Offset::fixed(pos as i32)),
                zero,
            ));
            pos += 4;
        } else {
            dest.push(mov(
                x_rel(Size::BYTE, PTR_FRAME, start + Offset::fixed(pos as i32)),
                reg::as_size(zero, Size::BYTE).unwrap(),
            ));
            pos += 1;
        }
    }
}

/// Inline memcpy with dword moves through edx.
fn mov_memcpy(dest: &mut Listing, to: Reg, from: Reg, size: Size) {
    let total = size.size32();
    let mut offset = 0;

    while offset + 4 <= total {
        let o = Offset::fixed(offset as i32);
        dest.push(mov(regs::EDX, x_rel(Size::INT, from, o)));
        dest.push(mov(x_rel(Size::INT, to, o), regs::EDX));
        offset += 4;
    }
    while offset < total {
        let o = Offset::fixed(offset as i32);
        let dl = reg::as_size(regs::EDX, Size::BYTE).unwrap();
        dest.push(mov(dl, x_rel(Size::BYTE, from, o)));
        dest.push(mov(x_rel(Size::BYTE, to, o), dl));
        offset += 1;
    }
}

impl<'a> Transform for Frame<'a> {
    fn name(&self) -> &'static str {
        "frame (x86)"
    }

    fn before(&mut self, _dest: &mut Listing, src: &Listing) -> CodegenResult<()> {
        self.using_eh = src.exception_aware();

        self.params = self.isa.new_params_impl();
        self.params.result_ty(src.result());
        for (i, v) in src.all_params().iter().enumerate() {
            let desc = src
                .param_desc(*v)
                .cloned()
                .ok_or_else(|| CodegenError::invalid("parameter without a type"))?;
            self.params.add(i as u16, &desc);
        }

        let mut to_preserve = all_used_regs(src);
        for r in self.isa.dirty_regs().iter() {
            to_preserve.remove(r);
        }
        self.preserved = to_preserve.iter().collect();

        self.compute_layout(src);

        self.activated = vec![0; src.var_count()];
        for v in src.all_vars() {
            if src.free_opt(v).intersects(FreeOpt::INACTIVE) {
                self.activated[v.key() as usize] = INACTIVE;
            }
        }
        Ok(())
    }

    fn during(&mut self, dest: &mut Listing, src: &Listing, line: usize) -> CodegenResult<()> {
        let i = src.at(line).clone();
        match i.op() {
            Op::Prolog => self.prolog_tfm(dest),
            Op::Epilog => self.epilog_tfm(dest, src, true),
            Op::BeginBlock => {
                let zero = if let OperandKind::Reg(r) = *i.dest().kind() {
                    r
                } else {
                    reg::NO_REG
                };
                self.init_block(dest, i.src().block(), zero)
            }
            Op::EndBlock => self.destroy_block(dest, src, i.src().block(), false, true),
            Op::JmpBlock => self.jmp_block_tfm(dest, src, &i),
            Op::Activate => self.activate_tfm(dest, src, &i),
            Op::FnRet => self.fn_ret_tfm(dest, src, &i, false),
            Op::FnRetRef => self.fn_ret_tfm(dest, src, &i, true),
            _ => {
                let d = self.resolve(src, i.dest())?;
                let s = self.resolve(src, i.src())?;
                dest.push(i.alter(d, s));
                Ok(())
            }
        }
    }

    fn after(&mut self, dest: &mut Listing, src: &Listing) -> CodegenResult<()> {
        dest.push(align_as(Size::PTR));
        dest.push(dat(offset_const(Offset::fixed(-self.total))));

        for v in src.all_vars() {
            let free = src.free_fn(v);
            if free.is_none() {
                dest.push(dat(ptr_const(0)));
            } else {
                dest.push(dat(free.clone()));
            }
            dest.push(dat(int_const(self.offsets[v.key() as usize].v32())));
            dest.push(dat(nat_const(self.activated[v.key() as usize])));
        }

        dest.push(align_as(Size::PTR));
        for a in &self.active_blocks {
            dest.push(lbl_offset(a.pos));
            dest.push(dat(nat_const(a.encode()?)));
        }
        dest.push(dat(ptr_const(self.active_blocks.len())));
        Ok(())
    }
}
