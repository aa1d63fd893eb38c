//! Stack-frame layout and scope lowering for x64.
//!
//! This pass assigns every variable a frame-pointer-relative slot,
//! generates the prolog and epilogs, expands `begin_block`/`end_block`
//! into zero-initialization and destructor walks, lowers `fn_ret`, and
//! collects the active-block table consumed by the runtime unwinder.
//!
//! Frame shape (rbp-relative): saved rbp at 0, callee-saved registers
//! right below, then the spill slot for the hidden result pointer, then
//! spilled register parameters and locals. Stack parameters live above,
//! starting at rbp+16. On Windows the four register parameters spill to
//! their shadow-space homes above rbp instead, and the bottom 32 bytes of
//! the frame stay free as shadow space for outgoing calls.

use super::regs;
use super::X64Isa;
use crate::abi::{Params, RETURN_ID};
use crate::eh::ActiveBlock;
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::listing::{Block, FreeOpt, Listing, Var};
use crate::liveness::all_used_regs;
use crate::op::Op;
use crate::operand::{int_const, nat_const, offset_const, ptr_const, ptr_rel, x_rel, Operand, OperandKind};
use crate::reg::{self, Reg, RegSet, EAX, PTR_A, PTR_C, PTR_FRAME, PTR_STACK, RAX};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{round_up, Offset, Size};
use crate::transform::Transform;
use crate::ty::{PrimitiveKind, SimpleDesc, TypeDesc};
use log::debug;

/// Activation id of variables that are never activated.
const INACTIVE: u32 = u32::MAX;

pub(super) struct Frame<'a> {
    isa: &'a X64Isa,
    windows: bool,
    /// The currently active block, if any.
    block: Option<Block>,
    using_eh: bool,
    params: Box<dyn Params>,
    /// Callee-saved registers this function touches.
    preserved: Vec<Reg>,
    /// Save slot per preserved register. Vector registers get
    /// 16-byte-aligned slots, which the Win64 unwind encoding requires.
    save_slots: Vec<(Reg, Offset)>,
    /// Frame offset per variable key.
    offsets: Vec<Offset>,
    /// Total frame allocation below the saved frame pointer.
    total: i32,
    /// Spill slot of the hidden result pointer.
    result_param: Offset,
    activated: Vec<u32>,
    activation_id: u32,
    active_blocks: Vec<ActiveBlock>,
}

impl<'a> Frame<'a> {
    pub fn new(isa: &'a X64Isa) -> Frame<'a> {
        Frame {
            isa,
            windows: isa.windows,
            block: None,
            using_eh: false,
            params: isa.new_params_impl(false),
            preserved: Vec::new(),
            save_slots: Vec::new(),
            offsets: Vec::new(),
            total: 0,
            result_param: Offset::ZERO,
            activated: Vec::new(),
            activation_id: 0,
            active_blocks: Vec::new(),
        }
    }

    fn compute_layout(&mut self, src: &Listing) -> CodegenResult<()> {
        let var_count = src.var_count();
        self.offsets = vec![Offset::ZERO; var_count];
        let mut assigned = vec![false; var_count];

        let all_params = src.all_params();

        // Slots directly below the saved frame pointer: callee saves,
        // then the result pointer's spill slot. Integer saves pack in
        // 8-byte slots; vector saves move to 16-byte-aligned slots so the
        // Win64 unwind encoding, which scales their offsets by sixteen,
        // can describe them.
        self.save_slots.clear();
        let mut var_off = 0i32;
        for r in self.preserved.iter().copied() {
            if regs::fp_register(r) {
                continue;
            }
            var_off += 8;
            self.save_slots.push((r, Offset::fixed(-var_off)));
        }
        for r in self.preserved.iter().copied() {
            if !regs::fp_register(r) {
                continue;
            }
            var_off = round_up(var_off as u32, 16) as i32 + 16;
            self.save_slots.push((r, Offset::fixed(-var_off)));
        }

        let mem_result = self.params.result().memory_register().is_some();
        if mem_result {
            var_off += 8;
            self.result_param = Offset::fixed(-var_off);
        }

        // Stack parameters already have homes above the return address.
        for i in 0..self.params.stack_count() {
            let p = self.params.stack_param(i);
            if p.id() == RETURN_ID {
                continue;
            }
            let v = all_params[p.id() as usize];
            self.offsets[v.key() as usize] =
                Offset::fixed(16 + self.params.stack_offset(i) as i32);
            assigned[v.key() as usize] = true;
        }

        // Register parameters spill into the frame; on Windows, into
        // their shadow-space homes above the frame pointer.
        let mut spill = 0i32;
        for i in 0..self.params.register_count() {
            let p = match self.params.register_param(i) {
                Some(p) => p,
                None => continue,
            };
            if p.id() == RETURN_ID {
                continue;
            }
            let v = all_params[p.id() as usize];
            if assigned[v.key() as usize] {
                continue;
            }

            if self.windows {
                // The shadow home follows the argument position, which on
                // this convention equals the slot index within either
                // bank.
                let int_count = self.params.slots().int_count();
                let pos = if i < int_count { i } else { i - int_count };
                self.offsets[v.key() as usize] = Offset::fixed(16 + 8 * pos as i32);
            } else {
                let sz = if src.free_opt(v).contains(FreeOpt::INDIRECTION) {
                    8
                } else {
                    round_up(v.size().size64(), 8) as i32 as u32
                };
                spill += sz as i32;
                self.offsets[v.key() as usize] = Offset::fixed(-(var_off + spill));
            }
            assigned[v.key() as usize] = true;
        }
        var_off += spill;

        // Locals, in creation order from the top of the local area down.
        // Later variables end up closer to the stack pointer, which puts
        // the outgoing-argument reservation of a call at the bottom.
        let mut cum = 0i32;
        let mut positions = vec![0i32; var_count];
        for v in src.all_vars() {
            if src.is_param(v) || assigned[v.key() as usize] {
                continue;
            }
            let sz = if src.free_opt(v).contains(FreeOpt::INDIRECTION) {
                8
            } else {
                round_up(v.size().size64().max(0), 8) as i32 as u32
            } as i32;
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

        // Outgoing shadow space for calls made by the destructor walks.
        self.total = rounded + if self.windows { 32 } else { 0 };

        debug!(
            "frame layout: {} bytes, {} callee saves, result slot {:?}",
            self.total,
            self.preserved.len(),
            if mem_result { Some(self.result_param) } else { None }
        );
        Ok(())
    }

    fn resolve(&self, src: &Listing, op: &Operand) -> CodegenResult<Operand> {
        self.resolve_sized(src, op, op.size())
    }

    fn resolve_sized(&self, src: &Listing, op: &Operand, size: Size) -> CodegenResult<Operand> {
        match op.kind() {
            OperandKind::Var(v, extra) => {
                let active = self
                    .block
                    .ok_or_else(|| CodegenError::VariableUse {
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
                    size,
                    PTR_FRAME,
                    self.offsets[v.key() as usize] + *extra,
                ))
            }
            _ => Ok(op.clone()),
        }
    }

    /*
     * Prolog and epilog.
     */

    fn spill_params(&mut self, dest: &mut Listing, shadow_phase: bool) -> CodegenResult<()> {
        let all = dest.all_params();

        for i in 0..self.params.register_count() {
            let p = match self.params.register_param(i) {
                Some(p) => p,
                None => continue,
            };
            if p.size().size64() == 0 {
                continue;
            }

            if p.id() == RETURN_ID {
                if !shadow_phase {
                    dest.push(mov(
                        ptr_rel(PTR_FRAME, self.result_param),
                        self.params.register_src(i),
                    ));
                }
                continue;
            }

            let v = all[p.id() as usize];
            let to = self.offsets[v.key() as usize] + Offset::fixed(p.offset() as i32);

            // The shadow phase stores the slots above the frame pointer
            // before the frame is allocated; everything else comes after.
            if shadow_phase != (to.v64() > 0) {
                continue;
            }

            let mut size = p.size();
            let r = match reg::as_size(self.params.register_src(i), size) {
                Some(r) => r,
                None => {
                    // No register of this exact size; store a little more.
                    size = size + Size::INT.alignment();
                    reg::as_size(self.params.register_src(i), size)
                        .ok_or_else(|| CodegenError::invalid("unsupported parameter size"))?
                }
            };
            dest.push(mov(x_rel(size, PTR_FRAME, to), r));
        }
        Ok(())
    }

    fn prolog_tfm(&mut self, dest: &mut Listing) -> CodegenResult<()> {
        dest.push(prolog());

        // Windows spills its register parameters into the shadow space
        // before the frame allocation, so the exception machinery can
        // read them from the moment the frame exists.
        if self.windows {
            self.spill_params(dest, true)?;
        }

        if self.total != 0 {
            dest.push(sub(PTR_STACK, ptr_const(self.total as usize)));
        }

        // Save the callee-saved registers this function touches.
        for (r, off) in self.save_slots.clone() {
            let r = reg::as_size(r, Size::PTR).unwrap();
            dest.push(mov(ptr_rel(PTR_FRAME, off), r));
            dest.push(preserve(ptr_rel(PTR_FRAME, off), r));
        }

        self.spill_params(dest, false)?;

        // End of prolog, as far as unwind metadata is concerned.
        dest.push(meta());

        self.init_block(dest, dest.root(), RAX)
    }

    fn save_result(&self, dest: &mut Listing) {
        let result = self.params.result().clone();
        if result.register_count() > 0 {
            let sz = 8 * round_up(result.register_count() as u32, 2);
            dest.push(sub(PTR_STACK, ptr_const(sz as usize)));
            for i in 0..result.register_count() {
                dest.push(mov(
                    ptr_rel(PTR_STACK, Offset::PTR * i as i32),
                    reg::as_size(result.register_at(i), Size::PTR).unwrap(),
                ));
            }
        }
    }

    fn restore_result(&self, dest: &mut Listing) {
        let result = self.params.result().clone();
        if result.register_count() > 0 {
            let sz = 8 * round_up(result.register_count() as u32, 2);
            for i in 0..result.register_count() {
                dest.push(mov(
                    reg::as_size(result.register_at(i), Size::PTR).unwrap(),
                    ptr_rel(PTR_STACK, Offset::PTR * i as i32),
                ));
            }
            dest.push(add(PTR_STACK, ptr_const(sz as usize)));
        }
    }

    /// Destroy every active block, restore the saved registers, and emit
    /// the leave sequence. Used both by `epilog` and by `fn_ret`; an
    /// early return must not change the lexically active block, so it is
    /// saved and restored around the walk.
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

        for (r, off) in self.save_slots.clone() {
            dest.push(mov(
                reg::as_size(r, Size::PTR).unwrap(),
                ptr_rel(PTR_FRAME, off),
            ));
        }

        dest.push(epilog());
        Ok(())
    }

    /*
     * Blocks.
     */

    fn init_block(&mut self, dest: &mut Listing, init: Block, zero_reg: Reg) -> CodegenResult<()> {
        if self.block != dest.parent(init) {
            return Err(CodegenError::BlockBegin {
                block: init.key(),
                active: self.block.map_or(u32::MAX, |b| b.key()),
            });
        }
        self.block = Some(init);

        let mut init_reg = true;
        let restore_reg = zero_reg.is_none();
        let reg = if restore_reg {
            dest.push(push(EAX));
            EAX
        } else {
            zero_reg
        };

        // Reverse order makes the stores walk memory linearly.
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
        // Destruction order is the reverse of declaration.
        for v in vars.iter().rev() {
            let dtor = dest.free_fn(*v).clone();
            let when = dest.free_opt(*v);

            if dtor.is_none() || !when.contains(FreeOpt::ON_BLOCK_EXIT) {
                continue;
            }
            // Skip variables that are not constructed yet.
            if self.activated[v.key() as usize] > self.activation_id {
                continue;
            }

            if preserve_result && !pushed_result {
                self.save_result(dest);
                pushed_result = true;
            }

            let first_param = self.params.register_src(0);

            if when.contains(FreeOpt::INDIRECTION) {
                dest.push(mov(
                    first_param,
                    self.resolve_sized(src, &Operand::from(*v), Size::PTR)?,
                ));
                if !when.contains(FreeOpt::PTR) {
                    let sized = reg::as_size(first_param, v.size())
                        .ok_or_else(|| CodegenError::invalid("unsupported destructor argument"))?;
                    dest.push(mov(sized, x_rel(v.size(), first_param, Offset::ZERO)));
                }
                dest.push(call(dtor));
            } else if when.contains(FreeOpt::PTR) {
                dest.push(lea(first_param, self.resolve(src, &Operand::from(*v))?));
                dest.push(call(dtor));
            } else {
                let sized = reg::as_size(first_param, v.size())
                    .ok_or_else(|| CodegenError::invalid("unsupported destructor argument"))?;
                dest.push(mov(sized, self.resolve(src, &Operand::from(*v))?));
                dest.push(call(dtor));
            }
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

        // The lexical block after the instruction is unchanged; restore it
        // once the destructors are emitted.
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

        // Only worth a table entry if it matters to unwinding.
        if src.free_opt(v).intersects(FreeOpt::ON_EXCEPTION) {
            // The unwinder searches for the preceding PC; keep a call
            // site's return address from aliasing the new entry.
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

    /*
     * Returning values.
     */

    fn return_primitive(
        &self,
        dest: &mut Listing,
        value: &Operand,
        kind: PrimitiveKind,
        target: Reg,
    ) -> CodegenResult<()> {
        match kind {
            PrimitiveKind::None => {}
            PrimitiveKind::Integer | PrimitiveKind::Pointer | PrimitiveKind::Real => {
                if matches!(value.kind(), OperandKind::Reg(r) if reg::same(*r, target)) {
                    // Already in place.
                } else {
                    let target = reg::as_size(target, value.size())
                        .ok_or_else(|| CodegenError::invalid("unsupported result size"))?;
                    dest.push(mov(target, value.clone()));
                }
            }
        }
        Ok(())
    }

    fn return_simple(
        &self,
        dest: &mut Listing,
        desc: &SimpleDesc,
        src_ptr: Reg,
    ) -> CodegenResult<()> {
        let result = self.params.result().clone();
        debug_assert!(!reg::same(src_ptr, regs::RDX));

        if let Some(mem) = result.memory_register() {
            dest.push(mov(mem, ptr_rel(PTR_FRAME, self.result_param)));
            mov_memcpy(dest, mem, src_ptr, desc.size());
        } else {
            for i in 0..result.register_count() {
                let r = result.register_at(i);
                dest.push(mov(
                    r,
                    x_rel(
                        r.size(),
                        src_ptr,
                        Offset::fixed(result.register_offset(i) as i32),
                    ),
                ));
            }
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
                    let target = result.register_at(0);
                    if !by_ref {
                        self.return_primitive(dest, &value, p.kind, target)?;
                    } else {
                        // Two moves: fetch the pointer, then the value.
                        let s = p.size;
                        match p.kind {
                            PrimitiveKind::Real => {
                                dest.push(mov(PTR_A, value));
                                dest.push(mov(
                                    reg::as_size(target, s).unwrap(),
                                    x_rel(s, PTR_A, Offset::ZERO),
                                ));
                            }
                            _ => {
                                let tp = reg::as_size(target, Size::PTR).unwrap();
                                dest.push(mov(tp, value));
                                dest.push(mov(
                                    reg::as_size(target, s).unwrap(),
                                    x_rel(s, tp, Offset::ZERO),
                                ));
                            }
                        }
                    }
                }
            }
            TypeDesc::Complex { ctor, .. } => {
                // Copy-construct into the caller's buffer, then return its
                // address.
                if !by_ref {
                    dest.push(lea(self.params.register_src(0), value));
                } else {
                    dest.push(mov(self.params.register_src(0), value));
                }
                dest.push(mov(
                    self.params.register_src(1),
                    ptr_rel(PTR_FRAME, self.result_param),
                ));
                dest.push(call(ctor.clone()));
                dest.push(mov(PTR_A, ptr_rel(PTR_FRAME, self.result_param)));
            }
            TypeDesc::Simple(s) => {
                if self.params.result().memory_register().is_some() {
                    // ptr_c is safe as a temporary on both conventions.
                    if !by_ref {
                        dest.push(lea(PTR_C, value));
                    } else {
                        dest.push(mov(PTR_C, value));
                    }
                    dest.push(mov(PTR_A, ptr_rel(PTR_FRAME, self.result_param)));
                    mov_memcpy(dest, PTR_A, PTR_C, s.size());
                } else {
                    let r = reg::as_size(self.params.register_src(0), Size::PTR).unwrap();
                    if !by_ref {
                        dest.push(lea(r, value));
                    } else {
                        dest.push(mov(r, value));
                    }
                    self.return_simple(dest, s, r)?;
                }
            }
        }

        self.epilog_tfm(dest, src, true)?;
        dest.push(ret());
        Ok(())
    }
}

/// Zero the memory of a variable with the widest stores that do not
/// overshoot: a stack of booleans may fill only part of a word, and a
/// 4-byte fill there would clobber a neighbor.
fn zero_var(dest: &mut Listing, start: Offset, size: Size, zero: Reg, init_reg: &mut bool) {
    let total = size.size64();
    if total == 0 {
        return;
    }

    let zero = reg::as_size(zero, Size::LONG).unwrap();
    if *init_reg {
        dest.push(bxor(zero, zero));
        *init_reg = false;
    }

    let mut pos = 0;
    while pos < total {
        if total - pos >= 8 {
            dest.push(mov(
                x_rel(Size::LONG, PTR_FRAME, start + Offset::fixed(pos as i32)),
                zero,
            ));
            pos += 8;
        } else if total - pos >= 4 {
            dest.push(mov(
                x_rel(Size::INT, PTR_FRAME, start + Offset::fixed(pos as i32)),
                reg::as_size(zero, Size::INT).unwrap(),
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

/// Inline memcpy with mov pairs through rdx; rdx never carries any part
/// of a return value on either convention.
fn mov_memcpy(dest: &mut Listing, to: Reg, from: Reg, size: Size) {
    let total = size.size64();
    let mut offset = 0;

    while offset + 8 <= total {
        let o = Offset::fixed(offset as i32);
        dest.push(mov(regs::RDX, x_rel(Size::LONG, from, o)));
        dest.push(mov(x_rel(Size::LONG, to, o), regs::RDX));
        offset += 8;
    }
    while offset + 4 <= total {
        let o = Offset::fixed(offset as i32);
        dest.push(mov(regs::EDX, x_rel(Size::INT, from, o)));
        dest.push(mov(x_rel(Size::INT, to, o), regs::EDX));
        offset += 4;
    }
    while offset < total {
        let o = Offset::fixed(offset as i32);
        let dl = reg::as_size(regs::RDX, Size::BYTE).unwrap();
        dest.push(mov(dl, x_rel(Size::BYTE, from, o)));
        dest.push(mov(x_rel(Size::BYTE, to, o), dl));
        offset += 1;
    }
}

impl<'a> Transform for Frame<'a> {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn before(&mut self, _dest: &mut Listing, src: &Listing) -> CodegenResult<()> {
        self.using_eh = src.exception_aware();

        self.params = self.isa.new_params_impl(src.member());
        self.params.result_ty(src.result());
        for (i, v) in src.all_params().iter().enumerate() {
            let desc = src
                .param_desc(*v)
                .cloned()
                .ok_or_else(|| CodegenError::invalid("parameter without a type"))?;
            self.params.add(i as u16, &desc);
        }

        // The registers to save: everything written somewhere in the
        // listing, minus what the convention lets us clobber.
        let mut to_preserve = all_used_regs(src);
        for r in self.isa.dirty_regs().iter() {
            to_preserve.remove(r);
        }
        self.preserved = to_preserve.iter().collect();

        self.compute_layout(src)?;

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
        // Metadata appended after the code: the frame size, one row per
        // variable, and the active-block table the unwinder searches.
        dest.push(align_as(Size::PTR));
        dest.push(dat(offset_const(Offset::fixed(-self.total))));

        for v in src.all_vars() {
            let free = src.free_fn(v);
            if free.is_none() {
                dest.push(dat(ptr_const(0)));
            } else {
                dest.push(dat(free.clone()));
            }
            dest.push(dat(int_const(self.offsets[v.key() as usize].v64())));
            dest.push(dat(nat_const(self.activated[v.key() as usize])));
        }

        dest.push(align_as(Size::PTR));
        for a in &self.active_blocks {
            dest.push(lbl_offset(a.pos));
            dest.push(dat(nat_const(a.encode()?)));
        }
        // Terminated by the row count.
        dest.push(dat(ptr_const(self.active_blocks.len())));
        Ok(())
    }
}
