//! Lowering of the `fn_call` primitives to the x64 calling conventions.
//!
//! The caller enumerates typed parameters with `fn_param`; this module
//! classifies them, copies complex parameters into a fresh block through
//! their copy constructors, spills by-pointer aggregates, fills the
//! caller-reserved stack area, assigns the register arguments (breaking
//! register-to-register cycles with a backtracking pass), and finally
//! emits the call and fetches the result.

use super::regs;
use super::X64Isa;
use crate::abi::{Params, RETURN_ID};
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::listing::{Block, FreeOpt, Listing, Var};
use crate::operand::{ptr_rel, x_rel, Operand, OperandKind};
use crate::reg::{self, Reg, RegSet};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{Offset, Size};
use crate::ty::{ptr_desc, TypeDesc};
use std::rc::Rc;

/// One parameter of a call being lowered.
#[derive(Clone)]
pub(super) struct ParamInfo {
    pub ty: Rc<TypeDesc>,
    pub src: Operand,
    /// `src` holds the address of the value rather than the value.
    pub by_ref: bool,
    /// Pass the address of `src` rather than its contents.
    pub lea: bool,
}

impl ParamInfo {
    pub fn new(ty: Rc<TypeDesc>, src: Operand, by_ref: bool) -> ParamInfo {
        ParamInfo {
            ty,
            src,
            by_ref,
            lea: false,
        }
    }
}

/// Shared context for the lowering steps.
struct CallState<'a> {
    isa: &'a X64Isa,
    parent: Block,
    used: RegSet,
    layout: Box<dyn Params>,
    created: Option<Block>,
}

impl<'a> CallState<'a> {
    /// The block created for this call, initializing it on first use.
    fn block(&mut self, dest: &mut Listing, params: &[ParamInfo]) -> CodegenResult<Block> {
        if let Some(b) = self.created {
            return Ok(b);
        }
        let b = dest.create_block(self.parent);
        // Tell the layout pass which register it may clobber for
        // zero-initialization.
        let free = self.find_free_reg(&self.used, params)?;
        dest.push(begin_block(b).alter_dest(reg::as_size(free, Size::LONG).unwrap().into()));
        self.created = Some(b);
        Ok(b)
    }

    /// A register unused by the live set and by every pending parameter.
    fn find_free_reg(&self, used: &RegSet, params: &[ParamInfo]) -> CodegenResult<Reg> {
        let mut tmp = used.clone();
        for p in params {
            if p.src.has_register() {
                tmp.put(p.src.reg());
            }
        }
        regs::unused_reg(&tmp)
            .ok_or_else(|| CodegenError::invalid("no free register at function call"))
    }
}

/// `op` shifted `offset` bytes into the value it refers to, at `size`.
fn op_offset(size: Size, op: &Operand, offset: u32) -> CodegenResult<Operand> {
    let extra = Offset::fixed(offset as i32);
    match op.kind() {
        OperandKind::Var(v, o) => Ok(x_rel(size, *v, *o + extra)),
        OperandKind::Rel(r, o) => Ok(x_rel(size, *r, *o + extra)),
        OperandKind::Reg(r) if offset == 0 => {
            Ok(reg::as_size(*r, size).map(Operand::from).unwrap_or_else(|| (*r).into()))
        }
        _ => Err(CodegenError::invalid(format!(
            "can not address into operand {op:?}"
        ))),
    }
}

/*
 * Stack parameters. Stack space is reserved upfront as a block-local
 * variable, so the stack pointer never moves here and exceptions thrown
 * by constructors see a consistent frame.
 */

fn store_stack_value(
    dest: &mut Listing,
    tmp: Reg,
    offset: u32,
    p: &ParamInfo,
) -> CodegenResult<()> {
    let size = p.ty.size();
    let n = size.size64();
    if n <= 8 {
        let r = if let OperandKind::Reg(r) = *p.src.kind() {
            r
        } else {
            let r = reg::as_size(tmp, size)
                .ok_or_else(|| CodegenError::invalid("odd-sized stack argument"))?;
            dest.push(mov(r, p.src.clone()));
            r
        };
        dest.push(mov(
            x_rel(size, reg::PTR_STACK, Offset::fixed(offset as i32)),
            r,
        ));
        return Ok(());
    }

    let src = match p.src.kind() {
        OperandKind::Var(v, _) => *v,
        _ => {
            return Err(CodegenError::invalid(
                "can not pass non-variables larger than 8 bytes to functions",
            ))
        }
    };

    let large = reg::as_size(tmp, Size::LONG).unwrap();
    let mut pos = 0;
    while pos + 8 <= n {
        dest.push(mov(large, x_rel(Size::LONG, src, Offset::fixed(pos as i32))));
        dest.push(mov(
            x_rel(
                Size::LONG,
                reg::PTR_STACK,
                Offset::fixed((offset + pos) as i32),
            ),
            large,
        ));
        pos += 8;
    }

    let mut tail = |sz: Size, dest: &mut Listing, pos: u32| {
        let r = reg::as_size(tmp, sz).unwrap();
        dest.push(mov(r, x_rel(sz, src, Offset::fixed(pos as i32))));
        dest.push(mov(
            x_rel(
                sz,
                reg::PTR_STACK,
                Offset::fixed((offset + pos) as i32),
            ),
            r,
        ));
    };

    if pos < n && n - pos <= 1 {
        tail(Size::BYTE, dest, pos);
    } else if pos < n && n - pos <= 4 {
        tail(Size::INT, dest, pos);
    }
    Ok(())
}

fn load_addr(dest: &mut Listing, tmp: Reg, src: &Operand) -> Reg {
    if let OperandKind::Reg(r) = *src.kind() {
        return r;
    }
    let tmp = reg::as_size(tmp, Size::PTR).unwrap();
    dest.push(mov(tmp, src.clone()));
    tmp
}

fn store_stack_ref(
    dest: &mut Listing,
    tmp: Reg,
    offset: u32,
    p: &ParamInfo,
) -> CodegenResult<()> {
    let size = p.ty.size();
    let n = size.size64();
    if n <= 8 {
        let addr = load_addr(dest, tmp, &p.src);
        let r = reg::as_size(tmp, size)
            .ok_or_else(|| CodegenError::invalid("odd-sized stack argument"))?;
        dest.push(mov(r, x_rel(size, addr, Offset::ZERO)));
        dest.push(mov(
            x_rel(size, reg::PTR_STACK, Offset::fixed(offset as i32)),
            r,
        ));
        return Ok(());
    }

    let large = reg::as_size(tmp, Size::LONG).unwrap();
    let mut pos = 0;
    while pos + 8 <= n {
        let addr = load_addr(dest, tmp, &p.src);
        dest.push(mov(
            large,
            x_rel(Size::LONG, addr, Offset::fixed(pos as i32)),
        ));
        dest.push(mov(
            x_rel(
                Size::LONG,
                reg::PTR_STACK,
                Offset::fixed((offset + pos) as i32),
            ),
            large,
        ));
        pos += 8;
    }

    let mut tail = |sz: Size, dest: &mut Listing, pos: u32| {
        let addr = load_addr(dest, tmp, &p.src);
        let r = reg::as_size(tmp, sz).unwrap();
        dest.push(mov(r, x_rel(sz, addr, Offset::fixed(pos as i32))));
        dest.push(mov(
            x_rel(sz, reg::PTR_STACK, Offset::fixed((offset + pos) as i32)),
            r,
        ));
    };

    if pos < n && n - pos <= 1 {
        tail(Size::BYTE, dest, pos);
    } else if pos < n && n - pos <= 4 {
        tail(Size::INT, dest, pos);
    }
    Ok(())
}

fn store_stack_lea(dest: &mut Listing, tmp: Reg, offset: u32, p: &ParamInfo) {
    let tmp = reg::as_size(tmp, Size::PTR).unwrap();
    dest.push(lea(tmp, p.src.clone()));
    dest.push(mov(
        ptr_rel(reg::PTR_STACK, Offset::fixed(offset as i32)),
        tmp,
    ));
}

fn store_stack_params(
    state: &mut CallState,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    let total = state.layout.stack_total_size();
    if total == 0 {
        return Ok(());
    }

    let block = state.block(dest, params)?;

    // The variable is never read by name; it reserves enough space at the
    // end of the stack for the outgoing arguments.
    dest.create_var_free(
        block,
        Size::fixed(total, 16),
        Operand::none(),
        FreeOpt::NO_INIT,
    );

    let tmp = state.find_free_reg(&state.used, params)?;

    // Fill right to left, matching push-based conventions.
    for i in (0..state.layout.stack_count()).rev() {
        let offset = state.layout.stack_offset(i);
        let id = state.layout.stack_param(i).id();
        let p = params[id as usize].clone();
        if p.by_ref == p.lea {
            store_stack_value(dest, tmp, offset, &p)?;
        } else if p.by_ref {
            store_stack_ref(dest, tmp, offset, &p)?;
        } else {
            store_stack_lea(dest, tmp, offset, &p);
        }
    }
    Ok(())
}

/*
 * Register parameters.
 */

struct RegEnv<'a> {
    layout: &'a dyn Params,
    /// Slot currently being assigned (cycle detection).
    active: [bool; 16],
    finished: [bool; 16],
    depth: usize,
}

fn info<'p>(params: &'p mut Vec<ParamInfo>, id: u16) -> &'p mut ParamInfo {
    if id == RETURN_ID {
        params.last_mut().unwrap()
    } else {
        &mut params[id as usize]
    }
}

/// Make sure any content of `reg` is consumed now so the register can be
/// overwritten. Detects cycles: a slot that is already being assigned has
/// its current value pushed to the stack instead.
fn vacate_register(
    env: &mut RegEnv,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
    reg_to_free: Reg,
) -> CodegenResult<()> {
    for i in 0..env.layout.register_count() {
        let p = match env.layout.register_param(i) {
            Some(p) => p,
            None => continue,
        };

        let src = info(params, p.id()).src.clone();
        if src.has_register() && reg::same(src.reg(), reg_to_free) {
            if env.active[i] {
                // Cycle detected. At depth one the data is already in the
                // right place; deeper, park the register on the stack.
                if env.depth > 1 {
                    dest.push(push(src));
                    env.active[i] = false;
                }
            } else {
                set_register(env, dest, params, i)?;
            }
        }
    }
    Ok(())
}

/// Move a value into its register, assuming `src` holds the value.
fn set_register_val(
    dest: &mut Listing,
    target: Reg,
    param: crate::abi::Param,
    src: &Operand,
) -> CodegenResult<()> {
    if param.offset() == 0 && src.size().size64() <= 8 {
        if matches!(src.kind(), OperandKind::Reg(r) if *r == target) {
            // Already in place.
        } else {
            match reg::as_size(target, src.size()) {
                Some(to) => {
                    dest.push(mov(to, src.clone()));
                }
                None => {
                    // No register of this odd size; the source must be a
                    // variable, so copying slightly more is harmless.
                    let s = src.size() + Size::INT.alignment();
                    let to = reg::as_size(target, s).unwrap();
                    dest.push(mov(to, x_rel(s, src.var(), Offset::ZERO)));
                }
            }
        }
    } else if let OperandKind::Var(v, _) = *src.kind() {
        let s = param.size();
        let to = reg::as_size(target, s)
            .ok_or_else(|| CodegenError::invalid("odd-sized register argument"))?;
        dest.push(mov(to, x_rel(s, v, Offset::fixed(param.offset() as i32))));
    } else {
        return Err(CodegenError::invalid(
            "can not pass non-variables larger than 8 bytes to functions",
        ));
    }
    Ok(())
}

/// Move the address of `src` into its register.
fn set_register_lea(dest: &mut Listing, target: Reg, src: &Operand) {
    dest.push(lea(reg::as_size(target, Size::PTR).unwrap(), src.clone()));
}

/// Move a value into its register, assuming `src` holds a pointer to it.
fn set_register_ref(
    dest: &mut Listing,
    target: Reg,
    param: crate::abi::Param,
    src: &Operand,
) -> CodegenResult<()> {
    let s = param.size();
    let o = Offset::fixed(param.offset() as i32);

    if regs::fp_register(target) {
        // A vector register can not hold the pointer while we chase it.
        // Vector arguments are assigned last, so r10 is free by now; the
        // call clobbers it anyway.
        dest.push(mov(regs::PTR_10, src.clone()));
        dest.push(mov(
            reg::as_size(target, s).ok_or_else(|| CodegenError::invalid("odd fp argument"))?,
            x_rel(s, regs::PTR_10, o),
        ));
    } else {
        // Chase the pointer through the target register itself.
        if !matches!(src.kind(), OperandKind::Reg(r) if *r == target) {
            dest.push(mov(reg::as_size(target, Size::PTR).unwrap(), src.clone()));
        }
        let (s, to) = match reg::as_size(target, s) {
            Some(to) => (s, to),
            None => {
                let s = s + Size::INT.alignment();
                (s, reg::as_size(target, s).unwrap())
            }
        };
        dest.push(mov(to, x_rel(s, reg::as_size(target, Size::PTR).unwrap(), o)));
    }
    Ok(())
}

fn set_register(
    env: &mut RegEnv,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
    i: usize,
) -> CodegenResult<()> {
    let param = match env.layout.register_param(i) {
        Some(p) => p,
        None => return Ok(()),
    };
    if env.finished[i] {
        return Ok(());
    }

    env.depth += 1;
    let target = env.layout.register_src(i);

    // Flush whatever lives in the target register first.
    env.active[i] = true;
    vacate_register(env, dest, params, target)?;
    if !env.active[i] {
        // Parked on the stack by a cycle; bring it back into the target.
        let p = info(params, param.id());
        p.src = reg::as_size(target, p.src.size())
            .ok_or_else(|| CodegenError::invalid("odd-sized register argument"))?
            .into();
        dest.push(pop(p.src.clone()));
    }
    env.active[i] = false;

    let p = info(params, param.id()).clone();
    if p.by_ref == p.lea {
        set_register_val(dest, target, param, &p.src)?;
    } else if p.by_ref {
        set_register_ref(dest, target, param, &p.src)?;
    } else {
        set_register_lea(dest, target, &p.src);
    }

    env.finished[i] = true;
    env.depth -= 1;
    Ok(())
}

fn set_registers(
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
    layout: &dyn Params,
) -> CodegenResult<()> {
    let mut env = RegEnv {
        layout,
        active: [false; 16],
        finished: [false; 16],
        depth: 0,
    };
    for i in 0..layout.register_count() {
        set_register(&mut env, dest, params, i)?;
    }
    Ok(())
}

/*
 * Complex parameters.
 */

fn has_complex(params: &[ParamInfo]) -> bool {
    params.iter().any(|p| p.ty.is_complex())
}

/// Constructor calls clobber the argument registers, so any parameter
/// whose register would be destroyed is moved to a safe register or a
/// fresh variable first.
fn preserve_complex(
    state: &mut CallState,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
    block: Block,
) -> CodegenResult<()> {
    let mut used = state.used.clone();
    for p in params.iter() {
        if p.ty.is_complex() {
            continue;
        }
        if p.src.has_register() {
            used.put(p.src.reg());
        }
    }
    let dirty = state.isa.dirty_regs().clone();
    used.put_all(&dirty);

    let mut first_complex = true;
    for p in params.iter_mut() {
        if p.ty.is_complex() && first_complex {
            // The first constructor call needs no protection; nothing has
            // been placed yet when it runs.
            first_complex = false;
            continue;
        }

        if !p.src.has_register() {
            continue;
        }
        let src_reg = p.src.reg();
        if !dirty.has(src_reg) {
            continue;
        }

        match regs::unused_reg(&used) {
            Some(into) => {
                let into = reg::as_size(into, p.src.size())
                    .ok_or_else(|| CodegenError::invalid("odd-sized parameter"))?;
                dest.push(mov(into, p.src.clone()));
                p.src = into.into();
                used.put(into);
            }
            None => {
                let v = dest.create_var(block, p.src.size());
                dest.push(mov(v, p.src.clone()));
                p.src = v.into();
            }
        }
    }
    Ok(())
}

fn copy_complex(
    state: &mut CallState,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    if !has_complex(params) {
        return Ok(());
    }

    let block = state.block(dest, params)?;
    preserve_complex(state, dest, params, block)?;

    for i in 0..params.len() {
        let (ty, src, by_ref, is_lea) = {
            let p = &params[i];
            (p.ty.clone(), p.src.clone(), p.by_ref, p.lea)
        };
        let ctor = match &*ty {
            TypeDesc::Complex { ctor, .. } => ctor.clone(),
            _ => continue,
        };

        let mut opt = FreeOpt::INACTIVE | FreeOpt::ON_EXCEPTION;
        if !state.layout.callee_destroy_params() {
            opt = opt | FreeOpt::ON_BLOCK_EXIT;
        }
        let v = dest.create_typed_var(block, &ty, opt);

        // Run the copy constructor into the new variable.
        dest.push(lea(state.layout.register_src(0), v));
        if by_ref == is_lea {
            dest.push(lea(state.layout.register_src(1), src));
        } else if by_ref {
            dest.push(mov(state.layout.register_src(1), src));
        } else {
            return Err(CodegenError::invalid(
                "complex parameters can not use the address-of mode",
            ));
        }
        dest.push(call(ctor));
        dest.push(activate(v));

        let p = &mut params[i];
        p.src = v.into();
        p.by_ref = false;
        p.lea = true;
    }
    Ok(())
}

/*
 * Simple parameters the ABI wants in memory.
 */

fn load_offset(
    dest: &mut Listing,
    tmp: Reg,
    offset: u32,
    param: &ParamInfo,
    size: Size,
) -> CodegenResult<()> {
    let out = reg::as_size(tmp, size).unwrap();

    if param.by_ref == param.lea {
        match param.src.kind() {
            OperandKind::Reg(r) => {
                debug_assert_eq!(offset, 0);
                dest.push(mov(out, reg::as_size(*r, size).unwrap()));
            }
            OperandKind::Rel(r, o) => {
                dest.push(mov(out, x_rel(size, *r, *o + Offset::fixed(offset as i32))));
            }
            OperandKind::Var(v, o) => {
                dest.push(mov(out, x_rel(size, *v, *o + Offset::fixed(offset as i32))));
            }
            _ => return Err(CodegenError::invalid("unsupported aggregate source")),
        }
    } else if param.by_ref {
        let addr = if let OperandKind::Reg(r) = *param.src.kind() {
            r
        } else {
            let addr = reg::as_size(tmp, Size::PTR).unwrap();
            dest.push(mov(addr, param.src.clone()));
            addr
        };
        dest.push(mov(out, x_rel(size, addr, Offset::fixed(offset as i32))));
    } else {
        return Err(CodegenError::invalid(
            "parameters in memory can not use the address-of mode",
        ));
    }
    Ok(())
}

fn copy_simple(
    state: &mut CallState,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    for n in 0..state.layout.total_count() {
        let p = match state.layout.total_param(n) {
            Some(p) => p,
            None => continue,
        };
        if !p.in_memory() || p.id() == RETURN_ID {
            continue;
        }
        if params[p.id() as usize].ty.is_complex() {
            // Already replaced by its block-local copy.
            continue;
        }

        let block = state.block(dest, params)?;
        let info = params[p.id() as usize].clone();
        let v = dest.create_typed_var(block, &info.ty, FreeOpt::NONE);

        let tmp = reg::as_size(state.find_free_reg(&state.used, params)?, Size::LONG).unwrap();
        let size = info.ty.size().size64();

        let mut offset = 0;
        while offset + 8 <= size {
            load_offset(dest, tmp, offset, &info, Size::LONG)?;
            dest.push(mov(
                x_rel(Size::LONG, v, Offset::fixed(offset as i32)),
                tmp,
            ));
            offset += 8;
        }
        if offset < size && size - offset <= 1 {
            load_offset(dest, tmp, offset, &info, Size::BYTE)?;
            dest.push(mov(
                x_rel(Size::BYTE, v, Offset::fixed(offset as i32)),
                reg::as_size(tmp, Size::BYTE).unwrap(),
            ));
        } else if offset < size && size - offset <= 4 {
            load_offset(dest, tmp, offset, &info, Size::INT)?;
            dest.push(mov(
                x_rel(Size::INT, v, Offset::fixed(offset as i32)),
                reg::as_size(tmp, Size::INT).unwrap(),
            ));
        }

        let p = &mut params[p.id() as usize];
        p.src = v.into();
        p.by_ref = false;
        p.lea = true;
    }
    Ok(())
}

/*
 * The entry point.
 */

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_fn_call(
    isa: &X64Isa,
    dest: &mut Listing,
    to_call: Operand,
    mut result_pos: Operand,
    result_ty: &Rc<TypeDesc>,
    member: bool,
    result_ref: bool,
    current_block: Block,
    used: &RegSet,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    let mut state = CallState {
        isa,
        parent: current_block,
        used: used.clone(),
        layout: isa.new_params_impl(member),
        created: None,
    };

    state.layout.result_ty(result_ty);
    for (i, p) in params.iter().enumerate() {
        state.layout.add(i as u16, &p.ty);
    }

    let result = state.layout.result().clone();

    // A result pointer living in a caller-saved register has to survive
    // the call; park it in one of the preserved registers.
    if result_ref && matches!(result_pos.kind(), OperandKind::Reg(_)) {
        let result_dirty = isa.dirty_regs().has(result_pos.reg());
        if result_dirty {
            let alternatives = [
                reg::PTR_B,
                regs::ptr_view(regs::R12),
                regs::ptr_view(regs::R14),
                regs::ptr_view(regs::R15),
            ];
            let to = alternatives
                .iter()
                .copied()
                .find(|r| !state.used.has(*r))
                .ok_or_else(|| CodegenError::invalid("no register for the result pointer"))?;

            state.used.put(to);
            dest.push(mov(to, result_pos.clone()));
            result_pos = to.into();
        }
    }

    if result.memory_register().is_some() {
        // The hidden result argument.
        params.push(ParamInfo {
            ty: ptr_desc(),
            src: result_pos.clone(),
            by_ref: false,
            lea: !result_ref,
        });
    }

    // Copies of complex parameters, constructed inside a fresh block.
    copy_complex(&mut state, dest, params)?;

    // Copies of simple parameters that are to be passed by pointer.
    copy_simple(&mut state, dest, params)?;

    // Stack parameters; preserves registers.
    store_stack_params(&mut state, dest, params)?;

    // Register parameters.
    set_registers(dest, params, &*state.layout)?;

    // With callee-destroyed parameters no destructor runs here, so the
    // block can end before the call; the callee takes over the copies.
    if let Some(block) = state.created {
        if state.layout.callee_destroy_params() {
            dest.push(end_block(block));
        }
    }

    dest.push(call(to_call));

    // Fetch the result.
    if result.memory_register().is_some() {
        // The callee wrote the result through the hidden pointer; nothing
        // more to do.
    } else if result.register_count() > 0 {
        if result_ref {
            // The second argument register is dead after the call; use it
            // to chase the result pointer.
            let r = state.layout.register_src(1);
            dest.push(mov(r, result_pos.clone()));
            result_pos = x_rel(result_ty.size(), r, Offset::ZERO);
        }

        if result.register_count() == 1 && matches!(result_pos.kind(), OperandKind::Reg(_)) {
            if !reg::same(result.register_at(0), result_pos.reg()) {
                dest.push(mov(result_pos.clone(), result.register_at(0)));
            }
        } else {
            for i in 0..result.register_count() {
                let r = result.register_at(i);
                dest.push(mov(
                    op_offset(r.size(), &result_pos, result.register_offset(i))?,
                    r,
                ));
            }
        }
    }

    // Caller-destroyed parameters: run the destructors, protecting a
    // register-held result from them.
    if let Some(block) = state.created {
        if !state.layout.callee_destroy_params() {
            let target = result_pos.clone();

            let mut need_protection = matches!(target.kind(), OperandKind::Reg(_));
            if need_protection {
                need_protection = dest
                    .vars_in(block)
                    .iter()
                    .any(|v| dest.free_opt(*v).contains(FreeOpt::ON_BLOCK_EXIT));
            }

            if need_protection {
                // r15 is never handed out by the rewrite passes.
                let r15 = reg::as_size(regs::R15, target.size())
                    .ok_or_else(|| CodegenError::invalid("odd-sized call result"))?;
                dest.push(mov(r15, target.clone()));
                dest.push(end_block(block));
                dest.push(mov(target, r15));
            } else {
                dest.push(end_block(block));
            }
        }
    }

    Ok(())
}
