//! Lowering of the `fn_call` primitives to the AAPCS64.
//!
//! Simpler than the x64 version: the hidden result pointer lives in x8
//! outside the argument registers, and the register assignment can run
//! backwards in one pass since the argument sources produced by the
//! legalizer never form cycles here.

use super::abi::result_register;
use super::regs;
use super::Aarch64Isa;
use crate::abi::Params;
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::listing::{Block, FreeOpt, Listing};
use crate::operand::{ptr_rel, x_rel, Operand, OperandKind};
use crate::reg::{self, Reg, RegSet};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{Offset, Size};
use crate::ty::TypeDesc;
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

struct CallState<'a> {
    isa: &'a Aarch64Isa,
    parent: Block,
    used: RegSet,
    layout: Box<dyn Params>,
    created: Option<Block>,
}

impl<'a> CallState<'a> {
    fn block(&mut self, dest: &mut Listing) -> Block {
        if let Some(b) = self.created {
            return b;
        }
        let b = dest.create_block(self.parent);
        let free = regs::unused_reg(&self.used);
        dest.push(begin_block(b).alter_dest(reg::as_size(free, Size::LONG).unwrap().into()));
        self.created = Some(b);
        b
    }
}

fn has_complex(params: &[ParamInfo]) -> bool {
    params.iter().any(|p| p.ty.is_complex())
}

/// Copies of complex parameters, constructed into a fresh block through
/// their copy constructors. Registers carrying later parameters are moved
/// out of the constructors' way first.
fn copy_complex(
    state: &mut CallState,
    dest: &mut Listing,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    if !has_complex(params) {
        return Ok(());
    }

    let block = state.block(dest);

    // Preserve parameter registers the constructor calls would clobber.
    let dirty = state.isa.dirty_regs().clone();
    let mut used = state.used.clone();
    for p in params.iter() {
        if p.src.has_register() {
            used.put(p.src.reg());
        }
    }
    used.put_all(&dirty);

    let mut first_complex = true;
    for p in params.iter_mut() {
        if p.ty.is_complex() && first_complex {
            first_complex = false;
            continue;
        }
        if !p.src.has_register() || !dirty.has(p.src.reg()) {
            continue;
        }
        let v = dest.create_var(block, p.src.size());
        dest.push(mov(v, p.src.clone()));
        p.src = v.into();
    }

    for i in 0..params.len() {
        let (ty, src, by_ref, is_lea) = {
            let p = &params[i];
            (p.ty.clone(), p.src.clone(), p.by_ref, p.lea)
        };
        let ctor = match &*ty {
            TypeDesc::Complex { ctor, .. } => ctor.clone(),
            _ => continue,
        };

        // The AAPCS leaves destruction of by-pointer parameters to the
        // caller, so the copy is freed on block exit as well.
        let opt = FreeOpt::INACTIVE | FreeOpt::ON_EXCEPTION | FreeOpt::ON_BLOCK_EXIT;
        let v = dest.create_typed_var(block, &ty, opt);

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

/// Copies of aggregates the ABI passes by pointer.
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
        if !p.in_memory() || p.id() == crate::abi::RETURN_ID {
            continue;
        }
        if params[p.id() as usize].ty.is_complex() {
            continue;
        }

        let block = state.block(dest);
        let info = params[p.id() as usize].clone();
        let v = dest.create_typed_var(block, &info.ty, FreeOpt::NONE);

        // Copy eight bytes at a time through the scratch registers.
        let tmp = reg::as_size(regs::scratch0(), Size::LONG).unwrap();
        let addr = if info.by_ref {
            let a = reg::as_size(regs::scratch1(), Size::PTR).unwrap();
            dest.push(mov(a, info.src.clone()));
            Some(a)
        } else {
            None
        };

        let size = info.ty.size().size64();
        let mut offset = 0;
        while offset < size {
            let step = if size - offset >= 8 {
                Size::LONG
            } else if size - offset >= 4 {
                Size::INT
            } else {
                Size::BYTE
            };
            let o = Offset::fixed(offset as i32);
            let from = match addr {
                Some(a) => x_rel(step, a, o),
                None => match info.src.kind() {
                    OperandKind::Var(sv, so) => x_rel(step, *sv, *so + o),
                    OperandKind::Rel(sr, so) => x_rel(step, *sr, *so + o),
                    _ => {
                        return Err(CodegenError::invalid(
                            "can not pass non-variables larger than 8 bytes to functions",
                        ))
                    }
                },
            };
            dest.push(mov(reg::as_size(tmp, step).unwrap(), from));
            dest.push(mov(x_rel(step, v, o), reg::as_size(tmp, step).unwrap()));
            offset += step.size64();
        }

        let p = &mut params[p.id() as usize];
        p.src = v.into();
        p.by_ref = false;
        p.lea = true;
    }
    Ok(())
}

/// Stack parameters: reserve a block-local area, then store each value
/// at its assigned offset from the stack pointer.
fn store_stack_params(
    state: &mut CallState,
    dest: &mut Listing,
    params: &[ParamInfo],
) -> CodegenResult<()> {
    let total = state.layout.stack_total_size();
    if total == 0 {
        return Ok(());
    }

    let block = state.block(dest);
    dest.create_var_free(
        block,
        Size::fixed(total, 16),
        Operand::none(),
        FreeOpt::NO_INIT,
    );

    let tmp = regs::scratch0();
    for i in (0..state.layout.stack_count()).rev() {
        let offset = state.layout.stack_offset(i) as i32;
        let p = &params[state.layout.stack_param(i).id() as usize];
        let size = p.ty.size();
        let n = size.size64();

        if p.lea && !p.by_ref {
            let t = reg::as_size(tmp, Size::PTR).unwrap();
            dest.push(lea(t, p.src.clone()));
            dest.push(mov(ptr_rel(reg::PTR_STACK, Offset::fixed(offset)), t));
            continue;
        }

        let addr = if p.by_ref {
            let a = reg::as_size(regs::scratch1(), Size::PTR).unwrap();
            dest.push(mov(a, p.src.clone()));
            Some(a)
        } else {
            None
        };

        if n <= 8 && addr.is_none() {
            let t = reg::as_size(tmp, size)
                .ok_or_else(|| CodegenError::invalid("odd-sized stack argument"))?;
            dest.push(mov(t, p.src.clone()));
            dest.push(mov(x_rel(size, reg::PTR_STACK, Offset::fixed(offset)), t));
            continue;
        }

        let mut pos = 0;
        while pos < n {
            let step = if n - pos >= 8 {
                Size::LONG
            } else if n - pos >= 4 {
                Size::INT
            } else {
                Size::BYTE
            };
            let o = Offset::fixed(pos as i32);
            let from = match addr {
                Some(a) => x_rel(step, a, o),
                None => match p.src.kind() {
                    OperandKind::Var(v, vo) => x_rel(step, *v, *vo + o),
                    _ => {
                        return Err(CodegenError::invalid(
                            "can not pass non-variables larger than 8 bytes to functions",
                        ))
                    }
                },
            };
            let t = reg::as_size(tmp, step).unwrap();
            dest.push(mov(t, from));
            dest.push(mov(
                x_rel(step, reg::PTR_STACK, Offset::fixed(offset + pos as i32)),
                t,
            ));
            pos += step.size64();
        }
    }
    Ok(())
}

/// Assign the register arguments, iterating backwards so that a source
/// still sitting in a lower argument register is consumed before that
/// register is overwritten.
fn set_registers(
    state: &CallState,
    dest: &mut Listing,
    params: &[ParamInfo],
) -> CodegenResult<()> {
    for i in (0..state.layout.register_count()).rev() {
        let param = match state.layout.register_param(i) {
            Some(p) => p,
            None => continue,
        };
        let target = state.layout.register_src(i);
        let p = &params[param.id() as usize];

        if p.lea && !p.by_ref {
            dest.push(lea(reg::as_size(target, Size::PTR).unwrap(), p.src.clone()));
            continue;
        }

        let s = param.size();
        let o = Offset::fixed(param.offset() as i32);

        if p.by_ref {
            // Chase the pointer through a scratch register.
            let a = reg::as_size(regs::scratch0(), Size::PTR).unwrap();
            dest.push(mov(a, p.src.clone()));
            let to = reg::as_size(target, s)
                .ok_or_else(|| CodegenError::invalid("odd-sized register argument"))?;
            dest.push(mov(to, x_rel(s, a, o)));
            continue;
        }

        if param.offset() == 0 && p.src.size().size64() <= 8 {
            if matches!(p.src.kind(), OperandKind::Reg(r) if *r == target) {
                continue;
            }
            match reg::as_size(target, p.src.size()) {
                Some(to) => dest.push(mov(to, p.src.clone())),
                None => {
                    let s = p.src.size() + Size::INT.alignment();
                    let to = reg::as_size(target, s).unwrap();
                    dest.push(mov(to, x_rel(s, p.src.var(), Offset::ZERO)))
                }
            };
        } else if let OperandKind::Var(v, _) = *p.src.kind() {
            let to = reg::as_size(target, s)
                .ok_or_else(|| CodegenError::invalid("odd-sized register argument"))?;
            dest.push(mov(to, x_rel(s, v, o)));
        } else {
            return Err(CodegenError::invalid(
                "can not pass non-variables larger than 8 bytes to functions",
            ));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_fn_call(
    isa: &Aarch64Isa,
    dest: &mut Listing,
    to_call: Operand,
    mut result_pos: Operand,
    result_ty: &Rc<TypeDesc>,
    _member: bool,
    result_ref: bool,
    current_block: Block,
    used: &RegSet,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    let mut state = CallState {
        isa,
        parent: current_block,
        used: used.clone(),
        layout: isa.new_params_impl(),
        created: None,
    };

    state.layout.result_ty(result_ty);
    for (i, p) in params.iter().enumerate() {
        state.layout.add(i as u16, &p.ty);
    }

    let result = state.layout.result().clone();

    // A register-held result pointer has to survive the call; park it in
    // a callee-saved register.
    if result_ref && matches!(result_pos.kind(), OperandKind::Reg(_)) {
        if isa.dirty_regs().has(result_pos.reg()) {
            let to = (19..=27)
                .map(regs::ptr_r)
                .find(|r| !state.used.has(*r))
                .ok_or_else(|| CodegenError::invalid("no register for the result pointer"))?;
            state.used.put(to);
            dest.push(mov(to, result_pos.clone()));
            result_pos = to.into();
        }
    }

    copy_complex(&mut state, dest, params)?;
    copy_simple(&mut state, dest, params)?;
    store_stack_params(&mut state, dest, params)?;
    set_registers(&state, dest, params)?;

    // The hidden result pointer goes to x8, outside the argument
    // registers, so it is placed after them.
    if result.memory_register().is_some() {
        if result_ref {
            dest.push(mov(result_register(), result_pos.clone()));
        } else {
            dest.push(lea(result_register(), result_pos.clone()));
        }
    }

    dest.push(call(to_call));

    if result.memory_register().is_some() {
        // The callee wrote through x8; nothing to fetch.
    } else if result.register_count() > 0 {
        if result_ref {
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
                let off = result.register_offset(i);
                let out = match result_pos.kind() {
                    OperandKind::Var(v, o) => {
                        x_rel(r.size(), *v, *o + Offset::fixed(off as i32))
                    }
                    OperandKind::Rel(b, o) => {
                        x_rel(r.size(), *b, *o + Offset::fixed(off as i32))
                    }
                    OperandKind::Reg(rr) if off == 0 => {
                        reg::as_size(*rr, r.size()).map(Operand::from).unwrap_or_else(|| (*rr).into())
                    }
                    _ => {
                        return Err(CodegenError::invalid(
                            "can not address into the call result",
                        ))
                    }
                };
                dest.push(mov(out, r));
            }
        }
    }

    // Caller destroys the copies; protect a register-held result from the
    // destructor calls through a callee-saved register.
    if let Some(block) = state.created {
        let target = result_pos.clone();
        let mut need_protection = matches!(target.kind(), OperandKind::Reg(_));
        if need_protection {
            need_protection = dest
                .vars_in(block)
                .iter()
                .any(|v| dest.free_opt(*v).contains(FreeOpt::ON_BLOCK_EXIT));
        }

        if need_protection {
            // x28 is never handed out by the rewrite passes.
            let safe = reg::as_size(regs::xr(28), target.size())
                .ok_or_else(|| CodegenError::invalid("odd-sized call result"))?;
            dest.push(mov(safe, target.clone()));
            dest.push(end_block(block));
            dest.push(mov(target, safe));
        } else {
            dest.push(end_block(block));
        }
    }

    Ok(())
}
