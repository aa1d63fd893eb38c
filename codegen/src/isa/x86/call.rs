//! Lowering of the `fn_call` primitives for cdecl.
//!
//! Everything travels on the stack: alignment padding is allocated first,
//! then the parameters are pushed in reverse order, four bytes at a time.
//! Complex parameters are copy-constructed into a fresh block and their
//! bytes pushed; the caller pops the whole area after the call.

use super::regs;
use super::X86Isa;
use crate::abi::{Params, RETURN_ID};
use crate::isa::TargetIsa;
use crate::inst::*;
use crate::listing::{Block, FreeOpt, Listing};
use crate::operand::{ptr_const, x_rel, Operand, OperandKind};
use crate::reg::{self, Reg, RegSet, PTR_STACK};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{round_up, Offset, Size};
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

fn free_reg(used: &RegSet, params: &[ParamInfo]) -> CodegenResult<Reg> {
    let mut tmp = used.clone();
    for p in params {
        if p.src.has_register() {
            tmp.put(p.src.reg());
        }
    }
    regs::unused_reg(&tmp).ok_or_else(|| CodegenError::invalid("no free register at function call"))
}

/// Push one parameter, last dword first.
fn push_param(
    dest: &mut Listing,
    tmp: Reg,
    p: &ParamInfo,
) -> CodegenResult<()> {
    let size = p.ty.size();
    let n = round_up(size.size32(), 4);

    if p.lea && !p.by_ref {
        let t = reg::as_size(tmp, Size::PTR).unwrap();
        dest.push(lea(t, p.src.clone()));
        dest.push(push(t));
        return Ok(());
    }

    // The base the dwords are read relative to.
    let addr = if p.by_ref {
        let t = reg::as_size(tmp, Size::PTR).unwrap();
        dest.push(mov(t, p.src.clone()));
        Some(t)
    } else {
        None
    };

    if n <= 4 && addr.is_none() {
        match p.src.kind() {
            // Sub-word values widen to a full slot.
            _ if size.size32() < 4 => {
                let t = reg::as_size(tmp, Size::INT).unwrap();
                dest.push(ucast(t, p.src.clone()));
                dest.push(push(t));
            }
            _ => {
                dest.push(push(p.src.clone()));
            }
        }
        return Ok(());
    }

    let mut off = n as i32;
    while off > 0 {
        off -= 4;
        let o = Offset::fixed(off);
        let slot = match addr {
            Some(a) => x_rel(Size::INT, a, o),
            None => match p.src.kind() {
                OperandKind::Var(v, vo) => x_rel(Size::INT, *v, *vo + o),
                OperandKind::Rel(r, ro) => x_rel(Size::INT, *r, *ro + o),
                _ => {
                    return Err(CodegenError::invalid(
                        "can not push this operand by dwords",
                    ))
                }
            },
        };
        dest.push(push(slot));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_fn_call(
    isa: &X86Isa,
    dest: &mut Listing,
    to_call: Operand,
    result_pos: Operand,
    result_ty: &Rc<TypeDesc>,
    result_ref: bool,
    current_block: Block,
    used: &RegSet,
    params: &mut Vec<ParamInfo>,
) -> CodegenResult<()> {
    let mut layout = isa.new_params_impl();
    layout.result_ty(result_ty);
    for (i, p) in params.iter().enumerate() {
        layout.add(i as u16, &p.ty);
    }

    let result = layout.result().clone();
    let mut created: Option<Block> = None;

    if result.memory_register().is_some() {
        params.push(ParamInfo {
            ty: ptr_desc(),
            src: result_pos.clone(),
            by_ref: false,
            lea: !result_ref,
        });
    }

    // Copy-construct complex parameters into a fresh block; their bytes
    // are pushed like any other value and the copies freed after the
    // call.
    if params.iter().any(|p| p.ty.is_complex()) {
        let block = *created.get_or_insert_with(|| {
            let b = dest.create_block(current_block);
            b
        });
        dest.push(begin_block(block).alter_dest(
            reg::as_size(free_reg(used, params).unwrap_or(reg::EAX), Size::INT)
                .unwrap()
                .into(),
        ));

        for i in 0..params.len() {
            let (ty, src, by_ref) = {
                let p = &params[i];
                (p.ty.clone(), p.src.clone(), p.by_ref)
            };
            let ctor = match &*ty {
                TypeDesc::Complex { ctor, .. } => ctor.clone(),
                _ => continue,
            };

            let opt = FreeOpt::INACTIVE | FreeOpt::ON_EXCEPTION | FreeOpt::ON_BLOCK_EXIT;
            let v = dest.create_typed_var(block, &ty, opt);

            // cdecl constructor call: ctor(dest, src).
            let t = reg::as_size(free_reg(used, params)?, Size::PTR).unwrap();
            if by_ref {
                dest.push(mov(t, src));
            } else {
                dest.push(lea(t, src));
            }
            dest.push(push(t));
            dest.push(lea(t, v));
            dest.push(push(t));
            dest.push(call(ctor));
            dest.push(add(PTR_STACK, ptr_const(8)));
            dest.push(activate(v));

            let p = &mut params[i];
            p.src = v.into();
            p.by_ref = false;
            p.lea = false;
        }
    }

    // The argument area: padding first, then pushes in reverse.
    let total = layout.stack_total_size();
    let raw: u32 = (0..layout.stack_count())
        .map(|i| round_up(layout.stack_param(i).size().aligned().size32(), 4))
        .sum();
    let pad = total - raw;
    if pad > 0 {
        dest.push(sub(PTR_STACK, ptr_const(pad as usize)));
    }

    let tmp = free_reg(used, params)?;
    for i in (0..layout.stack_count()).rev() {
        let id = layout.stack_param(i).id();
        let p = if id == RETURN_ID {
            params.last().unwrap().clone()
        } else {
            params[id as usize].clone()
        };
        push_param(dest, tmp, &p)?;
    }

    dest.push(call(to_call));

    // The caller pops.
    if total > 0 {
        dest.push(add(PTR_STACK, ptr_const(total as usize)));
    }

    // Fetch the result.
    if result.memory_register().is_some() {
        // Written through the hidden pointer.
    } else if result.register_count() > 0 {
        let first = result.register_at(0);
        if regs::is_fp0(first) {
            // The value sits on the x87 stack; pop it into place.
            match result_pos.kind() {
                OperandKind::Reg(_) => {
                    let v = dest.create_var(current_block, result_pos.size());
                    dest.push(fstp(Operand::from(v)));
                    dest.push(mov(result_pos.clone(), Operand::from(v)));
                }
                _ => {
                    dest.push(fstp(result_pos.clone()));
                }
            }
        } else if result.register_count() == 1
            && matches!(result_pos.kind(), OperandKind::Reg(_))
        {
            if !reg::same(first, result_pos.reg()) {
                dest.push(mov(result_pos.clone(), first));
            }
        } else {
            for i in 0..result.register_count() {
                let r = result.register_at(i);
                let off = Offset::fixed(result.register_offset(i) as i32);
                let out = match result_pos.kind() {
                    OperandKind::Var(v, o) => x_rel(r.size(), *v, *o + off),
                    OperandKind::Rel(b, o) => x_rel(r.size(), *b, *o + off),
                    OperandKind::Reg(rr) if result.register_offset(i) == 0 => {
                        Operand::from(reg::as_size(*rr, r.size()).unwrap_or(*rr))
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

    // Destroy the complex copies; a register-held result survives in a
    // block-local slot of the surrounding scope.
    if let Some(block) = created {
        let target = result_pos;
        let mut need_protection = matches!(target.kind(), OperandKind::Reg(_));
        if need_protection {
            need_protection = dest
                .vars_in(block)
                .iter()
                .any(|v| dest.free_opt(*v).contains(FreeOpt::ON_BLOCK_EXIT));
        }

        if need_protection {
            let v = dest.create_var(current_block, target.size());
            dest.push(mov(Operand::from(v), target.clone()));
            dest.push(end_block(block));
            dest.push(mov(target, Operand::from(v)));
        } else {
            dest.push(end_block(block));
        }
    }

    Ok(())
}
