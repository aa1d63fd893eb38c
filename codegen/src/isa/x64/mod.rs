//! The x86-64 backend: System V and Win64 calling conventions.

use crate::abi::Params;
use crate::eh::dwarf::{RegisterMapper, RegisterMappingError};
use crate::gc::RuntimeHooks;
use crate::inst::*;
use crate::isa::{TargetIsa, UnwindStyle};
use crate::listing::Listing;
use crate::operand::Operand;
use crate::output::Output;
use crate::refs::Ref;
use crate::reg::{self, Reg, RegSet, PTR_A, PTR_C};
use crate::result::CodegenResult;
use crate::size::Size;
use crate::transform::transform;
use crate::ty::{ptr_desc, TypeDesc};
use gimli::Register;
use std::rc::Rc;
use target_lexicon::{OperatingSystem, Triple};

mod abi;
mod call;
mod emit;
mod frame;
mod legalize;
pub(crate) mod regs;

pub(crate) struct X64Isa {
    triple: Triple,
    pub(crate) windows: bool,
    dirty: RegSet,
    hooks: RuntimeHooks,
    dwarf: X64DwarfMapper,
}

pub(crate) fn isa_from(triple: Triple, hooks: RuntimeHooks) -> Box<dyn TargetIsa> {
    Box::new(concrete_isa(triple, hooks))
}

pub(crate) fn concrete_isa(triple: Triple, hooks: RuntimeHooks) -> X64Isa {
    let windows = triple.operating_system == OperatingSystem::Windows;
    let dirty = if windows {
        regs::win64_dirty()
    } else {
        regs::sysv_dirty()
    };
    X64Isa {
        triple,
        windows,
        dirty,
        hooks,
        dwarf: X64DwarfMapper,
    }
}

impl X64Isa {
    pub(crate) fn new_params_impl(&self, member: bool) -> Box<dyn Params> {
        if self.windows {
            Box::new(abi::Win64Params::new(member))
        } else {
            Box::new(abi::SysVParams::new())
        }
    }
}

struct X64DwarfMapper;

impl RegisterMapper for X64DwarfMapper {
    fn map(&self, reg: Reg) -> Result<Register, RegisterMappingError> {
        regs::dwarf_reg(reg)
            .map(Register)
            .ok_or_else(|| RegisterMappingError::Unmapped(format!("{reg}")))
    }

    fn sp(&self) -> Register {
        Register(7)
    }

    fn ra(&self) -> Register {
        Register(16)
    }
}

impl TargetIsa for X64Isa {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn ptr_size(&self) -> u32 {
        8
    }

    fn dirty_regs(&self) -> &RegSet {
        &self.dirty
    }

    fn new_params(&self, member: bool) -> Box<dyn Params> {
        self.new_params_impl(member)
    }

    fn transform(&self, src: &Listing) -> CodegenResult<Listing> {
        let legal = transform(src, &mut legalize::Legalize::new(self))?;
        transform(&legal, &mut frame::Frame::new(self))
    }

    fn emit(&self, src: &Listing, out: &mut dyn Output) -> CodegenResult<()> {
        emit::emit_listing(src, out, self.windows)
    }

    fn unwind_style(&self) -> UnwindStyle {
        if self.windows {
            UnwindStyle::Seh64
        } else {
            UnwindStyle::Dwarf
        }
    }

    fn hooks(&self) -> &RuntimeHooks {
        &self.hooks
    }

    fn dwarf_mapper(&self) -> Option<&dyn RegisterMapper> {
        Some(&self.dwarf)
    }

    fn seh_reg(&self, reg: Reg) -> Option<crate::eh::seh::SehReg> {
        regs::seh_reg(reg)
    }

    fn redirect(
        &self,
        member: bool,
        result: &Rc<TypeDesc>,
        params: &[Rc<TypeDesc>],
        resolve: Ref,
        param: Operand,
    ) -> CodegenResult<Listing> {
        let mut l = Listing::new();

        // The layout tells us which registers carry parameters, so they
        // can be preserved across the resolver call.
        let mut layout = self.new_params_impl(member);
        layout.result_ty(result);
        for (i, p) in params.iter().enumerate() {
            layout.add(i as u16, p);
        }

        // The prolog/epilog pair lets exceptions from the resolver
        // propagate through this stub properly.
        l.push(prolog());

        let mut saved = Vec::new();
        for i in 0..layout.register_count() {
            if layout.register_param(i).is_none() {
                continue;
            }
            let v = l.create_var(l.root(), Size::LONG);
            let r = reg::as_size(layout.register_src(i), Size::LONG).unwrap();
            l.push(mov(v, r));
            saved.push((v, r));
        }

        if param.any() {
            l.push(fn_param(ptr_desc(), param));
        }
        l.push(fn_call(resolve, member, ptr_desc(), PTR_A));

        for (v, r) in saved {
            l.push(mov(r, v));
        }

        // No destructors here, so the epilog preserves all registers.
        l.push(epilog());
        l.push(jmp_to(PTR_A));

        Ok(l)
    }

    fn first_param_loc(&self, result: Option<&TypeDesc>) -> Operand {
        if self.windows {
            // The this pointer is always in the first register slot.
            return PTR_C.into();
        }
        match result {
            // A result returned in memory claims rdi; this lands in rsi.
            Some(r) if returns_in_memory(r) => regs::PTR_SI.into(),
            _ => regs::PTR_DI.into(),
        }
    }

    fn function_dispatch_reg(&self) -> Reg {
        PTR_A
    }
}

fn returns_in_memory(ty: &TypeDesc) -> bool {
    match ty {
        TypeDesc::Complex { .. } => true,
        TypeDesc::Simple(s) => s.size().size64() > 16,
        _ => false,
    }
}
