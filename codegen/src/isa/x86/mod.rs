//! The 32-bit x86 backend (cdecl).

use crate::abi::Params;
use crate::eh::dwarf::{RegisterMapper, RegisterMappingError};
use crate::gc::RuntimeHooks;
use crate::inst::*;
use crate::isa::{TargetIsa, UnwindStyle};
use crate::listing::Listing;
use crate::operand::{ptr_rel, Operand};
use crate::output::Output;
use crate::refs::Ref;
use crate::reg::{Reg, RegSet, PTR_A, PTR_FRAME};
use crate::result::CodegenResult;
use crate::size::Offset;
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

pub(crate) struct X86Isa {
    triple: Triple,
    windows: bool,
    dirty: RegSet,
    hooks: RuntimeHooks,
    dwarf: X86DwarfMapper,
}

pub(crate) fn isa_from(triple: Triple, hooks: RuntimeHooks) -> Box<dyn TargetIsa> {
    let windows = triple.operating_system == OperatingSystem::Windows;
    Box::new(X86Isa {
        triple,
        windows,
        dirty: regs::dirty(),
        hooks,
        dwarf: X86DwarfMapper,
    })
}

impl X86Isa {
    pub(crate) fn new_params_impl(&self) -> Box<dyn Params> {
        Box::new(abi::CdeclParams::new())
    }
}

struct X86DwarfMapper;

impl RegisterMapper for X86DwarfMapper {
    fn map(&self, reg: Reg) -> Result<Register, RegisterMappingError> {
        regs::dwarf_reg(reg)
            .map(Register)
            .ok_or_else(|| RegisterMappingError::Unmapped(format!("{reg}")))
    }

    fn sp(&self) -> Register {
        Register(4)
    }

    fn ra(&self) -> Register {
        Register(8)
    }
}

impl TargetIsa for X86Isa {
    fn name(&self) -> &'static str {
        "x86"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn ptr_size(&self) -> u32 {
        4
    }

    fn dirty_regs(&self) -> &RegSet {
        &self.dirty
    }

    fn new_params(&self, member: bool) -> Box<dyn Params> {
        // cdecl treats the this pointer as an ordinary first parameter.
        let _ = member;
        self.new_params_impl()
    }

    fn transform(&self, src: &Listing) -> CodegenResult<Listing> {
        let legal = transform(src, &mut legalize::Legalize::new(self))?;
        transform(&legal, &mut frame::Frame::new(self))
    }

    fn emit(&self, src: &Listing, out: &mut dyn Output) -> CodegenResult<()> {
        emit::emit_listing(src, out)
    }

    fn unwind_style(&self) -> UnwindStyle {
        if self.windows {
            // The fs:[0] chain is managed by the language runtime's
            // handler; no metadata is appended to the allocation.
            UnwindStyle::Seh32
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

    fn redirect(
        &self,
        member: bool,
        result: &Rc<TypeDesc>,
        params: &[Rc<TypeDesc>],
        resolve: Ref,
        param: Operand,
    ) -> CodegenResult<Listing> {
        // All parameters already rest on the stack, so nothing needs
        // saving: resolve the target and tail-jump.
        let mut l = Listing::new();
        let _ = (result, params);

        l.push(prolog());
        if param.any() {
            l.push(fn_param(ptr_desc(), param));
        }
        l.push(fn_call(resolve, member, ptr_desc(), PTR_A));
        l.push(epilog());
        l.push(jmp_to(PTR_A));

        Ok(l)
    }

    fn first_param_loc(&self, _result: Option<&TypeDesc>) -> Operand {
        // The first cdecl parameter sits just above the return address.
        ptr_rel(PTR_FRAME, Offset::fixed(8))
    }

    fn function_dispatch_reg(&self) -> Reg {
        PTR_A
    }
}

