//! The AArch64 backend (AAPCS64).

use crate::abi::Params;
use crate::eh::dwarf::{RegisterMapper, RegisterMappingError};
use crate::gc::RuntimeHooks;
use crate::inst::*;
use crate::isa::{TargetIsa, UnwindStyle};
use crate::listing::Listing;
use crate::operand::Operand;
use crate::output::Output;
use crate::refs::Ref;
use crate::reg::{self, Reg, RegSet, PTR_A};
use crate::result::CodegenResult;
use crate::size::Size;
use crate::transform::transform;
use crate::ty::{ptr_desc, TypeDesc};
use gimli::Register;
use std::rc::Rc;
use target_lexicon::Triple;

mod abi;
mod call;
mod emit;
mod frame;
mod legalize;
pub(crate) mod regs;

pub(crate) struct Aarch64Isa {
    triple: Triple,
    dirty: RegSet,
    hooks: RuntimeHooks,
    dwarf: Aarch64DwarfMapper,
}

pub(crate) fn isa_from(triple: Triple, hooks: RuntimeHooks) -> Box<dyn TargetIsa> {
    Box::new(Aarch64Isa {
        triple,
        dirty: regs::dirty(),
        hooks,
        dwarf: Aarch64DwarfMapper,
    })
}

impl Aarch64Isa {
    pub(crate) fn new_params_impl(&self) -> Box<dyn Params> {
        Box::new(abi::Aarch64Params::new())
    }
}

struct Aarch64DwarfMapper;

impl RegisterMapper for Aarch64DwarfMapper {
    fn map(&self, reg: Reg) -> Result<Register, RegisterMappingError> {
        regs::dwarf_reg(reg)
            .map(Register)
            .ok_or_else(|| RegisterMappingError::Unmapped(format!("{reg}")))
    }

    fn sp(&self) -> Register {
        Register(31)
    }

    fn ra(&self) -> Register {
        // The link register, x30.
        Register(30)
    }
}

impl TargetIsa for Aarch64Isa {
    fn name(&self) -> &'static str {
        "aarch64"
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
        // The AAPCS does not treat member calls specially.
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
        UnwindStyle::Dwarf
    }

    fn initial_sp_offset(&self) -> u32 {
        // The return address arrives in the link register, not on the
        // stack.
        0
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
        let mut l = Listing::new();

        let mut layout = self.new_params_impl();
        layout.result_ty(result);
        for (i, p) in params.iter().enumerate() {
            layout.add(i as u16, p);
        }

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

        l.push(epilog());
        l.push(jmp_to(PTR_A));

        Ok(l)
    }

    fn first_param_loc(&self, _result: Option<&TypeDesc>) -> Operand {
        // Results in memory use x8, so x0 always carries this.
        regs::ptr_r(0).into()
    }

    fn function_dispatch_reg(&self) -> Reg {
        // x9: a temporary that carries no arguments.
        regs::ptr_r(9)
    }
}
