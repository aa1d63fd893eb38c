//! Target instruction-set architectures.
//!
//! A [`TargetIsa`] bundles everything the shared machinery needs from a
//! backend: the parameter classifier for its calling convention, the
//! transform pipeline that lowers a listing, the emitter, and the shape of
//! its unwind metadata.

use crate::abi::Params;
use crate::gc::RuntimeHooks;
use crate::listing::Listing;
use crate::operand::Operand;
use crate::output::Output;
use crate::refs::Ref;
use crate::reg::{Reg, RegSet};
use crate::result::CodegenResult;
use crate::ty::TypeDesc;
use anyhow::{anyhow, Result};
use core::fmt::Formatter;
use std::fmt::{self, Debug, Display};
use std::rc::Rc;
use target_lexicon::{Architecture, Triple};

#[cfg(feature = "x64")]
pub(crate) mod x64;

#[cfg(feature = "x86")]
pub(crate) mod x86;

#[cfg(feature = "arm64")]
pub(crate) mod aarch64;

macro_rules! isa {
    ($name: ident, $cfg_terms: tt, $triple: ident, $hooks: ident) => {{
        #[cfg $cfg_terms]
        {
            Ok($name::isa_from($triple, $hooks))
        }
        #[cfg(not $cfg_terms)]
        {
            Err(anyhow!(LookupError::SupportDisabled))
        }
    }};
}

/// Look up an ISA for the given target triple, with default runtime
/// hooks.
pub fn lookup(triple: Triple) -> Result<Box<dyn TargetIsa>> {
    lookup_with_hooks(triple, RuntimeHooks::default())
}

/// Look up an ISA, supplying the runtime entry points generated code
/// calls into.
pub fn lookup_with_hooks(triple: Triple, hooks: RuntimeHooks) -> Result<Box<dyn TargetIsa>> {
    match triple.architecture {
        Architecture::X86_64 => {
            isa!(x64, (feature = "x64"), triple, hooks)
        }
        Architecture::X86_32(_) => {
            isa!(x86, (feature = "x86"), triple, hooks)
        }
        Architecture::Aarch64 { .. } => {
            isa!(aarch64, (feature = "arm64"), triple, hooks)
        }

        _ => Err(anyhow!(LookupError::Unsupported)),
    }
}

impl std::error::Error for LookupError {}
impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Unsupported => write!(f, "This target is not supported yet"),
            LookupError::SupportDisabled => write!(f, "Support for this target was disabled"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum LookupError {
    Unsupported,
    // Covers the case in which the consumer disabled the relevant
    // architecture feature.
    #[allow(dead_code)]
    SupportDisabled,
}

/// The flavor of unwind metadata a target produces.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnwindStyle {
    /// DWARF CIE/FDE records for the POSIX unwinder.
    Dwarf,
    /// `RUNTIME_FUNCTION` + `UNWIND_INFO` appended to the allocation.
    Seh64,
    /// fs:[0]-linked frames emitted inline by the prolog; no appended
    /// metadata.
    Seh32,
}

/// A compiled-code target.
pub trait TargetIsa {
    /// Name of this ISA.
    fn name(&self) -> &'static str;

    /// The target triple of the ISA.
    fn triple(&self) -> &Triple;

    /// Pointer size in bytes.
    fn ptr_size(&self) -> u32;

    /// Registers not preserved across function calls on this target.
    fn dirty_regs(&self) -> &RegSet;

    /// Remove all registers not preserved during a function call.
    fn remove_fn_regs(&self, from: &mut RegSet) {
        for r in self.dirty_regs().iter() {
            from.remove(r);
        }
    }

    /// A fresh parameter classifier for this target's calling convention.
    fn new_params(&self, member: bool) -> Box<dyn Params>;

    /// Lower a listing: legalize operand forms, then lay out the frame.
    /// The result only uses operations and operand combinations the
    /// emitter accepts, and a second application is the identity.
    fn transform(&self, src: &Listing) -> CodegenResult<Listing>;

    /// Emit a transformed listing through an output sink.
    fn emit(&self, src: &Listing, out: &mut dyn Output) -> CodegenResult<()>;

    /// Which unwind metadata this target produces.
    fn unwind_style(&self) -> UnwindStyle;

    /// The CFA offset above the stack pointer at function entry: the
    /// pushed return address on the x86 family, nothing on AArch64.
    fn initial_sp_offset(&self) -> u32 {
        self.ptr_size()
    }

    /// The runtime entry points generated code calls.
    fn hooks(&self) -> &RuntimeHooks;

    /// DWARF register numbering, for targets with `UnwindStyle::Dwarf`.
    fn dwarf_mapper(&self) -> Option<&dyn crate::eh::dwarf::RegisterMapper> {
        None
    }

    /// SEH register numbering, for targets with `UnwindStyle::Seh64`.
    fn seh_reg(&self, _reg: Reg) -> Option<crate::eh::seh::SehReg> {
        None
    }

    /// A function that calls `resolve` (optionally passing `param`) to
    /// find the actual target, then tail-jumps to it with all argument
    /// registers intact. Used to implement lazy compilation.
    fn redirect(
        &self,
        member: bool,
        result: &Rc<TypeDesc>,
        params: &[Rc<TypeDesc>],
        resolve: Ref,
        param: Operand,
    ) -> CodegenResult<Listing>;

    /// The location of the first (this) parameter for a member call with
    /// the given result type.
    fn first_param_loc(&self, result: Option<&TypeDesc>) -> Operand;

    /// A register safe for implementing function dispatch stubs.
    fn function_dispatch_reg(&self) -> Reg;
}

impl Debug for &dyn TargetIsa {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Target ISA {{ triple: {:?} }}", self.triple())
    }
}
