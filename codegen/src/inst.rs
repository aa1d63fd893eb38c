//! Instructions and their factory functions.
//!
//! An [`Inst`] is an immutable `(opcode, dest, src)` record; the `Fn*`
//! opcodes additionally carry the [`TypeDesc`] of the value crossing the
//! function boundary and a member-call flag. Use the factory functions
//! below rather than constructing records directly: they enforce the
//! operand shapes each opcode accepts.

use crate::cond::CondFlag;
use crate::label::Label;
use crate::listing::{Block, Var};
use crate::op::{DestMode, Op};
use crate::operand::{Operand, SrcPos};
use crate::refs::Ref;
use crate::reg::Reg;
use crate::result::CodegenResult;
use crate::size::Size;
use crate::ty::TypeDesc;
use std::fmt;
use std::rc::Rc;

/// A single instruction. Immutable; the `alter*` methods produce modified
/// copies and are intended for the backends, which skip sanity checking.
#[derive(Clone)]
pub struct Inst {
    op: Op,
    dest: Operand,
    src: Operand,
    /// Type information for the `Fn*` opcodes.
    ty: Option<Rc<TypeDesc>>,
    /// Member-function call? Only meaningful for `FnCall`/`FnCallRef`.
    member: bool,
}

impl Inst {
    fn new(op: Op, dest: Operand, src: Operand) -> Inst {
        Inst {
            op,
            dest,
            src,
            ty: None,
            member: false,
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn dest(&self) -> &Operand {
        &self.dest
    }

    pub fn src(&self) -> &Operand {
        &self.src
    }

    pub fn mode(&self) -> DestMode {
        self.op.dest_mode()
    }

    pub fn ty(&self) -> Option<&Rc<TypeDesc>> {
        self.ty.as_ref()
    }

    pub fn member(&self) -> bool {
        self.member
    }

    /// The larger of the two operand sizes.
    pub fn size(&self) -> Size {
        if self.dest.size().size64() > self.src.size().size64() {
            self.dest.size()
        } else {
            self.src.size()
        }
    }

    pub fn alter(&self, dest: Operand, src: Operand) -> Inst {
        Inst {
            dest,
            src,
            ..self.clone()
        }
    }

    pub fn alter_src(&self, src: Operand) -> Inst {
        Inst {
            src,
            ..self.clone()
        }
    }

    pub fn alter_dest(&self, dest: Operand) -> Inst {
        Inst {
            dest,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.op)?;
        if self.dest.any() {
            write!(f, " {:?}", self.dest)?;
        }
        if self.src.any() {
            write!(f, ", {:?}", self.src)?;
        }
        if let Some(ty) = &self.ty {
            write!(f, " <{ty:?}>")?;
        }
        Ok(())
    }
}

/// Checked two-operand constructor: `dest` must be writable (and readable
/// if the opcode reads it), `src` must be readable.
pub fn instr_dest_src(op: Op, dest: Operand, src: Operand) -> CodegenResult<Inst> {
    src.ensure_readable(op)?;
    if op.dest_mode().reads() {
        dest.ensure_readable(op)?;
    }
    if op.dest_mode().writes() {
        dest.ensure_writable(op)?;
    }
    Ok(Inst::new(op, dest, src))
}

/// Unchecked constructor for pseudo-instructions and backend internals.
pub fn instr_loose(op: Op, dest: Operand, src: Operand) -> Inst {
    Inst::new(op, dest, src)
}

macro_rules! dest_src_op {
    ($(#[$meta:meta])* $name:ident, $op:expr) => {
        $(#[$meta])*
        pub fn $name(dest: impl Into<Operand>, src: impl Into<Operand>) -> Inst {
            Inst::new($op, dest.into(), src.into())
        }
    };
}

pub fn nop() -> Inst {
    Inst::new(Op::Nop, Operand::none(), Operand::none())
}

dest_src_op!(mov, Op::Mov);
dest_src_op!(lea, Op::Lea);
dest_src_op!(add, Op::Add);
dest_src_op!(adc, Op::Adc);
dest_src_op!(sub, Op::Sub);
dest_src_op!(sbb, Op::Sbb);
dest_src_op!(cmp, Op::Cmp);
dest_src_op!(test, Op::Test);
dest_src_op!(band, Op::And);
dest_src_op!(bor, Op::Or);
dest_src_op!(bxor, Op::Xor);
dest_src_op!(mul, Op::Mul);
dest_src_op!(idiv, Op::IDiv);
dest_src_op!(udiv, Op::UDiv);
dest_src_op!(imod, Op::IMod);
dest_src_op!(umod, Op::UMod);
dest_src_op!(shl, Op::Shl);
dest_src_op!(shr, Op::Shr);
dest_src_op!(sar, Op::Sar);
dest_src_op!(
    /// Sign-extending or truncating width conversion.
    icast,
    Op::ICast
);
dest_src_op!(
    /// Zero-extending or truncating width conversion.
    ucast,
    Op::UCast
);
dest_src_op!(fadd, Op::FAdd);
dest_src_op!(fsub, Op::FSub);
dest_src_op!(fneg, Op::FNeg);
dest_src_op!(fmul, Op::FMul);
dest_src_op!(fdiv, Op::FDiv);
dest_src_op!(fcmp, Op::FCmp);
dest_src_op!(fcast, Op::FCast);
dest_src_op!(fcasti, Op::FCastI);
dest_src_op!(fcastu, Op::FCastU);
dest_src_op!(icastf, Op::ICastF);
dest_src_op!(ucastf, Op::UCastF);

pub fn bnot(dest: impl Into<Operand>) -> Inst {
    Inst::new(Op::Not, dest.into(), Operand::none())
}

/// Exchange a register with another operand.
pub fn swap(a: Reg, b: impl Into<Operand>) -> Inst {
    Inst::new(Op::Swap, a.into(), b.into())
}

pub fn push(v: impl Into<Operand>) -> Inst {
    Inst::new(Op::Push, Operand::none(), v.into())
}

pub fn pop(v: impl Into<Operand>) -> Inst {
    Inst::new(Op::Pop, v.into(), Operand::none())
}

pub fn push_flags() -> Inst {
    Inst::new(Op::PushFlags, Operand::none(), Operand::none())
}

pub fn pop_flags() -> Inst {
    Inst::new(Op::PopFlags, Operand::none(), Operand::none())
}

/// Unconditional jump to an arbitrary target (label, register, or
/// reference).
pub fn jmp_to(target: impl Into<Operand>) -> Inst {
    Inst::new(Op::Jmp, target.into(), CondFlag::Always.into())
}

/// Conditional jump to a label.
pub fn jmp(to: Label, cond: CondFlag) -> Inst {
    Inst::new(Op::Jmp, to.into(), cond.into())
}

pub fn call(target: impl Into<Operand>) -> Inst {
    Inst::new(Op::Call, target.into(), Operand::none())
}

pub fn ret() -> Inst {
    Inst::new(Op::Ret, Operand::none(), Operand::none())
}

/// Store the truth value of `cond` into a byte operand.
pub fn set_cond(dest: impl Into<Operand>, cond: CondFlag) -> Inst {
    Inst::new(Op::SetCond, dest.into(), cond.into())
}

// x86 FP-stack transfers (32-bit calling convention support).
pub fn fstp(dest: impl Into<Operand>) -> Inst {
    Inst::new(Op::FStp, dest.into(), Operand::none())
}

pub fn fld(src: impl Into<Operand>) -> Inst {
    Inst::new(Op::FLd, Operand::none(), src.into())
}

/// Raw data emitted into the instruction stream.
pub fn dat(v: impl Into<Operand>) -> Inst {
    Inst::new(Op::Dat, Operand::none(), v.into())
}

/// A 4-byte offset of `l` relative to the start of the blob.
pub fn lbl_offset(l: Label) -> Inst {
    Inst::new(Op::LblOffset, Operand::none(), l.into())
}

/// Align the output position to the alignment of `s`.
pub fn align_as(s: Size) -> Inst {
    Inst::new(Op::Align, Operand::none(), crate::operand::size_const(s))
}

pub fn prolog() -> Inst {
    Inst::new(Op::Prolog, Operand::none(), Operand::none())
}

pub fn epilog() -> Inst {
    Inst::new(Op::Epilog, Operand::none(), Operand::none())
}

/// Record that `reg` has been preserved at `at` for debug-info consumers.
pub fn preserve(at: impl Into<Operand>, reg: Reg) -> Inst {
    Inst::new(Op::Preserve, at.into(), reg.into())
}

pub fn location(pos: SrcPos) -> Inst {
    Inst::new(Op::Location, Operand::none(), pos.into())
}

pub fn meta() -> Inst {
    Inst::new(Op::Meta, Operand::none(), Operand::none())
}

pub fn begin_block(b: Block) -> Inst {
    Inst::new(Op::BeginBlock, Operand::none(), b.into())
}

pub fn end_block(b: Block) -> Inst {
    Inst::new(Op::EndBlock, Operand::none(), b.into())
}

/// Jump to `to`, destroying blocks until `block` is the active one. The
/// lexical nesting after the instruction is unchanged.
pub fn jmp_block(to: Label, block: Block) -> Inst {
    Inst::new(Op::JmpBlock, to.into(), block.into())
}

pub fn activate(v: Var) -> Inst {
    Inst::new(Op::Activate, Operand::none(), v.into())
}

pub fn thread_local() -> Inst {
    Inst::new(Op::ThreadLocal, Operand::none(), Operand::none())
}

/// Pass a typed parameter to an upcoming `fn_call`.
pub fn fn_param(ty: Rc<TypeDesc>, src: impl Into<Operand>) -> Inst {
    Inst {
        ty: Some(ty),
        ..Inst::new(Op::FnParam, Operand::none(), src.into())
    }
}

/// Pass a typed parameter whose address is in `src`.
pub fn fn_param_ref(ty: Rc<TypeDesc>, src: impl Into<Operand>) -> Inst {
    Inst {
        ty: Some(ty),
        ..Inst::new(Op::FnParamRef, Operand::none(), src.into())
    }
}

/// Call `target`, storing a result described by `ty` into `result`.
pub fn fn_call(target: Ref, member: bool, ty: Rc<TypeDesc>, result: impl Into<Operand>) -> Inst {
    Inst {
        ty: Some(ty),
        member,
        ..Inst::new(Op::FnCall, result.into(), target.into())
    }
}

/// Call `target`, storing the result through the pointer in `result`.
pub fn fn_call_ref(
    target: Ref,
    member: bool,
    ty: Rc<TypeDesc>,
    result: impl Into<Operand>,
) -> Inst {
    Inst {
        ty: Some(ty),
        member,
        ..Inst::new(Op::FnCallRef, result.into(), target.into())
    }
}

/// Return the value in `src`.
pub fn fn_ret(src: impl Into<Operand>) -> Inst {
    Inst::new(Op::FnRet, Operand::none(), src.into())
}

/// Return the value whose address is in `src`.
pub fn fn_ret_ref(src: impl Into<Operand>) -> Inst {
    Inst::new(Op::FnRetRef, Operand::none(), src.into())
}
