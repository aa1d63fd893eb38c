//! Operands for listing instructions.
//!
//! An operand is a tagged union over the things an instruction can touch:
//! constants, registers, memory relative to a register, label or variable,
//! labels and blocks themselves, symbolic references, condition flags, and
//! source positions. The operand carries a *logical* size distinct from
//! the size of its backing storage: reading the low 32 bits of an 8-byte
//! variable is expressed by narrowing the operand, not the variable.

use crate::cond::CondFlag;
use crate::label::Label;
use crate::listing::{Block, Var};
use crate::op::Op;
use crate::refs::Ref;
use crate::reg::{self, Reg};
use crate::result::{CodegenError, CodegenResult};
use crate::size::{Offset, Size};
use std::fmt;

/// A position in the source program, forwarded to debug-info consumers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SrcPos {
    pub file: u32,
    pub pos: u32,
}

/// The payload of an operand.
#[derive(Clone, PartialEq, Debug)]
pub enum OperandKind {
    None,
    /// A constant word.
    Const(u64),
    /// Two constants, one per pointer width. Appears wherever a `Size` or
    /// `Offset` is used as an immediate.
    DualConst(i64, i64),
    Reg(Reg),
    /// Memory at `reg + offset`.
    Rel(Reg, Offset),
    /// Memory at `label + offset`.
    LabelRel(Label, Offset),
    /// A variable, or memory at `var + offset`.
    Var(Var, Offset),
    Label(Label),
    Block(Block),
    /// A symbolic external reference.
    Ref(Ref),
    /// A pointer to a heap object the collector may move.
    Obj(usize),
    Cond(CondFlag),
    SrcPos(SrcPos),
}

/// An operand together with its logical size.
#[derive(Clone, PartialEq)]
pub struct Operand {
    kind: OperandKind,
    size: Size,
}

impl Operand {
    pub fn none() -> Operand {
        Operand {
            kind: OperandKind::None,
            size: Size::ZERO,
        }
    }

    pub(crate) fn new(kind: OperandKind, size: Size) -> Operand {
        Operand { kind, size }
    }

    pub fn kind(&self) -> &OperandKind {
        &self.kind
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, OperandKind::None)
    }

    pub fn any(&self) -> bool {
        !self.is_none()
    }

    /// Can this operand be read as a value?
    pub fn readable(&self) -> bool {
        use OperandKind::*;
        matches!(
            self.kind,
            Const(_) | DualConst(..) | Reg(_) | Rel(..) | LabelRel(..) | Var(..) | Ref(_) | Obj(_)
        )
    }

    /// Can this operand be written to?
    pub fn writable(&self) -> bool {
        use OperandKind::*;
        matches!(self.kind, Reg(_) | Rel(..) | Var(..))
    }

    pub(crate) fn ensure_readable(&self, op: Op) -> CodegenResult<()> {
        if self.readable() {
            Ok(())
        } else {
            Err(CodegenError::invalid(format!(
                "{op:?}: operand {self:?} is not readable"
            )))
        }
    }

    pub(crate) fn ensure_writable(&self, op: Op) -> CodegenResult<()> {
        if self.writable() {
            Ok(())
        } else {
            Err(CodegenError::invalid(format!(
                "{op:?}: operand {self:?} is not writable"
            )))
        }
    }

    /// Does this operand use a register, either directly or as the base of
    /// a memory access? Variables do not count: they are rewritten to
    /// frame-relative accesses only during layout.
    pub fn has_register(&self) -> bool {
        matches!(self.kind, OperandKind::Reg(_) | OperandKind::Rel(..))
    }

    /// The constant stored, picking the width-appropriate half of a dual
    /// constant.
    pub fn const_value(&self, use64: bool) -> u64 {
        match self.kind {
            OperandKind::Const(c) => c,
            OperandKind::DualConst(v32, v64) => {
                if use64 {
                    v64 as u64
                } else {
                    v32 as u64
                }
            }
            _ => panic!("not a constant: {self:?}"),
        }
    }

    pub fn reg(&self) -> Reg {
        match self.kind {
            OperandKind::Reg(r) | OperandKind::Rel(r, _) => r,
            _ => panic!("operand has no register: {self:?}"),
        }
    }

    pub fn offset(&self) -> Offset {
        match self.kind {
            OperandKind::Rel(_, o) | OperandKind::Var(_, o) | OperandKind::LabelRel(_, o) => o,
            _ => Offset::ZERO,
        }
    }

    pub fn var(&self) -> Var {
        match self.kind {
            OperandKind::Var(v, _) => v,
            _ => panic!("not a variable: {self:?}"),
        }
    }

    pub fn label(&self) -> Label {
        match self.kind {
            OperandKind::Label(l) | OperandKind::LabelRel(l, _) => l,
            _ => panic!("not a label: {self:?}"),
        }
    }

    pub fn block(&self) -> Block {
        match self.kind {
            OperandKind::Block(b) => b,
            _ => panic!("not a block: {self:?}"),
        }
    }

    pub fn cond(&self) -> CondFlag {
        match self.kind {
            OperandKind::Cond(c) => c,
            _ => panic!("not a condition: {self:?}"),
        }
    }

    pub fn reference(&self) -> Ref {
        match &self.kind {
            OperandKind::Ref(r) => r.clone(),
            _ => panic!("not a reference: {self:?}"),
        }
    }

    /// Replace the register in this operand, keeping size and offset. A
    /// no-op for operands without a register.
    pub fn replace_register(&self, replace: Reg) -> Operand {
        match self.kind {
            OperandKind::Reg(_) => Operand::new(
                OperandKind::Reg(reg::as_size(replace, self.size).unwrap_or(replace)),
                self.size,
            ),
            OperandKind::Rel(_, o) => Operand::new(OperandKind::Rel(replace, o), self.size),
            _ => self.clone(),
        }
    }

    /// Narrow or widen the logical size, keeping the location.
    pub fn resized(&self, size: Size) -> Operand {
        let kind = match self.kind.clone() {
            OperandKind::Reg(r) => OperandKind::Reg(reg::as_size(r, size).unwrap_or(r)),
            k => k,
        };
        Operand { kind, size }
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Operand {
        Operand::new(OperandKind::Reg(r), r.size())
    }
}

impl From<CondFlag> for Operand {
    fn from(c: CondFlag) -> Operand {
        Operand::new(OperandKind::Cond(c), Size::ZERO)
    }
}

impl From<Var> for Operand {
    fn from(v: Var) -> Operand {
        let size = v.size();
        Operand::new(OperandKind::Var(v, Offset::ZERO), size)
    }
}

impl From<Block> for Operand {
    fn from(b: Block) -> Operand {
        Operand::new(OperandKind::Block(b), Size::ZERO)
    }
}

impl From<Label> for Operand {
    fn from(l: Label) -> Operand {
        Operand::new(OperandKind::Label(l), Size::PTR)
    }
}

impl From<Ref> for Operand {
    fn from(r: Ref) -> Operand {
        Operand::new(OperandKind::Ref(r), Size::PTR)
    }
}

impl From<SrcPos> for Operand {
    fn from(p: SrcPos) -> Operand {
        Operand::new(OperandKind::SrcPos(p), Size::ZERO)
    }
}

/// Constant constructors.
pub fn byte_const(v: u8) -> Operand {
    Operand::new(OperandKind::Const(v as u64), Size::BYTE)
}

pub fn int_const(v: i32) -> Operand {
    Operand::new(OperandKind::Const(v as u32 as u64), Size::INT)
}

pub fn nat_const(v: u32) -> Operand {
    Operand::new(OperandKind::Const(v as u64), Size::INT)
}

pub fn long_const(v: i64) -> Operand {
    Operand::new(OperandKind::Const(v as u64), Size::LONG)
}

pub fn word_const(v: u64) -> Operand {
    Operand::new(OperandKind::Const(v), Size::LONG)
}

pub fn float_const(v: f32) -> Operand {
    Operand::new(OperandKind::Const(v.to_bits() as u64), Size::FLOAT)
}

pub fn double_const(v: f64) -> Operand {
    Operand::new(OperandKind::Const(v.to_bits()), Size::DOUBLE)
}

/// A pointer-sized constant.
pub fn ptr_const(v: usize) -> Operand {
    Operand::new(OperandKind::Const(v as u64), Size::PTR)
}

/// A pointer-sized constant holding an `Offset` (one value per width).
pub fn offset_const(v: Offset) -> Operand {
    Operand::new(
        OperandKind::DualConst(v.v32() as i64, v.v64() as i64),
        Size::PTR,
    )
}

/// A pointer-sized constant holding a `Size` (one value per width).
pub fn size_const(v: Size) -> Operand {
    Operand::new(
        OperandKind::DualConst(v.size32() as i64, v.size64() as i64),
        Size::PTR,
    )
}

/// A pointer to a heap object that the collector may move.
pub fn obj_ptr(ptr: usize) -> Operand {
    Operand::new(OperandKind::Obj(ptr), Size::PTR)
}

/// Base of a register-relative, variable-relative or label-relative
/// memory operand.
pub trait RelBase {
    fn rel(self, size: Size, offset: Offset) -> Operand;
}

impl RelBase for Reg {
    fn rel(self, size: Size, offset: Offset) -> Operand {
        Operand::new(OperandKind::Rel(self, offset), size)
    }
}

impl RelBase for Var {
    fn rel(self, size: Size, offset: Offset) -> Operand {
        Operand::new(OperandKind::Var(self, offset), size)
    }
}

impl RelBase for Label {
    fn rel(self, size: Size, offset: Offset) -> Operand {
        Operand::new(OperandKind::LabelRel(self, offset), size)
    }
}

/// Memory operand of an explicit size.
pub fn x_rel(size: Size, base: impl RelBase, offset: Offset) -> Operand {
    base.rel(size, offset)
}

pub fn byte_rel(base: impl RelBase, offset: Offset) -> Operand {
    x_rel(Size::BYTE, base, offset)
}

pub fn int_rel(base: impl RelBase, offset: Offset) -> Operand {
    x_rel(Size::INT, base, offset)
}

pub fn long_rel(base: impl RelBase, offset: Offset) -> Operand {
    x_rel(Size::LONG, base, offset)
}

pub fn float_rel(base: impl RelBase, offset: Offset) -> Operand {
    x_rel(Size::FLOAT, base, offset)
}

pub fn double_rel(base: impl RelBase, offset: Offset) -> Operand {
    x_rel(Size::DOUBLE, base, offset)
}

pub fn ptr_rel(base: impl RelBase, offset: Offset) -> Operand {
    x_rel(Size::PTR, base, offset)
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use OperandKind::*;
        match &self.kind {
            None => write!(f, "-"),
            Const(c) => write!(f, "#{c:#x}:{:?}", self.size),
            DualConst(a, b) => write!(f, "#{a}/{b}"),
            Reg(r) => write!(f, "{r}"),
            Rel(r, o) => write!(f, "[{r}{o:?}]:{:?}", self.size),
            LabelRel(l, o) => write!(f, "[{l}{o:?}]:{:?}", self.size),
            Var(v, o) => write!(f, "[v{}{o:?}]:{:?}", v.key(), self.size),
            Label(l) => write!(f, "{l}"),
            Block(b) => write!(f, "b{}", b.key()),
            Ref(r) => write!(f, "{r:?}"),
            Obj(p) => write!(f, "obj{p:#x}"),
            Cond(c) => write!(f, "{c}"),
            SrcPos(p) => write!(f, "@{}:{}", p.file, p.pos),
        }
    }
}
