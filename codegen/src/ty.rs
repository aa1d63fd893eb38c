//! Low-level type descriptions used by calling-convention classification.
//!
//! A [`TypeDesc`] tells a backend just enough about a value crossing a
//! function boundary to follow the target's calling convention:
//!
//! - a *primitive* is a number the CPU handles directly (pointer, integer
//!   or floating point);
//! - a *simple* type is a trivially-copyable aggregate, decomposed into
//!   its primitive members at known offsets;
//! - a *complex* type can not be trivially copied, so only its size and
//!   its copy constructor and destructor matter.

use crate::refs::Ref;
use crate::size::{Offset, Size};
use smallvec::SmallVec;
use std::rc::Rc;

/// What kind of number a primitive is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PrimitiveKind {
    None,
    Pointer,
    Integer,
    Real,
}

/// A primitive member: kind, size, and offset within its aggregate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Primitive {
    pub kind: PrimitiveKind,
    pub size: Size,
    pub offset: Offset,
}

impl Primitive {
    pub fn new(kind: PrimitiveKind, size: Size, offset: Offset) -> Primitive {
        Primitive { kind, size, offset }
    }

    pub fn move_to(self, offset: Offset) -> Primitive {
        Primitive { offset, ..self }
    }
}

pub fn byte_primitive() -> Primitive {
    Primitive::new(PrimitiveKind::Integer, Size::BYTE, Offset::ZERO)
}

pub fn int_primitive() -> Primitive {
    Primitive::new(PrimitiveKind::Integer, Size::INT, Offset::ZERO)
}

pub fn long_primitive() -> Primitive {
    Primitive::new(PrimitiveKind::Integer, Size::LONG, Offset::ZERO)
}

pub fn ptr_primitive() -> Primitive {
    Primitive::new(PrimitiveKind::Pointer, Size::PTR, Offset::ZERO)
}

pub fn float_primitive() -> Primitive {
    Primitive::new(PrimitiveKind::Real, Size::FLOAT, Offset::ZERO)
}

pub fn double_primitive() -> Primitive {
    Primitive::new(PrimitiveKind::Real, Size::DOUBLE, Offset::ZERO)
}

/// A trivially-copyable aggregate: a size plus its primitive members,
/// sorted by offset.
#[derive(Clone, Debug)]
pub struct SimpleDesc {
    size: Size,
    parts: SmallVec<[Primitive; 4]>,
}

impl SimpleDesc {
    pub fn new(size: Size, parts: impl IntoIterator<Item = Primitive>) -> SimpleDesc {
        let mut parts: SmallVec<[Primitive; 4]> = parts.into_iter().collect();
        parts.sort_by_key(|p| p.offset.v64());
        SimpleDesc { size, parts }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn parts(&self) -> &[Primitive] {
        &self.parts
    }
}

/// Description of a type crossing a function boundary.
#[derive(Clone, Debug)]
pub enum TypeDesc {
    /// Nothing is passed or returned.
    Void,
    Primitive(Primitive),
    Simple(SimpleDesc),
    /// Non-trivially-copyable; manipulated through its copy constructor
    /// and destructor.
    Complex { size: Size, ctor: Ref, dtor: Ref },
}

impl TypeDesc {
    pub fn size(&self) -> Size {
        match self {
            TypeDesc::Void => Size::ZERO,
            TypeDesc::Primitive(p) => p.size,
            TypeDesc::Simple(s) => s.size(),
            TypeDesc::Complex { size, .. } => *size,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDesc::Void)
            || matches!(self, TypeDesc::Primitive(p) if p.kind == PrimitiveKind::None)
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, TypeDesc::Complex { .. })
    }
}

pub fn void_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Void)
}

pub fn byte_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Primitive(byte_primitive()))
}

pub fn int_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Primitive(int_primitive()))
}

pub fn long_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Primitive(long_primitive()))
}

pub fn ptr_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Primitive(ptr_primitive()))
}

pub fn float_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Primitive(float_primitive()))
}

pub fn double_desc() -> Rc<TypeDesc> {
    Rc::new(TypeDesc::Primitive(double_primitive()))
}
