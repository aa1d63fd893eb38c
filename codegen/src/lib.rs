//! Low-level code generation library for the Lathe runtime.
//!
//! The input is a [`listing::Listing`]: a register-machine-like IR for a
//! single function, with lexically scoped blocks, typed local variables,
//! exception-aware liveness, and first-class function-call primitives that
//! have not been lowered yet. A target backend (looked up through
//! [`isa::lookup`]) legalizes the listing's operand forms, lays out its
//! stack frame and calling convention, and emits machine code plus the
//! unwind metadata the runtime's exception machinery consumes.
//!
//! The usual flow:
//!
//! 1. Build a listing with the factory functions in [`inst`].
//! 2. `isa::lookup(triple)` to get the target.
//! 3. [`binary::Binary::compile`] runs the two lowering passes and the
//!    two emission passes, returning the published code.
//!
//! The collector owning the executable memory is an external collaborator
//! behind the narrow interface in [`gc`]; embedders without a moving
//! collector can use the mmap-backed allocator in [`code_mem`].

#![allow(clippy::new_without_default)]

pub mod abi;
pub mod binary;
pub mod code_mem;
pub mod cond;
pub mod eh;
pub mod gc;
pub mod inst;
pub mod isa;
pub mod label;
pub mod listing;
pub mod liveness;
pub mod op;
pub mod operand;
pub mod output;
pub mod refs;
pub mod reg;
pub mod result;
pub mod size;
pub mod transform;
pub mod ty;

pub use crate::binary::Binary;
pub use crate::listing::{Block, FreeOpt, Listing, Var};
pub use crate::operand::Operand;
pub use crate::result::{CodegenError, CodegenResult};
pub use crate::size::{Offset, Size};
