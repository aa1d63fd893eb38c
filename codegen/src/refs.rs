//! Symbolic references to code and data outside a listing.
//!
//! A [`RefSource`] owns the current address of some external entity (a
//! runtime function, another generated function, a vtable). [`Ref`]s are
//! cheap shared handles to it; they appear as operands in listings and as
//! relocation targets in emitted code. When the owner of a source moves
//! the underlying entity, every emitted site is fixed up through the
//! updaters recorded by the binary that emitted it.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

struct RefInner {
    name: String,
    addr: Cell<usize>,
}

/// The owner of an external address.
pub struct RefSource {
    inner: Rc<RefInner>,
}

impl RefSource {
    pub fn new(name: impl Into<String>, addr: usize) -> RefSource {
        RefSource {
            inner: Rc::new(RefInner {
                name: name.into(),
                addr: Cell::new(addr),
            }),
        }
    }

    /// A source for a plain function pointer.
    pub fn from_fn(name: impl Into<String>, f: *const u8) -> RefSource {
        RefSource::new(name, f as usize)
    }

    pub fn reference(&self) -> Ref {
        Ref {
            inner: self.inner.clone(),
        }
    }

    /// Move the referenced entity. Existing [`Ref`]s observe the new
    /// address; already emitted code is repaired through the owning
    /// binary's relocation updaters.
    pub fn set_address(&self, addr: usize) {
        self.inner.addr.set(addr);
    }

    pub fn address(&self) -> usize {
        self.inner.addr.get()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// A shared handle to a [`RefSource`].
#[derive(Clone)]
pub struct Ref {
    inner: Rc<RefInner>,
}

impl Ref {
    pub fn address(&self) -> usize {
        self.inner.addr.get()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Ref) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Ref {}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}", self.inner.name)
    }
}

impl fmt::Debug for RefSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.inner.name, self.inner.addr.get())
    }
}
