//! The interface to the collector that owns generated code.
//!
//! The collector is an external collaborator with a narrow surface: it
//! hands out executable, movable code blocks with an attached sidecar of
//! relocation entries ([`GcCodeRef`]), and promises to invoke the
//! kind-specific fixups before anything a sidecar entry points at moves.
//! Embedders without a moving collector can use the mmap-backed allocator
//! in [`crate::code_mem`].

use crate::refs::{Ref, RefSource};

/// The kind of a relocation site recorded in a code block's sidecar.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RelocKind {
    /// An arbitrary owned pointer kept alive by the code block; not
    /// written into the code itself.
    PtrStorage,
    /// An absolute pointer to a heap object.
    RawPtr,
    /// A 4-byte (or pointer-sized) pc-relative pointer to a heap object.
    RelativePtr,
    /// A pc-relative pointer to a static (non-moving) object.
    Relative,
    /// An absolute pointer into this very allocation.
    Inside,
    /// A 4-byte relative displacement of a call or jump. On Win64 the
    /// instruction is emitted in a marker form (`48 E8` / `48 E9`) so the
    /// updater can expand it to a load-and-indirect-jump in place when the
    /// target lands out of rel32 range.
    Jump,
    /// The entry registered with the runtime's code table.
    CodeInfo,
    /// The unwind record for this function.
    UnwindInfo,
}

/// One relocation entry in a code block's sidecar.
#[derive(Clone, Copy, Debug)]
pub struct GcCodeRef {
    /// Byte offset of the patched site within the allocation.
    pub offset: u32,
    pub kind: RelocKind,
    /// What the site refers to. Interpretation depends on `kind`.
    pub pointer: usize,
}

/// Backing storage for one generated function.
pub trait CodeMemory {
    fn as_ptr(&self) -> *const u8;
    fn as_mut_ptr(&mut self) -> *mut u8;
    fn len(&self) -> usize;

    /// Called once emission is done: flip the block executable and make
    /// it visible to other cores.
    fn publish(&mut self);
}

/// An executable code allocation plus its relocation sidecar.
pub struct CodeBlock {
    mem: Box<dyn CodeMemory>,
    refs: Vec<GcCodeRef>,
    reloc_slots: usize,
}

impl CodeBlock {
    pub fn new(mem: Box<dyn CodeMemory>, reloc_slots: usize) -> CodeBlock {
        CodeBlock {
            mem,
            refs: Vec::with_capacity(reloc_slots),
            reloc_slots,
        }
    }

    pub fn ptr(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr(), self.mem.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mem.as_mut_ptr(), self.mem.len()) }
    }

    pub fn refs(&self) -> &[GcCodeRef] {
        &self.refs
    }

    pub fn push_ref(&mut self, r: GcCodeRef) {
        debug_assert!(
            self.refs.len() < self.reloc_slots,
            "relocation sidecar overflow"
        );
        self.refs.push(r);
    }

    pub fn publish(&mut self) {
        self.mem.publish();
    }
}

/// The allocation half of the collector contract.
pub trait CodeAllocator {
    /// An aligned, executable, movable block with `reloc_slots` sidecar
    /// entries.
    fn alloc_code(&self, size: usize, reloc_slots: usize) -> CodeBlock;
}

/// Entry points into the language runtime that generated code calls.
pub struct RuntimeHooks {
    /// Raises the language-level division-by-zero error. Reached through
    /// the checks inserted in front of integer division and modulo.
    pub div_zero: RefSource,
}

impl RuntimeHooks {
    pub fn new(div_zero: RefSource) -> RuntimeHooks {
        RuntimeHooks { div_zero }
    }

    pub fn div_zero_ref(&self) -> Ref {
        self.div_zero.reference()
    }
}

extern "C" fn default_div_zero() -> ! {
    // Without a runtime to raise into there is nothing sensible to unwind
    // to; fail loudly.
    std::process::abort()
}

impl Default for RuntimeHooks {
    fn default() -> RuntimeHooks {
        RuntimeHooks {
            div_zero: RefSource::from_fn("divZero", default_div_zero as *const u8),
        }
    }
}
