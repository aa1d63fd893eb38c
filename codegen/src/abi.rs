//! Generic representation of how parameters map onto registers and stack.
//!
//! Each backend implements the [`Params`] trait to classify typed
//! parameters into the target's calling convention. The shared [`Slots`]
//! storage tracks the pre-allocated integer and floating-point register
//! slots plus the overflow area on the stack; the per-ABI impls decide how
//! primitives, trivially-copyable aggregates and complex types are split
//! across them.
//!
//! Note the distinction between parameters *passed on the stack* (they did
//! not fit in registers, the value lives in the caller's overflow area)
//! and parameters *passed in memory* (the value lives anywhere in memory
//! and a pointer to it takes the parameter's place).

use crate::reg::Reg;
use crate::size::{round_up, Size};
use crate::ty::{Primitive, SimpleDesc, TypeDesc};
use smallvec::SmallVec;
use std::fmt;

/// The parameter id used for the hidden result pointer.
pub const RETURN_ID: u16 = u16::MAX;

/// What part of which parameter ends up in some particular location.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Param {
    id: u16,
    size: Size,
    /// Offset into the parameter: which part of the value this slot
    /// carries, for values split across several registers.
    offset: u32,
    /// Passed in memory through a pointer indirection?
    in_memory: bool,
}

impl Param {
    pub fn new(id: u16, size: Size, offset: u32, in_memory: bool) -> Param {
        Param {
            id,
            size,
            offset,
            in_memory,
        }
    }

    pub fn primitive(id: u16, p: Primitive) -> Param {
        Param::new(id, p.size, p.offset.v64() as u32, false)
    }

    pub fn id(self) -> u16 {
        self.id
    }

    pub fn offset(self) -> u32 {
        self.offset
    }

    pub fn in_memory(self) -> bool {
        self.in_memory
    }

    /// The size of the data moved by the parameter-passing code: a pointer
    /// when the value itself is in memory.
    pub fn size(self) -> Size {
        if self.in_memory {
            Size::PTR
        } else {
            self.size
        }
    }

    /// The size of the actual value, after any indirection.
    pub fn real_size(self) -> Size {
        self.size
    }

    pub fn with_id(self, id: u16) -> Param {
        Param { id, ..self }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}+{},{:?}", self.id, self.offset, self.size)?;
        if self.in_memory {
            write!(f, " (in memory)")?;
        }
        Ok(())
    }
}

/// Where a function's result lives: either a list of registers with
/// offsets into the value, or in memory through the pointer in a
/// designated register.
#[derive(Clone, Default, Debug)]
pub struct ResultLoc {
    mem: Option<Reg>,
    regs: SmallVec<[(Reg, u32); 2]>,
}

impl ResultLoc {
    pub fn empty() -> ResultLoc {
        ResultLoc::default()
    }

    pub fn in_memory(reg: Reg) -> ResultLoc {
        ResultLoc {
            mem: Some(reg),
            regs: SmallVec::new(),
        }
    }

    pub fn in_register(reg: Reg) -> ResultLoc {
        ResultLoc {
            mem: None,
            regs: smallvec::smallvec![(reg, 0)],
        }
    }

    pub fn put_register(&mut self, reg: Reg, offset: u32) {
        self.regs.push((reg, offset));
    }

    pub fn memory_register(&self) -> Option<Reg> {
        self.mem
    }

    pub fn register_count(&self) -> usize {
        self.regs.len()
    }

    pub fn register_at(&self, i: usize) -> Reg {
        self.regs[i].0
    }

    pub fn register_offset(&self, i: usize) -> u32 {
        self.regs[i].1
    }
}

/// Shared slot storage for the per-ABI classifiers.
pub struct Slots {
    integer: Vec<Option<Param>>,
    real: Vec<Option<Param>>,
    int_filled: usize,
    real_filled: usize,
    /// Integer and floating-point slots share one position counter, as on
    /// Win64 where the parameter's index picks its register in either
    /// bank.
    unified: bool,
    stack: Vec<(Param, u32)>,
    stack_size: u32,
    stack_align: u32,
    stack_param_align: u32,
    /// Extra caller-reserved area below the stack parameters (the Win64
    /// shadow space). Stack parameter offsets start above it.
    stack_extra: u32,
    callee_destroy: bool,
    result: ResultLoc,
}

impl Slots {
    pub fn new(int_count: usize, real_count: usize, stack_param_align: u32, stack_align: u32) -> Slots {
        Slots {
            integer: vec![None; int_count],
            real: vec![None; real_count],
            int_filled: 0,
            real_filled: 0,
            unified: false,
            stack: Vec::new(),
            stack_size: 0,
            stack_align,
            stack_param_align,
            stack_extra: 0,
            callee_destroy: false,
            result: ResultLoc::empty(),
        }
    }

    pub fn set_unified(&mut self) {
        self.unified = true;
    }

    pub fn set_stack_extra(&mut self, extra: u32) {
        self.stack_extra = extra;
        self.stack_size = extra;
    }

    pub fn stack_extra(&self) -> u32 {
        self.stack_extra
    }

    pub fn set_callee_destroy(&mut self) {
        self.callee_destroy = true;
    }

    pub fn result(&self) -> &ResultLoc {
        &self.result
    }

    pub fn set_result(&mut self, r: ResultLoc) {
        self.result = r;
    }

    /// Skip slots already claimed by `add_int_at`.
    fn bump_int_filled(&mut self) {
        while self.int_filled < self.integer.len() && self.integer[self.int_filled].is_some() {
            self.int_filled += 1;
        }
    }

    /// Add to the next free integer register, spilling to the stack when
    /// the registers are full.
    pub fn add_int(&mut self, param: Param) {
        if self.int_filled < self.integer.len() {
            self.integer[self.int_filled] = Some(param);
            self.int_filled += 1;
            self.bump_int_filled();
        } else {
            self.add_stack(param);
        }
    }

    /// Place a parameter in a specific integer register slot. Used for the
    /// hidden result pointer, which some ABIs pin to a fixed position.
    pub fn add_int_at(&mut self, at: usize, param: Param) {
        if at < self.integer.len() {
            debug_assert!(self.integer[at].is_none());
            self.integer[at] = Some(param);
            self.bump_int_filled();
        }
    }

    pub fn add_real(&mut self, param: Param) {
        if !self.unified {
            if self.real_filled < self.real.len() {
                self.real[self.real_filled] = Some(param);
                self.real_filled += 1;
            } else {
                self.add_stack(param);
            }
        } else {
            // Unified position counting: the parameter's index picks the
            // slot in the floating-point bank as well.
            if self.int_filled < self.real.len() {
                self.real[self.int_filled] = Some(param);
                self.int_filled += 1;
                self.bump_int_filled();
            } else {
                self.add_stack(param);
            }
        }
    }

    pub fn add_stack(&mut self, param: Param) {
        // Align the slot to the parameter itself, then advance by at least
        // the per-parameter stack alignment.
        self.stack_size = round_up(self.stack_size, param.size().align64());
        let offset = self.stack_size;
        self.stack.push((param, offset));
        self.stack_size += round_up(
            param.size().aligned().size64(),
            self.stack_param_align,
        );
    }

    pub fn has_int(&self, space: usize) -> bool {
        self.int_filled + space <= self.integer.len()
    }

    pub fn has_real(&self, space: usize) -> bool {
        self.real_filled + space <= self.real.len()
    }

    pub fn int_count(&self) -> usize {
        self.integer.len()
    }

    pub fn register_count(&self) -> usize {
        self.integer.len() + self.real.len()
    }

    pub fn register_param(&self, n: usize) -> Option<Param> {
        if n < self.integer.len() {
            self.integer[n]
        } else {
            self.real.get(n - self.integer.len()).copied().flatten()
        }
    }

    pub fn stack_count(&self) -> usize {
        self.stack.len()
    }

    pub fn stack_param(&self, n: usize) -> Param {
        self.stack[n].0
    }

    /// Offset of stack parameter `n`, relative to the stack pointer at the
    /// call instruction.
    pub fn stack_offset(&self, n: usize) -> u32 {
        self.stack[n].1
    }

    /// Total caller-reserved stack area, including any shadow space.
    pub fn stack_total_size(&self) -> u32 {
        round_up(self.stack_size, self.stack_align)
    }
}

/// A per-ABI parameter classifier.
///
/// `add` and `result_ty` dispatch on the type description; backends
/// implement the kind-specific hooks.
pub trait Params {
    fn slots(&self) -> &Slots;
    fn slots_mut(&mut self) -> &mut Slots;

    /// The register backing register slot `n` (integer slots first).
    fn register_src(&self, n: usize) -> Reg;

    fn add_primitive(&mut self, id: u16, p: Primitive);
    fn add_complex(&mut self, id: u16, size: Size);
    fn add_simple(&mut self, id: u16, s: &SimpleDesc);

    fn result_primitive(&mut self, p: Primitive);
    fn result_complex(&mut self, size: Size);
    fn result_simple(&mut self, s: &SimpleDesc);

    fn add(&mut self, id: u16, ty: &TypeDesc) {
        match ty {
            TypeDesc::Void => {}
            TypeDesc::Primitive(p) => self.add_primitive(id, *p),
            TypeDesc::Simple(s) => self.add_simple(id, s),
            TypeDesc::Complex { size, .. } => self.add_complex(id, *size),
        }
    }

    fn result_ty(&mut self, ty: &TypeDesc) {
        match ty {
            TypeDesc::Void => self.slots_mut().set_result(ResultLoc::empty()),
            TypeDesc::Primitive(p) => self.result_primitive(*p),
            TypeDesc::Simple(s) => self.result_simple(s),
            TypeDesc::Complex { size, .. } => self.result_complex(*size),
        }
    }

    fn callee_destroy_params(&self) -> bool {
        self.slots().callee_destroy
    }

    fn result(&self) -> &ResultLoc {
        self.slots().result()
    }

    fn register_count(&self) -> usize {
        self.slots().register_count()
    }

    fn register_param(&self, n: usize) -> Option<Param> {
        self.slots().register_param(n)
    }

    fn stack_count(&self) -> usize {
        self.slots().stack_count()
    }

    fn stack_param(&self, n: usize) -> Param {
        self.slots().stack_param(n)
    }

    fn stack_offset(&self, n: usize) -> u32 {
        self.slots().stack_offset(n)
    }

    fn stack_total_size(&self) -> u32 {
        self.slots().stack_total_size()
    }

    fn total_count(&self) -> usize {
        self.register_count() + self.stack_count()
    }

    /// Register slots first, then stack parameters.
    fn total_param(&self, n: usize) -> Option<Param> {
        if n < self.register_count() {
            self.register_param(n)
        } else {
            Some(self.stack_param(n - self.register_count()))
        }
    }
}

/// Round small sizes the way most 64-bit ABIs extend them: bytes stay
/// bytes, anything up to four bytes widens to a 32-bit slot, larger values
/// get word alignment.
pub(crate) fn round_param_size(sz: Size) -> Size {
    if sz.size64() == 1 {
        sz
    } else if sz.size64() <= 4 {
        Size::INT
    } else {
        sz.aligned_as(Size::LONG)
    }
}
