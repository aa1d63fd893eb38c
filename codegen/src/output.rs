//! Byte sinks for the two emission passes.
//!
//! Machine code is produced in two passes: a [`LabelOutput`] first runs
//! the emitter to count bytes and learn every label's offset (and, on
//! targets that need it, the size of the unwind blob), then a
//! [`CodeOutput`] runs it again to write bytes into the allocated block,
//! recording relocations into the allocation's sidecar as it goes.

use crate::gc::{CodeBlock, GcCodeRef, RelocKind};
use crate::label::Label;
use crate::refs::Ref;
use crate::reg::Reg;
use crate::size::Size;

/// A frame-evolution event reported by the emitter, consumed by the
/// DWARF and SEH unwind builders.
#[derive(Clone, Copy, Debug)]
pub enum UnwindEvent {
    /// The frame register was pushed (the canonical `push rbp`).
    PushFrameReg(Reg),
    /// The frame register now mirrors the stack pointer.
    SetFrameReg(Reg),
    /// The prolog grew the frame by the given number of bytes.
    FrameAlloc(u32),
    /// A callee-saved register was stored at the given CFA-relative
    /// offset.
    Saved(Reg, i32),
    /// End of the prolog.
    PrologEnd,
    /// Start of an epilog sequence.
    EpilogStart,
    /// The frame was torn down; the CFA tracks the stack pointer again.
    RestoreSp,
    /// The epilog's `ret` has been emitted.
    EpilogEnd,
}

/// Ordered unwind events with the code offset each happened at.
#[derive(Default)]
pub struct UnwindCollector {
    pub events: Vec<(u32, UnwindEvent)>,
}

impl UnwindCollector {
    pub fn push(&mut self, offset: u32, event: UnwindEvent) {
        self.events.push((offset, event));
    }

    pub fn prolog_size(&self) -> u32 {
        self.events
            .iter()
            .find(|(_, e)| matches!(e, UnwindEvent::PrologEnd))
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }
}

/// A byte sink the emitters write through.
pub trait Output {
    /// Pointer size of the target, in bytes.
    fn ptr_size(&self) -> u32;

    fn put_u8(&mut self, b: u8);
    fn put_u32(&mut self, w: u32);
    fn put_u64(&mut self, w: u64);

    /// Current offset from the start of the blob.
    fn tell(&self) -> u32;

    /// Align the position for the next write, zero-filling.
    fn align_to(&mut self, align: u32);

    fn mark_label(&mut self, l: Label);
    fn label_offset(&self, l: Label) -> u32;

    /// Address the blob will live at; zero during the sizing pass.
    fn code_base(&self) -> usize {
        0
    }

    /// Write `size` bytes whose final value the collector may need to
    /// update, recording a sidecar entry at the current offset.
    fn put_gc(&mut self, kind: RelocKind, size: u32, value: usize);

    /// Attach a reference updater to the most recent sidecar entry.
    fn mark_gc_ref(&mut self, r: &Ref);

    fn unwind_mut(&mut self) -> &mut UnwindCollector;

    /*
     * Provided helpers.
     */

    fn put_u16(&mut self, w: u16) {
        self.put_u8(w as u8);
        self.put_u8((w >> 8) as u8);
    }

    fn put_ptr(&mut self, w: u64) {
        if self.ptr_size() == 8 {
            self.put_u64(w);
        } else {
            self.put_u32(w as u32);
        }
    }

    /// Write a constant of the given (target-width) size.
    fn put_sized(&mut self, w: u64, size: Size) {
        let bytes = if self.ptr_size() == 8 {
            size.size64()
        } else {
            size.size32()
        };
        match bytes {
            0 => {}
            1 => self.put_u8(w as u8),
            4 => self.put_u32(w as u32),
            8 => self.put_u64(w),
            n => {
                for i in 0..n {
                    self.put_u8((w >> (8 * i)) as u8);
                }
            }
        }
    }

    /// 4-byte displacement of `l` relative to the end of the field.
    fn put_label_relative(&mut self, l: Label) {
        let target = self.label_offset(l);
        let rel = target.wrapping_sub(self.tell() + 4);
        self.put_u32(rel);
    }

    /// 4-byte offset of `l` relative to the start of the blob.
    fn put_label_offset(&mut self, l: Label) {
        let off = self.label_offset(l);
        self.put_u32(off);
    }

    /// Pointer-sized absolute address of `l` inside this blob.
    fn put_label_address(&mut self, l: Label) {
        let addr = self.code_base() + self.label_offset(l) as usize;
        self.put_gc(RelocKind::Inside, self.ptr_size(), addr);
    }

    /// 4-byte pc-relative displacement of an external reference.
    fn put_ref_relative(&mut self, r: &Ref) {
        let value = r.address();
        self.put_gc(RelocKind::Jump, 4, value);
        self.mark_gc_ref(r);
    }

    /// Pointer-sized absolute address of an external reference.
    fn put_ref_address(&mut self, r: &Ref) {
        self.put_gc(RelocKind::RawPtr, self.ptr_size(), r.address());
        self.mark_gc_ref(r);
    }

    /// Pointer to a heap object the collector may move.
    fn put_obj_ptr(&mut self, ptr: usize) {
        self.put_gc(RelocKind::RawPtr, self.ptr_size(), ptr);
    }

    /*
     * Call-frame information, forwarded to the unwind builders.
     */

    fn cfi_push_frame_reg(&mut self, reg: Reg) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::PushFrameReg(reg));
    }

    fn cfi_set_frame_reg(&mut self, reg: Reg) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::SetFrameReg(reg));
    }

    fn cfi_frame_alloc(&mut self, size: u32) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::FrameAlloc(size));
    }

    fn cfi_saved(&mut self, reg: Reg, cfa_offset: i32) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::Saved(reg, cfa_offset));
    }

    fn cfi_prolog_end(&mut self) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::PrologEnd);
    }

    fn cfi_epilog_start(&mut self) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::EpilogStart);
    }

    fn cfi_restore_sp(&mut self) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::RestoreSp);
    }

    fn cfi_epilog_end(&mut self) {
        let at = self.tell();
        self.unwind_mut().push(at, UnwindEvent::EpilogEnd);
    }
}

/// The sizing pass: counts bytes and records label offsets.
pub struct LabelOutput {
    ptr_size: u32,
    pub offsets: Vec<u32>,
    pub size: u32,
    /// Number of sidecar entries the code pass will need.
    pub refs: u32,
    unwind: UnwindCollector,
}

impl LabelOutput {
    pub fn new(ptr_size: u32, label_count: usize) -> LabelOutput {
        LabelOutput {
            ptr_size,
            offsets: vec![0; label_count],
            size: 0,
            refs: 0,
            unwind: UnwindCollector::default(),
        }
    }

    pub fn unwind(&self) -> &UnwindCollector {
        &self.unwind
    }
}

impl Output for LabelOutput {
    fn ptr_size(&self) -> u32 {
        self.ptr_size
    }

    fn put_u8(&mut self, _b: u8) {
        self.size += 1;
    }

    fn put_u32(&mut self, _w: u32) {
        self.size += 4;
    }

    fn put_u64(&mut self, _w: u64) {
        self.size += 8;
    }

    fn tell(&self) -> u32 {
        self.size
    }

    fn align_to(&mut self, align: u32) {
        self.size = crate::size::round_up(self.size, align);
    }

    fn mark_label(&mut self, l: Label) {
        self.offsets[l.key() as usize] = self.size;
    }

    fn label_offset(&self, l: Label) -> u32 {
        // Forward references read zero here; all label-relative fields are
        // fixed-width, so sizing is unaffected.
        self.offsets[l.key() as usize]
    }

    fn put_gc(&mut self, _kind: RelocKind, size: u32, _value: usize) {
        self.refs += 1;
        self.size += size;
    }

    fn mark_gc_ref(&mut self, _r: &Ref) {}

    fn unwind_mut(&mut self) -> &mut UnwindCollector {
        &mut self.unwind
    }
}

/// A recorded fixup: when the target of `reference` moves, sidecar slot
/// `slot` must be re-patched.
pub struct CodeUpdater {
    pub slot: usize,
    pub reference: Ref,
}

/// The emission pass: writes bytes into an allocated block.
pub struct CodeOutput {
    ptr_size: u32,
    block: CodeBlock,
    labels: Vec<u32>,
    pos: u32,
    updaters: Vec<CodeUpdater>,
    unwind: UnwindCollector,
}

impl CodeOutput {
    /// `block` must be at least as large as the size computed by the
    /// sizing pass; `labels` are that pass's label offsets.
    pub fn new(ptr_size: u32, block: CodeBlock, labels: Vec<u32>) -> CodeOutput {
        CodeOutput {
            ptr_size,
            block,
            labels,
            pos: 0,
            updaters: Vec::new(),
            unwind: UnwindCollector::default(),
        }
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn block(&self) -> &CodeBlock {
        &self.block
    }

    pub fn finish(self) -> (CodeBlock, Vec<u32>, Vec<CodeUpdater>, UnwindCollector) {
        (self.block, self.labels, self.updaters, self.unwind)
    }

    fn write(&mut self, bytes: &[u8]) {
        let pos = self.pos as usize;
        self.block.bytes_mut()[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len() as u32;
    }
}

impl Output for CodeOutput {
    fn ptr_size(&self) -> u32 {
        self.ptr_size
    }

    fn put_u8(&mut self, b: u8) {
        self.write(&[b]);
    }

    fn put_u32(&mut self, w: u32) {
        self.write(&w.to_le_bytes());
    }

    fn put_u64(&mut self, w: u64) {
        self.write(&w.to_le_bytes());
    }

    fn tell(&self) -> u32 {
        self.pos
    }

    fn align_to(&mut self, align: u32) {
        while self.pos % align.max(1) != 0 {
            self.put_u8(0);
        }
    }

    fn mark_label(&mut self, l: Label) {
        // Offsets were computed by the sizing pass; the two passes must
        // agree on every label position.
        debug_assert_eq!(
            self.labels[l.key() as usize],
            self.pos,
            "label {l} moved between passes"
        );
    }

    fn label_offset(&self, l: Label) -> u32 {
        self.labels[l.key() as usize]
    }

    fn code_base(&self) -> usize {
        self.block.ptr() as usize
    }

    fn put_gc(&mut self, kind: RelocKind, size: u32, value: usize) {
        self.block.push_ref(GcCodeRef {
            offset: self.pos,
            kind,
            pointer: value,
        });

        match kind {
            RelocKind::Jump | RelocKind::RelativePtr | RelocKind::Relative => {
                let rel = (value as i64)
                    .wrapping_sub((self.code_base() + self.pos as usize + size as usize) as i64);
                if size == 4 {
                    self.put_u32(rel as u32);
                } else {
                    self.put_u64(rel as u64);
                }
            }
            _ => {
                if size == 4 {
                    self.put_u32(value as u32);
                } else {
                    self.put_u64(value as u64);
                }
            }
        }
    }

    fn mark_gc_ref(&mut self, r: &Ref) {
        let slot = self.block.refs().len();
        if slot == 0 {
            return;
        }
        self.updaters.push(CodeUpdater {
            slot: slot - 1,
            reference: r.clone(),
        });
    }

    fn unwind_mut(&mut self) -> &mut UnwindCollector {
        &mut self.unwind
    }
}
