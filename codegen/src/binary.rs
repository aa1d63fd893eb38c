//! A compiled function: code, relocations, and unwind metadata.
//!
//! `Binary::compile` runs a transformed listing through the emitter
//! twice: once through a [`LabelOutput`] to learn the code size and every
//! label's offset, then through a [`CodeOutput`] into a freshly allocated
//! code block. The unwind metadata is produced from the frame-evolution
//! events collected during emission: a serialized `.eh_frame` on POSIX
//! targets, or `UNWIND_INFO` plus a `RUNTIME_FUNCTION` record appended to
//! the allocation on Win64.

use crate::eh::{decode_fn_state, dwarf, seh};
use crate::gc::{CodeAllocator, CodeBlock, GcCodeRef, RelocKind};
use crate::isa::{TargetIsa, UnwindStyle};
use crate::listing::Listing;
use crate::output::{CodeOutput, CodeUpdater, LabelOutput};
use crate::result::{CodegenError, CodegenResult};
use crate::size::round_up;
use log::{debug, trace};

/// The unwind metadata owned by a binary.
pub enum UnwindData {
    None,
    /// Serialized `.eh_frame` (one CIE and one FDE) for registration with
    /// the in-process DWARF unwinder.
    EhFrame(Vec<u8>),
    /// Offset of the `RUNTIME_FUNCTION` record inside the allocation.
    RuntimeFunction(u32),
}

pub struct Binary {
    code: CodeBlock,
    /// Size of code plus appended tables, excluding any unwind blob.
    meta_end: u32,
    ptr_size: u32,
    updaters: Vec<CodeUpdater>,
    unwind: UnwindData,
}

impl Binary {
    /// Lower, emit and publish a listing.
    pub fn compile(
        isa: &dyn TargetIsa,
        alloc: &dyn CodeAllocator,
        src: &Listing,
    ) -> CodegenResult<Binary> {
        let transformed = isa.transform(src)?;
        trace!(
            "transformed listing: {} instructions",
            transformed.count()
        );

        // First pass: label offsets and sizes.
        let mut sizing = LabelOutput::new(isa.ptr_size(), transformed.label_count());
        isa.emit(&transformed, &mut sizing)?;
        let meta_end = round_up(sizing.size, isa.ptr_size());

        // The unwind blob, if the target appends one, comes after.
        let mut total = meta_end;
        let seh_info = match isa.unwind_style() {
            UnwindStyle::Seh64 => {
                let info = seh::UnwindInfo::build(sizing.unwind(), &|r| isa.seh_reg(r))?;
                let unwind_at = round_up(total, 4);
                let runtime_fn_at = unwind_at + info.emit_size() as u32;
                total = runtime_fn_at + seh::RUNTIME_FUNCTION_SIZE as u32;
                Some((info, unwind_at, runtime_fn_at))
            }
            _ => None,
        };

        debug!(
            "emitting {total} bytes ({} labels, {} relocations)",
            transformed.label_count(),
            sizing.refs
        );

        // Second pass: bytes and relocations.
        let block = alloc.alloc_code(total as usize, sizing.refs as usize + 4);
        let mut out = CodeOutput::new(isa.ptr_size(), block, sizing.offsets);
        isa.emit(&transformed, &mut out)?;
        let emitted = out.pos();
        if emitted > meta_end {
            return Err(CodegenError::invalid(
                "the two emission passes disagree on the code size",
            ));
        }
        let (mut block, _labels, updaters, events) = out.finish();

        let unwind = match isa.unwind_style() {
            UnwindStyle::Dwarf => {
                let mapper = isa
                    .dwarf_mapper()
                    .ok_or_else(|| CodegenError::invalid("missing DWARF register mapping"))?;
                let info = dwarf::UnwindInfo::build(
                    &events,
                    meta_end,
                    isa.initial_sp_offset(),
                    isa.ptr_size(),
                    mapper,
                )?;
                let bytes = info.to_eh_frame(
                    block.ptr() as usize,
                    isa.initial_sp_offset(),
                    isa.ptr_size(),
                    mapper,
                )?;
                UnwindData::EhFrame(bytes)
            }
            UnwindStyle::Seh64 => {
                let (_, unwind_at, runtime_fn_at) = seh_info.as_ref().unwrap();
                // Rebuild from the code pass's events; offsets match the
                // sizing pass by construction.
                let info = seh::UnwindInfo::build(&events, &|r| isa.seh_reg(r))?;
                let bytes = block.bytes_mut();
                info.emit(&mut bytes[*unwind_at as usize..]);
                seh::write_runtime_function(
                    &mut bytes[*runtime_fn_at as usize..],
                    0,
                    meta_end,
                    *unwind_at,
                );
                block.push_ref(GcCodeRef {
                    offset: *runtime_fn_at,
                    kind: RelocKind::UnwindInfo,
                    pointer: 0,
                });
                UnwindData::RuntimeFunction(*runtime_fn_at)
            }
            UnwindStyle::Seh32 => UnwindData::None,
        };

        block.publish();

        Ok(Binary {
            code: block,
            meta_end,
            ptr_size: isa.ptr_size(),
            updaters,
            unwind,
        })
    }

    /// The function's entry point.
    pub fn entry(&self) -> *const u8 {
        self.code.ptr()
    }

    pub fn code(&self) -> &CodeBlock {
        &self.code
    }

    pub fn unwind(&self) -> &UnwindData {
        &self.unwind
    }

    /// Size of the code and metadata tables.
    pub fn len(&self) -> u32 {
        self.meta_end
    }

    pub fn is_empty(&self) -> bool {
        self.meta_end == 0
    }

    /// Re-apply every recorded relocation against the current addresses
    /// of their targets. The collector calls this (through the sidecar
    /// updaters) after moving anything the code points at.
    pub fn refresh_refs(&mut self) {
        let base = self.code.ptr() as usize;
        for u in &self.updaters {
            let r = self.code.refs()[u.slot];
            let value = u.reference.address();
            let offset = r.offset as usize;
            match r.kind {
                RelocKind::Jump | RelocKind::RelativePtr | RelocKind::Relative => {
                    let rel = (value as i64).wrapping_sub((base + offset + 4) as i64) as i32;
                    self.code.bytes_mut()[offset..offset + 4]
                        .copy_from_slice(&rel.to_le_bytes());
                }
                RelocKind::RawPtr | RelocKind::Inside => {
                    if self.ptr_size == 8 {
                        self.code.bytes_mut()[offset..offset + 8]
                            .copy_from_slice(&(value as u64).to_le_bytes());
                    } else {
                        self.code.bytes_mut()[offset..offset + 4]
                            .copy_from_slice(&(value as u32).to_le_bytes());
                    }
                }
                _ => {}
            }
        }
    }

    /// The `(block, activation)` state covering the given code offset, by
    /// searching the active-block table appended after the code. Returns
    /// `None` when the offset precedes every entry, or the listing was not
    /// exception-aware.
    pub fn fn_state_at(&self, offset: u32) -> Option<(u32, u32)> {
        let bytes = self.code.bytes();
        let end = self.meta_end as usize;
        let psz = self.ptr_size as usize;
        if end < psz {
            return None;
        }

        let count = if psz == 8 {
            u64::from_le_bytes(bytes[end - 8..end].try_into().unwrap()) as usize
        } else {
            u32::from_le_bytes(bytes[end - 4..end].try_into().unwrap()) as usize
        };
        if count == 0 || count > end / 8 {
            return None;
        }

        let table = end - psz - count * 8;
        let mut best: Option<(u32, u32)> = None;
        for i in 0..count {
            let at = table + i * 8;
            let pc = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
            let state = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap());
            // Rows are emitted in code order; take the greatest PC not
            // exceeding the query.
            if pc <= offset {
                best = Some(decode_fn_state(state));
            }
        }
        best
    }
}
