//! Unwind information for the Windows x64 ABI.
//!
//! See: <https://docs.microsoft.com/en-us/cpp/build/exception-handling-x64>
//! Only the operations needed to describe the prologs this library
//! generates are represented. The blob is appended to the code allocation
//! together with a `RUNTIME_FUNCTION` record holding offsets relative to
//! the allocation base, so both survive the collector moving the block.

use crate::output::{UnwindCollector, UnwindEvent};
use crate::reg::Reg;
use crate::result::{CodegenError, CodegenResult};
use byteorder::{ByteOrder, LittleEndian};

/// Maximum (inclusive) size of a "small" stack allocation.
const SMALL_ALLOC_MAX_SIZE: u32 = 128;
/// Maximum (inclusive) size of a "large" allocation representable in
/// 16 bits (scaled by eight).
const LARGE_ALLOC_16BIT_MAX_SIZE: u32 = 524280;

struct Writer<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn write_u8(&mut self, v: u8) {
        self.buf[self.offset] = v;
        self.offset += 1;
    }

    fn write_u16(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.buf[self.offset..(self.offset + 2)], v);
        self.offset += 2;
    }

    fn write_u32(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.buf[self.offset..(self.offset + 4)], v);
        self.offset += 4;
    }
}

/// A register in the SEH numbering: general-purpose registers use the
/// hardware encoding (rax=0 .. r15=15), vector registers their index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SehReg {
    Gpr(u8),
    Xmm(u8),
}

/// The unwind operations this library emits.
#[derive(Clone, Debug, PartialEq, Eq)]
enum UnwindCode {
    PushRegister {
        offset: u8,
        reg: u8,
    },
    SaveReg {
        offset: u8,
        reg: u8,
        stack_offset: u32,
    },
    SaveXmm {
        offset: u8,
        reg: u8,
        stack_offset: u32,
    },
    StackAlloc {
        offset: u8,
        size: u32,
    },
    SetFramePointer {
        offset: u8,
        sp_offset: u8,
    },
}

enum UnwindOperation {
    PushNonvolatileRegister = 0,
    LargeStackAlloc = 1,
    SmallStackAlloc = 2,
    SetFramePointer = 3,
    SaveNonvolatileRegister = 4,
    SaveNonvolatileRegisterFar = 5,
    SaveXmm128 = 8,
    SaveXmm128Far = 9,
}

impl UnwindCode {
    fn emit(&self, writer: &mut Writer) {
        match self {
            Self::PushRegister { offset, reg } => {
                writer.write_u8(*offset);
                writer.write_u8((*reg << 4) | (UnwindOperation::PushNonvolatileRegister as u8));
            }
            Self::SaveReg {
                offset,
                reg,
                stack_offset,
            } => {
                writer.write_u8(*offset);
                let scaled = stack_offset / 8;
                if scaled <= u16::MAX as u32 {
                    writer.write_u8((*reg << 4) | (UnwindOperation::SaveNonvolatileRegister as u8));
                    writer.write_u16(scaled as u16);
                } else {
                    writer
                        .write_u8((*reg << 4) | (UnwindOperation::SaveNonvolatileRegisterFar as u8));
                    writer.write_u32(*stack_offset);
                }
            }
            Self::SaveXmm {
                offset,
                reg,
                stack_offset,
            } => {
                writer.write_u8(*offset);
                let scaled = stack_offset / 16;
                if scaled <= u16::MAX as u32 {
                    writer.write_u8((*reg << 4) | (UnwindOperation::SaveXmm128 as u8));
                    writer.write_u16(scaled as u16);
                } else {
                    writer.write_u8((*reg << 4) | (UnwindOperation::SaveXmm128Far as u8));
                    writer.write_u16(scaled as u16);
                    writer.write_u16((scaled >> 16) as u16);
                }
            }
            Self::StackAlloc { offset, size } => {
                // Stack allocations on Windows must be a multiple of 8 and
                // at least one slot.
                assert!(*size >= 8);
                assert!((*size % 8) == 0);

                writer.write_u8(*offset);
                if *size <= SMALL_ALLOC_MAX_SIZE {
                    writer.write_u8(
                        ((((*size - 8) / 8) as u8) << 4) | UnwindOperation::SmallStackAlloc as u8,
                    );
                } else if *size <= LARGE_ALLOC_16BIT_MAX_SIZE {
                    writer.write_u8(UnwindOperation::LargeStackAlloc as u8);
                    writer.write_u16((*size / 8) as u16);
                } else {
                    writer.write_u8((1 << 4) | (UnwindOperation::LargeStackAlloc as u8));
                    writer.write_u32(*size);
                }
            }
            Self::SetFramePointer { offset, sp_offset } => {
                writer.write_u8(*offset);
                writer.write_u8((*sp_offset << 4) | (UnwindOperation::SetFramePointer as u8));
            }
        };
    }

    fn node_count(&self) -> usize {
        match self {
            Self::StackAlloc { size, .. } => {
                if *size <= SMALL_ALLOC_MAX_SIZE {
                    1
                } else if *size <= LARGE_ALLOC_16BIT_MAX_SIZE {
                    2
                } else {
                    3
                }
            }
            Self::SaveReg { stack_offset, .. } => {
                if stack_offset / 8 <= u16::MAX as u32 {
                    2
                } else {
                    3
                }
            }
            Self::SaveXmm { stack_offset, .. } => {
                if stack_offset / 16 <= u16::MAX as u32 {
                    2
                } else {
                    3
                }
            }
            _ => 1,
        }
    }
}

/// Windows x64 unwind information for one function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwindInfo {
    flags: u8,
    prologue_size: u8,
    frame_register: Option<u8>,
    frame_register_offset: u8,
    unwind_codes: Vec<UnwindCode>,
}

impl UnwindInfo {
    /// Build from the emitter's frame-evolution events.
    ///
    /// `map` translates register ids into the SEH numbering, routing
    /// general and vector registers to their distinct save encodings.
    /// Only events up to `PrologEnd` participate: Windows unwind
    /// describes the prolog alone.
    pub fn build(
        collector: &UnwindCollector,
        map: &dyn Fn(Reg) -> Option<SehReg>,
    ) -> CodegenResult<UnwindInfo> {
        let mut codes = Vec::new();
        let mut frame_register = None;
        let mut alloc_size = 0u32;
        let mut prologue_size = 0u32;
        let mut saves: Vec<(u8, SehReg, i32)> = Vec::new();

        let map_gpr = |reg: Reg| -> CodegenResult<u8> {
            match map(reg) {
                Some(SehReg::Gpr(n)) => Ok(n),
                _ => Err(CodegenError::invalid(format!(
                    "{reg} is not a general register with an SEH number"
                ))),
            }
        };

        for &(offset, event) in &collector.events {
            if offset > 255 {
                return Err(CodegenError::invalid(
                    "function prologs can not exceed 255 bytes on Windows x64",
                ));
            }
            let offset8 = offset as u8;
            match event {
                UnwindEvent::PushFrameReg(reg) => {
                    codes.push(UnwindCode::PushRegister {
                        offset: offset8,
                        reg: map_gpr(reg)?,
                    });
                }
                UnwindEvent::SetFrameReg(reg) => {
                    frame_register = Some(map_gpr(reg)?);
                    codes.push(UnwindCode::SetFramePointer {
                        offset: offset8,
                        sp_offset: 0,
                    });
                }
                UnwindEvent::FrameAlloc(size) => {
                    alloc_size += size;
                    codes.push(UnwindCode::StackAlloc {
                        offset: offset8,
                        size,
                    });
                }
                UnwindEvent::Saved(reg, cfa_offset) => {
                    let reg = map(reg).ok_or_else(|| {
                        CodegenError::invalid(format!("{reg} has no SEH number"))
                    })?;
                    saves.push((offset8, reg, cfa_offset));
                }
                UnwindEvent::PrologEnd => {
                    prologue_size = offset;
                    break;
                }
                UnwindEvent::EpilogStart | UnwindEvent::RestoreSp | UnwindEvent::EpilogEnd => {}
            }
        }

        // Saves were reported CFA-relative; SEH wants them relative to the
        // post-allocation stack pointer. With the frame register pushed,
        // rsp sits at CFA - 16 - alloc.
        for (offset, reg, cfa_offset) in saves {
            let rsp_relative = alloc_size as i32 + 16 + cfa_offset;
            if rsp_relative < 0 {
                return Err(CodegenError::invalid(
                    "register save below the stack pointer",
                ));
            }
            match reg {
                SehReg::Gpr(reg) => codes.push(UnwindCode::SaveReg {
                    offset,
                    reg,
                    stack_offset: rsp_relative as u32,
                }),
                SehReg::Xmm(reg) => {
                    // The encoding scales by sixteen; the frame layout
                    // hands vector saves 16-byte-aligned slots.
                    if rsp_relative % 16 != 0 {
                        return Err(CodegenError::invalid(
                            "vector register saves must be 16-byte aligned",
                        ));
                    }
                    codes.push(UnwindCode::SaveXmm {
                        offset,
                        reg,
                        stack_offset: rsp_relative as u32,
                    });
                }
            }
        }

        Ok(UnwindInfo {
            flags: 0,
            prologue_size: prologue_size as u8,
            frame_register,
            frame_register_offset: 0,
            unwind_codes: codes,
        })
    }

    /// The emit size of the unwind information, in bytes.
    pub fn emit_size(&self) -> usize {
        let node_count = self.node_count();

        // 4 bytes of fixed header, two per unwind-code node, two bytes of
        // padding when the node count is odd. No handler data: the
        // dispatch callback recomputes the records from the allocation.
        4 + (node_count * 2) + if (node_count & 1) == 1 { 2 } else { 0 }
    }

    /// Emit into `buf`, which must hold at least `emit_size` bytes.
    pub fn emit(&self, buf: &mut [u8]) {
        const UNWIND_INFO_VERSION: u8 = 1;

        let node_count = self.node_count();
        assert!(node_count <= 256);

        let mut writer = Writer::new(buf);

        writer.write_u8((self.flags << 3) | UNWIND_INFO_VERSION);
        writer.write_u8(self.prologue_size);
        writer.write_u8(node_count as u8);

        if let Some(reg) = self.frame_register {
            writer.write_u8((self.frame_register_offset << 4) | reg);
        } else {
            writer.write_u8(0);
        }

        // Unwind codes are written in reverse order, prolog offset
        // descending.
        for code in self.unwind_codes.iter().rev() {
            code.emit(&mut writer);
        }

        if (node_count & 1) == 1 {
            writer.write_u16(0);
        }

        assert_eq!(writer.offset, self.emit_size());
    }

    fn node_count(&self) -> usize {
        self.unwind_codes
            .iter()
            .fold(0, |nodes, c| nodes + c.node_count())
    }
}

/// Write a `RUNTIME_FUNCTION` record: begin/end/unwind-info offsets
/// relative to the allocation base.
pub fn write_runtime_function(buf: &mut [u8], begin: u32, end: u32, unwind_info: u32) {
    let mut w = Writer::new(buf);
    w.write_u32(begin);
    w.write_u32(end);
    w.write_u32(unwind_info);
}

/// Size of a `RUNTIME_FUNCTION` record.
pub const RUNTIME_FUNCTION_SIZE: usize = 12;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{PTR_FRAME, RAX, RBX};

    // rbp and rbx as themselves; rax stands in for xmm6, which has no
    // platform-neutral name at this layer.
    fn test_map(r: Reg) -> Option<SehReg> {
        if crate::reg::same(r, PTR_FRAME) {
            Some(SehReg::Gpr(5))
        } else if crate::reg::same(r, RBX) {
            Some(SehReg::Gpr(3))
        } else if crate::reg::same(r, RAX) {
            Some(SehReg::Xmm(6))
        } else {
            None
        }
    }

    fn prolog_events(alloc: u32) -> UnwindCollector {
        let mut c = UnwindCollector::default();
        c.push(2, UnwindEvent::PushFrameReg(PTR_FRAME));
        c.push(5, UnwindEvent::SetFrameReg(PTR_FRAME));
        c.push(9, UnwindEvent::FrameAlloc(alloc));
        c.push(9, UnwindEvent::PrologEnd);
        c
    }

    #[test]
    fn small_alloc() {
        let unwind = UnwindInfo::build(&prolog_events(96), &test_map).unwrap();

        assert_eq!(unwind.emit_size(), 12);

        let mut buf = [0u8; 12];
        unwind.emit(&mut buf);

        assert_eq!(
            buf,
            [
                0x01, // Version and flags (version 1, no flags)
                0x09, // Prologue size
                0x03, // Unwind code count
                0x05, // Frame register + offset (RBP, offset 0)
                0x09, // Prolog offset
                0xB2, // Small stack alloc, size = (0xB * 8) + 8 = 96 bytes
                0x05, // Prolog offset
                0x03, // Set frame register, sp offset 0
                0x02, // Prolog offset
                0x50, // Push nonvolatile register, reg = 5 (RBP)
                0x00, // Padding
                0x00, // Padding
            ]
        );
    }

    #[test]
    fn medium_alloc() {
        let unwind = UnwindInfo::build(&prolog_events(10032), &test_map).unwrap();

        assert_eq!(unwind.emit_size(), 12);

        let mut buf = [0u8; 12];
        unwind.emit(&mut buf);

        assert_eq!(
            buf,
            [
                0x01, // Version and flags
                0x09, // Prologue size
                0x04, // Unwind code count (2 for the alloc)
                0x05, // Frame register + offset
                0x09, // Prolog offset
                0x01, // Large stack alloc, scaled 16-bit size
                0xE6, // Low size byte
                0x04, // High size byte (0x04E6 * 8 = 10032)
                0x05, // Prolog offset
                0x03, // Set frame register
                0x02, // Prolog offset
                0x50, // Push nonvolatile register, reg = 5
            ]
        );
    }

    #[test]
    fn huge_alloc() {
        let unwind = UnwindInfo::build(&prolog_events(1000032), &test_map).unwrap();

        assert_eq!(unwind.emit_size(), 16);

        let mut buf = [0u8; 16];
        unwind.emit(&mut buf);

        assert_eq!(
            buf,
            [
                0x01, // Version and flags
                0x09, // Prologue size
                0x05, // Unwind code count (3 for the alloc)
                0x05, // Frame register + offset
                0x09, // Prolog offset
                0x11, // Large stack alloc, unscaled 32-bit size
                0x60, // Size byte 1
                0x42, // Size byte 2 (0xF4260 = 1000032)
                0x0F, // Size byte 3
                0x00, // Size byte 4
                0x05, // Prolog offset
                0x03, // Set frame register
                0x02, // Prolog offset
                0x50, // Push nonvolatile register, reg = 5
                0x00, // Padding
                0x00, // Padding
            ]
        );
    }

    #[test]
    fn callee_save_records() {
        let mut c = prolog_events(64);
        // A save at CFA-24 (one slot under the pushed rbp), reported
        // before PrologEnd terminates collection.
        c.events.insert(
            3,
            (9, UnwindEvent::Saved(RBX, -24)),
        );

        let unwind = UnwindInfo::build(&c, &test_map).unwrap();
        // rsp-relative: 64 + 16 - 24 = 56.
        assert!(matches!(
            unwind.unwind_codes.last(),
            Some(UnwindCode::SaveReg {
                reg: 3,
                stack_offset: 56,
                ..
            })
        ));
    }

    #[test]
    fn xmm_save_records() {
        let mut c = prolog_events(64);
        // A vector save at CFA-32: rsp-relative 64 + 16 - 32 = 48, a
        // 16-byte-aligned slot.
        c.events.insert(
            3,
            (9, UnwindEvent::Saved(RAX, -32)),
        );

        let unwind = UnwindInfo::build(&c, &test_map).unwrap();
        assert!(matches!(
            unwind.unwind_codes.last(),
            Some(UnwindCode::SaveXmm {
                reg: 6,
                stack_offset: 48,
                ..
            })
        ));

        assert_eq!(unwind.emit_size(), 16);

        let mut buf = [0u8; 16];
        unwind.emit(&mut buf);

        assert_eq!(
            buf,
            [
                0x01, // Version and flags (version 1, no flags)
                0x09, // Prologue size
                0x05, // Unwind code count
                0x05, // Frame register + offset (RBP, offset 0)
                0x09, // Prolog offset
                0x68, // Save xmm128, reg = 6
                0x03, // Scaled slot (0x3 * 16 = 48), low byte
                0x00, // Scaled slot, high byte
                0x09, // Prolog offset
                0x72, // Small stack alloc, size = (0x7 * 8) + 8 = 64 bytes
                0x05, // Prolog offset
                0x03, // Set frame register, sp offset 0
                0x02, // Prolog offset
                0x50, // Push nonvolatile register, reg = 5 (RBP)
                0x00, // Padding
                0x00, // Padding
            ]
        );
    }

    #[test]
    fn unaligned_xmm_save_is_rejected() {
        let mut c = prolog_events(64);
        // rsp-relative 64 + 16 - 24 = 56: not a 16-byte slot.
        c.events.insert(
            3,
            (9, UnwindEvent::Saved(RAX, -24)),
        );
        assert!(UnwindInfo::build(&c, &test_map).is_err());
    }

    #[test]
    fn unmapped_register_is_rejected() {
        let mut c = prolog_events(64);
        c.events.insert(
            3,
            (9, UnwindEvent::Saved(crate::reg::RCX, -24)),
        );
        assert!(UnwindInfo::build(&c, &test_map).is_err());
    }
}
