//! DWARF call-frame information for the POSIX unwinder.
//!
//! The emitter reports frame-evolution events while writing the prolog
//! and epilogs; this module replays them into a sequence of call-frame
//! instructions and produces an FDE the embedder installs into its DWARF
//! unwind index, keyed by the function's code range.

use crate::output::{UnwindCollector, UnwindEvent};
use crate::reg::Reg;
use crate::result::{CodegenError, CodegenResult};
use gimli::write::{Address, CallFrameInstruction, CommonInformationEntry, EndianVec, FrameDescriptionEntry, FrameTable};
use gimli::{Encoding, Format, LittleEndian, Register};
use thiserror::Error;

/// Errors in mapping IR registers to their DWARF numbers.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterMappingError {
    #[error("register {0} has no DWARF number on this target")]
    Unmapped(String),
}

/// Maps target registers to the DWARF register number space.
pub trait RegisterMapper {
    fn map(&self, reg: Reg) -> Result<Register, RegisterMappingError>;
    /// The stack pointer's number.
    fn sp(&self) -> Register;
    /// The return-address column.
    fn ra(&self) -> Register;
}

/// Unwind information for one function, as offset-tagged call-frame
/// instructions.
#[derive(Debug)]
pub struct UnwindInfo {
    instructions: Vec<(u32, CallFrameInstruction)>,
    len: u32,
}

impl UnwindInfo {
    /// Replay collected events into call-frame instructions.
    ///
    /// `initial_sp_offset` is the CFA offset at entry (the return address
    /// already on the stack on x86 family targets, zero on AArch64);
    /// `ptr_size` is the target's pointer width in bytes.
    pub fn build(
        collector: &UnwindCollector,
        function_size: u32,
        initial_sp_offset: u32,
        ptr_size: u32,
        map: &dyn RegisterMapper,
    ) -> CodegenResult<UnwindInfo> {
        let mut b = InstructionBuilder {
            sp_offset: initial_sp_offset as i32,
            frame_register: None,
            saved_state: None,
            map,
            instructions: Vec::new(),
        };

        for &(offset, event) in &collector.events {
            match event {
                UnwindEvent::PushFrameReg(reg) => {
                    b.adjust_sp_down(offset, ptr_size as i32);
                    b.save_reg(offset, reg, 0)?;
                }
                UnwindEvent::SetFrameReg(reg) => b.set_cfa_reg(offset, reg)?,
                UnwindEvent::FrameAlloc(size) => b.adjust_sp_down(offset, size as i32),
                UnwindEvent::Saved(reg, cfa_offset) => b.save_reg(offset, reg, cfa_offset)?,
                UnwindEvent::PrologEnd => {}
                UnwindEvent::EpilogStart => b.remember_state(offset),
                UnwindEvent::RestoreSp => b.restore_sp(offset, initial_sp_offset as i32),
                UnwindEvent::EpilogEnd => b.restore_state(offset),
            }
        }

        Ok(UnwindInfo {
            instructions: b.instructions,
            len: function_size,
        })
    }

    /// The FDE for a function at `address`.
    pub fn to_fde(&self, address: Address) -> FrameDescriptionEntry {
        let mut fde = FrameDescriptionEntry::new(address, self.len);
        for (offset, inst) in &self.instructions {
            fde.add_instruction(*offset, inst.clone());
        }
        fde
    }

    /// Serialized `.eh_frame` contents (one CIE plus this function's FDE),
    /// suitable for registration with the in-process unwinder.
    pub fn to_eh_frame(
        &self,
        address: usize,
        initial_sp_offset: u32,
        ptr_size: u32,
        map: &dyn RegisterMapper,
    ) -> CodegenResult<Vec<u8>> {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 1,
            address_size: ptr_size as u8,
        };

        let mut cie = CommonInformationEntry::new(encoding, 1, -(ptr_size as i8), map.ra());
        cie.add_instruction(CallFrameInstruction::Cfa(
            map.sp(),
            initial_sp_offset as i32,
        ));
        if initial_sp_offset > 0 {
            cie.add_instruction(CallFrameInstruction::Offset(
                map.ra(),
                -(initial_sp_offset as i32),
            ));
        }

        let mut table = FrameTable::default();
        let cie_id = table.add_cie(cie);
        table.add_fde(cie_id, self.to_fde(Address::Constant(address as u64)));

        let mut frame = gimli::write::EhFrame(EndianVec::new(LittleEndian));
        table
            .write_eh_frame(&mut frame)
            .map_err(|e| CodegenError::invalid(format!("writing .eh_frame: {e}")))?;
        Ok(frame.0.into_vec())
    }

    pub fn instructions(&self) -> &[(u32, CallFrameInstruction)] {
        &self.instructions
    }
}

struct InstructionBuilder<'a> {
    /// Offset of the CFA above the current stack pointer.
    sp_offset: i32,
    frame_register: Option<Reg>,
    saved_state: Option<(i32, Option<Reg>)>,
    map: &'a dyn RegisterMapper,
    instructions: Vec<(u32, CallFrameInstruction)>,
}

impl<'a> InstructionBuilder<'a> {
    fn save_reg(&mut self, offset: u32, reg: Reg, cfa_offset: i32) -> CodegenResult<()> {
        let mapped = self
            .map
            .map(reg)
            .map_err(|e| CodegenError::invalid(e.to_string()))?;
        // A push records the save at the new top of stack.
        let at = if cfa_offset == 0 {
            -self.sp_offset
        } else {
            cfa_offset
        };
        self.instructions
            .push((offset, CallFrameInstruction::Offset(mapped, at)));
        Ok(())
    }

    fn adjust_sp_down(&mut self, offset: u32, by: i32) {
        self.sp_offset += by;
        // With a frame register established the CFA no longer tracks the
        // stack pointer.
        if self.frame_register.is_some() {
            return;
        }
        self.instructions
            .push((offset, CallFrameInstruction::CfaOffset(self.sp_offset)));
    }

    fn set_cfa_reg(&mut self, offset: u32, reg: Reg) -> CodegenResult<()> {
        let mapped = self
            .map
            .map(reg)
            .map_err(|e| CodegenError::invalid(e.to_string()))?;
        self.instructions
            .push((offset, CallFrameInstruction::CfaRegister(mapped)));
        self.frame_register = Some(reg);
        Ok(())
    }

    fn restore_sp(&mut self, offset: u32, sp_offset: i32) {
        self.instructions
            .push((offset, CallFrameInstruction::Cfa(self.map.sp(), sp_offset)));
        self.frame_register = None;
        self.sp_offset = sp_offset;
    }

    fn remember_state(&mut self, offset: u32) {
        self.saved_state = Some((self.sp_offset, self.frame_register));
        self.instructions
            .push((offset, CallFrameInstruction::RememberState));
    }

    fn restore_state(&mut self, offset: u32) {
        if let Some((sp_offset, frame_register)) = self.saved_state.take() {
            self.sp_offset = sp_offset;
            self.frame_register = frame_register;
        }
        self.instructions
            .push((offset, CallFrameInstruction::RestoreState));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{PTR_FRAME, PTR_STACK, RBX};

    struct TestMapper;

    impl RegisterMapper for TestMapper {
        fn map(&self, reg: Reg) -> Result<Register, RegisterMappingError> {
            // x86-64 numbering for the registers the tests touch.
            if crate::reg::same(reg, PTR_FRAME) {
                Ok(Register(6))
            } else if crate::reg::same(reg, PTR_STACK) {
                Ok(Register(7))
            } else if crate::reg::same(reg, RBX) {
                Ok(Register(3))
            } else {
                Err(RegisterMappingError::Unmapped(format!("{reg}")))
            }
        }

        fn sp(&self) -> Register {
            Register(7)
        }

        fn ra(&self) -> Register {
            Register(16)
        }
    }

    #[test]
    fn canonical_prolog() {
        let mut c = UnwindCollector::default();
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        c.push(1, UnwindEvent::PushFrameReg(PTR_FRAME));
        c.push(4, UnwindEvent::SetFrameReg(PTR_FRAME));
        c.push(8, UnwindEvent::FrameAlloc(0x20));
        c.push(8, UnwindEvent::PrologEnd);

        let info = UnwindInfo::build(&c, 32, 8, 8, &TestMapper).unwrap();
        let insts = info.instructions();

        assert!(matches!(
            insts[0],
            (1, CallFrameInstruction::CfaOffset(16))
        ));
        assert!(matches!(
            insts[1],
            (1, CallFrameInstruction::Offset(Register(6), -16))
        ));
        assert!(matches!(
            insts[2],
            (4, CallFrameInstruction::CfaRegister(Register(6)))
        ));
        // The frame register is established; the allocation does not move
        // the CFA.
        assert_eq!(insts.len(), 3);
    }

    #[test]
    fn eh_frame_serializes() {
        let mut c = UnwindCollector::default();
        c.push(1, UnwindEvent::PushFrameReg(PTR_FRAME));
        c.push(4, UnwindEvent::SetFrameReg(PTR_FRAME));

        let info = UnwindInfo::build(&c, 16, 8, 8, &TestMapper).unwrap();
        let bytes = info.to_eh_frame(0x1000, 8, 8, &TestMapper).unwrap();
        assert!(!bytes.is_empty());
    }
}
