//! Machine-code emission for AArch64.
//!
//! Every instruction is one 32-bit word. The emitter accepts only the
//! operand forms the legalizer produces: register operands everywhere,
//! with loads and stores as the sole memory touchers. Adjacent loads or
//! stores of the same width to consecutive offsets off one base register
//! are fused into `ldp`/`stp` when nothing (such as a label) sits between
//! them.

use super::regs::{self, hw};
use crate::cond::CondFlag;
use crate::inst::Inst;
use crate::listing::Listing;
use crate::op::Op;
use crate::operand::{Operand, OperandKind};
use crate::output::Output;
use crate::reg::{self, Reg, PTR_FRAME, PTR_STACK};
use crate::result::{CodegenError, CodegenResult};
use crate::size::Size;

const ZR: u32 = 31;
const SCRATCH: u32 = 16;

fn width(size: Size) -> u32 {
    size.size64()
}

/// The sf bit: 1 for 64-bit operations.
fn sf(size: Size) -> u32 {
    if width(size) == 8 {
        1 << 31
    } else {
        0
    }
}

fn is_sp(r: Reg) -> bool {
    reg::same(r, PTR_STACK)
}

fn cond_code(c: CondFlag) -> CodegenResult<u32> {
    use CondFlag::*;
    Ok(match c {
        Equal => 0,
        NotEqual => 1,
        AboveEqual => 2,  // hs
        Below => 3,       // lo
        Overflow => 6,    // vs
        NoOverflow => 7,  // vc
        Above => 8,       // hi
        BelowEqual => 9,  // ls
        GreaterEqual => 10,
        Less => 11,
        Greater => 12,
        LessEqual => 13,
        // After fcmp, the signed conditions treat unordered correctly
        // through mi/ls/gt/ge.
        FBelow => 4,      // mi
        FBelowEqual => 9, // ls
        FAbove => 12,     // gt
        FAboveEqual => 10, // ge
        Always | Never => {
            return Err(CodegenError::invalid(
                "always/never have no condition encoding",
            ))
        }
    })
}

struct Emitter<'a> {
    out: &'a mut dyn Output,
}

impl<'a> Emitter<'a> {
    fn word(&mut self, w: u32) {
        self.out.put_u32(w);
    }

    /// Materialize a constant with a movz/movk chain.
    fn mov_imm(&mut self, rd: Reg, value: u64, size: Size) {
        let chunks = if width(size) == 8 { 4 } else { 2 };
        let base = if width(size) == 8 { 0xD280_0000u32 } else { 0x5280_0000 };
        let keep = if width(size) == 8 { 0xF280_0000u32 } else { 0x7280_0000 };

        let mut first = true;
        for i in 0..chunks {
            let chunk = ((value >> (16 * i)) & 0xFFFF) as u32;
            if chunk == 0 && !(first && i == chunks - 1) && !(first && value == 0 && i == 0) {
                continue;
            }
            let op = if first { base } else { keep };
            self.word(op | (i as u32) << 21 | chunk << 5 | hw(rd) as u32);
            first = false;
        }
        if first {
            // The value was zero.
            self.word(base | hw(rd) as u32);
        }
    }

    /// Load the address `base + disp` into the scratch register.
    fn materialize_addr(&mut self, base: Reg, disp: i64) -> u32 {
        self.mov_imm(regs::scratch0(), disp as u64, Size::LONG);
        // add x16, base, x16 (extended register, so sp works as base).
        self.word(0x8B20_6000 | SCRATCH << 16 | (hw(base) as u32) << 5 | SCRATCH);
        SCRATCH
    }

    /// A load or store of a general or vector register.
    ///
    /// `scaled`/`unscaled` are the full opcodes without register fields;
    /// offsets outside both forms go through the scratch register.
    fn mem_op(&mut self, scaled: u32, unscaled: u32, rt: Reg, base: Reg, disp: i32, size: u32) {
        let rt = hw(rt) as u32;
        if disp >= 0 && (disp as u32) % size == 0 && (disp as u32) / size < 4096 {
            let imm12 = (disp as u32 / size) << 10;
            self.word(scaled | imm12 | (hw(base) as u32) << 5 | rt);
        } else if (-256..256).contains(&disp) {
            let imm9 = ((disp as u32) & 0x1FF) << 12;
            self.word(unscaled | imm9 | (hw(base) as u32) << 5 | rt);
        } else {
            let rn = self.materialize_addr(base, disp as i64);
            self.word(unscaled | rn << 5 | rt);
        }
    }

    fn load(&mut self, rt: Reg, base: Reg, disp: i32, size: Size, fp: bool) -> CodegenResult<()> {
        let (scaled, unscaled, step) = match (fp, width(size)) {
            (false, 1) => (0x3940_0000, 0x3840_0000, 1),
            (false, 4) => (0xB940_0000, 0xB840_0000, 4),
            (false, 8) => (0xF940_0000, 0xF840_0000, 8),
            (true, 4) => (0xBD40_0000, 0xBC40_0000, 4),
            (true, 8) => (0xFD40_0000, 0xFC40_0000, 8),
            _ => return Err(CodegenError::invalid("unsupported load width")),
        };
        self.mem_op(scaled, unscaled, rt, base, disp, step);
        Ok(())
    }

    fn store(&mut self, rt: Reg, base: Reg, disp: i32, size: Size, fp: bool) -> CodegenResult<()> {
        let (scaled, unscaled, step) = match (fp, width(size)) {
            (false, 1) => (0x3900_0000, 0x3800_0000, 1),
            (false, 4) => (0xB900_0000, 0xB800_0000, 4),
            (false, 8) => (0xF900_0000, 0xF800_0000, 8),
            (true, 4) => (0xBD00_0000, 0xBC00_0000, 4),
            (true, 8) => (0xFD00_0000, 0xFC00_0000, 8),
            _ => return Err(CodegenError::invalid("unsupported store width")),
        };
        self.mem_op(scaled, unscaled, rt, base, disp, step);
        Ok(())
    }

    /// Load a pc-relative literal.
    fn load_literal(&mut self, rt: Reg, target: u32, size: Size, fp: bool) -> CodegenResult<()> {
        let opc = match (fp, width(size)) {
            (false, 4) => 0x1800_0000u32,
            (false, 8) => 0x5800_0000,
            (true, 4) => 0x1C00_0000,
            (true, 8) => 0x5C00_0000,
            _ => return Err(CodegenError::invalid("unsupported literal width")),
        };
        let rel = target as i64 - self.out.tell() as i64;
        let imm19 = ((rel / 4) as u32) & 0x7FFFF;
        self.word(opc | imm19 << 5 | hw(rt) as u32);
        Ok(())
    }

    fn mov(&mut self, i: &Inst) -> CodegenResult<()> {
        let size = i.size();
        let dst = i.dest();
        let src = i.src();
        let dst_fp = regs::fp_operand(dst);
        let src_fp = regs::fp_operand(src);

        match (dst.kind(), src.kind()) {
            (OperandKind::Reg(d), OperandKind::Reg(s)) => {
                match (dst_fp, src_fp) {
                    (true, true) => {
                        let op = if width(size) == 8 { 0x1E60_4000 } else { 0x1E20_4000 };
                        self.word(op | (hw(*s) as u32) << 5 | hw(*d) as u32);
                    }
                    (true, false) => {
                        let op = if width(size) == 8 { 0x9E67_0000 } else { 0x1E27_0000 };
                        self.word(op | (hw(*s) as u32) << 5 | hw(*d) as u32);
                    }
                    (false, true) => {
                        let op = if width(size) == 8 { 0x9E66_0000 } else { 0x1E26_0000 };
                        self.word(op | (hw(*s) as u32) << 5 | hw(*d) as u32);
                    }
                    (false, false) => {
                        if is_sp(*d) || is_sp(*s) {
                            // add rd, rn, #0 keeps sp meaningful.
                            self.word(
                                0x9100_0000 | (hw(*s) as u32) << 5 | hw(*d) as u32,
                            );
                        } else {
                            let op = if width(size) == 8 { 0xAA00_03E0 } else { 0x2A00_03E0 };
                            self.word(op | (hw(*s) as u32) << 16 | hw(*d) as u32);
                        }
                    }
                }
                Ok(())
            }
            (OperandKind::Reg(d), OperandKind::Const(c)) => {
                self.mov_imm(*d, *c, size);
                Ok(())
            }
            (OperandKind::Reg(d), OperandKind::DualConst(_, v64)) => {
                self.mov_imm(*d, *v64 as u64, size);
                Ok(())
            }
            (OperandKind::Reg(d), OperandKind::Rel(base, off)) => {
                self.load(*d, *base, off.v64(), size, dst_fp)
            }
            (OperandKind::Reg(d), OperandKind::LabelRel(l, off)) => {
                let target =
                    (self.out.label_offset(*l) as i64 + off.v64() as i64) as u32;
                self.load_literal(*d, target, size, dst_fp)
            }
            (OperandKind::Rel(base, off), OperandKind::Reg(s)) => {
                self.store(*s, *base, off.v64(), size, src_fp)
            }
            _ => Err(CodegenError::invalid(format!("unsupported move: {i:?}"))),
        }
    }

    /// Two-address register ALU operation: `rd = rd op rm`.
    fn alu3(&mut self, op64: u32, op32: u32, i: &Inst) -> CodegenResult<()> {
        let size = i.dest().size();
        let d = i.dest().reg();
        let m = i.src().reg();
        let op = if width(size) == 8 { op64 } else { op32 };
        self.word(op | (hw(m) as u32) << 16 | (hw(d) as u32) << 5 | hw(d) as u32);
        Ok(())
    }

    fn add_sub(&mut self, i: &Inst, is_sub: bool) -> CodegenResult<()> {
        let size = i.dest().size();
        let d = i.dest().reg();
        match i.src().kind() {
            OperandKind::Const(_) | OperandKind::DualConst(..) => {
                let v = i.src().const_value(true) as u32;
                if v >= 4096 {
                    // Frame allocations can exceed the immediate field;
                    // route them through the scratch register.
                    self.mov_imm(regs::scratch0(), v as u64, Size::LONG);
                    let op = if is_sub { 0xCB20_6000u32 } else { 0x8B20_6000 };
                    self.word(op | SCRATCH << 16 | (hw(d) as u32) << 5 | hw(d) as u32);
                    return Ok(());
                }
                let op = match (is_sub, width(size) == 8) {
                    (false, true) => 0x9100_0000,
                    (false, false) => 0x1100_0000,
                    (true, true) => 0xD100_0000,
                    (true, false) => 0x5100_0000,
                };
                self.word(op | (v & 0xFFF) << 10 | (hw(d) as u32) << 5 | hw(d) as u32);
            }
            OperandKind::Reg(m) => {
                if is_sp(d) {
                    // The shifted-register form reads zr where sp is
                    // meant; use the extended form.
                    let op = if is_sub { 0xCB20_6000 } else { 0x8B20_6000 };
                    self.word(op | (hw(*m) as u32) << 16 | (hw(d) as u32) << 5 | hw(d) as u32);
                } else {
                    let op = match (is_sub, width(size) == 8) {
                        (false, true) => 0x8B00_0000,
                        (false, false) => 0x0B00_0000,
                        (true, true) => 0xCB00_0000,
                        (true, false) => 0x4B00_0000,
                    };
                    self.word(op | (hw(*m) as u32) << 16 | (hw(d) as u32) << 5 | hw(d) as u32);
                }
            }
            _ => return Err(CodegenError::invalid("unsupported add/sub operand")),
        }
        Ok(())
    }

    fn cmp(&mut self, i: &Inst) -> CodegenResult<()> {
        let size = i.dest().size();
        let n = i.dest().reg();
        match i.src().kind() {
            OperandKind::Const(_) | OperandKind::DualConst(..) => {
                let v = i.src().const_value(true) as u32;
                let op = if width(size) == 8 { 0xF100_001F } else { 0x7100_001F };
                self.word(op | (v & 0xFFF) << 10 | (hw(n) as u32) << 5);
            }
            OperandKind::Reg(m) => {
                let op = if width(size) == 8 { 0xEB00_001F } else { 0x6B00_001F };
                self.word(op | (hw(*m) as u32) << 16 | (hw(n) as u32) << 5);
            }
            _ => return Err(CodegenError::invalid("unsupported compare operand")),
        }
        Ok(())
    }

    fn shift(&mut self, i: &Inst, variable: u32, variable32: u32, imm_kind: u8) -> CodegenResult<()> {
        let size = i.dest().size();
        let d = i.dest().reg();
        let bits = width(size) * 8;
        match i.src().kind() {
            OperandKind::Const(c) => {
                let sh = (*c as u32).min(bits);
                let (sbfm, ubfm) = if bits == 64 {
                    (0x9340_0000u32, 0xD340_0000u32)
                } else {
                    (0x1300_0000, 0x5300_0000)
                };
                let (op, immr, imms) = match imm_kind {
                    // lsl
                    0 => (ubfm, (bits - sh) % bits, bits - 1 - sh),
                    // lsr
                    1 => (ubfm, sh, bits - 1),
                    // asr
                    _ => (sbfm, sh, bits - 1),
                };
                self.word(op | immr << 16 | imms << 10 | (hw(d) as u32) << 5 | hw(d) as u32);
            }
            OperandKind::Reg(m) => {
                let op = if bits == 64 { variable } else { variable32 };
                self.word(op | (hw(*m) as u32) << 16 | (hw(d) as u32) << 5 | hw(d) as u32);
            }
            _ => return Err(CodegenError::invalid("unsupported shift count")),
        }
        Ok(())
    }

    fn cast(&mut self, i: &Inst, signed: bool) -> CodegenResult<()> {
        let d = i.dest().reg();
        let s = i.src().reg();
        let db = width(i.dest().size());
        let sb = width(i.src().size());

        if db <= sb {
            // Same width or narrowing: the 32-bit register move keeps the
            // low bits, stores later cut them down further.
            if db == 8 {
                self.word(0xAA00_03E0 | (hw(s) as u32) << 16 | hw(d) as u32);
            } else {
                self.word(0x2A00_03E0 | (hw(s) as u32) << 16 | hw(d) as u32);
            }
            return Ok(());
        }

        match (signed, sb, db) {
            (true, 1, 4) => self.word(0x1300_1C00 | (hw(s) as u32) << 5 | hw(d) as u32),
            (true, 1, 8) => self.word(0x9340_1C00 | (hw(s) as u32) << 5 | hw(d) as u32),
            (true, 4, 8) => self.word(0x9340_7C00 | (hw(s) as u32) << 5 | hw(d) as u32),
            (false, 1, _) => self.word(0x5300_1C00 | (hw(s) as u32) << 5 | hw(d) as u32),
            (false, 4, 8) => {
                // A 32-bit move zero-extends.
                self.word(0x2A00_03E0 | (hw(s) as u32) << 16 | hw(d) as u32);
            }
            _ => return Err(CodegenError::invalid("unsupported cast widths")),
        }
        Ok(())
    }

    fn lea(&mut self, i: &Inst) -> CodegenResult<()> {
        let d = i.dest().reg();
        match i.src().kind() {
            OperandKind::Rel(base, off) => {
                let disp = off.v64();
                if (0..4096).contains(&disp) {
                    self.word(
                        0x9100_0000
                            | (disp as u32) << 10
                            | (hw(*base) as u32) << 5
                            | hw(d) as u32,
                    );
                } else if (-4096..0).contains(&disp) {
                    self.word(
                        0xD100_0000
                            | ((-disp) as u32) << 10
                            | (hw(*base) as u32) << 5
                            | hw(d) as u32,
                    );
                } else {
                    let rn = self.materialize_addr(*base, disp as i64);
                    self.word(0x9100_0000 | rn << 5 | hw(d) as u32);
                }
                Ok(())
            }
            OperandKind::LabelRel(l, off) => {
                // adr: the pool and the tables are within a megabyte.
                let target = self.out.label_offset(*l) as i64 + off.v64() as i64;
                let rel = target - self.out.tell() as i64;
                let immlo = (rel as u32 & 0x3) << 29;
                let immhi = (((rel >> 2) as u32) & 0x7FFFF) << 5;
                self.word(0x1000_0000 | immlo | immhi | hw(d) as u32);
                Ok(())
            }
            _ => Err(CodegenError::invalid("lea needs a memory operand")),
        }
    }

    /// The load-address-and-branch sequence for external targets; the
    /// absolute address sits inline so the collector can patch it.
    fn far_branch(&mut self, target: &crate::refs::Ref, link: bool) {
        // ldr x16, +8; b +12; .quad target; blr/br x16
        self.word(0x5800_0040 | SCRATCH);
        self.word(0x1400_0003);
        self.out.put_ref_address(target);
        if link {
            self.word(0xD63F_0000 | SCRATCH << 5);
        } else {
            self.word(0xD61F_0000 | SCRATCH << 5);
        }
    }

    fn jump(&mut self, i: &Inst) -> CodegenResult<()> {
        let cond = i.src().cond();
        match i.dest().kind() {
            OperandKind::Label(l) => {
                let target = self.out.label_offset(*l) as i64;
                let rel = target - self.out.tell() as i64;
                match cond {
                    CondFlag::Never => {}
                    CondFlag::Always => {
                        self.word(0x1400_0000 | ((rel / 4) as u32 & 0x03FF_FFFF));
                    }
                    c => {
                        let imm19 = ((rel / 4) as u32 & 0x7FFFF) << 5;
                        self.word(0x5400_0000 | imm19 | cond_code(c)?);
                    }
                }
                Ok(())
            }
            OperandKind::Reg(r) => {
                self.word(0xD61F_0000 | (hw(*r) as u32) << 5);
                Ok(())
            }
            OperandKind::Ref(r) => {
                self.far_branch(r, false);
                Ok(())
            }
            _ => Err(CodegenError::invalid(format!("bad jump target: {i:?}"))),
        }
    }

    fn call(&mut self, i: &Inst) -> CodegenResult<()> {
        match i.dest().kind() {
            OperandKind::Ref(r) => {
                self.far_branch(r, true);
                Ok(())
            }
            OperandKind::Label(l) => {
                let rel = self.out.label_offset(*l) as i64 - self.out.tell() as i64;
                self.word(0x9400_0000 | ((rel / 4) as u32 & 0x03FF_FFFF));
                Ok(())
            }
            OperandKind::Reg(r) => {
                self.word(0xD63F_0000 | (hw(*r) as u32) << 5);
                Ok(())
            }
            OperandKind::Rel(base, off) => {
                self.load(regs::scratch0(), *base, off.v64(), Size::PTR, false)?;
                self.word(0xD63F_0000 | SCRATCH << 5);
                Ok(())
            }
            _ => Err(CodegenError::invalid(format!("bad call target: {i:?}"))),
        }
    }

    fn fp_arith(&mut self, i: &Inst, op_d: u32, op_s: u32) -> CodegenResult<()> {
        let d = i.dest().reg();
        let m = i.src().reg();
        let op = if width(i.dest().size()) == 8 { op_d } else { op_s };
        self.word(op | (hw(m) as u32) << 16 | (hw(d) as u32) << 5 | hw(d) as u32);
        Ok(())
    }

    fn emit(&mut self, i: &Inst) -> CodegenResult<()> {
        match i.op() {
            Op::Nop => {
                self.word(0xD503_201F);
                Ok(())
            }
            Op::Mov => self.mov(i),
            Op::Lea => self.lea(i),

            Op::Add => self.add_sub(i, false),
            Op::Sub => self.add_sub(i, true),
            Op::Adc => self.alu3(0x9A00_0000, 0x1A00_0000, i),
            Op::Sbb => self.alu3(0xDA00_0000, 0x5A00_0000, i),
            Op::And => self.alu3(0x8A00_0000, 0x0A00_0000, i),
            Op::Or => self.alu3(0xAA00_0000, 0x2A00_0000, i),
            Op::Xor => self.alu3(0xCA00_0000, 0x4A00_0000, i),
            Op::Mul => self.alu3(0x9B00_7C00, 0x1B00_7C00, i),
            Op::IDiv => self.alu3(0x9AC0_0C00, 0x1AC0_0C00, i),
            Op::UDiv => self.alu3(0x9AC0_0800, 0x1AC0_0800, i),
            Op::IMod | Op::UMod => {
                // divide into the scratch register, then multiply-subtract
                // the quotient back out.
                let size = i.dest().size();
                let d = hw(i.dest().reg()) as u32;
                let m = hw(i.src().reg()) as u32;
                let div = match (i.op() == Op::IMod, width(size) == 8) {
                    (true, true) => 0x9AC0_0C00,
                    (true, false) => 0x1AC0_0C00,
                    (false, true) => 0x9AC0_0800,
                    (false, false) => 0x1AC0_0800,
                };
                self.word(div | m << 16 | d << 5 | SCRATCH);
                let msub = if width(size) == 8 { 0x9B00_8000u32 } else { 0x1B00_8000 };
                self.word(msub | m << 16 | d << 10 | SCRATCH << 5 | d);
                Ok(())
            }
            Op::Not => {
                let size = i.dest().size();
                let d = hw(i.dest().reg()) as u32;
                let op = if width(size) == 8 { 0xAA20_03E0u32 } else { 0x2A20_03E0 };
                self.word(op | d << 16 | d);
                Ok(())
            }
            Op::Cmp => self.cmp(i),
            Op::Test => {
                let size = i.size();
                let n = hw(i.dest().reg()) as u32;
                let m = hw(i.src().reg()) as u32;
                let op = if width(size) == 8 { 0xEA00_001Fu32 } else { 0x6A00_001F };
                self.word(op | m << 16 | n << 5);
                Ok(())
            }

            Op::Shl => self.shift(i, 0x9AC0_2000, 0x1AC0_2000, 0),
            Op::Shr => self.shift(i, 0x9AC0_2400, 0x1AC0_2400, 1),
            Op::Sar => self.shift(i, 0x9AC0_2800, 0x1AC0_2800, 2),

            Op::ICast => self.cast(i, true),
            Op::UCast => self.cast(i, false),

            Op::SetCond => {
                // cset: csinc from zr with the inverted condition.
                let d = hw(i.dest().reg()) as u32;
                let c = cond_code(i.src().cond())? ^ 1;
                self.word(0x1A9F_07E0 | c << 12 | d);
                Ok(())
            }

            Op::Jmp => self.jump(i),
            Op::Call => self.call(i),
            Op::Ret => {
                self.word(0xD65F_03C0);
                self.out.cfi_epilog_end();
                Ok(())
            }

            Op::Push => {
                // str xt, [sp, #-16]!; one register per slot keeps the
                // stack 16-byte aligned.
                let rt = hw(i.src().reg()) as u32;
                self.word(0xF81F_0C00 | ZR << 5 | rt);
                Ok(())
            }
            Op::Pop => {
                let rt = hw(i.dest().reg()) as u32;
                self.word(0xF841_0400 | ZR << 5 | rt);
                Ok(())
            }
            Op::PushFlags => {
                self.word(0xD53B_4200 | SCRATCH); // mrs x16, nzcv
                self.word(0xF81F_0C00 | ZR << 5 | SCRATCH);
                Ok(())
            }
            Op::PopFlags => {
                self.word(0xF841_0400 | ZR << 5 | SCRATCH);
                self.word(0xD51B_4200 | SCRATCH); // msr nzcv, x16
                Ok(())
            }

            Op::FAdd => self.fp_arith(i, 0x1E60_2800, 0x1E20_2800),
            Op::FSub => self.fp_arith(i, 0x1E60_3800, 0x1E20_3800),
            Op::FMul => self.fp_arith(i, 0x1E60_0800, 0x1E20_0800),
            Op::FDiv => self.fp_arith(i, 0x1E60_1800, 0x1E20_1800),
            Op::FNeg => {
                let d = hw(i.dest().reg()) as u32;
                let s = hw(i.src().reg()) as u32;
                let op = if width(i.dest().size()) == 8 { 0x1E61_4000u32 } else { 0x1E21_4000 };
                self.word(op | s << 5 | d);
                Ok(())
            }
            Op::FCmp => {
                let n = hw(i.dest().reg()) as u32;
                let m = hw(i.src().reg()) as u32;
                let op = if width(i.dest().size()) == 8 { 0x1E60_2000u32 } else { 0x1E20_2000 };
                self.word(op | m << 16 | n << 5);
                Ok(())
            }
            Op::FCast => {
                let d = hw(i.dest().reg()) as u32;
                let s = hw(i.src().reg()) as u32;
                let db = width(i.dest().size());
                let sb = width(i.src().size());
                match (sb, db) {
                    (4, 8) => self.word(0x1E22_C000 | s << 5 | d),
                    (8, 4) => self.word(0x1E62_4000 | s << 5 | d),
                    _ => {
                        let op = if db == 8 { 0x1E60_4000u32 } else { 0x1E20_4000 };
                        self.word(op | s << 5 | d);
                    }
                }
                Ok(())
            }
            Op::FCastI | Op::FCastU => {
                let d = hw(i.dest().reg()) as u32;
                let s = hw(i.src().reg()) as u32;
                let from_d = width(i.src().size()) == 8;
                let unsigned = i.op() == Op::FCastU;
                let mut op: u32 = match (from_d, unsigned) {
                    (false, false) => 0x1E38_0000,
                    (false, true) => 0x1E39_0000,
                    (true, false) => 0x1E78_0000,
                    (true, true) => 0x1E79_0000,
                };
                if width(i.dest().size()) == 8 {
                    op |= 1 << 31;
                }
                self.word(op | s << 5 | d);
                Ok(())
            }
            Op::ICastF | Op::UCastF => {
                let d = hw(i.dest().reg()) as u32;
                let s = hw(i.src().reg()) as u32;
                let to_d = width(i.dest().size()) == 8;
                let unsigned = i.op() == Op::UCastF;
                let mut op: u32 = match (to_d, unsigned) {
                    (false, false) => 0x1E22_0000,
                    (false, true) => 0x1E23_0000,
                    (true, false) => 0x1E62_0000,
                    (true, true) => 0x1E63_0000,
                };
                if width(i.src().size()) == 8 {
                    op |= 1 << 31;
                }
                self.word(op | s << 5 | d);
                Ok(())
            }

            Op::Dat => {
                let src = i.src();
                match src.kind() {
                    OperandKind::Const(c) => self.out.put_sized(*c, src.size()),
                    OperandKind::DualConst(v32, v64) => {
                        let value = if self.out.ptr_size() == 8 { *v64 } else { *v32 };
                        self.out.put_sized(value as u64, src.size());
                    }
                    OperandKind::Ref(r) => self.out.put_ref_address(r),
                    OperandKind::Obj(p) => self.out.put_obj_ptr(*p),
                    OperandKind::Label(l) => self.out.put_label_address(*l),
                    _ => {
                        return Err(CodegenError::invalid(format!(
                            "unsupported data operand: {src:?}"
                        )))
                    }
                }
                Ok(())
            }
            Op::LblOffset => {
                self.out.put_label_offset(i.src().label());
                Ok(())
            }
            Op::Align => {
                let align = i.src().const_value(self.out.ptr_size() == 8) as u32;
                self.out.align_to(align.max(1));
                Ok(())
            }

            Op::Prolog => {
                // stp x29, x30, [sp, #-16]!
                self.word(0xA9BF_7BFD);
                self.out.cfi_frame_alloc(16);
                self.out.cfi_saved(PTR_FRAME, -16);
                self.out.cfi_saved(regs::xr(30), -8);
                // mov x29, sp
                self.word(0x9100_03FD);
                self.out.cfi_set_frame_reg(PTR_FRAME);
                Ok(())
            }
            Op::Epilog => {
                self.out.cfi_epilog_start();
                // mov sp, x29
                self.word(0x9100_03BF);
                // ldp x29, x30, [sp], #16
                self.word(0xA8C1_7BFD);
                self.out.cfi_restore_sp();
                Ok(())
            }
            Op::Preserve => {
                let off = i.dest().offset().v64();
                self.out.cfi_saved(i.src().reg(), off - 16);
                Ok(())
            }
            Op::Meta => {
                self.out.cfi_prolog_end();
                Ok(())
            }
            Op::Location => Ok(()),
            Op::ThreadLocal => Err(CodegenError::invalid(
                "thread-local accesses are not lowered on this target",
            )),

            op => Err(CodegenError::invalid(format!(
                "operation {op:?} should have been lowered before emission"
            ))),
        }
    }
}

/// The shape a load/store takes for fusion purposes.
struct MemAccess {
    store: bool,
    rt: Reg,
    base: Reg,
    disp: i32,
    bytes: u32,
}

fn mem_access(i: &Inst) -> Option<MemAccess> {
    if i.op() != Op::Mov {
        return None;
    }
    match (i.dest().kind(), i.src().kind()) {
        (OperandKind::Reg(rt), OperandKind::Rel(base, off))
            if !regs::fp_register(*rt) && !is_sp(*rt) =>
        {
            let bytes = width(i.size());
            (bytes == 4 || bytes == 8).then(|| MemAccess {
                store: false,
                rt: *rt,
                base: *base,
                disp: off.v64(),
                bytes,
            })
        }
        (OperandKind::Rel(base, off), OperandKind::Reg(rt))
            if !regs::fp_register(*rt) && !is_sp(*rt) =>
        {
            let bytes = width(i.size());
            (bytes == 4 || bytes == 8).then(|| MemAccess {
                store: true,
                rt: *rt,
                base: *base,
                disp: off.v64(),
                bytes,
            })
        }
        _ => None,
    }
}

/// Can these two adjacent accesses fuse into one `ldp`/`stp`?
fn fusable(a: &MemAccess, b: &MemAccess) -> bool {
    a.store == b.store
        && a.bytes == b.bytes
        && reg::same(a.base, b.base)
        && b.disp == a.disp + a.bytes as i32
        && !reg::same(a.rt, b.rt)
        && a.disp % a.bytes as i32 == 0
        && (-64..64).contains(&(a.disp / a.bytes as i32))
        // A load must not overwrite its own base before the second half.
        && (a.store || !reg::same(a.rt, a.base))
}

fn emit_pair(e: &mut Emitter, a: &MemAccess, b: &MemAccess) {
    let imm7 = ((a.disp / a.bytes as i32) as u32 & 0x7F) << 15;
    let op = match (a.store, a.bytes == 8) {
        (false, true) => 0xA940_0000u32,
        (false, false) => 0x2940_0000,
        (true, true) => 0xA900_0000,
        (true, false) => 0x2900_0000,
    };
    e.word(
        op | imm7
            | (hw(b.rt) as u32) << 10
            | (hw(a.base) as u32) << 5
            | hw(a.rt) as u32,
    );
}

/// Emit a fully transformed listing, fusing adjacent load/store pairs.
pub(super) fn emit_listing(src: &Listing, out: &mut dyn Output) -> CodegenResult<()> {
    let mut e = Emitter { out };

    let mut line = 0;
    while line < src.count() {
        for &l in src.labels_at(line) {
            e.out.mark_label(l);
        }

        // Fuse with the next instruction when it is the adjacent half of
        // a pair and no label points between the two.
        if line + 1 < src.count() && src.labels_at(line + 1).is_empty() {
            if let (Some(a), Some(b)) = (mem_access(src.at(line)), mem_access(src.at(line + 1))) {
                if fusable(&a, &b) {
                    emit_pair(&mut e, &a, &b);
                    line += 2;
                    continue;
                }
            }
        }

        let i = src.at(line);
        let frame_alloc = i.op() == Op::Sub
            && matches!(i.dest().kind(), OperandKind::Reg(r) if is_sp(*r))
            && matches!(
                i.src().kind(),
                OperandKind::Const(_) | OperandKind::DualConst(..)
            );
        e.emit(i)?;
        if frame_alloc {
            let size = i.src().const_value(true) as u32;
            e.out.cfi_frame_alloc(size);
        }
        line += 1;
    }

    for &l in src.labels_at(src.count()) {
        e.out.mark_label(l);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::regs;
    use super::*;
    use crate::inst::*;
    use crate::operand::{int_const, x_rel};
    use crate::output::LabelOutput;
    use crate::size::Offset;

    fn words_of(l: &Listing) -> Vec<u32> {
        let mut sizing = LabelOutput::new(8, l.label_count());
        emit_listing(l, &mut sizing).unwrap();
        let size = sizing.size as usize;

        use crate::gc::CodeAllocator;
        let block = crate::code_mem::HeapCodeAllocator.alloc_code(size, (sizing.refs + 4) as usize);
        let mut out = crate::output::CodeOutput::new(8, block, sizing.offsets);
        emit_listing(l, &mut out).unwrap();
        let (block, ..) = out.finish();

        block.bytes()[..size]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn one(i: Inst) -> u32 {
        let mut l = Listing::new();
        l.push(i);
        words_of(&l)[0]
    }

    #[test]
    fn basic_encodings() {
        // add x3, x3, x4
        assert_eq!(one(add(regs::xr(3), regs::xr(4))), 0x8B04_0063);
        // sub x3, x3, #16
        assert_eq!(
            one(sub(regs::xr(3), crate::operand::long_const(16))),
            0xD100_4063
        );
        // mov x5, x6 (orr x5, xzr, x6)
        assert_eq!(one(mov(regs::xr(5), regs::xr(6))), 0xAA06_03E5);
        // nop
        assert_eq!(one(nop()), 0xD503_201F);
        // ret
        assert_eq!(one(ret()), 0xD65F_03C0);
    }

    #[test]
    fn loads_and_stores() {
        // ldr x3, [x29, #16]
        assert_eq!(
            one(mov(
                regs::xr(3),
                x_rel(Size::LONG, crate::reg::PTR_FRAME, Offset::fixed(16))
            )),
            0xF940_0BA3
        );
        // str w4, [sp]
        assert_eq!(
            one(mov(
                x_rel(Size::INT, crate::reg::PTR_STACK, Offset::ZERO),
                reg::as_size(regs::xr(4), Size::INT).unwrap()
            )),
            0xB900_03E4
        );
        // ldur x3, [x29, #-8]
        assert_eq!(
            one(mov(
                regs::xr(3),
                x_rel(Size::LONG, crate::reg::PTR_FRAME, Offset::fixed(-8))
            )),
            0xF85F_83A3
        );
    }

    #[test]
    fn movz_chains() {
        // mov w3, #7 -> movz w3, #7
        assert_eq!(
            one(mov(reg::as_size(regs::xr(3), Size::INT).unwrap(), int_const(7))),
            0x5280_00E3
        );
    }

    #[test]
    fn prolog_words() {
        let mut l = Listing::new();
        l.push(prolog());
        let w = words_of(&l);
        assert_eq!(w, vec![0xA9BF_7BFD, 0x9100_03FD]);
    }

    #[test]
    fn division_pair() {
        // sdiv x3, x3, x4
        assert_eq!(one(idiv(regs::xr(3), regs::xr(4))), 0x9AC4_0C63);
        // imod: sdiv x16, x3, x4; msub x3, x16, x4, x3
        let mut l = Listing::new();
        l.push(imod(regs::xr(3), regs::xr(4)));
        assert_eq!(words_of(&l), vec![0x9AC4_0C70, 0x9B04_0E03]);
    }

    #[test]
    fn ldp_fusion() {
        let mut l = Listing::new();
        l.push(mov(
            regs::xr(3),
            x_rel(Size::LONG, crate::reg::PTR_FRAME, Offset::fixed(16)),
        ));
        l.push(mov(
            regs::xr(4),
            x_rel(Size::LONG, crate::reg::PTR_FRAME, Offset::fixed(24)),
        ));
        // ldp x3, x4, [x29, #16]
        assert_eq!(words_of(&l), vec![0xA941_13A3]);
    }

    #[test]
    fn no_fusion_across_labels() {
        let mut l = Listing::new();
        let mid = l.label();
        l.push(mov(
            regs::xr(3),
            x_rel(Size::LONG, crate::reg::PTR_FRAME, Offset::fixed(16)),
        ));
        l.mark(mid);
        l.push(mov(
            regs::xr(4),
            x_rel(Size::LONG, crate::reg::PTR_FRAME, Offset::fixed(24)),
        ));
        assert_eq!(words_of(&l).len(), 2);
    }
}
