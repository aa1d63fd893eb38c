//! Machine-code emission for x64.
//!
//! The emitter only accepts the operand combinations the legalization and
//! frame passes produce; anything else is a fatal error rather than a
//! silent mis-encoding. All label-relative fields are fixed at four
//! bytes, so the sizing pass and the code pass agree byte-for-byte.

use super::regs::{self, hw};
use crate::cond::CondFlag;
use crate::inst::Inst;
use crate::label::Label;
use crate::listing::Listing;
use crate::op::Op;
use crate::operand::{Operand, OperandKind};
use crate::output::Output;
use crate::reg::{self, Reg};
use crate::result::{CodegenError, CodegenResult};
use crate::size::Size;

/// Byte width of an operand on this target.
fn width(size: Size) -> u32 {
    size.size64()
}

/// Register / memory / rip-relative form of a resolved operand.
enum Rm {
    Reg(Reg),
    Mem { base: Reg, disp: i32 },
    Rip { label: Label, disp: i32 },
}

fn rm_of(op: &Operand) -> CodegenResult<Rm> {
    match op.kind() {
        OperandKind::Reg(r) => Ok(Rm::Reg(*r)),
        OperandKind::Rel(base, off) => Ok(Rm::Mem {
            base: *base,
            disp: off.v64(),
        }),
        OperandKind::LabelRel(l, off) => Ok(Rm::Rip {
            label: *l,
            disp: off.v64(),
        }),
        _ => Err(CodegenError::invalid(format!(
            "operand not in a register/memory form: {op:?}"
        ))),
    }
}

fn cc(c: CondFlag) -> CodegenResult<u8> {
    use CondFlag::*;
    Ok(match c {
        Overflow => 0x0,
        NoOverflow => 0x1,
        Below | FBelow => 0x2,
        AboveEqual | FAboveEqual => 0x3,
        Equal => 0x4,
        NotEqual => 0x5,
        BelowEqual | FBelowEqual => 0x6,
        Above | FAbove => 0x7,
        Less => 0xC,
        GreaterEqual => 0xD,
        LessEqual => 0xE,
        Greater => 0xF,
        Always | Never => {
            return Err(CodegenError::invalid(
                "always/never have no condition encoding",
            ))
        }
    })
}

struct Emitter<'a> {
    out: &'a mut dyn Output,
    windows: bool,
    /// A `thread_local` marker precedes the next memory operation.
    tls: bool,
}

impl<'a> Emitter<'a> {
    fn put(&mut self, b: u8) {
        self.out.put_u8(b);
    }

    /// The REX prefix for an instruction, if one is needed.
    fn rex(&mut self, size: Size, reg_hw: u8, rm: &Rm) {
        let w = width(size) == 8;
        let r = reg_hw >= 8;
        let b = match rm {
            Rm::Reg(rr) => hw(*rr) >= 8,
            Rm::Mem { base, .. } => hw(*base) >= 8,
            Rm::Rip { .. } => false,
        };
        // sil/dil are only addressable with a REX prefix present.
        let low_byte = width(size) == 1
            && (matches!(rm, Rm::Reg(rr) if (4..8).contains(&hw(*rr))) || (4..8).contains(&reg_hw));

        if w || r || b || low_byte {
            self.put(0x40 | (w as u8) << 3 | (r as u8) << 2 | (b as u8));
        }
    }

    /// ModRM (+ SIB, + displacement) for `reg_field` against `rm`.
    /// `imm_after` is the width of an immediate following the
    /// displacement, needed to aim rip-relative fields.
    fn modrm(&mut self, reg_field: u8, rm: &Rm, imm_after: u32) {
        let reg = (reg_field & 7) << 3;
        match rm {
            Rm::Reg(r) => {
                self.put(0xC0 | reg | (hw(*r) & 7));
            }
            Rm::Mem { base, disp } => {
                let base_hw = hw(*base) & 7;
                let disp = *disp;
                let need_disp8 = disp != 0 || base_hw == 5;
                let mode = if !need_disp8 {
                    0x00
                } else if i8::try_from(disp).is_ok() {
                    0x40
                } else {
                    0x80
                };
                self.put(mode | reg | base_hw);
                if base_hw == 4 {
                    // rsp/r12 bases take a SIB byte.
                    self.put(0x24);
                }
                if mode == 0x40 {
                    self.put(disp as u8);
                } else if mode == 0x80 {
                    self.out.put_u32(disp as u32);
                }
            }
            Rm::Rip { label, disp } => {
                self.put(reg | 0x05);
                let target = self.out.label_offset(*label) as i64 + *disp as i64;
                let rel = target - (self.out.tell() as i64 + 4 + imm_after as i64);
                self.out.put_u32(rel as u32);
            }
        }
    }

    /// One instruction of the classic two-operand ALU group.
    fn alu(&mut self, base: u8, ext: u8, i: &Inst) -> CodegenResult<()> {
        let size = i.size();
        let byte = width(size) == 1;

        match (i.dest().kind(), i.src().kind()) {
            // op r/m, imm
            (_, OperandKind::Const(_)) | (_, OperandKind::DualConst(..)) => {
                let rm = rm_of(i.dest())?;
                let value = i.src().const_value(true);
                let small = !byte && i8::try_from(value as i64).is_ok();
                self.rex(size, ext, &rm);
                if byte {
                    self.put(0x80);
                } else if small {
                    self.put(0x83);
                } else {
                    self.put(0x81);
                }
                self.modrm(ext, &rm, if byte || small { 1 } else { 4 });
                if byte || small {
                    self.put(value as u8);
                } else {
                    self.out.put_u32(value as u32);
                }
            }
            // op r, r/m
            (OperandKind::Reg(d), _) => {
                match i.src().kind() {
                    OperandKind::Reg(_) => {
                        // Prefer the r/m, r form for register pairs.
                        let rm = Rm::Reg(*d);
                        let s = i.src().reg();
                        self.rex(size, hw(s), &rm);
                        self.put(if byte { base } else { base + 1 });
                        self.modrm(hw(s), &rm, 0);
                    }
                    _ => {
                        let rm = rm_of(i.src())?;
                        self.rex(size, hw(*d), &rm);
                        self.put(if byte { base + 2 } else { base + 3 });
                        self.modrm(hw(*d), &rm, 0);
                    }
                }
            }
            // op m, r
            (_, OperandKind::Reg(s)) => {
                let rm = rm_of(i.dest())?;
                self.rex(size, hw(*s), &rm);
                self.put(if byte { base } else { base + 1 });
                self.modrm(hw(*s), &rm, 0);
            }
            _ => {
                return Err(CodegenError::invalid(format!(
                    "unsupported ALU operand combination: {i:?}"
                )))
            }
        }
        Ok(())
    }

    fn sse_prefix(&mut self, size: Size, packed66: bool) {
        if packed66 {
            self.put(0x66);
        } else if width(size) == 4 {
            self.put(0xF3);
        } else {
            self.put(0xF2);
        }
    }

    /// A scalar SSE operation: prefix, optional REX, 0F, opcode, modrm.
    fn sse(&mut self, prefix: Option<u8>, opcode: u8, xmm: Reg, rm: &Rm, rex_w: bool) {
        if let Some(p) = prefix {
            self.put(p);
        }
        let r = hw(xmm) >= 8;
        let b = match rm {
            Rm::Reg(rr) => hw(*rr) >= 8,
            Rm::Mem { base, .. } => hw(*base) >= 8,
            Rm::Rip { .. } => false,
        };
        if r || b || rex_w {
            self.put(0x40 | (rex_w as u8) << 3 | (r as u8) << 2 | b as u8);
        }
        self.put(0x0F);
        self.put(opcode);
        self.modrm(hw(xmm), rm, 0);
    }

    fn mov(&mut self, i: &Inst) -> CodegenResult<()> {
        let size = i.size();
        let dst = i.dest();
        let src = i.src();

        let dst_fp = regs::fp_operand(dst);
        let src_fp = regs::fp_operand(src);

        if dst_fp {
            let d = dst.reg();
            return match src.kind() {
                // xmm <- gpr
                OperandKind::Reg(s) if !regs::fp_register(*s) => {
                    self.sse(Some(0x66), 0x6E, d, &Rm::Reg(*s), width(size) == 8);
                    Ok(())
                }
                // xmm <- xmm/mem
                OperandKind::Reg(_) | OperandKind::Rel(..) | OperandKind::LabelRel(..) => {
                    let prefix = if width(size) == 4 { 0xF3 } else { 0xF2 };
                    let rm = rm_of(src)?;
                    self.sse(Some(prefix), 0x10, d, &rm, false);
                    Ok(())
                }
                _ => Err(CodegenError::invalid(format!(
                    "unsupported vector move: {i:?}"
                ))),
            };
        }
        if src_fp {
            let s = src.reg();
            return match dst.kind() {
                // gpr <- xmm
                OperandKind::Reg(d) => {
                    self.sse(Some(0x66), 0x7E, s, &Rm::Reg(*d), width(size) == 8);
                    Ok(())
                }
                // mem <- xmm
                OperandKind::Rel(..) | OperandKind::LabelRel(..) => {
                    let prefix = if width(size) == 4 { 0xF3 } else { 0xF2 };
                    let rm = rm_of(dst)?;
                    self.sse(Some(prefix), 0x11, s, &rm, false);
                    Ok(())
                }
                _ => Err(CodegenError::invalid(format!(
                    "unsupported vector move: {i:?}"
                ))),
            };
        }

        let byte = width(size) == 1;
        match (dst.kind(), src.kind()) {
            (OperandKind::Reg(d), OperandKind::Reg(_)) => {
                let rm = Rm::Reg(*d);
                let s = src.reg();
                self.rex(size, hw(s), &rm);
                self.put(if byte { 0x88 } else { 0x89 });
                self.modrm(hw(s), &rm, 0);
            }
            (OperandKind::Reg(d), OperandKind::Rel(..)) | (OperandKind::Reg(d), OperandKind::LabelRel(..)) => {
                let rm = rm_of(src)?;
                self.rex(size, hw(*d), &rm);
                self.put(if byte { 0x8A } else { 0x8B });
                self.modrm(hw(*d), &rm, 0);
            }
            (_, OperandKind::Reg(s)) => {
                let rm = rm_of(dst)?;
                self.rex(size, hw(*s), &rm);
                self.put(if byte { 0x88 } else { 0x89 });
                self.modrm(hw(*s), &rm, 0);
            }
            (OperandKind::Reg(d), OperandKind::Const(c)) if width(size) == 8 && !fits_i32(*c) => {
                // The full 64-bit immediate form.
                let rm = Rm::Reg(*d);
                self.rex(size, 0, &rm);
                self.put(0xB8 + (hw(*d) & 7));
                self.out.put_u64(*c);
            }
            (OperandKind::Reg(d), OperandKind::Ref(r)) => {
                // Absolute address; the collector re-patches it on moves.
                let rm = Rm::Reg(*d);
                self.rex(Size::LONG, 0, &rm);
                self.put(0xB8 + (hw(*d) & 7));
                self.out.put_ref_address(r);
            }
            (OperandKind::Reg(d), OperandKind::Obj(p)) => {
                let rm = Rm::Reg(*d);
                self.rex(Size::LONG, 0, &rm);
                self.put(0xB8 + (hw(*d) & 7));
                self.out.put_obj_ptr(*p);
            }
            (_, OperandKind::Const(_)) | (_, OperandKind::DualConst(..)) => {
                let rm = rm_of(dst)?;
                let value = src.const_value(true);
                self.rex(size, 0, &rm);
                self.put(if byte { 0xC6 } else { 0xC7 });
                self.modrm(0, &rm, if byte { 1 } else { 4 });
                if byte {
                    self.put(value as u8);
                } else {
                    self.out.put_u32(value as u32);
                }
            }
            _ => {
                return Err(CodegenError::invalid(format!(
                    "unsupported move: {i:?}"
                )))
            }
        }
        Ok(())
    }

    fn division(&mut self, i: &Inst, signed: bool) -> CodegenResult<()> {
        let size = i.dest().size();
        let rm = rm_of(i.src())?;

        match width(size) {
            1 => {
                if signed {
                    // cbw: sign-extend al into ax.
                    self.put(0x66);
                    self.put(0x98);
                } else {
                    // movzx eax, al
                    self.put(0x0F);
                    self.put(0xB6);
                    self.put(0xC0);
                }
                self.rex(size, if signed { 7 } else { 6 }, &rm);
                self.put(0xF6);
                self.modrm(if signed { 7 } else { 6 }, &rm, 0);
            }
            w => {
                if signed {
                    if w == 8 {
                        self.put(0x48);
                    }
                    self.put(0x99); // cdq / cqo
                } else {
                    self.put(0x31); // xor edx, edx
                    self.put(0xD2);
                }
                self.rex(size, if signed { 7 } else { 6 }, &rm);
                self.put(0xF7);
                self.modrm(if signed { 7 } else { 6 }, &rm, 0);
            }
        }
        Ok(())
    }

    fn shift(&mut self, i: &Inst, ext: u8) -> CodegenResult<()> {
        let size = i.dest().size();
        let byte = width(size) == 1;
        let rm = rm_of(i.dest())?;

        match i.src().kind() {
            OperandKind::Reg(r) if reg::same(*r, reg::RCX) => {
                self.rex(size, ext, &rm);
                self.put(if byte { 0xD2 } else { 0xD3 });
                self.modrm(ext, &rm, 0);
            }
            OperandKind::Const(c) => {
                self.rex(size, ext, &rm);
                self.put(if byte { 0xC0 } else { 0xC1 });
                self.modrm(ext, &rm, 1);
                self.put(*c as u8);
            }
            _ => {
                return Err(CodegenError::invalid(
                    "shift count must be cl or an immediate",
                ))
            }
        }
        Ok(())
    }

    fn cast(&mut self, i: &Inst, signed: bool) -> CodegenResult<()> {
        let d = match i.dest().kind() {
            OperandKind::Reg(r) => *r,
            _ => return Err(CodegenError::invalid("cast destination must be a register")),
        };
        let d_bytes = width(i.dest().size());
        let s_bytes = width(i.src().size());

        if d_bytes == s_bytes {
            return self.mov(&crate::inst::mov(i.dest().clone(), i.src().clone()));
        }

        if d_bytes < s_bytes {
            // Narrowing: move the low part.
            let narrow_src = i.src().resized(i.dest().size());
            return self.mov(&crate::inst::mov(i.dest().clone(), narrow_src));
        }

        let rm = rm_of(i.src())?;
        match (signed, s_bytes, d_bytes) {
            (true, 1, _) => {
                self.rex(i.dest().size(), hw(d), &rm);
                self.put(0x0F);
                self.put(0xBE);
                self.modrm(hw(d), &rm, 0);
            }
            (true, 4, 8) => {
                self.rex(Size::LONG, hw(d), &rm);
                self.put(0x63); // movsxd
                self.modrm(hw(d), &rm, 0);
            }
            (false, 1, _) => {
                self.rex(i.dest().size(), hw(d), &rm);
                self.put(0x0F);
                self.put(0xB6);
                self.modrm(hw(d), &rm, 0);
            }
            (false, 4, 8) => {
                // A 32-bit move zero-extends.
                self.rex(Size::INT, hw(d), &rm);
                self.put(0x8B);
                self.modrm(hw(d), &rm, 0);
            }
            _ => {
                return Err(CodegenError::invalid(format!(
                    "unsupported cast: {s_bytes} -> {d_bytes} bytes"
                )))
            }
        }
        Ok(())
    }

    fn jump(&mut self, i: &Inst) -> CodegenResult<()> {
        let cond = i.src().cond();
        match i.dest().kind() {
            OperandKind::Label(l) => match cond {
                CondFlag::Never => {}
                CondFlag::Always => {
                    self.put(0xE9);
                    self.out.put_label_relative(*l);
                }
                c => {
                    self.put(0x0F);
                    self.put(0x80 + cc(c)?);
                    self.out.put_label_relative(*l);
                }
            },
            OperandKind::Ref(r) => {
                if cond != CondFlag::Always {
                    return Err(CodegenError::invalid("conditional jumps need a label"));
                }
                // The marker form lets the relocation updater expand the
                // jump in place when the target moves out of rel32 range.
                if self.windows {
                    self.put(0x48);
                }
                self.put(0xE9);
                self.out.put_ref_relative(r);
            }
            OperandKind::Reg(_) | OperandKind::Rel(..) => {
                if cond != CondFlag::Always {
                    return Err(CodegenError::invalid("conditional jumps need a label"));
                }
                let rm = rm_of(i.dest())?;
                self.rex(Size::INT, 4, &rm);
                self.put(0xFF);
                self.modrm(4, &rm, 0);
            }
            _ => return Err(CodegenError::invalid(format!("bad jump target: {i:?}"))),
        }
        Ok(())
    }

    fn call(&mut self, i: &Inst) -> CodegenResult<()> {
        match i.dest().kind() {
            OperandKind::Ref(r) => {
                if self.windows {
                    self.put(0x48);
                }
                self.put(0xE8);
                self.out.put_ref_relative(r);
            }
            OperandKind::Label(l) => {
                self.put(0xE8);
                self.out.put_label_relative(*l);
            }
            OperandKind::Reg(_) | OperandKind::Rel(..) => {
                let rm = rm_of(i.dest())?;
                self.rex(Size::INT, 2, &rm);
                self.put(0xFF);
                self.modrm(2, &rm, 0);
            }
            _ => return Err(CodegenError::invalid(format!("bad call target: {i:?}"))),
        }
        Ok(())
    }

    fn dat(&mut self, i: &Inst) -> CodegenResult<()> {
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

    fn fp_arith(&mut self, i: &Inst, opcode: u8) -> CodegenResult<()> {
        let d = i.dest().reg();
        let rm = rm_of(i.src())?;
        let prefix = if width(i.dest().size()) == 4 { 0xF3 } else { 0xF2 };
        self.sse(Some(prefix), opcode, d, &rm, false);
        Ok(())
    }

    fn emit(&mut self, i: &Inst) -> CodegenResult<()> {
        // A pending thread-local marker turns into a segment override on
        // the next instruction that touches memory.
        if self.tls && i.op() != Op::ThreadLocal {
            let mem = matches!(i.dest().kind(), OperandKind::Rel(..))
                || matches!(i.src().kind(), OperandKind::Rel(..));
            if mem {
                self.put(0x64); // fs:
            }
            self.tls = false;
        }

        match i.op() {
            Op::Nop => {
                self.put(0x90);
                Ok(())
            }
            Op::Mov => self.mov(i),
            Op::Lea => {
                let d = i.dest().reg();
                let rm = rm_of(i.src())?;
                if matches!(rm, Rm::Reg(_)) {
                    return Err(CodegenError::invalid("lea needs a memory operand"));
                }
                self.rex(i.dest().size(), hw(d), &rm);
                self.put(0x8D);
                self.modrm(hw(d), &rm, 0);
                Ok(())
            }
            Op::Swap => {
                let size = i.size();
                let r = i.dest().reg();
                let rm = rm_of(i.src())?;
                self.rex(size, hw(r), &rm);
                self.put(if width(size) == 1 { 0x86 } else { 0x87 });
                self.modrm(hw(r), &rm, 0);
                Ok(())
            }
            Op::Push => match i.src().kind() {
                OperandKind::Reg(r) if !regs::fp_register(*r) => {
                    // Always the 64-bit push.
                    if hw(*r) >= 8 {
                        self.put(0x41);
                    }
                    self.put(0x50 + (hw(*r) & 7));
                    Ok(())
                }
                OperandKind::Const(c) => {
                    self.put(0x68);
                    self.out.put_u32(*c as u32);
                    Ok(())
                }
                _ => {
                    let rm = rm_of(i.src())?;
                    self.rex(Size::INT, 6, &rm);
                    self.put(0xFF);
                    self.modrm(6, &rm, 0);
                    Ok(())
                }
            },
            Op::Pop => match i.dest().kind() {
                OperandKind::Reg(r) if !regs::fp_register(*r) => {
                    if hw(*r) >= 8 {
                        self.put(0x41);
                    }
                    self.put(0x58 + (hw(*r) & 7));
                    Ok(())
                }
                _ => {
                    let rm = rm_of(i.dest())?;
                    self.rex(Size::INT, 0, &rm);
                    self.put(0x8F);
                    self.modrm(0, &rm, 0);
                    Ok(())
                }
            },
            Op::PushFlags => {
                self.put(0x9C);
                Ok(())
            }
            Op::PopFlags => {
                self.put(0x9D);
                Ok(())
            }

            Op::Add => self.alu(0x00, 0, i),
            Op::Or => self.alu(0x08, 1, i),
            Op::Adc => self.alu(0x10, 2, i),
            Op::Sbb => self.alu(0x18, 3, i),
            Op::And => self.alu(0x20, 4, i),
            Op::Sub => self.alu(0x28, 5, i),
            Op::Xor => {
                if regs::fp_operand(i.dest()) {
                    // xorps/xorpd; used to flip the sign of a float.
                    let d = i.dest().reg();
                    let rm = rm_of(i.src())?;
                    if width(i.dest().size()) == 8 {
                        self.put(0x66);
                    }
                    self.sse(None, 0x57, d, &rm, false);
                    Ok(())
                } else {
                    self.alu(0x30, 6, i)
                }
            }
            Op::Cmp => self.alu(0x38, 7, i),

            Op::Test => {
                let size = i.size();
                let byte = width(size) == 1;
                match i.src().kind() {
                    OperandKind::Const(_) | OperandKind::DualConst(..) => {
                        let rm = rm_of(i.dest())?;
                        self.rex(size, 0, &rm);
                        self.put(if byte { 0xF6 } else { 0xF7 });
                        self.modrm(0, &rm, if byte { 1 } else { 4 });
                        let v = i.src().const_value(true);
                        if byte {
                            self.put(v as u8);
                        } else {
                            self.out.put_u32(v as u32);
                        }
                    }
                    OperandKind::Reg(s) => {
                        let rm = rm_of(i.dest())?;
                        self.rex(size, hw(*s), &rm);
                        self.put(if byte { 0x84 } else { 0x85 });
                        self.modrm(hw(*s), &rm, 0);
                    }
                    _ => return Err(CodegenError::invalid("unsupported test operands")),
                }
                Ok(())
            }
            Op::Not => {
                let size = i.dest().size();
                let rm = rm_of(i.dest())?;
                self.rex(size, 2, &rm);
                self.put(if width(size) == 1 { 0xF6 } else { 0xF7 });
                self.modrm(2, &rm, 0);
                Ok(())
            }
            Op::Mul => {
                let size = i.dest().size();
                let d = i.dest().reg();
                match i.src().kind() {
                    OperandKind::Const(c) => {
                        let rm = Rm::Reg(d);
                        self.rex(size, hw(d), &rm);
                        self.put(0x69);
                        self.modrm(hw(d), &rm, 4);
                        self.out.put_u32(*c as u32);
                    }
                    _ => {
                        let rm = rm_of(i.src())?;
                        self.rex(size, hw(d), &rm);
                        self.put(0x0F);
                        self.put(0xAF);
                        self.modrm(hw(d), &rm, 0);
                    }
                }
                Ok(())
            }
            Op::IDiv | Op::IMod => self.division(i, true),
            Op::UDiv | Op::UMod => self.division(i, false),

            Op::Shl => self.shift(i, 4),
            Op::Shr => self.shift(i, 5),
            Op::Sar => self.shift(i, 7),

            Op::ICast => self.cast(i, true),
            Op::UCast => self.cast(i, false),

            Op::SetCond => {
                let rm = rm_of(i.dest())?;
                let c = cc(i.src().cond())?;
                self.rex(Size::BYTE, 0, &rm);
                self.put(0x0F);
                self.put(0x90 + c);
                self.modrm(0, &rm, 0);
                Ok(())
            }

            Op::Jmp => self.jump(i),
            Op::Call => self.call(i),
            Op::Ret => {
                self.put(0xC3);
                self.out.cfi_epilog_end();
                Ok(())
            }

            Op::FAdd => self.fp_arith(i, 0x58),
            Op::FMul => self.fp_arith(i, 0x59),
            Op::FSub => self.fp_arith(i, 0x5C),
            Op::FDiv => self.fp_arith(i, 0x5E),
            Op::FCmp => {
                let d = i.dest().reg();
                let rm = rm_of(i.src())?;
                let packed66 = width(i.dest().size()) == 8;
                if packed66 {
                    self.put(0x66);
                }
                self.sse(None, 0x2E, d, &rm, false);
                Ok(())
            }
            Op::FCast => {
                let d_bytes = width(i.dest().size());
                let s_bytes = width(i.src().size());
                if d_bytes == s_bytes {
                    return self.mov(&crate::inst::mov(i.dest().clone(), i.src().clone()));
                }
                let d = i.dest().reg();
                let rm = rm_of(i.src())?;
                let prefix = if s_bytes == 4 { 0xF3 } else { 0xF2 };
                self.sse(Some(prefix), 0x5A, d, &rm, false);
                Ok(())
            }
            Op::FCastI | Op::FCastU => {
                // Truncating convert; the unsigned form was legalized to a
                // range-checked signed one.
                let d = i.dest().reg();
                let rm = rm_of(i.src())?;
                let prefix = if width(i.src().size()) == 4 { 0xF3 } else { 0xF2 };
                self.sse(Some(prefix), 0x2C, d, &rm, width(i.dest().size()) == 8);
                Ok(())
            }
            Op::ICastF | Op::UCastF => {
                let d = i.dest().reg();
                let rm = rm_of(i.src())?;
                let prefix = if width(i.dest().size()) == 4 { 0xF3 } else { 0xF2 };
                self.sse(Some(prefix), 0x2A, d, &rm, width(i.src().size()) == 8);
                Ok(())
            }

            Op::Dat => self.dat(i),
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
                // push rbp; mov rbp, rsp
                self.put(0x55);
                self.out.cfi_push_frame_reg(reg::PTR_FRAME);
                self.put(0x48);
                self.put(0x89);
                self.put(0xE5);
                self.out.cfi_set_frame_reg(reg::PTR_FRAME);
                Ok(())
            }
            Op::Epilog => {
                self.out.cfi_epilog_start();
                self.put(0xC9); // leave
                self.out.cfi_restore_sp();
                Ok(())
            }
            Op::Preserve => {
                // No bytes; informs the unwind builders about the save.
                let off = i.dest().offset().v64();
                self.out.cfi_saved(i.src().reg(), off - 16);
                Ok(())
            }
            Op::Meta => {
                self.out.cfi_prolog_end();
                Ok(())
            }
            Op::Location => Ok(()),
            Op::ThreadLocal => {
                self.tls = true;
                Ok(())
            }

            op => Err(CodegenError::invalid(format!(
                "operation {op:?} should have been lowered before emission"
            ))),
        }
    }
}

/// Emit a fully transformed listing.
pub(super) fn emit_listing(
    src: &Listing,
    out: &mut dyn Output,
    windows: bool,
) -> CodegenResult<()> {
    let mut e = Emitter {
        out,
        windows,
        tls: false,
    };

    for line in 0..src.count() {
        for &l in src.labels_at(line) {
            e.out.mark_label(l);
        }
        let i = src.at(line);
        // A stack-pointer adjustment is a frame allocation as far as the
        // unwind builders are concerned.
        let frame_alloc = i.op() == Op::Sub
            && matches!(i.dest().kind(), OperandKind::Reg(r) if reg::same(*r, reg::PTR_STACK))
            && matches!(
                i.src().kind(),
                OperandKind::Const(_) | OperandKind::DualConst(..)
            );
        e.emit(i)?;
        if frame_alloc {
            let size = i.src().const_value(true) as u32;
            e.out.cfi_frame_alloc(size);
        }
    }
    for &l in src.labels_at(src.count()) {
        e.out.mark_label(l);
    }
    Ok(())
}

fn fits_i32(v: u64) -> bool {
    v as i64 == (v as i64 as i32) as i64
}

#[cfg(test)]
mod tests {
    use super::super::regs;
    use super::*;
    use crate::inst::*;
    use crate::operand::{int_const, ptr_rel, x_rel};
    use crate::output::LabelOutput;
    use crate::reg::{EAX, EBX, PTR_FRAME, RAX, RBX};
    use crate::size::Offset;

    /// Emit one instruction and return its bytes, using a throwaway heap
    /// block large enough for anything a single instruction produces.
    fn bytes_of(i: Inst) -> Vec<u8> {
        let mut l = Listing::new();
        l.push(i);

        let mut sizing = LabelOutput::new(8, l.label_count());
        emit_listing(&l, &mut sizing, false).unwrap();
        let size = sizing.size as usize;

        let alloc = crate::code_mem::HeapCodeAllocator;
        use crate::gc::CodeAllocator;
        let block = alloc.alloc_code(size, (sizing.refs + 4) as usize);
        let mut out = crate::output::CodeOutput::new(8, block, sizing.offsets);
        emit_listing(&l, &mut out, false).unwrap();

        let (block, _, _, _) = out.finish();
        block.bytes()[..size].to_vec()
    }

    #[test]
    fn mov_forms() {
        assert_eq!(bytes_of(mov(EAX, EBX)), [0x89, 0xD8]);
        assert_eq!(bytes_of(mov(RAX, RBX)), [0x48, 0x89, 0xD8]);
        assert_eq!(
            bytes_of(mov(EAX, int_const(7))),
            [0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00]
        );
        // mov eax, [rbp - 8]
        assert_eq!(
            bytes_of(mov(EAX, x_rel(Size::INT, PTR_FRAME, Offset::fixed(-8)))),
            [0x8B, 0x45, 0xF8]
        );
        // mov [rbp - 0x100], rax
        assert_eq!(
            bytes_of(mov(x_rel(Size::LONG, PTR_FRAME, Offset::fixed(-0x100)), RAX)),
            [0x48, 0x89, 0x85, 0x00, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn alu_forms() {
        assert_eq!(bytes_of(add(EAX, EBX)), [0x01, 0xD8]);
        assert_eq!(bytes_of(add(EAX, int_const(1))), [0x83, 0xC0, 0x01]);
        assert_eq!(
            bytes_of(add(EAX, int_const(0x1000))),
            [0x81, 0xC0, 0x00, 0x10, 0x00, 0x00]
        );
        assert_eq!(bytes_of(bxor(EAX, EAX)), [0x31, 0xC0]);
        assert_eq!(bytes_of(cmp(RAX, RBX)), [0x48, 0x39, 0xD8]);
        assert_eq!(bytes_of(sub(regs::R8, RAX)), [0x49, 0x29, 0xC0]);
    }

    #[test]
    fn stack_ops() {
        assert_eq!(bytes_of(push(RAX)), [0x50]);
        assert_eq!(bytes_of(push(regs::R9)), [0x41, 0x51]);
        assert_eq!(bytes_of(pop(RBX)), [0x5B]);
        assert_eq!(bytes_of(ret()), [0xC3]);
    }

    #[test]
    fn rsp_base_needs_sib() {
        use crate::reg::PTR_STACK;
        // mov rax, [rsp + 8]
        assert_eq!(
            bytes_of(mov(RAX, x_rel(Size::LONG, PTR_STACK, Offset::fixed(8)))),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn prolog_epilog_shape() {
        let mut l = Listing::new();
        l.push(prolog());
        l.push(epilog());
        l.push(ret());

        let mut sizing = LabelOutput::new(8, 0);
        emit_listing(&l, &mut sizing, false).unwrap();
        assert_eq!(sizing.size, 4 + 1 + 1);
    }

    #[test]
    fn division_sequences() {
        // idiv: cqo + idiv rbx
        assert_eq!(bytes_of(idiv(RAX, RBX)), [0x48, 0x99, 0x48, 0xF7, 0xFB]);
        // udiv: xor edx, edx + div ebx
        assert_eq!(bytes_of(udiv(EAX, EBX)), [0x31, 0xD2, 0xF7, 0xF3]);
    }

    #[test]
    fn conditional_jumps() {
        use crate::cond::CondFlag;
        let mut l = Listing::new();
        let top = l.label();
        l.mark(top);
        l.push(nop());
        l.push(jmp(top, CondFlag::Equal));

        let mut sizing = LabelOutput::new(8, l.label_count());
        emit_listing(&l, &mut sizing, false).unwrap();

        let alloc = crate::code_mem::HeapCodeAllocator;
        use crate::gc::CodeAllocator;
        let block = alloc.alloc_code(sizing.size as usize, 4);
        let mut out = crate::output::CodeOutput::new(8, block, sizing.offsets);
        emit_listing(&l, &mut out, false).unwrap();
        let (block, ..) = out.finish();

        // nop; je -7 (0x0F 0x84 rel32 back to offset 0)
        assert_eq!(
            block.bytes()[..7],
            [0x90, 0x0F, 0x84, 0xF9, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn win64_ref_call_marker() {
        let src = crate::refs::RefSource::new("target", 0x1000);
        let mut l = Listing::new();
        l.push(call(src.reference()));

        let mut sizing = LabelOutput::new(8, 0);
        emit_listing(&l, &mut sizing, true).unwrap();
        // 48 E8 + rel32.
        assert_eq!(sizing.size, 6);
        assert_eq!(sizing.refs, 1);
    }
}
