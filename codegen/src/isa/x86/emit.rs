//! Machine-code emission for 32-bit x86.
//!
//! The integer subset mirrors the x64 encodings without REX prefixes;
//! floating point goes through the x87 stack, with the operands always in
//! memory by the time they reach here.

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

fn width(size: Size) -> u32 {
    size.size32()
}

enum Rm {
    Reg(Reg),
    Mem { base: Reg, disp: i32 },
    Abs { label: Label, disp: i32 },
}

fn rm_of(op: &Operand) -> CodegenResult<Rm> {
    match op.kind() {
        OperandKind::Reg(r) => Ok(Rm::Reg(*r)),
        OperandKind::Rel(base, off) => Ok(Rm::Mem {
            base: *base,
            disp: off.v32(),
        }),
        OperandKind::LabelRel(l, off) => Ok(Rm::Abs {
            label: *l,
            disp: off.v32(),
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
    tls: bool,
}

impl<'a> Emitter<'a> {
    fn put(&mut self, b: u8) {
        self.out.put_u8(b);
    }

    /// ModRM (+ SIB + displacement). On 32-bit, absolute addresses of
    /// label-relative operands use the disp32-only form; the bytes are
    /// patched by the collector when the block moves.
    fn modrm(&mut self, reg_field: u8, rm: &Rm) {
        let reg = (reg_field & 7) << 3;
        match rm {
            Rm::Reg(r) => self.put(0xC0 | reg | (hw(*r) & 7)),
            Rm::Mem { base, disp } => {
                let base_hw = hw(*base) & 7;
                let disp = *disp;
                let need_disp = disp != 0 || base_hw == 5;
                let mode = if !need_disp {
                    0x00
                } else if i8::try_from(disp).is_ok() {
                    0x40
                } else {
                    0x80
                };
                self.put(mode | reg | base_hw);
                if base_hw == 4 {
                    self.put(0x24);
                }
                if mode == 0x40 {
                    self.put(disp as u8);
                } else if mode == 0x80 {
                    self.out.put_u32(disp as u32);
                }
            }
            Rm::Abs { label, disp } => {
                // mod 00, r/m 101: a plain 32-bit address.
                self.put(reg | 0x05);
                let target = self.out.code_base() as u32
                    + self.out.label_offset(*label)
                    + *disp as u32;
                self.out
                    .put_gc(crate::gc::RelocKind::Inside, 4, target as usize);
            }
        }
    }

    fn alu(&mut self, base: u8, ext: u8, i: &Inst) -> CodegenResult<()> {
        let size = i.size();
        let byte = width(size) == 1;

        match (i.dest().kind(), i.src().kind()) {
            (_, OperandKind::Const(_)) | (_, OperandKind::DualConst(..)) => {
                let rm = rm_of(i.dest())?;
                let value = i.src().const_value(false);
                let small = !byte && i8::try_from(value as u32 as i32).is_ok();
                if byte {
                    self.put(0x80);
                } else if small {
                    self.put(0x83);
                } else {
                    self.put(0x81);
                }
                self.modrm(ext, &rm);
                if byte || small {
                    self.put(value as u8);
                } else {
                    self.out.put_u32(value as u32);
                }
            }
            (OperandKind::Reg(d), _) => match i.src().kind() {
                OperandKind::Reg(_) => {
                    let rm = Rm::Reg(*d);
                    let s = i.src().reg();
                    self.put(if byte { base } else { base + 1 });
                    self.modrm(hw(s), &rm);
                }
                _ => {
                    let rm = rm_of(i.src())?;
                    self.put(if byte { base + 2 } else { base + 3 });
                    self.modrm(hw(*d), &rm);
                }
            },
            (_, OperandKind::Reg(s)) => {
                let rm = rm_of(i.dest())?;
                self.put(if byte { base } else { base + 1 });
                self.modrm(hw(*s), &rm);
            }
            _ => {
                return Err(CodegenError::invalid(format!(
                    "unsupported ALU operand combination: {i:?}"
                )))
            }
        }
        Ok(())
    }

    fn mov(&mut self, i: &Inst) -> CodegenResult<()> {
        let size = i.size();
        let byte = width(size) == 1;
        let dst = i.dest();
        let src = i.src();

        match (dst.kind(), src.kind()) {
            (OperandKind::Reg(d), OperandKind::Reg(_)) => {
                let rm = Rm::Reg(*d);
                let s = src.reg();
                self.put(if byte { 0x88 } else { 0x89 });
                self.modrm(hw(s), &rm);
            }
            (OperandKind::Reg(d), OperandKind::Rel(..))
            | (OperandKind::Reg(d), OperandKind::LabelRel(..)) => {
                let rm = rm_of(src)?;
                self.put(if byte { 0x8A } else { 0x8B });
                self.modrm(hw(*d), &rm);
            }
            (_, OperandKind::Reg(s)) => {
                let rm = rm_of(dst)?;
                self.put(if byte { 0x88 } else { 0x89 });
                self.modrm(hw(*s), &rm);
            }
            (OperandKind::Reg(d), OperandKind::Ref(r)) => {
                self.put(0xB8 + (hw(*d) & 7));
                self.out.put_ref_address(r);
            }
            (OperandKind::Reg(d), OperandKind::Obj(p)) => {
                self.put(0xB8 + (hw(*d) & 7));
                self.out.put_obj_ptr(*p);
            }
            (_, OperandKind::Const(_)) | (_, OperandKind::DualConst(..)) => {
                let rm = rm_of(dst)?;
                let value = src.const_value(false);
                self.put(if byte { 0xC6 } else { 0xC7 });
                self.modrm(0, &rm);
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

        if width(size) == 1 {
            if signed {
                self.put(0x66);
                self.put(0x98); // cbw
            } else {
                self.put(0x0F); // movzx eax, al
                self.put(0xB6);
                self.put(0xC0);
            }
            self.put(0xF6);
        } else {
            if signed {
                self.put(0x99); // cdq
            } else {
                self.put(0x31); // xor edx, edx
                self.put(0xD2);
            }
            self.put(0xF7);
        }
        self.modrm(if signed { 7 } else { 6 }, &rm);
        Ok(())
    }

    fn shift(&mut self, i: &Inst, ext: u8) -> CodegenResult<()> {
        let byte = width(i.dest().size()) == 1;
        let rm = rm_of(i.dest())?;
        match i.src().kind() {
            OperandKind::Reg(r) if reg::same(*r, reg::ECX) => {
                self.put(if byte { 0xD2 } else { 0xD3 });
                self.modrm(ext, &rm);
            }
            OperandKind::Const(c) => {
                self.put(if byte { 0xC0 } else { 0xC1 });
                self.modrm(ext, &rm);
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
            let narrow_src = i.src().resized(i.dest().size());
            return self.mov(&crate::inst::mov(i.dest().clone(), narrow_src));
        }

        let rm = rm_of(i.src())?;
        match (signed, s_bytes) {
            (true, 1) => {
                self.put(0x0F);
                self.put(0xBE);
            }
            (false, 1) => {
                self.put(0x0F);
                self.put(0xB6);
            }
            _ => return Err(CodegenError::invalid("unsupported cast widths")),
        }
        self.modrm(hw(d), &rm);
        Ok(())
    }

    /// x87: load the destination, run the operation against the source in
    /// memory, store back.
    fn x87_arith(&mut self, i: &Inst, ext: u8) -> CodegenResult<()> {
        self.x87_load(i.dest())?;
        let rm = rm_of(i.src())?;
        self.put(if width(i.src().size()) == 4 { 0xD8 } else { 0xDC });
        self.modrm(ext, &rm);
        self.x87_store(i.dest())
    }

    fn x87_load(&mut self, op: &Operand) -> CodegenResult<()> {
        let rm = rm_of(op)?;
        self.put(if width(op.size()) == 4 { 0xD9 } else { 0xDD });
        self.modrm(0, &rm);
        Ok(())
    }

    fn x87_store(&mut self, op: &Operand) -> CodegenResult<()> {
        let rm = rm_of(op)?;
        self.put(if width(op.size()) == 4 { 0xD9 } else { 0xDD });
        self.modrm(3, &rm);
        Ok(())
    }

    fn emit(&mut self, i: &Inst) -> CodegenResult<()> {
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
                self.put(0x8D);
                self.modrm(hw(d), &rm);
                Ok(())
            }
            Op::Swap => {
                let r = i.dest().reg();
                let rm = rm_of(i.src())?;
                self.put(if width(i.size()) == 1 { 0x86 } else { 0x87 });
                self.modrm(hw(r), &rm);
                Ok(())
            }
            Op::Push => match i.src().kind() {
                OperandKind::Reg(r) => {
                    self.put(0x50 + (hw(*r) & 7));
                    Ok(())
                }
                OperandKind::Const(c) => {
                    self.put(0x68);
                    self.out.put_u32(*c as u32);
                    Ok(())
                }
                OperandKind::DualConst(v32, _) => {
                    self.put(0x68);
                    self.out.put_u32(*v32 as u32);
                    Ok(())
                }
                _ => {
                    let rm = rm_of(i.src())?;
                    self.put(0xFF);
                    self.modrm(6, &rm);
                    Ok(())
                }
            },
            Op::Pop => match i.dest().kind() {
                OperandKind::Reg(r) => {
                    self.put(0x58 + (hw(*r) & 7));
                    Ok(())
                }
                _ => {
                    let rm = rm_of(i.dest())?;
                    self.put(0x8F);
                    self.modrm(0, &rm);
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
            Op::Xor => self.alu(0x30, 6, i),
            Op::Cmp => self.alu(0x38, 7, i),

            Op::Test => {
                let byte = width(i.size()) == 1;
                match i.src().kind() {
                    OperandKind::Const(_) | OperandKind::DualConst(..) => {
                        let rm = rm_of(i.dest())?;
                        self.put(if byte { 0xF6 } else { 0xF7 });
                        self.modrm(0, &rm);
                        let v = i.src().const_value(false);
                        if byte {
                            self.put(v as u8);
                        } else {
                            self.out.put_u32(v as u32);
                        }
                    }
                    OperandKind::Reg(s) => {
                        let rm = rm_of(i.dest())?;
                        self.put(if byte { 0x84 } else { 0x85 });
                        self.modrm(hw(*s), &rm);
                    }
                    _ => return Err(CodegenError::invalid("unsupported test operands")),
                }
                Ok(())
            }
            Op::Not => {
                let rm = rm_of(i.dest())?;
                self.put(if width(i.dest().size()) == 1 { 0xF6 } else { 0xF7 });
                self.modrm(2, &rm);
                Ok(())
            }
            Op::Mul => {
                let d = i.dest().reg();
                match i.src().kind() {
                    OperandKind::Const(c) => {
                        let rm = Rm::Reg(d);
                        self.put(0x69);
                        self.modrm(hw(d), &rm);
                        self.out.put_u32(*c as u32);
                    }
                    _ => {
                        let rm = rm_of(i.src())?;
                        self.put(0x0F);
                        self.put(0xAF);
                        self.modrm(hw(d), &rm);
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
                self.put(0x0F);
                self.put(0x90 + c);
                self.modrm(0, &rm);
                Ok(())
            }

            Op::Jmp => {
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
                        self.put(0xE9);
                        self.out.put_ref_relative(r);
                    }
                    OperandKind::Reg(_) | OperandKind::Rel(..) => {
                        let rm = rm_of(i.dest())?;
                        self.put(0xFF);
                        self.modrm(4, &rm);
                    }
                    _ => return Err(CodegenError::invalid(format!("bad jump target: {i:?}"))),
                }
                Ok(())
            }
            Op::Call => {
                match i.dest().kind() {
                    OperandKind::Ref(r) => {
                        self.put(0xE8);
                        self.out.put_ref_relative(r);
                    }
                    OperandKind::Label(l) => {
                        self.put(0xE8);
                        self.out.put_label_relative(*l);
                    }
                    OperandKind::Reg(_) | OperandKind::Rel(..) => {
                        let rm = rm_of(i.dest())?;
                        self.put(0xFF);
                        self.modrm(2, &rm);
                    }
                    _ => return Err(CodegenError::invalid(format!("bad call target: {i:?}"))),
                }
                Ok(())
            }
            Op::Ret => {
                self.put(0xC3);
                self.out.cfi_epilog_end();
                Ok(())
            }

            // x87 floating point.
            Op::FAdd => self.x87_arith(i, 0),
            Op::FMul => self.x87_arith(i, 1),
            Op::FSub => self.x87_arith(i, 4),
            Op::FDiv => self.x87_arith(i, 6),
            Op::FCmp => {
                // fld dest; fcomp src; fnstsw ax; sahf — the flags then
                // read like an unsigned compare.
                self.x87_load(i.dest())?;
                let rm = rm_of(i.src())?;
                self.put(if width(i.src().size()) == 4 { 0xD8 } else { 0xDC });
                self.modrm(3, &rm);
                self.put(0xDF);
                self.put(0xE0);
                self.put(0x9E);
                Ok(())
            }
            Op::FNeg => {
                self.x87_load(i.src())?;
                self.put(0xD9);
                self.put(0xE0); // fchs
                self.x87_store(i.dest())
            }
            Op::FCast => {
                // The width change happens in the load/store pair.
                self.x87_load(i.src())?;
                self.x87_store(i.dest())
            }
            Op::FCastI => {
                self.x87_load(i.src())?;
                let rm = rm_of(i.dest())?;
                // fisttp
                self.put(if width(i.dest().size()) == 4 { 0xDB } else { 0xDD });
                self.modrm(1, &rm);
                Ok(())
            }
            Op::ICastF => {
                let rm = rm_of(i.src())?;
                if width(i.src().size()) == 4 {
                    self.put(0xDB); // fild m32
                    self.modrm(0, &rm);
                } else {
                    self.put(0xDF); // fild m64
                    self.modrm(5, &rm);
                }
                self.x87_store(i.dest())
            }
            Op::FLd => self.x87_load(i.src()),
            Op::FStp => self.x87_store(i.dest()),

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
                let align = i.src().const_value(false) as u32;
                self.out.align_to(align.max(1));
                Ok(())
            }

            Op::Prolog => {
                self.put(0x55); // push ebp
                self.out.cfi_push_frame_reg(reg::PTR_FRAME);
                self.put(0x89); // mov ebp, esp
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
                let off = i.dest().offset().v32();
                self.out.cfi_saved(i.src().reg(), off - 8);
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

/// Emit a fully transformed listing. `sub esp, imm` inside the prolog
/// reports a frame allocation to the unwind collector.
pub(super) fn emit_listing(src: &Listing, out: &mut dyn Output) -> CodegenResult<()> {
    let mut e = Emitter { out, tls: false };

    for line in 0..src.count() {
        for &l in src.labels_at(line) {
            e.out.mark_label(l);
        }
        let i = src.at(line);
        let frame_alloc = i.op() == Op::Sub
            && matches!(i.dest().kind(), OperandKind::Reg(r) if reg::same(*r, reg::PTR_STACK))
            && matches!(
                i.src().kind(),
                OperandKind::Const(_) | OperandKind::DualConst(..)
            );
        e.emit(i)?;
        if frame_alloc {
            let size = i.src().const_value(false) as u32;
            e.out.cfi_frame_alloc(size);
        }
    }
    for &l in src.labels_at(src.count()) {
        e.out.mark_label(l);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::*;
    use crate::operand::{int_const, x_rel};
    use crate::output::LabelOutput;
    use crate::reg::{EAX, EBX, PTR_FRAME};
    use crate::size::Offset;

    fn bytes_of(i: Inst) -> Vec<u8> {
        let mut l = Listing::new();
        l.push(i);

        let mut sizing = LabelOutput::new(4, l.label_count());
        emit_listing(&l, &mut sizing).unwrap();
        let size = sizing.size as usize;

        use crate::gc::CodeAllocator;
        let block = crate::code_mem::HeapCodeAllocator.alloc_code(size, (sizing.refs + 4) as usize);
        let mut out = crate::output::CodeOutput::new(4, block, sizing.offsets);
        emit_listing(&l, &mut out).unwrap();
        let (block, ..) = out.finish();
        block.bytes()[..size].to_vec()
    }

    #[test]
    fn integer_forms() {
        assert_eq!(bytes_of(mov(EAX, EBX)), [0x89, 0xD8]);
        assert_eq!(bytes_of(add(EAX, int_const(1))), [0x83, 0xC0, 0x01]);
        assert_eq!(bytes_of(push(EAX)), [0x50]);
        assert_eq!(bytes_of(ret()), [0xC3]);
        // mov eax, [ebp + 8]
        assert_eq!(
            bytes_of(mov(EAX, x_rel(Size::INT, PTR_FRAME, Offset::fixed(8)))),
            [0x8B, 0x45, 0x08]
        );
    }

    #[test]
    fn x87_add() {
        // fadd dest(double var at [ebp-8]) += src([ebp-16])
        let d = x_rel(Size::DOUBLE, PTR_FRAME, Offset::fixed(-8));
        let s = x_rel(Size::DOUBLE, PTR_FRAME, Offset::fixed(-16));
        // fld qword [ebp-8]; fadd qword [ebp-16]; fstp qword [ebp-8]
        assert_eq!(
            bytes_of(fadd(d, s)),
            [0xDD, 0x45, 0xF8, 0xDC, 0x45, 0xF0, 0xDD, 0x5D, 0xF8]
        );
    }

    #[test]
    fn division_protocol() {
        assert_eq!(bytes_of(idiv(EAX, EBX)), [0x99, 0xF7, 0xFB]);
        assert_eq!(bytes_of(udiv(EAX, EBX)), [0x31, 0xD2, 0xF7, 0xF3]);
    }
}
