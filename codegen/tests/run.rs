//! Execution tests: compile listings for the host and call them.
//!
//! Only built on x86-64 unix hosts; the code region comes from the
//! mmap-backed allocator and is published before the call.

#![cfg(all(target_arch = "x86_64", unix))]

use lathe_codegen::code_mem::MmapCodeAllocator;
use lathe_codegen::inst::*;
use lathe_codegen::isa::lookup;
use lathe_codegen::listing::Listing;
use lathe_codegen::operand::int_const;
use lathe_codegen::reg::{EAX, EBX};
use lathe_codegen::ty::int_desc;
use lathe_codegen::Binary;
use target_lexicon::Triple;

fn compile(l: &Listing) -> Binary {
    let isa = lookup(Triple::host()).unwrap();
    Binary::compile(&*isa, &MmapCodeAllocator, l).unwrap()
}

/// A parameter plus two, routed through a callee-saved register so the
/// prolog and epilog actually save and restore something.
#[test]
fn add_two() {
    let mut l = Listing::with_result(int_desc(), false);
    let p = l.create_param(&int_desc());

    l.push(prolog());
    l.push(mov(EBX, p));
    l.push(add(EBX, int_const(2)));
    l.push(mov(EAX, EBX));
    l.push(fn_ret(EAX));

    let bin = compile(&l);
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(bin.entry()) };

    assert_eq!(f(10), 12);
    assert_eq!(f(-3), -1);
}

/// Nine integer arguments: six arrive in registers, three on the stack.
/// The place-value sum proves every argument landed in its slot.
#[test]
fn nine_arguments() {
    let mut l = Listing::with_result(int_desc(), false);
    let params: Vec<_> = (0..9).map(|_| l.create_param(&int_desc())).collect();

    l.push(prolog());
    l.push(mov(EAX, int_const(0)));
    for p in &params {
        l.push(mul(EAX, int_const(10)));
        l.push(add(EAX, *p));
    }
    l.push(fn_ret(EAX));

    let bin = compile(&l);
    let f: extern "C" fn(i32, i32, i32, i32, i32, i32, i32, i32, i32) -> i32 =
        unsafe { std::mem::transmute(bin.entry()) };

    assert_eq!(f(1, 2, 3, 4, 5, 6, 7, 8, 9), 123456789);
}

/// Loops through a backward branch: sum the integers up to the argument.
#[test]
fn loop_with_back_edge() {
    use lathe_codegen::cond::CondFlag;

    let mut l = Listing::with_result(int_desc(), false);
    let p = l.create_param(&int_desc());

    let top = l.label();
    l.push(prolog());
    l.push(mov(EAX, int_const(0)));
    l.push(mov(EBX, p));
    l.mark(top);
    l.push(add(EAX, EBX));
    l.push(sub(EBX, int_const(1)));
    l.push(cmp(EBX, int_const(0)));
    l.push(jmp(top, CondFlag::Greater));
    l.push(fn_ret(EAX));

    let bin = compile(&l);
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(bin.entry()) };

    assert_eq!(f(5), 15);
    assert_eq!(f(100), 5050);
}

/// Signed division and remainder through the rax:rdx protocol.
#[test]
fn division_and_remainder() {
    let mut l = Listing::with_result(int_desc(), false);
    let a = l.create_param(&int_desc());
    let b = l.create_param(&int_desc());

    // (a / b) * 1000 + a % b
    l.push(prolog());
    l.push(mov(EAX, a));
    l.push(idiv(EAX, b));
    l.push(mul(EAX, int_const(1000)));
    l.push(mov(EBX, a));
    l.push(imod(EBX, b));
    l.push(add(EAX, EBX));
    l.push(fn_ret(EAX));

    let bin = compile(&l);
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(bin.entry()) };

    assert_eq!(f(47, 10), 4007);
    assert_eq!(f(9, 4), 2001);
}
