//! Transform-pipeline tests: classification sums, destruction order,
//! call lowering, the division check, and the exception table, checked on
//! the lowered listings and emitted blobs without running any code.

use lathe_codegen::abi::Params;
use lathe_codegen::code_mem::HeapCodeAllocator;
use lathe_codegen::inst::*;
use lathe_codegen::isa::{lookup, TargetIsa};
use lathe_codegen::listing::{FreeOpt, Listing};
use lathe_codegen::op::Op;
use lathe_codegen::operand::{int_const, OperandKind};
use lathe_codegen::refs::RefSource;
use lathe_codegen::reg::EAX;
use lathe_codegen::ty::{int_desc, long_desc, ptr_desc, TypeDesc};
use lathe_codegen::Binary;
use std::rc::Rc;
use target_lexicon::Triple;

fn linux_x64() -> Box<dyn TargetIsa> {
    lookup("x86_64-unknown-linux-gnu".parse::<Triple>().unwrap()).unwrap()
}

fn win_x64() -> Box<dyn TargetIsa> {
    lookup("x86_64-pc-windows-msvc".parse::<Triple>().unwrap()).unwrap()
}

fn aarch64() -> Box<dyn TargetIsa> {
    lookup("aarch64-unknown-linux-gnu".parse::<Triple>().unwrap()).unwrap()
}

fn x86() -> Box<dyn TargetIsa> {
    lookup("i686-unknown-linux-gnu".parse::<Triple>().unwrap()).unwrap()
}

/// Every parameter must land in exactly one slot, and the sizes must add
/// up: registers plus stack equals the padded parameter sizes.
#[test]
fn classification_covers_every_parameter() {
    let types: Vec<Rc<TypeDesc>> = vec![
        int_desc(),
        long_desc(),
        ptr_desc(),
        lathe_codegen::ty::double_desc(),
        int_desc(),
        int_desc(),
        long_desc(),
        int_desc(),
        int_desc(),
    ];

    for isa in [linux_x64(), win_x64(), aarch64(), x86()] {
        let mut params = isa.new_params(false);
        for (i, ty) in types.iter().enumerate() {
            params.add(i as u16, ty);
        }

        let mut seen = vec![0u32; types.len()];
        for n in 0..params.total_count() {
            if let Some(p) = params.total_param(n) {
                if p.id() != lathe_codegen::abi::RETURN_ID {
                    seen[p.id() as usize] += 1;
                }
            }
        }
        for (i, count) in seen.iter().enumerate() {
            assert_eq!(
                *count, 1,
                "parameter {i} appears {count} times on {}",
                isa.name()
            );
        }
    }
}

fn dtor_source(name: &str) -> RefSource {
    RefSource::new(name, 0x1000)
}

/// Collect the names of call targets in a transformed listing, in order.
fn call_targets(l: &Listing) -> Vec<String> {
    l.insts()
        .iter()
        .filter(|i| i.op() == Op::Call)
        .filter_map(|i| match i.dest().kind() {
            OperandKind::Ref(r) => Some(r.name().to_string()),
            _ => None,
        })
        .collect()
}

/// Variables are destroyed in reverse declaration order; inactive ones
/// are skipped.
#[test]
fn destruction_order_is_reverse_declaration() {
    let isa = linux_x64();

    let da = dtor_source("dtorA");
    let db = dtor_source("dtorB");
    let dc = dtor_source("dtorC");

    let mut l = Listing::new();
    let root = l.root();
    let _a = l.create_var_free(
        root,
        lathe_codegen::Size::PTR,
        da.reference().into(),
        FreeOpt::ON_BLOCK_EXIT | FreeOpt::PTR,
    );
    let _b = l.create_var_free(
        root,
        lathe_codegen::Size::PTR,
        db.reference().into(),
        FreeOpt::ON_BLOCK_EXIT | FreeOpt::PTR,
    );
    // Declared inactive and never activated: its destructor must not run.
    let _c = l.create_var_free(
        root,
        lathe_codegen::Size::PTR,
        dc.reference().into(),
        FreeOpt::ON_BLOCK_EXIT | FreeOpt::PTR | FreeOpt::INACTIVE,
    );

    l.push(prolog());
    l.push(epilog());
    l.push(ret());

    let t = isa.transform(&l).unwrap();

    let calls = call_targets(&t);
    assert_eq!(calls, vec!["dtorB".to_string(), "dtorA".to_string()]);
}

/// Lowering a `fn_call` with a complex parameter builds the copy in a
/// fresh block: copy constructor, the call itself, then the destructor
/// from the block exit (System V leaves destruction to the caller).
#[test]
fn complex_parameter_call_shape() {
    let isa = linux_x64();

    let ctor = RefSource::new("copyCtor", 0x2000);
    let dtor = dtor_source("dtor");
    let target = RefSource::new("target", 0x3000);

    let complex: Rc<TypeDesc> = Rc::new(TypeDesc::Complex {
        size: lathe_codegen::Size::PTR * 2,
        ctor: ctor.reference(),
        dtor: dtor.reference(),
    });

    let mut l = Listing::with_result(int_desc(), false);
    let root = l.root();
    let v = l.create_typed_var(root, &complex, FreeOpt::NONE);
    l.push(prolog());
    l.push(fn_param(complex.clone(), v));
    l.push(fn_param(int_desc(), int_const(7)));
    l.push(fn_call(target.reference(), false, int_desc(), EAX));
    l.push(fn_ret(EAX));

    let t = isa.transform(&l).unwrap();
    let calls = call_targets(&t);

    let ctor_at = calls.iter().position(|c| c == "copyCtor").unwrap();
    let call_at = calls.iter().position(|c| c == "target").unwrap();
    let dtor_at = calls.iter().position(|c| c == "dtor").unwrap();
    assert!(ctor_at < call_at, "copy constructed before the call");
    assert!(call_at < dtor_at, "destroyed after the call");
}

/// On Win64 the callee destroys its parameters: no destructor call
/// appears at the call site.
#[test]
fn win64_callee_destroys_parameters() {
    let isa = win_x64();

    let ctor = RefSource::new("copyCtor", 0x2000);
    let dtor = dtor_source("dtor");
    let target = RefSource::new("target", 0x3000);

    let complex: Rc<TypeDesc> = Rc::new(TypeDesc::Complex {
        size: lathe_codegen::Size::PTR * 2,
        ctor: ctor.reference(),
        dtor: dtor.reference(),
    });

    let mut l = Listing::with_result(int_desc(), false);
    let v = l.create_typed_var(l.root(), &complex, FreeOpt::NONE);
    l.push(prolog());
    l.push(fn_param(complex.clone(), v));
    l.push(fn_call(target.reference(), false, int_desc(), EAX));
    l.push(fn_ret(EAX));

    let t = isa.transform(&l).unwrap();
    let calls = call_targets(&t);

    assert!(calls.contains(&"copyCtor".to_string()));
    assert!(calls.contains(&"target".to_string()));
    assert!(
        !calls.contains(&"dtor".to_string()),
        "the callee destroys its parameters on this convention"
    );
}

/// Integer division grows an explicit zero check that reaches the
/// runtime's division-by-zero entry, instead of trapping the CPU.
#[test]
fn division_grows_a_zero_check() {
    for isa in [linux_x64(), aarch64(), x86()] {
        let mut l = Listing::with_result(int_desc(), false);
        let p = l.create_param(&int_desc());
        l.push(prolog());
        l.push(mov(EAX, p));
        l.push(idiv(EAX, int_const(0)));
        l.push(fn_ret(EAX));

        let t = isa.transform(&l).unwrap();

        let calls = call_targets(&t);
        assert!(
            calls.iter().any(|c| c == "divZero"),
            "missing the division-by-zero target on {}",
            isa.name()
        );
        let has_check = t.insts().iter().any(|i| {
            i.op() == Op::Cmp
                && matches!(i.src().kind(), OperandKind::Const(0))
        });
        assert!(has_check, "missing the zero compare on {}", isa.name());
    }
}

/// The PCs in the active-block table are strictly increasing, and the
/// packed state is recoverable for any PC in the function.
#[test]
fn active_block_table_is_monotonic() {
    let isa = linux_x64();

    let dtor = dtor_source("dtor");
    let mut l = Listing::with_result(int_desc(), false);
    let root = l.root();
    let inner = l.create_block(root);
    let _guard = l.create_var_free(
        inner,
        lathe_codegen::Size::PTR,
        dtor.reference().into(),
        FreeOpt::BOTH | FreeOpt::PTR,
    );

    l.push(prolog());
    l.push(begin_block(inner));
    l.push(mov(EAX, int_const(1)));
    l.push(end_block(inner));
    l.push(fn_ret(EAX));

    let bin = Binary::compile(&*isa, &HeapCodeAllocator, &l).unwrap();

    // Parse the trailing table: pointer-sized count, rows of
    // (offset, state) before it.
    let bytes = bin.code().bytes();
    let end = bin.len() as usize;
    let count = u64::from_le_bytes(bytes[end - 8..end].try_into().unwrap()) as usize;
    assert!(count >= 2, "expected begin and end rows, got {count}");

    let table = end - 8 - count * 8;
    let mut last_pc = None;
    for i in 0..count {
        let at = table + i * 8;
        let pc = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        if let Some(prev) = last_pc {
            assert!(pc > prev, "table PCs must be strictly increasing");
        }
        last_pc = Some(pc);
    }

    // Inside the block, the state names the inner block.
    let (block, _activation) = bin.fn_state_at(last_pc.unwrap() - 1).unwrap();
    assert_eq!(block, inner.key());
}

/// Lowering twice changes nothing: the output of the pipeline is made of
/// forms the pipeline accepts unchanged.
#[test]
fn transformed_listing_emits_identically() {
    let isa = linux_x64();

    let mut l = Listing::with_result(int_desc(), false);
    let p = l.create_param(&int_desc());
    l.push(prolog());
    l.push(mov(EAX, p));
    l.push(add(EAX, int_const(2)));
    l.push(fn_ret(EAX));

    let a = Binary::compile(&*isa, &HeapCodeAllocator, &l).unwrap();
    let b = Binary::compile(&*isa, &HeapCodeAllocator, &l).unwrap();
    assert_eq!(a.len(), b.len());
    assert_eq!(
        &a.code().bytes()[..a.len() as usize],
        &b.code().bytes()[..b.len() as usize]
    );
}

/// A Win64 function whose floating-point traffic forces the legalizer
/// onto the callee-saved vector registers (xmm6 and up): it must
/// compile, and the unwind blob must describe the vector saves with the
/// xmm-save code rather than fail.
#[test]
fn win64_preserves_vector_registers() {
    let isa = win_x64();

    let double = lathe_codegen::ty::double_desc;
    let mut l = Listing::with_result(double(), false);
    let a = l.create_param(&double());
    let b = l.create_param(&double());
    let root = l.root();
    let acc = l.create_var(root, lathe_codegen::Size::DOUBLE);
    let wide = l.create_var(root, lathe_codegen::Size::LONG);

    l.push(prolog());
    // Memory-to-memory vector arithmetic: every line materializes its
    // destination in a scratch vector register, and the scratch pool is
    // handed out from the callee-saved end.
    l.push(fadd(acc, a));
    l.push(fmul(acc, b));
    l.push(fdiv(acc, a));
    // The unsigned conversions hold several vector scratches at once.
    l.push(fcastu(wide, acc));
    l.push(ucastf(acc, wide));
    l.push(fn_ret(acc));

    let bin = Binary::compile(&*isa, &HeapCodeAllocator, &l).unwrap();

    // Find the unwind blob through the RUNTIME_FUNCTION record and walk
    // its codes: at least one save must use the xmm form (operation 8).
    let rf = match bin.unwind() {
        lathe_codegen::binary::UnwindData::RuntimeFunction(at) => *at as usize,
        _ => panic!("expected Win64 unwind data"),
    };
    let bytes = bin.code().bytes();
    let unwind_at = u32::from_le_bytes(bytes[rf + 8..rf + 12].try_into().unwrap()) as usize;

    let count = bytes[unwind_at + 2] as usize;
    assert!(count > 0, "expected unwind codes");
    let codes = &bytes[unwind_at + 4..unwind_at + 4 + count * 2];

    let mut node = 0;
    let mut found_xmm_save = false;
    while node < count {
        let op = codes[node * 2 + 1];
        let (operation, info) = (op & 0xF, op >> 4);
        found_xmm_save |= operation == 8;
        node += match operation {
            1 => {
                if info == 0 {
                    2
                } else {
                    3
                }
            }
            4 | 8 => 2,
            5 | 9 => 3,
            _ => 1,
        };
    }
    assert!(found_xmm_save, "no xmm-save unwind code emitted");
}

/// The redirect stub: saves the argument registers, resolves, restores,
/// and tail-jumps.
#[test]
fn redirect_stub_shape() {
    let isa = linux_x64();
    let resolve = RefSource::new("resolve", 0x4000);

    let l = isa
        .redirect(
            false,
            &int_desc(),
            &[int_desc(), int_desc()],
            resolve.reference(),
            lathe_codegen::Operand::none(),
        )
        .unwrap();

    let t = isa.transform(&l).unwrap();
    assert!(call_targets(&t).contains(&"resolve".to_string()));
    // The stub ends with an indirect jump (before the appended tables).
    let last_jmp = t
        .insts()
        .iter()
        .rev()
        .find(|i| i.op() == Op::Jmp)
        .expect("redirect ends in a jump");
    assert!(matches!(last_jmp.dest().kind(), OperandKind::Reg(_)));
}
