//! End-to-end tests: assembled ABC → optimize → re-read output.

mod common;

use abcopt::abc::{read_abc, AbcFile, Op};
use abcopt::analysis::dfs;
use abcopt::error::classify;
use abcopt::types::{MethodId, TypeCache, Value};
use abcopt::{optimize, optimize_method, AbcError, NativeKind, OptimizeOptions, Result};
use common::{Asm, Trait, RETURN_VOID};

fn reread(bytes: &[u8]) -> Result<(TypeCache, AbcFile)> {
    let mut cache = TypeCache::new();
    let file = read_abc(bytes, 0, &mut cache, &OptimizeOptions::default())?;
    Ok((cache, file))
}

/// Non-synthetic opcodes of each live block of `m`, in reverse postorder.
fn blocks(cache: &mut TypeCache, m: MethodId) -> Vec<Vec<Op>> {
    let body = cache.method_mut(m).body.as_mut().expect("method has a body");
    let g = &mut body.graph;
    dfs(g)
        .iter()
        .map(|&b| {
            g.block(b)
                .exprs
                .iter()
                .map(|&e| g.expr(e).op)
                .filter(|op| !op.is_synthetic())
                .collect()
        })
        .collect()
}

fn script_init(cache: &TypeCache, file: &AbcFile) -> MethodId {
    cache.ty(file.scripts[0]).init.expect("script has an initializer")
}

#[test]
fn version_header_is_checked() -> Result<()> {
    let bytes = Asm::new().finish();
    let out = optimize(&bytes, &[], &OptimizeOptions::default())?;
    assert_eq!(&out.abc[..4], &[16, 0, 46, 0]);

    let mut bad = bytes.clone();
    bad[0] = 17;
    let err = optimize(&bad, &[], &OptimizeOptions::default()).unwrap_err();
    assert!(matches!(classify(&err), Some(AbcError::Format(_))));
    Ok(())
}

/// `if (3 < 5) return 1; else return 2;`
const CONSTANT_BRANCH: &[u8] = &[
    0x24, 3, // pushbyte 3
    0x24, 5, // pushbyte 5
    0x15, 3, 0, 0, // iflt +3
    0x24, 2, // pushbyte 2
    0x48, // returnvalue
    0x24, 1, // pushbyte 1
    0x48, // returnvalue
];

fn constant_branch_program() -> Vec<u8> {
    let mut asm = Asm::new();
    let init = asm.function(0, 2, CONSTANT_BRANCH);
    asm.script(init, Vec::new());
    asm.finish()
}

#[test]
fn constant_branch_folds_to_one_return() -> Result<()> {
    let out = optimize(&constant_branch_program(), &[], &OptimizeOptions::default())?;
    assert!(out.abc.len() < constant_branch_program().len());

    let (mut cache, file) = reread(&out.abc)?;
    let init = script_init(&cache, &file);
    assert_eq!(blocks(&mut cache, init), vec![vec![Op::PushByte, Op::ReturnValue]]);

    let body = cache.method(init).body.as_ref().expect("body");
    let push = body
        .graph
        .exprs
        .iter()
        .find(|x| x.op == Op::PushByte)
        .expect("pushbyte");
    assert_eq!(push.value, Some(Value::Int(1)));
    Ok(())
}

#[test]
fn optimizing_twice_changes_nothing() -> Result<()> {
    let options = OptimizeOptions::default();
    let once = optimize(&constant_branch_program(), &[], &options)?;
    let twice = optimize(&once.abc, &[], &options)?;
    assert_eq!(once.abc, twice.abc);
    Ok(())
}

/// `function f(x) { return x ? 1 : 2; }`, a join of two stack values.
const SELECT: &[u8] = &[
    0xD1, // getlocal1
    0x12, 6, 0, 0, // iffalse +6
    0x24, 1, // pushbyte 1
    0x10, 2, 0, 0, // jump +2
    0x24, 2, // pushbyte 2
    0x48, // returnvalue
];

fn select_program() -> Vec<u8> {
    let mut asm = Asm::new();
    let f = asm.function(1, 1, SELECT);
    let init = asm.function(0, 0, RETURN_VOID);
    let name = asm.name("f");
    asm.script(init, vec![Trait::Method(name, f)]);
    asm.finish()
}

fn script_method(cache: &TypeCache, file: &AbcFile) -> MethodId {
    cache
        .ty(file.scripts[0])
        .defs
        .iter()
        .find_map(|b| b.method)
        .expect("f is bound on the script")
}

/// The join only returns, so each arm returns its own constant.
fn check_select(out: &[u8]) -> Result<()> {
    let (mut cache, file) = reread(out)?;
    let f = script_method(&cache, &file);
    let blocks = blocks(&mut cache, f);
    assert_eq!(blocks.len(), 3);
    assert!(blocks[0].len() == 1 && blocks[0][0].is_if());
    assert_eq!(blocks[1], vec![Op::PushByte, Op::ReturnValue]);
    assert_eq!(blocks[2], vec![Op::PushByte, Op::ReturnValue]);
    Ok(())
}

#[test]
fn select_returns_from_each_arm() -> Result<()> {
    let out = optimize(&select_program(), &[], &OptimizeOptions::default())?;
    check_select(&out.abc)
}

#[test]
fn select_returns_from_each_arm_under_the_legacy_verifier() -> Result<()> {
    let options = OptimizeOptions {
        legacy_verifier: true,
        ..OptimizeOptions::default()
    };
    let out = optimize(&select_program(), &[], &options)?;
    check_select(&out.abc)
}

/// `function f(a, b, c) { var v = a; if (c) v = b; return v + 1; }`.
/// The join feeds an add, so it cannot be folded into the arms.
const JOIN_ADD: &[u8] = &[
    0xD1, // getlocal1
    0xD3, // getlocal3
    0x12, 2, 0, 0, // iffalse +2
    0x29, // pop
    0xD2, // getlocal2
    0x24, 1, // pushbyte 1
    0xA0, // add
    0x48, // returnvalue
];

#[test]
fn join_in_another_register_gets_one_copy() -> Result<()> {
    let mut asm = Asm::new();
    let f = asm.function(3, 2, JOIN_ADD);
    let init = asm.function(0, 0, RETURN_VOID);
    let name = asm.name("f");
    asm.script(init, vec![Trait::Method(name, f)]);
    let bytes = asm.finish();

    let options = OptimizeOptions::default();
    let mut cache = TypeCache::new();
    let file = read_abc(&bytes, 0, &mut cache, &options)?;
    let f = script_method(&cache, &file);
    let mut ready = Vec::new();
    optimize_method(&mut cache, f, &file.merged, &options, &mut ready)?;

    let body = cache.method(f).body.as_ref().expect("body");
    let g = &body.graph;
    let mut stores = Vec::new();
    for &b in &body.code {
        for &e in &g.block(b).exprs {
            assert!(!g.expr(e).op.is_synthetic(), "{} survived", g.expr(e));
            if g.expr(e).op == Op::SetLocal {
                stores.push((b, e));
            }
        }
    }
    assert_eq!(stores.len(), 1);
    let (b, set) = stores[0];
    assert_ne!(b, g.entry_block());
    assert_eq!(g.succ(b).len(), 1);
    let get = g.expr(set).args[0];
    assert_eq!(g.expr(get).op, Op::GetLocal);
    assert_ne!(g.expr(get).imm, g.expr(set).imm);

    let ops: Vec<Op> = body
        .code
        .iter()
        .flat_map(|&b| g.block(b).exprs.iter().map(|&e| g.expr(e).op))
        .collect();
    assert_eq!(ops.iter().filter(|&&op| op == Op::Add).count(), 1);
    assert_eq!(ops.iter().filter(|&&op| op == Op::ReturnValue).count(), 1);
    Ok(())
}

/// `class B extends A` declared and bound before `A`.
fn derived_first_program() -> Vec<u8> {
    let mut asm = Asm::new();
    let (a, b) = (asm.name("A"), asm.name("B"));
    let mut init = || asm.function(0, 0, RETURN_VOID);
    let (b_iinit, b_cinit, a_iinit, a_cinit, script) = (init(), init(), init(), init(), init());
    let cb = asm.class(b, a, b_iinit, b_cinit);
    let ca = asm.class(a, 0, a_iinit, a_cinit);
    asm.script(script, vec![Trait::Class(b, cb), Trait::Class(a, ca)]);
    asm.finish()
}

#[test]
fn base_class_is_emitted_first() -> Result<()> {
    let out = optimize(&derived_first_program(), &[], &OptimizeOptions::default())?;
    let (cache, file) = reread(&out.abc)?;
    let order: Vec<String> = file
        .classes
        .iter()
        .filter_map(|&c| cache.ty(c).itype)
        .map(|it| cache.type_name(it).local_name().to_string())
        .collect();
    assert_eq!(order, vec!["A", "B"]);

    let b = cache.ty(file.classes[1]).itype.expect("instance type");
    let a = cache.ty(file.classes[0]).itype.expect("instance type");
    assert!(cache.extends_or_is(b, a));
    Ok(())
}

fn native_program() -> Vec<u8> {
    let mut asm = Asm::new();
    let native = asm.method(0, abcopt::abc::constants::METHOD_NATIVE);
    let init = asm.function(0, 0, RETURN_VOID);
    let name = asm.name("frameRate");
    asm.script(init, vec![Trait::Getter(name, native)]);
    asm.finish()
}

#[test]
fn natives_are_reported_by_emitted_index() -> Result<()> {
    let out = optimize(&native_program(), &[], &OptimizeOptions::default())?;
    assert_eq!(out.natives.len(), 1);
    let n = &out.natives[0];
    assert_eq!(n.label, "frame_rate_get");
    // one method with a body precedes the native pool
    assert_eq!(n.id, 1);
    assert_eq!(n.signature, vec![NativeKind::Atom, NativeKind::Object]);

    let options = OptimizeOptions {
        obscure_natives: true,
        ..OptimizeOptions::default()
    };
    assert!(optimize(&native_program(), &[], &options)?.natives.is_empty());
    Ok(())
}
