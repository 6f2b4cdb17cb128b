//! Sparse conditional constant propagation.
//!
//! ## Algorithm
//!
//! 1. **Analyze.** Two worklists, one of control edges and one of
//!    expressions. Reaching an edge for the first time queues every
//!    expression of its target block (and, on the block's first visit,
//!    its exception edges). Evaluating an expression records a constant
//!    and a type for it; when either changes its users are queued, and a
//!    terminator queues the successor edges it can take. A phi meets only
//!    the inputs whose predecessor edge has been reached.
//! 2. **Rewrite control.** Phi inputs arriving over unreached edges are
//!    dropped, branches with one reachable successor become jumps, a
//!    `lookupswitch` on a phi of known cases is threaded past, and pure
//!    operators with constant results become push instructions.
//! 3. DCE, then the type-directed [`peephole`](super::peephole) rewrites,
//!    then DCE again.

use super::dce;
use super::infer::{Env, Facts, Mode, Outcome};
use super::lattice::Lattice;
use super::peephole;
use super::utils::copy_target_phi;
use crate::abc::Op;
use crate::analysis::{dfs_from, find_uses};
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph, MethodBody};
use crate::types::{AbcId, MethodId, TypeCache, Typeref, Value};
use anyhow::Result;
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{debug, trace};

/// The method being optimized and the files it may bind early into.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub method: MethodId,
    pub merged: &'a [AbcId],
}

/// Run SCCP and the peephole rewrites on `body`. Methods and types that
/// become reachable (closures, classes) are queued onto `ready`.
pub fn run(
    body: &mut MethodBody,
    cache: &mut TypeCache,
    target: Target<'_>,
    ready: &mut Vec<MethodId>,
) -> Result<()> {
    let outer: Option<Vec<Typeref>> = cache
        .method(target.method)
        .cx
        .and_then(|c| cache.ty(c).scopes.clone());

    let (facts, reached) = {
        let env = Env {
            cache,
            method: target.method,
            handlers: &body.handlers,
            activation: body.activation,
            outer: outer.as_deref(),
            mode: Mode::Sccp,
        };
        analyze(&env, &body.graph)
    };
    debug!(
        method = cache.method(target.method).debug_name.as_str(),
        reached = reached.len(),
        typed = facts.types.len(),
        "sccp"
    );

    rewrite_control(&mut body.graph, cache, &facts, &reached)?;
    dce::eliminate(body)?;
    peephole::rewrite(body, cache, target, outer.as_deref(), &facts, ready)?;
    dce::eliminate(body)
}

// ── Analysis ─────────────────────────────────────────────────────────────────

fn analyze(env: &Env<'_>, g: &IrGraph) -> (Facts, HashSet<EdgeId>) {
    let code = dfs_from(g, g.entry_block());
    let uses = find_uses(g, &code);
    let mut facts = Facts::default();
    let mut reached: HashSet<EdgeId> = HashSet::new();
    let mut live: HashSet<BlockId> = HashSet::new();
    let mut visible: HashSet<ExprId> = HashSet::new();
    let mut flow: VecDeque<EdgeId> = VecDeque::from([g.entry]);
    let mut ssa: BTreeSet<ExprId> = BTreeSet::new();

    loop {
        while let Some(edge) = flow.pop_front() {
            if !reached.insert(edge) {
                continue;
            }
            let b = g.edge(edge).to;
            let exprs = &g.block(b).exprs;
            visible.extend(exprs.iter().copied());
            ssa.extend(exprs.iter().copied());
            if live.insert(b) {
                flow.extend(g.block(b).xsucc.iter().copied());
            }
        }
        let e = match ssa.pop_first() {
            Some(e) => e,
            None => break,
        };
        if !visible.contains(&e) {
            continue;
        }

        let (v, t) = if g.expr(e).op == Op::Phi {
            match phi_meet(env, g, e, &facts, &reached) {
                Some(vt) => vt,
                None => continue,
            }
        } else {
            match env.eval(g, e, &facts) {
                Outcome::Value(v, t) => (v, t),
                Outcome::Flow(edges) => {
                    flow.extend(edges);
                    continue;
                }
                Outcome::Unknown | Outcome::Nothing => continue,
            }
        };

        let mut changed = false;
        if facts.values.get(&e) != Some(&v) {
            facts.values.insert(e, v);
            changed = true;
        }
        if facts.types.get(&e) != Some(&t) {
            facts.types.insert(e, t);
            changed = true;
        }
        if changed {
            ssa.extend(uses.get(&e).into_iter().flatten().copied());
        }
    }
    (facts, reached)
}

/// Meet of the known inputs arriving over reached edges; `None` while
/// none is known.
fn phi_meet(
    env: &Env<'_>,
    g: &IrGraph,
    e: ExprId,
    facts: &Facts,
    reached: &HashSet<EdgeId>,
) -> Option<(Lattice, Typeref)> {
    let x = g.expr(e);
    let mut acc: Option<(Lattice, Typeref)> = None;
    for (&a, p) in x.args.iter().zip(&x.pred) {
        if !reached.contains(p) {
            continue;
        }
        let av = match facts.values.get(&a) {
            Some(v) => v,
            None => continue,
        };
        let at = facts
            .types
            .get(&a)
            .copied()
            .unwrap_or_else(|| env.cache.tref(env.cache.builtins.any));
        acc = Some(match acc {
            None => (av.clone(), at),
            Some((v, t)) => (v.meet(av), env.cache.mdb(t, at)),
        });
    }
    acc.map(|(v, t)| (env.pin(v, t), t))
}

// ── Control rewrites ─────────────────────────────────────────────────────────

fn rewrite_control(
    g: &mut IrGraph,
    cache: &TypeCache,
    facts: &Facts,
    reached: &HashSet<EdgeId>,
) -> Result<()> {
    let blocks: BTreeSet<BlockId> = reached.iter().map(|&e| g.edge(e).to).collect();
    let primitive = |e: &ExprId| {
        facts
            .types
            .get(e)
            .is_some_and(|t| cache.is_primitive(t.t))
    };

    for b in blocks {
        for e in g.block(b).exprs.clone() {
            let op = g.expr(e).op;
            if op == Op::Phi {
                for j in (0..g.expr(e).pred.len()).rev() {
                    if !reached.contains(&g.expr(e).pred[j]) {
                        g.expr_mut(e).remove_phi_input(j);
                    }
                }
            } else if !g.expr(e).succ.is_empty() {
                if g.expr(e).succ.len() > 1
                    && !jumpify(g, e, reached)
                    && op == Op::LookupSwitch
                    && !g.block(b).must_isolate
                {
                    thread_switch(g, b, e, facts)?;
                }
            } else if op.is_oper() && op.on_stack() {
                let x = g.expr(e);
                if x.args.iter().all(primitive) && x.locals.iter().all(primitive) {
                    g.expr_mut(e).set_pure();
                }
                if let Some(v) = facts.values.get(&e) {
                    constify(g, e, v);
                }
            }
        }
    }
    Ok(())
}

/// Turn a multi-way terminator with exactly one reached successor into a
/// jump.
fn jumpify(g: &mut IrGraph, e: ExprId, reached: &HashSet<EdgeId>) -> bool {
    let mut taken: Option<EdgeId> = None;
    for &s in &g.expr(e).succ {
        if reached.contains(&s) {
            match taken {
                None => taken = Some(s),
                Some(t) if t != s => return false,
                Some(_) => {}
            }
        }
    }
    let taken = match taken {
        Some(t) => t,
        None => return false,
    };
    trace!(expr = %e, edge = %taken, "jumpify");
    g.edge_mut(taken).label = 0;
    let x = g.expr_mut(e);
    x.op = Op::Jump;
    x.args.clear();
    x.succ = vec![taken];
    true
}

/// A block that is exactly `[phi, lookupswitch(phi)]`: every predecessor
/// supplying a known integer goes straight to the case it selects.
fn thread_switch(g: &mut IrGraph, b: BlockId, sw: ExprId, facts: &Facts) -> Result<()> {
    let phi = match g.block(b).exprs.as_slice() {
        &[phi, last] if last == sw && g.expr(phi).op == Op::Phi => phi,
        _ => return Ok(()),
    };
    if g.expr(sw).args.first() != Some(&phi) {
        return Ok(());
    }
    let cases = g.expr(sw).succ.len() - 1;
    for i in (0..g.expr(phi).args.len()).rev() {
        let (a, into) = (g.expr(phi).args[i], g.expr(phi).pred[i]);
        let edge = g.edge(into);
        if edge.is_exception() || edge.from.is_none() {
            continue;
        }
        let d = match facts.values.get(&a).and_then(Lattice::number) {
            Some(d) if d.is_finite() && d.fract() == 0.0 => d,
            _ => continue,
        };
        let j = if d >= 0.0 && d < cases as f64 {
            d as usize
        } else {
            cases
        };
        let out = g.expr(sw).succ[j];
        trace!(block = %b, edge = %into, case = j, "thread switch");
        copy_target_phi(g, phi, a, out, into)?;
        g.expr_mut(phi).remove_phi_input(i);
    }
    Ok(())
}

/// Replace a pure expression by a push of its constant value.
pub fn constify(g: &mut IrGraph, e: ExprId, v: &Lattice) -> bool {
    let v = match v {
        Lattice::Const(v) => v.clone(),
        Lattice::Bottom => return false,
    };
    let x = g.expr(e);
    if x.value.is_some() || x.has_side_effect() {
        return false;
    }
    let op = match &v {
        Value::Int(i) if i8::try_from(*i).is_ok() => Op::PushByte,
        Value::Int(i) if i16::try_from(*i).is_ok() => Op::PushShort,
        Value::Int(_) => Op::PushInt,
        Value::Uint(_) => Op::PushUint,
        Value::Double(d) if d.is_nan() => Op::PushNan,
        Value::Double(_) => Op::PushDouble,
        Value::Bool(true) => Op::PushTrue,
        Value::Bool(false) => Op::PushFalse,
        Value::Namespace(_) => Op::PushNamespace,
        Value::Undefined => Op::PushUndefined,
        Value::Null if x.op.on_scope() => return false,
        Value::Null => Op::PushNull,
        Value::String(_) => Op::PushString,
    };
    trace!(expr = %e, from = %x.op, to = %op, "constify");
    let x = g.expr_mut(e);
    x.op = op;
    x.pred.clear();
    x.args.clear();
    x.scopes.clear();
    x.locals.clear();
    x.imm.clear();
    x.name = None;
    x.method = None;
    x.class = None;
    x.value = Some(v);
    true
}
