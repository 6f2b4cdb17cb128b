//! Upcasts at phi inputs so the bytecode verifier accepts every join.
//!
//! ## Algorithm
//!
//! 1. Compute the type the verifier will assign to every value: a
//!    worklist over the live expressions, re-queuing users on change.
//!    Phis take the most derived common base of their known inputs, and
//!    a phi with an input over a loop edge drops to the type's natural
//!    nullability so the verifier never has to iterate.
//! 2. For every phi input whose verifier type differs from the phi's in a
//!    way the verifier cannot merge (any difference on a loop edge, a
//!    change of atom-ness elsewhere), split the edge if it is critical and
//!    append a `coerce_a`, `coerce_o` or `coerce` to its source block.
//!
//! The computed types are returned for the legacy verifier pass.

use super::infer::{Env, Facts, Mode, Outcome};
use super::utils::{insert_before_terminator, is_critical, split};
use crate::abc::Op;
use crate::analysis::{dfs, find_uses, idoms, is_loop, preds};
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph, MethodBody};
use crate::types::{MethodId, TypeCache, TypeId, Typeref};
use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Verifier view of every live value.
pub type VerifierTypes = HashMap<ExprId, Typeref>;

/// Insert the upcasts `body` needs and return the verifier types.
pub fn insert_casts(
    body: &mut MethodBody,
    cache: &TypeCache,
    method: MethodId,
    outer: Option<&[Typeref]>,
) -> Result<VerifierTypes> {
    let code = dfs(&mut body.graph);
    let mut pred = preds(&body.graph, &code);
    let doms = idoms(&body.graph, &code)?;
    let mut loop_edges: HashMap<EdgeId, bool> = HashMap::new();
    for &b in &code {
        for e in body.graph.all_succ(b) {
            loop_edges.insert(e, is_loop(&body.graph, &doms, e));
        }
    }

    let mut types = {
        let env = Env {
            cache,
            method,
            handlers: &body.handlers,
            activation: body.activation,
            outer,
            mode: Mode::Verify,
        };
        verify_types(&env, &body.graph, &code, &loop_edges)
    };

    let g = &mut body.graph;
    let any = cache.tref(cache.builtins.any);
    let mut inserted = 0;
    for &b in &code {
        for phi in g.phis(b) {
            let etype = types.get(&phi).copied().unwrap_or(any);
            for i in (0..g.expr(phi).args.len()).rev() {
                let a = g.expr(phi).args[i];
                let mut p = g.expr(phi).pred[i];
                if g.expr(a).op.on_scope() {
                    continue;
                }
                let atype = types.get(&a).copied().unwrap_or(any);
                let on_loop = loop_edges.get(&p).copied().unwrap_or(false);
                let needed = if on_loop {
                    etype != atype
                } else {
                    cache.is_atom(etype.t) != cache.is_atom(atype.t)
                };
                if !needed || (etype.t == atype.t && etype.nullable) {
                    continue;
                }

                if is_critical(g, p, &pred) {
                    let e2 = split(g, p, &mut pred)?;
                    loop_edges.insert(e2, on_loop);
                    p = g.expr(phi).pred[i];
                }
                let from = match g.edge(p).from {
                    Some(f) => f,
                    None => continue,
                };
                let cast = upcast(g, cache, a, etype.t);
                insert_before_terminator(g, from, cast);
                g.expr_mut(phi).args[i] = cast;
                types.insert(cast, etype);
                inserted += 1;
            }
        }
    }
    if inserted > 0 {
        debug!(casts = inserted, "insert casts");
    }
    Ok(types)
}

/// Cast expression converting `a` to `t`.
fn upcast(g: &mut IrGraph, cache: &TypeCache, a: ExprId, t: TypeId) -> ExprId {
    let b = cache.builtins;
    let op = if t == b.any {
        Op::CoerceA
    } else if t == b.object {
        Op::CoerceO
    } else {
        Op::Coerce
    };
    let e = g.new_expr(op);
    let x = g.expr_mut(e);
    x.args = vec![a];
    if op == Op::Coerce {
        x.name = Some(cache.type_name(t).clone());
    }
    e
}

fn verify_types(
    env: &Env<'_>,
    g: &IrGraph,
    code: &[BlockId],
    loop_edges: &HashMap<EdgeId, bool>,
) -> VerifierTypes {
    let uses = find_uses(g, code);
    let any = env.cache.tref(env.cache.builtins.any);
    let mut facts = Facts::default();
    let mut work: BTreeSet<ExprId> = code
        .iter()
        .flat_map(|&b| g.block(b).exprs.iter().copied())
        .collect();

    while let Some(e) = work.pop_first() {
        let x = g.expr(e);
        let op = x.op;
        if !(op.on_stack() || op.in_local() || op.on_scope() || op == Op::Phi) {
            continue;
        }
        let t = if op == Op::Phi {
            let mut merged: Option<Typeref> = None;
            let mut on_loop = false;
            for i in (0..x.args.len()).rev() {
                on_loop |= loop_edges.get(&x.pred[i]).copied().unwrap_or(false);
                if let Some(&at) = facts.types.get(&x.args[i]) {
                    merged = Some(match merged {
                        None => at,
                        Some(t) if t == at => t,
                        Some(t) => env.cache.mdb(t, at),
                    });
                }
            }
            let t = merged.unwrap_or(any);
            if on_loop {
                env.cache.tref(t.t)
            } else {
                t
            }
        } else {
            match env.eval(g, e, &facts) {
                Outcome::Value(_, t) => t,
                Outcome::Unknown => any,
                Outcome::Nothing | Outcome::Flow(_) => continue,
            }
        };
        if facts.types.get(&e) != Some(&t) {
            facts.types.insert(e, t);
            work.extend(uses.get(&e).into_iter().flatten().copied());
        }
    }
    facts.types
}
