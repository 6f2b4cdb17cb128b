//! Shared graph rewrites used by several passes.

use crate::abc::Op;
use crate::error::AbcError;
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph};
use crate::types::{Name, TypeCache, Typeref};
use anyhow::Result;
use std::collections::HashMap;
use tracing::trace;

// ── Edges ────────────────────────────────────────────────────────────────────

/// Reverse the sense of a conditional branch and swap its successors.
/// Control flow is unchanged.
pub fn invert(g: &mut IrGraph, br: ExprId) -> Result<()> {
    let op = g.expr(br).op;
    let inv = op
        .inverted()
        .ok_or_else(|| AbcError::internal(format!("cannot invert {}", op)))?;
    let (e0, e1) = match g.expr(br).succ.as_slice() {
        &[e0, e1] => (e0, e1),
        _ => return Err(AbcError::internal(format!("{} is not a two-way branch", br))),
    };
    trace!(%br, from = %op, to = %inv, "invert");
    g.edge_mut(e0).label = 1;
    g.edge_mut(e1).label = 0;
    let x = g.expr_mut(br);
    x.op = inv;
    x.succ = vec![e1, e0];
    Ok(())
}

/// Retarget `after` to the block `before` leads to; every phi there gains
/// an input for `after` equal to the one arriving over `before`.
pub fn copy_target(g: &mut IrGraph, before: EdgeId, after: EdgeId) -> Result<()> {
    copy_target_with(g, before, after, |a| a)
}

/// Like [`copy_target`], but a phi input equal to `phi` is replaced by `a`.
pub fn copy_target_phi(
    g: &mut IrGraph,
    phi: ExprId,
    a: ExprId,
    before: EdgeId,
    after: EdgeId,
) -> Result<()> {
    copy_target_with(g, before, after, |x| if x == phi { a } else { x })
}

fn copy_target_with(
    g: &mut IrGraph,
    before: EdgeId,
    after: EdgeId,
    map: impl Fn(ExprId) -> ExprId,
) -> Result<()> {
    let to = g.edge(before).to;
    g.edge_mut(after).to = to;
    for p in g.phis(to) {
        let i = g
            .phi_arg_index(p, before)
            .ok_or_else(|| AbcError::internal(format!("{} has no input for {}", p, before)))?;
        let input = map(g.expr(p).args[i]);
        let x = g.expr_mut(p);
        x.args.push(input);
        x.pred.push(after);
    }
    Ok(())
}

/// Both blocks are covered by the same handlers.
pub fn same_ex_scope(g: &IrGraph, b1: BlockId, b2: BlockId) -> bool {
    if b1 == b2 {
        return true;
    }
    let (xs1, xs2) = (&g.block(b1).xsucc, &g.block(b2).xsucc);
    xs1.len() == xs2.len()
        && xs1.iter().zip(xs2).all(|(&e1, &e2)| {
            let (e1, e2) = (g.edge(e1), g.edge(e2));
            e1.to == e2.to && e1.handler == e2.handler
        })
}

/// An edge whose source has several successors and whose target has
/// several predecessors.
pub fn is_critical(g: &IrGraph, e: EdgeId, pred: &HashMap<BlockId, Vec<EdgeId>>) -> bool {
    let edge = g.edge(e);
    let from_fans_out = edge.from.is_some_and(|f| g.succ(f).len() > 1);
    from_fans_out && pred.get(&edge.to).map_or(0, Vec::len) > 1
}

/// Insert an empty block (a lone `jump`) on `e`. Afterwards `e` ends in the
/// new block; the returned edge leaves it for the old target.
pub fn split(
    g: &mut IrGraph,
    e: EdgeId,
    pred: &mut HashMap<BlockId, Vec<EdgeId>>,
) -> Result<EdgeId> {
    if g.edge(e).is_exception() {
        return Err(AbcError::internal(format!("cannot split exception edge {}", e)));
    }
    let to = g.edge(e).to;
    let d = g.new_block();
    let j = g.push(d, Op::Jump);
    let e2 = g.new_edge(Some(d), 0, to);
    g.expr_mut(j).succ = vec![e2];
    g.edge_mut(e).to = d;
    trace!(edge = %e, block = %d, "split");

    pred.insert(d, vec![e]);
    if let Some(p) = pred.get_mut(&to) {
        p.retain(|&x| x != e);
        p.push(e2);
    }
    replace_pred(g, to, e, e2);
    Ok(e2)
}

/// Rename phi predecessor `before` to `after` in block `b`.
pub fn replace_pred(g: &mut IrGraph, b: BlockId, before: EdgeId, after: EdgeId) {
    for p in g.phis(b) {
        for slot in g.expr_mut(p).pred.iter_mut() {
            if *slot == before {
                *slot = after;
            }
        }
    }
}

/// Insert `e` into `b` just before its terminator, or at the end if the
/// block has none.
pub fn insert_before_terminator(g: &mut IrGraph, b: BlockId, e: ExprId) {
    let at = match g.last(b) {
        Some(last) if g.expr(last).is_terminator() => g.block(b).exprs.len() - 1,
        _ => g.block(b).exprs.len(),
    };
    g.block_mut(b).exprs.insert(at, e);
}

// ── Expressions ──────────────────────────────────────────────────────────────

pub fn make_nop(g: &mut IrGraph, e: ExprId) {
    let x = g.expr_mut(e);
    x.op = Op::Nop;
    x.args.clear();
    x.locals.clear();
    x.scopes.clear();
    x.set_pure();
}

/// The object pushed by the `i`th captured scope of `e`. Phis on the scope
/// chain all merge the same object, so the first input is followed; the
/// scope reference in `e` is updated to the `pushscope` found.
pub fn unwrap_scope(g: &mut IrGraph, e: ExprId, i: usize) -> Result<ExprId> {
    let mut s = *g
        .expr(e)
        .scopes
        .get(i)
        .ok_or_else(|| AbcError::internal(format!("{} has no scope {}", e, i)))?;
    let mut steps = 0;
    while g.expr(s).op == Op::Phi {
        s = *g
            .expr(s)
            .args
            .first()
            .ok_or_else(|| AbcError::internal(format!("scope phi {} has no inputs", s)))?;
        steps += 1;
        if steps > g.exprs.len() {
            return Err(AbcError::internal(format!("scope phi cycle at {}", e)));
        }
    }
    if !g.expr(s).op.on_scope() {
        return Err(AbcError::internal(format!("{} is not a scope push", s)));
    }
    g.expr_mut(e).scopes[i] = s;
    g.expr(s)
        .args
        .first()
        .copied()
        .ok_or_else(|| AbcError::internal(format!("{} pushes nothing", s)))
}

// ── Scope lookup ─────────────────────────────────────────────────────────────

/// Innermost scope of `scopes` whose type binds `name`.
pub fn find_inner(
    cache: &TypeCache,
    name: &Name,
    scopes: &[ExprId],
    types: &HashMap<ExprId, Typeref>,
) -> Option<usize> {
    (0..scopes.len()).rev().find(|&i| {
        types
            .get(&scopes[i])
            .is_some_and(|t| cache.find(t.t, name).is_some())
    })
}

/// Outer (captured) scope binding `name`: the innermost of
/// `scopes[1..]`, then the global scope `scopes[0]` unless some script
/// defines `name`, in which case the caller should look it up globally.
pub fn find_outer(cache: &TypeCache, name: &Name, scopes: &[Typeref]) -> Option<usize> {
    if let Some(i) = (1..scopes.len())
        .rev()
        .find(|&i| cache.find(scopes[i].t, name).is_some())
    {
        return Some(i);
    }
    if cache.global(name).is_some() {
        return None;
    }
    match scopes.first() {
        Some(s) if cache.find(s.t, name).is_some() => Some(0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminate(g: &mut IrGraph, from: BlockId, op: Op, to: &[BlockId]) -> ExprId {
        let e = g.push(from, op);
        let mut succ = Vec::new();
        for (i, &t) in to.iter().enumerate() {
            succ.push(g.new_edge(Some(from), i as u32, t));
        }
        g.expr_mut(e).succ = succ;
        e
    }

    #[test]
    fn invert_swaps_edges_and_labels() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let (x, y) = (g.new_block(), g.new_block());
        let br = terminate(&mut g, b, Op::IfLt, &[x, y]);
        let before = g.expr(br).succ.clone();
        invert(&mut g, br).unwrap();
        let e = g.expr(br);
        assert_eq!(e.op, Op::IfNlt);
        assert_eq!(e.succ, vec![before[1], before[0]]);
        assert_eq!(g.edge(e.succ[0]).to, y);
        assert_eq!(g.edge(e.succ[0]).label, 0);
        assert_eq!(g.edge(e.succ[1]).label, 1);
    }

    #[test]
    fn split_moves_phi_predecessor_to_new_edge() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (a, join) = (g.new_block(), g.new_block());
        let k = g.push(entry, Op::PushTrue);
        let br = terminate(&mut g, entry, Op::IfTrue, &[a, join]);
        g.expr_mut(br).args = vec![k];
        terminate(&mut g, a, Op::Jump, &[join]);
        let phi = g.push(join, Op::Phi);
        let (taken, from_a) = (g.expr(br).succ[1], g.succ(a)[0]);
        g.expr_mut(phi).args = vec![k, k];
        g.expr_mut(phi).pred = vec![taken, from_a];
        g.push(join, Op::ReturnVoid);

        let mut pred = crate::analysis::preds(&g, &[entry, a, join]);
        assert!(is_critical(&g, taken, &pred));
        let e2 = split(&mut g, taken, &mut pred).unwrap();
        let d = g.edge(taken).to;
        assert_eq!(g.edge(e2).from, Some(d));
        assert_eq!(g.edge(e2).to, join);
        assert_eq!(g.expr(phi).pred, vec![e2, from_a]);
        assert!(!is_critical(&g, e2, &pred));
    }

    #[test]
    fn copy_target_extends_phis() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (j, join) = (g.new_block(), g.new_block());
        let k = g.push(entry, Op::PushTrue);
        terminate(&mut g, entry, Op::Jump, &[j]);
        terminate(&mut g, j, Op::Jump, &[join]);
        let phi = g.push(join, Op::Phi);
        let into_join = g.succ(j)[0];
        g.expr_mut(phi).args = vec![k];
        g.expr_mut(phi).pred = vec![into_join];

        let first = g.succ(entry)[0];
        copy_target(&mut g, into_join, first).unwrap();
        assert_eq!(g.edge(first).to, join);
        assert_eq!(g.expr(phi).pred, vec![into_join, first]);
        assert_eq!(g.expr(phi).args, vec![k, k]);
    }

    #[test]
    fn outer_lookup_prefers_inner_captured_scopes() {
        use crate::abc::constants::TRAIT_SLOT;
        use crate::types::{Binding, Type};
        let mut cache = TypeCache::new();
        let name = Name::public("x");
        let mut t = Type::new(Name::public("Holder"));
        let any = cache.tref(cache.builtins.any);
        t.defs.push(Binding::new(name.clone(), TRAIT_SLOT, 0, any));
        let holder = cache.add_type(t);
        let object = cache.tref(cache.builtins.object);
        let scopes = [object, cache.tref(holder), object];
        assert_eq!(find_outer(&cache, &name, &scopes), Some(1));
        assert_eq!(find_outer(&cache, &name, &scopes[..1]), None);
        assert_eq!(find_outer(&cache, &name, &[cache.tref(holder)]), Some(0));
    }
}
