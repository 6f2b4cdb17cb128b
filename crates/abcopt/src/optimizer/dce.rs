//! Dead code elimination.
//!
//! ## Algorithm
//!
//! 1. Copy propagation over the live blocks:
//!    - drop phi inputs whose predecessor edge comes from a dead block;
//!    - a phi whose inputs are all itself or one other value `v` is
//!      replaced by `v` at every use;
//!    - every use of a copy marker is replaced by the copied value.
//!    Changes travel along def → use edges from a worklist until it is
//!    empty. Phis of isolated blocks are not seeded.
//! 2. Mark every expression reachable through operand edges from a
//!    side-effecting root, using an explicit stack.
//! 3. Remove everything unmarked.

use crate::abc::Op;
use crate::analysis::{dfs, find_uses, Uses};
use crate::error::AbcError;
use crate::ir::{BlockId, ExprId, IrGraph, MethodBody};
use anyhow::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::trace;

/// Run copy propagation, then drop every expression no effect depends on.
pub fn eliminate(body: &mut MethodBody) -> Result<()> {
    let g = &mut body.graph;
    let code = dfs(g);
    copy_propagate(g, &code)?;

    let marked = mark(g, &code);
    let mut removed = 0;
    for &b in &code {
        let before = g.block(b).exprs.len();
        g.block_mut(b).exprs.retain(|e| marked.contains(e));
        removed += before - g.block(b).exprs.len();
    }
    if removed > 0 {
        trace!(removed, "dce");
    }
    Ok(())
}

// ── Copy propagation ─────────────────────────────────────────────────────────

fn copy_propagate(g: &mut IrGraph, code: &[BlockId]) -> Result<()> {
    let live: HashSet<BlockId> = code.iter().copied().collect();
    let mut uses = find_uses(g, code);
    let mut map: HashMap<ExprId, ExprId> = HashMap::new();
    let mut work: BTreeSet<ExprId> = BTreeSet::new();

    for &b in code {
        let isolated = g.block(b).must_isolate;
        for &e in &g.block(b).exprs {
            match g.expr(e).op {
                Op::Dup => {
                    work.insert(e);
                }
                Op::Phi if !isolated => {
                    work.insert(e);
                }
                _ => {}
            }
        }
    }

    while let Some(e) = work.pop_first() {
        rename(g, e, &map, &mut uses);
        match g.expr(e).op {
            Op::Dup => {
                let a = g.expr(e).locals[0];
                map.insert(e, a);
                work.extend(uses.get(&e).into_iter().flatten().copied());
            }
            Op::Phi => {
                let x = g.expr(e);
                if x.args.len() != x.pred.len() {
                    return Err(AbcError::internal(format!(
                        "{} has {} inputs for {} predecessors",
                        e,
                        x.args.len(),
                        x.pred.len()
                    )));
                }
                for j in (0..x.pred.len()).rev() {
                    let from = g.edge(g.expr(e).pred[j]).from;
                    if !from.is_some_and(|f| live.contains(&f)) {
                        g.expr_mut(e).remove_phi_input(j);
                    }
                }
                if let Some(a) = single_input(g, e) {
                    if map.get(&e) != Some(&a) {
                        map.insert(e, a);
                        work.extend(uses.get(&e).into_iter().flatten().copied());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// The one value other than itself that phi `e` chooses, if there is one.
fn single_input(g: &IrGraph, e: ExprId) -> Option<ExprId> {
    let mut found = None;
    for &a in g.expr(e).args.iter().rev() {
        if a == e || Some(a) == found {
            continue;
        }
        if found.is_some() {
            return None;
        }
        found = Some(a);
    }
    found
}

/// Replace every operand of `e` that has been mapped to another value.
fn rename(g: &mut IrGraph, e: ExprId, map: &HashMap<ExprId, ExprId>, uses: &mut Uses) {
    let limit = map.len();
    let mut fix = |ops: &mut Vec<ExprId>| {
        for slot in ops.iter_mut() {
            let mut a = *slot;
            let mut steps = 0;
            while let Some(&to) = map.get(&a) {
                if steps > limit {
                    break;
                }
                if let Some(u) = uses.get_mut(&a) {
                    u.remove(&e);
                }
                a = to;
                uses.entry(a).or_default().insert(e);
                steps += 1;
            }
            *slot = a;
        }
    };
    let x = g.expr_mut(e);
    fix(&mut x.args);
    fix(&mut x.scopes);
    fix(&mut x.locals);
}

// ── Mark ─────────────────────────────────────────────────────────────────────

fn mark(g: &IrGraph, code: &[BlockId]) -> HashSet<ExprId> {
    let mut marked = HashSet::new();
    let mut stack = Vec::new();
    for &b in code {
        for &e in &g.block(b).exprs {
            if g.expr(e).has_side_effect() {
                stack.push(e);
            }
        }
    }
    while let Some(e) = stack.pop() {
        if marked.insert(e) {
            stack.extend(g.expr(e).operands().filter(|a| !marked.contains(a)));
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeCache, Value};

    fn body(g: IrGraph) -> MethodBody {
        let cache = TypeCache::new();
        MethodBody {
            max_stack: 4,
            local_count: 1,
            max_scope: 0,
            init_scope: 0,
            code_len: 0,
            handlers: Vec::new(),
            activation: cache.tref(cache.builtins.any),
            graph: g,
            fixed_locals: HashMap::new(),
            code: Vec::new(),
        }
    }

    #[test]
    fn unused_pure_values_are_removed() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let k = g.push(b, Op::PushByte);
        g.expr_mut(k).value = Some(Value::Int(1));
        let unused = g.push(b, Op::PushTrue);
        let ret = g.push(b, Op::ReturnValue);
        g.expr_mut(ret).args = vec![k];

        let mut body = body(g);
        eliminate(&mut body).unwrap();
        assert_eq!(body.graph.block(b).exprs, vec![k, ret]);
        assert!(!body.graph.block(b).exprs.contains(&unused));
    }

    #[test]
    fn copies_and_single_valued_phis_are_bypassed() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let join = g.new_block();
        let k = g.push(entry, Op::PushByte);
        let copy = g.push(entry, Op::Dup);
        g.expr_mut(copy).locals = vec![k];
        let j = g.push(entry, Op::Jump);
        let edge = g.new_edge(Some(entry), 0, join);
        g.expr_mut(j).succ = vec![edge];

        let phi = g.push(join, Op::Phi);
        g.expr_mut(phi).args = vec![copy];
        g.expr_mut(phi).pred = vec![edge];
        let ret = g.push(join, Op::ReturnValue);
        g.expr_mut(ret).args = vec![phi];

        let mut body = body(g);
        eliminate(&mut body).unwrap();
        let g = &body.graph;
        assert_eq!(g.expr(ret).args, vec![k]);
        assert_eq!(g.block(join).exprs, vec![ret]);
        assert_eq!(g.block(entry).exprs, vec![k, j]);
    }

    #[test]
    fn marking_follows_loops_without_recursion() {
        // a long chain of increments feeding a loop phi
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let head = g.new_block();
        let k = g.push(entry, Op::PushByte);
        let j = g.push(entry, Op::Jump);
        let e0 = g.new_edge(Some(entry), 0, head);
        g.expr_mut(j).succ = vec![e0];

        let phi = g.push(head, Op::Phi);
        let mut prev = phi;
        for _ in 0..10_000 {
            let inc = g.push(head, Op::IncrementI);
            g.expr_mut(inc).args = vec![prev];
            g.expr_mut(inc).set_pure();
            prev = inc;
        }
        let br = g.push(head, Op::IfTrue);
        g.expr_mut(br).args = vec![prev];
        let back = g.new_edge(Some(head), 0, head);
        let exit = g.new_block();
        let out = g.new_edge(Some(head), 1, exit);
        g.expr_mut(br).succ = vec![back, out];
        g.expr_mut(phi).args = vec![k, prev];
        g.expr_mut(phi).pred = vec![e0, back];
        g.push(exit, Op::ReturnVoid);

        let mut body = body(g);
        eliminate(&mut body).unwrap();
        assert_eq!(body.graph.block(head).exprs.len(), 10_002);
    }

    #[test]
    fn phi_inputs_from_dead_blocks_are_dropped() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let dead = g.new_block();
        let join = g.new_block();
        let a = g.push(entry, Op::PushByte);
        let j = g.push(entry, Op::Jump);
        let live_edge = g.new_edge(Some(entry), 0, join);
        g.expr_mut(j).succ = vec![live_edge];
        let b = g.push(dead, Op::PushByte);
        let dj = g.push(dead, Op::Jump);
        let dead_edge = g.new_edge(Some(dead), 0, join);
        g.expr_mut(dj).succ = vec![dead_edge];

        let phi = g.push(join, Op::Phi);
        g.expr_mut(phi).args = vec![a, b];
        g.expr_mut(phi).pred = vec![live_edge, dead_edge];
        let ret = g.push(join, Op::ReturnValue);
        g.expr_mut(ret).args = vec![phi];

        let mut body = body(g);
        eliminate(&mut body).unwrap();
        assert_eq!(body.graph.expr(phi).pred, vec![live_edge]);
        assert_eq!(body.graph.expr(ret).args, vec![a]);
    }
}
