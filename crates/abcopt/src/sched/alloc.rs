//! Local register allocation over the scheduler's conflict graph.
//!
//! ## Algorithm
//!
//! Two greedy passes over the values in block order:
//!
//! 1. Values pinned by their operand (`hasnext2` results) take the slot of
//!    the register they overwrite. Phis take the slot of an allocated input
//!    when it is free, else the lowest free slot, and then hand that slot
//!    to each unallocated input that does not conflict with it, so most
//!    phi inputs need no copy.
//! 2. Everything else reuses the slot of its first stack operand when free,
//!    or takes the lowest free slot.
//!
//! A slot is free for `e` when none of the values `e` conflicts with
//! holds it.

use super::greedy::{ConflictGraph, Locals};
use crate::abc::Op;
use crate::ir::{BlockId, ExprId, IrGraph};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Assign a slot to every value in `locals`, recording the slots of
/// pinned values in `fixed`.
pub fn alloc_locals(
    g: &IrGraph,
    code: &[BlockId],
    locals: &mut Locals,
    conflicts: &ConflictGraph,
    fixed: &mut HashMap<ExprId, Option<u32>>,
) {
    for pass in [Pass::Pinned, Pass::Rest] {
        for &b in code {
            for &e in &g.block(b).exprs {
                if !locals.contains_key(&e) {
                    continue;
                }
                match pass {
                    Pass::Pinned => alloc_pinned(g, e, conflicts, locals),
                    Pass::Rest => alloc_rest(g, e, conflicts, locals),
                }
                if let (Some(slot), Some(pin)) = (slot_of(locals, e), fixed.get_mut(&e)) {
                    *pin = Some(slot);
                }
            }
        }
    }
    trace!(values = locals.len(), "allocated locals");
}

#[derive(Clone, Copy)]
enum Pass {
    Pinned,
    Rest,
}

fn slot_of(locals: &Locals, e: ExprId) -> Option<u32> {
    locals.get(&e).copied().flatten()
}

fn used_slots(e: ExprId, conflicts: &ConflictGraph, locals: &Locals) -> BTreeSet<u32> {
    conflicts.get(e).filter_map(|c| slot_of(locals, c)).collect()
}

fn lowest_free(used: &BTreeSet<u32>) -> u32 {
    (0..).find(|l| !used.contains(l)).unwrap_or(0)
}

fn alloc_pinned(g: &IrGraph, e: ExprId, conflicts: &ConflictGraph, locals: &mut Locals) {
    if slot_of(locals, e).is_some() {
        return;
    }
    let x = g.expr(e);
    if x.locals.len() == 1 && x.op.in_local() {
        if let Some(loc) = slot_of(locals, x.locals[0]) {
            locals.insert(e, Some(loc));
            return;
        }
    }
    if x.op != Op::Phi {
        return;
    }

    let used = used_slots(e, conflicts, locals);
    let loc = x
        .args
        .iter()
        .filter_map(|&a| slot_of(locals, a))
        .find(|l| !used.contains(l))
        .unwrap_or_else(|| lowest_free(&used));
    locals.insert(e, Some(loc));

    for &a in &x.args {
        if locals.get(&a) != Some(&None) {
            continue;
        }
        if conflicts.get(a).any(|c| slot_of(locals, c) == Some(loc)) {
            continue;
        }
        locals.insert(a, Some(loc));
    }
}

fn alloc_rest(g: &IrGraph, e: ExprId, conflicts: &ConflictGraph, locals: &mut Locals) {
    if slot_of(locals, e).is_some() {
        return;
    }
    let used = used_slots(e, conflicts, locals);
    let reuse = g
        .expr(e)
        .args
        .first()
        .and_then(|&a| slot_of(locals, a))
        .filter(|l| !used.contains(l));
    let loc = reuse.unwrap_or_else(|| lowest_free(&used));
    locals.insert(e, Some(loc));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{dfs, preds};
    use crate::sched::greedy::schedule;
    use crate::types::Value;

    /// Conflicting values never share a slot.
    fn assert_safe(locals: &Locals, conflicts: &ConflictGraph) {
        for (a, b) in conflicts.pairs() {
            if let (Some(Some(x)), Some(Some(y))) = (locals.get(&a), locals.get(&b)) {
                assert_ne!(x, y, "{} and {} share slot {}", a, b, x);
            }
        }
    }

    #[test]
    fn conflicting_values_get_distinct_slots() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let next = g.new_block();
        let this = g.push(entry, Op::Arg);
        g.expr_mut(this).imm = vec![0];
        let vals: Vec<ExprId> = (0..3)
            .map(|i| {
                let v = g.push(entry, Op::PushInt);
                g.expr_mut(v).value = Some(Value::Int(1000 + i));
                v
            })
            .collect();
        let j = g.push(entry, Op::Jump);
        let edge = g.new_edge(Some(entry), 0, next);
        g.expr_mut(j).succ = vec![edge];
        let a1 = g.push(next, Op::Add);
        g.expr_mut(a1).args = vec![vals[0], vals[1]];
        let a2 = g.push(next, Op::Add);
        g.expr_mut(a2).args = vec![a1, vals[2]];
        let a3 = g.push(next, Op::Add);
        g.expr_mut(a3).args = vec![a2, this];
        let ret = g.push(next, Op::ReturnValue);
        g.expr_mut(ret).args = vec![a3];

        let code = dfs(&mut g);
        let pred = preds(&g, &code);
        let mut s = schedule(&mut g, &code, &pred, &[]).unwrap();
        let mut fixed = HashMap::new();
        alloc_locals(&g, &code, &mut s.locals, &s.conflicts, &mut fixed);

        assert_safe(&s.locals, &s.conflicts);
        for &v in &vals {
            assert!(slot_of(&s.locals, v).is_some());
        }
        assert_eq!(slot_of(&s.locals, this), Some(0));
        let slots: BTreeSet<u32> = vals.iter().filter_map(|&v| slot_of(&s.locals, v)).collect();
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn phi_shares_the_slot_of_its_inputs() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (left, right, join) = (g.new_block(), g.new_block(), g.new_block());
        let c = g.push(entry, Op::GetGlobalScope);
        let br = g.push(entry, Op::IfTrue);
        g.expr_mut(br).args = vec![c];
        let e0 = g.new_edge(Some(entry), 0, left);
        let e1 = g.new_edge(Some(entry), 1, right);
        g.expr_mut(br).succ = vec![e0, e1];

        let mut arm = |g: &mut IrGraph, b: BlockId, n: i32| {
            let v = g.push(b, Op::PushInt);
            g.expr_mut(v).value = Some(Value::Int(n));
            let j = g.push(b, Op::Jump);
            let e = g.new_edge(Some(b), 0, join);
            g.expr_mut(j).succ = vec![e];
            (v, e)
        };
        let (l, from_left) = arm(&mut g, left, 300);
        let (r, from_right) = arm(&mut g, right, 400);
        let phi = g.push(join, Op::Phi);
        g.expr_mut(phi).args = vec![l, r];
        g.expr_mut(phi).pred = vec![from_left, from_right];
        let ret = g.push(join, Op::ReturnValue);
        g.expr_mut(ret).args = vec![phi];

        let code = dfs(&mut g);
        let pred = preds(&g, &code);
        let mut s = schedule(&mut g, &code, &pred, &[]).unwrap();
        let mut fixed = HashMap::new();
        alloc_locals(&g, &code, &mut s.locals, &s.conflicts, &mut fixed);

        assert_safe(&s.locals, &s.conflicts);
        let loc = slot_of(&s.locals, phi);
        assert!(loc.is_some());
        assert_eq!(slot_of(&s.locals, l), loc);
        assert_eq!(slot_of(&s.locals, r), loc);
    }

    #[test]
    fn pinned_values_record_their_slot() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let act = g.push(entry, Op::NewActivation);
        let ps = g.push(entry, Op::PushScope);
        g.expr_mut(ps).args = vec![act];
        g.push(entry, Op::ReturnVoid);

        let code = dfs(&mut g);
        let pred = preds(&g, &code);
        let mut s = schedule(&mut g, &code, &pred, &[act]).unwrap();
        let mut fixed = HashMap::from([(act, None)]);
        alloc_locals(&g, &code, &mut s.locals, &s.conflicts, &mut fixed);
        assert_eq!(fixed[&act], slot_of(&s.locals, act));
        assert!(fixed[&act].is_some());
    }
}
