//! Immediate dominators (Cooper, Harvey and Kennedy, "A Simple, Fast
//! Dominance Algorithm").
//!
//! ## Algorithm
//!
//! 1. Number blocks by [`dfs`](super::dfs) postorder.
//! 2. Set `idom(entry) = entry`; every other block starts undefined.
//! 3. Walk the blocks in reverse postorder. For each block, intersect the
//!    already-processed predecessors by climbing the idom chains of the
//!    two fingers toward the higher postorder number until they meet.
//! 4. Repeat until no idom changes.

use super::dfs::preds;
use crate::error::AbcError;
use crate::ir::{BlockId, IrGraph};
use anyhow::Result;
use std::collections::HashMap;

/// Immediate dominator of every block in `code` (reverse postorder from a
/// preceding `dfs`). The entry block maps to itself.
pub fn idoms(g: &IrGraph, code: &[BlockId]) -> Result<HashMap<BlockId, BlockId>> {
    let entry = match code.first() {
        Some(&b) => b,
        None => return Ok(HashMap::new()),
    };
    let pred = preds(g, code);
    let mut doms: HashMap<BlockId, BlockId> = HashMap::new();
    doms.insert(entry, entry);

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &code[1..] {
            let mut new_idom: Option<BlockId> = None;
            for &e in &pred[&b] {
                let p = match g.edge(e).from {
                    Some(p) => p,
                    None => continue,
                };
                if !doms.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(g, &doms, p, cur)?,
                });
            }
            let new_idom = new_idom.ok_or_else(|| {
                AbcError::internal(format!("{} has no processed predecessor", b))
            })?;
            if doms.get(&b) != Some(&new_idom) {
                doms.insert(b, new_idom);
                changed = true;
            }
        }
    }
    Ok(doms)
}

fn intersect(
    g: &IrGraph,
    doms: &HashMap<BlockId, BlockId>,
    mut a: BlockId,
    mut b: BlockId,
) -> Result<BlockId> {
    let climb = |x: BlockId| {
        doms.get(&x)
            .copied()
            .ok_or_else(|| AbcError::internal(format!("dominator chain of {} is broken", x)))
    };
    while a != b {
        while g.block(a).postorder < g.block(b).postorder {
            a = climb(a)?;
        }
        while g.block(b).postorder < g.block(a).postorder {
            b = climb(b)?;
        }
    }
    Ok(a)
}

/// Whether `a` dominates `b`, walking up from `b`.
pub fn dominates(doms: &HashMap<BlockId, BlockId>, a: BlockId, b: BlockId) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        match doms.get(&cur) {
            Some(&up) if up != cur => cur = up,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::Op;
    use crate::analysis::dfs;

    fn terminate(g: &mut IrGraph, from: BlockId, op: Op, to: &[BlockId]) {
        let e = g.push(from, op);
        let mut succ = Vec::new();
        for (i, &t) in to.iter().enumerate() {
            succ.push(g.new_edge(Some(from), i as u32, t));
        }
        g.expr_mut(e).succ = succ;
    }

    /// entry -> {left, right} -> join -> loop header <-> body, header -> exit
    fn sample() -> (IrGraph, Vec<BlockId>) {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let ids: Vec<BlockId> = (0..6).map(|_| g.new_block()).collect();
        let [left, right, join, header, body, exit] = [ids[0], ids[1], ids[2], ids[3], ids[4], ids[5]];
        terminate(&mut g, entry, Op::IfTrue, &[left, right]);
        terminate(&mut g, left, Op::Jump, &[join]);
        terminate(&mut g, right, Op::Jump, &[join]);
        terminate(&mut g, join, Op::Jump, &[header]);
        terminate(&mut g, header, Op::IfFalse, &[body, exit]);
        terminate(&mut g, body, Op::Jump, &[header]);
        terminate(&mut g, exit, Op::ReturnVoid, &[]);
        let mut all = vec![entry];
        all.extend(ids);
        (g, all)
    }

    #[test]
    fn diamond_join_is_dominated_by_entry() {
        let (mut g, b) = sample();
        let code = dfs(&mut g);
        let doms = idoms(&g, &code).unwrap();
        assert_eq!(doms[&b[0]], b[0]);
        assert_eq!(doms[&b[1]], b[0]);
        assert_eq!(doms[&b[2]], b[0]);
        assert_eq!(doms[&b[3]], b[0]);
        assert_eq!(doms[&b[4]], b[3]);
        assert_eq!(doms[&b[5]], b[4]);
        assert_eq!(doms[&b[6]], b[4]);
    }

    #[test]
    fn idom_dominates_and_is_closest() {
        let (mut g, _) = sample();
        let code = dfs(&mut g);
        let doms = idoms(&g, &code).unwrap();
        for &b in &code {
            let d = doms[&b];
            assert!(dominates(&doms, d, b));
            // nothing strictly between b and idom(b) dominates b
            for &x in &code {
                if x != b && x != d && dominates(&doms, x, b) {
                    assert!(dominates(&doms, x, d));
                }
            }
        }
    }

    #[test]
    fn branches_do_not_dominate_the_join() {
        let (mut g, b) = sample();
        let code = dfs(&mut g);
        let doms = idoms(&g, &code).unwrap();
        assert!(!dominates(&doms, b[1], b[3]));
        assert!(!dominates(&doms, b[2], b[3]));
        assert!(dominates(&doms, b[4], b[5]));
    }
}
