//! Natural loop detection.

use super::dominators::dominates;
use crate::ir::{BlockId, EdgeId, IrGraph};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// An edge whose target was visited no later than its source in reverse
/// postorder, i.e. whose target has the larger or equal postorder number.
pub fn is_backedge(g: &IrGraph, e: EdgeId) -> bool {
    let edge = g.edge(e);
    match edge.from {
        Some(from) => g.block(edge.to).postorder >= g.block(from).postorder,
        None => false,
    }
}

/// A backedge whose target dominates its source.
pub fn is_loop(g: &IrGraph, doms: &HashMap<BlockId, BlockId>, e: EdgeId) -> bool {
    let edge = g.edge(e);
    match edge.from {
        Some(from) => is_backedge(g, e) && dominates(doms, edge.to, from),
        None => false,
    }
}

/// Loop header → blocks of the loop body, excluding the header itself.
///
/// The body is everything that reaches a latch (the source of a loop
/// edge) without passing through the header. A self loop yields a header
/// with an empty body.
pub fn find_loops(
    g: &IrGraph,
    code: &[BlockId],
    doms: &HashMap<BlockId, BlockId>,
    pred: &HashMap<BlockId, Vec<EdgeId>>,
) -> BTreeMap<BlockId, BTreeSet<BlockId>> {
    let mut loops: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
    for &b in code {
        for &s in g.succ(b) {
            if !is_loop(g, doms, s) {
                continue;
            }
            let h = g.edge(s).to;
            let body = loops.entry(h).or_default();
            let mut work = Vec::new();
            for &p in pred.get(&h).map(Vec::as_slice).unwrap_or(&[]) {
                let from = match g.edge(p).from {
                    Some(f) => f,
                    None => continue,
                };
                if is_loop(g, doms, p) && from != h && body.insert(from) {
                    work.push(from);
                }
            }
            while let Some(x) = work.pop() {
                for &p in pred.get(&x).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(from) = g.edge(p).from {
                        if from != h && body.insert(from) {
                            work.push(from);
                        }
                    }
                }
            }
        }
    }
    loops
}
