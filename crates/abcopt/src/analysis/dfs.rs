//! Depth-first ordering and predecessor indexing.

use crate::ir::{BlockId, EdgeId, IrGraph};
use std::collections::{HashMap, HashSet};

// ── Traversal ────────────────────────────────────────────────────────────────

/// Blocks reachable from `start` in reverse postorder, with postorder
/// numbers. Exception successors are visited before normal ones so handler
/// blocks stay close to the code they protect.
fn walk(g: &IrGraph, start: BlockId) -> Vec<(BlockId, u32)> {
    let mut post = Vec::new();
    let mut seen = HashSet::new();
    // (block, successors, next successor index)
    let mut stack: Vec<(BlockId, Vec<EdgeId>, usize)> = Vec::new();
    seen.insert(start);
    stack.push((start, g.all_succ(start), 0));
    while let Some((b, succ, i)) = stack.last_mut() {
        if *i < succ.len() {
            let to = g.edge(succ[*i]).to;
            *i += 1;
            if seen.insert(to) {
                let next = g.all_succ(to);
                stack.push((to, next, 0));
            }
        } else {
            post.push(*b);
            stack.pop();
        }
    }
    let n = post.len() as u32;
    let mut order: Vec<(BlockId, u32)> = post
        .into_iter()
        .enumerate()
        .map(|(i, b)| (b, i as u32))
        .collect();
    order.reverse();
    debug_assert_eq!(order.len() as u32, n);
    order
}

/// Live blocks in reverse postorder from the entry; records each block's
/// postorder number.
pub fn dfs(g: &mut IrGraph) -> Vec<BlockId> {
    let order = walk(g, g.entry_block());
    for &(b, po) in &order {
        g.block_mut(b).postorder = po;
    }
    order.into_iter().map(|(b, _)| b).collect()
}

/// Reverse postorder of the blocks reachable from `start`, leaving the
/// recorded postorder numbers untouched.
pub fn dfs_from(g: &IrGraph, start: BlockId) -> Vec<BlockId> {
    walk(g, start).into_iter().map(|(b, _)| b).collect()
}

// ── Predecessors ─────────────────────────────────────────────────────────────

/// Incoming edges, normal and exception, from the blocks in `code`.
/// Every block of `code` has an entry.
pub fn preds(g: &IrGraph, code: &[BlockId]) -> HashMap<BlockId, Vec<EdgeId>> {
    let mut map: HashMap<BlockId, Vec<EdgeId>> = HashMap::new();
    for &b in code {
        map.entry(b).or_default();
    }
    for &b in code {
        for e in g.all_succ(b) {
            map.entry(g.edge(e).to).or_default().push(e);
        }
    }
    map
}
