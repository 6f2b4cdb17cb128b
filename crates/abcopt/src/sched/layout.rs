//! Final block order.
//!
//! ## Algorithm
//!
//! 1. Walk the blocks in reverse postorder. When a loop header is placed,
//!    the rest of its natural loop follows immediately (in depth-first
//!    order from the header, recursing into inner loops) so loop bodies
//!    stay contiguous.
//! 2. A two-way branch whose fall-through edge does not lead to the next
//!    block but whose taken edge does is inverted, saving a jump.
//! 3. Every edge to a block placed earlier marks its source as a backward
//!    branch and its target as a backward branch target.

use crate::analysis::{dfs, dfs_from, find_loops, idoms, preds};
use crate::ir::{BlockId, IrGraph};
use crate::optimizer::utils::invert;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::trace;

type Loops = BTreeMap<BlockId, BTreeSet<BlockId>>;

/// Order the live blocks of `g` for emission.
pub fn layout(g: &mut IrGraph) -> Result<Vec<BlockId>> {
    let code = dfs(g);
    let pred = preds(g, &code);
    let doms = idoms(g, &code)?;
    let loops = find_loops(g, &code, &doms, &pred);

    let mut order = Vec::with_capacity(code.len());
    let mut placed = HashSet::new();
    for &b in &code {
        if placed.insert(b) {
            order.push(b);
            if loops.contains_key(&b) {
                place_loop(g, &loops, b, &mut placed, &mut order);
            }
        }
    }

    for w in order.windows(2) {
        let (b, next) = (w[0], w[1]);
        let last = match g.last(b) {
            Some(e) => e,
            None => continue,
        };
        let x = g.expr(last);
        if x.op.is_if()
            && x.succ.len() == 2
            && g.edge(x.succ[0]).to != next
            && g.edge(x.succ[1]).to == next
        {
            trace!(block = %b, "invert branch");
            invert(g, last)?;
        }
    }

    mark_backward(g, &order);
    Ok(order)
}

fn place_loop(
    g: &IrGraph,
    loops: &Loops,
    header: BlockId,
    placed: &mut HashSet<BlockId>,
    order: &mut Vec<BlockId>,
) {
    let body = match loops.get(&header) {
        Some(body) => body,
        None => return,
    };
    for b in dfs_from(g, header) {
        if body.contains(&b) && placed.insert(b) {
            order.push(b);
            if b != header && loops.contains_key(&b) {
                place_loop(g, loops, b, placed, order);
            }
        }
    }
}

fn mark_backward(g: &mut IrGraph, order: &[BlockId]) {
    for &b in order {
        let blk = g.block_mut(b);
        blk.is_backwards_branch = false;
        blk.is_backwards_branch_target = false;
    }
    let mut seen = HashSet::new();
    for &b in order {
        seen.insert(b);
        let targets: Vec<BlockId> = g.succ(b).iter().map(|&s| g.edge(s).to).collect();
        for to in targets {
            if seen.contains(&to) {
                g.block_mut(b).is_backwards_branch = true;
                g.block_mut(to).is_backwards_branch_target = true;
            }
        }
    }
}
