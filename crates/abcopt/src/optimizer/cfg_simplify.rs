//! Control-flow simplification.
//!
//! ## What it does
//!
//! Shrinks the block graph without changing what any path computes:
//!
//! - a block ending in `jump` absorbs its target when it is the target's
//!   only predecessor and both sit under the same handlers;
//! - a `jump` to a lone `return` becomes the return itself, including the
//!   `[phi, returnvalue(phi)]` shape, where the phi input is returned
//!   directly;
//! - a boolean branch into a block that merely re-tests the same value is
//!   threaded straight to the outcome it must take;
//! - edges into blocks holding nothing but a `jump` skip that block;
//! - a conditional branch whose fall-through has several predecessors but
//!   whose taken target has one is inverted, so the single-predecessor
//!   block can be laid out next.
//!
//! ## Algorithm
//!
//! The graph is scanned in reverse postorder and the first rewrite that
//! applies is performed; analyses are then recomputed (with DCE in
//! between, unless running on scheduled code) and the scan restarts until
//! nothing applies. Blocks flagged `must_isolate` are never merged or
//! threaded through.

use super::dce;
use super::utils::{copy_target, copy_target_phi, invert, same_ex_scope};
use crate::abc::Op;
use crate::analysis::{dfs, find_uses, preds, Uses};
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph, MethodBody};
use anyhow::Result;
use std::collections::HashMap;
use tracing::trace;

type Preds = HashMap<BlockId, Vec<EdgeId>>;

/// Simplify to a fixed point, running DCE after every change. Returns
/// whether anything changed.
pub fn simplify(body: &mut MethodBody) -> Result<bool> {
    run(body, true)
}

/// Same rewrites, without DCE, for graphs that no longer hold phis.
pub fn simplify_structural(body: &mut MethodBody) -> Result<bool> {
    run(body, false)
}

fn run(body: &mut MethodBody, with_dce: bool) -> Result<bool> {
    let mut changed = false;
    loop {
        let code = dfs(&mut body.graph);
        let pred = preds(&body.graph, &code);
        let uses = find_uses(&body.graph, &code);
        if !simplify_once(&mut body.graph, &code, &pred, &uses)? {
            break;
        }
        changed = true;
        if with_dce {
            dce::eliminate(body)?;
        }
    }
    Ok(changed)
}

/// Apply the first rewrite found.
fn simplify_once(g: &mut IrGraph, code: &[BlockId], pred: &Preds, uses: &Uses) -> Result<bool> {
    let entry = g.entry_block();
    for &b in code {
        let last = match g.last(b) {
            Some(e) => e,
            None => continue,
        };
        let op = g.expr(last).op;

        if op == Op::Jump {
            let s = g.expr(last).succ[0];
            let taken = g.edge(s).to;
            if taken != b && same_ex_scope(g, b, taken) {
                if merge(g, b, last, s, taken, entry, pred) {
                    return Ok(true);
                }
                if jump_to_return(g, last, s, taken)? {
                    return Ok(true);
                }
            }
        }

        if matches!(op, Op::IfTrue | Op::IfFalse) && g.expr(last).args.len() == 1 {
            if thread_branch(g, last, uses)? {
                return Ok(true);
            }
        }

        for s in g.expr(last).succ.clone() {
            if skip_empty(g, b, s)? {
                return Ok(true);
            }
        }

        if op.is_if() && g.expr(last).succ.len() == 2 {
            let (s0, s1) = (g.expr(last).succ[0], g.expr(last).succ[1]);
            let count = |e: EdgeId| pred.get(&g.edge(e).to).map_or(0, Vec::len);
            if g.edge(s0).to != g.edge(s1).to && count(s0) > 1 && count(s1) == 1 {
                invert(g, last)?;
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// ── Rewrites ─────────────────────────────────────────────────────────────────

/// Append `taken` to `b`, which reaches it through its only predecessor.
fn merge(
    g: &mut IrGraph,
    b: BlockId,
    jump: ExprId,
    s: EdgeId,
    taken: BlockId,
    entry: BlockId,
    pred: &Preds,
) -> bool {
    if taken == entry || g.block(b).must_isolate || g.block(taken).must_isolate {
        return false;
    }
    if pred.get(&taken).map(Vec::as_slice) != Some(&[s][..]) {
        return false;
    }
    trace!(into = %b, from = %taken, "merge blocks");
    let absorbed = std::mem::take(&mut g.block_mut(taken).exprs);
    for &e in &absorbed {
        if g.expr(e).op == Op::Phi {
            let a = g.expr(e).args[0];
            g.make_copy(e, a);
        }
    }
    if let Some(&t) = absorbed.last() {
        for succ in g.expr(t).succ.clone() {
            g.edge_mut(succ).from = Some(b);
        }
    }
    let block = g.block_mut(b);
    block.exprs.retain(|&e| e != jump);
    block.exprs.extend(absorbed);
    true
}

/// `jump` to a block that only returns becomes that return.
fn jump_to_return(g: &mut IrGraph, jump: ExprId, s: EdgeId, taken: BlockId) -> Result<bool> {
    let exprs = g.block(taken).exprs.clone();
    match exprs.as_slice() {
        &[r] if matches!(g.expr(r).op, Op::ReturnVoid | Op::ReturnValue) => {
            let (op, args) = (g.expr(r).op, g.expr(r).args.clone());
            trace!(%jump, "jump to return");
            let x = g.expr_mut(jump);
            x.op = op;
            x.args = args;
            x.succ.clear();
            Ok(true)
        }
        &[phi, r]
            if g.expr(phi).op == Op::Phi
                && g.expr(r).op == Op::ReturnValue
                && g.expr(r).args == [phi] =>
        {
            let i = match g.phi_arg_index(phi, s) {
                Some(i) => i,
                None => return Ok(false),
            };
            let a = g.expr(phi).args[i];
            trace!(%jump, "jump to phi return");
            g.expr_mut(phi).remove_phi_input(i);
            let x = g.expr_mut(jump);
            x.op = Op::ReturnValue;
            x.args = vec![a];
            x.succ.clear();
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// A branch on `c` into `[phi, br(phi)]` where the phi receives `c` over
/// the taken edge goes directly where `br` will send it.
fn thread_branch(g: &mut IrGraph, br: ExprId, uses: &Uses) -> Result<bool> {
    let cond = g.expr(br).args[0];
    let into = g.expr(br).succ[1];
    let taken = g.edge(into).to;
    if g.block(taken).must_isolate || Some(taken) == g.edge(into).from {
        return Ok(false);
    }
    let (phi, br2) = match g.block(taken).exprs.as_slice() {
        &[phi, br2] => (phi, br2),
        _ => return Ok(false),
    };
    let test = g.expr(br2);
    if g.expr(phi).op != Op::Phi
        || !matches!(test.op, Op::IfTrue | Op::IfFalse)
        || test.args != [phi]
    {
        return Ok(false);
    }
    let i = match g.phi_arg_index(phi, into) {
        Some(i) if g.expr(phi).args[i] == cond => i,
        _ => return Ok(false),
    };
    // the phi stops dominating the outcome block, so it may only be read
    // by the re-test and by phis right behind it
    let outcomes: Vec<BlockId> = test.succ.iter().map(|&e| g.edge(e).to).collect();
    let safe = uses.get(&phi).into_iter().flatten().all(|&u| {
        u == br2 || (g.expr(u).op == Op::Phi && outcomes.iter().any(|&o| g.phis(o).contains(&u)))
    });
    if !safe {
        return Ok(false);
    }
    let before = if test.op == g.expr(br).op {
        test.succ[1]
    } else {
        test.succ[0]
    };
    trace!(%br, through = %taken, "thread branch");
    g.expr_mut(phi).remove_phi_input(i);
    copy_target_phi(g, phi, cond, before, into)?;
    Ok(true)
}

/// Retarget `s` past a block holding only a `jump`.
fn skip_empty(g: &mut IrGraph, b: BlockId, s: EdgeId) -> Result<bool> {
    let mid = g.edge(s).to;
    if mid == b || g.block(mid).must_isolate {
        return Ok(false);
    }
    let j = match g.block(mid).exprs.as_slice() {
        &[j] if g.expr(j).op == Op::Jump => j,
        _ => return Ok(false),
    };
    let next = g.expr(j).succ[0];
    if leads_into_empty_cycle(g, mid) {
        return Ok(false);
    }
    trace!(edge = %s, past = %mid, "skip empty block");
    copy_target(g, next, s)?;
    Ok(true)
}

/// Following lone `jump` blocks from `start` comes back around.
fn leads_into_empty_cycle(g: &IrGraph, start: BlockId) -> bool {
    let mut seen = std::collections::HashSet::new();
    let mut b = start;
    while seen.insert(b) {
        match g.block(b).exprs.as_slice() {
            &[j] if g.expr(j).op == Op::Jump => b = g.edge(g.expr(j).succ[0]).to,
            _ => return false,
        }
    }
    true
}
