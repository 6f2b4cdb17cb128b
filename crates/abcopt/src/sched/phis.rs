//! Phi removal: the step that turns the SSA graph into stack code.
//!
//! ## Algorithm
//!
//! 1. If the method asks for `arguments` or a rest array it never reads,
//!    drop the request and let the VM ignore extra arguments instead.
//! 2. Schedule every block and allocate registers.
//! 3. For every phi input whose slot differs from the phi's, split the
//!    incoming edge (once per edge) and copy the input into the phi's
//!    slot in the new block. Copies on one edge read every source before
//!    writing any target.
//! 4. Swap in the scheduled instructions and rewrite register numbers
//!    from value ids to slots, tracking the highest slot used.
//! 5. Merge away the split blocks that turned out to be unnecessary.

use super::alloc::alloc_locals;
use super::greedy::{schedule, Locals};
use crate::abc::constants::METHOD_IGNORE_REST;
use crate::abc::constants::{METHOD_NEED_ARGUMENTS, METHOD_NEED_REST};
use crate::abc::Op;
use crate::analysis::{dfs, preds};
use crate::error::AbcError;
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph, MethodBody};
use crate::optimizer::cfg_simplify::simplify_structural;
use crate::optimizer::utils::{insert_before_terminator, split};
use crate::types::Method;
use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Lower `body` (owned by `method`) to register and stack code.
pub fn remove_phis(body: &mut MethodBody, method: &mut Method) -> Result<()> {
    drop_unused_rest(body, method);

    let code = dfs(&mut body.graph);
    let mut pred = preds(&body.graph, &code);
    let fixed: Vec<ExprId> = body.fixed_locals.keys().copied().collect();
    let mut sched = schedule(&mut body.graph, &code, &pred, &fixed)?;
    alloc_locals(
        &body.graph,
        &code,
        &mut sched.locals,
        &sched.conflicts,
        &mut body.fixed_locals,
    );

    let g = &mut body.graph;
    let mut split_edges: HashSet<EdgeId> = HashSet::new();
    let mut copies = 0;
    let mut max_local = method.params.len().saturating_sub(1) as u32;
    for &b in &code {
        for phi in g.phis(b) {
            if !sched.locals.contains_key(&phi) {
                continue;
            }
            let lhs = slot(&sched.locals, phi)?;
            for i in (0..g.expr(phi).args.len()).rev() {
                let rhs = slot(&sched.locals, g.expr(phi).args[i])?;
                if lhs == rhs {
                    continue;
                }
                let mut p = g.expr(phi).pred[i];
                if !split_edges.contains(&p) {
                    split(g, p, &mut pred)?;
                    p = g.expr(phi).pred[i];
                    split_edges.insert(p);
                }
                let from = g
                    .edge(p)
                    .from
                    .ok_or_else(|| AbcError::internal(format!("phi {} input on entry edge", phi)))?;
                copy(g, from, lhs, rhs);
                max_local = max_local.max(lhs).max(rhs);
                copies += 1;
            }
        }

        if let Some(exprs) = sched.exprs.remove(&b) {
            g.block_mut(b).exprs = exprs;
        }
        for e in g.block(b).exprs.clone() {
            let x = g.expr(e);
            match x.op {
                Op::GetLocal | Op::SetLocal => {
                    let loc = slot(&sched.locals, ExprId(x.imm0() as u32))?;
                    g.expr_mut(e).imm = vec![loc as i32];
                    max_local = max_local.max(loc);
                }
                Op::HasNext2 => {
                    let (obj, idx) = match x.locals.as_slice() {
                        &[obj, idx] => (obj, idx),
                        _ => return Err(AbcError::internal(format!("{} without registers", e))),
                    };
                    let l0 = slot(&sched.locals, obj)?;
                    let l1 = slot(&sched.locals, idx)?;
                    g.expr_mut(e).imm = vec![l0 as i32, l1 as i32];
                    max_local = max_local.max(l0).max(l1);
                }
                _ => {}
            }
        }
    }

    body.local_count = max_local + 1;
    debug!(
        method = method.debug_name.as_str(),
        locals = body.local_count,
        copies,
        "remove phis"
    );
    simplify_structural(body)?;
    Ok(())
}

fn slot(locals: &Locals, e: ExprId) -> Result<u32> {
    locals
        .get(&e)
        .copied()
        .flatten()
        .ok_or_else(|| AbcError::internal(format!("{} has no register", e)))
}

/// Clear the `arguments`/rest request when the entry block never reads
/// the value the VM would build.
fn drop_unused_rest(body: &MethodBody, method: &mut Method) {
    if !(method.needs_arguments() || method.needs_rest()) {
        return;
    }
    let rest = method.params.len() as i32;
    let g = &body.graph;
    let used = g
        .block(g.entry_block())
        .exprs
        .iter()
        .any(|&e| g.expr(e).op == Op::Arg && g.expr(e).imm0() == rest);
    if !used {
        trace!(method = method.debug_name.as_str(), "ignore rest");
        method.flags &= !(METHOD_NEED_ARGUMENTS | METHOD_NEED_REST);
        method.flags |= METHOD_IGNORE_REST;
    }
}

/// `getlocal rhs` at the top of `b`, `setlocal lhs` before its terminator.
fn copy(g: &mut IrGraph, b: BlockId, lhs: u32, rhs: u32) {
    trace!(block = %b, lhs, rhs, "phi copy");
    let get = g.new_expr(Op::GetLocal);
    g.expr_mut(get).imm = vec![rhs as i32];
    g.block_mut(b).exprs.insert(0, get);
    let set = g.new_expr(Op::SetLocal);
    let x = g.expr_mut(set);
    x.imm = vec![lhs as i32];
    x.args = vec![get];
    insert_before_terminator(g, b, set);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::method;
    use crate::types::{TypeCache, Value};
    use std::collections::HashMap;

    fn body(cache: &TypeCache, g: IrGraph) -> MethodBody {
        MethodBody {
            max_stack: 0,
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

    /// `entry: if c goto join; arm: jump join; join: return phi(a1, a2)`.
    /// The two arguments live in different slots, so exactly one copy is
    /// needed and it lands on the split critical edge, not in the arm.
    #[test]
    fn phi_input_in_another_slot_gets_one_copy() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, 2);
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (arm, join) = (g.new_block(), g.new_block());

        let a1 = g.push(entry, Op::Arg);
        g.expr_mut(a1).imm = vec![1];
        let a2 = g.push(entry, Op::Arg);
        g.expr_mut(a2).imm = vec![2];
        let c = g.push(entry, Op::GetGlobalScope);
        let br = g.push(entry, Op::IfTrue);
        g.expr_mut(br).args = vec![c];
        let to_arm = g.new_edge(Some(entry), 0, arm);
        let direct = g.new_edge(Some(entry), 1, join);
        g.expr_mut(br).succ = vec![to_arm, direct];

        let j = g.push(arm, Op::Jump);
        let from_arm = g.new_edge(Some(arm), 0, join);
        g.expr_mut(j).succ = vec![from_arm];

        let phi = g.push(join, Op::Phi);
        g.expr_mut(phi).args = vec![a1, a2];
        g.expr_mut(phi).pred = vec![from_arm, direct];
        let ret = g.push(join, Op::ReturnValue);
        g.expr_mut(ret).args = vec![phi];

        let mut b = body(&cache, g);
        let mut meth = cache.method(m).clone();
        remove_phis(&mut b, &mut meth).unwrap();
        assert_eq!(b.local_count, 3);

        let mut g = b.graph.clone();
        let code = dfs(&mut g);
        let mut stores = Vec::new();
        for &blk in &code {
            for &e in &g.block(blk).exprs {
                assert!(!g.expr(e).op.is_synthetic(), "{} survived", g.expr(e));
                if g.expr(e).op == Op::SetLocal {
                    stores.push((blk, e));
                }
            }
        }
        assert_eq!(stores.len(), 1);
        let (copy_block, set) = stores[0];
        assert_ne!(copy_block, arm);
        assert_eq!(g.succ(copy_block).len(), 1);
        assert_eq!(g.expr(set).imm, vec![1]);
        let get = g.expr(set).args[0];
        assert_eq!(g.expr(get).op, Op::GetLocal);
        assert_eq!(g.expr(get).imm, vec![2]);
    }

    #[test]
    fn unread_rest_array_is_dropped() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, 1);
        let mut meth = cache.method(m).clone();
        meth.flags = METHOD_NEED_REST;
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let k = g.push(entry, Op::PushByte);
        g.expr_mut(k).value = Some(Value::Int(1));
        let ret = g.push(entry, Op::ReturnValue);
        g.expr_mut(ret).args = vec![k];

        let mut b = body(&cache, g);
        remove_phis(&mut b, &mut meth).unwrap();
        assert!(!meth.needs_rest());
        assert_ne!(meth.flags & METHOD_IGNORE_REST, 0);
        assert_eq!(b.local_count, 2);
        let ops: Vec<Op> = b.graph.block(entry).exprs.iter().map(|&e| b.graph.expr(e).op).collect();
        assert_eq!(ops, vec![Op::PushByte, Op::ReturnValue]);
    }
}
