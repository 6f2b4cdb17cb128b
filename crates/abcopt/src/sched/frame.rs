//! Operand stack and scope chain depths of scheduled code.
//!
//! Blocks are replayed in depth-first order starting from the depths
//! their first recorded predecessor left behind. Exception handlers start
//! with the caught value on an otherwise empty stack and an empty scope
//! chain.

use crate::abc::Op;
use crate::analysis::dfs;
use crate::error::AbcError;
use crate::ir::{BlockId, MethodBody};
use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

/// Set `max_stack` and `max_scope` of a scheduled body.
pub fn compute_frame_counts(body: &mut MethodBody) -> Result<()> {
    let g = &mut body.graph;
    let code = dfs(g);
    let mut depth: HashMap<BlockId, (u32, u32)> = HashMap::new();
    if let Some(&entry) = code.first() {
        depth.insert(entry, (0, 0));
    }

    let (mut max_stack, mut max_scope) = (0u32, 0u32);
    for &b in &code {
        let (mut stk, mut scp) = depth.get(&b).copied().unwrap_or((0, 0));
        max_stack = max_stack.max(stk);
        for &e in &g.block(b).exprs {
            let x = g.expr(e);
            if x.op.is_synthetic() {
                return Err(AbcError::internal(format!(
                    "{} ({}) left in scheduled code",
                    e, x.op
                )));
            }
            stk = stk.checked_sub(x.args.len() as u32).ok_or_else(|| {
                AbcError::internal(format!("stack underflow at {} in {}", x, b))
            })?;
            if x.op.on_stack() {
                stk += 1;
            }
            if x.op == Op::PopScope {
                scp = scp
                    .checked_sub(1)
                    .ok_or_else(|| AbcError::internal(format!("scope underflow in {}", b)))?;
            } else if x.op.on_scope() {
                scp += 1;
            }
            max_stack = max_stack.max(stk);
            max_scope = max_scope.max(scp);
        }

        for &s in g.succ(b) {
            depth.entry(g.edge(s).to).or_insert((stk, scp));
        }
        for &s in &g.block(b).xsucc {
            depth.entry(g.edge(s).to).or_insert((1, 0));
        }
    }

    debug!(max_stack, max_scope, "frame counts");
    body.max_stack = max_stack;
    body.max_scope = max_scope;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrGraph;
    use crate::types::{TypeCache, Value};

    fn body(g: IrGraph) -> MethodBody {
        let cache = TypeCache::new();
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

    #[test]
    fn replays_stack_and_scope_depth() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let gs = g.push(entry, Op::GetGlobalScope);
        let ps = g.push(entry, Op::PushScope);
        g.expr_mut(ps).args = vec![gs];
        let a = g.push(entry, Op::PushByte);
        g.expr_mut(a).value = Some(Value::Int(1));
        let b = g.push(entry, Op::PushByte);
        g.expr_mut(b).value = Some(Value::Int(2));
        let c = g.push(entry, Op::PushByte);
        g.expr_mut(c).value = Some(Value::Int(3));
        let add = g.push(entry, Op::Add);
        g.expr_mut(add).args = vec![b, c];
        let add2 = g.push(entry, Op::Add);
        g.expr_mut(add2).args = vec![a, add];
        g.push(entry, Op::PopScope);
        let ret = g.push(entry, Op::ReturnValue);
        g.expr_mut(ret).args = vec![add2];

        let mut body = body(g);
        compute_frame_counts(&mut body).unwrap();
        assert_eq!(body.max_stack, 3);
        assert_eq!(body.max_scope, 1);
    }

    #[test]
    fn handlers_start_with_the_exception_on_the_stack() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let handler = g.new_block();
        g.push(entry, Op::ReturnVoid);
        let x = g.new_xedge(entry, 0, handler);
        g.block_mut(entry).xsucc.push(x);
        let caught = g.new_expr(Op::XArg);
        let t = g.push(handler, Op::Throw);
        g.expr_mut(t).args = vec![caught];

        let mut body = body(g);
        compute_frame_counts(&mut body).unwrap();
        assert_eq!(body.max_stack, 1);
        assert_eq!(body.max_scope, 0);
    }

    #[test]
    fn leftover_phi_is_an_internal_error() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        g.push(entry, Op::Phi);
        g.push(entry, Op::ReturnVoid);
        let mut body = body(g);
        let err = compute_frame_counts(&mut body).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(AbcError::Internal(_))
        ));
    }
}
