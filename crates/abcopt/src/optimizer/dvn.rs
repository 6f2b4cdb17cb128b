//! Dominator-based value numbering.
//!
//! ## What it does
//!
//! A pure expression that recomputes a value already available from a
//! dominating expression is turned into a copy of that expression; DCE
//! then rewires its uses. Two expressions are equivalent when they share
//! the op, immediates, literal, name, method, class and every operand.
//!
//! Allocations and reads of mutable state never take part, nor do phis,
//! register-bound values and copies.
//!
//! ## Algorithm
//!
//! Blocks are visited in reverse postorder, so every dominator has its
//! table filled before its dominated blocks are scanned. A lookup checks
//! the expressions already seen in the current block, then each table up
//! the immediate-dominator chain. Rounds repeat, with DCE in between,
//! until no copy is made; a copy lets expressions built on it match in
//! the next round.

use super::dce;
use crate::abc::Op;
use crate::analysis::{dfs, idoms};
use crate::ir::{BlockId, Expr, ExprId, MethodBody};
use crate::types::{MethodId, Name, TypeId, Value};
use anyhow::Result;
use std::collections::HashMap;
use tracing::trace;

/// Everything that distinguishes the value of a pure expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    op: Op,
    imm: Vec<i32>,
    value: Option<Value>,
    name: Option<Name>,
    method: Option<MethodId>,
    class: Option<TypeId>,
    args: Vec<ExprId>,
    scopes: Vec<ExprId>,
    locals: Vec<ExprId>,
}

impl Key {
    fn of(e: &Expr) -> Key {
        Key {
            op: e.op,
            imm: e.imm.clone(),
            value: e.value.clone(),
            name: e.name.clone(),
            method: e.method,
            class: e.class,
            args: e.args.clone(),
            scopes: e.scopes.clone(),
            locals: e.locals.clone(),
        }
    }
}

fn is_candidate(e: &Expr) -> bool {
    use Op::*;
    if !e.is_pure() || !e.op.on_stack() || e.op.in_local() {
        return false;
    }
    !matches!(
        e.op,
        Phi | Dup
            | XArg
            | NewObject
            | NewArray
            | NewActivation
            | NewFunction
            | NewClass
            | NewCatch
            | GetSlot
            | GetProperty
            | GetLex
            | GetSuper
            | GetDescendants
            | GetLocal
            | GetLocal0
            | GetLocal1
            | GetLocal2
            | GetLocal3
            | NextName
            | NextValue
            | HasNext
            | HasNext2
            | Timestamp
    )
}

/// Replace redundant pure expressions by copies until none remain.
pub fn number(body: &mut MethodBody) -> Result<()> {
    loop {
        let copies = number_once(body)?;
        if copies == 0 {
            return Ok(());
        }
        trace!(copies, "dvn");
        dce::eliminate(body)?;
    }
}

fn number_once(body: &mut MethodBody) -> Result<usize> {
    let g = &mut body.graph;
    let code = dfs(g);
    let doms = idoms(g, &code)?;
    let mut tables: HashMap<BlockId, HashMap<Key, ExprId>> = HashMap::new();
    let mut copies = 0;

    for &b in &code {
        let mut table: HashMap<Key, ExprId> = HashMap::new();
        for e in g.block(b).exprs.clone() {
            if !is_candidate(g.expr(e)) {
                continue;
            }
            let key = Key::of(g.expr(e));
            let found = table.get(&key).copied().or_else(|| {
                let mut cur = b;
                while let Some(&d) = doms.get(&cur) {
                    if d == cur {
                        break;
                    }
                    if let Some(&x) = tables.get(&d).and_then(|t| t.get(&key)) {
                        return Some(x);
                    }
                    cur = d;
                }
                None
            });
            match found {
                Some(x) => {
                    g.make_copy(e, x);
                    copies += 1;
                }
                None => {
                    table.insert(key, e);
                }
            }
        }
        tables.insert(b, table);
    }
    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrGraph;
    use crate::types::TypeCache;

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

    fn pure(g: &mut IrGraph, b: BlockId, op: Op, args: Vec<ExprId>) -> ExprId {
        let e = g.push(b, op);
        g.expr_mut(e).args = args;
        g.expr_mut(e).set_pure();
        e
    }

    #[test]
    fn dominated_recomputation_becomes_copy() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let next = g.new_block();
        let x = g.push(entry, Op::CallProperty);
        let first = pure(&mut g, entry, Op::AddI, vec![x, x]);
        let j = g.push(entry, Op::Jump);
        let edge = g.new_edge(Some(entry), 0, next);
        g.expr_mut(j).succ = vec![edge];
        let second = pure(&mut g, next, Op::AddI, vec![x, x]);
        let ret = g.push(next, Op::ReturnValue);
        g.expr_mut(ret).args = vec![second];
        g.expr_mut(ret).locals = vec![first];

        let mut body = body(g);
        number(&mut body).unwrap();
        let g = &body.graph;
        assert_eq!(g.expr(ret).args, vec![first]);
        assert!(!g.block(next).exprs.contains(&second));
    }

    #[test]
    fn chains_collapse_over_rounds() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let x = g.push(b, Op::CallProperty);
        let a1 = pure(&mut g, b, Op::NegateI, vec![x]);
        let a2 = pure(&mut g, b, Op::NegateI, vec![x]);
        let b1 = pure(&mut g, b, Op::BitNot, vec![a1]);
        let b2 = pure(&mut g, b, Op::BitNot, vec![a2]);
        let ret = g.push(b, Op::ReturnValue);
        g.expr_mut(ret).args = vec![b2];
        g.expr_mut(ret).locals = vec![b1];

        let mut body = body(g);
        number(&mut body).unwrap();
        let g = &body.graph;
        assert_eq!(g.expr(ret).args, vec![b1]);
        assert_eq!(g.block(b).exprs, vec![x, a1, b1, ret]);
    }

    #[test]
    fn allocations_and_side_effects_are_not_shared() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let a1 = pure(&mut g, b, Op::NewObject, vec![]);
        let a2 = pure(&mut g, b, Op::NewObject, vec![]);
        let c1 = g.push(b, Op::CallProperty);
        let c2 = g.push(b, Op::CallProperty);
        let ret = g.push(b, Op::ReturnValue);
        g.expr_mut(ret).args = vec![a2];
        g.expr_mut(ret).locals = vec![a1, c1, c2];

        let mut body = body(g);
        number(&mut body).unwrap();
        assert_eq!(body.graph.block(b).exprs, vec![a1, a2, c1, c2, ret]);
    }

    #[test]
    fn sibling_blocks_do_not_share_values() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (l, r) = (g.new_block(), g.new_block());
        let x = g.push(entry, Op::CallProperty);
        let br = g.push(entry, Op::IfTrue);
        g.expr_mut(br).args = vec![x];
        let e0 = g.new_edge(Some(entry), 0, l);
        let e1 = g.new_edge(Some(entry), 1, r);
        g.expr_mut(br).succ = vec![e0, e1];
        let lv = pure(&mut g, l, Op::NegateI, vec![x]);
        let lr = g.push(l, Op::ReturnValue);
        g.expr_mut(lr).args = vec![lv];
        let rv = pure(&mut g, r, Op::NegateI, vec![x]);
        let rr = g.push(r, Op::ReturnValue);
        g.expr_mut(rr).args = vec![rv];

        let mut body = body(g);
        number(&mut body).unwrap();
        assert_eq!(body.graph.expr(rr).args, vec![rv]);
        assert_eq!(body.graph.expr(lr).args, vec![lv]);
    }
}
