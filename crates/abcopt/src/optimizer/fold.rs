//! Instruction fusion.
//!
//! ## What it does
//!
//! Merges an expression into its only consumer where the instruction set
//! has a fused form:
//!
//! | Consumer              | Operand                 | Result                    |
//! |-----------------------|-------------------------|---------------------------|
//! | `iftrue`/`iffalse`    | `not x`                 | the opposite test of `x`  |
//! | `iftrue`/`iffalse`    | `convert_b x`           | the same test of `x`      |
//! | `iftrue`/`iffalse`    | relational `a ? b`      | `if<cmp>` / `ifn<cmp>`    |
//! | `iftrue`/`iffalse`    | `strictequals a b`      | `ifstricteq`/`ifstrictne` |
//! | `getproperty x` (1 arg) | `findpropstrict x`    | `getlex x`                |
//!
//! Loose `equals` is left alone. The absorbed operand keeps no effects of
//! its own; its flags move to the consumer and DCE drops it.

use super::dce;
use crate::abc::Op;
use crate::analysis::{dfs, find_uses, Uses};
use crate::ir::{BlockId, ExprId, IrGraph, MethodBody, EFFECT, PX};
use anyhow::Result;
use std::collections::HashMap;
use tracing::trace;

pub fn fold(body: &mut MethodBody) -> Result<()> {
    let g = &mut body.graph;
    let code = dfs(g);
    let mut uses = find_uses(g, &code);
    let home = g.expr_blocks(&code);

    let mut folded = 0;
    for &b in &code {
        for e in g.block(b).exprs.clone() {
            loop {
                let x = g.expr(e);
                let a = match x.args.first() {
                    Some(&a) if only_use(&uses, a, e) && adjacent(g, &home, b, a, e) => a,
                    _ => break,
                };
                let fused = match x.op {
                    Op::IfTrue | Op::IfFalse if x.args.len() == 1 => {
                        branch_on(x.op, g.expr(a).op)
                    }
                    Op::GetProperty
                        if x.args.len() == 1
                            && g.expr(a).op == Op::FindPropStrict
                            && g.expr(a).args.is_empty()
                            && g.expr(a).name == x.name =>
                    {
                        Some(Op::GetLex)
                    }
                    _ => None,
                };
                let op = match fused {
                    Some(op) => op,
                    None => break,
                };
                trace!(%e, operand = %a, %op, "fold");
                for o in g.expr(a).operands().collect::<Vec<_>>() {
                    let u = uses.entry(o).or_default();
                    u.remove(&a);
                    u.insert(e);
                }
                subsume(g, e, a, op);
                folded += 1;
            }
        }
    }
    if folded > 0 {
        dce::eliminate(body)?;
    }
    Ok(())
}

fn only_use(uses: &Uses, a: ExprId, e: ExprId) -> bool {
    uses.get(&a).is_some_and(|u| u.len() == 1 && u.contains(&e))
}

/// Branch testing the operand of `arg` directly.
fn branch_on(test: Op, arg: Op) -> Option<Op> {
    let negated = test == Op::IfFalse;
    match arg {
        Op::Not => test.inverted(),
        Op::ConvertB => Some(test),
        Op::LessThan | Op::LessEquals | Op::GreaterThan | Op::GreaterEquals | Op::StrictEquals => {
            Op::fused_if(arg, negated)
        }
        _ => None,
    }
}

/// `a` is evaluated in the same block as `e` with no effect in between,
/// so evaluating it at `e` instead changes nothing observable.
fn adjacent(g: &IrGraph, home: &HashMap<ExprId, BlockId>, b: BlockId, a: ExprId, e: ExprId) -> bool {
    if home.get(&a) != Some(&b) {
        return false;
    }
    if g.expr(a).is_pure() {
        return true;
    }
    let exprs = &g.block(b).exprs;
    match (
        exprs.iter().position(|&x| x == a),
        exprs.iter().position(|&x| x == e),
    ) {
        (Some(i), Some(j)) if i < j => exprs[i + 1..j].iter().all(|&x| g.expr(x).is_pure()),
        _ => false,
    }
}

fn subsume(g: &mut IrGraph, e: ExprId, a: ExprId, op: Op) {
    let (flags, args, scopes) = {
        let x = g.expr(a);
        (x.flags & (PX | EFFECT), x.args.clone(), x.scopes.clone())
    };
    g.expr_mut(a).set_pure();
    let x = g.expr_mut(e);
    x.flags |= flags;
    if op == Op::GetLex {
        x.args.clear();
        x.scopes = scopes;
    } else {
        x.args = args;
    }
    x.op = op;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Name, TypeCache};

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

    /// entry: cmp = op(x, y); iffalse cmp
    fn branch_on_compare(op: Op, test: Op) -> (MethodBody, ExprId, [ExprId; 2]) {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (t, f) = (g.new_block(), g.new_block());
        let x = g.push(entry, Op::CallProperty);
        let y = g.push(entry, Op::CallProperty);
        let cmp = g.push(entry, op);
        g.expr_mut(cmp).args = vec![x, y];
        let br = g.push(entry, test);
        g.expr_mut(br).args = vec![cmp];
        let e0 = g.new_edge(Some(entry), 0, f);
        let e1 = g.new_edge(Some(entry), 1, t);
        g.expr_mut(br).succ = vec![e0, e1];
        g.push(t, Op::ReturnVoid);
        g.push(f, Op::ReturnVoid);
        (body(g), br, [x, y])
    }

    #[test]
    fn relational_compare_fuses_into_branch() {
        let (mut body, br, [x, y]) = branch_on_compare(Op::LessThan, Op::IfFalse);
        fold(&mut body).unwrap();
        let g = &body.graph;
        assert_eq!(g.expr(br).op, Op::IfNlt);
        assert_eq!(g.expr(br).args, vec![x, y]);
        assert!(g.expr(br).has_side_effect());
        assert_eq!(g.block(g.entry_block()).exprs, vec![x, y, br]);
    }

    #[test]
    fn loose_equality_is_not_fused() {
        let (mut body, br, _) = branch_on_compare(Op::Equals, Op::IfTrue);
        fold(&mut body).unwrap();
        assert_eq!(body.graph.expr(br).op, Op::IfTrue);
    }

    #[test]
    fn double_negation_collapses() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (t, f) = (g.new_block(), g.new_block());
        let x = g.push(entry, Op::CallProperty);
        let n1 = g.push(entry, Op::Not);
        g.expr_mut(n1).args = vec![x];
        let n2 = g.push(entry, Op::Not);
        g.expr_mut(n2).args = vec![n1];
        let br = g.push(entry, Op::IfTrue);
        g.expr_mut(br).args = vec![n2];
        let e0 = g.new_edge(Some(entry), 0, f);
        let e1 = g.new_edge(Some(entry), 1, t);
        g.expr_mut(br).succ = vec![e0, e1];
        g.push(t, Op::ReturnVoid);
        g.push(f, Op::ReturnVoid);

        let mut body = body(g);
        fold(&mut body).unwrap();
        let g = &body.graph;
        assert_eq!(g.expr(br).op, Op::IfTrue);
        assert_eq!(g.expr(br).args, vec![x]);
        assert_eq!(g.block(entry).exprs, vec![x, br]);
    }

    #[test]
    fn findpropstrict_and_getproperty_become_getlex() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let name = Name::public("trace");
        let scope_obj = g.push(entry, Op::CallProperty);
        let scope = g.push(entry, Op::PushScope);
        g.expr_mut(scope).args = vec![scope_obj];
        let find = g.push(entry, Op::FindPropStrict);
        g.expr_mut(find).name = Some(name.clone());
        g.expr_mut(find).scopes = vec![scope];
        let get = g.push(entry, Op::GetProperty);
        g.expr_mut(get).name = Some(name);
        g.expr_mut(get).args = vec![find];
        let ret = g.push(entry, Op::ReturnValue);
        g.expr_mut(ret).args = vec![get];

        let mut body = body(g);
        fold(&mut body).unwrap();
        let g = &body.graph;
        assert_eq!(g.expr(get).op, Op::GetLex);
        assert!(g.expr(get).args.is_empty());
        assert_eq!(g.expr(get).scopes, vec![scope]);
        assert!(!g.block(entry).exprs.contains(&find));
    }

    #[test]
    fn effects_between_operand_and_branch_block_fusion() {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (t, f) = (g.new_block(), g.new_block());
        let x = g.push(entry, Op::CallProperty);
        let y = g.push(entry, Op::CallProperty);
        let cmp = g.push(entry, Op::LessThan);
        g.expr_mut(cmp).args = vec![x, y];
        g.push(entry, Op::CallPropVoid);
        let br = g.push(entry, Op::IfTrue);
        g.expr_mut(br).args = vec![cmp];
        let e0 = g.new_edge(Some(entry), 0, f);
        let e1 = g.new_edge(Some(entry), 1, t);
        g.expr_mut(br).succ = vec![e0, e1];
        g.push(t, Op::ReturnVoid);
        g.push(f, Op::ReturnVoid);

        let mut body = body(g);
        fold(&mut body).unwrap();
        assert_eq!(body.graph.expr(br).op, Op::IfTrue);
    }
}
