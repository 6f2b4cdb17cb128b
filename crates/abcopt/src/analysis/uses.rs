//! Def → use indexing.

use crate::ir::{BlockId, ExprId, IrGraph};
use std::collections::{BTreeSet, HashMap};

/// Expression → the expressions reading it, through any operand class.
pub type Uses = HashMap<ExprId, BTreeSet<ExprId>>;

/// Uses of every expression of the blocks in `code`. Each expression of
/// `code` has an entry, possibly empty.
pub fn find_uses(g: &IrGraph, code: &[BlockId]) -> Uses {
    let mut uses: Uses = HashMap::new();
    for &b in code {
        for &e in &g.block(b).exprs {
            uses.entry(e).or_default();
            for a in g.expr(e).operands() {
                uses.entry(a).or_default().insert(e);
            }
        }
    }
    uses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::Op;

    #[test]
    fn every_operand_class_counts_as_a_use() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let a = g.push(b, Op::Arg);
        let s = g.push(b, Op::PushScope);
        let c = g.push(b, Op::PushByte);
        let get = g.push(b, Op::GetGlobalScope);
        g.expr_mut(get).scopes = vec![s];
        let h = g.push(b, Op::HasNext2);
        g.expr_mut(h).locals = vec![a, a];
        let add = g.push(b, Op::Add);
        g.expr_mut(add).args = vec![c, c];

        let uses = find_uses(&g, &[b]);
        assert_eq!(uses[&a], BTreeSet::from([h]));
        assert_eq!(uses[&s], BTreeSet::from([get]));
        assert_eq!(uses[&c], BTreeSet::from([add]));
        assert!(uses[&add].is_empty());
    }
}
