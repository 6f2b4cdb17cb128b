//! IR type definitions.
//!
//! A method body is an arena graph: blocks, expressions and edges live in
//! flat vectors owned by [`IrGraph`] and refer to each other by index.
//! Every expression is an SSA value; operands are split by where the
//! stack machine keeps them (operand stack, scope chain, local registers).

use crate::abc::opcodes::Op;
use crate::types::{MethodId, Name, TypeId, Typeref, Value};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Unique identifier for an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Unique identifier for a control edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

// ── Expression flags ─────────────────────────────────────────────────────────

/// May throw.
pub const PX: u8 = 0x1;
/// Has an observable side effect.
pub const EFFECT: u8 = 0x2;

/// Flags an expression starts out with.
pub fn initial_flags(op: Op) -> u8 {
    use Op::*;
    match op {
        PushNull | PushUndefined | PushByte | PushShort | PushTrue | PushFalse | PushNan
        | PushString | PushInt | PushUint | PushDouble | PushNamespace | Phi | Arg
        | HasNext2O | HasNext2I | GetLocal | GetLocal0 | GetLocal1 | GetLocal2 | GetLocal3
        | GetGlobalScope | GetScopeObject | NewActivation | NewCatch | NewFunction | TypeOf
        | Not | ConvertB | CoerceA | CoerceO | StrictEquals | Label | Nop | Dup | Kill => 0,

        GetSlot | Coerce | AsType | AsTypeLate | IsType | IsTypeLate | InstanceOf | ConvertO
        | CheckFilter | NewArray | PushScope | PushWith => PX,

        // the caught value is on the stack whether or not it is read
        XArg | PopScope | Debug | DebugLine | DebugFile | Bkpt | BkptLine | Timestamp | Dxns
        | FindDef | FindProperty | SetLocal | SetLocal0 | SetLocal1 | SetLocal2 | SetLocal3 => {
            EFFECT
        }

        _ => PX | EFFECT,
    }
}

// ── Edges ────────────────────────────────────────────────────────────────────

/// A control edge.
///
/// Normal edges carry their position in the source's successor list as
/// `label`; exception edges carry the handler index as `label` and in
/// `handler`. The entry edge has no source.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: Option<BlockId>,
    pub to: BlockId,
    pub label: u32,
    pub handler: Option<u32>,
}

impl Edge {
    pub fn is_exception(&self) -> bool {
        self.handler.is_some()
    }
}

// ── Blocks ───────────────────────────────────────────────────────────────────

/// A basic block. Only the last expression may carry successors.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub exprs: Vec<ExprId>,
    /// Exception edges, one per covering handler.
    pub xsucc: Vec<EdgeId>,
    /// Postorder number from the last [`dfs`](crate::analysis::dfs).
    pub postorder: u32,
    /// Contains `hasnext2`; never split, merged or rewritten by CFG passes.
    pub must_isolate: bool,
    pub is_backwards_branch_target: bool,
    pub is_backwards_branch: bool,
}

// ── Expressions ──────────────────────────────────────────────────────────────

/// An SSA value.
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub op: Op,
    /// Operand stack inputs.
    pub args: Vec<ExprId>,
    /// Scope chain inputs, outermost first.
    pub scopes: Vec<ExprId>,
    /// Local register inputs.
    pub locals: Vec<ExprId>,
    /// Raw immediates (slot ids, register numbers, debug operands).
    pub imm: Vec<i32>,
    /// Literal carried by a push-constant or debug expression.
    pub value: Option<Value>,
    /// Property or type reference.
    pub name: Option<Name>,
    pub method: Option<MethodId>,
    pub class: Option<TypeId>,
    /// Control successors; non-empty only on block terminators.
    pub succ: Vec<EdgeId>,
    /// Phi predecessors, index-aligned with `args`.
    pub pred: Vec<EdgeId>,
    pub flags: u8,
}

impl Expr {
    pub fn is_pure(&self) -> bool {
        self.flags & (PX | EFFECT) == 0
    }

    pub fn has_side_effect(&self) -> bool {
        !self.is_pure()
    }

    pub fn set_pure(&mut self) {
        self.flags &= !(PX | EFFECT);
    }

    /// Copy marker left behind by rewrites: the value is `locals[0]`.
    pub fn is_copy(&self) -> bool {
        self.op == Op::Dup
    }

    /// Control transfer: branch, switch, return or throw.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.op,
            Op::Jump | Op::LookupSwitch | Op::ReturnVoid | Op::ReturnValue | Op::Throw
        ) || self.op.is_if()
    }

    pub fn imm0(&self) -> i32 {
        self.imm.first().copied().unwrap_or(0)
    }

    /// Operands in evaluation order: locals, scopes, then stack args.
    pub fn operands(&self) -> impl Iterator<Item = ExprId> + '_ {
        self.locals
            .iter()
            .chain(self.scopes.iter())
            .chain(self.args.iter())
            .copied()
    }

    pub fn remove_phi_input(&mut self, i: usize) {
        self.args.remove(i);
        self.pred.remove(i);
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.id, self.op)?;
        if let Some(n) = &self.name {
            write!(f, " {}", n)?;
        }
        if let Some(v) = &self.value {
            write!(f, " {}", v)?;
        }
        for i in &self.imm {
            write!(f, " #{}", i)?;
        }
        let list = |f: &mut fmt::Formatter<'_>, open: char, ids: &[ExprId], close: char| {
            if ids.is_empty() {
                return Ok(());
            }
            write!(f, " {}", open)?;
            for (i, a) in ids.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", a)?;
            }
            write!(f, "{}", close)
        };
        list(f, '[', &self.locals, ']')?;
        list(f, '{', &self.scopes, '}')?;
        list(f, '(', &self.args, ')')?;
        Ok(())
    }
}

// ── Graph ────────────────────────────────────────────────────────────────────

/// Arena owning one method's blocks, expressions and edges.
///
/// Nothing is ever freed; blocks no longer reachable from `entry` are
/// simply ignored by every pass.
#[derive(Debug, Clone)]
pub struct IrGraph {
    pub blocks: Vec<Block>,
    pub exprs: Vec<Expr>,
    pub edges: Vec<Edge>,
    pub entry: EdgeId,
}

impl Default for IrGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl IrGraph {
    /// A graph whose entry edge points at a fresh empty block.
    pub fn new() -> Self {
        let mut g = IrGraph {
            blocks: Vec::new(),
            exprs: Vec::new(),
            edges: Vec::new(),
            entry: EdgeId(0),
        };
        let b = g.new_block();
        g.entry = g.new_edge(None, 0, b);
        g
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            exprs: Vec::new(),
            xsucc: Vec::new(),
            postorder: 0,
            must_isolate: false,
            is_backwards_branch_target: false,
            is_backwards_branch: false,
        });
        id
    }

    pub fn new_expr(&mut self, op: Op) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr {
            id,
            op,
            args: Vec::new(),
            scopes: Vec::new(),
            locals: Vec::new(),
            imm: Vec::new(),
            value: None,
            name: None,
            method: None,
            class: None,
            succ: Vec::new(),
            pred: Vec::new(),
            flags: initial_flags(op),
        });
        id
    }

    pub fn new_edge(&mut self, from: Option<BlockId>, label: u32, to: BlockId) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            from,
            to,
            label,
            handler: None,
        });
        id
    }

    pub fn new_xedge(&mut self, from: BlockId, handler: u32, to: BlockId) -> EdgeId {
        let id = self.new_edge(Some(from), handler, to);
        self.edges[id.0 as usize].handler = Some(handler);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.0 as usize]
    }

    pub fn entry_block(&self) -> BlockId {
        self.edge(self.entry).to
    }

    /// Append `e` to block `b`.
    pub fn add(&mut self, b: BlockId, e: ExprId) {
        self.block_mut(b).exprs.push(e);
    }

    /// New expression appended to `b`.
    pub fn push(&mut self, b: BlockId, op: Op) -> ExprId {
        let e = self.new_expr(op);
        self.add(b, e);
        e
    }

    pub fn last(&self, b: BlockId) -> Option<ExprId> {
        self.block(b).exprs.last().copied()
    }

    /// Normal successors: those of the terminator.
    pub fn succ(&self, b: BlockId) -> &[EdgeId] {
        match self.last(b) {
            Some(e) => &self.expr(e).succ,
            None => &[],
        }
    }

    /// Exception successors first, then normal successors.
    pub fn all_succ(&self, b: BlockId) -> Vec<EdgeId> {
        let mut v = self.block(b).xsucc.clone();
        v.extend_from_slice(self.succ(b));
        v
    }

    /// Turn `e` into a copy of `a`.
    pub fn make_copy(&mut self, e: ExprId, a: ExprId) {
        let x = self.expr_mut(e);
        x.op = Op::Dup;
        x.locals = vec![a];
        x.args.clear();
        x.scopes.clear();
        x.set_pure();
    }

    /// Position of the phi input arriving over `edge`.
    pub fn phi_arg_index(&self, phi: ExprId, edge: EdgeId) -> Option<usize> {
        self.expr(phi).pred.iter().position(|&p| p == edge)
    }

    /// Leading phis of `b`.
    pub fn phis(&self, b: BlockId) -> Vec<ExprId> {
        self.block(b)
            .exprs
            .iter()
            .copied()
            .filter(|&e| self.expr(e).op == Op::Phi)
            .collect()
    }

    /// Owning block of every expression in `code`.
    pub fn expr_blocks(&self, code: &[BlockId]) -> HashMap<ExprId, BlockId> {
        let mut map = HashMap::new();
        for &b in code {
            for &e in &self.block(b).exprs {
                map.insert(e, b);
            }
        }
        map
    }
}

// ── Method bodies ────────────────────────────────────────────────────────────

/// One exception handler of a method body.
#[derive(Debug, Clone)]
pub struct Handler {
    pub from: u32,
    pub to: u32,
    pub target: u32,
    pub ty: Typeref,
    pub name: Option<Name>,
    /// Scope type of the `newcatch` object.
    pub activation: Typeref,
    /// Handler block (xarg + jump), once created.
    pub entry: Option<BlockId>,
}

/// A decoded method body.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub max_stack: u32,
    pub local_count: u32,
    /// Scope depth usable by the body (max minus initial).
    pub max_scope: u32,
    pub init_scope: u32,
    pub code_len: u32,
    pub handlers: Vec<Handler>,
    pub activation: Typeref,
    pub graph: IrGraph,
    /// Values pinned to a register; `None` means "any register, but its own".
    pub fixed_locals: HashMap<ExprId, Option<u32>>,
    /// Scheduled block order, set by the scheduler.
    pub code: Vec<BlockId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_graph_has_entry_block() {
        let g = IrGraph::new();
        assert_eq!(g.entry_block(), BlockId(0));
        assert!(g.edge(g.entry).from.is_none());
    }

    #[test]
    fn copy_marker_is_pure() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let a = g.push(b, Op::PushByte);
        let e = g.push(b, Op::CallProperty);
        assert!(g.expr(e).has_side_effect());
        g.make_copy(e, a);
        assert!(g.expr(e).is_copy());
        assert!(g.expr(e).is_pure());
        assert_eq!(g.expr(e).locals, vec![a]);
    }

    #[test]
    fn terminator_successors_are_block_successors() {
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let t = g.new_block();
        let j = g.push(b, Op::Jump);
        let edge = g.new_edge(Some(b), 0, t);
        g.expr_mut(j).succ = vec![edge];
        assert_eq!(g.succ(b), &[edge]);
        assert!(g.succ(t).is_empty());
    }
}
