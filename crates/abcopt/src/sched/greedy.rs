//! Greedy stack scheduler.
//!
//! ## Algorithm
//!
//! Blocks are taken from a queue ordered by postorder number, so a block
//! is normally scheduled after every block it flows into. Each block is
//! walked back to front while simulating the operand stack that the
//! instructions issued so far expect:
//!
//! - popping an operand that is also the next expression to issue lets
//!   that expression be issued in place, leaving its value on the stack;
//! - any other operand (a local, a phi, a value issued out of order or
//!   needed twice) becomes a `getlocal` and the value is marked live;
//! - a live value reaching its definition is stored with `setlocal` (and
//!   kept on the stack with `dup` when it is also consumed right there);
//! - an unused result is dropped with `pop`.
//!
//! Registers are named by expression id until [`alloc`](super::alloc)
//! assigns slots. Every value defined while another is live conflicts
//! with it. The live set at a block's top flows into its predecessors'
//! live-out sets (phis become the input for that edge), re-queuing a
//! predecessor whenever its set grows. The operand stack is always empty
//! at block boundaries, so only liveness crosses them.

use crate::abc::Op;
use crate::error::AbcError;
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph};
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use tracing::trace;

/// Values held in a local register; `None` until a slot is assigned.
pub type Locals = BTreeMap<ExprId, Option<u32>>;

/// Symmetric relation between values that are live at the same time.
#[derive(Debug, Default, Clone)]
pub struct ConflictGraph {
    edges: HashMap<ExprId, BTreeSet<ExprId>>,
}

impl ConflictGraph {
    pub fn add(&mut self, a: ExprId, b: ExprId) {
        if a == b {
            return;
        }
        self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
    }

    pub fn contains(&self, a: ExprId, b: ExprId) -> bool {
        self.edges.get(&a).is_some_and(|s| s.contains(&b))
    }

    /// Everything `e` conflicts with.
    pub fn get(&self, e: ExprId) -> impl Iterator<Item = ExprId> + '_ {
        self.edges.get(&e).into_iter().flatten().copied()
    }

    /// Every conflicting pair, each reported once.
    pub fn pairs(&self) -> impl Iterator<Item = (ExprId, ExprId)> + '_ {
        self.edges
            .iter()
            .flat_map(|(&a, s)| s.iter().filter(move |&&b| a < b).map(move |&b| (a, b)))
    }
}

/// Result of scheduling a method.
#[derive(Debug, Default)]
pub struct Schedule {
    /// New instruction sequence per block.
    pub exprs: HashMap<BlockId, Vec<ExprId>>,
    pub locals: Locals,
    pub conflicts: ConflictGraph,
}

/// Schedule every block of `code`. `fixed` values are live everywhere.
pub fn schedule(
    g: &mut IrGraph,
    code: &[BlockId],
    pred: &HashMap<BlockId, Vec<EdgeId>>,
    fixed: &[ExprId],
) -> Result<Schedule> {
    let mut s = Greedy {
        g,
        locals: Locals::new(),
        conflicts: ConflictGraph::default(),
    };
    let mut exprs: HashMap<BlockId, Vec<ExprId>> = HashMap::new();
    let mut liveout: HashMap<BlockId, BTreeSet<ExprId>> = HashMap::new();
    let mut work: BinaryHeap<Reverse<(u32, BlockId)>> = code
        .iter()
        .map(|&b| Reverse((s.g.block(b).postorder, b)))
        .collect();

    while let Some(Reverse(item)) = work.pop() {
        while work.peek() == Some(&Reverse(item)) {
            work.pop();
        }
        let b = item.1;
        let mut live = liveout.get(&b).cloned().unwrap_or_default();
        live.extend(fixed.iter().copied());
        for &l in &live {
            let slot = s.arg_slot(l);
            s.locals.insert(l, slot);
        }
        let mut st = BlockState {
            input: s.g.block(b).exprs.clone(),
            stk: Vec::new(),
            out: VecDeque::new(),
            live,
            phis: BTreeSet::new(),
        };
        s.block(&mut st)?;

        for &p in pred.get(&b).map(Vec::as_slice).unwrap_or(&[]) {
            let f = match s.g.edge(p).from {
                Some(f) => f,
                None => continue,
            };
            let forwarded = st.live.iter().filter_map(|&e| {
                if st.phis.contains(&e) {
                    s.g.phi_arg_index(e, p).map(|i| s.g.expr(e).args[i])
                } else {
                    Some(e)
                }
            });
            let set = liveout.entry(f).or_default();
            let before = set.len();
            set.extend(forwarded);
            if set.len() != before {
                work.push(Reverse((s.g.block(f).postorder, f)));
            }
        }
        trace!(block = %b, len = st.out.len(), live = st.live.len(), "scheduled");
        exprs.insert(b, st.out.into());
    }

    Ok(Schedule {
        exprs,
        locals: s.locals,
        conflicts: s.conflicts,
    })
}

struct Greedy<'g> {
    g: &'g mut IrGraph,
    locals: Locals,
    conflicts: ConflictGraph,
}

/// Scheduling state of the block being walked.
struct BlockState {
    /// Expressions not yet issued; the next one is at the end.
    input: Vec<ExprId>,
    /// Values the issued instructions expect; the top is at the end.
    stk: Vec<ExprId>,
    /// Issued instructions, in final order.
    out: VecDeque<ExprId>,
    live: BTreeSet<ExprId>,
    phis: BTreeSet<ExprId>,
}

impl Greedy<'_> {
    fn block(&mut self, st: &mut BlockState) -> Result<()> {
        while !st.input.is_empty() || !st.stk.is_empty() {
            if !st.stk.is_empty() && self.has_stack_effect(st.input.last().copied()) {
                let e = match self.remove_dup(st) {
                    Some(e) => e,
                    None => break,
                };
                let op = self.g.expr(e).op;
                if op.in_local()
                    || op == Op::Phi
                    || st.input.last() != Some(&e)
                    || st.stk.contains(&e)
                {
                    self.issue_load(st, e);
                } else if st.live.contains(&e) {
                    // store, then come around again to dup and issue it
                    self.define(st, e);
                    self.issue_store(st, e);
                    st.stk.push(e);
                } else if op == Op::XArg {
                    // already on the stack at handler entry
                    st.input.pop();
                } else {
                    st.input.pop();
                    self.issue_expr(st, e);
                }
                continue;
            }

            let e = match st.input.pop() {
                Some(e) => e,
                None => break,
            };
            let op = self.g.expr(e).op;
            match op {
                Op::Phi => self.issue_phi(st, e),
                Op::Arg => {
                    if st.live.contains(&e) {
                        self.define(st, e);
                    }
                }
                _ if st.live.contains(&e) => {
                    self.define(st, e);
                    if op.on_stack() {
                        self.issue_store(st, e);
                        st.input.push(e);
                    } else if op.in_local() || op.on_scope() {
                        self.issue_expr(st, e);
                    } else {
                        return Err(AbcError::internal(format!(
                            "{} ({}) is live but produces no value",
                            e, op
                        )));
                    }
                }
                Op::XArg => self.issue_pop(st, e),
                _ => {
                    if op.on_stack() {
                        self.issue_pop(st, e);
                    }
                    self.issue_expr(st, e);
                }
            }
        }
        Ok(())
    }

    fn has_stack_effect(&self, e: Option<ExprId>) -> bool {
        match e {
            None => true,
            Some(e) => {
                let x = self.g.expr(e);
                x.op == Op::Arg || x.op.on_stack() || !x.args.is_empty()
            }
        }
    }

    fn arg_slot(&self, e: ExprId) -> Option<u32> {
        let x = self.g.expr(e);
        (x.op == Op::Arg).then(|| x.imm0() as u32)
    }

    /// Pop the top value, issuing a `dup` for every extra copy beneath it.
    fn remove_dup(&mut self, st: &mut BlockState) -> Option<ExprId> {
        let e = st.stk.pop()?;
        while st.stk.last() == Some(&e) {
            st.stk.pop();
            self.issue_dup(st, e);
        }
        Some(e)
    }

    fn try_dup(&mut self, st: &mut BlockState) {
        if st.stk.len() > 2 {
            if let Some(e) = self.remove_dup(st) {
                st.stk.push(e);
            }
        }
    }

    fn define(&mut self, st: &mut BlockState, e: ExprId) {
        st.live.remove(&e);
        for &l in &st.live {
            self.conflicts.add(e, l);
        }
    }

    fn use_value(&mut self, st: &mut BlockState, e: ExprId) {
        st.live.insert(e);
        let slot = self.arg_slot(e);
        self.locals.insert(e, slot);
    }

    fn issue_phi(&mut self, st: &mut BlockState, e: ExprId) {
        st.phis.insert(e);
        if st.live.contains(&e) {
            for &l in &st.live {
                self.conflicts.add(l, e);
            }
        }
    }

    fn issue_expr(&mut self, st: &mut BlockState, e: ExprId) {
        let x = self.g.expr(e);
        if !x.op.is_synthetic() {
            st.out.push_front(e);
        }
        st.stk.extend(x.args.iter().copied());
        let used = x.locals.clone();
        for l in used {
            self.use_value(st, l);
        }
        self.try_dup(st);
    }

    fn issue_load(&mut self, st: &mut BlockState, e: ExprId) {
        self.use_value(st, e);
        let get = self.g.new_expr(Op::GetLocal);
        self.g.expr_mut(get).imm = vec![e.0 as i32];
        st.out.push_front(get);
    }

    fn issue_store(&mut self, st: &mut BlockState, e: ExprId) {
        let set = self.g.new_expr(Op::SetLocal);
        let x = self.g.expr_mut(set);
        x.imm = vec![e.0 as i32];
        x.args = vec![e];
        st.out.push_front(set);
        st.stk.push(e);
    }

    fn issue_dup(&mut self, st: &mut BlockState, e: ExprId) {
        let dup = self.g.new_expr(Op::Dup);
        self.g.expr_mut(dup).locals = vec![e];
        st.out.push_front(dup);
    }

    fn issue_pop(&mut self, st: &mut BlockState, e: ExprId) {
        let pop = self.g.new_expr(Op::Pop);
        self.g.expr_mut(pop).args = vec![e];
        st.out.push_front(pop);
    }
}
