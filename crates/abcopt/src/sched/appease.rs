//! Kills and coercions for the legacy bytecode verifier.
//!
//! The legacy verifier merges register types at every join and rejects
//! some merges that later verifiers accept. This pass reproduces the
//! verifier's view of the registers and patches the code so that every
//! join it sees is one it can merge. The conflict test is a heuristic
//! kept for compatibility with code that already passes the legacy
//! verifier; it is not a model of the verifier's rules.
//!
//! ## Algorithm
//!
//! 1. Walk the blocks in layout order, simulating the verifier's frame:
//!    parameters have their declared types, other registers are `*`, and
//!    a branch target takes the meet of every frame that reaches it
//!    (nullable at backward branch targets). Record per block the
//!    registers it defines, reads before defining, kills and reads after
//!    defining, plus the instruction that last defined each register.
//! 2. Solve live-out sets by round-robin iteration.
//! 3. On each edge whose target can reach a join, kill the registers that
//!    are active at the source but dead at the target. At each block,
//!    coerce every live-in register arriving with a type the verifier
//!    would not merge with the consensus type.
//! 4. Constraints that every successor edge of a block agrees on move
//!    into the block itself; a coercion of a register not read after its
//!    last definition is applied right before that definition.
//! 5. Remaining edge constraints get an isolated block of their own.

use crate::abc::Op;
use crate::analysis::preds;
use crate::error::AbcError;
use crate::ir::{BlockId, EdgeId, ExprId, IrGraph, MethodBody};
use crate::optimizer::casts::VerifierTypes;
use crate::optimizer::utils::{insert_before_terminator, split};
use crate::types::{Method, TypeCache, TypeId, Typeref};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

use super::layout::layout;

/// Insert the kills and coercions the legacy verifier needs.
pub fn appease(
    body: &mut MethodBody,
    cache: &TypeCache,
    method: &Method,
    types: &VerifierTypes,
) -> Result<()> {
    let code = layout(&mut body.graph)?;
    let mut pred = preds(&body.graph, &code);
    let cx = Context {
        cache,
        types,
        params: &method.params,
        activation: body.activation.t,
        entry: body.graph.entry_block(),
        nregs: (body.local_count as usize).max(method.params.len()),
    };
    let states = cx.local_states(&body.graph, &code)?;
    let fixed: HashSet<u32> = body.fixed_locals.values().flatten().copied().collect();

    let g = &mut body.graph;
    let mut constraints: HashMap<EdgeId, Constraints> = HashMap::new();
    let mut single_paths: HashSet<EdgeId> = HashSet::new();

    for &b in &code {
        let state = state_of(&states, b)?;
        let active = state.active();

        for &s in g.succ(b) {
            if single_path_to_exit(g, s, &pred, &mut single_paths, &mut HashSet::new()) {
                continue;
            }
            let to = g.edge(s).to;
            let to_state = state_of(&states, to)?;
            let to_livein = to_state.livein();
            let tc = constraints.entry(s).or_default();
            for &r in &active {
                if to_livein.contains(&r) || fixed.contains(&r) {
                    continue;
                }
                let redefined = to_state.def.contains(&r) || to_state.killed.contains(&r);
                // a kill into a block with one predecessor is rejected
                if !redefined || pred.get(&to).map_or(0, Vec::len) > 1 {
                    tc.kills.insert(r);
                }
            }
        }

        let incoming: Vec<(EdgeId, BlockId)> = pred
            .get(&b)
            .into_iter()
            .flatten()
            .filter(|&&p| !g.edge(p).is_exception())
            .filter_map(|&p| g.edge(p).from.map(|f| (p, f)))
            .collect();
        for r in state.livein() {
            let mut consensus = state.fs_in[r as usize];
            for &(_, from) in &incoming {
                consensus = cx.meet(consensus, state_of(&states, from)?.fs_out[r as usize]);
            }
            for &(p, from) in &incoming {
                let from_ty = state_of(&states, from)?.fs_out[r as usize];
                let tc = constraints.entry(p).or_default();
                if let Some(hard) = state.hard[r as usize] {
                    tc.coercions.insert(r, hard);
                } else if cx.needs_coercion(consensus, from_ty, g.block(b).is_backwards_branch_target)
                {
                    tc.coercions.insert(r, consensus);
                }
            }
        }
    }

    let mut hoisted = 0;
    for &b in &code {
        let state = state_of(&states, b)?;
        let succ = g.succ(b).to_vec();
        let first = match succ.first() {
            Some(&s) => s,
            None => continue,
        };
        let mut source: Option<Constraints> = None;
        for r in state.active() {
            let empty = Constraints::default();
            let head = constraints.get(&first).unwrap_or(&empty);
            let agree = succ
                .iter()
                .all(|s| head.agrees_with(constraints.get(s).unwrap_or(&empty), r, cache));
            if !agree {
                continue;
            }
            let src = source.get_or_insert_with(Constraints::default);
            for s in &succ {
                if let Some(tc) = constraints.get_mut(s) {
                    src.take_from(tc, r);
                }
            }
        }
        if let Some(src) = source {
            if !src.is_empty() {
                hoisted += 1;
                cx.fix_constraints(g, b, src, Some(state));
            }
        }
    }

    let mut isolated = 0;
    for &b in &code {
        for s in g.succ(b).to_vec() {
            let tc = match constraints.remove(&s) {
                Some(tc) if !tc.is_empty() => tc,
                _ => continue,
            };
            split(g, s, &mut pred)?;
            let d = g.edge(s).to;
            g.block_mut(d).must_isolate = true;
            cx.fix_constraints(g, d, tc, None);
            isolated += 1;
        }
    }

    debug!(
        method = method.debug_name.as_str(),
        hoisted,
        isolated,
        "appease legacy verifier"
    );
    Ok(())
}

fn state_of(states: &HashMap<BlockId, LocalState>, b: BlockId) -> Result<&LocalState> {
    states
        .get(&b)
        .ok_or_else(|| AbcError::internal(format!("no register state for {}", b)))
}

/// The target of `s` reaches an exit without passing through a join.
fn single_path_to_exit(
    g: &IrGraph,
    s: EdgeId,
    pred: &HashMap<BlockId, Vec<EdgeId>>,
    known: &mut HashSet<EdgeId>,
    visiting: &mut HashSet<EdgeId>,
) -> bool {
    let b = g.edge(s).to;
    if pred.get(&b).map_or(0, Vec::len) > 1 {
        return false;
    }
    if known.contains(&s) {
        return true;
    }
    if !visiting.insert(s) {
        return false;
    }
    let single = g
        .succ(b)
        .iter()
        .all(|&next| single_path_to_exit(g, next, pred, known, visiting));
    if single {
        known.insert(s);
    }
    single
}

// ── Constraints ──────────────────────────────────────────────────────────────

/// Kills and coercions required on one edge or in one block.
#[derive(Debug, Default, Clone)]
struct Constraints {
    kills: BTreeSet<u32>,
    coercions: BTreeMap<u32, Typeref>,
}

impl Constraints {
    fn is_empty(&self) -> bool {
        self.kills.is_empty() && self.coercions.is_empty()
    }

    fn agrees_with(&self, other: &Constraints, r: u32, cache: &TypeCache) -> bool {
        if self.kills.contains(&r) {
            other.kills.contains(&r)
        } else if let Some(t) = self.coercions.get(&r) {
            other
                .coercions
                .get(&r)
                .is_some_and(|o| cache.is_machine_compatible(t.t, o.t))
        } else {
            false
        }
    }

    /// Move the constraint on `r` from `tc` into `self`.
    fn take_from(&mut self, tc: &mut Constraints, r: u32) {
        if self.kills.contains(&r) || self.coercions.contains_key(&r) {
            tc.kills.remove(&r);
            tc.coercions.remove(&r);
        } else if tc.kills.remove(&r) {
            self.kills.insert(r);
        } else if let Some(t) = tc.coercions.remove(&r) {
            self.coercions.insert(r, t);
        }
    }
}

// ── Register states ──────────────────────────────────────────────────────────

/// The verifier's view of the registers in one block.
#[derive(Debug, Clone)]
struct LocalState {
    /// Types the verifier expects on entry.
    fs_in: Vec<Typeref>,
    /// Types at the end of the block.
    fs_out: Vec<Typeref>,
    /// Coercions required on every incoming edge regardless of type.
    hard: Vec<Option<Typeref>>,
    liveout: BTreeSet<u32>,
    killed: BTreeSet<u32>,
    def: BTreeSet<u32>,
    /// Read before any definition in this block.
    ue: BTreeSet<u32>,
    read_after_def: BTreeSet<u32>,
    /// Last instruction defining each register.
    generators: HashMap<u32, ExprId>,
    /// Parameters, when this is the entry block.
    a_priori: u32,
}

impl LocalState {
    fn livein(&self) -> BTreeSet<u32> {
        let mut set: BTreeSet<u32> = self.liveout.difference(&self.def).copied().collect();
        set.extend(self.ue.iter().copied());
        set
    }

    fn active(&self) -> BTreeSet<u32> {
        let mut set = self.livein();
        set.extend(self.def.iter().copied());
        set.extend(0..self.a_priori);
        set.retain(|r| !self.killed.contains(r));
        set
    }

    fn uses(&mut self, r: u32) {
        if self.def.contains(&r) {
            self.read_after_def.insert(r);
        } else if r >= self.a_priori {
            self.ue.insert(r);
        }
    }

    fn defines(&mut self, r: u32, e: ExprId, ty: Typeref) {
        self.fs_out[r as usize] = ty;
        self.def.insert(r);
        self.generators.insert(r, e);
        self.killed.remove(&r);
        self.read_after_def.remove(&r);
    }

    fn expects_type(&mut self, r: u32, ty: Typeref) {
        if !(self.def.contains(&r) || self.fs_in[r as usize].t == ty.t) {
            self.fs_in[r as usize] = ty;
            self.fs_out[r as usize] = ty;
        }
    }

    fn set_killed(&mut self, r: u32) {
        self.killed.insert(r);
        self.generators.remove(&r);
    }
}

struct Context<'a> {
    cache: &'a TypeCache,
    types: &'a VerifierTypes,
    params: &'a [Typeref],
    activation: TypeId,
    entry: BlockId,
    nregs: usize,
}

impl Context<'_> {
    fn any(&self) -> Typeref {
        self.cache.tref(self.cache.builtins.any)
    }

    fn meet(&self, a: Typeref, b: Typeref) -> Typeref {
        Typeref::new(self.cache.type_meet(a.t, b.t), a.nullable || b.nullable)
    }

    fn local_states(
        &self,
        g: &IrGraph,
        code: &[BlockId],
    ) -> Result<HashMap<BlockId, LocalState>> {
        let mut frame = vec![self.any(); self.nregs];
        frame[..self.params.len()].copy_from_slice(self.params);

        let mut states: HashMap<BlockId, LocalState> = HashMap::new();
        let mut frames: HashMap<BlockId, Vec<Typeref>> = HashMap::new();
        for &b in code {
            if let Some(f) = frames.get(&b) {
                frame = f.clone();
            }
            let state = self.local_state(g, b, &frame)?;
            if let Some(last) = g.last(b) {
                let x = g.expr(last);
                let targets: Vec<EdgeId> = match x.op {
                    Op::LookupSwitch => x.succ.clone(),
                    Op::Jump => x.succ.first().copied().into_iter().collect(),
                    op if op.is_if() => x.succ.get(1).copied().into_iter().collect(),
                    _ => Vec::new(),
                };
                for s in targets {
                    let to = g.edge(s).to;
                    self.check_target(g, to, &state.fs_out, &mut frames);
                }
            }
            frame = state.fs_out.clone();
            states.insert(b, state);
        }

        // round-robin live-out solution
        let mut changed = true;
        while changed {
            changed = false;
            for &b in code {
                let mut next = BTreeSet::new();
                for s in g.all_succ(b) {
                    if let Some(to) = states.get(&g.edge(s).to) {
                        next.extend(to.livein());
                    }
                }
                if let Some(st) = states.get_mut(&b) {
                    let before = st.liveout.len();
                    st.liveout.extend(next);
                    changed |= st.liveout.len() != before;
                }
            }
        }
        Ok(states)
    }

    fn check_target(
        &self,
        g: &IrGraph,
        to: BlockId,
        fs: &[Typeref],
        frames: &mut HashMap<BlockId, Vec<Typeref>>,
    ) {
        match frames.get_mut(&to) {
            None => {
                frames.insert(to, fs.to_vec());
            }
            Some(prev) => {
                let backward = g.block(to).is_backwards_branch_target;
                for (p, &t) in prev.iter_mut().zip(fs) {
                    let merged = self.meet(*p, t);
                    *p = if backward { merged.nullable() } else { merged };
                }
            }
        }
    }

    fn local_state(&self, g: &IrGraph, b: BlockId, frame: &[Typeref]) -> Result<LocalState> {
        let fs_in: Vec<Typeref> = if g.block(b).is_backwards_branch_target {
            frame.iter().map(|t| t.nullable()).collect()
        } else {
            frame.to_vec()
        };
        let mut st = LocalState {
            fs_out: fs_in.clone(),
            fs_in,
            hard: vec![None; frame.len()],
            liveout: BTreeSet::new(),
            killed: BTreeSet::new(),
            def: BTreeSet::new(),
            ue: BTreeSet::new(),
            read_after_def: BTreeSet::new(),
            generators: HashMap::new(),
            a_priori: if b == self.entry {
                self.params.len() as u32
            } else {
                0
            },
        };

        let reg = |e: ExprId, i: usize| -> Result<u32> {
            let x = g.expr(e);
            match x.imm.get(i) {
                Some(&r) if r >= 0 && (r as usize) < frame.len() => Ok(r as u32),
                _ => Err(AbcError::internal(format!("{} uses a register outside the frame", x))),
            }
        };

        for &e in &g.block(b).exprs {
            let x = g.expr(e);
            match x.op {
                Op::GetLocal => st.uses(reg(e, 0)?),
                Op::SetLocal => {
                    let r = reg(e, 0)?;
                    let ty = match x.args.first() {
                        Some(&v) if g.expr(v).op == Op::GetLocal => st.fs_out[reg(v, 0)? as usize],
                        Some(v) => self.types.get(v).copied().unwrap_or_else(|| self.any()),
                        None => self.any(),
                    };
                    st.defines(r, e, ty);
                }
                Op::HasNext2 => {
                    let (obj, idx) = (reg(e, 0)?, reg(e, 1)?);
                    st.uses(obj);
                    st.uses(idx);
                    st.expects_type(obj, self.any());
                    st.expects_type(idx, self.cache.tref(self.cache.builtins.int));
                    st.hard[obj as usize] = Some(self.any());
                    st.defines(obj, e, self.any());
                }
                Op::Kill => st.set_killed(reg(e, 0)?),
                Op::GetSlot | Op::SetSlot => {
                    if let Some(&stem) = x.args.first() {
                        let s = g.expr(stem);
                        if s.op == Op::Arg && (s.imm0() as usize) < frame.len() {
                            let ty = self.types.get(&stem).copied().unwrap_or_else(|| self.any());
                            st.expects_type(s.imm0() as u32, ty);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(st)
    }

    /// Whether a register of type `from` must be coerced to `to` at a join.
    fn needs_coercion(&self, to: Typeref, from: Typeref, backward: bool) -> bool {
        if to == from || self.ignore_type_conflict(to, from) {
            return false;
        }
        let c = self.cache;
        if c.is_numeric(from.t) && c.is_numeric(to.t) {
            return false;
        }
        let any = c.builtins.any;
        let merged = c.type_meet(to.t, from.t);
        if merged == any && !(to.t == any && from.t == any) {
            return true;
        }
        backward || !c.is_machine_compatible(to.t, merged)
    }

    fn ignore_type_conflict(&self, to: Typeref, from: Typeref) -> bool {
        let global = |t: TypeId| self.cache.type_name(t).local_name().starts_with("global");
        (global(to.t) && global(from.t)) || (to.t == self.activation && from.t == self.activation)
    }

    fn fix_constraints(
        &self,
        g: &mut IrGraph,
        b: BlockId,
        mut bc: Constraints,
        state: Option<&LocalState>,
    ) {
        if let Some(state) = state {
            let b_ = self.cache.builtins;
            let in_place: Vec<(u32, ExprId, TypeId)> = bc
                .coercions
                .iter()
                .filter(|(r, t)| {
                    !state.read_after_def.contains(*r) && t.t != b_.void && t.t != b_.null
                })
                .filter_map(|(&r, t)| {
                    let gen = *state.generators.get(&r)?;
                    (g.expr(gen).op == Op::SetLocal).then_some((r, gen, t.t))
                })
                .collect();
            for (r, gen, t) in in_place {
                let (value, at) = match (
                    g.expr(gen).args.first(),
                    g.block(b).exprs.iter().position(|&e| e == gen),
                ) {
                    (Some(&value), Some(at)) => (value, at),
                    _ => continue,
                };
                bc.coercions.remove(&r);
                let cast = self.coerce_expr(g, t, value);
                g.expr_mut(gen).args = vec![cast];
                g.block_mut(b).exprs.insert(at, cast);
                trace!(block = %b, reg = r, "coerce at definition");
            }
        }

        let mut tail = Vec::new();
        for (&r, ty) in &bc.coercions {
            let b_ = self.cache.builtins;
            let value = if ty.t == b_.void {
                g.new_expr(Op::PushUndefined)
            } else if ty.t == b_.null {
                g.new_expr(Op::PushNull)
            } else {
                let get = g.new_expr(Op::GetLocal);
                g.expr_mut(get).imm = vec![r as i32];
                tail.push(get);
                self.coerce_expr(g, ty.t, get)
            };
            tail.push(value);
            let set = g.new_expr(Op::SetLocal);
            let x = g.expr_mut(set);
            x.imm = vec![r as i32];
            x.args = vec![value];
            tail.push(set);
            trace!(block = %b, reg = r, "coerce");
        }
        for &r in &bc.kills {
            let kill = g.new_expr(Op::Kill);
            g.expr_mut(kill).imm = vec![r as i32];
            tail.push(kill);
            trace!(block = %b, reg = r, "kill");
        }

        for e in tail {
            insert_before_terminator(g, b, e);
        }
    }

    fn coerce_expr(&self, g: &mut IrGraph, t: TypeId, a: ExprId) -> ExprId {
        let b = self.cache.builtins;
        let (op, takes_arg) = if t == b.any {
            (Op::CoerceA, true)
        } else if t == b.void {
            (Op::PushUndefined, false)
        } else if t == b.null {
            (Op::PushNull, false)
        } else if t == b.int {
            (Op::ConvertI, true)
        } else if t == b.object {
            (Op::CoerceO, true)
        } else if t == b.string {
            (Op::CoerceS, true)
        } else {
            (Op::Coerce, true)
        };
        let e = g.new_expr(op);
        let x = g.expr_mut(e);
        if takes_arg {
            x.args = vec![a];
        }
        if op == Op::Coerce {
            x.name = Some(self.cache.type_name(t).clone());
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::method;
    use crate::types::Value;

    struct Diamond {
        body: MethodBody,
        left: BlockId,
        right: BlockId,
        left_value: ExprId,
        right_value: ExprId,
    }

    /// `entry: if → left | right; left, right: local2 = …; join: …`.
    fn diamond(cache: &TypeCache, join_reads: bool) -> Diamond {
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (left, right, join) = (g.new_block(), g.new_block(), g.new_block());
        let c = g.push(entry, Op::GetGlobalScope);
        let br = g.push(entry, Op::IfTrue);
        g.expr_mut(br).args = vec![c];
        let e0 = g.new_edge(Some(entry), 0, left);
        let e1 = g.new_edge(Some(entry), 1, right);
        g.expr_mut(br).succ = vec![e0, e1];

        let mut arm = |g: &mut IrGraph, b: BlockId, op: Op| {
            let v = g.push(b, op);
            let set = g.push(b, Op::SetLocal);
            g.expr_mut(set).imm = vec![2];
            g.expr_mut(set).args = vec![v];
            let j = g.push(b, Op::Jump);
            let e = g.new_edge(Some(b), 0, join);
            g.expr_mut(j).succ = vec![e];
            v
        };
        let left_value = arm(&mut g, left, Op::GetGlobalScope);
        let right_value = arm(&mut g, right, Op::PushString);
        g.expr_mut(right_value).value = Some(Value::String("s".into()));

        if join_reads {
            let get = g.push(join, Op::GetLocal);
            g.expr_mut(get).imm = vec![2];
            let ret = g.push(join, Op::ReturnValue);
            g.expr_mut(ret).args = vec![get];
        } else {
            g.push(join, Op::ReturnVoid);
        }

        let body = MethodBody {
            max_stack: 1,
            local_count: 3,
            max_scope: 0,
            init_scope: 0,
            code_len: 0,
            handlers: Vec::new(),
            activation: cache.tref(cache.builtins.any),
            graph: g,
            fixed_locals: HashMap::new(),
            code: Vec::new(),
        };
        Diamond {
            body,
            left,
            right,
            left_value,
            right_value,
        }
    }

    fn ops(g: &IrGraph, b: BlockId) -> Vec<Op> {
        g.block(b).exprs.iter().map(|&e| g.expr(e).op).collect()
    }

    #[test]
    fn dead_register_is_killed_before_a_join() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, 1);
        let mut d = diamond(&cache, false);
        let mut types = VerifierTypes::new();
        types.insert(d.left_value, cache.tref(cache.builtins.any));
        types.insert(d.right_value, cache.tref(cache.builtins.string));

        appease(&mut d.body, &cache, cache.method(m), &types).unwrap();
        let g = &d.body.graph;
        for arm in [d.left, d.right] {
            let got = ops(g, arm);
            assert_eq!(got[got.len() - 2..], [Op::Kill, Op::Jump]);
            let kill = g.block(arm).exprs[got.len() - 2];
            assert_eq!(g.expr(kill).imm, vec![2]);
        }
    }

    #[test]
    fn conflicting_definition_is_coerced_where_it_is_made() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, 1);
        let mut d = diamond(&cache, true);
        let mut types = VerifierTypes::new();
        types.insert(d.left_value, cache.tref(cache.builtins.any));
        types.insert(d.right_value, cache.tref(cache.builtins.string));

        appease(&mut d.body, &cache, cache.method(m), &types).unwrap();
        let g = &d.body.graph;
        assert_eq!(
            ops(g, d.right),
            vec![Op::PushString, Op::CoerceA, Op::SetLocal, Op::Jump]
        );
        assert_eq!(ops(g, d.left), vec![Op::GetGlobalScope, Op::SetLocal, Op::Jump]);
    }

    #[test]
    fn coercion_heuristic() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, 0);
        let b = cache.builtins;
        let params = cache.method(m).params.clone();
        let types = VerifierTypes::new();
        let cx = Context {
            cache: &cache,
            types: &types,
            params: &params,
            activation: b.any,
            entry: BlockId(0),
            nregs: 1,
        };
        let t = |id| cache.tref(id);
        assert!(!cx.needs_coercion(t(b.int), t(b.uint), false));
        assert!(cx.needs_coercion(t(b.any), t(b.string), false));
        assert!(!cx.needs_coercion(t(b.object), t(b.string), false));
        assert!(cx.needs_coercion(t(b.object), t(b.string), true));
        assert!(!cx.needs_coercion(t(b.any), t(b.any).nonnull(), false));
    }
}
