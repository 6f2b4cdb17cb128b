//! Stack-machine instruction → IR expression dispatch.

use super::core::{Cfg, UNSET};
use super::BodyInput;
use crate::abc::constants::ref_argc;
use crate::abc::opcodes::Op;
use crate::abc::parse::ConstantPools;
use crate::abc::reader::Reader;
use crate::error::AbcError;
use crate::ir::types::*;
use crate::types::{MethodId, Name, TypeCache, TypeId, Value};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Per-body decoding state.
pub(super) struct Decoder<'a> {
    pub(super) cfg: Cfg,
    frame: Vec<Option<ExprId>>,
    sp: usize,
    scopep: usize,
    b: BlockId,
    reachable: bool,
    in_catch_block: bool,
    pub(super) handlers: Vec<Handler>,
    pub(super) fixed_locals: HashMap<ExprId, Option<u32>>,
    pools: &'a ConstantPools,
    methods: &'a [MethodId],
    classes: &'a [TypeId],
    strip_debug: bool,
}

impl<'a> Decoder<'a> {
    pub(super) fn new(input: &BodyInput<'a>, handlers: Vec<Handler>) -> Self {
        let local_count = input.local_count as usize;
        let max_scope = input.max_scope as usize;
        let cfg = Cfg::new(local_count, max_scope, input.max_stack as usize);
        let frame = vec![None; cfg.frame_len];
        Decoder {
            cfg,
            frame,
            sp: local_count + max_scope,
            scopep: local_count,
            b: BlockId(0),
            reachable: true,
            in_catch_block: false,
            handlers,
            fixed_locals: HashMap::new(),
            pools: input.pools,
            methods: input.methods,
            classes: input.classes,
            strip_debug: input.strip_debug,
        }
    }

    // ── Frame access ─────────────────────────────────────────────────────────

    fn stack_base(&self) -> usize {
        self.cfg.local_count + self.cfg.max_scope
    }

    fn slot(&self, i: usize) -> Result<ExprId> {
        self.frame
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| AbcError::format(format!("read of undefined frame slot {}", i)))
    }

    fn local(&self, i: usize) -> Result<ExprId> {
        if i >= self.cfg.local_count {
            return Err(AbcError::format(format!(
                "local {} out of range ({} locals)",
                i, self.cfg.local_count
            )));
        }
        self.slot(i)
    }

    fn set_local(&mut self, i: usize, e: ExprId) -> Result<()> {
        if i >= self.cfg.local_count {
            return Err(AbcError::format(format!("local {} out of range", i)));
        }
        self.frame[i] = Some(e);
        Ok(())
    }

    /// The top `n` stack values, oldest first; the stack is unchanged.
    fn peek(&self, n: usize) -> Result<Vec<ExprId>> {
        if self.sp < self.stack_base() + n {
            return Err(AbcError::format("operand stack underflow"));
        }
        (self.sp - n..self.sp).map(|i| self.slot(i)).collect()
    }

    fn pop(&mut self) -> Result<ExprId> {
        let v = self.peek(1)?[0];
        self.sp -= 1;
        Ok(v)
    }

    fn drop_n(&mut self, n: usize) {
        self.sp -= n;
    }

    fn push(&mut self, e: ExprId) -> Result<()> {
        if self.sp + 1 >= self.cfg.frame_len {
            return Err(AbcError::format("operand stack overflow"));
        }
        self.frame[self.sp] = Some(e);
        self.sp += 1;
        Ok(())
    }

    fn replace_top(&mut self, n: usize, e: ExprId) {
        self.frame[self.sp - n] = Some(e);
        self.sp -= n - 1;
    }

    /// The active scope chain, outermost first.
    fn capture_scopes(&self) -> Result<Vec<ExprId>> {
        (self.cfg.local_count..self.scopep).map(|i| self.slot(i)).collect()
    }

    // ── Expression creation ──────────────────────────────────────────────────

    fn emit(&mut self, op: Op) -> ExprId {
        self.cfg.g.push(self.b, op)
    }

    /// New expression taking the top `n` stack values as arguments.
    fn emit_args(&mut self, op: Op, n: usize) -> Result<ExprId> {
        let args = self.peek(n)?;
        let e = self.emit(op);
        self.cfg.g.expr_mut(e).args = args;
        Ok(e)
    }

    fn emit_const(&mut self, op: Op, v: Value) -> Result<()> {
        let e = self.emit(op);
        self.cfg.g.expr_mut(e).value = Some(v);
        self.push(e)
    }

    fn set_name(&mut self, e: ExprId, name: Name) {
        self.cfg.g.expr_mut(e).name = Some(name);
    }

    fn method_ref(&self, id: u32) -> Result<MethodId> {
        self.methods
            .get(id as usize)
            .copied()
            .ok_or_else(|| AbcError::format(format!("method index {} out of range", id)))
    }

    fn class_ref(&self, id: u32) -> Result<TypeId> {
        self.classes
            .get(id as usize)
            .copied()
            .ok_or_else(|| AbcError::format(format!("class index {} out of range", id)))
    }

    fn branch_target(&self, p: &Reader, offset: i32, len: usize) -> Result<usize> {
        let target = p.pos as i64 + offset as i64;
        if target < 0 || target as usize > len {
            return Err(AbcError::format(format!("branch target {} out of range", target)));
        }
        Ok(target as usize)
    }

    fn switch_target(&self, base: usize, offset: i32, len: usize) -> Result<usize> {
        let target = base as i64 + offset as i64;
        if target < 0 || target as usize > len {
            return Err(AbcError::format(format!("switch target {} out of range", target)));
        }
        Ok(target as usize)
    }

    fn new_edge(&mut self, label: u32) -> EdgeId {
        self.cfg.g.new_edge(Some(self.b), label, UNSET)
    }

    fn merge(&mut self, edge: Option<EdgeId>, pos: usize) -> Result<()> {
        self.cfg.merge(edge, pos, &self.frame, self.sp, self.scopep)
    }

    /// Route an exception edge through the handler block, creating it (an
    /// `xarg` plus a jump to the catch target) on first use.
    fn xmerge(&mut self, edge: EdgeId, handler: usize) -> Result<()> {
        let scopep = self.cfg.local_count;
        let sp = scopep + self.cfg.max_scope;
        let target = self.handlers[handler].target as usize;
        match self.handlers[handler].entry {
            None => {
                let hb = self.cfg.create_block(Some(edge), &self.frame, sp, scopep);
                self.handlers[handler].entry = Some(hb);
                let xarg = self.cfg.g.push(hb, Op::XArg);
                self.cfg.g.expr_mut(xarg).imm = vec![handler as i32];
                let jump = self.cfg.g.push(hb, Op::Jump);
                let je = self.cfg.g.new_edge(Some(hb), 0, UNSET);
                self.cfg.g.expr_mut(jump).succ = vec![je];

                // The catch target starts from the handler block's own state.
                let mut hframe = match self.cfg.states.get(&hb) {
                    Some(s) => s.frame.clone(),
                    None => return Err(AbcError::internal("handler block has no state")),
                };
                hframe[sp] = Some(xarg);
                self.cfg.merge(Some(je), target, &hframe, sp + 1, scopep)
            }
            Some(entry) => {
                self.cfg.g.edge_mut(edge).to = entry;
                self.cfg.merge_frame_states(edge, &self.frame, sp, scopep)
            }
        }
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    /// Seed the entry block with one `arg` per parameter and local.
    pub(super) fn enter(&mut self, input: &BodyInput<'_>, cache: &TypeCache) -> Result<()> {
        let m = cache.method(input.method);
        // The entry block is never a merge target, so it needs no saved state.
        self.b = self.cfg.g.entry_block();

        let local_count = self.cfg.local_count;
        let mut names: Vec<Name> = Vec::new();
        for i in 0..m.params.len() {
            names.push(if i == 0 {
                Name::public("this")
            } else if let Some(n) = m.param_names.as_ref().and_then(|p| p.get(i)) {
                n.clone()
            } else {
                Name::public(format!("arg{}", i))
            });
        }
        if m.needs_arguments() || m.needs_rest() {
            names.push(Name::public(if m.needs_arguments() { "arguments" } else { "rest" }));
        }
        if names.len() > local_count {
            return Err(AbcError::format(format!(
                "{} parameters but only {} locals",
                names.len(),
                local_count
            )));
        }
        for i in names.len()..local_count {
            names.push(Name::public(format!("local{}", i)));
        }
        for (i, name) in names.into_iter().enumerate() {
            let e = self.emit(Op::Arg);
            let x = self.cfg.g.expr_mut(e);
            x.imm = vec![i as i32];
            x.name = Some(name);
            self.frame[i] = Some(e);
        }

        if !self.handlers.is_empty() {
            let this = self.slot(0)?;
            self.fixed_locals.insert(this, None);
        }
        Ok(())
    }

    pub(super) fn run(&mut self, code: &[u8]) -> Result<()> {
        let mut try_labels = HashSet::new();
        let mut catch_labels = HashSet::new();
        for h in &self.handlers {
            try_labels.insert(h.from as usize);
            try_labels.insert(h.to as usize);
            catch_labels.insert(h.target as usize);
        }
        let mut handled = HashSet::new();

        let mut p = Reader::new(code);
        while p.pos < code.len() {
            let pos = p.pos;
            let byte = p.read_u8()?;
            let op = Op::from_byte(byte).ok_or_else(|| {
                AbcError::format(format!("unknown opcode 0x{:02x} at offset {}", byte, pos))
            })?;

            if op == Op::Label
                || self.cfg.blocks.contains_key(&pos)
                || try_labels.contains(&pos)
                || catch_labels.contains(&pos)
            {
                self.start_block(pos, catch_labels.contains(&pos))?;
            }

            if !self.handlers.is_empty() && handled.insert(self.b) {
                let mut xsucc = Vec::new();
                for j in 0..self.handlers.len() {
                    let h = &self.handlers[j];
                    if pos >= h.from as usize && pos < h.to as usize {
                        let edge = self.cfg.g.new_xedge(self.b, j as u32, UNSET);
                        self.xmerge(edge, j)?;
                        xsucc.push(edge);
                    }
                }
                self.cfg.g.block_mut(self.b).xsucc = xsucc;
            }

            trace!(offset = pos, %op, sp = self.sp, scopep = self.scopep, "decode");
            self.translate(op, &mut p, pos, code.len())
                .with_context(|| format!("decoding {} at offset {}", op, pos))?;
        }
        Ok(())
    }

    /// Switch decoding to the block starting at `pos`, closing the current
    /// one with a fall-through edge if control can reach it.
    fn start_block(&mut self, pos: usize, in_catch: bool) -> Result<()> {
        self.in_catch_block = in_catch;
        let mut edge = None;
        if self.reachable {
            let succ = self.cfg.g.succ(self.b).to_vec();
            edge = Some(match succ.first() {
                Some(&e) => e,
                None => {
                    let j = self.emit(Op::Jump);
                    let e = self.new_edge(0);
                    self.cfg.g.expr_mut(j).succ = vec![e];
                    e
                }
            });
        }

        // A catch target's state was set up by its handler block.
        if !in_catch || !self.cfg.blocks.contains_key(&pos) {
            self.merge(edge, pos)?;
        } else if let Some(edge) = edge {
            // falling into a catch block from its try body
            self.cfg.g.edge_mut(edge).to = self.cfg.blocks[&pos];
            self.cfg
                .merge_frame_states(edge, &self.frame, self.sp, self.scopep)?;
        }

        self.b = self.cfg.blocks[&pos];
        let state = self
            .cfg
            .states
            .get(&self.b)
            .ok_or_else(|| AbcError::internal(format!("no saved state for {}", self.b)))?;
        self.frame.copy_from_slice(&state.frame);
        self.sp = state.sp;
        self.scopep = state.scopep;
        self.reachable = true;
        Ok(())
    }

    fn translate(&mut self, op: Op, p: &mut Reader, pos: usize, len: usize) -> Result<()> {
        use Op::*;
        match op {
            Label | Nop => {}

            Throw | ReturnValue => {
                self.emit_args(op, 1)?;
                self.drop_n(1);
                self.reachable = false;
                self.merge(None, p.pos)?;
            }

            ReturnVoid => {
                self.emit(op);
                self.reachable = false;
                self.merge(None, p.pos)?;
            }

            DxnsLate => {
                self.emit_args(op, 1)?;
                self.drop_n(1);
            }

            PushWith | PushScope => {
                let e = self.emit_args(op, 1)?;
                self.drop_n(1);
                if self.scopep >= self.stack_base() {
                    return Err(AbcError::format("scope stack overflow"));
                }
                self.frame[self.scopep] = Some(e);
                self.scopep += 1;

                // An activation restored in a catch block is live across
                // regions the verifier sees differently; pin it to a local.
                if self.in_catch_block {
                    let mut a = self.cfg.g.expr(e).args[0];
                    while self.cfg.g.expr(a).op == Phi {
                        match self.cfg.g.expr(a).args.first() {
                            Some(&x) => a = x,
                            None => break,
                        }
                    }
                    if self.cfg.g.expr(a).op == NewActivation {
                        self.fixed_locals.insert(a, None);
                    }
                }
            }

            PopScope => {
                if self.scopep <= self.cfg.local_count {
                    return Err(AbcError::format("scope stack underflow"));
                }
                self.scopep -= 1;
                let s = self.slot(self.scopep)?;
                let e = self.emit(op);
                self.cfg.g.expr_mut(e).scopes = vec![s];
                self.frame[self.scopep] = None;
            }

            NextName | HasNext | NextValue => {
                let e = self.emit_args(op, 2)?;
                self.replace_top(2, e);
            }

            PushNull => self.emit_const(op, Value::Null)?,
            PushUndefined => self.emit_const(op, Value::Undefined)?,
            PushTrue => self.emit_const(op, Value::Bool(true))?,
            PushFalse => self.emit_const(op, Value::Bool(false))?,
            PushNan => self.emit_const(op, Value::Double(f64::NAN))?,
            PushByte => {
                let v = p.read_u8()? as i8 as i32;
                self.emit_const(op, Value::Int(v))?;
            }
            PushShort => {
                let v = p.read_u30()? as i16 as i32;
                self.emit_const(op, Value::Int(v))?;
            }
            PushString => {
                let s = self.pools.string(p.read_u30()?)?.to_string();
                self.emit_const(op, Value::String(s))?;
            }
            PushInt => {
                let v = self.pools.int(p.read_u30()?)?;
                self.emit_const(op, Value::Int(v))?;
            }
            PushUint => {
                let v = self.pools.uint(p.read_u30()?)?;
                self.emit_const(op, Value::Uint(v))?;
            }
            PushDouble => {
                let v = self.pools.double(p.read_u30()?)?;
                self.emit_const(op, Value::Double(v))?;
            }
            PushNamespace => {
                let ns = self.pools.namespace(p.read_u30()?)?.clone();
                self.emit_const(op, Value::Namespace(ns))?;
            }

            NewActivation => {
                let e = self.emit(op);
                self.push(e)?;
            }

            GetGlobalScope => {
                let scopes = self.capture_scopes()?;
                let e = self.emit(op);
                self.cfg.g.expr_mut(e).scopes = scopes;
                self.push(e)?;
            }

            GetScopeObject => {
                let depth = p.read_u8()?;
                let idx = self.cfg.local_count + depth as usize;
                if idx >= self.scopep {
                    return Err(AbcError::format("getscopeobject index beyond scope depth"));
                }
                let s = self.slot(idx)?;
                let e = self.emit(op);
                let x = self.cfg.g.expr_mut(e);
                x.scopes = vec![s];
                x.imm = vec![depth as i32];
                self.push(e)?;
            }

            Pop => {
                self.pop()?;
            }

            Dup => {
                let top = self.peek(1)?[0];
                self.push(top)?;
            }

            Swap => {
                self.peek(2)?;
                self.frame.swap(self.sp - 1, self.sp - 2);
            }

            ConvertS | EscXelem | EscXattr | ConvertI | ConvertU | ConvertD | CoerceS | Negate
            | Increment | Decrement | Not | BitNot | IncrementI | DecrementI | NegateI | CoerceO
            | ConvertO | TypeOf | ConvertB | CoerceA => {
                let e = self.emit_args(op, 1)?;
                self.replace_top(1, e);
            }

            CheckFilter => {
                self.emit_args(op, 1)?;
            }

            AsTypeLate | Add | Subtract | Multiply | Divide | Modulo | LShift | RShift | URShift
            | BitAnd | BitOr | BitXor | Equals | LessThan | LessEquals | GreaterThan
            | GreaterEquals | InstanceOf | In | AddI | SubtractI | MultiplyI | IsTypeLate
            | StrictEquals => {
                let e = self.emit_args(op, 2)?;
                self.replace_top(2, e);
            }

            GetLocal0 | GetLocal1 | GetLocal2 | GetLocal3 => {
                let i = (op.byte().unwrap_or(0) - 0xD0) as usize;
                let v = self.local(i)?;
                self.push(v)?;
            }

            SetLocal0 | SetLocal1 | SetLocal2 | SetLocal3 => {
                let i = (op.byte().unwrap_or(0) - 0xD4) as usize;
                let v = self.pop()?;
                self.set_local(i, v)?;
            }

            GetLocal => {
                let i = p.read_index()?;
                let v = self.local(i)?;
                self.push(v)?;
            }

            SetLocal => {
                let i = p.read_index()?;
                let v = self.pop()?;
                self.set_local(i, v)?;
            }

            Kill => {
                let i = p.read_index()?;
                let e = self.emit(PushUndefined);
                self.cfg.g.expr_mut(e).value = Some(Value::Undefined);
                self.set_local(i, e)?;
            }

            Coerce | AsType | IsType => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                let e = self.emit_args(op, 1)?;
                self.set_name(e, name);
                self.replace_top(1, e);
            }

            Dxns => {
                let s = self.pools.string(p.read_u30()?)?.to_string();
                let e = self.emit(op);
                self.cfg.g.expr_mut(e).value = Some(Value::String(s));
            }

            IncLocal | IncLocalI | DecLocal | DecLocalI => {
                let i = p.read_index()?;
                let new_op = match op {
                    IncLocalI => IncrementI,
                    IncLocal => Increment,
                    DecLocalI => DecrementI,
                    _ => Decrement,
                };
                let a = self.local(i)?;
                let e = self.emit(new_op);
                let x = self.cfg.g.expr_mut(e);
                x.imm = vec![i as i32];
                x.args = vec![a];
                self.set_local(i, e)?;
            }

            NewFunction => {
                let m = self.method_ref(p.read_u30()?)?;
                let scopes = self.capture_scopes()?;
                let e = self.emit(op);
                let x = self.cfg.g.expr_mut(e);
                x.method = Some(m);
                x.scopes = scopes;
                self.push(e)?;
            }

            NewClass => {
                let c = self.class_ref(p.read_u30()?)?;
                let scopes = self.capture_scopes()?;
                let e = self.emit_args(op, 1)?;
                let x = self.cfg.g.expr_mut(e);
                x.scopes = scopes;
                x.class = Some(c);
                self.replace_top(1, e);
            }

            NewObject | NewArray => {
                let n = p.read_index()?;
                let argc = if op == NewObject { 2 * n } else { n };
                let e = self.emit_args(op, argc)?;
                self.drop_n(argc);
                self.push(e)?;
            }

            NewCatch => {
                let h = p.read_u30()?;
                if h as usize >= self.handlers.len() {
                    return Err(AbcError::format(format!("newcatch {} has no handler", h)));
                }
                let e = self.emit(op);
                self.cfg.g.expr_mut(e).imm = vec![h as i32];
                self.push(e)?;
            }

            GetSuper | GetDescendants | DelDescendants | DeleteProperty | GetProperty => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                let argc = 1 + ref_argc(name.kind);
                self.call_like(op, Some(name), argc, true)?;
            }

            SetSuper | SetProperty | InitProperty => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                let argc = 2 + ref_argc(name.kind);
                self.call_like(op, Some(name), argc, false)?;
            }

            Call => {
                let argc = 2 + p.read_index()?;
                self.call_like(op, None, argc, true)?;
            }

            Construct | ApplyType => {
                let argc = 1 + p.read_index()?;
                self.call_like(op, None, argc, true)?;
            }

            ConstructSuper => {
                let argc = 1 + p.read_index()?;
                self.call_like(op, None, argc, false)?;
            }

            GetLex => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                if ref_argc(name.kind) != 0 {
                    return Err(AbcError::format("getlex with a runtime name"));
                }
                let scopes = self.capture_scopes()?;
                let f = self.emit(FindPropStrict);
                let x = self.cfg.g.expr_mut(f);
                x.name = Some(name.clone());
                x.scopes = scopes;
                let e = self.emit(GetProperty);
                let x = self.cfg.g.expr_mut(e);
                x.name = Some(name);
                x.args = vec![f];
                self.push(e)?;
            }

            FindPropStrict | FindProperty => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                let argc = ref_argc(name.kind);
                let scopes = self.capture_scopes()?;
                let e = self.call_like(op, Some(name), argc, true)?;
                self.cfg.g.expr_mut(e).scopes = scopes;
            }

            FindDef => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                let argc = ref_argc(name.kind);
                self.call_like(op, Some(name), argc, true)?;
            }

            GetSlot => {
                let slot = p.read_u30()?;
                let e = self.emit_args(op, 1)?;
                self.cfg.g.expr_mut(e).imm = vec![slot as i32];
                self.replace_top(1, e);
            }

            SetSlot => {
                let slot = p.read_u30()?;
                let e = self.emit_args(op, 2)?;
                self.cfg.g.expr_mut(e).imm = vec![slot as i32];
                self.drop_n(2);
            }

            Jump => {
                let offset = p.read_s24()?;
                let target = self.branch_target(p, offset, len)?;
                if self.reachable {
                    let e = self.emit(op);
                    let edge = self.new_edge(0);
                    self.cfg.g.expr_mut(e).succ = vec![edge];
                    self.merge(None, p.pos)?;
                    self.merge(Some(edge), target)?;
                    self.reachable = false;
                }
            }

            IfTrue | IfFalse => {
                let e = self.emit_args(op, 1)?;
                self.drop_n(1);
                let offset = p.read_s24()?;
                let target = self.branch_target(p, offset, len)?;
                self.branch(e, p.pos, target)?;
            }

            IfNlt | IfNle | IfNgt | IfNge | IfNe | IfStrictNe | IfEq | IfLt | IfLe | IfGt
            | IfGe | IfStrictEq => {
                let cmp_op = op
                    .if_operator()
                    .ok_or_else(|| AbcError::internal("branch without compare"))?;
                let cmp = self.emit_args(cmp_op, 2)?;
                let sense = match op {
                    IfNlt | IfNle | IfNgt | IfNge | IfNe | IfStrictNe => IfFalse,
                    _ => IfTrue,
                };
                let e = self.emit(sense);
                self.cfg.g.expr_mut(e).args = vec![cmp];
                let offset = p.read_s24()?;
                self.drop_n(2);
                let target = self.branch_target(p, offset, len)?;
                self.branch(e, p.pos, target)?;
            }

            LookupSwitch => {
                let e = self.emit_args(op, 1)?;
                self.drop_n(1);
                let default = self.switch_target(pos, p.read_s24()?, len)?;
                let case_count = 1 + p.read_index()?;
                let mut succ = Vec::with_capacity(case_count + 1);
                let mut targets = Vec::with_capacity(case_count);
                for _ in 0..case_count {
                    targets.push(self.switch_target(pos, p.read_s24()?, len)?);
                }
                let default_edge = self.new_edge(case_count as u32);
                self.merge(Some(default_edge), default)?;
                for (i, &t) in targets.iter().enumerate() {
                    let edge = self.new_edge(i as u32);
                    self.merge(Some(edge), t)?;
                    succ.push(edge);
                }
                succ.push(default_edge);
                self.cfg.g.expr_mut(e).succ = succ;
                self.reachable = false;
                self.merge(None, p.pos)?;
            }

            HasNext2 => {
                let oloc = p.read_index()?;
                let iloc = p.read_index()?;
                let obj = self.local(oloc)?;
                let index = self.local(iloc)?;
                let e = self.emit(op);
                self.cfg.g.expr_mut(e).locals = vec![obj, index];
                let o = self.emit(HasNext2O);
                self.cfg.g.expr_mut(o).locals = vec![obj];
                self.set_local(oloc, o)?;
                let i = self.emit(HasNext2I);
                self.cfg.g.expr_mut(i).locals = vec![index];
                self.set_local(iloc, i)?;
                self.push(e)?;
                self.cfg.g.block_mut(self.b).must_isolate = true;
            }

            CallMethod => {
                let id = p.read_u30()?;
                let argc = 1 + p.read_index()?;
                let e = self.call_like(op, None, argc, true)?;
                self.cfg.g.expr_mut(e).imm = vec![id as i32];
            }

            CallStatic => {
                let m = self.method_ref(p.read_u30()?)?;
                let argc = 1 + p.read_index()?;
                let e = self.call_like(op, None, argc, true)?;
                self.cfg.g.expr_mut(e).method = Some(m);
            }

            CallSuper | CallProperty | ConstructProp | CallPropLex | CallSuperVoid
            | CallPropVoid => {
                let name = self.pools.name(p.read_u30()?)?.clone();
                let argc = 1 + p.read_index()? + ref_argc(name.kind);
                let pushes = !matches!(op, CallSuperVoid | CallPropVoid);
                self.call_like(op, Some(name), argc, pushes)?;
            }

            DebugFile => {
                let s = self.pools.string(p.read_u30()?)?.to_string();
                if !self.strip_debug {
                    let e = self.emit(op);
                    self.cfg.g.expr_mut(e).value = Some(Value::String(s));
                }
            }

            DebugLine | BkptLine => {
                let line = p.read_u30()?;
                if !self.strip_debug {
                    let e = self.emit(op);
                    self.cfg.g.expr_mut(e).imm = vec![line as i32];
                }
            }

            Debug => {
                let kind = p.read_u8()?;
                let name = p.read_u30()?;
                let reg = p.read_u8()?;
                let extra = p.read_u30()?;
                if !self.strip_debug {
                    let s = self.pools.string(name)?.to_string();
                    let e = self.emit(op);
                    let x = self.cfg.g.expr_mut(e);
                    x.imm = vec![kind as i32, name as i32, reg as i32, extra as i32];
                    x.value = Some(Value::String(s));
                }
            }

            Bkpt => {
                if !self.strip_debug {
                    self.emit(op);
                }
            }

            Timestamp => {
                self.emit(op);
            }

            Phi | Arg | XArg | HasNext2O | HasNext2I => {
                return Err(AbcError::internal(format!("{} has no encoding", op)));
            }
        }
        Ok(())
    }

    /// Shared shape of calls and property access: `argc` stack operands,
    /// an optional name, and an optional pushed result.
    fn call_like(
        &mut self,
        op: Op,
        name: Option<Name>,
        argc: usize,
        pushes: bool,
    ) -> Result<ExprId> {
        let e = self.emit_args(op, argc)?;
        self.cfg.g.expr_mut(e).name = name;
        self.drop_n(argc);
        if pushes {
            self.push(e)?;
        }
        Ok(e)
    }

    /// Conditional branch: `succ[0]` falls through to `next`, `succ[1]`
    /// jumps to `target`.
    fn branch(&mut self, e: ExprId, next: usize, target: usize) -> Result<()> {
        let fall = self.new_edge(0);
        let taken = self.new_edge(1);
        self.cfg.g.expr_mut(e).succ = vec![fall, taken];
        self.merge(None, next)?;
        self.merge(Some(taken), target)
    }
}
