//! Per-expression value and type evaluation.
//!
//! One rule table serves two clients. SCCP ([`Mode::Sccp`]) wants the
//! tightest type and constant it can prove; cast insertion
//! ([`Mode::Verify`]) wants the type the bytecode verifier will assign,
//! which is coarser in a few places (method closures, `construct`,
//! coercions keep their operand's nullability). Phis are merged by the
//! callers, since the two disagree on which inputs count.

use super::lattice::{self, Lattice};
use super::utils::{find_inner, find_outer};
use crate::abc::Op;
use crate::ir::{EdgeId, Expr, ExprId, Handler, IrGraph};
use crate::types::{Binding, MethodId, Name, TypeCache, TypeId, Typeref, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sccp,
    Verify,
}

/// What is known about each expression so far.
#[derive(Debug, Default, Clone)]
pub struct Facts {
    pub values: HashMap<ExprId, Lattice>,
    pub types: HashMap<ExprId, Typeref>,
}

/// Result of evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// An operand is not known yet.
    Unknown,
    /// The expression produces no value.
    Nothing,
    Value(Lattice, Typeref),
    /// Successor edges a terminator can take.
    Flow(Vec<EdgeId>),
}

/// Method-wide inputs to evaluation.
pub struct Env<'a> {
    pub cache: &'a TypeCache,
    pub method: MethodId,
    pub handlers: &'a [Handler],
    pub activation: Typeref,
    /// Scope types captured by the method's context; `None` when the
    /// context was never reached from a script initializer.
    pub outer: Option<&'a [Typeref]>,
    pub mode: Mode,
}

impl Env<'_> {
    fn any(&self) -> Typeref {
        self.cache.tref(self.cache.builtins.any)
    }

    fn nonnull(&self, t: TypeId) -> Typeref {
        self.cache.tref(t).nonnull()
    }

    fn is_void_or_null(&self, t: Typeref) -> bool {
        let b = &self.cache.builtins;
        t.t == b.void || t.t == b.null
    }

    fn returns(&self, m: Option<MethodId>) -> Typeref {
        m.map_or_else(|| self.any(), |m| self.cache.method(m).returns)
    }

    pub fn eval(&self, g: &IrGraph, e: ExprId, facts: &Facts) -> Outcome {
        let x = g.expr(e);
        let known = |a: &ExprId| match self.mode {
            Mode::Sccp => facts.values.contains_key(a),
            Mode::Verify => facts.types.contains_key(a),
        };
        if !x.operands().all(|a| known(&a)) {
            return Outcome::Unknown;
        }
        let val = |a: ExprId| facts.values.get(&a).cloned().unwrap_or(Lattice::Bottom);
        let ty = |a: ExprId| facts.types.get(&a).copied().unwrap_or_else(|| self.any());

        if x.is_terminator() {
            return self.flow(x, val);
        }
        let op = x.op;
        if !(op.on_stack() || op.in_local() || op.on_scope()) {
            return Outcome::Nothing;
        }

        let b = self.cache.builtins;
        let cache = self.cache;
        let verify = self.mode == Mode::Verify;
        let arg = |i: usize| x.args.get(i).copied();
        let (v0, t0) = match arg(0) {
            Some(a) => (val(a), ty(a)),
            None => (Lattice::Bottom, self.any()),
        };
        let v1 = arg(1).map_or(Lattice::Bottom, val);
        let t1 = arg(1).map_or_else(|| self.any(), ty);
        let bottom = Lattice::Bottom;

        use Op::*;
        let (v, t) = match op {
            Dup => match x.locals.first() {
                Some(&a) => (val(a), ty(a)),
                None => (bottom, self.any()),
            },
            ConvertO => (v0, if verify { t0 } else { t0.nonnull() }),
            EscXelem | EscXattr => (bottom, self.nonnull(b.string)),
            NewCatch => {
                let h = self.handlers.get(x.imm0() as usize);
                (bottom, h.map_or_else(|| self.any(), |h| h.activation))
            }
            NewObject => (bottom, self.nonnull(b.object)),
            NewArray => (bottom, self.nonnull(b.array)),
            NewActivation => (bottom, self.activation),
            GetGlobalScope => match self.outer.and_then(|o| o.first()) {
                Some(&s) => (bottom, s),
                None => match x.scopes.first() {
                    Some(&s) => (val(s), ty(s)),
                    None => (bottom, self.any()),
                },
            },
            GetScopeObject => match x.scopes.first() {
                Some(&s) => (val(s), ty(s)),
                None => (bottom, self.any()),
            },
            NewClass => match x.class {
                Some(c) => (bottom, self.nonnull(c)),
                None => (bottom, self.any()),
            },
            NewFunction => (bottom, self.nonnull(b.function)),
            FindDef => {
                let t = x.name.as_ref().and_then(|n| cache.global(n));
                (bottom, t.unwrap_or_else(|| self.any()))
            }
            FindPropStrict | FindProperty => self.find_scope(x, facts),
            GetLex => {
                let (_, scope) = self.find_scope(x, facts);
                self.get_binding(scope, x.name.as_ref())
            }
            GetProperty if x.args.len() == 1 => self.get_binding(t0, x.name.as_ref()),
            GetSlot => match cache.find_slot(t0.t, x.imm0() as u32) {
                Some(s) => (bottom, s.ty),
                None => (bottom, self.any()),
            },
            Construct => {
                if verify {
                    let it = cache.ty(t0.t).itype.unwrap_or(t0.t);
                    (bottom, self.nonnull(it))
                } else {
                    (bottom, self.nonnull(b.object))
                }
            }
            ConstructProp => {
                let it = self
                    .binding(t0, x.name.as_ref())
                    .filter(|s| s.is_slot())
                    .and_then(|s| cache.ty(s.ty.t).itype);
                match it {
                    Some(it) => (bottom, self.nonnull(it)),
                    None => (bottom, self.any()),
                }
            }
            CallProperty | CallPropLex => self.call_binding(x, t0, &v1),
            CallSuper if verify => {
                let base = self
                    .cache
                    .method(self.method)
                    .cx
                    .and_then(|c| cache.ty(c).base);
                let found = base.and_then(|bt| x.name.as_ref().and_then(|n| cache.find_get(bt, n)));
                match found {
                    Some(s) if s.is_method() => (bottom, self.returns(s.method)),
                    _ => (bottom, self.any()),
                }
            }
            ApplyType => (bottom, t0.nonnull()),
            CallStatic => (bottom, self.returns(x.method)),
            Arg => (bottom, self.arg_type(x.imm0() as usize)),
            XArg => {
                let h = self.handlers.get(x.imm0() as usize);
                (bottom, h.map_or_else(|| self.any(), |h| h.ty))
            }
            HasNext2I => (bottom, cache.tref(b.int)),
            PushByte | PushShort | PushInt => (self.literal(x), cache.tref(b.int)),
            PushUint => (self.literal(x), cache.tref(b.uint)),
            PushDouble => (self.literal(x), cache.tref(b.number)),
            PushNan => (Lattice::Const(Value::Double(f64::NAN)), cache.tref(b.number)),
            PushString => (self.literal(x), self.nonnull(b.string)),
            PushNamespace => (self.literal(x), self.nonnull(b.namespace)),
            PushTrue => (Lattice::Const(Value::Bool(true)), cache.tref(b.boolean)),
            PushFalse => (Lattice::Const(Value::Bool(false)), cache.tref(b.boolean)),
            PushNull => (Lattice::Const(Value::Null), cache.tref(b.null)),
            PushUndefined => (Lattice::Const(Value::Undefined), cache.tref(b.void)),
            PushScope | PushWith => (v0, t0.nonnull()),
            ConvertB => (lattice::convert_b(&v0), cache.tref(b.boolean)),
            Not => (lattice::not(&v0), cache.tref(b.boolean)),
            DeleteProperty | DelDescendants | HasNext | HasNext2 | In | IsType | IsTypeLate
            | InstanceOf => (bottom, cache.tref(b.boolean)),
            Equals => (lattice::equality(false, &v0, &v1), cache.tref(b.boolean)),
            StrictEquals => (lattice::equality(true, &v0, &v1), cache.tref(b.boolean)),
            LessThan | LessEquals | GreaterThan | GreaterEquals => {
                (lattice::relational(op, &v0, &v1), cache.tref(b.boolean))
            }
            ConvertS => (lattice::convert_s(&v0), self.nonnull(b.string)),
            CoerceS => self.coerce_s(&v0, t0),
            ConvertI => (lattice::convert_i(&v0), cache.tref(b.int)),
            ConvertU => (lattice::convert_u(&v0), cache.tref(b.uint)),
            ConvertD => (lattice::convert_d(&v0), cache.tref(b.number)),
            CoerceO => self.coerce_o(&v0, t0),
            CoerceA => {
                if verify {
                    (bottom, Typeref::new(b.any, t0.nullable))
                } else if t0.t != b.void {
                    (v0, t0)
                } else {
                    (bottom, self.any())
                }
            }
            Coerce => self.coerce(x.name.as_ref(), &v0, t0),
            AsType => match x.name.as_ref().and_then(|n| cache.named(n)) {
                Some(target) => {
                    let keep = verify
                        && cache.extends_or_is(t0.t, target)
                        && cache.is_atom(t0.t) == cache.is_atom(target);
                    (bottom, if keep { t0 } else { cache.tref(target) })
                }
                None => (bottom, self.any()),
            },
            AsTypeLate => match cache.ty(t1.t).itype {
                Some(it) if cache.is_atom(it) || cache.is_numeric(it) => {
                    (bottom, cache.tref(b.object))
                }
                Some(it) => (bottom, cache.tref(it)),
                None => (bottom, self.any()),
            },
            TypeOf => (self.type_of(t0), self.nonnull(b.string)),
            Add => {
                let is_string = |t: Typeref| t.t == b.string && !t.nullable;
                let t = if is_string(t0) || is_string(t1) {
                    self.nonnull(b.string)
                } else if cache.is_numeric(t0.t) && cache.is_numeric(t1.t) {
                    cache.tref(b.number)
                } else {
                    self.nonnull(b.object)
                };
                let v = lattice::add(&v0, &v1);
                let t = match v.value() {
                    Some(Value::String(_)) => self.nonnull(b.string),
                    _ => t,
                };
                (v, t)
            }
            Subtract | Multiply | Divide | Modulo => {
                (lattice::binary(op, &v0, &v1), cache.tref(b.number))
            }
            Negate | Increment | Decrement => (lattice::unary(op, &v0), cache.tref(b.number)),
            AddI | SubtractI | MultiplyI | BitAnd | BitOr | BitXor | LShift | RShift => {
                (lattice::binary(op, &v0, &v1), cache.tref(b.int))
            }
            NegateI | IncrementI | DecrementI | BitNot => {
                (lattice::unary(op, &v0), cache.tref(b.int))
            }
            URShift => (lattice::binary(op, &v0, &v1), cache.tref(b.uint)),
            _ => (bottom, self.any()),
        };
        Outcome::Value(self.pin(v, t), t)
    }

    /// Void and null types each hold exactly one value.
    pub fn pin(&self, v: Lattice, t: Typeref) -> Lattice {
        let b = &self.cache.builtins;
        if self.mode == Mode::Verify {
            v
        } else if t.t == b.void {
            Lattice::Const(Value::Undefined)
        } else if t.t == b.null {
            Lattice::Const(Value::Null)
        } else {
            v
        }
    }

    fn flow(&self, x: &Expr, val: impl Fn(ExprId) -> Lattice) -> Outcome {
        let all = || Outcome::Flow(x.succ.clone());
        match x.op {
            Op::Jump => Outcome::Flow(x.succ.clone()),
            Op::IfTrue | Op::IfFalse if x.args.len() == 1 && x.succ.len() == 2 => {
                match x.args.first().map_or(Lattice::Bottom, |&a| val(a)) {
                    Lattice::Const(v) => {
                        let taken = v.to_boolean() == (x.op == Op::IfTrue);
                        Outcome::Flow(vec![x.succ[usize::from(taken)]])
                    }
                    Lattice::Bottom => all(),
                }
            }
            Op::LookupSwitch if !x.succ.is_empty() => {
                let cases = x.succ.len() - 1;
                match x.args.first().and_then(|&a| val(a).number()) {
                    Some(d) if d.fract() == 0.0 && d >= 0.0 && d < cases as f64 => {
                        Outcome::Flow(vec![x.succ[d as usize]])
                    }
                    Some(d) if d.is_finite() && d.fract() == 0.0 => {
                        Outcome::Flow(vec![x.succ[cases]])
                    }
                    _ => all(),
                }
            }
            _ if x.succ.is_empty() => Outcome::Nothing,
            _ => all(),
        }
    }

    fn literal(&self, x: &Expr) -> Lattice {
        x.value.clone().into()
    }

    /// Type of the `i`th local on entry.
    fn arg_type(&self, i: usize) -> Typeref {
        let m = self.cache.method(self.method);
        let b = &self.cache.builtins;
        if i < m.params.len() {
            m.params[i]
        } else if i == m.params.len() && (m.needs_arguments() || m.needs_rest()) {
            self.nonnull(b.array)
        } else {
            self.cache.tref(b.void)
        }
    }

    fn binding(&self, recv: Typeref, name: Option<&Name>) -> Option<&Binding> {
        self.cache.find_get(recv.t, name?)
    }

    /// The object a `findprop*`/`getlex` resolves against.
    fn find_scope(&self, x: &Expr, facts: &Facts) -> (Lattice, Typeref) {
        let name = match &x.name {
            Some(n) if !n.is_runtime() => n,
            _ => return (Lattice::Bottom, self.any()),
        };
        if let Some(i) = find_inner(self.cache, name, &x.scopes, &facts.types) {
            let s = x.scopes[i];
            let v = facts.values.get(&s).cloned().unwrap_or(Lattice::Bottom);
            let t = facts.types.get(&s).copied().unwrap_or_else(|| self.any());
            return (v, t);
        }
        if let Some(outer) = self.outer {
            if let Some(i) = find_outer(self.cache, name, outer) {
                return (Lattice::Bottom, outer[i]);
            }
        }
        if let Some(t) = self.cache.global(name) {
            return (Lattice::Bottom, t);
        }
        if let Some(&t) = self.outer.and_then(|o| o.first()) {
            return (Lattice::Bottom, t);
        }
        match x.scopes.first().and_then(|s| facts.types.get(s)) {
            Some(&t) => (Lattice::Bottom, t),
            None => (Lattice::Bottom, self.any()),
        }
    }

    /// Result of reading `name` from an object of type `recv`.
    fn get_binding(&self, recv: Typeref, name: Option<&Name>) -> (Lattice, Typeref) {
        let b = &self.cache.builtins;
        match self.binding(recv, name) {
            Some(s) if s.is_slot() => {
                let v = match (&s.value, self.mode) {
                    (Some(v), Mode::Sccp)
                        if s.is_const() && *v != self.cache.default_value(s.ty.t) =>
                    {
                        self.as_slot_value(v, s.ty.t)
                    }
                    _ => Lattice::Bottom,
                };
                (v, s.ty)
            }
            Some(s) if s.is_method() => match self.mode {
                Mode::Sccp => (Lattice::Bottom, self.nonnull(b.function)),
                Mode::Verify => (Lattice::Bottom, self.any()),
            },
            Some(s) if s.is_getter() => (Lattice::Bottom, self.returns(s.method)),
            _ => (Lattice::Bottom, self.any()),
        }
    }

    /// A slot's stored default, converted to the slot's declared type.
    fn as_slot_value(&self, v: &Value, t: TypeId) -> Lattice {
        let b = &self.cache.builtins;
        let c = Lattice::Const(v.clone());
        if t == b.int {
            lattice::convert_i(&c)
        } else if t == b.uint {
            lattice::convert_u(&c)
        } else if t == b.number {
            lattice::convert_d(&c)
        } else if t == b.boolean {
            lattice::convert_b(&c)
        } else if t == b.string && !matches!(v, Value::String(_)) {
            Lattice::Bottom
        } else {
            c
        }
    }

    /// The primitive a class converts its argument to when called, if it
    /// is one of the built-in primitive classes.
    pub fn primitive_class(&self, class: TypeId) -> Option<TypeId> {
        let b = &self.cache.builtins;
        let it = self.cache.ty(class).itype?;
        [b.int, b.uint, b.number, b.boolean, b.string]
            .contains(&it)
            .then_some(it)
    }

    fn call_binding(&self, x: &Expr, recv: Typeref, v1: &Lattice) -> (Lattice, Typeref) {
        let b = &self.cache.builtins;
        match self.binding(recv, x.name.as_ref()) {
            Some(s) if s.is_method() => (Lattice::Bottom, self.returns(s.method)),
            Some(s) if s.is_slot() => match self.primitive_class(s.ty.t) {
                Some(p) if x.args.len() == 2 => {
                    let t = if p == b.string {
                        self.nonnull(p)
                    } else {
                        self.cache.tref(p)
                    };
                    let v = match self.mode {
                        Mode::Verify => Lattice::Bottom,
                        Mode::Sccp => self.convert_to(p, v1),
                    };
                    (v, t)
                }
                _ if self.mode == Mode::Verify => match self.cache.ty(s.ty.t).itype {
                    Some(it) => (Lattice::Bottom, self.cache.tref(it)),
                    None => (Lattice::Bottom, self.any()),
                },
                _ => (Lattice::Bottom, self.any()),
            },
            _ => (Lattice::Bottom, self.any()),
        }
    }

    fn convert_to(&self, p: TypeId, v: &Lattice) -> Lattice {
        let b = &self.cache.builtins;
        if p == b.int {
            lattice::convert_i(v)
        } else if p == b.uint {
            lattice::convert_u(v)
        } else if p == b.number {
            lattice::convert_d(v)
        } else if p == b.boolean {
            lattice::convert_b(v)
        } else {
            lattice::convert_s(v)
        }
    }

    fn coerce_s(&self, v0: &Lattice, t0: Typeref) -> (Lattice, Typeref) {
        let b = &self.cache.builtins;
        if self.is_void_or_null(t0) {
            (Lattice::Const(Value::Null), self.cache.tref(b.null))
        } else {
            (lattice::coerce_s(v0), Typeref::new(b.string, t0.nullable))
        }
    }

    fn coerce_o(&self, v0: &Lattice, t0: Typeref) -> (Lattice, Typeref) {
        let b = &self.cache.builtins;
        if self.cache.extends_or_is(t0.t, b.object) {
            (v0.clone(), t0)
        } else if self.is_void_or_null(t0) {
            (Lattice::Const(Value::Null), self.cache.tref(b.null))
        } else {
            (Lattice::Bottom, Typeref::new(b.object, t0.nullable))
        }
    }

    fn coerce(&self, name: Option<&Name>, v0: &Lattice, t0: Typeref) -> (Lattice, Typeref) {
        let cache = self.cache;
        let b = &cache.builtins;
        let target = match name.and_then(|n| cache.named(n)) {
            Some(t) => t,
            None => return (Lattice::Bottom, self.any()),
        };
        if self.mode == Mode::Verify {
            return (Lattice::Bottom, cache.tref(target));
        }
        if target == b.string {
            self.coerce_s(v0, t0)
        } else if target == b.object {
            self.coerce_o(v0, t0)
        } else if [b.int, b.uint, b.number, b.boolean].contains(&target) {
            (self.convert_to(target, v0), cache.tref(target))
        } else if cache.extends_or_is(t0.t, target) {
            (v0.clone(), t0)
        } else if self.is_void_or_null(t0) {
            (Lattice::Const(Value::Null), cache.tref(b.null))
        } else {
            (Lattice::Bottom, cache.tref(target))
        }
    }

    /// `typeof` of a value known only by its type.
    fn type_of(&self, t0: Typeref) -> Lattice {
        let b = &self.cache.builtins;
        if t0.nullable {
            return Lattice::Bottom;
        }
        let s = if t0.t == b.string {
            "string"
        } else if t0.t == b.function {
            "function"
        } else if t0.t == b.xml {
            "xml"
        } else {
            return Lattice::Bottom;
        };
        Lattice::Const(Value::String(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Method, MethodKind};

    fn method(cache: &mut TypeCache, params: Vec<Typeref>) -> MethodId {
        let any = cache.tref(cache.builtins.any);
        cache.add_method(Method {
            id: 0,
            abc: 0,
            params,
            param_names: None,
            returns: any,
            values: Vec::new(),
            optional_count: 0,
            flags: 0,
            cx: None,
            kind: MethodKind::Function,
            name: Name::public("f"),
            debug_name: String::new(),
            body: None,
            ready: false,
        })
    }

    fn env(cache: &TypeCache, m: MethodId, mode: Mode) -> Env<'_> {
        Env {
            cache,
            method: m,
            handlers: &[],
            activation: cache.tref(cache.builtins.any),
            outer: None,
            mode,
        }
    }

    fn value_of(out: Outcome) -> (Lattice, Typeref) {
        match out {
            Outcome::Value(v, t) => (v, t),
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn constants_fold_through_arithmetic() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, vec![]);
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let two = g.push(b, Op::PushByte);
        g.expr_mut(two).value = Some(Value::Int(2));
        let three = g.push(b, Op::PushByte);
        g.expr_mut(three).value = Some(Value::Int(3));
        let mul = g.push(b, Op::MultiplyI);
        g.expr_mut(mul).args = vec![two, three];

        let env = env(&cache, m, Mode::Sccp);
        let mut facts = Facts::default();
        assert_eq!(env.eval(&g, mul, &facts), Outcome::Unknown);
        for e in [two, three] {
            let (v, t) = value_of(env.eval(&g, e, &facts));
            facts.values.insert(e, v);
            facts.types.insert(e, t);
        }
        let (v, t) = value_of(env.eval(&g, mul, &facts));
        assert_eq!(v, Lattice::Const(Value::Int(6)));
        assert_eq!(t.t, cache.builtins.int);
    }

    #[test]
    fn locals_past_the_parameters_are_undefined() {
        let mut cache = TypeCache::new();
        let this = cache.tref(cache.builtins.object).nonnull();
        let m = method(&mut cache, vec![this]);
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let a0 = g.push(b, Op::Arg);
        g.expr_mut(a0).imm = vec![0];
        let a1 = g.push(b, Op::Arg);
        g.expr_mut(a1).imm = vec![1];

        let env = env(&cache, m, Mode::Sccp);
        let facts = Facts::default();
        let (v, t) = value_of(env.eval(&g, a0, &facts));
        assert_eq!((v, t), (Lattice::Bottom, this));
        let (v, _) = value_of(env.eval(&g, a1, &facts));
        assert_eq!(v, Lattice::Const(Value::Undefined));
    }

    #[test]
    fn branches_follow_known_conditions() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, vec![]);
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let (x, y) = (g.new_block(), g.new_block());
        let k = g.push(b, Op::PushFalse);
        let br = g.push(b, Op::IfFalse);
        g.expr_mut(br).args = vec![k];
        let e0 = g.new_edge(Some(b), 0, x);
        let e1 = g.new_edge(Some(b), 1, y);
        g.expr_mut(br).succ = vec![e0, e1];

        let env = env(&cache, m, Mode::Sccp);
        let mut facts = Facts::default();
        facts.values.insert(k, Lattice::Const(Value::Bool(false)));
        assert_eq!(env.eval(&g, br, &facts), Outcome::Flow(vec![e1]));
        facts.values.insert(k, Lattice::Bottom);
        assert_eq!(env.eval(&g, br, &facts), Outcome::Flow(vec![e0, e1]));
    }

    #[test]
    fn switch_out_of_range_takes_default() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, vec![]);
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let targets: Vec<_> = (0..3).map(|_| g.new_block()).collect();
        let k = g.push(b, Op::PushByte);
        let sw = g.push(b, Op::LookupSwitch);
        g.expr_mut(sw).args = vec![k];
        let succ: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(i, &t)| g.new_edge(Some(b), i as u32, t))
            .collect();
        g.expr_mut(sw).succ = succ.clone();

        let env = env(&cache, m, Mode::Sccp);
        let mut facts = Facts::default();
        facts.values.insert(k, Lattice::Const(Value::Int(1)));
        assert_eq!(env.eval(&g, sw, &facts), Outcome::Flow(vec![succ[1]]));
        facts.values.insert(k, Lattice::Const(Value::Int(7)));
        assert_eq!(env.eval(&g, sw, &facts), Outcome::Flow(vec![succ[2]]));
    }

    #[test]
    fn verifier_view_of_coerce_a_is_any() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, vec![]);
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let s = g.push(b, Op::PushString);
        let c = g.push(b, Op::CoerceA);
        g.expr_mut(c).args = vec![s];
        let string = cache.tref(cache.builtins.string).nonnull();

        let mut facts = Facts::default();
        facts.types.insert(s, string);
        facts.values.insert(s, Lattice::Const(Value::String("x".into())));
        let (_, t) = value_of(env(&cache, m, Mode::Sccp).eval(&g, c, &facts));
        assert_eq!(t, string);
        let (_, t) = value_of(env(&cache, m, Mode::Verify).eval(&g, c, &facts));
        assert_eq!(t.t, cache.builtins.any);
        assert!(!t.nullable);
    }
}
