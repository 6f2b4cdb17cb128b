//! Type-directed rewrites run after SCCP.
//!
//! Every live expression is visited once in id order, and again whenever
//! one of its operands is rewritten. A visit first looks through copy
//! markers in its operands, then applies the rule for its opcode until
//! none fires:
//!
//! | Opcode                           | Rewrite                                   |
//! |----------------------------------|-------------------------------------------|
//! | `newclass`, `newfunction`        | capture scope types, queue the new code   |
//! | `findprop*`                      | scope copy, `getglobalscope` or `finddef` |
//! | `getproperty`, `setproperty`, …  | narrow the name, early bind to a slot     |
//! | `callproperty`                   | `callstatic`, `convert_*`, `*void` forms  |
//! | `coerce`, `convert_*`            | drop when the operand already conforms    |
//! | `add`, `subtract`                | `increment`/`decrement`, `convert_s`      |

use super::infer::Facts;
use super::lattice::Lattice;
use super::sccp::{constify, Target};
use super::utils::{find_inner, find_outer, make_nop, unwrap_scope};
use crate::abc::constants::CONSTANT_NAMESPACE;
use crate::abc::Op;
use crate::analysis::{dfs, find_uses, Uses};
use crate::ir::{initial_flags, ExprId, IrGraph, MethodBody, EFFECT, PX};
use crate::types::{
    Binding, MethodId, Name, Namespace, Type, TypeCache, TypeId, Typeref, Value,
};
use anyhow::Result;
use std::collections::BTreeSet;
use tracing::trace;

/// URI of the namespace holding the built-in classes' native methods.
pub const AS3_URI: &str = "http://adobe.com/AS3/2006/builtin";

/// Apply the rewrites to every live expression of `body`.
pub fn rewrite(
    body: &mut MethodBody,
    cache: &mut TypeCache,
    target: Target<'_>,
    outer: Option<&[Typeref]>,
    facts: &Facts,
    ready: &mut Vec<MethodId>,
) -> Result<()> {
    let g = &mut body.graph;
    let code = dfs(g);
    let mut pass = Peephole {
        uses: find_uses(g, &code),
        cache,
        facts,
        target,
        outer,
        ready,
    };
    let mut work: BTreeSet<ExprId> = code
        .iter()
        .flat_map(|&b| g.block(b).exprs.iter().copied())
        .collect();

    while let Some(e) = work.pop_first() {
        pass.rename(g, e);
        while pass.modify(g, e)? {
            work.extend(pass.uses.get(&e).into_iter().flatten().copied());
        }
    }
    Ok(())
}

struct Peephole<'a, 'c> {
    uses: Uses,
    cache: &'c mut TypeCache,
    facts: &'a Facts,
    target: Target<'a>,
    outer: Option<&'a [Typeref]>,
    ready: &'a mut Vec<MethodId>,
}

impl Peephole<'_, '_> {
    // ── Facts ────────────────────────────────────────────────────────────────

    fn ty(&self, e: ExprId) -> Typeref {
        self.facts
            .types
            .get(&e)
            .copied()
            .unwrap_or_else(|| self.cache.tref(self.cache.builtins.any))
    }

    fn val(&self, e: ExprId) -> Lattice {
        self.facts.values.get(&e).cloned().unwrap_or(Lattice::Bottom)
    }

    fn early_slot(&self, b: &Binding) -> bool {
        b.slot != 0 && self.target.merged.contains(&b.abc)
    }

    fn early_method(&self, b: &Binding) -> bool {
        self.target.merged.contains(&b.abc)
    }

    /// A type the cache knows under its own name.
    fn is_named(&self, t: TypeId) -> bool {
        self.cache.named(&self.cache.ty(t).name) == Some(t)
    }

    /// Scope types of a closure created here: the context's scopes, then
    /// the types captured from this body's scope chain.
    fn capture(&self, scopes: &[ExprId]) -> Option<Vec<Typeref>> {
        let mut v = self.outer?.to_vec();
        v.extend(scopes.iter().map(|&s| self.ty(s)));
        Some(v)
    }

    // ── Use bookkeeping ──────────────────────────────────────────────────────

    fn unlink(&mut self, e: ExprId, ops: &[ExprId]) {
        for a in ops {
            if let Some(u) = self.uses.get_mut(a) {
                u.remove(&e);
            }
        }
    }

    fn link(&mut self, e: ExprId, ops: &[ExprId]) {
        for &a in ops {
            self.uses.entry(a).or_default().insert(e);
        }
    }

    fn set_args(&mut self, g: &mut IrGraph, e: ExprId, args: Vec<ExprId>) {
        let old = std::mem::take(&mut g.expr_mut(e).args);
        self.unlink(e, &old);
        self.link(e, &args);
        g.expr_mut(e).args = args;
    }

    fn clear_scopes(&mut self, g: &mut IrGraph, e: ExprId) {
        let old = std::mem::take(&mut g.expr_mut(e).scopes);
        self.unlink(e, &old);
    }

    fn copy(&mut self, g: &mut IrGraph, e: ExprId, a: ExprId) {
        let ops: Vec<ExprId> = g.expr(e).operands().collect();
        self.unlink(e, &ops);
        trace!(expr = %e, op = %g.expr(e).op, to = %a, "copy");
        g.make_copy(e, a);
        self.link(e, &[a]);
    }

    /// Look through copy markers in the stack and local operands of `e`.
    fn rename(&mut self, g: &mut IrGraph, e: ExprId) {
        for local in [false, true] {
            let n = if local {
                g.expr(e).locals.len()
            } else {
                g.expr(e).args.len()
            };
            for i in (0..n).rev() {
                let a = if local {
                    g.expr(e).locals[i]
                } else {
                    g.expr(e).args[i]
                };
                if !g.expr(a).is_copy() {
                    continue;
                }
                let to = g.expr(a).locals[0];
                self.unlink(e, &[a]);
                self.link(e, &[to]);
                let x = g.expr_mut(e);
                if local {
                    x.locals[i] = to;
                } else {
                    x.args[i] = to;
                }
            }
        }
    }

    // ── Rules ────────────────────────────────────────────────────────────────

    /// Apply the rule for `e`'s opcode once. Returns whether `e` changed in
    /// a way its users should see.
    fn modify(&mut self, g: &mut IrGraph, e: ExprId) -> Result<bool> {
        use Op::*;
        let b = self.cache.builtins;
        let op = g.expr(e).op;
        let changed = match op {
            NewClass => {
                self.new_class(g, e);
                false
            }
            NewFunction => {
                self.new_function(g, e);
                false
            }
            ReturnValue => {
                self.return_value(g, e);
                false
            }
            GetGlobalScope => {
                if self.outer.is_some_and(<[Typeref]>::is_empty) && !g.expr(e).scopes.is_empty()
                {
                    let a = unwrap_scope(g, e, 0)?;
                    self.copy(g, e, a);
                    true
                } else {
                    false
                }
            }
            GetScopeObject => {
                if g.expr(e).scopes.is_empty() {
                    false
                } else {
                    let a = unwrap_scope(g, e, 0)?;
                    self.copy(g, e, a);
                    true
                }
            }
            IsTypeLate => {
                let t1 = self.ty(g.expr(e).args[1]);
                match self.cache.ty(t1.t).itype.filter(|&it| self.is_named(it)) {
                    Some(it) => {
                        let a0 = g.expr(e).args[0];
                        self.set_args(g, e, vec![a0]);
                        let x = g.expr_mut(e);
                        x.op = IsType;
                        x.name = Some(self.cache.ty(it).name.clone());
                        x.flags &= !PX;
                        true
                    }
                    None => false,
                }
            }
            IsType => {
                if g.expr(e).name.as_ref().is_some_and(|n| self.cache.named(n).is_some()) {
                    g.expr_mut(e).flags &= !PX;
                }
                false
            }
            PushScope | PushWith => {
                if !self.ty(g.expr(e).args[0]).nullable {
                    g.expr_mut(e).flags &= !PX;
                }
                false
            }
            Coerce => self.coerce(g, e),
            FindPropStrict | FindProperty => self.find_property(g, e)?,
            GetProperty | GetSuper => self.get_property(g, e),
            InitProperty => self.init_property(g, e),
            SetProperty | SetSuper => self.set_property(g, e),
            CallProperty | CallPropLex | CallSuper | ConstructProp | CallPropVoid => {
                self.call(g, e)
            }
            ConvertU | CoerceS | ConvertS | ConvertD | CoerceO | ConvertB | ConvertI
            | CoerceA => self.convert(g, e),
            Subtract => {
                let (a0, a1) = (g.expr(e).args[0], g.expr(e).args[1]);
                match self.val(a1).number() {
                    Some(d) if d == 1.0 => self.unary(g, e, Decrement, a0),
                    Some(d) if d == -1.0 => self.unary(g, e, Increment, a0),
                    _ => false,
                }
            }
            Add => {
                let (a0, a1) = (g.expr(e).args[0], g.expr(e).args[1]);
                let t = self.ty(e).t;
                let (v0, v1) = (self.val(a0), self.val(a1));
                if self.cache.ty(t).numeric {
                    if v0.number() == Some(1.0) {
                        self.unary(g, e, Increment, a1)
                    } else if v1.number() == Some(1.0) {
                        self.unary(g, e, Increment, a0)
                    } else if v0.number() == Some(-1.0) {
                        self.unary(g, e, Decrement, a1)
                    } else if v1.number() == Some(-1.0) {
                        self.unary(g, e, Decrement, a0)
                    } else {
                        false
                    }
                } else if t == b.string {
                    let empty = Lattice::Const(Value::String(String::new()));
                    if v0 == empty {
                        self.unary(g, e, ConvertS, a1)
                    } else if v1 == empty {
                        self.unary(g, e, ConvertS, a0)
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            _ => false,
        };
        Ok(changed)
    }

    fn unary(&mut self, g: &mut IrGraph, e: ExprId, op: Op, a: ExprId) -> bool {
        trace!(expr = %e, from = %g.expr(e).op, to = %op, "peephole");
        self.set_args(g, e, vec![a]);
        g.expr_mut(e).op = op;
        true
    }

    fn new_class(&mut self, g: &IrGraph, e: ExprId) {
        let c = match g.expr(e).class {
            Some(c) => c,
            None => return,
        };
        let scopes = self.capture(&g.expr(e).scopes);
        let itype = self.cache.ty(c).itype;
        if let Some(scopes) = scopes {
            if let Some(it) = itype {
                let mut inner = scopes.clone();
                inner.push(self.cache.tref(c).nonnull());
                self.cache.ty_mut(it).scopes = Some(inner);
            }
            self.cache.ty_mut(c).scopes = Some(scopes);
        }
        self.cache.ready_type(c, self.ready);
        if let Some(it) = itype {
            self.cache.ready_type(it, self.ready);
        }
    }

    fn new_function(&mut self, g: &IrGraph, e: ExprId) {
        let f = match g.expr(e).method {
            Some(f) => f,
            None => return,
        };
        if let Some(scopes) = self.capture(&g.expr(e).scopes) {
            let mut t = Type::new(self.cache.method(self.target.method).name.clone());
            t.base = Some(self.cache.builtins.function);
            t.scopes = Some(scopes);
            let t = self.cache.add_type(t);
            self.cache.method_mut(f).cx = Some(t);
        }
        self.cache.ready_method(f, self.ready);
    }

    fn return_value(&mut self, g: &mut IrGraph, e: ExprId) {
        let a0 = g.expr(e).args[0];
        let t0 = self.ty(a0);
        let b = self.cache.builtins;
        if t0.t == b.void {
            self.set_args(g, e, Vec::new());
            g.expr_mut(e).op = Op::ReturnVoid;
            return;
        }
        let returns = self.cache.method(self.target.method).returns;
        if returns.t == b.int
            && self.cache.extends_or_is(t0.t, returns.t)
            && g.expr(a0).op == Op::ConvertI
        {
            if let Some(&inner) = g.expr(a0).args.first() {
                self.set_args(g, e, vec![inner]);
            }
        }
    }

    fn coerce(&mut self, g: &mut IrGraph, e: ExprId) -> bool {
        let a0 = g.expr(e).args[0];
        let (t, t0) = (self.ty(e), self.ty(a0));
        let b = self.cache.builtins;
        if t == t0 || (self.val(a0) == Lattice::Const(Value::Null) && t0.nullable && t0.t != b.void)
        {
            self.copy(g, e, a0);
            return true;
        }
        let target = g.expr(e).name.as_ref().and_then(|n| self.cache.named(n));
        if target == Some(b.object) {
            let x = g.expr_mut(e);
            x.op = Op::CoerceO;
            x.flags &= !EFFECT;
            x.name = None;
            x.imm.clear();
            return true;
        }
        false
    }

    fn find_property(&mut self, g: &mut IrGraph, e: ExprId) -> Result<bool> {
        let name = match &g.expr(e).name {
            Some(n) if !n.is_runtime() => n.clone(),
            _ => return Ok(false),
        };
        if let Some(i) = find_inner(self.cache, &name, &g.expr(e).scopes, &self.facts.types) {
            let a = unwrap_scope(g, e, i)?;
            self.copy(g, e, a);
            return Ok(true);
        }
        let outer = match self.outer {
            Some(o) => o,
            None => return Ok(false),
        };
        match find_outer(self.cache, &name, outer) {
            Some(0) => {
                self.clear_scopes(g, e);
                let x = g.expr_mut(e);
                x.op = Op::GetGlobalScope;
                x.set_pure();
                Ok(true)
            }
            Some(_) => {
                g.expr_mut(e).set_pure();
                Ok(false)
            }
            None => match self.cache.global_name(&name) {
                Some(q) => {
                    self.clear_scopes(g, e);
                    let x = g.expr_mut(e);
                    x.op = Op::FindDef;
                    x.flags = initial_flags(Op::FindDef);
                    x.name = Some(q);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// Static name of a property access, when the multiname is not
    /// completed at run time.
    fn static_name(g: &IrGraph, e: ExprId) -> Option<Name> {
        g.expr(e).name.clone().filter(|n| !n.is_runtime())
    }

    fn get_property(&mut self, g: &mut IrGraph, e: ExprId) -> bool {
        let name = match Self::static_name(g, e) {
            Some(n) => n,
            None => return false,
        };
        let t0 = self.ty(g.expr(e).args[0]);
        let bind = match self.cache.find_get(t0.t, &name) {
            Some(b) => b.clone(),
            None => return false,
        };
        if !bind.is_slot() {
            g.expr_mut(e).name = Some(bind.name);
            return false;
        }
        {
            let x = g.expr_mut(e);
            x.flags &= !EFFECT;
            if !t0.nullable {
                x.flags &= !PX;
            }
            x.name = Some(bind.name.clone());
        }
        if self.early_slot(&bind) && !(bind.is_const() && constify(g, e, &self.val(e))) {
            let x = g.expr_mut(e);
            x.op = Op::GetSlot;
            x.imm = vec![bind.slot as i32];
            x.name = None;
            return true;
        }
        false
    }

    fn init_property(&mut self, g: &mut IrGraph, e: ExprId) -> bool {
        let name = match Self::static_name(g, e) {
            Some(n) => n,
            None => return false,
        };
        let (a0, a1) = (g.expr(e).args[0], g.expr(e).args[1]);
        let t0 = self.ty(a0);
        let bind = match self.cache.find(t0.t, &name) {
            Some(b) => b.clone(),
            None => return false,
        };
        g.expr_mut(e).name = Some(bind.name.clone());
        let v1 = self.val(a1);
        if bind.is_const() && bind.value.is_some() && bind.value.as_ref() == v1.value() {
            // storing the value the slot already starts with
            let args = g.expr(e).args.clone();
            self.unlink(e, &args);
            make_nop(g, e);
            false
        } else if bind.is_slot() && self.early_slot(&bind) {
            let x = g.expr_mut(e);
            x.op = Op::SetSlot;
            x.imm = vec![bind.slot as i32];
            x.name = None;
            true
        } else {
            false
        }
    }

    fn set_property(&mut self, g: &mut IrGraph, e: ExprId) -> bool {
        let name = match Self::static_name(g, e) {
            Some(n) => n,
            None => return false,
        };
        let t0 = self.ty(g.expr(e).args[0]);
        let bind = match self.cache.find(t0.t, &name) {
            Some(b) => b.clone(),
            None => return false,
        };
        if bind.is_slot() && self.early_slot(&bind) {
            let x = g.expr_mut(e);
            x.op = Op::SetSlot;
            x.imm = vec![bind.slot as i32];
            x.name = None;
            return true;
        }
        g.expr_mut(e).name = Some(bind.name);
        false
    }

    fn call(&mut self, g: &mut IrGraph, e: ExprId) -> bool {
        let mut changed = false;
        if let Some(name) = Self::static_name(g, e) {
            let t0 = self.ty(g.expr(e).args[0]);
            if let Some(b0) = self.cache.find_get(t0.t, &name).cloned() {
                g.expr_mut(e).name = Some(b0.name.clone());
                let op = g.expr(e).op;
                if op == Op::CallProperty && b0.is_method() {
                    let as3_to_string =
                        Name::qname(Namespace::new(CONSTANT_NAMESPACE, AS3_URI), "toString");
                    if self.cache.is_primitive(t0.t)
                        && g.expr(e).args.len() == 1
                        && b0.name == as3_to_string
                        && self.ty(e).t == self.cache.builtins.string
                    {
                        let x = g.expr_mut(e);
                        x.op = Op::ConvertS;
                        x.name = None;
                        x.set_pure();
                        changed = true;
                    } else if self.early_method(&b0)
                        && (self.cache.ty(t0.t).is_final || b0.is_final())
                        && b0.method.is_some()
                    {
                        let x = g.expr_mut(e);
                        x.op = Op::CallStatic;
                        x.method = b0.method;
                        x.name = None;
                        changed = true;
                    }
                } else if op == Op::CallProperty && b0.is_class() {
                    changed |= self.convertify(g, e, &b0);
                }
            }
        }
        if self.uses.get(&e).map_or(true, BTreeSet::is_empty) {
            let x = g.expr_mut(e);
            match x.op {
                Op::CallSuper => x.op = Op::CallSuperVoid,
                Op::CallProperty => x.op = Op::CallPropVoid,
                _ => {}
            }
        }
        changed
    }

    /// `int(x)`, `String(x)` and friends called through the class binding.
    fn convertify(&mut self, g: &mut IrGraph, e: ExprId, b0: &Binding) -> bool {
        if g.expr(e).args.len() != 2 {
            return false;
        }
        let b = self.cache.builtins;
        let op = match self.cache.ty(b0.ty.t).itype {
            Some(it) if it == b.number => Op::ConvertD,
            Some(it) if it == b.int => Op::ConvertI,
            Some(it) if it == b.uint => Op::ConvertU,
            Some(it) if it == b.string => Op::ConvertS,
            Some(it) if it == b.boolean => Op::ConvertB,
            _ => return false,
        };
        let a1 = g.expr(e).args[1];
        self.set_args(g, e, vec![a1]);
        let primitive = self.cache.is_primitive(self.ty(a1).t);
        let x = g.expr_mut(e);
        x.op = op;
        x.name = None;
        x.flags = initial_flags(op);
        if primitive {
            x.set_pure();
        }
        true
    }

    fn convert(&mut self, g: &mut IrGraph, e: ExprId) -> bool {
        if g.expr(e).op == Op::ConvertU {
            let a0 = g.expr(e).args[0];
            if g.expr(a0).op == Op::ConvertI {
                if let Some(&inner) = g.expr(a0).args.first() {
                    self.set_args(g, e, vec![inner]);
                }
            }
        }
        let a0 = g.expr(e).args[0];
        if self.ty(e).t == self.ty(a0).t {
            self.copy(g, e, a0);
            return true;
        }
        if g.expr(e).op == Op::ConvertI {
            let fused = match g.expr(a0).op {
                Op::Negate => Some(Op::NegateI),
                Op::Decrement => Some(Op::DecrementI),
                _ => None,
            };
            if let (Some(op), Some(&x)) = (fused, g.expr(a0).args.first()) {
                return self.unary(g, e, op, x);
            }
        }
        false
    }
}
