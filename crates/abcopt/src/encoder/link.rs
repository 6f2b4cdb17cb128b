//! Reachability walk that fills the emitted pools.
//!
//! ## Algorithm
//!
//! Starting from every script of the output file, each reachable entity is
//! counted into its pool: scripts pull in their initializer and traits,
//! class traits pull in both halves of the class, methods pull in their
//! signature, exception table and every operand of their scheduled code.
//! Names pull in the strings and namespaces they are spelled with.
//!
//! After the walk every pool is sorted by descending reference count so
//! frequent entries get short indices, and the classes are ordered so that
//! a base class is always emitted before anything derived from it.

use super::code::{operands, Operands};
use super::pool::Pool;
use crate::abc::constants::*;
use crate::abc::AbcFile;
use crate::error::AbcError;
use crate::ir::MethodBody;
use crate::types::{MethodId, Name, Namespace, TypeCache, TypeId, Value};
use crate::OptimizeOptions;
use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

/// Everything the writer needs besides the type cache.
#[derive(Debug)]
pub struct Linked {
    pub ints: Pool<i32>,
    pub uints: Pool<u32>,
    /// Bit patterns, so NaN and both zeroes are distinct entries.
    pub doubles: Pool<u64>,
    pub strings: Pool<String>,
    pub namespaces: Pool<Namespace>,
    pub nssets: Pool<Vec<Namespace>>,
    pub names: Pool<Name>,
    /// Methods with a body or abstract signatures.
    pub methods: Pool<MethodId>,
    /// Native methods, numbered after `methods`.
    pub natives: Pool<MethodId>,
    pub scripts: Vec<TypeId>,
    /// Class objects in emission order.
    pub classes: Vec<TypeId>,
    pub body_count: usize,
}

impl Default for Linked {
    fn default() -> Self {
        Self {
            ints: Pool::new(1),
            uints: Pool::new(1),
            doubles: Pool::new(1),
            strings: Pool::new(1),
            namespaces: Pool::new(1),
            nssets: Pool::new(1),
            names: Pool::new(1),
            methods: Pool::new(0),
            natives: Pool::new(0),
            scripts: Vec::new(),
            classes: Vec::new(),
            body_count: 0,
        }
    }
}

impl Linked {
    pub fn method_id(&self, m: MethodId, cache: &TypeCache) -> Result<u32> {
        if cache.method(m).is_native() {
            self.natives.id(&m)
        } else {
            self.methods.id(&m)
        }
    }

    pub fn class_id(&self, c: TypeId, cache: &TypeCache) -> Result<u32> {
        self.classes
            .iter()
            .position(|&k| k == c)
            .map(|i| i as u32)
            .ok_or_else(|| {
                AbcError::internal(format!("class {} is not emitted", cache.type_name(c)))
            })
    }

    /// Name index of a type annotation; 0 stands for `*`.
    pub fn type_ref(&self, t: TypeId, cache: &TypeCache) -> Result<u32> {
        if is_any(t, cache) {
            Ok(0)
        } else {
            self.names.id(cache.type_name(t))
        }
    }

    /// Whether any native method survived linking.
    pub fn have_natives(&self) -> bool {
        !self.natives.is_empty()
    }
}

fn is_any(t: TypeId, cache: &TypeCache) -> bool {
    t == cache.builtins.any || cache.ty(t).emit_as_any
}

/// Constant kind tag a literal is emitted with.
pub fn const_kind(v: &Value) -> u8 {
    match v {
        Value::Undefined => CONSTANT_VOID,
        Value::Null => CONSTANT_NULL,
        Value::Bool(true) => CONSTANT_TRUE,
        Value::Bool(false) => CONSTANT_FALSE,
        Value::Int(_) => CONSTANT_INTEGER,
        Value::Uint(_) => CONSTANT_UINTEGER,
        Value::Double(_) => CONSTANT_DOUBLE,
        Value::String(_) => CONSTANT_UTF8,
        Value::Namespace(ns) if ns.is_private_or_internal() => CONSTANT_PRIVATE_NS,
        Value::Namespace(ns) => ns.kind,
    }
}

/// Pool index a literal is emitted with. Boolean and null literals use
/// their kind as index; `undefined` uses 0.
pub fn const_id(linked: &Linked, kind: u8, v: &Value) -> Result<u32> {
    Ok(match v {
        Value::Undefined => 0,
        Value::Null | Value::Bool(_) => kind as u32,
        Value::Int(i) => linked.ints.id(i)?,
        Value::Uint(u) => linked.uints.id(u)?,
        Value::Double(d) => linked.doubles.id(&d.to_bits())?,
        Value::String(s) => linked.strings.id(s)?,
        Value::Namespace(ns) => linked.namespaces.id(ns)?,
    })
}

// ── Walk ─────────────────────────────────────────────────────────────────────

struct Linker<'a> {
    cache: &'a TypeCache,
    options: &'a OptimizeOptions,
    out: Linked,
    seen_classes: HashSet<TypeId>,
}

/// Collect everything reachable from the scripts of `abc`.
pub fn link(cache: &TypeCache, abc: &AbcFile, options: &OptimizeOptions) -> Result<Linked> {
    let mut l = Linker {
        cache,
        options,
        out: Linked::default(),
        seen_classes: HashSet::new(),
    };
    for &s in &abc.scripts {
        l.add_script(s)?;
    }
    let mut out = l.out;
    let topological = options.legacy_verifier && abc.merged.len() > 1;
    sort(&mut out, cache, topological, options.legacy_verifier)?;
    debug!(
        strings = out.strings.len(),
        names = out.names.len(),
        methods = out.methods.len(),
        natives = out.natives.len(),
        classes = out.classes.len(),
        "linked"
    );
    Ok(out)
}

impl Linker<'_> {
    fn add_script(&mut self, s: TypeId) -> Result<()> {
        self.out.scripts.push(s);
        if let Some(init) = self.cache.ty(s).init {
            self.add_method(init)?;
        }
        self.add_traits(s)
    }

    fn add_class(&mut self, c: TypeId) -> Result<()> {
        if !self.seen_classes.insert(c) {
            return Ok(());
        }
        let cache = self.cache;
        let it = cache.ty(c).itype.ok_or_else(|| {
            AbcError::internal(format!("{} has no instance type", cache.type_name(c)))
        })?;
        let ity = cache.ty(it);
        self.add_name(&ity.name)?;
        if let Some(base) = ity.base {
            self.add_type_ref(base)?;
        }
        if ity.has_protected_ns() {
            if let Some(ns) = &ity.protected_ns {
                self.add_namespace(ns);
            }
        }
        for &i in &ity.interfaces {
            self.add_name(cache.type_name(i))?;
        }
        if let Some(init) = ity.init {
            self.add_method(init)?;
        }
        self.add_traits(it)?;
        if let Some(init) = cache.ty(c).init {
            self.add_method(init)?;
        }
        self.add_traits(c)?;
        self.out.classes.push(c);
        Ok(())
    }

    fn add_traits(&mut self, t: TypeId) -> Result<()> {
        let cache = self.cache;
        for b in &cache.ty(t).defs {
            self.add_name(&b.name)?;
            match b.kind {
                TRAIT_CLASS => {
                    if let Some(c) = b.class {
                        self.add_class(c)?;
                    }
                }
                TRAIT_SLOT | TRAIT_CONST => {
                    self.add_type_ref(b.ty.t)?;
                    if let Some(v) = &b.value {
                        self.add_const(v);
                    }
                }
                _ => {
                    if let Some(m) = b.method {
                        self.add_method(m)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn add_type_ref(&mut self, t: TypeId) -> Result<()> {
        let cache = self.cache;
        if is_any(t, cache) {
            return Ok(());
        }
        self.add_name(cache.type_name(t))
    }

    fn add_name(&mut self, n: &Name) -> Result<()> {
        if self.out.names.add(n.clone()) > 1 {
            return Ok(());
        }
        match n.kind {
            CONSTANT_MULTINAME | CONSTANT_MULTINAME_A => {
                self.add_nsset(&n.nsset);
                self.add_string(n.local_name());
            }
            CONSTANT_QNAME | CONSTANT_QNAME_A => {
                if let Some(ns) = n.ns() {
                    self.add_namespace(ns);
                }
                self.add_string(n.local_name());
            }
            CONSTANT_RTQNAME | CONSTANT_RTQNAME_A => self.add_string(n.local_name()),
            CONSTANT_MULTINAME_L | CONSTANT_MULTINAME_LA => self.add_nsset(&n.nsset),
            CONSTANT_RTQNAME_L | CONSTANT_RTQNAME_LA => {}
            CONSTANT_TYPENAME => {
                return Err(AbcError::structural(format!(
                    "parameterized name {} is only allowed in an import file",
                    n
                )))
            }
            k => return Err(AbcError::internal(format!("name kind 0x{:02x}", k))),
        }
        Ok(())
    }

    fn add_string(&mut self, s: &str) {
        self.out.strings.add(s.to_string());
    }

    fn add_namespace(&mut self, ns: &Namespace) {
        if self.out.namespaces.add(ns.clone()) == 1 && !ns.is_private_or_internal() {
            self.add_string(&ns.uri);
        }
    }

    fn add_nsset(&mut self, set: &[Namespace]) {
        if self.out.nssets.add(set.to_vec()) == 1 {
            for ns in set {
                self.add_namespace(ns);
            }
        }
    }

    fn add_const(&mut self, v: &Value) {
        match v {
            Value::Int(i) => {
                self.out.ints.add(*i);
            }
            Value::Uint(u) => {
                self.out.uints.add(*u);
            }
            Value::Double(d) => {
                self.out.doubles.add(d.to_bits());
            }
            Value::String(s) => self.add_string(s),
            Value::Namespace(ns) => self.add_namespace(ns),
            Value::Undefined | Value::Null | Value::Bool(_) => {}
        }
    }

    fn add_method(&mut self, m: MethodId) -> Result<()> {
        let cache = self.cache;
        let method = cache.method(m);
        let pool = if method.is_native() {
            &mut self.out.natives
        } else {
            &mut self.out.methods
        };
        if pool.add(m) > 1 {
            return Ok(());
        }

        self.add_type_ref(method.returns.t)?;
        for p in method.params.iter().skip(1) {
            self.add_type_ref(p.t)?;
        }
        for v in method.values.iter().flatten() {
            self.add_const(v);
        }
        if !self.options.strip_debug_info && method.has_param_names() {
            if let Some(names) = &method.param_names {
                for n in names.iter().skip(1) {
                    self.add_string(n.local_name());
                }
            }
        }
        if self.options.preserve_method_names {
            self.add_string(&method.debug_name);
        }

        if let Some(body) = &method.body {
            self.out.body_count += 1;
            self.add_body(body)?;
        }
        Ok(())
    }

    fn add_body(&mut self, body: &MethodBody) -> Result<()> {
        for h in &body.handlers {
            if let Some(n) = &h.name {
                self.add_name(n)?;
            }
            self.add_type_ref(h.ty.t)?;
        }

        let g = &body.graph;
        for &b in &body.code {
            for &e in &g.block(b).exprs {
                let x = g.expr(e);
                match operands(x.op) {
                    Operands::Name | Operands::NameArgc => {
                        if let Some(n) = &x.name {
                            self.add_name(n)?;
                        }
                    }
                    Operands::String | Operands::Debug => {
                        if let Some(Value::String(s)) = &x.value {
                            self.add_string(s);
                        }
                    }
                    Operands::Namespace | Operands::Int | Operands::Uint | Operands::Double => {
                        if let Some(v) = &x.value {
                            self.add_const(v);
                        }
                    }
                    Operands::Method | Operands::MethodArgc => {
                        if let Some(m) = x.method {
                            self.add_method(m)?;
                        }
                    }
                    Operands::Class => {
                        if let Some(c) = x.class {
                            self.add_class(c)?;
                        }
                    }
                    _ => {}
                }
            }
        }

        let act = body.activation.t;
        if act != self.cache.builtins.any {
            self.add_traits(act)?;
        }
        Ok(())
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────────

fn sort(out: &mut Linked, cache: &TypeCache, topological: bool, legacy: bool) -> Result<()> {
    out.ints.sort();
    out.uints.sort();
    out.doubles.sort();
    out.strings.sort();
    out.namespaces.sort();
    out.nssets.sort();
    out.names.sort();
    out.methods.sort();
    out.natives.count_from = out.methods.size();
    out.natives.sort();

    out.classes = if topological {
        topological_order(&out.classes, cache)?
    } else if legacy {
        std::mem::take(&mut out.classes)
    } else {
        base_first_order(&out.classes, cache)
    };
    Ok(())
}

fn derives(cache: &TypeCache, c: TypeId, from: TypeId) -> bool {
    match (cache.ty(c).itype, cache.ty(from).itype) {
        (Some(a), Some(b)) => a != b && cache.extends_or_is(a, b),
        _ => false,
    }
}

/// Insert each class right before the first placed class derived from it.
fn base_first_order(classes: &[TypeId], cache: &TypeCache) -> Vec<TypeId> {
    let mut order: Vec<TypeId> = Vec::with_capacity(classes.len());
    for &c in classes {
        match order.iter().position(|&k| derives(cache, k, c)) {
            Some(i) => order.insert(i, c),
            None => order.push(c),
        }
    }
    order
}

/// Stable Kahn sort over "derives from" edges between emitted classes.
fn topological_order(classes: &[TypeId], cache: &TypeCache) -> Result<Vec<TypeId>> {
    let n = classes.len();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n).find(|&i| {
            !placed[i]
                && (0..n).all(|j| placed[j] || j == i || !derives(cache, classes[i], classes[j]))
        });
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(classes[i]);
            }
            None => {
                let stuck = (0..n).find(|&i| !placed[i]).map(|i| classes[i]);
                return Err(AbcError::structural(format!(
                    "class inheritance cycle through {}",
                    stuck.map_or_else(String::new, |c| cache.type_name(c).to_string())
                )));
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    /// Class object plus instance type named `name` extending `base`.
    fn class(cache: &mut TypeCache, name: &str, base: Option<TypeId>) -> TypeId {
        let mut it = Type::new(Name::public(name));
        it.base = base.and_then(|c| cache.ty(c).itype);
        let it = cache.add_type(it);
        let mut c = Type::new(Name::public(format!("{}$", name)));
        c.itype = Some(it);
        cache.add_type(c)
    }

    #[test]
    fn bases_move_before_derived_classes() {
        let mut cache = TypeCache::new();
        let a = class(&mut cache, "A", None);
        let b = class(&mut cache, "B", Some(a));
        let c = class(&mut cache, "C", Some(b));
        let order = base_first_order(&[c, b, a], &cache);
        assert_eq!(order, vec![a, b, c]);
        let order = topological_order(&[c, b, a], &cache).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn unrelated_classes_keep_their_order() {
        let mut cache = TypeCache::new();
        let x = class(&mut cache, "X", None);
        let a = class(&mut cache, "A", None);
        let b = class(&mut cache, "B", Some(a));
        assert_eq!(base_first_order(&[x, b, a], &cache), vec![x, a, b]);
        assert_eq!(topological_order(&[b, x, a], &cache).unwrap(), vec![x, a, b]);
    }

    #[test]
    fn literal_kinds_and_indices() {
        let mut linked = Linked::default();
        linked.ints.add(42);
        assert_eq!(const_kind(&Value::Bool(true)), CONSTANT_TRUE);
        assert_eq!(const_id(&linked, CONSTANT_TRUE, &Value::Bool(true)).unwrap(), 0x0B);
        assert_eq!(const_id(&linked, CONSTANT_VOID, &Value::Undefined).unwrap(), 0);
        assert_eq!(const_id(&linked, CONSTANT_INTEGER, &Value::Int(42)).unwrap(), 1);
        let private = Namespace::new(CONSTANT_PACKAGE_INTERNAL_NS, "pkg");
        assert_eq!(const_kind(&Value::Namespace(private)), CONSTANT_PRIVATE_NS);
    }

    #[test]
    fn private_namespaces_do_not_pull_in_their_uri() {
        let cache = TypeCache::new();
        let options = OptimizeOptions::default();
        let mut l = Linker {
            cache: &cache,
            options: &options,
            out: Linked::default(),
            seen_classes: HashSet::new(),
        };
        let ns = Namespace::new(CONSTANT_PRIVATE_NS, "secret");
        l.add_name(&Name::qname(ns, "x")).unwrap();
        assert!(l.out.strings.contains(&"x".to_string()));
        assert!(!l.out.strings.contains(&"secret".to_string()));
        let typename = Name {
            kind: CONSTANT_TYPENAME,
            ..Name::public("Vector")
        };
        let err = l.add_name(&typename).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(AbcError::Structural(_))
        ));
    }
}
