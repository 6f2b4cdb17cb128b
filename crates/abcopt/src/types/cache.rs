//! The symbol/type context shared by every stage of one optimization unit.

use super::model::*;
use super::name::{Name, Namespace};
use super::value::Value;
use crate::abc::constants::*;
use std::collections::{HashMap, HashSet};

/// Ids of the built-in types, created once per cache.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub any: TypeId,
    pub object: TypeId,
    pub class: TypeId,
    pub function: TypeId,
    pub array: TypeId,
    pub int: TypeId,
    pub uint: TypeId,
    pub number: TypeId,
    pub boolean: TypeId,
    pub string: TypeId,
    pub namespace: TypeId,
    pub void: TypeId,
    pub null: TypeId,
    pub xml: TypeId,
    pub xmllist: TypeId,
}

/// Machine representation the verifier assigns to a value of some type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    Atom,
    Int,
    Uint,
    Double,
    Bool,
    Ptr,
}

/// Owns every type and method of the linked program.
#[derive(Debug)]
pub struct TypeCache {
    types: Vec<Type>,
    methods: Vec<Method>,
    named: HashMap<Name, TypeId>,
    globals: Vec<(Name, Typeref)>,
    globals_by_local: HashMap<String, Vec<usize>>,
    /// Types used as a base class somewhere; these are never emitted as `*`.
    pub base_types: HashSet<TypeId>,
    /// Names of namespace constants, used for native labels.
    pub namespace_names: HashMap<Namespace, Name>,
    pub builtins: Builtins,
    next_unique: u32,
}

impl Default for TypeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeCache {
    pub fn new() -> Self {
        let mut cache = TypeCache {
            types: Vec::new(),
            methods: Vec::new(),
            named: HashMap::new(),
            globals: Vec::new(),
            globals_by_local: HashMap::new(),
            base_types: HashSet::new(),
            namespace_names: HashMap::new(),
            builtins: Builtins {
                any: TypeId(0),
                object: TypeId(0),
                class: TypeId(0),
                function: TypeId(0),
                array: TypeId(0),
                int: TypeId(0),
                uint: TypeId(0),
                number: TypeId(0),
                boolean: TypeId(0),
                string: TypeId(0),
                namespace: TypeId(0),
                void: TypeId(0),
                null: TypeId(0),
                xml: TypeId(0),
                xmllist: TypeId(0),
            },
            next_unique: 0,
        };

        let any = cache.add_type(Type::new(Name::public("*")));
        cache.types[any.0 as usize].default_value = Value::Undefined;
        let object = cache.builtin("Object", None, Value::Null);
        let b = Builtins {
            any,
            object,
            class: cache.builtin("Class", Some(object), Value::Null),
            function: cache.builtin("Function", Some(object), Value::Null),
            array: cache.builtin("Array", Some(object), Value::Null),
            int: cache.builtin("int", Some(object), Value::Int(0)),
            uint: cache.builtin("uint", Some(object), Value::Uint(0)),
            number: cache.builtin("Number", Some(object), Value::Double(f64::NAN)),
            boolean: cache.builtin("Boolean", Some(object), Value::Bool(false)),
            string: cache.builtin("String", Some(object), Value::Null),
            namespace: cache.builtin("Namespace", Some(object), Value::Null),
            void: cache.builtin("void", None, Value::Undefined),
            null: {
                let t = cache.add_type(Type::new(Name::public("null")));
                cache.types[t.0 as usize].primitive = true;
                t
            },
            xml: cache.builtin("XML", Some(object), Value::Null),
            xmllist: cache.builtin("XMLList", Some(object), Value::Null),
        };
        for t in [b.int, b.uint, b.number] {
            cache.types[t.0 as usize].numeric = true;
        }
        for t in [b.int, b.uint, b.number, b.boolean, b.string, b.void] {
            cache.types[t.0 as usize].primitive = true;
        }
        cache.builtins = b;
        cache
    }

    fn builtin(&mut self, name: &str, base: Option<TypeId>, default_value: Value) -> TypeId {
        let name = Name::public(name);
        let mut t = Type::new(name.clone());
        t.base = base;
        t.default_value = default_value;
        t.placeholder = true;
        let id = self.add_type(t);
        self.named.insert(name, id);
        id
    }

    // ── Arenas ───────────────────────────────────────────────────────────────

    pub fn add_type(&mut self, t: Type) -> TypeId {
        self.types.push(t);
        TypeId((self.types.len() - 1) as u32)
    }

    pub fn ty(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn ty_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.0 as usize]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn add_method(&mut self, m: Method) -> MethodId {
        self.methods.push(m);
        MethodId((self.methods.len() - 1) as u32)
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.0 as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.0 as usize]
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// A fresh identity for a private or internal namespace.
    pub fn unique_ns(&mut self, kind: u8, uri: String) -> Namespace {
        self.next_unique += 1;
        Namespace {
            kind,
            uri,
            unique: self.next_unique,
        }
    }

    // ── Named types ──────────────────────────────────────────────────────────

    /// Reference to `t` with its natural nullability: value types are
    /// non-nullable, everything else nullable.
    pub fn tref(&self, t: TypeId) -> Typeref {
        let b = &self.builtins;
        let nullable = !(t == b.int || t == b.uint || t == b.number || t == b.boolean);
        Typeref::new(t, nullable)
    }

    pub fn named(&self, name: &Name) -> Option<TypeId> {
        if let Some(&t) = self.named.get(name) {
            return Some(t);
        }
        if name.is_qname() {
            return None;
        }
        name.nsset.iter().find_map(|ns| {
            let q = Name::qname(ns.clone(), name.local_name());
            self.named.get(&q).copied()
        })
    }

    /// Resolves a type name, creating a placeholder based on `Object` when
    /// the type has not been declared yet.
    pub fn lookup(&mut self, name: &Name) -> TypeId {
        if let Some(t) = self.named(name) {
            return t;
        }
        let mut t = Type::new(name.clone());
        t.base = Some(self.builtins.object);
        t.placeholder = true;
        t.emit_as_any = name.kind == CONSTANT_TYPENAME;
        let id = self.add_type(t);
        self.named.insert(name.clone(), id);
        id
    }

    /// The type a class declaration fills in. A pending placeholder is
    /// reused in place so earlier references stay valid.
    pub fn declare(&mut self, name: &Name) -> TypeId {
        if let Some(&id) = self.named.get(name) {
            if self.ty(id).placeholder {
                self.ty_mut(id).placeholder = false;
                return id;
            }
        }
        let id = self.add_type(Type::new(name.clone()));
        self.named.insert(name.clone(), id);
        id
    }

    // ── Globals ──────────────────────────────────────────────────────────────

    /// Record the script defining `name`; a later definition replaces an
    /// earlier one.
    pub fn add_global(&mut self, name: Name, script: Typeref) {
        if let Some(candidates) = self.globals_by_local.get(name.local_name()) {
            if let Some(&i) = candidates.iter().find(|&&i| self.globals[i].0 == name) {
                self.globals[i].1 = script;
                return;
            }
        }
        let idx = self.globals.len();
        self.globals_by_local
            .entry(name.local_name().to_string())
            .or_default()
            .push(idx);
        self.globals.push((name, script));
    }

    fn global_entry(&self, name: &Name) -> Option<&(Name, Typeref)> {
        let candidates = self.globals_by_local.get(name.local_name())?;
        candidates.iter().map(|&i| &self.globals[i]).find(|(g, _)| {
            if name.is_qname() {
                g == name
            } else {
                name.matches(g)
            }
        })
    }

    /// Script type that defines `name`, if any.
    pub fn global(&self, name: &Name) -> Option<Typeref> {
        self.global_entry(name).map(|(_, t)| *t)
    }

    /// Qualified name of the global that `name` resolves to.
    pub fn global_name(&self, name: &Name) -> Option<Name> {
        self.global_entry(name).map(|(n, _)| n.clone())
    }

    // ── Binding resolution ───────────────────────────────────────────────────

    /// Walks `t` and its bases for a binding resolving `name`.
    pub fn find(&self, t: TypeId, name: &Name) -> Option<&Binding> {
        self.find_with_owner(t, name).map(|(owner, i)| &self.ty(owner).defs[i])
    }

    pub fn find_with_owner(&self, t: TypeId, name: &Name) -> Option<(TypeId, usize)> {
        if name.is_runtime() {
            return None;
        }
        let mut cur = Some(t);
        while let Some(id) = cur {
            let ty = self.ty(id);
            if let Some(i) = ty.lookup_own(name) {
                return Some((id, i));
            }
            cur = ty.base;
        }
        None
    }

    /// Like [`find`](Self::find), but a setter is replaced by its getter.
    pub fn find_get(&self, t: TypeId, name: &Name) -> Option<&Binding> {
        let (owner, mut i) = self.find_with_owner(t, name)?;
        let defs = &self.ty(owner).defs;
        let mut guard = defs.len();
        while defs[i].is_setter() && guard > 0 {
            match defs[i].peer {
                Some(p) => i = p,
                None => break,
            }
            guard -= 1;
        }
        Some(&defs[i])
    }

    /// The slot binding with index `slot` on `t` or its bases.
    pub fn find_slot(&self, t: TypeId, slot: u32) -> Option<&Binding> {
        let mut cur = Some(t);
        while let Some(id) = cur {
            let ty = self.ty(id);
            if let Some(b) = ty.find_own_slot(slot) {
                return Some(b);
            }
            cur = ty.base;
        }
        None
    }

    // ── Type relations ───────────────────────────────────────────────────────

    /// `t` is `base`, derives from it or implements it.
    pub fn extends_or_is(&self, t: TypeId, base: TypeId) -> bool {
        let mut seen = HashSet::new();
        let mut work = vec![t];
        while let Some(id) = work.pop() {
            if id == base {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            let ty = self.ty(id);
            work.extend(ty.base);
            work.extend(ty.interfaces.iter().copied());
        }
        false
    }

    pub fn is_atom(&self, t: TypeId) -> bool {
        let b = &self.builtins;
        t == b.any || t == b.object || t == b.void
    }

    pub fn is_numeric(&self, t: TypeId) -> bool {
        self.ty(t).numeric
    }

    pub fn is_primitive(&self, t: TypeId) -> bool {
        self.ty(t).primitive
    }

    pub fn is_pointer(&self, t: TypeId) -> bool {
        !self.is_atom(t) && !self.is_numeric(t) && t != self.builtins.boolean
    }

    pub fn machine_kind(&self, t: TypeId) -> MachineKind {
        let b = &self.builtins;
        if self.is_atom(t) {
            MachineKind::Atom
        } else if t == b.int {
            MachineKind::Int
        } else if t == b.uint {
            MachineKind::Uint
        } else if t == b.number {
            MachineKind::Double
        } else if t == b.boolean {
            MachineKind::Bool
        } else {
            MachineKind::Ptr
        }
    }

    pub fn is_machine_compatible(&self, a: TypeId, b: TypeId) -> bool {
        self.machine_kind(a) == self.machine_kind(b)
    }

    pub fn default_value(&self, t: TypeId) -> Value {
        self.ty(t).default_value.clone()
    }

    /// Most derived common base, with `null` absorbed by pointer types.
    pub fn mdb(&self, a: Typeref, b: Typeref) -> Typeref {
        if a == b {
            return a;
        }
        let null = self.builtins.null;
        if a.t == null && self.is_pointer(b.t) {
            return b.nullable();
        }
        if b.t == null && self.is_pointer(a.t) {
            return a.nullable();
        }
        let nullable = a.nullable || b.nullable;
        let mut bases = HashSet::new();
        let mut cur = Some(a.t);
        while let Some(t) = cur {
            if !bases.insert(t) {
                break;
            }
            cur = self.ty(t).base;
        }
        let mut cur = Some(b.t);
        let mut steps = 0;
        while let Some(t) = cur {
            if bases.contains(&t) {
                return Typeref::new(t, nullable);
            }
            steps += 1;
            if steps > self.types.len() {
                break;
            }
            cur = self.ty(t).base;
        }
        Typeref::new(self.builtins.any, nullable)
    }

    /// The merge a verifier performs at a join: numbers merge to `Number`,
    /// `void` and `null` defer to the other side.
    pub fn type_meet(&self, a: TypeId, b: TypeId) -> TypeId {
        let bi = &self.builtins;
        if a == b {
            a
        } else if self.is_numeric(a) && self.is_numeric(b) {
            bi.number
        } else if a == bi.void || a == bi.null {
            b
        } else if b == bi.void || b == bi.null {
            a
        } else {
            self.mdb(self.tref(a), self.tref(b)).t
        }
    }

    /// Display name of a type.
    pub fn type_name(&self, t: TypeId) -> &Name {
        &self.ty(t).name
    }

    // ── Readiness ────────────────────────────────────────────────────────────

    /// Queue `m` for optimization the first time it is seen with a body.
    pub fn ready_method(&mut self, m: MethodId, ready: &mut Vec<MethodId>) {
        let method = self.method_mut(m);
        if method.body.is_some() && !method.ready {
            method.ready = true;
            ready.push(m);
        }
    }

    /// Queue the initializer and every method bound on `t`.
    pub fn ready_type(&mut self, t: TypeId, ready: &mut Vec<MethodId>) {
        let ty = self.ty(t);
        let methods: Vec<MethodId> = ty
            .init
            .into_iter()
            .chain(ty.defs.iter().filter_map(|b| b.method))
            .collect();
        for m in methods {
            self.ready_method(m, ready);
        }
    }
}
