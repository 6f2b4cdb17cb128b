//! The native-method boundary of the emitted file.
//!
//! The host runtime binds native methods by their position in the emitted
//! method table. This module reports, for each native reachable from the
//! emitted scripts, that position together with a stable identifier and
//! the machine representation of its return value and arguments.
//!
//! Labels are built from the trait path: a class contributes its own label
//! as prefix to the traits of both its class object and its instances,
//! and each property part is qualified by its namespace:
//!
//! | Namespace            | Label part            |
//! |----------------------|-----------------------|
//! | public, internal     | `name`                |
//! | private              | `private_name`        |
//! | protected            | `protected_name`      |
//! | user-defined         | `nsconst_name`        |
//!
//! where `nsconst` is the name of the constant the namespace was declared
//! with (or its URI with separators replaced). Accessors get `_get` and
//! `_set` suffixes and the whole label is converted to snake case.

use crate::abc::constants::*;
use crate::encoder::Linked;
use crate::error::AbcError;
use crate::types::{Binding, MethodId, Namespace, TypeCache, TypeId};
use anyhow::Result;
use heck::ToSnakeCase;
use std::fmt;
use tracing::debug;

/// Machine representation of a native argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Void,
    Int,
    Uint,
    Bool,
    Double,
    String,
    Namespace,
    /// Tagged value of any type.
    Atom,
    /// Pointer to a script object.
    Object,
}

impl NativeKind {
    fn of(cache: &TypeCache, t: TypeId) -> Self {
        let b = &cache.builtins;
        if t == b.void {
            NativeKind::Void
        } else if cache.is_atom(t) {
            NativeKind::Atom
        } else if t == b.int {
            NativeKind::Int
        } else if t == b.uint {
            NativeKind::Uint
        } else if t == b.boolean {
            NativeKind::Bool
        } else if t == b.number {
            NativeKind::Double
        } else if t == b.string {
            NativeKind::String
        } else if t == b.namespace {
            NativeKind::Namespace
        } else {
            NativeKind::Object
        }
    }
}

impl fmt::Display for NativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NativeKind::Void => "void",
            NativeKind::Int => "int",
            NativeKind::Uint => "uint",
            NativeKind::Bool => "bool",
            NativeKind::Double => "double",
            NativeKind::String => "string",
            NativeKind::Namespace => "namespace",
            NativeKind::Atom => "atom",
            NativeKind::Object => "object",
        };
        f.write_str(s)
    }
}

/// One native method of the emitted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMethod {
    /// Index in the emitted method table.
    pub id: u32,
    /// Snake-case identifier, unique per trait path.
    pub label: String,
    /// Return kind first, then the receiver and each declared parameter.
    pub signature: Vec<NativeKind>,
}

impl fmt::Display for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.id, self.label)?;
        for (i, k) in self.signature.iter().skip(1).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", k)?;
        }
        match self.signature.first() {
            Some(r) => write!(f, ") -> {}", r),
            None => f.write_str(")"),
        }
    }
}

/// Natives reachable from the scripts `linked` emits, in trait order.
pub fn collect_natives(cache: &TypeCache, linked: &Linked) -> Result<Vec<NativeMethod>> {
    let mut out = Vec::new();
    if !linked.have_natives() {
        return Ok(out);
    }
    for &s in &linked.scripts {
        traits(cache, linked, "", s, &mut out)?;
    }
    debug!(count = out.len(), "native methods");
    Ok(out)
}

fn traits(
    cache: &TypeCache,
    linked: &Linked,
    prefix: &str,
    t: TypeId,
    out: &mut Vec<NativeMethod>,
) -> Result<()> {
    let ty = cache.ty(t);
    if ty.obscure_natives {
        return Ok(());
    }
    for b in &ty.defs {
        let ns = match b.name.ns() {
            Some(ns) => ns,
            None => continue,
        };
        if let Some(m) = b.method.filter(|&m| cache.method(m).is_native()) {
            out.push(native(cache, linked, prefix, b, ns, m)?);
        } else if let Some(c) = b.class.filter(|_| b.is_class()) {
            let label = format!("{}{}_", prefix, class_label(cache, b, ns));
            traits(cache, linked, &label, c, out)?;
            if let Some(it) = cache.ty(c).itype {
                traits(cache, linked, &label, it, out)?;
            }
        }
    }
    Ok(())
}

fn native(
    cache: &TypeCache,
    linked: &Linked,
    prefix: &str,
    b: &Binding,
    ns: &Namespace,
    m: MethodId,
) -> Result<NativeMethod> {
    let mut label = format!("{}{}", prefix, prop_label(cache, b, ns));
    match b.kind {
        TRAIT_GETTER => label.push_str("_get"),
        TRAIT_SETTER => label.push_str("_set"),
        _ => {}
    }
    let label = label.to_snake_case();

    let method = cache.method(m);
    if method.has_optional() {
        return Err(AbcError::structural(format!(
            "native method {} may not have optional parameters",
            label
        )));
    }
    if method.needs_rest() {
        return Err(AbcError::structural(format!(
            "native method {} may not have rest arguments",
            label
        )));
    }

    let signature = std::iter::once(method.returns.t)
        .chain(method.params.iter().map(|p| p.t))
        .map(|t| NativeKind::of(cache, t))
        .collect();
    Ok(NativeMethod {
        id: linked.natives.id(&m)?,
        label,
        signature,
    })
}

fn prop_label(cache: &TypeCache, b: &Binding, ns: &Namespace) -> String {
    let name = b.name.local_name();
    if is_package(ns) {
        name.to_string()
    } else if ns.is_private() {
        format!("private_{}", name)
    } else if ns.is_protected() {
        format!("protected_{}", name)
    } else {
        format!("{}_{}", ns_label(cache, ns), name)
    }
}

/// Classes are never private, so their user namespace falls back to the URI.
fn class_label(cache: &TypeCache, b: &Binding, ns: &Namespace) -> String {
    let name = b.name.local_name();
    if is_package(ns) {
        name.to_string()
    } else if ns.is_protected() {
        format!("protected_{}", name)
    } else {
        format!("{}_{}", ns_label(cache, ns), name)
    }
}

fn is_package(ns: &Namespace) -> bool {
    ns.kind == CONSTANT_PACKAGE_NS || ns.is_internal()
}

fn ns_label(cache: &TypeCache, ns: &Namespace) -> String {
    match cache.namespace_names.get(ns) {
        Some(n) => n.local_name().to_string(),
        None => ns.uri.replace(['.', ' ', '$'], "_"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Method, MethodKind, Name, Type, Typeref};

    fn method(cache: &mut TypeCache, flags: u8, params: Vec<Typeref>) -> MethodId {
        let any = cache.tref(cache.builtins.any);
        let int = cache.tref(cache.builtins.int);
        let mut all = vec![any];
        all.extend(params);
        cache.add_method(Method {
            id: 0,
            abc: 0,
            params: all,
            param_names: None,
            returns: int,
            values: Vec::new(),
            optional_count: 0,
            flags,
            cx: None,
            kind: MethodKind::Function,
            name: Name::public("m"),
            debug_name: String::new(),
            body: None,
            ready: false,
        })
    }

    fn binding(cache: &TypeCache, name: Name, kind: u8, m: MethodId) -> Binding {
        let mut b = Binding::new(name, kind, 0, cache.tref(cache.builtins.any));
        b.method = Some(m);
        b
    }

    #[test]
    fn labels_follow_the_trait_path() {
        let mut cache = TypeCache::new();
        let number = cache.tref(cache.builtins.number);
        let getter = method(&mut cache, METHOD_NATIVE, vec![]);
        let secret = method(&mut cache, METHOD_NATIVE, vec![number]);

        let mut it = Type::new(Name::public("Sprite"));
        it.defs.push(binding(&cache, Name::public("alphaValue"), TRAIT_GETTER, getter));
        let private = Namespace::new(CONSTANT_PRIVATE_NS, "");
        it.defs.push(binding(&cache, Name::qname(private, "hide"), TRAIT_METHOD, secret));
        let it = cache.add_type(it);
        let mut c = Type::new(Name::public("Sprite$"));
        c.itype = Some(it);
        let c = cache.add_type(c);

        let mut script = Type::new(Name::public("global"));
        let mut cb = Binding::new(Name::public("Sprite"), TRAIT_CLASS, 0, cache.tref(c));
        cb.class = Some(c);
        script.defs.push(cb);
        let script = cache.add_type(script);

        let mut linked = Linked::default();
        linked.natives.add(getter);
        linked.natives.add(secret);
        linked.scripts.push(script);

        let natives = collect_natives(&cache, &linked).unwrap();
        let labels: Vec<&str> = natives.iter().map(|n| n.label.as_str()).collect();
        assert_eq!(labels, vec!["sprite_alpha_value_get", "sprite_private_hide"]);
        assert_eq!(natives[1].id, 1);
        assert_eq!(
            natives[1].signature,
            vec![NativeKind::Int, NativeKind::Atom, NativeKind::Double]
        );
        assert_eq!(natives[1].to_string(), "1 sprite_private_hide(atom, double) -> int");
    }

    #[test]
    fn optional_parameters_are_rejected() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, METHOD_NATIVE | METHOD_HAS_OPTIONAL, vec![]);
        let mut script = Type::new(Name::public("global"));
        script.defs.push(binding(&cache, Name::public("f"), TRAIT_METHOD, m));
        let script = cache.add_type(script);
        let mut linked = Linked::default();
        linked.natives.add(m);
        linked.scripts.push(script);

        let err = collect_natives(&cache, &linked).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(AbcError::Structural(_))
        ));
    }

    #[test]
    fn obscured_types_report_nothing() {
        let mut cache = TypeCache::new();
        let m = method(&mut cache, METHOD_NATIVE, vec![]);
        let mut script = Type::new(Name::public("global"));
        script.defs.push(binding(&cache, Name::public("f"), TRAIT_METHOD, m));
        script.obscure_natives = true;
        let script = cache.add_type(script);
        let mut linked = Linked::default();
        linked.natives.add(m);
        linked.scripts.push(script);
        assert!(collect_natives(&cache, &linked).unwrap().is_empty());
    }
}
