//! Serialization of the optimized program.
//!
//! ```text
//!   TypeCache + AbcFile
//!          │
//!          ▼
//!   ┌─────────────┐   pools sorted by use count,
//!   │  link.rs    │   classes ordered base-first
//!   └──────┬──────┘
//!          │ Linked
//!          ▼
//!   ┌─────────────┐   header, pools, signatures,
//!   │  mod.rs     │   instances, classes, scripts
//!   └──────┬──────┘
//!          │ per body
//!          ▼
//!   ┌─────────────┐   instructions, branch offsets,
//!   │  code.rs    │   exception table
//!   └─────────────┘
//! ```
//!
//! Metadata is never written and trait attributes lose their metadata bit.
//! Private and internal namespaces are all emitted as distinct private
//! namespaces with an empty URI.

mod code;
mod link;
mod pool;

pub use link::{link, Linked};
pub use pool::Pool;

use crate::abc::constants::*;
use crate::abc::Writer;
use crate::error::AbcError;
use crate::types::{Binding, MethodId, Name, Namespace, TypeCache, TypeId};
use crate::OptimizeOptions;
use anyhow::{Context, Result};
use tracing::debug;

/// Serialize everything `linked` reached into an ABC file.
pub fn write_abc(cache: &TypeCache, linked: &Linked, options: &OptimizeOptions) -> Result<Vec<u8>> {
    let mut e = Emitter {
        cache,
        linked,
        options,
        w: Writer::new(),
    };
    e.header();
    e.pools()?;
    e.signatures()?;
    e.types()?;
    e.bodies()?;
    debug!(bytes = e.w.len(), "wrote abc");
    Ok(e.w.into_bytes())
}

struct Emitter<'a> {
    cache: &'a TypeCache,
    linked: &'a Linked,
    options: &'a OptimizeOptions,
    w: Writer,
}

impl Emitter<'_> {
    fn header(&mut self) {
        self.w.write_u16(MINOR_VERSION);
        self.w.write_u16(MAJOR_VERSION);
    }

    // ── Pools ────────────────────────────────────────────────────────────────

    fn pools(&mut self) -> Result<()> {
        let l = self.linked;
        let w = &mut self.w;

        w.write_u30(count(&l.ints));
        for &v in l.ints.values() {
            w.write_u30(v as u32);
        }
        w.write_u30(count(&l.uints));
        for &v in l.uints.values() {
            w.write_u30(v);
        }
        w.write_u30(count(&l.doubles));
        for &bits in l.doubles.values() {
            w.write_f64(f64::from_bits(bits));
        }
        w.write_u30(count(&l.strings));
        for s in l.strings.values() {
            w.write_string(s);
        }

        w.write_u30(count(&l.namespaces));
        for ns in l.namespaces.values() {
            if ns.is_private_or_internal() {
                w.write_u8(CONSTANT_PRIVATE_NS);
                w.write_u30(0);
            } else {
                w.write_u8(ns.kind);
                w.write_u30(l.strings.id(&ns.uri)?);
            }
        }
        w.write_u30(count(&l.nssets));
        for set in l.nssets.values() {
            w.write_index(set.len());
            for ns in set {
                w.write_u30(l.namespaces.id(ns)?);
            }
        }

        w.write_u30(count(&l.names));
        for n in l.names.values() {
            name_entry(w, l, n)?;
        }
        Ok(())
    }

    // ── Methods ──────────────────────────────────────────────────────────────

    fn signatures(&mut self) -> Result<()> {
        let l = self.linked;
        self.w.write_u30(l.natives.size());
        for &m in l.methods.values().iter().chain(l.natives.values()) {
            self.signature(m)
                .with_context(|| format!("failed to write {}", self.cache.method(m).name))?;
        }
        // metadata
        self.w.write_u30(0);
        Ok(())
    }

    fn signature(&mut self, m: MethodId) -> Result<()> {
        let (cache, l) = (self.cache, self.linked);
        let method = cache.method(m);
        let w = &mut self.w;

        w.write_index(method.param_count());
        w.write_u30(l.type_ref(method.returns.t, cache)?);
        for p in method.params.iter().skip(1) {
            w.write_u30(l.type_ref(p.t, cache)?);
        }
        if self.options.preserve_method_names {
            w.write_u30(l.strings.id(&method.debug_name)?);
        } else {
            w.write_u30(0);
        }

        let names = method
            .param_names
            .as_ref()
            .filter(|_| !self.options.strip_debug_info && method.has_param_names());
        let mut flags = method.flags;
        if names.is_none() {
            flags &= !METHOD_HAS_PARAM_NAMES;
        }
        w.write_u8(flags);

        if method.has_optional() {
            w.write_index(method.optional_count);
            let first = method.values.len().saturating_sub(method.optional_count);
            for i in first..method.values.len() {
                let v = method.values[i].as_ref().ok_or_else(|| {
                    AbcError::internal(format!("parameter {} has no default value", i))
                })?;
                let (id, kind) = code::constant(l, v)?;
                w.write_u30(id);
                w.write_u8(kind);
            }
        }
        if let Some(names) = names {
            for n in names.iter().skip(1) {
                w.write_u30(l.strings.id(&n.local_name().to_string())?);
            }
        }
        Ok(())
    }

    // ── Classes and scripts ─────────────────────────────────────────────────

    fn types(&mut self) -> Result<()> {
        let (cache, l) = (self.cache, self.linked);
        self.w.write_index(l.classes.len());
        for &c in &l.classes {
            let it = itype(cache, c)?;
            self.instance(it)
                .with_context(|| format!("failed to write class {}", cache.type_name(it)))?;
        }
        for &c in &l.classes {
            self.method_ref(cache.ty(c).init)?;
            self.traits(c)?;
        }
        self.w.write_index(l.scripts.len());
        for &s in &l.scripts {
            self.method_ref(cache.ty(s).init)?;
            self.traits(s)?;
        }
        Ok(())
    }

    fn instance(&mut self, it: TypeId) -> Result<()> {
        let (cache, l) = (self.cache, self.linked);
        let ty = cache.ty(it);
        self.w.write_u30(l.names.id(&ty.name)?);
        match ty.base {
            Some(b) => self.w.write_u30(l.type_ref(b, cache)?),
            None => self.w.write_u30(0),
        }
        self.w.write_u8(ty.flags);
        if ty.has_protected_ns() {
            let ns = ty.protected_ns.as_ref().ok_or_else(|| {
                AbcError::internal(format!("{} lacks its protected namespace", ty.name))
            })?;
            self.w.write_u30(l.namespaces.id(ns)?);
        }
        self.w.write_index(ty.interfaces.len());
        for &i in &ty.interfaces {
            self.w.write_u30(l.names.id(cache.type_name(i))?);
        }
        self.method_ref(ty.init)?;
        self.traits(it)
    }

    fn method_ref(&mut self, m: Option<MethodId>) -> Result<()> {
        let m = m.ok_or_else(|| AbcError::internal("type without initializer"))?;
        let id = self.linked.method_id(m, self.cache)?;
        self.w.write_u30(id);
        Ok(())
    }

    fn traits(&mut self, t: TypeId) -> Result<()> {
        let cache = self.cache;
        let ty = cache.ty(t);
        let inherited_slots = ty.base.map_or(0, |b| cache.ty(b).slot_count);
        self.w.write_index(ty.defs.len());
        for b in &ty.defs {
            self.binding(b, inherited_slots)
                .with_context(|| format!("failed to write trait {}", b.name))?;
        }
        Ok(())
    }

    fn binding(&mut self, b: &Binding, inherited_slots: u32) -> Result<()> {
        let (cache, l) = (self.cache, self.linked);
        let w = &mut self.w;
        w.write_u30(l.names.id(&b.name)?);
        w.write_u8(((b.attrs & !ATTR_METADATA) << 4) | b.kind);
        match b.kind {
            TRAIT_SLOT | TRAIT_CONST => {
                w.write_u30(if inherited_slots > 0 { 0 } else { b.slot });
                w.write_u30(l.type_ref(b.ty.t, cache)?);
                match &b.value {
                    Some(v) if *v != cache.default_value(b.ty.t) => {
                        let (id, kind) = code::constant(l, v)?;
                        w.write_u30(id);
                        if id != 0 {
                            w.write_u8(kind);
                        }
                    }
                    _ => w.write_u30(0),
                }
            }
            TRAIT_CLASS => {
                let c = b
                    .class
                    .ok_or_else(|| AbcError::internal("class trait without a class"))?;
                w.write_u30(b.slot);
                w.write_u30(l.class_id(c, cache)?);
            }
            _ => {
                let m = b
                    .method
                    .ok_or_else(|| AbcError::internal("method trait without a method"))?;
                w.write_u30(0);
                w.write_u30(l.method_id(m, cache)?);
            }
        }
        Ok(())
    }

    // ── Bodies ───────────────────────────────────────────────────────────────

    fn bodies(&mut self) -> Result<()> {
        let (cache, l) = (self.cache, self.linked);
        self.w.write_index(l.body_count);
        for &m in l.methods.values().iter().chain(l.natives.values()) {
            let method = cache.method(m);
            let body = match &method.body {
                Some(body) => body,
                None => continue,
            };
            self.w.write_u30(l.method_id(m, cache)?);
            self.w.write_u30(body.max_stack);
            self.w.write_u30(body.local_count);
            self.w.write_u30(body.init_scope);
            self.w.write_u30(body.init_scope + body.max_scope);
            code::emit_code(&mut self.w, l, cache, body)
                .with_context(|| format!("failed to write the body of {}", method.name))?;
            let act = body.activation.t;
            if act == cache.builtins.any {
                self.w.write_u30(0);
            } else {
                self.traits(act)?;
            }
        }
        Ok(())
    }
}

fn count<T: Clone + Eq + std::hash::Hash + std::fmt::Debug>(p: &Pool<T>) -> u32 {
    if p.is_empty() {
        0
    } else {
        p.size()
    }
}

fn itype(cache: &TypeCache, c: TypeId) -> Result<TypeId> {
    cache
        .ty(c)
        .itype
        .ok_or_else(|| AbcError::internal(format!("{} has no instance type", cache.type_name(c))))
}

fn name_entry(w: &mut Writer, l: &Linked, n: &Name) -> Result<()> {
    let local = |n: &Name| l.strings.id(&n.local_name().to_string());
    w.write_u8(n.kind);
    match n.kind {
        CONSTANT_QNAME | CONSTANT_QNAME_A => {
            let ns = n
                .ns()
                .ok_or_else(|| AbcError::internal(format!("{} has no namespace", n)))?;
            w.write_u30(l.namespaces.id(ns)?);
            w.write_u30(local(n)?);
        }
        CONSTANT_MULTINAME | CONSTANT_MULTINAME_A => {
            w.write_u30(local(n)?);
            w.write_u30(l.nssets.id(&n.nsset)?);
        }
        CONSTANT_RTQNAME | CONSTANT_RTQNAME_A => w.write_u30(local(n)?),
        CONSTANT_MULTINAME_L | CONSTANT_MULTINAME_LA => w.write_u30(l.nssets.id(&n.nsset)?),
        CONSTANT_RTQNAME_L | CONSTANT_RTQNAME_LA => {}
        _ => {
            return Err(AbcError::structural(format!(
                "name {} cannot be written to an output file",
                n
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::Reader;

    #[test]
    fn empty_program_is_a_valid_header_and_empty_tables() {
        let cache = TypeCache::new();
        let bytes = write_abc(&cache, &Linked::default(), &OptimizeOptions::default()).unwrap();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u16().unwrap(), MINOR_VERSION);
        assert_eq!(r.read_u16().unwrap(), MAJOR_VERSION);
        // seven empty pools, methods, metadata, classes, scripts, bodies
        for _ in 0..12 {
            assert_eq!(r.read_u30().unwrap(), 0);
        }
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn private_namespaces_lose_their_uri() {
        let mut l = Linked::default();
        l.strings.add("pkg".to_string());
        l.namespaces.add(Namespace::new(CONSTANT_PACKAGE_INTERNAL_NS, "pkg"));
        l.namespaces.add(Namespace::new(CONSTANT_PACKAGE_NS, "pkg"));
        let cache = TypeCache::new();
        let mut e = Emitter {
            cache: &cache,
            linked: &l,
            options: &OptimizeOptions::default(),
            w: Writer::new(),
        };
        e.pools().unwrap();
        let bytes = e.w.into_bytes();
        // ints, uints, doubles empty; one string "pkg"
        assert_eq!(&bytes[..3], &[0, 0, 0]);
        assert_eq!(&bytes[3..8], &[2, 3, b'p', b'k', b'g']);
        assert_eq!(&bytes[8..13], &[3, CONSTANT_PRIVATE_NS, 0, CONSTANT_PACKAGE_NS, 1]);
    }
}
