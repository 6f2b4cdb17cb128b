//! Reading a whole ABC file into the shared [`TypeCache`].
//!
//! ## Algorithm
//!
//! 1. Check the version header before touching the cache.
//! 2. Read the constant pools. Index 0 of every pool is the reserved
//!    "absent" entry, so a pool with count `n` carries `n - 1` records.
//! 3. Read method signatures with `*` for every type, then metadata.
//! 4. Read instances, declaring each class name (filling in any forward
//!    placeholder), then resolve method signature types now that every
//!    class of the file is known.
//! 5. Read class objects and scripts. Script traits become globals.
//! 6. Decode every method body into IR.
//! 7. Resolve slot types and compute native slot offsets.

use super::constants::*;
use super::reader::Reader;
use crate::error::AbcError;
use crate::ir::{decode_body, BodyInput, Handler};
use crate::types::*;
use crate::OptimizeOptions;
use anyhow::{Context, Result};
use std::collections::HashSet;
use tracing::{debug, info};

// ── Constant pools ───────────────────────────────────────────────────────────

/// Constant pools of one file, with index 0 reserved in each.
#[derive(Debug, Clone, Default)]
pub struct ConstantPools {
    pub ints: Vec<i32>,
    pub uints: Vec<u32>,
    pub doubles: Vec<f64>,
    pub strings: Vec<String>,
    pub namespaces: Vec<Namespace>,
    pub nssets: Vec<Vec<Namespace>>,
    pub names: Vec<Option<Name>>,
}

fn pool_entry<'a, T>(pool: &'a [T], i: u32, what: &str) -> Result<&'a T> {
    pool.get(i as usize).ok_or_else(|| {
        AbcError::format(format!(
            "{} index {} out of range (pool size {})",
            what,
            i,
            pool.len()
        ))
    })
}

impl ConstantPools {
    pub fn int(&self, i: u32) -> Result<i32> {
        pool_entry(&self.ints, i, "int").copied()
    }

    pub fn uint(&self, i: u32) -> Result<u32> {
        pool_entry(&self.uints, i, "uint").copied()
    }

    pub fn double(&self, i: u32) -> Result<f64> {
        pool_entry(&self.doubles, i, "double").copied()
    }

    pub fn string(&self, i: u32) -> Result<&str> {
        pool_entry(&self.strings, i, "string").map(String::as_str)
    }

    pub fn namespace(&self, i: u32) -> Result<&Namespace> {
        pool_entry(&self.namespaces, i, "namespace")
    }

    pub fn nsset(&self, i: u32) -> Result<&[Namespace]> {
        if i == 0 {
            return Err(AbcError::format("namespace set index 0"));
        }
        pool_entry(&self.nssets, i, "namespace set").map(Vec::as_slice)
    }

    /// A name that must be present.
    pub fn name(&self, i: u32) -> Result<&Name> {
        self.opt_name(i)?
            .ok_or_else(|| AbcError::format(format!("name index {} is absent", i)))
    }

    /// A name where index 0 means "none" (or `*` in type positions).
    pub fn opt_name(&self, i: u32) -> Result<Option<&Name>> {
        if i == 0 {
            return Ok(None);
        }
        pool_entry(&self.names, i, "name").map(Option::as_ref)
    }

    /// Literal of a slot or parameter default, tagged by constant kind.
    pub fn default_value(&self, kind: u8, i: u32) -> Result<Value> {
        Ok(match kind {
            CONSTANT_FALSE => Value::Bool(false),
            CONSTANT_TRUE => Value::Bool(true),
            CONSTANT_NULL => Value::Null,
            CONSTANT_VOID => Value::Undefined,
            CONSTANT_UTF8 => Value::String(self.string(i)?.to_string()),
            CONSTANT_INTEGER => Value::Int(self.int(i)?),
            CONSTANT_UINTEGER => Value::Uint(self.uint(i)?),
            CONSTANT_DOUBLE => Value::Double(self.double(i)?),
            k if is_namespace_kind(k) => Value::Namespace(self.namespace(i)?.clone()),
            k => {
                return Err(AbcError::format(format!(
                    "unknown default value kind 0x{:02x}",
                    k
                )))
            }
        })
    }
}

/// Reads a pool count and the `count - 1` entries that follow.
fn read_pool<T>(
    p: &mut Reader<'_>,
    zero: T,
    mut entry: impl FnMut(&mut Reader<'_>, usize) -> Result<T>,
) -> Result<Vec<T>> {
    let count = p.read_index()?;
    let mut pool = Vec::with_capacity(count.clamp(1, p.remaining() + 1));
    pool.push(zero);
    for i in 1..count {
        let v = entry(p, i)?;
        pool.push(v);
    }
    Ok(pool)
}

// ── Files ────────────────────────────────────────────────────────────────────

/// A file read into the cache.
///
/// Pools are kept only for diagnostics; every reference inside types and
/// IR has already been resolved against them.
#[derive(Debug, Clone)]
pub struct AbcFile {
    pub id: AbcId,
    pub pools: ConstantPools,
    pub methods: Vec<MethodId>,
    pub metadata: Vec<Metadata>,
    /// Class objects; `ty(c).itype` is the instance type.
    pub classes: Vec<TypeId>,
    pub scripts: Vec<TypeId>,
    /// Files linked into this one by [`combine`](Self::combine), itself first.
    pub merged: Vec<AbcId>,
    /// Input size in bytes.
    pub len: usize,
}

impl AbcFile {
    /// Link `other` into this file as a peer: its methods, classes and
    /// scripts are appended and its methods now belong to this file.
    pub fn combine(&mut self, other: AbcFile, cache: &mut TypeCache) {
        for &m in &other.methods {
            cache.method_mut(m).abc = self.id;
        }
        self.methods.extend(other.methods);
        self.metadata.extend(other.metadata);
        self.classes.extend(other.classes);
        self.scripts.extend(other.scripts);
        self.merged.extend(other.merged);
        self.len += other.len;
    }

    pub fn is_merged(&self, abc: AbcId) -> bool {
        self.merged.contains(&abc)
    }

    /// Mark every class and script of this file so its natives are not
    /// reported by name.
    pub fn obscure_natives(&self, cache: &mut TypeCache) {
        for &t in self.classes.iter().chain(&self.scripts) {
            cache.ty_mut(t).obscure_natives = true;
            if let Some(it) = cache.ty(t).itype {
                cache.ty_mut(it).obscure_natives = true;
            }
        }
    }
}

/// Method signature indices kept until every class of the file is declared.
#[derive(Debug, Default)]
struct RawSignature {
    returns: u32,
    params: Vec<u32>,
    optional: Vec<(u32, u8)>,
}

struct Parser<'c, 'o> {
    id: AbcId,
    cache: &'c mut TypeCache,
    options: &'o OptimizeOptions,
    pools: ConstantPools,
    methods: Vec<MethodId>,
    metadata: Vec<Metadata>,
    classes: Vec<TypeId>,
    to_resolve: Vec<TypeId>,
}

/// Read `bytes` as file number `id`.
pub fn read_abc(
    bytes: &[u8],
    id: AbcId,
    cache: &mut TypeCache,
    options: &OptimizeOptions,
) -> Result<AbcFile> {
    let mut p = Reader::new(bytes);
    let minor = p.read_u16()?;
    let major = p.read_u16()?;
    if minor != MINOR_VERSION || major != MAJOR_VERSION {
        return Err(AbcError::format(format!(
            "not an abc file (version {}.{})",
            major, minor
        )));
    }

    let mut parser = Parser {
        id,
        cache,
        options,
        pools: ConstantPools::default(),
        methods: Vec::new(),
        metadata: Vec::new(),
        classes: Vec::new(),
        to_resolve: Vec::new(),
    };
    parser.read_pools(&mut p).context("failed to read constant pools")?;

    let mut signatures = Vec::new();
    let method_count = p.read_index()?;
    for i in 0..method_count {
        let sig = parser
            .read_method(&mut p, i)
            .with_context(|| format!("failed to read method {}", i))?;
        signatures.push(sig);
    }

    let metadata_count = p.read_index()?;
    for _ in 0..metadata_count {
        let md = parser.read_metadata(&mut p)?;
        parser.metadata.push(md);
    }

    let class_count = p.read_index()?;
    let mut instances = Vec::new();
    for i in 0..class_count {
        let t = parser
            .read_instance(&mut p)
            .with_context(|| format!("failed to read instance {}", i))?;
        instances.push(t);
    }

    for (i, sig) in signatures.iter().enumerate() {
        parser.resolve_signature(parser.methods[i], sig)?;
    }

    for it in instances {
        let c = parser.read_class(&mut p, it)?;
        parser.classes.push(c);
    }

    let script_count = p.read_index()?;
    let mut scripts = Vec::with_capacity(script_count.min(p.remaining()));
    for i in 0..script_count {
        scripts.push(parser.read_script(&mut p, i)?);
    }

    let body_count = p.read_index()?;
    for _ in 0..body_count {
        parser.read_body(&mut p)?;
    }

    let mut resolved = HashSet::new();
    for t in std::mem::take(&mut parser.to_resolve) {
        parser.resolve_type(t, &mut resolved)?;
    }

    info!(
        file = id,
        bytes = bytes.len(),
        methods = parser.methods.len(),
        classes = parser.classes.len(),
        scripts = scripts.len(),
        "read abc"
    );

    Ok(AbcFile {
        id,
        pools: parser.pools,
        methods: parser.methods,
        metadata: parser.metadata,
        classes: parser.classes,
        scripts,
        merged: vec![id],
        len: bytes.len(),
    })
}

impl Parser<'_, '_> {
    fn read_pools(&mut self, p: &mut Reader<'_>) -> Result<()> {
        self.pools.ints = read_pool(p, 0, |p, _| Ok(p.read_u30()? as i32))?;
        self.pools.uints = read_pool(p, 0, |p, _| p.read_u30())?;
        self.pools.doubles = read_pool(p, f64::NAN, |p, _| p.read_f64())?;
        self.pools.strings = read_pool(p, String::new(), |p, _| p.read_string())?;

        let strings = &self.pools.strings;
        let cache = &mut *self.cache;
        self.pools.namespaces = read_pool(p, Namespace::public(), |p, _| {
            let kind = p.read_u8()?;
            if !is_namespace_kind(kind) {
                return Err(AbcError::format(format!(
                    "unknown namespace kind 0x{:02x}",
                    kind
                )));
            }
            let uri = pool_entry(strings, p.read_u30()?, "string")?.clone();
            Ok(if kind == CONSTANT_PRIVATE_NS || kind == CONSTANT_PACKAGE_INTERNAL_NS {
                cache.unique_ns(kind, uri)
            } else {
                Namespace::new(kind, uri)
            })
        })?;

        let namespaces = &self.pools.namespaces;
        self.pools.nssets = read_pool(p, Vec::new(), |p, _| {
            let n = p.read_index()?;
            let mut set = Vec::with_capacity(n.min(p.remaining()));
            for _ in 0..n {
                set.push(pool_entry(namespaces, p.read_u30()?, "namespace")?.clone());
            }
            Ok(set)
        })?;

        let count = p.read_index()?;
        self.pools.names = vec![None];
        for _ in 1..count {
            let name = self.read_name(p)?;
            self.pools.names.push(Some(name));
        }
        debug!(
            ints = self.pools.ints.len(),
            strings = self.pools.strings.len(),
            names = self.pools.names.len(),
            "pools"
        );
        Ok(())
    }

    fn read_name(&self, p: &mut Reader<'_>) -> Result<Name> {
        let pools = &self.pools;
        let kind = p.read_u8()?;
        Ok(match kind {
            CONSTANT_QNAME | CONSTANT_QNAME_A => {
                let ns = pools.namespace(p.read_u30()?)?.clone();
                let name = pools.string(p.read_u30()?)?.to_string();
                let mut n = Name::qname(ns, name);
                n.kind = kind;
                n
            }
            CONSTANT_MULTINAME | CONSTANT_MULTINAME_A => {
                let name = pools.string(p.read_u30()?)?.to_string();
                let nsset = pools.nsset(p.read_u30()?)?.to_vec();
                Name::multiname(kind, Some(name), nsset)
            }
            CONSTANT_RTQNAME | CONSTANT_RTQNAME_A => {
                let name = pools.string(p.read_u30()?)?.to_string();
                Name::multiname(kind, Some(name), Vec::new())
            }
            CONSTANT_MULTINAME_L | CONSTANT_MULTINAME_LA => {
                let nsset = pools.nsset(p.read_u30()?)?.to_vec();
                Name::multiname(kind, None, nsset)
            }
            CONSTANT_RTQNAME_L | CONSTANT_RTQNAME_LA => Name::multiname(kind, None, Vec::new()),
            CONSTANT_TYPENAME => {
                let base = self.earlier_name(p.read_u30()?)?;
                let count = p.read_index()?;
                if count != 1 {
                    return Err(AbcError::format(format!(
                        "type name with {} parameters",
                        count
                    )));
                }
                let param = self.earlier_name(p.read_u30()?)?;
                let mut n = Name::multiname(kind, base.name.clone(), base.nsset.clone());
                n.type_param = Some(Box::new(param.clone()));
                n
            }
            k => return Err(AbcError::format(format!("unknown name kind 0x{:02x}", k))),
        })
    }

    /// A name already read from the pool being filled.
    fn earlier_name(&self, i: u32) -> Result<&Name> {
        self.pools
            .names
            .get(i as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| AbcError::format(format!("type name refers to name {}", i)))
    }

    fn read_method(&mut self, p: &mut Reader<'_>, i: usize) -> Result<RawSignature> {
        let param_count = p.read_index()?;
        let mut sig = RawSignature {
            returns: p.read_u30()?,
            ..Default::default()
        };
        for _ in 0..param_count {
            sig.params.push(p.read_u30()?);
        }
        let debug_name = self.pools.string(p.read_u30()?)?.to_string();
        let flags = p.read_u8()?;

        let mut optional_count = 0;
        if flags & METHOD_HAS_OPTIONAL != 0 {
            optional_count = p.read_index()?;
            if optional_count == 0 || optional_count > param_count {
                return Err(AbcError::format(format!(
                    "{} optional parameters of {}",
                    optional_count, param_count
                )));
            }
            for _ in 0..optional_count {
                let idx = p.read_u30()?;
                let kind = p.read_u8()?;
                sig.optional.push((idx, kind));
            }
        }
        let mut param_names = None;
        if flags & METHOD_HAS_PARAM_NAMES != 0 {
            let mut names = vec![Name::public("this")];
            for _ in 0..param_count {
                names.push(Name::public(self.pools.string(p.read_u30()?)?));
            }
            param_names = Some(names);
        }

        let any = self.cache.tref(self.cache.builtins.any);
        let m = self.cache.add_method(Method {
            id: i as u32,
            abc: self.id,
            params: vec![any; param_count + 1],
            param_names,
            returns: any,
            values: Vec::new(),
            optional_count,
            flags,
            cx: None,
            kind: MethodKind::Function,
            name: Name::public(debug_name.clone()),
            debug_name,
            body: None,
            ready: false,
        });
        self.methods.push(m);
        Ok(sig)
    }

    fn resolve_signature(&mut self, m: MethodId, sig: &RawSignature) -> Result<()> {
        let returns = self.lookup(sig.returns)?;
        let mut params = Vec::with_capacity(sig.params.len());
        for &idx in &sig.params {
            // parameters stay nullable for the verifier
            params.push(self.lookup(idx)?.nullable());
        }
        let mut values = Vec::new();
        if !sig.optional.is_empty() {
            values = vec![None; params.len() + 1];
            let first = params.len() + 1 - sig.optional.len();
            for (j, &(idx, kind)) in sig.optional.iter().enumerate() {
                values[first + j] = Some(self.pools.default_value(kind, idx)?);
            }
        }
        let method = self.cache.method_mut(m);
        method.returns = returns;
        method.params.truncate(1);
        method.params.extend(params);
        method.values = values;
        Ok(())
    }

    fn read_metadata(&self, p: &mut Reader<'_>) -> Result<Metadata> {
        let name = self.pools.string(p.read_u30()?)?.to_string();
        let n = p.read_index()?;
        let mut keys = Vec::with_capacity(n.min(p.remaining()));
        for _ in 0..n {
            keys.push(self.pools.string(p.read_u30()?)?.to_string());
        }
        let mut attrs = Vec::with_capacity(keys.len());
        for key in keys {
            attrs.push((key, self.pools.string(p.read_u30()?)?.to_string()));
        }
        Ok(Metadata { name, attrs })
    }

    /// `*` for index 0, otherwise the named type (a placeholder if needed).
    fn lookup(&mut self, i: u32) -> Result<Typeref> {
        match self.pools.opt_name(i)? {
            None => Ok(self.cache.tref(self.cache.builtins.any)),
            Some(name) => {
                let t = self.cache.lookup(name);
                Ok(self.cache.tref(t))
            }
        }
    }

    fn method_ref(&self, i: u32) -> Result<MethodId> {
        self.methods
            .get(i as usize)
            .copied()
            .ok_or_else(|| AbcError::format(format!("method index {} out of range", i)))
    }

    fn read_instance(&mut self, p: &mut Reader<'_>) -> Result<TypeId> {
        let name = self.pools.name(p.read_u30()?)?.clone();
        let base_idx = p.read_u30()?;
        let base = match base_idx {
            0 => None,
            _ => Some(self.lookup(base_idx)?.t),
        };
        let t = self.cache.declare(&name);
        if let Some(b) = base {
            self.cache.base_types.insert(b);
        }

        let flags = p.read_u8()?;
        let protected_ns = if flags & CLASS_PROTECTED_NS != 0 {
            Some(self.pools.namespace(p.read_u30()?)?.clone())
        } else {
            None
        };
        let n = p.read_index()?;
        let mut interfaces = Vec::with_capacity(n.min(p.remaining()));
        for _ in 0..n {
            let i = p.read_u30()?;
            interfaces.push(self.lookup(i)?.t);
        }
        let init = self.method_ref(p.read_u30()?)?;
        if self.cache.method(init).is_native() && !self.options.allow_native_ctors {
            return Err(AbcError::structural(format!(
                "Constructors can't be native: {}",
                name
            )));
        }

        let ty = self.cache.ty_mut(t);
        ty.base = base;
        ty.flags = flags;
        ty.protected_ns = protected_ns;
        ty.interfaces = interfaces;
        ty.init = Some(init);
        ty.abc = Some(self.id);
        ty.is_final = flags & CLASS_FINAL != 0;
        let this = self.cache.tref(t).nonnull();
        let m = self.cache.method_mut(init);
        m.cx = Some(t);
        m.params[0] = this;
        m.kind = MethodKind::Init;
        m.name = name;

        self.read_traits(p, t)?;
        Ok(t)
    }

    fn read_class(&mut self, p: &mut Reader<'_>, it: TypeId) -> Result<TypeId> {
        let name = self.cache.ty(it).name.append("$");
        let mut ty = Type::new(name.clone());
        ty.base = Some(self.cache.builtins.class);
        ty.itype = Some(it);
        ty.is_final = true;
        ty.abc = Some(self.id);
        let c = self.cache.add_type(ty);
        let init = self.method_ref(p.read_u30()?)?;
        self.cache.ty_mut(c).init = Some(init);
        self.bind_init(init, c, name);
        self.read_traits(p, c)?;
        Ok(c)
    }

    fn read_script(&mut self, p: &mut Reader<'_>, i: usize) -> Result<TypeId> {
        let name = Name::public(format!("global{}", i));
        let mut ty = Type::new(name.clone());
        ty.base = Some(self.cache.builtins.object);
        ty.is_final = true;
        ty.abc = Some(self.id);
        let s = self.cache.add_type(ty);
        let init = self.method_ref(p.read_u30()?)?;
        self.cache.ty_mut(s).init = Some(init);
        self.bind_init(init, s, name);
        self.read_traits(p, s)?;

        let sref = self.cache.tref(s).nonnull();
        let names: Vec<Name> = self.cache.ty(s).defs.iter().map(|b| b.name.clone()).collect();
        for n in names {
            self.cache.add_global(n, sref);
        }
        Ok(s)
    }

    fn bind_init(&mut self, init: MethodId, t: TypeId, name: Name) {
        let this = self.cache.tref(t).nonnull();
        let m = self.cache.method_mut(init);
        m.cx = Some(t);
        m.params[0] = this;
        m.kind = MethodKind::Init;
        m.name = name;
    }

    fn read_traits(&mut self, p: &mut Reader<'_>, t: TypeId) -> Result<()> {
        self.to_resolve.push(t);
        let mut slot_id = match self.cache.ty(t).base {
            Some(b) => self.cache.ty(b).slot_count,
            None => 0,
        };
        let any = self.cache.tref(self.cache.builtins.any);
        let this = self.cache.tref(t).nonnull();

        let count = p.read_index()?;
        let mut defs: Vec<Binding> = Vec::with_capacity(count.min(p.remaining()));
        for _ in 0..count {
            let name = self.pools.name(p.read_u30()?)?.clone();
            let kind_byte = p.read_u8()?;
            let mut b = Binding::new(name, kind_byte, self.id, any);
            let slot = p.read_u30()?;
            let id = p.read_u30()?;

            match b.kind {
                TRAIT_SLOT | TRAIT_CONST | TRAIT_CLASS => {
                    if b.is_class() {
                        let c = self.classes.get(id as usize).copied().ok_or_else(|| {
                            AbcError::format(format!("class index {} out of range", id))
                        })?;
                        b.ty = self.cache.tref(c).nonnull();
                        b.value = Some(Value::Null);
                        b.class = Some(c);
                    } else {
                        let vindex = p.read_u30()?;
                        if vindex != 0 {
                            let vkind = p.read_u8()?;
                            b.value = Some(self.pools.default_value(vkind, vindex)?);
                        }
                        b.type_name = self.pools.opt_name(id)?.cloned();
                        if let Some(Value::Namespace(ns)) = &b.value {
                            self.cache.namespace_names.insert(ns.clone(), b.name.clone());
                        }
                    }
                    b.slot = if slot == 0 {
                        slot_id += 1;
                        slot_id
                    } else {
                        slot_id = slot_id.max(slot);
                        slot
                    };
                }
                TRAIT_METHOD | TRAIT_GETTER | TRAIT_SETTER | TRAIT_FUNCTION => {
                    let m = self.method_ref(id)?;
                    b.method = Some(m);
                    let method = self.cache.method_mut(m);
                    method.cx = Some(t);
                    method.params[0] = this;
                    method.kind = match b.kind {
                        TRAIT_GETTER => MethodKind::Getter,
                        TRAIT_SETTER => MethodKind::Setter,
                        _ => MethodKind::Function,
                    };
                    method.name = b.name.clone();
                }
                k => {
                    return Err(AbcError::format(format!(
                        "illegal trait kind {} at offset {}",
                        k, p.pos
                    )))
                }
            }

            if b.has_metadata() {
                let n = p.read_index()?;
                for _ in 0..n {
                    let i = p.read_index()?;
                    let md = self.metadata.get(i).cloned().ok_or_else(|| {
                        AbcError::format(format!("metadata index {} out of range", i))
                    })?;
                    b.metadata.push(md);
                }
            }

            // Duplicate names (accessor pairs) chain forward through `peer`.
            let idx = defs.len();
            if let Some(mut old) = defs.iter().position(|d| d.name == b.name) {
                while let Some(next) = defs[old].peer {
                    old = next;
                }
                defs[old].peer = Some(idx);
            }
            defs.push(b);
        }

        let ty = self.cache.ty_mut(t);
        ty.defs = defs;
        ty.slot_count = slot_id;
        Ok(())
    }

    fn read_body(&mut self, p: &mut Reader<'_>) -> Result<()> {
        let m = self.method_ref(p.read_u30()?)?;
        let max_stack = p.read_u30()?;
        let local_count = p.read_u30()?;
        let init_scope = p.read_u30()?;
        let max_scope_depth = p.read_u30()?;
        let max_scope = max_scope_depth.checked_sub(init_scope).ok_or_else(|| {
            AbcError::format(format!(
                "max scope depth {} below initial depth {}",
                max_scope_depth, init_scope
            ))
        })?;
        let code_len = p.read_index()?;
        let code = p.read_bytes(code_len)?;

        let handler_count = p.read_index()?;
        let mut handlers = Vec::with_capacity(handler_count.min(p.remaining()));
        for _ in 0..handler_count {
            let from = p.read_u30()?;
            let to = p.read_u30()?;
            let target = p.read_u30()?;
            if from > to || to as usize > code_len || target as usize >= code_len {
                return Err(AbcError::format(format!(
                    "exception range {}..{} -> {} outside code of length {}",
                    from, to, target, code_len
                )));
            }
            let ty = self.lookup(p.read_u30()?)?.nonnull();
            let name = self.pools.opt_name(p.read_u30()?)?.cloned();
            let activation = match &name {
                Some(n) => {
                    let mut scope = Type::new(n.clone());
                    scope.base = Some(self.cache.builtins.any);
                    let mut var = Binding::new(n.clone(), TRAIT_SLOT, self.id, ty);
                    var.slot = 1;
                    scope.defs.push(var);
                    scope.slot_count = 1;
                    let a = self.cache.add_type(scope);
                    self.cache.tref(a).nonnull()
                }
                None => self.cache.tref(self.cache.builtins.any).nonnull(),
            };
            handlers.push(Handler {
                from,
                to,
                target,
                ty,
                name,
                activation,
                entry: None,
            });
        }

        let method_name = self.cache.method(m).name.clone();
        let mut act = Type::new(method_name.append(" activation"));
        act.base = Some(self.cache.builtins.any);
        act.abc = Some(self.id);
        let act = self.cache.add_type(act);
        self.read_traits(p, act)?;
        let activation = self.cache.tref(act).nonnull();

        let input = BodyInput {
            pools: &self.pools,
            methods: &self.methods,
            classes: &self.classes,
            method: m,
            code,
            max_stack,
            local_count,
            max_scope,
            init_scope,
            strip_debug: self.options.strip_debug_info,
        };
        let body = decode_body(&input, handlers, activation, self.cache)
            .with_context(|| format!("failed to decode body of {}", method_name))?;
        self.cache.method_mut(m).body = Some(Box::new(body));
        Ok(())
    }

    /// Resolve slot types and lay out slots: numbers take 8 bytes aligned
    /// to 8, filling a preceding 4-byte hole; everything else takes 4.
    fn resolve_type(&mut self, t: TypeId, resolved: &mut HashSet<TypeId>) -> Result<()> {
        if !resolved.insert(t) {
            return Ok(());
        }
        let mut size = 0;
        if let Some(base) = self.cache.ty(t).base {
            self.resolve_type(base, resolved)?;
            size = self.cache.ty(base).size;
        }

        let number = self.cache.builtins.number;
        let mut defs = std::mem::take(&mut self.cache.ty_mut(t).defs);
        let mut hole = None;
        for b in defs.iter_mut().filter(|b| b.is_slot()) {
            if !b.is_class() {
                let ty = match &b.type_name {
                    Some(n) => self.cache.lookup(n),
                    None => self.cache.builtins.any,
                };
                b.ty = self.cache.tref(ty);
                if b.value.is_none() {
                    b.value = Some(self.cache.default_value(ty));
                }
            }
            if b.ty.t == number {
                if size % 8 != 0 {
                    hole = Some(size);
                    size += 4;
                }
                b.offset = size;
                size += 8;
            } else if let Some(h) = hole.take() {
                b.offset = h;
            } else {
                b.offset = size;
                size += 4;
            }
        }
        let ty = self.cache.ty_mut(t);
        ty.defs = defs;
        ty.size = size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::writer::Writer;
    use crate::error::classify;

    /// A file with empty pools and nothing in it.
    fn empty_file() -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16(MINOR_VERSION);
        w.write_u16(MAJOR_VERSION);
        for _ in 0..7 {
            w.write_u30(0); // pools
        }
        for _ in 0..5 {
            w.write_u30(0); // methods, metadata, classes, scripts, bodies
        }
        w.into_bytes()
    }

    #[test]
    fn accepts_expected_version() {
        let mut cache = TypeCache::new();
        let file = read_abc(&empty_file(), 0, &mut cache, &OptimizeOptions::default()).unwrap();
        assert!(file.scripts.is_empty());
        assert_eq!(file.merged, vec![0]);
    }

    #[test]
    fn rejects_other_versions_before_touching_the_cache() {
        let mut bytes = empty_file();
        bytes[2] = 47;
        let mut cache = TypeCache::new();
        let before = cache.type_count();
        let err = read_abc(&bytes, 0, &mut cache, &OptimizeOptions::default()).unwrap_err();
        assert!(matches!(classify(&err), Some(AbcError::Format(_))));
        assert_eq!(cache.type_count(), before);
    }

    #[test]
    fn pool_count_includes_reserved_entry() {
        let mut w = Writer::new();
        w.write_u30(3);
        w.write_u30(7);
        w.write_u30(-2i32 as u32);
        let bytes = w.into_bytes();
        let mut p = Reader::new(&bytes);
        let pool = read_pool(&mut p, 0, |p, _| Ok(p.read_u30()? as i32)).unwrap();
        assert_eq!(pool, vec![0, 7, -2]);
    }

    #[test]
    fn absent_names_and_bad_indices() {
        let pools = ConstantPools {
            names: vec![None, Some(Name::public("x"))],
            ..Default::default()
        };
        assert!(pools.opt_name(0).unwrap().is_none());
        assert_eq!(pools.name(1).unwrap().local_name(), "x");
        assert!(pools.name(0).is_err());
        let err = pools.name(5).unwrap_err();
        assert!(matches!(classify(&err), Some(AbcError::Format(_))));
    }

    #[test]
    fn internal_namespaces_with_one_uri_stay_distinct() {
        let mut w = Writer::new();
        w.write_u16(MINOR_VERSION);
        w.write_u16(MAJOR_VERSION);
        for _ in 0..3 {
            w.write_u30(0); // ints, uints, doubles
        }
        w.write_u30(2);
        w.write_string("pkg");
        w.write_u30(4);
        let kinds = [
            CONSTANT_PACKAGE_INTERNAL_NS,
            CONSTANT_PACKAGE_INTERNAL_NS,
            CONSTANT_PACKAGE_NS,
        ];
        for kind in kinds {
            w.write_u8(kind);
            w.write_u30(1);
        }
        for _ in 0..7 {
            w.write_u30(0); // nssets, names, methods, metadata, classes, scripts, bodies
        }
        let bytes = w.into_bytes();

        let mut cache = TypeCache::new();
        let file = read_abc(&bytes, 0, &mut cache, &OptimizeOptions::default()).unwrap();
        let ns = &file.pools.namespaces;
        assert_eq!(ns[1].uri, ns[2].uri);
        assert_ne!(ns[1], ns[2]);
        assert_ne!(Name::qname(ns[1].clone(), "x"), Name::qname(ns[2].clone(), "x"));
        assert!(!Name::qname(ns[1].clone(), "x").matches(&Name::qname(ns[2].clone(), "x")));
        assert_eq!(ns[3], Namespace::new(CONSTANT_PACKAGE_NS, "pkg"));
    }

    #[test]
    fn truncated_file_is_a_format_error() {
        let bytes = empty_file();
        let mut cache = TypeCache::new();
        let err = read_abc(&bytes[..6], 0, &mut cache, &OptimizeOptions::default()).unwrap_err();
        assert!(matches!(classify(&err), Some(AbcError::Format(_))));
    }
}
