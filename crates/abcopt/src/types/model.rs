//! Types, trait bindings and method signatures.
//!
//! Everything here lives in the arenas owned by
//! [`TypeCache`](super::cache::TypeCache) and refers to other entries by id.

use super::name::{Name, Namespace};
use super::value::Value;
use crate::abc::constants::*;
use crate::ir::MethodBody;

/// Index of a [`Type`] in the cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Index of a [`Method`] in the cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// Index of a linked input file.
pub type AbcId = usize;

/// A type plus a nullability bit. Equality compares both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Typeref {
    pub t: TypeId,
    pub nullable: bool,
}

impl Typeref {
    pub fn new(t: TypeId, nullable: bool) -> Self {
        Self { t, nullable }
    }

    pub fn nonnull(self) -> Self {
        Self {
            nullable: false,
            ..self
        }
    }

    pub fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }
}

/// Metadata attached to a trait; read and kept, never re-emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

// ── Bindings ─────────────────────────────────────────────────────────────────

/// One trait entry of a type.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: Name,
    pub kind: u8,
    pub attrs: u8,
    pub slot: u32,
    pub ty: Typeref,
    /// Declared type name of a slot, resolved into `ty` after reading.
    pub type_name: Option<Name>,
    pub value: Option<Value>,
    pub method: Option<MethodId>,
    pub class: Option<TypeId>,
    /// Next binding declared under the same name (getter/setter pairs).
    pub peer: Option<usize>,
    pub metadata: Vec<Metadata>,
    /// File that declared this binding.
    pub abc: AbcId,
    /// Byte offset of a slot in the native object layout.
    pub offset: u32,
}

impl Binding {
    pub fn new(name: Name, kind_byte: u8, abc: AbcId, ty: Typeref) -> Self {
        Self {
            name,
            kind: kind_byte & 0x0f,
            attrs: kind_byte >> 4,
            slot: 0,
            ty,
            type_name: None,
            value: None,
            method: None,
            class: None,
            peer: None,
            metadata: Vec::new(),
            abc,
            offset: 0,
        }
    }

    pub fn is_slot(&self) -> bool {
        matches!(self.kind, TRAIT_SLOT | TRAIT_CONST | TRAIT_CLASS)
    }

    pub fn is_const(&self) -> bool {
        self.kind == TRAIT_CONST
    }

    pub fn is_class(&self) -> bool {
        self.kind == TRAIT_CLASS
    }

    pub fn is_method(&self) -> bool {
        matches!(self.kind, TRAIT_METHOD | TRAIT_FUNCTION)
    }

    pub fn is_getter(&self) -> bool {
        self.kind == TRAIT_GETTER
    }

    pub fn is_setter(&self) -> bool {
        self.kind == TRAIT_SETTER
    }

    pub fn is_final(&self) -> bool {
        self.attrs & ATTR_FINAL != 0
    }

    pub fn is_override(&self) -> bool {
        self.attrs & ATTR_OVERRIDE != 0
    }

    pub fn has_metadata(&self) -> bool {
        self.attrs & ATTR_METADATA != 0
    }
}

// ── Types ────────────────────────────────────────────────────────────────────

/// A class instance type, class object type, script global or activation.
#[derive(Debug, Clone)]
pub struct Type {
    pub name: Name,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    /// Trait table in declaration order.
    pub defs: Vec<Binding>,
    /// Instance type of a class object.
    pub itype: Option<TypeId>,
    pub init: Option<MethodId>,
    pub flags: u8,
    pub protected_ns: Option<Namespace>,
    pub slot_count: u32,
    pub size: u32,
    /// Scope chain captured by `newclass`/`newfunction`; `None` when the
    /// type was never reached from a script initializer.
    pub scopes: Option<Vec<Typeref>>,
    pub numeric: bool,
    pub primitive: bool,
    pub default_value: Value,
    pub is_final: bool,
    /// Referenced but never declared.
    pub placeholder: bool,
    /// Parameterized references (`Vector.<T>`) are emitted as `*`.
    pub emit_as_any: bool,
    pub obscure_natives: bool,
    pub abc: Option<AbcId>,
}

impl Type {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            base: None,
            interfaces: Vec::new(),
            defs: Vec::new(),
            itype: None,
            init: None,
            flags: 0,
            protected_ns: None,
            slot_count: 0,
            size: 0,
            scopes: None,
            numeric: false,
            primitive: false,
            default_value: Value::Null,
            is_final: false,
            placeholder: false,
            emit_as_any: false,
            obscure_natives: false,
            abc: None,
        }
    }

    pub fn has_protected_ns(&self) -> bool {
        self.flags & CLASS_PROTECTED_NS != 0
    }

    pub fn is_interface(&self) -> bool {
        self.flags & CLASS_INTERFACE != 0
    }

    /// First binding whose name resolves `name`, in declaration order.
    pub fn lookup_own(&self, name: &Name) -> Option<usize> {
        self.defs.iter().position(|b| {
            if name.is_qname() {
                b.name == *name
            } else {
                name.matches(&b.name)
            }
        })
    }

    pub fn find_own_slot(&self, slot: u32) -> Option<&Binding> {
        self.defs.iter().find(|b| b.is_slot() && b.slot == slot)
    }
}

// ── Methods ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Function,
    Getter,
    Setter,
    Init,
}

/// A method signature and, when it has one, its body.
#[derive(Debug, Clone)]
pub struct Method {
    /// Position in the declaring file's method table.
    pub id: u32,
    pub abc: AbcId,
    /// `params[0]` is the receiver.
    pub params: Vec<Typeref>,
    pub param_names: Option<Vec<Name>>,
    pub returns: Typeref,
    /// Defaults of the trailing optional parameters, aligned with `params`.
    pub values: Vec<Option<Value>>,
    pub optional_count: usize,
    pub flags: u8,
    pub cx: Option<TypeId>,
    pub kind: MethodKind,
    pub name: Name,
    pub debug_name: String,
    pub body: Option<Box<MethodBody>>,
    /// Body optimization already scheduled.
    pub ready: bool,
}

impl Method {
    pub fn needs_arguments(&self) -> bool {
        self.flags & METHOD_NEED_ARGUMENTS != 0
    }

    pub fn needs_activation(&self) -> bool {
        self.flags & METHOD_ACTIVATION != 0
    }

    pub fn needs_rest(&self) -> bool {
        self.flags & METHOD_NEED_REST != 0
    }

    pub fn has_optional(&self) -> bool {
        self.flags & METHOD_HAS_OPTIONAL != 0
    }

    pub fn is_native(&self) -> bool {
        self.flags & METHOD_NATIVE != 0
    }

    pub fn has_param_names(&self) -> bool {
        self.flags & METHOD_HAS_PARAM_NAMES != 0
    }

    /// Declared parameter count, excluding the receiver.
    pub fn param_count(&self) -> usize {
        self.params.len().saturating_sub(1)
    }
}
