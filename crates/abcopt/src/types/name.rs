//! Namespaces, namespace sets and (multi)names.

use crate::abc::constants::*;
use std::fmt;

/// A namespace: kind plus URI.
///
/// Private and internal namespaces read from a file get a nonzero `unique` tag so that
/// two declarations with the same URI never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    pub kind: u8,
    pub uri: String,
    pub unique: u32,
}

impl Namespace {
    pub fn new(kind: u8, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
            unique: 0,
        }
    }

    pub fn public() -> Self {
        Self::new(CONSTANT_PACKAGE_NS, "")
    }

    pub fn is_public(&self) -> bool {
        self.kind == CONSTANT_PACKAGE_NS && self.uri.is_empty()
    }

    pub fn is_internal(&self) -> bool {
        self.kind == CONSTANT_PACKAGE_INTERNAL_NS
    }

    pub fn is_private(&self) -> bool {
        self.kind == CONSTANT_PRIVATE_NS
    }

    pub fn is_protected(&self) -> bool {
        matches!(
            self.kind,
            CONSTANT_PROTECTED_NS | CONSTANT_STATIC_PROTECTED_NS
        )
    }

    pub fn is_private_or_internal(&self) -> bool {
        self.is_private() || self.is_internal()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_private() {
            write!(f, "private")?;
            if self.unique != 0 {
                write!(f, "#{}", self.unique)?;
            }
            Ok(())
        } else if self.is_internal() {
            write!(f, "internal:{}", self.uri)
        } else {
            f.write_str(&self.uri)
        }
    }
}

/// A property or type reference.
///
/// Qualified names carry exactly one namespace; multinames carry the set
/// they are resolved against. Runtime-qualified kinds leave the parts they
/// take from the operand stack empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    pub kind: u8,
    pub nsset: Vec<Namespace>,
    pub name: Option<String>,
    pub type_param: Option<Box<Name>>,
}

impl Name {
    pub fn qname(ns: Namespace, name: impl Into<String>) -> Self {
        Self {
            kind: CONSTANT_QNAME,
            nsset: vec![ns],
            name: Some(name.into()),
            type_param: None,
        }
    }

    /// A public qualified name.
    pub fn public(name: impl Into<String>) -> Self {
        Self::qname(Namespace::public(), name)
    }

    pub fn multiname(kind: u8, name: Option<String>, nsset: Vec<Namespace>) -> Self {
        Self {
            kind,
            nsset,
            name,
            type_param: None,
        }
    }

    pub fn local_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn is_qname(&self) -> bool {
        matches!(self.kind, CONSTANT_QNAME | CONSTANT_QNAME_A)
    }

    pub fn is_attr(&self) -> bool {
        matches!(
            self.kind,
            CONSTANT_QNAME_A
                | CONSTANT_MULTINAME_A
                | CONSTANT_RTQNAME_A
                | CONSTANT_RTQNAME_LA
                | CONSTANT_MULTINAME_LA
        )
    }

    /// Any part of the name comes from the operand stack.
    pub fn is_runtime(&self) -> bool {
        ref_argc(self.kind) != 0
    }

    pub fn ns(&self) -> Option<&Namespace> {
        self.nsset.first()
    }

    /// Same name with `suffix` appended to the local part.
    pub fn append(&self, suffix: &str) -> Self {
        let mut n = self.clone();
        n.name = Some(format!("{}{}", self.local_name(), suffix));
        n
    }

    /// Multiname matching: `qname` is one of the names this reference can
    /// resolve to.
    pub fn matches(&self, qname: &Name) -> bool {
        if self.is_runtime() || self.name.is_none() {
            return false;
        }
        if self.name != qname.name || self.is_attr() != qname.is_attr() {
            return false;
        }
        match qname.ns() {
            Some(ns) => self.nsset.iter().any(|n| n == ns),
            None => false,
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_attr() {
            f.write_str("@")?;
        }
        match self.nsset.as_slice() {
            [] => {}
            [ns] if ns.is_public() => {}
            [ns] => write!(f, "{}::", ns)?,
            set => {
                f.write_str("{")?;
                for (i, ns) in set.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", ns)?;
                }
                f.write_str("}::")?;
            }
        }
        f.write_str(self.name.as_deref().unwrap_or("[]"))?;
        if let Some(p) = &self.type_param {
            write!(f, ".<{}>", p)?;
        }
        Ok(())
    }
}
