//! Numeric constants of the ABC container format.

// ── File header ──────────────────────────────────────────────────────────────

pub const MINOR_VERSION: u16 = 16;
pub const MAJOR_VERSION: u16 = 46;

// ── Constant / name / namespace kinds ────────────────────────────────────────

pub const CONSTANT_VOID: u8 = 0x00;
pub const CONSTANT_UTF8: u8 = 0x01;
pub const CONSTANT_INTEGER: u8 = 0x03;
pub const CONSTANT_UINTEGER: u8 = 0x04;
pub const CONSTANT_PRIVATE_NS: u8 = 0x05;
pub const CONSTANT_DOUBLE: u8 = 0x06;
pub const CONSTANT_QNAME: u8 = 0x07;
pub const CONSTANT_NAMESPACE: u8 = 0x08;
pub const CONSTANT_MULTINAME: u8 = 0x09;
pub const CONSTANT_FALSE: u8 = 0x0A;
pub const CONSTANT_TRUE: u8 = 0x0B;
pub const CONSTANT_NULL: u8 = 0x0C;
pub const CONSTANT_QNAME_A: u8 = 0x0D;
pub const CONSTANT_MULTINAME_A: u8 = 0x0E;
pub const CONSTANT_RTQNAME: u8 = 0x0F;
pub const CONSTANT_RTQNAME_A: u8 = 0x10;
pub const CONSTANT_RTQNAME_L: u8 = 0x11;
pub const CONSTANT_RTQNAME_LA: u8 = 0x12;
pub const CONSTANT_NAMESPACE_SET: u8 = 0x15;
pub const CONSTANT_PACKAGE_NS: u8 = 0x16;
pub const CONSTANT_PACKAGE_INTERNAL_NS: u8 = 0x17;
pub const CONSTANT_PROTECTED_NS: u8 = 0x18;
pub const CONSTANT_EXPLICIT_NS: u8 = 0x19;
pub const CONSTANT_STATIC_PROTECTED_NS: u8 = 0x1A;
pub const CONSTANT_MULTINAME_L: u8 = 0x1B;
pub const CONSTANT_MULTINAME_LA: u8 = 0x1C;
pub const CONSTANT_TYPENAME: u8 = 0x1D;

/// Number of runtime operands (namespace and/or name) a reference of the
/// given kind pops from the operand stack.
pub fn ref_argc(kind: u8) -> usize {
    match kind {
        CONSTANT_RTQNAME | CONSTANT_RTQNAME_A => 1,
        CONSTANT_RTQNAME_L | CONSTANT_RTQNAME_LA => 2,
        CONSTANT_MULTINAME_L | CONSTANT_MULTINAME_LA => 1,
        _ => 0,
    }
}

pub fn is_namespace_kind(kind: u8) -> bool {
    matches!(
        kind,
        CONSTANT_NAMESPACE
            | CONSTANT_PACKAGE_NS
            | CONSTANT_PACKAGE_INTERNAL_NS
            | CONSTANT_PROTECTED_NS
            | CONSTANT_EXPLICIT_NS
            | CONSTANT_STATIC_PROTECTED_NS
            | CONSTANT_PRIVATE_NS
    )
}

// ── Traits ───────────────────────────────────────────────────────────────────

pub const TRAIT_SLOT: u8 = 0;
pub const TRAIT_METHOD: u8 = 1;
pub const TRAIT_GETTER: u8 = 2;
pub const TRAIT_SETTER: u8 = 3;
pub const TRAIT_CLASS: u8 = 4;
pub const TRAIT_FUNCTION: u8 = 5;
pub const TRAIT_CONST: u8 = 6;

pub const ATTR_FINAL: u8 = 0x1;
pub const ATTR_OVERRIDE: u8 = 0x2;
pub const ATTR_METADATA: u8 = 0x4;

// ── Methods ──────────────────────────────────────────────────────────────────

pub const METHOD_NEED_ARGUMENTS: u8 = 0x01;
pub const METHOD_ACTIVATION: u8 = 0x02;
pub const METHOD_NEED_REST: u8 = 0x04;
pub const METHOD_HAS_OPTIONAL: u8 = 0x08;
pub const METHOD_IGNORE_REST: u8 = 0x10;
pub const METHOD_NATIVE: u8 = 0x20;
pub const METHOD_SET_DXNS: u8 = 0x40;
pub const METHOD_HAS_PARAM_NAMES: u8 = 0x80;

// ── Instances ────────────────────────────────────────────────────────────────

pub const CLASS_SEALED: u8 = 0x01;
pub const CLASS_FINAL: u8 = 0x02;
pub const CLASS_INTERFACE: u8 = 0x04;
pub const CLASS_PROTECTED_NS: u8 = 0x08;
