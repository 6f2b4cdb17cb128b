//! Constant lattice and the primitive folding rules.
//!
//! A value is TOP while it has no entry in the SCCP value map, a
//! [`Lattice::Const`] once a single constant reaches it, and
//! [`Lattice::Bottom`] when it is known to vary. Every rule here folds only
//! when the language conversions give one unambiguous primitive result;
//! anything else is `Bottom`.

use crate::abc::Op;
use crate::types::value::{to_int32, to_uint32};
use crate::types::Value;
use std::cmp::Ordering;

/// A lattice element above TOP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lattice {
    Const(Value),
    Bottom,
}

impl Lattice {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Lattice::Const(v) => Some(v),
            Lattice::Bottom => None,
        }
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Lattice::Bottom)
    }

    /// Numeric value of a constant number, for the `x ± 1` peepholes.
    pub fn number(&self) -> Option<f64> {
        self.value().and_then(Value::as_f64)
    }

    /// Meet of two reached inputs.
    pub fn meet(&self, other: &Lattice) -> Lattice {
        if self == other {
            self.clone()
        } else {
            Lattice::Bottom
        }
    }
}

impl From<Option<Value>> for Lattice {
    fn from(v: Option<Value>) -> Self {
        match v {
            Some(v) => Lattice::Const(v),
            None => Lattice::Bottom,
        }
    }
}

fn lift(v: &Lattice, f: impl FnOnce(&Value) -> Option<Value>) -> Lattice {
    v.value().and_then(f).into()
}

fn lift2(a: &Lattice, b: &Lattice, f: impl FnOnce(&Value, &Value) -> Option<Value>) -> Lattice {
    match (a.value(), b.value()) {
        (Some(x), Some(y)) => f(x, y).into(),
        _ => Lattice::Bottom,
    }
}

// ── Conversions ──────────────────────────────────────────────────────────────

pub fn convert_i(v: &Lattice) -> Lattice {
    lift(v, |v| v.to_number().map(|d| Value::Int(to_int32(d))))
}

pub fn convert_u(v: &Lattice) -> Lattice {
    lift(v, |v| v.to_number().map(|d| Value::Uint(to_uint32(d))))
}

pub fn convert_d(v: &Lattice) -> Lattice {
    lift(v, |v| v.to_number().map(Value::Double))
}

pub fn convert_b(v: &Lattice) -> Lattice {
    lift(v, |v| Some(Value::Bool(v.to_boolean())))
}

pub fn convert_s(v: &Lattice) -> Lattice {
    lift(v, |v| Some(Value::String(v.to_display_string())))
}

/// `coerce_s` keeps null and maps undefined to null.
pub fn coerce_s(v: &Lattice) -> Lattice {
    lift(v, |v| {
        Some(match v {
            Value::Undefined | Value::Null => Value::Null,
            v => Value::String(v.to_display_string()),
        })
    })
}

// ── Operators ────────────────────────────────────────────────────────────────

/// `add`: concatenation when either side is a string, numeric addition
/// when both are numbers.
pub fn add(a: &Lattice, b: &Lattice) -> Lattice {
    lift2(a, b, |x, y| match (x, y) {
        (Value::Namespace(_), _) | (_, Value::Namespace(_)) => None,
        (Value::String(_), _) | (_, Value::String(_)) => Some(Value::String(format!(
            "{}{}",
            x.to_display_string(),
            y.to_display_string()
        ))),
        _ if x.is_number() && y.is_number() => Some(Value::Double(x.as_f64()? + y.as_f64()?)),
        _ => None,
    })
}

/// Binary operators other than `add` and the comparisons.
pub fn binary(op: Op, a: &Lattice, b: &Lattice) -> Lattice {
    lift2(a, b, |x, y| {
        let (l, r) = (x.to_number()?, y.to_number()?);
        let (li, ri) = (to_int32(l), to_int32(r));
        Some(match op {
            Op::Subtract => Value::Double(l - r),
            Op::Multiply => Value::Double(l * r),
            Op::Divide => Value::Double(l / r),
            Op::Modulo => Value::Double(l % r),
            Op::AddI => Value::Int(li.wrapping_add(ri)),
            Op::SubtractI => Value::Int(li.wrapping_sub(ri)),
            Op::MultiplyI => Value::Int(li.wrapping_mul(ri)),
            Op::BitAnd => Value::Int(li & ri),
            Op::BitOr => Value::Int(li | ri),
            Op::BitXor => Value::Int(li ^ ri),
            Op::LShift => Value::Int(li.wrapping_shl(to_uint32(r) & 31)),
            Op::RShift => Value::Int(li >> (to_uint32(r) & 31)),
            Op::URShift => Value::Uint(to_uint32(l) >> (to_uint32(r) & 31)),
            _ => return None,
        })
    })
}

/// Unary numeric operators.
pub fn unary(op: Op, a: &Lattice) -> Lattice {
    lift(a, |x| {
        let d = x.to_number()?;
        let i = to_int32(d);
        Some(match op {
            Op::Negate => Value::Double(-d),
            Op::Increment => Value::Double(d + 1.0),
            Op::Decrement => Value::Double(d - 1.0),
            Op::NegateI => Value::Int(i.wrapping_neg()),
            Op::IncrementI => Value::Int(i.wrapping_add(1)),
            Op::DecrementI => Value::Int(i.wrapping_sub(1)),
            Op::BitNot => Value::Int(!i),
            _ => return None,
        })
    })
}

pub fn not(a: &Lattice) -> Lattice {
    lift(a, |x| Some(Value::Bool(!x.to_boolean())))
}

/// `lessthan`, `lessequals`, `greaterthan`, `greaterequals`.
///
/// NaN or undefined on either side makes every relation false even when
/// the other side is unknown.
pub fn relational(op: Op, a: &Lattice, b: &Lattice) -> Lattice {
    let poisoned = |v: &Lattice| match v.value() {
        Some(Value::Undefined) => true,
        Some(Value::Double(d)) => d.is_nan(),
        _ => false,
    };
    if poisoned(a) || poisoned(b) {
        return Lattice::Const(Value::Bool(false));
    }
    lift2(a, b, |x, y| {
        let ord = compare(x, y)?;
        Some(Value::Bool(match op {
            Op::LessThan => ord == Ordering::Less,
            Op::LessEquals => ord != Ordering::Greater,
            Op::GreaterThan => ord == Ordering::Greater,
            Op::GreaterEquals => ord != Ordering::Less,
            _ => return None,
        }))
    })
}

/// Ordering of two primitives; `None` when either is NaN after conversion.
fn compare(x: &Value, y: &Value) -> Option<Ordering> {
    if let (Value::String(a), Value::String(b)) = (x, y) {
        return Some(a.encode_utf16().cmp(b.encode_utf16()));
    }
    x.to_number()?.partial_cmp(&y.to_number()?)
}

/// `equals` (`strict == false`) and `strictequals`.
pub fn equality(strict: bool, a: &Lattice, b: &Lattice) -> Lattice {
    lift2(a, b, |x, y| {
        let eq = if strict {
            strict_equals(x, y)?
        } else {
            loose_equals(x, y)?
        };
        Some(Value::Bool(eq))
    })
}

fn strict_equals(x: &Value, y: &Value) -> Option<bool> {
    Some(match (x, y) {
        _ if x.is_number() && y.is_number() => x.as_f64()? == y.as_f64()?,
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Namespace(a), Value::Namespace(b)) => a.uri == b.uri,
        _ => false,
    })
}

fn loose_equals(x: &Value, y: &Value) -> Option<bool> {
    match (x, y) {
        (Value::Namespace(_), _) | (_, Value::Namespace(_)) => {
            if std::mem::discriminant(x) == std::mem::discriminant(y) {
                strict_equals(x, y)
            } else {
                None
            }
        }
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => Some(true),
        (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => Some(false),
        (Value::String(a), Value::String(b)) => Some(a == b),
        _ => Some(x.to_number()? == y.to_number()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(v: Value) -> Lattice {
        Lattice::Const(v)
    }

    #[test]
    fn int_conversion_wraps_and_zeroes_nan() {
        assert_eq!(convert_i(&k(Value::Double(4_294_967_297.0))), k(Value::Int(1)));
        assert_eq!(convert_i(&k(Value::Double(f64::NAN))), k(Value::Int(0)));
        assert_eq!(convert_i(&k(Value::Bool(true))), k(Value::Int(1)));
        assert_eq!(convert_i(&k(Value::Undefined)), k(Value::Int(0)));
        assert_eq!(convert_u(&k(Value::Int(-1))), k(Value::Uint(u32::MAX)));
        assert!(convert_i(&Lattice::Bottom).is_bottom());
    }

    #[test]
    fn number_conversion_parses_numerals() {
        assert_eq!(convert_d(&k(Value::String(" 12 ".into()))), k(Value::Double(12.0)));
        assert_eq!(convert_d(&k(Value::Null)), k(Value::Double(0.0)));
        let nan = convert_d(&k(Value::String("abc".into())));
        assert!(matches!(nan, Lattice::Const(Value::Double(d)) if d.is_nan()));
    }

    #[test]
    fn string_coercions() {
        assert_eq!(convert_s(&k(Value::Null)), k(Value::String("null".into())));
        assert_eq!(coerce_s(&k(Value::Undefined)), k(Value::Null));
        assert_eq!(coerce_s(&k(Value::Double(2.5))), k(Value::String("2.5".into())));
    }

    #[test]
    fn add_concatenates_or_sums() {
        assert_eq!(
            add(&k(Value::String("a".into())), &k(Value::Int(1))),
            k(Value::String("a1".into()))
        );
        assert_eq!(add(&k(Value::Int(2)), &k(Value::Uint(3))), k(Value::Double(5.0)));
        assert!(add(&k(Value::Bool(true)), &k(Value::Int(1))).is_bottom());
    }

    #[test]
    fn integer_ops_wrap_and_mask_shift_counts() {
        let max = k(Value::Int(i32::MAX));
        assert_eq!(binary(Op::AddI, &max, &k(Value::Int(1))), k(Value::Int(i32::MIN)));
        assert_eq!(binary(Op::LShift, &k(Value::Int(1)), &k(Value::Int(33))), k(Value::Int(2)));
        assert_eq!(
            binary(Op::URShift, &k(Value::Int(-1)), &k(Value::Int(28))),
            k(Value::Uint(15))
        );
        assert_eq!(binary(Op::RShift, &k(Value::Int(-16)), &k(Value::Int(2))), k(Value::Int(-4)));
        assert_eq!(unary(Op::BitNot, &k(Value::Int(0))), k(Value::Int(-1)));
    }

    #[test]
    fn relational_rules() {
        let lt = |a, b| relational(Op::LessThan, &k(a), &k(b));
        assert_eq!(lt(Value::Int(1), Value::Int(2)), k(Value::Bool(true)));
        assert_eq!(
            lt(Value::String("b".into()), Value::String("a".into())),
            k(Value::Bool(false))
        );
        assert_eq!(
            relational(Op::GreaterEquals, &k(Value::Undefined), &Lattice::Bottom),
            k(Value::Bool(false))
        );
        assert_eq!(
            relational(Op::LessEquals, &k(Value::Double(f64::NAN)), &k(Value::Int(1))),
            k(Value::Bool(false))
        );
        assert!(relational(Op::LessThan, &k(Value::Int(1)), &Lattice::Bottom).is_bottom());
    }

    #[test]
    fn equality_rules() {
        let eq = |s, a, b| equality(s, &k(a), &k(b));
        assert_eq!(eq(false, Value::Null, Value::Undefined), k(Value::Bool(true)));
        assert_eq!(eq(true, Value::Null, Value::Undefined), k(Value::Bool(false)));
        assert_eq!(eq(true, Value::Int(1), Value::Double(1.0)), k(Value::Bool(true)));
        assert_eq!(eq(false, Value::String("1".into()), Value::Int(1)), k(Value::Bool(true)));
        assert_eq!(
            eq(true, Value::Double(f64::NAN), Value::Double(f64::NAN)),
            k(Value::Bool(false))
        );
    }

    #[test]
    fn meet_of_distinct_constants_is_bottom() {
        let one = k(Value::Int(1));
        assert_eq!(one.meet(&one), one);
        assert!(one.meet(&k(Value::Int(2))).is_bottom());
        assert!(one.meet(&Lattice::Bottom).is_bottom());
    }
}
