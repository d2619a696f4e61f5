//! Numeric semantics of the arithmetic opcodes.
//!
//! Integer arithmetic wraps at 64 bits. Mixing an integer with a decimal
//! promotes both to decimal. Integer division truncates toward zero and
//! faults on a zero divisor; decimal division follows IEEE-754.

use crate::error::Fault;
use crate::types::TypeId;
use crate::value::Value;

/// Binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

fn number_mismatch(value: &Value) -> Fault {
    Fault::TypeMismatch {
        expected: TypeId::DECIMAL,
        actual: value.type_id(),
    }
}

/// Apply `op` to two numeric values.
///
/// # Examples
///
/// ```
/// use core_types::{arithmetic, ArithOp, Value};
///
/// assert_eq!(arithmetic(ArithOp::Add, &Value::Integer(2), &Value::Integer(3)).unwrap(), Value::Integer(5));
/// assert_eq!(arithmetic(ArithOp::Add, &Value::Integer(i64::MAX), &Value::Integer(1)).unwrap(), Value::Integer(i64::MIN));
/// assert_eq!(arithmetic(ArithOp::Div, &Value::Integer(7), &Value::Decimal(2.0)).unwrap(), Value::Decimal(3.5));
/// assert!(arithmetic(ArithOp::Mod, &Value::Integer(1), &Value::Integer(0)).is_err());
/// ```
pub fn arithmetic(op: ArithOp, left: &Value, right: &Value) -> Result<Value, Fault> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => integer_arithmetic(op, *a, *b),
        _ => {
            let a = left.as_decimal().ok_or_else(|| number_mismatch(left))?;
            let b = right.as_decimal().ok_or_else(|| number_mismatch(right))?;
            Ok(Value::Decimal(decimal_arithmetic(op, a, b)))
        }
    }
}

fn integer_arithmetic(op: ArithOp, a: i64, b: i64) -> Result<Value, Fault> {
    let result = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div if b == 0 => return Err(Fault::runtime("integer division by zero")),
        ArithOp::Div => a.wrapping_div(b),
        ArithOp::Mod if b == 0 => return Err(Fault::runtime("integer modulo by zero")),
        ArithOp::Mod => a.wrapping_rem(b),
    };
    Ok(Value::Integer(result))
}

fn decimal_arithmetic(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    }
}

/// Numeric negation; integers wrap.
pub fn negate(value: &Value) -> Result<Value, Fault> {
    match value {
        Value::Integer(i) => Ok(Value::Integer(i.wrapping_neg())),
        Value::Decimal(d) => Ok(Value::Decimal(-d)),
        other => Err(number_mismatch(other)),
    }
}
