//! Runtime values.
//!
//! Scalars are stored inline. Heap variants hold a [`Gc`] handle, so cloning
//! a value retains its cell and dropping it releases.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Fault;
use crate::object::{CustomObject, Gc, MapObject, Object, Text};
use crate::types::TypeId;

/// Identity of a loaded module inside one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// Identity of a registered native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(pub u32);

/// Reference to something callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionRef {
    /// A function in a loaded module
    Bytecode {
        /// Owning module
        module: ModuleId,
        /// Index into the module's function table
        index: u32,
    },
    /// A host callback
    Native(NativeId),
}

/// A VM value.
///
/// # Examples
///
/// ```
/// use core_types::{TypeId, Value};
///
/// let n = Value::Integer(42);
/// assert!(n.is_truthy());
/// assert_eq!(n.type_id(), TypeId::INTEGER);
///
/// let t = Value::from("hi");
/// assert_eq!(t.to_string(), "hi");
/// assert!(!Value::Null.is_truthy());
/// ```
#[derive(Debug, Clone)]
pub enum Value {
    /// Absence of a value
    Null,
    /// `true` or `false`
    Boolean(bool),
    /// Wrapping 64-bit signed integer
    Integer(i64),
    /// IEEE-754 double
    Decimal(f64),
    /// Immutable UTF-8 text
    Text(Text),
    /// Cell holding [`Object::List`]
    List(Gc),
    /// Cell holding [`Object::Map`]
    Map(Gc),
    /// Plain function reference
    Function(FunctionRef),
    /// Cell holding [`Object::Closure`]
    Closure(Gc),
    /// Cell holding [`Object::Custom`]
    Custom(Gc),
}

impl Value {
    /// Truthiness used by conditional jumps and logical opcodes
    ///
    /// `null`, `false`, `0`, `0.0`, NaN and empty text are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Decimal(d) => *d != 0.0 && !d.is_nan(),
            Value::Text(t) => !t.as_str().is_empty(),
            _ => true,
        }
    }

    /// Dynamic type
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Null => TypeId::NULL,
            Value::Boolean(_) => TypeId::BOOLEAN,
            Value::Integer(_) => TypeId::INTEGER,
            Value::Decimal(_) => TypeId::DECIMAL,
            Value::Text(_) => TypeId::TEXT,
            Value::List(_) => TypeId::LIST,
            Value::Map(cell) => match &*cell.read() {
                Object::Map(map) => map.type_tag.unwrap_or(TypeId::MAP),
                _ => TypeId::MAP,
            },
            Value::Function(_) | Value::Closure(_) => TypeId::FUNCTION,
            Value::Custom(cell) => match &*cell.read() {
                Object::Custom(custom) => custom.type_id,
                _ => TypeId::ANY,
            },
        }
    }

    /// Heap cell, for heap variants
    pub fn as_gc(&self) -> Option<&Gc> {
        match self {
            Value::List(cell) | Value::Map(cell) | Value::Closure(cell) | Value::Custom(cell) => {
                Some(cell)
            }
            _ => None,
        }
    }

    /// Integer payload
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric payload as a double
    pub fn as_decimal(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Text payload
    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Same heap cell, or equal scalars by bit pattern
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self.as_gc(), other.as_gc()) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => match (self, other) {
                (Value::Decimal(a), Value::Decimal(b)) => a.to_bits() == b.to_bits(),
                (a, b) => values_equal(a, b, &NoHooks),
            },
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Decimal(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(Text::new(s))
    }
}

impl From<Text> for Value {
    fn from(t: Text) -> Self {
        Value::Text(t)
    }
}

/// Comparison behavior for custom payloads.
pub trait CompareHooks {
    /// Compare two custom objects; `None` means unordered or unequal
    fn compare_custom(&self, a: &CustomObject, b: &CustomObject) -> Option<Ordering>;
}

/// Hooks that treat every custom value as comparable by identity only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl CompareHooks for NoHooks {
    fn compare_custom(&self, _a: &CustomObject, _b: &CustomObject) -> Option<Ordering> {
        None
    }
}

/// Containers nested deeper than this compare unequal.
const MAX_COMPARE_DEPTH: usize = 256;

/// Structural equality.
///
/// Integers and decimals compare numerically. Containers compare
/// element-wise; maps ignore insertion order but require the same type tag.
/// Closures compare by identity and custom values by identity unless a
/// comparison hook says otherwise.
pub fn values_equal(a: &Value, b: &Value, hooks: &dyn CompareHooks) -> bool {
    equal_at_depth(a, b, hooks, 0)
}

fn equal_at_depth(a: &Value, b: &Value, hooks: &dyn CompareHooks, depth: usize) -> bool {
    if depth > MAX_COMPARE_DEPTH {
        return false;
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Integer(_), Value::Decimal(_))
        | (Value::Decimal(_), Value::Integer(_))
        | (Value::Decimal(_), Value::Decimal(_)) => a.as_decimal() == b.as_decimal(),
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Closure(x), Value::Closure(y)) => x.ptr_eq(y),
        (Value::List(x), Value::List(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            let (left, right) = (x.read(), y.read());
            match (&*left, &*right) {
                (Object::List(l), Object::List(r)) => {
                    l.len() == r.len()
                        && l.iter()
                            .zip(r.iter())
                            .all(|(p, q)| equal_at_depth(p, q, hooks, depth + 1))
                }
                _ => false,
            }
        }
        (Value::Map(x), Value::Map(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            let (left, right) = (x.read(), y.read());
            match (&*left, &*right) {
                (Object::Map(l), Object::Map(r)) => maps_equal(l, r, hooks, depth),
                _ => false,
            }
        }
        (Value::Custom(x), Value::Custom(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            let (left, right) = (x.read(), y.read());
            match (&*left, &*right) {
                (Object::Custom(l), Object::Custom(r)) => {
                    hooks.compare_custom(l, r) == Some(Ordering::Equal)
                }
                _ => false,
            }
        }
        _ => false,
    }
}

fn maps_equal(l: &MapObject, r: &MapObject, hooks: &dyn CompareHooks, depth: usize) -> bool {
    l.type_tag == r.type_tag
        && l.len() == r.len()
        && l.entries.iter().all(|(key, value)| {
            r.get(key)
                .is_some_and(|other| equal_at_depth(value, other, hooks, depth + 1))
        })
}

/// Ordering used by the relational opcodes.
///
/// Numbers order numerically, text by scalar values, booleans `false` first,
/// lists lexicographically. Comparing a NaN yields `None`. Values of
/// unrelated types raise a type mismatch.
pub fn compare_values(
    a: &Value,
    b: &Value,
    hooks: &dyn CompareHooks,
) -> Result<Option<Ordering>, Fault> {
    compare_at_depth(a, b, hooks, 0)
}

fn compare_at_depth(
    a: &Value,
    b: &Value,
    hooks: &dyn CompareHooks,
    depth: usize,
) -> Result<Option<Ordering>, Fault> {
    let mismatch = || Fault::TypeMismatch {
        expected: a.type_id(),
        actual: b.type_id(),
    };
    if depth > MAX_COMPARE_DEPTH {
        return Ok(None);
    }
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(x.cmp(y))),
        (Value::Integer(_) | Value::Decimal(_), Value::Integer(_) | Value::Decimal(_)) => {
            let (x, y) = (a.as_decimal(), b.as_decimal());
            Ok(x.zip(y).and_then(|(x, y)| x.partial_cmp(&y)))
        }
        (Value::Text(x), Value::Text(y)) => Ok(Some(x.as_str().cmp(y.as_str()))),
        (Value::Boolean(x), Value::Boolean(y)) => Ok(Some(x.cmp(y))),
        (Value::Null, Value::Null) => Ok(Some(Ordering::Equal)),
        (Value::List(x), Value::List(y)) => {
            if x.ptr_eq(y) {
                return Ok(Some(Ordering::Equal));
            }
            let (left, right) = (x.read(), y.read());
            let (Object::List(l), Object::List(r)) = (&*left, &*right) else {
                return Err(mismatch());
            };
            for (p, q) in l.iter().zip(r.iter()) {
                match compare_at_depth(p, q, hooks, depth + 1)? {
                    Some(Ordering::Equal) => continue,
                    other => return Ok(other),
                }
            }
            Ok(Some(l.len().cmp(&r.len())))
        }
        (Value::Custom(x), Value::Custom(y)) => {
            if x.ptr_eq(y) {
                return Ok(Some(Ordering::Equal));
            }
            let (left, right) = (x.read(), y.read());
            match (&*left, &*right) {
                (Object::Custom(l), Object::Custom(r)) => match hooks.compare_custom(l, r) {
                    Some(order) => Ok(Some(order)),
                    None => Err(mismatch()),
                },
                _ => Err(mismatch()),
            }
        }
        _ => Err(mismatch()),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other, &NoHooks)
    }
}

fn fmt_decimal(d: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if d.is_nan() {
        f.write_str("NaN")
    } else if d.is_infinite() {
        f.write_str(if d > 0.0 { "inf" } else { "-inf" })
    } else {
        let mut buffer = ryu::Buffer::new();
        f.write_str(buffer.format_finite(d))
    }
}

fn fmt_at_depth(value: &Value, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    if depth > 16 {
        return f.write_str("...");
    }
    match value {
        Value::Null => f.write_str("null"),
        Value::Boolean(b) => write!(f, "{}", b),
        Value::Integer(i) => write!(f, "{}", i),
        Value::Decimal(d) => fmt_decimal(*d, f),
        Value::Text(t) => f.write_str(t.as_str()),
        Value::List(cell) => {
            let guard = cell.read();
            let Object::List(items) = &*guard else {
                return f.write_str("[]");
            };
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                fmt_at_depth(item, f, depth + 1)?;
            }
            f.write_str("]")
        }
        Value::Map(cell) => {
            let guard = cell.read();
            let Object::Map(map) = &*guard else {
                return f.write_str("{}");
            };
            f.write_str("{")?;
            for (i, (key, item)) in map.entries.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                fmt_at_depth(&key.to_value(), f, depth + 1)?;
                f.write_str(": ")?;
                fmt_at_depth(item, f, depth + 1)?;
            }
            f.write_str("}")
        }
        Value::Function(FunctionRef::Bytecode { module, index }) => {
            write!(f, "<function {}:{}>", module.0, index)
        }
        Value::Function(FunctionRef::Native(id)) => write!(f, "<native {}>", id.0),
        Value::Closure(_) => f.write_str("<closure>"),
        Value::Custom(_) => write!(f, "<{}>", value.type_id()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_at_depth(self, f, 0)
    }
}
