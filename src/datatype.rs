// used for decimal sums and widening beyond double
use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};

// used to print out readable forms of a data type
use std::fmt;
// used to indicate that values need to be hashable, since they serve as keys
use std::hash::{Hash, Hasher};
// custom made ordering so that values can be kept in sorted accumulators
use std::cmp::Ordering;

use crate::schema::Event;

/// Engine time, in milliseconds since the epoch (UTC).
pub type Timestamp = i64;

// ------------- Value Types -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Boolean,
    Integer,
    Long,
    Double,
    Decimal,
    String,
    Timestamp,
    Event(String),
    Array(Box<ValueType>),
}

impl ValueType {
    fn numeric_rank(&self) -> Option<u8> {
        match self {
            ValueType::Integer => Some(1),
            ValueType::Long => Some(2),
            ValueType::Double => Some(3),
            ValueType::Decimal => Some(4),
            _ => None,
        }
    }
    pub fn is_numeric(&self) -> bool {
        self.numeric_rank().is_some()
    }
    /// Whether a value of this type can be used where `target` is expected
    /// without an explicit conversion. Numbers only widen.
    pub fn is_assignable_to(&self, target: &ValueType) -> bool {
        if self == target || *self == ValueType::Null {
            return true;
        }
        match (self, target) {
            (ValueType::Array(a), ValueType::Array(b)) => a.is_assignable_to(b),
            _ => match (self.numeric_rank(), target.numeric_rank()) {
                (Some(from), Some(to)) => from <= to,
                _ => false,
            },
        }
    }
    /// Comparison sites accept either direction of widening.
    pub fn is_comparable_with(&self, other: &ValueType) -> bool {
        self.is_assignable_to(other) || other.is_assignable_to(self)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueType::Null => write!(f, "null"),
            ValueType::Boolean => write!(f, "Boolean"),
            ValueType::Integer => write!(f, "Integer"),
            ValueType::Long => write!(f, "Long"),
            ValueType::Double => write!(f, "Double"),
            ValueType::Decimal => write!(f, "Decimal"),
            ValueType::String => write!(f, "String"),
            ValueType::Timestamp => write!(f, "Timestamp"),
            ValueType::Event(name) => write!(f, "{}", name),
            ValueType::Array(inner) => write!(f, "{}[]", inner),
        }
    }
}

// ------------- Values -------------
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(BigDecimal),
    String(String),
    Timestamp(Timestamp),
    Event(Event),
    Array(Vec<Value>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Int(_) => ValueType::Integer,
            Value::Long(_) => ValueType::Long,
            Value::Double(_) => ValueType::Double,
            Value::Decimal(_) => ValueType::Decimal,
            Value::String(_) => ValueType::String,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Event(e) => ValueType::Event(e.event_type().name().to_string()),
            Value::Array(items) => {
                let inner = items
                    .iter()
                    .map(Value::value_type)
                    .find(|t| *t != ValueType::Null)
                    .unwrap_or(ValueType::Null);
                ValueType::Array(Box::new(inner))
            }
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i as i64),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Long(l) => Some(*l as f64),
            Value::Double(d) => Some(*d),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }
    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Int(i) => Some(BigDecimal::from(*i)),
            Value::Long(l) => Some(BigDecimal::from(*l)),
            Value::Double(d) => BigDecimal::from_f64(*d),
            Value::Decimal(d) => Some(d.clone()),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Value::Event(e) => Some(e),
            _ => None,
        }
    }
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Comparison with numeric widening, as used by filter evaluation.
    /// Returns `None` when either side is null or the two are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(_) | Value::Long(_), Value::Int(_) | Value::Long(_)) => {
                Some(self.as_i64()?.cmp(&other.as_i64()?))
            }
            (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
                Some(self.as_decimal()?.cmp(&other.as_decimal()?))
            }
            (Value::Double(_), _) | (_, Value::Double(_)) => self.as_f64()?.partial_cmp(&other.as_f64()?),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Event(a), Value::Event(b)) => (a == b).then_some(Ordering::Equal),
            (Value::Array(a), Value::Array(b)) => (a == b).then_some(Ordering::Equal),
            _ => None,
        }
    }
    pub fn loose_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Widen to `target` if the value is assignable to it.
    pub fn coerce_to(&self, target: &ValueType) -> Option<Value> {
        if self.is_null() || self.value_type() == *target {
            return Some(self.clone());
        }
        match target {
            ValueType::Long => self.as_i64().map(Value::Long),
            ValueType::Double => match self {
                Value::Decimal(_) => None,
                _ => self.as_f64().map(Value::Double),
            },
            ValueType::Decimal => self.as_decimal().map(Value::Decimal),
            _ => self.value_type().is_assignable_to(target).then(|| self.clone()),
        }
    }

    /// Literal form, with strings quoted, as rendered into statement text.
    pub fn render_literal(&self) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", s),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(Value::render_literal).collect();
                format!("{{{}}}", parts.join(","))
            }
            other => other.to_string(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Long(_) => 3,
            Value::Double(_) => 4,
            Value::Decimal(_) => 5,
            Value::String(_) => 6,
            Value::Timestamp(_) => 7,
            Value::Event(_) => 8,
            Value::Array(_) => 9,
        }
    }
}

// Values are used as group and primary keys, so they need a total order and
// hashing. Equality here is strict per variant; filters use `compare` instead.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Event(a), Value::Event(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Value {}
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => (),
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Long(l) => l.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Decimal(d) => d.hash(state),
            Value::String(s) => s.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Event(e) => e.hash(state),
            Value::Array(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}", l),
            Value::Double(d) => write!(f, "{}", d),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", crate::calendar::format_millis(*t)),
            Value::Event(e) => write!(f, "{}", e),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

// ------------- Data Types --------------
// Rust types that map one-to-one onto a value variant.
pub trait DataType: Sized {
    const DATA_TYPE: &'static str;
    fn value_type() -> ValueType;
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

impl DataType for bool {
    const DATA_TYPE: &'static str = "Boolean";
    fn value_type() -> ValueType { ValueType::Boolean }
    fn into_value(self) -> Value { Value::Bool(self) }
    fn from_value(value: &Value) -> Option<Self> { value.as_bool() }
}
impl DataType for i32 {
    const DATA_TYPE: &'static str = "Integer";
    fn value_type() -> ValueType { ValueType::Integer }
    fn into_value(self) -> Value { Value::Int(self) }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}
impl DataType for i64 {
    const DATA_TYPE: &'static str = "Long";
    fn value_type() -> ValueType { ValueType::Long }
    fn into_value(self) -> Value { Value::Long(self) }
    fn from_value(value: &Value) -> Option<Self> { value.as_i64() }
}
impl DataType for f64 {
    const DATA_TYPE: &'static str = "Double";
    fn value_type() -> ValueType { ValueType::Double }
    fn into_value(self) -> Value { Value::Double(self) }
    fn from_value(value: &Value) -> Option<Self> { value.as_f64() }
}
impl DataType for BigDecimal {
    const DATA_TYPE: &'static str = "Decimal";
    fn value_type() -> ValueType { ValueType::Decimal }
    fn into_value(self) -> Value { Value::Decimal(self) }
    fn from_value(value: &Value) -> Option<Self> { value.as_decimal() }
}
impl DataType for String {
    const DATA_TYPE: &'static str = "String";
    fn value_type() -> ValueType { ValueType::String }
    fn into_value(self) -> Value { Value::String(self) }
    fn from_value(value: &Value) -> Option<Self> { value.as_str().map(str::to_string) }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { v.into_value() }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self { v.into_value() }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self { v.into_value() }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { v.into_value() }
}
impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self { v.into_value() }
}
impl From<String> for Value {
    fn from(v: String) -> Self { v.into_value() }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}
impl From<Event> for Value {
    fn from(v: Event) -> Self { Value::Event(v) }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::Array(v) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_widen_but_strings_do_not() {
        assert!(ValueType::Integer.is_assignable_to(&ValueType::Long));
        assert!(ValueType::Long.is_assignable_to(&ValueType::Decimal));
        assert!(!ValueType::Double.is_assignable_to(&ValueType::Integer));
        assert!(!ValueType::Integer.is_assignable_to(&ValueType::String));
        assert!(ValueType::Null.is_assignable_to(&ValueType::String));
    }

    #[test]
    fn compare_crosses_numeric_variants() {
        assert_eq!(Value::Int(10).compare(&Value::Long(10)), Some(Ordering::Equal));
        assert_eq!(Value::Int(1).compare(&Value::Double(1.5)), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
        // keys stay strict
        assert_ne!(Value::Int(10), Value::Long(10));
    }
}
