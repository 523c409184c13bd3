//! Conversions between Rust types and wire [`Value`]s.
//!
//! Handler parameters implement [`FromValue`], which also declares the
//! [`ParamKind`] the overload resolver matches arguments against. Handler
//! return types implement [`IntoOutcome`].

use std::fmt;

use vineyard_wire::{Value, ValueKind};

/// What a handler parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Exactly this kind. `Float` also accepts a widened `Int`.
    Exact(ValueKind),
    /// This kind, or `Null`.
    Optional(ValueKind),
    /// Any value, untouched.
    Any,
}

/// Cost of an exact match.
pub const COST_EXACT: u32 = 0;
/// Cost of widening an `Int` argument into a `Float` parameter.
pub const COST_WIDEN: u32 = 1;
/// Cost of passing `Null` to an optional parameter.
pub const COST_NULL: u32 = 1;
/// Cost of binding to an `Any` parameter.
pub const COST_ANY: u32 = 2;

impl ParamKind {
    /// Cost of binding `arg` to this parameter, or `None` if it cannot bind.
    pub fn cost(&self, arg: &Value) -> Option<u32> {
        match *self {
            ParamKind::Any => Some(COST_ANY),
            ParamKind::Optional(_) if arg.is_null() => Some(COST_NULL),
            ParamKind::Exact(kind) | ParamKind::Optional(kind) => {
                match (kind, arg.kind()) {
                    (want, got) if want == got => Some(COST_EXACT),
                    (ValueKind::Float, ValueKind::Int) => Some(COST_WIDEN),
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Exact(kind) => write!(f, "{kind}"),
            ParamKind::Optional(kind) => write!(f, "{kind}?"),
            ParamKind::Any => write!(f, "any"),
        }
    }
}

/// An argument that resolved to a parameter but could not be converted,
/// e.g. an integer out of range for `i32`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {found} to {expected}")]
pub struct ConversionError {
    pub expected: &'static str,
    pub found: String,
}

impl ConversionError {
    fn new(expected: &'static str, found: &Value) -> Self {
        Self {
            expected,
            found: found.kind().to_string(),
        }
    }
}

pub trait FromValue: Sized {
    const KIND: ParamKind;

    fn from_value(value: Value) -> Result<Self, ConversionError>;
}

pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl FromValue for Value {
    const KIND: ParamKind = ParamKind::Any;

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        Ok(value)
    }
}

impl FromValue for bool {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::Bool);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(ConversionError::new("bool", &other)),
        }
    }
}

impl FromValue for i64 {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::Int);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(ConversionError::new("int", &other)),
        }
    }
}

impl FromValue for i32 {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::Int);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Int(v) => i32::try_from(v).map_err(|_| ConversionError {
                expected: "i32",
                found: v.to_string(),
            }),
            other => Err(ConversionError::new("int", &other)),
        }
    }
}

impl FromValue for f64 {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::Float);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        value
            .as_f64()
            .ok_or_else(|| ConversionError::new("float", &value))
    }
}

impl FromValue for String {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::Str);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Str(v) => Ok(v),
            other => Err(ConversionError::new("str", &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::Bytes);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Bytes(v) => Ok(v),
            other => Err(ConversionError::new("bytes", &other)),
        }
    }
}

impl FromValue for Vec<Value> {
    const KIND: ParamKind = ParamKind::Exact(ValueKind::List);

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::List(v) => Ok(v),
            other => Err(ConversionError::new("list", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const KIND: ParamKind = match T::KIND {
        ParamKind::Exact(kind) => ParamKind::Optional(kind),
        other => other,
    };

    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Int(self.into())
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Str(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Str(self.to_owned())
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl IntoValue for Vec<Value> {
    fn into_value(self) -> Value {
        Value::List(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Null, IntoValue::into_value)
    }
}

/// Build a `Vec<Value>` from anything implementing [`IntoValue`]:
/// `args![2, 3.5, "x"]`.
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::IntoValue::into_value($arg)),*]
    };
}

/// What a handler returns: a value, or a failure message.
pub trait IntoOutcome {
    fn into_outcome(self) -> Result<Value, String>;
}

macro_rules! infallible_outcome {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoOutcome for $ty {
                fn into_outcome(self) -> Result<Value, String> {
                    Ok(self.into_value())
                }
            }
        )*
    };
}

infallible_outcome!(Value, (), bool, i64, i32, f64, String, &'static str, Vec<u8>, Vec<Value>);

impl<T: IntoValue> IntoOutcome for Option<T> {
    fn into_outcome(self) -> Result<Value, String> {
        Ok(self.into_value())
    }
}

impl<T: IntoValue, E: fmt::Display> IntoOutcome for Result<T, E> {
    fn into_outcome(self) -> Result<Value, String> {
        self.map(IntoValue::into_value).map_err(|e| e.to_string())
    }
}
