use std::fmt;

use crate::{DynEntity, Entity, error::Error};

/// Identifier value used for ids, foreign keys, grouped keys and cache keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

macro_rules! impl_key_from_int {
    ($($T:ty),+) => {
        $(
            impl From<$T> for Key {
                fn from(value: $T) -> Self {
                    Key::Int(value as i64)
                }
            }
        )+
    };
}

impl_key_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(v) => Value::Int(v),
            Key::Text(v) => Value::Text(v),
        }
    }
}

/// Scalar field value read from an entity or produced by an aggregate.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Id-like view of the value. `Null`, floats and booleans are not keys.
    pub fn as_key(&self) -> Option<Key> {
        match self {
            Value::Int(v) => Some(Key::Int(*v)),
            Value::Text(v) => Some(Key::Text(v.clone())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Label text for dictionary items.
    pub fn to_label(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(v) => v.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// Read side of a persistent entity field.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

macro_rules! impl_to_value {
    ($variant:ident as $cast:ty: $($T:ty),+) => {
        $(
            impl ToValue for $T {
                fn to_value(&self) -> Value {
                    Value::$variant(*self as $cast)
                }
            }
        )+
    };
}

impl_to_value!(Int as i64: i8, i16, i32, i64, u8, u16, u32);
impl_to_value!(Float as f64: f32, f64);

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl ToValue for Key {
    fn to_value(&self) -> Value {
        self.clone().into()
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

/// Write side of an aggregate relation field.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, Error>;
}

fn conversion_error(value: &Value, target: &'static str) -> Error {
    Error::ValueConversion {
        value: value.to_string(),
        target,
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Int(v) => Ok(v),
            Value::Float(v) if v.fract() == 0.0 => Ok(v as i64),
            other => Err(conversion_error(&other, "i64")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, Error> {
        let wide = i64::from_value(value.clone())?;
        i32::try_from(wide).map_err(|_| conversion_error(&value, "i32"))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, Error> {
        value.as_f64().ok_or_else(|| conversion_error(&value, "f64"))
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Null => Err(conversion_error(&value, "String")),
            other => Ok(other.to_label()),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, Error> {
        Ok(value)
    }
}

/// `{id, label}` pair written by constant and foreign dictionary relations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DictItem {
    pub id: Key,
    pub label: String,
}

impl DictItem {
    pub fn new(id: impl Into<Key>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Payload the materializer writes into a relation field.
pub enum Related {
    Dict(DictItem),
    Object(Box<dyn DynEntity>),
    Aggregate(Value),
}

impl Related {
    fn kind(&self) -> &'static str {
        match self {
            Related::Dict(_) => "a dictionary item",
            Related::Object(_) => "a nested object",
            Related::Aggregate(_) => "an aggregated value",
        }
    }

    fn mismatch(&self, field: &str) -> Error {
        Error::RelationTypeMismatch {
            field: field.to_string(),
            found: self.kind(),
        }
    }

    pub fn into_dict(self, field: &str) -> Result<DictItem, Error> {
        match self {
            Related::Dict(item) => Ok(item),
            other => Err(other.mismatch(field)),
        }
    }

    pub fn into_object<T: Entity>(self, field: &str) -> Result<T, Error> {
        match self {
            Related::Object(object) => {
                let found = object.entity_meta().name;
                object
                    .into_any()
                    .downcast::<T>()
                    .map(|boxed| *boxed)
                    .map_err(|_| Error::RelationTypeMismatch {
                        field: field.to_string(),
                        found,
                    })
            }
            other => Err(other.mismatch(field)),
        }
    }

    pub fn into_aggregate<T: FromValue>(self, field: &str) -> Result<T, Error> {
        match self {
            Related::Aggregate(value) => T::from_value(value),
            other => Err(other.mismatch(field)),
        }
    }
}

impl fmt::Debug for Related {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Related::Dict(item) => write!(f, "Dict({:?})", item),
            Related::Object(object) => write!(f, "Object({})", object.entity_meta().name),
            Related::Aggregate(value) => write!(f, "Aggregate({:?})", value),
        }
    }
}
