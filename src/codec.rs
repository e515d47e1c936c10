//! Attribute Values and Wire Codec
//!
//! A hash bucket is stored as a UTF-8 JSON object. Plain JSON values pass
//! through untouched; timestamps are wrapped in a tagged object:
//!
//! ```text
//! {"json_class": "Time", "data": "2024-03-01 12:30:00 +0000"}
//! ```
//!
//! Tagged objects are only turned back into typed values when type-aware
//! decoding is enabled, i.e. when the [`TypeRegistry`] has at least one
//! adapter registered. Only top-level values of the hash are decoded.

use crate::error::{Error, Result};
use chrono::{DateTime, FixedOffset, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Tag field of a typed JSON object
pub const TYPE_TAG: &str = "json_class";

/// Payload field of a typed JSON object
pub const TYPE_DATA: &str = "data";

/// Human-readable timestamp layout used on the wire
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

// =============================================================================
// Attribute Value
// =============================================================================

/// A value stored under one attribute of a hash bucket
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Json(Value),
    Time(DateTime<FixedOffset>),
}

/// Attributes of one hash bucket, in insertion order
pub type Attrs = IndexMap<String, AttrValue>;

impl AttrValue {
    pub fn null() -> Self {
        AttrValue::Json(Value::Null)
    }

    /// `null` and `false` are falsy, everything else is truthy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, AttrValue::Json(Value::Null) | AttrValue::Json(Value::Bool(false)))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            AttrValue::Json(v) => Some(v),
            AttrValue::Time(_) => None,
        }
    }

    pub fn as_time(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            AttrValue::Time(t) => Some(t),
            AttrValue::Json(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(Value::as_i64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(Value::as_bool)
    }

    /// Wire representation
    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::Json(v) => v.clone(),
            AttrValue::Time(t) => {
                let mut tagged = Map::new();
                tagged.insert(TYPE_TAG.to_string(), Value::String(TimeAdapter::NAME.to_string()));
                tagged.insert(
                    TYPE_DATA.to_string(),
                    Value::String(t.format(TIME_FORMAT).to_string()),
                );
                Value::Object(tagged)
            }
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Json(Value::String(s)) => write!(f, "{}", s),
            AttrValue::Json(v) => write!(f, "{}", v),
            AttrValue::Time(t) => write!(f, "{}", t.format(TIME_FORMAT)),
        }
    }
}

impl From<Value> for AttrValue {
    fn from(v: Value) -> Self {
        AttrValue::Json(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Json(Value::String(v.to_string()))
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Json(Value::String(v))
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Json(Value::from(v))
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Json(Value::from(v))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Json(Value::from(v))
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Json(Value::Bool(v))
    }
}

impl From<DateTime<FixedOffset>> for AttrValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        AttrValue::Time(v)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttrValue::Time(v.fixed_offset())
    }
}

// =============================================================================
// Type Adapters
// =============================================================================

/// Decodes one `json_class` tag back into a typed value
pub trait JsonTypeAdapter: Send + Sync {
    /// Tag this adapter handles
    fn type_name(&self) -> &str;

    /// Decode a tagged object
    fn decode(&self, object: &Map<String, Value>) -> Result<AttrValue>;
}

/// Adapter for `Time` timestamps
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeAdapter;

impl TimeAdapter {
    pub const NAME: &'static str = "Time";
}

impl JsonTypeAdapter for TimeAdapter {
    fn type_name(&self) -> &str {
        Self::NAME
    }

    fn decode(&self, object: &Map<String, Value>) -> Result<AttrValue> {
        let data = object
            .get(TYPE_DATA)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Internal("Time value has no data".to_string()))?;
        DateTime::parse_from_str(data, TIME_FORMAT)
            .map(AttrValue::Time)
            .map_err(|e| Error::Internal(format!("invalid Time data {:?}: {}", data, e)))
    }
}

/// Registered type adapters, keyed by tag
#[derive(Clone, Default)]
pub struct TypeRegistry {
    adapters: IndexMap<String, Arc<dyn JsonTypeAdapter>>,
}

impl TypeRegistry {
    /// Empty registry; type-aware decoding disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `Time` adapter
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TimeAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn JsonTypeAdapter>) {
        self.adapters
            .insert(adapter.type_name().to_string(), adapter);
    }

    /// Whether tagged objects are decoded at all
    pub fn is_enabled(&self) -> bool {
        !self.adapters.is_empty()
    }

    pub fn resolve(&self, type_name: &str) -> Option<&Arc<dyn JsonTypeAdapter>> {
        self.adapters.get(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

// =============================================================================
// Hash Codec
// =============================================================================

/// Serialize a hash bucket to its wire form
pub fn dump_hash(attrs: &Attrs) -> Result<String> {
    let object: Map<String, Value> = attrs
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    Ok(serde_json::to_string(&Value::Object(object))?)
}

/// Parse a hash bucket from its wire form
pub fn load_hash(raw: &str, registry: &TypeRegistry) -> Result<Attrs> {
    let object = match serde_json::from_str::<Value>(raw)? {
        Value::Object(object) => object,
        other => {
            return Err(Error::Internal(format!(
                "stored hash is not a JSON object: {}",
                other
            )))
        }
    };

    let decode = registry.is_enabled();
    object
        .into_iter()
        .map(|(key, value)| {
            let value = if decode {
                decode_value(value, registry)?
            } else {
                AttrValue::Json(value)
            };
            Ok((key, value))
        })
        .collect()
}

fn decode_value(value: Value, registry: &TypeRegistry) -> Result<AttrValue> {
    let tag = match &value {
        Value::Object(object) => object.get(TYPE_TAG).and_then(Value::as_str),
        _ => None,
    };
    match (tag, &value) {
        (Some(tag), Value::Object(object)) => match registry.resolve(tag) {
            Some(adapter) => adapter.decode(object),
            None => Err(Error::NameResolution {
                type_name: tag.to_string(),
            }),
        },
        _ => Ok(AttrValue::Json(value)),
    }
}
