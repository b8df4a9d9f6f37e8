//! Dynamically-typed tree value exchanged with every processing stage.
//!
//! Every accessor is fallible: asking for a variant that is not stored returns
//! [`Error::TypeMismatch`] instead of a default.

use crate::error::{Error, Result};
use crate::template::ContextTemplate;
use crate::template_index::DynamicTemplateIndex;
use serde_json::json;

/// A node of the tree. Objects keep insertion order and unique keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Object(Vec<(String, Value)>),
    Array(Vec<Value>),
    Template(ContextTemplate),
    /// A reference to a shared index, not a copy of it.
    TemplateIndex(DynamicTemplateIndex),
}

macro_rules! scalar_accessors {
    ($(($get:ident, $set:ident, $is:ident, $variant:ident, $ty:ty, $name:literal)),* $(,)?) => {
        $(
            pub fn $is(&self) -> bool {
                matches!(self, Value::$variant(_))
            }

            pub fn $get(&self) -> Result<$ty> {
                match self {
                    Value::$variant(v) => Ok(*v),
                    other => Err(other.mismatch($name)),
                }
            }

            /// Fails with `TypeMismatch` unless the slot is null or already holds this variant.
            pub fn $set(&mut self, value: $ty) -> Result<()> {
                self.check_settable($name, matches!(self, Value::$variant(_)))?;
                *self = Value::$variant(value);
                Ok(())
            }
        )*
    };
}

impl Value {
    /// Name of the stored variant, as used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "unsigned int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Template(_) => "template",
            Value::TemplateIndex(_) => "template index",
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    fn check_settable(&self, expected: &'static str, same_variant: bool) -> Result<()> {
        if self.is_none() || same_variant {
            Ok(())
        } else {
            Err(self.mismatch(expected))
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_template(&self) -> bool {
        matches!(self, Value::Template(_))
    }

    pub fn is_template_index(&self) -> bool {
        matches!(self, Value::TemplateIndex(_))
    }

    scalar_accessors!(
        (get_bool, set_bool, is_bool, Bool, bool, "bool"),
        (get_int, set_int, is_int, Int, i64, "int"),
        (get_unsigned_int, set_unsigned_int, is_unsigned_int, UInt, u64, "unsigned int"),
        (get_float, set_float, is_float, Float, f64, "float"),
    );

    pub fn get_string(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn set_string(&mut self, value: impl Into<String>) -> Result<()> {
        self.check_settable("string", self.is_string())?;
        *self = Value::String(value.into());
        Ok(())
    }

    pub fn get_binary(&self) -> Result<&[u8]> {
        match self {
            Value::Binary(b) => Ok(b),
            other => Err(other.mismatch("binary")),
        }
    }

    pub fn set_binary(&mut self, value: impl Into<Vec<u8>>) -> Result<()> {
        self.check_settable("binary", self.is_binary())?;
        *self = Value::Binary(value.into());
        Ok(())
    }

    pub fn get_template(&self) -> Result<&ContextTemplate> {
        match self {
            Value::Template(t) => Ok(t),
            other => Err(other.mismatch("template")),
        }
    }

    pub fn set_template(&mut self, value: ContextTemplate) -> Result<()> {
        self.check_settable("template", self.is_template())?;
        *self = Value::Template(value);
        Ok(())
    }

    pub fn get_template_index(&self) -> Result<&DynamicTemplateIndex> {
        match self {
            Value::TemplateIndex(index) => Ok(index),
            other => Err(other.mismatch("template index")),
        }
    }

    pub fn set_template_index(&mut self, value: DynamicTemplateIndex) -> Result<()> {
        self.check_settable("template index", self.is_template_index())?;
        *self = Value::TemplateIndex(value);
        Ok(())
    }

    /// Any integer variant that fits in `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Any numeric variant, widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Return the child under `key`, inserting a null child when absent.
    ///
    /// A null value becomes an empty object first.
    pub fn get_or_insert_by_key(&mut self, key: &str) -> Result<&mut Value> {
        if self.is_none() {
            *self = Value::Object(Vec::new());
        }
        let Value::Object(entries) = self else {
            return Err(self.mismatch("object"));
        };
        let pos = match entries.iter().position(|(k, _)| k == key) {
            Some(pos) => pos,
            None => {
                entries.push((key.to_string(), Value::Null));
                entries.len() - 1
            }
        };
        Ok(&mut entries[pos].1)
    }

    pub fn get_by_key(&self, key: &str) -> Result<&Value> {
        match self {
            Value::Object(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| Error::NotFound(format!("key {key:?}"))),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn get_by_key_mut(&mut self, key: &str) -> Result<&mut Value> {
        match self {
            Value::Object(entries) => entries
                .iter_mut()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| Error::NotFound(format!("key {key:?}"))),
            other => Err(other.mismatch("object")),
        }
    }

    /// Insert or replace `key`. A null value becomes an object first.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<()> {
        *self.get_or_insert_by_key(key)? = value;
        Ok(())
    }

    pub fn get_by_index(&self, index: usize) -> Result<&Value> {
        match self {
            Value::Array(items) => items.get(index).ok_or(Error::IndexOutOfRange {
                index,
                len: items.len(),
            }),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn get_by_index_mut(&mut self, index: usize) -> Result<&mut Value> {
        match self {
            Value::Array(items) => {
                let len = items.len();
                items.get_mut(index).ok_or(Error::IndexOutOfRange { index, len })
            }
            other => Err(other.mismatch("array")),
        }
    }

    /// Append to an array. A null value becomes an array first.
    pub fn push_back(&mut self, value: Value) -> Result<()> {
        if self.is_none() {
            *self = Value::Array(Vec::new());
        }
        match self {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            other => Err(other.mismatch("array")),
        }
    }

    /// Number of children of an array or object; null counts as empty.
    pub fn len(&self) -> Result<usize> {
        match self {
            Value::Null => Ok(0),
            Value::Array(items) => Ok(items.len()),
            Value::Object(entries) => Ok(entries.len()),
            other => Err(other.mismatch("array or object")),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Ok(0))
    }

    pub fn keys(&self) -> Result<Vec<&str>> {
        match self {
            Value::Object(entries) => Ok(entries.iter().map(|(k, _)| k.as_str()).collect()),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self, Value::Object(entries) if entries.iter().any(|(k, _)| k == key))
    }

    /// Remove `key` from an object, returning the removed child.
    pub fn erase(&mut self, key: &str) -> Result<Value> {
        match self {
            Value::Object(entries) => {
                let pos = entries
                    .iter()
                    .position(|(k, _)| k == key)
                    .ok_or_else(|| Error::NotFound(format!("key {key:?}")))?;
                Ok(entries.remove(pos).1)
            }
            other => Err(other.mismatch("object")),
        }
    }

    /// Empty a container in place; scalars become null.
    pub fn clear(&mut self) {
        match self {
            Value::Array(items) => items.clear(),
            Value::Object(entries) => entries.clear(),
            other => *other = Value::Null,
        }
    }

    /// Replace this value with a deep copy of `other`.
    pub fn copy_from(&mut self, other: &Value) {
        *self = other.clone();
    }

    /// Render as JSON. Total over every variant: binary buffers, templates
    /// and index references become `$binary` / `$template` /
    /// `$template_index` placeholder objects; non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(v) => json!(v),
            Value::UInt(v) => json!(v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => json!(s),
            Value::Binary(b) => json!({ "$binary": { "size": b.len() } }),
            Value::Object(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Template(t) => json!({
                "$template": {
                    "method": t.method_name(),
                    "version": t.version(),
                    "size": t.size(),
                }
            }),
            Value::TemplateIndex(index) => json!({ "$template_index": index.summary_json() }),
        }
    }

    pub fn serialize_to_json(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Int(v)
                } else if let Some(v) = n.as_u64() {
                    Value::UInt(v)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<ContextTemplate> for Value {
    fn from(t: ContextTemplate) -> Self {
        Value::Template(t)
    }
}

impl From<DynamicTemplateIndex> for Value {
    fn from(index: DynamicTemplateIndex) -> Self {
        Value::TemplateIndex(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Method;
    use crate::types::Embedding;

    fn sample() -> Value {
        Value::from(json!({
            "unit_type": "FACE_DETECTOR",
            "version": 2,
            "threshold": 0.5,
            "objects": [{"id": 0}, {"id": 1}],
        }))
    }

    #[test]
    fn test_get_or_insert_on_null_creates_object() {
        let mut v = Value::Null;
        v.get_or_insert_by_key("a").unwrap().set_int(5).unwrap();
        assert!(v.is_object());
        assert_eq!(v.get_by_key("a").unwrap().get_int().unwrap(), 5);
    }

    #[test]
    fn test_get_or_insert_returns_existing_child() {
        let mut v = sample();
        let child = v.get_or_insert_by_key("version").unwrap();
        assert_eq!(child.get_int().unwrap(), 2);
        child.set_int(3).unwrap();
        assert_eq!(v.get_by_key("version").unwrap().get_int().unwrap(), 3);
        assert_eq!(v.len().unwrap(), 4);
    }

    #[test]
    fn test_get_or_insert_on_scalar_is_type_mismatch() {
        let mut v = Value::Int(1);
        let err = v.get_or_insert_by_key("x").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { expected: "object", found: "int" }));
    }

    #[test]
    fn test_get_by_index_out_of_range() {
        let v = sample();
        let objects = v.get_by_key("objects").unwrap();
        assert!(objects.get_by_index(1).is_ok());
        let err = objects.get_by_index(2).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 2, len: 2 }));
    }

    #[test]
    fn test_get_by_index_on_object_is_type_mismatch() {
        assert!(matches!(sample().get_by_index(0), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_scalar_getters_check_variant() {
        let v = Value::String("x".into());
        assert!(matches!(v.get_int(), Err(Error::TypeMismatch { expected: "int", found: "string" })));
        assert!(matches!(v.get_float(), Err(Error::TypeMismatch { .. })));
        assert!(matches!(v.get_bool(), Err(Error::TypeMismatch { .. })));
        assert!(matches!(v.get_binary(), Err(Error::TypeMismatch { .. })));
        assert_eq!(v.get_string().unwrap(), "x");
    }

    #[test]
    fn test_setters_accept_null_and_same_variant_only() {
        let mut v = Value::Null;
        v.set_float(1.5).unwrap();
        v.set_float(2.5).unwrap();
        assert_eq!(v.get_float().unwrap(), 2.5);
        assert!(matches!(v.set_string("no"), Err(Error::TypeMismatch { .. })));

        let mut obj = sample();
        assert!(matches!(obj.set_bool(true), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_binary_roundtrip() {
        let mut v = Value::Null;
        v.set_binary(vec![1u8, 2, 3]).unwrap();
        assert_eq!(v.get_binary().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_object_preserves_insertion_order() {
        let mut v = Value::Null;
        for key in ["z", "a", "m"] {
            v.get_or_insert_by_key(key).unwrap();
        }
        assert_eq!(v.keys().unwrap(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_erase_and_contains() {
        let mut v = sample();
        assert!(v.contains("threshold"));
        v.erase("threshold").unwrap();
        assert!(!v.contains("threshold"));
        assert!(matches!(v.erase("threshold"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_clone_is_deep() {
        let original = sample();
        let mut copy = original.clone();
        copy.get_or_insert_by_key("version").unwrap().set_int(99).unwrap();
        assert_eq!(original.get_by_key("version").unwrap().get_int().unwrap(), 2);
    }

    #[test]
    fn test_copy_from_replaces_contents() {
        let mut v = Value::Int(1);
        v.copy_from(&sample());
        assert_eq!(v, sample());
    }

    #[test]
    fn test_push_back_and_clear() {
        let mut v = Value::Null;
        v.push_back(Value::Int(1)).unwrap();
        v.push_back(Value::Int(2)).unwrap();
        assert_eq!(v.len().unwrap(), 2);
        v.clear();
        assert!(v.is_array());
        assert!(v.is_empty());
    }

    #[test]
    fn test_json_number_variants() {
        assert_eq!(Value::from(json!(5)), Value::Int(5));
        assert_eq!(Value::from(json!(u64::MAX)), Value::UInt(u64::MAX));
        assert_eq!(Value::from(json!(0.25)), Value::Float(0.25));
    }

    #[test]
    fn test_to_json_scalars_and_containers() {
        assert_eq!(sample().to_json(), json!({
            "unit_type": "FACE_DETECTOR",
            "version": 2,
            "threshold": 0.5,
            "objects": [{"id": 0}, {"id": 1}],
        }));
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_to_json_placeholders() {
        let template = ContextTemplate::new(Method::new("m", 1), Embedding { values: vec![1.0, 0.0] });
        let mut v = Value::Null;
        v.insert("blob", Value::Binary(vec![0u8; 7])).unwrap();
        v.insert("template", Value::Template(template)).unwrap();
        assert_eq!(
            v.to_json(),
            json!({
                "blob": {"$binary": {"size": 7}},
                "template": {"$template": {"method": "m", "version": 1, "size": 8}},
            })
        );
    }
}
