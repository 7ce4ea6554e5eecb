//! Record codec: the typed view of stored JSON plus the form-style field maps
//! that writers submit.
//!
//! Records are JSON objects. The engine only interprets a handful of fields
//! (`id`, `uuid`, `slug`, `timestamp`, `updated`); everything else is owned by
//! the namespace's [`NamespaceDescriptor`](registry::NamespaceDescriptor).

pub mod registry;

pub use registry::{slugify, NamespaceDescriptor, SortKey, TypeRegistry};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const ID_FIELD: &str = "id";
pub const UUID_FIELD: &str = "uuid";
pub const SLUG_FIELD: &str = "slug";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const UPDATED_FIELD: &str = "updated";

/// A submitted value equal to this clears the field on update.
pub const REMOVE_SENTINEL: &str = "--remove--";

/// Codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stored value is not a JSON object")]
    NotAnObject,

    #[error("Namespace type not registered: {0}")]
    UnknownNamespace(String),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A decoded content record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_bytes(raw: &[u8]) -> CodecResult<Self> {
        match serde_json::from_slice::<Value>(raw)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(CodecError::NotAnObject),
        }
    }

    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Integer view of a field; numeric strings are accepted, anything else is 0.
    pub fn int_field(&self, field: &str) -> i64 {
        match self.0.get(field) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Non-empty string view of a field.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn id(&self) -> i64 {
        self.int_field(ID_FIELD)
    }

    pub fn set_id(&mut self, id: u64) {
        self.insert(ID_FIELD, Value::from(id));
    }

    pub fn uuid(&self) -> Option<&str> {
        self.str_field(UUID_FIELD)
    }

    pub fn set_uuid(&mut self, uuid: &str) {
        self.insert(UUID_FIELD, Value::from(uuid));
    }

    pub fn slug(&self) -> Option<&str> {
        self.str_field(SLUG_FIELD)
    }

    pub fn set_slug(&mut self, slug: &str) {
        self.insert(SLUG_FIELD, Value::from(slug));
    }

    pub fn timestamp(&self) -> i64 {
        self.int_field(TIMESTAMP_FIELD)
    }

    pub fn set_timestamp(&mut self, millis: i64) {
        self.insert(TIMESTAMP_FIELD, Value::from(millis));
    }

    pub fn updated(&self) -> i64 {
        self.int_field(UPDATED_FIELD)
    }

    pub fn set_updated(&mut self, millis: i64) {
        self.insert(UPDATED_FIELD, Value::from(millis));
    }
}

/// Multi-valued form fields, as submitted by the HTTP layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMap(BTreeMap<String, Vec<String>>);

impl FieldMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Replaces all values of `field`.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), vec![value.into()]);
    }

    /// Appends a value to `field`.
    pub fn add(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(value.into());
    }

    /// First value of `field`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn values(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn remove(&mut self, field: &str) -> Option<Vec<String>> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Collapses form-encoded `field.N` keys into one multi-value `field`,
    /// ordered by `N`. Values already present under `field` come first.
    pub fn reassemble(self) -> Self {
        let mut plain = BTreeMap::new();
        let mut ordered: BTreeMap<String, Vec<(usize, Vec<String>)>> = BTreeMap::new();

        for (key, values) in self.0 {
            let position = key
                .rsplit_once('.')
                .filter(|(field, _)| !field.is_empty())
                .and_then(|(field, n)| n.parse::<usize>().ok().map(|n| (field.to_string(), n)));

            match position {
                Some((field, n)) => ordered.entry(field).or_default().push((n, values)),
                None => {
                    plain.insert(key, values);
                }
            }
        }

        for (field, mut parts) in ordered {
            parts.sort_by_key(|(n, _)| *n);
            let target: &mut Vec<String> = plain.entry(field).or_default();
            for (_, values) in parts {
                target.extend(values);
            }
        }

        Self(plain)
    }
}

impl<K, V> FromIterator<(K, V)> for FieldMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.add(k, v);
        }
        map
    }
}
