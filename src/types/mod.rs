use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

mod change_set;
mod flag;

pub use change_set::{ChangeSet, ChangeSetType, Selector};
pub use flag::{EnvironmentData, EvaluationReason, Flag, FlagBuilder};

/// JSON-like flag value.
///
/// A closed set of variants so merge and versioning code never has to deal
/// with an open dynamic type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FlagValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<FlagValue>),
    Object(BTreeMap<String, FlagValue>),
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Number(n) => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FlagValue]> {
        match self {
            FlagValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, FlagValue>> {
        match self {
            FlagValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FlagValue::Null)
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::String(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_string())
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        FlagValue::Number(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Number(value as f64)
    }
}

impl From<i32> for FlagValue {
    fn from(value: i32) -> Self {
        FlagValue::Number(value as f64)
    }
}

impl From<serde_json::Value> for FlagValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FlagValue::Null,
            serde_json::Value::Bool(b) => FlagValue::Bool(b),
            serde_json::Value::Number(n) => FlagValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => FlagValue::String(s),
            serde_json::Value::Array(items) => {
                FlagValue::Array(items.into_iter().map(FlagValue::from).collect())
            }
            serde_json::Value::Object(map) => FlagValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, FlagValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Default context kind.
pub const DEFAULT_CONTEXT_KIND: &str = "user";

/// The identity flags are synchronized for.
///
/// Only the kind and key take part in cache partitioning; attributes ride
/// along for the transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    pub kind: String,
    pub key: String,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, FlagValue>,
}

impl EvaluationContext {
    /// Create a context of the default `user` kind.
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_kind(DEFAULT_CONTEXT_KIND, key)
    }

    pub fn with_kind(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn builder(key: impl Into<String>) -> EvaluationContextBuilder {
        EvaluationContextBuilder::new(key)
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&FlagValue> {
        self.attributes.get(key)
    }

    /// Key that is unique across kinds.
    ///
    /// Plain `user` contexts use the bare key for compatibility with
    /// previously cached data.
    pub fn fully_qualified_key(&self) -> String {
        if self.kind == DEFAULT_CONTEXT_KIND {
            self.key.clone()
        } else {
            format!("{}:{}", self.kind, escape_key(&self.key))
        }
    }
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

pub struct EvaluationContextBuilder {
    kind: String,
    key: String,
    anonymous: bool,
    attributes: HashMap<String, FlagValue>,
}

impl EvaluationContextBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            kind: DEFAULT_CONTEXT_KIND.to_string(),
            key: key.into(),
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> EvaluationContext {
        EvaluationContext {
            kind: self.kind,
            key: self.key,
            anonymous: self.anonymous,
            attributes: self.attributes,
        }
    }
}
