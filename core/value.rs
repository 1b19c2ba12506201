// Copyright 2024-2026 the jsbox authors. MIT license.

//! The tagged value format carried in frame payloads and across the engine
//! boundary. It covers JSON-like trees plus raw byte buffers and the three
//! non-serial sentinels (`StreamRef`, `CallbackRef`, `IteratorRef`) whose
//! handle ids are only meaningful against the owning connection's tables.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Insertion-ordered object representation. Property order is observable from
/// JavaScript, so a plain `HashMap` would not do.
pub type Object = IndexMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
  Undefined,
  Null,
  Bool(bool),
  Number(f64),
  String(String),
  Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
  Array(Vec<Value>),
  Object(Object),
  /// A pull-based sequence of chunks living in the peer's stream table.
  StreamRef(u64),
  /// A function living in the peer's callback table.
  CallbackRef(u64),
  /// An async iterator living in the peer's stream table. Distinguished from
  /// `StreamRef` so the sandbox can offer both iteration and `getReader()`
  /// without eagerly wrapping.
  IteratorRef(u64),
}

impl Value {
  pub fn object(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
    Value::Object(entries.into_iter().collect())
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_number(&self) -> Option<f64> {
    match self {
      Value::Number(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&Object> {
    match self {
      Value::Object(o) => Some(o),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[Value]> {
    match self {
      Value::Array(a) => Some(a),
      _ => None,
    }
  }

  /// Property lookup on objects; anything else yields `None`.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_object().and_then(|o| o.get(key))
  }

  pub fn is_undefined(&self) -> bool {
    matches!(self, Value::Undefined)
  }

  pub fn is_nullish(&self) -> bool {
    matches!(self, Value::Undefined | Value::Null)
  }

  /// True for object trees that carry no sentinel refs and can therefore be
  /// serialized without consulting a handle table.
  pub fn is_serial(&self) -> bool {
    match self {
      Value::StreamRef(_) | Value::CallbackRef(_) | Value::IteratorRef(_) => {
        false
      }
      Value::Array(items) => items.iter().all(Value::is_serial),
      Value::Object(entries) => entries.values().all(Value::is_serial),
      _ => true,
    }
  }

  /// Walks the value and hands every sentinel handle id to `f`. Used by the
  /// bridge to validate that the peer holds a table entry for each ref before
  /// user code can observe it.
  pub fn for_each_ref(&self, f: &mut impl FnMut(ValueRef)) {
    match self {
      Value::StreamRef(id) => f(ValueRef::Stream(*id)),
      Value::CallbackRef(id) => f(ValueRef::Callback(*id)),
      Value::IteratorRef(id) => f(ValueRef::Iterator(*id)),
      Value::Array(items) => {
        for item in items {
          item.for_each_ref(f);
        }
      }
      Value::Object(entries) => {
        for item in entries.values() {
          item.for_each_ref(f);
        }
      }
      _ => {}
    }
  }
}

/// A sentinel reference found inside a [`Value`] tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueRef {
  Stream(u64),
  Callback(u64),
  Iterator(u64),
}

impl From<bool> for Value {
  fn from(b: bool) -> Value {
    Value::Bool(b)
  }
}

impl From<f64> for Value {
  fn from(n: f64) -> Value {
    Value::Number(n)
  }
}

impl From<u32> for Value {
  fn from(n: u32) -> Value {
    Value::Number(n as f64)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Value {
    Value::String(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Value {
    Value::String(s)
  }
}

impl From<Vec<Value>> for Value {
  fn from(items: Vec<Value>) -> Value {
    Value::Array(items)
  }
}

impl From<serde_json::Value> for Value {
  fn from(v: serde_json::Value) -> Value {
    match v {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => {
        Value::Number(n.as_f64().unwrap_or(f64::NAN))
      }
      serde_json::Value::String(s) => Value::String(s),
      serde_json::Value::Array(items) => {
        Value::Array(items.into_iter().map(Value::from).collect())
      }
      serde_json::Value::Object(entries) => Value::Object(
        entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
      ),
    }
  }
}
