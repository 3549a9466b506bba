use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry::HandleId;

// ─── Value ────────────────────────────────────────────────────

/// A typed script value exchanged across the engine seam.
///
/// This is the complete set the runtime pushes into and pops out of the
/// scripting engine: results of async primitives, DB rows, HTTP responses.
/// Handles travel as `Int` carrying the registry id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Bytes(Bytes),
    Table(Table),
}

impl Value {
    pub fn handle(id: HandleId) -> Value {
        Value::Int(id.0 as i64)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_handle(&self) -> Option<HandleId> {
        match self {
            Value::Int(n) if *n >= 0 => Some(HandleId(*n as usize)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Table(_) => "table",
        }
    }

    /// Default string coercion, used when marshalling loosely-typed script
    /// values toward native code. Tables do not coerce.
    pub fn coerce_str(&self) -> Option<String> {
        match self {
            Value::Nil => Some("nil".to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(n) => Some(n.to_string()),
            Value::Num(n) => Some(n.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::Table(_) => None,
        }
    }
}

// ─── Table ────────────────────────────────────────────────────

/// A script table: an array part plus a string-keyed map part.
///
/// DB result sets, HTTP responses and stat results are materialized as
/// tables before the owning fiber is resumed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub arr: Vec<Value>,
    pub map: BTreeMap<String, Value>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn push(&mut self, v: Value) {
        self.arr.push(v);
    }

    pub fn set(&mut self, key: impl Into<String>, v: Value) {
        self.map.insert(key.into(), v);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.arr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arr.is_empty() && self.map.is_empty()
    }
}
