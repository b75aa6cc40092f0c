//! Typed header values and the field table used for application headers
//! and queue/exchange arguments.

use std::collections::HashMap;

use ahash::RandomState;
use tracing::warn;
use uuid::Uuid;

/// A single typed value as carried in message headers and declare-time
/// arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Void,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Uuid(Uuid),
    List(Vec<FieldValue>),
    Map(FieldTable),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Widening view of any integer variant.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            FieldValue::U8(v) => Some(v as i64),
            FieldValue::U16(v) => Some(v as i64),
            FieldValue::U32(v) => Some(v as i64),
            FieldValue::U64(v) => Some(v as i64),
            FieldValue::I8(v) => Some(v as i64),
            FieldValue::I16(v) => Some(v as i64),
            FieldValue::I32(v) => Some(v as i64),
            FieldValue::I64(v) => Some(v as i64),
            _ => None,
        }
    }

    /// True for `Bool(true)`, any non-zero integer, and the strings
    /// `"1"` / `"true"`.
    pub fn is_truthy(&self) -> bool {
        match self {
            FieldValue::Bool(b) => *b,
            FieldValue::Str(s) => s == "1" || s.eq_ignore_ascii_case("true"),
            v => v.as_int().map(|i| i != 0).unwrap_or(false),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// An ordered-on-iteration-agnostic map of header name to typed value.
///
/// Used both for message application headers and for the argument tables
/// passed to queue and exchange declares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable {
    entries: HashMap<String, FieldValue, RandomState>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.entries.iter()
    }

    /// String view of a value, if present and a string.
    pub fn get_as_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    /// True when the key is present with a truthy value.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).map(FieldValue::is_truthy).unwrap_or(false)
    }

    /// Integer view of a setting: accepts integer variants directly and
    /// parses string values. Unconvertible values are logged and read
    /// as zero, so a bad argument never aborts a declare.
    pub fn integer_setting(&self, key: &str) -> i64 {
        match self.get(key) {
            None => 0,
            Some(v) => {
                if let Some(i) = v.as_int() {
                    i
                } else if let Some(s) = v.as_str() {
                    match s.parse::<i64>() {
                        Ok(i) => i,
                        Err(_) => {
                            warn!("ignoring invalid integer value for {}: {}", key, s);
                            0
                        }
                    }
                } else {
                    warn!("ignoring invalid integer value for {}: {:?}", key, v);
                    0
                }
            }
        }
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldTable {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut table = FieldTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}
