//! Message payloads
//!
//! [`Message`] is the default payload carried by a [`Port`](crate::Port): an
//! integer `what` code plus named [`Value`] slots. Ports are generic, so hosts
//! that want their own payload type can use it directly instead.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Dynamically typed value stored in messages and task results
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// No value
    #[default]
    Unit,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<Value>),
}

impl Value {
    /// Check if this is the unit value
    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    /// Get the boolean, if this is a `Bool`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the integer, if this is an `Int`
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the number as a float (integers are widened)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get the string slice, if this is a `Str`
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the byte slice, if this is `Bytes`
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get the items, if this is a `List`
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Name of the slot used by [`Message::with_data`]
const DATA_SLOT: &str = "data";

/// A message with a `what` code and named values
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Message {
    what: i32,
    values: BTreeMap<String, Value>,
}

impl Message {
    /// Create an empty message with the given code
    pub fn new(what: i32) -> Self {
        Self {
            what,
            values: BTreeMap::new(),
        }
    }

    /// Create a message carrying a single value in its `data` slot
    pub fn with_data(what: i32, data: impl Into<Value>) -> Self {
        Self::new(what).with(DATA_SLOT, data)
    }

    /// Message code
    pub fn what(&self) -> i32 {
        self.what
    }

    /// Builder-style setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Set a named value, returning the previous one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    /// Get a named value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Get a named integer
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    /// Get a named string
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// The value stored by [`Message::with_data`]
    pub fn data(&self) -> Option<&Value> {
        self.get(DATA_SLOT)
    }

    /// Remove a named value
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Iterate over named values in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of named values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the message carries no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<i32> for Message {
    fn from(what: i32) -> Self {
        Message::new(what)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({}", self.what)?;
        for (name, value) in &self.values {
            write!(f, ", {}={}", name, value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_values() {
        let mut msg = Message::new(7).with("count", 10).with("name", "widget");
        assert_eq!(msg.what(), 7);
        assert_eq!(msg.get_int("count"), Some(10));
        assert_eq!(msg.get_str("name"), Some("widget"));
        assert_eq!(msg.get_int("name"), None);
        assert_eq!(msg.len(), 2);

        let old = msg.set("count", 11);
        assert_eq!(old, Some(Value::Int(10)));
        assert_eq!(msg.get_int("count"), Some(11));

        assert_eq!(msg.remove("name"), Some(Value::Str("widget".into())));
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn test_message_data_slot() {
        let msg = Message::with_data(1, 3.5);
        assert_eq!(msg.data(), Some(&Value::Float(3.5)));
        assert!(Message::new(1).data().is_none());
    }

    #[test]
    fn test_message_display() {
        let msg = Message::new(2).with("b", true).with("a", 1);
        assert_eq!(msg.to_string(), "Message(2, a=1, b=true)");
    }

    #[test]
    fn test_value_conversions() {
        assert!(Value::from(()).is_unit());
        assert_eq!(Value::from(5usize).as_int(), Some(5));
        assert_eq!(Value::from(2).as_float(), Some(2.0));
        assert_eq!(Value::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));

        let list = Value::from(vec![Value::from(1), Value::from("x")]);
        assert_eq!(list.to_string(), "[1, \"x\"]");
        assert_eq!(list.as_list().map(|l| l.len()), Some(2));
    }

    #[test]
    fn test_message_serializes_to_json_object() {
        let msg = Message::new(3).with("n", 4);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"what":3,"values":{"n":4}}"#);
    }
}
