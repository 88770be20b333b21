use std::collections::BTreeMap;

use anyhow::{Context, Result};
use thiserror::Error;

pub(crate) use de::*;
pub(crate) use ser::*;

mod de;
mod ser;

/// An XML-RPC method call (`<methodCall>`).
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(name: &str, args: Vec<Value>) -> Call {
        Call {
            name: name.to_string(),
            args,
        }
    }
}

/// An XML-RPC method response (`<methodResponse>`): either the single
/// result value, or the fault the server answered with.
pub type Response = std::result::Result<Value, Fault>;

/// An XML-RPC fault (`<fault>`) of a failed method call.
///
/// Specific errors should be matched by message rather than code,
/// since the game server uses `-1000` for a lot of different errors.
/// An empty message means the cause has to be deduced from the call
/// and the context in which it was made.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("fault {code}: {msg}")]
pub struct Fault {
    pub code: i32,
    pub msg: String,
}

/// An XML-RPC value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A 32-bit signed integer (`<i4>` or `<int>`).
    Int(i32),

    /// A boolean (`<boolean>`, `0` or `1`).
    Bool(bool),

    /// A string (`<string>`).
    String(String),

    /// A double-precision IEEE 754 floating point number (`<double>`).
    Double(f64),

    /// Binary data (`<base64>`).
    Base64(Vec<u8>),

    /// A mapping of named values (`<struct>`).
    Struct(BTreeMap<String, Value>),

    /// A list of heterogeneous values (`<array>`).
    Array(Vec<Value>),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Base64(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Struct(v)
    }
}

impl<T> From<Vec<T>> for Value
where
    Value: From<T>,
{
    fn from(vs: Vec<T>) -> Self {
        Value::Array(vs.into_iter().map(|v| v.into()).collect())
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        use serde_json::Value as Json;
        match v {
            Value::Int(i) => Json::from(i),
            Value::Bool(b) => Json::from(b),
            Value::String(s) => Json::from(s),
            Value::Double(f) => Json::from(f),
            Value::Base64(bytes) => Json::from(bytes),
            Value::Struct(members) => Json::Object(
                members
                    .into_iter()
                    .map(|(name, member)| (name, member.into()))
                    .collect(),
            ),
            Value::Array(vs) => Json::Array(vs.into_iter().map(|v| v.into()).collect()),
        }
    }
}

/// Deserialize a `Value` into a `T`.
///
/// Struct instances are built from `Value::Struct`, vectors from
/// `Value::Array`, and primitives are lifted out of the remaining
/// variants. `Value::Base64` is exposed as its raw bytes.
pub fn from_value<T>(value: Value) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let debug_trace = format!("{:?}", value);
    serde_json::from_value(value.into())
        .with_context(|| format!("failed to deserialize {}", debug_trace))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(42), Value::Int(42));
        assert_eq!(Value::from("tm"), Value::String("tm".to_string()));
        assert_eq!(
            Value::from(vec![1, 2]),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn typed_struct_from_value() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct PlayerInfo {
            #[serde(rename = "Login")]
            login: String,
            #[serde(rename = "PlayerId")]
            player_id: i32,
            #[serde(rename = "IsSpectator")]
            is_spectator: bool,
        }

        let mut members = BTreeMap::new();
        members.insert("Login".to_string(), Value::from("tim"));
        members.insert("PlayerId".to_string(), Value::from(248));
        members.insert("IsSpectator".to_string(), Value::from(false));

        let info: PlayerInfo = from_value(Value::Struct(members)).unwrap();
        assert_eq!(
            info,
            PlayerInfo {
                login: "tim".to_string(),
                player_id: 248,
                is_spectator: false,
            }
        );
    }

    #[test]
    fn typed_list_from_value() {
        let value = Value::Array(vec![Value::from("a"), Value::from("b")]);
        let list: Vec<String> = from_value(value).unwrap();
        assert_eq!(list, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn mismatched_type_is_an_error() {
        let res: Result<i32> = from_value(Value::from("not a number"));
        assert!(res.is_err());
    }
}
