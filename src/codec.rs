//! JSON body codec.
//!
//! Calls and emissions carry exactly one logical argument wrapped in a
//! single-element array: `[argument]`. Replies carry `[error, result]` where
//! `error` is `null` on success.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TemitError};

/// Content type stamped on every message temit publishes.
pub const CONTENT_TYPE: &str = "application/json";

/// Error produced by a remote handler, as carried in the error slot of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class name; `"Error"` unless the handler says otherwise.
    #[serde(default = "RemoteError::default_name")]
    pub name: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional structured payload attached by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: Self::default_name(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn default_name() -> String {
        "Error".to_string()
    }

    /// Interpret whatever a peer put in the error slot.
    ///
    /// Peers written in other languages send plain strings or arbitrary
    /// objects; anything without a `message` field is kept whole in `data`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self::new(message),
            Value::Object(map) if map.contains_key("message") => {
                let value = Value::Object(map);
                serde_json::from_value(value.clone())
                    .unwrap_or_else(|_| Self::new(value.to_string()).with_data(value))
            }
            other => Self::new(other.to_string()).with_data(other),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<TemitError> for RemoteError {
    fn from(e: TemitError) -> Self {
        match e {
            TemitError::Remote(remote) => remote,
            other => Self::new(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string()).with_name("SerializationError")
    }
}

/// Outcome of a handler, normalised to the reply pair.
pub type Outcome = std::result::Result<Value, RemoteError>;

/// Encode a single call/emission argument as `[argument]`.
pub fn encode_args<T: Serialize + ?Sized>(arg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&[arg])?)
}

/// Decode an inbound call/emission body to its single argument.
///
/// An empty array decodes to `null`; more than one element breaks the
/// one-argument wire contract and is rejected.
pub fn decode_args(body: &[u8]) -> Result<Value> {
    let mut args: Vec<Value> = serde_json::from_slice(body)?;
    match args.len() {
        0 => Ok(Value::Null),
        1 => Ok(args.remove(0)),
        n => Err(TemitError::Codec(format!(
            "expected a single argument, got {}",
            n
        ))),
    }
}

/// Encode a reply pair `[error, result]`.
pub fn encode_reply(outcome: &Outcome) -> Result<Vec<u8>> {
    let pair = match outcome {
        Ok(result) => (Value::Null, result.clone()),
        Err(error) => (serde_json::to_value(error)?, Value::Null),
    };
    Ok(serde_json::to_vec(&pair)?)
}

/// Decode a reply body into its outcome.
pub fn decode_reply(body: &[u8]) -> Result<Outcome> {
    let value: Value = serde_json::from_slice(body)?;
    let Value::Array(mut pair) = value else {
        return Err(TemitError::Protocol("reply body is not an array".to_string()));
    };
    if pair.is_empty() {
        return Err(TemitError::Protocol("reply body is empty".to_string()));
    }
    let result = if pair.len() > 1 {
        pair.swap_remove(1)
    } else {
        Value::Null
    };
    match pair.swap_remove(0) {
        Value::Null => Ok(Ok(result)),
        error => Ok(Err(RemoteError::from_value(error))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_args_wraps_in_array() {
        let body = encode_args(&json!({"id": 7})).unwrap();
        assert_eq!(body, br#"[{"id":7}]"#);
    }

    #[test]
    fn test_decode_args_single() {
        assert_eq!(decode_args(br#"["hello"]"#).unwrap(), json!("hello"));
    }

    #[test]
    fn test_decode_args_empty_is_null() {
        assert_eq!(decode_args(b"[]").unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_args_rejects_multiple() {
        assert!(matches!(
            decode_args(b"[1,2]"),
            Err(TemitError::Codec(_))
        ));
    }

    #[test]
    fn test_decode_args_rejects_garbage() {
        assert!(decode_args(b"not json").is_err());
        assert!(decode_args(br#"{"a":1}"#).is_err());
    }

    #[test]
    fn test_reply_success_has_null_error() {
        let body = encode_reply(&Ok(json!(42))).unwrap();
        assert_eq!(body, b"[null,42]");
    }

    #[test]
    fn test_reply_null_result_is_success() {
        let outcome = decode_reply(b"[null,null]").unwrap();
        assert_eq!(outcome, Ok(Value::Null));
    }

    #[test]
    fn test_reply_error_round_trip() {
        let body = encode_reply(&Err(RemoteError::new("boom"))).unwrap();
        let outcome = decode_reply(&body).unwrap();
        assert_eq!(outcome.unwrap_err().message, "boom");
    }

    #[test]
    fn test_reply_string_error_from_foreign_peer() {
        let outcome = decode_reply(br#"["nope"]"#).unwrap();
        assert_eq!(outcome.unwrap_err().message, "nope");
    }

    #[test]
    fn test_reply_object_error_without_message_keeps_data() {
        let outcome = decode_reply(br#"[{"code":3},null]"#).unwrap();
        let err = outcome.unwrap_err();
        assert_eq!(err.data, Some(json!({"code": 3})));
    }

    #[test]
    fn test_reply_not_array_is_protocol_violation() {
        assert!(matches!(
            decode_reply(br#"{"error":null}"#),
            Err(TemitError::Protocol(_))
        ));
        assert!(matches!(decode_reply(b"[]"), Err(TemitError::Protocol(_))));
    }
}
