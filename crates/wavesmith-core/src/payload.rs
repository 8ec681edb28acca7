use crate::WavesmithResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque serialized blob carried by a task as its context or result.
///
/// The engine never inspects a payload. Producers and consumers agree on a
/// shape and go through [`Payload::encode`] / [`Payload::decode`]; the store
/// persists the JSON text as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(serde_json::Value);

impl Payload {
    /// An empty payload (`null`).
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    /// Serialize any value into a payload.
    pub fn encode<T: Serialize>(value: &T) -> WavesmithResult<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> WavesmithResult<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    /// Whether the payload carries nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    /// Borrow the raw JSON value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Render the payload as JSON text for storage.
    pub fn to_json(&self) -> WavesmithResult<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Parse a payload from stored JSON text.
    pub fn from_json(text: &str) -> WavesmithResult<Self> {
        Ok(Self(serde_json::from_str(text)?))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Brief {
        goal: String,
        files: Vec<String>,
    }

    #[test]
    fn test_encode_and_decode_struct() {
        let brief = Brief {
            goal: "add login".into(),
            files: vec!["src/auth.rs".into()],
        };
        let payload = Payload::encode(&brief).unwrap();
        assert!(!payload.is_empty());
        let back: Brief = payload.decode().unwrap();
        assert_eq!(back, brief);
    }

    #[test]
    fn test_decode_wrong_shape_is_error() {
        let payload = Payload::from(serde_json::json!({"unexpected": 1}));
        assert!(payload.decode::<Brief>().is_err());
    }

    #[test]
    fn test_empty_payload_stores_as_null() {
        let payload = Payload::empty();
        assert!(payload.is_empty());
        assert_eq!(payload.to_json().unwrap(), "null");
        assert_eq!(Payload::from_json("null").unwrap(), payload);
    }
}
