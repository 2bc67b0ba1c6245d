//! Pluggable payload serialization.
//!
//! The bus stores message and snapshot payloads as opaque bytes. How those bytes
//! are produced is up to the injected `PayloadSerializer`; the engine never
//! inspects them.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializerError {
    #[error("failed to serialize {type_name}: {reason}")]
    Serialize { type_name: String, reason: String },

    #[error("failed to deserialize {type_name}: {reason}")]
    Deserialize { type_name: String, reason: String },
}

/// Object-safe serializer boundary.
///
/// Works on `serde_json::Value` so it can live behind `Arc<dyn PayloadSerializer>`;
/// use [`encode`] / [`decode`] for typed access.
pub trait PayloadSerializer: Send + Sync + core::fmt::Debug {
    /// Short name of the wire format (e.g. "json").
    fn format(&self) -> &'static str;

    fn to_bytes(&self, value: &JsonValue) -> Result<Vec<u8>, String>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<JsonValue, String>;
}

impl<S> PayloadSerializer for Arc<S>
where
    S: PayloadSerializer + ?Sized,
{
    fn format(&self) -> &'static str {
        (**self).format()
    }

    fn to_bytes(&self, value: &JsonValue) -> Result<Vec<u8>, String> {
        (**self).to_bytes(value)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<JsonValue, String> {
        (**self).from_bytes(bytes)
    }
}

/// UTF-8 JSON serializer (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn to_bytes(&self, value: &JsonValue) -> Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| e.to_string())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<JsonValue, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

/// Serialize a typed value through a serializer.
pub fn encode<T>(serializer: &dyn PayloadSerializer, value: &T) -> Result<Vec<u8>, SerializerError>
where
    T: Serialize,
{
    let type_name = core::any::type_name::<T>();
    let json = serde_json::to_value(value).map_err(|e| SerializerError::Serialize {
        type_name: type_name.to_string(),
        reason: e.to_string(),
    })?;
    serializer
        .to_bytes(&json)
        .map_err(|reason| SerializerError::Serialize {
            type_name: type_name.to_string(),
            reason,
        })
}

/// Deserialize bytes produced by [`encode`] back into a typed value.
pub fn decode<T>(serializer: &dyn PayloadSerializer, bytes: &[u8]) -> Result<T, SerializerError>
where
    T: DeserializeOwned,
{
    let type_name = core::any::type_name::<T>();
    let json = serializer
        .from_bytes(bytes)
        .map_err(|reason| SerializerError::Deserialize {
            type_name: type_name.to_string(),
            reason,
        })?;
    serde_json::from_value(json).map_err(|e| SerializerError::Deserialize {
        type_name: type_name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        number: String,
        total_cents: i64,
    }

    #[test]
    fn json_encode_decode() {
        let invoice = Invoice {
            number: "INV-7".into(),
            total_cents: 12_500,
        };
        let bytes = encode(&JsonSerializer, &invoice).unwrap();
        assert_eq!(decode::<Invoice>(&JsonSerializer, &bytes).unwrap(), invoice);
    }

    #[test]
    fn decode_reports_target_type() {
        let err = decode::<Invoice>(&JsonSerializer, b"{\"number\":1}").unwrap_err();
        match err {
            SerializerError::Deserialize { type_name, .. } => assert!(type_name.ends_with("Invoice")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
