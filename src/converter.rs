//! Pluggable payload codec.
//!
//! Payloads cross two boundaries with the same codec: workflow/activity
//! arguments and results, and the attribute blobs stored inside history
//! events. Replay requires that the codec stays the same across runs of an
//! instance.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::Payload;

/// Object-safe codec over a self-describing intermediate value.
pub trait Converter: Send + Sync {
    fn encode_value(&self, v: Value) -> Result<Payload, String>;
    fn decode_value(&self, p: &Payload) -> Result<Value, String>;
}

/// Default codec: UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn encode_value(&self, v: Value) -> Result<Payload, String> {
        serde_json::to_vec(&v).map_err(|e| e.to_string())
    }

    fn decode_value(&self, p: &Payload) -> Result<Value, String> {
        serde_json::from_slice(p).map_err(|e| e.to_string())
    }
}

pub fn encode<T: Serialize>(c: &dyn Converter, v: &T) -> Result<Payload, String> {
    let value = serde_json::to_value(v).map_err(|e| e.to_string())?;
    c.encode_value(value)
}

pub fn decode<T: DeserializeOwned>(c: &dyn Converter, p: &Payload) -> Result<T, String> {
    let value = c.decode_value(p)?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}
