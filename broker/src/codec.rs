//! Outbound encoding and inbound decoding of message payloads.

use bytes::Bytes;
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::BrokerError;
use crate::message::{Content, MessageProperties};

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

const MESSAGE_ID_LEN: usize = 21;
const MESSAGE_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Process identifier stamped as the default `appId`.
static APP_ID: Lazy<String> = Lazy::new(|| {
    let name = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "rust".to_string());
    format!("{}:{}", name, std::process::id())
});

/// An outbound payload: pre-encoded bytes pass through untouched, anything
/// else is JSON-encoded by the codec.
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Bytes),
    Json(Value),
}

impl Payload {
    /// Wrap any serializable value as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, BrokerError> {
        Ok(Payload::Json(serde_json::to_value(value).map_err(BrokerError::Encode)?))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Json(Value::String(value.to_string()))
    }
}

/// Encode an outbound payload and fill in the property defaults.
///
/// Raw bytes are passed through with the content type left exactly as the
/// caller set it. JSON payloads are serialized; a caller-supplied content
/// type other than `application/json` is preserved over the JSON bytes.
/// `messageId`, `timestamp` and `appId` are injected when absent.
pub(crate) fn encode(
    payload: Payload,
    mut properties: MessageProperties,
) -> Result<(Bytes, MessageProperties), BrokerError> {
    let bytes = match payload {
        Payload::Bytes(bytes) => bytes,
        Payload::Json(value) => {
            if properties.content_type.is_none() {
                properties.content_type = Some(JSON_CONTENT_TYPE.to_string());
            }
            Bytes::from(serde_json::to_vec(&value).map_err(BrokerError::Encode)?)
        }
    };

    if properties.message_id.is_none() {
        properties.message_id = Some(random_id());
    }
    if properties.timestamp.is_none() {
        properties.timestamp = Some(Utc::now().timestamp_millis() as u64);
    }
    if properties.app_id.is_none() {
        properties.app_id = Some(APP_ID.clone());
    }

    Ok((bytes, properties))
}

/// Decode inbound content per the delivery's content type.
pub(crate) fn decode(payload: &Bytes, properties: &MessageProperties) -> Result<Content, serde_json::Error> {
    if properties.content_type.as_deref() == Some(JSON_CONTENT_TYPE) {
        Ok(Content::Json(serde_json::from_slice(payload)?))
    } else {
        Ok(Content::Raw(payload.clone()))
    }
}

/// 21-character random id over the URL-safe alphabet.
fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MESSAGE_ID_LEN)
        .map(|_| {
            let index = rng.gen_range(0..MESSAGE_ID_ALPHABET.len());
            MESSAGE_ID_ALPHABET[index] as char
        })
        .collect()
}
