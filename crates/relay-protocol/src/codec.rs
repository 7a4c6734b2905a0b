//! Codec for encoding and decoding relay events.
//!
//! Events travel as JSON text on every leg: HTTP bodies, broker payloads and
//! socket messages.

use bytes::Bytes;
use serde_json::{json, Value};
use thiserror::Error;

use crate::event::Event;

/// Maximum encoded event size (1 MiB).
pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Event exceeds maximum size.
    #[error("Event size {0} exceeds maximum {MAX_EVENT_SIZE}")]
    EventTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an event to JSON bytes.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode(event: &Event) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(event)?;

    if payload.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Encode an event to a JSON string, for text socket frames.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode_text(event: &Event) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;

    if text.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode an event from JSON bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid event.
pub fn decode(data: &[u8]) -> Result<Event, ProtocolError> {
    if data.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(data.len()));
    }

    Ok(serde_json::from_slice(data)?)
}

/// Decode a raw broker payload into event data.
///
/// Broker payloads are whatever the publisher sent. Valid JSON is used as is;
/// anything else is wrapped as `{"raw": "<text>"}` so it still reaches sockets.
#[must_use]
pub fn decode_broker_payload(payload: &[u8]) -> Value {
    match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => json!({ "raw": String::from_utf8_lossy(payload) }),
    }
}
