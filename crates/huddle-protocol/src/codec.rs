//! Codec for replication envelopes.
//!
//! Envelopes travel as UTF-8 JSON so that nodes written against other
//! runtimes can join the same broker topics.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required state field was missing.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Envelope is structurally valid JSON but semantically wrong.
    #[error("Invalid envelope: {0}")]
    Invalid(String),
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(envelope)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, not JSON, or has no target.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }

    let envelope: Envelope = serde_json::from_slice(data)?;
    if envelope.target().is_none() {
        return Err(ProtocolError::Invalid(format!(
            "action {:?} has neither channel_id nor room",
            envelope.action
        )));
    }

    Ok(envelope)
}
