//! Bus envelope: the unit published to the fan-out exchange.
//!
//! Envelopes are CBOR so consumers can decode them without any out-of-band
//! schema; the payload variant travels as its own tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::Packet;

/// A validated packet together with the session it was accepted under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    pub session_id: u64,
    pub packet: Packet,
}

/// Errors from envelope encoding or decoding.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope encoding failed: {0}")]
    Encode(String),

    #[error("envelope decoding failed: {0}")]
    Decode(String),
}

impl PublishEnvelope {
    /// Serializes the envelope to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes an envelope from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        ciborium::from_reader(bytes).map_err(|e: ciborium::de::Error<std::io::Error>| {
            EnvelopeError::Decode(e.to_string())
        })
    }
}
