//! Signed batch decoding.
//!
//! A batch body is a UTF-8 JSON array of `{seq, ts, rng, data}` records
//! followed immediately by 128 ASCII hex characters: 64 for the signature's
//! `r`, 64 for `s`. The signature covers the SHA-256 of the JSON prefix.
//!
//! Decoding is generic over the payload type the endpoint expects; a record
//! whose `data` does not project into that type rejects the whole batch.

use serde::Deserialize;
use thiserror::Error;

use crate::crypto::{DeviceKey, SignatureError};
use crate::packet::{InnerVariant, Packet, PacketHeader};

/// Trailing signature length: 64 hex characters each for `r` and `s`.
pub const SIGNATURE_SUFFIX_LEN: usize = 128;

/// An empty array `[]` plus the signature suffix.
pub const MIN_BODY_LEN: usize = SIGNATURE_SUFFIX_LEN + 2;

/// Errors from batch decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The body cannot hold even an empty batch and a signature.
    #[error("body is {got} bytes, minimum is {MIN_BODY_LEN}")]
    TooShort {
        /// Received body length.
        got: usize,
    },

    /// The signature suffix is not ASCII.
    #[error("signature suffix is not ASCII hex")]
    BadSignatureEncoding,

    /// The signature is malformed or does not cover the JSON prefix.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The prefix is not a JSON array of packet records.
    #[error("batch is not a JSON packet array: {0}")]
    Json(#[from] serde_json::Error),

    /// A record's `data` is not the payload type this endpoint accepts.
    #[error("packet at index {0} does not carry the expected payload type")]
    BadInnerType(usize),
}

#[derive(Deserialize)]
struct RawRecord {
    seq: u32,
    ts: i32,
    rng: u32,
    data: serde_json::Value,
}

/// Authenticates `body` against the device key and decodes it into packets
/// carrying the payload type `T`.
pub fn decode_signed_batch<T: InnerVariant>(
    body: &[u8],
    key: &DeviceKey,
) -> Result<Vec<Packet>, CodecError> {
    if body.len() < MIN_BODY_LEN {
        return Err(CodecError::TooShort { got: body.len() });
    }

    let (json, suffix) = body.split_at(body.len() - SIGNATURE_SUFFIX_LEN);
    let suffix = std::str::from_utf8(suffix).map_err(|_| CodecError::BadSignatureEncoding)?;
    let (r_hex, s_hex) = suffix.split_at(SIGNATURE_SUFFIX_LEN / 2);

    // Authenticate before parsing anything out of the body.
    key.verify_message(json, r_hex, s_hex)?;

    let records: Vec<RawRecord> = serde_json::from_slice(json)?;

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let inner: T = serde_json::from_value(record.data)
                .map_err(|_| CodecError::BadInnerType(index))?;

            Ok(Packet {
                header: PacketHeader {
                    sequence_id: record.seq,
                    timestamp: record.ts,
                    rng_state: record.rng,
                },
                inner: inner.into_inner(),
            })
        })
        .collect()
}
