//! Device signature verification.
//!
//! The vehicle signs with a fixed ECDSA key on NIST P-256. Signatures travel
//! as bare `r` and `s` scalars, each a 64-character lower-case hex string,
//! with no ASN.1 framing.
//!
//! Two verification entry points exist because the firmware signs two kinds
//! of material:
//!
//! - packet batches sign the SHA-256 of the JSON body
//!   ([`DeviceKey::verify_message`])
//! - the session reset challenge signs the raw 32 token bytes, which are
//!   used directly as the digest ([`DeviceKey::verify_digest`])

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex length of one signature scalar (and one affine coordinate).
pub const SCALAR_HEX_LEN: usize = 64;

/// Errors from signature verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// `r` is not a 64-character hex scalar.
    #[error("signature r is not a {SCALAR_HEX_LEN}-character hex scalar")]
    BadHexR,

    /// `s` is not a 64-character hex scalar.
    #[error("signature s is not a {SCALAR_HEX_LEN}-character hex scalar")]
    BadHexS,

    /// The scalars are out of range or the signature does not verify.
    #[error("signature does not verify against the device key")]
    BadSignature,
}

/// Errors from device key construction.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A coordinate is not a 64-character hex string.
    #[error("public key coordinate {coordinate} is not a {SCALAR_HEX_LEN}-character hex string")]
    BadCoordinate {
        /// Which coordinate failed to parse.
        coordinate: char,
    },

    /// The coordinates do not name a point on P-256.
    #[error("public key coordinates are not a point on P-256")]
    NotOnCurve,
}

/// The vehicle's ECDSA-P256 public key.
#[derive(Debug, Clone)]
pub struct DeviceKey {
    verifying: VerifyingKey,
}

impl DeviceKey {
    /// Builds the key from its affine coordinates, each a 64-character hex
    /// string as found in `STM_PK_X` / `STM_PK_Y`.
    pub fn from_coordinates(x_hex: &str, y_hex: &str) -> Result<Self, KeyError> {
        let x = decode_scalar(x_hex).ok_or(KeyError::BadCoordinate { coordinate: 'x' })?;
        let y = decode_scalar(y_hex).ok_or(KeyError::BadCoordinate { coordinate: 'y' })?;

        let point = p256::EncodedPoint::from_affine_coordinates(&x.into(), &y.into(), false);
        let verifying =
            VerifyingKey::from_encoded_point(&point).map_err(|_| KeyError::NotOnCurve)?;

        Ok(Self { verifying })
    }

    /// Verifies `r`/`s` over a caller-supplied digest. The bytes are passed
    /// to ECDSA as-is; this is the reset-token path, where the raw 32-byte
    /// challenge *is* the digest.
    pub fn verify_digest(
        &self,
        digest: &[u8],
        r_hex: &str,
        s_hex: &str,
    ) -> Result<(), SignatureError> {
        let r = decode_scalar(r_hex).ok_or(SignatureError::BadHexR)?;
        let s = decode_scalar(s_hex).ok_or(SignatureError::BadHexS)?;

        // from_scalars rejects zero or non-reduced scalars.
        let signature =
            Signature::from_scalars(r, s).map_err(|_| SignatureError::BadSignature)?;

        self.verifying
            .verify_prehash(digest, &signature)
            .map_err(|_| SignatureError::BadSignature)
    }

    /// Verifies `r`/`s` over the SHA-256 of `message`; the packet-batch path.
    pub fn verify_message(
        &self,
        message: &[u8],
        r_hex: &str,
        s_hex: &str,
    ) -> Result<(), SignatureError> {
        let digest = Sha256::digest(message);
        self.verify_digest(&digest, r_hex, s_hex)
    }
}

fn decode_scalar(hex_str: &str) -> Option<[u8; 32]> {
    if hex_str.len() != SCALAR_HEX_LEN {
        return None;
    }

    let mut out = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    use super::*;

    fn test_keypair() -> (SigningKey, DeviceKey) {
        let signing = SigningKey::random(&mut OsRng);
        let point = signing.verifying_key().to_encoded_point(false);
        let device = DeviceKey::from_coordinates(
            &hex::encode(point.x().unwrap()),
            &hex::encode(point.y().unwrap()),
        )
        .unwrap();
        (signing, device)
    }

    fn scalars_hex(signature: &Signature) -> (String, String) {
        let (r, s) = signature.split_bytes();
        (hex::encode(r), hex::encode(s))
    }

    #[test]
    fn signed_message_verifies() {
        let (signing, device) = test_keypair();
        let message = br#"[{"seq":0,"ts":100,"rng":641,"data":{}}]"#;

        let signature: Signature = signing.sign(message);
        let (r, s) = scalars_hex(&signature);

        assert_eq!(device.verify_message(message, &r, &s), Ok(()));
    }

    #[test]
    fn flipped_message_bit_fails() {
        let (signing, device) = test_keypair();
        let message = b"telemetry batch body";

        let signature: Signature = signing.sign(message);
        let (r, s) = scalars_hex(&signature);

        let mut tampered = message.to_vec();
        tampered[3] ^= 0x01;

        assert_eq!(
            device.verify_message(&tampered, &r, &s),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn flipped_signature_bit_fails() {
        let (signing, device) = test_keypair();
        let message = b"telemetry batch body";

        let signature: Signature = signing.sign(message);
        let (r, s) = scalars_hex(&signature);

        // Flip the low nibble of the last r digit.
        let mut r_bytes = r.into_bytes();
        r_bytes[63] = if r_bytes[63] == b'0' { b'1' } else { b'0' };
        let r = String::from_utf8(r_bytes).unwrap();

        assert_eq!(
            device.verify_message(message, &r, &s),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn raw_digest_verification_does_not_rehash() {
        let (signing, device) = test_keypair();
        let token = [0x5Au8; 32];

        let signature: Signature = signing.sign_prehash(&token).unwrap();
        let (r, s) = scalars_hex(&signature);

        assert_eq!(device.verify_digest(&token, &r, &s), Ok(()));
        // The same signature must not verify through the hashing path.
        assert_eq!(
            device.verify_message(&token, &r, &s),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn malformed_scalars_are_rejected_as_hex_errors() {
        let (_, device) = test_keypair();
        let digest = [0u8; 32];
        let good = "11".repeat(32);

        assert_eq!(
            device.verify_digest(&digest, "zz", &good),
            Err(SignatureError::BadHexR)
        );
        assert_eq!(
            device.verify_digest(&digest, &good, "0123"),
            Err(SignatureError::BadHexS)
        );
        assert_eq!(
            device.verify_digest(&digest, &"zz".repeat(32), &good),
            Err(SignatureError::BadHexR)
        );
    }

    #[test]
    fn bad_coordinates_are_rejected() {
        assert!(matches!(
            DeviceKey::from_coordinates("not hex", &"22".repeat(32)),
            Err(KeyError::BadCoordinate { coordinate: 'x' })
        ));
        assert!(matches!(
            DeviceKey::from_coordinates(&"11".repeat(32), "cafe"),
            Err(KeyError::BadCoordinate { coordinate: 'y' })
        ));
        // Valid hex, but almost surely not a curve point.
        assert!(matches!(
            DeviceKey::from_coordinates(&"11".repeat(32), &"22".repeat(32)),
            Err(KeyError::NotOnCurve)
        ));
    }
}
