//! Session lifecycle and lock-step packet validation.
//!
//! The manager is a two-state machine: **Idle** (no session, packets are
//! rejected) and **Active** (a store-assigned session id plus the immutable
//! initial generator vector). The only transition is a successful
//! challenge-response reset, which the vehicle performs once per power
//! cycle.
//!
//! # Atomicity
//!
//! One mutex guards the reset token and the active session together. A
//! reset (signature check, fresh seed, store insert, token regeneration)
//! runs entirely under the lock, so an in-flight packet validation sees
//! either the old session or the new one, never a mix. Any reset failure
//! leaves token, session id and seed exactly as they were.
//!
//! Packet validation derives the expected generator output from the
//! immutable seed ([`rng::nth_output`]), so there is no cursor to roll back
//! when a packet is rejected.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use pitlink_core::crypto::{DeviceKey, SignatureError};
use pitlink_core::packet::Packet;
use pitlink_core::rng::{self, Seed};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::info;

use crate::store::{NewSession, SessionStore, StoreError};

/// Reset POST body: 64 hex chars of `r`, then 64 of `s`.
pub const RESET_BODY_LEN: usize = 128;

const DELAY_WINDOW_LEN: usize = 10;

/// Errors from a reset attempt. Every one of them leaves the manager
/// untouched.
#[derive(Debug, Error)]
pub enum ResetError {
    /// The body is not exactly [`RESET_BODY_LEN`] bytes.
    #[error("reset body is {got} bytes, expected {RESET_BODY_LEN}")]
    BadLength {
        /// Received body length.
        got: usize,
    },

    /// The body is not ASCII hex.
    #[error("reset body is not ASCII hex")]
    BadHex,

    /// The signature does not sign the current reset token.
    #[error("signature does not sign the challenge")]
    BadSignature,

    /// The sessions store rejected the insert.
    #[error("session allocation failed: {0}")]
    Store(#[from] StoreError),
}

/// Errors from packet validation. The packet is dropped; session state is
/// unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    /// No session is active; the vehicle has not completed a reset.
    #[error("no live session")]
    NoSession,

    /// The quoted generator output does not match the derivation.
    #[error("bad generator state (got: {got}, expected: {expected})")]
    BadRngState {
        /// What the packet quoted.
        got: u32,
        /// What the session seed derives at this sequence id.
        expected: u32,
    },

    /// The sequence id is behind the last accepted one.
    #[error("stale sequence id (got: {got}, last accepted: {last})")]
    StaleSequence {
        /// The packet's sequence id.
        got: u32,
        /// The last accepted sequence id.
        last: u32,
    },
}

/// The result of a successful reset.
#[derive(Debug, Clone, Copy)]
pub struct ResetOutcome {
    /// The store-assigned session id.
    pub session_id: u64,

    /// The freshly drawn initial generator vector. The vehicle reads this
    /// out of the reset response and seeds its own generator with it.
    pub seed: Seed,
}

struct ActiveSession {
    session_id: u64,
    seed: Seed,
    last_accepted_seq: Option<u32>,
    dropped_count: u64,

    // Ring of server-minus-vehicle clock deltas over accepted packets.
    delay_window: [i32; DELAY_WINDOW_LEN],
    delay_cursor: usize,
    delay_filled: usize,
}

impl ActiveSession {
    fn new(session_id: u64, seed: Seed) -> Self {
        Self {
            session_id,
            seed,
            last_accepted_seq: None,
            dropped_count: 0,
            delay_window: [0; DELAY_WINDOW_LEN],
            delay_cursor: 0,
            delay_filled: 0,
        }
    }

    fn push_delay(&mut self, delay: i32) {
        self.delay_window[self.delay_cursor] = delay;
        self.delay_cursor = (self.delay_cursor + 1) % DELAY_WINDOW_LEN;
        self.delay_filled = (self.delay_filled + 1).min(DELAY_WINDOW_LEN);
    }

    fn mean_delay(&self) -> Option<f64> {
        if self.delay_filled == 0 {
            return None;
        }

        let sum: i64 = self.delay_window[..self.delay_filled]
            .iter()
            .map(|&d| i64::from(d))
            .sum();
        let mean = sum as f64 / self.delay_filled as f64;
        Some(mean)
    }
}

struct SessionInner {
    reset_token: [u8; 32],
    session: Option<ActiveSession>,
}

/// Owns the reset token and the active session. Shared across HTTP handlers
/// and publish workers behind an `Arc`.
pub struct SessionManager {
    device_key: DeviceKey,
    store: Arc<dyn SessionStore>,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    /// Creates an idle manager with a fresh reset token.
    pub fn new(device_key: DeviceKey, store: Arc<dyn SessionStore>) -> Self {
        Self {
            device_key,
            store,
            inner: Mutex::new(SessionInner {
                reset_token: fresh_token(),
                session: None,
            }),
        }
    }

    /// Returns the current reset token, hex-encoded. Stable until a reset
    /// succeeds.
    pub fn reset_challenge(&self) -> String {
        hex::encode(self.lock().reset_token)
    }

    /// Processes a reset body (`r` then `s`, 64 hex chars each, signing the
    /// raw token bytes). On success the manager holds a brand-new session
    /// and a brand-new token.
    pub fn reset(&self, body: &[u8]) -> Result<ResetOutcome, ResetError> {
        if body.len() != RESET_BODY_LEN {
            return Err(ResetError::BadLength { got: body.len() });
        }

        let text = std::str::from_utf8(body).map_err(|_| ResetError::BadHex)?;
        let (r_hex, s_hex) = text.split_at(RESET_BODY_LEN / 2);

        let mut inner = self.lock();

        match self
            .device_key
            .verify_digest(&inner.reset_token, r_hex, s_hex)
        {
            Ok(()) => {}
            Err(SignatureError::BadHexR | SignatureError::BadHexS) => {
                return Err(ResetError::BadHex)
            }
            Err(SignatureError::BadSignature) => return Err(ResetError::BadSignature),
        }

        let seed = fresh_seed();
        let session_id = self.store.insert_session(&NewSession {
            prng_hex: &seed_hex(seed),
            challenge_hex: &hex::encode(inner.reset_token),
            csig_r: r_hex,
            csig_s: s_hex,
        })?;

        // Past the last failure point: swap session and token together.
        inner.session = Some(ActiveSession::new(session_id, seed));
        inner.reset_token = fresh_token();

        info!(session_id, "session reset accepted");

        Ok(ResetOutcome { session_id, seed })
    }

    /// Validates one packet against the active session and returns the
    /// session id it was accepted under.
    pub fn ingest_packet(&self, packet: &Packet) -> Result<u64, IngestError> {
        let mut inner = self.lock();
        let session = inner.session.as_mut().ok_or(IngestError::NoSession)?;

        let seq = packet.header.sequence_id;

        if let Some(last) = session.last_accepted_seq {
            if seq < last {
                return Err(IngestError::StaleSequence { got: seq, last });
            }
        }

        let expected = rng::nth_output(session.seed, seq);
        if packet.header.rng_state != expected {
            return Err(IngestError::BadRngState {
                got: packet.header.rng_state,
                expected,
            });
        }

        if let Some(last) = session.last_accepted_seq {
            session.dropped_count += u64::from((seq - last).saturating_sub(1));
        }
        session.last_accepted_seq = Some(seq);

        #[allow(clippy::cast_possible_truncation)] // vehicle clocks are 32-bit
        session.push_delay(Utc::now().timestamp() as i32 - packet.header.timestamp);

        Ok(session.session_id)
    }

    /// The active session id, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.lock().session.as_ref().map(|s| s.session_id)
    }

    /// Skipped sequence ids since session start.
    pub fn dropped_count(&self) -> Option<u64> {
        self.lock().session.as_ref().map(|s| s.dropped_count)
    }

    /// Mean server-minus-vehicle clock delta over the last accepted packets.
    pub fn mean_delay(&self) -> Option<f64> {
        self.lock().session.as_ref().and_then(ActiveSession::mean_delay)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        // Validation mutates state only after every check has passed, so a
        // poisoned guard still holds a consistent session.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Formats a seed the way the firmware reads it back: four `%08x` words.
#[must_use]
pub fn seed_hex(seed: Seed) -> String {
    format!(
        "{:08x}{:08x}{:08x}{:08x}",
        seed[0], seed[1], seed[2], seed[3]
    )
}

fn fresh_token() -> [u8; 32] {
    let mut token = [0u8; 32];
    OsRng.fill_bytes(&mut token);
    token
}

fn fresh_seed() -> Seed {
    let mut seed = [0u32; 4];
    for word in &mut seed {
        *word = OsRng.next_u32();
    }
    seed
}
