//! Ingest core for the pitlink telemetry server.
//!
//! This crate holds the pure, I/O-free half of the ingest path:
//!
//! - **PRNG**: the xoshiro128++ generator the vehicle firmware runs in
//!   lock-step with the server ([`rng`])
//! - **Signature verification**: ECDSA-P256 over SHA-256, keyed by the
//!   device public key ([`crypto`])
//! - **Packet model**: the essentials and full telemetry payloads and their
//!   wire names ([`packet`])
//! - **Batch codec**: signed JSON batch bodies decoded into typed packets
//!   ([`codec`])
//! - **Bus envelope**: the `{session_id, packet}` pair that goes over the
//!   fan-out exchange ([`envelope`])
//!
//! Session state, persistence, the publish pipeline and the HTTP surface
//! live in `pitlink-daemon`.

pub mod codec;
pub mod crypto;
pub mod envelope;
pub mod packet;
pub mod rng;
