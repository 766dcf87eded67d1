//! pitlink-daemon - telemetry ingest server for the vehicle uplink.
//!
//! The daemon accepts signed telemetry from the car over HTTP, validates
//! each packet against the per-session lock-step generator, and fans the
//! accepted packets out to the message bus for downstream consumers
//! (persistence, live dashboard).
//!
//! # Architecture
//!
//! - [`session`]: the session state machine: reset challenge-response,
//!   per-packet freshness validation
//! - [`store`]: the sessions table behind the [`store::SessionStore`] seam
//! - [`pipeline`]: bounded batch queue and publish workers
//! - [`bus`]: AMQP transport behind the [`bus::BusTransport`] seam
//! - [`http`]: the four vehicle-facing endpoints
//! - [`config`]: the environment-derived configuration record

pub mod bus;
pub mod config;
pub mod http;
pub mod pipeline;
pub mod session;
pub mod store;
