//! The vehicle-facing HTTP surface.
//!
//! Four endpoints, plain-text responses in the firmware's `+CST_*` dialect
//! where the firmware parses them:
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/session_reset_challenge` | `+CST_RESET_CHALLENGE <64-hex>` |
//! | POST | `/session_reset_challenge` | `+CST_RESET_SUCC <32-hex>` or `+CST_RESET_FAIL <code>` |
//! | POST | `/packet/full` | empty 200 |
//! | POST | `/packet/essentials` | empty 200 |
//!
//! Reset failure codes: `1` for a wrong-length body, `0` for anything else.
//! The adapter owns no state of its own; it translates bodies into session
//! manager and pipeline calls.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use pitlink_core::codec::{decode_signed_batch, CodecError};
use pitlink_core::crypto::DeviceKey;
use pitlink_core::packet::{EssentialsPacket, FullPacket, InnerVariant};
use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::{PublishPipeline, QueueClosed};
use crate::session::{seed_hex, ResetError, SessionManager};

/// Generous bound for a signed batch body; firmware batches are a few KB.
const MAX_BODY_SIZE: usize = 256 * 1024;

/// Shared state behind every handler.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub pipeline: Arc<PublishPipeline>,
    pub device_key: DeviceKey,
}

/// Builds the daemon's router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/session_reset_challenge",
            get(get_reset_challenge).post(post_reset_challenge),
        )
        .route("/packet/full", post(post_full_batch))
        .route("/packet/essentials", post(post_essentials_batch))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

async fn get_reset_challenge(State(state): State<Arc<AppState>>) -> String {
    info!("session reset challenge requested");
    format!("+CST_RESET_CHALLENGE {}", state.sessions.reset_challenge())
}

async fn post_reset_challenge(State(state): State<Arc<AppState>>, body: Bytes) -> String {
    match state.sessions.reset(&body) {
        Ok(outcome) => {
            info!(session_id = outcome.session_id, "session reset succeeded");
            format!("+CST_RESET_SUCC {}", seed_hex(outcome.seed))
        }
        Err(e @ ResetError::BadLength { .. }) => {
            warn!(error = %e, "session reset rejected");
            "+CST_RESET_FAIL 1".to_string()
        }
        Err(e) => {
            warn!(error = %e, "session reset rejected");
            "+CST_RESET_FAIL 0".to_string()
        }
    }
}

async fn post_full_batch(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, BatchError> {
    ingest_batch::<FullPacket>(&state, &body).await
}

async fn post_essentials_batch(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, BatchError> {
    ingest_batch::<EssentialsPacket>(&state, &body).await
}

async fn ingest_batch<T: InnerVariant>(
    state: &AppState,
    body: &[u8],
) -> Result<StatusCode, BatchError> {
    let batch = decode_signed_batch::<T>(body, &state.device_key)?;
    state.pipeline.submit(batch).await?;
    Ok(StatusCode::OK)
}

/// What a packet endpoint can fail with.
#[derive(Debug, Error)]
enum BatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Queue(#[from] QueueClosed),
}

impl IntoResponse for BatchError {
    fn into_response(self) -> Response {
        match self {
            Self::Codec(e) => {
                warn!(error = %e, "packet batch rejected");
                StatusCode::BAD_REQUEST.into_response()
            }
            Self::Queue(e) => {
                warn!(error = %e, "packet batch dropped during shutdown");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        }
    }
}
