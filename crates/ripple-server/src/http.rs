//! HTTP control plane for call signaling and queue introspection.
//!
//! These routes drive the same state objects as the WebSocket edge, so a
//! call initiated here and a call initiated over a socket are
//! indistinguishable to the participants.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ripple_core::CallError;
use ripple_protocol::{CallSession, MediaKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Build the control-plane router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/calls", post(initiate_call))
        .route("/v1/calls/:call_id", get(call_status))
        .route("/v1/calls/:call_id/answer", post(answer_call))
        .route("/v1/calls/:call_id/decline", post(decline_call))
        .route("/v1/calls/:call_id/end", post(end_call))
        .route("/v1/calls/:call_id/candidates", post(relay_candidate))
        .route("/v1/users/:user_id/call", get(user_call_status))
        .route("/v1/users/:user_id/offline/stats", get(offline_stats))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn call_error_response(err: &CallError) -> Response {
    metrics::record_error("call");
    let status = match err {
        CallError::Busy(_) | CallError::InvalidPhase(_, _) => StatusCode::CONFLICT,
        CallError::UnknownCall(_) => StatusCode::NOT_FOUND,
        CallError::NotParticipant(_, _) | CallError::NotCallee(_) => StatusCode::FORBIDDEN,
        CallError::Unreachable => StatusCode::BAD_GATEWAY,
    };
    error_response(status, err.to_string())
}

#[derive(Debug, Deserialize)]
struct InitiateCallRequest {
    caller_id: String,
    callee_id: String,
    conversation_id: String,
    media_kind: MediaKind,
    offer_sdp: String,
}

async fn initiate_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiateCallRequest>,
) -> Response {
    match state.calls.initiate(
        &req.caller_id,
        &req.callee_id,
        &req.conversation_id,
        req.media_kind,
        req.offer_sdp,
    ) {
        Ok(session) => {
            metrics::record_call_started();
            metrics::set_active_calls(state.calls.active_count());
            (StatusCode::CREATED, Json(session)).into_response()
        }
        Err(e) => {
            warn!(caller = %req.caller_id, callee = %req.callee_id, error = %e, "Call initiation rejected");
            call_error_response(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnswerCallRequest {
    callee_id: String,
    answer_sdp: String,
}

async fn answer_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(req): Json<AnswerCallRequest>,
) -> Response {
    match state.calls.answer(&req.callee_id, &call_id, req.answer_sdp) {
        Ok(session) => Json(session).into_response(),
        Err(e) => call_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DeclineCallRequest {
    callee_id: String,
}

async fn decline_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(req): Json<DeclineCallRequest>,
) -> Response {
    let result = state.calls.decline(&req.callee_id, &call_id);
    metrics::set_active_calls(state.calls.active_count());
    match result {
        Ok(session) => Json(session).into_response(),
        Err(e) => call_error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct EndCallRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

async fn end_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    body: Option<Json<EndCallRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let result = state.calls.end(&call_id, req.user_id.as_deref(), req.reason);
    metrics::set_active_calls(state.calls.active_count());
    match result {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => call_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CandidateRequest {
    user_id: String,
    candidate: serde_json::Value,
}

async fn relay_candidate(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(req): Json<CandidateRequest>,
) -> Response {
    match state
        .calls
        .relay_ice_candidate(&call_id, &req.user_id, req.candidate)
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => call_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    user_id: String,
}

async fn call_status(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match state.calls.status(&call_id, &query.user_id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => call_error_response(&e),
    }
}

#[derive(Debug, Serialize)]
struct UserCallStatus {
    in_call: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    call: Option<CallSession>,
}

async fn user_call_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    let call = state.calls.status_for_user(&user_id);
    Json(UserCallStatus {
        in_call: call.is_some(),
        call,
    })
    .into_response()
}

async fn offline_stats(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    match state.relay.offline().stats_for(&user_id).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            metrics::record_error("offline_stats");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
