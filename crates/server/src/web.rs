use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::engine::EngineClient;
use crate::spy::{SpyError, SpyService};

/// Shared application state.
pub struct AppState {
    pub config: MonitorConfig,
    pub engine: Arc<EngineClient>,
    pub spy: Arc<SpyService>,
    pub started_at: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/spy/{call_id}", post(start_spy))
        .route("/spy/answer/{session_id}", post(spy_answer))
        .route("/calls", get(list_calls))
        .route("/calls/{call_id}", get(call_details))
        .route("/stats", get(engine_stats))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(Arc::clone(&state));

    // Serve the operator UI (configurable path)
    api.fallback_service(ServeDir::new(&state.config.server.web_root))
}

#[derive(Debug, Default, Deserialize)]
struct StartSpyRequest {
    #[serde(default)]
    from_tag: Option<String>,
    #[serde(default)]
    to_tag: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartSpyResponse {
    /// Field name is part of the browser contract.
    #[serde(rename = "spyID")]
    spy_id: Uuid,
    sdp: String,
    from_tag: String,
    to_tag: String,
}

#[derive(Debug, Deserialize)]
struct SpyAnswerRequest {
    sdp: String,
}

fn error_body(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// POST /spy/{call_id}
///
/// Create or join the spy source for a call and return the server's SDP
/// offer. Tags may be omitted or empty; the engine is queried then.
async fn start_spy(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    body: Option<Json<StartSpyRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    match state
        .spy
        .start_session(&call_id, request.from_tag, request.to_tag)
        .await
    {
        Ok(offer) => Json(StartSpyResponse {
            spy_id: offer.session_id,
            sdp: offer.sdp,
            from_tag: offer.from_tag,
            to_tag: offer.to_tag,
        })
        .into_response(),
        Err(err) => {
            tracing::error!(%call_id, "Failed to start spy session: {err}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// POST /spy/answer/{session_id}
///
/// Deliver the browser's SDP answer for a previously returned offer.
async fn spy_answer(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SpyAnswerRequest>,
) -> Response {
    match state.spy.handle_answer(session_id, request.sdp).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err @ SpyError::SessionNotFound) => {
            tracing::warn!(%session_id, "Answer for unknown spy session");
            error_body(StatusCode::NOT_FOUND, err)
        }
        Err(err @ SpyError::WebRtc(_)) => {
            tracing::warn!(%session_id, "Rejected browser answer: {err}");
            error_body(StatusCode::BAD_REQUEST, err)
        }
        Err(err) => {
            tracing::error!(%session_id, "Failed to apply answer: {err}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// GET /calls — active call ids from the engine.
async fn list_calls(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.list_calls().await {
        Ok(calls) => Json(json!({ "calls": calls })).into_response(),
        Err(err) => {
            tracing::error!("Engine list failed: {err}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// GET /calls/{call_id} — the engine's full view of one call.
async fn call_details(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Response {
    match state.engine.query_call(&call_id).await {
        Ok(details) => Json(details.to_json()).into_response(),
        Err(err) => {
            tracing::error!(%call_id, "Engine query failed: {err}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// GET /stats — engine-wide statistics tree.
async fn engine_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.statistics().await {
        Ok(stats) => Json(stats.to_json()).into_response(),
        Err(err) => {
            tracing::error!("Engine statistics failed: {err}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// GET /healthz
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "spy_sources": state.spy.source_count().await,
        "spy_sessions": state.spy.session_count().await,
    }))
    .into_response()
}

/// GET /metrics — Prometheus text format.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let m = &state.spy.metrics;
    let body = format!(
        "# HELP rtpscope_spy_sessions_active Connected spectator sessions\n\
         # TYPE rtpscope_spy_sessions_active gauge\n\
         rtpscope_spy_sessions_active {}\n\
         # HELP rtpscope_spy_sessions_total Spectator sessions ever created\n\
         # TYPE rtpscope_spy_sessions_total counter\n\
         rtpscope_spy_sessions_total {}\n\
         # HELP rtpscope_spy_sources_active Calls currently subscribed on the engine\n\
         # TYPE rtpscope_spy_sources_active gauge\n\
         rtpscope_spy_sources_active {}\n\
         # HELP rtpscope_spy_sources_total Spy sources ever created\n\
         # TYPE rtpscope_spy_sources_total counter\n\
         rtpscope_spy_sources_total {}\n\
         # HELP rtpscope_uptime_seconds Seconds since process start\n\
         # TYPE rtpscope_uptime_seconds counter\n\
         rtpscope_uptime_seconds {}\n",
        m.sessions_active.load(Ordering::Relaxed),
        m.sessions_total.load(Ordering::Relaxed),
        m.sources_active.load(Ordering::Relaxed),
        m.sources_total.load(Ordering::Relaxed),
        state.started_at.elapsed().as_secs(),
    );
    ([("content-type", "text/plain; version=0.0.4")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spy_response_uses_browser_field_names() {
        let response = StartSpyResponse {
            spy_id: Uuid::nil(),
            sdp: "v=0".to_string(),
            from_tag: "a".to_string(),
            to_tag: "b".to_string(),
        };
        let body = serde_json::to_value(&response).unwrap();
        assert!(body.get("spyID").is_some());
        assert!(body.get("spy_id").is_none());
        assert_eq!(body["from_tag"], "a");
        assert_eq!(body["to_tag"], "b");
    }

    #[test]
    fn spy_request_tags_are_optional() {
        let empty: StartSpyRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.from_tag.is_none());
        assert!(empty.to_tag.is_none());

        let full: StartSpyRequest =
            serde_json::from_str(r#"{"from_tag":"a","to_tag":""}"#).unwrap();
        assert_eq!(full.from_tag.as_deref(), Some("a"));
        assert_eq!(full.to_tag.as_deref(), Some(""));
    }
}
