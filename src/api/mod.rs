// Host console HTTP API (session control, match control, spectating, metrics).

pub mod ws;

use std::sync::Arc;

use axum::{
    extract::{Json, MatchedPath, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::config::Config;
use crate::engine::server::{Entrant, MatchServer, WinHandler};
use crate::metrics;
use crate::session::{Session, SessionError, SessionState};

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub session: Session,
    pub match_server: Arc<MatchServer>,
    pub config: Arc<Config>,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Session
        .route("/api/session", get(session_status))
        .route(
            "/api/session/connections/{name}/source",
            get(connection_source),
        )
        .route("/api/session/collect", post(start_collecting))
        // Match
        .route("/api/match/start", post(start_match))
        .route("/api/match/ranking", get(match_ranking))
        // WebSocket
        .route("/ws/match", get(ws::ws_match))
        // Metrics
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(req).await;
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    response
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "codearena" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Session handlers ──────────────────────────────────────────────────

async fn session_status(State(state): State<AppState>) -> impl IntoResponse {
    let connections: Vec<_> = state
        .session
        .connections()
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "alive": c.alive,
                "submitted": c.source.is_some(),
                "submitted_at": c.submitted_at,
            })
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "state": state.session.state(),
            "address": state.session.local_addr().to_string(),
            "connections": connections,
        })),
    )
}

async fn connection_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(conn) = state.session.connection(&name) else {
        return json_error(StatusCode::NOT_FOUND, &format!("No connection named {name}"))
            .into_response();
    };
    match conn.source {
        Some(source) => (
            StatusCode::OK,
            Json(json!({
                "name": conn.name,
                "source": source,
                "submitted_at": conn.submitted_at,
            })),
        )
            .into_response(),
        None => json_error(StatusCode::NOT_FOUND, &format!("{name} has not submitted"))
            .into_response(),
    }
}

async fn start_collecting(State(state): State<AppState>) -> impl IntoResponse {
    match state.session.transition(SessionState::Collecting) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "state": SessionState::Collecting,
                "connections": state.session.connections().len(),
            })),
        )
            .into_response(),
        Err(e) => json_error(StatusCode::CONFLICT, &e.to_string()).into_response(),
    }
}

// ── Match handlers ────────────────────────────────────────────────────

async fn start_match(State(state): State<AppState>) -> impl IntoResponse {
    if state.session.state() != SessionState::Collecting {
        return json_error(
            StatusCode::CONFLICT,
            "The session must be collecting before a match can start",
        )
        .into_response();
    }
    // Claim the server first so a busy server never costs the submissions.
    let slot = match state.match_server.reserve() {
        Ok(slot) => slot,
        Err(e) => return json_error(StatusCode::CONFLICT, &e.to_string()).into_response(),
    };

    let submissions = match state.session.close() {
        Ok(subs) => subs,
        Err(e @ SessionError::InvalidTransition { .. }) => {
            return json_error(StatusCode::CONFLICT, &e.to_string()).into_response()
        }
        Err(e) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response()
        }
    };
    let names: Vec<String> = submissions.iter().map(|s| s.name.clone()).collect();
    let entrants: Vec<Entrant> = submissions.into_iter().map(Entrant::from).collect();

    let on_win: WinHandler = Box::new(|ranking| {
        tracing::info!(standings = ?ranking.standings, "Final ranking");
    });
    slot.launch(entrants, state.config.display, Some(on_win));

    (
        StatusCode::OK,
        Json(json!({
            "status": "running",
            "entrants": names,
            "message": "Match started. Connect to /ws/match for live frames."
        })),
    )
        .into_response()
}

async fn match_ranking(State(state): State<AppState>) -> impl IntoResponse {
    let ranking = state.match_server.ranking();
    (
        StatusCode::OK,
        Json(json!({
            "running": state.match_server.is_running(),
            "winner": ranking.as_ref().and_then(|r| r.winner()),
            "standings": ranking.as_ref().map(|r| &r.standings),
        })),
    )
}
