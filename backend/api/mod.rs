//! C9 — RPC/HTTP Surface: typed RPC handlers over `POST /rpc/<procedure>`
//! plus the two WebSocket upgrade routes. Bearer-token auth (when
//! configured) runs as an Axum middleware layer so a missing/incorrect
//! token is rejected before any handler runs, per §4.9.

pub mod chat;
mod misc;
pub mod rpc;
mod sessions;
mod terminal;
mod workspaces;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hyper::{header, StatusCode};
use tower_http::cors::{Any, CorsLayer};

use crate::container::ContainerDriver;
use crate::{pty, registry, session, workspace};

#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<workspace::Manager>,
    pub sessions: Arc<session::Manager>,
    pub registry: Arc<registry::SessionRegistry>,
    pub driver: Arc<ContainerDriver>,
    pub pty_registry: pty::Registry,
    pub bearer_token: Option<String>,
    pub config_dir: PathBuf,
    pub ssh_user: String,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", axum::routing::get(misc::health))
        .route("/rpc/workspaces.list", post(workspaces::list))
        .route("/rpc/workspaces.get", post(workspaces::get))
        .route("/rpc/workspaces.create", post(workspaces::create))
        .route("/rpc/workspaces.delete", post(workspaces::delete))
        .route("/rpc/workspaces.start", post(workspaces::start))
        .route("/rpc/workspaces.stop", post(workspaces::stop))
        .route("/rpc/workspaces.logs", post(workspaces::logs))
        .route("/rpc/workspaces.sync", post(workspaces::sync))
        .route("/rpc/workspaces.syncAll", post(workspaces::sync_all))
        .route("/rpc/workspaces.getPortForwards", post(workspaces::get_port_forwards))
        .route("/rpc/workspaces.setPortForwards", post(workspaces::set_port_forwards))
        .route("/rpc/workspaces.clone", post(workspaces::clone_repo))
        .route("/rpc/sessions.list", post(sessions::list))
        .route("/rpc/sessions.listAll", post(sessions::list_all))
        .route("/rpc/sessions.get", post(sessions::get))
        .route("/rpc/sessions.rename", post(sessions::rename))
        .route("/rpc/sessions.clearName", post(sessions::clear_name))
        .route("/rpc/info", post(misc::info))
        .route("/rpc/host.info", post(misc::host_info))
        .route("/rpc/host.updateAccess", post(misc::host_update_access))
        .route("/rpc/config.refreshCredentials", post(misc::refresh_credentials))
        .route("/rpc/terminal/{name}", axum::routing::get(terminal::upgrade))
        .route("/rpc/chat/{name}", axum::routing::get(chat::upgrade))
        .route("/rpc/opencode/{name}", axum::routing::get(chat::upgrade))
        .fallback(not_found)
        .with_state(state.clone())
        .layer(cors)
        .layer(axum::middleware::from_fn_with_state(state, auth_layer))
        .layer(axum::middleware::from_fn(crate::telemetry::enrich_current_span))
}

/// Rejects requests lacking a matching `Authorization: Bearer` header
/// *before* any handler runs, when a token is configured. `/health` is
/// exempt so orchestrators can probe liveness without credentials.
async fn auth_layer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.bearer_token else {
        return next.run(req).await;
    };
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
    }
}

async fn not_found(req: Request) -> impl IntoResponse {
    tracing::warn!(path = %req.uri(), "unhandled rpc path");
    (StatusCode::NOT_FOUND, "not found")
}
