//! `GET /rpc/terminal/{name}` — upgrades to C7's interactive shell.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use hyper::StatusCode;

use crate::api::AppState;
use crate::types::WorkspaceStatus;

pub async fn upgrade(State(state): State<AppState>, Path(name): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let workspace = match state.workspaces.get(&name).await {
        Ok(w) => w,
        Err(_) => return (StatusCode::NOT_FOUND, "workspace not found").into_response(),
    };
    if workspace.status != WorkspaceStatus::Running {
        return (StatusCode::NOT_FOUND, "workspace not running").into_response();
    }

    let driver = state.driver.clone();
    let registry = state.pty_registry.clone();
    let container_name = workspace.container_name();
    let user = Some(state.ssh_user.clone());

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = crate::pty::handle_terminal(socket, driver, registry, container_name, name, user).await {
            tracing::debug!(error = %e, "terminal session ended with error");
        }
    })
}
