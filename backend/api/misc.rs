//! `info`, `host.*`, and `config.*` RPC handlers — small operational reads
//! plus the supplemented credential-refresh procedure (see DESIGN.md).

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::api::rpc::{NoInput, Rpc, RpcOk};
use crate::api::AppState;
use crate::error::AppResult;
use crate::types::AgentKind;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Serialize)]
pub struct InfoOutput {
    version: String,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
}

pub async fn info(State(state): State<AppState>, Rpc(_): Rpc<NoInput>) -> RpcOk<InfoOutput> {
    RpcOk(InfoOutput {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
pub struct HostInfoOutput {
    #[serde(rename = "containerRuntimeVersion")]
    container_runtime_version: String,
    #[serde(rename = "daemonVersion")]
    daemon_version: String,
    #[serde(rename = "configDir")]
    config_dir: String,
}

pub async fn host_info(State(state): State<AppState>, Rpc(_): Rpc<NoInput>) -> AppResult<RpcOk<HostInfoOutput>> {
    let container_runtime_version = state.driver.version().await.unwrap_or_else(|e| format!("unavailable: {e}"));
    Ok(RpcOk(HostInfoOutput {
        container_runtime_version,
        daemon_version: env!("CARGO_PKG_VERSION").to_string(),
        config_dir: state.config_dir.display().to_string(),
    }))
}

/// Auth/RBAC issuance is handled outside this daemon; kept as a no-op so the
/// `host.*` group is complete rather than partially implemented.
pub async fn host_update_access(Rpc(_): Rpc<NoInput>) -> RpcOk<serde_json::Value> {
    RpcOk(json!({ "ok": true }))
}

/// Re-reads `agent-config.json`'s credential fields from host disk and
/// disposes any live session for an agent kind whose credential changed, so
/// the next connect spawns a fresh adapter carrying the refreshed token. No
/// OAuth flow runs here, only a re-read of whatever credential file already
/// exists on disk (see DESIGN.md).
#[derive(Serialize)]
pub struct RefreshCredentialsOutput {
    ok: bool,
    #[serde(rename = "sessionsDisposed")]
    sessions_disposed: usize,
}

pub async fn refresh_credentials(
    State(state): State<AppState>,
    Rpc(_): Rpc<NoInput>,
) -> AppResult<RpcOk<RefreshCredentialsOutput>> {
    let agent_config_path = state.config_dir.join("agent-config.json");
    let fresh = crate::config::AgentConfig::load(&agent_config_path)
        .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;

    let previous = state.workspaces.agent_config().await;
    let mut disposed = 0;
    for (kind, changed) in [
        (AgentKind::Claude, previous.agents.claude_code != fresh.agents.claude_code),
        (AgentKind::Opencode, previous.agents.opencode != fresh.agents.opencode),
        (AgentKind::Codex, previous.agents.codex != fresh.agents.codex),
    ] {
        if changed {
            disposed += state.sessions.dispose_sessions_for_agent_kind(kind).await;
        }
    }

    state.workspaces.set_agent_config(fresh).await;
    Ok(RpcOk(RefreshCredentialsOutput { ok: true, sessions_disposed: disposed }))
}
