//! `sessions.*` RPC handlers — read/rename access to the C3 registry. Live
//! (in-memory) session control lives on the chat WebSocket, not here.

use axum::extract::State;
use serde::Deserialize;

use crate::api::rpc::{NoInput, Rpc, RpcOk};
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::types::SessionRecord;

#[derive(Deserialize)]
pub struct WorkspaceNameInput {
    #[serde(rename = "workspaceName")]
    workspace_name: String,
}

pub async fn list(State(state): State<AppState>, Rpc(input): Rpc<WorkspaceNameInput>) -> RpcOk<Vec<SessionRecord>> {
    RpcOk(state.registry.get_sessions_for_workspace(&input.workspace_name).await)
}

pub async fn list_all(State(state): State<AppState>, Rpc(_): Rpc<NoInput>) -> RpcOk<Vec<SessionRecord>> {
    RpcOk(state.registry.list_all().await)
}

#[derive(Deserialize)]
pub struct OwnIdInput {
    #[serde(rename = "ownId")]
    own_id: String,
}

pub async fn get(State(state): State<AppState>, Rpc(input): Rpc<OwnIdInput>) -> AppResult<RpcOk<SessionRecord>> {
    state
        .registry
        .get(&input.own_id)
        .await
        .map(RpcOk)
        .ok_or_else(|| AppError::NotFound(format!("session {}", input.own_id)))
}

#[derive(Deserialize)]
pub struct RenameInput {
    #[serde(rename = "ownId")]
    own_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

pub async fn rename(State(state): State<AppState>, Rpc(input): Rpc<RenameInput>) -> AppResult<RpcOk<SessionRecord>> {
    Ok(RpcOk(state.registry.rename(&input.own_id, Some(input.display_name)).await?))
}

pub async fn clear_name(State(state): State<AppState>, Rpc(input): Rpc<OwnIdInput>) -> AppResult<RpcOk<SessionRecord>> {
    Ok(RpcOk(state.registry.rename(&input.own_id, None).await?))
}
