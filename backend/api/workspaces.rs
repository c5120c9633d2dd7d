//! `workspaces.*` RPC handlers — a thin typed layer over C6.

use std::collections::BTreeMap;

use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::api::rpc::{NoInput, Rpc, RpcOk};
use crate::api::AppState;
use crate::error::AppResult;
use crate::types::Workspace;
use crate::workspace::CreateOptions;

pub async fn list(State(state): State<AppState>, Rpc(_): Rpc<NoInput>) -> RpcOk<Vec<Workspace>> {
    RpcOk(state.workspaces.list().await)
}

#[derive(Deserialize)]
pub struct NameInput {
    name: String,
}

pub async fn get(State(state): State<AppState>, Rpc(input): Rpc<NameInput>) -> AppResult<RpcOk<Workspace>> {
    Ok(RpcOk(state.workspaces.get(&input.name).await?))
}

#[derive(Deserialize)]
pub struct CreateInput {
    name: String,
    #[serde(default)]
    clone: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

pub async fn create(State(state): State<AppState>, Rpc(input): Rpc<CreateInput>) -> AppResult<RpcOk<Workspace>> {
    let opts = CreateOptions { clone_url: input.clone, env: input.env };
    Ok(RpcOk(state.workspaces.create(&input.name, opts).await?))
}

#[derive(Serialize)]
pub struct Empty {}

pub async fn delete(State(state): State<AppState>, Rpc(input): Rpc<NameInput>) -> AppResult<RpcOk<Empty>> {
    state.workspaces.delete(&input.name).await?;
    Ok(RpcOk(Empty {}))
}

pub async fn start(State(state): State<AppState>, Rpc(input): Rpc<NameInput>) -> AppResult<RpcOk<Workspace>> {
    Ok(RpcOk(state.workspaces.start(&input.name).await?))
}

pub async fn stop(State(state): State<AppState>, Rpc(input): Rpc<NameInput>) -> AppResult<RpcOk<Empty>> {
    state.workspaces.stop(&input.name).await?;
    Ok(RpcOk(Empty {}))
}

#[derive(Deserialize)]
pub struct LogsInput {
    name: String,
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    200
}

#[derive(Serialize)]
pub struct LogsOutput {
    logs: String,
}

pub async fn logs(State(state): State<AppState>, Rpc(input): Rpc<LogsInput>) -> AppResult<RpcOk<LogsOutput>> {
    let logs = state.workspaces.get_logs(&input.name, input.tail).await?;
    Ok(RpcOk(LogsOutput { logs }))
}

pub async fn sync(State(state): State<AppState>, Rpc(input): Rpc<NameInput>) -> AppResult<RpcOk<Empty>> {
    state.workspaces.sync(&input.name).await?;
    Ok(RpcOk(Empty {}))
}

pub async fn sync_all(State(state): State<AppState>, Rpc(_): Rpc<NoInput>) -> RpcOk<crate::sync::SyncAllResult> {
    RpcOk(state.workspaces.sync_all().await)
}

#[derive(Serialize)]
pub struct PortForwardsOutput {
    ports: BTreeMap<String, u16>,
}

pub async fn get_port_forwards(
    State(state): State<AppState>,
    Rpc(input): Rpc<NameInput>,
) -> AppResult<RpcOk<PortForwardsOutput>> {
    let ports = state.workspaces.get_port_forwards(&input.name).await?;
    Ok(RpcOk(PortForwardsOutput { ports }))
}

#[derive(Deserialize)]
pub struct SetPortForwardsInput {
    name: String,
    ports: BTreeMap<String, u16>,
}

pub async fn set_port_forwards(
    State(state): State<AppState>,
    Rpc(input): Rpc<SetPortForwardsInput>,
) -> AppResult<RpcOk<Workspace>> {
    Ok(RpcOk(state.workspaces.set_port_forwards(&input.name, input.ports).await?))
}

#[derive(Deserialize)]
pub struct CloneInput {
    name: String,
    url: String,
    #[serde(default)]
    target: Option<String>,
}

pub async fn clone_repo(State(state): State<AppState>, Rpc(input): Rpc<CloneInput>) -> AppResult<RpcOk<Empty>> {
    state.workspaces.clone_repo(&input.name, &input.url, input.target.as_deref()).await?;
    Ok(RpcOk(Empty {}))
}
