//! `GET /rpc/chat/{name}` and `/rpc/opencode/{name}` — upgrades to an agent
//! chat session (C8). Both routes share this handler; the agent kind rides
//! in the client's `connect` frame rather than the path, so the same wire
//! protocol serves Claude, OpenCode, and Codex sessions alike.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::session::{JoinOutcome, JoinSessionRequest, SessionEvent};
use crate::types::{AgentKind, LiveSessionStatus, Message, WorkspaceStatus};

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Connect {
        #[serde(rename = "workspaceName")]
        workspace_name: String,
        #[serde(rename = "agentKind")]
        agent_kind: AgentKind,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default, rename = "projectPath")]
        project_path: Option<String>,
        #[serde(default, rename = "resumeFromId")]
        resume_from_id: Option<u64>,
    },
    Message {
        content: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Interrupt,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ServerControlFrame {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "session_started")]
    SessionStarted(SessionFrameBody),
    #[serde(rename = "session_joined")]
    SessionJoined(SessionFrameBody),
}

#[derive(Serialize)]
struct SessionFrameBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    status: LiveSessionStatus,
    #[serde(skip_serializing_if = "Option::is_none", rename = "agentNativeId")]
    agent_native_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

pub async fn upgrade(State(state): State<AppState>, Path(name): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_chat(socket, state, name))
}

async fn send_json(socket: &mut WebSocket, value: &impl Serialize) -> bool {
    let Ok(text) = serde_json::to_string(value) else { return false };
    socket.send(WsMessage::Text(text.into())).await.is_ok()
}

/// Waits for the client's `connect` handshake frame, ignoring any other
/// frame type (a client shouldn't send one first, but this keeps the
/// handshake robust rather than tearing down the socket over it).
async fn await_connect(socket: &mut WebSocket) -> Option<(String, AgentKind, Option<String>, Option<String>, Option<String>, Option<u64>)> {
    loop {
        match socket.recv().await {
            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Connect {
                    workspace_name,
                    agent_kind,
                    session_id,
                    model,
                    project_path,
                    resume_from_id,
                }) => return Some((workspace_name, agent_kind, session_id, model, project_path, resume_from_id)),
                _ => continue,
            },
            Some(Ok(WsMessage::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        }
    }
}

async fn handle_chat(mut socket: WebSocket, state: AppState, path_workspace: String) {
    if !send_json(&mut socket, &ServerControlFrame::Connected).await {
        return;
    }

    let Some((workspace_name, agent_kind, session_id, model, project_path, resume_from_id)) = await_connect(&mut socket).await else {
        return;
    };
    let workspace_name = if workspace_name.is_empty() { path_workspace } else { workspace_name };

    let workspace = match state.workspaces.get(&workspace_name).await {
        Ok(w) if w.status == WorkspaceStatus::Running => w,
        _ => {
            let _ = socket
                .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1011,
                    reason: "workspace is not running".into(),
                })))
                .await;
            return;
        }
    };

    let req = JoinSessionRequest {
        workspace_name: workspace_name.clone(),
        agent_kind,
        session_id,
        model,
        project_path,
        resume_from_id,
    };

    let outcome = match state.sessions.join(req, &workspace.container_name()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = socket
                .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1011,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (session, replay, is_joined) = match outcome {
        JoinOutcome::Started { session } => (session, Vec::new(), false),
        JoinOutcome::Joined { session, replay } => (session, replay, true),
    };

    let warning = if state
        .sessions
        .has_other_live_session(&workspace_name, agent_kind, &session.own_id)
        .await
    {
        Some(format!("another live {agent_kind} session is already attached to workspace {workspace_name}"))
    } else {
        None
    };

    let body = SessionFrameBody {
        session_id: session.own_id.clone(),
        model: session.model().await,
        status: session.status().await,
        agent_native_id: session.native_id().await,
        warning,
    };
    let hello = if is_joined {
        ServerControlFrame::SessionJoined(body)
    } else {
        ServerControlFrame::SessionStarted(body)
    };
    if !send_json(&mut socket, &hello).await {
        return;
    }

    let last_replayed_id = replay.iter().map(Message::id).max().unwrap_or(0);
    for message in replay {
        if !send_json(&mut socket, &message).await {
            return;
        }
    }

    let mut events = session.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::Message(msg)) => {
                        if msg.id() <= last_replayed_id {
                            continue;
                        }
                        if !send_json(&mut socket, &msg).await {
                            break;
                        }
                    }
                    Ok(SessionEvent::Error(text)) => {
                        let id = session.next_id().await;
                        let err = Message::Error { id, content: text, timestamp: chrono::Utc::now() };
                        if !send_json(&mut socket, &err).await {
                            break;
                        }
                    }
                    Ok(SessionEvent::StatusChange(LiveSessionStatus::Exited)) => {
                        let _ = socket
                            .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                                code: 1001,
                                reason: "workspace or session terminated".into(),
                            })))
                            .await;
                        break;
                    }
                    Ok(SessionEvent::StatusChange(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Slow client: drop it per §4.8's bounded-queue policy (code 1009).
                        let _ = socket
                            .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                                code: 1009,
                                reason: "client fell behind".into(),
                            })))
                            .await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Message { content, .. }) => {
                                if let Err(e) = session.send_message(&content).await {
                                    tracing::warn!(error = %e, "failed to forward message to agent adapter");
                                }
                            }
                            Ok(ClientFrame::Interrupt) => {
                                if let Err(e) = state.sessions.interrupt(&session.own_id).await {
                                    tracing::warn!(error = %e, "interrupt failed");
                                }
                            }
                            Ok(ClientFrame::Connect { .. }) | Err(_) => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if session.client_disconnected() == 0 {
        state.sessions.schedule_disconnect_disposal(session.own_id.clone());
    }
}
