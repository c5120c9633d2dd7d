//! C7 — PTY Multiplexer: bridges a WebSocket to a container-exec'd shell.
//! Byte pump shape follows `ProcessExecStream`'s stdout/stderr fan-out, with
//! a resize control-frame probe layered on top of the raw passthrough.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::container::{ContainerDriver, ExecEvent, ExecOptions};
use crate::error::{AppError, AppResult};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_SHELL: &str = "/bin/bash";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Resize { cols: u16, rows: u16 },
}

struct Connection {
    id: u64,
    kill: tokio::sync::mpsc::UnboundedSender<()>,
}

/// Per-workspace index of live terminal connections, so `stop`/`delete` can
/// close them all before the container goes away. Concurrent terminals for
/// the same workspace are independent (per spec), so one connection closing
/// must only drop its own entry, never its siblings'.
#[derive(Default, Clone)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Vec<Connection>>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, workspace: &str, kill: tokio::sync::mpsc::UnboundedSender<()>) -> u64 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner
            .lock()
            .await
            .entry(workspace.to_string())
            .or_default()
            .push(Connection { id, kill });
        id
    }

    async fn deregister(&self, workspace: &str, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(conns) = inner.get_mut(workspace) {
            conns.retain(|c| c.id != id);
            if conns.is_empty() {
                inner.remove(workspace);
            }
        }
    }

    pub async fn close_connections_for_workspace(&self, workspace: &str) {
        if let Some(conns) = self.inner.lock().await.remove(workspace) {
            for conn in conns {
                let _ = conn.kill.send(());
            }
        }
    }
}

/// Drives one terminal session end to end: spawns the shell, pumps bytes
/// in both directions, and returns once the socket or the child closes.
pub async fn handle_terminal(
    mut socket: WebSocket,
    driver: Arc<ContainerDriver>,
    registry: Registry,
    container_name: String,
    workspace_name: String,
    user: Option<String>,
) -> AppResult<()> {
    let argv = vec![DEFAULT_SHELL.to_string()];
    let opts = ExecOptions {
        user,
        workdir: None,
        env: [
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("COLUMNS".to_string(), DEFAULT_COLS.to_string()),
            ("LINES".to_string(), DEFAULT_ROWS.to_string()),
        ]
        .into_iter()
        .collect(),
        stdin: None,
        tty: true,
        timeout: None,
    };

    let mut stream = driver.exec_stream(&container_name, &argv, opts).await?;

    let (kill_tx, mut kill_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let connection_id = registry.register(&workspace_name, kill_tx).await;

    let result = loop {
        tokio::select! {
            event = stream.next_event() => {
                match event {
                    Some(ExecEvent::Stdout(bytes)) | Some(ExecEvent::Stderr(bytes)) => {
                        if socket.send(WsMessage::Binary(bytes.into())).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(ExecEvent::Exit { code }) => {
                        let _ = socket
                            .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                                code: 1000,
                                reason: format!("Process exited with code {code}").into(),
                            })))
                            .await;
                        break Ok(());
                    }
                    None => break Ok(()),
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if stream.write_stdin(&bytes).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.starts_with('{') {
                            if let Ok(ControlFrame::Resize { cols, rows }) = serde_json::from_str::<ControlFrame>(&text) {
                                resize(&driver, &container_name, cols, rows).await;
                                continue;
                            }
                        }
                        if stream.write_stdin(text.as_bytes()).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(AppError::ConnectionFailed(e.to_string())),
                }
            }
            _ = kill_rx.recv() => {
                break Ok(());
            }
        }
    };

    let _ = stream.kill().await;
    registry.deregister(&workspace_name, connection_id).await;
    result
}

async fn resize(driver: &ContainerDriver, container_name: &str, cols: u16, rows: u16) {
    let argv = vec!["stty".to_string(), "cols".to_string(), cols.to_string(), "rows".to_string(), rows.to_string()];
    if let Err(e) = driver.exec(container_name, &argv, ExecOptions::default()).await {
        tracing::debug!(error = %e, "terminal resize probe failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frame_parses_from_leading_brace_json() {
        let raw = r#"{"type":"resize","cols":120,"rows":40}"#;
        let frame: ControlFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ControlFrame::Resize { cols, rows } => {
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
        }
    }

    #[tokio::test]
    async fn registry_close_connections_sends_kill_signal() {
        let registry = Registry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register("ws-a", tx).await;
        registry.close_connections_for_workspace("ws-a").await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn deregistering_one_connection_leaves_its_sibling_closable() {
        let registry = Registry::new();
        let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        let id1 = registry.register("ws-a", tx1).await;
        registry.register("ws-a", tx2).await;

        registry.deregister("ws-a", id1).await;
        registry.close_connections_for_workspace("ws-a").await;
        assert!(rx2.recv().await.is_some());
    }
}
