//! Host port allocation for workspace ssh forwards (§4.6 "Port allocation").

use std::collections::HashSet;
use std::net::TcpListener;

use crate::config::SshConfig;
use crate::error::{AppError, AppResult};
use crate::state::StateStore;

/// Picks the lowest unused port in `ssh.port_range_start..=ssh.port_range_end`,
/// verifying the OS will actually let us bind it (a port can be free in the
/// persisted state but still held by some other process).
pub async fn allocate_ssh_port(state: &StateStore, ssh: &SshConfig) -> AppResult<u16> {
    let taken: HashSet<u16> = state.allocated_ssh_ports().await.into_iter().collect();

    for port in ssh.port_range_start..=ssh.port_range_end {
        if taken.contains(&port) {
            continue;
        }
        if bind_probe(port) {
            return Ok(port);
        }
    }

    Err(AppError::InvalidArgument("NO_PORTS_AVAILABLE".to_string()))
}

fn bind_probe(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Workspace, WorkspaceStatus};
    use std::collections::BTreeMap;

    fn ssh_range(start: u16, end: u16) -> SshConfig {
        SshConfig { port_range_start: start, port_range_end: end, user: "workspace".to_string() }
    }

    #[tokio::test]
    async fn allocates_lowest_unused_port() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateStore::new(tmp.path().join("state.json"), tmp.path().join(".state.lock"));
        state.load().await.unwrap();

        let mut ports = BTreeMap::new();
        ports.insert("ssh".to_string(), 2200);
        state
            .upsert(Workspace {
                name: "a".to_string(),
                container_id: None,
                status: WorkspaceStatus::Running,
                created_at: chrono::Utc::now(),
                clone_url: None,
                display_name: None,
                ports,
                last_used: chrono::Utc::now(),
                error_message: None,
            })
            .await
            .unwrap();

        let port = allocate_ssh_port(&state, &ssh_range(2200, 2299)).await.unwrap();
        assert_eq!(port, 2201);
    }

    #[tokio::test]
    async fn exhausted_range_returns_no_ports_available() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateStore::new(tmp.path().join("state.json"), tmp.path().join(".state.lock"));
        state.load().await.unwrap();

        let mut ports = BTreeMap::new();
        ports.insert("ssh".to_string(), 2200);
        state
            .upsert(Workspace {
                name: "a".to_string(),
                container_id: None,
                status: WorkspaceStatus::Running,
                created_at: chrono::Utc::now(),
                clone_url: None,
                display_name: None,
                ports,
                last_used: chrono::Utc::now(),
                error_message: None,
            })
            .await
            .unwrap();

        let result = allocate_ssh_port(&state, &ssh_range(2200, 2200)).await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }
}
