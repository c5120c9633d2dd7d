//! C6 — Workspace Manager: orchestrates the Container Driver, State Store,
//! and Sync Engine into workspace lifecycle operations. Owns the in-memory
//! set of active PTY connections per workspace so `stop`/`delete` can ask
//! the PTY Multiplexer to close them first.

pub mod ports;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::AgentConfig;
use crate::container::{ContainerDriver, ContainerSpec, ExecOptions};
use crate::error::{AppError, AppResult};
use crate::sync::Engine as SyncEngine;
use crate::types::{Workspace, WorkspaceStatus};

const WORKSPACE_IMAGE: &str = "perry/workspace:latest";
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct CreateOptions {
    pub clone_url: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Callback the PTY Multiplexer registers so the Workspace Manager can ask
/// it to drop every connection for a workspace before stop/delete proceeds.
/// An explicit channel, not a trait object hierarchy, per the
/// no-callback-hierarchies note — but since there's exactly one
/// subscriber (C7) and the call is fire-and-forget, a plain closure
/// suffices here without inventing an event bus.
pub type CloseConnectionsHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Fired after a container stop/delete so C8 can dispose every live session
/// bound to the workspace (clients observe this as a 1001 close).
pub type DisposeSessionsHook = Arc<dyn Fn(String) + Send + Sync>;

pub struct Manager {
    state: Arc<crate::state::StateStore>,
    driver: Arc<ContainerDriver>,
    sync_engine: Arc<SyncEngine>,
    agent_config: RwLock<AgentConfig>,
    close_connections: RwLock<Option<CloseConnectionsHook>>,
    dispose_sessions: RwLock<Option<DisposeSessionsHook>>,
}

impl Manager {
    pub fn new(
        state: Arc<crate::state::StateStore>,
        driver: Arc<ContainerDriver>,
        sync_engine: Arc<SyncEngine>,
        agent_config: AgentConfig,
    ) -> Self {
        Self {
            state,
            driver,
            sync_engine,
            agent_config: RwLock::new(agent_config),
            close_connections: RwLock::new(None),
            dispose_sessions: RwLock::new(None),
        }
    }

    pub async fn set_close_connections_hook(&self, hook: CloseConnectionsHook) {
        *self.close_connections.write().await = Some(hook);
    }

    pub async fn set_dispose_sessions_hook(&self, hook: DisposeSessionsHook) {
        *self.dispose_sessions.write().await = Some(hook);
    }

    async fn close_pty_connections(&self, name: &str) {
        if let Some(hook) = self.close_connections.read().await.as_ref() {
            hook(name);
        }
        if let Some(hook) = self.dispose_sessions.read().await.as_ref() {
            hook(name.to_string());
        }
    }

    /// Snapshot of the daemon's agent config, re-read by every sync/provision
    /// call so a `config.refreshCredentials` update takes effect on the next
    /// sync without restarting the daemon.
    pub async fn agent_config(&self) -> AgentConfig {
        self.agent_config.read().await.clone()
    }

    pub async fn set_agent_config(&self, agent_config: AgentConfig) {
        *self.agent_config.write().await = agent_config;
    }

    pub async fn list(&self) -> Vec<Workspace> {
        self.state.list().await
    }

    pub async fn get(&self, name: &str) -> AppResult<Workspace> {
        self.state.get(name).await.ok_or_else(|| AppError::NotFound(format!("workspace {name}")))
    }

    pub async fn create(&self, name: &str, opts: CreateOptions) -> AppResult<Workspace> {
        validate_name(name)?;
        if self.state.get(name).await.is_some() {
            return Err(AppError::AlreadyExists(format!("workspace {name}")));
        }

        let agent_config = self.agent_config().await;
        let ssh_port = ports::allocate_ssh_port(&self.state, &agent_config.ssh).await?;
        let mut port_map = BTreeMap::new();
        port_map.insert(ssh_port, 22);

        let mut ports_record = BTreeMap::new();
        ports_record.insert("ssh".to_string(), ssh_port);

        let mut workspace = Workspace {
            name: name.to_string(),
            container_id: None,
            status: WorkspaceStatus::Creating,
            created_at: chrono::Utc::now(),
            clone_url: opts.clone_url.clone(),
            display_name: None,
            ports: ports_record,
            last_used: chrono::Utc::now(),
            error_message: None,
        };
        self.state.upsert(workspace.clone()).await?;

        match self.provision(&mut workspace, &opts).await {
            Ok(()) => {
                workspace.status = WorkspaceStatus::Running;
                workspace.error_message = None;
                self.state.upsert(workspace.clone()).await?;
                Ok(workspace)
            }
            Err(e) => {
                self.state.set_status(name, WorkspaceStatus::Error, Some(e.to_string())).await?;
                Err(e)
            }
        }
    }

    async fn provision(&self, workspace: &mut Workspace, opts: &CreateOptions) -> AppResult<()> {
        let mut labels = BTreeMap::new();
        labels.insert("perry.workspace".to_string(), workspace.name.clone());

        let mut port_map = BTreeMap::new();
        if let Some(ssh_port) = workspace.ssh_port() {
            port_map.insert(ssh_port, 22);
        }

        let spec = ContainerSpec {
            name: workspace.container_name(),
            image: WORKSPACE_IMAGE.to_string(),
            hostname: workspace.name.clone(),
            env: opts.env.clone(),
            port_map,
            labels,
        };

        let container_id = self.driver.create(&spec).await?;
        workspace.container_id = Some(container_id);
        self.driver.start(&workspace.container_name()).await?;

        if let Some(clone_url) = &opts.clone_url {
            self.driver
                .exec(
                    &workspace.container_name(),
                    &["git".to_string(), "clone".to_string(), clone_url.clone(), "/workspace/repo".to_string()],
                    ExecOptions::default(),
                )
                .await?;
        }

        let agent_config = self.agent_config().await;
        self.sync_engine
            .sync(&self.driver, &workspace.container_name(), &agent_config)
            .await?;

        self.run_post_start_scripts(&workspace.container_name()).await?;

        Ok(())
    }

    async fn run_post_start_scripts(&self, container_name: &str) -> AppResult<()> {
        let agent_config = self.agent_config().await;
        let Some(post_start) = &agent_config.scripts.post_start else {
            return Ok(());
        };

        for path in post_start.paths() {
            let path = Path::new(&path);
            let scripts = if path.is_dir() {
                let mut entries: Vec<_> = std::fs::read_dir(path)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("sh"))
                    .collect();
                entries.sort();
                entries
            } else {
                vec![path.to_path_buf()]
            };

            for script in scripts {
                let result = self
                    .driver
                    .exec(
                        container_name,
                        &["bash".to_string(), "-s".to_string()],
                        ExecOptions {
                            stdin: Some(std::fs::read(&script)?),
                            ..Default::default()
                        },
                    )
                    .await;

                match result {
                    Ok(r) if r.exit_code == Some(0) => {}
                    Ok(r) => {
                        let message = format!(
                            "post-start script {} exited {:?}: {}",
                            script.display(),
                            r.exit_code,
                            String::from_utf8_lossy(&r.stderr)
                        );
                        if agent_config.scripts.fail_on_error {
                            return Err(AppError::PreconditionFailed(message));
                        }
                        tracing::warn!("{message}");
                    }
                    Err(e) if agent_config.scripts.fail_on_error => return Err(e),
                    Err(e) => tracing::warn!(error = %e, script = %script.display(), "post-start script failed"),
                }
            }
        }
        Ok(())
    }

    /// No-op if already running; otherwise starts and re-syncs. The ssh
    /// port never changes across a start — it's read back from the
    /// persisted record, never reallocated.
    pub async fn start(&self, name: &str) -> AppResult<Workspace> {
        let workspace = self.get(name).await?;
        if workspace.status == WorkspaceStatus::Running {
            return Ok(workspace);
        }

        self.driver.start(&workspace.container_name()).await?;
        let agent_config = self.agent_config().await;
        self.sync_engine
            .sync(&self.driver, &workspace.container_name(), &agent_config)
            .await?;
        self.run_post_start_scripts(&workspace.container_name()).await?;

        self.state.set_status(name, WorkspaceStatus::Running, None).await?;
        self.get(name).await
    }

    pub async fn stop(&self, name: &str) -> AppResult<()> {
        let workspace = self.get(name).await?;
        self.close_pty_connections(name).await;

        match self.driver.stop(&workspace.container_name(), STOP_TIMEOUT).await {
            Ok(()) => {}
            Err(AppError::ContainerError { stderr, .. }) if stderr.contains("No such container") => {}
            Err(e) => return Err(e),
        }

        self.state.set_status(name, WorkspaceStatus::Stopped, None).await
    }

    pub async fn delete(&self, name: &str) -> AppResult<()> {
        let workspace = self.get(name).await?;
        self.close_pty_connections(name).await;
        self.driver.remove(&workspace.container_name(), true).await?;
        self.state.delete(name).await
    }

    pub async fn sync(&self, name: &str) -> AppResult<()> {
        let workspace = self.get(name).await?;
        if workspace.status != WorkspaceStatus::Running {
            return Err(AppError::PreconditionFailed(format!("workspace {name} is not running")));
        }
        let agent_config = self.agent_config().await;
        self.sync_engine
            .sync(&self.driver, &workspace.container_name(), &agent_config)
            .await
    }

    pub async fn sync_all(&self) -> crate::sync::SyncAllResult {
        let workspaces: Vec<(String, String)> = self
            .state
            .list()
            .await
            .into_iter()
            .filter(|w| w.status == WorkspaceStatus::Running)
            .map(|w| (w.container_name(), w.name))
            .collect();
        let agent_config = self.agent_config().await;
        self.sync_engine.sync_all(&self.driver, &workspaces, &agent_config).await
    }

    /// Clones a repository into an already-running workspace (distinct from
    /// the clone-at-create-time path in `provision`, which seeds an empty
    /// container). `target` defaults to `/workspace/repo`.
    pub async fn clone_repo(&self, name: &str, url: &str, target: Option<&str>) -> AppResult<()> {
        let workspace = self.get(name).await?;
        if workspace.status != WorkspaceStatus::Running {
            return Err(AppError::PreconditionFailed(format!("workspace {name} is not running")));
        }
        let target = target.unwrap_or("/workspace/repo");
        self.driver
            .exec(
                &workspace.container_name(),
                &["git".to_string(), "clone".to_string(), url.to_string(), target.to_string()],
                ExecOptions::default(),
            )
            .await?;
        self.state.touch(name).await
    }

    pub async fn get_logs(&self, name: &str, tail: usize) -> AppResult<String> {
        let workspace = self.get(name).await?;
        self.driver.logs(&workspace.container_name(), tail).await
    }

    pub async fn get_port_forwards(&self, name: &str) -> AppResult<BTreeMap<String, u16>> {
        Ok(self.get(name).await?.ports)
    }

    /// Persists the new forward list as authoritative. Live re-mapping is
    /// not supported by the container CLI, so this recreates the container
    /// with the new port map while preserving name/labels/state.
    pub async fn set_port_forwards(&self, name: &str, ports: BTreeMap<String, u16>) -> AppResult<Workspace> {
        let mut workspace = self.get(name).await?;
        let was_running = workspace.status == WorkspaceStatus::Running;

        if was_running {
            self.driver.stop(&workspace.container_name(), STOP_TIMEOUT).await.ok();
        }
        self.driver.remove(&workspace.container_name(), true).await.ok();

        let mut labels = BTreeMap::new();
        labels.insert("perry.workspace".to_string(), workspace.name.clone());
        let mut port_map = BTreeMap::new();
        for (label, host_port) in &ports {
            let container_port = if label == "ssh" { 22 } else { *host_port };
            port_map.insert(*host_port, container_port);
        }

        let spec = ContainerSpec {
            name: workspace.container_name(),
            image: WORKSPACE_IMAGE.to_string(),
            hostname: workspace.name.clone(),
            env: BTreeMap::new(),
            port_map,
            labels,
        };
        let container_id = self.driver.create(&spec).await?;
        workspace.container_id = Some(container_id);
        workspace.ports = ports;

        if was_running {
            self.driver.start(&workspace.container_name()).await?;
        }

        self.state.upsert(workspace.clone()).await?;
        Ok(workspace)
    }
}

fn validate_name(name: &str) -> AppResult<()> {
    // `^[a-z0-9][a-z0-9-]{0,31}$`
    let valid = !name.is_empty()
        && name.len() <= 32
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(format!("invalid workspace name: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_uppercase_and_leading_hyphen() {
        assert!(validate_name("My-Workspace").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("valid-name-1").is_ok());
    }

    #[tokio::test]
    async fn create_fails_already_exists_for_duplicate_name() {
        let tmp = tempfile::tempdir().unwrap();
        let state = Arc::new(crate::state::StateStore::new(
            tmp.path().join("state.json"),
            tmp.path().join(".state.lock"),
        ));
        state.load().await.unwrap();

        let mut ports = BTreeMap::new();
        ports.insert("ssh".to_string(), 2200);
        state
            .upsert(Workspace {
                name: "dup".to_string(),
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

        let driver = Arc::new(ContainerDriver::new("true"));
        let sync_engine = Arc::new(SyncEngine::new(Vec::new()));
        let manager = Manager::new(state, driver, sync_engine, AgentConfig::default());

        let result = manager.create("dup", CreateOptions::default()).await;
        assert!(matches!(result, Err(AppError::AlreadyExists(_))));
    }
}
