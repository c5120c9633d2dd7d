//! C2 — State Store: a JSON-on-disk map of workspaces guarded by an
//! advisory file lock with retry. Modeled on `FileAgentRepository`'s
//! atomic-write idiom, with a real cross-process lock added since multiple
//! daemon processes can race on the same config dir.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};
use crate::types::{Workspace, WorkspaceStatus};

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    workspaces: BTreeMap<String, Workspace>,
}

/// Retries an advisory lock acquisition with bounded exponential backoff:
/// up to 5 attempts, 100ms -> 1s.
async fn with_locked_file<T>(
    lock_path: &Path,
    f: impl FnOnce() -> AppResult<T>,
) -> AppResult<T> {
    std::fs::create_dir_all(lock_path.parent().unwrap_or_else(|| Path::new(".")))?;
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)?;

    let mut delay = Duration::from_millis(100);
    let mut attempts = 0;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => break,
            Err(_) if attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(1));
            }
            Err(e) => return Err(AppError::Internal(format!("failed to acquire state lock: {e}"))),
        }
    }

    let result = f();
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

/// In-memory cache over the on-disk `state.json`, single owning task per
/// process (the mailbox pattern the design notes recommend) plus the file
/// lock for cross-process safety against a second daemon instance.
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    cache: RwLock<BTreeMap<String, Workspace>>,
}

impl StateStore {
    pub fn new(path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            path,
            lock_path,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load the on-disk map into the in-memory cache. Call once at startup.
    pub async fn load(&self) -> AppResult<()> {
        let path = self.path.clone();
        let map = with_locked_file(&self.lock_path, move || read_state_file(&path)).await?;
        *self.cache.write().await = map;
        Ok(())
    }

    pub async fn list(&self) -> Vec<Workspace> {
        self.cache.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<Workspace> {
        self.cache.read().await.get(name).cloned()
    }

    async fn persist(&self, map: &BTreeMap<String, Workspace>) -> AppResult<()> {
        let path = self.path.clone();
        let map = map.clone();
        with_locked_file(&self.lock_path, move || write_state_file(&path, &map)).await
    }

    pub async fn upsert(&self, workspace: Workspace) -> AppResult<()> {
        let mut cache = self.cache.write().await;
        cache.insert(workspace.name.clone(), workspace);
        self.persist(&cache).await
    }

    pub async fn delete(&self, name: &str) -> AppResult<()> {
        let mut cache = self.cache.write().await;
        cache.remove(name);
        self.persist(&cache).await
    }

    pub async fn set_status(&self, name: &str, status: WorkspaceStatus, error_message: Option<String>) -> AppResult<()> {
        let mut cache = self.cache.write().await;
        let ws = cache
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("workspace {name}")))?;
        ws.status = status;
        ws.error_message = error_message;
        self.persist(&cache).await
    }

    pub async fn touch(&self, name: &str) -> AppResult<()> {
        let mut cache = self.cache.write().await;
        let ws = cache
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("workspace {name}")))?;
        ws.last_used = chrono::Utc::now();
        self.persist(&cache).await
    }

    pub async fn set_display_name(&self, name: &str, display_name: Option<String>) -> AppResult<()> {
        let mut cache = self.cache.write().await;
        let ws = cache
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("workspace {name}")))?;
        ws.display_name = display_name;
        self.persist(&cache).await
    }

    pub async fn set_port_forwards(&self, name: &str, ports: BTreeMap<String, u16>) -> AppResult<()> {
        let mut cache = self.cache.write().await;
        let ws = cache
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("workspace {name}")))?;
        ws.ports = ports;
        self.persist(&cache).await
    }

    /// All ssh ports currently allocated, for the port allocator (property 1:
    /// `ports.ssh` is unique across the map).
    pub async fn allocated_ssh_ports(&self) -> Vec<u16> {
        self.cache
            .read()
            .await
            .values()
            .filter_map(|w| w.ssh_port())
            .collect()
    }
}

fn read_state_file(path: &Path) -> AppResult<BTreeMap<String, Workspace>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let file: StateFile = serde_json::from_str(&content)
                .map_err(|e| AppError::Internal(format!("corrupt state file {}: {e}", path.display())))?;
            Ok(file.workspaces)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(AppError::from(e)),
    }
}

/// Atomic write via temp file + rename, the same idiom `FileAgentRepository`
/// and `save_sessions` use. The on-disk file is always a valid JSON object
/// with a `workspaces` key, even when empty.
fn write_state_file(path: &Path, map: &BTreeMap<String, Workspace>) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = StateFile { workspaces: map.clone() };
    let content = serde_json::to_string_pretty(&file)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkspaceStatus;

    fn sample(name: &str, ssh_port: u16) -> Workspace {
        let mut ports = BTreeMap::new();
        ports.insert("ssh".to_string(), ssh_port);
        Workspace {
            name: name.to_string(),
            container_id: None,
            status: WorkspaceStatus::Creating,
            created_at: chrono::Utc::now(),
            clone_url: None,
            display_name: None,
            ports,
            last_used: chrono::Utc::now(),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state.json"), tmp.path().join(".state.lock"));
        store.load().await.unwrap();

        store.upsert(sample("a", 2200)).await.unwrap();
        let fetched = store.get("a").await.unwrap();
        assert_eq!(fetched.ssh_port(), Some(2200));
    }

    #[tokio::test]
    async fn empty_state_file_is_valid_json_object_with_workspaces_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let store = StateStore::new(path.clone(), tmp.path().join(".state.lock"));
        store.load().await.unwrap();
        store.upsert(sample("a", 2200)).await.unwrap();
        store.delete("a").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(value.get("workspaces").unwrap().is_object());
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let lock_path = tmp.path().join(".state.lock");

        let store = StateStore::new(path.clone(), lock_path.clone());
        store.load().await.unwrap();
        store.upsert(sample("a", 2201)).await.unwrap();

        let store2 = StateStore::new(path, lock_path);
        store2.load().await.unwrap();
        assert_eq!(store2.get("a").await.unwrap().ssh_port(), Some(2201));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state.json"), tmp.path().join(".state.lock"));
        store.load().await.unwrap();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn set_status_on_unknown_workspace_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state.json"), tmp.path().join(".state.lock"));
        store.load().await.unwrap();
        let result = store.set_status("missing", WorkspaceStatus::Running, None).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
