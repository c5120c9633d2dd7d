//! C3 — Session Registry: persistent mapping from system-assigned session
//! ids to agent-native session ids. Same locked-file persistence idiom as
//! the State Store; a distinct lock file so workspace and session writes
//! never contend with each other.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::types::{AgentKind, SessionRecord};

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    sessions: BTreeMap<String, SessionRecord>,
}

async fn with_locked_file<T>(lock_path: &Path, f: impl FnOnce() -> AppResult<T>) -> AppResult<T> {
    std::fs::create_dir_all(lock_path.parent().unwrap_or_else(|| Path::new(".")))?;
    let lock_file = std::fs::OpenOptions::new().create(true).write(true).open(lock_path)?;

    let mut delay = std::time::Duration::from_millis(100);
    let mut attempts = 0;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => break,
            Err(_) if attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_secs(1));
            }
            Err(e) => return Err(AppError::Internal(format!("failed to acquire registry lock: {e}"))),
        }
    }

    let result = f();
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

pub struct NewSessionSpec {
    pub workspace_name: String,
    pub agent_kind: AgentKind,
    pub project_path: Option<String>,
}

pub struct SessionRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    cache: RwLock<BTreeMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new(path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            path,
            lock_path,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn load(&self) -> AppResult<()> {
        let path = self.path.clone();
        let map = with_locked_file(&self.lock_path, move || read_registry_file(&path)).await?;
        *self.cache.write().await = map;
        Ok(())
    }

    async fn persist(&self, map: &BTreeMap<String, SessionRecord>) -> AppResult<()> {
        let path = self.path.clone();
        let map = map.clone();
        with_locked_file(&self.lock_path, move || write_registry_file(&path, &map)).await
    }

    /// Generates a fresh `ownId` and timestamps; overwrites by `ownId`
    /// (never collides in practice since ids are freshly generated, but the
    /// write is still serialized through the cache lock so N concurrent
    /// calls produce exactly N records — property 2).
    pub async fn create_session(&self, spec: NewSessionSpec) -> AppResult<SessionRecord> {
        let now = chrono::Utc::now();
        let record = SessionRecord {
            own_id: Uuid::new_v4().to_string(),
            workspace_name: spec.workspace_name,
            agent_kind: spec.agent_kind,
            agent_native_id: None,
            project_path: spec.project_path,
            display_name: None,
            created_at: now,
            last_activity: now,
        };

        let mut cache = self.cache.write().await;
        cache.insert(record.own_id.clone(), record.clone());
        self.persist(&cache).await?;
        Ok(record)
    }

    /// Updates `agentNativeId` and bumps `lastActivity`. Returns `None` if
    /// `ownId` is unknown.
    pub async fn link_agent_session(&self, own_id: &str, native_id: &str) -> AppResult<Option<SessionRecord>> {
        let mut cache = self.cache.write().await;
        let Some(record) = cache.get_mut(own_id) else {
            return Ok(None);
        };
        record.agent_native_id = Some(native_id.to_string());
        record.last_activity = chrono::Utc::now();
        let updated = record.clone();
        self.persist(&cache).await?;
        Ok(Some(updated))
    }

    /// Idempotent import: if `(workspace, agentKind, agentNativeId)` already
    /// maps to a record, that record is returned unchanged — no duplication
    /// (property 3).
    pub async fn import_external_session(&self, spec: NewSessionSpec, native_id: String) -> AppResult<SessionRecord> {
        let mut cache = self.cache.write().await;

        if let Some(existing) = cache.values().find(|r| {
            r.workspace_name == spec.workspace_name
                && r.agent_kind == spec.agent_kind
                && r.agent_native_id.as_deref() == Some(native_id.as_str())
        }) {
            return Ok(existing.clone());
        }

        let now = chrono::Utc::now();
        let record = SessionRecord {
            own_id: Uuid::new_v4().to_string(),
            workspace_name: spec.workspace_name,
            agent_kind: spec.agent_kind,
            agent_native_id: Some(native_id),
            project_path: spec.project_path,
            display_name: None,
            created_at: now,
            last_activity: now,
        };
        cache.insert(record.own_id.clone(), record.clone());
        self.persist(&cache).await?;
        Ok(record)
    }

    pub async fn get(&self, own_id: &str) -> Option<SessionRecord> {
        self.cache.read().await.get(own_id).cloned()
    }

    /// Sorted by `lastActivity` descending.
    pub async fn get_sessions_for_workspace(&self, workspace_name: &str) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .cache
            .read()
            .await
            .values()
            .filter(|r| r.workspace_name == workspace_name)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        records
    }

    pub async fn list_all(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.cache.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        records
    }

    pub async fn rename(&self, own_id: &str, display_name: Option<String>) -> AppResult<SessionRecord> {
        let mut cache = self.cache.write().await;
        let record = cache
            .get_mut(own_id)
            .ok_or_else(|| AppError::NotFound(format!("session {own_id}")))?;
        record.display_name = display_name;
        let updated = record.clone();
        self.persist(&cache).await?;
        Ok(updated)
    }
}

fn read_registry_file(path: &Path) -> AppResult<BTreeMap<String, SessionRecord>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let file: RegistryFile = serde_json::from_str(&content)
                .map_err(|e| AppError::Internal(format!("corrupt registry file {}: {e}", path.display())))?;
            Ok(file.sessions)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(AppError::from(e)),
    }
}

fn write_registry_file(path: &Path, map: &BTreeMap<String, SessionRecord>) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = RegistryFile { version: 1, sessions: map.clone() };
    let content = serde_json::to_string_pretty(&file)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(tmp: &tempfile::TempDir) -> SessionRegistry {
        SessionRegistry::new(tmp.path().join("session-registry.json"), tmp.path().join(".registry.lock"))
    }

    #[tokio::test]
    async fn concurrent_creates_produce_one_record_each() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(registry(&tmp));
        registry.load().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .create_session(NewSessionSpec {
                        workspace_name: "w".to_string(),
                        agent_kind: AgentKind::Claude,
                        project_path: None,
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let sessions = registry.get_sessions_for_workspace("w").await;
        assert_eq!(sessions.len(), 10);
    }

    #[tokio::test]
    async fn import_external_session_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(&tmp);
        registry.load().await.unwrap();

        let spec = || NewSessionSpec {
            workspace_name: "w".to_string(),
            agent_kind: AgentKind::Claude,
            project_path: None,
        };

        let first = registry
            .import_external_session(spec(), "native-1".to_string())
            .await
            .unwrap();
        let second = registry
            .import_external_session(spec(), "native-1".to_string())
            .await
            .unwrap();

        assert_eq!(first.own_id, second.own_id);
        assert_eq!(registry.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn link_agent_session_updates_native_id_and_activity() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(&tmp);
        registry.load().await.unwrap();

        let record = registry
            .create_session(NewSessionSpec {
                workspace_name: "w".to_string(),
                agent_kind: AgentKind::Claude,
                project_path: None,
            })
            .await
            .unwrap();

        let updated = registry
            .link_agent_session(&record.own_id, "native-id")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.agent_native_id.as_deref(), Some("native-id"));
    }

    #[tokio::test]
    async fn link_agent_session_on_unknown_id_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(&tmp);
        registry.load().await.unwrap();
        assert!(registry.link_agent_session("missing", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_sessions_for_workspace_sorted_by_last_activity_desc() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(&tmp);
        registry.load().await.unwrap();

        let a = registry
            .create_session(NewSessionSpec {
                workspace_name: "w".to_string(),
                agent_kind: AgentKind::Claude,
                project_path: None,
            })
            .await
            .unwrap();
        let b = registry
            .create_session(NewSessionSpec {
                workspace_name: "w".to_string(),
                agent_kind: AgentKind::Opencode,
                project_path: None,
            })
            .await
            .unwrap();

        registry.link_agent_session(&a.own_id, "native-a").await.unwrap();

        let sessions = registry.get_sessions_for_workspace("w").await;
        assert_eq!(sessions[0].own_id, a.own_id);
        assert_eq!(sessions[1].own_id, b.own_id);
    }
}
