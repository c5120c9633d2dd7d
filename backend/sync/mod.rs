//! C5 — Sync Engine: materializes env vars, files, and generated config
//! into a running container, driven by one or more agent-kind-specific
//! *providers*. Modeled on a `SandboxProvider` plurality: one small trait,
//! one struct per backend (here, per agent kind) — no inheritance
//! hierarchy, per the adapter-polymorphism note.

pub mod providers;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AgentConfig;
use crate::container::ContainerDriver;
use crate::error::AppResult;
use crate::types::AgentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Credential,
    Preference,
}

impl FileCategory {
    pub fn mode(&self) -> u32 {
        match self {
            FileCategory::Credential => 0o600,
            FileCategory::Preference => 0o644,
        }
    }
}

pub struct HostFile {
    pub host_path: PathBuf,
    pub container_path: String,
    pub required: bool,
    pub category: FileCategory,
}

pub struct HostDir {
    pub host_path: PathBuf,
    pub container_path: String,
}

pub struct GeneratedFile {
    pub container_path: String,
    pub content: Vec<u8>,
    pub category: FileCategory,
}

/// Everything a provider's `generate()` step needs: the daemon's own
/// config plus a way to read back what's already on the container (sync
/// must merge, not overwrite).
pub struct SyncContext<'a> {
    pub agent_config: &'a AgentConfig,
    pub driver: &'a ContainerDriver,
    pub container_name: &'a str,
}

#[async_trait]
pub trait SyncProvider: Send + Sync {
    fn agent_kind(&self) -> AgentKind;
    fn required_dirs(&self) -> Vec<String>;
    fn host_files(&self) -> Vec<HostFile>;
    fn host_dirs(&self) -> Vec<HostDir>;
    async fn generate(&self, ctx: &SyncContext<'_>) -> AppResult<Vec<GeneratedFile>>;
}

#[derive(Debug, Serialize)]
pub struct SyncOneResult {
    pub workspace_name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncAllResult {
    pub synced: usize,
    pub failed: usize,
    pub results: Vec<SyncOneResult>,
}

pub struct Engine {
    providers: Vec<Box<dyn SyncProvider>>,
}

impl Engine {
    pub fn new(providers: Vec<Box<dyn SyncProvider>>) -> Self {
        Self { providers }
    }

    /// Runs every configured provider's sync against one container.
    /// Contract: idempotent — re-running converges to the same state
    /// regardless of what was there before.
    pub async fn sync(&self, driver: &ContainerDriver, container_name: &str, agent_config: &AgentConfig) -> AppResult<()> {
        for provider in &self.providers {
            self.sync_one_provider(provider.as_ref(), driver, container_name, agent_config).await?;
        }
        Ok(())
    }

    async fn sync_one_provider(
        &self,
        provider: &dyn SyncProvider,
        driver: &ContainerDriver,
        container_name: &str,
        agent_config: &AgentConfig,
    ) -> AppResult<()> {
        for dir in provider.required_dirs() {
            // `dir` commonly starts with `~`; exec argv bypasses the shell,
            // so tilde expansion has to happen inside the container's own
            // shell rather than in `mkdir`'s argument parsing.
            driver
                .exec(
                    container_name,
                    &["sh".to_string(), "-c".to_string(), format!("mkdir -p {dir}")],
                    crate::container::ExecOptions::default(),
                )
                .await?;
        }

        for file in provider.host_files() {
            match copy_host_file(driver, container_name, &file).await {
                Ok(()) => {}
                Err(e) if !file.required => {
                    tracing::debug!(path = %file.host_path.display(), error = %e, "optional sync file missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        for dir in provider.host_dirs() {
            copy_host_dir(driver, container_name, &dir).await?;
        }

        let ctx = SyncContext { agent_config, driver, container_name };
        for generated in provider.generate(&ctx).await? {
            driver
                .copy_in(container_name, &generated.content, &generated.container_path, Some(generated.category.mode()))
                .await?;
        }

        Ok(())
    }

    /// Applies `sync` to every given (container_name, workspace_name) pair;
    /// one failure does not abort the others.
    pub async fn sync_all(
        &self,
        driver: &ContainerDriver,
        workspaces: &[(String, String)],
        agent_config: &AgentConfig,
    ) -> SyncAllResult {
        let mut results = Vec::new();
        let mut synced = 0;
        let mut failed = 0;

        for (container_name, workspace_name) in workspaces {
            match self.sync(driver, container_name, agent_config).await {
                Ok(()) => {
                    synced += 1;
                    results.push(SyncOneResult { workspace_name: workspace_name.clone(), ok: true, error: None });
                }
                Err(e) => {
                    failed += 1;
                    results.push(SyncOneResult {
                        workspace_name: workspace_name.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        SyncAllResult { synced, failed, results }
    }
}

async fn copy_host_file(driver: &ContainerDriver, container_name: &str, file: &HostFile) -> AppResult<()> {
    let bytes = std::fs::read(&file.host_path)?;
    driver
        .copy_in(container_name, &bytes, &file.container_path, Some(file.category.mode()))
        .await
}

async fn copy_host_dir(driver: &ContainerDriver, container_name: &str, dir: &HostDir) -> AppResult<()> {
    if !dir.host_path.exists() {
        return Ok(());
    }
    copy_dir_recursive(driver, container_name, &dir.host_path, &dir.host_path, &dir.container_path).await
}

fn copy_dir_recursive<'a>(
    driver: &'a ContainerDriver,
    container_name: &'a str,
    root: &'a Path,
    current: &'a Path,
    container_root: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = AppResult<()>> + 'a>> {
    Box::pin(async move {
        for entry in std::fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let container_path = format!("{container_root}/{}", relative.to_string_lossy());

            if path.is_dir() {
                copy_dir_recursive(driver, container_name, root, &path, container_root).await?;
            } else {
                let bytes = std::fs::read(&path)?;
                driver.copy_in(container_name, &bytes, &container_path, None).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::providers::ClaudeProvider;

    #[test]
    fn file_category_modes_match_spec() {
        assert_eq!(FileCategory::Credential.mode(), 0o600);
        assert_eq!(FileCategory::Preference.mode(), 0o644);
    }

    #[test]
    fn claude_provider_declares_skills_dir() {
        let provider = ClaudeProvider;
        assert!(provider.required_dirs().contains(&"~/.claude/skills".to_string()));
    }
}
