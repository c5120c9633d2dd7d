//! Per-agent-kind sync providers (§4.5): one per coding agent, each
//! declaring the host files/dirs it needs mirrored and any config it
//! generates. Generated-file merge logic reads back whatever the container
//! already has so sync never clobbers container-side edits.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::container::ExecOptions;
use crate::error::AppResult;
use crate::types::AgentKind;

use super::{FileCategory, GeneratedFile, HostDir, HostFile, SyncContext, SyncProvider};

fn home(path: &str) -> std::path::PathBuf {
    dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from(".")).join(path)
}

/// Reads a JSON file from the container via `cat`, tolerating a missing or
/// malformed file (sync must converge even on a pristine container).
async fn read_container_json(ctx: &SyncContext<'_>, container_path: &str) -> Value {
    let result = ctx
        .driver
        .exec(
            ctx.container_name,
            &["sh".to_string(), "-c".to_string(), format!("cat {container_path}")],
            ExecOptions::default(),
        )
        .await;
    match result {
        Ok(exec_result) if exec_result.exit_code == Some(0) => {
            serde_json::from_slice(&exec_result.stdout).unwrap_or_else(|_| json!({}))
        }
        _ => json!({}),
    }
}

/// Reads a JSON file from the host, tolerating a missing or malformed file
/// the same way `read_container_json` does for the container side.
fn read_host_json(path: &std::path::Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .unwrap_or_else(|| json!({}))
}

/// Model resolution per spec §4.5: user choice -> host's own config -> default.
fn resolve_opencode_model(user_choice: Option<&str>, host_value: Option<&str>) -> String {
    user_choice.or(host_value).unwrap_or("opencode/grok-code").to_string()
}

fn merge_mcp_maps(maps: &[Value]) -> Map<String, Value> {
    let mut merged = Map::new();
    for map in maps {
        if let Some(obj) = map.as_object() {
            for (k, v) in obj {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    merged
}

fn user_mcp_servers_as_claude(config: &crate::config::AgentConfig) -> Map<String, Value> {
    let mut out = Map::new();
    for server in &config.mcp_servers {
        match server {
            crate::config::McpServerConfig::Local { id, enabled, command, args, env } => {
                if !enabled {
                    continue;
                }
                out.insert(
                    id.clone(),
                    json!({ "type": "stdio", "command": command, "args": args, "env": env }),
                );
            }
            crate::config::McpServerConfig::Remote { id, enabled, url, headers, .. } => {
                if !enabled {
                    continue;
                }
                out.insert(id.clone(), json!({ "type": "http", "url": url, "headers": headers }));
            }
        }
    }
    out
}

fn skill_files(config: &crate::config::AgentConfig, agent_kind: AgentKind) -> Vec<GeneratedFile> {
    config
        .skills
        .iter()
        .filter(|s| s.enabled && s.applies_to.iter().any(|k| k == agent_kind.as_str()))
        .map(|s| GeneratedFile {
            container_path: format!("~/.claude/skills/{}/SKILL.md", s.id),
            content: s.content.clone().into_bytes(),
            category: FileCategory::Preference,
        })
        .collect()
}

pub struct ClaudeProvider;

#[async_trait]
impl SyncProvider for ClaudeProvider {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn required_dirs(&self) -> Vec<String> {
        vec!["~/.claude".to_string(), "~/.claude/skills".to_string()]
    }

    fn host_files(&self) -> Vec<HostFile> {
        vec![
            HostFile {
                host_path: home(".claude/.credentials.json"),
                container_path: "~/.claude/.credentials.json".to_string(),
                required: false,
                category: FileCategory::Credential,
            },
            HostFile {
                host_path: home(".claude/settings.json"),
                container_path: "~/.claude/settings.json".to_string(),
                required: false,
                category: FileCategory::Preference,
            },
            HostFile {
                host_path: home(".claude/CLAUDE.md"),
                container_path: "~/.claude/CLAUDE.md".to_string(),
                required: false,
                category: FileCategory::Preference,
            },
        ]
    }

    fn host_dirs(&self) -> Vec<HostDir> {
        vec![HostDir { host_path: home(".claude/agents"), container_path: "~/.claude/agents".to_string() }]
    }

    async fn generate(&self, ctx: &SyncContext<'_>) -> AppResult<Vec<GeneratedFile>> {
        let container_json = read_container_json(ctx, "~/.claude.json").await;
        let host_json = read_host_json(&home(".claude.json"));

        let container_mcp = container_json.get("mcpServers").cloned().unwrap_or_else(|| json!({}));
        let host_mcp = host_json.get("mcpServers").cloned().unwrap_or_else(|| json!({}));
        let user_mcp = Value::Object(user_mcp_servers_as_claude(ctx.agent_config));

        let merged_mcp = merge_mcp_maps(&[container_mcp, host_mcp, user_mcp]);

        let mut merged = match container_json {
            Value::Object(obj) => obj,
            _ => Map::new(),
        };
        if let Value::Object(host_obj) = host_json {
            for (k, v) in host_obj {
                merged.entry(k).or_insert(v);
            }
        }
        merged.insert("hasCompletedOnboarding".to_string(), json!(true));
        merged.insert("mcpServers".to_string(), Value::Object(merged_mcp));

        let content = serde_json::to_vec_pretty(&Value::Object(merged))?;

        let mut files = vec![GeneratedFile {
            container_path: "~/.claude.json".to_string(),
            content,
            category: FileCategory::Preference,
        }];
        files.extend(skill_files(ctx.agent_config, self.agent_kind()));
        Ok(files)
    }
}

pub struct OpenCodeProvider;

#[async_trait]
impl SyncProvider for OpenCodeProvider {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Opencode
    }

    fn required_dirs(&self) -> Vec<String> {
        vec!["~/.config/opencode".to_string(), "~/.claude/skills".to_string()]
    }

    fn host_files(&self) -> Vec<HostFile> {
        Vec::new()
    }

    fn host_dirs(&self) -> Vec<HostDir> {
        Vec::new()
    }

    async fn generate(&self, ctx: &SyncContext<'_>) -> AppResult<Vec<GeneratedFile>> {
        let Some(opencode) = &ctx.agent_config.agents.opencode else {
            // No provider API key configured — nothing to generate.
            return Ok(skill_files(ctx.agent_config, self.agent_kind()));
        };
        let Some(api_key) = &opencode.zen_token else {
            return Ok(skill_files(ctx.agent_config, self.agent_kind()));
        };

        let host_json = read_host_json(&home(".config/opencode/opencode.json"));
        let host_model = host_json.get("model").and_then(Value::as_str);
        let model = resolve_opencode_model(opencode.model.as_deref(), host_model);

        let mut mcp = Map::new();
        for server in &ctx.agent_config.mcp_servers {
            match server {
                crate::config::McpServerConfig::Remote { id, enabled, url, headers, oauth } => {
                    if !enabled {
                        continue;
                    }
                    mcp.insert(id.clone(), json!({ "type": "remote", "url": url, "headers": headers, "oauth": oauth }));
                }
                crate::config::McpServerConfig::Local { id, enabled, command, args, env } => {
                    if !enabled {
                        continue;
                    }
                    let mut command_vec = vec![command.clone()];
                    command_vec.extend(args.clone());
                    mcp.insert(id.clone(), json!({ "type": "local", "command": command_vec, "environment": env }));
                }
            }
        }

        let content = serde_json::to_vec_pretty(&json!({
            "provider": { "opencode": { "options": { "apiKey": api_key } } },
            "model": model,
            "mcp": mcp,
        }))?;

        let mut files = vec![GeneratedFile {
            container_path: "~/.config/opencode/opencode.json".to_string(),
            content,
            category: FileCategory::Preference,
        }];
        files.extend(skill_files(ctx.agent_config, self.agent_kind()));
        Ok(files)
    }
}

/// Follows the Claude provider's template, per spec §4.5 ("Codex —
/// analogous; details follow the above template").
pub struct CodexProvider;

#[async_trait]
impl SyncProvider for CodexProvider {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn required_dirs(&self) -> Vec<String> {
        vec!["~/.codex".to_string(), "~/.claude/skills".to_string()]
    }

    fn host_files(&self) -> Vec<HostFile> {
        vec![HostFile {
            host_path: home(".codex/auth.json"),
            container_path: "~/.codex/auth.json".to_string(),
            required: false,
            category: FileCategory::Credential,
        }]
    }

    fn host_dirs(&self) -> Vec<HostDir> {
        Vec::new()
    }

    async fn generate(&self, ctx: &SyncContext<'_>) -> AppResult<Vec<GeneratedFile>> {
        let container_json = read_container_json(ctx, "~/.codex/config.json").await;
        let mut merged = match container_json {
            Value::Object(obj) => obj,
            _ => Map::new(),
        };
        if let Some(codex) = &ctx.agent_config.agents.codex {
            if let Some(model) = &codex.model {
                merged.insert("model".to_string(), json!(model));
            }
        }

        let content = serde_json::to_vec_pretty(&Value::Object(merged))?;
        let mut files = vec![GeneratedFile {
            container_path: "~/.codex/config.json".to_string(),
            content,
            category: FileCategory::Preference,
        }];
        files.extend(skill_files(ctx.agent_config, self.agent_kind()));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_mcp_maps_last_writer_wins_for_same_key() {
        let a = json!({ "x": { "type": "stdio" } });
        let b = json!({ "x": { "type": "http" } });
        let merged = merge_mcp_maps(&[a, b]);
        assert_eq!(merged["x"]["type"], "http");
    }

    #[test]
    fn opencode_model_prefers_user_choice_over_host_and_default() {
        assert_eq!(resolve_opencode_model(Some("user/pick"), Some("host/pick")), "user/pick");
    }

    #[test]
    fn opencode_model_falls_back_to_host_value() {
        assert_eq!(resolve_opencode_model(None, Some("host/pick")), "host/pick");
    }

    #[test]
    fn opencode_model_falls_back_to_default_when_nothing_configured() {
        assert_eq!(resolve_opencode_model(None, None), "opencode/grok-code");
    }

    #[test]
    fn user_mcp_servers_skips_disabled() {
        let mut config = crate::config::AgentConfig::default();
        config.mcp_servers.push(crate::config::McpServerConfig::Local {
            id: "disabled".to_string(),
            enabled: false,
            command: "foo".to_string(),
            args: vec![],
            env: Default::default(),
        });
        let out = user_mcp_servers_as_claude(&config);
        assert!(out.is_empty());
    }
}
