use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Daemon configuration: the listen port and config dir come from the
/// environment; everything else is loaded from `agent-config.json` inside
/// the config dir.
pub struct Config {
    pub port: u16,
    pub config_dir: PathBuf,
    pub environment: String,
    pub agent_config: AgentConfig,
}

impl Config {
    /// Load from `WS_CONFIG_DIR` / `WS_PORT` / `ENVIRONMENT`, falling back to
    /// `agent-config.json`'s own `port` field when `WS_PORT` is unset.
    /// Fails fast: a malformed `agent-config.json` aborts startup (see
    /// error-handling policy), a missing one falls back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let config_dir = std::env::var("WS_CONFIG_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_config_dir);

        let agent_config = AgentConfig::load(&config_dir.join("agent-config.json"))?;

        Self::from_raw_values(
            std::env::var("WS_PORT").ok().as_deref(),
            config_dir,
            std::env::var("ENVIRONMENT").ok().as_deref(),
            agent_config,
        )
    }

    /// Build from already-parsed pieces. Used directly in tests to avoid
    /// mutating process-global environment.
    pub fn from_raw_values(
        port: Option<&str>,
        config_dir: PathBuf,
        environment: Option<&str>,
        agent_config: AgentConfig,
    ) -> anyhow::Result<Self> {
        let port = port
            .and_then(|v| v.parse().ok())
            .unwrap_or(agent_config.port.unwrap_or(8081));

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        Ok(Config {
            port,
            config_dir,
            environment,
            agent_config,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    pub fn state_lock_path(&self) -> PathBuf {
        self.config_dir.join(".state.lock")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.config_dir.join("session-registry.json")
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.config_dir.join(".registry.lock")
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".perry")
}

/// Mirrors `agent-config.json` (spec'd in §6 of the external interfaces).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub skills: Vec<SkillConfig>,
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub ssh: SshConfig,
}

impl AgentConfig {
    /// Load from disk, or return defaults if the file doesn't exist.
    /// A file that exists but does not parse is a fail-fast startup error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_json::from_str(&content).map_err(|e| {
                    anyhow::anyhow!("malformed agent-config.json at {}: {e}", path.display())
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read agent-config.json at {}: {e}",
                path.display()
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default)]
    pub post_start: Option<PostStartScripts>,
    #[serde(default)]
    pub fail_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PostStartScripts {
    Single(String),
    Many(Vec<String>),
}

impl PostStartScripts {
    pub fn paths(&self) -> Vec<String> {
        match self {
            PostStartScripts::Single(s) => vec![s.clone()],
            PostStartScripts::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub claude_code: Option<AgentCredential>,
    #[serde(default)]
    pub opencode: Option<AgentCredential>,
    #[serde(default)]
    pub codex: Option<AgentCredential>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCredential {
    #[serde(default)]
    pub oauth_token: Option<String>,
    #[serde(default)]
    pub zen_token: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "appliesTo")]
    pub applies_to: Vec<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpServerConfig {
    Local {
        id: String,
        #[serde(default)]
        enabled: bool,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Remote {
        id: String,
        #[serde(default)]
        enabled: bool,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        oauth: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port_start")]
    pub port_range_start: u16,
    #[serde(default = "default_ssh_port_end")]
    pub port_range_end: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
}

fn default_ssh_port_start() -> u16 {
    2200
}

fn default_ssh_port_end() -> u16 {
    2299
}

fn default_ssh_user() -> String {
    "workspace".to_string()
}

// A derived `Default` would zero the range (u16/String defaults), which is
// never what we want when the whole `ssh` key is absent from
// `agent-config.json` — `#[serde(default)]` on `AgentConfig::ssh` falls back
// to this, not to per-field `#[serde(default = ...)]`, since there's no
// surrounding object to apply those to.
impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            port_range_start: default_ssh_port_start(),
            port_range_end: default_ssh_port_end(),
            user: default_ssh_user(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_port_falls_back_to_agent_config_port() {
        let agent_config = AgentConfig {
            port: Some(9999),
            ..Default::default()
        };
        let config = Config::from_raw_values(
            Some("not-a-number"),
            PathBuf::from("/tmp/perry-test"),
            None,
            agent_config,
        )
        .unwrap();
        assert_eq!(config.port, 9999);
    }

    #[test]
    fn env_port_overrides_agent_config() {
        let agent_config = AgentConfig {
            port: Some(9999),
            ..Default::default()
        };
        let config = Config::from_raw_values(
            Some("3000"),
            PathBuf::from("/tmp/perry-test"),
            None,
            agent_config,
        )
        .unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn default_environment_is_local() {
        let config = Config::from_raw_values(
            None,
            PathBuf::from("/tmp/perry-test"),
            None,
            AgentConfig::default(),
        )
        .unwrap();
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn agent_config_with_no_ssh_key_still_gets_a_usable_port_range() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.ssh.port_range_start, 2200);
        assert_eq!(config.ssh.port_range_end, 2299);
        assert_eq!(config.ssh.user, "workspace");
    }

    #[test]
    fn missing_agent_config_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&tmp.path().join("agent-config.json")).unwrap();
        assert_eq!(config.port, None);
        assert!(config.skills.is_empty());
    }

    #[test]
    fn malformed_agent_config_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent-config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }

    #[test]
    fn post_start_scripts_single_and_many() {
        let single = PostStartScripts::Single("setup.sh".into());
        assert_eq!(single.paths(), vec!["setup.sh".to_string()]);

        let many = PostStartScripts::Many(vec!["a.sh".into(), "b.sh".into()]);
        assert_eq!(many.paths(), vec!["a.sh".to_string(), "b.sh".to_string()]);
    }
}
