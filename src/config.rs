use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            http_bind: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    #[serde(default = "default_output_settle_ms")]
    pub output_settle_ms: u64,
    #[serde(default = "default_drained_retention_ms")]
    pub drained_retention_ms: u64,
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            termination_grace_ms: default_termination_grace_ms(),
            output_settle_ms: default_output_settle_ms(),
            drained_retention_ms: default_drained_retention_ms(),
            idle_eviction_secs: default_idle_eviction_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_blocklist_path")]
    pub blocklist_path: PathBuf,
    #[serde(default = "default_blocked_commands")]
    pub default_blocked_commands: Vec<String>,
    #[serde(default = "default_allowed_directories")]
    pub allowed_directories: Vec<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            blocklist_path: default_blocklist_path(),
            default_blocked_commands: default_blocked_commands(),
            allowed_directories: default_allowed_directories(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>, http_bind: Option<&str>) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if let Some(http_bind) = http_bind {
            self.server.http_bind = non_empty(http_bind);
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SHELLGATE_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("SHELLGATE_HTTP_BIND") {
            self.server.http_bind = non_empty(&v);
        }
        if let Ok(v) = env::var("SHELLGATE_SHELL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.exec.shell = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("SHELLGATE_DEFAULT_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.exec.default_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("SHELLGATE_TERMINATION_GRACE_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.exec.termination_grace_ms = n.max(10);
            }
        }
        if let Ok(v) = env::var("SHELLGATE_BLOCKLIST_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.security.blocklist_path = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("SHELLGATE_ALLOWED_DIRECTORIES") {
            let dirs = split_csv(&v)
                .into_iter()
                .map(PathBuf::from)
                .collect::<Vec<_>>();
            if !dirs.is_empty() {
                self.security.allowed_directories = dirs;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self.exec.shell.trim().is_empty() {
            anyhow::bail!("exec.shell must not be empty");
        }
        if self.exec.default_timeout_ms > self.exec.max_timeout_ms {
            anyhow::bail!(
                "exec.default_timeout_ms ({}) exceeds exec.max_timeout_ms ({})",
                self.exec.default_timeout_ms,
                self.exec.max_timeout_ms
            );
        }
        if self.exec.sweep_interval_ms == 0 {
            anyhow::bail!("exec.sweep_interval_ms must be greater than zero");
        }
        if self.security.allowed_directories.is_empty() {
            anyhow::bail!("security.allowed_directories must list at least one directory");
        }
        if self.security.blocklist_path.as_os_str().is_empty() {
            anyhow::bail!("security.blocklist_path must not be empty");
        }
        Ok(())
    }
}

fn default_server_bind() -> String {
    "127.0.0.1:18790".to_owned()
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_shell() -> String {
    "sh".to_owned()
}

fn default_timeout_ms() -> u64 {
    1_000
}

fn default_max_timeout_ms() -> u64 {
    600_000
}

fn default_termination_grace_ms() -> u64 {
    2_000
}

fn default_output_settle_ms() -> u64 {
    500
}

fn default_drained_retention_ms() -> u64 {
    30_000
}

fn default_idle_eviction_secs() -> u64 {
    3_600
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_blocklist_path() -> PathBuf {
    PathBuf::from(".shellgate/blocked-commands.json")
}

fn default_blocked_commands() -> Vec<String> {
    [
        "format", "mount", "umount", "mkfs", "fdisk", "dd", "sudo", "su", "passwd", "adduser",
        "useradd", "usermod", "groupadd", "chsh", "visudo", "shutdown", "reboot", "halt",
        "poweroff",
    ]
    .iter()
    .map(|name| (*name).to_owned())
    .collect()
}

fn default_allowed_directories() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::Config;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[server]
http_bind = "127.0.0.1:0"

[exec]
default_timeout_ms = 250

[security]
allowed_directories = ["/srv/work", "/tmp"]
"#,
        )
        .expect("parse");
        assert_eq!(cfg.server.bind, "127.0.0.1:18790");
        assert_eq!(cfg.server.http_bind.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(cfg.exec.default_timeout_ms, 250);
        assert_eq!(cfg.exec.shell, "sh");
        assert_eq!(cfg.security.allowed_directories.len(), 2);
        assert!(cfg
            .security
            .default_blocked_commands
            .iter()
            .any(|name| name == "sudo"));
        cfg.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_inconsistent_timeouts_and_empty_roots() {
        let mut cfg = Config::default();
        cfg.exec.default_timeout_ms = cfg.exec.max_timeout_ms + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.security.allowed_directories.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = Config::load(&PathBuf::from("/definitely/missing/shellgate.toml"))
            .expect("defaults");
        assert!(!cfg.security.default_blocked_commands.is_empty());
    }

    #[test]
    fn cli_overrides_replace_binds() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some("0.0.0.0:9000"), Some("  "));
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.server.http_bind, None);
    }
}
