use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::NetworkPolicy;

pub(crate) const CONFIG_FILE: &str = "leasehold.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub orphans: OrphanConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Provider selection and per-backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend new leases are created on: "local" or "docker"
    #[serde(default = "default_provider")]
    pub active: String,

    /// Additional backends to load so existing leases on them stay manageable
    #[serde(default)]
    pub enabled: Vec<String>,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub docker: DockerConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            active: default_provider(),
            enabled: Vec::new(),
            local: LocalConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}

/// Host-directory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding `sessions/` and `contexts/`
    #[serde(default = "default_local_root")]
    pub root: String,

    /// Ceiling for command timeouts
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
            max_timeout_secs: default_max_timeout_secs(),
        }
    }
}

/// Docker backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image every sandbox container starts from
    #[serde(default = "default_image")]
    pub image: String,

    /// Working directory inside the container; the context volume mounts here
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Ceiling for command timeouts
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workdir: default_workdir(),
            max_timeout_secs: default_max_timeout_secs(),
            network: NetworkConfig::default(),
            resources: ResourceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network policy
    #[serde(default)]
    pub policy: NetworkPolicy,

    /// Custom DNS servers
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::AllowAll,
            dns: default_dns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "2g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

/// SQLite lease store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,

    /// How long a writer waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Convergence polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ReconcileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Defaults applied to new chat sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time before the reaper pauses a session (0 disables)
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Lifetime before the reaper destroys a session (0 disables)
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    /// Optional wall-clock budget
    #[serde(default)]
    pub max_wall_clock_secs: Option<u64>,

    /// Optional per-session command budget
    #[serde(default)]
    pub max_commands: Option<u32>,

    /// Default command timeout for `exec`
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            max_duration_secs: default_max_duration(),
            max_wall_clock_secs: None,
            max_commands: None,
            exec_timeout_ms: default_exec_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_orphan_interval")]
    pub interval_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_orphan_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Idle sleep between claims when the lifecycle queue is empty
    #[serde(default = "default_queue_poll_ms")]
    pub poll_interval_ms: u64,

    /// Claims older than this are handed back to `pending`
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_queue_poll_ms(),
            claim_timeout_secs: default_claim_timeout(),
        }
    }
}

/// Notification targets: "webhook:<url>", a bare URL, or "none"
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Fired when the reaper pauses or destroys a session
    #[serde(default)]
    pub on_reap: Option<String>,

    /// Fired when an orphan scan finds something
    #[serde(default)]
    pub on_orphan: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Mirror logs as JSON into this file (rotated daily)
    #[serde(default)]
    pub file: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_local_root() -> String {
    data_dir().join("local").display().to_string()
}

fn default_db_path() -> String {
    data_dir().join("leasehold.db").display().to_string()
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("leasehold")
}

fn default_max_timeout_secs() -> u64 {
    600
}

fn default_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_poll_attempts() -> u32 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_idle_ttl() -> u64 {
    600
}

fn default_max_duration() -> u64 {
    4 * 60 * 60
}

fn default_exec_timeout_ms() -> u64 {
    120_000
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_orphan_interval() -> u64 {
    300
}

fn default_queue_poll_ms() -> u64 {
    500
}

fn default_claim_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Database path with `~` expanded
    pub fn db_path(&self) -> Result<PathBuf> {
        expand_path(&self.store.path).map(PathBuf::from)
    }
}

/// Expand ~ to home directory
pub(crate) fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Resolves the provider to create new leases on.
/// Priority: CLI flag > `LEASEHOLD_PROVIDER` env var > config file.
pub(crate) fn resolve_provider(config: &Config, provider_override: Option<&str>) -> String {
    let env_provider = std::env::var("LEASEHOLD_PROVIDER").ok();
    resolve_provider_with_env(config, provider_override, env_provider.as_deref())
}

/// Internal helper for provider resolution with explicit env var value.
/// Enables testing without modifying actual environment.
fn resolve_provider_with_env(
    config: &Config,
    provider_override: Option<&str>,
    env_provider: Option<&str>,
) -> String {
    if let Some(p) = provider_override {
        return p.to_string();
    }

    if let Some(env_val) = env_provider {
        if !env_val.is_empty() {
            return env_val.to_string();
        }
    }

    config.provider.active.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider.active, "local");
        assert_eq!(config.reconcile.poll_attempts, 30);
        assert_eq!(config.reconcile.poll_interval(), Duration::from_secs(1));
        assert!(config.reaper.enabled);
        assert!(config.store.path.ends_with("leasehold.db"));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[provider]
active = "docker"
enabled = ["local"]

[provider.docker]
image = "python:3.12"

[provider.docker.network]
policy = "deny"

[session]
idle_ttl_secs = 60
max_commands = 10

[reaper]
interval_secs = 5

[notifications]
on_orphan = "webhook:https://example.com/orphans"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.provider.active, "docker");
        assert_eq!(config.provider.enabled, vec!["local"]);
        assert_eq!(config.provider.docker.image, "python:3.12");
        assert_eq!(config.provider.docker.network.policy, NetworkPolicy::Deny);
        assert_eq!(config.provider.docker.workdir, "/workspace");
        assert_eq!(config.session.idle_ttl_secs, 60);
        assert_eq!(config.session.max_commands, Some(10));
        assert_eq!(config.reaper.interval_secs, 5);
        assert_eq!(
            config.notifications.on_orphan.as_deref(),
            Some("webhook:https://example.com/orphans")
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.provider.active, "local");
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[provider\nactive = ").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/var/lib/x.db").unwrap(), "/var/lib/x.db");

        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/leasehold.db").unwrap();
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("leasehold.db"));
        }
    }

    #[test]
    fn test_resolve_provider_config_default() {
        let config = Config::default();
        assert_eq!(resolve_provider_with_env(&config, None, None), "local");
    }

    #[test]
    fn test_resolve_provider_env_overrides_config() {
        let config = Config::default();
        assert_eq!(
            resolve_provider_with_env(&config, None, Some("docker")),
            "docker"
        );
    }

    #[test]
    fn test_resolve_provider_cli_overrides_env() {
        let config = Config::default();
        assert_eq!(
            resolve_provider_with_env(&config, Some("local"), Some("docker")),
            "local"
        );
    }

    #[test]
    fn test_resolve_provider_empty_env_falls_back() {
        let config = Config::default();
        assert_eq!(resolve_provider_with_env(&config, None, Some("")), "local");
    }
}
