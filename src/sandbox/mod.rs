//! Sandbox providers: a uniform async interface over remote compute backends.
//!
//! Two concrete backends ship with leasehold:
//! - `docker`: one container per session, driven through the Docker API
//! - `local`: host directories with `sh -c` execution (no isolation)
//!
//! The active backend is selected via `[provider].active` in leasehold.toml.

mod docker;
mod error;
mod local;
#[cfg(test)]
pub(crate) mod mock;
mod network;

pub(crate) use docker::DockerProvider;
pub(crate) use error::SandboxError;
pub(crate) use local::LocalProvider;
pub(crate) use network::NetworkPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Provider-side truth about one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionStatus {
    Running,
    Paused,
    Deleted,
    /// The status query itself failed. Never treated as `Deleted`.
    Unknown,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Deleted => write!(f, "deleted"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Handle to a provisioned instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SessionInfo {
    pub session_id: String,
    pub provider: String,
    pub status: SessionStatus,
}

/// Outcome of a synchronous command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ExecuteResult {
    /// Captured stdout.
    pub output: String,
    pub exit_code: i64,
    /// Captured stderr, if any.
    pub error: Option<String>,
    /// Timeout the provider actually applied after clamping.
    pub effective_timeout_ms: u64,
}

/// Best-effort resource usage snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct Metrics {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
}

/// One entry returned by `list_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// One process running inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ProcessInfo {
    pub pid: String,
    pub command: String,
}

/// An instance as listed by the provider account, used for orphan detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct InstanceInfo {
    pub instance_id: String,
    pub status: SessionStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

/// Contract every sandbox backend implements.
///
/// Paths passed to file operations must already be validated by the caller;
/// providers are not a security boundary.
#[async_trait]
pub(crate) trait SandboxProvider: Send + Sync {
    /// Registry name recorded in `sandbox_leases.provider_name`.
    fn name(&self) -> &str;

    /// Ceiling applied to every `execute` timeout.
    fn max_timeout(&self) -> Duration;

    /// Directory new terminals start in.
    fn default_cwd(&self) -> &str {
        "/"
    }

    /// Clamps a requested timeout to the provider ceiling.
    fn effective_timeout(&self, requested_ms: u64) -> Duration {
        Duration::from_millis(requested_ms).min(self.max_timeout())
    }

    /// Provisions a new instance, attaching `context_id` for data continuity.
    async fn create_session(&self, context_id: Option<&str>) -> Result<SessionInfo, SandboxError>;

    /// Tears down an instance. Returns false when it did not exist.
    async fn destroy_session(&self, session_id: &str, sync: bool) -> Result<bool, SandboxError>;

    /// Requests suspension. Not necessarily synchronous; poll the status.
    async fn pause_session(&self, session_id: &str) -> Result<bool, SandboxError>;

    /// Requests continuation. Not necessarily synchronous; poll the status.
    async fn resume_session(&self, session_id: &str) -> Result<bool, SandboxError>;

    /// Authoritative status. Query failures map to `Unknown`.
    async fn get_session_status(&self, session_id: &str) -> SessionStatus;

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: u64,
        cwd: Option<&str>,
    ) -> Result<ExecuteResult, SandboxError>;

    async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), SandboxError>;

    async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError>;

    /// Every instance the backend account currently has.
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, SandboxError>;

    /// `None` when the backend does not report usage.
    async fn get_metrics(&self, _session_id: &str) -> Option<Metrics> {
        None
    }

    #[allow(dead_code)] // Optional capability, no caller in this crate
    async fn screenshot(&self, _session_id: &str) -> Option<Vec<u8>> {
        None
    }

    async fn list_processes(&self, _session_id: &str) -> Option<Vec<ProcessInfo>> {
        None
    }

    #[allow(dead_code)] // Optional capability, no caller in this crate
    async fn get_web_url(&self, _session_id: &str, _port: u16) -> Option<String> {
        None
    }
}

/// Backends known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProviderKind {
    Local,
    Docker,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            _ => Err(SandboxError::unavailable(format!(
                "Unknown sandbox provider: '{s}'. Supported: local, docker"
            ))),
        }
    }
}

/// Enabled providers by name, plus the one new leases are created on.
#[derive(Clone)]
pub(crate) struct ProviderRegistry {
    active: String,
    providers: BTreeMap<String, Arc<dyn SandboxProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("active", &self.active)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Builds a registry from already constructed providers.
    ///
    /// The first provider is active unless `active` names another one.
    pub fn new(
        providers: Vec<Arc<dyn SandboxProvider>>,
        active: Option<&str>,
    ) -> Result<Self, SandboxError> {
        let first = providers
            .first()
            .map(|p| p.name().to_string())
            .ok_or_else(|| SandboxError::unavailable("No sandbox providers enabled"))?;
        let providers: BTreeMap<String, Arc<dyn SandboxProvider>> = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        let active = active.map_or(first, str::to_string);
        if !providers.contains_key(&active) {
            return Err(SandboxError::unavailable(format!(
                "Active provider '{active}' is not enabled"
            )));
        }
        Ok(Self { active, providers })
    }

    /// Constructs every enabled backend from configuration.
    pub fn from_config(config: &Config, active_override: Option<&str>) -> Result<Self, SandboxError> {
        let active: ProviderKind = active_override
            .unwrap_or(&config.provider.active)
            .parse()?;

        let mut kinds = vec![active];
        for name in &config.provider.enabled {
            let kind: ProviderKind = name.parse()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        let mut providers: Vec<Arc<dyn SandboxProvider>> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let provider: Arc<dyn SandboxProvider> = match kind {
                ProviderKind::Local => Arc::new(LocalProvider::new(config.provider.local.clone())?),
                ProviderKind::Docker => {
                    Arc::new(DockerProvider::connect(config.provider.docker.clone())?)
                }
            };
            providers.push(provider);
        }

        Self::new(providers, Some(&active.to_string()))
    }

    /// Name of the provider new leases are created on.
    pub fn active_name(&self) -> &str {
        &self.active
    }

    /// Looks up a provider by its registry name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registry names of every enabled provider.
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
