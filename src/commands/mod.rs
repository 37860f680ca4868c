//! CLI command implementations.
//!
//! Each submodule keeps its output formatting in pure functions returning
//! `String`; IO happens only at the top of each `run`.

pub mod exec;
pub mod init;
pub mod orphans;
pub mod queue;
pub mod serve;
pub mod session;
pub mod status;
pub mod tools;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::{resolve_provider, Config};
use crate::manager::SandboxManager;
use crate::queue::MessageQueue;
use crate::sandbox::ProviderRegistry;
use crate::store::Store;

/// Everything a command needs, wired once per invocation.
pub(crate) struct Runtime {
    pub config: Config,
    pub manager: SandboxManager,
    pub queue: MessageQueue,
}

impl Runtime {
    /// Opens the store and builds the provider registry.
    ///
    /// `provider` and `db` are the CLI overrides; both fall back to config.
    pub fn open(config: Config, provider: Option<&str>, db: Option<PathBuf>) -> Result<Self> {
        let db_path = match db {
            Some(path) => path,
            None => config.db_path()?,
        };
        debug!("Opening lease store at {}", db_path.display());
        let store = Store::open(&db_path, Duration::from_millis(config.store.busy_timeout_ms))
            .with_context(|| format!("Failed to open lease store at {}", db_path.display()))?;

        let active = resolve_provider(&config, provider);
        let providers = ProviderRegistry::from_config(&config, Some(&active))
            .context("Failed to initialize sandbox providers")?;

        let manager = SandboxManager::new(store.clone(), providers, &config);
        Ok(Self {
            config,
            manager,
            queue: MessageQueue::new(store),
        })
    }
}

/// Short timestamp used across command output.
pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// `Some(x)` as text, `None` as a dash.
pub(crate) fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
