//! Host-directory sandbox backend.
//!
//! Each session is a directory under `<root>/sessions/<id>` holding a
//! `workspace/` and a `session.json` status record. Contexts live under
//! `<root>/contexts/<context_id>` and are copied into the workspace on create
//! and synced back on destroy. Commands run through `sh -c` on the host, so
//! this backend isolates nothing; it exists for development and for hosts
//! without a container engine.
//!
//! Provider calls touch the filesystem through `tokio::fs`; recursive copies
//! and size walks run on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ExecuteResult, FileEntry, InstanceInfo, Metrics, SandboxError, SandboxProvider, SessionInfo,
    SessionStatus,
};
use crate::config::{expand_path, LocalConfig};

const PROVIDER_NAME: &str = "local";
const RECORD_FILE: &str = "session.json";
const WORKSPACE_DIR: &str = "workspace";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    status: SessionStatus,
    context_id: Option<String>,
    created_at: DateTime<Utc>,
}

/// Runs sandboxes as plain directories on the host.
#[derive(Debug, Clone)]
pub(crate) struct LocalProvider {
    root: PathBuf,
    max_timeout: Duration,
}

impl LocalProvider {
    /// Creates the provider, making sure its directory layout exists.
    pub fn new(config: LocalConfig) -> Result<Self, SandboxError> {
        let root = expand_path(&config.root)
            .map(PathBuf::from)
            .map_err(|e| SandboxError::unavailable(e.to_string()))?;
        for dir in [root.join("sessions"), root.join("contexts")] {
            fs::create_dir_all(&dir).map_err(|e| {
                SandboxError::unavailable(format!("Cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(Self {
            root,
            max_timeout: Duration::from_secs(config.max_timeout_secs),
        })
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, SandboxError> {
        if !is_safe_component(session_id) {
            return Err(SandboxError::not_found(session_id));
        }
        Ok(self.root.join("sessions").join(session_id))
    }

    fn context_dir(&self, context_id: &str) -> PathBuf {
        self.root.join("contexts").join(sanitize_component(context_id))
    }

    fn workspace(&self, session_id: &str) -> Result<PathBuf, SandboxError> {
        Ok(self.session_dir(session_id)?.join(WORKSPACE_DIR))
    }

    async fn read_record(&self, session_id: &str) -> Result<Option<SessionRecord>, SandboxError> {
        let dir = self.session_dir(session_id)?;
        let path = dir.join(RECORD_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            // A directory without its record is half-created, not gone
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    && !tokio::fs::try_exists(&dir).await.unwrap_or(true) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(SandboxError::io(path.display().to_string(), e)),
        };
        let record = serde_json::from_str(&content)
            .map_err(|e| SandboxError::io(path.display().to_string(), e))?;
        Ok(Some(record))
    }

    async fn write_record(
        &self,
        session_id: &str,
        record: &SessionRecord,
    ) -> Result<(), SandboxError> {
        let path = self.session_dir(session_id)?.join(RECORD_FILE);
        let content = serde_json::to_string_pretty(record).map_err(SandboxError::operation)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SandboxError::io(path.display().to_string(), e))
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<bool, SandboxError> {
        let Some(mut record) = self.read_record(session_id).await? else {
            return Ok(false);
        };
        record.status = status;
        self.write_record(session_id, &record).await?;
        Ok(true)
    }

    async fn running_workspace(&self, session_id: &str) -> Result<PathBuf, SandboxError> {
        match self.read_record(session_id).await? {
            None => Err(SandboxError::not_found(session_id)),
            Some(record) if record.status != SessionStatus::Running => {
                Err(SandboxError::invalid_state(session_id, record.status.to_string()))
            }
            Some(_) => self.workspace(session_id),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    async fn create_session(&self, context_id: Option<&str>) -> Result<SessionInfo, SandboxError> {
        let session_id = format!("local-{}", short_id());
        let dir = self.session_dir(&session_id)?;
        let workspace = dir.join(WORKSPACE_DIR);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| SandboxError::provision(PROVIDER_NAME, e.to_string()))?;

        if let Some(context_id) = context_id {
            let context = self.context_dir(context_id);
            if tokio::fs::try_exists(&context).await.unwrap_or(false) {
                debug!("Restoring context {} into {}", context_id, session_id);
                let (from, to) = (context.clone(), workspace.clone());
                tokio::task::spawn_blocking(move || copy_dir_recursive(&from, &to))
                    .await
                    .map_err(|e| SandboxError::provision(PROVIDER_NAME, e.to_string()))?
                    .map_err(|e| SandboxError::provision(PROVIDER_NAME, e.to_string()))?;
            }
        }

        let record = SessionRecord {
            status: SessionStatus::Running,
            context_id: context_id.map(String::from),
            created_at: Utc::now(),
        };
        self.write_record(&session_id, &record)
            .await
            .map_err(|e| SandboxError::provision(PROVIDER_NAME, e.to_string()))?;

        info!("Created local sandbox {}", session_id);
        Ok(SessionInfo {
            session_id,
            provider: PROVIDER_NAME.to_string(),
            status: SessionStatus::Running,
        })
    }

    async fn destroy_session(&self, session_id: &str, sync: bool) -> Result<bool, SandboxError> {
        let dir = match self.session_dir(session_id) {
            Ok(dir) => dir,
            Err(_) => return Ok(false),
        };
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(false);
        }

        let record = self.read_record(session_id).await.ok().flatten();
        if let (true, Some(context_id)) = (sync, record.and_then(|r| r.context_id)) {
            let context = self.context_dir(&context_id);
            let workspace = dir.join(WORKSPACE_DIR);
            debug!("Syncing {} back to context {}", session_id, context_id);
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                if context.exists() {
                    fs::remove_dir_all(&context)?;
                }
                copy_dir_recursive(&workspace, &context)
            })
            .await
            .map_err(SandboxError::operation)?
            .map_err(|e| SandboxError::io(context_id.clone(), e))?;
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::io(dir.display().to_string(), e))?;
        info!("Destroyed local sandbox {}", session_id);
        Ok(true)
    }

    async fn pause_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        self.set_status(session_id, SessionStatus::Paused).await
    }

    async fn resume_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        self.set_status(session_id, SessionStatus::Running).await
    }

    async fn get_session_status(&self, session_id: &str) -> SessionStatus {
        match self.read_record(session_id).await {
            Ok(Some(record)) => record.status,
            Ok(None) => SessionStatus::Deleted,
            Err(e) => {
                warn!("Cannot read status of {}: {}", session_id, e);
                SessionStatus::Unknown
            }
        }
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: u64,
        cwd: Option<&str>,
    ) -> Result<ExecuteResult, SandboxError> {
        let workspace = self.running_workspace(session_id).await?;
        let dir = cwd.map_or_else(|| workspace.clone(), |c| resolve(&workspace, c));
        let timeout = self.effective_timeout(timeout_ms);

        debug!("Executing in {}: {}", session_id, command);
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .env("LEASEHOLD_WORKSPACE", &workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::io(dir.display().to_string(), e))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::timeout(timeout))?
            .map_err(SandboxError::operation)?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok(ExecuteResult {
            output: String::from_utf8_lossy(&output.stdout).to_string(),
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
            error: (!stderr.is_empty()).then_some(stderr),
            effective_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let file = resolve(&self.running_workspace(session_id).await?, path);
        tokio::fs::read(&file).await.map_err(|e| SandboxError::io(path, e))
    }

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let file = resolve(&self.running_workspace(session_id).await?, path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(path, e))?;
        }
        tokio::fs::write(&file, content)
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let dir = resolve(&self.running_workspace(session_id).await?, path);
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SandboxError::io(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| SandboxError::io(path, e))? {
            let meta = entry.metadata().await.map_err(|e| SandboxError::io(path, e))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, SandboxError> {
        let sessions = self.root.join("sessions");
        let mut reader = tokio::fs::read_dir(&sessions)
            .await
            .map_err(|e| SandboxError::io(sessions.display().to_string(), e))?;

        let mut instances = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| SandboxError::io(sessions.display().to_string(), e))?
        {
            let instance_id = entry.file_name().to_string_lossy().to_string();
            let mut metadata = BTreeMap::new();
            metadata.insert("path".to_string(), entry.path().display().to_string());
            let (status, created_at) = match self.read_record(&instance_id).await {
                Ok(Some(record)) => {
                    if let Some(context_id) = record.context_id {
                        metadata.insert("context_id".to_string(), context_id);
                    }
                    (record.status, Some(record.created_at))
                }
                _ => (SessionStatus::Unknown, None),
            };
            instances.push(InstanceInfo {
                instance_id,
                status,
                created_at,
                metadata,
            });
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn get_metrics(&self, session_id: &str) -> Option<Metrics> {
        let workspace = self.workspace(session_id).ok()?;
        if !tokio::fs::try_exists(&workspace).await.unwrap_or(false) {
            return None;
        }
        let disk = tokio::task::spawn_blocking(move || dir_size(&workspace))
            .await
            .ok()?;
        Some(Metrics {
            disk_bytes: Some(disk),
            ..Metrics::default()
        })
    }
}

/// Resolve a sandbox path against the workspace; absolute paths are rooted there too.
fn resolve(workspace: &Path, path: &str) -> PathBuf {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() || relative == "." {
        workspace.to_path_buf()
    } else {
        workspace.join(relative)
    }
}

fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(reader) = fs::read_dir(path) else {
        return 0;
    };
    reader
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider() -> (TempDir, LocalProvider) {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(LocalConfig {
            root: dir.path().display().to_string(),
            max_timeout_secs: 5,
        })
        .unwrap();
        (dir, provider)
    }

    #[test]
    fn test_resolve_paths() {
        let ws = Path::new("/tmp/ws");
        assert_eq!(resolve(ws, "/"), PathBuf::from("/tmp/ws"));
        assert_eq!(resolve(ws, "."), PathBuf::from("/tmp/ws"));
        assert_eq!(resolve(ws, "src/main.rs"), PathBuf::from("/tmp/ws/src/main.rs"));
        assert_eq!(resolve(ws, "/etc/hosts"), PathBuf::from("/tmp/ws/etc/hosts"));
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("thread/42"), "thread_42");
        assert_eq!(sanitize_component("ok-name_1"), "ok-name_1");
        assert!(!is_safe_component("../etc"));
        assert!(is_safe_component("local-abc"));
    }

    #[tokio::test]
    async fn test_create_execute_and_destroy() {
        let (_dir, provider) = provider();
        let info = provider.create_session(None).await.unwrap();
        assert_eq!(info.provider, "local");
        assert_eq!(
            provider.get_session_status(&info.session_id).await,
            SessionStatus::Running
        );

        let result = provider
            .execute(&info.session_id, "echo hello; echo oops >&2; exit 3", 1_000, None)
            .await
            .unwrap();
        assert_eq!(result.output.trim(), "hello");
        assert_eq!(result.error.as_deref().map(str::trim), Some("oops"));
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.effective_timeout_ms, 1_000);

        assert!(provider.destroy_session(&info.session_id, true).await.unwrap());
        assert_eq!(
            provider.get_session_status(&info.session_id).await,
            SessionStatus::Deleted
        );
        assert!(!provider.destroy_session(&info.session_id, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_clamped_to_ceiling() {
        let (_dir, provider) = provider();
        let info = provider.create_session(None).await.unwrap();
        let result = provider
            .execute(&info.session_id, "true", 3_600_000, None)
            .await
            .unwrap();
        assert_eq!(result.effective_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let (_dir, provider) = provider();
        let info = provider.create_session(None).await.unwrap();
        let err = provider
            .execute(&info.session_id, "sleep 5", 100, None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_file_round_trip_and_listing() {
        let (_dir, provider) = provider();
        let info = provider.create_session(None).await.unwrap();
        let bytes = [0u8, 159, 146, 150, b'\n'];
        provider
            .write_file(&info.session_id, "/data/blob.bin", &bytes)
            .await
            .unwrap();
        let read = provider.read_file(&info.session_id, "data/blob.bin").await.unwrap();
        assert_eq!(read, bytes);

        let entries = provider.list_dir(&info.session_id, "/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "data");
        assert!(entries[0].is_dir);

        let err = provider.read_file(&info.session_id, "missing.txt").await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_paused_session_rejects_execution() {
        let (_dir, provider) = provider();
        let info = provider.create_session(None).await.unwrap();
        assert!(provider.pause_session(&info.session_id).await.unwrap());
        assert_eq!(
            provider.get_session_status(&info.session_id).await,
            SessionStatus::Paused
        );
        assert!(provider.execute(&info.session_id, "true", 1_000, None).await.is_err());

        assert!(provider.resume_session(&info.session_id).await.unwrap());
        assert!(provider.execute(&info.session_id, "true", 1_000, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_context_survives_instance_replacement() {
        let (_dir, provider) = provider();
        let first = provider.create_session(Some("thread-1")).await.unwrap();
        provider
            .write_file(&first.session_id, "notes.txt", b"remember me")
            .await
            .unwrap();
        provider.destroy_session(&first.session_id, true).await.unwrap();

        let second = provider.create_session(Some("thread-1")).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        let read = provider.read_file(&second.session_id, "notes.txt").await.unwrap();
        assert_eq!(read, b"remember me");
    }

    #[tokio::test]
    async fn test_list_instances_and_metrics() {
        let (_dir, provider) = provider();
        let info = provider.create_session(Some("ctx")).await.unwrap();
        provider.write_file(&info.session_id, "a.txt", b"12345").await.unwrap();

        let instances = provider.list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, info.session_id);
        assert_eq!(instances[0].metadata.get("context_id").map(String::as_str), Some("ctx"));

        let metrics = provider.get_metrics(&info.session_id).await.unwrap();
        assert_eq!(metrics.disk_bytes, Some(5));
        assert!(provider.get_metrics("local-missing").await.is_none());
    }

    #[tokio::test]
    async fn test_unsafe_session_id_is_not_found() {
        let (_dir, provider) = provider();
        assert!(!provider.destroy_session("../..", true).await.unwrap());
        assert_eq!(provider.get_session_status("a/b").await, SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_half_created_session_is_unknown_not_deleted() {
        let (dir, provider) = provider();
        let partial = dir.path().join("sessions").join("local-partial");
        tokio::fs::create_dir_all(partial.join(WORKSPACE_DIR)).await.unwrap();

        assert_eq!(
            provider.get_session_status("local-partial").await,
            SessionStatus::Unknown
        );
        assert_eq!(
            provider.get_session_status("local-never").await,
            SessionStatus::Deleted
        );
        let instances = provider.list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, SessionStatus::Unknown);
    }
}
