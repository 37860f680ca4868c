//! Mock sandbox provider for testing.
//!
//! Keeps instances in memory, tracks calls for test assertions, and can
//! simulate slow convergence, transient status failures and provisioning
//! errors without touching a real backend.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    ExecuteResult, FileEntry, InstanceInfo, SandboxError, SandboxProvider, SessionInfo,
    SessionStatus,
};

#[derive(Debug, Clone)]
struct MockInstance {
    status: SessionStatus,
    /// Status the instance is moving to, reached after `lag` status polls.
    pending: Option<(SessionStatus, usize)>,
    files: BTreeMap<String, Vec<u8>>,
}

/// A mock provider for testing.
#[derive(Debug, Clone)]
pub(crate) struct MockProvider {
    name: String,
    instances: Arc<Mutex<HashMap<String, MockInstance>>>,
    next_id: Arc<AtomicUsize>,
    /// Status polls before a pause/resume becomes visible.
    lag: Arc<AtomicUsize>,
    pause_supported: Arc<AtomicBool>,
    status_unknown: Arc<AtomicBool>,
    fail_create: Arc<AtomicBool>,
    fail_pause: Arc<AtomicBool>,
    fail_destroy: Arc<AtomicBool>,
    create_delay: Arc<Mutex<Duration>>,
    pause_delay: Arc<Mutex<Duration>>,
    exec_output: Arc<Mutex<String>>,
    pub creates: Arc<AtomicUsize>,
    pub destroys: Arc<AtomicUsize>,
    pub pauses: Arc<AtomicUsize>,
    pub resumes: Arc<AtomicUsize>,
    pub status_queries: Arc<AtomicUsize>,
    pub executions: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instances: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicUsize::new(1)),
            lag: Arc::new(AtomicUsize::new(0)),
            pause_supported: Arc::new(AtomicBool::new(true)),
            status_unknown: Arc::new(AtomicBool::new(false)),
            fail_create: Arc::new(AtomicBool::new(false)),
            fail_pause: Arc::new(AtomicBool::new(false)),
            fail_destroy: Arc::new(AtomicBool::new(false)),
            create_delay: Arc::new(Mutex::new(Duration::ZERO)),
            pause_delay: Arc::new(Mutex::new(Duration::ZERO)),
            exec_output: Arc::new(Mutex::new(String::new())),
            creates: Arc::new(AtomicUsize::new(0)),
            destroys: Arc::new(AtomicUsize::new(0)),
            pauses: Arc::new(AtomicUsize::new(0)),
            resumes: Arc::new(AtomicUsize::new(0)),
            status_queries: Arc::new(AtomicUsize::new(0)),
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pause/resume only become visible after `polls` status queries.
    pub fn set_lag(&self, polls: usize) {
        self.lag.store(polls, Ordering::SeqCst);
    }

    /// When false, pause requests are accepted but never take effect.
    pub fn set_pause_supported(&self, supported: bool) {
        self.pause_supported.store(supported, Ordering::SeqCst);
    }

    /// Every status query reports `Unknown` while set.
    pub fn set_status_unknown(&self, unknown: bool) {
        self.status_unknown.store(unknown, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pause(&self, fail: bool) {
        self.fail_pause.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_pause_delay(&self, delay: Duration) {
        *self.pause_delay.lock().unwrap() = delay;
    }

    /// Stdout returned by every `execute` call.
    pub fn set_exec_output(&self, output: &str) {
        *self.exec_output.lock().unwrap() = output.to_string();
    }

    /// Creates an instance behind the manager's back.
    pub fn spawn_unmanaged(&self) -> String {
        let id = format!("{}-unmanaged-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.instances.lock().unwrap().insert(
            id.clone(),
            MockInstance {
                status: SessionStatus::Running,
                pending: None,
                files: BTreeMap::new(),
            },
        );
        id
    }

    /// Removes an instance behind the manager's back.
    pub fn vanish(&self, session_id: &str) {
        self.instances.lock().unwrap().remove(session_id);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    fn transition(&self, session_id: &str, target: SessionStatus) -> Result<bool, SandboxError> {
        let mut instances = self.instances.lock().unwrap();
        let Some(instance) = instances.get_mut(session_id) else {
            return Ok(false);
        };
        let lag = self.lag.load(Ordering::SeqCst);
        if lag == 0 {
            instance.status = target;
        } else {
            instance.pending = Some((target, lag));
        }
        Ok(true)
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn create_session(&self, _context_id: Option<&str>) -> Result<SessionInfo, SandboxError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::provision(&self.name, "mock capacity exhausted"));
        }
        let id = format!("{}-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.instances.lock().unwrap().insert(
            id.clone(),
            MockInstance {
                status: SessionStatus::Running,
                pending: None,
                files: BTreeMap::new(),
            },
        );
        Ok(SessionInfo {
            session_id: id,
            provider: self.name.clone(),
            status: SessionStatus::Running,
        })
    }

    async fn destroy_session(&self, session_id: &str, _sync: bool) -> Result<bool, SandboxError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(SandboxError::operation("mock destroy rejected"));
        }
        Ok(self.instances.lock().unwrap().remove(session_id).is_some())
    }

    async fn pause_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pause_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(SandboxError::operation("mock pause rejected"));
        }
        if !self.pause_supported.load(Ordering::SeqCst) {
            return Ok(self.instances.lock().unwrap().contains_key(session_id));
        }
        self.transition(session_id, SessionStatus::Paused)
    }

    async fn resume_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.transition(session_id, SessionStatus::Running)
    }

    async fn get_session_status(&self, session_id: &str) -> SessionStatus {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        if self.status_unknown.load(Ordering::SeqCst) {
            return SessionStatus::Unknown;
        }
        let mut instances = self.instances.lock().unwrap();
        let Some(instance) = instances.get_mut(session_id) else {
            return SessionStatus::Deleted;
        };
        if let Some((target, remaining)) = instance.pending {
            if remaining <= 1 {
                instance.status = target;
                instance.pending = None;
            } else {
                instance.pending = Some((target, remaining - 1));
            }
        }
        instance.status
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: u64,
        _cwd: Option<&str>,
    ) -> Result<ExecuteResult, SandboxError> {
        if !self.instances.lock().unwrap().contains_key(session_id) {
            return Err(SandboxError::not_found(session_id));
        }
        self.executions.lock().unwrap().push(command.to_string());
        let effective = self.effective_timeout(timeout_ms);
        Ok(ExecuteResult {
            output: self.exec_output.lock().unwrap().clone(),
            exit_code: 0,
            error: None,
            effective_timeout_ms: u64::try_from(effective.as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        instance
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::io(path, "No such file"))
    }

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        instance.files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(instance
            .files
            .iter()
            .filter_map(|(name, content)| {
                name.strip_prefix(&prefix).map(|rest| FileEntry {
                    name: rest.to_string(),
                    is_dir: false,
                    size: content.len() as u64,
                })
            })
            .collect())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, SandboxError> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .iter()
            .map(|(id, instance)| InstanceInfo {
                instance_id: id.clone(),
                status: instance.status,
                created_at: Some(Utc::now()),
                metadata: BTreeMap::new(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_create_and_destroy() {
        let provider = MockProvider::new("mock");
        let info = provider.create_session(None).await.unwrap();
        assert_eq!(info.status, SessionStatus::Running);
        assert!(provider.destroy_session(&info.session_id, true).await.unwrap());
        assert!(!provider.destroy_session(&info.session_id, true).await.unwrap());
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mock_lagged_pause() {
        let provider = MockProvider::new("mock");
        provider.set_lag(2);
        let info = provider.create_session(None).await.unwrap();
        provider.pause_session(&info.session_id).await.unwrap();
        // First poll still sees the old state
        assert_eq!(
            provider.get_session_status(&info.session_id).await,
            SessionStatus::Running
        );
        assert_eq!(
            provider.get_session_status(&info.session_id).await,
            SessionStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_mock_missing_instance_is_deleted() {
        let provider = MockProvider::new("mock");
        assert_eq!(
            provider.get_session_status("nope").await,
            SessionStatus::Deleted
        );
    }

    #[tokio::test]
    async fn test_mock_fail_create() {
        let provider = MockProvider::new("mock");
        provider.set_fail_create(true);
        let err = provider.create_session(None).await.unwrap_err();
        assert!(err.is_provision());
    }
}
