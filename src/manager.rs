//! Lifecycle facade over leases, terminals and chat sessions.
//!
//! Everything a thread does with its sandbox goes through `SandboxManager`:
//! lazily creating or resuming the instance, running commands with tracked
//! cwd/env, file access, and explicit pause/resume/destroy. Calls for the
//! same thread are serialized so concurrent callers never provision twice.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::LeaseError;
use crate::reconcile::{plan, KeyedLocks, ReconcileOutcome, Reconciler, Transition};
use crate::sandbox::{
    ExecuteResult, FileEntry, Metrics, ProcessInfo, ProviderRegistry, SandboxProvider,
    SessionInfo, SessionStatus,
};
use crate::store::{
    Budget, ChatSession, CommandStatus, DesiredState, Lease, ObservedState, SessionPolicy,
    SessionState, Store, StoreError, Terminal,
};

/// Printed after every command so the post-command directory can be captured.
const CWD_MARKER: &str = "__LEASEHOLD_CWD__:";
const CAS_RETRIES: usize = 5;

/// What a lifecycle call reports: accepted, and whether already confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct LifecycleOutcome {
    pub success: bool,
    pub converged: bool,
    pub desired_state: DesiredState,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SessionSummary {
    pub thread_id: Option<String>,
    pub lease: Lease,
    pub chat: Option<ChatSession>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct CleanupReport {
    pub checked: usize,
    pub pruned: usize,
    pub flagged: usize,
}

/// Result of one [`SandboxManager::converge_pending`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ConvergeReport {
    pub pending: usize,
    pub converged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CommandOutcome {
    pub command_id: String,
    /// Terminal cwd after the command.
    pub cwd: String,
    #[serde(flatten)]
    pub result: ExecuteResult,
}

/// A thread's live session, resolved and touched.
struct Attached {
    lease: Lease,
    terminal: Terminal,
    chat: ChatSession,
    provider: Arc<dyn SandboxProvider>,
    instance_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SandboxManager {
    store: Store,
    providers: ProviderRegistry,
    reconciler: Reconciler,
    thread_locks: KeyedLocks,
    policy: SessionPolicy,
}

impl SandboxManager {
    pub fn new(store: Store, providers: ProviderRegistry, config: &Config) -> Self {
        let session = &config.session;
        let budget = Budget {
            max_wall_clock_sec: session.max_wall_clock_secs,
            max_commands: session.max_commands,
        };
        let policy = SessionPolicy {
            idle_ttl_sec: i64::try_from(session.idle_ttl_secs).unwrap_or(i64::MAX),
            max_duration_sec: i64::try_from(session.max_duration_secs).unwrap_or(i64::MAX),
            budget: (!budget.is_empty()).then_some(budget),
        };
        let reconciler = Reconciler::new(store.clone(), providers.clone(), &config.reconcile);
        Self {
            store,
            providers,
            reconciler,
            thread_locks: KeyedLocks::default(),
            policy,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Returns the thread's running session, creating or resuming it.
    pub async fn get_or_create_session(&self, thread_id: &str) -> Result<SessionInfo, LeaseError> {
        let attached = self.attach(thread_id).await?;
        Ok(SessionInfo {
            session_id: attached.instance_id,
            provider: attached.lease.provider_name,
            status: SessionStatus::Running,
        })
    }

    pub async fn pause_session(&self, thread_id: &str) -> Result<LifecycleOutcome, LeaseError> {
        let _guard = self.thread_locks.lock(thread_id).await;
        let lease = self.require_lease(thread_id)?;
        let outcome = self.drive(&lease, DesiredState::Paused).await?;
        self.store
            .set_chat_sessions_for_lease(&lease.lease_id, SessionState::Paused)?;
        Ok(outcome)
    }

    pub async fn resume_session(&self, thread_id: &str) -> Result<LifecycleOutcome, LeaseError> {
        let _guard = self.thread_locks.lock(thread_id).await;
        let lease = self.require_lease(thread_id)?;
        let outcome = self.drive(&lease, DesiredState::Running).await?;
        self.store
            .set_chat_sessions_for_lease(&lease.lease_id, SessionState::Active)?;
        Ok(outcome)
    }

    /// Destroys the thread's session. A thread without one is already done.
    pub async fn destroy_session(&self, thread_id: &str) -> Result<LifecycleOutcome, LeaseError> {
        let _guard = self.thread_locks.lock(thread_id).await;
        match self.store.lease_for_thread(thread_id)? {
            Some(lease) => self.destroy_lease(&lease, "destroyed").await,
            None => Ok(LifecycleOutcome {
                success: true,
                converged: true,
                desired_state: DesiredState::Destroyed,
            }),
        }
    }

    /// Pauses every running lease. Used at shutdown.
    ///
    /// Leases whose instance is gone are archived. Leases whose status cannot
    /// be read are flagged for refresh and left alone. Per-lease failures are
    /// logged and skipped. Returns how many pauses were accepted.
    pub async fn pause_all_sessions(&self) -> usize {
        let leases = match self.store.active_leases() {
            Ok(leases) => leases,
            Err(e) => {
                error!("Cannot list leases for pause-all: {}", e);
                return 0;
            }
        };

        let mut paused = 0;
        for lease in leases {
            if lease.desired_state != DesiredState::Running {
                continue;
            }
            match self.pause_one(&lease).await {
                Ok(true) => paused += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to pause lease {}: {}", lease.lease_id, e),
            }
        }
        info!("Paused {} sessions", paused);
        paused
    }

    async fn pause_one(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let provider = self.provider_for(lease)?;
        let Some(instance_id) = lease.current_instance_id.as_deref() else {
            return Ok(false);
        };
        match provider.get_session_status(instance_id).await {
            SessionStatus::Deleted => {
                info!("Pruning lease {}: instance {} is gone", lease.lease_id, instance_id);
                self.purge(lease, "instance_deleted")?;
                Ok(false)
            }
            SessionStatus::Unknown => {
                warn!("Status of {} unknown, leaving lease {} for refresh", instance_id, lease.lease_id);
                self.store.mark_needs_refresh(&lease.lease_id)?;
                Ok(false)
            }
            SessionStatus::Paused | SessionStatus::Running => {
                let outcome = self.drive(lease, DesiredState::Paused).await?;
                self.store
                    .set_chat_sessions_for_lease(&lease.lease_id, SessionState::Paused)?;
                Ok(outcome.success)
            }
        }
    }

    /// Active leases with their thread and open chat session.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, LeaseError> {
        let mut sessions = Vec::new();
        for lease in self.store.active_leases()? {
            sessions.push(self.summarize(lease)?);
        }
        Ok(sessions)
    }

    /// The thread's active lease, if any. Never touches the provider.
    pub fn session(&self, thread_id: &str) -> Result<Option<SessionSummary>, LeaseError> {
        self.store
            .lease_for_thread(thread_id)?
            .map(|lease| self.summarize(lease))
            .transpose()
    }

    /// Re-reads provider truth for the thread's lease without acting on it.
    pub async fn refresh_session(&self, thread_id: &str) -> Result<SessionSummary, LeaseError> {
        let lease = self.require_lease(thread_id)?;
        let lease = self.reconciler.refresh(&lease.lease_id).await?;
        self.summarize(lease)
    }

    fn summarize(&self, lease: Lease) -> Result<SessionSummary, LeaseError> {
        let thread_id = lease.workspace_key.clone();
        let chat = match &thread_id {
            Some(thread_id) => self
                .store
                .open_chat_session(thread_id)?
                .filter(|c| c.lease_id == lease.lease_id),
            None => None,
        };
        Ok(SessionSummary {
            thread_id,
            lease,
            chat,
        })
    }

    /// Archives leases whose instance the provider reports deleted and flags
    /// the ones it cannot answer for.
    pub async fn cleanup_stale_sessions(&self) -> Result<CleanupReport, LeaseError> {
        let mut report = CleanupReport::default();
        for lease in self.store.active_leases()? {
            let Some(instance_id) = lease.current_instance_id.clone() else {
                continue;
            };
            let Some(provider) = self.providers.get(&lease.provider_name) else {
                warn!("Skipping lease {}: provider {} not enabled", lease.lease_id, lease.provider_name);
                continue;
            };
            report.checked += 1;
            let result = match provider.get_session_status(&instance_id).await {
                SessionStatus::Deleted => self.purge(&lease, "instance_deleted").map(|()| {
                    report.pruned += 1;
                }),
                SessionStatus::Unknown => self.store.mark_needs_refresh(&lease.lease_id).map_or_else(
                    |e| Err(e.into()),
                    |()| {
                        report.flagged += 1;
                        Ok(())
                    },
                ),
                SessionStatus::Running | SessionStatus::Paused => Ok(()),
            };
            if let Err(e) = result {
                error!("Cleanup of lease {} failed: {}", lease.lease_id, e);
            }
        }
        info!(
            "Cleanup checked {} leases: {} pruned, {} flagged",
            report.checked, report.pruned, report.flagged
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Reaper entry points (version-guarded)
    // ------------------------------------------------------------------

    /// Pauses an idle session unless the thread or a user call got there first.
    ///
    /// The chat is held at `idle` while the pause is in flight and only
    /// becomes `paused` once the provider confirms. If the pause fails or
    /// does not converge the chat goes back to `active`; the lease keeps
    /// `desired_state = paused` for [`Self::converge_pending`] to retry.
    pub async fn pause_idle(&self, chat: &ChatSession, lease: &Lease) -> Result<bool, LeaseError> {
        if !self
            .store
            .mark_idle_if_untouched(&chat.chat_session_id, chat.last_active_at)?
        {
            debug!("Session {} saw activity, not pausing", chat.chat_session_id);
            return Ok(false);
        }
        if lease.desired_state != DesiredState::Paused
            && !self.store.set_desired_state(
                &lease.lease_id,
                DesiredState::Paused,
                Some(lease.version),
            )?
        {
            debug!("Lease {} changed since scan, not pausing", lease.lease_id);
            self.store
                .set_chat_session_status(&chat.chat_session_id, SessionState::Active)?;
            return Ok(false);
        }

        let outcome = match self.reconciler.reconcile(&lease.lease_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store
                    .set_chat_session_status(&chat.chat_session_id, SessionState::Active)?;
                return Err(e);
            }
        };
        if !outcome.converged {
            debug!("Lease {} did not reach paused yet", lease.lease_id);
            self.store
                .set_chat_session_status(&chat.chat_session_id, SessionState::Active)?;
            return Ok(false);
        }
        self.store
            .set_chat_sessions_for_lease(&lease.lease_id, SessionState::Paused)?;
        Ok(true)
    }

    /// Destroys a session past its lifetime or budget, recording `reason`.
    pub async fn destroy_expired(
        &self,
        chat: &ChatSession,
        lease: &Lease,
        reason: &str,
    ) -> Result<bool, LeaseError> {
        let still_open = self
            .store
            .chat_session(&chat.chat_session_id)?
            .is_some_and(|c| c.ended_at.is_none());
        if !still_open {
            debug!("Session {} already ended", chat.chat_session_id);
            return Ok(false);
        }
        if lease.desired_state != DesiredState::Destroyed
            && !self.store.set_desired_state(
                &lease.lease_id,
                DesiredState::Destroyed,
                Some(lease.version),
            )?
        {
            debug!("Lease {} changed since scan, not destroying", lease.lease_id);
            return Ok(false);
        }
        // Chats stay open until the instance is really gone, so a failed
        // destroy is picked up again on the next scan
        let outcome = self.reconciler.reconcile(&lease.lease_id).await?;
        if !outcome.converged {
            return Ok(false);
        }
        self.store.end_chat_session(&chat.chat_session_id, reason)?;
        self.store.end_chat_sessions_for_lease(&lease.lease_id, reason)?;
        Ok(true)
    }

    /// Re-drives leases on `provider_name` whose last pass did not settle.
    ///
    /// A lease is pending when it still has a provider step to take or is
    /// flagged for refresh. Leases in `skip` were already handled this tick.
    /// Leases still waiting on their first instance are left to the caller
    /// that asked for them. Failures are logged per lease.
    pub async fn converge_pending(
        &self,
        provider_name: &str,
        skip: &HashSet<String>,
    ) -> ConvergeReport {
        let leases = match self.store.active_leases() {
            Ok(leases) => leases,
            Err(e) => {
                error!("Cannot list leases to converge on {}: {}", provider_name, e);
                return ConvergeReport::default();
            }
        };

        let mut report = ConvergeReport::default();
        for lease in leases {
            if lease.provider_name != provider_name
                || skip.contains(&lease.lease_id)
                || !is_pending(&lease)
            {
                continue;
            }
            report.pending += 1;
            debug!(
                "Re-driving lease {} (desired={}, observed={})",
                lease.lease_id, lease.desired_state, lease.observed_state
            );
            match self.converge_one(&lease).await {
                Ok(true) => report.converged += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Lease {} still not converged: {}", lease.lease_id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn converge_one(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let outcome = self.reconciler.reconcile(&lease.lease_id).await?;
        if !outcome.converged {
            return Ok(false);
        }
        match outcome.lease.desired_state {
            DesiredState::Paused => {
                self.store
                    .set_chat_sessions_for_lease(&lease.lease_id, SessionState::Paused)?;
            }
            DesiredState::Destroyed => {
                self.store
                    .end_chat_sessions_for_lease(&lease.lease_id, "destroyed")?;
            }
            DesiredState::Running => {}
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Tool calls
    // ------------------------------------------------------------------

    /// Runs a command in the thread's terminal and records it.
    ///
    /// Without `cwd` the command runs in the terminal's cwd and any `cd`
    /// sticks; an explicit `cwd` is a one-off.
    pub async fn execute(
        &self,
        thread_id: &str,
        command: &str,
        timeout_ms: u64,
        cwd: Option<&str>,
    ) -> Result<CommandOutcome, LeaseError> {
        let attached = self.attach(thread_id).await?;
        self.check_command_budget(&attached.chat)?;

        let terminal = &attached.terminal;
        let run_cwd = cwd.map_or_else(|| terminal.cwd.clone(), |c| join_path(&terminal.cwd, c));
        let command_id = self.store.create_command(
            &terminal.terminal_id,
            Some(&attached.chat.chat_session_id),
            command,
            &run_cwd,
        )?;
        self.store.start_command(&command_id)?;

        let script = wrap_command(command, &terminal.env_delta);
        let result = attached
            .provider
            .execute(&attached.instance_id, &script, timeout_ms, Some(&run_cwd))
            .await;
        self.store.touch_chat_session(&attached.chat.chat_session_id)?;

        let mut result = match result {
            Ok(result) => result,
            Err(e) => {
                self.store.finish_command(
                    &command_id,
                    CommandStatus::Failed,
                    None,
                    None,
                    Some(&e.to_string()),
                )?;
                return Err(e.into());
            }
        };

        let (stdout, new_cwd) = split_cwd_marker(&result.output);
        result.output = stdout;
        self.store.finish_command(
            &command_id,
            CommandStatus::Finished,
            Some(result.exit_code),
            Some(&result.output),
            result.error.as_deref(),
        )?;

        let mut final_cwd = terminal.cwd.clone();
        if let (None, Some(new_cwd)) = (cwd, new_cwd) {
            if new_cwd != terminal.cwd {
                if self.store.update_terminal_state(
                    &terminal.terminal_id,
                    terminal.state_version,
                    &new_cwd,
                    &terminal.env_delta,
                )? {
                    final_cwd = new_cwd;
                } else {
                    warn!("Terminal {} changed concurrently, cwd not updated", terminal.terminal_id);
                }
            }
        }

        Ok(CommandOutcome {
            command_id,
            cwd: final_cwd,
            result,
        })
    }

    /// Sets a variable exported before every later command on the terminal.
    pub async fn set_env(&self, thread_id: &str, key: &str, value: &str) -> Result<(), LeaseError> {
        if !is_env_name(key) {
            return Err(LeaseError::InvalidInput(format!(
                "'{key}' is not a valid environment variable name"
            )));
        }
        let attached = self.attach(thread_id).await?;
        let terminal_id = attached.terminal.terminal_id;
        for _ in 0..CAS_RETRIES {
            let terminal = self
                .store
                .terminal(&terminal_id)?
                .ok_or_else(|| StoreError::missing("terminal", terminal_id.clone()))?;
            let mut env = terminal.env_delta.clone();
            env.insert(key.to_string(), value.to_string());
            if self
                .store
                .update_terminal_state(&terminal_id, terminal.state_version, &terminal.cwd, &env)?
            {
                return Ok(());
            }
        }
        Err(LeaseError::Conflict(terminal_id))
    }

    pub async fn read_file(&self, thread_id: &str, path: &str) -> Result<Vec<u8>, LeaseError> {
        let attached = self.attach(thread_id).await?;
        let path = join_path(&attached.terminal.cwd, path);
        Ok(attached.provider.read_file(&attached.instance_id, &path).await?)
    }

    pub async fn write_file(
        &self,
        thread_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), LeaseError> {
        let attached = self.attach(thread_id).await?;
        let path = join_path(&attached.terminal.cwd, path);
        Ok(attached
            .provider
            .write_file(&attached.instance_id, &path, content)
            .await?)
    }

    pub async fn list_dir(&self, thread_id: &str, path: &str) -> Result<Vec<FileEntry>, LeaseError> {
        let attached = self.attach(thread_id).await?;
        let path = join_path(&attached.terminal.cwd, path);
        Ok(attached.provider.list_dir(&attached.instance_id, &path).await?)
    }

    /// Resource usage of the thread's instance, without waking it.
    pub async fn metrics(&self, thread_id: &str) -> Result<Option<Metrics>, LeaseError> {
        let lease = self.require_lease(thread_id)?;
        let Some(instance_id) = lease.current_instance_id.as_deref() else {
            return Ok(None);
        };
        Ok(self.provider_for(&lease)?.get_metrics(instance_id).await)
    }

    pub async fn processes(&self, thread_id: &str) -> Result<Option<Vec<ProcessInfo>>, LeaseError> {
        let lease = self.require_lease(thread_id)?;
        let Some(instance_id) = lease.current_instance_id.as_deref() else {
            return Ok(None);
        };
        Ok(self.provider_for(&lease)?.list_processes(instance_id).await)
    }

    /// Binds an existing provider instance to a thread that has no session.
    pub async fn adopt_instance(
        &self,
        thread_id: &str,
        provider_name: &str,
        instance_id: &str,
    ) -> Result<Lease, LeaseError> {
        let _guard = self.thread_locks.lock(thread_id).await;
        if self.store.lease_for_thread(thread_id)?.is_some() {
            return Err(LeaseError::Conflict(format!(
                "thread {thread_id} already has a session"
            )));
        }
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| LeaseError::UnknownProvider(provider_name.to_string()))?;
        let observed = ObservedState::from(provider.get_session_status(instance_id).await);

        let lease = self.store.create_lease(provider_name, Some(thread_id))?;
        self.store.set_instance(&lease.lease_id, None, Some(instance_id))?;
        self.store
            .write_observed_state(&lease.lease_id, lease.version + 1, observed, None)?;
        let desired = if observed == ObservedState::Paused {
            DesiredState::Paused
        } else {
            DesiredState::Running
        };
        self.store.set_desired_state(&lease.lease_id, desired, None)?;

        let terminal = self
            .store
            .create_terminal(thread_id, &lease.lease_id, provider.default_cwd())?;
        self.store.set_thread_pointer(thread_id, &terminal.terminal_id)?;
        self.store
            .create_chat_session(thread_id, &terminal.terminal_id, &lease.lease_id, &self.policy)?;
        info!("Adopted {} instance {} for thread {}", provider_name, instance_id, thread_id);

        Ok(self
            .store
            .lease(&lease.lease_id)?
            .ok_or_else(|| StoreError::missing("lease", lease.lease_id))?)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require_lease(&self, thread_id: &str) -> Result<Lease, LeaseError> {
        self.store
            .lease_for_thread(thread_id)?
            .ok_or_else(|| LeaseError::no_session(thread_id))
    }

    fn provider_for(&self, lease: &Lease) -> Result<Arc<dyn SandboxProvider>, LeaseError> {
        self.providers
            .get(&lease.provider_name)
            .ok_or_else(|| LeaseError::UnknownProvider(lease.provider_name.clone()))
    }

    async fn drive(&self, lease: &Lease, desired: DesiredState) -> Result<LifecycleOutcome, LeaseError> {
        self.store.set_desired_state(&lease.lease_id, desired, None)?;
        let outcome = self.reconciler.reconcile(&lease.lease_id).await?;
        Ok(LifecycleOutcome {
            success: true,
            converged: outcome.converged,
            desired_state: desired,
        })
    }

    async fn destroy_lease(&self, lease: &Lease, reason: &str) -> Result<LifecycleOutcome, LeaseError> {
        let outcome = self.drive(lease, DesiredState::Destroyed).await?;
        self.store.end_chat_sessions_for_lease(&lease.lease_id, reason)?;
        Ok(outcome)
    }

    /// Drops the lease from the ledger without touching the provider.
    fn purge(&self, lease: &Lease, reason: &str) -> Result<(), LeaseError> {
        self.store.archive_lease(&lease.lease_id)?;
        self.store.end_chat_sessions_for_lease(&lease.lease_id, reason)?;
        Ok(())
    }

    /// Resolves the thread's running session under the thread lock.
    async fn attach(&self, thread_id: &str) -> Result<Attached, LeaseError> {
        let _guard = self.thread_locks.lock(thread_id).await;
        let active = self.providers.active_name().to_string();

        let existing = match self.store.lease_for_thread(thread_id)? {
            Some(lease) if lease.provider_name != active => {
                info!(
                    "Thread {} moved from provider {} to {}, dropping lease {}",
                    thread_id, lease.provider_name, active, lease.lease_id
                );
                self.purge(&lease, "provider_switch")?;
                None
            }
            other => other,
        };

        let lease = match existing {
            Some(lease) => self.revive(lease).await?,
            None => self.provision(thread_id, &active).await?,
        };
        let provider = self.provider_for(&lease)?;
        let instance_id = lease
            .current_instance_id
            .clone()
            .ok_or_else(|| LeaseError::no_session(thread_id))?;

        let terminal = match self
            .store
            .active_terminal(thread_id)?
            .filter(|t| t.lease_id == lease.lease_id)
        {
            Some(terminal) => terminal,
            None => {
                let terminal =
                    self.store
                        .create_terminal(thread_id, &lease.lease_id, provider.default_cwd())?;
                self.store.set_thread_pointer(thread_id, &terminal.terminal_id)?;
                terminal
            }
        };

        let chat = match self.store.open_chat_session(thread_id)? {
            Some(chat) if chat.lease_id == lease.lease_id => {
                self.store.touch_chat_session(&chat.chat_session_id)?;
                chat
            }
            stale => {
                if let Some(chat) = stale {
                    self.store.end_chat_session(&chat.chat_session_id, "superseded")?;
                }
                self.store.create_chat_session(
                    thread_id,
                    &terminal.terminal_id,
                    &lease.lease_id,
                    &self.policy,
                )?
            }
        };

        Ok(Attached {
            lease,
            terminal,
            chat,
            provider,
            instance_id,
        })
    }

    async fn revive(&self, lease: Lease) -> Result<Lease, LeaseError> {
        if lease.desired_state == DesiredState::Running && lease.is_converged() && !lease.needs_refresh {
            return Ok(lease);
        }
        if lease.desired_state != DesiredState::Running {
            self.store
                .set_desired_state(&lease.lease_id, DesiredState::Running, None)?;
        }
        let outcome = self.reconciler.reconcile(&lease.lease_id).await?;
        require_running(outcome)
    }

    async fn provision(&self, thread_id: &str, provider_name: &str) -> Result<Lease, LeaseError> {
        let lease = match self.store.create_lease(provider_name, Some(thread_id)) {
            Ok(lease) => lease,
            Err(e) if e.is_conflict() => {
                // Another process created it, or the pointer was lost
                let existing = self
                    .store
                    .active_lease_for_workspace(thread_id)?
                    .ok_or_else(|| LeaseError::Conflict(format!("workspace {thread_id}")))?;
                if existing.provider_name == provider_name {
                    existing
                } else {
                    self.purge(&existing, "provider_switch")?;
                    self.store.create_lease(provider_name, Some(thread_id))?
                }
            }
            Err(e) => return Err(e.into()),
        };
        info!("Provisioning lease {} on {} for thread {}", lease.lease_id, provider_name, thread_id);

        let provider = self.provider_for(&lease)?;
        let has_terminal = self
            .store
            .active_terminal(thread_id)?
            .is_some_and(|t| t.lease_id == lease.lease_id);
        if !has_terminal {
            let terminal = self
                .store
                .create_terminal(thread_id, &lease.lease_id, provider.default_cwd())?;
            self.store.set_thread_pointer(thread_id, &terminal.terminal_id)?;
        }

        let outcome = self.reconciler.reconcile(&lease.lease_id).await?;
        require_running(outcome)
    }

    fn check_command_budget(&self, chat: &ChatSession) -> Result<(), LeaseError> {
        let Some(max) = chat.budget.as_ref().and_then(|b| b.max_commands) else {
            return Ok(());
        };
        let used = self.store.command_count(&chat.chat_session_id)?;
        if used >= max {
            return Err(LeaseError::BudgetExhausted {
                chat_session_id: chat.chat_session_id.clone(),
                detail: format!("{used} of {max} commands used"),
            });
        }
        Ok(())
    }
}

fn is_pending(lease: &Lease) -> bool {
    let awaiting_first_instance =
        lease.desired_state == DesiredState::Running && lease.current_instance_id.is_none();
    !awaiting_first_instance && (lease.needs_refresh || plan(lease) != Transition::None)
}

fn require_running(outcome: ReconcileOutcome) -> Result<Lease, LeaseError> {
    if outcome.converged && outcome.lease.observed_state == ObservedState::Running {
        return Ok(outcome.lease);
    }
    Err(LeaseError::NotConverged {
        lease_id: outcome.lease.lease_id.clone(),
        desired: DesiredState::Running,
        detail: outcome
            .lease
            .last_error
            .unwrap_or_else(|| format!("observed {}", outcome.lease.observed_state)),
    })
}

/// Resolves `path` against a terminal cwd.
fn join_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() || path == "." {
        cwd.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Wraps a command so it runs with the terminal env and reports its final cwd.
///
/// Backends that run inside a host directory export `LEASEHOLD_WORKSPACE`,
/// which is stripped so the reported cwd is relative to the sandbox root.
fn wrap_command(command: &str, env: &BTreeMap<String, String>) -> String {
    let mut script = String::new();
    for (key, value) in env {
        script.push_str("export ");
        script.push_str(key);
        script.push('=');
        script.push_str(&shell_words::quote(value));
        script.push('\n');
    }
    script.push_str(command);
    script.push('\n');
    script.push_str("__lh_status=$?\n__lh_pwd=$(pwd)\n");
    script.push_str("__lh_pwd=${__lh_pwd#\"${LEASEHOLD_WORKSPACE:-}\"}\n");
    script.push_str("printf '\\n%s%s\\n' '");
    script.push_str(CWD_MARKER);
    script.push_str("' \"${__lh_pwd:-/}\"\nexit $__lh_status\n");
    script
}

/// Splits command output into the user's stdout and the reported cwd.
fn split_cwd_marker(output: &str) -> (String, Option<String>) {
    let needle = format!("\n{CWD_MARKER}");
    match output.rfind(&needle) {
        Some(idx) => {
            let cwd = output[idx + needle.len()..]
                .lines()
                .next()
                .unwrap_or_default()
                .trim();
            (
                output[..idx].to_string(),
                (!cwd.is_empty()).then(|| cwd.to_string()),
            )
        }
        None => (output.to_string(), None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use crate::reconcile::tests::fast_config;
    use crate::sandbox::mock::MockProvider;
    use crate::sandbox::LocalProvider;
    use crate::store::LeaseStatus;
    use std::sync::atomic::Ordering;

    pub(crate) fn manager_with(store: Store, providers: Vec<Arc<dyn SandboxProvider>>, active: &str) -> SandboxManager {
        let mut config = Config::default();
        config.reconcile = fast_config();
        let registry = ProviderRegistry::new(providers, Some(active)).unwrap();
        SandboxManager::new(store, registry, &config)
    }

    pub(crate) fn mock_manager() -> (SandboxManager, MockProvider) {
        let mock = MockProvider::new("mock");
        let manager = manager_with(Store::open_in_memory().unwrap(), vec![Arc::new(mock.clone())], "mock");
        (manager, mock)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let (manager, mock) = mock_manager();
        let first = manager.get_or_create_session("t1").await.unwrap();
        let second = manager.get_or_create_session("t1").await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.status, SessionStatus::Running);
        assert_eq!(mock.creates.load(Ordering::SeqCst), 1);

        let pointer = manager.store().thread_pointer("t1").unwrap().unwrap();
        assert_eq!(pointer.active_terminal_id, pointer.default_terminal_id);
        let chat = manager.store().open_chat_session("t1").unwrap().unwrap();
        assert_eq!(chat.status, SessionState::Active);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_provisions_once() {
        let (manager, mock) = mock_manager();
        mock.set_create_delay(std::time::Duration::from_millis(30));
        let (a, b, c) = tokio::join!(
            manager.get_or_create_session("t1"),
            manager.get_or_create_session("t1"),
            manager.get_or_create_session("t1"),
        );
        let a = a.unwrap();
        assert_eq!(a.session_id, b.unwrap().session_id);
        assert_eq!(a.session_id, c.unwrap().session_id);
        assert_eq!(mock.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_two_managers_on_one_store_provision_once() {
        let store = Store::open_in_memory().unwrap();
        let mock = MockProvider::new("mock");
        mock.set_create_delay(std::time::Duration::from_millis(50));
        let first = manager_with(store.clone(), vec![Arc::new(mock.clone())], "mock");
        let second = manager_with(store.clone(), vec![Arc::new(mock.clone())], "mock");

        let (a, b) = tokio::join!(
            first.get_or_create_session("t1"),
            second.get_or_create_session("t1"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(mock.creates.load(Ordering::SeqCst), 1);
        assert_eq!(mock.instance_count(), 1);

        let live: Vec<Lease> = store
            .active_leases()
            .unwrap()
            .into_iter()
            .filter(|l| l.current_instance_id.is_some())
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].current_instance_id.as_deref(), Some(a.session_id.as_str()));
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip_keeps_instance() {
        let (manager, mock) = mock_manager();
        let created = manager.get_or_create_session("t1").await.unwrap();

        let paused = manager.pause_session("t1").await.unwrap();
        assert!(paused.success && paused.converged);
        assert_eq!(paused.desired_state, DesiredState::Paused);
        let chat = manager.store().open_chat_session("t1").unwrap().unwrap();
        assert_eq!(chat.status, SessionState::Paused);

        let resumed = manager.resume_session("t1").await.unwrap();
        assert!(resumed.converged);
        let lease = manager.store().lease_for_thread("t1").unwrap().unwrap();
        assert_eq!(lease.observed_state, ObservedState::Running);
        assert_eq!(lease.current_instance_id.as_deref(), Some(created.session_id.as_str()));
        assert_eq!(mock.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_resumes_paused_session() {
        let (manager, mock) = mock_manager();
        let created = manager.get_or_create_session("t1").await.unwrap();
        manager.pause_session("t1").await.unwrap();

        let again = manager.get_or_create_session("t1").await.unwrap();
        assert_eq!(again.session_id, created.session_id);
        assert_eq!(mock.resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_without_support_is_accepted_not_converged() {
        let (manager, mock) = mock_manager();
        manager.get_or_create_session("t1").await.unwrap();
        mock.set_pause_supported(false);

        let outcome = manager.pause_session("t1").await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.converged);
    }

    #[tokio::test]
    async fn test_resume_timeout_surfaces_not_converged() {
        let (manager, mock) = mock_manager();
        manager.get_or_create_session("t1").await.unwrap();
        manager.pause_session("t1").await.unwrap();

        mock.set_lag(50);
        let err = manager.get_or_create_session("t1").await.unwrap_err();
        assert!(err.is_not_converged());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (manager, mock) = mock_manager();
        manager.get_or_create_session("t1").await.unwrap();
        let lease_id = manager.store().lease_for_thread("t1").unwrap().unwrap().lease_id;

        let first = manager.destroy_session("t1").await.unwrap();
        assert!(first.success && first.converged);
        let second = manager.destroy_session("t1").await.unwrap();
        assert!(second.success);
        assert_eq!(second.desired_state, DesiredState::Destroyed);

        let lease = manager.store().lease(&lease_id).unwrap().unwrap();
        assert_eq!(lease.desired_state, DesiredState::Destroyed);
        assert_eq!(lease.status, LeaseStatus::Archived);
        assert_eq!(mock.instance_count(), 0);
        assert!(manager.store().open_chat_session("t1").unwrap().is_none());

        // A new call starts over with a fresh instance
        manager.get_or_create_session("t1").await.unwrap();
        assert_eq!(mock.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_switch_purges_old_lease() {
        let store = Store::open_in_memory().unwrap();
        let alpha = MockProvider::new("alpha");
        let beta = MockProvider::new("beta");
        let providers: Vec<Arc<dyn SandboxProvider>> =
            vec![Arc::new(alpha.clone()), Arc::new(beta.clone())];

        let on_alpha = manager_with(store.clone(), providers.clone(), "alpha");
        on_alpha.get_or_create_session("t1").await.unwrap();
        let old = store.lease_for_thread("t1").unwrap().unwrap();

        let on_beta = manager_with(store.clone(), providers, "beta");
        let info = on_beta.get_or_create_session("t1").await.unwrap();
        assert_eq!(info.provider, "beta");

        let old = store.lease(&old.lease_id).unwrap().unwrap();
        assert_eq!(old.status, LeaseStatus::Archived);
        assert_eq!(beta.creates.load(Ordering::SeqCst), 1);
        assert_eq!(
            store
                .chat_sessions_in(&[SessionState::Ended])
                .unwrap()[0]
                .close_reason
                .as_deref(),
            Some("provider_switch")
        );
    }

    #[tokio::test]
    async fn test_vanished_paused_instance_is_replaced() {
        let (manager, mock) = mock_manager();
        let created = manager.get_or_create_session("t1").await.unwrap();
        manager.pause_session("t1").await.unwrap();
        mock.vanish(&created.session_id);

        let replaced = manager.get_or_create_session("t1").await.unwrap();
        assert_ne!(replaced.session_id, created.session_id);
        assert_eq!(mock.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pause_all_prunes_deleted_and_continues() {
        let (manager, mock) = mock_manager();
        manager.get_or_create_session("t1").await.unwrap();
        manager.get_or_create_session("t2").await.unwrap();
        let gone = manager.get_or_create_session("t3").await.unwrap();
        mock.vanish(&gone.session_id);

        assert_eq!(manager.pause_all_sessions().await, 2);
        assert!(manager.store().lease_for_thread("t3").unwrap().is_none());
        let lease = manager.store().lease_for_thread("t1").unwrap().unwrap();
        assert_eq!(lease.observed_state, ObservedState::Paused);
    }

    #[tokio::test]
    async fn test_pause_all_never_prunes_unknown() {
        let (manager, mock) = mock_manager();
        manager.get_or_create_session("t1").await.unwrap();
        mock.set_status_unknown(true);

        assert_eq!(manager.pause_all_sessions().await, 0);
        let lease = manager.store().lease_for_thread("t1").unwrap().unwrap();
        assert_eq!(lease.status, LeaseStatus::Active);
        assert!(lease.needs_refresh);
    }

    #[tokio::test]
    async fn test_pause_all_survives_provider_errors() {
        let (manager, mock) = mock_manager();
        manager.get_or_create_session("t1").await.unwrap();
        manager.get_or_create_session("t2").await.unwrap();
        mock.set_fail_pause(true);

        assert_eq!(manager.pause_all_sessions().await, 0);
        assert_eq!(mock.pauses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_prunes_deleted_flags_unknown() {
        let (manager, mock) = mock_manager();
        let gone = manager.get_or_create_session("t1").await.unwrap();
        manager.get_or_create_session("t2").await.unwrap();
        mock.vanish(&gone.session_id);

        let report = manager.cleanup_stale_sessions().await.unwrap();
        assert_eq!(report, CleanupReport { checked: 2, pruned: 1, flagged: 0 });
        assert_eq!(manager.list_sessions().unwrap().len(), 1);

        mock.set_status_unknown(true);
        let report = manager.cleanup_stale_sessions().await.unwrap();
        assert_eq!(report, CleanupReport { checked: 1, pruned: 0, flagged: 1 });
        assert_eq!(manager.list_sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_session_observes_without_acting() {
        let (manager, mock) = mock_manager();
        let info = manager.get_or_create_session("t1").await.unwrap();
        mock.vanish(&info.session_id);

        let summary = manager.refresh_session("t1").await.unwrap();
        assert_eq!(summary.lease.observed_state, ObservedState::Destroyed);
        assert_eq!(summary.lease.desired_state, DesiredState::Running);
        assert_eq!(mock.creates.load(Ordering::SeqCst), 1);

        let err = manager.refresh_session("nobody").await.unwrap_err();
        assert!(matches!(err, LeaseError::NoSession { .. }));
    }

    #[tokio::test]
    async fn test_execute_records_command_and_tracks_cwd() {
        let (manager, mock) = mock_manager();
        mock.set_exec_output(&format!("built\n\n{CWD_MARKER}/src\n"));

        let outcome = manager.execute("t1", "cd src && make", 1_000, None).await.unwrap();
        assert_eq!(outcome.result.output, "built\n");
        assert_eq!(outcome.cwd, "/src");

        let terminal = manager.store().active_terminal("t1").unwrap().unwrap();
        assert_eq!(terminal.cwd, "/src");
        let command = manager.store().command(&outcome.command_id).unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Finished);
        assert_eq!(command.command_line, "cd src && make");
        assert_eq!(command.cwd, "/");

        let sent = mock.executions.lock().unwrap().last().cloned().unwrap();
        assert!(sent.contains("cd src && make"));
        assert!(sent.contains(CWD_MARKER));
    }

    #[tokio::test]
    async fn test_execute_rejects_when_budget_spent() {
        let mock = MockProvider::new("mock");
        let mut config = Config::default();
        config.reconcile = fast_config();
        config.session.max_commands = Some(1);
        let registry = ProviderRegistry::new(vec![Arc::new(mock.clone())], None).unwrap();
        let manager = SandboxManager::new(Store::open_in_memory().unwrap(), registry, &config);

        manager.execute("t1", "true", 1_000, None).await.unwrap();
        let err = manager.execute("t1", "true", 1_000, None).await.unwrap_err();
        assert!(matches!(err, LeaseError::BudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_set_env_rejects_bad_names() {
        let (manager, _mock) = mock_manager();
        let err = manager.set_env("t1", "1BAD", "x").await.unwrap_err();
        assert!(matches!(err, LeaseError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_file_ops_resolve_against_cwd() {
        let (manager, mock) = mock_manager();
        mock.set_exec_output(&format!("\n{CWD_MARKER}/work\n"));
        manager.execute("t1", "cd /work", 1_000, None).await.unwrap();

        manager.write_file("t1", "notes.txt", b"hi").await.unwrap();
        assert_eq!(manager.read_file("t1", "/work/notes.txt").await.unwrap(), b"hi");
        let entries = manager.list_dir("t1", ".").await.unwrap();
        assert_eq!(entries[0].name, "notes.txt");
    }

    #[tokio::test]
    async fn test_local_terminal_state_persists_between_commands() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalProvider::new(LocalConfig {
            root: dir.path().display().to_string(),
            max_timeout_secs: 10,
        })
        .unwrap();
        let manager = manager_with(Store::open_in_memory().unwrap(), vec![Arc::new(local)], "local");

        let outcome = manager
            .execute("t1", "mkdir -p src && cd src", 5_000, None)
            .await
            .unwrap();
        assert_eq!(outcome.result.exit_code, 0);
        assert_eq!(outcome.cwd, "/src");

        manager.set_env("t1", "GREETING", "hello world").await.unwrap();
        let outcome = manager
            .execute("t1", "echo \"$GREETING\" > out.txt && cat out.txt", 5_000, None)
            .await
            .unwrap();
        assert_eq!(outcome.result.output, "hello world\n");
        assert_eq!(manager.read_file("t1", "out.txt").await.unwrap(), b"hello world\n");

        let outcome = manager.execute("t1", "exit 3", 5_000, None).await.unwrap();
        assert_eq!(outcome.result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_adopt_instance() {
        let (manager, mock) = mock_manager();
        let orphan = mock.spawn_unmanaged();

        let lease = manager.adopt_instance("t9", "mock", &orphan).await.unwrap();
        assert_eq!(lease.current_instance_id.as_deref(), Some(orphan.as_str()));
        assert_eq!(lease.observed_state, ObservedState::Running);

        let info = manager.get_or_create_session("t9").await.unwrap();
        assert_eq!(info.session_id, orphan);
        assert_eq!(mock.creates.load(Ordering::SeqCst), 0);

        let err = manager.adopt_instance("t9", "mock", &orphan).await.unwrap_err();
        assert!(matches!(err, LeaseError::Conflict(_)));
    }

    #[test]
    fn test_split_cwd_marker() {
        let (out, cwd) = split_cwd_marker(&format!("a\nb\n\n{CWD_MARKER}/x/y\n"));
        assert_eq!(out, "a\nb\n");
        assert_eq!(cwd.as_deref(), Some("/x/y"));

        let (out, cwd) = split_cwd_marker("no marker here");
        assert_eq!(out, "no marker here");
        assert!(cwd.is_none());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/workspace", "a.txt"), "/workspace/a.txt");
        assert_eq!(join_path("/workspace/", "/etc/hosts"), "/etc/hosts");
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/w", "."), "/w");
    }

    #[test]
    fn test_wrap_command_quotes_env() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "it's".to_string());
        let script = wrap_command("echo $A", &env);
        assert!(script.starts_with("export A='it'\\''s'\necho $A\n"));
        assert!(script.ends_with("exit $__lh_status\n"));
    }

    #[test]
    fn test_env_names() {
        assert!(is_env_name("PATH"));
        assert!(is_env_name("_x1"));
        assert!(!is_env_name("1x"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
    }
}
