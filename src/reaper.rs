//! Idle reaper: pauses idle sessions and destroys expired ones.
//!
//! Every provider gets its own loop and ticker, so one slow backend cannot
//! hold up the rest. A tick loads the provider's open chat sessions, decides
//! what (if anything) to do with each, acts through the manager, then
//! re-drives any lease on that provider whose earlier pass did not settle.
//! Every write the reaper makes is version-guarded, so a user call that
//! touched the lease since the scan always wins.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::manager::SandboxManager;
use crate::notifications::{NotificationDetails, NotificationEvent, Notifier};
use crate::store::{ChatSession, DesiredState, Lease, LeaseStatus, SessionState};

pub(crate) const REASON_MAX_DURATION: &str = "max_duration";
pub(crate) const REASON_BUDGET: &str = "budget_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReapAction {
    Pause,
    Destroy(&'static str),
}

/// What the reaper should do with `chat` at `now`.
///
/// Lifetime and budget limits apply to every open session; the idle timeout
/// only to active ones. Non-positive limits are disabled.
pub(crate) fn reap_decision(chat: &ChatSession, now: DateTime<Utc>) -> Option<ReapAction> {
    if chat.status == SessionState::Ended {
        return None;
    }
    let age = (now - chat.started_at).num_seconds();
    if chat.max_duration_sec > 0 && age >= chat.max_duration_sec {
        return Some(ReapAction::Destroy(REASON_MAX_DURATION));
    }
    let wall_clock = chat.budget.as_ref().and_then(|b| b.max_wall_clock_sec);
    if let Some(limit) = wall_clock {
        if age >= i64::try_from(limit).unwrap_or(i64::MAX) {
            return Some(ReapAction::Destroy(REASON_BUDGET));
        }
    }
    let idle = (now - chat.last_active_at).num_seconds();
    if chat.status == SessionState::Active && chat.idle_ttl_sec > 0 && idle >= chat.idle_ttl_sec {
        return Some(ReapAction::Pause);
    }
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ReapReport {
    pub paused: usize,
    pub destroyed: usize,
    /// Skipped because a concurrent call changed the lease first.
    pub skipped: usize,
    pub failed: usize,
    /// Leases from earlier unsettled passes that reached their target.
    pub converged: usize,
}

impl ReapReport {
    fn merge(mut self, other: Self) -> Self {
        self.paused += other.paused;
        self.destroyed += other.destroyed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.converged += other.converged;
        self
    }

    pub fn acted(&self) -> bool {
        self.paused + self.destroyed > 0
    }
}

struct Candidate {
    chat: ChatSession,
    lease: Lease,
    action: ReapAction,
}

#[derive(Debug, Clone)]
pub(crate) struct IdleReaper {
    manager: SandboxManager,
    notifier: Notifier,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(manager: SandboxManager, notifier: Notifier, interval: Duration) -> Self {
        Self {
            manager,
            notifier,
            interval,
        }
    }

    /// One pass over every provider. Per-session failures are logged and counted.
    pub async fn scan(&self) -> ReapReport {
        let names = self.manager.providers().names();
        join_all(names.iter().map(|name| self.scan_provider(name)))
            .await
            .into_iter()
            .fold(ReapReport::default(), ReapReport::merge)
    }

    /// One pass over a single provider's sessions and unsettled leases.
    pub async fn scan_provider(&self, provider: &str) -> ReapReport {
        let candidates = match self.candidates(Utc::now()) {
            Ok(mut groups) => groups.remove(provider).unwrap_or_default(),
            Err(e) => {
                error!("Reaper cannot load sessions for {}: {}", provider, e);
                Vec::new()
            }
        };
        let handled: HashSet<String> = candidates.iter().map(|c| c.lease.lease_id.clone()).collect();

        let mut report = if candidates.is_empty() {
            ReapReport::default()
        } else {
            self.reap_provider(provider, candidates).await
        };

        let pending = self.manager.converge_pending(provider, &handled).await;
        report.converged += pending.converged;
        report.failed += pending.failed;
        if pending.pending > 0 {
            debug!(
                "Re-drove {} leases on {} ({} converged, {} failed)",
                pending.pending, provider, pending.converged, pending.failed
            );
        }

        if report.acted() || report.converged > 0 {
            info!(
                "Reaper on {} paused {}, destroyed {} and settled {} ({} skipped, {} failed)",
                provider, report.paused, report.destroyed, report.converged, report.skipped, report.failed
            );
        }
        report
    }

    fn candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Vec<Candidate>>, crate::store::StoreError> {
        let store = self.manager.store();
        let open = store.chat_sessions_in(&[
            SessionState::Active,
            SessionState::Idle,
            SessionState::Paused,
        ])?;

        let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for chat in open {
            let Some(action) = reap_decision(&chat, now) else {
                continue;
            };
            let Some(lease) = store.lease(&chat.lease_id)? else {
                continue;
            };
            if lease.status == LeaseStatus::Archived {
                // Lease is gone; close the stray session record
                store.end_chat_session(&chat.chat_session_id, "lease_archived")?;
                continue;
            }
            if action == ReapAction::Pause && lease.desired_state != DesiredState::Running {
                continue;
            }
            groups
                .entry(lease.provider_name.clone())
                .or_default()
                .push(Candidate {
                    chat,
                    lease,
                    action,
                });
        }
        Ok(groups)
    }

    async fn reap_provider(&self, provider: &str, candidates: Vec<Candidate>) -> ReapReport {
        debug!("Reaping {} sessions on {}", candidates.len(), provider);
        let mut report = ReapReport::default();
        for Candidate {
            chat,
            lease,
            action,
        } in candidates
        {
            let result = match action {
                ReapAction::Pause => self.manager.pause_idle(&chat, &lease).await,
                ReapAction::Destroy(reason) => {
                    self.manager.destroy_expired(&chat, &lease, reason).await
                }
            };
            match (action, result) {
                (ReapAction::Pause, Ok(true)) => {
                    info!("Paused idle session {} (lease {})", chat.chat_session_id, lease.lease_id);
                    report.paused += 1;
                }
                (ReapAction::Destroy(reason), Ok(true)) => {
                    info!(
                        "Destroyed session {} (lease {}): {}",
                        chat.chat_session_id, lease.lease_id, reason
                    );
                    report.destroyed += 1;
                }
                (_, Ok(false)) => report.skipped += 1,
                (_, Err(e)) => {
                    error!("Reaping session {} failed: {}", chat.chat_session_id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Runs one loop per provider until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let names = self.manager.providers().names();
        info!(
            "Idle reaper running every {:?} for {}",
            self.interval,
            names.join(", ")
        );
        let mut loops = JoinSet::new();
        for name in names {
            let reaper = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { reaper.run_provider(name, shutdown).await });
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                warn!("Reaper loop ended abnormally: {}", e);
            }
        }
        info!("Idle reaper stopped");
    }

    async fn run_provider(&self, provider: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.scan_provider(&provider).await;
                    if report.acted() {
                        let details = NotificationDetails::reaped(report.paused, report.destroyed);
                        self.notifier.notify(NotificationEvent::Reaped, &details).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Reaper loop for {} stopped", provider);
    }
}
