//! Drives a lease's observed state toward its desired state.
//!
//! `plan` is the single transition function; `Reconciler::reconcile` applies
//! it against the lease's provider and polls for convergence. Passes on the
//! same lease are serialized by a per-lease async lock, so a second caller
//! waits for the in-flight pass and then finds the lease already converged
//! instead of issuing a duplicate provider call.
//!
//! Across processes the same guarantee comes from a claim stored on the lease
//! row: a pass holds `reconcile_owner` until it finishes or the claim expires.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::error::LeaseError;
use crate::sandbox::{ProviderRegistry, SandboxProvider};
use crate::store::{DesiredState, Lease, LeaseStatus, ObservedState, Store, StoreError};

/// Re-plans allowed in one pass when desired state moves underneath it.
const MAX_STEPS: usize = 3;
/// Version compare-and-swap retries before giving up on a write.
const CAS_RETRIES: usize = 5;

/// Provider call needed to move a lease one step toward its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    None,
    Create,
    Resume,
    Pause,
    Destroy,
}

/// Pure transition function over a lease row.
pub(crate) fn plan(lease: &Lease) -> Transition {
    if lease.status == LeaseStatus::Archived {
        return Transition::None;
    }
    let has_instance = lease.current_instance_id.is_some();
    match (lease.desired_state, lease.observed_state) {
        (DesiredState::Destroyed, _) => Transition::Destroy,
        (DesiredState::Running, _) if !has_instance => Transition::Create,
        (DesiredState::Running, ObservedState::Destroyed) => Transition::Create,
        (DesiredState::Running, ObservedState::Paused | ObservedState::Unknown) => {
            Transition::Resume
        }
        (DesiredState::Paused, ObservedState::Running | ObservedState::Unknown) if has_instance => {
            Transition::Pause
        }
        _ => Transition::None,
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ReconcileOutcome {
    pub lease: Lease,
    pub converged: bool,
}

impl ReconcileOutcome {
    fn from_lease(lease: Lease) -> Self {
        let converged = lease.is_converged()
            || (lease.desired_state == DesiredState::Destroyed
                && lease.status == LeaseStatus::Archived);
        Self { lease, converged }
    }
}

/// Async mutexes keyed by string, created on demand.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        mutex.lock_owned().await
    }
}

/// Slack on top of the worst-case pass length before a claim is considered
/// abandoned by a crashed holder.
const CLAIM_SLACK: Duration = Duration::from_secs(120);
/// Floor on how often a waiting process retries a held claim.
const CLAIM_RETRY_MIN: Duration = Duration::from_millis(10);

/// Cross-process hold on a lease row. Released on drop.
struct LeaseClaim<'a> {
    store: &'a Store,
    lease_id: String,
    owner: &'a str,
}

impl Drop for LeaseClaim<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lease_claim(&self.lease_id, self.owner) {
            warn!("Failed to release claim on lease {}: {}", self.lease_id, e);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Reconciler {
    store: Store,
    providers: ProviderRegistry,
    poll_attempts: u32,
    poll_interval: Duration,
    locks: KeyedLocks,
    owner: String,
}

impl Reconciler {
    pub fn new(store: Store, providers: ProviderRegistry, config: &ReconcileConfig) -> Self {
        Self {
            store,
            providers,
            poll_attempts: config.poll_attempts.max(1),
            poll_interval: config.poll_interval(),
            locks: KeyedLocks::default(),
            owner: format!("reconciler-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Longest a single pass may hold its claim.
    fn claim_ttl(&self) -> Duration {
        let polls = self.poll_interval * self.poll_attempts;
        polls * u32::try_from(MAX_STEPS + 1).unwrap_or(u32::MAX) + CLAIM_SLACK
    }

    /// Waits for the lease's cross-process claim.
    async fn claim(&self, lease_id: &str) -> Result<LeaseClaim<'_>, LeaseError> {
        let ttl = self.claim_ttl();
        let deadline = Instant::now() + ttl;
        let retry = self.poll_interval.max(CLAIM_RETRY_MIN);
        loop {
            if self.store.try_claim_lease(lease_id, &self.owner, ttl)? {
                return Ok(LeaseClaim {
                    store: &self.store,
                    lease_id: lease_id.to_string(),
                    owner: &self.owner,
                });
            }
            if Instant::now() >= deadline {
                return Err(LeaseError::Conflict(format!(
                    "{lease_id} is held by another reconciler"
                )));
            }
            debug!("Lease {} is being reconciled elsewhere, waiting", lease_id);
            tokio::time::sleep(retry).await;
        }
    }

    /// Runs one pass on the lease and reports where it ended up.
    ///
    /// A convergence timeout is not an error: the lease is left with
    /// `observed_state = unknown` and `last_error` set, and the outcome says
    /// `converged = false`. Provider failures are recorded on the lease and
    /// returned.
    pub async fn reconcile(&self, lease_id: &str) -> Result<ReconcileOutcome, LeaseError> {
        let _guard = self.locks.lock(lease_id).await;
        let lease = self.load(lease_id)?;
        if lease.status == LeaseStatus::Archived {
            return Ok(ReconcileOutcome::from_lease(lease));
        }
        let _claim = self.claim(lease_id).await?;
        // Reload: another process may have moved the lease while we waited
        let mut lease = self.load(lease_id)?;
        if lease.status == LeaseStatus::Archived {
            return Ok(ReconcileOutcome::from_lease(lease));
        }
        let provider = self.provider_for(&lease)?;

        if lease.needs_refresh || lease.observed_state == ObservedState::Unknown {
            lease = self.observe_provider(&*provider, lease).await?;
        }

        for _ in 0..MAX_STEPS {
            let transition = plan(&lease);
            if transition == Transition::None {
                break;
            }
            debug!(
                "Lease {}: {:?} (desired={}, observed={})",
                lease.lease_id, transition, lease.desired_state, lease.observed_state
            );
            let (next, settled) = self.apply(&*provider, lease, transition).await?;
            lease = next;
            if !settled {
                break;
            }
        }

        Ok(ReconcileOutcome::from_lease(lease))
    }

    /// Re-reads provider truth for the lease without acting on it.
    pub async fn refresh(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        let _guard = self.locks.lock(lease_id).await;
        let _claim = self.claim(lease_id).await?;
        let lease = self.load(lease_id)?;
        if lease.status == LeaseStatus::Archived {
            return Ok(lease);
        }
        let provider = self.provider_for(&lease)?;
        self.observe_provider(&*provider, lease).await
    }

    fn provider_for(&self, lease: &Lease) -> Result<Arc<dyn SandboxProvider>, LeaseError> {
        self.providers
            .get(&lease.provider_name)
            .ok_or_else(|| LeaseError::UnknownProvider(lease.provider_name.clone()))
    }

    fn load(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        Ok(self
            .store
            .lease(lease_id)?
            .ok_or_else(|| StoreError::missing("lease", lease_id))?)
    }

    /// Retries a version-checked write against freshly loaded rows.
    fn write_versioned<F>(&self, lease_id: &str, write: F) -> Result<Lease, LeaseError>
    where
        F: Fn(&Lease) -> Result<bool, StoreError>,
    {
        for _ in 0..CAS_RETRIES {
            let lease = self.load(lease_id)?;
            if write(&lease)? {
                return self.load(lease_id);
            }
        }
        Err(LeaseError::Conflict(lease_id.to_string()))
    }

    fn write_observed(
        &self,
        lease_id: &str,
        observed: ObservedState,
        last_error: Option<&str>,
    ) -> Result<Lease, LeaseError> {
        self.write_versioned(lease_id, |lease| {
            self.store
                .write_observed_state(lease_id, lease.version, observed, last_error)
        })
    }

    async fn observe_provider(
        &self,
        provider: &dyn SandboxProvider,
        lease: Lease,
    ) -> Result<Lease, LeaseError> {
        let Some(instance_id) = lease.current_instance_id.as_deref() else {
            return Ok(lease);
        };
        let observed = ObservedState::from(provider.get_session_status(instance_id).await);
        let last_error = lease.last_error.clone();
        self.write_observed(&lease.lease_id, observed, last_error.as_deref())
    }

    /// Performs one transition. Returns the reloaded lease and whether it
    /// settled; `false` means polling gave up.
    async fn apply(
        &self,
        provider: &dyn SandboxProvider,
        lease: Lease,
        transition: Transition,
    ) -> Result<(Lease, bool), LeaseError> {
        let lease_id = lease.lease_id.clone();
        // Left set if this pass is interrupted before it observes anything
        self.store.mark_needs_refresh(&lease_id)?;

        match transition {
            Transition::None => Ok((lease, true)),
            Transition::Create => {
                if let Some(old) = &lease.current_instance_id {
                    info!("Lease {}: instance {} is gone, provisioning a replacement", lease_id, old);
                }
                let info = match provider.create_session(lease.workspace_key.as_deref()).await {
                    Ok(info) => info,
                    Err(e) => return Err(self.fail(&lease_id, e.into())),
                };
                info!("Lease {}: created instance {}", lease_id, info.session_id);
                let expected = lease.current_instance_id.as_deref();
                if self
                    .store
                    .set_instance(&lease_id, expected, Some(&info.session_id))?
                {
                    return self
                        .converge(provider, &lease_id, &info.session_id, ObservedState::Running)
                        .await;
                }

                // Someone else attached an instance first: keep theirs
                warn!(
                    "Lease {}: lost instance race, discarding {}",
                    lease_id, info.session_id
                );
                if let Err(e) = provider.destroy_session(&info.session_id, true).await {
                    warn!("Failed to discard instance {}: {}", info.session_id, e);
                }
                let current = self.load(&lease_id)?;
                match current.current_instance_id.clone() {
                    Some(winner) if current.status == LeaseStatus::Active => {
                        self.converge(provider, &lease_id, &winner, ObservedState::Running)
                            .await
                    }
                    _ => Ok((current, false)),
                }
            }
            Transition::Resume => {
                let instance_id = instance_of(&lease)?;
                match provider.resume_session(&instance_id).await {
                    Ok(true) => {
                        self.converge(provider, &lease_id, &instance_id, ObservedState::Running)
                            .await
                    }
                    Ok(false) => {
                        warn!("Lease {}: instance {} no longer exists", lease_id, instance_id);
                        let lease = self.write_observed(&lease_id, ObservedState::Destroyed, None)?;
                        Ok((lease, true))
                    }
                    Err(e) => Err(self.fail(&lease_id, e.into())),
                }
            }
            Transition::Pause => {
                let instance_id = instance_of(&lease)?;
                match provider.pause_session(&instance_id).await {
                    Ok(true) => {
                        self.converge(provider, &lease_id, &instance_id, ObservedState::Paused)
                            .await
                    }
                    Ok(false) => {
                        warn!("Lease {}: instance {} no longer exists", lease_id, instance_id);
                        let lease = self.write_observed(&lease_id, ObservedState::Destroyed, None)?;
                        Ok((lease, false))
                    }
                    Err(e) => Err(self.fail(&lease_id, e.into())),
                }
            }
            Transition::Destroy => {
                if let Some(instance_id) = &lease.current_instance_id {
                    match provider.destroy_session(instance_id, true).await {
                        Ok(existed) => {
                            debug!("Lease {}: destroy {} (existed={})", lease_id, instance_id, existed);
                        }
                        Err(e) => return Err(self.fail(&lease_id, e.into())),
                    }
                }
                self.write_observed(&lease_id, ObservedState::Destroyed, None)?;
                self.store.archive_lease(&lease_id)?;
                info!("Lease {}: destroyed and archived", lease_id);
                Ok((self.load(&lease_id)?, true))
            }
        }
    }

    /// Polls until the instance reports `target` or attempts run out.
    async fn converge(
        &self,
        provider: &dyn SandboxProvider,
        lease_id: &str,
        instance_id: &str,
        target: ObservedState,
    ) -> Result<(Lease, bool), LeaseError> {
        let mut last = ObservedState::Unknown;
        for attempt in 0..self.poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            last = provider.get_session_status(instance_id).await.into();
            if last == target {
                return Ok((self.write_observed(lease_id, target, None)?, true));
            }
            if last == ObservedState::Destroyed {
                warn!("Lease {}: instance {} vanished while converging", lease_id, instance_id);
                return Ok((self.write_observed(lease_id, last, None)?, true));
            }
        }

        let detail = format!(
            "convergence timeout: {instance_id} still {last} after {} polls, wanted {target}",
            self.poll_attempts
        );
        warn!("Lease {}: {}", lease_id, detail);
        Ok((
            self.write_observed(lease_id, ObservedState::Unknown, Some(&detail))?,
            false,
        ))
    }

    /// Records a provider failure on the lease; the error is returned as-is.
    fn fail(&self, lease_id: &str, err: LeaseError) -> LeaseError {
        warn!("Lease {}: {}", lease_id, err);
        if let Err(e) = self.store.record_lease_error(lease_id, &err.to_string()) {
            warn!("Failed to record error on lease {}: {}", lease_id, e);
        }
        err
    }
}

fn instance_of(lease: &Lease) -> Result<String, LeaseError> {
    lease
        .current_instance_id
        .clone()
        .ok_or_else(|| LeaseError::Conflict(format!("{} has no instance", lease.lease_id)))
}
