//! Orphan detection: provider instances the ledger does not know about.
//!
//! A scan compares what each provider account lists against the instance ids
//! recorded in active leases. Remote-only instances are orphans; local-only
//! instances are marked for refresh so the next reconciliation re-reads them.
//! Nothing is destroyed or adopted automatically.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::LeaseError;
use crate::manager::SandboxManager;
use crate::notifications::{NotificationDetails, NotificationEvent, Notifier};
use crate::sandbox::InstanceInfo;
use crate::store::Lease;

/// Result of comparing one provider against the ledger.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct OrphanReport {
    pub provider: String,
    /// Listed by the provider, unknown locally.
    pub orphans: Vec<InstanceInfo>,
    /// Recorded locally (lease id, instance id), not listed by the provider.
    pub missing: Vec<(String, String)>,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty()
    }
}

/// Splits a provider listing into orphans and missing instances.
fn compare(
    provider: &str,
    listed: Vec<InstanceInfo>,
    known: &HashSet<String>,
    leases: &[Lease],
) -> OrphanReport {
    let listed_ids: HashSet<&str> = listed.iter().map(|i| i.instance_id.as_str()).collect();
    let missing = leases
        .iter()
        .filter(|l| l.provider_name == provider)
        .filter_map(|l| {
            l.current_instance_id
                .as_deref()
                .filter(|id| !listed_ids.contains(id))
                .map(|id| (l.lease_id.clone(), id.to_string()))
        })
        .collect();
    let mut orphans: Vec<InstanceInfo> = listed
        .into_iter()
        .filter(|i| !known.contains(&i.instance_id))
        .collect();
    orphans.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    OrphanReport {
        provider: provider.to_string(),
        orphans,
        missing,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OrphanDetector {
    manager: SandboxManager,
    notifier: Notifier,
    interval: Duration,
}

impl OrphanDetector {
    pub fn new(manager: SandboxManager, notifier: Notifier, interval: Duration) -> Self {
        Self {
            manager,
            notifier,
            interval,
        }
    }

    /// Providers named by any lease, plus every enabled one.
    fn providers_to_scan(&self) -> Result<BTreeSet<String>, LeaseError> {
        let mut names: BTreeSet<String> = self.manager.store().lease_providers()?.into_iter().collect();
        names.extend(self.manager.providers().names());
        Ok(names)
    }

    /// Scans every relevant provider. A provider that cannot be listed is
    /// logged and left out of the result.
    pub async fn scan(&self) -> Result<Vec<OrphanReport>, LeaseError> {
        let store = self.manager.store();
        let leases = store.active_leases()?;
        let mut reports = Vec::new();

        for name in self.providers_to_scan()? {
            let Some(provider) = self.manager.providers().get(&name) else {
                warn!("Leases reference provider {} which is not enabled; skipping", name);
                continue;
            };
            let listed = match provider.list_instances().await {
                Ok(listed) => listed,
                Err(e) => {
                    error!("Cannot list {} instances: {}", name, e);
                    continue;
                }
            };
            let known = match store.known_instance_ids(&name) {
                Ok(known) => known,
                Err(e) => {
                    error!("Cannot load known {} instances: {}", name, e);
                    continue;
                }
            };
            let report = compare(&name, listed, &known, &leases);

            for (lease_id, instance_id) in &report.missing {
                info!("Instance {} of lease {} not listed by {}; flagging", instance_id, lease_id, name);
                if let Err(e) = store.mark_needs_refresh(lease_id) {
                    error!("Cannot flag lease {} for refresh: {}", lease_id, e);
                }
            }
            for orphan in &report.orphans {
                warn!(
                    "Orphaned {} instance {} ({}, created {})",
                    name,
                    orphan.instance_id,
                    orphan.status,
                    orphan
                        .created_at
                        .map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339())
                );
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Destroys an instance the ledger does not know. Known ones are refused.
    pub async fn destroy_orphan(&self, provider_name: &str, instance_id: &str) -> Result<bool, LeaseError> {
        self.ensure_unknown(provider_name, instance_id)?;
        let provider = self
            .manager
            .providers()
            .get(provider_name)
            .ok_or_else(|| LeaseError::UnknownProvider(provider_name.to_string()))?;
        let destroyed = provider.destroy_session(instance_id, false).await?;
        info!("Destroyed orphan {} on {}: {}", instance_id, provider_name, destroyed);
        Ok(destroyed)
    }

    /// Binds an unknown instance to `thread_id` under a new lease.
    pub async fn adopt_orphan(
        &self,
        provider_name: &str,
        instance_id: &str,
        thread_id: &str,
    ) -> Result<Lease, LeaseError> {
        self.ensure_unknown(provider_name, instance_id)?;
        self.manager
            .adopt_instance(thread_id, provider_name, instance_id)
            .await
    }

    fn ensure_unknown(&self, provider_name: &str, instance_id: &str) -> Result<(), LeaseError> {
        if self
            .manager
            .store()
            .known_instance_ids(provider_name)?
            .contains(instance_id)
        {
            return Err(LeaseError::Conflict(format!(
                "instance {instance_id} is managed by an active lease"
            )));
        }
        Ok(())
    }

    /// Scans every interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Orphan detector running every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.scan().await {
                    Ok(reports) => {
                        for report in reports.iter().filter(|r| !r.orphans.is_empty()) {
                            let ids: Vec<String> =
                                report.orphans.iter().map(|o| o.instance_id.clone()).collect();
                            let details = NotificationDetails::orphans(&report.provider, &ids);
                            self.notifier.notify(NotificationEvent::Orphans, &details).await;
                        }
                    }
                    Err(e) => error!("Orphan scan failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Orphan detector stopped");
    }
}
