//! `sandbox_leases`: one row per claim on a remote instance.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use super::{text_enum, Store, StoreError};
use crate::sandbox::SessionStatus;

/// Target state set by lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DesiredState {
    Running,
    Paused,
    Destroyed,
}

text_enum!(DesiredState, "desired state", {
    Running => "running",
    Paused => "paused",
    Destroyed => "destroyed",
});

/// Last state the reconciler saw at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ObservedState {
    Running,
    Paused,
    Destroyed,
    Unknown,
}

text_enum!(ObservedState, "observed state", {
    Running => "running",
    Paused => "paused",
    Destroyed => "destroyed",
    Unknown => "unknown",
});

impl ObservedState {
    pub fn satisfies(self, desired: DesiredState) -> bool {
        matches!(
            (self, desired),
            (Self::Running, DesiredState::Running)
                | (Self::Paused, DesiredState::Paused)
                | (Self::Destroyed, DesiredState::Destroyed)
        )
    }
}

impl From<SessionStatus> for ObservedState {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Running => Self::Running,
            SessionStatus::Paused => Self::Paused,
            SessionStatus::Deleted => Self::Destroyed,
            SessionStatus::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LeaseStatus {
    Active,
    Archived,
}

text_enum!(LeaseStatus, "lease status", {
    Active => "active",
    Archived => "archived",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Lease {
    pub lease_id: String,
    pub provider_name: String,
    pub workspace_key: Option<String>,
    pub current_instance_id: Option<String>,
    pub instance_created_at: Option<DateTime<Utc>>,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    pub version: i64,
    pub observed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub needs_refresh: bool,
    pub refresh_hint_at: Option<DateTime<Utc>>,
    pub status: LeaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_converged(&self) -> bool {
        self.observed_state.satisfies(self.desired_state)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            lease_id: row.get("lease_id")?,
            provider_name: row.get("provider_name")?,
            workspace_key: row.get("workspace_key")?,
            current_instance_id: row.get("current_instance_id")?,
            instance_created_at: row.get("instance_created_at")?,
            desired_state: row.get("desired_state")?,
            observed_state: row.get("observed_state")?,
            version: row.get("version")?,
            observed_at: row.get("observed_at")?,
            last_error: row.get("last_error")?,
            needs_refresh: row.get("needs_refresh")?,
            refresh_hint_at: row.get("refresh_hint_at")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const LEASE_COLUMNS: &str = "l.lease_id, l.provider_name, l.workspace_key, l.current_instance_id,
    l.instance_created_at, l.desired_state, l.observed_state, l.version, l.observed_at,
    l.last_error, l.needs_refresh, l.refresh_hint_at, l.status, l.created_at, l.updated_at";

impl Store {
    /// Inserts an active lease that wants to be running but has no instance yet.
    ///
    /// Fails with a conflict if `workspace_key` already has an active lease.
    pub fn create_lease(
        &self,
        provider_name: &str,
        workspace_key: Option<&str>,
    ) -> Result<Lease, StoreError> {
        let lease_id = format!("lease-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sandbox_leases (
                lease_id, provider_name, workspace_key, desired_state, observed_state,
                version, needs_refresh, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?7, ?7)",
            params![
                lease_id,
                provider_name,
                workspace_key,
                DesiredState::Running,
                ObservedState::Unknown,
                LeaseStatus::Active,
                now
            ],
        )
        .map_err(|e| {
            let err = StoreError::from(e);
            if err.is_conflict() {
                StoreError::Conflict(format!(
                    "workspace {} already has an active lease",
                    workspace_key.unwrap_or("-")
                ))
            } else {
                err
            }
        })?;
        drop(conn);
        self.lease(&lease_id)?
            .ok_or_else(|| StoreError::missing("lease", lease_id))
    }

    pub fn lease(&self, lease_id: &str) -> Result<Option<Lease>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM sandbox_leases l WHERE l.lease_id = ?1"),
                params![lease_id],
                Lease::from_row,
            )
            .optional()?)
    }

    /// Active lease behind the thread's active terminal.
    pub fn lease_for_thread(&self, thread_id: &str) -> Result<Option<Lease>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {LEASE_COLUMNS}
                     FROM thread_terminal_pointers p
                     JOIN abstract_terminals t ON t.terminal_id = p.active_terminal_id
                     JOIN sandbox_leases l ON l.lease_id = t.lease_id
                     WHERE p.thread_id = ?1 AND l.status = 'active'"
                ),
                params![thread_id],
                Lease::from_row,
            )
            .optional()?)
    }

    pub fn active_lease_for_workspace(&self, workspace_key: &str) -> Result<Option<Lease>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {LEASE_COLUMNS} FROM sandbox_leases l
                     WHERE l.workspace_key = ?1 AND l.status = 'active'"
                ),
                params![workspace_key],
                Lease::from_row,
            )
            .optional()?)
    }

    /// Every active lease, oldest first.
    pub fn active_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM sandbox_leases l
             WHERE l.status = 'active' ORDER BY l.created_at"
        ))?;
        let leases = stmt
            .query_map([], Lease::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(leases)
    }

    /// Providers that own at least one active lease.
    pub fn lease_providers(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT provider_name FROM sandbox_leases
             WHERE status = 'active' ORDER BY provider_name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Instance ids recorded on active leases for one provider.
    pub fn known_instance_ids(&self, provider_name: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT current_instance_id FROM sandbox_leases
             WHERE provider_name = ?1 AND status = 'active' AND current_instance_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map(params![provider_name], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    /// Writes the target state and bumps `version`.
    ///
    /// With `expected_version`, the write only lands if nobody else has
    /// written the lease since it was read.
    pub fn set_desired_state(
        &self,
        lease_id: &str,
        desired: DesiredState,
        expected_version: Option<i64>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sandbox_leases
             SET desired_state = ?2, version = version + 1, updated_at = ?3
             WHERE lease_id = ?1 AND status = 'active' AND (?4 IS NULL OR version = ?4)",
            params![lease_id, desired, Utc::now(), expected_version],
        )?;
        Ok(changed == 1)
    }

    /// Records provider truth. Only the reconciler calls this.
    ///
    /// Clears `needs_refresh`, stamps `observed_at` and bumps `version`, but
    /// only if `version` still equals `expected_version`.
    pub fn write_observed_state(
        &self,
        lease_id: &str,
        expected_version: i64,
        observed: ObservedState,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sandbox_leases
             SET observed_state = ?3, last_error = ?4, observed_at = ?5, needs_refresh = 0,
                 version = version + 1, updated_at = ?5
             WHERE lease_id = ?1 AND version = ?2",
            params![lease_id, expected_version, observed, last_error, now],
        )?;
        Ok(changed == 1)
    }

    /// Points the lease at `instance_id`, bumping `version`, but only if it
    /// still points at `expected`. Two writers that both saw an empty lease
    /// cannot both attach an instance.
    pub fn set_instance(
        &self,
        lease_id: &str,
        expected: Option<&str>,
        instance_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let created_at = instance_id.map(|_| now);
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sandbox_leases
             SET current_instance_id = ?3, instance_created_at = ?4,
                 version = version + 1, updated_at = ?5
             WHERE lease_id = ?1 AND current_instance_id IS ?2 AND status = 'active'",
            params![lease_id, expected, instance_id, created_at, now],
        )?;
        Ok(changed == 1)
    }

    /// Takes the cross-process reconcile claim on a lease for `ttl`.
    ///
    /// Succeeds when the claim is free, already held by `owner`, or expired.
    pub fn try_claim_lease(
        &self,
        lease_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sandbox_leases
             SET reconcile_owner = ?2, reconcile_until = ?3
             WHERE lease_id = ?1
               AND (reconcile_owner IS NULL OR reconcile_owner = ?2 OR reconcile_until < ?4)",
            params![lease_id, owner, until, now],
        )?;
        Ok(changed == 1)
    }

    /// Drops `owner`'s claim. A claim taken over after expiry is left alone.
    pub fn release_lease_claim(&self, lease_id: &str, owner: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sandbox_leases SET reconcile_owner = NULL, reconcile_until = NULL
             WHERE lease_id = ?1 AND reconcile_owner = ?2",
            params![lease_id, owner],
        )?;
        Ok(())
    }

    /// Flags the lease for re-observation. Does not bump `version`.
    pub fn mark_needs_refresh(&self, lease_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sandbox_leases
             SET needs_refresh = 1, refresh_hint_at = ?2, updated_at = ?2
             WHERE lease_id = ?1",
            params![lease_id, now],
        )?;
        Ok(())
    }

    /// Records a provider failure without touching observed state.
    pub fn record_lease_error(&self, lease_id: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sandbox_leases SET last_error = ?2, updated_at = ?3 WHERE lease_id = ?1",
            params![lease_id, error, Utc::now()],
        )?;
        Ok(())
    }

    /// Soft-deletes a lease; the row stays for audit.
    pub fn archive_lease(&self, lease_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sandbox_leases
             SET status = 'archived', version = version + 1, updated_at = ?2
             WHERE lease_id = ?1 AND status = 'active'",
            params![lease_id, Utc::now()],
        )?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_lease_defaults() {
        let store = Store::open_in_memory().unwrap();
        let lease = store.create_lease("docker", Some("thread-1")).unwrap();
        assert!(lease.lease_id.starts_with("lease-"));
        assert_eq!(lease.desired_state, DesiredState::Running);
        assert_eq!(lease.observed_state, ObservedState::Unknown);
        assert_eq!(lease.status, LeaseStatus::Active);
        assert_eq!(lease.version, 0);
        assert!(lease.current_instance_id.is_none());
        assert!(!lease.is_converged());
    }

    #[test]
    fn test_one_active_lease_per_workspace() {
        let store = Store::open_in_memory().unwrap();
        let first = store.create_lease("docker", Some("ws")).unwrap();
        let err = store.create_lease("docker", Some("ws")).unwrap_err();
        assert!(err.is_conflict());

        // Archiving frees the workspace key
        assert!(store.archive_lease(&first.lease_id).unwrap());
        store.create_lease("docker", Some("ws")).unwrap();

        // Leases without a workspace never conflict
        store.create_lease("docker", None).unwrap();
        store.create_lease("docker", None).unwrap();
    }

    #[test]
    fn test_observed_write_requires_current_version() {
        let store = Store::open_in_memory().unwrap();
        let lease = store.create_lease("local", None).unwrap();
        store.mark_needs_refresh(&lease.lease_id).unwrap();

        assert!(store
            .write_observed_state(&lease.lease_id, 0, ObservedState::Running, None)
            .unwrap());
        // Stale version loses
        assert!(!store
            .write_observed_state(&lease.lease_id, 0, ObservedState::Paused, None)
            .unwrap());

        let lease = store.lease(&lease.lease_id).unwrap().unwrap();
        assert_eq!(lease.observed_state, ObservedState::Running);
        assert_eq!(lease.version, 1);
        assert!(!lease.needs_refresh);
        assert!(lease.observed_at.is_some());
        assert!(lease.is_converged());
    }

    #[test]
    fn test_desired_write_bumps_version() {
        let store = Store::open_in_memory().unwrap();
        let lease = store.create_lease("local", None).unwrap();
        assert!(store
            .set_desired_state(&lease.lease_id, DesiredState::Paused, Some(0))
            .unwrap());
        assert!(!store
            .set_desired_state(&lease.lease_id, DesiredState::Destroyed, Some(0))
            .unwrap());
        assert!(store
            .set_desired_state(&lease.lease_id, DesiredState::Running, None)
            .unwrap());
        let lease = store.lease(&lease.lease_id).unwrap().unwrap();
        assert_eq!(lease.desired_state, DesiredState::Running);
        assert_eq!(lease.version, 2);
    }

    #[test]
    fn test_set_instance_only_over_expected() {
        let store = Store::open_in_memory().unwrap();
        let lease = store.create_lease("docker", Some("ws")).unwrap();
        assert!(store.set_instance(&lease.lease_id, None, Some("c-1")).unwrap());
        // A second writer that also saw an empty lease loses
        assert!(!store.set_instance(&lease.lease_id, None, Some("c-2")).unwrap());
        assert!(store
            .set_instance(&lease.lease_id, Some("c-1"), Some("c-3"))
            .unwrap());
        let lease = store.lease(&lease.lease_id).unwrap().unwrap();
        assert_eq!(lease.current_instance_id.as_deref(), Some("c-3"));
        assert_eq!(lease.version, 2);
    }

    #[test]
    fn test_reconcile_claims() {
        let store = Store::open_in_memory().unwrap();
        let lease = store.create_lease("docker", Some("ws")).unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.try_claim_lease(&lease.lease_id, "a", ttl).unwrap());
        assert!(store.try_claim_lease(&lease.lease_id, "a", ttl).unwrap());
        assert!(!store.try_claim_lease(&lease.lease_id, "b", ttl).unwrap());

        // Only the holder can release
        store.release_lease_claim(&lease.lease_id, "b").unwrap();
        assert!(!store.try_claim_lease(&lease.lease_id, "b", ttl).unwrap());
        store.release_lease_claim(&lease.lease_id, "a").unwrap();
        assert!(store.try_claim_lease(&lease.lease_id, "b", ttl).unwrap());

        // An expired claim can be taken over
        assert!(store.try_claim_lease(&lease.lease_id, "b", Duration::ZERO).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.try_claim_lease(&lease.lease_id, "c", ttl).unwrap());
    }

    #[test]
    fn test_known_instances_and_providers() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_lease("docker", Some("a")).unwrap();
        let b = store.create_lease("local", Some("b")).unwrap();
        assert!(store.set_instance(&a.lease_id, None, Some("c-1")).unwrap());
        assert!(store.set_instance(&b.lease_id, None, Some("l-1")).unwrap());

        assert_eq!(store.lease_providers().unwrap(), vec!["docker", "local"]);
        let known = store.known_instance_ids("docker").unwrap();
        assert!(known.contains("c-1"));
        assert!(!known.contains("l-1"));

        store.archive_lease(&a.lease_id).unwrap();
        assert!(store.known_instance_ids("docker").unwrap().is_empty());
        assert_eq!(store.active_leases().unwrap().len(), 1);
    }

    #[test]
    fn test_observed_state_mapping() {
        assert_eq!(ObservedState::from(SessionStatus::Deleted), ObservedState::Destroyed);
        assert_eq!(ObservedState::from(SessionStatus::Unknown), ObservedState::Unknown);
        assert!(!ObservedState::Unknown.satisfies(DesiredState::Running));
        assert_eq!("paused".parse::<DesiredState>().unwrap(), DesiredState::Paused);
        assert!("sleeping".parse::<DesiredState>().is_err());
    }
}
