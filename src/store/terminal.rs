//! Logical shell contexts and the thread → terminal pointers.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;

use super::{Store, StoreError};

/// Shell context multiplexed onto a lease's instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Terminal {
    pub terminal_id: String,
    pub thread_id: String,
    pub lease_id: String,
    pub cwd: String,
    /// Variables exported before every command.
    pub env_delta: BTreeMap<String, String>,
    /// Bumped on every cwd/env write; used for compare-and-swap.
    pub state_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Terminal {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let env_json: String = row.get("env_delta_json")?;
        let env_delta = serde_json::from_str(&env_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        Ok(Self {
            terminal_id: row.get("terminal_id")?,
            thread_id: row.get("thread_id")?,
            lease_id: row.get("lease_id")?,
            cwd: row.get("cwd")?,
            env_delta,
            state_version: row.get("state_version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ThreadPointer {
    pub thread_id: String,
    pub active_terminal_id: String,
    pub default_terminal_id: String,
    pub updated_at: DateTime<Utc>,
}

const TERMINAL_COLUMNS: &str = "t.terminal_id, t.thread_id, t.lease_id, t.cwd, t.env_delta_json,
    t.state_version, t.created_at, t.updated_at";

impl Store {
    pub fn create_terminal(
        &self,
        thread_id: &str,
        lease_id: &str,
        cwd: &str,
    ) -> Result<Terminal, StoreError> {
        let terminal_id = format!("term-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO abstract_terminals (
                terminal_id, thread_id, lease_id, cwd, env_delta_json, state_version,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, '{}', 0, ?5, ?5)",
            params![terminal_id, thread_id, lease_id, cwd, now],
        )?;
        Ok(Terminal {
            terminal_id,
            thread_id: thread_id.to_string(),
            lease_id: lease_id.to_string(),
            cwd: cwd.to_string(),
            env_delta: BTreeMap::new(),
            state_version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn terminal(&self, terminal_id: &str) -> Result<Option<Terminal>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {TERMINAL_COLUMNS} FROM abstract_terminals t WHERE t.terminal_id = ?1"),
                params![terminal_id],
                Terminal::from_row,
            )
            .optional()?)
    }

    /// Terminal the thread is currently attached to.
    pub fn active_terminal(&self, thread_id: &str) -> Result<Option<Terminal>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {TERMINAL_COLUMNS}
                     FROM thread_terminal_pointers p
                     JOIN abstract_terminals t ON t.terminal_id = p.active_terminal_id
                     WHERE p.thread_id = ?1"
                ),
                params![thread_id],
                Terminal::from_row,
            )
            .optional()?)
    }

    /// Writes cwd and env if `state_version` is unchanged since the read.
    pub fn update_terminal_state(
        &self,
        terminal_id: &str,
        expected_state_version: i64,
        cwd: &str,
        env_delta: &BTreeMap<String, String>,
    ) -> Result<bool, StoreError> {
        let env_json = serde_json::to_string(env_delta)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE abstract_terminals
             SET cwd = ?3, env_delta_json = ?4, state_version = state_version + 1, updated_at = ?5
             WHERE terminal_id = ?1 AND state_version = ?2",
            params![terminal_id, expected_state_version, cwd, env_json, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Points the thread at `terminal_id`. The first terminal a thread ever
    /// gets stays its default.
    pub fn set_thread_pointer(&self, thread_id: &str, terminal_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO thread_terminal_pointers (thread_id, active_terminal_id, default_terminal_id, updated_at)
             VALUES (?1, ?2, ?2, ?3)
             ON CONFLICT(thread_id) DO UPDATE
             SET active_terminal_id = excluded.active_terminal_id, updated_at = excluded.updated_at",
            params![thread_id, terminal_id, Utc::now()],
        )?;
        Ok(())
    }

    pub fn thread_pointer(&self, thread_id: &str) -> Result<Option<ThreadPointer>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT thread_id, active_terminal_id, default_terminal_id, updated_at
                 FROM thread_terminal_pointers WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok(ThreadPointer {
                        thread_id: row.get(0)?,
                        active_terminal_id: row.get(1)?,
                        default_terminal_id: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        let lease = store.create_lease("local", Some("t1")).unwrap();
        (store, lease.lease_id)
    }

    #[test]
    fn test_terminal_state_cas() {
        let (store, lease_id) = setup();
        let term = store.create_terminal("t1", &lease_id, "/workspace").unwrap();

        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        assert!(store
            .update_terminal_state(&term.terminal_id, 0, "/workspace/src", &env)
            .unwrap());
        // A second writer holding the old version loses
        assert!(!store
            .update_terminal_state(&term.terminal_id, 0, "/tmp", &BTreeMap::new())
            .unwrap());

        let term = store.terminal(&term.terminal_id).unwrap().unwrap();
        assert_eq!(term.cwd, "/workspace/src");
        assert_eq!(term.env_delta.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(term.state_version, 1);
    }

    #[test]
    fn test_thread_pointer_keeps_default() {
        let (store, lease_id) = setup();
        let first = store.create_terminal("t1", &lease_id, "/").unwrap();
        let second = store.create_terminal("t1", &lease_id, "/").unwrap();

        store.set_thread_pointer("t1", &first.terminal_id).unwrap();
        store.set_thread_pointer("t1", &second.terminal_id).unwrap();

        let pointer = store.thread_pointer("t1").unwrap().unwrap();
        assert_eq!(pointer.active_terminal_id, second.terminal_id);
        assert_eq!(pointer.default_terminal_id, first.terminal_id);

        let active = store.active_terminal("t1").unwrap().unwrap();
        assert_eq!(active.terminal_id, second.terminal_id);
        assert_eq!(
            store.lease_for_thread("t1").unwrap().unwrap().lease_id,
            lease_id
        );
    }

    #[test]
    fn test_terminal_requires_lease() {
        let store = Store::open_in_memory().unwrap();
        let err = store.create_terminal("t1", "lease-missing", "/").unwrap_err();
        assert!(err.is_conflict());
    }
}
