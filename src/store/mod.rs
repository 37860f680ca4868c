//! Durable lease ledger on SQLite.
//!
//! One `Store` handle is opened per process and cloned into every component
//! that needs it. All access goes through a short-lived lock on a single
//! connection; the lock is never held across an `.await`. Cross-process
//! writers are serialized by SQLite itself (WAL journal plus busy timeout).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const SCHEMA_VERSION: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("{kind} not found: {id}")]
    Missing { kind: &'static str, id: String },

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("failed to create database directory {path}: {message}")]
    Directory { path: String, message: String },
}

impl StoreError {
    pub fn missing(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Missing {
            kind,
            id: id.into(),
        }
    }

    /// True for a uniqueness or foreign-key violation.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

/// Value stored in a TEXT column that names one variant of a state enum.
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind}: '{value}'")]
pub(crate) struct InvalidValue {
    pub kind: &'static str,
    pub value: String,
}

/// Implements text round-tripping for a fieldless enum stored in SQLite.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::store::InvalidValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err($crate::store::InvalidValue {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}
pub(crate) use text_enum;

mod command;
mod lease;
mod session;
mod terminal;

pub(crate) use command::{CommandStatus, TerminalCommand};
pub(crate) use lease::{DesiredState, Lease, LeaseStatus, ObservedState};
pub(crate) use session::{Budget, ChatSession, SessionPolicy, SessionState};
pub(crate) use terminal::{Terminal, ThreadPointer};

/// Cloneable handle to the lease database.
#[derive(Clone)]
pub(crate) struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if needed) the database at `path` and migrates it.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Directory {
                path: parent.display().to_string(),
                message: e.to_string(),
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Brings the schema up to date in one IMMEDIATE transaction, so two
    /// processes opening a fresh database cannot both apply a migration.
    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;
        let current = schema_version(&tx)?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        for (version, name, sql) in MIGRATIONS {
            if current < *version {
                tx.execute_batch(sql)?;
                record_migration(&tx, *version, name)?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    debug!("Applying schema migration {} ({})", version, name);
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![version, name, Utc::now()],
    )?;
    Ok(())
}

const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "baseline_lease_tables", MIGRATION_V1),
    (2, "message_queue", MIGRATION_V2),
    (3, "lease_reconcile_claims", MIGRATION_V3),
];

const MIGRATION_V1: &str = "
CREATE TABLE sandbox_leases (
    lease_id TEXT PRIMARY KEY,
    provider_name TEXT NOT NULL,
    workspace_key TEXT,
    current_instance_id TEXT,
    instance_created_at TEXT,
    desired_state TEXT NOT NULL,
    observed_state TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    observed_at TEXT,
    last_error TEXT,
    needs_refresh INTEGER NOT NULL DEFAULT 0,
    refresh_hint_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX idx_sandbox_leases_active_workspace
    ON sandbox_leases(workspace_key)
    WHERE status = 'active' AND workspace_key IS NOT NULL;
CREATE INDEX idx_sandbox_leases_provider ON sandbox_leases(provider_name, status);

CREATE TABLE abstract_terminals (
    terminal_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    lease_id TEXT NOT NULL REFERENCES sandbox_leases(lease_id),
    cwd TEXT NOT NULL,
    env_delta_json TEXT NOT NULL DEFAULT '{}',
    state_version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_abstract_terminals_lease ON abstract_terminals(lease_id);

CREATE TABLE chat_sessions (
    chat_session_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    terminal_id TEXT NOT NULL REFERENCES abstract_terminals(terminal_id),
    lease_id TEXT NOT NULL REFERENCES sandbox_leases(lease_id),
    status TEXT NOT NULL,
    idle_ttl_sec INTEGER NOT NULL,
    max_duration_sec INTEGER NOT NULL,
    budget_json TEXT,
    started_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    ended_at TEXT,
    close_reason TEXT
);
CREATE INDEX idx_chat_sessions_thread ON chat_sessions(thread_id, status);
CREATE INDEX idx_chat_sessions_status ON chat_sessions(status);

CREATE TABLE thread_terminal_pointers (
    thread_id TEXT PRIMARY KEY,
    active_terminal_id TEXT NOT NULL REFERENCES abstract_terminals(terminal_id),
    default_terminal_id TEXT NOT NULL REFERENCES abstract_terminals(terminal_id),
    updated_at TEXT NOT NULL
);

CREATE TABLE terminal_commands (
    command_id TEXT PRIMARY KEY,
    terminal_id TEXT NOT NULL REFERENCES abstract_terminals(terminal_id),
    chat_session_id TEXT REFERENCES chat_sessions(chat_session_id),
    command_line TEXT NOT NULL,
    cwd TEXT NOT NULL,
    status TEXT NOT NULL,
    stdout TEXT,
    stderr TEXT,
    exit_code INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX idx_terminal_commands_session ON terminal_commands(chat_session_id);
";

const MIGRATION_V2: &str = "
CREATE TABLE message_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT
);
CREATE INDEX idx_message_queue_claim ON message_queue(queue, status, id);
";

const MIGRATION_V3: &str = "
ALTER TABLE sandbox_leases ADD COLUMN reconcile_owner TEXT;
ALTER TABLE sandbox_leases ADD COLUMN reconcile_until TEXT;
";

#[cfg(test)]
pub(crate) fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("leasehold.db"), Duration::from_secs(5)).unwrap();
    (dir, store)
}
