//! Chat sessions: thread bindings with idle/duration policy.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{text_enum, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionState {
    Active,
    /// Paused by the idle reaper.
    Idle,
    /// Paused on request.
    Paused,
    Ended,
}

text_enum!(SessionState, "session status", {
    Active => "active",
    Idle => "idle",
    Paused => "paused",
    Ended => "ended",
});

/// Optional per-session limits, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Budget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wall_clock_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_commands: Option<u32>,
}

impl Budget {
    pub fn is_empty(&self) -> bool {
        self.max_wall_clock_sec.is_none() && self.max_commands.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ChatSession {
    pub chat_session_id: String,
    pub thread_id: String,
    pub terminal_id: String,
    pub lease_id: String,
    pub status: SessionState,
    pub idle_ttl_sec: i64,
    pub max_duration_sec: i64,
    pub budget: Option<Budget>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl ChatSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let budget_json: Option<String> = row.get("budget_json")?;
        let budget = budget_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
        Ok(Self {
            chat_session_id: row.get("chat_session_id")?,
            thread_id: row.get("thread_id")?,
            terminal_id: row.get("terminal_id")?,
            lease_id: row.get("lease_id")?,
            status: row.get("status")?,
            idle_ttl_sec: row.get("idle_ttl_sec")?,
            max_duration_sec: row.get("max_duration_sec")?,
            budget,
            started_at: row.get("started_at")?,
            last_active_at: row.get("last_active_at")?,
            ended_at: row.get("ended_at")?,
            close_reason: row.get("close_reason")?,
        })
    }
}

const SESSION_COLUMNS: &str = "chat_session_id, thread_id, terminal_id, lease_id, status,
    idle_ttl_sec, max_duration_sec, budget_json, started_at, last_active_at, ended_at, close_reason";

/// Policy applied when a chat session is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SessionPolicy {
    pub idle_ttl_sec: i64,
    pub max_duration_sec: i64,
    pub budget: Option<Budget>,
}

impl Store {
    pub fn create_chat_session(
        &self,
        thread_id: &str,
        terminal_id: &str,
        lease_id: &str,
        policy: &SessionPolicy,
    ) -> Result<ChatSession, StoreError> {
        let chat_session_id = format!("chat-{}", uuid::Uuid::new_v4());
        let budget = policy.budget.clone().filter(|b| !b.is_empty());
        let budget_json = budget.as_ref().map(serde_json::to_string).transpose()?;
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chat_sessions (
                chat_session_id, thread_id, terminal_id, lease_id, status, idle_ttl_sec,
                max_duration_sec, budget_json, started_at, last_active_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                chat_session_id,
                thread_id,
                terminal_id,
                lease_id,
                SessionState::Active,
                policy.idle_ttl_sec,
                policy.max_duration_sec,
                budget_json,
                now
            ],
        )?;
        Ok(ChatSession {
            chat_session_id,
            thread_id: thread_id.to_string(),
            terminal_id: terminal_id.to_string(),
            lease_id: lease_id.to_string(),
            status: SessionState::Active,
            idle_ttl_sec: policy.idle_ttl_sec,
            max_duration_sec: policy.max_duration_sec,
            budget,
            started_at: now,
            last_active_at: now,
            ended_at: None,
            close_reason: None,
        })
    }

    pub fn chat_session(&self, chat_session_id: &str) -> Result<Option<ChatSession>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE chat_session_id = ?1"),
                params![chat_session_id],
                ChatSession::from_row,
            )
            .optional()?)
    }

    /// Most recent chat session of the thread that has not ended.
    pub fn open_chat_session(&self, thread_id: &str) -> Result<Option<ChatSession>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM chat_sessions
                     WHERE thread_id = ?1 AND status != 'ended'
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![thread_id],
                ChatSession::from_row,
            )
            .optional()?)
    }

    /// Sessions in any of the given states, oldest first.
    pub fn chat_sessions_in(&self, states: &[SessionState]) -> Result<Vec<ChatSession>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions ORDER BY started_at"
        ))?;
        let sessions = stmt
            .query_map([], ChatSession::from_row)?
            .filter(|s| s.as_ref().map_or(true, |s| states.contains(&s.status)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Records activity and reactivates an idle or paused session.
    pub fn touch_chat_session(&self, chat_session_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE chat_sessions SET last_active_at = ?2, status = 'active'
             WHERE chat_session_id = ?1 AND status != 'ended'",
            params![chat_session_id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    pub fn set_chat_session_status(
        &self,
        chat_session_id: &str,
        status: SessionState,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE chat_sessions SET status = ?2
             WHERE chat_session_id = ?1 AND status != 'ended'",
            params![chat_session_id, status],
        )?;
        Ok(changed == 1)
    }

    /// Moves an active session to idle unless it saw activity after
    /// `last_active_at` was read.
    pub fn mark_idle_if_untouched(
        &self,
        chat_session_id: &str,
        last_active_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE chat_sessions SET status = 'idle'
             WHERE chat_session_id = ?1 AND status = 'active' AND last_active_at = ?2",
            params![chat_session_id, last_active_at],
        )?;
        Ok(changed == 1)
    }

    pub fn end_chat_session(&self, chat_session_id: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE chat_sessions SET status = 'ended', ended_at = ?2, close_reason = ?3
             WHERE chat_session_id = ?1 AND status != 'ended'",
            params![chat_session_id, Utc::now(), reason],
        )?;
        Ok(changed == 1)
    }

    /// Ends every open session bound to the lease. Returns how many ended.
    pub fn end_chat_sessions_for_lease(&self, lease_id: &str, reason: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE chat_sessions SET status = 'ended', ended_at = ?2, close_reason = ?3
             WHERE lease_id = ?1 AND status != 'ended'",
            params![lease_id, Utc::now(), reason],
        )?;
        Ok(changed)
    }

    /// Moves every open session of the lease to `status`.
    pub fn set_chat_sessions_for_lease(
        &self,
        lease_id: &str,
        status: SessionState,
    ) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE chat_sessions SET status = ?2 WHERE lease_id = ?1 AND status != 'ended'",
            params![lease_id, status],
        )?;
        Ok(changed)
    }
}
