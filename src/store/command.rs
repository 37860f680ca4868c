//! `terminal_commands`: one row per shell invocation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{text_enum, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CommandStatus {
    Pending,
    Running,
    /// The command ran to completion, whatever its exit code.
    Finished,
    /// The command could not be run or did not complete.
    Failed,
}

text_enum!(CommandStatus, "command status", {
    Pending => "pending",
    Running => "running",
    Finished => "finished",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct TerminalCommand {
    pub command_id: String,
    pub terminal_id: String,
    pub chat_session_id: Option<String>,
    pub command_line: String,
    pub cwd: String,
    pub status: CommandStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TerminalCommand {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            command_id: row.get("command_id")?,
            terminal_id: row.get("terminal_id")?,
            chat_session_id: row.get("chat_session_id")?,
            command_line: row.get("command_line")?,
            cwd: row.get("cwd")?,
            status: row.get("status")?,
            stdout: row.get("stdout")?,
            stderr: row.get("stderr")?,
            exit_code: row.get("exit_code")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

const COMMAND_COLUMNS: &str = "command_id, terminal_id, chat_session_id, command_line, cwd,
    status, stdout, stderr, exit_code, created_at, updated_at, finished_at";

impl Store {
    pub fn create_command(
        &self,
        terminal_id: &str,
        chat_session_id: Option<&str>,
        command_line: &str,
        cwd: &str,
    ) -> Result<String, StoreError> {
        let command_id = format!("cmd-{}", uuid::Uuid::new_v4());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO terminal_commands (
                command_id, terminal_id, chat_session_id, command_line, cwd, status,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                command_id,
                terminal_id,
                chat_session_id,
                command_line,
                cwd,
                CommandStatus::Pending,
                Utc::now()
            ],
        )?;
        Ok(command_id)
    }

    /// pending → running. False if the command already left `pending`.
    pub fn start_command(&self, command_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE terminal_commands SET status = 'running', updated_at = ?2
             WHERE command_id = ?1 AND status = 'pending'",
            params![command_id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Moves a pending or running command into a terminal state.
    pub fn finish_command(
        &self,
        command_id: &str,
        status: CommandStatus,
        exit_code: Option<i64>,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE terminal_commands
             SET status = ?2, exit_code = ?3, stdout = ?4, stderr = ?5,
                 updated_at = ?6, finished_at = ?6
             WHERE command_id = ?1 AND status IN ('pending', 'running')",
            params![command_id, status, exit_code, stdout, stderr, now],
        )?;
        Ok(changed == 1)
    }

    pub fn command(&self, command_id: &str) -> Result<Option<TerminalCommand>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {COMMAND_COLUMNS} FROM terminal_commands WHERE command_id = ?1"),
                params![command_id],
                TerminalCommand::from_row,
            )
            .optional()?)
    }

    /// Latest commands on a terminal, newest first.
    pub fn recent_commands(
        &self,
        terminal_id: &str,
        limit: usize,
    ) -> Result<Vec<TerminalCommand>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMAND_COLUMNS} FROM terminal_commands
             WHERE terminal_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let commands = stmt
            .query_map(params![terminal_id, limit], TerminalCommand::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(commands)
    }

    /// Commands issued within a chat session, counted against its budget.
    pub fn command_count(&self, chat_session_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM terminal_commands WHERE chat_session_id = ?1",
            params![chat_session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
