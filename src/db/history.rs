//! Command history repository

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{DbPool, conn, parse_datetime};
use crate::collaborators::CommandJournal;
use crate::command::{CommandResult, CommandState};
use crate::{Error, Result};

/// Persisted command state
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub command_id: String,
    pub kind: String,
    pub priority: String,
    pub target: String,
    pub hostname: Option<String>,
    pub status: String,
    pub result: Option<CommandResult>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Command history repository
#[derive(Clone)]
pub struct CommandHistoryRepo {
    pool: DbPool,
}

impl CommandHistoryRepo {
    /// Create a new command history repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find a command by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, command_id: &str) -> Result<Option<HistoryEntry>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT command_id, kind, priority, target, hostname, status, result, created_at, sent_at, completed_at
             FROM command_history WHERE command_id = ?1",
        )?;
        let entry = stmt
            .query_map([command_id], row_to_entry)?
            .next()
            .transpose()?;
        Ok(entry)
    }

    /// Most recent commands for a host, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_host(&self, hostname: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT command_id, kind, priority, target, hostname, status, result, created_at, sent_at, completed_at
             FROM command_history WHERE hostname = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![hostname, limit], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let result: Option<String> = row.get(6)?;
    Ok(HistoryEntry {
        command_id: row.get(0)?,
        kind: row.get(1)?,
        priority: row.get(2)?,
        target: row.get(3)?,
        hostname: row.get(4)?,
        status: row.get(5)?,
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        sent_at: row.get::<_, Option<String>>(8)?.as_deref().map(parse_datetime),
        completed_at: row.get::<_, Option<String>>(9)?.as_deref().map(parse_datetime),
    })
}

impl CommandJournal for CommandHistoryRepo {
    fn record(&self, state: &CommandState) -> Result<()> {
        let result = state
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO command_history
                (command_id, kind, priority, target, hostname, status, result, created_at, sent_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
             ON CONFLICT(command_id) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                sent_at = excluded.sent_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
            params![
                state.id,
                state.kind.as_str(),
                state.priority.as_str(),
                state.target,
                state.identity,
                state.status.as_str(),
                result,
                state.created_at.to_rfc3339(),
                state.sent_at.map(|t| t.to_rfc3339()),
                state.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandEnvelope, CommandKind, CommandStatus, Priority, Target};
    use crate::db::init_memory;

    #[test]
    fn record_upserts_latest_state() {
        let repo = CommandHistoryRepo::new(init_memory().unwrap());
        let envelope = CommandEnvelope::new(
            "cmd-1",
            CommandKind::BlockIp,
            Priority::Normal,
            serde_json::json!({"ip": "203.0.113.9"}),
            Target::Node("h1".into()),
        )
        .unwrap();

        let mut state = CommandState::pending(&envelope);
        repo.record(&state).unwrap();
        assert_eq!(repo.find("cmd-1").unwrap().unwrap().status, "pending");

        state.status = CommandStatus::Completed;
        state.completed_at = Some(Utc::now());
        state.result = Some(CommandResult {
            success: true,
            message: "blocked".to_string(),
            details: None,
        });
        repo.record(&state).unwrap();

        let entry = repo.find("cmd-1").unwrap().unwrap();
        assert_eq!(entry.status, "completed");
        assert_eq!(entry.kind, "block-ip");
        assert_eq!(entry.hostname.as_deref(), Some("h1"));
        assert!(entry.result.unwrap().success);
        assert!(entry.completed_at.is_some());

        assert_eq!(repo.list_for_host("h1", 10).unwrap().len(), 1);
        assert!(repo.find("missing").unwrap().is_none());
    }
}
