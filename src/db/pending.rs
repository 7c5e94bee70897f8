//! Per-agent queue of commands awaiting the fallback poll

use async_trait::async_trait;
use rusqlite::params;

use super::{DbPool, conn};
use crate::collaborators::PendingStore;
use crate::command::{CommandEnvelope, OutboundCommand};
use crate::{Error, Result};

/// Pending-command repository
///
/// Commands are stored as their outbound wire frame and returned in
/// insertion order.
#[derive(Clone)]
pub struct PendingCommandRepo {
    pool: DbPool,
}

impl PendingCommandRepo {
    /// Create a new pending-command repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Number of commands parked for a host
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self, hostname: &str) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_commands WHERE hostname = ?1",
            [hostname],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl PendingStore for PendingCommandRepo {
    async fn enqueue_for_poll(&self, identity: &str, envelope: &CommandEnvelope) -> Result<()> {
        let frame = serde_json::to_string(&OutboundCommand::from(envelope))?;
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_commands (hostname, command_id, frame) VALUES (?1, ?2, ?3)",
            params![identity, envelope.id(), frame],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn drain_for_poll(&self, identity: &str) -> Result<Vec<CommandEnvelope>> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction()?;

        let frames: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT frame FROM pending_commands WHERE hostname = ?1 ORDER BY seq",
            )?;
            let frames = stmt
                .query_map([identity], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            frames
        };
        tx.execute("DELETE FROM pending_commands WHERE hostname = ?1", [identity])?;
        tx.commit()?;

        let mut envelopes = Vec::with_capacity(frames.len());
        for frame in frames {
            let parsed = serde_json::from_str::<OutboundCommand>(&frame)
                .map_err(Error::from)
                .and_then(CommandEnvelope::try_from);
            match parsed {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    tracing::error!(identity, error = %e, "dropping unreadable pending command");
                }
            }
        }
        Ok(envelopes)
    }

    async fn withdraw(&self, identity: &str, command_id: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let removed = conn
            .execute(
                "DELETE FROM pending_commands WHERE hostname = ?1 AND command_id = ?2",
                [identity, command_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(removed > 0)
    }
}
