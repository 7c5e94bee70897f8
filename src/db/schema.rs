//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Known agents
        CREATE TABLE IF NOT EXISTS nodes (
            hostname TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'offline' CHECK(status IN ('online', 'offline')),
            isolated INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Node groups
        CREATE TABLE IF NOT EXISTS node_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS node_group_members (
            group_id TEXT NOT NULL REFERENCES node_groups(id) ON DELETE CASCADE,
            hostname TEXT NOT NULL REFERENCES nodes(hostname) ON DELETE CASCADE,
            added_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, hostname)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_host ON node_group_members(hostname);

        -- Commands parked for the fallback poll channel
        CREATE TABLE IF NOT EXISTS pending_commands (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            hostname TEXT NOT NULL,
            command_id TEXT NOT NULL UNIQUE,
            frame TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pending_host ON pending_commands(hostname, seq);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Latest known state of every command
        CREATE TABLE IF NOT EXISTS command_history (
            command_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            priority TEXT NOT NULL,
            target TEXT NOT NULL,
            hostname TEXT,
            status TEXT NOT NULL,
            result TEXT,
            created_at TEXT NOT NULL,
            sent_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_history_host ON command_history(hostname, created_at);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}
