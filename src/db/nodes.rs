//! Node inventory repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use super::{DbPool, conn, parse_datetime};
use crate::collaborators::{AgentRecord, Inventory};
use crate::{Error, Result};

/// A known agent host
#[derive(Debug, Clone)]
pub struct Node {
    pub hostname: String,
    pub status: String,
    pub isolated: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Node> for AgentRecord {
    fn from(node: Node) -> Self {
        Self {
            identity: node.hostname,
            status: node.status,
            isolated: node.isolated,
        }
    }
}

/// Node and group repository
#[derive(Clone)]
pub struct NodeRepo {
    pool: DbPool,
}

impl NodeRepo {
    /// Create a new node repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Add a host to the inventory (no-op if it already exists)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_node(&self, hostname: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR IGNORE INTO nodes (hostname) VALUES (?1)",
            [hostname],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Find a node by hostname
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, hostname: &str) -> Result<Option<Node>> {
        let conn = conn(&self.pool)?;
        let node = conn
            .query_row(
                "SELECT hostname, status, isolated, last_seen, created_at FROM nodes WHERE hostname = ?1",
                [hostname],
                |row| {
                    Ok(Node {
                        hostname: row.get(0)?,
                        status: row.get(1)?,
                        isolated: row.get(2)?,
                        last_seen: row
                            .get::<_, Option<String>>(3)?
                            .as_deref()
                            .map(parse_datetime),
                        created_at: parse_datetime(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(node)
    }

    /// Create a group (no-op if it already exists)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_group(&self, id: &str, name: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR IGNORE INTO node_groups (id, name) VALUES (?1, ?2)",
            [id, name],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Add a node to a group
    ///
    /// # Errors
    ///
    /// Returns error if the node or group does not exist
    pub fn add_to_group(&self, group_id: &str, hostname: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT OR IGNORE INTO node_group_members (group_id, hostname) VALUES (?1, ?2)",
            [group_id, hostname],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Remove a node from a group; returns whether it was a member
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn remove_from_group(&self, group_id: &str, hostname: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let removed = conn
            .execute(
                "DELETE FROM node_group_members WHERE group_id = ?1 AND hostname = ?2",
                [group_id, hostname],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(removed > 0)
    }

    /// Hostnames in a group, sorted
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn members(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT hostname FROM node_group_members WHERE group_id = ?1 ORDER BY hostname",
        )?;
        let members = stmt
            .query_map([group_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(members)
    }

    fn set_status(&self, hostname: &str, status: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        let now = Utc::now().to_rfc3339();
        let updated = conn
            .execute(
                "UPDATE nodes SET status = ?2, last_seen = ?3, updated_at = ?3 WHERE hostname = ?1",
                [hostname, status, &now],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if updated == 0 {
            return Err(Error::UnknownAgent(hostname.to_string()));
        }
        Ok(())
    }

    /// Record the isolation flag for a node
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownAgent` if the node does not exist
    pub fn set_isolated_flag(&self, hostname: &str, isolated: bool) -> Result<()> {
        let conn = conn(&self.pool)?;
        let now = Utc::now().to_rfc3339();
        let updated = conn
            .execute(
                "UPDATE nodes SET isolated = ?2, updated_at = ?3 WHERE hostname = ?1",
                rusqlite::params![hostname, isolated, now],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if updated == 0 {
            return Err(Error::UnknownAgent(hostname.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Inventory for NodeRepo {
    async fn get_by_identity(&self, identity: &str) -> Result<Option<AgentRecord>> {
        Ok(self.find(identity)?.map(AgentRecord::from))
    }

    async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.members(group_id)
    }

    async fn set_online(&self, identity: &str) -> Result<()> {
        self.set_status(identity, "online")
    }

    async fn set_offline(&self, identity: &str) -> Result<()> {
        self.set_status(identity, "offline")
    }

    async fn set_isolated(&self, identity: &str, isolated: bool) -> Result<()> {
        self.set_isolated_flag(identity, isolated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> NodeRepo {
        let repo = NodeRepo::new(init_memory().unwrap());
        repo.create_node("h1").unwrap();
        repo.create_node("h2").unwrap();
        repo
    }

    #[tokio::test]
    async fn lookup_by_identity() {
        let repo = setup();
        let record = repo.get_by_identity("h1").await.unwrap().unwrap();
        assert_eq!(record.identity, "h1");
        assert_eq!(record.status, "offline");
        assert!(!record.isolated);
        assert!(repo.get_by_identity("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_isolation_flags() {
        let repo = setup();
        repo.set_online("h1").await.unwrap();
        repo.set_isolated("h1", true).await.unwrap();

        let node = repo.find("h1").unwrap().unwrap();
        assert_eq!(node.status, "online");
        assert!(node.isolated);
        assert!(node.last_seen.is_some());

        repo.set_offline("h1").await.unwrap();
        assert_eq!(repo.find("h1").unwrap().unwrap().status, "offline");

        assert!(matches!(
            repo.set_online("ghost").await,
            Err(Error::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn group_membership() {
        let repo = setup();
        repo.create_group("g1", "Finance").unwrap();
        repo.add_to_group("g1", "h2").unwrap();
        repo.add_to_group("g1", "h1").unwrap();

        assert_eq!(repo.list_group_members("g1").await.unwrap(), vec!["h1", "h2"]);
        assert!(repo.remove_from_group("g1", "h1").unwrap());
        assert_eq!(repo.list_group_members("g1").await.unwrap(), vec!["h2"]);
        assert!(repo.list_group_members("empty").await.unwrap().is_empty());
    }

    #[test]
    fn membership_requires_known_node() {
        let repo = setup();
        repo.create_group("g1", "Finance").unwrap();
        assert!(repo.add_to_group("g1", "ghost").is_err());
    }
}
