//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_dispatch::command::OutboundCommand;
use fleet_dispatch::db::{self, NodeRepo, PendingCommandRepo};
use fleet_dispatch::{AgentConnection, ChannelSink, Config, DbPool, Frame, Services};
use tokio::sync::mpsc;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Configuration with short timings for tests
#[must_use]
pub fn test_config(api_key: Option<&str>) -> Config {
    let mut config = Config::default();
    config.api_server.api_key = api_key.map(str::to_string);
    config.api_server.allow_unauthenticated = api_key.is_none();
    config.liveness.ping_after = Duration::from_secs(30);
    config.liveness.evict_after = Duration::from_secs(60);
    config.liveness.offline_grace = Duration::from_secs(5);
    config.dispatch.ack_timeout = Duration::from_secs(20);
    config.dispatch.write_timeout = Duration::from_secs(2);
    config.dispatch.queue_capacity = 16;
    config
}

/// Services wired to a fresh in-memory database
pub struct Harness {
    pub db: DbPool,
    pub services: Services,
    pub nodes: NodeRepo,
    pub pending: PendingCommandRepo,
}

impl Harness {
    #[must_use]
    pub fn new(api_key: Option<&str>) -> Self {
        let db = setup_test_db();
        let services = Services::with_database(test_config(api_key), &db);
        Self {
            nodes: NodeRepo::new(db.clone()),
            pending: PendingCommandRepo::new(db.clone()),
            services,
            db,
        }
    }

    /// Add hosts to the inventory
    pub fn seed_nodes(&self, hostnames: &[&str]) {
        for hostname in hostnames {
            self.nodes
                .create_node(hostname)
                .expect("failed to create test node");
        }
    }

    /// Add hosts to the inventory and to a group
    pub fn seed_group(&self, group: &str, hostnames: &[&str]) {
        self.nodes
            .create_group(group, group)
            .expect("failed to create test group");
        for hostname in hostnames {
            self.nodes
                .create_node(hostname)
                .expect("failed to create test node");
            self.nodes
                .add_to_group(group, hostname)
                .expect("failed to add test node to group");
        }
    }

    /// Register a channel-backed agent connection
    pub async fn connect(&self, identity: &str) -> (Arc<AgentConnection>, mpsc::Receiver<Frame>) {
        let (sink, rx) = ChannelSink::pair(16);
        let conn = self
            .services
            .registry
            .register(identity, Box::new(sink))
            .await;
        (conn, rx)
    }
}

/// Next command frame written to a channel-backed connection
pub fn next_command(rx: &mut mpsc::Receiver<Frame>) -> OutboundCommand {
    match rx.try_recv().expect("no frame was written") {
        Frame::Text(text) => serde_json::from_str(&text).expect("frame is not a command"),
        other => panic!("expected a command frame, got {other:?}"),
    }
}
