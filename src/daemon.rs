//! Daemon - the main dispatcher service
//!
//! Wires the registry, dispatcher, and background loops to the SQLite
//! adapters and the HTTP API, and shuts everything down on Ctrl-C.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiAuth, ApiServer, ApiState};
use crate::collaborators::{CommandJournal, Inventory, PendingStore};
use crate::command::{AckReaper, CommandStateStore};
use crate::db::{self, CommandHistoryRepo, DbPool, NodeRepo, PendingCommandRepo};
use crate::dispatch::Dispatcher;
use crate::events::EventBus;
use crate::inbound::InboundRouter;
use crate::liveness::LivenessMonitor;
use crate::reconciler::StatusReconciler;
use crate::registry::ConnectionRegistry;
use crate::{Config, Result};

/// Core components shared by the API and the background loops
pub struct Services {
    pub events: EventBus,
    pub registry: Arc<ConnectionRegistry>,
    pub states: Arc<CommandStateStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<InboundRouter>,
    pub inventory: Arc<dyn Inventory>,
    pub pending: Arc<dyn PendingStore>,
    config: Config,
}

impl Services {
    /// Wire the core around the given collaborators
    #[must_use]
    pub fn new(
        config: Config,
        inventory: Arc<dyn Inventory>,
        pending: Arc<dyn PendingStore>,
        journal: Option<Arc<dyn CommandJournal>>,
    ) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(
            events.clone(),
            config.liveness.offline_grace,
        ));

        let mut states = CommandStateStore::new(events.clone());
        if let Some(journal) = journal {
            states = states.with_journal(journal);
        }
        let states = Arc::new(states);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&states),
            Arc::clone(&inventory),
            Arc::clone(&pending),
            config.dispatch.queue_capacity,
            config.dispatch.write_timeout,
        ));
        let router = Arc::new(InboundRouter::new(
            Arc::clone(&registry),
            Arc::clone(&states),
            config.dispatch.max_malformed_frames,
        ));

        Self {
            events,
            registry,
            states,
            dispatcher,
            router,
            inventory,
            pending,
            config,
        }
    }

    /// Wire the core around SQLite-backed collaborators
    #[must_use]
    pub fn with_database(config: Config, pool: &DbPool) -> Self {
        Self::new(
            config,
            Arc::new(NodeRepo::new(pool.clone())),
            Arc::new(PendingCommandRepo::new(pool.clone())),
            Some(Arc::new(CommandHistoryRepo::new(pool.clone()))),
        )
    }

    /// Effective configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Shared state for the HTTP API
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no API key is configured and unauthenticated
    /// access was not explicitly allowed
    pub fn api_state(&self) -> Result<Arc<ApiState>> {
        Ok(Arc::new(ApiState {
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::clone(&self.dispatcher),
            router: Arc::clone(&self.router),
            inventory: Arc::clone(&self.inventory),
            pending: Arc::clone(&self.pending),
            auth: ApiAuth::from_config(&self.config.api_server)?,
        }))
    }

    /// Start the queue drain, liveness sweep, ack reaper, and status reconciler
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let dispatch = &self.config.dispatch;

        let reconciler = StatusReconciler::new(Arc::clone(&self.inventory));
        let reconciler_rx = self.events.subscribe();

        let liveness = LivenessMonitor::new(
            Arc::clone(&self.registry),
            self.config.liveness.clone(),
            dispatch.write_timeout,
        );
        let reaper = AckReaper::new(
            Arc::clone(&self.states),
            Arc::clone(&self.pending),
            dispatch.reaper_interval,
            dispatch.ack_timeout,
            dispatch.retention,
        );

        vec![
            tokio::spawn(reconciler.run(reconciler_rx, cancel.clone())),
            tokio::spawn(Arc::clone(&self.dispatcher).run(cancel.clone())),
            tokio::spawn(liveness.run(cancel.clone())),
            tokio::spawn(reaper.run(cancel.clone())),
        ]
    }
}

/// The fleet dispatcher daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Open the database and prepare the daemon
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or database cannot be initialized
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.db_path();
        let db = db::init(&db_path)?;

        tracing::info!(path = %db_path.display(), "database initialized");

        Ok(Self { config, db })
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured without the development
    /// override, or if the API server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let port = self.config.api_server.port;
        let services = Services::with_database(self.config, &self.db);
        // Resolve auth before anything starts so a missing key stops startup
        let api_state = services.api_state()?;

        let cancel = CancellationToken::new();
        let background = services.spawn_background(&cancel);

        let server_cancel = cancel.clone();
        let server = ApiServer::new(api_state, port)
            .spawn(async move { server_cancel.cancelled().await });

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");

        cancel.cancel();
        services.registry.close_all().await;

        for handle in background {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        match server.await {
            Ok(result) => result?,
            Err(e) => tracing::warn!(error = %e, "API server task ended abnormally"),
        }

        tracing::info!("fleet dispatcher stopped");
        Ok(())
    }
}
