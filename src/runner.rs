//! Runner - the node-side service
//!
//! Wires the database, process table, and instance handlers into a
//! control server.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::RunnerConfig;
use crate::db::{self, DbPool, InstanceRepo};
use crate::instances::{self, InstanceContext};
use crate::process::ProcessManager;
use crate::server::{ControlService, RunnerServer};
use crate::{Error, Result};

/// A configured runner, ready to serve
pub struct Runner {
    config: RunnerConfig,
    db: DbPool,
    processes: ProcessManager,
}

impl Runner {
    /// Open the database and set up the process table
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let db = db::init(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "database initialized");
        Ok(Self::with_database(config, db))
    }

    /// Build a runner on an existing pool
    ///
    /// Instance output is logged under `<data_dir>/logs`.
    #[must_use]
    pub fn with_database(config: RunnerConfig, db: DbPool) -> Self {
        let processes = ProcessManager::with_log_dir(config.data_dir.join("logs"));
        Self {
            config,
            db,
            processes,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[must_use]
    pub const fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    fn server(&self) -> RunnerServer {
        let store = Arc::new(InstanceRepo::new(self.db.clone()));
        let ctx = Arc::new(InstanceContext::new(
            store,
            self.processes.clone(),
            self.config.data_dir.clone(),
        ));
        let service = ControlService::new(self.config.auth_token.clone(), instances::action_table(&ctx));
        RunnerServer::new(service, self.db.clone(), self.processes.clone())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    ///
    /// Every instance process is killed on the way out.
    ///
    /// # Errors
    ///
    /// Returns error if binding or serving fails
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {}: {e}", self.config.listen_addr)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        std::fs::create_dir_all(&self.config.data_dir)?;

        let result = self.server().serve(listener, shutdown).await;

        let running = self.processes.running_count();
        if running > 0 {
            tracing::info!(running, "killing instance processes");
            self.processes.kill_all();
        }
        result
    }

    /// Serve on `listener` in a background task
    #[must_use]
    pub fn spawn(self, listener: TcpListener) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.serve(listener, std::future::pending()).await })
    }
}
