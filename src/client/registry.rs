//! Ownership table of runner clients, keyed by runner id

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{DEFAULT_CALL_TIMEOUT, RunnerClient};
use crate::config::RunnerEntry;
use crate::{Error, Result};

/// Where to reach a runner and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEndpoint {
    pub endpoint: String,
    pub auth_token: String,
}

/// Resolves runner ids to endpoints
#[async_trait]
pub trait RunnerDirectory: Send + Sync {
    /// Look up the endpoint for `runner_id`
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunnerNotFound`] if the id is unknown
    async fn resolve(&self, runner_id: u64) -> Result<RunnerEndpoint>;
}

/// Fixed directory built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    runners: HashMap<u64, RunnerEndpoint>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured runner entries; later duplicates win
    #[must_use]
    pub fn from_entries(entries: &[RunnerEntry]) -> Self {
        let mut directory = Self::new();
        for entry in entries {
            directory.insert(entry.id, &entry.endpoint, &entry.auth_token);
        }
        directory
    }

    pub fn insert(&mut self, runner_id: u64, endpoint: &str, auth_token: &str) {
        self.runners.insert(
            runner_id,
            RunnerEndpoint {
                endpoint: endpoint.to_string(),
                auth_token: auth_token.to_string(),
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[async_trait]
impl RunnerDirectory for StaticDirectory {
    async fn resolve(&self, runner_id: u64) -> Result<RunnerEndpoint> {
        self.runners
            .get(&runner_id)
            .cloned()
            .ok_or(Error::RunnerNotFound(runner_id))
    }
}

/// One [`RunnerClient`] per runner, created on first use
///
/// Passed around as a dependency; callers share clients through `Arc`.
pub struct RunnerClients {
    directory: Arc<dyn RunnerDirectory>,
    timeout: Duration,
    clients: tokio::sync::Mutex<HashMap<u64, Arc<RunnerClient>>>,
}

impl RunnerClients {
    #[must_use]
    pub fn new(directory: Arc<dyn RunnerDirectory>) -> Self {
        Self {
            directory,
            timeout: DEFAULT_CALL_TIMEOUT,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Call window given to clients created from now on
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The client for `runner_id`, creating it if this is the first request
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot resolve the runner
    pub async fn get(&self, runner_id: u64) -> Result<Arc<RunnerClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&runner_id) {
            return Ok(Arc::clone(client));
        }

        let target = self.directory.resolve(runner_id).await?;
        let client = Arc::new(
            RunnerClient::new(target.endpoint, target.auth_token).with_timeout(self.timeout),
        );
        clients.insert(runner_id, Arc::clone(&client));
        tracing::debug!(runner_id, endpoint = %client.endpoint(), "runner client created");

        Ok(client)
    }

    /// Close and forget the client for `runner_id`
    ///
    /// Returns false if no client existed.
    pub async fn close(&self, runner_id: u64) -> bool {
        let client = self.clients.lock().await.remove(&runner_id);
        match client {
            Some(client) => {
                client.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every client
    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.lock().await.drain().collect();
        for (runner_id, client) in clients {
            client.close().await;
            tracing::debug!(runner_id, "runner client closed");
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Arc<dyn RunnerDirectory> {
        let mut directory = StaticDirectory::new();
        directory.insert(1, "ws://127.0.0.1:1/lcsm-node.socket", "one");
        directory.insert(2, "ws://127.0.0.1:2/lcsm-node.socket", "two");
        Arc::new(directory)
    }

    #[tokio::test]
    async fn static_directory_resolves_known_ids() {
        let dir = directory();
        let target = dir.resolve(2).await.unwrap();
        assert_eq!(target.auth_token, "two");

        assert!(matches!(
            dir.resolve(3).await,
            Err(Error::RunnerNotFound(3))
        ));
    }

    #[tokio::test]
    async fn get_reuses_client() {
        let clients = RunnerClients::new(directory()).with_timeout(Duration::from_secs(5));

        let a = clients.get(1).await.unwrap();
        let b = clients.get(1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.timeout(), Duration::from_secs(5));
        assert!(!a.is_connected());

        let other = clients.get(2).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(clients.len().await, 2);
    }

    #[tokio::test]
    async fn unknown_runner_creates_nothing() {
        let clients = RunnerClients::new(directory());
        assert!(clients.get(99).await.is_err());
        assert!(clients.is_empty().await);
    }

    #[tokio::test]
    async fn close_removes_client() {
        let clients = RunnerClients::new(directory());
        let first = clients.get(1).await.unwrap();

        assert!(clients.close(1).await);
        assert!(!clients.close(1).await);

        let second = clients.get(1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        clients.close_all().await;
        assert!(clients.is_empty().await);
    }

    #[test]
    fn from_entries_builds_directory() {
        let entries = vec![RunnerEntry {
            id: 7,
            endpoint: "ws://runner:8008/lcsm-node.socket".to_string(),
            auth_token: "t".to_string(),
        }];
        let directory = StaticDirectory::from_entries(&entries);
        assert_eq!(directory.len(), 1);
    }
}
