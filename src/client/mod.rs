//! Panel-side client for a runner's control socket
//!
//! A [`RunnerClient`] owns at most one socket to one runner. The socket is
//! opened lazily on the first call, authenticated once, and shared by every
//! concurrent call; responses are matched to callers by echo token, so
//! they may arrive in any order.
//!
//! ```no_run
//! # async fn demo() -> lcsm_server::Result<()> {
//! use lcsm_server::client::RunnerClient;
//! use lcsm_server::protocol::PageQuery;
//!
//! let client = RunnerClient::new("ws://127.0.0.1:8008/lcsm-node.socket", "secret");
//! let page = client.list_instances(PageQuery::new(1, 10)).await?;
//! println!("{} instances", page.total);
//! # Ok(())
//! # }
//! ```

mod connection;
mod pending;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use self::connection::ConnectionSlot;
use self::pending::{PendingCalls, Resolution};
use crate::protocol::{Action, Instance, InstanceId, NewInstance, PageQuery, PageResult, RequestFrame};
use crate::{Error, Result};

pub use registry::{RunnerClients, RunnerDirectory, RunnerEndpoint, StaticDirectory};

/// Call window used when none is configured
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to one runner
pub struct RunnerClient {
    slot: Arc<ConnectionSlot>,
    pending: PendingCalls,
    timeout: Duration,
}

impl RunnerClient {
    /// Create a client; no socket is opened until the first call
    #[must_use]
    pub fn new(endpoint: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let pending = PendingCalls::default();
        let slot = ConnectionSlot::new(endpoint.into(), auth_token.into(), pending.clone());
        Self {
            slot: Arc::new(slot),
            pending,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the default call window
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.slot.endpoint()
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether an authenticated socket is currently open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot.current().is_some()
    }

    /// Number of calls waiting for a response
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Invoke an action with the default call window
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn invoke<P, R>(&self, action: Action, payload: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.invoke_with_timeout(action, payload, self.timeout).await
    }

    /// Invoke an action and decode its result
    ///
    /// An empty success decodes from JSON `null`, so `R = ()` and
    /// `R = Option<_>` accept it.
    ///
    /// # Errors
    ///
    /// Returns error if connecting or authenticating fails, the runner
    /// answers with an error, no answer arrives within `timeout`, the
    /// connection drops mid-call, or the result does not decode as `R`
    pub async fn invoke_with_timeout<P, R>(
        &self,
        action: Action,
        payload: &P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(payload)?;
        let result = self.invoke_raw(action.name(), data, timeout).await?;
        serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|e| Error::Protocol(format!("unexpected {action} result: {e}")))
    }

    /// Invoke an action by name with an untyped payload
    ///
    /// Returns the raw `data` of the response, `None` for an empty success.
    /// `timeout` bounds the whole call: waiting for a connection, the
    /// handshake, the write, and the response.
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn invoke_raw(
        &self,
        action: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let deadline = Instant::now() + timeout;
        let conn = self.slot.ensure_connected(deadline, timeout).await?;

        let (guard, receiver) = self.pending.register(conn.generation());
        if conn.is_closed() {
            return Err(Error::ConnectionLost);
        }

        let frame = RequestFrame {
            action: action.to_string(),
            data,
            echo: guard.echo().to_string(),
        };
        let text = serde_json::to_string(&frame)?;
        tokio::time::timeout_at(deadline, conn.send_text(text))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        tracing::debug!(action, echo = %guard.echo(), "request sent");

        let outcome = tokio::time::timeout_at(deadline, receiver).await;
        match outcome {
            Ok(Ok(Resolution::Response(response))) => response.into_result().map_err(Error::Remote),
            Ok(Ok(Resolution::ConnectionLost) | Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                tracing::debug!(action, echo = %guard.echo(), "call timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Close the socket, failing every in-flight call with `ConnectionLost`
    ///
    /// The client stays usable; the next call reconnects.
    pub async fn close(&self) {
        let conn = self.slot.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
    }

    /// One page of the runner's instances
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn list_instances(&self, query: PageQuery) -> Result<PageResult> {
        self.invoke(Action::ListInstances, &query).await
    }

    /// Create an instance on the runner
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn add_instance(&self, instance: &NewInstance) -> Result<Instance> {
        self.invoke(Action::AddInstance, instance).await
    }

    /// Start an instance's process
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn start_instance(&self, id: InstanceId) -> Result<()> {
        self.invoke(Action::StartInstance, &id).await
    }

    /// Ask an instance's process to exit
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn stop_instance(&self, id: InstanceId) -> Result<()> {
        self.invoke(Action::StopInstance, &id).await
    }

    /// Kill an instance's process
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn kill_instance(&self, id: InstanceId) -> Result<()> {
        self.invoke(Action::KillInstance, &id).await
    }

    /// Remove a stopped instance from the runner
    ///
    /// # Errors
    ///
    /// See [`RunnerClient::invoke_with_timeout`]
    pub async fn delete_instance(&self, id: InstanceId) -> Result<()> {
        self.invoke(Action::DeleteInstance, &id).await
    }
}

impl std::fmt::Debug for RunnerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerClient")
            .field("endpoint", &self.slot.endpoint())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for RunnerClient {
    fn drop(&mut self) {
        if let Some(conn) = self.slot.take() {
            conn.cancel();
        }
    }
}
