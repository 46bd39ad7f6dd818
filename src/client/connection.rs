//! One live socket to a runner: open, handshake, read, tear down

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::pending::PendingCalls;
use crate::protocol::{AuthFrame, AuthReply, ResponseFrame};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// How long teardown waits for the close frame to go out
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// An authenticated socket plus its reader task
pub(crate) struct ActiveConnection {
    generation: u64,
    sink: tokio::sync::Mutex<WsSink>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ActiveConnection {
    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one text frame; a failed write tears the connection down
    pub(crate) async fn send_text(&self, text: String) -> Result<()> {
        let result = self.sink.lock().await.send(Message::Text(text)).await;
        if let Err(e) = result {
            tracing::debug!(generation = self.generation, error = %e, "write failed");
            self.cancel();
            return Err(Error::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Mark closed and ask the reader to stop; safe to call any number of times
    pub(crate) fn cancel(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
    }

    /// Cancel and wait for the reader to finish its teardown
    pub(crate) async fn shutdown(&self) {
        self.cancel();
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }
    }
}

/// Per-client socket slot
///
/// At most one connection is live at a time. `connecting` is held across
/// connect and handshake so concurrent callers share a single attempt;
/// `active` is only ever locked briefly and never across an await.
pub(crate) struct ConnectionSlot {
    endpoint: String,
    auth_token: String,
    pending: PendingCalls,
    active: Mutex<Option<Arc<ActiveConnection>>>,
    connecting: tokio::sync::Mutex<()>,
    generations: AtomicU64,
}

impl ConnectionSlot {
    pub(crate) fn new(endpoint: String, auth_token: String, pending: PendingCalls) -> Self {
        Self {
            endpoint,
            auth_token,
            pending,
            active: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn active(&self) -> MutexGuard<'_, Option<Arc<ActiveConnection>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live connection, opening and authenticating one if needed
    ///
    /// Waiting for another caller's handshake counts against `deadline`.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be opened, the runner rejects the
    /// token, or no connection is ready by `deadline`
    pub(crate) async fn ensure_connected(
        self: &Arc<Self>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Arc<ActiveConnection>> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        tokio::time::timeout_at(deadline, self.connect())
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn connect(self: &Arc<Self>) -> Result<Arc<ActiveConnection>> {
        let _connecting = self.connecting.lock().await;
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let ws = self.open().await?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = ws.split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let conn = Arc::new(ActiveConnection {
            generation,
            sink: tokio::sync::Mutex::new(sink),
            shutdown: Mutex::new(Some(shutdown_tx)),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        *self.active() = Some(Arc::clone(&conn));

        let handle = tokio::spawn(read_loop(
            Arc::clone(self),
            Arc::clone(&conn),
            stream,
            shutdown_rx,
        ));
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(endpoint = %self.endpoint, generation, "connected to runner");
        Ok(conn)
    }

    /// Current connection, if one is live
    pub(crate) fn current(&self) -> Option<Arc<ActiveConnection>> {
        self.active()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Detach the current connection from the slot
    pub(crate) fn take(&self) -> Option<Arc<ActiveConnection>> {
        self.active().take()
    }

    async fn open(&self) -> Result<WsStream> {
        if self.endpoint.starts_with("wss://") {
            return Err(Error::Config(format!(
                "TLS runner endpoints are not supported, use ws://: {}",
                self.endpoint
            )));
        }

        let (mut ws, _response) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {e}", self.endpoint)))?;

        if let Err(e) = self.handshake(&mut ws).await {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "runner handshake failed");
            let _ = ws.close(None).await;
            return Err(e);
        }

        Ok(ws)
    }

    async fn handshake(&self, ws: &mut WsStream) -> Result<()> {
        let frame = serde_json::to_string(&AuthFrame::new(self.auth_token.as_str()))?;
        ws.send(Message::Text(frame)).await?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply: AuthReply = serde_json::from_str(&text)
                        .map_err(|e| Error::Protocol(format!("invalid auth reply: {e}")))?;
                    if let Some(error) = reply.failure() {
                        return Err(Error::AuthenticationFailed(error.to_string()));
                    }
                    return Ok(());
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::Transport(
                        "runner closed the connection during handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Route one inbound text frame to its pending call
    fn route(&self, conn: &ActiveConnection, text: &str) {
        let frame: ResponseFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "undecodable response frame, dropping");
                return;
            }
        };

        let echo = frame.echo.clone();
        if !self.pending.resolve(conn.generation, frame) {
            tracing::warn!(endpoint = %self.endpoint, echo = %echo, "no pending call for echo, dropping");
        }
    }

    /// Fail the dead connection's calls and free the slot for a reconnect
    async fn teardown(&self, conn: &ActiveConnection) {
        conn.cancel();
        let failed = self.pending.fail_generation(conn.generation);

        {
            let mut active = self.active();
            if active
                .as_ref()
                .is_some_and(|current| current.generation == conn.generation)
            {
                *active = None;
            }
        }

        let mut sink = conn.sink.lock().await;
        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;

        tracing::info!(
            endpoint = %self.endpoint,
            generation = conn.generation,
            failed,
            "runner connection closed"
        );
    }
}

async fn read_loop(
    slot: Arc<ConnectionSlot>,
    conn: Arc<ActiveConnection>,
    mut stream: SplitStream<WsStream>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::debug!(generation = conn.generation, "reader cancelled");
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => slot.route(&conn, &text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => slot.route(&conn, &text),
                Err(_) => tracing::warn!(endpoint = %slot.endpoint, "non-UTF-8 binary frame, dropping"),
            },
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(endpoint = %slot.endpoint, ?frame, "runner sent close");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!(endpoint = %slot.endpoint, error = %e, "read from runner failed");
                break;
            }
            None => break,
        }
    }

    slot.teardown(&conn).await;
}
