//! Shared test utilities

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lcsm_server::protocol::{CONTROL_SOCKET_PATH, Instance, NewInstance};
use lcsm_server::{DbPool, ProcessManager, Runner, RunnerConfig, db};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

/// Token every test runner accepts
pub const TEST_TOKEN: &str = "test-token";

/// How long a test waits on the network before failing
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Create a test instance in the database
pub fn create_test_instance(db: &DbPool, name: &str) -> Instance {
    use lcsm_server::db::{InstanceRepo, InstanceStore};

    let repo = InstanceRepo::new(db.clone());
    repo.create(&NewInstance {
        name: name.to_string(),
        description: String::new(),
        launch_command: "sleep 30".to_string(),
        working_directory: None,
    })
    .expect("failed to create test instance")
}

/// A real runner serving on a loopback port
pub struct TestRunner {
    pub addr: SocketAddr,
    pub endpoint: String,
    pub db: DbPool,
    pub processes: ProcessManager,
    pub data_dir: TempDir,
    handle: JoinHandle<lcsm_server::Result<()>>,
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        self.processes.kill_all();
        self.handle.abort();
    }
}

/// Spawn a runner on `127.0.0.1:0` backed by `db`
pub async fn spawn_runner(db: DbPool) -> TestRunner {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test runner");
    let addr = listener.local_addr().expect("no local addr");
    let data_dir = tempfile::tempdir().expect("failed to create data dir");

    let config = RunnerConfig {
        listen_addr: addr.to_string(),
        auth_token: TEST_TOKEN.to_string(),
        db_path: data_dir.path().join("unused.db"),
        data_dir: data_dir.path().to_path_buf(),
    };

    let runner = Runner::with_database(config, db.clone());
    let processes = runner.processes().clone();
    let handle = runner.spawn(listener);

    TestRunner {
        addr,
        endpoint: format!("ws://{addr}{CONTROL_SOCKET_PATH}"),
        db,
        processes,
        data_dir,
        handle,
    }
}

/// A scripted runner stand-in: tests drive each accepted socket by hand
pub struct MockRunner {
    pub endpoint: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
    handle: JoinHandle<()>,
}

impl Drop for MockRunner {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockRunner {
    /// Wait for the next client socket
    pub async fn next_connection(&mut self) -> MockConnection {
        tokio::time::timeout(STEP_TIMEOUT, self.connections.recv())
            .await
            .expect("no connection arrived")
            .expect("mock runner stopped")
    }

    /// Whether another socket has arrived that nobody picked up yet
    pub fn has_pending_connection(&mut self) -> bool {
        !self.connections.is_empty()
    }
}

/// Start a mock runner on `127.0.0.1:0`
pub async fn spawn_mock_runner() -> MockRunner {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock runner");
    let addr = listener.local_addr().expect("no local addr");
    let (tx, connections) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if tx.send(MockConnection { ws }).is_err() {
                break;
            }
        }
    });

    MockRunner {
        endpoint: format!("ws://{addr}{CONTROL_SOCKET_PATH}"),
        connections,
        handle,
    }
}

/// One accepted socket on the mock runner
pub struct MockConnection {
    ws: WebSocketStream<TcpStream>,
}

impl MockConnection {
    /// Next text frame as JSON
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(STEP_TIMEOUT, self.ws.next())
                .await
                .expect("no frame arrived")
                .expect("socket closed")
                .expect("read failed");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).expect("frame is not JSON");
            }
        }
    }

    /// Next `n` request frames
    pub async fn recv_requests(&mut self, n: usize) -> Vec<Value> {
        let mut requests = Vec::with_capacity(n);
        for _ in 0..n {
            requests.push(self.recv_json().await);
        }
        requests
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("send failed");
    }

    /// Read the auth frame and accept it; returns the frame
    pub async fn accept_auth(&mut self) -> Value {
        let frame = self.recv_json().await;
        self.send_json(&json!({"status": "Authenticated"})).await;
        frame
    }

    /// Read the auth frame, reject it, and close
    pub async fn reject_auth(mut self) {
        let _ = self.recv_json().await;
        self.send_json(&json!({"error": "Authentication failed"})).await;
        let _ = self.ws.close(None).await;
    }

    /// Answer a request with `data`
    pub async fn reply(&mut self, request: &Value, data: Value) {
        self.send_json(&json!({"echo": request["echo"], "data": data}))
            .await;
    }

    /// Whether the client closes the socket within the step timeout
    pub async fn wait_closed(&mut self) -> bool {
        let closed = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, closed).await.is_ok()
    }

    /// Close the socket with a close frame
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Poll `check` until it holds or the step timeout passes
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
