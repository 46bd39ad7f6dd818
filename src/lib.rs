//! LCSM control plane - panel ↔ runner RPC over WebSocket
//!
//! A panel drives any number of runners. Each runner serves one control
//! socket; the panel authenticates with a shared token and then issues
//! correlated request/response calls over it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐
//! │            Panel              │
//! │  RunnerClients → RunnerClient │
//! │    (echo-correlated calls)    │
//! └──────────────┬────────────────┘
//!                │ ws://host:8008/lcsm-node.socket
//! ┌──────────────▼────────────────┐
//! │            Runner             │
//! │  auth gate → ControlService   │
//! │   → instance handlers         │
//! │   → SQLite + ProcessManager   │
//! └───────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod instances;
pub mod process;
pub mod protocol;
pub mod runner;
pub mod server;

pub use client::{RunnerClient, RunnerClients, RunnerDirectory, RunnerEndpoint, StaticDirectory};
pub use config::{PanelConfig, RunnerConfig, RunnerEntry, RunnerSettings};
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use process::ProcessManager;
pub use protocol::{Action, Instance, InstanceId, NewInstance, PageQuery, PageResult};
pub use runner::Runner;
pub use server::{ActionHandler, ActionTable, ControlService, HandlerError, RunnerServer};
