//! Child process table for running instances
//!
//! Each running instance owns one child process and one supervisor task. The
//! supervisor is the only place that touches the `Child`; stop and kill
//! requests reach it over a channel, and it removes the table entry once the
//! child has exited.
//!
//! Child output is forwarded to `tracing`. With a log directory configured,
//! it is also written to `<log_dir>/<id>.log`, truncated on every start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::protocol::InstanceId;
use crate::{Error, Result};

/// How a running instance should be brought down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to exit (SIGTERM on unix)
    Terminate,
    /// Kill the process outright
    Kill,
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new child was spawned
    Started { pid: Option<u32> },
    /// The instance already had a live child; nothing was spawned
    AlreadyRunning,
}

struct ProcessHandle {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<StopSignal>,
}

type ProcessTable = Arc<Mutex<HashMap<InstanceId, ProcessHandle>>>;

/// Tracks one child process per instance id
#[derive(Clone, Default)]
pub struct ProcessManager {
    processes: ProcessTable,
    log_dir: Option<PathBuf>,
}

impl ProcessManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager that also writes each child's output to `<log_dir>/<id>.log`
    #[must_use]
    pub fn with_log_dir(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            processes: ProcessTable::default(),
            log_dir: Some(log_dir.into()),
        }
    }

    /// Log file for the instance, if file logging is enabled
    #[must_use]
    pub fn log_path(&self, id: InstanceId) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{id}.log")))
    }

    fn create_log(&self, id: InstanceId) -> Result<Option<std::fs::File>> {
        let (Some(dir), Some(path)) = (&self.log_dir, self.log_path(id)) else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;
        Ok(Some(std::fs::File::create(path)?))
    }

    fn table(&self) -> MutexGuard<'_, HashMap<InstanceId, ProcessHandle>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the instance currently has a live child
    #[must_use]
    pub fn is_running(&self, id: InstanceId) -> bool {
        self.table().contains_key(&id)
    }

    /// Process id of the instance's child, if running
    #[must_use]
    pub fn pid(&self, id: InstanceId) -> Option<u32> {
        self.table().get(&id).and_then(|handle| handle.pid)
    }

    /// Number of live children
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.table().len()
    }

    /// Spawn the instance's launch command in `working_dir`
    ///
    /// The first whitespace-separated token is the program, the rest are its
    /// arguments. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the command is empty, the working directory cannot be
    /// created, or the spawn fails
    pub fn start(
        &self,
        id: InstanceId,
        launch_command: &str,
        working_dir: &Path,
    ) -> Result<StartOutcome> {
        let mut parts = launch_command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(Error::Process("empty launch command".to_string()));
        };

        if self.is_running(id) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        std::fs::create_dir_all(working_dir)?;
        let log_file = self.create_log(id)?;

        let mut table = self.table();
        if table.contains_key(&id) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let mut child = Command::new(program)
            .args(parts)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn `{program}`: {e}")))?;

        let pid = child.id();
        let log = log_file.map(|file| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_log(id, file, rx));
            tx
        });
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(id, "stdout", stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(id, "stderr", stderr, log));
        }

        let (signals, signal_rx) = mpsc::unbounded_channel();
        table.insert(id, ProcessHandle { pid, signals });
        drop(table);

        tokio::spawn(supervise(id, child, signal_rx, Arc::clone(&self.processes)));

        tracing::info!(instance_id = id, ?pid, program, "instance process started");
        Ok(StartOutcome::Started { pid })
    }

    /// Ask the instance's child to exit
    ///
    /// # Errors
    ///
    /// Returns error if the instance has no live child
    pub fn stop(&self, id: InstanceId, signal: StopSignal) -> Result<()> {
        let table = self.table();
        let handle = table
            .get(&id)
            .ok_or_else(|| Error::Process(format!("instance {id} is not running")))?;

        handle
            .signals
            .send(signal)
            .map_err(|_| Error::Process(format!("instance {id} is already exiting")))?;

        tracing::info!(instance_id = id, ?signal, "stop requested");
        Ok(())
    }

    /// Kill every live child, used on runner shutdown
    pub fn kill_all(&self) {
        for (id, handle) in self.table().iter() {
            if handle.signals.send(StopSignal::Kill).is_ok() {
                tracing::debug!(instance_id = id, "kill requested on shutdown");
            }
        }
    }
}

enum SupervisorEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Signal(Option<StopSignal>),
}

async fn supervise(
    id: InstanceId,
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
    processes: ProcessTable,
) {
    let mut signals_open = true;

    loop {
        let event = tokio::select! {
            status = child.wait() => SupervisorEvent::Exited(status),
            signal = signals.recv(), if signals_open => SupervisorEvent::Signal(signal),
        };

        match event {
            SupervisorEvent::Exited(Ok(status)) => {
                tracing::info!(instance_id = id, %status, "instance process exited");
                break;
            }
            SupervisorEvent::Exited(Err(e)) => {
                tracing::error!(instance_id = id, error = %e, "failed to wait on instance process");
                break;
            }
            SupervisorEvent::Signal(Some(StopSignal::Terminate)) => terminate(id, &mut child),
            SupervisorEvent::Signal(Some(StopSignal::Kill)) => kill(id, &mut child),
            SupervisorEvent::Signal(None) => {
                signals_open = false;
                kill(id, &mut child);
            }
        }
    }

    processes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

fn kill(id: InstanceId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(instance_id = id, error = %e, "failed to kill instance process");
    }
}

#[cfg(unix)]
fn terminate(id: InstanceId, child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::warn!(instance_id = id, error = %e, "SIGTERM failed, killing instead");
        kill(id, child);
    }
}

#[cfg(not(unix))]
fn terminate(id: InstanceId, child: &mut Child) {
    kill(id, child);
}

async fn forward_output<R>(
    id: InstanceId,
    stream: &'static str,
    output: R,
    log: Option<mpsc::UnboundedSender<String>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(instance_id = id, stream, "{line}");
                if let Some(log) = &log {
                    let _ = log.send(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(instance_id = id, stream, error = %e, "output stream closed");
                break;
            }
        }
    }
}

/// Append output lines to the instance log until every stream has closed
async fn write_log(id: InstanceId, file: std::fs::File, mut lines: mpsc::UnboundedReceiver<String>) {
    let mut file = tokio::fs::File::from_std(file);
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(instance_id = id, error = %e, "failed to write instance log");
            break;
        }
    }
}
