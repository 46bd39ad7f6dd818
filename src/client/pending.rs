//! Correlation table for in-flight calls
//!
//! Callers register under a fresh echo token and wait on a oneshot receiver.
//! The reader task resolves entries by echo; teardown fails every entry that
//! belongs to the dead connection. Each entry is removed exactly once, by
//! whichever of resolve / fail / guard drop gets there first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::protocol::ResponseFrame;

/// How a pending call ended, as seen by the waiting caller
#[derive(Debug)]
pub(crate) enum Resolution {
    Response(ResponseFrame),
    ConnectionLost,
}

#[derive(Debug)]
struct PendingCall {
    generation: u64,
    sink: oneshot::Sender<Resolution>,
}

/// Token → pending call map shared by callers and the reader task
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingCalls {
    inner: Arc<Mutex<HashMap<String, PendingCall>>>,
}

impl PendingCalls {
    fn calls(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call on connection `generation` under a token not currently in flight
    pub(crate) fn register(&self, generation: u64) -> (PendingGuard, oneshot::Receiver<Resolution>) {
        let (sink, receiver) = oneshot::channel();
        let mut calls = self.calls();

        let echo = loop {
            let candidate = generate_echo();
            if !calls.contains_key(&candidate) {
                break candidate;
            }
        };

        calls.insert(echo.clone(), PendingCall { generation, sink });
        drop(calls);

        let guard = PendingGuard {
            calls: self.clone(),
            echo,
        };
        (guard, receiver)
    }

    /// Deliver a response to the call waiting on its echo
    ///
    /// Returns false when no call on `generation` is waiting for that echo.
    pub(crate) fn resolve(&self, generation: u64, frame: ResponseFrame) -> bool {
        let call = {
            let mut calls = self.calls();
            match calls.get(&frame.echo) {
                Some(call) if call.generation == generation => calls.remove(&frame.echo),
                _ => None,
            }
        };

        call.is_some_and(|call| call.sink.send(Resolution::Response(frame)).is_ok())
    }

    /// Fail every call issued on `generation`, returning how many were waiting
    pub(crate) fn fail_generation(&self, generation: u64) -> usize {
        let failed: Vec<PendingCall> = {
            let mut calls = self.calls();
            let echoes: Vec<String> = calls
                .iter()
                .filter(|(_, call)| call.generation == generation)
                .map(|(echo, _)| echo.clone())
                .collect();
            echoes
                .iter()
                .filter_map(|echo| calls.remove(echo))
                .collect()
        };

        let count = failed.len();
        for call in failed {
            let _ = call.sink.send(Resolution::ConnectionLost);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls().len()
    }

    fn remove(&self, echo: &str) {
        self.calls().remove(echo);
    }
}

/// Keeps a pending call registered until dropped
///
/// Dropping the guard removes the entry, so a caller that returns early
/// (timeout, write failure, cancellation) never leaves a stale token behind.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    calls: PendingCalls,
    echo: String,
}

impl PendingGuard {
    pub(crate) fn echo(&self) -> &str {
        &self.echo
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.remove(&self.echo);
    }
}

/// Random 63-bit integer rendered as a decimal string
fn generate_echo() -> String {
    (rand::random::<u64>() >> 1).to_string()
}
