//! # Connection State
//!
//! Purpose: Track the lifecycle of the single logical connection and let
//! application threads block until a transition of interest happens.
//!
//! Each piece of shared lifecycle state (connection state, running flag,
//! exited flag) owns its own mutex and condition variable. Locks are held
//! only around the state itself, never across a user callback or a socket
//! write.

use std::sync::{Condvar, Mutex};

/// State of the connection to the server.
///
/// Transitions are forward-only within one connection's lifetime:
/// `NotConnected` leads to `Connected`, `ConnectError`, or `InitError`, and
/// `Connected` leads to `Disconnected` or `DisconnectError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Starting state; no connection attempt has resolved yet.
    NotConnected,
    /// Successfully connected.
    Connected,
    /// Successfully disconnected.
    Disconnected,
    /// The connection attempt failed.
    ConnectError,
    /// The connection was lost on error.
    DisconnectError,
    /// Event loop or socket setup failed before connecting.
    InitError,
}

impl ConnectionState {
    /// True for states the connection can never leave.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConnectionState::NotConnected | ConnectionState::Connected)
    }
}

/// Callback invoked on the event-loop thread at every state transition.
pub type StateCallback = Box<dyn FnMut(ConnectionState) + Send>;

/// Synchronized connection state with broadcast on every transition.
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<ConnectionState>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell {
            inner: Mutex::new(ConnectionState::NotConnected),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.inner.lock().expect("state mutex poisoned")
    }

    /// Publishes a transition and wakes every waiter.
    pub(crate) fn set(&self, state: ConnectionState) {
        {
            let mut current = self.inner.lock().expect("state mutex poisoned");
            *current = state;
        }
        self.changed.notify_all();
    }

    /// Rewinds to `NotConnected` at the start of a fresh connection lifetime.
    pub(crate) fn reset(&self) {
        self.set(ConnectionState::NotConnected);
    }

    /// Blocks until `predicate` holds, returning the state that satisfied it.
    pub(crate) fn wait_until(&self, predicate: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut current = self.inner.lock().expect("state mutex poisoned");
        while !predicate(*current) {
            current = self.changed.wait(current).expect("state mutex poisoned");
        }
        *current
    }
}

/// A boolean lifecycle flag with its own lock and condition variable.
#[derive(Debug)]
pub(crate) struct Flag {
    inner: Mutex<bool>,
    changed: Condvar,
}

impl Flag {
    pub(crate) fn new() -> Self {
        Flag {
            inner: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> bool {
        *self.inner.lock().expect("flag mutex poisoned")
    }

    pub(crate) fn set(&self, value: bool) {
        {
            let mut current = self.inner.lock().expect("flag mutex poisoned");
            *current = value;
        }
        self.changed.notify_all();
    }

    /// Blocks the calling thread until the flag equals `target`.
    pub(crate) fn wait_until(&self, target: bool) {
        let mut current = self.inner.lock().expect("flag mutex poisoned");
        while *current != target {
            current = self.changed.wait(current).expect("flag mutex poisoned");
        }
    }
}

/// Write-once latch for the connect outcome.
///
/// The first decision wins; a disconnect racing the caller's wait cannot
/// overwrite a connect that already succeeded.
#[derive(Debug)]
pub(crate) struct OutcomeCell {
    inner: Mutex<Option<bool>>,
    decided: Condvar,
}

impl OutcomeCell {
    pub(crate) fn new() -> Self {
        OutcomeCell {
            inner: Mutex::new(None),
            decided: Condvar::new(),
        }
    }

    /// Records the outcome; later writes are ignored.
    pub(crate) fn set(&self, success: bool) {
        {
            let mut current = self.inner.lock().expect("outcome mutex poisoned");
            if current.is_some() {
                return;
            }
            *current = Some(success);
        }
        self.decided.notify_all();
    }

    /// Clears the latch at the start of a fresh connection lifetime.
    pub(crate) fn reset(&self) {
        let mut current = self.inner.lock().expect("outcome mutex poisoned");
        *current = None;
    }

    /// Blocks until a decision was recorded and returns it.
    pub(crate) fn wait(&self) -> bool {
        let mut current = self.inner.lock().expect("outcome mutex poisoned");
        loop {
            if let Some(success) = *current {
                return success;
            }
            current = self.decided.wait(current).expect("outcome mutex poisoned");
        }
    }
}
