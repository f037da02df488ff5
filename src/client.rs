//! # Client Facade
//!
//! Purpose: Public entry point for the asynchronous command client. Owns the
//! background event-loop thread and exposes connection lifecycle control plus
//! the command submission surface.
//!
//! ## Design Principles
//! 1. **Thread-Safe Submission**: Any application thread may submit commands;
//!    they are handed to the loop thread over channels.
//! 2. **Blocking Lifecycle Edges**: `connect` blocks until the connection
//!    outcome is known, `disconnect` until the loop has drained and exited.
//! 3. **Admission Control**: Commands created while not connected, or while a
//!    shutdown is in progress, resolve `SendError` immediately instead of
//!    silently vanishing.
//! 4. **Statuses Over Panics**: Every failure surfaces as a reply status or a
//!    typed error; the client never panics on server behavior.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::command::{
    Callback, Command, CommandCore, CommandPayload, DispatchCommand, DispatchHandle, ReplyStatus,
    Schedule,
};
use crate::driver::{self, DriverConfig, Endpoint, Shared};
use crate::reply::Reply;
use crate::resp::RespValue;
use crate::state::{ConnectionState, StateCallback};

/// Default server host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default unix-domain socket path.
#[cfg(unix)]
pub const DEFAULT_UNIX_SOCKET: &str = "/var/run/redis/redis.sock";

/// Tunables for a client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on how long a connection attempt may take before it is
    /// reported as `ConnectError`.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Error returned by the synchronous convenience operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server returned an error reply.
    #[error("server error for '{command}': {message}")]
    ErrorReply { command: String, message: String },
    /// The command did not complete successfully.
    #[error("command '{command}' failed with status {status:?}")]
    Failed {
        command: String,
        status: ReplyStatus,
    },
}

/// Submission side of the three dispatcher queues.
struct Channels {
    submit: UnboundedSender<DispatchHandle>,
    stop: UnboundedSender<()>,
    reclaim: UnboundedSender<DispatchHandle>,
}

/// Asynchronous command client backed by one event-loop thread.
///
/// All methods take `&self`; the client is meant to be shared across threads
/// behind an `Arc` if needed.
pub struct Client {
    shared: Arc<Shared>,
    config: ClientConfig,
    channels: Mutex<Option<Channels>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// Creates a disconnected client with default tunables.
    pub fn new() -> Self {
        Client::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Client {
            shared: Shared::new(),
            config,
            channels: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Connects over TCP and starts the event-loop thread.
    ///
    /// Blocks until the connection outcome is known and returns true only
    /// when the loop is connected and running. `on_state_change`, when given,
    /// is invoked from the loop thread at every state transition.
    pub fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        on_state_change: Option<StateCallback>,
    ) -> bool {
        self.start(
            Endpoint::Tcp {
                host: host.into(),
                port,
            },
            on_state_change,
        )
    }

    /// Connects to the default endpoint, `localhost:6379`.
    pub fn connect_default(&self, on_state_change: Option<StateCallback>) -> bool {
        self.connect(DEFAULT_HOST, DEFAULT_PORT, on_state_change)
    }

    /// Connects over a unix-domain socket and starts the event-loop thread.
    #[cfg(unix)]
    pub fn connect_unix(
        &self,
        path: impl Into<String>,
        on_state_change: Option<StateCallback>,
    ) -> bool {
        self.start(Endpoint::Unix { path: path.into() }, on_state_change)
    }

    fn start(&self, endpoint: Endpoint, on_state_change: Option<StateCallback>) -> bool {
        if self.shared.running.get() {
            warn!("connect called while already running");
            return false;
        }

        // Fresh connection lifetime.
        self.shared.state.reset();
        self.shared.connect_outcome.reset();
        self.shared.exited.set(false);
        self.shared.stopping.store(false, Ordering::Release);

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(%err, "could not initialize the event loop");
                self.shared.state.set(ConnectionState::InitError);
                if let Some(mut callback) = on_state_change {
                    callback(ConnectionState::InitError);
                }
                return false;
            }
        };

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        {
            let mut channels = self.channels.lock().expect("channel registry poisoned");
            *channels = Some(Channels {
                submit: submit_tx,
                stop: stop_tx,
                reclaim: reclaim_tx,
            });
        }

        let shared = Arc::clone(&self.shared);
        let config = DriverConfig {
            endpoint,
            connect_timeout: self.config.connect_timeout,
        };
        let spawned = thread::Builder::new()
            .name("redrive-events".into())
            .spawn(move || {
                driver::run(
                    runtime,
                    shared,
                    config,
                    submit_rx,
                    stop_rx,
                    reclaim_rx,
                    on_state_change,
                );
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                error!(%err, "could not spawn the event-loop thread");
                self.shared.state.set(ConnectionState::InitError);
                *self.channels.lock().expect("channel registry poisoned") = None;
                return false;
            }
        };
        *self.thread.lock().expect("thread handle poisoned") = Some(handle);

        // The outcome is latched on the loop thread, so a remote close that
        // races this wait cannot turn a successful connect into a failure.
        if !self.shared.connect_outcome.wait() {
            // The loop thread exits on its own after a failed connect.
            self.shared.exited.wait_until(true);
            self.join_thread();
            return false;
        }
        true
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Blocks until the connection state satisfies `predicate` and returns
    /// the state that did.
    pub fn wait_for_state(
        &self,
        predicate: impl Fn(ConnectionState) -> bool,
    ) -> ConnectionState {
        self.shared.state.wait_until(predicate)
    }

    /// True while the event loop is accepting commands.
    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    /// Signals the event loop to drain and exit. Returns without waiting;
    /// pair with [`Client::wait`] or use [`Client::disconnect`].
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        debug!("stopping the event loop");
        let channels = self.channels.lock().expect("channel registry poisoned");
        if let Some(channels) = channels.as_ref() {
            let _ = channels.stop.send(());
        }
    }

    /// Blocks until the event-loop thread has exited.
    pub fn wait(&self) {
        let handle = self.thread.lock().expect("thread handle poisoned").take();
        if let Some(handle) = handle {
            self.shared.exited.wait_until(true);
            let _ = handle.join();
            *self.channels.lock().expect("channel registry poisoned") = None;
        }
    }

    /// Stops the event loop and blocks until it has drained and exited.
    pub fn disconnect(&self) {
        self.stop();
        self.wait();
    }

    /// Toggles no-wait mode: the loop spins on immediately-returning passes
    /// instead of parking, trading CPU for latency.
    pub fn no_wait(&self, enabled: bool) {
        if enabled {
            info!("turning on no-wait mode");
        } else {
            info!("turning off no-wait mode");
        }
        self.shared.no_wait.store(enabled, Ordering::Relaxed);
    }

    /// Leak-detector counters: commands created and commands freed over this
    /// client's lifetime. Equal once the loop has fully drained.
    pub fn command_counts(&self) -> (u64, u64) {
        self.shared.counters.snapshot()
    }

    /// Submits a fire-and-forget command; the callback runs once on the loop
    /// thread and the command frees itself afterwards.
    pub fn command<T: Reply>(
        &self,
        payload: impl Into<CommandPayload>,
        callback: impl FnMut(&Command<T>) + Send + 'static,
    ) {
        let callback: Callback<T> = Box::new(callback);
        self.create_command(payload.into(), Some(callback), Schedule::immediate(), true);
    }

    /// Submits a command whose reply is discarded.
    pub fn command_ignore(&self, payload: impl Into<CommandPayload>) {
        self.create_command::<RespValue>(payload.into(), None, Schedule::immediate(), true);
    }

    /// Submits a command and blocks until it resolves. The caller inspects
    /// the handle and must call [`Command::free`] when done with it.
    pub fn command_sync<T: Reply>(&self, payload: impl Into<CommandPayload>) -> Command<T> {
        let command = self.create_command(payload.into(), None, Schedule::immediate(), false);
        command.wait();
        command
    }

    /// Submits a repeating command resent every `repeat` interval. The
    /// callback runs once per cycle; the caller stops the cycle with
    /// [`Command::free`].
    pub fn command_loop<T: Reply>(
        &self,
        payload: impl Into<CommandPayload>,
        callback: impl FnMut(&Command<T>) + Send + 'static,
        repeat: Duration,
    ) -> Command<T> {
        self.command_loop_after(payload, callback, repeat, Duration::ZERO)
    }

    /// Like [`Client::command_loop`], with the first send held back until
    /// `after` elapses.
    pub fn command_loop_after<T: Reply>(
        &self,
        payload: impl Into<CommandPayload>,
        callback: impl FnMut(&Command<T>) + Send + 'static,
        repeat: Duration,
        after: Duration,
    ) -> Command<T> {
        let callback: Callback<T> = Box::new(callback);
        let schedule = Schedule { after, repeat };
        self.create_command(payload.into(), Some(callback), schedule, false)
    }

    /// Submits a one-shot command sent after `after` elapses; frees itself
    /// after the callback.
    pub fn command_delayed<T: Reply>(
        &self,
        payload: impl Into<CommandPayload>,
        callback: impl FnMut(&Command<T>) + Send + 'static,
        after: Duration,
    ) {
        let callback: Callback<T> = Box::new(callback);
        let schedule = Schedule {
            after,
            repeat: Duration::ZERO,
        };
        self.create_command(payload.into(), Some(callback), schedule, true);
    }

    /// GET as a blocking call.
    pub fn get(&self, key: &str) -> Result<String, ClientError> {
        let command = self.command_sync::<String>(vec!["GET".to_string(), key.to_string()]);
        let result = match (command.status(), command.reply()) {
            (ReplyStatus::Ok, Some(value)) => Ok(value),
            (ReplyStatus::ErrorReply, _) => Err(ClientError::ErrorReply {
                command: command.command_line(),
                message: command.error_message().unwrap_or_default(),
            }),
            (status, _) => Err(ClientError::Failed {
                command: command.command_line(),
                status,
            }),
        };
        command.free();
        result
    }

    /// SET as a blocking call; true on success.
    pub fn set(&self, key: &str, value: &str) -> bool {
        self.command_ok(vec![
            "SET".to_string(),
            key.to_string(),
            value.to_string(),
        ])
    }

    /// DEL as a blocking call; true on success.
    pub fn del(&self, key: &str) -> bool {
        self.command_ok(vec!["DEL".to_string(), key.to_string()])
    }

    /// Submits a command, blocks for the reply, and reports only whether it
    /// succeeded. The command is freed before returning.
    pub fn command_ok(&self, payload: impl Into<CommandPayload>) -> bool {
        let command = self.command_sync::<RespValue>(payload);
        let ok = command.ok();
        command.free();
        ok
    }

    /// PUBLISH as fire-and-forget.
    pub fn publish(&self, channel: &str, message: &str) {
        self.command_ignore(vec![
            "PUBLISH".to_string(),
            channel.to_string(),
            message.to_string(),
        ]);
    }

    /// Builds a command, admits it against the connection lifecycle, and
    /// submits it to the loop thread. Commands rejected at admission resolve
    /// `SendError` on the calling thread, callbacks included.
    fn create_command<T: Reply>(
        &self,
        payload: CommandPayload,
        callback: Option<Callback<T>>,
        schedule: Schedule,
        auto_free: bool,
    ) -> Command<T> {
        // Clone the senders out so no lock is held while callbacks run.
        let admission = {
            let channels = self.channels.lock().expect("channel registry poisoned");
            match channels.as_ref() {
                Some(channels)
                    if self.shared.running.get()
                        && !self.shared.stopping.load(Ordering::Acquire) =>
                {
                    Some((channels.submit.clone(), channels.reclaim.clone()))
                }
                _ => None,
            }
        };

        match admission {
            Some((submit, reclaim)) => {
                let core = CommandCore::new(
                    payload,
                    callback,
                    schedule,
                    auto_free,
                    Some(reclaim),
                    Arc::clone(&self.shared.counters),
                );
                let command = Command::from_core(Arc::clone(&core));
                let dispatch: DispatchHandle = core;
                if submit.send(Arc::clone(&dispatch)).is_err() {
                    warn!(command = %command.command_line(), "event loop gone, command not sent");
                    dispatch.fail_send();
                }
                command
            }
            None => {
                let core = CommandCore::new(
                    payload,
                    callback,
                    schedule,
                    auto_free,
                    None,
                    Arc::clone(&self.shared.counters),
                );
                let command = Command::from_core(Arc::clone(&core));
                warn!(command = %command.command_line(), "command canceled, client is not connected");
                core.fail_send();
                command
            }
        }
    }

    fn join_thread(&self) {
        let handle = self.thread.lock().expect("thread handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        *self.channels.lock().expect("channel registry poisoned") = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.shared.running.get() {
            self.stop();
        }
        self.wait();
    }
}
