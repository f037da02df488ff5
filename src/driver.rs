//! # Event-Loop Driver
//!
//! Purpose: Run the single background thread that owns the connection, the
//! timers, and all protocol interaction, so no locking is needed around
//! socket reads and writes.
//!
//! ## Design Principles
//! 1. **One Thread Owns I/O**: The loop thread is the only place the socket
//!    is touched; application threads reach it through channels.
//! 2. **Channels As Wake Signals**: Submission, stop, and reclamation are
//!    three distinct queues drained exclusively by the loop thread.
//! 3. **FIFO Reply Matching**: Commands are pipelined on one connection and
//!    replies are matched to in-flight sends in order.
//! 4. **Graceful Drain**: On stop, queued work resolves `SendError`, in-flight
//!    replies get a short grace period, and the leak detector checks that
//!    every command created was also freed.
//!
//! The loop progresses through: waiting for the connect outcome, running,
//! draining, exited. On a failed connect the thread exits without ever
//! reaching the running phase.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::command::{CommandPayload, DispatchHandle, SharedCounters};
use crate::resp::{self, RespValue};
use crate::state::{ConnectionState, Flag, OutcomeCell, StateCell, StateCallback};

/// Grace period for in-flight replies between the stop signal and the
/// explicit disconnect.
const REPLY_GRACE: Duration = Duration::from_millis(10);

/// Where the single logical connection points.
#[derive(Debug, Clone)]
pub(crate) enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: String },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Endpoint::Unix { path } => write!(f, "{path}"),
        }
    }
}

/// Connection parameters handed to the loop thread.
#[derive(Debug, Clone)]
pub(crate) struct DriverConfig {
    pub(crate) endpoint: Endpoint,
    pub(crate) connect_timeout: Duration,
}

/// State shared between application threads and the loop thread.
///
/// Each flag carries its own lock and condition variable; none is ever held
/// across a socket write or a user callback.
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) connect_outcome: OutcomeCell,
    pub(crate) running: Flag,
    pub(crate) exited: Flag,
    pub(crate) stopping: AtomicBool,
    pub(crate) no_wait: AtomicBool,
    pub(crate) counters: Arc<SharedCounters>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Shared {
            state: StateCell::new(),
            connect_outcome: OutcomeCell::new(),
            running: Flag::new(),
            exited: Flag::new(),
            stopping: AtomicBool::new(false),
            no_wait: AtomicBool::new(false),
            counters: Arc::new(SharedCounters::default()),
        })
    }
}

/// Socket abstraction covering TCP and unix-domain connections.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Messages from the reader task to the loop.
enum ReadEvent {
    Frame(RespValue),
    Closed(Option<String>),
}

/// One unit of work for the loop thread.
enum Event {
    Submit(DispatchHandle),
    Due(DispatchHandle),
    Reply(ReadEvent),
    Reclaim(DispatchHandle),
    Stop,
}

/// Entry point for the background thread. Blocks until the loop has fully
/// drained and exited.
pub(crate) fn run(
    runtime: Runtime,
    shared: Arc<Shared>,
    config: DriverConfig,
    submit_rx: UnboundedReceiver<DispatchHandle>,
    stop_rx: UnboundedReceiver<()>,
    reclaim_rx: UnboundedReceiver<DispatchHandle>,
    state_callback: Option<StateCallback>,
) {
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(drive(
        shared,
        config,
        submit_rx,
        stop_rx,
        reclaim_rx,
        state_callback,
    )));
}

async fn drive(
    shared: Arc<Shared>,
    config: DriverConfig,
    submit_rx: UnboundedReceiver<DispatchHandle>,
    stop_rx: UnboundedReceiver<()>,
    reclaim_rx: UnboundedReceiver<DispatchHandle>,
    mut state_callback: Option<StateCallback>,
) {
    let stream = match connect_endpoint(&config.endpoint, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(endpoint = %config.endpoint, %err, "could not connect");
            shared.state.set(ConnectionState::ConnectError);
            if let Some(callback) = state_callback.as_mut() {
                callback(ConnectionState::ConnectError);
            }
            warn!("did not connect, event loop exiting");
            shared.connect_outcome.set(false);
            shared.exited.set(true);
            shared.running.set(false);
            return;
        }
    };

    info!(endpoint = %config.endpoint, "connected");
    shared.state.set(ConnectionState::Connected);
    if let Some(callback) = state_callback.as_mut() {
        callback(ConnectionState::Connected);
    }

    let (read_half, writer) = tokio::io::split(stream);
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let reader = tokio::task::spawn_local(read_loop(read_half, read_tx));
    let (due_tx, due_rx) = mpsc::unbounded_channel();

    let mut driver = Driver {
        shared: Arc::clone(&shared),
        writer,
        submit_rx,
        stop_rx,
        reclaim_rx,
        due_tx,
        due_rx,
        read_rx,
        pending: VecDeque::new(),
        armed: Vec::new(),
        state_callback,
        scratch: Vec::with_capacity(256),
        reader,
    };

    // Unblocks callers waiting inside connect(). The outcome is latched
    // after the running flag so that a successful connect() returns with
    // admission already open.
    shared.running.set(true);
    shared.connect_outcome.set(true);

    let remote_closed = driver.run_loop().await;
    driver.drain(remote_closed).await;
}

struct Driver {
    shared: Arc<Shared>,
    writer: WriteHalf<BoxedTransport>,
    submit_rx: UnboundedReceiver<DispatchHandle>,
    stop_rx: UnboundedReceiver<()>,
    reclaim_rx: UnboundedReceiver<DispatchHandle>,
    due_tx: UnboundedSender<DispatchHandle>,
    due_rx: UnboundedReceiver<DispatchHandle>,
    read_rx: UnboundedReceiver<ReadEvent>,
    pending: VecDeque<DispatchHandle>,
    armed: Vec<DispatchHandle>,
    state_callback: Option<StateCallback>,
    scratch: Vec<u8>,
    reader: JoinHandle<()>,
}

impl Driver {
    /// Main loop. Returns true when the server closed the connection.
    async fn run_loop(&mut self) -> bool {
        loop {
            let event = if self.shared.no_wait.load(Ordering::Relaxed) {
                // No-wait mode: an immediately-returning pass instead of
                // parking, trading CPU for latency.
                match time::timeout(Duration::ZERO, self.next_event()).await {
                    Ok(event) => event,
                    Err(_) => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                }
            } else {
                self.next_event().await
            };

            match event {
                Event::Submit(command) => self.dispatch(command).await,
                Event::Due(command) => {
                    // One-shot timers are done once they fire; repeating
                    // commands stay registered until freed.
                    if command.schedule().repeat.is_zero() {
                        self.armed.retain(|armed| !Arc::ptr_eq(armed, &command));
                    }
                    self.send(command).await;
                }
                Event::Reclaim(command) => command.release(),
                Event::Reply(ReadEvent::Frame(value)) => self.route_reply(value),
                Event::Reply(ReadEvent::Closed(reason)) => {
                    self.on_remote_close(reason);
                    return true;
                }
                Event::Stop => {
                    debug!("stop signal detected, closing down event loop");
                    return false;
                }
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        tokio::select! {
            submitted = self.submit_rx.recv() => match submitted {
                Some(command) => Event::Submit(command),
                None => Event::Stop,
            },
            due = self.due_rx.recv() => match due {
                Some(command) => Event::Due(command),
                None => Event::Stop,
            },
            reclaimed = self.reclaim_rx.recv() => match reclaimed {
                Some(command) => Event::Reclaim(command),
                None => Event::Stop,
            },
            read = self.read_rx.recv() => match read {
                Some(event) => Event::Reply(event),
                None => Event::Reply(ReadEvent::Closed(None)),
            },
            _ = self.stop_rx.recv() => Event::Stop,
        }
    }

    /// Sends a command immediately, or arms its timer.
    async fn dispatch(&mut self, command: DispatchHandle) {
        let schedule = command.schedule();
        if schedule.is_immediate() {
            self.send(command).await;
            return;
        }

        // The registry keeps timer-armed commands reachable for the drain;
        // without it a stop would tear the timer task down silently.
        self.armed.retain(|armed| !armed.is_freed());
        self.armed.push(Arc::clone(&command));

        // Timer expiry re-enqueues the command so the send itself always
        // happens on the loop, with the writer at hand.
        let due = self.due_tx.clone();
        tokio::task::spawn_local(async move {
            time::sleep(schedule.after).await;
            if command.is_freed() || due.send(Arc::clone(&command)).is_err() {
                return;
            }
            if schedule.repeat.is_zero() {
                return;
            }
            let mut ticker =
                time::interval_at(time::Instant::now() + schedule.repeat, schedule.repeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if command.is_freed() {
                    return;
                }
                command.reset_for_resend();
                if due.send(Arc::clone(&command)).is_err() {
                    return;
                }
            }
        });
    }

    /// Writes a command to the server and registers it for reply matching.
    async fn send(&mut self, command: DispatchHandle) {
        if command.is_freed() {
            return;
        }
        command.begin_send();

        if self.shared.stopping.load(Ordering::Acquire) {
            warn!(command = %command.payload().line(), "could not send, client is exiting");
            command.fail_send();
            return;
        }

        let written = match command.payload() {
            CommandPayload::Args(args) => {
                self.scratch.clear();
                let refs: Vec<&[u8]> = args.iter().map(|arg| arg.as_bytes()).collect();
                resp::encode_command(&refs, &mut self.scratch);
                self.writer.write_all(&self.scratch).await
            }
            CommandPayload::Formatted(formatted) => {
                self.writer.write_all(formatted.as_bytes()).await
            }
        };

        match written {
            Ok(()) => {
                let _ = self.writer.flush().await;
                self.pending.push_back(command);
            }
            Err(err) => {
                error!(command = %command.payload().line(), %err, "could not send");
                command.fail_send();
            }
        }
    }

    /// Matches a reply to the oldest in-flight command.
    fn route_reply(&mut self, value: RespValue) {
        match self.pending.pop_front() {
            Some(command) => command.deliver(value),
            None => warn!("reply received with no command pending"),
        }
    }

    fn on_remote_close(&mut self, reason: Option<String>) {
        let planned = self.shared.stopping.load(Ordering::Acquire);
        let state = match &reason {
            Some(err) => {
                error!(%err, "disconnected on error");
                ConnectionState::DisconnectError
            }
            None if planned => {
                info!("disconnected as planned");
                ConnectionState::Disconnected
            }
            None => {
                error!("server closed the connection");
                ConnectionState::DisconnectError
            }
        };
        self.shared.state.set(state);
        self.notify_state(state);
    }

    fn notify_state(&mut self, state: ConnectionState) {
        if let Some(callback) = self.state_callback.as_mut() {
            callback(state);
        }
    }

    /// Shutdown phase: fail queued work, give in-flight replies a grace
    /// period, disconnect, and run the leak detector.
    async fn drain(mut self, remote_closed: bool) {
        self.shared.stopping.store(true, Ordering::Release);

        // Commands never sent resolve SendError, callbacks included. The
        // channel is closed first so a submission racing the drain fails on
        // the submitting thread instead of sitting unprocessed.
        self.submit_rx.close();
        while let Ok(command) = self.submit_rx.try_recv() {
            command.fail_send();
        }
        self.due_rx.close();
        while let Ok(command) = self.due_rx.try_recv() {
            command.fail_send();
        }
        // Timer-armed commands that never reached the due queue.
        for command in self.armed.drain(..) {
            command.fail_send();
        }

        if !self.pending.is_empty() && !remote_closed {
            time::sleep(REPLY_GRACE).await;
            while let Ok(event) = self.read_rx.try_recv() {
                match event {
                    ReadEvent::Frame(value) => self.route_reply(value),
                    ReadEvent::Closed(reason) => {
                        self.on_remote_close(reason);
                        break;
                    }
                }
            }
        }
        while let Some(command) = self.pending.pop_front() {
            command.fail_send();
        }

        // Explicit disconnect when the server side is still up.
        self.reader.abort();
        drop(self.writer);
        if self.shared.state.get() == ConnectionState::Connected {
            info!("disconnected as planned");
            self.shared.state.set(ConnectionState::Disconnected);
            if let Some(callback) = self.state_callback.as_mut() {
                callback(ConnectionState::Disconnected);
            }
        }

        // Closing first redirects any late free() to the inline release path;
        // buffered handles are still drained below.
        self.reclaim_rx.close();
        while let Ok(command) = self.reclaim_rx.try_recv() {
            command.release();
        }

        let (created, freed) = self.shared.counters.snapshot();
        if created != freed {
            error!(created, freed, "not all commands were freed");
        }

        self.shared.exited.set(true);
        self.shared.running.set(false);
        info!("event thread exited");
    }
}

/// Opens the configured endpoint within the connect timeout.
async fn connect_endpoint(
    endpoint: &Endpoint,
    connect_timeout: Duration,
) -> io::Result<BoxedTransport> {
    let connect = async {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                // Small request/reply payloads; latency beats batching.
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream) as BoxedTransport)
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream) as BoxedTransport)
            }
        }
    };
    match time::timeout(connect_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// Reader task: turns the byte stream into reply frames.
async fn read_loop(mut read_half: ReadHalf<BoxedTransport>, tx: UnboundedSender<ReadEvent>) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match resp::parse_value(&mut buffer) {
                Ok(Some(value)) => {
                    if tx.send(ReadEvent::Frame(value)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(ReadEvent::Closed(Some(err.to_string())));
                    return;
                }
            }
        }

        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                let _ = tx.send(ReadEvent::Closed(None));
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = tx.send(ReadEvent::Closed(Some(err.to_string())));
                return;
            }
        }
    }
}
