//! # Command Lifecycle
//!
//! Purpose: Represent one scheduled unit of request/reply work against the
//! server, parameterized by the expected reply type.
//!
//! ## Design Principles
//! 1. **Exactly-Once Delivery**: Per send attempt, the status leaves
//!    `NoReply` exactly once and the user callback fires exactly once.
//! 2. **Lock-Free Callbacks**: The status mutex is released before the user
//!    callback runs, so callbacks may submit or free commands.
//! 3. **Deferred Reclamation**: Command resources are released through the
//!    dispatcher's reclamation queue on the event-loop thread; a double
//!    `free()` is a no-op.
//! 4. **Type Erasure at the Seam**: The event loop works with
//!    `Arc<dyn DispatchCommand>` handles and never sees the reply type.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::format::FormattedCommand;
use crate::reply::Reply;
use crate::resp::RespValue;

/// Reply status of a command.
///
/// Leaves `NoReply` exactly once per send attempt; repeating commands are
/// reset to `NoReply` before each resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// No reply has been processed for the current send attempt.
    NoReply,
    /// The server replied and the reply decoded into the requested type.
    Ok,
    /// The server returned an application-level error.
    ErrorReply,
    /// The command could not be sent: not connected, transmission failed,
    /// or shutdown in progress.
    SendError,
    /// Reserved for reply-deadline machinery layered above the core.
    TimeoutError,
    /// The reply did not match the requested reply type.
    WrongType,
    /// The command was freed before a reply was processed.
    Canceled,
}

/// Command payload: either an argument list encoded at send time, or a
/// pre-encoded buffer shared across submissions.
#[derive(Debug, Clone)]
pub enum CommandPayload {
    /// Ordered argument strings, e.g. `["SET", "key", "value"]`.
    Args(Vec<String>),
    /// A wire-ready buffer produced by the encoder.
    Formatted(FormattedCommand),
}

impl CommandPayload {
    /// Builds an argument-list payload from anything string-like.
    pub fn args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandPayload::Args(args.into_iter().map(Into::into).collect())
    }

    /// Printable form of the command, for logging.
    pub fn line(&self) -> String {
        match self {
            CommandPayload::Args(args) => args.join(" "),
            CommandPayload::Formatted(formatted) => formatted.description().to_string(),
        }
    }
}

impl From<Vec<String>> for CommandPayload {
    fn from(args: Vec<String>) -> Self {
        CommandPayload::Args(args)
    }
}

impl From<Vec<&str>> for CommandPayload {
    fn from(args: Vec<&str>) -> Self {
        CommandPayload::args(args)
    }
}

impl<const N: usize> From<[&str; N]> for CommandPayload {
    fn from(args: [&str; N]) -> Self {
        CommandPayload::args(args)
    }
}

impl From<FormattedCommand> for CommandPayload {
    fn from(formatted: FormattedCommand) -> Self {
        CommandPayload::Formatted(formatted)
    }
}

/// Delay before the first send and interval between repeats.
///
/// A zero `repeat` means one-shot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Schedule {
    pub(crate) after: Duration,
    pub(crate) repeat: Duration,
}

impl Schedule {
    pub(crate) fn immediate() -> Self {
        Schedule {
            after: Duration::ZERO,
            repeat: Duration::ZERO,
        }
    }

    pub(crate) fn is_immediate(&self) -> bool {
        self.after.is_zero() && self.repeat.is_zero()
    }
}

/// User callback invoked on the event-loop thread with the command handle.
pub(crate) type Callback<T> = Box<dyn FnMut(&Command<T>) + Send>;

/// Commands-created / commands-freed counters backing the leak detector.
#[derive(Debug, Default)]
pub(crate) struct SharedCounters {
    pub(crate) created: AtomicU64,
    pub(crate) freed: AtomicU64,
}

impl SharedCounters {
    pub(crate) fn snapshot(&self) -> (u64, u64) {
        (
            self.created.load(Ordering::Acquire),
            self.freed.load(Ordering::Acquire),
        )
    }
}

/// Type-erased view of a command used by the event loop and the queues.
///
/// The queues schedule the command's next operation but never own it; shared
/// ownership stays with the `Arc` handles.
pub(crate) trait DispatchCommand: Send + Sync {
    fn payload(&self) -> &CommandPayload;
    fn schedule(&self) -> Schedule;
    /// Marks the start of a send attempt (pending-send counter).
    fn begin_send(&self);
    /// Routes a raw reply to the command: decode, set status, invoke the
    /// callback, wake waiters, and auto-free one-shot commands.
    fn deliver(&self, value: RespValue);
    /// Resolves the current send attempt with `SendError`.
    fn fail_send(&self);
    /// Rewinds status to `NoReply` ahead of a repeat resubmission.
    fn reset_for_resend(&self);
    /// Releases reply resources and counts the command as freed. Called
    /// exactly once, from the reclamation path.
    fn release(&self);
    fn is_freed(&self) -> bool;
}

/// Shared, type-erased command handle moved through the dispatcher queues.
pub(crate) type DispatchHandle = Arc<dyn DispatchCommand>;

struct CommandInner<T: Reply> {
    status: ReplyStatus,
    reply: Option<T>,
    error: Option<String>,
    callback: Option<Callback<T>>,
}

/// Shared state behind a `Command<T>` handle.
pub(crate) struct CommandCore<T: Reply> {
    payload: CommandPayload,
    schedule: Schedule,
    auto_free: bool,
    inner: Mutex<CommandInner<T>>,
    replied: Condvar,
    pending_sends: AtomicUsize,
    freed: AtomicBool,
    reclaim: Option<UnboundedSender<DispatchHandle>>,
    counters: Arc<SharedCounters>,
    weak_self: Weak<CommandCore<T>>,
}

impl<T: Reply> CommandCore<T> {
    /// Creates a command core and counts it toward the leak detector.
    ///
    /// `reclaim` is `None` when no connection exists; release then happens
    /// inline instead of on the event-loop thread.
    pub(crate) fn new(
        payload: CommandPayload,
        callback: Option<Callback<T>>,
        schedule: Schedule,
        auto_free: bool,
        reclaim: Option<UnboundedSender<DispatchHandle>>,
        counters: Arc<SharedCounters>,
    ) -> Arc<Self> {
        counters.created.fetch_add(1, Ordering::AcqRel);
        Arc::new_cyclic(|weak_self| CommandCore {
            payload,
            schedule,
            auto_free,
            inner: Mutex::new(CommandInner {
                status: ReplyStatus::NoReply,
                reply: None,
                error: None,
                callback,
            }),
            replied: Condvar::new(),
            pending_sends: AtomicUsize::new(0),
            freed: AtomicBool::new(false),
            reclaim,
            counters,
            weak_self: weak_self.clone(),
        })
    }

    fn handle(&self) -> Command<T> {
        Command {
            core: self.weak_self.upgrade().expect("command core released"),
        }
    }

    fn dispatch_handle(&self) -> DispatchHandle {
        self.weak_self.upgrade().expect("command core released")
    }

    fn end_send(&self) {
        // Saturating: an admission failure resolves without a begin_send.
        let _ = self
            .pending_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(1))
            });
    }

    /// Resolves a send attempt. `value` is the raw reply, or `None` for a
    /// send failure.
    fn resolve(&self, value: Option<RespValue>) {
        if self.freed.load(Ordering::Acquire) {
            self.end_send();
            return;
        }

        let callback = {
            let mut inner = self.inner.lock().expect("command mutex poisoned");
            if inner.status != ReplyStatus::NoReply {
                // Already resolved for this send attempt; nothing to deliver.
                drop(inner);
                self.end_send();
                return;
            }
            match value {
                None => inner.status = ReplyStatus::SendError,
                Some(RespValue::Error(message)) => {
                    inner.status = ReplyStatus::ErrorReply;
                    inner.error = Some(String::from_utf8_lossy(&message).into_owned());
                }
                Some(other) => match T::from_resp(other) {
                    Some(reply) => {
                        inner.status = ReplyStatus::Ok;
                        inner.reply = Some(reply);
                    }
                    None => inner.status = ReplyStatus::WrongType,
                },
            }
            inner.callback.take()
        };
        self.replied.notify_all();

        if let Some(mut callback) = callback {
            let handle = self.handle();
            callback(&handle);
            if !self.schedule.repeat.is_zero() && !self.is_freed() {
                // Repeating commands keep their callback for the next cycle.
                let mut inner = self.inner.lock().expect("command mutex poisoned");
                inner.callback = Some(callback);
            }
        }

        self.end_send();

        if self.schedule.repeat.is_zero() && self.auto_free {
            self.finish();
        }
    }

    /// Hands the command to the reclamation path exactly once. The status
    /// becomes `Canceled` when no reply was processed yet.
    fn finish(&self) {
        if self.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.pending_sends.load(Ordering::Acquire) > 0 {
            // The freed flag suppresses the late reply when it arrives.
            debug!(command = %self.payload.line(), "freed with a send in flight");
        }
        {
            let mut inner = self.inner.lock().expect("command mutex poisoned");
            if inner.status == ReplyStatus::NoReply {
                inner.status = ReplyStatus::Canceled;
            }
        }
        self.replied.notify_all();

        match &self.reclaim {
            Some(reclaim) if reclaim.send(self.dispatch_handle()).is_ok() => {}
            // No event loop left to defer to; release on the calling thread.
            _ => self.release_resources(),
        }
    }

    fn release_resources(&self) {
        {
            let mut inner = self.inner.lock().expect("command mutex poisoned");
            inner.reply = None;
            inner.error = None;
            inner.callback = None;
        }
        self.counters.freed.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: Reply> DispatchCommand for CommandCore<T> {
    fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn begin_send(&self) {
        self.pending_sends.fetch_add(1, Ordering::AcqRel);
    }

    fn deliver(&self, value: RespValue) {
        self.resolve(Some(value));
    }

    fn fail_send(&self) {
        self.resolve(None);
    }

    fn reset_for_resend(&self) {
        let mut inner = self.inner.lock().expect("command mutex poisoned");
        inner.status = ReplyStatus::NoReply;
        inner.reply = None;
        inner.error = None;
    }

    fn release(&self) {
        self.release_resources();
    }

    fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }
}

/// Handle to one scheduled unit of request/reply work.
///
/// Handles are cheap to clone and share the same underlying command. The
/// dispatcher owns the command from creation until it is auto-freed after
/// the callback (fire-and-forget mode) or until the caller invokes
/// [`Command::free`] (synchronous and repeating modes).
pub struct Command<T: Reply> {
    core: Arc<CommandCore<T>>,
}

impl<T: Reply> Clone for Command<T> {
    fn clone(&self) -> Self {
        Command {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Reply> Command<T> {
    pub(crate) fn from_core(core: Arc<CommandCore<T>>) -> Self {
        Command { core }
    }

    /// Current reply status.
    pub fn status(&self) -> ReplyStatus {
        self.core.inner.lock().expect("command mutex poisoned").status
    }

    /// True when the latest send attempt decoded a successful reply.
    pub fn ok(&self) -> bool {
        self.status() == ReplyStatus::Ok
    }

    /// The decoded reply, when status is `Ok`.
    pub fn reply(&self) -> Option<T> {
        self.core
            .inner
            .lock()
            .expect("command mutex poisoned")
            .reply
            .clone()
    }

    /// Server error message, when status is `ErrorReply`.
    pub fn error_message(&self) -> Option<String> {
        self.core
            .inner
            .lock()
            .expect("command mutex poisoned")
            .error
            .clone()
    }

    /// Printable form of the command, for logging.
    pub fn command_line(&self) -> String {
        self.core.payload.line()
    }

    /// Blocks the calling thread until the status leaves `NoReply`.
    pub fn wait(&self) {
        let mut inner = self.core.inner.lock().expect("command mutex poisoned");
        while inner.status == ReplyStatus::NoReply {
            inner = self
                .core
                .replied
                .wait(inner)
                .expect("command mutex poisoned");
        }
    }

    /// Bounded wait; returns false when the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let inner = self.core.inner.lock().expect("command mutex poisoned");
        let (_inner, result) = self
            .core
            .replied
            .wait_timeout_while(inner, timeout, |inner| inner.status == ReplyStatus::NoReply)
            .expect("command mutex poisoned");
        !result.timed_out()
    }

    /// Releases the command's reply resources via the dispatcher's
    /// reclamation path. Required after synchronous and repeating commands;
    /// calling it twice is a no-op.
    pub fn free(&self) {
        self.core.finish();
    }
}
