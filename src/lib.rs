//! # Redrive
//!
//! Purpose: Provide an asynchronous command client for Redis-compatible
//! servers, built around a single background event-loop thread, pipelined
//! command dispatch, and callback-based reply delivery.
//!
//! ## Design Principles
//! 1. **One Loop Thread**: All socket I/O, timers, and user callbacks run on
//!    one background thread; application threads submit over channels.
//! 2. **Typed Replies**: Commands are parameterized by the reply type they
//!    expect; mismatches surface as a status, not a panic.
//! 3. **Explicit Lifecycle**: Connecting, draining, and exiting are blocking,
//!    observable edges with a state callback at every transition.
//! 4. **Accountable Memory**: Every command created is counted against every
//!    command freed, and the mismatch is reported at shutdown.
//!
//! ## Quick Start
//!
//! ```no_run
//! use redrive::Client;
//!
//! let client = Client::new();
//! if !client.connect("localhost", 6379, None) {
//!     return;
//! }
//! client.set("occupation", "carpenter");
//! if let Ok(value) = client.get("occupation") {
//!     println!("occupation: {value}");
//! }
//! client.disconnect();
//! ```

mod client;
mod command;
mod driver;
mod format;
mod reply;
mod resp;
mod state;

pub use client::{
    Client, ClientConfig, ClientError, DEFAULT_HOST, DEFAULT_PORT,
};
#[cfg(unix)]
pub use client::DEFAULT_UNIX_SOCKET;
pub use command::{Command, CommandPayload, ReplyStatus};
pub use format::{join_args, split_args, FormattedCommand};
pub use reply::Reply;
pub use resp::{ProtocolError, RespValue};
pub use state::{ConnectionState, StateCallback};
