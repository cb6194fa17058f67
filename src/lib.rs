//! Launches a Jupyter-compatible compute kernel as a child process and
//! speaks the Jupyter wire protocol over ZeroMQ.
//!
//! The crate is organized bottom-up:
//!
//! - [`codec`] is the stateless framing and HMAC signing layer.
//! - [`connection`] reads the connection file the kernel writes at launch.
//! - [`output`] turns kernel broadcast messages into a single output kind.
//! - [`transport`] owns the three ZeroMQ sockets and the iopub listener task.
//! - [`events`] is the broadcast event stream observers subscribe to.
//! - [`session`] is the public surface: `start`, `execute`, `interrupt`,
//!   `restart`, `shutdown`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::io;

pub mod codec;
pub mod connection;
pub mod events;
pub mod output;
pub mod session;
pub mod transport;

pub use codec::Message;
pub use connection::ConnectionInfo;
pub use events::Event;
pub use output::Output;
pub use session::{ExecuteOutcome, KernelState, Session, SessionConfig};

/// Errors that can occur while driving a kernel session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation that requires a running kernel was called before `start`.
    #[error("kernel is not started")]
    NotStarted,

    /// The connection file did not appear within the polling window.
    #[error("timed out waiting for connection file at {0}")]
    ConnectionFileTimeout(String),

    /// The connection file could not be read or parsed.
    #[error("could not read connection file: {0}")]
    ConnectionFile(String),

    /// A frame list was missing the delimiter or had the wrong shape.
    #[error("malformed wire frames: {0}")]
    Framing(String),

    /// The HMAC signature on an inbound frame list did not verify.
    #[error("signature mismatch on inbound message")]
    SignatureMismatch,

    /// A frame's JSON payload could not be decoded.
    #[error("could not decode message: {0}")]
    Decode(String),

    /// A request did not complete within its allotted time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// An error occurred sending or receiving on a ZeroMQ socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// The kernel subprocess exited unexpectedly.
    #[error("kernel process exited unexpectedly: {0}")]
    ProcessExit(String),

    /// An error occurred spawning or managing the kernel subprocess.
    #[error("failed to run subprocess: {0}")]
    Subprocess(io::Error),

    /// An error originating from the ZeroMQ library itself.
    #[error("zeromq: {0}")]
    Zmq(#[from] zeromq::ZmqError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
