//! Error types for the framegate core.
//!
//! Strongly-typed errors per layer: connection errors (writes and close),
//! message decode errors, pool submission errors, and the serve entry point.
//! Transport-level `std::io::Error` values are wrapped rather than exposed
//! raw so callers can match on the failure class.

use std::io;

use thiserror::Error;

/// Errors surfaced by [`Connection`](crate::Connection) operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The connection was already logically closed.
    ///
    /// Returned by every `close()` call after the first and by any write
    /// attempted after the close transition. Observing this error has no
    /// side effects.
    #[error("connection already closed")]
    AlreadyClosed,

    /// Underlying transport write failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced when a frame payload cannot be decoded into a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame too short to carry the 2-byte protocol id of the tagged codec.
    #[error("frame of {len} bytes is too short for a protocol id")]
    MissingProtocolId {
        /// Length of the offending frame.
        len: usize,
    },

    /// Application-defined decode failure.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Errors returned by [`TaskPool::spawn`](crate::TaskPool::spawn).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down and accepts no further jobs.
    #[error("task pool is closed")]
    Closed,
}

/// Errors returned by the serve entry points.
#[derive(Error, Debug)]
pub enum ServeError {
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying bind failure.
        source: io::Error,
    },

    /// A non-transient accept failure.
    ///
    /// Transient accept errors are reported through the landfill and the
    /// accept loop continues; anything else ends the loop and is returned
    /// here. Connections accepted before the failure keep running on their
    /// own tasks.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Error pushed into the landfill when a connection task panics.
#[derive(Error, Debug)]
#[error("connection task panicked: {0}")]
pub struct TaskPanic(pub String);

/// Error returned when reporting to a landfill whose consumer is gone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("error landfill is closed")]
pub struct LandfillClosed;

/// Whether an accept-level I/O error is worth retrying.
///
/// These are per-connection failures observed at accept time (the peer reset
/// before the handshake finished, the accept call was interrupted); the
/// listener itself is still healthy.
pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
