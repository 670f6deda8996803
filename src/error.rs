//! Error types shared across the RPC framework.
//!
//! Errors fall into a few families with different propagation rules:
//!
//! - Protocol setup errors (bad magic, unknown codec) are logged by the
//!   server and the connection is dropped without a response.
//! - Dispatch and handler errors travel back to the caller inside the
//!   response header and surface as [`RpcError::Remote`].
//! - Transport errors are fatal to a session; every call still pending on
//!   the connection is completed with [`RpcError::Connection`].
//! - Deadline and cancellation errors are per-call and leave the session
//!   usable.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RpcError>;

/// The error type for every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Returned by operations on a client that has been closed, and by
    /// repeated calls to `close`.
    #[error("connection is shut down")]
    Shutdown,

    /// Dialing plus handshake did not finish within the connect timeout.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The caller's deadline expired or the call was cancelled before a
    /// response arrived. The pending entry is detached so a late response
    /// is silently absorbed.
    #[error("rpc client: call failed: {0}")]
    CallFailed(String),

    /// An error reported by the server for a single call, verbatim from
    /// the response header. Covers dispatch failures, handler errors and
    /// server-side handle timeouts.
    #[error("{0}")]
    Remote(String),

    /// The response header was read but its body could not be decoded
    /// into the caller's reply type.
    #[error("reading body {0}")]
    ReadBody(String),

    /// The session transport failed; pending calls are completed with
    /// this error and the client refuses new sends.
    #[error("rpc client: connection error: {0}")]
    Connection(String),

    /// A codec tag that no registered codec answers to.
    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    /// A malformed handshake or frame: wrong magic number, oversized
    /// frame, truncated payload.
    #[error("rpc protocol: {0}")]
    Protocol(String),

    /// Encoding or decoding a header or value failed.
    #[error("rpc codec: {0}")]
    Codec(String),

    /// Selection from a discovery whose endpoint set is empty.
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    /// Service registration was rejected (empty or duplicate name).
    #[error("rpc server: {0}")]
    InvalidService(String),

    /// The registry could not be reached for a heartbeat or a refresh.
    #[error("rpc registry: {0}")]
    Registry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// True for the clean end-of-stream condition that terminates a
    /// session without being worth a log line.
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self, RpcError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
