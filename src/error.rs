use thiserror::Error;

use crate::xml::Fault;

/// The errors surfaced by `GbxClient` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// There is no established session; nothing was written to the socket.
    #[error("not connected to the server")]
    NotConnected,

    /// `connect` was called on a client that already holds a session.
    #[error("already connected to the server")]
    AlreadyConnected,

    /// The encoded request would exceed the 4 MiB frame limit.
    #[error("request of {0} bytes exceeds the 4 MiB frame limit")]
    RequestTooLarge(usize),

    /// The session was torn down while the call was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The server answered the call with a fault.
    #[error(transparent)]
    Fault(#[from] Fault),

    /// A call could not be composed, or a response could not be parsed.
    #[error("XML-RPC codec error: {0:#}")]
    Codec(anyhow::Error),

    /// A socket-level error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
