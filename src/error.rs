//! Error types returned by every public operation of the client.
//!
//! Each variant belongs to exactly one [`ErrorKind`]. The kind tells the
//! caller what happened to the connection the operation ran on:
//!
//! * `Connection` and `Protocol` errors are fatal to that connection. It is
//!   closed and will be discarded by the pool, never recycled.
//! * `Application` errors are well formed `-ERR` replies. The connection is
//!   still healthy.
//! * `PoolExhausted` means no connection became available before the borrow
//!   timeout elapsed.
//! * `Caller` errors are misuse detected locally, before any byte is written.

use std::io;
use std::time::Duration;

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket refused/reset, timeout, authentication or handshake failure.
    Connection,
    /// The reply byte stream could not be decoded, or violated an invariant
    /// such as the EXEC reply count.
    Protocol,
    /// The server answered with an error reply.
    Application,
    /// The pool had no connection to lend within the borrow timeout.
    PoolExhausted,
    /// The operation is not valid in the current state.
    Caller,
}

/// Error returned by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network failure while connecting, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A connect, read or write did not complete within its budget.
    #[error("{op} timed out")]
    Timeout { op: &'static str },

    /// The peer closed the socket, or the connection was already closed.
    #[error("connection closed")]
    Closed,

    /// AUTH, SELECT or CLIENT SETNAME was rejected while connecting.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Invalid framing or a broken protocol invariant.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `-ERR ...` reply from the server, message kept verbatim.
    #[error("{0}")]
    Server(String),

    /// Borrow timed out with every pooled connection in use.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// Borrow from a pool that has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Operation not permitted in the current connection/transaction state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration or connection string could not be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A queued result was read from a transaction that never committed.
    #[error("transaction was not committed")]
    NotCommitted,
}

impl Error {
    /// Returns the class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Timeout { .. } | Error::Closed | Error::Handshake(_) => {
                ErrorKind::Connection
            }
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Server(_) => ErrorKind::Application,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::PoolClosed
            | Error::InvalidState(_)
            | Error::InvalidConfig(_)
            | Error::NotCommitted => ErrorKind::Caller,
        }
    }

    /// Whether the same operation may succeed on a fresh connection.
    ///
    /// Nothing inside the crate acts on this; retry policy belongs to the
    /// caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::PoolExhausted)
    }

    /// Whether the connection that produced this error must be thrown away.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Protocol)
    }
}

impl From<crate::frame::Error> for Error {
    fn from(err: crate::frame::Error) -> Error {
        Error::Protocol(err.to_string())
    }
}

impl From<crate::parse::ParseError> for Error {
    fn from(err: crate::parse::ParseError) -> Error {
        Error::Protocol(err.to_string())
    }
}
