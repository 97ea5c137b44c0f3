//! A pooled client for servers speaking RESP, the Redis serialization
//! protocol.
//!
//! The crate is layered bottom up:
//!
//! * [`frame`] decodes replies, [`cmd`] encodes commands.
//! * [`Connection`] owns one socket and its protocol state.
//! * [`ConnectionPool`] lends connections out exclusively and health checks
//!   them on the way out.
//! * [`Pipeline`], [`Transaction`] and [`Subscriber`] run on a single
//!   borrowed connection.
//! * [`Client`] ties everything together; [`BlockingClient`] wraps it for
//!   callers outside of an async runtime.

pub mod clients;
pub use clients::{BlockingClient, BlockingSubscriber, BlockingTransaction, Client};

pub mod cmd;
pub use cmd::Command;

pub mod config;
pub use config::{Config, Endpoint};

pub mod connection;
pub use connection::{Connection, ConnectionState};

pub mod error;
pub use error::{Error, ErrorKind};

pub mod frame;
pub use frame::Frame;

pub mod pipeline;
pub use pipeline::{Pipeline, Queued};

pub mod pool;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};

pub mod pubsub;
pub use pubsub::{Message, Subscriber, SubscriptionHandle, SubscriptionHandler};

pub mod transaction;
pub use transaction::{CommitOutcome, Transaction, TransactionState};

mod parse;

mod shutdown;

/// Default port that a redis server listens on
///
/// Used if no port is specified
pub const DEFAULT_PORT: u16 = 6379;

/// A specialized `Result` type for client operations.
///
/// This is defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;
