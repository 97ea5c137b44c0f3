//! Batching commands on one connection.
//!
//! A [`Pipeline`] writes every command of a batch before reading any reply.
//! Replies come back in the order the commands were added.

use crate::cmd::Command;
use crate::{Connection, Error, Frame, Result};

use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

/// Delivers one reply to whoever holds the matching [`Queued`].
pub(crate) type Callback = Box<dyn FnOnce(Result<Frame>) + Send>;

/// A command waiting in a batch, plus what to do with its reply.
pub(crate) struct QueuedOperation {
    pub(crate) command: Command,
    pub(crate) callback: Option<Callback>,
}

impl QueuedOperation {
    pub(crate) fn new(command: Command) -> QueuedOperation {
        QueuedOperation {
            command,
            callback: None,
        }
    }

    /// Queue `command` with a projector. The returned [`Queued`] resolves
    /// once the reply has been handed over.
    pub(crate) fn projected<T, F>(command: Command, projector: F) -> (QueuedOperation, Queued<T>)
    where
        T: Send + 'static,
        F: FnOnce(Frame) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let callback: Callback = Box::new(move |reply: Result<Frame>| {
            // 接收方可能已经被丢弃，此时结果无人关心
            let _ = tx.send(reply.and_then(projector));
        });

        let op = QueuedOperation {
            command,
            callback: Some(callback),
        };
        (op, Queued { rx })
    }

    /// Hand `reply` to the projector, if any. Error replies reach the
    /// projector as `Err(Error::Server)`.
    pub(crate) fn complete(self, reply: Frame) {
        if let Some(callback) = self.callback {
            callback(reply.into_result());
        }
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("command", &self.command)
            .field("projected", &self.callback.is_some())
            .finish()
    }
}

/// The eventual result of a queued command.
///
/// Resolves when the batch it belongs to has been flushed or committed. If
/// that never happens (the transaction was discarded, aborted, or the batch
/// failed before this command's reply was read) the result is
/// `Error::NotCommitted`.
#[derive(Debug)]
pub struct Queued<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Queued<T> {
    /// Take the projected result.
    pub fn take(mut self) -> Result<T> {
        match self.rx.try_recv() {
            Ok(res) => res,
            Err(_) => Err(Error::NotCommitted),
        }
    }
}

/// Commands written together, replies read together.
///
/// ```no_run
/// # async fn run(conn: &mut my_mini_redis_client::Connection) -> my_mini_redis_client::Result<()> {
/// use my_mini_redis_client::cmd::Incr;
///
/// let mut pipeline = conn.pipeline();
/// pipeline.add(Incr::new("hits").into_command());
/// pipeline.add(Incr::new("hits").into_command());
/// let replies = pipeline.flush().await?;
/// assert_eq!(replies.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Pipeline<'a> {
    conn: &'a mut Connection,
    ops: Vec<QueuedOperation>,
}

impl<'a> Pipeline<'a> {
    pub fn new(conn: &'a mut Connection) -> Pipeline<'a> {
        Pipeline { conn, ops: vec![] }
    }

    /// Add a command whose reply is only returned by `flush`.
    pub fn add(&mut self, cmd: Command) -> &mut Pipeline<'a> {
        self.ops.push(QueuedOperation::new(cmd));
        self
    }

    /// Add a command and project its reply into a typed value.
    pub fn queue<T, F>(&mut self, cmd: Command, projector: F) -> Queued<T>
    where
        T: Send + 'static,
        F: FnOnce(Frame) -> Result<T> + Send + 'static,
    {
        let (op, queued) = QueuedOperation::projected(cmd, projector);
        self.ops.push(op);
        queued
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Send every command, then read one reply per command.
    ///
    /// Error replies are returned as `Frame::Error` in their slot; they do
    /// not fail the batch. The pipeline is empty again afterwards and can be
    /// reused.
    ///
    /// If any command may not be sent in the connection's current state,
    /// nothing is written and the batch is kept.
    pub async fn flush(&mut self) -> Result<Vec<Frame>> {
        if self.ops.is_empty() {
            return Ok(vec![]);
        }

        for op in &self.ops {
            self.conn.ensure_can_send(&op.command)?;
        }

        let ops = std::mem::take(&mut self.ops);
        for op in &ops {
            self.conn.queue_command(&op.command)?;
        }
        self.conn.flush().await?;
        debug!(id = self.conn.id(), commands = ops.len(), "pipeline flushed");

        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = self.conn.read_reply().await?;
            op.complete(reply.clone());
            replies.push(reply);
        }
        Ok(replies)
    }
}
