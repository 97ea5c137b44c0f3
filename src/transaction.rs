//! MULTI/EXEC transactions.
//!
//! Commands are collected locally and only sent at commit time, as one
//! pipelined batch:
//!
//! ```text
//! MULTI, cmd1, ..., cmdN      ->  +OK, +QUEUED x N
//! EXEC                        ->  *N (one reply per command) | *-1
//! ```
//!
//! Either every queued command is applied or none is. A transaction is never
//! retried: after an unknown failure point replaying it could apply it twice.

use crate::cmd::{Command, Discard, Exec, Multi, Unwatch, Watch};
use crate::connection::ConnectionState;
use crate::pipeline::QueuedOperation;
use crate::pool::PooledConnection;
use crate::{Connection, Error, Frame, Queued, Result};

use std::ops::DerefMut;
use tracing::{debug, instrument, warn};

/// ```text
/// Idle -> Queuing -> Committing -> { Committed | Discarded | Aborted }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Queuing,
    Committing,
    Committed,
    Discarded,
    Aborted,
}

impl TransactionState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Discarded | TransactionState::Aborted
        )
    }
}

/// Result of a commit that reached `EXEC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every queued command was applied.
    Committed,
    /// The server refused to run the transaction because a watched key
    /// changed. Nothing was applied.
    Aborted,
}

/// Commands refused inside a transaction; they would break the framing of
/// the commit.
const CONTROL_COMMANDS: &[&str] = &["MULTI", "EXEC", "DISCARD", "WATCH", "UNWATCH"];

/// A transaction bound to one connection for its whole lifetime.
///
/// `C` is anything that dereferences to a [`Connection`]: a
/// [`PooledConnection`] or a plain `&mut Connection`.
///
/// If the transaction is dropped while keys are watched, or in the middle of
/// a commit, the connection is left `InTransaction` and a pool will discard
/// it instead of recycling it.
#[derive(Debug)]
pub struct Transaction<C = PooledConnection>
where
    C: DerefMut<Target = Connection>,
{
    conn: C,
    ops: Vec<QueuedOperation>,
    state: TransactionState,
    watching: bool,
}

impl<C> Transaction<C>
where
    C: DerefMut<Target = Connection>,
{
    /// Start a transaction. The connection must be `Ready`.
    pub fn new(conn: C) -> Result<Transaction<C>> {
        if conn.state() != ConnectionState::Ready {
            return Err(Error::InvalidState(format!(
                "cannot start a transaction on a {:?} connection",
                conn.state()
            )));
        }

        Ok(Transaction {
            conn,
            ops: vec![],
            state: TransactionState::Idle,
            watching: false,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of commands queued so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// `WATCH` keys so the commit aborts if any of them changes first.
    ///
    /// Only allowed before the first command is queued.
    pub async fn watch(&mut self, keys: &[String]) -> Result<()> {
        if self.state != TransactionState::Idle {
            return Err(Error::InvalidState(
                "WATCH must come before any queued command".into(),
            ));
        }
        if keys.is_empty() {
            return Err(Error::InvalidState("WATCH needs at least one key".into()));
        }

        self.conn.execute(Watch::new(keys).into_command()).await?;
        // 监视中的连接若被提前归还，连接池会丢弃它
        self.conn.set_state(ConnectionState::InTransaction);
        self.watching = true;
        Ok(())
    }

    /// Queue `cmd`; `projector` turns its reply into the value the returned
    /// [`Queued`] yields after a successful commit.
    pub fn queue<T, F>(&mut self, cmd: Command, projector: F) -> Result<Queued<T>>
    where
        T: Send + 'static,
        F: FnOnce(Frame) -> Result<T> + Send + 'static,
    {
        self.check_queueable(&cmd)?;
        let (op, queued) = QueuedOperation::projected(cmd, projector);
        self.ops.push(op);
        self.state = TransactionState::Queuing;
        Ok(queued)
    }

    /// Queue `cmd` and keep its raw reply.
    pub fn add(&mut self, cmd: Command) -> Result<Queued<Frame>> {
        self.queue(cmd, Ok)
    }

    fn check_queueable(&self, cmd: &Command) -> Result<()> {
        match self.state {
            TransactionState::Idle | TransactionState::Queuing => {}
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot queue on a {:?} transaction",
                    state
                )))
            }
        }

        let name = cmd.name();
        if CONTROL_COMMANDS.contains(&name.as_str()) || (cmd.is_pubsub_command() && name != "PING") {
            return Err(Error::InvalidState(format!(
                "`{}` cannot be queued in a transaction",
                name
            )));
        }
        Ok(())
    }

    /// Send `MULTI`, the queued commands and `EXEC`.
    ///
    /// # Errors
    ///
    /// * `Server` when a command was rejected at queue time or the server
    ///   answered `EXEC` with `-EXECABORT`. Nothing was applied; the
    ///   connection remains usable.
    /// * `Protocol` when the server did not answer as the protocol requires,
    ///   including an `EXEC` reply whose length differs from the number of
    ///   queued commands. The connection is closed.
    /// * A connection-class error if the socket failed; the transaction is
    ///   `Aborted` and its outcome unknown.
    #[instrument(skip(self), fields(id = self.conn.id(), commands = self.ops.len()))]
    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        match self.state {
            TransactionState::Idle | TransactionState::Queuing => {}
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot commit a {:?} transaction",
                    state
                )))
            }
        }

        self.state = TransactionState::Committing;
        self.conn.set_state(ConnectionState::InTransaction);
        let ops = std::mem::take(&mut self.ops);

        match self.run(ops).await {
            Ok(outcome) => {
                self.state = match outcome {
                    CommitOutcome::Committed => TransactionState::Committed,
                    CommitOutcome::Aborted => TransactionState::Aborted,
                };
                Ok(outcome)
            }
            Err(err) => {
                warn!(cause = %err, "transaction aborted");
                self.state = TransactionState::Aborted;
                Err(err)
            }
        }
    }

    async fn run(&mut self, ops: Vec<QueuedOperation>) -> Result<CommitOutcome> {
        let conn = &mut *self.conn;

        conn.queue_command(&Multi.into_command())?;
        for op in &ops {
            conn.queue_command(&op.command)?;
        }
        conn.flush().await?;

        match conn.read_reply().await? {
            Frame::Simple(_) => {}
            other => {
                return Err(conn.fail(Error::Protocol(format!("unexpected reply to MULTI: {:?}", other))))
            }
        }

        // 每条命令都要先读完它的 QUEUED 回复，才能保持 frame 对齐
        let mut rejected = None;
        for op in &ops {
            match conn.read_reply().await? {
                Frame::Simple(status) if status == "QUEUED" => {}
                Frame::Error(msg) => {
                    debug!(cmd = %op.command.name(), %msg, "command rejected at queue time");
                    rejected.get_or_insert(msg);
                }
                other => {
                    return Err(conn.fail(Error::Protocol(format!(
                        "expected QUEUED for `{}`, got {:?}",
                        op.command.name(),
                        other
                    ))))
                }
            }
        }

        if let Some(msg) = rejected {
            // DISCARD 同时取消所有 WATCH
            conn.execute(Discard.into_command()).await?;
            conn.set_state(ConnectionState::Ready);
            self.watching = false;
            return Err(Error::Server(msg));
        }

        conn.send_command(&Exec.into_command()).await?;
        let reply = conn.read_reply().await?;
        // EXEC 总会取消所有 WATCH
        self.watching = false;

        match reply {
            Frame::NullArray | Frame::Null => {
                conn.set_state(ConnectionState::Ready);
                debug!("transaction aborted by the server");
                Ok(CommitOutcome::Aborted)
            }
            Frame::Array(replies) if replies.len() == ops.len() => {
                conn.set_state(ConnectionState::Ready);
                for (op, reply) in ops.into_iter().zip(replies) {
                    op.complete(reply);
                }
                Ok(CommitOutcome::Committed)
            }
            Frame::Array(replies) => Err(conn.fail(Error::Protocol(format!(
                "EXEC returned {} replies for {} queued commands",
                replies.len(),
                ops.len()
            )))),
            Frame::Error(msg) => {
                conn.set_state(ConnectionState::Ready);
                Err(Error::Server(msg))
            }
            other => Err(conn.fail(Error::Protocol(format!("unexpected reply to EXEC: {:?}", other)))),
        }
    }

    /// Drop every queued command without sending it.
    ///
    /// Sends `UNWATCH` if keys are watched; otherwise nothing goes on the
    /// wire, since `MULTI` is only sent by `commit`.
    pub async fn discard(&mut self) -> Result<()> {
        if self.state.is_finished() || self.state == TransactionState::Committing {
            return Err(Error::InvalidState(format!(
                "cannot discard a {:?} transaction",
                self.state
            )));
        }

        // 丢弃 QueuedOperation 后，对应的 Queued 得到 NotCommitted
        self.ops.clear();
        self.state = TransactionState::Discarded;

        if self.watching {
            self.conn.execute(Unwatch.into_command()).await?;
            self.watching = false;
        }
        if self.conn.state() == ConnectionState::InTransaction {
            self.conn.set_state(ConnectionState::Ready);
        }
        Ok(())
    }

    /// Give the connection back, for example to run ordinary commands on it
    /// after the transaction.
    pub fn into_inner(self) -> C {
        self.conn
    }
}
