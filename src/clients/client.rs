//! Pooled async client.
//!
//! Every call borrows a connection from the pool for exactly as long as it
//! needs it. Long lived units of work (transactions, subscriptions) keep
//! their connection until they end.

use crate::cmd::{Command, Get, Incr, Ping, Publish, Set};
use crate::config::Endpoint;
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::{Config, Error, Frame, Result, Subscriber, Transaction};

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, instrument};

/// Client backed by one pool for writes and, optionally, one for reads.
///
/// Cloning is cheap; clones share the pools.
///
/// Requests are issued using the various methods of `Client`.
#[derive(Debug, Clone)]
pub struct Client {
    write: ConnectionPool,

    // 没有配置只读节点时，读操作也走写连接池
    read: Option<ConnectionPool>,
}

impl Client {
    /// Build a client from `config`. No connection is opened yet.
    pub fn new(config: Config) -> Result<Client> {
        config.validate()?;

        let write = ConnectionPool::new(config.write_pool_config())?;
        let read = match config.read_pool_config() {
            Some(read) => Some(ConnectionPool::new(read)?),
            None => None,
        };
        Ok(Client { write, read })
    }

    /// Build a client and make sure the first write endpoint answers.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use my_mini_redis_client::{Client, Config};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = match Client::connect(Config::from_url("localhost:6379").unwrap()).await {
    ///         Ok(client) => client,
    ///         Err(_) => panic!("failed to establish connection"),
    ///     };
    /// # drop(client);
    /// }
    /// ```
    pub async fn connect(config: Config) -> Result<Client> {
        let client = Client::new(config)?;
        // 借出即归还，用于提前发现地址或密码错误
        client.write.borrow().await?;
        Ok(client)
    }

    /// Shorthand for `Client::connect(Config::from_url(url)?)`.
    pub async fn open(url: &str) -> Result<Client> {
        Client::connect(Config::from_url(url)?).await
    }

    /// Borrow a connection that accepts writes.
    pub async fn borrow(&self) -> Result<PooledConnection> {
        self.write.borrow().await
    }

    /// Borrow a connection for read-only commands.
    pub async fn borrow_read(&self) -> Result<PooledConnection> {
        self.read_pool().borrow().await
    }

    /// Run one command on a write connection.
    #[instrument(skip(self))]
    pub async fn execute(&self, cmd: Command) -> Result<Frame> {
        let mut conn = self.borrow().await?;
        conn.execute(cmd).await
    }

    /// Run one read-only command.
    #[instrument(skip(self))]
    pub async fn execute_read(&self, cmd: Command) -> Result<Frame> {
        let mut conn = self.borrow_read().await?;
        conn.execute(cmd).await
    }

    /// Send `cmds` as one pipeline on a single connection and return the
    /// replies in order. Error replies stay in their slot as `Frame::Error`.
    pub async fn pipeline(&self, cmds: Vec<Command>) -> Result<Vec<Frame>> {
        let mut conn = self.borrow().await?;
        let mut pipeline = conn.pipeline();
        for cmd in cmds {
            pipeline.add(cmd);
        }
        pipeline.flush().await
    }

    /// Start a transaction on a freshly borrowed connection.
    pub async fn transaction(&self) -> Result<Transaction> {
        Transaction::new(self.borrow().await?)
    }

    /// Take a connection for a subscription. Nothing is subscribed yet.
    pub async fn subscriber(&self) -> Result<Subscriber> {
        Subscriber::new(self.borrow().await?)
    }

    /// Subscribes to the specified channels.
    ///
    /// The returned `Subscriber` is used to receive messages as well as
    /// change the set of subscriptions.
    pub async fn subscribe(&self, channels: &[String]) -> Result<Subscriber> {
        let mut subscriber = self.subscriber().await?;
        subscriber.subscribe(channels).await?;
        Ok(subscriber)
    }

    /// Subscribes to channels matching the specified glob patterns.
    pub async fn psubscribe(&self, patterns: &[String]) -> Result<Subscriber> {
        let mut subscriber = self.subscriber().await?;
        subscriber.psubscribe(patterns).await?;
        Ok(subscriber)
    }

    /// Ping to the server.
    ///
    /// Returns PONG if no argument is provided, otherwise return a copy of
    /// the argument as a bulk.
    pub async fn ping(&self, msg: Option<Bytes>) -> Result<Bytes> {
        let cmd = Ping::new(msg.clone()).into_command();
        self.call(&self.write, cmd, move |frame| {
            if Ping::is_pong(msg.as_ref(), &frame) {
                frame.into_bytes().ok_or_else(|| unexpected("PING", "status"))
            } else {
                Err(unexpected_frame("PING", &frame))
            }
        })
        .await
    }

    /// Get the value of key.
    ///
    /// If the key does not exist the special value `None` is returned.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let cmd = Get::new(key).into_command();
        self.call(self.read_pool(), cmd, |frame| match frame {
            Frame::Bulk(value) => Ok(Some(value)),
            Frame::Simple(value) => Ok(Some(Bytes::from(value.into_bytes()))),
            Frame::Null => Ok(None),
            frame => Err(unexpected_frame("GET", &frame)),
        })
        .await
    }

    /// Set `key` to hold the given `value`.
    pub async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.set_cmd(Set::new(key, value, None)).await
    }

    /// Set `key` to hold the given `value`. The value expires after
    /// `expiration`.
    pub async fn set_expires(&self, key: &str, value: Bytes, expiration: Duration) -> Result<()> {
        self.set_cmd(Set::new(key, value, Some(expiration))).await
    }

    async fn set_cmd(&self, cmd: Set) -> Result<()> {
        self.call(&self.write, cmd.into_command(), |frame| match frame {
            Frame::Simple(status) if status == "OK" => Ok(()),
            frame => Err(unexpected_frame("SET", &frame)),
        })
        .await
    }

    /// Increment the integer stored at `key` and return the new value.
    pub async fn incr(&self, key: &str) -> Result<i64> {
        let cmd = Incr::new(key).into_command();
        self.call(&self.write, cmd, |frame| integer("INCR", frame)).await
    }

    /// Remove `keys`, returning how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64> {
        if keys.is_empty() {
            return Err(Error::InvalidState("DEL needs at least one key".into()));
        }
        let cmd = Command::new("DEL").args(keys);
        self.call(&self.write, cmd, |frame| integer("DEL", frame)).await
    }

    /// Posts `message` to the given `channel`.
    ///
    /// Returns the number of subscribers currently listening on the channel.
    /// There is no guarantee that these subscribers receive the message as
    /// they may disconnect at any time.
    pub async fn publish(&self, channel: &str, message: Bytes) -> Result<u64> {
        let cmd = Publish::new(channel, message).into_command();
        let count = self.call(&self.write, cmd, |frame| integer("PUBLISH", frame)).await?;
        Ok(count.max(0) as u64)
    }

    pub fn stats(&self) -> PoolStats {
        self.write.stats()
    }

    /// Statistics of the read pool, when one is configured.
    pub fn read_stats(&self) -> Option<PoolStats> {
        self.read.as_ref().map(ConnectionPool::stats)
    }

    /// Point the pools at new endpoints. `read` is ignored when no read pool
    /// is configured.
    pub fn failover_to(&self, write: Vec<Endpoint>, read: Option<Vec<Endpoint>>) -> Result<()> {
        self.write.failover_to(write)?;
        if let (Some(pool), Some(read)) = (&self.read, read) {
            pool.failover_to(read)?;
        }
        Ok(())
    }

    /// Close every pool. Outstanding connections are dropped as they come
    /// back.
    pub fn close(&self) {
        self.write.close();
        if let Some(read) = &self.read {
            read.close();
        }
    }

    fn read_pool(&self) -> &ConnectionPool {
        self.read.as_ref().unwrap_or(&self.write)
    }

    /// Run `cmd` and project its reply while still holding the connection,
    /// so a reply of the wrong shape closes it.
    async fn call<T, F>(&self, pool: &ConnectionPool, cmd: Command, project: F) -> Result<T>
    where
        F: FnOnce(Frame) -> Result<T>,
    {
        let mut conn = pool.borrow().await?;
        let frame = conn.execute(cmd).await?;
        debug!(?frame);

        match project(frame) {
            Err(err @ Error::Protocol(_)) => Err(conn.fail(err)),
            res => res,
        }
    }
}

fn integer(cmd: &str, frame: Frame) -> Result<i64> {
    match frame {
        Frame::Integer(n) => Ok(n),
        frame => Err(unexpected_frame(cmd, &frame)),
    }
}

fn unexpected_frame(cmd: &str, frame: &Frame) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", cmd, frame))
}

fn unexpected(cmd: &str, expected: &str) -> Error {
    Error::Protocol(format!("expected {} reply to {}", expected, cmd))
}
