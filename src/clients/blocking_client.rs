//! Blocking wrapper around [`Client`].
//!
//! For callers that are not running inside an async runtime. Every method
//! drives the async client to completion on a private `current_thread`
//! runtime.

use crate::clients::Client;
use crate::cmd::Command;
use crate::pool::PoolStats;
use crate::pubsub::{Message, Subscriber, SubscriptionHandle, SubscriptionHandler};
use crate::{CommitOutcome, Config, Frame, Queued, Result, Transaction};

use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_stream::{Stream, StreamExt};

/// Blocking client.
///
/// Methods take `&self`, so a `BlockingClient` can be shared between
/// threads; each call still gets its own pooled connection.
#[derive(Debug, Clone)]
pub struct BlockingClient {
    /// The asynchronous `Client`.
    inner: Client,

    /// A `current_thread` runtime for executing operations on the
    /// asynchronous client in a blocking manner.
    /// 用于在异步客户端上以阻塞方式执行操作的 "current_thread runtime".
    rt: Arc<Runtime>,
}

/// A transaction driven from blocking code.
#[derive(Debug)]
pub struct BlockingTransaction {
    inner: Transaction,
    rt: Arc<Runtime>,
}

/// A connection that has entered pub/sub mode.
///
/// Once a connection subscribes to a channel it may only perform pub/sub
/// related commands, which is why subscriptions get their own type.
#[derive(Debug)]
pub struct BlockingSubscriber {
    /// The asynchronous `Subscriber`.
    inner: Subscriber,

    rt: Arc<Runtime>,
}

/// The iterator returned by `BlockingSubscriber::into_iter`.
struct SubscriberIterator {
    inner: Pin<Box<dyn Stream<Item = Result<Message>> + Send>>,

    rt: Arc<Runtime>,
}

impl BlockingClient {
    /// Build the client and check the first write endpoint answers.
    ///
    /// ```no_run
    /// use my_mini_redis_client::{BlockingClient, Config};
    ///
    /// fn main() {
    ///     let client = BlockingClient::connect(Config::from_url("localhost:6379").unwrap()).unwrap();
    ///     client.set("foo", "bar".into()).unwrap();
    ///
    ///     let val = client.get("foo").unwrap().unwrap();
    ///     assert_eq!(val, "bar");
    /// }
    /// ```
    pub fn connect(config: Config) -> Result<BlockingClient> {
        // new_current_thread 表示所有由这个运行时驱动的异步任务都将在调用线程上执行
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        // block_on 会阻塞当前线程，直到 Future 完成为止
        let inner = rt.block_on(Client::connect(config))?;

        Ok(BlockingClient {
            inner,
            rt: Arc::new(rt),
        })
    }

    /// Shorthand for `BlockingClient::connect(Config::from_url(url)?)`.
    pub fn open(url: &str) -> Result<BlockingClient> {
        BlockingClient::connect(Config::from_url(url)?)
    }

    pub fn execute(&self, cmd: Command) -> Result<Frame> {
        self.rt.block_on(self.inner.execute(cmd))
    }

    pub fn pipeline(&self, cmds: Vec<Command>) -> Result<Vec<Frame>> {
        self.rt.block_on(self.inner.pipeline(cmds))
    }

    pub fn ping(&self, msg: Option<Bytes>) -> Result<Bytes> {
        self.rt.block_on(self.inner.ping(msg))
    }

    /// Get the value of key
    ///
    /// If the key does not exist the special value `None` is returned.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.rt.block_on(self.inner.get(key))
    }

    /// Set `key` to hold the given `value`.
    pub fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.rt.block_on(self.inner.set(key, value))
    }

    /// Set `key` to hold the given `value`. The value expires after
    /// `expiration`.
    pub fn set_expires(&self, key: &str, value: Bytes, expiration: Duration) -> Result<()> {
        self.rt.block_on(self.inner.set_expires(key, value, expiration))
    }

    pub fn incr(&self, key: &str) -> Result<i64> {
        self.rt.block_on(self.inner.incr(key))
    }

    pub fn del(&self, keys: &[&str]) -> Result<i64> {
        self.rt.block_on(self.inner.del(keys))
    }

    /// Posts `message` to the given `channel`.
    ///
    /// Returns the number of subscribers currently listening on the channel.
    pub fn publish(&self, channel: &str, message: Bytes) -> Result<u64> {
        self.rt.block_on(self.inner.publish(channel, message))
    }

    pub fn transaction(&self) -> Result<BlockingTransaction> {
        let inner = self.rt.block_on(self.inner.transaction())?;
        Ok(BlockingTransaction {
            inner,
            rt: self.rt.clone(),
        })
    }

    /// Subscribes to the specified channels.
    pub fn subscribe(&self, channels: &[String]) -> Result<BlockingSubscriber> {
        let inner = self.rt.block_on(self.inner.subscribe(channels))?;
        Ok(BlockingSubscriber {
            inner,
            rt: self.rt.clone(),
        })
    }

    /// Subscribes to channels matching the specified glob patterns.
    pub fn psubscribe(&self, patterns: &[String]) -> Result<BlockingSubscriber> {
        let inner = self.rt.block_on(self.inner.psubscribe(patterns))?;
        Ok(BlockingSubscriber {
            inner,
            rt: self.rt.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn close(&self) {
        self.inner.close()
    }
}

impl BlockingTransaction {
    pub fn watch(&mut self, keys: &[String]) -> Result<()> {
        self.rt.block_on(self.inner.watch(keys))
    }

    pub fn queue<T, F>(&mut self, cmd: Command, projector: F) -> Result<Queued<T>>
    where
        T: Send + 'static,
        F: FnOnce(Frame) -> Result<T> + Send + 'static,
    {
        self.inner.queue(cmd, projector)
    }

    pub fn add(&mut self, cmd: Command) -> Result<Queued<Frame>> {
        self.inner.add(cmd)
    }

    pub fn commit(&mut self) -> Result<CommitOutcome> {
        self.rt.block_on(self.inner.commit())
    }

    pub fn discard(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.discard())
    }
}

impl BlockingSubscriber {
    /// Handle for changing subscriptions from another thread while `run`
    /// blocks this one.
    pub fn handle(&self) -> SubscriptionHandle {
        self.inner.handle()
    }

    /// Subscribe to a list of new channels
    pub fn subscribe(&mut self, channels: &[String]) -> Result<()> {
        self.rt.block_on(self.inner.subscribe(channels))
    }

    /// Subscribe to a list of new patterns
    pub fn psubscribe(&mut self, patterns: &[String]) -> Result<()> {
        self.rt.block_on(self.inner.psubscribe(patterns))
    }

    /// Block delivering messages to `handler` until everything has been
    /// unsubscribed. The connection then goes back to the pool.
    pub fn run<H>(self, handler: &mut H) -> Result<()>
    where
        H: SubscriptionHandler + ?Sized,
    {
        let rt = self.rt;
        rt.block_on(self.inner.run(handler))?;
        Ok(())
    }

    /// Convert the subscriber into an `Iterator` yielding new messages
    /// published on subscribed channels.
    pub fn into_iter(self) -> impl Iterator<Item = Result<Message>> {
        SubscriberIterator {
            inner: Box::pin(self.inner.into_stream()),
            rt: self.rt,
        }
    }
}

impl Iterator for SubscriberIterator {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Result<Message>> {
        self.rt.block_on(self.inner.next())
    }
}
