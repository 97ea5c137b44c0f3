//! Publish/subscribe receive loop.
//!
//! Once a connection has issued `SUBSCRIBE` or `PSUBSCRIBE` it stops
//! following the request/response discipline: the server pushes messages
//! whenever they are published, and the only commands the connection may
//! still send are further (un)subscribe requests and `PING`.
//!
//! A [`Subscriber`] owns such a connection. Its receive loop
//! ([`run`](Subscriber::run) or [`into_stream`](Subscriber::into_stream))
//! reads push frames and dispatches them until every channel and pattern has
//! been unsubscribed. Other tasks change the subscription set through a
//! [`SubscriptionHandle`]; the loop is the only place that touches the
//! connection.

use crate::cmd::{Ping, Subscribe, Unsubscribe};
use crate::connection::ConnectionState;
use crate::parse::Parse;
use crate::pool::PooledConnection;
use crate::shutdown::Shutdown;
use crate::{Connection, Error, Frame, Result};

use async_stream::try_stream;
use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::ops::DerefMut;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_stream::Stream;
use tracing::{debug, info, instrument};

/// A message published to a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    /// The pattern that matched `channel`, for pattern subscriptions.
    pub pattern: Option<String>,
    pub content: Bytes,
}

/// Callbacks invoked by [`Subscriber::run`], always from the receive loop.
///
/// Any `FnMut(Message)` closure is a handler that only cares about messages.
pub trait SubscriptionHandler: Send {
    /// A channel or pattern subscription was confirmed. `count` is the number
    /// of subscriptions the connection now holds.
    fn on_subscribe(&mut self, _name: &str, _count: i64) {}

    fn on_message(&mut self, message: Message);

    /// A channel or pattern was unsubscribed. `name` is empty when the server
    /// confirmed an unsubscribe with nothing subscribed.
    fn on_unsubscribe(&mut self, _name: &str, _count: i64) {}

    /// The last subscription is gone and the loop is about to return.
    fn on_unsubscribe_all(&mut self) {}
}

impl<F> SubscriptionHandler for F
where
    F: FnMut(Message) + Send,
{
    fn on_message(&mut self, message: Message) {
        self(message)
    }
}

/// Where a [`Subscriber`] is in its life cycle.
///
/// ```text
/// Idle -> Subscribing -> Active -> Unsubscribing -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    /// Waiting for subscribe confirmations.
    Subscribing,
    Active,
    /// Unsubscribe-all was requested.
    Unsubscribing,
}

/// Request sent from a [`SubscriptionHandle`] to the receive loop.
#[derive(Debug)]
enum Control {
    Subscribe(Vec<String>),
    PSubscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    PUnsubscribe(Vec<String>),
    UnsubscribeAll,
}

/// Changes the subscriptions of a running receive loop from any task or
/// thread.
///
/// Requests are queued and carried out by the loop in order. They fail with
/// `InvalidState` once the loop has ended.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SubscriptionHandle {
    pub fn subscribe(&self, channels: &[String]) -> Result<()> {
        self.send(Control::Subscribe(channels.to_vec()))
    }

    pub fn psubscribe(&self, patterns: &[String]) -> Result<()> {
        self.send(Control::PSubscribe(patterns.to_vec()))
    }

    /// An empty slice unsubscribes every channel.
    pub fn unsubscribe(&self, channels: &[String]) -> Result<()> {
        self.send(Control::Unsubscribe(channels.to_vec()))
    }

    /// An empty slice unsubscribes every pattern.
    pub fn punsubscribe(&self, patterns: &[String]) -> Result<()> {
        self.send(Control::PUnsubscribe(patterns.to_vec()))
    }

    /// Drop every channel and pattern subscription, which ends the loop.
    pub fn unsubscribe_all(&self) -> Result<()> {
        self.send(Control::UnsubscribeAll)
    }

    fn send(&self, control: Control) -> Result<()> {
        self.tx
            .send(control)
            .map_err(|_| Error::InvalidState("subscription loop has ended".into()))
    }
}

/// A decoded push frame.
#[derive(Debug, PartialEq)]
enum Push {
    Message(Message),
    Subscribed {
        name: String,
        pattern: bool,
        count: i64,
    },
    Unsubscribed {
        name: Option<String>,
        pattern: bool,
        count: i64,
    },
    Pong,
}

impl Push {
    /// ```text
    /// ["message", channel, payload]
    /// ["pmessage", pattern, channel, payload]
    /// ["subscribe" | "psubscribe", name, count]
    /// ["unsubscribe" | "punsubscribe", name | nil, count]
    /// ["pong", payload]
    /// ```
    fn parse(frame: Frame) -> Result<Push> {
        if let Frame::Error(msg) = frame {
            return Err(Error::Server(msg));
        }

        let mut parse = Parse::new(frame)?;
        let kind = parse.next_string()?.to_ascii_lowercase();

        let push = match kind.as_str() {
            "message" => Push::Message(Message {
                channel: parse.next_string()?,
                pattern: None,
                content: parse.next_bytes()?,
            }),
            "pmessage" => {
                let pattern = parse.next_string()?;
                Push::Message(Message {
                    channel: parse.next_string()?,
                    pattern: Some(pattern),
                    content: parse.next_bytes()?,
                })
            }
            "subscribe" | "psubscribe" => Push::Subscribed {
                pattern: kind == "psubscribe",
                name: parse.next_string()?,
                count: parse.next_int()?,
            },
            "unsubscribe" | "punsubscribe" => Push::Unsubscribed {
                pattern: kind == "punsubscribe",
                name: parse.next_optional_string()?,
                count: parse.next_int()?,
            },
            // 心跳回复，内容无关紧要
            "pong" => return Ok(Push::Pong),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected push message `{}` with {} more entries",
                    other,
                    parse.remaining()
                )))
            }
        };

        parse.finish()?;
        Ok(push)
    }
}

/// What the receive loop woke up for.
enum Step {
    Frame(Result<Frame>),
    Control(Control),
    Heartbeat,
    Shutdown,
}

/// Outcome of handling one step, as seen by the caller of the loop.
enum Event {
    Message(Message),
    Subscribed(String, i64),
    Unsubscribed(String, i64),
    Finished,
}

/// A connection dedicated to receiving published messages.
///
/// `C` is anything that dereferences to a [`Connection`]: a
/// [`PooledConnection`] or a plain `&mut Connection`. When the loop ends
/// because everything was unsubscribed, the connection is `Ready` again and
/// handed back to the caller.
#[derive(Debug)]
pub struct Subscriber<C = PooledConnection>
where
    C: DerefMut<Target = Connection>,
{
    conn: C,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    // 已发送但尚未确认的订阅数量
    pending_channels: usize,
    pending_patterns: usize,
    state: SubscriptionState,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    heartbeat: Option<Duration>,
}

impl<C> Subscriber<C>
where
    C: DerefMut<Target = Connection>,
{
    /// Take over `conn`, which must be `Ready`.
    pub fn new(conn: C) -> Result<Subscriber<C>> {
        if conn.state() != ConnectionState::Ready {
            return Err(Error::InvalidState(format!(
                "cannot subscribe on a {:?} connection",
                conn.state()
            )));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Subscriber {
            conn,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            pending_channels: 0,
            pending_patterns: 0,
            state: SubscriptionState::Idle,
            control_tx,
            control_rx,
            heartbeat: None,
        })
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Channels whose subscription has been confirmed.
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }

    /// Patterns whose subscription has been confirmed.
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().cloned().collect()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Send a `PING` every `interval` while the loop waits for messages, so
    /// a dead peer is noticed even on a quiet channel.
    pub fn heartbeat(mut self, interval: Duration) -> Subscriber<C> {
        self.heartbeat = Some(interval);
        self
    }

    /// Send `SUBSCRIBE`. Confirmations are processed by the receive loop.
    pub async fn subscribe(&mut self, channels: &[String]) -> Result<()> {
        self.send_subscribe(channels.to_vec(), false).await
    }

    /// Send `PSUBSCRIBE`. Confirmations are processed by the receive loop.
    pub async fn psubscribe(&mut self, patterns: &[String]) -> Result<()> {
        self.send_subscribe(patterns.to_vec(), true).await
    }

    async fn send_subscribe(&mut self, names: Vec<String>, pattern: bool) -> Result<()> {
        if names.is_empty() {
            return Err(Error::InvalidState("nothing to subscribe to".into()));
        }

        let count = names.len();
        let cmd = if pattern {
            Subscribe::patterns(names)
        } else {
            Subscribe::channels(names)
        };

        // 第一次订阅之后连接就进入了订阅模式
        if self.conn.state() == ConnectionState::Ready {
            self.conn.set_state(ConnectionState::Subscribed);
        }
        self.conn.send_command(&cmd.into_command()).await?;

        if pattern {
            self.pending_patterns += count;
        } else {
            self.pending_channels += count;
        }
        if self.state != SubscriptionState::Unsubscribing {
            self.state = SubscriptionState::Subscribing;
        }
        Ok(())
    }

    async fn send_unsubscribe(&mut self, names: Vec<String>, pattern: bool) -> Result<()> {
        let cmd = if pattern {
            Unsubscribe::patterns(&names)
        } else {
            Unsubscribe::channels(&names)
        };
        self.conn.send_command(&cmd.into_command()).await
    }

    /// Unsubscribe from everything, sending only the commands that will be
    /// confirmed.
    async fn unsubscribe_all(&mut self) -> Result<()> {
        self.state = SubscriptionState::Unsubscribing;

        if !self.channels.is_empty() || self.pending_channels > 0 {
            self.send_unsubscribe(vec![], false).await?;
        }
        if !self.patterns.is_empty() || self.pending_patterns > 0 {
            self.send_unsubscribe(vec![], true).await?;
        }
        Ok(())
    }

    fn has_subscriptions(&self) -> bool {
        !self.channels.is_empty()
            || !self.patterns.is_empty()
            || self.pending_channels > 0
            || self.pending_patterns > 0
    }

    /// Run the receive loop until every subscription is gone, then hand the
    /// connection back.
    pub async fn run<H>(self, handler: &mut H) -> Result<C>
    where
        H: SubscriptionHandler + ?Sized,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Like [`run`](Subscriber::run), but unsubscribes from everything once
    /// `shutdown` completes. The loop still waits for the confirmations, so
    /// the connection comes back `Ready`.
    #[instrument(skip_all, fields(id = self.conn.id()))]
    pub async fn run_until<H, F>(mut self, handler: &mut H, shutdown: F) -> Result<C>
    where
        H: SubscriptionHandler + ?Sized,
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.has_subscriptions() {
            return Err(Error::InvalidState("nothing subscribed".into()));
        }

        let mut shutdown = Shutdown::new(shutdown);
        let mut heartbeat = self.heartbeat.map(heartbeat_interval);

        loop {
            let step = self.next_step(&mut heartbeat, &mut shutdown).await;
            match self.handle_step(step).await? {
                Some(Event::Message(message)) => handler.on_message(message),
                Some(Event::Subscribed(name, count)) => handler.on_subscribe(&name, count),
                Some(Event::Unsubscribed(name, count)) => handler.on_unsubscribe(&name, count),
                Some(Event::Finished) => break,
                None => {}
            }
        }

        handler.on_unsubscribe_all();
        Ok(self.finish())
    }

    /// Turn the receive loop into a stream of messages. The stream ends once
    /// every subscription is gone; the connection is released with it.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Message>>
    where
        C: Send,
    {
        try_stream! {
            if !self.has_subscriptions() {
                Err::<(), _>(Error::InvalidState("nothing subscribed".into()))?;
            }

            let mut shutdown = Shutdown::never();
            let mut heartbeat = self.heartbeat.map(heartbeat_interval);

            loop {
                let step = self.next_step(&mut heartbeat, &mut shutdown).await;
                match self.handle_step(step).await? {
                    Some(Event::Message(message)) => yield message,
                    Some(Event::Finished) => break,
                    _ => {}
                }
            }

            self.finish();
        }
    }

    /// Wait for whatever comes first. Every branch is cancel safe.
    async fn next_step(&mut self, heartbeat: &mut Option<Interval>, shutdown: &mut Shutdown) -> Step {
        tokio::select! {
            res = self.conn.read_push() => Step::Frame(res),
            Some(control) = self.control_rx.recv() => Step::Control(control),
            _ = tick(heartbeat) => Step::Heartbeat,
            _ = shutdown.recv(), if !shutdown.is_shutdown() => Step::Shutdown,
        }
    }

    async fn handle_step(&mut self, step: Step) -> Result<Option<Event>> {
        match step {
            Step::Frame(res) => self.dispatch(res?),
            Step::Control(control) => {
                self.apply(control).await?;
                Ok(None)
            }
            Step::Heartbeat => {
                self.conn.send_command(&Ping::new(None).into_command()).await?;
                Ok(None)
            }
            Step::Shutdown => {
                info!("shutdown requested, unsubscribing");
                self.unsubscribe_all().await?;
                Ok(None)
            }
        }
    }

    async fn apply(&mut self, control: Control) -> Result<()> {
        debug!(?control, "subscription change");
        match control {
            Control::Subscribe(names) => self.send_subscribe(names, false).await,
            Control::PSubscribe(names) => self.send_subscribe(names, true).await,
            Control::Unsubscribe(names) => self.send_unsubscribe(names, false).await,
            Control::PUnsubscribe(names) => self.send_unsubscribe(names, true).await,
            Control::UnsubscribeAll => self.unsubscribe_all().await,
        }
    }

    /// Update the subscription set from one push frame.
    fn dispatch(&mut self, frame: Frame) -> Result<Option<Event>> {
        let push = match Push::parse(frame) {
            Ok(push) => push,
            // 无法识别的推送意味着字节流已经错位
            Err(err @ Error::Protocol(_)) => return Err(self.conn.fail(err)),
            Err(err) => return Err(err),
        };

        let event = match push {
            Push::Message(message) => Event::Message(message),
            Push::Subscribed { name, pattern, count } => {
                if pattern {
                    self.pending_patterns = self.pending_patterns.saturating_sub(1);
                    self.patterns.insert(name.clone());
                } else {
                    self.pending_channels = self.pending_channels.saturating_sub(1);
                    self.channels.insert(name.clone());
                }
                if self.state == SubscriptionState::Subscribing
                    && self.pending_channels == 0
                    && self.pending_patterns == 0
                {
                    self.state = SubscriptionState::Active;
                }
                debug!(%name, count, "subscribed");
                Event::Subscribed(name, count)
            }
            Push::Unsubscribed { name, pattern, count } => {
                if let Some(name) = &name {
                    if pattern {
                        self.patterns.remove(name);
                    } else {
                        self.channels.remove(name);
                    }
                }
                debug!(?name, count, "unsubscribed");

                // 服务端在订阅数降为0时退出订阅模式
                if count == 0 && self.pending_channels == 0 && self.pending_patterns == 0 {
                    self.channels.clear();
                    self.patterns.clear();
                    return Ok(Some(Event::Finished));
                }
                Event::Unsubscribed(name.unwrap_or_default(), count)
            }
            Push::Pong => {
                debug!("heartbeat acknowledged");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    /// Leave subscribed mode and give the connection back.
    fn finish(mut self) -> C {
        self.state = SubscriptionState::Idle;
        self.conn.set_state(ConnectionState::Ready);
        info!(id = self.conn.id(), "subscription loop finished");
        self.conn
    }
}

fn heartbeat_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
