use crate::cmd::{Auth, ClientSetName, Command, Ping, Select};
use crate::config::{ConnectionOptions, Endpoint};
use crate::frame::{self, Frame};
use crate::pipeline::Pipeline;
use crate::{Error, Result};

use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Protocol state of a [`Connection`].
///
/// ```text
/// Disconnected -> Connecting -> Ready <-> { InTransaction, Subscribed }
///                                  \-> Closed
/// ```
///
/// `Closed` is terminal except through [`Connection::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    InTransaction,
    Subscribed,
    Closed,
}

/// Send commands to and receive `Frame` values from a Redis server.
///
/// A `Connection` owns one socket. Commands are encoded into an internal
/// write buffer with [`queue_command`](Connection::queue_command) and put on
/// the wire by [`flush`](Connection::flush), which is what makes pipelining
/// possible: any number of commands can be written before the first reply is
/// read.
///
/// To read frames, the `Connection` uses an internal buffer, which is filled
/// up until there are enough bytes to create a full frame. Once this happens,
/// the `Connection` creates the frame and returns it to the caller. Bytes
/// left over after a frame stay in the buffer for the next read.
///
/// Any I/O failure, timeout or undecodable reply moves the connection to
/// `Closed`. A closed connection refuses every further command; the pool
/// drops it instead of lending it out again.
#[derive(Debug)]
pub struct Connection {
    id: u64,

    endpoint: Endpoint,

    options: ConnectionOptions,

    // `None` 表示当前没有可用的socket (Disconnected / Closed)
    stream: Option<TcpStream>,

    // 用来读frame的buffer
    buffer: BytesMut,

    // 已编码但尚未写入socket的命令
    write_buf: BytesMut,

    state: ConnectionState,

    /// Incremented on every reconnect.
    generation: u64,

    last_active: Instant,
}

impl Connection {
    /// Open a socket to `endpoint` and run the handshake: AUTH when a
    /// password is configured, SELECT for a non-zero database, CLIENT SETNAME
    /// when a client name is configured.
    ///
    /// Every failure here is a connection-class error.
    #[instrument(skip(options), fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: Endpoint, options: ConnectionOptions) -> Result<Connection> {
        let mut conn = Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            options,
            stream: None,
            // read buffer 默认大小为4KB，足以放下大多数回复
            buffer: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            state: ConnectionState::Disconnected,
            generation: 0,
            last_active: Instant::now(),
        };

        conn.open().await?;
        Ok(conn)
    }

    /// Process-unique identifier, stable across reconnects.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of times the socket was re-established.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Time since the last successful read or write.
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Whether the connection can go back to a pool as is.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready && self.write_buf.is_empty()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        debug!(id = self.id, from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }

    /// Start a pipeline on this connection.
    pub fn pipeline(&mut self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Check that `cmd` may be sent in the current state, without touching
    /// the socket.
    pub fn ensure_can_send(&self, cmd: &Command) -> Result<()> {
        use ConnectionState::*;

        match self.state {
            Ready | InTransaction => Ok(()),
            Subscribed if cmd.is_pubsub_command() => Ok(()),
            Subscribed => Err(Error::InvalidState(format!(
                "`{}` cannot be sent on a subscribed connection",
                cmd.name()
            ))),
            Disconnected | Connecting | Closed => Err(Error::Closed),
        }
    }

    /// Encode `cmd` into the write buffer. Nothing is written to the socket
    /// until [`flush`](Connection::flush).
    pub fn queue_command(&mut self, cmd: &Command) -> Result<()> {
        self.ensure_can_send(cmd)?;
        cmd.encode(&mut self.write_buf);
        Ok(())
    }

    /// Write every queued command to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let limit = self.options.timeouts.write;
        let buf = &self.write_buf;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(Error::Closed),
        };
        let res = with_timeout("write", limit, async move {
            stream.write_all(buf).await?;
            stream.flush().await
        })
        .await;

        match res {
            Ok(()) => {
                self.write_buf.clear();
                self.touch();
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Encode and write one command. Does not wait for the reply.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        self.queue_command(cmd)?;
        self.flush().await
    }

    /// Wait until one full reply has been received.
    ///
    /// Error replies are returned as `Frame::Error`; the connection stays
    /// usable. The read timeout applies.
    pub async fn read_reply(&mut self) -> Result<Frame> {
        match self.state {
            ConnectionState::Ready | ConnectionState::InTransaction | ConnectionState::Subscribed => {}
            _ => return Err(Error::Closed),
        }
        let limit = self.options.timeouts.read;
        self.read_frame(limit).await
    }

    /// Read the next frame with no time limit. Used by the subscription loop,
    /// which may wait indefinitely for a message.
    ///
    /// Safe to cancel: bytes already read stay in the buffer.
    pub(crate) async fn read_push(&mut self) -> Result<Frame> {
        if self.state != ConnectionState::Subscribed {
            return Err(Error::InvalidState("connection is not subscribed".into()));
        }
        self.read_frame(None).await
    }

    /// Send `cmd` and wait for its reply. An error reply becomes
    /// `Err(Error::Server)`.
    #[instrument(skip(self, cmd), fields(id = self.id, cmd = %cmd.name()))]
    pub async fn execute(&mut self, cmd: Command) -> Result<Frame> {
        self.send_command(&cmd).await?;
        let frame = self.read_reply().await?;
        debug!(?frame);
        frame.into_result()
    }

    /// Round trip a `PING`.
    pub async fn ping(&mut self) -> Result<()> {
        let limit = self.options.timeouts.read;
        self.ping_within(limit).await
    }

    /// `PING` whose reply must arrive within `limit`, whatever the read
    /// timeout says. Expiry closes the connection.
    pub(crate) async fn ping_within(&mut self, limit: Option<Duration>) -> Result<()> {
        self.send_command(&Ping::new(None).into_command()).await?;
        let reply = self.read_frame(limit).await?.into_result()?;
        if Ping::is_pong(None, &reply) {
            Ok(())
        } else {
            Err(self.fail(Error::Protocol(format!("unexpected reply to PING: {:?}", reply))))
        }
    }

    /// Drop the current socket and connect again, following the configured
    /// [`ReconnectPolicy`](crate::config::ReconnectPolicy). The generation
    /// counter is bumped first so anything holding the old generation can
    /// tell the socket changed.
    ///
    /// Leaves the connection `Closed` when every attempt fails.
    #[instrument(skip(self), fields(id = self.id, endpoint = %self.endpoint))]
    pub async fn reconnect(&mut self) -> Result<()> {
        let policy = self.options.reconnect;
        self.stream = None;
        self.generation += 1;

        let mut last_err = Error::Closed;
        for attempt in 1..=policy.max_attempts.max(1) {
            if attempt > 1 {
                time::sleep(policy.delay(attempt - 1)).await;
            }
            match self.open().await {
                Ok(()) => {
                    info!(generation = self.generation, attempt, "reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, cause = %err, "reconnect attempt failed");
                    last_err = err;
                }
            }
        }

        self.state = ConnectionState::Closed;
        Err(last_err)
    }

    /// Shut the socket down. The connection cannot be used afterwards.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.buffer.clear();
        self.write_buf.clear();
        self.state = ConnectionState::Closed;
        debug!(id = self.id, "connection closed");
    }

    async fn open(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        self.buffer.clear();
        self.write_buf.clear();

        match self.establish().await {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                self.touch();
                debug!(id = self.id, generation = self.generation, "connection ready");
                Ok(())
            }
            Err(err) => {
                self.stream = None;
                self.state = ConnectionState::Disconnected;
                // 握手阶段的协议错误也算连接错误
                Err(match err {
                    Error::Protocol(msg) | Error::Server(msg) => Error::Handshake(msg),
                    err => err,
                })
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let addr = self.endpoint.addr();
        let socket = with_timeout("connect", self.options.timeouts.connect, TcpStream::connect(addr)).await?;
        // Disable Nagle to keep request latency low for small payloads.
        socket.set_nodelay(true)?;
        self.stream = Some(socket);

        if let Some(password) = self.endpoint.password.clone() {
            let auth = Auth::new(self.endpoint.username.clone(), password);
            self.handshake(auth.into_command()).await?;
        }
        if self.endpoint.database != 0 {
            self.handshake(Select::new(self.endpoint.database).into_command()).await?;
        }
        if let Some(name) = self.options.client_name.clone() {
            self.handshake(ClientSetName::new(name).into_command()).await?;
        }
        Ok(())
    }

    /// Send one handshake command and expect a status reply.
    async fn handshake(&mut self, cmd: Command) -> Result<()> {
        cmd.encode(&mut self.write_buf);
        self.flush().await?;

        match self.read_frame(self.options.timeouts.read).await? {
            Frame::Simple(_) => Ok(()),
            Frame::Error(msg) => Err(Error::Handshake(format!("{} rejected: {}", cmd.name(), msg))),
            other => Err(Error::Handshake(format!(
                "unexpected reply to {}: {:?}",
                cmd.name(),
                other
            ))),
        }
    }

    async fn read_frame(&mut self, limit: Option<Duration>) -> Result<Frame> {
        loop {
            // 尝试从buffer中解析出一个frame。如果buffer中有足够的数据，返回一个frame
            match self.parse_frame() {
                Ok(Some(frame)) => {
                    self.touch();
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }

            // 如果没有读到足够的数据，尝试从socket中读取更多数据
            let buffer = &mut self.buffer;
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(Error::Closed),
            };
            let read = with_timeout("read", limit, stream.read_buf(buffer)).await;

            match read {
                Ok(0) => {
                    // 远程关闭了连接。若要干净的关闭，buffer中不应该有数据
                    // 如果有，这表示远程在发送frame时关闭了socket
                    let err = if self.buffer.is_empty() {
                        Error::Closed
                    } else {
                        Error::Io(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "connection reset by peer",
                        ))
                    };
                    return Err(self.fail(err));
                }
                Ok(_) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Tries to parse a frame from the buffer. If the buffer contains enough
    /// data, the frame is returned and the data removed from the buffer. If
    /// not enough data has been buffered yet, `Ok(None)` is returned. If the
    /// buffered data does not represent a valid frame, `Err` is returned.
    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut cursor = Cursor::new(&self.buffer[..]);

        // 首先快速判断buffer中数据是否是一个完整的frame，在那之前不分配任何空间
        match Frame::check(&mut cursor) {
            Ok(_) => {
                // check过后，position就是这个frame的完整长度
                let len = cursor.position() as usize;
                cursor.set_position(0);
                let frame = Frame::parse(&mut cursor)?;

                // 摒弃已经解析过的frame data
                self.buffer.advance(len);
                Ok(Some(frame))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record that the socket was used successfully.
    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Mark the connection closed after a fatal error and hand the error back.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal_to_connection() {
            warn!(
                id = self.id,
                generation = self.generation,
                endpoint = %self.endpoint,
                cause = %err,
                "closing connection"
            );
            self.stream = None;
            self.buffer.clear();
            self.write_buf.clear();
            self.state = ConnectionState::Closed;
        }
        err
    }
}

/// Run an I/O future under an optional deadline. Expiry maps to
/// `Error::Timeout`.
async fn with_timeout<T, F>(op: &'static str, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match time::timeout(limit, fut).await {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(Error::Timeout { op }),
        },
        None => fut.await.map_err(Error::from),
    }
}
