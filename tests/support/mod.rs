//! In-process server for integration tests.
//!
//! Speaks enough RESP to exercise the client: strings, counters, MULTI/EXEC
//! with WATCH, pub/sub with patterns, AUTH/SELECT/CLIENT SETNAME. It can drop
//! every client connection or stop listening altogether to simulate failures.

#![allow(dead_code)]

use my_mini_redis_client::config::{ReconnectPolicy, Timeouts};
use my_mini_redis_client::{Config, Endpoint, Frame};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Signal {
    /// Close every client socket, keep listening.
    DropClients,
    /// Close every client socket and the listener.
    Stop,
}

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Shared {
    entries: HashMap<String, Entry>,
    /// Bumped on every write, for WATCH.
    versions: HashMap<String, u64>,
    /// client id -> (channels, patterns)
    subscriptions: HashMap<u64, (HashSet<String>, HashSet<String>)>,
    client_names: Vec<String>,
    selected_dbs: Vec<i64>,
    accepted: usize,
    active: usize,
    commands: usize,
}

impl Shared {
    fn get(&mut self, key: &str) -> Option<Bytes> {
        let expired = match self.entries.get(key) {
            Some(entry) => matches!(entry.expires_at, Some(at) if at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn set(&mut self, key: &str, value: Bytes, expires_at: Option<Instant>) {
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        self.touch(key);
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn receivers(&self, channel: &str) -> i64 {
        let mut count = 0;
        for (channels, patterns) in self.subscriptions.values() {
            if channels.contains(channel) {
                count += 1;
            }
            count += patterns.iter().filter(|p| glob_match(p.as_bytes(), channel.as_bytes())).count() as i64;
        }
        count
    }
}

/// Handle to a running test server.
pub struct TestServer {
    pub addr: SocketAddr,
    password: Option<String>,
    shared: Arc<Mutex<Shared>>,
    signals: broadcast::Sender<Signal>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

pub async fn start_server() -> TestServer {
    start(None).await
}

pub async fn start_server_with_password(password: &str) -> TestServer {
    start(Some(password.to_string())).await
}

async fn start(password: Option<String>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shared = Arc::new(Mutex::new(Shared::default()));
    let (signals, _) = broadcast::channel(16);
    let (messages, _) = broadcast::channel(1024);

    let accept_loop = tokio::spawn(accept(
        listener,
        shared.clone(),
        signals.clone(),
        messages,
        password.clone(),
    ));

    TestServer {
        addr,
        password,
        shared,
        signals,
        accept_loop: Mutex::new(Some(accept_loop)),
    }
}

impl TestServer {
    pub fn endpoint(&self) -> Endpoint {
        let endpoint = Endpoint::new(self.addr.ip().to_string(), self.addr.port());
        match &self.password {
            Some(password) => endpoint.with_password(password),
            None => endpoint,
        }
    }

    /// Client configuration suited to tests: short timeouts, a single fast
    /// reconnect attempt.
    pub fn config(&self) -> Config {
        Config::new(self.endpoint())
            .with_borrow_timeout(Duration::from_millis(500))
            .with_timeouts(Timeouts {
                connect: Some(Duration::from_secs(1)),
                read: Some(Duration::from_secs(2)),
                write: Some(Duration::from_secs(2)),
            })
            .with_reconnect(ReconnectPolicy::once())
    }

    /// Close every client socket and wait until the handlers are gone.
    pub async fn drop_clients(&self) {
        let _ = self.signals.send(Signal::DropClients);
        self.wait_idle().await;
    }

    /// Stop listening and close every client socket.
    pub async fn stop(&self) {
        let _ = self.signals.send(Signal::Stop);
        let handle = self.accept_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.wait_idle().await;
    }

    async fn wait_idle(&self) {
        for _ in 0..200 {
            if self.shared.lock().unwrap().active == 0 {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("client handlers did not shut down");
    }

    /// Connections accepted since start.
    pub fn accepted(&self) -> usize {
        self.shared.lock().unwrap().accepted
    }

    /// Commands processed since start, handshake included.
    pub fn commands(&self) -> usize {
        self.shared.lock().unwrap().commands
    }

    pub fn client_names(&self) -> Vec<String> {
        self.shared.lock().unwrap().client_names.clone()
    }

    pub fn selected_dbs(&self) -> Vec<i64> {
        self.shared.lock().unwrap().selected_dbs.clone()
    }

    /// Raw value stored under `key`, bypassing the protocol.
    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.shared.lock().unwrap().get(key)
    }

    /// Number of clients subscribed to anything.
    pub fn subscribed_clients(&self) -> usize {
        self.shared
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|(channels, patterns)| !channels.is_empty() || !patterns.is_empty())
            .count()
    }
}

/// Wait until `server` reports at least `n` subscribed clients.
pub async fn wait_for_subscribers(server: &TestServer, n: usize) {
    for _ in 0..200 {
        if server.subscribed_clients() >= n {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscribers never showed up");
}

async fn accept(
    listener: TcpListener,
    shared: Arc<Mutex<Shared>>,
    signals: broadcast::Sender<Signal>,
    messages: broadcast::Sender<(String, Bytes)>,
    password: Option<String>,
) {
    static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);
    let mut stop = signals.subscribe();

    loop {
        let socket = tokio::select! {
            res = listener.accept() => match res {
                Ok((socket, _)) => socket,
                Err(_) => return,
            },
            sig = stop.recv() => match sig {
                Ok(Signal::DropClients) => continue,
                _ => return,
            },
        };

        {
            let mut shared = shared.lock().unwrap();
            shared.accepted += 1;
            shared.active += 1;
        }

        let mut handler = Handler {
            id: NEXT_CLIENT.fetch_add(1, Ordering::Relaxed),
            stream: socket,
            buffer: BytesMut::with_capacity(4096),
            out: BytesMut::new(),
            shared: shared.clone(),
            authed: password.is_none(),
            password: password.clone(),
            multi: None,
            dirty: false,
            watched: HashMap::new(),
            channels: HashSet::new(),
            patterns: HashSet::new(),
            publisher: messages.clone(),
            messages: messages.subscribe(),
            signals: signals.subscribe(),
        };

        tokio::spawn(async move {
            let _ = handler.run().await;
            let mut shared = handler.shared.lock().unwrap();
            shared.subscriptions.remove(&handler.id);
            shared.active -= 1;
        });
    }
}

struct Handler {
    id: u64,
    stream: TcpStream,
    buffer: BytesMut,
    out: BytesMut,
    shared: Arc<Mutex<Shared>>,
    password: Option<String>,
    authed: bool,
    multi: Option<Vec<Vec<Bytes>>>,
    dirty: bool,
    watched: HashMap<String, u64>,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    publisher: broadcast::Sender<(String, Bytes)>,
    messages: broadcast::Receiver<(String, Bytes)>,
    signals: broadcast::Receiver<Signal>,
}

/// What the handler loop should do after a command.
enum Next {
    Continue,
    Close,
}

impl Handler {
    async fn run(&mut self) -> std::io::Result<()> {
        loop {
            while let Some(args) = self.parse_command()? {
                self.shared.lock().unwrap().commands += 1;
                let next = self.dispatch(args).await;
                self.stream.write_all(&self.out).await?;
                self.out.clear();
                if let Next::Close = next {
                    return Ok(());
                }
            }

            let subscribed = !self.channels.is_empty() || !self.patterns.is_empty();
            tokio::select! {
                res = self.stream.read_buf(&mut self.buffer) => {
                    if res? == 0 {
                        return Ok(());
                    }
                }
                msg = self.messages.recv(), if subscribed => {
                    if let Ok((channel, content)) = msg {
                        self.deliver(&channel, content);
                        self.stream.write_all(&self.out).await?;
                        self.out.clear();
                    }
                }
                _ = self.signals.recv() => return Ok(()),
            }
        }
    }

    fn parse_command(&mut self) -> std::io::Result<Option<Vec<Bytes>>> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut cursor) {
            Ok(()) => {
                let len = cursor.position() as usize;
                cursor.set_position(0);
                let frame = Frame::parse(&mut cursor).map_err(invalid)?;
                self.buffer.advance(len);

                match frame {
                    Frame::Array(parts) => parts
                        .into_iter()
                        .map(|part| match part {
                            Frame::Bulk(arg) => Ok(arg),
                            other => Err(invalid(format!("expected bulk, got {:?}", other))),
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map(Some),
                    other => Err(invalid(format!("expected array, got {:?}", other))),
                }
            }
            Err(my_mini_redis_client::frame::Error::Incomplete) => Ok(None),
            Err(err) => Err(invalid(err)),
        }
    }

    fn deliver(&mut self, channel: &str, content: Bytes) {
        if self.channels.contains(channel) {
            self.reply(Frame::Array(vec![bulk("message"), bulk(channel), Frame::Bulk(content.clone())]));
        }
        let matching: Vec<String> = self
            .patterns
            .iter()
            .filter(|p| glob_match(p.as_bytes(), channel.as_bytes()))
            .cloned()
            .collect();
        for pattern in matching {
            self.reply(Frame::Array(vec![
                bulk("pmessage"),
                bulk(&pattern),
                bulk(channel),
                Frame::Bulk(content.clone()),
            ]));
        }
    }

    fn reply(&mut self, frame: Frame) {
        encode(&frame, &mut self.out);
    }

    fn error(&mut self, msg: &str) {
        self.reply(Frame::Error(msg.to_string()));
    }

    async fn dispatch(&mut self, args: Vec<Bytes>) -> Next {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        if !self.authed && name != "AUTH" {
            self.error("NOAUTH Authentication required.");
            return Next::Continue;
        }

        let subscribed = !self.channels.is_empty() || !self.patterns.is_empty();
        if subscribed
            && !matches!(
                name.as_str(),
                "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "PING" | "QUIT"
            )
        {
            self.error(&format!(
                "ERR Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
                name.to_lowercase()
            ));
            return Next::Continue;
        }

        if self.multi.is_some() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
            if arity_ok(&name, args.len()) {
                if let Some(queue) = self.multi.as_mut() {
                    queue.push(args);
                }
                self.reply(Frame::Simple("QUEUED".into()));
            } else {
                self.dirty = true;
                self.error(&format!("ERR unknown command or wrong number of arguments for '{}'", name.to_lowercase()));
            }
            return Next::Continue;
        }

        match name.as_str() {
            "AUTH" => {
                let given = args.last().map(|pw| String::from_utf8_lossy(pw).to_string());
                if args.len() >= 2 && given == self.password {
                    self.authed = true;
                    self.reply(ok());
                } else {
                    self.error("WRONGPASS invalid username-password pair or user is disabled.");
                }
            }
            "QUIT" => {
                self.reply(ok());
                return Next::Close;
            }
            "PING" if subscribed => {
                let payload = args.get(1).cloned().unwrap_or_default();
                self.reply(Frame::Array(vec![bulk("pong"), Frame::Bulk(payload)]));
            }
            "MULTI" => {
                if self.multi.is_some() {
                    self.error("ERR MULTI calls can not be nested");
                } else {
                    self.multi = Some(vec![]);
                    self.dirty = false;
                    self.reply(ok());
                }
            }
            "EXEC" => self.exec(),
            "DISCARD" => {
                if self.multi.take().is_some() {
                    self.watched.clear();
                    self.dirty = false;
                    self.reply(ok());
                } else {
                    self.error("ERR DISCARD without MULTI");
                }
            }
            "WATCH" => {
                if self.multi.is_some() {
                    self.error("ERR WATCH inside MULTI is not allowed");
                } else {
                    let shared = self.shared.lock().unwrap();
                    for key in &args[1..] {
                        let key = String::from_utf8_lossy(key).to_string();
                        let version = shared.version(&key);
                        self.watched.insert(key, version);
                    }
                    drop(shared);
                    self.reply(ok());
                }
            }
            "UNWATCH" => {
                self.watched.clear();
                self.reply(ok());
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let pattern = name == "PSUBSCRIBE";
                for arg in &args[1..] {
                    let target = String::from_utf8_lossy(arg).to_string();
                    let fresh = self.count() == 0;
                    if pattern {
                        self.patterns.insert(target.clone());
                    } else {
                        self.channels.insert(target.clone());
                    }
                    self.register(fresh);
                    let kind = if pattern { "psubscribe" } else { "subscribe" };
                    let count = self.count();
                    self.reply(Frame::Array(vec![bulk(kind), bulk(&target), Frame::Integer(count)]));
                }
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                let pattern = name == "PUNSUBSCRIBE";
                let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
                let mut targets: Vec<String> = args[1..]
                    .iter()
                    .map(|arg| String::from_utf8_lossy(arg).to_string())
                    .collect();
                if targets.is_empty() {
                    let current = if pattern { &self.patterns } else { &self.channels };
                    targets = current.iter().cloned().collect();
                    targets.sort();
                }
                if targets.is_empty() {
                    let count = self.count();
                    self.reply(Frame::Array(vec![bulk(kind), Frame::Null, Frame::Integer(count)]));
                }
                for target in targets {
                    if pattern {
                        self.patterns.remove(&target);
                    } else {
                        self.channels.remove(&target);
                    }
                    self.register(false);
                    let count = self.count();
                    self.reply(Frame::Array(vec![bulk(kind), bulk(&target), Frame::Integer(count)]));
                }
            }
            "DEBUG" if args.len() == 3 && args[1].eq_ignore_ascii_case(b"SLEEP") => {
                let ms = String::from_utf8_lossy(&args[2]).parse::<u64>().unwrap_or(0);
                time::sleep(Duration::from_millis(ms)).await;
                self.reply(ok());
            }
            _ => {
                let frame = self.apply(&name, &args);
                self.reply(frame);
            }
        }
        Next::Continue
    }

    fn exec(&mut self) {
        let queue = match self.multi.take() {
            Some(queue) => queue,
            None => {
                self.error("ERR EXEC without MULTI");
                return;
            }
        };
        let watched = std::mem::take(&mut self.watched);

        if std::mem::take(&mut self.dirty) {
            self.error("EXECABORT Transaction discarded because of previous errors.");
            return;
        }

        let conflict = {
            let shared = self.shared.lock().unwrap();
            watched.iter().any(|(key, version)| shared.version(key) != *version)
        };
        if conflict {
            self.reply(Frame::NullArray);
            return;
        }

        let replies = queue
            .iter()
            .map(|args| {
                let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
                self.apply(&name, args)
            })
            .collect();
        self.reply(Frame::Array(replies));
    }

    /// Data commands, valid both inline and inside EXEC.
    fn apply(&mut self, name: &str, args: &[Bytes]) -> Frame {
        if !arity_ok(name, args.len()) {
            return Frame::Error(format!(
                "ERR unknown command or wrong number of arguments for '{}'",
                name.to_lowercase()
            ));
        }

        let key = || String::from_utf8_lossy(&args[1]).to_string();
        let mut shared = self.shared.lock().unwrap();

        match name {
            "PING" => match args.get(1) {
                Some(msg) => Frame::Bulk(msg.clone()),
                None => Frame::Simple("PONG".into()),
            },
            "ECHO" => Frame::Bulk(args[1].clone()),
            "SELECT" => {
                let db = String::from_utf8_lossy(&args[1]).parse::<i64>().unwrap_or(-1);
                shared.selected_dbs.push(db);
                ok()
            }
            "CLIENT" if args[1].eq_ignore_ascii_case(b"SETNAME") && args.len() == 3 => {
                let name = String::from_utf8_lossy(&args[2]).to_string();
                shared.client_names.push(name);
                ok()
            }
            "GET" => match shared.get(&key()) {
                Some(value) => Frame::Bulk(value),
                None => Frame::Null,
            },
            "SET" => {
                let expires_at = match args.get(3) {
                    Some(opt) if opt.eq_ignore_ascii_case(b"PX") => {
                        let ms = args
                            .get(4)
                            .and_then(|ms| String::from_utf8_lossy(ms).parse::<u64>().ok());
                        match ms {
                            Some(ms) => Some(Instant::now() + Duration::from_millis(ms)),
                            None => return Frame::Error("ERR syntax error".into()),
                        }
                    }
                    Some(_) => return Frame::Error("ERR syntax error".into()),
                    None => None,
                };
                shared.set(&key(), args[2].clone(), expires_at);
                ok()
            }
            "INCR" => {
                let key = key();
                let current = match shared.get(&key) {
                    Some(value) => match String::from_utf8_lossy(&value).parse::<i64>() {
                        Ok(n) => n,
                        Err(_) => return Frame::Error("ERR value is not an integer or out of range".into()),
                    },
                    None => 0,
                };
                let next = current + 1;
                shared.set(&key, Bytes::from(next.to_string()), None);
                Frame::Integer(next)
            }
            "DEL" => {
                let mut removed = 0;
                for key in &args[1..] {
                    let key = String::from_utf8_lossy(key).to_string();
                    if shared.entries.remove(&key).is_some() {
                        removed += 1;
                    }
                    shared.touch(&key);
                }
                Frame::Integer(removed)
            }
            "PUBLISH" => {
                let channel = key();
                let receivers = shared.receivers(&channel);
                let _ = self.publisher.send((channel, args[2].clone()));
                Frame::Integer(receivers)
            }
            other => Frame::Error(format!("ERR unknown command '{}'", other.to_lowercase())),
        }
    }

    fn count(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }

    /// Publish the subscription set. `fresh` skips messages published
    /// before this client subscribed to anything.
    fn register(&mut self, fresh: bool) {
        // 与 PUBLISH 在同一把锁下，保证计数与投递一致
        let mut shared = self.shared.lock().unwrap();
        if fresh {
            self.messages = self.messages.resubscribe();
        }
        shared
            .subscriptions
            .insert(self.id, (self.channels.clone(), self.patterns.clone()));
    }
}

fn arity_ok(name: &str, argc: usize) -> bool {
    match name {
        "PING" => argc <= 2,
        "ECHO" | "GET" | "INCR" | "SELECT" => argc == 2,
        "SET" => argc == 3 || argc == 5,
        "DEL" => argc >= 2,
        "PUBLISH" => argc == 3,
        "CLIENT" => argc >= 2,
        _ => false,
    }
}

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn invalid(err: impl ToString) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

/// `*` matches any run of bytes, `?` any single byte.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Reply encoding, the server side mirror of the client's decoder.
pub fn encode(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Simple(s) => {
            dst.put_u8(b'+');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Error(s) => {
            dst.put_u8(b'-');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Integer(n) => {
            dst.put_slice(format!(":{}\r\n", n).as_bytes());
        }
        Frame::Bulk(data) => {
            dst.put_slice(format!("${}\r\n", data.len()).as_bytes());
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
        Frame::Null => dst.put_slice(b"$-1\r\n"),
        Frame::NullArray => dst.put_slice(b"*-1\r\n"),
        Frame::Array(items) => {
            dst.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode(item, dst);
            }
        }
    }
}

/// A raw TCP peer that answers with canned bytes, for exercising replies a
/// well behaved server never sends.
pub async fn scripted_server(replies: Vec<&'static [u8]>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0; 4096];
        for reply in replies {
            // 每读到一次请求就回复一段
            if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                return;
            }
            socket.write_all(reply).await.unwrap();
        }
        // 保持连接直到对端关闭
        let _ = socket.read(&mut buf).await;
    });

    addr
}

/// A raw TCP peer that answers the first request with `reply` and then
/// hangs up, for failures that strike halfway through a batch.
pub async fn closing_server(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0; 4096];
        if socket.read(&mut buf).await.unwrap_or(0) == 0 {
            return;
        }
        socket.write_all(reply).await.unwrap();
        // 回复后立即关闭
        let _ = socket.shutdown().await;
    });

    addr
}

/// A raw TCP peer that accepts every connection and never writes a byte.
pub async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = vec![];
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    addr
}
