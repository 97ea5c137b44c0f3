//! Client configuration.
//!
//! Everything a pool needs to open and lend connections: which endpoints to
//! talk to, how long each I/O step may take, how many connections to keep and
//! how to reconnect. [`Config`] is the top level value; [`PoolConfig`] and
//! [`ConnectionOptions`] are the slices of it handed to a single pool and a
//! single connection.

use crate::{Error, Result, DEFAULT_PORT};

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// A server the client can connect to.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// ACL user name sent with AUTH, if any.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database index selected after connecting.
    pub database: u32,
}

impl Endpoint {
    pub fn new(host: impl ToString, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
            username: None,
            password: None,
            database: 0,
        }
    }

    pub fn with_password(mut self, password: impl ToString) -> Endpoint {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_username(mut self, username: impl ToString) -> Endpoint {
        self.username = Some(username.to_string());
        self
    }

    pub fn with_database(mut self, database: u32) -> Endpoint {
        self.database = database;
        self
    }

    /// `host:port`, the form `TcpStream::connect` accepts.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a connection string.
    ///
    /// Accepted forms:
    ///
    /// ```text
    /// redis://[user[:password]@]host[:port][/db]
    /// host[:port]
    /// password@host[:port][?db=N]
    /// ```
    ///
    /// A lone user-info part without `:` is taken as the password. The `db`
    /// query parameter wins over the path.
    pub fn parse(src: &str) -> Result<Endpoint> {
        let src = src.trim();
        let full = if src.contains("://") {
            src.to_string()
        } else {
            format!("redis://{}", src)
        };

        let url = Url::parse(&full)
            .map_err(|err| Error::InvalidConfig(format!("`{}`: {}", src, err)))?;

        if url.scheme() != "redis" {
            return Err(Error::InvalidConfig(format!(
                "`{}`: unsupported scheme `{}`",
                src,
                url.scheme()
            )));
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(Error::InvalidConfig(format!("`{}`: missing host", src))),
        };

        let mut endpoint = Endpoint::new(host, url.port().unwrap_or(DEFAULT_PORT));

        // url 返回的用户信息仍是百分号编码，解码后再发给 AUTH
        match (url.username(), url.password()) {
            ("", Some(password)) => endpoint.password = Some(decode_user_info(src, password)?),
            (user, Some(password)) => {
                endpoint.username = Some(decode_user_info(src, user)?);
                endpoint.password = Some(decode_user_info(src, password)?);
            }
            ("", None) => {}
            (password, None) => endpoint.password = Some(decode_user_info(src, password)?),
        }

        let path = url.path().trim_matches('/');
        if !path.is_empty() {
            endpoint.database = parse_database(src, path)?;
        }
        for (key, value) in url.query_pairs() {
            if key.eq_ignore_ascii_case("db") {
                endpoint.database = parse_database(src, &value)?;
            }
        }

        Ok(endpoint)
    }
}

fn decode_user_info(src: &str, value: &str) -> Result<String> {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::InvalidConfig(format!("`{}`: user info is not valid UTF-8", src)))
}

fn parse_database(src: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| Error::InvalidConfig(format!("`{}`: invalid database index `{}`", src, value)))
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(src: &str) -> Result<Endpoint> {
        Endpoint::parse(src)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

// 日志里会打印Endpoint，不能带出密码
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

/// Independent time budgets for each blocking socket step. `None` waits
/// forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl Timeouts {
    /// Deadline for the ping an idle connection gets before it is lent out.
    /// The read timeout when set, else the connect timeout, so a silent
    /// peer can never hold a borrower forever.
    pub fn health_check(&self) -> Duration {
        self.read
            .or(self.connect)
            .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT)
    }
}

const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            connect: Some(Duration::from_secs(5)),
            read: None,
            write: None,
        }
    }
}

/// Delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base`, `2 * base`, `4 * base` ... capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// How a connection re-establishes its socket after a failed health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total connect attempts, the first one included. `0` behaves as `1`.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Randomise each delay to somewhere between half and all of it.
    pub jitter: bool,
}

impl ReconnectPolicy {
    /// Try exactly once, never wait.
    pub fn once() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: false,
        }
    }

    /// Delay to wait before retry number `retry` (1 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        };

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            delay
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(50),
                max: Duration::from_secs(2),
            },
            jitter: true,
        }
    }
}

/// Which endpoint a pool opens its next connection to.
///
/// This only matters when a pool has more than one endpoint. If connecting
/// to the chosen endpoint fails, the remaining ones are tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Cycle through the endpoint list.
    #[default]
    RoundRobin,
    /// Start from a random endpoint.
    Random,
    /// Always start from the first endpoint.
    PrimaryPreferred,
}

/// Per-connection settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub timeouts: Timeouts,
    /// Sent with `CLIENT SETNAME` after connecting.
    pub client_name: Option<String>,
    pub reconnect: ReconnectPolicy,
}

/// Settings of one [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub endpoints: Vec<Endpoint>,
    /// Upper bound on connections lent out plus idle.
    pub max_size: usize,
    /// How long `borrow` waits for a connection when the pool is full.
    pub borrow_timeout: Duration,
    /// Idle connections older than this are pinged before being lent out.
    pub idle_check_after: Duration,
    pub selection: Selection,
    pub connection: ConnectionOptions,
}

impl PoolConfig {
    pub fn new(endpoints: Vec<Endpoint>) -> PoolConfig {
        let defaults = Config::default();
        PoolConfig {
            endpoints,
            max_size: defaults.max_pool_size,
            borrow_timeout: defaults.borrow_timeout,
            idle_check_after: defaults.idle_check_after,
            selection: defaults.selection,
            connection: defaults.connection_options(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidConfig("no endpoint configured".into()));
        }
        if self.max_size == 0 {
            return Err(Error::InvalidConfig("max pool size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoints that accept writes (primaries).
    pub write_endpoints: Vec<Endpoint>,
    /// Endpoints used by read-only borrows (replicas). Empty means reads go
    /// to the write endpoints.
    pub read_endpoints: Vec<Endpoint>,
    pub client_name: Option<String>,
    /// Per pool; the read pool gets its own budget of the same size.
    pub max_pool_size: usize,
    pub borrow_timeout: Duration,
    pub timeouts: Timeouts,
    pub idle_check_after: Duration,
    pub selection: Selection,
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            write_endpoints: vec![Endpoint::new("127.0.0.1", DEFAULT_PORT)],
            read_endpoints: vec![],
            client_name: None,
            max_pool_size: 10,
            borrow_timeout: Duration::from_secs(2),
            timeouts: Timeouts::default(),
            idle_check_after: Duration::from_secs(60),
            selection: Selection::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    /// Configuration with a single write endpoint and default settings.
    pub fn new(endpoint: Endpoint) -> Config {
        Config {
            write_endpoints: vec![endpoint],
            ..Config::default()
        }
    }

    /// Parse a comma separated list of connection strings into the write
    /// endpoint list.
    ///
    /// ```text
    /// redis://:secret@10.0.0.1:6379/2,10.0.0.2:6379
    /// ```
    pub fn from_url(src: &str) -> Result<Config> {
        let endpoints = parse_endpoint_list(src)?;
        Ok(Config {
            write_endpoints: endpoints,
            ..Config::default()
        })
    }

    pub fn with_read_endpoints(mut self, endpoints: Vec<Endpoint>) -> Config {
        self.read_endpoints = endpoints;
        self
    }

    pub fn with_client_name(mut self, name: impl ToString) -> Config {
        self.client_name = Some(name.to_string());
        self
    }

    pub fn with_max_pool_size(mut self, size: usize) -> Config {
        self.max_pool_size = size;
        self
    }

    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Config {
        self.borrow_timeout = timeout;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Config {
        self.timeouts = timeouts;
        self
    }

    pub fn with_idle_check_after(mut self, after: Duration) -> Config {
        self.idle_check_after = after;
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Config {
        self.selection = selection;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Config {
        self.reconnect = reconnect;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.write_pool_config().validate()
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            timeouts: self.timeouts,
            client_name: self.client_name.clone(),
            reconnect: self.reconnect,
        }
    }

    pub(crate) fn write_pool_config(&self) -> PoolConfig {
        self.pool_config(self.write_endpoints.clone())
    }

    /// `None` when no read endpoint is configured.
    pub(crate) fn read_pool_config(&self) -> Option<PoolConfig> {
        if self.read_endpoints.is_empty() {
            None
        } else {
            Some(self.pool_config(self.read_endpoints.clone()))
        }
    }

    fn pool_config(&self, endpoints: Vec<Endpoint>) -> PoolConfig {
        PoolConfig {
            endpoints,
            max_size: self.max_pool_size,
            borrow_timeout: self.borrow_timeout,
            idle_check_after: self.idle_check_after,
            selection: self.selection,
            connection: self.connection_options(),
        }
    }
}

/// Parse `a,b,c` into endpoints.
pub fn parse_endpoint_list(src: &str) -> Result<Vec<Endpoint>> {
    let endpoints = src
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Endpoint::parse)
        .collect::<Result<Vec<_>>>()?;

    if endpoints.is_empty() {
        return Err(Error::InvalidConfig("no endpoint configured".into()));
    }
    Ok(endpoints)
}
