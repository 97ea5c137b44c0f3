use crate::cmd::Command;

use bytes::Bytes;
use std::time::Duration;

/// Set `key` to hold the string `value`.
///
/// If `key` already holds a value, it is overwritten, regardless of its type.
/// Any previous time to live associated with the key is discarded on successful
/// SET operation.
///
/// # Options
///
/// Currently, the following options are supported:
///
/// * PX `milliseconds` -- Set the specified expire time, in milliseconds.
#[derive(Debug)]
pub struct Set {
    key: String,

    value: Bytes,

    expire: Option<Duration>,
}

impl Set {
    /// Create a new `Set` command which sets `key` to `value`.
    ///
    /// If `expire` is `Some`, the value should expire after the specified
    /// duration
    pub fn new(key: impl ToString, value: Bytes, expire: Option<Duration>) -> Set {
        Set {
            key: key.to_string(),
            value,
            expire,
        }
    }

    /// Get the key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the value
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Get the expire
    pub fn expire(&self) -> Option<Duration> {
        self.expire
    }

    /// Converts the command into an equivalent `Command`.
    ///
    /// ```text
    /// SET key value [PX milliseconds]
    /// ```
    pub fn into_command(self) -> Command {
        let mut cmd = Command::new("SET").arg(self.key).bulk(self.value);
        if let Some(ms) = self.expire {
            // 这里使用px因为这允许更高的精度
            cmd = cmd.arg("PX").int(ms.as_millis() as i64);
        }
        cmd
    }
}
