use crate::cmd::Command;

/// Increment the integer stored at `key` by one.
///
/// A missing key is treated as `0` before the increment.
#[derive(Debug)]
pub struct Incr {
    key: String,
}

impl Incr {
    pub fn new(key: impl ToString) -> Incr {
        Incr {
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// ```text
    /// INCR key
    /// ```
    pub fn into_command(self) -> Command {
        Command::new("INCR").arg(self.key)
    }
}
