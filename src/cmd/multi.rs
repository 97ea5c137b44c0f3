//! Transaction control commands.

use crate::cmd::Command;

/// Start queuing commands on the server.
#[derive(Debug, Default)]
pub struct Multi;

impl Multi {
    pub fn into_command(self) -> Command {
        Command::new("MULTI")
    }
}

/// Run every command queued since `MULTI` atomically.
#[derive(Debug, Default)]
pub struct Exec;

impl Exec {
    pub fn into_command(self) -> Command {
        Command::new("EXEC")
    }
}

/// Drop every command queued since `MULTI`.
#[derive(Debug, Default)]
pub struct Discard;

impl Discard {
    pub fn into_command(self) -> Command {
        Command::new("DISCARD")
    }
}

/// Make the next `EXEC` conditional on `keys` not changing.
#[derive(Debug)]
pub struct Watch {
    keys: Vec<String>,
}

impl Watch {
    pub fn new(keys: &[String]) -> Watch {
        Watch {
            keys: keys.to_vec(),
        }
    }

    pub fn into_command(self) -> Command {
        Command::new("WATCH").args(self.keys)
    }
}

/// Forget every watched key.
#[derive(Debug, Default)]
pub struct Unwatch;

impl Unwatch {
    pub fn into_command(self) -> Command {
        Command::new("UNWATCH")
    }
}
