use crate::cmd::Command;

/// 客户端订阅一个或多个channel，或者一个或多个glob pattern。
///
/// 一旦客户端进入订阅状态，除了附加的 SUBSCRIBE、PSUBSCRIBE、UNSUBSCRIBE、
/// PUNSUBSCRIBE、PING 和 QUIT 命令外，它不应再发出任何其他命令。
#[derive(Debug)]
pub struct Subscribe {
    names: Vec<String>,
    pattern: bool,
}

/// 客户端退订一个或者多个channels (或patterns)
///
/// 如果没有指定名字，客户端将取消订阅所有已订阅的频道。
#[derive(Clone, Debug)]
pub struct Unsubscribe {
    names: Vec<String>,
    pattern: bool,
}

impl Subscribe {
    /// `SUBSCRIBE channel [channel ...]`
    pub fn channels(channels: Vec<String>) -> Subscribe {
        Subscribe {
            names: channels,
            pattern: false,
        }
    }

    /// `PSUBSCRIBE pattern [pattern ...]`
    pub fn patterns(patterns: Vec<String>) -> Subscribe {
        Subscribe {
            names: patterns,
            pattern: true,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern
    }

    pub fn into_command(self) -> Command {
        let name = if self.pattern { "PSUBSCRIBE" } else { "SUBSCRIBE" };
        Command::new(name).args(self.names)
    }
}

impl Unsubscribe {
    /// `UNSUBSCRIBE [channel ...]`; an empty slice means every channel.
    pub fn channels(channels: &[String]) -> Unsubscribe {
        Unsubscribe {
            names: channels.to_vec(),
            pattern: false,
        }
    }

    /// `PUNSUBSCRIBE [pattern ...]`; an empty slice means every pattern.
    pub fn patterns(patterns: &[String]) -> Unsubscribe {
        Unsubscribe {
            names: patterns.to_vec(),
            pattern: true,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern
    }

    pub fn into_command(self) -> Command {
        let name = if self.pattern { "PUNSUBSCRIBE" } else { "UNSUBSCRIBE" };
        Command::new(name).args(self.names)
    }
}
