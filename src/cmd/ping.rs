use crate::cmd::Command;
use crate::Frame;

use bytes::Bytes;

/// 如果没有提供参数，则返回 PONG，否则返回参数bulk类型的副本
///
/// 该命令通常用于测试连接是否仍然有效，或测量延迟。连接池在借出空闲过久的连接前
/// 也用它做健康检查
#[derive(Debug, Default)]
pub struct Ping {
    /// 一个可选的msg被返回
    msg: Option<Bytes>,
}

impl Ping {
    /// 创建一个带有optional msg的Ping command
    pub fn new(msg: Option<Bytes>) -> Ping {
        Ping { msg }
    }

    /// 将命令转换为待发送的Command
    ///
    /// ```text
    /// PING [message]
    /// ```
    pub fn into_command(self) -> Command {
        let cmd = Command::new("PING");
        match self.msg {
            Some(msg) => cmd.bulk(msg),
            None => cmd,
        }
    }

    /// Whether `reply` is a valid answer to a PING carrying `msg`.
    pub(crate) fn is_pong(msg: Option<&Bytes>, reply: &Frame) -> bool {
        match (msg, reply) {
            (None, Frame::Simple(s)) => s.eq_ignore_ascii_case("PONG"),
            (Some(msg), Frame::Bulk(echo)) => echo == msg,
            _ => false,
        }
    }
}
