use crate::cmd::Command;

use bytes::Bytes;

/// 向指定channel中发送一条信息
///
/// 向频道发送信息，而无需了解每个消费者的情况 消费者可以订阅频道，以便接收信息。
///
///  通道名称与key-value的map无关。在名为 “foo”的频道上发布与设置 “foo” 键没有任何关系。
#[derive(Debug)]
pub struct Publish {
    /// 应发布信息的频道名称。
    channel: String,

    /// 要发布的信息。
    message: Bytes,
}

impl Publish {
    /// 创建一个新的在 `channel` 上发送 `message`的 `Publish` 命令。
    pub fn new(channel: impl ToString, message: Bytes) -> Publish {
        Publish {
            channel: channel.to_string(),
            message,
        }
    }

    /// 将命令转换为待发送的Command
    ///
    /// ```text
    /// PUBLISH channel message
    /// ```
    pub fn into_command(self) -> Command {
        Command::new("PUBLISH").arg(self.channel).bulk(self.message)
    }
}
