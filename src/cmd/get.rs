use crate::cmd::Command;

/// 获取key对应value
///
/// 如果key不存在，特殊值nil将会被返回。一个错误被返回，如果key不是一个字符串
/// 因为GET值接收字符串
#[derive(Debug)]
pub struct Get {
    key: String,
}

impl Get {
    /// 创建一个新的Get command来持有key
    pub fn new(key: impl ToString) -> Get {
        Get {
            key: key.to_string(),
        }
    }

    /// 获得key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 将Get转换为一个待发送的Command
    ///
    /// ```text
    /// GET key
    /// ```
    pub fn into_command(self) -> Command {
        Command::new("GET").arg(self.key)
    }
}
