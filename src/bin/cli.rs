use my_mini_redis_client::{cmd, Client, Config, Frame, Message, DEFAULT_PORT};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::num::ParseIntError;
use std::str;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "my-mini-redis-cli",
    version,
    author,
    about = "Issue Redis commands"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[clap(name = "hostname", long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// 连接串，例如 redis://:password@host:6379/0，多个地址用逗号分隔。
    /// 设置后忽略 --hostname 和 --port
    #[clap(long)]
    url: Option<String>,

    /// 读超时，单位毫秒
    #[clap(long, value_parser = duration_from_ms_str)]
    read_timeout: Option<Duration>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping {
        /// ping的msg
        #[clap(value_parser = bytes_from_str)]
        msg: Option<Bytes>,
    },
    /// 获得key对应value
    Get {
        /// get所需key
        key: String,
    },
    /// 设置key-value对
    Set {
        /// key的名称
        key: String,

        /// value
        #[clap(value_parser = bytes_from_str)]
        value: Bytes,

        /// 过期时间
        #[clap(value_parser = duration_from_ms_str)]
        expires: Option<Duration>,
    },
    /// 将key对应的整数加一
    Incr {
        key: String,
    },
    /// 向指定channel发送信息
    Publish {
        /// channel的名字
        channel: String,

        #[clap(value_parser = bytes_from_str)]
        /// 发布的信息
        message: Bytes,
    },
    /// 一个客户端订阅channels
    Subscribe {
        /// 指定channels
        channels: Vec<String>,

        /// 按glob pattern订阅
        #[clap(long)]
        pattern: bool,
    },
    /// 原样发送任意命令，例如 `raw LPUSH list a b`
    Raw {
        args: Vec<String>,
    },
}

/// 注解"[tokio::main]"表示在调用函数时应启动 Tokio 运行时。
/// 函数的主体将在新生成的运行时中执行。
///
/// 这里使用 `flavor = "current_thread"` 来避免产生后台线程。
/// CLI 工具的用例更受益于轻量级的多线程。
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // 记录日志，级别由 RUST_LOG 控制
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()?;

    // 解析命令行参数
    let cli = Cli::parse();

    // 获得远程连接的地址
    let url = cli
        .url
        .unwrap_or_else(|| format!("{}:{}", cli.host, cli.port));
    let mut config = Config::from_url(&url)?.with_client_name("my-mini-redis-cli");
    config.timeouts.read = cli.read_timeout;

    // 建立连接
    let client = Client::connect(config).await?;

    match cli.command {
        Command::Ping { msg } => {
            let value = client.ping(msg).await?;
            print_bytes(&value);
        }
        Command::Get { key } => {
            if let Some(value) = client.get(&key).await? {
                print_bytes(&value);
            } else {
                println!("(nil)");
            }
        }
        Command::Set {
            key,
            value,
            expires: None,
        } => {
            client.set(&key, value).await?;
            println!("OK");
        }
        Command::Set {
            key,
            value,
            expires: Some(expire),
        } => {
            client.set_expires(&key, value, expire).await?;
            println!("OK");
        }
        Command::Incr { key } => {
            println!("(integer) {}", client.incr(&key).await?);
        }
        Command::Publish { channel, message } => {
            let receivers = client.publish(&channel, message).await?;
            println!("(integer) {}", receivers);
        }
        Command::Subscribe { channels, pattern } => {
            if channels.is_empty() {
                return Err("channel(s) must be provided".into());
            }
            let subscriber = if pattern {
                client.psubscribe(&channels).await?
            } else {
                client.subscribe(&channels).await?
            };

            // Ctrl-C 时退订所有channel，循环随之结束
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            let mut print = |msg: Message| match msg.pattern {
                Some(pattern) => println!(
                    "got message from the channel: {} ({}); message = {:?}",
                    msg.channel, pattern, msg.content
                ),
                None => println!(
                    "got message from the channel: {}; message = {:?}",
                    msg.channel, msg.content
                ),
            };
            subscriber.run_until(&mut print, shutdown).await?;
        }
        Command::Raw { args } => {
            let cmd = cmd::Command::from_args(&args).ok_or("a command name must be provided")?;
            match client.execute(cmd).await {
                Ok(frame) => print_frame(&frame),
                Err(err) => println!("(error) {}", err),
            }
        }
    }
    Ok(())
}

fn print_bytes(value: &Bytes) {
    if let Ok(string) = str::from_utf8(value) {
        println!("\"{}\"", string);
    } else {
        println!("{:?}", value);
    }
}

fn print_frame(frame: &Frame) {
    println!("{}", frame);
}

fn duration_from_ms_str(src: &str) -> Result<Duration, ParseIntError> {
    let ms = src.parse::<u64>()?;
    Ok(Duration::from_millis(ms))
}

fn bytes_from_str(src: &str) -> Result<Bytes, Infallible> {
    Ok(Bytes::from(src.to_string()))
}
