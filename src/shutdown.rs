use std::future::Future;
use std::pin::Pin;

/// 监听订阅循环的关闭信号
///
/// 信号是调用者传入的任意 future，完成即代表应当退出。
///
/// `Shutdown` 结构监听信号，并跟踪信号是否已收到。
/// 调用者可以查询是否已收到关闭信号。
pub(crate) struct Shutdown {
    /// `true` 如果关闭信号已经被收到
    is_shutdown: bool,

    /// 关闭信号
    notify: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Shutdown {
    /// 使用所传入的 future 创建一个新的 `Shutdown` 对象
    pub(crate) fn new(notify: impl Future<Output = ()> + Send + 'static) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify: Box::pin(notify),
        }
    }

    /// 永远不会触发的信号
    pub(crate) fn never() -> Shutdown {
        Shutdown::new(std::future::pending())
    }

    /// 返回 `true` 如果关闭信号被接收
    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// 接收关闭信号，如果有必要等待的话
    ///
    /// 可以安全地在 `select!` 中反复调用
    pub(crate) async fn recv(&mut self) {
        // 如果关闭信号已经被接收，直接返回
        if self.is_shutdown {
            return;
        }

        (&mut self.notify).await;

        // 记录关闭信号被接收
        self.is_shutdown = true;
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("is_shutdown", &self.is_shutdown)
            .finish()
    }
}
