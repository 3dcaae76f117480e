use tokio::sync::broadcast;
use tracing::{info, warn};

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,

    /// SIGINT - Ctrl+C
    Interrupt,

    /// 手动触发（API / 测试）
    Manual,
}

/// 信号处理器
///
/// 可克隆，克隆体共享同一个广播通道，任意一处 `trigger_shutdown` 都会唤醒所有订阅者。
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl SignalHandler {
    pub fn new() -> (Self, broadcast::Receiver<ShutdownSignal>) {
        let (tx, rx) = broadcast::channel(16);
        (Self { shutdown_tx: tx }, rx)
    }

    /// 等待手动触发的关闭信号
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let mut rx = self.shutdown_tx.subscribe();
        rx.recv().await.unwrap_or(ShutdownSignal::Manual)
    }

    /// 同时等待系统信号和手动触发，先到者生效并广播给所有订阅者
    pub async fn wait_for_any(&self) -> ShutdownSignal {
        let mut manual = self.shutdown_tx.subscribe();

        tokio::select! {
            signal = Self::system_signal() => {
                let _ = self.shutdown_tx.send(signal);
                signal
            }
            signal = manual.recv() => signal.unwrap_or(ShutdownSignal::Manual),
        }
    }

    #[cfg(unix)]
    async fn system_signal() -> ShutdownSignal {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}, manual shutdown only", e);
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                ShutdownSignal::Term
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                ShutdownSignal::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    async fn system_signal() -> ShutdownSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}, manual shutdown only", e);
            return std::future::pending().await;
        }
        info!("Received Ctrl+C");
        ShutdownSignal::Interrupt
    }

    /// 手动触发关闭
    pub fn trigger_shutdown(&self) {
        info!("Manual shutdown triggered");
        let _ = self.shutdown_tx.send(ShutdownSignal::Manual);
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new().0
    }
}
