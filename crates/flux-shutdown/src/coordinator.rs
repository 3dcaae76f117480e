use crate::resource::ResourceManager;
use crate::signal::{ShutdownSignal, SignalHandler};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

/// 关闭结果
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub signal: ShutdownSignal,
    pub elapsed: Duration,
    pub failed_resources: Vec<String>,
    pub timed_out: bool,
}

/// 关闭协调器
pub struct ShutdownCoordinator {
    signal_handler: SignalHandler,
    resource_manager: Option<ResourceManager>,
    cleanup_timeout: Duration,
    listen_system_signals: bool,
}

impl ShutdownCoordinator {
    pub fn builder() -> ShutdownCoordinatorBuilder {
        ShutdownCoordinatorBuilder::new()
    }

    /// 等待信号并执行资源清理
    pub async fn run(mut self) -> ShutdownReport {
        info!("Shutdown coordinator started, waiting for signal...");

        let signal = if self.listen_system_signals {
            self.signal_handler.wait_for_any().await
        } else {
            self.signal_handler.wait_for_signal().await
        };
        info!("Received shutdown signal: {:?}", signal);

        let start = Instant::now();
        let mut failed_resources = Vec::new();
        let mut timed_out = false;

        if let Some(manager) = &mut self.resource_manager {
            match timeout(self.cleanup_timeout, manager.cleanup_all()).await {
                Ok(failed) => failed_resources = failed,
                Err(_) => {
                    warn!("Resource cleanup timed out after {:?}", self.cleanup_timeout);
                    timed_out = true;
                }
            }
        }

        let elapsed = start.elapsed();
        info!("Graceful shutdown complete in {:?}", elapsed);

        ShutdownReport {
            signal,
            elapsed,
            failed_resources,
            timed_out,
        }
    }

    pub fn signal_handler(&self) -> &SignalHandler {
        &self.signal_handler
    }
}

/// 关闭协调器构建器
pub struct ShutdownCoordinatorBuilder {
    signal_handler: Option<SignalHandler>,
    resource_manager: Option<ResourceManager>,
    cleanup_timeout: Duration,
    listen_system_signals: bool,
}

impl ShutdownCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            signal_handler: None,
            resource_manager: None,
            cleanup_timeout: Duration::from_secs(30),
            listen_system_signals: true,
        }
    }

    pub fn with_signal_handler(mut self, handler: SignalHandler) -> Self {
        self.signal_handler = Some(handler);
        self
    }

    pub fn with_resource_manager(mut self, manager: ResourceManager) -> Self {
        self.resource_manager = Some(manager);
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// 关闭后只响应手动触发
    pub fn manual_only(mut self) -> Self {
        self.listen_system_signals = false;
        self
    }

    pub fn build(self) -> ShutdownCoordinator {
        ShutdownCoordinator {
            signal_handler: self.signal_handler.unwrap_or_default(),
            resource_manager: self.resource_manager,
            cleanup_timeout: self.cleanup_timeout,
            listen_system_signals: self.listen_system_signals,
        }
    }
}

impl Default for ShutdownCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagResource {
        cleaned: Arc<AtomicBool>,
        delay: Duration,
    }

    #[async_trait]
    impl Resource for FlagResource {
        async fn cleanup(&self) -> Result<(), ResourceError> {
            tokio::time::sleep(self.delay).await;
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "flag"
        }
    }

    #[tokio::test]
    async fn test_manual_shutdown_runs_cleanup() {
        let (handler, _rx) = SignalHandler::new();
        let trigger = handler.clone();
        let cleaned = Arc::new(AtomicBool::new(false));

        let mut manager = ResourceManager::new();
        manager.register(Arc::new(FlagResource {
            cleaned: cleaned.clone(),
            delay: Duration::ZERO,
        }));

        let coordinator = ShutdownCoordinator::builder()
            .with_signal_handler(handler)
            .with_resource_manager(manager)
            .manual_only()
            .build();

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger_shutdown();

        let report = task.await.unwrap();
        assert_eq!(report.signal, ShutdownSignal::Manual);
        assert!(!report.timed_out);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_timeout() {
        let (handler, _rx) = SignalHandler::new();
        let trigger = handler.clone();
        let cleaned = Arc::new(AtomicBool::new(false));

        let mut manager = ResourceManager::new();
        manager.register(Arc::new(FlagResource {
            cleaned: cleaned.clone(),
            delay: Duration::from_secs(5),
        }));

        let coordinator = ShutdownCoordinator::builder()
            .with_signal_handler(handler)
            .with_resource_manager(manager)
            .with_cleanup_timeout(Duration::from_millis(50))
            .manual_only()
            .build();

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger_shutdown();

        let report = task.await.unwrap();
        assert!(report.timed_out);
        assert!(!cleaned.load(Ordering::SeqCst));
    }
}
