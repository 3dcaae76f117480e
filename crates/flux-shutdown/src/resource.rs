use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),
}

/// 资源接口
#[async_trait]
pub trait Resource: Send + Sync {
    /// 清理资源
    async fn cleanup(&self) -> Result<(), ResourceError>;

    /// 资源名称
    fn name(&self) -> &str;

    /// 清理优先级（数字越小越先清理）
    fn priority(&self) -> u32 {
        100
    }
}

/// 资源管理器
#[derive(Default)]
pub struct ResourceManager {
    resources: Vec<Arc<dyn Resource>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册资源
    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        info!("Registering resource: {}", resource.name());
        self.resources.push(resource);
    }

    /// 按优先级清理所有资源，单个失败不影响后续资源，返回失败的资源名
    pub async fn cleanup_all(&mut self) -> Vec<String> {
        self.resources.sort_by_key(|r| r.priority());

        info!("Cleaning up {} resources", self.resources.len());

        let mut failed = Vec::new();
        for resource in &self.resources {
            match resource.cleanup().await {
                Ok(()) => info!("Cleaned up: {}", resource.name()),
                Err(e) => {
                    error!("Failed to cleanup {}: {}", resource.name(), e);
                    failed.push(resource.name().to_string());
                }
            }
        }

        failed
    }

    pub fn count(&self) -> usize {
        self.resources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TestResource {
        name: String,
        priority: u32,
        should_fail: bool,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Resource for TestResource {
        async fn cleanup(&self) -> Result<(), ResourceError> {
            self.order.lock().unwrap().push(self.name.clone());
            if self.should_fail {
                Err(ResourceError::CleanupFailed("Test failure".to_string()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }
    }

    fn resource(
        name: &str,
        priority: u32,
        should_fail: bool,
        order: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<TestResource> {
        Arc::new(TestResource {
            name: name.to_string(),
            priority,
            should_fail,
            order: order.clone(),
        })
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ResourceManager::new();

        manager.register(resource("sip", 90, false, &order));
        manager.register(resource("preview", 10, false, &order));
        manager.register(resource("playback", 20, false, &order));
        assert_eq!(manager.count(), 3);

        let failed = manager.cleanup_all().await;
        assert!(failed.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["preview", "playback", "sip"]);
    }

    #[tokio::test]
    async fn test_cleanup_continues_after_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ResourceManager::new();

        manager.register(resource("failing", 1, true, &order));
        manager.register(resource("next", 2, false, &order));

        let failed = manager.cleanup_all().await;
        assert_eq!(failed, vec!["failing".to_string()]);
        assert_eq!(order.lock().unwrap().len(), 2);
    }
}
