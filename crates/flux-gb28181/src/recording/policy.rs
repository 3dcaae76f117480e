use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::error::{Gb28181Error, Result};
use crate::preview::session::safe_path_segment;
use flux_config::RecordingConfig;

/// 运行期可替换的存储策略，下一次对账即生效
pub struct StoragePolicy {
    current: ArcSwap<RecordingConfig>,
}

pub type StoragePolicyRef = Arc<StoragePolicy>;

impl StoragePolicy {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    pub fn current(&self) -> Arc<RecordingConfig> {
        self.current.load_full()
    }

    pub fn record_enabled(&self) -> bool {
        self.current.load().record_enabled
    }

    pub fn update(&self, config: RecordingConfig) -> Result<Arc<RecordingConfig>> {
        if config.reconcile_interval_ms == 0 {
            return Err(Gb28181Error::validation("reconcile_interval_ms must be positive"));
        }
        if config.housekeeping_interval_secs == 0 {
            return Err(Gb28181Error::validation("housekeeping_interval_secs must be positive"));
        }

        let config = Arc::new(config);
        let previous = self.current.swap(config.clone());
        if previous.record_enabled != config.record_enabled {
            tracing::info!(
                target: "gb28181::record",
                record_enabled = config.record_enabled,
                record_path = ?config.record_path,
                "Storage policy changed"
            );
        }
        Ok(config)
    }

    /// 录像目录 <record_path>/<device>/<channel>，未配置目录时交给流媒体默认位置
    pub fn record_path_for(&self, device_id: &str, channel_id: &str) -> Option<String> {
        let config = self.current.load();
        let base = config.record_path.as_deref()?.trim().trim_end_matches(['/', '\\']);
        if base.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            base.replace('\\', "/"),
            safe_path_segment(device_id),
            safe_path_segment(channel_id)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_path() {
        let policy = StoragePolicy::new(RecordingConfig::default());
        assert!(!policy.record_enabled());
        assert_eq!(policy.record_path_for("d1", "c1"), None);

        policy
            .update(RecordingConfig {
                record_enabled: true,
                record_path: Some("/data/record/".to_string()),
                ..RecordingConfig::default()
            })
            .unwrap();
        assert!(policy.record_enabled());
        assert_eq!(
            policy.record_path_for("d1", "c:1").as_deref(),
            Some("/data/record/d1/c_1")
        );
    }

    #[test]
    fn test_update_rejects_zero_interval() {
        let policy = StoragePolicy::new(RecordingConfig::default());
        let err = policy
            .update(RecordingConfig {
                reconcile_interval_ms: 0,
                ..RecordingConfig::default()
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(policy.current().reconcile_interval_ms, 15000);
    }
}
