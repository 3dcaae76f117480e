use serde::{Deserialize, Serialize};

/// 存储策略（后台录制）
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub record_enabled: bool,
    /// 录像根目录，按 <device>/<channel> 分目录
    pub record_path: Option<String>,
    pub reconcile_interval_ms: u64,
    pub housekeeping_interval_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            record_enabled: false,
            record_path: None,
            reconcile_interval_ms: 15_000,
            housekeeping_interval_secs: 180,
        }
    }
}
