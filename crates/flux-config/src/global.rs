use serde::{Deserialize, Serialize};

use crate::{DeviceSeed, MediaConfig, PreviewConfig, RecordingConfig, SipConfig};

/// 全局配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub system: SystemConfig,
    pub log: LogConfig,
    pub http: HttpConfig,
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub preview: PreviewConfig,
    pub recording: RecordingConfig,
    pub devices: Vec<DeviceSeed>,
}

/// 系统配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "flux-gb28181".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// 日志配置，RUST_LOG 优先
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 控制 API 监听
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:18080".to_string(),
        }
    }
}
