use serde::{Deserialize, Serialize};

/// ZLMediaKit 网关配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    pub base_url: String,
    /// 播放地址使用的外部地址，未配置时使用 base_url
    pub public_base_url: Option<String>,
    pub secret: String,
    pub default_app: String,
    pub request_timeout_ms: u64,
}

impl MediaConfig {
    pub fn public_base(&self) -> &str {
        match self.public_base_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url,
            _ => &self.base_url,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            public_base_url: None,
            secret: "123456".to_string(),
            default_app: "rtp".to_string(),
            request_timeout_ms: 3000,
        }
    }
}

/// 预览编码策略
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// 请求方未声明 H.265 能力时仍允许直连播放
    pub allow_h265_direct_play: bool,
    pub enable_h265_transcode_fallback: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            allow_h265_direct_play: true,
            enable_h265_transcode_fallback: false,
        }
    }
}
