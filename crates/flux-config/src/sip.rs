use serde::{Deserialize, Serialize};

/// GB28181 信令配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipConfig {
    /// 关闭时 INVITE 直接返回 skipped
    pub enabled: bool,
    pub auto_register_unknown_device: bool,
    /// 对外宣告地址，0.0.0.0 时退回 media_ip
    pub local_ip: String,
    pub bind_ip: String,
    pub local_port: u16,
    pub media_ip: String,
    pub server_id: String,
    pub domain: String,
    pub user_agent: String,
    pub invite_timeout_ms: u64,
    pub ssrc_prefix: String,
    /// 超过 last_seen + expires 未收到注册/心跳则置离线
    pub device_expires_secs: u64,
    pub enable_tcp: bool,
}

impl SipConfig {
    pub fn announce_ip(&self) -> &str {
        if self.local_ip.trim().is_empty() || self.local_ip == "0.0.0.0" {
            &self.media_ip
        } else {
            &self.local_ip
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_register_unknown_device: true,
            local_ip: "0.0.0.0".to_string(),
            bind_ip: "0.0.0.0".to_string(),
            local_port: 5060,
            media_ip: "127.0.0.1".to_string(),
            server_id: "34020000002000000001".to_string(),
            domain: "3402000000".to_string(),
            user_agent: "flux-gb28181".to_string(),
            invite_timeout_ms: 8000,
            ssrc_prefix: "0".to_string(),
            device_expires_secs: 3600,
            enable_tcp: true,
        }
    }
}

/// 预置设备
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSeed {
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    pub ip: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default = "default_codec")]
    pub preferred_codec: String,
    #[serde(default)]
    pub channels: Vec<ChannelSeed>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSeed {
    pub channel_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub codec: Option<String>,
}

fn default_device_port() -> u16 {
    5060
}

fn default_transport() -> String {
    "UDP".to_string()
}

fn default_codec() -> String {
    "H264".to_string()
}
