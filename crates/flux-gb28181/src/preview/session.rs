use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::Codec;
use crate::error::{Gb28181Error, Result};
use crate::media::PlayUrls;

/// 预览播放协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreviewProtocol {
    Webrtc,
    Hls,
    HttpFlv,
}

impl PreviewProtocol {
    /// 空值默认 WEBRTC
    pub fn parse(value: Option<&str>) -> Result<Self> {
        let value = value.map(str::trim).unwrap_or_default();
        match value.to_ascii_uppercase().as_str() {
            "" | "WEBRTC" => Ok(PreviewProtocol::Webrtc),
            "HLS" => Ok(PreviewProtocol::Hls),
            "HTTP_FLV" => Ok(PreviewProtocol::HttpFlv),
            _ => Err(Gb28181Error::validation(format!(
                "unsupported preview protocol: {}",
                value
            ))),
        }
    }

    pub fn pick<'a>(&self, urls: &'a PlayUrls) -> &'a str {
        match self {
            PreviewProtocol::Webrtc => &urls.webrtc,
            PreviewProtocol::Hls => &urls.hls,
            PreviewProtocol::HttpFlv => &urls.http_flv,
        }
    }
}

/// 去重键：同一设备同一通道只有一路流
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub device_id: String,
    pub channel_id: String,
}

impl SessionKey {
    pub fn new(device_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

/// "ch" + 通道编码，去掉 [A-Za-z0-9_-] 以外的字符
pub fn stream_id_for(channel_id: &str) -> String {
    format!("ch{}", channel_id)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// 录像子目录名
pub(crate) fn safe_path_segment(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return "unknown".to_string();
    }
    value
        .chars()
        .map(|c| {
            if c.is_whitespace() || matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// 注册表中的会话
#[derive(Debug, Clone)]
pub(crate) struct PreviewSession {
    pub session_id: String,
    pub key: SessionKey,
    pub codec: Codec,
    pub app: String,
    pub stream_id: String,
    pub protocol: PreviewProtocol,
    pub urls: PlayUrls,
    pub ssrc: String,
    /// 信令关闭时为 None
    pub call_id: Option<String>,
    pub rtp_port: u16,
    pub recording: bool,
    pub viewers: u32,
    /// 后台录像占用
    pub pinned: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PreviewSession {
    pub fn view(&self, protocol: PreviewProtocol, reused: bool) -> SessionView {
        SessionView {
            session_id: self.session_id.clone(),
            device_id: self.key.device_id.clone(),
            channel_id: self.key.channel_id.clone(),
            codec: self.codec,
            protocol,
            play_url: protocol.pick(&self.urls).to_string(),
            urls: self.urls.clone(),
            app: self.app.clone(),
            stream_id: self.stream_id.clone(),
            ssrc: self.ssrc.clone(),
            call_id: self.call_id.clone(),
            rtp_port: self.rtp_port,
            viewer_count: self.viewers,
            reused,
            started_at: self.started_at,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            device_id: self.key.device_id.clone(),
            channel_id: self.key.channel_id.clone(),
            codec: self.codec,
            protocol: self.protocol,
            play_url: self.protocol.pick(&self.urls).to_string(),
            stream_id: self.stream_id.clone(),
            viewer_count: self.viewers,
            pinned: self.pinned,
            recording: self.recording,
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}

/// start 的返回
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub codec: Codec,
    pub protocol: PreviewProtocol,
    pub play_url: String,
    pub urls: PlayUrls,
    pub app: String,
    pub stream_id: String,
    pub ssrc: String,
    pub call_id: Option<String>,
    pub rtp_port: u16,
    pub viewer_count: u32,
    /// 复用已有会话
    pub reused: bool,
    pub started_at: DateTime<Utc>,
}

/// list 的单项
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub codec: Codec,
    pub protocol: PreviewProtocol,
    pub play_url: String,
    pub stream_id: String,
    pub viewer_count: u32,
    pub pinned: bool,
    pub recording: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 通道当前的会话状态，供录像对账快照使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRuntime {
    pub session_id: String,
    pub app: String,
    pub stream_id: String,
    pub pinned: bool,
    pub viewers: u32,
    pub recording: bool,
}

/// stop 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StopOutcome {
    Unknown,
    Retained { viewers: u32, pinned: bool },
    Closed,
}
