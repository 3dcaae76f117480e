// GB28181 点播 SDP
// 发起方只接收 PS 流（a=recvonly），y= 行携带 10 位 SSRC

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};

use crate::directory::Transport;
use crate::error::{Gb28181Error, Result};

/// NTP 纪元（1900）与 Unix 纪元之差
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// 回放时间段（NTP 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackRange {
    pub start: i64,
    pub end: i64,
}

impl PlaybackRange {
    /// 解析 `yyyy-MM-ddTHH:mm:ss`（东八区）
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let start = parse_local_time(start)?;
        let end = parse_local_time(end)?;
        if end <= start {
            return Err(Gb28181Error::validation("endTime must be after startTime"));
        }
        Ok(Self {
            start: start.timestamp() + NTP_UNIX_OFFSET,
            end: end.timestamp() + NTP_UNIX_OFFSET,
        })
    }
}

pub(crate) fn parse_local_time(value: &str) -> Result<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(8 * 3600)
        .ok_or_else(|| Gb28181Error::validation("invalid time zone offset"))?;
    let naive = NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| Gb28181Error::validation(format!("invalid time: {}", value)))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| Gb28181Error::validation(format!("invalid time: {}", value)))
}

/// INVITE 携带的 SDP offer
#[derive(Debug, Clone)]
pub struct SdpOffer {
    /// o= 行的用户名（实时点播为平台 ID，回放为通道 ID）
    pub owner: String,
    pub media_ip: String,
    pub rtp_port: u16,
    pub transport: Transport,
    pub ssrc: String,
    /// 回放时为 Some，同时决定 s=Playback 与 u= 行
    pub playback: Option<(String, PlaybackRange)>,
}

impl SdpOffer {
    pub fn play(
        server_id: &str,
        media_ip: &str,
        rtp_port: u16,
        transport: Transport,
        ssrc: &str,
    ) -> Self {
        Self {
            owner: server_id.to_string(),
            media_ip: media_ip.to_string(),
            rtp_port,
            transport,
            ssrc: ssrc.to_string(),
            playback: None,
        }
    }

    pub fn playback(
        channel_id: &str,
        media_ip: &str,
        rtp_port: u16,
        transport: Transport,
        ssrc: &str,
        range: PlaybackRange,
    ) -> Self {
        Self {
            owner: channel_id.to_string(),
            media_ip: media_ip.to_string(),
            rtp_port,
            transport,
            ssrc: ssrc.to_string(),
            playback: Some((channel_id.to_string(), range)),
        }
    }

    pub fn encode(&self) -> String {
        let mut sdp = String::with_capacity(256);
        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!("o={} 0 0 IN IP4 {}\r\n", self.owner, self.media_ip));
        match &self.playback {
            Some((channel_id, _)) => {
                sdp.push_str("s=Playback\r\n");
                sdp.push_str(&format!("u={}:3\r\n", channel_id));
            }
            None => sdp.push_str("s=Play\r\n"),
        }
        sdp.push_str(&format!("c=IN IP4 {}\r\n", self.media_ip));
        match &self.playback {
            Some((_, range)) => sdp.push_str(&format!("t={} {}\r\n", range.start, range.end)),
            None => sdp.push_str("t=0 0\r\n"),
        }

        let protocol = match self.transport {
            Transport::Tcp => "TCP/RTP/AVP",
            Transport::Udp => "RTP/AVP",
        };
        sdp.push_str(&format!("m=video {} {} 96\r\n", self.rtp_port, protocol));
        sdp.push_str("a=recvonly\r\n");
        sdp.push_str("a=rtpmap:96 PS/90000\r\n");
        if self.transport == Transport::Tcp {
            sdp.push_str("a=setup:passive\r\n");
            sdp.push_str("a=connection:new\r\n");
        }
        sdp.push_str(&format!("y={}\r\n", self.ssrc));
        sdp
    }
}

/// 设备 200 OK 中的 SDP answer，只取需要的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpAnswer {
    pub connection: Option<String>,
    pub media_port: Option<u16>,
    pub protocol: Option<String>,
    pub ssrc: Option<String>,
    pub setup: Option<String>,
}

impl SdpAnswer {
    pub fn parse(sdp: &str) -> Self {
        let mut answer = SdpAnswer::default();
        for line in sdp.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key {
                "c" => answer.connection = value.split_whitespace().nth(2).map(str::to_string),
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.first() == Some(&"video") {
                        answer.media_port = parts.get(1).and_then(|p| p.parse().ok());
                        answer.protocol = parts.get(2).map(|p| p.to_string());
                    }
                }
                "y" => answer.ssrc = Some(value.trim().to_string()),
                "a" => {
                    if let Some(setup) = value.strip_prefix("setup:") {
                        answer.setup = Some(setup.trim().to_string());
                    }
                }
                _ => {}
            }
        }
        answer
    }
}
