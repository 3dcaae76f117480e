// 录像回放会话
//
// 每次回放独立建立 RTP 接收端与 INVITE，不做去重；关闭后的会话保留在列表中。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::{DeviceDirectoryRef, Transport};
use crate::error::{Gb28181Error, Result};
use crate::media::{MediaGatewayRef, PlayUrls};
use crate::sip::{InviteCommand, PlaybackControl, PlaybackRange, SignalingRef};
use flux_shutdown::{Resource, ResourceError};

/// 开始回放请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartPlayback {
    pub device_id: String,
    /// 为空时使用设备编码
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    /// 媒体传输，缺省跟随设备
    #[serde(default)]
    pub transport: Option<String>,
}

/// 回放控制请求
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackControlRequest {
    pub action: String,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub seek_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackStatus {
    /// INVITE 已接受但流尚未到达
    Pending,
    Playing,
    Paused,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSession {
    pub session_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub app: String,
    pub stream_id: String,
    pub ssrc: String,
    pub call_id: Option<String>,
    pub rtp_port: u16,
    pub transport: Transport,
    pub speed: f64,
    pub status: PlaybackStatus,
    pub start_time: String,
    pub end_time: String,
    pub urls: PlayUrls,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 已关闭的会话保留多久后清除
pub const CLOSED_RETENTION_SECS: i64 = 600;

pub struct PlaybackService {
    directory: DeviceDirectoryRef,
    signaling: SignalingRef,
    media: MediaGatewayRef,
    sessions: DashMap<String, PlaybackSession>,
}

impl PlaybackService {
    pub fn new(directory: DeviceDirectoryRef, signaling: SignalingRef, media: MediaGatewayRef) -> Self {
        Self {
            directory,
            signaling,
            media,
            sessions: DashMap::new(),
        }
    }

    pub async fn start(&self, request: StartPlayback) -> Result<PlaybackSession> {
        let device = self
            .directory
            .find_device(&request.device_id)
            .await?
            .ok_or_else(|| Gb28181Error::not_found(format!("device not found: {}", request.device_id)))?;
        if !device.online {
            return Err(Gb28181Error::validation(format!(
                "device offline, playback unavailable: {}",
                device.device_id
            )));
        }

        let channel_id = match request.channel_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => device.device_id.clone(),
        };
        let start_time = required(request.start_time.as_deref(), "startTime")?;
        let end_time = required(request.end_time.as_deref(), "endTime")?;
        let range = PlaybackRange::parse(&start_time, &end_time)?;
        let transport = request
            .transport
            .as_deref()
            .map(Transport::parse)
            .unwrap_or(device.transport);

        let session_id = Uuid::new_v4().simple().to_string();
        let stream_id = format!("playback_{}_{}", channel_id, &session_id[..8]);
        let ssrc = self.signaling.next_playback_ssrc();
        let app = self.media.default_app().to_string();

        let rtp_port = self
            .media
            .open_rtp_server(&stream_id, transport, Some(&ssrc))
            .await?;
        tracing::info!(
            target: "gb28181::preview",
            device_id = %device.device_id,
            %channel_id,
            %stream_id,
            rtp_port,
            %ssrc,
            "Playback RTP server opened"
        );

        let command = InviteCommand::playback(&device, &channel_id, transport, rtp_port, &ssrc, range);
        let call_id = match self.signaling.invite(command).await.into_result("playback INVITE") {
            Ok(call_id) => call_id,
            Err(e) => {
                self.close_rtp(&stream_id).await;
                return Err(e);
            }
        };

        let stream_ready = self
            .media
            .is_stream_ready(&app, &stream_id)
            .await
            .unwrap_or(false);
        let now = Utc::now();
        let session = PlaybackSession {
            session_id: session_id.clone(),
            device_id: device.device_id.clone(),
            channel_id,
            urls: self.media.play_urls(&app, &stream_id),
            app,
            stream_id,
            ssrc,
            call_id,
            rtp_port,
            transport,
            speed: 1.0,
            status: if stream_ready {
                PlaybackStatus::Playing
            } else {
                PlaybackStatus::Pending
            },
            start_time,
            end_time,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(
            target: "gb28181::preview",
            %session_id,
            call_id = ?session.call_id,
            stream_ready,
            "Playback session started"
        );
        self.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    pub async fn control(&self, session_id: &str, request: PlaybackControlRequest) -> Result<PlaybackSession> {
        let session = self.get(session_id)?;
        if session.status == PlaybackStatus::Closed {
            return Err(Gb28181Error::validation(format!(
                "playback session closed: {}",
                session_id
            )));
        }

        let control = match PlaybackControl::parse(&request.action, request.speed, request.seek_seconds)? {
            PlaybackControl::Speed { scale } if scale <= 0.0 => PlaybackControl::Speed { scale: 1.0 },
            other => other,
        };
        if let Some(call_id) = session.call_id.as_deref() {
            self.signaling.playback_control(call_id, control).await?;
        }

        if control == PlaybackControl::Teardown {
            return self.stop(session_id).await;
        }

        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Gb28181Error::not_found(format!("playback session not found: {}", session_id)))?;
        match control {
            PlaybackControl::Pause => entry.status = PlaybackStatus::Paused,
            PlaybackControl::Speed { scale } => {
                entry.speed = scale;
                entry.status = PlaybackStatus::Playing;
            }
            _ => entry.status = PlaybackStatus::Playing,
        }
        entry.updated_at = Utc::now();
        tracing::info!(target: "gb28181::preview", %session_id, ?control, "Playback control sent");
        Ok(entry.clone())
    }

    /// 发送 BYE 并释放 RTP；重复调用只刷新状态
    pub async fn stop(&self, session_id: &str) -> Result<PlaybackSession> {
        let session = self.get(session_id)?;
        if session.status != PlaybackStatus::Closed {
            if let Some(call_id) = session.call_id.as_deref() {
                self.signaling.bye(call_id).await;
            }
        }
        self.close_rtp(&session.stream_id).await;

        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Gb28181Error::not_found(format!("playback session not found: {}", session_id)))?;
        entry.status = PlaybackStatus::Closed;
        entry.updated_at = Utc::now();
        tracing::info!(target: "gb28181::preview", %session_id, call_id = ?entry.call_id, "Playback session stopped");
        Ok(entry.clone())
    }

    /// 新建的排在前面
    pub fn list(&self) -> Vec<PlaybackSession> {
        let mut list: Vec<PlaybackSession> = self.sessions.iter().map(|e| e.value().clone()).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// 清除关闭超过保留期的会话，返回清除数量
    pub fn purge_closed(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::seconds(CLOSED_RETENTION_SECS);
        let mut purged = 0;
        self.sessions.retain(|_, session| {
            let expired = session.status == PlaybackStatus::Closed && session.updated_at <= cutoff;
            if expired {
                purged += 1;
            }
            !expired
        });
        purged
    }

    /// 关闭全部未结束的会话
    pub async fn close_all(&self) -> usize {
        let open: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.status != PlaybackStatus::Closed)
            .map(|e| e.key().clone())
            .collect();
        let mut closed = 0;
        for session_id in open {
            if self.stop(&session_id).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    fn get(&self, session_id: &str) -> Result<PlaybackSession> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Gb28181Error::not_found(format!("playback session not found: {}", session_id)))
    }

    async fn close_rtp(&self, stream_id: &str) {
        if let Err(e) = self.media.close_rtp_server(stream_id).await {
            tracing::warn!(target: "gb28181::preview", %stream_id, error = %e, "closeRtpServer failed");
        }
    }
}

fn required(value: Option<&str>, field: &str) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Gb28181Error::validation(format!("{} is required", field))),
    }
}

#[async_trait]
impl Resource for PlaybackService {
    async fn cleanup(&self) -> std::result::Result<(), ResourceError> {
        let closed = self.close_all().await;
        tracing::info!(target: "gb28181::preview", closed, "Playback sessions closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "gb28181-playback"
    }

    fn priority(&self) -> u32 {
        20
    }
}
