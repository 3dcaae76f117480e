// 预览会话编排
//
// 同一 (设备, 通道) 只建立一路 INVITE + RTP 接收，多个观看者共享并引用计数。
// registry 是短临界区的同步锁；gate 串行化慢路径（开端口 + INVITE）与所有拆除，
// 保证同一 stream_id 在旧接收端关闭前不会被重新打开。
// 复用前确认流仍然存活：对话被对端挂断，或预热期后流媒体上已无此流，视为失效并重建。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::session::{
    stream_id_for, ChannelRuntime, PreviewProtocol, PreviewSession, SessionKey, SessionStatus,
    SessionView, StopOutcome,
};
use crate::directory::{Channel, Codec, Device, DeviceDirectoryRef};
use crate::error::{Gb28181Error, Result};
use crate::media::MediaGatewayRef;
use crate::recording::StoragePolicyRef;
use crate::sip::{InviteCommand, SignalingRef};
use flux_config::PreviewConfig;
use flux_shutdown::{Resource, ResourceError};

/// 开始预览请求
#[derive(Debug, Clone, Deserialize)]
pub struct StartPreview {
    pub device_id: String,
    /// 为空时取设备的第一个通道
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    /// 请求方能否解码 H.265
    #[serde(default)]
    pub supports_h265: bool,
}

/// 新会话建立后设备推流需要时间，预热期内不向流媒体探测
pub const DEFAULT_STREAM_WARMUP: Duration = Duration::from_secs(15);

/// 锁外做存活探测用的会话快照
struct Snapshot {
    session_id: String,
    app: String,
    stream_id: String,
    call_id: Option<String>,
    recording: bool,
    started_at: DateTime<Utc>,
}

impl Snapshot {
    fn of(session: &PreviewSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            app: session.app.clone(),
            stream_id: session.stream_id.clone(),
            call_id: session.call_id.clone(),
            recording: session.recording,
            started_at: session.started_at,
        }
    }
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<SessionKey, String>,
    sessions: HashMap<String, PreviewSession>,
}

impl Registry {
    fn by_key(&self, key: &SessionKey) -> Option<&PreviewSession> {
        let session_id = self.by_key.get(key)?;
        self.sessions.get(session_id)
    }

    fn by_key_mut(&mut self, key: &SessionKey) -> Option<&mut PreviewSession> {
        let session_id = self.by_key.get(key)?;
        self.sessions.get_mut(session_id)
    }

    fn insert(&mut self, session: PreviewSession) {
        self.by_key.insert(session.key.clone(), session.session_id.clone());
        self.sessions.insert(session.session_id.clone(), session);
    }

    fn remove(&mut self, session_id: &str) -> Option<PreviewSession> {
        let session = self.sessions.remove(session_id)?;
        self.by_key.remove(&session.key);
        Some(session)
    }
}

pub struct PreviewOrchestrator {
    directory: DeviceDirectoryRef,
    signaling: SignalingRef,
    media: MediaGatewayRef,
    policy: StoragePolicyRef,
    config: PreviewConfig,
    registry: Mutex<Registry>,
    gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    stream_warmup: Duration,
}

impl PreviewOrchestrator {
    pub fn new(
        directory: DeviceDirectoryRef,
        signaling: SignalingRef,
        media: MediaGatewayRef,
        policy: StoragePolicyRef,
        config: PreviewConfig,
    ) -> Self {
        Self {
            directory,
            signaling,
            media,
            policy,
            config,
            registry: Mutex::new(Registry::default()),
            gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            stream_warmup: DEFAULT_STREAM_WARMUP,
        }
    }

    pub fn with_stream_warmup(mut self, warmup: Duration) -> Self {
        self.stream_warmup = warmup;
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn start(&self, request: StartPreview) -> Result<SessionView> {
        let protocol = PreviewProtocol::parse(request.protocol.as_deref())?;
        let (device, channel) = self
            .resolve(&request.device_id, request.channel_id.as_deref())
            .await?;
        self.check_codec(channel.codec, request.supports_h265)?;

        let key = SessionKey::new(&device.device_id, &channel.channel_id);
        if let Some(view) = self.join_if_alive(&key, protocol).await {
            return Ok(view);
        }

        let _gate = self.gate.lock().await;
        self.check_open()?;
        // 等待 gate 期间可能已有人建好
        if let Some(view) = self.join_if_alive(&key, protocol).await {
            return Ok(view);
        }
        self.evict(&key).await;

        let session = self.open_session(&device, &channel, key, protocol, 1, false).await?;
        let view = session.view(protocol, false);
        self.registry().insert(session);

        tracing::info!(
            target: "gb28181::preview",
            session_id = %view.session_id,
            device_id = %view.device_id,
            channel_id = %view.channel_id,
            stream_id = %view.stream_id,
            rtp_port = view.rtp_port,
            "Preview session created"
        );
        Ok(view)
    }

    /// 观看者退出；计数归零且未被后台录像占用时拆除
    pub async fn stop(&self, session_id: &str) -> StopOutcome {
        {
            let mut registry = self.registry();
            let Some(session) = registry.sessions.get_mut(session_id) else {
                return StopOutcome::Unknown;
            };
            session.viewers = session.viewers.saturating_sub(1);
            session.updated_at = Utc::now();
            if session.viewers > 0 || session.pinned {
                return StopOutcome::Retained {
                    viewers: session.viewers,
                    pinned: session.pinned,
                };
            }
        }

        let _gate = self.gate.lock().await;
        // 递减后到拿到 gate 之间可能有新观看者加入
        let closing = {
            let mut registry = self.registry();
            let state = registry
                .sessions
                .get(session_id)
                .map(|s| (s.viewers, s.pinned));
            match state {
                None => return StopOutcome::Unknown,
                Some((viewers, pinned)) if viewers > 0 || pinned => {
                    return StopOutcome::Retained { viewers, pinned }
                }
                Some(_) => registry.remove(session_id),
            }
        };

        if let Some(session) = closing {
            self.teardown(session).await;
        }
        StopOutcome::Closed
    }

    /// 最近创建的排在前面
    pub fn list(&self) -> Vec<SessionStatus> {
        let mut list: Vec<SessionStatus> = self
            .registry()
            .sessions
            .values()
            .map(PreviewSession::status)
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    pub fn channel_runtime(&self, device_id: &str, channel_id: &str) -> Option<ChannelRuntime> {
        let mut registry = self.registry();
        let session = registry.by_key_mut(&SessionKey::new(device_id, channel_id))?;
        Some(ChannelRuntime {
            session_id: session.session_id.clone(),
            app: session.app.clone(),
            stream_id: session.stream_id.clone(),
            pinned: session.pinned,
            viewers: session.viewers,
            recording: session.recording,
        })
    }

    /// 后台录像占用：已有存活会话则固定它，否则建立零观看者的会话。
    /// 需要补开录像时，录像成功后才固定
    pub async fn ensure_background(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let key = SessionKey::new(device_id, channel_id);
        let record_enabled = self.policy.record_enabled();

        let _gate = self.gate.lock().await;
        self.check_open()?;
        let existing = match self.snapshot(&key) {
            Some(snapshot) if self.is_alive(&snapshot).await => Some(snapshot),
            Some(_) => {
                self.evict(&key).await;
                None
            }
            None => None,
        };

        match existing {
            Some(snapshot) => {
                let mut started = false;
                if record_enabled && !snapshot.recording {
                    let path = self.policy.record_path_for(device_id, channel_id);
                    self.media
                        .start_record(&snapshot.app, &snapshot.stream_id, path.as_deref())
                        .await?;
                    started = true;
                    tracing::info!(target: "gb28181::record", %device_id, %channel_id, stream_id = %snapshot.stream_id, "Recording started on existing session");
                }
                // 持有 gate 期间会话不会被移除
                if let Some(session) = self.registry().by_key_mut(&key) {
                    session.pinned = true;
                    session.recording |= started;
                    session.updated_at = Utc::now();
                }
                Ok(())
            }
            None => {
                let (device, channel) = self.resolve(device_id, Some(channel_id)).await?;
                let session = self
                    .open_session(&device, &channel, key, PreviewProtocol::Webrtc, 0, true)
                    .await?;
                tracing::info!(
                    target: "gb28181::record",
                    %device_id,
                    %channel_id,
                    session_id = %session.session_id,
                    recording = session.recording,
                    "Background session created"
                );
                self.registry().insert(session);
                Ok(())
            }
        }
    }

    /// 解除后台占用；没有观看者时拆除
    pub async fn release_background(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let key = SessionKey::new(device_id, channel_id);
        let _gate = self.gate.lock().await;
        let closing = {
            let mut registry = self.registry();
            let Some(session) = registry.by_key_mut(&key) else {
                return Ok(());
            };
            session.pinned = false;
            session.updated_at = Utc::now();
            if session.viewers > 0 {
                return Ok(());
            }
            let session_id = session.session_id.clone();
            registry.remove(&session_id)
        };

        if let Some(session) = closing {
            tracing::info!(target: "gb28181::record", %device_id, %channel_id, "Background session released");
            self.teardown(session).await;
        }
        Ok(())
    }

    /// 关闭全部会话；之后不再建立新会话
    pub async fn close_all(&self) -> usize {
        let _gate = self.gate.lock().await;
        self.closed.store(true, Ordering::Release);
        let sessions: Vec<PreviewSession> = {
            let mut registry = self.registry();
            registry.by_key.clear();
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        let count = sessions.len();
        for session in sessions {
            self.teardown(session).await;
        }
        count
    }

    async fn resolve(&self, device_id: &str, channel_id: Option<&str>) -> Result<(Device, Channel)> {
        let device = self
            .directory
            .find_device(device_id)
            .await?
            .ok_or_else(|| Gb28181Error::not_found(format!("device not found: {}", device_id)))?;
        if !device.online {
            return Err(Gb28181Error::validation(format!(
                "device offline, preview unavailable: {}",
                device_id
            )));
        }

        let channels = self.directory.list_channels(device_id).await?;
        let channel = match channel_id.map(str::trim).filter(|c| !c.is_empty()) {
            Some(id) => channels.into_iter().find(|c| c.channel_id == id),
            None => channels.into_iter().next(),
        }
        .ok_or_else(|| {
            Gb28181Error::not_found(format!(
                "channel not found: {}/{}",
                device_id,
                channel_id.unwrap_or_default()
            ))
        })?;
        Ok((device, channel))
    }

    /// H.265 只有在请求方声明支持，或开启转码回退/直连播放时放行
    fn check_codec(&self, codec: Codec, supports_h265: bool) -> Result<()> {
        if codec == Codec::H265
            && !supports_h265
            && !self.config.enable_h265_transcode_fallback
            && !self.config.allow_h265_direct_play
        {
            return Err(Gb28181Error::conflict(
                "requester does not support H.265, switch to an HEVC capable player",
            ));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Gb28181Error::ShuttingDown("preview service"));
        }
        Ok(())
    }

    fn snapshot(&self, key: &SessionKey) -> Option<Snapshot> {
        self.registry().by_key(key).map(Snapshot::of)
    }

    /// 对话被挂断即失效；预热期过后以流媒体上流是否存在为准，查询失败时保留会话
    async fn is_alive(&self, snapshot: &Snapshot) -> bool {
        if let Some(call_id) = &snapshot.call_id {
            if !self.signaling.dialog_active(call_id) {
                return false;
            }
        }
        let warming_up = Utc::now()
            .signed_duration_since(snapshot.started_at)
            .to_std()
            .map_or(true, |age| age < self.stream_warmup);
        if warming_up {
            return true;
        }
        match self.media.is_stream_ready(&snapshot.app, &snapshot.stream_id).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::debug!(target: "gb28181::preview", stream_id = %snapshot.stream_id, error = %e, "Stream readiness query failed, keeping session");
                true
            }
        }
    }

    async fn join_if_alive(&self, key: &SessionKey, protocol: PreviewProtocol) -> Option<SessionView> {
        let snapshot = self.snapshot(key)?;
        if !self.is_alive(&snapshot).await {
            return None;
        }
        self.join(key, &snapshot.session_id, protocol)
    }

    /// 移除并拆除该键上的失效会话。调用方持有 gate
    async fn evict(&self, key: &SessionKey) {
        let stale = {
            let mut registry = self.registry();
            let session_id = registry.by_key.get(key).cloned();
            session_id.and_then(|id| registry.remove(&id))
        };
        if let Some(session) = stale {
            tracing::warn!(
                target: "gb28181::preview",
                session_id = %session.session_id,
                stream_id = %session.stream_id,
                viewers = session.viewers,
                pinned = session.pinned,
                "Stale preview session, recreating"
            );
            self.teardown(session).await;
        }
    }

    fn join(&self, key: &SessionKey, session_id: &str, protocol: PreviewProtocol) -> Option<SessionView> {
        let mut registry = self.registry();
        let session = registry
            .by_key_mut(key)
            .filter(|s| s.session_id == session_id)?;
        session.viewers += 1;
        session.updated_at = Utc::now();
        tracing::debug!(
            target: "gb28181::preview",
            session_id = %session.session_id,
            viewers = session.viewers,
            "Preview session reused"
        );
        Some(session.view(protocol, true))
    }

    /// 开端口、INVITE、按策略开启录像；任何一步失败都回滚已完成的部分。调用方持有 gate
    async fn open_session(
        &self,
        device: &Device,
        channel: &Channel,
        key: SessionKey,
        protocol: PreviewProtocol,
        viewers: u32,
        pinned: bool,
    ) -> Result<PreviewSession> {
        let app = self.media.default_app().to_string();
        let stream_id = stream_id_for(&channel.channel_id);
        let ssrc = self.signaling.next_ssrc();

        let rtp_port = self
            .media
            .open_rtp_server(&stream_id, device.transport, Some(&ssrc))
            .await?;
        tracing::debug!(
            target: "gb28181::preview",
            device_id = %device.device_id,
            channel_id = %channel.channel_id,
            %stream_id,
            rtp_port,
            %ssrc,
            "RTP server opened"
        );

        let outcome = self
            .signaling
            .invite(InviteCommand::live(device, &channel.channel_id, rtp_port, &ssrc))
            .await;
        let call_id = match outcome.into_result("INVITE") {
            Ok(call_id) => call_id,
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::preview",
                    device_id = %device.device_id,
                    channel_id = %channel.channel_id,
                    error = %e,
                    "INVITE failed, closing RTP server"
                );
                self.close_rtp(&stream_id).await;
                return Err(e);
            }
        };

        let mut recording = false;
        if self.policy.record_enabled() {
            let path = self
                .policy
                .record_path_for(&device.device_id, &channel.channel_id);
            if let Err(e) = self.media.start_record(&app, &stream_id, path.as_deref()).await {
                tracing::warn!(target: "gb28181::preview", %stream_id, error = %e, "Recording failed to start, rolling back");
                if let Some(call_id) = &call_id {
                    self.signaling.bye(call_id).await;
                }
                self.close_rtp(&stream_id).await;
                return Err(Gb28181Error::upstream(format!(
                    "recording enabled but failed to start: {}",
                    e
                )));
            }
            recording = true;
        }

        let now = Utc::now();
        Ok(PreviewSession {
            session_id: Uuid::new_v4().simple().to_string(),
            key,
            codec: channel.codec,
            urls: self.media.play_urls(&app, &stream_id),
            app,
            stream_id,
            protocol,
            ssrc,
            call_id,
            rtp_port,
            recording,
            viewers,
            pinned,
            started_at: now,
            updated_at: now,
        })
    }

    async fn teardown(&self, session: PreviewSession) {
        if session.recording {
            if let Err(e) = self.media.stop_record(&session.app, &session.stream_id).await {
                tracing::warn!(target: "gb28181::preview", stream_id = %session.stream_id, error = %e, "stopRecord failed");
            }
        }
        if let Some(call_id) = &session.call_id {
            self.signaling.bye(call_id).await;
        }
        self.close_rtp(&session.stream_id).await;
        tracing::info!(
            target: "gb28181::preview",
            session_id = %session.session_id,
            device_id = %session.key.device_id,
            channel_id = %session.key.channel_id,
            "Preview session closed"
        );
    }

    async fn close_rtp(&self, stream_id: &str) {
        if let Err(e) = self.media.close_rtp_server(stream_id).await {
            tracing::warn!(target: "gb28181::preview", %stream_id, error = %e, "closeRtpServer failed");
        }
    }
}

#[async_trait]
impl Resource for PreviewOrchestrator {
    async fn cleanup(&self) -> std::result::Result<(), ResourceError> {
        let closed = self.close_all().await;
        tracing::info!(target: "gb28181::preview", closed, "Preview sessions closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "gb28181-preview"
    }

    fn priority(&self) -> u32 {
        10
    }
}
