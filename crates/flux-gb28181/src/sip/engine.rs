// GB28181 SIP 信令引擎
//
// - 入站：REGISTER / MESSAGE / BYE 等请求与所有响应统一进入 dispatch
// - 出站：INVITE / MESSAGE / SUBSCRIBE 以 Call-ID 登记待响应事务，调用方等待一次性结果
// - 结果只会被写入一次：响应、事务超时、等待超时、关闭四条路径谁先从 map 中取走谁完成

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::header;
use super::manscdp;
use super::mansrtsp::{self, PlaybackControl};
use super::message::{SipMethod, SipRequest, SipResponse};
use super::ptz::{self, PtzCommand};
use super::sdp::{PlaybackRange, SdpAnswer, SdpOffer};
use super::ssrc::SsrcGenerator;
use super::transaction::{
    Dialog, DialogContext, DialogState, DialogView, Endpoint, PendingTransaction, SipEvent,
    SipOutcome,
};
use super::transport::{in_span, SipTransport};
use crate::directory::{Channel, Codec, Device, DeviceDirectoryRef, Transport};
use crate::error::{Gb28181Error, Result};
use crate::notify::{AlarmEvent, NotificationStore, PositionEvent, RecordItem};
use flux_config::SipConfig;
use flux_shutdown::{Resource, ResourceError};

/// 重传初始间隔
const T1: Duration = Duration::from_millis(500);
/// 重传最大间隔
const T2: Duration = Duration::from_secs(4);
/// 事务超时（Timer B / F）
const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(500 * 64);

const SHUTTING_DOWN: &str = "SIP service shutting down";

/// 点播请求
#[derive(Debug, Clone)]
pub struct InviteCommand {
    pub device_id: String,
    pub channel_id: String,
    /// 设备注册地址
    pub host: String,
    pub port: u16,
    /// 信令传输
    pub signaling: Transport,
    /// 媒体传输（SDP m= 行）
    pub stream: Transport,
    pub rtp_port: u16,
    pub ssrc: String,
    pub playback: Option<PlaybackRange>,
}

impl InviteCommand {
    pub fn live(device: &Device, channel_id: &str, rtp_port: u16, ssrc: &str) -> Self {
        Self {
            device_id: device.device_id.clone(),
            channel_id: channel_id.to_string(),
            host: device.ip.clone(),
            port: device.port,
            signaling: device.transport,
            stream: device.transport,
            rtp_port,
            ssrc: ssrc.to_string(),
            playback: None,
        }
    }

    pub fn playback(
        device: &Device,
        channel_id: &str,
        stream: Transport,
        rtp_port: u16,
        ssrc: &str,
        range: PlaybackRange,
    ) -> Self {
        Self {
            stream,
            playback: Some(range),
            ..Self::live(device, channel_id, rtp_port, ssrc)
        }
    }
}

/// 会话编排层依赖的信令能力
#[async_trait]
pub trait Signaling: Send + Sync {
    /// 发送 INVITE 并等待最终结果，永不返回错误，所有情况都编码在结果里
    async fn invite(&self, command: InviteCommand) -> SipOutcome;

    /// 幂等；无对话或对话已结束时什么也不做
    async fn bye(&self, call_id: &str);

    /// 对话仍在且未被对端挂断
    fn dialog_active(&self, call_id: &str) -> bool;

    fn next_ssrc(&self) -> String;

    fn next_playback_ssrc(&self) -> String;

    /// 回放控制（对话内 INFO），发出即返回
    async fn playback_control(&self, call_id: &str, control: PlaybackControl) -> Result<()>;
}

pub type SignalingRef = Arc<dyn Signaling>;

/// GB28181 SIP 信令引擎
pub struct SignalingEngine {
    config: SipConfig,
    directory: DeviceDirectoryRef,
    notifications: Arc<NotificationStore>,
    transport: ArcSwapOption<SipTransport>,
    pending: Arc<DashMap<String, PendingTransaction>>,
    dialogs: DashMap<String, Dialog>,
    cseq: AtomicU32,
    sn: AtomicU64,
    ssrc: SsrcGenerator,
    events_tx: mpsc::UnboundedSender<SipEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SipEvent>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingEngine {
    pub fn new(
        config: SipConfig,
        directory: DeviceDirectoryRef,
        notifications: Arc<NotificationStore>,
    ) -> Self {
        let now_ms = Utc::now().timestamp_millis().unsigned_abs();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            ssrc: SsrcGenerator::new(&config.ssrc_prefix, &config.domain),
            config,
            directory,
            notifications,
            transport: ArcSwapOption::empty(),
            pending: Arc::new(DashMap::new()),
            dialogs: DashMap::new(),
            cseq: AtomicU32::new((now_ms % 100_000_000) as u32),
            sn: AtomicU64::new(now_ms % 1_000_000),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        }
    }

    /// 绑定传输并启动事件分发；失败时引擎保持未就绪状态
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!(target: "gb28181::sip", "GB28181 SIP signaling disabled");
            return Ok(());
        }
        if self.transport.load().is_some() {
            return Ok(());
        }

        let transport = match SipTransport::bind(
            &self.config.bind_ip,
            self.config.local_port,
            self.config.enable_tcp,
            self.events_tx.clone(),
            self.shutdown_tx.subscribe(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(
                    target: "gb28181::sip",
                    bind_ip = %self.config.bind_ip,
                    port = self.config.local_port,
                    error = %e,
                    "GB28181 SIP start failed, signaling not initialized"
                );
                return Err(e.into());
            }
        };
        self.transport.store(Some(transport));

        let events_rx = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut rx) = events_rx {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                let engine = engine.clone();
                                tokio::spawn(async move { engine.dispatch(event).await });
                            }
                            None => break,
                        },
                    }
                }
                tracing::debug!(target: "gb28181::sip", "SIP event dispatcher stopped");
            });
        }

        tracing::info!(
            target: "gb28181::sip",
            server_id = %self.config.server_id,
            domain = %self.config.domain,
            local_addr = ?self.local_addr(),
            "GB28181 SIP signaling started"
        );
        Ok(())
    }

    /// 失败所有待响应事务，清空对话并释放传输
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some((call_id, pending)) = self.pending.remove(&key) {
                let _ = pending
                    .completion
                    .send(SipOutcome::failed(Some(call_id), 500, SHUTTING_DOWN));
                failed += 1;
            }
        }

        self.dialogs.clear();
        self.transport.store(None);
        tracing::info!(target: "gb28181::sip", failed_pending = failed, "GB28181 SIP signaling stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.load().as_ref().map(|t| t.local_addr())
    }

    pub fn is_ready(&self) -> bool {
        self.transport.load().is_some()
    }

    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_sn(&self) -> u64 {
        self.sn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn dialogs(&self) -> Vec<DialogView> {
        let mut list: Vec<DialogView> = self.dialogs.iter().map(|d| DialogView::from(d.value())).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 单一事件入口
    pub async fn dispatch(&self, event: SipEvent) {
        match event {
            SipEvent::Request { request, peer } => {
                in_span(self.on_request(request, peer), peer.addr).await
            }
            SipEvent::Response { response, peer } => {
                in_span(self.on_response(response, peer), peer.addr).await
            }
            SipEvent::TransactionTimeout { call_id } => self.on_transaction_timeout(&call_id),
            SipEvent::DialogTerminated { call_id } => {
                if self.dialogs.remove(&call_id).is_some() {
                    tracing::debug!(target: "gb28181::sip", %call_id, "Dialog terminated");
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // 入站请求
    // ---------------------------------------------------------------

    async fn on_request(&self, request: SipRequest, peer: Endpoint) {
        let result = match request.method {
            SipMethod::Register => self.handle_register(&request, &peer).await,
            SipMethod::Message => self.handle_message(&request, &peer).await,
            SipMethod::Bye => self.handle_bye(&request, &peer).await,
            SipMethod::Notify | SipMethod::Options | SipMethod::Subscribe | SipMethod::Cancel => {
                self.reply(&request, &peer, 200, "OK").await
            }
            SipMethod::Invite => self.reply(&request, &peer, 488, "Not Acceptable Here").await,
            SipMethod::Ack => Ok(()),
            _ => self.reply_not_allowed(&request, &peer).await,
        };

        if let Err(e) = result {
            tracing::warn!(
                target: "gb28181::sip",
                method = %request.method,
                error = %e,
                "Failed to handle SIP request"
            );
            if let Err(e) = self.reply(&request, &peer, 500, "Server Internal Error").await {
                tracing::debug!(target: "gb28181::sip", error = %e, "Failed to send 500 response");
            }
        }
    }

    async fn handle_register(&self, request: &SipRequest, peer: &Endpoint) -> Result<()> {
        let expires = header::expires(request).or_else(|| {
            request
                .header("Contact")
                .and_then(|c| header::param(c, "expires"))
                .and_then(|v| v.parse().ok())
        });
        let online = expires != Some(0);

        let mut response = self.response_for(request, 200, "OK");
        response.add_header(
            "Expires",
            expires
                .map(|e| e.to_string())
                .unwrap_or_else(|| self.config.device_expires_secs.to_string()),
        );
        response.add_header("Date", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string());
        self.send_raw(response.encode().as_bytes(), peer).await?;

        let Some(device_id) = header::device_id_from_headers(request) else {
            tracing::warn!(target: "gb28181::sip", remote = %peer.addr, "REGISTER without device id");
            return Ok(());
        };

        tracing::info!(target: "gb28181::sip", %device_id, online, remote = %peer.addr, "REGISTER");
        // 已应答 200，目录错误只记录
        if let Err(e) = self.mark_online(&device_id, online, peer, "REGISTER").await {
            tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "Failed to update device status");
        }
        Ok(())
    }

    async fn handle_message(&self, request: &SipRequest, peer: &Endpoint) -> Result<()> {
        let body = request.body.as_str();
        let cmd_type = manscdp::extract_tag(body, "CmdType");
        let header_id = header::device_id_from_headers(request);
        let device_id = manscdp::extract_tag(body, "DeviceID").or_else(|| header_id.clone());

        if let (Some(cmd_type), Some(device_id)) = (cmd_type, device_id) {
            let sender = header_id.unwrap_or_else(|| device_id.clone());
            // MESSAGE 总是应答 200，处理失败只记录
            if let Err(e) = self
                .apply_message(&cmd_type, &device_id, &sender, body, peer)
                .await
            {
                tracing::warn!(
                    target: "gb28181::sip",
                    %device_id,
                    %cmd_type,
                    error = %e,
                    "Failed to apply MESSAGE"
                );
            }
        }

        self.reply(request, peer, 200, "OK").await
    }

    async fn apply_message(
        &self,
        cmd_type: &str,
        device_id: &str,
        sender: &str,
        body: &str,
        peer: &Endpoint,
    ) -> Result<()> {
        match cmd_type.to_ascii_lowercase().as_str() {
            "keepalive" => {
                tracing::debug!(target: "gb28181::sip", %device_id, "Keepalive");
                self.mark_online(device_id, true, peer, "Keepalive").await?;
            }
            "catalog" => {
                let entries = manscdp::parse_catalog(body);
                if !self.directory.sync_catalog(device_id, entries).await? {
                    tracing::warn!(target: "gb28181::sip", %device_id, "Catalog from unknown device");
                }
            }
            "deviceinfo" => {
                let profile = manscdp::parse_device_info(body);
                self.directory.update_profile(device_id, profile).await?;
            }
            "alarm" => {
                let alarm = AlarmEvent::parse(sender, body);
                tracing::info!(
                    target: "gb28181::sip",
                    device_id = %sender,
                    alarm_type = ?alarm.alarm_type,
                    "Alarm notification"
                );
                self.notifications.push_alarm(alarm);
            }
            "mobileposition" => {
                self.notifications
                    .push_position(PositionEvent::parse(sender, body));
            }
            "recordinfo" => {
                let items = RecordItem::parse_all(sender, body);
                tracing::debug!(target: "gb28181::sip", device_id = %sender, items = items.len(), "RecordInfo response");
                self.notifications.push_records(items);
            }
            other => {
                tracing::debug!(target: "gb28181::sip", %device_id, cmd_type = %other, "Unhandled MANSCDP message");
            }
        }
        Ok(())
    }

    async fn handle_bye(&self, request: &SipRequest, peer: &Endpoint) -> Result<()> {
        if let Some(call_id) = request.call_id() {
            if let Some(mut dialog) = self.dialogs.get_mut(call_id) {
                dialog.state = DialogState::Terminated;
                tracing::info!(
                    target: "gb28181::sip",
                    %call_id,
                    device_id = %dialog.device_id,
                    "Remote BYE"
                );
            }
            let _ = self.events_tx.send(SipEvent::DialogTerminated {
                call_id: call_id.to_string(),
            });
        }
        self.reply(request, peer, 200, "OK").await
    }

    /// 更新在线状态；未知设备满足条件时自动接入
    async fn mark_online(
        &self,
        device_id: &str,
        online: bool,
        peer: &Endpoint,
        source: &str,
    ) -> Result<()> {
        if self.directory.set_online(device_id, online).await? {
            if online {
                self.directory
                    .update_endpoint(
                        device_id,
                        &peer.addr.ip().to_string(),
                        peer.addr.port(),
                        peer.transport,
                    )
                    .await?;
            }
            return Ok(());
        }

        if online && self.auto_register(device_id, peer).await? {
            return Ok(());
        }

        tracing::warn!(target: "gb28181::sip", %device_id, %source, "Unknown device");
        Ok(())
    }

    async fn auto_register(&self, device_id: &str, peer: &Endpoint) -> Result<bool> {
        if !self.config.auto_register_unknown_device || !is_gb_code(device_id) {
            return Ok(false);
        }

        let mut device = Device::new(device_id, peer.addr.ip().to_string(), peer.addr.port());
        device.name = format!("自动接入-{}", &device_id[device_id.len() - 6..]);
        device.manufacturer = "AUTO".to_string();
        device.transport = peer.transport;
        device.online = true;
        device.last_seen = Some(Utc::now());
        device.expires = self.config.device_expires_secs;

        let channel = Channel {
            channel_id: device_id.to_string(),
            device_id: device_id.to_string(),
            name: "通道-1".to_string(),
            codec: Codec::H264,
            online: true,
        };
        self.directory.register_device(device, vec![channel]).await?;

        tracing::info!(target: "gb28181::sip", %device_id, remote = %peer.addr, "Unknown device auto registered");
        Ok(true)
    }

    // ---------------------------------------------------------------
    // 响应
    // ---------------------------------------------------------------

    async fn on_response(&self, response: SipResponse, peer: Endpoint) {
        let Some(call_id) = response.call_id().map(str::to_string) else {
            tracing::debug!(target: "gb28181::sip", "SIP response without Call-ID");
            return;
        };
        let Some((_, method)) = response.cseq() else {
            tracing::debug!(target: "gb28181::sip", %call_id, "SIP response without CSeq");
            return;
        };

        match method {
            SipMethod::Invite => self.on_invite_response(call_id, response, peer).await,
            SipMethod::Bye => {
                if response.is_success() {
                    self.dialogs.remove(&call_id);
                }
                tracing::debug!(target: "gb28181::sip", %call_id, status = response.status_code, "BYE response");
            }
            _ => self.on_command_response(call_id, response),
        }
    }

    async fn on_invite_response(&self, call_id: String, response: SipResponse, peer: Endpoint) {
        if response.is_provisional() {
            if let Some(pending) = self.pending.get(&call_id) {
                pending.responded.store(true, Ordering::Release);
            }
            return;
        }

        let Some((_, pending)) = self.pending.remove(&call_id) else {
            if response.is_success() {
                self.on_stray_invite_success(&call_id, &response, peer).await;
            }
            return;
        };
        pending.responded.store(true, Ordering::Release);

        let status_code = response.status_code;
        if !response.is_success() {
            // 非 2xx 的 ACK 属于同一事务
            let ack = self.non_2xx_ack(&pending.request, &response);
            if let Err(e) = self.send_raw(ack.encode().as_bytes(), &pending.target).await {
                tracing::debug!(target: "gb28181::sip", %call_id, error = %e, "Failed to ACK error response");
            }
            tracing::warn!(
                target: "gb28181::sip",
                %call_id,
                status = status_code,
                reason = %response.reason,
                "INVITE rejected"
            );
            let _ = pending.completion.send(SipOutcome::failed(
                Some(call_id),
                status_code,
                response.reason.clone(),
            ));
            return;
        }

        let context = pending.context.clone().unwrap_or(DialogContext {
            device_id: String::new(),
            channel_id: String::new(),
        });
        let dialog = Dialog {
            call_id: call_id.clone(),
            device_id: context.device_id,
            channel_id: context.channel_id,
            local: pending.request.header("From").unwrap_or_default().to_string(),
            remote: response
                .header("To")
                .or_else(|| pending.request.header("To"))
                .unwrap_or_default()
                .to_string(),
            remote_target: response
                .header("Contact")
                .and_then(header::uri_of)
                .map(str::to_string)
                .unwrap_or_else(|| pending.request.uri.clone()),
            peer: pending.target,
            invite_cseq: pending.request.cseq().map(|(n, _)| n).unwrap_or_default(),
            state: DialogState::Confirmed,
            created_at: Utc::now(),
        };

        let ack = self.in_dialog_request(&dialog, SipMethod::Ack, dialog.invite_cseq);
        if let Err(e) = self.send_raw(ack.encode().as_bytes(), &dialog.peer).await {
            tracing::warn!(target: "gb28181::sip", %call_id, error = %e, "Failed to send ACK");
            let _ = pending.completion.send(SipOutcome::failed(
                Some(call_id),
                500,
                format!("ACK send failed: {}", e),
            ));
            return;
        }

        let answer = SdpAnswer::parse(&response.body);
        tracing::info!(
            target: "gb28181::sip",
            %call_id,
            device_id = %dialog.device_id,
            channel_id = %dialog.channel_id,
            answer_ssrc = ?answer.ssrc,
            answer_port = ?answer.media_port,
            "INVITE established"
        );

        self.dialogs.insert(call_id.clone(), dialog);
        let _ = pending.completion.send(SipOutcome::Success {
            call_id,
            status_code,
            reason: response.reason.clone(),
        });
    }

    /// 无待响应事务的 2xx：已知对话则重发 ACK，否则是等待超时后才到达，ACK 后立即 BYE
    async fn on_stray_invite_success(&self, call_id: &str, response: &SipResponse, peer: Endpoint) {
        if let Some(dialog) = self.dialogs.get(call_id).map(|d| d.clone()) {
            let ack = self.in_dialog_request(&dialog, SipMethod::Ack, dialog.invite_cseq);
            let _ = self.send_raw(ack.encode().as_bytes(), &dialog.peer).await;
            return;
        }

        let dialog = Dialog {
            call_id: call_id.to_string(),
            device_id: String::new(),
            channel_id: String::new(),
            local: response.header("From").unwrap_or_default().to_string(),
            remote: response.header("To").unwrap_or_default().to_string(),
            remote_target: response
                .header("Contact")
                .and_then(header::uri_of)
                .map(str::to_string)
                .unwrap_or_else(|| format!("sip:{}", peer.addr)),
            peer,
            invite_cseq: response.cseq().map(|(n, _)| n).unwrap_or_default(),
            state: DialogState::Confirmed,
            created_at: Utc::now(),
        };

        tracing::warn!(target: "gb28181::sip", %call_id, "Late INVITE 2xx after timeout, tearing down");
        let ack = self.in_dialog_request(&dialog, SipMethod::Ack, dialog.invite_cseq);
        let _ = self.send_raw(ack.encode().as_bytes(), &peer).await;
        let bye = self.in_dialog_request(&dialog, SipMethod::Bye, self.next_cseq());
        let _ = self.send_raw(bye.encode().as_bytes(), &peer).await;
    }

    fn on_command_response(&self, call_id: String, response: SipResponse) {
        if response.is_provisional() {
            if let Some(pending) = self.pending.get(&call_id) {
                pending.responded.store(true, Ordering::Release);
            }
            return;
        }

        let Some((_, pending)) = self.pending.remove(&call_id) else {
            tracing::debug!(target: "gb28181::sip", %call_id, status = response.status_code, "Response without pending transaction");
            return;
        };
        pending.responded.store(true, Ordering::Release);

        let outcome = if response.is_success() {
            SipOutcome::Success {
                call_id,
                status_code: response.status_code,
                reason: response.reason,
            }
        } else {
            tracing::warn!(
                target: "gb28181::sip",
                %call_id,
                method = %pending.method,
                status = response.status_code,
                "SIP request rejected"
            );
            SipOutcome::failed(Some(call_id), response.status_code, response.reason)
        };
        let _ = pending.completion.send(outcome);
    }

    fn on_transaction_timeout(&self, call_id: &str) {
        if let Some((call_id, pending)) = self.pending.remove(call_id) {
            tracing::warn!(target: "gb28181::sip", %call_id, method = %pending.method, "SIP transaction timed out");
            let _ = pending
                .completion
                .send(SipOutcome::failed(Some(call_id), 408, "SIP transaction timed out"));
        }
    }

    // ---------------------------------------------------------------
    // 出站请求
    // ---------------------------------------------------------------

    /// 向设备发送 MANSCDP MESSAGE 并等待应答
    pub async fn send_message(&self, device: &Device, body: String) -> SipOutcome {
        let target = match self.prepare("MESSAGE", device).await {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        let mut request = self.new_request(SipMethod::Message, &device.device_id, &target);
        request.set_body(manscdp::CONTENT_TYPE, body);
        self.send_transaction(request, target, None, "waiting for device response timed out")
            .await
    }

    /// 发送 SUBSCRIBE；expires 为 0 表示取消订阅，call_id 传入时复用原订阅的 Call-ID
    pub async fn send_subscribe(
        &self,
        device: &Device,
        event: &str,
        expires: u32,
        call_id: Option<&str>,
    ) -> SipOutcome {
        let target = match self.prepare("SUBSCRIBE", device).await {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        let mut request = self.new_request(SipMethod::Subscribe, &device.device_id, &target);
        if let Some(call_id) = call_id {
            request.headers.set("Call-ID", call_id);
        }
        request.add_header("Expires", expires.to_string());
        request.add_header("Event", event);
        let body = manscdp::build_query(event, self.next_sn(), &device.device_id, "");
        request.set_body(manscdp::CONTENT_TYPE, body);
        self.send_transaction(request, target, None, "waiting for device response timed out")
            .await
    }

    pub async fn query_catalog(&self, device: &Device) -> SipOutcome {
        let body = manscdp::build_query("Catalog", self.next_sn(), &device.device_id, "");
        self.send_message(device, body).await
    }

    pub async fn query_device_info(&self, device: &Device) -> SipOutcome {
        let body = manscdp::build_query("DeviceInfo", self.next_sn(), &device.device_id, "");
        self.send_message(device, body).await
    }

    /// 录像检索，时间格式 yyyy-MM-ddTHH:mm:ss
    pub async fn query_record_info(
        &self,
        device: &Device,
        channel_id: &str,
        start_time: &str,
        end_time: &str,
    ) -> SipOutcome {
        let extra = manscdp::record_info_extra(start_time, end_time);
        let body = manscdp::build_query("RecordInfo", self.next_sn(), channel_id, &extra);
        self.send_message(device, body).await
    }

    pub async fn ptz(&self, device: &Device, channel_id: &str, command: PtzCommand) -> SipOutcome {
        let ptz_cmd = command.encode(ptz::address_of(channel_id));
        let body = manscdp::build_ptz_control(self.next_sn(), channel_id, &ptz_cmd);
        tracing::info!(
            target: "gb28181::sip",
            device_id = %device.device_id,
            %channel_id,
            action = ?command.action,
            %ptz_cmd,
            "PTZ control"
        );
        self.send_message(device, body).await
    }

    async fn prepare(&self, action: &str, device: &Device) -> std::result::Result<Endpoint, SipOutcome> {
        if !self.config.enabled {
            return Err(SipOutcome::Skipped {
                reason: format!("GB28181 signaling disabled, {} skipped", action),
            });
        }
        if !self.is_ready() {
            return Err(SipOutcome::NotReady);
        }
        resolve(&device.ip, device.port, device.transport)
            .await
            .map_err(|e| {
                SipOutcome::failed(
                    None,
                    500,
                    format!("cannot resolve {}:{}: {}", device.ip, device.port, e),
                )
            })
    }

    /// 登记事务、发送、等待；UDP 下按 T1 翻倍重传直到收到任何响应
    async fn send_transaction(
        &self,
        request: SipRequest,
        target: Endpoint,
        context: Option<DialogContext>,
        timeout_reason: &str,
    ) -> SipOutcome {
        let Some(transport) = self.transport.load_full() else {
            return SipOutcome::NotReady;
        };
        let Some(call_id) = request.call_id().map(str::to_string) else {
            return SipOutcome::failed(None, 500, "request without Call-ID");
        };

        let method = request.method.clone();
        let data = request.encode();
        let (tx, mut rx) = oneshot::channel();
        let responded = Arc::new(AtomicBool::new(false));
        self.pending.insert(
            call_id.clone(),
            PendingTransaction {
                method: method.clone(),
                request,
                target,
                completion: tx,
                responded: responded.clone(),
                context,
            },
        );

        if let Err(e) = transport.send(data.as_bytes(), &target).await {
            self.pending.remove(&call_id);
            tracing::warn!(target: "gb28181::sip", %call_id, %method, remote = %target.addr, error = %e, "SIP send failed");
            return SipOutcome::failed(Some(call_id), 500, format!("{} send failed: {}", method, e));
        }

        if target.transport == Transport::Udp {
            self.spawn_retransmit(transport, data, target, call_id.clone(), responded);
        }

        let wait = Duration::from_millis(self.config.invite_timeout_ms);
        match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => SipOutcome::failed(Some(call_id), 500, SHUTTING_DOWN),
            Err(_) => {
                if self.pending.remove(&call_id).is_some() {
                    tracing::warn!(target: "gb28181::sip", %call_id, %method, ?wait, "{}", timeout_reason);
                    SipOutcome::failed(Some(call_id), 408, timeout_reason)
                } else {
                    // 其他路径已取走事务，结果即将写入
                    rx.await
                        .unwrap_or_else(|_| SipOutcome::failed(Some(call_id), 500, SHUTTING_DOWN))
                }
            }
        }
    }

    fn spawn_retransmit(
        &self,
        transport: Arc<SipTransport>,
        data: String,
        target: Endpoint,
        call_id: String,
        responded: Arc<AtomicBool>,
    ) {
        let pending = self.pending.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = T1;
            loop {
                tokio::time::sleep(interval).await;
                if responded.load(Ordering::Acquire) || !pending.contains_key(&call_id) {
                    return;
                }
                if started.elapsed() >= TRANSACTION_TIMEOUT {
                    let _ = events.send(SipEvent::TransactionTimeout { call_id });
                    return;
                }
                if let Err(e) = transport.send(data.as_bytes(), &target).await {
                    tracing::debug!(target: "gb28181::sip", %call_id, error = %e, "SIP retransmit failed");
                }
                interval = (interval * 2).min(T2);
            }
        });
    }

    fn new_request(&self, method: SipMethod, user: &str, target: &Endpoint) -> SipRequest {
        let announce_ip = self.config.announce_ip();
        let server_id = &self.config.server_id;
        let domain = &self.config.domain;

        let mut request = SipRequest::new(method.clone(), format!("sip:{}@{}", user, target.addr));
        request.add_header("Via", self.via(target.transport));
        request.add_header("From", format!("<sip:{}@{}>;tag={}", server_id, domain, new_tag()));
        request.add_header("To", format!("<sip:{}@{}>", user, domain));
        request.add_header("Call-ID", format!("{}@{}", Uuid::new_v4().simple(), announce_ip));
        request.add_header("CSeq", format!("{} {}", self.next_cseq(), method));
        request.add_header("Max-Forwards", "70");
        request.add_header(
            "Contact",
            format!("<sip:{}@{}:{}>", server_id, announce_ip, self.local_port()),
        );
        request.add_header("User-Agent", self.config.user_agent.clone());
        request
    }

    fn in_dialog_request(&self, dialog: &Dialog, method: SipMethod, cseq: u32) -> SipRequest {
        let mut request = SipRequest::new(method.clone(), dialog.remote_target.clone());
        request.add_header("Via", self.via(dialog.peer.transport));
        request.add_header("From", dialog.local.clone());
        request.add_header("To", dialog.remote.clone());
        request.add_header("Call-ID", dialog.call_id.clone());
        request.add_header("CSeq", format!("{} {}", cseq, method));
        request.add_header("Max-Forwards", "70");
        request.add_header("User-Agent", self.config.user_agent.clone());
        request
    }

    fn non_2xx_ack(&self, invite: &SipRequest, response: &SipResponse) -> SipRequest {
        let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
        for name in ["Via", "From"] {
            if let Some(value) = invite.header(name) {
                ack.add_header(name, value.to_string());
            }
        }
        if let Some(to) = response.header("To").or_else(|| invite.header("To")) {
            ack.add_header("To", to.to_string());
        }
        if let Some(call_id) = invite.call_id() {
            ack.add_header("Call-ID", call_id.to_string());
        }
        let cseq = invite.cseq().map(|(n, _)| n).unwrap_or_default();
        ack.add_header("CSeq", format!("{} ACK", cseq));
        ack.add_header("Max-Forwards", "70");
        ack
    }

    fn via(&self, transport: Transport) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch=z9hG4bK{}",
            transport,
            self.config.announce_ip(),
            self.local_port(),
            new_branch()
        )
    }

    fn local_port(&self) -> u16 {
        self.local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.local_port)
    }

    fn response_for(&self, request: &SipRequest, code: u16, reason: &str) -> SipResponse {
        let mut response = SipResponse::for_request(request, code, reason);
        if let Some(to) = response.header("To").map(str::to_string) {
            if header::tag(&to).is_none() {
                response.headers.set("To", format!("{};tag={}", to, new_tag()));
            }
        }
        response.add_header("User-Agent", self.config.user_agent.clone());
        response
    }

    async fn reply(&self, request: &SipRequest, peer: &Endpoint, code: u16, reason: &str) -> Result<()> {
        let response = self.response_for(request, code, reason);
        self.send_raw(response.encode().as_bytes(), peer).await
    }

    async fn reply_not_allowed(&self, request: &SipRequest, peer: &Endpoint) -> Result<()> {
        let mut response = self.response_for(request, 405, "Method Not Allowed");
        response.add_header("Allow", "REGISTER, MESSAGE, NOTIFY, OPTIONS, SUBSCRIBE, BYE, ACK, CANCEL");
        self.send_raw(response.encode().as_bytes(), peer).await
    }

    async fn send_raw(&self, data: &[u8], target: &Endpoint) -> Result<()> {
        let transport = self.transport.load_full().ok_or(Gb28181Error::NotReady)?;
        transport.send(data, target).await?;
        Ok(())
    }
}

#[async_trait]
impl Signaling for SignalingEngine {
    async fn invite(&self, command: InviteCommand) -> SipOutcome {
        if !self.config.enabled {
            return SipOutcome::Skipped {
                reason: "GB28181 signaling disabled, INVITE skipped".to_string(),
            };
        }
        if !self.is_ready() {
            return SipOutcome::NotReady;
        }
        let target = match resolve(&command.host, command.port, command.signaling).await {
            Ok(target) => target,
            Err(e) => {
                return SipOutcome::failed(
                    None,
                    500,
                    format!("cannot resolve {}:{}: {}", command.host, command.port, e),
                )
            }
        };

        let server_id = &self.config.server_id;
        let media_ip = &self.config.media_ip;
        let sdp = match command.playback {
            Some(range) => SdpOffer::playback(
                &command.channel_id,
                media_ip,
                command.rtp_port,
                command.stream,
                &command.ssrc,
                range,
            ),
            None => SdpOffer::play(server_id, media_ip, command.rtp_port, command.stream, &command.ssrc),
        };

        let mut request = self.new_request(SipMethod::Invite, &command.channel_id, &target);
        request.add_header(
            "Subject",
            format!("{}:{},{}:0", command.channel_id, command.ssrc, server_id),
        );
        request.set_body("application/sdp", sdp.encode());

        tracing::info!(
            target: "gb28181::sip",
            device_id = %command.device_id,
            channel_id = %command.channel_id,
            call_id = ?request.call_id(),
            ssrc = %command.ssrc,
            rtp_port = command.rtp_port,
            remote = %target.addr,
            "Sending INVITE"
        );

        let context = DialogContext {
            device_id: command.device_id.clone(),
            channel_id: command.channel_id.clone(),
        };
        self.send_transaction(request, target, Some(context), "INVITE wait timed out")
            .await
    }

    fn dialog_active(&self, call_id: &str) -> bool {
        self.dialogs
            .get(call_id)
            .is_some_and(|d| d.state == DialogState::Confirmed)
    }

    async fn bye(&self, call_id: &str) {
        let Some((_, dialog)) = self.dialogs.remove(call_id) else {
            tracing::debug!(target: "gb28181::sip", %call_id, "BYE skipped, no dialog");
            return;
        };
        if dialog.state == DialogState::Terminated {
            return;
        }

        let request = self.in_dialog_request(&dialog, SipMethod::Bye, self.next_cseq());
        match self.send_raw(request.encode().as_bytes(), &dialog.peer).await {
            Ok(()) => tracing::info!(
                target: "gb28181::sip",
                %call_id,
                device_id = %dialog.device_id,
                channel_id = %dialog.channel_id,
                "BYE sent"
            ),
            Err(e) => tracing::warn!(target: "gb28181::sip", %call_id, error = %e, "BYE send failed"),
        }
    }

    fn next_ssrc(&self) -> String {
        self.ssrc.next()
    }

    fn next_playback_ssrc(&self) -> String {
        self.ssrc.next_playback()
    }

    async fn playback_control(&self, call_id: &str, control: PlaybackControl) -> Result<()> {
        let dialog = self
            .dialogs
            .get(call_id)
            .map(|d| d.clone())
            .ok_or_else(|| Gb28181Error::not_found(format!("dialog not found: {}", call_id)))?;
        if dialog.state == DialogState::Terminated {
            return Err(Gb28181Error::Gone(format!("dialog terminated: {}", call_id)));
        }

        let mut request = self.in_dialog_request(&dialog, SipMethod::Info, self.next_cseq());
        request.set_body(mansrtsp::CONTENT_TYPE, control.encode(self.next_cseq()));
        self.send_raw(request.encode().as_bytes(), &dialog.peer)
            .await
            .map_err(|e| Gb28181Error::upstream(format!("INFO send failed: {}", e)))?;

        tracing::info!(target: "gb28181::sip", %call_id, ?control, "INFO sent");
        Ok(())
    }
}

#[async_trait]
impl Resource for SignalingEngine {
    async fn cleanup(&self) -> std::result::Result<(), ResourceError> {
        self.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "gb28181-sip"
    }

    fn priority(&self) -> u32 {
        90
    }
}

async fn resolve(host: &str, port: u16, transport: Transport) -> io::Result<Endpoint> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?;
    Ok(Endpoint { addr, transport })
}

/// 20 位数字国标编码
fn is_gb_code(id: &str) -> bool {
    id.len() == 20 && id.bytes().all(|b| b.is_ascii_digit())
}

fn new_tag() -> String {
    format!("{:010x}", rand::random::<u64>() & 0xFF_FFFF_FFFF)
}

fn new_branch() -> String {
    format!("{:016x}", rand::random::<u64>())
}
