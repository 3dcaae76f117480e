// 编排层测试用的信令/流媒体替身，只计数不联网

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::directory::{Channel, Codec, Device, DeviceDirectory, MemoryDirectory, Transport};
use crate::error::{Gb28181Error, Result};
use crate::media::{MediaGateway, PlayUrls};
use crate::sip::{InviteCommand, PlaybackControl, Signaling, SipOutcome};

#[derive(Default)]
pub struct MockSignaling {
    pub invites: Mutex<Vec<InviteCommand>>,
    pub byes: Mutex<Vec<String>>,
    pub controls: Mutex<Vec<(String, PlaybackControl)>>,
    /// 下一次 INVITE 的结果，None 时返回成功
    pub outcome: Mutex<Option<SipOutcome>>,
    pub delay: Mutex<Option<Duration>>,
    /// 被对端挂断的对话
    pub hung_up: Mutex<HashSet<String>>,
    seq: AtomicU32,
}

impl MockSignaling {
    pub fn invite_count(&self) -> usize {
        self.invites.lock().unwrap().len()
    }

    pub fn bye_count(&self) -> usize {
        self.byes.lock().unwrap().len()
    }

    pub fn fail_next(&self, status_code: u16, reason: &str) {
        *self.outcome.lock().unwrap() = Some(SipOutcome::failed(None, status_code, reason));
    }

    pub fn hang_up(&self, call_id: &str) {
        self.hung_up.lock().unwrap().insert(call_id.to_string());
    }
}

#[async_trait]
impl Signaling for MockSignaling {
    async fn invite(&self, command: InviteCommand) -> SipOutcome {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        self.invites.lock().unwrap().push(command);
        self.outcome.lock().unwrap().take().unwrap_or(SipOutcome::Success {
            call_id: format!("call-{}", n),
            status_code: 200,
            reason: "OK".to_string(),
        })
    }

    async fn bye(&self, call_id: &str) {
        self.byes.lock().unwrap().push(call_id.to_string());
    }

    fn dialog_active(&self, call_id: &str) -> bool {
        !self.hung_up.lock().unwrap().contains(call_id)
    }

    fn next_ssrc(&self) -> String {
        format!("0{:09}", self.seq.load(Ordering::SeqCst) + 1)
    }

    fn next_playback_ssrc(&self) -> String {
        format!("1{:09}", self.seq.load(Ordering::SeqCst) + 1)
    }

    async fn playback_control(&self, call_id: &str, control: PlaybackControl) -> Result<()> {
        self.controls.lock().unwrap().push((call_id.to_string(), control));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMedia {
    pub opened: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<String>>,
    pub record_started: Mutex<Vec<(String, Option<String>)>>,
    pub record_stopped: Mutex<Vec<String>>,
    pub fail_open: AtomicBool,
    pub fail_record: AtomicBool,
    /// 对这些 stream 打开时报错
    pub fail_streams: Mutex<HashSet<String>>,
    /// 端口仍开着但设备已停止推流
    pub stalled: Mutex<HashSet<String>>,
    next_port: AtomicUsize,
}

impl MockMedia {
    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaGateway for MockMedia {
    async fn open_rtp_server(
        &self,
        stream_id: &str,
        _transport: Transport,
        _ssrc: Option<&str>,
    ) -> Result<u16> {
        if self.fail_open.load(Ordering::SeqCst)
            || self.fail_streams.lock().unwrap().contains(stream_id)
        {
            return Err(Gb28181Error::upstream("ZLMediaKit openRtpServer failed: mock"));
        }
        self.opened.lock().unwrap().push(stream_id.to_string());
        Ok(30000 + self.next_port.fetch_add(2, Ordering::SeqCst) as u16)
    }

    async fn close_rtp_server(&self, stream_id: &str) -> Result<()> {
        self.closed.lock().unwrap().push(stream_id.to_string());
        Ok(())
    }

    async fn is_stream_ready(&self, _app: &str, stream_id: &str) -> Result<bool> {
        if self.stalled.lock().unwrap().contains(stream_id) {
            return Ok(false);
        }
        let opened = self.opened.lock().unwrap().iter().filter(|s| *s == stream_id).count();
        let closed = self.closed.lock().unwrap().iter().filter(|s| *s == stream_id).count();
        Ok(opened > closed)
    }

    async fn start_record(
        &self,
        _app: &str,
        stream_id: &str,
        customized_path: Option<&str>,
    ) -> Result<()> {
        if self.fail_record.load(Ordering::SeqCst) {
            return Err(Gb28181Error::upstream("ZLMediaKit startRecord failed: mock"));
        }
        self.record_started
            .lock()
            .unwrap()
            .push((stream_id.to_string(), customized_path.map(str::to_string)));
        Ok(())
    }

    async fn stop_record(&self, _app: &str, stream_id: &str) -> Result<()> {
        self.record_stopped.lock().unwrap().push(stream_id.to_string());
        Ok(())
    }

    async fn is_recording(&self, _app: &str, stream_id: &str) -> Result<bool> {
        let started = self
            .record_started
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == stream_id)
            .count();
        let stopped = self
            .record_stopped
            .lock()
            .unwrap()
            .iter()
            .filter(|s| *s == stream_id)
            .count();
        Ok(started > stopped)
    }

    fn default_app(&self) -> &str {
        "rtp"
    }

    fn play_urls(&self, app: &str, stream_id: &str) -> PlayUrls {
        PlayUrls::build("http://127.0.0.1:8081", app, stream_id)
    }
}

pub const DEVICE_ID: &str = "34020000001320000001";
pub const CHANNEL_ID: &str = "34020000001310000001";
pub const H265_CHANNEL_ID: &str = "34020000001310000002";

/// 一台在线设备，通道 1 为 H.264，通道 2 为 H.265
pub async fn seeded_directory() -> Arc<MemoryDirectory> {
    let directory = Arc::new(MemoryDirectory::new());
    add_device(&directory, DEVICE_ID, true, &[(CHANNEL_ID, Codec::H264), (H265_CHANNEL_ID, Codec::H265)]).await;
    directory
}

pub async fn add_device(
    directory: &MemoryDirectory,
    device_id: &str,
    online: bool,
    channels: &[(&str, Codec)],
) {
    let mut device = Device::new(device_id, "192.168.1.64", 5060);
    device.name = format!("camera-{}", &device_id[device_id.len().saturating_sub(4)..]);
    device.online = online;
    let channels = channels
        .iter()
        .map(|(id, codec)| Channel {
            channel_id: id.to_string(),
            device_id: device_id.to_string(),
            name: id.to_string(),
            codec: *codec,
            online,
        })
        .collect();
    directory.register_device(device, channels).await.unwrap();
}
