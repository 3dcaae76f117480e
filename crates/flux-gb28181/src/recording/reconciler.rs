// 后台录像对账
//
// 每轮计算目标集合 {在线设备的全部通道}，对目标调用 ensure_background，
// 对已不在目标中的托管通道调用 release_background。单通道失败只记录错误，下一轮自动重试。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::policy::StoragePolicyRef;
use crate::directory::{Codec, DeviceDirectoryRef};
use crate::error::Result;
use crate::media::MediaGatewayRef;
use crate::preview::session::{stream_id_for, SessionKey};
use crate::preview::PreviewOrchestrator;

/// 单轮对账结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub desired: usize,
    pub ensured: usize,
    pub failed: usize,
    pub released: usize,
}

/// 通道录像状态快照
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub device_id: String,
    pub device_name: String,
    pub device_online: bool,
    pub channel_id: String,
    pub channel_name: String,
    pub channel_codec: Codec,
    pub target_recording: bool,
    pub managed: bool,
    pub session_active: bool,
    pub stream_ready: bool,
    pub recording_enabled: bool,
    pub recording: bool,
    pub background_pinned: bool,
    pub viewer_count: u32,
    pub app: String,
    pub stream_id: String,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ReconcileState {
    managed: BTreeSet<(String, String)>,
    last_errors: HashMap<(String, String), String>,
    updated_at: HashMap<(String, String), DateTime<Utc>>,
}

pub struct Reconciler {
    directory: DeviceDirectoryRef,
    preview: Arc<PreviewOrchestrator>,
    media: MediaGatewayRef,
    policy: StoragePolicyRef,
    state: Mutex<ReconcileState>,
    /// 保证各轮不重叠
    ticking: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        directory: DeviceDirectoryRef,
        preview: Arc<PreviewOrchestrator>,
        media: MediaGatewayRef,
        policy: StoragePolicyRef,
    ) -> Self {
        Self {
            directory,
            preview,
            media,
            policy,
            state: Mutex::new(ReconcileState::default()),
            ticking: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReconcileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let _ticking = self.ticking.lock().await;

        if !self.policy.record_enabled() {
            return Ok(self.release_all().await);
        }

        let desired = self.desired().await?;
        let mut report = TickReport {
            desired: desired.len(),
            ..TickReport::default()
        };

        for key in &desired {
            let (device_id, channel_id) = key;
            let result = self.preview.ensure_background(device_id, channel_id).await;
            let mut state = self.state();
            state.updated_at.insert(key.clone(), Utc::now());
            match result {
                Ok(()) => {
                    state.managed.insert(key.clone());
                    state.last_errors.remove(key);
                    report.ensured += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "gb28181::record",
                        %device_id,
                        %channel_id,
                        error = %e,
                        "Ensure background recording failed"
                    );
                    state.last_errors.insert(key.clone(), e.to_string());
                    report.failed += 1;
                }
            }
        }

        let stale: Vec<(String, String)> = self
            .state()
            .managed
            .iter()
            .filter(|key| !desired.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            let result = self.preview.release_background(&key.0, &key.1).await;
            let mut state = self.state();
            // 释放失败也移出托管，避免通道卡死在反复失败的设备上
            state.managed.remove(&key);
            state.updated_at.remove(&key);
            match result {
                Ok(()) => {
                    state.last_errors.remove(&key);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "gb28181::record",
                        device_id = %key.0,
                        channel_id = %key.1,
                        error = %e,
                        "Release background recording failed"
                    );
                    state.last_errors.insert(key.clone(), e.to_string());
                }
            }
            report.released += 1;
        }

        if report.failed > 0 || report.released > 0 {
            tracing::info!(
                target: "gb28181::record",
                desired = report.desired,
                ensured = report.ensured,
                failed = report.failed,
                released = report.released,
                "Recording reconcile tick"
            );
        }
        Ok(report)
    }

    async fn desired(&self) -> Result<BTreeSet<(String, String)>> {
        let mut desired = BTreeSet::new();
        for device in self.directory.list_devices().await? {
            if !device.online {
                continue;
            }
            for channel in self.directory.list_channels(&device.device_id).await? {
                desired.insert((device.device_id.clone(), channel.channel_id));
            }
        }
        Ok(desired)
    }

    async fn release_all(&self) -> TickReport {
        let managed: Vec<(String, String)> = {
            let mut state = self.state();
            state.last_errors.clear();
            state.updated_at.clear();
            std::mem::take(&mut state.managed).into_iter().collect()
        };

        let mut report = TickReport::default();
        for (device_id, channel_id) in managed {
            if let Err(e) = self.preview.release_background(&device_id, &channel_id).await {
                tracing::warn!(
                    target: "gb28181::record",
                    %device_id,
                    %channel_id,
                    error = %e,
                    "Release managed recording failed"
                );
            }
            report.released += 1;
        }
        if report.released > 0 {
            tracing::info!(target: "gb28181::record", count = report.released, "Recording disabled, managed sessions released");
        }
        report
    }

    /// 只读快照，按设备 ID、通道 ID 排序
    pub async fn list_statuses(&self) -> Result<Vec<RecordingStatus>> {
        let record_enabled = self.policy.record_enabled();
        let default_app = self.media.default_app().to_string();

        let mut rows = BTreeMap::new();
        for device in self.directory.list_devices().await? {
            for channel in self.directory.list_channels(&device.device_id).await? {
                let key = (device.device_id.clone(), channel.channel_id.clone());
                let runtime = self.preview.channel_runtime(&key.0, &key.1);
                let (app, stream_id) = match &runtime {
                    Some(r) => (r.app.clone(), r.stream_id.clone()),
                    None => (default_app.clone(), stream_id_for(&channel.channel_id)),
                };

                let (stream_ready, recording) = futures::future::join(
                    self.media.is_stream_ready(&app, &stream_id),
                    self.media.is_recording(&app, &stream_id),
                )
                .await;
                let stream_ready = stream_ready.unwrap_or(false);
                let recording = recording.unwrap_or(false);
                let target_recording = record_enabled && device.online;

                let (managed, last_error, updated_at) = {
                    let state = self.state();
                    (
                        state.managed.contains(&key),
                        state.last_errors.get(&key).cloned(),
                        state.updated_at.get(&key).copied(),
                    )
                };

                rows.insert(
                    key,
                    RecordingStatus {
                        device_id: device.device_id.clone(),
                        device_name: device.name.clone(),
                        device_online: device.online,
                        channel_id: channel.channel_id.clone(),
                        channel_name: channel.name.clone(),
                        channel_codec: channel.codec,
                        target_recording,
                        managed,
                        session_active: runtime.is_some() || stream_ready,
                        stream_ready,
                        recording_enabled: runtime
                            .as_ref()
                            .map_or(target_recording, |r| r.recording),
                        recording,
                        background_pinned: runtime.as_ref().map_or(false, |r| r.pinned),
                        viewer_count: runtime.as_ref().map_or(0, |r| r.viewers),
                        app,
                        stream_id,
                        last_error,
                        updated_at,
                    },
                );
            }
        }
        Ok(rows.into_values().collect())
    }

    /// 当前托管的通道
    pub fn managed(&self) -> Vec<SessionKey> {
        self.state()
            .managed
            .iter()
            .map(|(d, c)| SessionKey::new(d, c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DeviceDirectory, MemoryDirectory};
    use crate::recording::StoragePolicy;
    use crate::testing::{add_device, MockMedia, MockSignaling, CHANNEL_ID, DEVICE_ID, H265_CHANNEL_ID};
    use flux_config::{PreviewConfig, RecordingConfig};

    const OFFLINE_DEVICE: &str = "34020000001320000002";
    const OFFLINE_CHANNEL: &str = "34020000001310000021";

    struct Fixture {
        reconciler: Reconciler,
        directory: Arc<MemoryDirectory>,
        signaling: Arc<MockSignaling>,
        media: Arc<MockMedia>,
        policy: Arc<StoragePolicy>,
        preview: Arc<PreviewOrchestrator>,
    }

    async fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        add_device(
            &directory,
            DEVICE_ID,
            true,
            &[(CHANNEL_ID, Codec::H264), (H265_CHANNEL_ID, Codec::H265)],
        )
        .await;
        add_device(&directory, OFFLINE_DEVICE, false, &[(OFFLINE_CHANNEL, Codec::H264)]).await;

        let signaling = Arc::new(MockSignaling::default());
        let media = Arc::new(MockMedia::default());
        let policy = Arc::new(StoragePolicy::new(RecordingConfig {
            record_enabled: true,
            ..RecordingConfig::default()
        }));
        let preview = Arc::new(PreviewOrchestrator::new(
            directory.clone(),
            signaling.clone(),
            media.clone(),
            policy.clone(),
            PreviewConfig::default(),
        ));
        let reconciler = Reconciler::new(directory.clone(), preview.clone(), media.clone(), policy.clone());
        Fixture {
            reconciler,
            directory,
            signaling,
            media,
            policy,
            preview,
        }
    }

    #[tokio::test]
    async fn test_tick_converges_to_online_channels() {
        let f = fixture().await;

        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(
            report,
            TickReport {
                desired: 2,
                ensured: 2,
                failed: 0,
                released: 0
            }
        );
        assert_eq!(f.reconciler.managed().len(), 2);
        assert_eq!(f.signaling.invite_count(), 2);
        assert_eq!(f.media.record_started.lock().unwrap().len(), 2);

        // 幂等：再跑一轮不产生新的 INVITE
        f.reconciler.tick().await.unwrap();
        assert_eq!(f.signaling.invite_count(), 2);

        f.directory.set_online(DEVICE_ID, false).await.unwrap();
        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.released, 2);
        assert!(f.reconciler.managed().is_empty());
        assert_eq!(f.signaling.bye_count(), 2);
        assert!(f.preview.list().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retried() {
        let f = fixture().await;
        let failing = stream_id_for(H265_CHANNEL_ID);
        f.media.fail_streams.lock().unwrap().insert(failing.clone());

        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.ensured, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            f.reconciler.managed(),
            vec![SessionKey::new(DEVICE_ID, CHANNEL_ID)]
        );

        let statuses = f.reconciler.list_statuses().await.unwrap();
        let failed_row = statuses
            .iter()
            .find(|s| s.channel_id == H265_CHANNEL_ID)
            .unwrap();
        assert!(!failed_row.managed);
        assert!(failed_row.last_error.as_deref().unwrap().contains("mock"));

        f.media.fail_streams.lock().unwrap().clear();
        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(f.reconciler.managed().len(), 2);
        let statuses = f.reconciler.list_statuses().await.unwrap();
        assert!(statuses.iter().all(|s| s.last_error.is_none()));
    }

    #[tokio::test]
    async fn test_disabled_policy_releases_everything() {
        let f = fixture().await;
        f.reconciler.tick().await.unwrap();
        assert_eq!(f.reconciler.managed().len(), 2);

        f.policy
            .update(RecordingConfig {
                record_enabled: false,
                ..RecordingConfig::default()
            })
            .unwrap();
        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.released, 2);
        assert!(f.reconciler.managed().is_empty());
        assert_eq!(f.media.close_count(), 2);
        assert_eq!(f.media.record_stopped.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_statuses_snapshot() {
        let f = fixture().await;
        f.reconciler.tick().await.unwrap();

        let statuses = f.reconciler.list_statuses().await.unwrap();
        assert_eq!(statuses.len(), 3);
        let order: Vec<(&str, &str)> = statuses
            .iter()
            .map(|s| (s.device_id.as_str(), s.channel_id.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (DEVICE_ID, CHANNEL_ID),
                (DEVICE_ID, H265_CHANNEL_ID),
                (OFFLINE_DEVICE, OFFLINE_CHANNEL)
            ]
        );

        let live = &statuses[0];
        assert!(live.target_recording);
        assert!(live.managed);
        assert!(live.session_active);
        assert!(live.stream_ready);
        assert!(live.recording);
        assert!(live.background_pinned);
        assert_eq!(live.viewer_count, 0);
        assert_eq!(live.stream_id, format!("ch{}", CHANNEL_ID));

        let offline = &statuses[2];
        assert!(!offline.target_recording);
        assert!(!offline.managed);
        assert!(!offline.session_active);
        assert!(!offline.recording_enabled);
        assert_eq!(offline.app, "rtp");
    }
}
