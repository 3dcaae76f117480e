// 设备查询、云台控制与事件订阅

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::directory::{Device, DeviceDirectoryRef};
use crate::error::{Gb28181Error, Result};
use crate::sip::{PtzAction, PtzCommand, SignalingEngine, SipOutcome};

pub const DEFAULT_SUBSCRIBE_EXPIRES: u32 = 3600;
pub const MAX_SUBSCRIBE_EXPIRES: u32 = 24 * 3600;

const GB_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// 录像检索请求，时间为空时取最近 24 小时
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtzRequest {
    #[serde(default)]
    pub channel_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub speed: Option<i64>,
    #[serde(default)]
    pub preset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub device_id: String,
    pub event_type: String,
    #[serde(default)]
    pub expires: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: u64,
    pub device_id: String,
    pub event_type: String,
    pub call_id: Option<String>,
    pub expires: u32,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.updated_at + Duration::seconds(i64::from(self.expires)) <= now
    }
}

pub struct DeviceControl {
    directory: DeviceDirectoryRef,
    engine: Arc<SignalingEngine>,
    subscriptions: DashMap<u64, Subscription>,
    next_id: AtomicU64,
}

impl DeviceControl {
    pub fn new(directory: DeviceDirectoryRef, engine: Arc<SignalingEngine>) -> Self {
        Self {
            directory,
            engine,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn query_catalog(&self, device_id: &str) -> Result<SipOutcome> {
        let device = self.device(device_id).await?;
        ready(self.engine.query_catalog(&device).await)
    }

    pub async fn query_device_info(&self, device_id: &str) -> Result<SipOutcome> {
        let device = self.device(device_id).await?;
        ready(self.engine.query_device_info(&device).await)
    }

    pub async fn query_records(&self, device_id: &str, query: RecordQuery) -> Result<SipOutcome> {
        let device = self.device(device_id).await?;
        let now = Utc::now();
        let start_time = non_blank(query.start_time)
            .unwrap_or_else(|| (now - Duration::hours(24)).format(GB_TIME_FORMAT).to_string());
        let end_time = non_blank(query.end_time).unwrap_or_else(|| now.format(GB_TIME_FORMAT).to_string());
        let channel_id = non_blank(query.channel_id).unwrap_or_else(|| device.device_id.clone());
        ready(
            self.engine
                .query_record_info(&device, &channel_id, &start_time, &end_time)
                .await,
        )
    }

    pub async fn ptz(&self, device_id: &str, request: PtzRequest) -> Result<SipOutcome> {
        let device = self.device(device_id).await?;
        if !device.online {
            return Err(Gb28181Error::validation(format!(
                "device offline, PTZ unavailable: {}",
                device_id
            )));
        }
        let command = PtzCommand::new(PtzAction::parse(&request.action)?, request.speed, request.preset)?;
        let channel_id = non_blank(request.channel_id).unwrap_or_else(|| device.device_id.clone());
        ready(self.engine.ptz(&device, &channel_id, command).await)
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription> {
        let device = self.device(&request.device_id).await?;
        let event_type = normalize_event_type(&request.event_type)?;
        let expires = normalize_expires(request.expires);

        let call_id = self
            .engine
            .send_subscribe(&device, event_type, expires, None)
            .await
            .into_result("SUBSCRIBE")?;

        let now = Utc::now();
        let subscription = Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            device_id: device.device_id.clone(),
            event_type: event_type.to_string(),
            call_id,
            expires,
            status: SubscriptionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(
            target: "gb28181::sip",
            id = subscription.id,
            device_id = %subscription.device_id,
            %event_type,
            expires,
            "Subscription created"
        );
        self.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    /// 发送 Expires: 0 的 SUBSCRIBE，记录保留并标记为 INACTIVE
    pub async fn unsubscribe(&self, id: u64) -> Result<Subscription> {
        let subscription = self
            .subscriptions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Gb28181Error::not_found(format!("subscription not found: {}", id)))?;
        let device = self.device(&subscription.device_id).await?;

        self.engine
            .send_subscribe(
                &device,
                &subscription.event_type,
                0,
                subscription.call_id.as_deref(),
            )
            .await
            .into_result("unsubscribe")?;

        let mut entry = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| Gb28181Error::not_found(format!("subscription not found: {}", id)))?;
        entry.status = SubscriptionStatus::Inactive;
        entry.updated_at = Utc::now();
        tracing::info!(target: "gb28181::sip", id, device_id = %entry.device_id, "Subscription cancelled");
        Ok(entry.clone())
    }

    pub fn subscriptions(&self, device_id: Option<&str>) -> Vec<Subscription> {
        let mut list: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| device_id.map_or(true, |d| s.device_id == d))
            .map(|s| s.value().clone())
            .collect();
        list.sort_by(|a, b| b.id.cmp(&a.id));
        list
    }

    /// 把到期的订阅标记为 EXPIRED，返回标记数量
    pub fn expire_subscriptions(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for mut entry in self.subscriptions.iter_mut() {
            if entry.is_expired(now) {
                entry.status = SubscriptionStatus::Expired;
                entry.updated_at = now;
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(target: "gb28181::sip", expired, "Subscriptions expired");
        }
        expired
    }

    async fn device(&self, device_id: &str) -> Result<Device> {
        self.directory
            .find_device(device_id)
            .await?
            .ok_or_else(|| Gb28181Error::not_found(format!("device not found: {}", device_id)))
    }
}

/// 信令未就绪时报 503，其余结果原样返回给调用方
fn ready(outcome: SipOutcome) -> Result<SipOutcome> {
    match outcome {
        SipOutcome::NotReady => Err(Gb28181Error::NotReady),
        other => Ok(other),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn normalize_event_type(value: &str) -> Result<&'static str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Gb28181Error::validation("eventType is required"));
    }
    ["Catalog", "Alarm", "MobilePosition"]
        .into_iter()
        .find(|t| t.eq_ignore_ascii_case(value))
        .ok_or_else(|| Gb28181Error::validation(format!("unsupported eventType: {}", value)))
}

pub fn normalize_expires(expires: Option<i64>) -> u32 {
    match expires {
        Some(e) if e > 0 => e.min(i64::from(MAX_SUBSCRIBE_EXPIRES)) as u32,
        _ => DEFAULT_SUBSCRIBE_EXPIRES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Codec, DeviceDirectory, MemoryDirectory};
    use crate::notify::NotificationStore;
    use crate::sip::{SipMessage, SipResponse};
    use crate::testing::{add_device, DEVICE_ID};
    use flux_config::SipConfig;
    use tokio::net::UdpSocket;

    async fn disabled_control() -> DeviceControl {
        let directory = Arc::new(MemoryDirectory::new());
        add_device(&directory, DEVICE_ID, true, &[("34020000001310000001", Codec::H264)]).await;
        add_device(&directory, "34020000001320000002", false, &[]).await;
        let engine = Arc::new(SignalingEngine::new(
            SipConfig {
                enabled: false,
                ..SipConfig::default()
            },
            directory.clone(),
            Arc::new(NotificationStore::default()),
        ));
        DeviceControl::new(directory, engine)
    }

    #[test]
    fn test_normalize_event_type() {
        assert_eq!(normalize_event_type("catalog").unwrap(), "Catalog");
        assert_eq!(normalize_event_type(" MOBILEPOSITION ").unwrap(), "MobilePosition");
        assert_eq!(normalize_event_type("Alarm").unwrap(), "Alarm");
        assert_eq!(normalize_event_type("Presence").unwrap_err().status_code(), 400);
        assert_eq!(normalize_event_type(" ").unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_normalize_expires() {
        assert_eq!(normalize_expires(None), 3600);
        assert_eq!(normalize_expires(Some(0)), 3600);
        assert_eq!(normalize_expires(Some(-5)), 3600);
        assert_eq!(normalize_expires(Some(600)), 600);
        assert_eq!(normalize_expires(Some(100_000)), 86400);
    }

    #[tokio::test]
    async fn test_subscription_lifecycle_with_signaling_disabled() {
        let control = disabled_control().await;

        let subscription = control
            .subscribe(SubscribeRequest {
                device_id: DEVICE_ID.to_string(),
                event_type: "alarm".to_string(),
                expires: Some(60),
            })
            .await
            .unwrap();
        assert_eq!(subscription.event_type, "Alarm");
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(subscription.call_id.is_none());

        let cancelled = control.unsubscribe(subscription.id).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Inactive);
        assert_eq!(control.subscriptions(Some(DEVICE_ID)).len(), 1);
        assert!(control.subscriptions(Some("34020000001320000002")).is_empty());

        assert_eq!(control.unsubscribe(999).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let control = disabled_control().await;
        let err = control
            .subscribe(SubscribeRequest {
                device_id: "34020000001320009999".to_string(),
                event_type: "Catalog".to_string(),
                expires: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        let err = control
            .subscribe(SubscribeRequest {
                device_id: DEVICE_ID.to_string(),
                event_type: "Weather".to_string(),
                expires: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_expire_subscriptions() {
        let control = disabled_control().await;
        let subscription = control
            .subscribe(SubscribeRequest {
                device_id: DEVICE_ID.to_string(),
                event_type: "Catalog".to_string(),
                expires: Some(30),
            })
            .await
            .unwrap();

        assert_eq!(control.expire_subscriptions(Utc::now()), 0);
        let later = Utc::now() + Duration::seconds(31);
        assert_eq!(control.expire_subscriptions(later), 1);
        assert_eq!(control.expire_subscriptions(later), 0);
        assert_eq!(
            control.subscriptions(None)[0].status,
            SubscriptionStatus::Expired
        );
        assert_eq!(control.subscriptions(None)[0].id, subscription.id);
    }

    #[tokio::test]
    async fn test_ptz_validation() {
        let control = disabled_control().await;
        let request = |action: &str| PtzRequest {
            channel_id: None,
            action: action.to_string(),
            speed: None,
            preset: None,
        };

        let err = control
            .ptz("34020000001320000002", request("UP"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = control.ptz(DEVICE_ID, request("SPIN")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = control.ptz(DEVICE_ID, request("PRESET_CALL")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let outcome = control.ptz(DEVICE_ID, request("LEFT")).await.unwrap();
        assert!(matches!(outcome, SipOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_not_started_engine_is_not_ready() {
        let directory = Arc::new(MemoryDirectory::new());
        add_device(&directory, DEVICE_ID, true, &[]).await;
        let engine = Arc::new(SignalingEngine::new(
            SipConfig::default(),
            directory.clone(),
            Arc::new(NotificationStore::default()),
        ));
        let control = DeviceControl::new(directory, engine);
        let err = control.query_catalog(DEVICE_ID).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_subscribe_over_udp() {
        let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device_socket.local_addr().unwrap();

        let directory = Arc::new(MemoryDirectory::new());
        let mut device = Device::new(DEVICE_ID, device_addr.ip().to_string(), device_addr.port());
        device.online = true;
        directory.register_device(device, vec![]).await.unwrap();

        let engine = Arc::new(SignalingEngine::new(
            SipConfig {
                bind_ip: "127.0.0.1".to_string(),
                local_ip: "127.0.0.1".to_string(),
                local_port: 0,
                enable_tcp: false,
                ..SipConfig::default()
            },
            directory.clone(),
            Arc::new(NotificationStore::default()),
        ));
        engine.start().await.unwrap();
        let control = DeviceControl::new(directory, engine.clone());

        // 设备端：记录收到的 SUBSCRIBE 并应答 200
        let responder = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 8192];
            while seen.len() < 2 {
                let (n, from) = device_socket.recv_from(&mut buf).await.unwrap();
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                if let Ok(SipMessage::Request(request)) = SipMessage::parse(&text) {
                    let response = SipResponse::for_request(&request, 200, "OK");
                    device_socket
                        .send_to(response.encode().as_bytes(), from)
                        .await
                        .unwrap();
                    let call_id = request.header("Call-ID").unwrap_or_default().to_string();
                    let expires = request.header("Expires").unwrap_or_default().to_string();
                    let event = request.header("Event").unwrap_or_default().to_string();
                    if seen.iter().all(|(c, e, _): &(String, String, String)| !(c == &call_id && e == &expires)) {
                        seen.push((call_id, expires, event));
                    }
                }
            }
            seen
        });

        let subscription = control
            .subscribe(SubscribeRequest {
                device_id: DEVICE_ID.to_string(),
                event_type: "MobilePosition".to_string(),
                expires: None,
            })
            .await
            .unwrap();
        assert!(subscription.call_id.is_some());
        control.unsubscribe(subscription.id).await.unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(3), responder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen[0].1, "3600");
        assert_eq!(seen[0].2, "MobilePosition");
        assert_eq!(seen[1].1, "0");
        assert_eq!(seen[0].0, seen[1].0);
        assert_eq!(Some(seen[0].0.as_str()), subscription.call_id.as_deref());

        engine.shutdown().await;
    }
}
