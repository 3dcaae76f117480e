// GB28181 设备目录
// 设备/通道的权威存储，信令引擎在 REGISTER / 心跳 / Catalog 时回写

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use crate::error::Result;
use flux_config::DeviceSeed;

/// 信令/媒体传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl Transport {
    /// 未知值按 UDP 处理
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("TCP") {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "UDP"),
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// 视频编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Codec {
    #[default]
    H264,
    H265,
}

impl Codec {
    /// 从名称/编码描述推断，无法识别返回 None
    pub fn detect(value: &str) -> Option<Self> {
        let upper = value.to_ascii_uppercase();
        if upper.contains("265") || upper.contains("HEVC") {
            Some(Codec::H265)
        } else if upper.contains("264") || upper.contains("AVC") {
            Some(Codec::H264)
        } else {
            None
        }
    }

    /// 空值与未知值归一为 H264
    pub fn normalize(value: &str) -> Self {
        Self::detect(value).unwrap_or_default()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "H264"),
            Codec::H265 => write!(f, "H265"),
        }
    }
}

/// GB28181 设备
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// 设备 ID（20位国标编码）
    pub device_id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub transport: Transport,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub preferred_codec: Codec,
    pub online: bool,
    /// 最后一次注册或心跳
    pub last_seen: Option<DateTime<Utc>>,
    /// 注册有效期（秒）
    pub expires: u64,
    pub channel_count: usize,
}

impl Device {
    pub fn new(device_id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            device_id: device_id.into(),
            name: String::new(),
            ip: ip.into(),
            port,
            transport: Transport::Udp,
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            preferred_codec: Codec::H264,
            online: false,
            last_seen: None,
            expires: 3600,
            channel_count: 0,
        }
    }

    /// 距最后一次注册/心跳是否已超过有效期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.last_seen {
            Some(seen) => now.signed_duration_since(seen).num_seconds() > self.expires as i64,
            None => false,
        }
    }
}

/// 设备通道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// 通道 ID（20位国标编码）
    pub channel_id: String,
    pub device_id: String,
    pub name: String,
    pub codec: Codec,
    pub online: bool,
}

/// Catalog 应答中的一条通道记录
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogEntry {
    pub channel_id: String,
    pub name: String,
    /// 名称中携带编码信息时才有值
    pub codec: Option<Codec>,
    pub status: Option<String>,
}

/// DeviceInfo 应答
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProfile {
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
}

/// 设备目录
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// 返回设备是否存在
    async fn set_online(&self, device_id: &str, online: bool) -> Result<bool>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn list_channels(&self, device_id: &str) -> Result<Vec<Channel>>;

    /// 新增或替换设备（自动接入）
    async fn register_device(&self, device: Device, channels: Vec<Channel>) -> Result<()>;

    async fn update_endpoint(
        &self,
        device_id: &str,
        ip: &str,
        port: u16,
        transport: Transport,
    ) -> Result<bool>;

    /// 用 Catalog 结果整体替换通道列表
    async fn sync_catalog(&self, device_id: &str, entries: Vec<CatalogEntry>) -> Result<bool>;

    async fn update_profile(&self, device_id: &str, profile: DeviceProfile) -> Result<bool>;

    /// 超期未心跳的在线设备置离线，返回受影响的设备 ID
    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}

pub type DeviceDirectoryRef = std::sync::Arc<dyn DeviceDirectory>;

struct DeviceRecord {
    device: Device,
    channels: Vec<Channel>,
}

/// 进程内设备目录
#[derive(Default)]
pub struct MemoryDirectory {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从配置种子构建
    pub fn from_seeds(seeds: &[DeviceSeed], expires: u64) -> Self {
        let mut devices = HashMap::new();
        for seed in seeds {
            let mut device = Device::new(seed.device_id.trim(), seed.ip.clone(), seed.port);
            device.name = if seed.name.is_empty() {
                seed.device_id.clone()
            } else {
                seed.name.clone()
            };
            device.transport = Transport::parse(&seed.transport);
            device.manufacturer = seed.manufacturer.clone();
            device.preferred_codec = Codec::normalize(&seed.preferred_codec);
            device.expires = expires;

            let channels: Vec<Channel> = seed
                .channels
                .iter()
                .map(|c| Channel {
                    channel_id: c.channel_id.clone(),
                    device_id: device.device_id.clone(),
                    name: if c.name.is_empty() {
                        c.channel_id.clone()
                    } else {
                        c.name.clone()
                    },
                    codec: c
                        .codec
                        .as_deref()
                        .map(Codec::normalize)
                        .unwrap_or(device.preferred_codec),
                    online: false,
                })
                .collect();
            device.channel_count = channels.len();

            devices.insert(device.device_id.clone(), DeviceRecord { device, channels });
        }

        Self {
            devices: RwLock::new(devices),
        }
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        let devices = self.devices.read().await;
        Ok(devices.get(device_id).map(|r| r.device.clone()))
    }

    async fn set_online(&self, device_id: &str, online: bool) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            return Ok(false);
        };

        if record.device.online != online {
            tracing::info!(target: "gb28181::sip", %device_id, online, "Device status changed");
        }
        record.device.online = online;
        record.device.last_seen = Some(Utc::now());
        Ok(true)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = self.devices.read().await;
        let mut list: Vec<Device> = devices.values().map(|r| r.device.clone()).collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(list)
    }

    async fn list_channels(&self, device_id: &str) -> Result<Vec<Channel>> {
        let devices = self.devices.read().await;
        Ok(devices
            .get(device_id)
            .map(|r| r.channels.clone())
            .unwrap_or_default())
    }

    async fn register_device(&self, mut device: Device, channels: Vec<Channel>) -> Result<()> {
        device.channel_count = channels.len();
        let mut devices = self.devices.write().await;
        tracing::info!(target: "gb28181::sip", device_id = %device.device_id, "Device registered");
        devices.insert(device.device_id.clone(), DeviceRecord { device, channels });
        Ok(())
    }

    async fn update_endpoint(
        &self,
        device_id: &str,
        ip: &str,
        port: u16,
        transport: Transport,
    ) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            return Ok(false);
        };
        record.device.ip = ip.to_string();
        record.device.port = port;
        record.device.transport = transport;
        Ok(true)
    }

    async fn sync_catalog(&self, device_id: &str, entries: Vec<CatalogEntry>) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            return Ok(false);
        };

        let previous: HashMap<String, Codec> = record
            .channels
            .iter()
            .map(|c| (c.channel_id.clone(), c.codec))
            .collect();
        let preferred = record.device.preferred_codec;

        record.channels = entries
            .into_iter()
            .filter(|e| !e.channel_id.trim().is_empty())
            .map(|e| Channel {
                codec: e
                    .codec
                    .or_else(|| previous.get(&e.channel_id).copied())
                    .unwrap_or(preferred),
                name: if e.name.trim().is_empty() {
                    e.channel_id.clone()
                } else {
                    e.name
                },
                online: e.status.as_deref().map(is_online_status).unwrap_or(false),
                device_id: device_id.to_string(),
                channel_id: e.channel_id,
            })
            .collect();
        record.device.channel_count = record.channels.len();

        tracing::info!(
            target: "gb28181::sip",
            %device_id,
            channels = record.channels.len(),
            "Catalog synchronized"
        );
        Ok(true)
    }

    async fn update_profile(&self, device_id: &str, profile: DeviceProfile) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            return Ok(false);
        };
        let device = &mut record.device;
        if let Some(name) = profile.name {
            device.name = name;
        }
        if let Some(manufacturer) = profile.manufacturer {
            device.manufacturer = manufacturer;
        }
        if let Some(model) = profile.model {
            device.model = model;
        }
        if let Some(firmware) = profile.firmware {
            device.firmware = firmware;
        }
        Ok(true)
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut devices = self.devices.write().await;
        let mut expired = Vec::new();
        for record in devices.values_mut() {
            if record.device.online && record.device.is_expired(now) {
                record.device.online = false;
                expired.push(record.device.device_id.clone());
            }
        }
        Ok(expired)
    }
}

/// Catalog 通道状态：ON / ONLINE / 1 / OK 视为在线
pub fn is_online_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_uppercase().as_str(),
        "ON" | "ONLINE" | "1" | "OK"
    )
}
