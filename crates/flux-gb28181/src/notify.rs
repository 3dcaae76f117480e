// 设备主动上报（报警 / 移动位置 / 录像检索结果）
// 各类保留最近 1000 条，读取时新的在前

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::sip::manscdp::{extract_tag, item_blocks};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct AlarmEvent {
    pub device_id: String,
    pub channel_id: Option<String>,
    pub alarm_method: Option<String>,
    pub alarm_type: Option<String>,
    pub alarm_priority: Option<String>,
    pub alarm_time: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
    pub description: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl AlarmEvent {
    pub fn parse(device_id: &str, xml: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            channel_id: extract_tag(xml, "DeviceID"),
            alarm_method: extract_tag(xml, "AlarmMethod"),
            alarm_type: extract_tag(xml, "AlarmType"),
            alarm_priority: extract_tag(xml, "AlarmPriority"),
            alarm_time: extract_tag(xml, "AlarmTime"),
            longitude: extract_tag(xml, "Longitude"),
            latitude: extract_tag(xml, "Latitude"),
            description: extract_tag(xml, "AlarmDescription")
                .or_else(|| extract_tag(xml, "Description")),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub device_id: String,
    pub channel_id: Option<String>,
    pub time: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
    pub speed: Option<String>,
    pub direction: Option<String>,
    pub altitude: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl PositionEvent {
    pub fn parse(device_id: &str, xml: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            channel_id: extract_tag(xml, "DeviceID"),
            time: extract_tag(xml, "Time"),
            longitude: extract_tag(xml, "Longitude"),
            latitude: extract_tag(xml, "Latitude"),
            speed: extract_tag(xml, "Speed"),
            direction: extract_tag(xml, "Direction"),
            altitude: extract_tag(xml, "Altitude"),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordItem {
    pub device_id: String,
    pub channel_id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub secrecy: Option<String>,
    pub record_type: Option<String>,
    pub recorder_id: Option<String>,
    pub file_path: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl RecordItem {
    /// RecordInfo 应答中的全部 <Item>
    pub fn parse_all(device_id: &str, xml: &str) -> Vec<Self> {
        let now = Utc::now();
        item_blocks(xml)
            .into_iter()
            .map(|block| Self {
                device_id: device_id.to_string(),
                channel_id: extract_tag(block, "DeviceID"),
                name: extract_tag(block, "Name"),
                address: extract_tag(block, "Address"),
                start_time: extract_tag(block, "StartTime"),
                end_time: extract_tag(block, "EndTime"),
                secrecy: extract_tag(block, "Secrecy"),
                record_type: extract_tag(block, "Type"),
                recorder_id: extract_tag(block, "RecorderID"),
                file_path: extract_tag(block, "FilePath").or_else(|| extract_tag(block, "FileName")),
                received_at: now,
            })
            .collect()
    }
}

/// 上报存储
pub struct NotificationStore {
    capacity: usize,
    alarms: Mutex<VecDeque<AlarmEvent>>,
    positions: Mutex<VecDeque<PositionEvent>>,
    records: Mutex<VecDeque<RecordItem>>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl NotificationStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            alarms: Mutex::new(VecDeque::new()),
            positions: Mutex::new(VecDeque::new()),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_alarm(&self, event: AlarmEvent) {
        push_bounded(&self.alarms, self.capacity, std::iter::once(event));
    }

    pub fn push_position(&self, event: PositionEvent) {
        push_bounded(&self.positions, self.capacity, std::iter::once(event));
    }

    pub fn push_records(&self, items: Vec<RecordItem>) {
        push_bounded(&self.records, self.capacity, items);
    }

    pub fn alarms(&self, limit: Option<usize>) -> Vec<AlarmEvent> {
        latest(&self.alarms, limit)
    }

    pub fn positions(&self, limit: Option<usize>) -> Vec<PositionEvent> {
        latest(&self.positions, limit)
    }

    pub fn records(&self, limit: Option<usize>) -> Vec<RecordItem> {
        latest(&self.records, limit)
    }
}

fn push_bounded<T>(queue: &Mutex<VecDeque<T>>, capacity: usize, items: impl IntoIterator<Item = T>) {
    let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
    for item in items {
        if queue.len() == capacity {
            queue.pop_front();
        }
        queue.push_back(item);
    }
}

/// limit 缺省 100，范围 1..=1000
fn latest<T: Clone>(queue: &Mutex<VecDeque<T>>, limit: Option<usize>) -> Vec<T> {
    let limit = limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_LIMIT)
        .min(DEFAULT_CAPACITY);
    let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
    queue.iter().rev().take(limit).cloned().collect()
}
