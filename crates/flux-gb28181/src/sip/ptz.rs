// GB28181 PTZ 指令帧
// A5 0F <地址> <指令> <数据1> <数据2> <数据3> <校验和>，校验和为前 7 字节之和取低 8 位

use serde::{Deserialize, Serialize};

use crate::error::{Gb28181Error, Result};

pub const DEFAULT_SPEED: u8 = 128;

/// 云台动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzAction {
    Up,
    Down,
    Left,
    Right,
    LeftUp,
    RightUp,
    LeftDown,
    RightDown,
    ZoomIn,
    ZoomOut,
    Stop,
    PresetSet,
    PresetCall,
    PresetDelete,
}

impl PtzAction {
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        let action = match normalized.as_str() {
            "up" => PtzAction::Up,
            "down" => PtzAction::Down,
            "left" => PtzAction::Left,
            "right" => PtzAction::Right,
            "left_up" | "up_left" => PtzAction::LeftUp,
            "right_up" | "up_right" => PtzAction::RightUp,
            "left_down" | "down_left" => PtzAction::LeftDown,
            "right_down" | "down_right" => PtzAction::RightDown,
            "zoom_in" => PtzAction::ZoomIn,
            "zoom_out" => PtzAction::ZoomOut,
            "stop" => PtzAction::Stop,
            "preset_set" => PtzAction::PresetSet,
            "preset_call" => PtzAction::PresetCall,
            "preset_delete" => PtzAction::PresetDelete,
            _ => {
                return Err(Gb28181Error::validation(format!(
                    "unsupported PTZ command: {}",
                    value
                )))
            }
        };
        Ok(action)
    }

    fn is_preset(self) -> bool {
        matches!(
            self,
            PtzAction::PresetSet | PtzAction::PresetCall | PtzAction::PresetDelete
        )
    }
}

/// 一条完整的 PTZ 指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtzCommand {
    pub action: PtzAction,
    pub speed: u8,
    pub preset: u8,
}

impl PtzCommand {
    /// speed 缺省 128；预置位动作要求 preset 在 1..=255
    pub fn new(action: PtzAction, speed: Option<i64>, preset: Option<i64>) -> Result<Self> {
        let speed = speed.unwrap_or(DEFAULT_SPEED as i64).clamp(0, 255) as u8;
        let preset = if action.is_preset() {
            match preset {
                Some(p @ 1..=255) => p as u8,
                _ => {
                    return Err(Gb28181Error::validation(
                        "preset must be between 1 and 255",
                    ))
                }
            }
        } else {
            0
        };
        Ok(Self {
            action,
            speed,
            preset,
        })
    }

    /// 生成 16 位十六进制（大写）指令串
    pub fn encode(&self, address: u8) -> String {
        let s = self.speed;
        let (cmd, d1, d2, d3) = match self.action {
            PtzAction::Right => (0x01, s, 0, 0),
            PtzAction::Left => (0x02, s, 0, 0),
            PtzAction::Down => (0x04, 0, s, 0),
            PtzAction::Up => (0x08, 0, s, 0),
            PtzAction::RightDown => (0x05, s, s, 0),
            PtzAction::LeftDown => (0x06, s, s, 0),
            PtzAction::RightUp => (0x09, s, s, 0),
            PtzAction::LeftUp => (0x0A, s, s, 0),
            PtzAction::ZoomIn => (0x10, 0, 0, (s & 0x0F) << 4),
            PtzAction::ZoomOut => (0x20, 0, 0, (s & 0x0F) << 4),
            PtzAction::Stop => (0x00, 0, 0, 0),
            PtzAction::PresetSet => (0x81, 0, self.preset, 0),
            PtzAction::PresetCall => (0x82, 0, self.preset, 0),
            PtzAction::PresetDelete => (0x83, 0, self.preset, 0),
        };

        let bytes: [u8; 7] = [0xA5, 0x0F, address, cmd, d1, d2, d3];
        let checksum = bytes.iter().map(|b| *b as u32).sum::<u32>() % 256;
        let mut out = String::with_capacity(16);
        for b in bytes {
            out.push_str(&format!("{:02X}", b));
        }
        out.push_str(&format!("{:02X}", checksum));
        out
    }
}

/// 地址取通道编码末两位，无法解析时为 1
pub fn address_of(channel_id: &str) -> u8 {
    let trimmed = channel_id.trim();
    if trimmed.len() < 2 {
        return 1;
    }
    trimmed[trimmed.len() - 2..]
        .parse::<u32>()
        .map(|v| (v & 0xFF) as u8)
        .unwrap_or(1)
}
