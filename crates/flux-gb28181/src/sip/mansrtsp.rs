// GB28181 回放控制（MANSRTSP，经 INFO 在对话内发送）

use serde::{Deserialize, Serialize};

use crate::error::{Gb28181Error, Result};

pub const CONTENT_TYPE: &str = "Application/MANSRTSP";

/// 回放控制指令
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum PlaybackControl {
    Pause,
    Resume,
    /// 倍速播放，非正数按 1.0 处理
    Speed { scale: f64 },
    /// 拖动到相对起点的秒数
    Seek { position: u64 },
    Teardown,
}

impl PlaybackControl {
    /// 从动作名与可选参数构造
    pub fn parse(action: &str, scale: Option<f64>, position: Option<u64>) -> Result<Self> {
        match action.trim().to_ascii_uppercase().as_str() {
            "PAUSE" => Ok(PlaybackControl::Pause),
            "RESUME" | "PLAY" => Ok(PlaybackControl::Resume),
            "SPEED" | "SCALE" => Ok(PlaybackControl::Speed {
                scale: scale.unwrap_or(1.0),
            }),
            "SEEK" => Ok(PlaybackControl::Seek {
                position: position.unwrap_or(0),
            }),
            "TEARDOWN" => Ok(PlaybackControl::Teardown),
            other => Err(Gb28181Error::validation(format!(
                "unsupported playback action: {}",
                other
            ))),
        }
    }

    pub fn encode(&self, cseq: u32) -> String {
        match *self {
            PlaybackControl::Pause => {
                format!("PAUSE MANSRTSP/1.0\r\nCSeq: {}\r\nPauseTime: now\r\n\r\n", cseq)
            }
            PlaybackControl::Resume => {
                format!("PLAY MANSRTSP/1.0\r\nCSeq: {}\r\nRange: npt=now-\r\n\r\n", cseq)
            }
            PlaybackControl::Speed { scale } => {
                let scale = if scale > 0.0 { scale } else { 1.0 };
                format!("PLAY MANSRTSP/1.0\r\nCSeq: {}\r\nScale: {}\r\n\r\n", cseq, scale)
            }
            PlaybackControl::Seek { position } => {
                format!(
                    "PLAY MANSRTSP/1.0\r\nCSeq: {}\r\nRange: npt={}-\r\n\r\n",
                    cseq, position
                )
            }
            PlaybackControl::Teardown => format!("TEARDOWN MANSRTSP/1.0\r\nCSeq: {}\r\n\r\n", cseq),
        }
    }
}
