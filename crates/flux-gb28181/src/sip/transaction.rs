// SIP 事务/对话状态
// 入站事件统一为 SipEvent，由引擎的单一分发函数处理

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::message::{SipMethod, SipRequest, SipResponse};
use crate::directory::Transport;
use crate::error::{Gb28181Error, Result};

/// 对端地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl Endpoint {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Udp,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Tcp,
        }
    }
}

/// 引擎事件
#[derive(Debug)]
pub enum SipEvent {
    Request { request: SipRequest, peer: Endpoint },
    Response { response: SipResponse, peer: Endpoint },
    /// 重传耗尽（Timer B / F）
    TransactionTimeout { call_id: String },
    /// 对端 BYE 后清理对话
    DialogTerminated { call_id: String },
}

/// 出站请求结果，INVITE / MESSAGE / SUBSCRIBE 共用
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SipOutcome {
    Success {
        call_id: String,
        status_code: u16,
        reason: String,
    },
    /// 信令关闭，调用方继续但不建立对话
    Skipped { reason: String },
    Failed {
        call_id: Option<String>,
        status_code: u16,
        reason: String,
    },
    /// 信令未初始化
    NotReady,
}

impl SipOutcome {
    pub fn failed(call_id: Option<String>, status_code: u16, reason: impl Into<String>) -> Self {
        SipOutcome::Failed {
            call_id,
            status_code,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SipOutcome::Success { .. } | SipOutcome::Skipped { .. })
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            SipOutcome::Success { call_id, .. } => Some(call_id),
            SipOutcome::Failed { call_id, .. } => call_id.as_deref(),
            _ => None,
        }
    }

    /// 失败映射为上游错误，成功时返回 Call-ID（skipped 为 None）
    pub fn into_result(self, action: &str) -> Result<Option<String>> {
        match self {
            SipOutcome::Success { call_id, .. } => Ok(Some(call_id)),
            SipOutcome::Skipped { .. } => Ok(None),
            SipOutcome::Failed { reason, .. } => Err(Gb28181Error::upstream(format!(
                "GB28181 {} failed: {}",
                action, reason
            ))),
            SipOutcome::NotReady => Err(Gb28181Error::NotReady),
        }
    }
}

/// 待响应的出站事务，按 Call-ID 索引；移出 map 的一方负责完成它
pub(crate) struct PendingTransaction {
    pub method: SipMethod,
    pub request: SipRequest,
    pub target: Endpoint,
    pub completion: oneshot::Sender<SipOutcome>,
    /// 收到任何响应后停止重传
    pub responded: Arc<AtomicBool>,
    pub context: Option<DialogContext>,
}

/// INVITE 对应的业务上下文
#[derive(Debug, Clone)]
pub struct DialogContext {
    pub device_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogState {
    Confirmed,
    Terminated,
}

/// INVITE 2xx + ACK 后建立的对话
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub device_id: String,
    pub channel_id: String,
    /// 本端 From（含 tag）
    pub local: String,
    /// 对端 To（含 tag）
    pub remote: String,
    /// 对话内请求的 Request-URI
    pub remote_target: String,
    pub peer: Endpoint,
    pub invite_cseq: u32,
    pub state: DialogState,
    pub created_at: DateTime<Utc>,
}

/// 对话快照
#[derive(Debug, Clone, Serialize)]
pub struct DialogView {
    pub call_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub state: DialogState,
    pub created_at: DateTime<Utc>,
}

impl From<&Dialog> for DialogView {
    fn from(dialog: &Dialog) -> Self {
        Self {
            call_id: dialog.call_id.clone(),
            device_id: dialog.device_id.clone(),
            channel_id: dialog.channel_id.clone(),
            local_tag: super::header::tag(&dialog.local),
            remote_tag: super::header::tag(&dialog.remote),
            state: dialog.state,
            created_at: dialog.created_at,
        }
    }
}
