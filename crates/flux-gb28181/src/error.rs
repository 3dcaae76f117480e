use thiserror::Error;

/// GB28181 控制面错误
///
/// 前六类是业务错误，直接映射成 HTTP 状态码；其余为底层错误，统一按 500 处理。
#[derive(Error, Debug)]
pub enum Gb28181Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// 能力不匹配，例如未声明 H.265 能力
    #[error("{0}")]
    Conflict(String),

    /// SIP 非 2xx / 超时、流媒体网关失败，保留上游原因
    #[error("{0}")]
    Upstream(String),

    /// 对话已结束
    #[error("{0}")]
    Gone(String),

    #[error("SIP service not initialized")]
    NotReady,

    /// 服务正在关闭，不再接受新会话
    #[error("{0} is shutting down")]
    ShuttingDown(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Gb28181Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Gone(_) => 410,
            Self::Upstream(_) => 502,
            Self::NotReady | Self::ShuttingDown(_) => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Gb28181Error>;
