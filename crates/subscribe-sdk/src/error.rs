use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类（投递给 owner 的 did-fail 回调时携带）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 网络/超时 → 指数退避重试
    Transport,
    /// 服务端拒绝（参数错误、鉴权失败、配额）→ 不重试
    BackendRejection,
    /// 响应体解析失败 → 按 Transport 重试
    Decode,
    /// 请求被新的频道集合取代 → 静默丢弃
    CancelledBySupersession,
    /// 重试次数耗尽
    RetriesExhausted,
    /// 轮询循环已停止
    Stopped,
    /// 控制器被 reset / 订阅被放弃
    Cancelled,
    /// 控制器正在关闭
    ShuttingDown,
    /// 其他
    Other,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscribeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend rejection [{code}]: {message}")]
    BackendRejection { code: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Request superseded by newer channel set")]
    CancelledBySupersession,

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Poll loop stopped: {0}")]
    Stopped(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Owner policy unavailable: {0}")]
    PolicyUnavailable(String),

    #[error("Controller worker stopped responding")]
    WorkerGone,
}

impl SubscribeError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubscribeError::Transport(_) => ErrorKind::Transport,
            SubscribeError::BackendRejection { .. } => ErrorKind::BackendRejection,
            SubscribeError::Decode(_) => ErrorKind::Decode,
            SubscribeError::CancelledBySupersession => ErrorKind::CancelledBySupersession,
            SubscribeError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            SubscribeError::Stopped(_) => ErrorKind::Stopped,
            SubscribeError::Cancelled(_) => ErrorKind::Cancelled,
            SubscribeError::ShuttingDown => ErrorKind::ShuttingDown,
            SubscribeError::InvalidArgument(_)
            | SubscribeError::PolicyUnavailable(_)
            | SubscribeError::WorkerGone => ErrorKind::Other,
        }
    }

    /// 是否可以在本地重试（Decode 与 Transport 同等对待）
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubscribeError::Transport(_) | SubscribeError::Decode(_))
    }

    /// 是否需要通知 owner
    pub fn is_silent(&self) -> bool {
        matches!(self, SubscribeError::CancelledBySupersession)
    }

    /// 从 HTTP 状态码构造服务端拒绝错误
    pub fn rejection(code: u16, message: impl Into<String>) -> Self {
        SubscribeError::BackendRejection {
            code,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SubscribeError {
    fn from(error: serde_json::Error) -> Self {
        SubscribeError::Decode(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SubscribeError>;
