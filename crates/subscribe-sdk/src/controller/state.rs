//! 轮询状态与运行统计

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 轮询循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollState {
    /// 没有活跃频道
    Idle,
    /// 正在构造/发起请求（含退避等待）
    Connecting,
    /// 请求在途
    WaitingForResponse,
    /// 正在派发响应事件
    Dispatching,
    /// 在途请求刚被取代
    Superseded,
    /// 致命错误后停止，需要 restore() 或 reset()
    Stopped,
}

impl PollState {
    pub fn is_active(&self) -> bool {
        !matches!(self, PollState::Idle | PollState::Stopped)
    }
}

impl std::fmt::Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollState::Idle => write!(f, "空闲"),
            PollState::Connecting => write!(f, "连接中"),
            PollState::WaitingForResponse => write!(f, "等待响应"),
            PollState::Dispatching => write!(f, "派发中"),
            PollState::Superseded => write!(f, "已取代"),
            PollState::Stopped => write!(f, "已停止"),
        }
    }
}

/// 控制器运行统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStats {
    /// 控制器实例 ID
    pub instance_id: String,
    /// 启动时间（UTC毫秒时间戳）
    pub started_at: i64,
    /// 发出的轮询数
    pub polls_issued: u64,
    /// 成功并派发的轮询数
    pub polls_completed: u64,
    /// 被取代的请求数
    pub polls_superseded: u64,
    /// 被丢弃的迟到响应数
    pub responses_discarded: u64,
    /// 退避重试次数
    pub retries: u64,
    pub messages_dispatched: u64,
    pub presence_events_dispatched: u64,
    pub sync_events_dispatched: u64,
    /// 发出的策略查询数
    pub policy_queries: u64,
    /// 致命停止次数
    pub fatal_stops: u64,
}

impl ControllerStats {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            started_at: Utc::now().timestamp_millis(),
            polls_issued: 0,
            polls_completed: 0,
            polls_superseded: 0,
            responses_discarded: 0,
            retries: 0,
            messages_dispatched: 0,
            presence_events_dispatched: 0,
            sync_events_dispatched: 0,
            policy_queries: 0,
            fatal_stops: 0,
        }
    }

    /// 已运行时长（毫秒）
    pub fn uptime_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.started_at
    }
}
