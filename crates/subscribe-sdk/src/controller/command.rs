//! worker 命令
//!
//! 所有变更与查询都通过命令发给唯一的 worker 任务，按提交顺序处理。

use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::batch::{BatchId, OperationKind};
use crate::channel::Channel;
use crate::client_state::ClientState;
use crate::time_token::TimeToken;

use super::state::ControllerStats;

/// 批次里的一个变更
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Subscribe(Vec<Channel>),
    Unsubscribe(Vec<Channel>),
    EnablePresence(Vec<Channel>),
    DisablePresence(Vec<Channel>),
    SyncSubscribe(Vec<Channel>),
    SyncUnsubscribe(Vec<Channel>),
    /// 合并客户端状态
    MergeState {
        state: ClientState,
        channels: Vec<Channel>,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Subscribe(_) => OperationKind::Subscribe,
            Operation::Unsubscribe(_) => OperationKind::Unsubscribe,
            Operation::EnablePresence(_) => OperationKind::EnablePresence,
            Operation::DisablePresence(_) => OperationKind::DisablePresence,
            Operation::SyncSubscribe(_) => OperationKind::SyncSubscribe,
            Operation::SyncUnsubscribe(_) => OperationKind::SyncUnsubscribe,
            Operation::MergeState { .. } => OperationKind::UpdateState,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        match self {
            Operation::Subscribe(c)
            | Operation::Unsubscribe(c)
            | Operation::EnablePresence(c)
            | Operation::DisablePresence(c)
            | Operation::SyncSubscribe(c)
            | Operation::SyncUnsubscribe(c) => c,
            Operation::MergeState { channels, .. } => channels,
        }
    }
}

/// worker 命令
pub(crate) enum Command {
    /// 应用一个批次
    Apply {
        batch_id: BatchId,
        operations: Vec<Operation>,
    },

    /// 恢复订阅
    Restore { batch_id: BatchId },

    /// 清空集合、令牌与状态缓存
    Reset,

    /// 停止 worker
    Shutdown { respond_to: oneshot::Sender<()> },

    /// 查询订阅集合快照
    GetChannels {
        respond_to: oneshot::Sender<Vec<Channel>>,
    },

    /// 查询当前时间令牌
    GetTimeToken {
        respond_to: oneshot::Sender<TimeToken>,
    },

    /// 查询缓存的客户端状态
    GetClientState {
        channels: Vec<Channel>,
        respond_to: oneshot::Sender<HashMap<String, ClientState>>,
    },

    /// 查询运行统计
    GetStats {
        respond_to: oneshot::Sender<ControllerStats>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Apply { .. } => "apply",
            Command::Restore { .. } => "restore",
            Command::Reset => "reset",
            Command::Shutdown { .. } => "shutdown",
            Command::GetChannels { .. } => "get_channels",
            Command::GetTimeToken { .. } => "get_time_token",
            Command::GetClientState { .. } => "get_client_state",
            Command::GetStats { .. } => "get_stats",
        }
    }
}
