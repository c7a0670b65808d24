//! Owner 策略钩子
//!
//! 控制器在需要 owner 拍板的地方（保留时间令牌？恢复订阅？合并状态？）发出一个带关联 id 的查询，
//! 查询在独立任务里执行，答复作为消息回到 worker。worker 只挂起等待这一答复的决策路径，
//! 其他命令照常排队处理。

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::client_state::{merge_states, ClientState};

pub type CorrelationId = u64;

/// Owner 策略（所有方法都有默认实现）
#[async_trait]
pub trait OwnerPolicy: Send + Sync {
    /// 订阅集合变化时是否沿用当前时间令牌（否则从 "now" 开始，不补齐）
    async fn should_keep_time_token_on_set_change(&self) -> bool {
        true
    }

    /// 断线后是否恢复之前的订阅
    async fn should_restore_subscription(&self) -> bool {
        true
    }

    /// 恢复时是否使用上次的时间令牌（补齐断线期间的事件）
    async fn should_restore_with_last_time_token(&self) -> bool {
        true
    }

    /// 合并客户端状态，返回完整结果
    async fn merge_client_state(&self, current: &ClientState, update: &ClientState) -> ClientState {
        merge_states(current, update)
    }

    /// 读取 owner 侧保存的客户端状态
    async fn fetch_client_state(&self, channels: &[Channel]) -> HashMap<String, ClientState> {
        let _ = channels;
        HashMap::new()
    }

    /// 通知 owner 缓存已更新
    async fn update_client_state_cache(&self, state: &ClientState, channels: &[Channel]) {
        let _ = (state, channels);
    }
}

/// 全部使用默认答复的策略
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

#[async_trait]
impl OwnerPolicy for DefaultPolicy {}

/// 查询
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyQuery {
    KeepTimeTokenOnSetChange,
    RestoreSubscription,
    RestoreWithLastTimeToken,
    /// 每个频道的当前状态 + 同一份增量
    MergeClientState {
        current: HashMap<String, ClientState>,
        update: ClientState,
    },
    FetchClientState {
        channels: Vec<Channel>,
    },
    UpdateClientStateCache {
        state: ClientState,
        channels: Vec<Channel>,
    },
}

impl PolicyQuery {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyQuery::KeepTimeTokenOnSetChange => "keep_time_token_on_set_change",
            PolicyQuery::RestoreSubscription => "restore_subscription",
            PolicyQuery::RestoreWithLastTimeToken => "restore_with_last_time_token",
            PolicyQuery::MergeClientState { .. } => "merge_client_state",
            PolicyQuery::FetchClientState { .. } => "fetch_client_state",
            PolicyQuery::UpdateClientStateCache { .. } => "update_client_state_cache",
        }
    }
}

/// 答复
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyReply {
    Decision(bool),
    MergedStates(HashMap<String, ClientState>),
    ClientStates(HashMap<String, ClientState>),
    Ack,
    /// 钩子崩溃，调用方使用默认值
    Unavailable(String),
}

impl PolicyReply {
    /// 取布尔答复，不可用时使用给定默认值
    pub fn decision_or(&self, default: bool) -> bool {
        match self {
            PolicyReply::Decision(value) => *value,
            _ => default,
        }
    }
}

/// 带关联 id 的答复
#[derive(Debug, Clone)]
pub struct PolicyResponse {
    pub correlation_id: CorrelationId,
    pub query: &'static str,
    pub reply: PolicyReply,
}

/// 查询代理：为每个查询分配关联 id 并在独立任务里执行
pub struct PolicyBroker {
    policy: Arc<dyn OwnerPolicy>,
    replies: mpsc::UnboundedSender<PolicyResponse>,
    next_correlation_id: CorrelationId,
}

impl PolicyBroker {
    pub fn new(policy: Arc<dyn OwnerPolicy>, replies: mpsc::UnboundedSender<PolicyResponse>) -> Self {
        Self {
            policy,
            replies,
            next_correlation_id: 0,
        }
    }

    /// 发出查询，答复稍后通过 replies 通道送回
    pub fn ask(&mut self, query: PolicyQuery) -> CorrelationId {
        self.next_correlation_id += 1;
        let correlation_id = self.next_correlation_id;
        let policy = self.policy.clone();
        let replies = self.replies.clone();
        let name = query.name();

        debug!("❓ 策略查询: id={}, query={}", correlation_id, name);

        tokio::spawn(async move {
            let reply = match AssertUnwindSafe(answer(policy.as_ref(), query)).catch_unwind().await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!("⚠️ 策略钩子崩溃: id={}, query={}", correlation_id, name);
                    PolicyReply::Unavailable(format!("{} panicked", name))
                }
            };
            let _ = replies.send(PolicyResponse {
                correlation_id,
                query: name,
                reply,
            });
        });

        correlation_id
    }
}

async fn answer(policy: &dyn OwnerPolicy, query: PolicyQuery) -> PolicyReply {
    match query {
        PolicyQuery::KeepTimeTokenOnSetChange => {
            PolicyReply::Decision(policy.should_keep_time_token_on_set_change().await)
        }
        PolicyQuery::RestoreSubscription => {
            PolicyReply::Decision(policy.should_restore_subscription().await)
        }
        PolicyQuery::RestoreWithLastTimeToken => {
            PolicyReply::Decision(policy.should_restore_with_last_time_token().await)
        }
        PolicyQuery::MergeClientState { current, update } => {
            let mut merged = HashMap::with_capacity(current.len());
            for (channel, state) in current {
                let result = policy.merge_client_state(&state, &update).await;
                merged.insert(channel, result);
            }
            PolicyReply::MergedStates(merged)
        }
        PolicyQuery::FetchClientState { channels } => {
            PolicyReply::ClientStates(policy.fetch_client_state(&channels).await)
        }
        PolicyQuery::UpdateClientStateCache { state, channels } => {
            policy.update_client_state_cache(&state, &channels).await;
            PolicyReply::Ack
        }
    }
}
