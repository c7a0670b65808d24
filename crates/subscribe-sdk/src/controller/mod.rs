//! 订阅控制器
//!
//! [`SubscriptionController`] 是可克隆的句柄，所有变更都以命令形式发给唯一的 worker 任务。
//! 变更方法同步返回批次 id；结果通过 delegate 回调和 [`SubscriptionController::events`] 广播流投递。
//!
//! ```ignore
//! let controller = SubscriptionController::spawn(config, transport, policy, Delegates::new(delegate));
//! controller.subscribe(vec![Channel::data("room-1")], None)?;
//! controller.submit(
//!     ChangeBatch::new()
//!         .enable_presence(vec![Channel::data("room-1")])
//!         .merge_state(state, vec![Channel::data("room-1")]),
//! )?;
//! ```

mod command;
mod state;
mod worker;


pub use command::Operation;
pub use state::{ControllerStats, PollState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::info;
use uuid::Uuid;

use crate::batch::BatchId;
use crate::channel::{Channel, ChannelKind};
use crate::client_state::ClientState;
use crate::config::ControllerConfig;
use crate::error::{Result, SubscribeError};
use crate::events::{ChannelEvent, Delegates, EventDispatcher};
use crate::policy::{DefaultPolicy, OwnerPolicy};
use crate::time_token::TimeToken;
use crate::transport::PollTransport;

use command::Command;
use worker::Worker;

/// 复合变更构造器
///
/// 一次 `submit` 对应一个批次，批次内的终态回调按这里的声明顺序投递。
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    operations: Vec<Operation>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅数据频道或频道组
    pub fn subscribe(mut self, channels: Vec<Channel>) -> Self {
        self.operations.push(Operation::Subscribe(channels));
        self
    }

    pub fn unsubscribe(mut self, channels: Vec<Channel>) -> Self {
        self.operations.push(Operation::Unsubscribe(channels));
        self
    }

    /// 开启 presence（频道会被转换为 presence 类型）
    pub fn enable_presence(mut self, channels: Vec<Channel>) -> Self {
        self.operations
            .push(Operation::EnablePresence(as_kind(channels, ChannelKind::Presence)));
        self
    }

    pub fn disable_presence(mut self, channels: Vec<Channel>) -> Self {
        self.operations
            .push(Operation::DisablePresence(as_kind(channels, ChannelKind::Presence)));
        self
    }

    /// 订阅数据对象同步 feed
    pub fn sync_subscribe(mut self, channels: Vec<Channel>) -> Self {
        self.operations
            .push(Operation::SyncSubscribe(as_kind(channels, ChannelKind::SyncFeed)));
        self
    }

    pub fn sync_unsubscribe(mut self, channels: Vec<Channel>) -> Self {
        self.operations
            .push(Operation::SyncUnsubscribe(as_kind(channels, ChannelKind::SyncFeed)));
        self
    }

    /// 合并客户端状态（按频道名缓存）
    pub fn merge_state(mut self, state: ClientState, channels: Vec<Channel>) -> Self {
        self.operations.push(Operation::MergeState { state, channels });
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

fn as_kind(channels: Vec<Channel>, kind: ChannelKind) -> Vec<Channel> {
    channels
        .into_iter()
        .map(|c| if c.kind() == kind { c } else { c.with_kind(kind) })
        .collect()
}

/// 订阅控制器句柄
#[derive(Clone)]
pub struct SubscriptionController {
    instance_id: String,
    sender: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<PollState>,
    next_batch_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl SubscriptionController {
    /// 启动 worker 并返回句柄（需要在 tokio 运行时内调用）
    pub fn spawn(
        config: ControllerConfig,
        transport: Arc<dyn PollTransport>,
        policy: Arc<dyn OwnerPolicy>,
        delegates: Delegates,
    ) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PollState::Idle);
        let dispatcher = EventDispatcher::new(delegates, config.event_config.broadcast_capacity);
        let events = dispatcher.sender();

        info!(
            "🚀 订阅控制器已启动: instance={}, abort_superseded={}, max_retries={}",
            instance_id, config.abort_superseded_requests, config.retry_config.max_retries
        );

        let worker = Worker::new(
            instance_id.clone(),
            config,
            transport,
            policy,
            dispatcher,
            receiver,
            state_tx,
        );
        tokio::spawn(worker.run());

        Self {
            instance_id,
            sender,
            events,
            state: state_rx,
            next_batch_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 默认配置 + 默认策略
    pub fn with_defaults(transport: Arc<dyn PollTransport>, delegates: Delegates) -> Self {
        Self::spawn(ControllerConfig::default(), transport, Arc::new(DefaultPolicy), delegates)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 订阅；带状态时打开 [Subscribe, UpdateState] 两步批次
    pub fn subscribe(&self, channels: Vec<Channel>, state: Option<ClientState>) -> Result<BatchId> {
        let mut batch = ChangeBatch::new().subscribe(channels.clone());
        if let Some(state) = state {
            batch = batch.merge_state(state, channels);
        }
        self.submit(batch)
    }

    pub fn unsubscribe(&self, channels: Vec<Channel>) -> Result<BatchId> {
        self.submit(ChangeBatch::new().unsubscribe(channels))
    }

    pub fn enable_presence(&self, channels: Vec<Channel>) -> Result<BatchId> {
        self.submit(ChangeBatch::new().enable_presence(channels))
    }

    pub fn disable_presence(&self, channels: Vec<Channel>) -> Result<BatchId> {
        self.submit(ChangeBatch::new().disable_presence(channels))
    }

    pub fn sync_subscribe(&self, channels: Vec<Channel>) -> Result<BatchId> {
        self.submit(ChangeBatch::new().sync_subscribe(channels))
    }

    pub fn sync_unsubscribe(&self, channels: Vec<Channel>) -> Result<BatchId> {
        self.submit(ChangeBatch::new().sync_unsubscribe(channels))
    }

    pub fn merge_state(&self, state: ClientState, channels: Vec<Channel>) -> Result<BatchId> {
        self.submit(ChangeBatch::new().merge_state(state, channels))
    }

    /// 提交一个复合变更
    pub fn submit(&self, batch: ChangeBatch) -> Result<BatchId> {
        if batch.is_empty() {
            return Err(SubscribeError::InvalidArgument("empty change batch".to_string()));
        }
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        self.send(Command::Apply {
            batch_id,
            operations: batch.operations,
        })?;
        Ok(batch_id)
    }

    /// 断线后恢复订阅（也用于从致命停止中恢复）
    pub fn restore(&self) -> Result<BatchId> {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        self.send(Command::Restore { batch_id })?;
        Ok(batch_id)
    }

    /// 清空订阅集合、时间令牌与状态缓存
    pub fn reset(&self) -> Result<()> {
        self.send(Command::Reset)
    }

    /// 关闭控制器，等待 worker 退出
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Shutdown { respond_to: tx })
            .map_err(|_| SubscribeError::WorkerGone)?;
        rx.await.map_err(|_| SubscribeError::WorkerGone)
    }

    pub async fn channels(&self) -> Result<Vec<Channel>> {
        self.query(|respond_to| Command::GetChannels { respond_to }).await
    }

    pub async fn time_token(&self) -> Result<TimeToken> {
        self.query(|respond_to| Command::GetTimeToken { respond_to }).await
    }

    pub async fn client_state(&self, channels: Vec<Channel>) -> Result<HashMap<String, ClientState>> {
        self.query(|respond_to| Command::GetClientState { channels, respond_to })
            .await
    }

    pub async fn stats(&self) -> Result<ControllerStats> {
        self.query(|respond_to| Command::GetStats { respond_to }).await
    }

    pub fn poll_state(&self) -> PollState {
        *self.state.borrow()
    }

    /// 订阅轮询状态变化
    pub fn watch_state(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    /// 订阅事件广播
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubscribeError::ShuttingDown);
        }
        self.sender.send(command).map_err(|_| SubscribeError::WorkerGone)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SubscribeError::WorkerGone)
    }
}
