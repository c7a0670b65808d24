//! 控制器 worker
//!
//! 核心设计：
//! - 订阅集合、时间令牌与客户端状态缓存只在这个任务里修改
//! - 命令按提交顺序处理；长轮询、leave 与策略查询都在独立任务里执行，结果作为消息送回
//! - 每个在途请求持有一个 CancellationToken，集合或令牌变化时取消并重新发起
//! - 策略查询一次只发一个，答复覆盖排队期间积累的全部变化
//! - 只有决定时间令牌的查询会推迟下一次轮询；合并、读取状态期间照常轮询
//! - restore 的答复落定前，后续变更先停放，答复后按提交顺序重放

use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchCoordinator, BatchId, OperationId, OperationKind};
use crate::channel::{describe, Channel, ChannelKind};
use crate::client_state::{ClientState, ClientStateCache};
use crate::config::ControllerConfig;
use crate::error::{Result, SubscribeError};
use crate::events::EventDispatcher;
use crate::policy::{CorrelationId, OwnerPolicy, PolicyBroker, PolicyQuery, PolicyReply, PolicyResponse};
use crate::retry_policy::{RetryDecision, RetryPolicy};
use crate::subscription::{SubscriptionDelta, SubscriptionSet};
use crate::time_token::{ResetReason, TimeToken, TimeTokenCursor};
use crate::transport::{IncomingEvent, PollRequest, PollResponse, PollTransport};

use super::command::{Command, Operation};
use super::state::{ControllerStats, PollState};

/// 后台任务的回报
enum Completion {
    Poll {
        request_id: u64,
        result: Result<PollResponse>,
    },
    Leave {
        batch_id: BatchId,
        operation_id: OperationId,
        channels: Vec<Channel>,
        attempt: u32,
        result: Result<()>,
    },
}

/// 退避到期后的动作
enum RetryTask {
    Poll,
    Leave {
        batch_id: BatchId,
        operation_id: OperationId,
        channels: Vec<Channel>,
        attempt: u32,
    },
}

/// 等待 owner 答复的决策
enum Decision {
    KeepTimeToken,
    MergeState {
        batch_id: BatchId,
        operation_id: OperationId,
        update: ClientState,
        channels: Vec<Channel>,
    },
    RestoreSubscription {
        batch_id: BatchId,
        operation_id: OperationId,
    },
    RestoreWithLastToken {
        batch_id: BatchId,
        operation_id: OperationId,
    },
    FetchState {
        batch_id: BatchId,
        operation_id: OperationId,
        channels: Vec<Channel>,
    },
}

impl Decision {
    /// 答复会决定下一次请求使用的时间令牌
    fn chooses_time_token(&self) -> bool {
        matches!(
            self,
            Decision::KeepTimeToken | Decision::RestoreSubscription { .. } | Decision::RestoreWithLastToken { .. }
        )
    }
}

struct InFlight {
    request_id: u64,
    time_token: TimeToken,
    /// 构造请求时的变更序号
    built_at: u64,
    cancel: CancellationToken,
}

/// 等下一次成功轮询才算完成的操作
struct AwaitingPoll {
    batch_id: BatchId,
    operation_id: OperationId,
    applied_at: u64,
}

pub(crate) struct Worker {
    tag: String,
    config: ControllerConfig,
    transport: Arc<dyn PollTransport>,

    set: SubscriptionSet,
    cursor: TimeTokenCursor,
    cache: ClientStateCache,
    batches: BatchCoordinator,
    dispatcher: EventDispatcher,
    broker: PolicyBroker,
    retry_policy: RetryPolicy,

    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    policy_replies: mpsc::UnboundedReceiver<PolicyResponse>,
    retries: DelayQueue<RetryTask>,
    state_tx: watch::Sender<PollState>,
    stats: ControllerStats,

    next_request_id: u64,
    change_seq: u64,
    in_flight: Option<InFlight>,
    awaiting_poll: Vec<AwaitingPoll>,
    needs_request: bool,
    poll_retry_count: u32,
    poll_retry_key: Option<delay_queue::Key>,

    query_queue: VecDeque<Decision>,
    awaiting_reply: Option<(CorrelationId, Decision)>,
    token_decision_pending: bool,
    /// restore 答复之前收到的变更
    parked: VecDeque<Command>,

    stopped: bool,
}

impl Worker {
    pub(crate) fn new(
        instance_id: String,
        config: ControllerConfig,
        transport: Arc<dyn PollTransport>,
        policy: Arc<dyn OwnerPolicy>,
        dispatcher: EventDispatcher,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<PollState>,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (replies_tx, policy_replies) = mpsc::unbounded_channel();
        let tag = instance_id.chars().take(8).collect();

        Self {
            tag,
            retry_policy: RetryPolicy::new(config.retry_config.clone()),
            config,
            transport,
            set: SubscriptionSet::new(),
            cursor: TimeTokenCursor::new(),
            cache: ClientStateCache::new(),
            batches: BatchCoordinator::new(),
            dispatcher,
            broker: PolicyBroker::new(policy, replies_tx),
            commands,
            completions_tx,
            completions,
            policy_replies,
            retries: DelayQueue::new(),
            state_tx,
            stats: ControllerStats::new(instance_id),
            next_request_id: 0,
            change_seq: 0,
            in_flight: None,
            awaiting_poll: Vec::new(),
            needs_request: false,
            poll_retry_count: 0,
            poll_retry_key: None,
            query_queue: VecDeque::new(),
            awaiting_reply: None,
            token_decision_pending: false,
            parked: VecDeque::new(),
            stopped: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("🔄 [{}] 订阅控制器 worker 开始处理命令", self.tag);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        info!("🛑 [{}] 所有句柄已释放", self.tag);
                        self.shutdown();
                        break;
                    }
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                Some(reply) = self.policy_replies.recv() => self.on_policy_reply(reply),
                Some(expired) = self.retries.next(), if !self.retries.is_empty() => {
                    self.on_retry_due(expired.into_inner());
                }
            }
        }

        info!("✅ [{}] 订阅控制器 worker 已退出", self.tag);
    }

    /// 返回 false 表示 worker 应当退出
    fn handle_command(&mut self, command: Command) -> bool {
        debug!("📥 [{}] 处理命令: {}", self.tag, command.name());

        if matches!(command, Command::Apply { .. } | Command::Restore { .. }) && self.restore_pending() {
            debug!("⏸️ [{}] 等待 restore 答复，暂存命令: {}", self.tag, command.name());
            self.parked.push_back(command);
            return true;
        }

        match command {
            Command::Apply { batch_id, operations } => self.apply_batch(batch_id, operations),
            Command::Restore { batch_id } => self.restore(batch_id),
            Command::Reset => self.reset(),
            Command::Shutdown { respond_to } => {
                self.shutdown();
                let _ = respond_to.send(());
                return false;
            }
            Command::GetChannels { respond_to } => {
                let _ = respond_to.send(self.set.snapshot());
            }
            Command::GetTimeToken { respond_to } => {
                let _ = respond_to.send(self.cursor.current());
            }
            Command::GetClientState { channels, respond_to } => {
                let _ = respond_to.send(self.cache.state_for(&channels));
            }
            Command::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats.clone());
            }
        }
        true
    }

    // ========== 变更 ==========

    fn apply_batch(&mut self, batch_id: BatchId, operations: Vec<Operation>) {
        let specs = operations
            .iter()
            .map(|op| (op.kind(), op.channels().to_vec()))
            .collect();
        let batch = match self.batches.open_batch(batch_id, specs) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("⚠️ [{}] 无法打开批次 {}: {}", self.tag, batch_id, e);
                return;
            }
        };
        debug!("📦 [{}] 打开批次 {}: {} 个操作", self.tag, batch_id, batch.len());

        for operation in &operations {
            self.dispatcher.will(operation.kind(), operation.channels());
        }

        for (operation_id, operation) in batch.operations.into_iter().zip(operations) {
            if self.stopped {
                self.complete(
                    batch_id,
                    operation_id,
                    Err(SubscribeError::Stopped("poll loop is stopped".to_string())),
                );
                continue;
            }
            self.apply_operation(batch_id, operation_id, operation);
        }

        self.pump_queries();
        self.maybe_connect();
    }

    fn apply_operation(&mut self, batch_id: BatchId, operation_id: OperationId, operation: Operation) {
        match operation {
            Operation::Subscribe(channels)
            | Operation::EnablePresence(channels)
            | Operation::SyncSubscribe(channels) => self.add_channels(batch_id, operation_id, &channels),
            Operation::DisablePresence(channels) | Operation::SyncUnsubscribe(channels) => {
                self.remove_channels(batch_id, operation_id, &channels)
            }
            Operation::Unsubscribe(channels) => self.unsubscribe(batch_id, operation_id, &channels),
            Operation::MergeState { state, channels } => {
                self.query_queue.push_back(Decision::MergeState {
                    batch_id,
                    operation_id,
                    update: state,
                    channels,
                });
            }
        }
    }

    fn add_channels(&mut self, batch_id: BatchId, operation_id: OperationId, channels: &[Channel]) {
        let delta = self.set.add(channels);
        if delta.is_empty() {
            debug!("[{}] 频道已在集合中: {}", self.tag, describe(channels));
            self.complete(batch_id, operation_id, Ok(()));
            return;
        }

        info!("➕ [{}] 新增频道: {}", self.tag, describe(&delta.added));
        if self.cursor.is_subscribed() {
            self.request_token_decision();
        }
        self.mark_changed();
        self.await_poll(batch_id, operation_id);
    }

    fn remove_channels(&mut self, batch_id: BatchId, operation_id: OperationId, channels: &[Channel]) {
        let delta = self.set.remove(channels);
        if delta.is_empty() {
            self.complete(batch_id, operation_id, Ok(()));
            return;
        }

        info!("➖ [{}] 移除频道: {}", self.tag, describe(&delta.removed));
        self.forget_state(&delta);
        self.mark_changed();
        self.await_poll(batch_id, operation_id);
    }

    fn unsubscribe(&mut self, batch_id: BatchId, operation_id: OperationId, channels: &[Channel]) {
        let delta = self.set.remove(channels);
        if delta.is_empty() {
            self.complete(batch_id, operation_id, Ok(()));
            return;
        }

        info!("➖ [{}] 取消订阅: {}", self.tag, describe(&delta.removed));
        self.forget_state(&delta);
        self.mark_changed();

        let leaving: Vec<Channel> = delta
            .removed
            .into_iter()
            .filter(|c| matches!(c.kind(), ChannelKind::Data | ChannelKind::Group))
            .collect();
        if self.config.leave_on_unsubscribe && !leaving.is_empty() {
            self.start_leave(batch_id, operation_id, leaving, 0);
        } else {
            self.complete(batch_id, operation_id, Ok(()));
        }
    }

    /// 数据频道被移除后丢弃其客户端状态
    fn forget_state(&mut self, delta: &SubscriptionDelta) {
        for channel in delta.removed.iter().filter(|c| c.kind() == ChannelKind::Data) {
            self.cache.remove(channel.name());
        }
    }

    fn request_token_decision(&mut self) {
        if !self.token_decision_pending {
            self.token_decision_pending = true;
            self.query_queue.push_back(Decision::KeepTimeToken);
        }
    }

    /// 集合、令牌或状态发生了变化：取代在途请求并准备重新发起
    fn mark_changed(&mut self) {
        self.change_seq += 1;
        self.supersede_in_flight();
        self.cancel_poll_retry();
        self.needs_request = true;
    }

    fn await_poll(&mut self, batch_id: BatchId, operation_id: OperationId) {
        self.awaiting_poll.push(AwaitingPoll {
            batch_id,
            operation_id,
            applied_at: self.change_seq,
        });
    }

    fn complete(&mut self, batch_id: BatchId, operation_id: OperationId, result: Result<()>) {
        let ready = self.batches.complete_operation(batch_id, operation_id, result);
        self.dispatcher.completed(&ready, &self.cache);
    }

    /// 完成所有在 `built_at` 之前应用的操作
    fn complete_awaiting(&mut self, built_at: u64) {
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.awaiting_poll)
            .into_iter()
            .partition(|a| a.applied_at <= built_at);
        self.awaiting_poll = rest;
        for awaiting in ready {
            self.complete(awaiting.batch_id, awaiting.operation_id, Ok(()));
        }
    }

    fn fail_pending(&mut self, error: SubscribeError) {
        self.awaiting_poll.clear();
        let failed = self.batches.fail_all(&error);
        self.dispatcher.completed(&failed, &self.cache);
    }

    // ========== leave ==========

    fn start_leave(&mut self, batch_id: BatchId, operation_id: OperationId, channels: Vec<Channel>, attempt: u32) {
        debug!("👋 [{}] 发送 leave: {} (attempt={})", self.tag, describe(&channels), attempt);
        let transport = self.transport.clone();
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            let result = transport.leave(channels.clone()).await;
            let _ = completions.send(Completion::Leave {
                batch_id,
                operation_id,
                channels,
                attempt,
                result,
            });
        });
    }

    fn on_leave_finished(
        &mut self,
        batch_id: BatchId,
        operation_id: OperationId,
        channels: Vec<Channel>,
        attempt: u32,
        result: Result<()>,
    ) {
        let error = match result {
            Ok(()) => {
                self.complete(batch_id, operation_id, Ok(()));
                return;
            }
            Err(error) => error,
        };

        match self.retry_policy.on_failure(attempt, &error) {
            RetryDecision::RetryAfter(delay) => {
                self.stats.retries += 1;
                warn!(
                    "⚠️ [{}] leave 失败，{}ms 后重试: {}",
                    self.tag,
                    delay.as_millis(),
                    error
                );
                self.retries.insert(
                    RetryTask::Leave {
                        batch_id,
                        operation_id,
                        channels,
                        attempt: attempt + 1,
                    },
                    delay,
                );
            }
            RetryDecision::GiveUp => self.complete(batch_id, operation_id, Err(error)),
            RetryDecision::Exhausted => self.complete(
                batch_id,
                operation_id,
                Err(SubscribeError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: error.to_string(),
                }),
            ),
        }
    }

    // ========== 策略查询 ==========

    /// 队首查询发出去（同一时间只有一个在等答复）
    fn pump_queries(&mut self) {
        if self.awaiting_reply.is_some() {
            return;
        }
        let Some(decision) = self.query_queue.pop_front() else {
            return;
        };

        let query = match &decision {
            Decision::KeepTimeToken => PolicyQuery::KeepTimeTokenOnSetChange,
            Decision::MergeState { update, channels, .. } => PolicyQuery::MergeClientState {
                current: channels
                    .iter()
                    .map(|c| (c.name().to_string(), self.cache.get(c.name()).cloned().unwrap_or_default()))
                    .collect(),
                update: update.clone(),
            },
            Decision::RestoreSubscription { .. } => PolicyQuery::RestoreSubscription,
            Decision::RestoreWithLastToken { .. } => PolicyQuery::RestoreWithLastTimeToken,
            Decision::FetchState { channels, .. } => PolicyQuery::FetchClientState {
                channels: channels.clone(),
            },
        };

        self.stats.policy_queries += 1;
        let correlation_id = self.broker.ask(query);
        self.awaiting_reply = Some((correlation_id, decision));
    }

    fn on_policy_reply(&mut self, response: PolicyResponse) {
        let expected = matches!(&self.awaiting_reply, Some((id, _)) if *id == response.correlation_id);
        if !expected {
            match &response.reply {
                PolicyReply::Ack => debug!("✅ [{}] owner 已确认状态缓存更新", self.tag),
                PolicyReply::Unavailable(reason) => {
                    warn!("⚠️ [{}] 策略钩子不可用 ({}): {}", self.tag, response.query, reason)
                }
                _ => debug!(
                    "[{}] 忽略过期的策略答复: id={}, query={}",
                    self.tag, response.correlation_id, response.query
                ),
            }
            return;
        }

        let Some((_, decision)) = self.awaiting_reply.take() else {
            return;
        };
        if let PolicyReply::Unavailable(reason) = &response.reply {
            warn!(
                "⚠️ [{}] 策略钩子不可用 ({}): {}，使用默认值",
                self.tag, response.query, reason
            );
        }

        self.handle_decision(decision, response.reply);
        self.replay_parked();
        self.pump_queries();
        self.maybe_connect();
    }

    fn restore_pending(&self) -> bool {
        let is_restore = |d: &Decision| matches!(d, Decision::RestoreSubscription { .. });
        self.awaiting_reply.as_ref().map_or(false, |(_, d)| is_restore(d)) || self.query_queue.iter().any(is_restore)
    }

    /// 按提交顺序重放暂存的命令，遇到新的 restore 决策再次停下
    fn replay_parked(&mut self) {
        while !self.restore_pending() {
            let Some(command) = self.parked.pop_front() else {
                break;
            };
            debug!("▶️ [{}] 重放暂存命令: {}", self.tag, command.name());
            self.handle_command(command);
        }
    }

    /// 暂存的变更还没执行就被取消：照常发出 will-X，再以 error 结束
    fn reject_parked(&mut self, error: SubscribeError) {
        for command in std::mem::take(&mut self.parked) {
            let (batch_id, specs) = match command {
                Command::Apply { batch_id, operations } => (
                    batch_id,
                    operations
                        .iter()
                        .map(|op| (op.kind(), op.channels().to_vec()))
                        .collect::<Vec<_>>(),
                ),
                Command::Restore { batch_id } => (batch_id, vec![(OperationKind::Restore, self.set.snapshot())]),
                _ => continue,
            };
            let batch = match self.batches.open_batch(batch_id, specs.clone()) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("⚠️ [{}] 无法打开批次 {}: {}", self.tag, batch_id, e);
                    continue;
                }
            };
            for (kind, channels) in &specs {
                self.dispatcher.will(*kind, channels);
            }
            for operation_id in batch.operations {
                self.complete(batch_id, operation_id, Err(error.clone()));
            }
        }
    }

    fn handle_decision(&mut self, decision: Decision, reply: PolicyReply) {
        match decision {
            Decision::KeepTimeToken => {
                self.token_decision_pending = false;
                if reply.decision_or(true) {
                    debug!("[{}] 保留时间令牌 {}", self.tag, self.cursor.current());
                } else {
                    info!("🔄 [{}] owner 不保留时间令牌，从 now 开始", self.tag);
                    self.cursor.reset(ResetReason::OwnerDeclinedKeep);
                }
            }
            Decision::MergeState {
                batch_id,
                operation_id,
                channels,
                ..
            } => match reply {
                PolicyReply::MergedStates(merged) => {
                    for (channel, state) in self.cache.apply_merged(&channels, &merged) {
                        self.stats.policy_queries += 1;
                        self.broker.ask(PolicyQuery::UpdateClientStateCache {
                            state,
                            channels: vec![channel],
                        });
                    }
                    debug!("📝 [{}] 客户端状态已更新: {}", self.tag, describe(&channels));
                    self.mark_changed();
                    self.await_poll(batch_id, operation_id);
                }
                other => {
                    let reason = match other {
                        PolicyReply::Unavailable(reason) => reason,
                        _ => "unexpected reply to merge_client_state".to_string(),
                    };
                    self.complete(batch_id, operation_id, Err(SubscribeError::PolicyUnavailable(reason)));
                }
            },
            Decision::RestoreSubscription { batch_id, operation_id } => {
                if reply.decision_or(true) {
                    self.query_queue
                        .push_front(Decision::RestoreWithLastToken { batch_id, operation_id });
                } else {
                    self.abandon_subscription();
                }
            }
            Decision::RestoreWithLastToken { batch_id, operation_id } => {
                if reply.decision_or(true) {
                    info!("🔁 [{}] 从上次的时间令牌 {} 恢复", self.tag, self.cursor.current());
                } else {
                    info!("🔁 [{}] 不使用上次的时间令牌，从 now 恢复", self.tag);
                    self.cursor.reset(ResetReason::OwnerDeclinedLastToken);
                }
                self.query_queue.push_front(Decision::FetchState {
                    batch_id,
                    operation_id,
                    channels: self.set.of_kind(ChannelKind::Data),
                });
            }
            Decision::FetchState {
                batch_id, operation_id, ..
            } => {
                match reply {
                    PolicyReply::ClientStates(states) => {
                        for (channel, state) in &states {
                            self.cache.merge(channel, state);
                        }
                    }
                    other => warn!("⚠️ [{}] 无法读取 owner 的客户端状态: {:?}", self.tag, other),
                }
                self.mark_changed();
                self.await_poll(batch_id, operation_id);
            }
        }
    }

    // ========== 轮询 ==========

    fn maybe_connect(&mut self) {
        if self.stopped || !self.needs_request {
            return;
        }
        // 时间令牌还没定下来时不构造请求
        if self.token_decision_outstanding() {
            return;
        }
        if self.poll_retry_key.is_some() || self.in_flight.is_some() {
            return;
        }
        self.issue_poll();
    }

    fn token_decision_outstanding(&self) -> bool {
        self.awaiting_reply
            .as_ref()
            .map_or(false, |(_, d)| d.chooses_time_token())
            || self.query_queue.iter().any(Decision::chooses_time_token)
    }

    fn issue_poll(&mut self) {
        self.needs_request = false;

        if self.set.is_empty() {
            debug!("💤 [{}] 订阅集合为空，停止轮询", self.tag);
            self.set_state(PollState::Idle);
            self.complete_awaiting(u64::MAX);
            return;
        }

        self.set_state(PollState::Connecting);
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let channels = self.set.snapshot();
        let request = PollRequest {
            request_id,
            client_state: self.cache.state_for(&channels),
            time_token: self.cursor.current(),
            channels,
        };

        info!(
            "📡 [{}] 发起轮询 #{}: channels=[{}], tt={}",
            self.tag,
            request_id,
            describe(&request.channels),
            request.time_token
        );

        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            request_id,
            time_token: request.time_token,
            built_at: self.change_seq,
            cancel: cancel.clone(),
        });

        let transport = self.transport.clone();
        let completions = self.completions_tx.clone();
        let abort = self.config.abort_superseded_requests;
        tokio::spawn(async move {
            let result = if abort {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = transport.issue_poll(request) => result,
                }
            } else {
                transport.issue_poll(request).await
            };
            let _ = completions.send(Completion::Poll { request_id, result });
        });

        self.stats.polls_issued += 1;
        self.set_state(PollState::WaitingForResponse);
    }

    fn supersede_in_flight(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            debug!("🔁 [{}] 请求 #{} 被取代", self.tag, flight.request_id);
            flight.cancel.cancel();
            self.stats.polls_superseded += 1;
            self.set_state(PollState::Superseded);
        }
    }

    fn cancel_poll_retry(&mut self) {
        if let Some(key) = self.poll_retry_key.take() {
            self.retries.try_remove(&key);
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Poll { request_id, result } => self.on_poll_finished(request_id, result),
            Completion::Leave {
                batch_id,
                operation_id,
                channels,
                attempt,
                result,
            } => self.on_leave_finished(batch_id, operation_id, channels, attempt, result),
        }
    }

    fn on_poll_finished(&mut self, request_id: u64, result: Result<PollResponse>) {
        let current = matches!(
            &self.in_flight,
            Some(flight) if flight.request_id == request_id
                && flight.time_token == self.cursor.current()
                && !flight.cancel.is_cancelled()
        );
        if !current {
            self.stats.responses_discarded += 1;
            debug!("🗑️ [{}] 丢弃请求 #{} 的迟到响应", self.tag, request_id);
            return;
        }
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(response) => self.on_poll_succeeded(flight, response),
            Err(error) if error.is_silent() => {
                debug!("[{}] 请求 #{} 被传输层取消", self.tag, request_id);
                self.needs_request = true;
                self.maybe_connect();
            }
            Err(error) => self.on_poll_failed(error),
        }
    }

    fn on_poll_succeeded(&mut self, flight: InFlight, response: PollResponse) {
        self.set_state(PollState::Dispatching);
        self.poll_retry_count = 0;
        self.stats.polls_completed += 1;
        debug!(
            "📨 [{}] 请求 #{} 返回 {} 个事件, tt={}",
            self.tag,
            flight.request_id,
            response.events.len(),
            response.time_token
        );

        self.complete_awaiting(flight.built_at);

        for event in response.events {
            match event {
                IncomingEvent::Message(message) => {
                    self.stats.messages_dispatched += 1;
                    self.dispatcher.message(message);
                }
                IncomingEvent::Presence(event) => {
                    self.stats.presence_events_dispatched += 1;
                    self.dispatcher.presence(event);
                }
                IncomingEvent::Sync(event) => {
                    self.stats.sync_events_dispatched += 1;
                    self.dispatcher.sync_event(event);
                }
            }
        }

        self.cursor.advance(response.time_token);
        self.needs_request = true;
        self.maybe_connect();
    }

    fn on_poll_failed(&mut self, error: SubscribeError) {
        match self.retry_policy.on_failure(self.poll_retry_count, &error) {
            RetryDecision::RetryAfter(delay) => {
                self.poll_retry_count += 1;
                self.stats.retries += 1;
                warn!(
                    "⚠️ [{}] 轮询失败，{}ms 后第 {} 次重试: {}",
                    self.tag,
                    delay.as_millis(),
                    self.poll_retry_count,
                    error
                );
                self.poll_retry_key = Some(self.retries.insert(RetryTask::Poll, delay));
                self.needs_request = true;
                self.set_state(PollState::Connecting);
            }
            RetryDecision::GiveUp => self.stop_polling(error),
            RetryDecision::Exhausted => {
                let attempts = self.poll_retry_count + 1;
                self.stop_polling(SubscribeError::RetriesExhausted {
                    attempts,
                    last_error: error.to_string(),
                })
            }
        }
    }

    fn on_retry_due(&mut self, task: RetryTask) {
        match task {
            RetryTask::Poll => {
                self.poll_retry_key = None;
                debug!("⏰ [{}] 退避结束，重新发起轮询", self.tag);
                self.maybe_connect();
            }
            RetryTask::Leave {
                batch_id,
                operation_id,
                channels,
                attempt,
            } => {
                let pending = self
                    .batches
                    .operation(operation_id)
                    .map_or(false, |op| op.outcome.is_pending());
                if pending {
                    self.start_leave(batch_id, operation_id, channels, attempt);
                }
            }
        }
    }

    /// 致命错误：停止轮询并让所有未完成操作失败
    fn stop_polling(&mut self, error: SubscribeError) {
        error!("❌ [{}] 轮询循环停止: {}", self.tag, error);
        self.stopped = true;
        self.needs_request = false;
        self.cancel_poll_retry();
        self.clear_queries();
        self.stats.fatal_stops += 1;
        self.set_state(PollState::Stopped);
        self.fail_pending(error.clone());
        self.dispatcher.polling_stopped(&error);
        self.replay_parked();
    }

    fn clear_queries(&mut self) {
        self.query_queue.clear();
        self.awaiting_reply = None;
        self.token_decision_pending = false;
    }

    // ========== restore / reset / shutdown ==========

    fn restore(&mut self, batch_id: BatchId) {
        let snapshot = self.set.snapshot();
        let batch = match self
            .batches
            .open_batch(batch_id, vec![(OperationKind::Restore, snapshot.clone())])
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!("⚠️ [{}] 无法打开恢复批次 {}: {}", self.tag, batch_id, e);
                return;
            }
        };
        let operation_id = batch.operations[0];

        info!("🔁 [{}] 恢复订阅: [{}]", self.tag, describe(&snapshot));
        self.dispatcher.will(OperationKind::Restore, &snapshot);

        self.stopped = false;
        self.supersede_in_flight();
        self.cancel_poll_retry();
        self.poll_retry_count = 0;

        if snapshot.is_empty() {
            self.complete(batch_id, operation_id, Ok(()));
            self.set_state(PollState::Idle);
            return;
        }

        self.set_state(PollState::Connecting);
        self.query_queue
            .push_back(Decision::RestoreSubscription { batch_id, operation_id });
        self.pump_queries();
    }

    /// owner 放弃恢复：清空集合，不再轮询
    fn abandon_subscription(&mut self) {
        info!("🚫 [{}] owner 放弃恢复订阅", self.tag);
        self.clear_queries();
        self.set.clear();
        self.cache.clear();
        self.cursor.reset(ResetReason::OwnerAbandonedRestore);
        self.needs_request = false;
        self.set_state(PollState::Idle);
        self.fail_pending(SubscribeError::Cancelled("owner declined restore".to_string()));
    }

    fn reset(&mut self) {
        info!("♻️ [{}] 重置控制器", self.tag);
        self.supersede_in_flight();
        self.poll_retry_key = None;
        self.retries.clear();
        self.clear_queries();
        self.fail_pending(SubscribeError::Cancelled("controller reset".to_string()));
        self.reject_parked(SubscribeError::Cancelled("controller reset".to_string()));

        self.set.clear();
        self.cache.clear();
        self.cursor.reset(ResetReason::ExplicitReset);
        self.stopped = false;
        self.needs_request = false;
        self.poll_retry_count = 0;
        self.set_state(PollState::Idle);
        self.dispatcher.reset();
    }

    fn shutdown(&mut self) {
        info!("🛑 [{}] 订阅控制器关闭", self.tag);
        self.supersede_in_flight();
        self.poll_retry_key = None;
        self.retries.clear();
        self.clear_queries();
        self.stopped = true;
        self.needs_request = false;
        self.set_state(PollState::Stopped);
        self.fail_pending(SubscribeError::ShuttingDown);
        self.reject_parked(SubscribeError::ShuttingDown);
    }

    fn set_state(&mut self, state: PollState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            debug!("[{}] 轮询状态: {} -> {}", self.tag, previous, state);
            self.state_tx.send_replace(state);
        }
    }
}
