//! 测试辅助：可控的传输层、记录调用的 delegate 与策略

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::channel::{describe, Channel};
use crate::client_state::{merge_states, ClientState};
use crate::error::{Result, SubscribeError};
use crate::events::{ChannelDelegate, ChannelDelegateExt, ChannelEvent};
use crate::policy::OwnerPolicy;
use crate::time_token::TimeToken;
use crate::transport::{IncomingEvent, Message, PollRequest, PollResponse, PollTransport, PresenceEvent, SyncEvent};

/// 测试手里的一次未答复轮询
pub(crate) struct PendingPoll {
    pub request: PollRequest,
    responder: oneshot::Sender<Result<PollResponse>>,
}

impl PendingPoll {
    /// 返回 false 表示请求已经被中止
    pub fn respond(self, result: Result<PollResponse>) -> bool {
        self.responder.send(result).is_ok()
    }

    pub fn succeed(self, time_token: u64, events: Vec<IncomingEvent>) -> bool {
        self.respond(Ok(PollResponse {
            events,
            time_token: TimeToken::new(time_token),
        }))
    }

    pub fn fail(self, error: SubscribeError) -> bool {
        self.respond(Err(error))
    }

    /// 等待控制器丢弃这次请求
    pub async fn aborted(&mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.responder.closed())
            .await
            .is_ok()
    }
}

pub(crate) struct MockTransport {
    polls: mpsc::UnboundedSender<PendingPoll>,
    leaves: Mutex<Vec<Vec<Channel>>>,
    leave_results: Mutex<VecDeque<Result<()>>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PendingPoll>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            polls: tx,
            leaves: Mutex::new(Vec::new()),
            leave_results: Mutex::new(VecDeque::new()),
        });
        (transport, rx)
    }

    pub fn script_leave(&self, result: Result<()>) {
        self.leave_results.lock().push_back(result);
    }

    pub fn leaves(&self) -> Vec<Vec<Channel>> {
        self.leaves.lock().clone()
    }
}

#[async_trait]
impl PollTransport for MockTransport {
    async fn issue_poll(&self, request: PollRequest) -> Result<PollResponse> {
        let (tx, rx) = oneshot::channel();
        if self.polls.send(PendingPoll { request, responder: tx }).is_err() {
            return Err(SubscribeError::Transport("mock transport closed".to_string()));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SubscribeError::Transport("mock responder dropped".to_string())),
        }
    }

    async fn leave(&self, channels: Vec<Channel>) -> Result<()> {
        self.leaves.lock().push(channels);
        self.leave_results.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// 把每次回调记录成一行字符串
#[derive(Default)]
pub(crate) struct RecordingDelegate {
    calls: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, line: String) {
        self.calls.lock().push(line);
    }

    fn will(&self, name: &str, channels: &[Channel]) {
        self.record(format!("{}([{}])", name, describe(channels)));
    }

    fn did(&self, name: &str, channels: &[Channel], sequenced: bool) {
        self.record(format!("{}([{}], {})", name, describe(channels), sequenced));
    }

    fn fail(&self, name: &str, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        self.record(format!("{}([{}], {:?}, {})", name, describe(channels), error.kind(), sequenced));
    }
}

impl ChannelDelegate for RecordingDelegate {
    fn will_subscribe(&self, channels: &[Channel]) {
        self.will("will_subscribe", channels)
    }
    fn did_subscribe(&self, channels: &[Channel], sequenced: bool, client_state: &HashMap<String, ClientState>) {
        if client_state.is_empty() {
            self.did("did_subscribe", channels, sequenced)
        } else {
            let state = serde_json::to_string(client_state).unwrap_or_default();
            self.record(format!("did_subscribe([{}], {}, {})", describe(channels), sequenced, state));
        }
    }
    fn did_fail_subscribe(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        self.fail("did_fail_subscribe", channels, error, sequenced)
    }
    fn will_unsubscribe(&self, channels: &[Channel]) {
        self.will("will_unsubscribe", channels)
    }
    fn did_unsubscribe(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_unsubscribe", channels, sequenced)
    }
    fn did_fail_unsubscribe(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        self.fail("did_fail_unsubscribe", channels, error, sequenced)
    }
    fn did_receive_message(&self, message: &Message) {
        self.record(format!("did_receive_message({}, {})", message.channel, message.payload))
    }
    fn did_reset(&self) {
        self.record("did_reset".to_string())
    }
}

impl ChannelDelegateExt for RecordingDelegate {
    fn will_enable_presence(&self, channels: &[Channel]) {
        self.will("will_enable_presence", channels)
    }
    fn did_enable_presence(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_enable_presence", channels, sequenced)
    }
    fn did_fail_enable_presence(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        self.fail("did_fail_enable_presence", channels, error, sequenced)
    }
    fn will_disable_presence(&self, channels: &[Channel]) {
        self.will("will_disable_presence", channels)
    }
    fn did_disable_presence(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_disable_presence", channels, sequenced)
    }
    fn will_sync_subscribe(&self, channels: &[Channel]) {
        self.will("will_sync_subscribe", channels)
    }
    fn did_sync_subscribe(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_sync_subscribe", channels, sequenced)
    }
    fn will_sync_unsubscribe(&self, channels: &[Channel]) {
        self.will("will_sync_unsubscribe", channels)
    }
    fn did_sync_unsubscribe(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_sync_unsubscribe", channels, sequenced)
    }
    fn will_update_state(&self, channels: &[Channel]) {
        self.will("will_update_state", channels)
    }
    fn did_update_state(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_update_state", channels, sequenced)
    }
    fn did_fail_update_state(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        self.fail("did_fail_update_state", channels, error, sequenced)
    }
    fn will_restore(&self, channels: &[Channel]) {
        self.will("will_restore", channels)
    }
    fn did_restore(&self, channels: &[Channel], sequenced: bool) {
        self.did("did_restore", channels, sequenced)
    }
    fn did_fail_restore(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        self.fail("did_fail_restore", channels, error, sequenced)
    }
    fn did_receive_event(&self, event: &PresenceEvent) {
        self.record(format!("did_receive_event({}, {:?})", event.channel, event.action))
    }
    fn did_receive_sync_event(&self, event: &SyncEvent) {
        self.record(format!("did_receive_sync_event({}, {})", event.feed, event.object_id))
    }
    fn did_stop_polling(&self, error: &SubscribeError) {
        self.record(format!("did_stop_polling({:?})", error.kind()))
    }
}

/// 可配置答复的策略
pub(crate) struct ScriptedPolicy {
    pub keep_time_token: AtomicBool,
    pub restore: AtomicBool,
    pub restore_with_last_token: AtomicBool,
    pub fetched_state: Mutex<HashMap<String, ClientState>>,
    /// 钩子答复前的等待时间
    pub keep_delay: Mutex<Duration>,
    pub restore_delay: Mutex<Duration>,
    pub merge_delay: Mutex<Duration>,
    queries: Mutex<Vec<String>>,
    cache_updates: Mutex<Vec<(ClientState, Vec<Channel>)>>,
}

impl Default for ScriptedPolicy {
    fn default() -> Self {
        Self {
            keep_time_token: AtomicBool::new(true),
            restore: AtomicBool::new(true),
            restore_with_last_token: AtomicBool::new(true),
            fetched_state: Mutex::new(HashMap::new()),
            keep_delay: Mutex::new(Duration::ZERO),
            restore_delay: Mutex::new(Duration::ZERO),
            merge_delay: Mutex::new(Duration::ZERO),
            queries: Mutex::new(Vec::new()),
            cache_updates: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedPolicy {
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn cache_updates(&self) -> Vec<(ClientState, Vec<Channel>)> {
        self.cache_updates.lock().clone()
    }

    fn log(&self, query: &str) {
        self.queries.lock().push(query.to_string());
    }

    async fn pause(delay: &Mutex<Duration>) {
        let delay = *delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl OwnerPolicy for ScriptedPolicy {
    async fn should_keep_time_token_on_set_change(&self) -> bool {
        self.log("keep_time_token");
        Self::pause(&self.keep_delay).await;
        self.keep_time_token.load(Ordering::SeqCst)
    }

    async fn should_restore_subscription(&self) -> bool {
        self.log("restore");
        Self::pause(&self.restore_delay).await;
        self.restore.load(Ordering::SeqCst)
    }

    async fn should_restore_with_last_time_token(&self) -> bool {
        self.log("restore_with_last_token");
        self.restore_with_last_token.load(Ordering::SeqCst)
    }

    async fn merge_client_state(&self, current: &ClientState, update: &ClientState) -> ClientState {
        Self::pause(&self.merge_delay).await;
        merge_states(current, update)
    }

    async fn fetch_client_state(&self, channels: &[Channel]) -> HashMap<String, ClientState> {
        self.log("fetch_client_state");
        let fetched = self.fetched_state.lock();
        channels
            .iter()
            .filter_map(|c| fetched.get(c.name()).map(|s| (c.name().to_string(), s.clone())))
            .collect()
    }

    async fn update_client_state_cache(&self, state: &ClientState, channels: &[Channel]) {
        self.cache_updates.lock().push((state.clone(), channels.to_vec()));
    }
}

pub(crate) fn state(value: serde_json::Value) -> ClientState {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn message(channel: &str, payload: serde_json::Value, time_token: u64) -> IncomingEvent {
    IncomingEvent::Message(Message {
        channel: Channel::data(channel),
        subscription: None,
        payload,
        publisher: None,
        time_token: TimeToken::new(time_token),
    })
}

pub(crate) async fn next_poll(polls: &mut mpsc::UnboundedReceiver<PendingPoll>) -> PendingPoll {
    tokio::time::timeout(Duration::from_secs(2), polls.recv())
        .await
        .expect("no poll issued in time")
        .expect("transport closed")
}

/// 跳过还没带上 `channel` 状态的请求（它们会被合并结果取代）
pub(crate) async fn next_poll_with_state(
    polls: &mut mpsc::UnboundedReceiver<PendingPoll>,
    channel: &str,
) -> PendingPoll {
    loop {
        let poll = next_poll(polls).await;
        if poll.request.client_state.contains_key(channel) {
            return poll;
        }
    }
}

pub(crate) async fn assert_no_poll(polls: &mut mpsc::UnboundedReceiver<PendingPoll>) {
    let result = tokio::time::timeout(Duration::from_millis(100), polls.recv()).await;
    assert!(result.is_err(), "unexpected poll issued");
}

pub(crate) async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event in time")
        .expect("event stream closed")
}

/// 一直读到满足条件的事件，返回途经的全部事件（含最后一个）
pub(crate) async fn events_until<F>(events: &mut broadcast::Receiver<ChannelEvent>, mut done: F) -> Vec<ChannelEvent>
where
    F: FnMut(&ChannelEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}
