//! 事件派发
//!
//! 每个离散的语义事件对应一次 delegate 调用，同时广播给 `events()` 的订阅者。
//! - 变更操作：will-X（发请求前）→ did-X / did-fail-X（带批次 sequenced 标记）
//! - 轮询投递：消息、presence 事件、同步事件各一次，不带批次标记
//!
//! owner 分两层接口：核心 [`ChannelDelegate`] 必须实现；扩展 [`ChannelDelegateExt`] 可选，
//! 方法默认为空实现。两者都在构造控制器时给定。

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::batch::{CompletedOperation, OperationKind};
use crate::channel::Channel;
use crate::client_state::{ClientState, ClientStateCache};
use crate::error::SubscribeError;
use crate::transport::{Message, PresenceEvent, SyncEvent};

/// 派发给 owner 的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// 即将执行某个操作
    Will {
        kind: OperationKind,
        channels: Vec<Channel>,
    },
    /// 操作成功
    Did {
        kind: OperationKind,
        channels: Vec<Channel>,
        sequenced: bool,
    },
    /// 操作失败
    DidFail {
        kind: OperationKind,
        channels: Vec<Channel>,
        error: String,
        error_kind: crate::error::ErrorKind,
        sequenced: bool,
    },
    /// 收到消息
    MessageReceived(Message),
    /// 收到 presence 事件
    PresenceEventReceived(PresenceEvent),
    /// 收到数据同步事件
    SyncEventReceived(SyncEvent),
    /// 控制器已重置
    Reset,
    /// 轮询循环因致命错误停止
    PollingStopped { error: String },
}

impl ChannelEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ChannelEvent::Will { .. } => "will",
            ChannelEvent::Did { .. } => "did",
            ChannelEvent::DidFail { .. } => "did_fail",
            ChannelEvent::MessageReceived(_) => "message_received",
            ChannelEvent::PresenceEventReceived(_) => "presence_event_received",
            ChannelEvent::SyncEventReceived(_) => "sync_event_received",
            ChannelEvent::Reset => "reset",
            ChannelEvent::PollingStopped { .. } => "polling_stopped",
        }
    }

    /// 操作类事件的批次标记
    pub fn sequenced(&self) -> Option<bool> {
        match self {
            ChannelEvent::Did { sequenced, .. } | ChannelEvent::DidFail { sequenced, .. } => Some(*sequenced),
            _ => None,
        }
    }

    /// 操作类事件的操作类型
    pub fn operation_kind(&self) -> Option<OperationKind> {
        match self {
            ChannelEvent::Will { kind, .. }
            | ChannelEvent::Did { kind, .. }
            | ChannelEvent::DidFail { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// 从批次终态构造
    pub fn from_completed(completed: &CompletedOperation) -> Self {
        match &completed.result {
            Ok(()) => ChannelEvent::Did {
                kind: completed.kind,
                channels: completed.channels.clone(),
                sequenced: completed.sequenced,
            },
            Err(e) => ChannelEvent::DidFail {
                kind: completed.kind,
                channels: completed.channels.clone(),
                error: e.to_string(),
                error_kind: e.kind(),
                sequenced: completed.sequenced,
            },
        }
    }
}

/// 核心 delegate（必须实现）
pub trait ChannelDelegate: Send + Sync {
    fn will_subscribe(&self, channels: &[Channel]);
    /// `client_state` 是订阅完成时这些频道的缓存状态（按频道名，没有状态的频道不出现）
    fn did_subscribe(&self, channels: &[Channel], sequenced: bool, client_state: &HashMap<String, ClientState>);
    fn did_fail_subscribe(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool);

    fn will_unsubscribe(&self, channels: &[Channel]);
    fn did_unsubscribe(&self, channels: &[Channel], sequenced: bool);
    fn did_fail_unsubscribe(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool);

    fn did_receive_message(&self, message: &Message);
    fn did_reset(&self);
}

/// 扩展 delegate（可选，默认空实现）
#[allow(unused_variables)]
pub trait ChannelDelegateExt: Send + Sync {
    fn will_enable_presence(&self, channels: &[Channel]) {}
    fn did_enable_presence(&self, channels: &[Channel], sequenced: bool) {}
    fn did_fail_enable_presence(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {}

    fn will_disable_presence(&self, channels: &[Channel]) {}
    fn did_disable_presence(&self, channels: &[Channel], sequenced: bool) {}
    fn did_fail_disable_presence(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {}

    fn will_sync_subscribe(&self, channels: &[Channel]) {}
    fn did_sync_subscribe(&self, channels: &[Channel], sequenced: bool) {}
    fn did_fail_sync_subscribe(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {}

    fn will_sync_unsubscribe(&self, channels: &[Channel]) {}
    fn did_sync_unsubscribe(&self, channels: &[Channel], sequenced: bool) {}
    fn did_fail_sync_unsubscribe(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {}

    fn will_update_state(&self, channels: &[Channel]) {}
    fn did_update_state(&self, channels: &[Channel], sequenced: bool) {}
    fn did_fail_update_state(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {}

    fn will_restore(&self, channels: &[Channel]) {}
    fn did_restore(&self, channels: &[Channel], sequenced: bool) {}
    fn did_fail_restore(&self, channels: &[Channel], error: &SubscribeError, sequenced: bool) {}

    fn did_receive_event(&self, event: &PresenceEvent) {}
    fn did_receive_sync_event(&self, event: &SyncEvent) {}
    fn did_stop_polling(&self, error: &SubscribeError) {}
}

/// 什么都不做的核心 delegate（只用广播流时使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ChannelDelegate for NoopDelegate {
    fn will_subscribe(&self, _channels: &[Channel]) {}
    fn did_subscribe(&self, _channels: &[Channel], _sequenced: bool, _client_state: &HashMap<String, ClientState>) {}
    fn did_fail_subscribe(&self, _channels: &[Channel], _error: &SubscribeError, _sequenced: bool) {}
    fn will_unsubscribe(&self, _channels: &[Channel]) {}
    fn did_unsubscribe(&self, _channels: &[Channel], _sequenced: bool) {}
    fn did_fail_unsubscribe(&self, _channels: &[Channel], _error: &SubscribeError, _sequenced: bool) {}
    fn did_receive_message(&self, _message: &Message) {}
    fn did_reset(&self) {}
}

/// owner 侧接口组合
#[derive(Clone)]
pub struct Delegates {
    pub core: Arc<dyn ChannelDelegate>,
    pub extended: Option<Arc<dyn ChannelDelegateExt>>,
}

impl Delegates {
    pub fn new(core: Arc<dyn ChannelDelegate>) -> Self {
        Self { core, extended: None }
    }

    pub fn with_extended(mut self, extended: Arc<dyn ChannelDelegateExt>) -> Self {
        self.extended = Some(extended);
        self
    }
}

impl Default for Delegates {
    fn default() -> Self {
        Self::new(Arc::new(NoopDelegate))
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间（UTC毫秒时间戳）
    pub last_event_time: Option<i64>,
}

/// 事件派发器（只由 worker 调用）
pub struct EventDispatcher {
    delegates: Delegates,
    sender: broadcast::Sender<ChannelEvent>,
    stats: Mutex<EventStats>,
}

impl EventDispatcher {
    pub fn new(delegates: Delegates, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            delegates,
            sender,
            stats: Mutex::new(EventStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    /// 广播发送端（控制器句柄用来创建新的接收端）
    pub fn sender(&self) -> broadcast::Sender<ChannelEvent> {
        self.sender.clone()
    }

    pub fn stats(&self) -> EventStats {
        self.stats.lock().clone()
    }

    /// 发出 will-X
    pub fn will(&self, kind: OperationKind, channels: &[Channel]) {
        self.dispatch(ChannelEvent::Will {
            kind,
            channels: channels.to_vec(),
        });
    }

    /// 发出一组批次终态（已由协调器排好顺序）
    pub fn completed(&self, completed: &[CompletedOperation], cache: &ClientStateCache) {
        for op in completed {
            self.dispatch_completed(op, cache);
        }
    }

    fn dispatch_completed(&self, op: &CompletedOperation, cache: &ClientStateCache) {
        match &op.result {
            Ok(()) => self.route_did(op.kind, &op.channels, op.sequenced, cache),
            Err(e) => self.route_did_fail(op.kind, &op.channels, e, op.sequenced),
        }
        self.publish(ChannelEvent::from_completed(op));
    }

    pub fn message(&self, message: Message) {
        self.delegates.core.did_receive_message(&message);
        self.publish(ChannelEvent::MessageReceived(message));
    }

    pub fn presence(&self, event: PresenceEvent) {
        if let Some(ext) = &self.delegates.extended {
            ext.did_receive_event(&event);
        }
        self.publish(ChannelEvent::PresenceEventReceived(event));
    }

    pub fn sync_event(&self, event: SyncEvent) {
        if let Some(ext) = &self.delegates.extended {
            ext.did_receive_sync_event(&event);
        }
        self.publish(ChannelEvent::SyncEventReceived(event));
    }

    pub fn reset(&self) {
        self.delegates.core.did_reset();
        self.publish(ChannelEvent::Reset);
    }

    pub fn polling_stopped(&self, error: &SubscribeError) {
        if let Some(ext) = &self.delegates.extended {
            ext.did_stop_polling(error);
        }
        self.publish(ChannelEvent::PollingStopped {
            error: error.to_string(),
        });
    }

    /// 通用入口（Will 事件与测试用）
    pub fn dispatch(&self, event: ChannelEvent) {
        if let ChannelEvent::Will { kind, channels } = &event {
            self.route_will(*kind, channels);
        }
        self.publish(event);
    }

    fn route_will(&self, kind: OperationKind, channels: &[Channel]) {
        let core = &self.delegates.core;
        let ext = self.delegates.extended.as_deref();
        match kind {
            OperationKind::Subscribe => core.will_subscribe(channels),
            OperationKind::Unsubscribe => core.will_unsubscribe(channels),
            OperationKind::EnablePresence => ext.map_or((), |e| e.will_enable_presence(channels)),
            OperationKind::DisablePresence => ext.map_or((), |e| e.will_disable_presence(channels)),
            OperationKind::SyncSubscribe => ext.map_or((), |e| e.will_sync_subscribe(channels)),
            OperationKind::SyncUnsubscribe => ext.map_or((), |e| e.will_sync_unsubscribe(channels)),
            OperationKind::UpdateState => ext.map_or((), |e| e.will_update_state(channels)),
            OperationKind::Restore => ext.map_or((), |e| e.will_restore(channels)),
        }
    }

    fn route_did(&self, kind: OperationKind, channels: &[Channel], sequenced: bool, cache: &ClientStateCache) {
        let core = &self.delegates.core;
        let ext = self.delegates.extended.as_deref();
        match kind {
            OperationKind::Subscribe => core.did_subscribe(channels, sequenced, &cache.state_for(channels)),
            OperationKind::Unsubscribe => core.did_unsubscribe(channels, sequenced),
            OperationKind::EnablePresence => ext.map_or((), |e| e.did_enable_presence(channels, sequenced)),
            OperationKind::DisablePresence => ext.map_or((), |e| e.did_disable_presence(channels, sequenced)),
            OperationKind::SyncSubscribe => ext.map_or((), |e| e.did_sync_subscribe(channels, sequenced)),
            OperationKind::SyncUnsubscribe => ext.map_or((), |e| e.did_sync_unsubscribe(channels, sequenced)),
            OperationKind::UpdateState => ext.map_or((), |e| e.did_update_state(channels, sequenced)),
            OperationKind::Restore => ext.map_or((), |e| e.did_restore(channels, sequenced)),
        }
    }

    fn route_did_fail(&self, kind: OperationKind, channels: &[Channel], error: &SubscribeError, sequenced: bool) {
        let core = &self.delegates.core;
        let ext = self.delegates.extended.as_deref();
        match kind {
            OperationKind::Subscribe => core.did_fail_subscribe(channels, error, sequenced),
            OperationKind::Unsubscribe => core.did_fail_unsubscribe(channels, error, sequenced),
            OperationKind::EnablePresence => {
                ext.map_or((), |e| e.did_fail_enable_presence(channels, error, sequenced))
            }
            OperationKind::DisablePresence => {
                ext.map_or((), |e| e.did_fail_disable_presence(channels, error, sequenced))
            }
            OperationKind::SyncSubscribe => {
                ext.map_or((), |e| e.did_fail_sync_subscribe(channels, error, sequenced))
            }
            OperationKind::SyncUnsubscribe => {
                ext.map_or((), |e| e.did_fail_sync_unsubscribe(channels, error, sequenced))
            }
            OperationKind::UpdateState => ext.map_or((), |e| e.did_fail_update_state(channels, error, sequenced)),
            OperationKind::Restore => ext.map_or((), |e| e.did_fail_restore(channels, error, sequenced)),
        }
    }

    fn publish(&self, event: ChannelEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(Utc::now().timestamp_millis());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::CompletedOperation;
    use crate::test_support::RecordingDelegate;

    fn completed(kind: OperationKind, sequenced: bool, result: Result<(), SubscribeError>) -> CompletedOperation {
        CompletedOperation {
            batch_id: 1,
            operation_id: 1,
            kind,
            channels: vec![Channel::data("room-1")],
            result,
            sequenced,
        }
    }

    #[tokio::test]
    async fn test_routes_core_and_extended_calls() {
        let recorder = Arc::new(RecordingDelegate::default());
        let dispatcher = EventDispatcher::new(
            Delegates::new(recorder.clone()).with_extended(recorder.clone()),
            16,
        );
        let mut rx = dispatcher.subscribe();

        dispatcher.will(OperationKind::EnablePresence, &[Channel::presence("room-1")]);
        dispatcher.completed(
            &[
                completed(OperationKind::EnablePresence, true, Ok(())),
                completed(OperationKind::Subscribe, false, Err(SubscribeError::rejection(403, "denied"))),
            ],
            &ClientStateCache::new(),
        );
        dispatcher.reset();

        assert_eq!(
            recorder.calls(),
            vec![
                "will_enable_presence([presence:room-1])".to_string(),
                "did_enable_presence([data:room-1], true)".to_string(),
                "did_fail_subscribe([data:room-1], BackendRejection, false)".to_string(),
                "did_reset".to_string(),
            ]
        );

        assert_eq!(rx.recv().await.unwrap().event_type(), "will");
        assert_eq!(rx.recv().await.unwrap().sequenced(), Some(true));
        assert_eq!(rx.recv().await.unwrap().sequenced(), Some(false));
        assert_eq!(rx.recv().await.unwrap(), ChannelEvent::Reset);

        let stats = dispatcher.stats();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.events_by_type.get("did"), Some(&1));
    }

    #[tokio::test]
    async fn test_extended_calls_are_optional() {
        let recorder = Arc::new(RecordingDelegate::default());
        let dispatcher = EventDispatcher::new(Delegates::new(recorder.clone()), 16);
        let mut rx = dispatcher.subscribe();

        dispatcher.completed(
            &[completed(OperationKind::SyncSubscribe, false, Ok(()))],
            &ClientStateCache::new(),
        );

        // 没有扩展 delegate：不调用，但广播照常
        assert!(recorder.calls().is_empty());
        assert_eq!(rx.recv().await.unwrap().operation_kind(), Some(OperationKind::SyncSubscribe));
    }

    #[tokio::test]
    async fn test_did_subscribe_carries_cached_state() {
        let recorder = Arc::new(RecordingDelegate::default());
        let dispatcher = EventDispatcher::new(Delegates::new(recorder.clone()), 16);
        let mut cache = ClientStateCache::new();
        cache.merge("room-1", &crate::test_support::state(serde_json::json!({"mood": "ok"})));

        dispatcher.completed(&[completed(OperationKind::Subscribe, false, Ok(()))], &cache);

        assert_eq!(
            recorder.calls(),
            vec!["did_subscribe([data:room-1], false, {\"room-1\":{\"mood\":\"ok\"}})".to_string()]
        );
    }
}
