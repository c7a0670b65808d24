//! 长轮询传输层接口
//!
//! 连接池、TLS、签名与线路 JSON 编解码都由实现方负责；控制器只看到类型化的请求与响应。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::channel::{Channel, ChannelKind};
use crate::client_state::ClientState;
use crate::error::Result;
use crate::time_token::TimeToken;

/// 收到的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息实际所在的频道
    pub channel: Channel,
    /// 经由哪个订阅匹配（频道组订阅时为组）
    pub subscription: Option<Channel>,
    pub payload: Value,
    pub publisher: Option<String>,
    pub time_token: TimeToken,
}

/// presence 动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
}

/// presence 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// 对应的 presence 频道
    pub channel: Channel,
    pub action: PresenceAction,
    pub uuid: Option<String>,
    pub occupancy: u32,
    pub state: Option<ClientState>,
    pub timestamp: u64,
}

/// 数据对象同步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    Update,
    Delete,
    TransactionComplete,
}

/// 数据对象同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub feed: Channel,
    pub object_id: String,
    pub action: SyncAction,
    pub location: Option<String>,
    pub data: Value,
}

/// 一次轮询响应里的单个事件（保持线路顺序）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IncomingEvent {
    Message(Message),
    Presence(PresenceEvent),
    Sync(SyncEvent),
}

/// 轮询请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    /// 本控制器内递增的请求编号
    pub request_id: u64,
    /// 订阅集合快照（插入顺序）
    pub channels: Vec<Channel>,
    pub time_token: TimeToken,
    /// 随订阅一并发送的客户端状态
    pub client_state: HashMap<String, ClientState>,
}

impl PollRequest {
    /// 线路上的频道列表（数据 / presence / 同步 feed）
    pub fn wire_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.kind() != ChannelKind::Group)
            .map(|c| c.wire_name())
            .collect()
    }

    /// 线路上的频道组列表
    pub fn wire_groups(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.kind() == ChannelKind::Group)
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn covers(&self, channel: &Channel) -> bool {
        self.channels.contains(channel)
    }
}

/// 轮询响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<IncomingEvent>,
    pub time_token: TimeToken,
}

/// 传输层（由外部实现）
///
/// `issue_poll` 返回的 future 可能在任意 await 点被丢弃（请求被取代时）。
#[async_trait]
pub trait PollTransport: Send + Sync {
    /// 发起一次长轮询
    async fn issue_poll(&self, request: PollRequest) -> Result<PollResponse>;

    /// 通知服务端离开频道
    async fn leave(&self, channels: Vec<Channel>) -> Result<()> {
        let _ = channels;
        Ok(())
    }
}
