//! 客户端状态缓存
//!
//! 每个频道名对应一份 key/value 文档，订阅请求会把当前状态一并带上。
//! 合并规则：顶层 key 后写覆盖，值为 `null` 表示删除该 key；缓存保存合并结果而不是增量。

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use crate::channel::Channel;

/// 单个频道上的客户端状态文档
pub type ClientState = Map<String, Value>;

/// 合并两份状态（后写覆盖，null 删除）
pub fn merge_states(current: &ClientState, update: &ClientState) -> ClientState {
    let mut merged = current.clone();
    for (key, value) in update {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// 客户端状态缓存（只在 worker 内部写入）
#[derive(Debug, Clone, Default)]
pub struct ClientStateCache {
    entries: HashMap<String, ClientState>,
}

impl ClientStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取某个频道的状态
    pub fn get(&self, channel: &str) -> Option<&ClientState> {
        self.entries.get(channel)
    }

    /// 批量读取（只返回有状态的频道）
    pub fn state_for(&self, channels: &[Channel]) -> HashMap<String, ClientState> {
        let mut result = HashMap::new();
        for channel in channels {
            if let Some(state) = self.entries.get(channel.name()) {
                result.insert(channel.name().to_string(), state.clone());
            }
        }
        result
    }

    /// 以某个频道的当前缓存为基础预览合并结果（不写入）
    pub fn preview_merge(&self, channel: &str, update: &ClientState) -> ClientState {
        match self.entries.get(channel) {
            Some(current) => merge_states(current, update),
            None => merge_states(&ClientState::new(), update),
        }
    }

    /// 写入合并后的完整状态；空文档等同于删除
    pub fn store(&mut self, channel: &str, merged: ClientState) {
        if merged.is_empty() {
            self.entries.remove(channel);
        } else {
            self.entries.insert(channel.to_string(), merged);
        }
    }

    /// 合并并写入，返回合并结果
    pub fn merge(&mut self, channel: &str, update: &ClientState) -> ClientState {
        let merged = self.preview_merge(channel, update);
        self.store(channel, merged.clone());
        merged
    }

    /// 写入 owner 返回的合并结果，返回实际写入的频道与状态
    ///
    /// 结果里缺少的频道保留原来的缓存。
    pub fn apply_merged(
        &mut self,
        channels: &[Channel],
        merged: &HashMap<String, ClientState>,
    ) -> Vec<(Channel, ClientState)> {
        let mut stored = Vec::with_capacity(channels.len());
        for channel in channels {
            match merged.get(channel.name()) {
                Some(state) => {
                    self.store(channel.name(), state.clone());
                    stored.push((channel.clone(), state.clone()));
                }
                None => warn!("⚠️ 合并结果缺少频道 {}，保留原状态", channel),
            }
        }
        stored
    }

    pub fn remove(&mut self, channel: &str) -> Option<ClientState> {
        self.entries.remove(channel)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> ClientState {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_merge_last_write_wins_per_key() {
        let mut cache = ClientStateCache::new();
        cache.merge("room-1", &doc(json!({"mood": "ok", "age": 3})));
        let merged = cache.merge("room-1", &doc(json!({"mood": "great", "city": "x"})));

        assert_eq!(merged, doc(json!({"mood": "great", "age": 3, "city": "x"})));
        assert_eq!(cache.get("room-1"), Some(&merged));
    }

    #[test]
    fn test_null_removes_key_and_empty_removes_entry() {
        let mut cache = ClientStateCache::new();
        cache.merge("room-1", &doc(json!({"mood": "ok"})));
        let merged = cache.merge("room-1", &doc(json!({"mood": null})));

        assert!(merged.is_empty());
        assert!(cache.get("room-1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_apply_merged_keeps_channels_missing_from_result() {
        let mut cache = ClientStateCache::new();
        cache.merge("room-1", &doc(json!({"mood": "ok"})));
        cache.merge("room-2", &doc(json!({"mood": "calm"})));

        let merged = HashMap::from([("room-1".to_string(), doc(json!({"mood": "busy"})))]);
        let stored = cache.apply_merged(&[Channel::data("room-1"), Channel::data("room-2")], &merged);

        assert_eq!(stored, vec![(Channel::data("room-1"), doc(json!({"mood": "busy"})))]);
        assert_eq!(cache.get("room-1"), Some(&doc(json!({"mood": "busy"}))));
        assert_eq!(cache.get("room-2"), Some(&doc(json!({"mood": "calm"}))));
    }

    #[test]
    fn test_state_for_uses_channel_name() {
        let mut cache = ClientStateCache::new();
        cache.merge("room-1", &doc(json!({"mood": "ok"})));

        let state = cache.state_for(&[Channel::presence("room-1"), Channel::data("room-2")]);
        assert_eq!(state.len(), 1);
        assert_eq!(state["room-1"]["mood"], json!("ok"));
    }
}
