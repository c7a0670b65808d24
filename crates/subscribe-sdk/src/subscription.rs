//! 订阅集合
//!
//! 记录当前活跃的数据频道、频道组、presence 频道与同步 feed 频道。
//! 快照按插入顺序输出，保证轮询请求是确定的。

use std::collections::HashSet;

use crate::channel::{Channel, ChannelKind};

/// 一次 add/remove 实际生效的变化
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub added: Vec<Channel>,
    pub removed: Vec<Channel>,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// 订阅集合（name + kind 唯一）
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    /// 插入顺序
    ordered: Vec<Channel>,
    /// 去重索引
    index: HashSet<Channel>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加频道，已存在的频道不计入 delta
    pub fn add(&mut self, channels: &[Channel]) -> SubscriptionDelta {
        let mut delta = SubscriptionDelta::default();
        for channel in channels {
            if self.index.insert(channel.clone()) {
                self.ordered.push(channel.clone());
                delta.added.push(channel.clone());
            }
        }
        delta
    }

    /// 按名字与类型添加
    pub fn add_as<I, S>(&mut self, names: I, kind: ChannelKind) -> SubscriptionDelta
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = crate::channel::channels_of(names, kind);
        self.add(&channels)
    }

    /// 移除频道，不存在的频道忽略
    pub fn remove(&mut self, channels: &[Channel]) -> SubscriptionDelta {
        let mut delta = SubscriptionDelta::default();
        for channel in channels {
            if self.index.remove(channel) {
                delta.removed.push(channel.clone());
            }
        }
        if !delta.removed.is_empty() {
            let index = &self.index;
            self.ordered.retain(|c| index.contains(c));
        }
        delta
    }

    /// 按名字与类型移除
    pub fn remove_as<I, S>(&mut self, names: I, kind: ChannelKind) -> SubscriptionDelta
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = crate::channel::channels_of(names, kind);
        self.remove(&channels)
    }

    /// 当前快照（插入顺序）
    pub fn snapshot(&self) -> Vec<Channel> {
        self.ordered.clone()
    }

    /// 某一类型的频道
    pub fn of_kind(&self, kind: ChannelKind) -> Vec<Channel> {
        self.ordered.iter().filter(|c| c.kind() == kind).cloned().collect()
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.index.contains(channel)
    }

    /// 同名频道是否还以任意类型存在
    pub fn contains_name(&self, name: &str) -> bool {
        self.ordered.iter().any(|c| c.name() == name)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// 清空并返回原内容
    pub fn clear(&mut self) -> Vec<Channel> {
        self.index.clear();
        std::mem::take(&mut self.ordered)
    }
}
