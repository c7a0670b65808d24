//! 频道模型
//!
//! 同一个标识符可以同时以不同类型出现（例如数据频道与其在线状态频道），
//! 它们互相独立：开启 presence 不会隐式订阅数据频道，反之亦然。

use serde::{Deserialize, Serialize};
use std::fmt;

/// presence 频道在线路上使用的后缀
pub const PRESENCE_SUFFIX: &str = "-pnpres";

/// 频道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    /// 普通数据频道
    Data,
    /// 在线状态频道（join/leave/state-change 事件）
    Presence,
    /// 频道组（服务端展开为一组频道）
    Group,
    /// 数据对象同步 feed 频道
    SyncFeed,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Data => write!(f, "data"),
            ChannelKind::Presence => write!(f, "presence"),
            ChannelKind::Group => write!(f, "group"),
            ChannelKind::SyncFeed => write!(f, "sync-feed"),
        }
    }
}

/// 频道（构造后不可变，按 name + kind 判等）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
}

impl Channel {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn data(name: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Data)
    }

    pub fn presence(name: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Presence)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Group)
    }

    pub fn sync_feed(name: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::SyncFeed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// 同名的另一种类型
    pub fn with_kind(&self, kind: ChannelKind) -> Self {
        Self::new(self.name.clone(), kind)
    }

    /// 线路上的名字：presence 频道带 `-pnpres` 后缀
    pub fn wire_name(&self) -> String {
        match self.kind {
            ChannelKind::Presence => format!("{}{}", self.name, PRESENCE_SUFFIX),
            _ => self.name.clone(),
        }
    }

    /// 从线路名解析（带 `-pnpres` 后缀的解析为 presence 频道）
    pub fn from_wire_name(wire: &str) -> Self {
        match wire.strip_suffix(PRESENCE_SUFFIX) {
            Some(base) if !base.is_empty() => Self::presence(base),
            _ => Self::data(wire),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// 把一组名字转换为指定类型的频道
pub fn channels_of<I, S>(names: I, kind: ChannelKind) -> Vec<Channel>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(|n| Channel::new(n, kind)).collect()
}

/// 日志里打印频道列表
pub(crate) fn describe(channels: &[Channel]) -> String {
    channels
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_by_name_and_kind() {
        assert_eq!(Channel::data("room-1"), Channel::data("room-1"));
        assert_ne!(Channel::data("room-1"), Channel::presence("room-1"));
        assert_eq!(Channel::data("room-1").with_kind(ChannelKind::Presence), Channel::presence("room-1"));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(Channel::presence("room-1").wire_name(), "room-1-pnpres");
        assert_eq!(Channel::data("room-1").wire_name(), "room-1");
        assert_eq!(Channel::from_wire_name("room-1-pnpres"), Channel::presence("room-1"));
        assert_eq!(Channel::from_wire_name("room-1"), Channel::data("room-1"));
        // 只有后缀时按普通频道处理
        assert_eq!(Channel::from_wire_name("-pnpres"), Channel::data("-pnpres"));
    }
}
