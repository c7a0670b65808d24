//! 时间令牌游标
//!
//! 每次成功轮询后由服务端返回，只由轮询循环推进。
//! 令牌只能前进；回退只能经由 [`TimeTokenCursor::reset`]，且调用方必须给出授权来源。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SubscribeError;

/// 时间令牌（线路上是十进制字符串，17 位精度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TimeToken(u64);

impl TimeToken {
    /// "now" 哨兵：让服务端分配当前时间点
    pub const NOW: TimeToken = TimeToken(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_now(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimeToken {
    type Err = SubscribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(TimeToken)
            .map_err(|e| SubscribeError::Decode(format!("invalid time token '{}': {}", s, e)))
    }
}

/// 重置来源（诊断用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetReason {
    /// 频道集合变化时 owner 拒绝保留令牌
    OwnerDeclinedKeep,
    /// 恢复订阅时 owner 拒绝使用上次令牌
    OwnerDeclinedLastToken,
    /// owner 放弃恢复订阅
    OwnerAbandonedRestore,
    /// owner 显式调用 reset()
    ExplicitReset,
}

/// 时间令牌游标（只在控制器 worker 内部修改）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeTokenCursor {
    current: TimeToken,
    was_reset: bool,
    last_reset_reason: Option<ResetReason>,
}

impl TimeTokenCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> TimeToken {
        self.current
    }

    /// 是否持有服务端分配的令牌（即"已订阅"）
    pub fn is_subscribed(&self) -> bool {
        !self.current.is_now()
    }

    pub fn was_reset(&self) -> bool {
        self.was_reset
    }

    pub fn last_reset_reason(&self) -> Option<ResetReason> {
        self.last_reset_reason
    }

    /// 应用服务端返回的新令牌
    ///
    /// 返回是否被接受；比当前值小的令牌会被拒绝。
    pub fn advance(&mut self, next: TimeToken) -> bool {
        if next.is_now() || next < self.current {
            tracing::warn!(
                "⚠️ 拒绝回退时间令牌: current={}, received={}",
                self.current,
                next
            );
            return false;
        }
        self.current = next;
        self.was_reset = false;
        true
    }

    /// 重置到 "now" 哨兵
    pub fn reset(&mut self, reason: ResetReason) {
        tracing::debug!("时间令牌重置: {} -> 0 ({:?})", self.current, reason);
        self.current = TimeToken::NOW;
        self.was_reset = true;
        self.last_reset_reason = Some(reason);
    }
}
