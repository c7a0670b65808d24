//! 控制器配置

use serde::{Deserialize, Serialize};

/// 重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数（超过后升级为致命错误）
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 32_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// 广播通道容量
    pub broadcast_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
        }
    }
}

/// 订阅控制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// 重试配置
    pub retry_config: RetryConfig,
    /// 事件配置
    pub event_config: EventConfig,
    /// 被取代的请求是否直接中止（false 时等响应回来再丢弃）
    pub abort_superseded_requests: bool,
    /// 取消订阅数据频道时是否发送 leave
    pub leave_on_unsubscribe: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_config: RetryConfig::default(),
            event_config: EventConfig::default(),
            abort_superseded_requests: true,
            leave_on_unsubscribe: true,
        }
    }
}

impl ControllerConfig {
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::new()
    }
}

pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.config.retry_config = retry_config;
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry_config.max_retries = max_retries;
        self
    }

    /// 设置退避区间（毫秒）
    pub fn backoff(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.config.retry_config.base_delay_ms = base_delay_ms;
        self.config.retry_config.max_delay_ms = max_delay_ms.max(base_delay_ms);
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.event_config.broadcast_capacity = capacity.max(1);
        self
    }

    pub fn abort_superseded_requests(mut self, abort: bool) -> Self {
        self.config.abort_superseded_requests = abort;
        self
    }

    pub fn leave_on_unsubscribe(mut self, leave: bool) -> Self {
        self.config.leave_on_unsubscribe = leave;
        self
    }

    pub fn build(self) -> ControllerConfig {
        self.config
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
