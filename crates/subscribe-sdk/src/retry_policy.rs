use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::SubscribeError;

/// 失败原因分类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureClass {
    /// 网络超时/断开 - 可重试
    Transport,
    /// 响应体无法解析 - 重新发起轮询即可
    Decode,
    /// 服务端拒绝 - 不重试
    Rejected(u16),
    /// 请求被取代 - 不是错误
    Superseded,
    /// 其他 - 不重试
    Fatal,
}

impl FailureClass {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transport | FailureClass::Decode)
    }

    /// 获取重试延迟倍数
    pub fn get_delay_multiplier(&self) -> f64 {
        match self {
            FailureClass::Transport => 1.0,
            // 解析失败通常是偶发的，快速重试
            FailureClass::Decode => 0.5,
            _ => 1.0,
        }
    }
}

impl From<&SubscribeError> for FailureClass {
    fn from(error: &SubscribeError) -> Self {
        match error {
            SubscribeError::Transport(_) => FailureClass::Transport,
            SubscribeError::Decode(_) => FailureClass::Decode,
            SubscribeError::BackendRejection { code, .. } => FailureClass::Rejected(*code),
            SubscribeError::CancelledBySupersession => FailureClass::Superseded,
            _ => FailureClass::Fatal,
        }
    }
}

/// 重试决定
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 等待后重试
    RetryAfter(Duration),
    /// 不可重试（立即上报）
    GiveUp,
    /// 次数耗尽（升级为致命错误）
    Exhausted,
}

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// 计算第 retry_count 次重试前的等待时间
    pub fn calculate_delay(&self, retry_count: u32, class: &FailureClass) -> Duration {
        // 基础延迟 = base_delay * (backoff_factor ^ retry_count)
        let base_delay = self.config.base_delay_ms as f64
            * self.config.backoff_factor.powf(retry_count as f64);

        // 应用失败原因的延迟倍数
        let adjusted_delay = base_delay * class.get_delay_multiplier();

        // 限制最大延迟
        let capped_delay = adjusted_delay.min(self.config.max_delay_ms as f64);

        // 添加随机抖动
        let jitter = capped_delay * self.config.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// 处理一次失败：retry_count 是已经重试过的次数
    pub fn on_failure(&self, retry_count: u32, error: &SubscribeError) -> RetryDecision {
        let class = FailureClass::from(error);
        if !class.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if retry_count >= self.config.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAfter(self.calculate_delay(retry_count, &class))
    }
}
