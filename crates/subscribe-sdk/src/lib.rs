//! Subscribe SDK - 长轮询订阅通道控制器
//!
//! 维护到发布/订阅后端的持续长轮询连接，并负责：
//! - 📡 频道集合：数据频道、频道组、presence 频道、数据同步 feed
//! - ⏱️ 时间令牌：断线续传，除 owner 授权外永不回退
//! - 📦 批次回调：一次复合变更的多个终态回调按声明顺序投递，带 `sequenced` 标记
//! - 🔁 指数退避重试：传输错误静默重试，超过上限才上报
//! - 🧵 单写者模型：集合、令牌与状态缓存只在一个 worker 任务里修改
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subscribe_sdk::{Channel, ControllerConfig, DefaultPolicy, Delegates, NoopDelegate, SubscriptionController};
//! # use subscribe_sdk::{PollRequest, PollResponse, PollTransport, Result};
//! # struct HttpTransport;
//! # #[async_trait::async_trait]
//! # impl PollTransport for HttpTransport {
//! #     async fn issue_poll(&self, _request: PollRequest) -> Result<PollResponse> { unimplemented!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let controller = SubscriptionController::spawn(
//!         ControllerConfig::builder().max_retries(3).build(),
//!         Arc::new(HttpTransport),
//!         Arc::new(DefaultPolicy),
//!         Delegates::new(Arc::new(NoopDelegate)),
//!     );
//!
//!     let mut events = controller.events();
//!     controller.subscribe(vec![Channel::data("room-1")], None)?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("收到事件: {}", event.event_type());
//!     }
//!
//!     controller.shutdown().await
//! }
//! ```

pub mod batch;
pub mod channel;
pub mod client_state;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod policy;
pub mod retry_policy;
pub mod subscription;
pub mod time_token;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// 重新导出核心类型，方便使用
pub use batch::{BatchCoordinator, BatchId, CompletedOperation, OperationId, OperationKind};
pub use channel::{Channel, ChannelKind};
pub use client_state::{merge_states, ClientState, ClientStateCache};
pub use config::{ControllerConfig, ControllerConfigBuilder, EventConfig, RetryConfig};
pub use controller::{ChangeBatch, ControllerStats, Operation, PollState, SubscriptionController};
pub use error::{ErrorKind, Result, SubscribeError};
pub use events::{ChannelDelegate, ChannelDelegateExt, ChannelEvent, Delegates, EventStats, NoopDelegate};
pub use policy::{DefaultPolicy, OwnerPolicy};
pub use retry_policy::{FailureClass, RetryDecision, RetryPolicy};
pub use subscription::{SubscriptionDelta, SubscriptionSet};
pub use time_token::{ResetReason, TimeToken, TimeTokenCursor};
pub use transport::{
    IncomingEvent, Message, PollRequest, PollResponse, PollTransport, PresenceAction, PresenceEvent, SyncAction,
    SyncEvent,
};

/// SDK 版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
