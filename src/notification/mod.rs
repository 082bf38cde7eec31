//! 通知层 - 从通知消息到 webhook 投递
//!
//! - `message`：与渠道无关的通知结构
//! - `formatter`：按渠道类型渲染 payload（discord / slack / teams / generic / 模板）
//! - `client`：单次投递 + 有限次重试
//! - `dispatcher`：并发扇出到所有启用的渠道
//! - `retry_queue`：可重试失败的后台补发队列

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod formatter;
pub mod message;
pub mod retry_queue;

pub use client::{calculate_backoff, DeliveryClient, DeliveryConfig, DeliveryOutcome, DeliveryRequest};
pub use dispatcher::{DispatchResult, Dispatcher, NotificationSink};
pub use error::{DeliveryError, FormatError};
pub use formatter::Formatter;
pub use message::{Notification, NotificationType};
pub use retry_queue::{QueueStats, QueuedDelivery, RetryQueue, RetryQueueConfig, RetryRequest};
