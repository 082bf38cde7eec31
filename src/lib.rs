//! Worklog Notify - 时间追踪通知核心
//!
//! 周期性检测提醒、空闲、休息、目标里程碑和每日汇总，并把通知并发投递到所有启用的 webhook。

pub mod checker;
pub mod config;
pub mod daemon;
pub mod model;
pub mod notification;
pub mod scheduler;
pub mod store;

pub use checker::{
    continuous_session, BreakChecker, Checker, GoalChecker, IdleChecker, ReminderChecker, Repositories,
    Session, SummaryGenerator,
};
pub use config::NotifierConfig;
pub use daemon::NotifierDaemon;
pub use model::{Block, Goal, GoalPeriod, NotifyPrefs, Project, Reminder, Webhook, WebhookKind};
pub use notification::{
    calculate_backoff, DeliveryClient, DeliveryConfig, DeliveryError, DispatchResult, Dispatcher,
    FormatError, Formatter, Notification, NotificationSink, NotificationType, QueueStats, RetryQueue,
    RetryQueueConfig, RetryRequest,
};
pub use scheduler::{Scheduler, SchedulerConfig, TickOutcome};
pub use store::{
    BlockRepository, GoalRepository, MemoryStore, PrefsRepository, ProjectRepository, ReminderRepository,
    WebhookRepository,
};
