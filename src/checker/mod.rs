//! 事件检测 - 由调度器周期性调用的各类 checker
//!
//! 每个 checker 持有自己的去重状态（只在进程内存中），从仓储层读取当前事实，
//! 决定是否需要发出新的通知。去重状态只由调度器单线程访问，不需要加锁。

pub mod breaks;
pub mod goal;
pub mod idle;
pub mod reminder;
pub mod summary;

pub use breaks::{continuous_session, BreakChecker, Session};
pub use goal::GoalChecker;
pub use idle::IdleChecker;
pub use reminder::ReminderChecker;
pub use summary::SummaryGenerator;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, TimeZone};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::notification::{NotificationSink, Notification};
use crate::store::{
    BlockRepository, GoalRepository, PrefsRepository, ProjectRepository, ReminderRepository,
};

/// 周期性检测任务
#[async_trait]
pub trait Checker: Send {
    /// 日志里使用的名称
    fn name(&self) -> &'static str;

    /// 以 `now` 作为当前时间执行一次检测
    async fn check_at(&mut self, now: DateTime<Local>) -> Result<()>;

    /// 以当前时间检测；仓储错误只记日志，视为本轮无事可做
    async fn check(&mut self) {
        if let Err(e) = self.check_at(Local::now()).await {
            warn!(checker = self.name(), error = %e, "Check failed, skipping this tick");
        }
    }
}

/// checker 依赖的只读仓储
#[derive(Clone)]
pub struct Repositories {
    pub reminders: Arc<dyn ReminderRepository>,
    pub blocks: Arc<dyn BlockRepository>,
    pub goals: Arc<dyn GoalRepository>,
    pub projects: Arc<dyn ProjectRepository>,
    pub prefs: Arc<dyn PrefsRepository>,
}

impl Repositories {
    /// 同一个存储实现了全部仓储接口时的便捷构造
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ReminderRepository
            + BlockRepository
            + GoalRepository
            + ProjectRepository
            + PrefsRepository
            + 'static,
    {
        Self {
            reminders: store.clone(),
            blocks: store.clone(),
            goals: store.clone(),
            projects: store.clone(),
            prefs: store,
        }
    }
}

/// 把通知交给分发器并记录结果
pub(crate) async fn submit(sink: &dyn NotificationSink, checker: &str, notification: &Notification) {
    let results = sink.send_notification(notification).await;
    if results.is_empty() {
        debug!(checker, title = %notification.title, "No channels received notification");
        return;
    }
    let delivered = results.iter().filter(|r| r.success).count();
    info!(
        checker,
        title = %notification.title,
        delivered,
        total = results.len(),
        "Notification submitted"
    );
}

/// 当天 00:00（本地时区）
pub fn start_of_day(now: DateTime<Local>) -> DateTime<Local> {
    local_midnight(now.date_naive(), now)
}

/// 本周一 00:00（本地时区）
pub fn start_of_week(now: DateTime<Local>) -> DateTime<Local> {
    let days_from_monday = now.weekday().num_days_from_monday() as i64;
    local_midnight(now.date_naive() - Duration::days(days_from_monday), now)
}

fn local_midnight(date: chrono::NaiveDate, fallback: DateTime<Local>) -> DateTime<Local> {
    Local
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .unwrap_or(fallback)
}

/// 时长的简短显示："1h 55m" / "45m"
pub fn format_duration(d: Duration) -> String {
    let minutes = d.num_minutes().max(0);
    let (h, m) = (minutes / 60, minutes % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else {
        format!("{}m", m)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::at;
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::minutes(115)), "1h 55m");
        assert_eq!(format_duration(Duration::minutes(45)), "45m");
        assert_eq!(format_duration(Duration::hours(4)), "4h 0m");
        assert_eq!(format_duration(Duration::minutes(-3)), "0m");
    }

    #[test]
    fn test_period_starts() {
        // 2026-03-11 是周三
        let now = at(11, 15, 30);
        assert_eq!(start_of_day(now), at(11, 0, 0));
        assert_eq!(start_of_week(now), at(9, 0, 0));
        assert_eq!(start_of_week(at(9, 8, 0)), at(9, 0, 0));
    }
}
