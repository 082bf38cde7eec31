//! 提醒检测 - 截止时间前按配置的提前量通知
//!
//! 每个提醒的每个提前量（再加上隐含的“已到期”提前量 0）都有一个通知窗口：
//! `[deadline - offset, deadline - offset + window)`。窗口长度等于调度器快 tick 的间隔，
//! 正常 tick 下每个窗口恰好被命中一次。
//!
//! 去重：`reminder key -> {offset -> notified_at}`，条目在 TTL 后过期，
//! TTL 始终大于窗口，所以过期后不会在同一窗口里再次触发。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{format_duration, submit, Checker, Repositories};
use crate::model::Reminder;
use crate::notification::{Notification, NotificationSink, NotificationType};
use crate::store::{load_prefs, project_display_name};

/// TTL 的下限
const MIN_DEDUP_TTL_MINUTES: i64 = 5;

pub struct ReminderChecker {
    repos: Repositories,
    sink: Arc<dyn NotificationSink>,
    window: Duration,
    ttl: Duration,
    notified: HashMap<String, HashMap<i64, DateTime<Local>>>,
}

impl ReminderChecker {
    /// `window` 应等于快 tick 的间隔
    pub fn new(repos: Repositories, sink: Arc<dyn NotificationSink>, window: std::time::Duration) -> Self {
        let window = Duration::from_std(window)
            .ok()
            .filter(|w| *w > Duration::zero())
            .unwrap_or_else(|| Duration::minutes(1));
        let ttl = (window * 5).max(Duration::minutes(MIN_DEDUP_TTL_MINUTES));
        Self {
            repos,
            sink,
            window,
            ttl,
            notified: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn dedup_ttl(&self) -> Duration {
        self.ttl
    }

    /// 当前去重表中的条目数（所有提醒的所有提前量）
    pub fn tracked_entries(&self) -> usize {
        self.notified.values().map(|m| m.len()).sum()
    }

    /// 清理已完成/已删除提醒的条目，以及超过 TTL 的条目
    fn prune(&mut self, pending: &[Reminder], now: DateTime<Local>) {
        let live: HashSet<&str> = pending.iter().map(|r| r.key.as_str()).collect();
        let ttl = self.ttl;
        self.notified.retain(|key, offsets| {
            if !live.contains(key.as_str()) {
                return false;
            }
            offsets.retain(|_, notified_at| now - *notified_at < ttl);
            !offsets.is_empty()
        });
    }

    fn is_notified(&self, key: &str, offset: i64) -> bool {
        self.notified
            .get(key)
            .is_some_and(|offsets| offsets.contains_key(&offset))
    }

    fn mark_notified(&mut self, key: &str, offset: i64, now: DateTime<Local>) {
        self.notified
            .entry(key.to_string())
            .or_default()
            .insert(offset, now);
    }

    /// 当前时间是否落在某个提前量的通知窗口里
    /// offset 为 0 时窗口落在截止时间之后：`[deadline, deadline + window)`，
    /// 截止前最后一分钟不算“已到期”
    fn in_window(&self, deadline: DateTime<Local>, offset_minutes: i64, now: DateTime<Local>) -> bool {
        let offset = Duration::minutes(offset_minutes);
        let time_until = deadline - now;
        time_until <= offset && time_until > offset - self.window
    }

    fn build_notification(&self, reminder: &Reminder, offset_minutes: i64) -> Notification {
        let message = match offset_minutes {
            0 => "Due now".to_string(),
            m => format!("Due in {}", format_duration(Duration::minutes(m))),
        };
        let message = match &reminder.description {
            Some(desc) if !desc.trim().is_empty() => format!("{}\n{}", message, desc.trim()),
            _ => message,
        };

        let mut notification = Notification::new(
            NotificationType::Reminder,
            format!("Reminder: {}", reminder.title),
            message,
        )
        .with_field("Deadline", reminder.deadline.format("%Y-%m-%d %H:%M").to_string());
        if let Some(project_key) = &reminder.project_key {
            notification = notification.with_field(
                "Project",
                project_display_name(self.repos.projects.as_ref(), project_key),
            );
        }
        notification
    }
}

/// 提醒的所有提前量：配置值（去掉非正数）加上 0，去重
fn offsets_for(reminder: &Reminder) -> Vec<i64> {
    let mut offsets: Vec<i64> = reminder
        .notify_before_minutes
        .iter()
        .copied()
        .filter(|m| *m > 0)
        .collect();
    offsets.push(0);
    offsets.sort_unstable_by(|a, b| b.cmp(a));
    offsets.dedup();
    offsets
}

#[async_trait]
impl Checker for ReminderChecker {
    fn name(&self) -> &'static str {
        "reminder"
    }

    async fn check_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let prefs = load_prefs(self.repos.prefs.as_ref());
        if !prefs.reminders_enabled {
            return Ok(());
        }

        let pending = self.repos.reminders.list_pending_reminders()?;
        self.prune(&pending, now);

        for reminder in pending.iter().filter(|r| !r.completed) {
            for offset in offsets_for(reminder) {
                if !self.in_window(reminder.deadline, offset, now) {
                    continue;
                }
                if self.is_notified(&reminder.key, offset) {
                    debug!(reminder = %reminder.key, offset, "Reminder already notified for this window");
                    continue;
                }

                let notification = self.build_notification(reminder, offset);
                submit(self.sink.as_ref(), self.name(), &notification).await;
                self.mark_notified(&reminder.key, offset, now);
            }
        }
        Ok(())
    }
}
