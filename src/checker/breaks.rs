//! 休息提醒 - 连续工作太久时提醒休息
//!
//! 连续工作时长：从最新的记录往前走，相邻两段之间的间隔不超过 reset 阈值就累加，
//! 超过阈值即认为中间已经休息过，停止累加。进行中的记录计算到 now。
//! 每个连续工作段（以开始时间标识）最多提醒一次。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{format_duration, submit, Checker, Repositories};
use crate::model::Block;
use crate::notification::{Notification, NotificationSink, NotificationType};
use crate::store::{load_prefs, project_display_name};

/// 往前查找记录的范围
const LOOKBACK_HOURS: i64 = 24;

/// 一个连续工作段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub start: DateTime<Local>,
    pub duration: Duration,
}

/// 计算截至 `now` 的连续工作段
///
/// 最新一段记录结束距今已超过 `reset` 时返回 None（已经在休息）。
/// 记录之间有重叠时只累计不重叠的部分。
pub fn continuous_session(blocks: &[Block], now: DateTime<Local>, reset: Duration) -> Option<Session> {
    let mut ordered: Vec<&Block> = blocks.iter().filter(|b| b.started_at <= now).collect();
    ordered.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let (newest, older) = ordered.split_first()?;
    if now - newest.end_or(now) > reset {
        return None;
    }

    let mut start = newest.started_at;
    let mut duration = newest.duration_at(now);
    for block in older {
        let gap = start - block.end_or(now);
        if gap > reset {
            break;
        }
        duration = duration + block.overlap(block.started_at, start, now);
        start = start.min(block.started_at);
    }

    Some(Session { start, duration })
}

pub struct BreakChecker {
    repos: Repositories,
    sink: Arc<dyn NotificationSink>,
    /// 工作段开始时间 -> 通知时间
    notified: HashMap<DateTime<Local>, DateTime<Local>>,
}

impl BreakChecker {
    pub fn new(repos: Repositories, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            repos,
            sink,
            notified: HashMap::new(),
        }
    }

    pub fn tracked_entries(&self) -> usize {
        self.notified.len()
    }

    fn build_notification(&self, session: &Session, latest: Option<&Block>) -> Notification {
        let mut notification = Notification::new(
            NotificationType::Break,
            "Time for a break",
            format!(
                "You've been working for {} without a break. Stand up and stretch for a few minutes.",
                format_duration(session.duration)
            ),
        )
        .with_field("Session started", session.start.format("%H:%M").to_string());
        if let Some(block) = latest {
            notification = notification.with_field(
                "Project",
                project_display_name(self.repos.projects.as_ref(), &block.project_key),
            );
        }
        notification
    }
}

#[async_trait]
impl Checker for BreakChecker {
    fn name(&self) -> &'static str {
        "break"
    }

    async fn check_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let prefs = load_prefs(self.repos.prefs.as_ref());
        if !prefs.break_enabled {
            return Ok(());
        }

        let blocks = self
            .repos
            .blocks
            .list_blocks_between(now - Duration::hours(LOOKBACK_HOURS), now)?;
        let reset = Duration::minutes(prefs.break_reset_minutes.max(0));
        let Some(session) = continuous_session(&blocks, now, reset) else {
            self.notified.clear();
            return Ok(());
        };
        self.notified.retain(|start, _| *start == session.start);

        let threshold = Duration::minutes(prefs.break_threshold_minutes);
        if threshold <= Duration::zero() || session.duration < threshold {
            return Ok(());
        }
        if self.notified.contains_key(&session.start) {
            debug!(session_start = %session.start, "Break already suggested for this session");
            return Ok(());
        }

        let latest = blocks.iter().max_by_key(|b| b.started_at);
        let notification = self.build_notification(&session, latest);
        submit(self.sink.as_ref(), self.name(), &notification).await;
        self.notified.insert(session.start, now);
        Ok(())
    }
}
