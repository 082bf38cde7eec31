//! 每日汇总 - 早上的昨日汇总和傍晚的当日回顾
//!
//! 到达配置时间（"HH:MM"，小时可不补零）后的 5 分钟窗口内发送，
//! 每种汇总每个自然日最多发送一次（按日期去重）。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::goal::progress_percent;
use super::{format_duration, start_of_day, submit, Checker, Repositories};
use crate::model::{Block, GoalPeriod, Reminder};
use crate::notification::{Notification, NotificationSink, NotificationType};
use crate::store::{load_prefs, project_display_name};

/// 到达配置时间后允许发送的窗口
const SEND_WINDOW_MINUTES: i64 = 5;

/// 解析 "9:00" / "09:00" / "18:30"
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("valid regex"));
    let caps = re.captures(s.trim())?;
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// 目标进度的三档状态
pub fn status_glyph(percent: f64) -> &'static str {
    if percent >= 100.0 {
        "🟢"
    } else if percent >= 75.0 {
        "🟡"
    } else {
        "🔴"
    }
}

/// 按项目汇总 `[from, to)` 内的时长，按时长降序
pub fn aggregate_by_project(
    blocks: &[Block],
    from: DateTime<Local>,
    to: DateTime<Local>,
    now: DateTime<Local>,
) -> Vec<(String, Duration)> {
    let mut totals: HashMap<&str, Duration> = HashMap::new();
    for block in blocks {
        let d = block.overlap(from, to, now);
        if d > Duration::zero() {
            let entry = totals.entry(block.project_key.as_str()).or_insert_with(Duration::zero);
            *entry = *entry + d;
        }
    }
    let mut totals: Vec<(String, Duration)> = totals
        .into_iter()
        .map(|(k, d)| (k.to_string(), d))
        .collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    totals
}

/// 当前时间是否在 `time` 之后的发送窗口内
fn in_send_window(now: DateTime<Local>, time: NaiveTime) -> bool {
    let target = now.date_naive().and_time(time);
    let now = now.naive_local();
    now >= target && now < target + Duration::minutes(SEND_WINDOW_MINUTES)
}

pub struct SummaryGenerator {
    repos: Repositories,
    sink: Arc<dyn NotificationSink>,
    last_daily: Option<NaiveDate>,
    last_end_of_day: Option<NaiveDate>,
}

impl SummaryGenerator {
    pub fn new(repos: Repositories, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            repos,
            sink,
            last_daily: None,
            last_end_of_day: None,
        }
    }

    pub fn last_daily_summary(&self) -> Option<NaiveDate> {
        self.last_daily
    }

    pub fn last_end_of_day(&self) -> Option<NaiveDate> {
        self.last_end_of_day
    }

    /// 早上的昨日汇总
    pub async fn check_daily_summary_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let prefs = load_prefs(self.repos.prefs.as_ref());
        if !prefs.daily_summary_enabled {
            return Ok(());
        }
        let Some(time) = parse_time_of_day(&prefs.daily_summary_time) else {
            warn!(time = %prefs.daily_summary_time, "Invalid daily summary time");
            return Ok(());
        };
        let today = now.date_naive();
        if !in_send_window(now, time) || self.last_daily == Some(today) {
            return Ok(());
        }

        let notification = self.build_daily_summary(now)?;
        submit(self.sink.as_ref(), "daily_summary", &notification).await;
        self.last_daily = Some(today);
        Ok(())
    }

    /// 傍晚的当日回顾
    pub async fn check_end_of_day_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let prefs = load_prefs(self.repos.prefs.as_ref());
        if !prefs.end_of_day_enabled {
            return Ok(());
        }
        let Some(time) = parse_time_of_day(&prefs.end_of_day_time) else {
            warn!(time = %prefs.end_of_day_time, "Invalid end-of-day time");
            return Ok(());
        };
        let today = now.date_naive();
        if !in_send_window(now, time) || self.last_end_of_day == Some(today) {
            return Ok(());
        }

        let notification = self.build_end_of_day(now)?;
        submit(self.sink.as_ref(), "end_of_day", &notification).await;
        self.last_end_of_day = Some(today);
        Ok(())
    }

    pub fn build_daily_summary(&self, now: DateTime<Local>) -> Result<Notification> {
        let today_start = start_of_day(now);
        let yesterday_start = start_of_day(today_start - Duration::hours(12));
        let blocks = self.repos.blocks.list_blocks_between(yesterday_start, today_start)?;
        let totals = aggregate_by_project(&blocks, yesterday_start, today_start, now);
        let reminders = self.reminders_between(today_start, today_start + Duration::days(1))?;

        let mut lines = Vec::new();
        if totals.is_empty() {
            lines.push("No time tracked yesterday.".to_string());
        } else {
            let total = totals.iter().fold(Duration::zero(), |acc, (_, d)| acc + *d);
            lines.push(format!("Yesterday you tracked {}.", format_duration(total)));
        }
        if !reminders.is_empty() {
            lines.push(String::new());
            lines.push("Due today:".to_string());
            lines.extend(reminders.iter().map(reminder_line));
        }

        Ok(self.with_project_fields(
            Notification::new(NotificationType::DailySummary, "Daily Summary", lines.join("\n")),
            &totals,
        ))
    }

    pub fn build_end_of_day(&self, now: DateTime<Local>) -> Result<Notification> {
        let today_start = start_of_day(now);
        let blocks = self.repos.blocks.list_blocks_between(today_start, now)?;
        let totals = aggregate_by_project(&blocks, today_start, now, now);
        let tomorrow_start = start_of_day(today_start + Duration::hours(36));
        let reminders = self.reminders_between(tomorrow_start, tomorrow_start + Duration::days(1))?;

        let mut lines = Vec::new();
        if totals.is_empty() {
            lines.push("No time tracked today.".to_string());
        } else {
            let total = totals.iter().fold(Duration::zero(), |acc, (_, d)| acc + *d);
            lines.push(format!("Today you tracked {}.", format_duration(total)));
        }

        let goal_lines = self.daily_goal_lines(&blocks, today_start, now)?;
        if !goal_lines.is_empty() {
            lines.push(String::new());
            lines.push("Goals:".to_string());
            lines.extend(goal_lines);
        }
        if !reminders.is_empty() {
            lines.push(String::new());
            lines.push("Due tomorrow:".to_string());
            lines.extend(reminders.iter().map(reminder_line));
        }

        Ok(self.with_project_fields(
            Notification::new(NotificationType::EndOfDay, "End of Day Recap", lines.join("\n")),
            &totals,
        ))
    }

    fn daily_goal_lines(&self, blocks: &[Block], from: DateTime<Local>, now: DateTime<Local>) -> Result<Vec<String>> {
        let goals = self.repos.goals.list_goals()?;
        let lines = goals
            .iter()
            .filter(|g| g.period == GoalPeriod::Daily && g.target_minutes > 0)
            .map(|goal| {
                let tracked = blocks
                    .iter()
                    .filter(|b| b.project_key == goal.project_key)
                    .fold(Duration::zero(), |acc, b| acc + b.overlap(from, now, now));
                let percent = progress_percent(tracked, goal.target());
                format!(
                    "{} {}: {} / {} ({:.0}%)",
                    status_glyph(percent),
                    project_display_name(self.repos.projects.as_ref(), &goal.project_key),
                    format_duration(tracked),
                    format_duration(goal.target()),
                    percent
                )
            })
            .collect();
        Ok(lines)
    }

    fn reminders_between(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Reminder>> {
        let mut reminders: Vec<Reminder> = self
            .repos
            .reminders
            .list_pending_reminders()?
            .into_iter()
            .filter(|r| r.deadline >= from && r.deadline < to)
            .collect();
        reminders.sort_by_key(|r| r.deadline);
        Ok(reminders)
    }

    fn with_project_fields(&self, mut notification: Notification, totals: &[(String, Duration)]) -> Notification {
        for (key, duration) in totals {
            notification = notification.with_field(
                project_display_name(self.repos.projects.as_ref(), key),
                format_duration(*duration),
            );
        }
        notification
    }
}

fn reminder_line(reminder: &Reminder) -> String {
    format!("• {} {}", reminder.deadline.format("%H:%M"), reminder.title)
}

#[async_trait]
impl Checker for SummaryGenerator {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn check_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let daily = self.check_daily_summary_at(now).await;
        let end_of_day = self.check_end_of_day_at(now).await;
        if let Err(e) = &daily {
            debug!(error = %e, "Daily summary check failed");
        }
        daily.and(end_of_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::testing::{at, RecordingSink};
    use crate::model::{Goal, NotifyPrefs, Project};
    use crate::store::MemoryStore;

    fn block(id: i64, project: &str, start: DateTime<Local>, end: DateTime<Local>) -> Block {
        Block {
            id,
            project_key: project.into(),
            task: None,
            started_at: start,
            ended_at: Some(end),
        }
    }

    fn reminder(id: i64, title: &str, deadline: DateTime<Local>) -> Reminder {
        Reminder {
            id,
            key: format!("r{}", id),
            title: title.into(),
            description: None,
            project_key: None,
            deadline,
            notify_before_minutes: vec![],
            completed: false,
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingSink>, SummaryGenerator) {
        let store = Arc::new(MemoryStore::new());
        let sink = RecordingSink::new();
        let generator = SummaryGenerator::new(Repositories::from_store(store.clone()), sink.clone());
        (store, sink, generator)
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("09:00"), NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(parse_time_of_day("9:05"), NaiveTime::from_hms_opt(9, 5, 0));
        assert_eq!(parse_time_of_day("18:30"), NaiveTime::from_hms_opt(18, 30, 0));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("9:5"), None);
        assert_eq!(parse_time_of_day("nine"), None);
    }

    #[test]
    fn test_status_glyph_tiers() {
        assert_eq!(status_glyph(40.0), "🔴");
        assert_eq!(status_glyph(74.9), "🔴");
        assert_eq!(status_glyph(75.0), "🟡");
        assert_eq!(status_glyph(99.0), "🟡");
        assert_eq!(status_glyph(100.0), "🟢");
        assert_eq!(status_glyph(130.0), "🟢");
    }

    #[test]
    fn test_aggregate_sorts_by_total_descending() {
        let blocks = vec![
            block(1, "small", at(9, 9, 0), at(9, 9, 30)),
            block(2, "big", at(9, 10, 0), at(9, 12, 0)),
            block(3, "small", at(9, 13, 0), at(9, 13, 15)),
            block(4, "big", at(9, 23, 0), at(10, 1, 0)),
        ];
        let totals = aggregate_by_project(&blocks, at(9, 0, 0), at(10, 0, 0), at(10, 9, 0));
        assert_eq!(
            totals,
            vec![
                ("big".to_string(), Duration::minutes(180)),
                ("small".to_string(), Duration::minutes(45)),
            ]
        );
    }

    #[tokio::test]
    async fn test_daily_summary_once_per_day() {
        let (store, sink, mut generator) = setup();
        store.add_block(block(1, "acme", at(9, 9, 0), at(9, 12, 0))).unwrap();
        store.add_block(block(2, "docs", at(9, 13, 0), at(9, 14, 0))).unwrap();
        store.add_reminder(reminder(1, "Ship release", at(10, 16, 0))).unwrap();
        store.add_reminder(reminder(2, "Standup", at(10, 9, 30))).unwrap();
        store.add_reminder(reminder(3, "Next week", at(17, 9, 30))).unwrap();

        generator.check_at(at(10, 8, 59)).await.unwrap();
        assert_eq!(sink.count(), 0);

        generator.check_at(at(10, 9, 0)).await.unwrap();
        generator.check_at(at(10, 9, 1)).await.unwrap();
        assert_eq!(sink.count(), 1);
        assert_eq!(generator.last_daily_summary(), Some(at(10, 0, 0).date_naive()));

        let summary = &sink.sent()[0];
        assert_eq!(summary.kind, NotificationType::DailySummary);
        assert!(summary.message.starts_with("Yesterday you tracked 4h 0m."));
        assert!(summary.message.contains("• 09:30 Standup\n• 16:00 Ship release"));
        assert!(!summary.message.contains("Next week"));
        assert_eq!(summary.fields[0], ("acme".to_string(), "3h 0m".to_string()));
        assert_eq!(summary.fields[1], ("docs".to_string(), "1h 0m".to_string()));

        generator.check_at(at(11, 9, 2)).await.unwrap();
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_window_is_five_minutes() {
        let (_store, sink, mut generator) = setup();
        generator.check_at(at(10, 9, 5)).await.unwrap();
        assert_eq!(sink.count(), 0);
        generator.check_at(at(10, 9, 4)).await.unwrap();
        assert_eq!(sink.count(), 1);
        assert!(sink.sent()[0].message.contains("No time tracked yesterday."));
    }

    #[tokio::test]
    async fn test_end_of_day_recap() {
        let (store, sink, mut generator) = setup();
        store
            .add_project(Project {
                key: "acme".into(),
                name: "Acme Corp".into(),
            })
            .unwrap();
        store.add_block(block(1, "acme", at(10, 9, 0), at(10, 12, 0))).unwrap();
        store.add_block(block(2, "docs", at(10, 13, 0), at(10, 13, 30))).unwrap();
        store
            .add_goal(Goal {
                project_key: "acme".into(),
                period: GoalPeriod::Daily,
                target_minutes: 240,
            })
            .unwrap();
        store
            .add_goal(Goal {
                project_key: "docs".into(),
                period: GoalPeriod::Daily,
                target_minutes: 30,
            })
            .unwrap();
        store.add_reminder(reminder(1, "Invoice", at(11, 10, 0))).unwrap();
        store
            .set_prefs(NotifyPrefs {
                daily_summary_enabled: false,
                end_of_day_time: "17:30".into(),
                ..NotifyPrefs::default()
            })
            .unwrap();

        generator.check_at(at(10, 17, 31)).await.unwrap();
        assert_eq!(sink.count(), 1);
        let recap = &sink.sent()[0];
        assert_eq!(recap.kind, NotificationType::EndOfDay);
        assert!(recap.message.contains("Today you tracked 3h 30m."));
        assert!(recap.message.contains("🟡 Acme Corp: 3h 0m / 4h 0m (75%)"));
        assert!(recap.message.contains("🟢 docs: 30m / 30m (100%)"));
        assert!(recap.message.contains("• 10:00 Invoice"));
        assert_eq!(recap.field("Acme Corp"), Some("3h 0m"));

        generator.check_at(at(10, 17, 33)).await.unwrap();
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_time_is_skipped() {
        let (store, sink, mut generator) = setup();
        store
            .set_prefs(NotifyPrefs {
                daily_summary_time: "25:99".into(),
                end_of_day_enabled: false,
                ..NotifyPrefs::default()
            })
            .unwrap();
        generator.check_at(at(10, 9, 0)).await.unwrap();
        assert_eq!(sink.count(), 0);
    }
}
