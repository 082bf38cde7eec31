//! 目标里程碑 - 日/周目标的进度达到配置的百分比时通知
//!
//! 去重键：`goal key -> {milestone -> notified_at}`。周期（天/周）翻转后，
//! 早于当前周期开始时间的条目被清理，同一周期内已经达成的里程碑不会重复通知。
//! 一次检测跨过多个里程碑时只通知最高的那个，较低的一并标记为已通知。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{format_duration, start_of_day, start_of_week, submit, Checker, Repositories};
use crate::model::{Goal, GoalPeriod};
use crate::notification::{Notification, NotificationSink, NotificationType};
use crate::store::{load_prefs, project_display_name};

/// 目标当前周期的开始时间
pub fn period_start(period: GoalPeriod, now: DateTime<Local>) -> DateTime<Local> {
    match period {
        GoalPeriod::Daily => start_of_day(now),
        GoalPeriod::Weekly => start_of_week(now),
    }
}

/// 进度百分比（不封顶）；目标为 0 时返回 0
pub fn progress_percent(tracked: Duration, target: Duration) -> f64 {
    if target <= Duration::zero() {
        return 0.0;
    }
    tracked.num_seconds() as f64 * 100.0 / target.num_seconds() as f64
}

struct MilestoneState {
    period: GoalPeriod,
    notified: HashMap<u32, DateTime<Local>>,
}

pub struct GoalChecker {
    repos: Repositories,
    sink: Arc<dyn NotificationSink>,
    milestones: HashMap<String, MilestoneState>,
}

impl GoalChecker {
    pub fn new(repos: Repositories, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            repos,
            sink,
            milestones: HashMap::new(),
        }
    }

    /// 目标在当前周期内已追踪的时长
    pub fn tracked_time(&self, goal: &Goal, now: DateTime<Local>) -> Result<Duration> {
        let start = period_start(goal.period, now);
        let blocks = self.repos.blocks.list_project_blocks(&goal.project_key, start, now)?;
        Ok(blocks
            .iter()
            .fold(Duration::zero(), |acc, b| acc + b.overlap(start, now, now)))
    }

    /// 清理早于各自周期开始时间的里程碑记录
    pub fn cleanup_old_milestones(&mut self, now: DateTime<Local>) {
        self.milestones.retain(|_, state| {
            let cutoff = period_start(state.period, now);
            state.notified.retain(|_, notified_at| *notified_at >= cutoff);
            !state.notified.is_empty()
        });
    }

    pub fn is_notified(&self, goal: &Goal, milestone: u32) -> bool {
        self.milestones
            .get(&goal.key())
            .is_some_and(|s| s.notified.contains_key(&milestone))
    }

    fn build_notification(&self, goal: &Goal, milestone: u32, tracked: Duration, percent: f64) -> Notification {
        let project = project_display_name(self.repos.projects.as_ref(), &goal.project_key);
        let title = if milestone >= 100 {
            format!("Goal reached: {}", project)
        } else {
            format!("Goal {}%: {}", milestone, project)
        };
        Notification::new(
            NotificationType::Goal,
            title,
            format!(
                "{} of your {} goal for {} ({:.0}%).",
                format_duration(tracked),
                format_duration(goal.target()),
                project,
                percent
            ),
        )
        .with_field("Project", project)
        .with_field("Period", goal.period.as_str())
        .with_field("Progress", format!("{:.0}%", percent))
    }

    async fn check_goal(&mut self, goal: &Goal, milestones: &[u32], now: DateTime<Local>) -> Result<()> {
        if goal.target_minutes <= 0 {
            debug!(goal = %goal.key(), "Goal target not positive, skipping");
            return Ok(());
        }

        let tracked = self.tracked_time(goal, now)?;
        let percent = progress_percent(tracked, goal.target());

        let newly_crossed: Vec<u32> = milestones
            .iter()
            .copied()
            .filter(|m| percent >= *m as f64 && !self.is_notified(goal, *m))
            .collect();
        let Some(highest) = newly_crossed.iter().copied().max() else {
            return Ok(());
        };

        let notification = self.build_notification(goal, highest, tracked, percent);
        submit(self.sink.as_ref(), self.name(), &notification).await;

        let state = self
            .milestones
            .entry(goal.key())
            .or_insert_with(|| MilestoneState {
                period: goal.period,
                notified: HashMap::new(),
            });
        for milestone in newly_crossed {
            state.notified.insert(milestone, now);
        }
        Ok(())
    }
}

#[async_trait]
impl Checker for GoalChecker {
    fn name(&self) -> &'static str {
        "goal"
    }

    async fn check_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let prefs = load_prefs(self.repos.prefs.as_ref());
        if !prefs.goals_enabled {
            return Ok(());
        }

        self.cleanup_old_milestones(now);

        let mut milestones = prefs.goal_milestones.clone();
        milestones.retain(|m| *m > 0);
        milestones.sort_unstable();
        milestones.dedup();
        if milestones.is_empty() {
            return Ok(());
        }

        let goals = self.repos.goals.list_goals()?;
        for goal in &goals {
            // 单个目标失败不影响其他目标
            if let Err(e) = self.check_goal(goal, &milestones, now).await {
                warn!(goal = %goal.key(), error = %e, "Failed to check goal");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::testing::{at, RecordingSink};
    use crate::model::Block;
    use crate::store::MemoryStore;

    fn setup(goal: Goal) -> (Arc<MemoryStore>, Arc<RecordingSink>, GoalChecker) {
        let store = Arc::new(MemoryStore::new());
        store.add_goal(goal).unwrap();
        let sink = RecordingSink::new();
        let checker = GoalChecker::new(Repositories::from_store(store.clone()), sink.clone());
        (store, sink, checker)
    }

    fn daily(target_minutes: i64) -> Goal {
        Goal {
            project_key: "acme".into(),
            period: GoalPeriod::Daily,
            target_minutes,
        }
    }

    fn block(id: i64, start: DateTime<Local>, end: DateTime<Local>) -> Block {
        Block {
            id,
            project_key: "acme".into(),
            task: None,
            started_at: start,
            ended_at: Some(end),
        }
    }

    #[test]
    fn test_progress_percent_uncapped() {
        assert_eq!(progress_percent(Duration::hours(2), Duration::hours(4)), 50.0);
        assert_eq!(progress_percent(Duration::hours(6), Duration::hours(4)), 150.0);
        assert_eq!(progress_percent(Duration::hours(1), Duration::zero()), 0.0);
    }

    #[tokio::test]
    async fn test_half_way_fires_once() {
        let (store, sink, mut checker) = setup(daily(240));
        store.add_block(block(1, at(10, 9, 0), at(10, 11, 0))).unwrap();

        let now = at(10, 12, 0);
        assert_eq!(checker.tracked_time(&daily(240), now).unwrap(), Duration::hours(2));

        checker.check_at(now).await.unwrap();
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.sent()[0].title, "Goal 50%: acme");
        assert_eq!(sink.sent()[0].field("Progress"), Some("50%"));

        checker.check_at(at(10, 12, 5)).await.unwrap();
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_only_highest_new_milestone_is_sent() {
        let (store, sink, mut checker) = setup(daily(240));
        store.add_block(block(1, at(10, 8, 0), at(10, 11, 30))).unwrap();

        checker.check_at(at(10, 12, 0)).await.unwrap();
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.sent()[0].title, "Goal 75%: acme");
        assert!(checker.is_notified(&daily(240), 50));
        assert!(checker.is_notified(&daily(240), 75));
        assert!(!checker.is_notified(&daily(240), 100));

        store.add_block(block(2, at(10, 12, 0), at(10, 12, 30))).unwrap();
        checker.check_at(at(10, 13, 0)).await.unwrap();
        assert_eq!(sink.count(), 2);
        assert_eq!(sink.sent()[1].title, "Goal reached: acme");
    }

    #[tokio::test]
    async fn test_day_rollover_allows_new_notifications() {
        let (store, sink, mut checker) = setup(daily(120));
        store.add_block(block(1, at(10, 9, 0), at(10, 10, 0))).unwrap();
        checker.check_at(at(10, 23, 0)).await.unwrap();
        assert_eq!(sink.count(), 1);

        store.add_block(block(2, at(11, 9, 0), at(11, 10, 0))).unwrap();
        checker.check_at(at(11, 10, 30)).await.unwrap();
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_weekly_milestone_survives_day_rollover() {
        let weekly = Goal {
            project_key: "acme".into(),
            period: GoalPeriod::Weekly,
            target_minutes: 600,
        };
        let (store, sink, mut checker) = setup(weekly.clone());
        // 周一
        store.add_block(block(1, at(9, 9, 0), at(9, 14, 0))).unwrap();
        checker.check_at(at(9, 15, 0)).await.unwrap();
        assert_eq!(sink.count(), 1);

        // 周三，进度不变，同一周内不再通知
        checker.check_at(at(11, 9, 0)).await.unwrap();
        assert_eq!(sink.count(), 1);
        assert!(checker.is_notified(&weekly, 50));
    }

    #[tokio::test]
    async fn test_milestones_above_hundred() {
        let (store, sink, mut checker) = setup(daily(60));
        store
            .set_prefs(crate::model::NotifyPrefs {
                goal_milestones: vec![100, 150],
                ..Default::default()
            })
            .unwrap();
        store.add_block(block(1, at(10, 9, 0), at(10, 10, 0))).unwrap();
        checker.check_at(at(10, 10, 0)).await.unwrap();

        store.add_block(block(2, at(10, 10, 0), at(10, 10, 30))).unwrap();
        checker.check_at(at(10, 10, 30)).await.unwrap();
        assert_eq!(sink.count(), 2);
        assert_eq!(sink.sent()[1].field("Progress"), Some("150%"));
    }

    #[tokio::test]
    async fn test_no_goals() {
        let store = Arc::new(MemoryStore::new());
        let sink = RecordingSink::new();
        let mut checker = GoalChecker::new(Repositories::from_store(store), sink.clone());
        checker.check_at(at(10, 12, 0)).await.unwrap();
        assert_eq!(sink.count(), 0);
    }
}
