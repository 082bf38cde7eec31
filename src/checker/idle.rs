//! 空闲检测 - 计时一直没停，可能是忘了停表
//!
//! 每段进行中的记录（一个 idle episode）最多通知一次，记录停止后去重条目随之清理。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{format_duration, submit, Checker, Repositories};
use crate::model::Block;
use crate::notification::{Notification, NotificationSink, NotificationType};
use crate::store::{load_prefs, project_display_name};

pub struct IdleChecker {
    repos: Repositories,
    sink: Arc<dyn NotificationSink>,
    /// block id -> 通知时间
    notified: HashMap<i64, DateTime<Local>>,
}

impl IdleChecker {
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

    fn build_notification(&self, block: &Block, elapsed: Duration) -> Notification {
        let project = project_display_name(self.repos.projects.as_ref(), &block.project_key);
        let mut notification = Notification::new(
            NotificationType::Idle,
            "Still tracking?",
            format!(
                "The timer for {} has been running for {}. Did you forget to stop it?",
                project,
                format_duration(elapsed)
            ),
        )
        .with_field("Project", project)
        .with_field("Started", block.started_at.format("%H:%M").to_string());
        if let Some(task) = block.task.as_deref().filter(|t| !t.is_empty()) {
            notification = notification.with_field("Task", task);
        }
        notification
    }
}

#[async_trait]
impl Checker for IdleChecker {
    fn name(&self) -> &'static str {
        "idle"
    }

    async fn check_at(&mut self, now: DateTime<Local>) -> Result<()> {
        let prefs = load_prefs(self.repos.prefs.as_ref());
        if !prefs.idle_enabled {
            return Ok(());
        }

        let active = self.repos.blocks.list_active_blocks()?;
        let live: HashSet<i64> = active.iter().map(|b| b.id).collect();
        self.notified.retain(|id, _| live.contains(id));

        let threshold = Duration::minutes(prefs.idle_threshold_minutes);
        if threshold <= Duration::zero() {
            debug!(threshold = prefs.idle_threshold_minutes, "Idle threshold not positive, skipping");
            return Ok(());
        }

        for block in &active {
            let elapsed = block.duration_at(now);
            if elapsed < threshold || self.notified.contains_key(&block.id) {
                continue;
            }
            let notification = self.build_notification(block, elapsed);
            submit(self.sink.as_ref(), self.name(), &notification).await;
            self.notified.insert(block.id, now);
        }
        Ok(())
    }
}
