//! 内存仓储 - 所有仓储 trait 的参考实现，可从 JSON 快照文件加载

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::{
    BlockRepository, GoalRepository, PrefsRepository, ProjectRepository, ReminderRepository,
    WebhookRepository,
};
use crate::model::{Block, Goal, NotifyPrefs, Project, Reminder, Webhook};

/// 快照文件格式（JSON）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub projects: Vec<Project>,
    pub blocks: Vec<Block>,
    pub reminders: Vec<Reminder>,
    pub goals: Vec<Goal>,
    pub webhooks: Vec<Webhook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefs: Option<NotifyPrefs>,
}

/// 内存仓储
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot),
        }
    }

    /// 从 JSON 快照文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read store snapshot {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Invalid store snapshot {}", path.display()))?;
        debug!(
            path = %path.display(),
            blocks = snapshot.blocks.len(),
            reminders = snapshot.reminders.len(),
            webhooks = snapshot.webhooks.len(),
            "Loaded store snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// 当前数据的拷贝
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(self.read()?.clone())
    }

    pub fn add_project(&self, project: Project) -> Result<()> {
        self.write()?.projects.push(project);
        Ok(())
    }

    pub fn add_block(&self, block: Block) -> Result<()> {
        self.write()?.blocks.push(block);
        Ok(())
    }

    pub fn add_reminder(&self, reminder: Reminder) -> Result<()> {
        self.write()?.reminders.push(reminder);
        Ok(())
    }

    pub fn add_goal(&self, goal: Goal) -> Result<()> {
        self.write()?.goals.push(goal);
        Ok(())
    }

    pub fn add_webhook(&self, webhook: Webhook) -> Result<()> {
        self.write()?.webhooks.push(webhook);
        Ok(())
    }

    pub fn set_prefs(&self, prefs: NotifyPrefs) -> Result<()> {
        self.write()?.prefs = Some(prefs);
        Ok(())
    }

    /// 标记提醒已完成
    pub fn complete_reminder(&self, key: &str) -> Result<bool> {
        let mut data = self.write()?;
        match data.reminders.iter_mut().find(|r| r.key == key) {
            Some(r) => {
                r.completed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 结束一段进行中的记录
    pub fn stop_block(&self, id: i64, ended_at: DateTime<Local>) -> Result<bool> {
        let mut data = self.write()?;
        match data.blocks.iter_mut().find(|b| b.id == id && b.is_active()) {
            Some(b) => {
                b.ended_at = Some(ended_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreSnapshot>> {
        self.data.read().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreSnapshot>> {
        self.data.write().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

fn overlaps(block: &Block, from: DateTime<Local>, to: DateTime<Local>) -> bool {
    let starts_before_end = block.started_at < to;
    let ends_after_start = block.ended_at.map_or(true, |end| end > from);
    starts_before_end && ends_after_start
}

impl ReminderRepository for MemoryStore {
    fn list_pending_reminders(&self) -> Result<Vec<Reminder>> {
        Ok(self
            .read()?
            .reminders
            .iter()
            .filter(|r| !r.completed)
            .cloned()
            .collect())
    }
}

impl BlockRepository for MemoryStore {
    fn list_blocks_between(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Block>> {
        let mut blocks: Vec<Block> = self
            .read()?
            .blocks
            .iter()
            .filter(|b| overlaps(b, from, to))
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.started_at);
        Ok(blocks)
    }

    fn list_project_blocks(
        &self,
        project_key: &str,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<Block>> {
        let mut blocks: Vec<Block> = self
            .read()?
            .blocks
            .iter()
            .filter(|b| b.project_key == project_key && overlaps(b, from, to))
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.started_at);
        Ok(blocks)
    }

    fn list_active_blocks(&self) -> Result<Vec<Block>> {
        Ok(self
            .read()?
            .blocks
            .iter()
            .filter(|b| b.is_active())
            .cloned()
            .collect())
    }
}

impl GoalRepository for MemoryStore {
    fn list_goals(&self) -> Result<Vec<Goal>> {
        Ok(self.read()?.goals.clone())
    }
}

impl ProjectRepository for MemoryStore {
    fn get_project(&self, key: &str) -> Result<Option<Project>> {
        Ok(self.read()?.projects.iter().find(|p| p.key == key).cloned())
    }
}

impl WebhookRepository for MemoryStore {
    fn list_enabled_webhooks(&self) -> Result<Vec<Webhook>> {
        Ok(self
            .read()?
            .webhooks
            .iter()
            .filter(|w| w.enabled)
            .cloned()
            .collect())
    }

    fn get_webhook(&self, name: &str) -> Result<Option<Webhook>> {
        Ok(self.read()?.webhooks.iter().find(|w| w.name == name).cloned())
    }

    fn update_webhook_status(&self, name: &str, used_at: DateTime<Local>, error: Option<&str>) -> Result<()> {
        let mut data = self.write()?;
        let webhook = data
            .webhooks
            .iter_mut()
            .find(|w| w.name == name)
            .ok_or_else(|| anyhow!("webhook not found: {}", name))?;
        webhook.last_used_at = Some(used_at);
        webhook.last_error = error.map(|e| e.to_string());
        Ok(())
    }
}

impl PrefsRepository for MemoryStore {
    fn get_prefs(&self) -> Result<Option<NotifyPrefs>> {
        Ok(self.read()?.prefs.clone())
    }
}
