//! 仓储接口 - checker 与 dispatcher 只依赖这些 trait，不关心数据如何存储
//!
//! `MemoryStore` 是所有 trait 的参考实现（可从 JSON 快照加载），
//! daemon 和测试都使用它。

pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Local};

use crate::model::{Block, Goal, NotifyPrefs, Project, Reminder, Webhook};

pub use memory::{MemoryStore, StoreSnapshot};

/// 提醒事项读取
pub trait ReminderRepository: Send + Sync {
    /// 所有未完成的提醒
    fn list_pending_reminders(&self) -> Result<Vec<Reminder>>;
}

/// 追踪记录读取
pub trait BlockRepository: Send + Sync {
    /// 与 `[from, to)` 重叠的记录（含进行中的），按开始时间升序
    fn list_blocks_between(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Block>>;

    /// 某项目与 `[from, to)` 重叠的记录
    fn list_project_blocks(
        &self,
        project_key: &str,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<Block>>;

    /// 所有进行中的记录
    fn list_active_blocks(&self) -> Result<Vec<Block>>;
}

pub trait GoalRepository: Send + Sync {
    fn list_goals(&self) -> Result<Vec<Goal>>;
}

pub trait ProjectRepository: Send + Sync {
    fn get_project(&self, key: &str) -> Result<Option<Project>>;
}

/// Webhook 读取与状态回写
pub trait WebhookRepository: Send + Sync {
    fn list_enabled_webhooks(&self) -> Result<Vec<Webhook>>;

    fn get_webhook(&self, name: &str) -> Result<Option<Webhook>>;

    /// 投递完成后记录最近使用时间与错误（成功时 `error` 为 None，清除旧错误）
    fn update_webhook_status(&self, name: &str, used_at: DateTime<Local>, error: Option<&str>) -> Result<()>;
}

pub trait PrefsRepository: Send + Sync {
    /// 尚未保存过偏好时返回 `Ok(None)`
    fn get_prefs(&self) -> Result<Option<NotifyPrefs>>;
}

/// 读取偏好设置，缺失或读取失败都回退到默认值
pub fn load_prefs(repo: &dyn PrefsRepository) -> NotifyPrefs {
    match repo.get_prefs() {
        Ok(Some(prefs)) => prefs,
        Ok(None) => NotifyPrefs::default(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load notification prefs, using defaults");
            NotifyPrefs::default()
        }
    }
}

/// 项目显示名称，查不到时使用 key
pub fn project_display_name(repo: &dyn ProjectRepository, key: &str) -> String {
    match repo.get_project(key) {
        Ok(Some(project)) if !project.name.is_empty() => project.name,
        _ => key.to_string(),
    }
}
