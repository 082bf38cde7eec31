//! 时间追踪实体 - checker 从仓储层读取的数据结构
//!
//! 这些类型由持久化层拥有，通知核心只读（Webhook 的状态字段除外）。

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};

/// 项目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// 唯一标识（如 "acme-api"）
    pub key: String,
    /// 显示名称
    pub name: String,
}

/// 一段追踪记录，`ended_at` 为空表示计时仍在进行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub project_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub started_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Local>>,
}

impl Block {
    /// 是否仍在计时
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// 结束时间；进行中的记录以 `now` 作为结束
    pub fn end_or(&self, now: DateTime<Local>) -> DateTime<Local> {
        self.ended_at.unwrap_or(now)
    }

    /// 记录时长（进行中的记录计算到 `now`），不会为负
    pub fn duration_at(&self, now: DateTime<Local>) -> Duration {
        let d = self.end_or(now) - self.started_at;
        d.max(Duration::zero())
    }

    /// 与 `[from, to)` 区间重叠的时长
    pub fn overlap(&self, from: DateTime<Local>, to: DateTime<Local>, now: DateTime<Local>) -> Duration {
        let start = self.started_at.max(from);
        let end = self.end_or(now).min(to);
        (end - start).max(Duration::zero())
    }
}

/// 提醒事项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    /// 去重键（持久化层的唯一键）
    pub key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    pub deadline: DateTime<Local>,
    /// 截止前多少分钟提醒（如 [60, 15]）
    #[serde(default)]
    pub notify_before_minutes: Vec<i64>,
    #[serde(default)]
    pub completed: bool,
}

/// 目标统计周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalPeriod {
    Daily,
    Weekly,
}

impl GoalPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalPeriod::Daily => "daily",
            GoalPeriod::Weekly => "weekly",
        }
    }
}

impl std::fmt::Display for GoalPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 项目在某个周期内的目标追踪时长
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub project_key: String,
    pub period: GoalPeriod,
    pub target_minutes: i64,
}

impl Goal {
    pub fn target(&self) -> Duration {
        Duration::minutes(self.target_minutes)
    }

    /// 目标的去重键：同一项目可以同时有日目标和周目标
    pub fn key(&self) -> String {
        format!("{}/{}", self.project_key, self.period)
    }
}

/// Webhook 渠道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Discord,
    Slack,
    Teams,
    /// 未识别的类型也归为 generic
    #[serde(other)]
    Generic,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Discord => "discord",
            WebhookKind::Slack => "slack",
            WebhookKind::Teams => "teams",
            WebhookKind::Generic => "generic",
        }
    }

    /// 宽松解析：未知字符串返回 Generic，从不报错
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "discord" => WebhookKind::Discord,
            "slack" => WebhookKind::Slack,
            "teams" | "msteams" => WebhookKind::Teams,
            _ => WebhookKind::Generic,
        }
    }
}

impl std::fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外发通知渠道（Webhook）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    /// 唯一名称，作为寻址键
    pub name: String,
    pub kind: WebhookKind,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 仅 generic 类型使用的 payload 模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Webhook {
    pub fn new(name: impl Into<String>, kind: WebhookKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url: url.into(),
            enabled: true,
            template: None,
            last_used_at: None,
            last_error: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// 通知偏好设置；未持久化时使用默认值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyPrefs {
    pub reminders_enabled: bool,
    pub idle_enabled: bool,
    /// 单段计时持续多久视为“忘记停表”
    pub idle_threshold_minutes: i64,
    pub break_enabled: bool,
    /// 连续工作多久提醒休息
    pub break_threshold_minutes: i64,
    /// 两段记录间隔超过多久视为已经休息过
    pub break_reset_minutes: i64,
    pub goals_enabled: bool,
    pub goal_milestones: Vec<u32>,
    pub daily_summary_enabled: bool,
    /// "HH:MM"（24 小时制，小时可不补零）
    pub daily_summary_time: String,
    pub end_of_day_enabled: bool,
    pub end_of_day_time: String,
}

impl Default for NotifyPrefs {
    fn default() -> Self {
        Self {
            reminders_enabled: true,
            idle_enabled: true,
            idle_threshold_minutes: 120,
            break_enabled: true,
            break_threshold_minutes: 90,
            break_reset_minutes: 15,
            goals_enabled: true,
            goal_milestones: vec![50, 75, 100],
            daily_summary_enabled: true,
            daily_summary_time: "09:00".to_string(),
            end_of_day_enabled: true,
            end_of_day_time: "18:00".to_string(),
        }
    }
}
