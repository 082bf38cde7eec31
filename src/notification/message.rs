//! 通知消息 - 一次投递的不可变值对象

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Reminder,
    Idle,
    Break,
    Goal,
    DailySummary,
    EndOfDay,
    Test,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Reminder => "reminder",
            NotificationType::Idle => "idle",
            NotificationType::Break => "break",
            NotificationType::Goal => "goal",
            NotificationType::DailySummary => "daily_summary",
            NotificationType::EndOfDay => "end_of_day",
            NotificationType::Test => "test",
        }
    }

    /// 各类型的默认颜色（0xRRGGBB）
    pub fn default_color(&self) -> u32 {
        match self {
            NotificationType::Reminder => 0x3498DB,
            NotificationType::Idle => 0xF39C12,
            NotificationType::Break => 0x9B59B6,
            NotificationType::Goal => 0x2ECC71,
            NotificationType::DailySummary => 0x1ABC9C,
            NotificationType::EndOfDay => 0x34495E,
            NotificationType::Test => 0x95A5A6,
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通知消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationType,
    pub title: String,
    /// 正文，可多行
    pub message: String,
    /// 键值字段，渠道渲染为 name/value 列表
    pub fields: Vec<(String, String)>,
    /// 0xRRGGBB
    pub color: u32,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// 创建通知，颜色取该类型默认值
    pub fn new(kind: NotificationType, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            fields: Vec::new(),
            color: kind.default_color(),
            timestamp: Utc::now(),
        }
    }

    /// 追加字段
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// 覆盖颜色
    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color & 0xFF_FFFF;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// "测试此 webhook" 使用的消息
    pub fn test(channel_name: &str) -> Self {
        Self::new(
            NotificationType::Test,
            "Test Notification",
            "This is a test notification from worklog-notify. If you can read this, the webhook is configured correctly.",
        )
        .with_field("Webhook", channel_name)
    }

    /// 字段值（第一个同名字段）
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 颜色的 "RRGGBB" 十六进制形式
    pub fn color_hex(&self) -> String {
        format!("{:06X}", self.color)
    }
}
