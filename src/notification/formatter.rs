//! 渠道格式化 - 将通知渲染成各渠道的 webhook payload
//!
//! 渠道类型是封闭的枚举，`Formatter::select` 根据（渠道类型, 是否有模板）选出变体：
//! - Discord: embed（title/description/color/fields/footer/timestamp）
//! - Slack: blocks（header/section/fields/context）+ 带颜色的 attachment
//! - Teams: MessageCard（themeColor + facts）
//! - Generic: 扁平 JSON（type/title/message/fields/timestamp/color）
//! - Templated: 用户模板（Handlebars），模板错误直接返回，不回退到默认格式

use handlebars::{Handlebars, Template};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::sync::OnceLock;

use super::error::FormatError;
use super::message::Notification;
use crate::model::WebhookKind;

const JSON_CONTENT_TYPE: &str = "application/json";
const FOOTER_TEXT: &str = "worklog-notify";

// Discord embed 限制
const DISCORD_TITLE_MAX: usize = 256;
const DISCORD_DESCRIPTION_MAX: usize = 4096;
const DISCORD_FIELD_VALUE_MAX: usize = 1024;
const DISCORD_FIELDS_MAX: usize = 25;
// Slack 每个 section 最多 10 个 field
const SLACK_FIELDS_PER_SECTION: usize = 10;

/// 渠道格式化器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formatter {
    Discord,
    Slack,
    Teams,
    Generic,
    /// generic 渠道配置了非空模板
    Templated(String),
}

impl Formatter {
    /// 根据渠道类型和可选模板选择格式化器
    ///
    /// 只有 generic 渠道使用模板；其他类型即使配置了模板也忽略
    pub fn select(kind: WebhookKind, template: Option<&str>) -> Self {
        match kind {
            WebhookKind::Discord => Formatter::Discord,
            WebhookKind::Slack => Formatter::Slack,
            WebhookKind::Teams => Formatter::Teams,
            WebhookKind::Generic => match template.map(str::trim).filter(|t| !t.is_empty()) {
                Some(t) => Formatter::Templated(t.to_string()),
                None => Formatter::Generic,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Formatter::Discord => "discord",
            Formatter::Slack => "slack",
            Formatter::Teams => "teams",
            Formatter::Generic => "generic",
            Formatter::Templated(_) => "template",
        }
    }

    /// payload 的 Content-Type
    pub fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    /// 渲染 payload
    pub fn format(&self, notification: &Notification) -> Result<Vec<u8>, FormatError> {
        match self {
            Formatter::Discord => Ok(serde_json::to_vec(&discord_payload(notification))?),
            Formatter::Slack => Ok(serde_json::to_vec(&slack_payload(notification))?),
            Formatter::Teams => Ok(serde_json::to_vec(&teams_payload(notification))?),
            Formatter::Generic => Ok(serde_json::to_vec(&generic_payload(notification))?),
            Formatter::Templated(template) => render_template(template, notification),
        }
    }
}

fn discord_payload(n: &Notification) -> Value {
    let fields: Vec<Value> = n
        .fields
        .iter()
        .take(DISCORD_FIELDS_MAX)
        .map(|(name, value)| {
            json!({
                "name": truncate(name, DISCORD_TITLE_MAX),
                "value": truncate(value, DISCORD_FIELD_VALUE_MAX),
                "inline": true,
            })
        })
        .collect();

    json!({
        "embeds": [{
            "title": truncate(&n.title, DISCORD_TITLE_MAX),
            "description": truncate(&n.message, DISCORD_DESCRIPTION_MAX),
            "color": n.color,
            "fields": fields,
            "footer": { "text": FOOTER_TEXT },
            "timestamp": n.timestamp.to_rfc3339(),
        }]
    })
}

fn slack_payload(n: &Notification) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": n.title, "emoji": true },
        }),
        json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": n.message },
        }),
    ];

    for chunk in n.fields.chunks(SLACK_FIELDS_PER_SECTION) {
        let fields: Vec<Value> = chunk
            .iter()
            .map(|(name, value)| json!({ "type": "mrkdwn", "text": format!("*{}*\n{}", name, value) }))
            .collect();
        blocks.push(json!({ "type": "section", "fields": fields }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("{} • {}", FOOTER_TEXT, n.timestamp.format("%Y-%m-%d %H:%M UTC")),
        }],
    }));

    json!({
        "text": n.title,
        "blocks": blocks,
        "attachments": [{
            "color": format!("#{}", n.color_hex()),
            "fallback": format!("{}: {}", n.title, n.message),
        }],
    })
}

fn teams_payload(n: &Notification) -> Value {
    let facts: Vec<Value> = n
        .fields
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": n.color_hex(),
        "summary": n.title,
        "title": n.title,
        "text": n.message.replace('\n', "<br>"),
        "sections": [{ "facts": facts }],
    })
}

fn generic_payload(n: &Notification) -> Value {
    let fields: Map<String, Value> = n
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    json!({
        "type": n.kind.as_str(),
        "title": n.title,
        "message": n.message,
        "fields": fields,
        "timestamp": n.timestamp.to_rfc3339(),
        "color": n.color,
    })
}

/// 模板可用的变量
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateContext<'a> {
    #[serde(rename = "Type")]
    kind: &'a str,
    title: &'a str,
    message: &'a str,
    fields: Map<String, Value>,
    color: u32,
    timestamp: String,
}

/// 用用户模板渲染；解析与渲染错误都原样返回
fn render_template(template: &str, n: &Notification) -> Result<Vec<u8>, FormatError> {
    let template = normalize_dot_paths(template);
    let compiled = Template::compile(&template).map_err(|e| FormatError::TemplateParse(e.to_string()))?;

    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    // 模板产出的是 JSON，变量按 JSON 字符串内容转义而非 HTML 转义
    hb.register_escape_fn(json_escape);
    hb.register_template("payload", compiled);

    let context = TemplateContext {
        kind: n.kind.as_str(),
        title: &n.title,
        message: &n.message,
        fields: n
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
        color: n.color,
        timestamp: n.timestamp.to_rfc3339(),
    };

    let rendered = hb
        .render("payload", &context)
        .map_err(|e| FormatError::TemplateRender(e.to_string()))?;
    Ok(rendered.into_bytes())
}

/// 兼容 `{{.Title}}` 写法：表达式开头的 `.Name` 改写为 `Name`
fn normalize_dot_paths(template: &str) -> Cow<'_, str> {
    static DOT_PATH: OnceLock<Regex> = OnceLock::new();
    let re = DOT_PATH.get_or_init(|| Regex::new(r"\{\{(~?\s*)\.([A-Za-z_])").expect("valid regex"));
    re.replace_all(template, "{{${1}${2}")
}

/// JSON 字符串内容转义（不带两侧引号）
fn json_escape(s: &str) -> String {
    let quoted = Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// 按字符截断，超出时以 "..." 结尾
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::message::NotificationType;

    fn sample() -> Notification {
        Notification::new(NotificationType::Reminder, "T", "M").with_field("K", "V")
    }

    fn decode(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_select_by_kind_and_template() {
        assert_eq!(Formatter::select(WebhookKind::Discord, None), Formatter::Discord);
        assert_eq!(Formatter::select(WebhookKind::Slack, Some("{{Title}}")), Formatter::Slack);
        assert_eq!(Formatter::select(WebhookKind::Generic, None), Formatter::Generic);
        assert_eq!(Formatter::select(WebhookKind::Generic, Some("   ")), Formatter::Generic);
        assert_eq!(
            Formatter::select(WebhookKind::Generic, Some("{{Title}}")),
            Formatter::Templated("{{Title}}".to_string())
        );
    }

    #[test]
    fn test_every_formatter_contains_title_message_and_field() {
        let n = sample();
        for formatter in [Formatter::Discord, Formatter::Slack, Formatter::Teams, Formatter::Generic] {
            let payload = formatter.format(&n).unwrap();
            let text = decode(&payload).to_string();
            assert!(text.contains("\"T\""), "{} missing title: {}", formatter.name(), text);
            assert!(text.contains("M"), "{} missing message", formatter.name());
            assert!(text.contains("V"), "{} missing field value", formatter.name());
            assert_eq!(formatter.content_type(), "application/json");
        }
    }

    #[test]
    fn test_discord_embed_shape() {
        let value = decode(&Formatter::Discord.format(&sample()).unwrap());
        let embed = &value["embeds"][0];
        assert_eq!(embed["title"], "T");
        assert_eq!(embed["description"], "M");
        assert_eq!(embed["color"], 0x3498DB);
        assert_eq!(embed["fields"][0]["name"], "K");
        assert_eq!(embed["fields"][0]["value"], "V");
        assert!(embed["timestamp"].is_string());
    }

    #[test]
    fn test_slack_blocks_and_color_attachment() {
        let value = decode(&Formatter::Slack.format(&sample()).unwrap());
        let blocks = value["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "header");
        assert_eq!(blocks.last().unwrap()["type"], "context");
        assert_eq!(value["attachments"][0]["color"], "#3498DB");
    }

    #[test]
    fn test_slack_splits_many_fields_into_sections() {
        let mut n = Notification::new(NotificationType::EndOfDay, "T", "M");
        for i in 0..12 {
            n = n.with_field(format!("K{}", i), "V");
        }
        let value = decode(&Formatter::Slack.format(&n).unwrap());
        let field_sections = value["blocks"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|b| b.get("fields").is_some())
            .count();
        assert_eq!(field_sections, 2);
    }

    #[test]
    fn test_teams_card_facts() {
        let value = decode(&Formatter::Teams.format(&sample()).unwrap());
        assert_eq!(value["@type"], "MessageCard");
        assert_eq!(value["themeColor"], "3498DB");
        assert_eq!(value["sections"][0]["facts"][0]["name"], "K");
    }

    #[test]
    fn test_generic_flat_shape() {
        let value = decode(&Formatter::Generic.format(&sample()).unwrap());
        assert_eq!(value["type"], "reminder");
        assert_eq!(value["title"], "T");
        assert_eq!(value["message"], "M");
        assert_eq!(value["fields"]["K"], "V");
        assert_eq!(value["color"], 0x3498DB);
    }

    #[test]
    fn test_template_renders_exact_payload() {
        let n = Notification::new(NotificationType::Test, "Custom", "Custom message");
        let formatter = Formatter::select(WebhookKind::Generic, Some(r#"{"text":"{{Title}}: {{Message}}"}"#));
        let payload = formatter.format(&n).unwrap();
        assert_eq!(decode(&payload), json!({ "text": "Custom: Custom message" }));
    }

    #[test]
    fn test_template_accepts_leading_dot_variables() {
        let n = Notification::new(NotificationType::Test, "Custom", "Custom message");
        let formatter = Formatter::select(WebhookKind::Generic, Some(r#"{"text":"{{.Title}}: {{.Message}}"}"#));
        let payload = formatter.format(&n).unwrap();
        assert_eq!(payload, br#"{"text":"Custom: Custom message"}"#.to_vec());

        let spaced = Formatter::Templated(r#"{"t":"{{ .Type }}"}"#.to_string());
        assert_eq!(decode(&spaced.format(&n).unwrap()), json!({ "t": "test" }));
    }

    #[test]
    fn test_dotted_template_still_reports_parse_errors() {
        let n = Notification::new(NotificationType::Test, "Custom", "Custom message");
        let formatter = Formatter::Templated(r#"{"text":"{{#if .Title}}{{.Title}}{{/each}}"}"#.to_string());
        assert!(matches!(formatter.format(&n), Err(FormatError::TemplateParse(_))));
    }

    #[test]
    fn test_template_escapes_values_as_json() {
        let n = Notification::new(NotificationType::Test, "say \"hi\"", "line1\nline2");
        let formatter = Formatter::Templated(r#"{"text":"{{Title}}","body":"{{Message}}"}"#.to_string());
        let value = decode(&formatter.format(&n).unwrap());
        assert_eq!(value["text"], "say \"hi\"");
        assert_eq!(value["body"], "line1\nline2");
    }

    #[test]
    fn test_template_can_reach_fields() {
        let n = sample();
        let formatter = Formatter::Templated(r#"{"k":"{{Fields.K}}","type":"{{Type}}"}"#.to_string());
        let value = decode(&formatter.format(&n).unwrap());
        assert_eq!(value, json!({ "k": "V", "type": "reminder" }));
    }

    #[test]
    fn test_invalid_template_is_an_error_not_a_fallback() {
        let formatter = Formatter::Templated(r#"{"text":"{{#if Title}}{{Title}}{{/each}}"}"#.to_string());
        let result = formatter.format(&sample());
        assert!(matches!(result, Err(FormatError::TemplateParse(_))));
    }

    #[test]
    fn test_template_unknown_variable_is_an_error() {
        let formatter = Formatter::Templated(r#"{"text":"{{Nope}}"}"#.to_string());
        let result = formatter.format(&sample());
        assert!(matches!(result, Err(FormatError::TemplateRender(_))));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("这是一段很长的中文描述文字", 6), "这是一...");
    }
}
