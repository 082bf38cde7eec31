use thiserror::Error;

/// 把通知渲染成渠道 payload 时的错误
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid payload template: {0}")]
    TemplateParse(String),

    #[error("payload template failed to render: {0}")]
    TemplateRender(String),
}

/// 一次投递的失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// 远端返回非 2xx
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// 超时、连接被拒等网络层错误
    #[error("request failed: {0}")]
    Network(String),

    /// 调用方取消（daemon 退出）
    #[error("delivery cancelled")]
    Cancelled,

    /// payload 渲染失败
    #[error("format error: {0}")]
    Format(String),

    #[error("webhook not found: {0}")]
    WebhookNotFound(String),

    /// 读取渠道配置失败
    #[error("webhook store error: {0}")]
    Repository(String),
}

impl DeliveryError {
    /// 429、5xx 和网络错误可以重试；其余 4xx、格式错误、取消都不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Status { status, .. } => *status == 429 || *status >= 500,
            DeliveryError::Network(_) => true,
            DeliveryError::Cancelled
            | DeliveryError::Format(_)
            | DeliveryError::WebhookNotFound(_)
            | DeliveryError::Repository(_) => false,
        }
    }
}

impl From<FormatError> for DeliveryError {
    fn from(e: FormatError) -> Self {
        DeliveryError::Format(e.to_string())
    }
}
