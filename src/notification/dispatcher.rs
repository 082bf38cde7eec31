//! 通知分发器 - 把一条通知并发投递到所有启用的渠道
//!
//! - 每个渠道一个独立任务，某个渠道慢或失败不影响其他渠道；全部完成后才返回
//! - 按渠道类型选择格式化器（generic + 模板 → 模板格式化）
//! - 每次投递结束后回写渠道的 last_used / last_error（失败只记日志）
//! - 分发器本身从不返回错误：没有渠道时返回空列表，失败体现在每个结果里

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{DeliveryClient, DeliveryRequest};
use super::error::DeliveryError;
use super::formatter::Formatter;
use super::message::Notification;
use super::retry_queue::{RetryQueue, RetryRequest};
use crate::model::Webhook;
use crate::store::WebhookRepository;

/// 单个渠道的投递结果
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub channel: String,
    pub success: bool,
    /// 请求未完成时为 0
    pub status_code: u16,
    pub duration: Duration,
    pub error: Option<DeliveryError>,
}

impl DispatchResult {
    fn failed(channel: impl Into<String>, error: DeliveryError) -> Self {
        Self {
            channel: channel.into(),
            success: false,
            status_code: 0,
            duration: Duration::ZERO,
            error: Some(error),
        }
    }
}

/// 通知出口 - checker 只依赖这个 trait
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_notification(&self, notification: &Notification) -> Vec<DispatchResult>;
}

struct DispatchInner {
    webhooks: Arc<dyn WebhookRepository>,
    client: DeliveryClient,
    retry_queue: Option<Arc<RetryQueue>>,
    cancel: CancellationToken,
}

/// 通知分发器
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Dispatcher {
    pub fn new(webhooks: Arc<dyn WebhookRepository>, client: DeliveryClient) -> Self {
        Self::with_options(webhooks, client, None, CancellationToken::new())
    }

    /// `retry_queue` 存在时，可重试的失败会交给重试队列；`cancel` 取消后所有投递立即终止
    pub fn with_options(
        webhooks: Arc<dyn WebhookRepository>,
        client: DeliveryClient,
        retry_queue: Option<Arc<RetryQueue>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                webhooks,
                client,
                retry_queue,
                cancel,
            }),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// 并发投递到所有启用的渠道，结果顺序与渠道列表一致
    pub async fn send_notification(&self, notification: &Notification) -> Vec<DispatchResult> {
        let webhooks = match self.inner.webhooks.list_enabled_webhooks() {
            Ok(list) => list,
            Err(e) => {
                error!(error = %e, kind = %notification.kind, "Failed to list webhooks, notification not sent");
                return Vec::new();
            }
        };

        if webhooks.is_empty() {
            debug!(kind = %notification.kind, "No enabled webhooks, skipping notification");
            return Vec::new();
        }

        let names: Vec<String> = webhooks.iter().map(|w| w.name.clone()).collect();
        let mut set = JoinSet::new();
        for (idx, webhook) in webhooks.into_iter().enumerate() {
            let inner = self.inner.clone();
            let notification = notification.clone();
            set.spawn(async move { (idx, inner.deliver(&webhook, &notification).await) });
        }

        let mut slots: Vec<Option<DispatchResult>> = vec![None; names.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => error!(error = %e, "Webhook delivery task failed"),
            }
        }

        let results: Vec<DispatchResult> = slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| {
                    DispatchResult::failed(name, DeliveryError::Network("delivery task aborted".to_string()))
                })
            })
            .collect();

        let sent = results.iter().filter(|r| r.success).count();
        info!(
            kind = %notification.kind,
            title = %notification.title,
            sent,
            total = results.len(),
            "Notification dispatched"
        );
        results
    }

    /// 只投递到指定名称的渠道（不要求渠道启用，用于“测试此 webhook”）
    pub async fn send_to_single(&self, notification: &Notification, channel_name: &str) -> DispatchResult {
        match self.inner.webhooks.get_webhook(channel_name) {
            Ok(Some(webhook)) => self.inner.deliver(&webhook, notification).await,
            Ok(None) => {
                warn!(channel = %channel_name, "Webhook not found");
                DispatchResult::failed(channel_name, DeliveryError::WebhookNotFound(channel_name.to_string()))
            }
            Err(e) => {
                error!(channel = %channel_name, error = %e, "Failed to load webhook");
                DispatchResult::failed(channel_name, DeliveryError::Repository(e.to_string()))
            }
        }
    }

    /// 发送一条测试通知
    pub async fn test_webhook(&self, channel_name: &str) -> DispatchResult {
        self.send_to_single(&Notification::test(channel_name), channel_name).await
    }

    pub fn has_enabled_webhooks(&self) -> bool {
        self.count_enabled_webhooks() > 0
    }

    pub fn count_enabled_webhooks(&self) -> usize {
        match self.inner.webhooks.list_enabled_webhooks() {
            Ok(list) => list.len(),
            Err(e) => {
                warn!(error = %e, "Failed to count webhooks");
                0
            }
        }
    }
}

#[async_trait]
impl NotificationSink for Dispatcher {
    async fn send_notification(&self, notification: &Notification) -> Vec<DispatchResult> {
        Dispatcher::send_notification(self, notification).await
    }
}

impl DispatchInner {
    async fn deliver(&self, webhook: &Webhook, notification: &Notification) -> DispatchResult {
        let formatter = Formatter::select(webhook.kind, webhook.template.as_deref());
        let payload = match formatter.format(notification) {
            Ok(payload) => payload,
            Err(e) => {
                let error = DeliveryError::from(e);
                warn!(channel = %webhook.name, formatter = formatter.name(), error = %error, "Failed to format notification");
                self.record_status(&webhook.name, Some(&error));
                return DispatchResult::failed(&webhook.name, error);
            }
        };

        let request = DeliveryRequest {
            url: webhook.url.clone(),
            content_type: formatter.content_type().to_string(),
            payload,
        };
        let outcome = self.client.deliver(&request, &self.cancel).await;
        self.record_status(&webhook.name, outcome.error.as_ref());

        match &outcome.error {
            None => debug!(
                channel = %webhook.name,
                status = outcome.status,
                attempts = outcome.attempts,
                "Webhook delivered"
            ),
            Some(error) => {
                warn!(
                    channel = %webhook.name,
                    status = outcome.status,
                    attempts = outcome.attempts,
                    error = %error,
                    "Webhook delivery failed"
                );
                if error.is_retryable() {
                    if let Some(queue) = &self.retry_queue {
                        queue.enqueue(RetryRequest {
                            channel: webhook.name.clone(),
                            url: request.url.clone(),
                            content_type: request.content_type.clone(),
                            payload: request.payload.clone(),
                            max_attempts: None,
                        });
                    }
                }
            }
        }

        DispatchResult {
            channel: webhook.name.clone(),
            success: outcome.is_success(),
            status_code: outcome.status,
            duration: outcome.duration,
            error: outcome.error,
        }
    }

    /// 投递结束后回写渠道状态；失败只记日志
    fn record_status(&self, channel: &str, error: Option<&DeliveryError>) {
        let message = error.map(|e| e.to_string());
        if let Err(e) = self
            .webhooks
            .update_webhook_status(channel, Local::now(), message.as_deref())
        {
            warn!(channel = %channel, error = %e, "Failed to record webhook status");
        }
    }
}
