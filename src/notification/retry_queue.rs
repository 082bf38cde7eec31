//! 重试队列 - 立即投递失败后的第二道投递路径
//!
//! - 只存在于内存，进程重启即丢失
//! - 后台循环按固定间隔唤醒，把队列拆成“到期”和“未到期”两部分，处理到期项
//! - 每项按退避表（以尝试次数为下标，超出取最后一项）安排下次重试，
//!   达到最大尝试次数后丢弃并计入 failed
//! - `start` / `stop` 幂等；`stop` 会等当前这一轮处理结束

use chrono::{DateTime, Local, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{calculate_backoff, DeliveryClient, DeliveryRequest};
use super::error::DeliveryError;
use crate::store::WebhookRepository;

/// 重试队列配置
#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    /// 后台循环检查间隔
    pub check_interval: Duration,
    /// 第 N 次尝试后的等待时间（下标为已尝试次数）
    pub backoff: Vec<Duration>,
    /// 请求未指定时的最大尝试次数
    pub max_attempts: u32,
    /// 队列容量，满了以后淘汰最旧的一项
    pub capacity: usize,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            backoff: [5, 30, 120, 300, 900].iter().map(|s| Duration::from_secs(*s)).collect(),
            max_attempts: 5,
            capacity: 1000,
        }
    }
}

/// 入队请求（payload 已格式化）
#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub channel: String,
    pub url: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    /// None 时使用队列配置
    pub max_attempts: Option<u32>,
}

/// 队列中的一项
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub id: u64,
    pub channel: String,
    pub url: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

/// 队列统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub total_queued: u64,
    pub total_sent: u64,
    pub total_failed: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<QueuedDelivery>,
    /// 已从队列取出、正在本轮处理中的项数
    in_flight: usize,
    /// 每次 clear 加一；处理中的项在 epoch 变化后不再放回队列
    epoch: u64,
    next_id: u64,
    total_queued: u64,
    total_sent: u64,
    total_failed: u64,
}

struct QueueShared {
    state: Mutex<QueueState>,
    client: DeliveryClient,
    config: RetryQueueConfig,
    webhooks: Option<Arc<dyn WebhookRepository>>,
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 后台重试队列
pub struct RetryQueue {
    shared: Arc<QueueShared>,
    runner: Mutex<Option<Runner>>,
}

impl RetryQueue {
    /// `webhooks` 存在时，每次重试后回写渠道的 last_used/last_error
    pub fn new(
        client: DeliveryClient,
        config: RetryQueueConfig,
        webhooks: Option<Arc<dyn WebhookRepository>>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                client,
                config,
                webhooks,
            }),
            runner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RetryQueueConfig {
        &self.shared.config
    }

    /// 入队，首次重试时间为 now + backoff[0]（立即投递已经失败过一次）
    pub fn enqueue(&self, request: RetryRequest) -> u64 {
        self.enqueue_at(request, Utc::now())
    }

    pub fn enqueue_at(&self, request: RetryRequest, now: DateTime<Utc>) -> u64 {
        let config = &self.shared.config;
        let max_attempts = request.max_attempts.unwrap_or(config.max_attempts).max(1);
        let first_delay = to_chrono(calculate_backoff(&config.backoff, 0));

        let mut state = self.shared.lock_state();
        if config.capacity > 0 && state.items.len() >= config.capacity {
            if let Some(oldest) = state
                .items
                .iter()
                .enumerate()
                .min_by_key(|(_, item)| item.enqueued_at)
                .map(|(idx, _)| idx)
            {
                let evicted = state.items.remove(oldest);
                state.total_failed += 1;
                error!(
                    id = evicted.id,
                    channel = %evicted.channel,
                    capacity = config.capacity,
                    "Retry queue full, dropping oldest delivery"
                );
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        state.items.push(QueuedDelivery {
            id,
            channel: request.channel.clone(),
            url: request.url,
            content_type: request.content_type,
            payload: request.payload,
            enqueued_at: now,
            next_retry_at: now + first_delay,
            attempts: 0,
            max_attempts,
            last_error: None,
        });
        state.total_queued += 1;
        info!(id, channel = %request.channel, "Delivery queued for retry");
        id
    }

    /// 启动后台循环；已在运行时无操作
    pub fn start(&self) {
        let mut runner = self.lock_runner();
        if runner.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        shared.process_pass(Utc::now(), &token).await;
                    }
                }
            }
            debug!("Retry queue loop exited");
        });

        info!(interval_secs = self.shared.config.check_interval.as_secs(), "Retry queue started");
        *runner = Some(Runner { cancel, handle });
    }

    /// 停止后台循环并等待当前一轮处理结束；未运行时无操作
    pub async fn stop(&self) {
        let runner = self.lock_runner().take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(e) = runner.handle.await {
                warn!(error = %e, "Retry queue loop ended abnormally");
            }
            info!(pending = self.pending(), "Retry queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_runner().is_some()
    }

    /// 立即处理一轮到期项，返回处理的数量
    pub async fn process_due(&self) -> usize {
        self.process_due_at(Utc::now()).await
    }

    pub async fn process_due_at(&self, now: DateTime<Utc>) -> usize {
        self.shared.process_pass(now, &CancellationToken::new()).await
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock_state();
        QueueStats {
            pending: state.items.len() + state.in_flight,
            total_queued: state.total_queued,
            total_sent: state.total_sent,
            total_failed: state.total_failed,
        }
    }

    /// 待重试项数，包含正在本轮处理中的项
    pub fn pending(&self) -> usize {
        let state = self.shared.lock_state();
        state.items.len() + state.in_flight
    }

    /// 当前队列内容的拷贝
    pub fn items(&self) -> Vec<QueuedDelivery> {
        self.shared.lock_state().items.clone()
    }

    /// 无条件丢弃所有待重试项，包括正在处理中的项（不改变累计计数）
    pub fn clear(&self) {
        let mut state = self.shared.lock_state();
        let dropped = state.items.len() + state.in_flight;
        state.items.clear();
        state.in_flight = 0;
        state.epoch += 1;
        if dropped > 0 {
            warn!(dropped, "Retry queue cleared");
        }
    }

    fn lock_runner(&self) -> MutexGuard<'_, Option<Runner>> {
        self.runner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl QueueShared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn process_pass(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> usize {
        let (due, epoch) = {
            let mut state = self.lock_state();
            let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.items)
                .into_iter()
                .partition(|item| item.next_retry_at <= now);
            state.items = rest;
            state.in_flight += due.len();
            (due, state.epoch)
        };

        if due.is_empty() {
            return 0;
        }
        debug!(due = due.len(), "Processing retry queue");

        let processed = due.len();
        for mut item in due {
            if cancel.is_cancelled() {
                self.finish_item(epoch, Some(item));
                continue;
            }

            item.attempts += 1;
            let request = DeliveryRequest {
                url: item.url.clone(),
                content_type: item.content_type.clone(),
                payload: item.payload.clone(),
            };

            match self.client.attempt(&request, cancel).await {
                Ok(status) => {
                    self.lock_state().total_sent += 1;
                    self.finish_item(epoch, None);
                    self.record_status(&item.channel, None);
                    info!(
                        id = item.id,
                        channel = %item.channel,
                        status,
                        attempts = item.attempts,
                        "Queued delivery succeeded"
                    );
                }
                Err(failure) if failure.error == DeliveryError::Cancelled => {
                    // 未真正完成的尝试不计数
                    item.attempts -= 1;
                    self.finish_item(epoch, Some(item));
                }
                Err(failure) => {
                    let message = failure.error.to_string();
                    self.record_status(&item.channel, Some(&message));
                    item.last_error = Some(message);

                    if item.attempts >= item.max_attempts || !failure.error.is_retryable() {
                        self.lock_state().total_failed += 1;
                        self.finish_item(epoch, None);
                        error!(
                            id = item.id,
                            channel = %item.channel,
                            attempts = item.attempts,
                            error = ?item.last_error,
                            "Queued delivery dropped"
                        );
                    } else {
                        let delay = calculate_backoff(&self.config.backoff, item.attempts as usize);
                        item.next_retry_at = now + to_chrono(delay);
                        debug!(
                            id = item.id,
                            channel = %item.channel,
                            attempts = item.attempts,
                            next_retry_at = %item.next_retry_at,
                            "Queued delivery failed, rescheduled"
                        );
                        self.finish_item(epoch, Some(item));
                    }
                }
            }
        }

        processed
    }

    /// 一项处理结束：`requeue` 为 Some 时放回队列。
    /// 处理期间队列被 clear 过（epoch 变化）则直接丢弃
    fn finish_item(&self, epoch: u64, requeue: Option<QueuedDelivery>) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            if let Some(item) = requeue {
                debug!(id = item.id, channel = %item.channel, "Queue cleared during retry, dropping delivery");
            }
            return;
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(item) = requeue {
            state.items.push(item);
        }
    }

    fn record_status(&self, channel: &str, error: Option<&str>) {
        if let Some(webhooks) = &self.webhooks {
            if let Err(e) = webhooks.update_webhook_status(channel, Local::now(), error) {
                warn!(channel = %channel, error = %e, "Failed to record webhook status");
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Webhook, WebhookKind};
    use crate::notification::client::DeliveryConfig;
    use crate::store::MemoryStore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn queue_with(max_attempts: u32, webhooks: Option<Arc<dyn WebhookRepository>>) -> RetryQueue {
        let client = DeliveryClient::new(DeliveryConfig {
            timeout: Duration::from_secs(2),
            max_retries: 0,
            backoff: vec![],
        })
        .unwrap();
        RetryQueue::new(
            client,
            RetryQueueConfig {
                check_interval: Duration::from_millis(20),
                max_attempts,
                ..Default::default()
            },
            webhooks,
        )
    }

    fn request(url: &str) -> RetryRequest {
        RetryRequest {
            channel: "ops".to_string(),
            url: url.to_string(),
            content_type: "application/json".to_string(),
            payload: b"{}".to_vec(),
            max_attempts: None,
        }
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(1)
    }

    #[test]
    fn test_enqueue_schedules_first_retry_with_first_backoff() {
        let queue = queue_with(5, None);
        let now = Utc::now();
        queue.enqueue_at(request("http://localhost/hook"), now);

        let items = queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].next_retry_at, now + chrono::Duration::seconds(5));
        assert_eq!(items[0].attempts, 0);
        assert_eq!(items[0].max_attempts, 5);

        let stats = queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_queued, 1);
    }

    #[tokio::test]
    async fn test_not_yet_due_items_are_left_alone() {
        let queue = queue_with(5, None);
        let now = Utc::now();
        queue.enqueue_at(request("http://127.0.0.1:9/hook"), now);

        assert_eq!(queue.process_due_at(now).await, 0);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_successful_retry_increments_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store
            .add_webhook(Webhook::new("ops", WebhookKind::Generic, server.uri()))
            .unwrap();
        let queue = queue_with(5, Some(store.clone()));
        queue.enqueue(request(&server.uri()));

        assert_eq!(queue.process_due_at(far_future()).await, 1);
        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_sent, 1);
        assert_eq!(stats.total_failed, 0);

        let hook = store.get_webhook("ops").unwrap().unwrap();
        assert!(hook.last_used_at.is_some());
        assert_eq!(hook.last_error, None);
    }

    #[tokio::test]
    async fn test_failure_reschedules_with_backoff_by_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let queue = queue_with(5, None);
        queue.enqueue(request(&server.uri()));

        let pass_time = far_future();
        queue.process_due_at(pass_time).await;
        let items = queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[0].next_retry_at, pass_time + chrono::Duration::seconds(30));
        assert!(items[0].last_error.as_deref().unwrap_or("").contains("500"));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_drop_and_count_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let queue = queue_with(2, None);
        queue.enqueue(request(&server.uri()));

        let mut when = far_future();
        queue.process_due_at(when).await;
        assert_eq!(queue.pending(), 1);

        when += chrono::Duration::days(1);
        queue.process_due_at(when).await;

        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_sent, 0);
        assert_eq!(stats.total_queued, 1);
    }

    #[tokio::test]
    async fn test_terminal_error_drops_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let queue = queue_with(5, None);
        queue.enqueue(request(&server.uri()));
        queue.process_due_at(far_future()).await;

        assert_eq!(queue.stats().total_failed, 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_clear_keeps_cumulative_counters() {
        let queue = queue_with(5, None);
        queue.enqueue(request("http://localhost/a"));
        queue.enqueue(request("http://localhost/b"));
        queue.clear();

        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_queued, 2);
        assert_eq!(stats.total_failed, 0);
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let client = DeliveryClient::new(DeliveryConfig::default()).unwrap();
        let queue = RetryQueue::new(
            client,
            RetryQueueConfig {
                capacity: 2,
                ..Default::default()
            },
            None,
        );
        let now = Utc::now();
        let first = queue.enqueue_at(request("http://localhost/1"), now);
        queue.enqueue_at(request("http://localhost/2"), now + chrono::Duration::seconds(1));
        queue.enqueue_at(request("http://localhost/3"), now + chrono::Duration::seconds(2));

        let ids: Vec<u64> = queue.items().iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&first));
        assert_eq!(queue.stats().total_failed, 1);
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let queue = queue_with(5, None);
        queue.start();
        queue.start();
        assert!(queue.is_running());

        queue.stop().await;
        assert!(!queue.is_running());
        queue.stop().await;
    }

    fn immediate_queue(check_interval: Duration) -> Arc<RetryQueue> {
        let client = DeliveryClient::new(DeliveryConfig::default()).unwrap();
        Arc::new(RetryQueue::new(
            client,
            RetryQueueConfig {
                check_interval,
                backoff: vec![Duration::ZERO],
                ..Default::default()
            },
            None,
        ))
    }

    #[tokio::test]
    async fn test_in_flight_items_count_as_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let queue = immediate_queue(Duration::from_secs(30));
        queue.enqueue(request(&server.uri()));

        let pass = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_due().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.stats().pending, 1);

        assert_eq!(pass.await.unwrap(), 1);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.items()[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_clear_during_pass_drops_in_flight_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let queue = immediate_queue(Duration::from_secs(30));
        queue.enqueue(request(&server.uri()));

        let pass = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_due().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.clear();
        assert_eq!(queue.pending(), 0);

        pass.await.unwrap();
        assert_eq!(queue.pending(), 0);
        assert!(queue.items().is_empty());

        // clear 之后新入队的项不受影响
        queue.enqueue(request(&server.uri()));
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_current_pass() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let queue = immediate_queue(Duration::from_millis(10));
        queue.enqueue(request(&server.uri()));
        queue.start();

        // 等到这一项被取出处理
        for _ in 0..100 {
            if queue.items().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.items().is_empty());
        assert_eq!(queue.pending(), 1);

        queue.stop().await;

        // stop 返回时这一轮已经结束：被取消的尝试已放回队列且不计次数
        let items = queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 0);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.stats().total_sent, 0);
    }

    #[tokio::test]
    async fn test_background_loop_delivers_due_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(DeliveryConfig::default()).unwrap();
        let queue = RetryQueue::new(
            client,
            RetryQueueConfig {
                check_interval: Duration::from_millis(10),
                backoff: vec![Duration::ZERO],
                ..Default::default()
            },
            None,
        );
        queue.enqueue(request(&server.uri()));
        queue.start();

        for _ in 0..100 {
            if queue.stats().total_sent == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.stop().await;
        assert_eq!(queue.stats().total_sent, 1);
        assert_eq!(queue.pending(), 0);
    }
}
