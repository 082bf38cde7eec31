//! 守护进程装配 - 存储 → 分发器 → 重试队列 → checker → 调度器
//!
//! 启动顺序：重试队列先于调度器；停止顺序相反，最后取消分发器上还在进行的投递。

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checker::{BreakChecker, GoalChecker, IdleChecker, ReminderChecker, Repositories, SummaryGenerator};
use crate::config::NotifierConfig;
use crate::notification::{DeliveryClient, Dispatcher, NotificationSink, RetryQueue};
use crate::scheduler::Scheduler;
use crate::store::MemoryStore;

pub struct NotifierDaemon {
    scheduler: Scheduler,
    retry_queue: Arc<RetryQueue>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl NotifierDaemon {
    /// 装配所有组件（不启动）
    pub async fn build(config: &NotifierConfig, store: Arc<MemoryStore>) -> Result<Self> {
        let client = DeliveryClient::new(config.delivery_config())?;
        let retry_queue = Arc::new(RetryQueue::new(
            client.clone(),
            config.retry_queue_config(),
            Some(store.clone()),
        ));
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::with_options(
            store.clone(),
            client,
            Some(retry_queue.clone()),
            cancel.clone(),
        );

        let repos = Repositories::from_store(store);
        let sink: Arc<dyn NotificationSink> = Arc::new(dispatcher.clone());
        let scheduler = Scheduler::new(config.scheduler_config());
        scheduler
            .set_reminder_checker(ReminderChecker::new(repos.clone(), sink.clone(), config.fast_tick()))
            .await;
        scheduler
            .set_idle_checker(IdleChecker::new(repos.clone(), sink.clone()))
            .await;
        scheduler
            .set_break_checker(BreakChecker::new(repos.clone(), sink.clone()))
            .await;
        scheduler
            .set_summary_generator(SummaryGenerator::new(repos.clone(), sink.clone()))
            .await;
        scheduler.set_goal_checker(GoalChecker::new(repos, sink)).await;

        Ok(Self {
            scheduler,
            retry_queue,
            dispatcher,
            cancel,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn start(&self) {
        self.retry_queue.start();
        self.scheduler.start();
        info!(
            webhooks = self.dispatcher.count_enabled_webhooks(),
            "Notifier daemon started"
        );
    }

    /// 停止调度器和重试队列，并取消未完成的投递
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.stop().await;
        self.retry_queue.stop().await;
        let stats = self.retry_queue.stats();
        info!(
            pending = stats.pending,
            sent = stats.total_sent,
            failed = stats.total_failed,
            "Notifier daemon stopped"
        );
    }
}
