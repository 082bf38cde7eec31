//! 调度器 - 按固定节奏驱动所有 checker
//!
//! - 快 tick（默认 60s）：reminder → idle → break → summary（daily → end of day）
//! - 慢 tick（默认 5min）：goal
//! - 快 tick 之间的墙钟间隔超过睡眠阈值（默认 1h）时视为主机刚从休眠恢复，
//!   本轮全部跳过，但基准时间照常推进
//! - 每个 checker 独立隔离：出错或 panic 只记日志，不影响同一轮的其他 checker
//! - `stop` 等当前这一轮结束后才返回

use chrono::{DateTime, Local};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checker::Checker;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fast_tick: Duration,
    pub slow_tick: Duration,
    /// 两次快 tick 的墙钟间隔超过该值时跳过本轮
    pub sleep_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_tick: Duration::from_secs(60),
            slow_tick: Duration::from_secs(300),
            sleep_threshold: Duration::from_secs(3600),
        }
    }
}

/// 一次快 tick 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    /// 距上次 tick 太久（主机休眠），本轮跳过
    SkippedStale,
}

type CheckerSlot = Option<Box<dyn Checker>>;

#[derive(Default)]
struct TickState {
    reminder: CheckerSlot,
    idle: CheckerSlot,
    breaks: CheckerSlot,
    summary: CheckerSlot,
    goal: CheckerSlot,
    last_fast_tick: Option<DateTime<Local>>,
}

impl TickState {
    async fn fast_tick_at(&mut self, now: DateTime<Local>, sleep_threshold: Duration) -> TickOutcome {
        let previous = self.last_fast_tick.replace(now);
        if let Some(previous) = previous {
            let elapsed = (now - previous).to_std().unwrap_or(Duration::ZERO);
            if elapsed > sleep_threshold {
                warn!(
                    elapsed_secs = elapsed.as_secs(),
                    "Long gap since last tick (host sleep?), skipping stale cycle"
                );
                return TickOutcome::SkippedStale;
            }
        }

        run_checker(&mut self.reminder, now).await;
        run_checker(&mut self.idle, now).await;
        run_checker(&mut self.breaks, now).await;
        run_checker(&mut self.summary, now).await;
        TickOutcome::Ran
    }

    async fn slow_tick_at(&mut self, now: DateTime<Local>) {
        run_checker(&mut self.goal, now).await;
    }
}

/// 运行单个 checker，错误和 panic 都只记日志
async fn run_checker(slot: &mut CheckerSlot, now: DateTime<Local>) {
    let Some(checker) = slot.as_mut() else {
        return;
    };
    let name = checker.name();
    match AssertUnwindSafe(checker.check_at(now)).catch_unwind().await {
        Ok(Ok(())) => debug!(checker = name, "Check completed"),
        Ok(Err(e)) => warn!(checker = name, error = %e, "Check failed"),
        Err(_) => error!(checker = name, "Checker panicked"),
    }
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 调度器
pub struct Scheduler {
    config: SchedulerConfig,
    state: Arc<AsyncMutex<TickState>>,
    runner: Mutex<Option<Runner>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Arc::new(AsyncMutex::new(TickState::default())),
            runner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn set_reminder_checker(&self, checker: impl Checker + 'static) {
        self.state.lock().await.reminder = Some(Box::new(checker));
    }

    pub async fn set_idle_checker(&self, checker: impl Checker + 'static) {
        self.state.lock().await.idle = Some(Box::new(checker));
    }

    pub async fn set_break_checker(&self, checker: impl Checker + 'static) {
        self.state.lock().await.breaks = Some(Box::new(checker));
    }

    pub async fn set_summary_generator(&self, checker: impl Checker + 'static) {
        self.state.lock().await.summary = Some(Box::new(checker));
    }

    pub async fn set_goal_checker(&self, checker: impl Checker + 'static) {
        self.state.lock().await.goal = Some(Box::new(checker));
    }

    /// 以 `now` 执行一次快 tick
    pub async fn fast_tick_at(&self, now: DateTime<Local>) -> TickOutcome {
        self.state
            .lock()
            .await
            .fast_tick_at(now, self.config.sleep_threshold)
            .await
    }

    /// 以 `now` 执行一次慢 tick
    pub async fn slow_tick_at(&self, now: DateTime<Local>) {
        self.state.lock().await.slow_tick_at(now).await;
    }

    /// 启动后台循环；已在运行时无操作
    pub fn start(&self) {
        let mut runner = self.lock_runner();
        if runner.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            state.lock().await.last_fast_tick = Some(Local::now());

            let start = Instant::now();
            let mut fast = interval_at(start + config.fast_tick, config.fast_tick);
            fast.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut slow = interval_at(start + config.slow_tick, config.slow_tick);
            slow.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = fast.tick() => {
                        state.lock().await.fast_tick_at(Local::now(), config.sleep_threshold).await;
                    }
                    _ = slow.tick() => {
                        state.lock().await.slow_tick_at(Local::now()).await;
                    }
                }
            }
            debug!("Scheduler loop exited");
        });

        info!(
            fast_tick_secs = self.config.fast_tick.as_secs(),
            slow_tick_secs = self.config.slow_tick.as_secs(),
            "Scheduler started"
        );
        *runner = Some(Runner { cancel, handle });
    }

    /// 停止后台循环并等待当前 tick 结束；未运行时无操作
    pub async fn stop(&self) {
        let runner = self.lock_runner().take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(e) = runner.handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
            info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_runner().is_some()
    }

    fn lock_runner(&self) -> MutexGuard<'_, Option<Runner>> {
        self.runner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
