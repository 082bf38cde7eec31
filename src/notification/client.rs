//! 投递客户端 - 单次通知的 HTTP POST，带有限次重试
//!
//! 分类规则：
//! - 2xx：成功，立即返回
//! - 429 / 5xx / 网络错误：可重试，按退避表等待后继续
//! - 其他 4xx：终止，不再重试
//! - 取消：立即终止并返回 `DeliveryError::Cancelled`

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::DeliveryError;

/// 所有请求携带的 User-Agent
pub const USER_AGENT: &str = concat!("worklog-notify/", env!("CARGO_PKG_VERSION"));

/// 错误响应体最多保留的字符数
const MAX_ERROR_BODY_CHARS: usize = 200;

/// 投递客户端配置
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// 单次请求超时
    pub timeout: Duration,
    /// 首次尝试之后最多重试几次
    pub max_retries: u32,
    /// 第 N 次重试前的等待时间；超出长度时使用最后一项
    pub backoff: Vec<Duration>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
        }
    }
}

/// 一个已经格式化好的投递请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub url: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// 投递结果
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// 最后一次响应的状态码（请求未完成时为 0）
    pub status: u16,
    /// 所有尝试的总耗时
    pub duration: Duration,
    pub attempts: u32,
    /// 仅成功时为 None
    pub error: Option<DeliveryError>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 单次尝试的失败
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub status: u16,
    pub error: DeliveryError,
}

/// 退避表查询：下标超出时返回最后一项，空表返回 0
pub fn calculate_backoff(schedule: &[Duration], index: usize) -> Duration {
    schedule
        .get(index)
        .or_else(|| schedule.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// HTTP 投递客户端（可廉价 clone，内部共享连接池）
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: Client,
    config: DeliveryConfig,
}

impl DeliveryClient {
    pub fn new(config: DeliveryConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// 完整投递：首次立即发送，失败后按退避表重试
    pub async fn deliver(&self, request: &DeliveryRequest, cancel: &CancellationToken) -> DeliveryOutcome {
        let started = Instant::now();
        let mut attempts = 0;
        let mut last_status = 0;
        let mut last_error = DeliveryError::Network("no attempt made".to_string());

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = calculate_backoff(&self.config.backoff, attempt as usize - 1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Self::outcome(last_status, started, attempts, Some(DeliveryError::Cancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            attempts += 1;
            match self.attempt(request, cancel).await {
                Ok(status) => return Self::outcome(status, started, attempts, None),
                Err(failure) => {
                    last_status = failure.status;
                    if !failure.error.is_retryable() {
                        return Self::outcome(failure.status, started, attempts, Some(failure.error));
                    }
                    debug!(
                        url = %request.url,
                        attempt = attempts,
                        error = %failure.error,
                        "Delivery attempt failed, will retry"
                    );
                    last_error = failure.error;
                }
            }
        }

        Self::outcome(last_status, started, attempts, Some(last_error))
    }

    /// 单次尝试，不重试（重试队列使用）
    pub async fn attempt(&self, request: &DeliveryRequest, cancel: &CancellationToken) -> Result<u16, AttemptFailure> {
        if cancel.is_cancelled() {
            return Err(AttemptFailure {
                status: 0,
                error: DeliveryError::Cancelled,
            });
        }

        let send = self
            .http
            .post(&request.url)
            .header(CONTENT_TYPE, request.content_type.as_str())
            .body(request.payload.clone())
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AttemptFailure { status: 0, error: DeliveryError::Cancelled });
            }
            response = send => response,
        };

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(status.as_u16())
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    Err(AttemptFailure {
                        status: status.as_u16(),
                        error: DeliveryError::Status {
                            status: status.as_u16(),
                            body: truncate_body(&body),
                        },
                    })
                }
            }
            Err(e) => Err(AttemptFailure {
                status: 0,
                error: DeliveryError::Network(e.to_string()),
            }),
        }
    }

    fn outcome(status: u16, started: Instant, attempts: u32, error: Option<DeliveryError>) -> DeliveryOutcome {
        DeliveryOutcome {
            status,
            duration: started.elapsed(),
            attempts,
            error,
        }
    }
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let kept: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", kept)
    }
}
