//! 重试控制
//!
//! 纯策略对象，不持有共享状态。连接重试、任务重试和凭据链是三个独立的轴：
//! 前两者由 `RetryController::with_retry` 驱动，凭据链由连接管理器在每个
//! 凭据上各调用一次 `with_retry` 实现。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use fleetd_core::config::ConnectionConfig;
use fleetd_core::Retryable;
use tracing::debug;

/// 指数退避参数
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter_factor: f64,
}

impl Backoff {
    /// 不等待，立即重试
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_ms),
            multiplier: config.backoff_multiplier,
            max: Duration::from_millis(config.max_backoff_ms),
            jitter_factor: config.jitter_factor,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从0开始计数）
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        if base == 0.0 {
            return Duration::ZERO;
        }

        let exponential = base * self.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max.as_secs_f64());

        // 随机抖动避免多个设备同时重试
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// 单个重试轴的策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 首次尝试之外的重试次数
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Backoff) -> Self {
        Self { retries, backoff }
    }

    /// 只尝试一次
    pub fn once() -> Self {
        Self::new(0, Backoff::none())
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// 重试结果
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// 实际尝试次数
    pub attempts: u32,
    /// 是否因次数用尽而失败（不可重试错误为 false）
    pub exhausted: bool,
}

impl<T, E> RetryOutcome<T, E> {
    /// 消耗的重试次数
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

pub struct RetryController;

impl RetryController {
    /// 带重试地执行 `attempt_fn`
    ///
    /// 可重试错误在预算内重新执行；不可重试错误立即返回，不消耗预算。
    /// 预算用尽时调用 `on_exhaust` 并返回最后一次的错误。
    pub async fn with_retry<T, E, F, Fut, X>(
        policy: &RetryPolicy,
        mut attempt_fn: F,
        on_exhaust: X,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        X: FnOnce(&E, u32),
    {
        let mut attempt = 0u32;
        loop {
            let result = attempt_fn(attempt).await;
            let attempts = attempt + 1;

            let err = match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        exhausted: false,
                    }
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!("第 {} 次尝试遇到不可重试错误: {}", attempts, err);
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    exhausted: false,
                };
            }

            if attempt >= policy.retries {
                on_exhaust(&err, attempts);
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    exhausted: true,
                };
            }

            let delay = policy.backoff.delay(attempt);
            debug!(
                "第 {} 次尝试失败: {}，{:?} 后重试",
                attempts, err, delay
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}
