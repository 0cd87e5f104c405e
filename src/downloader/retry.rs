//! 下载失败后的重试策略

use std::time::Duration;

use rand::Rng;

use crate::common::config::AdvancedConfig;
use crate::downloader::error::{FailureClass, FetchError};

const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后换下一个地址重试
    RetryAfter(Duration),
    /// 放弃当前这次运行，任务回到等待队列
    Requeue,
    /// 任务失败
    Fail,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 每个流可以重试的次数
    pub max_retries: u32,
    pub interval: Duration,
    pub jitter: bool,
}

impl From<&AdvancedConfig> for RetryPolicy {
    fn from(config: &AdvancedConfig) -> Self {
        Self {
            max_retries: if config.retry_when_download_error {
                config.download_error_retry_count
            } else {
                0
            },
            interval: config.retry_interval(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// `attempt` 是已经重试过的次数
    pub fn decide(&self, error: &FetchError, attempt: u32) -> RetryDecision {
        match error.class() {
            FailureClass::Permanent => RetryDecision::Fail,
            FailureClass::Requeue => RetryDecision::Requeue,
            FailureClass::Transient if attempt < self.max_retries => {
                RetryDecision::RetryAfter(self.delay_for(attempt))
            }
            FailureClass::Transient => RetryDecision::Fail,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.interval.as_secs_f64() * BACKOFF_MULTIPLIER.powi(attempt as i32);
        let base = base.min(MAX_DELAY.as_secs_f64());
        if self.jitter && base > 0.0 {
            let factor = rand::rng().random_range(0.75..=1.25);
            Duration::from_secs_f64(base * factor)
        } else {
            Duration::from_secs_f64(base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            interval: Duration::from_secs(3),
            jitter: false,
        }
    }

    #[test]
    fn transient_errors_retry_until_budget_is_spent() {
        let err = FetchError::Transient("timeout".into());
        let policy = policy(3);
        assert_eq!(policy.decide(&err, 0), RetryDecision::RetryAfter(Duration::from_secs(3)));
        assert_eq!(policy.decide(&err, 1), RetryDecision::RetryAfter(Duration::from_secs(6)));
        assert_eq!(policy.decide(&err, 2), RetryDecision::RetryAfter(Duration::from_secs(12)));
        assert_eq!(policy.decide(&err, 3), RetryDecision::Fail);
    }

    #[test]
    fn permanent_and_rate_limited_errors_skip_retry() {
        let policy = policy(3);
        assert_eq!(policy.decide(&FetchError::from_status(404, "u"), 0), RetryDecision::Fail);
        assert_eq!(policy.decide(&FetchError::from_status(429, "u"), 0), RetryDecision::Requeue);
    }

    #[test]
    fn disabled_retry_fails_immediately() {
        let config = AdvancedConfig {
            retry_when_download_error: false,
            ..Default::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(
            policy.decide(&FetchError::from_status(503, "u"), 0),
            RetryDecision::Fail
        );
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy(100);
        assert_eq!(policy.delay_for(20), MAX_DELAY);
    }
}
