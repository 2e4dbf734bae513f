//! 启动阶段的依赖等待
//!
//! broker 与数据库往往和服务同时拉起，首次连接失败很常见。
//! 这里按指数退避重试可重试错误，配置类错误立即返回。

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::FleetError;

/// 退避策略
///
/// 第 n 次重试前等待 `initial_delay * multiplier^n`，不超过 `max_delay`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 不含首次尝试
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// 依次产出每次重试前的等待时长
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

/// 执行 `operation`，可重试错误按策略退避后重试
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&FleetError) -> bool,
    mut operation: F,
) -> Result<T, FleetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FleetError>>,
{
    let mut delays = policy.delays();
    let mut retries = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    info!(operation = operation_name, retries, "依赖已就绪");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            error!(operation = operation_name, error = %err, "不可重试的错误");
            return Err(err);
        }

        let Some(delay) = delays.next() else {
            error!(
                operation = operation_name,
                retries,
                error = %err,
                "重试次数耗尽"
            );
            return Err(err);
        };

        retries += 1;
        warn!(
            operation = operation_name,
            retry = retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "依赖未就绪，退避后重试"
        );
        tokio::time::sleep(delay).await;
    }
}
