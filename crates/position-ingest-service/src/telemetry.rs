//! 耗时上报
//!
//! 补全器只依赖 `LatencyRecorder`，生产环境写入 Prometheus 直方图，测试中替换为计数实现。

use std::time::Duration;

use fleet_shared::observability::metrics;

/// 超出 u64 范围时取最大值
pub fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// 微秒级耗时记录器
pub trait LatencyRecorder: Send + Sync {
    fn record(&self, metric: &'static str, operation: &str, micros: u64);
}

/// 写入全局 metrics recorder
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusLatencyRecorder;

impl LatencyRecorder for PrometheusLatencyRecorder {
    fn record(&self, metric: &'static str, operation: &str, micros: u64) {
        metrics::record_duration_us(metric, operation, micros);
    }
}
