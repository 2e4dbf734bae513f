//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

pub const ENRICH_DURATION_US: &str = "position_enrich_duration_us";
pub const DISPATCH_OUTCOMES_TOTAL: &str = "dispatch_outcomes_total";
pub const DISPATCH_HANDLER_DURATION_SECONDS: &str = "dispatch_handler_duration_seconds";
pub const DISPATCH_QUEUE_DEPTH: &str = "dispatch_queue_depth";
pub const RESOLVER_LOOKUP_FAILURES_TOTAL: &str = "resolver_lookup_failures_total";

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标描述，会出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_histogram!(
        ENRICH_DURATION_US,
        metrics::Unit::Microseconds,
        "Vehicle position enrichment latency in microseconds"
    );
    metrics::describe_counter!(
        DISPATCH_OUTCOMES_TOTAL,
        "Deliveries finished by the worker pool, by routing key and outcome"
    );
    metrics::describe_histogram!(
        DISPATCH_HANDLER_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Handler execution time in seconds"
    );
    metrics::describe_gauge!(
        DISPATCH_QUEUE_DEPTH,
        "Deliveries waiting in the in-process dispatch queue"
    );
    metrics::describe_counter!(
        RESOLVER_LOOKUP_FAILURES_TOTAL,
        "Geospatial lookups that failed with an infrastructure error"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一条投递的最终去向
#[inline]
pub fn record_dispatch_outcome(routing_key: &str, outcome: &str) {
    metrics::counter!(
        DISPATCH_OUTCOMES_TOTAL,
        "routing_key" => routing_key.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录 handler 执行耗时
#[inline]
pub fn record_handler_duration(routing_key: &str, duration_secs: f64) {
    metrics::histogram!(
        DISPATCH_HANDLER_DURATION_SECONDS,
        "routing_key" => routing_key.to_string()
    )
    .record(duration_secs);
}

/// 更新进程内队列深度
#[inline]
pub fn set_queue_depth(depth: usize) {
    metrics::gauge!(DISPATCH_QUEUE_DEPTH).set(depth as f64);
}

/// 记录一次地理查询的基础设施失败
#[inline]
pub fn record_resolver_failure(entity: &str) {
    metrics::counter!(
        RESOLVER_LOOKUP_FAILURES_TOTAL,
        "entity" => entity.to_string()
    )
    .increment(1);
}

/// 记录一个以微秒为单位的耗时直方图样本
#[inline]
pub fn record_duration_us(metric: &'static str, operation: &str, micros: u64) {
    metrics::histogram!(metric, "operation" => operation.to_string()).record(micros as f64);
}
