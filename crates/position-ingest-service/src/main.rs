//! 车辆定位接入服务
//!
//! 消费 AMQP 遥测事件，补全地理参考字段后写入 vehicle_positions。

use std::sync::Arc;

use anyhow::Result;
use fleet_shared::amqp::{AmqpClient, routing_keys};
use fleet_shared::config::AppConfig;
use fleet_shared::database::Database;
use fleet_shared::dlq::AmqpDeadLetterSink;
use fleet_shared::error::FleetError;
use fleet_shared::observability;
use fleet_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use position_ingest::consumer::IngestConsumer;
use position_ingest::enricher::PositionEnricher;
use position_ingest::registry::HandlerRegistry;
use position_ingest::resolver::PostgisResolver;
use position_ingest::store::PgPositionStore;
use position_ingest::telemetry::PrometheusLatencyRecorder;

const SERVICE_NAME: &str = "position-ingest-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        let mut config = AppConfig::default();
        config.service_name = SERVICE_NAME.to_string();
        config.observability.service_name = SERVICE_NAME.to_string();
        config
    });

    // 2. 日志与指标
    let _guard = observability::init(&config.observability).await?;
    info!(environment = %config.environment, "Starting position-ingest-service...");

    // 3. 依赖服务可能晚于本服务就绪，启动阶段按退避重试
    let policy = RetryPolicy::default();

    let db = retry_with_policy(&policy, "connect_database", FleetError::is_retryable, || {
        Database::connect(&config.database)
    })
    .await?;
    db.health_check().await?;
    db.verify_postgis().await?;
    info!("Database connection established");

    let amqp = retry_with_policy(&policy, "connect_amqp", FleetError::is_retryable, || {
        AmqpClient::connect(&config.amqp)
    })
    .await?;

    // 4. 组装 handler
    let resolver = Arc::new(PostgisResolver::new(db.pool().clone(), config.geo.srid));
    let store = Arc::new(PgPositionStore::new(db.pool().clone(), config.geo.srid));
    let enricher = PositionEnricher::new(resolver, store, Arc::new(PrometheusLatencyRecorder));

    let registry = HandlerRegistry::builder()
        .register(routing_keys::VEHICLE_POSITION, enricher)
        .build()?;
    info!(routing_keys = ?registry.routing_keys(), "Handler registry frozen");

    let mut consumer = IngestConsumer::new(registry, &config.dispatch);
    if config.dispatch.max_redeliveries.is_some() {
        let sink = AmqpDeadLetterSink::declare(&amqp, &config.amqp).await?;
        consumer = consumer.with_dead_letter(Arc::new(sink), config.service_name.clone());
        info!(
            routing_key = %config.amqp.dead_letter_routing_key,
            queue = %config.amqp.dead_letter_queue,
            "Dead letter sink enabled"
        );
    }

    // 5. 订阅并运行到停机
    let stream = IngestConsumer::subscribe(amqp.channel(), &config.amqp).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        if shutdown_tx.send(true).is_err() {
            warn!("消费者已停止，忽略停机信号");
        }
    });

    consumer.run(stream, shutdown_rx).await;

    // 6. 释放连接，未确认的投递由 broker 重新投递
    amqp.close().await;
    db.close().await;

    info!("Service shutdown complete");
    Ok(())
}

/// 监听 Ctrl+C 和 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
