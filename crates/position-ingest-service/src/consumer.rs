//! 消费管道
//!
//! 组合投递流、有界队列与 worker 池：读取任务负责入队，worker 负责分发与确认。
//! 停机时读取任务先退出并释放队列写端，worker 处理完已入队的投递后退出。

use std::sync::Arc;

use fleet_shared::amqp::{AmqpConsumer, DeliveryStream, InboundEvent};
use fleet_shared::config::{AmqpConfig, DispatchConfig};
use fleet_shared::dlq::DeadLetterSink;
use fleet_shared::error::Result as FleetResult;
use futures::Stream;
use lapin::Channel;
use tokio::sync::watch;
use tracing::{error, info};

use crate::dispatch::{WorkerPool, WorkerSettings, dispatch_queue, run_reader};
use crate::error::IngestError;
use crate::registry::HandlerRegistry;

/// 定位接入消费者
pub struct IngestConsumer {
    pool: WorkerPool,
    queue_capacity: usize,
}

impl IngestConsumer {
    pub fn new(registry: HandlerRegistry, config: &DispatchConfig) -> Self {
        Self {
            pool: WorkerPool::new(Arc::new(registry), WorkerSettings::from(config)),
            queue_capacity: config.queue_capacity,
        }
    }

    pub fn with_dead_letter(
        mut self,
        sink: Arc<dyn DeadLetterSink>,
        source_service: impl Into<String>,
    ) -> Self {
        self.pool = self.pool.with_dead_letter(sink, source_service);
        self
    }

    /// 声明队列拓扑并返回投递流
    pub async fn subscribe(
        channel: &Channel,
        config: &AmqpConfig,
    ) -> Result<DeliveryStream, IngestError> {
        let consumer = AmqpConsumer::setup(channel, config).await?;
        Ok(consumer.into_stream())
    }

    /// 运行到投递流结束或收到停机信号
    pub async fn run<S>(self, stream: S, shutdown: watch::Receiver<bool>)
    where
        S: Stream<Item = FleetResult<InboundEvent>> + Send + Unpin,
    {
        let settings = self.pool.settings().clone();
        let (producer, consumer) = dispatch_queue(self.queue_capacity);

        info!(
            queue_capacity = self.queue_capacity,
            workers = settings.workers,
            handler_timeout_secs = settings.handler_timeout.as_secs(),
            max_redeliveries = ?settings.max_redeliveries,
            "定位接入消费者已启动"
        );

        let workers = Arc::new(self.pool).spawn(consumer);

        // producer 在此处被消耗，返回即关闭写端
        let enqueued = run_reader(stream, producer, shutdown).await;
        info!(enqueued, "读取任务已停止，等待 worker 处理剩余投递");

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "worker 异常退出");
            }
        }

        info!("定位接入消费者已停止");
    }
}
