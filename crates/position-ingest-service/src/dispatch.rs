//! 有界队列与 worker 池
//!
//! 单个读取任务从投递流取消息放入有界队列，队列满时读取任务阻塞，
//! 背压由此传回 broker。固定数量的 worker 从队列取消息，按路由键分发给 handler，
//! 并根据结果 ack 或 nack。

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_shared::amqp::InboundEvent;
use fleet_shared::config::DispatchConfig;
use fleet_shared::dlq::{DeadLetterMessage, DeadLetterSink};
use fleet_shared::error::Result as FleetResult;
use fleet_shared::observability::metrics;
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::registry::{EventHandler, HandlerContext, HandlerRegistry};
use crate::telemetry::duration_millis;

// ---------------------------------------------------------------------------
// 有界队列
// ---------------------------------------------------------------------------

/// 创建容量为 `capacity` 的 FIFO 队列
///
/// `capacity` 必须大于 0，配置加载时已校验。
pub fn dispatch_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueProducer { tx, capacity },
        QueueConsumer {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// 队列写端，只由读取任务持有
pub struct QueueProducer {
    tx: mpsc::Sender<InboundEvent>,
    capacity: usize,
}

impl QueueProducer {
    /// 放入一条投递，队列满时等待空位
    ///
    /// 所有 worker 都已退出时返回原投递。
    pub async fn push(&self, event: InboundEvent) -> Result<(), InboundEvent> {
        self.tx.send(event).await.map_err(|e| e.0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前排队数量
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

/// 队列读端，由所有 worker 共享
#[derive(Clone)]
pub struct QueueConsumer {
    rx: Arc<Mutex<mpsc::Receiver<InboundEvent>>>,
}

impl QueueConsumer {
    /// 取出队首投递，写端关闭且队列已空时返回 None
    pub async fn pop(&self) -> Option<InboundEvent> {
        let mut rx = self.rx.lock().await;
        let event = rx.recv().await;
        metrics::set_queue_depth(rx.len());
        event
    }
}

// ---------------------------------------------------------------------------
// 读取任务
// ---------------------------------------------------------------------------

/// 读取循环
///
/// 投递流结束或收到停机信号时返回，返回值为已入队的投递数。
/// 停机时尚未入队的投递不做确认，连接关闭后由 broker 重新投递。
pub async fn run_reader<S>(
    mut stream: S,
    producer: QueueProducer,
    mut shutdown: watch::Receiver<bool>,
) -> u64
where
    S: Stream<Item = FleetResult<InboundEvent>> + Send + Unpin,
{
    let mut enqueued = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => {
                info!("收到停机信号，读取任务退出");
                break;
            }
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!(error = %e, "读取投递失败");
                continue;
            }
            None => {
                warn!("投递流已结束");
                break;
            }
        };

        let routing_key = event.routing_key.clone();
        debug!(
            routing_key = %routing_key,
            delivery_count = event.delivery_count,
            "收到投递"
        );

        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => {
                info!(routing_key = %routing_key, "停机时队列已满，投递留给 broker 重新投递");
                break;
            }
            pushed = producer.push(event) => {
                if pushed.is_err() {
                    warn!("worker 已全部退出，读取任务停止");
                    break;
                }
                enqueued += 1;
                metrics::set_queue_depth(producer.depth());
            }
        }
    }

    enqueued
}

/// 停机信号置位或发送端已释放时返回
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// ---------------------------------------------------------------------------
// Worker 池
// ---------------------------------------------------------------------------

/// 单条投递的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// handler 成功，已 ack
    Acked,
    /// 没有注册 handler，已 ack 并丢弃
    Unroutable,
    /// handler 失败，已 nack 并重新入队
    Requeued,
    /// 超过重新投递上限，已转入死信并 ack
    DeadLettered,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Unroutable => "unroutable",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub handler_timeout: Duration,
    /// 为 None 时失败消息无限重新入队
    pub max_redeliveries: Option<u32>,
}

impl From<&DispatchConfig> for WorkerSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            workers: config.workers,
            handler_timeout: config.handler_timeout(),
            max_redeliveries: config.max_redeliveries,
        }
    }
}

/// 固定数量的 worker
pub struct WorkerPool {
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    source_service: String,
}

impl WorkerPool {
    pub fn new(registry: Arc<HandlerRegistry>, settings: WorkerSettings) -> Self {
        Self {
            registry,
            settings,
            dead_letter: None,
            source_service: String::new(),
        }
    }

    /// 启用死信出口，仅在配置了重新投递上限时生效
    pub fn with_dead_letter(
        mut self,
        sink: Arc<dyn DeadLetterSink>,
        source_service: impl Into<String>,
    ) -> Self {
        self.dead_letter = Some(sink);
        self.source_service = source_service.into();
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// 启动 worker，队列写端关闭且排空后各 worker 自行退出
    pub fn spawn(self: Arc<Self>, consumer: QueueConsumer) -> Vec<JoinHandle<()>> {
        (0..self.settings.workers)
            .map(|worker_id| {
                let pool = Arc::clone(&self);
                let consumer = consumer.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "worker 已启动");
                    while let Some(event) = consumer.pop().await {
                        pool.dispatch(event).await;
                    }
                    debug!(worker_id, "worker 已退出");
                })
            })
            .collect()
    }

    /// 处理一条投递并完成确认
    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        let Some(handler) = self.registry.get(&event.routing_key).cloned() else {
            warn!(
                routing_key = %event.routing_key,
                message_id = ?event.message_id,
                "未注册的路由键，确认并丢弃"
            );
            ack(&event).await;
            metrics::record_dispatch_outcome(&event.routing_key, DispatchOutcome::Unroutable.as_str());
            return DispatchOutcome::Unroutable;
        };

        let started = Instant::now();
        let result = self.invoke(handler, &event).await;
        metrics::record_handler_duration(&event.routing_key, started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(()) => {
                ack(&event).await;
                DispatchOutcome::Acked
            }
            Err(e) => self.on_failure(&event, e).await,
        };

        metrics::record_dispatch_outcome(&event.routing_key, outcome.as_str());
        outcome
    }

    /// 在独立任务中执行 handler，超时后中止该任务
    async fn invoke(
        &self,
        handler: Arc<dyn EventHandler>,
        event: &InboundEvent,
    ) -> Result<(), IngestError> {
        let timeout = self.settings.handler_timeout;
        let ctx = HandlerContext::new(event.routing_key.clone(), timeout, event.delivery_count);
        let payload = event.payload.clone();

        let mut task = tokio::spawn(async move { handler.handle(&ctx, &payload).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(IngestError::HandlerAborted(join_error.to_string())),
            Err(_) => {
                task.abort();
                // 等待任务真正结束，handler 持有的资源在确认前释放
                let _ = task.await;
                Err(IngestError::HandlerTimeout {
                    routing_key: event.routing_key.clone(),
                    timeout_ms: duration_millis(timeout),
                })
            }
        }
    }

    async fn on_failure(&self, event: &InboundEvent, err: IngestError) -> DispatchOutcome {
        let exhausted = self
            .settings
            .max_redeliveries
            .filter(|max| event.delivery_count >= *max);

        let Some(max_redeliveries) = exhausted else {
            warn!(
                routing_key = %event.routing_key,
                message_id = ?event.message_id,
                delivery_count = event.delivery_count,
                error = %err,
                "handler 处理失败，重新入队"
            );
            nack(event).await;
            return DispatchOutcome::Requeued;
        };

        let Some(sink) = &self.dead_letter else {
            warn!(
                routing_key = %event.routing_key,
                delivery_count = event.delivery_count,
                max_redeliveries,
                error = %err,
                "已超过重新投递上限但未配置死信出口，重新入队"
            );
            nack(event).await;
            return DispatchOutcome::Requeued;
        };

        let message =
            DeadLetterMessage::from_event(event, err.to_string(), max_redeliveries, &self.source_service);

        match sink.send(&message).await {
            Ok(()) => {
                warn!(
                    routing_key = %event.routing_key,
                    message_id = %message.message_id,
                    delivery_count = event.delivery_count,
                    error = %err,
                    "超过重新投递上限，已转入死信"
                );
                ack(event).await;
                DispatchOutcome::DeadLettered
            }
            Err(e) => {
                error!(
                    routing_key = %event.routing_key,
                    message_id = %message.message_id,
                    error = %e,
                    "死信发送失败，重新入队"
                );
                nack(event).await;
                DispatchOutcome::Requeued
            }
        }
    }
}

/// ack 失败只记录日志，broker 会在连接恢复后重新投递
async fn ack(event: &InboundEvent) {
    if let Err(e) = event.ack().await {
        error!(routing_key = %event.routing_key, error = %e, "ack 失败");
    }
}

async fn nack(event: &InboundEvent) {
    if let Err(e) = event.nack(true).await {
        error!(routing_key = %event.routing_key, error = %e, "nack 失败");
    }
}
