//! AMQP 基础设施封装
//!
//! 将 lapin 的底层 API 封装为业务友好的连接、消费者与发布者抽象，
//! 统一队列声明参数、投递确认与错误映射，避免各服务重复编写样板代码。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AmqpConfig;
use crate::error::{FleetError, Result};

// ---------------------------------------------------------------------------
// 路由键常量
// ---------------------------------------------------------------------------

/// 集中管理路由键，防止字符串散落在各服务中导致拼写不一致
pub mod routing_keys {
    pub const VEHICLE_POSITION: &str = "vehicle.position";
    pub const VEHICLE_STATUS: &str = "vehicle.status";
    pub const DRIVER_STATUS: &str = "driver.status";
}

/// quorum 队列在每次重新投递时递增的头
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

// ---------------------------------------------------------------------------
// Acknowledger / InboundEvent
// ---------------------------------------------------------------------------

/// 投递确认能力
///
/// 从 broker 投递中剥离出来，使分发层不依赖具体客户端，测试中可替换为内存实现。
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// 单条确认，不做 multiple 批量确认
    async fn ack(&self) -> Result<()>;

    /// 否定确认，`requeue` 为 true 时 broker 会重新投递
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// lapin 投递句柄适配
struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(FleetError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(FleetError::from)
    }
}

/// 从 broker 收到的一条投递
///
/// 拥有所有字段，可安全地跨 await 点与任务边界传递；
/// 每条投递只会被一个 worker 消费，并以 ack 或 nack 结束。
pub struct InboundEvent {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// broker 记录的重新投递次数，缺失时为 0
    pub delivery_count: u32,
    acker: Arc<dyn Acknowledger>,
}

impl InboundEvent {
    pub fn new(
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
            message_id: None,
            redelivered: false,
            delivery_count: 0,
            acker,
        }
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.redelivered = delivery_count > 0;
        self.delivery_count = delivery_count;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    fn from_delivery(delivery: Delivery) -> Self {
        let delivery_count = delivery_count(delivery.properties.headers().as_ref());
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());

        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            payload: delivery.data,
            message_id,
            redelivered: delivery.redelivered,
            delivery_count,
            acker: Arc::new(LapinAcker(delivery.acker)),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    /// 将负载视为 UTF-8 字符串返回，非法字节以替换字符代替
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEvent")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// 读取 `x-delivery-count`，classic 队列不提供该头，返回 0
pub fn delivery_count(headers: Option<&FieldTable>) -> u32 {
    headers
        .and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
                .map(|(_, value)| value)
        })
        .and_then(|value| match value {
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            _ => None,
        })
        .unwrap_or(0)
}

/// 队列声明参数
///
/// 队列满时由 broker 拒绝新发布（reject-publish），把背压推回生产者，而不是静默丢弃最旧的消息。
pub fn queue_arguments(config: &AmqpConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-max-length".into(),
        AMQPValue::LongLongInt(config.max_length),
    );
    args.insert(
        "x-overflow".into(),
        AMQPValue::LongString(config.overflow.as_str().into()),
    );
    if let Some(queue_type) = &config.queue_type {
        args.insert(
            "x-queue-type".into(),
            AMQPValue::LongString(queue_type.as_str().into()),
        );
    }
    args
}

// ---------------------------------------------------------------------------
// AmqpClient
// ---------------------------------------------------------------------------

/// 持有连接与一个通道
pub struct AmqpClient {
    connection: Connection,
    channel: Channel,
}

impl AmqpClient {
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| FleetError::AmqpConnection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| FleetError::AmqpConnection(format!("创建通道失败: {e}")))?;

        info!(exchange = %config.exchange, "AMQP 连接已建立");
        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// 在同一连接上再开一个通道，发布确认模式只作用于该通道
    pub async fn create_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| FleetError::AmqpConnection(format!("创建通道失败: {e}")))
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            warn!(error = %e, "关闭 AMQP 连接失败");
        }
    }
}

// ---------------------------------------------------------------------------
// AmqpConsumer
// ---------------------------------------------------------------------------

async fn declare_exchange(channel: &Channel, config: &AmqpConfig) -> Result<()> {
    channel
        .exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// 声明死信队列并绑定到死信路由键
///
/// 没有队列绑定时 broker 会直接丢弃发往死信路由键的消息。
pub async fn declare_dead_letter_queue(channel: &Channel, config: &AmqpConfig) -> Result<()> {
    declare_exchange(channel, config).await?;

    channel
        .queue_declare(
            &config.dead_letter_queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &config.dead_letter_queue,
            &config.exchange,
            &config.dead_letter_routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(
        queue = %config.dead_letter_queue,
        routing_key = %config.dead_letter_routing_key,
        "死信队列已声明"
    );
    Ok(())
}

/// 投递流
pub type DeliveryStream = BoxStream<'static, Result<InboundEvent>>;

/// 面向业务的 AMQP 消费者
pub struct AmqpConsumer {
    consumer: lapin::Consumer,
}

impl AmqpConsumer {
    /// 声明拓扑并开启手动确认的消费
    ///
    /// 1. 声明 durable 的 topic 交换机
    /// 2. 声明 durable、非独占、不自动删除的队列，带长度上限与溢出策略
    /// 3. 按配置的路由模式逐个绑定
    /// 4. 可选设置 prefetch
    /// 5. basic_consume，no_ack=false
    pub async fn setup(channel: &Channel, config: &AmqpConfig) -> Result<Self> {
        declare_exchange(channel, config).await?;

        let queue = channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                queue_arguments(config),
            )
            .await?;

        for binding_key in &config.binding_keys {
            channel
                .queue_bind(
                    &config.queue,
                    &config.exchange,
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!(queue = %config.queue, binding_key, "队列已绑定");
        }

        if config.prefetch_count > 0 {
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await?;
        }

        let consumer = channel
            .basic_consume(
                &config.queue,
                &config.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %config.queue,
            exchange = %config.exchange,
            backlog = queue.message_count(),
            max_length = config.max_length,
            overflow = %config.overflow,
            "AMQP 消费者已启动"
        );

        Ok(Self { consumer })
    }

    /// 转换为拥有所有权的投递流
    pub fn into_stream(self) -> DeliveryStream {
        self.consumer
            .map(|result| {
                result
                    .map(InboundEvent::from_delivery)
                    .map_err(FleetError::from)
            })
            .boxed()
    }
}

// ---------------------------------------------------------------------------
// AmqpPublisher
// ---------------------------------------------------------------------------

/// 面向业务的 AMQP 发布者
///
/// 通道处于发布确认模式，消息以 mandatory 发布：
/// 只有 broker 确认且消息被路由到至少一个队列时 `publish` 才返回成功。
/// `Channel` 内部是引用计数的，Clone 代价很低。
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpPublisher {
    /// 将通道切换到发布确认模式
    pub async fn confirmed(channel: Channel, exchange: impl Into<String>) -> Result<Self> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channel,
            exchange: exchange.into(),
        })
    }

    /// 发送原始字节消息并等待 broker 确认
    pub async fn publish(&self, routing_key: &str, payload: &[u8], headers: FieldTable) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                properties,
            )
            .await?
            .await?;

        check_confirmation(confirmation, &self.exchange, routing_key)?;
        debug!(exchange = %self.exchange, routing_key, "消息已发布");
        Ok(())
    }

    /// 将值序列化为 JSON 后发送
    pub async fn publish_json<T: Serialize>(&self, routing_key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(routing_key, &payload, FieldTable::default())
            .await
    }
}

/// 只有不带退回消息的 Ack 才算发布成功
fn check_confirmation(confirmation: Confirmation, exchange: &str, routing_key: &str) -> Result<()> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(returned)) => Err(FleetError::Amqp(format!(
            "消息无法路由: {exchange}/{routing_key} ({} {})",
            returned.reply_code,
            returned.reply_text.as_str()
        ))),
        Confirmation::Nack(_) => Err(FleetError::Amqp(format!(
            "broker 拒绝了消息: {exchange}/{routing_key}"
        ))),
        Confirmation::NotRequested => Err(FleetError::Amqp(format!(
            "通道未开启发布确认: {exchange}/{routing_key}"
        ))),
    }
}
