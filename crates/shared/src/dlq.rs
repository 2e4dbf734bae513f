//! 死信处理
//!
//! 配置了重新投递上限时，超过上限仍然失败的消息不再回到原队列，
//! 而是包装成死信信封发布到死信路由键，供人工排查或离线重放。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::amqp::{AmqpClient, AmqpPublisher, InboundEvent, declare_dead_letter_queue};
use crate::config::AmqpConfig;
use crate::error::Result;

/// 死信消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 ID，缺失时生成一个
    pub message_id: String,
    /// 原始路由键
    pub routing_key: String,
    /// 原始负载（按 UTF-8 解释）
    pub payload: String,
    /// 最后一次失败原因
    pub error: String,
    pub delivery_count: u32,
    pub max_redeliveries: u32,
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_event(
        event: &InboundEvent,
        error: impl Into<String>,
        max_redeliveries: u32,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: event
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            routing_key: event.routing_key.clone(),
            payload: event.payload_lossy(),
            error: error.into(),
            delivery_count: event.delivery_count,
            max_redeliveries,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

/// 死信出口
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, message: &DeadLetterMessage) -> Result<()>;
}

/// 发布到 AMQP 死信路由键
pub struct AmqpDeadLetterSink {
    publisher: AmqpPublisher,
    routing_key: String,
}

impl AmqpDeadLetterSink {
    pub fn new(publisher: AmqpPublisher, routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            routing_key: routing_key.into(),
        }
    }

    /// 声明死信队列，并在独立的确认模式通道上创建发布者
    pub async fn declare(client: &AmqpClient, config: &AmqpConfig) -> Result<Self> {
        let channel = client.create_channel().await?;
        declare_dead_letter_queue(&channel, config).await?;
        let publisher = AmqpPublisher::confirmed(channel, config.exchange.clone()).await?;
        Ok(Self::new(publisher, config.dead_letter_routing_key.clone()))
    }
}

#[async_trait]
impl DeadLetterSink for AmqpDeadLetterSink {
    async fn send(&self, message: &DeadLetterMessage) -> Result<()> {
        self.publisher
            .publish_json(&self.routing_key, message)
            .await?;

        warn!(
            message_id = %message.message_id,
            routing_key = %message.routing_key,
            delivery_count = message.delivery_count,
            error = %message.error,
            "消息已发送到死信队列"
        );
        Ok(())
    }
}
