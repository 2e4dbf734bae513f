//! 路由键到 handler 的注册表
//!
//! 启动阶段通过 `HandlerRegistryBuilder` 注册，`build` 之后冻结为只读的
//! `HandlerRegistry`，由所有 worker 通过 `Arc` 共享。冻结后类型上不再提供写入入口，
//! 因此并发读取无需加锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::IngestError;

/// 单次 handler 调用的上下文
#[derive(Debug, Clone)]
pub struct HandlerContext {
    routing_key: String,
    timeout: Duration,
    deadline: Instant,
    delivery_count: u32,
}

impl HandlerContext {
    pub fn new(routing_key: impl Into<String>, timeout: Duration, delivery_count: u32) -> Self {
        Self {
            routing_key: routing_key.into(),
            timeout,
            deadline: Instant::now() + timeout,
            delivery_count,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// 本次调用的时限
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// worker 会在此时刻中止 handler，handler 可据此提前收尾
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// 距截止时间的剩余时长，已过期时为零
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}

/// 事件处理器
///
/// 只有在希望 broker 重新投递时才返回错误。
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), IngestError>;
}

/// 注册表构建器
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    duplicates: Vec<String>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(self, routing_key: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.register_arc(routing_key, Arc::new(handler))
    }

    pub fn register_arc(
        mut self,
        routing_key: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let routing_key = routing_key.into();
        if self.handlers.contains_key(&routing_key) {
            self.duplicates.push(routing_key);
        } else {
            self.handlers.insert(routing_key, handler);
        }
        self
    }

    /// 冻结注册表，同一路由键注册两次视为配置错误
    pub fn build(self) -> Result<HandlerRegistry, IngestError> {
        if let Some(routing_key) = self.duplicates.into_iter().next() {
            return Err(IngestError::DuplicateHandler(routing_key));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}

/// 冻结后的只读注册表
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    pub fn get(&self, routing_key: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(routing_key)
    }

    pub fn contains(&self, routing_key: &str) -> bool {
        self.handlers.contains_key(routing_key)
    }

    /// 已注册的路由键，按字典序返回，便于日志输出
    pub fn routing_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
