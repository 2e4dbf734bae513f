//! 共享库
//!
//! 车辆定位接入链路各服务共用的配置、错误处理、数据库连接、AMQP、
//! 死信队列、重试与可观测性等基础设施代码。

pub mod amqp;
pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod observability;
pub mod retry;
