//! 车辆定位接入服务
//!
//! 从 AMQP 消费车辆/司机遥测事件，经有界队列分发到固定数量的 worker，
//! 按路由键调用对应 handler。车辆定位事件会依次匹配环线、路段、道路与停车场，
//! 补全参考字段后写入下游存储。

pub mod consumer;
pub mod dispatch;
pub mod enricher;
pub mod error;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod telemetry;
