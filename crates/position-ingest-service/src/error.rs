//! 接入服务专用错误类型
//!
//! 在共享库 FleetError 基础上定义本服务特有的错误变体。
//! handler 返回的任何错误都会导致投递被 nack 并重新入队。

use fleet_shared::error::FleetError;

/// 接入处理错误
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// 负载不是合法的定位记录，重新投递也不会成功
    #[error("负载解码失败: {0}")]
    Decode(String),

    #[error("地理查询失败: {entity} - {message}")]
    Resolver {
        entity: &'static str,
        message: String,
    },

    /// 下游写入失败，是唯一会让定位补全判定为失败的环节
    #[error("下游写入失败: {0}")]
    Forward(String),

    #[error("handler 执行超时: {routing_key} 超过 {timeout_ms}ms")]
    HandlerTimeout { routing_key: String, timeout_ms: u64 },

    #[error("handler 异常退出: {0}")]
    HandlerAborted(String),

    #[error("路由键重复注册: {0}")]
    DuplicateHandler(String),

    /// 透传共享库错误
    #[error(transparent)]
    Shared(#[from] FleetError),
}
