//! PostGIS 连接池
//!
//! 地理匹配查询与定位写入共用同一个连接池。启动时除连通性外还检查 PostGIS 扩展，
//! 缺少扩展时所有 `ST_*` 函数都会在处理消息时失败，不如在启动阶段直接退出。

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{FleetError, Result};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "PostgreSQL 连接池已创建"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 确认 PostGIS 扩展可用，返回其版本
    pub async fn verify_postgis(&self) -> Result<String> {
        let version: Option<String> = sqlx::query_scalar(
            "SELECT extversion FROM pg_extension WHERE extname = 'postgis'",
        )
        .fetch_optional(&self.pool)
        .await?;

        let version = version.ok_or_else(|| {
            FleetError::Internal("数据库未安装 postgis 扩展".to_string())
        })?;
        info!(postgis = %version, "PostGIS 扩展已就绪");
        Ok(version)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL 连接池已关闭");
    }
}
