//! 下游存储
//!
//! 接收补全后的定位记录并持久化。写入失败会让整条消息重新投递。

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::error::IngestError;
use crate::model::VehiclePositionRecord;

/// 下游写入接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn forward(&self, record: &VehiclePositionRecord) -> Result<(), IngestError>;
}

/// 写入 PostgreSQL 的 vehicle_positions 表
///
/// (device_id, captured_at) 唯一，重复投递的记录会覆盖参考字段而不是插入重复行。
pub struct PgPositionStore {
    pool: PgPool,
    srid: i32,
}

impl PgPositionStore {
    pub fn new(pool: PgPool, srid: i32) -> Self {
        Self { pool, srid }
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn forward(&self, record: &VehiclePositionRecord) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO vehicle_positions (
                device_id, plate_no, geom, captured_at, speed, heading,
                ring_id, segment_id, is_junction, road_id, road_code, parking_lot_id
            )
            VALUES ($1, $2, ST_SetSRID(ST_MakePoint($3, $4), $5), $6, $7, $8,
                    $9, $10, $11, $12, $13, $14)
            ON CONFLICT (device_id, captured_at) DO UPDATE SET
                ring_id = EXCLUDED.ring_id,
                segment_id = EXCLUDED.segment_id,
                is_junction = EXCLUDED.is_junction,
                road_id = EXCLUDED.road_id,
                road_code = EXCLUDED.road_code,
                parking_lot_id = EXCLUDED.parking_lot_id
            "#,
        )
        .bind(&record.device_id)
        .bind(&record.plate_no)
        .bind(record.point.x)
        .bind(record.point.y)
        .bind(self.srid)
        .bind(record.captured_at)
        .bind(record.speed)
        .bind(record.heading)
        .bind(record.ring_id)
        .bind(record.segment_id)
        .bind(record.is_junction)
        .bind(record.road_id)
        .bind(&record.road_code)
        .bind(record.parking_lot_id)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Forward(e.to_string()))?;

        debug!(device_id = %record.device_id, captured_at = %record.captured_at, "定位记录已写入");
        Ok(())
    }
}
