//! 地理空间匹配
//!
//! 给定坐标点，返回几何包含该点的参考实体候选，按几何面积升序排列，
//! 即最小（最具体）的包含几何排在最前。未命中返回空列表而非错误。

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::error::IngestError;
use crate::model::{ParkingLotRef, Point, RingRef, RoadRef, SegmentRef};

/// 地理匹配接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn rings_at(&self, point: Point) -> Result<Vec<RingRef>, IngestError>;
    async fn segments_at(&self, point: Point) -> Result<Vec<SegmentRef>, IngestError>;
    async fn roads_at(&self, point: Point) -> Result<Vec<RoadRef>, IngestError>;
    async fn parking_lots_at(&self, point: Point) -> Result<Vec<ParkingLotRef>, IngestError>;
}

const RINGS_SQL: &str = r#"
    SELECT id
    FROM traffic_rings
    WHERE deleted_at IS NULL
      AND ST_Contains(geom, ST_SetSRID(ST_MakePoint($1, $2), $3))
    ORDER BY ST_Area(geom) ASC, id ASC
"#;

// 路段几何为中心线的缓冲区
const SEGMENTS_SQL: &str = r#"
    SELECT id, is_junction
    FROM road_segments
    WHERE deleted_at IS NULL
      AND ST_Contains(geom, ST_SetSRID(ST_MakePoint($1, $2), $3))
    ORDER BY ST_Area(geom) ASC, id ASC
"#;

const ROADS_SQL: &str = r#"
    SELECT id, code
    FROM roads
    WHERE deleted_at IS NULL
      AND ST_Contains(geom, ST_SetSRID(ST_MakePoint($1, $2), $3))
    ORDER BY ST_Area(geom) ASC, id ASC
"#;

const PARKING_LOTS_SQL: &str = r#"
    SELECT id
    FROM parking_lots
    WHERE deleted_at IS NULL
      AND ST_Contains(geom, ST_SetSRID(ST_MakePoint($1, $2), $3))
    ORDER BY ST_Area(geom) ASC, id ASC
"#;

/// 基于 PostGIS 的实现
///
/// 参考实体由管理后台维护，这里只读。
pub struct PostgisResolver {
    pool: PgPool,
    srid: i32,
}

impl PostgisResolver {
    pub fn new(pool: PgPool, srid: i32) -> Self {
        Self { pool, srid }
    }

    async fn lookup<T>(
        &self,
        entity: &'static str,
        sql: &'static str,
        point: Point,
    ) -> Result<Vec<T>, IngestError>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let rows = sqlx::query_as::<_, T>(sql)
            .bind(point.x)
            .bind(point.y)
            .bind(self.srid)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IngestError::Resolver {
                entity,
                message: e.to_string(),
            })?;

        debug!(entity, x = point.x, y = point.y, matched = rows.len(), "地理匹配完成");
        Ok(rows)
    }
}

#[async_trait]
impl GeoResolver for PostgisResolver {
    async fn rings_at(&self, point: Point) -> Result<Vec<RingRef>, IngestError> {
        self.lookup("ring", RINGS_SQL, point).await
    }

    async fn segments_at(&self, point: Point) -> Result<Vec<SegmentRef>, IngestError> {
        self.lookup("segment", SEGMENTS_SQL, point).await
    }

    async fn roads_at(&self, point: Point) -> Result<Vec<RoadRef>, IngestError> {
        self.lookup("road", ROADS_SQL, point).await
    }

    async fn parking_lots_at(&self, point: Point) -> Result<Vec<ParkingLotRef>, IngestError> {
        self.lookup("parking_lot", PARKING_LOTS_SQL, point).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::config::DatabaseConfig;
    use fleet_shared::database::Database;

    #[test]
    fn test_queries_order_by_specificity() {
        for sql in [RINGS_SQL, SEGMENTS_SQL, ROADS_SQL, PARKING_LOTS_SQL] {
            assert!(sql.contains("ST_Contains"));
            assert!(sql.contains("ORDER BY ST_Area(geom) ASC"));
        }
    }

    #[tokio::test]
    #[ignore] // 需要带 PostGIS 与参考数据的数据库
    async fn test_point_outside_all_rings() {
        let url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| DatabaseConfig::default().url);
        let config = DatabaseConfig {
            url,
            ..Default::default()
        };
        let db = Database::connect(&config).await.unwrap();
        let resolver = PostgisResolver::new(db.pool().clone(), 4326);

        // 南大西洋中的点，不在任何环线内
        let rings = resolver.rings_at(Point::new(-20.0, -40.0)).await.unwrap();
        assert!(rings.is_empty());
    }
}
