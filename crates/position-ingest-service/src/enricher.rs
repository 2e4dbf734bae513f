//! 定位记录补全
//!
//! 对每条车辆定位记录独立执行四项地理匹配（环线、路段、道路、停车场），
//! 未命中或查询失败都只会让对应字段保持未匹配，不中断补全；
//! 只有最后的下游写入失败才会让整条消息判定为失败并重新投递。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use fleet_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::model::{Point, PositionReport, VehiclePositionRecord};
use crate::registry::{EventHandler, HandlerContext};
use crate::resolver::GeoResolver;
use crate::store::PositionStore;
use crate::telemetry::{LatencyRecorder, duration_micros, duration_millis};

/// 耗时直方图上的操作标签
pub const ENRICH_OPERATION: &str = "enrich_vehicle_position";

/// 车辆定位补全器，注册在 `vehicle.position` 路由键下
pub struct PositionEnricher {
    resolver: Arc<dyn GeoResolver>,
    store: Arc<dyn PositionStore>,
    recorder: Arc<dyn LatencyRecorder>,
}

impl PositionEnricher {
    pub fn new(
        resolver: Arc<dyn GeoResolver>,
        store: Arc<dyn PositionStore>,
        recorder: Arc<dyn LatencyRecorder>,
    ) -> Self {
        Self {
            resolver,
            store,
            recorder,
        }
    }

    /// 解码、补全并写入下游
    ///
    /// 无论成功与否，整个过程的耗时都会记录且只记录一次。
    /// 调用方超时丢弃该 future 时同样会记录。
    pub async fn process(&self, payload: &[u8]) -> Result<VehiclePositionRecord, IngestError> {
        let _latency = LatencyGuard::start(self.recorder.as_ref());
        self.decode_and_enrich(payload).await
    }

    async fn decode_and_enrich(&self, payload: &[u8]) -> Result<VehiclePositionRecord, IngestError> {
        let report = PositionReport::decode(payload)?;
        let record = self.enrich(VehiclePositionRecord::from(report)).await;

        self.store.forward(&record).await?;

        info!(
            device_id = %record.device_id,
            ring_id = ?record.ring_id,
            segment_id = ?record.segment_id,
            is_junction = record.is_junction,
            road_id = ?record.road_id,
            parking_lot_id = ?record.parking_lot_id,
            "定位记录补全完成"
        );
        Ok(record)
    }

    /// 填充参考字段，四项匹配并发执行、互不影响
    pub async fn enrich(&self, mut record: VehiclePositionRecord) -> VehiclePositionRecord {
        let point = record.point;

        let (ring, segment, road, parking_lot) = tokio::join!(
            self.resolve_ring(point),
            self.resolve_segment(point),
            self.resolve_road(point),
            self.resolve_parking_lot(point),
        );

        record.ring_id = ring;

        match segment {
            Some((segment_id, is_junction)) => {
                record.segment_id = Some(segment_id);
                record.is_junction = is_junction;
            }
            None => {
                record.segment_id = None;
                record.is_junction = false;
            }
        }

        match road {
            Some((road_id, road_code)) => {
                record.road_id = Some(road_id);
                record.road_code = road_code;
            }
            None => {
                record.road_id = None;
                record.road_code = None;
            }
        }

        record.parking_lot_id = parking_lot;
        record
    }

    async fn resolve_ring(&self, point: Point) -> Option<i64> {
        let candidates = tolerate("ring", self.resolver.rings_at(point).await)?;
        candidates.first().map(|ring| ring.id)
    }

    async fn resolve_segment(&self, point: Point) -> Option<(i64, bool)> {
        let candidates = tolerate("segment", self.resolver.segments_at(point).await)?;
        candidates
            .first()
            .map(|segment| (segment.id, segment.is_junction))
    }

    async fn resolve_road(&self, point: Point) -> Option<(i64, Option<String>)> {
        let candidates = tolerate("road", self.resolver.roads_at(point).await)?;
        candidates
            .into_iter()
            .next()
            .map(|road| (road.id, road.code))
    }

    async fn resolve_parking_lot(&self, point: Point) -> Option<i64> {
        let candidates = tolerate("parking_lot", self.resolver.parking_lots_at(point).await)?;
        candidates.first().map(|lot| lot.id)
    }
}

/// 析构时记录一次补全耗时
struct LatencyGuard<'a> {
    recorder: &'a dyn LatencyRecorder,
    start: Instant,
}

impl<'a> LatencyGuard<'a> {
    fn start(recorder: &'a dyn LatencyRecorder) -> Self {
        Self {
            recorder,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyGuard<'_> {
    fn drop(&mut self) {
        self.recorder.record(
            metrics::ENRICH_DURATION_US,
            ENRICH_OPERATION,
            duration_micros(self.start.elapsed()),
        );
    }
}

/// 查询失败降级为未匹配
fn tolerate<T>(entity: &str, result: Result<Vec<T>, IngestError>) -> Option<Vec<T>> {
    match result {
        Ok(candidates) => {
            if candidates.is_empty() {
                debug!(entity, "未匹配到参考实体");
            }
            Some(candidates)
        }
        Err(e) => {
            warn!(entity, error = %e, "地理查询失败，字段保持未匹配");
            metrics::record_resolver_failure(entity);
            None
        }
    }
}

#[async_trait]
impl EventHandler for PositionEnricher {
    async fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), IngestError> {
        debug!(
            routing_key = ctx.routing_key(),
            delivery_count = ctx.delivery_count(),
            remaining_ms = duration_millis(ctx.remaining()),
            "开始补全定位记录"
        );
        match tokio::time::timeout_at(ctx.deadline(), self.process(payload)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(IngestError::HandlerTimeout {
                routing_key: ctx.routing_key().to_string(),
                timeout_ms: duration_millis(ctx.timeout()),
            }),
        }
    }
}
