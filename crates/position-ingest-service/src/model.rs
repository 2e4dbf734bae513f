//! 定位记录与参考实体模型
//!
//! 上报负载先解码为 `PositionReport`，再转换为参考字段全部未匹配的
//! `VehiclePositionRecord`，由补全器逐项填充。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// 坐标点
///
/// 经纬度或投影坐标，空间参考系由配置中的 SRID 决定。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(alias = "lng", alias = "lon", alias = "longitude")]
    pub x: f64,
    #[serde(alias = "lat", alias = "latitude")]
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// 终端上报的定位负载
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    pub device_id: String,
    #[serde(default)]
    pub plate_no: Option<String>,
    pub point: Point,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

impl PositionReport {
    pub fn decode(payload: &[u8]) -> Result<Self, IngestError> {
        let report: Self =
            serde_json::from_slice(payload).map_err(|e| IngestError::Decode(e.to_string()))?;

        if report.device_id.trim().is_empty() {
            return Err(IngestError::Decode("deviceId 为空".to_string()));
        }
        if !report.point.is_finite() {
            return Err(IngestError::Decode("坐标不是有限数值".to_string()));
        }
        Ok(report)
    }
}

/// 补全后的定位记录
///
/// 参考字段为 `None` 表示未匹配到任何实体，与合法 ID 不会混淆。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePositionRecord {
    pub device_id: String,
    pub plate_no: Option<String>,
    pub point: Point,
    pub captured_at: DateTime<Utc>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,

    pub ring_id: Option<i64>,
    pub segment_id: Option<i64>,
    /// 仅在匹配到路段时才可能为 true
    pub is_junction: bool,
    pub road_id: Option<i64>,
    pub road_code: Option<String>,
    pub parking_lot_id: Option<i64>,
}

impl From<PositionReport> for VehiclePositionRecord {
    fn from(report: PositionReport) -> Self {
        Self {
            device_id: report.device_id,
            plate_no: report.plate_no,
            point: report.point,
            captured_at: report.captured_at,
            speed: report.speed,
            heading: report.heading,
            ring_id: None,
            segment_id: None,
            is_junction: false,
            road_id: None,
            road_code: None,
            parking_lot_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// 参考实体候选
// ---------------------------------------------------------------------------

/// 环线
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RingRef {
    pub id: i64,
}

/// 路段
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SegmentRef {
    pub id: i64,
    pub is_junction: bool,
}

/// 道路
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RoadRef {
    pub id: i64,
    pub code: Option<String>,
}

/// 停车场
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ParkingLotRef {
    pub id: i64,
}
