//! 消费管道集成测试
//!
//! 用内存投递流驱动完整的读取任务、有界队列、worker 池与定位补全器，
//! 地理匹配与下游存储替换为内存实现。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_shared::amqp::{Acknowledger, InboundEvent, routing_keys};
use fleet_shared::config::DispatchConfig;
use fleet_shared::error::{FleetError, Result as FleetResult};
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::watch;

use position_ingest::consumer::IngestConsumer;
use position_ingest::dispatch::{DispatchOutcome, WorkerPool, WorkerSettings};
use position_ingest::enricher::PositionEnricher;
use position_ingest::error::IngestError;
use position_ingest::model::{ParkingLotRef, Point, RingRef, RoadRef, SegmentRef, VehiclePositionRecord};
use position_ingest::registry::{EventHandler, HandlerContext, HandlerRegistry};
use position_ingest::resolver::GeoResolver;
use position_ingest::store::PositionStore;
use position_ingest::telemetry::LatencyRecorder;

// ---------------------------------------------------------------------------
// 测试替身
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Settlement {
    Ack(String),
    Nack { id: String, requeue: bool },
}

/// 所有投递共享一份确认日志，按确认顺序记录
#[derive(Default)]
struct SettlementLog(Mutex<Vec<Settlement>>);

impl SettlementLog {
    fn snapshot(&self) -> Vec<Settlement> {
        self.0.lock().clone()
    }
}

struct LoggedAcker {
    id: String,
    log: Arc<SettlementLog>,
}

#[async_trait]
impl Acknowledger for LoggedAcker {
    async fn ack(&self) -> FleetResult<()> {
        self.log.0.lock().push(Settlement::Ack(self.id.clone()));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> FleetResult<()> {
        self.log.0.lock().push(Settlement::Nack {
            id: self.id.clone(),
            requeue,
        });
        Ok(())
    }
}

fn delivery(id: &str, routing_key: &str, payload: &[u8], log: &Arc<SettlementLog>) -> InboundEvent {
    let acker = Arc::new(LoggedAcker {
        id: id.to_string(),
        log: log.clone(),
    });
    InboundEvent::new(routing_key, payload.to_vec(), acker).with_message_id(id)
}

/// 城区示例数据：点 (116.40, 39.90) 只位于 7 号环线和 42 号路口路段内
struct CityResolver;

fn downtown(point: Point) -> bool {
    (point.x - 116.40).abs() < 0.01 && (point.y - 39.90).abs() < 0.01
}

#[async_trait]
impl GeoResolver for CityResolver {
    async fn rings_at(&self, point: Point) -> Result<Vec<RingRef>, IngestError> {
        Ok(if downtown(point) {
            vec![RingRef { id: 7 }, RingRef { id: 2 }]
        } else {
            vec![]
        })
    }

    async fn segments_at(&self, point: Point) -> Result<Vec<SegmentRef>, IngestError> {
        Ok(if downtown(point) {
            vec![SegmentRef {
                id: 42,
                is_junction: true,
            }]
        } else {
            vec![]
        })
    }

    async fn roads_at(&self, _point: Point) -> Result<Vec<RoadRef>, IngestError> {
        Ok(vec![])
    }

    async fn parking_lots_at(&self, _point: Point) -> Result<Vec<ParkingLotRef>, IngestError> {
        Ok(vec![])
    }
}

/// 按设备号记录写入，`offline-` 前缀的设备写入失败
#[derive(Default)]
struct MemoryStore {
    records: Mutex<HashMap<String, VehiclePositionRecord>>,
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn forward(&self, record: &VehiclePositionRecord) -> Result<(), IngestError> {
        if record.device_id.starts_with("offline-") {
            return Err(IngestError::Forward("downstream unavailable".to_string()));
        }
        self.records
            .lock()
            .insert(record.device_id.clone(), record.clone());
        Ok(())
    }
}

/// 写入挂起远超 handler 时限的下游
struct StalledStore;

#[async_trait]
impl PositionStore for StalledStore {
    async fn forward(&self, _record: &VehiclePositionRecord) -> Result<(), IngestError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

#[derive(Default)]
struct CountingRecorder(AtomicUsize);

impl LatencyRecorder for CountingRecorder {
    fn record(&self, _metric: &'static str, _operation: &str, _micros: u64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// 记录调用顺序的 handler
#[derive(Default)]
struct OrderLog(Mutex<Vec<String>>);

struct OrderedHandler(Arc<OrderLog>);

#[async_trait]
impl EventHandler for OrderedHandler {
    async fn handle(&self, _ctx: &HandlerContext, payload: &[u8]) -> Result<(), IngestError> {
        self.0
            .0
            .lock()
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(())
    }
}

fn position_payload(device_id: &str, x: f64, y: f64) -> Vec<u8> {
    serde_json::json!({
        "deviceId": device_id,
        "plateNo": "京A12345",
        "point": { "x": x, "y": y },
        "capturedAt": "2026-10-17T08:00:00Z",
        "speed": 32.5,
        "heading": 90.0
    })
    .to_string()
    .into_bytes()
}

struct Harness {
    store: Arc<MemoryStore>,
    recorder: Arc<CountingRecorder>,
    log: Arc<SettlementLog>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            recorder: Arc::new(CountingRecorder::default()),
            log: Arc::new(SettlementLog::default()),
        }
    }

    fn registry(&self) -> HandlerRegistry {
        let enricher = PositionEnricher::new(
            Arc::new(CityResolver),
            self.store.clone(),
            self.recorder.clone(),
        );
        HandlerRegistry::builder()
            .register(routing_keys::VEHICLE_POSITION, enricher)
            .build()
            .unwrap()
    }

    /// 运行到投递流耗尽，worker 处理完全部投递后返回
    async fn run(&self, registry: HandlerRegistry, config: DispatchConfig, events: Vec<InboundEvent>) {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let items: Vec<FleetResult<InboundEvent>> = events.into_iter().map(Ok).collect();

        tokio::time::timeout(
            Duration::from_secs(10),
            IngestConsumer::new(registry, &config).run(stream::iter(items), shutdown_rx),
        )
        .await
        .expect("pipeline did not drain");
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_downtown_position_is_enriched_and_acked() {
    let harness = Harness::new();
    let events = vec![delivery(
        "m-1",
        routing_keys::VEHICLE_POSITION,
        &position_payload("dev-001", 116.40, 39.90),
        &harness.log,
    )];

    harness
        .run(harness.registry(), DispatchConfig::default(), events)
        .await;

    let records = harness.store.records.lock();
    let record = records.get("dev-001").expect("record forwarded");
    assert_eq!(record.ring_id, Some(7));
    assert_eq!(record.segment_id, Some(42));
    assert!(record.is_junction);
    assert_eq!(record.road_id, None);
    assert_eq!(record.road_code, None);
    assert_eq!(record.parking_lot_id, None);
    assert_eq!(record.plate_no.as_deref(), Some("京A12345"));

    assert_eq!(harness.log.snapshot(), vec![Settlement::Ack("m-1".to_string())]);
    assert_eq!(harness.recorder.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_position_outside_city_is_forwarded_unresolved() {
    let harness = Harness::new();
    let events = vec![delivery(
        "m-1",
        routing_keys::VEHICLE_POSITION,
        &position_payload("dev-002", 0.0, 0.0),
        &harness.log,
    )];

    harness
        .run(harness.registry(), DispatchConfig::default(), events)
        .await;

    let records = harness.store.records.lock();
    let record = records.get("dev-002").expect("record forwarded");
    assert_eq!(record.ring_id, None);
    assert_eq!(record.segment_id, None);
    assert!(!record.is_junction);
    assert_eq!(record.road_id, None);
    assert_eq!(record.road_code, None);
    assert_eq!(harness.log.snapshot(), vec![Settlement::Ack("m-1".to_string())]);
}

#[tokio::test]
async fn test_forward_failure_is_requeued() {
    let harness = Harness::new();
    let events = vec![delivery(
        "m-1",
        routing_keys::VEHICLE_POSITION,
        &position_payload("offline-009", 116.40, 39.90),
        &harness.log,
    )];

    harness
        .run(harness.registry(), DispatchConfig::default(), events)
        .await;

    assert!(harness.store.records.lock().is_empty());
    assert_eq!(
        harness.log.snapshot(),
        vec![Settlement::Nack {
            id: "m-1".to_string(),
            requeue: true
        }]
    );
    assert_eq!(harness.recorder.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_routing_key_is_acked_and_dropped() {
    let harness = Harness::new();
    let events = vec![delivery(
        "m-1",
        routing_keys::DRIVER_STATUS,
        &position_payload("dev-003", 116.40, 39.90),
        &harness.log,
    )];

    harness
        .run(harness.registry(), DispatchConfig::default(), events)
        .await;

    assert!(harness.store.records.lock().is_empty());
    assert_eq!(harness.log.snapshot(), vec![Settlement::Ack("m-1".to_string())]);
    assert_eq!(harness.recorder.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_payload_is_requeued() {
    let harness = Harness::new();
    let events = vec![delivery(
        "m-1",
        routing_keys::VEHICLE_POSITION,
        b"not json",
        &harness.log,
    )];

    harness
        .run(harness.registry(), DispatchConfig::default(), events)
        .await;

    assert_eq!(
        harness.log.snapshot(),
        vec![Settlement::Nack {
            id: "m-1".to_string(),
            requeue: true
        }]
    );
}

#[tokio::test]
async fn test_every_delivery_settled_exactly_once() {
    let harness = Harness::new();
    let mut events = Vec::new();
    for i in 0..50 {
        let (key, device) = match i % 3 {
            0 => (routing_keys::VEHICLE_POSITION, format!("dev-{i}")),
            1 => (routing_keys::VEHICLE_POSITION, format!("offline-{i}")),
            _ => (routing_keys::VEHICLE_STATUS, format!("dev-{i}")),
        };
        events.push(delivery(
            &format!("m-{i}"),
            key,
            &position_payload(&device, 116.40, 39.90),
            &harness.log,
        ));
    }

    harness
        .run(harness.registry(), DispatchConfig::default(), events)
        .await;

    let settlements = harness.log.snapshot();
    assert_eq!(settlements.len(), 50);

    let acked = settlements
        .iter()
        .filter(|s| matches!(s, Settlement::Ack(_)))
        .count();
    let requeued = settlements
        .iter()
        .filter(|s| matches!(s, Settlement::Nack { requeue: true, .. }))
        .count();
    // 17 条成功写入，16 条未注册直接确认，17 条写入失败
    assert_eq!(acked, 33);
    assert_eq!(requeued, 17);
    assert_eq!(harness.store.records.lock().len(), 17);
}

#[tokio::test]
async fn test_single_worker_preserves_order() {
    let harness = Harness::new();
    let order = Arc::new(OrderLog::default());
    let registry = HandlerRegistry::builder()
        .register("vehicle.status", OrderedHandler(order.clone()))
        .build()
        .unwrap();
    let config = DispatchConfig {
        queue_capacity: 2,
        workers: 1,
        ..Default::default()
    };

    let events = (0..10)
        .map(|i| {
            delivery(
                &format!("m-{i}"),
                "vehicle.status",
                format!("{i}").as_bytes(),
                &harness.log,
            )
        })
        .collect();

    harness.run(registry, config, events).await;

    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(*order.0.lock(), expected);
    let acked: Vec<Settlement> = (0..10).map(|i| Settlement::Ack(format!("m-{i}"))).collect();
    assert_eq!(harness.log.snapshot(), acked);
}

#[tokio::test]
async fn test_shutdown_stops_reading() {
    let harness = Harness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();

    let items: Vec<FleetResult<InboundEvent>> = vec![
        Ok(delivery(
            "m-1",
            routing_keys::VEHICLE_POSITION,
            &position_payload("dev-001", 116.40, 39.90),
            &harness.log,
        )),
        Err(FleetError::Amqp("consumer cancelled".to_string())),
    ];

    tokio::time::timeout(
        Duration::from_secs(5),
        IngestConsumer::new(harness.registry(), &DispatchConfig::default())
            .run(stream::iter(items), shutdown_rx),
    )
    .await
    .unwrap();

    // 停机信号先于读取生效，没有投递被处理或确认
    assert!(harness.log.snapshot().is_empty());
    assert!(harness.store.records.lock().is_empty());
}

#[tokio::test]
async fn test_timed_out_enrichment_still_records_latency() {
    let harness = Harness::new();
    let enricher = PositionEnricher::new(
        Arc::new(CityResolver),
        Arc::new(StalledStore),
        harness.recorder.clone(),
    );
    let registry = HandlerRegistry::builder()
        .register(routing_keys::VEHICLE_POSITION, enricher)
        .build()
        .unwrap();
    let pool = WorkerPool::new(
        Arc::new(registry),
        WorkerSettings {
            workers: 1,
            handler_timeout: Duration::from_millis(50),
            max_redeliveries: None,
        },
    );

    let outcome = pool
        .dispatch(delivery(
            "m-1",
            routing_keys::VEHICLE_POSITION,
            &position_payload("dev-001", 116.40, 39.90),
            &harness.log,
        ))
        .await;

    assert_eq!(outcome, DispatchOutcome::Requeued);
    assert_eq!(
        harness.log.snapshot(),
        vec![Settlement::Nack {
            id: "m-1".to_string(),
            requeue: true
        }]
    );
    // 超时中止的补全同样记录一次耗时
    assert_eq!(harness.recorder.0.load(Ordering::SeqCst), 1);
}
