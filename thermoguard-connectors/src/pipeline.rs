//! Staged Pipeline Runtime
//!
//! ## Overview
//!
//! The pipeline is a handful of tokio tasks connected by bounded channels:
//!
//! ```text
//!                  try_send                      send_timeout
//!  ingest() ──→ [ingest q] ──→ Validator ──┬──→ [interp q] ──→ Interpolation updater
//!  (QueueFull                              ├──→ [agg q] ─────→ Aggregator ──┐ (ticker)
//!   when full)                             └──→ [detect q] ──→ Detector ←───┘ windows
//!                                                                 │
//!                                          shard_index(entity)    ▼
//!                                          [alert q 0..N] ──→ Alert shard workers
//!
//!  every stage ──→ FanoutHub::publish ──→ per-client queues ──→ sinks
//! ```
//!
//! ## Backpressure
//!
//! | Boundary | Policy |
//! |----------|--------|
//! | ingestion | `try_send`; a full queue is an explicit `QueueFull` rejection |
//! | between stages | `send_timeout`; after the bounded wait the message is dropped and counted for the receiving stage |
//! | to clients | drop-oldest per client, never blocks |
//!
//! Nothing waits without a bound: a wedged stage costs dropped messages and
//! a rising drop counter, not a stalled ingestion path.
//!
//! ## Shared State
//!
//! Interpolation queries never touch the pipeline tasks. They read the
//! [`InterpolationEngine`]'s current snapshot directly, which the updater
//! task replaces once per batch of readings.
//!
//! ## Shutdown
//!
//! [`PipelineHandle::shutdown`] closes the ingestion queue and lets the
//! close cascade: each stage drains its input, then drops its outputs. The
//! aggregator flushes every open window on the way out so in-flight buckets
//! reach the detector and subscribers. Client delivery tasks are stopped
//! last, after they have drained.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinHandle;

use thermoguard_core::shard::shard_index;
use thermoguard_core::{
    AlertEngine, AlertState, DerivedEvent, Estimate, GridSpec, InterpolationEngine,
    MetricsSnapshot, Observation, PipelineConfig, PipelineMetrics, RawReading, ReadingValidator,
    Reading, RejectReason, SensorRegistry, Stage, TelemetryError, TimeSource, Raster, Validation,
    Window, WindowAggregator,
};
use thermoguard_ml::AnomalyDetector;
use thermoguard_schemas::{IngestDecoder, SubscriptionFilter, TemperatureConstraints};

use crate::fanout::{ClientStats, FanoutHub};
use crate::sink::ClientSink;
use crate::ConnectorError;

/// Time client delivery tasks get to drain on shutdown
const CLIENT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Input of the detector stage
#[derive(Debug)]
enum DetectorInput {
    Reading(Reading),
    Window(Window),
}

/// Bounded send between stages
struct Link<T> {
    tx: mpsc::Sender<T>,
    stage: Stage,
    timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl<T> Link<T> {
    fn new(tx: mpsc::Sender<T>, stage: Stage, timeout: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            tx,
            stage,
            timeout,
            metrics,
        }
    }

    /// Wait at most `timeout` for room; drop and count on expiry
    async fn forward(&self, item: T) -> bool {
        let sent = match self.tx.send_timeout(item, self.timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics.stage(self.stage).record_drop();
                log::warn!(
                    "{} queue full for {:?}, message dropped",
                    self.stage.name(),
                    self.timeout
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                log::debug!("{} stage already stopped", self.stage.name());
                false
            }
        };
        self.record_depth();
        sent
    }

    fn record_depth(&self) {
        let depth = self.tx.max_capacity() - self.tx.capacity();
        self.metrics.stage(self.stage).set_depth(depth);
    }
}

struct Tasks {
    validator: JoinHandle<()>,
    interpolation: JoinHandle<()>,
    aggregator: JoinHandle<()>,
    detector: JoinHandle<()>,
    alert_shards: Vec<JoinHandle<()>>,
}

/// Running pipeline
///
/// Ingestion, queries, subscriptions and metrics all go through this handle.
/// It is cheap to share behind an `Arc`.
pub struct PipelineHandle {
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    registry: Arc<SensorRegistry>,
    engine: Arc<InterpolationEngine>,
    alerts: Arc<AlertEngine>,
    hub: Arc<FanoutHub>,
    decoder: IngestDecoder,
    ingest_tx: RwLock<Option<mpsc::Sender<RawReading>>>,
    tasks: Mutex<Option<Tasks>>,
}

impl PipelineHandle {
    /// Validate `config` and spawn every stage
    ///
    /// Must be called from within a tokio runtime. `time` drives the window
    /// ticker.
    pub fn start(config: PipelineConfig, time: Arc<dyn TimeSource>) -> Result<Self, ConnectorError> {
        let registry = Arc::new(SensorRegistry::new(&config.validator));
        Self::start_with_registry(config, registry, time)
    }

    /// Start on top of an already populated sensor registry
    pub fn start_with_registry(
        config: PipelineConfig,
        registry: Arc<SensorRegistry>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, ConnectorError> {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new());
        let validator = ReadingValidator::new(&config.validator, registry.clone(), metrics.clone());
        let engine = Arc::new(InterpolationEngine::new(&config.mesh, metrics.clone()));
        if let Some(Err(err)) = engine.sync_geometry(&registry) {
            log::warn!("Starting with degraded geometry: {}", err);
        }
        let alerts = Arc::new(AlertEngine::new(&config.alerts, metrics.clone()));
        let hub = Arc::new(FanoutHub::new(config.fanout.client_queue_capacity, metrics.clone()));
        let detector = AnomalyDetector::new(&config.anomaly, registry.clone(), metrics.clone());
        let aggregator = WindowAggregator::new(&config.window);

        let capacity = config.queues.capacity.max(1);
        let put_timeout = Duration::from_millis(config.queues.put_timeout_ms);

        let (ingest_tx, ingest_rx) = mpsc::channel(capacity);
        let (interp_tx, interp_rx) = mpsc::channel(capacity);
        let (agg_tx, agg_rx) = mpsc::channel(capacity);
        let (detect_tx, detect_rx) = mpsc::channel(capacity);

        let shard_count = config.alerts.shards.max(1);
        let mut alert_links = Vec::with_capacity(shard_count);
        let mut alert_shards = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(capacity);
            alert_links.push(Link::new(tx, Stage::Alerts, put_timeout, metrics.clone()));
            alert_shards.push(tokio::spawn(run_alert_shard(
                shard,
                rx,
                alerts.clone(),
                hub.clone(),
            )));
        }

        let detector_task = tokio::spawn(run_detector(
            detect_rx,
            detector,
            alert_links,
            hub.clone(),
            metrics.clone(),
        ));
        let aggregator_task = tokio::spawn(run_aggregator(
            agg_rx,
            aggregator,
            Link::new(detect_tx.clone(), Stage::Detector, put_timeout, metrics.clone()),
            hub.clone(),
            metrics.clone(),
            time,
            Duration::from_millis(config.window.tick_interval_ms.max(1)),
        ));
        let interpolation_task = tokio::spawn(run_interpolation(
            interp_rx,
            engine.clone(),
            registry.clone(),
            metrics.clone(),
            config.queues.value_batch.max(1),
        ));
        let validator_task = tokio::spawn(run_validator(
            ingest_rx,
            validator,
            Outputs {
                interpolation: Link::new(interp_tx, Stage::Interpolation, put_timeout, metrics.clone()),
                aggregator: Link::new(agg_tx, Stage::Aggregator, put_timeout, metrics.clone()),
                detector: Link::new(detect_tx, Stage::Detector, put_timeout, metrics.clone()),
            },
            hub.clone(),
            metrics.clone(),
        ));

        log::info!(
            "Pipeline started: {} sensors, queue capacity {}, {} alert shards",
            registry.len(),
            capacity,
            shard_count
        );

        Ok(Self {
            decoder: IngestDecoder::new()
                .with_constraints(TemperatureConstraints::from_validator(&config.validator)),
            config,
            metrics,
            registry,
            engine,
            alerts,
            hub,
            ingest_tx: RwLock::new(Some(ingest_tx)),
            tasks: Mutex::new(Some(Tasks {
                validator: validator_task,
                interpolation: interpolation_task,
                aggregator: aggregator_task,
                detector: detector_task,
                alert_shards,
            })),
        })
    }

    /// Hand one raw reading to the pipeline
    ///
    /// Never waits. A full ingestion queue is rejected with `QueueFull`; the
    /// caller decides whether to retry or drop.
    pub fn ingest(&self, raw: RawReading) -> Result<(), ConnectorError> {
        let guard = self
            .ingest_tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = guard.as_ref().ok_or(ConnectorError::ShutDown)?;

        let outcome = match tx.try_send(raw) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.record_rejection(RejectReason::QueueFull);
                log::warn!("Ingestion queue full, reading rejected");
                Err(TelemetryError::QueueFull {
                    stage: Stage::Ingest.name(),
                }
                .into())
            }
            Err(TrySendError::Closed(_)) => Err(ConnectorError::ShutDown),
        };
        self.metrics
            .stage(Stage::Ingest)
            .set_depth(tx.max_capacity() - tx.capacity());
        outcome
    }

    /// Decode a JSON ingestion message and ingest it
    pub fn ingest_json(&self, json: &str) -> Result<(), ConnectorError> {
        let decoded = match self.decoder.decode_str(json) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.metrics.record_rejection(RejectReason::InvalidSchema);
                log::warn!("Rejected ingestion message: {}", err);
                return Err(err.into());
            }
        };
        for warning in &decoded.report.warnings {
            log::debug!("Ingestion warning: {}", warning);
        }
        self.ingest(decoded.reading)
    }

    /// Temperature estimate at `(x, y)` from the current snapshot
    pub fn interpolate(&self, x: f64, y: f64) -> Estimate {
        self.engine.interpolate(x, y)
    }

    /// `resolution × resolution` heat map over the sensor bounding box
    ///
    /// Capped at `mesh.max_raster_resolution` per axis. Runs on scoped threads; from async code prefer [`Self::rasterize_async`].
    pub fn rasterize(&self, resolution: usize) -> Raster {
        self.engine.rasterize(resolution)
    }

    pub fn rasterize_region(&self, spec: &GridSpec) -> Raster {
        self.engine.rasterize_region(spec)
    }

    /// Rasterize on the blocking pool
    pub async fn rasterize_async(&self, resolution: usize) -> Result<Raster, ConnectorError> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.rasterize(resolution))
            .await
            .map_err(|err| ConnectorError::Task(err.to_string()))
    }

    /// Poll every counter, including per-client drops
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.client_dropped = self.hub.dropped_counts();
        snapshot
    }

    pub fn active_alerts(&self) -> Vec<AlertState> {
        self.alerts.active_alerts()
    }

    /// Attach a client and subscribe it in one step
    pub fn subscribe(
        &self,
        client_id: &str,
        filter: SubscriptionFilter,
        sink: Box<dyn ClientSink>,
    ) -> Result<(), ConnectorError> {
        self.hub.connect(client_id, sink);
        self.hub.subscribe(client_id, filter)
    }

    pub fn unsubscribe(&self, client_id: &str) -> Result<bool, ConnectorError> {
        self.hub.unsubscribe(client_id)
    }

    pub fn disconnect(&self, client_id: &str) -> bool {
        self.hub.disconnect(client_id)
    }

    /// Apply a JSON control message for a connected client
    pub fn control(&self, client_id: &str, json: &str) -> Result<(), ConnectorError> {
        crate::control::apply_control_json(&self.hub, &self.metrics, client_id, json)
    }

    pub fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        self.hub.client_stats(client_id)
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<InterpolationEngine> {
        &self.engine
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Close ingestion, drain every stage in order, then stop clients
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(tasks) = tasks else {
            return;
        };

        log::info!("Pipeline shutting down");
        self.ingest_tx
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        join("validator", tasks.validator).await;
        join("interpolation", tasks.interpolation).await;
        join("aggregator", tasks.aggregator).await;
        join("detector", tasks.detector).await;
        for shard in tasks.alert_shards {
            join("alert shard", shard).await;
        }

        self.hub.shutdown(CLIENT_DRAIN_GRACE).await;
        log::info!("Pipeline stopped");
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("sensors", &self.registry.len())
            .field("hub", &self.hub)
            .finish()
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(err) = task.await {
        log::warn!("{} task ended abnormally: {}", name, err);
    }
}

struct Outputs {
    interpolation: Link<Reading>,
    aggregator: Link<Reading>,
    detector: Link<DetectorInput>,
}

async fn run_validator(
    mut rx: mpsc::Receiver<RawReading>,
    validator: ReadingValidator,
    outputs: Outputs,
    hub: Arc<FanoutHub>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(raw) = rx.recv().await {
        metrics.stage(Stage::Ingest).set_depth(rx.len());
        let reading = match validator.validate(raw) {
            Ok(Validation::Accepted { reading, .. }) => reading,
            // Rejections and duplicates are already counted and logged
            Ok(Validation::Duplicate) | Err(_) => continue,
        };

        hub.publish(&DerivedEvent::Reading(reading.clone()));
        outputs.interpolation.forward(reading.clone()).await;
        outputs.aggregator.forward(reading.clone()).await;
        outputs.detector.forward(DetectorInput::Reading(reading)).await;
    }
    log::debug!("Validator stage drained");
}

async fn run_interpolation(
    mut rx: mpsc::Receiver<Reading>,
    engine: Arc<InterpolationEngine>,
    registry: Arc<SensorRegistry>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
) {
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(reading) => batch.push(reading),
                Err(_) => break,
            }
        }
        metrics.stage(Stage::Interpolation).set_depth(rx.len());

        if let Some(Err(err)) = engine.sync_geometry(&registry) {
            metrics.record_rejection(err.reason());
        }
        let version = engine.apply_readings(&batch);
        log::debug!("Published {} readings against mesh v{}", batch.len(), version);
        batch.clear();
    }
    log::debug!("Interpolation stage drained");
}

async fn run_aggregator(
    mut rx: mpsc::Receiver<Reading>,
    mut aggregator: WindowAggregator,
    detector: Link<DetectorInput>,
    hub: Arc<FanoutHub>,
    metrics: Arc<PipelineMetrics>,
    time: Arc<dyn TimeSource>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut watermark = i64::MIN;

    loop {
        let closed = tokio::select! {
            received = rx.recv() => match received {
                Some(reading) => {
                    metrics.stage(Stage::Aggregator).set_depth(rx.len());
                    if let Err(err) = aggregator.record(&reading) {
                        metrics.record_rejection(err.reason());
                    }
                    if reading.timestamp > watermark {
                        watermark = reading.timestamp;
                        aggregator.close_expired(watermark)
                    } else {
                        Vec::new()
                    }
                }
                None => break,
            },
            _ = ticker.tick() => aggregator.close_expired(time.now()),
        };
        emit_windows(closed, &detector, &hub, &metrics).await;
    }

    let flushed = aggregator.flush_all();
    log::info!("Aggregator flushed {} open windows", flushed.len());
    emit_windows(flushed, &detector, &hub, &metrics).await;
}

async fn emit_windows(
    windows: Vec<Window>,
    detector: &Link<DetectorInput>,
    hub: &FanoutHub,
    metrics: &PipelineMetrics,
) {
    if windows.is_empty() {
        return;
    }
    metrics.record_windows(windows.len());
    for window in windows {
        hub.publish(&DerivedEvent::Window(window.clone()));
        detector.forward(DetectorInput::Window(window)).await;
    }
}

async fn run_detector(
    mut rx: mpsc::Receiver<DetectorInput>,
    mut detector: AnomalyDetector,
    alert_shards: Vec<Link<Observation>>,
    hub: Arc<FanoutHub>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(input) = rx.recv().await {
        metrics.stage(Stage::Detector).set_depth(rx.len());
        let detection = match &input {
            DetectorInput::Reading(reading) => detector.observe_reading(reading),
            DetectorInput::Window(window) => detector.observe_window(window),
        };

        for anomaly in detection.anomalies {
            hub.publish(&DerivedEvent::Anomaly(anomaly));
        }
        for observation in detection.observations {
            let shard = shard_index(&observation.entity, alert_shards.len());
            alert_shards[shard].forward(observation).await;
        }
    }
    log::debug!("Detector stage drained");
}

async fn run_alert_shard(
    shard: usize,
    mut rx: mpsc::Receiver<Observation>,
    engine: Arc<AlertEngine>,
    hub: Arc<FanoutHub>,
) {
    while let Some(observation) = rx.recv().await {
        if let Some(event) = engine.evaluate(&observation) {
            log::info!(
                "Alert {} {} {:?} -> {:?}",
                event.entity,
                event.kind.name(),
                event.previous,
                event.level
            );
            hub.publish(&DerivedEvent::Alert(event));
        }
    }
    log::debug!("Alert shard {} drained", shard);
}
