//! End-to-end runtime scenarios
//!
//! Each test starts a full pipeline (or a bare hub) on a current-thread
//! runtime, drives it through the public handle and checks what
//! subscribers and metrics observe.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use thermoguard_connectors::{ChannelSink, ConnectorError, FanoutHub};
use thermoguard_core::{
    DerivedEvent, PipelineMetrics, Position, Reading, RejectReason, Severity, TelemetryError, Topic,
};
use thermoguard_schemas::SubscriptionFilter;

const QUIET: Duration = Duration::from_millis(200);

fn reading_event(ts: i64) -> DerivedEvent {
    Reading::celsius("s1", "hall", Position::planar(0.0, 0.0), ts, 22.0).into()
}

#[tokio::test]
async fn zone_filters_isolate_subscribers() {
    let mut sensors = triangle("hall-a");
    sensors.push(("d".to_string(), Position::planar(20.0, 20.0), "hall-b".to_string()));
    let pipeline = start(threshold_only_config(), &sensors);

    let (sink_a, mut rx_a) = ChannelSink::pair(64);
    let (sink_b, mut rx_b) = ChannelSink::pair(64);
    pipeline
        .subscribe(
            "hall-a-dashboard",
            SubscriptionFilter::topics(&[Topic::Readings]).with_zones(["hall-a"]),
            Box::new(sink_a),
        )
        .unwrap();
    pipeline
        .subscribe(
            "hall-b-dashboard",
            SubscriptionFilter::topics(&[Topic::Readings]).with_zones(["hall-b"]),
            Box::new(sink_b),
        )
        .unwrap();

    for (id, zone) in [("a", "hall-a"), ("b", "hall-a"), ("c", "hall-a"), ("d", "hall-b")] {
        pipeline.ingest(raw(id, zone, 1_000, 21.0)).unwrap();
    }
    pipeline.shutdown().await;

    let seen_a = collect(&mut rx_a, QUIET).await;
    let seen_b = collect(&mut rx_b, QUIET).await;

    assert_eq!(seen_a.len(), 3);
    assert!(seen_a.iter().all(|e| e.payload["zoneId"] == "hall-a"));
    assert_eq!(seen_b.len(), 1);
    assert_eq!(seen_b[0].payload["sensorId"], "d");
}

#[tokio::test]
async fn slow_client_drops_oldest() {
    let metrics = Arc::new(PipelineMetrics::new());
    let hub = FanoutHub::new(4, metrics.clone());
    let (sink, mut rx) = ChannelSink::pair(1);
    hub.connect("slow", Box::new(sink));
    hub.subscribe("slow", SubscriptionFilter::all()).unwrap();

    // Nothing is delivered until this task yields
    for ts in 0..10 {
        assert_eq!(hub.publish(&reading_event(ts)), 1);
    }

    let stats = hub.client_stats("slow").unwrap();
    assert_eq!(stats.dropped, 6);
    assert_eq!(stats.queued, 4);
    assert_eq!(metrics.rejections(RejectReason::ClientOverloaded), 6);

    let mut timestamps = Vec::new();
    for _ in 0..4 {
        timestamps.push(rx.recv().await.unwrap().timestamp);
    }
    assert_eq!(timestamps, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn overloaded_client_does_not_affect_others() {
    let metrics = Arc::new(PipelineMetrics::new());
    let hub = FanoutHub::new(4, metrics.clone());
    let (slow, _slow_rx) = ChannelSink::pair(1);
    let (fast, mut fast_rx) = ChannelSink::pair(64);
    hub.connect("slow", Box::new(slow));
    hub.connect("fast", Box::new(fast));
    hub.subscribe("slow", SubscriptionFilter::all()).unwrap();
    hub.subscribe("fast", SubscriptionFilter::all()).unwrap();

    for ts in 0..4 {
        hub.publish(&reading_event(ts));
    }
    for ts in 0..4 {
        assert_eq!(fast_rx.recv().await.unwrap().timestamp, ts);
    }

    // The slow client's channel is full and its queue holds four more
    for ts in 4..12 {
        hub.publish(&reading_event(ts));
        assert_eq!(fast_rx.recv().await.unwrap().timestamp, ts);
    }
    assert!(hub.client_stats("slow").unwrap().dropped > 0);
    assert_eq!(hub.client_stats("fast").unwrap().dropped, 0);
}

#[tokio::test]
async fn dwell_raises_and_resolves_alert_end_to_end() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    let (sink, mut rx) = ChannelSink::pair(64);
    pipeline
        .subscribe(
            "oncall",
            SubscriptionFilter::topics(&[Topic::Alerts]).with_sensors(["b"]),
            Box::new(sink),
        )
        .unwrap();

    for ts in (0..=40_000).step_by(10_000) {
        pipeline.ingest(raw("b", "hall", ts, 31.0)).unwrap();
    }
    for ts in (50_000..=120_000).step_by(10_000) {
        pipeline.ingest(raw("b", "hall", ts, 25.0)).unwrap();
    }
    pipeline.shutdown().await;

    let alerts = collect(&mut rx, QUIET).await;
    let transitions: Vec<_> = alerts
        .iter()
        .filter(|e| e.payload["kind"] == "highTemperature")
        .map(|e| {
            (
                e.payload["transition"].as_str().unwrap().to_string(),
                e.payload["level"].as_str().unwrap().to_string(),
                e.timestamp,
            )
        })
        .collect();

    assert_eq!(
        transitions,
        vec![
            ("raised".to_string(), "warning".to_string(), 30_000),
            ("resolved".to_string(), "normal".to_string(), 110_000),
        ]
    );
    assert!(alerts.iter().all(|e| e.event_type == "alert"));
}

#[tokio::test]
async fn severity_gated_subscriber_sees_raise_and_resolve() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    let (sink, mut rx) = ChannelSink::pair(64);
    pipeline
        .subscribe(
            "pager",
            SubscriptionFilter::topics(&[Topic::Alerts]).with_min_severity(Severity::Warning),
            Box::new(sink),
        )
        .unwrap();

    for ts in (0..=40_000).step_by(10_000) {
        pipeline.ingest(raw("b", "hall", ts, 31.0)).unwrap();
    }
    for ts in (50_000..=120_000).step_by(10_000) {
        pipeline.ingest(raw("b", "hall", ts, 25.0)).unwrap();
    }
    pipeline.shutdown().await;

    let transitions: Vec<String> = collect(&mut rx, QUIET)
        .await
        .iter()
        .filter(|e| e.payload["kind"] == "highTemperature")
        .map(|e| e.payload["transition"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(transitions, vec!["raised", "resolved"]);
}

#[tokio::test]
async fn active_alerts_reflect_raised_level() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    for ts in (0..=40_000).step_by(10_000) {
        pipeline.ingest(raw("a", "hall", ts, 36.0)).unwrap();
    }

    let raised = eventually(|| !pipeline.active_alerts().is_empty(), Duration::from_secs(2)).await;
    assert!(raised);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn full_ingestion_queue_rejects_with_queue_full() {
    let mut config = threshold_only_config();
    config.queues.capacity = 1;
    let pipeline = start(config, &triangle("hall"));

    // The validator cannot run before this task yields
    pipeline.ingest(raw("a", "hall", 1_000, 21.0)).unwrap();
    let err = pipeline.ingest(raw("b", "hall", 1_000, 21.0)).unwrap_err();

    assert!(matches!(
        err.telemetry(),
        Some(TelemetryError::QueueFull { .. })
    ));
    assert_eq!(pipeline.metrics().rejection(RejectReason::QueueFull), 1);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn ingest_after_shutdown_fails() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    pipeline.shutdown().await;
    pipeline.shutdown().await;

    assert!(matches!(
        pipeline.ingest(raw("a", "hall", 1_000, 21.0)),
        Err(ConnectorError::ShutDown)
    ));
}

#[tokio::test]
async fn failing_sink_disconnects_only_that_client() {
    let hub = FanoutHub::new(8, Arc::new(PipelineMetrics::new()));
    let flaky = FailingSink::new(1);
    let flaky_delivered = flaky.delivered.clone();
    let (steady, mut steady_rx) = ChannelSink::pair(8);
    hub.connect("flaky", Box::new(flaky));
    hub.connect("steady", Box::new(steady));
    hub.subscribe("flaky", SubscriptionFilter::all()).unwrap();
    hub.subscribe("steady", SubscriptionFilter::all()).unwrap();

    for ts in 0..3 {
        hub.publish(&reading_event(ts));
    }

    assert!(eventually(|| !hub.is_connected("flaky"), Duration::from_secs(2)).await);
    assert_eq!(flaky_delivered.load(Ordering::SeqCst), 1);
    for ts in 0..3 {
        assert_eq!(steady_rx.recv().await.unwrap().timestamp, ts);
    }
    assert!(hub.is_connected("steady"));
    assert_eq!(hub.publish(&reading_event(3)), 1);
}

#[tokio::test]
async fn shutdown_flushes_open_window() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    let (sink, mut rx) = ChannelSink::pair(64);
    pipeline
        .subscribe("history", SubscriptionFilter::topics(&[Topic::Windows]), Box::new(sink))
        .unwrap();

    pipeline.ingest(raw("a", "hall", 1_000, 20.0)).unwrap();
    pipeline.ingest(raw("b", "hall", 2_000, 22.0)).unwrap();
    pipeline.ingest(raw("c", "hall", 3_000, 24.0)).unwrap();
    pipeline.shutdown().await;

    let windows = collect(&mut rx, QUIET).await;
    assert_eq!(windows.len(), 1);
    let window = &windows[0].payload;
    assert_eq!(window["zoneId"], "hall");
    assert_eq!(window["bucketStart"], 0);
    assert_eq!(window["count"], 3);
    assert_eq!(window["sum"].as_f64(), Some(66.0));
    assert_eq!(pipeline.metrics().windows_emitted, 1);
}

#[tokio::test]
async fn invalid_json_is_counted_as_invalid_schema() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));

    let err = pipeline.ingest_json(r#"{"sensorId":"a","value":"hot"}"#).unwrap_err();
    assert!(matches!(err, ConnectorError::Schema(_)));
    assert!(pipeline.ingest_json("not json").is_err());

    pipeline
        .ingest_json(r#"{"sensorId":"a","timestamp":1000,"value":21.5,"unit":"celsius","zoneId":"hall"}"#)
        .unwrap();

    assert_eq!(pipeline.metrics().rejection(RejectReason::InvalidSchema), 2);
    pipeline.shutdown().await;
    assert_eq!(pipeline.metrics().accepted, 1);
}

#[tokio::test]
async fn unknown_sensor_is_rejected_by_validator() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    pipeline.ingest(raw("ghost", "hall", 1_000, 21.0)).unwrap();
    pipeline.shutdown().await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.rejection(RejectReason::UnknownSensor), 1);
    assert_eq!(metrics.accepted, 0);
}

#[tokio::test]
async fn interpolation_follows_ingested_values() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    pipeline.ingest(raw("a", "hall", 1_000, 20.0)).unwrap();
    pipeline.ingest(raw("b", "hall", 1_000, 22.0)).unwrap();
    pipeline.ingest(raw("c", "hall", 1_000, 24.0)).unwrap();

    let ready = eventually(
        || pipeline.interpolate(2.0, 2.0).value.is_some(),
        Duration::from_secs(2),
    )
    .await;
    assert!(ready);

    let ready = eventually(
        || {
            pipeline
                .interpolate(2.0, 2.0)
                .value
                .map_or(false, |v| (v - 21.2).abs() < 1e-6)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(ready, "barycentric blend of all three vertices");

    let raster = pipeline.rasterize_async(8).await.unwrap();
    assert_eq!(raster.cells.len(), 64);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn raster_requests_are_capped() {
    let mut config = threshold_only_config();
    config.mesh.max_raster_resolution = 32;
    let pipeline = start(config, &triangle("hall"));

    let raster = pipeline.rasterize_async(1_000_000).await.unwrap();
    assert_eq!((raster.spec.cols, raster.spec.rows), (32, 32));
    assert_eq!(raster.cells.len(), 1024);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn control_messages_steer_subscription() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    let (sink, mut rx) = ChannelSink::pair(64);
    pipeline.hub().connect("console", Box::new(sink));

    pipeline
        .control("console", r#"{"action":"subscribe","topics":["readings"],"filters":{"sensorIds":["c"]}}"#)
        .unwrap();
    assert!(pipeline.control("console", r#"{"action":"explode"}"#).is_err());

    pipeline.ingest(raw("a", "hall", 1_000, 20.0)).unwrap();
    pipeline.ingest(raw("c", "hall", 1_000, 24.0)).unwrap();
    pipeline.shutdown().await;

    let seen = collect(&mut rx, QUIET).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload["sensorId"], "c");
    assert_eq!(pipeline.metrics().rejection(RejectReason::InvalidSchema), 1);
}

#[tokio::test]
async fn metrics_report_per_client_drops() {
    let pipeline = start(threshold_only_config(), &triangle("hall"));
    let (sink, _rx) = ChannelSink::pair(8);
    pipeline
        .subscribe(
            "wallboard",
            SubscriptionFilter::all().with_min_severity(Severity::Warning),
            Box::new(sink),
        )
        .unwrap();

    let metrics = pipeline.metrics();
    assert_eq!(metrics.client_dropped.get("wallboard"), Some(&0));
    assert!(pipeline.client_stats("wallboard").unwrap().subscribed);
    pipeline.shutdown().await;
}
