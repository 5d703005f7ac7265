//! Common test utilities for integration tests
//!
//! - Deterministic sensor layouts and field generators
//! - Raw reading builders in wire shape
//! - A wired validator + registry + interpolation fixture

#![allow(dead_code)]

use std::sync::Arc;

use thermoguard_core::{
    InterpolationEngine, MeshConfig, PipelineMetrics, Position, RawReading, ReadingValidator,
    SensorRegistry, Timestamp, Validation, ValidatorConfig,
};

/// Xorshift generator, reproducible across platforms
pub struct TestRng {
    state: u64,
}

impl TestRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn gen_range(&mut self, min: f64, max: f64) -> f64 {
        min + self.next_f64() * (max - min)
    }
}

/// `side × side` lattice with `spacing` metres between sensors
pub fn grid_layout(side: usize, spacing: f64) -> Vec<(String, Position)> {
    let mut sensors = Vec::with_capacity(side * side);
    for row in 0..side {
        for col in 0..side {
            sensors.push((
                format!("grid-{:02}-{:02}", row, col),
                Position::planar(col as f64 * spacing, row as f64 * spacing),
            ));
        }
    }
    sensors
}

/// `count` sensors scattered uniformly over `[0, extent]²`
pub fn scattered_layout(count: usize, extent: f64, seed: u64) -> Vec<(String, Position)> {
    let mut rng = TestRng::new(seed);
    (0..count)
        .map(|i| {
            (
                format!("scatter-{:03}", i),
                Position::planar(rng.gen_range(0.0, extent), rng.gen_range(0.0, extent)),
            )
        })
        .collect()
}

/// Raw reading as the ingestion boundary would produce it
pub fn raw(sensor_id: &str, zone_id: &str, timestamp: Timestamp, value: f64) -> RawReading {
    RawReading {
        sensor_id: Some(sensor_id.to_string()),
        timestamp: Some(timestamp),
        value: Some(value),
        unit: Some("celsius".to_string()),
        quality: Some(1.0),
        zone_id: Some(zone_id.to_string()),
        position: None,
    }
}

/// Validator, registry and interpolation engine sharing one metrics instance
pub struct FieldFixture {
    pub metrics: Arc<PipelineMetrics>,
    pub registry: Arc<SensorRegistry>,
    pub validator: ReadingValidator,
    pub engine: InterpolationEngine,
}

impl FieldFixture {
    pub fn new(sensors: &[(String, Position)], zone_id: &str) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let config = ValidatorConfig::default();
        let registry = Arc::new(SensorRegistry::new(&config));
        for (id, position) in sensors {
            registry.register(id, zone_id, *position);
        }
        let validator = ReadingValidator::new(&config, registry.clone(), metrics.clone());
        let engine = InterpolationEngine::new(&MeshConfig::default(), metrics.clone());
        engine.sync_geometry(&registry);

        Self {
            metrics,
            registry,
            validator,
            engine,
        }
    }

    /// Validate readings and fold the accepted ones into the field
    pub fn ingest(&self, readings: Vec<RawReading>) -> usize {
        let accepted: Vec<_> = readings
            .into_iter()
            .filter_map(|raw| match self.validator.validate(raw) {
                Ok(Validation::Accepted { reading, .. }) => Some(reading),
                _ => None,
            })
            .collect();
        self.engine.sync_geometry(&self.registry);
        self.engine.apply_readings(&accepted);
        accepted.len()
    }
}
