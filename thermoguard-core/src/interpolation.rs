//! Interpolation Engine
//!
//! ## Overview
//!
//! Reconstructs a continuous temperature field from the latest sensor values
//! and answers point and grid queries against it.
//!
//! ## Snapshot Model
//!
//! ```text
//!               rebuild_mesh (rare)      apply_readings (frequent)
//!                      │                          │
//!                      ▼                          ▼
//!   ┌───────────────────────────────────────────────────────────┐
//!   │ RwLock<Arc<FieldSnapshot>>   { Arc<Mesh>, Arc<ValueVector> } │
//!   └───────────────────────────────────────────────────────────┘
//!          ▲            ▲            ▲
//!     interpolate   rasterize    nearest_sensor      (many readers)
//! ```
//!
//! Readers clone the current `Arc` and release the lock immediately; every
//! query then runs against an immutable, internally consistent pair whose
//! value vector was computed for exactly that mesh version. Publishing a new
//! value vector reuses the current mesh `Arc`, so the frequent update never
//! copies topology.
//!
//! ## Query Strategy
//!
//! | Situation | Method | Confidence |
//! |-----------|--------|------------|
//! | inside hull, all vertices valued | barycentric | 1.0 |
//! | inside hull, some vertices unvalued | barycentric over valued vertices | share of weight on valued vertices |
//! | outside hull | inverse distance over the k nearest hull vertices | `extrapolated_confidence` |
//! | mesh degenerate | nearest valued vertex | `degraded_confidence` |
//! | nothing valued | no data | 0.0 |
//!
//! Barycentric weights are non-negative and sum to one, so an interpolated
//! value never leaves the range of its triangle's vertex values, and a query
//! at a sensor position returns that sensor's value exactly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::config::MeshConfig;
use crate::errors::TelemetryResult;
use crate::mesh::{Bounds, Location, Mesh, Point};
use crate::metrics::PipelineMetrics;
use crate::reading::{Position, Reading};
use crate::sensor::SensorRegistry;
use crate::shard::lock;
use crate::time::Timestamp;

/// Grids below this many cells are rasterized on the calling thread
const PARALLEL_THRESHOLD: usize = 4096;

/// How an estimate was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EstimateMethod {
    Barycentric,
    InverseDistance,
    NearestNeighbor,
    NoData,
}

/// Interpolated temperature with its confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    /// Celsius, `None` when no sensor has reported yet
    pub value: Option<f64>,
    /// 0.0 = no information, 1.0 = fully supported by surrounding sensors
    pub confidence: f64,
    pub method: EstimateMethod,
}

impl Estimate {
    pub const NO_DATA: Estimate = Estimate {
        value: None,
        confidence: 0.0,
        method: EstimateMethod::NoData,
    };

    pub fn is_degraded(&self) -> bool {
        self.method == EstimateMethod::NearestNeighbor
    }
}

/// Current value per mesh vertex, tied to one mesh version
#[derive(Debug, Clone, PartialEq)]
pub struct ValueVector {
    mesh_version: u64,
    values: Vec<Option<f64>>,
}

impl ValueVector {
    pub fn mesh_version(&self) -> u64 {
        self.mesh_version
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn get(&self, vertex: usize) -> Option<f64> {
        self.values.get(vertex).copied().flatten()
    }

    /// Vertex values from per-sensor values; coincident sensors average
    fn compute(mesh: &Mesh, latest: &HashMap<String, (Timestamp, f64)>) -> Self {
        let ids = mesh.sensor_ids();
        let values = (0..mesh.vertex_count())
            .map(|vertex| {
                let (sum, count) = mesh
                    .sensors_at(vertex)
                    .iter()
                    .filter_map(|&slot| latest.get(&ids[slot]).map(|&(_, value)| value))
                    .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                (count > 0).then(|| sum / count as f64)
            })
            .collect();

        Self {
            mesh_version: mesh.version(),
            values,
        }
    }
}

/// Immutable (mesh, values) pair seen by queries
#[derive(Debug, Clone)]
pub struct FieldSnapshot {
    mesh: Arc<Mesh>,
    values: Arc<ValueVector>,
    config: MeshConfig,
}

impl FieldSnapshot {
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn mesh_version(&self) -> u64 {
        self.mesh.version()
    }

    pub fn values(&self) -> &ValueVector {
        &self.values
    }

    /// Start a sequence of nearby queries
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            snapshot: self,
            hint: None,
        }
    }

    /// One-off point query
    pub fn interpolate(&self, x: f64, y: f64) -> Estimate {
        self.cursor().estimate(Point::new(x, y))
    }

    /// Sensor closest to `(x, y)` and its distance
    pub fn nearest_sensor(&self, x: f64, y: f64) -> Option<(String, f64)> {
        let (vertex, distance) = self.mesh.nearest_vertex(Point::new(x, y))?;
        let slot = *self.mesh.sensors_at(vertex).first()?;
        Some((self.mesh.sensor_ids()[slot].clone(), distance))
    }

    /// Evaluate a grid, splitting rows across worker threads
    ///
    /// Column and row counts above `max_raster_resolution` are clamped; the
    /// returned raster's `spec` holds the grid actually evaluated.
    pub fn rasterize_region(&self, requested: &GridSpec) -> Raster {
        let limit = self.config.max_raster_resolution.max(1);
        let spec = &requested.clamped(limit);
        if spec != requested {
            log::warn!(
                "Raster {}x{} exceeds limit {}, serving {}x{}",
                requested.cols,
                requested.rows,
                limit,
                spec.cols,
                spec.rows
            );
        }
        let cols = spec.cols;
        let rows = spec.rows;
        let mut cells = vec![Estimate::NO_DATA; cols * rows];

        if !cells.is_empty() {
            let workers = match self.config.raster_workers {
                0 => num_cpus::get(),
                n => n,
            }
            .clamp(1, rows);

            if workers == 1 || cells.len() < PARALLEL_THRESHOLD {
                self.fill_rows(spec, 0, &mut cells);
            } else {
                let rows_per_chunk = (rows + workers - 1) / workers;
                std::thread::scope(|scope| {
                    for (chunk, out) in cells.chunks_mut(rows_per_chunk * cols).enumerate() {
                        scope.spawn(move || self.fill_rows(spec, chunk * rows_per_chunk, out));
                    }
                });
            }
        }

        Raster {
            spec: *spec,
            mesh_version: self.mesh.version(),
            cells,
        }
    }

    /// Fill consecutive rows starting at `first_row`
    ///
    /// Rows alternate direction so the warm-start walk never jumps across
    /// the field between consecutive cells.
    fn fill_rows(&self, spec: &GridSpec, first_row: usize, out: &mut [Estimate]) {
        let mut cursor = self.cursor();
        for (offset, row) in out.chunks_mut(spec.cols).enumerate() {
            let r = first_row + offset;
            let y = spec.y_at(r);
            if r % 2 == 0 {
                for (c, cell) in row.iter_mut().enumerate() {
                    *cell = cursor.estimate(Point::new(spec.x_at(c), y));
                }
            } else {
                for (c, cell) in row.iter_mut().enumerate().rev() {
                    *cell = cursor.estimate(Point::new(spec.x_at(c), y));
                }
            }
        }
    }
}

/// Point-query cursor carrying the last located triangle
#[derive(Debug)]
pub struct Cursor<'a> {
    snapshot: &'a FieldSnapshot,
    hint: Option<usize>,
}

impl<'a> Cursor<'a> {
    pub fn estimate(&mut self, p: Point) -> Estimate {
        let snapshot = self.snapshot;
        let mesh = &snapshot.mesh;
        let values = &snapshot.values;

        match mesh.locate(p, self.hint) {
            Location::Inside { triangle, weights } => {
                self.hint = Some(triangle);
                let vertices = mesh.triangles()[triangle].vertices;

                let mut weighted = 0.0;
                let mut support = 0.0;
                for (w, v) in weights.iter().zip(vertices) {
                    if let Some(value) = values.get(v) {
                        weighted += w * value;
                        support += w;
                    }
                }

                if support > 0.0 {
                    Estimate {
                        value: Some(weighted / support),
                        confidence: support.min(1.0),
                        method: EstimateMethod::Barycentric,
                    }
                } else {
                    let candidates: Vec<usize> = (0..mesh.vertex_count()).collect();
                    self.inverse_distance(p, &candidates, snapshot.config.extrapolated_confidence)
                }
            }
            Location::Outside => {
                let k = snapshot.config.idw_neighbors;
                let hull: Vec<usize> = mesh
                    .nearest_hull_vertices(p, mesh.hull().len())
                    .into_iter()
                    .map(|(v, _)| v)
                    .filter(|&v| values.get(v).is_some())
                    .take(k.max(1))
                    .collect();

                if hull.is_empty() {
                    let candidates: Vec<usize> = (0..mesh.vertex_count()).collect();
                    self.inverse_distance(p, &candidates, snapshot.config.extrapolated_confidence)
                } else {
                    self.inverse_distance(p, &hull, snapshot.config.extrapolated_confidence)
                }
            }
            Location::Untriangulated => self.nearest_neighbor(p),
        }
    }

    /// Inverse distance weighting over the `k` nearest valued candidates
    fn inverse_distance(&self, p: Point, candidates: &[usize], confidence: f64) -> Estimate {
        let snapshot = self.snapshot;
        let mut valued: Vec<(f64, f64)> = candidates
            .iter()
            .filter_map(|&v| {
                snapshot
                    .values
                    .get(v)
                    .map(|value| (snapshot.mesh.vertex(v).distance(p), value))
            })
            .collect();
        if valued.is_empty() {
            return Estimate::NO_DATA;
        }
        valued.sort_by(|a, b| a.0.total_cmp(&b.0));
        valued.truncate(snapshot.config.idw_neighbors.max(1));

        // Exact hit on a sample
        if valued[0].0 <= f64::EPSILON {
            return Estimate {
                value: Some(valued[0].1),
                confidence,
                method: EstimateMethod::InverseDistance,
            };
        }

        let power = snapshot.config.idw_power;
        let (sum, norm) = valued.iter().fold((0.0, 0.0), |(s, n), &(d, value)| {
            let w = 1.0 / libm::pow(d, power);
            (s + w * value, n + w)
        });

        Estimate {
            value: Some(sum / norm),
            confidence,
            method: EstimateMethod::InverseDistance,
        }
    }

    fn nearest_neighbor(&self, p: Point) -> Estimate {
        let snapshot = self.snapshot;
        let nearest = (0..snapshot.mesh.vertex_count())
            .filter_map(|v| {
                snapshot
                    .values
                    .get(v)
                    .map(|value| (snapshot.mesh.vertex(v).distance(p), value))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match nearest {
            Some((_, value)) => Estimate {
                value: Some(value),
                confidence: snapshot.config.degraded_confidence,
                method: EstimateMethod::NearestNeighbor,
            },
            None => Estimate::NO_DATA,
        }
    }
}

/// Grid layout for rasterization
///
/// Samples sit on grid nodes: the first and last column lie exactly on the
/// bounds, so a raster over the mesh bounding box touches the extreme sensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSpec {
    pub bounds: Bounds,
    pub cols: usize,
    pub rows: usize,
}

impl GridSpec {
    pub fn new(bounds: Bounds, cols: usize, rows: usize) -> Self {
        Self { bounds, cols, rows }
    }

    /// Square grid over `bounds`
    pub fn square(bounds: Bounds, resolution: usize) -> Self {
        Self::new(bounds, resolution, resolution)
    }

    /// Same bounds with both axes capped at `limit` samples
    pub fn clamped(&self, limit: usize) -> Self {
        Self::new(self.bounds, self.cols.min(limit), self.rows.min(limit))
    }

    pub fn x_at(&self, col: usize) -> f64 {
        axis(self.bounds.min_x, self.bounds.max_x, col, self.cols)
    }

    pub fn y_at(&self, row: usize) -> f64 {
        axis(self.bounds.min_y, self.bounds.max_y, row, self.rows)
    }
}

fn axis(min: f64, max: f64, i: usize, n: usize) -> f64 {
    if n <= 1 {
        (min + max) / 2.0
    } else {
        min + (max - min) * i as f64 / (n - 1) as f64
    }
}

/// Rasterized field, row-major with row 0 at `min_y`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Raster {
    pub spec: GridSpec,
    pub mesh_version: u64,
    pub cells: Vec<Estimate>,
}

impl Raster {
    pub fn get(&self, col: usize, row: usize) -> Option<&Estimate> {
        if col >= self.spec.cols || row >= self.spec.rows {
            return None;
        }
        self.cells.get(row * self.spec.cols + col)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Estimate]> {
        self.cells.chunks(self.spec.cols.max(1))
    }

    /// Hottest cell value
    pub fn max_value(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.value)
            .max_by(|a, b| a.total_cmp(b))
    }
}

/// Owner of the published field
///
/// One writer (the pipeline's interpolation updater) calls
/// [`rebuild_mesh`](Self::rebuild_mesh) and [`apply_readings`](Self::apply_readings);
/// any number of readers query concurrently.
#[derive(Debug)]
pub struct InterpolationEngine {
    config: MeshConfig,
    current: RwLock<Arc<FieldSnapshot>>,

    /// Newest (timestamp, value) per sensor id, guarded for the writer side
    latest: Mutex<HashMap<String, (Timestamp, f64)>>,

    next_mesh_version: AtomicU64,

    /// Registry geometry version the current mesh was built from
    geometry_seen: AtomicU64,

    metrics: Arc<PipelineMetrics>,
}

impl InterpolationEngine {
    pub fn new(config: &MeshConfig, metrics: Arc<PipelineMetrics>) -> Self {
        let mesh = Arc::new(Mesh::empty(0));
        let values = Arc::new(ValueVector::compute(&mesh, &HashMap::new()));
        Self {
            config: config.clone(),
            current: RwLock::new(Arc::new(FieldSnapshot {
                mesh,
                values,
                config: config.clone(),
            })),
            latest: Mutex::new(HashMap::new()),
            next_mesh_version: AtomicU64::new(1),
            geometry_seen: AtomicU64::new(u64::MAX),
            metrics,
        }
    }

    /// Current snapshot; never blocks behind a rebuild
    pub fn snapshot(&self) -> Arc<FieldSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, snapshot: FieldSnapshot) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::new(snapshot);
    }

    /// Triangulate a new sensor geometry and publish it
    ///
    /// Values carry over by sensor id. A degenerate geometry is still
    /// published (queries degrade to nearest neighbor) and reported as
    /// `InsufficientGeometry`. Returns the new mesh version.
    pub fn rebuild_mesh(&self, sensors: &[(String, Position)]) -> TelemetryResult<u64> {
        let started = Instant::now();
        let version = self.next_mesh_version.fetch_add(1, Ordering::Relaxed);
        let mesh = Arc::new(Mesh::build(version, sensors, self.config.coincident_epsilon));

        {
            let mut latest = lock(&self.latest);
            latest.retain(|id, _| mesh.vertex_of(id).is_some());
            let values = Arc::new(ValueVector::compute(&mesh, &latest));
            self.publish(FieldSnapshot {
                mesh: mesh.clone(),
                values,
                config: self.config.clone(),
            });
        }

        self.metrics.record_mesh_rebuild(started.elapsed());
        match mesh.check() {
            Ok(()) => {
                log::info!(
                    "Mesh v{} built: {} vertices, {} triangles in {:?}",
                    version,
                    mesh.vertex_count(),
                    mesh.triangles().len(),
                    started.elapsed()
                );
                Ok(version)
            }
            Err(err) => {
                log::warn!("Mesh v{} degenerate: {}", version, err);
                Err(err)
            }
        }
    }

    /// Rebuild when the registry geometry moved since the last build
    ///
    /// `None` when nothing changed.
    pub fn sync_geometry(&self, registry: &SensorRegistry) -> Option<TelemetryResult<u64>> {
        let geometry = registry.geometry_version();
        if self.geometry_seen.swap(geometry, Ordering::AcqRel) == geometry {
            return None;
        }
        Some(self.rebuild_mesh(&registry.positions()))
    }

    /// Fold a batch of accepted readings into one new value vector
    ///
    /// The newest reading per sensor wins. A reading older than the one
    /// already held for its sensor is ignored, so a late arrival never
    /// replaces a fresher value. Returns the mesh version the values were
    /// published for.
    pub fn apply_readings(&self, readings: &[Reading]) -> u64 {
        let mut latest = lock(&self.latest);
        let current = self.snapshot();
        for reading in readings {
            if current.mesh.vertex_of(&reading.sensor_id).is_none() {
                continue;
            }
            match latest.get_mut(&reading.sensor_id) {
                Some(held) if held.0 > reading.timestamp => {
                    log::debug!(
                        "Stale reading for {} at {} ignored (holding {})",
                        reading.sensor_id,
                        reading.timestamp,
                        held.0
                    );
                }
                Some(held) => *held = (reading.timestamp, reading.value),
                None => {
                    latest.insert(reading.sensor_id.clone(), (reading.timestamp, reading.value));
                }
            }
        }

        let values = Arc::new(ValueVector::compute(&current.mesh, &latest));
        let version = current.mesh.version();
        self.publish(FieldSnapshot {
            mesh: current.mesh.clone(),
            values,
            config: self.config.clone(),
        });
        drop(latest);

        self.metrics.record_value_publish();
        version
    }

    /// Temperature estimate at `(x, y)`
    pub fn interpolate(&self, x: f64, y: f64) -> Estimate {
        let estimate = self.snapshot().interpolate(x, y);
        if estimate.is_degraded() {
            self.metrics.record_degraded_query();
            log::debug!("Degraded estimate at ({}, {})", x, y);
        }
        estimate
    }

    /// `resolution × resolution` grid over the mesh bounding box
    pub fn rasterize(&self, resolution: usize) -> Raster {
        let snapshot = self.snapshot();
        let bounds = snapshot.mesh.bounds().unwrap_or(Bounds {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 0.0,
            max_y: 0.0,
        });
        self.rasterize_with(&snapshot, &GridSpec::square(bounds, resolution))
    }

    /// Grid over explicit bounds
    pub fn rasterize_region(&self, spec: &GridSpec) -> Raster {
        self.rasterize_with(&self.snapshot(), spec)
    }

    fn rasterize_with(&self, snapshot: &FieldSnapshot, spec: &GridSpec) -> Raster {
        let raster = snapshot.rasterize_region(spec);
        if !snapshot.mesh.is_triangulated() && raster.cells.iter().any(Estimate::is_degraded) {
            self.metrics.record_degraded_query();
        }
        raster
    }

    pub fn nearest_sensor(&self, x: f64, y: f64) -> Option<(String, f64)> {
        self.snapshot().nearest_sensor(x, y)
    }
}
