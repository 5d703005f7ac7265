//! Spatial Mesh
//!
//! ## Overview
//!
//! An immutable Delaunay triangulation over the planar positions of the
//! registered sensors. The topology depends only on positions, never on
//! values, so a mesh is built once per geometry change and then shared by
//! every query until the next rebuild.
//!
//! ## Construction
//!
//! ```text
//!   1. merge coincident positions into one vertex
//!   2. normalize coordinates into the unit square
//!   3. sweep in (x, y) order: each new point lies outside the current
//!      hull, so connect it to every hull edge that can see it
//!   4. Lawson flips until every interior edge is locally Delaunay
//!   5. adjacency + uniform grid index for cold point location
//! ```
//!
//! The sweep covers exactly the convex hull of the input by construction, so
//! no super-triangle cleanup or concavity filling is needed.
//!
//! ## Point Location
//!
//! A visibility walk: from a start triangle, cross any edge that has the
//! query point strictly on its outer side. Crossing a hull edge means the
//! point is outside the hull. The start is either the caller's previous
//! result (warm start, typical for rasterization) or the triangle registered
//! in the grid cell of the query (cold start).
//!
//! ## Degenerate Input
//!
//! Fewer than three distinct positions, or all positions collinear, leaves
//! the mesh with vertices but no triangles. [`Mesh::check`] reports this as
//! `InsufficientGeometry`; queries fall back to the nearest vertex.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::errors::{TelemetryError, TelemetryResult};
use crate::reading::Position;

/// Orientation tolerance in normalized (unit square) coordinates
const ORIENT_EPS: f64 = 1e-12;

/// In-circle tolerance in normalized coordinates
const INCIRCLE_EPS: f64 = 1e-12;

/// Planar point
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(&self, other: Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(&self, other: Point) -> f64 {
        libm::sqrt(self.distance_squared(other))
    }
}

impl From<Position> for Point {
    fn from(position: Position) -> Self {
        Self::new(position.x, position.y)
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Bounding box of a point set, `None` when empty
    pub fn of(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut bounds = Bounds {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        for p in &points[1..] {
            bounds.min_x = bounds.min_x.min(p.x);
            bounds.min_y = bounds.min_y.min(p.y);
            bounds.max_x = bounds.max_x.max(p.x);
            bounds.max_y = bounds.max_y.max(p.y);
        }
        Some(bounds)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

/// One mesh triangle
///
/// Vertices are counter-clockwise. `neighbors[i]` is the triangle across the
/// edge opposite `vertices[i]`, `None` on the hull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triangle {
    pub vertices: [usize; 3],
    pub neighbors: [Option<usize>; 3],
}

/// Why a point set could not be triangulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Degeneracy {
    /// Distinct positions after merging coincident sensors
    pub distinct: usize,
    /// Three or more distinct positions, all on one line
    pub collinear: bool,
}

impl Degeneracy {
    pub fn to_error(self) -> TelemetryError {
        TelemetryError::InsufficientGeometry {
            distinct: self.distinct,
            collinear: self.collinear,
        }
    }
}

/// Result of a point-location query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    /// Inside (or on the boundary of) a triangle
    Inside {
        triangle: usize,
        /// Barycentric weights matching `vertices`, non-negative, sum 1
        weights: [f64; 3],
    },
    /// Outside the convex hull
    Outside,
    /// The mesh has no triangles
    Untriangulated,
}

/// Immutable triangulation of the sensor field
#[derive(Debug, Clone)]
pub struct Mesh {
    version: u64,

    /// Registered sensor ids, sorted
    sensor_ids: Vec<String>,

    /// Vertex index for each entry of `sensor_ids`
    sensor_vertex: Vec<usize>,

    /// Sensor slots merged into each vertex
    vertex_sensors: Vec<Vec<usize>>,

    vertices: Vec<Point>,
    triangles: Vec<Triangle>,

    /// Hull vertex indices, counter-clockwise
    hull: Vec<usize>,

    bounds: Option<Bounds>,

    /// Square of the larger bounds side, scales orientation tolerances
    scale_sq: f64,

    index: Option<TriangleIndex>,
    degeneracy: Option<Degeneracy>,
}

impl Mesh {
    /// Mesh with no sensors
    pub fn empty(version: u64) -> Self {
        Self::build(version, &[], 0.0)
    }

    /// Triangulate the given sensors
    ///
    /// Never fails: a degenerate set produces a vertex-only mesh whose
    /// [`check`](Self::check) reports `InsufficientGeometry`.
    pub fn build(version: u64, sensors: &[(String, Position)], coincident_epsilon: f64) -> Self {
        let mut sorted: Vec<&(String, Position)> = sensors.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted.dedup_by(|a, b| a.0 == b.0);

        let mut vertices: Vec<Point> = Vec::with_capacity(sorted.len());
        let mut vertex_sensors: Vec<Vec<usize>> = Vec::with_capacity(sorted.len());
        let mut sensor_ids = Vec::with_capacity(sorted.len());
        let mut sensor_vertex = Vec::with_capacity(sorted.len());

        for (slot, (id, position)) in sorted.into_iter().enumerate() {
            let p = Point::from(*position);
            let existing = vertices
                .iter()
                .position(|v| v.distance(p) <= coincident_epsilon);
            let vertex = match existing {
                Some(v) => {
                    vertex_sensors[v].push(slot);
                    v
                }
                None => {
                    vertices.push(p);
                    vertex_sensors.push(vec![slot]);
                    vertices.len() - 1
                }
            };
            sensor_ids.push(id.clone());
            sensor_vertex.push(vertex);
        }

        let bounds = Bounds::of(&vertices);
        let span = bounds.map(|b| b.width().max(b.height())).unwrap_or(0.0);

        let (triangles, hull, degeneracy) = match triangulate(&vertices, bounds, span) {
            Ok((tris, hull)) => (with_adjacency(&tris), hull, None),
            Err(degeneracy) => (Vec::new(), Vec::new(), Some(degeneracy)),
        };

        let index = match bounds {
            Some(b) if !triangles.is_empty() => Some(TriangleIndex::build(b, &vertices, &triangles)),
            _ => None,
        };

        Self {
            version,
            sensor_ids,
            sensor_vertex,
            vertex_sensors,
            vertices,
            triangles,
            hull,
            bounds,
            scale_sq: (span * span).max(f64::MIN_POSITIVE),
            index,
            degeneracy,
        }
    }

    /// `InsufficientGeometry` when the mesh could not be triangulated
    pub fn check(&self) -> TelemetryResult<()> {
        match self.degeneracy {
            Some(d) => Err(d.to_error()),
            None => Ok(()),
        }
    }

    pub fn degeneracy(&self) -> Option<Degeneracy> {
        self.degeneracy
    }

    pub fn is_triangulated(&self) -> bool {
        !self.triangles.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn vertex(&self, index: usize) -> Point {
        self.vertices[index]
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn hull(&self) -> &[usize] {
        &self.hull
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn sensor_ids(&self) -> &[String] {
        &self.sensor_ids
    }

    /// Vertex carrying a sensor
    pub fn vertex_of(&self, sensor_id: &str) -> Option<usize> {
        self.sensor_ids
            .binary_search_by(|id| id.as_str().cmp(sensor_id))
            .ok()
            .map(|slot| self.sensor_vertex[slot])
    }

    /// Sensor slots (indices into `sensor_ids`) sharing a vertex
    pub fn sensors_at(&self, vertex: usize) -> &[usize] {
        &self.vertex_sensors[vertex]
    }

    /// Locate the triangle containing `p`
    ///
    /// `hint` is a triangle index from a previous query; a stale or invalid
    /// hint only costs a longer walk.
    pub fn locate(&self, p: Point, hint: Option<usize>) -> Location {
        let index = match &self.index {
            Some(index) => index,
            None => return Location::Untriangulated,
        };

        let tol = ORIENT_EPS * self.scale_sq;
        let mut current = hint
            .filter(|&t| t < self.triangles.len())
            .unwrap_or_else(|| index.start(p));

        // A walk on a Delaunay mesh never revisits a triangle
        for _ in 0..=self.triangles.len() {
            let tri = &self.triangles[current];
            let mut next = None;
            for i in 0..3 {
                let b = self.vertices[tri.vertices[(i + 1) % 3]];
                let c = self.vertices[tri.vertices[(i + 2) % 3]];
                if orient(b, c, p) < -tol {
                    match tri.neighbors[i] {
                        Some(n) => next = Some(n),
                        None => return Location::Outside,
                    }
                    break;
                }
            }
            match next {
                Some(n) => current = n,
                None => {
                    return Location::Inside {
                        triangle: current,
                        weights: self.barycentric(current, p),
                    }
                }
            }
        }

        log::debug!("Point walk did not settle at ({}, {}), scanning", p.x, p.y);
        self.locate_exhaustive(p, tol)
    }

    fn locate_exhaustive(&self, p: Point, tol: f64) -> Location {
        for (t, tri) in self.triangles.iter().enumerate() {
            let inside = (0..3).all(|i| {
                let b = self.vertices[tri.vertices[(i + 1) % 3]];
                let c = self.vertices[tri.vertices[(i + 2) % 3]];
                orient(b, c, p) >= -tol
            });
            if inside {
                return Location::Inside {
                    triangle: t,
                    weights: self.barycentric(t, p),
                };
            }
        }
        Location::Outside
    }

    /// Barycentric weights of `p` in triangle `t`
    ///
    /// Clamped to be non-negative and renormalized, so points on an edge
    /// within tolerance never produce an overshooting combination. A query
    /// exactly at a vertex gets a unit weight.
    pub fn barycentric(&self, t: usize, p: Point) -> [f64; 3] {
        let [ia, ib, ic] = self.triangles[t].vertices;
        let (a, b, c) = (self.vertices[ia], self.vertices[ib], self.vertices[ic]);

        if p == a {
            return [1.0, 0.0, 0.0];
        }
        if p == b {
            return [0.0, 1.0, 0.0];
        }
        if p == c {
            return [0.0, 0.0, 1.0];
        }

        let area = orient(a, b, c);
        let mut w = [
            (orient(b, c, p) / area).max(0.0),
            (orient(c, a, p) / area).max(0.0),
            (orient(a, b, p) / area).max(0.0),
        ];
        let sum = w[0] + w[1] + w[2];
        if sum > 0.0 {
            for weight in &mut w {
                *weight /= sum;
            }
        } else {
            w = [1.0 / 3.0; 3];
        }
        w
    }

    /// Closest vertex to `p`
    pub fn nearest_vertex(&self, p: Point) -> Option<(usize, f64)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (i, v.distance(p)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// The `k` hull vertices closest to `p`, nearest first
    pub fn nearest_hull_vertices(&self, p: Point, k: usize) -> Vec<(usize, f64)> {
        let mut candidates: Vec<(usize, f64)> = self
            .hull
            .iter()
            .map(|&v| (v, self.vertices[v].distance(p)))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
        candidates.truncate(k.max(1));
        candidates
    }
}

/// Twice the signed area of `abc`, positive when counter-clockwise
fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Positive when `d` lies inside the circumcircle of counter-clockwise `abc`
fn in_circle(a: Point, b: Point, c: Point, d: Point) -> f64 {
    let (adx, ady) = (a.x - d.x, a.y - d.y);
    let (bdx, bdy) = (b.x - d.x, b.y - d.y);
    let (cdx, cdy) = (c.x - d.x, c.y - d.y);

    let ad = adx * adx + ady * ady;
    let bd = bdx * bdx + bdy * bdy;
    let cd = cdx * cdx + cdy * cdy;

    ad * (bdx * cdy - cdx * bdy) - bd * (adx * cdy - cdx * ady) + cd * (adx * bdy - bdx * ady)
}

type Triangulation = (Vec<[usize; 3]>, Vec<usize>);

/// Sweep-hull triangulation followed by Lawson flips
fn triangulate(
    vertices: &[Point],
    bounds: Option<Bounds>,
    span: f64,
) -> Result<Triangulation, Degeneracy> {
    let n = vertices.len();
    let bounds = match bounds {
        Some(b) if n >= 3 && span > 0.0 => b,
        _ => return Err(Degeneracy { distinct: n, collinear: false }),
    };

    let points: Vec<Point> = vertices
        .iter()
        .map(|v| Point::new((v.x - bounds.min_x) / span, (v.y - bounds.min_y) / span))
        .collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        points[a]
            .x
            .total_cmp(&points[b].x)
            .then(points[a].y.total_cmp(&points[b].y))
    });

    // Seed: the leading collinear run plus the first point off its line
    let (first, second) = (points[order[0]], points[order[1]]);
    let apex_at = (2..n)
        .find(|&k| orient(first, second, points[order[k]]).abs() > ORIENT_EPS)
        .ok_or(Degeneracy { distinct: n, collinear: true })?;
    let apex = order[apex_at];
    let chain = &order[..apex_at];
    let ccw = orient(first, second, points[apex]) > 0.0;

    let mut triangles: Vec<[usize; 3]> = Vec::with_capacity(2 * n);
    for pair in chain.windows(2) {
        triangles.push(if ccw {
            [pair[0], pair[1], apex]
        } else {
            [pair[1], pair[0], apex]
        });
    }
    let mut hull: Vec<usize> = if ccw {
        chain.to_vec()
    } else {
        chain.iter().rev().copied().collect()
    };
    hull.push(apex);

    for &q in &order[apex_at + 1..] {
        let h = hull.len();
        let visible: Vec<bool> = (0..h)
            .map(|i| orient(points[hull[i]], points[hull[(i + 1) % h]], points[q]) < -ORIENT_EPS)
            .collect();

        let start = match (0..h).find(|&i| visible[i] && !visible[(i + h - 1) % h]) {
            Some(start) => start,
            None => {
                match split_hull_edge(&points, &mut triangles, &hull, q) {
                    Some(edge) => hull.insert(edge + 1, q),
                    None => log::warn!("Mesh vertex {} on the hull but on no edge, skipped", q),
                }
                continue;
            }
        };

        let mut end = start;
        while visible[(end + 1) % h] && (end + 1) % h != start {
            end = (end + 1) % h;
        }

        let mut i = start;
        loop {
            triangles.push([hull[(i + 1) % h], hull[i], q]);
            if i == end {
                break;
            }
            i = (i + 1) % h;
        }

        let mut next = Vec::with_capacity(h + 1);
        let mut j = (end + 1) % h;
        loop {
            next.push(hull[j]);
            if j == start {
                break;
            }
            j = (j + 1) % h;
        }
        next.push(q);
        hull = next;
    }

    legalize(&points, &mut triangles);
    Ok((triangles, hull))
}

/// Insert `q`, which sits on a hull edge within tolerance, by splitting
/// that edge's triangle in two
///
/// Returns the index in `hull` of the split edge's first vertex.
fn split_hull_edge(
    points: &[Point],
    triangles: &mut Vec<[usize; 3]>,
    hull: &[usize],
    q: usize,
) -> Option<usize> {
    let h = hull.len();
    let p = points[q];
    let edge = (0..h)
        .filter(|&i| {
            let (a, b) = (points[hull[i]], points[hull[(i + 1) % h]]);
            let (dx, dy) = (b.x - a.x, b.y - a.y);
            let along = (p.x - a.x) * dx + (p.y - a.y) * dy;
            orient(a, b, p).abs() <= ORIENT_EPS && along > 0.0 && along < dx * dx + dy * dy
        })
        .min_by(|&i, &j| {
            let off = |k: usize| orient(points[hull[k]], points[hull[(k + 1) % h]], p).abs();
            off(i).total_cmp(&off(j))
        })?;

    let (a, b) = (hull[edge], hull[(edge + 1) % h]);
    let (t, r) = triangles.iter().enumerate().find_map(|(t, &tri)| {
        (0..3)
            .find(|&r| tri[r] == a && tri[(r + 1) % 3] == b)
            .map(|r| (t, r))
    })?;
    let c = rotate(triangles[t], r)[2];
    triangles[t] = [a, q, c];
    triangles.push([q, b, c]);
    Some(edge)
}

fn rotate(tri: [usize; 3], i: usize) -> [usize; 3] {
    [tri[i], tri[(i + 1) % 3], tri[(i + 2) % 3]]
}

/// Directed edge `(u, v)` → (triangle, index of the vertex opposite it)
fn directed_edges(triangles: &[[usize; 3]]) -> HashMap<(usize, usize), (usize, usize)> {
    let mut edges = HashMap::with_capacity(triangles.len() * 3);
    for (t, tri) in triangles.iter().enumerate() {
        for i in 0..3 {
            edges.insert((tri[(i + 1) % 3], tri[(i + 2) % 3]), (t, i));
        }
    }
    edges
}

/// Flip edges until every interior edge is locally Delaunay
fn legalize(points: &[Point], triangles: &mut [[usize; 3]]) {
    let max_passes = 4 * triangles.len() + 16;

    for _ in 0..max_passes {
        let edges = directed_edges(triangles);
        let mut touched = vec![false; triangles.len()];
        let mut flips = 0usize;

        for t in 0..triangles.len() {
            for i in 0..3 {
                if touched[t] {
                    break;
                }
                let [a, b, c] = rotate(triangles[t], i);
                let (u, j) = match edges.get(&(c, b)) {
                    Some(&(u, j)) if !touched[u] => (u, j),
                    _ => continue,
                };
                let d = triangles[u][j];

                let (pa, pb, pc, pd) = (points[a], points[b], points[c], points[d]);
                if in_circle(pa, pb, pc, pd) > INCIRCLE_EPS
                    && orient(pa, pb, pd) > ORIENT_EPS
                    && orient(pa, pd, pc) > ORIENT_EPS
                {
                    triangles[t] = [a, b, d];
                    triangles[u] = [a, d, c];
                    touched[t] = true;
                    touched[u] = true;
                    flips += 1;
                }
            }
        }

        if flips == 0 {
            return;
        }
    }

    log::warn!("Edge flipping did not converge, mesh may not be fully Delaunay");
}

fn with_adjacency(triangles: &[[usize; 3]]) -> Vec<Triangle> {
    let edges = directed_edges(triangles);
    triangles
        .iter()
        .map(|tri| {
            let mut neighbors = [None; 3];
            for (i, neighbor) in neighbors.iter_mut().enumerate() {
                let (b, c) = (tri[(i + 1) % 3], tri[(i + 2) % 3]);
                *neighbor = edges.get(&(c, b)).map(|&(u, _)| u);
            }
            Triangle {
                vertices: *tri,
                neighbors,
            }
        })
        .collect()
}

/// Uniform grid of start triangles for cold point location
#[derive(Debug, Clone)]
struct TriangleIndex {
    bounds: Bounds,
    cols: usize,
    rows: usize,
    cells: Vec<usize>,
}

impl TriangleIndex {
    fn build(bounds: Bounds, vertices: &[Point], triangles: &[Triangle]) -> Self {
        let side = ((triangles.len() as f64 / 2.0).sqrt().ceil() as usize).clamp(1, 256);
        let (cols, rows) = (side, side);
        let mut slots: Vec<Option<usize>> = vec![None; cols * rows];

        let mut index = Self {
            bounds,
            cols,
            rows,
            cells: Vec::new(),
        };

        for (t, tri) in triangles.iter().enumerate() {
            let [a, b, c] = tri.vertices.map(|v| vertices[v]);
            let centroid = Point::new((a.x + b.x + c.x) / 3.0, (a.y + b.y + c.y) / 3.0);
            slots[index.cell_of(centroid)] = Some(t);
        }

        // Empty cells borrow the triangle of the nearest filled cell
        let mut queue: VecDeque<usize> = (0..slots.len()).filter(|&i| slots[i].is_some()).collect();
        while let Some(cell) = queue.pop_front() {
            let (col, row) = (cell % cols, cell / cols);
            let filled = slots[cell];
            let mut neighbors = Vec::with_capacity(4);
            if col > 0 {
                neighbors.push(cell - 1);
            }
            if col + 1 < cols {
                neighbors.push(cell + 1);
            }
            if row > 0 {
                neighbors.push(cell - cols);
            }
            if row + 1 < rows {
                neighbors.push(cell + cols);
            }
            for n in neighbors {
                if slots[n].is_none() {
                    slots[n] = filled;
                    queue.push_back(n);
                }
            }
        }

        index.cells = slots.into_iter().map(|s| s.unwrap_or(0)).collect();
        index
    }

    fn cell_of(&self, p: Point) -> usize {
        let fx = if self.bounds.width() > 0.0 {
            (p.x - self.bounds.min_x) / self.bounds.width()
        } else {
            0.0
        };
        let fy = if self.bounds.height() > 0.0 {
            (p.y - self.bounds.min_y) / self.bounds.height()
        } else {
            0.0
        };
        let col = ((fx * self.cols as f64) as isize).clamp(0, self.cols as isize - 1) as usize;
        let row = ((fy * self.rows as f64) as isize).clamp(0, self.rows as isize - 1) as usize;
        row * self.cols + col
    }

    fn start(&self, p: Point) -> usize {
        self.cells[self.cell_of(p)]
    }
}
