//! Navigation surface collaborator.
//!
//! Stages only see the [`NavigationSurface`] trait: path queries and point
//! projection. [`NavGrid`] is a cell-grid implementation with A* search used
//! by tests, demos and hosts without their own navmesh. [`PathJobs`] runs path
//! queries on a worker thread for the background pathfinding mode.

use bevy_ecs::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Result of projecting a point onto the navigable surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavProjection {
    pub location: Vec3,
    /// The projected point lies in an obstacle-tagged area.
    pub dirty: bool,
}

pub trait NavigationSurface: Send + Sync {
    /// Ordered waypoints from `start` to `goal`, starting with `start`.
    fn find_path(&self, start: Vec3, goal: Vec3) -> Option<Vec<Vec3>>;

    /// Nearest navigable point within `extent` (half-size per axis).
    fn project_point(&self, point: Vec3, extent: Vec3) -> Option<NavProjection>;
}

/// Resource handle to the active navigation surface.
#[derive(Resource, Clone)]
pub struct NavigationResource(pub Arc<dyn NavigationSurface>);

impl NavigationResource {
    pub fn new(surface: impl NavigationSurface + 'static) -> Self {
        Self(Arc::new(surface))
    }
}

// ============================================================================
// GRID SURFACE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NavCell {
    #[default]
    Walkable,
    /// Navigable but covered by a dynamic obstacle or modifier.
    Dirty,
    Blocked,
}

/// Uniform grid of navigation cells on a flat surface at height `surface_z`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavGrid {
    pub width: usize,
    pub height: usize,
    pub cell_size: f32,
    /// World position of the min corner of cell (0, 0).
    pub origin_x: f32,
    pub origin_y: f32,
    pub surface_z: f32,
    cells: Vec<NavCell>,
}

impl NavGrid {
    pub fn new(width: usize, height: usize, cell_size: f32, origin_x: f32, origin_y: f32) -> Self {
        Self {
            width,
            height,
            cell_size,
            origin_x,
            origin_y,
            surface_z: 0.0,
            cells: vec![NavCell::Walkable; width * height],
        }
    }

    /// Grid centered on the world origin.
    pub fn centered(width: usize, height: usize, cell_size: f32) -> Self {
        let ox = -(width as f32) * cell_size * 0.5;
        let oy = -(height as f32) * cell_size * 0.5;
        Self::new(width, height, cell_size, ox, oy)
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<NavCell> {
        if x < self.width && y < self.height {
            Some(self.cells[y * self.width + x])
        } else {
            None
        }
    }

    pub fn set_cell(&mut self, x: usize, y: usize, cell: NavCell) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = cell;
        }
    }

    /// Mark every cell whose center lies inside the rectangle.
    pub fn fill_rect(&mut self, min: (f32, f32), max: (f32, f32), cell: NavCell) {
        for y in 0..self.height {
            for x in 0..self.width {
                let c = self.cell_center(x, y);
                if c.x >= min.0 && c.x <= max.0 && c.y >= min.1 && c.y <= max.1 {
                    self.set_cell(x, y, cell);
                }
            }
        }
    }

    pub fn world_to_cell(&self, point: Vec3) -> Option<(usize, usize)> {
        let fx = ((point.x - self.origin_x) / self.cell_size).floor();
        let fy = ((point.y - self.origin_y) / self.cell_size).floor();
        if fx < 0.0 || fy < 0.0 {
            return None;
        }
        let (x, y) = (fx as usize, fy as usize);
        (x < self.width && y < self.height).then_some((x, y))
    }

    pub fn cell_center(&self, x: usize, y: usize) -> Vec3 {
        Vec3::new(
            self.origin_x + (x as f32 + 0.5) * self.cell_size,
            self.origin_y + (y as f32 + 0.5) * self.cell_size,
            self.surface_z,
        )
    }

    fn passable(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 {
            return false;
        }
        matches!(
            self.cell(x as usize, y as usize),
            Some(NavCell::Walkable) | Some(NavCell::Dirty)
        )
    }

    /// Closest non-blocked cell center to `point` inside the horizontal extent.
    fn nearest_open_cell(&self, point: Vec3, extent: Vec3) -> Option<(usize, usize)> {
        let reach = (extent.x.max(extent.y) / self.cell_size).ceil() as i64;
        let cx = ((point.x - self.origin_x) / self.cell_size).floor() as i64;
        let cy = ((point.y - self.origin_y) / self.cell_size).floor() as i64;

        let mut best: Option<((usize, usize), f32)> = None;
        for y in (cy - reach)..=(cy + reach) {
            for x in (cx - reach)..=(cx + reach) {
                if !self.passable(x, y) {
                    continue;
                }
                let (ux, uy) = (x as usize, y as usize);
                let center = self.cell_center(ux, uy);
                let d = center - point;
                if d.x.abs() > extent.x + self.cell_size * 0.5 || d.y.abs() > extent.y + self.cell_size * 0.5 {
                    continue;
                }
                let dist_sq = d.truncate().length_squared();
                if best.map(|(_, b)| dist_sq < b).unwrap_or(true) {
                    best = Some(((ux, uy), dist_sq));
                }
            }
        }
        best.map(|(cell, _)| cell)
    }

    /// A* over 8-connected cells. Diagonals may not cut blocked corners.
    fn search(&self, start: (usize, usize), goal: (usize, usize)) -> Option<Vec<(usize, usize)>> {
        let index = |c: (usize, usize)| c.1 * self.width + c.0;
        let heuristic = |c: (usize, usize)| {
            let dx = c.0 as f32 - goal.0 as f32;
            let dy = c.1 as f32 - goal.1 as f32;
            (dx * dx + dy * dy).sqrt()
        };

        let mut open = BinaryHeap::new();
        let mut came_from: HashMap<usize, (usize, usize)> = HashMap::new();
        let mut g_score: HashMap<usize, f32> = HashMap::new();
        g_score.insert(index(start), 0.0);
        open.push(OpenNode { cost: heuristic(start), cell: start });

        while let Some(OpenNode { cell, .. }) = open.pop() {
            if cell == goal {
                let mut path = vec![cell];
                let mut current = cell;
                while let Some(&prev) = came_from.get(&index(current)) {
                    path.push(prev);
                    current = prev;
                }
                path.reverse();
                return Some(path);
            }
            let g = g_score.get(&index(cell)).copied().unwrap_or(f32::INFINITY);
            for (dx, dy) in NEIGHBORS {
                let nx = cell.0 as i64 + dx;
                let ny = cell.1 as i64 + dy;
                if !self.passable(nx, ny) {
                    continue;
                }
                if dx != 0 && dy != 0
                    && (!self.passable(cell.0 as i64 + dx, cell.1 as i64) || !self.passable(cell.0 as i64, cell.1 as i64 + dy))
                {
                    continue;
                }
                let next = (nx as usize, ny as usize);
                let step = if dx != 0 && dy != 0 { std::f32::consts::SQRT_2 } else { 1.0 };
                let tentative = g + step;
                if tentative < g_score.get(&index(next)).copied().unwrap_or(f32::INFINITY) {
                    came_from.insert(index(next), cell);
                    g_score.insert(index(next), tentative);
                    open.push(OpenNode { cost: tentative + heuristic(next), cell: next });
                }
            }
        }
        None
    }
}

const NEIGHBORS: [(i64, i64); 8] = [(1, 0), (-1, 0), (0, 1), (0, -1), (1, 1), (1, -1), (-1, 1), (-1, -1)];

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    cost: f32,
    cell: (usize, usize),
}

impl PartialEq for OpenNode {
    fn eq(&self, other: &Self) -> bool {
        self.cost.total_cmp(&other.cost) == Ordering::Equal
    }
}

impl Eq for OpenNode {}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenNode {
    // Reversed so the heap pops the cheapest node.
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost)
    }
}

impl NavigationSurface for NavGrid {
    fn find_path(&self, start: Vec3, goal: Vec3) -> Option<Vec<Vec3>> {
        let probe = Vec3::new(self.cell_size, self.cell_size, f32::MAX);
        let start_cell = self.nearest_open_cell(start, probe)?;
        let goal_cell = self.nearest_open_cell(goal, probe)?;
        let cells = self.search(start_cell, goal_cell)?;

        // Keep only the corners of the cell chain.
        let mut waypoints = vec![start];
        for window in cells.windows(3) {
            let (a, b, c) = (window[0], window[1], window[2]);
            let d1 = (b.0 as i64 - a.0 as i64, b.1 as i64 - a.1 as i64);
            let d2 = (c.0 as i64 - b.0 as i64, c.1 as i64 - b.1 as i64);
            if d1 != d2 {
                waypoints.push(self.cell_center(b.0, b.1));
            }
        }
        waypoints.push(Vec3::new(goal.x, goal.y, self.surface_z));
        Some(waypoints)
    }

    fn project_point(&self, point: Vec3, extent: Vec3) -> Option<NavProjection> {
        if (point.z - self.surface_z).abs() > extent.z {
            return None;
        }
        if let Some((x, y)) = self.world_to_cell(point) {
            match self.cell(x, y) {
                Some(NavCell::Walkable) => {
                    return Some(NavProjection {
                        location: Vec3::new(point.x, point.y, self.surface_z),
                        dirty: false,
                    })
                }
                Some(NavCell::Dirty) => {
                    return Some(NavProjection {
                        location: Vec3::new(point.x, point.y, self.surface_z),
                        dirty: true,
                    })
                }
                _ => {}
            }
        }
        let (x, y) = self.nearest_open_cell(point, extent)?;
        Some(NavProjection {
            location: self.cell_center(x, y),
            dirty: self.cell(x, y) == Some(NavCell::Dirty),
        })
    }
}

// ============================================================================
// BACKGROUND PATH JOBS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathRequest {
    pub entity: Entity,
    pub start: Vec3,
    pub goal: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    pub entity: Entity,
    pub goal: Vec3,
    pub waypoints: Option<Vec<Vec3>>,
}

/// Path queries answered by a dedicated worker thread.
///
/// The worker exits when this resource is dropped and its request sender
/// closes.
#[derive(Resource)]
pub struct PathJobs {
    requests: Sender<PathRequest>,
    results: Receiver<PathResult>,
    _worker: JoinHandle<()>,
}

impl PathJobs {
    pub fn spawn(surface: Arc<dyn NavigationSurface>) -> std::io::Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<PathRequest>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<PathResult>();

        let worker = std::thread::Builder::new()
            .name("path-jobs".to_string())
            .spawn(move || {
                for request in request_rx.iter() {
                    let waypoints = surface.find_path(request.start, request.goal);
                    let result = PathResult {
                        entity: request.entity,
                        goal: request.goal,
                        waypoints,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
                log::debug!("path worker shutting down");
            })?;

        Ok(Self {
            requests: request_tx,
            results: result_rx,
            _worker: worker,
        })
    }

    /// Queue a request. False when the worker is gone.
    pub fn submit(&self, request: PathRequest) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Everything finished since the last drain.
    pub fn drain(&self) -> Vec<PathResult> {
        self.results.try_iter().collect()
    }

    /// Block until one result arrives or the timeout passes.
    pub fn wait_one(&self, timeout: std::time::Duration) -> Option<PathResult> {
        self.results.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn walled_grid() -> NavGrid {
        // 20x20 cells of 100 units, wall along x = 10 except a gap at the top.
        let mut grid = NavGrid::new(20, 20, 100.0, 0.0, 0.0);
        for y in 0..18 {
            grid.set_cell(10, y, NavCell::Blocked);
        }
        grid
    }

    #[test]
    fn test_path_goes_around_wall() {
        let grid = walled_grid();
        let start = Vec3::new(150.0, 150.0, 0.0);
        let goal = Vec3::new(1850.0, 150.0, 0.0);
        let path = grid.find_path(start, goal).expect("path exists");
        assert_eq!(path.first(), Some(&start));
        assert_eq!(path.last(), Some(&goal));
        // Must climb through the gap at y >= 1800.
        assert!(path.iter().any(|p| p.y >= 1800.0));
        for p in &path {
            let (x, y) = grid.world_to_cell(*p).unwrap();
            assert_ne!(grid.cell(x, y), Some(NavCell::Blocked));
        }
    }

    #[test]
    fn test_no_path_when_sealed() {
        let mut grid = walled_grid();
        grid.set_cell(10, 18, NavCell::Blocked);
        grid.set_cell(10, 19, NavCell::Blocked);
        assert!(grid
            .find_path(Vec3::new(150.0, 150.0, 0.0), Vec3::new(1850.0, 150.0, 0.0))
            .is_none());
    }

    #[test]
    fn test_projection_onto_open_cell() {
        let grid = walled_grid();
        let inside_wall = Vec3::new(1030.0, 500.0, 0.0);
        let p = grid
            .project_point(inside_wall, Vec3::new(200.0, 200.0, 100.0))
            .expect("open cell nearby");
        assert!(!p.dirty);
        let (x, _) = grid.world_to_cell(p.location).unwrap();
        assert!(x == 9 || x == 11);

        assert!(grid
            .project_point(inside_wall, Vec3::new(10.0, 10.0, 100.0))
            .is_none());
        assert!(grid
            .project_point(Vec3::new(500.0, 500.0, 900.0), Vec3::new(10.0, 10.0, 100.0))
            .is_none());
    }

    #[test]
    fn test_projection_reports_dirty() {
        let mut grid = NavGrid::new(10, 10, 100.0, 0.0, 0.0);
        grid.set_cell(2, 2, NavCell::Dirty);
        let p = grid
            .project_point(Vec3::new(250.0, 250.0, 0.0), Vec3::splat(100.0))
            .unwrap();
        assert!(p.dirty);
    }

    #[test]
    fn test_background_jobs_answer_requests() {
        let jobs = PathJobs::spawn(Arc::new(walled_grid())).expect("worker thread");
        let goal = Vec3::new(1850.0, 150.0, 0.0);
        assert!(jobs.submit(PathRequest {
            entity: Entity::from_raw(7),
            start: Vec3::new(150.0, 150.0, 0.0),
            goal,
        }));
        let result = jobs.wait_one(Duration::from_secs(5)).expect("result arrives");
        assert_eq!(result.entity, Entity::from_raw(7));
        assert_eq!(result.goal, goal);
        assert!(result.waypoints.is_some());
    }
}
