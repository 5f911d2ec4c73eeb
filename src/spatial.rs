//! Spatial obstacle index for broad-phase neighbor queries.
//!
//! A uniform grid maps cell coordinates to the obstacle boxes overlapping
//! them. Queries return a conservative superset; callers re-check distance.
//!
//! ## Data Access – `obstacle_registration_system`
//! - Reads: Transform, AgentCharacteristics, CombatStats, AgentState, SimConfig
//! - Writes: ObstacleGrid

use crate::components::*;
use crate::config::SimConfig;
use bevy_ecs::prelude::*;
use glam::Vec3;
use std::collections::{HashMap, HashSet};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_radius(center: Vec3, radius: f32) -> Self {
        let r = Vec3::splat(radius);
        Self {
            min: center - r,
            max: center + r,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half of the horizontal width.
    pub fn radius(&self) -> f32 {
        (self.max.x - self.min.x) * 0.5
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }
}

/// One registered box. Large agents own several, distinguished by `part`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleEntry {
    pub entity: Entity,
    pub part: u16,
    pub bounds: Aabb,
    pub team_id: u8,
}

/// Grid-based obstacle index.
#[derive(Resource, Debug)]
pub struct ObstacleGrid {
    pub cell_size: f32,
    cells: HashMap<(i32, i32), Vec<ObstacleEntry>>,
    /// Reverse lookup: entity to every cell it touches.
    entity_cells: HashMap<Entity, Vec<(i32, i32)>>,
    /// Location each entity was last registered at.
    registered_at: HashMap<Entity, Vec3>,
}

impl Default for ObstacleGrid {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl ObstacleGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            cells: HashMap::new(),
            entity_cells: HashMap::new(),
            registered_at: HashMap::new(),
        }
    }

    #[inline]
    pub fn world_to_cell(&self, x: f32, y: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }

    fn cells_overlapping(&self, bounds: &Aabb) -> impl Iterator<Item = (i32, i32)> {
        let (x0, y0) = self.world_to_cell(bounds.min.x, bounds.min.y);
        let (x1, y1) = self.world_to_cell(bounds.max.x, bounds.max.y);
        (x0..=x1).flat_map(move |x| (y0..=y1).map(move |y| (x, y)))
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.entity_cells.clear();
        self.registered_at.clear();
    }

    /// Insert or replace an entity's single bounding box.
    pub fn insert(&mut self, entity: Entity, bounds: Aabb, team_id: u8) {
        self.insert_parts(entity, bounds.center(), &[bounds], team_id);
    }

    /// Insert or replace all boxes owned by an entity. `anchor` is the agent
    /// location the refresh epsilon is measured from.
    pub fn insert_parts(&mut self, entity: Entity, anchor: Vec3, parts: &[Aabb], team_id: u8) {
        self.remove(entity);

        let mut touched = Vec::new();
        for (part, bounds) in parts.iter().enumerate() {
            let entry = ObstacleEntry {
                entity,
                part: part as u16,
                bounds: *bounds,
                team_id,
            };
            let cells: Vec<_> = self.cells_overlapping(bounds).collect();
            for cell in cells {
                self.cells.entry(cell).or_default().push(entry);
                if !touched.contains(&cell) {
                    touched.push(cell);
                }
            }
        }
        self.entity_cells.insert(entity, touched);
        self.registered_at.insert(entity, anchor);
    }

    pub fn remove(&mut self, entity: Entity) {
        if let Some(cells) = self.entity_cells.remove(&entity) {
            for cell in cells {
                if let Some(entries) = self.cells.get_mut(&cell) {
                    entries.retain(|e| e.entity != entity);
                    if entries.is_empty() {
                        self.cells.remove(&cell);
                    }
                }
            }
        }
        self.registered_at.remove(&entity);
    }

    /// Candidate handles whose cells overlap `bounds`.
    pub fn query(&self, bounds: &Aabb) -> Vec<Entity> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for cell in self.cells_overlapping(bounds) {
            if let Some(entries) = self.cells.get(&cell) {
                for entry in entries {
                    if seen.insert(entry.entity) {
                        results.push(entry.entity);
                    }
                }
            }
        }
        results
    }

    /// Candidate boxes whose cells overlap `bounds`, one per (entity, part).
    pub fn query_entries(&self, bounds: &Aabb) -> Vec<ObstacleEntry> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for cell in self.cells_overlapping(bounds) {
            if let Some(entries) = self.cells.get(&cell) {
                for entry in entries {
                    if seen.insert((entry.entity, entry.part)) {
                        results.push(*entry);
                    }
                }
            }
        }
        results
    }

    pub fn registered_location(&self, entity: Entity) -> Option<Vec3> {
        self.registered_at.get(&entity).copied()
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.entity_cells.contains_key(&entity)
    }

    pub fn cell_count(&self, cell: (i32, i32)) -> usize {
        self.cells.get(&cell).map(|v| v.len()).unwrap_or(0)
    }

    /// Number of registered entities.
    pub fn total_count(&self) -> usize {
        self.entity_cells.len()
    }

    fn registered_entities(&self) -> Vec<Entity> {
        self.entity_cells.keys().copied().collect()
    }
}

/// Boxes for an agent. Wide agents become a ring of smaller boxes on their rim
/// so the broad phase does not treat their whole footprint as one cell blob.
pub fn obstacle_parts(center: Vec3, radius: f32, large_threshold: f32, sub_radius: f32) -> Vec<Aabb> {
    if radius <= large_threshold || sub_radius <= 0.0 {
        return vec![Aabb::from_center_radius(center, radius)];
    }
    let circumference = std::f32::consts::TAU * radius;
    let count = (circumference / (2.0 * sub_radius)).ceil().max(1.0) as usize;
    let step = std::f32::consts::TAU / count as f32;
    (0..count)
        .map(|i| {
            let angle = step * i as f32;
            let offset = Vec3::new(angle.cos(), angle.sin(), 0.0) * radius;
            Aabb::from_center_radius(center + offset, sub_radius)
        })
        .collect()
}

/// Refreshes the obstacle index every tick.
///
/// Agents that moved more than the refresh epsilon are re-inserted; agents
/// that are gone, dead, flying, stopped or immobile are purged.
pub fn obstacle_registration_system(
    config: Res<SimConfig>,
    grid: Option<ResMut<ObstacleGrid>>,
    query: Query<
        (Entity, &Transform, &AgentCharacteristics, &CombatStats, &AgentState),
        (Without<Dead>, Without<StopMovement>, Without<DisableObstacle>),
    >,
) {
    let Some(mut grid) = grid else {
        log::trace!("obstacle index unavailable, skipping registration");
        return;
    };
    let cfg = &config.obstacles;
    let epsilon_sq = cfg.refresh_epsilon * cfg.refresh_epsilon;
    let mut live = HashSet::new();

    for (entity, transform, traits, stats, state) in query.iter() {
        if traits.is_flying || !state.can_move {
            continue;
        }
        live.insert(entity);

        let location = transform.translation;
        let fresh = grid
            .registered_location(entity)
            .map(|prev| prev.distance_squared(location) <= epsilon_sq)
            .unwrap_or(false);
        if fresh {
            continue;
        }
        let parts = obstacle_parts(
            location,
            traits.capsule_radius,
            cfg.large_radius_threshold,
            cfg.sub_obstacle_radius,
        );
        grid.insert_parts(entity, location, &parts, stats.team_id);
    }

    for entity in grid.registered_entities() {
        if !live.contains(&entity) {
            grid.remove(entity);
        }
    }
}
