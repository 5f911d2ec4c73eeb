//! Simulation tunables.
//!
//! Every knob is a plain number fixed at agent-creation or world-creation
//! time. `SimConfig` is inserted as a resource; stages read the section they
//! own. Defaults are the empirically tuned values the game ships with.

use crate::error::{SimError, SimResult};
use bevy_ecs::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};

/// How movement intent resolves path queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathfindingMode {
    /// Query the navigation surface inline, inside the stage.
    #[default]
    Synchronous,
    /// Submit jobs to a worker thread and steer directly while they run.
    Background,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Goal counts as reached inside this distance.
    pub stop_distance: f32,
    /// Waypoint counts as reached inside this distance.
    pub waypoint_acceptance_radius: f32,
    /// Upper bound on the integration delta.
    pub max_delta_time: f32,
    pub pathfinding: PathfindingMode,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            stop_distance: 50.0,
            waypoint_acceptance_radius: 50.0,
            max_delta_time: 0.1,
            pathfinding: PathfindingMode::Synchronous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObstacleConfig {
    pub cell_size: f32,
    /// Agents that moved less than this keep their index entry.
    pub refresh_epsilon: f32,
    /// Agents wider than this register a ring of smaller obstacles.
    pub large_radius_threshold: f32,
    pub sub_obstacle_radius: f32,
}

impl Default for ObstacleConfig {
    fn default() -> Self {
        Self {
            cell_size: 100.0,
            refresh_epsilon: 1.0,
            large_radius_threshold: 200.0,
            sub_obstacle_radius: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftAvoidanceConfig {
    pub interval: f32,
    pub strength: f32,
    /// Vertical half-extent of the projection query.
    pub projection_extent_z: f32,
    /// Close enough to the surface to stop pushing.
    pub clean_threshold: f32,
    /// Push only when further than this from the projected point.
    pub push_threshold: f32,
    pub ring_radii: Vec<f32>,
    pub ring_slices: u32,
}

impl Default for SoftAvoidanceConfig {
    fn default() -> Self {
        Self {
            interval: 0.1,
            strength: 1500.0,
            projection_extent_z: 5000.0,
            clean_threshold: 10.0,
            push_threshold: 5.0,
            ring_radii: vec![100.0, 200.0, 400.0, 800.0],
            ring_slices: 12,
        }
    }
}

/// Repulsion knobs shared by clump separation and neighbor avoidance.
///
/// The two stages have different defaults, so a partial section in a config
/// file is filled from the defaults of the stage it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationConfig {
    pub interval: f32,
    pub max_check_radius: f32,
    pub friendly_strength: f32,
    pub enemy_strength: f32,
    /// Used by neighbor avoidance when the agent is a worker.
    pub worker_strength: f32,
    pub friendly_distance_multiplier: f32,
    pub enemy_distance_multiplier: f32,
    /// Same-team pairs only separate when they focus the same target.
    pub only_same_target: bool,
}

impl SeparationConfig {
    pub fn clump() -> Self {
        Self {
            interval: 0.25,
            max_check_radius: 300.0,
            friendly_strength: 100.0,
            enemy_strength: 25.0,
            worker_strength: 100.0,
            friendly_distance_multiplier: 2.0,
            enemy_distance_multiplier: 1.0,
            only_same_target: true,
        }
    }

    pub fn neighbor() -> Self {
        Self {
            interval: 0.1,
            max_check_radius: 400.0,
            friendly_strength: 50.0,
            enemy_strength: 30.0,
            worker_strength: 5.0,
            friendly_distance_multiplier: 1.2,
            enemy_distance_multiplier: 1.0,
            only_same_target: false,
        }
    }
}

/// Fields present in a separation section of a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SeparationSection {
    interval: Option<f32>,
    max_check_radius: Option<f32>,
    friendly_strength: Option<f32>,
    enemy_strength: Option<f32>,
    worker_strength: Option<f32>,
    friendly_distance_multiplier: Option<f32>,
    enemy_distance_multiplier: Option<f32>,
    only_same_target: Option<bool>,
}

impl SeparationSection {
    fn over(self, base: SeparationConfig) -> SeparationConfig {
        SeparationConfig {
            interval: self.interval.unwrap_or(base.interval),
            max_check_radius: self.max_check_radius.unwrap_or(base.max_check_radius),
            friendly_strength: self.friendly_strength.unwrap_or(base.friendly_strength),
            enemy_strength: self.enemy_strength.unwrap_or(base.enemy_strength),
            worker_strength: self.worker_strength.unwrap_or(base.worker_strength),
            friendly_distance_multiplier: self
                .friendly_distance_multiplier
                .unwrap_or(base.friendly_distance_multiplier),
            enemy_distance_multiplier: self.enemy_distance_multiplier.unwrap_or(base.enemy_distance_multiplier),
            only_same_target: self.only_same_target.unwrap_or(base.only_same_target),
        }
    }
}

fn clump_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SeparationConfig, D::Error> {
    Ok(SeparationSection::deserialize(deserializer)?.over(SeparationConfig::clump()))
}

fn neighbor_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SeparationConfig, D::Error> {
    Ok(SeparationSection::deserialize(deserializer)?.over(SeparationConfig::neighbor()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvoidanceConfig {
    pub soft: SoftAvoidanceConfig,
    #[serde(deserialize_with = "clump_section")]
    pub clump: SeparationConfig,
    #[serde(deserialize_with = "neighbor_section")]
    pub neighbor: SeparationConfig,
}

impl Default for AvoidanceConfig {
    fn default() -> Self {
        Self {
            soft: SoftAvoidanceConfig::default(),
            clump: SeparationConfig::clump(),
            neighbor: SeparationConfig::neighbor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub min_interval: f32,
    pub max_interval: f32,
    pub low_fps: f32,
    pub high_fps: f32,
    /// Hidden agents keep syncing this long; when the stage-wide timer passes
    /// it, everything syncs regardless of the dynamic interval.
    pub visibility_grace: f32,
    /// World units.
    pub position_tolerance: f32,
    /// Degrees.
    pub rotation_tolerance: f32,
    pub min_movement_for_rotation: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval: 0.01,
            max_interval: 0.5,
            low_fps: 30.0,
            high_fps: 60.0,
            visibility_grace: 0.5,
            position_tolerance: 0.1,
            rotation_tolerance: 0.5,
            min_movement_for_rotation: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub interval: f32,
    pub idle_to_patrol_timeout: f32,
    pub is_attacked_duration: f32,
    pub attack_duration: f32,
    pub pause_duration: f32,
    pub despawn_delay: f32,
    pub effect_interval: f32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            interval: 0.1,
            idle_to_patrol_timeout: 3.0,
            is_attacked_duration: 0.5,
            attack_duration: 1.0,
            pause_duration: 0.5,
            despawn_delay: 5.0,
            effect_interval: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Camera or frontline position in the horizontal plane.
    pub reference_point: (f32, f32),
    pub high_distance: f32,
    pub medium_distance: f32,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            reference_point: (0.0, 0.0),
            high_distance: 3000.0,
            medium_distance: 8000.0,
        }
    }
}

/// Root configuration resource.
#[derive(Resource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// `None` runs one tick per `step` with the frame delta.
    pub fixed_timestep: Option<f32>,
    /// Seed for the deterministic simulation RNG.
    pub seed: u64,
    pub movement: MovementConfig,
    pub obstacles: ObstacleConfig,
    pub avoidance: AvoidanceConfig,
    pub sync: SyncConfig,
    pub states: StateConfig,
    pub lod: LodConfig,
}

impl SimConfig {
    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> SimResult<Self> {
        let mut config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        config.normalize();
        Ok(config)
    }

    pub fn validate(&self) -> SimResult<()> {
        let positive = [
            ("movement.max_delta_time", self.movement.max_delta_time),
            ("obstacles.cell_size", self.obstacles.cell_size),
            ("obstacles.sub_obstacle_radius", self.obstacles.sub_obstacle_radius),
            ("avoidance.soft.interval", self.avoidance.soft.interval),
            ("avoidance.clump.interval", self.avoidance.clump.interval),
            ("avoidance.neighbor.interval", self.avoidance.neighbor.interval),
            ("sync.min_interval", self.sync.min_interval),
            ("sync.low_fps", self.sync.low_fps),
            ("states.interval", self.states.interval),
            ("states.effect_interval", self.states.effect_interval),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(SimError::InvalidConfig(format!("{name} must be positive, got {value}")));
            }
        }
        if let Some(step) = self.fixed_timestep {
            if !(step > 0.0) {
                return Err(SimError::InvalidConfig(format!("fixed_timestep must be positive, got {step}")));
            }
        }
        if self.sync.max_interval < self.sync.min_interval {
            return Err(SimError::InvalidConfig(
                "sync.max_interval must not be below sync.min_interval".to_string(),
            ));
        }
        if self.avoidance.soft.ring_slices == 0 {
            return Err(SimError::InvalidConfig("avoidance.soft.ring_slices must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Clamp values that are tolerated but out of range.
    pub fn normalize(&mut self) {
        if self.sync.high_fps < self.sync.low_fps + 1.0 {
            log::warn!(
                "sync.high_fps {} clamped to {}",
                self.sync.high_fps,
                self.sync.low_fps + 1.0
            );
            self.sync.high_fps = self.sync.low_fps + 1.0;
        }
    }
}
