//! Throttling and level-of-detail support.
//!
//! - `IntervalGate` is the accumulated-time counter every interval-gated stage
//!   keeps as system-local state.
//! - `SimTick` counts ticks for LOD thinning.
//! - `lod_assignment_system` buckets agents by distance to a reference point.
//!
//! ## Parallelism Notes
//! - `lod_assignment_system`: reads Transform, writes SimLod. Runs alongside any
//!   system that does not touch SimLod.

use crate::components::*;
use crate::config::SimConfig;
use bevy_ecs::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Global simulation tick counter.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SimTick(pub u64);

impl SimTick {
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    #[inline]
    pub fn should_update(&self, lod: SimLod) -> bool {
        lod.should_update(self.0)
    }
}

/// Accumulated time since a stage last ran.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntervalGate {
    pub accumulated: f32,
}

impl IntervalGate {
    /// Adds `dt`. When the interval is reached, resets and returns the time
    /// that elapsed since the previous run.
    pub fn tick(&mut self, dt: f32, interval: f32) -> Option<f32> {
        self.accumulated += dt;
        if self.accumulated < interval {
            return None;
        }
        let elapsed = self.accumulated;
        self.accumulated = 0.0;
        Some(elapsed)
    }
}

/// Seeded RNG shared by stages that need randomness.
#[derive(Resource, Debug, Clone)]
pub struct SimRng(pub ChaCha8Rng);

impl SimRng {
    pub fn seeded(seed: u64) -> Self {
        Self(ChaCha8Rng::seed_from_u64(seed))
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::seeded(0)
    }
}

/// Assigns LOD from horizontal distance to the configured reference point.
///
/// ## Data Access
/// - Reads: Transform, SimConfig
/// - Writes: SimLod
pub fn lod_assignment_system(config: Res<SimConfig>, mut query: Query<(&Transform, &mut SimLod)>) {
    let (ref_x, ref_y) = config.lod.reference_point;
    let high_sq = config.lod.high_distance * config.lod.high_distance;
    let med_sq = config.lod.medium_distance * config.lod.medium_distance;

    for (transform, mut lod) in query.iter_mut() {
        let dx = transform.translation.x - ref_x;
        let dy = transform.translation.y - ref_y;
        let dist_sq = dx * dx + dy * dy;

        let new_lod = if dist_sq <= high_sq {
            SimLod::High
        } else if dist_sq <= med_sq {
            SimLod::Medium
        } else {
            SimLod::Low
        };

        if *lod != new_lod {
            *lod = new_lod;
        }
    }
}
