//! ECS systems for the mass-unit simulation.
//!
//! Systems contain the per-tick logic that operates on components.
//!
//! ## System Groups
//!
//! **Group 1 (Bookkeeping)** - run first, independent of each other:
//! - `lod_assignment_system` - assigns LOD by distance
//! - `target_tracking_system` - refreshes last-known target locations
//! - `path_result_system` - installs finished background paths
//!
//! **Group 2 (Movement)** - strictly chained, each stage sees the previous
//! stage's writes:
//! - `movement_intent_system` - path following into desired velocity
//! - `obstacle_registration_system` - refreshes the obstacle index
//! - `soft_avoidance_system` - off-surface recovery push
//! - `clump_separation_system` - separation for engaged agents
//! - `neighbor_avoidance_system` - lateral deflection from neighbors
//! - `integration_system` - force and steering into velocity and position
//! - `orientation_system` - facing toward target or travel direction
//! - `actor_sync_system` - publishes visual transform batches
//!
//! **Group 3 (Behavior)** - state glue after movement:
//! - `run_state_system`, `idle_state_system`, `chase_state_system`,
//!   `attack_state_system`, `pause_state_system`,
//!   `is_attacked_state_system`, `patrol_state_system`
//! - `charge_monitor_system` - reverts charge speed boosts
//! - `gameplay_effect_system` - area-of-effect applications
//! - `death_system` - despawns dead agents after a delay

pub mod actor_sync;
pub mod avoidance;
pub mod effects;
pub mod movement;
pub mod orientation;
pub mod performance;
pub mod states;

pub use actor_sync::*;
pub use avoidance::*;
pub use effects::*;
pub use movement::*;
pub use orientation::*;
pub use performance::*;
pub use states::*;
