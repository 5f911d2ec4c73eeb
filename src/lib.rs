//! RTS mass-unit simulation core.
//!
//! Movement, steering and avoidance for thousands of agents, built on
//! `bevy_ecs`. The host owns a [`SimWorld`], writes move orders and targets
//! through it, steps it once per frame and drains visual transform batches
//! on the thread that owns its renderer.

pub mod api;
pub mod components;
pub mod config;
pub mod error;
pub mod logging;
pub mod navigation;
pub mod spatial;
pub mod systems;
pub mod world;

pub use api::{AgentSpec, SimWorld};
pub use components::*;
pub use config::{PathfindingMode, SimConfig};
pub use error::{SimError, SimResult};
pub use navigation::{NavCell, NavGrid, NavProjection, NavigationResource, NavigationSurface};
pub use spatial::{Aabb, ObstacleGrid};
pub use systems::*;
pub use world::{AgentSnapshot, Snapshot};
