//! Snapshot types.
//!
//! The `Snapshot` struct provides a serializable view of every agent for
//! hosts that want to inspect or record the simulation without touching
//! the ECS world directly.

use crate::components::*;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Snapshot of a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// `Entity::to_bits`, stable for the agent's lifetime.
    pub id: u64,
    pub team: u8,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    /// Heading in radians around +Z.
    pub yaw: f32,
    pub state: String,
    pub charging: bool,
    pub has_target: bool,
}

/// Complete simulation state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current simulation tick.
    pub tick: u64,
    /// Elapsed simulation time in seconds.
    pub time: f32,
    pub agents: Vec<AgentSnapshot>,
}

impl Snapshot {
    /// Create a snapshot from the ECS world, ordered by agent id.
    pub fn from_world(world: &mut World, tick: u64, time: f32) -> Self {
        let mut query = world.query_filtered::<(Entity, &Transform, &Velocity, &CombatStats, &AiTarget), With<AgentState>>();

        let mut agents = Vec::new();
        for (entity, transform, velocity, stats, target) in query.iter(world) {
            let agent = world.entity(entity);
            let state = UnitState::of(agent).map(|s| s.name()).unwrap_or("None");
            agents.push(AgentSnapshot {
                id: entity.to_bits(),
                team: stats.team_id,
                x: transform.translation.x,
                y: transform.translation.y,
                z: transform.translation.z,
                vx: velocity.value.x,
                vy: velocity.value.y,
                vz: velocity.value.z,
                yaw: transform.yaw(),
                state: state.to_string(),
                charging: agent.contains::<Charging>(),
                has_target: target.has_valid_target,
            });
        }
        agents.sort_by_key(|a| a.id);

        Self { tick, time, agents }
    }

    pub fn agent(&self, entity: Entity) -> Option<&AgentSnapshot> {
        let id = entity.to_bits();
        self.agents.iter().find(|a| a.id == id)
    }

    /// Serialize snapshot to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize snapshot to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
