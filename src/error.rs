//! Errors surfaced at the host boundary.
//!
//! Simulation stages never fail; they skip, fall back, or drop a tag. Only
//! configuration loading and host commands report errors.

use bevy_ecs::entity::Entity;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    #[error("failed to parse simulation config: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("agent {0:?} does not exist")]
    UnknownAgent(Entity),
    #[error("agent {0:?} is dead")]
    DeadAgent(Entity),
    #[error("failed to start path worker: {0}")]
    PathWorker(#[from] std::io::Error),
}

pub type SimResult<T> = Result<T, SimError>;
