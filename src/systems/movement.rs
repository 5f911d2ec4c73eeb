//! Movement intent and force/velocity integration.
//!
//! `movement_intent_system` turns a move target into a desired velocity by
//! following a cached navigation path, or a straight line when no path can be
//! had. `integration_system` blends that desired velocity with the tick's
//! accumulated force, clamps it, moves the agent and clears the force.

use crate::components::*;
use crate::config::{PathfindingMode, SimConfig};
use crate::navigation::{NavigationResource, PathJobs, PathRequest};
use bevy_ecs::prelude::*;
use glam::Vec3;

/// Delta time of the current tick in seconds.
#[derive(Resource, Default)]
pub struct DeltaTime(pub f32);

/// Directions shorter than this are treated as "already there".
const DIRECTION_TOLERANCE: f32 = 0.1;

#[inline]
pub(crate) fn horizontal(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y, 0.0)
}

/// Applies finished background path queries.
///
/// Results for agents that died or despawned, or whose destination changed
/// while the query ran, are dropped. A dropped result for the outstanding
/// goal still clears the in-progress flag so the agent can query again.
///
/// ## Data Access
/// - Reads: PathJobs, MoveTarget
/// - Writes: NavigationPath
pub fn path_result_system(
    jobs: Option<Res<PathJobs>>,
    mut query: Query<(&MoveTarget, &mut NavigationPath), Without<Dead>>,
) {
    let Some(jobs) = jobs else {
        return;
    };
    for result in jobs.drain() {
        let Ok((target, mut path)) = query.get_mut(result.entity) else {
            log::trace!("path result for missing agent {:?} dropped", result.entity);
            continue;
        };
        if path.pending_goal == Some(result.goal) {
            path.finish_query();
        }
        if target.destination != result.goal {
            log::trace!("stale path result for {:?} dropped", result.entity);
            continue;
        }
        match result.waypoints {
            Some(waypoints) if !waypoints.is_empty() => path.install(waypoints, result.goal),
            _ => {
                log::debug!("no path for {:?}, steering directly", result.entity);
                path.install(vec![result.goal], result.goal);
            }
        }
    }
}

/// Resolves each agent's move target into `Steering::desired_velocity`.
///
/// ## Data Access
/// - Reads: Transform, MoveTarget, SimConfig, NavigationResource, PathJobs
/// - Writes: NavigationPath, Steering
pub fn movement_intent_system(
    config: Res<SimConfig>,
    nav: Option<Res<NavigationResource>>,
    jobs: Option<Res<PathJobs>>,
    mut query: Query<
        (Entity, &Transform, &MoveTarget, &mut NavigationPath, &mut Steering, Has<StopMovement>),
        Without<Dead>,
    >,
) {
    let cfg = &config.movement;
    let accept_sq = cfg.waypoint_acceptance_radius * cfg.waypoint_acceptance_radius;

    for (entity, transform, target, mut path, mut steering, stopped) in query.iter_mut() {
        steering.desired_velocity = Vec3::ZERO;
        if stopped || target.intent == MoveIntent::Stand {
            continue;
        }

        let location = transform.translation;
        let destination = target.destination;
        let stop = if target.slack_radius > 0.0 { target.slack_radius } else { cfg.stop_distance };
        if horizontal(destination - location).length_squared() <= stop * stop {
            if path.target.is_some() {
                path.reset();
            }
            continue;
        }

        if path.target.is_some_and(|t| t != destination) {
            path.reset();
        }
        // The outstanding query leads somewhere else now; its result will be
        // dropped on arrival.
        if path.pathfinding_in_progress && path.pending_goal != Some(destination) {
            path.finish_query();
        }

        if !path.is_valid_for(destination) && !path.pathfinding_in_progress {
            request_path(entity, location, destination, cfg.pathfinding, nav.as_deref(), jobs.as_deref(), &mut path);
        }

        let mut seek = destination;
        if path.is_valid_for(destination) {
            loop {
                let last = path.next_index + 1 >= path.waypoints.len();
                match path.current_waypoint() {
                    // The final waypoint stays the seek point until the stop
                    // radius is reached.
                    Some(waypoint) if !last && horizontal(waypoint - location).length_squared() <= accept_sq => {
                        path.next_index += 1;
                    }
                    Some(waypoint) => {
                        seek = waypoint;
                        break;
                    }
                    None => {
                        path.reset();
                        break;
                    }
                }
            }
        }

        let direction = horizontal(seek - location);
        let length = direction.length();
        if length > DIRECTION_TOLERANCE {
            steering.desired_velocity = direction / length * target.desired_speed;
        }
    }
}

fn request_path(
    entity: Entity,
    start: Vec3,
    goal: Vec3,
    mode: PathfindingMode,
    nav: Option<&NavigationResource>,
    jobs: Option<&PathJobs>,
    path: &mut NavigationPath,
) {
    let Some(nav) = nav else {
        log::trace!("navigation unavailable, {entity:?} steers directly");
        return;
    };

    if mode == PathfindingMode::Background {
        if let Some(jobs) = jobs {
            if jobs.submit(PathRequest { entity, start, goal }) {
                path.begin_query(goal);
                return;
            }
            log::warn!("path worker unavailable, querying inline");
        }
    }

    match nav.0.find_path(start, goal) {
        Some(waypoints) if !waypoints.is_empty() => path.install(waypoints, goal),
        _ => {
            log::debug!("path query failed for {entity:?}, steering directly");
            path.install(vec![goal], goal);
        }
    }
}

/// Integrates steering and force into velocity and position.
///
/// `accel = clamp(desired - velocity, max_acceleration)`,
/// `velocity = clamp(velocity + (accel + force) * dt, max_speed)`,
/// `position += velocity * dt`, then force is zeroed. Ground agents move in
/// the horizontal plane only; flying agents keep their vertical velocity.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Steering, MovementParams, AgentCharacteristics
/// - Writes: Transform, Velocity, Force
pub fn integration_system(
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<
        (
            &mut Transform,
            &mut Velocity,
            &mut Force,
            &Steering,
            &MovementParams,
            &AgentCharacteristics,
            Has<StopMovement>,
        ),
        Without<Dead>,
    >,
) {
    let delta = dt.0.min(config.movement.max_delta_time);
    if delta <= 0.0 {
        return;
    }

    for (mut transform, mut velocity, mut force, steering, params, traits, stopped) in query.iter_mut() {
        if stopped {
            velocity.value = Vec3::ZERO;
            force.value = Vec3::ZERO;
            continue;
        }

        let current = horizontal(velocity.value);
        let accel = (horizontal(steering.desired_velocity) - current).clamp_length_max(params.max_acceleration);
        let planar = current + (accel + horizontal(force.value)) * delta;

        let vertical = if traits.is_flying { velocity.value.z } else { 0.0 };
        let next = Vec3::new(planar.x, planar.y, vertical).clamp_length_max(params.max_speed);

        velocity.value = next;
        transform.translation += next * delta;
        force.value = Vec3::ZERO;
    }
}
