//! Orientation stage: turns the authoritative transform toward the target.
//!
//! Facing is decoupled from position. Agents face their target, fall back to
//! the target's last-known location once the handle goes stale, and face
//! their direction of travel when they have no target at all.
//!
//! ## Data Access
//! - Reads: DeltaTime, AiTarget, YawFollow, Velocity, target Transforms
//! - Writes: Transform (rotation only)

use crate::components::*;
use crate::systems::movement::{horizontal, DeltaTime};
use bevy_ecs::prelude::*;
use glam::{Quat, Vec3};
use std::collections::HashMap;

/// Below this horizontal speed an untargeted agent keeps its facing.
const MIN_FACING_SPEED: f32 = 1.0;

/// Blend factor for one tick: `clamp(dt / duration, 0, 1)` raised to the ease
/// exponent. A zero duration snaps.
pub fn blend_alpha(dt: f32, follow: &YawFollow) -> f32 {
    let alpha = if follow.blend_duration > 0.0 {
        (dt / follow.blend_duration).clamp(0.0, 1.0)
    } else {
        1.0
    };
    if (follow.ease_exponent - 1.0).abs() > f32::EPSILON && follow.ease_exponent > 0.0 {
        alpha.powf(follow.ease_exponent)
    } else {
        alpha
    }
}

/// Rotation facing along `direction` in the horizontal plane, or `None` for
/// a zero-length direction.
pub fn facing(direction: Vec3, offset_degrees: f32) -> Option<Quat> {
    let flat = horizontal(direction);
    if flat.length_squared() <= 1e-6 {
        return None;
    }
    let yaw = flat.y.atan2(flat.x) + offset_degrees.to_radians();
    Some(Quat::from_rotation_z(yaw))
}

/// Blends each agent's rotation toward its aim point or travel direction.
pub fn orientation_system(
    dt: Res<DeltaTime>,
    mut set: ParamSet<(
        Query<&Transform, Without<Dead>>,
        Query<(Entity, &mut Transform, &AiTarget, &YawFollow, &Velocity), Without<Dead>>,
    )>,
) {
    let delta = dt.0;
    if delta <= 0.0 {
        return;
    }

    // Resolve target handles first; the mutable pass cannot read other
    // agents' transforms.
    let handles: Vec<(Entity, Entity)> = set
        .p1()
        .iter()
        .filter_map(|(entity, _, target, _, _)| target.entity.map(|t| (entity, t)))
        .collect();
    let resolved: HashMap<Entity, Vec3> = {
        let transforms = set.p0();
        handles
            .into_iter()
            .filter_map(|(entity, t)| transforms.get(t).ok().map(|tr| (entity, tr.translation)))
            .collect()
    };

    let mut agents = set.p1();
    for (entity, mut transform, target, follow, velocity) in agents.iter_mut() {
        let aim = match resolved.get(&entity).copied() {
            Some(location) => Some(location),
            None if target.has_valid_target && target.last_known_location != Vec3::ZERO => {
                Some(target.last_known_location)
            }
            _ => None,
        };

        let desired = match aim {
            Some(point) => facing(point - transform.translation, follow.offset_degrees),
            None if horizontal(velocity.value).length() > MIN_FACING_SPEED => facing(velocity.value, 0.0),
            None => None,
        };
        let Some(desired) = desired else {
            continue;
        };

        let alpha = blend_alpha(delta, follow);
        transform.rotation = transform.rotation.slerp(desired, alpha).normalize();
    }
}
