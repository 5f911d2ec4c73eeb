//! Avoidance stage.
//!
//! Every sub-stage adds into `Force` and never overwrites it:
//!
//! - `soft_avoidance_system` pushes ground agents back onto clean navigable
//!   surface, searching outward in rings when the direct projection is dirty.
//! - `clump_separation_system` separates engaged agents (attack, pause, build)
//!   with an O(n²) pass over that subset, culled by a max check radius.
//! - `neighbor_avoidance_system` deflects moving and standing agents sideways
//!   away from obstacle-index neighbors.
//!
//! All three are interval gated.
//!
//! ## Gather / Apply
//!
//! Separation reads a snapshot of the participating agents and computes each
//! agent's push independently, so the compute phase can run on rayon when the
//! `parallel` feature is on. Pushes are applied sequentially afterwards.

use crate::components::*;
use crate::config::{SeparationConfig, SimConfig, SoftAvoidanceConfig};
use crate::navigation::{NavigationResource, NavigationSurface};
use crate::spatial::{Aabb, ObstacleGrid};
use crate::systems::movement::{horizontal, DeltaTime};
use crate::systems::performance::{IntervalGate, SimTick};
use bevy_ecs::prelude::*;
use glam::Vec3;
use std::collections::HashMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ============================================================================
// SOFT OFF-SURFACE RECOVERY
// ============================================================================

/// Nearest clean point on the first ring that has one.
pub fn ring_search(nav: &dyn NavigationSurface, origin: Vec3, extent: Vec3, cfg: &SoftAvoidanceConfig) -> Option<Vec3> {
    let slices = cfg.ring_slices.max(1);
    let step = std::f32::consts::TAU / slices as f32;
    for &radius in &cfg.ring_radii {
        let mut best: Option<(Vec3, f32)> = None;
        for slice in 0..slices {
            let angle = step * slice as f32;
            let probe = origin + Vec3::new(angle.cos(), angle.sin(), 0.0) * radius;
            let Some(hit) = nav.project_point(probe, extent) else {
                continue;
            };
            if hit.dirty {
                continue;
            }
            let dist_sq = horizontal(hit.location - origin).length_squared();
            if best.map(|(_, d)| dist_sq < d).unwrap_or(true) {
                best = Some((hit.location, dist_sq));
            }
        }
        if let Some((point, _)) = best {
            return Some(point);
        }
    }
    None
}

/// Pushes agents that stand off the navigable surface back onto it.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, NavigationResource, Transform, AgentCharacteristics
/// - Writes: Force, NeedsSoftAvoidance (via commands)
pub fn soft_avoidance_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    nav: Option<Res<NavigationResource>>,
    mut query: Query<
        (Entity, &Transform, &AgentCharacteristics, &mut Force, Has<NeedsSoftAvoidance>),
        (Without<Dead>, Without<StopMovement>),
    >,
) {
    let cfg = &config.avoidance.soft;
    if gate.tick(dt.0, cfg.interval).is_none() {
        return;
    }
    let Some(nav) = nav else {
        log::trace!("navigation unavailable, skipping soft avoidance");
        return;
    };

    for (entity, transform, traits, mut force, tagged) in query.iter_mut() {
        if traits.is_flying {
            if tagged {
                commands.entity(entity).remove::<NeedsSoftAvoidance>();
            }
            continue;
        }

        let location = transform.translation;
        let r2 = traits.capsule_radius * 2.0;
        let extent = Vec3::new(r2, r2, cfg.projection_extent_z);

        let Some(projection) = nav.0.project_point(location, extent) else {
            if tagged {
                commands.entity(entity).remove::<NeedsSoftAvoidance>();
            }
            continue;
        };

        let goal = if projection.dirty {
            ring_search(nav.0.as_ref(), location, extent, cfg)
        } else {
            Some(projection.location)
        };
        let Some(goal) = goal else {
            if tagged {
                commands.entity(entity).remove::<NeedsSoftAvoidance>();
            }
            continue;
        };

        let to_surface = horizontal(goal - location);
        let dist = to_surface.length();
        let off_surface = projection.dirty || dist > cfg.push_threshold;
        if !off_surface && !tagged {
            continue;
        }

        if dist > f32::EPSILON {
            force.value += to_surface / dist * cfg.strength;
        }

        if dist < cfg.clean_threshold {
            if tagged {
                commands.entity(entity).remove::<NeedsSoftAvoidance>();
            }
        } else if !tagged {
            commands.entity(entity).insert(NeedsSoftAvoidance);
        }
    }
}

// ============================================================================
// SEPARATION
// ============================================================================

/// Snapshot of one agent for the separation gather phase.
#[derive(Debug, Clone, Copy)]
pub struct SeparationAgent {
    pub entity: Entity,
    pub location: Vec3,
    pub radius: f32,
    pub team_id: u8,
    pub target: Option<Entity>,
    pub is_worker: bool,
}

/// Deterministic direction for two agents sitting exactly on top of each
/// other. Antisymmetric in its arguments.
fn coincident_direction(a: Entity, b: Entity) -> Vec3 {
    let (lo, sign) = if a.to_bits() < b.to_bits() { (a, 1.0) } else { (b, -1.0) };
    let angle = (lo.index() as f32) * 2.399_963;
    Vec3::new(angle.cos(), angle.sin(), 0.0) * sign
}

/// Push applied to `a` by `b`, or `None` when the pair does not interact.
///
/// Desired distance is `max(1, r_a + r_b) * multiplier`. The push points from
/// `b` to `a` and scales with the overlap and the team-dependent strength.
pub fn pair_push(a: &SeparationAgent, b: &SeparationAgent, cfg: &SeparationConfig) -> Option<Vec3> {
    let same_team = a.team_id == b.team_id;
    if same_team && cfg.only_same_target {
        match (a.target, b.target) {
            (Some(x), Some(y)) if x == y => {}
            _ => return None,
        }
    }

    let (multiplier, strength) = if same_team {
        (cfg.friendly_distance_multiplier, cfg.friendly_strength)
    } else {
        (cfg.enemy_distance_multiplier, cfg.enemy_strength)
    };
    let desired = (a.radius + b.radius).max(1.0) * multiplier;

    let delta = horizontal(b.location - a.location);
    let dist_sq = delta.length_squared();
    if dist_sq > cfg.max_check_radius * cfg.max_check_radius || dist_sq >= desired * desired {
        return None;
    }

    let dist = dist_sq.max(1.0).sqrt();
    let direction = if dist_sq > 1e-6 {
        delta / dist_sq.sqrt()
    } else {
        coincident_direction(a.entity, b.entity)
    };
    Some(-direction * (desired - dist) * strength)
}

/// Sum of all pushes on `agents[index]`.
fn separation_push(index: usize, agents: &[SeparationAgent], cfg: &SeparationConfig) -> Vec3 {
    let me = &agents[index];
    agents
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != index)
        .filter_map(|(_, other)| pair_push(me, other, cfg))
        .fold(Vec3::ZERO, |acc, push| acc + push)
}

fn gather_pushes(agents: &[SeparationAgent], cfg: &SeparationConfig) -> Vec<Vec3> {
    #[cfg(feature = "parallel")]
    {
        (0..agents.len())
            .into_par_iter()
            .map(|i| separation_push(i, agents, cfg))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        (0..agents.len()).map(|i| separation_push(i, agents, cfg)).collect()
    }
}

/// Separates engaged agents so they do not attack through each other.
///
/// Same-team pairs only separate when they focus the same target; opposing
/// pairs always separate.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, AgentCharacteristics, CombatStats, AiTarget
/// - Writes: Force
pub fn clump_separation_system(
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    agents: Query<
        (Entity, &Transform, &AgentCharacteristics, &CombatStats, &AiTarget),
        (
            Or<(With<Attack>, With<Pause>, With<Build>)>,
            Without<Dead>,
            Without<StopMovement>,
        ),
    >,
    mut forces: Query<&mut Force, Without<Dead>>,
) {
    let cfg = &config.avoidance.clump;
    if gate.tick(dt.0, cfg.interval).is_none() {
        return;
    }

    let snapshot: Vec<SeparationAgent> = agents
        .iter()
        .map(|(entity, transform, traits, stats, target)| SeparationAgent {
            entity,
            location: transform.translation,
            radius: traits.capsule_radius,
            team_id: stats.team_id,
            target: target.entity,
            is_worker: traits.is_worker,
        })
        .collect();
    if snapshot.len() < 2 {
        return;
    }

    let pushes = gather_pushes(&snapshot, cfg);
    for (agent, push) in snapshot.iter().zip(pushes) {
        if push == Vec3::ZERO {
            continue;
        }
        if let Ok(mut force) = forces.get_mut(agent.entity) {
            force.value += push;
        }
    }
}

// ============================================================================
// NEIGHBOR DEFLECTION
// ============================================================================

/// Sideways push on `me` away from one neighbor box.
fn lateral_push(me: &SeparationAgent, forward: Vec3, other: &SeparationAgent, cfg: &SeparationConfig) -> Option<Vec3> {
    let same_team = me.team_id == other.team_id;
    let (multiplier, strength) = if same_team {
        (cfg.friendly_distance_multiplier, cfg.friendly_strength)
    } else {
        (cfg.enemy_distance_multiplier, cfg.enemy_strength)
    };
    let strength = if me.is_worker { cfg.worker_strength } else { strength };
    let desired = (me.radius + other.radius).max(1.0) * multiplier;

    let delta = horizontal(other.location - me.location);
    let dist_sq = delta.length_squared();
    if dist_sq > cfg.max_check_radius * cfg.max_check_radius || dist_sq >= desired * desired {
        return None;
    }
    let dist = dist_sq.max(1.0).sqrt();
    let encroachment = desired - dist;

    let lateral = Vec3::new(-forward.y, forward.x, 0.0);
    let side = lateral.dot(delta);
    let away = if side.abs() > 1e-3 {
        -lateral * side.signum()
    } else {
        // Dead ahead or coincident: break the tie by handle order.
        let sign = if me.entity.to_bits() < other.entity.to_bits() { 1.0 } else { -1.0 };
        lateral * sign
    };
    Some(away * encroachment * strength)
}

/// Deflects agents sideways away from nearby obstacle-index neighbors.
///
/// Forward is the direction to the move target when moving, otherwise the
/// agent's facing. Medium and Low LOD agents only run on their LOD ticks.
///
/// ## Data Access
/// - Reads: DeltaTime, SimTick, SimConfig, ObstacleGrid, Transform, MoveTarget,
///   AgentCharacteristics, CombatStats, AiTarget, SimLod
/// - Writes: Force
pub fn neighbor_avoidance_system(
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    tick: Res<SimTick>,
    config: Res<SimConfig>,
    grid: Option<Res<ObstacleGrid>>,
    agents: Query<
        (
            Entity,
            &Transform,
            &MoveTarget,
            &AgentCharacteristics,
            &CombatStats,
            &AiTarget,
            &SimLod,
        ),
        (Without<Idle>, Without<Dead>, Without<StopMovement>),
    >,
    targets: Query<(Entity, &AiTarget)>,
    mut forces: Query<&mut Force, Without<Dead>>,
) {
    let cfg = &config.avoidance.neighbor;
    if gate.tick(dt.0, cfg.interval).is_none() {
        return;
    }
    let Some(grid) = grid else {
        log::trace!("obstacle index unavailable, skipping neighbor avoidance");
        return;
    };

    let movers: Vec<(SeparationAgent, Vec3)> = agents
        .iter()
        .filter(|(.., traits, _, _, lod)| !traits.is_flying && tick.should_update(**lod))
        .map(|(entity, transform, move_target, traits, stats, target, _)| {
            let to_goal = horizontal(move_target.destination - transform.translation);
            let forward = if move_target.intent == MoveIntent::Move && to_goal.length_squared() > 1.0 {
                to_goal.normalize()
            } else {
                horizontal(transform.forward()).normalize_or(Vec3::X)
            };
            let me = SeparationAgent {
                entity,
                location: transform.translation,
                radius: traits.capsule_radius,
                team_id: stats.team_id,
                target: target.entity,
                is_worker: traits.is_worker,
            };
            (me, forward)
        })
        .collect();

    let focus: HashMap<Entity, Option<Entity>> = targets.iter().map(|(e, t)| (e, t.entity)).collect();
    let grid: &ObstacleGrid = &grid;

    let compute = |(me, forward): &(SeparationAgent, Vec3)| -> Vec3 {
        let probe = Aabb::from_center_radius(me.location, cfg.max_check_radius);
        let mut push = Vec3::ZERO;
        for entry in grid.query_entries(&probe) {
            if entry.entity == me.entity {
                continue;
            }
            let other_target = focus.get(&entry.entity).copied().flatten();
            if cfg.only_same_target && entry.team_id == me.team_id {
                if me.target.is_none() || me.target != other_target {
                    continue;
                }
            }
            let other = SeparationAgent {
                entity: entry.entity,
                location: entry.bounds.center(),
                radius: entry.bounds.radius(),
                team_id: entry.team_id,
                target: other_target,
                is_worker: false,
            };
            if let Some(p) = lateral_push(me, *forward, &other, cfg) {
                push += p;
            }
        }
        push
    };

    #[cfg(feature = "parallel")]
    let pushes: Vec<Vec3> = movers.par_iter().map(compute).collect();
    #[cfg(not(feature = "parallel"))]
    let pushes: Vec<Vec3> = movers.iter().map(compute).collect();

    for ((me, _), push) in movers.iter().zip(pushes) {
        if push == Vec3::ZERO {
            continue;
        }
        if let Ok(mut force) = forces.get_mut(me.entity) {
            force.value += push;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::{NavCell, NavGrid};
    use crate::spatial::obstacle_registration_system;

    fn world(dt: f32) -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(DeltaTime(dt));
        world.insert_resource(SimTick(0));
        world
    }

    fn run_once<M>(world: &mut World, systems: impl IntoSystemConfigs<M>) {
        let mut schedule = Schedule::default();
        schedule.add_systems(systems);
        schedule.run(world);
    }

    fn attacker(world: &mut World, at: Vec3, team: u8, target: Option<Entity>) -> Entity {
        let bundle = AgentBundle {
            stats: CombatStats {
                team_id: team,
                ..Default::default()
            },
            target: AiTarget {
                entity: target,
                last_known_location: Vec3::ZERO,
                has_valid_target: target.is_some(),
            },
            ..AgentBundle::at(at)
        };
        world.spawn((bundle, Attack)).id()
    }

    #[test]
    fn test_same_target_pair_is_pushed_apart() {
        let mut world = world(1.0);
        let enemy = world.spawn(AgentBundle::at(Vec3::new(0.0, 500.0, 0.0))).id();
        let a = attacker(&mut world, Vec3::ZERO, 0, Some(enemy));
        let b = attacker(&mut world, Vec3::new(50.0, 0.0, 0.0), 0, Some(enemy));
        world.entity_mut(a).remove::<Idle>();
        world.entity_mut(b).remove::<Idle>();

        run_once(&mut world, clump_separation_system);

        let fa = world.get::<Force>(a).unwrap().value;
        let fb = world.get::<Force>(b).unwrap().value;
        assert!(fa.x < 0.0 && fa.y.abs() < 1e-3);
        assert!(fb.x > 0.0 && fb.y.abs() < 1e-3);
        assert!((fa + fb).length() < 1e-3);
        // (2 * 50 * 2 - 50) * 100
        assert!((fb.x - 15000.0).abs() < 1e-2);
    }

    #[test]
    fn test_same_team_different_targets_do_not_separate() {
        let mut world = world(1.0);
        let e1 = world.spawn(AgentBundle::default()).id();
        let e2 = world.spawn(AgentBundle::default()).id();
        let a = attacker(&mut world, Vec3::ZERO, 0, Some(e1));
        let b = attacker(&mut world, Vec3::new(50.0, 0.0, 0.0), 0, Some(e2));
        let c = attacker(&mut world, Vec3::new(0.0, 60.0, 0.0), 0, None);

        run_once(&mut world, clump_separation_system);

        for e in [a, b, c] {
            assert_eq!(world.get::<Force>(e).unwrap().value, Vec3::ZERO);
        }
    }

    #[test]
    fn test_opposing_teams_always_separate() {
        let mut world = world(1.0);
        let a = attacker(&mut world, Vec3::ZERO, 0, None);
        let b = attacker(&mut world, Vec3::new(0.0, 40.0, 0.0), 1, None);

        run_once(&mut world, clump_separation_system);

        let fa = world.get::<Force>(a).unwrap().value;
        let fb = world.get::<Force>(b).unwrap().value;
        assert!(fa.y < 0.0 && fb.y > 0.0);
        // (100 * 1 - 40) * 25
        assert!((fb.y - 1500.0).abs() < 1e-2);
    }

    #[test]
    fn test_separation_adds_to_existing_force() {
        let mut world = world(1.0);
        let a = attacker(&mut world, Vec3::ZERO, 0, None);
        let _b = attacker(&mut world, Vec3::new(40.0, 0.0, 0.0), 1, None);
        world.get_mut::<Force>(a).unwrap().value = Vec3::new(0.0, 7.0, 0.0);

        run_once(&mut world, clump_separation_system);

        let fa = world.get::<Force>(a).unwrap().value;
        assert!((fa.y - 7.0).abs() < 1e-4);
        assert!(fa.x < 0.0);
    }

    #[test]
    fn test_coincident_agents_get_opposite_pushes() {
        let mut world = world(1.0);
        let a = attacker(&mut world, Vec3::ZERO, 0, None);
        let b = attacker(&mut world, Vec3::ZERO, 1, None);

        run_once(&mut world, clump_separation_system);

        let fa = world.get::<Force>(a).unwrap().value;
        let fb = world.get::<Force>(b).unwrap().value;
        assert!(!fa.is_nan() && fa.length() > 0.0);
        assert!((fa + fb).length() < 1e-2);
    }

    #[test]
    fn test_dead_agents_excluded_from_separation() {
        let mut world = world(1.0);
        let a = attacker(&mut world, Vec3::ZERO, 0, None);
        let b = attacker(&mut world, Vec3::new(30.0, 0.0, 0.0), 1, None);
        world.entity_mut(b).insert(Dead);

        run_once(&mut world, clump_separation_system);

        assert_eq!(world.get::<Force>(a).unwrap().value, Vec3::ZERO);
        assert_eq!(world.get::<Force>(b).unwrap().value, Vec3::ZERO);
    }

    #[test]
    fn test_clump_gate_waits_for_interval() {
        let mut world = world(0.1);
        let a = attacker(&mut world, Vec3::ZERO, 0, None);
        let _b = attacker(&mut world, Vec3::new(40.0, 0.0, 0.0), 1, None);

        let mut schedule = Schedule::default();
        schedule.add_systems(clump_separation_system);
        schedule.run(&mut world);
        schedule.run(&mut world);
        assert_eq!(world.get::<Force>(a).unwrap().value, Vec3::ZERO);
        schedule.run(&mut world);
        assert!(world.get::<Force>(a).unwrap().value.x < 0.0);
    }

    #[test]
    fn test_soft_avoidance_pushes_back_onto_surface() {
        let mut grid = NavGrid::new(10, 10, 100.0, 0.0, 0.0);
        grid.fill_rect((450.0, 0.0), (1000.0, 1000.0), NavCell::Blocked);
        let mut world = world(1.0);
        world.insert_resource(NavigationResource::new(grid));
        let agent = world.spawn(AgentBundle::at(Vec3::new(470.0, 250.0, 0.0))).id();

        run_once(&mut world, soft_avoidance_system);

        let force = world.get::<Force>(agent).unwrap().value;
        assert!(force.x < 0.0);
        assert!((force.length() - 1500.0).abs() < 1e-2);
        assert!(world.entity(agent).contains::<NeedsSoftAvoidance>());
    }

    #[test]
    fn test_soft_avoidance_ring_search_escapes_dirty_area() {
        let mut grid = NavGrid::new(20, 20, 100.0, 0.0, 0.0);
        grid.fill_rect((0.0, 0.0), (2000.0, 2000.0), NavCell::Dirty);
        grid.fill_rect((1200.0, 0.0), (2000.0, 2000.0), NavCell::Walkable);
        let mut world = world(1.0);
        world.insert_resource(NavigationResource::new(grid));
        let agent = world.spawn(AgentBundle::at(Vec3::new(1050.0, 1000.0, 0.0))).id();

        run_once(&mut world, soft_avoidance_system);

        let force = world.get::<Force>(agent).unwrap().value;
        assert!(force.x > 0.0, "expected a push toward the clean side, got {force:?}");
        assert!(world.entity(agent).contains::<NeedsSoftAvoidance>());
    }

    #[test]
    fn test_soft_avoidance_clears_tag_on_clean_surface() {
        let grid = NavGrid::new(10, 10, 100.0, 0.0, 0.0);
        let mut world = world(1.0);
        world.insert_resource(NavigationResource::new(grid));
        let agent = world.spawn((AgentBundle::at(Vec3::new(250.0, 250.0, 0.0)), NeedsSoftAvoidance)).id();
        let flying = AgentBundle {
            characteristics: AgentCharacteristics {
                is_flying: true,
                ..Default::default()
            },
            ..AgentBundle::at(Vec3::new(5000.0, 0.0, 0.0))
        };
        let flyer = world.spawn((flying, NeedsSoftAvoidance)).id();

        run_once(&mut world, soft_avoidance_system);

        assert!(!world.entity(agent).contains::<NeedsSoftAvoidance>());
        assert!(!world.entity(flyer).contains::<NeedsSoftAvoidance>());
        assert_eq!(world.get::<Force>(agent).unwrap().value, Vec3::ZERO);
        assert_eq!(world.get::<Force>(flyer).unwrap().value, Vec3::ZERO);
    }

    #[test]
    fn test_soft_avoidance_without_navigation_is_skipped() {
        let mut world = world(1.0);
        let agent = world.spawn((AgentBundle::default(), NeedsSoftAvoidance)).id();
        run_once(&mut world, soft_avoidance_system);
        assert!(world.entity(agent).contains::<NeedsSoftAvoidance>());
    }

    #[test]
    fn test_neighbor_deflection_is_lateral() {
        let mut world = world(1.0);
        world.insert_resource(ObstacleGrid::new(100.0));
        let bundle = AgentBundle {
            move_target: MoveTarget::move_to(Vec3::new(2000.0, 0.0, 0.0), 300.0),
            ..AgentBundle::at(Vec3::ZERO)
        };
        let mover = world.spawn((bundle, Run)).id();
        world.entity_mut(mover).remove::<Idle>();
        // Slightly left of the path, inside the desired spacing.
        world.spawn(AgentBundle::at(Vec3::new(60.0, 20.0, 0.0)));

        run_once(&mut world, (obstacle_registration_system, neighbor_avoidance_system).chain());

        let force = world.get::<Force>(mover).unwrap().value;
        assert!(force.y < 0.0, "pushed to the right, got {force:?}");
        assert!(force.x.abs() < 1e-3);
    }

    #[test]
    fn test_idle_agents_skip_neighbor_deflection() {
        let mut world = world(1.0);
        world.insert_resource(ObstacleGrid::new(100.0));
        let idle = world.spawn(AgentBundle::at(Vec3::ZERO)).id();
        world.spawn(AgentBundle::at(Vec3::new(10.0, 10.0, 0.0)));

        run_once(&mut world, (obstacle_registration_system, neighbor_avoidance_system).chain());

        assert_eq!(world.get::<Force>(idle).unwrap().value, Vec3::ZERO);
    }
}
