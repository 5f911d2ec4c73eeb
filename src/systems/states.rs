//! State/behavior glue.
//!
//! Small timer and condition state machines driven by tags. Every state
//! change goes through [`TransitionState`], a deferred entity command that
//! swaps the state tag, resets the state timer and refuses to leave `Dead`.
//!
//! ## Transitions
//!
//! ```text
//! Idle ──target──▶ Chase ──in range──▶ Pause ◀──▶ Attack
//!  │  ▲              │                   │          │
//!  │  └──lost/reached┘◀─────out of range─┴──────────┘
//!  └──timeout (patrol route)──▶ Patrol ──target──▶ Chase
//! Run ──arrived──▶ Idle         IsAttacked ──timer──▶ Chase | Idle
//! any ──kill──▶ Dead ──despawn delay──▶ despawned
//! ```
//!
//! All systems here are gated by `StateConfig::interval` and advance their
//! timers by the elapsed gate time.

use crate::components::*;
use crate::config::SimConfig;
use crate::navigation::NavigationResource;
use crate::systems::movement::{horizontal, DeltaTime};
use crate::systems::performance::{IntervalGate, SimRng};
use bevy_ecs::system::EntityCommand;
use bevy_ecs::prelude::*;
use glam::Vec3;
use rand::Rng;

/// Every mutually exclusive state tag except `Dead`.
type LiveStateTags = (Idle, Run, Chase, Patrol, Attack, Pause, Build, IsAttacked);

/// Slack used while chasing, relative to attack range, so the agent always
/// stops inside the range it checks against.
const CHASE_SLACK_FRACTION: f32 = 0.5;

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Deferred state change for one agent.
///
/// Applying it to a despawned or dead agent does nothing.
#[derive(Debug, Clone, Copy)]
pub struct TransitionState(pub UnitState);

impl EntityCommand for TransitionState {
    fn apply(self, entity: Entity, world: &mut World) {
        if !world.entities().contains(entity) {
            return;
        }
        let mut agent = world.entity_mut(entity);
        if agent.contains::<Dead>() {
            return;
        }
        let location = agent.get::<Transform>().map(|t| t.translation);

        agent.remove::<LiveStateTags>();
        if let Some(mut state) = agent.get_mut::<AgentState>() {
            state.timer = 0.0;
        }

        let stands = match self.0 {
            UnitState::Idle => {
                agent.insert(Idle);
                true
            }
            UnitState::Run => {
                agent.insert(Run);
                false
            }
            UnitState::Chase => {
                agent.insert(Chase);
                false
            }
            UnitState::Patrol => {
                agent.insert(Patrol);
                false
            }
            UnitState::Attack => {
                agent.insert(Attack);
                true
            }
            UnitState::Pause => {
                agent.insert(Pause);
                true
            }
            UnitState::Build => {
                agent.insert(Build);
                true
            }
            UnitState::IsAttacked => {
                agent.insert(IsAttacked);
                true
            }
            UnitState::Dead => {
                agent.insert(Dead);
                agent.remove::<(NeedsSoftAvoidance, Charging, ChargeTimer)>();
                if let Some(mut velocity) = agent.get_mut::<Velocity>() {
                    velocity.value = Vec3::ZERO;
                }
                if let Some(mut force) = agent.get_mut::<Force>() {
                    force.value = Vec3::ZERO;
                }
                if let Some(mut steering) = agent.get_mut::<Steering>() {
                    steering.desired_velocity = Vec3::ZERO;
                }
                if let Some(mut path) = agent.get_mut::<NavigationPath>() {
                    path.reset();
                }
                true
            }
        };

        if let (true, Some(location)) = (stands, location) {
            if let Some(mut target) = agent.get_mut::<MoveTarget>() {
                *target = MoveTarget::stand_at(location);
            }
        }
        log::trace!("{:?} -> {}", entity, self.0.name());
    }
}

pub trait StateCommandsExt {
    fn transition(&mut self, state: UnitState) -> &mut Self;
}

impl StateCommandsExt for EntityCommands<'_> {
    fn transition(&mut self, state: UnitState) -> &mut Self {
        self.queue(TransitionState(state))
    }
}

fn distance_2d_squared(a: Vec3, b: Vec3) -> f32 {
    horizontal(a - b).length_squared()
}

// ============================================================================
// TARGET TRACKING
// ============================================================================

/// Refreshes last-known locations from live target handles.
///
/// A despawned target drops only the handle, so chase and orientation keep
/// heading for where it was. A dead target is dropped entirely.
///
/// ## Data Access
/// - Reads: Transform, Dead
/// - Writes: AiTarget
pub fn target_tracking_system(
    targets: Query<(&Transform, Has<Dead>)>,
    mut trackers: Query<&mut AiTarget, Without<Dead>>,
) {
    for mut target in trackers.iter_mut() {
        let Some(handle) = target.entity else {
            continue;
        };
        match targets.get(handle) {
            Ok((transform, false)) => {
                target.last_known_location = transform.translation;
                target.has_valid_target = true;
            }
            Ok((_, true)) => target.clear(),
            Err(_) => target.lose_handle(),
        }
    }
}

// ============================================================================
// STATE SYSTEMS
// ============================================================================

/// Idle agents chase a valid target, pause on it when holding position
/// with the target in range, or return to patrol after the idle timeout.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, AiTarget, CombatStats, PatrolRoute
/// - Writes: AgentState, state tags (via commands)
pub fn idle_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<
        (Entity, &Transform, &AiTarget, &CombatStats, &mut AgentState, Option<&PatrolRoute>),
        (With<Idle>, Without<Dead>),
    >,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    for (entity, transform, target, stats, mut state, patrol) in query.iter_mut() {
        if target.has_valid_target {
            if !state.hold_position {
                commands.entity(entity).transition(UnitState::Chase);
                continue;
            }
            let range_sq = stats.attack_range * stats.attack_range;
            if distance_2d_squared(transform.translation, target.last_known_location) <= range_sq {
                commands.entity(entity).transition(UnitState::Pause);
                continue;
            }
        }

        state.timer += elapsed;
        let Some(route) = patrol else {
            continue;
        };
        if route.return_to_patrol && route.current.is_some() && state.timer >= config.states.idle_to_patrol_timeout {
            commands.entity(entity).transition(UnitState::Patrol);
        }
    }
}

/// Run ends when the move order is reached or cancelled.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, MoveTarget
/// - Writes: state tags (via commands)
pub fn run_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    query: Query<(Entity, &Transform, &MoveTarget), (With<Run>, Without<Dead>)>,
) {
    if gate.tick(dt.0, config.states.interval).is_none() {
        return;
    }
    for (entity, transform, move_target) in query.iter() {
        let radius = if move_target.slack_radius > 0.0 {
            move_target.slack_radius
        } else {
            config.movement.stop_distance
        };
        let arrived = distance_2d_squared(transform.translation, move_target.destination) <= radius * radius;
        if move_target.intent == MoveIntent::Stand || arrived {
            commands.entity(entity).transition(UnitState::Idle);
        }
    }
}

/// Steers chasing agents at their target until it is inside attack range.
///
/// A lost handle chases the last-known location and goes idle there.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, CombatStats, AgentState
/// - Writes: AiTarget, MoveTarget, state tags (via commands)
pub fn chase_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<
        (Entity, &Transform, &mut AiTarget, &CombatStats, &AgentState, &mut MoveTarget),
        (With<Chase>, Without<Dead>),
    >,
) {
    if gate.tick(dt.0, config.states.interval).is_none() {
        return;
    }
    for (entity, transform, mut target, stats, state, mut move_target) in query.iter_mut() {
        if !target.has_valid_target {
            commands.entity(entity).transition(UnitState::Idle);
            continue;
        }

        let range_sq = stats.attack_range * stats.attack_range;
        if distance_2d_squared(transform.translation, target.last_known_location) <= range_sq {
            if target.entity.is_some() {
                commands.entity(entity).transition(UnitState::Pause);
            } else {
                // Reached where a vanished target was last seen.
                target.clear();
                commands.entity(entity).transition(UnitState::Idle);
            }
            continue;
        }

        if !state.can_move {
            continue;
        }
        let goal = target.last_known_location;
        if move_target.intent != MoveIntent::Move || move_target.destination.distance_squared(goal) > 1.0 {
            *move_target = MoveTarget {
                slack_radius: stats.attack_range * CHASE_SLACK_FRACTION,
                ..MoveTarget::move_to(goal, stats.run_speed)
            };
        }
    }
}

/// Effective range while engaged. The capsule radius gives hysteresis
/// against the plain attack range that ends a chase.
fn engaged_range_sq(stats: &CombatStats, traits: &AgentCharacteristics) -> f32 {
    let range = stats.attack_range + traits.capsule_radius;
    range * range
}

fn lost_target_state(target: &AiTarget) -> Option<UnitState> {
    if !target.has_valid_target {
        Some(UnitState::Idle)
    } else if target.entity.is_none() {
        Some(UnitState::Chase)
    } else {
        None
    }
}

/// Attack lasts `attack_duration`, then pauses. A target that leaves the
/// engaged range is chased again.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, AiTarget, CombatStats, AgentCharacteristics
/// - Writes: AgentState, state tags (via commands)
pub fn attack_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<
        (Entity, &Transform, &AiTarget, &CombatStats, &AgentCharacteristics, &mut AgentState),
        (With<Attack>, Without<Dead>),
    >,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    for (entity, transform, target, stats, traits, mut state) in query.iter_mut() {
        if let Some(next) = lost_target_state(target) {
            commands.entity(entity).transition(next);
            continue;
        }
        if distance_2d_squared(transform.translation, target.last_known_location) > engaged_range_sq(stats, traits) {
            commands.entity(entity).transition(UnitState::Chase);
            continue;
        }
        state.timer += elapsed;
        if state.timer >= config.states.attack_duration {
            commands.entity(entity).transition(UnitState::Pause);
        }
    }
}

/// Pause between attacks. Returns to attack after `pause_duration` while
/// the target is in range.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, AiTarget, CombatStats, AgentCharacteristics
/// - Writes: AgentState, state tags (via commands)
pub fn pause_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<
        (Entity, &Transform, &AiTarget, &CombatStats, &AgentCharacteristics, &mut AgentState),
        (With<Pause>, Without<Dead>),
    >,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    for (entity, transform, target, stats, traits, mut state) in query.iter_mut() {
        if let Some(next) = lost_target_state(target) {
            commands.entity(entity).transition(next);
            continue;
        }
        state.timer += elapsed;
        if state.timer < config.states.pause_duration {
            continue;
        }
        let in_range =
            distance_2d_squared(transform.translation, target.last_known_location) <= engaged_range_sq(stats, traits);
        let next = match (in_range, state.hold_position) {
            (true, _) => UnitState::Attack,
            (false, true) => UnitState::Idle,
            (false, false) => UnitState::Chase,
        };
        commands.entity(entity).transition(next);
    }
}

/// Hit reaction: after `is_attacked_duration` the agent chases its target
/// or goes idle.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, AiTarget
/// - Writes: AgentState, state tags (via commands)
pub fn is_attacked_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<(Entity, &AiTarget, &mut AgentState), (With<IsAttacked>, Without<Dead>)>,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    for (entity, target, mut state) in query.iter_mut() {
        state.timer += elapsed;
        if state.timer <= config.states.is_attacked_duration {
            continue;
        }
        let next = if target.has_valid_target {
            UnitState::Chase
        } else {
            UnitState::Idle
        };
        commands.entity(entity).transition(next);
    }
}

/// Random point within `radius` of `anchor`, snapped to the navigation
/// surface when one is available.
fn random_patrol_point(
    rng: &mut SimRng,
    nav: Option<&NavigationResource>,
    anchor: Vec3,
    radius: f32,
    extent_z: f32,
) -> Vec3 {
    if radius <= 0.0 {
        return anchor;
    }
    let angle = rng.0.gen_range(0.0..std::f32::consts::TAU);
    let distance = radius * rng.0.gen::<f32>().sqrt();
    let point = anchor + Vec3::new(angle.cos(), angle.sin(), 0.0) * distance;
    let Some(nav) = nav else {
        return point;
    };
    match nav.0.project_point(point, Vec3::new(radius, radius, extent_z)) {
        Some(hit) if !hit.dirty => hit.location,
        _ => anchor,
    }
}

/// Wanders around the current patrol waypoint, advancing the route each
/// time a random point is reached.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, NavigationResource, Transform, AiTarget, CombatStats
/// - Writes: SimRng, PatrolRoute, MoveTarget, AgentState, state tags (via commands)
pub fn patrol_state_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut rng: ResMut<SimRng>,
    nav: Option<Res<NavigationResource>>,
    mut query: Query<
        (
            Entity,
            &Transform,
            &AiTarget,
            &CombatStats,
            &mut PatrolRoute,
            &mut MoveTarget,
            &mut AgentState,
        ),
        (With<Patrol>, Without<Dead>),
    >,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    let stop = config.movement.stop_distance;
    for (entity, transform, target, stats, mut route, mut move_target, mut state) in query.iter_mut() {
        if target.has_valid_target {
            commands.entity(entity).transition(UnitState::Chase);
            continue;
        }
        state.timer += elapsed;

        let moving = move_target.intent == MoveIntent::Move;
        let reached = distance_2d_squared(transform.translation, move_target.destination) <= stop * stop;
        if moving && !reached {
            continue;
        }
        if moving {
            route.advance();
        }
        let Some(anchor) = route.current_waypoint() else {
            commands.entity(entity).transition(UnitState::Idle);
            continue;
        };
        let point = random_patrol_point(
            &mut rng,
            nav.as_deref(),
            anchor,
            route.random_radius,
            config.avoidance.soft.projection_extent_z,
        );
        *move_target = MoveTarget::move_to(point, stats.run_speed);
    }
}

/// Reverts charge speed boosts once their duration has elapsed.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig
/// - Writes: ChargeTimer, MoveTarget, CombatStats, Charging (via commands)
pub fn charge_monitor_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<(Entity, &mut ChargeTimer, &mut MoveTarget, &mut CombatStats), Without<Dead>>,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    for (entity, mut charge, mut move_target, mut stats) in query.iter_mut() {
        charge.elapsed += elapsed;
        if charge.elapsed < charge.duration {
            continue;
        }
        if let Some(speed) = charge.original_desired_speed {
            move_target.desired_speed = speed;
        }
        if let Some(speed) = charge.original_run_speed {
            stats.run_speed = speed;
        }
        commands.entity(entity).remove::<(ChargeTimer, Charging)>();
    }
}

/// Agents removed by the death stage, for the host to tear down visuals.
#[derive(Resource, Debug, Default)]
pub struct DespawnLog {
    pub despawned: Vec<(Entity, Option<VisualHandle>)>,
}

/// Despawns dead agents once `despawn_delay` has passed and records their
/// visual handles in [`DespawnLog`].
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, VisualProxy
/// - Writes: AgentState, DespawnLog, despawns (via commands)
pub fn death_system(
    mut commands: Commands,
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    despawn_log: Option<ResMut<DespawnLog>>,
    mut query: Query<(Entity, &mut AgentState, Option<&VisualProxy>), With<Dead>>,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.interval) else {
        return;
    };
    let mut removed = Vec::new();
    for (entity, mut state, proxy) in query.iter_mut() {
        state.timer += elapsed;
        if state.timer >= config.states.despawn_delay {
            commands.entity(entity).despawn();
            removed.push((entity, proxy.map(|p| p.handle)));
        }
    }
    if removed.is_empty() {
        return;
    }
    log::debug!("despawning {} dead agents", removed.len());
    if let Some(mut despawn_log) = despawn_log {
        despawn_log.despawned.extend(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::NavGrid;

    fn world() -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(DeltaTime(0.1));
        world.insert_resource(SimRng::seeded(7));
        world.insert_resource(DespawnLog::default());
        world
    }

    fn enter(world: &mut World, entity: Entity, state: UnitState) {
        TransitionState(state).apply(entity, world);
    }

    fn state_of(world: &World, entity: Entity) -> Option<UnitState> {
        UnitState::of(world.entity(entity))
    }

    fn run<M>(world: &mut World, systems: impl IntoSystemConfigs<M>, ticks: usize) {
        let mut schedule = Schedule::default();
        schedule.add_systems(systems);
        for _ in 0..ticks {
            schedule.run(world);
        }
    }

    fn targeting(world: &mut World, at: Vec3, enemy: Entity, enemy_at: Vec3) -> Entity {
        world
            .spawn(AgentBundle {
                target: AiTarget::tracking(enemy, enemy_at),
                ..AgentBundle::at(at)
            })
            .id()
    }

    #[test]
    fn test_transition_swaps_tags_and_resets_timer() {
        let mut world = world();
        let e = world.spawn(AgentBundle::at(Vec3::ZERO)).id();
        world.get_mut::<AgentState>(e).unwrap().timer = 4.0;
        enter(&mut world, e, UnitState::Chase);

        assert_eq!(state_of(&world, e), Some(UnitState::Chase));
        assert!(!world.entity(e).contains::<Idle>());
        assert_eq!(world.get::<AgentState>(e).unwrap().timer, 0.0);
    }

    #[test]
    fn test_dead_is_terminal_and_zeroes_motion() {
        let mut world = world();
        let e = world.spawn(AgentBundle::at(Vec3::ZERO)).id();
        world.get_mut::<Velocity>(e).unwrap().value = Vec3::new(300.0, 0.0, 0.0);
        world.get_mut::<Force>(e).unwrap().value = Vec3::new(10.0, 0.0, 0.0);
        enter(&mut world, e, UnitState::Dead);
        enter(&mut world, e, UnitState::Idle);

        assert_eq!(state_of(&world, e), Some(UnitState::Dead));
        assert!(!world.entity(e).contains::<Idle>());
        assert_eq!(world.get::<Velocity>(e).unwrap().value, Vec3::ZERO);
        assert_eq!(world.get::<Force>(e).unwrap().value, Vec3::ZERO);
    }

    #[test]
    fn test_transition_on_despawned_agent_is_noop() {
        let mut world = world();
        let e = world.spawn(AgentBundle::default()).id();
        world.despawn(e);
        enter(&mut world, e, UnitState::Chase);
    }

    #[test]
    fn test_tracking_refreshes_and_loses_handles() {
        let mut world = world();
        let enemy = world.spawn(AgentBundle::at(Vec3::new(100.0, 0.0, 0.0))).id();
        let hunter = targeting(&mut world, Vec3::ZERO, enemy, Vec3::ZERO);

        run(&mut world, target_tracking_system, 1);
        let target = *world.get::<AiTarget>(hunter).unwrap();
        assert_eq!(target.last_known_location, Vec3::new(100.0, 0.0, 0.0));

        world.despawn(enemy);
        run(&mut world, target_tracking_system, 1);
        let target = *world.get::<AiTarget>(hunter).unwrap();
        assert!(target.entity.is_none());
        assert!(target.has_valid_target);
        assert_eq!(target.last_known_location, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn test_dead_target_is_dropped() {
        let mut world = world();
        let enemy = world.spawn((AgentBundle::at(Vec3::new(100.0, 0.0, 0.0)), Dead)).id();
        let hunter = targeting(&mut world, Vec3::ZERO, enemy, Vec3::ZERO);
        run(&mut world, target_tracking_system, 1);
        assert!(!world.get::<AiTarget>(hunter).unwrap().has_valid_target);
    }

    #[test]
    fn test_idle_with_target_starts_chase() {
        let mut world = world();
        let enemy = world.spawn(AgentBundle::at(Vec3::new(1000.0, 0.0, 0.0))).id();
        let hunter = targeting(&mut world, Vec3::ZERO, enemy, Vec3::new(1000.0, 0.0, 0.0));
        run(&mut world, idle_state_system, 1);
        assert_eq!(state_of(&world, hunter), Some(UnitState::Chase));
    }

    #[test]
    fn test_hold_position_pauses_only_in_range() {
        let mut world = world();
        let enemy = world.spawn(AgentBundle::at(Vec3::new(1000.0, 0.0, 0.0))).id();
        let far = targeting(&mut world, Vec3::ZERO, enemy, Vec3::new(1000.0, 0.0, 0.0));
        let near = targeting(&mut world, Vec3::new(900.0, 0.0, 0.0), enemy, Vec3::new(1000.0, 0.0, 0.0));
        for e in [far, near] {
            world.get_mut::<AgentState>(e).unwrap().hold_position = true;
        }
        run(&mut world, idle_state_system, 1);
        assert_eq!(state_of(&world, far), Some(UnitState::Idle));
        assert_eq!(state_of(&world, near), Some(UnitState::Pause));
    }

    #[test]
    fn test_idle_returns_to_patrol_after_timeout() {
        let mut world = world();
        let e = world
            .spawn((AgentBundle::at(Vec3::ZERO), PatrolRoute::new(vec![Vec3::new(500.0, 0.0, 0.0)])))
            .id();
        run(&mut world, idle_state_system, 29);
        assert_eq!(state_of(&world, e), Some(UnitState::Idle));
        run(&mut world, idle_state_system, 2);
        assert_eq!(state_of(&world, e), Some(UnitState::Patrol));
    }

    #[test]
    fn test_chase_steers_then_pauses_in_range() {
        let mut world = world();
        let goal = Vec3::new(1000.0, 0.0, 0.0);
        let enemy = world.spawn(AgentBundle::at(goal)).id();
        let hunter = targeting(&mut world, Vec3::ZERO, enemy, goal);
        enter(&mut world, hunter, UnitState::Chase);

        run(&mut world, chase_state_system, 1);
        let move_target = *world.get::<MoveTarget>(hunter).unwrap();
        assert_eq!(move_target.intent, MoveIntent::Move);
        assert_eq!(move_target.destination, goal);
        assert_eq!(move_target.desired_speed, CombatStats::default().run_speed);

        world.get_mut::<Transform>(hunter).unwrap().translation = Vec3::new(900.0, 0.0, 0.0);
        run(&mut world, chase_state_system, 1);
        assert_eq!(state_of(&world, hunter), Some(UnitState::Pause));
        assert_eq!(world.get::<MoveTarget>(hunter).unwrap().intent, MoveIntent::Stand);
    }

    #[test]
    fn test_chase_to_last_known_location_then_idle() {
        let mut world = world();
        let spot = Vec3::new(500.0, 0.0, 0.0);
        let hunter = world
            .spawn((
                AgentBundle {
                    target: AiTarget {
                        entity: None,
                        last_known_location: spot,
                        has_valid_target: true,
                    },
                    ..AgentBundle::at(Vec3::new(450.0, 0.0, 0.0))
                },
                Chase,
            ))
            .id();
        world.entity_mut(hunter).remove::<Idle>();
        run(&mut world, chase_state_system, 1);

        assert_eq!(state_of(&world, hunter), Some(UnitState::Idle));
        assert!(!world.get::<AiTarget>(hunter).unwrap().has_valid_target);
    }

    #[test]
    fn test_attack_pause_cycle() {
        let mut world = world();
        let enemy_at = Vec3::new(100.0, 0.0, 0.0);
        let enemy = world.spawn(AgentBundle::at(enemy_at)).id();
        let e = targeting(&mut world, Vec3::ZERO, enemy, enemy_at);
        enter(&mut world, e, UnitState::Attack);

        let mut schedule = Schedule::default();
        schedule.add_systems((attack_state_system, pause_state_system).chain());
        let mut seen = Vec::new();
        for _ in 0..20 {
            schedule.run(&mut world);
            seen.extend(state_of(&world, e));
        }
        let first_pause = seen.iter().position(|s| *s == UnitState::Pause);
        assert!(first_pause.is_some());
        assert!(seen[first_pause.unwrap()..].contains(&UnitState::Attack));
        assert!(seen.iter().all(|s| matches!(s, UnitState::Attack | UnitState::Pause)));
    }

    #[test]
    fn test_attack_out_of_range_returns_to_chase() {
        let mut world = world();
        let enemy_at = Vec3::new(1000.0, 0.0, 0.0);
        let enemy = world.spawn(AgentBundle::at(enemy_at)).id();
        let e = targeting(&mut world, Vec3::ZERO, enemy, enemy_at);
        enter(&mut world, e, UnitState::Attack);
        run(&mut world, attack_state_system, 1);
        assert_eq!(state_of(&world, e), Some(UnitState::Chase));
    }

    #[test]
    fn test_is_attacked_expires_to_idle_or_chase() {
        let mut world = world();
        let enemy = world.spawn(AgentBundle::at(Vec3::new(800.0, 0.0, 0.0))).id();
        let alone = world.spawn(AgentBundle::at(Vec3::ZERO)).id();
        let engaged = targeting(&mut world, Vec3::ZERO, enemy, Vec3::new(800.0, 0.0, 0.0));
        enter(&mut world, alone, UnitState::IsAttacked);
        enter(&mut world, engaged, UnitState::IsAttacked);

        run(&mut world, is_attacked_state_system, 4);
        assert_eq!(state_of(&world, alone), Some(UnitState::IsAttacked));
        run(&mut world, is_attacked_state_system, 2);
        assert_eq!(state_of(&world, alone), Some(UnitState::Idle));
        assert_eq!(state_of(&world, engaged), Some(UnitState::Chase));
    }

    #[test]
    fn test_patrol_picks_points_near_waypoint() {
        let mut world = world();
        let waypoint = Vec3::new(2000.0, 0.0, 0.0);
        let e = world.spawn((AgentBundle::at(Vec3::ZERO), PatrolRoute::new(vec![waypoint]))).id();
        enter(&mut world, e, UnitState::Patrol);
        run(&mut world, patrol_state_system, 1);

        let move_target = *world.get::<MoveTarget>(e).unwrap();
        assert_eq!(move_target.intent, MoveIntent::Move);
        assert!(move_target.destination.distance(waypoint) <= 500.0 + 1e-3);
    }

    #[test]
    fn test_patrol_point_snaps_to_navigation() {
        let mut world = world();
        world.insert_resource(NavigationResource::new(NavGrid::centered(40, 40, 100.0)));
        let e = world.spawn((AgentBundle::at(Vec3::ZERO), PatrolRoute::new(vec![Vec3::ZERO]))).id();
        enter(&mut world, e, UnitState::Patrol);
        run(&mut world, patrol_state_system, 1);
        assert!(world.get::<MoveTarget>(e).unwrap().destination.length() <= 500.0 + 1e-3);
    }

    #[test]
    fn test_run_arrival_goes_idle() {
        let mut world = world();
        let e = world
            .spawn(AgentBundle {
                move_target: MoveTarget::move_to(Vec3::new(20.0, 0.0, 0.0), 300.0),
                ..AgentBundle::at(Vec3::ZERO)
            })
            .id();
        enter(&mut world, e, UnitState::Run);
        run(&mut world, run_state_system, 1);
        assert_eq!(state_of(&world, e), Some(UnitState::Idle));
    }

    #[test]
    fn test_charge_reverts_speed() {
        let mut world = world();
        let e = world
            .spawn((
                AgentBundle {
                    move_target: MoveTarget::move_to(Vec3::new(5000.0, 0.0, 0.0), 1200.0),
                    ..AgentBundle::at(Vec3::ZERO)
                },
                ChargeTimer {
                    elapsed: 0.0,
                    duration: 0.25,
                    original_desired_speed: Some(400.0),
                    original_run_speed: Some(450.0),
                },
                Charging,
            ))
            .id();
        run(&mut world, charge_monitor_system, 2);
        assert!(world.entity(e).contains::<Charging>());
        run(&mut world, charge_monitor_system, 1);

        assert_eq!(world.get::<MoveTarget>(e).unwrap().desired_speed, 400.0);
        assert_eq!(world.get::<CombatStats>(e).unwrap().run_speed, 450.0);
        assert!(!world.entity(e).contains::<Charging>());
        assert!(world.get::<ChargeTimer>(e).is_none());
    }

    #[test]
    fn test_dead_agents_despawn_after_delay() {
        let mut world = world();
        let e = world.spawn(AgentBundle::at(Vec3::ZERO)).id();
        enter(&mut world, e, UnitState::Dead);
        run(&mut world, death_system, 45);
        assert!(world.entities().contains(e));
        run(&mut world, death_system, 10);
        assert!(!world.entities().contains(e));
        assert_eq!(world.resource::<DespawnLog>().despawned, vec![(e, None)]);
    }
}
