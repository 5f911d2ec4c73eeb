//! Public API for the simulation.
//!
//! `SimWorld` is the simulation context a host loop owns: it holds the ECS
//! world, the stage schedule and the receiving end of the visual sync
//! channel. Gameplay code writes intents through it; the visual layer reads
//! transforms by draining it.
//!
//! ## Stage Order
//!
//! 1. LOD assignment, target tracking, background path results
//! 2. movement intent → obstacle registration → soft avoidance → clump
//!    separation → neighbor avoidance → integration → orientation → actor sync
//! 3. state glue and gameplay effects
//!
//! ## Timestep
//!
//! Without a configured fixed timestep, `step(dt)` runs exactly one tick with
//! the frame delta, which is also what drives the dynamic sync interval. With
//! one, it accumulates time and runs as many fixed ticks as fit.

use crate::components::*;
use crate::config::{PathfindingMode, SimConfig};
use crate::error::{SimError, SimResult};
use crate::navigation::{NavigationResource, NavigationSurface, PathJobs};
use crate::spatial::{obstacle_registration_system, ObstacleGrid};
use crate::systems::*;
use crate::world::Snapshot;
use bevy_ecs::prelude::*;
use bevy_ecs::system::EntityCommand;
use glam::Vec3;

/// Everything needed to spawn one agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub location: Vec3,
    pub rotation: glam::Quat,
    pub params: MovementParams,
    pub stats: CombatStats,
    pub characteristics: AgentCharacteristics,
    pub yaw_follow: YawFollow,
    pub hold_position: bool,
    pub patrol: Option<PatrolRoute>,
    /// Visual actor already created by the host for this agent.
    pub visual: Option<VisualHandle>,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            location: Vec3::ZERO,
            rotation: glam::Quat::IDENTITY,
            params: MovementParams::default(),
            stats: CombatStats::default(),
            characteristics: AgentCharacteristics::default(),
            yaw_follow: YawFollow::default(),
            hold_position: false,
            patrol: None,
            visual: None,
        }
    }
}

impl AgentSpec {
    pub fn at(location: Vec3) -> Self {
        Self {
            location,
            ..Default::default()
        }
    }

    pub fn team(mut self, team_id: u8) -> Self {
        self.stats.team_id = team_id;
        self
    }

    pub fn with_visual(mut self, handle: VisualHandle) -> Self {
        self.visual = Some(handle);
        self
    }

    pub fn flying(mut self) -> Self {
        self.characteristics.is_flying = true;
        self
    }
}

/// The main simulation world container.
pub struct SimWorld {
    world: World,
    schedule: Schedule,
    visuals: VisualUpdateReceiver,
    tick: u64,
    time: f32,
    /// Accumulated time for fixed timestep.
    time_accumulator: f32,
}

impl SimWorld {
    /// Create a simulation world with default configuration.
    pub fn new() -> Self {
        Self::build(SimConfig::default())
    }

    /// Create a simulation world with a validated custom configuration.
    pub fn with_config(mut config: SimConfig) -> SimResult<Self> {
        config.validate()?;
        config.normalize();
        Ok(Self::build(config))
    }

    fn build(config: SimConfig) -> Self {
        let mut world = World::new();
        let (queue, visuals) = actor_sync_channel();

        world.insert_resource(DeltaTime(0.0));
        world.insert_resource(SimTick(0));
        world.insert_resource(ObstacleGrid::new(config.obstacles.cell_size));
        world.insert_resource(SimRng::seeded(config.seed));
        world.insert_resource(EffectQueue::default());
        world.insert_resource(DespawnLog::default());
        world.insert_resource(queue);
        world.insert_resource(config);

        let mut schedule = Schedule::default();

        // Group 1: per-tick bookkeeping read by the movement chain
        schedule.add_systems((lod_assignment_system, target_tracking_system, path_result_system));

        // Group 2: movement pipeline, strictly ordered
        schedule.add_systems(
            (
                movement_intent_system,
                obstacle_registration_system,
                soft_avoidance_system,
                clump_separation_system,
                neighbor_avoidance_system,
                integration_system,
                orientation_system,
                actor_sync_system,
            )
                .chain()
                .after(lod_assignment_system)
                .after(target_tracking_system)
                .after(path_result_system),
        );

        // Group 3: behavior glue, sees this tick's motion
        schedule.add_systems(
            (
                run_state_system,
                idle_state_system,
                chase_state_system,
                attack_state_system,
                pause_state_system,
                is_attacked_state_system,
                patrol_state_system,
                charge_monitor_system,
                gameplay_effect_system,
                death_system,
            )
                .chain()
                .after(actor_sync_system),
        );

        Self {
            world,
            schedule,
            visuals,
            tick: 0,
            time: 0.0,
            time_accumulator: 0.0,
        }
    }

    /// Attach a navigation surface. In background pathfinding mode this also
    /// starts the path worker thread.
    pub fn with_navigation(mut self, surface: impl NavigationSurface + 'static) -> SimResult<Self> {
        let nav = NavigationResource::new(surface);
        if self.config().movement.pathfinding == PathfindingMode::Background {
            let jobs = PathJobs::spawn(nav.0.clone())?;
            self.world.insert_resource(jobs);
        }
        self.world.insert_resource(nav);
        Ok(self)
    }

    pub fn config(&self) -> &SimConfig {
        self.world.resource::<SimConfig>()
    }

    // ------------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------------

    /// Step the simulation forward by `dt` seconds.
    pub fn step(&mut self, dt: f32) {
        if !dt.is_finite() || dt <= 0.0 {
            log::debug!("ignoring step with dt {dt}");
            return;
        }
        let Some(fixed_dt) = self.config().fixed_timestep else {
            self.run_tick(dt);
            return;
        };

        self.time_accumulator += dt;
        while self.time_accumulator >= fixed_dt {
            self.run_tick(fixed_dt);
            self.time_accumulator -= fixed_dt;
        }
    }

    fn run_tick(&mut self, dt: f32) {
        self.world.resource_mut::<DeltaTime>().0 = dt;
        self.world.resource_mut::<SimTick>().increment();

        self.schedule.run(&mut self.world);

        self.tick += 1;
        self.time += dt;
    }

    /// Get the current tick number.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Get the elapsed simulation time.
    pub fn current_time(&self) -> f32 {
        self.time
    }

    // ------------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------------

    pub fn spawn_agent(&mut self, spec: AgentSpec) -> Entity {
        let transform = Transform::from_translation(spec.location).with_rotation(spec.rotation);
        let bundle = AgentBundle {
            transform,
            params: spec.params,
            stats: spec.stats,
            characteristics: spec.characteristics,
            yaw_follow: spec.yaw_follow,
            state: AgentState {
                hold_position: spec.hold_position,
                ..Default::default()
            },
            ..AgentBundle::at(spec.location)
        };
        let mut agent = self.world.spawn(bundle);
        if let Some(handle) = spec.visual {
            agent.insert(VisualProxy::new(handle, transform));
        }
        if let Some(route) = spec.patrol {
            agent.insert(route);
        }
        agent.id()
    }

    /// Remove an agent immediately. Returns its visual handle, if it had one,
    /// so the host can destroy the actor.
    pub fn despawn_agent(&mut self, entity: Entity) -> SimResult<Option<VisualHandle>> {
        self.agent(entity)?;
        let handle = self.world.get::<VisualProxy>(entity).map(|p| p.handle);
        self.world.despawn(entity);
        self.world.resource_mut::<ObstacleGrid>().remove(entity);
        Ok(handle)
    }

    pub fn agent_count(&mut self) -> usize {
        let mut query = self.world.query_filtered::<Entity, With<AgentState>>();
        query.iter(&self.world).count()
    }

    pub fn state_of(&self, entity: Entity) -> Option<UnitState> {
        if !self.world.entities().contains(entity) {
            return None;
        }
        UnitState::of(self.world.entity(entity))
    }

    /// Order an agent to move. It runs until it arrives, then idles.
    pub fn set_move_target(&mut self, entity: Entity, destination: Vec3, speed: f32) -> SimResult<()> {
        self.live_agent(entity)?;
        if let Some(mut target) = self.world.get_mut::<MoveTarget>(entity) {
            *target = MoveTarget::move_to(destination, speed);
        }
        self.transition(entity, UnitState::Run);
        Ok(())
    }

    /// Cancel movement and idle in place.
    pub fn stand(&mut self, entity: Entity) -> SimResult<()> {
        self.live_agent(entity)?;
        self.transition(entity, UnitState::Idle);
        Ok(())
    }

    /// Point the agent at another agent, or clear its target with `None`.
    pub fn set_ai_target(&mut self, entity: Entity, target: Option<Entity>) -> SimResult<()> {
        self.live_agent(entity)?;
        let next = match target {
            Some(target) => {
                let location = self.live_agent(target)?;
                AiTarget::tracking(target, location)
            }
            None => AiTarget::default(),
        };
        if let Some(mut current) = self.world.get_mut::<AiTarget>(entity) {
            *current = next;
        }
        Ok(())
    }

    /// Report viewport/fog-of-war visibility for an agent's visual.
    pub fn set_visible(&mut self, entity: Entity, visible: bool) -> SimResult<()> {
        self.agent(entity)?;
        if let Some(mut proxy) = self.world.get_mut::<VisualProxy>(entity) {
            proxy.visible = visible;
        }
        Ok(())
    }

    /// External damage event. Unengaged agents react, and pick up the
    /// attacker as their target if they have none.
    pub fn notify_damaged(&mut self, entity: Entity, attacker: Option<Entity>) -> SimResult<()> {
        self.live_agent(entity)?;
        if let Some(attacker) = attacker {
            let location = self.live_agent(attacker).ok();
            if let (Some(location), Some(mut target)) = (location, self.world.get_mut::<AiTarget>(entity)) {
                if !target.has_valid_target {
                    *target = AiTarget::tracking(attacker, location);
                }
            }
        }
        let engaged = matches!(
            self.state_of(entity),
            Some(UnitState::Attack | UnitState::Pause | UnitState::Chase)
        );
        if !engaged {
            self.transition(entity, UnitState::IsAttacked);
        }
        Ok(())
    }

    /// Kill an agent. It stops at once and despawns after the despawn delay.
    pub fn kill(&mut self, entity: Entity) -> SimResult<()> {
        self.agent(entity)?;
        self.transition(entity, UnitState::Dead);
        self.world.resource_mut::<ObstacleGrid>().remove(entity);
        Ok(())
    }

    /// Boost move and run speed for `duration` seconds.
    pub fn start_charge(&mut self, entity: Entity, speed: f32, duration: f32) -> SimResult<()> {
        self.live_agent(entity)?;
        let previous = self.world.get::<ChargeTimer>(entity).copied();
        let mut agent = self.world.entity_mut(entity);

        let mut original_desired_speed = None;
        if let Some(mut target) = agent.get_mut::<MoveTarget>() {
            original_desired_speed = Some(target.desired_speed);
            target.desired_speed = speed;
        }
        let mut original_run_speed = None;
        if let Some(mut stats) = agent.get_mut::<CombatStats>() {
            original_run_speed = Some(stats.run_speed);
            stats.run_speed = speed;
        }
        // A charge during a charge keeps the speeds from before the first.
        let timer = ChargeTimer {
            elapsed: 0.0,
            duration,
            original_desired_speed: previous.and_then(|p| p.original_desired_speed).or(original_desired_speed),
            original_run_speed: previous.and_then(|p| p.original_run_speed).or(original_run_speed),
        };
        agent.insert((timer, Charging));
        Ok(())
    }

    /// Give the agent a patrol route and start patrolling it.
    pub fn set_patrol_route(&mut self, entity: Entity, waypoints: Vec<Vec3>) -> SimResult<()> {
        self.live_agent(entity)?;
        let patrol = !waypoints.is_empty();
        self.world.entity_mut(entity).insert(PatrolRoute::new(waypoints));
        if patrol {
            self.transition(entity, UnitState::Patrol);
        }
        Ok(())
    }

    pub fn add_effect_caster(&mut self, entity: Entity, caster: EffectCaster) -> SimResult<()> {
        self.live_agent(entity)?;
        self.world.entity_mut(entity).insert(caster);
        Ok(())
    }

    fn transition(&mut self, entity: Entity, state: UnitState) {
        TransitionState(state).apply(entity, &mut self.world);
    }

    /// Existing agent.
    fn agent(&self, entity: Entity) -> SimResult<()> {
        match self.world.get::<AgentState>(entity) {
            Some(_) => Ok(()),
            None => Err(SimError::UnknownAgent(entity)),
        }
    }

    /// Existing, living agent. Returns its location.
    fn live_agent(&self, entity: Entity) -> SimResult<Vec3> {
        self.agent(entity)?;
        if self.world.get::<Dead>(entity).is_some() {
            return Err(SimError::DeadAgent(entity));
        }
        self.world
            .get::<Transform>(entity)
            .map(|t| t.translation)
            .ok_or(SimError::UnknownAgent(entity))
    }

    // ------------------------------------------------------------------------
    // Host outputs
    // ------------------------------------------------------------------------

    /// Apply all pending visual updates. Call from the thread that owns the
    /// visual layer.
    pub fn drain_visual_updates(&self, sink: &mut dyn VisualSink) -> DrainStats {
        self.visuals.drain_into(sink)
    }

    /// A receiver for draining visual updates from another thread.
    pub fn visual_receiver(&self) -> VisualUpdateReceiver {
        self.visuals.clone()
    }

    pub fn drain_effects(&mut self) -> Vec<EffectApplication> {
        self.world.resource_mut::<EffectQueue>().drain()
    }

    /// Agents removed by the death stage since the last call.
    pub fn drain_despawned(&mut self) -> Vec<(Entity, Option<VisualHandle>)> {
        std::mem::take(&mut self.world.resource_mut::<DespawnLog>().despawned)
    }

    /// Get a snapshot of the current simulation state.
    pub fn snapshot(&mut self) -> Snapshot {
        Snapshot::from_world(&mut self.world, self.tick, self.time)
    }

    /// Get the snapshot as a JSON string.
    pub fn snapshot_json(&mut self) -> String {
        self.snapshot().to_json().unwrap_or_else(|_| "{}".to_string())
    }

    /// Get the obstacle index (for debugging/visualization).
    pub fn obstacles(&self) -> Option<&ObstacleGrid> {
        self.world.get_resource::<ObstacleGrid>()
    }

    /// Get direct access to the ECS world (for advanced usage).
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Get mutable access to the ECS world (for advanced usage).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}
