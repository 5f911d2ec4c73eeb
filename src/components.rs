//! ECS components for the mass-unit simulation.
//!
//! Components are plain data attached to agent entities. All behavior lives
//! in the systems under [`crate::systems`]. Z is up; the horizontal plane is XY
//! and an unrotated agent faces +X.

use bevy_ecs::prelude::*;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// KINEMATIC COMPONENTS
// ============================================================================

/// Authoritative simulation transform. The visual actor lags behind this and
/// is updated asynchronously by the actor-sync stage.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Unit vector the agent is facing.
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Heading around +Z in radians.
    pub fn yaw(&self) -> f32 {
        let f = self.forward();
        f.y.atan2(f.x)
    }

    /// True when translations agree within `distance` world units and
    /// rotations within `degrees`.
    pub fn approx_eq(&self, other: &Transform, distance: f32, degrees: f32) -> bool {
        self.translation.distance(other.translation) <= distance
            && self.rotation.angle_between(other.rotation) <= degrees.to_radians()
    }
}

/// Current linear velocity. Written only by the integration stage.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub value: Vec3,
}

impl Velocity {
    pub fn new(value: Vec3) -> Self {
        Self { value }
    }

    pub fn magnitude(&self) -> f32 {
        self.value.length()
    }
}

/// External steering force accumulated during this tick only.
///
/// Avoidance stages add into it; integration consumes it and zeroes it.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Force {
    pub value: Vec3,
}

/// Desired velocity produced by movement intent and avoidance.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Steering {
    pub desired_velocity: Vec3,
}

/// Per-agent integration limits.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementParams {
    pub max_speed: f32,
    pub max_acceleration: f32,
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            max_speed: 600.0,
            max_acceleration: 1200.0,
        }
    }
}

// ============================================================================
// INTENT COMPONENTS
// ============================================================================

/// What the agent wants to do with its move target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MoveIntent {
    #[default]
    Stand,
    Move,
}

/// Destination, speed and intent set by gameplay/AI code.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveTarget {
    pub destination: Vec3,
    pub desired_speed: f32,
    pub intent: MoveIntent,
    /// Distance at which the destination counts as reached. Zero uses the
    /// configured stop distance.
    pub slack_radius: f32,
}

impl Default for MoveTarget {
    fn default() -> Self {
        Self::stand_at(Vec3::ZERO)
    }
}

impl MoveTarget {
    pub fn move_to(destination: Vec3, desired_speed: f32) -> Self {
        Self {
            destination,
            desired_speed,
            intent: MoveIntent::Move,
            slack_radius: 0.0,
        }
    }

    pub fn stand_at(location: Vec3) -> Self {
        Self {
            destination: location,
            desired_speed: 0.0,
            intent: MoveIntent::Stand,
            slack_radius: 0.0,
        }
    }
}

/// Cached navigation path and the destination it was computed for.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct NavigationPath {
    pub waypoints: Vec<Vec3>,
    /// Index of the waypoint currently being sought.
    pub next_index: usize,
    /// Destination the cached waypoints lead to.
    pub target: Option<Vec3>,
    /// A background path query is outstanding for this agent.
    pub pathfinding_in_progress: bool,
    /// Goal of the outstanding background query.
    pub pending_goal: Option<Vec3>,
}

impl NavigationPath {
    pub fn reset(&mut self) {
        self.waypoints.clear();
        self.next_index = 0;
        self.target = None;
    }

    /// Usable for steering toward `destination`.
    pub fn is_valid_for(&self, destination: Vec3) -> bool {
        self.target == Some(destination) && self.next_index < self.waypoints.len()
    }

    pub fn current_waypoint(&self) -> Option<Vec3> {
        self.waypoints.get(self.next_index).copied()
    }

    pub fn begin_query(&mut self, goal: Vec3) {
        self.pathfinding_in_progress = true;
        self.pending_goal = Some(goal);
    }

    pub fn finish_query(&mut self) {
        self.pathfinding_in_progress = false;
        self.pending_goal = None;
    }

    /// Install a fresh path. The first point is the start location, so seek
    /// the second one when there is one.
    pub fn install(&mut self, waypoints: Vec<Vec3>, target: Vec3) {
        self.next_index = if waypoints.len() > 1 { 1 } else { 0 };
        self.waypoints = waypoints;
        self.target = Some(target);
    }
}

/// Targeted entity with a last-known-location fallback.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AiTarget {
    #[serde(skip)]
    pub entity: Option<Entity>,
    pub last_known_location: Vec3,
    pub has_valid_target: bool,
}

impl AiTarget {
    pub fn tracking(entity: Entity, location: Vec3) -> Self {
        Self {
            entity: Some(entity),
            last_known_location: location,
            has_valid_target: true,
        }
    }

    /// Drop the handle but keep drifting toward where the target was.
    pub fn lose_handle(&mut self) {
        self.entity = None;
    }

    pub fn clear(&mut self) {
        self.entity = None;
        self.has_valid_target = false;
        self.last_known_location = Vec3::ZERO;
    }
}

// ============================================================================
// IDENTITY AND STATS COMPONENTS
// ============================================================================

/// Team and combat numbers read by avoidance and state glue.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombatStats {
    pub team_id: u8,
    pub attack_range: f32,
    pub run_speed: f32,
    pub sight_radius: f32,
}

impl Default for CombatStats {
    fn default() -> Self {
        Self {
            team_id: 0,
            attack_range: 150.0,
            run_speed: 600.0,
            sight_radius: 2000.0,
        }
    }
}

/// Physical traits of an agent.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentCharacteristics {
    pub capsule_radius: f32,
    pub capsule_height: f32,
    pub is_flying: bool,
    pub is_worker: bool,
    /// Visual rotation follows the movement direction.
    pub rotates_to_movement: bool,
    /// Degrees per second used when turning the visual toward movement.
    pub rotation_speed: f32,
}

impl Default for AgentCharacteristics {
    fn default() -> Self {
        Self {
            capsule_radius: 50.0,
            capsule_height: 88.0,
            is_flying: false,
            is_worker: false,
            rotates_to_movement: true,
            rotation_speed: 360.0,
        }
    }
}

/// Facing blend toward the current target.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YawFollow {
    pub offset_degrees: f32,
    pub blend_duration: f32,
    pub ease_exponent: f32,
}

impl Default for YawFollow {
    fn default() -> Self {
        Self {
            offset_degrees: 0.0,
            blend_duration: 0.25,
            ease_exponent: 1.0,
        }
    }
}

/// Per-agent state machine bookkeeping.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Seconds spent in the current state.
    pub timer: f32,
    pub can_move: bool,
    /// Hold position: engage from where it stands instead of chasing.
    pub hold_position: bool,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            timer: 0.0,
            can_move: true,
            hold_position: false,
        }
    }
}

/// Patrol route. `current` is `None` when the agent has no route.
#[derive(Component, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatrolRoute {
    pub waypoints: Vec<Vec3>,
    pub current: Option<usize>,
    pub return_to_patrol: bool,
    /// Radius around the current waypoint used to pick random patrol points.
    pub random_radius: f32,
}

impl PatrolRoute {
    pub fn new(waypoints: Vec<Vec3>) -> Self {
        let current = if waypoints.is_empty() { None } else { Some(0) };
        Self {
            waypoints,
            current,
            return_to_patrol: true,
            random_radius: 500.0,
        }
    }

    pub fn current_waypoint(&self) -> Option<Vec3> {
        self.current.and_then(|i| self.waypoints.get(i).copied())
    }

    pub fn advance(&mut self) {
        if let Some(i) = self.current {
            if !self.waypoints.is_empty() {
                self.current = Some((i + 1) % self.waypoints.len());
            }
        }
    }
}

/// Temporary speed boost that reverts when `elapsed` reaches `duration`.
#[derive(Component, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeTimer {
    pub elapsed: f32,
    pub duration: f32,
    pub original_desired_speed: Option<f32>,
    pub original_run_speed: Option<f32>,
}

// ============================================================================
// STATE TAGS
// ============================================================================
//
// Tags are zero-sized and stored as sparse sets so adding and removing them
// does not move the agent's dense fragment columns.

macro_rules! state_tag {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
            #[component(storage = "SparseSet")]
            pub struct $name;
        )*
    };
}

state_tag!(
    Idle,
    Run,
    Chase,
    Patrol,
    Attack,
    Pause,
    Build,
    IsAttacked,
    /// Terminal. Excluded from every movement, avoidance and orientation stage.
    Dead,
    Charging,
    StopMovement,
    /// Off the navigable surface; soft recovery pushes it back.
    NeedsSoftAvoidance,
    DisableObstacle,
);

/// Mutually exclusive behavior states, each backed by one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitState {
    Idle,
    Run,
    Chase,
    Patrol,
    Attack,
    Pause,
    Build,
    IsAttacked,
    Dead,
}

impl UnitState {
    pub fn name(&self) -> &'static str {
        match self {
            UnitState::Idle => "Idle",
            UnitState::Run => "Run",
            UnitState::Chase => "Chase",
            UnitState::Patrol => "Patrol",
            UnitState::Attack => "Attack",
            UnitState::Pause => "Pause",
            UnitState::Build => "Build",
            UnitState::IsAttacked => "IsAttacked",
            UnitState::Dead => "Dead",
        }
    }

    /// Read the state from an entity's tags. Dead wins over everything.
    pub fn of(entity: EntityRef) -> Option<UnitState> {
        if entity.contains::<Dead>() {
            Some(UnitState::Dead)
        } else if entity.contains::<IsAttacked>() {
            Some(UnitState::IsAttacked)
        } else if entity.contains::<Attack>() {
            Some(UnitState::Attack)
        } else if entity.contains::<Pause>() {
            Some(UnitState::Pause)
        } else if entity.contains::<Build>() {
            Some(UnitState::Build)
        } else if entity.contains::<Chase>() {
            Some(UnitState::Chase)
        } else if entity.contains::<Patrol>() {
            Some(UnitState::Patrol)
        } else if entity.contains::<Run>() {
            Some(UnitState::Run)
        } else if entity.contains::<Idle>() {
            Some(UnitState::Idle)
        } else {
            None
        }
    }

    /// Agents in these states follow their move target.
    pub fn is_moving_state(&self) -> bool {
        matches!(self, UnitState::Run | UnitState::Chase | UnitState::Patrol)
    }
}

// ============================================================================
// VISUAL LINK COMPONENTS
// ============================================================================

/// Generation-checked handle to a visual actor owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisualHandle {
    pub index: u32,
    pub generation: u32,
}

/// The simulation's view of an agent's visual actor.
///
/// `transform` mirrors what was last published (plus the host-reported
/// ground height); `visible` comes from the viewport/fog-of-war collaborator.
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct VisualProxy {
    pub handle: VisualHandle,
    pub transform: Transform,
    pub visible: bool,
    /// Seconds since the agent was last visible.
    pub hidden_for: f32,
}

impl VisualProxy {
    pub fn new(handle: VisualHandle, transform: Transform) -> Self {
        Self {
            handle,
            transform,
            visible: true,
            hidden_for: 0.0,
        }
    }
}

// ============================================================================
// GAMEPLAY EFFECT COMPONENTS
// ============================================================================

/// Identifier of an effect known to the host's gameplay-effect layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectId(pub u32);

/// Area-of-effect source.
///
/// Each target receives each effect at most once per cooldown window; the
/// applied sets are cleared when the window rolls over.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct EffectCaster {
    pub radius: f32,
    pub friendly_effect: Option<EffectId>,
    pub enemy_effect: Option<EffectId>,
    pub friendly_cooldown: f32,
    pub enemy_cooldown: f32,
    pub since_friendly: f32,
    pub since_enemy: f32,
    pub applied_friendly: HashSet<Entity>,
    pub applied_enemy: HashSet<Entity>,
}

impl EffectCaster {
    pub fn new(radius: f32) -> Self {
        Self {
            radius,
            friendly_effect: None,
            enemy_effect: None,
            friendly_cooldown: 1.0,
            enemy_cooldown: 1.0,
            since_friendly: 0.0,
            since_enemy: 0.0,
            applied_friendly: HashSet::new(),
            applied_enemy: HashSet::new(),
        }
    }

    pub fn with_friendly(mut self, effect: EffectId, cooldown: f32) -> Self {
        self.friendly_effect = Some(effect);
        self.friendly_cooldown = cooldown;
        self
    }

    pub fn with_enemy(mut self, effect: EffectId, cooldown: f32) -> Self {
        self.enemy_effect = Some(effect);
        self.enemy_cooldown = cooldown;
        self
    }
}

// ============================================================================
// PERFORMANCE / LOD COMPONENTS
// ============================================================================

/// Simulation level of detail.
/// High updates every tick, Medium every 2 ticks, Low every 4.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SimLod {
    #[default]
    High,
    Medium,
    Low,
}

impl SimLod {
    pub fn tick_interval(&self) -> u64 {
        match self {
            SimLod::High => 1,
            SimLod::Medium => 2,
            SimLod::Low => 4,
        }
    }

    #[inline]
    pub fn should_update(&self, tick: u64) -> bool {
        tick % self.tick_interval() == 0
    }
}

// ============================================================================
// BUNDLE HELPERS
// ============================================================================

/// Every fragment a freshly spawned agent carries.
///
/// Spawned agents start idle with zero velocity and a move target equal to
/// their spawn location.
#[derive(Bundle, Default)]
pub struct AgentBundle {
    pub transform: Transform,
    pub velocity: Velocity,
    pub force: Force,
    pub steering: Steering,
    pub params: MovementParams,
    pub move_target: MoveTarget,
    pub path: NavigationPath,
    pub target: AiTarget,
    pub stats: CombatStats,
    pub characteristics: AgentCharacteristics,
    pub yaw_follow: YawFollow,
    pub state: AgentState,
    pub lod: SimLod,
    pub idle: Idle,
}

impl AgentBundle {
    pub fn at(location: Vec3) -> Self {
        Self {
            transform: Transform::from_translation(location),
            move_target: MoveTarget::stand_at(location),
            ..Default::default()
        }
    }
}
