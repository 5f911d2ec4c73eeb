//! Actor-sync stage: publishes authoritative transforms to the visual layer.
//!
//! Collection runs inside the schedule, possibly on a worker thread. The
//! visual layer is only touched by whichever thread drains the
//! [`VisualUpdateReceiver`], once per frame. Each update carries a
//! generation-checked [`VisualHandle`]; a handle whose actor was destroyed
//! after collection is skipped silently.
//!
//! ## Throttling
//!
//! The stage interval follows the frame delta: at or above the high FPS
//! mark it syncs every `min_interval`, at or below the low FPS mark every
//! `max_interval`, linearly in between. Hidden agents keep syncing for
//! `visibility_grace` seconds after they disappear. A stage-wide grace timer
//! also forces a full sync, hidden agents included, every `visibility_grace`
//! seconds regardless of the dynamic interval.

use crate::components::*;
use crate::config::{SimConfig, SyncConfig};
use crate::systems::movement::{horizontal, DeltaTime};
use crate::systems::performance::SimTick;
use bevy_ecs::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use glam::Quat;

/// One transform to apply to one visual actor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualUpdate {
    pub entity: Entity,
    pub handle: VisualHandle,
    pub transform: Transform,
}

/// Updates collected in one sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    pub tick: u64,
    pub updates: Vec<VisualUpdate>,
}

/// The visual layer as seen from the draining thread.
pub trait VisualSink {
    /// Apply `transform` to the actor behind `handle`. Returns false when the
    /// handle is stale and nothing was applied.
    fn apply(&mut self, handle: VisualHandle, transform: &Transform) -> bool;
}

/// Sending half of the sync channel, held by the world.
#[derive(Resource, Clone)]
pub struct ActorSyncQueue {
    sender: Sender<SyncBatch>,
}

/// Receiving half, owned by the thread allowed to touch visuals.
#[derive(Clone)]
pub struct VisualUpdateReceiver {
    receiver: Receiver<SyncBatch>,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: usize,
    pub applied: usize,
    pub stale: usize,
}

pub fn actor_sync_channel() -> (ActorSyncQueue, VisualUpdateReceiver) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (ActorSyncQueue { sender }, VisualUpdateReceiver { receiver })
}

impl VisualUpdateReceiver {
    /// Apply every pending batch in order.
    pub fn drain_into(&self, sink: &mut dyn VisualSink) -> DrainStats {
        let mut stats = DrainStats::default();
        for batch in self.receiver.try_iter() {
            stats.batches += 1;
            for update in &batch.updates {
                if sink.apply(update.handle, &update.transform) {
                    stats.applied += 1;
                } else {
                    stats.stale += 1;
                    log::trace!("visual for {:?} gone before tick {} applied", update.entity, batch.tick);
                }
            }
        }
        stats
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

// ============================================================================
// VISUAL REGISTRY
// ============================================================================

#[derive(Debug, Clone)]
struct VisualSlot {
    generation: u32,
    transform: Option<Transform>,
}

/// Generation-checked slot map of visual actors.
///
/// Destroying an actor bumps its slot generation, so handles issued before
/// the destroy never resolve to a later occupant.
#[derive(Debug, Clone, Default)]
pub struct VisualRegistry {
    slots: Vec<VisualSlot>,
    free: Vec<u32>,
}

impl VisualRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, transform: Transform) -> VisualHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.transform = Some(transform);
            return VisualHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(VisualSlot {
            generation: 0,
            transform: Some(transform),
        });
        VisualHandle { index, generation: 0 }
    }

    pub fn destroy(&mut self, handle: VisualHandle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.index as usize];
        slot.transform = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    pub fn is_valid(&self, handle: VisualHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .map(|s| s.generation == handle.generation && s.transform.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, handle: VisualHandle) -> Option<&Transform> {
        if !self.is_valid(handle) {
            return None;
        }
        self.slots[handle.index as usize].transform.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VisualSink for VisualRegistry {
    fn apply(&mut self, handle: VisualHandle, transform: &Transform) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        self.slots[handle.index as usize].transform = Some(*transform);
        true
    }
}

// ============================================================================
// SYNC STAGE
// ============================================================================

/// Stage-local timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTimers {
    /// Time since the last sync pass.
    pub since_sync: f32,
    /// Time since hidden agents were last force-synced.
    pub grace: f32,
}

/// Map the frame delta onto `[min_interval, max_interval]`.
pub fn dynamic_interval(dt: f32, cfg: &SyncConfig) -> f32 {
    let high = cfg.high_fps.max(cfg.low_fps + 1.0);
    let fast = 1.0 / high;
    let slow = 1.0 / cfg.low_fps.max(1.0);
    let t = ((dt - fast) / (slow - fast)).clamp(0.0, 1.0);
    cfg.min_interval + t * (cfg.max_interval - cfg.min_interval)
}

/// Turn `from` toward `to` by at most `max_angle` radians.
fn turn_toward(from: Quat, to: Quat, max_angle: f32) -> Quat {
    let angle = from.angle_between(to);
    if angle <= max_angle || angle <= f32::EPSILON {
        to
    } else {
        from.slerp(to, max_angle / angle).normalize()
    }
}

/// Final visual transform for one agent.
///
/// Horizontal position comes from the simulation, height from the visual.
/// Agents that rotate to movement turn toward their travel direction at
/// their rotation speed once they moved far enough; others take the
/// simulation rotation.
pub fn final_transform(
    sim: &Transform,
    visual: &Transform,
    traits: &AgentCharacteristics,
    elapsed: f32,
    cfg: &SyncConfig,
) -> Transform {
    let mut out = *sim;
    out.translation.z = visual.translation.z;

    if traits.rotates_to_movement {
        let moved = horizontal(sim.translation - visual.translation);
        let threshold = cfg.min_movement_for_rotation;
        out.rotation = if moved.length_squared() > threshold * threshold {
            let heading = Quat::from_rotation_z(moved.y.atan2(moved.x));
            turn_toward(visual.rotation, heading, traits.rotation_speed.to_radians() * elapsed)
        } else {
            visual.rotation
        };
    }
    out
}

/// Collects visual transforms that drifted from the simulation and sends
/// them to the visual layer as one batch.
///
/// Runs on the dynamic interval. Every `visibility_grace` seconds a full
/// sync goes out regardless of the interval or visibility.
///
/// ## Data Access
/// - Reads: DeltaTime, SimTick, SimConfig, ActorSyncQueue, Transform, AgentCharacteristics
/// - Writes: VisualProxy, ActorSyncQueue (channel send)
pub fn actor_sync_system(
    mut timers: Local<SyncTimers>,
    dt: Res<DeltaTime>,
    tick: Res<SimTick>,
    config: Res<SimConfig>,
    queue: Option<Res<ActorSyncQueue>>,
    mut query: Query<(Entity, &Transform, &AgentCharacteristics, &mut VisualProxy)>,
) {
    let Some(queue) = queue else {
        log::trace!("no visual layer attached, skipping actor sync");
        return;
    };
    let cfg = &config.sync;
    let delta = dt.0;

    for (.., mut proxy) in query.iter_mut() {
        if proxy.visible {
            if proxy.hidden_for != 0.0 {
                proxy.hidden_for = 0.0;
            }
        } else {
            proxy.hidden_for += delta;
        }
    }

    timers.since_sync += delta;
    timers.grace += delta;
    let grace_due = timers.grace > cfg.visibility_grace;
    if timers.since_sync < dynamic_interval(delta, cfg) && !grace_due {
        return;
    }
    let elapsed = timers.since_sync;
    timers.since_sync = 0.0;
    if grace_due {
        timers.grace = 0.0;
    }

    let mut batch = SyncBatch {
        tick: tick.0,
        updates: Vec::new(),
    };
    for (entity, transform, traits, mut proxy) in query.iter_mut() {
        let in_grace = proxy.hidden_for <= cfg.visibility_grace;
        if !proxy.visible && !in_grace && !grace_due {
            continue;
        }
        let next = final_transform(transform, &proxy.transform, traits, elapsed, cfg);
        if next.approx_eq(&proxy.transform, cfg.position_tolerance, cfg.rotation_tolerance) {
            continue;
        }
        proxy.transform = next;
        batch.updates.push(VisualUpdate {
            entity,
            handle: proxy.handle,
            transform: next,
        });
    }

    if batch.updates.is_empty() {
        return;
    }
    if queue.sender.send(batch).is_err() {
        log::debug!("visual receiver dropped, discarding sync batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    struct Harness {
        world: World,
        schedule: Schedule,
        receiver: VisualUpdateReceiver,
        registry: VisualRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let mut world = World::new();
            // Sync every tick so timing is driven by the grace rules alone.
            let mut config = SimConfig::default();
            config.sync.min_interval = 0.0;
            config.sync.max_interval = 0.0;
            world.insert_resource(config);
            world.insert_resource(DeltaTime(1.0 / 30.0));
            world.insert_resource(SimTick(0));
            let (queue, receiver) = actor_sync_channel();
            world.insert_resource(queue);
            let mut schedule = Schedule::default();
            schedule.add_systems(actor_sync_system);
            Self {
                world,
                schedule,
                receiver,
                registry: VisualRegistry::new(),
            }
        }

        fn spawn(&mut self, at: Vec3) -> (Entity, VisualHandle) {
            let transform = Transform::from_translation(at);
            let handle = self.registry.create(transform);
            let entity = self
                .world
                .spawn((AgentBundle::at(at), VisualProxy::new(handle, transform)))
                .id();
            (entity, handle)
        }

        fn tick(&mut self, dt: f32) {
            self.world.resource_mut::<DeltaTime>().0 = dt;
            self.schedule.run(&mut self.world);
        }
    }

    #[test]
    fn test_dynamic_interval_tracks_frame_rate() {
        let cfg = SyncConfig::default();
        assert!((dynamic_interval(1.0 / 120.0, &cfg) - cfg.min_interval).abs() < 1e-6);
        assert!((dynamic_interval(1.0 / 10.0, &cfg) - cfg.max_interval).abs() < 1e-6);
        let mid = dynamic_interval(1.0 / 40.0, &cfg);
        assert!(mid > cfg.min_interval && mid < cfg.max_interval);
    }

    #[test]
    fn test_moved_agent_is_synced_and_keeps_visual_height() {
        let mut h = Harness::new();
        let (entity, handle) = h.spawn(Vec3::ZERO);
        h.world.get_mut::<VisualProxy>(entity).unwrap().transform.translation.z = 42.0;
        h.world.get_mut::<Transform>(entity).unwrap().translation = Vec3::new(100.0, 0.0, 0.0);

        h.tick(1.0 / 120.0);
        let stats = h.receiver.drain_into(&mut h.registry);

        assert_eq!(stats.applied, 1);
        let visual = h.registry.get(handle).unwrap();
        assert_eq!(visual.translation, Vec3::new(100.0, 0.0, 42.0));
    }

    #[test]
    fn test_rotation_turns_at_rotation_speed() {
        let mut h = Harness::new();
        let (entity, handle) = h.spawn(Vec3::ZERO);
        // Moving along +Y: a 90 degree turn at 360 deg/s.
        h.world.get_mut::<Transform>(entity).unwrap().translation = Vec3::new(0.0, 100.0, 0.0);

        h.tick(0.125);
        h.receiver.drain_into(&mut h.registry);

        let yaw = h.registry.get(handle).unwrap().yaw();
        let expected = (360.0f32 * 0.125).to_radians();
        assert!((yaw - expected).abs() < 1e-3, "yaw {yaw} expected {expected}");
    }

    #[test]
    fn test_unchanged_agents_produce_no_batch() {
        let mut h = Harness::new();
        h.spawn(Vec3::ZERO);
        h.tick(1.0 / 120.0);
        assert_eq!(h.receiver.pending(), 0);
    }

    #[test]
    fn test_hidden_agent_syncs_within_grace_then_waits_for_refresh() {
        let mut h = Harness::new();
        let (entity, _) = h.spawn(Vec3::ZERO);
        h.world.get_mut::<VisualProxy>(entity).unwrap().visible = false;

        // Still inside its grace window.
        h.world.get_mut::<Transform>(entity).unwrap().translation.x = 10.0;
        h.tick(0.1);
        assert_eq!(h.receiver.drain_into(&mut h.registry).applied, 1);

        // Window expires; the forced refresh fires but nothing changed.
        h.tick(0.45);
        assert_eq!(h.receiver.drain_into(&mut h.registry).applied, 0);

        h.world.get_mut::<Transform>(entity).unwrap().translation.x = 20.0;
        h.tick(0.05);
        assert_eq!(h.receiver.drain_into(&mut h.registry).applied, 0);

        h.tick(0.46);
        assert_eq!(h.receiver.drain_into(&mut h.registry).applied, 1);
    }

    #[test]
    fn test_stale_handle_is_skipped_after_despawn() {
        let mut h = Harness::new();
        let (entity, handle) = h.spawn(Vec3::ZERO);
        let (_, other) = h.spawn(Vec3::new(500.0, 0.0, 0.0));
        h.world.get_mut::<Transform>(entity).unwrap().translation.x = 50.0;
        h.tick(1.0 / 120.0);

        // Agent and its actor vanish before the game thread drains.
        h.world.despawn(entity);
        assert!(h.registry.destroy(handle));
        let reused = h.registry.create(Transform::default());
        assert_eq!(reused.index, handle.index);

        let stats = h.receiver.drain_into(&mut h.registry);
        assert_eq!(stats.applied, 0);
        assert_eq!(stats.stale, 1);
        assert_eq!(h.registry.get(reused), Some(&Transform::default()));
        assert!(h.registry.get(other).is_some());
    }

    #[test]
    fn test_drain_from_another_thread() {
        let mut h = Harness::new();
        let (entity, handle) = h.spawn(Vec3::ZERO);
        h.world.get_mut::<Transform>(entity).unwrap().translation.x = 75.0;
        h.tick(1.0 / 120.0);

        let receiver = h.receiver.clone();
        let mut registry = h.registry.clone();
        let registry = std::thread::spawn(move || {
            receiver.drain_into(&mut registry);
            registry
        })
        .join()
        .unwrap();
        assert_eq!(registry.get(handle).unwrap().translation.x, 75.0);
    }
}
