//! Area-of-effect gameplay modifiers.
//!
//! Casters apply their friendly effect to same-team agents and their enemy
//! effect to other teams inside their radius, at most once per target per
//! cooldown window. Applications are queued for the host's gameplay-effect
//! layer, which drains [`EffectQueue`] after each step.

use crate::components::*;
use crate::config::SimConfig;
use crate::systems::movement::DeltaTime;
use crate::systems::performance::IntervalGate;
use bevy_ecs::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EffectAlignment {
    Friendly,
    Enemy,
}

/// One effect to apply to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectApplication {
    pub caster: Entity,
    pub target: Entity,
    pub effect: EffectId,
    pub alignment: EffectAlignment,
}

#[derive(Resource, Debug, Default)]
pub struct EffectQueue {
    applications: Vec<EffectApplication>,
}

impl EffectQueue {
    pub fn push(&mut self, application: EffectApplication) {
        self.applications.push(application);
    }

    pub fn drain(&mut self) -> Vec<EffectApplication> {
        std::mem::take(&mut self.applications)
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

/// Roll a cooldown window forward, forgetting who was affected when it ends.
fn roll_window(since: &mut f32, cooldown: f32, elapsed: f32) -> bool {
    *since += elapsed;
    if *since >= cooldown {
        *since = 0.0;
        return true;
    }
    false
}

/// Queues effect applications for every live agent inside a caster's radius.
///
/// ## Data Access
/// - Reads: DeltaTime, SimConfig, Transform, CombatStats
/// - Writes: EffectCaster, EffectQueue
pub fn gameplay_effect_system(
    mut gate: Local<IntervalGate>,
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    queue: Option<ResMut<EffectQueue>>,
    mut casters: Query<(Entity, &Transform, &CombatStats, &mut EffectCaster), Without<Dead>>,
    targets: Query<(Entity, &Transform, &CombatStats), Without<Dead>>,
) {
    let Some(elapsed) = gate.tick(dt.0, config.states.effect_interval) else {
        return;
    };
    let Some(mut queue) = queue else {
        log::trace!("no effect queue, skipping gameplay effects");
        return;
    };

    let before = queue.len();
    for (caster_entity, caster_transform, caster_stats, mut caster) in casters.iter_mut() {
        let caster = &mut *caster;
        let radius_sq = caster.radius * caster.radius;
        for (target, transform, stats) in targets.iter() {
            if transform.translation.distance_squared(caster_transform.translation) > radius_sq {
                continue;
            }
            let (effect, applied, alignment) = if stats.team_id == caster_stats.team_id {
                (caster.friendly_effect, &mut caster.applied_friendly, EffectAlignment::Friendly)
            } else {
                (caster.enemy_effect, &mut caster.applied_enemy, EffectAlignment::Enemy)
            };
            let Some(effect) = effect else {
                continue;
            };
            if applied.insert(target) {
                queue.push(EffectApplication {
                    caster: caster_entity,
                    target,
                    effect,
                    alignment,
                });
            }
        }

        if roll_window(&mut caster.since_friendly, caster.friendly_cooldown, elapsed) {
            caster.applied_friendly.clear();
        }
        if roll_window(&mut caster.since_enemy, caster.enemy_cooldown, elapsed) {
            caster.applied_enemy.clear();
        }
    }

    let applied = queue.len() - before;
    if applied > 0 {
        log::debug!("queued {applied} gameplay effect applications");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    const HEAL: EffectId = EffectId(1);
    const SLOW: EffectId = EffectId(2);

    fn world() -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(DeltaTime(0.25));
        world.insert_resource(EffectQueue::default());
        world
    }

    fn unit(world: &mut World, at: Vec3, team: u8) -> Entity {
        world
            .spawn(AgentBundle {
                stats: CombatStats {
                    team_id: team,
                    ..Default::default()
                },
                ..AgentBundle::at(at)
            })
            .id()
    }

    fn schedule() -> Schedule {
        let mut schedule = Schedule::default();
        schedule.add_systems(gameplay_effect_system);
        schedule
    }

    #[test]
    fn test_effects_split_by_alignment_and_radius() {
        let mut world = world();
        let caster = unit(&mut world, Vec3::ZERO, 0);
        world
            .entity_mut(caster)
            .insert(EffectCaster::new(300.0).with_friendly(HEAL, 1.0).with_enemy(SLOW, 1.0));
        let ally = unit(&mut world, Vec3::new(100.0, 0.0, 0.0), 0);
        let enemy = unit(&mut world, Vec3::new(0.0, 200.0, 0.0), 1);
        let far = unit(&mut world, Vec3::new(1000.0, 0.0, 0.0), 1);

        schedule().run(&mut world);
        let applied = world.resource_mut::<EffectQueue>().drain();

        let find = |target: Entity| applied.iter().find(|a| a.target == target).copied();
        assert_eq!(find(ally).map(|a| (a.effect, a.alignment)), Some((HEAL, EffectAlignment::Friendly)));
        assert_eq!(find(enemy).map(|a| (a.effect, a.alignment)), Some((SLOW, EffectAlignment::Enemy)));
        assert_eq!(find(far), None);
        // The caster stands inside its own radius.
        assert!(find(caster).is_some());
        assert_eq!(applied.len(), 3);
    }

    #[test]
    fn test_effect_applies_once_per_cooldown() {
        let mut world = world();
        let caster = unit(&mut world, Vec3::ZERO, 0);
        world
            .entity_mut(caster)
            .insert(EffectCaster::new(300.0).with_enemy(SLOW, 1.0));
        unit(&mut world, Vec3::new(100.0, 0.0, 0.0), 1);

        let mut schedule = schedule();
        let mut counts = Vec::new();
        for _ in 0..8 {
            schedule.run(&mut world);
            counts.push(world.resource_mut::<EffectQueue>().drain().len());
        }
        assert_eq!(counts, vec![1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_dead_agents_neither_cast_nor_receive() {
        let mut world = world();
        let caster = unit(&mut world, Vec3::ZERO, 0);
        world.entity_mut(caster).insert(EffectCaster::new(300.0).with_enemy(SLOW, 1.0));
        let corpse = unit(&mut world, Vec3::new(50.0, 0.0, 0.0), 1);
        world.entity_mut(corpse).insert(Dead);

        schedule().run(&mut world);
        assert!(world.resource::<EffectQueue>().is_empty());
    }

    #[test]
    fn test_interval_gate_holds_effects() {
        let mut world = world();
        world.insert_resource(DeltaTime(0.1));
        let caster = unit(&mut world, Vec3::ZERO, 0);
        world.entity_mut(caster).insert(EffectCaster::new(300.0).with_friendly(HEAL, 1.0));

        let mut schedule = schedule();
        schedule.run(&mut world);
        schedule.run(&mut world);
        assert!(world.resource::<EffectQueue>().is_empty());
        schedule.run(&mut world);
        assert_eq!(world.resource::<EffectQueue>().len(), 1);
    }
}
