//! Basic demonstration of the mass-unit simulation.
//!
//! Two teams close on each other across a walled field while a render
//! thread drains visual updates.
//!
//! Run with: cargo run --example basic_demo

use glam::Vec3;
use rts_mass_sim::{
    logging, AgentSpec, EffectCaster, EffectId, NavCell, NavGrid, SimWorld, Transform, VisualRegistry,
};
use std::sync::mpsc;
use std::thread;

fn main() {
    logging::init(false);
    println!("=== RTS Mass Sim - Demo ===\n");

    let mut grid = NavGrid::centered(80, 80, 100.0);
    grid.fill_rect((-100.0, -1200.0), (100.0, 1200.0), NavCell::Blocked);
    grid.fill_rect((-600.0, 1400.0), (600.0, 1800.0), NavCell::Dirty);
    let mut sim = match SimWorld::new().with_navigation(grid) {
        Ok(sim) => sim,
        Err(err) => {
            eprintln!("failed to attach navigation: {err}");
            return;
        }
    };

    let mut registry = VisualRegistry::new();
    let mut blue = Vec::new();
    let mut red = Vec::new();
    for i in 0..25 {
        let offset = Vec3::new((i % 5) as f32 * 120.0, (i / 5) as f32 * 120.0, 0.0);
        let b = Vec3::new(-2000.0, -300.0, 0.0) + offset;
        let r = Vec3::new(1500.0, -300.0, 0.0) + offset;
        blue.push(sim.spawn_agent(AgentSpec::at(b).team(0).with_visual(registry.create(Transform::from_translation(b)))));
        red.push(sim.spawn_agent(AgentSpec::at(r).team(1).with_visual(registry.create(Transform::from_translation(r)))));
    }
    for (b, r) in blue.iter().zip(&red) {
        if let Err(err) = sim.set_ai_target(*b, Some(*r)) {
            eprintln!("{err}");
        }
    }
    if let Err(err) = sim.add_effect_caster(red[12], EffectCaster::new(400.0).with_friendly(EffectId(1), 2.0)) {
        eprintln!("{err}");
    }

    // The render thread owns the registry and applies batches as they come.
    let receiver = sim.visual_receiver();
    let (frame_tx, frame_rx) = mpsc::channel::<bool>();
    let render = thread::spawn(move || {
        let mut applied = 0;
        let mut stale = 0;
        while let Ok(running) = frame_rx.recv() {
            let stats = receiver.drain_into(&mut registry);
            applied += stats.applied;
            stale += stats.stale;
            if !running {
                break;
            }
        }
        (registry, applied, stale)
    });

    println!("Running 200 frames at 60 FPS...\n");
    for frame in 0..200 {
        sim.step(1.0 / 60.0);
        if frame_tx.send(true).is_err() {
            eprintln!("render thread stopped early");
            break;
        }

        if frame == 120 {
            if let Err(err) = sim.kill(red[0]) {
                eprintln!("{err}");
            }
        }
        let effects = sim.drain_effects();
        if !effects.is_empty() {
            println!("frame {frame}: {} gameplay effects applied", effects.len());
        }
        if (frame + 1) % 50 == 0 {
            print_summary(&mut sim);
        }
    }
    if frame_tx.send(false).is_err() {
        eprintln!("render thread stopped early");
    }

    match render.join() {
        Ok((registry, applied, stale)) => {
            println!("\nrender thread applied {applied} updates ({stale} stale), {} actors live", registry.len());
        }
        Err(_) => eprintln!("render thread panicked"),
    }

    println!("\n=== Final State (JSON) ===\n");
    println!("{}", sim.snapshot_json());
}

fn print_summary(sim: &mut SimWorld) {
    let snapshot = sim.snapshot();
    println!("--- Tick {} (t={:.2}s) ---", snapshot.tick, snapshot.time);
    for team in [0u8, 1] {
        let agents: Vec<_> = snapshot.agents.iter().filter(|a| a.team == team).collect();
        if agents.is_empty() {
            continue;
        }
        let cx = agents.iter().map(|a| a.x).sum::<f32>() / agents.len() as f32;
        let cy = agents.iter().map(|a| a.y).sum::<f32>() / agents.len() as f32;
        let engaged = agents
            .iter()
            .filter(|a| matches!(a.state.as_str(), "Attack" | "Pause"))
            .count();
        println!(
            "  team {team}: {} agents, centroid ({cx:.0}, {cy:.0}), {engaged} engaged",
            agents.len()
        );
    }
}
