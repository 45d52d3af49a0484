//! Performance benchmarks for the reconciliation hot paths

use server::game::{DeltaMergePolicy, WorldAdvancer};
use server::{
    AutonomousAdvancer, ChannelId, CoordinatorConfig, Proposal, ReconciliationPolicy,
    StateCoordinator, TickContext,
};
use shared::{Unit, WorldState, UNIT_MAX_SPEED};
use std::time::{Duration, Instant};

fn crowded_world(units: u32) -> WorldState {
    WorldState::with_units((0..units).map(|id| {
        let mut unit = Unit::new(id, u64::from(id % 64), (id % 700) as f32, (id % 500) as f32);
        unit.set_velocity(UNIT_MAX_SPEED / 2.0, -UNIT_MAX_SPEED / 3.0);
        unit
    }))
}

/// Benchmarks merging a large batch of proposals
#[test]
fn benchmark_delta_merge() {
    let current = crowded_world(10);
    let proposals: Vec<Proposal<WorldState>> = (0..1000u64)
        .map(|channel| {
            let mut snapshot = current.clone();
            snapshot.hp += 1;
            if let Some(unit) = snapshot.units.get_mut(&((channel % 10) as u32)) {
                unit.set_velocity(channel as f32 % UNIT_MAX_SPEED, 0.0);
            }
            Proposal::new(ChannelId::new(channel + 1), snapshot)
        })
        .collect();

    let start = Instant::now();
    let merged = DeltaMergePolicy.apply(&current, proposals).unwrap();
    let duration = start.elapsed();

    println!("Delta merge: 1000 proposals in {:?}", duration);

    assert_eq!(merged.hp, 1000);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks the autonomous step over a crowded world
#[test]
fn benchmark_world_advance() {
    let mut state = crowded_world(10_000);
    let mut advancer = WorldAdvancer::new();
    advancer.init(&state);

    let iterations = 100;
    let start = Instant::now();

    for tick in 1..=iterations {
        let ctx = TickContext {
            tick,
            delta: Duration::from_millis(100),
            proposals: 0,
        };
        state = advancer.step(state, &ctx).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "World advance: {} steps of 10k units in {:?} ({:.2} ms/step)",
        iterations,
        duration,
        duration.as_secs_f64() * 1000.0 / iterations as f64
    );

    assert_eq!(state.tick, iterations);
    assert_eq!(state.units.len(), 10_000);
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks publishing to many channels at a short tick interval
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn benchmark_publish_fan_out() {
    let coordinator = StateCoordinator::with_config(
        crowded_world(50),
        DeltaMergePolicy,
        WorldAdvancer::new(),
        CoordinatorConfig::with_tick_interval(Duration::from_millis(10)),
    )
    .unwrap();
    let channels: Vec<_> = (0..500).map(|_| coordinator.connect().unwrap()).collect();

    let start = Instant::now();
    coordinator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = coordinator.shutdown().await.unwrap();
    let duration = start.elapsed();

    println!(
        "Publish fan-out: {} ticks to {} channels in {:?}",
        stats.ticks_completed,
        channels.len(),
        duration
    );

    assert_eq!(stats.ticks_aborted, 0);
    assert!(stats.ticks_completed >= 3);
    assert!(channels.iter().all(|c| c.published_tick() == stats.ticks_completed));
}
