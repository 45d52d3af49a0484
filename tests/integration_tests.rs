//! Integration tests for the coordination core
//!
//! These tests drive a running coordinator from real OS threads, the way a
//! blocking transport layer would, on a multi-threaded runtime with real time.

use server::game::{DeltaMergePolicy, WorldAdvancer};
use server::{
    CoordinatorConfig, Frozen, KeepCurrent, PolicyError, Proposal, StateCoordinator, TickContext,
};
use shared::{Unit, WorldState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const TICK: Duration = Duration::from_millis(20);

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::with_tick_interval(TICK)
}

/// Treats every proposal as an increment
fn sum_increments(current: &i64, proposals: Vec<Proposal<i64>>) -> Result<i64, PolicyError> {
    Ok(current + proposals.iter().map(|p| p.snapshot).sum::<i64>())
}

fn count_ticks(state: u64, _: &TickContext) -> Result<u64, PolicyError> {
    Ok(state + 1)
}

/// Waits on a blocking thread until `done` returns true or the deadline passes
fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

/// CONCURRENCY TESTS
mod concurrency_tests {
    use super::*;

    /// Every proposal submitted from any thread is counted exactly once
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_proposals_are_not_lost() {
        const CLIENTS: usize = 8;
        const ROUNDS: usize = 5;

        let coordinator =
            StateCoordinator::with_config(0i64, sum_increments, Frozen, fast_config()).unwrap();
        let channels: Vec<_> = (0..CLIENTS)
            .map(|_| coordinator.connect().unwrap())
            .collect();
        coordinator.start().unwrap();

        let workers = tokio::task::spawn_blocking(move || {
            let handles: Vec<_> = channels
                .into_iter()
                .map(|channel| {
                    thread::spawn(move || {
                        for _ in 0..ROUNDS {
                            let submitted_at = channel.published_tick();
                            channel.submit_proposed(1).unwrap();
                            // Drained by the next tick at the latest, or the
                            // one after if a tick was already under way.
                            assert!(wait_until(Duration::from_secs(5), || {
                                channel.published_tick() >= submitted_at + 2
                            }));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        });
        workers.await.unwrap();

        coordinator.shutdown().await.unwrap();
        assert_eq!(coordinator.snapshot(), (CLIENTS * ROUNDS) as i64);
    }

    /// Published ticks only move forward on every channel
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn published_ticks_are_monotonic() {
        let coordinator =
            StateCoordinator::with_config(0u64, KeepCurrent, count_ticks, fast_config()).unwrap();
        let channels: Vec<_> = (0..4).map(|_| coordinator.connect().unwrap()).collect();
        coordinator.start().unwrap();

        let readers = tokio::task::spawn_blocking(move || {
            let handles: Vec<_> = channels
                .into_iter()
                .map(|channel| {
                    thread::spawn(move || {
                        let mut last = 0u64;
                        let mut observed = 0;
                        let start = Instant::now();
                        while start.elapsed() < TICK * 15 {
                            if let Some(tick) = channel.take_published() {
                                assert!(tick > last, "tick {} after {}", tick, last);
                                last = tick;
                                observed += 1;
                            }
                            thread::sleep(Duration::from_millis(1));
                        }
                        observed
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<usize>>()
        });

        let observed = readers.await.unwrap();
        coordinator.shutdown().await.unwrap();

        assert!(observed.iter().all(|count| *count > 0));
    }

    /// Connecting from many threads while ticks run keeps the count exact
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_races_with_running_loop() {
        let coordinator = StateCoordinator::with_config(
            WorldState::new(),
            DeltaMergePolicy,
            WorldAdvancer::new(),
            fast_config(),
        )
        .unwrap();
        coordinator.start().unwrap();

        let coordinator = Arc::new(coordinator);
        let connectors = {
            let coordinator = Arc::clone(&coordinator);
            tokio::task::spawn_blocking(move || {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let coordinator = Arc::clone(&coordinator);
                        thread::spawn(move || {
                            (0..25)
                                .map(|_| {
                                    let channel = coordinator.connect().unwrap();
                                    thread::sleep(Duration::from_micros(200));
                                    channel
                                })
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .flat_map(|handle| handle.join().unwrap())
                    .collect::<Vec<_>>()
            })
        };

        let channels = connectors.await.unwrap();
        assert_eq!(channels.len(), 100);
        assert_eq!(coordinator.client_count(), 100);

        let mut ids: Vec<u64> = channels.iter().map(|c| c.id().get()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 100);

        sleep(TICK * 3).await;
        assert!(channels.iter().all(|c| c.published_tick() > 0));
        coordinator.shutdown().await.unwrap();
    }
}

/// SNAPSHOT HAND-OFF TESTS
mod snapshot_tests {
    use super::*;

    /// The two-client scenario: one client heals by 5, the other stays quiet
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_client_scenario() {
        let coordinator = StateCoordinator::with_config(
            WorldState::new(),
            DeltaMergePolicy,
            WorldAdvancer::new(),
            fast_config(),
        )
        .unwrap();
        let a = coordinator.connect().unwrap();
        let b = coordinator.connect().unwrap();

        let mut proposal = WorldState::new();
        proposal.hp = 5;
        a.submit_proposed(proposal).unwrap();

        coordinator.start().unwrap();
        a.updated().await.unwrap();
        coordinator.shutdown().await.unwrap();

        let expected = WorldState {
            tick: 1,
            hp: 5,
            ..WorldState::new()
        };
        assert_eq!(coordinator.current_tick(), 1);
        assert_eq!(a.take_published(), Some(expected.clone()));
        assert_eq!(b.take_published(), Some(expected));
    }

    /// A client mutating its copy never affects anyone else
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn published_copies_are_isolated_across_threads() {
        let initial = WorldState::with_units([Unit::new(1, 1, 10.0, 10.0)]);
        let coordinator =
            StateCoordinator::with_config(initial.clone(), KeepCurrent, Frozen, fast_config())
                .unwrap();
        let vandal = coordinator.connect().unwrap();
        let observer = coordinator.connect().unwrap();
        coordinator.start().unwrap();

        vandal.updated().await.unwrap();
        let vandal_thread = thread::spawn(move || {
            let mut copy = vandal.take_published().unwrap();
            copy.units.clear();
            copy.hp = -1000;
            copy
        });
        let vandalised = vandal_thread.join().unwrap();
        assert!(vandalised.units.is_empty());

        observer.updated().await.unwrap();
        assert_eq!(observer.take_published(), Some(initial.clone()));
        assert_eq!(coordinator.snapshot(), initial);

        coordinator.shutdown().await.unwrap();
    }

    /// Published snapshots survive the wire encoding a transport would use
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn published_snapshot_encodes_for_transport() {
        let mut moving = Unit::new(1, 1, 100.0, 100.0);
        moving.set_velocity(50.0, 0.0);
        let coordinator = StateCoordinator::with_config(
            WorldState::with_units([moving]),
            DeltaMergePolicy,
            WorldAdvancer::new(),
            fast_config(),
        )
        .unwrap();
        let channel = coordinator.connect().unwrap();
        coordinator.start().unwrap();

        channel.updated().await.unwrap();
        let published = channel.take_published().unwrap();
        coordinator.shutdown().await.unwrap();

        let bytes = published.to_bytes().unwrap();
        assert_eq!(WorldState::from_bytes(&bytes).unwrap(), published);
        assert!(published.units[&1].x > 100.0);
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// No publishes happen after shutdown returns
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clean_shutdown_stops_publishing() {
        let coordinator =
            StateCoordinator::with_config(0u64, KeepCurrent, count_ticks, fast_config()).unwrap();
        let channel = coordinator.connect().unwrap();
        coordinator.start().unwrap();

        sleep(TICK * 3).await;
        let started = Instant::now();
        coordinator.shutdown().await.unwrap();
        assert!(started.elapsed() < TICK * 5);

        let final_tick = channel.published_tick();
        sleep(TICK * 5).await;

        assert_eq!(channel.published_tick(), final_tick);
        assert!(channel.is_closed());
        assert!(channel.submit_proposed(1).is_err());
        assert!(channel.updated().await.is_err());
    }

    /// A client stuck waiting on updates is released by shutdown
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_releases_waiting_clients() {
        let coordinator = StateCoordinator::with_config(
            0i64,
            KeepCurrent,
            Frozen,
            CoordinatorConfig::with_tick_interval(Duration::from_secs(30)),
        )
        .unwrap();
        let channel = coordinator.connect().unwrap();
        coordinator.start().unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                let result = channel.updated().await;
                released.store(true, Ordering::SeqCst);
                result
            })
        };

        sleep(Duration::from_millis(20)).await;
        assert!(!released.load(Ordering::SeqCst));

        coordinator.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();

        assert!(result.is_err());
        assert!(released.load(Ordering::SeqCst));
    }
}
