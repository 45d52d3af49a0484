use clap::Parser;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::game::{DeltaMergePolicy, WorldAdvancer};
use server::{ClientChannel, CoordinatorConfig, StateCoordinator};
use shared::{Unit, WorldState, UNIT_MAX_SPEED, UNIT_SIZE, WORLD_HEIGHT, WORLD_WIDTH};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Runs the coordinator against a set of simulated clients
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Milliseconds between reconciliation ticks
    #[arg(short, long, default_value = "100")]
    tick_ms: u64,
    /// Upper bound in milliseconds for the simulation step of one tick
    #[arg(long, default_value = "500")]
    max_delta_ms: u64,
    /// Number of simulated clients
    #[arg(short, long, default_value = "4")]
    clients: u32,
    /// How long to run before shutting down
    #[arg(short, long, default_value = "5")]
    duration_secs: u64,
    /// Seed for the simulated clients (random if omitted)
    #[arg(short, long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = CoordinatorConfig {
        tick_interval: Duration::from_millis(args.tick_ms),
        max_delta: Duration::from_millis(args.max_delta_ms),
    };
    let seed = args.seed.unwrap_or_else(rand::random);

    info!(
        "Starting coordinator: {} clients, {:?} ticks, seed {}",
        args.clients, config.tick_interval, seed
    );

    let coordinator = StateCoordinator::with_config(
        initial_world(args.clients),
        DeltaMergePolicy,
        WorldAdvancer::new(),
        config,
    )?
    .on_tick_error(|err| warn!("Proposals for tick {} dropped", err.tick()));

    // Simulated clients run on plain threads, like a blocking transport would
    let running = Arc::new(AtomicBool::new(true));
    let mut clients = Vec::new();
    for index in 0..args.clients {
        let channel = coordinator.connect()?;
        let running = Arc::clone(&running);
        let rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(index)));
        let pace = config.tick_interval / 2;
        clients.push(thread::spawn(move || {
            run_simulated_client(channel, rng, running, pace)
        }));
    }

    coordinator.start()?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    running.store(false, Ordering::Release);
    let final_state = coordinator.snapshot();
    let stats = coordinator.shutdown().await?;

    for (index, client) in clients.into_iter().enumerate() {
        match client.join() {
            Ok(received) => debug!("Client {} received {} snapshots", index + 1, received),
            Err(_) => warn!("Client {} thread panicked", index + 1),
        }
    }

    let encoded = final_state.to_bytes()?;
    info!(
        "Final state: tick {}, hp {}, {} living units, {} bytes on the wire",
        final_state.tick,
        final_state.hp,
        final_state.living_units(),
        encoded.len()
    );
    info!(
        "{} ticks completed, {} aborted, {} clients at shutdown",
        stats.ticks_completed, stats.ticks_aborted, stats.clients
    );

    Ok(())
}

/// One unit per client, owned by the channel id the client will receive
fn initial_world(clients: u32) -> WorldState {
    WorldState::with_units((1..=clients).map(|id| {
        let x = 50.0 + (id as f32 * 90.0) % (WORLD_WIDTH - 100.0);
        let y = WORLD_HEIGHT / 2.0 - UNIT_SIZE / 2.0;
        Unit::new(id, u64::from(id), x, y)
    }))
}

/// Client loop: read the latest published state and propose a tweaked copy.
///
/// Returns the number of snapshots received.
fn run_simulated_client(
    channel: ClientChannel<WorldState>,
    mut rng: StdRng,
    running: Arc<AtomicBool>,
    pace: Duration,
) -> u64 {
    let owner = channel.id().get();
    let mut latest: Option<WorldState> = None;
    let mut received = 0;

    while running.load(Ordering::Acquire) && !channel.is_closed() {
        if let Some(state) = channel.take_published() {
            received += 1;
            latest = Some(state);
        }

        if let Some(state) = &latest {
            let mut proposal = state.clone();
            propose_changes(&mut proposal, owner, &mut rng);
            if channel.submit_proposed(proposal).is_err() {
                break;
            }
        }

        thread::sleep(pace);
    }

    debug!("Simulated client {} stopping", channel.id());
    received
}

fn propose_changes(state: &mut WorldState, owner: u64, rng: &mut StdRng) {
    for unit in state.units.values_mut().filter(|unit| unit.owner == owner) {
        unit.set_velocity(
            rng.gen_range(-UNIT_MAX_SPEED..=UNIT_MAX_SPEED),
            rng.gen_range(-UNIT_MAX_SPEED..=UNIT_MAX_SPEED),
        );
    }

    if rng.gen_bool(0.2) {
        state.hp += rng.gen_range(-3..=5);
    }

    // Occasionally attack whichever unit comes up
    if rng.gen_bool(0.05) && !state.units.is_empty() {
        let target = rng.gen_range(0..state.units.len());
        if let Some(unit) = state.units.values_mut().nth(target) {
            unit.hp -= 25;
        }
    }
}
