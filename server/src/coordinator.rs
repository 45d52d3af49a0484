//! Authoritative state owner and its periodic reconciliation loop
//!
//! The coordinator keeps the canonical world state and the channel registry
//! behind a single lock. A background task wakes once per tick interval and,
//! without releasing that lock:
//! 1. prunes channels whose client handle was dropped
//! 2. drains at most one proposal per channel
//! 3. runs the [`ReconciliationPolicy`] on the batch
//! 4. runs the [`AutonomousAdvancer`] on the merged state
//! 5. posts an independent copy of the result to every channel
//!
//! Proposals submitted before step 2 land in this tick; anything submitted
//! later waits in its slot for the next one. If the policy or advancer
//! fails, the tick is dropped as a whole and the previous state stays
//! authoritative.

use crate::channel::{ChannelRegistry, ClientChannel};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, PolicyError, TickError, TickStage};
use crate::policy::{AutonomousAdvancer, ReconciliationPolicy, Snapshot, TickContext};
use log::{debug, error, info, trace, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Observability hook invoked with every aborted tick
pub type TickErrorHook = Box<dyn Fn(&TickError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorStats {
    pub ticks_completed: u64,
    pub ticks_aborted: u64,
    pub clients: usize,
}

/// Everything guarded by the coordinator lock
struct World<S> {
    authoritative: S,
    registry: ChannelRegistry<S>,
    tick: u64,
}

struct Shared<S> {
    world: Mutex<World<S>>,
    clients: AtomicUsize,
    ticks_completed: AtomicU64,
    ticks_aborted: AtomicU64,
    shutdown_requested: AtomicBool,
}

impl<S> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, World<S>> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            ticks_completed: self.ticks_completed.load(Ordering::Acquire),
            ticks_aborted: self.ticks_aborted.load(Ordering::Acquire),
            clients: self.clients.load(Ordering::Acquire),
        }
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

/// Game logic waiting to be moved onto the loop task
struct LoopParts<S> {
    policy: Box<dyn ReconciliationPolicy<S>>,
    advancer: Box<dyn AutonomousAdvancer<S>>,
    on_tick_error: Option<TickErrorHook>,
}

enum Lifecycle<S> {
    Idle(LoopParts<S>),
    Running(JoinHandle<()>),
    Stopped,
}

/// Owns the authoritative state and drives the reconciliation loop.
///
/// All methods take `&self`, so the coordinator can be shared (for example
/// in an `Arc`) with whatever accepts client connections.
///
/// ```rust,no_run
/// use server::{LatestProposalWins, StateCoordinator, Frozen};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let coordinator = StateCoordinator::new(0u64, LatestProposalWins, Frozen);
///     let channel = coordinator.connect()?;
///     coordinator.start()?;
///
///     channel.submit_proposed(7)?;
///     channel.updated().await?;
///     println!("{:?}", channel.take_published());
///
///     coordinator.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct StateCoordinator<S: Snapshot> {
    shared: Arc<Shared<S>>,
    config: CoordinatorConfig,
    lifecycle: Mutex<Lifecycle<S>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<S: Snapshot> StateCoordinator<S> {
    /// Creates a coordinator ticking at the default interval.
    ///
    /// `initial` becomes the authoritative state as-is.
    pub fn new<P, A>(initial: S, policy: P, advancer: A) -> Self
    where
        P: ReconciliationPolicy<S> + 'static,
        A: AutonomousAdvancer<S> + 'static,
    {
        Self::build(
            initial,
            Box::new(policy),
            Box::new(advancer),
            CoordinatorConfig::default(),
        )
    }

    pub fn with_config<P, A>(
        initial: S,
        policy: P,
        advancer: A,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError>
    where
        P: ReconciliationPolicy<S> + 'static,
        A: AutonomousAdvancer<S> + 'static,
    {
        config.validate()?;
        Ok(Self::build(initial, Box::new(policy), Box::new(advancer), config))
    }

    fn build(
        initial: S,
        policy: Box<dyn ReconciliationPolicy<S>>,
        advancer: Box<dyn AutonomousAdvancer<S>>,
        config: CoordinatorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                world: Mutex::new(World {
                    authoritative: initial,
                    registry: ChannelRegistry::new(),
                    tick: 0,
                }),
                clients: AtomicUsize::new(0),
                ticks_completed: AtomicU64::new(0),
                ticks_aborted: AtomicU64::new(0),
                shutdown_requested: AtomicBool::new(false),
            }),
            config,
            lifecycle: Mutex::new(Lifecycle::Idle(LoopParts {
                policy,
                advancer,
                on_tick_error: None,
            })),
            shutdown_tx,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle<S>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a hook called outside the lock whenever a tick is aborted.
    ///
    /// Only takes effect if installed before [`start`](Self::start).
    pub fn on_tick_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TickError) + Send + Sync + 'static,
    {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Idle(parts) = lifecycle {
            parts.on_tick_error = Some(Box::new(hook));
        }
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Registers a new client. Safe to call while the loop is running.
    pub fn connect(&self) -> Result<ClientChannel<S>, CoordinatorError> {
        let mut world = self.shared.lock();
        if self.shared.is_shutdown_requested() {
            return Err(CoordinatorError::ShutDown);
        }

        let channel = world.registry.register();
        self.shared
            .clients
            .store(world.registry.len(), Ordering::Release);
        Ok(channel)
    }

    /// Removes a client immediately. Its pending proposal is discarded.
    pub fn disconnect(&self, channel: ClientChannel<S>) -> bool {
        let mut world = self.shared.lock();
        let removed = world.registry.remove(channel.id());
        self.shared
            .clients
            .store(world.registry.len(), Ordering::Release);
        removed
    }

    /// Spawns the reconciliation loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let mut lifecycle = self.lifecycle();
        let runtime = match &*lifecycle {
            Lifecycle::Running(_) => return Err(CoordinatorError::AlreadyStarted),
            Lifecycle::Stopped => return Err(CoordinatorError::ShutDown),
            Lifecycle::Idle(_) => Handle::try_current().map_err(|_| CoordinatorError::NoRuntime)?,
        };
        if self.shared.is_shutdown_requested() {
            return Err(CoordinatorError::ShutDown);
        }

        if let Lifecycle::Idle(parts) = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            let tick_loop = TickLoop {
                shared: Arc::clone(&self.shared),
                policy: parts.policy,
                advancer: parts.advancer,
                config: self.config,
                on_tick_error: parts.on_tick_error,
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            *lifecycle = Lifecycle::Running(runtime.spawn(tick_loop.run()));
        }

        Ok(())
    }

    /// Asks the loop to stop and wakes it if it is waiting. Does not wait
    /// for the loop to exit; see [`shutdown`](Self::shutdown).
    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
    }

    /// Stops the loop, waits for it to exit and closes every channel.
    ///
    /// The loop can only stop between ticks, so no partially processed tick
    /// is ever published.
    pub async fn shutdown(&self) -> Result<CoordinatorStats, CoordinatorError> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        if let Lifecycle::Stopped = previous {
            return Err(CoordinatorError::ShutDown);
        }

        self.request_shutdown();

        let joined = match previous {
            Lifecycle::Running(handle) => handle.await,
            _ => Ok(()),
        };

        let stats = self.shared.stats();
        {
            let mut world = self.shared.lock();
            world.registry.close_all();
            self.shared.clients.store(0, Ordering::Release);
        }

        joined.map_err(|e| CoordinatorError::LoopFailed(e.to_string()))?;

        info!(
            "Coordinator shut down after {} ticks ({} aborted)",
            stats.ticks_completed, stats.ticks_aborted
        );
        Ok(stats)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Number of registered channels, read without taking the lock
    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::Acquire)
    }

    /// Independent copy of the authoritative state
    pub fn snapshot(&self) -> S {
        self.shared.lock().authoritative.clone()
    }

    /// Number of ticks applied to the authoritative state
    pub fn current_tick(&self) -> u64 {
        self.shared.lock().tick
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.shared.stats()
    }
}

impl<S: Snapshot> Drop for StateCoordinator<S> {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Stopped = lifecycle {
            return;
        }

        debug!("Coordinator dropped without shutdown, closing channels");
        self.request_shutdown();
        self.shared.lock().registry.close_all();
    }
}

/// State moved onto the loop's task
struct TickLoop<S> {
    shared: Arc<Shared<S>>,
    policy: Box<dyn ReconciliationPolicy<S>>,
    advancer: Box<dyn AutonomousAdvancer<S>>,
    config: CoordinatorConfig,
    on_tick_error: Option<TickErrorHook>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: Snapshot> TickLoop<S> {
    async fn run(mut self) {
        {
            let world = self.shared.lock();
            let advancer = &mut *self.advancer;
            let initial = &world.authoritative;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| advancer.init(initial))) {
                error!(
                    "Advancer init panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }

        let period = self.config.tick_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        info!("Coordinator loop started with {:?} tick interval", period);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    trace!("Woken without shutdown, waiting for next tick");
                    continue;
                }

                _ = ticker.tick() => {}
            }

            if self.shared.is_shutdown_requested() {
                break;
            }

            let now = Instant::now();
            let mut delta = now.duration_since(last_tick);
            last_tick = now;

            if delta > self.config.max_delta {
                warn!(
                    "Large tick delta detected ({:?}), capping to {:?}",
                    delta, self.config.max_delta
                );
                delta = self.config.max_delta;
            }

            if let Err(err) = self.run_tick(delta) {
                error!("Tick aborted: {}", err);
                if let Some(hook) = &self.on_tick_error {
                    hook(&err);
                }
            }
        }

        info!("Coordinator loop stopped");
    }

    /// Runs one full tick under the coordinator lock
    fn run_tick(&mut self, delta: Duration) -> Result<(), TickError> {
        let mut world = self.shared.lock();

        if !world.registry.prune_detached().is_empty() {
            self.shared
                .clients
                .store(world.registry.len(), Ordering::Release);
        }

        let batch = world.registry.drain_proposals();
        let ctx = TickContext {
            tick: world.tick + 1,
            delta,
            proposals: batch.len(),
        };

        let policy = &*self.policy;
        let advancer = &mut *self.advancer;
        let current = &world.authoritative;

        let outcome = guarded(ctx.tick, TickStage::Reconcile, || policy.apply(current, batch))
            .and_then(|merged| {
                guarded(ctx.tick, TickStage::Advance, || advancer.step(merged, &ctx))
            });

        let next = match outcome {
            Ok(next) => next,
            Err(err) => {
                self.shared.ticks_aborted.fetch_add(1, Ordering::AcqRel);
                return Err(err);
            }
        };

        world.authoritative = next;
        world.tick = ctx.tick;
        world.registry.publish(&world.authoritative, world.tick);

        self.shared.ticks_completed.fetch_add(1, Ordering::AcqRel);
        debug!(
            "Tick {}: reconciled {} proposals for {} clients",
            ctx.tick,
            ctx.proposals,
            world.registry.len()
        );

        Ok(())
    }
}

/// Runs one stage of game logic, turning errors and panics into a
/// [`TickError`] for that stage.
fn guarded<T>(
    tick: u64,
    stage: TickStage,
    f: impl FnOnce() -> Result<T, PolicyError>,
) -> Result<T, TickError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(match stage {
            TickStage::Reconcile => TickError::Reconcile { tick, source },
            TickStage::Advance => TickError::Advance { tick, source },
        }),
        Err(payload) => Err(TickError::Panicked {
            tick,
            stage,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
