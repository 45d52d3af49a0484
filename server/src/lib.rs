//! # Authoritative State Server Library
//!
//! This library maintains one authoritative, mutable world state shared by
//! many concurrently connected clients. Clients propose changes at any time;
//! the server periodically reconciles those proposals into a single
//! consistent state, advances the world on its own, and hands every client an
//! isolated copy of the result.
//!
//! ## Core Responsibilities
//!
//! ### Proposal Intake
//! Each client talks to the server through a [`ClientChannel`]. Submitting a
//! proposal never blocks on the simulation: it only overwrites a single slot,
//! so a client that submits faster than the server ticks simply has its
//! older, unread proposals replaced.
//!
//! ### Periodic Reconciliation
//! The [`StateCoordinator`] wakes on a fixed interval (100ms by default),
//! drains every channel, folds the batch into the authoritative state with a
//! [`ReconciliationPolicy`], then steps the world with an
//! [`AutonomousAdvancer`].
//!
//! ### State Distribution
//! After every successful tick each channel receives its own copy of the new
//! state. Clients can poll [`ClientChannel::take_published`] from a blocking
//! thread or await [`ClientChannel::updated`] from an async task.
//!
//! ## Architecture Design
//!
//! ### One Lock, One Tick
//! The authoritative state and the channel registry live behind a single
//! mutex. A tick holds it from draining the first proposal until the last
//! copy is published, so every client sees a state reflecting all proposals
//! collected in that tick and nothing submitted mid-tick is lost. The wait
//! between ticks happens outside the lock.
//!
//! ### Timer-Driven Task
//! The loop is a tokio task combining an interval timer with a shutdown
//! signal. Shutdown interrupts the wait immediately; a tick that has started
//! always finishes.
//!
//! ### Failure Isolation
//! Game logic errors and panics abort only the current tick. The previous
//! state stays authoritative, the failure is logged and passed to the hook
//! installed with [`StateCoordinator::on_tick_error`], and the loop carries
//! on.
//!
//! ## Module Organization
//!
//! ### Channel Module (`channel`)
//! Client mailboxes and the registry the coordinator iterates.
//!
//! ### Coordinator Module (`coordinator`)
//! Ownership of the authoritative state, lifecycle and the tick loop.
//!
//! ### Policy Module (`policy`)
//! Traits for pluggable game logic and a few generic strategies.
//!
//! ### Game Module (`game`)
//! Reference merge policy and advancer for [`shared::WorldState`].
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::game::{DeltaMergePolicy, WorldAdvancer};
//! use server::{CoordinatorConfig, StateCoordinator};
//! use shared::WorldState;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = StateCoordinator::with_config(
//!         WorldState::new(),
//!         DeltaMergePolicy,
//!         WorldAdvancer::new(),
//!         CoordinatorConfig::with_tick_interval(Duration::from_millis(50)),
//!     )?;
//!
//!     // One channel per client, usually created by the transport layer
//!     let channel = coordinator.connect()?;
//!     coordinator.start()?;
//!
//!     let mut proposal = WorldState::new();
//!     proposal.hp = 5;
//!     channel.submit_proposed(proposal)?;
//!
//!     channel.updated().await?;
//!     let state = channel.take_published();
//!     println!("{:?}", state);
//!
//!     coordinator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod game;
pub mod policy;

pub use channel::{ChannelId, ClientChannel};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorStats, StateCoordinator, TickErrorHook};
pub use error::{ChannelError, CoordinatorError, PolicyError, TickError, TickStage};
pub use policy::{
    AutonomousAdvancer, FirstProposalWins, Frozen, KeepCurrent, LatestProposalWins, Proposal,
    ReconciliationPolicy, Snapshot, TickContext,
};
