//! Pluggable game logic invoked by the coordinator once per tick
//!
//! The coordinator only defines *when* these run and what they see. How a
//! batch of proposals is merged, and how the world moves on by itself, is
//! supplied by the game through [`ReconciliationPolicy`] and
//! [`AutonomousAdvancer`].

use crate::channel::ChannelId;
use crate::error::PolicyError;
use std::time::Duration;

/// Any value usable as world state.
///
/// `Clone` is the independent-copy operation: the `Send + 'static` bounds
/// rule out `Rc`-style sharing, so a clone handed to a client never aliases
/// the authoritative value.
pub trait Snapshot: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Snapshot for T {}

/// A client's proposed world state, tagged with the channel it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal<S> {
    pub channel: ChannelId,
    pub snapshot: S,
}

impl<S> Proposal<S> {
    pub fn new(channel: ChannelId, snapshot: S) -> Self {
        Self { channel, snapshot }
    }
}

/// Information about the tick being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    /// Number of the tick being produced, starting at 1
    pub tick: u64,
    /// Time since the previous tick, capped at the configured maximum
    pub delta: Duration,
    /// Number of proposals in this tick's batch
    pub proposals: usize,
}

/// Folds one tick's proposals into the authoritative state.
///
/// Called once per tick with the full batch, ordered by channel
/// registration. Implementations must be deterministic for a given
/// `current` and batch. Returning an error aborts the tick and leaves the
/// authoritative state untouched.
pub trait ReconciliationPolicy<S>: Send {
    fn apply(&self, current: &S, proposals: Vec<Proposal<S>>) -> Result<S, PolicyError>;
}

impl<S, F> ReconciliationPolicy<S> for F
where
    F: Fn(&S, Vec<Proposal<S>>) -> Result<S, PolicyError> + Send,
{
    fn apply(&self, current: &S, proposals: Vec<Proposal<S>>) -> Result<S, PolicyError> {
        self(current, proposals)
    }
}

/// Advances the world by one step regardless of client input.
///
/// Runs exactly once per tick, after reconciliation and before publishing,
/// including ticks with an empty batch.
pub trait AutonomousAdvancer<S>: Send {
    /// Called once on the loop's execution context before the first tick
    fn init(&mut self, _initial: &S) {}

    fn step(&mut self, current: S, ctx: &TickContext) -> Result<S, PolicyError>;
}

impl<S, F> AutonomousAdvancer<S> for F
where
    F: FnMut(S, &TickContext) -> Result<S, PolicyError> + Send,
{
    fn step(&mut self, current: S, ctx: &TickContext) -> Result<S, PolicyError> {
        self(current, ctx)
    }
}

/// Ignores every proposal
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepCurrent;

impl<S: Snapshot> ReconciliationPolicy<S> for KeepCurrent {
    fn apply(&self, current: &S, _proposals: Vec<Proposal<S>>) -> Result<S, PolicyError> {
        Ok(current.clone())
    }
}

/// Adopts the proposal of the most recently registered client that
/// submitted one this tick
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestProposalWins;

impl<S: Snapshot> ReconciliationPolicy<S> for LatestProposalWins {
    fn apply(&self, current: &S, proposals: Vec<Proposal<S>>) -> Result<S, PolicyError> {
        Ok(proposals
            .into_iter()
            .last()
            .map(|proposal| proposal.snapshot)
            .unwrap_or_else(|| current.clone()))
    }
}

/// Adopts the proposal of the earliest registered client that submitted
/// one this tick
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstProposalWins;

impl<S: Snapshot> ReconciliationPolicy<S> for FirstProposalWins {
    fn apply(&self, current: &S, proposals: Vec<Proposal<S>>) -> Result<S, PolicyError> {
        Ok(proposals
            .into_iter()
            .next()
            .map(|proposal| proposal.snapshot)
            .unwrap_or_else(|| current.clone()))
    }
}

/// Advancer for worlds that only change through proposals
#[derive(Debug, Clone, Copy, Default)]
pub struct Frozen;

impl<S: Snapshot> AutonomousAdvancer<S> for Frozen {
    fn step(&mut self, current: S, _ctx: &TickContext) -> Result<S, PolicyError> {
        Ok(current)
    }
}
