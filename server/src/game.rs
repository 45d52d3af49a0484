//! Reference game logic for [`WorldState`]
//!
//! Clients propose whole world states. The merge policy turns each proposal
//! into a set of changes against the current state and applies them in
//! registration order, and the advancer runs unit movement once per tick.

use crate::channel::ChannelId;
use crate::error::PolicyError;
use crate::policy::{AutonomousAdvancer, Proposal, ReconciliationPolicy, TickContext};
use log::{debug, info, warn};
use shared::WorldState;
use std::collections::BTreeSet;

/// Merges proposals as deltas against the current state.
///
/// - `hp` changes from every proposal are summed.
/// - Unit edits are first-writer-wins per unit id: once one proposal has
///   changed a unit this tick, later edits to the same unit are dropped.
/// - Unknown unit ids are spawned.
/// - Units missing from a proposal are left alone.
/// - A proposal's `tick` is ignored; only the coordinator advances time.
///
/// A malformed proposal (a unit stored under another id, or an `hp` change
/// that would overflow) is skipped on its own. It never costs the other
/// clients their proposals for the tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaMergePolicy;

impl DeltaMergePolicy {
    /// Folds one proposal into `merged`, or leaves `merged` untouched if the
    /// proposal is rejected.
    fn merge_one(
        current: &WorldState,
        merged: &mut WorldState,
        claimed: &mut BTreeSet<u32>,
        channel: ChannelId,
        snapshot: WorldState,
    ) -> Result<(), PolicyError> {
        let reject = |reason: String| PolicyError::Rejected { channel, reason };

        let hp = snapshot
            .hp
            .checked_sub(current.hp)
            .and_then(|delta| merged.hp.checked_add(delta))
            .ok_or_else(|| reject("hp overflow".to_string()))?;

        if let Some((id, unit)) = snapshot.units.iter().find(|(id, unit)| **id != unit.id) {
            return Err(reject(format!("unit keyed {} claims id {}", id, unit.id)));
        }

        merged.hp = hp;
        for (id, unit) in snapshot.units {
            if current.units.get(&id) == Some(&unit) {
                continue;
            }
            if !claimed.insert(id) {
                debug!("Channel {} lost edit conflict on unit {}", channel, id);
                continue;
            }
            if !current.units.contains_key(&id) {
                info!("Channel {} spawned unit {}", channel, id);
            }
            merged.units.insert(id, unit);
        }

        Ok(())
    }
}

impl ReconciliationPolicy<WorldState> for DeltaMergePolicy {
    fn apply(
        &self,
        current: &WorldState,
        proposals: Vec<Proposal<WorldState>>,
    ) -> Result<WorldState, PolicyError> {
        let mut merged = current.clone();
        let mut claimed: BTreeSet<u32> = BTreeSet::new();

        for Proposal { channel, snapshot } in proposals {
            if let Err(err) = Self::merge_one(current, &mut merged, &mut claimed, channel, snapshot) {
                warn!("Skipping malformed proposal: {}", err);
            }
        }

        Ok(merged)
    }
}

/// Moves units, removes dead ones and counts ticks
#[derive(Debug, Default)]
pub struct WorldAdvancer {
    start_tick: u64,
}

impl WorldAdvancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick the world was at when the loop started
    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }
}

impl AutonomousAdvancer<WorldState> for WorldAdvancer {
    fn init(&mut self, initial: &WorldState) {
        self.start_tick = initial.tick;
        info!(
            "World advancer starting at tick {} with {} units",
            initial.tick,
            initial.units.len()
        );
    }

    fn step(&mut self, mut current: WorldState, ctx: &TickContext) -> Result<WorldState, PolicyError> {
        let dt = ctx.delta.as_secs_f32();

        for unit in current.units.values_mut() {
            unit.integrate(dt);
        }

        let before = current.units.len();
        current.units.retain(|_, unit| unit.is_alive());
        let removed = before - current.units.len();
        if removed > 0 {
            debug!("Tick {}: removed {} dead units", ctx.tick, removed);
        }

        current.tick = current
            .tick
            .checked_add(1)
            .ok_or_else(|| PolicyError::failed("world tick counter overflow"))?;
        Ok(current)
    }
}
