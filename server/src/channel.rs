//! Per-client mailboxes and the registry the coordinator iterates
//!
//! Each connected client owns a [`ClientChannel`] holding two single-slot
//! cells:
//! - a *proposed* slot the client overwrites whenever it wants to change the
//!   world (most recent proposal wins)
//! - a *published* slot the coordinator overwrites with a fresh copy of the
//!   authoritative state after every tick
//!
//! The slots are leaf locks held for a single read or write. The coordinator
//! only touches them while holding its own lock, never the other way round.

use crate::error::ChannelError;
use crate::policy::Proposal;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Identifier handed out by `connect()`. Ids increase monotonically and are
/// never reused, so ordering by id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slots shared between a client handle and the registry
pub(crate) struct Mailbox<S> {
    id: ChannelId,
    proposed: Mutex<Option<S>>,
    published: Mutex<Option<S>>,
    published_tick: AtomicU64,
    closed: AtomicBool,
    updated: Notify,
}

impl<S> Mailbox<S> {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            proposed: Mutex::new(None),
            published: Mutex::new(None),
            published_tick: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            updated: Notify::new(),
        }
    }

    /// Reads and clears the proposed slot
    pub(crate) fn take_proposed(&self) -> Option<S> {
        lock_slot(&self.proposed).take()
    }

    /// Replaces the published slot, dropping any unread snapshot
    pub(crate) fn post_update(&self, snapshot: S, tick: u64) {
        *lock_slot(&self.published) = Some(snapshot);
        self.published_tick.store(tick, Ordering::Release);
        self.updated.notify_one();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.updated.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One client's connection to the coordinator.
///
/// The handle is meant to live on the client's I/O thread or task. Dropping
/// it detaches the client: the coordinator prunes the channel at the start
/// of its next tick.
pub struct ClientChannel<S> {
    mailbox: Arc<Mailbox<S>>,
}

impl<S> ClientChannel<S> {
    pub fn id(&self) -> ChannelId {
        self.mailbox.id
    }

    /// Replaces the pending proposal.
    ///
    /// Only the latest proposal matters: an earlier one that the coordinator
    /// has not drained yet is discarded.
    pub fn submit_proposed(&self, update: S) -> Result<(), ChannelError> {
        if self.mailbox.is_closed() {
            return Err(ChannelError::Closed(self.mailbox.id));
        }
        *lock_slot(&self.mailbox.proposed) = Some(update);
        Ok(())
    }

    /// Takes the most recently published snapshot, leaving the slot empty
    pub fn take_published(&self) -> Option<S> {
        lock_slot(&self.mailbox.published).take()
    }

    /// Copies the most recently published snapshot without consuming it
    pub fn latest_published(&self) -> Option<S>
    where
        S: Clone,
    {
        lock_slot(&self.mailbox.published).clone()
    }

    /// Tick number of the last snapshot posted to this channel, 0 if none
    pub fn published_tick(&self) -> u64 {
        self.mailbox.published_tick.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Waits until a snapshot has been posted since the previous call.
    ///
    /// Returns an error once the channel is closed, so async transports can
    /// use this as their receive loop condition.
    pub async fn updated(&self) -> Result<(), ChannelError> {
        if self.mailbox.is_closed() {
            return Err(ChannelError::Closed(self.mailbox.id));
        }
        self.mailbox.updated.notified().await;
        if self.mailbox.is_closed() {
            return Err(ChannelError::Closed(self.mailbox.id));
        }
        Ok(())
    }
}

impl<S> fmt::Debug for ClientChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.mailbox.id)
            .field("published_tick", &self.published_tick())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// All channels known to the coordinator, in registration order.
///
/// Every method requires `&mut self` or `&self` on a registry that lives
/// under the coordinator lock, so iteration and mutation never overlap.
pub(crate) struct ChannelRegistry<S> {
    channels: BTreeMap<ChannelId, Arc<Mailbox<S>>>,
    next_id: u64,
}

impl<S> ChannelRegistry<S> {
    pub(crate) fn new() -> Self {
        Self {
            channels: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn register(&mut self) -> ClientChannel<S> {
        let id = ChannelId(self.next_id);
        self.next_id += 1;

        let mailbox = Arc::new(Mailbox::new(id));
        self.channels.insert(id, Arc::clone(&mailbox));
        info!("Channel {} connected", id);

        ClientChannel { mailbox }
    }

    /// Removes and closes a channel. Returns false if it was already gone.
    pub(crate) fn remove(&mut self, id: ChannelId) -> bool {
        if let Some(mailbox) = self.channels.remove(&id) {
            mailbox.close();
            info!("Channel {} disconnected", id);
            true
        } else {
            false
        }
    }

    /// Drops channels whose client handle no longer exists.
    ///
    /// Returns the pruned ids.
    pub(crate) fn prune_detached(&mut self) -> Vec<ChannelId> {
        let detached: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, mailbox)| Arc::strong_count(mailbox) == 1)
            .map(|(id, _)| *id)
            .collect();

        for id in &detached {
            if let Some(mailbox) = self.channels.remove(id) {
                mailbox.close();
            }
            info!("Channel {} detached, pruned from registry", id);
        }

        detached
    }

    /// Takes every pending proposal, one per channel, in registration order
    pub(crate) fn drain_proposals(&self) -> Vec<Proposal<S>> {
        self.channels
            .iter()
            .filter_map(|(id, mailbox)| {
                mailbox
                    .take_proposed()
                    .map(|snapshot| Proposal::new(*id, snapshot))
            })
            .collect()
    }

    /// Posts an independent copy of `snapshot` to every channel
    pub(crate) fn publish(&self, snapshot: &S, tick: u64)
    where
        S: Clone,
    {
        for mailbox in self.channels.values() {
            mailbox.post_update(snapshot.clone(), tick);
        }
        debug!("Published tick {} to {} channels", tick, self.channels.len());
    }

    /// Closes and forgets every channel
    pub(crate) fn close_all(&mut self) {
        for mailbox in self.channels.values() {
            mailbox.close();
        }
        self.channels.clear();
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}
