//! Shared registry of endpoints and their live status
//!
//! All reads and writes go through one mutex. The claim operation (scan for
//! the first queued entry and flip it to testing) happens inside a single
//! critical section, so two workers can never own the same entry.
//!
//! Ownership is tracked apart from the displayed state: a claimed entry stays
//! owned for its whole retry sequence, including the gaps between attempts
//! where its state reads `Fail`, until the worker releases it. Requeue,
//! cancel and removal all leave owned entries alone.
//!
//! Every mutation is followed by a [`RegistryEvent`] on a broadcast channel
//! for observers that render the registry.

use crate::error::RegistryError;
use crate::proxy::models::{Endpoint, ProbeState, ProbeStatus, ProxyKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::broadcast;

/// Capacity of the change notification channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Stable handle for an entry, unaffected by removals shifting indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An endpoint together with its status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    id: EntryId,
    endpoint: Endpoint,
    status: ProbeStatus,
    claimed: bool,
}

impl Entry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn status(&self) -> &ProbeStatus {
        &self.status
    }

    /// Whether a worker currently owns this entry
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}

/// Change notification published after every registry mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(EntryId),
    Removed(Vec<EntryId>),
    Edited(EntryId),
    Claimed(EntryId),
    Released(EntryId),
    StatusChanged(EntryId, ProbeState),
    Requeued(usize),
    Cancelled(usize),
}

/// Entry handed to a worker by a successful claim
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: EntryId,
    pub endpoint: Endpoint,
}

/// Result of a bulk removal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// Number of entries actually removed
    pub removed: usize,
    /// Requested indices left in place because a worker owns them
    pub skipped: Vec<usize>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_id: u64,
}

impl Inner {
    fn find_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    fn check_index(&self, index: usize) -> Result<(), RegistryError> {
        if index < self.entries.len() {
            Ok(())
        } else {
            Err(RegistryError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })
        }
    }
}

/// Ordered, deduplicated collection of probe targets
pub struct Registry {
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Subscribe to change notifications
    ///
    /// A subscriber that falls behind receives `Lagged` and should resync
    /// from [`Registry::snapshot`].
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Append an endpoint unless an equal one is already present
    pub fn add(&self, endpoint: Endpoint) -> bool {
        let id = {
            let mut inner = self.inner.lock();
            if inner.entries.iter().any(|e| e.endpoint == endpoint) {
                return false;
            }
            let id = EntryId(inner.next_id);
            inner.next_id += 1;
            inner.entries.push(Entry {
                id,
                endpoint,
                status: ProbeStatus::new(),
                claimed: false,
            });
            id
        };
        self.notify(RegistryEvent::Added(id));
        true
    }

    /// Remove the entries at `indices`, skipping any that a worker owns
    ///
    /// The ownership check is made at removal time under the lock. If any
    /// index is out of range nothing is removed.
    pub fn remove(&self, indices: &[usize]) -> Result<RemoveOutcome, RegistryError> {
        let mut outcome = RemoveOutcome::default();
        let mut removed_ids = Vec::new();
        {
            let mut inner = self.inner.lock();
            for &index in indices {
                inner.check_index(index)?;
            }
            let unique: BTreeSet<usize> = indices.iter().copied().collect();
            for &index in unique.iter().rev() {
                if inner.entries[index].claimed {
                    tracing::warn!(
                        index,
                        endpoint = %inner.entries[index].endpoint,
                        "refusing to remove endpoint under test"
                    );
                    outcome.skipped.push(index);
                    continue;
                }
                let entry = inner.entries.remove(index);
                removed_ids.push(entry.id);
                outcome.removed += 1;
            }
        }
        outcome.skipped.reverse();
        if !removed_ids.is_empty() {
            self.notify(RegistryEvent::Removed(removed_ids));
        }
        Ok(outcome)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Entry> {
        self.inner.lock().entries.get(index).cloned()
    }

    pub fn find(&self, id: EntryId) -> Option<Entry> {
        self.inner.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Index of the first entry in `state`, in insertion order
    pub fn first_in_state(&self, state: ProbeState) -> Option<usize> {
        self.inner
            .lock()
            .entries
            .iter()
            .position(|e| e.status.state() == state)
    }

    /// Copy of all entries in insertion order
    pub fn snapshot(&self) -> Vec<Entry> {
        self.inner.lock().entries.clone()
    }

    /// Run `f` over the live entries while holding the lock
    pub fn with_entries<R>(&self, f: impl FnOnce(&[Entry]) -> R) -> R {
        f(&self.inner.lock().entries)
    }

    pub fn set_kind(&self, index: usize, kind: ProxyKind) -> Result<(), RegistryError> {
        self.edit(index, |endpoint| endpoint.set_kind(kind))
    }

    pub fn set_ip(&self, index: usize, ip: &str) -> Result<(), RegistryError> {
        self.edit(index, |endpoint| endpoint.set_ip(ip))
    }

    pub fn set_port(&self, index: usize, port: u32) -> Result<(), RegistryError> {
        self.edit(index, |endpoint| endpoint.set_port(port))
    }

    // Edits may make two entries equal; only insertion is deduplicated.
    fn edit(&self, index: usize, f: impl FnOnce(&mut Endpoint)) -> Result<(), RegistryError> {
        let id = {
            let mut inner = self.inner.lock();
            inner.check_index(index)?;
            let entry = &mut inner.entries[index];
            f(&mut entry.endpoint);
            entry.id
        };
        self.notify(RegistryEvent::Edited(id));
        Ok(())
    }

    /// Queue every entry that no worker owns
    pub fn requeue_all(&self) -> usize {
        self.requeue_all_and(|count| count)
    }

    /// Queue every entry no worker owns, then run `then` inside the same
    /// critical section with the number of entries queued
    pub(crate) fn requeue_all_and<R>(&self, then: impl FnOnce(usize) -> R) -> R {
        let (count, result) = {
            let mut inner = self.inner.lock();
            let mut count = 0;
            for entry in inner.entries.iter_mut() {
                if !entry.claimed {
                    entry.status.set_state(ProbeState::Queued);
                    count += 1;
                }
            }
            (count, then(count))
        };
        self.notify(RegistryEvent::Requeued(count));
        result
    }

    /// Cancel every queued entry; owned entries are left alone
    pub fn cancel_queued(&self) -> usize {
        let count = {
            let mut inner = self.inner.lock();
            let mut count = 0;
            for entry in inner.entries.iter_mut() {
                if !entry.claimed && entry.status.state() == ProbeState::Queued {
                    entry.status.set_state(ProbeState::Cancelled);
                    count += 1;
                }
            }
            count
        };
        self.notify(RegistryEvent::Cancelled(count));
        count
    }

    /// Atomically take the first queued entry, mark it as testing and own it
    ///
    /// The entry stays owned until [`Registry::release`] is called for it.
    ///
    /// When nothing is queued, `on_empty` runs before the lock is released,
    /// which lets the pool retire a worker without racing a concurrent start.
    pub(crate) fn claim_next(&self, on_empty: impl FnOnce()) -> Option<Claim> {
        let claim = {
            let mut inner = self.inner.lock();
            match inner
                .entries
                .iter_mut()
                .find(|e| !e.claimed && e.status.state() == ProbeState::Queued)
            {
                Some(entry) => {
                    entry.claimed = true;
                    entry.status.set_state(ProbeState::Testing);
                    Claim {
                        id: entry.id,
                        endpoint: entry.endpoint.clone(),
                    }
                }
                None => {
                    on_empty();
                    return None;
                }
            }
        };
        self.notify(RegistryEvent::Claimed(claim.id));
        Some(claim)
    }

    /// Give up ownership of a claimed entry once its retry sequence is over
    ///
    /// Returns false when the entry no longer exists or was not owned.
    pub fn release(&self, id: EntryId) -> bool {
        {
            let mut inner = self.inner.lock();
            match inner.find_mut(id) {
                Some(entry) if entry.claimed => entry.claimed = false,
                _ => return false,
            }
        }
        self.notify(RegistryEvent::Released(id));
        true
    }

    /// Apply a status write to the entry `id` and publish the new state
    ///
    /// Returns false when the entry no longer exists.
    pub fn update_status(&self, id: EntryId, f: impl FnOnce(&mut ProbeStatus)) -> bool {
        let state = {
            let mut inner = self.inner.lock();
            match inner.find_mut(id) {
                Some(entry) => {
                    f(&mut entry.status);
                    entry.status.state()
                }
                None => return false,
            }
        };
        self.notify(RegistryEvent::StatusChanged(id, state));
        true
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(ip: &str, port: u32) -> Endpoint {
        Endpoint::new(ProxyKind::Http, ip, port)
    }

    fn registry_with(n: usize) -> Registry {
        let registry = Registry::new();
        for i in 0..n {
            assert!(registry.add(http(&format!("10.0.0.{}", i + 1), 8080)));
        }
        registry
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let registry = Registry::new();
        assert!(registry.add(http("1.2.3.4", 8080)));
        assert!(!registry.add(http("1.2.3.4", 8080)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_keeps_insertion_order_and_new_state() {
        let registry = registry_with(3);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].endpoint().ip(), "10.0.0.1");
        assert_eq!(snapshot[2].endpoint().ip(), "10.0.0.3");
        assert!(snapshot
            .iter()
            .all(|e| e.status().state() == ProbeState::New));
    }

    #[test]
    fn test_remove_skips_testing_entries() {
        let registry = registry_with(3);
        registry.requeue_all();
        let claim = registry.claim_next(|| {}).unwrap();
        assert_eq!(claim.endpoint.ip(), "10.0.0.1");

        let outcome = registry.remove(&[0, 1, 2]).unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.skipped, vec![0]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(0).unwrap().id(), claim.id);
    }

    #[test]
    fn test_remove_out_of_range_leaves_registry_untouched() {
        let registry = registry_with(2);
        let err = registry.remove(&[0, 5]).unwrap_err();
        assert_eq!(err, RegistryError::IndexOutOfRange { index: 5, len: 2 });
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_handles_unsorted_and_repeated_indices() {
        let registry = registry_with(4);
        let outcome = registry.remove(&[3, 1, 3]).unwrap();
        assert_eq!(outcome.removed, 2);
        let ips: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|e| e.endpoint().ip().to_string())
            .collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn test_requeue_preserves_testing() {
        let registry = registry_with(3);
        registry.requeue_all();
        let claim = registry.claim_next(|| {}).unwrap();
        registry.update_status(claim.id, |s| s.mark_fail("x"));
        assert!(registry.release(claim.id));
        let second = registry.claim_next(|| {}).unwrap();

        let queued = registry.requeue_all();
        assert_eq!(queued, 2);
        assert_eq!(
            registry.find(second.id).unwrap().status().state(),
            ProbeState::Testing
        );
        assert_eq!(
            registry.find(claim.id).unwrap().status().state(),
            ProbeState::Queued
        );
    }

    // Between two attempts the state reads Fail, but the entry is still owned.
    #[test]
    fn test_owned_entry_between_attempts_is_left_alone() {
        let registry = registry_with(2);
        registry.requeue_all();
        let claim = registry.claim_next(|| {}).unwrap();
        registry.update_status(claim.id, |s| s.mark_fail("read timed out"));
        assert!(registry.get(0).unwrap().is_claimed());

        assert_eq!(registry.requeue_all(), 1);
        assert_eq!(
            registry.find(claim.id).unwrap().status().state(),
            ProbeState::Fail
        );

        let second = registry.claim_next(|| {}).unwrap();
        assert_ne!(second.id, claim.id);
        assert!(registry.claim_next(|| {}).is_none());

        let outcome = registry.remove(&[0]).unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.skipped, vec![0]);

        assert!(registry.release(claim.id));
        assert!(!registry.release(claim.id));
        assert_eq!(registry.requeue_all(), 1);
        assert_eq!(
            registry.find(claim.id).unwrap().status().state(),
            ProbeState::Queued
        );
    }

    #[test]
    fn test_cancel_only_touches_queued() {
        let registry = registry_with(3);
        registry.requeue_all();
        let claim = registry.claim_next(|| {}).unwrap();

        assert_eq!(registry.cancel_queued(), 2);
        let states: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|e| e.status().state())
            .collect();
        assert_eq!(
            states,
            vec![
                ProbeState::Testing,
                ProbeState::Cancelled,
                ProbeState::Cancelled
            ]
        );
        assert!(registry.claim_next(|| {}).is_none());
        assert_eq!(
            registry.find(claim.id).unwrap().status().state(),
            ProbeState::Testing
        );
    }

    #[test]
    fn test_claim_runs_on_empty_when_nothing_queued() {
        let registry = registry_with(1);
        let mut called = false;
        assert!(registry.claim_next(|| called = true).is_none());
        assert!(called);
    }

    #[test]
    fn test_first_in_state() {
        let registry = registry_with(3);
        assert_eq!(registry.first_in_state(ProbeState::New), Some(0));
        assert_eq!(registry.first_in_state(ProbeState::Queued), None);
        registry.requeue_all();
        registry.claim_next(|| {});
        assert_eq!(registry.first_in_state(ProbeState::Queued), Some(1));
    }

    #[test]
    fn test_edits_can_create_duplicates() {
        let registry = registry_with(2);
        registry.set_ip(1, "10.0.0.1").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get(0).unwrap().endpoint(),
            registry.get(1).unwrap().endpoint()
        );
        assert!(registry.set_port(7, 1).is_err());
        registry.set_kind(0, ProxyKind::Socks).unwrap();
        registry.set_port(0, 1080).unwrap();
        assert_eq!(registry.get(0).unwrap().endpoint().to_string(), "socks 10.0.0.1:1080");
    }

    #[test]
    fn test_events_are_published() {
        let registry = Registry::new();
        let mut rx = registry.subscribe();
        registry.add(http("1.2.3.4", 80));
        registry.requeue_all();
        let claim = registry.claim_next(|| {}).unwrap();
        registry.update_status(claim.id, |s| s.mark_ok(5));

        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::Added(claim.id));
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::Requeued(1));
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::Claimed(claim.id));
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::StatusChanged(claim.id, ProbeState::Ok)
        );
    }
}
