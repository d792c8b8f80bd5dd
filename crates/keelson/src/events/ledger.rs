//! Process-wide record of stored events, one slot per event identity.
//!
//! The ledger is the serialization point for event writes: a coordinator
//! claims an identity before writing and every other coordinator for the
//! same identity parks behind it. No lock is held while a write is in
//! flight; the claim is a flag in the slot, and waiters are fibers
//! suspended on a [`Pending`] handle.
//!
//! Slots live until the identity is forgotten or its involved object goes
//! away; see [`EventLedger::forget_involving`].

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::action::{NextAction, Pending, Resumer};
use crate::fiber::FiberId;
use crate::step::StepId;

use super::record::{EventIdentity, EventRecord, ObjectReference};

#[derive(Default)]
struct Slot {
    stored: Option<EventRecord>,
    /// Object name of a write whose outcome is unknown.
    unsettled: Option<String>,
    /// Occurrences whose write another claimant saw stored.
    landed: HashSet<String>,
    holder: Option<FiberId>,
    waiters: Vec<(Resumer, StepId)>,
}

impl Slot {
    fn idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }

    fn clear(&mut self) {
        self.stored = None;
        self.unsettled = None;
        self.landed.clear();
    }
}

/// What the ledger knew about an identity when a claim was granted.
#[derive(Debug, Clone, PartialEq)]
pub struct Known {
    pub stored: Option<EventRecord>,
    pub unsettled: Option<String>,
}

pub enum Claim {
    Granted(ClaimToken, Known),
    /// Another fiber holds the identity; park on the handle.
    Busy(Pending),
}

#[derive(Clone, Default)]
pub struct EventLedger {
    slots: Arc<DashMap<EventIdentity, Slot>>,
}

impl EventLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `identity` for `fiber`. When busy, the returned handle is
    /// resumed with `Continue(resume_at)` once the holder lets go.
    pub fn claim(&self, identity: &EventIdentity, fiber: FiberId, resume_at: StepId) -> Claim {
        let mut slot = self.slots.entry(identity.clone()).or_default();
        if let Some(holder) = slot.holder {
            let (pending, resumer) = Pending::channel();
            slot.waiters.push((resumer, resume_at));
            trace!(reason = %identity.reason, %holder, %fiber, "event identity busy");
            return Claim::Busy(pending);
        }
        slot.holder = Some(fiber);
        let known = Known {
            stored: slot.stored.clone(),
            unsettled: slot.unsettled.clone(),
        };
        Claim::Granted(
            ClaimToken {
                ledger: self.clone(),
                identity: Some(identity.clone()),
                attempted: None,
            },
            known,
        )
    }

    /// Feeds a record seen outside the engine, e.g. from a watch.
    pub fn observe(&self, record: EventRecord) {
        let mut slot = self.slots.entry(record.identity()).or_default();
        let newer = slot
            .stored
            .as_ref()
            .map_or(true, |stored| stored.count <= record.count);
        if newer {
            slot.stored = Some(record);
        }
    }

    /// Drops what is known about `identity`; the next emission creates.
    /// An idle slot is removed outright.
    pub fn forget(&self, identity: &EventIdentity) {
        if self.slots.remove_if(identity, |_, slot| slot.idle()).is_some() {
            return;
        }
        if let Some(mut slot) = self.slots.get_mut(identity) {
            slot.clear();
        }
    }

    /// Removes every idle slot whose involved object matches. Returns how
    /// many were removed.
    pub fn forget_involving(&self, involved: impl Fn(&ObjectReference) -> bool) -> usize {
        let mut removed = 0;
        self.slots.retain(|identity, slot| {
            let evict = slot.idle() && involved(&identity.involved);
            if evict {
                removed += 1;
            }
            !evict
        });
        if removed > 0 {
            debug!(removed, "forgot event identities");
        }
        removed
    }

    #[must_use]
    pub fn stored(&self, identity: &EventIdentity) -> Option<EventRecord> {
        self.slots.get(identity).and_then(|slot| slot.stored.clone())
    }

    #[must_use]
    pub fn holder(&self, identity: &EventIdentity) -> Option<FiberId> {
        self.slots.get(identity).and_then(|slot| slot.holder)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, identity: &EventIdentity, update: impl FnOnce(&mut Slot)) {
        let waiters = match self.slots.get_mut(identity) {
            Some(mut slot) => {
                update(slot.value_mut());
                slot.holder = None;
                std::mem::take(&mut slot.waiters)
            }
            None => Vec::new(),
        };
        if !waiters.is_empty() {
            debug!(reason = %identity.reason, waiters = waiters.len(), "waking event waiters");
        }
        for (resumer, step) in waiters {
            resumer.resume(NextAction::Continue(step));
        }
    }
}

impl std::fmt::Debug for EventLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLedger").field("identities", &self.slots.len()).finish()
    }
}

/// Exclusive right to write one identity. Dropping it without
/// [`settle`](Self::settle) releases the claim and marks any attempted
/// write as unsettled.
pub struct ClaimToken {
    ledger: EventLedger,
    identity: Option<EventIdentity>,
    attempted: Option<String>,
}

impl ClaimToken {
    /// Notes the object name a write is about to target.
    pub fn attempt(&mut self, name: impl Into<String>) {
        self.attempted = Some(name.into());
    }

    #[must_use]
    pub fn attempted(&self) -> Option<&str> {
        self.attempted.as_deref()
    }

    /// Notes that `occurrence`, written by another claimant, is stored.
    pub fn note_landed(&self, occurrence: &str) {
        if let Some(identity) = &self.identity {
            if let Some(mut slot) = self.ledger.slots.get_mut(identity) {
                slot.landed.insert(occurrence.to_owned());
            }
        }
    }

    /// Whether another claimant saw `occurrence` stored. The note is
    /// consumed.
    pub fn take_landed(&mut self, occurrence: &str) -> bool {
        self.identity.as_ref().is_some_and(|identity| {
            self.ledger
                .slots
                .get_mut(identity)
                .is_some_and(|mut slot| slot.landed.remove(occurrence))
        })
    }

    /// The write landed; `record` is what the API now stores.
    pub fn settle(mut self, record: EventRecord) {
        if let Some(identity) = self.identity.take() {
            self.ledger.release(&identity, |slot| {
                slot.stored = Some(record);
                slot.unsettled = None;
            });
        }
    }

    /// The stored object is gone; later writes must create.
    pub fn vanished(&mut self) {
        if let Some(identity) = &self.identity {
            if let Some(mut slot) = self.ledger.slots.get_mut(identity) {
                slot.clear();
            }
        }
        self.attempted = None;
    }
}

impl Drop for ClaimToken {
    fn drop(&mut self) {
        if let Some(identity) = self.identity.take() {
            let attempted = self.attempted.take();
            self.ledger.release(&identity, |slot| {
                if attempted.is_some() {
                    slot.unsettled = attempted;
                }
            });
        }
    }
}

impl std::fmt::Debug for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimToken")
            .field("reason", &self.identity.as_ref().map(|identity| identity.reason.as_str()))
            .field("attempted", &self.attempted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::record::{ObjectMeta, ObjectReference};
    use crate::events::Severity;
    use chrono::Utc;

    fn identity() -> EventIdentity {
        EventIdentity {
            reason: "DomainCreated".into(),
            involved: ObjectReference {
                name: "sample".into(),
                namespace: "ns1".into(),
                kind: "Domain".into(),
                api_version: None,
                uid: None,
            },
        }
    }

    fn record(count: u32) -> EventRecord {
        let now = Utc::now();
        let identity = identity();
        EventRecord {
            metadata: ObjectMeta {
                name: "sample.DomainCreated.1".into(),
                namespace: "ns1".into(),
                ..ObjectMeta::default()
            },
            reason: identity.reason,
            message: String::new(),
            severity: Severity::Normal,
            involved_object: identity.involved,
            first_timestamp: now,
            last_timestamp: now,
            count,
            reporting_component: "c".into(),
            reporting_instance: "i".into(),
        }
    }

    fn claim(ledger: &EventLedger, resume_at: usize) -> Claim {
        ledger.claim(&identity(), FiberId::new(), StepId::from_index(resume_at))
    }

    fn granted(claim: Claim) -> (ClaimToken, Known) {
        match claim {
            Claim::Granted(token, known) => (token, known),
            Claim::Busy(_) => panic!("expected the claim to be granted"),
        }
    }

    #[tokio::test]
    async fn test_second_claimant_waits_for_settle() {
        let ledger = EventLedger::new();
        let (token, known) = granted(claim(&ledger, 0));
        assert!(known.stored.is_none());

        let Claim::Busy(pending) = claim(&ledger, 3) else {
            panic!("expected the identity to be busy");
        };
        token.settle(record(1));

        assert!(matches!(
            pending.wait().await,
            NextAction::Continue(step) if step == StepId::from_index(3)
        ));
        let (_token, known) = granted(claim(&ledger, 3));
        assert_eq!(known.stored.map(|r| r.count), Some(1));
        assert!(known.unsettled.is_none());
    }

    #[tokio::test]
    async fn test_dropped_claim_marks_attempt_unsettled() {
        let ledger = EventLedger::new();
        let (mut token, _) = granted(claim(&ledger, 0));
        let Claim::Busy(pending) = claim(&ledger, 0) else {
            panic!("expected the identity to be busy");
        };
        token.attempt("sample.DomainCreated.7");
        drop(token);

        assert!(matches!(pending.wait().await, NextAction::Continue(_)));
        assert!(ledger.holder(&identity()).is_none());
        let (_token, known) = granted(claim(&ledger, 0));
        assert_eq!(known.unsettled.as_deref(), Some("sample.DomainCreated.7"));
    }

    #[test]
    fn test_vanished_clears_stored_record() {
        let ledger = EventLedger::new();
        ledger.observe(record(4));
        let (mut token, known) = granted(claim(&ledger, 0));
        assert_eq!(known.stored.map(|r| r.count), Some(4));
        token.vanished();
        drop(token);
        assert!(ledger.stored(&identity()).is_none());
    }

    #[test]
    fn test_observe_ignores_older_counts() {
        let ledger = EventLedger::new();
        ledger.observe(record(3));
        ledger.observe(record(2));
        assert_eq!(ledger.stored(&identity()).map(|r| r.count), Some(3));
        ledger.forget(&identity());
        assert!(ledger.stored(&identity()).is_none());
    }

    #[test]
    fn test_landed_occurrence_is_taken_once() {
        let ledger = EventLedger::new();
        ledger.observe(record(2));
        let (token, _) = granted(claim(&ledger, 0));
        token.note_landed("occ-a");
        drop(token);

        let (mut token, known) = granted(claim(&ledger, 0));
        assert_eq!(known.stored.map(|r| r.count), Some(2));
        assert!(!token.take_landed("occ-b"));
        assert!(token.take_landed("occ-a"));
        assert!(!token.take_landed("occ-a"));
    }

    #[test]
    fn test_vanished_discards_landed_occurrences() {
        let ledger = EventLedger::new();
        let (mut token, _) = granted(claim(&ledger, 0));
        token.note_landed("occ-a");
        token.vanished();
        assert!(!token.take_landed("occ-a"));
    }

    #[test]
    fn test_forget_evicts_idle_slot() {
        let ledger = EventLedger::new();
        ledger.observe(record(1));
        assert_eq!(ledger.len(), 1);
        ledger.forget(&identity());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_forget_keeps_held_slot_but_clears_it() {
        let ledger = EventLedger::new();
        ledger.observe(record(1));
        let (token, _) = granted(claim(&ledger, 0));
        ledger.forget(&identity());
        assert_eq!(ledger.len(), 1);
        assert!(ledger.stored(&identity()).is_none());
        drop(token);
    }

    #[test]
    fn test_forget_involving_skips_other_objects_and_held_slots() {
        let ledger = EventLedger::new();
        ledger.observe(record(1));
        let mut other = record(1);
        other.involved_object.name = "other".into();
        ledger.observe(other.clone());
        let mut held = record(1);
        held.reason = "DomainChanged".into();
        ledger.observe(held.clone());
        let held_claim = ledger.claim(&held.identity(), FiberId::new(), StepId::from_index(0));
        let (token, _) = granted(held_claim);

        let removed = ledger.forget_involving(|involved| involved.name == "sample");
        assert_eq!(removed, 1);
        assert_eq!(ledger.len(), 2);
        assert!(ledger.stored(&other.identity()).is_some());
        assert!(ledger.stored(&held.identity()).is_some());
        drop(token);
    }
}
