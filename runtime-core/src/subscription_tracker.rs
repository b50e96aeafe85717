// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-principal index of active subscriptions, derived from the bus's
//! subscription table.
//!
//! `spec.md` §9 warns against modeling the tracker and the bus's own
//! subscription table as two mutually-pointing structures; this type is
//! intentionally "dumb" — the bus is the source of truth for handler
//! storage, and this is a derived `principal -> [event type]` index kept in
//! lockstep so `unsubscribe_all` can run without a linear scan of every
//! subscription in the bus (`spec.md` §4.9).

use std::collections::HashMap;

use runtime_abi::{EventTypeId, PrincipalId};

#[derive(Default)]
pub struct SubscriptionTracker {
    by_principal: HashMap<PrincipalId, Vec<EventTypeId>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, principal: PrincipalId, event_type: EventTypeId) {
        let types = self.by_principal.entry(principal).or_default();
        if !types.contains(&event_type) {
            types.push(event_type);
        }
    }

    pub fn remove(&mut self, principal: PrincipalId, event_type: EventTypeId) {
        if let Some(types) = self.by_principal.get_mut(&principal) {
            types.retain(|&t| t != event_type);
        }
    }

    /// Returns and clears every event type `principal` was subscribed to.
    /// Used during teardown; the bus uses the returned list to deactivate
    /// each subscription (`spec.md` §4.9).
    pub fn unsubscribe_all(&mut self, principal: PrincipalId) -> Vec<EventTypeId> {
        self.by_principal.remove(&principal).unwrap_or_default()
    }

    pub fn subscriptions_of(&self, principal: PrincipalId) -> &[EventTypeId] {
        self.by_principal
            .get(&principal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_twice_is_idempotent() {
        let mut t = SubscriptionTracker::new();
        let p = PrincipalId(1);
        let ty = EventTypeId(0);
        t.record(p, ty);
        t.record(p, ty);
        assert_eq!(t.subscriptions_of(p), &[ty]);
    }

    #[test]
    fn unsubscribe_all_clears_and_returns_every_type() {
        let mut t = SubscriptionTracker::new();
        let p = PrincipalId(1);
        t.record(p, EventTypeId(0));
        t.record(p, EventTypeId(1));
        let mut removed = t.unsubscribe_all(p);
        removed.sort_by_key(|e| e.0);
        assert_eq!(removed, vec![EventTypeId(0), EventTypeId(1)]);
        assert!(t.subscriptions_of(p).is_empty());
    }

    #[test]
    fn remove_is_selective() {
        let mut t = SubscriptionTracker::new();
        let p = PrincipalId(1);
        t.record(p, EventTypeId(0));
        t.record(p, EventTypeId(1));
        t.remove(p, EventTypeId(0));
        assert_eq!(t.subscriptions_of(p), &[EventTypeId(1)]);
    }
}
