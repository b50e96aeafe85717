// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed event bus: name interning, subscriptions, posting, and the
//! dispatch loop.
//!
//! Grounded on `original_source/.../event_bus.h` for the operation shape
//! (`register_type`/`subscribe`/`unsubscribe`/`post`) and on the teacher's
//! `task/jefe` for the rule that handlers run with no core lock held —
//! jefe never calls back into a task while holding its own bookkeeping
//! lock, and neither does the dispatch loop here (`spec.md` §4.7 step 3).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use runtime_abi::{Error, EventTypeId, Priority, PrincipalId, Result};

use crate::handler_monitor::HandlerMonitor;
use crate::memory_pool::{Allocation, PoolAllocator};
use crate::priority_queue::{PriorityQueue, QueuedEvent};
use crate::quota::QuotaEnforcer;
use crate::subscription_tracker::SubscriptionTracker;

/// A handler closure, shared via `Arc` so the dispatcher can clone a
/// snapshot of matching subscribers out from under the bus lock and invoke
/// them without holding it (`spec.md` §9: "a trait-object / closure pair is
/// the natural model", and §4.7 step 3: "handlers must not hold the bus
/// lock").
pub type Handler = Arc<dyn Fn(&DeliveredEvent) + Send + Sync>;

/// The payload handed to a handler on dispatch. Borrowed for the duration
/// of the call; the dispatcher frees the backing allocation once every
/// subscriber has returned.
pub struct DeliveredEvent<'a> {
    pub event_type: EventTypeId,
    pub sender: PrincipalId,
    pub priority: Priority,
    pub payload: &'a [u8],
    pub posted_at: Instant,
}

struct Subscription {
    principal: PrincipalId,
    handler: Handler,
}

struct Inner {
    type_names: Vec<String>,
    type_by_name: HashMap<String, EventTypeId>,
    subscriptions: HashMap<EventTypeId, Vec<Subscription>>,
    max_event_types: usize,
    max_subscriptions: usize,
    subscription_count: usize,
}

/// The bus's own lock guards event-type interning and the subscription
/// table (`spec.md` §5: "global system lock ... guards registry + bus +
/// subscriptions + event-type table"). Handlers are never invoked while
/// this lock is held.
pub struct EventBus {
    inner: Mutex<Inner>,
    queue: PriorityQueue,
    quota: Arc<QuotaEnforcer>,
    pool: Arc<PoolAllocator>,
    monitor: Arc<HandlerMonitor>,
    tracker: Mutex<SubscriptionTracker>,
    max_payload_bytes: usize,
}

impl EventBus {
    pub fn new(
        max_event_types: usize,
        max_subscriptions: usize,
        queue_capacity: [usize; 4],
        max_payload_bytes: usize,
        quota: Arc<QuotaEnforcer>,
        pool: Arc<PoolAllocator>,
        monitor: Arc<HandlerMonitor>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                type_names: Vec::new(),
                type_by_name: HashMap::new(),
                subscriptions: HashMap::new(),
                max_event_types,
                max_subscriptions,
                subscription_count: 0,
            }),
            queue: PriorityQueue::new(queue_capacity),
            quota,
            pool,
            monitor,
            tracker: Mutex::new(SubscriptionTracker::new()),
            max_payload_bytes,
        }
    }

    /// Returns the existing id if `name` is already interned, otherwise
    /// allocates the next descriptor (`spec.md` §4.7).
    pub fn register_type(&self, name: &str) -> Result<EventTypeId> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.type_by_name.get(name) {
            return Ok(id);
        }
        if inner.type_names.len() >= inner.max_event_types {
            return Err(Error::EventTypeRegistryFull);
        }
        let id = EventTypeId(inner.type_names.len() as u16);
        inner.type_names.push(name.to_string());
        inner.type_by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn type_name(&self, id: EventTypeId) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .type_names
            .get(id.index())
            .cloned()
            .ok_or(Error::EventTypeNotFound)
    }

    fn type_exists(inner: &Inner, id: EventTypeId) -> bool {
        id.index() < inner.type_names.len()
    }

    /// Subscribes `principal` to `event_type`. Idempotent: re-subscribing
    /// the same principal to the same type returns success without
    /// creating a duplicate entry (`spec.md` §4.7 step 3).
    pub fn subscribe(
        &self,
        principal: PrincipalId,
        event_type: EventTypeId,
        handler: Handler,
    ) -> Result<()> {
        self.quota.check_subscription(principal)?;

        let mut inner = self.inner.lock().unwrap();
        if !Self::type_exists(&inner, event_type) {
            return Err(Error::EventTypeNotFound);
        }

        let subs = inner.subscriptions.entry(event_type).or_default();
        if subs.iter().any(|s| s.principal == principal) {
            return Ok(());
        }
        if inner.subscription_count >= inner.max_subscriptions {
            return Err(Error::SubscriptionFull);
        }

        inner
            .subscriptions
            .get_mut(&event_type)
            .unwrap()
            .push(Subscription { principal, handler });
        inner.subscription_count += 1;
        drop(inner);

        self.quota.record_subscription(principal, true);
        self.tracker.lock().unwrap().record(principal, event_type);
        Ok(())
    }

    pub fn unsubscribe(&self, principal: PrincipalId, event_type: EventTypeId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(subs) = inner.subscriptions.get_mut(&event_type) else {
            return Err(Error::SubscriptionNotFound);
        };
        let before = subs.len();
        subs.retain(|s| s.principal != principal);
        if subs.len() == before {
            return Err(Error::SubscriptionNotFound);
        }
        inner.subscription_count -= 1;
        drop(inner);

        self.quota.record_subscription(principal, false);
        self.tracker.lock().unwrap().remove(principal, event_type);
        Ok(())
    }

    /// Removes every subscription owned by `principal`, used during
    /// teardown (`spec.md` §4.9).
    pub fn unsubscribe_all(&self, principal: PrincipalId) {
        let types = self.tracker.lock().unwrap().unsubscribe_all(principal);
        let mut inner = self.inner.lock().unwrap();
        for event_type in types {
            if let Some(subs) = inner.subscriptions.get_mut(&event_type) {
                let before = subs.len();
                subs.retain(|s| s.principal != principal);
                if subs.len() < before {
                    inner.subscription_count -= 1;
                }
            }
            drop(inner);
            self.quota.record_subscription(principal, false);
            inner = self.inner.lock().unwrap();
        }
    }

    /// Copies `payload` into pool-backed storage, enqueues it, and records
    /// the post against `sender`'s quota (`spec.md` §4.7).
    pub fn post(
        &self,
        sender: PrincipalId,
        event_type: EventTypeId,
        payload: &[u8],
        priority: Priority,
    ) -> Result<u64> {
        self.quota.check_event_post(sender)?;
        if payload.len() > self.max_payload_bytes {
            return Err(Error::EventDataTooLarge);
        }
        self.quota.check_data_size(sender, payload.len())?;

        {
            let inner = self.inner.lock().unwrap();
            if !Self::type_exists(&inner, event_type) {
                return Err(Error::EventTypeNotFound);
            }
        }

        let mut allocation = self.pool.alloc(payload.len());
        allocation[..payload.len()].copy_from_slice(payload);
        self.quota.record_alloc(sender, payload.len());

        let queued = QueuedEvent {
            event_type,
            sender,
            priority,
            payload: allocation,
            sequence: 0,
            enqueued_at: Instant::now(),
        };

        match self.queue.post(queued) {
            Ok(seq) => {
                self.quota.record_event_post(sender);
                Ok(seq)
            }
            Err(e) => {
                self.quota.record_free(sender, payload.len());
                Err(e)
            }
        }
    }

    /// One iteration of the dispatch loop (`spec.md` §4.7): blocks for up
    /// to `timeout`, snapshots matching subscribers under the bus lock,
    /// releases it, then invokes each handler with no core lock held.
    /// Returns `false` if nothing was available within `timeout`.
    pub fn dispatch_once(&self, timeout: Duration) -> bool {
        let Some(event) = self.queue.receive(timeout) else {
            return false;
        };
        self.dispatch(event);
        true
    }

    /// Blocks indefinitely for the next event (used by the dedicated
    /// dispatcher thread).
    pub fn dispatch_blocking(&self) {
        let event = self.queue.receive_blocking();
        self.dispatch(event);
    }

    fn dispatch(&self, event: QueuedEvent) {
        let payload_len = event.payload.len();
        let handlers: Vec<(PrincipalId, Handler)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscriptions
                .get(&event.event_type)
                .map(|subs| subs.iter().map(|s| (s.principal, s.handler.clone())).collect())
                .unwrap_or_default()
        };

        let delivered = DeliveredEvent {
            event_type: event.event_type,
            sender: event.sender,
            priority: event.priority,
            payload: &event.payload,
            posted_at: event.enqueued_at,
        };

        for (principal, handler) in handlers {
            let (_, _outcome) = self.monitor.execute(principal, || handler(&delivered));
        }

        self.quota.record_free(event.sender, payload_len);
    }

    pub fn stats(&self) -> crate::priority_queue::QueueStats {
        self.queue.stats()
    }
}
