// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Four strict-priority FIFOs with per-class overflow policy.
//!
//! Grounded on `original_source/components/system/private/priority_queue.h`
//! for the contract shape (`post`/`receive`/stats) and on `spec.md` §4.2 for
//! the per-class overflow policy. The blocking `receive` uses a
//! `Condvar`, the userspace analog of how the teacher's kernel parks a task
//! in `SchedState::InRecv` until a message arrives (`sys/abi`).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use runtime_abi::{Error, EventTypeId, Priority, PrincipalId, Result};

use crate::memory_pool::Allocation;

/// A queued event. Payload ownership passes from sender to dispatcher; the
/// dispatcher frees it (by dropping the `Allocation`) after the last
/// handler returns.
pub struct QueuedEvent {
    pub event_type: EventTypeId,
    pub sender: PrincipalId,
    pub priority: Priority,
    pub payload: Allocation,
    pub sequence: u64,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub depth: [usize; 4],
    pub high_overflows: u64,
    pub normal_overflows: u64,
    pub low_drops: u64,
    pub total_queued: u64,
    pub total_processed: u64,
}

struct State {
    lanes: [VecDeque<QueuedEvent>; 4],
    capacities: [usize; 4],
    next_sequence: u64,
    stats: QueueStats,
}

/// Four bounded FIFOs, one per [`Priority`], drained in strict descending
/// order.
pub struct PriorityQueue {
    state: Mutex<State>,
    not_empty: Condvar,
}

impl PriorityQueue {
    pub fn new(capacities: [usize; 4]) -> Self {
        Self {
            state: Mutex::new(State {
                lanes: Default::default(),
                capacities,
                next_sequence: 0,
                stats: QueueStats::default(),
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues `event`, applying the overflow policy for its priority
    /// class (`spec.md` §4.2). On success, assigns and returns the
    /// monotonic sequence number.
    pub fn post(&self, mut event: QueuedEvent) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let idx = event.priority.as_index();
        let cap = state.capacities[idx];

        if state.lanes[idx].len() >= cap {
            match event.priority {
                Priority::Critical | Priority::High => {
                    state.stats.high_overflows += 1;
                    return Err(Error::EventQueueFull);
                }
                Priority::Normal => {
                    state.stats.normal_overflows += 1;
                    return Err(Error::EventQueueFull);
                }
                Priority::Low => {
                    if state.lanes[idx].pop_front().is_some() {
                        state.stats.low_drops += 1;
                    } else {
                        return Err(Error::EventQueueFull);
                    }
                }
            }
        }

        let seq = state.next_sequence;
        state.next_sequence += 1;
        event.sequence = seq;
        state.lanes[idx].push_back(event);
        state.stats.total_queued += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(seq)
    }

    /// Returns the first available event, polling lanes in strict
    /// descending priority order, blocking up to `timeout` if all lanes are
    /// empty. `None` means the wait elapsed with nothing to deliver.
    pub fn receive(&self, timeout: Duration) -> Option<QueuedEvent> {
        let mut state = self.state.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = Self::pop_highest(&mut state) {
                state.stats.total_processed += 1;
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timeout_result) =
                self.not_empty.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if timeout_result.timed_out() {
                // Loop back once more: a notification could have raced the
                // timeout; only return `None` if nothing is actually queued.
                if let Some(event) = Self::pop_highest(&mut state) {
                    state.stats.total_processed += 1;
                    return Some(event);
                }
                return None;
            }
        }
    }

    /// Blocks with no timeout (used by the dispatcher task per `spec.md`
    /// §4.7 step 1).
    pub fn receive_blocking(&self) -> QueuedEvent {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = Self::pop_highest(&mut state) {
                state.stats.total_processed += 1;
                return event;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    fn pop_highest(state: &mut State) -> Option<QueuedEvent> {
        for priority in Priority::ALL_DESCENDING {
            let idx = priority.as_index();
            if let Some(event) = state.lanes[idx].pop_front() {
                return Some(event);
            }
        }
        None
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(priority: Priority) -> QueuedEvent {
        // Use a pool-less allocator so the resulting `Allocation` is
        // heap-origin and doesn't outlive a temporary `PoolAllocator`.
        let empty_pools = crate::memory_pool::PoolAllocator::new(&[], &[]);
        QueuedEvent {
            event_type: EventTypeId(0),
            sender: PrincipalId(0),
            priority,
            payload: empty_pools.alloc(0),
            sequence: 0,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn drains_in_strict_priority_order() {
        let q = PriorityQueue::new([4, 4, 4, 4]);
        q.post(event(Priority::Low)).unwrap();
        q.post(event(Priority::High)).unwrap();
        q.post(event(Priority::Critical)).unwrap();
        q.post(event(Priority::Normal)).unwrap();

        assert_eq!(q.receive(Duration::ZERO).unwrap().priority, Priority::Critical);
        assert_eq!(q.receive(Duration::ZERO).unwrap().priority, Priority::High);
        assert_eq!(q.receive(Duration::ZERO).unwrap().priority, Priority::Normal);
        assert_eq!(q.receive(Duration::ZERO).unwrap().priority, Priority::Low);
    }

    #[test]
    fn fifo_within_a_priority_class() {
        let q = PriorityQueue::new([4, 4, 4, 4]);
        let first = q.post(event(Priority::Normal)).unwrap();
        let second = q.post(event(Priority::Normal)).unwrap();
        assert!(first < second);
        assert_eq!(q.receive(Duration::ZERO).unwrap().sequence, first);
        assert_eq!(q.receive(Duration::ZERO).unwrap().sequence, second);
    }

    #[test]
    fn high_priority_overflow_is_refused() {
        let q = PriorityQueue::new([1, 1, 1, 1]);
        q.post(event(Priority::High)).unwrap();
        let err = q.post(event(Priority::High)).unwrap_err();
        assert_eq!(err, Error::EventQueueFull);
        assert_eq!(q.stats().high_overflows, 1);
    }

    #[test]
    fn low_priority_overflow_evicts_oldest() {
        let q = PriorityQueue::new([1, 1, 1, 1]);
        let oldest = q.post(event(Priority::Low)).unwrap();
        let newest = q.post(event(Priority::Low)).unwrap();
        assert!(oldest < newest);
        assert_eq!(q.stats().low_drops, 1);
        let remaining = q.receive(Duration::ZERO).unwrap();
        assert_eq!(remaining.sequence, newest);
    }

    #[test]
    fn receive_times_out_when_empty() {
        let q = PriorityQueue::new([4, 4, 4, 4]);
        assert!(q.receive(Duration::from_millis(5)).is_none());
    }
}
