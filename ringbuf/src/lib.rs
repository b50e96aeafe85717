// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-capacity, de-duplicating history buffer.
//!
//! Adapted from Hubris's `lib/ringbuf`, which records diagnostic entries for
//! later inspection by an external debugger (Humility, GDB). This crate
//! drops the macro-generated-static and debugger-inspection machinery — this
//! is a hosted crate observed by its own process, not firmware inspected
//! over a debug probe — but keeps the core idea: a small bounded history of
//! the most recent entries, with consecutive duplicates coalesced into a
//! repeat count so that a long run of identical entries doesn't crowd out
//! older, more interesting history.
//!
//! Used by `runtime-core` to retain watchdog-latch history, quota-violation
//! history, and slow-handler history: exactly the kind of "what happened
//! recently" diagnostic data a single log line would lose.
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
use std::sync::Mutex;

#[cfg(not(feature = "std"))]
use spin::Mutex;

/// One entry in a [`Ringbuf`]: a payload plus how many consecutive times it
/// was recorded in a row.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Entry<T> {
    pub payload: T,
    pub count: u32,
}

struct Inner<T, const N: usize> {
    buf: [Option<Entry<T>>; N],
    /// Index of the most recently written slot, or `None` if empty.
    head: Option<usize>,
}

impl<T: Copy, const N: usize> Inner<T, N> {
    const fn new() -> Self {
        Self {
            buf: [None; N],
            head: None,
        }
    }
}

/// A bounded, de-duplicating history of `T`, guarded by a mutex.
///
/// `T` must be `Copy` (matching the teacher's constraint: ring buffer
/// entries are cheap, fixed-size diagnostic payloads, never heap data) and
/// `PartialEq` so consecutive duplicates can be coalesced.
pub struct Ringbuf<T, const N: usize> {
    inner: Mutex<Inner<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Records `payload`. If it equals the most recently recorded payload,
    /// increments that entry's count instead of consuming a new slot.
    pub fn record(&self, payload: T) {
        #[cfg(feature = "std")]
        let mut inner = self.inner.lock().unwrap();
        #[cfg(not(feature = "std"))]
        let mut inner = self.inner.lock();

        if let Some(head) = inner.head {
            if let Some(entry) = &mut inner.buf[head] {
                if entry.payload == payload {
                    entry.count += 1;
                    return;
                }
            }
        }

        let next = match inner.head {
            Some(h) => (h + 1) % N,
            None => 0,
        };
        inner.buf[next] = Some(Entry { payload, count: 1 });
        inner.head = Some(next);
    }

    /// Returns up to `N` most recent entries, oldest first.
    pub fn snapshot(&self) -> heapless::Vec<Entry<T>, N>
    where
        T: 'static,
    {
        #[cfg(feature = "std")]
        let inner = self.inner.lock().unwrap();
        #[cfg(not(feature = "std"))]
        let inner = self.inner.lock();

        let mut out = heapless::Vec::new();
        if let Some(head) = inner.head {
            for offset in 0..N {
                let idx = (head + 1 + offset) % N;
                if let Some(entry) = inner.buf[idx] {
                    let _ = out.push(entry);
                }
            }
        }
        out
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
