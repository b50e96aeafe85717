// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! "Store a histogram of events in a handful of atomics with one weird
//! trick." Adapted from Hubris's `lib/counters`: the [`Count`] trait defines
//! a countable event, usually derived for a plain enum with
//! `#[derive(Count)]`. Unlike the teacher's version, which targets
//! `#![no_std]` firmware and backs counters with plain integers bumped
//! under a single static (safe only because the teacher's tasks are not
//! preempted mid-instruction), this crate runs inside real OS threads, so
//! the generated counter storage uses `core::sync::atomic` directly.
#![no_std]

pub use counters_derive::Count;

/// A countable event, usually one variant of an enum.
///
/// Typically derived with `#[derive(Count)]`: the derive generates a
/// companion `Counters` struct with one atomic counter per variant, an
/// all-zero `NEW_COUNTERS` constant, and a `count` method that bumps the
/// right atomic.
pub trait Count {
    /// Storage for one counter per variant of `Self`.
    type Counters;

    /// All-zero initializer for [`Self::Counters`].
    const NEW_COUNTERS: Self::Counters;

    /// Increment the counter corresponding to this event.
    fn count(&self, counters: &Self::Counters);
}
