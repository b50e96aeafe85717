// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// A principal's slot id in the service registry.
///
/// Stable for the lifetime of the registration; reused after `unregister`.
/// Analogous to a Hubris `TaskId`'s index half, but without a generation
/// counter: this runtime does not need to distinguish a stale handle from a
/// freed-and-reused slot the way cross-address-space IPC does, because a
/// principal only ever interacts with the registry through calls that
/// re-validate occupancy on every use.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PrincipalId(pub u16);

impl PrincipalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "principal#{}", self.0)
    }
}

/// An interned event-type id. Stable for the run; never recycled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventTypeId(pub u16);

impl EventTypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "event-type#{}", self.0)
    }
}
