// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI for the service/event runtime core.
//!
//! This crate holds the types that every other crate in the workspace needs
//! to agree on: principal and event-type identifiers, event priority, and
//! the public error taxonomy. It has no logic of its own, mirroring the role
//! `sys/abi` plays for the rest of a Hubris image.

mod error;
mod ids;
mod priority;

pub use error::Error;
pub use ids::{EventTypeId, PrincipalId};
pub use priority::Priority;

/// Result alias used throughout the runtime crates.
pub type Result<T> = core::result::Result<T, Error>;

/// Version of the [`HostApiTable`](crate::HostApiTable) layout.
///
/// The table is append-only: a loaded image declares the minimum version it
/// requires, and the host refuses to start it if its own version is lower.
pub type HostApiVersion = u32;

/// Maximum length, in bytes, of a principal or event-type name.
///
/// Matches the "bounded length" language of the data model (`spec.md` §3);
/// kept small and fixed so the registry and event-type table can live in
/// fixed-capacity storage, the way the teacher's task table does.
pub const MAX_NAME_LEN: usize = 32;
