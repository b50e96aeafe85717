// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static configuration for the runtime.
//!
//! The teacher configures each task at build time from `app.toml` via
//! `build-util`/`task-config`, which is inseparable from Hubris's
//! linker-driven image build. The equivalent here, for a library consumed by
//! a host program, is a plain `serde`-deserializable struct with sensible
//! defaults (`spec.md` §4.3: "Defaults come from static configuration").

use std::time::Duration;

/// Block sizes (bytes) offered by the memory pool allocator, smallest first.
pub const DEFAULT_POOL_BLOCK_SIZES: [usize; 4] = [64, 128, 256, 512];

/// Per-pool block counts, parallel to [`DEFAULT_POOL_BLOCK_SIZES`].
pub const DEFAULT_POOL_BLOCK_COUNTS: [usize; 4] = [64, 32, 16, 8];

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of registered principals (services + apps).
    pub max_services: usize,
    /// Maximum number of interned event types.
    pub max_event_types: usize,
    /// Maximum number of simultaneously active subscriptions.
    pub max_subscriptions: usize,
    /// Capacity of each priority queue's FIFO.
    pub queue_capacity: [usize; 4],
    /// Default per-principal quota, applied lazily on first use.
    pub default_quota: QuotaLimits,
    /// How often the quota enforcer's rate window resets.
    pub quota_window: Duration,
    /// Watchdog scan interval.
    pub watchdog_interval: Duration,
    /// Bound on mutex acquisition before a caller sees `Error::Timeout`
    /// (`spec.md` §5, "Cancellation & timeouts").
    pub lock_timeout: Duration,
    /// Threshold above which the handler monitor logs a "slow handler"
    /// warning.
    pub slow_handler_threshold: Duration,
    /// Hard per-handler timeout; `None` disables hard timeout enforcement.
    pub handler_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_services: 64,
            max_event_types: 128,
            max_subscriptions: 256,
            queue_capacity: [64, 64, 32, 16],
            default_quota: QuotaLimits::default(),
            quota_window: Duration::from_secs(1),
            watchdog_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(1),
            slow_handler_threshold: Duration::from_millis(10),
            handler_timeout: None,
        }
    }
}

/// Static per-principal limits, from the Quota Record in `spec.md` §3.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub max_events_per_window: u32,
    pub max_subscriptions: u32,
    pub max_payload_bytes: u32,
    pub max_resident_bytes: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_events_per_window: 100,
            max_subscriptions: 16,
            max_payload_bytes: 512,
            max_resident_bytes: 16 * 1024,
        }
    }
}
