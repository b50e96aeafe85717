// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness monitoring, bounded restart policy, and critical-service safe
//! mode.
//!
//! Grounded on the teacher's `task/jefe` (the supervisor that scans tasks
//! for faults and decides `Disposition::{Restart,Hold}`) and
//! `task-dogsitter` (the periodic feed loop), with the scan contract itself
//! — latch on timeout, unlatch on recovery, restart budget,
//! safe-mode-on-critical-failure — taken from
//! `original_source/.../service_watchdog.h`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ringbuf::{Entry, Ringbuf};

use runtime_abi::PrincipalId;

/// Depth of the retained scan-event history (`SPEC_FULL.md` §B.2 wants
/// "history", not just totals; this is a diagnostic window, not a
/// correctness bound).
const HISTORY_LEN: usize = 64;

/// One latch/restart/recovery event, recorded into a [`Ringbuf`] so an
/// operator can see *which* principals were involved in the most recent
/// scan activity, not just the scalar totals in [`WatchdogStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    Timeout(PrincipalId),
    Restart(PrincipalId),
    RestartFailed(PrincipalId),
    Exhausted(PrincipalId),
    SafeMode(PrincipalId),
    Recovered(PrincipalId),
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub timeout: Duration,
    pub auto_restart: bool,
    pub max_restarts: Option<u32>,
    pub critical: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            auto_restart: true,
            max_restarts: Some(3),
            critical: false,
        }
    }
}

struct Record {
    config: WatchdogConfig,
    last_heartbeat: Instant,
    latched: bool,
    restart_attempts: u32,
    enabled: bool,
}

/// Decision returned by a scan for a single latched record, telling the
/// caller (the runtime) what service-layer action to take. The watchdog
/// itself never performs the restart — `spec.md` §4.8: "restart
/// implementation itself lives in the service layer".
pub enum Disposition {
    /// Enter safe mode; this was a critical service.
    SafeMode,
    /// Ask the service layer to restart `id`.
    Restart,
    /// Budget exhausted or auto-restart disabled; log only.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchdogStats {
    pub total_timeouts: u64,
    pub total_restarts: u64,
    pub failed_restarts: u64,
    pub critical_failures: u64,
    pub safe_mode_active: bool,
}

pub struct Watchdog {
    records: Mutex<HashMap<PrincipalId, Record>>,
    stats: Mutex<WatchdogStats>,
    safe_mode: AtomicBool,
    history: Ringbuf<WatchdogEvent, HISTORY_LEN>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            stats: Mutex::new(WatchdogStats::default()),
            safe_mode: AtomicBool::new(false),
            history: Ringbuf::new(),
        }
    }

    pub fn register(&self, id: PrincipalId, config: WatchdogConfig) {
        self.records.lock().unwrap().insert(
            id,
            Record {
                config,
                last_heartbeat: Instant::now(),
                latched: false,
                restart_attempts: 0,
                enabled: true,
            },
        );
    }

    pub fn unregister(&self, id: PrincipalId) {
        self.records.lock().unwrap().remove(&id);
    }

    pub fn set_enabled(&self, id: PrincipalId, enabled: bool) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.enabled = enabled;
        }
    }

    pub fn heartbeat(&self, id: PrincipalId) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.last_heartbeat = Instant::now();
        }
    }

    pub fn reset_restart_attempts(&self, id: PrincipalId) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.restart_attempts = 0;
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WatchdogStats {
        let mut s = *self.stats.lock().unwrap();
        s.safe_mode_active = self.is_safe_mode();
        s
    }

    /// The most recent scan events, oldest first, consecutive duplicates
    /// coalesced (`spec.md` §B.2: retained history, not just totals).
    pub fn recent_events(&self) -> heapless::Vec<Entry<WatchdogEvent>, HISTORY_LEN> {
        self.history.snapshot()
    }

    /// One scan pass over all registered records (`spec.md` §4.8). Returns
    /// the set of `(principal, disposition)` pairs the caller should act
    /// on. Runs under the watchdog's own lock, acquired alone per the lock
    /// hierarchy in `spec.md` §5.
    pub fn scan(&self) -> Vec<(PrincipalId, Disposition)> {
        let now = Instant::now();
        let mut actions = Vec::new();
        let mut records = self.records.lock().unwrap();
        let mut stats = self.stats.lock().unwrap();

        for (&id, record) in records.iter_mut() {
            if !record.enabled {
                continue;
            }
            let elapsed = now.saturating_duration_since(record.last_heartbeat);

            if elapsed > record.config.timeout {
                if !record.latched {
                    record.latched = true;
                    stats.total_timeouts += 1;
                    self.history.record(WatchdogEvent::Timeout(id));

                    if record.config.critical {
                        stats.critical_failures += 1;
                        self.safe_mode.store(true, Ordering::SeqCst);
                        log::error!("{id} (critical) timed out: entering safe mode");
                        self.history.record(WatchdogEvent::SafeMode(id));
                        actions.push((id, Disposition::SafeMode));
                    } else if record.config.auto_restart
                        && record
                            .config
                            .max_restarts
                            .map(|m| record.restart_attempts < m)
                            .unwrap_or(true)
                    {
                        record.restart_attempts += 1;
                        stats.total_restarts += 1;
                        log::warn!("{id} timed out: restart attempt {}", record.restart_attempts);
                        self.history.record(WatchdogEvent::Restart(id));
                        actions.push((id, Disposition::Restart));
                    } else {
                        log::warn!("{id} timed out: no restart budget remaining");
                        self.history.record(WatchdogEvent::Exhausted(id));
                        actions.push((id, Disposition::Exhausted));
                    }
                }
            } else if record.latched {
                record.latched = false;
                record.restart_attempts = 0;
                log::info!("{id} recovered");
                self.history.record(WatchdogEvent::Recovered(id));
            }
        }

        actions
    }

    /// Records the outcome of a restart the caller attempted in response to
    /// [`Disposition::Restart`]. On success the latch clears, giving the
    /// principal a fresh chance to heartbeat before the next scan; the
    /// attempt budget itself is untouched. It is deliberately not reset
    /// here: a restart that "succeeds" (the re-init call returns `Ok`) but
    /// whose service still never heartbeats must still exhaust the budget
    /// after `max_restarts` cycles (`spec.md` §8 scenario 5). Only a real
    /// recovery — a heartbeat observed on a later scan — resets the
    /// counter, in [`Self::scan`]. On failure, `failed_restarts`
    /// increments and the record stays latched.
    pub fn report_restart_outcome(&self, id: PrincipalId, succeeded: bool) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(&id) {
            if succeeded {
                record.latched = false;
            } else {
                self.stats.lock().unwrap().failed_restarts += 1;
                self.history.record(WatchdogEvent::RestartFailed(id));
            }
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_timeout() -> WatchdogConfig {
        WatchdogConfig {
            timeout: Duration::from_millis(5),
            auto_restart: true,
            max_restarts: Some(2),
            critical: false,
        }
    }

    #[test]
    fn heartbeat_at_half_interval_never_flags() {
        let wd = Watchdog::new();
        let id = PrincipalId(1);
        wd.register(
            id,
            WatchdogConfig { timeout: Duration::from_millis(20), ..short_timeout() },
        );
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(10));
            wd.heartbeat(id);
            assert!(wd.scan().is_empty());
        }
    }

    #[test]
    fn restart_budget_is_exhausted_after_max_attempts() {
        let wd = Watchdog::new();
        let id = PrincipalId(1);
        wd.register(id, short_timeout());

        std::thread::sleep(Duration::from_millis(10));
        let actions = wd.scan();
        assert!(matches!(actions[0].1, Disposition::Restart));
        wd.report_restart_outcome(id, true);

        std::thread::sleep(Duration::from_millis(10));
        let actions = wd.scan();
        assert!(matches!(actions[0].1, Disposition::Restart));
        wd.report_restart_outcome(id, true);

        std::thread::sleep(Duration::from_millis(10));
        let actions = wd.scan();
        assert!(matches!(actions[0].1, Disposition::Exhausted));

        assert_eq!(wd.stats().total_restarts, 2);
    }

    #[test]
    fn critical_timeout_enters_safe_mode_without_restart() {
        let wd = Watchdog::new();
        let id = PrincipalId(1);
        wd.register(id, WatchdogConfig { critical: true, ..short_timeout() });
        std::thread::sleep(Duration::from_millis(10));
        let actions = wd.scan();
        assert!(matches!(actions[0].1, Disposition::SafeMode));
        assert!(wd.is_safe_mode());
        assert_eq!(wd.stats().total_restarts, 0);
    }

    #[test]
    fn recovery_unlatches_and_resets_restart_attempts() {
        let wd = Watchdog::new();
        let id = PrincipalId(1);
        wd.register(id, short_timeout());
        std::thread::sleep(Duration::from_millis(10));
        wd.scan();
        wd.heartbeat(id);
        assert!(wd.scan().is_empty());
    }

    #[test]
    fn disabled_record_is_never_scanned() {
        let wd = Watchdog::new();
        let id = PrincipalId(1);
        wd.register(id, short_timeout());
        wd.set_enabled(id, false);
        std::thread::sleep(Duration::from_millis(10));
        assert!(wd.scan().is_empty());
    }

    #[test]
    fn recent_events_records_timeout_and_restart() {
        let wd = Watchdog::new();
        let id = PrincipalId(1);
        wd.register(id, short_timeout());
        std::thread::sleep(Duration::from_millis(10));
        wd.scan();

        let events = wd.recent_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload, WatchdogEvent::Timeout(id));
        assert_eq!(events[1].payload, WatchdogEvent::Restart(id));
    }
}
