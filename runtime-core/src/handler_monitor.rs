// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handler execution timing, slow-handler warnings, and timeout detection.
//!
//! Grounded on `original_source/components/system/src/handler_monitor.c`:
//! wraps a handler invocation with a start/stop timing pair, accumulates
//! per-principal statistics, and logs when a run crosses the warn threshold
//! or the (optional) hard timeout. `spec.md` §3 requires these statistics be
//! "updated under the same mutex that guards the per-principal slot"; here
//! that's `HandlerMonitor`'s own lock, one entry per principal, taken for the
//! duration of the update only — never held across the handler call itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use counters::Count;
use runtime_abi::PrincipalId;

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerStats {
    pub execution_count: u64,
    pub total_time: Duration,
    pub max_time: Duration,
    pub timeout_count: u64,
}

impl HandlerStats {
    pub fn average_time(&self) -> Duration {
        if self.execution_count == 0 {
            Duration::ZERO
        } else {
            self.total_time / self.execution_count as u32
        }
    }
}

/// Outcome of a monitored handler run. Counted globally via `#[derive(Count)]`
/// (`SPEC_FULL.md` §B — a cross-principal event histogram complementing the
/// per-principal `HandlerStats` above) in addition to being returned to the
/// caller.
#[derive(Debug, Clone, Copy, Count)]
pub enum Outcome {
    /// The handler returned within the hard timeout (or none is configured).
    Completed(Duration),
    /// The handler's measured wall time exceeded the configured hard
    /// timeout. The handler already ran to completion; this runtime has no
    /// preemption mechanism to interrupt it mid-flight (`spec.md` §4.4 —
    /// hard timeout is detected, not enforced, for in-process handlers).
    TimedOut(Duration),
}

pub struct HandlerMonitor {
    stats: Mutex<HashMap<PrincipalId, HandlerStats>>,
    warn_threshold: Duration,
    hard_timeout: Option<Duration>,
    outcome_counts: OutcomeCounts,
}

impl HandlerMonitor {
    pub fn new(warn_threshold: Duration, hard_timeout: Option<Duration>) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            warn_threshold,
            hard_timeout,
            outcome_counts: Outcome::NEW_COUNTERS,
        }
    }

    /// Runs `f`, timing its execution and updating `id`'s statistics.
    pub fn execute<R>(&self, id: PrincipalId, f: impl FnOnce() -> R) -> (R, Outcome) {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        {
            let mut stats = self.stats.lock().unwrap();
            let entry = stats.entry(id).or_default();
            entry.execution_count += 1;
            entry.total_time += elapsed;
            if elapsed > entry.max_time {
                entry.max_time = elapsed;
            }
            if let Some(timeout) = self.hard_timeout {
                if elapsed > timeout {
                    entry.timeout_count += 1;
                }
            }
        }

        if elapsed > self.warn_threshold {
            log::warn!("slow handler: {id} ran for {elapsed:?} (threshold {:?})", self.warn_threshold);
        }

        let outcome = match self.hard_timeout {
            Some(timeout) if elapsed > timeout => {
                log::error!("handler timeout: {id} ran for {elapsed:?} (timeout {timeout:?})");
                Outcome::TimedOut(elapsed)
            }
            _ => Outcome::Completed(elapsed),
        };
        outcome.count(&self.outcome_counts);

        (result, outcome)
    }

    pub fn stats(&self, id: PrincipalId) -> HandlerStats {
        self.stats.lock().unwrap().get(&id).copied().unwrap_or_default()
    }

    /// Cross-principal completed/timed-out totals (`SPEC_FULL.md` §B), distinct
    /// from the per-principal breakdown in [`Self::stats`].
    pub fn outcome_counts(&self) -> &OutcomeCounts {
        &self.outcome_counts
    }

    pub fn remove(&self, id: PrincipalId) {
        self.stats.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn accumulates_execution_count_and_max_time() {
        let monitor = HandlerMonitor::new(Duration::from_secs(1), None);
        let p = PrincipalId(1);
        monitor.execute(p, || thread::sleep(Duration::from_millis(1)));
        monitor.execute(p, || thread::sleep(Duration::from_millis(2)));
        let stats = monitor.stats(p);
        assert_eq!(stats.execution_count, 2);
        assert!(stats.max_time >= Duration::from_millis(2));
        assert!(stats.average_time() > Duration::ZERO);
    }

    #[test]
    fn hard_timeout_is_recorded_and_reported() {
        let monitor = HandlerMonitor::new(Duration::from_secs(1), Some(Duration::from_millis(1)));
        let p = PrincipalId(1);
        let (_, outcome) = monitor.execute(p, || thread::sleep(Duration::from_millis(5)));
        assert!(matches!(outcome, Outcome::TimedOut(_)));
        assert_eq!(monitor.stats(p).timeout_count, 1);
    }

    #[test]
    fn no_hard_timeout_never_times_out() {
        let monitor = HandlerMonitor::new(Duration::from_nanos(1), None);
        let p = PrincipalId(1);
        let (_, outcome) = monitor.execute(p, || thread::sleep(Duration::from_millis(2)));
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert_eq!(monitor.stats(p).timeout_count, 0);
    }

    #[test]
    fn stats_are_isolated_per_principal() {
        let monitor = HandlerMonitor::new(Duration::from_secs(1), None);
        monitor.execute(PrincipalId(1), || ());
        monitor.execute(PrincipalId(1), || ());
        monitor.execute(PrincipalId(2), || ());
        assert_eq!(monitor.stats(PrincipalId(1)).execution_count, 2);
        assert_eq!(monitor.stats(PrincipalId(2)).execution_count, 1);
    }

    #[test]
    fn outcome_counts_are_tallied_across_principals() {
        use std::sync::atomic::Ordering;

        let monitor = HandlerMonitor::new(Duration::from_secs(1), Some(Duration::from_millis(1)));
        monitor.execute(PrincipalId(1), || ());
        monitor.execute(PrincipalId(2), || thread::sleep(Duration::from_millis(5)));

        let counts = monitor.outcome_counts();
        assert_eq!(counts.Completed.load(Ordering::Relaxed), 1);
        assert_eq!(counts.TimedOut.load(Ordering::Relaxed), 1);
    }
}
