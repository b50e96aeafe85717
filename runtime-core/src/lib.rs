// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The service/event runtime core: a single owned [`Runtime`] value handed
//! out at [`Runtime::init`], with every public operation taking `&self` (or
//! `&Arc<Self>` where a background thread needs its own handle) rather than
//! reaching for ambient globals, so tests can instantiate independent
//! runtimes side by side (`spec.md` §9).

pub mod config;
pub mod dependency_graph;
pub mod event_bus;
pub mod handler_monitor;
pub mod memory_pool;
pub mod priority_queue;
pub mod quota;
pub mod registry;
pub mod subscription_tracker;
pub mod watchdog;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use runtime_abi::{Error, EventTypeId, Priority, PrincipalId, Result};

pub use config::{QuotaLimits, RuntimeConfig};
pub use dependency_graph::DependencyGraph;
pub use event_bus::{DeliveredEvent, EventBus, Handler};
pub use handler_monitor::{HandlerMonitor, HandlerStats, Outcome, OutcomeCounts};
pub use memory_pool::{AllocEvent, AllocEventCounts, PoolAllocator};
pub use priority_queue::QueueStats;
pub use quota::{QuotaEnforcer, QuotaUsage};
pub use registry::{ServiceInfo, ServiceRegistry, State};
pub use watchdog::{Disposition, Watchdog, WatchdogConfig, WatchdogEvent, WatchdogStats};

/// Callback invoked by the watchdog thread to ask the embedding program to
/// clean up and re-initialize a principal. `spec.md` §4.8: "restart
/// implementation itself lives in the service layer (out of scope here
/// beyond the contract)".
pub type RestartHandler = Box<dyn Fn(PrincipalId) -> Result<()> + Send + Sync>;

/// The composed runtime. Construction order in [`Runtime::init`] follows
/// `spec.md` §6: "memory pool -> priority queue -> quota -> dependencies ->
/// watchdog -> registry" (the priority queue lives inside [`EventBus`]).
pub struct Runtime {
    config: RuntimeConfig,
    registry: Mutex<ServiceRegistry>,
    deps: Mutex<DependencyGraph>,
    bus: Arc<EventBus>,
    quota: Arc<QuotaEnforcer>,
    pool: Arc<PoolAllocator>,
    monitor: Arc<HandlerMonitor>,
    watchdog: Arc<Watchdog>,
    restart_handler: Mutex<Option<RestartHandler>>,
    token: Mutex<Option<u64>>,
    stop_flag: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Performs all subsystem init and returns the runtime along with the
    /// run integrity token (`spec.md` §6, §9 — "not an access-control
    /// primitive", just a double-init guard for privileged calls).
    pub fn init(config: RuntimeConfig) -> Result<(Arc<Runtime>, u64)> {
        let pool = Arc::new(PoolAllocator::new(
            &config::DEFAULT_POOL_BLOCK_SIZES,
            &config::DEFAULT_POOL_BLOCK_COUNTS,
        ));
        let quota = Arc::new(QuotaEnforcer::new(config.default_quota));
        let monitor = Arc::new(HandlerMonitor::new(config.slow_handler_threshold, config.handler_timeout));
        let bus = Arc::new(EventBus::new(
            config.max_event_types,
            config.max_subscriptions,
            config.queue_capacity,
            config.default_quota.max_payload_bytes as usize,
            quota.clone(),
            pool.clone(),
            monitor.clone(),
        ));
        let deps = Mutex::new(DependencyGraph::new());
        let watchdog = Arc::new(Watchdog::new());
        let registry = Mutex::new(ServiceRegistry::new(config.max_services));

        let token: u64 = rand::random();
        log::info!("runtime initialized");

        Ok((
            Arc::new(Runtime {
                config,
                registry,
                deps,
                bus,
                quota,
                pool,
                monitor,
                watchdog,
                restart_handler: Mutex::new(None),
                token: Mutex::new(Some(token)),
                stop_flag: Arc::new(AtomicBool::new(false)),
                threads: Mutex::new(Vec::new()),
            }),
            token,
        ))
    }

    fn verify_token(&self, token: u64) -> Result<()> {
        match *self.token.lock().unwrap() {
            None => Err(Error::NotInitialized),
            Some(t) if t == token => Ok(()),
            Some(_) => Err(Error::InvalidSecureKey),
        }
    }

    /// Installs the callback the watchdog thread uses to request a
    /// restart. Not part of the privileged surface: any principal may
    /// install it before `start`.
    pub fn set_restart_handler(&self, handler: RestartHandler) {
        *self.restart_handler.lock().unwrap() = Some(handler);
    }

    /// Begins the dispatcher and watchdog background threads.
    pub fn start(self: &Arc<Self>, token: u64) -> Result<()> {
        self.verify_token(token)?;
        self.stop_flag.store(false, Ordering::SeqCst);

        let bus = self.bus.clone();
        let stop = self.stop_flag.clone();
        let dispatcher = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                bus.dispatch_once(Duration::from_millis(100));
            }
        });

        let rt = self.clone();
        let stop = self.stop_flag.clone();
        let interval = self.config.watchdog_interval;
        let watchdog_thread = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(interval);
                rt.run_watchdog_scan();
            }
        });

        let mut threads = self.threads.lock().unwrap();
        threads.push(dispatcher);
        threads.push(watchdog_thread);
        log::info!("runtime started");
        Ok(())
    }

    fn run_watchdog_scan(&self) {
        for (id, disposition) in self.watchdog.scan() {
            let mut registry = self.registry.lock().unwrap();
            let _ = registry.set_state(id, State::Error);
            drop(registry);

            match disposition {
                Disposition::SafeMode => {
                    log::error!("{id} forced the runtime into safe mode");
                }
                Disposition::Restart => {
                    let handler = self.restart_handler.lock().unwrap();
                    let outcome = match handler.as_ref() {
                        Some(f) => f(id).is_ok(),
                        None => false,
                    };
                    drop(handler);
                    self.watchdog.report_restart_outcome(id, outcome);
                    if outcome {
                        let _ = self.registry.lock().unwrap().set_state(id, State::Running);
                    }
                }
                Disposition::Exhausted => {}
            }
        }
    }

    /// Graceful shutdown: the dispatcher drains no further events, the
    /// watchdog stops scanning (`spec.md` §6).
    pub fn stop(&self, token: u64) -> Result<()> {
        self.verify_token(token)?;
        self.stop_flag.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
        log::info!("runtime stopped");
        Ok(())
    }

    /// Invalidates the integrity token. Subsystems themselves tear down
    /// when the last `Arc<Runtime>` is dropped.
    pub fn deinit(&self, token: u64) -> Result<()> {
        self.verify_token(token)?;
        *self.token.lock().unwrap() = None;
        log::info!("runtime deinitialized");
        Ok(())
    }

    // ---- Principal-facing API (spec.md §6) ----

    pub fn register(&self, name: &str, context: Box<dyn Any + Send + Sync>, critical: bool) -> Result<PrincipalId> {
        let id = self.registry.lock().unwrap().register(name, context, critical)?;
        self.deps.lock().unwrap().add_node(id);
        Ok(id)
    }

    pub fn unregister(&self, id: PrincipalId) -> Result<()> {
        self.bus.unsubscribe_all(id);
        self.quota.remove(id);
        self.monitor.remove(id);
        self.watchdog.unregister(id);
        self.deps.lock().unwrap().remove_node(id);
        self.registry.lock().unwrap().unregister(id)
    }

    /// Moving to [`State::Running`] is gated on the dependency graph
    /// reporting all of `id`'s dependencies initialized (`spec.md` §4.5,
    /// composition paragraph in §2).
    pub fn set_state(&self, id: PrincipalId, state: State) -> Result<()> {
        if state == State::Running {
            self.deps.lock().unwrap().check_ready(id)?;
        }
        self.registry.lock().unwrap().set_state(id, state)?;
        if state == State::Running {
            self.deps.lock().unwrap().mark_initialized(id);
        } else {
            self.deps.lock().unwrap().mark_uninitialized(id);
        }
        Ok(())
    }

    pub fn heartbeat(&self, id: PrincipalId) -> Result<()> {
        self.registry.lock().unwrap().heartbeat(id)?;
        self.watchdog.heartbeat(id);
        Ok(())
    }

    pub fn register_watchdog(&self, id: PrincipalId, config: WatchdogConfig) {
        self.watchdog.register(id, config);
    }

    pub fn add_dependency(&self, id: PrincipalId, depends_on: PrincipalId) -> Result<()> {
        self.deps.lock().unwrap().add_dependency(id, depends_on)
    }

    pub fn register_event_type(&self, name: &str) -> Result<EventTypeId> {
        self.bus.register_type(name)
    }

    /// Validates `id` is a registered principal before delegating to the
    /// bus (`spec.md` §4.7 subscribe step 2: "Validate principal is
    /// registered"). `EventBus` has no registry handle of its own, so this
    /// check lives here rather than in `EventBus::subscribe`.
    pub fn subscribe(&self, id: PrincipalId, event_type: EventTypeId, handler: Handler) -> Result<()> {
        self.registry.lock().unwrap().info(id)?;
        self.bus.subscribe(id, event_type, handler)
    }

    pub fn unsubscribe(&self, id: PrincipalId, event_type: EventTypeId) -> Result<()> {
        self.bus.unsubscribe(id, event_type)
    }

    /// Validates `id` is a registered principal before delegating to the
    /// bus (`spec.md` §4.7 post step 2: "Validate sender registered").
    pub fn post(&self, id: PrincipalId, event_type: EventTypeId, payload: &[u8], priority: Priority) -> Result<u64> {
        self.registry.lock().unwrap().info(id)?;
        self.bus.post(id, event_type, payload, priority)
    }

    pub fn list_all(&self) -> Vec<ServiceInfo> {
        self.registry.lock().unwrap().list_all()
    }

    pub fn info(&self, id: PrincipalId) -> Result<ServiceInfo> {
        self.registry.lock().unwrap().info(id)
    }

    pub fn lookup(&self, name: &str) -> Option<PrincipalId> {
        self.registry.lock().unwrap().lookup(name)
    }

    pub fn quota_usage(&self, id: PrincipalId) -> QuotaUsage {
        self.quota.usage(id)
    }

    pub fn set_quota_limits(&self, id: PrincipalId, limits: QuotaLimits) {
        self.quota.set_limits(id, limits)
    }

    pub fn handler_stats(&self, id: PrincipalId) -> HandlerStats {
        self.monitor.stats(id)
    }

    pub fn watchdog_stats(&self) -> WatchdogStats {
        self.watchdog.stats()
    }

    pub fn is_safe_mode(&self) -> bool {
        self.watchdog.is_safe_mode()
    }

    pub fn bus_stats(&self) -> QueueStats {
        self.bus.stats()
    }

    pub fn quota_tick(&self) {
        self.quota.tick();
    }

    /// Direct access to the watchdog, for callers that want to drive or
    /// inspect scans without going through the background thread started
    /// by [`Runtime::start`].
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn init() -> (Arc<Runtime>, u64) {
        Runtime::init(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn basic_post_receive_delivers_payload_once() {
        let (rt, _token) = init();
        let sensor = rt.register("sensor", Box::new(()), false).unwrap();
        let display = rt.register("display", Box::new(()), false).unwrap();
        let temp = rt.register_event_type("temp").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let received2 = received.clone();
        rt.subscribe(
            display,
            temp,
            Arc::new(move |e: &DeliveredEvent| {
                calls2.fetch_add(1, Ordering::SeqCst);
                *received2.lock().unwrap() = e.payload.to_vec();
            }),
        )
        .unwrap();

        rt.post(sensor, temp, &22.5f32.to_le_bytes(), Priority::Normal).unwrap();
        assert!(rt.bus.dispatch_once(Duration::from_millis(200)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*received.lock().unwrap(), 22.5f32.to_le_bytes());
    }

    #[test]
    fn registering_over_capacity_fails() {
        let mut config = RuntimeConfig::default();
        config.max_services = 1;
        let (rt, _token) = Runtime::init(config).unwrap();
        rt.register("a", Box::new(()), false).unwrap();
        assert_eq!(rt.register("b", Box::new(()), false), Err(Error::ServiceRegistryFull));
    }

    #[test]
    fn unregister_tears_down_subscriptions() {
        let (rt, _token) = init();
        let a = rt.register("a", Box::new(()), false).unwrap();
        let ty = rt.register_event_type("t").unwrap();
        rt.subscribe(a, ty, Arc::new(|_: &DeliveredEvent| {})).unwrap();
        rt.unregister(a).unwrap();
        assert_eq!(rt.unsubscribe(a, ty), Err(Error::SubscriptionNotFound));
    }

    #[test]
    fn running_requires_dependencies_initialized() {
        let (rt, _token) = init();
        let a = rt.register("a", Box::new(()), false).unwrap();
        let b = rt.register("b", Box::new(()), false).unwrap();
        rt.add_dependency(b, a).unwrap();

        assert_eq!(rt.set_state(b, State::Running), Err(Error::DependencyFailed));
        rt.set_state(a, State::Running).unwrap();
        rt.set_state(b, State::Running).unwrap();
    }

    #[test]
    fn circular_dependency_is_rejected() {
        let (rt, _token) = init();
        let a = rt.register("A", Box::new(()), false).unwrap();
        let b = rt.register("B", Box::new(()), false).unwrap();
        let c = rt.register("C", Box::new(()), false).unwrap();
        rt.add_dependency(b, a).unwrap();
        rt.add_dependency(c, b).unwrap();
        assert_eq!(rt.add_dependency(a, c), Err(Error::CircularDependency));
    }

    #[test]
    fn invalid_token_is_rejected_for_privileged_calls() {
        let (rt, token) = init();
        assert_eq!(rt.stop(token.wrapping_add(1)), Err(Error::InvalidSecureKey));
        rt.stop(token).unwrap();
    }

    #[test]
    fn start_and_stop_run_background_threads_cleanly() {
        let (rt, token) = init();
        rt.start(token).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        rt.stop(token).unwrap();
    }
}
