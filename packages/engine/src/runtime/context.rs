// packages/engine/src/runtime/context.rs
//! Runtime context: lifecycle, submission and diagnostics
//!
//! [`Runtime`] owns the broker thread and the process-wide state every
//! component shares (queue, driver registry, teardown callbacks). It is
//! created once with [`Runtime::init`] before any submission and torn down
//! once with [`Runtime::shutdown`] after all drivers have drained.
//! [`RuntimeHandle`] is the cheap, cloneable submission side.

use crate::observability::names;
use crate::runtime::broker::Broker;
use crate::runtime::driver::{DriverHook, DriverShared, DriverStats, Entry, ListStats};
use crate::runtime::handle::{UnitHandle, UnitSlot};
use crate::runtime::queue::{submission_queue, PoolRequest, QueueSender, QueueStats, Request};
use crate::runtime::shared::TeardownRegistry;
use crate::runtime::unit::{DriverId, Unit, UnitId};
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, trace};

/// Configuration that may change only until the first submission
#[derive(Clone)]
pub(crate) struct Settings {
    pub workers: usize,
    pub hook: Option<DriverHook>,
    frozen: bool,
}

/// State shared by every handle, the broker and the drivers
pub(crate) struct Shared {
    config: RuntimeConfig,
    queue: QueueSender,
    closed: RwLock<bool>,
    next_id: AtomicU64,
    settings: Mutex<Settings>,
    frozen: AtomicBool,
    drivers: RwLock<Vec<Option<Arc<DriverShared>>>>,
    broker_stats: ListStats,
    teardown: TeardownRegistry,
    submitted: AtomicU64,
    dispatched: AtomicU64,
}

impl Shared {
    /// Freeze settings and return the snapshot the broker works with
    pub(crate) fn frozen_settings(&self) -> Settings {
        let mut settings = self.settings.lock();
        settings.frozen = true;
        self.frozen.store(true, Ordering::Release);
        settings.clone()
    }

    pub(crate) fn init_driver_slots(&self, workers: usize) {
        let mut drivers = self.drivers.write();
        drivers.clear();
        drivers.resize_with(workers, || None);
    }

    pub(crate) fn register_driver(&self, index: usize, driver: Arc<DriverShared>) {
        let mut drivers = self.drivers.write();
        if index < drivers.len() {
            drivers[index] = Some(driver);
        }
    }

    pub(crate) fn broker_stats(&self) -> &ListStats {
        &self.broker_stats
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn freeze(&self) {
        if !self.frozen.load(Ordering::Acquire) {
            self.frozen_settings();
        }
    }
}

/// Cloneable handle for submitting units and inspecting the runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<Shared>,
}

impl RuntimeHandle {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Submit a unit with no driver preference
    pub fn submit<U: Unit>(&self, unit: U) -> Result<UnitHandle<U>> {
        self.enqueue(unit, None)
    }

    /// Submit a unit that must run on `driver` for its whole lifetime
    ///
    /// Ids outside the configured range are clamped to the last driver.
    pub fn submit_to<U: Unit>(&self, unit: U, driver: DriverId) -> Result<UnitHandle<U>> {
        self.enqueue(unit, Some(driver))
    }

    fn enqueue<U: Unit>(&self, unit: U, desired: Option<DriverId>) -> Result<UnitHandle<U>> {
        let closed = self.shared.closed.read();
        if *closed {
            return Err(EngineError::ShutDown);
        }

        self.shared.freeze();

        let id = UnitId::from_raw(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(UnitSlot::new(id));
        let entry = Entry::new(Box::new(unit), slot.clone());

        self.shared
            .queue
            .push(Request::Submit(PoolRequest { entry, desired }))?;
        drop(closed);

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::UNITS_SUBMITTED).increment(1);
        trace!("Unit {} submitted", id);

        Ok(UnitHandle::new(slot))
    }

    /// Register a callback run once when the runtime shuts down
    pub fn register_teardown<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.teardown.register(name, f);
    }

    /// Number of drivers the broker will use
    pub fn worker_count(&self) -> usize {
        self.shared.settings.lock().workers
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.read()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> RuntimeStats {
        let drivers = self
            .shared
            .drivers
            .read()
            .iter()
            .enumerate()
            .map(|(index, driver)| match driver {
                Some(driver) => driver.stats().stats(Some(driver.id()), true),
                None => DriverStats {
                    id: Some(index),
                    started: false,
                    assigned: 0,
                    processing: 0,
                    finished: 0,
                },
            })
            .collect();

        RuntimeStats {
            workers: self.worker_count(),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            drivers,
            broker: self.shared.broker_stats.stats(None, true),
            queue: self.shared.queue.stats(),
        }
    }

    /// Diagnostic tree of drivers and the units they own
    ///
    /// Unit lines come from snapshots taken by the owning thread, so they
    /// may lag by up to the configured diagnostic interval.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let stats = self.stats();

        let _ = writeln!(
            out,
            "runtime workers={} submitted={} dispatched={} queued={}",
            stats.workers, stats.submitted, stats.dispatched, stats.queue.current_size
        );

        let _ = writeln!(
            out,
            "broker processing={} finished={}",
            stats.broker.processing, stats.broker.finished
        );
        indent(&mut out, &self.shared.broker_stats.snapshot());

        for driver in self.shared.drivers.read().iter().flatten() {
            let s = driver.stats().stats(Some(driver.id()), true);
            let _ = writeln!(
                out,
                "{} processing={} finished={} assigned={}",
                driver.id(),
                s.processing,
                s.finished,
                s.assigned
            );
            indent(&mut out, &driver.stats().snapshot());
        }

        out
    }
}

fn indent(out: &mut String, block: &str) {
    for line in block.lines() {
        let _ = writeln!(out, "  {}", line);
    }
}

/// Runtime-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub workers: usize,
    pub submitted: u64,
    pub dispatched: u64,
    pub drivers: Vec<DriverStats>,
    pub broker: DriverStats,
    pub queue: QueueStats,
}

impl RuntimeStats {
    /// Units currently owned by drivers or the broker
    pub fn active(&self) -> usize {
        self.broker.count() + self.drivers.iter().map(DriverStats::count).sum::<usize>()
    }
}

/// The scheduling runtime: broker thread plus lazily started drivers
pub struct Runtime {
    handle: RuntimeHandle,
    broker: Option<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Start the broker thread
    pub fn init(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = submission_queue();
        let shared = Arc::new(Shared {
            queue: sender,
            closed: RwLock::new(false),
            next_id: AtomicU64::new(1),
            settings: Mutex::new(Settings {
                workers: config.workers,
                hook: None,
                frozen: false,
            }),
            frozen: AtomicBool::new(false),
            drivers: RwLock::new(Vec::new()),
            broker_stats: ListStats::default(),
            teardown: TeardownRegistry::new(),
            submitted: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            config: config.clone(),
        });
        let handle = RuntimeHandle { shared };

        let broker = Broker::new(handle.clone(), receiver, config.clone());
        let thread = thread::Builder::new()
            .name(format!("{}-broker", config.thread_name))
            .spawn(move || broker.run())
            .map_err(|e| EngineError::ThreadSpawn(format!("broker: {}", e)))?;

        info!("Runtime initialized with {} workers", config.workers);

        Ok(Self {
            handle,
            broker: Some(thread),
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Set how many drivers may exist; only before the first submission
    pub fn set_worker_count(&self, workers: usize) -> Result<()> {
        let max = self.handle.shared.config.max_workers;
        if workers > max {
            return Err(EngineError::invalid_config(format!(
                "workers ({}) exceeds max_workers ({})",
                workers, max
            )));
        }

        let mut settings = self.handle.shared.settings.lock();
        if settings.frozen {
            return Err(EngineError::ConfigFrozen);
        }
        settings.workers = workers;
        debug!("Worker count set to {}", workers);
        Ok(())
    }

    /// Set a callback run on each new driver thread before it steps units
    pub fn set_driver_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(DriverId) + Send + Sync + 'static,
    {
        let mut settings = self.handle.shared.settings.lock();
        if settings.frozen {
            return Err(EngineError::ConfigFrozen);
        }
        settings.hook = Some(Arc::new(hook));
        Ok(())
    }

    pub fn submit<U: Unit>(&self, unit: U) -> Result<UnitHandle<U>> {
        self.handle.submit(unit)
    }

    pub fn submit_to<U: Unit>(&self, unit: U, driver: DriverId) -> Result<UnitHandle<U>> {
        self.handle.submit_to(unit, driver)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.handle.stats()
    }

    pub fn describe(&self) -> String {
        self.handle.describe()
    }

    /// Stop accepting work, drain every unit, join all threads, run teardown
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(broker) = self.broker.take() else {
            return;
        };

        info!("Runtime shutting down");
        {
            let mut closed = self.handle.shared.closed.write();
            *closed = true;
            if self.handle.shared.queue.push(Request::Shutdown).is_err() {
                debug!("Broker already gone");
            }
        }

        if broker.join().is_err() {
            tracing::error!("Broker thread panicked");
        }

        self.handle.shared.teardown.run_all();
        info!("Runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
