// packages/engine/src/runtime/driver.rs
//! Driver threads
//!
//! A driver is one OS thread plus the list of units it owns. Each cycle it
//! steps every working unit once and drains every finished unit once;
//! fully drained units leave the list and go back to their owner.
//!
//! ```text
//!   broker ──hand_over──▶ incoming (mutex, splice only)
//!                            │
//!                            ▼
//!                     DriveList (driver thread only)
//!                     ├─ stepping:  step()  → Pending | terminal
//!                     └─ draining:  drain() → Pending | retire
//! ```
//!
//! The incoming mutex is held only to move entries across; `step` and
//! `drain` always run without any scheduler lock held.

use crate::observability::names;
use crate::runtime::context::RuntimeHandle;
use crate::runtime::handle::UnitSlot;
use crate::runtime::unit::{DriverId, Outcome, StepContext, Unit, UnitId};
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::any::Any;
use std::fmt::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Callback run on each new driver thread before it steps any unit
pub type DriverHook = Arc<dyn Fn(DriverId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stepping,
    Draining,
}

/// A unit together with its scheduling bookkeeping
pub(crate) struct Entry {
    unit: Box<dyn Unit>,
    slot: Arc<UnitSlot>,
    phase: Phase,
    draining_since: Option<Instant>,
    leak_reported: bool,
}

impl Entry {
    pub(crate) fn new(unit: Box<dyn Unit>, slot: Arc<UnitSlot>) -> Self {
        Self {
            unit,
            slot,
            phase: Phase::Stepping,
            draining_since: None,
            leak_reported: false,
        }
    }

    pub(crate) fn id(&self) -> UnitId {
        self.slot.id()
    }

    pub(crate) fn slot(&self) -> &Arc<UnitSlot> {
        &self.slot
    }

    /// Give up on scheduling this unit and hand it straight back
    pub(crate) fn reject(self) {
        self.slot.reject(self.unit);
    }
}

/// Counts and diagnostics published by the thread owning a [`DriveList`]
#[derive(Default)]
pub(crate) struct ListStats {
    processing: AtomicUsize,
    finished: AtomicUsize,
    assigned: AtomicU64,
    snapshot: Mutex<String>,
}

impl ListStats {
    pub(crate) fn count(&self) -> usize {
        self.processing.load(Ordering::Relaxed) + self.finished.load(Ordering::Relaxed)
    }

    pub(crate) fn record_assigned(&self) {
        self.assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> String {
        self.snapshot.lock().clone()
    }

    pub(crate) fn stats(&self, driver: Option<DriverId>, started: bool) -> DriverStats {
        DriverStats {
            id: driver.map(|d| d.0),
            started,
            assigned: self.assigned.load(Ordering::Relaxed),
            processing: self.processing.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
        }
    }
}

/// Per-driver statistics
#[derive(Debug, Clone, Serialize)]
pub struct DriverStats {
    /// Driver index, `None` for the broker's own list
    pub id: Option<usize>,

    /// Whether the driver thread has been started
    pub started: bool,

    /// Units dispatched to this list over its lifetime
    pub assigned: u64,

    /// Units currently stepping
    pub processing: usize,

    /// Units finished but not yet drained
    pub finished: usize,
}

impl DriverStats {
    pub fn count(&self) -> usize {
        self.processing + self.finished
    }
}

/// Ordered list of owned units and the step/drain cycle over it
pub(crate) struct DriveList {
    driver: Option<DriverId>,
    label: String,
    entries: Vec<Entry>,
    spare: Vec<Entry>,
    drain_warn: Duration,
    diag_interval: Duration,
    last_snapshot: Option<Instant>,
    published: (usize, usize),
}

impl DriveList {
    pub(crate) fn new(driver: Option<DriverId>, config: &RuntimeConfig) -> Self {
        let label = match driver {
            Some(id) => id.0.to_string(),
            None => "broker".to_string(),
        };

        Self {
            driver,
            label,
            entries: Vec::new(),
            spare: Vec::new(),
            drain_warn: config.drain_warn(),
            diag_interval: config.diag_interval(),
            last_snapshot: None,
            published: (usize::MAX, usize::MAX),
        }
    }

    pub(crate) fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Units currently stepping and units finished but not yet drained
    pub(crate) fn counts(&self) -> (usize, usize) {
        let processing = self
            .entries
            .iter()
            .filter(|e| e.phase == Phase::Stepping)
            .count();
        (processing, self.entries.len() - processing)
    }

    /// Run one cycle: step or drain every entry once
    ///
    /// Returns the number of units retired in this cycle.
    pub(crate) fn cycle(&mut self, runtime: &RuntimeHandle) -> usize {
        let mut current = std::mem::take(&mut self.entries);
        let mut kept = std::mem::take(&mut self.spare);
        kept.reserve(current.len());
        let mut retired = 0;

        for mut entry in current.drain(..) {
            let mut cx = StepContext::new(runtime, entry.id(), self.driver);

            match entry.phase {
                Phase::Stepping => {
                    let outcome = step_guarded(&mut entry, &mut cx);
                    if outcome.is_terminal() {
                        self.finish(&mut entry, outcome);
                    }
                    kept.push(entry);
                }
                Phase::Draining => {
                    if self.drain(&mut entry, &mut cx) {
                        entry.slot.retire(entry.unit);
                        metrics::counter!(names::UNITS_RETIRED).increment(1);
                        retired += 1;
                    } else {
                        kept.push(entry);
                    }
                }
            }
        }

        self.entries = kept;
        self.spare = current;
        retired
    }

    fn finish(&self, entry: &mut Entry, outcome: Outcome) {
        entry.slot.set_work(outcome);
        entry.phase = Phase::Draining;
        entry.draining_since = Some(Instant::now());

        if outcome == Outcome::Negative {
            metrics::counter!(names::UNITS_FAILED).increment(1);
        }
        debug!(
            "Unit {} ({}) finished {} after {} steps on {}",
            entry.id(),
            entry.unit.name(),
            outcome,
            entry.slot.steps(),
            self.label
        );
    }

    /// Drain once; true when the unit may be retired
    fn drain(&self, entry: &mut Entry, cx: &mut StepContext<'_>) -> bool {
        let id = entry.id();
        let result = panic::catch_unwind(AssertUnwindSafe(|| entry.unit.drain(cx)));

        match result {
            Ok(Outcome::Positive) => true,
            Ok(Outcome::Pending) => {
                self.check_leak(entry);
                false
            }
            Ok(Outcome::Negative) => {
                error!(
                    "Unit {} ({}) returned negative from drain, retiring anyway",
                    id,
                    entry.unit.name()
                );
                true
            }
            Err(payload) => {
                error!(
                    "Unit {} ({}) panicked in drain: {}",
                    id,
                    entry.unit.name(),
                    panic_message(&*payload)
                );
                true
            }
        }
    }

    fn check_leak(&self, entry: &mut Entry) {
        if entry.leak_reported {
            return;
        }
        let Some(since) = entry.draining_since else {
            return;
        };
        if since.elapsed() >= self.drain_warn {
            warn!(
                "Unit {} ({}) still draining after {:?}, possible leak",
                entry.id(),
                entry.unit.name(),
                since.elapsed()
            );
            entry.leak_reported = true;
        }
    }

    /// Publish counts, and the diagnostic snapshot when due
    pub(crate) fn publish(&mut self, stats: &ListStats, force: bool) {
        let counts = self.counts();
        if counts != self.published {
            stats.processing.store(counts.0, Ordering::Relaxed);
            stats.finished.store(counts.1, Ordering::Relaxed);
            metrics::gauge!(names::DRIVER_UNITS, "driver" => self.label.clone())
                .set((counts.0 + counts.1) as f64);
            self.published = counts;
        }

        let due = match self.last_snapshot {
            Some(at) => at.elapsed() >= self.diag_interval,
            None => true,
        };
        if force || due {
            *stats.snapshot.lock() = self.render();
            self.last_snapshot = Some(Instant::now());
        }
    }

    /// Render the owned units; only called on the owning thread
    ///
    /// A unit whose diagnostics panic gets a placeholder line; the panic
    /// never reaches the drive loop.
    fn render(&self) -> String {
        let mut out = String::new();

        for entry in &self.entries {
            let rendered = panic::catch_unwind(AssertUnwindSafe(|| render_entry(entry)));
            match rendered {
                Ok(block) => out.push_str(&block),
                Err(payload) => {
                    let _ = writeln!(
                        out,
                        "{} <describe panicked: {}>",
                        entry.id(),
                        panic_message(&*payload)
                    );
                }
            }
        }

        out
    }
}

fn render_entry(entry: &Entry) -> String {
    let mut out = String::new();
    let phase = match entry.phase {
        Phase::Stepping => "stepping",
        Phase::Draining => "draining",
    };
    let _ = writeln!(
        out,
        "{} {} [{}] steps={}",
        entry.id(),
        entry.unit.name(),
        phase,
        entry.slot.steps()
    );

    let mut detail = String::new();
    if entry.unit.describe(&mut detail).is_ok() {
        for line in detail.lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }
    out
}

fn step_guarded(entry: &mut Entry, cx: &mut StepContext<'_>) -> Outcome {
    entry.slot.record_step();
    let result = panic::catch_unwind(AssertUnwindSafe(|| entry.unit.step(cx)));

    match result {
        Ok(outcome) => outcome,
        Err(payload) => {
            error!(
                "Unit {} ({}) panicked in step: {}",
                entry.id(),
                entry.unit.name(),
                panic_message(&*payload)
            );
            Outcome::Negative
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Pause between cycles while units are owned
pub(crate) fn cycle_pause(pause: Duration) {
    if pause.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(pause);
    }
}

/// State shared between the broker and one driver thread
pub(crate) struct DriverShared {
    id: DriverId,
    incoming: Mutex<Vec<Entry>>,
    wake: Condvar,
    terminate: AtomicBool,
    stats: ListStats,
}

impl DriverShared {
    fn new(id: DriverId) -> Self {
        Self {
            id,
            incoming: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            terminate: AtomicBool::new(false),
            stats: ListStats::default(),
        }
    }

    pub(crate) fn id(&self) -> DriverId {
        self.id
    }

    pub(crate) fn stats(&self) -> &ListStats {
        &self.stats
    }

    fn splice_into(&self, list: &mut DriveList) {
        let mut incoming = self.incoming.lock();
        for entry in incoming.drain(..) {
            list.push(entry);
        }
    }
}

/// Handle on a running driver thread, owned by the broker
pub(crate) struct Driver {
    shared: Arc<DriverShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Driver {
    /// Start a driver thread
    pub(crate) fn start(
        id: DriverId,
        runtime: RuntimeHandle,
        config: &RuntimeConfig,
        hook: Option<DriverHook>,
    ) -> Result<Self> {
        let shared = Arc::new(DriverShared::new(id));
        let list = DriveList::new(Some(id), config);
        let pause = config.cycle_pause();
        let idle_wait = config.idle_wait();
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-driver-{}", config.thread_name, id.0))
            .spawn(move || {
                if let Some(hook) = hook {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(id))) {
                        error!(
                            "Driver hook panicked on {}: {}, stepping units anyway",
                            id,
                            panic_message(&*payload)
                        );
                    }
                }
                Driver::run_loop(thread_shared, runtime, list, pause, idle_wait);
            })
            .map_err(|e| EngineError::ThreadSpawn(format!("{}: {}", id, e)))?;

        metrics::counter!(names::DRIVERS_STARTED).increment(1);
        debug!("Started {}", id);

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<DriverShared> {
        &self.shared
    }

    /// Give a unit to this driver
    pub(crate) fn hand_over(&self, entry: Entry) {
        entry.slot().set_driver(self.shared.id);
        let mut incoming = self.shared.incoming.lock();
        incoming.push(entry);
        self.shared.stats.record_assigned();
        self.shared.wake.notify_one();
    }

    /// Ask the thread to exit once every owned unit has drained
    pub(crate) fn terminate(&self) {
        self.shared.terminate.store(true, Ordering::Release);
        let _incoming = self.shared.incoming.lock();
        self.shared.wake.notify_one();
    }

    /// Wait for the thread to exit
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} thread panicked", self.shared.id);
            }
        }
    }

    fn run_loop(
        shared: Arc<DriverShared>,
        runtime: RuntimeHandle,
        mut list: DriveList,
        pause: Duration,
        idle_wait: Duration,
    ) {
        trace!("{} entering drive loop", shared.id);

        loop {
            shared.splice_into(&mut list);

            if list.is_empty() {
                list.publish(&shared.stats, false);

                let mut incoming = shared.incoming.lock();
                if incoming.is_empty() {
                    if shared.terminate.load(Ordering::Acquire) {
                        break;
                    }
                    shared.wake.wait_for(&mut incoming, idle_wait);
                }
                continue;
            }

            list.cycle(&runtime);
            list.publish(&shared.stats, false);
            cycle_pause(pause);
        }

        list.publish(&shared.stats, true);
        debug!("{} stopped", shared.id);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.terminate();
        self.join();
    }
}
