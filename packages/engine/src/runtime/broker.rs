// packages/engine/src/runtime/broker.rs
//! Broker: routes submitted units to drivers
//!
//! The broker thread is the only consumer of the submission queue. For each
//! request it picks a driver and hands the unit over:
//!
//! ```text
//!   submit() ──▶ queue ──▶ Broker ──┬─▶ driver-0   (round-robin, or
//!   submit() ──▶   │                ├─▶ driver-1    desired driver,
//!   spawn()  ──▶   │                └─▶ driver-N    clamped to range)
//!                  │
//!                  └─ workers == 0 ──▶ broker's own list
//! ```
//!
//! Drivers are started lazily the first time their index is chosen. The
//! round-robin cursor only moves on undirected submissions and ignores
//! driver load; steps are short, so even spreading is enough.

use crate::observability::names;
use crate::runtime::context::{RuntimeHandle, Settings};
use crate::runtime::driver::{cycle_pause, DriveList, Driver, Entry};
use crate::runtime::queue::{PoolRequest, QueueReceiver, Request};
use crate::runtime::unit::DriverId;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on requests taken per loop iteration while units are stepping locally
const DISPATCH_BATCH: usize = 256;

/// Where a request goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Broker's own list (no drivers configured)
    Local,
    /// Driver index, and whether the desired id had to be clamped
    Driver { index: usize, clamped: bool },
}

/// Driver selection: round-robin with affinity and clamping
#[derive(Debug, Clone)]
pub(crate) struct Router {
    workers: usize,
    cursor: usize,
}

impl Router {
    pub(crate) fn new(workers: usize) -> Self {
        Self { workers, cursor: 0 }
    }

    pub(crate) fn route(&mut self, desired: Option<DriverId>) -> Route {
        if self.workers == 0 {
            return Route::Local;
        }

        match desired {
            Some(DriverId(index)) if index < self.workers => Route::Driver {
                index,
                clamped: false,
            },
            Some(_) => Route::Driver {
                index: self.workers - 1,
                clamped: true,
            },
            None => {
                let index = self.cursor;
                self.cursor = (self.cursor + 1) % self.workers;
                Route::Driver {
                    index,
                    clamped: false,
                }
            }
        }
    }
}

/// Broker loop state, owned by the broker thread
pub(crate) struct Broker {
    runtime: RuntimeHandle,
    queue: QueueReceiver,
    config: RuntimeConfig,
    settings: Option<Settings>,
    router: Router,
    drivers: Vec<Option<Driver>>,
    local: DriveList,
    shutting_down: bool,
}

impl Broker {
    pub(crate) fn new(runtime: RuntimeHandle, queue: QueueReceiver, config: RuntimeConfig) -> Self {
        let local = DriveList::new(None, &config);

        Self {
            runtime,
            queue,
            config,
            settings: None,
            router: Router::new(0),
            drivers: Vec::new(),
            local,
            shutting_down: false,
        }
    }

    /// Broker thread main loop
    pub(crate) fn run(mut self) {
        info!("Broker started");

        loop {
            let first = if self.local.is_empty() {
                self.queue.pop_timeout(self.config.broker_poll())
            } else {
                self.queue.try_pop()
            };

            if let Some(request) = first {
                self.handle(request);

                let mut taken = 1;
                while taken < DISPATCH_BATCH || self.local.is_empty() {
                    match self.queue.try_pop() {
                        Some(request) => self.handle(request),
                        None => break,
                    }
                    taken += 1;
                }
            }

            self.drive_local();

            if self.shutting_down && self.queue.is_empty() {
                break;
            }
        }

        self.stop_drivers();

        while !self.local.is_empty() {
            self.drive_local();
        }
        self.local
            .publish(self.runtime.shared().broker_stats(), true);

        info!("Broker stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Submit(req) => self.dispatch(req),
            Request::Shutdown => {
                debug!("Broker received shutdown");
                self.shutting_down = true;
            }
        }
    }

    fn drive_local(&mut self) {
        let stats = self.runtime.shared().broker_stats();

        if self.local.is_empty() {
            self.local.publish(stats, false);
            return;
        }

        self.local.cycle(&self.runtime);
        self.local.publish(stats, false);
        cycle_pause(self.config.cycle_pause());
    }

    /// Snapshot worker count and hook on the first request
    fn settings(&mut self) -> &Settings {
        if self.settings.is_none() {
            let settings = self.runtime.shared().frozen_settings();
            debug!("Broker using {} workers", settings.workers);

            self.router = Router::new(settings.workers);
            self.drivers = (0..settings.workers).map(|_| None).collect();
            self.runtime.shared().init_driver_slots(settings.workers);
            self.settings = Some(settings);
        }

        match &self.settings {
            Some(settings) => settings,
            None => unreachable!("settings initialized above"),
        }
    }

    fn dispatch(&mut self, req: PoolRequest) {
        let PoolRequest { entry, desired } = req;
        self.settings();
        self.runtime.shared().record_dispatched();

        match self.router.route(desired) {
            Route::Local => {
                if let Some(desired) = desired {
                    debug!(
                        "No drivers configured, running unit {} on broker instead of {}",
                        entry.id(),
                        desired
                    );
                }
                trace!("Unit {} added to broker list", entry.id());
                self.runtime.shared().broker_stats().record_assigned();
                metrics::counter!(names::UNITS_DISPATCHED, "driver" => "broker").increment(1);
                self.local.push(entry);
            }
            Route::Driver { index, clamped } => {
                if clamped {
                    warn!(
                        "Desired driver {} out of range for unit {}, using driver {}",
                        desired.map(|d| d.0).unwrap_or_default(),
                        entry.id(),
                        index
                    );
                    metrics::counter!(names::AFFINITY_CLAMPED).increment(1);
                }

                match self.driver(index) {
                    Ok(driver) => {
                        trace!("Unit {} handed to driver {}", entry.id(), index);
                        driver.hand_over(entry);
                        metrics::counter!(names::UNITS_DISPATCHED, "driver" => index.to_string())
                            .increment(1);
                    }
                    Err(e) => {
                        error!("Could not start driver {}: {}, rejecting unit {}", index, e, entry.id());
                        entry.reject();
                    }
                }
            }
        }
    }

    /// Driver at `index`, starting its thread on first use
    fn driver(&mut self, index: usize) -> Result<&Driver> {
        if self.drivers[index].is_none() {
            let hook = self.settings().hook.clone();
            let driver = Driver::start(DriverId(index), self.runtime.clone(), &self.config, hook)?;
            self.runtime
                .shared()
                .register_driver(index, driver.shared().clone());
            self.drivers[index] = Some(driver);
        }

        self.drivers[index]
            .as_ref()
            .ok_or_else(|| EngineError::ThreadSpawn(format!("driver {} missing", index)))
    }

    fn stop_drivers(&mut self) {
        let started: Vec<&mut Driver> = self.drivers.iter_mut().flatten().collect();
        debug!("Stopping {} drivers", started.len());

        for driver in &started {
            driver.terminate();
        }
        for driver in started {
            driver.join();
        }
    }
}
