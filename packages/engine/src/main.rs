// packages/engine/src/main.rs
//! Cadence Engine demo
//!
//! Boots a runtime from `cadence.toml` (or defaults), runs a few fan-out
//! workloads that spawn children with and without driver affinity, then
//! prints the runtime state and metrics before shutting down.

use anyhow::{bail, Result};
use cadence_engine::observability::{init_metrics, init_tracing};
use cadence_engine::runtime::{Delay, FnUnit};
use cadence_engine::{
    DriverId, EngineConfig, EngineError, Outcome, Runtime, StepContext, Unit, UnitHandle, GIT_HASH,
    VERSION,
};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const PARENTS: usize = 3;
const CHILDREN: usize = 6;
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanoutState {
    Spawn,
    Collect,
    Done,
}

enum Child {
    Delay(UnitHandle<Delay>),
    Counter(UnitHandle<FnUnit>),
}

impl Child {
    fn is_retired(&self) -> bool {
        match self {
            Child::Delay(h) => h.is_retired(),
            Child::Counter(h) => h.is_retired(),
        }
    }

    fn succeeded(&self) -> bool {
        let outcome = match self {
            Child::Delay(h) => h.outcome(),
            Child::Counter(h) => h.outcome(),
        };
        outcome == Outcome::Positive
    }

    /// Returns true once the unit is back with us
    fn reclaim(&mut self) -> Result<bool, EngineError> {
        let back = match self {
            Child::Delay(h) => h.reclaim()?.is_some(),
            Child::Counter(h) => h.reclaim()?.is_some(),
        };
        Ok(back)
    }
}

/// Parent unit spawning a batch of children and collecting them back
struct Fanout {
    index: usize,
    state: FanoutState,
    children: Vec<Child>,
    collected: usize,
    failed: usize,
}

impl Fanout {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: FanoutState::Spawn,
            children: Vec::with_capacity(CHILDREN),
            collected: 0,
            failed: 0,
        }
    }

    fn spawn_children(&mut self, cx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let workers = cx.runtime().worker_count();

        for i in 0..CHILDREN {
            let child = match i % 3 {
                0 => Child::Delay(cx.spawn(Delay::new(Duration::from_millis(5 + 3 * i as u64)))?),
                1 => Child::Delay(cx.spawn_local(Delay::new(Duration::from_millis(10)))?),
                _ => {
                    let mut left = 10 * (i + 1);
                    let counter = FnUnit::new(format!("counter-{}-{}", self.index, i), move |_| {
                        if left == 0 {
                            return Outcome::Positive;
                        }
                        left -= 1;
                        Outcome::Pending
                    });
                    // Out-of-range ids are clamped by the broker
                    let target = DriverId(workers + i);
                    Child::Counter(cx.spawn_on(counter, target)?)
                }
            };
            self.children.push(child);
        }
        Ok(())
    }

    fn collect(&mut self) -> Result<(), EngineError> {
        let mut i = 0;
        while i < self.children.len() {
            if !self.children[i].is_retired() {
                i += 1;
                continue;
            }
            let mut child = self.children.swap_remove(i);
            if !child.succeeded() {
                self.failed += 1;
            }
            if child.reclaim()? {
                self.collected += 1;
            }
        }
        Ok(())
    }
}

impl Unit for Fanout {
    fn name(&self) -> &str {
        "fanout"
    }

    fn step(&mut self, cx: &mut StepContext<'_>) -> Outcome {
        match self.state {
            FanoutState::Spawn => {
                if let Err(e) = self.spawn_children(cx) {
                    warn!("Fanout {} could not spawn children: {}", self.index, e);
                    return Outcome::Negative;
                }
                debug!("Fanout {} spawned {} children", self.index, self.children.len());
                self.state = FanoutState::Collect;
                Outcome::Pending
            }
            FanoutState::Collect => {
                if let Err(e) = self.collect() {
                    error!("Fanout {} failed to collect: {}", self.index, e);
                    return Outcome::Negative;
                }
                if !self.children.is_empty() {
                    return Outcome::Pending;
                }
                self.state = FanoutState::Done;
                if self.failed > 0 {
                    Outcome::Negative
                } else {
                    Outcome::Positive
                }
            }
            FanoutState::Done => Outcome::Positive,
        }
    }

    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            out,
            "state {:?}, {} running, {} collected, {} failed",
            self.state,
            self.children.len(),
            self.collected,
            self.failed
        )
    }
}

fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    let metrics = init_metrics()?;

    info!("Starting Cadence Engine v{} ({})", VERSION, GIT_HASH);
    info!("Configuration loaded: {:?}", config);

    let runtime = Runtime::init(config.runtime.clone())?;
    runtime.set_driver_hook(|id| debug!("{} ready", id))?;

    let parents = (0..PARENTS)
        .map(|i| runtime.submit(Fanout::new(i)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut failures = 0;
    for parent in parents {
        let id = parent.id();
        match parent.join(JOIN_TIMEOUT)? {
            Some(fanout) if fanout.state == FanoutState::Done && fanout.failed == 0 => {
                info!("Fanout {} collected {} children", fanout.index, fanout.collected);
            }
            Some(fanout) => {
                warn!("Fanout {} finished with {} failed children", fanout.index, fanout.failed);
                failures += 1;
            }
            None => {
                error!("Unit {} did not finish within {:?}", id, JOIN_TIMEOUT);
                failures += 1;
            }
        }
    }

    println!("{}", runtime.describe());
    println!("{}", serde_json::to_string_pretty(&runtime.stats())?);

    runtime.shutdown();
    print!("{}", metrics.render());

    if failures > 0 {
        bail!("{} of {} workloads failed", failures, PARENTS);
    }
    info!("Cadence Engine stopped");
    Ok(())
}
