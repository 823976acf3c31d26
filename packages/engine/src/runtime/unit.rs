// packages/engine/src/runtime/unit.rs
//! Unit-of-work contract
//!
//! A unit is a state machine advanced by repeated, non-blocking calls to
//! [`Unit::step`]. Once `step` returns a terminal [`Outcome`] the unit is
//! never stepped again; instead [`Unit::drain`] is called once per cycle
//! until it returns `Positive`, after which ownership goes back to whoever
//! holds the unit's [`UnitHandle`].
//!
//! ```text
//!            submit            step() == Pending
//!   owner ───────────▶ driver ◀─────────┐
//!     ▲                  │ step()        │
//!     │                  ├───────────────┘
//!     │                  │ Positive / Negative
//!     │                  ▼
//!     │               draining ◀── drain() == Pending
//!     │                  │ drain() == Positive
//!     └──── reclaim ◀────┘
//! ```
//!
//! Neither call may block: waiting is expressed by returning `Pending`.

use crate::runtime::context::RuntimeHandle;
use crate::runtime::handle::UnitHandle;
use crate::utils::errors::Result;
use std::any::Any;
use std::fmt;

/// Tri-state result of `step` and `drain`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Outcome {
    /// Not done yet, call again next cycle
    Pending = 0,
    /// Finished successfully
    Positive = 1,
    /// Finished with a failure (reason is logged by the unit)
    Negative = 2,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Outcome::Pending
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Outcome::Positive,
            2 => Outcome::Negative,
            _ => Outcome::Pending,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pending => "pending",
            Outcome::Positive => "positive",
            Outcome::Negative => "negative",
        };
        f.write_str(s)
    }
}

/// Stable identity of a submitted unit, unique per runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a driver thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(pub usize);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver-{}", self.0)
    }
}

/// Type-erasure helper so reclaimed units can be downcast to their concrete type
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A schedulable unit of work
///
/// Implementations keep an explicit state enum and advance it in `step`.
/// Bodies must return quickly; long operations are split into more states.
pub trait Unit: AsAny + Send + 'static {
    /// Human-readable kind, used in logs and diagnostics
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Advance the work state machine by one increment
    fn step(&mut self, cx: &mut StepContext<'_>) -> Outcome;

    /// Release resources after work finished
    ///
    /// `Negative` is not a valid result here and is treated as a defect.
    fn drain(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
        Outcome::Positive
    }

    /// Render current state for diagnostics, without side effects
    fn describe(&self, _out: &mut dyn fmt::Write) -> fmt::Result {
        Ok(())
    }
}

/// Per-call context handed to `step` and `drain`
pub struct StepContext<'a> {
    runtime: &'a RuntimeHandle,
    unit: UnitId,
    driver: Option<DriverId>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(runtime: &'a RuntimeHandle, unit: UnitId, driver: Option<DriverId>) -> Self {
        Self {
            runtime,
            unit,
            driver,
        }
    }

    /// Id of the unit being stepped
    pub fn unit_id(&self) -> UnitId {
        self.unit
    }

    /// Driver stepping this unit, `None` on the broker thread
    pub fn driver(&self) -> Option<DriverId> {
        self.driver
    }

    /// Handle to the runtime, e.g. for registering teardown callbacks
    pub fn runtime(&self) -> &RuntimeHandle {
        self.runtime
    }

    /// Submit a child unit with no driver preference
    pub fn spawn<C: Unit>(&self, child: C) -> Result<UnitHandle<C>> {
        self.runtime.submit(child)
    }

    /// Submit a child unit pinned to `driver`
    pub fn spawn_on<C: Unit>(&self, child: C, driver: DriverId) -> Result<UnitHandle<C>> {
        self.runtime.submit_to(child, driver)
    }

    /// Submit a child unit pinned to the current driver
    pub fn spawn_local<C: Unit>(&self, child: C) -> Result<UnitHandle<C>> {
        match self.driver {
            Some(driver) => self.runtime.submit_to(child, driver),
            None => self.runtime.submit(child),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named;

    impl Unit for Named {
        fn name(&self) -> &str {
            "named"
        }

        fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
            Outcome::Positive
        }
    }

    struct Anonymous;

    impl Unit for Anonymous {
        fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
            Outcome::Pending
        }
    }

    #[test]
    fn test_outcome_terminal() {
        assert!(!Outcome::Pending.is_terminal());
        assert!(Outcome::Positive.is_terminal());
        assert!(Outcome::Negative.is_terminal());
    }

    #[test]
    fn test_outcome_raw_conversion() {
        for outcome in [Outcome::Pending, Outcome::Positive, Outcome::Negative] {
            assert_eq!(Outcome::from_u8(outcome as u8), outcome);
        }
        assert_eq!(Outcome::from_u8(200), Outcome::Pending);
    }

    #[test]
    fn test_unit_names() {
        let named: Box<dyn Unit> = Box::new(Named);
        assert_eq!(named.name(), "named");

        let anonymous: Box<dyn Unit> = Box::new(Anonymous);
        assert!(anonymous.name().ends_with("Anonymous"));
    }

    #[test]
    fn test_into_any_downcast() {
        let unit: Box<dyn Unit> = Box::new(Named);
        let any = unit.into_any();
        assert!(any.downcast::<Named>().is_ok());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(UnitId::from_raw(12).to_string(), "#12");
        assert_eq!(DriverId(3).to_string(), "driver-3");
    }
}
