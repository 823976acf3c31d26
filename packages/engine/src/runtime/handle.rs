// packages/engine/src/runtime/handle.rs
//! Owner-side view of a submitted unit
//!
//! The unit itself travels by value: owner → queue → driver list → slot →
//! owner. The [`UnitSlot`] is the only state shared between the owner and
//! the stepping thread; it carries the published results and, once drained,
//! the unit on its way back.

use crate::runtime::unit::{AsAny, DriverId, Outcome, Unit, UnitId};
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

const NO_DRIVER: usize = usize::MAX;

#[derive(Default)]
struct Return {
    unit: Option<Box<dyn Unit>>,
    retired: bool,
    reclaimed: bool,
    detached: bool,
}

/// Results and return path shared by a unit's handle and its stepping thread
pub(crate) struct UnitSlot {
    id: UnitId,
    work: AtomicU8,
    drain: AtomicU8,
    driver: AtomicUsize,
    steps: AtomicU64,
    returned: Mutex<Return>,
    retired: Condvar,
}

impl UnitSlot {
    pub(crate) fn new(id: UnitId) -> Self {
        Self {
            id,
            work: AtomicU8::new(Outcome::Pending as u8),
            drain: AtomicU8::new(Outcome::Pending as u8),
            driver: AtomicUsize::new(NO_DRIVER),
            steps: AtomicU64::new(0),
            returned: Mutex::new(Return::default()),
            retired: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> UnitId {
        self.id
    }

    pub(crate) fn work(&self) -> Outcome {
        Outcome::from_u8(self.work.load(Ordering::Acquire))
    }

    pub(crate) fn drain(&self) -> Outcome {
        Outcome::from_u8(self.drain.load(Ordering::Acquire))
    }

    pub(crate) fn set_work(&self, outcome: Outcome) {
        self.work.store(outcome as u8, Ordering::Release);
    }

    pub(crate) fn set_driver(&self, driver: DriverId) {
        self.driver.store(driver.0, Ordering::Release);
    }

    pub(crate) fn driver(&self) -> Option<DriverId> {
        match self.driver.load(Ordering::Acquire) {
            NO_DRIVER => None,
            id => Some(DriverId(id)),
        }
    }

    pub(crate) fn record_step(&self) -> u64 {
        self.steps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Hand a drained unit back to its owner
    ///
    /// If the owner dropped its handle the unit is dropped here instead.
    pub(crate) fn retire(&self, unit: Box<dyn Unit>) {
        let mut returned = self.returned.lock();
        self.drain.store(Outcome::Positive as u8, Ordering::Release);
        returned.retired = true;

        if returned.detached {
            trace!("Unit {} retired without owner, dropping", self.id);
            drop(returned);
            drop(unit);
            return;
        }

        returned.unit = Some(unit);
        self.retired.notify_all();
    }

    /// Retire a unit that could not be scheduled at all
    pub(crate) fn reject(&self, unit: Box<dyn Unit>) {
        self.set_work(Outcome::Negative);
        self.retire(unit);
    }
}

/// Owner's handle on a submitted unit
///
/// Dropping the handle without reclaiming detaches the unit; the runtime
/// then drops it once it has drained.
pub struct UnitHandle<U> {
    slot: Arc<UnitSlot>,
    _unit: PhantomData<fn() -> U>,
}

impl<U: Unit> UnitHandle<U> {
    pub(crate) fn new(slot: Arc<UnitSlot>) -> Self {
        Self {
            slot,
            _unit: PhantomData,
        }
    }

    pub fn id(&self) -> UnitId {
        self.slot.id()
    }

    /// Work result so far
    pub fn outcome(&self) -> Outcome {
        self.slot.work()
    }

    /// Drain result so far
    pub fn drain_outcome(&self) -> Outcome {
        self.slot.drain()
    }

    /// Work reached a terminal result (the unit may still be draining)
    pub fn is_finished(&self) -> bool {
        self.outcome().is_terminal()
    }

    /// Drain completed and the unit is ready to be reclaimed
    pub fn is_retired(&self) -> bool {
        self.drain_outcome() == Outcome::Positive
    }

    /// Driver the unit was dispatched to, `None` before dispatch or when broker-local
    pub fn driver(&self) -> Option<DriverId> {
        self.slot.driver()
    }

    /// Number of `step` calls made so far
    pub fn steps(&self) -> u64 {
        self.slot.steps()
    }

    /// Take the unit back once it has drained
    ///
    /// Calling this before the unit's work finished is a programming error
    /// and is reported as [`EngineError::ReclaimPending`]. Returns `Ok(None)`
    /// while the unit is still draining.
    pub fn reclaim(&mut self) -> Result<Option<Box<U>>> {
        if !self.is_finished() {
            error!("Unit {} reclaimed before its work finished", self.id());
            return Err(EngineError::ReclaimPending(self.id()));
        }

        let mut returned = self.slot.returned.lock();
        if returned.reclaimed {
            return Err(EngineError::AlreadyReclaimed(self.id()));
        }

        // A mismatch leaves the unit in place for its rightful owner
        match returned.unit.as_deref() {
            None => return Ok(None),
            Some(unit) if !<dyn Unit as AsAny>::as_any(unit).is::<U>() => {
                return Err(EngineError::TypeMismatch(self.id()));
            }
            Some(_) => {}
        }

        let unit = match returned.unit.take() {
            Some(unit) => unit,
            None => return Ok(None),
        };
        returned.reclaimed = true;
        drop(returned);

        AsAny::into_any(unit)
            .downcast::<U>()
            .map(Some)
            .map_err(|_| EngineError::TypeMismatch(self.id()))
    }

    /// Block until the unit has drained or `timeout` passes
    ///
    /// For owners outside the runtime only: calling this from `step` or
    /// `drain` would stall a driver.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut returned = self.slot.returned.lock();

        while !returned.retired {
            if self.slot.retired.wait_until(&mut returned, deadline).timed_out() {
                return returned.retired;
            }
        }
        true
    }

    /// Block until drained, then reclaim
    pub fn join(mut self, timeout: Duration) -> Result<Option<Box<U>>> {
        if !self.wait(timeout) {
            return Ok(None);
        }
        self.reclaim()
    }
}

impl<U> Drop for UnitHandle<U> {
    fn drop(&mut self) {
        let mut returned = self.slot.returned.lock();
        returned.detached = true;
        let unit = returned.unit.take();
        drop(returned);
        drop(unit);
    }
}

impl<U> std::fmt::Debug for UnitHandle<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("id", &self.slot.id())
            .field("work", &self.slot.work())
            .field("drain", &self.slot.drain())
            .field("driver", &self.slot.driver())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::unit::StepContext;

    struct Probe {
        value: u32,
    }

    impl Unit for Probe {
        fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
            Outcome::Positive
        }
    }

    struct Other;

    impl Unit for Other {
        fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
            Outcome::Positive
        }
    }

    fn slot(id: u64) -> Arc<UnitSlot> {
        Arc::new(UnitSlot::new(UnitId::from_raw(id)))
    }

    #[test]
    fn test_reclaim_before_finished_is_error() {
        let slot = slot(1);
        let mut handle = UnitHandle::<Probe>::new(slot);

        let result = handle.reclaim();
        assert!(matches!(result, Err(EngineError::ReclaimPending(id)) if id.as_u64() == 1));
    }

    #[test]
    fn test_reclaim_while_draining() {
        let slot = slot(2);
        let mut handle = UnitHandle::<Probe>::new(slot.clone());

        slot.set_work(Outcome::Positive);
        assert!(handle.is_finished());
        assert!(!handle.is_retired());
        assert!(handle.reclaim().unwrap().is_none());
    }

    #[test]
    fn test_reclaim_after_retire() {
        let slot = slot(3);
        let mut handle = UnitHandle::<Probe>::new(slot.clone());

        slot.set_work(Outcome::Positive);
        slot.retire(Box::new(Probe { value: 9 }));

        assert!(handle.is_retired());
        let unit = handle.reclaim().unwrap().unwrap();
        assert_eq!(unit.value, 9);

        assert!(matches!(
            handle.reclaim(),
            Err(EngineError::AlreadyReclaimed(_))
        ));
    }

    #[test]
    fn test_reclaim_type_mismatch() {
        let slot = slot(4);
        let mut handle = UnitHandle::<Probe>::new(slot.clone());

        slot.set_work(Outcome::Positive);
        slot.retire(Box::new(Other));

        assert!(matches!(handle.reclaim(), Err(EngineError::TypeMismatch(_))));

        // the unit stays put and a second attempt fails the same way
        assert!(slot.returned.lock().unit.is_some());
        assert!(!slot.returned.lock().reclaimed);
        assert!(matches!(handle.reclaim(), Err(EngineError::TypeMismatch(_))));
    }

    #[test]
    fn test_reject_marks_negative() {
        let slot = slot(5);
        let mut handle = UnitHandle::<Probe>::new(slot.clone());

        slot.reject(Box::new(Probe { value: 1 }));

        assert_eq!(handle.outcome(), Outcome::Negative);
        assert!(handle.is_retired());
        assert!(handle.reclaim().unwrap().is_some());
    }

    #[test]
    fn test_wait_times_out() {
        let handle = UnitHandle::<Probe>::new(slot(6));
        assert!(!handle.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_on_retire() {
        let slot = slot(7);
        let handle = UnitHandle::<Probe>::new(slot.clone());

        let retirer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            slot.set_work(Outcome::Positive);
            slot.retire(Box::new(Probe { value: 0 }));
        });

        assert!(handle.wait(Duration::from_secs(5)));
        retirer.join().unwrap();
    }

    #[test]
    fn test_detached_unit_dropped_on_retire() {
        let slot = slot(8);
        let handle = UnitHandle::<Probe>::new(slot.clone());
        drop(handle);

        slot.set_work(Outcome::Positive);
        slot.retire(Box::new(Probe { value: 0 }));

        assert!(slot.returned.lock().unit.is_none());
    }
}
