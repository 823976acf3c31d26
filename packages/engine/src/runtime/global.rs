// packages/engine/src/runtime/global.rs
//! Process-wide runtime
//!
//! Convenience layer for programs that want a single runtime reachable from
//! anywhere. `init` once at startup, `shutdown` once at exit.

use crate::runtime::context::{Runtime, RuntimeHandle};
use crate::runtime::handle::UnitHandle;
use crate::runtime::unit::{DriverId, Unit};
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static RUNTIME: Lazy<Mutex<Option<Runtime>>> = Lazy::new(|| Mutex::new(None));

/// Start the process-wide runtime
pub fn init(config: RuntimeConfig) -> Result<RuntimeHandle> {
    let mut slot = RUNTIME.lock();
    if slot.is_some() {
        return Err(EngineError::AlreadyInitialized);
    }

    let runtime = Runtime::init(config)?;
    let handle = runtime.handle();
    *slot = Some(runtime);
    Ok(handle)
}

/// Handle to the process-wide runtime
pub fn handle() -> Result<RuntimeHandle> {
    RUNTIME
        .lock()
        .as_ref()
        .map(Runtime::handle)
        .ok_or(EngineError::NotInitialized)
}

/// Change the worker count before the first submission
pub fn set_worker_count(workers: usize) -> Result<()> {
    match RUNTIME.lock().as_ref() {
        Some(runtime) => runtime.set_worker_count(workers),
        None => Err(EngineError::NotInitialized),
    }
}

pub fn submit<U: Unit>(unit: U) -> Result<UnitHandle<U>> {
    handle()?.submit(unit)
}

pub fn submit_to<U: Unit>(unit: U, driver: DriverId) -> Result<UnitHandle<U>> {
    handle()?.submit_to(unit, driver)
}

pub fn register_teardown<F>(name: impl Into<String>, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    handle()?.register_teardown(name, f);
    Ok(())
}

/// Drain and stop the process-wide runtime
pub fn shutdown() -> Result<()> {
    let runtime = RUNTIME.lock().take().ok_or(EngineError::NotInitialized)?;
    runtime.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::units::Delay;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // One test owns the global slot, so lifecycle steps run in sequence
    #[test]
    fn test_global_lifecycle() {
        assert!(matches!(handle(), Err(EngineError::NotInitialized)));
        assert!(matches!(shutdown(), Err(EngineError::NotInitialized)));

        init(RuntimeConfig::default().with_workers(1)).unwrap();
        assert!(matches!(
            init(RuntimeConfig::default()),
            Err(EngineError::AlreadyInitialized)
        ));
        set_worker_count(2).unwrap();

        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = torn_down.clone();
        register_teardown("flag", move || flag.store(true, Ordering::SeqCst)).unwrap();

        let a = submit(Delay::new(Duration::from_millis(1))).unwrap();
        let b = submit_to(Delay::new(Duration::from_millis(1)), DriverId(1)).unwrap();
        assert!(a.wait(Duration::from_secs(10)));
        assert!(b.wait(Duration::from_secs(10)));
        assert_eq!(b.driver(), Some(DriverId(1)));

        shutdown().unwrap();
        assert!(torn_down.load(Ordering::SeqCst));
        assert!(matches!(handle(), Err(EngineError::NotInitialized)));
    }
}
