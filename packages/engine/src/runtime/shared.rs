// packages/engine/src/runtime/shared.rs
//! Resources shared across units
//!
//! The scheduler gives no implicit protection to state shared between
//! units. Components that need a single global handle (a connection pool, a
//! transport context) wrap it in a [`SharedResource`]: created lazily by the
//! first unit that needs it, guarded by its own mutex, and released exactly
//! once through the runtime's [`TeardownRegistry`].

use crate::runtime::context::RuntimeHandle;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

type Teardown = Box<dyn FnOnce() + Send>;

/// Named callbacks run once at shutdown, last registered first
pub struct TeardownRegistry {
    callbacks: Mutex<Vec<(String, Teardown)>>,
    ran: AtomicBool,
}

impl TeardownRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        debug!("Registered teardown '{}'", name);
        self.callbacks.lock().push((name, Box::new(f)));
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback; later calls only run callbacks registered since
    pub fn run_all(&self) {
        self.ran.store(true, Ordering::Release);

        loop {
            let next = self.callbacks.lock().pop();
            let Some((name, callback)) = next else {
                break;
            };
            debug!("Running teardown '{}'", name);
            callback();
        }
    }

    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }
}

impl Default for TeardownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily created handle shared by many units
///
/// Cloning shares the same underlying slot.
pub struct SharedResource<T> {
    name: Arc<str>,
    slot: Arc<Mutex<Option<T>>>,
    registered: Arc<AtomicBool>,
}

impl<T> Clone for SharedResource<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            slot: self.slot.clone(),
            registered: self.registered.clone(),
        }
    }
}

impl<T: Send + 'static> SharedResource<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            slot: Arc::new(Mutex::new(None)),
            registered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` with the resource, creating it first if needed
    ///
    /// Creation failure is returned to the caller and retried on next use.
    /// The lock is held for the duration of `f`, so keep it short.
    pub fn with<R>(
        &self,
        runtime: &RuntimeHandle,
        create: impl FnOnce() -> Result<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let mut slot = self.slot.lock();

        if slot.is_none() {
            let resource = create()?;
            debug!("Shared resource '{}' created", self.name);
            *slot = Some(resource);
            self.register_release(runtime);
        }

        match slot.as_mut() {
            Some(resource) => Ok(f(resource)),
            None => unreachable!("resource created above"),
        }
    }

    /// Run `f` only if the resource already exists
    pub fn with_existing<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.slot.lock().as_mut().map(f)
    }

    pub fn is_live(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drop the resource now; a later `with` creates a fresh one
    pub fn release(&self) {
        if self.slot.lock().take().is_some() {
            debug!("Shared resource '{}' released", self.name);
        }
    }

    fn register_release(&self, runtime: &RuntimeHandle) {
        if self.registered.swap(true, Ordering::AcqRel) {
            return;
        }

        let resource = self.clone();
        runtime.register_teardown(format!("shared:{}", self.name), move || {
            resource.release();
            resource.registered.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::Runtime;
    use crate::utils::config::RuntimeConfig;
    use crate::utils::errors::EngineError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_registry_runs_in_reverse_order_once() {
        let registry = TeardownRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            registry.register(format!("cb{}", i), move || order.lock().push(i));
        }
        assert_eq!(registry.len(), 3);

        registry.run_all();
        registry.run_all();

        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(registry.is_empty());
        assert!(registry.has_run());
    }

    struct Pool {
        uses: usize,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Pool {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shared_resource_created_once_released_once() {
        let runtime = Runtime::init(RuntimeConfig::default().with_workers(0)).unwrap();
        let handle = runtime.handle();
        let created = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let shared: SharedResource<Pool> = SharedResource::new("pool");

        for _ in 0..5 {
            let created = created.clone();
            let drops = drops.clone();
            shared
                .clone()
                .with(
                    &handle,
                    move || {
                        created.fetch_add(1, Ordering::SeqCst);
                        Ok(Pool { uses: 0, drops })
                    },
                    |pool| pool.uses += 1,
                )
                .unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(shared.with_existing(|pool| pool.uses), Some(5));
        assert!(shared.is_live());

        runtime.shutdown();

        assert!(!shared.is_live());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_resource_creation_failure() {
        let runtime = Runtime::init(RuntimeConfig::default().with_workers(0)).unwrap();
        let handle = runtime.handle();
        let shared: SharedResource<u32> = SharedResource::new("flaky");

        let result = shared.with(
            &handle,
            || Err(EngineError::invalid_config("no transport")),
            |v| *v,
        );
        assert!(result.is_err());
        assert!(!shared.is_live());

        let value = shared.with(&handle, || Ok(7), |v| *v).unwrap();
        assert_eq!(value, 7);
    }
}
