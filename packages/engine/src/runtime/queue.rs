// packages/engine/src/runtime/queue.rs
//! Cross-thread submission queue
//!
//! Multi-producer, single-consumer channel from any submitting thread to the
//! broker. Per-producer order is preserved. Pushing never waits for the
//! consumer; popping blocks the broker (bounded by a timeout) when empty.

use crate::runtime::driver::Entry;
use crate::runtime::unit::DriverId;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit waiting for dispatch
pub(crate) struct PoolRequest {
    pub entry: Entry,
    pub desired: Option<DriverId>,
}

/// Message consumed by the broker loop
pub(crate) enum Request {
    Submit(PoolRequest),
    Shutdown,
}

#[derive(Default)]
struct Counters {
    push_count: AtomicU64,
    pop_count: AtomicU64,
}

/// Producer side, cloned into every runtime handle
#[derive(Clone)]
pub(crate) struct QueueSender {
    tx: Sender<Request>,
    counters: Arc<Counters>,
}

/// Consumer side, owned by the broker thread
pub(crate) struct QueueReceiver {
    rx: Receiver<Request>,
    counters: Arc<Counters>,
}

/// Create a connected sender/receiver pair
pub(crate) fn submission_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let counters = Arc::new(Counters::default());

    (
        QueueSender {
            tx,
            counters: counters.clone(),
        },
        QueueReceiver { rx, counters },
    )
}

impl QueueSender {
    /// Enqueue a request without waiting for the consumer
    pub fn push(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| EngineError::QueueClosed)?;
        self.counters.push_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.counters.push_count.load(Ordering::Relaxed),
            pop_count: self.counters.pop_count.load(Ordering::Relaxed),
            current_size: self.tx.len(),
        }
    }
}

impl QueueReceiver {
    /// Wait up to `timeout` for the next request
    ///
    /// Returns `None` on timeout and when every sender is gone.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Request> {
        match self.rx.recv_timeout(timeout) {
            Ok(request) => {
                self.counters.pop_count.fetch_add(1, Ordering::Relaxed);
                Some(request)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next request if one is ready
    pub fn try_pop(&self) -> Option<Request> {
        match self.rx.try_recv() {
            Ok(request) => {
                self.counters.pop_count.fetch_add(1, Ordering::Relaxed);
                Some(request)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Total requests pushed
    pub push_count: u64,

    /// Total requests popped
    pub pop_count: u64,

    /// Requests currently waiting
    pub current_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::UnitSlot;
    use crate::runtime::unit::{Outcome, StepContext, Unit, UnitId};
    use std::thread;

    struct Noop;

    impl Unit for Noop {
        fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
            Outcome::Positive
        }
    }

    fn request(id: u64) -> Request {
        let slot = Arc::new(UnitSlot::new(UnitId::from_raw(id)));
        Request::Submit(PoolRequest {
            entry: Entry::new(Box::new(Noop), slot),
            desired: None,
        })
    }

    fn request_id(request: Request) -> u64 {
        match request {
            Request::Submit(req) => req.entry.id().as_u64(),
            Request::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn test_push_pop() {
        let (tx, rx) = submission_queue();

        tx.push(request(1)).unwrap();
        assert_eq!(rx.len(), 1);
        assert!(!rx.is_empty());

        let popped = rx.try_pop().unwrap();
        assert_eq!(request_id(popped), 1);
        assert!(rx.is_empty());
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn test_pop_timeout_when_empty() {
        let (_tx, rx) = submission_queue();
        assert!(rx.pop_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_push_after_consumer_gone() {
        let (tx, rx) = submission_queue();
        drop(rx);

        let result = tx.push(request(1));
        assert!(matches!(result, Err(EngineError::QueueClosed)));
    }

    #[test]
    fn test_stats() {
        let (tx, rx) = submission_queue();

        tx.push(request(1)).unwrap();
        tx.push(request(2)).unwrap();
        rx.try_pop();

        let stats = tx.stats();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.pop_count, 1);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn test_per_producer_order() {
        let (tx, rx) = submission_queue();
        let mut handles = vec![];

        for producer in 0..4u64 {
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                for seq in 0..100u64 {
                    tx.push(request(producer * 1000 + seq)).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = [None::<u64>; 4];
        let mut total = 0;
        while let Some(req) = rx.try_pop() {
            let id = request_id(req);
            let producer = (id / 1000) as usize;
            let seq = id % 1000;
            if let Some(prev) = last[producer] {
                assert!(seq > prev, "producer {} reordered", producer);
            }
            last[producer] = Some(seq);
            total += 1;
        }

        assert_eq!(total, 400);
    }
}
