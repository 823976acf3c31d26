// packages/engine/src/runtime/mod.rs
//! Cooperative scheduling runtime
//!
//! This module provides the execution core every other component rides on:
//!
//! - **Unit**: the run-to-completion contract (`step`, `drain`, `describe`)
//! - **Handle**: owner-side view of a submitted unit, and reclaim
//! - **Queue**: multi-producer submission channel into the broker
//! - **Broker**: routes units to drivers (round-robin or pinned)
//! - **Driver**: one thread stepping and draining the units it owns
//! - **Context**: runtime lifecycle, submission entry points, diagnostics
//! - **Shared**: teardown registry and lazily created shared handles
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  any thread:  submit(unit, desired driver?)              │
//! │                      │                                   │
//! │                      ▼                                   │
//! │             Submission Queue (MPSC)                      │
//! │                      │                                   │
//! │                      ▼                                   │
//! │                   Broker ── workers == 0 ──▶ own list    │
//! │          ┌───────────┼───────────┐                       │
//! │          ▼           ▼           ▼                       │
//! │     ┌─────────┐ ┌─────────┐ ┌─────────┐                  │
//! │     │driver-0 │ │driver-1 │ │driver-N │  (lazy start)    │
//! │     │ step()  │ │ step()  │ │ step()  │                  │
//! │     │ drain() │ │ drain() │ │ drain() │                  │
//! │     └────┬────┘ └────┬────┘ └────┬────┘                  │
//! │          └───────────┴───────────┘                       │
//! │                      ▼                                   │
//! │             retired unit → owner's UnitHandle            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A unit is stepped by one thread at a time, and only by the driver it
//!   was dispatched to
//! - No `step` after a terminal outcome; only `drain` until `Positive`
//! - Submissions from one thread are dispatched in order
//! - Shutdown drains every owned unit before threads exit

mod broker;
pub mod context;
pub mod driver;
pub mod global;
pub mod handle;
pub mod queue;
pub mod shared;
pub mod unit;
pub mod units;

// Re-export commonly used types
pub use context::{Runtime, RuntimeHandle, RuntimeStats};
pub use driver::{DriverHook, DriverStats};
pub use handle::UnitHandle;
pub use queue::QueueStats;
pub use shared::{SharedResource, TeardownRegistry};
pub use unit::{DriverId, Outcome, StepContext, Unit, UnitId};
pub use units::{Delay, FnUnit};
