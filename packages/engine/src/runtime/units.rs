// packages/engine/src/runtime/units.rs
//! Small reusable units

use crate::runtime::unit::{Outcome, StepContext, Unit};
use std::fmt;
use std::time::{Duration, Instant};

type StepFn = Box<dyn FnMut(&mut StepContext<'_>) -> Outcome + Send>;

/// Unit backed by closures
///
/// ```ignore
/// let mut left = 3;
/// let unit = FnUnit::new("countdown", move |_cx| {
///     if left == 0 { return Outcome::Positive; }
///     left -= 1;
///     Outcome::Pending
/// });
/// ```
pub struct FnUnit {
    name: String,
    step: StepFn,
    drain: Option<StepFn>,
}

impl FnUnit {
    pub fn new<F>(name: impl Into<String>, step: F) -> Self
    where
        F: FnMut(&mut StepContext<'_>) -> Outcome + Send + 'static,
    {
        Self {
            name: name.into(),
            step: Box::new(step),
            drain: None,
        }
    }

    pub fn with_drain<F>(mut self, drain: F) -> Self
    where
        F: FnMut(&mut StepContext<'_>) -> Outcome + Send + 'static,
    {
        self.drain = Some(Box::new(drain));
        self
    }
}

impl Unit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, cx: &mut StepContext<'_>) -> Outcome {
        (self.step)(cx)
    }

    fn drain(&mut self, cx: &mut StepContext<'_>) -> Outcome {
        match self.drain.as_mut() {
            Some(drain) => drain(cx),
            None => Outcome::Positive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayState {
    Start,
    Waiting,
    Done,
}

/// Completes once a duration has passed since its first step
///
/// The wait is a state in its own machine: each step only compares the
/// clock, so the driver is never blocked.
pub struct Delay {
    state: DelayState,
    duration: Duration,
    deadline: Option<Instant>,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self {
            state: DelayState::Start,
            duration,
            deadline: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DelayState::Done
    }

    fn transition(&mut self, now: Instant) -> Outcome {
        match self.state {
            DelayState::Start => {
                // None: the duration runs past what the clock can represent
                self.deadline = now.checked_add(self.duration);
                self.state = DelayState::Waiting;
                self.transition(now)
            }
            DelayState::Waiting => match self.deadline {
                Some(deadline) if now >= deadline => {
                    self.state = DelayState::Done;
                    Outcome::Positive
                }
                _ => Outcome::Pending,
            },
            DelayState::Done => Outcome::Positive,
        }
    }
}

impl Unit for Delay {
    fn name(&self) -> &str {
        "delay"
    }

    fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
        self.transition(Instant::now())
    }

    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "state {:?}", self.state)?;
        match (self.state, self.deadline) {
            (DelayState::Waiting, None) => write!(out, ", no deadline"),
            (_, Some(deadline)) => {
                let left = deadline.saturating_duration_since(Instant::now());
                write!(out, ", {:?} left", left)
            }
            _ => Ok(()),
        }
    }
}
