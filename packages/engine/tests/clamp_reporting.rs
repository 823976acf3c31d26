//! Affinity clamping must be reported through both logs and metrics.
//!
//! Lives in its own test binary: it installs the process-wide tracing
//! subscriber and metrics recorder.

use cadence_engine::observability::{init_metrics, names};
use cadence_engine::{DriverId, Outcome, Runtime, RuntimeConfig, StepContext, Unit};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

type Captured = Arc<Mutex<Vec<(Level, String)>>>;

struct CaptureLayer(Captured);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        self.0.lock().push((*event.metadata().level(), message.0));
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

struct Once;

impl Unit for Once {
    fn step(&mut self, _cx: &mut StepContext<'_>) -> Outcome {
        Outcome::Positive
    }
}

#[test]
fn clamped_affinity_is_warned_and_counted() {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    tracing_subscriber::registry()
        .with(CaptureLayer(captured.clone()))
        .try_init()
        .unwrap();
    let metrics = init_metrics().unwrap();

    let runtime = Runtime::init(RuntimeConfig::default().with_workers(1)).unwrap();
    let h = runtime.submit_to(Once, DriverId(5)).unwrap();
    assert!(h.wait(Duration::from_secs(10)));
    assert_eq!(h.driver(), Some(DriverId(0)));
    runtime.shutdown();

    let warned = captured.lock().iter().any(|(level, message)| {
        *level == Level::WARN && message.contains("Desired driver 5 out of range")
            && message.contains("using driver 0")
    });
    assert!(warned, "no clamp warning in {:?}", captured.lock());

    let rendered = metrics.render();
    let line = format!("{} 1", names::AFFINITY_CLAMPED);
    assert!(
        rendered.lines().any(|l| l == line),
        "missing `{}` in:\n{}",
        line,
        rendered
    );
}
