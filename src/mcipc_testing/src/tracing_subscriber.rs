use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing_core::field::{Field, Visit};
use tracing_core::span::{Attributes, Id, Record};
use tracing_core::{Event, Level, Metadata, Subscriber};
use tracing_log::NormalizeEvent;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RecordedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
}

#[derive(Default)]
struct State {
    spans: Vec<String>,
    events: Vec<RecordedEvent>,
}

/// Remembers the name of every span created and every event emitted while
/// it is the current subscriber. Install it with
/// `tracing::subscriber::with_default`.
#[derive(Clone, Default)]
pub struct TracingSubscriber {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
}

impl TracingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn span_names(&self) -> Vec<String> {
        self.state.lock().unwrap().spans.clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.spans.clear();
        state.events.clear();
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl Subscriber for TracingSubscriber {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, attrs: &Attributes<'_>) -> Id {
        self.state
            .lock()
            .unwrap()
            .spans
            .push(attrs.metadata().name().to_string());
        // ids must be non-zero
        Id::from_u64(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        // events bridged from `log` carry their real target in fields
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.state.lock().unwrap().events.push(RecordedEvent {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.0,
        });
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}
