//! Metric emission helpers.
//!
//! Metric events are emitted as structured tracing records by default. A test
//! sink can be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(i64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

impl MetricLabel {
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

pub fn record(event: MetricEvent) {
    sink().record(event);
}


#[cfg(test)]
mod tests {
    use super::test_sink::CapturingSink;
    use super::*;

    #[test]
    fn installed_sink_captures_events() {
        let capture = Arc::new(CapturingSink::default());
        set_sink(capture.clone());

        record(MetricEvent {
            name: "demo_counter",
            value: MetricValue::Counter(3),
            labels: vec![MetricLabel::new("node", "7")],
        });

        // Other tests may emit through the global sink concurrently; only
        // look for our own event.
        let events = capture.take();
        let own: Vec<_> = events.iter().filter(|e| e.name == "demo_counter").collect();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].value, MetricValue::Counter(3));
    }
}
