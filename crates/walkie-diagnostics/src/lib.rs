//! Lightweight diagnostics event bus shared across the walkie workspace.
//!
//! Publishing is lock-light (an unbounded `flume` channel) so it is safe to
//! call from the audio callback's hot path without risking a missed
//! real-time deadline.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagEvent {
    /// Sub-system that produced this event (e.g. "jitter", "rpc", "codec").
    pub subsystem: &'static str,
    /// Peer name this event concerns, if any.
    pub stream_id: Option<String>,
    /// Unix time in milliseconds when the metric was captured.
    pub ts_ms: u64,
    pub metrics: Vec<Metric>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metric {
    pub name: &'static str,
    pub value: MetricValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum MetricValue {
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
}

static BUS: Lazy<(flume::Sender<DiagEvent>, flume::Receiver<DiagEvent>)> =
    Lazy::new(flume::unbounded);

/// Obtain a sender that can publish diagnostics events.
pub fn global_sender() -> &'static flume::Sender<DiagEvent> {
    &BUS.0
}

/// Subscribe to the diagnostics stream. Each subscriber receives all future events.
pub fn subscribe() -> flume::Receiver<DiagEvent> {
    BUS.1.clone()
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shorthand for constructing a [`Metric`].
#[macro_export]
macro_rules! metric {
    ($name:expr, $value:expr) => {
        $crate::Metric {
            name: $name,
            value: $crate::MetricValue::from($value),
        }
    };
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::I64(v)
    }
}
impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::U64(v)
    }
}
impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::F64(v)
    }
}
impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// Publish an event, tagging it with the current time.
pub fn publish(subsystem: &'static str, stream_id: Option<String>, metrics: Vec<Metric>) {
    let _ = global_sender().send(DiagEvent {
        subsystem,
        stream_id,
        ts_ms: now_ms(),
        metrics,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_is_observed_by_subscriber() {
        let rx = subscribe();
        publish("jitter", Some("alice".into()), vec![metric!("missing", 1i64)]);
        let ev = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(ev.subsystem, "jitter");
        assert_eq!(ev.stream_id.as_deref(), Some("alice"));
    }
}
