//! Execution event stream
//!
//! A bounded channel of ordered events. Producers never block
//! indefinitely: metric samples drop first under pressure, then
//! low-severity events; lifecycle events apply bounded backpressure and
//! failing to drain them fails the run.

use crate::error::{GraphError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use skein_core::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Event payloads, one variant per observable occurrence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionStarted,
    ExecutionCompleted { steps: u64 },
    ExecutionFailed { kind: ErrorKind, node: Option<String>, message: String },
    ExecutionCanceled,
    NodeStarted { node: String, attempt: u32 },
    NodeCompleted { node: String, duration_ms: u64 },
    NodeFailed { node: String, kind: ErrorKind, message: String },
    NodeRetried { node: String, attempt: u32, delay_ms: u64 },
    NodeSkipped { node: String },
    Suspended { node: String, request_id: String },
    Resumed { node: String, request_id: String },
    CheckpointCreated { checkpoint_id: String, name: Option<String> },
    CircuitOpened { node: String },
    CircuitClosed { node: String },
    BudgetExceeded { node: String, requested: f64, remaining: f64 },
    RateLimited { node: String },
    MetricSample { data: serde_json::Value },
}

/// Drop classes under buffer pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// Never dropped; backpressure applies
    Lifecycle,
    /// Dropped after metric samples
    Low,
    /// Dropped first
    Metric,
}

impl EventPayload {
    fn class(&self) -> EventClass {
        match self {
            Self::ExecutionStarted
            | Self::ExecutionCompleted { .. }
            | Self::ExecutionFailed { .. }
            | Self::ExecutionCanceled
            | Self::NodeStarted { .. }
            | Self::NodeCompleted { .. }
            | Self::NodeFailed { .. }
            | Self::Suspended { .. }
            | Self::Resumed { .. } => EventClass::Lifecycle,
            Self::MetricSample { .. } => EventClass::Metric,
            _ => EventClass::Low,
        }
    }
}

/// An ordered event as observers receive it.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    /// Strictly increasing per sink
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Producer half; cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    inner: Option<Arc<SinkInner>>,
}

struct SinkInner {
    tx: mpsc::Sender<ExecutionEvent>,
    sequence: AtomicU64,
    dropped_metrics: AtomicU64,
    dropped_low: AtomicU64,
    publish_timeout: Duration,
}

/// Consumer half.
pub struct EventReceiver {
    rx: mpsc::Receiver<ExecutionEvent>,
}

impl EventReceiver {
    /// Next event, `None` once all sinks are gone.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    /// Drain everything currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<ExecutionEvent> {
        let mut events = vec![];
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a bounded sink/receiver pair.
pub fn channel(capacity: usize, publish_timeout: Duration) -> (EventSink, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = EventSink {
        inner: Some(Arc::new(SinkInner {
            tx,
            sequence: AtomicU64::new(0),
            dropped_metrics: AtomicU64::new(0),
            dropped_low: AtomicU64::new(0),
            publish_timeout,
        })),
    };
    (sink, EventReceiver { rx })
}

impl EventSink {
    /// Sink that discards everything (streaming disabled).
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Metric samples dropped so far under pressure.
    pub fn dropped_metric_events(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.dropped_metrics.load(Ordering::Relaxed))
    }

    /// Low-severity events dropped so far under pressure.
    pub fn dropped_low_events(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.dropped_low.load(Ordering::Relaxed))
    }

    /// Publish one event. Lifecycle events block up to the publish
    /// timeout and then fail the run; others drop with a counter.
    pub async fn publish(&self, execution_id: &str, payload: EventPayload) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let event = ExecutionEvent {
            execution_id: execution_id.to_string(),
            sequence: inner.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            payload,
        };

        match event.payload.class() {
            EventClass::Lifecycle => {
                let send = inner.tx.send(event);
                match tokio::time::timeout(inner.publish_timeout, send).await {
                    Ok(Ok(())) => Ok(()),
                    // Receiver gone: observers left; not a run failure
                    Ok(Err(_)) => Ok(()),
                    Err(_) => Err(GraphError::EventOverflow),
                }
            }
            class => {
                if inner.tx.try_send(event).is_err() {
                    let counter = match class {
                        EventClass::Metric => &inner.dropped_metrics,
                        _ => &inner.dropped_low,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_ordered() {
        let (sink, mut rx) = channel(16, Duration::from_secs(1));
        sink.publish("x", EventPayload::ExecutionStarted).await.unwrap();
        sink.publish("x", EventPayload::NodeStarted { node: "a".into(), attempt: 1 })
            .await
            .unwrap();
        sink.publish("x", EventPayload::NodeCompleted { node: "a".into(), duration_ms: 3 })
            .await
            .unwrap();

        let events = rx.drain();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_metric_events_drop_first() {
        let (sink, mut rx) = channel(1, Duration::from_millis(50));
        sink.publish("x", EventPayload::ExecutionStarted).await.unwrap();

        // Buffer full: metric samples drop silently with a counter
        sink.publish("x", EventPayload::MetricSample { data: serde_json::json!({}) })
            .await
            .unwrap();
        sink.publish("x", EventPayload::MetricSample { data: serde_json::json!({}) })
            .await
            .unwrap();
        assert_eq!(sink.dropped_metric_events(), 2);

        // Low-severity events drop too, on their own counter
        sink.publish("x", EventPayload::NodeSkipped { node: "a".into() }).await.unwrap();
        assert_eq!(sink.dropped_low_events(), 1);

        let events = rx.drain();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_backpressure_fails_eventually() {
        let (sink, _rx) = channel(1, Duration::from_millis(100));
        sink.publish("x", EventPayload::ExecutionStarted).await.unwrap();

        // Buffer full and nobody draining: the second lifecycle publish
        // must fail rather than block forever.
        let err = sink
            .publish("x", EventPayload::NodeStarted { node: "a".into(), attempt: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::EventOverflow));
    }

    #[tokio::test]
    async fn test_disabled_sink_accepts_everything() {
        let sink = EventSink::disabled();
        sink.publish("x", EventPayload::ExecutionStarted).await.unwrap();
        assert!(!sink.is_enabled());
    }
}
