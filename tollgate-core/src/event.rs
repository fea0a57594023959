//! Gate events and notification sinks.
//!
//! The guard reports denials, conflicts and replays to an [`EventSink`].
//! Delivery is fire-and-forget: [`emit_quietly`] logs and discards sink
//! errors (and sink panics), so a broken subscriber can never fail the
//! operation being gated.

use crate::error::SinkError;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Structured event emitted by the guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateEvent {
    /// A caller exceeded a rate limit.
    RateLimitExceeded {
        /// Operation identity the limit applies to
        operation: String,
        /// Resolved caller key (e.g. `ip:10.0.0.1`)
        key: String,
        /// Policy expression that was exceeded
        policy: String,
        retry_after_secs: u64,
    },

    /// A stored result was returned instead of executing again.
    IdempotentReplay { operation: String, key: String },

    /// A duplicate arrived while the first execution was still running.
    IdempotencyConflict { operation: String, key: String },
}

impl GateEvent {
    /// Stable event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            GateEvent::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GateEvent::IdempotentReplay { .. } => "idempotent_replay",
            GateEvent::IdempotencyConflict { .. } => "idempotency_conflict",
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            GateEvent::RateLimitExceeded { operation, .. }
            | GateEvent::IdempotentReplay { operation, .. }
            | GateEvent::IdempotencyConflict { operation, .. } => operation,
        }
    }
}

/// Receiver of gate events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &GateEvent) -> Result<(), SinkError>;
}

/// Deliver `event` to `sink`, logging and discarding any failure.
pub fn emit_quietly(sink: &dyn EventSink, event: &GateEvent) {
    match catch_unwind(AssertUnwindSafe(|| sink.emit(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(event = event.name(), error = %e, "Event sink rejected event");
        }
        Err(_) => {
            tracing::error!(event = event.name(), "Event sink panicked");
        }
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &GateEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes every event to the `tracing` pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GateEvent) -> Result<(), SinkError> {
        match event {
            GateEvent::RateLimitExceeded {
                operation,
                key,
                policy,
                retry_after_secs,
            } => tracing::warn!(
                operation = %operation,
                key = %key,
                policy = %policy,
                retry_after_secs,
                "Rate limit exceeded"
            ),
            GateEvent::IdempotentReplay { operation, key } => tracing::debug!(
                operation = %operation,
                key = %truncate_key(key),
                "Idempotent replay"
            ),
            GateEvent::IdempotencyConflict { operation, key } => tracing::info!(
                operation = %operation,
                key = %truncate_key(key),
                "Idempotency conflict"
            ),
        }
        Ok(())
    }
}

/// Keep client-supplied keys short in logs.
fn truncate_key(key: &str) -> &str {
    match key.char_indices().nth(8) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

/// Publishes events on a tokio broadcast channel for in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<GateEvent>,
}

impl BroadcastSink {
    /// Create a sink whose channel buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &GateEvent) -> Result<(), SinkError> {
        // No subscribers is not a failure for a fire-and-forget channel.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Forwards each event to several sinks. A failing sink does not stop the rest.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &GateEvent) -> Result<(), SinkError> {
        for sink in &self.sinks {
            emit_quietly(sink.as_ref(), event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<GateEvent>>);

    impl EventSink for Collecting {
        fn emit(&self, event: &GateEvent) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl EventSink for Failing {
        fn emit(&self, _event: &GateEvent) -> Result<(), SinkError> {
            Err(SinkError::Delivery {
                reason: "webhook down".to_string(),
            })
        }
    }

    struct Panicking;

    impl EventSink for Panicking {
        fn emit(&self, _event: &GateEvent) -> Result<(), SinkError> {
            panic!("subscriber bug");
        }
    }

    fn replay() -> GateEvent {
        GateEvent::IdempotentReplay {
            operation: "orders.create".to_string(),
            key: "550e8400-e29b-41d4".to_string(),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(replay()).unwrap();
        assert_eq!(json["type"], "idempotent_replay");
        assert_eq!(json["operation"], "orders.create");
        assert_eq!(replay().name(), "idempotent_replay");
    }

    #[test]
    fn test_emit_quietly_swallows_errors_and_panics() {
        emit_quietly(&Failing, &replay());
        emit_quietly(&Panicking, &replay());
    }

    #[test]
    fn test_fanout_continues_past_failures() {
        let collecting = Arc::new(Collecting::default());
        let fanout = FanoutSink::new()
            .with(Arc::new(Failing))
            .with(Arc::new(Panicking))
            .with(collecting.clone());
        assert_eq!(fanout.len(), 3);

        fanout.emit(&replay()).unwrap();
        assert_eq!(collecting.0.lock().unwrap().as_slice(), &[replay()]);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(&replay()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), replay());
    }

    #[test]
    fn test_broadcast_sink_without_subscribers_is_ok() {
        assert!(BroadcastSink::new(1).emit(&replay()).is_ok());
    }

    #[test]
    fn test_truncate_key() {
        assert_eq!(truncate_key("550e8400-e29b"), "550e8400");
        assert_eq!(truncate_key("short"), "short");
    }
}
