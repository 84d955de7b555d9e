//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than the broadcast
//! hub directly, enabling testing and alternative transports.

use super::HubEvent;

/// Trait for emitting domain events without knowledge of transport.
///
/// The correlator, log tailer, status endpoint and spectrum replayer use
/// this trait to publish textual events; the concrete delivery (subscriber
/// queues, filtering) lives behind [`super::HubEventBridge`].
pub trait EventEmitter: Send + Sync {
    /// Emits an event toward subscribed clients.
    fn emit(&self, event: HubEvent);
}

/// No-op emitter for tests and detached components.
///
/// Events are silently discarded.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: HubEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level. Useful for tracing event flow without a
/// connected subscriber.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: HubEvent) {
        tracing::debug!(?event, "hub_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events.
    pub(crate) struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: HubEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit(HubEvent::Error {
            error: "one".into(),
        });
        emitter.emit(HubEvent::Error {
            error: "two".into(),
        });

        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }
}
