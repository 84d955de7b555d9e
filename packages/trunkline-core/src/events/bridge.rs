//! Bridge implementation that maps domain events to the broadcast hub.
//!
//! The [`HubEventBridge`] lives at the boundary between domain services and
//! transport concerns: services emit typed [`HubEvent`]s through the
//! [`EventEmitter`] trait without holding a hub reference themselves.

use std::sync::Arc;

use super::emitter::EventEmitter;
use super::HubEvent;
use crate::hub::BroadcastHub;

/// Bridges domain events to the subscriber-filtered broadcast hub.
#[derive(Clone)]
pub struct HubEventBridge {
    hub: Arc<BroadcastHub>,
}

impl HubEventBridge {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }
}

impl EventEmitter for HubEventBridge {
    fn emit(&self, event: HubEvent) {
        tracing::trace!(?event, "hub_event");
        self.hub.publish_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bridge_delivers_to_registered_subscribers() {
        let hub = Arc::new(BroadcastHub::new(16, Duration::from_secs(5)));
        let subscriber = hub.register().unwrap();
        let bridge = HubEventBridge::new(Arc::clone(&hub));

        bridge.emit(HubEvent::Error {
            error: "ping".into(),
        });
        assert_eq!(subscriber.queue_len(), 1);
    }
}
