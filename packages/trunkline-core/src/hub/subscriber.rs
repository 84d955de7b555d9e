//! Subscriber state: topic filters, bounded outbound queue, eviction policy.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Which talkgroup/channel keys a subscriber wants call and audio traffic for.
///
/// `All` is the wildcard a subscriber starts in (and returns to via
/// `subscribe_all`). An explicitly emptied `Only` set matches nothing; it is
/// NOT promoted back to the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    All,
    Only(HashSet<u64>),
}

impl TopicFilter {
    /// Returns whether the filter matches a channel key.
    #[must_use]
    pub fn matches(&self, key: u64) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(&key),
        }
    }

    /// Unions the given keys into the filter, materializing the wildcard.
    pub fn subscribe(&mut self, keys: &[u64]) {
        match self {
            Self::All => {
                *self = Self::Only(keys.iter().copied().collect());
            }
            Self::Only(set) => {
                set.extend(keys.iter().copied());
            }
        }
    }

    /// Subtracts the given keys. A wildcard that was never materialized is
    /// left untouched.
    pub fn unsubscribe(&mut self, keys: &[u64]) {
        if let Self::Only(set) = self {
            for key in keys {
                set.remove(key);
            }
        }
    }

    /// Resets to the wildcard.
    pub fn subscribe_all(&mut self) {
        *self = Self::All;
    }
}

/// One message queued for delivery to a subscriber.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// JSON text message.
    Text(String),
    /// Framed binary message (audio or FFT).
    Binary(Bytes),
}

impl OutboundMessage {
    /// Binary messages are evicted before text on queue overflow.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

struct OutboundQueue {
    deque: VecDeque<OutboundMessage>,
    /// Set when the queue first overflowed; cleared when pressure subsides.
    overflow_since: Option<Instant>,
}

/// A connected broadcast client.
///
/// Owned by the hub for the lifetime of its transport connection. The
/// outbound queue is bounded: on overflow the oldest binary message is
/// evicted first, then the oldest text message; overflow sustained beyond
/// the eviction window closes the subscriber with reason "slow consumer".
pub struct Subscriber {
    id: String,
    filter: RwLock<TopicFilter>,
    audio_enabled: AtomicBool,
    fft_enabled: AtomicBool,
    queue: Mutex<OutboundQueue>,
    capacity: usize,
    eviction_window: Duration,
    notify: Notify,
    cancel: CancellationToken,
    close_reason: Mutex<Option<String>>,
}

impl Subscriber {
    pub(crate) fn new(
        id: String,
        capacity: usize,
        eviction_window: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            filter: RwLock::new(TopicFilter::All),
            audio_enabled: AtomicBool::new(false),
            fft_enabled: AtomicBool::new(false),
            queue: Mutex::new(OutboundQueue {
                deque: VecDeque::with_capacity(capacity.min(64)),
                overflow_since: None,
            }),
            capacity,
            eviction_window,
            notify: Notify::new(),
            cancel,
            close_reason: Mutex::new(None),
        }
    }

    /// Returns the stable subscriber ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn fft_enabled(&self) -> bool {
        self.fft_enabled.load(Ordering::Relaxed)
    }

    pub fn set_fft_enabled(&self, enabled: bool) {
        self.fft_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Returns whether the topic filter matches a channel key.
    pub fn wants_topic(&self, key: u64) -> bool {
        self.filter.read().matches(key)
    }

    /// Audio traffic requires the audio flag AND a topic match.
    pub fn wants_audio(&self, key: u64) -> bool {
        self.audio_enabled() && self.wants_topic(key)
    }

    pub fn subscribe(&self, keys: &[u64]) {
        self.filter.write().subscribe(keys);
    }

    pub fn unsubscribe(&self, keys: &[u64]) {
        self.filter.write().unsubscribe(keys);
    }

    pub fn subscribe_all(&self) {
        self.filter.write().subscribe_all();
    }

    /// Enqueues a message, applying the overflow policy.
    ///
    /// Never blocks. Returns `false` if the subscriber is already closed.
    pub fn enqueue(&self, msg: OutboundMessage) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let mut close = false;
        {
            let mut q = self.queue.lock();
            if q.deque.len() >= self.capacity {
                // Evict oldest binary first, then oldest text.
                if let Some(pos) = q.deque.iter().position(OutboundMessage::is_binary) {
                    q.deque.remove(pos);
                } else {
                    q.deque.pop_front();
                }

                let now = Instant::now();
                let since = *q.overflow_since.get_or_insert(now);
                if now.duration_since(since) > self.eviction_window {
                    close = true;
                }
            } else {
                q.overflow_since = None;
            }
            q.deque.push_back(msg);
        }

        if close {
            self.close("slow consumer");
            return false;
        }

        self.notify.notify_one();
        true
    }

    /// Drains every queued message, clearing overflow pressure.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        let mut q = self.queue.lock();
        q.overflow_since = None;
        q.deque.drain(..).collect()
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().deque.len()
    }

    /// Resolves when new messages are available.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Token cancelled when the subscriber is closed (slow consumer,
    /// shutdown).
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Closes the subscriber with the given reason. Idempotent.
    pub fn close(&self, reason: &str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.cancel.cancel();
        self.notify.notify_one();
        log::info!("[Hub] Subscriber {} closed: {}", self.id, reason);
    }

    /// The reason the subscriber was closed, if it was.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<OutboundMessage> {
        self.queue.lock().deque.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(capacity: usize, window_ms: u64) -> Subscriber {
        Subscriber::new(
            "ws-1".into(),
            capacity,
            Duration::from_millis(window_ms),
            CancellationToken::new(),
        )
    }

    fn binary(n: u8) -> OutboundMessage {
        OutboundMessage::Binary(Bytes::from(vec![n]))
    }

    #[test]
    fn wildcard_matches_everything() {
        let mut filter = TopicFilter::All;
        assert!(filter.matches(927));
        assert!(filter.matches(0));

        // unsubscribe on an unmaterialized wildcard is a no-op
        filter.unsubscribe(&[927]);
        assert!(filter.matches(927));
    }

    #[test]
    fn emptied_set_is_not_a_wildcard() {
        let mut filter = TopicFilter::All;
        filter.subscribe(&[927]);
        assert!(filter.matches(927));
        assert!(!filter.matches(928));

        filter.unsubscribe(&[927]);
        assert!(!filter.matches(927));
        assert_eq!(filter, TopicFilter::Only(HashSet::new()));

        filter.subscribe_all();
        assert!(filter.matches(927));
    }

    #[test]
    fn overflow_keeps_latest_binary_frames() {
        let sub = subscriber(4, 5_000);
        for n in 1..=6u8 {
            sub.enqueue(binary(n));
        }

        let queued = sub.queued();
        assert_eq!(queued.len(), 4);
        let bytes: Vec<u8> = queued
            .iter()
            .map(|m| match m {
                OutboundMessage::Binary(b) => b[0],
                OutboundMessage::Text(_) => unreachable!(),
            })
            .collect();
        assert_eq!(bytes, vec![3, 4, 5, 6]);
        assert!(sub.close_reason().is_none());
    }

    #[test]
    fn overflow_evicts_binary_before_text() {
        let sub = subscriber(3, 5_000);
        sub.enqueue(OutboundMessage::Text("a".into()));
        sub.enqueue(binary(1));
        sub.enqueue(OutboundMessage::Text("b".into()));
        // Queue is full: the binary goes first even though a text is older.
        sub.enqueue(OutboundMessage::Text("c".into()));

        let queued = sub.queued();
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().all(|m| !m.is_binary()));
    }

    #[test]
    fn sustained_overflow_closes_slow_consumer() {
        let sub = subscriber(2, 20);
        sub.enqueue(binary(1));
        sub.enqueue(binary(2));
        sub.enqueue(binary(3)); // first overflow, window starts
        std::thread::sleep(Duration::from_millis(40));
        sub.enqueue(binary(4)); // still overflowing past the window

        assert_eq!(sub.close_reason().as_deref(), Some("slow consumer"));
        assert!(sub.cancel_token().is_cancelled());
    }

    #[test]
    fn drain_clears_overflow_pressure() {
        let sub = subscriber(2, 20);
        sub.enqueue(binary(1));
        sub.enqueue(binary(2));
        sub.enqueue(binary(3));
        assert_eq!(sub.drain().len(), 2);
        std::thread::sleep(Duration::from_millis(40));
        // Pressure was cleared by the drain: the old window no longer counts.
        sub.enqueue(binary(4));
        assert!(sub.close_reason().is_none());
    }
}
