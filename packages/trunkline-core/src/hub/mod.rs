//! Subscription-filtered broadcast hub.
//!
//! Owns the subscriber set and routes three traffic classes:
//!
//! - textual [`HubEvent`]s, filtered per the event's [`Routing`]
//! - binary audio frames (audio-enabled subscribers with a topic match)
//! - binary FFT frames (fft-enabled subscribers)
//!
//! Framing is skipped entirely when no subscriber wants a binary message.
//! Per-subscriber delivery is FIFO through an isolated bounded queue, so a
//! slow consumer never delays a fast one; sustained overflow evicts the
//! subscriber (see [`subscriber`]).

pub mod frame;
pub mod subscriber;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{HubEvent, Routing};
use crate::ingest::audio::EnrichedAudioFrame;
use crate::ingest::fft::FftPacket;
use subscriber::{OutboundMessage, Subscriber};

/// The broadcast hub. Shared as `Arc` across the WS layer and event sources.
pub struct BroadcastHub {
    subscribers: DashMap<String, Arc<Subscriber>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    queue_capacity: usize,
    eviction_window: Duration,
    frames_sent: AtomicU64,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize, eviction_window: Duration) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            queue_capacity,
            eviction_window,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber, or `None` once shutdown has begun.
    pub fn register(&self) -> Option<Arc<Subscriber>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        let id = format!("ws-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber::new(
            id.clone(),
            self.queue_capacity,
            self.eviction_window,
            CancellationToken::new(),
        ));
        self.subscribers.insert(id.clone(), Arc::clone(&subscriber));
        log::info!(
            "[Hub] Subscriber {} registered (total: {})",
            id,
            self.subscribers.len()
        );
        Some(subscriber)
    }

    /// Removes a subscriber. Called by the WS handler on disconnect.
    pub fn unregister(&self, id: &str) {
        if self.subscribers.remove(id).is_some() {
            log::info!(
                "[Hub] Subscriber {} unregistered (remaining: {})",
                id,
                self.subscribers.len()
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stops accepting new subscribers. First step of teardown.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Closes every subscriber; returns how many were signalled.
    pub fn close_all(&self, reason: &str) -> usize {
        let count = self.subscribers.len();
        for entry in self.subscribers.iter() {
            entry.value().close(reason);
        }
        count
    }

    /// Routes a textual event to matching subscribers.
    pub fn publish_event(&self, event: &HubEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("[Hub] Event serialization failed: {}", e);
                return;
            }
        };
        let routing = event.routing();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            let wanted = match routing {
                Routing::Everyone => true,
                Routing::Topic(key) => subscriber.wants_topic(key),
                Routing::AudioTopic(key) => subscriber.wants_audio(key),
            };
            if wanted {
                subscriber.enqueue(OutboundMessage::Text(json.clone()));
            }
        }
    }

    /// Broadcasts a PCM frame to audio-enabled subscribers with a topic
    /// match. Returns whether a frame was built at all (skip-on-empty).
    pub fn publish_audio(&self, frame: &EnrichedAudioFrame) -> bool {
        let wanted: Vec<_> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().wants_audio(frame.channel_key))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if wanted.is_empty() {
            return false;
        }
        let Some(encoded) = frame::audio_frame(frame) else {
            return false;
        };
        for subscriber in wanted {
            subscriber.enqueue(OutboundMessage::Binary(encoded.clone()));
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Broadcasts an FFT packet to fft-enabled subscribers. Returns whether
    /// a frame was built at all (skip-on-empty).
    pub fn publish_fft(&self, packet: &FftPacket) -> bool {
        let wanted: Vec<_> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().fft_enabled())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if wanted.is_empty() {
            return false;
        }
        let Some(encoded) = frame::fft_frame(packet) else {
            return false;
        };
        for subscriber in wanted {
            subscriber.enqueue(OutboundMessage::Binary(encoded.clone()));
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drains the audio fan-out channel into the hub. Spawned at bootstrap.
    pub async fn pump_audio(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<EnrichedAudioFrame>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        self.publish_audio(&frame);
                    }
                    None => break,
                },
            }
        }
        log::debug!("[Hub] Audio pump stopped");
    }

    /// Drains the FFT fan-out channel into the hub. Spawned at bootstrap.
    pub async fn pump_fft(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<FftPacket>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        self.publish_fft(&packet);
                    }
                    None => break,
                },
            }
        }
        log::debug!("[Hub] FFT pump stopped");
    }

    /// Waits until every outbound queue is empty, bounded by `deadline`.
    /// Used during teardown.
    pub async fn flush(&self, deadline: Duration) {
        let start = Instant::now();
        while start.elapsed() < deadline {
            let drained = self
                .subscribers
                .iter()
                .all(|entry| entry.value().queue_len() == 0);
            if drained {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        log::warn!("[Hub] Flush deadline reached with undelivered messages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::SystemType;
    use crate::ingest::audio::AudioWireFormat;
    use bytes::Bytes;

    fn hub() -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(256, Duration::from_secs(5)))
    }

    fn audio_frame(key: u64) -> EnrichedAudioFrame {
        EnrichedAudioFrame {
            channel_key: key,
            talkgroup: key,
            frequency: Some(851_150_000),
            sample_rate: 8000,
            source: None,
            emission: None,
            alpha_tag: None,
            group_name: None,
            group_tag: None,
            description: None,
            system_type: SystemType::Trunked,
            pcm: Bytes::from_static(&[0, 1, 2, 3]),
            format: AudioWireFormat::TalkgroupOnly,
        }
    }

    fn fft_packet() -> FftPacket {
        FftPacket {
            source_index: 0,
            center_freq: 852_000_000,
            sample_rate: 2_048_000,
            timestamp: 1,
            fft_size: 2,
            min_freq: 851_000_000,
            max_freq: 853_000_000,
            magnitudes: vec![-100.0, -90.0],
        }
    }

    #[test]
    fn topic_filter_gates_call_events() {
        let hub = hub();
        let wildcard = hub.register().unwrap();
        let narrow = hub.register().unwrap();
        narrow.subscribe(&[111]);

        hub.publish_event(&HubEvent::Error {
            error: "everyone".into(),
        });
        assert_eq!(wildcard.queue_len(), 1);
        assert_eq!(narrow.queue_len(), 1);

        hub.publish_event(&HubEvent::CallStart(crate::events::CallStartEvent {
            id: "927-1".into(),
            channel_key: 927,
            talkgroup: 927,
            frequency: 851_150_000,
            label: "Control A2".into(),
            system_type: SystemType::Trunked,
            start_time: 1,
            emergency: false,
            encrypted: false,
        }));
        assert_eq!(wildcard.queue_len(), 2);
        assert_eq!(narrow.queue_len(), 1);
    }

    #[test]
    fn fft_skipped_when_nobody_listens() {
        let hub = hub();
        let subscriber = hub.register().unwrap();

        assert!(!hub.publish_fft(&fft_packet()));
        assert_eq!(subscriber.queue_len(), 0);

        subscriber.set_fft_enabled(true);
        assert!(hub.publish_fft(&fft_packet()));
        assert_eq!(subscriber.queue_len(), 1);
    }

    #[test]
    fn audio_requires_flag_and_topic() {
        let hub = hub();
        let subscriber = hub.register().unwrap();

        assert!(!hub.publish_audio(&audio_frame(927)));

        subscriber.set_audio_enabled(true);
        assert!(hub.publish_audio(&audio_frame(927)));

        subscriber.subscribe(&[111]);
        assert!(!hub.publish_audio(&audio_frame(927)));
        assert!(hub.publish_audio(&audio_frame(111)));
    }

    #[test]
    fn stop_accepting_rejects_new_subscribers() {
        let hub = hub();
        assert!(hub.register().is_some());
        hub.stop_accepting();
        assert!(hub.register().is_none());
    }

    #[test]
    fn close_all_signals_every_subscriber() {
        let hub = hub();
        let a = hub.register().unwrap();
        let b = hub.register().unwrap();
        assert_eq!(hub.close_all("shutdown"), 2);
        assert!(a.cancel_token().is_cancelled());
        assert!(b.cancel_token().is_cancelled());
    }
}
