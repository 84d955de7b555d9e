//! Spectrum replay task.
//!
//! Replays a recording's packets and control events on their original
//! timeline: each item's target wall clock is `replay_start +
//! relative_time`. Sleeps are cancellable; pause freezes the offset and
//! resume continues. With `loop` enabled the timeline wraps back to zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::RecordingFile;
use crate::events::{EventEmitter, HubEvent};
use crate::hub::BroadcastHub;
use crate::ingest::fft::FftPacket;
use crate::protocol_constants::{REPLAY_PROGRESS_MS, REPLAY_PROGRESS_PACKET_INTERVAL};

#[derive(Clone, Copy)]
enum StepKind {
    Packet(usize),
    Event(usize),
}

struct Step {
    at_ms: u64,
    kind: StepKind,
}

pub(crate) struct ReplayTask {
    pub file: RecordingFile,
    pub hub: Arc<BroadcastHub>,
    pub emitter: Arc<dyn EventEmitter>,
    pub looped: bool,
    pub cancel: CancellationToken,
    pub paused: watch::Receiver<bool>,
    pub done_tx: mpsc::Sender<String>,
}

impl ReplayTask {
    pub(crate) async fn run(mut self) {
        let id = self.file.metadata.id.clone();
        let total_packets = self.file.packets.len().max(1);

        // Merge packets and events into one timeline, ordered by offset.
        let mut steps: Vec<Step> = self
            .file
            .packets
            .iter()
            .enumerate()
            .map(|(i, p)| Step {
                at_ms: p.relative_time,
                kind: StepKind::Packet(i),
            })
            .chain(
                self.file
                    .control_channel_events
                    .iter()
                    .enumerate()
                    .map(|(i, e)| Step {
                        at_ms: e.relative_time,
                        kind: StepKind::Event(i),
                    }),
            )
            .collect();
        steps.sort_by_key(|s| s.at_ms);

        'replay: loop {
            let mut replay_start = Instant::now();
            let mut emitted_packets = 0usize;
            let mut packets_since_progress = 0usize;
            let mut last_progress = Instant::now();

            for step in &steps {
                if !self.wait_until(step.at_ms, &mut replay_start).await {
                    break 'replay;
                }
                match step.kind {
                    StepKind::Packet(i) => {
                        let recorded = &self.file.packets[i];
                        let meta = &self.file.metadata;
                        self.hub.publish_fft(&FftPacket {
                            source_index: 0,
                            center_freq: meta.center_freq,
                            sample_rate: meta.sample_rate,
                            timestamp: recorded.timestamp,
                            fft_size: meta.fft_size,
                            min_freq: meta.min_freq,
                            max_freq: meta.max_freq,
                            magnitudes: recorded.magnitudes.clone(),
                        });
                        emitted_packets += 1;
                        packets_since_progress += 1;
                    }
                    StepKind::Event(i) => {
                        self.emitter.emit(HubEvent::ControlChannel(
                            self.file.control_channel_events[i].event.clone(),
                        ));
                    }
                }

                if packets_since_progress >= REPLAY_PROGRESS_PACKET_INTERVAL
                    || last_progress.elapsed() >= Duration::from_millis(REPLAY_PROGRESS_MS)
                {
                    self.emitter.emit(HubEvent::ReplayProgress {
                        recording_id: id.clone(),
                        percent: emitted_packets as f32 / total_packets as f32 * 100.0,
                    });
                    packets_since_progress = 0;
                    last_progress = Instant::now();
                }
            }

            if !self.looped {
                break;
            }
            log::debug!("[Spectrum] Replay {} wrapping", id);
        }

        self.emitter.emit(HubEvent::ReplayProgress {
            recording_id: id.clone(),
            percent: 100.0,
        });
        let _ = self.done_tx.send(id).await;
    }

    /// Sleeps until `replay_start + offset_ms`, handling pause and
    /// cancellation. Pause shifts `replay_start` forward by the paused span,
    /// which freezes the timeline offset. Returns false when cancelled.
    async fn wait_until(&mut self, offset_ms: u64, replay_start: &mut Instant) -> bool {
        loop {
            if *self.paused.borrow() {
                let pause_started = Instant::now();
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        changed = self.paused.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                            if !*self.paused.borrow() {
                                break;
                            }
                        }
                    }
                }
                *replay_start += pause_started.elapsed();
            }

            let target = *replay_start + Duration::from_millis(offset_ms);
            if Instant::now() >= target {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    // Re-evaluate pause state at the top of the loop.
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(target)) => {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ControlChannelEvent, ControlEventKind, EventEmitter};
    use crate::spectrum::{RecordedEvent, RecordedPacket, RecordingFile, RecordingMetadata};
    use parking_lot::Mutex;

    struct CollectingEmitter {
        events: Mutex<Vec<HubEvent>>,
    }

    impl EventEmitter for CollectingEmitter {
        fn emit(&self, event: HubEvent) {
            self.events.lock().push(event);
        }
    }

    fn recording(packet_count: u64, spacing_ms: u64, event_offsets: &[u64]) -> RecordingFile {
        RecordingFile {
            metadata: RecordingMetadata {
                id: "rec-replay".into(),
                name: "replay test".into(),
                start_time: 0,
                end_time: packet_count * spacing_ms,
                duration: (packet_count * spacing_ms) as f64 / 1000.0,
                center_freq: 852_000_000,
                sample_rate: 2_048_000,
                fft_size: 2,
                min_freq: 851_000_000,
                max_freq: 853_000_000,
                packet_count: packet_count as usize,
                control_channel_events: event_offsets.len(),
                transmissions: 0,
                unique_talkgroups: 0,
                file_size: 0,
            },
            packets: (0..packet_count)
                .map(|i| RecordedPacket {
                    timestamp: i * spacing_ms,
                    relative_time: i * spacing_ms,
                    magnitudes: vec![-100.0, -90.0],
                })
                .collect(),
            control_channel_events: event_offsets
                .iter()
                .map(|&offset| RecordedEvent {
                    event: ControlChannelEvent::new(
                        ControlEventKind::Grant,
                        offset,
                        format!("grant at {}", offset),
                    ),
                    relative_time: offset,
                })
                .collect(),
        }
    }

    fn task(
        file: RecordingFile,
        looped: bool,
    ) -> (
        ReplayTask,
        Arc<BroadcastHub>,
        Arc<CollectingEmitter>,
        watch::Sender<bool>,
        CancellationToken,
        mpsc::Receiver<String>,
    ) {
        let hub = Arc::new(BroadcastHub::new(1024, Duration::from_secs(5)));
        let emitter = Arc::new(CollectingEmitter {
            events: Mutex::new(Vec::new()),
        });
        let (paused_tx, paused_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel(1);
        let task = ReplayTask {
            file,
            hub: Arc::clone(&hub),
            emitter: emitter.clone() as Arc<dyn EventEmitter>,
            looped,
            cancel: cancel.clone(),
            paused: paused_rx,
            done_tx,
        };
        (task, hub, emitter, paused_tx, cancel, done_rx)
    }

    #[tokio::test]
    async fn replay_preserves_inter_packet_timing() {
        // 10 packets 20 ms apart, events at 50 ms and 150 ms.
        let (task, hub, emitter, _paused, _cancel, mut done_rx) =
            task(recording(10, 20, &[50, 150]), false);
        let subscriber = hub.register().unwrap();
        subscriber.set_fft_enabled(true);

        let started = Instant::now();
        task.run().await;
        let elapsed = started.elapsed();

        // Last packet sits at 180 ms; allow scheduler slack.
        assert!(elapsed >= Duration::from_millis(180), "too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "too slow: {:?}", elapsed);

        assert_eq!(subscriber.queue_len(), 10);
        let events = emitter.events.lock();
        let control = events
            .iter()
            .filter(|e| matches!(e, HubEvent::ControlChannel(_)))
            .count();
        assert_eq!(control, 2);
        // Final 100% progress always lands.
        assert!(events
            .iter()
            .any(|e| matches!(e, HubEvent::ReplayProgress { percent, .. } if *percent == 100.0)));
        drop(events);

        assert_eq!(done_rx.recv().await.unwrap(), "rec-replay");
    }

    #[tokio::test]
    async fn pause_freezes_the_timeline() {
        let (task, hub, _emitter, paused, _cancel, mut done_rx) =
            task(recording(3, 40, &[]), false);
        let subscriber = hub.register().unwrap();
        subscriber.set_fft_enabled(true);

        let started = Instant::now();
        let join = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        paused.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        paused.send(false).unwrap();

        join.await.unwrap();
        let elapsed = started.elapsed();
        // 80 ms of timeline plus ~150 ms paused.
        assert!(elapsed >= Duration::from_millis(200), "pause ignored: {:?}", elapsed);
        assert_eq!(subscriber.queue_len(), 3);
        assert!(done_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn looped_replay_wraps_until_cancelled() {
        let (task, hub, _emitter, _paused, cancel, mut done_rx) =
            task(recording(3, 10, &[]), true);
        let subscriber = hub.register().unwrap();
        subscriber.set_fft_enabled(true);

        let join = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        join.await.unwrap();

        // More frames than one pass of the recording.
        assert!(subscriber.queue_len() > 3);
        assert!(done_rx.recv().await.is_some());
    }
}
