//! Spectrum recorder service.
//!
//! One actor owns the recorder/replayer mode exclusively: recording and
//! replaying never run at the same time. Commands arrive through
//! [`SpectrumHandle`]; FFT packets and control events arrive on their own
//! channels from the ingest layer.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::replayer::ReplayTask;
use super::{
    discard_orphans, delete_recording, list_recordings, load_recording, write_recording,
    RecordedEvent, RecordedPacket, RecordingFile, RecordingMetadata,
};
use crate::error::{TrunklineError, TrunklineResult};
use crate::events::{ControlChannelEvent, ControlEventKind, EventEmitter};
use crate::hub::BroadcastHub;
use crate::ingest::fft::FftPacket;
use crate::utils::now_millis;

enum SpectrumCommand {
    StartRecording {
        duration_secs: u64,
        name: Option<String>,
        reply: oneshot::Sender<TrunklineResult<String>>,
    },
    StopRecording {
        reply: oneshot::Sender<TrunklineResult<RecordingMetadata>>,
    },
    StartReplay {
        id: String,
        looped: bool,
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    PauseReplay {
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    ResumeReplay {
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    StopReplay {
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<RecordingMetadata>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
}

/// Cloneable handle to the spectrum service.
#[derive(Clone)]
pub struct SpectrumHandle {
    tx: mpsc::Sender<SpectrumCommand>,
}

impl SpectrumHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SpectrumCommand,
    ) -> TrunklineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| TrunklineError::ChannelClosed("spectrum service"))?;
        rx.await
            .map_err(|_| TrunklineError::ChannelClosed("spectrum service"))
    }

    /// Starts a recording capped at `duration_secs`; returns the new ID.
    pub async fn start_recording(
        &self,
        duration_secs: u64,
        name: Option<String>,
    ) -> TrunklineResult<String> {
        self.request(|reply| SpectrumCommand::StartRecording {
            duration_secs,
            name,
            reply,
        })
        .await?
    }

    /// Stops the active recording and finalizes it to disk.
    pub async fn stop_recording(&self) -> TrunklineResult<RecordingMetadata> {
        self.request(|reply| SpectrumCommand::StopRecording { reply })
            .await?
    }

    /// Starts replaying a recording, preserving inter-packet timing.
    pub async fn start_replay(&self, id: &str, looped: bool) -> TrunklineResult<()> {
        let id = id.to_string();
        self.request(move |reply| SpectrumCommand::StartReplay { id, looped, reply })
            .await?
    }

    pub async fn pause_replay(&self) -> TrunklineResult<()> {
        self.request(|reply| SpectrumCommand::PauseReplay { reply })
            .await?
    }

    pub async fn resume_replay(&self) -> TrunklineResult<()> {
        self.request(|reply| SpectrumCommand::ResumeReplay { reply })
            .await?
    }

    pub async fn stop_replay(&self) -> TrunklineResult<()> {
        self.request(|reply| SpectrumCommand::StopReplay { reply })
            .await?
    }

    /// Metadata of every finalized recording, newest first.
    pub async fn list(&self) -> TrunklineResult<Vec<RecordingMetadata>> {
        self.request(|reply| SpectrumCommand::List { reply }).await
    }

    pub async fn delete(&self, id: &str) -> TrunklineResult<()> {
        let id = id.to_string();
        self.request(move |reply| SpectrumCommand::Delete { id, reply })
            .await?
    }
}

struct RecordingState {
    id: String,
    name: String,
    started_at: Instant,
    start_wall: u64,
    deadline: Instant,
    packets: Vec<RecordedPacket>,
    events: Vec<RecordedEvent>,
    transmissions: usize,
    talkgroups: HashSet<u64>,
    center_freq: u64,
    sample_rate: u32,
    fft_size: u32,
    min_freq: u64,
    max_freq: u64,
    have_params: bool,
}

enum Mode {
    Idle,
    Recording(RecordingState),
    Replaying {
        id: String,
        cancel: CancellationToken,
        paused: watch::Sender<bool>,
    },
}

/// The spectrum recorder/replayer actor.
pub struct SpectrumService {
    dir: PathBuf,
    rx: mpsc::Receiver<SpectrumCommand>,
    fft_rx: mpsc::Receiver<FftPacket>,
    control_rx: mpsc::Receiver<ControlChannelEvent>,
    hub: Arc<BroadcastHub>,
    emitter: Arc<dyn EventEmitter>,
    /// Spectrum defaults used until the first packet provides real values.
    default_center_freq: u64,
    default_sample_rate: u32,
    mode: Mode,
    done_tx: mpsc::Sender<String>,
    done_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl SpectrumService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: PathBuf,
        fft_rx: mpsc::Receiver<FftPacket>,
        control_rx: mpsc::Receiver<ControlChannelEvent>,
        hub: Arc<BroadcastHub>,
        emitter: Arc<dyn EventEmitter>,
        default_center_freq: u64,
        default_sample_rate: u32,
        cancel: CancellationToken,
    ) -> (Self, SpectrumHandle) {
        let (tx, rx) = mpsc::channel(32);
        let (done_tx, done_rx) = mpsc::channel(4);
        (
            Self {
                dir,
                rx,
                fft_rx,
                control_rx,
                hub,
                emitter,
                default_center_freq,
                default_sample_rate,
                mode: Mode::Idle,
                done_tx,
                done_rx,
                cancel,
            },
            SpectrumHandle { tx },
        )
    }

    /// Actor loop. Runs until cancelled.
    pub async fn run(mut self) {
        let removed = discard_orphans(&self.dir);
        if removed > 0 {
            log::info!("[Spectrum] Discarded {} orphaned recording(s)", removed);
        }

        let mut deadline_check = tokio::time::interval(Duration::from_millis(250));
        deadline_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Mode::Replaying { cancel, .. } = &self.mode {
                        cancel.cancel();
                    }
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(packet) = self.fft_rx.recv() => self.on_packet(packet),
                Some(event) = self.control_rx.recv() => self.on_control(event),
                Some(finished) = self.done_rx.recv() => {
                    if let Mode::Replaying { id, .. } = &self.mode {
                        if *id == finished {
                            log::info!("[Spectrum] Replay of {} finished", finished);
                            self.mode = Mode::Idle;
                        }
                    }
                }
                _ = deadline_check.tick() => {
                    if let Mode::Recording(state) = &self.mode {
                        if Instant::now() >= state.deadline {
                            self.finalize_active();
                        }
                    }
                }
            }
        }
        log::info!("[Spectrum] Service stopped");
    }

    fn on_command(&mut self, command: SpectrumCommand) {
        match command {
            SpectrumCommand::StartRecording {
                duration_secs,
                name,
                reply,
            } => {
                let _ = reply.send(self.start_recording(duration_secs, name));
            }
            SpectrumCommand::StopRecording { reply } => {
                let result = match std::mem::replace(&mut self.mode, Mode::Idle) {
                    Mode::Recording(state) => self.finalize(state),
                    other => {
                        self.mode = other;
                        Err(TrunklineError::NotFound("no active recording".into()))
                    }
                };
                let _ = reply.send(result);
            }
            SpectrumCommand::StartReplay { id, looped, reply } => {
                let _ = reply.send(self.start_replay(&id, looped));
            }
            SpectrumCommand::PauseReplay { reply } => {
                let _ = reply.send(self.set_paused(true));
            }
            SpectrumCommand::ResumeReplay { reply } => {
                let _ = reply.send(self.set_paused(false));
            }
            SpectrumCommand::StopReplay { reply } => {
                let result = match std::mem::replace(&mut self.mode, Mode::Idle) {
                    Mode::Replaying { cancel, .. } => {
                        cancel.cancel();
                        Ok(())
                    }
                    other => {
                        self.mode = other;
                        Err(TrunklineError::NotFound("no active replay".into()))
                    }
                };
                let _ = reply.send(result);
            }
            SpectrumCommand::List { reply } => {
                let _ = reply.send(list_recordings(&self.dir));
            }
            SpectrumCommand::Delete { id, reply } => {
                let _ = reply.send(delete_recording(&self.dir, &id));
            }
        }
    }

    fn start_recording(
        &mut self,
        duration_secs: u64,
        name: Option<String>,
    ) -> TrunklineResult<String> {
        match self.mode {
            Mode::Replaying { .. } => {
                return Err(TrunklineError::SpectrumBusy("replay active".into()));
            }
            Mode::Recording(_) => {
                return Err(TrunklineError::SpectrumBusy("recording active".into()));
            }
            Mode::Idle => {}
        }

        let id = format!("rec-{}", Uuid::new_v4().simple());
        let now = Instant::now();
        log::info!(
            "[Spectrum] Recording {} started ({} s cap)",
            id,
            duration_secs
        );
        self.mode = Mode::Recording(RecordingState {
            id: id.clone(),
            name: name.unwrap_or_else(|| id.clone()),
            started_at: now,
            start_wall: now_millis(),
            deadline: now + Duration::from_secs(duration_secs),
            packets: Vec::new(),
            events: Vec::new(),
            transmissions: 0,
            talkgroups: HashSet::new(),
            center_freq: self.default_center_freq,
            sample_rate: self.default_sample_rate,
            fft_size: 0,
            min_freq: 0,
            max_freq: 0,
            have_params: false,
        });
        Ok(id)
    }

    fn start_replay(&mut self, id: &str, looped: bool) -> TrunklineResult<()> {
        match self.mode {
            Mode::Recording(_) => {
                return Err(TrunklineError::SpectrumBusy("recording active".into()));
            }
            Mode::Replaying { .. } => {
                return Err(TrunklineError::SpectrumBusy("replay active".into()));
            }
            Mode::Idle => {}
        }

        let file = load_recording(&self.dir, id)?;
        let cancel = self.cancel.child_token();
        let (paused_tx, paused_rx) = watch::channel(false);

        log::info!(
            "[Spectrum] Replaying {} ({} packets, loop={})",
            id,
            file.packets.len(),
            looped
        );
        let task = ReplayTask {
            file,
            hub: Arc::clone(&self.hub),
            emitter: Arc::clone(&self.emitter),
            looped,
            cancel: cancel.clone(),
            paused: paused_rx,
            done_tx: self.done_tx.clone(),
        };
        tokio::spawn(task.run());

        self.mode = Mode::Replaying {
            id: id.to_string(),
            cancel,
            paused: paused_tx,
        };
        Ok(())
    }

    fn set_paused(&mut self, value: bool) -> TrunklineResult<()> {
        match &self.mode {
            Mode::Replaying { paused, .. } => {
                let _ = paused.send(value);
                Ok(())
            }
            _ => Err(TrunklineError::NotFound("no active replay".into())),
        }
    }

    fn on_packet(&mut self, packet: FftPacket) {
        let finalize = if let Mode::Recording(state) = &mut self.mode {
            if !state.have_params && packet.fft_size > 0 {
                state.center_freq = packet.center_freq;
                state.sample_rate = packet.sample_rate;
                state.fft_size = packet.fft_size;
                state.min_freq = packet.min_freq;
                state.max_freq = packet.max_freq;
                state.have_params = true;
            }
            state.packets.push(RecordedPacket {
                timestamp: packet.timestamp,
                relative_time: state.started_at.elapsed().as_millis() as u64,
                magnitudes: packet.magnitudes,
            });
            Instant::now() >= state.deadline
        } else {
            false
        };
        if finalize {
            self.finalize_active();
        }
    }

    fn on_control(&mut self, event: ControlChannelEvent) {
        if let Mode::Recording(state) = &mut self.mode {
            if event.kind == ControlEventKind::Grant {
                state.transmissions += 1;
            }
            if let Some(tg) = event.talkgroup {
                state.talkgroups.insert(tg);
            }
            state.events.push(RecordedEvent {
                relative_time: state.started_at.elapsed().as_millis() as u64,
                event,
            });
        }
    }

    fn finalize_active(&mut self) {
        if let Mode::Recording(state) = std::mem::replace(&mut self.mode, Mode::Idle) {
            match self.finalize(state) {
                Ok(metadata) => {
                    log::info!(
                        "[Spectrum] Recording {} finalized: {} packets, {} events",
                        metadata.id,
                        metadata.packet_count,
                        metadata.control_channel_events
                    );
                }
                Err(e) => log::error!("[Spectrum] Failed to finalize recording: {}", e),
            }
        }
    }

    fn finalize(&self, state: RecordingState) -> TrunklineResult<RecordingMetadata> {
        let end_wall = now_millis();
        let mut metadata = RecordingMetadata {
            id: state.id.clone(),
            name: state.name,
            start_time: state.start_wall,
            end_time: end_wall,
            duration: state.started_at.elapsed().as_secs_f64(),
            center_freq: state.center_freq,
            sample_rate: state.sample_rate,
            fft_size: state.fft_size,
            min_freq: state.min_freq,
            max_freq: state.max_freq,
            packet_count: state.packets.len(),
            control_channel_events: state.events.len(),
            transmissions: state.transmissions,
            unique_talkgroups: state.talkgroups.len(),
            file_size: 0,
        };
        let file = RecordingFile {
            metadata: metadata.clone(),
            packets: state.packets,
            control_channel_events: state.events,
        };
        write_recording(&self.dir, &file)?;
        metadata.file_size = std::fs::metadata(self.dir.join(&metadata.id))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::hub::BroadcastHub;

    fn packet(ts: u64) -> FftPacket {
        FftPacket {
            source_index: 0,
            center_freq: 852_000_000,
            sample_rate: 2_048_000,
            timestamp: ts,
            fft_size: 2,
            min_freq: 851_000_000,
            max_freq: 853_000_000,
            magnitudes: vec![-100.0, -90.0],
        }
    }

    struct Harness {
        handle: SpectrumHandle,
        fft_tx: mpsc::Sender<FftPacket>,
        control_tx: mpsc::Sender<ControlChannelEvent>,
        cancel: CancellationToken,
    }

    fn harness(dir: PathBuf) -> Harness {
        let (fft_tx, fft_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(64);
        let hub = Arc::new(BroadcastHub::new(64, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let (service, handle) = SpectrumService::new(
            dir,
            fft_rx,
            control_rx,
            hub,
            Arc::new(NoopEventEmitter),
            852_000_000,
            2_048_000,
            cancel.clone(),
        );
        tokio::spawn(service.run());
        Harness {
            handle,
            fft_tx,
            control_tx,
            cancel,
        }
    }

    #[tokio::test]
    async fn record_capture_stop_readback() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path().to_path_buf());

        let id = h.handle.start_recording(60, Some("capture".into())).await.unwrap();

        for i in 0..3 {
            h.fft_tx.send(packet(1_000 + i)).await.unwrap();
        }
        let mut grant = ControlChannelEvent::new(
            ControlEventKind::Grant,
            1_500,
            "TG: 927 Starting P25 Recorder num [0]".into(),
        );
        grant.talkgroup = Some(927);
        h.control_tx.send(grant).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let metadata = h.handle.stop_recording().await.unwrap();
        assert_eq!(metadata.id, id);
        assert_eq!(metadata.packet_count, 3);
        assert_eq!(metadata.control_channel_events, 1);
        assert_eq!(metadata.transmissions, 1);
        assert_eq!(metadata.unique_talkgroups, 1);
        assert!(metadata.file_size > 0);
        assert_eq!(metadata.center_freq, 852_000_000);

        let list = h.handle.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].packet_count, 3);

        h.handle.delete(&id).await.unwrap();
        assert!(h.handle.list().await.unwrap().is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn recording_rejected_while_replaying() {
        let dir = tempfile::tempdir().unwrap();
        // Seed one recording to replay.
        super::super::write_recording(dir.path(), &super::super::tests::sample_file("rec-seed"))
            .unwrap();

        let h = harness(dir.path().to_path_buf());
        h.handle.start_replay("rec-seed", true).await.unwrap();

        let err = h.handle.start_recording(10, None).await.unwrap_err();
        assert!(err.to_string().contains("replay active"));

        // Replaying twice is also rejected.
        assert!(h.handle.start_replay("rec-seed", false).await.is_err());

        h.handle.stop_replay().await.unwrap();
        // Now recording is allowed again.
        let id = h.handle.start_recording(10, None).await.unwrap();
        assert!(id.starts_with("rec-"));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn stop_without_recording_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path().to_path_buf());
        assert!(h.handle.stop_recording().await.is_err());
        assert!(h.handle.pause_replay().await.is_err());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn duration_cap_finalizes_recording() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path().to_path_buf());

        h.handle.start_recording(0, None).await.unwrap();
        // The deadline check tick finalizes the zero-length recording.
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(h.handle.list().await.unwrap().len(), 1);
        // Mode is Idle again: a new recording can start.
        assert!(h.handle.start_recording(10, None).await.is_ok());
        h.cancel.cancel();
    }
}
