//! Call-lifecycle correlator.
//!
//! Joins the independent ingest streams (status socket, recording sidecars,
//! control events) into canonical call-start / call-end / new-recording
//! events, maintains the active-call table, and persists completed calls.
//!
//! The correlator is a single actor consuming one command channel, which
//! serializes all operations per canonical ID by construction; the status
//! socket and the directory watcher may describe the same call, so call ends
//! are deduplicated on `(channel_key, start_time)` within a ±1 s window and
//! duplicate `new_recording` broadcasts are suppressed for 60 s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::MetadataCache;
use crate::calls::tracker::{ActiveCallInfo, ChannelTracker};
use crate::calls::{canonical_call_id, Call, CallSource, SystemType};
use crate::db::{CatalogUpsert, Store};
use crate::events::{
    CallEndEvent, CallStartEvent, ControlChannelEvent, EventEmitter, HubEvent, NewRecordingEvent,
};
use crate::ingest::status::{CallEndMsg, CallStartMsg, StatusMessage};
use crate::ingest::watcher::RecordingComplete;
use crate::protocol_constants::{
    CALLS_ACTIVE_REBROADCAST_SECS, CALL_DEDUP_WINDOW_SECS, CALL_HISTORY_LIMIT,
    NEW_RECORDING_SUPPRESS_SECS,
};
use crate::utils::{format_mhz, now_secs};

/// Inputs the correlator consumes, from all ingest components.
#[derive(Debug)]
pub enum CorrelatorInput {
    Status(StatusMessage),
    Recording(RecordingComplete),
    Control(ControlChannelEvent),
}

/// In-memory record of a currently active call.
#[derive(Debug, Clone)]
struct ActiveCall {
    id: String,
    channel_key: u64,
    talkgroup: u64,
    frequency: u64,
    label: String,
    start_time: u64,
    emergency: bool,
    encrypted: bool,
}

/// The correlator actor. Constructed at bootstrap, consumed by `run`.
pub struct Correlator {
    rx: mpsc::Receiver<CorrelatorInput>,
    store: Arc<Store>,
    cache: Arc<MetadataCache>,
    tracker: Arc<ChannelTracker>,
    emitter: Arc<dyn EventEmitter>,
    /// Canonical IDs of ended calls, for the downstream dispatch streamer.
    dispatch_ends_tx: mpsc::Sender<String>,
    system_type: SystemType,
    audio_dir: PathBuf,
    active: HashMap<String, ActiveCall>,
    /// Recently ended canonical IDs, for status/sidecar dedup.
    recent_endings: HashMap<String, Instant>,
    /// Completed canonical IDs, bounded.
    history: VecDeque<String>,
    cancel: CancellationToken,
}

impl Correlator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<CorrelatorInput>,
        store: Arc<Store>,
        cache: Arc<MetadataCache>,
        tracker: Arc<ChannelTracker>,
        emitter: Arc<dyn EventEmitter>,
        dispatch_ends_tx: mpsc::Sender<String>,
        system_type: SystemType,
        audio_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            store,
            cache,
            tracker,
            emitter,
            dispatch_ends_tx,
            system_type,
            audio_dir,
            active: HashMap::new(),
            recent_endings: HashMap::new(),
            history: VecDeque::new(),
            cancel,
        }
    }

    /// Actor loop. Runs until cancelled.
    pub async fn run(mut self) {
        let mut rebroadcast =
            tokio::time::interval(Duration::from_secs(CALLS_ACTIVE_REBROADCAST_SECS));
        rebroadcast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                input = self.rx.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break,
                },
                _ = rebroadcast.tick() => {
                    self.prune_recent_endings();
                    if !self.active.is_empty() {
                        self.emit_calls_active();
                    }
                }
            }
        }
        log::info!("[Correlator] Stopped");
    }

    async fn handle(&mut self, input: CorrelatorInput) {
        match input {
            CorrelatorInput::Status(StatusMessage::CallStart(msg)) => self.on_call_start(&msg),
            CorrelatorInput::Status(StatusMessage::CallEnd(msg)) => {
                self.on_call_end(*msg, None).await;
            }
            CorrelatorInput::Status(StatusMessage::CallsActive(calls)) => {
                self.on_calls_active(&calls);
            }
            CorrelatorInput::Status(_) => {
                // rates/systems/recorders are forwarded by the status endpoint.
            }
            CorrelatorInput::Recording(complete) => {
                let wav = complete.wav_path.clone();
                self.on_call_end(complete.payload, Some(wav)).await;
            }
            CorrelatorInput::Control(event) => {
                self.tracker.note_control_event(&event);
            }
        }
    }

    fn channel_key(&self, talkgroup: u64, freq: u64) -> u64 {
        match self.system_type {
            SystemType::Trunked => talkgroup,
            SystemType::Conventional => freq,
        }
    }

    fn label(&self, tag: Option<&str>, talkgroup: u64, freq: u64) -> String {
        match tag {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => match self.system_type {
                SystemType::Trunked => talkgroup.to_string(),
                SystemType::Conventional => format_mhz(freq),
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // call_start
    // ─────────────────────────────────────────────────────────────────────

    fn on_call_start(&mut self, msg: &CallStartMsg) {
        let start = now_secs();
        let channel_key = self.channel_key(msg.talkgroup, msg.freq);

        // At most one active call per logical channel.
        if let Some(existing_id) = self.active_id_for(channel_key) {
            let existing_start = self.active[&existing_id].start_time;
            if start.abs_diff(existing_start) <= CALL_DEDUP_WINDOW_SECS {
                log::debug!("[Correlator] Duplicate call_start for {}", existing_id);
                return;
            }
            log::debug!(
                "[Correlator] Channel {} already active as {}, replacing",
                channel_key,
                existing_id
            );
            self.active.remove(&existing_id);
            self.tracker.remove_call(&existing_id);
        }

        let id = canonical_call_id(channel_key, start);
        let label = self.label(msg.talkgrouptag.as_deref(), msg.talkgroup, msg.freq);
        self.active.insert(
            id.clone(),
            ActiveCall {
                id: id.clone(),
                channel_key,
                talkgroup: msg.talkgroup,
                frequency: msg.freq,
                label: label.clone(),
                start_time: start,
                emergency: false,
                encrypted: false,
            },
        );
        self.tracker.add_call(
            &id,
            ActiveCallInfo {
                freq: msg.freq,
                talkgroup: msg.talkgroup,
                label: label.clone(),
                start,
            },
        );

        self.emitter.emit(HubEvent::CallStart(CallStartEvent {
            id,
            channel_key,
            talkgroup: msg.talkgroup,
            frequency: msg.freq,
            label,
            system_type: self.system_type,
            start_time: start,
            emergency: false,
            encrypted: false,
        }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // call_end (status socket or recording sidecar)
    // ─────────────────────────────────────────────────────────────────────

    async fn on_call_end(&mut self, msg: CallEndMsg, wav_override: Option<PathBuf>) {
        let channel_key = self.channel_key(msg.talkgroup, msg.freq);
        let msg_start = if msg.start_time > 0 {
            msg.start_time
        } else {
            now_secs()
        };

        // Reuse the ID announced at call_start when this is clearly the same
        // call, so start and end carry one canonical ID even across clock skew.
        let (id, start) = match self.active_id_for(channel_key) {
            Some(active_id)
                if self.active[&active_id]
                    .start_time
                    .abs_diff(msg_start)
                    <= CALL_DEDUP_WINDOW_SECS =>
            {
                let start = self.active[&active_id].start_time;
                (active_id, start)
            }
            _ => (canonical_call_id(channel_key, msg_start), msg_start),
        };

        // Status vs. sidecar race: the first description of this call wins.
        if self.is_recent_ending(channel_key, start) {
            log::debug!("[Correlator] Duplicate call_end for {}, suppressed", id);
            return;
        }

        let stop = if msg.stop_time > 0 {
            msg.stop_time.max(start)
        } else {
            start + msg.length.unwrap_or(0.0).round() as u64
        };
        let elapsed = (stop - start) as f64;
        let duration = match msg.length {
            Some(length) if (length - elapsed).abs() <= 1.0 => length,
            _ => elapsed,
        };
        let label = self.label(msg.talkgrouptag.as_deref(), msg.talkgroup, msg.freq);
        let audio_file = self.normalize_audio_path(wav_override, msg.filename.as_deref(), &id);

        let catalog = CatalogUpsert {
            alpha_tag: msg.talkgrouptag.clone().unwrap_or_else(|| label.clone()),
            description: msg.talkgroup_description.clone().unwrap_or_default(),
            group_name: msg.talkgroup_group.clone().unwrap_or_default(),
            group_tag: msg.talkgroup_group_tag.clone().unwrap_or_default(),
            mode: String::new(),
        };

        let (talkgroup_id, channel_id) = match self.system_type {
            SystemType::Trunked => {
                if msg.talkgroup > 0 {
                    if let Err(e) = self.store.upsert_talkgroup(msg.talkgroup, catalog).await {
                        self.persist_error("talkgroup upsert", &e.to_string());
                    }
                    self.cache.invalidate(msg.talkgroup);
                }
                (msg.talkgroup, None)
            }
            SystemType::Conventional => {
                let channel_id = match self.store.get_or_create_channel(msg.freq, catalog).await {
                    Ok(channel_id) => Some(channel_id),
                    Err(e) => {
                        self.persist_error("channel resolve", &e.to_string());
                        None
                    }
                };
                self.cache.invalidate(msg.freq);
                (0, channel_id)
            }
        };

        let sources: Vec<CallSource> = msg
            .src_list
            .iter()
            .map(|s| CallSource {
                source_id: s.src,
                timestamp: s.time,
                position: s.pos,
                emergency: s.emergency,
                tag: s.tag.clone(),
            })
            .collect();

        let call = Call {
            id: id.clone(),
            system_type: self.system_type,
            channel_key,
            talkgroup_id,
            channel_id,
            frequency: msg.freq,
            start_time: start,
            stop_time: Some(stop),
            duration: Some(duration),
            emergency: msg.emergency,
            encrypted: msg.encrypted,
            audio_file: Some(audio_file.clone()),
            audio_type: msg.audio_type.clone(),
            sources: sources.clone(),
        };
        if let Err(e) = self.store.insert_call(call).await {
            self.persist_error(&format!("call {}", id), &e.to_string());
        }

        self.recent_endings.insert(id.clone(), Instant::now());
        self.history.push_back(id.clone());
        if self.history.len() > CALL_HISTORY_LIMIT {
            self.history.pop_front();
        }

        // Clear the active slot for this channel, whatever ID it carried.
        if let Some(active_id) = self.active_id_for(channel_key) {
            self.active.remove(&active_id);
            self.tracker.remove_call(&active_id);
        }

        self.emitter.emit(HubEvent::CallEnd(Box::new(CallEndEvent {
            id: id.clone(),
            channel_key,
            talkgroup: msg.talkgroup,
            frequency: msg.freq,
            label: label.clone(),
            system_type: self.system_type,
            start_time: start,
            stop_time: stop,
            duration,
            emergency: msg.emergency,
            encrypted: msg.encrypted,
            audio_file: audio_file.clone(),
            audio_type: msg.audio_type.clone(),
            sources,
        })));
        self.emitter.emit(HubEvent::NewRecording(NewRecordingEvent {
            id: id.clone(),
            channel_key,
            talkgroup: msg.talkgroup,
            frequency: msg.freq,
            label,
            audio_file,
            duration,
        }));

        if self.dispatch_ends_tx.try_send(id).is_err() {
            log::trace!("[Correlator] Dispatch end channel full");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // calls_active reconciliation
    // ─────────────────────────────────────────────────────────────────────

    fn on_calls_active(&mut self, calls: &[CallStartMsg]) {
        let mut keep: HashSet<String> = HashSet::new();

        for msg in calls {
            let channel_key = self.channel_key(msg.talkgroup, msg.freq);
            if let Some(id) = self.active_id_for(channel_key) {
                keep.insert(id);
                continue;
            }
            // A call the decoder knows about but we never saw start.
            let start = now_secs().saturating_sub(msg.elapsed_time.unwrap_or(0.0) as u64);
            let id = canonical_call_id(channel_key, start);
            let label = self.label(msg.talkgrouptag.as_deref(), msg.talkgroup, msg.freq);
            self.active.insert(
                id.clone(),
                ActiveCall {
                    id: id.clone(),
                    channel_key,
                    talkgroup: msg.talkgroup,
                    frequency: msg.freq,
                    label: label.clone(),
                    start_time: start,
                    emergency: false,
                    encrypted: false,
                },
            );
            self.tracker.add_call(
                &id,
                ActiveCallInfo {
                    freq: msg.freq,
                    talkgroup: msg.talkgroup,
                    label,
                    start,
                },
            );
            keep.insert(id);
        }

        // Authoritative: anything the decoder no longer lists is gone.
        self.active.retain(|id, _| keep.contains(id));
        self.tracker.reconcile(&keep);

        self.emit_calls_active();
    }

    fn emit_calls_active(&self) {
        let mut calls: Vec<CallStartEvent> = self
            .active
            .values()
            .map(|call| CallStartEvent {
                id: call.id.clone(),
                channel_key: call.channel_key,
                talkgroup: call.talkgroup,
                frequency: call.frequency,
                label: call.label.clone(),
                system_type: self.system_type,
                start_time: call.start_time,
                emergency: call.emergency,
                encrypted: call.encrypted,
            })
            .collect();
        calls.sort_by_key(|c| c.start_time);
        self.emitter.emit(HubEvent::CallsActive { calls });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    fn active_id_for(&self, channel_key: u64) -> Option<String> {
        self.active
            .values()
            .find(|call| call.channel_key == channel_key)
            .map(|call| call.id.clone())
    }

    /// Checks the ±1 s dedup window for an already-processed ending.
    fn is_recent_ending(&self, channel_key: u64, start: u64) -> bool {
        let window = Duration::from_secs(NEW_RECORDING_SUPPRESS_SECS);
        (start.saturating_sub(CALL_DEDUP_WINDOW_SECS)..=start + CALL_DEDUP_WINDOW_SECS).any(
            |candidate_start| {
                self.recent_endings
                    .get(&canonical_call_id(channel_key, candidate_start))
                    .is_some_and(|at| at.elapsed() < window)
            },
        )
    }

    fn prune_recent_endings(&mut self) {
        let window = Duration::from_secs(NEW_RECORDING_SUPPRESS_SECS);
        self.recent_endings.retain(|_, at| at.elapsed() < window);
    }

    /// Audio path normalization: absolute stays, relative joins the audio
    /// dir, absent synthesizes `{audio_dir}/{id}.wav`.
    fn normalize_audio_path(
        &self,
        wav_override: Option<PathBuf>,
        filename: Option<&str>,
        id: &str,
    ) -> String {
        if let Some(path) = wav_override {
            return path.to_string_lossy().into_owned();
        }
        match filename {
            Some(name) if Path::new(name).is_absolute() => name.to_string(),
            Some(name) => self.audio_dir.join(name).to_string_lossy().into_owned(),
            None => self
                .audio_dir
                .join(format!("{}.wav", id))
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn persist_error(&self, context: &str, error: &str) {
        log::error!("[Correlator] Persistence failure ({}): {}", context, error);
        self.emitter.emit(HubEvent::Error {
            error: format!("persistence failure: {}", context),
        });
    }
}
