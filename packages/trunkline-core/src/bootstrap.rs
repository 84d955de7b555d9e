//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. Ingest sockets are bound
//! here so that a busy port fails startup (exit code 1) instead of dying
//! inside a background task. No component holds a reference to another
//! component; fan-out runs over explicit per-consumer channels wired here,
//! and two fan-out targets never share a channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::cache::MetadataCache;
use crate::calls::correlator::{Correlator, CorrelatorInput};
use crate::calls::tracker::ChannelTracker;
use crate::calls::SystemType;
use crate::config::Config;
use crate::db::Store;
use crate::downstream::{DispatchStreamer, StreamerHandle};
use crate::error::{TrunklineError, TrunklineResult};
use crate::events::{EventEmitter, HubEventBridge};
use crate::hub::BroadcastHub;
use crate::ingest::audio::{AudioIngestor, EnrichedAudioFrame};
use crate::ingest::fft::{FftIngestor, FftPacket};
use crate::ingest::log_tail::{EventRing, LogTailer};
use crate::ingest::status::StatusEndpoint;
use crate::ingest::watcher::RecordingWatcher;
use crate::protocol_constants::{
    CORRELATOR_CHANNEL_CAPACITY, SHUTDOWN_FLUSH_DEADLINE_SECS,
};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::spectrum::{SpectrumHandle, SpectrumService};

/// Components constructed at bootstrap but not yet running.
struct RuntimeTasks {
    audio: AudioIngestor,
    fft: FftIngestor,
    status: StatusEndpoint,
    tailer: LogTailer,
    watcher: RecordingWatcher,
    correlator: Correlator,
    spectrum_service: SpectrumService,
    streamer: DispatchStreamer,
    hub_audio_rx: mpsc::Receiver<EnrichedAudioFrame>,
    hub_fft_rx: mpsc::Receiver<FftPacket>,
}

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    pub store: Arc<Store>,
    pub cache: Arc<MetadataCache>,
    pub tracker: Arc<ChannelTracker>,
    pub hub: Arc<BroadcastHub>,
    pub event_bridge: Arc<HubEventBridge>,
    pub ring: Arc<EventRing>,
    pub spectrum: SpectrumHandle,
    pub streamer: StreamerHandle,
    pub system_type: SystemType,
    pub spawner: TokioSpawner,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    runtime: Mutex<Option<RuntimeTasks>>,
}

/// Bootstraps all services with their dependencies.
///
/// Wiring order matters: persistence first (the system type drives the
/// correlator rules and the cache key space), then ingest components, hub
/// and downstream streamer. The HTTP server is started separately by the
/// binary via [`crate::api::start_server`].
pub async fn bootstrap_services(config: &Config) -> TrunklineResult<BootstrappedServices> {
    config
        .validate()
        .map_err(TrunklineError::Config)?;

    // Persistence first; everything else reads through it.
    let store = Arc::new(Store::open(&config.db_path).await?);
    let system_type = store.system_type().await?;
    log::info!("[Bootstrap] System type: {}", system_type.as_str());

    std::fs::create_dir_all(&config.recordings_dir)?;

    let spawner = TokioSpawner::current();
    let cancel_token = CancellationToken::new();

    let cache = Arc::new(MetadataCache::new(
        Arc::clone(&store),
        system_type,
        spawner.clone(),
    ));
    let tracker = Arc::new(ChannelTracker::new());
    let ring = Arc::new(EventRing::new(config.limits.recent_control_events));

    let hub = Arc::new(BroadcastHub::new(
        config.limits.subscriber_queue,
        Duration::from_secs(config.limits.slow_consumer_secs),
    ));
    let event_bridge = Arc::new(HubEventBridge::new(Arc::clone(&hub)));
    let emitter: Arc<dyn EventEmitter> = Arc::clone(&event_bridge) as Arc<dyn EventEmitter>;

    // Fan-out channels: one per consumer, never shared.
    let channel_bound = config.limits.ingest_channel;
    let (hub_audio_tx, hub_audio_rx) = mpsc::channel(channel_bound);
    let (dispatch_audio_tx, dispatch_audio_rx) = mpsc::channel(channel_bound);
    let (hub_fft_tx, hub_fft_rx) = mpsc::channel(channel_bound);
    let (recorder_fft_tx, recorder_fft_rx) = mpsc::channel(channel_bound);
    let (recorder_control_tx, recorder_control_rx) = mpsc::channel(channel_bound);
    let (correlator_tx, correlator_rx) = mpsc::channel::<CorrelatorInput>(CORRELATOR_CHANNEL_CAPACITY);
    let (dispatch_ends_tx, dispatch_ends_rx) = mpsc::channel(64);

    let parse_addr = |port: u16| -> TrunklineResult<std::net::SocketAddr> {
        format!("{}:{}", config.host, port)
            .parse()
            .map_err(|_| TrunklineError::Config(format!("invalid bind host {:?}", config.host)))
    };

    let correlator = Correlator::new(
        correlator_rx,
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&tracker),
        Arc::clone(&emitter),
        dispatch_ends_tx,
        system_type,
        config.audio_dir.clone(),
        cancel_token.child_token(),
    );

    let audio = AudioIngestor::bind(
        parse_addr(config.audio_port)?,
        Arc::clone(&cache),
        system_type,
        hub_audio_tx,
        dispatch_audio_tx,
        Arc::clone(&emitter),
        cancel_token.child_token(),
    )?;

    let fft = FftIngestor::bind(
        parse_addr(config.fft_port)?,
        hub_fft_tx,
        recorder_fft_tx,
        Arc::clone(&tracker),
        cancel_token.child_token(),
    )?;

    let status = StatusEndpoint::bind(
        parse_addr(config.status_port)?,
        correlator_tx.clone(),
        Arc::clone(&emitter),
        cancel_token.child_token(),
    )
    .await?;

    let tailer = LogTailer::new(
        config.log_paths.clone(),
        Arc::clone(&ring),
        Arc::clone(&emitter),
        recorder_control_tx,
        correlator_tx.clone(),
        cancel_token.child_token(),
    );

    let watcher = RecordingWatcher::new(
        config.audio_dir.clone(),
        correlator_tx,
        cancel_token.child_token(),
    );

    let (spectrum_service, spectrum) = SpectrumService::new(
        config.recordings_dir.clone(),
        recorder_fft_rx,
        recorder_control_rx,
        Arc::clone(&hub),
        Arc::clone(&emitter),
        config.sdr_center_freq,
        config.sdr_sample_rate,
        cancel_token.child_token(),
    );

    let (streamer_task, streamer) = DispatchStreamer::new(
        config.dispatch.clone(),
        dispatch_audio_rx,
        dispatch_ends_rx,
        cancel_token.child_token(),
    );

    Ok(BootstrappedServices {
        store,
        cache,
        tracker,
        hub,
        event_bridge,
        ring,
        spectrum,
        streamer,
        system_type,
        spawner,
        cancel_token,
        runtime: Mutex::new(Some(RuntimeTasks {
            audio,
            fft,
            status,
            tailer,
            watcher,
            correlator,
            spectrum_service,
            streamer: streamer_task,
            hub_audio_rx,
            hub_fft_rx,
        })),
    })
}

impl BootstrappedServices {
    /// Builds the API layer's shared state.
    pub fn app_state(&self) -> AppState {
        AppState {
            hub: Arc::clone(&self.hub),
            ring: Arc::clone(&self.ring),
            tracker: Arc::clone(&self.tracker),
            spectrum: self.spectrum.clone(),
            streamer: self.streamer.clone(),
        }
    }

    /// Starts every background task. Idempotent; the second call warns.
    pub fn start_background_tasks(&self) {
        let Some(tasks) = self.runtime.lock().take() else {
            log::warn!("[Bootstrap] Background tasks already started");
            return;
        };

        self.spawner.spawn(tasks.correlator.run());
        self.spawner.spawn(tasks.audio.run());
        self.spawner.spawn(tasks.fft.run());
        self.spawner.spawn(tasks.status.run());
        self.spawner.spawn(tasks.tailer.run());
        self.spawner.spawn(tasks.watcher.run());
        self.spawner.spawn(tasks.spectrum_service.run());
        self.spawner.spawn(tasks.streamer.run());
        self.spawner.spawn(
            Arc::clone(&self.hub).pump_audio(tasks.hub_audio_rx, self.cancel_token.child_token()),
        );
        self.spawner.spawn(
            Arc::clone(&self.hub).pump_fft(tasks.hub_fft_rx, self.cancel_token.child_token()),
        );

        log::info!("[Bootstrap] Background tasks started");
    }

    /// Initiates graceful shutdown, tearing down in reverse startup order:
    /// stop accepting subscribers, flush outbound queues up to the deadline,
    /// cancel every task (closing sockets and the tailer), then close the
    /// persistence store last.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        self.hub.stop_accepting();
        self.hub
            .flush(Duration::from_secs(SHUTDOWN_FLUSH_DEADLINE_SECS))
            .await;
        let closed = self.hub.close_all("server shutdown");
        if closed > 0 {
            log::info!("[Bootstrap] Closed {} subscriber(s)", closed);
        }

        self.cancel_token.cancel();
        // Give cancelled tasks a moment to release sockets and files.
        tokio::time::sleep(Duration::from_millis(100)).await;

        self.store.close().await;
        log::info!("[Bootstrap] Shutdown complete");
    }
}
