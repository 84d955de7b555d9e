//! Core configuration types.
//!
//! Provides [`Config`] with the listen ports, directories, downstream
//! dispatch target, and resource limits. All fields have sensible defaults;
//! the server binary layers YAML and environment overrides on top.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_AUDIO_PORT, DEFAULT_FFT_PORT, DEFAULT_HTTP_PORT, DEFAULT_STATUS_PORT,
    INGEST_CHANNEL_CAPACITY, RECENT_CONTROL_EVENTS, SLOW_CONSUMER_WINDOW_SECS,
    SUBSCRIBER_QUEUE_CAPACITY,
};

/// Downstream dispatch-console endpoint configuration.
///
/// The streamer holds a supervisory TCP connection to `host:port` and sends
/// PCM over UDP to `host:port+1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Dispatch console host.
    pub host: String,
    /// TCP control port; UDP data goes to the adjacent port (`port + 1`).
    pub port: u16,
    /// Whether forwarding starts enabled.
    pub enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9870,
            enabled: false,
        }
    }
}

/// Resource limits, all runtime-configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Recent control-channel events retained for late subscribers.
    pub recent_control_events: usize,
    /// Per-subscriber outbound queue bound (messages).
    pub subscriber_queue: usize,
    /// Sustained-overflow window before a slow consumer is closed (seconds).
    pub slow_consumer_secs: u64,
    /// Bound of the ingest fan-out channels.
    pub ingest_channel: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            recent_control_events: RECENT_CONTROL_EVENTS,
            subscriber_queue: SUBSCRIBER_QUEUE_CAPACITY,
            slow_consumer_secs: SLOW_CONSUMER_WINDOW_SECS,
            ingest_channel: INGEST_CHANNEL_CAPACITY,
        }
    }
}

/// Configuration for the Trunkline core services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for every listener.
    pub host: String,

    /// HTTP/WebSocket port for the subscriber socket.
    pub http_port: u16,

    /// Decoder status socket port.
    pub status_port: u16,

    /// UDP audio ingress port.
    pub audio_port: u16,

    /// UDP FFT ingress port.
    pub fft_port: u16,

    /// Directory the decoder deposits recordings (WAV + JSON sidecars) into.
    pub audio_dir: PathBuf,

    /// Path of the SQLite persistence file.
    pub db_path: PathBuf,

    /// Directory spectrum recordings are written to.
    pub recordings_dir: PathBuf,

    /// Candidate decoder log paths, in preference order. The first existing
    /// path is tailed; if none exist yet the first candidate is awaited.
    pub log_paths: Vec<PathBuf>,

    /// SDR center frequency (Hz), used to seed spectrum metadata.
    pub sdr_center_freq: u64,

    /// SDR sample rate (Hz).
    pub sdr_sample_rate: u32,

    /// Downstream dispatch endpoint.
    pub dispatch: DispatchConfig,

    /// Resource limits.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            status_port: DEFAULT_STATUS_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            fft_port: DEFAULT_FFT_PORT,
            audio_dir: PathBuf::from("./audio"),
            db_path: PathBuf::from("./trunkline.db"),
            recordings_dir: PathBuf::from("./recordings"),
            log_paths: vec![
                PathBuf::from("/tmp/trunk-recorder-output.log"),
                PathBuf::from("/tmp/trunk-recorder.log"),
            ],
            sdr_center_freq: 852_000_000,
            sdr_sample_rate: 2_048_000,
            dispatch: DispatchConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.limits.subscriber_queue == 0 {
            return Err("limits.subscriber_queue must be >= 1".to_string());
        }
        if self.limits.ingest_channel == 0 {
            return Err("limits.ingest_channel must be >= 1".to_string());
        }
        if self.log_paths.is_empty() {
            return Err("log_paths must name at least one candidate".to_string());
        }
        if self.dispatch.port == u16::MAX {
            return Err("dispatch.port has no adjacent UDP port".to_string());
        }
        Ok(())
    }
}
