//! Trunkline Core - shared library for the Trunkline scanner server.
//!
//! This crate is the ingest-and-fan-out plane for a P25/conventional radio
//! scanner: it consumes the decoder's real-time telemetry (UDP audio, UDP
//! FFT, a status socket, log lines, deposited recordings), correlates those
//! streams into a coherent model of calls and control-channel activity,
//! persists calls, and fans live events out to subscribed clients.
//!
//! # Architecture
//!
//! - [`ingest`]: the multi-transport ingestion layer (one task per source)
//! - [`calls`]: call correlation, canonical IDs, channel tracking
//! - [`hub`]: the subscription-filtered broadcast hub
//! - [`downstream`]: PCM relay to an external dispatch console
//! - [`spectrum`]: FFT recording and timing-preserving replay
//! - [`db`]: SQLite persistence with single-writer semantics
//! - [`events`]: typed event model and the [`EventEmitter`] seam
//! - [`bootstrap`]: the composition root wiring everything together
//! - [`api`]: the `/ws` subscriber socket and health probe
//!
//! Components never hold references to each other; the supervisor wires
//! explicit typed channels between them at bootstrap.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod cache;
pub mod calls;
pub mod config;
pub mod db;
pub mod downstream;
pub mod error;
pub mod events;
pub mod hub;
pub mod ingest;
pub mod protocol_constants;
pub mod runtime;
pub mod spectrum;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use cache::{ChannelMetadata, MetadataCache};
pub use calls::tracker::ChannelTracker;
pub use calls::{canonical_call_id, Call, CallSource, SystemType};
pub use config::{Config, DispatchConfig, Limits};
pub use db::Store;
pub use downstream::{StreamerHandle, StreamerStats};
pub use error::{ErrorCode, TrunklineError, TrunklineResult};
pub use events::{
    ControlChannelEvent, ControlEventKind, EventEmitter, HubEvent, HubEventBridge,
    LoggingEventEmitter, NoopEventEmitter,
};
pub use hub::BroadcastHub;
pub use ingest::audio::{AudioWireFormat, EnrichedAudioFrame};
pub use ingest::fft::FftPacket;
pub use runtime::{TaskSpawner, TokioSpawner};
pub use spectrum::{RecordingMetadata, SpectrumHandle};
pub use utils::{format_mhz, now_millis, now_secs};
