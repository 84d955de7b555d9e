//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the decoder's wire formats and the downstream
//! dispatch protocol; changing them breaks interoperability with deployed
//! decoders and consoles.

// ─────────────────────────────────────────────────────────────────────────────
// UDP Ingest Wire Formats
// ─────────────────────────────────────────────────────────────────────────────

/// Magic tag at the start of every FFT datagram (`"FFTD"`).
pub const FFT_MAGIC: &[u8; 4] = b"FFTD";

/// Fixed-size prefix of an FFT datagram: magic + meta length + FFT size.
pub const FFT_HEADER_LEN: usize = 12;

/// Upper bound for the length-prefixed JSON header in an audio datagram.
///
/// A leading little-endian u32 at or above this value is treated as a raw
/// talkgroup ID (wire format 4), not a JSON header length.
pub const AUDIO_JSON_MAX_LEN: u32 = 10_000;

/// Scan bound when brace-matching embedded JSON in an audio datagram.
pub const AUDIO_JSON_SCAN_BOUND: usize = 2_000;

/// Sample rate assumed for PCM frames whose header does not carry one (Hz).
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 8_000;

/// Receive buffer requested for the ingest UDP sockets (bytes).
pub const UDP_RECV_BUFFER_SIZE: usize = 256 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Default Ports
// ─────────────────────────────────────────────────────────────────────────────

/// Default HTTP/WebSocket port for the subscriber socket.
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Default decoder status socket port.
pub const DEFAULT_STATUS_PORT: u16 = 3001;

/// Default UDP audio ingress port.
pub const DEFAULT_AUDIO_PORT: u16 = 9000;

/// Default UDP FFT ingress port.
pub const DEFAULT_FFT_PORT: u16 = 9001;

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast Hub
// ─────────────────────────────────────────────────────────────────────────────

/// Default bound of each subscriber's outbound queue (messages).
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Sustained-overflow window after which a subscriber is evicted (seconds).
pub const SLOW_CONSUMER_WINDOW_SECS: u64 = 5;

/// Deadline for flushing subscriber queues during shutdown (seconds).
pub const SHUTDOWN_FLUSH_DEADLINE_SECS: u64 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Correlator
// ─────────────────────────────────────────────────────────────────────────────

/// Start-time tolerance when deduplicating status vs. sidecar call ends (seconds).
pub const CALL_DEDUP_WINDOW_SECS: u64 = 1;

/// Suppression window for duplicate `new_recording` broadcasts (seconds).
pub const NEW_RECORDING_SUPPRESS_SECS: u64 = 60;

/// Maximum completed calls retained in memory.
pub const CALL_HISTORY_LIMIT: usize = 500;

/// Interval for rebroadcasting the active-call snapshot (seconds).
pub const CALLS_ACTIVE_REBROADCAST_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Ingest Observability
// ─────────────────────────────────────────────────────────────────────────────

/// Emit an ingest progress line every this many frames.
pub const INGEST_LOG_FRAME_INTERVAL: u64 = 100;

/// ... or after this many seconds, whichever comes first.
pub const INGEST_LOG_SECS: u64 = 5;

/// Malformed-input rate (per minute) above which an `error` event is emitted.
pub const MALFORMED_RATE_THRESHOLD_PER_MIN: u64 = 10;

/// Idle timeout for long-lived network reads (seconds).
pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 30;

/// Consecutive idle timeouts before a connection is torn down.
pub const STREAM_IDLE_LIMIT: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Log Tailer / Recording Watcher
// ─────────────────────────────────────────────────────────────────────────────

/// Ring capacity for recent control-channel events kept for late subscribers.
pub const RECENT_CONTROL_EVENTS: usize = 200;

/// Poll interval for the log tailer (milliseconds).
pub const LOG_TAIL_POLL_MS: u64 = 250;

/// Poll interval for the recording directory watcher (milliseconds).
pub const WATCHER_POLL_MS: u64 = 1_000;

// ─────────────────────────────────────────────────────────────────────────────
// Metadata Cache
// ─────────────────────────────────────────────────────────────────────────────

/// TTL for positive metadata cache entries (seconds).
pub const CACHE_TTL_SECS: u64 = 60;

/// TTL for negative (not-found) cache entries (seconds).
pub const CACHE_NEGATIVE_TTL_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Downstream Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Initial reconnect backoff for the dispatch TCP connection (seconds).
pub const DISPATCH_BACKOFF_START_SECS: u64 = 1;

/// Reconnect backoff cap (seconds).
pub const DISPATCH_BACKOFF_CAP_SECS: u64 = 30;

/// Idle window after which a streamed call is considered ended (seconds).
pub const DISPATCH_CALL_IDLE_SECS: u64 = 3;

/// Grace window for retrying a call-end message after a TCP failure (seconds).
pub const DISPATCH_END_GRACE_SECS: u64 = 10;

/// Size of the fixed per-packet header on the dispatch UDP stream (bytes).
pub const DISPATCH_UDP_HEADER_LEN: usize = 18;

// ─────────────────────────────────────────────────────────────────────────────
// Spectrum Recorder / Replayer
// ─────────────────────────────────────────────────────────────────────────────

/// Replay progress is reported every this many packets.
pub const REPLAY_PROGRESS_PACKET_INTERVAL: usize = 30;

/// ... or after this many milliseconds, whichever comes first.
pub const REPLAY_PROGRESS_MS: u64 = 1_000;

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

/// Bound of the ingest fan-out channels (frames / packets).
pub const INGEST_CHANNEL_CAPACITY: usize = 512;

/// Bound of the correlator command channel.
pub const CORRELATOR_CHANNEL_CAPACITY: usize = 256;

/// Bound of the persistence writer request channel.
pub const DB_WRITER_CHANNEL_CAPACITY: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier returned by the health endpoint.
pub const SERVICE_ID: &str = "trunkline";
