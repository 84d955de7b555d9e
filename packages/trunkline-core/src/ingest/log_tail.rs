//! Rotating decoder-log tailer.
//!
//! Follows the decoder's log file in append mode, detecting truncation and
//! rename/rotate, and classifies each new line against a fixed ordered
//! pattern table into [`ControlChannelEvent`]s. Unmatched lines are dropped,
//! except lines beginning with "Update" which classify as `update`.
//!
//! A bounded ring of the most recent events is retained so late subscribers
//! can backfill at connect.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::calls::correlator::CorrelatorInput;
use crate::events::{ControlChannelEvent, ControlEventKind, EventEmitter, HubEvent};
use crate::protocol_constants::LOG_TAIL_POLL_MS;
use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Line Classification
// ─────────────────────────────────────────────────────────────────────────────

fn patterns() -> &'static [(Regex, ControlEventKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, ControlEventKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Order matters: the first matching pattern assigns the kind.
        let table: &[(&str, ControlEventKind)] = &[
            (r"Starting P25 Recorder", ControlEventKind::Grant),
            (r"Stopping P25 Recorder", ControlEventKind::End),
            (r"ENCRYPTED", ControlEventKind::Encrypted),
            (r"(?i)control channel.*decode rate", ControlEventKind::DecodeRate),
            (r"WACN", ControlEventKind::SystemInfo),
            (r"(?i)unit\s*id", ControlEventKind::Unit),
            (r"(?i)no channel recorder", ControlEventKind::NoRecorder),
            (r"(?i)out of band", ControlEventKind::OutOfBand),
            (r"Grant Update|Channel Update", ControlEventKind::Update),
        ];
        table
            .iter()
            .map(|(pattern, kind)| {
                (
                    Regex::new(pattern).expect("log pattern table is well-formed"),
                    *kind,
                )
            })
            .collect()
    })
}

fn field_regex(pattern: &str, slot: &'static OnceLock<Regex>) -> &'static Regex {
    slot.get_or_init(|| Regex::new(pattern).expect("field pattern is well-formed"))
}

fn capture_u64(re: &Regex, line: &str) -> Option<u64> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

fn capture_str(re: &Regex, line: &str) -> Option<String> {
    Some(re.captures(line)?.get(1)?.as_str().to_string())
}

/// Parses a frequency field that may be Hz (`851150000`) or MHz (`851.15`).
fn parse_freq(text: &str) -> Option<u64> {
    let value: f64 = text.parse().ok()?;
    if value < 10_000.0 {
        Some((value * 1_000_000.0).round() as u64)
    } else {
        Some(value.round() as u64)
    }
}

/// Classifies one log line; `None` means the line is dropped.
pub fn classify_line(line: &str, timestamp: u64) -> Option<ControlChannelEvent> {
    let kind = patterns()
        .iter()
        .find(|(regex, _)| regex.is_match(line))
        .map(|(_, kind)| *kind)
        .or_else(|| {
            // Unrecognized lines classify as `update` only when they begin
            // with "Update"; everything else is discarded silently.
            line.trim_start()
                .starts_with("Update")
                .then_some(ControlEventKind::Update)
        })?;

    static TG: OnceLock<Regex> = OnceLock::new();
    static FREQ: OnceLock<Regex> = OnceLock::new();
    static REC: OnceLock<Regex> = OnceLock::new();
    static SRC: OnceLock<Regex> = OnceLock::new();
    static SLOT: OnceLock<Regex> = OnceLock::new();
    static RATE: OnceLock<Regex> = OnceLock::new();
    static WACN: OnceLock<Regex> = OnceLock::new();
    static NAC: OnceLock<Regex> = OnceLock::new();
    static SYS: OnceLock<Regex> = OnceLock::new();

    let mut event = ControlChannelEvent::new(kind, timestamp, line.to_string());
    event.talkgroup = capture_u64(field_regex(r"TG:?\s*(\d+)", &TG), line);
    event.frequency = field_regex(r"(?i)freq(?:uency)?:?\s*(\d+(?:\.\d+)?)", &FREQ)
        .captures(line)
        .and_then(|c| parse_freq(c.get(1)?.as_str()));
    event.recorder = capture_u64(field_regex(r"num \[(\d+)\]", &REC), line).map(|v| v as u32);
    event.source = capture_u64(field_regex(r"(?i)unit\s*id:?\s*(\d+)", &SRC), line);
    event.slot = capture_u64(field_regex(r"(?i)tdma(?:\s*slot)?:?\s*(\d+)", &SLOT), line)
        .map(|v| v as u8);
    event.decode_rate = field_regex(r"(?i)decode rate:?\s*(\d+(?:\.\d+)?)", &RATE)
        .captures(line)
        .and_then(|c| c.get(1)?.as_str().parse().ok());
    event.wacn = capture_str(
        field_regex(r"WACN:?\s*(?:0x)?([0-9A-Fa-f]+)", &WACN),
        line,
    );
    event.nac = capture_str(field_regex(r"NAC:?\s*(?:0x)?([0-9A-Fa-f]+)", &NAC), line);
    event.system_id = capture_str(
        field_regex(r"(?i)sys(?:tem)?\s*id:?\s*(?:0x)?([0-9A-Fa-f]+)", &SYS),
        line,
    );
    Some(event)
}

// ─────────────────────────────────────────────────────────────────────────────
// Recent-Event Ring
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded ring of the most recent control-channel events.
pub struct EventRing {
    events: Mutex<VecDeque<ControlChannelEvent>>,
    capacity: usize,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, event: ControlChannelEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Oldest-first snapshot of the retained events.
    pub fn recent(&self) -> Vec<ControlChannelEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tail State
// ─────────────────────────────────────────────────────────────────────────────

/// File-follow state for one log path; detects truncation and rotation.
struct TailState {
    path: PathBuf,
    pos: u64,
    #[cfg(unix)]
    ino: Option<u64>,
}

impl TailState {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            pos: 0,
            #[cfg(unix)]
            ino: None,
        }
    }

    /// Reads any complete new lines, reopening from the start on rotation.
    fn poll_lines(&mut self) -> std::io::Result<Vec<String>> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            // File vanished mid-rotation; retry next tick.
            Err(_) => return Ok(Vec::new()),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let ino = metadata.ino();
            if self.ino.replace(ino) != Some(ino) && self.pos > 0 {
                log::info!("[LogTail] {} rotated, reopening", self.path.display());
                self.pos = 0;
            }
        }
        if metadata.len() < self.pos {
            log::info!("[LogTail] {} truncated, reopening", self.path.display());
            self.pos = 0;
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.pos))?;
        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            if !line.ends_with('\n') {
                // Partial line still being written; pick it up next tick.
                break;
            }
            self.pos += n as u64;
            let trimmed = line.trim_end();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        Ok(lines)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tailer Task
// ─────────────────────────────────────────────────────────────────────────────

/// Follows the decoder log and emits classified control-channel events.
pub struct LogTailer {
    candidates: Vec<PathBuf>,
    ring: Arc<EventRing>,
    emitter: Arc<dyn EventEmitter>,
    recorder_tx: mpsc::Sender<ControlChannelEvent>,
    correlator_tx: mpsc::Sender<CorrelatorInput>,
    cancel: CancellationToken,
}

impl LogTailer {
    pub fn new(
        candidates: Vec<PathBuf>,
        ring: Arc<EventRing>,
        emitter: Arc<dyn EventEmitter>,
        recorder_tx: mpsc::Sender<ControlChannelEvent>,
        correlator_tx: mpsc::Sender<CorrelatorInput>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            candidates,
            ring,
            emitter,
            recorder_tx,
            correlator_tx,
            cancel,
        }
    }

    /// Picks the preferred candidate that exists on disk.
    fn pick_path(&self) -> Option<&Path> {
        self.candidates
            .iter()
            .find(|p| p.exists())
            .map(PathBuf::as_path)
    }

    /// Poll loop. Runs until cancelled.
    pub async fn run(self) {
        let mut state: Option<TailState> = None;
        let mut last_ts: u64 = 0;
        let mut interval = tokio::time::interval(Duration::from_millis(LOG_TAIL_POLL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if state.is_none() {
                if let Some(path) = self.pick_path() {
                    log::info!("[LogTail] Following {}", path.display());
                    state = Some(TailState::new(path.to_path_buf()));
                } else {
                    continue;
                }
            }

            let Some(tail) = state.as_mut() else {
                continue;
            };
            let lines = match tail.poll_lines() {
                Ok(lines) => lines,
                Err(e) => {
                    log::warn!("[LogTail] read error on {}: {}", tail.path.display(), e);
                    state = None;
                    continue;
                }
            };

            for line in lines {
                // Classification timestamps must be monotonic even if the
                // clock steps backwards between polls.
                let ts = now_millis().max(last_ts);
                last_ts = ts;
                if let Some(event) = classify_line(&line, ts) {
                    self.ring.push(event.clone());
                    self.emitter.emit(HubEvent::ControlChannel(event.clone()));
                    let _ = self.recorder_tx.try_send(event.clone());
                    if self
                        .correlator_tx
                        .try_send(CorrelatorInput::Control(event))
                        .is_err()
                    {
                        log::trace!("[LogTail] Correlator channel full, event dropped");
                    }
                }
            }
        }
        log::info!("[LogTail] Tailer stopped");
    }
}
