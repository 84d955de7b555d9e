//! Recording directory watcher.
//!
//! Polls the audio intake tree for JSON sidecar files the decoder writes
//! next to finalized recordings. A sidecar is emitted once its size has been
//! stable across two polls (debounce) and at most once ever (idempotence).
//! The sibling `.wav` must exist; otherwise the sidecar is dropped with a
//! warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::calls::correlator::CorrelatorInput;
use crate::ingest::status::CallEndMsg;
use crate::protocol_constants::WATCHER_POLL_MS;

/// A finalized recording: the sidecar payload plus the absolute WAV path.
#[derive(Debug, Clone)]
pub struct RecordingComplete {
    pub payload: CallEndMsg,
    pub wav_path: PathBuf,
}

#[derive(Debug)]
struct SeenEntry {
    size: u64,
    emitted: bool,
}

/// Debouncing scan state, separated from the task for testability.
#[derive(Default)]
struct WatcherState {
    seen: HashMap<PathBuf, SeenEntry>,
}

impl WatcherState {
    /// Walks the tree and returns sidecars that became ready this scan.
    fn scan(&mut self, root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        collect_sidecars(root, &mut found);

        let mut ready = Vec::new();
        for (path, size) in &found {
            match self.seen.get_mut(path) {
                None => {
                    self.seen.insert(
                        path.clone(),
                        SeenEntry {
                            size: *size,
                            emitted: false,
                        },
                    );
                }
                Some(entry) if entry.emitted => {}
                Some(entry) => {
                    if entry.size == *size {
                        entry.emitted = true;
                        ready.push(path.clone());
                    } else {
                        entry.size = *size;
                    }
                }
            }
        }

        // Forget sidecars that were removed from disk.
        self.seen
            .retain(|path, _| found.iter().any(|(p, _)| p == path));
        ready
    }
}

fn collect_sidecars(dir: &Path, found: &mut Vec<(PathBuf, u64)>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_sidecars(&path, found);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            if let Ok(meta) = entry.metadata() {
                found.push((path, meta.len()));
            }
        }
    }
}

/// Loads and validates a ready sidecar.
fn load_sidecar(path: &Path) -> Option<RecordingComplete> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("[Watcher] Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    let payload: CallEndMsg = match serde_json::from_str(&text) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("[Watcher] Bad sidecar {}: {}", path.display(), e);
            return None;
        }
    };

    let wav_path = path.with_extension("wav");
    if !wav_path.exists() {
        log::warn!(
            "[Watcher] Sidecar {} has no matching WAV, dropping",
            path.display()
        );
        return None;
    }

    Some(RecordingComplete { payload, wav_path })
}

/// Watches the intake directory for finalized recording sidecars.
pub struct RecordingWatcher {
    root: PathBuf,
    correlator_tx: mpsc::Sender<CorrelatorInput>,
    cancel: CancellationToken,
}

impl RecordingWatcher {
    pub fn new(
        root: PathBuf,
        correlator_tx: mpsc::Sender<CorrelatorInput>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root,
            correlator_tx,
            cancel,
        }
    }

    /// Poll loop. Runs until cancelled.
    pub async fn run(self) {
        if !self.root.exists() {
            log::warn!(
                "[Watcher] Intake directory {} does not exist yet",
                self.root.display()
            );
        }
        let mut state = WatcherState::default();
        let mut interval = tokio::time::interval(Duration::from_millis(WATCHER_POLL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            for path in state.scan(&self.root) {
                if let Some(complete) = load_sidecar(&path) {
                    log::info!("[Watcher] Recording finalized: {}", path.display());
                    if self
                        .correlator_tx
                        .send(CorrelatorInput::Recording(complete))
                        .await
                        .is_err()
                    {
                        log::warn!("[Watcher] Correlator unavailable, stopping");
                        return;
                    }
                }
            }
        }
        log::info!("[Watcher] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, stem: &str, json: &str) -> PathBuf {
        let sidecar = dir.join(format!("{}.json", stem));
        std::fs::write(&sidecar, json).unwrap();
        std::fs::write(dir.join(format!("{}.wav", stem)), b"RIFF").unwrap();
        sidecar
    }

    const SIDECAR: &str = r#"{"freq":851150000,"talkgroup":927,"startTime":1704825600,
        "stopTime":1704825610,"length":10,"emergency":0,"encrypted":0,
        "filename":"927-1704825600.wav"}"#;

    #[test]
    fn sidecar_is_emitted_once_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = write_pair(dir.path(), "927-1704825600", SIDECAR);

        let mut state = WatcherState::default();
        // First observation: not yet ready (size must be stable across polls).
        assert!(state.scan(dir.path()).is_empty());
        // Second observation: stable, emitted.
        assert_eq!(state.scan(dir.path()), vec![sidecar.clone()]);
        // Re-observed: never emitted again.
        assert!(state.scan(dir.path()).is_empty());
        assert!(state.scan(dir.path()).is_empty());
    }

    #[test]
    fn growing_sidecar_waits_for_stability() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("a.json");
        std::fs::write(&sidecar, "{").unwrap();

        let mut state = WatcherState::default();
        assert!(state.scan(dir.path()).is_empty());

        // Still growing between polls.
        std::fs::write(&sidecar, SIDECAR).unwrap();
        assert!(state.scan(dir.path()).is_empty());

        // Now stable.
        assert_eq!(state.scan(dir.path()), vec![sidecar]);
    }

    #[test]
    fn nested_directories_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024/01/09");
        std::fs::create_dir_all(&nested).unwrap();
        let sidecar = write_pair(&nested, "927-1704825600", SIDECAR);

        let mut state = WatcherState::default();
        state.scan(dir.path());
        assert_eq!(state.scan(dir.path()), vec![sidecar]);
    }

    #[test]
    fn sidecar_without_wav_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("lonely.json");
        std::fs::write(&sidecar, SIDECAR).unwrap();

        assert!(load_sidecar(&sidecar).is_none());
    }

    #[test]
    fn valid_sidecar_loads_with_wav_path() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = write_pair(dir.path(), "927-1704825600", SIDECAR);

        let complete = load_sidecar(&sidecar).unwrap();
        assert_eq!(complete.payload.talkgroup, 927);
        assert_eq!(complete.payload.start_time, 1_704_825_600);
        assert_eq!(
            complete.wav_path,
            dir.path().join("927-1704825600.wav")
        );
    }
}
