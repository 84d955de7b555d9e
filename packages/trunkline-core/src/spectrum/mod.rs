//! Spectrum recording on-disk format and file helpers.
//!
//! Each recording is a single JSON file at `<recordings_dir>/<id>` holding
//! time-aligned FFT packets and control-channel events with relative-time
//! offsets (milliseconds from recording start). Writes are atomic: the file
//! is created as `<id>.tmp` and renamed on finalize; orphaned `.tmp` files
//! from a crashed process are discarded at startup.

pub mod recorder;
pub mod replayer;

pub use recorder::{SpectrumHandle, SpectrumService};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TrunklineError, TrunklineResult};
use crate::events::ControlChannelEvent;

/// Header metadata of a persisted recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub id: String,
    pub name: String,
    /// Unix milliseconds.
    pub start_time: u64,
    pub end_time: u64,
    /// Seconds.
    pub duration: f64,
    pub center_freq: u64,
    pub sample_rate: u32,
    pub fft_size: u32,
    pub min_freq: u64,
    pub max_freq: u64,
    pub packet_count: usize,
    pub control_channel_events: usize,
    /// Grant events captured during the recording.
    pub transmissions: usize,
    pub unique_talkgroups: usize,
    /// On-disk byte size; filled from the filesystem at read time.
    pub file_size: u64,
}

/// One captured spectrum frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedPacket {
    /// Unix milliseconds at capture.
    pub timestamp: u64,
    /// Milliseconds since recording start.
    pub relative_time: u64,
    pub magnitudes: Vec<f32>,
}

/// One captured control-channel event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    #[serde(flatten)]
    pub event: ControlChannelEvent,
    /// Milliseconds since recording start.
    pub relative_time: u64,
}

/// The full on-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    pub metadata: RecordingMetadata,
    pub packets: Vec<RecordedPacket>,
    pub control_channel_events: Vec<RecordedEvent>,
}

/// Rejects IDs that could escape the recordings directory.
fn validate_id(id: &str) -> TrunklineResult<()> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.starts_with('.')
    {
        return Err(TrunklineError::Protocol(format!(
            "invalid recording id: {:?}",
            id
        )));
    }
    Ok(())
}

/// Atomically writes a finalized recording: `<id>.tmp` then rename.
pub(crate) fn write_recording(dir: &Path, file: &RecordingFile) -> TrunklineResult<()> {
    validate_id(&file.metadata.id)?;
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{}.tmp", file.metadata.id));
    let target = dir.join(&file.metadata.id);

    let bytes = serde_json::to_vec(file)?;
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

/// Loads a recording by ID, filling `file_size` from the filesystem.
pub(crate) fn load_recording(dir: &Path, id: &str) -> TrunklineResult<RecordingFile> {
    validate_id(id)?;
    let path = dir.join(id);
    let bytes = std::fs::read(&path)
        .map_err(|_| TrunklineError::NotFound(format!("recording {}", id)))?;
    let mut file: RecordingFile = serde_json::from_slice(&bytes)?;
    file.metadata.file_size = bytes.len() as u64;
    Ok(file)
}

/// Deletes a recording by ID.
pub(crate) fn delete_recording(dir: &Path, id: &str) -> TrunklineResult<()> {
    validate_id(id)?;
    std::fs::remove_file(dir.join(id))
        .map_err(|_| TrunklineError::NotFound(format!("recording {}", id)))
}

/// Lists recording metadata, newest first.
pub(crate) fn list_recordings(dir: &Path) -> Vec<RecordingMetadata> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<RecordingMetadata> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() || path.extension().is_some() {
                return None;
            }
            let id = path.file_name()?.to_str()?.to_string();
            match load_recording(dir, &id) {
                Ok(file) => Some(file.metadata),
                Err(e) => {
                    log::warn!("[Spectrum] Skipping unreadable recording {}: {}", id, e);
                    None
                }
            }
        })
        .collect();
    out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    out
}

/// Removes `.tmp` orphans left behind by a crashed recorder.
pub(crate) fn discard_orphans(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            if std::fs::remove_file(&path).is_ok() {
                log::warn!(
                    "[Spectrum] Discarded orphaned recording {}",
                    path.display()
                );
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ControlEventKind;

    pub(crate) fn sample_file(id: &str) -> RecordingFile {
        let packets: Vec<RecordedPacket> = (0..5)
            .map(|i| RecordedPacket {
                timestamp: 1_704_825_600_000 + i * 200,
                relative_time: i * 200,
                magnitudes: vec![-120.0 + i as f32, -90.5, -60.25],
            })
            .collect();
        let events = vec![RecordedEvent {
            event: {
                let mut e = ControlChannelEvent::new(
                    ControlEventKind::Grant,
                    1_704_825_600_500,
                    "TG: 927 Freq: 851150000 Starting P25 Recorder num [0]".into(),
                );
                e.talkgroup = Some(927);
                e.frequency = Some(851_150_000);
                e
            },
            relative_time: 500,
        }];
        RecordingFile {
            metadata: RecordingMetadata {
                id: id.to_string(),
                name: "test capture".into(),
                start_time: 1_704_825_600_000,
                end_time: 1_704_825_601_000,
                duration: 1.0,
                center_freq: 852_000_000,
                sample_rate: 2_048_000,
                fft_size: 3,
                min_freq: 851_000_000,
                max_freq: 853_000_000,
                packet_count: packets.len(),
                control_channel_events: events.len(),
                transmissions: 1,
                unique_talkgroups: 1,
                file_size: 0,
            },
            packets,
            control_channel_events: events,
        }
    }

    #[test]
    fn round_trip_preserves_packets_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample_file("rec-1");
        write_recording(dir.path(), &file).unwrap();

        // No .tmp left behind; the final file exists.
        assert!(!dir.path().join("rec-1.tmp").exists());
        assert!(dir.path().join("rec-1").exists());

        let loaded = load_recording(dir.path(), "rec-1").unwrap();
        assert_eq!(loaded.packets, file.packets);
        assert_eq!(loaded.control_channel_events, file.control_channel_events);
        assert_eq!(loaded.metadata.packet_count, file.packets.len());
        assert!(loaded.metadata.file_size > 0);
    }

    #[test]
    fn listing_returns_metadata_and_skips_tmp() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &sample_file("rec-a")).unwrap();
        std::fs::write(dir.path().join("rec-b.tmp"), b"{}").unwrap();

        let list = list_recordings(dir.path());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "rec-a");
    }

    #[test]
    fn orphan_tmp_files_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &sample_file("rec-keep")).unwrap();
        std::fs::write(dir.path().join("rec-dead.tmp"), b"{").unwrap();

        assert_eq!(discard_orphans(dir.path()), 1);
        assert!(dir.path().join("rec-keep").exists());
        assert!(!dir.path().join("rec-dead.tmp").exists());
    }

    #[test]
    fn path_escaping_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_recording(dir.path(), "../etc/passwd").is_err());
        assert!(delete_recording(dir.path(), "a/b").is_err());
        assert!(load_recording(dir.path(), ".hidden").is_err());
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &sample_file("rec-x")).unwrap();
        delete_recording(dir.path(), "rec-x").unwrap();
        assert!(load_recording(dir.path(), "rec-x").is_err());
        assert!(delete_recording(dir.path(), "rec-x").is_err());
    }
}
