//! Process-wide view of control channels and currently active voice channels.
//!
//! Injected as an explicit dependency at bootstrap (never accessed through a
//! static); the correlator updates it on add/remove/reconcile and scanner
//! queries take snapshots.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;

use crate::events::{ControlChannelEvent, ControlEventKind};

/// Summary of an active call, as tracked for scanner queries.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCallInfo {
    pub freq: u64,
    pub talkgroup: u64,
    pub label: String,
    pub start: u64,
}

/// Marker kind for frequency-display overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerType {
    Control,
    Voice,
}

/// One frequency marker in a scanner snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    #[serde(rename = "type")]
    pub marker_type: MarkerType,
    pub freq: u64,
    pub label: String,
    pub active: bool,
}

/// Last-seen spectrum parameters, for scanner display queries.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpectrumSummary {
    pub center_freq: u64,
    pub sample_rate: u32,
    pub fft_size: u32,
    pub timestamp: u64,
}

/// Tracks control-channel frequencies and the active voice-channel set.
#[derive(Default)]
pub struct ChannelTracker {
    control_channels: RwLock<Vec<u64>>,
    active_calls: RwLock<HashMap<String, ActiveCallInfo>>,
    last_spectrum: RwLock<Option<SpectrumSummary>>,
}

impl ChannelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call becoming active.
    pub fn add_call(&self, id: &str, info: ActiveCallInfo) {
        self.active_calls.write().insert(id.to_string(), info);
    }

    /// Records a call ending.
    pub fn remove_call(&self, id: &str) {
        self.active_calls.write().remove(id);
    }

    /// Authoritative reconciliation: every tracked call not in `keep` is
    /// removed.
    pub fn reconcile(&self, keep: &HashSet<String>) {
        self.active_calls.write().retain(|id, _| keep.contains(id));
    }

    /// Learns control-channel frequencies from classified log lines.
    pub fn note_control_event(&self, event: &ControlChannelEvent) {
        if event.kind == ControlEventKind::SystemInfo {
            if let Some(freq) = event.frequency {
                let mut channels = self.control_channels.write();
                if !channels.contains(&freq) {
                    channels.push(freq);
                    log::info!("[Tracker] Control channel observed at {} Hz", freq);
                }
            }
        }
    }

    /// Records the parameters of the latest spectrum frame.
    pub fn note_spectrum(&self, packet: &crate::ingest::fft::FftPacket) {
        *self.last_spectrum.write() = Some(SpectrumSummary {
            center_freq: packet.center_freq,
            sample_rate: packet.sample_rate,
            fft_size: packet.fft_size,
            timestamp: packet.timestamp,
        });
    }

    /// Parameters of the most recently seen spectrum frame, if any.
    pub fn last_spectrum(&self) -> Option<SpectrumSummary> {
        self.last_spectrum.read().clone()
    }

    /// Known control-channel frequencies.
    pub fn control_channels(&self) -> Vec<u64> {
        self.control_channels.read().clone()
    }

    /// Snapshot of the active-call map.
    pub fn active_calls(&self) -> HashMap<String, ActiveCallInfo> {
        self.active_calls.read().clone()
    }

    /// Snapshot of frequency markers for scanner displays.
    pub fn markers(&self) -> Vec<Marker> {
        let mut markers: Vec<Marker> = self
            .control_channels
            .read()
            .iter()
            .map(|&freq| Marker {
                marker_type: MarkerType::Control,
                freq,
                label: "Control".to_string(),
                active: true,
            })
            .collect();
        markers.extend(self.active_calls.read().values().map(|call| Marker {
            marker_type: MarkerType::Voice,
            freq: call.freq,
            label: call.label.clone(),
            active: true,
        }));
        markers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ControlChannelEvent;

    fn info(freq: u64, tg: u64) -> ActiveCallInfo {
        ActiveCallInfo {
            freq,
            talkgroup: tg,
            label: format!("TG {}", tg),
            start: 1_704_825_600,
        }
    }

    #[test]
    fn reconcile_removes_unlisted_calls() {
        let tracker = ChannelTracker::new();
        tracker.add_call("927-1", info(851_150_000, 927));
        tracker.add_call("928-2", info(852_000_000, 928));

        let keep: HashSet<String> = ["927-1".to_string()].into_iter().collect();
        tracker.reconcile(&keep);

        let active = tracker.active_calls();
        assert_eq!(active.len(), 1);
        assert!(active.contains_key("927-1"));
    }

    #[test]
    fn system_info_lines_register_control_channels() {
        let tracker = ChannelTracker::new();
        let mut event = ControlChannelEvent::new(
            ControlEventKind::SystemInfo,
            1,
            "WACN: 781A3 NAC: 30A System ID: 3A1".into(),
        );
        event.frequency = Some(851_012_500);

        tracker.note_control_event(&event);
        tracker.note_control_event(&event); // idempotent
        assert_eq!(tracker.control_channels(), vec![851_012_500]);

        let markers = tracker.markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].marker_type, MarkerType::Control);
    }

    #[test]
    fn markers_include_active_voice_channels() {
        let tracker = ChannelTracker::new();
        tracker.add_call("927-1", info(851_150_000, 927));
        let markers = tracker.markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].marker_type, MarkerType::Voice);
        assert_eq!(markers[0].freq, 851_150_000);
    }
}
