//! Call domain model: canonical identifiers, call records, and sources.
//!
//! A call is keyed by its logical channel: the talkgroup number on a trunked
//! system, the frequency in Hz on a conventional one. Everything downstream
//! (persistence, broadcast, dispatch) refers to calls by the deterministic
//! canonical ID derived here.

pub mod correlator;
pub mod tracker;

use serde::{Deserialize, Serialize};

/// Whether the monitored system is trunked (P25) or conventional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemType {
    Trunked,
    Conventional,
}

impl SystemType {
    /// Resolves the persisted `system_type` config value.
    ///
    /// Only `"conventional"` selects conventional rules; every other value
    /// (including the seeded `"p25"`) is trunked.
    #[must_use]
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("conventional") {
            Self::Conventional
        } else {
            Self::Trunked
        }
    }

    /// Returns the value stored in the `calls.system_type` column.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trunked => "trunked",
            Self::Conventional => "conventional",
        }
    }
}

/// Builds the canonical call ID: `"{channel_key}-{start_unix_seconds}"`.
///
/// The channel key is the talkgroup number for trunked systems and the
/// frequency in Hz for conventional ones. The same ID is emitted across
/// call-start and call-end even when the decoder's own `id` differs.
#[must_use]
pub fn canonical_call_id(channel_key: u64, start_secs: u64) -> String {
    format!("{}-{}", channel_key, start_secs)
}

/// Splits a canonical call ID back into `(channel_key, start_secs)`.
#[must_use]
pub fn split_call_id(id: &str) -> Option<(u64, u64)> {
    let (key, start) = id.split_once('-')?;
    Some((key.parse().ok()?, start.parse().ok()?))
}

/// A radio unit identified during a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallSource {
    /// Source radio unit number.
    pub source_id: u64,
    /// Unix seconds the unit was observed.
    pub timestamp: u64,
    /// Offset within the call, in seconds.
    pub position: f64,
    /// Whether the unit keyed up with the emergency bit set.
    pub emergency: bool,
    /// Free-form tag supplied by the decoder catalog.
    #[serde(default)]
    pub tag: String,
}

/// A single voice transmission, as persisted and broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Canonical ID, `"{channel_key}-{start_secs}"`.
    pub id: String,
    /// Trunked or conventional rules applied to this call.
    pub system_type: SystemType,
    /// Talkgroup (trunked) or frequency in Hz (conventional).
    pub channel_key: u64,
    /// Persisted `talkgroup_id` column; 0 on conventional systems.
    pub talkgroup_id: u64,
    /// Persisted `channel_id` column; set on conventional systems only.
    pub channel_id: Option<i64>,
    /// Voice frequency in Hz.
    pub frequency: u64,
    /// Start of the transmission, Unix seconds.
    pub start_time: u64,
    /// End of the transmission; `None` while active.
    pub stop_time: Option<u64>,
    /// Duration in seconds; `None` while active.
    pub duration: Option<f64>,
    pub emergency: bool,
    pub encrypted: bool,
    /// Absolute path of the recorded WAV, once known.
    pub audio_file: Option<String>,
    pub audio_type: Option<String>,
    /// Units heard during the call, in observation order.
    pub sources: Vec<CallSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_is_deterministic() {
        assert_eq!(canonical_call_id(927, 1_704_825_600), "927-1704825600");
        assert_eq!(
            canonical_call_id(771_356_250, 1_704_825_600),
            "771356250-1704825600"
        );
    }

    #[test]
    fn split_inverts_canonical_id() {
        let id = canonical_call_id(927, 1_704_825_600);
        assert_eq!(split_call_id(&id), Some((927, 1_704_825_600)));
        assert_eq!(split_call_id("garbage"), None);
    }

    #[test]
    fn only_conventional_config_selects_conventional() {
        assert_eq!(SystemType::from_config("p25"), SystemType::Trunked);
        assert_eq!(SystemType::from_config("smartnet"), SystemType::Trunked);
        assert_eq!(
            SystemType::from_config("conventional"),
            SystemType::Conventional
        );
        assert_eq!(
            SystemType::from_config("Conventional"),
            SystemType::Conventional
        );
    }
}
