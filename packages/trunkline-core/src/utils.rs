//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in whole seconds.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Display Formatting
// ─────────────────────────────────────────────────────────────────────────────

/// Formats a frequency in Hz as a display label, e.g. `"771.3563 MHz"`.
///
/// Used as the fallback label for conventional channels that carry no
/// alpha tag: four decimal places of megahertz.
#[must_use]
pub fn format_mhz(freq_hz: u64) -> String {
    format!("{:.4} MHz", freq_hz as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mhz_label_rounds_to_four_places() {
        assert_eq!(format_mhz(771_356_250), "771.3563 MHz");
        assert_eq!(format_mhz(851_150_000), "851.1500 MHz");
        assert_eq!(format_mhz(0), "0.0000 MHz");
    }

    #[test]
    fn now_secs_tracks_now_millis() {
        let secs = now_secs();
        let millis = now_millis();
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }
}
