//! UDP FFT ingestor.
//!
//! Every datagram is `"FFTD" | u32le meta_len | u32le fft_size | JSON meta |
//! fft_size × f32le` magnitudes in dB. Datagrams failing the magic check or
//! whose size doesn't match exactly are dropped with a counter increment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::calls::tracker::ChannelTracker;
use crate::error::TrunklineResult;
use crate::protocol_constants::{FFT_HEADER_LEN, FFT_MAGIC, INGEST_LOG_SECS};
use crate::utils::now_millis;

/// One spectrum frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FftPacket {
    pub source_index: u32,
    pub center_freq: u64,
    pub sample_rate: u32,
    /// Emission timestamp, Unix milliseconds.
    pub timestamp: u64,
    pub fft_size: u32,
    pub min_freq: u64,
    pub max_freq: u64,
    /// Magnitudes in dB, length = `fft_size`.
    pub magnitudes: Vec<f32>,
}

/// JSON metadata carried in the datagram.
#[derive(Debug, Default, Deserialize)]
struct FftMeta {
    #[serde(default, alias = "sourceIndex")]
    source_index: u32,
    #[serde(default, alias = "centerFreq")]
    center_freq: u64,
    #[serde(default, alias = "sampleRate")]
    sample_rate: u32,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default, alias = "minFreq")]
    min_freq: Option<u64>,
    #[serde(default, alias = "maxFreq")]
    max_freq: Option<u64>,
}

/// Parses one FFT datagram. Errors describe why it was dropped.
pub fn parse_fft_datagram(buf: &[u8]) -> Result<FftPacket, String> {
    if buf.len() < FFT_HEADER_LEN {
        return Err(format!("datagram too short: {} bytes", buf.len()));
    }
    if &buf[0..4] != FFT_MAGIC {
        return Err("bad magic".to_string());
    }
    let meta_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as u64;
    let fft_size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

    let expected = FFT_HEADER_LEN as u64 + meta_len + 4 * fft_size as u64;
    if buf.len() as u64 != expected {
        return Err(format!(
            "size mismatch: {} bytes, expected {}",
            buf.len(),
            expected
        ));
    }

    let meta_end = FFT_HEADER_LEN + meta_len as usize;
    let meta: FftMeta = serde_json::from_slice(&buf[FFT_HEADER_LEN..meta_end])
        .map_err(|e| format!("bad metadata: {}", e))?;

    let mut magnitudes = Vec::with_capacity(fft_size as usize);
    for chunk in buf[meta_end..].chunks_exact(4) {
        magnitudes.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    let half_span = meta.sample_rate as u64 / 2;
    Ok(FftPacket {
        source_index: meta.source_index,
        center_freq: meta.center_freq,
        sample_rate: meta.sample_rate,
        timestamp: meta.timestamp.unwrap_or_else(now_millis),
        fft_size,
        min_freq: meta
            .min_freq
            .unwrap_or_else(|| meta.center_freq.saturating_sub(half_span)),
        max_freq: meta.max_freq.unwrap_or_else(|| meta.center_freq + half_span),
        magnitudes,
    })
}

/// UDP FFT ingestor task.
///
/// Fan-out: broadcast hub (live), spectrum recorder (when active), and the
/// channel tracker for scanner queries.
pub struct FftIngestor {
    socket: tokio::net::UdpSocket,
    hub_tx: mpsc::Sender<FftPacket>,
    recorder_tx: mpsc::Sender<FftPacket>,
    tracker: Arc<ChannelTracker>,
    cancel: CancellationToken,
}

impl FftIngestor {
    pub fn bind(
        addr: SocketAddr,
        hub_tx: mpsc::Sender<FftPacket>,
        recorder_tx: mpsc::Sender<FftPacket>,
        tracker: Arc<ChannelTracker>,
        cancel: CancellationToken,
    ) -> TrunklineResult<Self> {
        let socket = super::bind_udp(addr, "fft")?;
        log::info!("[FFT] Listening on {}", addr);
        Ok(Self {
            socket,
            hub_tx,
            recorder_tx,
            tracker,
            cancel,
        })
    }

    /// Receive loop. Runs until cancelled.
    pub async fn run(self) {
        let mut buf = vec![0u8; 256 * 1024];
        let mut packets: u64 = 0;
        let mut malformed: u64 = 0;
        let mut last_log = Instant::now();

        loop {
            let len = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, _peer)) => len,
                    Err(e) => {
                        log::warn!("[FFT] recv error: {}", e);
                        continue;
                    }
                },
            };

            match parse_fft_datagram(&buf[..len]) {
                Ok(packet) => {
                    self.tracker.note_spectrum(&packet);
                    if self.hub_tx.try_send(packet.clone()).is_err() {
                        log::trace!("[FFT] Hub channel full, packet dropped");
                    }
                    let _ = self.recorder_tx.try_send(packet);
                    packets += 1;
                }
                Err(reason) => {
                    malformed += 1;
                    log::debug!("[FFT] Dropping datagram: {}", reason);
                }
            }

            if last_log.elapsed() >= Duration::from_secs(INGEST_LOG_SECS)
                && (packets > 0 || malformed > 0)
            {
                log::info!("[FFT] {} packets ingested ({} malformed)", packets, malformed);
                last_log = Instant::now();
            }
        }
        log::info!("[FFT] Ingestor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn build_datagram(meta: &str, magnitudes: &[f32]) -> Vec<u8> {
        let mut buf = FFT_MAGIC.to_vec();
        buf.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(magnitudes.len() as u32).to_le_bytes());
        buf.extend_from_slice(meta.as_bytes());
        for m in magnitudes {
            buf.extend_from_slice(&m.to_le_bytes());
        }
        buf
    }

    #[test]
    fn parses_well_formed_datagram() {
        let meta = r#"{"sourceIndex":1,"centerFreq":852000000,"sampleRate":2048000,"timestamp":1704825600000}"#;
        let mags: Vec<f32> = (0..512).map(|i| -120.0 + i as f32 * 0.1).collect();
        let buf = build_datagram(meta, &mags);

        let packet = parse_fft_datagram(&buf).unwrap();
        assert_eq!(packet.source_index, 1);
        assert_eq!(packet.center_freq, 852_000_000);
        assert_eq!(packet.fft_size, 512);
        assert_eq!(packet.timestamp, 1_704_825_600_000);
        assert_eq!(packet.magnitudes, mags);
        // Derived from center ± sample_rate / 2 when absent.
        assert_eq!(packet.min_freq, 852_000_000 - 1_024_000);
        assert_eq!(packet.max_freq, 852_000_000 + 1_024_000);
    }

    #[test]
    fn rejects_bad_magic() {
        let meta = r#"{}"#;
        let mut buf = build_datagram(meta, &[0.0; 4]);
        buf[0] = b'X';
        assert!(parse_fft_datagram(&buf).unwrap_err().contains("magic"));
    }

    #[test]
    fn rejects_size_mismatch() {
        let meta = r#"{}"#;
        let mut buf = build_datagram(meta, &[0.0; 4]);
        buf.push(0);
        assert!(parse_fft_datagram(&buf)
            .unwrap_err()
            .contains("size mismatch"));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(parse_fft_datagram(b"FFTD\x00").is_err());
    }
}
