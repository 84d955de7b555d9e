//! UDP audio ingestor.
//!
//! One datagram in, one [`EnrichedAudioFrame`] out. The decoder ships PCM in
//! four wire formats which are auto-detected per datagram, in order:
//!
//! 1. `u32le len | JSON header | PCM` with `0 < len < 10000` and
//!    `len < datagram_len`
//! 2. four opaque bytes, then brace-matched JSON starting at offset 4, then PCM
//! 3. brace-matched JSON at offset 0, then PCM
//! 4. `u32le talkgroup | PCM`
//!
//! A JSON parse failure at one step falls through to the next. Malformed
//! datagrams are counted and dropped; parsing never blocks the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::MetadataCache;
use crate::calls::SystemType;
use crate::error::TrunklineResult;
use crate::events::{EventEmitter, HubEvent};
use crate::protocol_constants::{
    AUDIO_JSON_MAX_LEN, AUDIO_JSON_SCAN_BOUND, DEFAULT_AUDIO_SAMPLE_RATE,
    INGEST_LOG_FRAME_INTERVAL, INGEST_LOG_SECS, MALFORMED_RATE_THRESHOLD_PER_MIN,
};

// ─────────────────────────────────────────────────────────────────────────────
// Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// Which of the four audio wire formats a datagram arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioWireFormat {
    LengthPrefixedJson,
    EmbeddedJsonAt4,
    RawJsonAt0,
    TalkgroupOnly,
}

/// Optional metadata fields the decoder may put in the JSON header.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioHeader {
    #[serde(default)]
    pub talkgroup: Option<u64>,
    #[serde(default)]
    pub tgid: Option<u64>,
    #[serde(default, alias = "frequency")]
    pub freq: Option<u64>,
    #[serde(default, alias = "sampleRate")]
    pub audio_sample_rate: Option<u32>,
    #[serde(default, alias = "src")]
    pub source: Option<Value>,
    #[serde(default, alias = "audio_type")]
    pub emission: Option<String>,
}

impl AudioHeader {
    /// Source unit as display text, whether the decoder sent it as number or
    /// string.
    fn source_label(&self) -> Option<String> {
        match &self.source {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A parsed (not yet enriched) audio datagram.
#[derive(Debug, Clone)]
pub struct ParsedAudio {
    pub format: AudioWireFormat,
    pub talkgroup: u64,
    pub header: AudioHeader,
    pub pcm: Bytes,
}

/// One PCM frame, enriched from the metadata cache, ready for fan-out.
#[derive(Debug, Clone)]
pub struct EnrichedAudioFrame {
    /// Topic key: talkgroup on trunked systems, frequency on conventional.
    pub channel_key: u64,
    pub talkgroup: u64,
    pub frequency: Option<u64>,
    pub sample_rate: u32,
    pub source: Option<String>,
    pub emission: Option<String>,
    pub alpha_tag: Option<String>,
    pub group_name: Option<String>,
    pub group_tag: Option<String>,
    pub description: Option<String>,
    pub system_type: SystemType,
    /// Raw signed 16-bit little-endian PCM.
    pub pcm: Bytes,
    pub format: AudioWireFormat,
}

/// Finds the end (exclusive) of a brace-balanced JSON object starting at
/// `start`, scanning at most [`AUDIO_JSON_SCAN_BOUND`] bytes.
fn find_json_end(buf: &[u8], start: usize) -> Option<usize> {
    if buf.get(start) != Some(&b'{') {
        return None;
    }
    let bound = buf.len().min(start + AUDIO_JSON_SCAN_BOUND);
    let mut depth = 0usize;
    for (i, &b) in buf[start..bound].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses one datagram, applying the four-format detection precedence.
pub fn parse_audio_datagram(buf: &[u8]) -> Result<ParsedAudio, String> {
    if buf.len() < 4 {
        return Err(format!("datagram too short: {} bytes", buf.len()));
    }
    let lead = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);

    // Format 1: length-prefixed JSON header.
    if lead > 0 && lead < AUDIO_JSON_MAX_LEN && (lead as usize) < buf.len() {
        let end = 4 + lead as usize;
        if end <= buf.len() {
            if let Ok(header) = serde_json::from_slice::<AudioHeader>(&buf[4..end]) {
                let talkgroup = header.talkgroup.or(header.tgid).unwrap_or(0);
                return Ok(ParsedAudio {
                    format: AudioWireFormat::LengthPrefixedJson,
                    talkgroup,
                    header,
                    pcm: Bytes::copy_from_slice(&buf[end..]),
                });
            }
        }
    }

    // Format 2: embedded JSON at offset 4.
    if let Some(end) = find_json_end(buf, 4) {
        if let Ok(header) = serde_json::from_slice::<AudioHeader>(&buf[4..end]) {
            let talkgroup = header.talkgroup.or(header.tgid).unwrap_or(0);
            return Ok(ParsedAudio {
                format: AudioWireFormat::EmbeddedJsonAt4,
                talkgroup,
                header,
                pcm: Bytes::copy_from_slice(&buf[end..]),
            });
        }
    }

    // Format 3: raw JSON at offset 0.
    if let Some(end) = find_json_end(buf, 0) {
        if let Ok(header) = serde_json::from_slice::<AudioHeader>(&buf[..end]) {
            let talkgroup = header.talkgroup.or(header.tgid).unwrap_or(0);
            return Ok(ParsedAudio {
                format: AudioWireFormat::RawJsonAt0,
                talkgroup,
                header,
                pcm: Bytes::copy_from_slice(&buf[end..]),
            });
        }
    }

    // Format 4: the leading u32 is the talkgroup itself.
    Ok(ParsedAudio {
        format: AudioWireFormat::TalkgroupOnly,
        talkgroup: lead as u64,
        header: AudioHeader::default(),
        pcm: Bytes::copy_from_slice(&buf[4..]),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingestor Task
// ─────────────────────────────────────────────────────────────────────────────

/// UDP audio ingestor.
///
/// Binds at construction (so a busy port fails startup), runs as an
/// independent task. Fan-out targets get their own channels; the hot loop
/// only ever does `try_send`.
pub struct AudioIngestor {
    socket: tokio::net::UdpSocket,
    cache: Arc<MetadataCache>,
    system_type: SystemType,
    hub_tx: mpsc::Sender<EnrichedAudioFrame>,
    dispatch_tx: mpsc::Sender<EnrichedAudioFrame>,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
}

impl AudioIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        addr: SocketAddr,
        cache: Arc<MetadataCache>,
        system_type: SystemType,
        hub_tx: mpsc::Sender<EnrichedAudioFrame>,
        dispatch_tx: mpsc::Sender<EnrichedAudioFrame>,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> TrunklineResult<Self> {
        let socket = super::bind_udp(addr, "audio")?;
        log::info!("[Audio] Listening on {}", addr);
        Ok(Self {
            socket,
            cache,
            system_type,
            hub_tx,
            dispatch_tx,
            emitter,
            cancel,
        })
    }

    /// Receive loop. Runs until cancelled.
    pub async fn run(self) {
        let mut buf = vec![0u8; 65536];
        let mut frames: u64 = 0;
        let mut malformed: u64 = 0;
        let mut dropped: u64 = 0;
        let mut last_log = Instant::now();
        let mut rate = MalformedRate::new();

        loop {
            let len = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, _peer)) => len,
                    Err(e) => {
                        log::warn!("[Audio] recv error: {}", e);
                        continue;
                    }
                },
            };

            match parse_audio_datagram(&buf[..len]) {
                Ok(parsed) => {
                    let frame = self.enrich(parsed);
                    if self.hub_tx.try_send(frame.clone()).is_err() {
                        dropped += 1;
                    }
                    if self.dispatch_tx.try_send(frame).is_err() {
                        dropped += 1;
                    }
                    frames += 1;
                }
                Err(reason) => {
                    malformed += 1;
                    log::debug!("[Audio] Dropping malformed datagram: {}", reason);
                    if rate.record() {
                        self.emitter.emit(HubEvent::Error {
                            error: format!("audio ingest: malformed datagram rate high ({})", reason),
                        });
                    }
                }
            }

            if (frames > 0 && frames % INGEST_LOG_FRAME_INTERVAL == 0)
                || last_log.elapsed() >= Duration::from_secs(INGEST_LOG_SECS)
            {
                if frames > 0 || malformed > 0 {
                    log::info!(
                        "[Audio] {} frames ingested ({} malformed, {} dropped on full channel)",
                        frames,
                        malformed,
                        dropped
                    );
                }
                last_log = Instant::now();
            }
        }
        log::info!("[Audio] Ingestor stopped");
    }

    fn enrich(&self, parsed: ParsedAudio) -> EnrichedAudioFrame {
        let channel_key = match self.system_type {
            SystemType::Trunked => parsed.talkgroup,
            SystemType::Conventional => parsed.header.freq.unwrap_or(parsed.talkgroup),
        };
        let meta = self.cache.lookup_cached(channel_key);
        EnrichedAudioFrame {
            channel_key,
            talkgroup: parsed.talkgroup,
            frequency: parsed.header.freq,
            sample_rate: parsed
                .header
                .audio_sample_rate
                .unwrap_or(DEFAULT_AUDIO_SAMPLE_RATE),
            source: parsed.header.source_label(),
            emission: parsed.header.emission.clone(),
            alpha_tag: meta.as_ref().map(|m| m.alpha_tag.clone()),
            group_name: meta.as_ref().map(|m| m.group_name.clone()),
            group_tag: meta.as_ref().map(|m| m.group_tag.clone()),
            description: meta.map(|m| m.description),
            system_type: self.system_type,
            pcm: parsed.pcm,
            format: parsed.format,
        }
    }
}

/// Sliding one-minute window for the malformed-input error event.
struct MalformedRate {
    window_start: Instant,
    count: u64,
    signalled: bool,
}

impl MalformedRate {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            signalled: false,
        }
    }

    /// Records one malformed input; returns true the first time the rate
    /// crosses the threshold within the current window.
    fn record(&mut self) -> bool {
        if self.window_start.elapsed() >= Duration::from_secs(60) {
            self.window_start = Instant::now();
            self.count = 0;
            self.signalled = false;
        }
        self.count += 1;
        if self.count > MALFORMED_RATE_THRESHOLD_PER_MIN && !self.signalled {
            self.signalled = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram_format1(header: &str, pcm: &[u8]) -> Vec<u8> {
        let mut buf = (header.len() as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(pcm);
        buf
    }

    #[test]
    fn length_prefixed_json_detected() {
        let header = r#"{"talkgroup":927,"freq":852387500,"audio_sample_rate":8000}"#;
        let pcm = vec![0u8; 1600];
        let buf = datagram_format1(header, &pcm);
        assert_eq!(buf.len(), 4 + header.len() + 1600);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::LengthPrefixedJson);
        assert_eq!(parsed.talkgroup, 927);
        assert_eq!(parsed.header.freq, Some(852_387_500));
        assert_eq!(parsed.header.audio_sample_rate, Some(8000));
        assert_eq!(parsed.pcm.len(), 1600);
    }

    #[test]
    fn talkgroup_only_detected() {
        let mut buf = 12345u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::TalkgroupOnly);
        assert_eq!(parsed.talkgroup, 12345);
        assert_eq!(parsed.pcm.len(), 12);
    }

    #[test]
    fn zero_length_prefix_is_talkgroup_zero() {
        // A leading 0 must not be treated as a JSON length.
        let mut buf = 0u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 32]);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::TalkgroupOnly);
        assert_eq!(parsed.talkgroup, 0);
    }

    #[test]
    fn length_9999_is_valid_format1() {
        let mut header = String::from(r#"{"talkgroup":42,"pad":""#);
        while header.len() < 9997 {
            header.push('x');
        }
        header.push_str("\"}");
        assert_eq!(header.len(), 9999);

        let buf = datagram_format1(&header, &[0u8; 4]);
        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::LengthPrefixedJson);
        assert_eq!(parsed.talkgroup, 42);
    }

    #[test]
    fn length_10000_falls_back_to_talkgroup() {
        let mut buf = 10_000u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 64]);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::TalkgroupOnly);
        assert_eq!(parsed.talkgroup, 10_000);
    }

    #[test]
    fn embedded_json_at_offset_4() {
        let mut buf = 0xFFFF_FFFFu32.to_le_bytes().to_vec();
        buf.extend_from_slice(br#"{"tgid":300}"#);
        buf.extend_from_slice(&[9u8; 20]);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::EmbeddedJsonAt4);
        assert_eq!(parsed.talkgroup, 300);
        assert_eq!(parsed.pcm.len(), 20);
    }

    #[test]
    fn raw_json_at_offset_0() {
        let mut buf = br#"{"talkgroup":515,"freq":771356250}"#.to_vec();
        buf.extend_from_slice(&[0u8; 10]);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::RawJsonAt0);
        assert_eq!(parsed.talkgroup, 515);
        assert_eq!(parsed.pcm.len(), 10);
    }

    #[test]
    fn bad_length_prefixed_json_falls_through() {
        // Valid length prefix but the bytes are not JSON, and byte 4 is '{'
        // with garbage after it: detection lands on format 4.
        let mut buf = 8u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"{notjson");
        buf.extend_from_slice(&[0u8; 16]);

        let parsed = parse_audio_datagram(&buf).unwrap();
        assert_eq!(parsed.format, AudioWireFormat::TalkgroupOnly);
        assert_eq!(parsed.talkgroup, 8);
    }

    #[test]
    fn reparse_yields_same_frame() {
        // Format-1 round trip: parse, re-emit with the same metadata and PCM,
        // parse again.
        let header = r#"{"talkgroup":927,"freq":852387500}"#;
        let pcm: Vec<u8> = (0..=255).collect();
        let first = parse_audio_datagram(&datagram_format1(header, &pcm)).unwrap();

        let reemitted = datagram_format1(header, &first.pcm);
        let second = parse_audio_datagram(&reemitted).unwrap();

        assert_eq!(second.format, first.format);
        assert_eq!(second.talkgroup, first.talkgroup);
        assert_eq!(second.pcm, first.pcm);
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert!(parse_audio_datagram(&[1, 2]).is_err());
    }
}
