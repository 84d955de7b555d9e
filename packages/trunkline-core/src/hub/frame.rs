//! Binary frame layout for audio and FFT broadcasts.
//!
//! Wire format, little-endian throughout:
//!
//! ```text
//! [4 B u32: header_len]
//! [header_len B: UTF-8 JSON header, "type" ∈ {"audio","fft"} + topic fields]
//! [payload: audio = raw PCM i16, fft = f32 magnitudes]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::calls::SystemType;
use crate::ingest::audio::EnrichedAudioFrame;
use crate::ingest::fft::FftPacket;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioHeaderMsg<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel_key: u64,
    talkgroup: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency: Option<u64>,
    sample_rate: u32,
    system_type: SystemType,
    #[serde(skip_serializing_if = "Option::is_none")]
    alpha_tag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FftHeaderMsg {
    #[serde(rename = "type")]
    kind: &'static str,
    source_index: u32,
    center_freq: u64,
    sample_rate: u32,
    timestamp: u64,
    fft_size: u32,
    min_freq: u64,
    max_freq: u64,
}

fn encode(header: &[u8], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(header);
    buf.put_slice(payload);
    buf.freeze()
}

/// Frames an enriched PCM frame for broadcast. `None` only on a serializer
/// failure, which is logged.
pub fn audio_frame(frame: &EnrichedAudioFrame) -> Option<Bytes> {
    let header = AudioHeaderMsg {
        kind: "audio",
        channel_key: frame.channel_key,
        talkgroup: frame.talkgroup,
        frequency: frame.frequency,
        sample_rate: frame.sample_rate,
        system_type: frame.system_type,
        alpha_tag: frame.alpha_tag.as_deref(),
        group_name: frame.group_name.as_deref(),
        source: frame.source.as_deref(),
    };
    match serde_json::to_vec(&header) {
        Ok(bytes) => Some(encode(&bytes, &frame.pcm)),
        Err(e) => {
            log::warn!("[Hub] Audio header serialization failed: {}", e);
            None
        }
    }
}

/// Frames an FFT packet for broadcast.
pub fn fft_frame(packet: &FftPacket) -> Option<Bytes> {
    let header = FftHeaderMsg {
        kind: "fft",
        source_index: packet.source_index,
        center_freq: packet.center_freq,
        sample_rate: packet.sample_rate,
        timestamp: packet.timestamp,
        fft_size: packet.fft_size,
        min_freq: packet.min_freq,
        max_freq: packet.max_freq,
    };
    match serde_json::to_vec(&header) {
        Ok(bytes) => Some(encode(&bytes, bytemuck::cast_slice(&packet.magnitudes))),
        Err(e) => {
            log::warn!("[Hub] FFT header serialization failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::audio::AudioWireFormat;

    fn decode(frame: &[u8]) -> (serde_json::Value, Vec<u8>) {
        let header_len =
            u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&frame[4..4 + header_len]).unwrap();
        (header, frame[4 + header_len..].to_vec())
    }

    #[test]
    fn audio_frame_is_wire_exact() {
        let pcm: Vec<u8> = vec![1, 0, 254, 255, 16, 0];
        let frame = EnrichedAudioFrame {
            channel_key: 927,
            talkgroup: 927,
            frequency: Some(851_150_000),
            sample_rate: 8000,
            source: None,
            emission: None,
            alpha_tag: Some("Control A2".into()),
            group_name: Some("Police".into()),
            group_tag: None,
            description: None,
            system_type: SystemType::Trunked,
            pcm: Bytes::from(pcm.clone()),
            format: AudioWireFormat::LengthPrefixedJson,
        };

        let encoded = audio_frame(&frame).unwrap();
        let (header, payload) = decode(&encoded);
        assert_eq!(header["type"], "audio");
        assert_eq!(header["channelKey"], 927);
        assert_eq!(header["sampleRate"], 8000);
        assert_eq!(header["alphaTag"], "Control A2");
        assert_eq!(payload, pcm);
    }

    #[test]
    fn fft_frame_payload_is_le_f32() {
        let packet = FftPacket {
            source_index: 0,
            center_freq: 852_000_000,
            sample_rate: 2_048_000,
            timestamp: 1_704_825_600_000,
            fft_size: 3,
            min_freq: 851_000_000,
            max_freq: 853_000_000,
            magnitudes: vec![-120.5, -90.25, -60.0],
        };

        let encoded = fft_frame(&packet).unwrap();
        let (header, payload) = decode(&encoded);
        assert_eq!(header["type"], "fft");
        assert_eq!(header["fftSize"], 3);

        assert_eq!(payload.len(), 12);
        let restored: Vec<f32> = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(restored, packet.magnitudes);
    }
}
