//! Downstream dispatch streamer.
//!
//! Relays live PCM frames to an external dispatch console: a supervisory
//! TCP connection to `host:port` (JSON control messages, reconnecting with
//! exponential backoff) and a UDP data stream to `host:port+1` with a
//! compact fixed header per packet.
//!
//! Per-call state: the first frame of a channel opens a call (TCP start
//! message); a correlator end notice or 3 s without frames closes it. An
//! end message that fails on TCP is retried after reconnect within a 10 s
//! grace window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::calls::split_call_id;
use crate::config::DispatchConfig;
use crate::error::{TrunklineError, TrunklineResult};
use crate::ingest::audio::EnrichedAudioFrame;
use crate::protocol_constants::{
    DISPATCH_BACKOFF_CAP_SECS, DISPATCH_BACKOFF_START_SECS, DISPATCH_CALL_IDLE_SECS,
    DISPATCH_END_GRACE_SECS, DISPATCH_UDP_HEADER_LEN,
};
use crate::utils::now_millis;

/// Runtime commands for the streamer actor.
pub enum StreamerCommand {
    SetEnabled(bool),
    Query(oneshot::Sender<StreamerStats>),
}

/// Cloneable handle to the streamer actor.
#[derive(Clone)]
pub struct StreamerHandle {
    tx: mpsc::Sender<StreamerCommand>,
}

impl StreamerHandle {
    /// Enables or disables forwarding at runtime.
    pub async fn set_enabled(&self, enabled: bool) -> TrunklineResult<()> {
        self.tx
            .send(StreamerCommand::SetEnabled(enabled))
            .await
            .map_err(|_| TrunklineError::ChannelClosed("dispatch streamer"))
    }

    /// Snapshot of the forwarding counters.
    pub async fn stats(&self) -> TrunklineResult<StreamerStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StreamerCommand::Query(reply))
            .await
            .map_err(|_| TrunklineError::ChannelClosed("dispatch streamer"))?;
        rx.await
            .map_err(|_| TrunklineError::ChannelClosed("dispatch streamer"))
    }
}

/// Forwarding counters, serialized for status surfaces.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStats {
    pub enabled: bool,
    pub connected: bool,
    pub packets_udp_sent: u64,
    pub packets_tcp_sent: u64,
    pub bytes_udp_sent: u64,
    pub bytes_tcp_sent: u64,
    pub calls_started: u64,
    pub udp_errors: u64,
    pub tcp_errors: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<u64>,
    pub last_packet_time: Option<u64>,
    pub uptime_secs: u64,
}

/// TCP control message shape.
#[derive(Serialize)]
struct ControlMsg<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    tg: u64,
    freq: u64,
    #[serde(rename = "alphaTag", skip_serializing_if = "Option::is_none")]
    alpha_tag: Option<&'a str>,
}

/// Builds one UDP data packet: fixed 18-byte header + PCM payload.
///
/// Header: `u32 seq | u32 tgid_or_freq | u32 freq | u32 sample_rate |
/// u16 sample_count`, all little-endian.
fn build_udp_packet(
    seq: u32,
    channel_key: u64,
    freq: u64,
    sample_rate: u32,
    pcm: &[u8],
) -> Vec<u8> {
    let sample_count = (pcm.len() / 2) as u16;
    let mut packet = Vec::with_capacity(DISPATCH_UDP_HEADER_LEN + pcm.len());
    packet.extend_from_slice(&seq.to_le_bytes());
    packet.extend_from_slice(&(channel_key as u32).to_le_bytes());
    packet.extend_from_slice(&(freq as u32).to_le_bytes());
    packet.extend_from_slice(&sample_rate.to_le_bytes());
    packet.extend_from_slice(&sample_count.to_le_bytes());
    packet.extend_from_slice(pcm);
    packet
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_secs(DISPATCH_BACKOFF_CAP_SECS))
}

struct CallStream {
    id: String,
    talkgroup: u64,
    frequency: u64,
    alpha_tag: Option<String>,
    last_frame: Instant,
}

/// The dispatch streamer actor.
pub struct DispatchStreamer {
    config: DispatchConfig,
    cmd_rx: mpsc::Receiver<StreamerCommand>,
    frames_rx: mpsc::Receiver<EnrichedAudioFrame>,
    ends_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,

    enabled: bool,
    conn: Option<TcpStream>,
    udp: Option<UdpSocket>,
    backoff: Duration,
    next_attempt: Instant,
    seq: u32,
    active: HashMap<u64, CallStream>,
    /// End messages awaiting a reconnect, with their grace deadlines.
    pending_ends: Vec<(String, Instant)>,
    stats: StreamerStats,
    started_at: Instant,
}

impl DispatchStreamer {
    pub fn new(
        config: DispatchConfig,
        frames_rx: mpsc::Receiver<EnrichedAudioFrame>,
        ends_rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> (Self, StreamerHandle) {
        let (tx, cmd_rx) = mpsc::channel(16);
        let enabled = config.enabled;
        (
            Self {
                config,
                cmd_rx,
                frames_rx,
                ends_rx,
                cancel,
                enabled,
                conn: None,
                udp: None,
                backoff: Duration::from_secs(DISPATCH_BACKOFF_START_SECS),
                next_attempt: Instant::now(),
                seq: 0,
                active: HashMap::new(),
                pending_ends: Vec::new(),
                stats: StreamerStats {
                    enabled,
                    ..StreamerStats::default()
                },
                started_at: Instant::now(),
            },
            StreamerHandle { tx },
        )
    }

    fn udp_target(&self) -> (String, u16) {
        (self.config.host.clone(), self.config.port + 1)
    }

    /// Actor loop. Runs until cancelled.
    pub async fn run(mut self) {
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => self.udp = Some(socket),
            Err(e) => {
                log::error!("[Dispatch] Failed to bind UDP sender: {}", e);
                self.record_error(format!("udp bind: {}", e));
            }
        }

        let mut idle_check = tokio::time::interval(Duration::from_secs(1));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let want_connect = self.enabled && self.conn.is_none();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.cmd_rx.recv() => match command {
                    Some(StreamerCommand::SetEnabled(enabled)) => self.set_enabled(enabled),
                    Some(StreamerCommand::Query(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => break,
                },
                frame = self.frames_rx.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => break,
                },
                Some(id) = self.ends_rx.recv() => self.on_call_end(&id).await,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(self.next_attempt)),
                    if want_connect =>
                {
                    self.try_connect().await;
                }
                _ = idle_check.tick() => self.close_idle_calls().await,
            }
        }

        log::info!("[Dispatch] Streamer stopped");
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.stats.enabled = enabled;
        if enabled {
            log::info!("[Dispatch] Forwarding enabled");
            self.next_attempt = Instant::now();
        } else {
            log::info!("[Dispatch] Forwarding disabled, draining");
            self.conn = None;
            self.active.clear();
            self.pending_ends.clear();
        }
    }

    fn snapshot(&self) -> StreamerStats {
        let mut stats = self.stats.clone();
        stats.connected = self.conn.is_some();
        stats.uptime_secs = self.started_at.elapsed().as_secs();
        stats
    }

    fn record_error(&mut self, message: String) {
        log::warn!("[Dispatch] {}", message);
        self.stats.last_error = Some(message);
        self.stats.last_error_time = Some(now_millis());
    }

    async fn try_connect(&mut self) {
        let addr = (self.config.host.clone(), self.config.port);
        match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                log::info!(
                    "[Dispatch] Connected to {}:{}",
                    self.config.host,
                    self.config.port
                );
                self.conn = Some(stream);
                self.backoff = Duration::from_secs(DISPATCH_BACKOFF_START_SECS);
                self.flush_pending_ends().await;
            }
            Ok(Err(e)) => self.connect_failed(e.to_string()),
            Err(_) => self.connect_failed("connect timeout".to_string()),
        }
    }

    fn connect_failed(&mut self, reason: String) {
        self.stats.tcp_errors += 1;
        self.record_error(format!(
            "connect to {}:{} failed: {}",
            self.config.host, self.config.port, reason
        ));
        self.next_attempt = Instant::now() + self.backoff;
        self.backoff = next_backoff(self.backoff);
    }

    async fn flush_pending_ends(&mut self) {
        let now = Instant::now();
        let pending = std::mem::take(&mut self.pending_ends);
        for (line, deadline) in pending {
            if now >= deadline {
                log::debug!("[Dispatch] Dropping stale call-end past grace window");
                continue;
            }
            if self.send_tcp_line(&line).await.is_err() {
                // Connection died again; requeue with the original deadline.
                self.pending_ends.push((line, deadline));
                return;
            }
        }
    }

    async fn on_frame(&mut self, frame: EnrichedAudioFrame) {
        if !self.enabled {
            return;
        }
        let key = frame.channel_key;
        let freq = frame.frequency.unwrap_or(0);

        if !self.active.contains_key(&key) {
            let id = format!("{}-{}", key, crate::utils::now_secs());
            let start_line = match serde_json::to_string(&ControlMsg {
                kind: "call_start",
                id: &id,
                tg: frame.talkgroup,
                freq,
                alpha_tag: frame.alpha_tag.as_deref(),
            }) {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("[Dispatch] Control message serialization failed: {}", e);
                    return;
                }
            };
            self.active.insert(
                key,
                CallStream {
                    id,
                    talkgroup: frame.talkgroup,
                    frequency: freq,
                    alpha_tag: frame.alpha_tag.clone(),
                    last_frame: Instant::now(),
                },
            );
            self.stats.calls_started += 1;
            let _ = self.send_tcp_line(&start_line).await;
        } else if let Some(call) = self.active.get_mut(&key) {
            call.last_frame = Instant::now();
        }

        // UDP send never blocks ingest: errors are counted and the frame
        // discarded.
        let packet = build_udp_packet(self.seq, key, freq, frame.sample_rate, &frame.pcm);
        self.seq = self.seq.wrapping_add(1);
        if let Some(udp) = &self.udp {
            match udp.send_to(&packet, self.udp_target()).await {
                Ok(sent) => {
                    self.stats.packets_udp_sent += 1;
                    self.stats.bytes_udp_sent += sent as u64;
                    self.stats.last_packet_time = Some(now_millis());
                }
                Err(e) => {
                    self.stats.udp_errors += 1;
                    self.record_error(format!("udp send: {}", e));
                }
            }
        }
    }

    async fn on_call_end(&mut self, canonical_id: &str) {
        if !self.enabled {
            return;
        }
        let Some((key, _)) = split_call_id(canonical_id) else {
            return;
        };
        if let Some(call) = self.active.remove(&key) {
            self.send_call_end(call).await;
        }
    }

    async fn close_idle_calls(&mut self) {
        if !self.enabled {
            return;
        }
        let idle: Vec<u64> = self
            .active
            .iter()
            .filter(|(_, call)| {
                call.last_frame.elapsed() >= Duration::from_secs(DISPATCH_CALL_IDLE_SECS)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in idle {
            if let Some(call) = self.active.remove(&key) {
                log::debug!("[Dispatch] Call {} idle, closing", call.id);
                self.send_call_end(call).await;
            }
        }
    }

    async fn send_call_end(&mut self, call: CallStream) {
        let line = match serde_json::to_string(&ControlMsg {
            kind: "call_end",
            id: &call.id,
            tg: call.talkgroup,
            freq: call.frequency,
            alpha_tag: call.alpha_tag.as_deref(),
        }) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("[Dispatch] Control message serialization failed: {}", e);
                return;
            }
        };
        if self.send_tcp_line(&line).await.is_err() {
            // Retried after reconnect, inside the grace window.
            self.pending_ends.push((
                line,
                Instant::now() + Duration::from_secs(DISPATCH_END_GRACE_SECS),
            ));
        }
    }

    async fn send_tcp_line(&mut self, line: &str) -> Result<(), ()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(());
        };
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        match conn.write_all(&payload).await {
            Ok(()) => {
                self.stats.packets_tcp_sent += 1;
                self.stats.bytes_tcp_sent += payload.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.tcp_errors += 1;
                self.record_error(format!("tcp send: {}", e));
                self.conn = None;
                self.next_attempt = Instant::now() + self.backoff;
                self.backoff = next_backoff(self.backoff);
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::SystemType;
    use crate::ingest::audio::AudioWireFormat;
    use bytes::Bytes;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn udp_packet_header_is_wire_exact() {
        let pcm = [1u8, 0, 254, 255];
        let packet = build_udp_packet(7, 927, 851_150_000, 8000, &pcm);

        assert_eq!(packet.len(), DISPATCH_UDP_HEADER_LEN + 4);
        assert_eq!(u32::from_le_bytes(packet[0..4].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(packet[4..8].try_into().unwrap()), 927);
        assert_eq!(
            u32::from_le_bytes(packet[8..12].try_into().unwrap()),
            851_150_000
        );
        assert_eq!(u32::from_le_bytes(packet[12..16].try_into().unwrap()), 8000);
        assert_eq!(u16::from_le_bytes(packet[16..18].try_into().unwrap()), 2);
        assert_eq!(&packet[18..], &pcm);
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = Duration::from_secs(DISPATCH_BACKOFF_START_SECS);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn control_message_shape() {
        let json = serde_json::to_value(&ControlMsg {
            kind: "call_start",
            id: "927-1704825600",
            tg: 927,
            freq: 851_150_000,
            alpha_tag: Some("Control A2"),
        })
        .unwrap();
        assert_eq!(json["type"], "call_start");
        assert_eq!(json["id"], "927-1704825600");
        assert_eq!(json["tg"], 927);
        assert_eq!(json["alphaTag"], "Control A2");
    }

    fn frame(key: u64) -> EnrichedAudioFrame {
        EnrichedAudioFrame {
            channel_key: key,
            talkgroup: key,
            frequency: Some(851_150_000),
            sample_rate: 8000,
            source: None,
            emission: None,
            alpha_tag: Some("Control A2".into()),
            group_name: None,
            group_tag: None,
            description: None,
            system_type: SystemType::Trunked,
            pcm: Bytes::from_static(&[0u8; 320]),
            format: AudioWireFormat::TalkgroupOnly,
        }
    }

    /// Binds a TCP listener and a UDP socket on an adjacent port pair.
    async fn bind_peer() -> (tokio::net::TcpListener, UdpSocket, u16) {
        for _ in 0..16 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            if port == u16::MAX {
                continue;
            }
            if let Ok(udp) = UdpSocket::bind(("127.0.0.1", port + 1)).await {
                return (listener, udp, port);
            }
        }
        panic!("could not allocate adjacent port pair");
    }

    #[tokio::test]
    async fn forwards_calls_over_tcp_and_pcm_over_udp() {
        let (listener, udp_peer, port) = bind_peer().await;

        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (ends_tx, ends_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (streamer, handle) = DispatchStreamer::new(
            DispatchConfig {
                host: "127.0.0.1".into(),
                port,
                enabled: true,
            },
            frames_rx,
            ends_rx,
            cancel.clone(),
        );
        tokio::spawn(streamer.run());

        // Accept the supervisory connection and give the streamer a moment
        // to observe it.
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = tokio::io::BufReader::new(stream).lines();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First frame opens the call and streams PCM.
        frames_tx.send(frame(927)).await.unwrap();
        let start_line = lines.next_line().await.unwrap().unwrap();
        let start: serde_json::Value = serde_json::from_str(&start_line).unwrap();
        assert_eq!(start["type"], "call_start");
        assert_eq!(start["tg"], 927);
        let call_id = start["id"].as_str().unwrap().to_string();

        let mut buf = vec![0u8; 2048];
        let (len, _) = udp_peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, DISPATCH_UDP_HEADER_LEN + 320);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 927);

        // Correlator end notice closes the call on TCP.
        ends_tx.send(call_id.clone()).await.unwrap();
        let end_line = lines.next_line().await.unwrap().unwrap();
        let end: serde_json::Value = serde_json::from_str(&end_line).unwrap();
        assert_eq!(end["type"], "call_end");
        assert_eq!(end["id"], call_id);

        let stats = handle.stats().await.unwrap();
        assert!(stats.enabled);
        assert_eq!(stats.calls_started, 1);
        assert_eq!(stats.packets_udp_sent, 1);
        assert!(stats.packets_tcp_sent >= 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn disabling_drains_state() {
        let (listener, _udp_peer, port) = bind_peer().await;

        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (_ends_tx, ends_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (streamer, handle) = DispatchStreamer::new(
            DispatchConfig {
                host: "127.0.0.1".into(),
                port,
                enabled: true,
            },
            frames_rx,
            ends_rx,
            cancel.clone(),
        );
        tokio::spawn(streamer.run());
        let _ = listener.accept().await.unwrap();

        frames_tx.send(frame(927)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.set_enabled(false).await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert!(!stats.enabled);
        assert!(!stats.connected);

        // Frames while disabled are discarded.
        frames_tx.send(frame(927)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.packets_udp_sent, 1);

        cancel.cancel();
    }
}
