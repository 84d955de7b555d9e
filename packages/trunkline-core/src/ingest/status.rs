//! Decoder status endpoint.
//!
//! The decoder initiates a long-lived duplex TCP connection and writes one
//! JSON object per line. One connection at a time: a newer connection closes
//! the older. Reads idle out after 30 s ("stream idle"); three consecutive
//! idles drop the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::calls::correlator::CorrelatorInput;
use crate::error::{TrunklineError, TrunklineResult};
use crate::events::{EventEmitter, HubEvent};
use crate::protocol_constants::{STREAM_IDLE_LIMIT, STREAM_IDLE_TIMEOUT_SECS};

/// Accepts `true`/`false`, `1`/`0`, or absence for decoder boolean fields.
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// `call_start` payload (also the element shape of `calls_active`).
#[derive(Debug, Clone, Deserialize)]
pub struct CallStartMsg {
    /// Decoder-assigned ID. Treated as unreliable; the correlator derives
    /// the canonical ID itself.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub freq: u64,
    #[serde(default)]
    pub talkgroup: u64,
    #[serde(default)]
    pub talkgrouptag: Option<String>,
    #[serde(default, alias = "elapsedTime")]
    pub elapsed_time: Option<f64>,
}

/// One element of a `call_end` source list.
#[derive(Debug, Clone, Deserialize)]
pub struct SrcEntry {
    #[serde(default, alias = "source")]
    pub src: u64,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub pos: f64,
    #[serde(default, deserialize_with = "de_flag")]
    pub emergency: bool,
    #[serde(default)]
    pub tag: String,
}

/// `call_end` payload, from the status socket or a recording sidecar.
#[derive(Debug, Clone, Deserialize)]
pub struct CallEndMsg {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub freq: u64,
    #[serde(default)]
    pub talkgroup: u64,
    #[serde(default)]
    pub talkgrouptag: Option<String>,
    #[serde(default, alias = "talkgroupDescription")]
    pub talkgroup_description: Option<String>,
    #[serde(default, alias = "talkgroupGroup")]
    pub talkgroup_group: Option<String>,
    #[serde(default, alias = "talkgroupTag")]
    pub talkgroup_group_tag: Option<String>,
    #[serde(default, alias = "startTime")]
    pub start_time: u64,
    #[serde(default, alias = "stopTime")]
    pub stop_time: u64,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default, deserialize_with = "de_flag")]
    pub emergency: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub encrypted: bool,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "audioType")]
    pub audio_type: Option<String>,
    #[serde(default, alias = "freqList")]
    pub freq_list: Vec<Value>,
    #[serde(default, alias = "srcList")]
    pub src_list: Vec<SrcEntry>,
}

/// Sum over decoder status message kinds.
///
/// `systems` and `recorders` are forwarded unchanged, so they stay raw JSON.
#[derive(Debug, Clone)]
pub enum StatusMessage {
    CallStart(CallStartMsg),
    CallEnd(Box<CallEndMsg>),
    CallsActive(Vec<CallStartMsg>),
    Rates(Value),
    Systems(Value),
    Recorders(Value),
}

impl StatusMessage {
    /// Parses one newline-delimited status message.
    pub fn parse(text: &str) -> TrunklineResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TrunklineError::Parse("status message missing type".into()))?
            .to_string();

        match kind.as_str() {
            "call_start" => Ok(Self::CallStart(serde_json::from_value(value)?)),
            "call_end" => Ok(Self::CallEnd(Box::new(serde_json::from_value(value)?))),
            "calls_active" => {
                #[derive(Deserialize)]
                struct CallsActive {
                    #[serde(default)]
                    calls: Vec<CallStartMsg>,
                }
                let parsed: CallsActive = serde_json::from_value(value)?;
                Ok(Self::CallsActive(parsed.calls))
            }
            "rates" => Ok(Self::Rates(value)),
            "systems" => Ok(Self::Systems(value)),
            "recorders" => Ok(Self::Recorders(value)),
            other => Err(TrunklineError::Parse(format!(
                "unknown status message type: {}",
                other
            ))),
        }
    }
}

/// Decoder status endpoint task.
pub struct StatusEndpoint {
    listener: TcpListener,
    correlator_tx: mpsc::Sender<CorrelatorInput>,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
}

impl StatusEndpoint {
    pub async fn bind(
        addr: SocketAddr,
        correlator_tx: mpsc::Sender<CorrelatorInput>,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> TrunklineResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TrunklineError::Bind {
                endpoint: format!("status TCP {}", addr),
                source,
            })?;
        log::info!("[Status] Listening on {}", addr);
        Ok(Self {
            listener,
            correlator_tx,
            emitter,
            cancel,
        })
    }

    /// Accept loop. Runs until cancelled.
    pub async fn run(self) {
        let mut current: Option<CancellationToken> = None;

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("[Status] accept error: {}", e);
                        continue;
                    }
                },
            };

            // One decoder at a time: the newer connection wins.
            if let Some(previous) = current.take() {
                log::info!("[Status] New decoder connection, closing previous");
                previous.cancel();
            }

            log::info!("[Status] Decoder connected from {}", peer);
            let conn_token = self.cancel.child_token();
            current = Some(conn_token.clone());

            let correlator_tx = self.correlator_tx.clone();
            let emitter = Arc::clone(&self.emitter);
            tokio::spawn(async move {
                handle_connection(stream, correlator_tx, emitter, conn_token).await;
            });
        }
        log::info!("[Status] Endpoint stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    correlator_tx: mpsc::Sender<CorrelatorInput>,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut idle_count: u32 = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(
                Duration::from_secs(STREAM_IDLE_TIMEOUT_SECS),
                lines.next_line(),
            ) => result,
        };

        match next {
            Err(_elapsed) => {
                idle_count += 1;
                log::warn!("[Status] stream idle ({}/{})", idle_count, STREAM_IDLE_LIMIT);
                if idle_count >= STREAM_IDLE_LIMIT {
                    break;
                }
            }
            Ok(Ok(Some(line))) => {
                idle_count = 0;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                dispatch(line, &correlator_tx, &emitter).await;
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                log::warn!("[Status] read error: {}", e);
                break;
            }
        }
    }

    log::info!("[Status] decoder disconnected");
}

async fn dispatch(
    line: &str,
    correlator_tx: &mpsc::Sender<CorrelatorInput>,
    emitter: &Arc<dyn EventEmitter>,
) {
    match StatusMessage::parse(line) {
        Ok(message @ (StatusMessage::CallStart(_)
        | StatusMessage::CallEnd(_)
        | StatusMessage::CallsActive(_))) => {
            if correlator_tx
                .send(CorrelatorInput::Status(message))
                .await
                .is_err()
            {
                log::warn!("[Status] Correlator unavailable, dropping message");
            }
        }
        Ok(StatusMessage::Rates(value)) => {
            let rates = value.get("rates").cloned().unwrap_or(Value::Null);
            emitter.emit(HubEvent::Rates { rates });
        }
        Ok(StatusMessage::Systems(value)) | Ok(StatusMessage::Recorders(value)) => {
            emitter.emit(HubEvent::SystemChanged { payload: value });
        }
        Err(e) => {
            log::debug!("[Status] Unparseable message: {} ({})", e, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_start() {
        let line = r#"{"type":"call_start","id":"abc","freq":851150000,"talkgroup":927,"talkgrouptag":"Control A2","elapsedTime":0}"#;
        match StatusMessage::parse(line).unwrap() {
            StatusMessage::CallStart(msg) => {
                assert_eq!(msg.id.as_deref(), Some("abc"));
                assert_eq!(msg.freq, 851_150_000);
                assert_eq!(msg.talkgroup, 927);
                assert_eq!(msg.talkgrouptag.as_deref(), Some("Control A2"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn parses_call_end_with_integer_flags() {
        let line = r#"{"type":"call_end","id":"abc","freq":851150000,"talkgroup":927,
            "startTime":1704825600,"stopTime":1704825610,"length":10,
            "emergency":0,"encrypted":1,"filename":"927-1704825600.wav",
            "srcList":[{"src":7001234,"time":1704825601,"pos":1.0,"emergency":0,"tag":""}]}"#;
        match StatusMessage::parse(line).unwrap() {
            StatusMessage::CallEnd(msg) => {
                assert_eq!(msg.start_time, 1_704_825_600);
                assert_eq!(msg.stop_time, 1_704_825_610);
                assert!(!msg.emergency);
                assert!(msg.encrypted);
                assert_eq!(msg.src_list.len(), 1);
                assert_eq!(msg.src_list[0].src, 7_001_234);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn parses_calls_active_list() {
        let line = r#"{"type":"calls_active","calls":[
            {"id":"a","freq":851150000,"talkgroup":927,"elapsedTime":3.2},
            {"id":"b","freq":852387500,"talkgroup":931,"elapsedTime":0.4}]}"#;
        match StatusMessage::parse(line).unwrap() {
            StatusMessage::CallsActive(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[1].talkgroup, 931);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn systems_are_forwarded_raw() {
        let line = r#"{"type":"systems","systems":[{"sysNum":0,"type":"p25"}]}"#;
        match StatusMessage::parse(line).unwrap() {
            StatusMessage::Systems(value) => {
                assert_eq!(value["type"], "systems");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        assert!(StatusMessage::parse(r#"{"type":"mystery"}"#).is_err());
        assert!(StatusMessage::parse(r#"{"no_type":true}"#).is_err());
        assert!(StatusMessage::parse("not json").is_err());
    }
}
