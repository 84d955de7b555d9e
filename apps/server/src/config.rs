//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The recognized environment variables match what deployments already set
//! for the decoder: `PORT`, `HOST`, `TR_AUDIO_PORT`, `TR_FFT_PORT`,
//! `TR_STATUS_URL`, `TR_AUDIO_DIR`, `DB_PATH`, `SDR_CENTER_FREQ`,
//! `SDR_SAMPLE_RATE`, `AVTEC_HOST`, `AVTEC_PORT`, `AVTEC_ENABLED`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use trunkline_core::{Config, DispatchConfig};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for every listener.
    /// Override: `HOST`
    pub host: String,

    /// HTTP/WebSocket port for the subscriber socket.
    /// Override: `PORT`
    pub http_port: u16,

    /// Decoder status socket port.
    /// Override: `TR_STATUS_URL` (a listen URL; the port is taken from it)
    pub status_port: u16,

    /// UDP audio ingress port.
    /// Override: `TR_AUDIO_PORT`
    pub audio_port: u16,

    /// UDP FFT ingress port.
    /// Override: `TR_FFT_PORT`
    pub fft_port: u16,

    /// Recordings intake directory.
    /// Override: `TR_AUDIO_DIR`
    pub audio_dir: PathBuf,

    /// SQLite database path.
    /// Override: `DB_PATH`
    pub db_path: PathBuf,

    /// Spectrum recordings directory.
    pub recordings_dir: PathBuf,

    /// Candidate decoder log paths, in preference order.
    pub log_paths: Vec<PathBuf>,

    /// SDR center frequency (Hz). Override: `SDR_CENTER_FREQ`
    pub sdr_center_freq: u64,

    /// SDR sample rate (Hz). Override: `SDR_SAMPLE_RATE`
    pub sdr_sample_rate: u32,

    /// Dispatch console host. Override: `AVTEC_HOST`
    pub avtec_host: String,

    /// Dispatch console TCP port (UDP uses the adjacent port).
    /// Override: `AVTEC_PORT`
    pub avtec_port: u16,

    /// Whether dispatch forwarding starts enabled. Override: `AVTEC_ENABLED`
    pub avtec_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = Config::default();
        Self {
            host: core.host,
            http_port: core.http_port,
            status_port: core.status_port,
            audio_port: core.audio_port,
            fft_port: core.fft_port,
            audio_dir: core.audio_dir,
            db_path: core.db_path,
            recordings_dir: core.recordings_dir,
            log_paths: core.log_paths,
            sdr_center_freq: core.sdr_center_freq,
            sdr_sample_rate: core.sdr_sample_rate,
            avtec_host: core.dispatch.host,
            avtec_port: core.dispatch.port,
            avtec_enabled: core.dispatch.enabled,
        }
    }
}

/// Extracts the port from a status listen URL.
///
/// Accepts `tcp://0.0.0.0:3001`, `ws://host:3001/path`, `host:3001`, or a
/// bare port number.
fn parse_status_port(url: &str) -> Option<u16> {
    if let Ok(port) = url.parse() {
        return Some(port);
    }
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let without_path = without_scheme
        .split_once('/')
        .map_or(without_scheme, |(authority, _)| authority);
    without_path.rsplit_once(':')?.1.parse().ok()
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HOST") {
            if !val.is_empty() {
                self.host = val;
            }
        }
        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.http_port = port;
            }
        }
        if let Ok(val) = std::env::var("TR_AUDIO_PORT") {
            if let Ok(port) = val.parse() {
                self.audio_port = port;
            }
        }
        if let Ok(val) = std::env::var("TR_FFT_PORT") {
            if let Ok(port) = val.parse() {
                self.fft_port = port;
            }
        }
        if let Ok(val) = std::env::var("TR_STATUS_URL") {
            if let Some(port) = parse_status_port(&val) {
                self.status_port = port;
            }
        }
        if let Ok(val) = std::env::var("TR_AUDIO_DIR") {
            if !val.is_empty() {
                self.audio_dir = PathBuf::from(val);
            }
        }
        if let Ok(val) = std::env::var("DB_PATH") {
            if !val.is_empty() {
                self.db_path = PathBuf::from(val);
            }
        }
        if let Ok(val) = std::env::var("SDR_CENTER_FREQ") {
            if let Ok(freq) = val.parse() {
                self.sdr_center_freq = freq;
            }
        }
        if let Ok(val) = std::env::var("SDR_SAMPLE_RATE") {
            if let Ok(rate) = val.parse() {
                self.sdr_sample_rate = rate;
            }
        }
        if let Ok(val) = std::env::var("AVTEC_HOST") {
            if !val.is_empty() {
                self.avtec_host = val;
            }
        }
        if let Ok(val) = std::env::var("AVTEC_PORT") {
            if let Ok(port) = val.parse() {
                self.avtec_port = port;
            }
        }
        if let Ok(val) = std::env::var("AVTEC_ENABLED") {
            self.avtec_enabled = matches!(val.as_str(), "1" | "true" | "yes");
        }
    }

    /// Converts to trunkline-core's Config type.
    pub fn to_core_config(&self) -> Config {
        Config {
            host: self.host.clone(),
            http_port: self.http_port,
            status_port: self.status_port,
            audio_port: self.audio_port,
            fft_port: self.fft_port,
            audio_dir: self.audio_dir.clone(),
            db_path: self.db_path.clone(),
            recordings_dir: self.recordings_dir.clone(),
            log_paths: self.log_paths.clone(),
            sdr_center_freq: self.sdr_center_freq,
            sdr_sample_rate: self.sdr_sample_rate,
            dispatch: DispatchConfig {
                host: self.avtec_host.clone(),
                port: self.avtec_port,
                enabled: self.avtec_enabled,
            },
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_url_port_extraction() {
        assert_eq!(parse_status_port("3001"), Some(3001));
        assert_eq!(parse_status_port("tcp://0.0.0.0:3001"), Some(3001));
        assert_eq!(parse_status_port("ws://scanner.local:3005/status"), Some(3005));
        assert_eq!(parse_status_port("scanner.local:3001"), Some(3001));
        assert_eq!(parse_status_port("nonsense"), None);
    }

    #[test]
    fn defaults_match_core_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.status_port, 3001);
        assert_eq!(config.audio_port, 9000);
        assert_eq!(config.fft_port, 9001);
        assert!(!config.avtec_enabled);
    }

    #[test]
    fn yaml_round_trip_to_core_config() {
        let yaml = r#"
http_port: 8080
audio_port: 9100
avtec_host: "10.0.0.5"
avtec_port: 7000
avtec_enabled: true
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        let core = config.to_core_config();
        assert_eq!(core.http_port, 8080);
        assert_eq!(core.audio_port, 9100);
        assert_eq!(core.dispatch.host, "10.0.0.5");
        assert_eq!(core.dispatch.port, 7000);
        assert!(core.dispatch.enabled);
        // Untouched fields keep their defaults.
        assert_eq!(core.fft_port, 9001);
    }
}
