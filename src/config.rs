use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::geometry::YawConvention;

// Reference timing of the agent protocol
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_CONTROL_TICK_MS: u64 = 500;
pub const DEFAULT_CONTROL_STALENESS_MS: u64 = 500;
pub const DEFAULT_INTEGRITY_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_ROSTER_REFRESH_MS: u64 = 10_000;

pub const DEFAULT_AGENT_PORT: u16 = 48100;
pub const DEFAULT_INTEGRITY_SECURE_PORT: u16 = 1234;
pub const DEFAULT_INTEGRITY_INSECURE_PORT: u16 = 1235;

pub const DEFAULT_MAGIC: [u8; 2] = [0xFE, 0x01];
pub const MAX_WIRE_BODY_LEN: usize = 0x00FF_FFFF;
pub const DEFAULT_MAX_INFLATED_LEN: usize = 64 * 1024 * 1024;

pub const INTEGRITY_SERVER_ENV: &str = "INTEGRITY_SERVER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub connection: ConnectionConfig,
    pub codec: CodecConfig,
    pub link: LinkConfig,
    pub control: ControlConfig,
    pub integrity: IntegrityConfig,
    pub roster: RosterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// A socket write that makes no progress for this long ends the session.
    pub write_timeout_ms: u64,
    pub read_chunk_size: usize,
    pub outbound_queue: usize,
    pub event_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_chunk_size: 8192,
            outbound_queue: 64,
            event_queue: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub magic: [u8; 2],
    /// Width of the checksum trailer following each body. Zero disables it.
    pub trailer_len: usize,
    pub max_body_len: usize,
    /// Upper bound on a body after decompression.
    pub max_inflated_len: usize,
    pub compression_level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            trailer_len: 0,
            max_body_len: MAX_WIRE_BODY_LEN,
            max_inflated_len: DEFAULT_MAX_INFLATED_LEN,
            compression_level: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub agent_port: u16,
    pub mirror_maps: bool,
    pub yaw: YawConvention,
    pub event_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            agent_port: DEFAULT_AGENT_PORT,
            mirror_maps: true,
            yaw: YawConvention::default(),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_interval_ms: u64,
    pub staleness_ms: u64,
    pub linear_speed: f64,
    pub angular_speed: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_CONTROL_TICK_MS,
            staleness_ms: DEFAULT_CONTROL_STALENESS_MS,
            linear_speed: 1.0,
            angular_speed: 1.0,
        }
    }
}

impl ControlConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// When false every transform is the identity.
    pub enabled: bool,
    pub host: String,
    pub secure_port: u16,
    pub insecure_port: u16,
    pub designator: String,
    pub tail: String,
    pub response_timeout_ms: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            secure_port: DEFAULT_INTEGRITY_SECURE_PORT,
            insecure_port: DEFAULT_INTEGRITY_INSECURE_PORT,
            designator: "S0".to_string(),
            tail: "e^&og\r\n\r\n".to_string(),
            response_timeout_ms: DEFAULT_INTEGRITY_TIMEOUT_MS,
        }
    }
}

impl IntegrityConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub path: Option<String>,
    pub refresh_interval_ms: u64,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            path: None,
            refresh_interval_ms: DEFAULT_ROSTER_REFRESH_MS,
        }
    }
}

impl RosterConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl GatewayConfig {
    /// Load a config file; missing sections and fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var(INTEGRITY_SERVER_ENV) {
            if !host.trim().is_empty() {
                self.integrity.host = host;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.retry_interval_ms == 0 {
            return Err(invalid("connection.retry_interval_ms", "must be non-zero"));
        }
        if self.connection.write_timeout_ms == 0 {
            return Err(invalid("connection.write_timeout_ms", "must be non-zero"));
        }
        if self.connection.read_chunk_size == 0 {
            return Err(invalid("connection.read_chunk_size", "must be non-zero"));
        }
        if self.connection.outbound_queue == 0 || self.connection.event_queue == 0 {
            return Err(invalid("connection", "queue depths must be non-zero"));
        }
        if self.codec.max_body_len == 0 || self.codec.max_body_len > MAX_WIRE_BODY_LEN {
            return Err(invalid(
                "codec.max_body_len",
                "must fit the 3-byte length field",
            ));
        }
        if self.codec.max_inflated_len == 0 {
            return Err(invalid("codec.max_inflated_len", "must be non-zero"));
        }
        if self.codec.compression_level > 9 {
            return Err(invalid("codec.compression_level", "must be 0-9"));
        }
        if self.codec.trailer_len > 8 {
            return Err(invalid("codec.trailer_len", "must be at most 8 bytes"));
        }
        if self.control.tick_interval_ms == 0 {
            return Err(invalid("control.tick_interval_ms", "must be non-zero"));
        }
        if self.link.event_buffer == 0 {
            return Err(invalid("link.event_buffer", "must be non-zero"));
        }
        if self.integrity.designator.is_empty() || self.integrity.tail.is_empty() {
            return Err(invalid("integrity", "designator and tail must be non-empty"));
        }
        if self.roster.refresh_interval_ms == 0 {
            return Err(invalid("roster.refresh_interval_ms", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_timing() {
        let config = GatewayConfig::default();
        assert_eq!(config.connection.retry_interval(), Duration::from_secs(3));
        assert_eq!(config.control.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.control.staleness(), Duration::from_millis(500));
        assert_eq!(config.integrity.response_timeout(), Duration::from_secs(2));
        assert_eq!(config.codec.magic, [0xFE, 0x01]);
        assert_eq!(config.codec.trailer_len, 0);
        assert!(!config.integrity.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"link": {{"agent_port": 9000, "yaw": "signed"}}, "control": {{"linear_speed": 0.4}}}}"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.link.agent_port, 9000);
        assert_eq!(config.link.yaw, YawConvention::Signed);
        assert!(config.link.mirror_maps);
        assert!((config.control.linear_speed - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.control.tick_interval_ms, DEFAULT_CONTROL_TICK_MS);
        assert_eq!(config.connection.retry_interval_ms, DEFAULT_RETRY_INTERVAL_MS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = GatewayConfig::default();
        config.connection.retry_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "connection.retry_interval_ms", .. })
        ));

        let mut config = GatewayConfig::default();
        config.codec.max_body_len = MAX_WIRE_BODY_LEN + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            GatewayConfig::from_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }
}
