use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub call: CallConfig,
    pub transport: TransportConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Negotiation state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long a finished call stays in `Disconnected` before decaying to `Idle`
    pub disconnect_grace_ms: u64,
    /// Call duration counter period
    pub duration_tick_ms: u64,
    /// Answer offers from third parties with a hang-up while a call is in progress
    pub reject_when_busy: bool,
    /// Candidates kept per sender while no offer from that sender has been seen
    pub max_early_candidates: usize,
    /// Distinct senders whose early candidates are kept at once
    pub max_early_senders: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: 2000,
            duration_tick_ms: 1000,
            reject_when_busy: true,
            max_early_candidates: 64,
            max_early_senders: 16,
        }
    }
}

impl CallConfig {
    #[must_use]
    pub const fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    #[must_use]
    pub const fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms)
    }
}

/// Signal log client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub send_retry_attempts: usize,
    pub send_retry_min_delay_ms: u64,
    pub send_retry_max_delay_ms: u64,
    /// Capacity of each receiver subscription channel
    pub subscription_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_retry_attempts: 3,
            send_retry_min_delay_ms: 100,
            send_retry_max_delay_ms: 2000,
            subscription_buffer: 256,
        }
    }
}

/// ICE server configuration for the WebRTC backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn: Option<TurnConfig>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn: None,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub server_url: String,
    pub username: String,
    pub password: String,
}

impl AppConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // APPHUB_CALL__DISCONNECT_GRACE_MS, APPHUB_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("APPHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Check values the type system cannot, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.call.duration_tick_ms == 0 {
            errors.push("call.duration_tick_ms must be greater than zero".to_string());
        }
        if self.call.max_early_senders == 0 {
            errors.push("call.max_early_senders must be greater than zero".to_string());
        }
        if self.transport.send_retry_min_delay_ms > self.transport.send_retry_max_delay_ms {
            errors.push(
                "transport.send_retry_min_delay_ms must not exceed send_retry_max_delay_ms"
                    .to_string(),
            );
        }
        if self.transport.subscription_buffer == 0 {
            errors.push("transport.subscription_buffer must be greater than zero".to_string());
        }
        if let Some(turn) = &self.webrtc.turn {
            if turn.server_url.trim().is_empty() {
                errors.push("webrtc.turn.server_url must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
