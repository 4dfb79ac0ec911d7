//! Settings consumed by the session core and the iroh transport.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// User settings that affect peer sessions. Field names match the host
/// application's settings file, so the same JSON can be fed in directly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub scan_on_startup: bool,
    #[serde(default = "default_true", alias = "live_scan")]
    pub live_sync: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_on_startup: true,
            live_sync: true,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SessionConfig {
    /// Whether logging in should bring the endpoint up on its own.
    pub fn auto_start(&self) -> bool {
        self.scan_on_startup || self.live_sync
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Knobs for [`crate::transport::quic::IrohTransport`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Hex secret key file. Created on first bind; `None` means a fresh identity per bind.
    pub key_path: Option<PathBuf>,
    /// Custom relay URLs. Empty keeps iroh's defaults.
    pub relay_urls: Vec<String>,
    /// Fixed UDP port (for NAT port forwarding).
    pub bind_port: Option<u16>,
    pub heartbeat_interval: Option<Duration>,
    pub ping_timeout: Option<Duration>,
    pub relay_wait: Option<Duration>,
}

impl TransportConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(Duration::from_secs(30))
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout.unwrap_or(Duration::from_secs(10))
    }

    pub fn relay_wait(&self) -> Duration {
        self.relay_wait.unwrap_or(Duration::from_secs(5))
    }

    /// `~/.peer-session/key`, when a home directory exists.
    pub fn default_key_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".peer-session").join("key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_file_fields_and_defaults() {
        let cfg: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, SessionConfig::default());
        assert!(cfg.auto_start());

        let cfg: SessionConfig =
            serde_json::from_str(r#"{"scan_on_startup": false, "live_scan": false, "media": {"folders": []}}"#)
                .unwrap();
        assert!(!cfg.auto_start());
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));

        let cfg: SessionConfig = serde_json::from_str(r#"{"scan_on_startup": false}"#).unwrap();
        assert!(cfg.auto_start());
    }

    #[test]
    fn transport_defaults() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.ping_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.relay_wait(), Duration::from_secs(5));
    }
}
