// Hub and client configuration

use crate::hub::clock::{now_secs, SyncSettings};
use crate::hub::error::{HubError, Result};
use crate::hub::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::hub::handshake::{ClientIdentity, SharedKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Control center configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret, exactly 8 bytes
    pub key: String,
    pub echo_probes: usize,
    pub echo_interval_ms: u64,
    pub echo_timeout_ms: u64,
    /// Bound on secret + identity + clock sync for a new connection
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// Name stamped into each routed letter's stations
    pub station_name: String,
    /// Address of the hub's own mail context
    pub hub_path: String,
    pub hub_uid: String,
    pub response_timeout_ms: u64,
    /// Ask clients for their bag dumps on every keep-alive
    pub acquire_bags: bool,
    /// Log a session snapshot this often; 0 disables it
    pub status_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12345,
            key: "12345678".to_string(),
            echo_probes: 20,
            echo_interval_ms: 10,
            echo_timeout_ms: 1000,
            handshake_timeout_ms: 30_000,
            write_timeout_ms: 5000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            station_name: "ControlCenter".to_string(),
            hub_path: "/control/center".to_string(),
            hub_uid: "control-center-0".to_string(),
            response_timeout_ms: 3000,
            acquire_bags: false,
            status_interval_secs: 0,
        }
    }
}

impl HubConfig {
    /// Load from a JSON file; absent fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| HubError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        SharedKey::new(&self.key)?;
        if self.echo_probes == 0 {
            return Err(HubError::Config("echo_probes must be at least 1".to_string()));
        }
        if self.station_name.is_empty() {
            return Err(HubError::Config("station_name must not be empty".to_string()));
        }
        if self.hub_path.is_empty() || self.hub_uid.is_empty() {
            return Err(HubError::Config("hub_path and hub_uid must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shared_key(&self) -> Result<SharedKey> {
        SharedKey::new(&self.key)
    }

    pub fn hub_identity(&self) -> ClientIdentity {
        ClientIdentity::new(&self.hub_path, &self.hub_uid)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            probes: self.echo_probes,
            interval: Duration::from_millis(self.echo_interval_ms),
            probe_timeout: Duration::from_millis(self.echo_timeout_ms),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Configuration of one client connecting to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub key: String,
    pub path: String,
    pub uid: String,
    /// 0 disables keep-alives
    pub keep_alive_secs: u64,
    /// Added to every local clock reading
    pub clock_skew_secs: f64,
    pub sync_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12345,
            key: "12345678".to_string(),
            path: "/client/baseClient".to_string(),
            uid: "bc-0".to_string(),
            keep_alive_secs: 5,
            clock_skew_secs: 0.0,
            sync_timeout_ms: 30_000,
            write_timeout_ms: 5000,
            response_timeout_ms: 3000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn new(path: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(&self.path, &self.uid)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn shared_key(&self) -> Result<SharedKey> {
        SharedKey::new(&self.key)
    }

    /// This machine's clock as the client reports it
    pub fn now(&self) -> f64 {
        now_secs() + self.clock_skew_secs
    }
}
