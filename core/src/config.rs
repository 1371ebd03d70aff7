//! Layered configuration: defaults -> TOML file -> environment -> CLI
//! (spec §6 "Configuration"). The CLI layer is merged in by the `server`
//! binary after loading this config (see `server/src/config.rs`).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// A manually declared device, merged on startup via `upsert_manual`
/// (spec §6 "Manual devices").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualDeviceDecl {
    pub id: String,
    pub ip: IpAddr,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub model: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

fn default_protocol() -> String {
    "govee".to_string()
}

/// Full bridge configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    // Ports / networking
    pub artnet_enabled: bool,
    pub artnet_port: u16,
    pub artnet_priority: u8,
    pub sacn_enabled: bool,
    pub sacn_port: u16,
    pub sacn_multicast: bool,
    pub api_port: u16,

    // Database
    pub db_path: PathBuf,
    pub migrate_only: bool,

    // Discovery / liveness (collaborators)
    pub discovery_interval_secs: u64,
    pub discovery_response_timeout_secs: u64,
    pub discovery_stale_after_secs: u64,
    pub device_poll_enabled: bool,
    pub device_poll_interval_secs: u64,
    pub device_poll_timeout_secs: u64,
    pub device_poll_offline_threshold: u32,

    // Delivery
    pub device_default_transport: String,
    pub device_default_port: u16,
    pub device_send_timeout_ms: u64,
    pub device_send_retries: u32,
    pub device_backoff_base_ms: u64,
    pub device_backoff_factor: f64,
    pub device_backoff_max_ms: u64,
    pub device_max_send_rate: f64,
    pub device_queue_poll_interval_ms: u64,
    pub device_idle_wait_ms: u64,
    pub device_offline_threshold: u32,
    pub device_max_queue_depth: u64,

    // Rate limiter
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: f64,

    // Supervisor
    pub subsystem_failure_threshold: u32,
    pub subsystem_failure_cooldown_secs: u64,
    pub dry_run: bool,
    pub trace_context_ids: bool,
    pub trace_context_sample_rate: f64,
    pub noisy_log_sample_rate: f64,

    // Mapper
    pub debounce_ms: u64,

    // Manual devices
    pub manual_devices: Vec<ManualDeviceDecl>,

    /// Path to the device capability catalog (hot-reload-sensitive, same as
    /// `db_path`).
    pub capability_catalog_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            artnet_enabled: true,
            artnet_port: 6454,
            artnet_priority: 100,
            sacn_enabled: true,
            sacn_port: 5568,
            sacn_multicast: false,
            api_port: 8080,

            db_path: PathBuf::from("govee-bridge.db"),
            migrate_only: false,

            discovery_interval_secs: 30,
            discovery_response_timeout_secs: 3,
            discovery_stale_after_secs: 300,
            device_poll_enabled: false,
            device_poll_interval_secs: 30,
            device_poll_timeout_secs: 3,
            device_poll_offline_threshold: 3,

            device_default_transport: "udp".to_string(),
            device_default_port: 4003,
            device_send_timeout_ms: 2000,
            device_send_retries: 3,
            device_backoff_base_ms: 200,
            device_backoff_factor: 2.0,
            device_backoff_max_ms: 5000,
            device_max_send_rate: 20.0,
            device_queue_poll_interval_ms: 500,
            device_idle_wait_ms: 200,
            device_offline_threshold: 3,
            device_max_queue_depth: 1000,

            rate_limit_per_second: 20.0,
            rate_limit_burst: 20.0,

            subsystem_failure_threshold: 5,
            subsystem_failure_cooldown_secs: 30,
            dry_run: false,
            trace_context_ids: false,
            trace_context_sample_rate: 0.0,
            noisy_log_sample_rate: 1.0,

            debounce_ms: 50,

            manual_devices: Vec::new(),
            capability_catalog_path: None,
        }
    }
}

impl BridgeConfig {
    /// Loads configuration: defaults -> optional TOML file -> environment
    /// (prefix `GOVEE_BRIDGE_`). The CLI layer, merged last, is applied by
    /// the caller (the `server` binary) via [`Self::merge_cli_overrides`]-style
    /// field assignment, since `clap`'s `Args` struct lives in the binary
    /// crate.
    pub fn load(file_path: Option<&std::path::Path>) -> Result<Self, BridgeError> {
        let mut figment = Figment::from(Serialized::defaults(BridgeConfig::default()));
        if let Some(path) = file_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("GOVEE_BRIDGE_").split("__"));

        figment
            .extract()
            .map_err(|e| BridgeError::Configuration(format!("failed to load configuration: {e}")))
    }

    pub fn device_send_timeout(&self) -> Duration {
        Duration::from_millis(self.device_send_timeout_ms)
    }

    pub fn device_backoff_base(&self) -> Duration {
        Duration::from_millis(self.device_backoff_base_ms)
    }

    pub fn device_backoff_max(&self) -> Duration {
        Duration::from_millis(self.device_backoff_max_ms)
    }

    pub fn subsystem_failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.subsystem_failure_cooldown_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Validates cross-field invariants not expressible in the type system
    /// alone. Fatal at startup; on reload the caller retains the old config
    /// if this fails (spec §7 "Configuration").
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.device_send_retries == 0 {
            return Err(BridgeError::Configuration(
                "device_send_retries must be at least 1".into(),
            ));
        }
        if !matches!(self.device_default_transport.as_str(), "udp" | "tcp") {
            return Err(BridgeError::Configuration(format!(
                "device_default_transport must be 'udp' or 'tcp', got '{}'",
                self.device_default_transport
            )));
        }
        if self.rate_limit_per_second <= 0.0 || self.rate_limit_burst <= 0.0 {
            return Err(BridgeError::Configuration(
                "rate_limit_per_second and rate_limit_burst must be positive".into(),
            ));
        }
        if self.device_backoff_factor < 1.0 {
            return Err(BridgeError::Configuration(
                "device_backoff_factor must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Returns `true` if `other` changes a field that requires a restart
    /// rather than a hot reload (spec §4.S "Hot reload").
    pub fn requires_restart_from(&self, other: &BridgeConfig) -> bool {
        self.db_path != other.db_path || self.capability_catalog_path != other.capability_catalog_path
    }
}
