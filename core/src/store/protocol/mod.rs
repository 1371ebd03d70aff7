//! Device-protocol dispatch (spec §9 "Protocol dispatch").
//!
//! New device dialects are added by implementing [`ProtocolHandler`] and
//! registering it in [`ProtocolRegistry`], without touching the Mapper or
//! Delivery.

pub mod govee;

use crate::error::BridgeError;

/// One wire-ready command produced by a [`ProtocolHandler`].
pub type WireMessage = Vec<u8>;

/// Behavior specific to a device's LAN control dialect.
pub trait ProtocolHandler: Send + Sync {
    /// The protocol tag this handler answers for (matches `devices.protocol`).
    fn protocol_name(&self) -> &'static str;

    /// Default UDP/TCP control port when the device declares none.
    fn default_port(&self) -> u16;

    /// Wraps an aggregated, already-capability-sanitized payload into one or
    /// more wire messages, enqueued as separate `state` rows so ordering is
    /// preserved and retries are per-command (spec §4.C "Payload wrapping").
    fn wrap(&self, payload: &serde_json::Value) -> Result<Vec<WireMessage>, BridgeError>;
}

/// Looks up a [`ProtocolHandler`] by `devices.protocol` tag. Only `govee` is
/// implemented; unknown protocols are a configuration error at mapping time.
pub fn handler_for(protocol: &str) -> Result<Box<dyn ProtocolHandler>, BridgeError> {
    match protocol {
        "govee" => Ok(Box::new(govee::GoveeProtocolHandler)),
        other => Err(BridgeError::Configuration(format!(
            "unknown device protocol '{other}'"
        ))),
    }
}
