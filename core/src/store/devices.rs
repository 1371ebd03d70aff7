//! Device domain types (spec §3 "Device").

use std::net::IpAddr;

use serde::Serialize;

use crate::capabilities::NormalizedCapabilities;

/// A persistent device entity keyed by a stable, hardware-provided id.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub protocol: String,
    pub ip: Option<IpAddr>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub model: Option<String>,
    pub device_type: Option<String>,
    #[serde(skip)]
    pub capabilities: NormalizedCapabilities,
    pub manual: bool,
    pub discovered: bool,
    pub configured: bool,
    pub enabled: bool,
    pub stale: bool,
    pub offline: bool,
    pub failure_count: u32,
    pub last_payload_hash: Option<String>,
    pub last_payload_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub poll_failure_count: u32,
    pub poll_last_success_at: Option<i64>,
    pub poll_last_failure_at: Option<i64>,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Device {
    /// Snapshot used by Delivery to resolve a send target (spec §4.D step 3).
    /// Returns `None` if the device is unusable for delivery (disabled or
    /// stale), matching the Store's `device_info` contract.
    pub fn is_deliverable(&self) -> bool {
        self.enabled && !self.stale
    }
}

/// A parsed discovery record, as would be produced by the (external)
/// discovery scanner collaborator.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub id: String,
    pub ip: IpAddr,
    pub protocol: String,
    pub model: Option<String>,
    pub device_type: Option<String>,
    pub capabilities: serde_json::Value,
}

/// Partial update applied with `COALESCE` semantics (spec §4.C `update_device`).
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub model: Option<String>,
    pub ip: Option<IpAddr>,
    pub enabled: Option<bool>,
    pub capabilities: Option<serde_json::Value>,
}

/// Last-seen device state snapshot for liveness/UI (spec §3 "PollState").
#[derive(Debug, Clone, Serialize)]
pub struct PollState {
    pub power: Option<bool>,
    pub brightness: Option<u8>,
    pub color: Option<serde_json::Value>,
    pub updated_at: i64,
}

impl PollState {
    /// Extracts a minimal state snapshot from a poll response, mirroring
    /// `poller.py::_extract_state`'s lenient `data`/`state` unwrapping: the
    /// first of `payload["msg"]["data"]` or `payload` that carries any of
    /// `power`/`brightness`/`color` wins.
    pub fn from_response(payload: &serde_json::Value, updated_at: i64) -> Option<Self> {
        let data = payload
            .get("msg")
            .and_then(|m| m.get("data"))
            .unwrap_or(payload);

        let power = data
            .get("power")
            .and_then(|v| v.as_bool())
            .or_else(|| data.get("onOff").and_then(|v| v.as_i64()).map(|v| v != 0));
        let brightness = data.get("brightness").and_then(|v| v.as_u64()).map(|v| v as u8);
        let color = data.get("color").cloned();

        if power.is_none() && brightness.is_none() && color.is_none() {
            return None;
        }
        Some(Self { power, brightness, color, updated_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_state_from_msg_data_envelope() {
        let payload = json!({"msg": {"cmd": "devStatus", "data": {"onOff": 1, "brightness": 80}}});
        let state = PollState::from_response(&payload, 1_000).unwrap();
        assert_eq!(state.power, Some(true));
        assert_eq!(state.brightness, Some(80));
    }

    #[test]
    fn falls_back_to_top_level_payload() {
        let payload = json!({"power": false, "color": {"r": 1, "g": 2, "b": 3}});
        let state = PollState::from_response(&payload, 1_000).unwrap();
        assert_eq!(state.power, Some(false));
        assert!(state.color.is_some());
    }

    #[test]
    fn returns_none_when_no_recognized_keys_present() {
        let payload = json!({"msg": {"cmd": "devStatus", "data": {"unrelated": 1}}});
        assert!(PollState::from_response(&payload, 1_000).is_none());
    }
}
