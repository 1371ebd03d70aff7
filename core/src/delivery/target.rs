//! Per-device transport/port resolution from capability hints
//! (spec §4.D step 6, grounded on `sender.py::_derive_target`).

use std::net::IpAddr;

use crate::store::Device;

/// A resolved send target for one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeviceTarget {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    fn from_hint(hint: &str) -> Option<Self> {
        match hint.to_ascii_lowercase().as_str() {
            "udp" => Some(Transport::Udp),
            "tcp" => Some(Transport::Tcp),
            _ => None,
        }
    }
}

fn transport_hint(raw: &serde_json::Value) -> Option<&str> {
    raw.get("transport")
        .or_else(|| raw.get("protocol"))
        .and_then(|v| v.as_str())
}

fn port_hint(raw: &serde_json::Value) -> Option<u16> {
    for key in ["port", "control_port", "device_port"] {
        if let Some(value) = raw.get(key) {
            let parsed = value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok()));
            if let Some(p) = parsed {
                if p > 0 && p <= u16::MAX as u64 {
                    return Some(p as u16);
                }
            }
        }
    }
    None
}

/// Resolves a device's send target, or `None` if it has no known IP
/// (spec §4.D step 4 "missing_ip").
pub fn derive_target(device: &Device, default_transport: &str, default_port: u16) -> Option<DeviceTarget> {
    let ip = device.ip?;
    let raw = &device.capabilities.raw;
    let transport = transport_hint(raw)
        .and_then(Transport::from_hint)
        .unwrap_or(Transport::from_hint(default_transport).unwrap_or(Transport::Udp));
    let port = port_hint(raw).unwrap_or(default_port);
    Some(DeviceTarget {
        device_id: device.id.clone(),
        ip,
        port,
        transport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::normalize_capabilities;
    use serde_json::json;

    fn device_with_caps(caps: serde_json::Value, ip: Option<&str>) -> Device {
        Device {
            id: "dev-1".into(),
            protocol: "govee".into(),
            ip: ip.map(|s| s.parse().unwrap()),
            name: None,
            description: None,
            model: None,
            device_type: None,
            capabilities: normalize_capabilities(None, &caps),
            manual: false,
            discovered: true,
            configured: false,
            enabled: true,
            stale: false,
            offline: false,
            failure_count: 0,
            last_payload_hash: None,
            last_payload_at: None,
            last_failure_at: None,
            poll_failure_count: 0,
            poll_last_success_at: None,
            poll_last_failure_at: None,
            first_seen: 0,
            last_seen: 0,
        }
    }

    #[test]
    fn missing_ip_yields_none() {
        let device = device_with_caps(json!({}), None);
        assert!(derive_target(&device, "udp", 4003).is_none());
    }

    #[test]
    fn falls_back_to_config_defaults() {
        let device = device_with_caps(json!({}), Some("10.0.0.5"));
        let target = derive_target(&device, "udp", 4003).unwrap();
        assert_eq!(target.transport, Transport::Udp);
        assert_eq!(target.port, 4003);
    }

    #[test]
    fn capability_hints_override_defaults() {
        let device = device_with_caps(json!({"transport": "tcp", "control_port": 5555}), Some("10.0.0.5"));
        let target = derive_target(&device, "udp", 4003).unwrap();
        assert_eq!(target.transport, Transport::Tcp);
        assert_eq!(target.port, 5555);
    }
}
