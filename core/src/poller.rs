//! Background device-liveness poller (spec §2 row S "runs optional
//! background device-liveness poller", §6 "device_poll_*"), grounded on
//! `examples/original_source/.../poller.py`'s `DevicePollerService` and its
//! sibling `devices.py::DeviceStore._poll_targets`.
//!
//! Unlike Delivery, which only ever writes to a device, the poller both
//! sends a `devStatus` probe and waits for a reply on the same UDP socket;
//! a reply (of any shape) within the timeout counts as success, and
//! whatever `power`/`brightness`/`color` keys it carries are extracted into
//! a [`PollState`] snapshot. No reply within the timeout counts as failure.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeResult;
use crate::store::{PollState, Store};

/// Minimal `devStatus` probe understood by the Govee LAN protocol
/// (`original_source/.../poller.py`'s `self._payload`).
const POLL_PAYLOAD: &[u8] = br#"{"msg":{"cmd":"devStatus","data":{}}}"#;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Runs until `cancel` fires: every `interval`, probes every enabled device
/// with a known IP (`Store::poll_targets`) and records the outcome via
/// `Store::record_poll_success`/`record_poll_failure` (spec §4.C).
pub async fn run(
    store: Arc<Store>,
    cancel: CancellationToken,
    interval: Duration,
    timeout: Duration,
    port: u16,
    offline_threshold: u32,
) -> BridgeResult<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }

        let targets = store.poll_targets()?;
        for device in targets {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Some(ip) = device.ip else { continue };

            match poll_one(ip, port, timeout).await {
                Some(response) => {
                    let state = response.and_then(|payload| PollState::from_response(&payload, now_ms()));
                    if let Err(err) = store.record_poll_success(&device.id, state.as_ref()) {
                        log::warn!("record_poll_success failed for {}: {err}", device.id);
                    }
                }
                None => {
                    if let Err(err) = store.record_poll_failure(&device.id, offline_threshold) {
                        log::warn!("record_poll_failure failed for {}: {err}", device.id);
                    }
                }
            }
        }
    }
}

/// Sends the poll payload and waits for a single reply. `Some(None)` means
/// a reply arrived but didn't parse as JSON (still a liveness success);
/// `None` means the device timed out or the socket failed outright.
async fn poll_one(ip: IpAddr, port: u16, timeout: Duration) -> Option<Option<serde_json::Value>> {
    let attempt = async {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        socket.send_to(POLL_PAYLOAD, SocketAddr::new(ip, port)).await.ok()?;
        let mut buf = [0u8; 2048];
        let (len, _) = socket.recv_from(&mut buf).await.ok()?;
        Some(serde_json::from_slice::<serde_json::Value>(&buf[..len]).ok())
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Some(parsed)) => Some(parsed),
        Ok(None) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_one_times_out_against_unreachable_port() {
        // Port 0 never accepts a bind target for send_to on a real host;
        // use an address nothing listens on so recv_from never resolves.
        let unreachable: IpAddr = "127.0.0.1".parse().unwrap();
        let result = poll_one(unreachable, 1, Duration::from_millis(50)).await;
        assert!(result.is_none());
    }
}
