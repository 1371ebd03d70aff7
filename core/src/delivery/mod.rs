//! Delivery: per-device send workers draining the Store's FIFO, rate
//! limited and retried (spec §4.D, grounded on `sender.py::DeviceSenderService`).

mod ratelimiter;
mod target;
mod transport;

pub use ratelimiter::RateLimiter;
pub use target::{derive_target, DeviceTarget, Transport};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::{BackoffPolicy, HealthMonitor};
use crate::metrics::MetricsRegistry;
use crate::store::{DeadLetterReason, PendingState, Store};

const SUBSYSTEM: &str = "delivery";

fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Delivery's immutable, cloneable configuration slice, resolved once from
/// [`crate::config::BridgeConfig`] at construction.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub default_transport: String,
    pub default_port: u16,
    pub send_timeout: Duration,
    pub send_retries: u32,
    pub backoff: BackoffPolicy,
    pub max_send_rate: f64,
    pub queue_poll_interval: Duration,
    pub idle_wait: Duration,
    pub offline_threshold: u32,
    pub dry_run: bool,
}

/// Owns the per-device worker pool. The supervisor polls `pending_device_ids`
/// and spawns/reaps workers; workers themselves never block on each other
/// (spec §4.D "Model").
pub struct Delivery {
    store: Arc<Store>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsRegistry>,
    rate_limiter: Arc<RateLimiter>,
    settings: DeliverySettings,
    workers: DashMap<String, JoinHandle<()>>,
    stop: CancellationToken,
}

impl Delivery {
    pub fn new(
        store: Arc<Store>,
        health: Arc<HealthMonitor>,
        metrics: Arc<MetricsRegistry>,
        rate_limit_per_second: f64,
        rate_limit_burst: f64,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            health,
            metrics,
            rate_limiter: Arc::new(RateLimiter::new(rate_limit_per_second, rate_limit_burst)),
            settings,
            workers: DashMap::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Polls for newly-pending devices and spawns a worker for each one not
    /// already running, reaping finished workers every iteration
    /// (spec §4.D "Model").
    pub async fn run(self: &Arc<Self>) {
        loop {
            if let Err(err) = self.ensure_workers() {
                tracing::warn!(error = %err, "delivery failed to list pending devices");
            }
            self.report_queue_depths();
            self.reap_finished_workers();
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(self.settings.queue_poll_interval) => {}
            }
        }
    }

    fn ensure_workers(self: &Arc<Self>) -> crate::error::BridgeResult<()> {
        for device_id in self.store.pending_device_ids()? {
            if self.workers.contains_key(&device_id) {
                continue;
            }
            let this = Arc::clone(self);
            let id_for_task = device_id.clone();
            let handle = tokio::spawn(async move { this.run_device_queue(id_for_task).await });
            self.workers.insert(device_id, handle);
        }
        Ok(())
    }

    /// Publishes per-device and total queue-depth gauges plus the offline
    /// device count (spec §6 "Observability", "queue depths per device and
    /// total", "offline device count").
    fn report_queue_depths(&self) {
        match self.store.queue_depths() {
            Ok((per_device, total)) => {
                for (device_id, depth) in per_device {
                    self.metrics.gauges.set(format!("queue_depth:{device_id}"), depth as i64);
                }
                self.metrics.gauges.set("queue_depth_total", total as i64);
            }
            Err(err) => {
                tracing::warn!(error = %err, "delivery failed to read queue depths");
            }
        }
        match self.store.offline_device_count() {
            Ok(count) => self.metrics.gauges.set("offline_device_count", count as i64),
            Err(err) => tracing::warn!(error = %err, "delivery failed to read offline device count"),
        }
    }

    fn reap_finished_workers(&self) {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|e| e.value().is_finished())
            .map(|e| e.key().clone())
            .collect();
        for device_id in finished {
            self.workers.remove(&device_id);
        }
    }

    /// Drains one device's queue until empty-and-idle, then returns so the
    /// supervisor can respawn on demand (spec §4.D "Model").
    async fn run_device_queue(self: Arc<Self>, device_id: String) {
        let rate_delay = if self.settings.max_send_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.settings.max_send_rate)
        } else {
            Duration::ZERO
        };

        loop {
            if self.stop.is_cancelled() {
                return;
            }
            let state = match self.store.next_state(&device_id) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(error = %err, device_id = %device_id, "delivery next_state failed");
                    return;
                }
            };
            let Some(state) = state else {
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    _ = tokio::time::sleep(self.settings.idle_wait) => return,
                }
            };

            self.process_state(state).await;

            if !rate_delay.is_zero() {
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    _ = tokio::time::sleep(rate_delay) => {}
                }
            }
        }
    }

    async fn sleep_unless_stopped(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Runs the per-state send pipeline (spec §4.D steps 1-10).
    async fn process_state(&self, state: PendingState) {
        let (allowed, remaining) = self.health.allow_attempt(SUBSYSTEM);
        if !allowed {
            tracing::warn!(
                device_id = %state.device_id,
                cooldown_secs = remaining.as_secs_f64(),
                "delivery suppressed after repeated failures"
            );
            self.metrics.counters.incr("delivery_suppressed");
            self.sleep_unless_stopped(remaining).await;
            return;
        }

        let hash = payload_hash(&state.payload);

        let device = match self.store.device_info(&state.device_id) {
            Ok(device) => device,
            Err(err) => {
                tracing::warn!(error = %err, device_id = %state.device_id, "delivery device_info failed");
                return;
            }
        };
        let Some(device) = device else {
            self.dead_letter(
                state,
                DeadLetterReason::DeviceUnavailable,
                "missing, disabled, or stale",
            );
            return;
        };

        let Some(target) = derive_target(&device, &self.settings.default_transport, self.settings.default_port)
        else {
            self.dead_letter(state, DeadLetterReason::MissingIp, "device has no IP address");
            return;
        };

        if device.failure_count == 0 && device.last_payload_hash.as_deref() == Some(hash.as_str()) {
            self.metrics.counters.incr("delivery_duplicate_dropped");
            if let Err(err) = self.store.delete_state(state.id) {
                tracing::warn!(error = %err, device_id = %state.device_id, "delivery duplicate delete_state failed");
            }
            return;
        }

        self.rate_limiter.acquire(&self.metrics).await;

        let success = self.send_with_retries(&target, &state.payload).await;

        if success {
            self.health.record_success(SUBSYSTEM);
            if let Err(err) = self.store.record_send_success(state.id, &state.device_id, &hash) {
                tracing::warn!(error = %err, device_id = %state.device_id, "record_send_success failed");
            }
            self.metrics.counters.incr(if self.settings.dry_run {
                "delivery_dry_run"
            } else {
                "delivery_success"
            });
        } else {
            if let Err(err) = self
                .store
                .record_send_failure(&state.device_id, self.settings.offline_threshold)
            {
                tracing::warn!(error = %err, device_id = %state.device_id, "record_send_failure failed");
            }
            self.health.record_failure(SUBSYSTEM, Some("send failed"));
            self.metrics.counters.incr("delivery_failure");
            self.sleep_unless_stopped(self.settings.backoff.delay(1)).await;
        }
    }

    fn dead_letter(&self, state: PendingState, reason: DeadLetterReason, details: &str) {
        if let Err(err) = self.store.record_send_failure(&state.device_id, self.settings.offline_threshold) {
            tracing::warn!(error = %err, device_id = %state.device_id, "record_send_failure failed");
        }
        self.health.record_failure(SUBSYSTEM, Some(details));
        self.metrics.counters.incr("delivery_dead_letter");
        if let Err(err) = self.store.quarantine_state(&state, reason, Some(details)) {
            tracing::warn!(error = %err, device_id = %state.device_id, "quarantine_state failed");
        }
    }

    /// Attempts up to `device_send_retries` sends with the configured
    /// backoff between attempts (spec §4.D step 7). Dry-run mode never
    /// touches the network and always succeeds.
    async fn send_with_retries(&self, target: &DeviceTarget, payload: &[u8]) -> bool {
        if self.settings.dry_run {
            tracing::info!(
                device_id = %target.device_id,
                transport = ?target.transport,
                port = target.port,
                "dry-run: would send payload"
            );
            return true;
        }

        let attempts = self.settings.send_retries.max(1);
        let delays = self.settings.backoff.iter_delays(attempts);
        let transport_label = match target.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        };
        for attempt in 1..=attempts {
            let started = std::time::Instant::now();
            let sent = match target.transport {
                Transport::Udp => transport::send_udp(target.ip, target.port, payload, self.settings.send_timeout).await,
                Transport::Tcp => transport::send_tcp(target.ip, target.port, payload, self.settings.send_timeout).await,
            };
            self.metrics
                .histograms
                .observe(format!("send_duration:{transport_label}"), started.elapsed());
            if sent {
                return true;
            }
            if attempt == attempts {
                break;
            }
            self.sleep_unless_stopped(delays[(attempt - 1) as usize]).await;
        }
        tracing::error!(
            device_id = %target.device_id,
            attempts,
            "exhausted retries sending payload"
        );
        false
    }

    /// Signals every worker to stop after its current in-flight send
    /// completes, and waits for them to exit (spec §4.S "Graceful shutdown",
    /// "let Delivery complete the in-flight send").
    pub async fn stop(&self) {
        self.stop.cancel();
        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.workers.remove(&id) {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::store::{DeviceStateUpdate, DiscoveryResult};
    use serde_json::json;

    fn test_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("bridge.db"), Arc::new(NoopEventEmitter)).unwrap();
        (dir, Arc::new(store))
    }

    fn test_settings(dry_run: bool) -> DeliverySettings {
        DeliverySettings {
            default_transport: "udp".into(),
            default_port: 4003,
            send_timeout: Duration::from_millis(100),
            send_retries: 2,
            backoff: BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(10)),
            max_send_rate: 0.0,
            queue_poll_interval: Duration::from_millis(10),
            idle_wait: Duration::from_millis(10),
            offline_threshold: 3,
            dry_run,
        }
    }

    fn test_delivery(store: Arc<Store>, dry_run: bool) -> Delivery {
        Delivery::new(
            store,
            Arc::new(HealthMonitor::new(&["delivery"], 5, Duration::from_millis(50))),
            Arc::new(MetricsRegistry::new()),
            1000.0,
            1000.0,
            test_settings(dry_run),
        )
    }

    #[tokio::test]
    async fn unknown_device_is_dead_lettered() {
        let (_dir, store) = test_store();
        let delivery = test_delivery(Arc::clone(&store), true);

        // A state row referencing a device that was never registered is
        // impossible via enqueue_state (it checks device existence), so
        // simulate the quarantine path directly via process_state's
        // device_info lookup by constructing the state by hand.
        let state = PendingState {
            id: 1,
            device_id: "ghost".into(),
            payload: b"{}".to_vec(),
            created_at: 0,
            context_id: None,
        };
        delivery.process_state(state).await;

        let dead = store.dead_letters_for_device("ghost").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::DeviceUnavailable);
    }

    #[tokio::test]
    async fn duplicate_payload_is_dropped_without_resending() {
        let (_dir, store) = test_store();
        store
            .upsert_discovery(&DiscoveryResult {
                id: "dev-1".into(),
                ip: "10.0.0.5".parse().unwrap(),
                protocol: "govee".into(),
                model: Some("H6008".into()),
                device_type: None,
                capabilities: json!({"mode": "rgb"}),
            })
            .unwrap();
        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"turn": "on"}),
                context_id: None,
            })
            .unwrap();

        let delivery = test_delivery(Arc::clone(&store), true);
        let first = store.next_state("dev-1").unwrap().unwrap();
        let hash = payload_hash(&first.payload);
        delivery.process_state(first).await;
        assert_eq!(store.device_info("dev-1").unwrap().unwrap().last_payload_hash, Some(hash.clone()));

        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"turn": "on"}),
                context_id: None,
            })
            .unwrap();
        let second = store.next_state("dev-1").unwrap().unwrap();
        delivery.process_state(second).await;

        assert!(store.next_state("dev-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn dry_run_records_success_without_network() {
        let (_dir, store) = test_store();
        store
            .upsert_discovery(&DiscoveryResult {
                id: "dev-1".into(),
                ip: "10.0.0.5".parse().unwrap(),
                protocol: "govee".into(),
                model: Some("H6008".into()),
                device_type: None,
                capabilities: json!({"mode": "rgb"}),
            })
            .unwrap();
        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"turn": "on"}),
                context_id: None,
            })
            .unwrap();

        let delivery = test_delivery(Arc::clone(&store), true);
        let state = store.next_state("dev-1").unwrap().unwrap();
        delivery.process_state(state).await;

        assert!(store.next_state("dev-1").unwrap().is_none());
        let device = store.device_info("dev-1").unwrap().unwrap();
        assert_eq!(device.failure_count, 0);
        assert!(device.last_payload_hash.is_some());
    }
}
