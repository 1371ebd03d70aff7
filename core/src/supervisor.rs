//! Supervisor: composes IngestListeners, Mapper, Store, and Delivery under
//! a single process with lifecycle, health/circuit-breaker suppression, and
//! hot configuration reload (spec §4.S).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::delivery::{Delivery, DeliverySettings};
use crate::error::{BridgeError, BridgeResult};
use crate::events::BroadcastEventBridge;
use crate::health::{BackoffPolicy, HealthMonitor, SubsystemSnapshot, SubsystemStatus};
use crate::ingest::{ArtNetListener, DmxFrame, SacnListener};
use crate::mapper::Mapper;
use crate::metrics::MetricsRegistry;
use crate::store::Store;

const SUBSYSTEM_INGEST: &str = "ingest";
const SUBSYSTEM_MAPPER: &str = "mapper";
const SUBSYSTEM_DELIVERY: &str = "delivery";
const SUBSYSTEM_STORE: &str = "store";
const SUBSYSTEM_POLLER: &str = "poller";

fn delivery_settings(config: &BridgeConfig) -> DeliverySettings {
    DeliverySettings {
        default_transport: config.device_default_transport.clone(),
        default_port: config.device_default_port,
        send_timeout: config.device_send_timeout(),
        send_retries: config.device_send_retries,
        backoff: BackoffPolicy::new(
            config.device_backoff_base(),
            config.device_backoff_factor,
            config.device_backoff_max(),
        ),
        max_send_rate: config.device_max_send_rate,
        queue_poll_interval: Duration::from_millis(config.device_queue_poll_interval_ms),
        idle_wait: Duration::from_millis(config.device_idle_wait_ms),
        offline_threshold: config.device_offline_threshold,
        dry_run: config.dry_run,
    }
}

/// The set of long-running tasks composing one "generation" of the running
/// subsystems, so a SIGHUP reload can cancel and drop one generation while
/// keeping the Store (spec §4.S "Hot reload").
struct Generation {
    cancel: CancellationToken,
    mapper: Arc<Mapper>,
    delivery: Arc<Delivery>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Starts/stops all subsystems, enforces circuit-breaker suppression on
/// repeated subsystem failures, applies SIGHUP reloads, and runs the
/// optional background device-liveness poller (spec §4.S).
pub struct Supervisor {
    config: ArcSwap<BridgeConfig>,
    store: Arc<Store>,
    events: Arc<BroadcastEventBridge>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsRegistry>,
    generation: tokio::sync::Mutex<Option<Generation>>,
}

impl Supervisor {
    /// Opens the Store and applies migrations, then returns a supervisor
    /// ready to [`Supervisor::start`]. Persistence and configuration
    /// failures are fatal at this stage (spec §7 "Persistence", "Configuration").
    pub fn bootstrap(config: BridgeConfig) -> BridgeResult<Arc<Self>> {
        config.validate()?;
        let events = Arc::new(BroadcastEventBridge::new(1024));
        let store = Arc::new(Store::open(&config.db_path, events.clone())?);
        let health = Arc::new(HealthMonitor::new(
            &[
                SUBSYSTEM_INGEST,
                SUBSYSTEM_MAPPER,
                SUBSYSTEM_DELIVERY,
                SUBSYSTEM_STORE,
                SUBSYSTEM_POLLER,
            ],
            config.subsystem_failure_threshold,
            config.subsystem_failure_cooldown(),
        ));
        health.record_success(SUBSYSTEM_STORE);

        for decl in &config.manual_devices {
            store.upsert_manual(decl)?;
        }

        Ok(Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            store,
            events,
            health,
            metrics: Arc::new(MetricsRegistry::new()),
            generation: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn events(&self) -> Arc<BroadcastEventBridge> {
        Arc::clone(&self.events)
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    pub fn health_snapshot(&self) -> Vec<SubsystemSnapshot> {
        self.health.snapshot()
    }

    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config.load_full()
    }

    /// Starts the event bus consumers, IngestListeners, Mapper, and Delivery
    /// in that order (spec §4.S "Lifecycle"). Any subsystem start failure is
    /// recorded against the health monitor; the caller decides whether that
    /// is fatal.
    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let generation = self.spawn_generation().await?;
        *self.generation.lock().await = Some(generation);
        Ok(())
    }

    async fn spawn_generation(self: &Arc<Self>) -> BridgeResult<Generation> {
        let config = self.config.load_full();
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let mapper = Arc::new(Mapper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            config.debounce(),
            config.trace_context_ids,
            config.trace_context_sample_rate,
        )?);

        let delivery = Arc::new(Delivery::new(
            Arc::clone(&self.store),
            Arc::clone(&self.health),
            Arc::clone(&self.metrics),
            config.rate_limit_per_second,
            config.rate_limit_burst,
            delivery_settings(&config),
        ));

        // Mapper cache invalidation, subscribed before any frames can arrive.
        {
            let mapper = Arc::clone(&mapper);
            let events = self.events.subscribe();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = mapper.run_cache_invalidation_loop(events) => {}
                }
            }));
        }

        // IngestListeners feed a bounded channel the Mapper drains.
        let (tx, rx) = mpsc::channel::<DmxFrame>(4096);
        {
            let mapper = Arc::clone(&mapper);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = mapper.run(rx) => {}
                }
            }));
        }

        if config.artnet_enabled {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.artnet_port);
            let health = Arc::clone(&self.health);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let priority = config.artnet_priority;
            let metrics = Arc::clone(&self.metrics);
            tasks.push(tokio::spawn(async move {
                run_with_restart(&health, SUBSYSTEM_INGEST, cancel.clone(), &metrics, move || {
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    async move {
                        let listener = ArtNetListener::bind(addr, priority).await?;
                        listener.run(tx, cancel).await
                    }
                })
                .await;
            }));
        }

        if config.sacn_enabled {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.sacn_port);
            let health = Arc::clone(&self.health);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let metrics = Arc::clone(&self.metrics);
            tasks.push(tokio::spawn(async move {
                run_with_restart(&health, SUBSYSTEM_INGEST, cancel.clone(), &metrics, move || {
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    async move {
                        let listener = SacnListener::bind(addr).await?;
                        listener.run(tx, cancel).await
                    }
                })
                .await;
            }));
        }
        drop(tx);

        {
            let delivery = Arc::clone(&delivery);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = delivery.run() => {}
                }
            }));
        }

        if config.device_poll_enabled {
            let store = Arc::clone(&self.store);
            let cancel = cancel.clone();
            let interval = Duration::from_secs(config.discovery_interval_secs.max(1));
            let threshold = config.discovery_stale_after_secs as i64;
            tasks.push(tokio::spawn(async move {
                liveness_poll_loop(store, cancel, interval, threshold).await;
            }));

            let store = Arc::clone(&self.store);
            let health = Arc::clone(&self.health);
            let metrics = Arc::clone(&self.metrics);
            let cancel = cancel.clone();
            let poll_interval = Duration::from_secs(config.device_poll_interval_secs.max(1));
            let poll_timeout = Duration::from_secs(config.device_poll_timeout_secs.max(1));
            let poll_port = config.device_default_port;
            let offline_threshold = config.device_poll_offline_threshold;
            tasks.push(tokio::spawn(async move {
                run_with_restart(&health, SUBSYSTEM_POLLER, cancel.clone(), &metrics, move || {
                    let store = Arc::clone(&store);
                    let cancel = cancel.clone();
                    async move {
                        crate::poller::run(store, cancel, poll_interval, poll_timeout, poll_port, offline_threshold).await
                    }
                })
                .await;
            }));
        }

        Ok(Generation { cancel, mapper, delivery, tasks })
    }

    /// Applies a SIGHUP reload: re-reads the config, rejects the reload if
    /// `db_path` or the capability catalog path would change, otherwise
    /// stops and restarts all subsystems with the new config while
    /// preserving the Store. The Mapper's last-sent payload map is
    /// snapshotted before restart to avoid a duplicate-resend storm on
    /// reload (spec §4.S "Hot reload").
    pub async fn reload(self: &Arc<Self>, file_path: Option<&std::path::Path>) -> BridgeResult<()> {
        let new_config = BridgeConfig::load(file_path)?;
        new_config.validate()?;

        let current = self.config.load_full();
        if new_config.requires_restart_from(&current) {
            return Err(BridgeError::Configuration(
                "db_path or capability_catalog_path changed; restart required".into(),
            ));
        }

        let snapshot = {
            let guard = self.generation.lock().await;
            guard.as_ref().map(|gen| gen.mapper.snapshot_last_payloads())
        };

        self.stop_generation().await;
        self.config.store(Arc::new(new_config));
        let mut generation = self.spawn_generation().await?;
        if let Some(snapshot) = snapshot {
            generation.mapper.restore_last_payloads(snapshot);
        }
        *self.generation.lock().await = Some(generation);
        Ok(())
    }

    async fn stop_generation(&self) {
        let generation = self.generation.lock().await.take();
        if let Some(generation) = generation {
            generation.cancel.cancel();
            generation.mapper.stop();
            generation.delivery.stop().await;
            for task in generation.tasks {
                let abort = task.abort_handle();
                if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                    abort.abort();
                }
            }
        }
    }

    /// Graceful shutdown (spec §4.S): cancels listeners so no new frames are
    /// accepted, flushes the Mapper's debounced updates into the Store, lets
    /// Delivery complete in-flight sends, then the Store is dropped with
    /// this `Arc`.
    pub async fn shutdown(&self) {
        self.stop_generation().await;
    }
}

/// Runs `make_attempt` in a loop, reporting each attempt's outcome to the
/// health monitor and retrying with the monitor's suppression cooldown
/// (spec §4.A "Failure semantics", §4.S "Lifecycle").
async fn run_with_restart<F, Fut>(
    health: &HealthMonitor,
    subsystem: &str,
    cancel: CancellationToken,
    metrics: &MetricsRegistry,
    mut make_attempt: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BridgeResult<()>>,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let (allowed, remaining) = health.allow_attempt(subsystem);
        report_subsystem_gauges(health, metrics);
        if !allowed {
            metrics.counters.incr(format!("{subsystem}_suppressed"));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {}
            }
            continue;
        }

        match make_attempt().await {
            Ok(()) => {
                health.record_success(subsystem);
                report_subsystem_gauges(health, metrics);
                return;
            }
            Err(err) => {
                log::warn!("{subsystem} stopped: {err}");
                health.record_failure(subsystem, Some(&err.to_string()));
                metrics.counters.incr(format!("{subsystem}_restarts"));
                report_subsystem_gauges(health, metrics);
            }
        }
    }
}

/// Publishes one numeric gauge per tracked subsystem
/// (spec §6 "Observability", "subsystem status gauges"): `0=ok`,
/// `1=degraded`, `2=suppressed`, `3=recovering`.
fn report_subsystem_gauges(health: &HealthMonitor, metrics: &MetricsRegistry) {
    for snapshot in health.snapshot() {
        let code = match snapshot.status {
            SubsystemStatus::Ok => 0,
            SubsystemStatus::Degraded => 1,
            SubsystemStatus::Suppressed => 2,
            SubsystemStatus::Recovering => 3,
        };
        metrics.gauges.set(format!("subsystem_status:{}", snapshot.name), code);
    }
}

/// Periodically marks devices as stale when they have not been seen within
/// `threshold_sec` (spec §4.C `mark_stale`). The actual discovery scanner
/// that refreshes `last_seen` is an out-of-scope collaborator; this loop
/// just applies its side of the staleness contract on a timer. Protocol-level
/// liveness polling itself runs as the separate [`crate::poller`] subsystem.
async fn liveness_poll_loop(store: Arc<Store>, cancel: CancellationToken, interval: Duration, threshold_sec: i64) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                if let Err(err) = store.mark_stale(threshold_sec) {
                    log::warn!("liveness poll mark_stale failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.db_path = dir.join("bridge.db");
        config.artnet_enabled = false;
        config.sacn_enabled = false;
        config.device_poll_enabled = false;
        config.dry_run = true;
        config
    }

    #[tokio::test]
    async fn bootstrap_then_start_then_shutdown_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::bootstrap(test_config(dir.path())).unwrap();
        supervisor.start().await.unwrap();
        assert!(supervisor
            .health_snapshot()
            .iter()
            .any(|s| s.name == SUBSYSTEM_STORE));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_rejects_db_path_change() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::bootstrap(test_config(dir.path())).unwrap();
        supervisor.start().await.unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let toml_path = other_dir.path().join("config.toml");
        std::fs::write(
            &toml_path,
            format!("db_path = \"{}\"\n", other_dir.path().join("other.db").display()),
        )
        .unwrap();

        let result = supervisor.reload(Some(&toml_path)).await;
        assert!(result.is_err());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn poller_subsystem_starts_and_stops_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.device_poll_enabled = true;
        config.device_poll_interval_secs = 3600;
        config.discovery_interval_secs = 3600;

        let supervisor = Supervisor::bootstrap(config).unwrap();
        supervisor.start().await.unwrap();
        assert!(supervisor
            .health_snapshot()
            .iter()
            .any(|s| s.name == SUBSYSTEM_POLLER));
        supervisor.shutdown().await;
    }
}
