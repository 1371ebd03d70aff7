//! Mapper: translates `DmxFrame`s into per-device state updates, debounces
//! and change-detects them, then hands surviving updates to the Store
//! (spec §4.B).

mod cache;
mod translate;

pub use cache::MappingCache;
pub use translate::{apply_gamma_dimmer, merge_fragment, translate_discrete, translate_range, CachedMapping};

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::DomainEvent;
use crate::ingest::{DmxFrame, SourceProtocol};
use crate::metrics::MetricsRegistry;
use crate::store::{DeviceStateUpdate, MappingType, Store};

struct PendingUpdate {
    token: CancellationToken,
    update: DeviceStateUpdate,
}

/// Tracks the active (protocol, priority) feeding a universe, so that when
/// two protocols address the same universe the higher-priority one wins and
/// equal-priority ties go to whichever arrived last (spec §4.B "Priority and
/// mixing").
struct UniverseSource {
    protocol: SourceProtocol,
    priority: u8,
}

/// Owns the per-universe mapping cache, per-device debounce timers, and the
/// last-sent payload map used for change detection.
pub struct Mapper {
    store: Arc<Store>,
    cache: ArcSwap<MappingCache>,
    last_payloads: DashMap<String, Value>,
    pending: Arc<DashMap<String, PendingUpdate>>,
    universe_sources: DashMap<u16, UniverseSource>,
    metrics: Arc<MetricsRegistry>,
    debounce: Duration,
    trace_context_ids: bool,
    trace_context_sample_rate: f64,
}

impl Mapper {
    pub fn new(
        store: Arc<Store>,
        metrics: Arc<MetricsRegistry>,
        debounce: Duration,
        trace_context_ids: bool,
        trace_context_sample_rate: f64,
    ) -> crate::error::BridgeResult<Self> {
        let cache = MappingCache::build(&store)?;
        Ok(Self {
            store,
            cache: ArcSwap::from_pointee(cache),
            last_payloads: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            universe_sources: DashMap::new(),
            metrics,
            debounce,
            trace_context_ids,
            trace_context_sample_rate: trace_context_sample_rate.clamp(0.0, 1.0),
        })
    }

    /// Rebuilds the mapping cache and swaps it in atomically; in-flight
    /// frames observe either the old or new cache, never a half-built one
    /// (spec §4.B "Mapping cache").
    pub fn rebuild_cache(&self) -> crate::error::BridgeResult<()> {
        let cache = MappingCache::build(&self.store)?;
        self.cache.store(Arc::new(cache));
        Ok(())
    }

    /// Consumes `DmxFrame`s from the IngestListeners until the channel
    /// closes (spec §4.B main loop, "On stop" semantics run by the caller).
    pub async fn run(&self, mut frames: mpsc::Receiver<DmxFrame>) {
        while let Some(frame) = frames.recv().await {
            self.process_frame(frame);
        }
    }

    /// Subscribes to the domain event bus and rebuilds the cache on any
    /// mapping mutation (spec §4.B "Events").
    pub async fn run_cache_invalidation_loop(&self, mut events: broadcast::Receiver<DomainEvent>) {
        loop {
            match events.recv().await {
                Ok(event) if event.is_mapping_event() => {
                    if let Err(err) = self.rebuild_cache() {
                        tracing::warn!(error = %err, "mapper cache rebuild failed");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "mapper event subscriber lagged; forcing cache rebuild");
                    if let Err(err) = self.rebuild_cache() {
                        tracing::warn!(error = %err, "mapper cache rebuild failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Decides whether `frame` should update the universe's live state
    /// (spec §4.B "Priority and mixing"). sACN `priority=0` (terminated
    /// stream) is always rejected and never updates source tracking.
    fn accept_frame(&self, frame: &DmxFrame) -> bool {
        if frame.source_protocol == SourceProtocol::Sacn && frame.priority == 0 {
            return false;
        }
        match self.universe_sources.entry(frame.universe) {
            Entry::Vacant(slot) => {
                slot.insert(UniverseSource {
                    protocol: frame.source_protocol,
                    priority: frame.priority,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                let accept = frame.source_protocol == current.protocol || frame.priority >= current.priority;
                if accept {
                    slot.insert(UniverseSource {
                        protocol: frame.source_protocol,
                        priority: frame.priority,
                    });
                }
                accept
            }
        }
    }

    fn maybe_context_id(&self, frame: &DmxFrame) -> Option<String> {
        if !self.trace_context_ids {
            return None;
        }
        if rand::thread_rng().gen::<f64>() > self.trace_context_sample_rate {
            return None;
        }
        Some(format!(
            "{}-{}-{}-{}",
            frame.source_protocol.as_str(),
            frame.universe,
            frame.sequence,
            Uuid::new_v4().simple()
        ))
    }

    /// Runs the per-frame algorithm (spec §4.B steps 1-7).
    fn process_frame(&self, frame: DmxFrame) {
        let started = std::time::Instant::now();
        self.process_frame_inner(frame);
        self.metrics.histograms.observe("ingest_duration", started.elapsed());
    }

    fn process_frame_inner(&self, frame: DmxFrame) {
        self.metrics.counters.incr(format!("mapper_ingest:{}", frame.universe));

        if !self.accept_frame(&frame) {
            self.metrics.counters.incr(format!("mapper_superseded:{}", frame.universe));
            return;
        }

        let cache = self.cache.load();
        let Some(mappings) = cache.mappings_for(frame.universe) else {
            self.metrics.counters.incr(format!("mapper_unmapped:{}", frame.universe));
            return;
        };

        let context_id = self.maybe_context_id(&frame);

        // Aggregate fragments per device, preserving first-seen order
        // within the frame (spec §4.B step 5).
        let mut order: Vec<String> = Vec::new();
        let mut aggregated: std::collections::HashMap<String, Map<String, Value>> =
            std::collections::HashMap::new();

        for mapping in mappings {
            let start = mapping.channel as usize - 1;
            let end = start + mapping.length as usize;
            if end > frame.data.len() {
                tracing::debug!(
                    device_id = %mapping.device_id,
                    universe = frame.universe,
                    channel = mapping.channel,
                    length = mapping.length,
                    "mapping channel range exceeds frame length"
                );
                continue;
            }
            let slice = &frame.data[start..end];

            let fragment = match mapping.mapping_type {
                MappingType::Range => translate_range(mapping, slice),
                MappingType::Discrete => translate_discrete(mapping, slice[0]),
            };
            let Some(fragment) = fragment else { continue };

            if !aggregated.contains_key(&mapping.device_id) {
                order.push(mapping.device_id.clone());
            }
            let entry = aggregated
                .entry(mapping.device_id.clone())
                .or_default();
            merge_fragment(entry, fragment);
        }

        for device_id in order {
            let Some(payload_map) = aggregated.remove(&device_id) else { continue };
            let payload = Value::Object(payload_map);

            // Change detect (spec §4.B step 6).
            if let Some(previous) = self.last_payloads.get(&device_id) {
                if *previous == payload {
                    continue;
                }
            }
            self.last_payloads.insert(device_id.clone(), payload.clone());
            self.metrics.counters.incr(format!("mapper_updates:{device_id}"));

            self.schedule_update(DeviceStateUpdate {
                device_id,
                payload,
                context_id: context_id.clone(),
            });
        }
    }

    /// Starts (or resets) the per-device debounce timer and replaces any
    /// pending update for the device (spec §4.B step 7).
    fn schedule_update(&self, update: DeviceStateUpdate) {
        let device_id = update.device_id.clone();
        if let Some((_, previous)) = self.pending.remove(&device_id) {
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        self.pending.insert(
            device_id.clone(),
            PendingUpdate {
                token: token.clone(),
                update,
            },
        );

        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    if let Some((_, entry)) = pending.remove(&device_id) {
                        if let Err(err) = store.enqueue_state(entry.update) {
                            tracing::warn!(error = %err, device_id = %device_id, "mapper enqueue failed");
                        }
                    }
                }
            }
        });
    }

    /// Snapshots the last-sent payload map, so a supervisor-driven reload
    /// can restore it into the next generation's Mapper and avoid a
    /// duplicate-resend storm (spec §4.S "Hot reload").
    pub fn snapshot_last_payloads(&self) -> Vec<(String, Value)> {
        self.last_payloads
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Restores a previously snapshotted last-sent payload map.
    pub fn restore_last_payloads(&self, snapshot: Vec<(String, Value)>) {
        for (device_id, payload) in snapshot {
            self.last_payloads.insert(device_id, payload);
        }
    }

    /// Cancels every outstanding debounce timer and flushes its pending
    /// update directly to the Store (spec §4.B "On stop").
    pub fn stop(&self) {
        let device_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for device_id in &device_ids {
            if let Some((_, entry)) = self.pending.remove(device_id) {
                entry.token.cancel();
                if let Err(err) = self.store.enqueue_state(entry.update) {
                    tracing::warn!(error = %err, device_id = %device_id, "mapper flush-on-stop failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::store::{CreateMappingInput, DiscoveryResult};
    use serde_json::json;

    fn test_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("bridge.db"), Arc::new(NoopEventEmitter)).unwrap();
        (dir, Arc::new(store))
    }

    fn rgb_device(store: &Store, id: &str) {
        store
            .upsert_discovery(&DiscoveryResult {
                id: id.to_string(),
                ip: "10.0.0.5".parse().unwrap(),
                protocol: "govee".to_string(),
                model: Some("H6008".to_string()),
                device_type: None,
                capabilities: json!({"mode": "rgb"}),
            })
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", start_paused = true)]
    async fn identical_frames_enqueue_exactly_once() {
        let (_dir, store) = test_store();
        rgb_device(&store, "dev-1");
        store
            .create_mapping(CreateMappingInput {
                device_id: "dev-1".into(),
                universe: 1,
                channel: 1,
                length: 3,
                mapping_type: MappingType::Range,
                field: None,
                allow_overlap: false,
            })
            .unwrap();

        let mapper = Arc::new(
            Mapper::new(
                Arc::clone(&store),
                Arc::new(MetricsRegistry::new()),
                Duration::from_millis(10),
                false,
                0.0,
            )
            .unwrap(),
        );

        let frame = DmxFrame::new(1, &[10, 20, 30], 0, SourceProtocol::ArtNet, 100, "artnet-0");
        mapper.process_frame(frame.clone());
        mapper.process_frame(frame);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let pending = store.next_state("dev-1").unwrap();
        assert!(pending.is_some());
        let second = store.next_state("dev-1").unwrap();
        assert!(second.is_none() || second.unwrap().id == pending.unwrap().id);
    }

    #[tokio::test(flavor = "multi_thread", start_paused = true)]
    async fn debounce_coalesces_rapid_updates_into_one_enqueue() {
        let (_dir, store) = test_store();
        rgb_device(&store, "dev-1");
        store
            .create_mapping(CreateMappingInput {
                device_id: "dev-1".into(),
                universe: 1,
                channel: 1,
                length: 3,
                mapping_type: MappingType::Range,
                field: None,
                allow_overlap: false,
            })
            .unwrap();

        let mapper = Arc::new(
            Mapper::new(
                Arc::clone(&store),
                Arc::new(MetricsRegistry::new()),
                Duration::from_millis(50),
                false,
                0.0,
            )
            .unwrap(),
        );

        mapper.process_frame(DmxFrame::new(1, &[10, 20, 30], 0, SourceProtocol::ArtNet, 100, "artnet-0"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        mapper.process_frame(DmxFrame::new(1, &[11, 21, 31], 1, SourceProtocol::ArtNet, 100, "artnet-0"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = store.next_state("dev-1").unwrap().unwrap();
        assert!(first.payload.len() > 0);
        assert!(store.next_state("dev-1").unwrap().is_none());
    }

    #[test]
    fn higher_priority_source_overrides_lower_priority_for_same_universe() {
        let (_dir, store) = test_store();
        let mapper = Mapper::new(
            Arc::clone(&store),
            Arc::new(MetricsRegistry::new()),
            Duration::from_millis(10),
            false,
            0.0,
        )
        .unwrap();

        let low = DmxFrame::new(1, &[0; 3], 0, SourceProtocol::Sacn, 50, "sacn-0");
        assert!(mapper.accept_frame(&low));

        let high = DmxFrame::new(1, &[0; 3], 0, SourceProtocol::ArtNet, 100, "artnet-0");
        assert!(mapper.accept_frame(&high));

        let low_again = DmxFrame::new(1, &[0; 3], 1, SourceProtocol::Sacn, 50, "sacn-0");
        assert!(!mapper.accept_frame(&low_again));
    }

    #[test]
    fn sacn_priority_zero_is_always_rejected() {
        let (_dir, store) = test_store();
        let mapper = Mapper::new(
            Arc::clone(&store),
            Arc::new(MetricsRegistry::new()),
            Duration::from_millis(10),
            false,
            0.0,
        )
        .unwrap();

        let terminated = DmxFrame::new(1, &[0; 3], 0, SourceProtocol::Sacn, 0, "sacn-0");
        assert!(!mapper.accept_frame(&terminated));
    }

    #[test]
    fn stop_flushes_pending_update_synchronously() {
        let (_dir, store) = test_store();
        rgb_device(&store, "dev-1");
        store
            .create_mapping(CreateMappingInput {
                device_id: "dev-1".into(),
                universe: 1,
                channel: 1,
                length: 3,
                mapping_type: MappingType::Range,
                field: None,
                allow_overlap: false,
            })
            .unwrap();

        let mapper = Mapper::new(
            Arc::clone(&store),
            Arc::new(MetricsRegistry::new()),
            Duration::from_secs(3600),
            false,
            0.0,
        )
        .unwrap();

        mapper.schedule_update(DeviceStateUpdate {
            device_id: "dev-1".into(),
            payload: json!({"color": {"r": 1, "g": 2, "b": 3}}),
            context_id: None,
        });
        mapper.stop();

        let pending = store.next_state("dev-1").unwrap();
        assert!(pending.is_some());
    }
}
