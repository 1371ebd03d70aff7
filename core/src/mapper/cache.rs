//! Per-universe mapping cache, rebuilt atomically on mapping mutation
//! (spec §4.B "Mapping cache", §3 "Mapper caches mappings by universe").

use std::collections::BTreeMap;

use crate::error::BridgeResult;
use crate::store::{MappingType, Store};

use super::translate::CachedMapping;

/// Snapshot of every valid mapping, grouped by universe, insertion order
/// preserved. Immutable once built; a rebuild produces a brand new instance
/// that is swapped in atomically so in-flight frames never observe a
/// half-rebuilt cache (spec §4.B).
#[derive(Debug, Default)]
pub struct MappingCache {
    by_universe: BTreeMap<u16, Vec<CachedMapping>>,
}

impl MappingCache {
    pub fn mappings_for(&self, universe: u16) -> Option<&[CachedMapping]> {
        self.by_universe.get(&universe).map(|v| v.as_slice())
    }

    pub fn universe_count(&self) -> usize {
        self.by_universe.len()
    }

    /// Loads every mapping from the Store, skipping those whose device is
    /// missing/disabled/stale, whose channel/length is invalid, or whose
    /// length is insufficient for the device's mode (spec §4.B).
    pub fn build(store: &Store) -> BridgeResult<Self> {
        let devices = store.all_devices()?;
        let by_universe_raw = store.mappings_by_universe()?;

        let mut by_universe = BTreeMap::new();
        for (universe, mappings) in by_universe_raw {
            let mut cached = Vec::new();
            for mapping in &mappings {
                let Some(device) = devices.iter().find(|d| d.id == mapping.device_id) else {
                    continue;
                };
                if !device.enabled || device.stale {
                    continue;
                }
                if mapping.channel == 0
                    || mapping.channel as u32 + mapping.length as u32 - 1 > 512
                {
                    continue;
                }
                if mapping.mapping_type == MappingType::Discrete
                    && (mapping.length != 1 || mapping.field.is_none())
                {
                    continue;
                }
                if mapping.mapping_type == MappingType::Range
                    && (mapping.length as usize) < device.capabilities.required_channels()
                {
                    continue;
                }

                let caps = &device.capabilities;
                if let Some(entry) = CachedMapping::from_mapping(
                    mapping,
                    caps.mode,
                    caps.gamma,
                    caps.dimmer,
                    caps.color_temp_range,
                ) {
                    cached.push(entry);
                }
            }
            if !cached.is_empty() {
                by_universe.insert(universe, cached);
            }
        }

        Ok(Self { by_universe })
    }
}
