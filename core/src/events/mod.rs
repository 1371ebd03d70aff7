//! Domain event system.
//!
//! This module provides:
//! - [`DomainEvent`] for the events the Store emits (devices, mappings)
//! - [`EventEmitter`] trait for components to emit events without knowing the
//!   transport
//!
//! The actual fan-out (management API, UI) subscribes via
//! [`BroadcastEventBridge::subscribe`].

pub mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Domain events published by the Store on an in-process bus (spec §4.C, §6).
///
/// The Mapper subscribes to the `Mapping*` variants to know when to rebuild
/// its cache; external collaborators (management API, UI) subscribe to all
/// of them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    /// A device was discovered or refreshed by a discovery collaborator.
    DeviceDiscovered {
        device_id: String,
        timestamp_ms: u64,
    },
    /// An existing device's attributes changed (manual edit, capability
    /// re-normalization, discovery refresh).
    DeviceUpdated {
        device_id: String,
        timestamp_ms: u64,
    },
    /// A device transitioned from offline back to online.
    DeviceOnline {
        device_id: String,
        timestamp_ms: u64,
    },
    /// A device's failure count reached the offline threshold.
    DeviceOffline {
        device_id: String,
        failure_count: u32,
        timestamp_ms: u64,
    },
    /// A mapping was created for a device.
    MappingCreated {
        mapping_id: i64,
        device_id: String,
        universe: u16,
        timestamp_ms: u64,
    },
    /// A mapping was updated.
    MappingUpdated {
        mapping_id: i64,
        device_id: String,
        universe: u16,
        timestamp_ms: u64,
    },
    /// A mapping was deleted.
    MappingDeleted {
        mapping_id: i64,
        device_id: String,
        universe: u16,
        timestamp_ms: u64,
    },
}

impl DomainEvent {
    /// Returns the universe a mapping event concerns, if any — used by the
    /// Mapper to decide whether a full cache rebuild is required.
    pub fn mapping_universe(&self) -> Option<u16> {
        match self {
            DomainEvent::MappingCreated { universe, .. }
            | DomainEvent::MappingUpdated { universe, .. }
            | DomainEvent::MappingDeleted { universe, .. } => Some(*universe),
            _ => None,
        }
    }

    /// Returns true if this event should trigger a Mapper cache rebuild.
    pub fn is_mapping_event(&self) -> bool {
        self.mapping_universe().is_some()
    }
}
