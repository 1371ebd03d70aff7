//! Persistent registry of devices, mappings, pending-state, and dead
//! letters (spec §4.C). Single source of truth on disk; every mutation is
//! transactional and visible to subsequent readers immediately on commit.

pub mod db;
pub mod devices;
pub mod mappings;
pub mod protocol;
pub mod state;

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::capabilities::{CapabilityCache, NormalizedCapabilities};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{DomainEvent, EventEmitter};

pub use devices::{Device, DevicePatch, DiscoveryResult, PollState};
pub use mappings::{
    expand_template, CreateMappingInput, Mapping, MappingField, MappingPatch, MappingTemplate,
    MappingType,
};
pub use state::{DeadLetter, DeadLetterReason, DeviceStateUpdate, PendingState};

use crate::config::ManualDeviceDecl;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The persistent registry (spec §4.C). Internally a single writer
/// (`Mutex<Connection>`) is acceptable since SQLite serializes writes
/// anyway (spec §5); the external API is safe to call from any task.
pub struct Store {
    conn: Mutex<Connection>,
    events: Arc<dyn EventEmitter>,
    capability_cache: Mutex<CapabilityCache>,
}

impl Store {
    pub fn open(path: &Path, events: Arc<dyn EventEmitter>) -> BridgeResult<Self> {
        let conn = db::open_and_migrate(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            events,
            capability_cache: Mutex::new(CapabilityCache::new()),
        })
    }

    /// Opens an in-memory store for tests.
    #[cfg(test)]
    fn open_in_memory(events: Arc<dyn EventEmitter>) -> BridgeResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        db::migration_initial_schema_for_tests(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            events,
            capability_cache: Mutex::new(CapabilityCache::new()),
        })
    }

    fn normalize(&self, model: Option<String>, capabilities: &serde_json::Value) -> NormalizedCapabilities {
        self.capability_cache.lock().normalize(model, capabilities)
    }

    // ---- Devices -----------------------------------------------------

    /// Inserts or refreshes a device from a discovery cycle, preserving
    /// `configured`/`enabled`, clearing `stale` (spec §4.C `upsert_discovery`).
    pub fn upsert_discovery(&self, result: &DiscoveryResult) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        let existing: Option<i64> = conn
            .query_row("SELECT 1 FROM devices WHERE id = ?1", params![result.id], |_| Ok(1))
            .optional()?;

        let caps_json = serde_json::to_string(&result.capabilities)
            .map_err(|e| BridgeError::Persistence(format!("serialize capabilities: {e}")))?;

        if existing.is_some() {
            conn.execute(
                "UPDATE devices SET ip = ?2, protocol = ?3, model = COALESCE(?4, model),
                 device_type = COALESCE(?5, device_type), capabilities_json = ?6,
                 discovered = 1, stale = 0, last_seen = ?7, updated_at = ?7
                 WHERE id = ?1",
                params![
                    result.id,
                    result.ip.to_string(),
                    result.protocol,
                    result.model,
                    result.device_type,
                    caps_json,
                    now,
                ],
            )?;
            self.events.emit(DomainEvent::DeviceUpdated {
                device_id: result.id.clone(),
                timestamp_ms: now as u64,
            });
        } else {
            conn.execute(
                "INSERT INTO devices (id, protocol, ip, model, device_type, capabilities_json,
                 manual, discovered, configured, enabled, stale, offline, first_seen, last_seen,
                 created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 1, 0, 1, 0, 0, ?7, ?7, ?7, ?7)",
                params![
                    result.id,
                    result.protocol,
                    result.ip.to_string(),
                    result.model,
                    result.device_type,
                    caps_json,
                    now,
                ],
            )?;
            self.events.emit(DomainEvent::DeviceDiscovered {
                device_id: result.id.clone(),
                timestamp_ms: now as u64,
            });
        }
        Ok(())
    }

    /// Registers or refreshes a manually-declared device
    /// (spec §4.C `upsert_manual`).
    pub fn upsert_manual(&self, decl: &ManualDeviceDecl) -> BridgeResult<()> {
        if decl.id.trim().is_empty() {
            return Err(BridgeError::Validation("manual device id must not be empty".into()));
        }
        let conn = self.conn.lock();
        let now = now_ms();
        let caps_json = serde_json::to_string(&decl.capabilities)
            .map_err(|e| BridgeError::Persistence(format!("serialize capabilities: {e}")))?;

        conn.execute(
            "INSERT INTO devices (id, protocol, ip, model, description, capabilities_json,
             manual, discovered, configured, enabled, stale, offline, first_seen, last_seen,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, 0, 1, 0, 0, ?7, ?7, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET
                protocol = excluded.protocol, ip = excluded.ip,
                model = COALESCE(excluded.model, devices.model),
                description = COALESCE(excluded.description, devices.description),
                capabilities_json = excluded.capabilities_json,
                manual = 1, enabled = 1, updated_at = excluded.updated_at",
            params![decl.id, decl.protocol, decl.ip.to_string(), decl.model, decl.description, caps_json, now],
        )?;
        Ok(())
    }

    /// Partial device update with `COALESCE` semantics
    /// (spec §4.C `update_device`). No-op if the device doesn't exist.
    pub fn update_device(&self, id: &str, patch: &DevicePatch) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        let caps_json = patch
            .capabilities
            .as_ref()
            .map(|c| serde_json::to_string(c))
            .transpose()
            .map_err(|e| BridgeError::Persistence(format!("serialize capabilities: {e}")))?;

        conn.execute(
            "UPDATE devices SET
                name = COALESCE(?2, name),
                description = COALESCE(?3, description),
                model = COALESCE(?4, model),
                ip = COALESCE(?5, ip),
                enabled = COALESCE(?6, enabled),
                capabilities_json = COALESCE(?7, capabilities_json),
                updated_at = ?8
             WHERE id = ?1",
            params![
                id,
                patch.name,
                patch.description,
                patch.model,
                patch.ip.map(|ip| ip.to_string()),
                patch.enabled.map(|b| b as i64),
                caps_json,
                now,
            ],
        )?;
        if conn.changes() > 0 {
            self.events.emit(DomainEvent::DeviceUpdated {
                device_id: id.to_string(),
                timestamp_ms: now as u64,
            });
        }
        Ok(())
    }

    /// Marks devices not seen within `threshold_sec` as stale
    /// (spec §4.C `mark_stale`).
    pub fn mark_stale(&self, threshold_sec: i64) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let cutoff = now_ms() - threshold_sec * 1000;
        conn.execute(
            "UPDATE devices SET stale = 1 WHERE last_seen < ?1 AND stale = 0",
            params![cutoff],
        )?;
        Ok(())
    }

    fn row_to_device(row: &rusqlite::Row, capability_cache: &Mutex<CapabilityCache>) -> rusqlite::Result<Device> {
        let caps_json: String = row.get("capabilities_json")?;
        let caps_value: serde_json::Value =
            serde_json::from_str(&caps_json).unwrap_or(serde_json::Value::Null);
        let model: Option<String> = row.get("model")?;
        let capabilities = capability_cache.lock().normalize(model.clone(), &caps_value);

        let ip: Option<String> = row.get("ip")?;
        Ok(Device {
            id: row.get("id")?,
            protocol: row.get("protocol")?,
            ip: ip.and_then(|s| s.parse::<IpAddr>().ok()),
            name: row.get("name")?,
            description: row.get("description")?,
            model,
            device_type: row.get("device_type")?,
            capabilities,
            manual: row.get::<_, i64>("manual")? != 0,
            discovered: row.get::<_, i64>("discovered")? != 0,
            configured: row.get::<_, i64>("configured")? != 0,
            enabled: row.get::<_, i64>("enabled")? != 0,
            stale: row.get::<_, i64>("stale")? != 0,
            offline: row.get::<_, i64>("offline")? != 0,
            failure_count: row.get::<_, i64>("failure_count")? as u32,
            last_payload_hash: row.get("last_payload_hash")?,
            last_payload_at: row.get("last_payload_at")?,
            last_failure_at: row.get("last_failure_at")?,
            poll_failure_count: row.get::<_, i64>("poll_failure_count")? as u32,
            poll_last_success_at: row.get("poll_last_success_at")?,
            poll_last_failure_at: row.get("poll_last_failure_at")?,
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
        })
    }

    /// Snapshot for Delivery; `None` if the device is disabled or stale
    /// (spec §4.C `device_info`).
    pub fn device_info(&self, id: &str) -> BridgeResult<Option<Device>> {
        let conn = self.conn.lock();
        let device = conn
            .query_row("SELECT * FROM devices WHERE id = ?1", params![id], |row| {
                Self::row_to_device(row, &self.capability_cache)
            })
            .optional()?;
        Ok(device.filter(|d| d.is_deliverable()))
    }

    /// Returns a device regardless of enabled/stale status, for
    /// administrative lookups (the Mapper's cache build needs this to
    /// distinguish "disabled" from "missing").
    pub fn device_info_any(&self, id: &str) -> BridgeResult<Option<Device>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM devices WHERE id = ?1", params![id], |row| {
            Self::row_to_device(row, &self.capability_cache)
        })
        .optional()
        .map_err(BridgeError::from)
    }

    /// All devices, for the Mapper's cache-build pass.
    pub fn all_devices(&self) -> BridgeResult<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM devices")?;
        let rows = stmt
            .query_map([], |row| Self::row_to_device(row, &self.capability_cache))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Devices eligible for protocol-level liveness polling: enabled with a
    /// known IP (spec §2 row S, grounded on
    /// `devices.py::DeviceStore._poll_targets`'s `enabled = 1 AND ip IS NOT
    /// NULL` filter; unlike `device_info`, stale devices are still polled
    /// since a successful poll is what clears `stale`).
    pub fn poll_targets(&self) -> BridgeResult<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM devices WHERE enabled = 1 AND ip IS NOT NULL")?;
        let rows = stmt
            .query_map([], |row| Self::row_to_device(row, &self.capability_cache))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- Mappings ------------------------------------------------------

    fn row_to_mapping(row: &rusqlite::Row) -> rusqlite::Result<Mapping> {
        let mapping_type_str: String = row.get("mapping_type")?;
        let mapping_type = if mapping_type_str == "discrete" {
            MappingType::Discrete
        } else {
            MappingType::Range
        };
        let field_str: Option<String> = row.get("field")?;
        let field = field_str.as_deref().and_then(MappingField::parse);
        let fields_json: Option<String> = row.get("fields_json")?;
        let fields = fields_json.and_then(|j| serde_json::from_str::<Vec<String>>(&j).ok()).map(|names| {
            names.iter().filter_map(|n| MappingField::parse(n)).collect()
        });

        Ok(Mapping {
            id: row.get("id")?,
            device_id: row.get("device_id")?,
            universe: row.get::<_, i64>("universe")? as u16,
            channel: row.get::<_, i64>("channel")? as u16,
            length: row.get::<_, i64>("length")? as u16,
            mapping_type,
            field,
            fields,
            allow_overlap: row.get::<_, i64>("allow_overlap")? != 0,
        })
    }

    fn mappings_for_universe_locked(conn: &Connection, universe: u16) -> BridgeResult<Vec<Mapping>> {
        let mut stmt = conn.prepare("SELECT * FROM mappings WHERE universe = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![universe], Self::row_to_mapping)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Creates a single mapping row, validating shape, capability support,
    /// and overlap/duplicate-field rules (spec §4.C `create_mapping`).
    pub fn create_mapping(&self, input: CreateMappingInput) -> BridgeResult<i64> {
        mappings::validate_mapping_shape(&input)?;

        let conn = self.conn.lock();
        let device = conn
            .query_row("SELECT * FROM devices WHERE id = ?1", params![input.device_id], |row| {
                Self::row_to_device(row, &self.capability_cache)
            })
            .optional()?
            .ok_or_else(|| BridgeError::Validation(format!("device '{}' does not exist", input.device_id)))?;

        if let Some(field) = input.field {
            let mode_str = match field {
                MappingField::Power | MappingField::Dimmer => "brightness",
                MappingField::Ct => "ct",
                _ => "color",
            };
            if mode_str != "ct" {
                crate::capabilities::validate_mapping_mode(mode_str, &device.capabilities)?;
            } else if !device.capabilities.supports_color_temperature() {
                return Err(BridgeError::Validation(
                    "device does not support color temperature".into(),
                ));
            }
        }

        if input.mapping_type == MappingType::Range {
            mappings::validate_required_channels(input.length, &device.capabilities)?;
        }

        let existing = Self::mappings_for_universe_locked(&conn, input.universe)?;
        mappings::validate_against_existing(&input, &existing)?;

        let fields = match input.mapping_type {
            MappingType::Range => Some(mappings::derive_fields_for_range(
                &device.capabilities.channel_order,
                input.length,
            )),
            MappingType::Discrete => None,
        };
        let fields_json = fields
            .as_ref()
            .map(|fs| serde_json::to_string(&fs.iter().map(|f| f.as_str()).collect::<Vec<_>>()))
            .transpose()
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;

        let now = now_ms();
        let mapping_type_str = match input.mapping_type {
            MappingType::Range => "range",
            MappingType::Discrete => "discrete",
        };
        conn.execute(
            "INSERT INTO mappings (device_id, universe, channel, length, mapping_type, field,
             fields_json, allow_overlap, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                input.device_id,
                input.universe,
                input.channel,
                input.length,
                mapping_type_str,
                input.field.map(|f| f.as_str()),
                fields_json,
                input.allow_overlap as i64,
                now,
            ],
        )?;
        let mapping_id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE devices SET configured = 1, updated_at = ?2 WHERE id = ?1",
            params![input.device_id, now],
        )?;

        self.events.emit(DomainEvent::MappingCreated {
            mapping_id,
            device_id: input.device_id.clone(),
            universe: input.universe,
            timestamp_ms: now as u64,
        });
        Ok(mapping_id)
    }

    /// Expands and atomically inserts a mapping template
    /// (spec §4.C `create_template_mappings`); any validation failure aborts
    /// the whole transaction.
    pub fn create_template_mappings(
        &self,
        device_id: &str,
        universe: u16,
        start_channel: u16,
        template: MappingTemplate,
    ) -> BridgeResult<Vec<i64>> {
        let device = self
            .device_info_any(device_id)?
            .ok_or_else(|| BridgeError::Validation(format!("device '{device_id}' does not exist")))?;
        let inputs = expand_template(template, device_id, universe, start_channel, &device.capabilities)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(inputs.len());
        {
            let existing = Self::mappings_for_universe_locked(&tx, universe)?;
            let mut seen = existing;
            for input in &inputs {
                mappings::validate_against_existing(input, &seen)?;
                let fields = match input.mapping_type {
                    MappingType::Range => Some(mappings::derive_fields_for_range(
                        &device.capabilities.channel_order,
                        input.length,
                    )),
                    MappingType::Discrete => None,
                };
                let fields_json = fields
                    .as_ref()
                    .map(|fs| serde_json::to_string(&fs.iter().map(|f| f.as_str()).collect::<Vec<_>>()))
                    .transpose()
                    .map_err(|e| BridgeError::Persistence(e.to_string()))?;
                let now = now_ms();
                let mapping_type_str = match input.mapping_type {
                    MappingType::Range => "range",
                    MappingType::Discrete => "discrete",
                };
                tx.execute(
                    "INSERT INTO mappings (device_id, universe, channel, length, mapping_type, field,
                     fields_json, allow_overlap, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        input.device_id,
                        input.universe,
                        input.channel,
                        input.length,
                        mapping_type_str,
                        input.field.map(|f| f.as_str()),
                        fields_json,
                        input.allow_overlap as i64,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                ids.push(id);
                seen.push(Mapping {
                    id,
                    device_id: input.device_id.clone(),
                    universe: input.universe,
                    channel: input.channel,
                    length: input.length,
                    mapping_type: input.mapping_type,
                    field: input.field,
                    fields: None,
                    allow_overlap: input.allow_overlap,
                });
            }
            tx.execute(
                "UPDATE devices SET configured = 1, updated_at = ?2 WHERE id = ?1",
                params![device_id, now_ms()],
            )?;
        }
        tx.commit()?;

        let now = now_ms() as u64;
        for id in &ids {
            self.events.emit(DomainEvent::MappingCreated {
                mapping_id: *id,
                device_id: device_id.to_string(),
                universe,
                timestamp_ms: now,
            });
        }
        Ok(ids)
    }

    /// Applies a partial update to a mapping, re-validating the resulting
    /// shape against the same invariants as `create_mapping` (spec §4.C
    /// `update_mapping`).
    pub fn update_mapping(&self, id: i64, patch: &MappingPatch) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let current = conn
            .query_row("SELECT * FROM mappings WHERE id = ?1", params![id], Self::row_to_mapping)
            .optional()?
            .ok_or_else(|| BridgeError::Validation(format!("mapping '{id}' does not exist")))?;

        let candidate = patch.apply_to(&current);
        mappings::validate_mapping_shape(&candidate)?;

        let device = conn
            .query_row("SELECT * FROM devices WHERE id = ?1", params![candidate.device_id], |row| {
                Self::row_to_device(row, &self.capability_cache)
            })
            .optional()?
            .ok_or_else(|| BridgeError::Validation(format!("device '{}' does not exist", candidate.device_id)))?;

        if let Some(field) = candidate.field {
            let mode_str = match field {
                MappingField::Power | MappingField::Dimmer => "brightness",
                MappingField::Ct => "ct",
                _ => "color",
            };
            if mode_str != "ct" {
                crate::capabilities::validate_mapping_mode(mode_str, &device.capabilities)?;
            } else if !device.capabilities.supports_color_temperature() {
                return Err(BridgeError::Validation(
                    "device does not support color temperature".into(),
                ));
            }
        }

        if candidate.mapping_type == MappingType::Range {
            mappings::validate_required_channels(candidate.length, &device.capabilities)?;
        }

        let existing: Vec<Mapping> = Self::mappings_for_universe_locked(&conn, candidate.universe)?
            .into_iter()
            .filter(|m| m.id != id)
            .collect();
        mappings::validate_against_existing(&candidate, &existing)?;

        let fields = match candidate.mapping_type {
            MappingType::Range => Some(mappings::derive_fields_for_range(
                &device.capabilities.channel_order,
                candidate.length,
            )),
            MappingType::Discrete => None,
        };
        let fields_json = fields
            .as_ref()
            .map(|fs| serde_json::to_string(&fs.iter().map(|f| f.as_str()).collect::<Vec<_>>()))
            .transpose()
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;

        let now = now_ms();
        let mapping_type_str = match candidate.mapping_type {
            MappingType::Range => "range",
            MappingType::Discrete => "discrete",
        };
        conn.execute(
            "UPDATE mappings SET
                channel = ?2,
                length = ?3,
                mapping_type = ?4,
                field = ?5,
                fields_json = ?6,
                allow_overlap = ?7,
                updated_at = ?8
             WHERE id = ?1",
            params![
                id,
                candidate.channel,
                candidate.length,
                mapping_type_str,
                candidate.field.map(|f| f.as_str()),
                fields_json,
                candidate.allow_overlap as i64,
                now,
            ],
        )?;

        self.events.emit(DomainEvent::MappingUpdated {
            mapping_id: id,
            device_id: candidate.device_id,
            universe: candidate.universe,
            timestamp_ms: now as u64,
        });
        Ok(())
    }

    /// Deletes a mapping, clearing `configured` on its device if no
    /// mappings remain (spec §4.C `delete_mapping`).
    pub fn delete_mapping(&self, id: i64) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let mapping: Option<(String, u16)> = conn
            .query_row(
                "SELECT device_id, universe FROM mappings WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u16)),
            )
            .optional()?;
        let Some((device_id, universe)) = mapping else {
            return Ok(());
        };

        conn.execute("DELETE FROM mappings WHERE id = ?1", params![id])?;
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mappings WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            conn.execute(
                "UPDATE devices SET configured = 0, updated_at = ?2 WHERE id = ?1",
                params![device_id, now_ms()],
            )?;
        }

        self.events.emit(DomainEvent::MappingDeleted {
            mapping_id: id,
            device_id,
            universe,
            timestamp_ms: now_ms() as u64,
        });
        Ok(())
    }

    /// Returns every valid mapping, grouped by universe (insertion order
    /// preserved), for the Mapper's cache build (spec §4.B).
    pub fn mappings_by_universe(&self) -> BridgeResult<std::collections::BTreeMap<u16, Vec<Mapping>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM mappings ORDER BY universe ASC, id ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_mapping)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut grouped: std::collections::BTreeMap<u16, Vec<Mapping>> = Default::default();
        for mapping in rows {
            grouped.entry(mapping.universe).or_default().push(mapping);
        }
        Ok(grouped)
    }

    // ---- Pending state / delivery ---------------------------------------

    /// Resolves the device's protocol, wraps `update.payload` into one or
    /// more wire commands, and appends one `state` row per command
    /// (spec §4.C `enqueue_state`).
    pub fn enqueue_state(&self, update: DeviceStateUpdate) -> BridgeResult<()> {
        let device = self
            .device_info_any(&update.device_id)?
            .ok_or_else(|| BridgeError::PermanentTarget(format!("device '{}' does not exist", update.device_id)))?;

        let handler = protocol::handler_for(&device.protocol)?;
        let messages = handler.wrap(&update.payload)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_ms();
        for message in &messages {
            tx.execute(
                "INSERT INTO state (device_id, payload, context_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![update.device_id, message, update.context_id, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns the FIFO head for `device_id`, or `None` if empty
    /// (spec §4.C `next_state`).
    pub fn next_state(&self, device_id: &str) -> BridgeResult<Option<PendingState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, device_id, payload, context_id, created_at FROM state
             WHERE device_id = ?1 ORDER BY id ASC LIMIT 1",
            params![device_id],
            |row| {
                Ok(PendingState {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    payload: row.get(2)?,
                    context_id: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(BridgeError::from)
    }

    /// Removes a state row (spec §4.C `delete_state`), used on delivery
    /// success. Success and delete must share a transaction at the call
    /// site that also calls `record_send_success` to preserve spec §8
    /// property 4.
    pub fn delete_state(&self, state_id: i64) -> BridgeResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM state WHERE id = ?1", params![state_id])?;
        Ok(())
    }

    /// Atomically quarantines a pending state row: writes the dead-letter,
    /// deletes the state row (spec §4.C `quarantine_state`).
    pub fn quarantine_state(
        &self,
        state: &PendingState,
        reason: DeadLetterReason,
        details: Option<&str>,
    ) -> BridgeResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let hash = sha256_hex(&state.payload);
        let now = now_ms();
        tx.execute(
            "INSERT INTO dead_letters (state_id, device_id, payload, payload_hash, context_id,
             reason, details, state_created_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                state.id,
                state.device_id,
                state.payload,
                hash,
                state.context_id,
                reason.as_str(),
                details,
                state.created_at,
                now,
            ],
        )?;
        tx.execute("DELETE FROM state WHERE id = ?1", params![state.id])?;
        tx.commit()?;
        Ok(())
    }

    /// Records a successful send in the same transaction as the queue pop,
    /// resets `failure_count`, clears `offline` (spec §4.C `record_send_success`).
    pub fn record_send_success(&self, state_id: i64, device_id: &str, payload_hash: &str) -> BridgeResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_ms();
        let was_offline: i64 = tx.query_row(
            "SELECT offline FROM devices WHERE id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE devices SET failure_count = 0, offline = 0, last_payload_hash = ?2,
             last_payload_at = ?3, last_seen = ?3, updated_at = ?3 WHERE id = ?1",
            params![device_id, payload_hash, now],
        )?;
        tx.execute("DELETE FROM state WHERE id = ?1", params![state_id])?;
        tx.commit()?;

        if was_offline != 0 {
            self.events.emit(DomainEvent::DeviceOnline {
                device_id: device_id.to_string(),
                timestamp_ms: now as u64,
            });
        }
        Ok(())
    }

    /// Increments `failure_count`; transitions to `offline` once it reaches
    /// `offline_threshold` (spec §4.C `record_send_failure`, §8 property 6).
    pub fn record_send_failure(&self, device_id: &str, offline_threshold: u32) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        conn.execute(
            "UPDATE devices SET failure_count = failure_count + 1, last_failure_at = ?2, updated_at = ?2
             WHERE id = ?1",
            params![device_id, now],
        )?;
        let (failure_count, offline): (i64, i64) = conn.query_row(
            "SELECT failure_count, offline FROM devices WHERE id = ?1",
            params![device_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if failure_count as u32 >= offline_threshold && offline == 0 {
            conn.execute(
                "UPDATE devices SET offline = 1, updated_at = ?2 WHERE id = ?1",
                params![device_id, now],
            )?;
            self.events.emit(DomainEvent::DeviceOffline {
                device_id: device_id.to_string(),
                failure_count: failure_count as u32,
                timestamp_ms: now as u64,
            });
        }
        Ok(())
    }

    /// Resets `poll_failure_count`, clears `offline`/`stale`, and stores the
    /// latest `PollState` snapshot if one was extracted (spec §4.C
    /// `record_poll_success`, analogous to `record_send_success`).
    pub fn record_poll_success(&self, device_id: &str, poll_state: Option<&PollState>) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        let poll_json = poll_state
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;
        let was_offline: i64 = conn.query_row(
            "SELECT offline FROM devices WHERE id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE devices SET poll_failure_count = 0, poll_last_success_at = ?2,
             poll_state_json = COALESCE(?3, poll_state_json), poll_state_updated_at = ?2,
             offline = 0, stale = 0, last_seen = ?2, updated_at = ?2 WHERE id = ?1",
            params![device_id, now, poll_json],
        )?;

        if was_offline != 0 {
            self.events.emit(DomainEvent::DeviceOnline {
                device_id: device_id.to_string(),
                timestamp_ms: now as u64,
            });
        }
        Ok(())
    }

    /// Increments `poll_failure_count`; transitions to `offline` once it
    /// reaches `offline_threshold` (spec §4.C `record_poll_failure`,
    /// analogous to `record_send_failure`).
    pub fn record_poll_failure(&self, device_id: &str, offline_threshold: u32) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        conn.execute(
            "UPDATE devices SET poll_failure_count = poll_failure_count + 1, poll_last_failure_at = ?2,
             updated_at = ?2 WHERE id = ?1",
            params![device_id, now],
        )?;
        let (poll_failure_count, offline): (i64, i64) = conn.query_row(
            "SELECT poll_failure_count, offline FROM devices WHERE id = ?1",
            params![device_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if poll_failure_count as u32 >= offline_threshold && offline == 0 {
            conn.execute(
                "UPDATE devices SET offline = 1, updated_at = ?2 WHERE id = ?1",
                params![device_id, now],
            )?;
            self.events.emit(DomainEvent::DeviceOffline {
                device_id: device_id.to_string(),
                failure_count: poll_failure_count as u32,
                timestamp_ms: now as u64,
            });
        }
        Ok(())
    }

    /// Distinct device ids with queued state rows
    /// (spec §4.C `pending_device_ids`), consulted by the Delivery
    /// supervisor to decide which per-device workers to spawn.
    pub fn pending_device_ids(&self) -> BridgeResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT device_id FROM state")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count of devices currently `offline=1`, for the "offline device
    /// count" gauge (spec §6 "Observability").
    pub fn offline_device_count(&self) -> BridgeResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices WHERE offline = 1", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Per-device pending row counts plus the grand total, for the
    /// "queue depths per device and total" gauge (spec §6 "Observability").
    pub fn queue_depths(&self) -> BridgeResult<(std::collections::HashMap<String, u64>, u64)> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT device_id, COUNT(*) FROM state GROUP BY device_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        let total = rows.iter().map(|(_, n)| *n).sum();
        Ok((rows.into_iter().collect(), total))
    }

    pub fn dead_letters_for_device(&self, device_id: &str) -> BridgeResult<Vec<DeadLetter>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, state_id, device_id, payload, payload_hash, context_id, reason, details,
             state_created_at, created_at FROM dead_letters WHERE device_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![device_id], |row| {
                let reason_str: String = row.get(6)?;
                let reason = match reason_str.as_str() {
                    "missing_ip" => DeadLetterReason::MissingIp,
                    "retries_exhausted" => DeadLetterReason::RetriesExhausted,
                    _ => DeadLetterReason::DeviceUnavailable,
                };
                Ok(DeadLetter {
                    id: row.get(0)?,
                    state_id: row.get(1)?,
                    device_id: row.get(2)?,
                    payload: row.get(3)?,
                    payload_hash: row.get(4)?,
                    context_id: row.get(5)?,
                    reason,
                    details: row.get(7)?,
                    state_created_at: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use serde_json::json;

    fn test_store() -> Store {
        Store::open_in_memory(Arc::new(NoopEventEmitter)).unwrap()
    }

    fn discover(store: &Store, id: &str, caps: serde_json::Value) {
        store
            .upsert_discovery(&DiscoveryResult {
                id: id.to_string(),
                ip: "10.0.0.5".parse().unwrap(),
                protocol: "govee".to_string(),
                model: Some("H6008".to_string()),
                device_type: None,
                capabilities: caps,
            })
            .unwrap();
    }

    #[test]
    fn upsert_discovery_then_device_info_round_trips() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        let device = store.device_info("dev-1").unwrap().unwrap();
        assert_eq!(device.id, "dev-1");
        assert!(device.discovered);
        assert!(device.enabled);
    }

    #[test]
    fn create_mapping_sets_configured_and_delete_clears_it() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        let mapping_id = store
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
        assert!(store.device_info("dev-1").unwrap().unwrap().configured);

        store.delete_mapping(mapping_id).unwrap();
        assert!(!store.device_info("dev-1").unwrap().unwrap().configured);
    }

    #[test]
    fn update_mapping_moves_channel_and_rejects_new_overlap() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        discover(&store, "dev-2", json!({"mode": "rgb"}));
        let moved = store
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
        store
            .create_mapping(CreateMappingInput {
                device_id: "dev-2".into(),
                universe: 1,
                channel: 10,
                length: 3,
                mapping_type: MappingType::Range,
                field: None,
                allow_overlap: false,
            })
            .unwrap();

        store
            .update_mapping(
                moved,
                &MappingPatch {
                    channel: Some(20),
                    ..Default::default()
                },
            )
            .unwrap();
        let universes = store.mappings_by_universe().unwrap();
        let updated = universes[&1].iter().find(|m| m.id == moved).unwrap();
        assert_eq!(updated.channel, 20);

        let result = store.update_mapping(
            moved,
            &MappingPatch {
                channel: Some(10),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn overlapping_mapping_without_allow_overlap_is_rejected() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        discover(&store, "dev-2", json!({"mode": "rgb"}));
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

        let result = store.create_mapping(CreateMappingInput {
            device_id: "dev-2".into(),
            universe: 1,
            channel: 3,
            length: 2,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        });
        assert!(result.is_err());
    }

    #[test]
    fn range_mapping_shorter_than_required_channels_is_rejected() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));

        // rgb requires 3 channels (r, g, b); length 2 is too short.
        let result = store.create_mapping(CreateMappingInput {
            device_id: "dev-1".into(),
            universe: 1,
            channel: 1,
            length: 2,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        });
        assert!(result.is_err());

        let mapping_id = store
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

        let result = store.update_mapping(
            mapping_id,
            &MappingPatch {
                length: Some(2),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn enqueue_state_wraps_govee_payload_and_next_state_returns_fifo_head() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"color": {"r": 1, "g": 2, "b": 3}}),
                context_id: Some("ctx-1".into()),
            })
            .unwrap();

        let head = store.next_state("dev-1").unwrap().unwrap();
        assert_eq!(head.device_id, "dev-1");
        assert_eq!(head.context_id.as_deref(), Some("ctx-1"));

        store.delete_state(head.id).unwrap();
        assert!(store.next_state("dev-1").unwrap().is_none());
    }

    #[test]
    fn offline_transition_fires_at_threshold() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        store.record_send_failure("dev-1", 3).unwrap();
        store.record_send_failure("dev-1", 3).unwrap();
        assert!(!store.device_info_any("dev-1").unwrap().unwrap().offline);
        store.record_send_failure("dev-1", 3).unwrap();
        assert!(store.device_info_any("dev-1").unwrap().unwrap().offline);
    }

    #[test]
    fn poll_failure_transitions_offline_at_threshold_and_success_clears_it() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        store.record_poll_failure("dev-1", 3).unwrap();
        store.record_poll_failure("dev-1", 3).unwrap();
        assert!(!store.device_info_any("dev-1").unwrap().unwrap().offline);
        store.record_poll_failure("dev-1", 3).unwrap();
        assert!(store.device_info_any("dev-1").unwrap().unwrap().offline);

        store.record_poll_success("dev-1", None).unwrap();
        let device = store.device_info_any("dev-1").unwrap().unwrap();
        assert!(!device.offline);
        assert_eq!(device.poll_failure_count, 0);
    }

    #[test]
    fn poll_targets_excludes_disabled_and_ipless_devices() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        store
            .update_device("dev-1", &DevicePatch { enabled: Some(false), ..Default::default() })
            .unwrap();
        store
            .upsert_manual(&crate::config::ManualDeviceDecl {
                id: "dev-2".into(),
                ip: "10.0.0.6".parse().unwrap(),
                protocol: "govee".into(),
                model: None,
                description: None,
                capabilities: json!({"mode": "rgb"}),
            })
            .unwrap();

        let targets = store.poll_targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "dev-2");
    }

    #[test]
    fn quarantine_removes_state_row_and_writes_dead_letter() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"brightness": 10}),
                context_id: None,
            })
            .unwrap();
        let head = store.next_state("dev-1").unwrap().unwrap();
        store
            .quarantine_state(&head, DeadLetterReason::MissingIp, Some("no ip on file"))
            .unwrap();

        assert!(store.next_state("dev-1").unwrap().is_none());
        let letters = store.dead_letters_for_device("dev-1").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::MissingIp);
    }

    #[test]
    fn rgb_template_creates_single_mapping_row() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        let ids = store
            .create_template_mappings("dev-1", 1, 1, MappingTemplate::Rgb)
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn queue_depths_and_offline_count_reflect_store_state() {
        let store = test_store();
        discover(&store, "dev-1", json!({"mode": "rgb"}));
        discover(&store, "dev-2", json!({"mode": "rgb"}));
        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"turn": "on"}),
                context_id: None,
            })
            .unwrap();
        store
            .enqueue_state(DeviceStateUpdate {
                device_id: "dev-1".into(),
                payload: json!({"brightness": 50}),
                context_id: None,
            })
            .unwrap();

        let (per_device, total) = store.queue_depths().unwrap();
        assert_eq!(per_device.get("dev-1").copied(), Some(2));
        assert_eq!(per_device.get("dev-2"), None);
        assert_eq!(total, 2);

        assert_eq!(store.offline_device_count().unwrap(), 0);
        store.record_send_failure("dev-2", 1).unwrap();
        assert_eq!(store.offline_device_count().unwrap(), 1);
    }
}
