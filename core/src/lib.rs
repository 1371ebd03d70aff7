//! Core library for the Govee ArtNet/sACN bridge: ingests DMX lighting
//! control frames over IP (ArtNet/ArtDMX and sACN/E1.31) and translates
//! them into per-device command payloads for LAN-controllable RGB/CCT
//! fixtures.
//!
//! # Architecture
//!
//! The crate is organized around the four cooperating components described
//! in the design (plus the supervisor that composes them):
//!
//! - [`ingest`]: ArtNet and sACN UDP listeners producing protocol-agnostic
//!   [`ingest::DmxFrame`]s.
//! - [`mapper`]: translates frames into per-device state updates through
//!   user-defined mappings, with gamma/dimmer correction, change detection,
//!   and debounce.
//! - [`store`]: the transactional, disk-backed device/mapping/queue
//!   registry — the single source of truth.
//! - [`delivery`]: per-device FIFO workers with retry/backoff, global rate
//!   limiting, and an offline/online failure state machine.
//! - [`supervisor`]: process lifecycle, health/circuit-breaker suppression,
//!   and hot configuration reload, including the optional background
//!   [`poller`] liveness subsystem.
//!
//! Supporting modules: [`capabilities`] (device capability normalization),
//! [`config`] (layered configuration), [`error`] (the error taxonomy),
//! [`events`] (the in-process domain event bus), [`health`] (backoff policy
//! and subsystem circuit breaker), and [`metrics`] (counter/gauge/histogram
//! registries).

#![warn(clippy::all)]

pub mod capabilities;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod health;
pub mod ingest;
pub mod mapper;
pub mod metrics;
pub mod poller;
pub mod store;
pub mod supervisor;

pub use config::{BridgeConfig, ManualDeviceDecl};
pub use error::{BridgeError, BridgeResult, ErrorCode};
pub use events::{BroadcastEventBridge, DomainEvent, EventEmitter};
pub use health::{BackoffPolicy, HealthMonitor, SubsystemSnapshot, SubsystemStatus};
pub use ingest::{DmxFrame, SourceProtocol};
pub use mapper::Mapper;
pub use metrics::MetricsRegistry;
pub use store::{Device, Mapping, Store};
pub use supervisor::Supervisor;
