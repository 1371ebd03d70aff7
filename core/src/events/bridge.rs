//! Bridge implementation that maps domain events to broadcast transport.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between the Store and
//! any external subscriber (the out-of-scope management API, the in-process
//! Mapper cache invalidation hook), forwarding events onto a
//! `tokio::sync::broadcast` channel.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::DomainEvent;

/// Bridges domain events to a broadcast channel.
///
/// Isolates subscriber failures from publishers: a full or dropped receiver
/// only produces a trace-level log, never a publish error (spec §6, "the bus
/// isolates subscriber failures so a misbehaving subscriber cannot stall
/// publishers").
///
/// # Thread Safety
///
/// `Send + Sync`, cheaply `Clone`able; the external emitter slot uses a
/// `RwLock` so it can be attached after construction (the management API
/// collaborator is wired in after the Store starts).
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<DomainEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates a new bridge wrapping an existing broadcast sender.
    pub fn with_sender(tx: broadcast::Sender<DomainEvent>) -> Self {
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Attaches an external emitter (e.g. a management-API websocket
    /// forwarder) in addition to the broadcast channel.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver. The Mapper subscribes on start to know when to
    /// rebuild its per-universe mapping cache.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Returns a reference to the broadcast sender.
    pub fn sender(&self) -> &broadcast::Sender<DomainEvent> {
        &self.tx
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit(&self, event: DomainEvent) {
        if let Some(ref emitter) = *self.external_emitter.read() {
            emitter.emit(event.clone());
        }
        if let Err(e) = self.tx.send(event) {
            log::trace!("[EventBridge] no broadcast receivers: {}", e);
        }
    }
}
