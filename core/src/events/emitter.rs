//! Event emitter abstraction for decoupling the Store from transport.
//!
//! Components depend on the [`EventEmitter`] trait rather than a concrete
//! broadcast channel, enabling testing and alternative delivery (e.g. the
//! out-of-scope management API wiring its own subscriber).

use super::DomainEvent;

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a domain event.
    fn emit(&self, event: DomainEvent);
}

/// No-op emitter, used where event delivery has no external subscriber
/// (most unit tests).
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: DomainEvent) {}
}

/// Logging emitter — logs every event at debug level. Useful standalone for
/// development when no management-API collaborator is attached.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: DomainEvent) {
        tracing::debug!(?event, "domain_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: DomainEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit(DomainEvent::DeviceOnline {
            device_id: "dev-1".into(),
            timestamp_ms: 0,
        });
        emitter.emit(DomainEvent::DeviceOffline {
            device_id: "dev-1".into(),
            failure_count: 3,
            timestamp_ms: 0,
        });

        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }
}
