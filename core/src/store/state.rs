//! Pending-state FIFO and dead-letter domain types (spec §3).

/// An update the Mapper handed to the Store, not yet wrapped into wire
/// commands (spec §4.B "DeviceStateUpdate").
#[derive(Debug, Clone)]
pub struct DeviceStateUpdate {
    pub device_id: String,
    pub payload: serde_json::Value,
    pub context_id: Option<String>,
}

/// A queued, protocol-wrapped command awaiting delivery (spec §3
/// "PendingState").
#[derive(Debug, Clone)]
pub struct PendingState {
    pub id: i64,
    pub device_id: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub context_id: Option<String>,
}

/// Reason a [`PendingState`] was quarantined instead of delivered
/// (spec §4.D "Failure semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    DeviceUnavailable,
    MissingIp,
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::DeviceUnavailable => "device_unavailable",
            DeadLetterReason::MissingIp => "missing_ip",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// An immutable quarantine record (spec §3 "DeadLetter").
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub state_id: Option<i64>,
    pub device_id: Option<String>,
    pub payload: Vec<u8>,
    pub payload_hash: String,
    pub context_id: Option<String>,
    pub reason: DeadLetterReason,
    pub details: Option<String>,
    pub state_created_at: Option<i64>,
    pub created_at: i64,
}
