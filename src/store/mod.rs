//! Transactional store: the durable side of the bus.
//!
//! A [`TxStore`] persists three entity kinds:
//!
//! ```text
//! Tx 1 ──* Msg 1 ──* HandlerRow
//! ```
//!
//! One transaction owns the messages appended together; each message owns
//! one handler row per listener that was subscribed at append time. The
//! background worker drives handler rows from `pending` to a terminal state
//! and derives the transaction's status from the aggregate.
//!
//! `append` is the only multi-row write and must be atomic. Backends
//! serialize writes behind a single in-process lock.
//!
//! Two interchangeable backends ship with the crate:
//! [`sqlite::SqliteTxStore`] (embedded SQL) and
//! [`memory::MemoryTxStore`] (mutex-guarded tables).

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{CorrelationId, Envelope, EventType, Module};
use crate::error::BusError;
use crate::listener::HandlerId;

/// Terminal and in-flight states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// At least one handler row is still pending.
    Pending,
    /// Every handler row succeeded (or there were none).
    Ok,
    /// At least one handler row failed or timed out terminally.
    Failed,
}

impl TxStatus {
    /// Stable textual encoding used by SQL backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Ok => "ok",
            TxStatus::Failed => "failed",
        }
    }

    /// Parse the textual encoding.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TxStatus::Pending),
            "ok" => Some(TxStatus::Ok),
            "failed" => Some(TxStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status ends the transaction's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

/// States of a single handler row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Eligible for execution once `next_at` passes.
    Pending,
    /// Terminal success.
    Ok,
    /// Terminal failure.
    Failed,
    /// Terminal failure by deadline.
    Timeout,
}

impl HandlerStatus {
    /// Stable textual encoding used by SQL backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerStatus::Pending => "pending",
            HandlerStatus::Ok => "ok",
            HandlerStatus::Failed => "failed",
            HandlerStatus::Timeout => "timeout",
        }
    }

    /// Parse the textual encoding.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(HandlerStatus::Pending),
            "ok" => Some(HandlerStatus::Ok),
            "failed" => Some(HandlerStatus::Failed),
            "timeout" => Some(HandlerStatus::Timeout),
            _ => None,
        }
    }
}

/// How payloads cross the storage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// Serialize to JSON text on write, parse on read.
    #[default]
    Text,
    /// Keep the live JSON value where the backend allows it; SQL backends
    /// still persist text.
    Value,
}

/// A payload as held by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredPayload {
    /// Serialized JSON text.
    Text(String),
    /// Live JSON value.
    Value(Value),
}

impl StoredPayload {
    /// Encode a payload for storage under the given format.
    pub fn encode(format: PayloadFormat, payload: &Value) -> Self {
        match format {
            PayloadFormat::Text => StoredPayload::Text(payload.to_string()),
            PayloadFormat::Value => StoredPayload::Value(payload.clone()),
        }
    }

    /// Decode back to a JSON value. Identity for both formats.
    pub fn decode(&self) -> Result<Value, BusError> {
        match self {
            StoredPayload::Text(text) => serde_json::from_str(text)
                .map_err(|e| BusError::Store(anyhow::anyhow!("payload decode failed: {e}"))),
            StoredPayload::Value(value) => Ok(value.clone()),
        }
    }

    /// The serialized text form, producing it on demand for live values.
    pub fn as_text(&self) -> String {
        match self {
            StoredPayload::Text(text) => text.clone(),
            StoredPayload::Value(value) => value.to_string(),
        }
    }
}

/// Persisted transaction row.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub tx_id: Uuid,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted message row.
#[derive(Debug, Clone)]
pub struct MsgRecord {
    pub msg_id: Uuid,
    pub tx_id: Uuid,
    pub event_type: EventType,
    pub payload: StoredPayload,
    pub module: Module,
    pub schema_version: String,
    pub correlation_id: CorrelationId,
    pub message_id: Uuid,
}

/// Persisted handler row: one unit of deliverable work.
#[derive(Debug, Clone)]
pub struct HandlerRecord {
    pub row_id: Uuid,
    pub msg_id: Uuid,
    pub handler_id: HandlerId,
    pub status: HandlerStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub next_at: DateTime<Utc>,
}

/// The rows of one atomic append, plus the handler-row count the transact
/// path uses for its empty-set short-circuit.
#[derive(Debug, Clone)]
pub struct TxData {
    pub tx: TxRecord,
    pub msgs: Vec<MsgRecord>,
    pub handlers: Vec<HandlerRecord>,
}

impl TxData {
    /// Number of handler rows this append will create.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Listener ids per event type, captured once at transact time.
pub type ListenerSnapshot = HashMap<EventType, Vec<HandlerId>>;

/// A pending handler row joined with its message and transaction.
#[derive(Debug, Clone)]
pub struct PendingHandler {
    pub row_id: Uuid,
    pub msg_id: Uuid,
    pub tx_id: Uuid,
    pub event_type: EventType,
    pub payload: StoredPayload,
    pub module: Module,
    pub schema_version: String,
    pub correlation_id: CorrelationId,
    pub message_id: Uuid,
    pub handler_id: HandlerId,
    pub retry_count: i32,
}

impl PendingHandler {
    /// Reassemble the envelope this row delivers.
    pub fn envelope(&self) -> Result<Envelope, BusError> {
        Ok(Envelope::reconstruct(
            self.message_id,
            self.correlation_id,
            self.event_type.clone(),
            self.module.clone(),
            self.schema_version.clone(),
            self.payload.decode()?,
        ))
    }
}

/// State transition persisted after one handler execution attempt.
#[derive(Debug, Clone)]
pub struct HandlerUpdate {
    pub row_id: Uuid,
    pub status: HandlerStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub next_at: DateTime<Utc>,
}

/// Abstract persistent store for transactions, messages and handler rows.
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Create the schema; safe to call more than once.
    async fn init(&self) -> Result<(), BusError>;

    /// The payload format this store was configured with.
    fn payload_format(&self) -> PayloadFormat;

    /// Materialize the rows for one atomic append.
    ///
    /// One message per event; one handler row per listener registered for
    /// that event's type in the snapshot. Listeners are resolved here, once;
    /// retries later resolve handler ids against the live table, so a
    /// listener unsubscribed between attempts resolves to `handler-missing`.
    fn build_tx_data(
        &self,
        tx_id: Uuid,
        now: DateTime<Utc>,
        events: &[Envelope],
        listeners: &ListenerSnapshot,
    ) -> TxData {
        let format = self.payload_format();
        let mut msgs = Vec::with_capacity(events.len());
        let mut handlers = Vec::new();
        for envelope in events {
            let msg_id = Uuid::new_v4();
            msgs.push(MsgRecord {
                msg_id,
                tx_id,
                event_type: envelope.event_type().clone(),
                payload: StoredPayload::encode(format, envelope.payload()),
                module: envelope.module().clone(),
                schema_version: envelope.schema_version().to_string(),
                correlation_id: envelope.correlation_id(),
                message_id: envelope.message_id(),
            });
            for handler_id in listeners
                .get(envelope.event_type())
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                handlers.push(HandlerRecord {
                    row_id: Uuid::new_v4(),
                    msg_id,
                    handler_id: *handler_id,
                    status: HandlerStatus::Pending,
                    retry_count: 0,
                    last_error: None,
                    updated_at: now,
                    next_at: now,
                });
            }
        }
        TxData {
            tx: TxRecord {
                tx_id,
                status: TxStatus::Pending,
                created_at: now,
                updated_at: now,
            },
            msgs,
            handlers,
        }
    }

    /// Atomically append a transaction with its messages and handler rows.
    /// On failure the whole append rolls back.
    async fn append(&self, data: TxData) -> Result<(), BusError>;

    /// All handler rows with `status = pending` and `next_at <= now`, joined
    /// with their message, ordered by `next_at`.
    async fn pending_handlers(&self, now: DateTime<Utc>) -> Result<Vec<PendingHandler>, BusError>;

    /// Persist the state transition for one handler row.
    async fn update_handler(&self, update: HandlerUpdate) -> Result<(), BusError>;

    /// Derive a transaction's status from its handler rows: no rows or all
    /// ok is ok; any failed or timeout is failed; any pending is pending.
    async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus, BusError>;

    /// Record a transaction's terminal status.
    async fn update_tx(
        &self,
        tx_id: Uuid,
        status: TxStatus,
        now: DateTime<Utc>,
    ) -> Result<(), BusError>;

    /// Delete terminal transactions older than the retention window.
    /// Optional per backend; the default removes nothing.
    async fn cleanup(
        &self,
        _now: DateTime<Utc>,
        _retention: chrono::Duration,
    ) -> Result<u64, BusError> {
        Ok(0)
    }
}

/// Derive a tx status from handler-row statuses.
pub(crate) fn derive_tx_status<I>(statuses: I) -> TxStatus
where
    I: IntoIterator<Item = HandlerStatus>,
{
    let mut any_pending = false;
    let mut any_failed = false;
    let mut total = 0usize;
    for status in statuses {
        total += 1;
        match status {
            HandlerStatus::Pending => any_pending = true,
            HandlerStatus::Failed | HandlerStatus::Timeout => any_failed = true,
            HandlerStatus::Ok => {}
        }
    }
    if total == 0 {
        TxStatus::Ok
    } else if any_failed {
        TxStatus::Failed
    } else if any_pending {
        TxStatus::Pending
    } else {
        TxStatus::Ok
    }
}

/// Backend selection for the shipped stores.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// Embedded SQL database at the given path (`:memory:` for ephemeral).
    Sqlite {
        /// Database file path.
        path: String,
    },
    /// In-process tables; contents die with the bus.
    Memory,
}

/// Configuration for the transactional store.
#[derive(Debug, Clone)]
pub struct TxStoreConfig {
    /// Which backend to open.
    pub backend: StoreBackend,
    /// How payloads cross the storage boundary.
    pub payload_format: PayloadFormat,
}

impl TxStoreConfig {
    /// Embedded SQL store at a file path.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: StoreBackend::Sqlite { path: path.into() },
            payload_format: PayloadFormat::default(),
        }
    }

    /// In-memory store.
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            payload_format: PayloadFormat::default(),
        }
    }

    /// Override the payload format.
    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }
}
