//! In-memory store backend.
//!
//! Tables live behind one mutex, which doubles as the single writer lock.
//! Contents die with the bus; useful for tests and for callers that want
//! transact semantics (retries, completion handles) without a database file.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::BusError;
use crate::store::{
    derive_tx_status, HandlerRecord, HandlerUpdate, MsgRecord, PayloadFormat, PendingHandler,
    TxData, TxRecord, TxStatus, TxStore,
};

#[derive(Default)]
struct Tables {
    txs: HashMap<Uuid, TxRecord>,
    msgs: HashMap<Uuid, MsgRecord>,
    handlers: HashMap<Uuid, HandlerRecord>,
}

/// Mutex-guarded in-process implementation of [`TxStore`].
pub struct MemoryTxStore {
    format: PayloadFormat,
    tables: Mutex<Tables>,
}

impl MemoryTxStore {
    /// Create an empty store.
    pub fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, BusError> {
        self.tables
            .lock()
            .map_err(|e| BusError::Store(anyhow::anyhow!("store mutex poisoned: {e}")))
    }
}

#[async_trait]
impl TxStore for MemoryTxStore {
    async fn init(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn payload_format(&self) -> PayloadFormat {
        self.format
    }

    async fn append(&self, data: TxData) -> Result<(), BusError> {
        let mut tables = self.lock()?;
        if tables.txs.contains_key(&data.tx.tx_id) {
            return Err(BusError::Store(anyhow::anyhow!(
                "transaction {} already exists",
                data.tx.tx_id
            )));
        }
        tables.txs.insert(data.tx.tx_id, data.tx);
        for msg in data.msgs {
            tables.msgs.insert(msg.msg_id, msg);
        }
        for handler in data.handlers {
            tables.handlers.insert(handler.row_id, handler);
        }
        Ok(())
    }

    async fn pending_handlers(&self, now: DateTime<Utc>) -> Result<Vec<PendingHandler>, BusError> {
        let tables = self.lock()?;
        let mut rows: Vec<PendingHandler> = tables
            .handlers
            .values()
            .filter(|h| h.status == super::HandlerStatus::Pending && h.next_at <= now)
            .filter_map(|h| {
                let msg = tables.msgs.get(&h.msg_id)?;
                Some(PendingHandler {
                    row_id: h.row_id,
                    msg_id: msg.msg_id,
                    tx_id: msg.tx_id,
                    event_type: msg.event_type.clone(),
                    payload: msg.payload.clone(),
                    module: msg.module.clone(),
                    schema_version: msg.schema_version.clone(),
                    correlation_id: msg.correlation_id,
                    message_id: msg.message_id,
                    handler_id: h.handler_id,
                    retry_count: h.retry_count,
                })
            })
            .collect();
        // Stable eligibility order; ties broken by row id for determinism.
        rows.sort_by(|a, b| {
            let next_a = tables.handlers[&a.row_id].next_at;
            let next_b = tables.handlers[&b.row_id].next_at;
            next_a.cmp(&next_b).then(a.row_id.cmp(&b.row_id))
        });
        Ok(rows)
    }

    async fn update_handler(&self, update: HandlerUpdate) -> Result<(), BusError> {
        let mut tables = self.lock()?;
        let row = tables.handlers.get_mut(&update.row_id).ok_or_else(|| {
            BusError::Store(anyhow::anyhow!("handler row {} not found", update.row_id))
        })?;
        row.status = update.status;
        row.retry_count = update.retry_count;
        row.last_error = update.last_error;
        row.updated_at = update.updated_at;
        row.next_at = update.next_at;
        Ok(())
    }

    async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus, BusError> {
        let tables = self.lock()?;
        let msg_ids: Vec<Uuid> = tables
            .msgs
            .values()
            .filter(|m| m.tx_id == tx_id)
            .map(|m| m.msg_id)
            .collect();
        let statuses = tables
            .handlers
            .values()
            .filter(|h| msg_ids.contains(&h.msg_id))
            .map(|h| h.status);
        Ok(derive_tx_status(statuses))
    }

    async fn update_tx(
        &self,
        tx_id: Uuid,
        status: TxStatus,
        now: DateTime<Utc>,
    ) -> Result<(), BusError> {
        let mut tables = self.lock()?;
        let tx = tables
            .txs
            .get_mut(&tx_id)
            .ok_or_else(|| BusError::Store(anyhow::anyhow!("transaction {tx_id} not found")))?;
        tx.status = status;
        tx.updated_at = now;
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64, BusError> {
        let cutoff = now - retention;
        let mut tables = self.lock()?;
        let stale: Vec<Uuid> = tables
            .txs
            .values()
            .filter(|tx| tx.status.is_terminal() && tx.updated_at < cutoff)
            .map(|tx| tx.tx_id)
            .collect();
        for tx_id in &stale {
            tables.txs.remove(tx_id);
            let msg_ids: Vec<Uuid> = tables
                .msgs
                .values()
                .filter(|m| m.tx_id == *tx_id)
                .map(|m| m.msg_id)
                .collect();
            for msg_id in msg_ids {
                tables.msgs.remove(&msg_id);
                tables.handlers.retain(|_, h| h.msg_id != msg_id);
            }
        }
        Ok(stale.len() as u64)
    }
}

impl std::fmt::Debug for MemoryTxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTxStore")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
