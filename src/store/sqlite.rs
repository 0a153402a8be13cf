//! Embedded SQL store backend.
//!
//! Three tables (`bus_tx`, `bus_msg`, `bus_handler`) with cascading deletes
//! and two indexes: `(handler.status, handler.next_at)` for the worker's
//! pending poll and `(msg.tx_id)` for status derivation. Timestamps persist
//! as millisecond epochs, UUIDs as text, payloads as serialized strings.
//!
//! All statements run behind one in-process writer lock; `append` is the
//! only multi-row write and runs inside a single database transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::{CorrelationId, EventType, Module};
use crate::error::BusError;
use crate::listener::HandlerId;
use crate::store::{
    HandlerUpdate, PayloadFormat, PendingHandler, StoredPayload, TxData, TxStatus, TxStore,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bus_tx (
    tx_id      TEXT PRIMARY KEY,
    status     TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bus_msg (
    msg_id         TEXT PRIMARY KEY,
    tx_id          TEXT NOT NULL REFERENCES bus_tx(tx_id) ON DELETE CASCADE,
    event_type     TEXT NOT NULL,
    payload        TEXT NOT NULL,
    module         TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    message_id     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bus_handler (
    row_id      TEXT PRIMARY KEY,
    msg_id      TEXT NOT NULL REFERENCES bus_msg(msg_id) ON DELETE CASCADE,
    handler_id  TEXT NOT NULL,
    status      TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    last_error  TEXT,
    updated_at  INTEGER NOT NULL,
    next_at     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bus_handler_status_next_at
    ON bus_handler(status, next_at);
CREATE INDEX IF NOT EXISTS idx_bus_msg_tx_id
    ON bus_msg(tx_id);
"#;

/// Embedded SQL implementation of [`TxStore`] backed by sqlx/SQLite.
pub struct SqliteTxStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    format: PayloadFormat,
}

impl SqliteTxStore {
    /// Open (creating if missing) the database at `path`.
    ///
    /// `:memory:` opens an ephemeral database that lives as long as the
    /// store; the pool is pinned to a single connection so the database is
    /// shared and writes serialize naturally.
    pub async fn connect(path: &str, format: PayloadFormat) -> Result<Self, BusError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            format,
        })
    }

    fn parse_uuid(text: &str, column: &str) -> Result<Uuid, BusError> {
        Uuid::parse_str(text)
            .map_err(|e| BusError::Store(anyhow::anyhow!("invalid uuid in {column}: {e}")))
    }
}

#[async_trait]
impl TxStore for SqliteTxStore {
    async fn init(&self) -> Result<(), BusError> {
        let _guard = self.write_lock.lock().await;
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn payload_format(&self) -> PayloadFormat {
        self.format
    }

    async fn append(&self, data: TxData) -> Result<(), BusError> {
        let _guard = self.write_lock.lock().await;
        // Any early return drops the transaction, which rolls it back.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO bus_tx (tx_id, status, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(data.tx.tx_id.to_string())
        .bind(data.tx.status.as_str())
        .bind(data.tx.created_at.timestamp_millis())
        .bind(data.tx.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for msg in &data.msgs {
            sqlx::query(
                "INSERT INTO bus_msg \
                 (msg_id, tx_id, event_type, payload, module, schema_version, correlation_id, message_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(msg.msg_id.to_string())
            .bind(msg.tx_id.to_string())
            .bind(msg.event_type.as_str())
            .bind(msg.payload.as_text())
            .bind(msg.module.as_str())
            .bind(&msg.schema_version)
            .bind(msg.correlation_id.as_uuid().to_string())
            .bind(msg.message_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        for handler in &data.handlers {
            sqlx::query(
                "INSERT INTO bus_handler \
                 (row_id, msg_id, handler_id, status, retry_count, last_error, updated_at, next_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(handler.row_id.to_string())
            .bind(handler.msg_id.to_string())
            .bind(handler.handler_id.as_uuid().to_string())
            .bind(handler.status.as_str())
            .bind(handler.retry_count)
            .bind(&handler.last_error)
            .bind(handler.updated_at.timestamp_millis())
            .bind(handler.next_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pending_handlers(&self, now: DateTime<Utc>) -> Result<Vec<PendingHandler>, BusError> {
        let _guard = self.write_lock.lock().await;
        let rows = sqlx::query(
            "SELECT h.row_id, h.msg_id, m.tx_id, m.event_type, m.payload, m.module, \
                    m.schema_version, m.correlation_id, m.message_id, h.handler_id, h.retry_count \
             FROM bus_handler h \
             JOIN bus_msg m ON m.msg_id = h.msg_id \
             WHERE h.status = 'pending' AND h.next_at <= ? \
             ORDER BY h.next_at, h.row_id",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PendingHandler {
                    row_id: Self::parse_uuid(row.get("row_id"), "row_id")?,
                    msg_id: Self::parse_uuid(row.get("msg_id"), "msg_id")?,
                    tx_id: Self::parse_uuid(row.get("tx_id"), "tx_id")?,
                    event_type: EventType::new(row.get::<String, _>("event_type")),
                    payload: StoredPayload::Text(row.get("payload")),
                    module: Module::new(row.get::<String, _>("module")),
                    schema_version: row.get("schema_version"),
                    correlation_id: CorrelationId::from(Self::parse_uuid(
                        row.get("correlation_id"),
                        "correlation_id",
                    )?),
                    message_id: Self::parse_uuid(row.get("message_id"), "message_id")?,
                    handler_id: HandlerId::from(Self::parse_uuid(
                        row.get("handler_id"),
                        "handler_id",
                    )?),
                    retry_count: row.get("retry_count"),
                })
            })
            .collect()
    }

    async fn update_handler(&self, update: HandlerUpdate) -> Result<(), BusError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE bus_handler \
             SET status = ?, retry_count = ?, last_error = ?, updated_at = ?, next_at = ? \
             WHERE row_id = ?",
        )
        .bind(update.status.as_str())
        .bind(update.retry_count)
        .bind(&update.last_error)
        .bind(update.updated_at.timestamp_millis())
        .bind(update.next_at.timestamp_millis())
        .bind(update.row_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BusError::Store(anyhow::anyhow!(
                "handler row {} not found",
                update.row_id
            )));
        }
        Ok(())
    }

    async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus, BusError> {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN h.status IN ('failed', 'timeout') THEN 1 ELSE 0 END), 0) AS failed, \
                    COALESCE(SUM(CASE WHEN h.status = 'pending' THEN 1 ELSE 0 END), 0) AS pending \
             FROM bus_handler h \
             JOIN bus_msg m ON m.msg_id = h.msg_id \
             WHERE m.tx_id = ?",
        )
        .bind(tx_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let failed: i64 = row.get("failed");
        let pending: i64 = row.get("pending");

        Ok(if total == 0 {
            TxStatus::Ok
        } else if failed > 0 {
            TxStatus::Failed
        } else if pending > 0 {
            TxStatus::Pending
        } else {
            TxStatus::Ok
        })
    }

    async fn update_tx(
        &self,
        tx_id: Uuid,
        status: TxStatus,
        now: DateTime<Utc>,
    ) -> Result<(), BusError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE bus_tx SET status = ?, updated_at = ? WHERE tx_id = ?")
            .bind(status.as_str())
            .bind(now.timestamp_millis())
            .bind(tx_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64, BusError> {
        let _guard = self.write_lock.lock().await;
        let cutoff = (now - retention).timestamp_millis();
        let result =
            sqlx::query("DELETE FROM bus_tx WHERE status IN ('ok', 'failed') AND updated_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for SqliteTxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTxStore")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EventType, Module};
    use crate::store::{HandlerStatus, ListenerSnapshot};
    use serde_json::json;

    async fn open() -> SqliteTxStore {
        let store = SqliteTxStore::connect(":memory:", PayloadFormat::Text)
            .await
            .unwrap();
        store.init().await.unwrap();
        store
    }

    fn sample_data(store: &SqliteTxStore, listeners: usize) -> TxData {
        let event = Envelope::root(
            EventType::new("t/ev"),
            json!({"answer": 42}),
            Module::new("m"),
            None,
            None,
        )
        .unwrap();
        let mut snapshot = ListenerSnapshot::new();
        snapshot.insert(
            EventType::new("t/ev"),
            (0..listeners)
                .map(|_| HandlerId::from(Uuid::new_v4()))
                .collect(),
        );
        store.build_tx_data(
            Uuid::new_v4(),
            Utc::now(),
            std::slice::from_ref(&event),
            &snapshot,
        )
    }

    #[tokio::test]
    async fn test_init_twice_is_fine() {
        let store = open().await;
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_and_pending_round_trip() {
        let store = open().await;
        let data = sample_data(&store, 2);
        let tx_id = data.tx.tx_id;
        let expected_msg = data.msgs[0].clone();
        store.append(data).await.unwrap();

        let rows = store.pending_handlers(Utc::now()).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.tx_id, tx_id);
            assert_eq!(row.msg_id, expected_msg.msg_id);
            assert_eq!(row.message_id, expected_msg.message_id);
            assert_eq!(row.correlation_id, expected_msg.correlation_id);
            assert_eq!(row.event_type.as_str(), "t/ev");
            assert_eq!(row.payload.decode().unwrap(), json!({"answer": 42}));
        }
    }

    #[tokio::test]
    async fn test_duplicate_append_rolls_back() {
        let store = open().await;
        let data = sample_data(&store, 1);
        store.append(data.clone()).await.unwrap();

        // Second insert hits the primary key; nothing new may persist.
        let before = store.pending_handlers(Utc::now()).await.unwrap().len();
        assert!(store.append(data).await.is_err());
        let after = store.pending_handlers(Utc::now()).await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_pending_respects_next_at() {
        let store = open().await;
        let data = sample_data(&store, 1);
        let row_id = data.handlers[0].row_id;
        store.append(data).await.unwrap();

        store
            .update_handler(HandlerUpdate {
                row_id,
                status: HandlerStatus::Pending,
                retry_count: 1,
                last_error: Some("{\"error\":\"handler-returned-false\"}".into()),
                updated_at: Utc::now(),
                next_at: Utc::now() + Duration::seconds(60),
            })
            .await
            .unwrap();

        assert!(store.pending_handlers(Utc::now()).await.unwrap().is_empty());
        let rows = store
            .pending_handlers(Utc::now() + Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_update_handler_unknown_row() {
        let store = open().await;
        let err = store
            .update_handler(HandlerUpdate {
                row_id: Uuid::new_v4(),
                status: HandlerStatus::Ok,
                retry_count: 0,
                last_error: None,
                updated_at: Utc::now(),
                next_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Store(_)));
    }

    #[tokio::test]
    async fn test_tx_status_derivation() {
        let store = open().await;
        let data = sample_data(&store, 2);
        let tx_id = data.tx.tx_id;
        let rows: Vec<Uuid> = data.handlers.iter().map(|h| h.row_id).collect();
        store.append(data).await.unwrap();

        assert_eq!(store.tx_status(tx_id).await.unwrap(), TxStatus::Pending);

        let now = Utc::now();
        for row_id in &rows {
            store
                .update_handler(HandlerUpdate {
                    row_id: *row_id,
                    status: HandlerStatus::Ok,
                    retry_count: 0,
                    last_error: None,
                    updated_at: now,
                    next_at: now,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.tx_status(tx_id).await.unwrap(), TxStatus::Ok);

        // No rows at all also derives ok.
        assert_eq!(store.tx_status(Uuid::new_v4()).await.unwrap(), TxStatus::Ok);
    }

    #[tokio::test]
    async fn test_cleanup_cascades() {
        let store = open().await;
        let data = sample_data(&store, 1);
        let tx_id = data.tx.tx_id;
        let row_id = data.handlers[0].row_id;
        store.append(data).await.unwrap();

        let now = Utc::now();
        store
            .update_handler(HandlerUpdate {
                row_id,
                status: HandlerStatus::Ok,
                retry_count: 0,
                last_error: None,
                updated_at: now,
                next_at: now,
            })
            .await
            .unwrap();
        store.update_tx(tx_id, TxStatus::Ok, now).await.unwrap();

        let removed = store
            .cleanup(now + Duration::days(8), Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        // Cascade removed msg and handler rows with the tx.
        let orphans = sqlx::query("SELECT COUNT(*) AS n FROM bus_handler")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let n: i64 = orphans.get("n");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_and_pending() {
        let store = open().await;
        let data = sample_data(&store, 1);
        store.append(data).await.unwrap();

        let removed = store
            .cleanup(Utc::now() + Duration::days(30), Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
