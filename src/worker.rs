//! Background worker: drives persisted handler rows to terminal states.
//!
//! One worker runs per bus with a store. Each tick it queries pending rows,
//! executes the corresponding handlers under a deadline, persists the
//! planned state transition, and completes the transaction's handle once the
//! aggregate status turns terminal. Loop-level store failures are logged and
//! the loop continues.
//!
//! The state machine per handler row:
//!
//! ```text
//! pending ──ok──────────────────────► ok (terminal)
//! pending ──retryable, not exhausted─► pending (next_at advanced)
//! pending ──retryable, exhausted─────► failed | timeout (terminal)
//! pending ──non-retryable failure────► failed (terminal)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{Bus, BusConfig, BusInner};
use crate::completion::TxResult;
use crate::log::{events, LogLevel};
use crate::store::{HandlerStatus, HandlerUpdate, PendingHandler, TxStatus, TxStore};

/// Stop flag plus wakeup for the worker's bounded sleep.
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Outcome of one handler execution attempt, before retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowOutcome {
    pub status: HandlerStatus,
    pub retryable: bool,
    pub error: Option<RowError>,
}

impl RowOutcome {
    fn ok() -> Self {
        Self {
            status: HandlerStatus::Ok,
            retryable: false,
            error: None,
        }
    }

    fn terminal(kind: &'static str, detail: Option<String>) -> Self {
        Self {
            status: HandlerStatus::Failed,
            retryable: false,
            error: Some(RowError { kind, detail }),
        }
    }

    fn retryable(status: HandlerStatus, kind: &'static str, detail: Option<String>) -> Self {
        Self {
            status,
            retryable: true,
            error: Some(RowError { kind, detail }),
        }
    }
}

/// What went wrong, as persisted in the row's `last_error` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowError {
    pub kind: &'static str,
    pub detail: Option<String>,
}

impl RowError {
    fn serialize(&self) -> String {
        json!({ "error": self.kind, "detail": self.detail }).to_string()
    }
}

/// Compute the persisted state transition for one execution attempt.
///
/// With `max_retries` N, a handler that keeps failing retryably runs exactly
/// N times: attempts at retry counts 0..N-1, the last of which exhausts the
/// budget and lands on the outcome's own terminal status.
pub(crate) fn plan_update(
    row: &PendingHandler,
    outcome: &RowOutcome,
    config: &BusConfig,
    now: DateTime<Utc>,
) -> HandlerUpdate {
    let next_retry = row.retry_count + 1;
    let exhausted = outcome.retryable && next_retry >= config.handler_max_retries;

    let status = if outcome.status == HandlerStatus::Ok {
        HandlerStatus::Ok
    } else if exhausted || !outcome.retryable {
        outcome.status
    } else {
        HandlerStatus::Pending
    };

    let retry_count = if outcome.status == HandlerStatus::Ok {
        row.retry_count
    } else {
        next_retry
    };

    let next_at = if outcome.retryable && !exhausted {
        now + chrono::Duration::milliseconds(config.handler_backoff.as_millis() as i64)
    } else {
        now
    };

    HandlerUpdate {
        row_id: row.row_id,
        status,
        retry_count,
        last_error: outcome.error.as_ref().map(RowError::serialize),
        updated_at: now,
        next_at,
    }
}

/// The polling worker. Holds the bus weakly so an abandoned bus lets the
/// loop exit on its own.
pub(crate) struct TxWorker {
    inner: Weak<BusInner>,
    stop: Arc<StopSignal>,
    last_cleanup: Instant,
}

impl TxWorker {
    pub fn spawn(inner: Weak<BusInner>, stop: Arc<StopSignal>) -> JoinHandle<()> {
        let worker = Self {
            inner,
            stop,
            last_cleanup: Instant::now(),
        };
        tokio::spawn(worker.run())
    }

    async fn run(mut self) {
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let Some(inner) = self.inner.upgrade() else {
                break;
            };
            let poll_interval = inner.config.poll_interval;
            self.tick(&inner).await;
            // Release the strong reference before sleeping so dropping the
            // last bus handle is enough to end the loop.
            drop(inner);

            tokio::select! {
                _ = self.stop.wait() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn tick(&mut self, inner: &Arc<BusInner>) {
        let Some(store) = inner.store.clone() else {
            return;
        };

        match store.pending_handlers(Utc::now()).await {
            Ok(rows) => {
                for row in rows {
                    if self.stop.is_stopped() {
                        return;
                    }
                    process_row(inner, store.as_ref(), row).await;
                }
            }
            Err(error) => {
                inner.logger.emit(
                    LogLevel::Error,
                    events::TX_WORKER_FAILED,
                    json!({ "stage": "query-pending", "error": error.to_string() }),
                );
            }
        }

        self.maybe_cleanup(inner, store.as_ref()).await;
    }

    async fn maybe_cleanup(&mut self, inner: &Arc<BusInner>, store: &dyn TxStore) {
        let (Some(retention), Some(interval)) = (
            inner.config.tx_retention,
            inner.config.tx_cleanup_interval,
        ) else {
            return;
        };
        if self.last_cleanup.elapsed() < interval {
            return;
        }
        self.last_cleanup = Instant::now();

        let retention = chrono::Duration::milliseconds(retention.as_millis() as i64);
        match store.cleanup(Utc::now(), retention).await {
            Ok(removed) => {
                inner.logger.emit(
                    LogLevel::Debug,
                    events::TX_CLEANUP,
                    json!({ "removed": removed }),
                );
            }
            Err(error) => {
                inner.logger.emit(
                    LogLevel::Warn,
                    events::TX_CLEANUP_FAILED,
                    json!({ "error": error.to_string() }),
                );
            }
        }
    }
}

/// Execute one pending row, persist the transition, and complete the
/// transaction if it turned terminal.
async fn process_row(inner: &Arc<BusInner>, store: &dyn TxStore, row: PendingHandler) {
    let outcome = execute_row(inner, &row).await;
    let now = Utc::now();
    let update = plan_update(&row, &outcome, &inner.config, now);

    let fields = json!({
        "tx_id": row.tx_id.to_string(),
        "event_type": row.event_type.as_str(),
        "handler_id": row.handler_id.to_string(),
        "retry_count": update.retry_count,
        "error": outcome.error.as_ref().map(|e| e.kind),
    });
    match update.status {
        HandlerStatus::Ok => {
            inner
                .logger
                .emit(LogLevel::Debug, events::EVENT_DISPATCHED, fields);
        }
        HandlerStatus::Pending => {
            inner
                .logger
                .emit(LogLevel::Warn, events::EVENT_DISPATCH_FAILED, fields);
        }
        HandlerStatus::Failed | HandlerStatus::Timeout => {
            inner
                .logger
                .emit(LogLevel::Error, events::EVENT_DISPATCH_GIVE_UP, fields);
        }
    }

    if let Err(error) = store.update_handler(update).await {
        inner.logger.emit(
            LogLevel::Error,
            events::TX_WORKER_FAILED,
            json!({ "stage": "update-handler", "error": error.to_string() }),
        );
        return;
    }

    finish_if_terminal(inner, store, row.tx_id).await;
}

async fn finish_if_terminal(inner: &Arc<BusInner>, store: &dyn TxStore, tx_id: Uuid) {
    match store.tx_status(tx_id).await {
        Ok(status) if status.is_terminal() => {
            if let Err(error) = store.update_tx(tx_id, status, Utc::now()).await {
                inner.logger.emit(
                    LogLevel::Error,
                    events::TX_WORKER_FAILED,
                    json!({ "stage": "update-tx", "error": error.to_string() }),
                );
            }
            let result = if status == TxStatus::Ok {
                TxResult::success(tx_id)
            } else {
                TxResult::failure(tx_id)
            };
            inner.completions.complete(tx_id, result);
        }
        Ok(_) => {}
        Err(error) => {
            inner.logger.emit(
                LogLevel::Error,
                events::TX_WORKER_FAILED,
                json!({ "stage": "tx-status", "error": error.to_string() }),
            );
        }
    }
}

/// Run the handler for one row and classify the outcome.
async fn execute_row(inner: &Arc<BusInner>, row: &PendingHandler) -> RowOutcome {
    let envelope = match row.envelope() {
        Ok(envelope) => envelope,
        Err(error) => {
            return RowOutcome::terminal("payload-decode-failed", Some(error.to_string()))
        }
    };

    // Resolved against the live table: a listener unsubscribed between
    // attempts terminates the row here.
    let Some(entry) = inner.listeners.find(&row.event_type, row.handler_id) else {
        return RowOutcome::terminal("handler-missing", None);
    };

    if let Some(schema) = &entry.schema {
        if let Err(reason) = schema.validate(envelope.payload()) {
            inner.logger.emit(
                LogLevel::Warn,
                events::SCHEMA_VALIDATION_FAILED,
                json!({
                    "event_type": row.event_type.as_str(),
                    "handler_id": row.handler_id.to_string(),
                    "reason": reason,
                }),
            );
            return RowOutcome::terminal("schema-validation-failed", Some(reason));
        }
    }

    let bus = Bus::from_inner(inner.clone());
    let invocation = AssertUnwindSafe(entry.handler.handle(bus, envelope)).catch_unwind();
    match tokio::time::timeout(inner.config.tx_handler_timeout, invocation).await {
        // Deadline wins over whatever the handler later produces.
        Err(_elapsed) => RowOutcome::retryable(HandlerStatus::Timeout, "handler-timeout", None),
        Ok(Err(panic)) => RowOutcome::retryable(
            HandlerStatus::Failed,
            "handler-exception",
            Some(panic_message(&panic)),
        ),
        Ok(Ok(Err(error))) => RowOutcome::retryable(
            HandlerStatus::Failed,
            "handler-exception",
            Some(error.to_string()),
        ),
        Ok(Ok(Ok(true))) => RowOutcome::ok(),
        Ok(Ok(Ok(false))) => {
            RowOutcome::retryable(HandlerStatus::Failed, "handler-returned-false", None)
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
