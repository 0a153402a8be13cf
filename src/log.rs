//! Structured log events and the pluggable log sink.
//!
//! The bus reports its lifecycle through tagged, structured events (see
//! [`events`] for the full taxonomy). Every event is mirrored to `tracing`;
//! an application can additionally install a [`LogSink`] to receive the raw
//! `(level, event, fields)` triple.
//!
//! Sinks are treated as external and unsafe: every call is wrapped so a
//! panicking sink can never disturb the dispatch hot path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;

/// Severity attached to a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Verbose per-message detail.
    Debug,
    /// Normal lifecycle events.
    Info,
    /// Recoverable problems (retries, skipped handlers).
    Warn,
    /// Terminal failures.
    Error,
}

/// Receives structured log events from the bus.
///
/// Implementations may do anything (format, forward, count); the bus
/// swallows panics raised here.
pub trait LogSink: Send + Sync {
    /// Receive one event. `fields` always carries contextual data; the
    /// `event` tag is one of the constants in [`events`].
    fn log(&self, level: LogLevel, event: &str, fields: &Value);
}

impl<F> LogSink for F
where
    F: Fn(LogLevel, &str, &Value) + Send + Sync,
{
    fn log(&self, level: LogLevel, event: &str, fields: &Value) {
        self(level, event, fields)
    }
}

/// Event tags emitted by the bus.
pub mod events {
    /// An envelope passed validation and was handed to the executor.
    pub const EVENT_PUBLISHED: &str = "event-published";
    /// A transacted event batch was appended to the store.
    pub const EVENT_PERSISTED: &str = "event-persisted";
    /// A stored handler row executed successfully.
    pub const EVENT_DISPATCHED: &str = "event-dispatched";
    /// A stored handler row failed and will be retried.
    pub const EVENT_DISPATCH_FAILED: &str = "event-dispatch-failed";
    /// A stored handler row reached a terminal failure.
    pub const EVENT_DISPATCH_GIVE_UP: &str = "event-dispatch-give-up";
    /// Publish found no schema for the event type and version.
    pub const PUBLISH_SCHEMA_MISSING: &str = "publish-schema-missing";
    /// Publish payload failed the registry schema.
    pub const PUBLISH_SCHEMA_VALIDATION_FAILED: &str = "publish-schema-validation-failed";
    /// A payload failed a subscriber-level schema; that handler was skipped.
    pub const SCHEMA_VALIDATION_FAILED: &str = "schema-validation-failed";
    /// A fire-and-forget handler raised or panicked.
    pub const HANDLER_FAILED: &str = "handler-failed";
    /// A transaction was created.
    pub const TX_CREATED: &str = "tx-created";
    /// The background worker loop hit a store error and continued.
    pub const TX_WORKER_FAILED: &str = "tx-worker-failed";
    /// Retention cleanup removed terminal transactions.
    pub const TX_CLEANUP: &str = "tx-cleanup";
    /// Retention cleanup failed; it will be retried next interval.
    pub const TX_CLEANUP_FAILED: &str = "tx-cleanup-failed";
    /// Buffered submission was rejected; backpressure signal.
    pub const BUFFER_FULL: &str = "buffer-full";
    /// The bus began shutting down.
    pub const BUS_CLOSING: &str = "bus-closing";
    /// The bus finished shutting down.
    pub const BUS_CLOSED: &str = "bus-closed";
    /// Graceful shutdown gave up waiting on in-flight work.
    pub const SHUTDOWN_TIMEOUT: &str = "shutdown-timeout";
}

/// Internal fan-out point: mirrors every event to `tracing` and forwards to
/// the optional sink with panic isolation.
#[derive(Clone, Default)]
pub(crate) struct BusLogger {
    sink: Option<Arc<dyn LogSink>>,
}

impl BusLogger {
    pub(crate) fn new(sink: Option<Arc<dyn LogSink>>) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&self, level: LogLevel, event: &'static str, fields: Value) {
        match level {
            LogLevel::Debug => tracing::debug!(event, %fields),
            LogLevel::Info => tracing::info!(event, %fields),
            LogLevel::Warn => tracing::warn!(event, %fields),
            LogLevel::Error => tracing::error!(event, %fields),
        }
        if let Some(sink) = &self.sink {
            // A sink panic must never reach the caller.
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
                sink.log(level, event, &fields);
            }));
        }
    }
}

impl std::fmt::Debug for BusLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusLogger")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
