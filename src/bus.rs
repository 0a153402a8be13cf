//! The bus: construction, publish/transact paths, and lifecycle.
//!
//! A [`Bus`] is a cheaply cloneable handle to shared state; clones share the
//! listener table, the executor, the store and the completion table. Build
//! one with [`Bus::builder`] (a schema registry is required), hand clones to
//! whoever publishes, and [`Bus::close`] it on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::completion::{CompletionTable, TxHandle, TxResult};
use crate::envelope::{CorrelationId, Envelope, EventType, Module};
use crate::error::BusError;
use crate::executor::{DispatchExecutor, DispatchMode, Task};
use crate::listener::{Handler, HandlerId, ListenerTable, Matcher, SubscribeOpts};
use crate::log::{events, BusLogger, LogLevel, LogSink};
use crate::schema::SchemaRegistry;
use crate::store::memory::MemoryTxStore;
use crate::store::sqlite::SqliteTxStore;
use crate::store::{ListenerSnapshot, StoreBackend, TxStore, TxStoreConfig};
use crate::worker::{StopSignal, TxWorker};

/// Resolved construction options with their defaults.
#[derive(Debug, Clone)]
pub(crate) struct BusConfig {
    pub mode: DispatchMode,
    pub max_depth: usize,
    pub tx_handler_timeout: Duration,
    pub handler_max_retries: i32,
    pub handler_backoff: Duration,
    pub tx_retention: Option<Duration>,
    pub tx_cleanup_interval: Option<Duration>,
    pub poll_interval: Duration,
    pub close_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Unlimited,
            max_depth: 20,
            tx_handler_timeout: Duration::from_millis(10_000),
            handler_max_retries: 3,
            handler_backoff: Duration::from_millis(1_000),
            tx_retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            tx_cleanup_interval: Some(Duration::from_secs(60 * 60)),
            poll_interval: Duration::from_millis(50),
            close_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Options for one publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOpts {
    /// The publishing module; required.
    pub module: Option<Module>,
    /// Schema version to validate against; defaults to `"1.0"`.
    pub schema_version: Option<String>,
    /// Correlation id for a root envelope; defaults to a fresh id.
    pub correlation_id: Option<CorrelationId>,
    /// Derive from this parent instead of building a root envelope.
    pub parent: Option<Envelope>,
}

impl PublishOpts {
    /// Options with the module set.
    pub fn module(module: impl Into<Module>) -> Self {
        Self {
            module: Some(module.into()),
            ..Self::default()
        }
    }

    /// Validate against a specific schema version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    /// Use a caller-chosen correlation id (root envelopes only).
    pub fn with_correlation_id(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    /// Derive the published envelope from a parent.
    pub fn with_parent(mut self, parent: &Envelope) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

/// One event in a transact batch.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// The event type tag.
    pub event_type: EventType,
    /// The payload to validate and persist.
    pub payload: Value,
    /// The publishing module.
    pub module: Module,
    /// Schema version; defaults to `"1.0"`.
    pub schema_version: Option<String>,
}

impl EventDraft {
    /// Create a draft with the default schema version.
    pub fn new(
        event_type: impl Into<EventType>,
        module: impl Into<Module>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            module: module.into(),
            schema_version: None,
        }
    }

    /// Validate against a specific schema version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }
}

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) registry: SchemaRegistry,
    pub(crate) listeners: ListenerTable,
    pub(crate) executor: DispatchExecutor,
    pub(crate) store: Option<Arc<dyn TxStore>>,
    pub(crate) completions: CompletionTable,
    pub(crate) logger: BusLogger,
    closed: AtomicBool,
    pub(crate) worker_stop: Arc<StopSignal>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // The worker only holds a weak reference, but aborting here spares
        // an un-closed bus one extra poll interval of background work.
        self.worker_stop.stop();
        if let Some(handle) = self
            .worker_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// In-process event bus with a durable transactional delivery path.
///
/// ```ignore
/// let bus = Bus::builder()
///     .schema_registry(registry)
///     .tx_store(TxStoreConfig::sqlite("events.db"))
///     .build()
///     .await?;
///
/// bus.subscribe("order/created", handler, SubscribeOpts::default())?;
///
/// // Fire-and-forget:
/// bus.publish("order/created", json!({"order_id": 7}), PublishOpts::module("orders"))?;
///
/// // Durable, with a completion handle:
/// let mut handle = bus
///     .transact(vec![EventDraft::new("order/created", "orders", json!({"order_id": 8}))])
///     .await?;
/// let result = handle.wait().await?;
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Start building a bus.
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a handler for an event type; returns its registration id.
    pub fn subscribe<H: Handler>(
        &self,
        event_type: impl Into<EventType>,
        handler: H,
        opts: SubscribeOpts,
    ) -> Result<HandlerId, BusError> {
        self.subscribe_arc(event_type, Arc::new(handler), opts)
    }

    /// Register an already-shared handler (usable later as an unsubscribe
    /// key via [`Matcher::Handler`]).
    pub fn subscribe_arc(
        &self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn Handler>,
        opts: SubscribeOpts,
    ) -> Result<HandlerId, BusError> {
        self.ensure_open()?;
        if opts.durable && self.inner.store.is_none() {
            return Err(BusError::NoTxStore);
        }
        Ok(self.inner.listeners.subscribe(event_type.into(), handler, opts))
    }

    /// Remove registrations matching the key; returns how many were removed.
    pub fn unsubscribe(
        &self,
        event_type: impl Into<EventType>,
        matcher: impl Into<Matcher>,
    ) -> Result<usize, BusError> {
        self.ensure_open()?;
        Ok(self
            .inner
            .listeners
            .unsubscribe(&event_type.into(), &matcher.into()))
    }

    /// Purge listeners for one event type, or all of them.
    pub fn clear_listeners(&self, event_type: Option<&EventType>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.inner.listeners.clear(event_type);
        Ok(())
    }

    /// Listener cardinality for one event type, or overall.
    pub fn listener_count(&self, event_type: Option<&EventType>) -> usize {
        self.inner.listeners.count(event_type)
    }

    /// Publish an event: validate, then dispatch to every listener through
    /// the executor. Returns the constructed envelope (never a handler
    /// count); handler outcomes are not reported back to the publisher.
    pub fn publish(
        &self,
        event_type: impl Into<EventType>,
        payload: Value,
        opts: PublishOpts,
    ) -> Result<Envelope, BusError> {
        self.ensure_open()?;
        let event_type = event_type.into();

        let module = match opts.module {
            Some(module) if !module.is_empty() => module,
            _ => return Err(BusError::MissingModule { event_type }),
        };

        let envelope = match &opts.parent {
            Some(parent) => parent.derive(
                event_type,
                payload,
                module,
                opts.schema_version,
                Some(self.inner.config.max_depth),
            )?,
            None => Envelope::root(
                event_type,
                payload,
                module,
                opts.correlation_id,
                opts.schema_version,
            )?,
        };

        self.validate_against_registry(&envelope, true)?;

        self.inner.logger.emit(
            LogLevel::Info,
            events::EVENT_PUBLISHED,
            json!({
                "event_type": envelope.event_type().as_str(),
                "module": envelope.module().as_str(),
                "message_id": envelope.message_id().to_string(),
                "correlation_id": envelope.correlation_id().to_string(),
            }),
        );

        for entry in self.inner.listeners.snapshot(envelope.event_type()) {
            if let Some(schema) = &entry.schema {
                if let Err(reason) = schema.validate(envelope.payload()) {
                    self.inner.logger.emit(
                        LogLevel::Warn,
                        events::SCHEMA_VALIDATION_FAILED,
                        json!({
                            "event_type": envelope.event_type().as_str(),
                            "handler_id": entry.handler_id.to_string(),
                            "reason": reason,
                        }),
                    );
                    continue;
                }
            }

            let task_bus = self.clone();
            let task_envelope = envelope.clone();
            let handler = entry.handler.clone();
            let handler_id = entry.handler_id;
            let logger = self.inner.logger.clone();
            let task: Task = Box::pin(async move {
                if let Err(error) = handler.handle(task_bus, task_envelope).await {
                    logger.emit(
                        LogLevel::Error,
                        events::HANDLER_FAILED,
                        json!({
                            "handler_id": handler_id.to_string(),
                            "error": error.to_string(),
                        }),
                    );
                }
            });

            self.inner.executor.submit(task).map_err(|err| {
                if matches!(err, BusError::BufferFull) {
                    self.inner.logger.emit(
                        LogLevel::Warn,
                        events::BUFFER_FULL,
                        json!({
                            "event_type": envelope.event_type().as_str(),
                            "handler_id": handler_id.to_string(),
                        }),
                    );
                }
                err
            })?;
        }

        Ok(envelope)
    }

    /// Atomically persist a batch of events and return a completion handle.
    ///
    /// Every event is validated before the store is touched. Handler rows
    /// are materialized against the listener table as it is right now; the
    /// background worker then drives them to terminal states and fulfills
    /// the handle exactly once.
    pub async fn transact(&self, events: Vec<EventDraft>) -> Result<TxHandle, BusError> {
        self.ensure_open()?;
        let store = self.inner.store.clone().ok_or(BusError::NoTxStore)?;
        if events.is_empty() {
            return Err(BusError::EmptyEvents);
        }

        let mut envelopes = Vec::with_capacity(events.len());
        for draft in events {
            let envelope = Envelope::root(
                draft.event_type,
                draft.payload,
                draft.module,
                None,
                draft.schema_version,
            )?;
            self.validate_against_registry(&envelope, false)?;
            envelopes.push(envelope);
        }

        let mut snapshot = ListenerSnapshot::new();
        for envelope in &envelopes {
            snapshot
                .entry(envelope.event_type().clone())
                .or_insert_with(|| {
                    self.inner
                        .listeners
                        .snapshot(envelope.event_type())
                        .iter()
                        .map(|e| e.handler_id)
                        .collect()
                });
        }

        let tx_id = Uuid::new_v4();
        let now = Utc::now();
        let data = store.build_tx_data(tx_id, now, &envelopes, &snapshot);
        let handler_count = data.handler_count();

        // Register before appending so a fast worker cannot complete the
        // transaction before anyone is listening.
        let handle = self.inner.completions.register(tx_id);
        if let Err(err) = store.append(data).await {
            self.inner.completions.abandon(tx_id);
            return Err(err);
        }

        self.inner.logger.emit(
            LogLevel::Info,
            events::TX_CREATED,
            json!({
                "tx_id": tx_id.to_string(),
                "events": envelopes.len(),
                "handler_count": handler_count,
            }),
        );
        for envelope in &envelopes {
            self.inner.logger.emit(
                LogLevel::Debug,
                events::EVENT_PERSISTED,
                json!({
                    "tx_id": tx_id.to_string(),
                    "event_type": envelope.event_type().as_str(),
                    "message_id": envelope.message_id().to_string(),
                }),
            );
        }

        // Nothing to deliver: the transaction is already done.
        if handler_count == 0 {
            self.inner
                .completions
                .complete(tx_id, TxResult::success(tx_id));
        }

        Ok(handle)
    }

    fn validate_against_registry(
        &self,
        envelope: &Envelope,
        publishing: bool,
    ) -> Result<(), BusError> {
        let schema = match self
            .inner
            .registry
            .lookup(envelope.event_type(), envelope.schema_version())
        {
            Some(schema) => schema,
            None => {
                if publishing {
                    self.inner.logger.emit(
                        LogLevel::Warn,
                        events::PUBLISH_SCHEMA_MISSING,
                        json!({
                            "event_type": envelope.event_type().as_str(),
                            "schema_version": envelope.schema_version(),
                        }),
                    );
                }
                return Err(BusError::SchemaMissing {
                    event_type: envelope.event_type().clone(),
                    schema_version: envelope.schema_version().to_string(),
                });
            }
        };
        if let Err(reason) = schema.validate(envelope.payload()) {
            if publishing {
                self.inner.logger.emit(
                    LogLevel::Warn,
                    events::PUBLISH_SCHEMA_VALIDATION_FAILED,
                    json!({
                        "event_type": envelope.event_type().as_str(),
                        "schema_version": envelope.schema_version(),
                        "reason": reason,
                    }),
                );
            }
            return Err(BusError::SchemaValidation {
                event_type: envelope.event_type().clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Close the bus: stop the worker, drain the executor, reject further
    /// operations. Idempotent; the second call is a no-op.
    ///
    /// Completion handles of still-pending transactions are never fulfilled
    /// after close.
    pub async fn close(&self, timeout: Option<Duration>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let timeout = timeout.unwrap_or(self.inner.config.close_timeout);
        self.inner
            .logger
            .emit(LogLevel::Info, events::BUS_CLOSING, json!({}));

        self.inner.worker_stop.stop();
        let handle = self
            .inner
            .worker_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                abort.abort();
            }
        }

        let drained = self.inner.executor.shutdown(timeout).await;
        if !drained {
            self.inner.logger.emit(
                LogLevel::Warn,
                events::SHUTDOWN_TIMEOUT,
                json!({ "timeout_ms": timeout.as_millis() as u64 }),
            );
        }

        self.inner
            .logger
            .emit(LogLevel::Info, events::BUS_CLOSED, json!({}));
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("closed", &self.is_closed())
            .field("listeners", &self.inner.listeners)
            .field("store", &self.inner.store.is_some())
            .field("in_flight_txs", &self.inner.completions.len())
            .finish()
    }
}

/// Builder for [`Bus`]. A schema registry is required; everything else has
/// defaults.
#[derive(Default)]
pub struct BusBuilder {
    registry: Option<SchemaRegistry>,
    config: BusConfig,
    log_sink: Option<Arc<dyn LogSink>>,
    store_config: Option<TxStoreConfig>,
    store_impl: Option<Arc<dyn TxStore>>,
}

impl BusBuilder {
    /// Set the required schema registry.
    pub fn schema_registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Choose the dispatch mode (default: unlimited).
    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Maximum causation-path depth (default 20).
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    /// Install a structured log sink.
    pub fn log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log_sink = Some(Arc::new(sink));
        self
    }

    /// Configure one of the shipped store backends.
    pub fn tx_store(mut self, config: TxStoreConfig) -> Self {
        self.store_config = Some(config);
        self
    }

    /// Use a custom store implementation.
    pub fn tx_store_impl(mut self, store: Arc<dyn TxStore>) -> Self {
        self.store_impl = Some(store);
        self
    }

    /// Per-handler deadline on the transact path (default 10 s).
    pub fn tx_handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.tx_handler_timeout = timeout;
        self
    }

    /// Retry budget for transact handlers (default 3).
    pub fn handler_max_retries(mut self, max_retries: i32) -> Self {
        self.config.handler_max_retries = max_retries;
        self
    }

    /// Delay before a retryable handler row becomes eligible again
    /// (default 1 s).
    pub fn handler_backoff(mut self, backoff: Duration) -> Self {
        self.config.handler_backoff = backoff;
        self
    }

    /// How long terminal transactions are kept (default 7 days).
    pub fn tx_retention(mut self, retention: Duration) -> Self {
        self.config.tx_retention = Some(retention);
        self
    }

    /// How often cleanup runs (default 1 hour).
    pub fn tx_cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.tx_cleanup_interval = Some(interval);
        self
    }

    /// Disable retention cleanup entirely.
    pub fn no_cleanup(mut self) -> Self {
        self.config.tx_retention = None;
        self.config.tx_cleanup_interval = None;
        self
    }

    /// Worker poll cadence (default 50 ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Default close timeout (default 10 s).
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Build the bus, opening the store and starting the worker when one is
    /// configured.
    pub async fn build(self) -> Result<Bus, BusError> {
        let registry = self.registry.ok_or(BusError::MissingSchemaRegistry)?;
        let logger = BusLogger::new(self.log_sink);

        let store: Option<Arc<dyn TxStore>> = match (self.store_impl, self.store_config) {
            (Some(store), _) => Some(store),
            (None, Some(config)) => Some(match config.backend {
                StoreBackend::Sqlite { ref path } => {
                    Arc::new(SqliteTxStore::connect(path, config.payload_format).await?)
                }
                StoreBackend::Memory => Arc::new(MemoryTxStore::new(config.payload_format)),
            }),
            (None, None) => None,
        };
        if let Some(store) = &store {
            store.init().await?;
        }

        let executor = DispatchExecutor::new(self.config.mode, logger.clone());
        let worker_stop = Arc::new(StopSignal::new());
        let has_store = store.is_some();

        let inner = Arc::new(BusInner {
            config: self.config,
            registry,
            listeners: ListenerTable::new(),
            executor,
            store,
            completions: CompletionTable::new(),
            logger,
            closed: AtomicBool::new(false),
            worker_stop: worker_stop.clone(),
            worker_handle: Mutex::new(None),
        });

        if has_store {
            let handle = TxWorker::spawn(Arc::downgrade(&inner), worker_stop);
            *inner
                .worker_handle
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(handle);
        }

        Ok(Bus { inner })
    }
}
