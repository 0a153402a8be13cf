//! # Tandem
//!
//! An in-process event bus with two complementary delivery modes over one
//! publish/subscribe surface:
//!
//! - [`Bus::publish`] - fire-and-forget: schema-validated events dispatched
//!   to subscribers on a concurrent executor
//! - [`Bus::transact`] - durable: an event batch persisted atomically, then
//!   delivered at-least-once with retries, backoff and timeouts, with the
//!   final result fanned out through a one-shot completion handle
//!
//! ## Architecture
//!
//! ```text
//! publish(event) ──► envelope ──► schema ──► executor ──► handlers
//!                    (causality    registry   (unlimited |
//!                     checks)                  buffered)
//!
//! transact(events) ──► validate ──► TxStore.append (atomic)
//!                                        │
//!                                        ▼
//!                         worker: poll pending handler rows
//!                                 execute under deadline
//!                                 retry / backoff / give up
//!                                        │
//!                                        ▼
//!                         TxHandle ◄── completion (exactly once)
//! ```
//!
//! ## Guarantees
//!
//! - **Publish is at-most-once**: handler failures are logged, never retried.
//! - **Transact is at-least-once**: handler rows are persisted and retried
//!   until they succeed or exhaust their budget; write handlers
//!   idempotently.
//! - **Causality is checked**: deriving an envelope that re-enters its own
//!   `(module, event type)` pair fails with a cycle error; chains are depth
//!   bounded.
//! - **Backpressure is visible**: in buffered mode a full queue rejects the
//!   publish instead of stalling it.
//!
//! There is no cross-transaction ordering and no exactly-once delivery.
//!
//! ## Example
//!
//! ```ignore
//! use serde_json::json;
//! use tandem::{
//!     accept_any, Bus, Envelope, EventDraft, PublishOpts, SchemaRegistry,
//!     SubscribeOpts, TxStoreConfig,
//! };
//!
//! let registry = SchemaRegistry::builder()
//!     .register_arc("order/created", "1.0", accept_any())
//!     .build();
//!
//! let bus = Bus::builder()
//!     .schema_registry(registry)
//!     .tx_store(TxStoreConfig::sqlite("orders.db"))
//!     .build()
//!     .await?;
//!
//! bus.subscribe(
//!     "order/created",
//!     |_bus: Bus, env: Envelope| async move {
//!         println!("order: {}", env.payload());
//!         Ok(true)
//!     },
//!     SubscribeOpts::default(),
//! )?;
//!
//! // Durable delivery with an awaitable result:
//! let mut handle = bus
//!     .transact(vec![EventDraft::new("order/created", "orders", json!({"id": 7}))])
//!     .await?;
//! assert!(handle.wait().await?.is_ok());
//!
//! bus.close(None).await;
//! ```

mod bus;
mod completion;
mod envelope;
mod error;
mod executor;
mod listener;
mod log;
mod schema;
mod worker;

pub mod store;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export the bus surface
pub use bus::{Bus, BusBuilder, EventDraft, PublishOpts};

// Re-export envelope and causality types
pub use envelope::{
    CausationPath, CausationStep, CorrelationId, Envelope, EventType, Module,
    DEFAULT_SCHEMA_VERSION,
};

// Re-export error types
pub use error::{BusError, TxError};

// Re-export dispatch types
pub use executor::DispatchMode;

// Re-export listener types
pub use listener::{Handler, HandlerId, Matcher, SubscribeOpts};

// Re-export schema types
pub use schema::{accept_any, Schema, SchemaRegistry, SchemaRegistryBuilder};

// Re-export completion types
pub use completion::{TxHandle, TxResult};

// Re-export log types
pub use log::{events, LogLevel, LogSink};

// Re-export store configuration and trait for custom backends
pub use store::{PayloadFormat, StoreBackend, TxStore, TxStoreConfig};

// Re-export commonly used external types
pub use async_trait::async_trait;
