//! Structured error types for tandem.
//!
//! `BusError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handlers remain free to return `anyhow::Error`
//! internally; those errors are recorded on handler rows and collapsed to
//! [`TxError::HandlerFailed`] before they reach a transact caller.
//!
//! # The Error Boundary Rule
//!
//! > **No raw handler error ever crosses the completion handle.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers)
//! - `TxError::HandlerFailed` is the only terminal error a [`TxResult`]
//!   carries (terminal handler-row states are collapsed to this single tag)
//!
//! [`TxResult`]: crate::completion::TxResult

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{EventType, Module};

/// Structured error type for bus operations.
///
/// Each variant includes context about what went wrong, so callers can
/// pattern match rather than string-match.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been closed; no further operations are accepted.
    #[error("event bus is closed")]
    Closed,

    /// Bus construction was attempted without a schema registry.
    #[error("bus construction requires a schema registry")]
    MissingSchemaRegistry,

    /// An event was published or transacted without a module tag.
    #[error("event {event_type} has no module")]
    MissingModule {
        /// The event type that was missing its module.
        event_type: EventType,
    },

    /// No validator is registered for this event type and schema version.
    #[error("no schema registered for {event_type} version {schema_version}")]
    SchemaMissing {
        /// The event type that was looked up.
        event_type: EventType,
        /// The schema version that was looked up.
        schema_version: String,
    },

    /// The payload failed validation against the registered schema.
    #[error("payload for {event_type} failed schema validation: {reason}")]
    SchemaValidation {
        /// The event type whose schema rejected the payload.
        event_type: EventType,
        /// The validator's rejection reason.
        reason: String,
    },

    /// Deriving an envelope would re-enter a `(module, event type)` pair
    /// already present on the causation path.
    #[error("causation cycle detected at ({module}, {event_type})")]
    CycleDetected {
        /// The module of the derived envelope.
        module: Module,
        /// The event type of the derived envelope.
        event_type: EventType,
    },

    /// The causation path grew past the configured maximum depth.
    #[error("causation path depth {depth} exceeds maximum {max_depth}")]
    MaxDepthExceeded {
        /// The depth the derivation would have produced.
        depth: usize,
        /// The configured bound.
        max_depth: usize,
    },

    /// The buffered dispatch queue is full; the publisher must back off.
    #[error("dispatch buffer is full")]
    BufferFull,

    /// A transact operation was attempted without a configured store.
    #[error("no transactional store configured")]
    NoTxStore,

    /// `transact` was called with an empty event batch.
    #[error("transact requires at least one event")]
    EmptyEvents,

    /// The transactional store failed.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// Waiting on a completion handle gave up after the given duration.
    #[error("timed out after {duration:?} waiting for transaction result")]
    WaitTimeout {
        /// How long we waited.
        duration: Duration,
    },
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        BusError::Store(anyhow::Error::new(err))
    }
}

/// Terminal error tag delivered through a completion handle.
///
/// Handler rows record the precise failure (`handler-exception`,
/// `handler-timeout`, `handler-returned-false`, `handler-missing`); the
/// result a caller observes collapses all of them into this single tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// At least one handler row reached a terminal failed or timeout state.
    #[error("handler failed")]
    HandlerFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_display() {
        assert!(BusError::Closed.to_string().contains("closed"));
    }

    #[test]
    fn test_schema_missing_display() {
        let err = BusError::SchemaMissing {
            event_type: EventType::new("order/created"),
            schema_version: "1.0".into(),
        };
        assert!(err.to_string().contains("order/created"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_cycle_detected_display() {
        let err = BusError::CycleDetected {
            module: Module::new("billing"),
            event_type: EventType::new("invoice/paid"),
        };
        assert!(err.to_string().contains("billing"));
        assert!(err.to_string().contains("invoice/paid"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = BusError::MaxDepthExceeded {
            depth: 21,
            max_depth: 20,
        };
        match err {
            BusError::MaxDepthExceeded { depth, max_depth } => {
                assert_eq!(depth, 21);
                assert_eq!(max_depth, 20);
            }
            _ => panic!("expected MaxDepthExceeded"),
        }
    }

    #[test]
    fn test_store_error_preserves_source() {
        let err = BusError::Store(anyhow::anyhow!("disk full"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_tx_error_display() {
        assert_eq!(TxError::HandlerFailed.to_string(), "handler failed");
    }
}
