//! Schema registry: `event type → schema version → validator`.
//!
//! The registry is supplied at bus construction and consulted on every
//! publish and transact. A missing `(event type, version)` entry rejects the
//! operation with [`BusError::SchemaMissing`]; a validator rejection becomes
//! [`BusError::SchemaValidation`].
//!
//! Subscriber-level schemas (given at subscribe time) gate only that
//! handler's invocation and never block other handlers.
//!
//! [`BusError::SchemaMissing`]: crate::error::BusError::SchemaMissing
//! [`BusError::SchemaValidation`]: crate::error::BusError::SchemaValidation

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::envelope::EventType;

/// A payload validator.
///
/// Implemented for free by any `Fn(&Value) -> Result<(), String>` closure,
/// so registries are usually built from plain functions:
///
/// ```ignore
/// let registry = SchemaRegistry::builder()
///     .register("order/created", "1.0", |payload: &Value| {
///         payload
///             .get("order_id")
///             .map(|_| ())
///             .ok_or_else(|| "missing order_id".to_string())
///     })
///     .build();
/// ```
pub trait Schema: Send + Sync {
    /// Validate a payload, returning a rejection reason on failure.
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

impl<F> Schema for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), String> {
        self(payload)
    }
}

/// A validator that accepts every payload.
pub fn accept_any() -> Arc<dyn Schema> {
    Arc::new(|_: &Value| Ok(()))
}

/// Two-level mapping from event type and schema version to validator.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<EventType, HashMap<String, Arc<dyn Schema>>>,
}

impl SchemaRegistry {
    /// Start building a registry.
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Look up the validator for an event type and schema version.
    pub fn lookup(&self, event_type: &EventType, version: &str) -> Option<&Arc<dyn Schema>> {
        self.schemas.get(event_type).and_then(|v| v.get(version))
    }

    /// Check whether any version is registered for an event type.
    pub fn has_event_type(&self, event_type: &EventType) -> bool {
        self.schemas.contains_key(event_type)
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("event_types", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`SchemaRegistry`].
#[derive(Default)]
pub struct SchemaRegistryBuilder {
    schemas: HashMap<EventType, HashMap<String, Arc<dyn Schema>>>,
}

impl SchemaRegistryBuilder {
    /// Register a validator for an event type and schema version.
    ///
    /// Registering the same `(event type, version)` twice replaces the
    /// earlier validator.
    pub fn register(
        mut self,
        event_type: impl Into<EventType>,
        version: impl Into<String>,
        schema: impl Schema + 'static,
    ) -> Self {
        self.schemas
            .entry(event_type.into())
            .or_default()
            .insert(version.into(), Arc::new(schema));
        self
    }

    /// Register an already-shared validator.
    pub fn register_arc(
        mut self,
        event_type: impl Into<EventType>,
        version: impl Into<String>,
        schema: Arc<dyn Schema>,
    ) -> Self {
        self.schemas
            .entry(event_type.into())
            .or_default()
            .insert(version.into(), schema);
        self
    }

    /// Finish building the registry.
    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            schemas: self.schemas,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn require_key(key: &'static str) -> impl Schema {
        move |payload: &Value| {
            payload
                .get(key)
                .map(|_| ())
                .ok_or_else(|| format!("missing {key}"))
        }
    }

    #[test]
    fn test_lookup_registered() {
        let registry = SchemaRegistry::builder()
            .register("test/event", "1.0", require_key("data"))
            .build();

        let schema = registry
            .lookup(&EventType::new("test/event"), "1.0")
            .unwrap();
        assert!(schema.validate(&json!({"data": 42})).is_ok());
        assert!(schema.validate(&json!({})).is_err());
    }

    #[test]
    fn test_lookup_missing_version() {
        let registry = SchemaRegistry::builder()
            .register("test/event", "1.0", require_key("data"))
            .build();

        assert!(registry.lookup(&EventType::new("test/event"), "2.0").is_none());
        assert!(registry.lookup(&EventType::new("other"), "1.0").is_none());
    }

    #[test]
    fn test_multiple_versions() {
        let registry = SchemaRegistry::builder()
            .register("test/event", "1.0", require_key("old"))
            .register("test/event", "2.0", require_key("new"))
            .build();

        assert_eq!(registry.len(), 1);
        let v1 = registry.lookup(&EventType::new("test/event"), "1.0").unwrap();
        let v2 = registry.lookup(&EventType::new("test/event"), "2.0").unwrap();
        assert!(v1.validate(&json!({"old": 1})).is_ok());
        assert!(v1.validate(&json!({"new": 1})).is_err());
        assert!(v2.validate(&json!({"new": 1})).is_ok());
    }

    #[test]
    fn test_accept_any() {
        let schema = accept_any();
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!({"anything": [1, 2, 3]})).is_ok());
    }

    #[test]
    fn test_empty_registry() {
        let registry = SchemaRegistry::builder().build();
        assert!(registry.is_empty());
        assert!(!registry.has_event_type(&EventType::new("test/event")));
    }

    #[test]
    fn test_debug_lists_event_types() {
        let registry = SchemaRegistry::builder()
            .register("test/event", "1.0", require_key("x"))
            .build();
        let debug = format!("{:?}", registry);
        assert!(debug.contains("test/event"));
    }
}
