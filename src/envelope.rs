//! Immutable message envelopes and the causality model.
//!
//! Every event travelling through the bus is wrapped in an [`Envelope`]
//! carrying identity and causality metadata:
//!
//! - `message_id` - fresh per message
//! - `correlation_id` - stable across a causal chain
//! - `causation_path` - ordered `(module, event type)` pairs recording
//!   ancestry, used for cycle and depth detection at derivation time
//!
//! Domain payloads stay clean JSON values; causality is transport-level
//! metadata.
//!
//! # Deriving envelopes
//!
//! A handler reacting to an event publishes follow-up events *derived* from
//! the one it received. Derivation appends the parent's `(module, event
//! type)` pair to the causation path and re-checks two gates:
//!
//! 1. The derived pair must not already appear on the path (cycle).
//! 2. The path must not grow past the configured maximum depth.
//!
//! The cycle check always runs before the depth check.

use std::fmt;

use serde_json::Value;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::BusError;

/// Default schema version applied when none is given.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

/// Correlation ID shared by all envelopes in one causal chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Symbolic event type tag (e.g. `"order/created"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(String);

impl EventType {
    /// Create a new event type tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the tag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symbolic tag for the publishing component; half of the cycle key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Module(String);

impl Module {
    /// Create a new module tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the tag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Module {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Module {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One ancestry step: the `(module, event type)` pair of a parent envelope.
///
/// Compared by value equality; this pair is the cycle key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausationStep {
    /// Module of the ancestor envelope.
    pub module: Module,
    /// Event type of the ancestor envelope.
    pub event_type: EventType,
}

impl CausationStep {
    /// Create a causation step.
    pub fn new(module: Module, event_type: EventType) -> Self {
        Self { module, event_type }
    }
}

impl fmt::Display for CausationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.module, self.event_type)
    }
}

/// Causation paths are short; keep the common case inline.
pub type CausationPath = SmallVec<[CausationStep; 4]>;

/// Immutable message value: identity, causality, payload.
///
/// Envelopes are constructed through [`Envelope::root`] or
/// [`Envelope::derive`] and never mutated afterwards; every transformation
/// returns a new value.
#[derive(Debug, Clone)]
pub struct Envelope {
    message_id: Uuid,
    correlation_id: CorrelationId,
    causation_path: CausationPath,
    event_type: EventType,
    module: Module,
    schema_version: String,
    payload: Value,
}

impl Envelope {
    /// Construct a root envelope (empty causation path).
    ///
    /// `correlation_id` defaults to a fresh ID, `schema_version` to
    /// [`DEFAULT_SCHEMA_VERSION`]. An empty module tag fails fast with
    /// [`BusError::MissingModule`].
    pub fn root(
        event_type: EventType,
        payload: Value,
        module: Module,
        correlation_id: Option<CorrelationId>,
        schema_version: Option<String>,
    ) -> Result<Self, BusError> {
        if module.is_empty() {
            return Err(BusError::MissingModule { event_type });
        }
        Ok(Self {
            message_id: Uuid::new_v4(),
            correlation_id: correlation_id.unwrap_or_default(),
            causation_path: CausationPath::new(),
            event_type,
            module,
            schema_version: schema_version.unwrap_or_else(|| DEFAULT_SCHEMA_VERSION.to_string()),
            payload,
        })
    }

    /// Derive a child envelope from this one.
    ///
    /// The child shares this envelope's correlation ID and extends its
    /// causation path with this envelope's `(module, event type)` pair.
    ///
    /// # Errors
    ///
    /// - [`BusError::CycleDetected`] if `(module, event_type)` of the child
    ///   already appears on the extended path. Checked first.
    /// - [`BusError::MaxDepthExceeded`] if the extended path is longer than
    ///   `max_depth`.
    pub fn derive(
        &self,
        event_type: EventType,
        payload: Value,
        module: Module,
        schema_version: Option<String>,
        max_depth: Option<usize>,
    ) -> Result<Self, BusError> {
        let mut new_path = self.causation_path.clone();
        new_path.push(CausationStep::new(
            self.module.clone(),
            self.event_type.clone(),
        ));

        let own_step = CausationStep::new(module.clone(), event_type.clone());
        if new_path.contains(&own_step) {
            return Err(BusError::CycleDetected { module, event_type });
        }
        if let Some(max_depth) = max_depth {
            if new_path.len() > max_depth {
                return Err(BusError::MaxDepthExceeded {
                    depth: new_path.len(),
                    max_depth,
                });
            }
        }

        let mut child = Self::root(
            event_type,
            payload,
            module,
            Some(self.correlation_id),
            schema_version,
        )?;
        child.causation_path = new_path;
        Ok(child)
    }

    /// Reassemble an envelope from stored fields.
    ///
    /// The causation path is not persisted, so reconstructed envelopes start
    /// with an empty one.
    pub(crate) fn reconstruct(
        message_id: Uuid,
        correlation_id: CorrelationId,
        event_type: EventType,
        module: Module,
        schema_version: String,
        payload: Value,
    ) -> Self {
        Self {
            message_id,
            correlation_id,
            causation_path: CausationPath::new(),
            event_type,
            module,
            schema_version,
            payload,
        }
    }

    /// Per-message unique identifier.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Identifier shared across this envelope's causal chain.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Ordered ancestry of `(module, event type)` pairs.
    pub fn causation_path(&self) -> &[CausationStep] {
        &self.causation_path
    }

    /// The event type tag.
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// The publishing module tag.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Schema version the payload was validated against.
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// The opaque payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
