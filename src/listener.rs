//! Listener registrations: the mutable table of handlers per event type.
//!
//! Handlers are opaque callables behind the [`Handler`] trait. Each
//! registration gets a fresh [`HandlerId`], which is both the stable identity
//! used by persisted handler rows and the easiest unsubscribe key.
//!
//! Entries are kept in subscription order per event type; dispatch submits
//! tasks in that order (execution order is not guaranteed).

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::bus::Bus;
use crate::envelope::{Envelope, EventType};
use crate::schema::Schema;

/// Stable identity of one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub(crate) fn new() -> Self {
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

impl From<Uuid> for HandlerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event handler.
///
/// `Ok(true)` means the handler succeeded. On the durable transact path,
/// `Ok(false)` and `Err(_)` are retryable failures; on the fire-and-forget
/// publish path only errors are reported (and merely logged).
///
/// Automatically implemented for async closures:
///
/// ```ignore
/// bus.subscribe("order/created", |_bus: Bus, env: Envelope| async move {
///     println!("got {}", env.event_type());
///     Ok(true)
/// }, SubscribeOpts::default())?;
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one envelope.
    async fn handle(&self, bus: Bus, envelope: Envelope) -> Result<bool>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Bus, Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<bool>> + Send + 'static,
{
    async fn handle(&self, bus: Bus, envelope: Envelope) -> Result<bool> {
        (self)(bus, envelope).await
    }
}

/// Options attached to a subscription.
#[derive(Default, Clone)]
pub struct SubscribeOpts {
    /// Subscriber-level schema; rejects gate only this handler.
    pub schema: Option<Arc<dyn Schema>>,
    /// Opaque metadata; usable as an unsubscribe key.
    pub meta: Option<Value>,
    /// Require the durable transact path; subscription fails without a store.
    pub durable: bool,
}

impl SubscribeOpts {
    /// Attach a subscriber-level schema.
    pub fn with_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Attach opaque metadata.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Mark the subscription as requiring the durable delivery path.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// One registration in the listener table.
#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub handler_id: HandlerId,
    pub handler: Arc<dyn Handler>,
    pub schema: Option<Arc<dyn Schema>>,
    pub meta: Option<Value>,
    #[allow(dead_code)]
    pub durable: bool,
}

/// Unsubscribe key: by registration id, by handler reference, or by meta.
pub enum Matcher {
    /// Remove the entry with this registration id.
    Id(HandlerId),
    /// Remove entries whose handler is pointer-equal to this one.
    Handler(Arc<dyn Handler>),
    /// Remove entries whose meta equals this value.
    Meta(Value),
}

impl Matcher {
    fn matches(&self, entry: &ListenerEntry) -> bool {
        match self {
            Matcher::Id(id) => entry.handler_id == *id,
            Matcher::Handler(handler) => Arc::ptr_eq(&entry.handler, handler),
            Matcher::Meta(meta) => entry.meta.as_ref() == Some(meta),
        }
    }
}

impl From<HandlerId> for Matcher {
    fn from(id: HandlerId) -> Self {
        Matcher::Id(id)
    }
}

/// Concurrent, insertion-ordered registry of listeners per event type.
#[derive(Default)]
pub(crate) struct ListenerTable {
    entries: DashMap<EventType, Vec<ListenerEntry>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener, assigning a fresh id.
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn Handler>,
        opts: SubscribeOpts,
    ) -> HandlerId {
        let handler_id = HandlerId::new();
        self.entries.entry(event_type).or_default().push(ListenerEntry {
            handler_id,
            handler,
            schema: opts.schema,
            meta: opts.meta,
            durable: opts.durable,
        });
        handler_id
    }

    /// Remove entries matching the given key; returns how many were removed.
    pub fn unsubscribe(&self, event_type: &EventType, matcher: &Matcher) -> usize {
        let mut removed = 0;
        if let Some(mut entries) = self.entries.get_mut(event_type) {
            let before = entries.len();
            entries.retain(|entry| !matcher.matches(entry));
            removed = before - entries.len();
        }
        removed
    }

    /// Purge one event type, or all of them.
    pub fn clear(&self, event_type: Option<&EventType>) {
        match event_type {
            Some(event_type) => {
                self.entries.remove(event_type);
            }
            None => self.entries.clear(),
        }
    }

    /// Listener cardinality for one event type, or overall.
    pub fn count(&self, event_type: Option<&EventType>) -> usize {
        match event_type {
            Some(event_type) => self.entries.get(event_type).map_or(0, |e| e.len()),
            None => self.entries.iter().map(|e| e.len()).sum(),
        }
    }

    /// Consistent snapshot of one event type's entries, in subscription order.
    pub fn snapshot(&self, event_type: &EventType) -> Vec<ListenerEntry> {
        self.entries
            .get(event_type)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Resolve a registration by id within one event type.
    pub fn find(&self, event_type: &EventType, handler_id: HandlerId) -> Option<ListenerEntry> {
        self.entries
            .get(event_type)?
            .iter()
            .find(|e| e.handler_id == handler_id)
            .cloned()
    }
}

impl fmt::Debug for ListenerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerTable")
            .field("event_types", &self.entries.len())
            .field("listeners", &self.count(None))
            .finish()
    }
}
