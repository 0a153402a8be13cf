//! Completion handles: how a transact caller observes the final result.
//!
//! Each in-flight transaction owns one entry in the completion table: a
//! one-shot broadcast channel. The handle returned by `transact` carries a
//! pre-subscribed receiver (the blocking-waiter view) and can mint further
//! receivers (the fan-out view); every receiver gets one copy of the same
//! result.
//!
//! Exactly-once delivery is structural: the completer removes the entry from
//! the table *before* sending, so only one completer can ever deliver.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{BusError, TxError};

/// Final outcome of a transaction, as observed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    /// The transaction this result belongs to.
    pub tx_id: Uuid,
    /// Whether every handler row finished ok.
    pub ok: bool,
    /// Present iff `ok` is false; always the collapsed terminal tag.
    pub error: Option<TxError>,
}

impl TxResult {
    pub(crate) fn success(tx_id: Uuid) -> Self {
        Self {
            tx_id,
            ok: true,
            error: None,
        }
    }

    pub(crate) fn failure(tx_id: Uuid) -> Self {
        Self {
            tx_id,
            ok: false,
            error: Some(TxError::HandlerFailed),
        }
    }

    /// Whether the transaction succeeded.
    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

/// Handle to an in-flight transaction.
///
/// Dropping the handle does not affect the transaction; the worker drives it
/// to a terminal state regardless.
#[derive(Debug)]
pub struct TxHandle {
    tx_id: Uuid,
    sender: broadcast::Sender<TxResult>,
    primary: broadcast::Receiver<TxResult>,
}

impl TxHandle {
    /// The transaction id (also usable as an operation id).
    pub fn tx_id(&self) -> Uuid {
        self.tx_id
    }

    /// Await the final result.
    ///
    /// Resolves exactly once per handle. If the bus is torn down without
    /// completing the transaction this waits forever; use
    /// [`TxHandle::wait_timeout`] when that matters.
    pub async fn wait(&mut self) -> Result<TxResult, BusError> {
        loop {
            match self.primary.recv().await {
                Ok(result) => return Ok(result),
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                // A one-shot channel cannot lag, but recv's contract says
                // retry, so retry.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Await the final result with an upper bound.
    pub async fn wait_timeout(&mut self, duration: Duration) -> Result<TxResult, BusError> {
        tokio::time::timeout(duration, self.wait())
            .await
            .map_err(|_| BusError::WaitTimeout { duration })?
    }

    /// Subscribe another receiver to the same one-shot result.
    ///
    /// Receivers obtained before completion each get one copy. A receiver
    /// obtained after completion never sees the value.
    pub fn subscribe(&self) -> broadcast::Receiver<TxResult> {
        self.sender.subscribe()
    }
}

/// Table of completion entries for in-flight transactions.
#[derive(Default)]
pub(crate) struct CompletionTable {
    entries: DashMap<Uuid, broadcast::Sender<TxResult>>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a transaction and hand back its handle.
    ///
    /// Must run before the append becomes visible to the worker, so a fast
    /// completion cannot race past registration.
    pub fn register(&self, tx_id: Uuid) -> TxHandle {
        let (sender, primary) = broadcast::channel(1);
        self.entries.insert(tx_id, sender.clone());
        TxHandle {
            tx_id,
            sender,
            primary,
        }
    }

    /// Deliver the result. Returns false if the entry was already gone
    /// (someone else completed, or the transaction was abandoned).
    pub fn complete(&self, tx_id: Uuid, result: TxResult) -> bool {
        match self.entries.remove(&tx_id) {
            Some((_, sender)) => {
                // Receivers may all be dropped; that is fine.
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the entry without delivering (append failed).
    pub fn abandon(&self, tx_id: Uuid) {
        self.entries.remove(&tx_id);
    }

    /// Number of in-flight entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for CompletionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTable")
            .field("in_flight", &self.entries.len())
            .finish()
    }
}
