//! Dispatch executor: runs handler tasks under one of two scheduling models.
//!
//! - **Unlimited** (default): every submitted task runs on its own spawned
//!   task. Submission never blocks.
//! - **Buffered**: a bounded FIFO feeds a fixed pool of workers. Submission
//!   is a non-blocking try-offer; a full buffer rejects with
//!   [`BusError::BufferFull`] so slow publishers observe overload instead of
//!   silently stalling the dispatcher.
//!
//! Every submitted task is wrapped: panics are caught, reported as
//! `handler-failed`, and the worker keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::BusError;
use crate::log::{events, BusLogger, LogLevel};

/// Scheduling model for the publish path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One spawned task per submission; no bound on concurrency.
    Unlimited,
    /// Bounded queue drained by a fixed worker pool.
    Buffered {
        /// Queue capacity; submissions beyond it are rejected.
        buffer_size: usize,
        /// Number of worker tasks draining the queue.
        concurrency: usize,
    },
}

impl DispatchMode {
    /// Buffered mode with the default capacity (1024) and concurrency (4).
    pub fn buffered() -> Self {
        DispatchMode::Buffered {
            buffer_size: 1024,
            concurrency: 4,
        }
    }
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Unlimited
    }
}

/// A submitted unit of work.
pub(crate) type Task = BoxFuture<'static, ()>;

/// Tracks tasks between submission and completion so shutdown can drain.
#[derive(Default)]
struct Inflight {
    count: AtomicUsize,
    notify: Notify,
}

/// RAII decrement: runs whether the task completed, panicked, or was dropped
/// unexecuted during shutdown.
struct InflightGuard {
    inflight: Arc<Inflight>,
}

impl InflightGuard {
    fn new(inflight: Arc<Inflight>) -> Self {
        inflight.count.fetch_add(1, Ordering::AcqRel);
        Self { inflight }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inflight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inflight.notify.notify_waiters();
        }
    }
}

enum ExecutorKind {
    Unlimited,
    Buffered {
        sender: Mutex<Option<mpsc::Sender<Task>>>,
        workers: Mutex<Vec<JoinHandle<()>>>,
    },
}

/// Submits handler tasks under the configured scheduling model.
pub(crate) struct DispatchExecutor {
    kind: ExecutorKind,
    inflight: Arc<Inflight>,
    logger: BusLogger,
}

impl DispatchExecutor {
    pub fn new(mode: DispatchMode, logger: BusLogger) -> Self {
        let inflight = Arc::new(Inflight::default());
        let kind = match mode {
            DispatchMode::Unlimited => ExecutorKind::Unlimited,
            DispatchMode::Buffered {
                buffer_size,
                concurrency,
            } => {
                let (sender, receiver) = mpsc::channel::<Task>(buffer_size.max(1));
                let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
                let workers = (0..concurrency.max(1))
                    .map(|_| {
                        let receiver = receiver.clone();
                        tokio::spawn(async move {
                            loop {
                                let task = { receiver.lock().await.recv().await };
                                match task {
                                    Some(task) => task.await,
                                    None => break,
                                }
                            }
                        })
                    })
                    .collect();
                ExecutorKind::Buffered {
                    sender: Mutex::new(Some(sender)),
                    workers: Mutex::new(workers),
                }
            }
        };
        Self {
            kind,
            inflight,
            logger,
        }
    }

    /// Submit a task. Never blocks; buffered mode rejects on a full queue.
    pub fn submit(&self, task: Task) -> Result<(), BusError> {
        let guard = InflightGuard::new(self.inflight.clone());
        let logger = self.logger.clone();
        let wrapped: Task = Box::pin(async move {
            let _guard = guard;
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                logger.emit(
                    LogLevel::Error,
                    events::HANDLER_FAILED,
                    json!({ "panic": extract_panic_message(&panic) }),
                );
            }
        });

        match &self.kind {
            ExecutorKind::Unlimited => {
                tokio::spawn(wrapped);
                Ok(())
            }
            ExecutorKind::Buffered { sender, .. } => {
                let sender = sender.lock().unwrap_or_else(|p| p.into_inner());
                let Some(sender) = sender.as_ref() else {
                    return Err(BusError::Closed);
                };
                match sender.try_send(wrapped) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => Err(BusError::BufferFull),
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
                }
            }
        }
    }

    /// Number of tasks submitted but not yet finished.
    pub fn inflight_count(&self) -> usize {
        self.inflight.count.load(Ordering::Acquire)
    }

    /// Stop intake and wait for in-flight work, up to `deadline`.
    ///
    /// Buffered workers drain what is already queued before exiting. Returns
    /// false if the deadline expired first (remaining workers are aborted).
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        match &self.kind {
            ExecutorKind::Unlimited => {
                let drained = async {
                    loop {
                        let notified = self.inflight.notify.notified();
                        if self.inflight.count.load(Ordering::Acquire) == 0 {
                            return;
                        }
                        notified.await;
                    }
                };
                tokio::time::timeout(deadline, drained).await.is_ok()
            }
            ExecutorKind::Buffered { sender, workers } => {
                // Dropping the sender lets workers exit once the queue drains.
                sender.lock().unwrap_or_else(|p| p.into_inner()).take();
                let workers: Vec<JoinHandle<()>> = {
                    let mut workers = workers.lock().unwrap_or_else(|p| p.into_inner());
                    workers.drain(..).collect()
                };
                let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
                let joined = futures::future::join_all(workers);
                match tokio::time::timeout(deadline, joined).await {
                    Ok(_) => true,
                    Err(_) => {
                        for abort in aborts {
                            abort.abort();
                        }
                        false
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DispatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.kind {
            ExecutorKind::Unlimited => "unlimited",
            ExecutorKind::Buffered { .. } => "buffered",
        };
        f.debug_struct("DispatchExecutor")
            .field("mode", &mode)
            .field("inflight", &self.inflight_count())
            .finish()
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
