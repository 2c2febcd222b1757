//! Transfer engine — prioritized, simulated DMA/RDMA executor.
//!
//! Requests are queued by priority and drained by a single dispatch loop.
//! Dispatch is instantaneous; each dispatched request gets its own short
//! task that sleeps for the simulated service time and then signals the
//! submitter. Completion delivery never blocks: if the submitter stopped
//! listening (dropped its handle, or gave up in `submit_and_wait`) the
//! signal is dropped.
//!
//! Service time:
//!   base + ceil(size / 1 MiB) * per_mib, halved for priority <= 0

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch, Notify};

use flame_core::config::EngineSettings;
use flame_core::{Priority, TransferError, TransferRequest};

use crate::queue::{PendingQueue, QueuedTransfer};

/// Observable engine activity, in the order the engine performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Popped from the queue; service time starts now.
    Dispatched {
        id: String,
        priority: Priority,
        latency: Duration,
    },
    /// Service time elapsed. `delivered` is false when nobody was listening.
    Completed { id: String, delivered: bool },
}

/// Point-in-time engine summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub pending: usize,
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub dropped_signals: u64,
    pub stopped: bool,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "engine: pending={} submitted={} dispatched={} completed={} dropped={}{}",
            self.pending,
            self.submitted,
            self.dispatched,
            self.completed,
            self.dropped_signals,
            if self.stopped { " (stopped)" } else { "" }
        )
    }
}

/// Simulated service-time model.
#[derive(Debug, Clone, Copy)]
pub struct LatencyModel {
    pub base: Duration,
    pub per_mib: Duration,
}

impl LatencyModel {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            base: settings.base_latency(),
            per_mib: settings.per_mib_latency(),
        }
    }

    pub fn latency(&self, request: &TransferRequest) -> Duration {
        let mib = u32::try_from(request.size_mib()).unwrap_or(u32::MAX);
        let latency = self.base.saturating_add(self.per_mib.saturating_mul(mib));
        if request.is_high_priority() {
            latency / 2
        } else {
            latency
        }
    }
}

/// Receiving half of a submitted request's completion signal. Await it once.
#[derive(Debug)]
pub struct CompletionHandle {
    id: String,
    rx: oneshot::Receiver<Result<(), TransferError>>,
}

impl CompletionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the transfer to finish.
    ///
    /// Blocks for as long as the request sits in a stopped engine's queue.
    /// Returns `Abandoned` once the engine itself is gone.
    pub async fn wait(self) -> Result<(), TransferError> {
        self.rx.await.unwrap_or(Err(TransferError::Abandoned))
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    dropped_signals: AtomicU64,
}

/// State shared by the engine handle, the dispatch loop and completion tasks.
struct Shared {
    queue: Mutex<PendingQueue>,
    work: Notify,
    counters: Counters,
    events: broadcast::Sender<TransferEvent>,
    model: LatencyModel,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, PendingQueue> {
        // Queue operations never panic mid-update, so a poisoned lock still holds a valid queue.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the next request, or report that the loop must stop. The stop flag
    /// is read under the queue lock that `stop()` also holds, so once `stop()`
    /// returns nothing else leaves the queue.
    fn next_step(&self, shutdown: &watch::Receiver<bool>) -> Step {
        let mut queue = self.queue();
        if *shutdown.borrow() {
            return Step::Stop;
        }
        match queue.pop() {
            Some(entry) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                Step::Dispatch(entry)
            }
            None => Step::Idle,
        }
    }

    fn record_delivery(&self, id: String, delivered: bool) {
        if delivered {
            tracing::trace!(%id, "transfer completed");
        } else {
            self.counters.dropped_signals.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%id, "transfer completed with no listener, signal dropped");
        }
        let _ = self.events.send(TransferEvent::Completed { id, delivered });
    }
}

/// Prioritized transfer engine.
///
/// Must be started from within a Tokio runtime. Share it behind an `Arc`;
/// every operation takes `&self`. Dropping the engine stops it and abandons
/// whatever is still queued.
pub struct TransferEngine {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl TransferEngine {
    /// Create the engine and spawn its dispatch loop.
    pub fn start(settings: &EngineSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let shared = Arc::new(Shared {
            queue: Mutex::new(PendingQueue::new()),
            work: Notify::new(),
            counters: Counters::default(),
            events,
            model: LatencyModel::from_settings(settings),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(
            DispatchLoop {
                shared: shared.clone(),
                shutdown: shutdown_rx,
            }
            .run(),
        );

        tracing::info!(
            base_latency_ms = settings.base_latency_ms,
            per_mib_latency_ms = settings.per_mib_latency_ms,
            "transfer engine started"
        );

        Self { shared, shutdown }
    }

    /// Queue a request. Fails synchronously if the request is malformed or
    /// its id is already pending; a rejected request never enters the queue.
    pub fn submit(&self, request: TransferRequest) -> Result<CompletionHandle, TransferError> {
        if let Err(e) = request.validate() {
            tracing::warn!(error = %e, "transfer request rejected");
            return Err(e);
        }

        let id = request.id.clone();
        let priority = request.priority;
        let (tx, rx) = oneshot::channel();

        let (position, depth) = {
            let mut queue = self.shared.queue();
            let position = queue.push(QueuedTransfer::new(request, tx)).inspect_err(|e| {
                tracing::warn!(error = %e, "transfer request rejected");
            })?;
            (position, queue.len())
        };

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.work.notify_one();
        tracing::trace!(%id, priority, position, depth, "transfer queued");

        Ok(CompletionHandle { id, rx })
    }

    /// Submit and wait until the transfer completes or `cancel` resolves.
    ///
    /// Cancellation only stops the wait. The request stays queued (or in
    /// flight) and its completion signal is discarded.
    pub async fn submit_and_wait<F>(
        &self,
        request: TransferRequest,
        cancel: F,
    ) -> Result<(), TransferError>
    where
        F: Future<Output = ()>,
    {
        let handle = self.submit(request)?;
        let id = handle.id().to_string();
        tokio::select! {
            result = handle.wait() => result,
            _ = cancel => {
                tracing::debug!(%id, "wait canceled, transfer orphaned");
                Err(TransferError::Canceled)
            }
        }
    }

    /// Submit and wait at most `timeout`. Same orphaning rules as `submit_and_wait`.
    pub async fn submit_and_wait_timeout(
        &self,
        request: TransferRequest,
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let handle = self.submit(request)?;
        let id = handle.id().to_string();
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%id, ?timeout, "wait deadline exceeded, transfer orphaned");
                Err(TransferError::DeadlineExceeded)
            }
        }
    }

    /// Halt the dispatch loop. In-flight transfers still complete; queued
    /// ones are left where they are. Safe to call any number of times.
    pub fn stop(&self) {
        let queue = self.shared.queue();
        if !self.shutdown.send_replace(true) {
            tracing::info!(pending = queue.len(), "transfer engine stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            pending: self.shared.queue().len(),
            submitted: counters.submitted.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            dropped_signals: counters.dropped_signals.load(Ordering::Relaxed),
            stopped: self.is_stopped(),
        }
    }

    /// Subscribe to dispatch/completion events. Slow subscribers lag and
    /// lose events; the engine never waits for them.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Dispatch loop ─────────────────────────────────────────────────────────────

enum Step {
    Dispatch(QueuedTransfer),
    Idle,
    Stop,
}

struct DispatchLoop {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl DispatchLoop {
    async fn run(mut self) {
        loop {
            match self.shared.next_step(&self.shutdown) {
                Step::Stop => {
                    tracing::info!("dispatch loop stopped");
                    return;
                }
                Step::Dispatch(entry) => {
                    self.dispatch(entry);
                    tokio::task::yield_now().await;
                }
                Step::Idle => {
                    tokio::select! {
                        changed = self.shutdown.changed() => {
                            if changed.is_err() {
                                tracing::info!("engine handle dropped, dispatch loop exiting");
                                return;
                            }
                        }
                        _ = self.shared.work.notified() => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, entry: QueuedTransfer) {
        let QueuedTransfer {
            request,
            done,
            enqueued_at,
        } = entry;
        let latency = self.shared.model.latency(&request);

        tracing::debug!(
            id = %request.id,
            src = request.src_node,
            dst = request.dst_node,
            size_bytes = request.size_bytes,
            priority = request.priority,
            latency_us = micros(latency),
            queued_us = micros(enqueued_at.elapsed()),
            "transfer dispatched"
        );
        let _ = self.shared.events.send(TransferEvent::Dispatched {
            id: request.id.clone(),
            priority: request.priority,
            latency,
        });

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            let delivered = done.send(Ok(())).is_ok();
            shared.record_delivery(request.id, delivered);
        });
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
