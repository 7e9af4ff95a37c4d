//! Sync scheduling - a single worker for on-demand and periodic syncs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::pull::PullReport;
use crate::push::PushReport;
use tablesync_common::{Error, Result};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only when requested.
    Manual,
    /// Additionally run a full sync at regular intervals.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Pull remote tables, then download file payloads.
    Pull,
    /// Push local changes.
    Push,
    /// Push, pull and download.
    Full,
    /// Shutdown the scheduler.
    Shutdown,
}

/// Result of one scheduled request.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// Pull report; `None` if no pull ran or it was skipped.
    pub pull: Option<PullReport>,
    /// Push report; `None` if no push ran or it was coalesced.
    pub push: Option<PushReport>,
    pub files_downloaded: usize,
    pub duration: Duration,
}

type Responder = oneshot::Sender<Result<SyncSummary>>;
type Request = (SyncRequest, Responder);

const REQUEST_QUEUE: usize = 100;

/// Scheduler for managing sync timing and requests.
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Wakes the worker when the mode changes.
    mode_changed: Arc<Notify>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<Request>,
    /// Shutdown signal.
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let mode = Arc::new(RwLock::new(mode));
        let mode_changed = Arc::new(Notify::new());
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            mode: mode.clone(),
            mode_changed: mode_changed.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            mode,
            mode_changed,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a pull followed by file downloads.
    pub async fn request_pull(&self) -> Result<SyncSummary> {
        self.request(SyncRequest::Pull).await
    }

    /// Request a push.
    pub async fn request_push(&self) -> Result<SyncSummary> {
        self.request(SyncRequest::Push).await
    }

    /// Request a full sync.
    pub async fn request_full(&self) -> Result<SyncSummary> {
        self.request(SyncRequest::Full).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncSummary> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Change the sync mode. A running worker picks it up immediately.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
        self.mode_changed.notify_one();
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.shutdown.write().await;
        *is_shutdown = true;

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    mode_changed: Arc<Notify>,
    request_rx: mpsc::Receiver<Request>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. Requests are executed one at
    /// a time by `sync_fn`. Requests of the same kind that queue up while
    /// another one runs are answered together by a single run.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncSummary>> + Send,
    {
        let mut current_interval = self.mode.read().await.interval();
        let mut periodic = current_interval.map(Self::periodic_interval);

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some(request) = request else {
                        info!("All scheduler senders dropped");
                        break;
                    };
                    let Some(batch) = self.collect_batch(request) else {
                        info!("Received shutdown request");
                        break;
                    };
                    for (request, responders) in batch {
                        debug!(
                            "Processing sync request: {:?} ({} waiting)",
                            request,
                            responders.len()
                        );
                        let result = sync_fn(request).await;
                        Self::respond(responders, result);
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::Full).await {
                        Ok(summary) => {
                            info!("Periodic sync completed in {:?}", summary.duration);
                        }
                        Err(e) => {
                            error!("Periodic sync failed: {}", e);
                        }
                    }
                }

                _ = self.mode_changed.notified() => {
                    debug!("Sync mode changed");
                }
            }

            // Recreate interval if mode changed
            let expected_interval = self.mode.read().await.interval();
            if current_interval != expected_interval {
                current_interval = expected_interval;
                periodic = current_interval.map(Self::periodic_interval);
            }
        }
    }

    /// Group `first` and every request already queued behind it by kind, in
    /// order of first arrival. Returns `None` if a shutdown is queued.
    fn collect_batch(&mut self, first: Request) -> Option<Vec<(SyncRequest, Vec<Responder>)>> {
        let mut batch: Vec<(SyncRequest, Vec<Responder>)> = Vec::new();
        let mut next = Some(first);

        while let Some((request, response_tx)) = next {
            if request == SyncRequest::Shutdown {
                return None;
            }
            match batch.iter_mut().find(|(kind, _)| *kind == request) {
                Some((_, responders)) => responders.push(response_tx),
                None => batch.push((request, vec![response_tx])),
            }
            next = self.request_rx.try_recv().ok();
        }

        Some(batch)
    }

    fn respond(responders: Vec<Responder>, result: Result<SyncSummary>) {
        let mut responders = responders.into_iter();
        let Some(first) = responders.next() else {
            return;
        };
        for response_tx in responders {
            let _ = response_tx.send(result.clone());
        }
        let _ = first.send(result);
    }

    fn periodic_interval(period: Duration) -> tokio::time::Interval {
        let mut interval = interval(period);
        interval.reset();
        interval
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        if let Some(ref mut interval) = interval {
            interval.tick().await;
        } else {
            // If no periodic sync, wait indefinitely
            std::future::pending::<()>().await;
        }
    }
}
