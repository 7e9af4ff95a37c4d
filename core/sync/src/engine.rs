//! Sync engine that wires the pull, push, download and live components
//! together.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::files::FileDownloadQueue;
use crate::live::LiveUpdateChannel;
use crate::notifications::NotificationSync;
use crate::observer::SyncObserver;
use crate::pull::{PullEngine, PullReport};
use crate::push::{PushEngine, PushReport};
use crate::remote::Remote;
use crate::renewal::SessionHandler;
use crate::scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle, SyncSummary};
use tablesync_common::{Error, Result};
use tablesync_storage::LocalStore;

/// Main sync engine for one local store and one remote.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    files: Arc<FileDownloadQueue>,
    pull: PullEngine,
    push: PushEngine,
    notifications: NotificationSync,
    live: LiveUpdateChannel,
    /// Sync scheduler.
    scheduler: Option<SyncScheduler>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn Remote>,
        session: Arc<dyn SessionHandler>,
        observer: Arc<dyn SyncObserver>,
        config: SyncConfig,
    ) -> Self {
        let ctx = Arc::new(SyncContext::new(store, remote, session, observer, config));
        Self::from_context(ctx)
    }

    /// Create a sync engine over existing collaborators.
    pub fn from_context(ctx: Arc<SyncContext>) -> Self {
        let files = Arc::new(FileDownloadQueue::new(ctx.clone()));

        Self {
            pull: PullEngine::new(ctx.clone(), files.clone()),
            push: PushEngine::new(ctx.clone()),
            notifications: NotificationSync::new(ctx.clone()),
            live: LiveUpdateChannel::new(ctx.clone(), files.clone()),
            files,
            ctx,
            scheduler: None,
            last_sync: RwLock::new(None),
        }
    }

    /// Initialize the scheduler and return a handle for running it.
    pub fn init_scheduler(&mut self) -> SyncSchedulerHandle {
        let (scheduler, handle) = SyncScheduler::new(self.ctx.config.sync_mode.clone());
        self.scheduler = Some(scheduler);
        handle
    }

    /// Get the scheduler for requesting syncs.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.ctx.store
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn live_channel(&self) -> &LiveUpdateChannel {
        &self.live
    }

    pub fn file_queue(&self) -> &Arc<FileDownloadQueue> {
        &self.files
    }

    /// Time the last full sync finished.
    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().await
    }

    /// Pull every table. See [`PullEngine::sync`].
    pub async fn pull(&self) -> Option<PullReport> {
        self.pull.sync().await
    }

    /// Push table objects, then notifications and the web push
    /// subscription. See [`PushEngine::sync_push`].
    pub async fn push(&self) -> Option<PushReport> {
        let report = self.push.sync_push().await?;
        if report.logged_out {
            return Some(report);
        }

        if let Err(e) = self.notifications.push_notifications().await {
            warn!("Notification push failed: {}", e);
        }
        if let Err(e) = self.notifications.push_web_push_subscription().await {
            warn!("Web push subscription push failed: {}", e);
        }
        Some(report)
    }

    /// Download queued file payloads. See
    /// [`FileDownloadQueue::download_files`].
    pub async fn download_files(&self) -> Option<usize> {
        self.files.download_files().await
    }

    /// Pull notifications from the remote.
    pub async fn pull_notifications(&self) -> Result<bool> {
        self.notifications.pull_notifications().await
    }

    /// Push local changes, pull remote tables and notifications, then
    /// download file payloads.
    pub async fn sync_full(&self) -> Result<SyncSummary> {
        if !self.ctx.is_authenticated().await {
            return Err(Error::NotAuthenticated);
        }

        let start = Instant::now();
        info!("Starting full sync");

        let push = self.push().await;
        if push.as_ref().is_some_and(|p| p.logged_out) {
            return Err(Error::SessionInvalid);
        }

        let pull = self.pull().await;
        if let Err(e) = self.pull_notifications().await {
            warn!("Notification pull failed: {}", e);
        }
        let files_downloaded = self.download_files().await.unwrap_or(0);

        *self.last_sync.write().await = Some(Utc::now());

        let duration = start.elapsed();
        info!("Full sync completed in {:?}", duration);

        Ok(SyncSummary {
            pull,
            push,
            files_downloaded,
            duration,
        })
    }

    /// Process a sync request (for scheduler).
    pub async fn process_request(&self, request: SyncRequest) -> Result<SyncSummary> {
        let start = Instant::now();
        match request {
            SyncRequest::Pull => {
                let pull = self.pull().await;
                let files_downloaded = self.download_files().await.unwrap_or(0);
                Ok(SyncSummary {
                    pull,
                    files_downloaded,
                    duration: start.elapsed(),
                    ..SyncSummary::default()
                })
            }
            SyncRequest::Push => Ok(SyncSummary {
                push: self.push().await,
                duration: start.elapsed(),
                ..SyncSummary::default()
            }),
            SyncRequest::Full => self.sync_full().await,
            SyncRequest::Shutdown => Ok(SyncSummary {
                duration: Duration::from_secs(0),
                ..SyncSummary::default()
            }),
        }
    }
}
