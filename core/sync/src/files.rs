//! Deferred payload downloads for file table objects.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use tablesync_common::TableId;

/// A payload waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    pub uuid: String,
    pub table_id: TableId,
    /// Etag seen when the download was enqueued; stored once the payload
    /// arrives.
    pub etag: String,
}

/// LIFO work stack of payload downloads, drained by a single worker.
pub struct FileDownloadQueue {
    ctx: Arc<SyncContext>,
    stack: Mutex<Vec<FileDownload>>,
    running: Mutex<()>,
}

impl FileDownloadQueue {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            stack: Mutex::new(Vec::new()),
            running: Mutex::new(()),
        }
    }

    /// Push a download onto the stack.
    pub async fn enqueue(&self, download: FileDownload) {
        debug!("Queued file download for {}", download.uuid);
        self.stack.lock().await.push(download);
    }

    /// Number of queued downloads.
    pub async fn pending(&self) -> usize {
        self.stack.lock().await.len()
    }

    /// Drain the stack, most recently queued first.
    ///
    /// Returns `None` without doing anything when a drain is already
    /// running; callers re-trigger after it finishes. Otherwise returns
    /// the number of payloads stored.
    pub async fn download_files(&self) -> Option<usize> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("File downloads already running, skipping");
            return None;
        };

        let mut downloaded = 0;
        loop {
            let next = self.stack.lock().await.pop();
            let Some(download) = next else {
                break;
            };
            if self.download(&download).await {
                downloaded += 1;
            }
        }

        if downloaded > 0 {
            info!("Downloaded {} file payloads", downloaded);
        }
        Some(downloaded)
    }

    async fn download(&self, download: &FileDownload) -> bool {
        let store = &self.ctx.store;

        let Some(mut object) = store
            .get_table_object(&download.uuid, Some(download.table_id))
            .await
        else {
            return false;
        };
        if !object.is_file || store.has_file(&download.uuid).await {
            return false;
        }

        let remote = &self.ctx.remote;
        let data = match self
            .ctx
            .call(|| remote.get_table_object_file(&download.uuid))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to download file {}: {}", download.uuid, e);
                return false;
            }
        };

        if !store.set_file(&download.uuid, data).await {
            return false;
        }

        object.etag = Some(download.etag.clone());
        store.set_table_object(&object, true).await;
        self.ctx.observer.table_object_changed(&object, true);
        true
    }
}
