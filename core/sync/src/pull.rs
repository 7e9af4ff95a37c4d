//! Pull engine: reconciles local tables against remote pages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::files::{FileDownload, FileDownloadQueue};
use crate::remote::TableObjectSummary;
use crate::sequencer::sort_table_ids;
use tablesync_common::{TableId, UploadStatus};

/// Outcome of one pull pass.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    /// Tables whose every page was fetched and applied.
    pub tables_synced: Vec<TableId>,
    /// Tables with at least one failed fetch; their local state was not
    /// pruned.
    pub tables_failed: Vec<TableId>,
    /// Table objects written locally.
    pub changed: usize,
    /// Table objects removed locally.
    pub removed: usize,
    pub duration: Duration,
}

impl PullReport {
    /// Whether every table completed without error.
    pub fn is_complete(&self) -> bool {
        self.tables_failed.is_empty()
    }
}

enum Applied {
    Unchanged,
    Written,
    /// The object could not be fetched or stored; the table is not pruned.
    Failed,
}

/// Per-table progress of a pull pass.
struct TableProgress {
    /// Uuids known locally that no remote page listed yet.
    unseen: HashSet<String>,
    next_page: u32,
    remaining_pages: u32,
    changed: bool,
    failed: bool,
}

/// Walks remote table pages and applies upserts and deletions locally.
pub struct PullEngine {
    ctx: Arc<SyncContext>,
    files: Arc<FileDownloadQueue>,
    running: Mutex<()>,
}

impl PullEngine {
    pub fn new(ctx: Arc<SyncContext>, files: Arc<FileDownloadQueue>) -> Self {
        Self {
            ctx,
            files,
            running: Mutex::new(()),
        }
    }

    /// Run one pull pass over every configured table.
    ///
    /// Returns `None` without doing anything when a pull is already running
    /// or no session is stored; a skipped pull is not retried.
    pub async fn sync(&self) -> Option<PullReport> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Pull already in progress, skipping");
            return None;
        };
        if !self.ctx.is_authenticated().await {
            warn!("Pull requested without a session");
            return None;
        }

        let start = Instant::now();
        let mut report = PullReport::default();
        let mut progress: HashMap<TableId, TableProgress> = HashMap::new();
        let mut pages_per_table: HashMap<TableId, u32> = HashMap::new();

        info!("Starting pull of {} tables", self.ctx.config.table_ids.len());

        // First pages tell how many pages each table has
        for table_id in &self.ctx.config.table_ids {
            let unseen = self
                .ctx
                .store
                .get_all_table_objects(*table_id, true)
                .await
                .into_iter()
                .map(|o| o.uuid)
                .collect();
            let mut table = TableProgress {
                unseen,
                next_page: 1,
                remaining_pages: 1,
                changed: false,
                failed: false,
            };

            match self.fetch_page(*table_id, &mut table, &mut report).await {
                Some(pages) => {
                    table.remaining_pages = pages.saturating_sub(1);
                    pages_per_table.insert(*table_id, pages.max(1));
                }
                None => table.remaining_pages = 0,
            }
            if table.remaining_pages == 0 {
                self.finish_table(*table_id, &mut table, &mut report).await;
            }
            progress.insert(*table_id, table);
        }

        // Each table's first slot in the order is the page fetched above
        let order = sort_table_ids(
            &self.ctx.config.table_ids,
            &self.ctx.config.parallel_table_ids,
            &pages_per_table,
        );
        let mut prefetched: HashSet<TableId> = pages_per_table.keys().copied().collect();

        for table_id in order {
            if prefetched.remove(&table_id) {
                continue;
            }
            let Some(table) = progress.get_mut(&table_id) else {
                continue;
            };
            if table.remaining_pages == 0 {
                continue;
            }

            if self.fetch_page(table_id, table, &mut report).await.is_none() {
                table.remaining_pages = 0;
                continue;
            }
            table.remaining_pages -= 1;
            if table.remaining_pages == 0 {
                self.finish_table(table_id, table, &mut report).await;
            }
        }

        report.duration = start.elapsed();
        info!(
            "Pull completed in {:?}: {} changed, {} removed, {} tables failed",
            report.duration,
            report.changed,
            report.removed,
            report.tables_failed.len()
        );
        Some(report)
    }

    /// Fetch and apply the next page of a table. Returns the table's page
    /// count, or `None` if the page could not be fetched.
    async fn fetch_page(
        &self,
        table_id: TableId,
        table: &mut TableProgress,
        report: &mut PullReport,
    ) -> Option<u32> {
        let page = table.next_page;
        let remote = &self.ctx.remote;

        let result = self.ctx.call(|| remote.get_table(table_id, page)).await;
        let table_page = match result {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to fetch page {} of table {}: {}", page, table_id, e);
                table.failed = true;
                report.tables_failed.push(table_id);
                return None;
            }
        };
        debug!(
            "Fetched page {}/{} of table {} ({} objects)",
            page,
            table_page.pages,
            table_id,
            table_page.table_objects.len()
        );

        table.next_page += 1;
        for summary in &table_page.table_objects {
            table.unseen.remove(&summary.uuid);
            match self.apply_summary(table_id, summary).await {
                Applied::Unchanged => {}
                Applied::Written => {
                    table.changed = true;
                    report.changed += 1;
                }
                Applied::Failed => table.failed = true,
            }
        }

        Some(table_page.pages)
    }

    /// Bring one object up to the remote version.
    async fn apply_summary(&self, table_id: TableId, summary: &TableObjectSummary) -> Applied {
        let store = &self.ctx.store;
        let local = store.get_table_object(&summary.uuid, Some(table_id)).await;

        if let Some(local) = &local {
            if local.etag.as_deref() == Some(summary.etag.as_str()) {
                if local.is_file && !store.has_file(&local.uuid).await {
                    self.enqueue_download(table_id, summary).await;
                }
                return Applied::Unchanged;
            }
        }

        let remote = &self.ctx.remote;
        let mut object = match self.ctx.call(|| remote.get_table_object(&summary.uuid)).await {
            Ok(o) => o,
            Err(e) => {
                warn!("Failed to fetch table object {}: {}", summary.uuid, e);
                return Applied::Failed;
            }
        };
        object.upload_status = UploadStatus::UpToDate;

        if object.is_file {
            if local.is_some() {
                // Payload belongs to the previous version
                store.remove_file(&object.uuid).await;
            }
            self.enqueue_download(table_id, summary).await;
        }

        if !store.set_table_object(&object, false).await {
            return Applied::Failed;
        }
        let stored = store
            .get_table_object(&object.uuid, Some(table_id))
            .await
            .unwrap_or(object);
        self.ctx.observer.table_object_changed(&stored, false);
        Applied::Written
    }

    async fn enqueue_download(&self, table_id: TableId, summary: &TableObjectSummary) {
        self.files
            .enqueue(FileDownload {
                uuid: summary.uuid.clone(),
                table_id,
                etag: summary.etag.clone(),
            })
            .await;
    }

    /// Remove objects no remote page listed, unless they were never synced.
    async fn finish_table(&self, table_id: TableId, table: &mut TableProgress, report: &mut PullReport) {
        if table.failed {
            if !report.tables_failed.contains(&table_id) {
                report.tables_failed.push(table_id);
            }
            return;
        }

        for uuid in table.unseen.drain() {
            let Some(object) = self.ctx.store.get_table_object(&uuid, Some(table_id)).await else {
                continue;
            };
            if object.upload_status == UploadStatus::New {
                continue;
            }
            if self.ctx.store.remove_table_object(&uuid, Some(table_id)).await {
                debug!("Removed {} deleted on the server", uuid);
                self.ctx.observer.table_object_removed(&object);
                table.changed = true;
                report.removed += 1;
            }
        }

        report.tables_synced.push(table_id);
        self.ctx.observer.table_refreshed(table_id, table.changed);
    }
}
