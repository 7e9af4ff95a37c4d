//! Push engine: replays local mutations against the remote.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::remote::NewTableObject;
use tablesync_common::{
    Error, PropertyValue, RemoteError, Result, TableObject, UploadStatus, EXT_PROPERTY,
};

/// Outcome of a push, summed over every pass it ran.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// Objects created or updated remotely and now `UpToDate`.
    pub pushed: usize,
    /// Objects removed locally after a delete or access removal.
    pub removed: usize,
    /// Objects whose push failed; they stay dirty.
    pub failed: usize,
    /// Objects with nothing to upload yet or over the storage quota.
    pub skipped: usize,
    /// Whether the session was found invalid and the user logged out.
    pub logged_out: bool,
    /// Number of passes, including coalesced re-runs.
    pub passes: u32,
    pub duration: Duration,
}

enum Outcome {
    Pushed,
    Removed,
    Skipped,
}

/// Uploads dirty table objects, newest first.
pub struct PushEngine {
    ctx: Arc<SyncContext>,
    running: Mutex<()>,
    push_again: AtomicBool,
}

impl PushEngine {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(()),
            push_again: AtomicBool::new(false),
        }
    }

    /// Push every dirty table object.
    ///
    /// When a push is already running this only flags it to run once more
    /// after the current pass and returns `None`. Also returns `None` when
    /// no session is stored.
    pub async fn sync_push(&self) -> Option<PushReport> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Push already in progress, scheduling one more pass");
            self.push_again.store(true, Ordering::SeqCst);
            return None;
        };
        if !self.ctx.is_authenticated().await {
            warn!("Push requested without a session");
            return None;
        }

        let start = Instant::now();
        let mut report = PushReport::default();

        loop {
            report.passes += 1;
            self.push_pass(&mut report).await;

            if report.logged_out || !self.push_again.swap(false, Ordering::SeqCst) {
                break;
            }
            debug!("Push requested during pass, running again");
        }

        report.duration = start.elapsed();
        info!(
            "Push completed in {:?}: {} pushed, {} removed, {} failed, {} skipped",
            report.duration, report.pushed, report.removed, report.failed, report.skipped
        );
        Some(report)
    }

    async fn push_pass(&self, report: &mut PushReport) {
        let mut dirty: Vec<TableObject> = self
            .ctx
            .store
            .get_all_table_objects(-1, true)
            .await
            .into_iter()
            .filter(|o| o.upload_status.is_dirty())
            .collect();
        dirty.reverse();

        debug!("Pushing {} dirty table objects", dirty.len());

        for object in dirty {
            let result = match object.upload_status {
                UploadStatus::New => self.push_new(&object).await,
                UploadStatus::Updated => self.push_updated(&object).await,
                UploadStatus::Deleted => self.push_deleted(&object).await,
                UploadStatus::Removed => self.push_removed(&object).await,
                UploadStatus::UpToDate => continue,
            };

            match result {
                Ok(Outcome::Pushed) => report.pushed += 1,
                Ok(Outcome::Removed) => report.removed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(Error::SessionInvalid) => {
                    warn!("Session invalid while pushing {}, logging out", object.uuid);
                    self.ctx.logout().await;
                    report.logged_out = true;
                    return;
                }
                Err(e) => {
                    warn!("Failed to push table object {}: {}", object.uuid, e);
                    report.failed += 1;
                }
            }
        }
    }

    async fn push_new(&self, object: &TableObject) -> Result<Outcome> {
        let store = &self.ctx.store;

        let payload = if object.is_file {
            let Some(data) = store.get_file(&object.uuid).await else {
                debug!("File {} has no payload yet, skipping", object.uuid);
                return Ok(Outcome::Skipped);
            };
            if let Some(user) = store.get_user().await {
                if !user.has_room_for(data.len() as u64) {
                    info!("File {} exceeds the storage quota, skipping", object.uuid);
                    return Ok(Outcome::Skipped);
                }
            }
            Some(data)
        } else {
            None
        };

        let created = match self.create(object).await {
            Ok(created) => created,
            Err(e) if is(&e, RemoteError::UuidAlreadyInUse) => {
                debug!("Table object {} already exists remotely", object.uuid);
                return Ok(self.mark_synced(object, object.etag.clone()).await);
            }
            Err(e) => return Err(e),
        };

        let Some(data) = payload else {
            return Ok(self.mark_synced(object, created.etag).await);
        };

        let remote = &self.ctx.remote;
        match self
            .ctx
            .call(|| remote.set_table_object_file(&object.uuid, data.clone()))
            .await
        {
            Ok(uploaded) => Ok(self.mark_synced(object, uploaded.etag).await),
            Err(e) => {
                // Created without payload; upload again as an update
                let mut pending = object.clone();
                pending.upload_status = UploadStatus::Updated;
                pending.etag = created.etag;
                store.set_table_object(&pending, false).await;
                Err(e)
            }
        }
    }

    /// Create the object remotely, sending properties beyond the request
    /// limit as follow-up updates.
    async fn create(&self, object: &TableObject) -> Result<TableObject> {
        let remote = &self.ctx.remote;
        let mut chunks = chunk_properties(
            object.remote_properties(),
            self.ctx.config.max_properties_per_request,
        )
        .into_iter();
        let first = chunks.next().unwrap_or_default();

        let new = NewTableObject {
            uuid: object.uuid.clone(),
            table_id: object.table_id,
            is_file: object.is_file,
            properties: first,
        };
        let mut created = self
            .ctx
            .call(|| remote.create_table_object(new.clone()))
            .await?;

        for chunk in chunks {
            created = self
                .ctx
                .call(|| remote.update_table_object(&object.uuid, chunk.clone()))
                .await?;
        }
        Ok(created)
    }

    async fn push_updated(&self, object: &TableObject) -> Result<Outcome> {
        match self.upload_changes(object).await {
            Ok(etag) => Ok(self.mark_synced(object, etag).await),
            Err(e) if is(&e, RemoteError::TableObjectDoesNotExist) => {
                debug!("Table object {} no longer exists remotely", object.uuid);
                Ok(self.remove_local(object).await)
            }
            Err(e) => Err(e),
        }
    }

    /// Upload the payload of a file object, or its properties otherwise.
    /// Returns the resulting etag.
    async fn upload_changes(&self, object: &TableObject) -> Result<Option<String>> {
        let remote = &self.ctx.remote;

        if object.is_file {
            if let Some(data) = self.ctx.store.get_file(&object.uuid).await {
                let uploaded = self
                    .ctx
                    .call(|| remote.set_table_object_file(&object.uuid, data.clone()))
                    .await?;

                let Some(ext) = object.ext().filter(|ext| uploaded.ext() != Some(*ext)) else {
                    return Ok(uploaded.etag);
                };
                let mut properties = BTreeMap::new();
                properties.insert(
                    EXT_PROPERTY.to_string(),
                    PropertyValue::from(ext),
                );
                let updated = self
                    .ctx
                    .call(|| remote.update_table_object(&object.uuid, properties.clone()))
                    .await?;
                return Ok(updated.etag);
            }
        }

        let mut etag = object.etag.clone();
        for chunk in chunk_properties(
            object.remote_properties(),
            self.ctx.config.max_properties_per_request,
        ) {
            let updated = self
                .ctx
                .call(|| remote.update_table_object(&object.uuid, chunk.clone()))
                .await?;
            etag = updated.etag;
        }
        Ok(etag)
    }

    async fn push_deleted(&self, object: &TableObject) -> Result<Outcome> {
        let remote = &self.ctx.remote;
        match self
            .ctx
            .call(|| remote.delete_table_object(&object.uuid))
            .await
        {
            Ok(()) => Ok(self.remove_local(object).await),
            Err(e)
                if is(&e, RemoteError::TableObjectDoesNotExist)
                    || is(&e, RemoteError::ActionNotAllowed) =>
            {
                debug!("Table object {} already deleted remotely", object.uuid);
                Ok(self.remove_local(object).await)
            }
            Err(e) => Err(e),
        }
    }

    async fn push_removed(&self, object: &TableObject) -> Result<Outcome> {
        let remote = &self.ctx.remote;
        match self
            .ctx
            .call(|| remote.remove_table_object(&object.uuid))
            .await
        {
            Ok(()) => Ok(self.remove_local(object).await),
            Err(e) if is(&e, RemoteError::UserAccessDoesNotExist) => {
                debug!("Access to {} already removed", object.uuid);
                Ok(self.remove_local(object).await)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_synced(&self, object: &TableObject, etag: Option<String>) -> Outcome {
        let mut synced = object.clone();
        synced.upload_status = UploadStatus::UpToDate;
        synced.etag = etag;

        if self.ctx.store.set_table_object(&synced, false).await {
            self.ctx.observer.table_object_changed(&synced, true);
        }
        Outcome::Pushed
    }

    async fn remove_local(&self, object: &TableObject) -> Outcome {
        if self
            .ctx
            .store
            .remove_table_object(&object.uuid, Some(object.table_id))
            .await
        {
            self.ctx.observer.table_object_removed(object);
        }
        Outcome::Removed
    }
}

fn is(error: &Error, expected: RemoteError) -> bool {
    error.remote() == Some(&expected)
}

/// Split properties into request-sized chunks. Always yields at least one
/// chunk, which is empty for an empty map.
pub fn chunk_properties(
    properties: BTreeMap<String, PropertyValue>,
    limit: usize,
) -> Vec<BTreeMap<String, PropertyValue>> {
    let limit = limit.max(1);
    let mut chunks = vec![BTreeMap::new()];

    for (name, value) in properties {
        if chunks.last().is_some_and(|c| c.len() >= limit) {
            chunks.push(BTreeMap::new());
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.insert(name, value);
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::testing::{harness, harness_on, harness_with, Event};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tablesync_common::User;
    use tablesync_storage::{KeyValueStore, MemoryBackend};
    use tokio::sync::Semaphore;

    fn synced(uuid: &str) -> TableObject {
        let mut obj = TableObject::with_uuid(uuid, 1).with_property("title", uuid);
        obj.upload_status = UploadStatus::UpToDate;
        obj.etag = Some("etag-0".to_string());
        obj
    }

    fn new_file(uuid: &str) -> TableObject {
        let mut obj = TableObject::with_uuid(uuid, 1).with_property("ext", "png");
        obj.is_file = true;
        obj
    }

    #[test]
    fn test_chunk_properties() {
        let properties: BTreeMap<String, PropertyValue> = (0..5)
            .map(|i| (format!("p{}", i), PropertyValue::from(i as i64)))
            .collect();

        let chunks = chunk_properties(properties, 2);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2, 2, 1]);

        let empty = chunk_properties(BTreeMap::new(), 2);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_empty());
    }

    #[tokio::test]
    async fn test_new_objects_are_created_newest_first() {
        let h = harness(vec![1]).await;
        for uuid in ["a", "b"] {
            let obj = TableObject::with_uuid(uuid, 1)
                .with_property("title", uuid)
                .with_property("draft", PropertyValue::from(true));
            h.store.create_table_object(&obj).await;
        }
        let mut local_only = TableObject::with_uuid("c", 1);
        local_only.set_local_property("scroll", 12i64);
        h.store.create_table_object(&local_only).await;

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.pushed, 3);
        assert_eq!(report.passes, 1);
        assert_eq!(
            h.remote.calls(),
            vec!["create:c", "create:b", "create:a"]
        );

        let stored = h.store.get_table_object("a", Some(1)).await.unwrap();
        assert_eq!(stored.upload_status, UploadStatus::UpToDate);
        assert_eq!(stored.etag, h.remote.object("a").unwrap().etag);

        // Device-only properties stay local
        assert!(h.remote.object("c").unwrap().property("scroll").is_none());
        let c = h.store.get_table_object("c", Some(1)).await.unwrap();
        assert!(c.property("scroll").is_some());

        assert!(h.observer.events().contains(&Event::Changed("a".to_string(), true)));
    }

    #[tokio::test]
    async fn test_large_property_sets_are_chunked() {
        let mut config = SyncConfig::for_tables(vec![1]);
        config.max_properties_per_request = 2;
        let h = harness_with(config, 2).await;

        let mut obj = TableObject::with_uuid("big", 1);
        for i in 0..5 {
            obj.set_property(format!("p{}", i), i as i64);
        }
        h.store.create_table_object(&obj).await;

        let engine = PushEngine::new(h.ctx.clone());
        engine.sync_push().await.unwrap();

        assert_eq!(
            h.remote.calls(),
            vec!["create:big", "update:big", "update:big"]
        );
        assert_eq!(h.remote.object("big").unwrap().properties.len(), 5);
    }

    #[tokio::test]
    async fn test_uuid_conflict_marks_up_to_date() {
        let h = harness(vec![1]).await;
        h.remote.put_object(&synced("taken"));
        h.store
            .create_table_object(&TableObject::with_uuid("taken", 1))
            .await;

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 0);
        let stored = h.store.get_table_object("taken", Some(1)).await.unwrap();
        assert_eq!(stored.upload_status, UploadStatus::UpToDate);
    }

    #[tokio::test]
    async fn test_updates_push_properties() {
        let h = harness(vec![1]).await;
        let obj = synced("u");
        h.remote.put_object(&obj);
        h.store.set_table_object(&obj, true).await;
        h.store
            .update_table_object(&obj.clone().with_property("title", "changed"))
            .await;

        let engine = PushEngine::new(h.ctx.clone());
        engine.sync_push().await.unwrap();

        let remote = h.remote.object("u").unwrap();
        assert_eq!(remote.property("title"), Some(&PropertyValue::from("changed")));
        let stored = h.store.get_table_object("u", Some(1)).await.unwrap();
        assert_eq!(stored.upload_status, UploadStatus::UpToDate);
        assert_eq!(stored.etag, remote.etag);
    }

    #[tokio::test]
    async fn test_update_of_missing_object_removes_locally() {
        let h = harness(vec![1]).await;
        let obj = synced("gone");
        h.store.set_table_object(&obj, true).await;
        h.store.update_table_object(&obj).await;

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.removed, 1);
        assert!(h.store.get_table_object("gone", Some(1)).await.is_none());
        assert_eq!(h.observer.events(), vec![Event::Removed("gone".to_string())]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let h = harness(vec![1]).await;
        for uuid in ["remote", "missing", "forbidden"] {
            h.store.set_table_object(&synced(uuid), true).await;
            h.store.delete_table_object(uuid, Some(1)).await;
        }
        h.remote.put_object(&synced("remote"));
        h.remote.put_object(&synced("forbidden"));
        h.remote
            .fail("delete", Some("forbidden"), RemoteError::ActionNotAllowed);

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.removed, 3);
        assert!(h.remote.object("remote").is_none());
        assert!(h.store.get_all_table_objects(1, true).await.is_empty());
    }

    #[tokio::test]
    async fn test_removed_access() {
        let h = harness(vec![1]).await;
        for uuid in ["shared", "revoked"] {
            h.store.set_table_object(&synced(uuid), true).await;
            h.store.revoke_table_object_access(uuid, Some(1)).await;
        }
        h.remote.put_object(&synced("shared"));

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.removed, 2);
        assert!(h.store.get_all_table_objects(1, true).await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_object_dirty() {
        let h = harness(vec![1]).await;
        h.store
            .create_table_object(&TableObject::with_uuid("a", 1))
            .await;
        h.store
            .create_table_object(&TableObject::with_uuid("b", 1))
            .await;
        h.remote.fail_transport("create", Some("b"));

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 1);
        let b = h.store.get_table_object("b", Some(1)).await.unwrap();
        assert_eq!(b.upload_status, UploadStatus::New);
    }

    #[tokio::test]
    async fn test_invalid_session_logs_out_and_halts() {
        let h = harness(vec![1]).await;
        for uuid in ["a", "b"] {
            h.store
                .create_table_object(&TableObject::with_uuid(uuid, 1))
                .await;
        }
        h.remote.expire_session(2);

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert!(report.logged_out);
        assert_eq!(h.session.logouts(), 1);
        assert_eq!(h.remote.calls(), vec!["create:b", "create:b"]);
        for obj in h.store.get_all_table_objects(1, true).await {
            assert_eq!(obj.upload_status, UploadStatus::New);
        }
    }

    #[tokio::test]
    async fn test_files_without_payload_or_quota_are_skipped() {
        let h = harness(vec![1]).await;
        h.store.create_table_object(&new_file("empty")).await;
        h.store.create_table_object(&new_file("large")).await;
        h.store.set_file("large", vec![0; 8]).await;
        h.store
            .set_user(&User {
                id: 1,
                email: "user@example.com".to_string(),
                total_storage: 10,
                used_storage: 5,
            })
            .await;

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.skipped, 2);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_new_file_is_created_then_uploaded() {
        let h = harness(vec![1]).await;
        h.store.create_table_object(&new_file("f")).await;
        h.store.set_file("f", vec![1, 2, 3]).await;

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(h.remote.calls(), vec!["create:f", "set_file:f"]);
        assert_eq!(h.remote.file("f"), Some(vec![1, 2, 3]));
        let stored = h.store.get_table_object("f", Some(1)).await.unwrap();
        assert_eq!(stored.etag, h.remote.object("f").unwrap().etag);
    }

    #[tokio::test]
    async fn test_failed_upload_retries_as_update() {
        let h = harness(vec![1]).await;
        h.store.create_table_object(&new_file("f")).await;
        h.store.set_file("f", vec![1]).await;
        h.remote.fail_transport("set_file", Some("f"));

        let engine = PushEngine::new(h.ctx.clone());
        let report = engine.sync_push().await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = h.store.get_table_object("f", Some(1)).await.unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Updated);

        h.remote.clear_failures();
        h.remote.clear_calls();
        engine.sync_push().await.unwrap();
        assert_eq!(h.remote.calls(), vec!["set_file:f"]);
        assert_eq!(h.remote.file("f"), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_updated_file_propagates_extension() {
        let h = harness(vec![1]).await;
        let mut obj = new_file("f");
        obj.upload_status = UploadStatus::UpToDate;
        h.remote.put_object(&obj);
        h.store.set_table_object(&obj, true).await;

        let changed = obj.clone().with_property("ext", "jpg");
        h.store.update_table_object(&changed).await;
        h.store.set_file("f", vec![7]).await;

        let engine = PushEngine::new(h.ctx.clone());
        engine.sync_push().await.unwrap();

        assert_eq!(h.remote.calls(), vec!["set_file:f", "update:f"]);
        assert_eq!(h.remote.object("f").unwrap().ext(), Some("jpg"));
    }

    #[tokio::test]
    async fn test_requires_session() {
        let h = harness(vec![1]).await;
        h.store.remove_session().await;
        let engine = PushEngine::new(h.ctx.clone());
        assert!(engine.sync_push().await.is_none());
    }

    #[tokio::test]
    async fn test_overlapping_pushes_coalesce_into_one_rerun() {
        let h = harness(vec![1]).await;
        h.store
            .create_table_object(&TableObject::with_uuid("a", 1))
            .await;

        let engine = Arc::new(PushEngine::new(h.ctx.clone()));
        let gate = h.remote.hold();
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync_push().await }
        });

        while h.remote.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(engine.sync_push().await.is_none());
        assert!(engine.sync_push().await.is_none());

        gate.add_permits(16);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.pushed, 1);
    }

    /// Memory backend whose reads can be parked until released.
    struct ParkedBackend {
        inner: MemoryBackend,
        parked: AtomicBool,
        waiting: AtomicUsize,
        release: Semaphore,
    }

    impl ParkedBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                parked: AtomicBool::new(false),
                waiting: AtomicUsize::new(0),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for ParkedBackend {
        fn name(&self) -> &str {
            "parked"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.parked.load(Ordering::SeqCst) {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                if let Ok(permit) = self.release.acquire().await {
                    permit.forget();
                }
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn test_push_requested_during_session_check_reruns() {
        let backend = Arc::new(ParkedBackend::new());
        let h = harness_on(backend.clone(), SyncConfig::for_tables(vec![1]), 2).await;
        h.store
            .create_table_object(&TableObject::with_uuid("a", 1))
            .await;

        let engine = Arc::new(PushEngine::new(h.ctx.clone()));
        backend.parked.store(true, Ordering::SeqCst);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync_push().await }
        });

        while backend.waiting.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(engine.sync_push().await.is_none());

        backend.parked.store(false, Ordering::SeqCst);
        backend.release.add_permits(1);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.pushed, 1);
    }
}
