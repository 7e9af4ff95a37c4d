//! Typed local store for mirrored entities.
//!
//! Every operation swallows backend and decoding errors: they are logged and
//! surface as `None`, `false` or an empty collection. Callers must treat
//! those values as the only failure signal.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::KeyValueStore;
use tablesync_common::{
    Notification, Result, Session, TableId, TableObject, UploadStatus, User, WebPushSubscription,
};

/// Key layout of the local store.
pub mod keys {
    use tablesync_common::TableId;

    pub const TABLE_OBJECT_PREFIX: &str = "tableObject:";
    pub const TABLE_OBJECT_FILE_PREFIX: &str = "tableObjectFile:";
    pub const NOTIFICATION_PREFIX: &str = "notification:";
    pub const SESSION: &str = "session";
    pub const USER: &str = "user";
    pub const WEB_PUSH_SUBSCRIPTION: &str = "webPushSubscription";

    /// `tableObject:<tableId>/<uuid>`
    pub fn table_object(table_id: TableId, uuid: &str) -> String {
        format!("{}{}/{}", TABLE_OBJECT_PREFIX, table_id, uuid)
    }

    /// `tableObject:<tableId>/`, or `tableObject:` for every table when
    /// `table_id` is negative.
    pub fn table_prefix(table_id: TableId) -> String {
        if table_id < 0 {
            TABLE_OBJECT_PREFIX.to_string()
        } else {
            format!("{}{}/", TABLE_OBJECT_PREFIX, table_id)
        }
    }

    /// `tableObjectFile:<uuid>`
    pub fn table_object_file(uuid: &str) -> String {
        format!("{}{}", TABLE_OBJECT_FILE_PREFIX, uuid)
    }

    /// `notification:<uuid>`
    pub fn notification(uuid: &str) -> String {
        format!("{}{}", NOTIFICATION_PREFIX, uuid)
    }
}

/// Typed persistence for table objects, notifications, the web push
/// subscription and the session/user snapshots.
///
/// Keeps a uuid → table id index so lookups without a table id do not
/// probe every configured table.
pub struct LocalStore {
    backend: Arc<dyn KeyValueStore>,
    table_ids: Vec<TableId>,
    uuid_index: RwLock<HashMap<String, TableId>>,
}

fn logged<T>(op: &str, key: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Local store {} failed for {}: {}", op, key, e);
            None
        }
    }
}

impl LocalStore {
    /// Open a store over `backend`, building the uuid index with one scan.
    ///
    /// `table_ids` are the configured tables probed when a uuid is missing
    /// from the index.
    pub async fn open(backend: Arc<dyn KeyValueStore>, table_ids: Vec<TableId>) -> Self {
        let store = Self {
            backend,
            table_ids,
            uuid_index: RwLock::new(HashMap::new()),
        };

        let objects = store.get_all_table_objects(-1, true).await;
        {
            let mut index = store.uuid_index.write().await;
            for obj in &objects {
                index.insert(obj.uuid.clone(), obj.table_id);
            }
        }
        debug!("Opened local store with {} table objects", objects.len());

        store
    }

    /// The configured table ids.
    pub fn table_ids(&self) -> &[TableId] {
        &self.table_ids
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = logged("read", key, self.backend.get(key).await)??;
        logged(
            "decode",
            key,
            serde_json::from_slice(&bytes).map_err(Into::into),
        )
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let Some(bytes) = logged("encode", key, serde_json::to_vec(value).map_err(Into::into))
        else {
            return false;
        };
        logged("write", key, self.backend.set(key, bytes).await).is_some()
    }

    async fn delete(&self, key: &str) -> bool {
        logged("remove", key, self.backend.remove(key).await).is_some()
    }

    async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        let Some(entries) = logged("scan", prefix, self.backend.scan_prefix(prefix).await) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter_map(|(key, bytes)| {
                logged(
                    "decode",
                    &key,
                    serde_json::from_slice(&bytes).map_err(Into::into),
                )
            })
            .collect()
    }

    async fn resolve_table_id(&self, uuid: &str, table_id: Option<TableId>) -> Option<TableId> {
        if table_id.is_some() {
            return table_id;
        }
        if let Some(id) = self.uuid_index.read().await.get(uuid) {
            return Some(*id);
        }
        for id in &self.table_ids {
            let key = keys::table_object(*id, uuid);
            if let Some(true) = logged("probe", &key, self.backend.contains(&key).await) {
                self.uuid_index.write().await.insert(uuid.to_string(), *id);
                return Some(*id);
            }
        }
        None
    }

    // Table objects

    /// Get a table object by uuid. Without a table id the index is used,
    /// then every configured table is probed.
    pub async fn get_table_object(&self, uuid: &str, table_id: Option<TableId>) -> Option<TableObject> {
        let table_id = self.resolve_table_id(uuid, table_id).await?;
        self.read(&keys::table_object(table_id, uuid)).await
    }

    /// Persist a table object.
    ///
    /// With `overwrite = false`, every device-only property of the stored
    /// record that `obj` does not define is carried over before writing.
    pub async fn set_table_object(&self, obj: &TableObject, overwrite: bool) -> bool {
        let key = keys::table_object(obj.table_id, &obj.uuid);

        let written = if overwrite {
            self.write(&key, obj).await
        } else {
            match self.read::<TableObject>(&key).await {
                Some(prior) => {
                    let mut merged = obj.clone();
                    merged.merge_local_properties(&prior);
                    self.write(&key, &merged).await
                }
                None => self.write(&key, obj).await,
            }
        };

        if written {
            self.uuid_index
                .write()
                .await
                .insert(obj.uuid.clone(), obj.table_id);
        }
        written
    }

    /// Remove a table object together with its file payload.
    pub async fn remove_table_object(&self, uuid: &str, table_id: Option<TableId>) -> bool {
        let Some(table_id) = self.resolve_table_id(uuid, table_id).await else {
            return false;
        };
        let removed = self.delete(&keys::table_object(table_id, uuid)).await;
        self.delete(&keys::table_object_file(uuid)).await;
        if removed {
            self.uuid_index.write().await.remove(uuid);
        }
        removed
    }

    /// All table objects of `table_id` (every table when `-1`) in insertion
    /// order. `Deleted` and `Removed` objects are skipped unless
    /// `include_deleted` is set.
    pub async fn get_all_table_objects(&self, table_id: TableId, include_deleted: bool) -> Vec<TableObject> {
        self.scan::<TableObject>(&keys::table_prefix(table_id))
            .await
            .into_iter()
            .filter(|obj| include_deleted || !obj.upload_status.is_deleted())
            .collect()
    }

    // File payloads

    /// The downloaded or attached payload of a file table object.
    pub async fn get_file(&self, uuid: &str) -> Option<Vec<u8>> {
        let key = keys::table_object_file(uuid);
        logged("read", &key, self.backend.get(&key).await)?
    }

    /// Attach a payload to a file table object.
    pub async fn set_file(&self, uuid: &str, data: Vec<u8>) -> bool {
        let key = keys::table_object_file(uuid);
        logged("write", &key, self.backend.set(&key, data).await).is_some()
    }

    /// Drop the payload of a file table object.
    pub async fn remove_file(&self, uuid: &str) -> bool {
        self.delete(&keys::table_object_file(uuid)).await
    }

    /// Whether a payload is stored for `uuid`.
    pub async fn has_file(&self, uuid: &str) -> bool {
        let key = keys::table_object_file(uuid);
        logged("probe", &key, self.backend.contains(&key).await).unwrap_or(false)
    }

    // Local lifecycle

    /// Store a locally created object as `New`.
    pub async fn create_table_object(&self, obj: &TableObject) -> bool {
        let mut obj = obj.clone();
        obj.upload_status = UploadStatus::New;
        self.set_table_object(&obj, true).await
    }

    /// Store a local modification. Synced objects become `Updated`,
    /// never-synced objects stay `New`.
    pub async fn update_table_object(&self, obj: &TableObject) -> bool {
        let mut obj = obj.clone();
        let prior = self.get_table_object(&obj.uuid, Some(obj.table_id)).await;
        obj.upload_status = match prior.map(|p| p.upload_status) {
            Some(UploadStatus::New) | None => UploadStatus::New,
            Some(_) => UploadStatus::Updated,
        };
        self.set_table_object(&obj, true).await
    }

    /// Delete locally. Objects the server never saw are removed at once,
    /// everything else is marked `Deleted` for the next push.
    pub async fn delete_table_object(&self, uuid: &str, table_id: Option<TableId>) -> bool {
        let Some(mut obj) = self.get_table_object(uuid, table_id).await else {
            return false;
        };
        if obj.upload_status == UploadStatus::New {
            return self.remove_table_object(uuid, Some(obj.table_id)).await;
        }
        obj.upload_status = UploadStatus::Deleted;
        self.set_table_object(&obj, true).await
    }

    /// Revoke this user's access to an object owned by someone else.
    pub async fn revoke_table_object_access(&self, uuid: &str, table_id: Option<TableId>) -> bool {
        let Some(mut obj) = self.get_table_object(uuid, table_id).await else {
            return false;
        };
        obj.upload_status = UploadStatus::Removed;
        self.set_table_object(&obj, true).await
    }

    // Notifications

    pub async fn get_notification(&self, uuid: &str) -> Option<Notification> {
        self.read(&keys::notification(uuid)).await
    }

    pub async fn set_notification(&self, notification: &Notification) -> bool {
        self.write(&keys::notification(&notification.uuid), notification)
            .await
    }

    pub async fn remove_notification(&self, uuid: &str) -> bool {
        self.delete(&keys::notification(uuid)).await
    }

    /// All notifications in insertion order; `Deleted` ones only when
    /// `include_deleted` is set.
    pub async fn get_all_notifications(&self, include_deleted: bool) -> Vec<Notification> {
        self.scan::<Notification>(keys::NOTIFICATION_PREFIX)
            .await
            .into_iter()
            .filter(|n| include_deleted || !n.upload_status.is_deleted())
            .collect()
    }

    // Singletons

    pub async fn get_session(&self) -> Option<Session> {
        self.read(keys::SESSION).await
    }

    pub async fn set_session(&self, session: &Session) -> bool {
        self.write(keys::SESSION, session).await
    }

    pub async fn remove_session(&self) -> bool {
        self.delete(keys::SESSION).await
    }

    pub async fn get_user(&self) -> Option<User> {
        self.read(keys::USER).await
    }

    pub async fn set_user(&self, user: &User) -> bool {
        self.write(keys::USER, user).await
    }

    pub async fn remove_user(&self) -> bool {
        self.delete(keys::USER).await
    }

    pub async fn get_web_push_subscription(&self) -> Option<WebPushSubscription> {
        self.read(keys::WEB_PUSH_SUBSCRIPTION).await
    }

    pub async fn set_web_push_subscription(&self, subscription: &WebPushSubscription) -> bool {
        self.write(keys::WEB_PUSH_SUBSCRIPTION, subscription).await
    }

    pub async fn remove_web_push_subscription(&self) -> bool {
        self.delete(keys::WEB_PUSH_SUBSCRIPTION).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use async_trait::async_trait;
    use tablesync_common::{Error, PropertyValue};

    async fn store() -> LocalStore {
        LocalStore::open(Arc::new(MemoryBackend::new()), vec![1, 2, 3]).await
    }

    fn synced(uuid: &str, table_id: TableId) -> TableObject {
        let mut obj = TableObject::with_uuid(uuid, table_id);
        obj.upload_status = UploadStatus::UpToDate;
        obj.etag = Some("e1".to_string());
        obj
    }

    #[tokio::test]
    async fn test_set_and_get_with_and_without_table_id() {
        let store = store().await;
        let obj = synced("a", 2).with_property("title", "Hello");

        assert!(store.set_table_object(&obj, true).await);
        assert_eq!(store.get_table_object("a", Some(2)).await, Some(obj.clone()));
        assert_eq!(store.get_table_object("a", None).await, Some(obj));
        assert_eq!(store.get_table_object("a", Some(1)).await, None);
    }

    #[tokio::test]
    async fn test_index_rebuilt_on_open() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryBackend::new());
        {
            let store = LocalStore::open(backend.clone(), vec![]).await;
            store.set_table_object(&synced("a", 7), true).await;
        }

        // Table 7 is not configured, so only the index can find it
        let store = LocalStore::open(backend, vec![]).await;
        assert!(store.get_table_object("a", None).await.is_some());
    }

    #[tokio::test]
    async fn test_merge_preserves_local_properties() {
        let store = store().await;

        let mut prior = synced("a", 1).with_property("title", "Old");
        prior.set_local_property("scroll", 120.0);
        prior.set_local_property("theme", "dark");
        store.set_table_object(&prior, true).await;

        let incoming = synced("a", 1)
            .with_property("title", "New")
            .with_property("theme", "light");
        assert!(store.set_table_object(&incoming, false).await);
        let once = store.get_table_object("a", Some(1)).await.unwrap();

        assert_eq!(once.property("title"), Some(&PropertyValue::from("New")));
        assert_eq!(once.property("scroll"), Some(&PropertyValue::Number(120.0)));
        assert!(once.properties["scroll"].is_local());
        assert_eq!(once.property("theme"), Some(&PropertyValue::from("light")));

        // Applying the same incoming object again changes nothing
        store.set_table_object(&incoming, false).await;
        let twice = store.get_table_object("a", Some(1)).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_overwrite_drops_local_properties() {
        let store = store().await;

        let mut prior = synced("a", 1);
        prior.set_local_property("scroll", 120.0);
        store.set_table_object(&prior, true).await;

        store.set_table_object(&synced("a", 1), true).await;
        let stored = store.get_table_object("a", Some(1)).await.unwrap();
        assert!(stored.property("scroll").is_none());
    }

    #[tokio::test]
    async fn test_get_all_filters() {
        let store = store().await;

        store.set_table_object(&synced("a", 1), true).await;
        let mut deleted = synced("b", 1);
        deleted.upload_status = UploadStatus::Deleted;
        store.set_table_object(&deleted, true).await;
        let mut removed = synced("c", 2);
        removed.upload_status = UploadStatus::Removed;
        store.set_table_object(&removed, true).await;
        store.set_table_object(&synced("d", 2), true).await;

        let uuids = |objs: Vec<TableObject>| objs.into_iter().map(|o| o.uuid).collect::<Vec<_>>();

        assert_eq!(uuids(store.get_all_table_objects(1, false).await), vec!["a"]);
        assert_eq!(uuids(store.get_all_table_objects(1, true).await), vec!["a", "b"]);
        assert_eq!(uuids(store.get_all_table_objects(-1, false).await), vec!["a", "d"]);
        assert_eq!(
            uuids(store.get_all_table_objects(-1, true).await),
            vec!["a", "b", "c", "d"]
        );
    }

    #[tokio::test]
    async fn test_table_prefix_does_not_match_longer_ids() {
        let store = store().await;
        store.set_table_object(&synced("a", 1), true).await;
        store.set_table_object(&synced("b", 12), true).await;

        let objs = store.get_all_table_objects(1, true).await;
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].uuid, "a");
    }

    #[tokio::test]
    async fn test_remove_drops_payload() {
        let store = store().await;
        let mut obj = synced("a", 1);
        obj.is_file = true;
        store.set_table_object(&obj, true).await;
        store.set_file("a", vec![1, 2, 3]).await;
        assert!(store.has_file("a").await);

        assert!(store.remove_table_object("a", None).await);
        assert!(store.get_table_object("a", None).await.is_none());
        assert!(!store.has_file("a").await);
        assert!(!store.remove_table_object("a", None).await);
    }

    #[tokio::test]
    async fn test_local_lifecycle() {
        let store = store().await;

        let obj = TableObject::with_uuid("a", 1).with_property("title", "Draft");
        store.create_table_object(&obj).await;
        store.update_table_object(&obj.clone().with_property("title", "Draft 2")).await;
        assert_eq!(
            store.get_table_object("a", None).await.unwrap().upload_status,
            UploadStatus::New
        );

        // Never synced: removed immediately
        assert!(store.delete_table_object("a", None).await);
        assert!(store.get_table_object("a", None).await.is_none());

        store.set_table_object(&synced("b", 1), true).await;
        store.update_table_object(&synced("b", 1).with_property("title", "Edit")).await;
        assert_eq!(
            store.get_table_object("b", None).await.unwrap().upload_status,
            UploadStatus::Updated
        );

        store.delete_table_object("b", None).await;
        assert_eq!(
            store.get_table_object("b", None).await.unwrap().upload_status,
            UploadStatus::Deleted
        );

        store.set_table_object(&synced("c", 2), true).await;
        store.revoke_table_object_access("c", None).await;
        assert_eq!(
            store.get_table_object("c", None).await.unwrap().upload_status,
            UploadStatus::Removed
        );
    }

    #[tokio::test]
    async fn test_singletons_and_notifications() {
        let store = store().await;

        assert!(store.get_session().await.is_none());
        store.set_session(&Session::new("token", Some(4))).await;
        assert_eq!(store.get_session().await.unwrap().session_id, Some(4));
        store.remove_session().await;
        assert!(store.get_session().await.is_none());

        let mut n1 = Notification::new(100, 0);
        n1.upload_status = UploadStatus::UpToDate;
        let mut n2 = Notification::new(200, 60);
        n2.upload_status = UploadStatus::Deleted;
        store.set_notification(&n1).await;
        store.set_notification(&n2).await;

        assert_eq!(store.get_all_notifications(false).await, vec![n1.clone()]);
        assert_eq!(store.get_all_notifications(true).await.len(), 2);
        store.remove_notification(&n1.uuid).await;
        assert!(store.get_notification(&n1.uuid).await.is_none());
    }

    struct FailingBackend;

    #[async_trait]
    impl KeyValueStore for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(Error::Storage("disk gone".to_string()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(Error::Storage("disk gone".to_string()))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Err(Error::Storage("disk gone".to_string()))
        }
        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
            Err(Error::Storage("disk gone".to_string()))
        }
    }

    #[tokio::test]
    async fn test_backend_errors_are_swallowed() {
        let store = LocalStore::open(Arc::new(FailingBackend), vec![1]).await;

        assert!(!store.set_table_object(&synced("a", 1), true).await);
        assert!(store.get_table_object("a", Some(1)).await.is_none());
        assert!(store.get_table_object("a", None).await.is_none());
        assert!(store.get_all_table_objects(-1, true).await.is_empty());
        assert!(!store.has_file("a").await);
        assert!(store.get_user().await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_skipped() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryBackend::new());
        backend
            .set(&keys::table_object(1, "bad"), b"not json".to_vec())
            .await
            .unwrap();
        let store = LocalStore::open(backend, vec![1]).await;
        store.set_table_object(&synced("good", 1), true).await;

        let all = store.get_all_table_objects(1, true).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].uuid, "good");
        assert!(store.get_table_object("bad", Some(1)).await.is_none());
    }
}
