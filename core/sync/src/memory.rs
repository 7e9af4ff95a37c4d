//! In-memory remote for testing.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

use crate::remote::{NewTableObject, Remote, TableObjectSummary, TablePage};
use tablesync_common::{
    Error, Notification, PropertyValue, RemoteError, Result, TableId, TableObject, UploadStatus,
    WebPushSubscription,
};

#[derive(Debug, Clone)]
enum Failure {
    Remote(RemoteError),
    Transport,
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Failure::Remote(e) => Error::Remote(e.clone()),
            Failure::Transport => Error::Transport("injected transport failure".to_string()),
        }
    }
}

struct InjectedFailure {
    op: String,
    target: Option<String>,
    failure: Failure,
}

impl InjectedFailure {
    fn matches(&self, op: &str, target: &str) -> bool {
        self.op == op
            && match &self.target {
                None => true,
                Some(t) => target == t || target.starts_with(&format!("{}/", t)),
            }
    }
}

#[derive(Default)]
struct RemoteState {
    objects: IndexMap<String, TableObject>,
    files: HashMap<String, Vec<u8>>,
    notifications: IndexMap<String, Notification>,
    web_push: Option<WebPushSubscription>,
    failures: Vec<InjectedFailure>,
    expirations: u32,
    calls: Vec<String>,
    etag_counter: u64,
}

impl RemoteState {
    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("etag-{}", self.etag_counter)
    }
}

/// In-memory server.
///
/// Serves tables in pages of `page_size` objects and records every call
/// as `"<op>:<target>"`. Failures can be injected per operation and
/// target, and calls can be held at a gate to simulate slow requests.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    page_size: usize,
}

impl MemoryRemote {
    /// Create an empty remote serving `page_size` objects per page.
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            gate: Mutex::new(None),
            page_size: page_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object server-side with a fresh etag. Device-only
    /// properties are dropped.
    pub fn put_object(&self, object: &TableObject) -> String {
        let mut state = self.lock();
        let etag = state.next_etag();
        let mut stored = object.clone();
        stored.properties.retain(|_, p| !p.is_local());
        stored.upload_status = UploadStatus::UpToDate;
        stored.etag = Some(etag.clone());
        state.objects.insert(stored.uuid.clone(), stored);
        etag
    }

    /// The server-side copy of an object.
    pub fn object(&self, uuid: &str) -> Option<TableObject> {
        self.lock().objects.get(uuid).cloned()
    }

    /// Delete an object server-side.
    pub fn delete_object(&self, uuid: &str) {
        let mut state = self.lock();
        state.objects.shift_remove(uuid);
        state.files.remove(uuid);
    }

    /// Store a payload server-side without changing the object's etag.
    pub fn set_file(&self, uuid: &str, data: Vec<u8>) {
        self.lock().files.insert(uuid.to_string(), data);
    }

    /// The server-side payload of an object.
    pub fn file(&self, uuid: &str) -> Option<Vec<u8>> {
        self.lock().files.get(uuid).cloned()
    }

    /// Store a notification server-side.
    pub fn put_notification(&self, notification: &Notification) {
        let mut stored = notification.clone();
        stored.upload_status = UploadStatus::UpToDate;
        self.lock()
            .notifications
            .insert(stored.uuid.clone(), stored);
    }

    /// Server-side notifications.
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.values().cloned().collect()
    }

    /// The registered web push subscription.
    pub fn web_push_subscription(&self) -> Option<WebPushSubscription> {
        self.lock().web_push.clone()
    }

    /// Fail every `op` call (on `target`, or on any target) with `error`.
    pub fn fail(&self, op: &str, target: Option<&str>, error: RemoteError) {
        self.inject(op, target, Failure::Remote(error));
    }

    /// Fail every `op` call (on `target`, or on any target) with a
    /// transport error.
    pub fn fail_transport(&self, op: &str, target: Option<&str>) {
        self.inject(op, target, Failure::Transport);
    }

    fn inject(&self, op: &str, target: Option<&str>, failure: Failure) {
        self.lock().failures.push(InjectedFailure {
            op: op.to_string(),
            target: target.map(String::from),
            failure,
        });
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Answer the next `times` calls with `SessionExpired`.
    pub fn expire_session(&self, times: u32) {
        self.lock().expirations = times;
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Hold every following call until permits are added to the returned
    /// semaphore.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate.clone());
        gate
    }

    async fn begin(&self, op: &str, target: &str) -> Result<()> {
        self.lock().calls.push(format!("{}:{}", op, target));

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Transport("gate closed".to_string()))?;
            permit.forget();
        }

        let mut state = self.lock();
        if state.expirations > 0 {
            state.expirations -= 1;
            return Err(Error::Remote(RemoteError::SessionExpired));
        }
        if let Some(failure) = state.failures.iter().find(|f| f.matches(op, target)) {
            return Err(failure.failure.to_error());
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new(50)
    }
}

fn missing() -> Error {
    Error::Remote(RemoteError::TableObjectDoesNotExist)
}

#[async_trait]
impl Remote for MemoryRemote {
    async fn get_table(&self, table_id: TableId, page: u32) -> Result<TablePage> {
        self.begin("get_table", &format!("{}/{}", table_id, page))
            .await?;
        let state = self.lock();

        let summaries: Vec<TableObjectSummary> = state
            .objects
            .values()
            .filter(|o| o.table_id == table_id)
            .map(|o| TableObjectSummary {
                uuid: o.uuid.clone(),
                etag: o.etag.clone().unwrap_or_default(),
            })
            .collect();

        let pages = summaries.len().div_ceil(self.page_size) as u32;
        let start = (page.max(1) as usize - 1) * self.page_size;
        let table_objects = summaries
            .into_iter()
            .skip(start)
            .take(self.page_size)
            .collect();

        Ok(TablePage {
            pages,
            table_objects,
        })
    }

    async fn get_table_object(&self, uuid: &str) -> Result<TableObject> {
        self.begin("get_object", uuid).await?;
        self.lock().objects.get(uuid).cloned().ok_or_else(missing)
    }

    async fn create_table_object(&self, object: NewTableObject) -> Result<TableObject> {
        self.begin("create", &object.uuid).await?;
        let mut state = self.lock();
        if state.objects.contains_key(&object.uuid) {
            return Err(Error::Remote(RemoteError::UuidAlreadyInUse));
        }

        let mut created = TableObject::with_uuid(object.uuid.clone(), object.table_id);
        created.is_file = object.is_file;
        for (name, value) in object.properties {
            created.set_property(name, value);
        }
        created.upload_status = UploadStatus::UpToDate;
        created.etag = Some(state.next_etag());
        state.objects.insert(object.uuid, created.clone());
        Ok(created)
    }

    async fn update_table_object(
        &self,
        uuid: &str,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<TableObject> {
        self.begin("update", uuid).await?;
        let mut state = self.lock();
        let etag = state.next_etag();
        let object = state.objects.get_mut(uuid).ok_or_else(missing)?;
        for (name, value) in properties {
            object.set_property(name, value);
        }
        object.etag = Some(etag);
        Ok(object.clone())
    }

    async fn delete_table_object(&self, uuid: &str) -> Result<()> {
        self.begin("delete", uuid).await?;
        let mut state = self.lock();
        state.objects.shift_remove(uuid).ok_or_else(missing)?;
        state.files.remove(uuid);
        Ok(())
    }

    async fn remove_table_object(&self, uuid: &str) -> Result<()> {
        self.begin("remove", uuid).await?;
        let mut state = self.lock();
        state
            .objects
            .shift_remove(uuid)
            .ok_or(Error::Remote(RemoteError::UserAccessDoesNotExist))?;
        Ok(())
    }

    async fn set_table_object_file(&self, uuid: &str, data: Vec<u8>) -> Result<TableObject> {
        self.begin("set_file", uuid).await?;
        let mut state = self.lock();
        if !state.objects.contains_key(uuid) {
            return Err(missing());
        }
        let etag = state.next_etag();
        state.files.insert(uuid.to_string(), data);
        let object = state.objects.get_mut(uuid).ok_or_else(missing)?;
        object.etag = Some(etag);
        Ok(object.clone())
    }

    async fn get_table_object_file(&self, uuid: &str) -> Result<Vec<u8>> {
        self.begin("get_file", uuid).await?;
        self.lock().files.get(uuid).cloned().ok_or_else(missing)
    }

    async fn get_notifications(&self) -> Result<Vec<Notification>> {
        self.begin("get_notifications", "").await?;
        Ok(self.notifications())
    }

    async fn create_notification(&self, notification: &Notification) -> Result<()> {
        self.begin("create_notification", &notification.uuid).await?;
        self.put_notification(notification);
        Ok(())
    }

    async fn update_notification(&self, notification: &Notification) -> Result<()> {
        self.begin("update_notification", &notification.uuid).await?;
        if !self.lock().notifications.contains_key(&notification.uuid) {
            return Err(missing());
        }
        self.put_notification(notification);
        Ok(())
    }

    async fn delete_notification(&self, uuid: &str) -> Result<()> {
        self.begin("delete_notification", uuid).await?;
        self.lock()
            .notifications
            .shift_remove(uuid)
            .ok_or_else(missing)?;
        Ok(())
    }

    async fn create_web_push_subscription(&self, subscription: &WebPushSubscription) -> Result<()> {
        self.begin("create_web_push", &subscription.uuid).await?;
        let mut stored = subscription.clone();
        stored.upload_status = UploadStatus::UpToDate;
        self.lock().web_push = Some(stored);
        Ok(())
    }

    async fn create_websocket_connection(&self) -> Result<String> {
        self.begin("create_websocket", "").await?;
        Ok("ws-token".to_string())
    }
}
