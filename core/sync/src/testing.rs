//! Shared test doubles.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::memory::MemoryRemote;
use crate::observer::SyncObserver;
use crate::renewal::SessionHandler;
use tablesync_common::{Error, Result, Session, TableId, TableObject};
use tablesync_storage::{KeyValueStore, LocalStore, MemoryBackend};

#[derive(Default)]
pub(crate) struct TestSession {
    renewals: AtomicU32,
    logouts: AtomicU32,
    fail: bool,
}

impl TestSession {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }

    pub(crate) fn logouts(&self) -> u32 {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandler for TestSession {
    async fn renew_session(&self) -> Result<Session> {
        if self.fail {
            return Err(Error::Transport("renewal refused".to_string()));
        }
        let n = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session::new(format!("renewed-{}", n), Some(1)))
    }

    async fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Changed(String, bool),
    Removed(String),
    Refreshed(TableId, bool),
    Notifications,
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl SyncObserver for RecordingObserver {
    fn table_object_changed(&self, object: &TableObject, silent: bool) {
        self.push(Event::Changed(object.uuid.clone(), silent));
    }

    fn table_object_removed(&self, object: &TableObject) {
        self.push(Event::Removed(object.uuid.clone()));
    }

    fn table_refreshed(&self, table_id: TableId, changed: bool) {
        self.push(Event::Refreshed(table_id, changed));
    }

    fn notifications_changed(&self) {
        self.push(Event::Notifications);
    }
}

pub(crate) struct Harness {
    pub ctx: Arc<SyncContext>,
    pub store: Arc<LocalStore>,
    pub remote: Arc<MemoryRemote>,
    pub observer: Arc<RecordingObserver>,
    pub session: Arc<TestSession>,
}

/// Logged-in harness over a memory store and a remote with two objects
/// per page.
pub(crate) async fn harness(table_ids: Vec<TableId>) -> Harness {
    harness_with(SyncConfig::for_tables(table_ids), 2).await
}

pub(crate) async fn harness_with(config: SyncConfig, page_size: usize) -> Harness {
    harness_on(Arc::new(MemoryBackend::new()), config, page_size).await
}

pub(crate) async fn harness_on(
    backend: Arc<dyn KeyValueStore>,
    config: SyncConfig,
    page_size: usize,
) -> Harness {
    let store = Arc::new(LocalStore::open(backend, config.table_ids.clone()).await);
    store.set_session(&Session::new("token", Some(1))).await;

    let remote = Arc::new(MemoryRemote::new(page_size));
    let observer = Arc::new(RecordingObserver::default());
    let session = Arc::new(TestSession::default());
    let ctx = Arc::new(SyncContext::new(
        store.clone(),
        remote.clone(),
        session.clone(),
        observer.clone(),
        config,
    ));

    Harness {
        ctx,
        store,
        remote,
        observer,
        session,
    }
}
