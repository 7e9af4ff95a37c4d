//! Collaborators shared by the sync engines.

use std::future::Future;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::observer::SyncObserver;
use crate::remote::Remote;
use crate::renewal::{SessionHandler, SessionRenewal};
use tablesync_common::Result;
use tablesync_storage::LocalStore;

/// Store, remote, session handler, observer and configuration, shared by
/// every engine of one [`crate::SyncEngine`].
pub struct SyncContext {
    pub store: Arc<LocalStore>,
    pub remote: Arc<dyn Remote>,
    pub observer: Arc<dyn SyncObserver>,
    pub config: SyncConfig,
    renewal: SessionRenewal,
}

impl SyncContext {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn Remote>,
        session: Arc<dyn SessionHandler>,
        observer: Arc<dyn SyncObserver>,
        config: SyncConfig,
    ) -> Self {
        let renewal = SessionRenewal::new(session, store.clone(), config.max_session_renewals);
        Self {
            store,
            remote,
            observer,
            config,
            renewal,
        }
    }

    /// Run a remote call under the session renewal policy.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.renewal.execute(operation).await
    }

    /// Whether a session is stored locally.
    pub async fn is_authenticated(&self) -> bool {
        self.store.get_session().await.is_some()
    }

    /// Log out through the session handler.
    pub async fn logout(&self) {
        self.renewal.handler().logout().await;
    }
}
