//! Bounded session renewal for remote calls.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use tablesync_common::{Error, RemoteError, Result, Session};
use tablesync_storage::LocalStore;

/// Authentication collaborator.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Renew the access token of the current session.
    async fn renew_session(&self) -> Result<Session>;

    /// Drop the session and every user-bound state.
    async fn logout(&self);
}

/// Runs remote operations, renewing an expired session a bounded number
/// of times.
pub struct SessionRenewal {
    handler: Arc<dyn SessionHandler>,
    store: Arc<LocalStore>,
    max_renewals: u32,
}

impl SessionRenewal {
    /// Create a renewal policy allowing `max_renewals` renewals per call.
    pub fn new(handler: Arc<dyn SessionHandler>, store: Arc<LocalStore>, max_renewals: u32) -> Self {
        Self {
            handler,
            store,
            max_renewals,
        }
    }

    /// Execute `operation`. On `SessionExpired` the session is renewed and
    /// the operation retried, at most `max_renewals` times.
    ///
    /// # Errors
    /// - `SessionInvalid` if renewal fails or the session keeps expiring
    /// - Any other error of the operation
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut renewals = 0;

        loop {
            match operation().await {
                Err(Error::Remote(RemoteError::SessionExpired)) => {
                    if renewals >= self.max_renewals {
                        warn!("Session still expired after {} renewals", renewals);
                        return Err(Error::SessionInvalid);
                    }
                    renewals += 1;

                    match self.handler.renew_session().await {
                        Ok(session) => {
                            debug!("Session renewed, retrying operation");
                            self.store.set_session(&session).await;
                        }
                        Err(e) => {
                            warn!("Session renewal failed: {}", e);
                            return Err(Error::SessionInvalid);
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// The authentication collaborator.
    pub fn handler(&self) -> &Arc<dyn SessionHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSession;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tablesync_storage::MemoryBackend;

    async fn renewal(handler: Arc<TestSession>, max: u32) -> (SessionRenewal, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::open(Arc::new(MemoryBackend::new()), vec![]).await);
        (SessionRenewal::new(handler, store.clone(), max), store)
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let handler = Arc::new(TestSession::default());
        let (renewal, _) = renewal(handler.clone(), 1).await;

        let result = renewal.execute(|| async { Ok(5) }).await.unwrap();
        assert_eq!(result, 5);
        assert_eq!(handler.renewals(), 0);
    }

    #[tokio::test]
    async fn test_retries_once_after_renewal() {
        let handler = Arc::new(TestSession::default());
        let (renewal, store) = renewal(handler.clone(), 1).await;
        let attempts = AtomicU32::new(0);

        let result = renewal
            .execute(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Remote(RemoteError::SessionExpired))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handler.renewals(), 1);
        assert_eq!(store.get_session().await.unwrap().access_token, "renewed-1");
    }

    #[tokio::test]
    async fn test_persistent_expiry_is_bounded() {
        let handler = Arc::new(TestSession::default());
        let (renewal, _) = renewal(handler.clone(), 1).await;
        let attempts = AtomicU32::new(0);

        let result: Result<()> = renewal
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Remote(RemoteError::SessionExpired))
            })
            .await;

        assert!(matches!(result, Err(Error::SessionInvalid)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handler.renewals(), 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_is_session_invalid() {
        let handler = Arc::new(TestSession::failing());
        let (renewal, _) = renewal(handler.clone(), 1).await;

        let result: Result<()> = renewal
            .execute(|| async { Err(Error::Remote(RemoteError::SessionExpired)) })
            .await;

        assert!(matches!(result, Err(Error::SessionInvalid)));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let handler = Arc::new(TestSession::default());
        let (renewal, _) = renewal(handler.clone(), 1).await;
        let attempts = AtomicU32::new(0);

        let result: Result<()> = renewal
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transport("offline".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
