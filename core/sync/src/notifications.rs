//! Notification and web push subscription sync.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use tablesync_common::{Error, Notification, RemoteError, Result, UploadStatus};

/// Mirrors scheduled notifications and registers this device's web push
/// subscription.
pub struct NotificationSync {
    ctx: Arc<SyncContext>,
}

impl NotificationSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Push dirty notifications. Returns how many were pushed or removed.
    ///
    /// # Errors
    /// - `SessionInvalid` after logging out; remaining notifications are
    ///   left dirty
    pub async fn push_notifications(&self) -> Result<usize> {
        let store = &self.ctx.store;
        let remote = &self.ctx.remote;
        let mut synced = 0;

        for notification in store.get_all_notifications(true).await {
            let result = match notification.upload_status {
                UploadStatus::New => self
                    .ctx
                    .call(|| remote.create_notification(&notification))
                    .await
                    .map(|()| true),
                UploadStatus::Updated => self
                    .ctx
                    .call(|| remote.update_notification(&notification))
                    .await
                    .map(|()| true),
                UploadStatus::Deleted | UploadStatus::Removed => {
                    match self
                        .ctx
                        .call(|| remote.delete_notification(&notification.uuid))
                        .await
                    {
                        Ok(()) => Ok(false),
                        Err(e) if e.remote() == Some(&RemoteError::TableObjectDoesNotExist) => {
                            Ok(false)
                        }
                        Err(e) => Err(e),
                    }
                }
                UploadStatus::UpToDate => continue,
            };

            match result {
                Ok(true) => {
                    let mut pushed = notification.clone();
                    pushed.upload_status = UploadStatus::UpToDate;
                    store.set_notification(&pushed).await;
                    synced += 1;
                }
                Ok(false) => {
                    store.remove_notification(&notification.uuid).await;
                    synced += 1;
                }
                Err(Error::SessionInvalid) => {
                    warn!("Session invalid while pushing notifications, logging out");
                    self.ctx.logout().await;
                    return Err(Error::SessionInvalid);
                }
                Err(e) => warn!("Failed to push notification {}: {}", notification.uuid, e),
            }
        }

        if synced > 0 {
            debug!("Pushed {} notifications", synced);
        }
        Ok(synced)
    }

    /// Replace clean local notifications with the remote list. Dirty local
    /// notifications are kept. Returns whether anything changed.
    pub async fn pull_notifications(&self) -> Result<bool> {
        let store = &self.ctx.store;
        let remote = &self.ctx.remote;

        let notifications: Vec<Notification> =
            self.ctx.call(|| remote.get_notifications()).await?;
        let remote_uuids: HashSet<&str> = notifications.iter().map(|n| n.uuid.as_str()).collect();
        let mut changed = false;

        for local in store.get_all_notifications(true).await {
            if local.upload_status == UploadStatus::UpToDate
                && !remote_uuids.contains(local.uuid.as_str())
            {
                store.remove_notification(&local.uuid).await;
                changed = true;
            }
        }

        for mut notification in notifications {
            notification.upload_status = UploadStatus::UpToDate;
            match store.get_notification(&notification.uuid).await {
                Some(local) if local.upload_status.is_dirty() => continue,
                Some(local) if local == notification => continue,
                _ => {}
            }
            store.set_notification(&notification).await;
            changed = true;
        }

        if changed {
            info!("Notifications updated from remote");
            self.ctx.observer.notifications_changed();
        }
        Ok(changed)
    }

    /// Register a new web push subscription remotely. Returns whether one
    /// was created.
    pub async fn push_web_push_subscription(&self) -> Result<bool> {
        let store = &self.ctx.store;
        let remote = &self.ctx.remote;

        let Some(mut subscription) = store.get_web_push_subscription().await else {
            return Ok(false);
        };
        if subscription.upload_status != UploadStatus::New {
            return Ok(false);
        }

        if let Err(e) = self
            .ctx
            .call(|| remote.create_web_push_subscription(&subscription))
            .await
        {
            if matches!(e, Error::SessionInvalid) {
                self.ctx.logout().await;
            }
            return Err(e);
        }

        subscription.upload_status = UploadStatus::UpToDate;
        store.set_web_push_subscription(&subscription).await;
        debug!("Web push subscription {} registered", subscription.uuid);
        Ok(true)
    }
}
