//! Live update channel: applies change notifications pushed by the server.
//!
//! The server speaks the ActionCable framing: JSON text frames carrying a
//! `type` for control messages, or a `message` object for data.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::context::SyncContext;
use crate::files::{FileDownload, FileDownloadQueue};
use tablesync_common::{Error, Result, UploadStatus};

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    Closed,
    /// The server refused the subscription; terminal.
    Rejected,
}

/// What the connection loop does after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Close,
}

/// A single-object change announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub uuid: String,
    /// `0` created, `1` updated, `2` deleted.
    pub change: u8,
    /// Session that caused the change; `0` when unknown.
    #[serde(default)]
    pub session_id: i64,
}

impl ChangeMessage {
    pub fn is_upsert(&self) -> bool {
        matches!(self.change, 0 | 1)
    }

    pub fn is_delete(&self) -> bool {
        self.change == 2
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<Value>,
}

/// Subscription to the server's table object change stream.
pub struct LiveUpdateChannel {
    ctx: Arc<SyncContext>,
    files: Arc<FileDownloadQueue>,
    state: RwLock<ChannelState>,
}

impl LiveUpdateChannel {
    pub fn new(ctx: Arc<SyncContext>, files: Arc<FileDownloadQueue>) -> Self {
        Self {
            ctx,
            files,
            state: RwLock::new(ChannelState::Connecting),
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Endpoint for a connection token.
    pub fn websocket_url(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("wss://{}/cable", self.ctx.config.live.host))
            .map_err(|e| Error::InvalidInput(format!("Invalid live host: {}", e)))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    /// Subscribe command sent once the socket is open.
    pub fn subscribe_frame(&self) -> String {
        let identifier = serde_json::json!({ "channel": self.ctx.config.live.channel });
        serde_json::json!({
            "command": "subscribe",
            "identifier": identifier.to_string(),
        })
        .to_string()
    }

    /// Connect and apply changes until the server closes the stream or
    /// rejects the subscription. Returns the final state.
    pub async fn run(&self) -> Result<ChannelState> {
        *self.state.write().await = ChannelState::Connecting;

        let remote = &self.ctx.remote;
        let token = self
            .ctx
            .call(|| remote.create_websocket_connection())
            .await?;
        let url = self.websocket_url(&token)?;

        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("Live channel connection failed: {}", e)))?;
        info!("Live channel connected to {}", self.ctx.config.live.host);

        ws.send(Message::Text(self.subscribe_frame()))
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        while let Some(message) = ws.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Live channel error: {}", e);
                    break;
                }
            };

            if self.handle_frame(&text).await == FrameAction::Close {
                if let Err(e) = ws.close(None).await {
                    debug!("Closing live channel failed: {}", e);
                }
                break;
            }
        }

        let mut state = self.state.write().await;
        if *state != ChannelState::Rejected {
            *state = ChannelState::Closed;
        }
        info!("Live channel finished: {:?}", *state);
        Ok(*state)
    }

    /// Process one text frame.
    pub async fn handle_frame(&self, text: &str) -> FrameAction {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring malformed live frame: {}", e);
                return FrameAction::Continue;
            }
        };

        match frame.kind.as_deref() {
            Some("ping") | Some("welcome") => FrameAction::Continue,
            Some("confirm_subscription") => {
                debug!("Live channel subscribed");
                *self.state.write().await = ChannelState::Subscribed;
                FrameAction::Continue
            }
            Some("reject_subscription") => {
                warn!("Live channel subscription rejected");
                *self.state.write().await = ChannelState::Rejected;
                FrameAction::Close
            }
            Some("disconnect") => {
                *self.state.write().await = ChannelState::Closed;
                FrameAction::Close
            }
            Some(other) => {
                debug!("Ignoring live frame of type {}", other);
                FrameAction::Continue
            }
            None => {
                let message = frame
                    .message
                    .and_then(|m| serde_json::from_value::<ChangeMessage>(m).ok());
                match message {
                    Some(message) => {
                        self.apply_change(&message).await;
                    }
                    None => debug!("Ignoring live frame without change"),
                }
                FrameAction::Continue
            }
        }
    }

    /// Apply a change unless it came from this device. Returns whether
    /// local state was touched.
    pub async fn apply_change(&self, message: &ChangeMessage) -> bool {
        if message.session_id == 0 {
            return false;
        }
        let own_session = self
            .ctx
            .store
            .get_session()
            .await
            .and_then(|s| s.session_id);
        if own_session == Some(message.session_id) {
            debug!("Ignoring own change to {}", message.uuid);
            return false;
        }

        if message.is_delete() {
            self.apply_delete(&message.uuid).await
        } else if message.is_upsert() {
            self.apply_upsert(&message.uuid).await
        } else {
            debug!(
                "Ignoring unknown change code {} for {}",
                message.change, message.uuid
            );
            false
        }
    }

    async fn apply_upsert(&self, uuid: &str) -> bool {
        let store = &self.ctx.store;
        let remote = &self.ctx.remote;

        let mut object = match self.ctx.call(|| remote.get_table_object(uuid)).await {
            Ok(object) => object,
            Err(e) => {
                warn!("Failed to fetch changed table object {}: {}", uuid, e);
                return false;
            }
        };
        object.upload_status = UploadStatus::UpToDate;

        let local = store.get_table_object(uuid, Some(object.table_id)).await;
        let download = object.is_file
            && (local.as_ref().map(|l| &l.etag) != Some(&object.etag)
                || !store.has_file(uuid).await);
        if object.is_file && local.is_some() && download {
            store.remove_file(uuid).await;
        }

        if !store.set_table_object(&object, false).await {
            return false;
        }
        let stored = store
            .get_table_object(uuid, Some(object.table_id))
            .await
            .unwrap_or(object);
        self.ctx.observer.table_object_changed(&stored, false);

        if download {
            self.files
                .enqueue(FileDownload {
                    uuid: uuid.to_string(),
                    table_id: stored.table_id,
                    etag: stored.etag.clone().unwrap_or_default(),
                })
                .await;
            self.files.download_files().await;
        }
        true
    }

    async fn apply_delete(&self, uuid: &str) -> bool {
        let store = &self.ctx.store;
        let Some(local) = store.get_table_object(uuid, None).await else {
            return false;
        };
        if !store.remove_table_object(uuid, Some(local.table_id)).await {
            return false;
        }
        self.ctx.observer.table_object_removed(&local);
        true
    }
}
