//! Remote collaborator trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tablesync_common::{Notification, PropertyValue, Result, TableId, TableObject, WebPushSubscription};

/// Identity and version of one table object on a table page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableObjectSummary {
    pub uuid: String,
    pub etag: String,
}

/// One page of a remote table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePage {
    /// Total number of pages of the table.
    pub pages: u32,
    pub table_objects: Vec<TableObjectSummary>,
}

/// Request to create a table object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTableObject {
    pub uuid: String,
    pub table_id: TableId,
    pub is_file: bool,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Server operations consumed by the sync engines.
///
/// Implementations own transport, authentication headers and field
/// mapping. Server-side conflicts are reported as
/// [`tablesync_common::Error::Remote`], network failures as
/// [`tablesync_common::Error::Transport`].
///
/// Objects returned by the server carry only `Remote`-origin properties.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Fetch one page (1-based) of a table.
    async fn get_table(&self, table_id: TableId, page: u32) -> Result<TablePage>;

    /// Fetch the full table object.
    async fn get_table_object(&self, uuid: &str) -> Result<TableObject>;

    /// Create a table object; returns the created entity with its etag.
    async fn create_table_object(&self, object: NewTableObject) -> Result<TableObject>;

    /// Update properties of a table object; returns the entity with its
    /// new etag.
    async fn update_table_object(
        &self,
        uuid: &str,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<TableObject>;

    /// Delete a table object owned by the user.
    async fn delete_table_object(&self, uuid: &str) -> Result<()>;

    /// Revoke the user's access to a table object owned by someone else.
    async fn remove_table_object(&self, uuid: &str) -> Result<()>;

    /// Upload the payload of a file table object.
    async fn set_table_object_file(&self, uuid: &str, data: Vec<u8>) -> Result<TableObject>;

    /// Download the payload of a file table object.
    async fn get_table_object_file(&self, uuid: &str) -> Result<Vec<u8>>;

    async fn get_notifications(&self) -> Result<Vec<Notification>>;

    async fn create_notification(&self, notification: &Notification) -> Result<()>;

    async fn update_notification(&self, notification: &Notification) -> Result<()>;

    async fn delete_notification(&self, uuid: &str) -> Result<()>;

    async fn create_web_push_subscription(&self, subscription: &WebPushSubscription) -> Result<()>;

    /// Obtain a token for opening the live update socket.
    async fn create_websocket_connection(&self) -> Result<String>;
}
