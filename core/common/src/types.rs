//! Entity types mirrored between the local store and the server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a logical table.
///
/// `-1` is used by the local store to mean "every table".
pub type TableId = i32;

/// Reserved property carrying the extension of a file table object.
pub const EXT_PROPERTY: &str = "ext";

/// Property bag of a table object.
pub type Properties = BTreeMap<String, Property>;

/// Local dirty/clean state of an entity awaiting push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    /// In sync with the server.
    UpToDate,
    /// Created locally, not yet known to the server.
    New,
    /// Modified locally after the last sync.
    Updated,
    /// Deleted locally, delete not yet pushed.
    Deleted,
    /// Access revoked locally, revocation not yet pushed.
    Removed,
}

impl UploadStatus {
    /// Whether the entity has local changes waiting for the server.
    pub fn is_dirty(self) -> bool {
        self != UploadStatus::UpToDate
    }

    /// Whether the entity is logically gone on this device.
    pub fn is_deleted(self) -> bool {
        matches!(self, UploadStatus::Deleted | UploadStatus::Removed)
    }
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl PropertyValue {
    /// The text value, if this is a text property.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Text(s)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n as f64)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Where a property value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyOrigin {
    /// Synchronized with the server.
    #[default]
    Remote,
    /// Exists only on this device; never sent to or replaced by the server.
    LocalOnly,
}

fn is_remote(origin: &PropertyOrigin) -> bool {
    *origin == PropertyOrigin::Remote
}

/// A property value together with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value: PropertyValue,
    #[serde(default, skip_serializing_if = "is_remote")]
    pub origin: PropertyOrigin,
}

impl Property {
    /// A property synchronized with the server.
    pub fn remote(value: impl Into<PropertyValue>) -> Self {
        Self {
            value: value.into(),
            origin: PropertyOrigin::Remote,
        }
    }

    /// A device-only property.
    pub fn local(value: impl Into<PropertyValue>) -> Self {
        Self {
            value: value.into(),
            origin: PropertyOrigin::LocalOnly,
        }
    }

    /// Whether the property must stay on this device.
    pub fn is_local(&self) -> bool {
        self.origin == PropertyOrigin::LocalOnly
    }
}

/// One synchronized record of a logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableObject {
    pub uuid: String,
    pub table_id: TableId,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub properties: Properties,
    pub upload_status: UploadStatus,
    /// Server version tag; `None` until the object was synced once.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub belongs_to_user: bool,
    #[serde(default)]
    pub purchase: Option<String>,
}

impl TableObject {
    /// Create a new, never-synced table object with a random uuid.
    pub fn new(table_id: TableId) -> Self {
        Self::with_uuid(Uuid::new_v4().to_string(), table_id)
    }

    /// Create a new, never-synced table object with the given uuid.
    pub fn with_uuid(uuid: impl Into<String>, table_id: TableId) -> Self {
        Self {
            uuid: uuid.into(),
            table_id,
            is_file: false,
            properties: Properties::new(),
            upload_status: UploadStatus::New,
            etag: None,
            belongs_to_user: true,
            purchase: None,
        }
    }

    /// Builder-style setter for a synchronized property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Set a synchronized property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), Property::remote(value));
    }

    /// Set a device-only property.
    pub fn set_local_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), Property::local(value));
    }

    /// Get the value of a property.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name).map(|p| &p.value)
    }

    /// Remove a property, returning it.
    pub fn remove_property(&mut self, name: &str) -> Option<Property> {
        self.properties.remove(name)
    }

    /// The extension of a file table object.
    pub fn ext(&self) -> Option<&str> {
        self.property(EXT_PROPERTY).and_then(PropertyValue::as_text)
    }

    /// Properties that may be transmitted to the server.
    pub fn remote_properties(&self) -> BTreeMap<String, PropertyValue> {
        self.properties
            .iter()
            .filter(|(_, p)| !p.is_local())
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect()
    }

    /// Copy every device-only property of `prior` that this object does
    /// not define itself.
    pub fn merge_local_properties(&mut self, prior: &TableObject) {
        for (name, property) in &prior.properties {
            if property.is_local() && !self.properties.contains_key(name) {
                self.properties.insert(name.clone(), property.clone());
            }
        }
    }
}

/// A scheduled notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub uuid: String,
    /// Unix timestamp (seconds) of the first delivery.
    pub time: i64,
    /// Repeat interval in seconds; `0` for one-shot notifications.
    pub interval: i64,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    pub upload_status: UploadStatus,
}

impl Notification {
    /// Create a new, never-synced notification.
    pub fn new(time: i64, interval: i64) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            time,
            interval,
            properties: BTreeMap::new(),
            upload_status: UploadStatus::New,
        }
    }
}

/// Web push subscription of this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebPushSubscription {
    pub uuid: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub upload_status: UploadStatus,
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    /// Server id of the session, used to recognize this device's own
    /// writes on the live channel.
    #[serde(default)]
    pub session_id: Option<i64>,
    pub upload_status: UploadStatus,
}

impl Session {
    pub fn new(access_token: impl Into<String>, session_id: Option<i64>) -> Self {
        Self {
            access_token: access_token.into(),
            session_id,
            upload_status: UploadStatus::UpToDate,
        }
    }
}

/// Cached user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Storage quota in bytes.
    pub total_storage: u64,
    /// Storage in use in bytes.
    pub used_storage: u64,
}

impl User {
    /// Whether `bytes` more can be uploaded without exceeding the quota.
    pub fn has_room_for(&self, bytes: u64) -> bool {
        self.used_storage.saturating_add(bytes) <= self.total_storage
    }
}
