//! Common utilities and types shared across the tablesync crates.
//!
//! This module provides the mirrored entity model and the error taxonomy
//! used by the local store and the sync engines.

pub mod error;
pub mod types;

pub use error::{Error, RemoteError, Result};
pub use types::{
    Notification, Properties, Property, PropertyOrigin, PropertyValue, Session, TableId,
    TableObject, UploadStatus, User, WebPushSubscription, EXT_PROPERTY,
};
