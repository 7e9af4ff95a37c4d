//! Local persistence for mirrored entities.
//!
//! A [`KeyValueStore`] backend holds raw bytes under string keys and supports
//! prefix scans in insertion order. [`LocalStore`] layers the typed entity
//! operations and the merge-on-write policy for device-only properties on top.
//!
//! # Key schema
//! - `tableObject:<tableId>/<uuid>` and `tableObjectFile:<uuid>`
//! - `notification:<uuid>`
//! - `session`, `user`, `webPushSubscription`

pub mod backend;
pub mod local;
pub mod memory;
pub mod registry;
pub mod store;

pub use backend::KeyValueStore;
pub use local::FileBackend;
pub use memory::MemoryBackend;
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
pub use store::{keys, LocalStore};
