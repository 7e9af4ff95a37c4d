//! Observer interface the host registers with the engine.

use tablesync_common::{TableId, TableObject};

/// Receives local state changes made by the sync engines.
///
/// All methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    /// A table object was written locally. `silent` marks background
    /// changes (payload downloads, push acknowledgements).
    fn table_object_changed(&self, _object: &TableObject, _silent: bool) {}

    /// A table object was removed locally.
    fn table_object_removed(&self, _object: &TableObject) {}

    /// A table finished a pull pass.
    fn table_refreshed(&self, _table_id: TableId, _changed: bool) {}

    /// The local notification set changed.
    fn notifications_changed(&self) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}
