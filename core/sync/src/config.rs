//! Sync configuration.

use serde::{Deserialize, Serialize};

use crate::scheduler::SyncMode;
use tablesync_common::TableId;

/// Configuration of the live update channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Host serving the `/cable` endpoint.
    pub host: String,
    /// Channel named in the subscribe command.
    pub channel: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            host: "dav-backend.herokuapp.com".to_string(),
            channel: "TableObjectUpdateChannel".to_string(),
        }
    }
}

/// Configuration for the sync engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tables mirrored by this application, in pull order.
    pub table_ids: Vec<TableId>,
    /// Tables whose pages are interleaved one page per round.
    pub parallel_table_ids: Vec<TableId>,
    /// Properties sent per create/update request; larger sets are chunked.
    pub max_properties_per_request: usize,
    /// Session renewals attempted per remote call before giving up.
    pub max_session_renewals: u32,
    /// Live update channel.
    pub live: LiveConfig,
    /// Scheduler mode.
    pub sync_mode: SyncMode,
}

impl SyncConfig {
    /// Configuration for the given tables with default limits.
    pub fn for_tables(table_ids: Vec<TableId>) -> Self {
        Self {
            table_ids,
            ..Self::default()
        }
    }

    /// Set the parallel tables.
    pub fn with_parallel_tables(mut self, parallel_table_ids: Vec<TableId>) -> Self {
        self.parallel_table_ids = parallel_table_ids;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            table_ids: Vec::new(),
            parallel_table_ids: Vec::new(),
            max_properties_per_request: 100,
            max_session_renewals: 1,
            live: LiveConfig::default(),
            sync_mode: SyncMode::Manual,
        }
    }
}
