//! Tablesync replication engine
//!
//! Keeps a local mirror of remote, paginated tables consistent with the
//! server:
//! - Pull: walks remote pages in sequencer order and reconciles by etag
//! - Push: replays locally dirty entities against the server
//! - Deferred file payload downloads
//! - Live updates from the server's change channel
//! - Single-worker scheduling with on-demand and periodic modes

pub mod config;
pub mod context;
pub mod engine;
pub mod files;
pub mod live;
pub mod memory;
pub mod notifications;
pub mod observer;
pub mod pull;
pub mod push;
pub mod remote;
pub mod renewal;
pub mod scheduler;
pub mod sequencer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use config::{LiveConfig, SyncConfig};
pub use context::SyncContext;
pub use engine::SyncEngine;
pub use files::{FileDownload, FileDownloadQueue};
pub use live::{ChangeMessage, ChannelState, FrameAction, LiveUpdateChannel};
pub use memory::MemoryRemote;
pub use notifications::NotificationSync;
pub use observer::{NoopObserver, SyncObserver};
pub use pull::{PullEngine, PullReport};
pub use push::{PushEngine, PushReport};
pub use remote::{NewTableObject, Remote, TableObjectSummary, TablePage};
pub use renewal::{SessionHandler, SessionRenewal};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle, SyncSummary};
pub use sequencer::sort_table_ids;
