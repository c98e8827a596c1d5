//! Cached virtual file system with background refresh.
//!
//! The VFS keeps a lazily populated tree of file records, each identified by a stable
//! [`FileId`]. The tree drifts out of sync with disk whenever something outside the process
//! touches the file system; a refresh brings it back:
//!
//! - a [`RefreshSession`] names the roots to rescan,
//! - the [`RefreshWorker`] diffs cached records against the [`FileSystem`] and produces
//!   [`ChangeEvent`]s without holding any lock,
//! - the session then takes the model write lock, drops events that went stale in the meantime,
//!   and delivers the batch to every [`BulkFileListener`] around applying it to the cache.
//!
//! Asynchronous sessions are serialized on a single worker thread owned by the
//! [`RefreshQueue`]; synchronous sessions run on the caller.

mod archive;
mod cache;
mod dispatch;
mod error;
mod event;
mod fs;
mod listener;
mod memory_fs;
mod path;
mod progress;
mod queue;
mod session;
mod vfs;
mod worker;

pub use archive::{ArchiveHandler, ArchiveHandlerCache};
pub use cache::{CachedFile, VfsCache};
pub use dispatch::merge_events;
pub use drift_core::FileId;
pub use error::{Result, VfsError};
pub use event::{ChangeEvent, ChangeKind, FileProperty, PropertyValue};
pub use fs::{FileAttributes, FileKind, FileSystem, LocalFs};
pub use listener::{BulkFileListener, ListenerId};
pub use memory_fs::MemoryFs;
pub use path::{ArchivePath, VfsPath};
pub use progress::{RefreshProgress, RefreshProgressEvent, RefreshProgressReceiver};
pub use queue::RefreshQueue;
pub use session::{FinishCallback, RefreshSession, SessionId, SessionState};
pub use vfs::Vfs;
pub use worker::{RefreshWorker, ScanOutcome};

/// Lexically normalizes a local filesystem path using the same rules as [`VfsPath::local`].
///
/// This does not hit the filesystem and does not resolve symlinks.
pub fn normalize_local_path(path: &std::path::Path) -> std::path::PathBuf {
    crate::path::normalize_local_path(path)
}
