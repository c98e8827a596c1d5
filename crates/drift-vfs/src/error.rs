use std::io;

use drift_core::FileId;
use thiserror::Error;

use crate::path::VfsPath;
use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: VfsPath,
        #[source]
        source: io::Error,
    },
    #[error("no such file: {0}")]
    NotFound(VfsPath),
    #[error("not a directory: {0}")]
    NotADirectory(VfsPath),
    #[error("file already exists: {0}")]
    AlreadyExists(VfsPath),
    #[error("file {0} is no longer valid")]
    InvalidFile(FileId),
    #[error("synchronous refresh requested while holding the read lock")]
    ReadLockHeld,
    #[error("refresh queue is shut down")]
    QueueClosed,
    #[error("refresh queue is full")]
    QueueFull,
    #[error("refresh session {0} was already executed")]
    AlreadyExecuted(SessionId),
    #[error("failed to spawn refresh worker: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] drift_config::ConfigError),
    #[error("file listener failed: {0:#}")]
    Listener(anyhow::Error),
}

impl VfsError {
    pub(crate) fn io(path: &VfsPath, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound(path.clone()),
            io::ErrorKind::AlreadyExists => VfsError::AlreadyExists(path.clone()),
            _ => VfsError::Io {
                path: path.clone(),
                source,
            },
        }
    }
}

pub type Result<T, E = VfsError> = std::result::Result<T, E>;
