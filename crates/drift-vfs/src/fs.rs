use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::archive::ArchiveHandlerCache;
use crate::path::VfsPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
}

/// The subset of file metadata the VFS caches and diffs during refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileAttributes {
    pub kind: FileKind,
    pub len: u64,
    /// Modification time in milliseconds since the Unix epoch (or a logical clock for
    /// in-memory file systems).
    pub modified: u64,
    pub writable: bool,
    pub hidden: bool,
}

impl FileAttributes {
    pub fn file(len: u64, modified: u64) -> Self {
        Self {
            kind: FileKind::File,
            len,
            modified,
            writable: true,
            hidden: false,
        }
    }

    pub fn directory(modified: u64) -> Self {
        Self {
            kind: FileKind::Directory,
            len: 0,
            modified,
            writable: true,
            hidden: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Whether two snapshots of a file differ in content (as far as metadata can tell).
    pub fn content_differs(&self, other: &FileAttributes) -> bool {
        !self.is_dir() && (self.len != other.len || self.modified != other.modified)
    }

    fn from_metadata(path: &Path, metadata: &fs::Metadata) -> Self {
        let kind = if metadata.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let hidden = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        Self {
            kind,
            len: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            writable: !metadata.permissions().readonly(),
            hidden,
        }
    }
}

/// File system primitive consumed by the refresh machinery.
///
/// The trait is intentionally small so it can be implemented for different backends (local
/// disk, archives, in-memory overlays). Nothing in the VFS assumes a local disk.
pub trait FileSystem: Send + Sync {
    /// Returns whether a path exists.
    fn exists(&self, path: &VfsPath) -> bool {
        self.attributes(path).is_ok()
    }

    /// Lists the names of the direct children of a directory.
    fn list(&self, path: &VfsPath) -> io::Result<Vec<String>>;

    /// Returns the cached-attribute snapshot for a path.
    fn attributes(&self, path: &VfsPath) -> io::Result<FileAttributes>;

    /// Reads the file contents as raw bytes.
    fn read_bytes(&self, path: &VfsPath) -> io::Result<Vec<u8>>;

    /// Replaces the file contents, creating the file if needed.
    fn write_bytes(&self, path: &VfsPath, _contents: &[u8]) -> io::Result<()> {
        Err(unsupported("write", path))
    }

    fn create_dir(&self, path: &VfsPath) -> io::Result<()> {
        Err(unsupported("create directory", path))
    }

    /// Removes a file or a directory tree.
    fn remove(&self, path: &VfsPath) -> io::Result<()> {
        Err(unsupported("remove", path))
    }

    fn rename(&self, from: &VfsPath, _to: &VfsPath) -> io::Result<()> {
        Err(unsupported("rename", from))
    }
}

pub(crate) fn unsupported(op: &str, path: &VfsPath) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{op} not supported ({path})"),
    )
}

impl<F: ?Sized + FileSystem> FileSystem for Arc<F> {
    fn exists(&self, path: &VfsPath) -> bool {
        self.as_ref().exists(path)
    }

    fn list(&self, path: &VfsPath) -> io::Result<Vec<String>> {
        self.as_ref().list(path)
    }

    fn attributes(&self, path: &VfsPath) -> io::Result<FileAttributes> {
        self.as_ref().attributes(path)
    }

    fn read_bytes(&self, path: &VfsPath) -> io::Result<Vec<u8>> {
        self.as_ref().read_bytes(path)
    }

    fn write_bytes(&self, path: &VfsPath, contents: &[u8]) -> io::Result<()> {
        self.as_ref().write_bytes(path, contents)
    }

    fn create_dir(&self, path: &VfsPath) -> io::Result<()> {
        self.as_ref().create_dir(path)
    }

    fn remove(&self, path: &VfsPath) -> io::Result<()> {
        self.as_ref().remove(path)
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath) -> io::Result<()> {
        self.as_ref().rename(from, to)
    }
}

/// Local OS file system implementation.
///
/// [`VfsPath::Archive`] paths are served read-only through a shared [`ArchiveHandlerCache`].
#[derive(Debug, Clone)]
pub struct LocalFs {
    archives: Arc<ArchiveHandlerCache>,
}

impl LocalFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive_cache(archives: Arc<ArchiveHandlerCache>) -> Self {
        Self { archives }
    }

    pub fn archive_cache(&self) -> &Arc<ArchiveHandlerCache> {
        &self.archives
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self {
            archives: Arc::new(ArchiveHandlerCache::default()),
        }
    }
}

impl FileSystem for LocalFs {
    fn exists(&self, path: &VfsPath) -> bool {
        match path {
            VfsPath::Local(path) => path.exists(),
            VfsPath::Archive(path) => self
                .archives
                .handler(&path.archive)
                .is_ok_and(|handler| handler.attributes(&path.entry).is_some()),
        }
    }

    fn list(&self, path: &VfsPath) -> io::Result<Vec<String>> {
        match path {
            VfsPath::Local(path) => {
                let mut out = Vec::new();
                for entry in fs::read_dir(path)? {
                    let entry = entry?;
                    out.push(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(out)
            }
            VfsPath::Archive(archive) => {
                let handler = self.archives.handler(&archive.archive)?;
                handler.children(&archive.entry).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("archive directory not found ({path})"),
                    )
                })
            }
        }
    }

    fn attributes(&self, path: &VfsPath) -> io::Result<FileAttributes> {
        match path {
            VfsPath::Local(local) => {
                let metadata = fs::metadata(local)?;
                Ok(FileAttributes::from_metadata(local, &metadata))
            }
            VfsPath::Archive(archive) => {
                let handler = self.archives.handler(&archive.archive)?;
                handler.attributes(&archive.entry).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("archive entry not found ({path})"),
                    )
                })
            }
        }
    }

    fn read_bytes(&self, path: &VfsPath) -> io::Result<Vec<u8>> {
        match path {
            VfsPath::Local(path) => fs::read(path),
            VfsPath::Archive(archive) => {
                let handler = self.archives.handler(&archive.archive)?;
                handler.read(&archive.entry)
            }
        }
    }

    fn write_bytes(&self, path: &VfsPath, contents: &[u8]) -> io::Result<()> {
        match path {
            VfsPath::Local(local) => fs::write(local, contents),
            VfsPath::Archive(_) => Err(unsupported("write", path)),
        }
    }

    fn create_dir(&self, path: &VfsPath) -> io::Result<()> {
        match path {
            VfsPath::Local(local) => fs::create_dir(local),
            VfsPath::Archive(_) => Err(unsupported("create directory", path)),
        }
    }

    fn remove(&self, path: &VfsPath) -> io::Result<()> {
        match path {
            VfsPath::Local(local) => {
                if fs::symlink_metadata(local)?.is_dir() {
                    fs::remove_dir_all(local)
                } else {
                    fs::remove_file(local)
                }
            }
            VfsPath::Archive(_) => Err(unsupported("remove", path)),
        }
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath) -> io::Result<()> {
        match (from, to) {
            (VfsPath::Local(from), VfsPath::Local(to)) => fs::rename(from, to),
            _ => Err(unsupported("rename", from)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_fs_lists_and_stats() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join(".hidden"), "").unwrap();

        let local = LocalFs::new();
        let root = VfsPath::local(temp.path());
        let mut names = local.list(&root).unwrap();
        names.sort();
        assert_eq!(names, vec![".hidden", "a.txt", "sub"]);

        let attrs = local.attributes(&root.join("a.txt")).unwrap();
        assert_eq!(attrs.kind, FileKind::File);
        assert_eq!(attrs.len, 5);
        assert!(!attrs.hidden);
        assert!(local.attributes(&root.join(".hidden")).unwrap().hidden);
        assert!(local.attributes(&root.join("sub")).unwrap().is_dir());
        assert!(!local.exists(&root.join("missing")));
    }

    #[test]
    fn local_fs_mutations_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let local = LocalFs::new();
        let root = VfsPath::local(temp.path());

        local.create_dir(&root.join("d")).unwrap();
        local.write_bytes(&root.join("d/f.txt"), b"x").unwrap();
        local
            .rename(&root.join("d/f.txt"), &root.join("g.txt"))
            .unwrap();
        assert_eq!(local.read_bytes(&root.join("g.txt")).unwrap(), b"x");
        local.remove(&root.join("d")).unwrap();
        assert!(!local.exists(&root.join("d")));
    }
}
