use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use lru::LruCache;
use parking_lot::Mutex;
use zip::ZipArchive;

use crate::event::ChangeEvent;
use crate::fs::FileAttributes;
use crate::listener::BulkFileListener;
use crate::path::VfsPath;

/// Length and modification time of an archive file when its handler was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArchiveStamp {
    len: u64,
    modified: u64,
}

impl ArchiveStamp {
    fn of(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Ok(Self {
            len: metadata.len(),
            modified,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ArchiveEntry {
    is_dir: bool,
    len: u64,
}

/// Parsed entry table of a single zip/jar archive.
///
/// Directories that only exist implicitly (as a prefix of some entry name) are synthesized so
/// that the archive can be walked like any other directory tree. Entries share the archive's
/// own modification time.
#[derive(Debug)]
pub struct ArchiveHandler {
    path: PathBuf,
    stamp: ArchiveStamp,
    entries: BTreeMap<String, ArchiveEntry>,
    children: BTreeMap<String, BTreeSet<String>>,
}

impl ArchiveHandler {
    pub fn open(path: &Path) -> io::Result<Self> {
        let stamp = ArchiveStamp::of(path)?;
        let file = File::open(path)?;
        let mut zip = ZipArchive::new(file).map_err(zip_error)?;

        let mut entries = BTreeMap::new();
        let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        entries.insert(
            String::new(),
            ArchiveEntry {
                is_dir: true,
                len: 0,
            },
        );
        children.insert(String::new(), BTreeSet::new());

        for idx in 0..zip.len() {
            let entry = zip.by_index(idx).map_err(zip_error)?;
            let name = entry.name().trim_matches('/').to_owned();
            if name.is_empty() || name.split('/').any(|segment| segment == "..") {
                continue;
            }
            let is_dir = entry.is_dir();
            let len = if is_dir { 0 } else { entry.size() };

            // Synthesize missing parent directories.
            let mut parent = String::new();
            for segment in name.split('/') {
                let child = if parent.is_empty() {
                    segment.to_owned()
                } else {
                    format!("{parent}/{segment}")
                };
                children
                    .entry(parent.clone())
                    .or_default()
                    .insert(segment.to_owned());
                if child != name {
                    entries.entry(child.clone()).or_insert(ArchiveEntry {
                        is_dir: true,
                        len: 0,
                    });
                    children.entry(child.clone()).or_default();
                }
                parent = child;
            }

            entries.insert(name.clone(), ArchiveEntry { is_dir, len });
            if is_dir {
                children.entry(name).or_default();
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            stamp,
            entries,
            children,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn attributes(&self, entry: &str) -> Option<FileAttributes> {
        let entry = self.entries.get(entry)?;
        let attrs = if entry.is_dir {
            FileAttributes::directory(self.stamp.modified)
        } else {
            FileAttributes::file(entry.len, self.stamp.modified)
        };
        Some(FileAttributes {
            writable: false,
            ..attrs
        })
    }

    pub fn children(&self, entry: &str) -> Option<Vec<String>> {
        self.children
            .get(entry)
            .map(|names| names.iter().cloned().collect())
    }

    pub fn read(&self, entry: &str) -> io::Result<Vec<u8>> {
        match self.entries.get(entry) {
            Some(found) if !found.is_dir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("archive entry not found ({}!/{entry})", self.path.display()),
                ))
            }
        }
        let file = File::open(&self.path)?;
        let mut zip = ZipArchive::new(file).map_err(zip_error)?;
        let mut found = zip.by_name(entry).map_err(zip_error)?;
        let mut buf = Vec::new();
        found.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(err) => err,
        zip::result::ZipError::FileNotFound => {
            io::Error::new(io::ErrorKind::NotFound, "archive entry not found")
        }
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Per-path cache of open [`ArchiveHandler`]s.
///
/// A single mutex guards the whole map; operations are short. Handlers are evicted explicitly:
/// when the refresh machinery reports that an archive file changed, moved, or disappeared, and
/// lazily when the on-disk stamp no longer matches the one recorded at open time.
#[derive(Debug)]
pub struct ArchiveHandlerCache {
    handlers: Mutex<LruCache<PathBuf, Arc<ArchiveHandler>>>,
}

impl ArchiveHandlerCache {
    pub const DEFAULT_CAPACITY: usize = 32;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            handlers: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the handler for `archive`, reopening it when the file changed on disk.
    pub fn handler(&self, archive: &Path) -> io::Result<Arc<ArchiveHandler>> {
        let stamp = ArchiveStamp::of(archive)?;
        {
            let mut handlers = self.handlers.lock();
            if let Some(handler) = handlers.get(archive).cloned() {
                if handler.stamp == stamp {
                    return Ok(handler);
                }
                handlers.pop(archive);
            }
        }

        let handler = Arc::new(ArchiveHandler::open(archive)?);
        tracing::debug!(
            target: "drift.vfs",
            archive = %archive.display(),
            entries = handler.entry_count(),
            "opened archive handler"
        );
        self.handlers
            .lock()
            .put(archive.to_path_buf(), Arc::clone(&handler));
        Ok(handler)
    }

    pub fn is_cached(&self, archive: &Path) -> bool {
        self.handlers.lock().contains(archive)
    }

    /// Evicts handlers for `path` and for any archive below it.
    pub fn invalidate(&self, path: &Path) {
        let mut handlers = self.handlers.lock();
        let stale: Vec<PathBuf> = handlers
            .iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(path))
            .cloned()
            .collect();
        for key in stale {
            tracing::debug!(target: "drift.vfs", archive = %key.display(), "evicting archive handler");
            handlers.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArchiveHandlerCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl BulkFileListener for ArchiveHandlerCache {
    fn after(&self, events: &[ChangeEvent]) -> anyhow::Result<()> {
        for event in events {
            let touches_archive = matches!(
                event,
                ChangeEvent::ContentChanged { .. }
                    | ChangeEvent::Deleted { .. }
                    | ChangeEvent::Moved { .. }
                    | ChangeEvent::PropertyChanged { .. }
            ) || matches!(event, ChangeEvent::Created { replaced: Some(_), .. });
            if !touches_archive {
                continue;
            }
            if let VfsPath::Local(path) = event.path() {
                self.invalidate(path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn handler_synthesizes_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("dep.jar");
        write_zip(&jar, &[("com/example/A.txt", "a"), ("top.txt", "top")]);

        let handler = ArchiveHandler::open(&jar).unwrap();
        assert_eq!(handler.children("").unwrap(), vec!["com", "top.txt"]);
        assert_eq!(handler.children("com").unwrap(), vec!["example"]);
        assert!(handler.attributes("com/example").unwrap().is_dir());
        assert_eq!(handler.attributes("com/example/A.txt").unwrap().len, 1);
        assert_eq!(handler.read("top.txt").unwrap(), b"top");
        assert!(handler.read("com").is_err());
    }

    #[test]
    fn cache_reuses_and_invalidates_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("dep.jar");
        write_zip(&jar, &[("a.txt", "a")]);

        let cache = ArchiveHandlerCache::new(4);
        let first = cache.handler(&jar).unwrap();
        let second = cache.handler(&jar).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.invalidate(dir.path());
        assert!(!cache.is_cached(&jar));
        let third = cache.handler(&jar).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn change_events_evict_the_archive_handler() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("dep.jar");
        write_zip(&jar, &[("a.txt", "a")]);

        let cache = ArchiveHandlerCache::new(4);
        cache.handler(&jar).unwrap();
        cache
            .after(&[ChangeEvent::Deleted {
                path: VfsPath::local(&jar),
                file: drift_core::FileId::from_raw(7),
            }])
            .unwrap();
        assert!(cache.is_empty());
    }
}
