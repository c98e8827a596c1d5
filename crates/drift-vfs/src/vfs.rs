use std::io;
use std::sync::Arc;

use drift_config::RefreshConfig;
use drift_core::{FileId, ModelLock};

use crate::archive::ArchiveHandlerCache;
use crate::cache::{CachedFile, VfsCache};
use crate::dispatch::EventDispatcher;
use crate::error::{Result, VfsError};
use crate::event::{ChangeEvent, FileProperty, PropertyValue};
use crate::fs::{FileAttributes, FileSystem, LocalFs};
use crate::listener::{BulkFileListener, ListenerId};
use crate::path::VfsPath;
use crate::progress::RefreshProgress;
use crate::queue::{RefreshContext, RefreshQueue};
use crate::session::{FinishCallback, RefreshSession};
use crate::worker::list_entries;

const PROGRESS_CAPACITY: usize = 256;

/// High-level VFS facade combining:
/// - a backing [`FileSystem`] (usually [`LocalFs`])
/// - the cached file tree ([`VfsCache`]) with lazily loaded directory listings
/// - the refresh machinery ([`RefreshQueue`]) that brings the cache back in sync with disk
/// - listener registration for change events
///
/// Mutations performed through the facade hit the file system first and are then reported to
/// listeners exactly like externally detected changes.
pub struct Vfs {
    ctx: Arc<RefreshContext>,
    queue: RefreshQueue,
}

impl Vfs {
    pub fn new(fs: Arc<dyn FileSystem>, config: &RefreshConfig) -> Result<Self> {
        Self::with_lock(fs, Arc::new(ModelLock::new()), config)
    }

    /// Builds a VFS that shares `lock` with other model layers.
    pub fn with_lock(
        fs: Arc<dyn FileSystem>,
        lock: Arc<ModelLock>,
        config: &RefreshConfig,
    ) -> Result<Self> {
        let ignored = config.ignored_matcher()?;
        let cache = Arc::new(VfsCache::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&cache), Arc::clone(&lock)));
        let ctx = Arc::new(RefreshContext {
            fs,
            cache,
            dispatcher,
            lock,
            ignored,
            progress: Arc::new(RefreshProgress::new(PROGRESS_CAPACITY)),
        });
        let queue = RefreshQueue::new(Arc::clone(&ctx), config)?;
        Ok(Self { ctx, queue })
    }

    /// A VFS over the local disk. Archive handlers are evicted whenever their archive changes.
    pub fn local(lock: Arc<ModelLock>, config: &RefreshConfig) -> Result<Self> {
        let archives = Arc::new(ArchiveHandlerCache::new(config.archive_cache_capacity));
        let fs = LocalFs::with_archive_cache(Arc::clone(&archives));
        let vfs = Self::with_lock(Arc::new(fs), lock, config)?;
        vfs.add_listener(archives);
        Ok(vfs)
    }

    pub fn lock(&self) -> &Arc<ModelLock> {
        &self.ctx.lock
    }

    pub fn cache(&self) -> &VfsCache {
        &self.ctx.cache
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.ctx.fs
    }

    pub fn queue(&self) -> &RefreshQueue {
        &self.queue
    }

    pub fn add_listener(&self, listener: Arc<dyn BulkFileListener>) -> ListenerId {
        self.ctx.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.ctx.dispatcher.remove_listener(id)
    }

    /// Makes `path` a root of the cached tree, or returns the record already cached for it.
    pub fn register_root(&self, path: &VfsPath) -> Result<FileId> {
        if let Some(id) = self.ctx.cache.id_of(path) {
            return Ok(id);
        }
        let attributes = self
            .ctx
            .fs
            .attributes(path)
            .map_err(|err| VfsError::io(path, err))?;
        Ok(self.ctx.cache.insert_root(path.clone(), attributes))
    }

    /// Resolves `path` against the cache, loading directory listings on the way.
    ///
    /// Never refreshes: a file created on disk after its directory was listed is not found until
    /// that directory is refreshed (see [`Vfs::refresh_and_find_file`]).
    pub fn find_file(&self, path: &VfsPath) -> Option<FileId> {
        let mut names = Vec::new();
        let mut cur = path.clone();
        let anchor = loop {
            if let Some(id) = self.ctx.cache.id_of(&cur) {
                break id;
            }
            match cur.parent() {
                Some(parent) => {
                    names.push(cur.file_name());
                    cur = parent;
                }
                None => break self.register_root(&cur).ok()?,
            }
        };

        names.iter().rev().try_fold(anchor, |dir, name| {
            if self.load_children(dir).is_err() {
                return None;
            }
            self.ctx.cache.child_named(dir, name)
        })
    }

    /// Like [`Vfs::find_file`], but synchronously refreshes the nearest cached ancestor first
    /// when the file is not known yet.
    pub fn refresh_and_find_file(&self, path: &VfsPath) -> Result<Option<FileId>> {
        if let Some(id) = self.find_file(path) {
            return Ok(Some(id));
        }
        let mut cur = path.parent();
        while let Some(dir) = cur {
            if let Some(id) = self.ctx.cache.id_of(&dir) {
                self.refresh(&[id], false)?;
                break;
            }
            cur = dir.parent();
        }
        Ok(self.find_file(path))
    }

    pub fn get(&self, file: FileId) -> Option<CachedFile> {
        self.ctx.cache.get(file)
    }

    pub fn is_valid(&self, file: FileId) -> bool {
        self.ctx.cache.is_valid(file)
    }

    pub fn path_of(&self, file: FileId) -> Option<VfsPath> {
        self.ctx.cache.get(file).map(|record| record.path)
    }

    pub fn attributes_of(&self, file: FileId) -> Option<FileAttributes> {
        self.ctx.cache.get(file).map(|record| record.attributes)
    }

    pub fn parent_of(&self, file: FileId) -> Option<FileId> {
        self.ctx.cache.get(file).and_then(|record| record.parent)
    }

    /// Children of a directory, loading its listing on first access.
    pub fn children_of(&self, dir: FileId) -> Result<Vec<FileId>> {
        self.load_children(dir)?;
        Ok(self
            .ctx
            .cache
            .children(dir)
            .unwrap_or_default()
            .into_iter()
            .map(|child| child.id)
            .collect())
    }

    pub fn read_bytes(&self, file: FileId) -> Result<Vec<u8>> {
        let record = self.record(file)?;
        self.ctx
            .fs
            .read_bytes(&record.path)
            .map_err(|err| VfsError::io(&record.path, err))
    }

    /// Synchronously refreshes `files` and delivers the resulting events before returning.
    pub fn refresh(&self, files: &[FileId], recursive: bool) -> Result<()> {
        let session = self.queue.create_session(false, recursive, None);
        session.add_files(files.iter().copied());
        self.queue.execute(&session)
    }

    /// Queues an asynchronous refresh of `files` on the refresh worker.
    pub fn refresh_async(
        &self,
        files: &[FileId],
        recursive: bool,
        on_finish: Option<FinishCallback>,
    ) -> Result<Arc<RefreshSession>> {
        let session = self.queue.create_session(true, recursive, on_finish);
        session.add_files(files.iter().copied());
        self.queue.execute(&session)?;
        Ok(session)
    }

    pub fn write_content(&self, file: FileId, contents: &[u8]) -> Result<()> {
        let _write = self.ctx.lock.write();
        let record = self.record(file)?;
        if record.attributes.is_dir() {
            return Err(VfsError::io(
                &record.path,
                io::Error::new(io::ErrorKind::Other, "cannot write to a directory"),
            ));
        }
        self.ctx
            .fs
            .write_bytes(&record.path, contents)
            .map_err(|err| VfsError::io(&record.path, err))?;
        let attributes = self.stat(&record.path)?;
        self.fire(ChangeEvent::ContentChanged {
            path: record.path,
            file,
            attributes,
        })
    }

    pub fn create_child_file(&self, parent: FileId, name: &str, contents: &[u8]) -> Result<FileId> {
        let _write = self.ctx.lock.write();
        let path = self.prepare_child(parent, name)?;
        self.ctx
            .fs
            .write_bytes(&path, contents)
            .map_err(|err| VfsError::io(&path, err))?;
        self.report_created(parent, path)
    }

    pub fn create_child_directory(&self, parent: FileId, name: &str) -> Result<FileId> {
        let _write = self.ctx.lock.write();
        let path = self.prepare_child(parent, name)?;
        self.ctx
            .fs
            .create_dir(&path)
            .map_err(|err| VfsError::io(&path, err))?;
        self.report_created(parent, path)
    }

    /// Deletes a file or a directory tree. Every record below it becomes invalid.
    pub fn delete(&self, file: FileId) -> Result<()> {
        let _write = self.ctx.lock.write();
        let record = self.record(file)?;
        self.ctx
            .fs
            .remove(&record.path)
            .map_err(|err| VfsError::io(&record.path, err))?;
        self.fire(ChangeEvent::Deleted {
            path: record.path,
            file,
        })
    }

    /// Renames a file within its directory. The file keeps its id.
    pub fn rename(&self, file: FileId, new_name: &str) -> Result<()> {
        let _write = self.ctx.lock.write();
        let record = self.record(file)?;
        let Some(parent) = record.parent else {
            return Err(VfsError::io(
                &record.path,
                io::Error::new(io::ErrorKind::InvalidInput, "cannot rename a root"),
            ));
        };
        let target = self.prepare_child(parent, new_name)?;
        self.ctx
            .fs
            .rename(&record.path, &target)
            .map_err(|err| VfsError::io(&record.path, err))?;
        self.fire(ChangeEvent::PropertyChanged {
            path: record.path,
            file,
            property: FileProperty::Name,
            old: PropertyValue::Text(record.name),
            new: PropertyValue::Text(new_name.to_owned()),
        })
    }

    /// Moves a file into another directory. The file keeps its id.
    pub fn move_file(&self, file: FileId, new_parent: FileId) -> Result<()> {
        let _write = self.ctx.lock.write();
        let record = self.record(file)?;
        let Some(old_parent) = record.parent else {
            return Err(VfsError::io(
                &record.path,
                io::Error::new(io::ErrorKind::InvalidInput, "cannot move a root"),
            ));
        };
        let target = self.prepare_child(new_parent, &record.name)?;
        if target.starts_with(&record.path) {
            return Err(VfsError::io(
                &record.path,
                io::Error::new(io::ErrorKind::InvalidInput, "cannot move a directory into itself"),
            ));
        }
        self.ctx
            .fs
            .rename(&record.path, &target)
            .map_err(|err| VfsError::io(&record.path, err))?;
        self.fire(ChangeEvent::Moved {
            path: record.path,
            file,
            old_parent,
            new_parent,
            new_path: target,
        })
    }

    fn record(&self, file: FileId) -> Result<CachedFile> {
        self.ctx.cache.get(file).ok_or(VfsError::InvalidFile(file))
    }

    fn stat(&self, path: &VfsPath) -> Result<FileAttributes> {
        self.ctx
            .fs
            .attributes(path)
            .map_err(|err| VfsError::io(path, err))
    }

    fn load_children(&self, dir: FileId) -> Result<()> {
        let record = self.record(dir)?;
        if !record.attributes.is_dir() {
            return Err(VfsError::NotADirectory(record.path));
        }
        if record.children_loaded {
            return Ok(());
        }
        let entries = list_entries(&*self.ctx.fs, &record.path, &self.ctx.ignored)
            .map_err(|err| VfsError::io(&record.path, err))?;
        tracing::trace!(target: "drift.vfs", path = %record.path, count = entries.len(), "loaded directory listing");
        self.ctx.cache.load_children(dir, entries);
        Ok(())
    }

    /// Validates that `name` can be created below `parent` and returns the new path.
    fn prepare_child(&self, parent: FileId, name: &str) -> Result<VfsPath> {
        self.load_children(parent)?;
        let parent_path = self.record(parent)?.path;
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(VfsError::io(
                &parent_path,
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid file name {name:?}")),
            ));
        }
        let path = parent_path.join(name);
        if self.ctx.cache.child_named(parent, name).is_some() || self.ctx.fs.exists(&path) {
            return Err(VfsError::AlreadyExists(path));
        }
        Ok(path)
    }

    fn report_created(&self, parent: FileId, path: VfsPath) -> Result<FileId> {
        let attributes = self.stat(&path)?;
        let file = self.ctx.cache.allocate_id();
        self.fire(ChangeEvent::Created {
            path,
            file,
            parent,
            attributes,
            replaced: None,
        })?;
        Ok(file)
    }

    fn fire(&self, event: ChangeEvent) -> Result<()> {
        self.ctx.dispatcher.fire(vec![event]).map(|_| ())
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("files", &self.ctx.cache.len())
            .field("roots", &self.ctx.cache.roots())
            .finish_non_exhaustive()
    }
}
