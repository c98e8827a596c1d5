use std::sync::{Arc, Weak};

use drift_core::FileId;
use drift_vfs::{BulkFileListener, ChangeEvent, Vfs, VfsCache};
use parking_lot::Mutex;

use crate::manager::SmartPointerManager;
use crate::source::{SourceModel, SourceStore};

/// Forwards VFS deletions to the document store and the pointer manager.
///
/// Deleting a directory only produces one event, so the files below it are collected in
/// [`BulkFileListener::before`], while the cache still knows them, and evicted in
/// [`BulkFileListener::after`].
pub struct VfsPointerBridge {
    vfs: Weak<Vfs>,
    store: Arc<SourceStore>,
    manager: SmartPointerManager,
    doomed: Mutex<Vec<FileId>>,
}

impl VfsPointerBridge {
    pub fn new(vfs: &Arc<Vfs>, store: Arc<SourceStore>, manager: SmartPointerManager) -> Self {
        Self {
            vfs: Arc::downgrade(vfs),
            store,
            manager,
            doomed: Mutex::new(Vec::new()),
        }
    }

    /// Builds the bridge and registers it with `vfs`.
    pub fn install(
        vfs: &Arc<Vfs>,
        store: Arc<SourceStore>,
        manager: SmartPointerManager,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self::new(vfs, store, manager));
        vfs.add_listener(bridge.clone());
        bridge
    }
}

fn collect_subtree(cache: &VfsCache, file: FileId, out: &mut Vec<FileId>) {
    out.push(file);
    for child in cache.children(file).unwrap_or_default() {
        collect_subtree(cache, child.id, out);
    }
}

impl BulkFileListener for VfsPointerBridge {
    fn before(&self, events: &[ChangeEvent]) -> anyhow::Result<()> {
        let Some(vfs) = self.vfs.upgrade() else {
            return Ok(());
        };
        let mut doomed = self.doomed.lock();
        for event in events {
            match event {
                ChangeEvent::Deleted { file, .. }
                | ChangeEvent::Created {
                    replaced: Some(file),
                    ..
                } => collect_subtree(vfs.cache(), *file, &mut doomed),
                _ => {}
            }
        }
        Ok(())
    }

    fn after(&self, _events: &[ChangeEvent]) -> anyhow::Result<()> {
        let doomed = std::mem::take(&mut *self.doomed.lock());
        for file in doomed {
            if !self.store.is_valid(file) {
                continue;
            }
            for dropped in self.store.file_deleted(file) {
                self.manager.file_deleted(dropped);
            }
        }
        Ok(())
    }
}
