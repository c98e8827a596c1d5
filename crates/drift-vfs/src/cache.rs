use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use drift_core::FileId;
use parking_lot::RwLock;

use crate::event::{ChangeEvent, FileProperty, PropertyValue};
use crate::fs::FileAttributes;
use crate::path::VfsPath;

/// A point-in-time copy of a cached file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub id: FileId,
    pub path: VfsPath,
    pub name: String,
    pub parent: Option<FileId>,
    pub attributes: FileAttributes,
    /// Whether the directory listing of this record has been loaded.
    pub children_loaded: bool,
}

#[derive(Debug)]
struct FileRecord {
    path: VfsPath,
    name: String,
    parent: Option<FileId>,
    attributes: FileAttributes,
    children: Option<BTreeMap<String, FileId>>,
}

#[derive(Debug, Default)]
struct CacheInner {
    records: HashMap<FileId, FileRecord>,
    by_path: HashMap<VfsPath, FileId>,
    roots: Vec<FileId>,
}

impl CacheInner {
    fn snapshot(&self, id: FileId) -> Option<CachedFile> {
        let record = self.records.get(&id)?;
        Some(CachedFile {
            id,
            path: record.path.clone(),
            name: record.name.clone(),
            parent: record.parent,
            attributes: record.attributes,
            children_loaded: record.children.is_some(),
        })
    }

    fn insert(&mut self, id: FileId, path: VfsPath, parent: Option<FileId>, attributes: FileAttributes) {
        let name = path.file_name();
        if let Some(parent) = parent.and_then(|parent| self.records.get_mut(&parent)) {
            if let Some(children) = parent.children.as_mut() {
                children.insert(name.clone(), id);
            }
        }
        self.by_path.insert(path.clone(), id);
        self.records.insert(
            id,
            FileRecord {
                path,
                name,
                parent,
                attributes,
                children: None,
            },
        );
    }

    /// Drops `id` and every record below it.
    fn remove_subtree(&mut self, id: FileId) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        if let Some(parent) = record.parent {
            let name = record.name.clone();
            if let Some(children) = self
                .records
                .get_mut(&parent)
                .and_then(|parent| parent.children.as_mut())
            {
                if children.get(&name) == Some(&id) {
                    children.remove(&name);
                }
            }
        }
        self.roots.retain(|root| *root != id);

        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(record) = self.records.remove(&next) else {
                continue;
            };
            if self.by_path.get(&record.path) == Some(&next) {
                self.by_path.remove(&record.path);
            }
            if let Some(children) = record.children {
                stack.extend(children.into_values());
            }
        }
    }

    /// Rewrites the path of `id` and of everything below it.
    fn rebase_subtree(&mut self, id: FileId, new_path: VfsPath) {
        let mut stack = vec![(id, new_path)];
        while let Some((next, path)) = stack.pop() {
            let Some(record) = self.records.get_mut(&next) else {
                continue;
            };
            let old_path = std::mem::replace(&mut record.path, path.clone());
            record.name = path.file_name();
            if let Some(children) = &record.children {
                stack.extend(children.iter().map(|(name, child)| (*child, path.join(name))));
            }
            if self.by_path.get(&old_path) == Some(&next) {
                self.by_path.remove(&old_path);
            }
            self.by_path.insert(path, next);
        }
    }

    fn detach(&mut self, id: FileId) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        let (parent, name) = (record.parent, record.name.clone());
        if let Some(children) = parent
            .and_then(|parent| self.records.get_mut(&parent))
            .and_then(|parent| parent.children.as_mut())
        {
            children.remove(&name);
        }
    }

    fn attach(&mut self, id: FileId, parent: FileId) {
        let Some(name) = self.records.get(&id).map(|record| record.name.clone()) else {
            return;
        };
        if let Some(record) = self.records.get_mut(&id) {
            record.parent = Some(parent);
        }
        if let Some(children) = self
            .records
            .get_mut(&parent)
            .and_then(|parent| parent.children.as_mut())
        {
            children.insert(name, id);
        }
    }

    fn child_named(&self, parent: FileId, name: &str) -> Option<FileId> {
        self.records
            .get(&parent)?
            .children
            .as_ref()?
            .get(name)
            .copied()
    }
}

/// The cached file tree: one record per known path, keyed by [`FileId`].
///
/// Directory listings are loaded lazily. A record whose listing was never requested has no
/// children in the cache, and refresh never reports changes below it. The cache only mutates
/// through [`VfsCache::apply`] (driven by change events) and through lazy loading, which never
/// changes an existing record.
#[derive(Debug)]
pub struct VfsCache {
    inner: RwLock<CacheInner>,
    next_id: AtomicU32,
}

impl Default for VfsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Reserves a fresh id. Ids are never reused.
    pub fn allocate_id(&self) -> FileId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        FileId::from_raw(raw)
    }

    pub fn get(&self, id: FileId) -> Option<CachedFile> {
        self.inner.read().snapshot(id)
    }

    pub fn id_of(&self, path: &VfsPath) -> Option<FileId> {
        self.inner.read().by_path.get(path).copied()
    }

    pub fn is_valid(&self, id: FileId) -> bool {
        self.inner.read().records.contains_key(&id)
    }

    pub fn roots(&self) -> Vec<FileId> {
        self.inner.read().roots.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cached children of `id`, or `None` if its listing was never loaded.
    pub fn children(&self, id: FileId) -> Option<Vec<CachedFile>> {
        let inner = self.inner.read();
        let record = inner.records.get(&id)?;
        let children = record.children.as_ref()?;
        Some(
            children
                .values()
                .filter_map(|child| inner.snapshot(*child))
                .collect(),
        )
    }

    pub fn child_named(&self, parent: FileId, name: &str) -> Option<FileId> {
        self.inner.read().child_named(parent, name)
    }

    /// Registers a root record, or returns the existing record for `path`.
    pub(crate) fn insert_root(&self, path: VfsPath, attributes: FileAttributes) -> FileId {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_path.get(&path) {
            return id;
        }
        let id = self.allocate_id();
        inner.insert(id, path, None, attributes);
        inner.roots.push(id);
        id
    }

    /// Installs the first listing of directory `id`.
    ///
    /// Does nothing if the listing was loaded in the meantime, so a racing loader cannot clobber
    /// records created by change events.
    pub(crate) fn load_children(&self, id: FileId, entries: Vec<(String, FileAttributes)>) {
        let mut inner = self.inner.write();
        let path = match inner.records.get_mut(&id) {
            Some(record) if record.children.is_none() && record.attributes.is_dir() => {
                record.children = Some(BTreeMap::new());
                record.path.clone()
            }
            _ => return,
        };
        for (name, attributes) in entries {
            let child_path = path.join(&name);
            if inner.by_path.contains_key(&child_path) {
                continue;
            }
            let child = self.allocate_id();
            inner.insert(child, child_path, Some(id), attributes);
        }
    }

    /// Whether `event` still describes a change relative to the current cache state.
    ///
    /// Two refreshes can observe the same disk change; the second one is dropped here.
    pub fn is_applicable(&self, event: &ChangeEvent) -> bool {
        let inner = self.inner.read();
        match event {
            ChangeEvent::Created {
                path,
                parent,
                replaced,
                ..
            } => {
                let Some(parent_record) = inner.records.get(parent) else {
                    return false;
                };
                if !parent_record.attributes.is_dir() {
                    return false;
                }
                match inner.by_path.get(path) {
                    None => true,
                    Some(existing) => Some(*existing) == *replaced,
                }
            }
            ChangeEvent::Deleted { file, .. } | ChangeEvent::ContentChanged { file, .. } => {
                inner.records.contains_key(file)
            }
            ChangeEvent::PropertyChanged {
                file,
                property,
                new,
                ..
            } => {
                let Some(record) = inner.records.get(file) else {
                    return false;
                };
                let current = match property {
                    FileProperty::Name => PropertyValue::Text(record.name.clone()),
                    FileProperty::Writable => PropertyValue::Bool(record.attributes.writable),
                    FileProperty::Hidden => PropertyValue::Bool(record.attributes.hidden),
                };
                current != *new
            }
            ChangeEvent::Moved {
                file,
                new_parent,
                new_path,
                ..
            } => {
                inner.records.contains_key(file)
                    && inner.records.contains_key(new_parent)
                    && !inner.by_path.contains_key(new_path)
            }
        }
    }

    /// Applies one event to the cache.
    pub(crate) fn apply(&self, event: &ChangeEvent) {
        let mut inner = self.inner.write();
        match event {
            ChangeEvent::Created {
                path,
                file,
                parent,
                attributes,
                replaced,
            } => {
                if let Some(replaced) = replaced {
                    inner.remove_subtree(*replaced);
                }
                if let Some(stale) = inner.by_path.get(path).copied() {
                    inner.remove_subtree(stale);
                }
                inner.insert(*file, path.clone(), Some(*parent), *attributes);
            }
            ChangeEvent::Deleted { file, .. } => inner.remove_subtree(*file),
            ChangeEvent::ContentChanged {
                file, attributes, ..
            } => {
                if let Some(record) = inner.records.get_mut(file) {
                    record.attributes = *attributes;
                }
            }
            ChangeEvent::PropertyChanged {
                file,
                property,
                new,
                ..
            } => match (property, new) {
                (FileProperty::Name, PropertyValue::Text(name)) => {
                    let Some(record) = inner.records.get(file) else {
                        return;
                    };
                    let Some(new_path) = record.path.parent().map(|parent| parent.join(name))
                    else {
                        return;
                    };
                    let parent = record.parent;
                    inner.detach(*file);
                    inner.rebase_subtree(*file, new_path);
                    if let Some(parent) = parent {
                        inner.attach(*file, parent);
                    }
                }
                (FileProperty::Writable, PropertyValue::Bool(value)) => {
                    if let Some(record) = inner.records.get_mut(file) {
                        record.attributes.writable = *value;
                    }
                }
                (FileProperty::Hidden, PropertyValue::Bool(value)) => {
                    if let Some(record) = inner.records.get_mut(file) {
                        record.attributes.hidden = *value;
                    }
                }
                (property, value) => {
                    tracing::warn!(
                        target: "drift.vfs",
                        ?property,
                        ?value,
                        "ignoring property change with mismatched value type"
                    );
                }
            },
            ChangeEvent::Moved {
                file,
                new_parent,
                new_path,
                ..
            } => {
                inner.detach(*file);
                inner.rebase_subtree(*file, new_path.clone());
                inner.attach(*file, *new_parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> FileAttributes {
        FileAttributes::directory(1)
    }

    fn file() -> FileAttributes {
        FileAttributes::file(3, 1)
    }

    fn cache_with_tree() -> (VfsCache, FileId) {
        let cache = VfsCache::new();
        let root = cache.insert_root(VfsPath::local("/r"), dir());
        cache.load_children(
            root,
            vec![("a".into(), dir()), ("f.txt".into(), file())],
        );
        let a = cache.id_of(&VfsPath::local("/r/a")).unwrap();
        cache.load_children(a, vec![("g.txt".into(), file())]);
        (cache, root)
    }

    #[test]
    fn lazy_listing_creates_child_records() {
        let (cache, root) = cache_with_tree();
        let names: Vec<_> = cache
            .children(root)
            .unwrap()
            .into_iter()
            .map(|child| child.name)
            .collect();
        assert_eq!(names, vec!["a", "f.txt"]);
        let g = cache.id_of(&VfsPath::local("/r/a/g.txt")).unwrap();
        assert!(cache.children(g).is_none());
    }

    #[test]
    fn deleting_a_directory_invalidates_descendants() {
        let (cache, root) = cache_with_tree();
        let a = cache.id_of(&VfsPath::local("/r/a")).unwrap();
        let g = cache.id_of(&VfsPath::local("/r/a/g.txt")).unwrap();
        cache.apply(&ChangeEvent::Deleted {
            path: VfsPath::local("/r/a"),
            file: a,
        });
        assert!(!cache.is_valid(a));
        assert!(!cache.is_valid(g));
        assert!(cache.id_of(&VfsPath::local("/r/a/g.txt")).is_none());
        assert_eq!(cache.children(root).unwrap().len(), 1);
    }

    #[test]
    fn rename_rewrites_descendant_paths() {
        let (cache, root) = cache_with_tree();
        let a = cache.id_of(&VfsPath::local("/r/a")).unwrap();
        let g = cache.id_of(&VfsPath::local("/r/a/g.txt")).unwrap();
        cache.apply(&ChangeEvent::PropertyChanged {
            path: VfsPath::local("/r/a"),
            file: a,
            property: FileProperty::Name,
            old: PropertyValue::Text("a".into()),
            new: PropertyValue::Text("b".into()),
        });
        assert_eq!(cache.get(g).unwrap().path, VfsPath::local("/r/b/g.txt"));
        assert_eq!(cache.child_named(root, "b"), Some(a));
        assert_eq!(cache.child_named(root, "a"), None);
    }

    #[test]
    fn duplicate_creations_are_not_applicable() {
        let (cache, root) = cache_with_tree();
        let event = ChangeEvent::Created {
            path: VfsPath::local("/r/new.txt"),
            file: cache.allocate_id(),
            parent: root,
            attributes: file(),
            replaced: None,
        };
        assert!(cache.is_applicable(&event));
        cache.apply(&event);
        assert!(!cache.is_applicable(&event));
    }

    #[test]
    fn kind_change_replaces_the_old_record() {
        let (cache, root) = cache_with_tree();
        let old = cache.id_of(&VfsPath::local("/r/f.txt")).unwrap();
        let new = cache.allocate_id();
        let event = ChangeEvent::Created {
            path: VfsPath::local("/r/f.txt"),
            file: new,
            parent: root,
            attributes: dir(),
            replaced: Some(old),
        };
        assert!(cache.is_applicable(&event));
        cache.apply(&event);
        assert!(!cache.is_valid(old));
        assert!(cache.get(new).unwrap().attributes.is_dir());
    }
}
