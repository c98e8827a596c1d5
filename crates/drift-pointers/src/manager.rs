use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use drift_core::{FileId, TextRange};
use parking_lot::Mutex;

use crate::document::{Document, DocumentEvent, DocumentListener};
use crate::element_info::{ElementInfo, PointerStrategy};
use crate::source::SourceModel;
use crate::tree::{Element, ElementKey, ElementKind};

/// Tracking state shared by every handle to one pointer.
struct PointerEntry {
    id: u64,
    kind: ElementKind,
    refs: AtomicUsize,
    info: Mutex<ElementInfo>,
    cached: Mutex<Option<Element>>,
    /// Identity key under which the entry is found for deduplication.
    key: Mutex<Option<ElementKey>>,
}

#[derive(Default)]
struct Registry {
    by_element: HashMap<ElementKey, Weak<PointerEntry>>,
    /// Entries by the file whose edits move them.
    by_file: HashMap<FileId, Vec<Weak<PointerEntry>>>,
}

impl Registry {
    fn entries_in(&mut self, file: FileId) -> Vec<Arc<PointerEntry>> {
        let Some(entries) = self.by_file.get_mut(&file) else {
            return Vec::new();
        };
        entries.retain(|entry| entry.strong_count() > 0);
        entries.iter().filter_map(Weak::upgrade).collect()
    }

    fn forget(&mut self, entry: &Arc<PointerEntry>, anchor_file: FileId) {
        if let Some(key) = entry.key.lock().take() {
            if self
                .by_element
                .get(&key)
                .is_some_and(|existing| existing.as_ptr() == Arc::as_ptr(entry))
            {
                self.by_element.remove(&key);
            }
        }
        if let Some(entries) = self.by_file.get_mut(&anchor_file) {
            entries.retain(|existing| {
                existing.strong_count() > 0 && existing.as_ptr() != Arc::as_ptr(entry)
            });
            if entries.is_empty() {
                self.by_file.remove(&anchor_file);
            }
        }
    }
}

struct ManagerInner {
    model: Arc<dyn SourceModel>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl ManagerInner {
    fn release(&self, entry: &Arc<PointerEntry>) {
        let mut registry = self.registry.lock();
        if entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let anchor_file = entry.info.lock().anchor_file();
            registry.forget(entry, anchor_file);
            tracing::trace!(target: "drift.pointers", pointer = entry.id, "pointer released");
        }
    }

    fn resolve(&self, entry: &Arc<PointerEntry>) -> Option<Element> {
        let info = entry.info.lock().clone();
        let cached = entry.cached.lock().clone();
        let element = info.restore(self.model.as_ref(), cached.as_ref());

        let mut registry = self.registry.lock();
        match &element {
            Some(element) => {
                let key = element.key();
                let mut current = entry.key.lock();
                if *current != Some(key) {
                    if let Some(old) = current.take() {
                        if registry
                            .by_element
                            .get(&old)
                            .is_some_and(|existing| existing.as_ptr() == Arc::as_ptr(entry))
                        {
                            registry.by_element.remove(&old);
                        }
                    }
                    registry
                        .by_element
                        .entry(key)
                        .or_insert_with(|| Arc::downgrade(entry));
                    *current = Some(key);
                }
                *entry.cached.lock() = Some(element.clone());
            }
            None => *entry.cached.lock() = None,
        }
        element
    }
}

/// Creates and tracks [`SmartPointer`]s.
///
/// Pointers survive document edits and reparses: each remembers how to find its element again
/// (see [`PointerStrategy`]) instead of holding on to a particular tree. While a document is
/// being edited, the manager pins every anchored range in that document to a range marker, so
/// offsets shift with the edit; afterwards it reads the shifted ranges back and lets the markers
/// go.
#[derive(Clone)]
pub struct SmartPointerManager {
    inner: Arc<ManagerInner>,
}

impl SmartPointerManager {
    pub fn new(model: Arc<dyn SourceModel>) -> Self {
        let inner = Arc::new(ManagerInner {
            model: Arc::clone(&model),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        });
        model.add_document_listener(Arc::new(BeltListener {
            manager: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn model(&self) -> &Arc<dyn SourceModel> {
        &self.inner.model
    }

    /// Returns a pointer to `element`.
    ///
    /// A live pointer created for (or last resolved to) the same element is shared; its
    /// reference count goes up by one. `containing_file` overrides the file the element's tree
    /// reports.
    pub fn create_pointer(
        &self,
        element: &Element,
        containing_file: Option<FileId>,
    ) -> SmartPointer {
        let key = element.key();
        if let Some(pointer) = self.lookup(key) {
            return pointer;
        }

        let info = ElementInfo::create(element, containing_file, self.inner.model.as_ref());
        let anchor_file = info.anchor_file();
        let strategy = info.strategy();

        let mut registry = self.inner.registry.lock();
        // Another thread may have won the race while the info was built.
        if let Some(entry) = registry.by_element.get(&key).and_then(Weak::upgrade) {
            if entry.refs.load(Ordering::Acquire) > 0 {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                return self.handle(entry);
            }
        }

        let entry = Arc::new(PointerEntry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            kind: element.kind(),
            refs: AtomicUsize::new(1),
            info: Mutex::new(info),
            cached: Mutex::new(Some(element.clone())),
            key: Mutex::new(Some(key)),
        });
        registry.by_element.insert(key, Arc::downgrade(&entry));
        registry
            .by_file
            .entry(anchor_file)
            .or_default()
            .push(Arc::downgrade(&entry));
        drop(registry);

        tracing::trace!(
            target: "drift.pointers",
            pointer = entry.id,
            file = %anchor_file,
            strategy = ?strategy,
            "pointer created"
        );
        self.handle(entry)
    }

    /// Drops `pointer`; equivalent to letting it go out of scope.
    pub fn remove_pointer(&self, pointer: SmartPointer) {
        drop(pointer);
    }

    /// Live pointers whose position is tracked through edits of `file`.
    pub fn pointers_in(&self, file: FileId) -> Vec<SmartPointer> {
        let mut registry = self.inner.registry.lock();
        registry
            .entries_in(file)
            .into_iter()
            .filter(|entry| entry.refs.load(Ordering::Acquire) > 0)
            .map(|entry| {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                self.handle(entry)
            })
            .collect()
    }

    /// Invalidates every pointer into `file` or anchored in it.
    pub fn file_deleted(&self, file: FileId) {
        let entries: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            let mut entries = registry.entries_in(file);
            registry.by_file.remove(&file);
            entries.extend(
                registry
                    .by_element
                    .values()
                    .filter_map(Weak::upgrade)
                    .filter(|entry| {
                        let info = entry.info.lock();
                        info.file() == file && info.anchor_file() != file
                    }),
            );
            entries
        };
        for entry in &entries {
            entry.info.lock().invalidate();
            *entry.cached.lock() = None;
        }
        if !entries.is_empty() {
            tracing::debug!(
                target: "drift.pointers",
                file = %file,
                pointers = entries.len(),
                "pointers invalidated by file deletion"
            );
        }
    }

    fn lookup(&self, key: ElementKey) -> Option<SmartPointer> {
        let registry = self.inner.registry.lock();
        let entry = registry.by_element.get(&key)?.upgrade()?;
        if entry.refs.load(Ordering::Acquire) == 0 {
            return None;
        }
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Some(self.handle(entry))
    }

    fn handle(&self, entry: Arc<PointerEntry>) -> SmartPointer {
        SmartPointer {
            entry,
            manager: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for SmartPointerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("SmartPointerManager")
            .field("elements", &registry.by_element.len())
            .field("files", &registry.by_file.len())
            .finish()
    }
}

/// A reference to an element that survives edits and reparses.
///
/// Cloning shares the tracking entry and bumps [`SmartPointer::ref_count`]; dropping the last
/// handle unregisters it from the manager.
pub struct SmartPointer {
    entry: Arc<PointerEntry>,
    manager: Weak<ManagerInner>,
}

impl SmartPointer {
    /// The element this pointer currently designates, or `None` if it can no longer be found.
    ///
    /// Must not be called while the current thread holds the lock of a document involved in the
    /// lookup.
    pub fn element(&self) -> Option<Element> {
        let manager = self.manager.upgrade()?;
        manager.resolve(&self.entry)
    }

    /// Current range of the element, tracked through edits without reparsing.
    pub fn range(&self) -> Option<TextRange> {
        let manager = self.manager.upgrade()?;
        let info = self.entry.info.lock().clone();
        info.range(manager.model.as_ref())
    }

    /// The file the element lives in.
    pub fn file(&self) -> FileId {
        self.entry.info.lock().file()
    }

    pub fn kind(&self) -> ElementKind {
        self.entry.kind
    }

    /// `None` once the pointer was invalidated by a file deletion.
    pub fn strategy(&self) -> Option<PointerStrategy> {
        self.entry.info.lock().strategy()
    }

    pub fn ref_count(&self) -> usize {
        self.entry.refs.load(Ordering::Acquire)
    }

    /// Whether both handles share one tracking entry.
    pub fn ptr_eq(&self, other: &SmartPointer) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Clone for SmartPointer {
    fn clone(&self) -> Self {
        self.entry.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(&self.entry),
            manager: self.manager.clone(),
        }
    }
}

impl Drop for SmartPointer {
    fn drop(&mut self) {
        match self.manager.upgrade() {
            Some(manager) => manager.release(&self.entry),
            None => {
                self.entry.refs.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl fmt::Debug for SmartPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.entry.info.lock();
        f.debug_struct("SmartPointer")
            .field("id", &self.entry.id)
            .field("kind", &self.entry.kind)
            .field("strategy", &info.strategy())
            .field("file", &info.file())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Pins pointer anchors to range markers for the duration of each edit.
struct BeltListener {
    manager: Weak<ManagerInner>,
}

impl BeltListener {
    fn entries(&self, file: FileId) -> Option<(Arc<ManagerInner>, Vec<Arc<PointerEntry>>)> {
        let manager = self.manager.upgrade()?;
        let entries = manager.registry.lock().entries_in(file);
        Some((manager, entries))
    }
}

impl DocumentListener for BeltListener {
    fn before_change(&self, document: &Document, event: &DocumentEvent) {
        let Some((manager, entries)) = self.entries(event.file) else {
            return;
        };
        manager.model.lock().assert_write_access();
        for entry in entries {
            entry.info.lock().fasten(document);
        }
    }

    fn after_change(&self, _document: &Document, event: &DocumentEvent) {
        let Some((_, entries)) = self.entries(event.file) else {
            return;
        };
        let mut dead = 0usize;
        for entry in entries {
            let mut info = entry.info.lock();
            info.unfasten();
            // Every edit produces a new tree; the element is found again on next access.
            *entry.cached.lock() = None;
            if !info.is_alive() {
                dead += 1;
            }
        }
        if dead > 0 {
            tracing::debug!(
                target: "drift.pointers",
                file = %event.file,
                dead,
                "edit destroyed pointer anchors"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use drift_core::{ModelLock, TextSize};

    use super::*;
    use crate::source::SourceStore;
    use crate::tree::TreeBuilder;

    fn range(start: u32, end: u32) -> TextRange {
        TextRange::new(TextSize::from(start), TextSize::from(end))
    }

    fn setup(text: &str) -> (Arc<ModelLock>, Arc<SourceStore>, SmartPointerManager) {
        let lock = Arc::new(ModelLock::new());
        let store = SourceStore::with_token_parser(lock.clone());
        store.open(FileId::from_raw(1), text);
        let manager = SmartPointerManager::new(store.clone());
        (lock, store, manager)
    }

    #[test]
    fn last_drop_unregisters() {
        let (_lock, store, manager) = setup("a b c");
        let tree = store.tree(FileId::from_raw(1)).unwrap();
        let b = tree.find_element(range(2, 3), ElementKind::Ident).unwrap();

        let first = manager.create_pointer(&b, None);
        let second = first.clone();
        assert_eq!(first.ref_count(), 2);
        drop(second);
        assert_eq!(first.ref_count(), 1);
        assert_eq!(manager.pointers_in(FileId::from_raw(1)).len(), 1);

        manager.remove_pointer(first);
        assert!(manager.pointers_in(FileId::from_raw(1)).is_empty());

        let fresh = manager.create_pointer(&b, None);
        assert_eq!(fresh.ref_count(), 1);
    }

    #[test]
    fn cached_element_is_reused_until_the_tree_changes() {
        let (lock, store, manager) = setup("a b c");
        let tree = store.tree(FileId::from_raw(1)).unwrap();
        let c = tree.find_element(range(4, 5), ElementKind::Ident).unwrap();
        let pointer = manager.create_pointer(&c, None);
        assert_eq!(pointer.element(), Some(c.clone()));

        {
            let _write = lock.write();
            let document = store.cached_document(FileId::from_raw(1)).unwrap();
            document.lock().insert(TextSize::from(0), "z ").unwrap();
        }
        let moved = pointer.element().unwrap();
        assert_ne!(moved, c);
        assert_eq!(moved.range(), range(6, 7));

        // The pointer is now also found through the element it resolved to.
        let again = manager.create_pointer(&moved, None);
        assert!(again.ptr_eq(&pointer));
    }

    #[test]
    fn non_physical_trees_use_hard_pointers() {
        let (_lock, _store, manager) = setup("");
        let mut builder = TreeBuilder::new(FileId::from_raw(9)).physical(false);
        builder.token(ElementKind::Ident, TextSize::from(3));
        let tree = Arc::new(builder.finish());
        let element = tree.elements().nth(1).unwrap();

        let pointer = manager.create_pointer(&element, None);
        assert_eq!(pointer.strategy(), Some(PointerStrategy::Hard));
        assert_eq!(pointer.element(), Some(element));
    }
}
