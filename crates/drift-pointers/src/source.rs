use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use drift_core::{FileId, ModelLock, TextRange};
use parking_lot::{Mutex, RwLock};

use crate::document::{Document, DocumentEvent, DocumentListener};
use crate::error::DocumentError;
use crate::marker::RangeMarker;
use crate::parser::{Parser, TokenParser};
use crate::tree::ElementTree;

pub type SharedDocument = Arc<Mutex<Document>>;

/// A fragment of one file's text that is also exposed as a file of its own.
///
/// Injected file offsets map to host offsets by adding the start of [`Injection::host_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
    pub host_file: FileId,
    pub injected_file: FileId,
    /// Where the injected text currently lives in the host document.
    pub host_range: TextRange,
}

impl Injection {
    /// Maps a host range into injected coordinates, if it lies within the injection.
    pub fn host_to_injected(&self, range: TextRange) -> Option<TextRange> {
        if !self.host_range.contains_range(range) {
            return None;
        }
        range.checked_sub(self.host_range.start())
    }

    pub fn injected_to_host(&self, range: TextRange) -> Option<TextRange> {
        let host = range.checked_add(self.host_range.start())?;
        self.host_range.contains_range(host).then_some(host)
    }
}

/// What smart pointers need from the document and tree layer.
pub trait SourceModel: Send + Sync {
    fn lock(&self) -> &Arc<ModelLock>;

    /// Whether `file` is still known to the model.
    fn is_valid(&self, file: FileId) -> bool;

    /// The open document for `file`, if any.
    fn cached_document(&self, file: FileId) -> Option<SharedDocument>;

    /// An element tree matching the current text of `file`.
    fn tree(&self, file: FileId) -> Option<Arc<ElementTree>>;

    /// The injection that produced `injected`, if it is still alive.
    fn injection_for(&self, injected: FileId) -> Option<Injection>;

    /// The live injection of `host` whose text contains `host_range`.
    fn injection_at(&self, host: FileId, host_range: TextRange) -> Option<Injection>;

    /// Registers `listener` on every document, present and future.
    fn add_document_listener(&self, listener: Arc<dyn DocumentListener>);
}

struct SourceFile {
    document: SharedDocument,
    tree: Option<Arc<ElementTree>>,
}

struct InjectionEntry {
    host: FileId,
    injected: FileId,
    marker: RangeMarker,
}

/// Open documents, their parsed trees, and the injections between them.
///
/// Trees are reparsed lazily: [`SourceModel::tree`] compares the cached tree's stamp with the
/// document's and reparses when they differ. Edits made to a host inside an injection are
/// replayed onto the injected document, and direct edits of an injected document are replayed
/// onto its host.
pub struct SourceStore {
    lock: Arc<ModelLock>,
    parser: Arc<dyn Parser>,
    files: RwLock<HashMap<FileId, SourceFile>>,
    injections: Mutex<Vec<InjectionEntry>>,
    listeners: Arc<Multicaster>,
}

impl SourceStore {
    pub fn new(lock: Arc<ModelLock>, parser: Arc<dyn Parser>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SourceStore>| {
            let listeners = Arc::new(Multicaster::default());
            listeners.add(Arc::new(InjectionSync {
                store: weak.clone(),
                pending: Mutex::new(Vec::new()),
                syncing: Mutex::new(HashSet::new()),
            }));
            SourceStore {
                lock,
                parser,
                files: RwLock::new(HashMap::new()),
                injections: Mutex::new(Vec::new()),
                listeners,
            }
        })
    }

    pub fn with_token_parser(lock: Arc<ModelLock>) -> Arc<Self> {
        Self::new(lock, Arc::new(TokenParser))
    }

    /// Opens `file` with `text`, or returns the already open document.
    pub fn open(&self, file: FileId, text: impl Into<String>) -> SharedDocument {
        let mut files = self.files.write();
        if let Some(existing) = files.get(&file) {
            return Arc::clone(&existing.document);
        }
        let mut document = Document::new(file, text, Arc::clone(&self.lock));
        document.add_listener(self.listeners.clone());
        let document = Arc::new(Mutex::new(document));
        files.insert(
            file,
            SourceFile {
                document: Arc::clone(&document),
                tree: None,
            },
        );
        tracing::debug!(target: "drift.pointers", file = %file, "document opened");
        document
    }

    /// Replaces the cached tree of an open file.
    ///
    /// The tree is served until the document's stamp moves past [`ElementTree::stamp`].
    pub fn set_tree(&self, file: FileId, tree: Arc<ElementTree>) -> Result<(), DocumentError> {
        let mut files = self.files.write();
        let entry = files
            .get_mut(&file)
            .ok_or(DocumentError::DocumentNotOpen(file))?;
        entry.tree = Some(tree);
        Ok(())
    }

    /// Exposes `range` of `host` as the document `injected`.
    pub fn register_injection(
        &self,
        host: FileId,
        range: TextRange,
        injected: FileId,
    ) -> Result<SharedDocument, DocumentError> {
        let host_document = self
            .cached_document(host)
            .ok_or(DocumentError::DocumentNotOpen(host))?;
        let (marker, text) = {
            let document = host_document.lock();
            let marker = document.create_range_marker(range)?;
            let text = document
                .text()
                .get(std::ops::Range::<usize>::from(range))
                .ok_or(DocumentError::InvalidRange)?
                .to_string();
            (marker, text)
        };
        let document = self.open(injected, text);
        self.injections.lock().push(InjectionEntry {
            host,
            injected,
            marker,
        });
        Ok(document)
    }

    /// Forgets `file` along with every injection it hosts or is.
    ///
    /// Returns all files that were dropped, `file` first.
    pub fn file_deleted(&self, file: FileId) -> Vec<FileId> {
        let mut dropped = vec![file];
        {
            let mut injections = self.injections.lock();
            injections.retain(|entry| {
                if entry.host == file {
                    dropped.push(entry.injected);
                    false
                } else {
                    entry.injected != file
                }
            });
        }
        let mut files = self.files.write();
        dropped.retain(|id| files.remove(id).is_some() || *id == file);
        tracing::debug!(target: "drift.pointers", file = %file, dropped = dropped.len(), "document closed");
        dropped
    }

    pub fn open_files(&self) -> Vec<FileId> {
        let mut files: Vec<_> = self.files.read().keys().copied().collect();
        files.sort();
        files
    }

    /// Moves the host range of `injected` to `marker`.
    fn reanchor_injection(&self, injected: FileId, marker: RangeMarker) {
        if let Some(entry) = self
            .injections
            .lock()
            .iter_mut()
            .find(|entry| entry.injected == injected)
        {
            entry.marker = marker;
        }
    }

    fn injections_hosted_by(&self, host: FileId) -> Vec<(FileId, RangeMarker)> {
        self.injections
            .lock()
            .iter()
            .filter(|entry| entry.host == host)
            .map(|entry| (entry.injected, entry.marker.clone()))
            .collect()
    }
}

impl SourceModel for SourceStore {
    fn lock(&self) -> &Arc<ModelLock> {
        &self.lock
    }

    fn is_valid(&self, file: FileId) -> bool {
        self.files.read().contains_key(&file)
    }

    fn cached_document(&self, file: FileId) -> Option<SharedDocument> {
        self.files
            .read()
            .get(&file)
            .map(|entry| Arc::clone(&entry.document))
    }

    /// Must not be called while the document of `file` is locked by the current thread.
    fn tree(&self, file: FileId) -> Option<Arc<ElementTree>> {
        let (document, cached) = {
            let files = self.files.read();
            let entry = files.get(&file)?;
            (Arc::clone(&entry.document), entry.tree.clone())
        };
        let (text, stamp) = {
            let document = document.lock();
            (document.text_arc(), document.modification_stamp())
        };
        if let Some(tree) = cached.filter(|tree| tree.stamp() == stamp) {
            return Some(tree);
        }

        let tree = Arc::new(self.parser.parse(file, &text, stamp));
        tracing::trace!(target: "drift.pointers", file = %file, stamp, nodes = tree.len(), "reparsed");
        if let Some(entry) = self.files.write().get_mut(&file) {
            if !matches!(&entry.tree, Some(current) if current.stamp() == stamp) {
                entry.tree = Some(Arc::clone(&tree));
            }
        }
        Some(tree)
    }

    fn injection_for(&self, injected: FileId) -> Option<Injection> {
        let injections = self.injections.lock();
        let entry = injections.iter().find(|entry| entry.injected == injected)?;
        Some(Injection {
            host_file: entry.host,
            injected_file: entry.injected,
            host_range: entry.marker.range()?,
        })
    }

    fn injection_at(&self, host: FileId, host_range: TextRange) -> Option<Injection> {
        self.injections
            .lock()
            .iter()
            .filter(|entry| entry.host == host)
            .find_map(|entry| {
                let range = entry.marker.range()?;
                range.contains_range(host_range).then_some(Injection {
                    host_file: entry.host,
                    injected_file: entry.injected,
                    host_range: range,
                })
            })
    }

    fn add_document_listener(&self, listener: Arc<dyn DocumentListener>) {
        self.listeners.add(listener);
    }
}

impl fmt::Debug for SourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceStore")
            .field("files", &self.files.read().len())
            .field("injections", &self.injections.lock().len())
            .finish_non_exhaustive()
    }
}

/// Fans one document's notifications out to every registered listener.
#[derive(Default)]
struct Multicaster {
    listeners: RwLock<Vec<Arc<dyn DocumentListener>>>,
}

impl Multicaster {
    fn add(&self, listener: Arc<dyn DocumentListener>) {
        self.listeners.write().push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn DocumentListener>> {
        self.listeners.read().clone()
    }
}

impl DocumentListener for Multicaster {
    fn before_change(&self, document: &Document, event: &DocumentEvent) {
        for listener in self.snapshot() {
            listener.before_change(document, event);
        }
    }

    fn after_change(&self, document: &Document, event: &DocumentEvent) {
        for listener in self.snapshot() {
            listener.after_change(document, event);
        }
    }
}

/// Keeps hosts and their injected documents in step, in both directions.
struct InjectionSync {
    store: Weak<SourceStore>,
    /// Injections of the host being edited with their pre-edit ranges.
    pending: Mutex<Vec<(FileId, RangeMarker, TextRange)>>,
    /// Injected files with a replay in flight; their own notifications are not echoed back.
    syncing: Mutex<HashSet<FileId>>,
}

impl InjectionSync {
    /// Applies a direct edit of an injected document to its host, then re-anchors the
    /// injection to the new injected length.
    ///
    /// Edits at the injection boundaries would otherwise fall outside the host marker.
    fn replay_into_host(&self, store: &SourceStore, document: &Document, event: &DocumentEvent) {
        let injected = document.file();
        let Some(injection) = store.injection_for(injected) else {
            return;
        };
        let Some(host) = store.cached_document(injection.host_file) else {
            return;
        };
        let Some(host_edit) = event.old_range.checked_add(injection.host_range.start()) else {
            return;
        };
        let inserted = document
            .text()
            .get(std::ops::Range::<usize>::from(event.new_range()))
            .unwrap_or("");

        self.syncing.lock().insert(injected);
        let result = {
            let mut host_document = host.lock();
            host_document.replace(host_edit, inserted).and_then(|()| {
                let range = TextRange::at(injection.host_range.start(), document.len());
                host_document.create_range_marker(range)
            })
        };
        self.syncing.lock().remove(&injected);

        match result {
            Ok(marker) => store.reanchor_injection(injected, marker),
            Err(err) => tracing::warn!(
                target: "drift.pointers",
                host = %injection.host_file,
                injected = %injected,
                error = %err,
                "failed to replay injected edit onto host"
            ),
        }
    }
}

impl DocumentListener for InjectionSync {
    fn before_change(&self, document: &Document, _event: &DocumentEvent) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut pending = self.pending.lock();
        pending.clear();
        for (injected, marker) in store.injections_hosted_by(document.file()) {
            if let Some(range) = marker.range() {
                pending.push((injected, marker, range));
            }
        }
    }

    fn after_change(&self, document: &Document, event: &DocumentEvent) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let pending = std::mem::take(&mut *self.pending.lock());
        for (injected, marker, old_host_range) in pending {
            if self.syncing.lock().contains(&injected) {
                continue;
            }
            let Some(new_host_range) = marker.range() else {
                continue;
            };
            let edit = event.old_range;
            let overlaps =
                edit.start() < old_host_range.end() && edit.end() > old_host_range.start();
            let inserts_inside = edit.is_empty()
                && edit.start() > old_host_range.start()
                && edit.start() < old_host_range.end();
            if !overlaps && !inserts_inside {
                continue;
            }
            let Some(target) = store.cached_document(injected) else {
                continue;
            };

            self.syncing.lock().insert(injected);
            let result = if old_host_range.contains_range(edit) {
                let inserted = document
                    .text()
                    .get(std::ops::Range::<usize>::from(event.new_range()))
                    .unwrap_or("");
                match edit.checked_sub(old_host_range.start()) {
                    Some(local) => target.lock().replace(local, inserted),
                    None => Err(DocumentError::InvalidRange),
                }
            } else {
                let text = document
                    .text()
                    .get(std::ops::Range::<usize>::from(new_host_range))
                    .unwrap_or("");
                let mut target = target.lock();
                let whole = TextRange::up_to(target.len());
                target.replace(whole, text)
            };
            self.syncing.lock().remove(&injected);
            if let Err(err) = result {
                tracing::warn!(
                    target: "drift.pointers",
                    host = %document.file(),
                    injected = %injected,
                    error = %err,
                    "failed to sync injected document"
                );
            }
        }

        if !self.syncing.lock().contains(&document.file()) {
            self.replay_into_host(&store, document, event);
        }
    }
}
