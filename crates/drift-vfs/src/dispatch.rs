use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use drift_core::{FileId, ModelLock};
use parking_lot::RwLock;

use crate::cache::VfsCache;
use crate::error::{Result, VfsError};
use crate::event::{ChangeEvent, FileProperty};
use crate::listener::{BulkFileListener, ListenerId};
use crate::path::VfsPath;

/// Collapses a raw batch of events into the batch listeners see.
///
/// Overlapping refresh roots can report the same change twice. Duplicates are dropped, repeated
/// content changes keep the latest attributes, repeated property changes keep the first old and
/// the last new value (and vanish if those are equal), and anything below a deleted path is
/// dropped because the deletion already covers it. Order of first appearance is kept.
pub fn merge_events(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let deleted: Vec<VfsPath> = events
        .iter()
        .filter(|event| matches!(event, ChangeEvent::Deleted { .. }))
        .map(|event| event.path().clone())
        .collect();
    let below_deleted =
        |path: &VfsPath| deleted.iter().any(|dir| dir != path && path.starts_with(dir));

    let mut out: Vec<ChangeEvent> = Vec::with_capacity(events.len());
    let mut created: HashSet<VfsPath> = HashSet::new();
    let mut removed: HashSet<FileId> = HashSet::new();
    let mut content: HashMap<FileId, usize> = HashMap::new();
    let mut properties: HashMap<(FileId, FileProperty), usize> = HashMap::new();

    for event in events {
        if below_deleted(event.path()) {
            continue;
        }
        match &event {
            ChangeEvent::Created { path, .. } => {
                if !created.insert(path.clone()) {
                    continue;
                }
            }
            ChangeEvent::Deleted { file, .. } => {
                if !removed.insert(*file) {
                    continue;
                }
            }
            ChangeEvent::ContentChanged { file, .. } => {
                let file = *file;
                if let Some(&idx) = content.get(&file) {
                    out[idx] = event;
                    continue;
                }
                content.insert(file, out.len());
            }
            ChangeEvent::PropertyChanged {
                file,
                property,
                new,
                ..
            } => {
                if let Some(&idx) = properties.get(&(*file, *property)) {
                    if let ChangeEvent::PropertyChanged { new: merged, .. } = &mut out[idx] {
                        *merged = new.clone();
                    }
                    continue;
                }
                properties.insert((*file, *property), out.len());
            }
            ChangeEvent::Moved { .. } => {
                if out.contains(&event) {
                    continue;
                }
            }
        }
        out.push(event);
    }

    out.retain(|event| !matches!(event, ChangeEvent::PropertyChanged { old, new, .. } if old == new));
    out
}

/// Fans event batches out to registered listeners and applies them to the cache.
pub(crate) struct EventDispatcher {
    cache: Arc<VfsCache>,
    lock: Arc<ModelLock>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn BulkFileListener>)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub(crate) fn new(cache: Arc<VfsCache>, lock: Arc<ModelLock>) -> Self {
        Self {
            cache,
            lock,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn BulkFileListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Merges, validates, and publishes one batch. Returns the events that were applied.
    ///
    /// Takes the model write lock (re-entrantly). Every listener is notified even if an earlier
    /// one fails; the first failure is returned after the batch has been applied.
    pub(crate) fn fire(&self, events: Vec<ChangeEvent>) -> Result<Vec<ChangeEvent>> {
        let _write = self.lock.write();

        let events: Vec<ChangeEvent> = merge_events(events)
            .into_iter()
            .filter(|event| {
                let applicable = self.cache.is_applicable(event);
                if !applicable {
                    tracing::trace!(target: "drift.vfs", ?event, "dropping stale change event");
                }
                applicable
            })
            .collect();
        if events.is_empty() {
            return Ok(events);
        }

        tracing::debug!(target: "drift.vfs", count = events.len(), "firing change events");
        let listeners: Vec<Arc<dyn BulkFileListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut failure: Option<anyhow::Error> = None;
        for listener in &listeners {
            if let Err(err) = listener.before(&events) {
                tracing::error!(target: "drift.vfs", error = %format!("{err:#}"), "file listener failed before change");
                failure.get_or_insert(err);
            }
        }
        for event in &events {
            self.cache.apply(event);
        }
        for listener in &listeners {
            if let Err(err) = listener.after(&events) {
                tracing::error!(target: "drift.vfs", error = %format!("{err:#}"), "file listener failed after change");
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(VfsError::Listener(err)),
            None => Ok(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::PropertyValue;

    fn deleted(path: &str, raw: u32) -> ChangeEvent {
        ChangeEvent::Deleted {
            path: VfsPath::local(path),
            file: FileId::from_raw(raw),
        }
    }

    fn writable(raw: u32, old: bool, new: bool) -> ChangeEvent {
        ChangeEvent::PropertyChanged {
            path: VfsPath::local("/w/f"),
            file: FileId::from_raw(raw),
            property: FileProperty::Writable,
            old: PropertyValue::Bool(old),
            new: PropertyValue::Bool(new),
        }
    }

    #[test]
    fn drops_duplicates_and_events_below_deleted_directories() {
        let merged = merge_events(vec![
            deleted("/w/dir", 1),
            deleted("/w/dir/child", 2),
            deleted("/w/dir", 1),
            deleted("/w/dirty", 3),
        ]);
        assert_eq!(merged, vec![deleted("/w/dir", 1), deleted("/w/dirty", 3)]);
    }

    #[test]
    fn property_changes_fold_and_cancel_out() {
        assert_eq!(
            merge_events(vec![writable(1, true, false), writable(1, false, true)]),
            Vec::new()
        );
        assert_eq!(
            merge_events(vec![writable(1, true, false), writable(1, true, false)]),
            vec![writable(1, true, false)]
        );
    }
}
