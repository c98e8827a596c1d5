use std::collections::{BTreeSet, VecDeque};
use std::io;

use drift_config::IgnoredNames;
use drift_core::{CancellationToken, FileId};

use crate::cache::{CachedFile, VfsCache};
use crate::event::{ChangeEvent, FileProperty, PropertyValue};
use crate::fs::{FileAttributes, FileSystem};
use crate::path::VfsPath;

/// Result of scanning one root.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub events: Vec<ChangeEvent>,
    /// Set when the scan stopped early because its token was cancelled. `events` then holds a
    /// partial result that must not be fired.
    pub cancelled: bool,
}

/// Compares the cached tree with the file system and reports the differences as events.
///
/// The worker only reads: it never mutates the cache, so a scan can run without the model lock.
/// Directories whose listing was never loaded are not descended into.
pub struct RefreshWorker<'a> {
    fs: &'a dyn FileSystem,
    cache: &'a VfsCache,
    ignored: &'a IgnoredNames,
}

impl<'a> RefreshWorker<'a> {
    pub fn new(fs: &'a dyn FileSystem, cache: &'a VfsCache, ignored: &'a IgnoredNames) -> Self {
        Self { fs, cache, ignored }
    }

    pub fn scan(&self, root: FileId, recursive: bool, token: &CancellationToken) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let Some(record) = self.cache.get(root) else {
            return outcome;
        };

        match self.fs.attributes(&record.path) {
            Ok(live) if live.kind == record.attributes.kind => {
                diff_attributes(&record, &live, &mut outcome.events);
                if !live.is_dir() {
                    return outcome;
                }
            }
            Ok(live) => {
                self.report_gone_or_replaced(&record, Some(live), &mut outcome.events);
                return outcome;
            }
            Err(err) => {
                tracing::debug!(target: "drift.vfs", path = %record.path, error = %err, "refresh root is gone");
                self.report_gone_or_replaced(&record, None, &mut outcome.events);
                return outcome;
            }
        }

        let mut pending = VecDeque::from([root]);
        while let Some(dir) = pending.pop_front() {
            if token.is_cancelled() {
                outcome.cancelled = true;
                return outcome;
            }
            let Some(dir_record) = self.cache.get(dir) else {
                continue;
            };
            let Some(cached) = self.cache.children(dir) else {
                continue;
            };

            let live_names: BTreeSet<String> = match self.fs.list(&dir_record.path) {
                Ok(names) => names
                    .into_iter()
                    .filter(|name| !self.ignored.is_ignored(name))
                    .collect(),
                Err(err) => {
                    tracing::debug!(
                        target: "drift.vfs",
                        path = %dir_record.path,
                        error = %err,
                        "failed to list directory during refresh"
                    );
                    BTreeSet::new()
                }
            };

            for child in &cached {
                if token.is_cancelled() {
                    outcome.cancelled = true;
                    return outcome;
                }
                if !live_names.contains(&child.name) {
                    outcome.events.push(ChangeEvent::Deleted {
                        path: child.path.clone(),
                        file: child.id,
                    });
                    continue;
                }
                match self.fs.attributes(&child.path) {
                    Ok(live) if live.kind == child.attributes.kind => {
                        diff_attributes(child, &live, &mut outcome.events);
                        if recursive && live.is_dir() && child.children_loaded {
                            pending.push_back(child.id);
                        }
                    }
                    Ok(live) => self.report_gone_or_replaced(child, Some(live), &mut outcome.events),
                    Err(_) => self.report_gone_or_replaced(child, None, &mut outcome.events),
                }
            }

            for name in &live_names {
                if cached.iter().any(|child| &child.name == name) {
                    continue;
                }
                if token.is_cancelled() {
                    outcome.cancelled = true;
                    return outcome;
                }
                let path = dir_record.path.join(name);
                // An entry that vanished between listing and stat is treated as absent.
                let Ok(attributes) = self.fs.attributes(&path) else {
                    continue;
                };
                outcome.events.push(ChangeEvent::Created {
                    path,
                    file: self.cache.allocate_id(),
                    parent: dir,
                    attributes,
                    replaced: None,
                });
            }
        }

        outcome
    }

    fn report_gone_or_replaced(
        &self,
        record: &CachedFile,
        live: Option<FileAttributes>,
        events: &mut Vec<ChangeEvent>,
    ) {
        match (live, record.parent) {
            (Some(attributes), Some(parent)) => events.push(ChangeEvent::Created {
                path: record.path.clone(),
                file: self.cache.allocate_id(),
                parent,
                attributes,
                replaced: Some(record.id),
            }),
            _ => events.push(ChangeEvent::Deleted {
                path: record.path.clone(),
                file: record.id,
            }),
        }
    }
}

fn diff_attributes(record: &CachedFile, live: &FileAttributes, events: &mut Vec<ChangeEvent>) {
    if live.content_differs(&record.attributes) {
        events.push(ChangeEvent::ContentChanged {
            path: record.path.clone(),
            file: record.id,
            attributes: *live,
        });
    }
    if live.writable != record.attributes.writable {
        events.push(ChangeEvent::PropertyChanged {
            path: record.path.clone(),
            file: record.id,
            property: FileProperty::Writable,
            old: PropertyValue::Bool(record.attributes.writable),
            new: PropertyValue::Bool(live.writable),
        });
    }
    if live.hidden != record.attributes.hidden {
        events.push(ChangeEvent::PropertyChanged {
            path: record.path.clone(),
            file: record.id,
            property: FileProperty::Hidden,
            old: PropertyValue::Bool(record.attributes.hidden),
            new: PropertyValue::Bool(live.hidden),
        });
    }
}

/// Lists a directory with ignored names filtered out, stat-ing every entry.
///
/// Entries that cannot be stat-ed are skipped.
pub(crate) fn list_entries(
    fs: &dyn FileSystem,
    path: &VfsPath,
    ignored: &IgnoredNames,
) -> io::Result<Vec<(String, FileAttributes)>> {
    let mut names = fs.list(path)?;
    names.sort();
    Ok(names
        .into_iter()
        .filter(|name| !ignored.is_ignored(name))
        .filter_map(|name| {
            let attributes = fs.attributes(&path.join(&name)).ok()?;
            Some((name, attributes))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::ChangeKind;
    use crate::memory_fs::MemoryFs;

    struct Fixture {
        fs: MemoryFs,
        cache: VfsCache,
        root: FileId,
    }

    impl Fixture {
        fn new() -> Self {
            let fs = MemoryFs::new();
            let root_path = VfsPath::local("/ws");
            fs.write(&root_path.join("a.txt"), "a");
            fs.write(&root_path.join("sub/b.txt"), "b");
            let cache = VfsCache::new();
            let root = cache.insert_root(root_path.clone(), fs.attributes(&root_path).unwrap());
            let fixture = Self { fs, cache, root };
            fixture.load(root);
            let sub = fixture.cache.child_named(root, "sub").unwrap();
            fixture.load(sub);
            fixture
        }

        fn load(&self, id: FileId) {
            let path = self.cache.get(id).unwrap().path;
            let entries = list_entries(&self.fs, &path, &IgnoredNames::none()).unwrap();
            self.cache.load_children(id, entries);
        }

        fn scan(&self, recursive: bool) -> ScanOutcome {
            RefreshWorker::new(&self.fs, &self.cache, &IgnoredNames::none()).scan(
                self.root,
                recursive,
                &CancellationToken::new(),
            )
        }
    }

    fn kinds(outcome: &ScanOutcome) -> Vec<(ChangeKind, String)> {
        outcome
            .events
            .iter()
            .map(|event| (event.kind(), event.path().to_string()))
            .collect()
    }

    #[test]
    fn unchanged_tree_produces_no_events() {
        let fixture = Fixture::new();
        assert!(fixture.scan(true).events.is_empty());
    }

    #[test]
    fn non_recursive_scan_stops_at_direct_children() {
        let fixture = Fixture::new();
        fixture.fs.write(&VfsPath::local("/ws/sub/b.txt"), "changed");
        assert!(fixture.scan(false).events.is_empty());
        assert_eq!(
            kinds(&fixture.scan(true)),
            vec![(ChangeKind::ContentChanged, "/ws/sub/b.txt".to_string())]
        );
    }

    #[test]
    fn kind_change_is_reported_as_a_replacing_creation() {
        let fixture = Fixture::new();
        let old = fixture.cache.child_named(fixture.root, "a.txt").unwrap();
        fixture.fs.remove_all(&VfsPath::local("/ws/a.txt"));
        fixture.fs.create_dir_all(&VfsPath::local("/ws/a.txt"));

        let outcome = fixture.scan(false);
        assert_eq!(outcome.events.len(), 1);
        assert!(matches!(
            &outcome.events[0],
            ChangeEvent::Created { replaced: Some(id), attributes, .. }
                if *id == old && attributes.is_dir()
        ));
    }

    #[test]
    fn unreadable_entries_count_as_absent() {
        let fixture = Fixture::new();
        fixture.fs.fail_on(&VfsPath::local("/ws/a.txt"));
        assert_eq!(
            kinds(&fixture.scan(false)),
            vec![(ChangeKind::Deleted, "/ws/a.txt".to_string())]
        );
    }

    #[test]
    fn cancelled_scan_reports_partial_outcome() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = RefreshWorker::new(&fixture.fs, &fixture.cache, &IgnoredNames::none())
            .scan(fixture.root, true, &token);
        assert!(outcome.cancelled);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn ignored_names_are_never_reported() {
        let fixture = Fixture::new();
        fixture.fs.write(&VfsPath::local("/ws/.git"), "");
        let ignored = IgnoredNames::new(&[".git"]).unwrap();
        let outcome = RefreshWorker::new(&fixture.fs, &fixture.cache, &ignored).scan(
            fixture.root,
            false,
            &CancellationToken::new(),
        );
        assert!(outcome.events.is_empty());
    }
}
