use std::collections::{BTreeMap, HashSet};
use std::io;

use parking_lot::Mutex;

use crate::fs::{FileAttributes, FileKind, FileSystem};
use crate::path::VfsPath;

#[derive(Debug, Clone)]
struct MemoryNode {
    attributes: FileAttributes,
    contents: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<VfsPath, MemoryNode>,
    clock: u64,
    failing: HashSet<VfsPath>,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn node(&self, path: &VfsPath) -> io::Result<&MemoryNode> {
        if self.failing.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("injected failure ({path})"),
            ));
        }
        self.nodes.get(path).ok_or_else(|| not_found(path))
    }

    fn require_dir(&self, path: &VfsPath) -> io::Result<()> {
        match self.nodes.get(path) {
            Some(node) if node.attributes.is_dir() => Ok(()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory ({path})"),
            )),
            None => Err(not_found(path)),
        }
    }

    fn require_parent(&self, path: &VfsPath) -> io::Result<()> {
        match path.parent() {
            Some(parent) => self.require_dir(&parent),
            None => Ok(()),
        }
    }

    fn subtree(&self, path: &VfsPath) -> Vec<VfsPath> {
        self.nodes
            .range(path.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(path))
            .cloned()
            .collect()
    }
}

fn not_found(path: &VfsPath) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such entry ({path})"))
}

/// In-memory [`FileSystem`] with a logical modification clock.
///
/// Every mutation advances the clock, so two writes of the same length are still reported as a
/// content change. Paths registered with [`MemoryFs::fail_on`] return an error from every read
/// operation, which lets tests exercise I/O failures during a scan.
#[derive(Debug, Default)]
pub struct MemoryFs {
    state: Mutex<MemoryState>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory and any missing ancestors.
    pub fn create_dir_all(&self, path: &VfsPath) {
        let mut state = self.state.lock();
        let mut missing = Vec::new();
        let mut cur = Some(path.clone());
        while let Some(dir) = cur {
            if state.nodes.contains_key(&dir) {
                break;
            }
            cur = dir.parent();
            missing.push(dir);
        }
        for dir in missing.into_iter().rev() {
            let modified = state.tick();
            state.nodes.insert(
                dir,
                MemoryNode {
                    attributes: FileAttributes::directory(modified),
                    contents: Vec::new(),
                },
            );
        }
    }

    /// Writes a file, creating parent directories as needed.
    pub fn write(&self, path: &VfsPath, contents: impl Into<Vec<u8>>) {
        if let Some(parent) = path.parent() {
            self.create_dir_all(&parent);
        }
        let contents = contents.into();
        let mut state = self.state.lock();
        let modified = state.tick();
        let (writable, hidden) = state
            .nodes
            .get(path)
            .filter(|node| !node.attributes.is_dir())
            .map(|node| (node.attributes.writable, node.attributes.hidden))
            .unwrap_or((true, false));
        state.nodes.insert(
            path.clone(),
            MemoryNode {
                attributes: FileAttributes {
                    writable,
                    hidden,
                    ..FileAttributes::file(contents.len() as u64, modified)
                },
                contents,
            },
        );
    }

    /// Removes an entry and everything below it. Returns `false` if nothing was there.
    pub fn remove_all(&self, path: &VfsPath) -> bool {
        let mut state = self.state.lock();
        let doomed = state.subtree(path);
        for key in &doomed {
            state.nodes.remove(key);
        }
        !doomed.is_empty()
    }

    /// Bumps the modification time of an entry without touching its contents.
    pub fn touch(&self, path: &VfsPath) -> bool {
        let mut state = self.state.lock();
        let modified = state.tick();
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.attributes.modified = modified;
                true
            }
            None => false,
        }
    }

    pub fn set_writable(&self, path: &VfsPath, writable: bool) -> bool {
        self.update(path, |attrs| attrs.writable = writable)
    }

    pub fn set_hidden(&self, path: &VfsPath, hidden: bool) -> bool {
        self.update(path, |attrs| attrs.hidden = hidden)
    }

    /// Makes every read of `path` fail until [`MemoryFs::clear_failures`] is called.
    pub fn fail_on(&self, path: &VfsPath) {
        self.state.lock().failing.insert(path.clone());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// All paths currently present, in sorted order.
    pub fn paths(&self) -> Vec<VfsPath> {
        self.state.lock().nodes.keys().cloned().collect()
    }

    fn update(&self, path: &VfsPath, f: impl FnOnce(&mut FileAttributes)) -> bool {
        let mut state = self.state.lock();
        match state.nodes.get_mut(path) {
            Some(node) => {
                f(&mut node.attributes);
                true
            }
            None => false,
        }
    }
}

impl FileSystem for MemoryFs {
    fn list(&self, path: &VfsPath) -> io::Result<Vec<String>> {
        let state = self.state.lock();
        let node = state.node(path)?;
        if !node.attributes.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory ({path})"),
            ));
        }
        Ok(state
            .nodes
            .range(path.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(path))
            .filter(|key| key.parent().as_ref() == Some(path))
            .map(VfsPath::file_name)
            .collect())
    }

    fn attributes(&self, path: &VfsPath) -> io::Result<FileAttributes> {
        self.state.lock().node(path).map(|node| node.attributes)
    }

    fn read_bytes(&self, path: &VfsPath) -> io::Result<Vec<u8>> {
        let state = self.state.lock();
        let node = state.node(path)?;
        match node.attributes.kind {
            FileKind::File => Ok(node.contents.clone()),
            FileKind::Directory => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("is a directory ({path})"),
            )),
        }
    }

    fn write_bytes(&self, path: &VfsPath, contents: &[u8]) -> io::Result<()> {
        {
            let state = self.state.lock();
            state.require_parent(path)?;
            if state.nodes.get(path).is_some_and(|node| node.attributes.is_dir()) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("is a directory ({path})"),
                ));
            }
        }
        self.write(path, contents);
        Ok(())
    }

    fn create_dir(&self, path: &VfsPath) -> io::Result<()> {
        let mut state = self.state.lock();
        state.require_parent(path)?;
        if state.nodes.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("entry already exists ({path})"),
            ));
        }
        let modified = state.tick();
        state.nodes.insert(
            path.clone(),
            MemoryNode {
                attributes: FileAttributes::directory(modified),
                contents: Vec::new(),
            },
        );
        Ok(())
    }

    fn remove(&self, path: &VfsPath) -> io::Result<()> {
        if self.remove_all(path) {
            Ok(())
        } else {
            Err(not_found(path))
        }
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath) -> io::Result<()> {
        let mut state = self.state.lock();
        state.node(from)?;
        state.require_parent(to)?;
        if state.nodes.contains_key(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("entry already exists ({to})"),
            ));
        }
        for old in state.subtree(from) {
            let Some(node) = state.nodes.remove(&old) else {
                continue;
            };
            state.nodes.insert(rebase(&old, from, to), node);
        }
        Ok(())
    }
}

/// Rewrites `path` (which lives below `from`) to the same position below `to`.
fn rebase(path: &VfsPath, from: &VfsPath, to: &VfsPath) -> VfsPath {
    let mut segments = Vec::new();
    let mut cur = path.clone();
    while &cur != from {
        segments.push(cur.file_name());
        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }
    segments
        .iter()
        .rev()
        .fold(to.clone(), |acc, segment| acc.join(segment))
}
