use drift_core::FileId;

use crate::fs::FileAttributes;
use crate::path::VfsPath;

/// A file property whose change is reported through [`ChangeEvent::PropertyChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileProperty {
    /// The entry name (a rename within the same parent).
    Name,
    Writable,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyValue {
    Bool(bool),
    Text(String),
}

/// A change to the file model, detected by a refresh or performed through the VFS.
///
/// `path` is always the path the file had when the event was produced, i.e. *before* the event
/// is applied to the cache. `file` identifies the record the event is about; it is an identity,
/// not an owning handle, and may refer to a record that is invalid by the time a listener sees
/// the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new entry appeared under `parent`.
    ///
    /// `file` is pre-allocated and becomes valid once the event is applied. When an entry changed
    /// kind (file ↔ directory) the old record is reported in `replaced` instead of emitting a
    /// separate deletion for the same path.
    Created {
        path: VfsPath,
        file: FileId,
        parent: FileId,
        attributes: FileAttributes,
        replaced: Option<FileId>,
    },
    Deleted {
        path: VfsPath,
        file: FileId,
    },
    ContentChanged {
        path: VfsPath,
        file: FileId,
        attributes: FileAttributes,
    },
    PropertyChanged {
        path: VfsPath,
        file: FileId,
        property: FileProperty,
        old: PropertyValue,
        new: PropertyValue,
    },
    Moved {
        path: VfsPath,
        file: FileId,
        old_parent: FileId,
        new_parent: FileId,
        new_path: VfsPath,
    },
}

/// Discriminant of a [`ChangeEvent`], handy for assertions and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Deleted,
    ContentChanged,
    PropertyChanged(FileProperty),
    Moved,
}

impl ChangeEvent {
    pub fn path(&self) -> &VfsPath {
        match self {
            ChangeEvent::Created { path, .. }
            | ChangeEvent::Deleted { path, .. }
            | ChangeEvent::ContentChanged { path, .. }
            | ChangeEvent::PropertyChanged { path, .. }
            | ChangeEvent::Moved { path, .. } => path,
        }
    }

    pub fn file(&self) -> FileId {
        match self {
            ChangeEvent::Created { file, .. }
            | ChangeEvent::Deleted { file, .. }
            | ChangeEvent::ContentChanged { file, .. }
            | ChangeEvent::PropertyChanged { file, .. }
            | ChangeEvent::Moved { file, .. } => *file,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Created { .. } => ChangeKind::Created,
            ChangeEvent::Deleted { .. } => ChangeKind::Deleted,
            ChangeEvent::ContentChanged { .. } => ChangeKind::ContentChanged,
            ChangeEvent::PropertyChanged { property, .. } => ChangeKind::PropertyChanged(*property),
            ChangeEvent::Moved { .. } => ChangeKind::Moved,
        }
    }

    /// The path the file has once the event is applied.
    pub fn new_path(&self) -> VfsPath {
        match self {
            ChangeEvent::Moved { new_path, .. } => new_path.clone(),
            ChangeEvent::PropertyChanged {
                path,
                property: FileProperty::Name,
                new: PropertyValue::Text(name),
                ..
            } => match path.parent() {
                Some(parent) => parent.join(name),
                None => path.clone(),
            },
            other => other.path().clone(),
        }
    }
}
