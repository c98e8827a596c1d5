use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A path that can be resolved by the VFS.
///
/// Local paths are lexically normalized on construction so that the same file always maps to
/// the same cache record, regardless of `.`/`..` segments in the caller's spelling.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VfsPath {
    /// A file on the local OS file system.
    Local(PathBuf),
    /// An entry inside a zip/jar archive.
    Archive(ArchivePath),
}

/// An entry inside an archive. The archive root has an empty `entry`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchivePath {
    pub archive: PathBuf,
    pub entry: String,
}

impl ArchivePath {
    pub fn is_root(&self) -> bool {
        self.entry.is_empty()
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jar:{}!/{}", self.archive.display(), self.entry)
    }
}

impl VfsPath {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::Local(normalize_local_path(&path))
    }

    /// Builds a path to `entry` inside `archive`.
    ///
    /// Returns `None` for entries that try to escape the archive (`..`, drive letters).
    pub fn archive(archive: impl Into<PathBuf>, entry: impl AsRef<str>) -> Option<Self> {
        let archive = normalize_local_path(&archive.into());
        let entry = normalize_archive_entry(entry.as_ref())?;
        Some(Self::Archive(ArchivePath { archive, entry }))
    }

    /// The root of `archive`.
    pub fn archive_root(archive: impl Into<PathBuf>) -> Self {
        Self::Archive(ArchivePath {
            archive: normalize_local_path(&archive.into()),
            entry: String::new(),
        })
    }

    pub fn as_local_path(&self) -> Option<&Path> {
        match self {
            VfsPath::Local(path) => Some(path.as_path()),
            VfsPath::Archive(_) => None,
        }
    }

    pub fn as_archive(&self) -> Option<&ArchivePath> {
        match self {
            VfsPath::Archive(path) => Some(path),
            VfsPath::Local(_) => None,
        }
    }

    /// The parent path, or `None` for file-system roots and archive roots.
    pub fn parent(&self) -> Option<VfsPath> {
        match self {
            VfsPath::Local(path) => path.parent().map(|p| VfsPath::Local(p.to_path_buf())),
            VfsPath::Archive(path) => {
                if path.entry.is_empty() {
                    return None;
                }
                let entry = match path.entry.rfind('/') {
                    Some(idx) => path.entry[..idx].to_owned(),
                    None => String::new(),
                };
                Some(VfsPath::Archive(ArchivePath {
                    archive: path.archive.clone(),
                    entry,
                }))
            }
        }
    }

    /// Appends a single entry name.
    pub fn join(&self, name: &str) -> VfsPath {
        match self {
            VfsPath::Local(path) => VfsPath::Local(path.join(name)),
            VfsPath::Archive(path) => {
                let entry = if path.entry.is_empty() {
                    name.to_owned()
                } else {
                    format!("{}/{name}", path.entry)
                };
                VfsPath::Archive(ArchivePath {
                    archive: path.archive.clone(),
                    entry,
                })
            }
        }
    }

    /// The last segment of the path. Roots are named after their full spelling.
    pub fn file_name(&self) -> String {
        match self {
            VfsPath::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            VfsPath::Archive(path) => match path.entry.rsplit('/').next() {
                Some(name) if !name.is_empty() => name.to_owned(),
                _ => path.to_string(),
            },
        }
    }

    /// Returns `true` if `self` equals `ancestor` or lives below it.
    pub fn starts_with(&self, ancestor: &VfsPath) -> bool {
        match (self, ancestor) {
            (VfsPath::Local(path), VfsPath::Local(ancestor)) => path.starts_with(ancestor),
            (VfsPath::Archive(path), VfsPath::Archive(ancestor)) => {
                path.archive == ancestor.archive
                    && (ancestor.entry.is_empty()
                        || path.entry == ancestor.entry
                        || path
                            .entry
                            .strip_prefix(ancestor.entry.as_str())
                            .is_some_and(|rest| rest.starts_with('/')))
            }
            _ => false,
        }
    }
}

impl From<PathBuf> for VfsPath {
    fn from(value: PathBuf) -> Self {
        VfsPath::local(value)
    }
}

impl From<&Path> for VfsPath {
    fn from(value: &Path) -> Self {
        VfsPath::local(value.to_path_buf())
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfsPath::Local(path) => write!(f, "{}", path.display()),
            VfsPath::Archive(archive) => write!(f, "{archive}"),
        }
    }
}

fn normalize_archive_entry(entry: &str) -> Option<String> {
    let entry = entry.trim_start_matches(['/', '\\']);
    let entry = if entry.contains('\\') {
        entry.replace('\\', "/")
    } else {
        entry.to_string()
    };
    let entry = entry.trim_end_matches('/').to_owned();
    let bytes = entry.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return None;
    }
    if entry.contains("//") {
        return None;
    }
    if entry.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(entry)
}

/// Lexically normalizes a local path. Does not touch the file system or resolve symlinks.
pub(crate) fn normalize_local_path(path: &Path) -> PathBuf {
    let mut prefix: Option<OsString> = None;
    let mut has_root = false;
    let mut stack: Vec<OsString> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix_component) => {
                prefix = Some(prefix_component.as_os_str().to_owned());
            }
            Component::RootDir => has_root = true,
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(last) = stack.last() {
                    if last != ".." {
                        stack.pop();
                        continue;
                    }
                }

                if !has_root {
                    stack.push(OsString::from(".."));
                }
            }
            Component::Normal(segment) => stack.push(segment.to_owned()),
        }
    }

    let mut out = PathBuf::new();
    match (prefix, has_root) {
        (Some(mut prefix), true) => {
            prefix.push(std::path::MAIN_SEPARATOR.to_string());
            out.push(prefix);
        }
        (Some(prefix), false) => out.push(prefix),
        (None, true) => out.push(std::path::MAIN_SEPARATOR.to_string()),
        (None, false) => {}
    }
    out.extend(stack);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_paths_remove_dot_segments() {
        assert_eq!(
            VfsPath::local("/a/./b/../c"),
            VfsPath::Local(PathBuf::from("/a/c"))
        );
    }

    #[test]
    fn local_paths_clamp_dotdot_at_root() {
        assert_eq!(VfsPath::local("/../x"), VfsPath::Local(PathBuf::from("/x")));
    }

    #[test]
    fn archive_entries_navigate_like_directories() {
        let entry = VfsPath::archive("/libs/dep.jar", "com/example/A.class").unwrap();
        let parent = entry.parent().unwrap();
        assert_eq!(parent, VfsPath::archive("/libs/dep.jar", "com/example").unwrap());
        assert_eq!(parent.join("A.class"), entry);
        assert_eq!(entry.file_name(), "A.class");

        let root = VfsPath::archive_root("/libs/dep.jar");
        assert!(entry.starts_with(&root));
        assert_eq!(
            VfsPath::archive("/libs/dep.jar", "com").unwrap().parent(),
            Some(root.clone())
        );
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn archive_entries_reject_traversal() {
        assert!(VfsPath::archive("/libs/dep.jar", "../evil").is_none());
        assert!(VfsPath::archive("/libs/dep.jar", "C:/evil").is_none());
    }

    #[test]
    fn starts_with_respects_segment_boundaries() {
        let a = VfsPath::archive("/x.jar", "com/ex").unwrap();
        let b = VfsPath::archive("/x.jar", "com/example/A").unwrap();
        assert!(!b.starts_with(&a));
        assert!(VfsPath::local("/tmp/a/b").starts_with(&VfsPath::local("/tmp/a")));
        assert!(!VfsPath::local("/tmp/ab").starts_with(&VfsPath::local("/tmp/a")));
    }
}
