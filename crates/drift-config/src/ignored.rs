use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::ConfigError;

/// Matcher for entry names the VFS never surfaces.
///
/// Patterns are matched against a single path segment (the entry name), not the full path.
#[derive(Debug, Clone)]
pub struct IgnoredNames {
    set: GlobSet,
    patterns: Vec<String>,
}

impl IgnoredNames {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern)
                .map_err(|err| ConfigError::InvalidPattern(format!("{pattern}: {err}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| ConfigError::InvalidPattern(err.to_string()))?;
        Ok(Self {
            set,
            patterns: patterns.iter().map(|p| p.as_ref().to_owned()).collect(),
        })
    }

    /// A matcher that ignores nothing.
    pub fn none() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        !self.patterns.is_empty() && self.set.is_match(name)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for IgnoredNames {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_entry_names() {
        let ignored = IgnoredNames::new(&[".git", "*~"]).unwrap();
        assert!(ignored.is_ignored(".git"));
        assert!(ignored.is_ignored("notes.txt~"));
        assert!(!ignored.is_ignored("main.rs"));
        assert!(!IgnoredNames::none().is_ignored(".git"));
    }
}
