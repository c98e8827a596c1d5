use std::sync::Arc;

use drift_core::{FileId, TextRange};

use crate::document::Document;
use crate::marker::RangeMarker;
use crate::source::SourceModel;
use crate::tree::{Element, ElementKind};

/// How a pointer finds its element again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerStrategy {
    /// Re-anchored by (file, range, kind) against the current tree.
    SelfRange,
    /// The root of a file.
    File,
    /// Holds the element itself; used for trees that have no document.
    Hard,
    /// Anchored in the host of an injected file.
    Injected,
}

/// A text range that follows document edits while a pointer is alive.
///
/// Outside of an edit the range is a plain pair of offsets. During an edit the manager
/// fastens it to a [`RangeMarker`] and reads the shifted range back afterwards. The marker is
/// dropped on unfasten; documents hold markers weakly, so nothing is kept alive between edits.
#[derive(Debug, Clone)]
pub(crate) struct RangeAnchor {
    /// `None` once the anchored text was destroyed.
    range: Option<TextRange>,
    fastened: Option<RangeMarker>,
}

impl RangeAnchor {
    pub(crate) fn new(range: TextRange) -> Self {
        Self {
            range: Some(range),
            fastened: None,
        }
    }

    pub(crate) fn range(&self) -> Option<TextRange> {
        match &self.fastened {
            Some(marker) => marker.range(),
            None => self.range,
        }
    }

    pub(crate) fn fasten(&mut self, document: &Document) {
        if self.fastened.is_some() {
            return;
        }
        let Some(range) = self.range else {
            return;
        };
        match document.create_range_marker(range) {
            Ok(marker) => self.fastened = Some(marker),
            // The range no longer fits the document text.
            Err(_) => self.range = None,
        }
    }

    pub(crate) fn unfasten(&mut self) {
        if let Some(marker) = self.fastened.take() {
            self.range = marker.range();
        }
    }

    fn kill(&mut self) {
        self.range = None;
        self.fastened = None;
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ElementInfo {
    SelfRange {
        file: FileId,
        kind: ElementKind,
        anchor: RangeAnchor,
    },
    File {
        file: FileId,
    },
    Hard {
        element: Element,
    },
    Injected {
        host_file: FileId,
        injected_file: FileId,
        kind: ElementKind,
        /// In host coordinates.
        anchor: RangeAnchor,
    },
    /// The file went away; nothing resolves any more.
    Invalid {
        file: FileId,
    },
}

impl ElementInfo {
    /// Picks the strategy for `element`.
    ///
    /// `containing_file` overrides the file the element's tree reports.
    pub(crate) fn create(
        element: &Element,
        containing_file: Option<FileId>,
        model: &dyn SourceModel,
    ) -> Self {
        if !element.is_physical() {
            return ElementInfo::Hard {
                element: element.clone(),
            };
        }
        let file = containing_file.unwrap_or_else(|| element.file());
        if element.kind() == ElementKind::File && element.parent().is_none() {
            return ElementInfo::File { file };
        }
        if let Some(injection) = model.injection_for(file) {
            if let Some(host_range) = injection.injected_to_host(element.range()) {
                return ElementInfo::Injected {
                    host_file: injection.host_file,
                    injected_file: file,
                    kind: element.kind(),
                    anchor: RangeAnchor::new(host_range),
                };
            }
        }
        ElementInfo::SelfRange {
            file,
            kind: element.kind(),
            anchor: RangeAnchor::new(element.range()),
        }
    }

    pub(crate) fn strategy(&self) -> Option<PointerStrategy> {
        match self {
            ElementInfo::SelfRange { .. } => Some(PointerStrategy::SelfRange),
            ElementInfo::File { .. } => Some(PointerStrategy::File),
            ElementInfo::Hard { .. } => Some(PointerStrategy::Hard),
            ElementInfo::Injected { .. } => Some(PointerStrategy::Injected),
            ElementInfo::Invalid { .. } => None,
        }
    }

    /// The file whose edits move this pointer.
    pub(crate) fn anchor_file(&self) -> FileId {
        match self {
            ElementInfo::SelfRange { file, .. }
            | ElementInfo::File { file }
            | ElementInfo::Invalid { file } => *file,
            ElementInfo::Hard { element } => element.file(),
            ElementInfo::Injected { host_file, .. } => *host_file,
        }
    }

    /// The file the element lives in.
    pub(crate) fn file(&self) -> FileId {
        match self {
            ElementInfo::Injected { injected_file, .. } => *injected_file,
            other => other.anchor_file(),
        }
    }

    pub(crate) fn fasten(&mut self, document: &Document) {
        if let ElementInfo::SelfRange { anchor, .. } | ElementInfo::Injected { anchor, .. } = self {
            anchor.fasten(document);
        }
    }

    pub(crate) fn unfasten(&mut self) {
        if let ElementInfo::SelfRange { anchor, .. } | ElementInfo::Injected { anchor, .. } = self {
            anchor.unfasten();
        }
    }

    pub(crate) fn invalidate(&mut self) {
        match self {
            ElementInfo::SelfRange { anchor, .. } | ElementInfo::Injected { anchor, .. } => {
                anchor.kill()
            }
            ElementInfo::File { file } => *self = ElementInfo::Invalid { file: *file },
            ElementInfo::Hard { .. } | ElementInfo::Invalid { .. } => {}
        }
    }

    /// Whether the anchored text still exists. Says nothing about the tree.
    pub(crate) fn is_alive(&self) -> bool {
        match self {
            ElementInfo::SelfRange { anchor, .. } | ElementInfo::Injected { anchor, .. } => {
                anchor.range().is_some()
            }
            ElementInfo::File { .. } | ElementInfo::Hard { .. } => true,
            ElementInfo::Invalid { .. } => false,
        }
    }

    /// Current range of the element in its own file's coordinates.
    pub(crate) fn range(&self, model: &dyn SourceModel) -> Option<TextRange> {
        match self {
            ElementInfo::SelfRange { file, anchor, .. } => {
                if !model.is_valid(*file) {
                    return None;
                }
                anchor.range()
            }
            ElementInfo::File { file } => {
                let document = model.cached_document(*file)?;
                let len = document.lock().len();
                Some(TextRange::up_to(len))
            }
            ElementInfo::Hard { element } => Some(element.range()),
            ElementInfo::Injected {
                injected_file,
                anchor,
                ..
            } => model
                .injection_for(*injected_file)?
                .host_to_injected(anchor.range()?),
            ElementInfo::Invalid { .. } => None,
        }
    }

    /// Finds the element again. `cached` is returned as-is when it is still current.
    pub(crate) fn restore(
        &self,
        model: &dyn SourceModel,
        cached: Option<&Element>,
    ) -> Option<Element> {
        match self {
            ElementInfo::Hard { element } => Some(element.clone()),
            ElementInfo::File { file } => model.tree(*file).map(|tree| tree.root()),
            ElementInfo::SelfRange { file, kind, .. } => {
                let range = self.range(model)?;
                find(model, *file, range, *kind, cached)
            }
            ElementInfo::Injected {
                injected_file,
                kind,
                ..
            } => {
                let range = self.range(model)?;
                model.cached_document(*injected_file)?;
                find(model, *injected_file, range, *kind, cached)
            }
            ElementInfo::Invalid { .. } => None,
        }
    }
}

fn find(
    model: &dyn SourceModel,
    file: FileId,
    range: TextRange,
    kind: ElementKind,
    cached: Option<&Element>,
) -> Option<Element> {
    let tree = model.tree(file)?;
    if let Some(cached) = cached {
        if Arc::ptr_eq(cached.tree(), &tree) && cached.range() == range && cached.kind() == kind {
            return Some(cached.clone());
        }
    }
    tree.find_element(range, kind)
}
