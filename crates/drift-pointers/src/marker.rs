use std::sync::{Arc, Weak};

use drift_core::{FileId, TextRange, TextSize};
use parking_lot::Mutex;

#[derive(Debug)]
pub(crate) struct MarkerInner {
    file: FileId,
    /// `None` once an edit destroyed the marked text.
    range: Mutex<Option<TextRange>>,
}

/// A document range that shifts automatically as the document is edited.
///
/// The owning [`crate::Document`] only holds markers weakly; a marker stops being maintained as
/// soon as the last strong handle is dropped.
#[derive(Debug, Clone)]
pub struct RangeMarker {
    inner: Arc<MarkerInner>,
}

impl RangeMarker {
    pub(crate) fn new(file: FileId, range: TextRange) -> Self {
        Self {
            inner: Arc::new(MarkerInner {
                file,
                range: Mutex::new(Some(range)),
            }),
        }
    }

    pub fn file(&self) -> FileId {
        self.inner.file
    }

    /// The current range, or `None` if the marker was invalidated.
    pub fn range(&self) -> Option<TextRange> {
        *self.inner.range.lock()
    }

    pub fn is_valid(&self) -> bool {
        self.range().is_some()
    }

    pub fn ptr_eq(&self, other: &RangeMarker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn slot(&self) -> Weak<MarkerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_slot(slot: &Weak<MarkerInner>) -> Option<Self> {
        slot.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn apply_edit(&self, edit: TextRange, new_len: TextSize) {
        let mut range = self.inner.range.lock();
        if let Some(current) = *range {
            *range = shift_marker(current, edit, new_len);
        }
    }
}

pub(crate) type MarkerSlot = Weak<MarkerInner>;

/// Computes where `marker` ends up after `edit` is replaced by `new_len` bytes of text.
///
/// - edits at or after the marker end leave it alone,
/// - edits at or before the marker start move it,
/// - edits strictly inside it move its end,
/// - an edit that spans the whole marked text destroys it,
/// - partial overlaps clip the marker to the text that survived.
pub fn shift_marker(marker: TextRange, edit: TextRange, new_len: TextSize) -> Option<TextRange> {
    let (ms, me) = (i64::from(u32::from(marker.start())), i64::from(u32::from(marker.end())));
    let (s, e) = (i64::from(u32::from(edit.start())), i64::from(u32::from(edit.end())));
    let new_len = i64::from(u32::from(new_len));
    let delta = new_len - (e - s);

    let (start, end) = if s >= me && !(s == me && me == ms && e == s) {
        (ms, me)
    } else if e <= ms {
        (ms + delta, me + delta)
    } else if s <= ms && e >= me {
        return None;
    } else if s >= ms && e <= me {
        (ms, me + delta)
    } else if s < ms {
        (s + new_len, me + delta)
    } else {
        (ms, s)
    };

    let start = u32::try_from(start).ok()?;
    let end = u32::try_from(end).ok()?;
    (start <= end).then(|| TextRange::new(TextSize::from(start), TextSize::from(end)))
}
