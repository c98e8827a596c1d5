use std::fmt;
use std::sync::Arc;

use drift_core::{FileId, ModelLock, TextRange, TextSize};
use parking_lot::Mutex;

use crate::error::DocumentError;
use crate::marker::{MarkerSlot, RangeMarker};

/// A zero-based line/column position; columns count UTF-16 code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A line/column based content change, as sent by editors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    /// The range of text to replace. If `None`, the entire document is replaced.
    pub range: Option<Range>,
    /// Replacement text.
    pub text: String,
}

impl ContentChange {
    pub fn full(text: impl Into<String>) -> Self {
        Self {
            range: None,
            text: text.into(),
        }
    }

    pub fn replace(range: Range, text: impl Into<String>) -> Self {
        Self {
            range: Some(range),
            text: text.into(),
        }
    }
}

/// A single replacement about to be applied to (or just applied to) a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentEvent {
    pub file: FileId,
    /// Replaced range, in pre-edit offsets.
    pub old_range: TextRange,
    pub new_len: TextSize,
    /// Modification stamp before the edit.
    pub old_stamp: u64,
}

impl DocumentEvent {
    /// Range covered by the inserted text, in post-edit offsets.
    pub fn new_range(&self) -> TextRange {
        TextRange::at(self.old_range.start(), self.new_len)
    }

    pub fn delta(&self) -> i64 {
        i64::from(u32::from(self.new_len)) - i64::from(u32::from(self.old_range.len()))
    }
}

/// Observer of document mutations.
///
/// Both hooks run on the mutating thread while it holds the model write lock. `before_change`
/// sees the old text and may create range markers; `after_change` sees the new text with every
/// live marker already shifted.
pub trait DocumentListener: Send + Sync {
    fn before_change(&self, _document: &Document, _event: &DocumentEvent) {}

    fn after_change(&self, _document: &Document, _event: &DocumentEvent) {}
}

/// An in-memory document with versioning, incremental edits and range markers.
pub struct Document {
    file: FileId,
    text: Arc<String>,
    version: i32,
    stamp: u64,
    line_offsets: Vec<usize>,
    markers: Mutex<Vec<MarkerSlot>>,
    listeners: Vec<Arc<dyn DocumentListener>>,
    lock: Arc<ModelLock>,
}

impl Document {
    pub fn new(file: FileId, text: impl Into<String>, lock: Arc<ModelLock>) -> Self {
        let text = Arc::new(text.into());
        let line_offsets = compute_line_offsets(&text);
        Self {
            file,
            text,
            version: 0,
            stamp: 0,
            line_offsets,
            markers: Mutex::new(Vec::new()),
            listeners: Vec::new(),
            lock,
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    pub fn text_arc(&self) -> Arc<String> {
        Arc::clone(&self.text)
    }

    pub fn len(&self) -> TextSize {
        TextSize::of(self.text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Editor-provided version, updated by [`Document::apply_changes`].
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Incremented by every mutation, however it was made.
    pub fn modification_stamp(&self) -> u64 {
        self.stamp
    }

    pub fn add_listener(&mut self, listener: Arc<dyn DocumentListener>) {
        self.listeners.push(listener);
    }

    /// Returns a marker tracking `range`.
    ///
    /// A live marker with exactly this range is shared instead of creating a second one.
    pub fn create_range_marker(&self, range: TextRange) -> Result<RangeMarker, DocumentError> {
        self.check_range(range)?;
        let mut markers = self.markers.lock();
        markers.retain(|slot| slot.strong_count() > 0);
        if let Some(existing) = markers
            .iter()
            .filter_map(RangeMarker::from_slot)
            .find(|marker| marker.range() == Some(range))
        {
            return Ok(existing);
        }
        let marker = RangeMarker::new(self.file, range);
        markers.push(marker.slot());
        Ok(marker)
    }

    pub fn live_marker_count(&self) -> usize {
        self.markers
            .lock()
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    pub fn insert(&mut self, offset: TextSize, text: &str) -> Result<(), DocumentError> {
        self.replace(TextRange::empty(offset), text)
    }

    pub fn delete(&mut self, range: TextRange) -> Result<(), DocumentError> {
        self.replace(range, "")
    }

    /// Replaces `range` with `text`, notifying listeners around the edit.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not hold the model write lock.
    pub fn replace(&mut self, range: TextRange, text: &str) -> Result<(), DocumentError> {
        self.lock.assert_write_access();
        self.check_range(range)?;

        let event = DocumentEvent {
            file: self.file,
            old_range: range,
            new_len: TextSize::of(text),
            old_stamp: self.stamp,
        };
        let listeners = self.listeners.clone();
        for listener in &listeners {
            listener.before_change(self, &event);
        }

        let buffer = Arc::make_mut(&mut self.text);
        buffer.replace_range(std::ops::Range::<usize>::from(range), text);
        self.line_offsets = compute_line_offsets(buffer);
        self.stamp += 1;

        self.markers.get_mut().retain(|slot| match RangeMarker::from_slot(slot) {
            Some(marker) => {
                marker.apply_edit(event.old_range, event.new_len);
                true
            }
            None => false,
        });

        tracing::trace!(
            target: "drift.pointers",
            file = %self.file,
            range = ?range,
            new_len = u32::from(event.new_len),
            "document changed"
        );

        for listener in &listeners {
            listener.after_change(self, &event);
        }
        Ok(())
    }

    /// Applies a sequence of line/column changes in order.
    pub fn apply_changes(
        &mut self,
        new_version: i32,
        changes: &[ContentChange],
    ) -> Result<(), DocumentError> {
        for change in changes {
            let range = match &change.range {
                Some(range) => {
                    let start = self.position_to_offset(range.start);
                    let end = self.position_to_offset(range.end);
                    if start > end {
                        return Err(DocumentError::InvalidRange);
                    }
                    TextRange::new(start, end)
                }
                None => TextRange::up_to(self.len()),
            };
            self.replace(range, &change.text)?;
        }
        self.version = new_version;
        Ok(())
    }

    pub fn offset_to_position(&self, offset: TextSize) -> Position {
        let offset = usize::from(offset).min(self.text.len());
        let line = self
            .line_offsets
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let line_start = self.line_offsets[line];
        let prefix = self.text.get(line_start..offset).unwrap_or("");
        Position::new(line as u32, utf16_len(prefix) as u32)
    }

    pub fn position_to_offset(&self, position: Position) -> TextSize {
        let line = position.line as usize;
        if line >= self.line_offsets.len() {
            return self.len();
        }

        let line_start = self.line_offsets[line];

        let mut line_end = if line + 1 < self.line_offsets.len() {
            self.line_offsets[line + 1]
        } else {
            self.text.len()
        };

        // Columns are measured over the line text without its terminator (`\n`, `\r\n`, `\r`).
        if line_end > line_start {
            let bytes = self.text.as_bytes();
            if bytes[line_end - 1] == b'\n' {
                line_end -= 1;
                if line_end > line_start && bytes[line_end - 1] == b'\r' {
                    line_end -= 1;
                }
            } else if bytes[line_end - 1] == b'\r' {
                line_end -= 1;
            }
        }

        let line_slice = &self.text[line_start..line_end];
        let rel = utf16_column_to_byte_offset_clamped(line_slice, position.character);
        TextSize::try_from(line_start + rel).unwrap_or_else(|_| self.len())
    }

    fn check_range(&self, range: TextRange) -> Result<(), DocumentError> {
        let start = usize::from(range.start());
        let end = usize::from(range.end());
        if end > self.text.len()
            || !self.text.is_char_boundary(start)
            || !self.text.is_char_boundary(end)
        {
            return Err(DocumentError::InvalidRange);
        }
        Ok(())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("file", &self.file)
            .field("len", &self.text.len())
            .field("version", &self.version)
            .field("stamp", &self.stamp)
            .field("markers", &self.live_marker_count())
            .finish_non_exhaustive()
    }
}

fn compute_line_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0];
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                offsets.push(i + 1);
                i += 1;
            }
            b'\r' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                    offsets.push(i + 2);
                    i += 2;
                } else {
                    offsets.push(i + 1);
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    offsets
}

fn utf16_len(s: &str) -> usize {
    s.chars().map(|c| c.len_utf16()).sum()
}

/// Converts a UTF-16 code unit column into a byte offset into `line`.
///
/// Columns past the end of the line map to the line end; columns that split a surrogate pair
/// map to the start of that character.
fn utf16_column_to_byte_offset_clamped(line: &str, column_utf16: u32) -> usize {
    let mut col: u32 = 0;
    for (idx, ch) in line.char_indices() {
        let ch_len = ch.len_utf16() as u32;
        if col + ch_len > column_utf16 {
            return idx;
        }
        col = col.saturating_add(ch_len);
    }
    line.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u32, end: u32) -> TextRange {
        TextRange::new(TextSize::from(start), TextSize::from(end))
    }

    fn doc(text: &str) -> (Arc<ModelLock>, Document) {
        let lock = Arc::new(ModelLock::new());
        let doc = Document::new(FileId::from_raw(1), text, lock.clone());
        (lock, doc)
    }

    #[test]
    fn applies_incremental_edit() {
        let (lock, mut doc) = doc("hello world\n");
        let _write = lock.write();
        let change = ContentChange::replace(
            Range::new(Position::new(0, 6), Position::new(0, 11)),
            "drift",
        );
        doc.apply_changes(2, &[change]).unwrap();

        assert_eq!(doc.text(), "hello drift\n");
        assert_eq!(doc.version(), 2);
        assert_eq!(doc.modification_stamp(), 1);
    }

    #[test]
    fn full_replacement_replaces_everything() {
        let (lock, mut doc) = doc("a\nb\n");
        let _write = lock.write();
        doc.apply_changes(2, &[ContentChange::full("x")]).unwrap();
        assert_eq!(doc.text(), "x");
    }

    #[test]
    fn utf16_positions_are_supported() {
        // U+10400 is a surrogate pair in UTF-16.
        let (lock, mut doc) = doc("a𐐀b");
        let _write = lock.write();
        let change =
            ContentChange::replace(Range::new(Position::new(0, 1), Position::new(0, 3)), "X");
        doc.apply_changes(2, &[change]).unwrap();
        assert_eq!(doc.text(), "aXb");
    }

    #[test]
    fn clamps_positions_inside_surrogate_pairs_and_past_line_end() {
        let (lock, mut doc) = doc("a𐐀b\r\nc");
        let _write = lock.write();
        assert_eq!(doc.position_to_offset(Position::new(0, 2)), TextSize::from(1));
        assert_eq!(doc.position_to_offset(Position::new(0, 99)), TextSize::from(6));
        assert_eq!(doc.position_to_offset(Position::new(1, 0)), TextSize::from(8));
        assert_eq!(doc.offset_to_position(TextSize::from(8)), Position::new(1, 0));
        assert_eq!(doc.offset_to_position(TextSize::from(5)), Position::new(0, 3));
        doc.insert(TextSize::from(1), "X").unwrap();
        assert_eq!(doc.text(), "aX𐐀b\r\nc");
    }

    #[test]
    fn rejects_ranges_off_char_boundaries() {
        let (lock, mut doc) = doc("a𐐀b");
        let _write = lock.write();
        assert_eq!(doc.delete(range(0, 2)), Err(DocumentError::InvalidRange));
        assert_eq!(doc.delete(range(0, 99)), Err(DocumentError::InvalidRange));
    }

    #[test]
    #[should_panic(expected = "write access")]
    fn mutation_without_write_lock_panics() {
        let (_lock, mut doc) = doc("abc");
        let _ = doc.insert(TextSize::from(0), "x");
    }

    #[test]
    fn identical_live_markers_are_shared() {
        let (lock, mut doc) = doc("0123456789");
        let first = doc.create_range_marker(range(2, 4)).unwrap();
        let second = doc.create_range_marker(range(2, 4)).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(doc.live_marker_count(), 1);

        let _write = lock.write();
        doc.insert(TextSize::from(0), "ab").unwrap();
        assert_eq!(first.range(), Some(range(4, 6)));

        drop(first);
        drop(second);
        assert_eq!(doc.live_marker_count(), 0);
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl DocumentListener for Recorder {
        fn before_change(&self, document: &Document, _event: &DocumentEvent) {
            self.seen
                .lock()
                .push(("before".into(), document.text().to_string()));
        }

        fn after_change(&self, document: &Document, event: &DocumentEvent) {
            assert_eq!(event.new_range(), range(0, 1));
            self.seen
                .lock()
                .push(("after".into(), document.text().to_string()));
        }
    }

    #[test]
    fn listeners_see_old_and_new_text() {
        let (lock, mut doc) = doc("abc");
        let recorder = Arc::new(Recorder::default());
        doc.add_listener(recorder.clone());

        let _write = lock.write();
        doc.replace(range(0, 2), "x").unwrap();
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                ("before".to_string(), "abc".to_string()),
                ("after".to_string(), "xc".to_string()),
            ]
        );
    }
}
