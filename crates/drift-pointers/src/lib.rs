//! Smart pointers into element trees.
//!
//! Element trees are rebuilt whenever a document changes, so holding on to an [`Element`]
//! pins a stale tree. A [`SmartPointer`] instead records how to find the element again and
//! resolves it lazily against the current tree:
//!
//! - range-based pointers remember file, range and kind; edits shift the range through
//!   [`RangeMarker`]s attached only while the edit runs,
//! - file pointers always resolve to the root of their file,
//! - pointers into injected fragments are anchored in the host document,
//! - elements of trees without a document are held directly.
//!
//! Resolution prefers precision: when no element with exactly the recorded range and kind
//! exists any more, the pointer resolves to `None` rather than to a neighbour.

mod bridge;
mod document;
mod element_info;
mod error;
mod manager;
mod marker;
mod parser;
mod source;
mod tree;

pub use bridge::VfsPointerBridge;
pub use document::{
    ContentChange, Document, DocumentEvent, DocumentListener, Position, Range,
};
pub use element_info::PointerStrategy;
pub use error::DocumentError;
pub use manager::{SmartPointer, SmartPointerManager};
pub use marker::{shift_marker, RangeMarker};
pub use parser::{Parser, TokenParser};
pub use source::{Injection, SharedDocument, SourceModel, SourceStore};
pub use tree::{Element, ElementKey, ElementKind, ElementTree, TreeBuilder, TreeId};
