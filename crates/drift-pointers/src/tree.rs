use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use drift_core::{FileId, TextRange, TextSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ElementKind {
    /// Root of every tree.
    File,
    BraceGroup,
    ParenGroup,
    BracketGroup,
    Ident,
    Number,
    Str,
    Punct,
    Whitespace,
}

impl ElementKind {
    pub fn is_group(self) -> bool {
        matches!(
            self,
            ElementKind::BraceGroup | ElementKind::ParenGroup | ElementKind::BracketGroup
        )
    }
}

/// Identity of one parse of one file. Reparsing yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(u64);

impl TreeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TreeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of an element, stable for as long as its tree lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementKey {
    pub tree: TreeId,
    pub index: u32,
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: ElementKind,
    range: TextRange,
    parent: Option<u32>,
    children: Vec<u32>,
}

/// An immutable element tree for one version of a file's text.
///
/// Node 0 is always the [`ElementKind::File`] root.
#[derive(Debug)]
pub struct ElementTree {
    id: TreeId,
    file: FileId,
    physical: bool,
    stamp: u64,
    nodes: Vec<NodeData>,
}

impl ElementTree {
    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    /// Whether the tree mirrors a document. Non-physical trees are synthesized and have no
    /// text to re-anchor against.
    pub fn is_physical(&self) -> bool {
        self.physical
    }

    /// Modification stamp of the document text the tree was built from.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(self: &Arc<Self>) -> Element {
        Element {
            tree: Arc::clone(self),
            index: 0,
        }
    }

    pub fn element(self: &Arc<Self>, index: u32) -> Option<Element> {
        ((index as usize) < self.nodes.len()).then(|| Element {
            tree: Arc::clone(self),
            index,
        })
    }

    /// All elements in pre-order.
    pub fn elements(self: &Arc<Self>) -> impl Iterator<Item = Element> + '_ {
        (0..self.nodes.len() as u32).map(move |index| Element {
            tree: Arc::clone(self),
            index,
        })
    }

    /// The deepest element whose range contains `offset`.
    ///
    /// An offset equal to an element's end is only attributed to it when no sibling starts
    /// there, so the end of the file resolves to the root.
    pub fn leaf_at(self: &Arc<Self>, offset: TextSize) -> Option<Element> {
        let root = &self.nodes[0];
        if !root.range.contains_inclusive(offset) {
            return None;
        }
        let mut current = 0u32;
        'descend: loop {
            for &child in &self.nodes[current as usize].children {
                let range = self.nodes[child as usize].range;
                if range.contains(offset) {
                    current = child;
                    continue 'descend;
                }
            }
            break;
        }
        self.element(current)
    }

    /// Finds the innermost element with exactly `range` and `kind`.
    ///
    /// The search starts at the leaf holding `range.start()` and walks up through ancestors that
    /// still start at the same offset.
    pub fn find_element(self: &Arc<Self>, range: TextRange, kind: ElementKind) -> Option<Element> {
        let mut current = Some(self.leaf_at(range.start())?);
        while let Some(element) = current {
            let element_range = element.range();
            if element_range.start() != range.start() {
                break;
            }
            if element_range == range && element.kind() == kind {
                return Some(element);
            }
            current = element.parent();
        }
        None
    }
}

/// A handle to one node of an [`ElementTree`].
#[derive(Clone)]
pub struct Element {
    tree: Arc<ElementTree>,
    index: u32,
}

impl Element {
    fn data(&self) -> &NodeData {
        &self.tree.nodes[self.index as usize]
    }

    pub fn kind(&self) -> ElementKind {
        self.data().kind
    }

    pub fn range(&self) -> TextRange {
        self.data().range
    }

    pub fn file(&self) -> FileId {
        self.tree.file
    }

    pub fn is_physical(&self) -> bool {
        self.tree.physical
    }

    pub fn tree(&self) -> &Arc<ElementTree> {
        &self.tree
    }

    pub fn key(&self) -> ElementKey {
        ElementKey {
            tree: self.tree.id,
            index: self.index,
        }
    }

    pub fn parent(&self) -> Option<Element> {
        self.data().parent.and_then(|index| self.tree.element(index))
    }

    pub fn children(&self) -> impl Iterator<Item = Element> + '_ {
        self.data()
            .children
            .iter()
            .filter_map(|&index| self.tree.element(index))
    }

    /// The element's text, if `source` is the text the tree was built from.
    pub fn text<'a>(&self, source: &'a str) -> Option<&'a str> {
        source.get(std::ops::Range::<usize>::from(self.range()))
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.index == other.index
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:?} in {}", self.kind(), self.range(), self.file())
    }
}

/// Builds an [`ElementTree`] from a stream of nodes and tokens in source order.
#[derive(Debug)]
pub struct TreeBuilder {
    file: FileId,
    physical: bool,
    stamp: u64,
    offset: TextSize,
    nodes: Vec<NodeData>,
    open: Vec<u32>,
}

impl TreeBuilder {
    /// Starts a tree whose root covers everything pushed until [`TreeBuilder::finish`].
    pub fn new(file: FileId) -> Self {
        let mut builder = Self {
            file,
            physical: true,
            stamp: 0,
            offset: TextSize::from(0),
            nodes: Vec::new(),
            open: Vec::new(),
        };
        builder.start_node(ElementKind::File);
        builder
    }

    pub fn physical(mut self, physical: bool) -> Self {
        self.physical = physical;
        self
    }

    pub fn stamp(mut self, stamp: u64) -> Self {
        self.stamp = stamp;
        self
    }

    pub fn start_node(&mut self, kind: ElementKind) {
        let index = self.push(kind, TextRange::empty(self.offset));
        self.open.push(index);
    }

    pub fn token(&mut self, kind: ElementKind, len: TextSize) {
        self.push(kind, TextRange::at(self.offset, len));
        self.offset += len;
    }

    /// Closes the innermost open node. The root is only closed by [`TreeBuilder::finish`].
    pub fn finish_node(&mut self) {
        if self.open.len() > 1 {
            self.close_top();
        }
    }

    pub fn finish(mut self) -> ElementTree {
        while !self.open.is_empty() {
            self.close_top();
        }
        ElementTree {
            id: TreeId::next(),
            file: self.file,
            physical: self.physical,
            stamp: self.stamp,
            nodes: self.nodes,
        }
    }

    fn push(&mut self, kind: ElementKind, range: TextRange) -> u32 {
        let index = self.nodes.len() as u32;
        let parent = self.open.last().copied();
        self.nodes.push(NodeData {
            kind,
            range,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent as usize].children.push(index);
        }
        index
    }

    fn close_top(&mut self) {
        if let Some(index) = self.open.pop() {
            let node = &mut self.nodes[index as usize];
            node.range = TextRange::new(node.range.start(), self.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u32, end: u32) -> TextRange {
        TextRange::new(TextSize::from(start), TextSize::from(end))
    }

    /// `f(x)` as File[Ident, ParenGroup[Punct, Ident, Punct]].
    fn call_tree() -> Arc<ElementTree> {
        let mut builder = TreeBuilder::new(FileId::from_raw(3));
        builder.token(ElementKind::Ident, TextSize::from(1));
        builder.start_node(ElementKind::ParenGroup);
        builder.token(ElementKind::Punct, TextSize::from(1));
        builder.token(ElementKind::Ident, TextSize::from(1));
        builder.token(ElementKind::Punct, TextSize::from(1));
        builder.finish_node();
        Arc::new(builder.finish())
    }

    #[test]
    fn builder_computes_ranges() {
        let tree = call_tree();
        let ranges: Vec<_> = tree.elements().map(|e| (e.kind(), e.range())).collect();
        assert_eq!(
            ranges,
            vec![
                (ElementKind::File, range(0, 4)),
                (ElementKind::Ident, range(0, 1)),
                (ElementKind::ParenGroup, range(1, 4)),
                (ElementKind::Punct, range(1, 2)),
                (ElementKind::Ident, range(2, 3)),
                (ElementKind::Punct, range(3, 4)),
            ]
        );
        assert_eq!(tree.root().children().count(), 2);
    }

    #[test]
    fn leaf_at_descends_to_tokens() {
        let tree = call_tree();
        assert_eq!(tree.leaf_at(TextSize::from(2)).unwrap().range(), range(2, 3));
        assert_eq!(tree.leaf_at(TextSize::from(4)).unwrap().kind(), ElementKind::File);
        assert!(tree.leaf_at(TextSize::from(5)).is_none());
    }

    #[test]
    fn find_element_prefers_exact_kind() {
        let tree = call_tree();
        let group = tree.find_element(range(1, 4), ElementKind::ParenGroup).unwrap();
        assert_eq!(group.kind(), ElementKind::ParenGroup);
        assert!(tree.find_element(range(1, 4), ElementKind::Ident).is_none());
        assert!(tree.find_element(range(1, 3), ElementKind::ParenGroup).is_none());
        assert_eq!(
            tree.find_element(range(0, 4), ElementKind::File),
            Some(tree.root())
        );
    }

    #[test]
    fn empty_tree_has_a_root() {
        let tree = Arc::new(TreeBuilder::new(FileId::from_raw(1)).finish());
        assert_eq!(tree.root().range(), range(0, 0));
        assert_eq!(
            tree.find_element(range(0, 0), ElementKind::File),
            Some(tree.root())
        );
    }
}
