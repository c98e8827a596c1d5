use std::sync::Arc;

use drift_config::RefreshConfig;
use drift_core::{FileId, ModelLock, TextRange, TextSize};
use drift_pointers::{
    ElementKind, PointerStrategy, SharedDocument, SmartPointerManager, SourceModel, SourceStore,
    TreeBuilder, VfsPointerBridge,
};
use drift_vfs::{MemoryFs, Vfs, VfsPath};

const MAIN: FileId = FileId::from_raw(1);
const INJECTED: FileId = FileId::from_raw(2);

fn range(start: u32, end: u32) -> TextRange {
    TextRange::new(TextSize::from(start), TextSize::from(end))
}

struct Fixture {
    lock: Arc<ModelLock>,
    store: Arc<SourceStore>,
    manager: SmartPointerManager,
    document: SharedDocument,
}

impl Fixture {
    fn new(text: &str) -> Self {
        let lock = Arc::new(ModelLock::new());
        let store = SourceStore::with_token_parser(lock.clone());
        let document = store.open(MAIN, text);
        let manager = SmartPointerManager::new(store.clone());
        Self {
            lock,
            store,
            manager,
            document,
        }
    }

    fn edit(&self, range: TextRange, text: &str) {
        let _write = self.lock.write();
        self.document.lock().replace(range, text).unwrap();
    }

    fn text(&self) -> String {
        self.document.lock().text().to_string()
    }
}

#[test]
fn pointer_follows_an_insertion_before_it() {
    let fx = Fixture::new("let a = 1;foo();");
    let tree = fx.store.tree(MAIN).unwrap();
    let foo = tree.find_element(range(10, 13), ElementKind::Ident).unwrap();
    let pointer = fx.manager.create_pointer(&foo, None);
    assert_eq!(pointer.strategy(), Some(PointerStrategy::SelfRange));

    fx.edit(range(0, 0), "     ");

    assert_eq!(pointer.range(), Some(range(15, 18)));
    let element = pointer.element().unwrap();
    assert_eq!(element.range(), range(15, 18));
    assert_eq!(element.kind(), ElementKind::Ident);
    assert_eq!(element.text(&fx.text()), Some("foo"));
}

#[test]
fn pointers_to_one_element_share_an_entry() {
    let fx = Fixture::new("alpha beta");
    let tree = fx.store.tree(MAIN).unwrap();
    let beta = tree.find_element(range(6, 10), ElementKind::Ident).unwrap();

    let first = fx.manager.create_pointer(&beta, None);
    let second = fx.manager.create_pointer(&beta, None);
    assert!(first.ptr_eq(&second));
    assert_eq!(first.ref_count(), 2);

    drop(second);
    assert_eq!(first.ref_count(), 1);
}

#[test]
fn edits_after_the_range_leave_it_alone() {
    let fx = Fixture::new("alpha beta gamma");
    let tree = fx.store.tree(MAIN).unwrap();
    let beta = tree.find_element(range(6, 10), ElementKind::Ident).unwrap();
    let pointer = fx.manager.create_pointer(&beta, None);

    fx.edit(range(10, 10), "_suffix_is_not_part_of_it");
    fx.edit(range(0, 0), "");
    let len = fx.document.lock().len();
    fx.edit(TextRange::empty(len), " delta");

    assert_eq!(pointer.range(), Some(range(6, 10)));
    // "beta_suffix..." is now one longer identifier, so nothing has exactly the old range.
    assert_eq!(pointer.element(), None);
}

#[test]
fn deleting_the_anchored_text_loses_the_element() {
    let fx = Fixture::new("alpha beta gamma");
    let tree = fx.store.tree(MAIN).unwrap();
    let beta = tree.find_element(range(6, 10), ElementKind::Ident).unwrap();
    let pointer = fx.manager.create_pointer(&beta, None);

    fx.edit(range(6, 10), "");

    assert_eq!(pointer.range(), None);
    assert_eq!(pointer.element(), None);
    // Restoring the same text later does not bring the pointer back.
    fx.edit(range(6, 6), "beta");
    assert_eq!(pointer.element(), None);
}

#[test]
fn edits_inside_a_group_keep_tracking_it() {
    let fx = Fixture::new("f(a, b) + g(c)");
    let tree = fx.store.tree(MAIN).unwrap();
    let group = tree.find_element(range(1, 7), ElementKind::ParenGroup).unwrap();
    let pointer = fx.manager.create_pointer(&group, None);

    fx.edit(range(3, 3), ", extra");

    let element = pointer.element().unwrap();
    assert_eq!(element.kind(), ElementKind::ParenGroup);
    assert_eq!(element.text(&fx.text()), Some("(a, extra, b)"));
}

#[test]
fn file_pointers_resolve_to_the_current_root() {
    let fx = Fixture::new("x y");
    let root = fx.store.tree(MAIN).unwrap().root();
    let pointer = fx.manager.create_pointer(&root, None);
    assert_eq!(pointer.strategy(), Some(PointerStrategy::File));

    fx.edit(range(0, 3), "");
    fx.edit(range(0, 0), "something else entirely");

    let element = pointer.element().unwrap();
    assert_eq!(element.kind(), ElementKind::File);
    assert_eq!(pointer.range(), Some(range(0, 23)));

    fx.store.file_deleted(MAIN);
    fx.manager.file_deleted(MAIN);
    assert_eq!(pointer.element(), None);
    assert_eq!(pointer.strategy(), None);
}

#[test]
fn injected_pointers_are_anchored_in_the_host() {
    let fx = Fixture::new("let s = \"f(x)\";");
    let injected = fx
        .store
        .register_injection(MAIN, range(9, 13), INJECTED)
        .unwrap();
    assert_eq!(injected.lock().text(), "f(x)");

    let tree = fx.store.tree(INJECTED).unwrap();
    let x = tree.find_element(range(2, 3), ElementKind::Ident).unwrap();
    let pointer = fx.manager.create_pointer(&x, None);
    assert_eq!(pointer.strategy(), Some(PointerStrategy::Injected));
    assert_eq!(pointer.file(), INJECTED);

    // Moving the whole injection keeps injected offsets stable.
    fx.edit(range(0, 0), "  ");
    assert_eq!(pointer.range(), Some(range(2, 3)));
    assert_eq!(pointer.element().unwrap().range(), range(2, 3));

    // Editing inside the injection, before the element, shifts it.
    fx.edit(range(11, 12), "gg");
    assert_eq!(injected.lock().text(), "gg(x)");
    let element = pointer.element().unwrap();
    assert_eq!(element.range(), range(3, 4));
    assert_eq!(element.file(), INJECTED);

    for dropped in fx.store.file_deleted(MAIN) {
        fx.manager.file_deleted(dropped);
    }
    assert_eq!(pointer.element(), None);
}

#[test]
fn direct_edits_of_an_injected_document_move_its_pointers() {
    let fx = Fixture::new("s = \"a b c\";");
    let injected = fx
        .store
        .register_injection(MAIN, range(5, 10), INJECTED)
        .unwrap();
    let tree = fx.store.tree(INJECTED).unwrap();
    let c = tree.find_element(range(4, 5), ElementKind::Ident).unwrap();
    let pointer = fx.manager.create_pointer(&c, None);

    {
        let _write = fx.lock.write();
        injected.lock().insert(TextSize::from(0), "x ").unwrap();
    }
    assert_eq!(fx.text(), "s = \"x a b c\";");
    assert_eq!(pointer.range(), Some(range(6, 7)));
    let element = pointer.element().unwrap();
    assert_eq!(element.range(), range(6, 7));
    assert_eq!(element.text(injected.lock().text()), Some("c"));

    {
        let _write = fx.lock.write();
        injected.lock().delete(range(6, 7)).unwrap();
    }
    assert_eq!(pointer.range(), None);
    assert_eq!(pointer.element(), None);
}

#[test]
fn a_tree_with_another_kind_at_the_range_does_not_resolve() {
    let fx = Fixture::new("alpha beta");
    let tree = fx.store.tree(MAIN).unwrap();
    let beta = tree.find_element(range(6, 10), ElementKind::Ident).unwrap();
    let pointer = fx.manager.create_pointer(&beta, None);
    assert_eq!(pointer.element(), Some(beta.clone()));

    let stamp = fx.document.lock().modification_stamp();
    let mut builder = TreeBuilder::new(MAIN).stamp(stamp);
    builder.token(ElementKind::Ident, TextSize::from(5));
    builder.token(ElementKind::Whitespace, TextSize::from(1));
    builder.token(ElementKind::Number, TextSize::from(4));
    fx.store.set_tree(MAIN, Arc::new(builder.finish())).unwrap();

    assert_eq!(pointer.range(), Some(range(6, 10)));
    // The element cached by the first lookup belongs to the replaced tree.
    assert_eq!(pointer.element(), None);
    let current = fx.store.tree(MAIN).unwrap();
    assert!(!Arc::ptr_eq(beta.tree(), &current));
    assert!(current
        .find_element(range(6, 10), ElementKind::Number)
        .is_some());
}

#[test]
fn vfs_deletions_invalidate_pointers() {
    let lock = Arc::new(ModelLock::new());
    let fs = Arc::new(MemoryFs::new());
    let root_path = VfsPath::local("/ws");
    let file_path = root_path.join("src").join("main.txt");
    fs.write(&file_path, "fn main() {}");

    let vfs = Arc::new(Vfs::with_lock(fs.clone(), lock.clone(), &RefreshConfig::default()).unwrap());
    let root = vfs.register_root(&root_path).unwrap();
    let file = vfs.find_file(&file_path).unwrap();

    let store = SourceStore::with_token_parser(lock);
    let text = String::from_utf8(vfs.read_bytes(file).unwrap()).unwrap();
    store.open(file, text);
    let manager = SmartPointerManager::new(store.clone());
    VfsPointerBridge::install(&vfs, store.clone(), manager.clone());

    let tree = store.tree(file).unwrap();
    let main = tree.find_element(range(3, 7), ElementKind::Ident).unwrap();
    let pointer = manager.create_pointer(&main, None);
    assert!(pointer.element().is_some());

    fs.remove_all(&root_path.join("src"));
    vfs.refresh(&[root], true).unwrap();

    assert!(!store.is_valid(file));
    assert_eq!(pointer.element(), None);
    assert_eq!(manager.pointers_in(file).len(), 0);
}

mod props {
    use proptest::prelude::*;

    use super::*;

    const PROPTEST_CASES: u32 = 64;

    #[derive(Clone, Debug)]
    enum Edit {
        Before { at: u8, delete: u8, insert: String },
        After { at: u8, delete: u8, insert: String },
    }

    fn arb_edit() -> impl Strategy<Value = Edit> {
        let insert = "[a-z (){}]{0,6}";
        prop_oneof![
            (any::<u8>(), 0u8..4, insert).prop_map(|(at, delete, insert)| Edit::Before {
                at,
                delete,
                insert
            }),
            (any::<u8>(), 0u8..4, insert).prop_map(|(at, delete, insert)| Edit::After {
                at,
                delete,
                insert
            }),
        ]
    }

    /// Picks a concrete range on one side of `marked`, never touching its text.
    fn place(edit: &Edit, marked: TextRange, len: u32) -> (TextRange, String) {
        match edit {
            Edit::Before { at, delete, insert } => {
                let room = u32::from(marked.start());
                let start = u32::from(*at) % (room + 1);
                let end = (start + u32::from(*delete)).min(room);
                (range(start, end), insert.clone())
            }
            Edit::After { at, delete, insert } => {
                let from = u32::from(marked.end());
                let start = from + u32::from(*at) % (len - from + 1);
                let end = (start + u32::from(*delete)).min(len);
                (range(start, end), insert.clone())
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(PROPTEST_CASES))]

        #[test]
        fn edits_outside_the_marked_text_preserve_it(
            prefix in "[a-z ]{0,8}",
            suffix in "[a-z ]{0,8}",
            edits in prop::collection::vec(arb_edit(), 1..10),
        ) {
            let text = format!("{prefix} target {suffix}");
            let start = prefix.len() as u32 + 1;
            let fx = Fixture::new(&text);
            let tree = fx.store.tree(MAIN).unwrap();
            let target = tree.find_element(range(start, start + 6), ElementKind::Ident).unwrap();
            let pointer = fx.manager.create_pointer(&target, None);

            for edit in &edits {
                let marked = pointer.range().unwrap();
                let len = u32::from(fx.document.lock().len());
                let (edit_range, insert) = place(edit, marked, len);
                fx.edit(edit_range, &insert);

                let now = pointer.range().unwrap();
                prop_assert_eq!(now.len(), marked.len());
                let current = fx.text();
                prop_assert_eq!(&current[std::ops::Range::<usize>::from(now)], "target");
            }
        }
    }
}
