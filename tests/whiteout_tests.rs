//! Whiteouts, opacity, and directory removal.

mod common;

use std::sync::Arc;

use common::*;
use strata::storage::{EntryKind, MemStorage, NewAttrs, Storage};
use strata::{classify, PathType, StrataError};

fn assert_whiteout(store: &MemStorage, dir: strata::storage::Handle, name: &str) {
    let h = store.lookup(dir, name).unwrap();
    let attrs = store.get_attrs(h).unwrap();
    assert_eq!(attrs.kind, EntryKind::Special);
    assert_eq!(attrs.rdev, 0);
}

#[test]
fn unlink_of_lower_file_leaves_a_whiteout() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    let lower_handle = put_file(&lower, "foo/bar.txt", b"keep me");
    let fs = mount(Arc::clone(&upper), vec![Arc::clone(&lower)]);

    let foo = resolve(&fs, "foo").unwrap();
    fs.unlink(&foo, "bar.txt").unwrap();

    assert!(matches!(resolve(&fs, "foo/bar.txt"), Err(StrataError::NotFound)));
    assert!(sorted_names(&fs, &foo).is_empty());

    // Upper has the tombstone; the lower object is untouched.
    let ufoo = upper.lookup(upper.root(), "foo").unwrap();
    assert_whiteout(&upper, ufoo, "bar.txt");
    assert_eq!(lower.read_data(lower_handle).unwrap(), b"keep me");
}

#[test]
fn unlink_of_pure_upper_file_leaves_nothing() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "other.txt", b"x");
    let fs = mount(Arc::clone(&upper), vec![lower]);

    let root = fs.root();
    let f = fs.create(&root, "mine.txt", NewAttrs::file(0o644)).unwrap();
    fs.write_data(&f, b"temp").unwrap();
    fs.unlink(&root, "mine.txt").unwrap();

    assert!(matches!(resolve(&fs, "mine.txt"), Err(StrataError::NotFound)));
    assert!(matches!(
        upper.lookup(upper.root(), "mine.txt"),
        Err(StrataError::NotFound)
    ));
}

#[test]
fn whiteouts_share_one_tombstone() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"a");
    put_file(&lower, "b.txt", b"b");
    let fs = mount(Arc::clone(&upper), vec![lower]);

    let root = fs.root();
    fs.unlink(&root, "a.txt").unwrap();
    fs.unlink(&root, "b.txt").unwrap();

    let wa = upper.lookup(upper.root(), "a.txt").unwrap();
    let wb = upper.lookup(upper.root(), "b.txt").unwrap();
    assert_eq!(upper.get_attrs(wa).unwrap().ino, upper.get_attrs(wb).unwrap().ino);
    assert!(upper.get_attrs(wa).unwrap().nlink >= 2);
}

#[test]
fn tombstone_sharing_degrades_at_the_link_limit() {
    // Tombstone starts at one link (its work-area name); a limit of three
    // admits two shared whiteouts before sharing shuts off.
    let upper = Arc::new(MemStorage::new().with_max_links(3));
    let lower = Arc::new(MemStorage::new());
    for name in ["a", "b", "c", "d"] {
        put_file(&lower, name, b"x");
    }
    let fs = mount(Arc::clone(&upper), vec![lower]);

    let root = fs.root();
    for name in ["a", "b", "c", "d"] {
        fs.unlink(&root, name).unwrap();
        assert_whiteout(&upper, upper.root(), name);
    }

    let shared_ino = upper.get_attrs(upper.lookup(upper.root(), "a").unwrap()).unwrap().ino;
    let late_ino = upper.get_attrs(upper.lookup(upper.root(), "d").unwrap()).unwrap().ino;
    assert_ne!(shared_ino, late_ino);
}

#[test]
fn remove_empty_lower_directory_whites_it_out() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_dir(&lower, "empty");
    let fs = mount(Arc::clone(&upper), vec![lower]);

    let root = fs.root();
    fs.remove_dir(&root, "empty").unwrap();
    assert!(matches!(resolve(&fs, "empty"), Err(StrataError::NotFound)));
    assert_whiteout(&upper, upper.root(), "empty");
}

#[test]
fn remove_dir_rejects_visible_content() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "d/f.txt", b"f");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    assert!(matches!(fs.remove_dir(&root, "d"), Err(StrataError::NotEmpty)));
}

#[test]
fn dir_emptied_by_whiteouts_is_removable() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "d/f.txt", b"f");
    let fs = mount(Arc::clone(&upper), vec![lower]);

    let d = resolve(&fs, "d").unwrap();
    fs.unlink(&d, "f.txt").unwrap();

    // Physically the upper directory holds a tombstone, but the union
    // view of the directory is empty.
    assert!(fs.get_merged_listing(&d).unwrap().is_effectively_empty());

    let root = fs.root();
    fs.remove_dir(&root, "d").unwrap();
    assert!(matches!(resolve(&fs, "d"), Err(StrataError::NotFound)));
    assert_whiteout(&upper, upper.root(), "d");
}

#[test]
fn remove_dir_of_victim_older_than_its_parent() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_dir(&lower, "x");
    let fs = mount(upper, vec![lower]);

    // Resolve the victim before its eventual parent exists, so the victim
    // carries the smaller entry id when both directories get locked.
    let x = resolve(&fs, "x").unwrap();
    assert!(x.is_dir());
    let root = fs.root();
    let p = fs.mkdir(&root, "p", NewAttrs::directory(0o755)).unwrap();
    fs.rename(&root, "x", &p, "x", strata::RenameMode::Move).unwrap();

    fs.remove_dir(&p, "x").unwrap();
    assert!(matches!(resolve(&fs, "p/x"), Err(StrataError::NotFound)));
    assert!(sorted_names(&fs, &p).is_empty());
}

#[test]
fn create_over_whiteout_revives_the_name_unmerged() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"lower data");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    fs.unlink(&root, "a.txt").unwrap();
    let fresh = fs.create(&root, "a.txt", NewAttrs::file(0o644)).unwrap();
    fs.write_data(&fresh, b"fresh").unwrap();

    assert_eq!(fs.read_data(&fresh).unwrap(), b"fresh");
    let t = classify(&fresh);
    assert!(t.contains(PathType::HAS_UPPER));
    assert!(!t.contains(PathType::IS_MERGE));
    assert!(!t.contains(PathType::HAS_ORIGIN));
}

#[test]
fn mkdir_over_removed_lower_dir_stays_opaque() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "d/old.txt", b"old");
    let fs = mount(upper, vec![lower]);

    let d = resolve(&fs, "d").unwrap();
    fs.unlink(&d, "old.txt").unwrap();
    let root = fs.root();
    fs.remove_dir(&root, "d").unwrap();

    let fresh = fs.mkdir(&root, "d", NewAttrs::directory(0o755)).unwrap();
    // The lower directory's contents must not bleed through.
    assert!(matches!(fs.lookup(&fresh, "old.txt"), Err(StrataError::NotFound)));
    assert!(sorted_names(&fs, &fresh).is_empty());
    assert!(!classify(&fresh).contains(PathType::IS_MERGE));
}

#[test]
fn double_unlink_reports_not_found() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"a");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    fs.unlink(&root, "a.txt").unwrap();
    assert!(matches!(fs.unlink(&root, "a.txt"), Err(StrataError::NotFound)));
}

#[test]
fn removed_entry_turns_stale() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"a");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    let entry = resolve(&fs, "a.txt").unwrap();
    fs.unlink(&root, "a.txt").unwrap();

    assert!(matches!(fs.get_attrs(&entry), Err(StrataError::StaleReference(_))));
    assert!(matches!(fs.read_data(&entry), Err(StrataError::StaleReference(_))));
}
