//! Lookup resolution and merged directory listings.

mod common;

use std::sync::Arc;

use common::*;
use strata::storage::{MemStorage, NewAttrs, Storage};
use strata::{classify, PathType, StrataError};

#[test]
fn lookup_prefers_upper_object() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&upper, "a.txt", b"upper");
    put_file(&lower, "a.txt", b"lower");
    let fs = mount(upper, vec![lower]);

    let entry = resolve(&fs, "a.txt").unwrap();
    assert_eq!(fs.read_data(&entry).unwrap(), b"upper");
    let t = classify(&entry);
    assert!(t.contains(PathType::HAS_UPPER));
    assert!(!t.contains(PathType::IS_MERGE));
}

#[test]
fn listing_merges_layers_topmost_first() {
    let upper = Arc::new(MemStorage::new());
    let lower1 = Arc::new(MemStorage::new());
    let lower2 = Arc::new(MemStorage::new());
    put_file(&upper, "u.txt", b"u");
    put_file(&lower1, "a.txt", b"a1");
    put_file(&lower1, "shared.txt", b"from-l1");
    put_file(&lower2, "b.txt", b"b2");
    put_file(&lower2, "shared.txt", b"from-l2");
    let fs = mount(upper, vec![lower1, lower2]);

    let root = fs.root();
    assert_eq!(
        sorted_names(&fs, &root),
        vec!["a.txt", "b.txt", "shared.txt", "u.txt"]
    );
    // Duplicate names resolve to the topmost contributing layer.
    let shared = resolve(&fs, "shared.txt").unwrap();
    assert_eq!(fs.read_data(&shared).unwrap(), b"from-l1");
}

#[test]
fn multi_layer_directory_is_a_merge() {
    let upper = Arc::new(MemStorage::new());
    let lower1 = Arc::new(MemStorage::new());
    let lower2 = Arc::new(MemStorage::new());
    put_file(&lower1, "d/one.txt", b"1");
    put_file(&lower2, "d/two.txt", b"2");
    let fs = mount(upper, vec![lower1, lower2]);

    let d = resolve(&fs, "d").unwrap();
    assert!(classify(&d).contains(PathType::IS_MERGE));
    assert_eq!(sorted_names(&fs, &d), vec!["one.txt", "two.txt"]);
}

#[test]
fn kind_mismatch_cuts_off_deeper_layers() {
    let upper = Arc::new(MemStorage::new());
    let lower1 = Arc::new(MemStorage::new());
    let lower2 = Arc::new(MemStorage::new());
    put_file(&lower1, "x", b"file wins");
    put_file(&lower2, "x/child.txt", b"hidden");
    let fs = mount(upper, vec![lower1, lower2]);

    let x = resolve(&fs, "x").unwrap();
    assert!(!x.is_dir());
    assert_eq!(fs.read_data(&x).unwrap(), b"file wins");
    assert!(matches!(resolve(&fs, "x/child.txt"), Err(StrataError::NotFound)));
}

#[test]
fn listing_snapshot_survives_concurrent_mutation() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "old.txt", b"old");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    let mut cursor = fs.open_dir(&root).unwrap();
    let before = cursor.version();

    fs.create(&root, "new.txt", NewAttrs::file(0o644)).unwrap();

    // The open cursor keeps iterating its pre-mutation snapshot.
    let mut seen = Vec::new();
    while let Some(e) = cursor.next() {
        seen.push(e.name);
    }
    assert_eq!(seen, vec!["old.txt"]);

    let mut fresh = fs.open_dir(&root).unwrap();
    assert!(fresh.version() > before);
    let mut seen = Vec::new();
    while let Some(e) = fresh.next() {
        seen.push(e.name);
    }
    seen.sort();
    assert_eq!(seen, vec!["new.txt", "old.txt"]);
}

#[test]
fn listing_cache_hits_until_version_moves() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"a");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    let first = fs.get_merged_listing(&root).unwrap();
    let second = fs.get_merged_listing(&root).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    fs.create(&root, "b.txt", NewAttrs::file(0o644)).unwrap();
    let third = fs.get_merged_listing(&root).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert!(third.version() > first.version());
}

#[test]
fn directory_display_ino_is_stable_across_copy_up() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "d/f.txt", b"f");
    let fs = mount(upper, vec![lower]);

    let d = resolve(&fs, "d").unwrap();
    let before = fs.get_attrs(&d).unwrap().ino;

    // Creating inside the directory forces its copy-up.
    fs.create(&d, "new.txt", NewAttrs::file(0o644)).unwrap();

    let after = fs.get_attrs(&d).unwrap().ino;
    assert_eq!(before, after);
    assert!(classify(&d).contains(PathType::HAS_UPPER));
}

#[test]
fn remapped_inodes_keep_layers_apart() {
    let mut config = strata::Config::default();
    config.remap_inodes = true;
    let upper = Arc::new(MemStorage::new());
    let lower1 = Arc::new(MemStorage::new());
    let lower2 = Arc::new(MemStorage::new());
    // Same real inode number in both stores.
    put_file(&lower1, "a.txt", b"a");
    put_file(&lower2, "b.txt", b"b");
    let fs = mount_with(config, upper, vec![lower1, lower2]);

    let a = fs.get_attrs(&resolve(&fs, "a.txt").unwrap()).unwrap();
    let b = fs.get_attrs(&resolve(&fs, "b.txt").unwrap()).unwrap();
    assert_ne!(a.ino, b.ino);
    assert_eq!(a.ino >> 48, 1);
    assert_eq!(b.ino >> 48, 2);
}

#[test]
fn lookup_keeps_one_identity_across_version_drift() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"a");
    let fs = mount(upper, vec![lower]);

    let root = fs.root();
    let first = resolve(&fs, "a.txt").unwrap();

    // Sibling churn moves the directory version; the name still denotes
    // the same object, so a re-lookup must hand back the same entry.
    fs.create(&root, "new.txt", NewAttrs::file(0o644)).unwrap();
    let again = resolve(&fs, "a.txt").unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    // A replacement at the name is a genuinely new identity.
    fs.unlink(&root, "a.txt").unwrap();
    let fresh = fs.create(&root, "a.txt", NewAttrs::file(0o644)).unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
}

#[test]
fn reserved_names_are_invisible_at_root() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "a.txt", b"a");
    let fs = mount(Arc::clone(&upper), vec![lower]);

    let root = fs.root();
    assert!(matches!(fs.lookup(&root, ".work"), Err(StrataError::NotFound)));
    assert!(matches!(fs.lookup(&root, ".index"), Err(StrataError::NotFound)));
    assert_eq!(sorted_names(&fs, &root), vec!["a.txt"]);
    assert!(matches!(
        fs.mkdir(&root, ".work", NewAttrs::directory(0o755)),
        Err(StrataError::AlreadyExists)
    ));
    // The reserved areas really exist in the upper store.
    assert!(upper.lookup(upper.root(), ".work").is_ok());
    assert!(upper.lookup(upper.root(), ".index").is_ok());
}

#[test]
fn symlinks_resolve_from_any_layer() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    lower.symlink(lower.root(), "lnk", "target/path").unwrap();
    let fs = mount(upper, vec![lower]);

    let lnk = resolve(&fs, "lnk").unwrap();
    assert_eq!(fs.read_link(&lnk).unwrap(), "target/path");

    let root = fs.root();
    let mine = fs.symlink(&root, "mine", "elsewhere").unwrap();
    assert_eq!(fs.read_link(&mine).unwrap(), "elsewhere");
}

#[test]
fn dot_and_dotdot_resolve_in_place() {
    let upper = Arc::new(MemStorage::new());
    let lower = Arc::new(MemStorage::new());
    put_file(&lower, "d/f.txt", b"f");
    let fs = mount(upper, vec![lower]);

    let d = resolve(&fs, "d").unwrap();
    let dot = fs.lookup(&d, ".").unwrap();
    assert!(Arc::ptr_eq(&dot, &d));
    let up = fs.lookup(&d, "..").unwrap();
    assert!(Arc::ptr_eq(&up, &fs.root()));
}
