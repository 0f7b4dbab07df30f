//! Shared fixtures for the union engine integration tests.

use std::sync::Arc;

use strata::storage::{Handle, MemStorage, NewAttrs, Storage};
use strata::{Config, LayerStack, OverlayEntry, Result, UnionFs};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Mount a union with the default configuration. Lower stores are frozen,
/// modelling read-only layers.
pub fn mount(upper: Arc<MemStorage>, lowers: Vec<Arc<MemStorage>>) -> UnionFs {
    mount_with(Config::default(), upper, lowers)
}

pub fn mount_with(
    config: Config,
    upper: Arc<MemStorage>,
    lowers: Vec<Arc<MemStorage>>,
) -> UnionFs {
    init_tracing();
    let mut lower_stores: Vec<Arc<dyn Storage>> = Vec::with_capacity(lowers.len());
    for lower in lowers {
        lower.freeze();
        lower_stores.push(lower);
    }
    let stack = LayerStack::new(upper, lower_stores, config).unwrap();
    UnionFs::new(stack).unwrap()
}

/// Create a file at `path` in a raw store, making parent directories as
/// needed, and fill it with `data`.
pub fn put_file(store: &MemStorage, path: &str, data: &[u8]) -> Handle {
    let (parent, name) = split_parent(store, path);
    let handle = store.create(parent, name, NewAttrs::file(0o644)).unwrap();
    store.write_data(handle, data).unwrap();
    handle
}

/// Create a directory chain at `path` in a raw store.
pub fn put_dir(store: &MemStorage, path: &str) -> Handle {
    let mut handle = store.root();
    for segment in path.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
        handle = match store.lookup(handle, segment) {
            Ok(h) => h,
            Err(_) => store.mkdir(handle, segment, NewAttrs::directory(0o755)).unwrap(),
        };
    }
    handle
}

fn split_parent<'a>(store: &MemStorage, path: &'a str) -> (Handle, &'a str) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dirs, name)) => (put_dir(store, dirs), name),
        None => (store.root(), trimmed),
    }
}

/// Resolve a slash-separated path through the union.
pub fn resolve(fs: &UnionFs, path: &str) -> Result<Arc<OverlayEntry>> {
    let mut entry = fs.root();
    for segment in path.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
        entry = fs.lookup(&entry, segment)?;
    }
    Ok(entry)
}

/// Visible names in a union directory, in listing order.
pub fn names(fs: &UnionFs, dir: &Arc<OverlayEntry>) -> Vec<String> {
    let mut cursor = fs.open_dir(dir).unwrap();
    let mut out = Vec::new();
    while let Some(entry) = cursor.next() {
        out.push(entry.name);
    }
    out
}

/// Sorted visible names, for order-insensitive assertions.
pub fn sorted_names(fs: &UnionFs, dir: &Arc<OverlayEntry>) -> Vec<String> {
    let mut out = names(fs, dir);
    out.sort();
    out
}
