//! Reference in-memory storage backend.
//!
//! Used by the integration suite and by embedders that want to exercise
//! union semantics without a real filesystem. A populated store can be
//! frozen to model a read-only lower layer; the maximum hard link count and
//! extended-attribute support are configurable so the degradation paths of
//! the engine can be driven deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, StrataError};
use crate::storage::{
    Attrs, DirEntry, EntryKind, Handle, NewAttrs, RenameFlags, SetAttrs, Storage, XattrMode,
};

const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    nlink: u32,
    mtime: u64,
    ctime: u64,
    data: Vec<u8>,
    symlink: String,
    children: BTreeMap<String, u64>,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn new(attrs: NewAttrs, now: u64) -> Self {
        Node {
            kind: attrs.kind,
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: attrs.rdev,
            nlink: 1,
            mtime: now,
            ctime: now,
            data: Vec::new(),
            symlink: String::new(),
            children: BTreeMap::new(),
            xattrs: BTreeMap::new(),
        }
    }
}

struct Inner {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn node(&self, ino: u64) -> Result<&Node> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| StrataError::StaleReference(format!("no node {ino}")))
    }

    fn node_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| StrataError::StaleReference(format!("no node {ino}")))
    }

    fn dir(&self, ino: u64) -> Result<&Node> {
        let node = self.node(ino)?;
        if node.kind != EntryKind::Directory {
            return Err(StrataError::Io("not a directory".into()));
        }
        Ok(node)
    }

    fn child(&self, parent: u64, name: &str) -> Result<u64> {
        self.dir(parent)?
            .children
            .get(name)
            .copied()
            .ok_or(StrataError::NotFound)
    }

    /// Drop one link to `ino`, freeing the node when none remain.
    fn put_link(&mut self, ino: u64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.nlink = node.nlink.saturating_sub(1);
            if node.nlink == 0 {
                self.nodes.remove(&ino);
            }
        }
    }
}

pub struct MemStorage {
    inner: RwLock<Inner>,
    frozen: AtomicBool,
    xattrs_enabled: bool,
    max_links: u32,
    mutations: AtomicU64,
}

impl MemStorage {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(NewAttrs::directory(0o755), 0));
        MemStorage {
            inner: RwLock::new(Inner { nodes, next_ino: ROOT_INO + 1, clock: 0 }),
            frozen: AtomicBool::new(false),
            xattrs_enabled: true,
            max_links: u32::MAX,
            mutations: AtomicU64::new(0),
        }
    }

    /// Cap the per-node hard link count, as real filesystems do.
    pub fn with_max_links(mut self, max_links: u32) -> Self {
        self.max_links = max_links;
        self
    }

    /// Disable extended attribute support, modelling an upper store that
    /// cannot persist opacity/redirect/origin markers.
    pub fn without_xattrs(mut self) -> Self {
        self.xattrs_enabled = false;
        self
    }

    /// Turn the store read-only. Lower layers are frozen after population;
    /// every mutating call afterwards fails with an `Io` error.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Number of successful mutating operations since creation. Used by
    /// tests asserting that an idempotent path performed no real mutation.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(StrataError::Io("read-only storage".into()));
        }
        Ok(())
    }

    fn count_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn insert_node(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let dir = inner.dir(parent.0)?;
        if dir.children.contains_key(name) {
            return Err(StrataError::AlreadyExists);
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        let now = inner.tick();
        inner.nodes.insert(ino, Node::new(attrs, now));
        let dir = inner.node_mut(parent.0)?;
        dir.children.insert(name.to_string(), ino);
        dir.mtime = now;
        self.count_mutation();
        Ok(Handle(ino))
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn root(&self) -> Handle {
        Handle(ROOT_INO)
    }

    fn lookup(&self, parent: Handle, name: &str) -> Result<Handle> {
        let inner = self.inner.read();
        inner.child(parent.0, name).map(Handle)
    }

    fn create(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle> {
        if attrs.kind != EntryKind::File {
            return Err(StrataError::Io("create expects a regular file".into()));
        }
        self.insert_node(parent, name, attrs)
    }

    fn mkdir(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle> {
        if attrs.kind != EntryKind::Directory {
            return Err(StrataError::Io("mkdir expects a directory".into()));
        }
        self.insert_node(parent, name, attrs)
    }

    fn mknod(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle> {
        if attrs.kind != EntryKind::Special {
            return Err(StrataError::Io("mknod expects a special node".into()));
        }
        self.insert_node(parent, name, attrs)
    }

    fn symlink(&self, parent: Handle, name: &str, target: &str) -> Result<Handle> {
        let handle = self.insert_node(
            parent,
            name,
            NewAttrs { kind: EntryKind::Symlink, mode: 0o777, uid: 0, gid: 0, rdev: 0 },
        )?;
        let mut inner = self.inner.write();
        inner.node_mut(handle.0)?.symlink = target.to_string();
        Ok(handle)
    }

    fn hardlink(&self, existing: Handle, parent: Handle, name: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        {
            let node = inner.node(existing.0)?;
            if node.kind == EntryKind::Directory {
                return Err(StrataError::Io("cannot hard link a directory".into()));
            }
            if node.nlink >= self.max_links {
                return Err(StrataError::Io("too many links".into()));
            }
        }
        if inner.dir(parent.0)?.children.contains_key(name) {
            return Err(StrataError::AlreadyExists);
        }
        let now = inner.tick();
        inner.node_mut(existing.0)?.nlink += 1;
        let dir = inner.node_mut(parent.0)?;
        dir.children.insert(name.to_string(), existing.0);
        dir.mtime = now;
        self.count_mutation();
        Ok(())
    }

    fn unlink(&self, parent: Handle, name: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let ino = inner.child(parent.0, name)?;
        if inner.node(ino)?.kind == EntryKind::Directory {
            return Err(StrataError::Io("is a directory".into()));
        }
        let now = inner.tick();
        let dir = inner.node_mut(parent.0)?;
        dir.children.remove(name);
        dir.mtime = now;
        inner.put_link(ino);
        self.count_mutation();
        Ok(())
    }

    fn rmdir(&self, parent: Handle, name: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let ino = inner.child(parent.0, name)?;
        {
            let node = inner.node(ino)?;
            if node.kind != EntryKind::Directory {
                return Err(StrataError::Io("not a directory".into()));
            }
            if !node.children.is_empty() {
                return Err(StrataError::NotEmpty);
            }
        }
        let now = inner.tick();
        let dir = inner.node_mut(parent.0)?;
        dir.children.remove(name);
        dir.mtime = now;
        inner.nodes.remove(&ino);
        self.count_mutation();
        Ok(())
    }

    fn rename(
        &self,
        old_parent: Handle,
        old_name: &str,
        new_parent: Handle,
        new_name: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let src_ino = inner.child(old_parent.0, old_name)?;

        match flags {
            RenameFlags::Exchange => {
                let dst_ino = inner.child(new_parent.0, new_name)?;
                let now = inner.tick();
                inner
                    .node_mut(old_parent.0)?
                    .children
                    .insert(old_name.to_string(), dst_ino);
                inner.node_mut(old_parent.0)?.mtime = now;
                inner
                    .node_mut(new_parent.0)?
                    .children
                    .insert(new_name.to_string(), src_ino);
                inner.node_mut(new_parent.0)?.mtime = now;
            }
            RenameFlags::None => {
                if let Ok(dst_ino) = inner.child(new_parent.0, new_name) {
                    let src_is_dir = inner.node(src_ino)?.kind == EntryKind::Directory;
                    let dst = inner.node(dst_ino)?;
                    match dst.kind {
                        EntryKind::Directory => {
                            if !src_is_dir {
                                return Err(StrataError::Io("is a directory".into()));
                            }
                            if !dst.children.is_empty() {
                                return Err(StrataError::NotEmpty);
                            }
                            inner.node_mut(new_parent.0)?.children.remove(new_name);
                            inner.nodes.remove(&dst_ino);
                        }
                        _ => {
                            if src_is_dir {
                                return Err(StrataError::Io("not a directory".into()));
                            }
                            inner.node_mut(new_parent.0)?.children.remove(new_name);
                            inner.put_link(dst_ino);
                        }
                    }
                }
                let now = inner.tick();
                inner.node_mut(old_parent.0)?.children.remove(old_name);
                inner.node_mut(old_parent.0)?.mtime = now;
                let dir = inner.node_mut(new_parent.0)?;
                dir.children.insert(new_name.to_string(), src_ino);
                dir.mtime = now;
            }
        }
        self.count_mutation();
        Ok(())
    }

    fn get_attrs(&self, handle: Handle) -> Result<Attrs> {
        let inner = self.inner.read();
        let node = inner.node(handle.0)?;
        Ok(Attrs {
            kind: node.kind,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size: node.data.len() as u64,
            nlink: node.nlink,
            rdev: node.rdev,
            ino: handle.0,
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }

    fn set_attrs(&self, handle: Handle, attrs: SetAttrs) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let now = inner.tick();
        let node = inner.node_mut(handle.0)?;
        if let Some(mode) = attrs.mode {
            node.mode = mode;
        }
        if let Some(uid) = attrs.uid {
            node.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            node.gid = gid;
        }
        if let Some(size) = attrs.size {
            node.data.resize(size as usize, 0);
        }
        node.mtime = attrs.mtime.unwrap_or(node.mtime);
        node.ctime = now;
        self.count_mutation();
        Ok(())
    }

    fn get_xattr(&self, handle: Handle, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.xattrs_enabled {
            return Err(StrataError::MetadataUnsupported("xattrs disabled".into()));
        }
        let inner = self.inner.read();
        Ok(inner.node(handle.0)?.xattrs.get(key).cloned())
    }

    fn set_xattr(&self, handle: Handle, key: &str, value: &[u8], mode: XattrMode) -> Result<()> {
        if !self.xattrs_enabled {
            return Err(StrataError::MetadataUnsupported("xattrs disabled".into()));
        }
        self.check_writable()?;
        let mut inner = self.inner.write();
        let node = inner.node_mut(handle.0)?;
        if mode == XattrMode::CreateOnly && node.xattrs.contains_key(key) {
            return Err(StrataError::AlreadyExists);
        }
        node.xattrs.insert(key.to_string(), value.to_vec());
        self.count_mutation();
        Ok(())
    }

    fn remove_xattr(&self, handle: Handle, key: &str) -> Result<()> {
        if !self.xattrs_enabled {
            return Err(StrataError::MetadataUnsupported("xattrs disabled".into()));
        }
        self.check_writable()?;
        let mut inner = self.inner.write();
        inner.node_mut(handle.0)?.xattrs.remove(key);
        self.count_mutation();
        Ok(())
    }

    fn list_xattrs(&self, handle: Handle) -> Result<Vec<String>> {
        if !self.xattrs_enabled {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        Ok(inner.node(handle.0)?.xattrs.keys().cloned().collect())
    }

    fn read_dir(&self, handle: Handle, offset: usize) -> Result<Vec<DirEntry>> {
        let inner = self.inner.read();
        let dir = inner.dir(handle.0)?;
        dir.children
            .iter()
            .skip(offset)
            .map(|(name, &ino)| {
                let node = inner.node(ino)?;
                Ok(DirEntry { name: name.clone(), kind: node.kind, ino })
            })
            .collect()
    }

    fn read_data(&self, handle: Handle) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let node = inner.node(handle.0)?;
        if node.kind != EntryKind::File {
            return Err(StrataError::Io("not a regular file".into()));
        }
        Ok(node.data.clone())
    }

    fn write_data(&self, handle: Handle, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let now = inner.tick();
        let node = inner.node_mut(handle.0)?;
        if node.kind != EntryKind::File {
            return Err(StrataError::Io("not a regular file".into()));
        }
        node.data = data.to_vec();
        node.mtime = now;
        self.count_mutation();
        Ok(())
    }

    fn read_symlink(&self, handle: Handle) -> Result<String> {
        let inner = self.inner.read();
        let node = inner.node(handle.0)?;
        if node.kind != EntryKind::Symlink {
            return Err(StrataError::Io("not a symlink".into()));
        }
        Ok(node.symlink.clone())
    }

    fn supports_xattrs(&self) -> bool {
        self.xattrs_enabled
    }

    fn max_links(&self) -> u32 {
        self.max_links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_roundtrip() {
        let store = MemStorage::new();
        let root = store.root();
        let f = store.create(root, "a.txt", NewAttrs::file(0o644)).unwrap();
        store.write_data(f, b"hello").unwrap();

        let found = store.lookup(root, "a.txt").unwrap();
        assert_eq!(found, f);
        assert_eq!(store.read_data(found).unwrap(), b"hello");
        assert_eq!(store.get_attrs(found).unwrap().size, 5);
    }

    #[test]
    fn frozen_store_rejects_mutation() {
        let store = MemStorage::new();
        let root = store.root();
        store.create(root, "a.txt", NewAttrs::file(0o644)).unwrap();
        store.freeze();

        assert!(store.create(root, "b.txt", NewAttrs::file(0o644)).is_err());
        assert!(store.unlink(root, "a.txt").is_err());
        assert!(store.lookup(root, "a.txt").is_ok());
    }

    #[test]
    fn hardlink_respects_max_links() {
        let store = MemStorage::new().with_max_links(2);
        let root = store.root();
        let f = store.create(root, "a", NewAttrs::file(0o644)).unwrap();
        store.hardlink(f, root, "b").unwrap();
        let err = store.hardlink(f, root, "c").unwrap_err();
        assert!(matches!(err, StrataError::Io(_)));
    }

    #[test]
    fn unlink_frees_node_at_zero_links() {
        let store = MemStorage::new();
        let root = store.root();
        let f = store.create(root, "a", NewAttrs::file(0o644)).unwrap();
        store.hardlink(f, root, "b").unwrap();
        assert_eq!(store.get_attrs(f).unwrap().nlink, 2);

        store.unlink(root, "a").unwrap();
        assert_eq!(store.get_attrs(f).unwrap().nlink, 1);
        store.unlink(root, "b").unwrap();
        assert!(store.get_attrs(f).is_err());
    }

    #[test]
    fn rename_exchange_swaps_entries() {
        let store = MemStorage::new();
        let root = store.root();
        let a = store.create(root, "a", NewAttrs::file(0o644)).unwrap();
        let b = store.create(root, "b", NewAttrs::file(0o644)).unwrap();

        store.rename(root, "a", root, "b", RenameFlags::Exchange).unwrap();
        assert_eq!(store.lookup(root, "a").unwrap(), b);
        assert_eq!(store.lookup(root, "b").unwrap(), a);
    }

    #[test]
    fn rename_overwrites_file_target() {
        let store = MemStorage::new();
        let root = store.root();
        let a = store.create(root, "a", NewAttrs::file(0o644)).unwrap();
        store.create(root, "b", NewAttrs::file(0o644)).unwrap();

        store.rename(root, "a", root, "b", RenameFlags::None).unwrap();
        assert!(matches!(store.lookup(root, "a"), Err(StrataError::NotFound)));
        assert_eq!(store.lookup(root, "b").unwrap(), a);
    }

    #[test]
    fn xattr_disabled_store_reports_unsupported() {
        let store = MemStorage::new().without_xattrs();
        let root = store.root();
        let f = store.create(root, "a", NewAttrs::file(0o644)).unwrap();
        assert!(matches!(
            store.set_xattr(f, "k", b"v", XattrMode::Overwrite),
            Err(StrataError::MetadataUnsupported(_))
        ));
        assert!(!store.supports_xattrs());
    }
}
