//! The union engine: an ordered stack of storage layers presented as one
//! namespace.
//!
//! The top layer is writable; every layer beneath is read-only. Reads
//! resolve top-down through whiteouts, opacity, and redirects; writes
//! land in the upper layer after copy-up. Per-directory mutation locks
//! serialize namespace changes, and a monotonically versioned merge cache
//! gives readers consistent listings without blocking writers.

mod copy_up;
mod dircache;
mod index;
mod layer;
mod redirect;
mod types;
mod whiteout;

pub use dircache::{DirHandle, MergeEntry, MergedDir};
pub use index::LinkGuard;
pub use layer::{Layer, LayerStack};
pub use types::{classify, CopyUpStatus, LayerRef, OverlayEntry, PathType};

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::error::{Result, StrataError};
use crate::storage::{
    Attrs, EntryKind, Handle, NewAttrs, RenameFlags, SetAttrs, Storage,
};
use copy_up::XATTR_METACOPY;
use index::{parse_origin_token, XATTR_ORIGIN};
use redirect::build_relative_path;
use types::{EntryState, LayerRef as LRef};
use whiteout::{is_whiteout, WhiteoutState};

/// Work area for staged objects and shared whiteout tombstones, reserved
/// under the upper layer's root.
pub const WORK_DIR: &str = ".work";

/// Home of persisted link-count entries, reserved under the upper layer's
/// root.
pub const INDEX_DIR: &str = ".index";

/// How a rename treats its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameMode {
    /// Move the source over the destination, replacing it if present.
    Move,
    /// Atomically swap source and destination; both must exist.
    Exchange,
}

enum CreatePayload {
    File(NewAttrs),
    Dir(NewAttrs),
    Node(NewAttrs),
    Symlink(String),
}

impl CreatePayload {
    fn kind(&self) -> EntryKind {
        match self {
            CreatePayload::File(_) => EntryKind::File,
            CreatePayload::Dir(_) => EntryKind::Directory,
            CreatePayload::Node(a) => a.kind,
            CreatePayload::Symlink(_) => EntryKind::Symlink,
        }
    }
}

/// The mounted union.
pub struct UnionFs {
    pub(crate) layers: LayerStack,
    root: Arc<OverlayEntry>,
    pub(crate) workdir: Handle,
    pub(crate) indexdir: Handle,
    next_id: AtomicU64,
    temp_counter: AtomicU64,
    /// Per-directory namespace mutation locks, keyed by entry id.
    dir_locks: DashMap<u64, Arc<Mutex<()>>>,
    /// Per-entry copy-up and link-accounting locks, keyed by entry id.
    entry_locks: DashMap<u64, Arc<Mutex<()>>>,
    pub(crate) dir_caches: Mutex<LruCache<u64, Arc<MergedDir>>>,
    pub(crate) whiteout: Mutex<WhiteoutState>,
}

impl UnionFs {
    /// Mount a layer stack. Prepares the reserved work and index areas in
    /// the upper layer and discards staged objects left over from an
    /// interrupted session.
    pub fn new(layers: LayerStack) -> Result<UnionFs> {
        let upper = Arc::clone(&layers.upper().store);
        let upper_root = upper.root();
        let workdir = Self::ensure_internal_dir(upper.as_ref(), upper_root, WORK_DIR)?;
        let indexdir = Self::ensure_internal_dir(upper.as_ref(), upper_root, INDEX_DIR)?;
        Self::sweep_work_area(upper.as_ref(), workdir);

        let mut lowers = Vec::with_capacity(layers.lowers().len());
        for layer in layers.lowers() {
            lowers.push(LRef { layer: layer.index, handle: layer.store.root() });
        }
        let root = OverlayEntry::new(
            1,
            EntryKind::Directory,
            EntryState {
                name: String::new(),
                parent: None,
                upper: Some(upper_root),
                lowers,
                opaque: false,
                redirect: None,
                metacopy: false,
                origin: None,
                removed: false,
                parent_version: 0,
            },
        );

        let capacity = NonZeroUsize::new(layers.config().dir_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Ok(UnionFs {
            layers,
            root,
            workdir,
            indexdir,
            next_id: AtomicU64::new(2),
            temp_counter: AtomicU64::new(1),
            dir_locks: DashMap::new(),
            entry_locks: DashMap::new(),
            dir_caches: Mutex::new(LruCache::new(capacity)),
            whiteout: Mutex::new(WhiteoutState::new()),
        })
    }

    fn ensure_internal_dir(upper: &dyn Storage, root: Handle, name: &str) -> Result<Handle> {
        match upper.lookup(root, name) {
            Ok(h) => {
                if upper.get_attrs(h)?.kind != EntryKind::Directory {
                    return Err(StrataError::Inconsistent(format!(
                        "reserved name {name:?} is occupied by a non-directory"
                    )));
                }
                Ok(h)
            }
            Err(StrataError::NotFound) => {
                upper.mkdir(root, name, NewAttrs::directory(0o700))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove staged temp objects abandoned by a crashed session. Shared
    /// tombstones are re-created lazily, so everything here is garbage.
    fn sweep_work_area(upper: &dyn Storage, workdir: Handle) {
        let entries = match upper.read_dir(workdir, 0) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("work area unreadable at mount: {e}");
                return;
            }
        };
        for entry in entries {
            tracing::info!(name = entry.name, "discarding stale work-area object");
            let res = if entry.kind == EntryKind::Directory {
                upper.rmdir(workdir, &entry.name)
            } else {
                upper.unlink(workdir, &entry.name)
            };
            if let Err(e) = res {
                tracing::warn!(name = entry.name, "stale work-area object not removed: {e}");
            }
        }
    }

    pub fn root(&self) -> Arc<OverlayEntry> {
        Arc::clone(&self.root)
    }

    pub fn config(&self) -> &crate::config::Config {
        self.layers.config()
    }

    /// The path type of an entry right now.
    pub fn path_type(&self, entry: &Arc<OverlayEntry>) -> PathType {
        classify(entry)
    }

    pub(crate) fn is_internal_name(name: &str) -> bool {
        name == WORK_DIR || name == INDEX_DIR
    }

    pub(crate) fn temp_name(&self) -> String {
        format!("#{:x}", self.temp_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn entry_lock(&self, id: u64) -> Arc<Mutex<()>> {
        Arc::clone(&self.entry_locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    fn dir_lock(&self, id: u64) -> Arc<Mutex<()>> {
        Arc::clone(&self.dir_locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Lock one or two directory mutation locks in ascending entry-id
    /// order. All multi-directory operations go through here, which is
    /// what makes the ordering global.
    fn lock_dir_pair(
        &self,
        a: u64,
        b: u64,
    ) -> (ArcMutexGuard<RawMutex, ()>, Option<ArcMutexGuard<RawMutex, ()>>) {
        if a == b {
            return (Mutex::lock_arc(&self.dir_lock(a)), None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = Mutex::lock_arc(&self.dir_lock(first));
        let g2 = Mutex::lock_arc(&self.dir_lock(second));
        (g1, Some(g2))
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(StrataError::Inconsistent(format!("invalid entry name {name:?}")));
        }
        Ok(())
    }

    // ---- lookup ----

    /// Resolve `name` under a directory entry to its union identity.
    ///
    /// Identities are cached per parent and revalidated against the parent
    /// version, so repeated lookups between mutations are lock-free reads.
    pub fn lookup(&self, parent: &Arc<OverlayEntry>, name: &str) -> Result<Arc<OverlayEntry>> {
        if !parent.is_dir() {
            return Err(StrataError::NotFound);
        }
        if parent.is_removed() {
            return Err(StrataError::StaleReference(parent.path()));
        }
        if name.is_empty() || name == "." {
            return Ok(Arc::clone(parent));
        }
        if name == ".." {
            return Ok(parent.parent().unwrap_or_else(|| self.root()));
        }
        if Arc::ptr_eq(parent, &self.root) && Self::is_internal_name(name) {
            return Err(StrataError::NotFound);
        }

        let parent_version = parent.version();
        let cached = parent.cached_child(name).filter(|c| !c.is_removed());
        if let Some(child) = &cached {
            if child.state.read().parent_version == parent_version {
                return Ok(Arc::clone(child));
            }
        }
        let resolved = self.resolve_child(parent, name, parent_version)?;
        // Version drift alone must not mint a duplicate identity: if the
        // name still denotes the same real object, refresh the entry the
        // caller may already hold instead of replacing it.
        if let Some(child) = cached {
            if Self::same_real_object(&child, &resolved) {
                {
                    let mut st = child.state.write();
                    let fresh = resolved.state.read();
                    st.opaque = fresh.opaque;
                    st.redirect = fresh.redirect.clone();
                    st.metacopy = fresh.metacopy;
                    st.origin = fresh.origin;
                    st.parent_version = parent_version;
                }
                parent.cache_child(name, &child);
                return Ok(child);
            }
        }
        parent.cache_child(name, &resolved);
        Ok(resolved)
    }

    /// Whether two resolutions of one name denote the same real object in
    /// every contributing layer.
    fn same_real_object(a: &Arc<OverlayEntry>, b: &Arc<OverlayEntry>) -> bool {
        if a.kind != b.kind {
            return false;
        }
        let sa = a.state.read();
        let sb = b.state.read();
        sa.upper == sb.upper
            && sa.lowers.len() == sb.lowers.len()
            && sa
                .lowers
                .iter()
                .zip(sb.lowers.iter())
                .all(|(x, y)| x.layer == y.layer && x.handle == y.handle)
    }

    /// Full top-down resolution of one name: upper probe, whiteout and
    /// marker reads, then the lower walk following redirects and stopping
    /// at opacity or kind mismatches.
    fn resolve_child(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
        parent_version: u64,
    ) -> Result<Arc<OverlayEntry>> {
        let (parent_upper, parent_lowers) = {
            let st = parent.state.read();
            (st.upper, st.lowers.clone())
        };

        let upper_store = &self.layers.upper().store;
        let mut upper_handle = None;
        let mut kind: Option<EntryKind> = None;
        let mut opaque = false;
        let mut redirect: Option<String> = None;
        let mut metacopy = false;
        let mut origin: Option<(u64, u64)> = None;

        if let Some(pu) = parent_upper {
            match upper_store.lookup(pu, name) {
                Ok(h) => {
                    let attrs = upper_store.get_attrs(h)?;
                    if is_whiteout(&attrs) {
                        return Err(StrataError::NotFound);
                    }
                    upper_handle = Some(h);
                    kind = Some(attrs.kind);
                    if upper_store.supports_xattrs() {
                        if attrs.kind == EntryKind::Directory {
                            opaque = self.dir_is_opaque(0, h);
                        }
                        redirect = self.redirect_of(0, h);
                        metacopy = upper_store.get_xattr(h, XATTR_METACOPY)?.is_some();
                        origin = upper_store
                            .get_xattr(h, XATTR_ORIGIN)?
                            .as_deref()
                            .and_then(parse_origin_token);
                    }
                }
                Err(StrataError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let mut lowers: Vec<LRef> = Vec::new();
        let walk_lowers = match kind {
            Some(EntryKind::Directory) => !opaque,
            Some(_) => metacopy || redirect.is_some(),
            None => true,
        };
        if walk_lowers {
            let mut search = redirect.clone().unwrap_or_else(|| name.to_string());
            for layer in self.layers.lowers() {
                let store = &layer.store;
                let found = if search.starts_with('/') {
                    self.walk_layer_path(layer.index, &search)?
                } else {
                    let parent_lower =
                        parent_lowers.iter().find(|l| l.layer == layer.index).copied();
                    match parent_lower {
                        Some(pl) => match store.lookup(pl.handle, &search) {
                            Ok(h) => Some(h),
                            Err(StrataError::NotFound) => None,
                            Err(e) => return Err(e),
                        },
                        None => None,
                    }
                };
                let Some(h) = found else { continue };
                let attrs = store.get_attrs(h)?;
                if is_whiteout(&attrs) {
                    break;
                }
                match kind {
                    None => kind = Some(attrs.kind),
                    Some(k) if k != attrs.kind => break,
                    Some(_) => {}
                }
                lowers.push(LRef { layer: layer.index, handle: h });
                if attrs.kind != EntryKind::Directory {
                    break;
                }
                if self.dir_is_opaque(layer.index, h) {
                    break;
                }
                if let Some(r) = self.redirect_of(layer.index, h) {
                    search = r;
                }
            }
        }

        if upper_handle.is_none() && lowers.is_empty() {
            return Err(StrataError::NotFound);
        }
        let kind = kind.ok_or_else(|| {
            StrataError::Inconsistent(format!("entry {name:?} resolved without a kind"))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(OverlayEntry::new(
            id,
            kind,
            EntryState {
                name: name.to_string(),
                parent: Some(Arc::clone(parent)),
                upper: upper_handle,
                lowers,
                opaque,
                redirect,
                metacopy,
                origin,
                removed: false,
                parent_version,
            },
        ))
    }

    /// Walk an absolute redirect path from a lower layer's root.
    fn walk_layer_path(&self, layer: usize, path: &str) -> Result<Option<Handle>> {
        let store = &self.layers.layer(layer).store;
        let mut handle = store.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match store.lookup(handle, segment) {
                Ok(h) => handle = h,
                Err(StrataError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(Some(handle))
    }

    /// Whether any lower layer presents a live object at `name` under
    /// `parent`, ignoring entries hidden by a lower-layer whiteout.
    fn lower_occupied(&self, parent: &Arc<OverlayEntry>, name: &str) -> Result<bool> {
        let lowers = parent.state.read().lowers.clone();
        for lref in &lowers {
            let store = &self.layers.layer(lref.layer).store;
            match store.lookup(lref.handle, name) {
                Ok(h) => return Ok(!is_whiteout(&store.get_attrs(h)?)),
                Err(StrataError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    // ---- attributes ----

    /// Attributes of an entry as the union presents them: merged size for
    /// metadata-only placeholders, persisted link counts for indexed
    /// origins, and stable display inode numbers.
    pub fn get_attrs(&self, entry: &Arc<OverlayEntry>) -> Result<Attrs> {
        let st = entry.state.read();
        if st.removed {
            drop(st);
            return Err(StrataError::StaleReference(entry.path()));
        }

        let mut attrs = match st.upper {
            Some(u) => {
                let mut a = self.layers.upper().store.get_attrs(u)?;
                if st.metacopy {
                    if let Some(l) = st.lowers.last() {
                        a.size =
                            self.layers.layer(l.layer).store.get_attrs(l.handle)?.size;
                    }
                }
                a
            }
            None => {
                let l = st.lowers.first().ok_or_else(|| {
                    StrataError::Inconsistent("entry has neither upper nor lower".into())
                })?;
                self.layers.layer(l.layer).store.get_attrs(l.handle)?
            }
        };

        if entry.is_dir() {
            attrs.ino = match &st.parent {
                Some(p) => fxhash::hash64(&(p.id, st.name.as_str())),
                None => 1,
            };
        } else {
            let real_ino = attrs.ino;
            let (fsid, ino) = match st.origin {
                Some(o) => o,
                None => {
                    let fsid = if st.upper.is_some() {
                        0
                    } else {
                        st.lowers
                            .first()
                            .map(|l| self.layers.layer(l.layer).fsid)
                            .unwrap_or(0)
                    };
                    (fsid, real_ino)
                }
            };
            attrs.ino = self.display_file_ino(fsid, ino);

            // Index-tracked origins report the persisted union link count.
            // Lower-only entries consult the index too: a sibling link may
            // already have been copied up or whited out.
            let identity = match st.origin {
                Some(o) => Some(o),
                None if st.upper.is_none() => st
                    .lowers
                    .first()
                    .map(|l| (self.layers.layer(l.layer).fsid, real_ino)),
                None => None,
            };
            if self.layers.config().index {
                if let Some((ofsid, oino)) = identity {
                    if let Some(index) = self.lookup_index(ofsid, oino)? {
                        attrs.nlink =
                            self.read_index_nlink(index)?.min(u32::MAX as u64) as u32;
                    }
                }
            }
        }
        Ok(attrs)
    }

    /// Apply a partial attribute update. Metadata changes force a
    /// metadata copy-up; a size change touches data and forces a full one.
    pub fn set_attrs(&self, entry: &Arc<OverlayEntry>, attrs: SetAttrs) -> Result<()> {
        if attrs.size.is_some() {
            self.copy_up_with_data(entry)?;
        } else {
            self.copy_up(entry)?;
        }
        let upper = entry.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("entry not materialized after copy-up".into())
        })?;
        self.layers.upper().store.set_attrs(upper, attrs)
    }

    // ---- data ----

    /// Whole-object read through the union view. Metadata-only
    /// placeholders defer to their lower data source.
    pub fn read_data(&self, entry: &Arc<OverlayEntry>) -> Result<Vec<u8>> {
        let st = entry.state.read();
        if st.removed {
            drop(st);
            return Err(StrataError::StaleReference(entry.path()));
        }
        match st.upper {
            Some(u) if !st.metacopy => self.layers.upper().store.read_data(u),
            _ => {
                let l = st.lowers.last().ok_or_else(|| {
                    StrataError::Inconsistent("no data source for entry".into())
                })?;
                self.layers.layer(l.layer).store.read_data(l.handle)
            }
        }
    }

    /// Whole-object write; forces full copy-up first.
    pub fn write_data(&self, entry: &Arc<OverlayEntry>, data: &[u8]) -> Result<()> {
        self.copy_up_with_data(entry)?;
        let upper = entry.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("entry not materialized after copy-up".into())
        })?;
        self.layers.upper().store.write_data(upper, data)
    }

    pub fn read_link(&self, entry: &Arc<OverlayEntry>) -> Result<String> {
        let st = entry.state.read();
        match st.upper {
            Some(u) => self.layers.upper().store.read_symlink(u),
            None => {
                let l = st.lowers.first().ok_or(StrataError::NotFound)?;
                self.layers.layer(l.layer).store.read_symlink(l.handle)
            }
        }
    }

    // ---- create ----

    pub fn create(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
        attrs: NewAttrs,
    ) -> Result<Arc<OverlayEntry>> {
        self.create_common(parent, name, CreatePayload::File(attrs))
    }

    pub fn mkdir(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
        attrs: NewAttrs,
    ) -> Result<Arc<OverlayEntry>> {
        self.create_common(parent, name, CreatePayload::Dir(attrs))
    }

    pub fn mknod(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
        attrs: NewAttrs,
    ) -> Result<Arc<OverlayEntry>> {
        self.create_common(parent, name, CreatePayload::Node(attrs))
    }

    pub fn symlink(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
        target: &str,
    ) -> Result<Arc<OverlayEntry>> {
        self.create_common(parent, name, CreatePayload::Symlink(target.to_string()))
    }

    fn create_common(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
        payload: CreatePayload,
    ) -> Result<Arc<OverlayEntry>> {
        Self::validate_name(name)?;
        if !parent.is_dir() {
            return Err(StrataError::Inconsistent("create inside a non-directory".into()));
        }
        if Arc::ptr_eq(parent, &self.root) && Self::is_internal_name(name) {
            return Err(StrataError::AlreadyExists);
        }

        let dlock = self.dir_lock(parent.id);
        let _guard = dlock.lock();
        if parent.is_removed() {
            return Err(StrataError::StaleReference(parent.path()));
        }
        match self.lookup(parent, name) {
            Ok(_) => return Err(StrataError::AlreadyExists),
            Err(StrataError::NotFound) => {}
            Err(e) => return Err(e),
        }

        self.copy_up(parent)?;
        let pu = parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("parent not materialized after copy-up".into())
        })?;
        let upper = &self.layers.upper().store;

        let over_whiteout = match upper.lookup(pu, name) {
            Ok(h) => {
                if is_whiteout(&upper.get_attrs(h)?) {
                    true
                } else {
                    return Err(StrataError::AlreadyExists);
                }
            }
            Err(StrataError::NotFound) => false,
            Err(e) => return Err(e),
        };

        let handle = if over_whiteout {
            // Stage in the work area and displace the tombstone atomically
            // so no reader ever sees the name vacant.
            let tmp = self.temp_name();
            let h = self.create_real(self.workdir, &tmp, &payload)?;
            if let Err(e) = self.place_staged(&tmp, name, pu) {
                if let Err(c) = upper.unlink(self.workdir, &tmp) {
                    tracing::warn!(temp = tmp, "staged create left in work area: {c}");
                }
                return Err(e);
            }
            h
        } else {
            self.create_real(pu, name, &payload)?
        };

        let mut opaque = false;
        if payload.kind() == EntryKind::Directory && over_whiteout {
            // A lower directory hidden by the tombstone must stay hidden
            // beneath the new directory.
            if self.lower_occupied(parent, name)? {
                if let Err(e) = self.set_opaque(handle) {
                    let _ = upper.rmdir(pu, name);
                    let _ = self.create_whiteout(pu, name);
                    return Err(StrataError::MetadataUnsupported(format!(
                        "cannot mark replacement directory opaque: {e}"
                    )));
                }
                opaque = true;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = OverlayEntry::new(
            id,
            payload.kind(),
            EntryState {
                name: name.to_string(),
                parent: Some(Arc::clone(parent)),
                upper: Some(handle),
                lowers: Vec::new(),
                opaque,
                redirect: None,
                metacopy: false,
                origin: None,
                removed: false,
                parent_version: 0,
            },
        );
        let version = parent.bump_version();
        entry.state.write().parent_version = version;
        parent.cache_child(name, &entry);
        Ok(entry)
    }

    fn create_real(&self, dir: Handle, name: &str, payload: &CreatePayload) -> Result<Handle> {
        let upper = &self.layers.upper().store;
        match payload {
            CreatePayload::File(a) => upper.create(dir, name, *a),
            CreatePayload::Dir(a) => upper.mkdir(dir, name, *a),
            CreatePayload::Node(a) => upper.mknod(dir, name, *a),
            CreatePayload::Symlink(target) => upper.symlink(dir, name, target),
        }
    }

    // ---- unlink / rmdir ----

    /// Remove a non-directory name from the union.
    pub fn unlink(&self, parent: &Arc<OverlayEntry>, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        let dlock = self.dir_lock(parent.id);
        let _guard = dlock.lock();
        if parent.is_removed() {
            return Err(StrataError::StaleReference(parent.path()));
        }
        let victim = self.lookup(parent, name)?;
        if victim.is_dir() {
            return Err(StrataError::Inconsistent(format!(
                "{name:?} is a directory; use remove_dir"
            )));
        }

        let guard = self.begin_link_mutation(&victim)?;
        self.copy_up(parent)?;
        let pu = parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("parent not materialized after copy-up".into())
        })?;
        let upper = &self.layers.upper().store;

        let need_whiteout = victim.has_lower() || self.lower_occupied(parent, name)?;
        match victim.upper_handle() {
            Some(_) if need_whiteout => {
                // Replace the live object with a tombstone in one step.
                let tmp = self.temp_name();
                self.create_whiteout(self.workdir, &tmp)?;
                upper.rename(self.workdir, &tmp, pu, name, RenameFlags::Exchange)?;
                upper.unlink(self.workdir, &tmp)?;
            }
            Some(_) => {
                upper.unlink(pu, name)?;
            }
            None => {
                self.create_whiteout(pu, name)?;
            }
        }
        guard.commit(-1)?;

        victim.state.write().removed = true;
        parent.forget_child(name);
        parent.bump_version();
        tracing::debug!(parent = %parent.path(), name, "unlinked");
        Ok(())
    }

    /// Remove a directory name. The directory must be effectively empty:
    /// whiteout tombstones inside it do not count as content.
    pub fn remove_dir(&self, parent: &Arc<OverlayEntry>, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        // Both the parent and the victim directory are locked, in the same
        // ascending-id order every multi-directory operation uses. The
        // victim is resolved unlocked first, so revalidate after locking.
        let (victim, _locks) = loop {
            let candidate = self.lookup(parent, name)?;
            let locks = self.lock_dir_pair(parent.id, candidate.id);
            if parent.is_removed() {
                return Err(StrataError::StaleReference(parent.path()));
            }
            match self.lookup(parent, name) {
                Ok(v) if Arc::ptr_eq(&v, &candidate) => break (v, locks),
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        };
        if !victim.is_dir() {
            return Err(StrataError::Inconsistent(format!("{name:?} is not a directory")));
        }

        let merged = self.get_merged_listing(&victim)?;
        if !merged.is_effectively_empty() {
            return Err(StrataError::NotEmpty);
        }

        self.copy_up(parent)?;
        let pu = parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("parent not materialized after copy-up".into())
        })?;
        let upper = &self.layers.upper().store;
        let need_whiteout = victim.has_lower() || self.lower_occupied(parent, name)?;

        match victim.upper_handle() {
            Some(vh) => {
                for entry in merged.entries().iter().filter(|e| e.is_whiteout && e.is_upper) {
                    upper.unlink(vh, &entry.name)?;
                }
                if need_whiteout {
                    let tmp = self.temp_name();
                    self.create_whiteout(self.workdir, &tmp)?;
                    upper.rename(self.workdir, &tmp, pu, name, RenameFlags::Exchange)?;
                    upper.rmdir(self.workdir, &tmp)?;
                } else {
                    upper.rmdir(pu, name)?;
                }
            }
            None => {
                self.create_whiteout(pu, name)?;
            }
        }

        victim.state.write().removed = true;
        parent.forget_child(name);
        parent.bump_version();
        tracing::debug!(parent = %parent.path(), name, "directory removed");
        Ok(())
    }

    // ---- link ----

    /// Create an additional hard link to `src` at `new_parent/new_name`.
    pub fn link(
        &self,
        src: &Arc<OverlayEntry>,
        new_parent: &Arc<OverlayEntry>,
        new_name: &str,
    ) -> Result<Arc<OverlayEntry>> {
        Self::validate_name(new_name)?;
        if src.is_dir() {
            return Err(StrataError::Inconsistent("hard link to a directory".into()));
        }
        if Arc::ptr_eq(new_parent, &self.root) && Self::is_internal_name(new_name) {
            return Err(StrataError::AlreadyExists);
        }

        let dlock = self.dir_lock(new_parent.id);
        let _guard = dlock.lock();
        if new_parent.is_removed() {
            return Err(StrataError::StaleReference(new_parent.path()));
        }
        match self.lookup(new_parent, new_name) {
            Ok(_) => return Err(StrataError::AlreadyExists),
            Err(StrataError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.copy_up(new_parent)?;

        let guard = self.begin_link_mutation(src)?;
        if src.upper_handle().is_none() {
            self.copy_up_locked(src, !self.layers.config().metacopy)?;
        }
        // A placeholder's data lives at its lower path; the new name needs
        // a recorded path back to it.
        {
            let (is_metacopy, has_redirect) = {
                let st = src.state.read();
                (st.metacopy, st.redirect.is_some())
            };
            if is_metacopy && !has_redirect {
                let src_parent = src.parent().ok_or_else(|| {
                    StrataError::Inconsistent("linked entry has no parent".into())
                })?;
                let path = self.checked_redirect_path(&src_parent, &src.name())?;
                self.set_redirect(src, &path)?;
            }
        }

        let uh = src.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("link source not materialized".into())
        })?;
        let pu = new_parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("parent not materialized after copy-up".into())
        })?;
        self.place_over_whiteout(uh, pu, new_name)?;
        guard.commit(1)?;

        new_parent.forget_child(new_name);
        new_parent.bump_version();
        let entry = self.lookup(new_parent, new_name)?;
        tracing::debug!(src = %src.path(), dst = %entry.path(), "hard link created");
        Ok(entry)
    }

    // ---- rename ----

    /// Move or exchange a name, preserving lower-layer visibility through
    /// redirects and whiteouts.
    pub fn rename(
        &self,
        old_parent: &Arc<OverlayEntry>,
        name: &str,
        new_parent: &Arc<OverlayEntry>,
        new_name: &str,
        mode: RenameMode,
    ) -> Result<()> {
        Self::validate_name(name)?;
        Self::validate_name(new_name)?;
        if Arc::ptr_eq(new_parent, &self.root) && Self::is_internal_name(new_name) {
            return Err(StrataError::AlreadyExists);
        }
        if Arc::ptr_eq(old_parent, &self.root) && Self::is_internal_name(name) {
            return Err(StrataError::NotFound);
        }

        let _locks = self.lock_dir_pair(old_parent.id, new_parent.id);
        if old_parent.is_removed() {
            return Err(StrataError::StaleReference(old_parent.path()));
        }
        if new_parent.is_removed() {
            return Err(StrataError::StaleReference(new_parent.path()));
        }

        let src = self.lookup(old_parent, name)?;
        if src.is_dir() {
            // A directory must never become its own ancestor; the upper
            // store would hold a detached cycle unreachable from the root.
            let mut ancestor = Some(Arc::clone(new_parent));
            while let Some(cur) = ancestor {
                if Arc::ptr_eq(&cur, &src) {
                    return Err(StrataError::Inconsistent(
                        "cannot move a directory into its own subtree".into(),
                    ));
                }
                ancestor = cur.parent();
            }
        }
        let dst = match self.lookup(new_parent, new_name) {
            Ok(e) => Some(e),
            Err(StrataError::NotFound) => None,
            Err(e) => return Err(e),
        };

        match mode {
            RenameMode::Exchange => {
                let dst = dst.ok_or(StrataError::NotFound)?;
                self.rename_exchange(old_parent, name, &src, new_parent, new_name, &dst)
            }
            RenameMode::Move => {
                self.rename_move(old_parent, name, &src, new_parent, new_name, dst)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_move(
        &self,
        old_parent: &Arc<OverlayEntry>,
        name: &str,
        src: &Arc<OverlayEntry>,
        new_parent: &Arc<OverlayEntry>,
        new_name: &str,
        dst: Option<Arc<OverlayEntry>>,
    ) -> Result<()> {
        let same_dir = Arc::ptr_eq(old_parent, new_parent);
        if let Some(d) = &dst {
            if Arc::ptr_eq(d, src) {
                return Ok(());
            }
            if d.is_dir() {
                if !src.is_dir() {
                    return Err(StrataError::Inconsistent(
                        "cannot replace a directory with a non-directory".into(),
                    ));
                }
                if !self.get_merged_listing(d)?.is_effectively_empty() {
                    return Err(StrataError::NotEmpty);
                }
            } else if src.is_dir() {
                return Err(StrataError::Inconsistent(
                    "cannot replace a non-directory with a directory".into(),
                ));
            }
        }

        self.copy_up(old_parent)?;
        self.copy_up(new_parent)?;

        // Source guard also serves as the copy-up lock; destination guard
        // settles the replaced entry's link accounting. Ascending id order.
        let (src_guard, dst_guard) = match &dst {
            Some(d) => {
                if src.id < d.id {
                    let a = self.begin_link_mutation(src)?;
                    let b = self.begin_link_mutation(d)?;
                    (a, Some(b))
                } else {
                    let b = self.begin_link_mutation(d)?;
                    let a = self.begin_link_mutation(src)?;
                    (a, Some(b))
                }
            }
            None => (self.begin_link_mutation(src)?, None),
        };
        if src.upper_handle().is_none() {
            self.copy_up_locked(src, !self.layers.config().metacopy)?;
        }

        let opu = old_parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("source parent not materialized".into())
        })?;
        let npu = new_parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("destination parent not materialized".into())
        })?;
        let upper = &self.layers.upper().store;
        let src_upper = src.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("rename source not materialized".into())
        })?;

        let need_old_whiteout = src.has_lower() || self.lower_occupied(old_parent, name)?;
        self.record_move_redirect(src, old_parent, name, same_dir)?;

        // A pure-upper directory landing on a name with an unrelated lower
        // directory must not merge with it.
        if src.is_dir() && !src.has_lower() && self.lower_occupied(new_parent, new_name)? {
            self.set_opaque(src_upper)?;
            src.state.write().opaque = true;
        }

        let dst_upper_state = match upper.lookup(npu, new_name) {
            Ok(h) => Some((h, is_whiteout(&upper.get_attrs(h)?))),
            Err(StrataError::NotFound) => None,
            Err(e) => return Err(e),
        };

        match dst_upper_state {
            Some((_, true)) => {
                // Swap with the tombstone: it lands at the old name, which
                // is exactly the whiteout the old name may need.
                upper.rename(opu, name, npu, new_name, RenameFlags::Exchange)?;
                if !need_old_whiteout {
                    upper.unlink(opu, name)?;
                }
            }
            Some((dh, false)) => {
                if let Some(d) = &dst {
                    if d.is_dir() {
                        let merged = self.get_merged_listing(d)?;
                        for entry in
                            merged.entries().iter().filter(|e| e.is_whiteout && e.is_upper)
                        {
                            upper.unlink(dh, &entry.name)?;
                        }
                    }
                }
                upper.rename(opu, name, npu, new_name, RenameFlags::None)?;
                if need_old_whiteout {
                    self.create_whiteout(opu, name)?;
                }
            }
            None => {
                upper.rename(opu, name, npu, new_name, RenameFlags::None)?;
                if need_old_whiteout {
                    self.create_whiteout(opu, name)?;
                }
            }
        }

        if let Some(d) = &dst {
            d.state.write().removed = true;
        }
        if let Some(g) = dst_guard {
            g.commit(-1)?;
        }
        src_guard.commit(0)?;

        {
            let mut st = src.state.write();
            st.name = new_name.to_string();
            st.parent = Some(Arc::clone(new_parent));
        }
        old_parent.forget_child(name);
        new_parent.forget_child(new_name);
        old_parent.bump_version();
        let version = if same_dir { old_parent.version() } else { new_parent.bump_version() };
        src.state.write().parent_version = version;
        new_parent.cache_child(new_name, src);
        tracing::debug!(
            from = %build_relative_path(old_parent, name),
            to = %src.path(),
            "renamed"
        );
        Ok(())
    }

    /// Record the path back to the lower origin before the upper object
    /// moves away from it. An already-recorded absolute path is kept; a
    /// relative one is upgraded when the entry leaves its directory.
    fn record_move_redirect(
        &self,
        src: &Arc<OverlayEntry>,
        old_parent: &Arc<OverlayEntry>,
        old_name: &str,
        same_dir: bool,
    ) -> Result<()> {
        if !src.has_lower() {
            return Ok(());
        }
        let existing = src.state.read().redirect.clone();
        match existing {
            Some(r) if r.starts_with('/') => Ok(()),
            Some(r) => {
                if same_dir {
                    Ok(())
                } else {
                    let path = self.checked_redirect_path(old_parent, &r)?;
                    self.set_redirect(src, &path)
                }
            }
            None => {
                let value = self.compute_redirect(src, old_parent, old_name, same_dir)?;
                self.set_redirect(src, &value)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_exchange(
        &self,
        old_parent: &Arc<OverlayEntry>,
        name: &str,
        src: &Arc<OverlayEntry>,
        new_parent: &Arc<OverlayEntry>,
        new_name: &str,
        dst: &Arc<OverlayEntry>,
    ) -> Result<()> {
        if Arc::ptr_eq(src, dst) {
            return Ok(());
        }
        let same_dir = Arc::ptr_eq(old_parent, new_parent);

        self.copy_up(old_parent)?;
        self.copy_up(new_parent)?;

        let (src_guard, dst_guard) = if src.id < dst.id {
            let a = self.begin_link_mutation(src)?;
            let b = self.begin_link_mutation(dst)?;
            (a, b)
        } else {
            let b = self.begin_link_mutation(dst)?;
            let a = self.begin_link_mutation(src)?;
            (a, b)
        };
        if src.upper_handle().is_none() {
            self.copy_up_locked(src, !self.layers.config().metacopy)?;
        }
        if dst.upper_handle().is_none() {
            self.copy_up_locked(dst, !self.layers.config().metacopy)?;
        }

        let opu = old_parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("source parent not materialized".into())
        })?;
        let npu = new_parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("destination parent not materialized".into())
        })?;

        // Both objects keep resolving their own lower origins from their
        // new positions.
        self.record_move_redirect(src, old_parent, name, same_dir)?;
        self.record_move_redirect(dst, new_parent, new_name, same_dir)?;

        self.layers
            .upper()
            .store
            .rename(opu, name, npu, new_name, RenameFlags::Exchange)?;

        src_guard.commit(0)?;
        dst_guard.commit(0)?;

        {
            let mut st = src.state.write();
            st.name = new_name.to_string();
            st.parent = Some(Arc::clone(new_parent));
        }
        {
            let mut st = dst.state.write();
            st.name = name.to_string();
            st.parent = Some(Arc::clone(old_parent));
        }
        old_parent.forget_child(name);
        new_parent.forget_child(new_name);
        old_parent.bump_version();
        let new_version =
            if same_dir { old_parent.version() } else { new_parent.bump_version() };
        src.state.write().parent_version = new_version;
        dst.state.write().parent_version = old_parent.version();
        new_parent.cache_child(new_name, src);
        old_parent.cache_child(name, dst);
        tracing::debug!(a = %src.path(), b = %dst.path(), "exchanged");
        Ok(())
    }
}
