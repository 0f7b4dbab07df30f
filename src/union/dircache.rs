//! Merged directory listings.
//!
//! A listing is computed once per directory version and cached. The
//! version counter on the directory entry is bumped by every mutation,
//! so a cached listing is valid exactly while its version matches; a
//! reader holding an older snapshot sees a consistent pre-mutation view,
//! never a partial one.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{EntryKind, Handle};
use crate::union::index::{parse_origin_token, XATTR_ORIGIN};
use crate::union::types::OverlayEntry;
use crate::union::whiteout::is_whiteout;
use crate::union::UnionFs;

/// Bits reserved in a display inode number for the layer's fsid when
/// inode remapping is enabled.
const FSID_SHIFT: u32 = 48;

/// One name in a merged listing.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Inode number within the contributing store.
    pub real_ino: u64,
    /// Stable display inode number in the union namespace.
    pub ino: u64,
    /// Index of the contributing layer.
    pub layer: usize,
    pub is_upper: bool,
    /// Tombstone marker; hidden from iteration but retained so emptiness
    /// checks and replace-directory preparation can see it.
    pub is_whiteout: bool,
}

/// Immutable merged view of one directory at one version.
pub struct MergedDir {
    version: u64,
    entries: Vec<MergeEntry>,
    by_name: BTreeMap<String, usize>,
}

impl MergedDir {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lookup(&self, name: &str) -> Option<&MergeEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// All retained names including whiteout tombstones.
    pub fn entries(&self) -> &[MergeEntry] {
        &self.entries
    }

    /// Whether the directory presents as empty to the union, counting
    /// whiteouts as absent.
    pub fn is_effectively_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_whiteout)
    }
}

/// Open-directory cursor over one merged snapshot. The snapshot is pinned
/// for the cursor's lifetime; concurrent mutations of the directory do
/// not disturb an iteration already in progress.
pub struct DirHandle {
    dir: Arc<MergedDir>,
    pos: usize,
}

impl DirHandle {
    pub fn new(dir: Arc<MergedDir>) -> Self {
        DirHandle { dir, pos: 0 }
    }

    /// Version of the pinned snapshot.
    pub fn version(&self) -> u64 {
        self.dir.version()
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Next visible entry, skipping whiteout tombstones.
    pub fn next(&mut self) -> Option<MergeEntry> {
        while let Some(entry) = self.dir.entries.get(self.pos) {
            self.pos += 1;
            if !entry.is_whiteout {
                return Some(entry.clone());
            }
        }
        None
    }
}

impl UnionFs {
    /// Display inode number for a non-directory: the real inode, or the
    /// fsid mixed into the high bits when remapping is enabled.
    pub(crate) fn display_file_ino(&self, fsid: u64, ino: u64) -> u64 {
        if self.layers.config().remap_inodes {
            (fsid << FSID_SHIFT) | (ino & ((1u64 << FSID_SHIFT) - 1))
        } else {
            ino
        }
    }

    /// Open a merged-listing cursor for a directory entry.
    pub fn open_dir(&self, dir: &Arc<OverlayEntry>) -> Result<DirHandle> {
        Ok(DirHandle::new(self.get_merged_listing(dir)?))
    }

    /// The merged listing for `dir` at its current version, served from
    /// the cache when the cached snapshot is still current.
    pub fn get_merged_listing(&self, dir: &Arc<OverlayEntry>) -> Result<Arc<MergedDir>> {
        let version = dir.version();
        {
            let mut cache = self.dir_caches.lock();
            if let Some(cached) = cache.get(&dir.id) {
                if cached.version() == version {
                    return Ok(Arc::clone(cached));
                }
            }
        }
        // Build outside the cache lock; directory reads hit the stores.
        let merged = Arc::new(self.build_merged(dir, version)?);
        let mut cache = self.dir_caches.lock();
        // A concurrent mutation may have bumped the version while we read;
        // the stale build is still a valid snapshot for this caller, but
        // it must not shadow a newer cached one.
        match cache.get(&dir.id) {
            Some(cached) if cached.version() > version => {}
            _ => {
                cache.put(dir.id, Arc::clone(&merged));
            }
        }
        Ok(merged)
    }

    fn build_merged(&self, dir: &Arc<OverlayEntry>, version: u64) -> Result<MergedDir> {
        let (upper_handle, lowers, opaque) = {
            let st = dir.state.read();
            (st.upper, st.lowers.clone(), st.opaque)
        };
        let at_root = Arc::ptr_eq(dir, &self.root);

        let mut entries: Vec<MergeEntry> = Vec::new();
        let mut by_name: BTreeMap<String, usize> = BTreeMap::new();

        if let Some(handle) = upper_handle {
            let upper = &self.layers.upper().store;
            for raw in upper.read_dir(handle, 0)? {
                if raw.name == "." || raw.name == ".." {
                    continue;
                }
                if at_root && Self::is_internal_name(&raw.name) {
                    continue;
                }
                let whiteout =
                    raw.kind == EntryKind::Special && is_whiteout(&upper.get_attrs(
                        upper.lookup(handle, &raw.name)?,
                    )?);
                let idx = entries.len();
                entries.push(MergeEntry {
                    name: raw.name.clone(),
                    kind: raw.kind,
                    real_ino: raw.ino,
                    ino: raw.ino,
                    layer: 0,
                    is_upper: true,
                    is_whiteout: whiteout,
                });
                by_name.insert(raw.name, idx);
            }
        }

        if !opaque {
            for lref in &lowers {
                let layer = self.layers.layer(lref.layer);
                for raw in layer.store.read_dir(lref.handle, 0)? {
                    if raw.name == "." || raw.name == ".." {
                        continue;
                    }
                    if by_name.contains_key(&raw.name) {
                        continue;
                    }
                    // A lower layer that once served as an upper can carry
                    // whiteouts of its own; they hide deeper layers.
                    let whiteout = raw.kind == EntryKind::Special
                        && is_whiteout(&layer.store.get_attrs(
                            layer.store.lookup(lref.handle, &raw.name)?,
                        )?);
                    let idx = entries.len();
                    entries.push(MergeEntry {
                        name: raw.name.clone(),
                        kind: raw.kind,
                        real_ino: raw.ino,
                        ino: raw.ino,
                        layer: lref.layer,
                        is_upper: false,
                        is_whiteout: whiteout,
                    });
                    by_name.insert(raw.name, idx);
                }
                if self.dir_is_opaque(lref.layer, lref.handle) {
                    break;
                }
            }
        }

        self.assign_display_inos(dir, upper_handle, &mut entries)?;

        Ok(MergedDir { version, entries, by_name })
    }

    /// Stable display inode numbers. Directories hash their union path
    /// position so a merged directory keeps one number regardless of which
    /// layers contribute. Files show their real inode, except that copied-up
    /// children of an impure directory show their lower origin so the
    /// number survives copy-up.
    fn assign_display_inos(
        &self,
        dir: &Arc<OverlayEntry>,
        upper_handle: Option<Handle>,
        entries: &mut [MergeEntry],
    ) -> Result<()> {
        let impure = upper_handle.map(|h| self.dir_is_impure(h)).unwrap_or(false);
        let upper = &self.layers.upper().store;

        for entry in entries.iter_mut() {
            if entry.is_whiteout {
                continue;
            }
            if entry.kind == EntryKind::Directory {
                entry.ino = fxhash::hash64(&(dir.id, entry.name.as_str()));
                continue;
            }
            let mut ino = entry.real_ino;
            let mut fsid = self.layers.layer(entry.layer).fsid;
            if entry.is_upper && impure {
                if let Some(h) = upper_handle {
                    let child = upper.lookup(h, &entry.name)?;
                    if let Some(origin) = upper
                        .get_xattr(child, XATTR_ORIGIN)
                        .ok()
                        .flatten()
                        .as_deref()
                        .and_then(parse_origin_token)
                    {
                        fsid = origin.0;
                        ino = origin.1;
                    }
                }
            }
            entry.ino = self.display_file_ino(fsid, ino);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(names: &[(&str, bool)]) -> MergedDir {
        let mut entries = Vec::new();
        let mut by_name = BTreeMap::new();
        for (i, (name, wh)) in names.iter().enumerate() {
            entries.push(MergeEntry {
                name: name.to_string(),
                kind: EntryKind::File,
                real_ino: i as u64 + 2,
                ino: i as u64 + 2,
                layer: 1,
                is_upper: false,
                is_whiteout: *wh,
            });
            by_name.insert(name.to_string(), i);
        }
        MergedDir { version: 1, entries, by_name }
    }

    #[test]
    fn cursor_skips_whiteouts() {
        let dir = Arc::new(merged(&[("a", false), ("b", true), ("c", false)]));
        let mut cursor = DirHandle::new(dir);
        assert_eq!(cursor.next().unwrap().name, "a");
        assert_eq!(cursor.next().unwrap().name, "c");
        assert!(cursor.next().is_none());
    }

    #[test]
    fn cursor_seek_restarts_iteration() {
        let dir = Arc::new(merged(&[("a", false), ("b", false)]));
        let mut cursor = DirHandle::new(dir);
        assert_eq!(cursor.next().unwrap().name, "a");
        cursor.seek(0);
        assert_eq!(cursor.next().unwrap().name, "a");
    }

    #[test]
    fn whiteouts_do_not_count_toward_emptiness() {
        let dir = merged(&[("a", true), ("b", true)]);
        assert!(dir.is_effectively_empty());
        assert!(!merged(&[("a", false)]).is_effectively_empty());
    }
}
