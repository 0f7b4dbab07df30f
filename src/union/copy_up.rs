//! Copy-up of lower objects into the upper layer.
//!
//! A mutation of a lower-only entry first materializes it in the upper
//! layer. The new object is staged under a temporary name in the work
//! area and renamed into place only when fully populated, so readers of
//! the parent directory never observe a half-built object. Directories
//! are copied shallowly; children stay lower-only until touched.

use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::storage::{EntryKind, Handle, NewAttrs, RenameFlags, SetAttrs, XattrMode};
use crate::union::index::{index_name, origin_token, XATTR_NLINK, XATTR_ORIGIN};
use crate::union::types::{CopyUpStatus, OverlayEntry};
use crate::union::whiteout::is_whiteout;
use crate::union::UnionFs;

/// Marks an upper file as a metadata-only placeholder whose data still
/// lives in a lower layer.
pub(crate) const XATTR_METACOPY: &str = "strata.metacopy";

/// Reserved key prefix; marker xattrs are never propagated by copy-up.
const INTERNAL_XATTR_PREFIX: &str = "strata.";

impl UnionFs {
    /// Materialize `entry` in the upper layer. With metadata-only copy-up
    /// configured, regular files get a placeholder and keep their data in
    /// the lower layer until a data-touching mutation promotes them.
    pub fn copy_up(&self, entry: &Arc<OverlayEntry>) -> Result<CopyUpStatus> {
        let with_data = !self.layers.config().metacopy;
        self.copy_up_guarded(entry, with_data)
    }

    /// Materialize `entry` with its full data, promoting an existing
    /// metadata-only placeholder if there is one.
    pub fn copy_up_with_data(&self, entry: &Arc<OverlayEntry>) -> Result<CopyUpStatus> {
        self.copy_up_guarded(entry, true)
    }

    fn copy_up_guarded(&self, entry: &Arc<OverlayEntry>, with_data: bool) -> Result<CopyUpStatus> {
        let lock = self.entry_lock(entry.id);
        let _guard = lock.lock();
        self.copy_up_locked(entry, with_data)
    }

    /// Copy-up body. The caller must hold the entry's mutation lock;
    /// concurrent callers serialize there and all but the first take the
    /// already-materialized fast path.
    pub(crate) fn copy_up_locked(
        &self,
        entry: &Arc<OverlayEntry>,
        with_data: bool,
    ) -> Result<CopyUpStatus> {
        if entry.is_removed() {
            return Err(StrataError::StaleReference(entry.path()));
        }
        {
            let st = entry.state.read();
            if let Some(upper) = st.upper {
                if st.metacopy && with_data {
                    drop(st);
                    return self.promote_metacopy(entry, upper);
                }
                return Ok(CopyUpStatus::Full);
            }
        }

        // Ancestors first. Lock order is child then parent, so walking up
        // never deadlocks against another copy-up descending the same path.
        let parent = entry.parent().ok_or_else(|| {
            StrataError::Inconsistent("root directory cannot be lower-only".into())
        })?;
        if parent.upper_handle().is_none() {
            let plock = self.entry_lock(parent.id);
            let _pguard = plock.lock();
            self.copy_up_locked(&parent, false)?;
        }
        let parent_upper = parent.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("parent lost its upper counterpart mid-copy-up".into())
        })?;

        let lower = entry.topmost_lower().ok_or_else(|| {
            StrataError::Inconsistent("copy-up target has no lower source".into())
        })?;
        let src_layer = self.layers.layer(lower.layer);
        let src_attrs = src_layer.store.get_attrs(lower.handle)?;
        let upper = &self.layers.upper().store;
        let degraded = !upper.supports_xattrs();
        let name = entry.name();

        // Another hard link of this origin may already be materialized;
        // reuse it so all union links share one upper inode.
        if !degraded
            && self.layers.config().index
            && entry.kind() == EntryKind::File
            && src_attrs.nlink > 1
        {
            if let Some(index) = self.lookup_index(src_layer.fsid, src_attrs.ino)? {
                self.place_over_whiteout(index, parent_upper, &name)?;
                let metacopy = upper.get_xattr(index, XATTR_METACOPY)?.is_some();
                {
                    let mut st = entry.state.write();
                    st.upper = Some(index);
                    st.metacopy = metacopy;
                    st.origin = Some((src_layer.fsid, src_attrs.ino));
                }
                parent.bump_version();
                self.mark_impure(&parent);
                tracing::debug!(entry = %entry.path(), "copy-up reused indexed upper link");
                return Ok(CopyUpStatus::Full);
            }
        }

        let want_data = with_data || degraded || entry.kind() != EntryKind::File;
        let tmp = self.temp_name();
        let staged = self.stage_object(&lower, &src_attrs, &tmp, want_data)?;

        let result = self.finish_copy_up(
            entry,
            parent_upper,
            &name,
            &tmp,
            staged,
            &src_attrs,
            src_layer.fsid,
            want_data,
            degraded,
        );
        if result.is_err() {
            if let Err(e) = upper.unlink(self.workdir, &tmp) {
                tracing::warn!(temp = tmp, "stale copy-up temp left in work area: {e}");
            }
        }
        result?;

        {
            let mut st = entry.state.write();
            st.upper = Some(staged);
            st.metacopy = entry.kind() == EntryKind::File && !want_data;
            st.origin = if degraded { None } else { Some((src_layer.fsid, src_attrs.ino)) };
        }
        parent.bump_version();
        if !degraded {
            self.mark_impure(&parent);
        }
        tracing::debug!(
            entry = %entry.path(),
            data = want_data,
            degraded,
            "copied up"
        );
        Ok(if degraded { CopyUpStatus::MetadataDegraded } else { CopyUpStatus::Full })
    }

    /// Create the staged object under `tmp` in the work area and populate
    /// its content. The staged handle stays valid across the final rename.
    fn stage_object(
        &self,
        lower: &crate::union::types::LayerRef,
        src_attrs: &crate::storage::Attrs,
        tmp: &str,
        want_data: bool,
    ) -> Result<Handle> {
        let src_store = &self.layers.layer(lower.layer).store;
        let upper = &self.layers.upper().store;
        let attrs = NewAttrs {
            kind: src_attrs.kind,
            mode: src_attrs.mode,
            uid: src_attrs.uid,
            gid: src_attrs.gid,
            rdev: src_attrs.rdev,
        };
        let staged = match src_attrs.kind {
            EntryKind::Directory => upper.mkdir(self.workdir, tmp, attrs)?,
            EntryKind::Symlink => {
                let target = src_store.read_symlink(lower.handle)?;
                upper.symlink(self.workdir, tmp, &target)?
            }
            EntryKind::Special => upper.mknod(self.workdir, tmp, attrs)?,
            EntryKind::File => {
                let h = upper.create(self.workdir, tmp, attrs)?;
                if want_data {
                    let data = src_store.read_data(lower.handle)?;
                    upper.write_data(h, &data)?;
                }
                h
            }
        };
        upper.set_attrs(staged, SetAttrs { mtime: Some(src_attrs.mtime), ..SetAttrs::default() })?;
        Ok(staged)
    }

    /// Marker persistence, index registration, and the final rename into
    /// the parent directory. Runs against the staged temp; any error makes
    /// the caller discard the temp.
    #[allow(clippy::too_many_arguments)]
    fn finish_copy_up(
        &self,
        entry: &Arc<OverlayEntry>,
        parent_upper: Handle,
        name: &str,
        tmp: &str,
        staged: Handle,
        src_attrs: &crate::storage::Attrs,
        fsid: u64,
        want_data: bool,
        degraded: bool,
    ) -> Result<()> {
        let upper = &self.layers.upper().store;

        if !degraded {
            self.copy_foreign_xattrs(entry, staged)?;
            upper.set_xattr(
                staged,
                XATTR_ORIGIN,
                &origin_token(fsid, src_attrs.ino),
                XattrMode::Overwrite,
            )?;
            if entry.kind() == EntryKind::File && !want_data {
                upper.set_xattr(staged, XATTR_METACOPY, b"y", XattrMode::Overwrite)?;
            }
            if self.layers.config().index
                && entry.kind() == EntryKind::File
                && src_attrs.nlink > 1
            {
                upper.hardlink(staged, self.indexdir, &index_name(fsid, src_attrs.ino))?;
                upper.set_xattr(
                    staged,
                    XATTR_NLINK,
                    src_attrs.nlink.to_string().as_bytes(),
                    XattrMode::Overwrite,
                )?;
            }
        }

        self.place_staged(tmp, name, parent_upper)
    }

    /// Rename a staged work-area object to `name` under `parent_upper`,
    /// displacing a whiteout at that name atomically if one is present.
    pub(crate) fn place_staged(
        &self,
        tmp: &str,
        name: &str,
        parent_upper: Handle,
    ) -> Result<()> {
        let upper = &self.layers.upper().store;
        match upper.lookup(parent_upper, name) {
            Ok(existing) => {
                if !is_whiteout(&upper.get_attrs(existing)?) {
                    return Err(StrataError::Inconsistent(format!(
                        "copy-up destination {name:?} occupied by a live upper object"
                    )));
                }
                upper.rename(self.workdir, tmp, parent_upper, name, RenameFlags::Exchange)?;
                // The displaced tombstone now sits at the temp name.
                upper.unlink(self.workdir, tmp)
            }
            Err(StrataError::NotFound) => {
                upper.rename(self.workdir, tmp, parent_upper, name, RenameFlags::None)
            }
            Err(e) => Err(e),
        }
    }

    /// Hard link `existing` to `name` under `dir`, displacing a whiteout
    /// at that name atomically if one is present.
    pub(crate) fn place_over_whiteout(
        &self,
        existing: Handle,
        dir: Handle,
        name: &str,
    ) -> Result<()> {
        let upper = &self.layers.upper().store;
        match upper.hardlink(existing, dir, name) {
            Ok(()) => Ok(()),
            Err(StrataError::AlreadyExists) => {
                let occupant = upper.lookup(dir, name)?;
                if !is_whiteout(&upper.get_attrs(occupant)?) {
                    return Err(StrataError::AlreadyExists);
                }
                let tmp = self.temp_name();
                upper.hardlink(existing, self.workdir, &tmp)?;
                upper.rename(self.workdir, &tmp, dir, name, RenameFlags::Exchange)?;
                upper.unlink(self.workdir, &tmp)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy the source object's non-marker xattrs onto the staged object.
    fn copy_foreign_xattrs(&self, entry: &Arc<OverlayEntry>, staged: Handle) -> Result<()> {
        let Some(lower) = entry.topmost_lower() else {
            return Ok(());
        };
        let src_store = &self.layers.layer(lower.layer).store;
        let upper = &self.layers.upper().store;
        for key in src_store.list_xattrs(lower.handle)? {
            if key.starts_with(INTERNAL_XATTR_PREFIX) {
                continue;
            }
            if let Some(value) = src_store.get_xattr(lower.handle, &key)? {
                upper.set_xattr(staged, &key, &value, XattrMode::Overwrite)?;
            }
        }
        Ok(())
    }

    /// Pull lower data into a metadata-only upper placeholder and clear
    /// the placeholder marker.
    fn promote_metacopy(&self, entry: &Arc<OverlayEntry>, upper_handle: Handle) -> Result<CopyUpStatus> {
        let lower = entry.lowest_lower().ok_or_else(|| {
            StrataError::Inconsistent("metadata-only entry lost its lower data source".into())
        })?;
        let data = self.layers.layer(lower.layer).store.read_data(lower.handle)?;
        let upper = &self.layers.upper().store;
        upper.write_data(upper_handle, &data)?;
        upper.remove_xattr(upper_handle, XATTR_METACOPY)?;
        entry.state.write().metacopy = false;
        tracing::debug!(entry = %entry.path(), "metadata-only placeholder promoted");
        Ok(CopyUpStatus::Full)
    }
}
