//! Whiteout and opacity handling.
//!
//! A whiteout is a tombstone object in the upper layer that hides a
//! same-named lower-layer object: a `Special` node with `rdev == 0`. An
//! opaque directory is an upper directory marked to not merge with its
//! lower counterpart's children.
//!
//! By default all whiteouts share one tombstone object via hard links; once
//! the tombstone reaches the upper store's maximum link count, sharing is
//! disabled for the remainder of the session and each new whiteout becomes
//! a fresh tombstone.

use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::storage::{Attrs, EntryKind, Handle, NewAttrs, XattrMode};
use crate::union::types::OverlayEntry;
use crate::union::UnionFs;

/// Marks an upper directory as not merging with its lower counterpart.
pub(crate) const XATTR_OPAQUE: &str = "strata.opaque";

/// Marks a pure-upper directory that contains copied-up children carrying
/// an origin, for correct display inode numbers.
pub(crate) const XATTR_IMPURE: &str = "strata.impure";

/// Session state of the shared whiteout tombstone.
pub(crate) struct WhiteoutState {
    pub tombstone: Option<Handle>,
    pub sharing_disabled: bool,
}

impl WhiteoutState {
    pub fn new() -> Self {
        WhiteoutState { tombstone: None, sharing_disabled: false }
    }
}

/// A whiteout tombstone is a character-device-like node at device 0.
pub(crate) fn is_whiteout(attrs: &Attrs) -> bool {
    attrs.kind == EntryKind::Special && attrs.rdev == 0
}

impl UnionFs {
    /// Create a whiteout at `name` inside the real upper directory `dir`.
    ///
    /// The name must be vacant in `dir`; callers that replace an existing
    /// object atomically create the whiteout in the work area and
    /// exchange-rename it into place instead.
    pub(crate) fn create_whiteout(&self, dir: Handle, name: &str) -> Result<Handle> {
        let upper = &self.layers.upper().store;

        if self.layers.config().shared_whiteouts {
            let mut state = self.whiteout.lock();
            if !state.sharing_disabled {
                let tombstone = match state.tombstone {
                    Some(t) => t,
                    None => {
                        let name = self.temp_name();
                        let t = upper.mknod(self.workdir, &name, NewAttrs::special(0, 0))?;
                        state.tombstone = Some(t);
                        t
                    }
                };
                if upper.get_attrs(tombstone)?.nlink < upper.max_links() {
                    match upper.hardlink(tombstone, dir, name) {
                        Ok(()) => return Ok(tombstone),
                        Err(StrataError::AlreadyExists) => {
                            return Err(StrataError::AlreadyExists)
                        }
                        Err(e) => {
                            tracing::warn!(
                                "shared whiteout link failed ({e}); disabling sharing"
                            );
                            state.sharing_disabled = true;
                        }
                    }
                } else {
                    tracing::warn!(
                        "whiteout tombstone reached the upper store's max link count; \
                         disabling sharing for this session"
                    );
                    state.sharing_disabled = true;
                }
            }
        }

        upper.mknod(dir, name, NewAttrs::special(0, 0))
    }

    /// Mark an upper directory opaque. The caller decides whether failure
    /// is tolerable; this surfaces `MetadataUnsupported` as-is.
    pub(crate) fn set_opaque(&self, handle: Handle) -> Result<()> {
        self.layers
            .upper()
            .store
            .set_xattr(handle, XATTR_OPAQUE, b"y", XattrMode::Overwrite)
    }

    /// Whether a real directory in `layer` carries the opaque marker.
    pub(crate) fn dir_is_opaque(&self, layer: usize, handle: Handle) -> bool {
        match self.layers.layer(layer).store.get_xattr(handle, XATTR_OPAQUE) {
            Ok(Some(v)) => v == b"y",
            _ => false,
        }
    }

    /// Mark a directory impure: it now holds copied-up children that carry
    /// an origin. Best effort; an upper store without xattr support keeps
    /// working with upper-local inode numbers instead.
    pub(crate) fn mark_impure(&self, dir: &Arc<OverlayEntry>) {
        let Some(handle) = dir.upper_handle() else {
            return;
        };
        if let Err(e) = self.layers.upper().store.set_xattr(
            handle,
            XATTR_IMPURE,
            b"y",
            XattrMode::Overwrite,
        ) {
            tracing::debug!(dir = %dir.path(), "impure marking skipped: {e}");
        }
    }

    pub(crate) fn dir_is_impure(&self, handle: Handle) -> bool {
        match self.layers.upper().store.get_xattr(handle, XATTR_IMPURE) {
            Ok(Some(v)) => v == b"y",
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(kind: EntryKind, rdev: u64) -> Attrs {
        Attrs {
            kind,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 1,
            rdev,
            ino: 9,
            mtime: 0,
            ctime: 0,
        }
    }

    #[test]
    fn whiteout_is_special_at_device_zero() {
        assert!(is_whiteout(&attrs(EntryKind::Special, 0)));
        assert!(!is_whiteout(&attrs(EntryKind::Special, 5)));
        assert!(!is_whiteout(&attrs(EntryKind::File, 0)));
        assert!(!is_whiteout(&attrs(EntryKind::Directory, 0)));
    }
}
