//! Persistent link-count reconciliation.
//!
//! A lower file with multiple hard links gets an entry in the index
//! directory when first copied up, named by a digest of its origin
//! identity. The index entry is a hard link to the upper object and
//! carries the persisted union link count, so `nlink` stays correct no
//! matter which of the links was copied up or removed first.

use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::error::{Result, StrataError};
use crate::storage::{Handle, XattrMode};
use crate::union::types::OverlayEntry;
use crate::union::whiteout::is_whiteout;
use crate::union::UnionFs;

/// Opaque cross-layer identity token: `(fsid, real ino)` of the lower
/// origin, little-endian.
pub(crate) const XATTR_ORIGIN: &str = "strata.origin";

/// Persisted union link count, on index entries only.
pub(crate) const XATTR_NLINK: &str = "strata.nlink";

pub(crate) fn origin_token(fsid: u64, ino: u64) -> [u8; 16] {
    let mut token = [0u8; 16];
    token[..8].copy_from_slice(&fsid.to_le_bytes());
    token[8..].copy_from_slice(&ino.to_le_bytes());
    token
}

pub(crate) fn parse_origin_token(bytes: &[u8]) -> Option<(u64, u64)> {
    if bytes.len() != 16 {
        return None;
    }
    let fsid = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    let ino = u64::from_le_bytes(bytes[8..].try_into().ok()?);
    Some((fsid, ino))
}

/// Stable name of the index entry for one lower origin.
pub(crate) fn index_name(fsid: u64, ino: u64) -> String {
    format!("{:016x}", fxhash::hash64(&origin_token(fsid, ino)))
}

/// In-flight link-count mutation. Holds the entry's mutation lock from
/// `begin` until drop; `commit` applies the caller's delta to the
/// persisted count and retires the index entry when it reaches zero.
pub struct LinkGuard<'a> {
    fs: &'a UnionFs,
    entry: Arc<OverlayEntry>,
    _lock: ArcMutexGuard<RawMutex, ()>,
    origin: Option<(u64, u64)>,
    done: bool,
}

impl LinkGuard<'_> {
    /// The entry this guard serializes.
    pub fn entry(&self) -> &Arc<OverlayEntry> {
        &self.entry
    }

    /// Apply the completed mutation's link delta. A resulting count of
    /// zero deletes the index entry, or whites it out when export
    /// stability is configured so stale handle lookups fail safely.
    pub fn commit(mut self, delta: i64) -> Result<()> {
        self.done = true;
        let Some((fsid, ino)) = self.origin else {
            return Ok(());
        };
        let Some(index) = self.fs.lookup_index(fsid, ino)? else {
            return Ok(());
        };
        let count = self.fs.read_index_nlink(index)? as i64 + delta;
        if count < 0 {
            return Err(StrataError::Inconsistent(
                "union link count would drop below zero".into(),
            ));
        }
        if count == 0 {
            self.fs.drop_index_entry(fsid, ino)
        } else {
            self.fs.write_index_nlink(index, count as u64)
        }
    }
}

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(
                entry = %self.entry.path(),
                "link mutation released without commit"
            );
        }
    }
}

impl UnionFs {
    /// Start a link-count mutation on `entry`.
    ///
    /// Locks the entry; if persisted-index tracking applies and the entry
    /// has no upper materialization yet, a copy-up is forced first so an
    /// index entry exists to hold the count. This ordering is what keeps
    /// the union link count from going negative when a whiteout removes
    /// one of several lower hard links before any was copied up.
    pub fn begin_link_mutation(&self, entry: &Arc<OverlayEntry>) -> Result<LinkGuard<'_>> {
        let lock = self.entry_lock(entry.id);
        let guard = Mutex::lock_arc(&lock);
        if entry.is_removed() {
            return Err(StrataError::StaleReference(entry.path()));
        }

        let tracked = self.entry_needs_index(entry)?;
        if tracked && entry.upper_handle().is_none() {
            self.copy_up_locked(entry, false)?;
        }
        let origin = if tracked { entry.state.read().origin } else { None };

        Ok(LinkGuard { fs: self, entry: Arc::clone(entry), _lock: guard, origin, done: false })
    }

    /// Whether link mutations of this entry must go through the persisted
    /// index: non-directories whose lower origin has multiple hard links.
    pub(crate) fn entry_needs_index(&self, entry: &Arc<OverlayEntry>) -> Result<bool> {
        if !self.layers.config().index || entry.is_dir() {
            return Ok(false);
        }
        if let Some((fsid, ino)) = entry.state.read().origin {
            return Ok(self.lookup_index(fsid, ino)?.is_some());
        }
        if let Some(lower) = entry.topmost_lower() {
            let attrs = self.layers.layer(lower.layer).store.get_attrs(lower.handle)?;
            return Ok(attrs.nlink > 1);
        }
        Ok(false)
    }

    /// Find the live index entry for an origin, ignoring whited-out ones.
    pub(crate) fn lookup_index(&self, fsid: u64, ino: u64) -> Result<Option<Handle>> {
        let upper = &self.layers.upper().store;
        match upper.lookup(self.indexdir, &index_name(fsid, ino)) {
            Ok(handle) => {
                if is_whiteout(&upper.get_attrs(handle)?) {
                    Ok(None)
                } else {
                    Ok(Some(handle))
                }
            }
            Err(StrataError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn read_index_nlink(&self, index: Handle) -> Result<u64> {
        let value = self
            .layers
            .upper()
            .store
            .get_xattr(index, XATTR_NLINK)?
            .ok_or_else(|| {
                StrataError::Inconsistent("index entry missing persisted link count".into())
            })?;
        std::str::from_utf8(&value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                StrataError::Inconsistent("index entry holds malformed link count".into())
            })
    }

    pub(crate) fn write_index_nlink(&self, index: Handle, count: u64) -> Result<()> {
        self.layers.upper().store.set_xattr(
            index,
            XATTR_NLINK,
            count.to_string().as_bytes(),
            XattrMode::Overwrite,
        )
    }

    /// Retire an index entry whose union link count reached zero.
    fn drop_index_entry(&self, fsid: u64, ino: u64) -> Result<()> {
        let upper = &self.layers.upper().store;
        let name = index_name(fsid, ino);
        upper.unlink(self.indexdir, &name)?;
        if self.layers.config().nfs_export {
            self.create_whiteout(self.indexdir, &name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_token_roundtrip() {
        let token = origin_token(3, 0xdead_beef);
        assert_eq!(parse_origin_token(&token), Some((3, 0xdead_beef)));
        assert_eq!(parse_origin_token(&token[..8]), None);
    }

    #[test]
    fn index_names_are_stable_and_distinct() {
        assert_eq!(index_name(1, 42), index_name(1, 42));
        assert_ne!(index_name(1, 42), index_name(2, 42));
        assert_ne!(index_name(1, 42), index_name(1, 43));
        assert_eq!(index_name(1, 42).len(), 16);
    }
}
