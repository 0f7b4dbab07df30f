//! Redirect records.
//!
//! A rename that moves a merge-visible or lower-only entry records the
//! entry's pre-rename lower location on the upper object, so later lookups
//! of the new name can still find the lower origin. A same-directory rename
//! of an origin with a single hard link stores just the old name; every
//! other case stores the full old path from the layer root.

use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::storage::{Handle, XattrMode};
use crate::union::types::OverlayEntry;
use crate::union::UnionFs;

pub(crate) const XATTR_REDIRECT: &str = "strata.redirect";

/// Full path of `name` under `parent` relative to the layer root, built by
/// walking parent links upward to the root sentinel.
pub(crate) fn build_relative_path(parent: &Arc<OverlayEntry>, name: &str) -> String {
    let base = parent.path();
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

impl UnionFs {
    /// Compute the redirect value for an entry being moved away from
    /// `old_parent/old_name`. Exceeding the configured maximum length is a
    /// `CrossLayerUnsupported` error: the caller falls back to a
    /// non-atomic copy-based move.
    pub(crate) fn compute_redirect(
        &self,
        entry: &Arc<OverlayEntry>,
        old_parent: &Arc<OverlayEntry>,
        old_name: &str,
        same_dir: bool,
    ) -> Result<String> {
        if same_dir {
            if let Some(lower) = entry.topmost_lower() {
                let attrs = self.layers.layer(lower.layer).store.get_attrs(lower.handle)?;
                if attrs.nlink == 1 {
                    return Ok(old_name.to_string());
                }
            }
        }
        self.checked_redirect_path(old_parent, old_name)
    }

    /// Absolute redirect path for `name` under `parent`, bounded by the
    /// configured maximum.
    pub(crate) fn checked_redirect_path(
        &self,
        parent: &Arc<OverlayEntry>,
        name: &str,
    ) -> Result<String> {
        let path = build_relative_path(parent, name);
        let max = self.layers.config().max_redirect_len;
        if path.len() > max {
            return Err(StrataError::CrossLayerUnsupported(format!(
                "redirect path exceeds {max} bytes"
            )));
        }
        Ok(path)
    }

    /// Persist a redirect on the entry's upper object and mirror it into
    /// the in-memory state.
    pub(crate) fn set_redirect(&self, entry: &Arc<OverlayEntry>, value: &str) -> Result<()> {
        if entry.is_dir() && !self.layers.config().redirect_dir {
            return Err(StrataError::CrossLayerUnsupported(
                "directory redirects disabled by configuration".into(),
            ));
        }
        let upper = entry.upper_handle().ok_or_else(|| {
            StrataError::Inconsistent("redirect target has no upper counterpart".into())
        })?;
        self.layers.upper().store.set_xattr(
            upper,
            XATTR_REDIRECT,
            value.as_bytes(),
            XattrMode::Overwrite,
        )?;
        entry.state.write().redirect = Some(value.to_string());
        tracing::debug!(entry = %entry.path(), redirect = value, "redirect recorded");
        Ok(())
    }

    /// Read the redirect recorded on a real object, if any.
    pub(crate) fn redirect_of(&self, layer: usize, handle: Handle) -> Option<String> {
        match self.layers.layer(layer).store.get_xattr(handle, XATTR_REDIRECT) {
            Ok(Some(v)) => String::from_utf8(v).ok(),
            _ => None,
        }
    }
}
