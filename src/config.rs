use serde::{Deserialize, Serialize};

/// Session configuration for a union mount.
///
/// Carried by value into [`crate::union::LayerStack::new`] and passed by
/// reference into every component that needs a tunable; there is no
/// process-wide mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum length of a recorded redirect path. Renames whose redirect
    /// would exceed this are rejected with `CrossLayerUnsupported` so the
    /// caller can fall back to a user-level copy-and-delete.
    pub max_redirect_len: usize,

    /// Share a single tombstone object between whiteouts via hard links.
    /// Sharing is disabled for the rest of the session once the tombstone
    /// reaches the upper store's maximum link count.
    pub shared_whiteouts: bool,

    /// Mix each layer's filesystem id into display inode numbers of
    /// non-directories, avoiding collisions between layers.
    pub remap_inodes: bool,

    /// Maintain the index directory for multiply-linked copied-up files.
    /// Required for correct union link counts across copy-up.
    pub index: bool,

    /// Allow metadata-only copy-up: a mutated file's attributes are
    /// materialized in the upper layer while its data still defers to the
    /// lower origin until data is actually needed.
    pub metacopy: bool,

    /// Record redirects on renamed merge-visible directories. When disabled,
    /// such renames fail with `CrossLayerUnsupported`.
    pub redirect_dir: bool,

    /// Keep stale index entries discoverable for exported file handles:
    /// a zeroed index entry is whited-out instead of deleted, so stale
    /// handle lookups fail safely rather than resolving to reused storage.
    pub nfs_export: bool,

    /// Number of directory merge caches retained. A cache is rebuilt
    /// whenever its directory's version counter moves, so this only bounds
    /// memory, never correctness.
    pub dir_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_redirect_len: 4096,
            shared_whiteouts: true,
            remap_inodes: false,
            index: true,
            metacopy: false,
            redirect_dir: true,
            nfs_export: false,
            dir_cache_capacity: 1024,
        }
    }
}
