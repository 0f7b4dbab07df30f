use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::storage::{EntryKind, Handle};

/// Classification of one namespace path, derived from an entry's layer
/// presence and never stored.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PathType(u8);

impl PathType {
    /// The entry has a real counterpart in the upper layer.
    pub const HAS_UPPER: PathType = PathType(0b001);
    /// More than one layer contributes to the entry's identity.
    pub const IS_MERGE: PathType = PathType(0b010);
    /// The upper counterpart carries a stable cross-layer identity marker.
    pub const HAS_ORIGIN: PathType = PathType(0b100);

    pub fn empty() -> PathType {
        PathType(0)
    }

    pub fn contains(self, other: PathType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PathType {
    type Output = PathType;
    fn bitor(self, rhs: PathType) -> PathType {
        PathType(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PathType {
    fn bitor_assign(&mut self, rhs: PathType) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for PathType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(PathType::HAS_UPPER) {
            parts.push("HAS_UPPER");
        }
        if self.contains(PathType::IS_MERGE) {
            parts.push("IS_MERGE");
        }
        if self.contains(PathType::HAS_ORIGIN) {
            parts.push("HAS_ORIGIN");
        }
        write!(f, "PathType({})", parts.join("|"))
    }
}

/// Explicit outcome of a copy-up: either every marker was persisted, or the
/// upper store lacks xattr support and the engine fell back to a full data
/// copy without origin/redirect/opaque marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyUpStatus {
    Full,
    MetadataDegraded,
}

/// Reference to one real object contributed by a single layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerRef {
    pub layer: usize,
    pub handle: Handle,
}

/// Mutable per-path union state, guarded by the entry's state lock.
pub(crate) struct EntryState {
    pub name: String,
    pub parent: Option<Arc<OverlayEntry>>,
    /// Real counterpart in the upper layer, if materialized.
    pub upper: Option<Handle>,
    /// Contributing lower layers from uppermost to lowest. The lowest is
    /// used for data resolution of metadata-only entries.
    pub lowers: Vec<LayerRef>,
    pub opaque: bool,
    pub redirect: Option<String>,
    /// Upper counterpart is a metadata-only placeholder deferring to lower
    /// data.
    pub metacopy: bool,
    /// Cross-layer identity of the lower origin as `(fsid, real ino)`.
    pub origin: Option<(u64, u64)>,
    /// Set when the namespace entry was unlinked or renamed over; any
    /// further use of the entry is a stale reference.
    pub removed: bool,
    /// Parent directory version this entry was resolved against.
    pub parent_version: u64,
}

/// The union-view identity for one namespace path.
///
/// Entries are shared out as `Arc`s; parents are held strongly, children
/// weakly, so a dropped subtree unwinds without cycles. The directory
/// version counter is incremented by every mutation of the directory's
/// upper real entry and is the sole trigger for merge-cache invalidation.
pub struct OverlayEntry {
    pub(crate) id: u64,
    pub(crate) kind: EntryKind,
    pub(crate) state: RwLock<EntryState>,
    pub(crate) version: AtomicU64,
    pub(crate) children: Mutex<HashMap<String, Weak<OverlayEntry>>>,
}

impl OverlayEntry {
    pub(crate) fn new(id: u64, kind: EntryKind, state: EntryState) -> Arc<Self> {
        Arc::new(OverlayEntry {
            id,
            kind,
            state: RwLock::new(state),
            version: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub(crate) fn parent(&self) -> Option<Arc<OverlayEntry>> {
        self.state.read().parent.clone()
    }

    /// Current directory version. Monotonic; only incremented while the
    /// directory's mutation lock is held.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn upper_handle(&self) -> Option<Handle> {
        self.state.read().upper
    }

    pub(crate) fn topmost_lower(&self) -> Option<LayerRef> {
        self.state.read().lowers.first().copied()
    }

    pub(crate) fn lowest_lower(&self) -> Option<LayerRef> {
        self.state.read().lowers.last().copied()
    }

    pub(crate) fn has_lower(&self) -> bool {
        !self.state.read().lowers.is_empty()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.read().removed
    }

    pub(crate) fn cached_child(&self, name: &str) -> Option<Arc<OverlayEntry>> {
        self.children.lock().get(name).and_then(Weak::upgrade)
    }

    pub(crate) fn cache_child(&self, name: &str, child: &Arc<OverlayEntry>) {
        self.children.lock().insert(name.to_string(), Arc::downgrade(child));
    }

    pub(crate) fn forget_child(&self, name: &str) {
        self.children.lock().remove(name);
    }

    /// Full path of this entry in the merged namespace, `/` for the root.
    /// Walks parent links upward; the root is the terminating sentinel.
    pub fn path(self: &Arc<Self>) -> String {
        let mut segments = Vec::new();
        let mut current = Arc::clone(self);
        loop {
            let (name, parent) = {
                let st = current.state.read();
                (st.name.clone(), st.parent.clone())
            };
            match parent {
                Some(p) => {
                    segments.push(name);
                    current = p;
                }
                None => break,
            }
        }
        if segments.is_empty() {
            "/".to_string()
        } else {
            segments.reverse();
            format!("/{}", segments.join("/"))
        }
    }
}

impl std::fmt::Debug for OverlayEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read();
        f.debug_struct("OverlayEntry")
            .field("id", &self.id)
            .field("name", &st.name)
            .field("kind", &self.kind)
            .field("upper", &st.upper)
            .field("lowers", &st.lowers.len())
            .field("removed", &st.removed)
            .finish()
    }
}

/// Compute the path type of an entry. Pure function of the entry's layer
/// stack and flags; performs no I/O.
pub fn classify(entry: &OverlayEntry) -> PathType {
    let st = entry.state.read();
    let mut t = PathType::empty();
    match st.upper {
        None => {
            if st.lowers.len() > 1 {
                t |= PathType::IS_MERGE;
            }
        }
        Some(_) => {
            t |= PathType::HAS_UPPER;
            let merged = if entry.kind == EntryKind::Directory {
                !st.lowers.is_empty()
            } else {
                st.metacopy
            };
            if merged {
                t |= PathType::IS_MERGE;
            }
            if st.origin.is_some() {
                t |= PathType::HAS_ORIGIN;
            }
        }
    }
    t
}
