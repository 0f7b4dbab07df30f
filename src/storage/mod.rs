//! The per-layer storage collaborator interface.
//!
//! The union engine never touches bytes or directories directly; every
//! primitive operation goes through a [`Storage`] implementation, one per
//! layer. Lower-layer stores are expected to reject mutation.

pub mod memory;

pub use memory::MemStorage;

use crate::error::Result;

/// Opaque reference to one real object inside a single layer's store.
///
/// Handles are only meaningful to the store that issued them and must stay
/// stable for the lifetime of the object they name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// The closed set of entry kinds the engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Device-like objects. A `Special` with `rdev == 0` in an upper layer
    /// is a whiteout tombstone.
    Special,
}

/// Attributes of a real object as reported by its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attrs {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u64,
    /// Real inode number within the issuing store.
    pub ino: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// Attributes supplied when creating a new object.
#[derive(Debug, Clone, Copy)]
pub struct NewAttrs {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
}

impl NewAttrs {
    pub fn file(mode: u32) -> Self {
        NewAttrs { kind: EntryKind::File, mode, uid: 0, gid: 0, rdev: 0 }
    }

    pub fn directory(mode: u32) -> Self {
        NewAttrs { kind: EntryKind::Directory, mode, uid: 0, gid: 0, rdev: 0 }
    }

    pub fn special(mode: u32, rdev: u64) -> Self {
        NewAttrs { kind: EntryKind::Special, mode, uid: 0, gid: 0, rdev }
    }
}

/// Partial attribute update; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameFlags {
    None,
    /// Atomically swap the two names; both must exist.
    Exchange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrMode {
    CreateOnly,
    Overwrite,
}

/// One directory entry as read from a single layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Real inode number within the issuing store.
    pub ino: u64,
}

/// Primitive capability set implemented by the underlying per-layer store.
///
/// All operations are blocking; errors are surfaced through the crate error
/// type with `Io` wrapping store-specific failures. Implementations must be
/// safe to call from multiple threads.
pub trait Storage: Send + Sync {
    fn root(&self) -> Handle;

    fn lookup(&self, parent: Handle, name: &str) -> Result<Handle>;

    fn create(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle>;
    fn mkdir(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle>;
    fn mknod(&self, parent: Handle, name: &str, attrs: NewAttrs) -> Result<Handle>;
    fn symlink(&self, parent: Handle, name: &str, target: &str) -> Result<Handle>;
    fn hardlink(&self, existing: Handle, parent: Handle, name: &str) -> Result<()>;

    fn unlink(&self, parent: Handle, name: &str) -> Result<()>;
    fn rmdir(&self, parent: Handle, name: &str) -> Result<()>;
    fn rename(
        &self,
        old_parent: Handle,
        old_name: &str,
        new_parent: Handle,
        new_name: &str,
        flags: RenameFlags,
    ) -> Result<()>;

    fn get_attrs(&self, handle: Handle) -> Result<Attrs>;
    fn set_attrs(&self, handle: Handle, attrs: SetAttrs) -> Result<()>;

    fn get_xattr(&self, handle: Handle, key: &str) -> Result<Option<Vec<u8>>>;
    fn set_xattr(&self, handle: Handle, key: &str, value: &[u8], mode: XattrMode) -> Result<()>;
    fn remove_xattr(&self, handle: Handle, key: &str) -> Result<()>;
    fn list_xattrs(&self, handle: Handle) -> Result<Vec<String>>;

    /// Read directory entries starting at `offset` entries in. The listing
    /// is finite and restartable; `.` and `..` are never emitted.
    fn read_dir(&self, handle: Handle, offset: usize) -> Result<Vec<DirEntry>>;

    /// Whole-object data transfer, used by copy-up to move bytes between
    /// layers. Byte-level I/O through the union view itself is out of scope.
    fn read_data(&self, handle: Handle) -> Result<Vec<u8>>;
    fn write_data(&self, handle: Handle, data: &[u8]) -> Result<()>;

    fn read_symlink(&self, handle: Handle) -> Result<String>;

    /// Whether this store persists extended attributes. When the upper
    /// store returns `false`, opacity/redirect/origin marking degrades per
    /// the copy-up engine's rules instead of silently misbehaving.
    fn supports_xattrs(&self) -> bool {
        true
    }

    /// Per-store maximum hard link count, consulted before extending the
    /// shared whiteout tombstone.
    fn max_links(&self) -> u32 {
        u32::MAX
    }
}
