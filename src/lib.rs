//! Union filesystem semantics over pluggable storage layers.
//!
//! A [`UnionFs`] presents one writable upper layer stacked on ordered
//! read-only lower layers as a single namespace. Deletions are expressed
//! as whiteouts, moves as redirects, and mutations of lower objects as
//! copy-ups into the upper layer. An on-disk index keeps hard link
//! counts correct across partial copy-ups.
//!
//! The engine is storage-agnostic: each layer is a [`storage::Storage`]
//! implementation. [`storage::MemStorage`] ships in-tree and backs the
//! test suite.

pub mod config;
pub mod error;
pub mod storage;
pub mod union;

pub use config::Config;
pub use error::{Result, StrataError};
pub use union::{
    classify, CopyUpStatus, DirHandle, Layer, LayerStack, LinkGuard, MergeEntry, MergedDir,
    OverlayEntry, PathType, RenameMode, UnionFs, INDEX_DIR, WORK_DIR,
};
