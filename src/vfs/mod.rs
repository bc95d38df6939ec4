//! Filesystem core: path-based operation handlers over the directory tree,
//! the disk cache and the erasure bridge.

pub mod error;
pub mod fs;

pub use error::FsError;
pub use fs::{DirEntry, FileAttr, FileType, FsOptions, ObjectFs};
