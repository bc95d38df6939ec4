//! ShardFS: presents an object-storage bucket/key namespace as a POSIX tree
//! over FUSE, fetching objects into a local disk cache on first access,
//! reconstructing erasure-coded objects from their fragments, and flushing
//! local modifications back to the store on close.

pub mod cache;
pub mod cadapter;
pub mod codec;
pub mod fuse;
pub mod tree;
pub mod vfs;
