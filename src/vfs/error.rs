//! Unified error surface for filesystem operations.
//!
//! Tree, cache and codec layers raise their most specific kind; the FUSE
//! boundary translates every kind to a negative errno via [`FsError::errno`].

use crate::cadapter::client::StoreError;
use crate::codec::CodecError;
use crate::codec::bridge::BridgeError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("remote store failure: {0}")]
    Remote(#[source] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("erasure codec failure: {0}")]
    Codec(#[source] CodecError),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        FsError::Remote(e)
    }
}

impl From<CodecError> for FsError {
    fn from(e: CodecError) -> Self {
        FsError::Codec(e)
    }
}

impl From<BridgeError> for FsError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Store(e) => FsError::Remote(e),
            BridgeError::Codec(e) => FsError::Codec(e),
            BridgeError::Io(e) => FsError::Io(e),
        }
    }
}

impl FsError {
    /// POSIX errno equivalent for the FUSE reply.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Remote(StoreError::NotFound(_)) => libc::ENOENT,
            FsError::Remote(_) => libc::EIO,
            FsError::Io(e) if e.kind() == io::ErrorKind::NotFound => libc::ENOENT,
            FsError::Io(_) => libc::EIO,
            FsError::Codec(_) => libc::EIO,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
        }
    }
}
