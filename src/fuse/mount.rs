//! Mount helpers for starting/stopping FUSE.
//!
//! Only supported on Unix-like systems; on Linux unprivileged mounts go
//! through fusermount3. Thin wrappers over the rfuse3 raw Session API.

use std::path::Path;

use rfuse3::MountOptions;

use crate::cadapter::client::ObjectStore;
use crate::codec::FragmentCodec;
use crate::fuse::FuseFs;

fn default_mount_options() -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("shardfs");
    // conservative defaults: no allow_other, mountpoint must be empty
    options
}

/// Mount onto the given empty directory, unprivileged where available.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<S, C>(
    fs: FuseFs<S, C>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ObjectStore + 'static,
    C: FragmentCodec + 'static,
{
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<S, C>(
    _fs: FuseFs<S, C>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ObjectStore + 'static,
    C: FragmentCodec + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
