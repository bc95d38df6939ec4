//! FUSE adapter: translates rfuse3's inode-based callbacks into the
//! path-based operations of [`ObjectFs`].
//!
//! The kernel speaks inodes, the core speaks paths, so the adapter keeps an
//! inode-to-path table of every path the kernel has looked up. Attribute and
//! type conversion helpers live at the bottom.

pub mod mount;

use crate::cadapter::client::ObjectStore;
use crate::codec::FragmentCodec;
use crate::vfs::fs::{FileAttr as VfsFileAttr, FileType as VfsFileType, ObjectFs};
use bytes::Bytes;
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, Stream};

const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, "/".to_string());
        table.by_path.insert("/".to_string(), ROOT_INO);
        table
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    /// Drop the mapping for a removed path (and everything below it).
    fn forget_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        let gone: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in gone {
            if let Some(ino) = self.by_path.remove(&p) {
                self.by_ino.remove(&ino);
            }
        }
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub struct FuseFs<S, C> {
    fs: Arc<ObjectFs<S, C>>,
    inodes: Mutex<InodeTable>,
}

impl<S, C> FuseFs<S, C>
where
    S: ObjectStore + 'static,
    C: FragmentCodec + 'static,
{
    pub fn new(fs: ObjectFs<S, C>) -> Self {
        Self {
            fs: Arc::new(fs),
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes
            .lock()
            .unwrap()
            .path_of(ino)
            .ok_or_else(|| libc::ENOENT.into())
    }

    fn ino_for(&self, path: &str) -> u64 {
        self.inodes.lock().unwrap().ino_for(path)
    }
}

impl<S, C> Filesystem for FuseFs<S, C>
where
    S: ObjectStore + 'static,
    C: FragmentCodec + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        // conservative write ceiling; object-store latency dwarfs it anyway
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let parent_path = self.path_of(parent)?;
        let path = child_path(&parent_path, &name.to_string_lossy());
        let vattr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;
        let ino = self.ino_for(&path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(ino, &vattr, &req),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let vattr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &vattr, &req),
        })
    }

    // only size changes (truncate) are honored; other attributes live and die
    // with the cache copy
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        if let Some(size) = set_attr.size {
            self.fs.truncate(&path, size).await.map_err(|e| e.errno())?;
        }
        let vattr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &vattr, &req),
        })
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        self.fs.open(&path).await.map_err(|e| e.errno())?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let vattr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;
        if !matches!(vattr.kind, VfsFileType::Dir) {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let data = self
            .fs
            .read(&path, offset, size as usize)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.path_of(ino)?;
        let written = self
            .fs
            .write(&path, offset, data)
            .await
            .map_err(|e| e.errno())? as u32;
        Ok(ReplyWrite { written })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path_of(ino)?;
        let entries = self.fs.readdir(&path).await.map_err(|e| e.errno())?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: ROOT_INO,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, entry) in entries.iter().enumerate() {
            let entry_path = child_path(&path, &entry.name);
            all.push(DirectoryEntry {
                inode: self.ino_for(&entry_path),
                kind: vfs_kind_to_fuse(entry.kind),
                name: OsString::from(entry.name.clone()),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path_of(ino)?;
        let entries = self.fs.readdir(&path).await.map_err(|e| e.errno())?;
        let self_attr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: to_fuse_attr(ino, &self_attr, &req),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        all.push(DirectoryEntryPlus {
            inode: ROOT_INO,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: to_fuse_attr(ROOT_INO, &self_attr, &req),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        for (i, entry) in entries.iter().enumerate() {
            let entry_path = child_path(&path, &entry.name);
            let Ok(vattr) = self.fs.getattr(&entry_path).await else {
                continue;
            };
            let child_ino = self.ino_for(&entry_path);
            all.push(DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: vfs_kind_to_fuse(entry.kind),
                name: OsString::from(entry.name.clone()),
                offset: (i as i64) + 3,
                attr: to_fuse_attr(child_ino, &vattr, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let parent_path = self.path_of(parent)?;
        let path = child_path(&parent_path, &name.to_string_lossy());
        self.fs.mkdir(&path).await.map_err(|e| e.errno())?;
        let vattr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;
        let ino = self.ino_for(&path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(ino, &vattr, &req),
            generation: 0,
        })
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let parent_path = self.path_of(parent)?;
        let path = child_path(&parent_path, &name.to_string_lossy());
        self.fs.create(&path).await.map_err(|e| e.errno())?;
        let vattr = self.fs.getattr(&path).await.map_err(|e| e.errno())?;
        let ino = self.ino_for(&path);
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(ino, &vattr, &req),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent_path = self.path_of(parent)?;
        let path = child_path(&parent_path, &name.to_string_lossy());
        self.fs.unlink(&path).await.map_err(|e| e.errno())?;
        self.inodes.lock().unwrap().forget_subtree(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent_path = self.path_of(parent)?;
        let path = child_path(&parent_path, &name.to_string_lossy());
        self.fs.rmdir(&path).await.map_err(|e| e.errno())?;
        self.inodes.lock().unwrap().forget_subtree(&path);
        Ok(())
    }

    // close(2) path: push dirty data for this file back to the store
    async fn flush(&self, _req: Request, ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        let path = self.path_of(ino)?;
        self.fs.flush(Some(&path)).await.map_err(|e| e.errno())?;
        Ok(())
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // conservative constants; the store has no meaningful totals to report
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

// =============== helpers ===============

fn vfs_kind_to_fuse(kind: VfsFileType) -> FuseFileType {
    match kind {
        VfsFileType::Dir => FuseFileType::Directory,
        VfsFileType::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, attr: &VfsFileAttr, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let ts = Timestamp::from(attr.modified);
    let perm = match attr.kind {
        VfsFileType::Dir => 0o755,
        VfsFileType::File => 0o644,
    } as u16;
    let nlink = match attr.kind {
        VfsFileType::Dir => 2,
        VfsFileType::File => 1,
    };
    rfuse3::raw::reply::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: ts,
        mtime: ts,
        ctime: ts,
        #[cfg(target_os = "macos")]
        crtime: ts,
        kind: vfs_kind_to_fuse(attr.kind),
        perm,
        nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::cadapter::client::VersioningState;
    use crate::cadapter::memory::MemoryStore;
    use crate::codec::{ErasurePolicy, ReedSolomonCodec};
    use crate::fuse::mount::mount_unprivileged;
    use crate::tree::DeleteMarkerVisibility;
    use crate::vfs::fs::FsOptions;
    use std::fs;
    use std::io::Write;
    use std::time::Duration as StdDuration;

    // Mount smoke test, gated by env var: requires fusermount3 and /dev/fuse.
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("SHARDFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set SHARDFS_FUSE_TEST=1 to enable");
            return;
        }

        let store = std::sync::Arc::new(MemoryStore::new());
        store.add_bucket("bucket", VersioningState::Unversioned);
        store.insert_object("bucket/hello.txt", b"remote bytes");
        let tmp = tempfile::tempdir().expect("tmp dirs");
        let policy = ErasurePolicy::default();
        let fs = ObjectFs::new(
            store.clone(),
            ReedSolomonCodec::from_policy(&policy),
            FsOptions {
                cache_root: tmp.path().join("cache"),
                staging_root: tmp.path().join("staging"),
                encode: false,
                policy,
                delete_markers: DeleteMarkerVisibility::Hidden,
            },
        );

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let handle = match mount_unprivileged(FuseFs::new(fs), &mnt_path).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };
        tokio::time::sleep(StdDuration::from_millis(2000)).await;

        let remote = fs::read(mnt_path.join("bucket/hello.txt")).expect("read remote object");
        assert_eq!(remote, b"remote bytes");

        let file_path = mnt_path.join("bucket/new.txt");
        {
            let mut f = fs::File::create(&file_path).expect("create");
            f.write_all(b"abc").expect("write");
            f.flush().expect("flush");
        }
        drop(fs::read(&file_path).expect("read back"));

        let names: Vec<_> = fs::read_dir(mnt_path.join("bucket"))
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(names.iter().any(|n| n.to_string_lossy() == "hello.txt"));

        fs::remove_file(&file_path).expect("unlink");
        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
