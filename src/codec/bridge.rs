//! Staging orchestration between the remote store, the erasure transform and
//! the local cache: fragment-group download + decode on the read path,
//! encode + fragment upload on the write path.

use crate::cadapter::client::{ObjectStore, StoreError};
use crate::codec::{CodecError, ErasurePolicy, FragmentCodec};
use log::{debug, warn};
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// One fragment child of a fragment-group node, as the tree records it.
#[derive(Debug, Clone)]
pub struct FragmentRef {
    pub name: String,
    pub version_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Working directory for fragment staging, recreated empty per operation.
async fn fresh_staging(staging_root: &Path) -> io::Result<std::path::PathBuf> {
    let staging = staging_root.join("coding");
    match fs::remove_dir_all(&staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(&staging).await?;
    Ok(staging)
}

/// Download every fragment of `logical_key` into a staging directory, run the
/// decode transform, move the decoded output to `dest` and purge the staging
/// area. Fragment remote keys are `<logical_key>/<fragment-name>`; each
/// fragment may pin its own version.
pub async fn fetch_and_decode<S, C>(
    store: &S,
    codec: &C,
    logical_key: &str,
    fragments: &[FragmentRef],
    dest: &Path,
    staging_root: &Path,
) -> Result<(), BridgeError>
where
    S: ObjectStore + ?Sized,
    C: FragmentCodec + ?Sized,
{
    let staging = fresh_staging(staging_root).await?;
    for fragment in fragments {
        let remote = format!("{logical_key}/{}", fragment.name);
        debug!("fetching fragment {remote}");
        store
            .get_object(
                &remote,
                fragment.version_id.as_deref(),
                &staging.join(&fragment.name),
            )
            .await?;
    }

    let base = logical_key.rsplit('/').next().unwrap_or(logical_key);
    let decoded = codec.decode(&staging, base)?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::rename(&decoded, dest).await.is_err() {
        // staging and cache may sit on different filesystems
        fs::copy(&decoded, dest).await?;
        fs::remove_file(&decoded).await?;
    }
    fs::remove_dir_all(&staging).await?;
    Ok(())
}

/// Encode the cached file with the configured policy and upload every
/// produced fragment under `<logical_key>/<fragment-name>`, deleting each
/// local fragment after its upload. The first failed upload aborts the
/// operation; fragments uploaded before it stay in the store (no rollback).
pub async fn encode_and_upload<S, C>(
    store: &S,
    codec: &C,
    policy: &ErasurePolicy,
    logical_key: &str,
    cache_path: &Path,
    staging_root: &Path,
) -> Result<(), BridgeError>
where
    S: ObjectStore + ?Sized,
    C: FragmentCodec + ?Sized,
{
    let staging = fresh_staging(staging_root).await?;
    let fragments = codec.encode(cache_path, &staging, policy)?;
    debug!(
        "encoded {} into {} fragments",
        cache_path.display(),
        fragments.len()
    );
    for fragment in fragments {
        let Some(name) = fragment.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let remote = format!("{logical_key}/{name}");
        store.put_object(&remote, &fragment).await.inspect_err(|e| {
            warn!("fragment upload {remote} failed, leaving earlier fragments in place: {e}");
        })?;
        fs::remove_file(&fragment).await?;
    }
    let _ = fs::remove_dir(&staging).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::client::VersioningState;
    use crate::cadapter::memory::MemoryStore;
    use crate::codec::ReedSolomonCodec;

    fn setup() -> (MemoryStore, ReedSolomonCodec, ErasurePolicy) {
        let store = MemoryStore::new();
        store.add_bucket("b", VersioningState::Unversioned);
        let policy = ErasurePolicy::default();
        let codec = ReedSolomonCodec::from_policy(&policy);
        (store, codec, policy)
    }

    #[tokio::test]
    async fn encode_upload_then_fetch_decode_round_trip() {
        let (store, codec, policy) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let cache_file = tmp.path().join("cache").join("report.pdf");
        std::fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&cache_file, &payload).unwrap();

        let staging = tmp.path().join("staging");
        encode_and_upload(
            &store,
            &codec,
            &policy,
            "b/docs/report.pdf",
            &cache_file,
            &staging,
        )
        .await
        .unwrap();
        // k + m fragments plus the sidecar landed remotely
        assert_eq!(store.stats().puts as usize, policy.k + policy.m + 1);
        assert!(store.object_data("b/docs/report.pdf/report.pdf_meta.txt").is_some());
        // local fragments were removed after upload
        assert!(!staging.join("coding").join("report.pdf_k0").exists());

        let fragments: Vec<FragmentRef> = (0..policy.k)
            .map(|i| format!("report.pdf_k{i}"))
            .chain((0..policy.m).map(|i| format!("report.pdf_m{i}")))
            .chain(std::iter::once("report.pdf_meta.txt".to_string()))
            .map(|name| FragmentRef {
                name,
                version_id: None,
            })
            .collect();
        let dest = tmp.path().join("cache2").join("report.pdf");
        fetch_and_decode(
            &store,
            &codec,
            "b/docs/report.pdf",
            &fragments,
            &dest,
            &staging,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        // staging is purged of fragment files
        assert!(!staging.join("coding").exists());
    }

    #[tokio::test]
    async fn failed_fragment_upload_aborts_without_rollback() {
        let (store, codec, policy) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let cache_file = tmp.path().join("blob");
        std::fs::write(&cache_file, vec![9u8; 2048]).unwrap();
        store.fail_puts_containing("_m0");

        let err = encode_and_upload(
            &store,
            &codec,
            &policy,
            "b/blob",
            &cache_file,
            tmp.path(),
        )
        .await;
        assert!(err.is_err());
        // data fragments uploaded before the failure stay put
        assert!(store.object_data("b/blob/blob_k0").is_some());
        assert!(store.object_data("b/blob/blob_m0").is_none());
    }
}
