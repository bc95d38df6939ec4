//! In-memory store backend for tests and demos.
//!
//! Plays the role the localfs mock backend plays for the block-store side:
//! a self-contained `ObjectStore` with versioned buckets, delete markers and
//! a call-counter record so tests can assert which remote calls an operation
//! actually issued.

use crate::cadapter::client::{
    BucketInfo, ObjectInfo, ObjectStore, ObjectVersion, StoreError, VersioningState,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: Option<String>,
    data: Vec<u8>,
    modified: SystemTime,
    delete_marker: bool,
}

struct Bucket {
    created: SystemTime,
    versioning: VersioningState,
    // key -> versions, oldest first
    objects: BTreeMap<String, Vec<StoredVersion>>,
}

/// Counts of remote calls made through the trait, for test assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub list_buckets: u32,
    pub list_objects: u32,
    pub list_versions: u32,
    pub gets: u32,
    pub puts: u32,
    pub deletes: u32,
    pub bucket_creates: u32,
    pub bucket_deletes: u32,
    pub versioning_reads: u32,
}

struct Inner {
    buckets: BTreeMap<String, Bucket>,
    stats: CallStats,
    deletes: Vec<(String, Option<String>)>,
    fail_put_substr: Option<String>,
    clock: u64,
    next_version: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: BTreeMap::new(),
                stats: CallStats::default(),
                deletes: Vec::new(),
                fail_put_substr: None,
                clock: 0,
                next_version: 1,
            }),
        }
    }

    pub fn add_bucket(&self, name: &str, versioning: VersioningState) {
        let mut inner = self.inner.lock().unwrap();
        let created = Inner::tick(&mut inner.clock);
        inner.buckets.insert(
            name.to_string(),
            Bucket {
                created,
                versioning,
                objects: BTreeMap::new(),
            },
        );
    }

    /// Seed one object version under `bucket/rest` key; versioned buckets
    /// accumulate history, others replace.
    pub fn insert_object(&self, key: &str, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.store_version(key, data.to_vec(), false);
    }

    /// Seed a delete marker as the newest version of `key`.
    pub fn insert_delete_marker(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.store_version(key, Vec::new(), true);
    }

    /// Latest non-marker content of `key`, if any.
    pub fn object_data(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let (bucket, rest) = split_key(key)?;
        let versions = inner.buckets.get(bucket)?.objects.get(rest)?;
        let latest = versions.last()?;
        if latest.delete_marker {
            None
        } else {
            Some(latest.data.clone())
        }
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.inner.lock().unwrap().buckets.contains_key(name)
    }

    pub fn stats(&self) -> CallStats {
        self.inner.lock().unwrap().stats
    }

    /// Every `delete_object` call observed, in order, with its version id.
    pub fn recorded_deletes(&self) -> Vec<(String, Option<String>)> {
        self.inner.lock().unwrap().deletes.clone()
    }

    /// Make any `put_object` whose key contains `substr` fail.
    pub fn fail_puts_containing(&self, substr: &str) {
        self.inner.lock().unwrap().fail_put_substr = Some(substr.to_string());
    }

    /// Version ids of `key`, oldest first, markers included.
    pub fn version_ids(&self, key: &str) -> Vec<Option<String>> {
        let inner = self.inner.lock().unwrap();
        let Some((bucket, rest)) = split_key(key) else {
            return Vec::new();
        };
        inner
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(rest))
            .map(|vs| vs.iter().map(|v| v.version_id.clone()).collect())
            .unwrap_or_default()
    }
}

impl Inner {
    fn tick(clock: &mut u64) -> SystemTime {
        *clock += 1;
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + *clock)
    }

    fn store_version(&mut self, key: &str, data: Vec<u8>, delete_marker: bool) {
        let Some((bucket_name, rest)) = split_key(key) else {
            return;
        };
        let bucket_name = bucket_name.to_string();
        let rest = rest.to_string();
        let modified = Self::tick(&mut self.clock);
        let versioned = self
            .buckets
            .get(&bucket_name)
            .map(|b| b.versioning.is_versioned())
            .unwrap_or(false);
        let version_id = if versioned {
            let id = format!("v{}", self.next_version);
            self.next_version += 1;
            Some(id)
        } else {
            None
        };
        let Some(bucket) = self.buckets.get_mut(&bucket_name) else {
            return;
        };
        let versions = bucket.objects.entry(rest).or_default();
        if !versioned {
            versions.clear();
        }
        versions.push(StoredVersion {
            version_id,
            data,
            modified,
            delete_marker,
        });
    }
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let key = key.trim_start_matches('/');
    key.split_once('/')
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.list_buckets += 1;
        Ok(inner
            .buckets
            .iter()
            .map(|(name, b)| BucketInfo {
                name: name.clone(),
                created: b.created,
            })
            .collect())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.list_objects += 1;
        let b = inner
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NotFound(bucket.to_string()))?;
        let mut out = Vec::new();
        for (key, versions) in &b.objects {
            if let Some(p) = prefix {
                if !key.starts_with(p) {
                    continue;
                }
            }
            let Some(latest) = versions.last() else {
                continue;
            };
            if latest.delete_marker {
                continue;
            }
            out.push(ObjectInfo {
                key: key.clone(),
                size: latest.data.len() as i64,
                modified: latest.modified,
            });
            if out.len() >= max_keys as usize {
                break;
            }
        }
        Ok(out)
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.list_versions += 1;
        let b = inner
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NotFound(bucket.to_string()))?;
        let mut out = Vec::new();
        for (key, versions) in &b.objects {
            if let Some(p) = prefix {
                if !key.starts_with(p) {
                    continue;
                }
            }
            // newest first, as the remote listing API reports them
            for (i, v) in versions.iter().rev().enumerate() {
                out.push(ObjectVersion {
                    key: key.clone(),
                    version_id: v.version_id.clone(),
                    size: v.data.len() as i64,
                    modified: v.modified,
                    is_latest: i == 0,
                    delete_marker: v.delete_marker,
                });
                if out.len() >= max_keys as usize {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    async fn get_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        dest: &Path,
    ) -> Result<(), StoreError> {
        let data = {
            let mut inner = self.inner.lock().unwrap();
            inner.stats.gets += 1;
            let (bucket, rest) =
                split_key(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let versions = inner
                .buckets
                .get(bucket)
                .and_then(|b| b.objects.get(rest))
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let found = match version_id {
                Some(id) => versions.iter().find(|v| v.version_id.as_deref() == Some(id)),
                None => versions.last().filter(|v| !v.delete_marker),
            };
            found
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?
                .data
                .clone()
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &data).await?;
        Ok(())
    }

    async fn put_object(&self, key: &str, src: &Path) -> Result<(), StoreError> {
        let data = tokio::fs::read(src).await?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.puts += 1;
        if let Some(substr) = &inner.fail_put_substr {
            if key.contains(substr.as_str()) {
                return Err(StoreError::Remote(format!("injected put failure: {key}")));
            }
        }
        let (bucket, _) = split_key(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if !inner.buckets.contains_key(bucket) {
            return Err(StoreError::NotFound(bucket.to_string()));
        }
        inner.store_version(key, data, false);
        Ok(())
    }

    async fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.deletes += 1;
        inner
            .deletes
            .push((key.to_string(), version_id.map(|s| s.to_string())));
        let (bucket, rest) = split_key(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let bucket = bucket.to_string();
        let rest = rest.to_string();
        let versioned = inner
            .buckets
            .get(&bucket)
            .map(|b| b.versioning.is_versioned())
            .unwrap_or(false);
        match version_id {
            Some(id) => {
                if let Some(bucket_entry) = inner.buckets.get_mut(&bucket) {
                    let mut emptied = false;
                    if let Some(versions) = bucket_entry.objects.get_mut(&rest) {
                        versions.retain(|v| v.version_id.as_deref() != Some(id));
                        emptied = versions.is_empty();
                    }
                    if emptied {
                        bucket_entry.objects.remove(&rest);
                    }
                }
            }
            None if versioned => {
                inner.store_version(key, Vec::new(), true);
            }
            None => {
                if let Some(b) = inner.buckets.get_mut(&bucket) {
                    b.objects.remove(&rest);
                }
            }
        }
        Ok(())
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.bucket_creates += 1;
        let created = Inner::tick(&mut inner.clock);
        inner.buckets.entry(name.to_string()).or_insert(Bucket {
            created,
            versioning: VersioningState::Unversioned,
            objects: BTreeMap::new(),
        });
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.bucket_deletes += 1;
        inner
            .buckets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn get_bucket_versioning(&self, bucket: &str) -> Result<VersioningState, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.versioning_reads += 1;
        inner
            .buckets
            .get(bucket)
            .map(|b| b.versioning)
            .ok_or_else(|| StoreError::NotFound(bucket.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versioned_bucket_accumulates_history() {
        let store = MemoryStore::new();
        store.add_bucket("b", VersioningState::Enabled);
        store.insert_object("b/doc.txt", b"one");
        store.insert_object("b/doc.txt", b"two");
        store.insert_delete_marker("b/doc.txt");

        let versions = store
            .list_object_versions("b", Some("doc.txt"), 1000)
            .await
            .unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions[0].delete_marker && versions[0].is_latest);
        assert_eq!(versions[2].size, 3);

        // listing hides keys whose latest version is a marker
        let objects = store.list_objects("b", None, 1000).await.unwrap();
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn get_by_version_id() {
        let store = MemoryStore::new();
        store.add_bucket("b", VersioningState::Enabled);
        store.insert_object("b/k", b"old");
        store.insert_object("b/k", b"new");
        let ids = store.version_ids("b/k");
        let first = ids[0].clone().unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("out");
        store.get_object("b/k", Some(&first), &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }
}
