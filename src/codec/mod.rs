//! Erasure-coding layer: the coding policy, the opaque fragment transform
//! interface, and the Reed-Solomon implementation the daemon ships with.
//!
//! Fragment files for an object `name` are `name_k<i>` (data) and `name_m<i>`
//! (parity), plus a `name_meta.txt` sidecar recording the original byte size
//! (and the k/m geometry) so decode can strip shard padding.

pub mod bridge;

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Trailing marker of the sidecar object holding a logical file's true size.
pub const META_SUFFIX: &str = "_meta.txt";
/// Tag carried by the decode output file name.
pub const DECODED_TAG: &str = "decoded";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("erasure transform failed: {0}")]
    Transform(String),
    #[error("decode produced no usable output")]
    NoOutput,
}

/// Fixed coding policy, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ErasurePolicy {
    pub k: usize,
    pub m: usize,
    pub technique: String,
    pub w: u32,
    pub packet_size: u32,
    pub buffer_size: u32,
}

impl Default for ErasurePolicy {
    fn default() -> Self {
        Self {
            k: 4,
            m: 2,
            technique: "reed_sol_van".to_string(),
            w: 8,
            packet_size: 1024,
            buffer_size: 500_000,
        }
    }
}

impl ErasurePolicy {
    /// Parse the whitespace-separated policy file:
    /// `k m technique w packet_size buffer_size`.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut fields = text.split_whitespace();
        let mut field = |what: &'static str| {
            fields.next().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("erasure policy file missing field: {what}"),
                )
            })
        };
        fn num<T: std::str::FromStr>(what: &'static str, raw: &str) -> io::Result<T> {
            raw.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("erasure policy field {what} is not a number: {raw}"),
                )
            })
        }
        Ok(Self {
            k: num("k", field("k")?)?,
            m: num("m", field("m")?)?,
            technique: field("technique")?.to_string(),
            w: num("w", field("w")?)?,
            packet_size: num("packet_size", field("packet_size")?)?,
            buffer_size: num("buffer_size", field("buffer_size")?)?,
        })
    }
}

/// The external encode/decode transform, consumed as a file-level black box:
/// fragments in a staging directory on one side, a whole object on the other.
pub trait FragmentCodec: Send + Sync {
    /// Encode `input` into fragment files inside `staging`; returns the
    /// produced fragment paths, size sidecar included.
    fn encode(
        &self,
        input: &Path,
        staging: &Path,
        policy: &ErasurePolicy,
    ) -> Result<Vec<PathBuf>, CodecError>;

    /// Reassemble the object whose fragments sit in `staging` under the base
    /// name `base`; returns the decoded output file (tagged with
    /// [`DECODED_TAG`]).
    fn decode(&self, staging: &Path, base: &str) -> Result<PathBuf, CodecError>;
}

/// Reed-Solomon transform over GF(2^8): k data shards, m parity shards.
pub struct ReedSolomonCodec {
    default_k: usize,
    default_m: usize,
}

impl ReedSolomonCodec {
    /// `k`/`m` are the fallback geometry for decoding fragment sets whose
    /// sidecar does not record one.
    pub fn new(k: usize, m: usize) -> Self {
        Self {
            default_k: k.max(1),
            default_m: m.max(1),
        }
    }

    pub fn from_policy(policy: &ErasurePolicy) -> Self {
        Self::new(policy.k, policy.m)
    }

    fn read_meta(staging: &Path, base: &str) -> Option<HashMap<String, u64>> {
        let text = std::fs::read_to_string(staging.join(format!("{base}{META_SUFFIX}"))).ok()?;
        let mut out = HashMap::new();
        for line in text.lines() {
            let mut it = line.split_whitespace();
            if let (Some(name), Some(value)) = (it.next(), it.next()) {
                if let Ok(value) = value.parse() {
                    out.insert(name.to_string(), value);
                }
            }
        }
        Some(out)
    }
}

impl FragmentCodec for ReedSolomonCodec {
    fn encode(
        &self,
        input: &Path,
        staging: &Path,
        policy: &ErasurePolicy,
    ) -> Result<Vec<PathBuf>, CodecError> {
        let data = std::fs::read(input)?;
        let base = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CodecError::Transform("input has no file name".to_string()))?;
        let k = policy.k.max(1);
        let m = policy.m.max(1);
        let shard_len = data.len().div_ceil(k).max(1);

        let mut shards: Vec<Vec<u8>> = (0..k)
            .map(|i| {
                let start = (i * shard_len).min(data.len());
                let end = ((i + 1) * shard_len).min(data.len());
                let mut shard = data[start..end].to_vec();
                shard.resize(shard_len, 0);
                shard
            })
            .collect();
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_len]).take(m));

        let rs = ReedSolomon::new(k, m).map_err(|e| CodecError::Transform(e.to_string()))?;
        rs.encode(&mut shards)
            .map_err(|e| CodecError::Transform(e.to_string()))?;

        let mut out = Vec::with_capacity(k + m + 1);
        for (i, shard) in shards.iter().enumerate() {
            let name = if i < k {
                format!("{base}_k{i}")
            } else {
                format!("{base}_m{}", i - k)
            };
            let path = staging.join(name);
            std::fs::write(&path, shard)?;
            out.push(path);
        }
        let meta = staging.join(format!("{base}{META_SUFFIX}"));
        std::fs::write(&meta, format!("checksum {}\nk {k}\nm {m}\n", data.len()))?;
        out.push(meta);
        Ok(out)
    }

    fn decode(&self, staging: &Path, base: &str) -> Result<PathBuf, CodecError> {
        let meta = Self::read_meta(staging, base);
        let k = meta
            .as_ref()
            .and_then(|m| m.get("k"))
            .map(|v| *v as usize)
            .unwrap_or(self.default_k);
        let m = meta
            .as_ref()
            .and_then(|m| m.get("m"))
            .map(|v| *v as usize)
            .unwrap_or(self.default_m);
        let size = meta.as_ref().and_then(|m| m.get("checksum")).copied();

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(k + m);
        for i in 0..k {
            shards.push(std::fs::read(staging.join(format!("{base}_k{i}"))).ok());
        }
        for i in 0..m {
            shards.push(std::fs::read(staging.join(format!("{base}_m{i}"))).ok());
        }
        let present = shards.iter().flatten().count();
        if present < k {
            return Err(CodecError::Transform(format!(
                "only {present} of {k} required fragments available for {base}"
            )));
        }
        let shard_len = shards.iter().flatten().map(Vec::len).max().unwrap_or(0);
        for shard in shards.iter_mut().flatten() {
            shard.resize(shard_len, 0);
        }

        let rs = ReedSolomon::new(k, m).map_err(|e| CodecError::Transform(e.to_string()))?;
        rs.reconstruct(&mut shards)
            .map_err(|e| CodecError::Transform(e.to_string()))?;

        let mut data = Vec::with_capacity(k * shard_len);
        for shard in shards.iter().take(k) {
            data.extend_from_slice(shard.as_deref().ok_or(CodecError::NoOutput)?);
        }
        if let Some(size) = size {
            data.truncate(size as usize);
        }
        let out = staging.join(format!("{base}_{DECODED_TAG}"));
        std::fs::write(&out, &data)?;
        Ok(out)
    }
}
