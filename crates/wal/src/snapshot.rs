//! Point-in-time snapshots (`spec.md` §3, §4.10, §6).

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::commit::CommitId;
use crate::fs::Filesystem;
use crate::store::StoreData;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub commit_id: CommitId,
    pub ts: u64,
    pub data: StoreData,
}

impl Snapshot {
    pub fn new(commit_id: CommitId, ts: u64, data: StoreData) -> Self {
        Self { version: 1, commit_id, ts, data }
    }

    /// Atomically writes this snapshot to `path` (`snapshot.json` or
    /// `snapshot.json.gz`): serialize to a `.tmp` sibling, then rename over
    /// the destination.
    pub async fn write_atomic(
        &self,
        fs: &dyn Filesystem,
        path: &Path,
        gzip: bool,
    ) -> std::io::Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let bytes = if gzip { gzip_bytes(&json)? } else { json };

        let tmp = tmp_sibling(path);
        fs.write(&tmp, &bytes).await?;
        fs.rename(&tmp, path).await
    }

    pub async fn read(fs: &dyn Filesystem, path: &Path, gzip: bool) -> std::io::Result<Self> {
        let raw = fs.read(path).await?;
        let json = if gzip { gunzip_bytes(&raw)? } else { raw };
        serde_json::from_slice(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot").to_string();
    name.push_str(".tmp");
    path.with_file_name(name)
}

pub fn gzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
