//! WAL segment file management (`spec.md` §4.10, §6): numbered, rotating,
//! optionally gzip-compressed append-only logs.

use std::path::{Path, PathBuf};

use crate::commit::WalLine;
use crate::fs::Filesystem;
use crate::snapshot::{gunzip_bytes, gzip_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub fn active_filename(&self) -> String {
        format!("{:06}.jsonl", self.0)
    }

    pub fn compressed_filename(&self) -> String {
        format!("{:06}.jsonl.gz", self.0)
    }
}

/// One segment as discovered on disk.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub id: SegmentId,
    pub compressed: bool,
}

impl SegmentFile {
    pub fn path(&self, wal_dir: &Path) -> PathBuf {
        let name = if self.compressed {
            self.id.compressed_filename()
        } else {
            self.id.active_filename()
        };
        wal_dir.join(name)
    }
}

pub async fn list_segments(fs: &dyn Filesystem, wal_dir: &Path) -> std::io::Result<Vec<SegmentFile>> {
    if !fs.exists(wal_dir).await {
        return Ok(Vec::new());
    }
    let names = fs.read_dir(wal_dir).await?;
    let mut segments = Vec::new();
    for name in names {
        if let Some(stripped) = name.strip_suffix(".jsonl.gz") {
            if let Ok(n) = stripped.parse::<u32>() {
                segments.push(SegmentFile { id: SegmentId(n), compressed: true });
            }
        } else if let Some(stripped) = name.strip_suffix(".jsonl") {
            if let Ok(n) = stripped.parse::<u32>() {
                segments.push(SegmentFile { id: SegmentId(n), compressed: false });
            }
        }
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

pub async fn append_line(fs: &dyn Filesystem, path: &Path, line: &WalLine) -> std::io::Result<()> {
    let mut json = serde_json::to_vec(line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    json.push(b'\n');
    fs.append(path, &json).await
}

/// Reads every well-formed commit line from a segment. A truncated trailing
/// line (a torn tail from a crash mid-write) is logged and dropped rather
/// than failing the whole read.
pub async fn read_segment_lines(
    fs: &dyn Filesystem,
    segment: &SegmentFile,
    wal_dir: &Path,
) -> std::io::Result<Vec<WalLine>> {
    let path = segment.path(wal_dir);
    let raw = fs.read(&path).await?;
    let bytes = if segment.compressed { gunzip_bytes(&raw)? } else { raw };
    let text = String::from_utf8_lossy(&bytes);

    let mut lines = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WalLine>(line) {
            Ok(parsed) => lines.push(parsed),
            Err(err) => {
                log::warn!(
                    "segment {:?} line {idx} failed to parse, treating as torn tail: {err}",
                    segment.id
                );
                break;
            }
        }
    }
    Ok(lines)
}

/// Compresses a rotated (non-active) segment in place: writes a `.gz.tmp`
/// sibling, renames it over the final `.gz` path, then removes the
/// uncompressed original.
pub async fn compress_segment(
    fs: &dyn Filesystem,
    wal_dir: &Path,
    id: SegmentId,
) -> std::io::Result<()> {
    let uncompressed = wal_dir.join(id.active_filename());
    let raw = fs.read(&uncompressed).await?;
    let gz = gzip_bytes(&raw)?;

    let final_path = wal_dir.join(id.compressed_filename());
    let mut tmp_name = id.compressed_filename();
    tmp_name.push_str(".tmp");
    let tmp_path = wal_dir.join(tmp_name);

    fs.write(&tmp_path, &gz).await?;
    fs.rename(&tmp_path, &final_path).await?;
    fs.remove_file(&uncompressed).await
}
