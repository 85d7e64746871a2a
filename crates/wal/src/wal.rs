//! The transactional, cached key/value store itself (`spec.md` §4.10).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use abort::Abort;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::commit::{CommitId, CommitRecord, Op, WalLine};
use crate::error::WalError;
use crate::fs::Filesystem;
use crate::key::ContextPath;
use crate::segment::{self, SegmentId};
use crate::snapshot::Snapshot;
use crate::store::Cache;

pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub root: PathBuf,
    pub max_segment_size: u64,
    pub fsync_on_commit: bool,
    pub snapshot_interval: Option<Duration>,
    /// `spec.md` §9's open question on the cleanup worker: the source
    /// leaves this undefined (disabled). Left as an explicit operator
    /// choice rather than defaulted to a period here.
    pub cleanup_interval: Option<Duration>,
    pub compress_rotated_segments: bool,
    pub compress_snapshots: bool,
}

impl WalConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            fsync_on_commit: false,
            snapshot_interval: Some(DEFAULT_SNAPSHOT_INTERVAL),
            cleanup_interval: None,
            compress_rotated_segments: true,
            compress_snapshots: true,
        }
    }

    fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root
            .join(if self.compress_snapshots { "snapshot.json.gz" } else { "snapshot.json" })
    }
}

struct State {
    next_commit_id: CommitId,
    active_segment: SegmentId,
    active_segment_size: u64,
    cache: Option<Cache>,
}

/// A transactional, cached key/value store backed by a write-ahead log.
pub struct WalStorage<F: Filesystem> {
    fs: Arc<F>,
    config: WalConfig,
    state: AsyncMutex<State>,
    abort: Abort,
    workers: SyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    now: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl<F: Filesystem> WalStorage<F> {
    pub fn new(fs: Arc<F>, config: WalConfig, now: Arc<dyn Fn() -> u64 + Send + Sync>) -> Self {
        Self {
            fs,
            config,
            state: AsyncMutex::new(State {
                next_commit_id: CommitId::ZERO,
                active_segment: SegmentId(0),
                active_segment_size: 0,
                cache: None,
            }),
            abort: Abort::new(),
            workers: SyncMutex::new(Vec::new()),
            now,
        }
    }
}

impl<F: Filesystem + 'static> WalStorage<F> {
    /// Ensures directories exist, scans existing segments/snapshot to
    /// recover `next_commit_id` and the active segment, and starts the
    /// periodic workers.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), WalError> {
        self.fs.create_dir_all(&self.config.wal_dir()).await?;
        self.fs.create_dir_all(&self.config.blobs_dir()).await?;

        let (next_commit_id, active_segment, active_segment_size) = self.scan().await?;
        {
            let mut state = self.state.lock().await;
            state.next_commit_id = next_commit_id;
            state.active_segment = active_segment;
            state.active_segment_size = active_segment_size;
            state.cache = None;
        }

        self.spawn_snapshot_worker();
        self.spawn_cleanup_worker();
        Ok(())
    }

    async fn scan(&self) -> Result<(CommitId, SegmentId, u64), WalError> {
        let snapshot_path = self.config.snapshot_path();
        let base_commit = if self.fs.exists(&snapshot_path).await {
            Snapshot::read(self.fs.as_ref(), &snapshot_path, self.config.compress_snapshots)
                .await?
                .commit_id
        } else {
            CommitId::ZERO
        };

        let segments = segment::list_segments(self.fs.as_ref(), &self.config.wal_dir()).await?;
        let mut max_id = base_commit;
        for seg in &segments {
            let lines = segment::read_segment_lines(self.fs.as_ref(), seg, &self.config.wal_dir()).await?;
            for line in lines {
                if line.id > max_id {
                    max_id = line.id;
                }
            }
        }

        let max_seg_num = segments.iter().map(|s| s.id.0).max();
        let active_segment = match max_seg_num {
            None => SegmentId(0),
            Some(num) => {
                let is_compressed = segments.iter().any(|s| s.id.0 == num && s.compressed);
                if is_compressed {
                    SegmentId(num + 1)
                } else {
                    SegmentId(num)
                }
            }
        };

        let active_path = self.config.wal_dir().join(active_segment.active_filename());
        let active_size = if self.fs.exists(&active_path).await {
            self.fs.file_size(&active_path).await?
        } else {
            0
        };

        Ok((max_id.next(), active_segment, active_size))
    }

    fn spawn_snapshot_worker(self: &Arc<Self>) {
        let Some(interval) = self.config.snapshot_interval else { return };
        let this = self.clone();
        let abort = this.abort.clone();
        let task = tokio::spawn(async move {
            loop {
                if abort.sleep(interval).await.is_none() {
                    return;
                }
                if let Err(err) = this.run_snapshot().await {
                    log::warn!("periodic snapshot failed: {err}");
                }
            }
        });
        self.workers.lock().push(task);
    }

    fn spawn_cleanup_worker(self: &Arc<Self>) {
        let Some(interval) = self.config.cleanup_interval else { return };
        let this = self.clone();
        let abort = this.abort.clone();
        let task = tokio::spawn(async move {
            loop {
                if abort.sleep(interval).await.is_none() {
                    return;
                }
                if let Err(err) = this.run_cleanup().await {
                    log::warn!("wal cleanup failed: {err}");
                }
            }
        });
        self.workers.lock().push(task);
    }

    /// Runs a snapshot cycle out of band, independent of the periodic
    /// worker; also called from `close`.
    pub async fn run_snapshot(&self) -> Result<CommitId, WalError> {
        let commit_id = {
            let state = self.state.lock().await;
            CommitId(state.next_commit_id.0.saturating_sub(1))
        };
        let cache = self.reconstruct(None, None).await?;
        let ts = (self.now)();
        let snapshot = Snapshot::new(commit_id, ts, cache.into_data());
        snapshot
            .write_atomic(self.fs.as_ref(), &self.config.snapshot_path(), self.config.compress_snapshots)
            .await?;
        Ok(commit_id)
    }

    /// Deletes WAL segments whose last commit id is at or before the
    /// latest snapshot's commit id.
    pub async fn run_cleanup(&self) -> Result<(), WalError> {
        let snapshot_path = self.config.snapshot_path();
        if !self.fs.exists(&snapshot_path).await {
            return Ok(());
        }
        let snapshot =
            Snapshot::read(self.fs.as_ref(), &snapshot_path, self.config.compress_snapshots).await?;

        let segments = segment::list_segments(self.fs.as_ref(), &self.config.wal_dir()).await?;
        for seg in segments {
            let lines = segment::read_segment_lines(self.fs.as_ref(), &seg, &self.config.wal_dir()).await?;
            let Some(max_id) = lines.iter().map(|l| l.id).max() else { continue };
            if max_id <= snapshot.commit_id {
                self.fs.remove_file(&seg.path(&self.config.wal_dir())).await?;
            }
        }
        Ok(())
    }

    /// Runs a snapshot, recursively copies the storage directory, and opens
    /// a new store over the copy.
    pub async fn clone_to(self: &Arc<Self>, target_root: impl Into<PathBuf>) -> Result<Arc<Self>, WalError> {
        self.run_snapshot().await?;
        let target_root = target_root.into();
        self.fs.copy_tree(&self.config.root, &target_root).await?;

        let mut new_config = self.config.clone();
        new_config.root = target_root;
        let new_store = Arc::new(WalStorage::new(self.fs.clone(), new_config, self.now.clone()));
        new_store.initialize().await?;
        Ok(new_store)
    }

    pub async fn close(&self) -> Result<(), WalError> {
        self.abort.abort(Some(Arc::from("wal closing")));
        for task in self.workers.lock().drain(..) {
            task.abort();
        }
        self.run_snapshot().await?;
        self.run_cleanup().await?;
        Ok(())
    }

    pub fn begin(&self) -> Transaction<'_, F> {
        Transaction { store: self, ops: Vec::new() }
    }

    pub async fn set(
        &self,
        context: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<CommitId, WalError> {
        let mut txn = self.begin();
        txn.set(context, key, value);
        txn.commit().await
    }

    pub async fn delete(&self, context: impl Into<String>, key: impl Into<String>) -> Result<CommitId, WalError> {
        let mut txn = self.begin();
        txn.delete(context, key);
        txn.commit().await
    }

    pub async fn clear_all(&self, context: impl Into<String>) -> Result<CommitId, WalError> {
        let mut txn = self.begin();
        txn.clear_all(context);
        txn.commit().await
    }

    /// Blobs live as plain files under `<root>/blobs/<encoded-context>/<key>`
    /// (`spec.md` §4.10): not transactional, not replayed from the log, and
    /// not part of the in-memory cache.
    fn blob_path(&self, context: &ContextPath, key: &str) -> Result<PathBuf, WalError> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(WalError::InvalidBlobKey(key.to_string()));
        }
        Ok(self.config.blobs_dir().join(context.encoded()).join(key))
    }

    pub async fn put_blob(&self, context: &str, key: &str, data: &[u8]) -> Result<(), WalError> {
        let context = ContextPath::new(context)?;
        let path = self.blob_path(&context, key)?;
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).await?;
        }
        self.fs.write(&path, data).await
    }

    pub async fn get_blob(&self, context: &str, key: &str) -> Result<Option<Vec<u8>>, WalError> {
        let context = ContextPath::new(context)?;
        let path = self.blob_path(&context, key)?;
        if !self.fs.exists(&path).await {
            return Ok(None);
        }
        Ok(Some(self.fs.read(&path).await?))
    }

    pub async fn delete_blob(&self, context: &str, key: &str) -> Result<(), WalError> {
        let context = ContextPath::new(context)?;
        let path = self.blob_path(&context, key)?;
        if self.fs.exists(&path).await {
            self.fs.remove_file(&path).await?;
        }
        Ok(())
    }

    async fn commit_ops(&self, ops: Vec<Op>) -> Result<CommitId, WalError> {
        for op in &ops {
            op.validate_context()?;
        }

        let mut state = self.state.lock().await;
        let id = state.next_commit_id;
        let ts = (self.now)();
        let line = WalLine::from(CommitRecord { id, ts, ops });

        let active_path = self.config.wal_dir().join(state.active_segment.active_filename());
        segment::append_line(self.fs.as_ref(), &active_path, &line).await?;
        if self.config.fsync_on_commit {
            self.fs.fsync(&active_path).await?;
        }

        let line_len = serde_json::to_vec(&line).map(|v| v.len() as u64 + 1).unwrap_or(0);
        state.active_segment_size += line_len;
        state.next_commit_id = id.next();
        state.cache = None;

        if state.active_segment_size > self.config.max_segment_size {
            let rotated = state.active_segment;
            state.active_segment = SegmentId(rotated.0 + 1);
            state.active_segment_size = 0;

            if self.config.compress_rotated_segments {
                let fs = self.fs.clone();
                let wal_dir = self.config.wal_dir();
                tokio::spawn(async move {
                    if let Err(err) = segment::compress_segment(fs.as_ref(), &wal_dir, rotated).await {
                        log::warn!("failed to compress rotated wal segment {rotated:?}: {err}");
                    }
                });
            }
        }

        Ok(id)
    }

    async fn ensure_cache(&self) -> Result<(), WalError> {
        {
            let state = self.state.lock().await;
            if state.cache.is_some() {
                return Ok(());
            }
        }
        let cache = self.reconstruct(None, None).await?;
        let mut state = self.state.lock().await;
        state.cache = Some(cache);
        Ok(())
    }

    pub async fn get(&self, context: &str, key: &str) -> Result<Option<serde_json::Value>, WalError> {
        self.ensure_cache().await?;
        let state = self.state.lock().await;
        Ok(state.cache.as_ref().expect("ensured above").get(context, key).cloned())
    }

    pub async fn keys(&self, context: &str) -> Result<Vec<String>, WalError> {
        self.ensure_cache().await?;
        let state = self.state.lock().await;
        Ok(state.cache.as_ref().expect("ensured above").keys(context))
    }

    pub async fn values(&self, context: &str) -> Result<Vec<serde_json::Value>, WalError> {
        self.ensure_cache().await?;
        let state = self.state.lock().await;
        Ok(state.cache.as_ref().expect("ensured above").values(context))
    }

    pub async fn contexts(&self) -> Result<Vec<String>, WalError> {
        self.ensure_cache().await?;
        let state = self.state.lock().await;
        Ok(state.cache.as_ref().expect("ensured above").contexts())
    }

    /// Reconstructs a point-in-time snapshot by replaying from the base
    /// snapshot up to (but not including) the first commit whose
    /// `ts > ts`. Fails if `ts` predates the base snapshot.
    pub async fn snapshot_at_time(&self, ts: u64) -> Result<Cache, WalError> {
        self.reconstruct(Some(ts), None).await
    }

    /// As [`WalStorage::snapshot_at_time`], but bounded by commit id.
    pub async fn snapshot_at_commit(&self, commit_id: CommitId) -> Result<Cache, WalError> {
        self.reconstruct(None, Some(commit_id)).await
    }

    async fn reconstruct(
        &self,
        up_to_ts: Option<u64>,
        up_to_commit: Option<CommitId>,
    ) -> Result<Cache, WalError> {
        let snapshot_path = self.config.snapshot_path();
        let mut cache = if self.fs.exists(&snapshot_path).await {
            let snap =
                Snapshot::read(self.fs.as_ref(), &snapshot_path, self.config.compress_snapshots).await?;
            if let Some(ts) = up_to_ts {
                if ts < snap.ts {
                    return Err(WalError::TimestampBeforeBaseSnapshot);
                }
            }
            Cache::from_data(snap.data)
        } else {
            Cache::default()
        };

        let segments = segment::list_segments(self.fs.as_ref(), &self.config.wal_dir()).await?;
        'outer: for seg in &segments {
            let lines = segment::read_segment_lines(self.fs.as_ref(), seg, &self.config.wal_dir()).await?;
            for line in lines {
                if let Some(ts) = up_to_ts {
                    if line.commit.ts > ts {
                        break 'outer;
                    }
                }
                if let Some(id) = up_to_commit {
                    if line.id > id {
                        break 'outer;
                    }
                }
                for op in &line.commit.ops {
                    cache.apply(op);
                }
            }
        }

        Ok(cache)
    }
}

/// Buffers ops for one atomic commit record.
pub struct Transaction<'a, F: Filesystem> {
    store: &'a WalStorage<F>,
    ops: Vec<Op>,
}

impl<'a, F: Filesystem + 'static> Transaction<'a, F> {
    pub fn set(&mut self, context: impl Into<String>, key: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.ops.push(Op::Set { context: context.into(), key: key.into(), value });
        self
    }

    pub fn delete(&mut self, context: impl Into<String>, key: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Delete { context: context.into(), key: key.into() });
        self
    }

    pub fn clear_all(&mut self, context: impl Into<String>) -> &mut Self {
        self.ops.push(Op::ClearAll { context: context.into() });
        self
    }

    pub async fn commit(self) -> Result<CommitId, WalError> {
        self.store.commit_ops(self.ops).await
    }
}
