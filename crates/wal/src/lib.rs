//! A transactional, write-ahead-logged key/value store (`spec.md` §4.10).
//!
//! Commits are appended as JSON lines to rotating segment files; a
//! periodic snapshot lets replay start from a recent base instead of the
//! beginning of time. Everything talks to storage through the
//! [`fs::Filesystem`] trait so tests run against an in-memory or
//! `tempfile` backed tree rather than the real disk.

pub mod commit;
pub mod error;
pub mod fs;
pub mod key;
pub mod segment;
pub mod snapshot;
pub mod store;
#[allow(clippy::module_inception)]
mod wal;

pub use commit::{compare_commit_ids, CommitId, CommitRecord, Op};
pub use error::WalError;
pub use fs::{Filesystem, TokioFilesystem};
pub use key::ContextPath;
pub use segment::{SegmentFile, SegmentId};
pub use snapshot::Snapshot;
pub use store::Cache;
pub use wal::{Transaction, WalConfig, WalStorage, DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SNAPSHOT_INTERVAL};
