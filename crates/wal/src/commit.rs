//! Commit ids, ops, and records (`spec.md` §3, §6).

use serde::{Deserialize, Serialize};

use crate::key::ContextPath;

/// Strictly monotonic, totally ordered commit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(pub u64);

impl CommitId {
    pub const ZERO: CommitId = CommitId(0);

    pub fn next(self) -> CommitId {
        CommitId(self.0 + 1)
    }
}

/// `compare-commit-ids` (`spec.md` §3) — kept as a named function alongside
/// `Ord` so call sites reading `spec.md` find a literal match.
pub fn compare_commit_ids(a: CommitId, b: CommitId) -> std::cmp::Ordering {
    a.cmp(&b)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Op {
    Set { context: String, key: String, value: serde_json::Value },
    Delete { context: String, key: String },
    ClearAll { context: String },
}

impl Op {
    pub fn context(&self) -> &str {
        match self {
            Op::Set { context, .. } | Op::Delete { context, .. } | Op::ClearAll { context } => context,
        }
    }

    pub fn validate_context(&self) -> Result<(), crate::key::KeyError> {
        ContextPath::new(self.context().to_string()).map(|_| ())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub ts: u64,
    pub ops: Vec<Op>,
}

/// One line of a WAL segment file: `{id, commit: {ts, ops}}`
/// (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalLine {
    pub id: CommitId,
    pub commit: CommitBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitBody {
    pub ts: u64,
    pub ops: Vec<Op>,
}

impl From<CommitRecord> for WalLine {
    fn from(record: CommitRecord) -> Self {
        WalLine {
            id: record.id,
            commit: CommitBody { ts: record.ts, ops: record.ops },
        }
    }
}

impl From<WalLine> for CommitRecord {
    fn from(line: WalLine) -> Self {
        CommitRecord { id: line.id, ts: line.commit.ts, ops: line.commit.ops }
    }
}
