//! Error classification for a single connection attempt (`spec.md` §4.8
//! step 9, §7).

use std::time::Duration;

use error_kind::{Classify, ErrorKind};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// `channel-status-response` with general=busy and an explicit delay.
    #[error("peer busy, retry after {busy_delay:?}")]
    Busy { busy_delay: Duration },
    /// `channel-status-response` with protocol=no-shared-trust-roots; `true`
    /// when the local resumption record had already been deleted, in which
    /// case the caller should retry immediately rather than backing off.
    #[error("no shared trust roots (resumption deleted: {resumption_deleted})")]
    NoSharedTrustRoots { resumption_deleted: bool },
    /// Any other `channel-status-response`.
    #[error("channel status response: {0}")]
    ChannelStatus(String),
    /// Transient network-level failure (timeout, connection reset, …).
    #[error("transient communication error: {0}")]
    Transient(String),
    /// Anything not classified above; logged in full by the caller.
    #[error("unhandled error: {0}")]
    Unhandled(String),
}

impl Classify for ConnectError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Busy { .. } => ErrorKind::ChannelStatusResponse,
            ConnectError::NoSharedTrustRoots { .. } => ErrorKind::ChannelStatusResponse,
            ConnectError::ChannelStatus(_) => ErrorKind::ChannelStatusResponse,
            ConnectError::Transient(_) => ErrorKind::TransientPeerCommunication,
            ConnectError::Unhandled(_) => ErrorKind::Implementation,
        }
    }
}
