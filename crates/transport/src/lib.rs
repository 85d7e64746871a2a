//! Message channel: wraps a raw byte [`Channel`] with session bookkeeping,
//! address tracking, and MRP delegation (`spec.md` §4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mrp::{ChannelType, Rng, SessionParameters};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transient communication error: {0}")]
    Transient(String),
    #[error("channel closed")]
    Closed,
}

impl error_kind::Classify for ChannelError {
    fn kind(&self) -> error_kind::ErrorKind {
        match self {
            ChannelError::Transient(_) => error_kind::ErrorKind::TransientPeerCommunication,
            ChannelError::Closed => error_kind::ErrorKind::PeerLifecycle,
        }
    }
}

/// The raw byte transport is an external collaborator (`spec.md` §1, §6):
/// this crate only ever moves bytes through it and watches for address
/// changes, never parses them.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError>;
    fn max_payload_size(&self) -> usize;
    fn channel_type(&self) -> ChannelType;
}

/// Opaque session identity this channel was opened under. Secure session
/// material and CASE/PASE bookkeeping are out of scope (`spec.md` §1); this
/// is a minimal stand-in so the orchestrator (C8) has something to hold.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub is_secure: bool,
}

struct Inner {
    channel: Arc<dyn Channel>,
    session: Session,
    reliable: bool,
    remote: watch::Sender<Option<SocketAddr>>,
    params: SessionParameters,
}

/// A message channel: the unit the peer connection orchestrator (C8) and
/// sustained subscription (C9) actually send and receive through.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<Inner>,
}

impl MessageChannel {
    pub fn new(
        channel: Arc<dyn Channel>,
        session: Session,
        reliable: bool,
        params: SessionParameters,
        initial_remote: Option<SocketAddr>,
    ) -> Self {
        let (remote, _) = watch::channel(initial_remote);
        Self {
            inner: Arc::new(Inner {
                channel,
                session,
                reliable,
                remote,
                params,
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    pub fn max_payload_size(&self) -> usize {
        self.inner.channel.max_payload_size()
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.inner.channel.send(data).await
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        *self.inner.remote.borrow()
    }

    /// Emits `network-address-changed` (as a watch update) when the remote
    /// endpoint of a UDP channel changes; the underlying socket is replaced
    /// in place by the caller, this channel only tracks where it now points.
    pub fn set_remote_address(&self, addr: SocketAddr) {
        if self.inner.channel.channel_type() != ChannelType::Udp {
            return;
        }
        let _ = self.inner.remote.send(Some(addr));
    }

    pub fn watch_remote_address(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.inner.remote.subscribe()
    }

    pub fn calculate_max_peer_response_time(
        &self,
        peer_active: bool,
        uses_mrp: bool,
        rng: &impl Rng,
    ) -> Result<std::time::Duration, mrp::UdpRequiresMrp> {
        mrp::max_peer_response_time(
            self.inner.channel.channel_type(),
            &self.inner.params,
            peer_active,
            uses_mrp,
            rng,
        )
    }

    pub fn get_mrp_backoff(
        &self,
        attempt: u32,
        peer_active: bool,
        max: bool,
        rng: &impl Rng,
    ) -> std::time::Duration {
        mrp::retransmission_interval(attempt, &self.inner.params, peer_active, max, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp::ThreadRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChannel {
        sent: AtomicUsize,
        kind: ChannelType,
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn send(&self, _data: &[u8]) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn max_payload_size(&self) -> usize {
            1200
        }

        fn channel_type(&self) -> ChannelType {
            self.kind
        }
    }

    #[tokio::test]
    async fn send_delegates_to_inner_channel() {
        let fake = Arc::new(FakeChannel {
            sent: AtomicUsize::new(0),
            kind: ChannelType::Udp,
        });
        let channel = MessageChannel::new(
            fake.clone(),
            Session { id: 1, is_secure: false },
            true,
            SessionParameters::default(),
            None,
        );
        channel.send(b"hello").await.unwrap();
        assert_eq!(fake.sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn udp_remote_address_change_is_observable() {
        let fake = Arc::new(FakeChannel {
            sent: AtomicUsize::new(0),
            kind: ChannelType::Udp,
        });
        let channel = MessageChannel::new(
            fake,
            Session { id: 1, is_secure: false },
            true,
            SessionParameters::default(),
            None,
        );
        let mut watcher = channel.watch_remote_address();
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        channel.set_remote_address(addr);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), Some(addr));
    }

    #[tokio::test]
    async fn tcp_channel_ignores_remote_address_updates() {
        let fake = Arc::new(FakeChannel {
            sent: AtomicUsize::new(0),
            kind: ChannelType::Tcp,
        });
        let channel = MessageChannel::new(
            fake,
            Session { id: 1, is_secure: false },
            true,
            SessionParameters::default(),
            None,
        );
        channel.set_remote_address("127.0.0.1:1234".parse().unwrap());
        assert_eq!(channel.remote_address(), None);
    }

    #[tokio::test]
    async fn max_peer_response_time_delegates_to_mrp() {
        let fake = Arc::new(FakeChannel {
            sent: AtomicUsize::new(0),
            kind: ChannelType::Udp,
        });
        let channel = MessageChannel::new(
            fake,
            Session { id: 1, is_secure: false },
            true,
            SessionParameters::default(),
            None,
        );
        let got = channel
            .calculate_max_peer_response_time(true, true, &ThreadRng)
            .unwrap();
        assert!(got > std::time::Duration::ZERO);
    }
}
