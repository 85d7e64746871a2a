//! Peer connection orchestrator and sustained subscription reconnect loop
//! (`spec.md` §4.8, §4.9).

pub mod descriptor;
pub mod error;
pub mod orchestrator;
pub mod subscription;

pub use descriptor::{PeerAddress, PeerDescriptor, PeerStatus};
pub use error::ConnectError;
pub use orchestrator::{CaseInitiator, PeerConnector, Timing};
pub use subscription::{default_retry_params, ActiveSubscription, SubscriptionBackend, SustainedSubscription};

#[cfg(test)]
mod tests {
    use super::*;
    use abort::Abort;
    use async_trait::async_trait;
    use dnssd::{Clock, IpService, NameCache};
    use net_address::ServerAddress;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;
    use transport::Session;

    #[derive(Clone)]
    struct TestClock;
    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            0
        }
    }

    struct AlwaysSucceedsCase {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl CaseInitiator for AlwaysSucceedsCase {
        async fn pair(
            &self,
            _address: &ServerAddress,
            _abort: &Abort,
            _initial_retransmission_time: Option<Duration>,
        ) -> Result<Session, ConnectError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Ok(Session { id: 1, is_secure: true })
        }
    }

    #[tokio::test]
    async fn connects_via_fallback_when_nothing_discovered() {
        let cache = NameCache::new(TestClock);
        let ip_service = IpService::new(cache, "node1._matter._udp.local");

        let mut descriptor = PeerDescriptor::new(PeerAddress { fabric_index: 1, node_id: 42 });
        descriptor.operational_address =
            Some(ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5540));

        let case = Arc::new(AlwaysSucceedsCase { attempts: AtomicU32::new(0) });
        let connector = PeerConnector::new(case.clone(), Timing::default(), Arc::new(Semaphore::new(4)));

        let abort = Abort::new();
        let session = connector.connect(&mut descriptor, ip_service, abort.clone()).await;
        abort.close();

        assert!(session.is_some());
        assert_eq!(descriptor.status, PeerStatus::Reachable);
        assert!(case.attempts.load(Ordering::Relaxed) >= 1);
    }

    struct AlwaysClosedSubscription {
        id: AtomicU64,
    }

    #[async_trait]
    impl ActiveSubscription for AlwaysClosedSubscription {
        fn subscription_id(&self) -> u64 {
            self.id.load(Ordering::Relaxed)
        }
        fn max_interval(&self) -> Duration {
            Duration::from_secs(60)
        }
        fn interaction_model_revision(&self) -> u16 {
            1
        }
        async fn closed(&self) {
            std::future::pending::<()>().await;
        }
    }

    struct OneShotBackend {
        subscribed: AtomicU32,
    }

    #[async_trait]
    impl SubscriptionBackend for OneShotBackend {
        async fn probe(&self, _abort: &Abort) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn bootstrap_read(&self, _abort: &Abort) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn subscribe(&self, _abort: &Abort) -> Result<Arc<dyn ActiveSubscription>, ConnectError> {
            self.subscribed.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(AlwaysClosedSubscription { id: AtomicU64::new(7) }))
        }
    }

    #[tokio::test]
    async fn subscription_becomes_active_after_first_connect() {
        let backend = Arc::new(OneShotBackend { subscribed: AtomicU32::new(0) });
        let sub = Arc::new(SustainedSubscription::new(backend.clone()));
        let abort = Abort::with_options(abort::AbortOptions {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let runner = sub.clone();
        let run_abort = abort.clone();
        let handle = tokio::spawn(async move { runner.run(&run_abort).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.is_active());
        assert_eq!(sub.subscription_id(), 7);

        let _ = handle.await;
        abort.close();
    }

    struct RecordingCase {
        calls: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl CaseInitiator for RecordingCase {
        async fn pair(
            &self,
            address: &ServerAddress,
            _abort: &Abort,
            _initial_retransmission_time: Option<Duration>,
        ) -> Result<Session, ConnectError> {
            self.calls.lock().push((address.url(), Instant::now()));
            std::future::pending::<Result<Session, ConnectError>>().await
        }
    }

    #[tokio::test]
    async fn staggered_addresses_are_tried_in_desirability_order_with_a_gap() {
        let cache = NameCache::new(TestClock);
        let ip_service = IpService::new(cache, "node2._matter._udp.local");

        let mut preferred = ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5540);
        preferred.selection_preference = 0;
        let mut secondary = ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 5540);
        secondary.selection_preference = 1;
        let preferred_url = preferred.url();
        let secondary_url = secondary.url();
        ip_service.addresses().add(preferred);
        ip_service.addresses().add(secondary);

        let mut descriptor = PeerDescriptor::new(PeerAddress { fabric_index: 1, node_id: 43 });
        let case = Arc::new(RecordingCase { calls: Mutex::new(Vec::new()) });
        let timing = Timing { delay_before_next_address: Duration::from_millis(150), ..Timing::default() };
        let connector = PeerConnector::new(case.clone(), timing, Arc::new(Semaphore::new(4)));

        let abort = Abort::new();
        let connector_abort = abort.clone();
        let handle = tokio::spawn(async move {
            connector.connect(&mut descriptor, ip_service, connector_abort).await
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        abort.abort(Some(Arc::from("test complete")));
        let _ = handle.await;
        abort.close();

        let calls = case.calls.lock();
        assert_eq!(calls.len(), 2, "expected both addresses to have been tried exactly once");
        assert_eq!(calls[0].0, preferred_url, "the more desirable address should be tried first");
        assert_eq!(calls[1].0, secondary_url);
        assert!(
            calls[1].1.duration_since(calls[0].1) >= Duration::from_millis(100),
            "the second address should not start until delay_before_next_address has elapsed"
        );
    }

    struct RaceCase {
        addresses_seen: Mutex<Vec<String>>,
        winner_url: String,
    }

    #[async_trait]
    impl CaseInitiator for RaceCase {
        async fn pair(
            &self,
            address: &ServerAddress,
            abort: &Abort,
            _initial_retransmission_time: Option<Duration>,
        ) -> Result<Session, ConnectError> {
            self.addresses_seen.lock().push(address.url());
            if address.url() == self.winner_url {
                return Ok(Session { id: 1, is_secure: true });
            }
            // The loser should be aborted by the winner well before this
            // sleep elapses; if it isn't, `connect()` below will take ~10s
            // and the assertion on its elapsed time will catch it.
            match abort.race(tokio::time::sleep(Duration::from_secs(10))).await {
                None => Err(ConnectError::Transient("aborted".into())),
                Some(()) => Err(ConnectError::Unhandled("should have been aborted".into())),
            }
        }
    }

    #[tokio::test]
    async fn winning_attempt_aborts_its_sibling_before_connect_returns() {
        let cache = NameCache::new(TestClock);
        let ip_service = IpService::new(cache, "node3._matter._udp.local");

        let mut first = ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)), 5540);
        first.selection_preference = 0;
        let mut second = ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 5540);
        second.selection_preference = 1;
        let winner_url = second.url();
        ip_service.addresses().add(first);
        ip_service.addresses().add(second);

        let mut descriptor = PeerDescriptor::new(PeerAddress { fabric_index: 1, node_id: 44 });
        let case = Arc::new(RaceCase { addresses_seen: Mutex::new(Vec::new()), winner_url });
        let timing = Timing { delay_before_next_address: Duration::from_millis(30), ..Timing::default() };
        let connector = PeerConnector::new(case.clone(), timing, Arc::new(Semaphore::new(4)));

        let abort = Abort::new();
        let started = Instant::now();
        let session = connector.connect(&mut descriptor, ip_service, abort.clone()).await;
        let elapsed = started.elapsed();
        abort.close();

        assert!(session.is_some());
        assert!(
            elapsed < Duration::from_secs(2),
            "connect() should not have waited for the loser's 10s sleep; took {elapsed:?}"
        );
        assert_eq!(case.addresses_seen.lock().len(), 2, "both addresses should have been attempted");
    }

    struct BusyThenSucceedsCase {
        calls: Mutex<Vec<Instant>>,
        attempt: AtomicU32,
    }

    #[async_trait]
    impl CaseInitiator for BusyThenSucceedsCase {
        async fn pair(
            &self,
            _address: &ServerAddress,
            _abort: &Abort,
            _initial_retransmission_time: Option<Duration>,
        ) -> Result<Session, ConnectError> {
            self.calls.lock().push(Instant::now());
            if self.attempt.fetch_add(1, Ordering::Relaxed) == 0 {
                Err(ConnectError::Busy { busy_delay: Duration::from_millis(200) })
            } else {
                Ok(Session { id: 2, is_secure: true })
            }
        }
    }

    #[tokio::test]
    async fn busy_result_delays_the_next_retry_by_at_least_busy_delay() {
        let cache = NameCache::new(TestClock);
        let ip_service = IpService::new(cache, "node4._matter._udp.local");

        let mut descriptor = PeerDescriptor::new(PeerAddress { fabric_index: 1, node_id: 45 });
        descriptor.operational_address =
            Some(ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)), 5540));

        let case = Arc::new(BusyThenSucceedsCase { calls: Mutex::new(Vec::new()), attempt: AtomicU32::new(0) });
        let timing = Timing { delay_after_network_error: Duration::from_millis(50), ..Timing::default() };
        let connector = PeerConnector::new(case.clone(), timing, Arc::new(Semaphore::new(4)));

        let abort = Abort::new();
        let session = connector.connect(&mut descriptor, ip_service, abort.clone()).await;
        abort.close();

        assert!(session.is_some());
        let calls = case.calls.lock();
        assert_eq!(calls.len(), 2, "expected a busy reply followed by a retry");
        assert!(
            calls[1].duration_since(calls[0]) >= Duration::from_millis(200),
            "retry after a Busy result should not happen before busy_delay elapses"
        );
    }
}
