//! DNS-SD record cache, expiration scheduler, and IP address flattening
//! (`spec.md` §4.4, §4.5).
//!
//! The mDNS socket and DNS wire codec live outside this crate: callers feed
//! decoded records in and read [`record::DecodedRecord`] as the boundary
//! type.

pub mod cache;
pub mod ip_service;
pub mod name;
pub mod record;
pub mod scheduler;

pub use cache::{Clock, NameCache, SystemClock};
pub use ip_service::{AddressChange, AddressChanges, IpService};
pub use name::{DnssdName, ObserverId};
pub use record::{DecodedRecord, Record, RecordType, RecordValue};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct TestClock(Arc<AtomicU64>);

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn srv(name: &str, target: &str, port: u16) -> DecodedRecord {
        DecodedRecord {
            name: name.to_string(),
            value: RecordValue::Srv {
                target: target.to_string(),
                port,
                priority: 0,
                weight: 0,
            },
            ttl_ms: 120_000,
        }
    }

    fn a(name: &str, ip: Ipv4Addr) -> DecodedRecord {
        DecodedRecord {
            name: name.to_string(),
            value: RecordValue::A(IpAddr::V4(ip)),
            ttl_ms: 120_000,
        }
    }

    #[tokio::test]
    async fn discovered_fires_on_first_record_and_ip_service_flattens() {
        let clock = TestClock(Arc::new(AtomicU64::new(1_000)));
        let cache = NameCache::new(clock);
        let mut discovered = cache.subscribe_discovered();

        cache.process(
            vec![
                srv("_matter._udp.local", "node1.local", 5540),
                a("node1.local", Ipv4Addr::new(10, 0, 0, 5)),
            ],
            1_000,
            |_| true,
        );

        let name = discovered.try_recv().expect("discovered event");
        assert_eq!(name, "_matter._udp.local");

        let service = IpService::new(cache, "_matter._udp.local");
        service.refresh();
        assert_eq!(service.addresses().size(), 1);
        assert!(service.is_reachable());
    }

    #[tokio::test]
    async fn name_auto_deletes_when_unobserved_and_empty() {
        let clock = TestClock(Arc::new(AtomicU64::new(0)));
        let cache = NameCache::new(clock);
        let observer = cache.observer_id();
        cache.observe("x.local", observer);
        cache.unobserve("x.local", observer);

        cache.with_name("x.local", |name| assert!(name.is_none()));
    }

    #[tokio::test]
    async fn goodbye_with_zero_ttl_schedules_deletion() {
        let clock = TestClock(Arc::new(AtomicU64::new(10_000)));
        let cache = NameCache::new(clock);
        cache.process(
            vec![a("old.local", Ipv4Addr::new(1, 1, 1, 1))],
            0,
            |_| true,
        );
        cache.with_name("old.local", |name| {
            assert!(name.unwrap().get("A|1.1.1.1").is_some());
        });

        // Goodbye arrives long after discovery: past the protection window,
        // so it is honored immediately.
        let goodbye = DecodedRecord {
            name: "old.local".to_string(),
            value: RecordValue::A(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
            ttl_ms: 0,
        };
        cache.process(vec![goodbye], 10_000, |_| true);
        cache.with_name("old.local", |name| assert!(name.is_none()));
    }
}
