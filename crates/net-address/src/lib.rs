//! Ordered, de-duplicated set of peer network addresses (`spec.md` §3, §4.3).
//!
//! `AddressSet` is the shared building block under both the DNS-SD IP
//! service (C5) and the peer connection orchestrator (C8): discovery feeds
//! it, connection attempts walk it in desirability order.

use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::HashMap;
use parking_lot::RwLock;

/// The transport-identifying part of a [`ServerAddress`]. Equality between
/// two addresses only ever compares this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp { ip: IpAddr, port: u16 },
    Ble { peripheral_id: String },
}

impl Transport {
    /// The key an address is interned under in an [`AddressSet`].
    pub fn url(&self) -> String {
        match self {
            Transport::Udp { ip, port } => format!("udp://{ip}:{port}"),
            Transport::Ble { peripheral_id } => format!("ble://{peripheral_id}"),
        }
    }
}

/// How long ago an address was discovered, and how long the discovery is
/// valid for.
#[derive(Debug, Clone, Copy)]
pub struct Lifespan {
    pub discovered_at_ms: u64,
    pub ttl: Duration,
}

impl Lifespan {
    pub fn expires_at_ms(&self) -> u64 {
        self.discovered_at_ms + self.ttl.as_millis() as u64
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// Observed reachability history for an address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Health {
    pub healthy_at_ms: Option<u64>,
    pub unhealthy_at_ms: Option<u64>,
    /// Application-assigned priority; higher wins ties left after
    /// selection-preference and health.
    pub priority: Option<u32>,
}

enum HealthStatus {
    Healthy(u64),
    Unhealthy(u64),
    Untested,
}

impl Health {
    fn status(&self) -> HealthStatus {
        match (self.healthy_at_ms, self.unhealthy_at_ms) {
            (Some(h), None) => HealthStatus::Healthy(h),
            (None, Some(u)) => HealthStatus::Unhealthy(u),
            (Some(h), Some(u)) if h >= u => HealthStatus::Healthy(h),
            (Some(_), Some(u)) => HealthStatus::Unhealthy(u),
            (None, None) => HealthStatus::Untested,
        }
    }
}

/// A peer network address: either a UDP endpoint or a BLE peripheral,
/// optionally annotated with discovery lifespan and health history.
///
/// `selection_preference` is the lower-is-better routing preference an IP
/// service seeds from a discovered SRV record's priority field; it is
/// compared before health and the explicit `priority` field (`spec.md`
/// §4.3's ordering rule (a)).
#[derive(Debug, Clone)]
pub struct ServerAddress {
    pub transport: Transport,
    pub selection_preference: u32,
    pub lifespan: Option<Lifespan>,
    pub health: Health,
}

impl ServerAddress {
    pub fn udp(ip: IpAddr, port: u16) -> Self {
        Self {
            transport: Transport::Udp { ip, port },
            selection_preference: 0,
            lifespan: None,
            health: Health::default(),
        }
    }

    pub fn ble(peripheral_id: impl Into<String>) -> Self {
        Self {
            transport: Transport::Ble {
                peripheral_id: peripheral_id.into(),
            },
            selection_preference: 0,
            lifespan: None,
            health: Health::default(),
        }
    }

    pub fn url(&self) -> String {
        self.transport.url()
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport
    }
}
impl Eq for ServerAddress {}

/// Compares two addresses by desirability: `Ordering::Less` means `a` should
/// be walked before `b`.
pub fn desirability_cmp(a: &ServerAddress, b: &ServerAddress) -> Ordering {
    match a.selection_preference.cmp(&b.selection_preference) {
        Ordering::Equal => {}
        other => return other,
    }

    match health_cmp(&a.health, &b.health) {
        Ordering::Equal => {}
        other => return other,
    }

    // Higher priority wins, so compare in reverse.
    b.health
        .priority
        .unwrap_or(0)
        .cmp(&a.health.priority.unwrap_or(0))
}

fn health_cmp(a: &Health, b: &Health) -> Ordering {
    use HealthStatus::*;
    match (a.status(), b.status()) {
        (Healthy(at_a), Healthy(at_b)) => at_b.cmp(&at_a),
        (Unhealthy(at_a), Unhealthy(at_b)) => at_a.cmp(&at_b),
        (Healthy(_), _) => Ordering::Less,
        (_, Healthy(_)) => Ordering::Greater,
        (Untested, Unhealthy(_)) => Ordering::Less,
        (Unhealthy(_), Untested) => Ordering::Greater,
        (Untested, Untested) => Ordering::Equal,
    }
}

struct Inner {
    entries: HashMap<String, Arc<ServerAddress>>,
    version: u64,
}

/// Ordered, de-duplicated, versioned set of server addresses.
///
/// Mutations bump an internal version counter; [`AddressSet::walk`] returns
/// a cursor whose `next()` restarts from the newly-sorted order whenever it
/// observes a mutation mid-walk, while never re-yielding a key it has
/// already produced in the current walk.
#[derive(Clone)]
pub struct AddressSet {
    inner: Arc<RwLock<Inner>>,
}

impl Default for AddressSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: HashMap::default(),
                version: 0,
            })),
        }
    }

    /// Inserts `addr` if its URL is not already present; returns the
    /// interned instance either way (the existing one if it was already
    /// present, matching `spec.md`'s "returns the interned instance if
    /// already present").
    pub fn add(&self, addr: ServerAddress) -> Arc<ServerAddress> {
        let mut inner = self.inner.write();
        let key = addr.url();
        if let Some(existing) = inner.entries.get(&key) {
            return existing.clone();
        }
        let arc = Arc::new(addr);
        inner.entries.insert(key, arc.clone());
        inner.version += 1;
        arc
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(key).is_some();
        if removed {
            inner.version += 1;
        }
        removed
    }

    /// Replaces the full contents with `inputs`, preserving the `Arc`
    /// identity of any address whose URL is present in both the old and new
    /// sets.
    pub fn replace(&self, inputs: Vec<ServerAddress>) {
        let mut inner = self.inner.write();
        let mut next = HashMap::default();
        for addr in inputs {
            let key = addr.url();
            let arc = match inner.entries.get(&key) {
                Some(existing) => existing.clone(),
                None => Arc::new(addr),
            };
            next.insert(key, arc);
        }
        inner.entries = next;
        inner.version += 1;
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<ServerAddress>> {
        self.inner.read().entries.get(key).cloned()
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    fn sorted_snapshot(&self) -> Vec<Arc<ServerAddress>> {
        let inner = self.inner.read();
        let mut items: Vec<_> = inner.entries.values().cloned().collect();
        items.sort_by(|a, b| desirability_cmp(a, b));
        items
    }

    /// Begins a walk of the set in desirability order.
    pub fn walk(&self) -> DesirabilityWalk {
        DesirabilityWalk {
            set: self.clone(),
            yielded: Default::default(),
        }
    }
}

/// Cursor over an [`AddressSet`] that tolerates concurrent mutation.
pub struct DesirabilityWalk {
    set: AddressSet,
    yielded: ahash::HashSet<String>,
}

impl Iterator for DesirabilityWalk {
    type Item = Arc<ServerAddress>;

    fn next(&mut self) -> Option<Self::Item> {
        // Recomputing on every call is what gives us "restart from the
        // beginning if a mutation happened between yields": the sort order
        // always reflects the latest version, and `yielded` guarantees we
        // never produce the same key twice in one walk.
        for addr in self.set.sorted_snapshot() {
            let key = addr.url();
            if !self.yielded.contains(&key) {
                self.yielded.insert(key);
                return Some(addr);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> ServerAddress {
        ServerAddress::udp(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn add_dedupes_by_url_and_interns() {
        let set = AddressSet::new();
        let a1 = set.add(addr(1));
        let a2 = set.add(addr(1));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn iterates_in_desirability_order() {
        let set = AddressSet::new();
        let mut low = addr(1);
        low.selection_preference = 5;
        let mut high = addr(2);
        high.selection_preference = 1;
        set.add(low);
        set.add(high);

        let got: Vec<_> = set.walk().map(|a| a.url()).collect();
        assert_eq!(got, vec!["udp://127.0.0.1:2".to_string(), "udp://127.0.0.1:1".to_string()]);
    }

    #[test]
    fn walk_never_repeats_a_key_even_after_mutation() {
        let set = AddressSet::new();
        set.add(addr(1));
        set.add(addr(2));

        let mut walk = set.walk();
        let first = walk.next().unwrap();
        // Mutate mid-walk: add a higher-priority address.
        let mut higher = addr(3);
        higher.selection_preference = 0;
        set.add(higher);

        let mut remaining: Vec<_> = walk.by_ref().map(|a| a.url()).collect();
        remaining.sort();
        assert!(!remaining.contains(&first.url()));
        assert!(walk.next().is_none());
    }

    #[test]
    fn replace_preserves_identity_for_addresses_in_both_sets() {
        let set = AddressSet::new();
        let original = set.add(addr(1));
        set.replace(vec![addr(1), addr(2)]);
        let after = set.get("udp://127.0.0.1:1").unwrap();
        assert!(Arc::ptr_eq(&original, &after));
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn healthy_beats_untested_beats_unhealthy() {
        let mut healthy = addr(1);
        healthy.health.healthy_at_ms = Some(100);
        let untested = addr(2);
        let mut unhealthy = addr(3);
        unhealthy.health.unhealthy_at_ms = Some(50);

        let mut items = vec![unhealthy, untested, healthy];
        items.sort_by(desirability_cmp);
        let ports: Vec<_> = items
            .iter()
            .map(|a| match a.transport {
                Transport::Udp { port, .. } => port,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ports, vec![1, 2, 3]);
    }
}
