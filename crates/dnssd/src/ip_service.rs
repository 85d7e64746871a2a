//! Flattens one DNS-SD name's SRV targets to UDP addresses (`spec.md` §4.5).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::HashMap;
use net_address::{AddressSet, ServerAddress};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::cache::NameCache;
use crate::record::RecordValue;

#[derive(Debug, Clone)]
struct TargetEntry {
    service_name: String,
    port: u16,
    priority: u16,
    weight: u16,
}

struct Inner {
    qname: String,
    cache: NameCache,
    targets: RwLock<HashMap<String, TargetEntry>>,
    addresses: AddressSet,
    reachable: AtomicBool,
    changed_tx: watch::Sender<u64>,
    changed_version: std::sync::atomic::AtomicU64,
}

/// A higher-level view over one [`NameCache`] name: its SRV targets, and for
/// each target its A/AAAA addresses, flattened into an [`AddressSet`] of
/// `udp(ip, port)` entries.
#[derive(Clone)]
pub struct IpService {
    inner: Arc<Inner>,
}

impl IpService {
    pub fn new(cache: NameCache, qname: impl Into<String>) -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                qname: qname.into().to_lowercase(),
                cache,
                targets: RwLock::new(HashMap::default()),
                addresses: AddressSet::new(),
                reachable: AtomicBool::new(false),
                changed_tx,
                changed_version: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    pub fn addresses(&self) -> &AddressSet {
        &self.inner.addresses
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(AtomicOrdering::Relaxed)
    }

    pub fn watch_changed(&self) -> watch::Receiver<u64> {
        self.inner.changed_tx.subscribe()
    }

    /// Re-derives this service's target and address state from the current
    /// contents of its underlying name. Intended to be called by the owner
    /// of the [`NameCache`] whenever that name's `discovered` event fires
    /// for this qname, and on a steady poll otherwise (the cache itself
    /// carries no per-record-type change notifications beyond
    /// `discovered`).
    pub fn refresh(&self) {
        let qname = self.inner.qname.clone();
        let mut new_targets: HashMap<String, TargetEntry> = HashMap::default();
        let mut a_records: HashMap<String, Vec<IpAddr>> = HashMap::default();

        self.inner.cache.with_name(&qname, |name| {
            let Some(name) = name else { return };
            for (target, port, priority, weight) in name.srv_targets() {
                new_targets.insert(
                    format!("{target}:{port}"),
                    TargetEntry {
                        service_name: target.to_string(),
                        port,
                        priority,
                        weight,
                    },
                );
            }
        });

        for entry in new_targets.values() {
            let target_qname = entry.service_name.to_lowercase();
            self.inner.cache.with_name(&target_qname, |target_name| {
                let Some(target_name) = target_name else { return };
                let ips: Vec<IpAddr> = target_name
                    .records()
                    .filter_map(|r| match &r.value {
                        RecordValue::A(ip) | RecordValue::Aaaa(ip) => Some(*ip),
                        _ => None,
                    })
                    .collect();
                a_records.insert(entry.service_name.clone(), ips);
            });
        }

        *self.inner.targets.write() = new_targets.clone();

        let mut flattened = Vec::new();
        for entry in new_targets.values() {
            for ip in a_records.get(&entry.service_name).into_iter().flatten() {
                let mut addr = ServerAddress::udp(*ip, entry.port);
                addr.selection_preference = entry.priority as u32;
                addr.health.priority = Some(entry.weight as u32);
                flattened.push(addr);
            }
        }

        let had_any = self.inner.addresses.size() > 0;
        self.inner.addresses.replace(flattened);
        let has_any = self.inner.addresses.size() > 0;

        if !had_any && has_any {
            self.inner.reachable.store(true, AtomicOrdering::Relaxed);
        }

        let version = self.inner.changed_version.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let _ = self.inner.changed_tx.send(version);
    }
}

/// One element of an [`IpService::address_changes`] delta.
#[derive(Debug, Clone)]
pub enum AddressChange {
    Add(Arc<ServerAddress>),
    Delete(Arc<ServerAddress>),
}

impl IpService {
    /// Begins a diff-based walk of this service's address changes, starting
    /// from an empty baseline (so the first `next()` call emits every
    /// currently-known address as an addition).
    pub fn address_changes(&self) -> AddressChanges {
        AddressChanges {
            service: self.clone(),
            rx: self.watch_changed(),
            last: HashMap::default(),
        }
    }
}

/// Cursor produced by [`IpService::address_changes`]. Each call to `next`
/// emits a full delta (deletions before additions) from the last-emitted
/// snapshot, then waits for the next `changed` signal or abort before
/// computing the next one. A mutation observed while still diffing simply
/// means the next snapshot already reflects it — there is no partial delta
/// to unwind, since every `next()` call reads one atomic snapshot.
pub struct AddressChanges {
    service: IpService,
    rx: watch::Receiver<u64>,
    last: HashMap<String, Arc<ServerAddress>>,
}

impl AddressChanges {
    pub async fn next(&mut self, abort: &abort::Abort) -> Option<Vec<AddressChange>> {
        loop {
            let snapshot: Vec<_> = self.service.inner.addresses.walk().collect();
            let mut next: HashMap<String, Arc<ServerAddress>> = HashMap::default();
            for addr in &snapshot {
                next.insert(addr.url(), addr.clone());
            }

            let mut deletions = Vec::new();
            for (key, addr) in &self.last {
                if !next.contains_key(key) {
                    deletions.push(AddressChange::Delete(addr.clone()));
                }
            }
            let mut additions = Vec::new();
            for (key, addr) in &next {
                if !self.last.contains_key(key) {
                    additions.push(AddressChange::Add(addr.clone()));
                }
            }

            self.last = next;

            if !deletions.is_empty() || !additions.is_empty() {
                deletions.extend(additions);
                return Some(deletions);
            }

            abort.race(self.rx.changed()).await?.ok()?;
        }
    }
}
