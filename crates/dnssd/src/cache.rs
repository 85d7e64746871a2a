//! DNS-SD name cache: one instance owns every name discovered on an mDNS
//! socket (`spec.md` §4.4).

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::name::{DnssdName, ObserverId};
use crate::record::{DecodedRecord, Record, RecordType};
use crate::scheduler::Scheduler;

const DEFAULT_GOODBYE_PROTECTION_WINDOW_MS: u64 = 1_000;
const DEFAULT_MIN_TTL_PTR_MS: u64 = 15_000;

/// The mDNS socket itself is an external collaborator (`spec.md` §1, §6);
/// this trait is only the shape a cache needs to pull a clock and drive its
/// scheduler.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

struct Inner {
    names: Arc<RwLock<HashMap<String, DnssdName>>>,
    scheduler: Scheduler,
    discovered_tx: broadcast::Sender<String>,
    next_observer_id: AtomicU64,
    goodbye_protection_window_ms: u64,
    min_ttl_ms: u64,
}

/// Owns every [`DnssdName`] discovered on one mDNS socket and the scheduler
/// that expires their records.
#[derive(Clone)]
pub struct NameCache {
    inner: Arc<Inner>,
}

impl NameCache {
    pub fn new(clock: impl Clock + Clone + 'static) -> Self {
        let (discovered_tx, _) = broadcast::channel(256);
        let names: Arc<RwLock<HashMap<String, DnssdName>>> =
            Arc::new(RwLock::new(HashMap::default()));

        let scheduler_names = names.clone();
        let scheduler_clock = clock.clone();
        let scheduler = Scheduler::spawn(
            move || scheduler_clock.now_ms(),
            move |qname, record_key, expires_at_ms| {
                let mut names = scheduler_names.write();
                if let Some(name) = names.get_mut(&qname) {
                    let still_current = name
                        .get(&record_key)
                        .map(|r| r.expires_at_ms == expires_at_ms)
                        .unwrap_or(false);
                    if still_current {
                        name.remove(&record_key);
                        if name.should_delete() {
                            names.remove(&qname);
                        }
                    }
                }
            },
        );

        let inner = Arc::new(Inner {
            names,
            scheduler,
            discovered_tx,
            next_observer_id: AtomicU64::new(1),
            goodbye_protection_window_ms: DEFAULT_GOODBYE_PROTECTION_WINDOW_MS,
            min_ttl_ms: DEFAULT_MIN_TTL_PTR_MS,
        });

        Self { inner }
    }

    pub fn subscribe_discovered(&self) -> broadcast::Receiver<String> {
        self.inner.discovered_tx.subscribe()
    }

    pub fn observer_id(&self) -> ObserverId {
        self.inner.next_observer_id.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub fn observe(&self, qname: &str, observer: ObserverId) {
        let qname = qname.to_lowercase();
        let mut names = self.inner.names.write();
        names
            .entry(qname.clone())
            .or_insert_with(|| DnssdName::new(qname))
            .observe(observer);
    }

    pub fn unobserve(&self, qname: &str, observer: ObserverId) {
        let qname = qname.to_lowercase();
        let mut names = self.inner.names.write();
        let should_delete = if let Some(name) = names.get_mut(&qname) {
            name.unobserve(observer);
            name.should_delete()
        } else {
            false
        };
        if should_delete {
            names.remove(&qname);
        }
    }

    pub fn with_name<R>(&self, qname: &str, f: impl FnOnce(Option<&DnssdName>) -> R) -> R {
        let qname = qname.to_lowercase();
        let names = self.inner.names.read();
        f(names.get(&qname))
    }

    /// Processes one batch of decoded mDNS answers/additional records
    /// (`spec.md` §4.4 steps 1-3).
    pub fn process(
        &self,
        records: Vec<DecodedRecord>,
        now_ms: u64,
        is_explicit: impl Fn(&DecodedRecord) -> bool,
    ) {
        let (mut explicit, mut implicit): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| is_explicit(r));

        for record in explicit.drain(..) {
            self.install_or_goodbye(record, now_ms);
        }

        // Pull in implicit records (typically A/AAAA for SRV targets)
        // whenever a qname they describe becomes referenced by an
        // already-known SRV target, repeating until a pass adds nothing.
        loop {
            let referenced = self.referenced_target_qnames();
            let mut progressed = false;
            let mut remaining = Vec::with_capacity(implicit.len());
            for record in implicit.drain(..) {
                if referenced.contains(&record.name.to_lowercase()) {
                    self.install_or_goodbye(record, now_ms);
                    progressed = true;
                } else {
                    remaining.push(record);
                }
            }
            implicit = remaining;
            if !progressed || implicit.is_empty() {
                break;
            }
        }
    }

    fn referenced_target_qnames(&self) -> ahash::HashSet<String> {
        let names = self.inner.names.read();
        let mut out = ahash::HashSet::default();
        for name in names.values() {
            for (target, _, _, _) in name.srv_targets() {
                out.insert(target.to_lowercase());
            }
        }
        out
    }

    fn install_or_goodbye(&self, record: DecodedRecord, now_ms: u64) {
        let qname = record.name.to_lowercase();

        if record.ttl_ms == 0 {
            self.handle_goodbye(&qname, record, now_ms);
            return;
        }

        let clamped_ttl = if record.value.record_type() == RecordType::Ptr {
            record.ttl_ms.max(self.inner.min_ttl_ms)
        } else {
            record.ttl_ms
        };
        let record = Record::new(
            DecodedRecord { ttl_ms: clamped_ttl, ..record },
            now_ms,
        );
        let key = record.key();
        let expires_at_ms = record.expires_at_ms;

        let mut names = self.inner.names.write();
        let name = names
            .entry(qname.clone())
            .or_insert_with(|| DnssdName::new(qname.clone()));
        let became_discovered = name.install(record);
        drop(names);

        self.inner.scheduler.schedule(qname.clone(), key, expires_at_ms);

        if became_discovered {
            let _ = self.inner.discovered_tx.send(qname);
        }
    }

    fn handle_goodbye(&self, qname: &str, record: DecodedRecord, now_ms: u64) {
        let key = {
            // Build a throwaway `Record` purely to compute its key; a
            // goodbye's own ttl is always 0 so this does not affect expiry.
            Record::new(DecodedRecord { ttl_ms: 0, ..record }, now_ms).key()
        };

        let mut names = self.inner.names.write();
        let Some(name) = names.get_mut(qname) else { return };
        let Some(existing) = name.get(&key) else { return };

        let discovered_at_ms = existing.expires_at_ms.saturating_sub(existing.ttl_ms);
        let goodbye_threshold_ms = now_ms.saturating_sub(self.inner.goodbye_protection_window_ms);

        if discovered_at_ms < goodbye_threshold_ms {
            name.remove(&key);
            if name.should_delete() {
                names.remove(qname);
            }
        } else {
            // Too recently discovered to honor an immediate goodbye; defer
            // the deletion until it ages past the protection window. This
            // runs on its own timer rather than the expiry scheduler, since
            // it must fire unconditionally rather than only when the
            // record's expiry is still the one that was scheduled.
            let delay_ms = (discovered_at_ms + self.inner.goodbye_protection_window_ms)
                .saturating_sub(now_ms);
            let inner = self.inner.clone();
            let qname = qname.to_string();
            drop(names);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                let mut names = inner.names.write();
                if let Some(name) = names.get_mut(&qname) {
                    name.remove(&key);
                    if name.should_delete() {
                        names.remove(&qname);
                    }
                }
            });
        }
    }
}
