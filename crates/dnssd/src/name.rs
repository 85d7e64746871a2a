//! A single DNS-SD name's record and observer bookkeeping (`spec.md` §3,
//! §4.4).

use ahash::{HashMap, HashSet};

use crate::record::{Record, RecordValue};

/// An opaque observer handle. The cache issues these and uses them only to
/// test set membership; callers are expected to wrap whatever dispatch
/// mechanism (channel, callback) they need behind one.
pub type ObserverId = u64;

/// One DNS-SD name: a qname (already lowercased), its installed records
/// keyed by `record-key`, a flattened TXT parameter map, and its current
/// observers.
#[derive(Debug, Default)]
pub struct DnssdName {
    pub qname: String,
    records: HashMap<String, Record>,
    pub parameters: HashMap<String, String>,
    observers: HashSet<ObserverId>,
}

impl DnssdName {
    pub fn new(qname: impl Into<String>) -> Self {
        Self {
            qname: qname.into().to_lowercase(),
            records: HashMap::default(),
            parameters: HashMap::default(),
            observers: HashSet::default(),
        }
    }

    pub fn is_empty_of_records(&self) -> bool {
        self.records.is_empty()
    }

    /// A name is deleted once its observer set is empty and its record map
    /// is empty.
    pub fn should_delete(&self) -> bool {
        self.observers.is_empty() && self.records.is_empty()
    }

    pub fn observe(&mut self, id: ObserverId) {
        self.observers.insert(id);
    }

    pub fn unobserve(&mut self, id: ObserverId) {
        self.observers.remove(&id);
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Installs `record`, returning `true` if the name transitioned from
    /// empty-records to non-empty (the `discovered` trigger condition).
    pub fn install(&mut self, record: Record) -> bool {
        let was_empty = self.records.is_empty();
        if let RecordValue::Txt(pairs) = &record.value {
            for (k, v) in pairs {
                self.parameters.insert(k.clone(), v.clone());
            }
        }
        self.records.insert(record.key(), record);
        was_empty && !self.records.is_empty()
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn srv_targets(&self) -> impl Iterator<Item = (&str, u16, u16, u16)> {
        self.records.values().filter_map(|r| match &r.value {
            RecordValue::Srv { target, port, priority, weight } => {
                Some((target.as_str(), *port, *priority, *weight))
            }
            _ => None,
        })
    }
}
