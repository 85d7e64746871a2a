//! In-memory reconstructed store state (`spec.md` §3, §4.10).

use std::collections::BTreeMap;

use crate::commit::Op;

pub type ContextMap = BTreeMap<String, serde_json::Value>;
pub type StoreData = BTreeMap<String, ContextMap>;

/// The full store, as nested `context-path → key → value` maps — exactly
/// the shape a snapshot serializes.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    data: StoreData,
}

impl Cache {
    pub fn from_data(data: StoreData) -> Self {
        Self { data }
    }

    pub fn into_data(self) -> StoreData {
        self.data
    }

    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::Set { context, key, value } => {
                self.data.entry(context.clone()).or_default().insert(key.clone(), value.clone());
            }
            Op::Delete { context, key } => {
                if let Some(ctx) = self.data.get_mut(context) {
                    ctx.remove(key);
                }
            }
            Op::ClearAll { context } => {
                self.data.remove(context);
            }
        }
    }

    pub fn get(&self, context: &str, key: &str) -> Option<&serde_json::Value> {
        self.data.get(context)?.get(key)
    }

    pub fn keys(&self, context: &str) -> Vec<String> {
        self.data.get(context).map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn values(&self, context: &str) -> Vec<serde_json::Value> {
        self.data.get(context).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}
