//! Expiration scheduler keyed on `expires-at` (`spec.md` §4.4).
//!
//! Every record with a non-zero TTL is registered here. When it fires, the
//! owning name is told to delete that record key outright — a scheduler
//! firing is never a goodbye, just ordinary expiry.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    expires_at_ms: u64,
    qname: String,
    record_key: String,
}

struct Inner {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
}

/// Fires a callback of `(qname, record_key, expires_at_ms)` once per
/// scheduled entry, once real time (via `tokio::time`) reaches its deadline.
///
/// The callback is responsible for checking the record is still installed
/// with that exact `expires_at_ms` before deleting it — a record refreshed
/// to a later expiry after being scheduled must not be deleted early.
pub struct Scheduler {
    inner: Arc<Inner>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn<F>(now_ms: impl Fn() -> u64 + Send + Sync + 'static, on_fire: F) -> Self
    where
        F: Fn(String, String, u64) + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        });

        let driver_inner = inner.clone();
        let task = tokio::spawn(async move {
            loop {
                let next = driver_inner.heap.lock().peek().map(|Reverse(e)| e.expires_at_ms);

                match next {
                    None => driver_inner.notify.notified().await,
                    Some(deadline) => {
                        let now = now_ms();
                        if deadline > now {
                            let wait = std::time::Duration::from_millis(deadline - now);
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = driver_inner.notify.notified() => continue,
                            }
                        }

                        let fired = {
                            let mut heap = driver_inner.heap.lock();
                            match heap.peek() {
                                Some(Reverse(e)) if e.expires_at_ms <= now_ms() => {
                                    heap.pop().map(|Reverse(e)| e)
                                }
                                _ => None,
                            }
                        };

                        if let Some(entry) = fired {
                            on_fire(entry.qname, entry.record_key, entry.expires_at_ms);
                        }
                    }
                }
            }
        });

        Self { inner, task: Some(task) }
    }

    pub fn schedule(&self, qname: impl Into<String>, record_key: impl Into<String>, expires_at_ms: u64) {
        let entry = Entry {
            expires_at_ms,
            qname: qname.into(),
            record_key: record_key.into(),
        };
        self.inner.heap.lock().push(Reverse(entry));
        self.inner.notify.notify_one();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
