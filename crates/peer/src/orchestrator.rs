//! Peer connection orchestrator (`spec.md` §4.8).
//!
//! Produces an authenticated session to a peer by trying, in parallel with
//! staggered starts, every address its IP service discovers, while falling
//! back to a last-known operational address when nothing has been
//! discovered yet. The first attempt to succeed wins; every sibling is
//! aborted before the caller sees a result.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use abort::Abort;
use async_trait::async_trait;
use dnssd::{AddressChange, IpService};
use error_kind::{Classify, ErrorKind};
use net_address::{desirability_cmp, ServerAddress};
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::{oneshot, Notify, Semaphore};

use crate::descriptor::{PeerDescriptor, PeerStatus};
use crate::error::ConnectError;

/// Operator-tunable timing knobs (`spec.md` §4.8).
#[derive(Debug, Clone)]
pub struct Timing {
    pub delay_before_next_address: Duration,
    pub max_delay_between_initial_contact_retries: Duration,
    pub delay_after_network_error: Duration,
    pub delay_after_peer_error: Duration,
    pub delay_after_unhandled_error: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            delay_before_next_address: Duration::from_millis(500),
            max_delay_between_initial_contact_retries: Duration::from_secs(30),
            delay_after_network_error: Duration::from_secs(5),
            delay_after_peer_error: Duration::from_secs(10),
            delay_after_unhandled_error: Duration::from_secs(10),
        }
    }
}

/// CASE pairing is an external collaborator (`spec.md` §1): this trait
/// stands in for "open a socket, create an unsecured session, create an
/// exchange, run CASE pairing".
#[async_trait]
pub trait CaseInitiator: Send + Sync {
    async fn pair(
        &self,
        address: &ServerAddress,
        abort: &Abort,
        initial_retransmission_time: Option<Duration>,
    ) -> Result<transport::Session, ConnectError>;
}

struct PendingAddresses {
    items: Mutex<Vec<Arc<ServerAddress>>>,
    notify: Notify,
}

impl PendingAddresses {
    fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, addr: Arc<ServerAddress>) {
        self.items.lock().push(addr);
        self.notify.notify_one();
    }

    fn remove(&self, url: &str) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|a| a.url() != url);
        items.len() != before
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Pops the single most-desirable pending address, if any.
    fn pop_best(&self) -> Option<Arc<ServerAddress>> {
        let mut items = self.items.lock();
        if items.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..items.len() {
            if desirability_cmp(&items[i], &items[best]) == Ordering::Less {
                best = i;
            }
        }
        Some(items.remove(best))
    }

    async fn wait_non_empty(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

struct RunningAttempt {
    abort: Abort,
}

/// Produces a single authenticated session for a peer, per `spec.md` §4.8.
pub struct PeerConnector<C: CaseInitiator> {
    case: Arc<C>,
    timing: Timing,
    network_semaphore: Arc<Semaphore>,
}

impl<C: CaseInitiator + 'static> PeerConnector<C> {
    pub fn new(case: Arc<C>, timing: Timing, network_semaphore: Arc<Semaphore>) -> Self {
        Self { case, timing, network_semaphore }
    }

    pub async fn connect(
        &self,
        descriptor: &mut PeerDescriptor,
        ip_service: IpService,
        outer_abort: Abort,
    ) -> Option<transport::Session> {
        let _permit = outer_abort.race(self.network_semaphore.acquire()).await?.ok()?;

        descriptor.status = PeerStatus::Connecting;

        let pending = Arc::new(PendingAddresses::new());
        let attempts: Arc<Mutex<HashMap<String, RunningAttempt>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let attempting_fallback: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        // Fires exactly once, from whichever attempt pairs first.
        let (result_tx, result_rx) = oneshot::channel();
        let result_tx = Arc::new(Mutex::new(Some(result_tx)));

        let combined_abort = Abort::any([outer_abort.clone()]);
        let operational_address = descriptor.operational_address.clone();

        let discovery_task = spawn_discovery_fiber(
            ip_service.clone(),
            pending.clone(),
            attempts.clone(),
            attempting_fallback.clone(),
            operational_address.clone(),
            combined_abort.clone(),
        );

        let scheduler_task = spawn_scheduler_fiber(
            self.case.clone(),
            self.timing.clone(),
            pending.clone(),
            attempts.clone(),
            result_tx.clone(),
            combined_abort.clone(),
        );

        // Fallback policy: step 8. Nothing is running, pending, or
        // discovered yet, so fall back to the last-known operational
        // address. The discovery fiber re-runs this same check every time
        // an address is deleted, and clears `attempting_fallback` the
        // moment a real address shows up that matches it.
        maybe_start_fallback(&operational_address, &ip_service, &pending, &attempts, &attempting_fallback);

        let produced = combined_abort.race(result_rx).await.and_then(|r| r.ok());

        combined_abort.abort(Some(Arc::from("connection resolved")));
        discovery_task.abort();
        scheduler_task.abort();
        for (_, attempt) in attempts.lock().drain() {
            attempt.abort.abort(Some(Arc::from("sibling succeeded")));
            attempt.abort.close();
        }
        combined_abort.close();

        if produced.is_some() {
            descriptor.status = PeerStatus::Reachable;
        }
        produced
    }
}

fn spawn_discovery_fiber(
    ip_service: IpService,
    pending: Arc<PendingAddresses>,
    attempts: Arc<Mutex<HashMap<String, RunningAttempt>>>,
    attempting_fallback: Arc<Mutex<Option<String>>>,
    operational_address: Option<ServerAddress>,
    abort: Abort,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = ip_service.address_changes();
        while let Some(batch) = changes.next(&abort).await {
            for change in batch {
                match change {
                    AddressChange::Add(addr) => {
                        let mut fallback = attempting_fallback.lock();
                        if fallback.as_deref() == Some(addr.url().as_str()) {
                            *fallback = None;
                        } else {
                            drop(fallback);
                            pending.push(addr);
                        }
                    }
                    AddressChange::Delete(addr) => {
                        let url = addr.url();
                        // Promotion back to the fallback (step 7) only
                        // applies when the address that just disappeared is
                        // the known operational address, not any sole
                        // survivor among several discovered addresses.
                        let is_operational_address = operational_address
                            .as_ref()
                            .map(|op| op.url() == url)
                            .unwrap_or(false);
                        let running_alone = is_operational_address && {
                            let attempts = attempts.lock();
                            attempts.len() == 1 && attempts.contains_key(&url)
                        };
                        if running_alone {
                            *attempting_fallback.lock() = Some(url);
                        } else {
                            if let Some(attempt) = attempts.lock().remove(&url) {
                                attempt.abort.abort(Some(Arc::from("address deleted")));
                                attempt.abort.close();
                            }
                            pending.remove(&url);

                            // Step 8's "nothing running/pending/discovered"
                            // fallback condition can become true here too
                            // (e.g. two attempts racing, both addresses
                            // deleted back to back): re-check it rather
                            // than only evaluating it once up front.
                            maybe_start_fallback(
                                &operational_address,
                                &ip_service,
                                &pending,
                                &attempts,
                                &attempting_fallback,
                            );
                        }
                    }
                }
            }
        }
    })
}

/// Step 8's fallback policy: start an attempt against the last-known
/// operational address when nothing is running, nothing is pending, and
/// discovery has found no addresses at all. Evaluated at the start of
/// `connect()` and re-evaluated by the discovery fiber after every address
/// deletion, since the condition can become true at any point, not just
/// once up front.
fn maybe_start_fallback(
    operational_address: &Option<ServerAddress>,
    ip_service: &IpService,
    pending: &PendingAddresses,
    attempts: &Mutex<HashMap<String, RunningAttempt>>,
    attempting_fallback: &Mutex<Option<String>>,
) {
    let Some(op_addr) = operational_address else { return };
    if ip_service.addresses().size() != 0 {
        return;
    }
    if !attempts.lock().is_empty() || !pending.is_empty() {
        return;
    }

    let mut fallback = attempting_fallback.lock();
    if fallback.is_some() {
        return;
    }
    *fallback = Some(op_addr.url());
    drop(fallback);
    pending.push(Arc::new(op_addr.clone()));
}

fn spawn_scheduler_fiber<C: CaseInitiator + 'static>(
    case: Arc<C>,
    timing: Timing,
    pending: Arc<PendingAddresses>,
    attempts: Arc<Mutex<HashMap<String, RunningAttempt>>>,
    result_tx: Arc<Mutex<Option<oneshot::Sender<transport::Session>>>>,
    abort: Abort,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let last_attempt_started = Arc::new(Mutex::new(None::<tokio::time::Instant>));
        let fallback_tried = Arc::new(std::sync::atomic::AtomicBool::new(false));

        loop {
            if abort.is_aborted() {
                return;
            }
            pending.wait_non_empty().await;

            let wait_remaining = {
                let last = *last_attempt_started.lock();
                last.map(|instant| timing.delay_before_next_address.saturating_sub(instant.elapsed()))
            };
            if let Some(remaining) = wait_remaining {
                if !remaining.is_zero() {
                    if abort.sleep(remaining).await.is_none() {
                        return;
                    }
                    // A newer, possibly higher-priority address may have
                    // arrived while we waited; loop back and re-pick rather
                    // than attempting a stale choice.
                    continue;
                }
            }

            let Some(addr) = pending.pop_best() else { continue };
            *last_attempt_started.lock() = Some(tokio::time::Instant::now());

            let is_first_attempt =
                !fallback_tried.swap(true, std::sync::atomic::Ordering::Relaxed);

            let attempt_abort = Abort::any([abort.clone()]);
            attempts.lock().insert(addr.url(), RunningAttempt { abort: attempt_abort.clone() });

            let case = case.clone();
            let timing = timing.clone();
            let attempts = attempts.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let url = addr.url();
                let initial_retransmission = (!is_first_attempt)
                    .then(|| timing.delay_after_network_error / 2);

                if let Some(session) =
                    run_single_attempt(case, addr, &timing, attempt_abort.clone(), initial_retransmission).await
                {
                    if let Some(tx) = result_tx.lock().take() {
                        let _ = tx.send(session);
                    }
                }

                attempts.lock().remove(&url);
                attempt_abort.close();
            });
        }
    })
}

/// Single-address attempt loop (`spec.md` §4.8 step 9): retries within one
/// attempt until the address is dropped or the overall connection aborts.
async fn run_single_attempt<C: CaseInitiator>(
    case: Arc<C>,
    addr: Arc<ServerAddress>,
    timing: &Timing,
    abort: Abort,
    mut initial_retransmission_time: Option<Duration>,
) -> Option<transport::Session> {
    loop {
        if abort.is_aborted() {
            return None;
        }

        match abort.race(case.pair(&addr, &abort, initial_retransmission_time.take())).await {
            None => return None,
            Some(Ok(session)) => return Some(session),
            Some(Err(err)) => {
                let delay = classify_and_delay(&err, timing);
                log::warn!("peer connection attempt to {} failed: {err}", addr.url());
                abort.sleep(delay).await?;
            }
        }
    }
}

/// Most of the delay schedule is driven by the shared `ErrorKind`
/// classification rather than `ConnectError`'s own variants, so retry
/// policy here generalizes to any crate's error type; the two exceptions
/// (`busy_delay`'s payload, and resumption-deleted's immediate retry) need
/// data that only the concrete variant carries.
fn classify_and_delay(err: &ConnectError, timing: &Timing) -> Duration {
    if let ConnectError::Busy { busy_delay } = err {
        let span = timing.delay_after_network_error.as_millis().max(1) as u64;
        let jitter = rand::rng().random_range(0..span);
        return *busy_delay + Duration::from_millis(jitter);
    }
    if let ConnectError::NoSharedTrustRoots { resumption_deleted: true } = err {
        return Duration::ZERO;
    }

    match err.kind() {
        ErrorKind::ChannelStatusResponse => timing.delay_after_peer_error,
        ErrorKind::TransientPeerCommunication => timing.delay_after_network_error,
        _ => timing.delay_after_unhandled_error,
    }
}
