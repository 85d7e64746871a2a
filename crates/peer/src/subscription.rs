//! Sustained subscription: keeps a Matter subscription alive across peer
//! disconnections (`spec.md` §4.9).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use abort::Abort;
use async_trait::async_trait;
use parking_lot::Mutex;
use retry_schedule::{RetryParams, RetrySchedule};
use tokio::sync::Notify;

use crate::error::ConnectError;

/// An active, underlying subscription handle. The Interaction Model
/// dispatch that actually produces these is out of scope (`spec.md` §1);
/// this is the minimal shape the reconnect loop needs.
#[async_trait]
pub trait ActiveSubscription: Send + Sync {
    fn subscription_id(&self) -> u64;
    fn max_interval(&self) -> Duration;
    fn interaction_model_revision(&self) -> u16;
    /// Resolves when the subscription closes for any reason.
    async fn closed(&self);
}

/// The operations a sustained subscription drives through an underlying
/// session/exchange. Probing, reading, and subscribing are all external
/// collaborators (`spec.md` §1).
#[async_trait]
pub trait SubscriptionBackend: Send + Sync {
    async fn probe(&self, abort: &Abort) -> Result<(), ConnectError>;
    async fn bootstrap_read(&self, abort: &Abort) -> Result<(), ConnectError>;
    async fn subscribe(&self, abort: &Abort) -> Result<Arc<dyn ActiveSubscription>, ConnectError>;
}

struct State {
    trusted: AtomicBool,
    active: AtomicBool,
    inactive: AtomicBool,
    retries: AtomicU64,
    subscription_id: AtomicU64,
    /// The live underlying subscription, fallen through to by
    /// `max_interval`/`interaction_model_revision`. `None` whenever there is
    /// no current subscription to query.
    current: Mutex<Option<Arc<dyn ActiveSubscription>>>,
    /// Signaled by [`SustainedSubscription::request_refresh`] to force an
    /// off-cycle re-subscribe, ahead of the retry schedule.
    refresh_requested: Notify,
}

impl Default for State {
    fn default() -> Self {
        Self {
            trusted: AtomicBool::new(false),
            active: AtomicBool::new(false),
            inactive: AtomicBool::new(false),
            retries: AtomicU64::new(0),
            subscription_id: AtomicU64::new(0),
            current: Mutex::new(None),
            refresh_requested: Notify::new(),
        }
    }
}

/// Default retry schedule per `spec.md` §4.9: initial 15s, max 1h, factor 2,
/// jitter 0.25, no timeout.
pub fn default_retry_params() -> RetryParams {
    RetryParams {
        initial_interval: Duration::from_secs(15),
        backoff_factor: 2.0,
        maximum_interval: Some(Duration::from_secs(3600)),
        maximum_count: None,
        timeout: None,
        jitter_factor: 0.25,
    }
}

/// Drives the reconnect loop of `spec.md` §4.9 for one subscription.
pub struct SustainedSubscription<B: SubscriptionBackend> {
    backend: Arc<B>,
    bootstrap_with_read: AtomicBool,
    state: State,
}

impl<B: SubscriptionBackend> SustainedSubscription<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            bootstrap_with_read: AtomicBool::new(false),
            state: State::default(),
        }
    }

    pub fn subscription_id(&self) -> u64 {
        self.state.subscription_id.load(AtomicOrdering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(AtomicOrdering::Relaxed)
    }

    /// Falls through to the current underlying subscription; `None` when
    /// there isn't one right now.
    pub fn max_interval(&self) -> Option<Duration> {
        self.state.current.lock().as_ref().map(|s| s.max_interval())
    }

    /// Falls through to the current underlying subscription; `None` when
    /// there isn't one right now.
    pub fn interaction_model_revision(&self) -> Option<u16> {
        self.state.current.lock().as_ref().map(|s| s.interaction_model_revision())
    }

    pub fn request_bootstrap_with_read(&self) {
        self.bootstrap_with_read.store(true, AtomicOrdering::Relaxed);
    }

    /// Forces an off-cycle re-subscribe: tears down the current
    /// subscription (if any) and resubscribes immediately, without waiting
    /// out the retry schedule's backoff interval (`spec.md` §4.9 step 3).
    pub fn request_refresh(&self) {
        self.state.refresh_requested.notify_one();
    }

    /// Runs until `abort` fires. Each reconnect consumes one interval from
    /// the retry schedule, so repeated reconnects back off exponentially up
    /// to the 1 hour ceiling.
    pub async fn run(&self, abort: &Abort) {
        let mut schedule: RetrySchedule = RetrySchedule::new(default_retry_params());

        loop {
            if abort.is_aborted() {
                return;
            }

            if !self.state.trusted.load(AtomicOrdering::Relaxed) {
                match abort.race(self.backend.probe(abort)).await {
                    None => return,
                    Some(Ok(())) => self.state.trusted.store(true, AtomicOrdering::Relaxed),
                    Some(Err(_)) => {
                        // Probe failure leaves `trusted` false; fall through
                        // to the retry-schedule sleep below and try again.
                    }
                }
            }

            if self.state.trusted.load(AtomicOrdering::Relaxed) {
                if self.bootstrap_with_read.swap(false, AtomicOrdering::Relaxed) {
                    if abort.race(self.backend.bootstrap_read(abort)).await.is_none() {
                        return;
                    }
                }

                let subscribed = abort.race(self.backend.subscribe(abort)).await;
                match subscribed {
                    None => return,
                    Some(Ok(active)) => {
                        self.state
                            .subscription_id
                            .store(active.subscription_id(), AtomicOrdering::Relaxed);
                        self.state.active.store(true, AtomicOrdering::Relaxed);
                        self.state.inactive.store(false, AtomicOrdering::Relaxed);
                        *self.state.current.lock() = Some(active.clone());
                        schedule = RetrySchedule::new(default_retry_params());

                        // Falls through on whichever happens first: the
                        // subscription closing on its own, or an explicit
                        // `request_refresh` asking to tear it down early.
                        let woken = abort
                            .race(async {
                                tokio::select! {
                                    _ = active.closed() => false,
                                    _ = self.state.refresh_requested.notified() => true,
                                }
                            })
                            .await;
                        let Some(refresh_requested) = woken else { return };

                        *self.state.current.lock() = None;
                        self.state.active.store(false, AtomicOrdering::Relaxed);
                        self.state.inactive.store(true, AtomicOrdering::Relaxed);
                        self.state.trusted.store(false, AtomicOrdering::Relaxed);

                        if refresh_requested {
                            log::info!(
                                "refresh requested for subscription {}, resubscribing immediately",
                                active.subscription_id()
                            );
                            // Skip the retry-schedule backoff below: this is
                            // a deliberate off-cycle request, not a failure.
                            continue;
                        }
                        log::info!("subscription {} closed, reconnecting", active.subscription_id());
                    }
                    Some(Err(_)) => {
                        self.state.trusted.store(false, AtomicOrdering::Relaxed);
                    }
                }
            }

            self.state.retries.fetch_add(1, AtomicOrdering::Relaxed);
            let interval = schedule.next().unwrap_or(Duration::from_secs(3600));
            if abort.sleep(interval).await.is_none() {
                return;
            }
        }
    }
}
