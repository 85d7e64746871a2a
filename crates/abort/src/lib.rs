//! Cooperative cancellation primitive combining the role of controller,
//! signal, and awaitable (`spec.md` §4.2).
//!
//! Every long-running operation in this workspace takes an [`Abort`] (or a
//! clone of one) instead of reaching for a raw `CancellationToken`, so that
//! timeouts, parent/child propagation, and `any()` composition all share one
//! vocabulary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type Reason = Arc<str>;

/// Options for constructing an [`Abort`] with parent propagation and/or a
/// timeout.
#[derive(Default)]
pub struct AbortOptions {
    pub parents: Vec<Abort>,
    pub timeout: Option<Duration>,
    /// Overrides the default behavior of calling `abort()` when the timeout
    /// elapses.
    pub on_timeout: Option<Box<dyn FnOnce() + Send + 'static>>,
    /// Invoked exactly once, the first time this handle is aborted for any
    /// reason (including parent propagation or timeout).
    pub on_abort: Option<Box<dyn FnOnce(Reason) + Send + 'static>>,
}

struct Inner {
    tx: watch::Sender<Option<Reason>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// A cooperative cancellation handle.
///
/// Cloning an `Abort` shares the same underlying signal: aborting any clone
/// aborts all of them.
#[derive(Clone)]
pub struct Abort {
    inner: Arc<Inner>,
    rx: watch::Receiver<Option<Reason>>,
}

impl Default for Abort {
    fn default() -> Self {
        Self::new()
    }
}

impl Abort {
    pub fn new() -> Self {
        Self::with_options(AbortOptions::default())
    }

    pub fn with_options(options: AbortOptions) -> Self {
        let (tx, rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            tx,
            background: Mutex::new(Vec::new()),
        });
        let handle = Self {
            inner: inner.clone(),
            rx,
        };

        if let Some(on_abort) = options.on_abort {
            let mut rx = handle.rx.clone();
            let task = tokio::spawn(async move {
                if wait_aborted(&mut rx).await {
                    if let Some(reason) = rx.borrow().clone() {
                        on_abort(reason);
                    }
                }
            });
            inner.background.lock().unwrap().push(task);
        }

        for parent in options.parents {
            let child = handle.clone();
            let mut parent_rx = parent.rx.clone();
            let task = tokio::spawn(async move {
                if wait_aborted(&mut parent_rx).await {
                    let reason = parent_rx.borrow().clone();
                    child.abort(reason);
                }
            });
            inner.background.lock().unwrap().push(task);
        }

        if let Some(duration) = options.timeout {
            let weak_tx = handle.inner.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if weak_tx.tx.borrow().is_none() {
                    match options.on_timeout {
                        Some(on_timeout) => on_timeout(),
                        None => {
                            let _ = weak_tx.tx.send(Some(Arc::from("timeout")));
                        }
                    }
                }
            });
            inner.background.lock().unwrap().push(task);
        }

        handle
    }

    /// Marks this handle (and every clone of it) as aborted.
    ///
    /// Idempotent: the first call wins, later calls are ignored.
    pub fn abort(&self, reason: Option<Reason>) {
        if self.inner.tx.borrow().is_none() {
            let _ = self
                .inner
                .tx
                .send(Some(reason.unwrap_or_else(|| Arc::from("aborted"))));
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<Reason> {
        self.rx.borrow().clone()
    }

    /// Completes when either `fut` settles or this handle is aborted.
    /// On abort, returns `None` rather than propagating an error.
    pub async fn race<F: std::future::Future>(&self, fut: F) -> Option<F::Output> {
        let mut rx = self.rx.clone();
        if rx.borrow().is_some() {
            return None;
        }

        tokio::select! {
            out = fut => Some(out),
            _ = wait_aborted(&mut rx) => None,
        }
    }

    /// As [`Abort::race`], but returns the abort reason as an error instead
    /// of silently swallowing it.
    pub async fn attempt<F: std::future::Future>(
        &self,
        fut: F,
    ) -> Result<F::Output, Aborted> {
        match self.race(fut).await {
            Some(out) => Ok(out),
            None => Err(Aborted(self.reason())),
        }
    }

    /// Abortable sleep.
    pub async fn sleep(&self, duration: Duration) -> Option<()> {
        self.race(tokio::time::sleep(duration)).await
    }

    /// Releases parent registrations and the timeout timer. Idempotent.
    /// Must be called once a handle constructed with `parents`/`timeout` is
    /// no longer needed, to avoid leaking the background tasks.
    pub fn close(&self) {
        for task in self.inner.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Returns a new `Abort` that fires as soon as any of `signals` does.
    /// The caller is responsible for calling `close()` on the result.
    pub fn any(signals: impl IntoIterator<Item = Abort>) -> Abort {
        Self::with_options(AbortOptions {
            parents: signals.into_iter().collect(),
            ..Default::default()
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("operation aborted: {0:?}")]
pub struct Aborted(pub Option<Reason>);

impl error_kind::Classify for Aborted {
    fn kind(&self) -> error_kind::ErrorKind {
        error_kind::ErrorKind::Aborted
    }
}

async fn wait_aborted(rx: &mut watch::Receiver<Option<Reason>>) -> bool {
    loop {
        if rx.borrow().is_some() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn race_returns_none_on_abort() {
        let abort = Abort::new();
        let signal = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.abort(None);
        });

        let result = abort.race(tokio::time::sleep(Duration::from_secs(10))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn race_returns_value_when_future_wins() {
        let abort = Abort::new();
        let result = abort.race(async { 42 }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn attempt_surfaces_abort_reason() {
        let abort = Abort::new();
        abort.abort(Some(Arc::from("shutdown")));
        let result = abort.attempt(async { 1u32 }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timeout_aborts_after_duration() {
        let abort = Abort::with_options(AbortOptions {
            timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        assert!(!abort.is_aborted());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(abort.is_aborted());
        abort.close();
    }

    #[tokio::test]
    async fn child_aborts_when_parent_does() {
        let parent = Abort::new();
        let child = Abort::with_options(AbortOptions {
            parents: vec![parent.clone()],
            ..Default::default()
        });

        parent.abort(Some(Arc::from("parent-reason")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(child.is_aborted());
        child.close();
    }

    #[tokio::test]
    async fn any_fires_on_first_parent() {
        let a = Abort::new();
        let b = Abort::new();
        let combined = Abort::any([a.clone(), b.clone()]);

        b.abort(None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(combined.is_aborted());
        combined.close();
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let abort = Abort::new();
        abort.abort(Some(Arc::from("first")));
        abort.abort(Some(Arc::from("second")));
        assert_eq!(abort.reason().unwrap().as_ref(), "first");
    }
}
