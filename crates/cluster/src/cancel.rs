use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cooperative cancellation shared by every task of one run.
///
/// Cloning is cheap; cancelling any clone cancels all of them.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless the run is cancelled first.
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            v = fut => Some(v),
        }
    }

    /// Run `fut` until it completes, `limit` elapses or the run is cancelled.
    pub async fn bounded<F: Future>(&self, limit: Duration, fut: F) -> Bounded<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Bounded::Cancelled,
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(v) => Bounded::Ready(v),
                Err(_) => Bounded::TimedOut,
            },
        }
    }
}

/// Outcome of [`Cancellation::bounded`].
#[derive(Debug)]
pub enum Bounded<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}
