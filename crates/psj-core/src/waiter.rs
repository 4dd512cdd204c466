//! Single-use broadcast barrier.
//!
//! A [`Waiter`] starts *pending* and moves to *finished* exactly once, on the
//! first call to [`Waiter::finish`]. Any number of tasks may wait on it
//! concurrently; all of them are released once it finishes, and a task that
//! starts waiting afterwards returns immediately.
//!
//! ## Single use
//!
//! There is no way back from *finished*. Each gated exchange (for example one
//! intercepted state fetch) needs its own fresh pair of waiters. A second
//! request reaching a handler whose arrival waiter already finished is not an
//! error: `finish` on a finished waiter is a no-op.
//!
//! ## Timeouts
//!
//! Waits are always bounded. [`Waiter::wait`] reports a timeout as `false`;
//! [`Waiter::waitf`] turns it into a [`WaitError`] naming the wait, for
//! callers that propagate it with `?`. No wait can be cancelled early.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("{label}: timed out after {timeout:?}")]
    TimedOut { label: String, timeout: Duration },
}

/// Cloneable handle to one barrier; every clone observes the same state.
#[derive(Debug, Clone)]
pub struct Waiter {
    state: Arc<watch::Sender<bool>>,
}

impl Waiter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Move to *finished*, releasing every current and future waiter.
    pub fn finish(&self) {
        // send_replace stores the value even when nobody is subscribed yet.
        self.state.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait up to `timeout`; `true` if the barrier finished in time.
    #[must_use = "a timed-out wait must be handled"]
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        // wait_for checks the current value first, so late arrivals return at once.
        let finished = tokio::time::timeout(timeout, rx.wait_for(|finished| *finished))
            .await
            .is_ok_and(|changed| changed.is_ok());
        finished
    }

    /// Like [`wait`](Self::wait), but a timeout becomes an error labelled
    /// with what was being waited for.
    pub async fn waitf(
        &self,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Result<(), WaitError> {
        if self.wait(timeout).await {
            return Ok(());
        }
        let label = label.into();
        tracing::warn!(%label, ?timeout, "wait timed out");
        Err(WaitError::TimedOut { label, timeout })
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_while_pending() {
        let waiter = Waiter::new();

        assert!(!waiter.wait(Duration::from_millis(50)).await);
        assert!(!waiter.is_finished());
    }

    #[tokio::test]
    async fn test_wait_after_finish_returns_immediately() {
        let waiter = Waiter::new();
        waiter.finish();

        assert!(waiter.wait(Duration::ZERO).await);
        assert!(waiter.is_finished());
    }

    #[tokio::test]
    async fn test_double_finish_is_same_as_single() {
        let waiter = Waiter::new();
        waiter.finish();
        waiter.finish();

        assert!(waiter.is_finished());
        assert!(waiter.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finish_releases_all_concurrent_waiters() {
        let waiter = Waiter::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let waiter = waiter.clone();
                tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        for handle in &handles {
            assert!(!handle.is_finished());
        }

        waiter.finish();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waitf_reports_label_on_timeout() {
        let waiter = Waiter::new();

        let err = waiter
            .waitf(Duration::from_secs(5), "Waiting for /state_ids request")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            WaitError::TimedOut {
                label: "Waiting for /state_ids request".to_string(),
                timeout: Duration::from_secs(5),
            }
        );
        assert!(err.to_string().starts_with("Waiting for /state_ids request"));
    }

    #[tokio::test]
    async fn test_finish_from_clone_is_visible_to_original() {
        let waiter = Waiter::new();
        let clone = waiter.clone();

        clone.finish();

        assert!(waiter.waitf(Duration::ZERO, "clone").await.is_ok());
    }
}
