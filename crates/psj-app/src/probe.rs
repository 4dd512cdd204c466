//! Concurrent probes: observe a client call as "still blocked".
//!
//! A [`Probe`] runs one operation on its own task and hands the result back
//! over a oneshot channel. The scenario checks right after spawning that no
//! result is there yet, releases whatever the operation waits on, then
//! collects the result within a bound.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("{label}: completed before it was released")]
    CompletedEarly { label: String },

    #[error("{label}: did not complete within {bound:?}")]
    TimedOut { label: String, bound: Duration },

    #[error("{label}: task ended without a result")]
    Lost { label: String },
}

pub struct Probe<T> {
    label: String,
    result: oneshot::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Probe<T> {
    pub fn spawn<F>(label: impl Into<String>, operation: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let task_label = label.clone();
        let task = tokio::spawn(async move {
            let result = operation.await;
            if tx.send(result).is_err() {
                tracing::debug!(probe = %task_label, "result dropped, probe already gone");
            }
        });
        tracing::debug!(probe = %label, "probe started");
        Self {
            label,
            result: rx,
            task,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Non-blocking check that no result is available yet.
    pub fn assert_pending(&mut self) -> Result<(), ProbeError> {
        match self.result.try_recv() {
            Err(TryRecvError::Empty) => Ok(()),
            Ok(_) => Err(ProbeError::CompletedEarly {
                label: self.label.clone(),
            }),
            Err(TryRecvError::Closed) => Err(ProbeError::Lost {
                label: self.label.clone(),
            }),
        }
    }

    /// Collect the result, failing if it takes longer than `bound`.
    pub async fn await_within(mut self, bound: Duration) -> Result<T, ProbeError> {
        match tokio::time::timeout(bound, &mut self.result).await {
            Ok(Ok(value)) => {
                tracing::debug!(probe = %self.label, "probe completed");
                Ok(value)
            }
            Ok(Err(_)) => Err(ProbeError::Lost {
                label: self.label.clone(),
            }),
            Err(_) => Err(ProbeError::TimedOut {
                label: self.label.clone(),
                bound,
            }),
        }
    }
}

impl<T> Drop for Probe<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psj_core::Waiter;

    #[tokio::test]
    async fn test_pending_until_released() {
        let gate = Waiter::new();
        let task_gate = gate.clone();
        let mut probe = Probe::spawn("gated", async move {
            task_gate.wait(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        probe.assert_pending().unwrap();

        gate.finish();
        assert!(probe.await_within(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_early_completion_is_detected() {
        let mut probe = Probe::spawn("eager", async { 42 });

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            probe.assert_pending(),
            Err(ProbeError::CompletedEarly {
                label: "eager".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_within_times_out() {
        let probe = Probe::spawn("stuck", std::future::pending::<()>());

        let err = probe
            .await_within(Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::TimedOut { .. }));
        assert!(err.to_string().starts_with("stuck"));
    }

    #[tokio::test]
    async fn test_panicking_operation_is_lost() {
        let probe = Probe::<()>::spawn("panics", async {
            panic!("operation failed");
        });

        let err = probe.await_within(Duration::from_secs(1)).await.unwrap_err();

        assert_eq!(
            err,
            ProbeError::Lost {
                label: "panics".to_string()
            }
        );
    }
}
