//! Single-flight guard for refresh operations.
//!
//! Topology and schema refreshes may be requested from many tasks at once. Only
//! the caller that wins the compare-and-swap runs the refresh; the others wait
//! for it to finish and then return without issuing their own request.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
    done: Notify,
}

struct Release<'a>(&'a SingleFlight);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.done.notify_waiters();
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run `f` unless another caller is already running one, in which case
    /// wait for that run to finish and return `None`.
    pub async fn run<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_running() {
                notified.await;
            }
            return None;
        }

        let _release = Release(self);
        Some(f().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_coalesce() {
        let flight = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flight
                    .run(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    })
                    .await
            }));
        }

        let mut ran = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                ran += 1;
            }
        }
        assert_eq!(ran, runs.load(Ordering::SeqCst));
        assert!(ran >= 1);
        assert!(!flight.is_running());
    }

    #[tokio::test]
    async fn test_sequential_runs_both_execute() {
        let flight = SingleFlight::new();
        assert_eq!(flight.run(|| async { 1 }).await, Some(1));
        assert_eq!(flight.run(|| async { 2 }).await, Some(2));
    }
}
