//! Bounded polling shared by every wait-for-state site
//!
//! A [`Poller`] repeatedly runs a probe until the probe reports the awaited
//! state, reports a terminal failure, the deadline passes, or the cycle is
//! cancelled. It never waits past its timeout.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    /// The awaited state was reached
    Ready(T),
    /// Not there yet; the note is logged
    Pending(String),
    /// A terminal state that will never become ready
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollError {
    #[error("{what} did not complete within {timeout:?} (last seen: {last})")]
    TimedOut {
        what: String,
        timeout: Duration,
        last: String,
    },

    #[error("{what} failed: {reason}")]
    Failed { what: String, reason: String },

    #[error("{what} cancelled")]
    Cancelled { what: String },
}

/// Interval and timeout of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Probe until ready, failed, timed out or cancelled.
    ///
    /// The probe runs at least once, even with a zero timeout. A probe that
    /// is itself slow is cut off at the deadline.
    pub async fn until<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut probe: F,
    ) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Probe<T>>,
    {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last = String::from("no observation");
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);

            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(PollError::Cancelled { what: what.to_string() });
                }
                outcome = tokio::time::timeout_at(deadline, probe()) => outcome,
            };

            match outcome {
                Ok(Probe::Ready(value)) => {
                    debug!(what, attempt, elapsed_ms = started.elapsed().as_millis() as u64, "Wait completed");
                    return Ok(value);
                }
                Ok(Probe::Failed(reason)) => {
                    return Err(PollError::Failed {
                        what: what.to_string(),
                        reason,
                    });
                }
                Ok(Probe::Pending(note)) => {
                    trace!(what, attempt, note = %note, "Still waiting");
                    last = note;
                }
                Err(_) => {
                    last = "probe did not answer before the deadline".to_string();
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PollError::TimedOut {
                    what: what.to_string(),
                    timeout: self.timeout,
                    last,
                });
            }

            let wake = std::cmp::min(now + self.interval, deadline);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(PollError::Cancelled { what: what.to_string() });
                }
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn poller() -> Poller {
        Poller::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = poller()
            .until("volume", &cancel, || {
                let calls = &calls;
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Probe::Pending("creating".to_string())
                    } else {
                        Probe::Ready(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_transitions_times_out() {
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = poller()
            .until("instance", &cancel, || async { Probe::Pending("BUILD".to_string()) })
            .await;

        match result {
            Err(PollError::TimedOut { last, timeout, .. }) => {
                assert_eq!(last, "BUILD");
                assert_eq!(timeout, Duration::from_secs(60));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_is_cut_off() {
        let cancel = CancellationToken::new();

        let result: Result<(), _> = poller()
            .until("ssh", &cancel, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Probe::Ready(())
            })
            .await;

        assert!(matches!(result, Err(PollError::TimedOut { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stops_immediately() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = poller()
            .until("volume", &cancel, || {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Probe::Failed("status error".to_string())
                }
            })
            .await;

        assert!(matches!(result, Err(PollError::Failed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = poller()
            .until("volume", &cancel, || async { Probe::Pending("creating".to_string()) })
            .await;

        assert!(matches!(result, Err(PollError::Cancelled { .. })));
    }
}
