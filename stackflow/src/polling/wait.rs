//! Blocking-with-timeout primitive.
//!
//! `wait_until` repeatedly probes until the probe yields a value, the deadline
//! passes, or the cancellation token fires. Each probe and each sleep races
//! the deadline and the token, so a hung backend call never outlives the bound.

use crate::cancellation::CancellationToken;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Poll interval configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// First sleep between probes in milliseconds.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    /// Upper bound for the sleep between probes in milliseconds.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Growth factor applied after each probe.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_interval_ms() -> u64 {
    1000
}

fn default_max_interval_ms() -> u64 {
    15000
}

fn default_multiplier() -> f64 {
    1.5
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl PollConfig {
    /// Creates a poll config with a fixed interval.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self {
            initial_interval_ms: ms,
            max_interval_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Returns the first interval.
    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    /// Returns the interval that follows `current`.
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.multiplier.max(1.0));
        grown.min(Duration::from_millis(self.max_interval_ms))
    }
}

/// Result of [`wait_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T, E> {
    /// The probe produced a value.
    Ready(T),
    /// The deadline passed first.
    TimedOut {
        /// The bound that was exceeded.
        after: Duration,
    },
    /// The token fired first.
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },
    /// The probe failed.
    Failed(E),
}

/// Polls `probe` until it returns `Ok(Some(_))`, with backoff between probes.
pub async fn wait_until<T, E, F, Fut>(
    config: &PollConfig,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    mut probe: F,
) -> WaitOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut interval = config.initial_interval();

    loop {
        if let Some(reason) = cancel_reason(cancel) {
            return WaitOutcome::Cancelled { reason };
        }

        let probed = tokio::select! {
            result = probe() => result,
            () = tokio::time::sleep_until(deadline) => {
                return WaitOutcome::TimedOut { after: timeout };
            }
            () = wait_cancelled(cancel) => {
                return WaitOutcome::Cancelled { reason: cancel_reason(cancel).unwrap_or_default() };
            }
        };

        match probed {
            Ok(Some(value)) => return WaitOutcome::Ready(value),
            Ok(None) => {}
            Err(e) => return WaitOutcome::Failed(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut { after: timeout };
        }

        let nap = interval.min(deadline - now);
        tokio::select! {
            () = tokio::time::sleep(nap) => {}
            () = wait_cancelled(cancel) => {
                return WaitOutcome::Cancelled { reason: cancel_reason(cancel).unwrap_or_default() };
            }
        }
        interval = config.next_interval(interval);
    }
}

fn cancel_reason(cancel: Option<&CancellationToken>) -> Option<String> {
    cancel
        .filter(|token| token.is_cancelled())
        .map(|token| token.reason().unwrap_or_default())
}

async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick() -> PollConfig {
        PollConfig::fixed(Duration::from_millis(5))
    }

    #[test]
    fn test_next_interval_grows_and_caps() {
        let config = PollConfig {
            initial_interval_ms: 100,
            max_interval_ms: 250,
            multiplier: 2.0,
        };
        let first = config.initial_interval();
        assert_eq!(config.next_interval(first), Duration::from_millis(200));
        assert_eq!(
            config.next_interval(Duration::from_millis(200)),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_ready_after_a_few_probes() {
        let probes = Arc::new(AtomicUsize::new(0));
        let outcome: WaitOutcome<&str, ()> =
            wait_until(&quick(), Duration::from_secs(2), None, || {
                let probes = probes.clone();
                async move {
                    if probes.fetch_add(1, Ordering::SeqCst) < 3 {
                        Ok(None)
                    } else {
                        Ok(Some("done"))
                    }
                }
            })
            .await;

        assert_eq!(outcome, WaitOutcome::Ready("done"));
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_times_out() {
        let outcome: WaitOutcome<(), ()> =
            wait_until(&quick(), Duration::from_millis(30), None, || async { Ok(None) }).await;
        assert!(matches!(outcome, WaitOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_hung_probe_is_bounded_by_deadline() {
        let outcome: WaitOutcome<(), ()> =
            wait_until(&quick(), Duration::from_millis(30), None, || async {
                std::future::pending::<()>().await;
                Ok(None)
            })
            .await;
        assert!(matches!(outcome, WaitOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("operator request");
            })
        };

        let slow = PollConfig::fixed(Duration::from_secs(10));
        let outcome: WaitOutcome<(), ()> =
            wait_until(&slow, Duration::from_secs(30), Some(&token), || async { Ok(None) }).await;

        canceller.await.unwrap();
        assert_eq!(
            outcome,
            WaitOutcome::Cancelled {
                reason: "operator request".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_probe_error_is_returned() {
        let outcome: WaitOutcome<(), &str> =
            wait_until(&quick(), Duration::from_secs(1), None, || async { Err("gone") }).await;
        assert_eq!(outcome, WaitOutcome::Failed("gone"));
    }
}
