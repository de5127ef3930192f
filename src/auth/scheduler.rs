// Proactive renewal timer

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Renew this many seconds before the access token expires
const RENEWAL_LEAD_SECS: i64 = 60;

/// Never schedule renewal sooner than this
const MIN_RENEWAL_DELAY_MS: i64 = 5_000;

/// Delay before proactive renewal for a token living `expires_in` seconds.
/// `None` means no timer should be armed.
pub fn renewal_delay(expires_in: i64) -> Option<Duration> {
    if expires_in <= 0 {
        return None;
    }

    let delay_ms = expires_in
        .saturating_sub(RENEWAL_LEAD_SECS)
        .saturating_mul(1000)
        .max(MIN_RENEWAL_DELAY_MS);
    Some(Duration::from_millis(delay_ms as u64))
}

struct PendingTimer {
    id: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

/// Owns at most one pending renewal timer
pub struct RenewalScheduler {
    pending: Arc<Mutex<Option<PendingTimer>>>,
    next_id: AtomicU64,
}

impl RenewalScheduler {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Arm the timer to run `on_fire` shortly before expiry.
    ///
    /// Any pending timer is cancelled first. Returns the armed delay, or
    /// `None` when `expires_in` is not positive and nothing was armed.
    pub fn arm<F>(&self, expires_in: i64, on_fire: F) -> Option<Duration>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = pending.take() {
            previous.handle.abort();
            tracing::debug!("Superseded pending renewal timer");
        }

        let Some(delay) = renewal_delay(expires_in) else {
            tracing::debug!(expires_in, "Not arming renewal timer");
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::clone(&self.pending);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Release the slot before running so a re-arm from `on_fire`
            // does not abort this task
            {
                let mut pending = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if pending.as_ref().is_some_and(|timer| timer.id == id) {
                    pending.take();
                }
            }

            tracing::debug!("Renewal timer fired");
            on_fire.await;
        });

        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            "Scheduled proactive token renewal"
        );
        *pending = Some(PendingTimer { id, delay, handle });
        Some(delay)
    }

    /// Cancel the pending timer, if any
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = pending.take() {
            timer.handle.abort();
            tracing::debug!("Cancelled renewal timer");
        }
    }

    /// Whether a timer is waiting to fire
    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Delay the pending timer was armed with
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|timer| timer.delay)
    }
}

impl Default for RenewalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::Instant;

    #[test]
    fn test_renewal_delay() {
        assert_eq!(renewal_delay(3600), Some(Duration::from_secs(3540)));
        assert_eq!(renewal_delay(66), Some(Duration::from_secs(6)));
        assert_eq!(renewal_delay(65), Some(Duration::from_secs(5)));
        assert_eq!(renewal_delay(1), Some(Duration::from_secs(5)));
        assert_eq!(renewal_delay(0), None);
        assert_eq!(renewal_delay(-10), None);
    }

    proptest! {
        #[test]
        fn prop_short_lifetimes_hit_floor(expires_in in 1i64..=60) {
            prop_assert_eq!(renewal_delay(expires_in), Some(Duration::from_millis(5000)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_floor_delay() {
        let scheduler = RenewalScheduler::new();
        let (tx, rx) = oneshot::channel();
        let start = Instant::now();

        let delay = scheduler.arm(30, async move {
            let _ = tx.send(());
        });
        assert_eq!(delay, Some(Duration::from_millis(5000)));
        assert_eq!(scheduler.pending_delay(), Some(Duration::from_millis(5000)));

        rx.await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed < Duration::from_millis(5100));
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_lifetime_arms_nothing() {
        let scheduler = RenewalScheduler::new();
        scheduler.arm(3600, async {});
        assert!(scheduler.is_armed());

        // Still cancels the previous timer
        assert_eq!(scheduler.arm(0, async {}), None);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_supersedes_previous_timer() {
        let scheduler = RenewalScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = tx.clone();
        scheduler.arm(120, async move {
            let _ = first.send("first");
        });
        scheduler.arm(120, async move {
            let _ = tx.send("second");
        });

        assert_eq!(rx.recv().await, Some("second"));
        // Both senders are gone: the first task was aborted without sending
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let scheduler = RenewalScheduler::new();
        let (tx, rx) = oneshot::channel::<()>();

        scheduler.arm(120, async move {
            let _ = tx.send(());
        });
        scheduler.cancel();
        scheduler.cancel();

        assert!(!scheduler.is_armed());
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_fire_can_rearm() {
        let scheduler = Arc::new(RenewalScheduler::new());
        let (tx, rx) = oneshot::channel();

        let inner = Arc::clone(&scheduler);
        scheduler.arm(10, async move {
            inner.arm(3600, async {});
            let _ = tx.send(inner.pending_delay());
        });

        let delay = rx.await.unwrap();
        assert_eq!(delay, Some(Duration::from_secs(3540)));
        assert!(scheduler.is_armed());
    }
}
