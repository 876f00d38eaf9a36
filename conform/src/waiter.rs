//! Async completion waiter
//!
//! Polls a device predicate until it reports not busy. Each poll is a device
//! call; a failing poll ends the wait immediately. A predicate still true after
//! the timeout is a [`ConformError::Timeout`]. Cancellation ends the wait
//! quietly with [`WaitOutcome::Cancelled`] and the caller unwinds from there.

use crate::device::DeviceResult;
use crate::error::{ConformError, ConformResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Longest single sleep inside a cancellable pause
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate cleared after this long
    Completed(Duration),
    Cancelled,
}

impl WaitOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitOutcome::Cancelled)
    }
}

/// Poll `busy` every `poll_interval` until it returns false
pub async fn wait_while<F, Fut>(
    operation: &str,
    busy: F,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &AtomicBool,
) -> ConformResult<WaitOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<bool>>,
{
    wait_while_min(operation, busy, Duration::ZERO, poll_interval, timeout, cancel).await
}

/// Like [`wait_while`] but keeps waiting for at least `minimum` even when the
/// predicate clears straight away.
pub async fn wait_while_min<F, Fut>(
    operation: &str,
    mut busy: F,
    minimum: Duration,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &AtomicBool,
) -> ConformResult<WaitOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<bool>>,
{
    let start = Instant::now();
    let mut polls = 0u32;

    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!("{}: wait cancelled after {} polls", operation, polls);
            return Ok(WaitOutcome::Cancelled);
        }

        let still_busy = busy().await.map_err(|e| ConformError::device(operation, e))?;
        polls += 1;
        let elapsed = start.elapsed();

        if !still_busy && elapsed >= minimum {
            tracing::debug!("{}: complete after {:.1}s ({} polls)", operation, elapsed.as_secs_f64(), polls);
            return Ok(WaitOutcome::Completed(elapsed));
        }

        if still_busy && elapsed >= timeout {
            return Err(ConformError::timeout(operation, timeout.as_secs_f64()));
        }

        sleep(poll_interval).await;
    }
}

/// Sleep for `duration`, waking early if the run is cancelled
pub async fn pause(duration: Duration, cancel: &AtomicBool) -> WaitOutcome {
    let start = Instant::now();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return WaitOutcome::Cancelled;
        }
        let elapsed = start.elapsed();
        if elapsed >= duration {
            return WaitOutcome::Completed(elapsed);
        }
        sleep((duration - elapsed).min(CANCEL_CHECK_INTERVAL)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, ErrorKind};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const POLL: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_completes_when_predicate_clears() {
        let cancel = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);

        let outcome = wait_while(
            "Slewing",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n < 3) }
            },
            POLL,
            Duration::from_secs(2),
            &cancel,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, WaitOutcome::Completed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_times_out_when_predicate_stays_true() {
        let cancel = AtomicBool::new(false);
        let result = wait_while("Slewing", || async { Ok(true) }, POLL, Duration::from_millis(50), &cancel).await;

        match result {
            Err(ConformError::Timeout { operation, .. }) => assert_eq!(operation, "Slewing"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_errors_propagate_immediately() {
        let cancel = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);

        let result = wait_while(
            "AtHome",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeviceError::new(ErrorKind::Other, "link down")) }
            },
            POLL,
            Duration::from_secs(2),
            &cancel,
        )
        .await;

        assert_eq!(result.unwrap_err().device_kind(), Some(ErrorKind::Other));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_returns_without_timeout() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let outcome = wait_while("Slewing", || async { Ok(true) }, POLL, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_minimum_duration_is_honoured() {
        let cancel = AtomicBool::new(false);
        let minimum = Duration::from_millis(60);

        let outcome = wait_while_min(
            "SlewToCoordinatesAsync",
            || async { Ok(false) },
            minimum,
            POLL,
            Duration::from_secs(2),
            &cancel,
        )
        .await
        .unwrap();

        match outcome {
            WaitOutcome::Completed(elapsed) => assert!(elapsed >= minimum),
            WaitOutcome::Cancelled => panic!("not cancelled"),
        }
    }

    #[tokio::test]
    async fn test_minimum_longer_than_timeout_does_not_time_out_idle_device() {
        let cancel = AtomicBool::new(false);
        let outcome = wait_while_min(
            "Park",
            || async { Ok(false) },
            Duration::from_millis(40),
            POLL,
            Duration::from_millis(10),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, Ok(WaitOutcome::Completed(_))));
    }

    #[tokio::test]
    async fn test_pause_wakes_on_cancel() {
        let cancel = AtomicBool::new(true);
        assert_eq!(pause(Duration::from_secs(10), &cancel).await, WaitOutcome::Cancelled);

        let cancel = AtomicBool::new(false);
        let outcome = pause(Duration::from_millis(20), &cancel).await;
        assert!(matches!(outcome, WaitOutcome::Completed(d) if d >= Duration::from_millis(20)));
    }
}
