//! Cancellation and deadlines for network-bound operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Returned when an operation observed its cancellation signal.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled or deadline exceeded")]
pub struct Cancelled;

/// A cloneable cancellation signal with an optional deadline.
///
/// Every clone observes the same flag, so the request handler that owns the
/// original can abort work running on its behalf.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A signal that only fires when `cancel()` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Time left before the deadline, if one was set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let end = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep((end - now).min(Duration::from_millis(50)));
        }
    }
}
