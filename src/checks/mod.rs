//! Background check loops.
//!
//! Two periodic checks run for the lifetime of the process:
//! - The usage check reconciles billable usage across the three sources of
//!   record and publishes every fetched amount as a gauge.
//! - The access check finds instances that refused data upload yet still
//!   appear in the warehouse event log.
//!
//! Both loops survive failed cycles. A failure zeroes the check-time gauge
//! and the next cycle starts after the configured interval.

mod access;
mod usage;

pub use access::start_access_check;
pub use usage::start_usage_check;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Cooperative shutdown flag shared between main and the check loops.
///
/// Clones observe the same flag.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the signal stopped and wake every waiter.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Sleep for `timeout` unless the signal stops first.
    ///
    /// Returns true once stopped.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register the waiter before checking the flag so a stop() landing
        // between the two is not missed until the timeout expires.
        notified.as_mut().enable();
        if self.is_stopped() {
            return true;
        }

        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }
        self.is_stopped()
    }
}
