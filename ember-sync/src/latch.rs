//! A single-use countdown latch with a bounded wait.
//!
//! Each worker loop iteration arms a fresh latch sized to the requests it
//! dispatched, and completion callbacks count it down. The loop then waits
//! for the latch or a timeout, whichever comes first, so one hung peer can
//! never stall an iteration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

pub(crate) struct Latch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl Latch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Count down one completion. Release is permanent: counting a
    /// released latch down again is a no-op.
    pub(crate) fn count_down(&self) {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.notify.notify_waiters();
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Wait until the latch is released, or until `limit` elapses.
    ///
    /// Returns true if the latch was released within the limit.
    pub(crate) async fn wait(&self, limit: Duration) -> bool {
        timeout(limit, self.released()).await.is_ok()
    }

    async fn released(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            // Register before checking, so a release between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }
}
