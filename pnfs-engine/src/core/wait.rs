use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::CoreError;

/// Slice used to re-check cancellation while blocked.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Cancellation handle for blocking waits. Cancelling only makes the waiter
/// return, the state it was waiting on is left untouched so the operation
/// can be restarted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A wait queue: waiters sleep until a predicate holds, wakers bump the
/// generation so no wakeup between the check and the sleep is lost.
/// Wakers must not hold a lock the predicate takes.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until `cond` returns true, the token is cancelled or the
    /// timeout expires.
    pub fn wait_until<F>(
        &self,
        mut cond: F,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError>
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let seen = *self.generation.lock();

            if cond() {
                return Ok(());
            }

            if cancel.map_or(false, |c| c.is_cancelled()) {
                return Err(CoreError::Interrupted {});
            }

            let mut slice = CANCEL_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(CoreError::TimedOut {
                        timeout_ms: timeout
                            .map(|t| t.as_millis() as u64)
                            .unwrap_or_default(),
                    });
                }
                slice = slice.min(deadline - now);
            }

            let mut generation = self.generation.lock();
            if *generation == seen {
                self.cond.wait_for(&mut generation, slice);
            }
        }
    }
}
