//! One-shot latch deciding whether a block is readable.
//!
//! A block enters the list either `Ready` (nothing to do) or `Pending` with
//! an action: copy the payload (write path) or hash and verify it (recovery
//! path). The first caller of `wait_until_readable` runs the action outside
//! the latch lock; concurrent callers wait on a condvar; the outcome is
//! sticky and every current and future waiter observes it.

use parking_lot::{Condvar, Mutex};
use scratch_types::Hash128;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Failure detected while materializing a block. Sticky: later readers of
/// the same block see a clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockFault {
    #[error("payload at offset {offset:#x} hashes to {actual}, header says {expected}")]
    InvalidHash {
        offset: u64,
        expected: Hash128,
        actual: Hash128,
    },
}

pub type FlagAction = Box<dyn FnOnce() -> Result<(), BlockFault> + Send>;

const UNRESOLVED: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

enum State {
    Ready,
    Pending(FlagAction),
    Running,
    Failed(BlockFault),
}

pub struct ReadFlag {
    /// Fast path mirror of the terminal state; `UNRESOLVED` means "consult
    /// the latch".
    fast: AtomicU8,
    state: Mutex<State>,
    resolved: Condvar,
}

impl ReadFlag {
    /// Flag for a block that needs no work before reads.
    #[must_use]
    pub fn new_ready() -> Self {
        Self {
            fast: AtomicU8::new(READY),
            state: Mutex::new(State::Ready),
            resolved: Condvar::new(),
        }
    }

    /// Flag whose action runs at most once, driven by the first waiter.
    #[must_use]
    pub fn new_pending(action: FlagAction) -> Self {
        Self {
            fast: AtomicU8::new(UNRESOLVED),
            state: Mutex::new(State::Pending(action)),
            resolved: Condvar::new(),
        }
    }

    /// Block until the flag resolves, running the pending action if this
    /// caller gets there first. A fault is returned to every waiter, now
    /// and later.
    pub fn wait_until_readable(&self) -> Result<(), BlockFault> {
        if self.fast.load(Ordering::Acquire) == READY {
            return Ok(());
        }

        let mut guard = self.state.lock();
        loop {
            match std::mem::replace(&mut *guard, State::Running) {
                State::Ready => {
                    *guard = State::Ready;
                    return Ok(());
                }
                State::Failed(fault) => {
                    let result = fault.clone();
                    *guard = State::Failed(fault);
                    return Err(result);
                }
                State::Running => {
                    self.resolved.wait(&mut guard);
                }
                State::Pending(action) => {
                    drop(guard);
                    let outcome = action();
                    guard = self.state.lock();
                    match &outcome {
                        Ok(()) => {
                            *guard = State::Ready;
                            self.fast.store(READY, Ordering::Release);
                        }
                        Err(fault) => {
                            *guard = State::Failed(fault.clone());
                            self.fast.store(FAILED, Ordering::Release);
                        }
                    }
                    drop(guard);
                    self.resolved.notify_all();
                    return outcome;
                }
            }
        }
    }

    /// Cheap probe: has this flag already resolved successfully?
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.fast.load(Ordering::Acquire) == READY
    }
}

impl std::fmt::Debug for ReadFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.fast.load(Ordering::Acquire) {
            READY => "ready",
            FAILED => "failed",
            _ => "unresolved",
        };
        f.debug_struct("ReadFlag").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn ready_flag_passes_through() {
        let flag = ReadFlag::new_ready();
        assert!(flag.is_ready());
        assert_eq!(flag.wait_until_readable(), Ok(()));
    }

    #[test]
    fn pending_action_runs_exactly_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let flag = ReadFlag::new_pending(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(!flag.is_ready());
        assert_eq!(flag.wait_until_readable(), Ok(()));
        assert_eq!(flag.wait_until_readable(), Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flag.is_ready());
    }

    #[test]
    fn fault_is_sticky_for_every_waiter() {
        let fault = BlockFault::InvalidHash {
            offset: 0x1000,
            expected: Hash128::new(1, 2),
            actual: Hash128::new(3, 4),
        };
        let returned = fault.clone();
        let flag = ReadFlag::new_pending(Box::new(move || Err(returned)));

        assert_eq!(flag.wait_until_readable(), Err(fault.clone()));
        assert_eq!(flag.wait_until_readable(), Err(fault));
        assert!(!flag.is_ready());
    }

    #[test]
    fn concurrent_waiters_all_observe_the_outcome() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let flag = Arc::new(ReadFlag::new_pending(Box::new(move || {
            // Give waiters time to pile up on the latch.
            std::thread::sleep(std::time::Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = Arc::clone(&flag);
                std::thread::spawn(move || flag.wait_until_readable())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
