//! Reference count plus sealable-for-removal bit in one atomic word.

use std::sync::atomic::{AtomicU32, Ordering};

/// Added to the state by `seal`. Doubles as the pin-count ceiling: the cap
/// is deliberately small so leaked pins surface quickly.
pub const SEAL: u32 = 1 << 10;

/// Pin counter gating the teardown of a block file.
///
/// States: `count` while unsealed, `SEAL + count` once sealed. `try_pin`
/// fails once sealed, and also once `SEAL - 1` simultaneous pins exist.
#[derive(Debug, Default)]
pub struct Pinner {
    state: AtomicU32,
}

impl Pinner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a pin. Fails when sealed or at the pin cap.
    pub fn try_pin(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state >= SEAL - 1 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Seal against new pins. Returns true iff the pin count was exactly
    /// zero at the moment of sealing — the caller then owns teardown.
    /// Sealing an already sealed pinner is a no-op returning false.
    pub fn seal(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state >= SEAL {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + SEAL,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prior) => return prior == 0,
                Err(actual) => state = actual,
            }
        }
    }

    /// Release a pin. Returns true iff the pinner is sealed and this was
    /// the last pin — the caller then owns teardown.
    pub fn unpin(&self) -> bool {
        let prior = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior & (SEAL - 1) != 0, "unpin without matching pin");
        prior - 1 == SEAL
    }
}
