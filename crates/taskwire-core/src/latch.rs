//! Single-use countdown latch and a shared slot for installing one.
//!
//! A [`Latch`] releases its waiters once the required number of parties have
//! called [`Latch::wait`]. It is never reset: every synchronization point
//! creates a fresh latch.
//!
//! A [`LatchSlot`] holds an optional latch that one thread installs and other
//! threads pick up later. Cloning the slot's `Arc<Latch>` out before waiting
//! keeps the slot lock free while parties block.

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct LatchState {
    arrived: usize,
    released: bool,
}

/// Countdown barrier for a fixed number of parties.
///
/// # Example
///
/// ```
/// use taskwire::latch::Latch;
/// use std::sync::Arc;
///
/// let latch = Latch::create(2);
/// let other = Arc::clone(&latch);
/// let handle = std::thread::spawn(move || other.wait());
///
/// latch.wait().unwrap();
/// handle.join().unwrap().unwrap();
/// ```
#[derive(Debug)]
pub struct Latch {
    required: usize,
    timeout: Duration,
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    /// Create a shared latch with the default timeout.
    pub fn create(required: usize) -> Arc<Self> {
        Self::create_with_timeout(required, TransportConfig::LATCH_TIMEOUT)
    }

    /// Create a shared latch whose waiters give up after `timeout`.
    pub fn create_with_timeout(required: usize, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            required,
            timeout,
            state: Mutex::new(LatchState {
                arrived: 0,
                released: required == 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Number of parties this latch waits for.
    pub fn required(&self) -> usize {
        self.required
    }

    /// Whether every party has arrived.
    pub fn is_released(&self) -> bool {
        self.lock_state().released
    }

    /// Arrive at the latch and block until all parties have arrived.
    ///
    /// Arriving at a latch that has already released returns immediately.
    pub fn wait(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock_state();

        if state.released {
            return Ok(());
        }

        state.arrived += 1;
        if state.arrived >= self.required {
            trace!("Latch released with {} parties", state.arrived);
            state.released = true;
            self.cond.notify_all();
            return Ok(());
        }

        while !state.released {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::LatchTimeout(self.timeout));
            }

            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LatchState> {
        // The state is a pair of plain values, a poisoned lock still holds valid data
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Nullable shared handle to a [`Latch`].
#[derive(Debug, Default)]
pub struct LatchSlot {
    inner: Mutex<Option<Arc<Latch>>>,
}

impl LatchSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `latch`, replacing whatever was there.
    pub fn install(&self, latch: Arc<Latch>) {
        *self.lock() = Some(latch);
    }

    /// Get the currently installed latch, if any.
    pub fn load(&self) -> Option<Arc<Latch>> {
        self.lock().clone()
    }

    /// Remove and return the installed latch.
    pub fn take(&self) -> Option<Arc<Latch>> {
        self.lock().take()
    }

    /// Take the installed latch, if there is one, and wait on it.
    ///
    /// Only the caller that empties the slot waits, so concurrent callers
    /// never add a party the latch was not sized for. Returns `Ok(false)`
    /// when the slot was empty.
    pub fn wait_if_installed(&self) -> Result<bool> {
        match self.take() {
            Some(latch) => latch.wait().map(|_| true),
            None => Ok(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<Latch>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_single_party_latch_releases_immediately() {
        let latch = Latch::create(1);
        latch.wait().unwrap();
        assert!(latch.is_released());
    }

    #[test]
    fn test_all_parties_released_together() {
        let latch = Latch::create(4);
        let passed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let passed = Arc::clone(&passed);
                thread::spawn(move || {
                    latch.wait().unwrap();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        assert!(!latch.is_released());

        latch.wait().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wait_times_out() {
        let latch = Latch::create_with_timeout(2, Duration::from_millis(20));
        let result = latch.wait();
        assert!(matches!(result, Err(TransportError::LatchTimeout(_))));
    }

    #[test]
    fn test_late_arrival_passes_through() {
        let latch = Latch::create(1);
        latch.wait().unwrap();
        latch.wait().unwrap();
    }

    #[test]
    fn test_slot_install_load_take() {
        let slot = LatchSlot::new();
        assert!(slot.load().is_none());
        assert!(!slot.wait_if_installed().unwrap());

        slot.install(Latch::create(1));
        assert_eq!(slot.load().map(|l| l.required()), Some(1));
        assert!(slot.take().is_some());
        assert!(slot.load().is_none());
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_slot_admits_one_waiter() {
        let slot = Arc::new(LatchSlot::new());
        let latch = Latch::create_with_timeout(2, Duration::from_secs(5));
        slot.install(Arc::clone(&latch));

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_if_installed())
        };
        thread::sleep(Duration::from_millis(50));

        // Later arrivals find the slot empty and do not wait
        assert!(!slot.wait_if_installed().unwrap());
        assert!(!latch.is_released());

        latch.wait().unwrap();
        assert!(waiter.join().unwrap().unwrap());
    }
}
