use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One-shot stop signal shared between threads.
///
/// Once cancelled it stays cancelled; waiters are woken immediately.
#[derive(Debug)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Cancels the signal. Returns `true` only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        let first = !self.shared.closing.swap(true, Ordering::SeqCst);

        // Lock briefly to synchronize with waiting threads
        let _guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.condvar.notify_all();
        first
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Blocks until cancelled or until `timeout` elapses.
    /// Returns `true` when the signal was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .shared
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

// Implementing the Clone trait
impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_one_shot() {
        let sos = SignalOfStop::new();
        assert!(!sos.cancelled());
        assert!(sos.cancel());
        assert!(!sos.cancel());
        assert!(sos.cancelled());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sos = SignalOfStop::new();
        let started = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_cancel() {
        let sos = SignalOfStop::new();
        let other = sos.clone();
        let handle = thread::spawn(move || other.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        sos.cancel();
        assert!(handle.join().unwrap());
    }
}
