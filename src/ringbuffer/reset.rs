//! Cancellation signal for in-progress device transfers.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Signal telling a device that the current transfer must end.
///
/// A ring buffer sets its token on pause and stop, just before calling
/// [`RingBufferDevice::reset`](crate::RingBufferDevice::reset), and clears it
/// again on start. Devices that wait inside `process` should wait on the token
/// (or poll [`is_reset`](ResetToken::is_reset)) so they return promptly.
///
/// # Example
///
/// ```
/// use stream_media::ResetToken;
/// use std::time::Duration;
///
/// let token = ResetToken::new();
/// assert!(!token.wait_timeout(Duration::from_millis(1)));
///
/// token.reset();
/// assert!(token.is_reset());
/// assert!(token.wait_timeout(Duration::from_secs(60))); // returns at once
/// ```
#[derive(Debug, Default)]
pub struct ResetToken {
    state: Mutex<TokenState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct TokenState {
    set: bool,
    /// Bumped on every reset so a waiter notices one even if the token is
    /// cleared again before it wakes.
    resets: u64,
}

impl TokenState {
    fn reset_since(&self, resets: u64) -> bool {
        self.set || self.resets != resets
    }
}

impl ResetToken {
    /// Creates a token that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the token has been set since it was last cleared.
    pub fn is_reset(&self) -> bool {
        self.state.lock().set
    }

    /// Sets the token and wakes every waiter.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.set = true;
        state.resets = state.resets.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Clears the token.
    pub fn clear(&self) {
        self.state.lock().set = false;
    }

    /// Waits until the token is reset or `timeout` elapses.
    ///
    /// Returns `true` if the token was set during the wait (or already set).
    /// Devices use this to pace transfers without missing a reset. A timeout
    /// too large to represent as a deadline waits for the reset alone.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let resets = state.resets;
        while !state.reset_since(resets) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        state.reset_since(resets)
    }

    /// Blocks until the token is reset.
    ///
    /// Returns once a reset happens even if the token was cleared again
    /// before this waiter woke up.
    pub fn wait_until_reset(&self) {
        let mut state = self.state.lock();
        let resets = state.resets;
        while !state.reset_since(resets) {
            self.changed.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_token_not_reset() {
        let token = ResetToken::new();
        assert!(!token.is_reset());
    }

    #[test]
    fn test_reset_and_clear() {
        let token = ResetToken::new();
        token.reset();
        assert!(token.is_reset());
        token.clear();
        assert!(!token.is_reset());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let token = ResetToken::new();
        let started = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_max_when_already_reset() {
        let token = ResetToken::new();
        token.reset();
        assert!(token.wait_timeout(Duration::MAX));
    }

    #[test]
    fn test_wait_timeout_max_until_reset() {
        let token = Arc::new(ResetToken::new());
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait_timeout(Duration::MAX))
        };

        thread::sleep(Duration::from_millis(20));
        token.reset();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_waiter_sees_reset_cleared_before_wakeup() {
        let token = Arc::new(ResetToken::new());
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait_until_reset())
        };

        thread::sleep(Duration::from_millis(20));
        token.reset();
        token.clear();
        waiter.join().unwrap();
        assert!(!token.is_reset());
    }

    #[test]
    fn test_reset_wakes_waiter() {
        let token = Arc::new(ResetToken::new());
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait_until_reset())
        };

        thread::sleep(Duration::from_millis(20));
        token.reset();
        waiter.join().unwrap();
    }

    #[test]
    fn test_reset_interrupts_timed_wait() {
        let token = Arc::new(ResetToken::new());
        let waiter = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let reset = token.wait_timeout(Duration::from_secs(30));
                (reset, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.reset();
        let (reset, waited) = waiter.join().unwrap();
        assert!(reset);
        assert!(waited < Duration::from_secs(5));
    }
}
