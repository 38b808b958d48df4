// src/retry.rs

//! Retry and read-after-write verification policies
//!
//! The directory service does not guarantee read-your-writes, so every
//! mutation the engine cares about is followed by polling reads until the
//! effect is visible. Attempt counts and delays live in [`RetryPolicy`]
//! values that callers can tune per operation (or zero out in tests).

use crate::error::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Default attempts for every retried directory operation
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default fixed delay between attempts
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Fixed-delay, bounded-attempt retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Policy without delays, for tests and in-memory directories
    pub fn immediate(attempts: u32) -> Self {
        Self::fixed(attempts, Duration::ZERO)
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }

    /// Run `op` until it succeeds or the attempts are exhausted
    ///
    /// Non-transient errors (missing objects, auth failures) are returned
    /// immediately without retrying.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= self.attempts {
                        return Err(Error::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    warn!("{} attempt {} failed: {}, retrying...", operation, attempt, e);
                    self.pause();
                }
            }
        }
    }

    /// Poll `check` until it reports true
    ///
    /// Read errors count as "not yet visible". Returns false when every
    /// attempt came back negative.
    pub fn poll<F>(&self, what: &str, mut check: F) -> bool
    where
        F: FnMut() -> Result<bool>,
    {
        for attempt in 1..=self.attempts {
            match check() {
                Ok(true) => return true,
                Ok(false) => debug!("{} not visible yet (poll {})", what, attempt),
                Err(e) => debug!("{} poll {} failed: {}", what, attempt, e),
            }
            if attempt < self.attempts {
                self.pause();
            }
        }
        false
    }
}

/// Write-then-verify policy for mutations against an eventually
/// consistent store
///
/// Each write attempt is followed by a verification poll; the write is only
/// repeated when verification gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedWrite {
    pub write: RetryPolicy,
    pub verify: RetryPolicy,
}

impl Default for VerifiedWrite {
    fn default() -> Self {
        Self {
            write: RetryPolicy::default(),
            verify: RetryPolicy::default(),
        }
    }
}

impl VerifiedWrite {
    pub fn immediate(attempts: u32) -> Self {
        Self {
            write: RetryPolicy::immediate(attempts),
            verify: RetryPolicy::immediate(attempts),
        }
    }

    /// Issue `write` and confirm it with `verify`
    ///
    /// Returns `Ok(true)` once verified, `Ok(false)` when every attempt was
    /// written but never became visible, and `Err` for a non-transient write
    /// failure.
    pub fn execute<W, V>(&self, operation: &str, mut write: W, mut verify: V) -> Result<bool>
    where
        W: FnMut() -> Result<()>,
        V: FnMut() -> Result<bool>,
    {
        for attempt in 1..=self.write.attempts {
            match write() {
                Ok(()) => {
                    if self.verify.poll(operation, &mut verify) {
                        return Ok(true);
                    }
                    warn!("{} attempt {} was not confirmed", operation, attempt);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => warn!("{} attempt {} failed: {}", operation, attempt, e),
            }
            if attempt < self.write.attempts {
                self.write.pause();
            }
        }
        Ok(false)
    }
}

/// Per-operation policies used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicies {
    /// Reads: family queries, assignment and dependency listings
    pub query: RetryPolicy,
    /// Assignment adds and dependency list replacements
    pub write: VerifiedWrite,
    /// Assignment removal from the source object
    pub remove: RetryPolicy,
    /// Renames and deletes
    pub mutate: RetryPolicy,
}

impl RetryPolicies {
    pub fn immediate(attempts: u32) -> Self {
        Self {
            query: RetryPolicy::immediate(attempts),
            write: VerifiedWrite::immediate(attempts),
            remove: RetryPolicy::immediate(attempts),
            mutate: RetryPolicy::immediate(attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_run_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(3).run("query", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::DirectoryError("503".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_run_exhausts() {
        let calls = Cell::new(0);
        let result: Result<()> = RetryPolicy::immediate(3).run("query", || {
            calls.set(calls.get() + 1);
            Err(Error::DirectoryError("503".to_string()))
        });
        match result {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_run_does_not_retry_missing_objects() {
        let calls = Cell::new(0);
        let result: Result<()> = RetryPolicy::immediate(3).run("delete", || {
            calls.set(calls.get() + 1);
            Err(Error::NotFound("app-1".to_string()))
        });
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).attempts, 1);
    }

    #[test]
    fn test_poll_treats_errors_as_not_visible() {
        let calls = Cell::new(0);
        let seen = RetryPolicy::immediate(3).poll("assignment", || {
            calls.set(calls.get() + 1);
            match calls.get() {
                1 => Err(Error::DirectoryError("timeout".to_string())),
                2 => Ok(false),
                _ => Ok(true),
            }
        });
        assert!(seen);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_verified_write_repeats_unconfirmed_writes() {
        let writes = Cell::new(0);
        let verified = VerifiedWrite::immediate(3)
            .execute("add", || {
                writes.set(writes.get() + 1);
                Ok(())
            }, || Ok(writes.get() >= 2))
            .unwrap();
        assert!(verified);
        assert_eq!(writes.get(), 2);
    }

    #[test]
    fn test_verified_write_gives_up() {
        let writes = Cell::new(0);
        let verified = VerifiedWrite::immediate(3)
            .execute("add", || {
                writes.set(writes.get() + 1);
                Ok(())
            }, || Ok(false))
            .unwrap();
        assert!(!verified);
        assert_eq!(writes.get(), 3);
    }
}
