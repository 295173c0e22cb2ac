//! Polling primitive for guest state that offers no event notifications.
//!
//! Every wait in the harness is a poll: process liveness, launcher discovery,
//! tools readiness. [`Poller`] spaces attempts with a bounded exponential
//! backoff, enforces an optional deadline and honours a [`CancelToken`] so an
//! operator can stop a run that is stuck waiting on the guest.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Shared flag used to stop a run from outside the polling loops
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Errors that end a polling loop early
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("polling cancelled")]
    Cancelled,

    #[error("gave up after {0:?}")]
    TimedOut(Duration),
}

/// Spacing and limits for a polling loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay before the second attempt
    pub interval: Duration,

    /// Upper bound for the backoff
    pub max_interval: Duration,

    /// Give up once this much time has passed (None = wait forever)
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(500),
            timeout: None,
        }
    }
}

impl PollConfig {
    /// Constant spacing, no backoff
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A single polling loop in progress
#[derive(Debug)]
pub struct Poller {
    config: PollConfig,
    next_delay: Duration,
    started: Instant,
    cancel: CancelToken,
}

impl Poller {
    pub fn new(config: PollConfig, cancel: &CancelToken) -> Self {
        Self {
            next_delay: config.interval,
            config,
            started: Instant::now(),
            cancel: cancel.clone(),
        }
    }

    /// Time since the loop started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail fast if the loop should stop, without sleeping
    pub fn check(&self) -> Result<(), PollError> {
        if self.cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        if let Some(timeout) = self.config.timeout {
            let elapsed = self.elapsed();
            if elapsed >= timeout {
                return Err(PollError::TimedOut(elapsed));
            }
        }
        Ok(())
    }

    /// Sleep until the next attempt is due
    pub fn wait(&mut self) -> Result<(), PollError> {
        self.check()?;

        let mut delay = self.next_delay;
        if let Some(timeout) = self.config.timeout {
            delay = delay.min(timeout.saturating_sub(self.elapsed()));
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        self.next_delay = (self.next_delay * 2).min(self.config.max_interval);
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_poller_backoff_is_capped() {
        let config = PollConfig {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            timeout: None,
        };
        let mut poller = Poller::new(config, &CancelToken::new());
        for _ in 0..5 {
            poller.wait().unwrap();
        }
        assert_eq!(poller.next_delay, Duration::from_millis(4));
    }

    #[test]
    fn test_poller_times_out() {
        let config = PollConfig::fixed(Duration::from_millis(2)).timeout(Duration::from_millis(10));
        let mut poller = Poller::new(config, &CancelToken::new());
        let err = loop {
            if let Err(err) = poller.wait() {
                break err;
            }
        };
        assert!(matches!(err, PollError::TimedOut(_)));
        assert!(poller.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_poller_cancelled() {
        let token = CancelToken::new();
        let mut poller = Poller::new(PollConfig::fixed(Duration::from_millis(1)), &token);
        token.cancel();
        assert_eq!(poller.wait(), Err(PollError::Cancelled));
    }
}
