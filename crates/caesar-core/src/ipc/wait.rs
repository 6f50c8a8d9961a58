//! Bounded, cancellable waits.
//!
//! Every suspension point in the protocol (queue receive, queue send, mutex
//! acquire, waiting for a client to leave) runs through [`WaitPolicy`]. The
//! wait is split into slices of at most [`IpcConfig::WAIT_SLICE`]; the
//! cancellation token is checked between slices and the overall timeout, if
//! any, is enforced across them.

use crate::cancel::CancellationToken;
use crate::config::IpcConfig;
use crate::error::{CaesarError, Result};
use std::time::{Duration, Instant};

/// How long a blocking step may wait and what can interrupt it.
#[derive(Debug, Clone, Default)]
pub struct WaitPolicy {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl WaitPolicy {
    pub fn new(timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Bounded wait that nothing else can cancel.
    pub fn bounded(timeout: Duration) -> Self {
        Self::new(Some(timeout), CancellationToken::new())
    }

    /// Wait with no deadline, interruptible through `cancel`.
    pub fn until_cancelled(cancel: CancellationToken) -> Self {
        Self::new(None, cancel)
    }

    /// Repeatedly call `attempt` with the time left in the current slice
    /// until it yields a value.
    ///
    /// `attempt` returns `Ok(None)` when its slice ran out without success.
    /// `stage` names what is being waited for and ends up in the timeout
    /// error. `attempt` always runs at least once, even with a zero timeout.
    pub fn wait_for<T>(
        &self,
        stage: &'static str,
        mut attempt: impl FnMut(Duration) -> Result<Option<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let mut attempted = false;
        loop {
            self.cancel.check()?;

            let slice = match self.timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit && attempted {
                        return Err(CaesarError::Timeout {
                            stage,
                            after: limit,
                        });
                    }
                    limit.saturating_sub(elapsed).min(IpcConfig::WAIT_SLICE)
                }
                None => IpcConfig::WAIT_SLICE,
            };

            attempted = true;
            if let Some(value) = attempt(slice)? {
                return Ok(value);
            }
        }
    }
}
