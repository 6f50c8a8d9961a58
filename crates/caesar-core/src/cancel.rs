//! Cancellation token for blocking IPC waits.
//!
//! Every suspension point in the protocol waits in short slices and checks a
//! `CancellationToken` between slices, so a signal handler (or a test) can
//! interrupt a service that is parked on its registration queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A cancellation token for cooperative cancellation of blocking waits.
///
/// This token can be cloned and shared across threads. When `cancel()` is
/// called on any clone, all clones will observe the cancellation.
///
/// # Example
///
/// ```
/// use caesar_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// // From a signal handler thread
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    ///
    /// All clones of this token will observe the cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Reset the token for reuse.
    ///
    /// The service resets its token when the operator declines the shutdown
    /// prompt and the listen loop resumes.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned by [`CancellationToken::check`] once cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation was cancelled")]
pub struct CancelledError;

impl From<CancelledError> for crate::error::CaesarError {
    fn from(_: CancelledError) -> Self {
        crate::error::CaesarError::Cancelled
    }
}
