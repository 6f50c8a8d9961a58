//! Centralized configuration for the Caesar service.
//!
//! Well-known names and wire limits are fixed constants shared by the service
//! and every client. Timeouts are defaults for [`ServiceConfig`] and
//! [`SessionConfig`], which the binaries let the operator override.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire and naming constants. Must match across client and service processes.
pub struct IpcConfig;

impl IpcConfig {
    pub const PAYLOAD_NAME: &'static str = "/shm_caesar";
    pub const REGISTRATION_QUEUE_NAME: &'static str = "/mq_registration";
    pub const MUTEX_NAME: &'static str = "/sem_mutex";

    /// Prefix of the channel that carries `ack`/`fin` to a client.
    pub const RECEIVE_PREFIX: &'static str = "/mq_received_by_";
    /// Prefix of the channel that carries `caesar` from a client.
    pub const SEND_PREFIX: &'static str = "/mq_sent_from_";

    /// Maximum message length in bytes, excluding the terminator.
    pub const MESSAGE_CAPACITY: usize = 256;

    pub const QUEUE_MAX_MESSAGES: usize = 10;
    pub const QUEUE_MESSAGE_SIZE: usize = 2048;

    /// Platform limit on a queue name, including the leading slash.
    pub const MAX_NAME_LEN: usize = 255;
    /// Longest base name that still fits behind either channel prefix.
    pub const MAX_BASE_NAME_LEN: usize = 239;

    pub const MAX_PRIORITY: u32 = 10;

    /// Length of one wait slice; cancellation is observed between slices.
    pub const WAIT_SLICE: Duration = Duration::from_millis(100);
    /// Poll interval while waiting for a client to tear down its channels.
    pub const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(5);
}

/// Names of the three objects owned by a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    pub payload: String,
    pub registration: String,
    pub mutex: String,
}

impl ResourceNames {
    /// The fixed names used by every default service and client.
    pub fn well_known() -> Self {
        Self {
            payload: IpcConfig::PAYLOAD_NAME.to_string(),
            registration: IpcConfig::REGISTRATION_QUEUE_NAME.to_string(),
            mutex: IpcConfig::MUTEX_NAME.to_string(),
        }
    }

    /// Well-known names with `_<namespace>` appended, so several services can
    /// share one machine. An empty namespace yields the well-known names.
    pub fn namespaced(namespace: &str) -> Self {
        if namespace.is_empty() {
            return Self::well_known();
        }
        Self {
            payload: format!("{}_{}", IpcConfig::PAYLOAD_NAME, namespace),
            registration: format!("{}_{}", IpcConfig::REGISTRATION_QUEUE_NAME, namespace),
            mutex: format!("{}_{}", IpcConfig::MUTEX_NAME, namespace),
        }
    }
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::well_known()
    }
}

/// Runtime knobs for the service loop.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bound on every wait that depends on a single client's progress.
    pub client_timeout: Duration,
    /// Unlink leftovers from a crashed service before creating resources.
    pub reclaim_stale: bool,
}

impl ServiceConfig {
    pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_reclaim_stale(mut self, reclaim: bool) -> Self {
        self.reclaim_stale = reclaim;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client_timeout: Self::DEFAULT_CLIENT_TIMEOUT,
            reclaim_stale: false,
        }
    }
}

/// Runtime knobs for one client transaction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the `ack` and `fin` waits. `None` waits forever.
    pub reply_timeout: Option<Duration>,
    /// Bound on acquiring the payload mutex.
    pub lock_timeout: Duration,
    /// Unlink stale channels with the same base name before creating ours.
    pub reclaim_stale: bool,
}

impl SessionConfig {
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_reclaim_stale(mut self, reclaim: bool) -> Self {
        self.reclaim_stale = reclaim;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Some(Self::DEFAULT_REPLY_TIMEOUT),
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            reclaim_stale: false,
        }
    }
}
