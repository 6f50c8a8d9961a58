//! Named, OS-persistent resources addressed by string name.
//!
//! The service and its clients never touch ambient global state directly:
//! everything goes through a [`NamedResourceRegistry`], which the service owns
//! and passes down. Two implementations exist:
//! - [`PosixRegistry`] - POSIX message queues, shared memory and named
//!   semaphores (Linux)
//! - [`InMemoryRegistry`] - a process-local fake with the same contract, used
//!   by tests
//!
//! Every call is fail-fast: an OS failure comes back as
//! [`CaesarError::Resource`](crate::CaesarError::Resource) naming the call
//! that failed. Nothing retries.

pub mod memory;
#[cfg(target_os = "linux")]
pub mod posix;

pub use memory::InMemoryRegistry;
#[cfg(target_os = "linux")]
pub use posix::PosixRegistry;

use crate::config::IpcConfig;
use crate::error::{CaesarError, Result};
use crate::payload::RawPayload;
use std::time::Duration;

/// The three kinds of named object the protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Queue,
    SharedRegion,
    Mutex,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Queue => "message queue",
            ResourceKind::SharedRegion => "shared memory region",
            ResourceKind::Mutex => "semaphore",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capacity hints for a new queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacity {
    pub max_messages: usize,
    pub message_size: usize,
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self {
            max_messages: IpcConfig::QUEUE_MAX_MESSAGES,
            message_size: IpcConfig::QUEUE_MESSAGE_SIZE,
        }
    }
}

/// One message taken off a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub bytes: Vec<u8>,
    pub priority: u32,
}

impl QueueMessage {
    /// Message text with trailing NUL terminators removed.
    ///
    /// C peers send some literals with their terminator (`"ack\0"`).
    pub fn text(&self) -> String {
        let end = self
            .bytes
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.bytes[..end]).into_owned()
    }
}

/// A priority-ordered, bounded message channel.
///
/// Higher priorities are received first; equal priorities are FIFO.
pub trait MessageQueue: Send {
    /// Send, waiting at most `wait` for space. Returns `false` on timeout.
    fn send(&self, bytes: &[u8], priority: u32, wait: Duration) -> Result<bool>;

    /// Receive, waiting at most `wait`. Returns `None` on timeout.
    fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>>;
}

/// A mapped region holding exactly one [`RawPayload`].
///
/// Implementations do no locking of their own; callers go through
/// [`SharedPayload`](crate::payload::SharedPayload).
pub trait SharedRegion: Send {
    fn load(&self) -> RawPayload;
    fn store(&self, payload: &RawPayload);
}

/// A binary semaphore shared between processes.
pub trait NamedMutex: Send {
    /// Acquire, waiting at most `wait`. Returns `false` on timeout.
    fn acquire(&self, wait: Duration) -> Result<bool>;
    fn release(&self) -> Result<()>;
}

/// Creation, lookup and teardown of named objects.
///
/// `create_*` is exclusive: a name that already exists is an error.
/// `open_*` of a name that does not exist is a not-found error.
pub trait NamedResourceRegistry: Send + Sync {
    type Queue: MessageQueue;
    type Region: SharedRegion;
    type Mutex: NamedMutex;

    fn create_queue(&self, name: &str, capacity: QueueCapacity) -> Result<Self::Queue>;
    fn open_queue(&self, name: &str) -> Result<Self::Queue>;

    /// Create a region sized for one [`RawPayload`], zero-filled.
    fn create_region(&self, name: &str) -> Result<Self::Region>;
    fn open_region(&self, name: &str) -> Result<Self::Region>;

    /// Create a semaphore whose initial state is AVAILABLE.
    fn create_mutex(&self, name: &str) -> Result<Self::Mutex>;
    fn open_mutex(&self, name: &str) -> Result<Self::Mutex>;

    fn destroy(&self, name: &str, kind: ResourceKind) -> Result<()>;

    /// Whether `name` currently exists.
    fn exists(&self, name: &str, kind: ResourceKind) -> Result<bool> {
        let opened = match kind {
            ResourceKind::Queue => self.open_queue(name).map(drop),
            ResourceKind::SharedRegion => self.open_region(name).map(drop),
            ResourceKind::Mutex => self.open_mutex(name).map(drop),
        };
        match opened {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Destroy `name`, treating "already gone" as success.
    fn destroy_if_exists(&self, name: &str, kind: ResourceKind) -> Result<bool> {
        match self.destroy(name, kind) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Check a full object name against the POSIX naming rules.
///
/// `operation` is the call the name was destined for, so a bad name fails the
/// same way the OS would.
pub fn validate_name(operation: &'static str, kind: ResourceKind, name: &str) -> Result<()> {
    let problem = if !name.starts_with('/') {
        Some("name must start with '/'")
    } else if name.len() < 2 {
        Some("name must not be empty")
    } else if name.len() > IpcConfig::MAX_NAME_LEN {
        Some("name is too long")
    } else if name[1..].contains('/') {
        Some("name must not contain '/' after the first character")
    } else if name.contains('\0') {
        Some("name must not contain NUL")
    } else {
        None
    };

    match problem {
        Some(reason) => Err(CaesarError::resource(
            operation,
            kind,
            name,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, reason),
        )),
        None => Ok(()),
    }
}
