//! Caesar Core - a Caesar-shift service spoken over POSIX IPC.
//!
//! A long-lived service rotates short messages for short-lived clients. They
//! meet through named, OS-persistent objects rather than a socket:
//!
//! - a shared payload region holding one `(message, shift)` pair
//! - a priority-ordered registration queue
//! - two ephemeral queues per client
//! - a named semaphore guarding the payload
//!
//! All named objects are reached through a [`NamedResourceRegistry`]; the
//! POSIX one talks to the kernel, the in-memory one backs the tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use caesar_core::{
//!     rotate_via_service, PayloadRecord, PosixRegistry, Registration, ResourceNames,
//!     SessionConfig,
//! };
//!
//! fn main() -> caesar_core::Result<()> {
//!     let result = rotate_via_service(
//!         &PosixRegistry::new(),
//!         &ResourceNames::well_known(),
//!         &Registration::new("alice", 3)?,
//!         &PayloadRecord::new("Hello", 3)?,
//!         SessionConfig::default(),
//!     )?;
//!     assert_eq!(result.message, "Khoor");
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod cipher;
pub mod config;
pub mod error;
pub mod ipc;
pub mod payload;
pub mod platform;
pub mod registry;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{IpcConfig, ResourceNames, ServiceConfig, SessionConfig};
pub use error::{CaesarError, Result};
pub use ipc::{
    rotate_via_service, CaesarService, ClientSession, ControlWord, Registration, ServiceStats,
    SessionState, TransactionOutcome, WaitPolicy,
};
pub use payload::{PayloadRecord, SharedPayload};
#[cfg(target_os = "linux")]
pub use registry::PosixRegistry;
pub use registry::{InMemoryRegistry, NamedResourceRegistry, ResourceKind};
