//! Platform-specific process plumbing.
//!
//! All `#[cfg]` blocks for OS-specific process behavior live here.
//! - `daemon` - detaching the service from its terminal (Unix)

#[cfg(unix)]
pub mod daemon;

#[cfg(unix)]
pub use daemon::daemonize;
