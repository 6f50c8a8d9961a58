//! Classic double-fork daemonization.
//!
//! Must be called before any thread is spawned: after `fork` only the calling
//! thread survives in the child.

#![allow(unsafe_code)]

use crate::error::{CaesarError, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

/// Detach from the controlling terminal.
///
/// Returns only in the daemon (grandchild) process; both parents exit with
/// status 0. The daemon runs in a new session, with `umask(0)`, working
/// directory `/`, and stdin/stdout/stderr redirected to `/dev/null`.
pub fn daemonize() -> Result<()> {
    // SAFETY: called before any other thread exists, so the child has a
    // consistent copy of the whole process.
    match unsafe { fork() }.map_err(|e| daemon_error("fork", e))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(|e| daemon_error("setsid", e))?;

    // Second fork: the session leader exits so the daemon can never
    // reacquire a controlling terminal.
    // SAFETY: still single-threaded.
    match unsafe { fork() }.map_err(|e| daemon_error("fork", e))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    chdir("/").map_err(|e| daemon_error("chdir", e))?;

    let dev_null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in [
        libc::STDIN_FILENO,
        libc::STDOUT_FILENO,
        libc::STDERR_FILENO,
    ] {
        dup2(dev_null.as_raw_fd(), target).map_err(|e| daemon_error("dup2", e))?;
    }
    Ok(())
}

fn daemon_error(step: &str, errno: nix::errno::Errno) -> CaesarError {
    CaesarError::Io {
        message: format!("{} failed while daemonizing: {}", step, errno),
        source: Some(std::io::Error::from(errno)),
    }
}
