//! Stdout isolation for context processes.
//!
//! A context process talks to its parent over the hub socket, never over stdout.
//! Anything the hosted code prints (including subprocesses it spawns, which
//! inherit fd 1) is pointed at stderr instead so the parent sees it as
//! diagnostics and nothing else.
//!
//! ## Safety contracts
//!
//! 1. Called at child startup before any task code runs (tokio runtime threads
//!    exist but aren't writing to fd 1)
//! 2. Standard fds (1, 2) are guaranteed open by the OS at process startup
//!
//! Cannot use Miri: this makes real dup2 syscalls.

use std::io::{self, Write};
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

use nix::unistd::dup2;

/// Point fd 1 at whatever fd 2 refers to.
pub fn redirect_stdout_to_stderr() -> io::Result<()> {
    // Pending buffered output belongs on the original stdout.
    let _ = io::stdout().flush();

    // Safety: fd 2 is open for the life of the process.
    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    // Safety: fd 1 is open; the OwnedFd is forgotten below so it is never closed.
    let mut stdout = unsafe { OwnedFd::from_raw_fd(1) };
    let result = dup2(stderr, &mut stdout);
    std::mem::forget(stdout);

    result.map_err(|e| io::Error::other(format!("dup2(stderr, stdout) failed: {e}")))?;
    tracing::trace!("Redirected stdout to stderr");
    Ok(())
}
