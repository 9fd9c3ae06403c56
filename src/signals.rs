//! Supervisor signal plumbing.
//!
//! Handlers do nothing but set an atomic and write one byte to a
//! non-blocking self-pipe. The supervisor polls the pipe's read end, so a
//! SIGCHLD delivered while it sits in accept or poll wakes it promptly for
//! reaping; handlers are installed without SA_RESTART so blocking calls
//! still return EINTR.

use crate::error::{JailError, Result};
use log::debug;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(sig: libc::c_int) {
    // async-signal-safe: atomics and a single write, nothing else
    if sig == libc::SIGTERM || sig == libc::SIGINT {
        TERM_REQUESTED.store(true, Ordering::SeqCst);
    }
    let fd = WAKE_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [sig as u8];
        unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    }
}

/// True once SIGTERM or SIGINT has been delivered.
pub fn termination_requested() -> bool {
    TERM_REQUESTED.load(Ordering::SeqCst)
}

/// The read side of the self-pipe, plus handler installation.
pub struct SignalWake {
    read_fd: RawFd,
}

impl SignalWake {
    /// Create the self-pipe and install handlers for SIGCHLD, SIGTERM and
    /// SIGINT. Must run before the first child is cloned.
    pub fn install() -> Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
            return Err(JailError::Process(format!(
                "pipe2(self-pipe): {}",
                io::Error::last_os_error()
            )));
        }
        WAKE_WRITE_FD.store(fds[1], Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT] {
            unsafe {
                sigaction(sig, &action).map_err(|e| {
                    JailError::Process(format!("sigaction({}): {}", sig, e))
                })?;
            }
        }
        debug!("signal handlers installed (SIGCHLD, SIGTERM, SIGINT)");

        Ok(SignalWake { read_fd: fds[0] })
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Consume every pending wakeup byte.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}
