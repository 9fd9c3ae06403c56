//! Containment steps 2 and 6: descriptor plumbing in the child.

use crate::config::JailConfig;
use crate::contain::StdioFds;
use crate::error::{JailError, Result};
use log::{debug, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::dup2;
use std::io;
use std::os::unix::io::RawFd;

/// Wire up the child's stdio. Listen-mode children get the connection
/// socket on 0/1/2; standalone children keep the inherited descriptors
/// unless `silent` swaps them for /dev/null.
pub fn setup_stdio(cfg: &JailConfig, fds: StdioFds) -> Result<()> {
    let mut trio = fds;

    if !cfg.mode.is_listen() {
        if !cfg.is_silent {
            return Ok(());
        }
        let null = open("/dev/null", OFlag::O_RDWR, Mode::empty())
            .map_err(|e| JailError::Process(format!("open('/dev/null', O_RDWR): {}", e)))?;
        trio = StdioFds {
            fd_in: null,
            fd_out: null,
            fd_err: null,
        };
    }

    dup2_checked(trio.fd_in, libc::STDIN_FILENO)?;
    dup2_checked(trio.fd_out, libc::STDOUT_FILENO)?;
    dup2_checked(trio.fd_err, libc::STDERR_FILENO)?;
    Ok(())
}

fn dup2_checked(from: RawFd, to: RawFd) -> Result<()> {
    dup2(from, to)
        .map(|_| ())
        .map_err(|e| JailError::Process(format!("dup2({}, {}): {}", from, to, e)))
}

/// Flag every descriptor above stderr close-on-exec so nothing leaks into
/// the payload. The log pipe already carries the flag from pipe2 and stays
/// open until exec.
pub fn make_cloexec_above_stderr() -> Result<()> {
    let entries = std::fs::read_dir("/proc/self/fd")
        .map_err(|e| JailError::Process(format!("opendir('/proc/self/fd'): {}", e)))?;

    // collect first; the directory's own descriptor closes mid-iteration
    let fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok()?.parse().ok())
        .collect();

    for fd in fds {
        if fd <= libc::STDERR_FILENO {
            continue;
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
        if flags == -1 {
            // raced with a close (the read_dir descriptor itself)
            continue;
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
            warn!(
                "fcntl({}, F_SETFD, FD_CLOEXEC): {}",
                fd,
                io::Error::last_os_error()
            );
            continue;
        }
        debug!("set fd {} close-on-exec", fd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloexec_sweep_flags_high_descriptors() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), 0) }, 0);
        assert_eq!(
            unsafe { libc::fcntl(fds[0], libc::F_GETFD, 0) } & libc::FD_CLOEXEC,
            0
        );

        make_cloexec_above_stderr().unwrap();

        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0, "fd {} not flagged", fd);
            unsafe { libc::close(fd) };
        }
    }
}
