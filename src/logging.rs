//! Log sink shared by the supervisor and its jailed children.
//!
//! The `log` facade writes through `env_logger`, whose output target is a
//! process-global descriptor instead of a captured stream. That indirection
//! is what the jail needs: the cloned child points the sink at the log-pipe
//! write end before its containment steps run, and the supervisor forwards
//! the drained pipe chunks verbatim with [`write_raw`].

use crate::error::{JailError, Result};
use log::LevelFilter;
use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

static SINK_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

struct SinkWriter;

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = SINK_FD.load(Ordering::Relaxed);
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Install the logger. With `logfile` set the sink appends to that file,
/// otherwise it writes to stderr. `verbose` selects debug level.
pub fn init(logfile: Option<&Path>, verbose: bool) -> Result<()> {
    if let Some(path) = logfile {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| JailError::Config(format!("log path contains NUL: {:?}", path)))?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND,
                0o640,
            )
        };
        if fd < 0 {
            return Err(JailError::Config(format!(
                "cannot open log file '{}': {}",
                path.display(),
                io::Error::last_os_error()
            )));
        }
        SINK_FD.store(fd, Ordering::Relaxed);
    }

    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .target(env_logger::Target::Pipe(Box::new(SinkWriter)))
        .try_init()
        .map_err(|e| JailError::Config(format!("logger init: {}", e)))
}

/// Point the sink at `fd`. Called by the jailed child with the log-pipe
/// write end so every containment log reaches the supervisor.
pub fn redirect_to_fd(fd: RawFd) {
    SINK_FD.store(fd, Ordering::Relaxed);
}

/// Forward a buffer to the sink verbatim, bypassing level tagging. Used for
/// chunks drained from a child's log pipe, which are already formatted.
pub fn write_raw(buf: &[u8]) {
    let mut writer = SinkWriter;
    let _ = writer.write_all(buf);
}
